//! Incremental scanner for tool-invocation markup embedded in model text
//!
//! Models sometimes write tool calls inline:
//!
//! ```text
//! <function_calls>
//! <invoke name="get_cost">
//! <parameter name="region">us-east-1</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! Text arrives in arbitrary fragments, so markers can be split anywhere.
//! The scanner keeps a rolling buffer and walks it with an explicit state
//! machine. A partial marker at the end of the buffer is held back until the
//! next fragment decides what it is.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

const INVOKE_OPEN: &str = "<invoke";
const INVOKE_CLOSE: &str = "</invoke>";
const PARAM_OPEN: &str = "<parameter";
const PARAM_CLOSE: &str = "</parameter>";
const WRAP_OPEN: &str = "<function_calls>";
const WRAP_CLOSE: &str = "</function_calls>";
const RESULT_OPEN: &str = "<result>";
const RESULT_CLOSE: &str = "</result>";

const TEXT_MARKERS: [&str; 4] = [INVOKE_OPEN, RESULT_OPEN, WRAP_OPEN, WRAP_CLOSE];
const BLOCK_MARKERS: [&str; 2] = [INVOKE_CLOSE, PARAM_OPEN];
const TRAILING_MARKERS: [&str; 3] = [INVOKE_CLOSE, WRAP_CLOSE, PARAM_OPEN];

static INVOKE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^<invoke\s+name="([^"]*)"\s*>$"#).expect("invoke tag regex"));
static PARAM_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^<parameter\s+name="([^"]*)"\s*>$"#).expect("parameter tag regex")
});

/// What the scanner recognized in the text stream
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Markup {
    Text(String),
    Invoke {
        name: String,
        args: Map<String, Value>,
    },
    /// Parameters written after the previous invocation's closing tag
    LateParameters(Map<String, Value>),
    /// Raw body of a `<result>` block
    Result(String),
}

#[derive(Debug)]
enum ScanState {
    ScanningText,
    /// Buffer starts with `<invoke`; waiting for the opening tag to complete
    MarkerSeen,
    ParsingBlock {
        name: String,
        args: Map<String, Value>,
    },
    ParsingParameter {
        name: String,
        args: Map<String, Value>,
        param: String,
    },
    /// Buffer starts with `<result>`
    ResultBlock,
    /// Just after `</invoke>`, collecting stray parameters
    TrailingParameters { late: Map<String, Value> },
}

/// Outcome of one state step
enum Step {
    Continue(ScanState),
    Wait(ScanState),
}

pub(crate) struct MarkupScanner {
    buf: String,
    /// Parse position inside an open block; zero in every other state
    cursor: usize,
    state: ScanState,
}

impl MarkupScanner {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            cursor: 0,
            state: ScanState::ScanningText,
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<Markup> {
        self.buf.push_str(text);
        let mut out = Vec::new();
        self.scan(&mut out);
        out
    }

    /// Close out a pending run of stray parameters. Called when a non-text
    /// frame shows the text segment has moved on.
    pub fn settle(&mut self) -> Vec<Markup> {
        let mut out = Vec::new();
        if let ScanState::TrailingParameters { late } = &mut self.state {
            let late = std::mem::take(late);
            if !late.is_empty() {
                out.push(Markup::LateParameters(late));
            }
            self.state = ScanState::ScanningText;
            self.scan(&mut out);
        }
        out
    }

    /// Drain everything. Unfinished markup is released as plain text.
    pub fn finish(&mut self) -> Vec<Markup> {
        let mut out = self.settle();
        let rest = std::mem::take(&mut self.buf);
        if !rest.is_empty() {
            out.push(Markup::Text(rest));
        }
        self.cursor = 0;
        self.state = ScanState::ScanningText;
        out
    }

    fn scan(&mut self, out: &mut Vec<Markup>) {
        loop {
            let state = std::mem::replace(&mut self.state, ScanState::ScanningText);
            let step = match state {
                ScanState::ScanningText => self.scan_text(out),
                ScanState::MarkerSeen => self.open_block(out),
                ScanState::ParsingBlock { name, args } => self.parse_block(name, args, out),
                ScanState::ParsingParameter { name, args, param } => {
                    self.parse_parameter(name, args, param)
                }
                ScanState::ResultBlock => self.parse_result(out),
                ScanState::TrailingParameters { late } => self.parse_trailing(late, out),
            };
            match step {
                Step::Continue(next) => self.state = next,
                Step::Wait(next) => {
                    self.state = next;
                    return;
                }
            }
        }
    }

    fn scan_text(&mut self, out: &mut Vec<Markup>) -> Step {
        let found = TEXT_MARKERS
            .iter()
            .filter_map(|marker| self.buf.find(marker).map(|at| (at, *marker)))
            .min_by_key(|(at, _)| *at);

        let Some((at, marker)) = found else {
            let flush_to = self.buf.len() - partial_marker_len(&self.buf, &TEXT_MARKERS);
            // Whitespace alone is held: it is dropped if a block follows
            if !self.buf[..flush_to].trim().is_empty() {
                out.push(Markup::Text(self.buf.drain(..flush_to).collect()));
            }
            return Step::Wait(ScanState::ScanningText);
        };

        let pre: String = self.buf.drain(..at).collect();
        let pre = if marker == WRAP_CLOSE {
            pre.trim_end()
        } else {
            pre.as_str()
        };
        if !pre.trim().is_empty() {
            out.push(Markup::Text(pre.to_string()));
        }

        match marker {
            INVOKE_OPEN => Step::Continue(ScanState::MarkerSeen),
            RESULT_OPEN => Step::Continue(ScanState::ResultBlock),
            _ => {
                self.buf.drain(..marker.len());
                Step::Continue(ScanState::ScanningText)
            }
        }
    }

    fn open_block(&mut self, out: &mut Vec<Markup>) -> Step {
        let Some(gt) = self.buf.find('>') else {
            return Step::Wait(ScanState::MarkerSeen);
        };

        let name = INVOKE_TAG
            .captures(&self.buf[..=gt])
            .map(|caps| caps[1].to_string());
        match name {
            Some(name) => {
                self.cursor = gt + 1;
                Step::Continue(ScanState::ParsingBlock {
                    name,
                    args: Map::new(),
                })
            }
            None => {
                let raw: String = self.buf.drain(..=gt).collect();
                tracing::debug!("Treating malformed invoke tag as text: {}", raw);
                out.push(Markup::Text(raw));
                Step::Continue(ScanState::ScanningText)
            }
        }
    }

    fn parse_block(
        &mut self,
        name: String,
        args: Map<String, Value>,
        out: &mut Vec<Markup>,
    ) -> Step {
        let rest = &self.buf[self.cursor..];
        let ws = leading_whitespace(rest);
        let tail = &rest[ws..];

        if tail.is_empty() || is_partial_of(tail, &BLOCK_MARKERS) {
            return Step::Wait(ScanState::ParsingBlock { name, args });
        }

        if tail.starts_with(INVOKE_CLOSE) {
            let end = self.cursor + ws + INVOKE_CLOSE.len();
            self.buf.drain(..end);
            self.cursor = 0;
            out.push(Markup::Invoke { name, args });
            return Step::Continue(ScanState::TrailingParameters { late: Map::new() });
        }

        if tail.starts_with(PARAM_OPEN) {
            let Some(gt) = tail.find('>') else {
                return Step::Wait(ScanState::ParsingBlock { name, args });
            };
            let param = PARAM_TAG
                .captures(&tail[..=gt])
                .map(|caps| caps[1].to_string());
            self.cursor += ws + gt + 1;
            return match param {
                Some(param) => Step::Continue(ScanState::ParsingParameter { name, args, param }),
                None => {
                    tracing::debug!("Skipping malformed parameter tag in {} call", name);
                    Step::Continue(ScanState::ParsingBlock { name, args })
                }
            };
        }

        // Anything else inside a block is noise; skip to the next tag
        let first = tail.chars().next().map_or(0, char::len_utf8);
        let skip = tail[first..].find('<').map_or(tail.len(), |at| at + first);
        self.cursor += ws + skip;
        Step::Continue(ScanState::ParsingBlock { name, args })
    }

    fn parse_parameter(
        &mut self,
        name: String,
        mut args: Map<String, Value>,
        param: String,
    ) -> Step {
        let Some(end) = self.buf[self.cursor..].find(PARAM_CLOSE) else {
            return Step::Wait(ScanState::ParsingParameter { name, args, param });
        };

        let raw = &self.buf[self.cursor..self.cursor + end];
        args.insert(param, decode_value(raw));
        self.cursor += end + PARAM_CLOSE.len();
        Step::Continue(ScanState::ParsingBlock { name, args })
    }

    fn parse_result(&mut self, out: &mut Vec<Markup>) -> Step {
        let Some(end) = self.buf.find(RESULT_CLOSE) else {
            return Step::Wait(ScanState::ResultBlock);
        };

        let body = self.buf[RESULT_OPEN.len()..end].trim().to_string();
        self.buf.drain(..end + RESULT_CLOSE.len());
        out.push(Markup::Result(body));
        Step::Continue(ScanState::ScanningText)
    }

    fn parse_trailing(&mut self, mut late: Map<String, Value>, out: &mut Vec<Markup>) -> Step {
        let ws = leading_whitespace(&self.buf);
        let tail = &self.buf[ws..];

        if tail.is_empty() || is_partial_of(tail, &TRAILING_MARKERS) {
            return Step::Wait(ScanState::TrailingParameters { late });
        }

        for closer in [INVOKE_CLOSE, WRAP_CLOSE] {
            if tail.starts_with(closer) {
                self.buf.drain(..ws + closer.len());
                return Step::Continue(ScanState::TrailingParameters { late });
            }
        }

        if tail.starts_with(PARAM_OPEN) {
            let Some(end) = tail.find(PARAM_CLOSE) else {
                return Step::Wait(ScanState::TrailingParameters { late });
            };
            let parsed = tail.find('>').filter(|gt| *gt < end).and_then(|gt| {
                PARAM_TAG
                    .captures(&tail[..=gt])
                    .map(|caps| (caps[1].to_string(), decode_value(&tail[gt + 1..end])))
            });
            if let Some((param, value)) = parsed {
                tracing::debug!("Found parameter {} after closing invoke tag", param);
                late.insert(param, value);
                self.buf.drain(..ws + end + PARAM_CLOSE.len());
                return Step::Continue(ScanState::TrailingParameters { late });
            }
        }

        if !late.is_empty() {
            out.push(Markup::LateParameters(late));
        }
        Step::Continue(ScanState::ScanningText)
    }
}

/// Parameter values are JSON when they parse as JSON, text otherwise
fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn leading_whitespace(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

/// `text` is a strict prefix of one of `markers`
fn is_partial_of(text: &str, markers: &[&str]) -> bool {
    markers
        .iter()
        .any(|marker| marker.len() > text.len() && marker.starts_with(text))
}

/// Length of the longest suffix of `text` that could begin one of `markers`
fn partial_marker_len(text: &str, markers: &[&str]) -> usize {
    let longest = markers.iter().map(|m| m.len()).max().unwrap_or(0);
    (1..longest.min(text.len() + 1))
        .rev()
        .find(|&n| {
            let start = text.len() - n;
            text.is_char_boundary(start) && is_partial_of(&text[start..], markers)
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const BLOCK: &str = "Let me check.\n<function_calls>\n<invoke name=\"get_cost\">\n<parameter name=\"region\">us-east-1</parameter>\n<parameter name=\"days\">30</parameter>\n</invoke>\n</function_calls>";

    fn feed(parts: &[&str]) -> Vec<Markup> {
        let mut scanner = MarkupScanner::new();
        let mut out = Vec::new();
        for part in parts {
            out.extend(scanner.push(part));
        }
        out.extend(scanner.finish());
        out
    }

    fn get_cost_args() -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("region".into(), json!("us-east-1"));
        args.insert("days".into(), json!(30));
        args
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(
            feed(&["Hello ", "world"]),
            vec![
                Markup::Text("Hello ".into()),
                Markup::Text("world".into())
            ]
        );
    }

    #[test]
    fn parses_complete_block() {
        assert_eq!(
            feed(&[BLOCK]),
            vec![
                Markup::Text("Let me check.\n".into()),
                Markup::Invoke {
                    name: "get_cost".into(),
                    args: get_cost_args()
                }
            ]
        );
    }

    #[test]
    fn every_split_inside_markup_yields_same_output() {
        let whole = feed(&[BLOCK]);
        let markup_start = BLOCK.find('<').expect("block has markup");
        for split in markup_start..BLOCK.len() {
            let (a, b) = BLOCK.split_at(split);
            assert_eq!(feed(&[a, b]), whole, "split at {}", split);
        }
    }

    #[test]
    fn character_by_character_delivery_finds_the_call() {
        let chars: Vec<String> = BLOCK.chars().map(String::from).collect();
        let parts: Vec<&str> = chars.iter().map(String::as_str).collect();
        let out = feed(&parts);
        let calls: Vec<_> = out
            .iter()
            .filter(|m| matches!(m, Markup::Invoke { .. }))
            .collect();
        assert_eq!(
            calls,
            vec![&Markup::Invoke {
                name: "get_cost".into(),
                args: get_cost_args()
            }]
        );
        let text: String = out
            .iter()
            .filter_map(|m| match m {
                Markup::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        // Blank text right before markup is dropped, so only trailing whitespace may differ
        assert_eq!(text.trim_end(), "Let me check.");
    }

    #[test]
    fn partial_opening_marker_is_held_back() {
        let mut scanner = MarkupScanner::new();
        assert_eq!(
            scanner.push("Checking <inv"),
            vec![Markup::Text("Checking ".into())]
        );
        assert!(scanner.push("oke name=\"list\">").is_empty());
        assert_eq!(
            scanner.push("</invoke>"),
            vec![Markup::Invoke {
                name: "list".into(),
                args: Map::new()
            }]
        );
    }

    #[test]
    fn less_than_in_prose_is_released() {
        assert_eq!(
            feed(&["a < b", " and c <"]),
            vec![
                Markup::Text("a < b".into()),
                Markup::Text(" and c ".into()),
                Markup::Text("<".into())
            ]
        );
    }

    #[test]
    fn late_parameters_are_reported_once() {
        let out = feed(&[
            "<invoke name=\"get_cost\"><parameter name=\"region\">us-east-1</parameter></invoke>\n",
            "<parameter name=\"granularity\">\"DAILY\"</parameter>\n<parameter name=\"days\">7</parameter>",
            "\nHere is the result.",
        ]);

        let mut late = Map::new();
        late.insert("granularity".into(), json!("DAILY"));
        late.insert("days".into(), json!(7));
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Markup::Invoke { name, .. } if name == "get_cost"));
        assert_eq!(out[1], Markup::LateParameters(late));
        assert_eq!(out[2], Markup::Text("\nHere is the result.".into()));
    }

    #[test]
    fn settle_ends_trailing_parameters() {
        let mut scanner = MarkupScanner::new();
        scanner.push("<invoke name=\"x\"></invoke><parameter name=\"k\">v</parameter>");
        let mut late = Map::new();
        late.insert("k".into(), json!("v"));
        assert_eq!(scanner.settle(), vec![Markup::LateParameters(late)]);
        assert!(scanner.settle().is_empty());
    }

    #[test]
    fn extra_closing_tags_are_stripped() {
        assert_eq!(
            feed(&["<invoke name=\"x\"></invoke>\n</invoke>\nDone"]),
            vec![
                Markup::Invoke {
                    name: "x".into(),
                    args: Map::new()
                },
                Markup::Text("\nDone".into())
            ]
        );
    }

    #[test]
    fn result_block_is_extracted() {
        assert_eq!(
            feed(&["<result>{\"total\": ", "12.5}</result>Total shown."]),
            vec![
                Markup::Result("{\"total\": 12.5}".into()),
                Markup::Text("Total shown.".into())
            ]
        );
    }

    #[test]
    fn malformed_values_fall_back_to_text() {
        let out = feed(&["<invoke name=\"q\"><parameter name=\"filter\">{broken</parameter></invoke>"]);
        let mut args = Map::new();
        args.insert("filter".into(), json!("{broken"));
        assert_eq!(
            out,
            vec![Markup::Invoke {
                name: "q".into(),
                args
            }]
        );
    }

    #[test]
    fn malformed_invoke_tag_becomes_text() {
        assert_eq!(
            feed(&["<invoke>oops"]),
            vec![
                Markup::Text("<invoke>".into()),
                Markup::Text("oops".into())
            ]
        );
    }

    #[test]
    fn unfinished_block_is_released_on_finish() {
        let raw = "<invoke name=\"x\"><parameter name=\"a\">1";
        assert_eq!(feed(&[raw]), vec![Markup::Text(raw.into())]);
    }

    #[test]
    fn multibyte_text_is_safe() {
        assert_eq!(
            feed(&["成本分析 <", "invoke name=\"成本\"></invoke>"]),
            vec![
                Markup::Text("成本分析 ".into()),
                Markup::Invoke {
                    name: "成本".into(),
                    args: Map::new()
                }
            ]
        );
    }

    #[test]
    fn trailing_whitespace_is_released_on_finish() {
        assert_eq!(
            feed(&["Done.", "\n\n"]),
            vec![Markup::Text("Done.".into()), Markup::Text("\n\n".into())]
        );
    }

    #[test]
    fn partial_marker_suffix_length() {
        assert_eq!(partial_marker_len("abc <inv", &TEXT_MARKERS), 4);
        assert_eq!(partial_marker_len("abc <", &TEXT_MARKERS), 1);
        assert_eq!(partial_marker_len("abc </function", &TEXT_MARKERS), 10);
        assert_eq!(partial_marker_len("abc", &TEXT_MARKERS), 0);
        assert_eq!(partial_marker_len("", &TEXT_MARKERS), 0);
    }
}
