//! Thread-to-async bridge for the blocking runtime call
//!
//! Each invocation gets a dedicated worker thread. The worker performs the
//! blocking call, reassembles `data:` records from the body, and pushes decoded
//! frames into a bounded channel. The async side awaits the channel; a
//! `Finished` message marks a clean end and `Failed` carries the error across.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use super::frames::{decode_record, RawFrame};
use super::{AgentRuntime, InvokeRequest, RuntimeResponse};
use crate::config::BridgeConfig;
use crate::error::BridgeError;

enum Delivery {
    Frame(RawFrame),
    Finished,
    Failed(BridgeError),
}

/// Runs runtime invocations on worker threads
#[derive(Clone)]
pub struct RuntimeBridge {
    runtime: Arc<dyn AgentRuntime>,
    config: BridgeConfig,
}

impl RuntimeBridge {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: BridgeConfig) -> Self {
        Self { runtime, config }
    }

    /// Start an invocation and return its frames.
    ///
    /// The worker cannot be interrupted. Dropping the returned stream makes the
    /// worker stop at its next delivery attempt; until then it runs unobserved.
    pub fn invoke(&self, request: InvokeRequest) -> FrameStream {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let runtime = Arc::clone(&self.runtime);
        let config = self.config.clone();

        let spawned = std::thread::Builder::new()
            .name("runtime-bridge".to_string())
            .spawn({
                let tx = tx.clone();
                move || run_worker(runtime.as_ref(), &request, &config, &tx)
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn runtime worker thread: {}", e);
            let _ = tx.try_send(Delivery::Failed(BridgeError::Io(e)));
        }

        FrameStream { rx, done: false }
    }

    /// Best-effort request to stop an upstream session. Never fails the caller.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let runtime = Arc::clone(&self.runtime);
        let id = session_id.to_string();

        match tokio::task::spawn_blocking(move || runtime.stop_session(&id)).await {
            Ok(Ok(stopped)) => stopped,
            Ok(Err(e)) => {
                tracing::warn!("Failed to stop runtime session {}: {}", session_id, e);
                false
            }
            Err(e) => {
                tracing::warn!("Stop-session task for {} panicked: {}", session_id, e);
                false
            }
        }
    }
}

/// Frames of one invocation, in delivery order.
///
/// Yields `Ok(frame)` items, then ends. An abnormal end yields one `Err`
/// before ending.
pub struct FrameStream {
    rx: mpsc::Receiver<Delivery>,
    done: bool,
}

impl Stream for FrameStream {
    type Item = Result<RawFrame, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Delivery::Frame(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Delivery::Finished)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Delivery::Failed(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(BridgeError::WorkerLost)))
            }
        }
    }
}

/// The consumer dropped its end of the channel
struct ConsumerGone;

struct FramePump<'a> {
    tx: &'a mpsc::Sender<Delivery>,
    delivered: usize,
}

impl FramePump<'_> {
    fn deliver_record(&mut self, record: Value) -> Result<(), ConsumerGone> {
        for frame in decode_record(record) {
            self.tx
                .blocking_send(Delivery::Frame(frame))
                .map_err(|_| ConsumerGone)?;
            self.delivered += 1;
        }
        Ok(())
    }

    fn deliver_line(&mut self, line: &[u8]) -> Result<(), ConsumerGone> {
        match decode_line(line) {
            Some(record) => self.deliver_record(record),
            None => Ok(()),
        }
    }
}

fn run_worker(
    runtime: &dyn AgentRuntime,
    request: &InvokeRequest,
    config: &BridgeConfig,
    tx: &mpsc::Sender<Delivery>,
) {
    let response = match runtime.invoke(request) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Runtime invocation failed: {}", e);
            let _ = tx.blocking_send(Delivery::Failed(BridgeError::Upstream(e.to_string())));
            return;
        }
    };

    let mut pump = FramePump { tx, delivered: 0 };
    let outcome = if response.is_event_stream() {
        pump_event_stream(response, config, &mut pump)
    } else {
        pump_single_body(response, &mut pump)
    };

    let last = match outcome {
        Ok(Ok(())) => {
            tracing::info!("Runtime stream finished after {} frames", pump.delivered);
            Delivery::Finished
        }
        Ok(Err(err)) => match classify_read_error(err, pump.delivered, config) {
            Ok(()) => Delivery::Finished,
            Err(failure) => Delivery::Failed(failure),
        },
        Err(ConsumerGone) => {
            tracing::debug!(
                "Consumer stopped listening after {} frames, abandoning stream",
                pump.delivered
            );
            return;
        }
    };
    let _ = tx.blocking_send(last);
}

/// Read the body in chunks and deliver every complete `data:` line.
///
/// The outer result reports a vanished consumer, the inner one a read failure.
fn pump_event_stream(
    mut response: RuntimeResponse,
    config: &BridgeConfig,
    pump: &mut FramePump<'_>,
) -> Result<io::Result<()>, ConsumerGone> {
    let mut lines = LineBuffer::default();
    let mut chunk = vec![0u8; config.read_chunk_size.max(1)];

    loop {
        let n = match response.body.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Salvage a final record that arrived without its newline
                if let Some(rest) = lines.finish() {
                    pump.deliver_line(&rest)?;
                }
                return Ok(Err(e));
            }
        };

        for line in lines.push(&chunk[..n]) {
            pump.deliver_line(&line)?;
        }
    }

    if let Some(rest) = lines.finish() {
        pump.deliver_line(&rest)?;
    }
    Ok(Ok(()))
}

fn pump_single_body(
    mut response: RuntimeResponse,
    pump: &mut FramePump<'_>,
) -> Result<io::Result<()>, ConsumerGone> {
    tracing::warn!(
        "Runtime responded with {} instead of an event stream",
        response.content_type
    );

    let mut body = Vec::new();
    if let Err(e) = response.body.read_to_end(&mut body) {
        return Ok(Err(e));
    }

    match serde_json::from_slice::<Value>(&body) {
        Ok(record) => pump.deliver_record(record)?,
        Err(e) => tracing::warn!("Discarding undecodable runtime body: {}", e),
    }
    Ok(Ok(()))
}

/// Soft end for a truncated body once enough frames arrived, otherwise a failure
fn classify_read_error(
    err: io::Error,
    delivered: usize,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    if !is_truncation(&err) {
        tracing::error!("Runtime stream read failed after {} frames: {}", delivered, err);
        return Err(BridgeError::Io(err));
    }

    if delivered > 0 && delivered >= config.soft_truncation_min_frames {
        tracing::warn!(
            "Runtime body truncated after {} frames, treating as end of stream: {}",
            delivered,
            err
        );
        Ok(())
    } else {
        tracing::error!("Runtime body truncated after {} frames: {}", delivered, err);
        Err(BridgeError::Truncated { frames: delivered })
    }
}

/// Premature end of body, as reported by std or by reqwest's body reader
fn is_truncation(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(|e| e.is_body() && !e.is_timeout())
}

/// Accumulates bytes and splits them into newline-terminated lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.is_empty()).then_some(rest)
    }
}

/// Decode one SSE line. Non-data lines and malformed records yield `None`.
fn decode_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    let payload = text.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            // Some runtimes print records as Python dict literals
            if let Some(value) = python_literal_to_json(payload)
                .and_then(|json| serde_json::from_str(&json).ok())
            {
                return Some(value);
            }
            let preview: String = payload.chars().take(120).collect();
            tracing::warn!("Skipping malformed runtime record ({}): {}", e, preview);
            None
        }
    }
}

/// Rewrite a Python literal (`{'a': True, 'b': None}`) as JSON text.
///
/// Object references such as `<Agent object at 0x7f..>` outside strings
/// become empty objects. Tuples become arrays. Returns `None` when a string
/// or object reference is left open.
fn python_literal_to_json(src: &str) -> Option<String> {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push('"');
                let quote = c;
                loop {
                    match chars.next()? {
                        ch if ch == quote => break,
                        '\\' => match chars.next()? {
                            '\'' => out.push('\''),
                            'x' => {
                                let hex: String = [chars.next()?, chars.next()?].iter().collect();
                                out.push_str("\\u00");
                                out.push_str(&hex);
                            }
                            esc => {
                                out.push('\\');
                                out.push(esc);
                            }
                        },
                        '"' => out.push_str("\\\""),
                        ch => out.push(ch),
                    }
                }
                out.push('"');
            }
            '<' => {
                while chars.next()? != '>' {}
                out.push_str("{}");
            }
            '(' => out.push('['),
            ')' => out.push(']'),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::error::RuntimeError;
    use crate::runtime::testing::{message_stop, sse, text_delta, FakeRuntime, Step};

    fn bridge(runtime: Arc<dyn AgentRuntime>) -> RuntimeBridge {
        RuntimeBridge::new(runtime, BridgeConfig::default())
    }

    fn request() -> InvokeRequest {
        InvokeRequest::new("q", "acct-1", crate::types::ResourceKind::Aws, "user-1")
    }

    async fn drain(stream: FrameStream) -> (Vec<RawFrame>, Option<BridgeError>) {
        let mut frames = Vec::new();
        let mut error = None;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => frames.push(frame),
                Err(e) => error = Some(e),
            }
        }
        (frames, error)
    }

    #[tokio::test]
    async fn delivers_frames_in_order_then_ends() {
        let runtime = FakeRuntime::with_script(vec![
            sse(&text_delta("Hello ")),
            sse(&text_delta("world")),
            sse(&message_stop("end_turn")),
        ]);
        let (frames, error) = drain(bridge(runtime.clone()).invoke(request())).await;

        assert!(error.is_none());
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], RawFrame::TextDelta { text, .. } if text == "Hello "));
        assert!(matches!(&frames[2], RawFrame::MessageStop { .. }));
        assert_eq!(runtime.invocations.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn reassembles_records_split_across_reads() {
        let line = format!("data: {}\n", text_delta("split"));
        let (head, tail) = line.split_at(17);
        let runtime = FakeRuntime::with_script(vec![
            Step::Bytes(head.as_bytes().to_vec()),
            Step::Bytes(tail.as_bytes().to_vec()),
        ]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert!(error.is_none());
        assert_eq!(
            frames,
            vec![RawFrame::TextDelta {
                index: Some(0),
                text: "split".into()
            }]
        );
    }

    #[tokio::test]
    async fn skips_malformed_and_non_data_lines() {
        let runtime = FakeRuntime::with_script(vec![
            Step::Bytes(b"event: message\n: keep-alive\ndata: {not json\n".to_vec()),
            sse(&text_delta("ok")),
        ]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert!(error.is_none());
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn final_record_without_newline_is_kept() {
        let runtime = FakeRuntime::with_script(vec![Step::Bytes(
            format!("data: {}", message_stop("end_turn")).into_bytes(),
        )]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert!(error.is_none());
        assert!(matches!(&frames[..], [RawFrame::MessageStop { .. }]));
    }

    #[tokio::test]
    async fn truncation_after_many_frames_is_soft() {
        let mut steps: Vec<Step> = (0..40).map(|i| sse(&text_delta(&format!("t{} ", i)))).collect();
        steps.push(Step::Fail(io::ErrorKind::UnexpectedEof));
        let runtime = FakeRuntime::with_script(steps);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert_eq!(frames.len(), 40);
        assert!(error.is_none(), "truncation after data should end cleanly");
    }

    #[tokio::test]
    async fn truncation_without_frames_is_hard() {
        let runtime = FakeRuntime::with_script(vec![Step::Fail(io::ErrorKind::UnexpectedEof)]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert!(frames.is_empty());
        assert!(matches!(error, Some(BridgeError::Truncated { frames: 0 })));
    }

    #[tokio::test]
    async fn truncation_below_threshold_is_hard() {
        let runtime = FakeRuntime::with_script(vec![
            sse(&text_delta("a")),
            sse(&text_delta("b")),
            Step::Fail(io::ErrorKind::UnexpectedEof),
        ]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(error, Some(BridgeError::Truncated { frames: 2 })));
    }

    #[tokio::test]
    async fn other_read_errors_propagate() {
        let runtime = FakeRuntime::with_script(vec![
            sse(&text_delta("a")),
            Step::Fail(io::ErrorKind::ConnectionReset),
        ]);
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(error, Some(BridgeError::Io(_))));
    }

    #[tokio::test]
    async fn invoke_failure_is_reported() {
        let runtime = FakeRuntime::failing("runtime unavailable");
        let (frames, error) = drain(bridge(runtime).invoke(request())).await;

        assert!(frames.is_empty());
        match error {
            Some(BridgeError::Upstream(message)) => {
                assert!(message.contains("runtime unavailable"))
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    struct JsonRuntime;

    impl AgentRuntime for JsonRuntime {
        fn invoke(&self, _request: &InvokeRequest) -> Result<RuntimeResponse, RuntimeError> {
            let body = json!({"error": "quota exhausted"}).to_string();
            Ok(RuntimeResponse {
                content_type: "application/json".to_string(),
                body: Box::new(Cursor::new(body.into_bytes())),
            })
        }

        fn stop_session(&self, _session_id: &str) -> Result<bool, RuntimeError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn non_stream_body_is_decoded_as_one_record() {
        let (frames, error) = drain(bridge(Arc::new(JsonRuntime)).invoke(request())).await;

        assert!(error.is_none());
        assert_eq!(
            frames,
            vec![RawFrame::Error {
                message: "quota exhausted".into()
            }]
        );
    }

    #[tokio::test]
    async fn stop_session_reports_result() {
        let runtime = FakeRuntime::with_script(vec![]);
        assert!(bridge(runtime.clone()).stop_session("sess-1").await);
        assert_eq!(
            runtime.stopped_sessions.lock().expect("lock").as_slice(),
            ["sess-1".to_string()]
        );
        assert!(!bridge(Arc::new(JsonRuntime)).stop_session("sess-2").await);
    }

    #[test]
    fn line_buffer_carries_remainder() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        let complete = lines.push(b":1}\ndata: x");
        assert_eq!(complete, vec![b"data: {\"a\":1}".to_vec()]);
        assert_eq!(lines.finish(), Some(b"data: x".to_vec()));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn decode_line_handles_prefix_variants() {
        assert_eq!(decode_line(b"data: {\"a\":1}\r"), Some(json!({"a": 1})));
        assert_eq!(decode_line(b"data:{\"a\":2}"), Some(json!({"a": 2})));
        assert_eq!(decode_line(b"data: [DONE]"), None);
        assert_eq!(decode_line(b"id: 7"), None);
        assert_eq!(decode_line(b""), None);
    }

    #[test]
    fn decode_line_accepts_python_literals() {
        let line = br#"data: {'event': {'contentBlockDelta': {'delta': {'text': 'it\'s "5" <b>'}, 'contentBlockIndex': 0}}}"#;
        assert_eq!(
            decode_line(line),
            Some(json!({"event": {"contentBlockDelta": {
                "delta": {"text": "it's \"5\" <b>"},
                "contentBlockIndex": 0
            }}}))
        );

        let line = b"data: {'init_event_loop': True, 'agent': <strands.agent.Agent object at 0x7f3a>, 'data': None, 'ok': False, 'pair': (1, 2)}";
        assert_eq!(
            decode_line(line),
            Some(json!({"init_event_loop": true, "agent": {}, "data": null, "ok": false, "pair": [1, 2]}))
        );
    }

    #[test]
    fn unreadable_records_are_skipped() {
        assert_eq!(decode_line(b"data: {'text': 'unterminated"), None);
        assert_eq!(decode_line(b"data: {'agent': <open"), None);
        assert_eq!(decode_line(b"data: not a record"), None);
    }
}
