//! Text and metadata derived from a query before it reaches the runtime

use base64::Engine;
use serde_json::{json, Value};

use crate::constants;
use crate::types::{Account, Attachment, ResourceKind};

const IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];
const EXCEL_TYPES: [&str; 2] = [
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
];
const EXCEL_EXTENSIONS: [&str; 2] = [".xlsx", ".xls"];
const DOCUMENT_TYPES: [&str; 6] = [
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/markdown",
    "text/plain",
    "text/x-markdown",
];
const DOCUMENT_EXTENSIONS: [&str; 6] = [".pdf", ".doc", ".docx", ".md", ".markdown", ".txt"];

pub(crate) const NO_ACCOUNT_GUIDANCE: &str = "No cloud account is configured yet. Add an AWS or GCP account under Account Management, then ask again.";

/// Title for a session created from its first query
pub(crate) fn session_title(query: &str) -> String {
    let limit = constants::query::SESSION_TITLE_CHARS;
    if query.chars().count() > limit {
        let head: String = query.chars().take(limit).collect();
        format!("{}...", head)
    } else {
        query.to_string()
    }
}

/// `a, b, c...` listing at most the first few ids
pub(crate) fn denied_list(ids: &[String]) -> String {
    let shown = constants::query::DENIED_IDS_SHOWN;
    let mut list = ids
        .iter()
        .take(shown)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > shown {
        list.push_str("...");
    }
    list
}

/// The user's query followed by the account it runs against
pub(crate) fn enhanced_prompt(query: &str, account: &Account) -> String {
    match account.kind {
        ResourceKind::Aws => format!(
            "User query: {}\n\nCurrent AWS account:\n- Account alias: {}\n- AWS account ID: {}\n",
            query,
            account.display_name,
            account.external_id.as_deref().unwrap_or(&account.id)
        ),
        ResourceKind::Gcp => format!(
            "User query: {}\n\nCurrent GCP account:\n- Account name: {}\n- GCP project ID: {}\n- Organization ID: {}\n",
            query,
            account.display_name,
            account.external_id.as_deref().unwrap_or("Unknown"),
            account.organization_id.as_deref().unwrap_or("Unknown")
        ),
    }
}

/// Metadata stored with the user turn: attachment names and sizes, never content
pub(crate) fn user_message_metadata(attachments: &[Attachment]) -> Value {
    if attachments.is_empty() {
        return json!({});
    }

    let images: Vec<Value> = attachments
        .iter()
        .filter(|a| IMAGE_TYPES.contains(&a.mime_type.as_str()))
        .map(describe)
        .collect();
    let excels: Vec<Value> = attachments
        .iter()
        .filter(|a| is_excel(a))
        .map(describe)
        .collect();
    let documents: Vec<Value> = attachments
        .iter()
        .filter(|a| is_document(a))
        .map(describe)
        .collect();

    json!({
        "attachments_metadata": {
            "images": images,
            "excels": excels,
            "documents": documents,
        }
    })
}

fn has_extension(file_name: &str, extensions: &[&str]) -> bool {
    let lower = file_name.to_ascii_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext))
}

fn is_excel(attachment: &Attachment) -> bool {
    EXCEL_TYPES.contains(&attachment.mime_type.as_str())
        || has_extension(&attachment.file_name, &EXCEL_EXTENSIONS)
}

fn is_document(attachment: &Attachment) -> bool {
    DOCUMENT_TYPES.contains(&attachment.mime_type.as_str())
        || has_extension(&attachment.file_name, &DOCUMENT_EXTENSIONS)
}

fn describe(attachment: &Attachment) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "fileName": attachment.file_name,
        "fileSize": decoded_size(attachment),
        "mimeType": attachment.mime_type,
    })
}

fn decoded_size(attachment: &Attachment) -> usize {
    match base64::engine::general_purpose::STANDARD.decode(&attachment.base64_data) {
        Ok(bytes) => bytes.len(),
        Err(e) => {
            tracing::warn!(
                "Attachment {} is not valid base64: {}",
                attachment.file_name,
                e
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, mime: &str, data: &str) -> Attachment {
        Attachment {
            file_name: name.into(),
            mime_type: mime.into(),
            base64_data: data.into(),
        }
    }

    #[test]
    fn titles_are_truncated_by_characters() {
        assert_eq!(session_title("short"), "short");
        assert_eq!(
            session_title("What did we spend on EC2 last month?"),
            "What did we spend on..."
        );
        let wide = "费用".repeat(15);
        assert_eq!(session_title(&wide).chars().count(), 23);
    }

    #[test]
    fn denied_list_shows_three_ids() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(denied_list(&ids), "a, b, c...");
        assert_eq!(denied_list(&ids[..2]), "a, b");
    }

    #[test]
    fn aws_prompt_prefers_the_twelve_digit_id() {
        let account = Account {
            id: "acct-uuid".into(),
            kind: ResourceKind::Aws,
            display_name: "prod".into(),
            external_id: Some("123456789012".into()),
            organization_id: None,
        };
        let prompt = enhanced_prompt("cost?", &account);
        assert!(prompt.starts_with("User query: cost?\n\n"));
        assert!(prompt.contains("- Account alias: prod"));
        assert!(prompt.contains("- AWS account ID: 123456789012"));
    }

    #[test]
    fn gcp_prompt_lists_project_and_org() {
        let account = Account {
            id: "g1".into(),
            kind: ResourceKind::Gcp,
            display_name: "data".into(),
            external_id: Some("data-proj".into()),
            organization_id: None,
        };
        let prompt = enhanced_prompt("cost?", &account);
        assert!(prompt.contains("- GCP project ID: data-proj"));
        assert!(prompt.contains("- Organization ID: Unknown"));
    }

    #[test]
    fn attachments_are_classified_with_decoded_sizes() {
        let metadata = user_message_metadata(&[
            attachment("chart.png", "image/png", "aGVsbG8="),
            attachment("bill.XLSX", "application/octet-stream", "aGk="),
            attachment("notes.md", "text/markdown", "not base64!"),
        ]);
        let meta = &metadata["attachments_metadata"];
        assert_eq!(meta["images"][0]["fileName"], "chart.png");
        assert_eq!(meta["images"][0]["fileSize"], 5);
        assert_eq!(meta["excels"][0]["fileSize"], 2);
        assert_eq!(meta["documents"][0]["mimeType"], "text/markdown");
        assert_eq!(meta["documents"][0]["fileSize"], 0);
        assert!(meta["images"][0]["id"].is_string());
    }

    #[test]
    fn no_attachments_means_empty_metadata() {
        assert_eq!(user_message_metadata(&[]), json!({}));
    }
}
