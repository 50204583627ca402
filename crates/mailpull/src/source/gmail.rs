//! Gmail REST API email source
//!
//! Lists message ids page by page and fetches per-message metadata.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use url::Url;

use super::{EmailBatch, EmailSource, TokenProvider, get_json, with_retry};
use crate::models::{Email, EmailAddress, EmailId};
use api::{GmailMessage, ListMessagesResponse, ProfileResponse};

/// Gmail API response types
pub mod api {
    use serde::Deserialize;

    /// Response from listing messages
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u64>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: String,
    }

    /// Message fetched with `format=metadata`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        #[serde(default)]
        pub snippet: String,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePayload>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// `users/{id}/profile`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: Option<String>,
        pub messages_total: Option<u64>,
    }
}

/// Gmail-backed [`EmailSource`]
pub struct GmailSource {
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    detail_attempts: u32,
}

impl GmailSource {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Gmail caps `maxResults` at 500
    const MAX_PAGE_SIZE: usize = 500;

    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            tokens,
            base_url: Self::BASE_URL.to_string(),
            detail_attempts: 3,
        }
    }

    /// Point the client at a different API root (proxies, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn user_url(&self, user: &str, path: &str) -> Result<Url> {
        let raw = format!(
            "{}/users/{}/{}",
            self.base_url,
            urlencoding::encode(user),
            path
        );
        Url::parse(&raw).with_context(|| format!("Invalid Gmail URL: {}", raw))
    }

    /// List one page of message ids
    pub fn list_messages(
        &self,
        user: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let mut url = self.user_url(user, "messages")?;
        url.query_pairs_mut().append_pair(
            "maxResults",
            &page_size.clamp(1, Self::MAX_PAGE_SIZE).to_string(),
        );
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }

        let token = self.tokens.access_token()?;
        get_json("Gmail", url.as_str(), &token, &[]).context("Failed to list messages")
    }

    /// Fetch headers and snippet of one message
    pub fn get_message(&self, user: &str, id: &str) -> Result<GmailMessage> {
        let mut url = self.user_url(user, &format!("messages/{}", urlencoding::encode(id)))?;
        url.query_pairs_mut()
            .append_pair("format", "metadata")
            .append_pair("metadataHeaders", "From")
            .append_pair("metadataHeaders", "Subject");

        let token = self.tokens.access_token()?;
        get_json("Gmail", url.as_str(), &token, &[])
            .with_context(|| format!("Failed to fetch message {}", id))
    }
}

impl EmailSource for GmailSource {
    fn fetch_batch(
        &self,
        user: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<EmailBatch> {
        let list = self.list_messages(user, page_size, cursor)?;
        let refs = list.messages.unwrap_or_default();

        let mut batch = EmailBatch {
            emails: Vec::with_capacity(refs.len()),
            next_cursor: list.next_page_token,
            failed_ids: Vec::new(),
        };

        for msg_ref in refs {
            match with_retry(self.detail_attempts, || self.get_message(user, &msg_ref.id)) {
                Ok(message) => batch.emails.push(normalize_message(message)),
                Err(e) => {
                    log::warn!("Giving up on message {}: {:#}", msg_ref.id, e);
                    batch.failed_ids.push(EmailId::new(msg_ref.id));
                }
            }
        }

        Ok(batch)
    }

    fn count_estimate(&self, user: &str) -> Result<u64> {
        let url = self.user_url(user, "profile")?;
        let token = self.tokens.access_token()?;
        let profile: ProfileResponse =
            get_json("Gmail", url.as_str(), &token, &[]).context("Failed to fetch profile")?;
        Ok(profile.messages_total.unwrap_or(0))
    }
}

/// Convert a metadata-format Gmail message into an [`Email`]
pub fn normalize_message(message: GmailMessage) -> Email {
    let header = |name: &str| -> Option<String> {
        message
            .payload
            .as_ref()?
            .headers
            .as_ref()?
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let from = header("From").map(|s| EmailAddress::parse(&s));
    let subject = header("Subject").unwrap_or_default();
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let mut builder = Email::builder(message.id.as_str())
        .thread_id(message.thread_id.as_str())
        .subject(subject)
        .snippet(message.snippet.as_str());
    if let Some(from) = from {
        builder = builder.from(from);
    }
    if let Some(received_at) = received_at {
        builder = builder.received_at(received_at);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticToken;

    #[test]
    fn test_parse_list_response() {
        let json = r#"{
            "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t1"}],
            "nextPageToken": "token-2",
            "resultSizeEstimate": 201
        }"#;
        let list: ListMessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(list.messages.unwrap().len(), 2);
        assert_eq!(list.next_page_token.as_deref(), Some("token-2"));
        assert_eq!(list.result_size_estimate, Some(201));
    }

    #[test]
    fn test_parse_last_page() {
        let list: ListMessagesResponse =
            serde_json::from_str(r#"{"resultSizeEstimate": 0}"#).unwrap();
        assert!(list.messages.is_none());
        assert!(list.next_page_token.is_none());
    }

    #[test]
    fn test_normalize_message() {
        let json = r#"{
            "id": "m1",
            "threadId": "t1",
            "snippet": "See you tomorrow",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "from", "value": "Jane Roe <jane@example.com>"},
                {"name": "Subject", "value": "Lunch"}
            ]}
        }"#;
        let email = normalize_message(serde_json::from_str(json).unwrap());

        assert_eq!(email.id.as_str(), "m1");
        assert_eq!(email.thread_id.as_deref(), Some("t1"));
        assert_eq!(email.subject, "Lunch");
        assert_eq!(email.snippet, "See you tomorrow");
        assert_eq!(email.from.unwrap().email, "jane@example.com");
        assert_eq!(email.received_at.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_normalize_message_without_payload() {
        let json = r#"{"id": "m2", "threadId": "t2"}"#;
        let email = normalize_message(serde_json::from_str(json).unwrap());
        assert!(email.from.is_none());
        assert!(email.subject.is_empty());
        assert!(email.received_at.is_none());
    }

    #[test]
    fn test_user_url_encodes_identity() {
        let source = GmailSource::new(Arc::new(StaticToken::new("t")))
            .with_base_url("https://gmail.example.test/gmail/v1/");
        let url = source.user_url("a+b@example.com", "profile").unwrap();
        assert_eq!(
            url.as_str(),
            "https://gmail.example.test/gmail/v1/users/a%2Bb%40example.com/profile"
        );
    }
}
