//! Microsoft Graph email source
//!
//! Graph pages with an absolute `@odata.nextLink` URL; that URL is used as
//! the opaque cursor as-is.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use url::Url;

use super::{EmailBatch, EmailSource, TokenProvider, get_json};
use crate::models::{Email, EmailAddress};
use api::{GraphMessage, ListMessagesResponse};

/// Graph API response types
pub mod api {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct ListMessagesResponse {
        #[serde(default)]
        pub value: Vec<GraphMessage>,
        #[serde(rename = "@odata.nextLink")]
        pub next_link: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphMessage {
        pub id: String,
        pub conversation_id: Option<String>,
        pub subject: Option<String>,
        pub body_preview: Option<String>,
        pub received_date_time: Option<String>,
        pub from: Option<Recipient>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Recipient {
        pub email_address: Option<GraphEmailAddress>,
    }

    #[derive(Debug, Deserialize)]
    pub struct GraphEmailAddress {
        pub name: Option<String>,
        pub address: Option<String>,
    }
}

/// Microsoft Graph-backed [`EmailSource`]
pub struct GraphSource {
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
}

impl GraphSource {
    const BASE_URL: &'static str = "https://graph.microsoft.com/v1.0";

    /// Graph caps `$top` for messages at 1000
    const MAX_PAGE_SIZE: usize = 1000;

    const SELECT: &'static str = "id,conversationId,subject,bodyPreview,receivedDateTime,from";

    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            tokens,
            base_url: Self::BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn first_page_url(&self, user: &str, page_size: usize) -> Result<Url> {
        let raw = format!(
            "{}/users/{}/messages",
            self.base_url,
            urlencoding::encode(user)
        );
        let mut url = Url::parse(&raw).with_context(|| format!("Invalid Graph URL: {}", raw))?;
        url.query_pairs_mut()
            .append_pair("$top", &page_size.clamp(1, Self::MAX_PAGE_SIZE).to_string())
            .append_pair("$select", Self::SELECT);
        Ok(url)
    }

    /// Accept a `nextLink` cursor only if it points back at the Graph API,
    /// so the bearer token is never sent elsewhere.
    fn cursor_url(&self, cursor: &str) -> Result<Url> {
        let within_base = cursor
            .strip_prefix(self.base_url.as_str())
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'));
        if !within_base {
            bail!("Refusing Graph cursor outside {}", self.base_url);
        }
        Url::parse(cursor).context("Invalid Graph cursor")
    }
}

impl EmailSource for GraphSource {
    fn fetch_batch(
        &self,
        user: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<EmailBatch> {
        let url = match cursor {
            Some(cursor) => self.cursor_url(cursor)?,
            None => self.first_page_url(user, page_size)?,
        };

        let token = self.tokens.access_token()?;
        let page: ListMessagesResponse =
            get_json("Graph", url.as_str(), &token, &[]).context("Failed to list messages")?;

        let emails = page.value.into_iter().map(normalize_message).collect();
        Ok(EmailBatch::new(emails, page.next_link))
    }

    fn count_estimate(&self, user: &str) -> Result<u64> {
        let url = format!(
            "{}/users/{}/messages/$count",
            self.base_url,
            urlencoding::encode(user)
        );
        let token = self.tokens.access_token()?;
        // $count requires advanced query mode
        get_json("Graph", &url, &token, &[("ConsistencyLevel", "eventual")])
            .context("Failed to count messages")
    }
}

/// Convert a Graph message into an [`Email`]
pub fn normalize_message(message: GraphMessage) -> Email {
    let mut builder = Email::builder(message.id)
        .subject(message.subject.unwrap_or_default())
        .snippet(message.body_preview.unwrap_or_default());

    if let Some(conversation_id) = message.conversation_id {
        builder = builder.thread_id(conversation_id);
    }

    let from = message
        .from
        .and_then(|r| r.email_address)
        .and_then(|a| match (a.name, a.address) {
            (Some(name), Some(address)) if !name.is_empty() => {
                Some(EmailAddress::with_name(name, address))
            }
            (_, Some(address)) => Some(EmailAddress::new(address)),
            _ => None,
        });
    if let Some(from) = from {
        builder = builder.from(from);
    }

    if let Some(received_at) = message
        .received_date_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        builder = builder.received_at(received_at.with_timezone(&Utc));
    }

    builder.build()
}
