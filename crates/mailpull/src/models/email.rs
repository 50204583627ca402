//! Email model as delivered by an email source

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned identifier of an email (Gmail or Graph message id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailId(pub String);

impl EmailId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EmailId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EmailId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse a header value like `"John Doe" <john@example.com>`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            };
        }

        Self::new(s)
    }

    /// Format the address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// One downloaded email, reduced to the metadata the UI list shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    /// Provider thread/conversation id, if the provider has one
    pub thread_id: Option<String>,
    pub from: Option<EmailAddress>,
    pub subject: String,
    pub snippet: String,
    pub received_at: Option<DateTime<Utc>>,
}

impl Email {
    /// Create a new email builder
    pub fn builder(id: impl Into<EmailId>) -> EmailBuilder {
        EmailBuilder::new(id.into())
    }
}

/// Builder for creating Email instances
pub struct EmailBuilder {
    email: Email,
}

impl EmailBuilder {
    fn new(id: EmailId) -> Self {
        Self {
            email: Email {
                id,
                thread_id: None,
                from: None,
                subject: String::new(),
                snippet: String::new(),
                received_at: None,
            },
        }
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.email.thread_id = Some(thread_id.into());
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.email.from = Some(from);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.email.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.email.snippet = snippet.into();
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.email.received_at = Some(received_at);
        self
    }

    pub fn build(self) -> Email {
        self.email
    }
}
