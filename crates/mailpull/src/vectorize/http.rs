//! HTTP vectorization sink
//!
//! Posts `{"userId": ..., "emailId": ...}` to a processing endpoint, which is
//! expected to acknowledge quickly and process asynchronously.

use anyhow::{Context, Result};
use serde::Serialize;

use super::VectorizationSink;
use crate::config::VectorizeConfig;
use crate::error::StatusError;
use crate::models::EmailId;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VectorizeRequest<'a> {
    user_id: &'a str,
    email_id: &'a str,
}

/// Sink that publishes over HTTP
pub struct HttpVectorizationSink {
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpVectorizationSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
        }
    }

    pub fn from_config(config: &VectorizeConfig) -> Self {
        let sink = Self::new(config.endpoint.clone());
        match &config.auth_token {
            Some(token) => sink.with_auth_token(token.clone()),
            None => sink,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn body<'a>(user: &'a str, email_id: &'a EmailId) -> VectorizeRequest<'a> {
        VectorizeRequest {
            user_id: user,
            email_id: email_id.as_str(),
        }
    }
}

impl VectorizationSink for HttpVectorizationSink {
    fn notify(&self, user: &str, email_id: &EmailId) -> Result<()> {
        let mut request = ureq::post(&self.endpoint);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", &format!("Bearer {}", token));
        }

        match request.send_json(Self::body(user, email_id)) {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(status)) => Err(StatusError {
                service: "Vectorization endpoint",
                status,
            }
            .into()),
            Err(e) => Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to publish {} for vectorization", email_id)),
        }
    }
}
