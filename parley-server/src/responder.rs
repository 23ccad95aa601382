//! Turns a prompt into a reply. The hub only knows this trait.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::config::server::ResponderConfig;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub summary: String,
    #[serde(default)]
    pub results: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("responder request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("responder returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait Responder: Send + Sync + Debug {
    async fn respond(&self, prompt: &str, filter: Option<&Value>) -> Result<Reply, ResponderError>;
}

#[derive(Debug, Serialize)]
struct ReplyRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Value>,
}

/// POSTs `{prompt, filter}` as JSON and expects a [`Reply`] back.
#[derive(Debug, Clone)]
pub struct HttpResponder {
    client: reqwest::Client,
    url: String,
}

impl HttpResponder {
    /// # Errors
    /// Fails if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ResponderError> {
        let client = reqwest::ClientBuilder::new()
            // Following redirects opens the client up to SSRF vulnerabilities.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Responder for HttpResponder {
    #[instrument(name = "responder.http", skip_all, err)]
    async fn respond(&self, prompt: &str, filter: Option<&Value>) -> Result<Reply, ResponderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ReplyRequest { prompt, filter })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResponderError::Status(status.as_u16()));
        }
        let reply = response.json::<Reply>().await?;
        debug!(results = reply.results.len(), "responder replied");
        Ok(reply)
    }
}

/// Development responder: repeats the prompt and the filter it was given.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, prompt: &str, filter: Option<&Value>) -> Result<Reply, ResponderError> {
        Ok(Reply {
            summary: format!("You said: {prompt}"),
            results: filter.cloned().into_iter().collect(),
        })
    }
}

/// HTTP responder when a URL is configured, echo otherwise.
///
/// # Errors
/// Fails if the HTTP client cannot be built.
pub fn from_config(config: &ResponderConfig) -> Result<Box<dyn Responder>, ResponderError> {
    Ok(match config.url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => Box::new(HttpResponder::new(url, Duration::from_millis(config.timeout_ms))?),
        None => Box::new(EchoResponder),
    })
}
