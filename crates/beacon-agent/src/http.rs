use beacon_core::Payload;
use futures_util::future::BoxFuture;
use reqwest::StatusCode;

use crate::source::{Credentials, RemoteSink, SendError};

/// Longest server error body carried into a `SendError`.
const MAX_ERROR_BODY: usize = 200;

/// POSTs each payload as JSON to one endpoint.
///
/// The payload's origin id goes out as `Idempotency-Key` so a retried send
/// the server already accepted is dropped on its side.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, payload: &Payload, credentials: &Credentials) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", payload.origin_id().to_string())
            .json(payload);
        if let Some(token) = &credentials.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(rejection(status, &body))
    }
}

impl RemoteSink for HttpSink {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(self.post(payload, credentials))
    }
}

fn classify(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Network(err.to_string())
    }
}

fn rejection(status: StatusCode, body: &str) -> SendError {
    let body = body.trim();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        body.chars().take(MAX_ERROR_BODY).collect()
    };
    SendError::Rejected {
        status: status.as_u16(),
        message,
    }
}
