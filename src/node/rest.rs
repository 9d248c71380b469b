use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NodeOptions;
use crate::error::{Error, Result};

/// Transporte REST hacia un nodo.
///
/// `Ok(None)` means the node answered 204. Any non-success status, 404 included,
/// is an [`Error::Request`]; nothing is retried here.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>>;
}

/// Builds the transport for a node; swapped out in tests.
pub type TransportFactory =
    std::sync::Arc<dyn Fn(&NodeOptions) -> Result<std::sync::Arc<dyn RestTransport>> + Send + Sync>;

/// Implementación con `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    password: String,
}

impl HttpTransport {
    pub fn new(options: &NodeOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: options.rest_url(),
            password: options.password.clone(),
        })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("🌐 {} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &self.password);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, &method, path))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, &method, path))?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            warn!("⚠️ {} {} respondió {}: {}", method, path, status, message);
            return Err(Error::Request {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed body from {path}: {e}")))
    }
}

fn transport_error(error: reqwest::Error, method: &Method, path: &str) -> Error {
    if error.is_timeout() {
        Error::Timeout {
            method: method.to_string(),
            path: path.to_string(),
        }
    } else {
        Error::Http(error)
    }
}
