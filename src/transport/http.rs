use reqwest::Proxy;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, ErrorContext};
use crate::Result;

/// Longest provider error body kept in [`Error::Remote`].
const MAX_ERROR_BODY: usize = 2048;

/// JSON-over-HTTPS client bound to one base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Build a client for `base_url`.
    ///
    /// Environment overrides: `UNIFY_LLM_HTTP_TIMEOUT_SECS` (whole-request
    /// timeout, unset by default), `UNIFY_LLM_HTTP_POOL_MAX_IDLE_PER_HOST` (32)
    /// and `UNIFY_LLM_PROXY_URL`.
    pub fn new(base_url: &str) -> Result<Self> {
        url::Url::parse(base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base url: {}", e),
                ErrorContext::new()
                    .with_field_path("model_config.base_url")
                    .with_details(base_url.to_string()),
            )
        })?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(
                env::var("UNIFY_LLM_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        if let Some(secs) = env::var("UNIFY_LLM_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Ok(proxy_url) = env::var("UNIFY_LLM_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `base_url + path` and decode the JSON reply.
    ///
    /// Non-2xx statuses become [`Error::Remote`] carrying the (truncated) body.
    pub async fn post_json(
        &self,
        path: &str,
        headers: &HashMap<String, String>,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "sending request");

        let mut request = self.client.post(&url).json(body);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = HttpTransport::new("not a url").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let t = HttpTransport::new("https://api.example.com/v1/").unwrap();
        assert_eq!(t.base_url(), "https://api.example.com/v1");
    }

    #[tokio::test]
    async fn test_non_success_status_is_remote_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let t = HttpTransport::new(&server.url()).unwrap();
        let err = t
            .post_json("/chat", &HashMap::new(), &[], &serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            Error::Remote { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
        mock.assert_async().await;
    }
}
