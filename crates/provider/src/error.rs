fn extract_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = v["error"]["message"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = v["message"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = v["error"].as_str() {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{status}: {}", extract_error_message(body))]
    HttpError { status: u16, body: String },

    #[error("{status}: {}", extract_error_message(body))]
    ServerError { status: u16, body: String },

    #[error("Rate limited. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API key for {0} is not set. Configure it in config.toml or the environment.")]
    MissingApiKey(&'static str),

    #[error("No valid messages found for {0} request. Messages cannot have empty content.")]
    EmptyRequest(&'static str),

    #[error("Unexpected response from {provider}: {detail}")]
    UnexpectedResponse {
        provider: &'static str,
        detail: String,
    },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ServerError { .. })
    }

    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        if status == 429 {
            let retry_ms = retry_after
                .and_then(|s| s.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(1000);
            return Self::RateLimited {
                retry_after_ms: retry_ms,
            };
        }
        if status >= 500 {
            return Self::ServerError { status, body };
        }
        Self::HttpError { status, body }
    }
}

/// Turn a non-2xx response into a `ProviderError`, passing successes through.
pub(crate) async fn ensure_success(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_http(status.as_u16(), body, retry_after.as_deref()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(matches!(
            ProviderError::from_http(429, String::new(), Some("3")),
            ProviderError::RateLimited { retry_after_ms: 3000 }
        ));
        assert!(ProviderError::from_http(503, "down".into(), None).is_retryable());
        assert!(!ProviderError::from_http(401, "nope".into(), None).is_retryable());
    }

    #[test]
    fn error_message_prefers_json_detail() {
        let err = ProviderError::from_http(
            400,
            r#"{"error":{"message":"model not found"}}"#.into(),
            None,
        );
        assert_eq!(err.to_string(), "400: model not found");
    }
}
