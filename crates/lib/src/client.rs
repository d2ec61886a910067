//! Relay client for the gateway (http://127.0.0.1:2223 by default).
//! Stateless: one `POST /run` per call, credential in `X-Admin-Token`.

use crate::auth::TOKEN_HEADER;
use crate::config::Config;
use crate::gateway::{RunRequest, RunResponse, RUN_PATH};
use reqwest::StatusCode;

/// Client for the gateway's `/run` endpoint.
#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("gateway rejected the token (401)")]
    Unauthorized,
    #[error("gateway refused the request: {0}")]
    Rejected(String),
    #[error("gateway returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid gateway response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Base URL for a gateway configured with `config` (bind:port).
pub fn base_url_for(config: &Config) -> String {
    let bind = config.bind.trim();
    let host = match bind {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" => "[::1]",
        b if b.contains(':') && !b.starts_with('[') => return format!("http://[{}]:{}", b, config.port),
        b => b,
    };
    format!("http://{}:{}", host, config.port)
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /run and decode the captured output. Non-200 answers become [`RelayError`]s.
    pub async fn run(&self, req: &RunRequest) -> Result<RunResponse, RelayError> {
        let url = format!("{}{}", self.base_url, RUN_PATH);
        let res = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(req)
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        match status {
            StatusCode::OK => Ok(serde_json::from_str(&body)?),
            StatusCode::UNAUTHORIZED => Err(RelayError::Unauthorized),
            StatusCode::FORBIDDEN => Err(RelayError::Rejected(body.trim().to_string())),
            status => Err(RelayError::Status {
                status,
                body: body.trim().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_from_config() {
        let mut c = Config::default();
        assert_eq!(base_url_for(&c), "http://127.0.0.1:2223");
        c.bind = "0.0.0.0".into();
        c.port = 9000;
        assert_eq!(base_url_for(&c), "http://127.0.0.1:9000");
        c.bind = "::1".into();
        assert_eq!(base_url_for(&c), "http://[::1]:9000");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = RelayClient::new("http://127.0.0.1:2223/", "t");
        assert_eq!(client.base_url(), "http://127.0.0.1:2223");
    }
}
