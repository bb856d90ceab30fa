//! Blocking HTTP transport.

use std::io::Read;
use std::time::Duration;

use ktable_common::{ClientConfig, KtableError, Result};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};

use crate::transport::{Body, ByteChunks, Endpoint, Request, Transport};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    bearer_token: Option<String>,
    fetch_chunk_bytes: usize,
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        config: &ClientConfig,
    ) -> Result<Self> {
        if config.http_timeout_secs == 0 {
            return Err(KtableError::InvalidConfig(
                "http timeout must be > 0 seconds".to_string(),
            ));
        }
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| KtableError::Execution(format!("http client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
            fetch_chunk_bytes: config.fetch_chunk_bytes.max(1),
            client,
        })
    }

    fn send(&self, req: &Request) -> Result<Response> {
        let url = format!("{}{}", self.base_url, req.endpoint.path());
        info!(
            endpoint = %req.endpoint,
            params = ?req.params,
            bytes = req.body.len(),
            "ktable request"
        );
        let mut builder = self.client.post(url).query(&req.params);
        builder = match &req.body {
            Body::Empty => builder,
            Body::Json(v) => builder.json(v),
            Body::Bytes(b) => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(b.clone()),
        };
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().map_err(|e| {
            KtableError::Transport(format!("{} request failed: {e}", req.endpoint))
        })?;
        let status = resp.status().as_u16();
        debug!(endpoint = %req.endpoint, status, "ktable response");
        if (200..300).contains(&status) && status != 204 {
            return Ok(resp);
        }
        let text = resp.text().unwrap_or_default();
        Err(status_error(req.endpoint, status, text))
    }
}

/// Error for a non-success HTTP status.
pub fn status_error(endpoint: Endpoint, status: u16, text: String) -> KtableError {
    let detail = if text.is_empty() {
        format!("{endpoint}: status {status}")
    } else {
        format!("{endpoint}: status {status}: {text}")
    };
    match status {
        // 204 is how the service reports a missing table on schema probes
        204 | 404 => KtableError::NotFound(detail),
        500..=599 => KtableError::Transport(detail),
        _ => KtableError::Server(detail),
    }
}

impl Transport for HttpTransport {
    fn call(&self, req: &Request) -> Result<Vec<u8>> {
        let resp = self.send(req)?;
        let bytes = resp.bytes().map_err(|e| {
            KtableError::Transport(format!("{} response read failed: {e}", req.endpoint))
        })?;
        Ok(bytes.to_vec())
    }

    fn stream(&self, req: &Request) -> Result<ByteChunks> {
        let resp = self.send(req)?;
        Ok(Box::new(ResponseChunks {
            resp,
            endpoint: req.endpoint,
            chunk_bytes: self.fetch_chunk_bytes,
            done: false,
        }))
    }
}

struct ResponseChunks {
    resp: Response,
    endpoint: Endpoint,
    chunk_bytes: usize,
    done: bool,
}

impl Iterator for ResponseChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_bytes];
        match self.resp.read(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) => {
                self.done = true;
                Some(Err(KtableError::Transport(format!(
                    "{} response stream failed: {e}",
                    self.endpoint
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ktable_common::ClientConfig;

    use super::{status_error, HttpTransport};
    use crate::transport::Endpoint;

    #[test]
    fn statuses_map_to_error_kinds() {
        assert!(status_error(Endpoint::Schema, 204, String::new()).is_not_found());
        assert!(status_error(Endpoint::Select, 404, "no table".to_string()).is_not_found());
        assert!(status_error(Endpoint::Select, 503, String::new()).is_transient());
        let err = status_error(Endpoint::Insert, 400, "bad schema".to_string());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("bad schema"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ClientConfig {
            http_timeout_secs: 0,
            ..ClientConfig::default()
        };
        assert!(HttpTransport::new("http://localhost:1", None, &config).is_err());
    }
}
