use std::io::Read;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::error::DevUpdateError;

/// An open download: the final URL after redirects, the advertised size and
/// the unread body.
pub struct RemoteFile {
    pub url: Url,
    pub size: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Everything the crate needs from the network.
pub trait Transport: Send + Sync {
    /// Fetch a listing document. Non-success statuses are `ListingUnavailable`.
    fn get_text(&self, url: &Url) -> Result<String, DevUpdateError>;

    fn get_json(&self, url: &Url) -> Result<Value, DevUpdateError> {
        let text = self.get_text(url)?;
        serde_json::from_str(&text)
            .map_err(|err| DevUpdateError::ListingMalformed(format!("{url}: {err}")))
    }

    /// Start a download. Only response headers are read before returning.
    fn open(&self, url: &Url) -> Result<RemoteFile, DevUpdateError>;

    /// Whether a remote file exists. Any failure counts as missing.
    fn exists(&self, url: &Url) -> bool;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `connect_timeout` bounds connection set-up only; a transfer that has
    /// started streaming is never timed out.
    pub fn new(connect_timeout: Option<Duration>) -> Result<Self, DevUpdateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("devupdate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?,
        );

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(None::<Duration>);
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(|err| DevUpdateError::Connection {
            url: String::new(),
            message: err.to_string(),
        })?;
        Ok(Self { client })
    }

    fn send_with_retries<F>(&self, url: &Url, mut make_req: F) -> Result<Response, DevUpdateError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(%url, status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(%url, attempt, error = %err, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(DevUpdateError::Connection {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl Transport for HttpTransport {
    fn get_text(&self, url: &Url) -> Result<String, DevUpdateError> {
        let response = self.send_with_retries(url, || self.client.get(url.clone()))?;
        if !response.status().is_success() {
            return Err(DevUpdateError::ListingUnavailable {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.text().map_err(|err| DevUpdateError::Connection {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    fn open(&self, url: &Url) -> Result<RemoteFile, DevUpdateError> {
        let response = self.send_with_retries(url, || self.client.get(url.clone()))?;
        if !response.status().is_success() {
            return Err(DevUpdateError::Connection {
                url: url.to_string(),
                message: format!("server returned status {}", response.status().as_u16()),
            });
        }
        Ok(RemoteFile {
            url: response.url().clone(),
            size: response.content_length(),
            body: Box::new(response),
        })
    }

    fn exists(&self, url: &Url) -> bool {
        match self.client.head(url.clone()).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(%url, error = %err, "probe failed");
                false
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
