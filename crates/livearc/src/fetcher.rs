//! Fragment Fetcher: one HTTP GET per attempt, classified into success or a
//! FetchFailure the retry policy understands.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HOST, HeaderValue, ORIGIN, REFERER};
use tracing::trace;

use crate::policy::FetchFailure;

/// Header carrying the newest sequence number the server can serve.
pub const HEAD_SEQNUM_HEADER: &str = "x-head-seqnum";

/// A 2xx/3xx response with a non-empty body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub body: Bytes,
    pub head_seqnum: Option<u64>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait FragmentSource: Send + Sync {
    /// Fetch a single fragment. `host` is the authority of the current
    /// download URL, used for the identifying headers.
    async fn fetch(&self, url: &str, host: Option<&str>) -> Result<FetchedBody, FetchFailure>;
}

pub struct HttpFragmentSource {
    http_client: Client,
    origin: String,
}

impl HttpFragmentSource {
    pub fn new(http_client: Client, origin: impl Into<String>) -> Self {
        Self {
            http_client,
            origin: origin.into(),
        }
    }
}

fn parse_head_seqnum(value: Option<&HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

#[async_trait]
impl FragmentSource for HttpFragmentSource {
    async fn fetch(&self, url: &str, host: Option<&str>) -> Result<FetchedBody, FetchFailure> {
        let mut request = self.http_client.get(url);
        if let Some(host) = host {
            request = request
                .header(HOST, host)
                .header(REFERER, format!("https://{host}/"));
        }
        if !self.origin.is_empty() {
            request = request.header(ORIGIN, &self.origin);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))?;

        let status = response.status();
        let head_seqnum = parse_head_seqnum(response.headers().get(HEAD_SEQNUM_HEADER));
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // Drain the body either way so the connection can be reused.
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))?;

        if status.as_u16() >= 400 {
            return Err(FetchFailure::Status(status.as_u16()));
        }
        if body.is_empty() {
            return Err(FetchFailure::EmptyBody);
        }

        trace!(
            url,
            status = status.as_u16(),
            bytes = body.len(),
            head_seqnum = ?head_seqnum,
            "Fragment fetched"
        );

        Ok(FetchedBody {
            body,
            head_seqnum,
            content_type,
        })
    }
}
