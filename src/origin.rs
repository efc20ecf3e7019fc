//! Issues ranged GETs against the remote origin and exposes a restartable,
//! lazy byte stream plus the headers needed to resolve `totalSize`.

use anyhow::{Context, Result, anyhow};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use std::time::Duration;

pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub stream: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl OriginResponse {
    /// The authoritative total resource size: the `/total` suffix of
    /// `Content-Range` for a `206`, or `Content-Length` for a `200`.
    pub fn total_size(&self) -> Option<u64> {
        if self.status == StatusCode::PARTIAL_CONTENT {
            self.content_range.as_deref().and_then(parse_content_range_total)
        } else {
            self.content_length
        }
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|s| s.parse().ok())
}

#[derive(Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    inactivity_timeout: Duration,
}

impl OriginFetcher {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            inactivity_timeout,
        }
    }

    /// Issues `GET url`, forwarding `range` as the `Range` header when present.
    /// Any status other than `200`/`206` is treated as a fetch failure.
    pub async fn fetch(&self, url: &str, range: Option<&str>) -> Result<OriginResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }

        let response = tokio::time::timeout(self.inactivity_timeout, request.send())
            .await
            .context("origin connect timed out")?
            .context("origin request failed")?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(anyhow!("origin returned unexpected status {status}"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let timeout = self.inactivity_timeout;
        let mut upstream = response.bytes_stream();
        let stream = try_stream! {
            loop {
                match tokio::time::timeout(timeout, upstream.next()).await {
                    Ok(Some(Ok(bytes))) => yield bytes,
                    Ok(Some(Err(err))) => Err(anyhow::Error::from(err)).context("origin stream read failed")?,
                    Ok(None) => break,
                    Err(_) => Err(anyhow!("origin read timed out after {:?} of inactivity", timeout))?,
                }
            }
        };

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            content_range,
            stream: Box::pin(stream),
        })
    }
}
