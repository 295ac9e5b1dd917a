//! Outbound transport to the upstream ask endpoints.
//!
//! [`UpstreamTransport`] is the seam the continuation controller talks to:
//! one call opens one upstream round and hands back its raw byte stream.
//! [`HttpTransport`] is the real implementation over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use rand::Rng;

use super::types::UpstreamRequest;
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::router::SelectedRoute;

/// Raw body of one upstream round. Dropping it releases the connection.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens upstream rounds.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send `request` to `route` and return the response body once the
    /// upstream has answered with a success status.
    async fn open(&self, route: &SelectedRoute, request: &UpstreamRequest) -> Result<ByteStream>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    origin: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, origin: impl Into<String>) -> Self {
        Self {
            client,
            origin: origin.into(),
        }
    }

    /// Build a transport with its own client, configured from `config`.
    ///
    /// No overall request timeout is set: a continued reply can legitimately
    /// stream for a long time. The controller bounds the wait for response
    /// headers and for each chunk.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self::new(client, config.origin.clone()))
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn open(&self, route: &SelectedRoute, request: &UpstreamRequest) -> Result<ByteStream> {
        let response = self
            .client
            .post(&route.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ORIGIN, &self.origin)
            .header("x-forwarded-for", spoofed_forwarded_ip())
            .header(header::USER_AGENT, random_user_agent())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %route.url, "Failed to reach upstream");
                Error::Upstream(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                url = %route.url,
                body = %body,
                "Upstream returned error"
            );
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        Ok(response.bytes_stream().map_err(Error::Upstream).boxed())
    }
}

const OPERATING_SYSTEMS: [&str; 5] = [
    "Windows NT 10.0",
    "Windows NT 6.1",
    "Mac OS X 10_15_7",
    "Ubuntu",
    "Linux x86_64",
];

/// A random public-looking IPv4 address for `x-forwarded-for`.
pub fn spoofed_forwarded_ip() -> String {
    spoofed_forwarded_ip_with(&mut rand::thread_rng())
}

fn spoofed_forwarded_ip_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(1..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8)
    )
}

/// A random desktop browser user-agent string.
pub fn random_user_agent() -> String {
    random_user_agent_with(&mut rand::thread_rng())
}

fn random_user_agent_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let os = OPERATING_SYSTEMS[rng.gen_range(0..OPERATING_SYSTEMS.len())];

    match rng.gen_range(0..4) {
        0 => {
            let version = format!(
                "{}.0.{}.{}",
                rng.gen_range(70..=126),
                rng.gen_range(1000..=9999),
                rng.gen_range(100..=999)
            );
            format!(
                "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36"
            )
        }
        1 => {
            let version = format!("{}.0", rng.gen_range(70..=100));
            format!("Mozilla/5.0 ({os}; rv:{version}) Gecko/20100101 Firefox/{version}")
        }
        2 => {
            let major = rng.gen_range(600..=615);
            let version = format!("{}.{}.{}", major, rng.gen_range(1..=9), rng.gen_range(1..=9));
            format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/{version} (KHTML, like Gecko) Version/{major}.1.2 Safari/{version}"
            )
        }
        _ => {
            let version = format!(
                "{}.0.{}.{}",
                rng.gen_range(80..=100),
                rng.gen_range(1000..=9999),
                rng.gen_range(100..=999)
            );
            format!(
                "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36 Edg/{version}"
            )
        }
    }
}
