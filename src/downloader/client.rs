use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, RANGE};
use reqwest::{Client, ClientBuilder, Response, StatusCode};

use crate::errors::{AppError, Result};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Transient statuses worth another attempt. Other 4xx responses are client
/// mistakes and are surfaced immediately.
const RETRYABLE_STATUS: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

/// Pooled HTTP client with bounded retry-with-backoff on transient failures.
///
/// Connections are reused across concurrent chunk fetches; the pool is the
/// only state carried between calls. Per-call deadlines are supplied by the
/// caller since probe, chunk and fallback fetches all run under different
/// time limits.
pub struct RetryingClient {
    client: Client,
}

impl RetryingClient {
    pub fn new(max_idle_per_host: usize) -> Result<Self> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }

    /// Issues a HEAD request and reads the advertised content length.
    /// Returns `None` when the server does not report one.
    pub async fn content_length(&self, url: &str, timeout: Duration) -> Result<Option<u64>> {
        let response = self
            .execute_with_retry(|| {
                self.client
                    .head(url)
                    .header(ACCEPT, "*/*")
                    .timeout(timeout)
            })
            .await?;

        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|len| *len > 0);
        Ok(length)
    }

    /// Issues a GET, optionally for a single byte range. Range requests pin
    /// `Accept-Encoding: identity` so the returned lengths stay byte-exact.
    pub async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        timeout: Duration,
    ) -> Result<Response> {
        self.execute_with_retry(|| {
            let mut request = self
                .client
                .get(url)
                .header(ACCEPT, "*/*")
                .header(ACCEPT_ENCODING, "identity")
                .timeout(timeout);
            if let Some((start, end)) = range {
                request = request.header(RANGE, format!("bytes={start}-{end}"));
            }
            request
        })
        .await
    }

    async fn execute_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if RETRYABLE_STATUS.contains(&status) && attempt < MAX_ATTEMPTS {
                        log::warn!("attempt {attempt} got status {status}, retrying");
                        last_error =
                            Some(AppError::Download(format!("HTTP status {status}")));
                    } else {
                        return Err(AppError::Download(format!("HTTP status {status}")));
                    }
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        log::warn!("attempt {attempt} failed: {e}, retrying");
                        last_error = Some(AppError::Http(e));
                    } else {
                        return Err(AppError::Http(e));
                    }
                }
            }

            tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Download("request retries exhausted".to_string())))
    }
}
