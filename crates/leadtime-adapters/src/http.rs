use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Client-side request budget shared by every request made through the fetcher.
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            rate_limit: None,
        }
    }
}

/// A burst of `burst` requests, then one more every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: Duration::from_secs(60) / requests,
        })
    }
}

#[derive(Debug)]
struct RateLimiter {
    limit: RateLimit,
    budget: Mutex<Budget>,
}

#[derive(Debug)]
struct Budget {
    remaining: u32,
    // Time the most recent permit was credited.
    credited_at: Instant,
}

impl RateLimiter {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            budget: Mutex::new(Budget {
                remaining: limit.burst,
                credited_at: Instant::now(),
            }),
        }
    }

    /// Waits until a permit is available and consumes it.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                let since = budget.credited_at.elapsed();
                let earned = if self.limit.interval.is_zero() {
                    self.limit.burst
                } else {
                    u32::try_from(since.as_nanos() / self.limit.interval.as_nanos()).unwrap_or(u32::MAX)
                };
                if earned > 0 {
                    budget.remaining = budget.remaining.saturating_add(earned).min(self.limit.burst);
                    budget.credited_at += self.limit.interval.saturating_mul(earned);
                    if budget.remaining == self.limit.burst {
                        budget.credited_at = Instant::now();
                    }
                }
                if budget.remaining > 0 {
                    budget.remaining -= 1;
                    return;
                }
                self.limit.interval.saturating_sub(budget.credited_at.elapsed())
            };
            debug!(wait_ms = wait.as_millis() as u64, "request budget exhausted");
            tokio::time::sleep(wait).await;
        }
    }

    async fn remaining(&self) -> u32 {
        self.budget.lock().await.remaining
    }
}

/// How a request authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    /// `Authorization: token <value>`
    Token(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic { username, .. } => f.debug_struct("Basic").field("username", username).finish_non_exhaustive(),
            Auth::Token(_) => f.write_str("Token(..)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt JSON GETs. Failures are returned to the caller, which
/// decides whether the affected item is skipped.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let limiter = config.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit)));

        Ok(Self { client, limiter })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        auth: &Auth,
    ) -> Result<JsonValue, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .query(query);
        request = match auth {
            Auth::None => request,
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Token(token) => request.header(AUTHORIZATION, format!("token {token}")),
        };

        let span = info_span!("http_get", url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.json::<JsonValue>().await?;
            debug!(status = status.as_u16(), "fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_limit_spaces_requests_evenly() {
        let limit = RateLimit::per_minute(120).unwrap();
        assert_eq!(limit.burst, 120);
        assert_eq!(limit.interval, Duration::from_millis(500));
        assert!(RateLimit::per_minute(0).is_none());
    }

    #[tokio::test]
    async fn limiter_grants_the_burst_without_waiting() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 3,
            interval: Duration::from_secs(3600),
        });
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.remaining().await, 0);
    }

    #[tokio::test]
    async fn limiter_waits_for_the_next_interval_once_drained() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 1,
            interval: Duration::from_millis(40),
        });
        limiter.acquire().await;
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn credentials_are_not_printed() {
        let basic = Auth::Basic {
            username: "me@example.com".into(),
            password: "secret".into(),
        };
        assert!(!format!("{basic:?}").contains("secret"));
        assert_eq!(format!("{:?}", Auth::Token("ghp_x".into())), "Token(..)");
    }

    #[test]
    fn fetcher_builds_with_user_agent_and_rate_limit() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("leadtime/test".into()),
            rate_limit: RateLimit::per_minute(60),
            ..HttpClientConfig::default()
        })
        .expect("client");
        assert!(fetcher.limiter.is_some());
    }
}
