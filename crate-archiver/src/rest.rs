use std::time::Duration;

use hagfish_types::{ChannelId, MessageId, ReactionKind, UserId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::rate::RateLimiter;

const API_BASE: &str = "https://discord.com/api/v9/";
const BACKOFF_STEP: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// which archived-thread listing to page through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivedScope {
    Public,
    Private,
    JoinedPrivate,
}

/// one account's rest pipeline
pub struct Api {
    http: reqwest::Client,
    base: Url,
    auth: String,
    limiter: RateLimiter,
    shutdown: CancellationToken,
}

/// a finished request: status, parsed body, and the endpoint's rate window
pub struct ApiResponse {
    pub status: StatusCode,
    body: Option<Value>,
    reset: Option<Instant>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.body {
            Some(body) => Ok(serde_json::from_value(body.clone())?),
            None => Err(Error::BadStatic("response body was not consumed")),
        }
    }

    /// await the endpoint's rate window before the next request on it
    pub async fn reset_gate(&self) {
        if let Some(at) = self.reset {
            tokio::time::sleep_until(at).await;
        }
    }
}

impl Api {
    pub fn new(auth: String, shutdown: CancellationToken) -> Api {
        Api {
            http: reqwest::Client::new(),
            base: Url::parse(API_BASE).expect("static url"),
            auth,
            limiter: RateLimiter::rest(),
            shutdown,
        }
    }

    /// issue a GET, retrying transient failures
    ///
    /// `abort_on_failure` skips reading the body on non-2xx and returns the
    /// bare status instead, cancelling the in-flight fetch.
    pub async fn request(
        &self,
        url: Url,
        abort_on_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let mut backoff = Duration::ZERO;
        loop {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(Error::Aborted);
            }
            self.limiter.acquire().await;

            let send = self
                .http
                .get(url.clone())
                .header("Authorization", &self.auth)
                .send();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = self.shutdown.cancelled() => return Err(Error::Aborted),
                response = send => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    warn!("transport failure for {url}: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff + BACKOFF_STEP).min(BACKOFF_CAP);
                    continue;
                }
            };

            let status = response.status();
            let reset = rate_reset(&response);

            if status == StatusCode::TOO_MANY_REQUESTS {
                let scope = response
                    .headers()
                    .get("X-RateLimit-Scope")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_owned();
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(1.0);
                debug!("rate limited ({scope} scope) on {url}, waiting {retry_after}s");
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                return Err(Error::AuthFailed);
            }

            if status.is_server_error() {
                warn!("server error {status} for {url}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff + BACKOFF_STEP).min(BACKOFF_CAP);
                continue;
            }

            if !status.is_success() && abort_on_failure {
                // drop the response without reading the body
                return Ok(ApiResponse {
                    status,
                    body: None,
                    reset,
                });
            }

            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                body = response.json::<Value>() => body,
            };
            match body {
                Ok(body) => {
                    return Ok(ApiResponse {
                        status,
                        body: Some(body),
                        reset,
                    })
                }
                Err(err) => {
                    warn!("failed reading body for {url}: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff + BACKOFF_STEP).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// one page of channel history, oldest bound exclusive, newest first
    pub async fn channel_messages(
        &self,
        channel_id: ChannelId,
        after: MessageId,
        limit: u8,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let mut url = self.base.join(&format!("channels/{channel_id}/messages"))?;
        url.query_pairs_mut()
            .append_pair("after", &after.to_string())
            .append_pair("limit", &limit.to_string());
        self.request(url, true, cancel).await
    }

    /// one page of users who placed `emoji` on a message
    pub async fn reaction_users(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
        kind: ReactionKind,
        after: UserId,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let mut url = self.base.clone();
        let channel = channel_id.to_string();
        let message = message_id.to_string();
        url.path_segments_mut()
            .map_err(|()| Error::BadStatic("api base cannot be a base url"))?
            .extend([
                "channels",
                channel.as_str(),
                "messages",
                message.as_str(),
                "reactions",
                emoji,
            ]);
        url.query_pairs_mut()
            .append_pair("after", &after.to_string())
            .append_pair("limit", "100")
            .append_pair("type", &kind.as_int().to_string());
        self.request(url, true, cancel).await
    }

    /// one page of an archived-thread listing
    pub async fn archived_threads(
        &self,
        channel_id: ChannelId,
        scope: ArchivedScope,
        before: Option<ChannelId>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let path = match scope {
            ArchivedScope::Public => format!("channels/{channel_id}/threads/archived/public"),
            ArchivedScope::Private => format!("channels/{channel_id}/threads/archived/private"),
            ArchivedScope::JoinedPrivate => {
                format!("channels/{channel_id}/users/@me/threads/archived/private")
            }
        };
        let mut url = self.base.join(&path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", "100");
            if let Some(before) = before {
                query.append_pair("before", &before.to_string());
            }
        }
        self.request(url, true, cancel).await
    }
}

/// rate window left by a response: `Some(when)` iff the endpoint is drained
fn rate_reset(response: &reqwest::Response) -> Option<Instant> {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    if header("X-RateLimit-Remaining")?.as_str() != "0" {
        return None;
    }
    let reset_after: f64 = header("X-RateLimit-Reset-After")?.parse().ok()?;
    Some(Instant::now() + Duration::from_secs_f64(reset_after))
}
