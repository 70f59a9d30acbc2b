//! # Remote protocol client
//! Reqwest client for a Neynar-compatible cast gateway. Errors are normalized
//! once at this boundary into an [`ApiError`] with an explicit kind, so the
//! pipeline above never inspects nested HTTP shapes. The retry wrapper
//! handles transient failures internally and short-circuits on authorization
//! failures; throttling surfaces to the caller with the provider's retry
//! hint attached.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::FarcasterConfig;
use crate::textutil::sanitize_for_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 401/403: fatal, never retried.
    Authorization,
    /// 429: recoverable after a cooldown.
    Throttled,
    /// Network errors and 5xx: retried internally.
    Transient,
    Unknown,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (kind={kind:?}, status={status:?})")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub retry_after_ms: Option<u64>,
    pub message: String,
}

impl ApiError {
    fn from_status(status: u16, retry_after_ms: Option<u64>, message: String) -> Self {
        let kind = match status {
            401 | 403 => ApiErrorKind::Authorization,
            429 => ApiErrorKind::Throttled,
            500..=599 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            retry_after_ms,
            message,
        }
    }

    fn transport(err: reqwest::Error) -> Self {
        Self {
            kind: ApiErrorKind::Transient,
            status: None,
            retry_after_ms: None,
            message: format!("transport error: {err}"),
        }
    }

    fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Unknown,
            status: None,
            retry_after_ms: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cast {
    pub hash: String,
    pub text: String,
    pub author_fid: u64,
    pub author_username: Option<String>,
    pub timestamp: String,
    pub parent_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub fid: u64,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MentionsPage {
    pub items: Vec<Cast>,
    pub next_cursor: Option<String>,
}

const MAX_RETRIES: usize = 4;

/// Retry transient/throttled failures with bounded, jittered waits.
/// Authorization failures propagate immediately.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if e.kind == ApiErrorKind::Authorization || attempt >= MAX_RETRIES {
                    return Err(e);
                }
                let wait_ms = match e.kind {
                    ApiErrorKind::Throttled => {
                        e.retry_after_ms.unwrap_or(0).max((attempt as u64 + 1) * 10_000)
                    }
                    _ => {
                        let base: u64 = rand::rng().random_range(300..=1_000);
                        base * (attempt as u64 + 1)
                    }
                };
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                attempt += 1;
            }
        }
    }
}

// ---- wire shapes -----------------------------------------------------------

#[derive(Serialize)]
struct PublishBody<'a> {
    signer_uuid: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeds: Option<Vec<EmbedBody>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
}

#[derive(Serialize)]
struct EmbedBody {
    url: String,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default)]
    success: bool,
    cast: Option<WireCast>,
}

#[derive(Deserialize)]
struct WireCast {
    hash: String,
    #[serde(default)]
    text: String,
    author: Option<WireAuthor>,
    #[serde(default)]
    timestamp: String,
    parent_hash: Option<String>,
}

#[derive(Deserialize)]
struct WireAuthor {
    fid: u64,
    username: Option<String>,
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct NotificationsResponse {
    #[serde(default)]
    notifications: Vec<WireNotification>,
    next: Option<WireCursor>,
}

#[derive(Deserialize)]
struct WireNotification {
    cast: Option<WireCast>,
}

#[derive(Deserialize)]
struct WireCursor {
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<WireAuthor>,
}

fn map_cast(cast: WireCast) -> Cast {
    Cast {
        hash: cast.hash,
        text: cast.text,
        author_fid: cast.author.as_ref().map(|a| a.fid).unwrap_or_default(),
        author_username: cast.author.and_then(|a| a.username),
        timestamp: cast.timestamp,
        parent_hash: cast.parent_hash,
    }
}

// ---- raw gateway -----------------------------------------------------------

pub struct FarcasterApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    signer_uuid: String,
}

impl FarcasterApi {
    pub fn new(config: &FarcasterConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("farcaster-publisher/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            signer_uuid: config.signer_uuid.clone().unwrap_or_default(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after_ms = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1_000);
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(ApiError::from_status(
            status.as_u16(),
            retry_after_ms,
            format!("gateway returned {status}: {snippet}"),
        ))
    }

    async fn publish_once(
        &self,
        text: &str,
        embeds: Option<&[String]>,
        parent: Option<&str>,
    ) -> Result<Cast, ApiError> {
        let body = PublishBody {
            signer_uuid: &self.signer_uuid,
            text,
            embeds: embeds.map(|urls| urls.iter().map(|u| EmbedBody { url: u.clone() }).collect()),
            parent,
        };
        let resp = self
            .http
            .post(format!("{}/v2/farcaster/cast", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::transport)?;
        let resp = Self::check(resp).await?;
        let parsed: PublishResponse = resp.json().await.map_err(ApiError::transport)?;
        if !parsed.success {
            return Err(ApiError::protocol("publish returned unsuccessful response"));
        }
        parsed
            .cast
            .map(map_cast)
            .ok_or_else(|| ApiError::protocol("publish response missing cast"))
    }

    pub async fn create_cast(&self, text: &str, embeds: Option<&[String]>) -> Result<Cast, ApiError> {
        with_retry(|| self.publish_once(text, embeds, None)).await
    }

    pub async fn reply_to_cast(&self, parent_hash: &str, text: &str) -> Result<Cast, ApiError> {
        with_retry(|| self.publish_once(text, None, Some(parent_hash))).await
    }

    pub async fn fetch_mentions(
        &self,
        fid: u64,
        cursor: Option<&str>,
    ) -> Result<MentionsPage, ApiError> {
        with_retry(|| async {
            let mut req = self
                .http
                .get(format!("{}/v2/farcaster/notifications", self.base_url))
                .header("x-api-key", &self.api_key)
                .query(&[("fid", fid.to_string()), ("type", "mentions,replies".to_string())]);
            if let Some(c) = cursor {
                req = req.query(&[("cursor", c)]);
            }
            let resp = req.send().await.map_err(ApiError::transport)?;
            let resp = Self::check(resp).await?;
            let parsed: NotificationsResponse = resp.json().await.map_err(ApiError::transport)?;
            Ok(MentionsPage {
                items: parsed
                    .notifications
                    .into_iter()
                    .filter_map(|n| n.cast)
                    .map(map_cast)
                    .collect(),
                next_cursor: parsed.next.and_then(|n| n.cursor),
            })
        })
        .await
    }

    pub async fn fetch_user(&self, fid: u64) -> Result<Profile, ApiError> {
        with_retry(|| async {
            let resp = self
                .http
                .get(format!("{}/v2/farcaster/user/bulk", self.base_url))
                .header("x-api-key", &self.api_key)
                .query(&[("fids", fid.to_string())])
                .send()
                .await
                .map_err(ApiError::transport)?;
            let resp = Self::check(resp).await?;
            let parsed: UsersResponse = resp.json().await.map_err(ApiError::transport)?;
            let user = parsed
                .users
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::protocol(format!("unable to load profile for fid={fid}")))?;
            Ok(Profile {
                fid: user.fid,
                username: user.username.unwrap_or_default(),
                display_name: user.display_name,
            })
        })
        .await
    }
}

// ---- publish seam ----------------------------------------------------------

/// The remote publish primitive as seen by the pipeline. Tests substitute a
/// mock; production uses [`FarcasterClient`].
#[async_trait]
pub trait CastSink: Send + Sync {
    async fn create_cast(&self, text: &str, embeds: Option<&[String]>) -> Result<Cast, ApiError>;
    async fn reply_to_cast(&self, parent_hash: &str, text: &str) -> Result<Cast, ApiError>;
}

/// Gateway wrapper with profile cache, tier-limit clamp and dry-run mode.
pub struct FarcasterClient {
    pub config: Arc<FarcasterConfig>,
    api: FarcasterApi,
    profile: RwLock<Option<Profile>>,
}

impl FarcasterClient {
    pub fn new(config: Arc<FarcasterConfig>) -> Self {
        let api = FarcasterApi::new(&config);
        Self {
            config,
            api,
            profile: RwLock::new(None),
        }
    }

    /// Resolve and cache our own profile; logs a sanitized credential.
    pub async fn init(&self) -> anyhow::Result<()> {
        if self.config.dry_run {
            tracing::info!("dry-run mode, skipping profile lookup");
            return Ok(());
        }
        let profile = self.api.fetch_user(self.config.fid).await?;
        tracing::info!(
            username = %profile.username,
            fid = profile.fid,
            api_key = %sanitize_for_log(self.config.api_key.as_deref().unwrap_or("")),
            "authenticated"
        );
        *self.profile.write().expect("profile lock poisoned") = Some(profile);
        Ok(())
    }

    pub fn profile(&self) -> Option<Profile> {
        self.profile.read().expect("profile lock poisoned").clone()
    }

    pub fn username(&self) -> String {
        self.profile().map(|p| p.username).unwrap_or_else(|| "agent".to_string())
    }

    /// Clamp an outgoing text to the protocol ceiling for the account tier.
    fn normalize_outgoing(&self, text: &str) -> String {
        let max = self.config.platform_max_cast_length();
        if text.chars().count() <= max {
            return text.to_string();
        }
        tracing::warn!(max, "outgoing cast exceeded protocol ceiling, clamped");
        text.chars().take(max).collect::<String>().trim().to_string()
    }

    fn dry_run_cast(&self, hash: &str, text: String, parent_hash: Option<String>) -> Cast {
        Cast {
            hash: hash.to_string(),
            text,
            author_fid: self.config.fid,
            author_username: self.profile().map(|p| p.username),
            timestamp: chrono::Utc::now().to_rfc3339(),
            parent_hash,
        }
    }

    pub async fn mentions(&self, cursor: Option<&str>) -> Result<MentionsPage, ApiError> {
        self.api.fetch_mentions(self.config.fid, cursor).await
    }
}

#[async_trait]
impl CastSink for FarcasterClient {
    async fn create_cast(&self, text: &str, embeds: Option<&[String]>) -> Result<Cast, ApiError> {
        let safe = self.normalize_outgoing(text);
        if self.config.dry_run {
            tracing::info!(text = %safe, "[DRY_RUN] post");
            return Ok(self.dry_run_cast("dry_run_hash", safe, None));
        }
        self.api.create_cast(&safe, embeds).await
    }

    async fn reply_to_cast(&self, parent_hash: &str, text: &str) -> Result<Cast, ApiError> {
        let safe = self.normalize_outgoing(text);
        if self.config.dry_run {
            tracing::info!(parent = %parent_hash, text = %safe, "[DRY_RUN] reply");
            return Ok(self.dry_run_cast("dry_run_reply_hash", safe, Some(parent_hash.to_string())));
        }
        self.api.reply_to_cast(parent_hash, &safe).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::from_status(401, None, "x".into()).kind, ApiErrorKind::Authorization);
        assert_eq!(ApiError::from_status(403, None, "x".into()).kind, ApiErrorKind::Authorization);
        assert_eq!(ApiError::from_status(429, Some(2_000), "x".into()).kind, ApiErrorKind::Throttled);
        assert_eq!(ApiError::from_status(503, None, "x".into()).kind, ApiErrorKind::Transient);
        assert_eq!(ApiError::from_status(422, None, "x".into()).kind, ApiErrorKind::Unknown);
    }

    #[tokio::test]
    async fn retry_short_circuits_on_authorization() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), ApiError> = with_retry(|| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Err(ApiError::from_status(401, None, "denied".into())) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ApiErrorKind::Authorization);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let result = with_retry(move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(ApiError::from_status(502, None, "bad gateway".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
