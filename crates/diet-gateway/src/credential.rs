//! IAM token lifecycle: freshness check, refresh through the token endpoint,
//! and persistence of the last issued token across restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use diet_types::credential::{Credential, DEFAULT_FRESHNESS_HOURS};

use crate::error::CredentialError;

/// Exchanges a long-lived secret for a short-lived bearer token.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<String, CredentialError>;
}

/// Yandex Cloud IAM token endpoint.
pub struct IamTokenIssuer {
    client: reqwest::Client,
    tokens_url: String,
    oauth_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamTokenResponse {
    iam_token: String,
}

impl IamTokenIssuer {
    pub fn new(client: reqwest::Client, tokens_url: impl Into<String>, oauth_token: impl Into<String>) -> Self {
        Self {
            client,
            tokens_url: tokens_url.into(),
            oauth_token: oauth_token.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for IamTokenIssuer {
    async fn issue(&self) -> Result<String, CredentialError> {
        let resp = self
            .client
            .post(&self.tokens_url)
            .json(&serde_json::json!({ "yandexPassportOauthToken": self.oauth_token }))
            .send()
            .await
            .map_err(CredentialError::refresh_failed)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::refresh_failed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body: IamTokenResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::refresh_failed(format!("unexpected response: {e}")))?;
        Ok(body.iam_token)
    }
}

/// Holds one bearer credential and keeps it fresh.
///
/// Two states: empty (never acquired) and held. A successful [`refresh`]
/// moves to held; nothing moves back.
///
/// [`refresh`]: CredentialCache::refresh
pub struct CredentialCache {
    credential: Credential,
    path: PathBuf,
    window: Duration,
    issuer: Arc<dyn TokenIssuer>,
}

impl CredentialCache {
    /// An empty cache persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            credential: Credential::empty(),
            path: path.into(),
            window: Duration::hours(DEFAULT_FRESHNESS_HOURS),
            issuer,
        }
    }

    /// Load the persisted credential if the file exists, else start empty.
    pub fn restore(path: impl Into<PathBuf>, issuer: Arc<dyn TokenIssuer>) -> Result<Self, CredentialError> {
        let mut cache = Self::new(path, issuer);
        let Some(credential) = read_persisted(&cache.path)? else {
            debug!("No persisted credential at {}", cache.path.display());
            return Ok(cache);
        };

        info!(
            "Restored credential from {} (issued at {}, held: {})",
            cache.path.display(),
            credential.issued_at,
            credential.is_held()
        );
        cache.credential = credential;
        Ok(cache)
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.credential.is_valid_at(now, self.window)
    }

    /// Fetch a new token and persist it. Errors are not retried.
    ///
    /// A failed file write is only logged: the token stays usable in memory
    /// and the next start refreshes again.
    pub async fn refresh(&mut self) -> Result<(), CredentialError> {
        self.renew().await?;
        if let Err(e) = self.persist().await {
            warn!("Failed to persist credential to {}: {e:#}", self.path.display());
        }
        Ok(())
    }

    /// Like [`refresh`](Self::refresh), but a failed file write is an error.
    pub async fn refresh_and_persist(&mut self) -> anyhow::Result<()> {
        self.renew().await?;
        self.persist()
            .await
            .with_context(|| format!("Failed to persist credential to {}", self.path.display()))
    }

    async fn renew(&mut self) -> Result<(), CredentialError> {
        let token = self.issuer.issue().await?;
        self.credential = Credential::issued(token, Utc::now());
        info!("IAM token refreshed at {}", self.credential.issued_at);
        Ok(())
    }

    /// Refresh only when the held token is missing or stale.
    pub async fn ensure_valid(&mut self) -> Result<(), CredentialError> {
        if self.is_valid() {
            return Ok(());
        }
        self.refresh().await
    }

    pub fn bearer_header(&self) -> Option<String> {
        self.credential.bearer_header()
    }

    /// Replace the file in one step: write a sibling temp file, then rename.
    async fn persist(&self) -> anyhow::Result<()> {
        let json = self.credential.to_json()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Read the persisted credential, `None` if the file does not exist.
pub fn read_persisted(path: &Path) -> Result<Option<Credential>, CredentialError> {
    let corrupt = |reason: String| CredentialError::PersistedStateCorrupt {
        path: path.to_path_buf(),
        reason,
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(corrupt(e.to_string())),
    };
    Credential::from_json(&contents)
        .map(Some)
        .map_err(|e| corrupt(e.to_string()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeIssuer {
        token: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeIssuer {
        fn ok(token: &str) -> Arc<Self> {
            Arc::new(Self {
                token: Some(token.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                token: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenIssuer for FakeIssuer {
        async fn issue(&self) -> Result<String, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token
                .clone()
                .ok_or_else(|| CredentialError::refresh_failed("connection refused"))
        }
    }

    #[test]
    fn fresh_cache_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join(".token"), FakeIssuer::ok("abc"));
        assert!(!cache.is_valid());
        assert_eq!(cache.bearer_header(), None);
    }

    #[tokio::test]
    async fn refresh_holds_token_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".token");
        let mut cache = CredentialCache::new(&file, FakeIssuer::ok("abc123"));

        cache.refresh().await.unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.bearer_header().as_deref(), Some("Bearer abc123"));

        let t0 = cache.credential().issued_at;
        assert!(cache.is_valid_at(t0 + Duration::hours(1)));
        assert!(!cache.is_valid_at(t0 + Duration::hours(13)));

        let on_disk = Credential::from_json(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(&on_disk, cache.credential());
        assert!(!temp_path(&file).exists());
    }

    #[tokio::test]
    async fn ensure_valid_refreshes_once() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = FakeIssuer::ok("abc");
        let mut cache = CredentialCache::new(dir.path().join(".token"), issuer.clone());

        cache.ensure_valid().await.unwrap();
        cache.ensure_valid().await.unwrap();
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn ensure_valid_refreshes_stale_token() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".token");
        let stale = Credential::issued("old", Utc::now() - Duration::hours(13));
        std::fs::write(&file, stale.to_json().unwrap()).unwrap();

        let issuer = FakeIssuer::ok("new");
        let mut cache = CredentialCache::restore(&file, issuer.clone()).unwrap();
        assert!(!cache.is_valid());

        cache.ensure_valid().await.unwrap();
        assert_eq!(issuer.calls(), 1);
        assert_eq!(cache.bearer_header().as_deref(), Some("Bearer new"));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".token");
        let mut cache = CredentialCache::new(&file, FakeIssuer::failing());

        let err = cache.ensure_valid().await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed { .. }));
        assert!(!cache.credential().is_held());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn restore_roundtrip_skips_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state").join(".token");
        let mut first = CredentialCache::new(&file, FakeIssuer::ok("persisted"));
        first.refresh().await.unwrap();

        let issuer = FakeIssuer::ok("other");
        let mut second = CredentialCache::restore(&file, issuer.clone()).unwrap();
        assert_eq!(second.credential(), first.credential());

        second.ensure_valid().await.unwrap();
        assert_eq!(issuer.calls(), 0);
        assert_eq!(second.bearer_header().as_deref(), Some("Bearer persisted"));
    }

    #[test]
    fn restore_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::restore(dir.path().join(".token"), FakeIssuer::ok("x")).unwrap();
        assert!(!cache.credential().is_held());
    }

    #[test]
    fn restore_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".token");
        std::fs::write(&file, "{\"token\": ").unwrap();

        let err = CredentialCache::restore(&file, FakeIssuer::ok("x")).err().unwrap();
        assert!(matches!(err, CredentialError::PersistedStateCorrupt { .. }));
    }

    #[tokio::test]
    async fn refresh_keeps_token_when_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let file = blocker.join(".token");
        let mut cache = CredentialCache::new(&file, FakeIssuer::ok("abc"));

        cache.refresh().await.unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.bearer_header().as_deref(), Some("Bearer abc"));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn refresh_and_persist_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let mut cache = CredentialCache::new(blocker.join(".token"), FakeIssuer::ok("abc"));

        let err = cache.refresh_and_persist().await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to persist credential"));
        assert!(cache.credential().is_held());
    }

    #[tokio::test]
    async fn refresh_and_persist_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".token");
        let mut cache = CredentialCache::new(&file, FakeIssuer::ok("abc"));

        cache.refresh_and_persist().await.unwrap();
        let on_disk = read_persisted(&file).unwrap().unwrap();
        assert_eq!(&on_disk, cache.credential());
    }

    #[tokio::test]
    async fn failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory cannot be replaced by a file.
        let file = dir.path().join(".token");
        std::fs::create_dir(&file).unwrap();
        std::fs::write(file.join("keep"), "x").unwrap();
        let mut cache = CredentialCache::new(&file, FakeIssuer::ok("abc"));

        assert!(cache.refresh_and_persist().await.is_err());
        assert!(!temp_path(&file).exists());
        assert!(file.join("keep").exists());
    }

    #[test]
    fn read_persisted_reports_unreadable_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_persisted(dir.path()).unwrap_err();
        assert!(matches!(err, CredentialError::PersistedStateCorrupt { .. }));
    }

    #[test]
    fn window_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CredentialCache::new(dir.path().join(".token"), FakeIssuer::ok("x"))
            .with_window(Duration::hours(1));
        let t0 = Utc::now();
        cache.credential = Credential::issued("x", t0);
        assert!(cache.is_valid_at(t0 + Duration::minutes(59)));
        assert!(!cache.is_valid_at(t0 + Duration::minutes(61)));
    }

    #[tokio::test]
    async fn iam_issuer_posts_oauth_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iam/v1/tokens"))
            .and(body_json(serde_json::json!({ "yandexPassportOauthToken": "oauth-secret" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "iamToken": "abc123",
                "expiresAt": "2024-05-02T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let issuer = IamTokenIssuer::new(
            reqwest::Client::new(),
            format!("{}/iam/v1/tokens", server.uri()),
            "oauth-secret",
        );
        assert_eq!(issuer.issue().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn iam_issuer_reports_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad oauth token"))
            .mount(&server)
            .await;

        let issuer = IamTokenIssuer::new(reqwest::Client::new(), server.uri(), "nope");
        let err = issuer.issue().await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn iam_issuer_rejects_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "x" })))
            .mount(&server)
            .await;

        let issuer = IamTokenIssuer::new(reqwest::Client::new(), server.uri(), "s");
        assert!(matches!(issuer.issue().await, Err(CredentialError::RefreshFailed { .. })));
    }
}
