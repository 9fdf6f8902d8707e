use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Secret;
use crate::context::CheckContext;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_DELTA: Duration = Duration::from_secs(10);

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned HTTP {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("token endpoint returned an empty or expired token")]
    Invalid,

    #[error("failed to retrieve token after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<TokenError>,
    },

    #[error("token retrieval cancelled")]
    Cancelled,

    #[error("failed to read token file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {} is empty", .path.display())]
    Empty { path: PathBuf },

    #[error("failed to write token: {0}")]
    Write(#[source] std::io::Error),

    #[error("invalid token JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token expired at {}", .0.to_rfc3339())]
    Expired(DateTime<Utc>),
}

// ---------- Token ----------

/// OAuth2 access token as persisted in token files.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Token {
    /// Bearer token without a known expiry.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expiry: None,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => match chrono::Duration::from_std(EXPIRY_DELTA) {
                Ok(delta) => expiry - delta > now,
                Err(_) => expiry > now,
            },
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

// ---------- Token sources ----------

/// Something that can produce an access token.
pub trait TokenSource {
    fn token(&self, ctx: &CheckContext) -> impl Future<Output = Result<Token, TokenError>> + Send;
}

/// OAuth2 Client Credentials grant against a token endpoint.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret,
    pub scopes: Vec<String>,
    pub token_url: String,
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ClientCredentials {
    pub fn from_settings(settings: &crate::config::OAuth2Settings, timeout: Duration) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scopes: settings.scopes.clone(),
            token_url: settings.token_url.clone(),
            timeout,
        }
    }

    async fn request(&self) -> Result<Token, TokenError> {
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        let scope = self.scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("scope", scope.as_str()),
        ];

        log::debug!("Requesting client credentials token from {}", self.token_url);
        let resp = http.post(&self.token_url).form(&params).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let body = match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(e) => match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                },
                Err(_) => text,
            };
            return Err(TokenError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        let body: TokenResponse = resp.json().await?;
        let expiry = body
            .expires_in
            .and_then(|secs| Utc::now().checked_add_signed(chrono::Duration::seconds(secs)));
        Ok(Token {
            access_token: body.access_token,
            token_type: body.token_type,
            expiry,
        })
    }
}

impl TokenSource for ClientCredentials {
    async fn token(&self, ctx: &CheckContext) -> Result<Token, TokenError> {
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(TokenError::Cancelled),
            res = self.request() => res,
        }
    }
}

/// Retries the wrapped source with a fixed delay, including when it hands
/// back an unusable token.
#[derive(Debug, Clone)]
pub struct Retrying<S> {
    inner: S,
    attempts: u32,
    delay: Duration,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, attempts: u32) -> Self {
        Self::with_delay(inner, attempts, DEFAULT_RETRY_DELAY)
    }

    pub fn with_delay(inner: S, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl<S: TokenSource + Sync> TokenSource for Retrying<S> {
    async fn token(&self, ctx: &CheckContext) -> Result<Token, TokenError> {
        let mut last = TokenError::Invalid;

        for attempt in 1..=self.attempts {
            match self.inner.token(ctx).await {
                Ok(token) if token.is_valid() => {
                    log::debug!("Token retrieved on attempt {attempt}/{}", self.attempts);
                    return Ok(token);
                }
                Ok(_) => {
                    log::warn!("Attempt {attempt}/{}: retrieved token is invalid", self.attempts);
                    last = TokenError::Invalid;
                }
                Err(TokenError::Cancelled) => return Err(TokenError::Cancelled),
                Err(e) => {
                    log::warn!("Attempt {attempt}/{}: failed to retrieve token: {e}", self.attempts);
                    last = e;
                }
            }

            if attempt < self.attempts && !ctx.pause(self.delay).await {
                return Err(TokenError::Cancelled);
            }
        }

        Err(TokenError::Exhausted {
            attempts: self.attempts,
            last: Box::new(last),
        })
    }
}

// ---------- Token files ----------

/// Read a token file holding either a JSON token object or a bare access
/// token. JSON tokens are checked for expiry.
pub fn read_token_file(path: &Path) -> Result<Token, TokenError> {
    let content = std::fs::read_to_string(path).map_err(|source| TokenError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let content = content.trim();
    if content.is_empty() {
        return Err(TokenError::Empty {
            path: path.to_path_buf(),
        });
    }

    if !content.contains('{') {
        log::debug!("Token file {} holds a bare access token", path.display());
        return Ok(Token::bearer(content));
    }

    let token: Token = serde_json::from_str(content)?;
    if token.is_valid() {
        return Ok(token);
    }
    match token.expiry {
        Some(expiry) => Err(TokenError::Expired(expiry)),
        None => Err(TokenError::Invalid),
    }
}

/// Serialize a token for output: full JSON object or the bare access token.
pub fn encode_token(token: &Token, as_json: bool) -> Result<Vec<u8>, TokenError> {
    if as_json {
        Ok(serde_json::to_vec_pretty(token)?)
    } else {
        Ok(token.access_token.clone().into_bytes())
    }
}

/// Write `data` to `path` readable by the owner only.
pub fn write_token_file(path: &Path, data: &[u8]) -> Result<(), TokenError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(TokenError::Write)?;
    file.write_all(data).map_err(TokenError::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        token: Token,
    }

    impl Flaky {
        fn new(fail_first: u32, token: Token) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                token,
            }
        }
    }

    impl TokenSource for Flaky {
        async fn token(&self, _ctx: &CheckContext) -> Result<Token, TokenError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(TokenError::Endpoint {
                    status: 503,
                    body: format!("unavailable ({call})"),
                })
            } else {
                Ok(self.token.clone())
            }
        }
    }

    #[test]
    fn validity_honours_expiry_delta() {
        let now = Utc::now();
        let mut token = Token::bearer("abc");
        assert!(token.is_valid_at(now));

        token.expiry = Some(now + chrono::Duration::seconds(5));
        assert!(!token.is_valid_at(now));

        token.expiry = Some(now + chrono::Duration::seconds(60));
        assert!(token.is_valid_at(now));

        assert!(!Token::bearer("").is_valid_at(now));
    }

    #[test]
    fn debug_redacts_access_token() {
        let rendered = format!("{:?}", Token::bearer("super-secret-token"));
        assert!(!rendered.contains("super-secret-token"));
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let source = Retrying::with_delay(Flaky::new(2, Token::bearer("tok")), 3, Duration::from_millis(1));
        let token = source.token(&CheckContext::default()).await.unwrap();
        assert_eq!(token.access_token, "tok");
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error() {
        let source = Retrying::with_delay(Flaky::new(5, Token::bearer("tok")), 3, Duration::from_millis(1));
        let err = source.token(&CheckContext::default()).await.unwrap_err();
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
        match err {
            TokenError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.to_string(), "token endpoint returned HTTP 503: unavailable (3)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expired_tokens_are_retried() {
        let mut expired = Token::bearer("old");
        expired.expiry = Some(Utc::now() - chrono::Duration::seconds(30));
        let source = Retrying::with_delay(Flaky::new(0, expired), 2, Duration::from_millis(1));
        let err = source.token(&CheckContext::default()).await.unwrap_err();
        assert!(matches!(err, TokenError::Exhausted { ref last, .. } if matches!(**last, TokenError::Invalid)));
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let ctx = CheckContext::default();
        ctx.cancellation().cancel();
        let source = Retrying::with_delay(Flaky::new(5, Token::bearer("tok")), 3, Duration::from_secs(5));
        assert!(matches!(source.token(&ctx).await, Err(TokenError::Cancelled)));
    }

    #[test]
    fn token_file_formats() {
        let dir = tempfile::tempdir().unwrap();

        let raw = dir.path().join("raw.txt");
        std::fs::write(&raw, "plain-token\n").unwrap();
        assert_eq!(read_token_file(&raw).unwrap().access_token, "plain-token");

        let mut token = Token::bearer("json-token");
        token.expiry = Some(Utc::now() + chrono::Duration::hours(1));
        let json = dir.path().join("token.json");
        write_token_file(&json, &encode_token(&token, true).unwrap()).unwrap();
        assert_eq!(read_token_file(&json).unwrap(), token);

        token.expiry = Some(Utc::now() - chrono::Duration::hours(1));
        write_token_file(&json, &encode_token(&token, true).unwrap()).unwrap();
        assert!(matches!(read_token_file(&json), Err(TokenError::Expired(_))));

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(matches!(read_token_file(&empty), Err(TokenError::Empty { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        write_token_file(&path, b"tok").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
