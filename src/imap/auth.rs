use std::fmt;
use std::sync::{Arc, Mutex};

use async_imap::{Authenticator, Client, Session};
use tokio::io::{AsyncRead, AsyncWrite};

use super::client::{probe_capabilities, Connection};
use crate::config::{OAuth2Settings, Secret};
use crate::context::CheckContext;
use crate::error::{CheckError, Xoauth2Error};
use crate::oauth::TokenSource;

const XOAUTH2: &str = "XOAUTH2";

/// Authentication failed; `stream` is handed back when the connection is
/// still usable for a raw `LOGOUT`.
pub struct AuthFailure<S> {
    pub error: CheckError,
    pub stream: Option<S>,
}

impl<S> AuthFailure<S> {
    fn new(error: CheckError, stream: Option<S>) -> Self {
        Self { error, stream }
    }
}

impl<S> fmt::Debug for AuthFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthFailure")
            .field("error", &self.error)
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .finish()
    }
}

pub type AuthResult<S> = Result<Session<S>, AuthFailure<S>>;

// ---------- XOAUTH2 authenticator ----------

/// `user=<user>\x01auth=Bearer <token>\x01\x01`
pub fn xoauth2_initial_response(user: &str, access_token: &str) -> String {
    format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
}

struct XOAuth2 {
    response: Vec<u8>,
    failure: Arc<Mutex<Option<Xoauth2Error>>>,
}

impl XOAuth2 {
    fn new(user: &str, access_token: &str) -> (Self, Arc<Mutex<Option<Xoauth2Error>>>) {
        let failure = Arc::new(Mutex::new(None));
        let auth = Self {
            response: xoauth2_initial_response(user, access_token).into_bytes(),
            failure: Arc::clone(&failure),
        };
        (auth, failure)
    }
}

impl Authenticator for XOAuth2 {
    type Response = Vec<u8>;

    fn process(&mut self, challenge: &[u8]) -> Self::Response {
        // A non-empty challenge after the initial response carries the JSON
        // error; it is answered with an empty line.
        if self.response.is_empty() && !challenge.is_empty() {
            match serde_json::from_slice::<Xoauth2Error>(challenge) {
                Ok(payload) => {
                    if let Ok(mut slot) = self.failure.lock() {
                        *slot = Some(payload);
                    }
                }
                Err(e) => log::debug!("Unparseable XOAUTH2 challenge: {e}"),
            }
        }
        std::mem::take(&mut self.response)
    }
}

// ---------- Public API ----------

/// Plaintext `LOGIN`, refused when the server advertises `LOGINDISABLED`.
pub async fn login<S>(
    ctx: &CheckContext,
    mut conn: Connection<S>,
    account: &str,
    username: &str,
    password: &Secret,
) -> AuthResult<S>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    warn_if_plaintext(&conn);

    let caps = match probe_capabilities(ctx, &mut conn).await {
        Ok(caps) => caps,
        Err(error) => return Err(AuthFailure::new(error, Some(conn.stream))),
    };
    if caps.login_disabled() {
        let error = CheckError::LoginDisabled {
            server: conn.server.clone(),
        };
        return Err(AuthFailure::new(error, Some(conn.stream)));
    }

    log::debug!("{account}: logging in as {username}");
    let client = Client::new(conn.stream);
    match ctx.bounded("LOGIN", client.login(username, password.expose())).await {
        Ok(Ok(session)) => {
            log::debug!("{account}: logged in");
            Ok(session)
        }
        Ok(Err((e, client))) => Err(AuthFailure::new(
            CheckError::Auth {
                account: account.to_string(),
                reason: e.to_string(),
            },
            Some(client.into_inner()),
        )),
        // The stream is owned by the abandoned LOGIN future; closing the
        // socket is the only cleanup left.
        Err(error) => Err(AuthFailure::new(error, None)),
    }
}

/// XOAUTH2 using a token from `tokens`, requested exactly once.
pub async fn authenticate_oauth2<S, T>(
    ctx: &CheckContext,
    mut conn: Connection<S>,
    account: &str,
    settings: &OAuth2Settings,
    tokens: &T,
) -> AuthResult<S>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    T: TokenSource,
{
    warn_if_plaintext(&conn);

    log::debug!("{account}: requesting OAuth2 token");
    let token = match tokens.token(ctx).await {
        Ok(token) => token,
        Err(source) => {
            let error = CheckError::TokenAcquisition {
                account: account.to_string(),
                source,
            };
            return Err(AuthFailure::new(error, Some(conn.stream)));
        }
    };
    log::debug!("{account}: token acquired (type {})", token.token_type);

    let caps = match probe_capabilities(ctx, &mut conn).await {
        Ok(caps) => caps,
        Err(error) => return Err(AuthFailure::new(error, Some(conn.stream))),
    };
    if !caps.supports_auth(XOAUTH2) {
        let error = CheckError::UnsupportedMechanism {
            server: conn.server.clone(),
            mechanism: XOAUTH2,
        };
        return Err(AuthFailure::new(error, Some(conn.stream)));
    }

    let (authenticator, failure) = XOAuth2::new(&settings.shared_mailbox, &token.access_token);
    let client = Client::new(conn.stream);
    match ctx
        .bounded("AUTHENTICATE XOAUTH2", client.authenticate(XOAUTH2, authenticator))
        .await
    {
        Ok(Ok(session)) => {
            log::debug!("{account}: authenticated as {}", settings.shared_mailbox);
            Ok(session)
        }
        Ok(Err((e, client))) => {
            let payload = failure.lock().ok().and_then(|mut slot| slot.take());
            let error = match payload {
                Some(source) => CheckError::Xoauth2 {
                    account: account.to_string(),
                    source,
                },
                None => CheckError::Auth {
                    account: account.to_string(),
                    reason: e.to_string(),
                },
            };
            Err(AuthFailure::new(error, Some(client.into_inner())))
        }
        // As with LOGIN, a timed-out exchange leaves only the socket close.
        Err(error) => Err(AuthFailure::new(error, None)),
    }
}

fn warn_if_plaintext<S>(conn: &Connection<S>) {
    if !conn.tls {
        log::warn!(
            "Connection to {} ({}) is not TLS protected; credentials will be sent in the clear",
            conn.server,
            conn.peer
        );
    }
}
