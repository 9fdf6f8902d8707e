use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{Account, AccountAuth, DEFAULT_RETRIEVAL_ATTEMPTS};
use crate::context::CheckContext;
use crate::error::CheckError;
use crate::imap::auth::{authenticate_oauth2, login, AuthFailure};
use crate::imap::client::{connect, raw_logout, ConnectOptions, Connection};
use crate::imap::mailbox::{check_mail, validate_mailboxes};
use crate::imap::types::MailboxCheckResults;
use crate::oauth::{ClientCredentials, Retrying, TokenError, TokenSource};
use crate::sanitize::DEFAULT_REPLACEMENT;

/// Knobs shared by every account in a run.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub connect: ConnectOptions,
    pub retrieval_attempts: u32,
    pub replacement: String,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            retrieval_attempts: DEFAULT_RETRIEVAL_ATTEMPTS,
            replacement: DEFAULT_REPLACEMENT.to_string(),
        }
    }
}

/// What happened to one account.
///
/// A logout failure never replaces an earlier error; it is reported
/// next to whatever `result` holds.
#[derive(Debug)]
pub struct CycleOutcome {
    pub result: Result<MailboxCheckResults, CheckError>,
    pub logout_error: Option<CheckError>,
}

impl CycleOutcome {
    fn failed(error: CheckError) -> Self {
        Self {
            result: Err(error),
            logout_error: None,
        }
    }
}

/// Connect, authenticate, validate folders, check them and log out.
pub async fn process_account(
    ctx: &CheckContext,
    account: &Account,
    settings: &CycleSettings,
) -> CycleOutcome {
    log::info!(
        "{}: checking {} folder(s) on {} ({})",
        account.name,
        account.folders.len(),
        account.server_addr(),
        account.auth.kind()
    );

    let conn = match connect(ctx, &account.server, account.port, &settings.connect).await {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("{}: {e}", account.name);
            return CycleOutcome::failed(e);
        }
    };
    log::debug!("{}: connected to {}", account.name, conn.peer);

    let tokens = match &account.auth {
        AccountAuth::OAuth2(oauth) => Some(Retrying::new(
            ClientCredentials::from_settings(oauth, ctx.timeout()),
            settings.retrieval_attempts,
        )),
        AccountAuth::Basic { .. } => None,
    };

    run_session(ctx, conn, account, tokens.as_ref(), &settings.replacement).await
}

/// Everything after the transport is up. `tokens` is only consulted for
/// OAuth2 accounts.
pub async fn run_session<S, T>(
    ctx: &CheckContext,
    conn: Connection<S>,
    account: &Account,
    tokens: Option<&T>,
    replacement: &str,
) -> CycleOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    T: TokenSource,
{
    let name = account.name.as_str();

    let authenticated = match (&account.auth, tokens) {
        (AccountAuth::Basic { username, password }, _) => {
            login(ctx, conn, name, username, password).await
        }
        (AccountAuth::OAuth2(oauth), Some(tokens)) => {
            authenticate_oauth2(ctx, conn, name, oauth, tokens).await
        }
        (AccountAuth::OAuth2(_), None) => Err(AuthFailure {
            error: CheckError::TokenAcquisition {
                account: name.to_string(),
                source: TokenError::Invalid,
            },
            stream: Some(conn.into_stream()),
        }),
    };

    let mut session = match authenticated {
        Ok(session) => session,
        Err(AuthFailure { error, stream }) => {
            log::error!("{name}: {error}");
            let logout_error = match stream {
                Some(mut stream) => raw_logout(ctx, &mut stream)
                    .await
                    .err()
                    .map(|reason| logout_failed(name, reason)),
                None => None,
            };
            return CycleOutcome {
                result: Err(error),
                logout_error,
            };
        }
    };

    let result = async {
        let folders = validate_mailboxes(ctx, &mut session, name, &account.folders).await?;
        check_mail(ctx, &mut session, name, &folders, replacement).await
    }
    .await;

    match &result {
        Ok(results) => log::info!(
            "{name}: {} message(s) found: {}",
            results.total_messages_found(),
            results.messages_found_summary()
        ),
        Err(e) => log::error!("{name}: {e}"),
    }

    // Logout ignores cancellation so an interrupted run still leaves
    // cleanly; only the timeout bounds it.
    let logout_error = match tokio::time::timeout(ctx.timeout(), session.logout()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(logout_failed(name, e.to_string())),
        Err(_) => Some(logout_failed(
            name,
            format!("timed out after {}s", ctx.timeout().as_secs()),
        )),
    };
    if let Some(e) = &logout_error {
        log::warn!("{e}");
    }

    CycleOutcome {
        result,
        logout_error,
    }
}

fn logout_failed(account: &str, reason: String) -> CheckError {
    CheckError::Logout {
        account: account.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::Secret;
    use crate::error::Stage;
    use crate::imap::testing::{spawn_server, tag_of};
    use crate::oauth::Token;

    struct NoTokens;

    impl TokenSource for NoTokens {
        async fn token(&self, _ctx: &CheckContext) -> Result<Token, TokenError> {
            Err(TokenError::Invalid)
        }
    }

    fn account(folders: &[&str]) -> Account {
        Account {
            name: "ops@example.com".into(),
            server: "imap.example.com".into(),
            port: 993,
            folders: folders.iter().map(|f| f.to_string()).collect(),
            auth: AccountAuth::Basic {
                username: "ops@example.com".into(),
                password: Secret::new("hunter2"),
            },
        }
    }

    fn conn<S>(stream: S) -> Connection<S> {
        let peer: SocketAddr = "127.0.0.1:993".parse().unwrap();
        Connection::new(stream, "imap.example.com", peer, true)
    }

    /// Server that answers the whole cycle; `logout` is the tagged LOGOUT
    /// status (`OK` or `NO`).
    fn mail_server(
        login: &'static str,
        logout: &'static str,
    ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Vec<String>>) {
        spawn_server(Some("* OK IMAP4rev1 ready"), move |line| {
            let tag = tag_of(line);
            let command = line[tag.len()..].trim_start();
            let reply = if command == "CAPABILITY" {
                format!("* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\n{tag} OK CAPABILITY completed\r\n")
            } else if command.starts_with("LOGIN") {
                format!("{tag} {login} LOGIN\r\n")
            } else if command.starts_with("LIST") {
                format!(
                    "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n\
                     * LIST (\\HasNoChildren) \"/\" \"Junk\"\r\n\
                     {tag} OK LIST completed\r\n"
                )
            } else if command.starts_with("EXAMINE") {
                format!("* 0 EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-ONLY] EXAMINE completed\r\n")
            } else if command.starts_with("LOGOUT") {
                format!("* BYE logging out\r\n{tag} {logout} LOGOUT\r\n")
            } else {
                format!("{tag} BAD unexpected\r\n")
            };
            Some(reply)
        })
    }

    #[tokio::test]
    async fn empty_folders_complete_the_cycle() {
        let (client, server) = mail_server("OK", "OK");
        let outcome = run_session::<_, NoTokens>(
            &CheckContext::default(),
            conn(client),
            &account(&["inbox", "Junk"]),
            None,
            DEFAULT_REPLACEMENT,
        )
        .await;

        let results = outcome.result.unwrap();
        assert_eq!(results.messages_found_summary(), "inbox(0), Junk(0)");
        assert!(!results.got_mail());
        assert!(outcome.logout_error.is_none());

        let received = server.await.unwrap();
        assert!(received.last().unwrap().ends_with("LOGOUT"));
    }

    #[tokio::test]
    async fn missing_folder_still_logs_out() {
        let (client, server) = mail_server("OK", "OK");
        let outcome = run_session::<_, NoTokens>(
            &CheckContext::default(),
            conn(client),
            &account(&["Inbox", "Archive"]),
            None,
            DEFAULT_REPLACEMENT,
        )
        .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.stage(), Stage::Validate);
        assert!(outcome.logout_error.is_none());

        let received = server.await.unwrap();
        assert!(received.iter().all(|l| !l.contains("EXAMINE")));
        assert!(received.last().unwrap().ends_with("LOGOUT"));
    }

    #[tokio::test]
    async fn rejected_login_falls_back_to_raw_logout() {
        let (client, server) = mail_server("NO", "OK");
        let outcome = run_session::<_, NoTokens>(
            &CheckContext::default(),
            conn(client),
            &account(&["Inbox"]),
            None,
            DEFAULT_REPLACEMENT,
        )
        .await;

        let err = outcome.result.unwrap_err();
        assert!(matches!(err, CheckError::Auth { .. }));
        assert!(outcome.logout_error.is_none());

        let received = server.await.unwrap();
        assert!(received.iter().any(|l| l == "cm1 LOGOUT"));
        assert!(received.iter().all(|l| !l.contains("LIST")));
    }

    #[tokio::test]
    async fn logout_failure_is_reported_alongside_results() {
        let (client, _server) = mail_server("OK", "NO");
        let outcome = run_session::<_, NoTokens>(
            &CheckContext::default(),
            conn(client),
            &account(&["Inbox"]),
            None,
            DEFAULT_REPLACEMENT,
        )
        .await;

        assert!(outcome.result.is_ok());
        let logout = outcome.logout_error.unwrap();
        assert_eq!(logout.stage(), Stage::Logout);
    }

    #[tokio::test]
    async fn oauth2_account_without_token_source_fails_login() {
        let (client, _server) = mail_server("OK", "OK");
        let mut acct = account(&["Inbox"]);
        acct.auth = AccountAuth::OAuth2(crate::config::OAuth2Settings {
            client_id: "id".into(),
            client_secret: Secret::new("secret"),
            shared_mailbox: "shared@example.com".into(),
            scopes: vec!["https://outlook.office365.com/.default".into()],
            token_url: "https://login.example.com/token".into(),
        });

        let outcome =
            run_session::<_, NoTokens>(&CheckContext::default(), conn(client), &acct, None, DEFAULT_REPLACEMENT)
                .await;
        assert_eq!(outcome.result.unwrap_err().stage(), Stage::Login);
    }
}
