//! Nagios plugin output: a one-line status, optional error and detail
//! sections, and the exit code the scheduler interprets.

use std::fmt;

use crate::config::{self, Account};
use crate::cycle::CycleOutcome;
use crate::error::{CheckError, Stage};

/// Line ending used in plugin output; the trailing space keeps some
/// notification templates from folding lines together.
pub const CHECK_OUTPUT_EOL: &str = " \n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl State {
    pub fn exit_code(self) -> i32 {
        match self {
            State::Ok => 0,
            State::Warning => 1,
            State::Critical => 2,
            State::Unknown => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Warning => "WARNING",
            State::Critical => "CRITICAL",
            State::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
    pub state: State,
    pub service_output: String,
    pub long_service_output: String,
    pub errors: Vec<String>,
    pub branding: Option<String>,
}

impl ExitState {
    pub fn new(state: State, message: impl fmt::Display) -> Self {
        Self {
            state,
            service_output: format!("{state}: {message}"),
            long_service_output: String::new(),
            errors: Vec::new(),
            branding: None,
        }
    }

    /// Flags or configuration could not be turned into a usable account.
    pub fn config_error(error: &config::ConfigError) -> Self {
        Self::new(State::Unknown, "Error initializing application").with_error(error)
    }

    pub fn from_outcome(account: &Account, outcome: &CycleOutcome) -> Self {
        let mut exit = match &outcome.result {
            Ok(results) if results.got_mail() => Self::new(
                State::Warning,
                format!(
                    "{}: {} messages found: {}",
                    account.name,
                    results.total_messages_found(),
                    results.messages_found_summary()
                ),
            ),
            Ok(_) => Self::new(
                State::Ok,
                format!(
                    "{}: No messages found in folders: {}",
                    account.name,
                    account.folders.join(", ")
                ),
            ),
            Err(e) => Self::from_error(account, e),
        };

        if let Some(logout) = &outcome.logout_error {
            if exit.state == State::Ok {
                exit = Self::new(State::Warning, "Error logging out");
            }
            exit.errors.push(logout.to_string());
        }
        exit
    }

    fn from_error(account: &Account, error: &CheckError) -> Self {
        let exit = match error.stage() {
            Stage::Connect => Self::new(
                State::Critical,
                format!("Error connecting to {}", account.server_addr()),
            ),
            Stage::Login => Self::new(State::Critical, "Login error occurred"),
            Stage::Validate => match error {
                CheckError::List { .. } => {
                    Self::new(State::Critical, "Error occurred listing mailboxes")
                }
                _ => Self::new(State::Critical, error),
            },
            Stage::Check => Self::new(
                State::Critical,
                format!("Error occurred checking mail: {error}"),
            ),
            Stage::Logout => Self::new(State::Warning, "Error logging out"),
            Stage::Interrupted => match error {
                CheckError::Cancelled { .. } => Self::new(State::Unknown, "Check interrupted"),
                _ => Self::new(State::Critical, error),
            },
        };
        exit.with_error(error)
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.errors.push(error.to_string());
        self
    }

    /// Append `Notification generated by <version>` to the output.
    pub fn with_branding(mut self) -> Self {
        self.branding = Some(format!("Notification generated by {}", config::version()));
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    pub fn render(&self) -> String {
        let mut out = self.service_output.clone();

        if !self.errors.is_empty() {
            out.push_str(CHECK_OUTPUT_EOL);
            out.push_str(CHECK_OUTPUT_EOL);
            out.push_str("**ERRORS**");
            out.push_str(CHECK_OUTPUT_EOL);
            for e in &self.errors {
                out.push_str(&format!("* {e}{CHECK_OUTPUT_EOL}"));
            }
        }

        if !self.long_service_output.is_empty() {
            out.push_str(CHECK_OUTPUT_EOL);
            out.push_str("**DETAILED INFO**");
            out.push_str(CHECK_OUTPUT_EOL);
            out.push_str(&self.long_service_output);
            out.push_str(CHECK_OUTPUT_EOL);
        }

        if let Some(branding) = &self.branding {
            out.push_str(CHECK_OUTPUT_EOL);
            out.push_str(branding);
            out.push_str(CHECK_OUTPUT_EOL);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountAuth, Secret};
    use crate::error::ConnectAttempt;
    use crate::imap::types::{MailboxCheckResult, MailboxCheckResults};

    fn account() -> Account {
        Account {
            name: "ops@example.com".into(),
            server: "imap.example.com".into(),
            port: 993,
            folders: vec!["Inbox".into(), "Junk".into()],
            auth: AccountAuth::Basic {
                username: "ops@example.com".into(),
                password: Secret::new("hunter2"),
            },
        }
    }

    fn found(inbox: u32, junk: u32) -> MailboxCheckResults {
        let mut inbox_result = MailboxCheckResult::empty("Inbox");
        inbox_result.items_found = inbox;
        let mut junk_result = MailboxCheckResult::empty("Junk");
        junk_result.items_found = junk;
        [inbox_result, junk_result].into_iter().collect()
    }

    fn outcome(result: Result<MailboxCheckResults, CheckError>) -> CycleOutcome {
        CycleOutcome {
            result,
            logout_error: None,
        }
    }

    #[test]
    fn empty_folders_are_ok() {
        let exit = ExitState::from_outcome(&account(), &outcome(Ok(found(0, 0))));
        assert_eq!(exit.exit_code(), 0);
        assert_eq!(exit.render(), "OK: ops@example.com: No messages found in folders: Inbox, Junk");
    }

    #[test]
    fn found_mail_warns_with_summary() {
        let exit = ExitState::from_outcome(&account(), &outcome(Ok(found(3, 1))));
        assert_eq!(exit.state, State::Warning);
        assert_eq!(
            exit.service_output,
            "WARNING: ops@example.com: 4 messages found: Inbox(3), Junk(1)"
        );
    }

    #[test]
    fn connection_failure_is_critical_with_errors_section() {
        let err = CheckError::Connection {
            server: "imap.example.com".into(),
            attempts: vec![ConnectAttempt {
                addr: "192.0.2.1:993".parse().unwrap(),
                error: "connection refused".into(),
            }],
        };
        let exit = ExitState::from_outcome(&account(), &outcome(Err(err)));
        assert_eq!(exit.exit_code(), 2);

        let rendered = exit.render();
        assert!(rendered.starts_with("CRITICAL: Error connecting to imap.example.com:993 \n \n**ERRORS** \n"));
        assert!(rendered.contains("* failed to connect to imap.example.com using any of 1 IP addresses"));
    }

    #[test]
    fn login_and_validation_status_lines() {
        let login = CheckError::Auth {
            account: "ops@example.com".into(),
            reason: "invalid credentials".into(),
        };
        let exit = ExitState::from_outcome(&account(), &outcome(Err(login)));
        assert_eq!(exit.service_output, "CRITICAL: Login error occurred");

        let missing = CheckError::FolderNotFound {
            account: "ops@example.com".into(),
            folder: "Ghost".into(),
        };
        let exit = ExitState::from_outcome(&account(), &outcome(Err(missing)));
        assert_eq!(
            exit.service_output,
            "CRITICAL: ops@example.com: mailbox not found: \"Ghost\""
        );
    }

    #[test]
    fn logout_error_downgrades_ok_only() {
        let logout = || CheckError::Logout {
            account: "ops@example.com".into(),
            reason: "connection reset".into(),
        };

        let clean = CycleOutcome {
            result: Ok(found(0, 0)),
            logout_error: Some(logout()),
        };
        let exit = ExitState::from_outcome(&account(), &clean);
        assert_eq!(exit.service_output, "WARNING: Error logging out");
        assert_eq!(exit.errors.len(), 1);

        let failed = CycleOutcome {
            result: Err(CheckError::Auth {
                account: "ops@example.com".into(),
                reason: "nope".into(),
            }),
            logout_error: Some(logout()),
        };
        let exit = ExitState::from_outcome(&account(), &failed);
        assert_eq!(exit.state, State::Critical);
        assert_eq!(exit.errors.len(), 2);
    }

    #[test]
    fn cancellation_is_unknown() {
        let err = CheckError::Cancelled {
            operation: "LIST".into(),
        };
        let exit = ExitState::from_outcome(&account(), &outcome(Err(err)));
        assert_eq!(exit.exit_code(), 3);
    }

    #[test]
    fn configuration_errors_are_unknown() {
        let err = config::ConfigError::NoFolders {
            account: "ops@example.com".into(),
        };
        let exit = ExitState::config_error(&err);
        assert_eq!(exit.exit_code(), 3);
        assert_eq!(
            exit.render(),
            "UNKNOWN: Error initializing application \n \n**ERRORS** \n* ops@example.com: no folders specified \n"
        );
    }

    #[test]
    fn branding_footer_follows_output() {
        let exit = ExitState::new(State::Ok, "fine").with_branding();
        let rendered = exit.render();
        assert!(rendered.starts_with("OK: fine \nNotification generated by check-mail "));
        assert!(rendered.ends_with(" \n"));
    }
}
