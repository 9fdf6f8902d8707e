use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use ini::{Ini, ParseOption, Properties};
use thiserror::Error;

use crate::context::CheckContext;

pub const APP_NAME: &str = "check-mail";
pub const APP_URL: &str = "https://github.com/atc0005/check-mail";
pub const DEFAULT_PORT: u16 = 993;
pub const DEFAULT_CONFIG_FILE: &str = "accounts.ini";
pub const DEFAULT_RETRIEVAL_ATTEMPTS: u32 = 3;
pub const DEFAULT_ACCOUNT_DELAY_SECS: u64 = 5;

const DEFAULT_SECTION: &str = "DEFAULT";

/// `check-mail 1.2.3 (https://...)`
pub fn version() -> String {
    format!("{APP_NAME} {} ({APP_URL})", env!("CARGO_PKG_VERSION"))
}

// ---------- Errors ----------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{account}: missing required setting {field:?}")]
    MissingField { account: String, field: &'static str },

    #[error("{account}: invalid server port {value:?}")]
    InvalidPort { account: String, value: String },

    #[error("{account}: invalid auth type {value:?}; expected \"basic\" or \"oauth2\"")]
    InvalidAuthType { account: String, value: String },

    #[error("{account}: no folders specified")]
    NoFolders { account: String },

    #[error("{account}: no OAuth2 scopes specified")]
    NoScopes { account: String },

    #[error("no accounts defined in {}", .path.display())]
    NoAccounts { path: PathBuf },

    #[error("unable to locate accounts.ini; searched: {}", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to load {}: {source}", .path.display())]
    Ini {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------- Value types ----------

/// IP address family used when dialing resolved server addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum NetworkType {
    #[default]
    #[value(name = "auto")]
    Auto,
    #[value(name = "tcp4")]
    Tcp4,
    #[value(name = "tcp6")]
    Tcp6,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::Auto => "auto",
            NetworkType::Tcp4 => "tcp4",
            NetworkType::Tcp6 => "tcp6",
        };
        f.write_str(s)
    }
}

/// Minimum TLS protocol version accepted during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, ValueEnum)]
pub enum TlsFloor {
    #[value(name = "tls10")]
    Tls10,
    #[value(name = "tls11")]
    Tls11,
    #[default]
    #[value(name = "tls12")]
    Tls12,
    #[value(name = "tls13")]
    Tls13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Disabled,
    Panic,
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Disabled => log::LevelFilter::Off,
            LogLevel::Panic | LogLevel::Fatal | LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AuthKind {
    #[default]
    #[value(name = "basic")]
    Basic,
    #[value(name = "oauth2")]
    OAuth2ClientCredentials,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Basic => f.write_str("basic"),
            AuthKind::OAuth2ClientCredentials => f.write_str("oauth2"),
        }
    }
}

impl AuthKind {
    fn parse(account: &str, value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthKind::Basic),
            "oauth2" => Ok(AuthKind::OAuth2ClientCredentials),
            _ => Err(ConfigError::InvalidAuthType {
                account: account.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Client Credentials grant parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuth2Settings {
    pub client_id: String,
    pub client_secret: Secret,
    /// Mailbox authenticated as, e.g. a shared mailbox address.
    pub shared_mailbox: String,
    pub scopes: Vec<String>,
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountAuth {
    Basic { username: String, password: Secret },
    OAuth2(OAuth2Settings),
}

impl AccountAuth {
    pub fn kind(&self) -> AuthKind {
        match self {
            AccountAuth::Basic { .. } => AuthKind::Basic,
            AccountAuth::OAuth2(_) => AuthKind::OAuth2ClientCredentials,
        }
    }

    /// The mailbox identity presented to the server.
    pub fn login_name(&self) -> &str {
        match self {
            AccountAuth::Basic { username, .. } => username,
            AccountAuth::OAuth2(s) => &s.shared_mailbox,
        }
    }
}

/// One mail account to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub folders: Vec<String>,
    pub auth: AccountAuth,
}

impl Account {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = |field| ConfigError::MissingField {
            account: self.name.clone(),
            field,
        };

        if self.server.trim().is_empty() {
            return Err(missing("server"));
        }
        if self.folders.is_empty() {
            return Err(ConfigError::NoFolders {
                account: self.name.clone(),
            });
        }
        match &self.auth {
            AccountAuth::Basic { username, password } => {
                if username.is_empty() {
                    return Err(missing("username"));
                }
                if password.expose().is_empty() {
                    return Err(missing("password"));
                }
            }
            AccountAuth::OAuth2(s) => {
                if s.client_id.is_empty() {
                    return Err(missing("client_id"));
                }
                if s.client_secret.expose().is_empty() {
                    return Err(missing("client_secret"));
                }
                if s.shared_mailbox.is_empty() {
                    return Err(missing("shared_mailbox"));
                }
                if s.token_url.is_empty() {
                    return Err(missing("token_url"));
                }
                if s.scopes.is_empty() {
                    return Err(ConfigError::NoScopes {
                        account: self.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// `host:port`
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Split a comma-separated list, trimming whitespace and surrounding quotes.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim_matches(|c: char| c == '"' || c.is_whitespace()))
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn flatten_list(values: &[String]) -> Vec<String> {
    values.iter().flat_map(|v| split_list(v)).collect()
}

// ---------- Command-line flags ----------

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Sets log level to one of disabled, panic, fatal, error, warn, info, debug or trace.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Limits network connections to remote mail servers to one of auto, tcp4 or tcp6.
    #[arg(long, value_enum, default_value_t = NetworkType::Auto)]
    pub net_type: NetworkType,

    /// Minimum TLS version accepted by the client.
    #[arg(long, value_enum, default_value_t = TlsFloor::Tls12)]
    pub min_tls: TlsFloor,

    /// Per-operation network timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

impl CommonArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn context(&self) -> CheckContext {
        CheckContext::new(self.timeout())
    }

    pub fn connect_options(&self) -> crate::imap::client::ConnectOptions {
        crate::imap::client::ConnectOptions {
            network_type: self.net_type,
            min_tls: self.min_tls,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct OAuth2Args {
    /// Application (client) ID registered with the authorization server.
    #[arg(long, default_value = "")]
    pub client_id: String,

    /// Client secret paired with the client ID.
    #[arg(long, default_value = "", hide_default_value = true)]
    pub client_secret: String,

    /// OAuth2 scopes, comma-separated or repeated.
    #[arg(long, value_delimiter = ',')]
    pub scopes: Vec<String>,

    /// Token endpoint of the authorization server.
    #[arg(long, default_value = "")]
    pub token_url: String,

    /// Maximum token retrieval attempts.
    #[arg(long, default_value_t = DEFAULT_RETRIEVAL_ATTEMPTS)]
    pub retrieval_attempts: u32,
}

/// Nagios plugin flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "check_imap_mailbox", version, about = "Nagios plugin used to monitor mailboxes for items")]
pub struct PluginArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Fully-qualified domain name of the remote mail server.
    #[arg(long, default_value = "")]
    pub server: String,

    /// TCP port used for TLS encrypted IMAP connections.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, value_enum, default_value_t = AuthKind::Basic)]
    pub auth_type: AuthKind,

    /// Folders or IMAP "mailboxes" to check, comma-separated or repeated.
    #[arg(long, value_delimiter = ',')]
    pub folders: Vec<String>,

    /// The account used to login to the remote mail server.
    #[arg(long, default_value = "")]
    pub username: String,

    /// The remote mail server account password.
    #[arg(long, default_value = "", hide_default_value = true)]
    pub password: String,

    /// Mailbox accessed with OAuth2 credentials.
    #[arg(long, default_value = "")]
    pub shared_mailbox: String,

    #[command(flatten)]
    pub oauth2: OAuth2Args,

    /// Emit branding details with plugin status details.
    #[arg(long)]
    pub branding: bool,
}

impl PluginArgs {
    pub fn account(&self) -> Result<Account, ConfigError> {
        let auth = match self.auth_type {
            AuthKind::Basic => AccountAuth::Basic {
                username: self.username.trim().to_string(),
                password: Secret::new(self.password.clone()),
            },
            AuthKind::OAuth2ClientCredentials => AccountAuth::OAuth2(OAuth2Settings {
                client_id: self.oauth2.client_id.trim().to_string(),
                client_secret: Secret::new(self.oauth2.client_secret.clone()),
                shared_mailbox: self.shared_mailbox.trim().to_string(),
                scopes: flatten_list(&self.oauth2.scopes),
                token_url: self.oauth2.token_url.trim().to_string(),
            }),
        };
        let account = Account {
            name: auth.login_name().to_string(),
            server: self.server.trim().to_string(),
            port: self.port,
            folders: flatten_list(&self.folders),
            auth,
        };
        account.validate()?;
        Ok(account)
    }
}

/// Report generator flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "list-emails", version, about = "Generate a Textile report of emails found in specified folders")]
pub struct ReporterArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// INI file with account definitions.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Directory where generated reports are written.
    #[arg(long, default_value = "reports")]
    pub report_file_dir: PathBuf,

    /// Directory where log files are written.
    #[arg(long, default_value = "log")]
    pub log_file_dir: PathBuf,

    /// Seconds to wait between processing accounts.
    #[arg(long, default_value_t = DEFAULT_ACCOUNT_DELAY_SECS)]
    pub account_delay: u64,

    /// Maximum token retrieval attempts for OAuth2 accounts.
    #[arg(long, default_value_t = DEFAULT_RETRIEVAL_ATTEMPTS)]
    pub retrieval_attempts: u32,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "fetch-token", version, about = "Obtain an OAuth2 token using the Client Credentials flow")]
pub struct FetchTokenArgs {
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub oauth2: OAuth2Args,

    /// Write the token to this file instead of stdout.
    #[arg(long)]
    pub filename: Option<PathBuf>,

    /// Emit the full token object as JSON instead of the bare access token.
    #[arg(long)]
    pub json_output: bool,

    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

impl FetchTokenArgs {
    pub fn settings(&self) -> Result<crate::oauth::ClientCredentials, ConfigError> {
        let missing = |field| ConfigError::MissingField {
            account: "fetch-token".to_string(),
            field,
        };
        if self.oauth2.client_id.trim().is_empty() {
            return Err(missing("client_id"));
        }
        if self.oauth2.client_secret.is_empty() {
            return Err(missing("client_secret"));
        }
        if self.oauth2.token_url.trim().is_empty() {
            return Err(missing("token_url"));
        }
        let scopes = flatten_list(&self.oauth2.scopes);
        if scopes.is_empty() {
            return Err(ConfigError::NoScopes {
                account: "fetch-token".to_string(),
            });
        }
        Ok(crate::oauth::ClientCredentials {
            client_id: self.oauth2.client_id.trim().to_string(),
            client_secret: Secret::new(self.oauth2.client_secret.clone()),
            scopes,
            token_url: self.oauth2.token_url.trim().to_string(),
            timeout: Duration::from_secs(self.timeout.max(1)),
        })
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "read-token", version, about = "Read a cached OAuth2 token and print the access token")]
pub struct ReadTokenArgs {
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Token file written by fetch-token.
    #[arg(long)]
    pub filename: PathBuf,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "lsimap", version, about = "List IMAP server capabilities")]
pub struct LsimapArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long)]
    pub server: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "xoauth2", version, about = "Generate an XOAUTH2 initial client response")]
pub struct Xoauth2Args {
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Mailbox the token grants access to.
    #[arg(long)]
    pub username: String,

    /// Access token value.
    #[arg(long)]
    pub token: String,

    /// Base64-encode the generated string.
    #[arg(long)]
    pub encode: bool,
}

// ---------- INI accounts file ----------

/// Find the accounts file: the explicit path if given, otherwise
/// `accounts.ini` next to the executable, then in the user config directory.
pub fn locate_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let mut candidates = Vec::new();
    if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        candidates.push(dir.join(DEFAULT_CONFIG_FILE));
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join(APP_NAME).join(DEFAULT_CONFIG_FILE));
    }

    for candidate in &candidates {
        log::debug!("Looking for accounts file at {}", candidate.display());
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }

    Err(ConfigError::NotFound {
        searched: candidates,
    })
}

pub fn load_accounts(path: &Path) -> Result<Vec<Account>, ConfigError> {
    // Backslashes are literal: passwords and secrets must survive as typed.
    let options = ParseOption {
        enabled_escape: false,
        ..ParseOption::default()
    };
    let ini = Ini::load_from_file_opt(path, options).map_err(|source| ConfigError::Ini {
        path: path.to_path_buf(),
        source,
    })?;
    let accounts = accounts_from_ini(&ini)?;
    if accounts.is_empty() {
        return Err(ConfigError::NoAccounts {
            path: path.to_path_buf(),
        });
    }
    log::debug!("Loaded {} account(s) from {}", accounts.len(), path.display());
    Ok(accounts)
}

/// Section lookups that fall back to `[DEFAULT]`.
struct Section<'a> {
    name: &'a str,
    props: &'a Properties,
    defaults: Option<&'a Properties>,
}

impl<'a> Section<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.props
            .get(key)
            .or_else(|| self.defaults.and_then(|d| d.get(key)))
            .map(|v| v.trim().trim_matches('"'))
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&'a str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingField {
            account: self.name.to_string(),
            field: key,
        })
    }
}

pub fn accounts_from_ini(ini: &Ini) -> Result<Vec<Account>, ConfigError> {
    let defaults = ini
        .iter()
        .find(|(name, _)| name.is_some_and(|n| n.eq_ignore_ascii_case(DEFAULT_SECTION)))
        .map(|(_, props)| props);

    let mut accounts = Vec::new();
    for (name, props) in ini.iter() {
        let Some(name) = name else { continue };
        if name.eq_ignore_ascii_case(DEFAULT_SECTION) {
            continue;
        }

        let section = Section {
            name,
            props,
            defaults,
        };
        accounts.push(account_from_section(&section)?);
    }
    Ok(accounts)
}

fn account_from_section(section: &Section<'_>) -> Result<Account, ConfigError> {
    let name = section.name.to_string();
    let server = section.require("server_name")?.to_string();
    let port = match section.get("server_port") {
        Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
            account: name.clone(),
            value: raw.to_string(),
        })?,
        None => DEFAULT_PORT,
    };
    let kind = match section.get("auth_type") {
        Some(raw) => AuthKind::parse(&name, raw)?,
        None => AuthKind::Basic,
    };
    let folders = section.get("folders").map(split_list).unwrap_or_default();

    let auth = match kind {
        AuthKind::Basic => AccountAuth::Basic {
            username: section.require("username")?.to_string(),
            password: Secret::new(section.require("password")?),
        },
        AuthKind::OAuth2ClientCredentials => AccountAuth::OAuth2(OAuth2Settings {
            client_id: section.require("client_id")?.to_string(),
            client_secret: Secret::new(section.require("client_secret")?),
            shared_mailbox: section.require("shared_mailbox")?.to_string(),
            scopes: section.get("scopes").map(split_list).unwrap_or_default(),
            token_url: section.require("token_url")?.to_string(),
        }),
    };

    let account = Account {
        name,
        server,
        port,
        folders,
        auth,
    };
    account.validate()?;
    Ok(account)
}
