//! Write a Textile report of the messages found in each configured account.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use check_mail::config::{self, Account, ConfigError, ReporterArgs};
use check_mail::cycle::{process_account, CycleSettings};
use check_mail::error::CheckError;
use check_mail::logging;
use check_mail::report::{self, ReportData, ReportError};

const LOG_FILE_PREFIX: &str = "list-emails";

#[derive(Debug, Error)]
enum RunError {
    #[error("failed to set up log file in {}: {source}", .dir.display())]
    LogFile {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("interrupted before all accounts were processed")]
    Interrupted,
}

#[tokio::main]
async fn main() {
    let args = ReporterArgs::parse();

    let code = match run(&args).await {
        Ok(names) => {
            println!(
                "OK: Successfully generated reports for accounts: {}",
                names.join(", ")
            );
            0
        }
        Err(e) => {
            log::error!("{e}");
            println!("{e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: &ReporterArgs) -> Result<Vec<String>, RunError> {
    let log_path = logging::init_file(args.common.log_level, &args.log_file_dir, LOG_FILE_PREFIX)
        .map_err(|source| RunError::LogFile {
            dir: args.log_file_dir.clone(),
            source,
        })?;
    log::info!("{} starting; logging to {}", config::version(), log_path.display());

    let config_file = config::locate_config_file(args.config_file.as_deref())?;
    log::info!("Loading accounts from {}", config_file.display());
    let accounts = config::load_accounts(&config_file)?;

    let ctx = args.common.context();
    ctx.cancel_on_interrupt();

    let settings = CycleSettings {
        connect: args.common.connect_options(),
        retrieval_attempts: args.retrieval_attempts,
        ..CycleSettings::default()
    };
    let delay = Duration::from_secs(args.account_delay);

    for (i, account) in accounts.iter().enumerate() {
        println!("Checking account: {}", account.name);

        let outcome = process_account(&ctx, account, &settings).await;
        let results = outcome.result?;

        let data = ReportData {
            account_name: &account.name,
            results: &results,
            report_time: chrono::Local::now(),
            placeholder: &settings.replacement,
        };
        let path = report::write_report(&data, &args.report_file_dir)?;
        log::info!("{}: report written to {}", account.name, path.display());

        if i + 1 < accounts.len() {
            log::debug!("Waiting {}s before the next account", delay.as_secs());
            if !ctx.pause(delay).await {
                return Err(RunError::Interrupted);
            }
        }
    }

    Ok(accounts.iter().map(short_name).collect())
}

/// Local part of the account's login identity.
fn short_name(account: &Account) -> String {
    let login = account.auth.login_name();
    login.split('@').next().unwrap_or(login).to_string()
}
