use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::imap::types::MailboxCheckResults;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to create report directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open report file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything one account contributes to a report.
#[derive(Debug, Clone)]
pub struct ReportData<'a> {
    pub account_name: &'a str,
    pub results: &'a MailboxCheckResults,
    pub report_time: DateTime<Local>,
    pub placeholder: &'a str,
}

/// `<account>-emails-report-YYYY-MM-DD-HH_MM.txt`
pub fn report_file_name(account_name: &str, report_time: DateTime<Local>) -> String {
    format!(
        "{account_name}-emails-report-{}.txt",
        report_time.format("%Y-%m-%d-%H_%M")
    )
}

/// Textile body for one account.
pub fn render(data: &ReportData<'_>) -> String {
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = write!(
        out,
        "\nh4. {account}\n\n\
         h5. Overview\n\n\
         | Report generated | {generated} |\n\
         | Summary | {summary} |\n\
         | Placeholder character | {placeholder} (substituted for Emoji incompatible with MySQL utf8mb3 character set) |\n\n\
         h5. Emails found\n\n\
         |_.Folder|_.Subject|_.Date|\n",
        account = data.account_name,
        generated = data.report_time.format("%Y-%m-%d %H:%M:%S"),
        summary = data.results.messages_found_summary(),
        placeholder = data.placeholder,
    );

    for mailbox in data.results {
        for message in &mailbox.messages {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                mailbox.mailbox_name,
                message.display_subject(),
                message.envelope_date_formatted
            );
        }
    }

    out.push_str(
        "\nh5. Reported emails\n\n\
         |_.Folder|_.Subject|_.Date|_.Reported on|\n\
         | PLACEHOLDER | PLACEHOLDER | PLACEHOLDER | PLACEHOLDER |\n\n\
         h5. Emails moved to applicable folders\n\n\
         |_.Folder|_.Subject|_.Date|\n\
         | PLACEHOLDER | PLACEHOLDER | PLACEHOLDER |\n\n\
         h5. Deleted emails\n\n\
         |_.Folder|_.Subject|_.Date|\n\
         | PLACEHOLDER | PLACEHOLDER | PLACEHOLDER |\n",
    );
    out
}

/// Append the account's section to its report file under `dir`, creating
/// the directory (0700) and file (0600) as needed.
pub fn write_report(data: &ReportData<'_>, dir: &Path) -> Result<PathBuf, ReportError> {
    let path = dir.join(report_file_name(data.account_name, data.report_time));

    create_dir(dir).map_err(|source| ReportError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path).map_err(|source| ReportError::Open {
        path: path.clone(),
        source,
    })?;
    log::debug!("Writing report section for {} to {}", data.account_name, path.display());

    let write_failed = |source| ReportError::Write {
        path: path.clone(),
        source,
    };
    file.write_all(render(data).as_bytes()).map_err(write_failed)?;
    file.sync_all().map_err(write_failed)?;

    Ok(path)
}

fn create_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
