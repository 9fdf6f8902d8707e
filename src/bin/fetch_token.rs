//! Obtain an OAuth2 access token with the Client Credentials grant.

use std::io::Write;

use clap::Parser;

use check_mail::config::FetchTokenArgs;
use check_mail::context::CheckContext;
use check_mail::logging;
use check_mail::oauth::{self, Retrying, TokenSource};

#[tokio::main]
async fn main() {
    let args = FetchTokenArgs::parse();
    logging::init_stderr(args.log_level);

    if let Err(e) = run(&args).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: &FetchTokenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = args.settings()?;
    let ctx = CheckContext::new(credentials.timeout);
    ctx.cancel_on_interrupt();

    let source = Retrying::new(credentials, args.oauth2.retrieval_attempts);
    let token = source.token(&ctx).await?;
    log::debug!(
        "Token retrieved (type {}, expires {})",
        token.token_type,
        token
            .expiry
            .map(|e| e.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    let data = oauth::encode_token(&token, args.json_output)?;
    match &args.filename {
        Some(path) => {
            oauth::write_token_file(path, &data)?;
            log::debug!("Token written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
