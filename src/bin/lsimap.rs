//! Connect to an IMAP server and list the capabilities it advertises
//! before authentication.

use clap::Parser;

use check_mail::config::LsimapArgs;
use check_mail::error::CheckError;
use check_mail::imap::client::{connect, probe_capabilities, raw_logout};
use check_mail::logging;

#[tokio::main]
async fn main() {
    let args = LsimapArgs::parse();
    logging::init_stderr(args.common.log_level);

    if let Err(e) = run(&args).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: &LsimapArgs) -> Result<(), CheckError> {
    let ctx = args.common.context();
    ctx.cancel_on_interrupt();

    let mut conn = connect(&ctx, &args.server, args.port, &args.common.connect_options()).await?;
    log::info!("Connected to {} ({})", args.server, conn.peer);

    let caps = probe_capabilities(&ctx, &mut conn).await;

    let mut stream = conn.into_stream();
    if let Err(reason) = raw_logout(&ctx, &mut stream).await {
        log::warn!("Failed to log out from {}: {reason}", args.server);
    }

    let caps = caps?;
    println!("Capabilities of {}:{}", args.server, args.port);
    for name in caps.names() {
        println!("  {name}");
    }
    Ok(())
}
