//! Nagios plugin: report whether any of the given folders hold mail.

use clap::Parser;

use check_mail::config::PluginArgs;
use check_mail::cycle::{process_account, CycleSettings};
use check_mail::logging;
use check_mail::nagios::{ExitState, State};

#[tokio::main]
async fn main() {
    let args = match PluginArgs::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let exit = ExitState::new(State::Unknown, "Invalid command-line arguments")
                .with_error(e.kind().as_str().unwrap_or("unrecognized arguments"));
            eprintln!("{e}");
            println!("{}", exit.render());
            std::process::exit(exit.exit_code());
        }
    };
    // stdout carries the status line; logs go to stderr.
    logging::init_stderr(args.common.log_level);

    let mut exit = run(&args).await;
    if args.branding {
        exit = exit.with_branding();
    }

    println!("{}", exit.render());
    std::process::exit(exit.exit_code());
}

async fn run(args: &PluginArgs) -> ExitState {
    let account = match args.account() {
        Ok(account) => account,
        Err(e) => {
            log::error!("Error initializing application: {e}");
            return ExitState::config_error(&e);
        }
    };

    let ctx = args.common.context();
    ctx.cancel_on_interrupt();

    let settings = CycleSettings {
        connect: args.common.connect_options(),
        retrieval_attempts: args.oauth2.retrieval_attempts,
        ..CycleSettings::default()
    };

    let outcome = process_account(&ctx, &account, &settings).await;
    ExitState::from_outcome(&account, &outcome)
}
