//! Print the access token stored in a token file.

use clap::Parser;

use check_mail::config::ReadTokenArgs;
use check_mail::logging;
use check_mail::oauth;

fn main() {
    let args = ReadTokenArgs::parse();
    logging::init_stderr(args.log_level);

    match oauth::read_token_file(&args.filename) {
        Ok(token) => {
            log::debug!("Read token from {} ({:?})", args.filename.display(), token);
            print!("{}", token.access_token);
        }
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
