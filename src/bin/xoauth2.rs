//! Print the XOAUTH2 initial client response for a mailbox and token.

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;

use check_mail::config::Xoauth2Args;
use check_mail::imap::auth::xoauth2_initial_response;
use check_mail::logging;

fn main() {
    let args = Xoauth2Args::parse();
    logging::init_stderr(args.log_level);

    let response = xoauth2_initial_response(&args.username, &args.token);
    if args.encode {
        println!("{}", STANDARD.encode(response));
    } else {
        log::debug!("Emitting unencoded response; separators are \\x01 bytes");
        println!("{response}");
    }
}
