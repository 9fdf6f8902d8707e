//! IMAP mailbox checks for Nagios and scheduled email reports.

pub mod config;
pub mod context;
pub mod cycle;
pub mod error;
pub mod imap;
pub mod logging;
pub mod nagios;
pub mod oauth;
pub mod report;
pub mod sanitize;
