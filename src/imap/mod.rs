pub mod auth;
pub mod client;
pub mod mailbox;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
