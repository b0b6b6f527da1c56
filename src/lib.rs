#![recursion_limit = "128"]

extern crate crypto;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate slog;
extern crate slog_async;
extern crate slog_term;

pub mod driver;
pub mod error_helpers;
pub mod errors;
pub mod message;
pub mod queue;
pub mod retry;
pub mod sql;
pub mod stats;
#[cfg(test)]
mod test_helpers;
pub mod time_helpers;
pub mod worker;
