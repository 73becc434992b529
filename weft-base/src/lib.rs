mod config;
mod error;

pub use config::Config;
pub use error::{err, fatal, invalid, not_found, proto, Error, ErrorKind, Result};
