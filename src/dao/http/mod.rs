mod client;
mod config;
mod error;

pub use client::HttpAuthority;
pub use config::HttpAuthorityConfig;
pub use error::{HttpAuthorityError, HttpResult};
