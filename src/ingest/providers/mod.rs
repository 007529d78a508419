// src/ingest/providers/mod.rs
pub mod odds;
pub mod rss;
pub mod social;

use std::time::Duration;

use anyhow::{Context, Result};

pub const USER_AGENT: &str = concat!("matchday-pulse/", env!("CARGO_PKG_VERSION"));

/// Shared client settings for source APIs.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(4))
        .timeout(timeout)
        .build()
        .context("building source http client")
}
