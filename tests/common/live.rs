//! Live provider configuration loaded from `.env`
//!
//! - `NNTP_HOST` - Server hostname (e.g., news.example.com)
//! - `NNTP_USERNAME` - Authentication username
//! - `NNTP_PASSWORD` - Authentication password
//! - `NNTP_PORT` - NNTP over TLS port (default: 563)
//! - `NNTP_GROUP` - Group to scan (default: alt.binaries.test)

use std::time::Duration;
use usenet_indexer::ServerConfig;

/// Check if live test credentials are available
pub fn has_live_credentials() -> bool {
    dotenvy::dotenv().ok();
    std::env::var("NNTP_HOST").is_ok()
        && std::env::var("NNTP_USERNAME").is_ok()
        && std::env::var("NNTP_PASSWORD").is_ok()
}

/// Server configuration from the environment; `None` when incomplete
pub fn live_server_config() -> Option<ServerConfig> {
    dotenvy::dotenv().ok();

    let port: u16 = std::env::var("NNTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(563);

    Some(ServerConfig {
        host: std::env::var("NNTP_HOST").ok()?,
        port,
        tls: true,
        allow_insecure_tls: false,
        username: std::env::var("NNTP_USERNAME").ok(),
        password: std::env::var("NNTP_PASSWORD").ok(),
        connections: 2,
        timeout: Duration::from_secs(60),
    })
}

/// Group scanned by live tests
pub fn live_group() -> String {
    std::env::var("NNTP_GROUP").unwrap_or_else(|_| "alt.binaries.test".to_string())
}
