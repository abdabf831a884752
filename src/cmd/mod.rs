//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                     |
//! |-------------|--------------------------------------|
//! | `serve`     | `Serve`                              |
//! | `job`       | `Enqueue`, `Status`, `Cancel`        |
//! | `watch`     | `Watch`                              |
//! | `knowledge` | `Knowledge`                          |
//! | `config`    | `Config`                             |

pub mod config;
pub mod job;
pub mod knowledge;
pub mod serve;
pub mod watch;

pub use config::cmd_config;
pub use job::{cmd_cancel, cmd_enqueue, cmd_status};
pub use knowledge::cmd_knowledge;
pub use serve::cmd_serve;
pub use watch::cmd_watch;

use anyhow::Result;
use genforge::client::ApiClient;
use genforge::config::GenforgeConfig;

/// Server URL: `--server`/`GENFORGE_SERVER`, else the configured bind address.
pub fn server_url(explicit: Option<&str>, config: &GenforgeConfig) -> String {
    if let Some(url) = explicit {
        return url.trim_end_matches('/').to_string();
    }
    let host = match config.toml.server.host.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        host => host,
    };
    format!("http://{}:{}", host, config.port())
}

pub fn api_client(explicit: Option<&str>, config: &GenforgeConfig) -> Result<ApiClient> {
    ApiClient::new(server_url(explicit, config))
}
