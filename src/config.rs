use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::api_key::{ApiKey, parse_api_key};

pub const DEFAULT_MAX_UPDATE_BODY_BYTES: u64 = 64 * 1024 * 1024;
pub const MAX_UPDATE_BODY_BYTES_CEILING: u64 = 1024 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "statelog",
    about = "Shared counter/message service with a durable audit log",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server (default).
    Run,

    /// Create the audit log database if missing, report its size and exit.
    Init,
}

#[derive(Args, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "STATELOG_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8000"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "STATELOG_DB_PATH",
        value_name = "PATH",
        default_value = "./data/logs.db"
    )]
    pub db_path: PathBuf,

    /// Shared secret required in the X-API-KEY header of POST /update.
    #[arg(
        long,
        global = true,
        env = "API_KEY",
        value_name = "SECRET",
        default_value = "",
        hide_env_values = true
    )]
    pub api_key: String,

    /// Largest accepted POST /update body. Bigger bodies get 413.
    #[arg(
        long = "max-update-body-bytes",
        global = true,
        env = "STATELOG_MAX_UPDATE_BODY_BYTES",
        value_name = "BYTES",
        default_value_t = DEFAULT_MAX_UPDATE_BODY_BYTES,
        value_parser = clap::value_parser!(u64).range(1..=MAX_UPDATE_BODY_BYTES_CEILING)
    )]
    pub max_update_body_bytes: u64,
}

impl Config {
    pub fn api_key(&self) -> Option<ApiKey> {
        parse_api_key(&self.api_key)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("db_path", &self.db_path)
            .field("api_key", &self.api_key().map(|_| "<redacted>"))
            .field("max_update_body_bytes", &self.max_update_body_bytes)
            .finish()
    }
}
