//! CLI definition using clap derive.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use benchsync_core::ModuleKind;

#[derive(Parser)]
#[command(
    name = "benchsync",
    about = "Versioned module state, presence, and activity log for analyst workbenches"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the sync server
    Serve(ServeOpts),
    /// Read or write module state
    #[command(subcommand)]
    State(StateCommand),
    /// List live peers on a stage
    Peers(StageOpts),
    /// Send one heartbeat and print the peer list
    Heartbeat(StageOpts),
    /// Read or append the activity log
    #[command(subcommand)]
    Log(LogCommand),
    /// Print this profile's session key
    Session(ClientOpts),
}

#[derive(Args)]
pub struct ServeOpts {
    /// Address to listen on
    #[arg(long, env = "BENCHSYNC_BIND", default_value = "127.0.0.1:7878")]
    pub bind: SocketAddr,

    /// SQLite database path (default: $XDG_DATA_HOME/benchsync/benchsync.db)
    #[arg(long, env = "BENCHSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Seconds without a heartbeat before a peer disappears
    #[arg(long, default_value = "45", value_parser = clap::value_parser!(u32).range(1..))]
    pub presence_ttl_secs: u32,

    /// Activity-log entries kept per session
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
    pub log_cap: u32,
}

#[derive(Args, Clone)]
pub struct ClientOpts {
    /// Server base URL
    #[arg(long, env = "BENCHSYNC_SERVER", default_value = "http://127.0.0.1:7878")]
    pub server: String,

    /// Directory holding the session key file
    #[arg(long, env = "BENCHSYNC_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,

    /// Actor id sent with each request (default: the session key)
    #[arg(long, env = "BENCHSYNC_ACTOR")]
    pub actor: Option<String>,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Print the module's current state and version
    Get {
        #[command(flatten)]
        client: ClientOpts,
        module: ModuleKind,
    },
    /// Write a new state for the module
    Put {
        #[command(flatten)]
        client: ClientOpts,
        module: ModuleKind,
        /// JSON payload, or '-' to read it from stdin
        payload: String,
        /// Version the write is based on (default: the current stored version)
        #[arg(long)]
        expected_version: Option<u64>,
    },
    /// Print accepted writes, newest first
    History {
        #[command(flatten)]
        client: ClientOpts,
        module: ModuleKind,
        /// Number of entries (1-100, default 20)
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args)]
pub struct StageOpts {
    #[command(flatten)]
    pub client: ClientOpts,
    /// Stage slug, e.g. "valuation"
    pub stage: String,
}

#[derive(Subcommand)]
pub enum LogCommand {
    /// Print the session's activity log
    List(ClientOpts),
    /// Append one entry
    Append {
        #[command(flatten)]
        client: ClientOpts,
        stage: String,
        /// Human-readable stage title
        #[arg(long)]
        title: String,
        action: String,
        #[arg(long)]
        details: Option<String>,
    },
}

/// Default database path, per-user.
pub fn default_db_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("benchsync").join("benchsync.db");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local/share/benchsync")
            .join("benchsync.db");
    }
    user_tmp_dir().join("benchsync.db")
}

/// Default profile directory for the session key file.
pub fn default_profile_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("benchsync");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/benchsync");
    }
    user_tmp_dir()
}

fn user_tmp_dir() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/benchsync-{user}"))
}
