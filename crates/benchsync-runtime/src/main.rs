//! benchsync: sync server and command-line client.

use clap::Parser;

use benchsync_runtime::server;
use benchsync_runtime::service::ServiceConfig;

mod cli;
mod cmd;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // The server logs at info; client commands keep stderr quiet by default.
    let default_filter = match args.command {
        cli::Command::Serve(_) => "info",
        _ => "warn",
    };
    let filter = std::env::var("BENCHSYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        cli::Command::Serve(opts) => {
            tracing::info!("benchsync server starting");
            let db = opts.db.unwrap_or_else(cli::default_db_path);
            let config = ServiceConfig {
                presence_ttl: chrono::Duration::seconds(i64::from(opts.presence_ttl_secs)),
                log_cap: opts.log_cap as usize,
            };
            server::run_server(opts.bind, &db, config).await?;
        }
        cli::Command::State(command) => cmd::cmd_state(command).await?,
        cli::Command::Peers(opts) => cmd::cmd_peers(&opts).await?,
        cli::Command::Heartbeat(opts) => cmd::cmd_heartbeat(&opts).await?,
        cli::Command::Log(command) => cmd::cmd_log(command).await?,
        cli::Command::Session(opts) => cmd::cmd_session(&opts)?,
    }

    Ok(())
}
