//! Client subcommands: thin wrappers over `HttpBackend` that print JSON.

use std::io::Read;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

use benchsync_client::{HttpBackend, SyncBackend};
use benchsync_core::session::{FileKeyStorage, SessionIdentity};
use benchsync_core::{LogEntry, ModuleKind, ModuleState, NewLogEntry, SessionKey, SyncError, WriteRequest};

use crate::cli::{ClientOpts, LogCommand, StageOpts, StateCommand, default_profile_dir};

fn session_key(opts: &ClientOpts) -> SessionKey {
    let dir = opts.profile_dir.clone().unwrap_or_else(default_profile_dir);
    let identity = SessionIdentity::new(FileKeyStorage::in_dir(&dir));
    let key = identity.get_or_create();
    if !identity.is_durable() {
        tracing::warn!(
            profile = %dir.display(),
            "session key could not be persisted; using a temporary key"
        );
    }
    key
}

fn backend(opts: &ClientOpts) -> HttpBackend {
    let backend = HttpBackend::new(opts.server.clone(), session_key(opts));
    match &opts.actor {
        Some(actor) => backend.with_actor_id(actor.clone()),
        None => backend,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn cmd_session(opts: &ClientOpts) -> anyhow::Result<()> {
    println!("{}", session_key(opts));
    Ok(())
}

pub async fn cmd_state(command: StateCommand) -> anyhow::Result<()> {
    match command {
        StateCommand::Get { client, module } => {
            let loaded = backend(&client).load_state(module).await?;
            print_json(&loaded)
        }
        StateCommand::Put {
            client,
            module,
            payload,
            expected_version,
        } => {
            let state = read_payload(module, &payload)?;
            let backend = backend(&client);
            let expected_version = match expected_version {
                Some(version) => version,
                None => backend
                    .load_state(module)
                    .await?
                    .map_or(0, |stored| stored.version),
            };

            match backend
                .write_state(
                    module,
                    WriteRequest {
                        state,
                        expected_version,
                    },
                )
                .await
            {
                Ok(written) => print_json(&written),
                Err(SyncError::Conflict { expected_version: stored }) => anyhow::bail!(
                    "{module} is at version {stored}, not {expected_version}; \
                     review it with `benchsync state get {module}` and retry with --expected-version {stored}"
                ),
                Err(err) => Err(err.into()),
            }
        }
        StateCommand::History {
            client,
            module,
            limit,
        } => {
            let events = backend(&client).history(module, limit).await?;
            print_json(&events)
        }
    }
}

/// Parse and validate locally so a bad payload never reaches the server.
fn read_payload(module: ModuleKind, raw: &str) -> anyhow::Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading payload from stdin")?;
        buf
    } else {
        raw.to_owned()
    };
    let value: Value = serde_json::from_str(&text).context("payload is not valid JSON")?;
    Ok(ModuleState::parse(module, value)?.to_value()?)
}

pub async fn cmd_peers(opts: &StageOpts) -> anyhow::Result<()> {
    let peers = backend(&opts.client).list_peers(&opts.stage).await?;
    print_json(&peers)
}

pub async fn cmd_heartbeat(opts: &StageOpts) -> anyhow::Result<()> {
    let response = backend(&opts.client).heartbeat(&opts.stage).await?;
    print_json(&response)
}

pub async fn cmd_log(command: LogCommand) -> anyhow::Result<()> {
    match command {
        LogCommand::List(client) => {
            let entries = backend(&client).fetch_log().await?;
            for entry in &entries {
                println!("{}", format_log_line(entry));
            }
            Ok(())
        }
        LogCommand::Append {
            client,
            stage,
            title,
            action,
            details,
        } => {
            let mut entry = NewLogEntry::new(stage, title, action);
            entry.details = details;
            entry.validate()?;
            let confirmed = backend(&client).append_log(entry).await?;
            print_json(&confirmed)
        }
    }
}

pub(crate) fn format_log_line(entry: &LogEntry) -> String {
    let timestamp = entry
        .timestamp
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    match &entry.details {
        Some(details) => format!(
            "{timestamp}  {:<14} {}  ({details})",
            entry.stage_title, entry.action
        ),
        None => format!("{timestamp}  {:<14} {}", entry.stage_title, entry.action),
    }
}
