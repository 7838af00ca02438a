mod setup;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_client::reducer::ToolState;
use tether_client::{ClientConfig, ConnectionState, Message, Presence, Session, SyncEngine};
use tether_protocol::domain::AgentEvent;
use tether_protocol::rpc::{EntryKind, SpawnResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "tether", about = "Encrypted remote control for coding agents")]
struct Cli {
    /// Server endpoint (overrides config and TETHER_ENDPOINT).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Bearer token (overrides config and TETHER_TOKEN).
    #[arg(long, global = true)]
    token: Option<String>,

    /// Directory holding the encrypted secret.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account secret, or restore one from its backup phrase.
    Login {
        /// Restore from a backup phrase instead of generating a new secret.
        #[arg(long)]
        restore: bool,
        /// Replace an existing stored secret.
        #[arg(long)]
        force: bool,
    },
    /// Print the backup phrase for the stored secret.
    Backup,
    /// List sessions.
    Sessions {
        /// Print raw JSON.
        #[arg(long)]
        json: bool,
    },
    /// Follow a session's messages until interrupted.
    Watch {
        /// Session id, id prefix, or name.
        session: String,
    },
    /// Send a message to a session.
    Send {
        /// Session id, id prefix, or name.
        session: String,
        /// Message text.
        text: String,
    },
    /// List machines.
    Machines,
    /// Start a new session on a machine.
    Spawn {
        /// Machine id, id prefix, or host name.
        machine: String,
        /// Working directory on that machine.
        directory: String,
        /// Create the directory if it does not exist.
        #[arg(long)]
        create: bool,
    },
    /// List a directory inside a session's workspace.
    Ls {
        /// Session id, id prefix, or name.
        session: String,
        /// Path to list. Defaults to the session's working directory.
        path: Option<String>,
    },
    /// Fuzzy-find files in a session's workspace.
    Find {
        /// Session id, id prefix, or name.
        session: String,
        /// Query.
        query: String,
        /// Maximum results.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load()?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = Some(state_dir);
    }

    match cli.command {
        Command::Login { restore, force } => setup::cmd_login(&config, restore, force),
        Command::Backup => setup::cmd_backup(&config),
        Command::Sessions { json } => {
            let engine = start(config).await?;
            let sessions = engine.sessions().list();
            if json {
                let rows: Vec<_> = sessions.iter().map(session_json).collect();
                print_json(&serde_json::Value::Array(rows));
            } else {
                let timeout = engine.config().disconnect_timeout();
                let online = engine.sessions().online_count(timeout);
                println!("{} sessions, {online} online", sessions.len());
                for session in sessions.iter() {
                    println!("{}", session_line(session, now_ms(), timeout));
                }
            }
            engine.dispose();
            Ok(())
        }
        Command::Watch { session } => {
            let engine = start(config).await?;
            let id = resolve_session(&engine, &session)?;
            watch_session(&engine, &id).await?;
            engine.dispose();
            Ok(())
        }
        Command::Send { session, text } => {
            let engine = start(config).await?;
            let id = resolve_session(&engine, &session)?;
            wait_connected(&engine).await?;
            let timeline = engine.session(&id)?;
            timeline.load().await?;
            let local_id = timeline.send_message(&text).await?;
            println!("Sent ({local_id})");
            engine.dispose();
            Ok(())
        }
        Command::Machines => {
            let engine = start(config).await?;
            for machine in engine.machines().list().iter() {
                let status = if machine.is_running() {
                    "running"
                } else if machine.active {
                    "online"
                } else {
                    "offline"
                };
                let platform = machine
                    .metadata
                    .as_ref()
                    .map(|m| m.platform.as_str())
                    .unwrap_or("?");
                println!(
                    "{}  {:<24} {:<8} {}",
                    short_id(&machine.id),
                    machine.display_name(),
                    platform,
                    status
                );
            }
            engine.dispose();
            Ok(())
        }
        Command::Spawn {
            machine,
            directory,
            create,
        } => {
            let engine = start(config).await?;
            let machine_id = resolve_machine(&engine, &machine)?;
            wait_connected(&engine).await?;
            let result = engine
                .machines()
                .spawn_in_directory(&machine_id, &directory, create)
                .await?;
            engine.dispose();
            match result {
                SpawnResult::Success { session_id } => {
                    println!("Started session {session_id}");
                    Ok(())
                }
                SpawnResult::RequestToApproveDirectoryCreation { directory } => {
                    bail!("{directory} does not exist; pass --create to create it")
                }
                SpawnResult::Error { error_message } => bail!("spawn failed: {error_message}"),
            }
        }
        Command::Ls { session, path } => {
            let engine = start(config).await?;
            let id = resolve_session(&engine, &session)?;
            let path = match path {
                Some(path) => path,
                None => engine
                    .sessions()
                    .get(&id)
                    .and_then(|s| s.metadata.map(|m| m.path))
                    .unwrap_or_else(|| ".".to_string()),
            };
            wait_connected(&engine).await?;
            let result = engine.session(&id)?.list_directory(&path).await?;
            engine.dispose();
            if !result.success {
                bail!(
                    "cannot list {path}: {}",
                    result.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            for entry in &result.entries {
                let marker = match entry.kind {
                    EntryKind::Directory => "/",
                    EntryKind::File | EntryKind::Other => "",
                };
                match entry.size {
                    Some(size) if entry.kind == EntryKind::File => {
                        println!("{:>10}  {}{marker}", size, entry.name)
                    }
                    _ => println!("{:>10}  {}{marker}", "-", entry.name),
                }
            }
            Ok(())
        }
        Command::Find {
            session,
            query,
            limit,
        } => {
            let engine = start(config).await?;
            let id = resolve_session(&engine, &session)?;
            wait_connected(&engine).await?;
            let matches = engine.search_files(&id, &query, limit).await?;
            engine.dispose();
            for m in matches {
                println!("{}", m.path);
            }
            Ok(())
        }
    }
}

/// Unlock the secret, build the engine and fetch initial state.
async fn start(config: ClientConfig) -> Result<SyncEngine> {
    if config.token.is_none() {
        bail!("no token configured; pass --token or set TETHER_TOKEN");
    }
    let secret = setup::unlock(&config.secret_path())?;
    let engine = SyncEngine::new(config, &secret)?;
    engine
        .initialize()
        .await
        .context("failed to fetch sessions")?;
    Ok(engine)
}

async fn wait_connected(engine: &SyncEngine) -> Result<()> {
    let mut state = engine.connection();
    tokio::time::timeout(
        CONNECT_TIMEOUT,
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .context("timed out connecting to server")?
    .context("connection closed")?;
    Ok(())
}

fn resolve_session(engine: &SyncEngine, query: &str) -> Result<String> {
    let sessions = engine.sessions().list();
    let candidates: Vec<(&str, String)> = sessions
        .iter()
        .map(|s| (s.id.as_str(), s.title()))
        .collect();
    resolve(query, &candidates).with_context(|| format!("session {query}"))
}

fn resolve_machine(engine: &SyncEngine, query: &str) -> Result<String> {
    let machines = engine.machines().list();
    let candidates: Vec<(&str, String)> = machines
        .iter()
        .map(|m| (m.id.as_str(), m.display_name().to_string()))
        .collect();
    resolve(query, &candidates).with_context(|| format!("machine {query}"))
}

/// Match an exact id, then a unique id prefix, then a unique name.
fn resolve(query: &str, candidates: &[(&str, String)]) -> Result<String> {
    if let Some((id, _)) = candidates.iter().find(|(id, _)| *id == query) {
        return Ok(id.to_string());
    }
    let by_prefix: Vec<&str> = candidates
        .iter()
        .filter(|(id, _)| id.starts_with(query))
        .map(|(id, _)| *id)
        .collect();
    let by_name: Vec<&str> = candidates
        .iter()
        .filter(|(_, name)| name == query)
        .map(|(id, _)| *id)
        .collect();
    match (by_prefix.as_slice(), by_name.as_slice()) {
        ([id], _) | ([], [id]) => Ok(id.to_string()),
        ([], []) => bail!("not found"),
        _ => bail!("ambiguous"),
    }
}

async fn watch_session(engine: &SyncEngine, session_id: &str) -> Result<()> {
    let timeline = engine.session(session_id)?;
    timeline.load().await?;
    let mut views = timeline.subscribe();
    let mut printed: HashMap<String, String> = HashMap::new();

    loop {
        let view = views.borrow_and_update().clone();
        for message in &view.messages {
            let line = render(message);
            if printed.get(message.id()) != Some(&line) {
                println!("{line}");
                printed.insert(message.id().to_string(), line);
            }
        }
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn render(message: &Message) -> String {
    match message {
        Message::UserText(m) => {
            let pending = if m.server_id.is_none() { " (sending)" } else { "" };
            format!("> {}{pending}", m.text)
        }
        Message::AgentText(m) => m.text.clone(),
        Message::ToolCall(m) => {
            let status = match m.tool.state {
                ToolState::Running => "…",
                ToolState::Completed => "✓",
                ToolState::Error => "✗",
            };
            match &m.tool.description {
                Some(description) => format!("  [{status}] {}: {description}", m.tool.name),
                None => format!("  [{status}] {}", m.tool.name),
            }
        }
        Message::Event(m) => match &m.event {
            AgentEvent::SwitchMode { mode } => format!("-- switched to {mode} --"),
            AgentEvent::Message { message } => format!("-- {message} --"),
            AgentEvent::LimitReached { ends_at } => format!("-- usage limit until {ends_at} --"),
            AgentEvent::Ready => "-- ready --".to_string(),
        },
    }
}

fn session_line(session: &Session, now_ms: u64, timeout: Duration) -> String {
    let presence = match session.presence(now_ms, timeout) {
        Presence::Online if session.thinking => "thinking".to_string(),
        Presence::Online => "online".to_string(),
        Presence::LastSeen(at) => format!("seen {}", ago(now_ms.saturating_sub(at))),
    };
    let path = session
        .metadata
        .as_ref()
        .map(|m| m.path.as_str())
        .unwrap_or("");
    format!(
        "{}  {:<24} {:<12} {}",
        short_id(&session.id),
        session.title(),
        presence,
        path
    )
}

fn session_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "id": session.id,
        "title": session.title(),
        "active": session.active,
        "activeAt": session.active_at,
        "updatedAt": session.updated_at,
        "thinking": session.thinking,
        "metadata": session.metadata,
    })
}

fn ago(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<(&'static str, String)> {
        vec![
            ("a1b2c3d4e5", "api".to_string()),
            ("a1ffff0000", "web".to_string()),
            ("b0000000", "a1".to_string()),
        ]
    }

    #[test]
    fn resolve_prefers_exact_then_prefix_then_name() {
        let c = candidates();
        assert_eq!(resolve("a1b2c3d4e5", &c).unwrap(), "a1b2c3d4e5");
        assert_eq!(resolve("a1b", &c).unwrap(), "a1b2c3d4e5");
        assert_eq!(resolve("web", &c).unwrap(), "a1ffff0000");
        assert!(resolve("a1", &c).is_err());
        assert!(resolve("zzz", &c).is_err());
    }

    #[test]
    fn relative_times() {
        assert_eq!(ago(5_000), "5s ago");
        assert_eq!(ago(120_000), "2m ago");
        assert_eq!(ago(7_200_000), "2h ago");
        assert_eq!(ago(172_800_000), "2d ago");
    }

    #[test]
    fn short_ids_tolerate_short_input() {
        assert_eq!(short_id("abcdefghij"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
