//! meshfm - remote file manager over a MeshCentral agent relay
//!
//! Opens a control session, pairs a relay tunnel with the agent, runs one
//! command, and tears the tunnel down again.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::style::{Color, Stylize};
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use meshfm::classify::FileError;
use meshfm::cli::{Args, Command};
use meshfm::client::FileClient;
use meshfm::config::{default_config_path, load_config};
use meshfm::events::{FileManagerEvents, TransferProgress};
use meshfm::manager::{ConnectionState, FileManager};
use meshfm::message::FileEntry;
use meshfm::progress::TransferDisplay;
use meshfm::protocol::timeouts;
use meshfm::registry::SessionRegistry;
use meshfm::relay;
use meshfm::transport::event_channel;
use meshfm::upload::FileSource;
use meshfm::ws::{ControlSession, RelayTransport};

struct CliEvents {
    display: Arc<TransferDisplay>,
    pairing: mpsc::UnboundedSender<String>,
}

impl FileManagerEvents for CliEvents {
    fn state_changed(&self, state: ConnectionState) {
        tracing::debug!(state = %state, "Tunnel state");
    }

    fn transfer_progress(&self, progress: &TransferProgress) {
        self.display.update(progress);
    }

    fn download_cancelled_by_server(&self, file: &str, reason: &str) {
        self.display.println(&format!(
            "{} {} cancelled by agent: {}",
            "Warning".with(Color::Yellow).bold(),
            file,
            reason
        ));
    }

    fn pairing_requested(&self, relay_id: &str) {
        let _ = self.pairing.send(relay_id.to_string());
    }

    fn error(&self, error: &FileError) {
        tracing::warn!(kind = %error.kind, retryable = error.retryable, "{}", error.message);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,meshfm=debug" } else { "warn,meshfm=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_entries(entries: &[FileEntry]) {
    for e in entries {
        let modified = e
            .modified
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        if e.is_container() {
            println!("{:>12}  {}  {}", "<dir>", modified, e.name.as_str().with(Color::Blue).bold());
        } else {
            println!("{:>12}  {}  {}", e.size, modified, e.name);
        }
    }
}

async fn execute(client: &FileClient, command: Command, display: &TransferDisplay) -> Result<()> {
    match command {
        Command::Ls { path } => print_entries(&client.list(&path).await?),
        Command::Mkdir { path, name } => {
            client.list(&path).await?;
            print_entries(&client.make_dir(&name).await?);
        }
        Command::Rm {
            path,
            names,
            recursive,
        } => {
            client.list(&path).await?;
            print_entries(&client.delete(names, recursive).await?);
        }
        Command::Rename { path, old, new } => {
            client.list(&path).await?;
            print_entries(&client.rename(&old, &new).await?);
        }
        Command::Cp { src, dst, names } => {
            client.list(&src).await?;
            print_entries(&client.copy_files(names, &dst).await?);
        }
        Command::Mv { src, dst, names } => {
            client.list(&src).await?;
            print_entries(&client.move_files(names, &dst).await?);
        }
        Command::Find { path, filter } => {
            client.list(&path).await?;
            print_entries(&client.search(&filter).await?);
        }
        Command::Cat { path, file } => {
            client.list(&path).await?;
            let data = client.get_file(&file).await?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Put {
            local,
            remote_dir,
            no_hash,
        } => {
            let source = FileSource::open(&local)
                .with_context(|| format!("Failed to open {}", local.display()))?;
            match client.upload_to(Box::new(source), &remote_dir, !no_hash).await {
                Ok(task) => display.finish_success(&task.file_name, task.total_bytes),
                Err(e) => {
                    display.finish_error(&e.to_string());
                    return Err(e.into());
                }
            }
        }
        Command::Get { remote_file, .. } => match client.download(&remote_file).await {
            Ok(done) => {
                display.finish_success(&done.name, done.data.len() as u64);
                if let Some(path) = done.saved_to {
                    println!("{}", path.display());
                }
            }
            Err(e) => {
                display.finish_error(&e.to_string());
                return Err(e.into());
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    }) {
        eprintln!("Failed to install Ctrl-C handler: {}", e);
    }

    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    if let Some(log_file) = &args.log_file {
        config.journal = Some(log_file.clone());
    }
    if let Command::Get { out, .. } = &args.command {
        config.download_dir = Some(out.clone());
    }

    let registry = SessionRegistry::new();
    let _lease = registry.acquire(&args.node, &args.relay)?;

    let connect_timeout = Duration::from_millis(timeouts::CONNECT_MS);
    let control_url = relay::control_url(&args.relay, args.auth.as_deref());
    let mut control = ControlSession::connect(&control_url, connect_timeout).await?;
    let cookies = control.auth_cookies(connect_timeout).await?;
    let relay_auth = cookies
        .cookie
        .clone()
        .or_else(|| args.auth.clone())
        .unwrap_or_default();

    let relay_id = relay::new_relay_id();
    let (event_tx, event_rx) = event_channel();
    let transport = RelayTransport::new(
        relay::relay_url(&args.relay, &args.node, &relay_id, &relay_auth),
        relay_id,
        event_tx,
        config.outbound_queue,
    );

    let display = Arc::new(if args.command.is_transfer() {
        TransferDisplay::new("Connecting")
    } else {
        TransferDisplay::hidden()
    });
    let (pairing_tx, mut pairing_rx) = mpsc::unbounded_channel();
    let events = Arc::new(CliEvents {
        display: display.clone(),
        pairing: pairing_tx,
    });
    let manager = FileManager::new(Box::new(transport), config, events);
    let (client, handle) = FileClient::spawn(manager, event_rx);

    client.connect().await?;
    let pairing_id = tokio::time::timeout(connect_timeout, pairing_rx.recv())
        .await
        .map_err(|_| anyhow!("Relay did not request pairing"))?
        .ok_or_else(|| anyhow!("Tunnel closed before pairing"))?;
    control
        .pair(
            &args.node,
            &pairing_id,
            cookies.rcookie.as_deref(),
            &args.domain_prefix,
        )
        .await?;
    if let Err(e) = client.wait_ready(connect_timeout).await {
        display.finish_error("agent did not join the tunnel");
        bail!("Agent did not join the tunnel: {}", e);
    }

    let result = execute(&client, args.command, &display).await;

    client.disconnect().await.ok();
    drop(client);
    handle.await.ok();
    if let Err(e) = control.close().await {
        tracing::debug!("Control session close: {}", e);
    }
    result
}
