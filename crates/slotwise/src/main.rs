//! `slotwise` - CLI for the slotwise update system
//!
//! One binary runs the update server, the publisher tools and the device
//! agent.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use slotwise::agent::control::{self, CheckStarted, ControlClient};
use slotwise::agent::{
    Activator, Agent, AgentOptions, AgentState, AgentStatus, CheckOutcome, CommandActivator,
    HttpTransport, NoopActivator, StateFile,
};
use slotwise::cli::{
    AgentCommand, AuditCommand, ChannelCommand, Cli, Command, ConfigCommand, KeygenCommand,
    OutputFormat, PublishCommand, ReleasesCommand, RetireCommand, ServerCommand,
};
use slotwise::publish::{audit, publish, PublishRequest};
use slotwise::registry::Registry;
use slotwise::server::{http, UpdateService};
use slotwise::store::{FsPackageStore, PackageStore};
use slotwise::trust::{ReleaseSigner, TrustedKeys};
use slotwise::{init_logging, Config, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // `config validate` reports problems instead of failing on them
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        let path = file
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(Config::default_config_path);
        return handle_config_validate(&path);
    }

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Server(ServerCommand::Serve { bind }) => handle_serve(&config, bind).await,
        Command::Publish(cmd) => handle_publish(&config, &cmd),
        Command::Retire(cmd) => handle_retire(&config, &cmd),
        Command::Releases(cmd) => handle_releases(&config, &cmd),
        Command::Channel(ChannelCommand::Create { name }) => handle_channel_create(&config, &name),
        Command::Audit(cmd) => handle_audit(&config, &cmd),
        Command::Keygen(cmd) => handle_keygen(&cmd),
        Command::Agent(cmd) => handle_agent(&config, cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

/// Resolves once Ctrl-C is received. Every clone of the receiver sees it.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

fn on_shutdown(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

fn open_registry(config: &Config) -> anyhow::Result<Registry> {
    let storage = Storage::open(config.database_path())?;
    Ok(Registry::new(storage)?)
}

fn open_store(config: &Config) -> anyhow::Result<FsPackageStore> {
    Ok(FsPackageStore::open(config.package_store_dir())?)
}

fn trusted_keys(config: &Config) -> anyhow::Result<TrustedKeys> {
    let keys = TrustedKeys::from_hex(&config.trust.trusted_keys)?;
    if keys.is_empty() {
        bail!("no trusted keys configured (set trust.trusted_keys)");
    }
    Ok(keys)
}

async fn handle_serve(config: &Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    let registry = Arc::new(open_registry(config)?);
    let store: Arc<dyn PackageStore> = Arc::new(open_store(config)?);
    let service = Arc::new(UpdateService::new(
        registry,
        store,
        config.server.lock_shards,
        config.server.max_range_bytes,
    ));
    let bind = bind.unwrap_or(config.server.bind);
    http::serve(service, bind, on_shutdown(shutdown_signal())).await?;
    Ok(())
}

fn handle_publish(config: &Config, cmd: &PublishCommand) -> anyhow::Result<()> {
    let key_path = cmd
        .key
        .clone()
        .or_else(|| config.trust.signing_key_path.clone())
        .context("no signing key (pass --key or set trust.signing_key_path)")?;
    let signer = ReleaseSigner::load(&key_path)
        .with_context(|| format!("failed to load signing key {}", key_path.display()))?;
    let image = fs::read(&cmd.image)
        .with_context(|| format!("failed to read image {}", cmd.image.display()))?;

    let registry = open_registry(config)?;
    let store = open_store(config)?;
    let entry = publish(
        &registry,
        &store,
        &signer,
        PublishRequest {
            channel: cmd.channel.clone(),
            version: cmd.release_version.clone(),
            image,
            changelog: cmd.changelog.clone(),
            minimum_source_version: cmd.minimum_source_version.clone(),
        },
    )?;

    if cmd.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }
    println!(
        "Published {} {} (manifest {})",
        entry.release.channel,
        entry.release.version,
        entry.release.manifest_hash.short()
    );
    for package in &entry.packages {
        let source = package
            .source_version
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        println!(
            "  {:<5} from {:<10} {:>12} bytes  {}",
            package.kind.to_string(),
            source,
            package.size_bytes,
            package.content_hash
        );
    }
    Ok(())
}

fn handle_retire(config: &Config, cmd: &RetireCommand) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    if registry.retire(&cmd.channel, &cmd.release_version)? {
        println!("Retired {} {}", cmd.channel, cmd.release_version);
    } else {
        println!("{} {} was already retired", cmd.channel, cmd.release_version);
    }
    Ok(())
}

fn handle_releases(config: &Config, cmd: &ReleasesCommand) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let releases = registry.releases(&cmd.channel)?;
    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&releases)?),
        OutputFormat::Plain => {
            for release in &releases {
                println!("{}", release.version);
            }
        }
        OutputFormat::Table => {
            println!("{:<14} {:<10} {:<20} CREATED", "VERSION", "AVAILABLE", "MANIFEST");
            for release in &releases {
                println!(
                    "{:<14} {:<10} {:<20} {}",
                    release.version.to_string(),
                    release.available,
                    release.manifest_hash.short(),
                    release.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

fn handle_channel_create(config: &Config, name: &str) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    if registry.create_channel(name)? {
        println!("Created channel {name}");
    } else {
        println!("Channel {name} already exists");
    }
    Ok(())
}

fn handle_audit(config: &Config, cmd: &AuditCommand) -> anyhow::Result<()> {
    let trusted = trusted_keys(config)?;
    let registry = open_registry(config)?;
    let store = open_store(config)?;
    let report = audit(&registry, &store, &trusted)?;

    if cmd.json {
        let findings: Vec<_> = report
            .findings
            .iter()
            .map(|f| serde_json::json!({ "subject": f.subject, "problem": f.problem }))
            .collect();
        let out = serde_json::json!({
            "releases": report.releases,
            "packages": report.packages,
            "clean": report.is_clean(),
            "findings": findings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "Checked {} releases and {} packages",
            report.releases, report.packages
        );
        for finding in &report.findings {
            println!("  {}: {}", finding.subject, finding.problem);
        }
    }
    if !report.is_clean() {
        bail!("audit found {} problems", report.findings.len());
    }
    Ok(())
}

fn handle_keygen(cmd: &KeygenCommand) -> anyhow::Result<()> {
    if cmd.out.exists() && !cmd.force {
        bail!("{} already exists (use --force to overwrite)", cmd.out.display());
    }
    if let Some(parent) = cmd.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let signer = ReleaseSigner::generate();
    write_secret(&cmd.out, &signer.secret_hex())?;
    println!("Wrote signing key to {}", cmd.out.display());
    println!("Public key (add to trust.trusted_keys):");
    println!("{}", signer.public_key_hex());
    Ok(())
}

#[cfg(unix)]
fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    writeln!(file, "{secret}")
}

#[cfg(not(unix))]
fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    fs::write(path, format!("{secret}\n"))
}

async fn handle_agent(config: &Config, cmd: AgentCommand) -> anyhow::Result<()> {
    match cmd {
        AgentCommand::Init {
            release_version,
            image,
        } => {
            let options = AgentOptions::from_config(config)?;
            let bytes = fs::read(&image)
                .with_context(|| format!("failed to read image {}", image.display()))?;
            let state = Agent::provision(&options, release_version, &bytes)?;
            println!(
                "Provisioned {} at {} in {}",
                state.device_id,
                state.current_version,
                options.data_dir.display()
            );
            Ok(())
        }
        AgentCommand::Run { once } => run_agent(config, once).await,
        AgentCommand::Status { json, offline } => {
            let status = if offline {
                let state: AgentState = StateFile::in_dir(&config.agent.data_dir).load()?;
                AgentStatus::from(&state)
            } else {
                control_client(config)?.status().await?
            };
            print_status(&status, json)
        }
        AgentCommand::Check => {
            match control_client(config)?.check().await? {
                CheckStarted::Started(status) => {
                    println!("Check started (state: {})", status.state);
                }
                CheckStarted::Busy => println!("An update session is already running"),
            }
            Ok(())
        }
        AgentCommand::Apply => {
            match control_client(config)?.apply().await? {
                CheckOutcome::Completed { result } => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                CheckOutcome::Busy => println!("An update session is already running"),
            }
            Ok(())
        }
        AgentCommand::Cancel => {
            if control_client(config)?.cancel().await? {
                println!("Cancel requested");
            } else {
                println!("Nothing to cancel");
            }
            Ok(())
        }
        AgentCommand::Healthy => Ok(control_client(config)?.health(true).await?),
        AgentCommand::Failing => Ok(control_client(config)?.health(false).await?),
    }
}

fn control_client(config: &Config) -> anyhow::Result<ControlClient> {
    // Apply waits through the confirmation window.
    let timeout = Duration::from_secs(config.agent.confirmation_window_secs)
        + config.request_timeout();
    Ok(ControlClient::new(config.agent.control_bind, timeout)?)
}

async fn run_agent(config: &Config, once: bool) -> anyhow::Result<()> {
    let options = AgentOptions::from_config(config)?;
    let transport = Arc::new(HttpTransport::new(
        config.agent.server_url.clone(),
        config.request_timeout(),
    )?);
    let activator: Arc<dyn Activator> = match &config.agent.activate_command {
        Some(command) => Arc::new(CommandActivator::new(command)?),
        None => Arc::new(NoopActivator),
    };
    let agent = Agent::open(options, transport, activator)?;
    info!(
        device_id = %agent.state().device_id,
        version = %agent.state().current_version,
        state = %agent.state().state,
        "Agent started"
    );
    let (handle, task) = agent.spawn();

    let shutdown = shutdown_signal();
    // Health signals must be accepted while an interrupted confirmation resumes.
    let control = tokio::spawn(control::serve(
        handle.clone(),
        config.agent.control_bind,
        on_shutdown(shutdown.clone()),
    ));

    match handle.recover().await {
        Ok(Some(outcome)) => info!(outcome = ?outcome, "Recovered interrupted update"),
        Ok(None) => {}
        Err(err) => error!("Recovery failed: {err}"),
    }

    if once {
        let outcome = handle.check_now().await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let interval = config.poll_interval().unwrap_or(Duration::ZERO);
        handle.poll(interval, on_shutdown(shutdown)).await;
    }

    control.abort();
    let _ = control.await;
    drop(handle);
    let _ = task.await;
    Ok(())
}

fn print_status(status: &AgentStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }
    println!("slotwise agent status");
    println!("---------------------");
    println!("Device:            {}", status.device_id);
    println!("Channel:           {}", status.channel);
    println!("State:             {}", status.state);
    println!("Running:           {}", status.current_version);
    println!("Last known good:   {}", status.last_known_good_version);
    println!("Active slot:       {}", status.active_slot);
    if let Some(staged) = &status.staged_version {
        println!("Staged:            {staged}");
    }
    if let (Some(target), Some(session)) = (&status.target_version, &status.session_id) {
        println!("Session:           {session} -> {target}");
    }
    if let (Some(offset), Some(size)) = (status.download_offset, status.package_size) {
        println!("Downloaded:        {offset}/{size} bytes");
    }
    if let Some(deadline) = status.confirm_deadline {
        println!("Confirm by:        {}", deadline.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if status.pending_reports > 0 {
        println!("Pending reports:   {}", status.pending_reports);
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Server]");
                println!("  Bind:               {}", config.server.bind);
                println!("  Database path:      {}", config.database_path().display());
                println!("  Package store:      {}", config.package_store_dir().display());
                println!("  Lock shards:        {}", config.server.lock_shards);
                println!();
                println!("[Agent]");
                println!("  Server URL:         {}", config.agent.server_url);
                println!(
                    "  Device id:          {}",
                    config.agent.device_id.as_deref().unwrap_or("(not set)")
                );
                println!("  Channel:            {}", config.agent.channel);
                println!("  Data dir:           {}", config.agent.data_dir.display());
                println!("  Control API:        {}", config.agent.control_bind);
                println!("  Poll interval (s):  {}", config.agent.poll_interval_secs);
                println!("  Auto apply:         {}", config.agent.auto_apply);
                println!();
                println!("[Trust]");
                println!("  Trusted keys:       {}", config.trust.trusted_keys.len());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            return handle_config_validate(&path);
        }
    }
    Ok(())
}

fn handle_config_validate(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path.to_path_buf())) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}
