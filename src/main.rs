mod cli;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use devnetd::command::SystemRunner;
use devnetd::config::{self, DaemonConfig};
use devnetd::control::{DaemonState, Supervisor};
use devnetd::ports::PortProbe;
use devnetd::runtime::RuntimeCoordinator;
use devnetd::trust::{self, RootCertificate, TrustConsumer, TrustManager};

fn main() {
    // Initialize logger with custom format for daemon
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    let cfg_path = match args.config {
        Some(path) => path,
        None => DaemonConfig::default_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?,
    };
    let cfg = DaemonConfig::load(&cfg_path)
        .with_context(|| format!("Failed to load config {}", cfg_path.display()))?;

    match args.sub.unwrap_or(cli::Cmd::Run) {
        cli::Cmd::Run => run_daemon(&cfg).await,
        cli::Cmd::Install => handle_install(&cfg, &cfg_path),
        cli::Cmd::Uninstall => handle_uninstall(&cfg, &cfg_path),
        cli::Cmd::Start => handle_start(&cfg, &cfg_path),
        cli::Cmd::Stop => handle_stop(&cfg, &cfg_path),
        cli::Cmd::Status => handle_status(&cfg, &cfg_path),
        cli::Cmd::Ports => handle_ports(&cfg),
        cli::Cmd::Trust { cmd } => handle_trust(&cfg, cmd).await,
    }
}

async fn run_daemon(cfg: &DaemonConfig) -> Result<()> {
    info!(
        "devnetd starting (pid {}), serving .{}",
        std::process::id(),
        cfg.tld
    );
    RuntimeCoordinator::from_config(cfg)?.run().await?;
    info!("devnetd exiting");
    Ok(())
}

fn supervisor(cfg: &DaemonConfig, cfg_path: &Path) -> Result<Supervisor> {
    Supervisor::from_config(cfg, cfg_path, Arc::new(SystemRunner))
        .context("Failed to set up service supervisor")
}

/// Exit 0 on success, print the error chain and exit 1 otherwise.
fn finish(result: Result<()>, ok: &str, failed: &str) -> Result<()> {
    match result {
        Ok(()) => {
            println!("{ok}");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{failed}: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Handle install command - warn about busy ports, then register the service
fn handle_install(cfg: &DaemonConfig, cfg_path: &Path) -> Result<()> {
    let busy = PortProbe::well_known(cfg.dns.tcp_port, cfg.probe_timeout()).ports_in_use();
    for port in &busy {
        warn!("{port} is already in use on loopback");
    }

    let result = (|| -> Result<()> {
        DaemonConfig::write_default_if_missing(cfg_path)?;
        supervisor(cfg, cfg_path)?.install()?;
        Ok(())
    })();
    finish(result, "devnetd installed", "Failed to install")
}

fn handle_uninstall(cfg: &DaemonConfig, cfg_path: &Path) -> Result<()> {
    let result = supervisor(cfg, cfg_path).and_then(|s| Ok(s.uninstall()?));
    finish(result, "devnetd uninstalled", "Failed to uninstall")
}

/// Handle start command - start the daemon service
fn handle_start(cfg: &DaemonConfig, cfg_path: &Path) -> Result<()> {
    let result = supervisor(cfg, cfg_path).and_then(|s| Ok(s.run_server()?));
    finish(result, "devnetd started successfully", "Failed to start")
}

/// Handle stop command - stop the daemon service
fn handle_stop(cfg: &DaemonConfig, cfg_path: &Path) -> Result<()> {
    let result = supervisor(cfg, cfg_path).and_then(|s| Ok(s.stop()?));
    finish(result, "devnetd stopped successfully", "Failed to stop")
}

/// Handle status command - check if daemon is running
fn handle_status(cfg: &DaemonConfig, cfg_path: &Path) -> Result<()> {
    match supervisor(cfg, cfg_path) {
        Ok(s) => {
            let state = s.state();
            println!("devnetd is {state}");
            std::process::exit(if state == DaemonState::InstalledRunning { 0 } else { 1 });
        }
        Err(e) => {
            eprintln!("Error checking status: {e:#}");
            std::process::exit(1);
        }
    }
}

fn handle_ports(cfg: &DaemonConfig) -> Result<()> {
    let busy = PortProbe::well_known(cfg.dns.tcp_port, cfg.probe_timeout()).ports_in_use();
    if busy.is_empty() {
        println!("No well-known ports in use");
    }
    for port in busy {
        println!("{port} in use");
    }
    Ok(())
}

fn trust_manager(cfg: &DaemonConfig, consumers: Vec<TrustConsumer>) -> TrustManager {
    TrustManager::from_config(cfg, Arc::new(SystemRunner)).with_consumers(consumers)
}

async fn handle_trust(cfg: &DaemonConfig, cmd: cli::TrustCmd) -> Result<()> {
    match cmd {
        cli::TrustCmd::Install { file, host, consumer } => {
            let manager = trust_manager(cfg, consumer);
            let result = async {
                let path = match (file, host) {
                    (Some(file), _) => file,
                    (None, Some(host)) => fetch_to_data_dir(&manager, &host).await?,
                    (None, None) => anyhow::bail!("either --file or --host is required"),
                };
                manager.install_file(&path)?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            finish(result, "Root certificate installed", "Failed to install certificate")
        }
        cli::TrustCmd::Uninstall { file, consumer } => {
            let result = trust_manager(cfg, consumer)
                .uninstall_file(&file)
                .map_err(anyhow::Error::from);
            finish(result, "Root certificate removed", "Failed to uninstall certificate")
        }
        cli::TrustCmd::Fetch { host, out } => {
            let manager = trust_manager(cfg, Vec::new());
            let result = fetch_to(&manager, &host, &out).await;
            finish(result, &format!("Saved {}", out.display()), "Failed to fetch certificate")
        }
        cli::TrustCmd::Show { file } => {
            let cert = RootCertificate::read(&file)?;
            print!("{}", trust::short_text(&cert)?);
            Ok(())
        }
        cli::TrustCmd::Verify { file } => {
            let cert = RootCertificate::read(&file)?;
            if trust::trusted(&cert) {
                println!("{} is trusted", file.display());
                std::process::exit(0);
            }
            println!("{} is not trusted", file.display());
            std::process::exit(1);
        }
    }
}

/// Fetch into `<data_dir>/fetched/<host>.pem`.
async fn fetch_to_data_dir(manager: &TrustManager, host: &str) -> Result<PathBuf> {
    let name = host.replace([':', '/', '[', ']'], "_");
    let out = config::data_dir().join("fetched").join(format!("{name}.pem"));
    fetch_to(manager, host, &out).await?;
    Ok(out)
}

async fn fetch_to(manager: &TrustManager, host: &str, out: &Path) -> Result<()> {
    let bytes = manager.fetch_root_certificate(host).await?;
    let cert = RootCertificate::parse(&bytes).context("Fetched data is not a certificate")?;

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(out, &bytes).with_context(|| format!("Failed to write {}", out.display()))?;

    println!("UNVERIFIED certificate from {host}, compare the fingerprint out-of-band:");
    print!("{}", trust::short_text(&cert)?);
    Ok(())
}
