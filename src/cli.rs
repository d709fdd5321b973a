use std::path::PathBuf;

use clap::{Parser, Subcommand};
use devnetd::trust::TrustConsumer;

#[derive(Parser, Debug)]
#[command(version, about = "devnet local DNS and root CA daemon")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Sub‑commands (run, install, etc.)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Serve DNS and the HTTPS roots endpoint in the foreground (default)
    Run,
    /// Write the resolver override and register the service
    Install,
    /// Unregister the service and remove the resolver override
    Uninstall,
    /// Start the registered service (Exit 0 = running, 1 = failed)
    Start,
    /// Stop the service (Exit 0 = success, 1 = failed)
    Stop,
    /// Check daemon status (Exit 0 = running, 1 = stopped)
    Status,
    /// List well-known ports already bound on loopback
    Ports,
    /// Manage trust for the local root CA
    Trust {
        #[command(subcommand)]
        cmd: TrustCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum TrustCmd {
    /// Install a root CA into the selected trust stores
    Install {
        /// Certificate file (PEM or DER)
        #[arg(long, conflicts_with = "host", required_unless_present = "host")]
        file: Option<PathBuf>,

        /// Fetch the root CA from the daemon on this host first (unverified)
        #[arg(long)]
        host: Option<String>,

        /// Trust stores to touch (default: all)
        #[arg(long, value_enum, value_delimiter = ',')]
        consumer: Vec<TrustConsumer>,
    },
    /// Remove a root CA from the selected trust stores
    Uninstall {
        #[arg(long)]
        file: PathBuf,

        #[arg(long, value_enum, value_delimiter = ',')]
        consumer: Vec<TrustConsumer>,
    },
    /// Download the root CA from a running daemon without verification
    Fetch {
        #[arg(long)]
        host: String,

        #[arg(long)]
        out: PathBuf,
    },
    /// Print a certificate summary
    Show {
        #[arg(long)]
        file: PathBuf,
    },
    /// Check whether the host already trusts a certificate (Exit 0 = trusted)
    Verify {
        #[arg(long)]
        file: PathBuf,
    },
}
