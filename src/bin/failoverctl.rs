//! `failoverctl`: read-only inspection of a peer's failover state.
//!
//! This does not speak the control protocol to a running `failoverd` — it
//! inspects the same filesystem signals the core itself relies on (the
//! liveness file's mtime, the secondary-active marker, the resolved role).
//! A full live operator channel (force a takeover, request a graceful
//! shutdown) would ride the same `Request`/`Reply` codec `failoverd` peers
//! already speak, but isn't wired up here; see DESIGN.md.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use pbs_failover::config;
use pbs_failover::files;

#[derive(Parser)]
#[command(name = "failoverctl", version, about = "Inspect a failover peer's on-disk state")]
struct Cli {
    #[arg(long, env = "PBS_HOME", default_value = "/var/spool/pbs")]
    home_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the resolved configuration (role, peers, port, delay).
    Config,
    /// Prints whether this node is currently the active secondary, and
    /// since when, according to the on-disk marker.
    Status,
    /// Prints the liveness file's last-modified time.
    Liveness,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::try_init().ok();

    let cli = Cli::parse();
    let cfg = match config::load(&cli.home_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Config => {
            println!("role:            {:?}", cfg.role);
            println!("primary_host:    {}", cfg.primary_host);
            println!("secondary_host:  {}", cfg.secondary_host);
            println!("server_port:     {}", cfg.server_port);
            println!("secondary_delay: {:?}", cfg.secondary_delay());
            ExitCode::SUCCESS
        }
        Command::Status => {
            let marker = cfg.secondary_active_path();
            if files::marker_exists(&marker) {
                match files::read_marker(&marker) {
                    Some(hostname) => println!("active secondary: {hostname}"),
                    None => println!("active secondary marker present but unreadable"),
                }
            } else {
                println!("no secondary is currently active");
            }
            ExitCode::SUCCESS
        }
        Command::Liveness => match files::liveness_mtime(&cfg.svrlive_path()) {
            Ok(mtime) => {
                println!("{:?}", mtime);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("unable to read liveness file: {e}");
                ExitCode::from(1)
            }
        },
    }
}
