//! `failoverd`: the long-running failover peer process.
//!
//! Parses command-line arguments with `clap`, loads layered configuration,
//! then runs either the Primary or the Secondary side of the coordination
//! core depending on the resolved role. Mirrors the shape of the teacher's
//! `bin/server.rs`: init tracing, parse args, hand off to the library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use pbs_failover::config::{self, Role};
use pbs_failover::primary::PrimaryServer;
use pbs_failover::secondary::{Outcome, SecondaryMachine};
use pbs_failover::takeover::{self, TakeoverResult};

#[derive(Parser)]
#[command(name = "failoverd", version, about = "Runs one peer of a failover server pair")]
struct Cli {
    /// Batch server home directory (holds server_priv/ and spool/).
    #[arg(long, env = "PBS_HOME", default_value = "/var/spool/pbs")]
    home_path: PathBuf,

    /// Overrides the role resolved from configuration.
    #[arg(long, value_enum)]
    role: Option<CliRole>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliRole {
    Primary,
    Secondary,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::try_init().ok();

    let cli = Cli::parse();

    let mut cfg = match config::load(&cli.home_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    if let Some(role) = cli.role {
        cfg.role = Some(match role {
            CliRole::Primary => Role::Primary,
            CliRole::Secondary => Role::Secondary,
        });
    }

    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    match cfg.role {
        Some(Role::Primary) => run_primary(cfg).await,
        Some(Role::Secondary) => run_secondary(cfg).await,
        None => {
            error!("no role configured; set `role` in failover.toml, FAILOVER_ROLE, or --role");
            ExitCode::from(2)
        }
    }
}

async fn run_primary(cfg: pbs_failover::config::FailoverConfig) -> ExitCode {
    match takeover::takeover_from_secondary(&cfg).await {
        TakeoverResult::NoTakeoverNeeded | TakeoverResult::Reclaimed => {}
        TakeoverResult::SecondaryDidNotYield => {
            error!("secondary is active and would not yield the role");
            return ExitCode::from(2);
        }
    }

    info!("starting as primary");
    match PrimaryServer::new(cfg).run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "primary exited with an error");
            ExitCode::from(1)
        }
    }
}

async fn run_secondary(cfg: pbs_failover::config::FailoverConfig) -> ExitCode {
    info!("starting as secondary");
    loop {
        let outcome = SecondaryMachine::new(cfg.clone()).run().await;
        match outcome {
            Outcome::Exit(code) => {
                return ExitCode::from(code as u8);
            }
            Outcome::Active => {
                info!("secondary has taken over; serving as active peer");
                if let Err(e) = pbs_failover::secondary::serve_active_until_reclaimed(&cfg).await {
                    error!(error = %e, "error while serving as active peer");
                    return ExitCode::from(1);
                }
                info!("primary reclaimed the role; returning to standby");
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c; shutting down anyway");
    }
}
