//! Configuration for a failover peer.
//!
//! Loaded from a layered source, highest precedence last: built-in defaults,
//! an optional `failover.toml` in the home path, then `FAILOVER_*` environment
//! variables, then explicit CLI overrides applied by the binary entry point.
//! This mirrors the loader shape production crates in this workspace use
//! (defaults -> file -> env) rather than hand-rolling a merge.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FailoverError;

/// Authentication mode affecting how the control connection is established.
/// `Reserved` corresponds to the privileged-port connect mode; `Munge`
/// selects external credential propagation (MUNGE). The core only needs to
/// know which one is configured to pick connect flags; it never interprets
/// the credentials themselves (see spec §1 non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Reserved,
    Munge,
}

/// The role this process was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

/// Operator-configured seconds the Secondary waits before declaring a
/// takeover. `-1` is the "come up active immediately" sentinel (spec §3,
/// §6); this wraps it so call sites can't confuse it with a literal delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryDelay {
    Seconds(u64),
    Immediate,
}

impl Default for SecondaryDelay {
    fn default() -> Self {
        SecondaryDelay::Seconds(300)
    }
}

impl SecondaryDelay {
    pub(crate) fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            SecondaryDelay::Immediate
        } else {
            SecondaryDelay::Seconds(raw as u64)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub role: Option<Role>,
    pub primary_host: String,
    pub secondary_host: String,
    pub server_port: u16,
    pub home_path: PathBuf,
    pub auth_method: AuthMethod,
    pub secondary_delay_secs: i64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            role: None,
            primary_host: String::new(),
            secondary_host: String::new(),
            server_port: 15001,
            home_path: PathBuf::from("/var/spool/pbs"),
            auth_method: AuthMethod::Reserved,
            secondary_delay_secs: 300,
        }
    }
}

impl FailoverConfig {
    pub fn secondary_delay(&self) -> SecondaryDelay {
        SecondaryDelay::from_raw(self.secondary_delay_secs)
    }

    pub fn server_priv_dir(&self) -> PathBuf {
        self.home_path.join("server_priv")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.home_path.join("spool")
    }

    pub fn svrlive_path(&self) -> PathBuf {
        self.server_priv_dir().join("svrlive")
    }

    pub fn secondary_active_path(&self) -> PathBuf {
        self.server_priv_dir().join("secondary_active")
    }

    pub fn license_path(&self) -> PathBuf {
        self.server_priv_dir().join("license.fo")
    }

    pub fn stonith_path(&self) -> PathBuf {
        self.server_priv_dir().join("stonith")
    }

    /// Validates the invariants the core depends on: both peer hostnames
    /// must be present, and the home path must already exist (its absence
    /// is a configuration error, not something the core can recover from;
    /// spec §7).
    pub fn validate(&self) -> Result<(), FailoverError> {
        if self.primary_host.is_empty() || self.secondary_host.is_empty() {
            return Err(FailoverError::Configuration(
                "both primary_host and secondary_host must be set".into(),
            ));
        }
        if self.primary_host == self.secondary_host {
            return Err(FailoverError::Configuration(
                "primary_host and secondary_host must differ".into(),
            ));
        }
        if !self.home_path.is_dir() {
            return Err(FailoverError::Configuration(format!(
                "home_path {} is not a usable directory",
                self.home_path.display()
            )));
        }
        Ok(())
    }

    pub fn peer_host(&self, role: Role) -> &str {
        match role {
            Role::Primary => &self.secondary_host,
            Role::Secondary => &self.primary_host,
        }
    }
}

/// Loads configuration with standard precedence: defaults, then
/// `<home>/server_priv/failover.toml` if present, then `FAILOVER_*`
/// environment variables.
pub fn load(home_path: impl AsRef<Path>) -> anyhow::Result<FailoverConfig> {
    let home_path = home_path.as_ref();
    let defaults = FailoverConfig {
        home_path: home_path.to_path_buf(),
        ..FailoverConfig::default()
    };

    let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

    let file = home_path.join("server_priv").join("failover.toml");
    if file.exists() {
        builder = builder.add_source(
            config::File::from(file)
                .required(false)
                .format(config::FileFormat::Toml),
        );
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FAILOVER")
            .separator("_")
            .try_parsing(true),
    );

    let built = builder.build()?;
    let cfg: FailoverConfig = built.try_deserialize()?;
    Ok(cfg)
}
