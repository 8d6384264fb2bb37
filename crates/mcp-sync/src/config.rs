use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use env_flags::env_flags;
use serde::Deserialize;

use crate::catalog::DEFAULT_IO_TIMEOUT;
use crate::detector::{EnabledTieBreak, MergePolicy};
use crate::gateway::GatewaySettings;
use crate::guard::DEFAULT_COOLDOWN;
use crate::model::SourceKind;
use crate::monitor::{DEFAULT_GRACE, DEFAULT_INTERVAL};
use crate::source::{ListCommands, MutationCommands};

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct UserConfig {
    pub logging: Option<LoggingCfg>,
    pub sync: Option<SyncCfg>,
    pub sources: Option<SourcesCfg>,
    pub gateway: Option<GatewayCfg>,
    pub monitor: Option<MonitorCfg>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingCfg {
    pub to_file: Option<bool>,
    pub dir: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub pretty: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncCfg {
    pub cooldown_ms: Option<u64>,
    pub snapshot_timeout_ms: Option<u64>,
    pub catalog_timeout_ms: Option<u64>,
    pub propagate: Option<bool>,
    pub catalog_file: Option<String>, // defaults to <home>/catalog.json
    pub precedence: Option<Vec<String>>, // highest first
    pub enabled_tie_break: Option<EnabledTieBreak>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SourcesCfg {
    pub internal_list: Option<Vec<String>>,
    pub container_list: Option<Vec<String>>,
    pub registry_file: Option<String>, // read instead of container_list when set
    pub internal_add: Option<Vec<String>>,
    pub internal_remove: Option<Vec<String>>,
    pub container_enable: Option<Vec<String>>,
    pub container_disable: Option<Vec<String>>,
    pub extra_path: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayCfg {
    pub name: Option<String>,
    pub servers_flag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MonitorCfg {
    pub interval_secs: Option<u64>,
    pub auto_apply: Option<bool>,
    pub grace_ms: Option<u64>,
    pub state_file: Option<String>,
}

pub fn load_user_config(home: &Path) -> anyhow::Result<Option<UserConfig>> {
    let path = home.join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg: UserConfig =
        toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cfg))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

/// `MCP_SYNC_HOME`, else `$HOME/.mcp-sync`, else `./.mcp-sync`.
pub fn resolve_home() -> PathBuf {
    env_flags! {
        /// mcp-sync home directory (absolute). Defaults to $HOME/.mcp-sync
        MCP_SYNC_HOME: &str = "";
    }
    if !(*MCP_SYNC_HOME).is_empty() {
        return expand_home(*MCP_SYNC_HOME);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".mcp-sync");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".mcp-sync")
}

/// Values taken from the process environment; `None` when the variable is unset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvOverrides {
    pub cooldown_ms: Option<u64>,
    pub snapshot_timeout_ms: Option<u64>,
    pub interval_secs: Option<u64>,
    pub auto_apply: Option<bool>,
    pub propagate: Option<bool>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        env_flags! {
            /// Guard cooldown after a local operation, in milliseconds
            MCP_SYNC_COOLDOWN_MS: u64 = 2000;
            /// Per-source snapshot timeout, in milliseconds
            MCP_SYNC_SNAPSHOT_TIMEOUT_MS: u64 = 15000;
            /// Background monitor interval, in seconds
            MCP_SYNC_INTERVAL_SECS: u64 = 60;
            /// Apply detected changes during monitoring
            MCP_SYNC_AUTO_APPLY: bool = false;
            /// Add container-side servers to the internal state
            MCP_SYNC_PROPAGATE: bool = true;
        }
        let env_set = |k: &str| std::env::var_os(k).is_some();
        Self {
            cooldown_ms: env_set("MCP_SYNC_COOLDOWN_MS").then(|| *MCP_SYNC_COOLDOWN_MS),
            snapshot_timeout_ms: env_set("MCP_SYNC_SNAPSHOT_TIMEOUT_MS")
                .then(|| *MCP_SYNC_SNAPSHOT_TIMEOUT_MS),
            interval_secs: env_set("MCP_SYNC_INTERVAL_SECS").then(|| *MCP_SYNC_INTERVAL_SECS),
            auto_apply: env_set("MCP_SYNC_AUTO_APPLY").then(|| *MCP_SYNC_AUTO_APPLY),
            propagate: env_set("MCP_SYNC_PROPAGATE").then(|| *MCP_SYNC_PROPAGATE),
        }
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub catalog_file: PathBuf,
    pub state_file: PathBuf,
    pub cooldown: Duration,
    pub snapshot_timeout: Duration,
    pub catalog_timeout: Duration,
    pub propagate: bool,
    pub merge: MergePolicy,
    pub list: ListCommands,
    pub mutation: MutationCommands,
    pub extra_path: Vec<PathBuf>,
    pub gateway: GatewaySettings,
    pub monitor_interval: Duration,
    pub monitor_auto_apply: bool,
    pub monitor_grace: Duration,
}

impl Settings {
    /// Merge defaults, the user config and environment overrides, in
    /// increasing order of precedence.
    pub fn resolve(
        home: PathBuf,
        cfg: Option<&UserConfig>,
        env: &EnvOverrides,
    ) -> anyhow::Result<Self> {
        let sync = cfg.and_then(|c| c.sync.as_ref());
        let sources = cfg.and_then(|c| c.sources.as_ref());
        let gateway = cfg.and_then(|c| c.gateway.as_ref());
        let monitor = cfg.and_then(|c| c.monitor.as_ref());

        let millis =
            |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);

        let cooldown = millis(
            env.cooldown_ms.or(sync.and_then(|s| s.cooldown_ms)),
            DEFAULT_COOLDOWN,
        );
        let snapshot_timeout = millis(
            env.snapshot_timeout_ms
                .or(sync.and_then(|s| s.snapshot_timeout_ms)),
            DEFAULT_SNAPSHOT_TIMEOUT,
        );
        let catalog_timeout = millis(sync.and_then(|s| s.catalog_timeout_ms), DEFAULT_IO_TIMEOUT);
        let propagate = env
            .propagate
            .or(sync.and_then(|s| s.propagate))
            .unwrap_or(true);

        let mut merge = MergePolicy::default();
        if let Some(order) = sync.and_then(|s| s.precedence.as_ref()) {
            merge.precedence = order
                .iter()
                .map(|s| s.parse::<SourceKind>().map_err(anyhow::Error::msg))
                .collect::<anyhow::Result<_>>()
                .context("invalid [sync].precedence")?;
        }
        if let Some(tie) = sync.and_then(|s| s.enabled_tie_break) {
            merge.enabled_tie_break = tie;
        }

        let mut list = ListCommands::default();
        let mut mutation = MutationCommands::default();
        let mut extra_path = Vec::new();
        if let Some(src) = sources {
            let set = |target: &mut Vec<String>, value: &Option<Vec<String>>, key: &str| {
                match value {
                    Some(v) if v.is_empty() => {
                        anyhow::bail!("[sources].{key} must not be empty")
                    }
                    Some(v) => *target = v.clone(),
                    None => {}
                }
                Ok(())
            };
            set(&mut list.internal_state, &src.internal_list, "internal_list")?;
            set(&mut list.container_runtime, &src.container_list, "container_list")?;
            set(&mut mutation.internal_add, &src.internal_add, "internal_add")?;
            set(&mut mutation.internal_remove, &src.internal_remove, "internal_remove")?;
            set(&mut mutation.container_enable, &src.container_enable, "container_enable")?;
            set(&mut mutation.container_disable, &src.container_disable, "container_disable")?;
            list.registry_file = src.registry_file.as_deref().map(expand_home);
            extra_path = src
                .extra_path
                .iter()
                .flatten()
                .map(|p| expand_home(p))
                .collect();
        }

        let mut gw = GatewaySettings::default();
        if let Some(g) = gateway {
            if let Some(name) = &g.name {
                gw.name.clone_from(name);
            }
            if let Some(flag) = &g.servers_flag {
                gw.servers_flag.clone_from(flag);
            }
        }

        let monitor_interval = env
            .interval_secs
            .or(monitor.and_then(|m| m.interval_secs))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);
        if monitor_interval.is_zero() {
            anyhow::bail!("monitor interval must be greater than zero");
        }
        let monitor_auto_apply = env
            .auto_apply
            .or(monitor.and_then(|m| m.auto_apply))
            .unwrap_or(false);
        let monitor_grace = millis(monitor.and_then(|m| m.grace_ms), DEFAULT_GRACE);

        let catalog_file = sync
            .and_then(|s| s.catalog_file.as_deref())
            .map(expand_home)
            .unwrap_or_else(|| home.join("catalog.json"));
        let state_file = monitor
            .and_then(|m| m.state_file.as_deref())
            .map(expand_home)
            .unwrap_or_else(|| home.join("monitor_state.json"));

        Ok(Self {
            home,
            catalog_file,
            state_file,
            cooldown,
            snapshot_timeout,
            catalog_timeout,
            propagate,
            merge,
            list,
            mutation,
            extra_path,
            gateway: gw,
            monitor_interval,
            monitor_auto_apply,
            monitor_grace,
        })
    }
}
