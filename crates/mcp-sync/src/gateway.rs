//! Expansion of the aggregate gateway record.
//!
//! The internal state exposes every container-runtime server through one
//! record (`docker-gateway: docker mcp gateway run --servers a,b`). Diffing
//! needs one record per server, so the aggregate is replaced by a synthetic
//! `gateway-expanded` record for each listed name.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{ServerRecord, SourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Name of the aggregate record in the internal state.
    pub name: String,
    /// Flag whose value lists the gateway's servers.
    pub servers_flag: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: "docker-gateway".to_string(),
            servers_flag: "--servers".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayExpander {
    settings: GatewaySettings,
}

impl GatewayExpander {
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }

    /// Replace the aggregate record with one synthetic record per listed
    /// server. Other records pass through in order; synthetic records follow.
    pub fn expand(&self, records: Vec<ServerRecord>) -> Vec<ServerRecord> {
        let mut out = Vec::with_capacity(records.len());
        let mut synthetic = Vec::new();
        for record in records {
            if record.name != self.settings.name {
                out.push(record);
                continue;
            }
            match self.listed_servers(&record) {
                Ok(names) => {
                    tracing::debug!(
                        aggregate = %record.name,
                        servers = ?names,
                        "expanding gateway record"
                    );
                    synthetic.extend(names.iter().map(|n| self.synthesize(&record, n)));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "gateway record yields no servers");
                }
            }
        }
        out.extend(synthetic);
        out
    }

    fn listed_servers(&self, record: &ServerRecord) -> Result<Vec<String>, SyncError> {
        let flag = self.settings.servers_flag.as_str();
        let prefixed = format!("{flag}=");
        let mut seen_flag = false;
        let mut names: Vec<String> = Vec::new();
        let mut args = record.args.iter();
        while let Some(arg) = args.next() {
            let value = if arg == flag {
                seen_flag = true;
                args.next().map(String::as_str)
            } else if let Some(v) = arg.strip_prefix(prefixed.as_str()) {
                seen_flag = true;
                Some(v)
            } else {
                continue;
            };
            for name in value.unwrap_or_default().split(',').map(str::trim) {
                if name.is_empty() || name.starts_with('-') {
                    continue;
                }
                if name == self.settings.name {
                    tracing::warn!("gateway lists itself; ignoring");
                    continue;
                }
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }

        let malformed = |reason: &str| SyncError::MalformedAggregateRecord {
            name: record.name.clone(),
            reason: reason.to_string(),
        };
        if !seen_flag {
            return Err(malformed(&format!("no {flag} argument")));
        }
        if names.is_empty() {
            return Err(malformed(&format!("{flag} lists no servers")));
        }
        Ok(names)
    }

    fn synthesize(&self, aggregate: &ServerRecord, name: &str) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            command: aggregate.command.clone(),
            args: self.single_server_args(&aggregate.args, name),
            env: aggregate.env.clone(),
            source: SourceKind::GatewayExpanded,
            scope: aggregate.scope,
            enabled: true,
            last_seen: aggregate.last_seen,
        }
    }

    /// Aggregate args with the first server list replaced by `name` and any
    /// further occurrences of the flag dropped.
    fn single_server_args(&self, args: &[String], name: &str) -> Vec<String> {
        let flag = self.settings.servers_flag.as_str();
        let prefixed = format!("{flag}=");
        let mut out = Vec::with_capacity(args.len());
        let mut replaced = false;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == flag {
                iter.next();
                if !replaced {
                    out.push(flag.to_string());
                    out.push(name.to_string());
                    replaced = true;
                }
            } else if arg.starts_with(prefixed.as_str()) {
                if !replaced {
                    out.push(format!("{prefixed}{name}"));
                    replaced = true;
                }
            } else {
                out.push(arg.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn record(name: &str, command: &str, args: &[&str]) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            source: SourceKind::InternalState,
            scope: None,
            enabled: true,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn aggregate_is_replaced_by_one_record_per_server() {
        let mut gw = record(
            "docker-gateway",
            "docker",
            &["mcp", "gateway", "run", "--servers", "github,sqlite"],
        );
        gw.env.insert("DOCKER_HOST".to_string(), "unix:///x".to_string());
        let out = GatewayExpander::default().expand(vec![record("fs", "npx", &["fs"]), gw]);

        let names: Vec<_> = out.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["fs", "github", "sqlite"]);
        let github = &out[1];
        assert_eq!(github.source, SourceKind::GatewayExpanded);
        assert_eq!(github.command, "docker");
        assert_eq!(github.args, vec!["mcp", "gateway", "run", "--servers", "github"]);
        assert_eq!(
            github.env.get("DOCKER_HOST").map(String::as_str),
            Some("unix:///x")
        );
        assert!(github.enabled);
    }

    #[test]
    fn equals_form_and_repeated_flags_are_merged() {
        let gw = record(
            "docker-gateway",
            "docker",
            &["mcp", "gateway", "run", "--servers=a,b", "--servers", "b,c"],
        );
        let out = GatewayExpander::default().expand(vec![gw]);
        let names: Vec<_> = out.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(out[2].args, vec!["mcp", "gateway", "run", "--servers=c"]);
    }

    #[test]
    fn malformed_aggregate_yields_nothing() {
        let no_flag = record("docker-gateway", "docker", &["mcp", "gateway", "run"]);
        let empty = record("docker-gateway", "docker", &["mcp", "gateway", "run", "--servers"]);
        let expander = GatewayExpander::default();
        assert!(expander.expand(vec![no_flag]).is_empty());
        assert!(expander.expand(vec![empty]).is_empty());
    }

    #[test]
    fn custom_name_and_flag() {
        let expander = GatewayExpander::new(GatewaySettings {
            name: "hub".to_string(),
            servers_flag: "--only".to_string(),
        });
        let out = expander.expand(vec![
            record("hub", "hubctl", &["--only", "x"]),
            record("docker-gateway", "docker", &["--servers", "y"]),
        ]);
        let names: Vec<_> = out.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["docker-gateway", "x"]);
    }
}
