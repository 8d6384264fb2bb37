//! Parsers for the external listing formats.
//!
//! Both CLIs print a human-oriented line format by default and JSON when asked;
//! either is accepted. Anything that cannot be read with confidence is a
//! [`ParseError`], which the snapshotter turns into an invalid snapshot rather
//! than an empty listing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use thiserror::Error;

use crate::model::{Scope, ServerRecord, SourceKind};

/// Launcher used for servers enabled in the container runtime.
pub const CONTAINER_LAUNCHER: &str = "docker";

/// Tokens that start the health suffix of a `claude mcp list` line.
const HEALTH_MARKERS: &[&str] = &[
    "-",
    "✓",
    "✗",
    "⚠",
    "Connected",
    "Disconnected",
    "Failed",
    "Error",
    "Needs",
];

const NO_INTERNAL_SERVERS: &str = "No MCP servers configured";
const NO_CONTAINER_SERVERS: &str = "No server is enabled";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {reason}")]
    Line { line: usize, reason: String },

    #[error("invalid JSON listing: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid registry YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unexpected listing shape: {0}")]
    Shape(String),
}

/// Parse `claude mcp list` output.
pub fn parse_internal_state(
    stdout: &str,
    seen_at: DateTime<Utc>,
) -> Result<Vec<ServerRecord>, ParseError> {
    let trimmed = stdout.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_internal_json(trimmed, seen_at);
    }

    let mut out = Vec::new();
    for (idx, raw) in stdout.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(NO_INTERNAL_SERVERS) {
            continue;
        }
        // Banners ("Checking MCP server health...") carry no `name:` prefix.
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            continue;
        }
        let mut parts = rest.split_whitespace();
        let command = match parts.next() {
            Some(c) if !HEALTH_MARKERS.contains(&c) => c.to_string(),
            _ => {
                return Err(ParseError::Line {
                    line: idx + 1,
                    reason: format!("server '{name}' has no command"),
                });
            }
        };
        let args = parts
            .take_while(|p| !HEALTH_MARKERS.contains(p))
            .map(str::to_string)
            .collect();
        out.push(ServerRecord {
            name: name.to_string(),
            command,
            args,
            env: BTreeMap::new(),
            source: SourceKind::InternalState,
            scope: None,
            enabled: true,
            last_seen: seen_at,
        });
    }
    Ok(out)
}

fn parse_internal_json(
    content: &str,
    seen_at: DateTime<Utc>,
) -> Result<Vec<ServerRecord>, ParseError> {
    let v: JsonValue = serde_json::from_str(content)?;
    let mut out = Vec::new();
    if let Some(map) = v.get("mcpServers").and_then(|m| m.as_object()) {
        for (name, def) in map {
            out.push(internal_record(name, def, seen_at)?);
        }
    } else if let Some(items) = v.as_array() {
        for def in items {
            let name = def
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| ParseError::Shape("server entry without a name".to_string()))?;
            out.push(internal_record(name, def, seen_at)?);
        }
    } else {
        return Err(ParseError::Shape(
            "expected an `mcpServers` object or an array of servers".to_string(),
        ));
    }
    Ok(out)
}

/// `{ command, args?, env?, scope?, disabled? }`; URL-only entries use the URL
/// as their command.
fn internal_record(
    name: &str,
    def: &JsonValue,
    seen_at: DateTime<Utc>,
) -> Result<ServerRecord, ParseError> {
    let command = def
        .get("command")
        .or_else(|| def.get("url"))
        .and_then(|v| v.as_str())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ParseError::Shape(format!("server '{name}' has no command")))?
        .to_string();
    let args = def
        .get("args")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let env = def
        .get("env")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let scope = def
        .get("scope")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Scope>().ok());
    let enabled = !def
        .get("disabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok(ServerRecord {
        name: name.to_string(),
        command,
        args,
        env,
        source: SourceKind::InternalState,
        scope,
        enabled,
        last_seen: seen_at,
    })
}

/// Parse `docker mcp server list` output.
pub fn parse_container_runtime(
    stdout: &str,
    seen_at: DateTime<Utc>,
) -> Result<Vec<ServerRecord>, ParseError> {
    let trimmed = stdout.trim_start();
    if trimmed.starts_with('[') {
        return parse_container_json(trimmed, seen_at);
    }

    let mut names: Vec<String> = Vec::new();
    for (idx, raw) in stdout.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(NO_CONTAINER_SERVERS) {
            continue;
        }
        for token in line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            if !is_server_name(token) {
                return Err(ParseError::Line {
                    line: idx + 1,
                    reason: format!("unexpected token '{token}'"),
                });
            }
            push_unique(&mut names, token);
        }
    }
    Ok(names
        .iter()
        .map(|n| container_record(n, true, seen_at))
        .collect())
}

fn parse_container_json(
    content: &str,
    seen_at: DateTime<Utc>,
) -> Result<Vec<ServerRecord>, ParseError> {
    let v: JsonValue = serde_json::from_str(content)?;
    let items = v
        .as_array()
        .ok_or_else(|| ParseError::Shape("expected an array of servers".to_string()))?;
    let mut out: Vec<ServerRecord> = Vec::new();
    for item in items {
        let (name, enabled) = match item {
            JsonValue::String(s) => (s.as_str(), true),
            JsonValue::Object(obj) => {
                let name = obj
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| ParseError::Shape("server entry without a name".to_string()))?;
                let enabled = obj.get("enabled").and_then(|e| e.as_bool()).unwrap_or(true);
                (name, enabled)
            }
            other => {
                return Err(ParseError::Shape(format!("unexpected server entry {other}")));
            }
        };
        if !out.iter().any(|r| r.name == name) {
            out.push(container_record(name, enabled, seen_at));
        }
    }
    Ok(out)
}

/// Parse the desktop registry file: a `registry:` map keyed by enabled server.
pub fn parse_registry_yaml(
    content: &str,
    seen_at: DateTime<Utc>,
) -> Result<Vec<ServerRecord>, ParseError> {
    let doc: YamlValue = serde_yaml::from_str(content)?;
    let registry = match &doc {
        YamlValue::Null => return Ok(Vec::new()),
        YamlValue::Mapping(m) => m.get("registry").ok_or_else(|| {
            ParseError::Shape("registry file has no `registry` key".to_string())
        })?,
        _ => return Err(ParseError::Shape("registry file is not a mapping".to_string())),
    };
    let map = match registry {
        YamlValue::Null => return Ok(Vec::new()),
        YamlValue::Mapping(m) => m,
        _ => return Err(ParseError::Shape("`registry` is not a mapping".to_string())),
    };
    let mut out = Vec::with_capacity(map.len());
    for key in map.keys() {
        let name = key
            .as_str()
            .ok_or_else(|| ParseError::Shape("non-string registry key".to_string()))?;
        out.push(container_record(name, true, seen_at));
    }
    Ok(out)
}

/// Record for a server the container runtime launches through its gateway.
pub fn container_record(name: &str, enabled: bool, seen_at: DateTime<Utc>) -> ServerRecord {
    ServerRecord {
        name: name.to_string(),
        command: CONTAINER_LAUNCHER.to_string(),
        args: ["mcp", "gateway", "run", "--servers", name]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        env: BTreeMap::new(),
        source: SourceKind::ContainerRuntime,
        scope: None,
        enabled,
        last_seen: seen_at,
    }
}

fn is_server_name(token: &str) -> bool {
    token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}
