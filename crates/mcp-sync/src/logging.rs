//! Tracing setup: stderr plus an optional daily-rolling log file.

use std::path::{Path, PathBuf};

use env_flags::env_flags;
use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LoggingCfg, expand_home};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

const LOG_FILE: &str = "mcp-sync.log";

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Json,
    Compact,
    Pretty,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogOptions {
    filter: String,
    style: Style,
    to_file: bool,
    dir: PathBuf,
}

fn style_for(json: bool, compact: bool, pretty: bool) -> Style {
    if json {
        Style::Json
    } else if compact {
        Style::Compact
    } else if pretty {
        Style::Pretty
    } else {
        Style::Full
    }
}

fn log_options(home: &Path, cfg: Option<&LoggingCfg>) -> LogOptions {
    env_flags! {
        /// Tracing filter, e.g. "info", "debug", or targets format.
        RUST_LOG: &str = "info";
        /// Preferred filter env (alias). If set, overrides RUST_LOG.
        TRACING_FILTER: &str = "";
        /// Pretty formatting for logs (ignored if TRACING_JSON=true)
        TRACING_PRETTY: bool = false;
        /// Compact single-line formatting for logs (ignored if TRACING_JSON=true)
        TRACING_COMPACT: bool = true;
        /// JSON formatting for logs
        TRACING_JSON: bool = false;
        /// If true, also log to file under <MCP_SYNC_HOME>/logs or LOG_DIR
        LOG_TO_FILE: bool = true;
        /// Optional explicit log directory. Defaults to <MCP_SYNC_HOME>/logs
        LOG_DIR: &str = "";
    }
    let env_set = |k: &str| std::env::var_os(k).is_some();

    let mut filter = if !(*TRACING_FILTER).is_empty() {
        (*TRACING_FILTER).to_string()
    } else {
        (*RUST_LOG).to_string()
    };
    let mut json = *TRACING_JSON;
    let mut compact = *TRACING_COMPACT;
    let mut pretty = *TRACING_PRETTY;
    let mut to_file = *LOG_TO_FILE;
    let mut dir = (!(*LOG_DIR).is_empty()).then(|| expand_home(*LOG_DIR));

    if let Some(cfg) = cfg {
        if !(env_set("TRACING_FILTER") || env_set("RUST_LOG"))
            && let Some(level) = cfg.level.as_ref()
        {
            filter = level.clone();
        }
        if !env_set("TRACING_JSON")
            && let Some(v) = cfg.json
        {
            json = v;
        }
        if !env_set("TRACING_COMPACT")
            && let Some(v) = cfg.compact
        {
            compact = v;
        }
        if !env_set("TRACING_PRETTY")
            && let Some(v) = cfg.pretty
        {
            pretty = v;
        }
        if !env_set("LOG_TO_FILE")
            && let Some(v) = cfg.to_file
        {
            to_file = v;
        }
        if !env_set("LOG_DIR")
            && let Some(d) = cfg.dir.as_deref()
        {
            dir = Some(expand_home(d));
        }
    }

    LogOptions {
        filter,
        style: style_for(json, compact, pretty),
        to_file,
        dir: dir.unwrap_or_else(|| home.join("logs")),
    }
}

fn fmt_layer<W>(style: Style, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer);
    match style {
        Style::Json => base.json().boxed(),
        Style::Compact => base.compact().boxed(),
        Style::Pretty => base.pretty().boxed(),
        Style::Full => base.boxed(),
    }
}

/// Install the global subscriber. Logs always go to stderr so stdout stays
/// clean for command output.
pub fn init_tracing(home: &Path, cfg: Option<&LoggingCfg>) {
    let opts = log_options(home, cfg);
    let filter = EnvFilter::try_new(&opts.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(opts.style, std::io::stderr, true)];
    let mut dir_error = None;
    if opts.to_file {
        match std::fs::create_dir_all(&opts.dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&opts.dir, LOG_FILE);
                let (nb, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                layers.push(fmt_layer(opts.style, nb, false));
            }
            Err(e) => dir_error = Some(e),
        }
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
    {
        tracing::debug!("tracing already set: {:?}", e);
    }
    if let Some(e) = dir_error {
        tracing::warn!("failed to create log dir {}: {}", opts.dir.display(), e);
    }
}
