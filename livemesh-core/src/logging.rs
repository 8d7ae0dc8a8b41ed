//! Tracing setup for livemesh processes
//!
//! Negotiation and lifecycle events log at `info`/`warn`, per-message
//! mailbox traffic at `debug`. The media transport crates log every packet
//! and ICE check at `debug`/`trace`, so they are held at `warn` (or the
//! configured level, if quieter) unless `RUST_LOG` says otherwise.

use std::cmp;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Targets of the WebRTC stack that drown out signaling logs
const TRANSPORT_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "webrtc_data",
    "interceptor",
    "turn",
    "stun",
];

/// Install the global subscriber. Fails on an unknown level, an unwritable
/// log file, or when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(level))?,
    };
    let registry = tracing_subscriber::registry().with(env_filter);
    let file = config.file_path.as_deref().map(open_log_file).transpose()?;

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);
        match file {
            Some(file) => registry.with(json_layer.with_writer(file)).try_init()?,
            None => registry.with(json_layer).try_init()?,
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match file {
            Some(file) => registry.with(pretty_layer.with_writer(file)).try_init()?,
            None => registry.with(pretty_layer).try_init()?,
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

/// Filter used when `RUST_LOG` is unset
fn filter_directives(level: LevelFilter) -> String {
    let transport = cmp::min(level, LevelFilter::WARN);
    let mut directives = level.to_string();
    for target in TRANSPORT_TARGETS {
        directives.push_str(&format!(",{target}={transport}"));
    }
    directives
}

fn parse_log_level(level: &str) -> anyhow::Result<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "off" => Ok(LevelFilter::OFF),
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
