use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser};
use std::path::PathBuf;

use crate::config::MeshConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "mesh-peer",
    version,
    about = "Join a full-mesh audio/video call through a signaling relay"
)]
pub struct Cli {
    #[arg(long, value_name = "URL", help = "Relay WebSocket url (overrides MESH_RELAY_URL)")]
    pub relay: Option<String>,

    #[arg(long, value_name = "ID", help = "Local participant id (overrides MESH_PARTICIPANT_ID)")]
    pub id: Option<String>,

    #[arg(
        long,
        value_name = "N",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
        help = "Largest roster this client will join"
    )]
    pub max_peers: Option<usize>,

    #[arg(long, help = "Do not use any STUN servers")]
    pub no_stun: bool,

    #[arg(long, help = "Join without sending local audio or video")]
    pub receive_only: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    /// Command-line flags win over the environment.
    pub fn apply(&self, config: &mut MeshConfig) {
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(id) = &self.id {
            config.participant_id = Some(id.as_str().into());
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        if self.no_stun {
            config.ice_servers.clear();
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MESH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "MESH_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        env = "MESH_LOG_FILTER",
        help = "Raw tracing filter directives, replacing the level defaults"
    )]
    pub filter: Option<String>,

    #[arg(
        long = "trace-deps",
        env = "MESH_TRACE_DEPS",
        help = "Let webrtc and websocket internals log at the chosen level"
    )]
    pub trace_deps: bool,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
            dependency_traces: self.trace_deps,
        }
    }
}
