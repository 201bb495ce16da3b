pub mod commands;

use crate::config::CaptureConfig;
use clap::{Args, Parser, Subcommand};
use meshsnap_common::{Verbosity, DEFAULT_ADMIN_PORT, DEFAULT_DEBUG_IMAGE, DEFAULT_ENDPOINTS};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshsnap")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capture Envoy sidecar diagnostics from service mesh pods", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Capture admin endpoints, logs and optional packets into snapshot archives")]
    Capture(CaptureArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    #[arg(long, help = "Pod name (defaults to every connect-injected pod in the namespace)")]
    pub pod: Option<String>,

    #[arg(long, help = "Name of the application container")]
    pub container: String,

    #[arg(
        short,
        long,
        env = "KUBECTL_PLUGINS_CURRENT_NAMESPACE",
        default_value = "default",
        help = "Kubernetes namespace"
    )]
    pub namespace: String,

    #[arg(long, value_delimiter = ',', help = "Envoy admin endpoints to capture")]
    pub endpoints: Vec<String>,

    #[arg(long, default_value = ".", help = "Directory to save snapshots")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 5, help = "Seconds between snapshot rounds (minimum 5)")]
    pub sleep: u64,

    #[arg(long, default_value_t = 60, help = "Seconds of logs and packets per snapshot")]
    pub duration: u64,

    #[arg(long, default_value_t = 0, help = "Number of rounds (0 keeps going until --duration has passed)")]
    pub repeat: u32,

    #[arg(long, help = "Raise Envoy to trace instead of debug")]
    pub enable_trace: bool,

    #[arg(long, help = "Capture packets with tcpdump in the pod network namespace")]
    pub tcpdump: bool,

    #[arg(long, help = "Leave the raised Envoy log level in place")]
    pub skip_log_reset: bool,

    #[arg(long, default_value = DEFAULT_DEBUG_IMAGE, help = "Image for ephemeral diagnostic containers")]
    pub debug_image: String,

    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT, help = "Envoy admin port")]
    pub admin_port: u16,

    #[arg(long, help = "Container to try a direct exec fetch in before the ephemeral fallback")]
    pub exec_container: Option<String>,
}

impl CaptureArgs {
    pub fn to_config(&self) -> CaptureConfig {
        let endpoints = if self.endpoints.is_empty() {
            DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect()
        } else {
            self.endpoints
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect()
        };

        CaptureConfig {
            endpoints,
            duration: Duration::from_secs(self.duration),
            verbosity: if self.enable_trace {
                Verbosity::Trace
            } else {
                Verbosity::Debug
            },
            tcpdump_enabled: self.tcpdump,
            repeat_count: self.repeat,
            interval: Duration::from_secs(self.sleep),
            skip_log_reset: self.skip_log_reset,
            output_dir: self.output_dir.clone(),
            admin_port: self.admin_port,
            exec_container: self.exec_container.clone(),
        }
    }
}
