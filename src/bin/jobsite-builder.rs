use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use jobsite::builder::server;
use jobsite::builder::{BuilderConfig, PhaseTimeouts};
use jobsite::errors::ExitStatus;
use jobsite::logging;

#[derive(Parser)]
#[command(name = "jobsite-builder")]
#[command(version, about = "Serve one isolated image build over HTTP")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, env = "JOBSITE_JSON")]
    json: bool,

    /// Hostname or IP to listen on
    #[arg(long, env = "JOBSITE_BUILDER_HOST", default_value = "localhost")]
    builder_host: String,

    /// Port to listen on
    #[arg(long, env = "JOBSITE_BUILDER_PORT", default_value_t = 3333)]
    builder_port: u16,

    /// Seconds to wait for the claim
    #[arg(long, env = "JOBSITE_TIMEOUT_CLAIM", default_value_t = 600)]
    timeout_claim: u64,

    /// Seconds to wait for the manifest
    #[arg(long, env = "JOBSITE_TIMEOUT_PROVISION", default_value_t = 30)]
    timeout_provision: u64,

    /// Seconds to wait for populate
    #[arg(long, env = "JOBSITE_TIMEOUT_POPULATE", default_value_t = 300)]
    timeout_populate: u64,

    /// Seconds to wait for the build request
    #[arg(long, env = "JOBSITE_TIMEOUT_BUILD", default_value_t = 3600)]
    timeout_build: u64,

    /// Seconds to wait for exports to be collected
    #[arg(long, env = "JOBSITE_TIMEOUT_EXPORT", default_value_t = 1800)]
    timeout_export: u64,

    /// Private directory for the manifest, store and build output
    #[arg(long, env = "JOBSITE_BUILD_PATH", default_value = "/run/osbuild")]
    build_path: PathBuf,

    /// Build engine executable
    #[arg(long, env = "JOBSITE_ENGINE", default_value = "/usr/bin/osbuild")]
    engine: PathBuf,

    /// Largest accepted request body in bytes
    #[arg(long, env = "JOBSITE_MAX_BODY_SIZE", default_value_t = 256 * 1024 * 1024)]
    max_body_size: usize,

    /// Seconds to keep answering requests after the build failed
    #[arg(long, env = "JOBSITE_ERROR_LINGER", default_value_t = 10)]
    error_linger: u64,
}

impl Cli {
    fn into_config(self) -> BuilderConfig {
        BuilderConfig {
            host: self.builder_host,
            port: self.builder_port,
            build_path: self.build_path,
            engine: self.engine,
            max_body_size: self.max_body_size,
            timeouts: PhaseTimeouts {
                claim: Duration::from_secs(self.timeout_claim),
                provision: Duration::from_secs(self.timeout_provision),
                populate: Duration::from_secs(self.timeout_populate),
                build: Duration::from_secs(self.timeout_build),
                export: Duration::from_secs(self.timeout_export),
            },
            error_linger: Duration::from_secs(self.error_linger),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitStatus::Error.code()
            } else {
                ExitStatus::Ok.code()
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    logging::init(cli.json);

    let status = match server::run(cli.into_config()).await {
        Ok(status) => status,
        Err(e) => {
            error!(error = format!("{:#}", e), "builder failed");
            ExitStatus::Error
        }
    };
    std::process::exit(status.code());
}
