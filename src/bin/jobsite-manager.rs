use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use jobsite::errors::ExitStatus;
use jobsite::logging;
use jobsite::manager::supervisor;
use jobsite::manager::{ManagerConfig, StepTimeouts};

#[derive(Parser)]
#[command(name = "jobsite-manager")]
#[command(
    version,
    about = "Drive a jobsite builder through one build",
    long_about = "Drive a jobsite builder through one build.\n\n\
                  The manifest is read from stdin and the build log is \
                  written to stdout."
)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, env = "JOBSITE_JSON")]
    json: bool,

    /// Hostname or IP identifying this manager in logs
    #[arg(long, env = "JOBSITE_MANAGER_HOST", default_value = "localhost")]
    manager_host: String,

    /// Port identifying this manager in logs
    #[arg(long, env = "JOBSITE_MANAGER_PORT", default_value_t = 3333)]
    manager_port: u16,

    /// Hostname or IP of the builder
    #[arg(long, env = "JOBSITE_BUILDER_HOST", default_value = "localhost")]
    builder_host: String,

    /// Port of the builder
    #[arg(long, env = "JOBSITE_BUILDER_PORT", default_value_t = 3333)]
    builder_port: u16,

    #[arg(long, env = "JOBSITE_TIMEOUT_CLAIM", default_value_t = 600)]
    timeout_claim: u64,

    #[arg(long, env = "JOBSITE_TIMEOUT_PROVISION", default_value_t = 30)]
    timeout_provision: u64,

    #[arg(long, env = "JOBSITE_TIMEOUT_POPULATE", default_value_t = 300)]
    timeout_populate: u64,

    /// Seconds allowed for starting the build
    #[arg(long, env = "JOBSITE_TIMEOUT_BUILD", default_value_t = 30)]
    timeout_build: u64,

    /// Seconds allowed for the build to finish and its log to be copied
    #[arg(long, env = "JOBSITE_TIMEOUT_PROGRESS", default_value_t = 3600)]
    timeout_progress: u64,

    #[arg(long, env = "JOBSITE_TIMEOUT_EXPORT", default_value_t = 1800)]
    timeout_export: u64,

    /// Pipeline to export; repeatable
    #[arg(long = "export", value_name = "PIPELINE")]
    pipelines: Vec<String>,

    /// KEY=VALUE added to the engine's environment; repeatable
    #[arg(long = "environment", value_name = "DECL")]
    environments: Vec<String>,

    /// File to retrieve, relative to the build directory; repeatable
    #[arg(long = "export-file", value_name = "PATH")]
    export_files: Vec<String>,

    /// Directory retrieved files are written to
    #[arg(long, env = "JOBSITE_OUTPUT", default_value = "/dev/null")]
    output: PathBuf,

    /// Directory uploaded to the builder as the source store
    #[arg(long, env = "JOBSITE_STORE")]
    store: Option<PathBuf>,

    /// Seconds between polls while the build has no output yet
    #[arg(long, env = "JOBSITE_PROGRESS_INTERVAL", default_value_t = 5)]
    progress_interval: u64,

    /// Seconds between reconnect attempts
    #[arg(long, env = "JOBSITE_RETRY_INTERVAL", default_value_t = 1)]
    retry_interval: u64,
}

impl Cli {
    fn into_config(self) -> ManagerConfig {
        ManagerConfig {
            manager_host: self.manager_host,
            manager_port: self.manager_port,
            builder_host: self.builder_host,
            builder_port: self.builder_port,
            timeouts: StepTimeouts {
                claim: Duration::from_secs(self.timeout_claim),
                provision: Duration::from_secs(self.timeout_provision),
                populate: Duration::from_secs(self.timeout_populate),
                build: Duration::from_secs(self.timeout_build),
                progress: Duration::from_secs(self.timeout_progress),
                export: Duration::from_secs(self.timeout_export),
            },
            pipelines: self.pipelines,
            environments: self.environments,
            exports: self.export_files,
            output: self.output,
            store: self.store,
            progress_interval: Duration::from_secs(self.progress_interval),
            retry_interval: Duration::from_secs(self.retry_interval),
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

    let status = supervisor::run(cli.into_config()).await;
    // The stdin reader may still be parked on a blocking thread.
    std::process::exit(status.code());
}
