// flowrunner: executes declarative data-collection flows. Steps call
// providers with templated inputs derived from prior-step outputs; the
// scheduler runs independent steps concurrently and exposes a live status
// snapshot over HTTP.

mod api;
mod config;
mod errors;
mod flow;
mod providers;
mod result;
mod runner;
mod telemetry;
mod templating;

use clap::{Parser, Subcommand};
use runner::LocalRunner;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "flowrunner")]
#[command(about = "Run declarative data-collection flows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow from one or more YAML config files.
    Run {
        /// Config files, deep-merged in order of appearance.
        #[arg(required = true)]
        config: Vec<PathBuf>,

        /// Print outputs as JSON.
        #[arg(short = 'j', long)]
        json: bool,

        /// Write JSON outputs to a file.
        #[arg(short = 'o', long = "output-file")]
        output_file: Option<PathBuf>,

        /// Suppress informational output.
        #[arg(short = 'q', long)]
        quiet: bool,

        /// Verbose debug logging.
        #[arg(short = 'v', long)]
        verbose: bool,

        /// Serve the status API on this port so external UIs can poll
        /// runner state; keeps the process alive after the run.
        #[arg(long = "status-port")]
        status_port: Option<u16>,

        /// Maximum number of concurrent step workers.
        #[arg(long = "max-workers")]
        max_workers: Option<usize>,
    },

    /// Run the flow in the background and serve the status API.
    Serve {
        #[arg(required = true)]
        config: Vec<PathBuf>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,

        #[arg(long = "max-workers")]
        max_workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            json,
            output_file,
            quiet,
            verbose,
            status_port,
            max_workers,
        } => {
            telemetry::init_logging(quiet, verbose);
            run_command(
                &config,
                json,
                output_file.as_deref(),
                quiet,
                status_port,
                max_workers,
            )
            .await
        }
        Commands::Serve {
            config,
            host,
            port,
            max_workers,
        } => {
            telemetry::init_logging(false, false);
            serve_command(&config, &host, port, max_workers).await
        }
    }
}

async fn run_command(
    config_paths: &[PathBuf],
    as_json: bool,
    output_file: Option<&std::path::Path>,
    quiet: bool,
    status_port: Option<u16>,
    max_workers: Option<usize>,
) -> ExitCode {
    let config = match config::load_config(config_paths) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        files = config_paths.len(),
        steps = config.flow.len(),
        "configuration loaded"
    );

    let runner = Arc::new(LocalRunner::new(config).with_max_workers(max_workers));

    let status_addr = match status_port {
        Some(port) => {
            let state = api::ApiState::new();
            state.attach_runner(runner.shared());
            match api::serve_in_background("127.0.0.1", port, state).await {
                Ok(addr) => {
                    info!(url = %format!("http://{addr}/status"), "status server listening");
                    Some(addr)
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to start status server");
                    return ExitCode::FAILURE;
                }
            }
        }
        None => None,
    };

    let report = match runner.run().await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "run failed");
            return ExitCode::FAILURE;
        }
    };

    let outputs = runner.shared().lock().await.outputs_snapshot();
    if as_json || output_file.is_some() {
        let payload = match serde_json::to_string_pretty(&outputs) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to serialize outputs");
                return ExitCode::FAILURE;
            }
        };
        match output_file {
            Some(path) => {
                if let Err(err) = std::fs::write(path, payload) {
                    error!(error = %err, path = %path.display(), "failed to write outputs");
                    return ExitCode::FAILURE;
                }
                if !quiet {
                    info!(path = %path.display(), "wrote outputs");
                }
            }
            None => println!("{payload}"),
        }
    } else if !quiet {
        println!("{outputs}");
    }

    if let Some(addr) = status_addr {
        info!(url = %format!("http://{addr}/status"), "status server running; press Ctrl-C to exit");
        let _ = tokio::signal::ctrl_c().await;
    }

    if report.aborted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn serve_command(
    config_paths: &[PathBuf],
    host: &str,
    port: u16,
    max_workers: Option<usize>,
) -> ExitCode {
    let config = match config::load_config(config_paths) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runner = Arc::new(LocalRunner::new(config).with_max_workers(max_workers));
    let state = api::ApiState::new();
    state.attach_runner(runner.shared());

    let background = Arc::clone(&runner);
    tokio::spawn(async move {
        if let Err(err) = background.run().await {
            error!(error = %err, "background run failed");
        }
    });

    // External observers locate this endpoint via RUNNER_STATUS_URL.
    info!(url = %format!("http://{host}:{port}/status"), "serving status API");
    if let Err(err) = api::serve(host, port, state).await {
        error!(error = %format!("{err:#}"), "status server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
