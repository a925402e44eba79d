//! UltraCapture - CAPTCHA text recognition
//!
//! Reads a CAPTCHA image, runs it through an ONNX sequence model and
//! decodes the output with greedy CTC. Usable from the command line or
//! as an HTTP service.

mod cli;
mod config;
mod recognition;
mod server;
mod storage;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::cli::OutputFormat;
use crate::config::{AppConfig, ModelConfig};
use crate::recognition::{OnnxEngine, PredictionService};
use crate::server::AppState;

/// UltraCapture - CAPTCHA text recognition
#[derive(Parser, Debug)]
#[command(name = "ultracapture")]
#[command(version, about = "Recognize CAPTCHA text with an ONNX model")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ULTRACAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// ONNX model file, overrides the configuration
    #[arg(long, global = true, env = "ULTRACAPTURE_MODEL")]
    model: Option<PathBuf>,

    /// Model configuration (JSON), overrides the configuration
    #[arg(long, global = true, env = "ULTRACAPTURE_MODEL_CONFIG")]
    model_config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict the text of one or more image files
    Predict {
        /// Image files (png, jpg, jpeg) or directories containing them
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print one JSON object per file
        #[arg(long, conflicts_with = "format")]
        json: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "pretty")]
        format: OutputFormat,

        /// Run all files through the model in a single batch
        #[arg(long)]
        batch: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Bind address, overrides the configuration
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overrides the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show model and configuration details
    Info,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging, RUST_LOG takes precedence over -v
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };

    if let Command::InitConfig { force } = &args.command {
        return init_config(&config_path, *force);
    }

    let mut app_config = config::load_or_default(&config_path)?;
    if let Some(model) = &args.model {
        app_config.model.model_path = model.clone();
    }
    if let Some(model_config) = &args.model_config {
        app_config.model.model_config_path = model_config.clone();
    }

    let model_config = config::model::load_model_config(&app_config.model.model_config_path)?;
    let engine = Arc::new(
        OnnxEngine::load(&app_config.model.model_path, &app_config.model.engine_options())
            .context("Failed to load recognition model")?,
    );

    match args.command {
        Command::Predict {
            files,
            json,
            format,
            batch,
        } => {
            let service = build_service(engine, &app_config, &model_config)?;
            let format = if json { OutputFormat::Json } else { format };
            let files = cli::collect_image_files(&files, service.rules())?;
            cli::predict_files(service, &files, format, batch, app_config.inference.workers.max(1))
        }
        Command::Serve { host, port } => {
            let service = build_service(engine, &app_config, &model_config)?;
            let mut settings = app_config.server.clone();
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }

            let timeout = Duration::from_secs(app_config.inference.timeout_secs.max(1));
            let state = Arc::new(AppState::new(service, timeout));

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::run_server(state, &settings))
        }
        Command::Info => {
            cli::print_info(&engine, &model_config);
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

fn build_service(
    engine: Arc<OnnxEngine>,
    app_config: &AppConfig,
    model_config: &ModelConfig,
) -> Result<Arc<PredictionService>> {
    let service = PredictionService::new(
        engine,
        model_config.charset()?,
        model_config.preprocess_config(),
        app_config.inference.validation_rules(),
    )?;
    info!(
        "Prediction service ready: {} characters, {}x{} input",
        service.charset().len(),
        service.preprocess_config().target_width,
        service.preprocess_config().target_height
    );
    Ok(Arc::new(service))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists, pass --force to overwrite", path);
    }
    config::save_config(&AppConfig::default(), path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
