use crate::config::{Config, ExportKind, ExportRequest, ImageFormat, RuntimeMode};
use crate::driver::SessionFactory;
use crate::metrics::install_prometheus;
use crate::orchestrator::ExportOrchestrator;
use crate::server::{self, AppState};
use crate::session::ChromiumSessionFactory;
use crate::utils::{format_bytes, format_duration};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page-export")]
#[command(about = "Export web pages to PDF or images through headless Chrome")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, env = "EXPORT_CONFIG", help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "EXPORT_MODE", value_enum, global = true, help = "Runtime mode")]
    pub mode: Option<RuntimeMode>,

    #[arg(long, env = "BROWSER_EXECUTABLE_PATH", global = true, help = "Chrome executable path (production only)")]
    pub chrome_path: Option<String>,

    #[arg(long, env = "EXPORT_TIMEOUT_SECS", global = true, help = "Request timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, env = "EXPORT_MAX_SESSIONS", global = true, help = "Maximum concurrent browser sessions")]
    pub max_sessions: Option<usize>,

    #[arg(long, env = "HOST", default_value = "0.0.0.0", global = true, help = "Bind address")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3000, global = true, help = "Server port")]
    pub port: u16,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP export service (default)
    Serve {
        #[arg(long, help = "Do not install the Prometheus recorder")]
        no_metrics: bool,
    },

    /// Export a single URL to a file
    Export {
        #[arg(short, long, help = "URL to export")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "pdf", help = "Export kind")]
        kind: ExportTarget,

        #[arg(long, help = "Image format (png, jpeg)")]
        format: Option<String>,

        #[arg(long, help = "Capture only the viewport instead of the full page")]
        viewport_only: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportTarget {
    Pdf,
    Image,
}

impl Cli {
    /// Configuration file (if any) overlaid with flags and environment.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_concurrent_sessions = max_sessions;
        }
    }
}

pub struct CliRunner {
    pub config: Arc<Config>,
    pub orchestrator: ExportOrchestrator,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let factory: Arc<dyn SessionFactory> =
            Arc::new(ChromiumSessionFactory::new(config.clone()));
        Self {
            orchestrator: ExportOrchestrator::new(config.clone(), factory),
            config,
        }
    }

    pub async fn run(
        &self,
        cli: &Cli,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        match &cli.command {
            None => self.run_server(&cli.host, cli.port, true, shutdown).await,
            Some(Commands::Serve { no_metrics }) => {
                self.run_server(&cli.host, cli.port, !no_metrics, shutdown).await
            }
            Some(Commands::Export {
                url,
                output,
                kind,
                format,
                viewport_only,
            }) => {
                let kind = match kind {
                    ExportTarget::Pdf => ExportKind::Pdf,
                    ExportTarget::Image => ExportKind::Image {
                        format: ImageFormat::from_query(format.as_deref()),
                        full_page: !viewport_only,
                    },
                };
                self.run_export(url, output.clone(), kind).await
            }
            Some(Commands::Validate { config }) => self.validate_config(config.clone()).await,
        }
    }

    pub async fn run_server(
        &self,
        host: &str,
        port: u16,
        with_metrics: bool,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let prometheus = if with_metrics {
            match install_prometheus() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Metrics disabled: {e}");
                    None
                }
            }
        } else {
            None
        };

        info!(
            mode = ?self.config.mode,
            max_sessions = self.config.max_concurrent_sessions,
            timeout = %format_duration(self.config.request_timeout),
            "Starting export service"
        );

        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            prometheus,
        };
        server::serve(host, port, state, shutdown).await?;

        let snapshot = self.orchestrator.metrics().snapshot();
        info!(
            exports = snapshot.started,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            success_rate = format!("{:.1}%", snapshot.success_rate()),
            "Export service stopped"
        );
        Ok(())
    }

    pub async fn run_export(&self, url: &str, output: PathBuf, kind: ExportKind) -> Result<()> {
        let started = Instant::now();
        let filename = output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let request = ExportRequest::new(url, kind).with_filename(filename);

        info!("Exporting {url} to {}", output.display());
        let artifact = self.orchestrator.export(request).await?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&output, &artifact.bytes)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;

        info!(
            "Saved {} ({}) in {}",
            output.display(),
            format_bytes(artifact.bytes.len()),
            format_duration(started.elapsed())
        );
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> Result<()> {
        info!("Validating configuration file: {}", config_path.display());

        let config = Config::from_file(&config_path)?;
        config.validate()?;

        println!("Configuration is valid");
        println!("  mode: {:?}", config.mode);
        println!("  request timeout: {}", format_duration(config.request_timeout));
        println!("  max concurrent sessions: {}", config.max_concurrent_sessions);
        println!(
            "  viewport: {}x{} @{}",
            config.viewport.width, config.viewport.height, config.viewport.device_scale_factor
        );
        println!(
            "  browser: {}",
            config.effective_chrome_path().unwrap_or("auto-detect")
        );
        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}
