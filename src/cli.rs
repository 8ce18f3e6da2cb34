use crate::utils::{format_bytes, format_duration, output_filename};
use crate::{
    assess_pool, BatchEntry, BatchJobRequest, Config, FetchService, JobStatus, OutcomeContent,
    OutputFormat, PerformanceTracker, RenderMode, SingleFetchRequest,
};
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pagefetch")]
#[command(about = "Fetch web pages as markdown, text or HTML, rendering JavaScript when needed")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Disable headless rendering")]
    pub no_render: bool,

    #[arg(long, global = true, help = "Per-URL timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a single URL
    Fetch {
        url: String,

        #[arg(short, long, help = "Output format (markdown, text, html, raw)")]
        format: Option<OutputFormat>,

        #[arg(long, help = "Accept-style format hint, e.g. text/plain")]
        accept: Option<String>,

        #[arg(long, help = "CSS selector to wait for before capturing")]
        wait_for: Option<String>,

        #[arg(long, default_value = "auto", help = "Rendering mode (auto, always, never)")]
        render: RenderMode,

        #[arg(short = 'H', long = "header", help = "Extra request header as NAME:VALUE")]
        headers: Vec<String>,

        #[arg(short, long, help = "Output file or directory (default: stdout)")]
        output: Option<PathBuf>,
    },

    /// Process a batch of URLs as a background job
    Batch {
        #[arg(short, long, help = "URLs one per line, or a JSON batch request")]
        input: PathBuf,

        #[arg(short, long, default_value = "results.json", help = "Results file")]
        output: PathBuf,

        #[arg(short, long, help = "Output format for entries that do not name one")]
        format: Option<OutputFormat>,

        #[arg(short, long, help = "URLs processed at once")]
        concurrency: Option<usize>,

        #[arg(long, default_value = "1000", help = "Progress polling interval in milliseconds")]
        progress_interval: u64,
    },

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        path: PathBuf,
    },

    /// Show browser pool health
    Health {
        #[arg(long, help = "Show per-instance usage")]
        detailed: bool,
    },
}

/// Load the configuration file, if any, and apply command-line overrides.
pub fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Browser pool size: {}", config.browser_pool_size);
    info!("Rendering enabled: {}", config.rendering_enabled);
    info!("Per-URL timeout: {:?}", config.timeouts.per_url);
    Ok(config)
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }
    if args.no_render {
        config.rendering_enabled = false;
    }
    if let Some(timeout) = args.timeout {
        config.timeouts.per_url = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.launch.chrome_path = Some(chrome_path.clone());
    }
}

pub fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());
    let config = Config::from_file(path)?;

    println!("Configuration is valid:");
    println!("  Browser pool size: {}", config.browser_pool_size);
    println!("  Rendering enabled: {}", config.rendering_enabled);
    println!(
        "  Concurrency: {} renders, {} fetches, batch {} (max {})",
        config.concurrency.max_concurrent_renders,
        config.concurrency.max_concurrent_fetches,
        config.concurrency.default_batch_concurrency,
        config.concurrency.max_batch_concurrency
    );
    println!("  Per-URL timeout: {:?}", config.timeouts.per_url);
    println!(
        "  Viewport: {}x{}",
        config.launch.viewport.width, config.launch.viewport.height
    );
    Ok(())
}

/// Parse `NAME:VALUE` header arguments.
pub fn parse_headers(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("header '{header}' is not NAME:VALUE"))?;
            let name = name.trim();
            if name.is_empty() {
                bail!("header '{header}' has an empty name");
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Read a batch from a JSON request or a plain list of URLs. Blank lines and
/// `#` comments are skipped in the plain form.
pub fn parse_batch_input(content: &str, format: Option<OutputFormat>) -> anyhow::Result<BatchJobRequest> {
    let trimmed = content.trim_start();
    let mut request = if trimmed.starts_with('{') {
        serde_json::from_str::<BatchJobRequest>(trimmed).context("invalid batch request JSON")?
    } else {
        BatchJobRequest {
            entries: content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(BatchEntry::new)
                .collect(),
            ..Default::default()
        }
    };
    if let Some(format) = format {
        request.format = format;
    }
    Ok(request)
}

pub struct CliRunner {
    pub service: Arc<FetchService>,
}

impl CliRunner {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let service = FetchService::new(config)
            .await
            .context("failed to start the fetch service")?;
        Ok(Self {
            service: Arc::new(service),
        })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Fetch {
                url,
                format,
                accept,
                wait_for,
                render,
                headers,
                output,
            } => {
                let request = SingleFetchRequest {
                    url,
                    format,
                    accept,
                    headers: parse_headers(&headers)?,
                    wait_for_selector: wait_for,
                    render_mode: render,
                };
                self.run_fetch(request, output).await
            }
            Commands::Batch {
                input,
                output,
                format,
                concurrency,
                progress_interval,
            } => {
                let content = fs::read_to_string(&input)
                    .await
                    .with_context(|| format!("cannot read {}", input.display()))?;
                let mut request = parse_batch_input(&content, format)?;
                if concurrency.is_some() {
                    request.concurrency = concurrency;
                }
                info!("Loaded {} URLs from {}", request.entries.len(), input.display());
                self.run_batch(request, &output, Duration::from_millis(progress_interval.max(50)))
                    .await
            }
            Commands::Validate { path } => validate_config(&path),
            Commands::Health { detailed } => {
                self.show_health(detailed);
                Ok(())
            }
        }
    }

    pub async fn run_fetch(
        &self,
        request: SingleFetchRequest,
        output: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        info!("Fetching {}", request.url);
        let response = self
            .service
            .fetch_one(request)
            .await
            .map_err(|e| anyhow!("fetch failed (status {}): {}", e.status_code(), e.public_message()))?;

        info!(
            "Fetched {} as {} ({}, {}rendered) in {}",
            response.final_url,
            response.format,
            format_bytes(response.size),
            if response.rendered { "" } else { "not " },
            format_duration(Duration::from_millis(response.duration_ms))
        );

        let Some(output) = output else {
            match &response.content {
                OutcomeContent::Text(text) => println!("{text}"),
                OutcomeContent::Binary(_) => bail!("binary content needs --output"),
            }
            return Ok(());
        };

        let path = if output.is_dir() {
            output.join(output_filename(&response.url, response.format.extension()))
        } else {
            output
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match &response.content {
            OutcomeContent::Text(text) => fs::write(&path, text).await?,
            OutcomeContent::Binary(bytes) => fs::write(&path, bytes).await?,
        }
        println!("Saved {} to {}", response.url, path.display());
        Ok(())
    }

    pub async fn run_batch(
        &self,
        request: BatchJobRequest,
        output: &Path,
        poll_interval: Duration,
    ) -> anyhow::Result<()> {
        let id = self.service.submit_batch(request).await?;
        println!("Submitted job {id}");

        let mut ticker = tokio::time::interval(poll_interval);
        let record = loop {
            ticker.tick().await;
            let record = self.service.job_status(&id).await?;
            println!(
                "Progress: {}/{} ({:.1}%) - Succeeded: {}, Failed: {}, Status: {}",
                record.completed(),
                record.total,
                record.progress_percent(),
                record.succeeded,
                record.failed,
                record.status.as_str()
            );
            if record.status.is_terminal() {
                break record;
            }
        };

        if record.status == JobStatus::Failed {
            bail!(
                "job {id} failed: {}",
                record.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let report = self
            .service
            .job_results(&id)
            .await?
            .ok_or_else(|| anyhow!("job {id} finished without results"))?;

        let tracker = PerformanceTracker::new(report.outcomes.len().max(1));
        for outcome in &report.outcomes {
            tracker
                .record(
                    Duration::from_millis(outcome.duration_ms),
                    outcome.error.as_ref().map(|e| e.kind),
                )
                .await;
            if let Some(error) = &outcome.error {
                warn!("{} failed ({}): {}", outcome.url, error.status_code, error.message);
            }
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(output, serde_json::to_vec_pretty(&report)?).await?;

        let stats = tracker.stats().await;
        println!("Batch {} {}:", id, record.status.as_str());
        println!(
            "  Succeeded: {}/{} ({}%)",
            report.summary.succeeded, report.summary.total, report.summary.success_rate
        );
        println!(
            "  Duration: {}",
            format_duration(Duration::from_millis(report.summary.duration_ms))
        );
        println!(
            "  Per URL: avg {:.2}s, p95 {:.2}s",
            stats.average_seconds, stats.p95_seconds
        );
        println!("  Results: {}", output.display());
        Ok(())
    }

    pub fn show_health(&self, detailed: bool) {
        let health = self.service.health();
        println!("System Health Check");
        println!("==================");
        println!("Overall: {}", health.level.as_str());
        println!("Rendering enabled: {}", health.rendering_enabled);
        println!(
            "Classifier cache: {} render, {} static",
            health.classifier_cache.0, health.classifier_cache.1
        );

        let Some(stats) = &health.pool_stats else {
            println!("Browser pool: not running");
            return;
        };
        let pool_health = assess_pool(stats);
        println!("Browser Pool ({}):", pool_health.level.as_str());
        println!("  Capacity: {}", stats.capacity);
        println!("  Available: {}", stats.available);
        println!("  Busy: {}", stats.busy);
        println!("  Awaiting replacement: {}", stats.missing);
        println!("  Acquisitions: {}", stats.acquisitions);
        println!("  Replacements: {}", stats.replacements);
        println!("  Utilization: {}%", pool_health.utilization);
        for issue in &pool_health.issues {
            println!("  ! {issue}");
        }

        if detailed {
            if let Some(pool) = self.service.pool() {
                println!("\nInstances:");
                for instance in pool.instances() {
                    println!(
                        "  Instance {} (pid {:?}): uses {}, age {}, idle {}, {}",
                        instance.id,
                        instance.pid,
                        instance.usage_count,
                        format_duration(instance.age),
                        instance
                            .idle_time
                            .map(format_duration)
                            .unwrap_or_else(|| "never used".to_string()),
                        if instance.checked_out { "busy" } else { "available" }
                    );
                }
            }
        }
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))?;

    Ok(())
}
