use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gsync_storage::PgStore;
use gsync_sync::{SyncConfig, SyncRunSummary};
use gsync_web::AppState;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "gsync-cli")]
#[command(about = "Google Scholar citation sync")]
struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every subject once
    Sync,
    /// Keep syncing on a cron schedule until ctrl-c
    Schedule {
        /// Six-field cron expression, seconds first
        #[arg(long)]
        cron: Option<String>,
    },
    /// Apply database migrations
    Migrate,
    /// Serve the read-only JSON API
    Serve {
        /// Defaults to GSYNC_WEB_PORT, then 8000
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the URL token for a list of ids (each 0..=1023)
    Token {
        #[arg(required = true, value_delimiter = ',')]
        ids: Vec<i64>,
    },
}

/// Flags win over the matching GSYNC_* environment variables.
#[derive(Debug, Default, Args)]
struct ConfigOverrides {
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(long, global = true)]
    scholar_base_url: Option<String>,
    #[arg(long, global = true)]
    user_agent: Option<String>,
    #[arg(long, global = true)]
    http_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    request_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[arg(long, global = true)]
    recent_years: Option<i32>,
    #[arg(long, global = true)]
    i10_threshold: Option<i64>,
    #[arg(long, global = true)]
    author_match_threshold: Option<f64>,
    #[arg(long, global = true)]
    author_change_threshold: Option<f64>,
    #[arg(long, global = true)]
    failure_threshold: Option<u32>,
    #[arg(long, global = true)]
    block_cooldown_secs: Option<u64>,
    #[arg(long, global = true)]
    restart_pause_secs: Option<u64>,
    /// Skip the first N subjects in id order
    #[arg(long, global = true)]
    start_index: Option<usize>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    /// Anchor the recent window to this year instead of the clock
    #[arg(long, global = true)]
    current_year: Option<i32>,
}

impl ConfigOverrides {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(v) = self.database_url {
            config.database_url = v;
        }
        if let Some(v) = self.scholar_base_url {
            config.scholar_base_url = v;
        }
        if let Some(v) = self.user_agent {
            config.user_agent = v;
        }
        config.http_timeout_secs = self.http_timeout_secs.unwrap_or(config.http_timeout_secs);
        config.request_delay_ms = self.request_delay_ms.unwrap_or(config.request_delay_ms);
        config.page_size = self.page_size.unwrap_or(config.page_size);
        config.recent_years = self.recent_years.unwrap_or(config.recent_years);
        config.i10_threshold = self.i10_threshold.unwrap_or(config.i10_threshold);
        config.author_match_threshold = self
            .author_match_threshold
            .unwrap_or(config.author_match_threshold);
        config.author_change_threshold = self
            .author_change_threshold
            .unwrap_or(config.author_change_threshold);
        config.failure_threshold = self.failure_threshold.unwrap_or(config.failure_threshold);
        config.block_cooldown_secs = self.block_cooldown_secs.unwrap_or(config.block_cooldown_secs);
        config.restart_pause_secs = self.restart_pause_secs.unwrap_or(config.restart_pause_secs);
        config.start_index = self.start_index.unwrap_or(config.start_index);
        if let Some(v) = self.reports_dir {
            config.reports_dir = v;
        }
        if self.current_year.is_some() {
            config.current_year = self.current_year;
        }
        config
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_summary(summary: &SyncRunSummary) {
    let c = &summary.counters;
    println!(
        "sync complete: run_id={} subjects={} processed={} failed={} inserted={} patched={} restarts={} report={}",
        summary.run_id,
        summary.subjects_total,
        c.subjects_processed,
        c.subjects_failed,
        c.publications_inserted,
        c.publications_patched,
        c.restarts,
        summary.report_path
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = cli.overrides.apply(SyncConfig::from_env());
    debug!(config = ?config.redacted(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let scheduled = config.scheduler_enabled.then(|| config.sync_cron.clone());
            let mut pipeline = gsync_sync::build_pipeline(config).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            if let Some(cron) = scheduled {
                info!(%cron, "scheduler enabled; continuing on schedule");
                gsync_sync::run_scheduled(pipeline, &cron).await?;
            }
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.sync_cron.clone());
            let pipeline = gsync_sync::build_pipeline(config).await?;
            gsync_sync::run_scheduled(pipeline, &cron).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            let port = port.unwrap_or_else(gsync_web::port_from_env);
            gsync_web::serve(AppState::new(Arc::new(store)), port).await?;
        }
        Commands::Token { ids } => {
            println!("{}", gsync_web::encode_id_token(&ids)?);
        }
    }

    Ok(())
}
