use anyhow::{bail, Context, Result};
use ccx_core::JobStatus;
use ccx_sync::{PgCountryStore, RefreshConfig};
use ccx_web::{AppState, WebConfig};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ccx")]
#[command(about = "Country currency & exchange refresh service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the cron scheduler when enabled).
    Serve,
    /// Run one refresh in the foreground and print the final job state.
    Refresh,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("CCX_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => ccx_web::serve(WebConfig::from_env()).await?,
        Commands::Refresh => {
            let config = RefreshConfig::from_env();
            let state = AppState::from_config(&config).await?;
            let job = state.controller.run_to_completion().await;
            if job.status == JobStatus::Completed {
                // the background render may still be in flight when the process exits
                if let Err(err) = state.controller.render_summary().await {
                    warn!(error = %err, "summary artifact not written");
                }
            }
            println!(
                "refresh {}: run_id={} processed={} error={}",
                job.status.as_str(),
                job.run_id.map(|id| id.to_string()).unwrap_or_default(),
                job.processed_count,
                job.error.as_deref().unwrap_or("-")
            );
            if job.status != JobStatus::Completed {
                bail!("refresh did not complete");
            }
        }
        Commands::Migrate => {
            let config = RefreshConfig::from_env();
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgCountryStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
