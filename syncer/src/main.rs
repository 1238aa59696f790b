mod app;
mod fetch;
mod model;
mod pipeline;
mod sink;
mod source;
mod store;
mod transform;
mod watermark;

#[cfg(test)]
mod testing;

use crate::model::RunReport;
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::process;
use std::str::FromStr;
use std::time::Duration;
use sync_core::{telemetry, Config};
use tracing::{error, info, warn};

const SERVICE: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[clap(name = "syncer")]
#[clap(about = "Incremental API-to-warehouse sync with dbt transformation", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured endpoint, then run the transformation
    Run {
        /// Sync only this endpoint (e.g. `club-membership`)
        endpoint: Option<String>,

        /// Land data without running the transformation afterwards
        #[clap(long)]
        skip_transform: bool,
    },

    /// Run the transformation on already landed data
    Transform,

    /// Verify the warehouse connection
    CheckConnection,

    /// Show the stored watermark of every table
    Watermarks,

    /// Forget a table's watermark so its next sync is a full load
    ResetWatermark {
        /// Table or endpoint name
        table: String,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet; fall back to defaults to report it
            let _ = telemetry::init(SERVICE, &Config::default().telemetry);
            error!(error = %e, "Failed to load config");
            process::exit(1);
        }
    };

    if let Err(e) = telemetry::init(SERVICE, &config.telemetry) {
        eprintln!("Failed to initialize telemetry: {e}");
        process::exit(1);
    }

    let code = match run(cli, config).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "Fatal error");
            1
        }
    };

    telemetry::shutdown(SERVICE);
    process::exit(code);
}

/// Returns whether the command succeeded.
async fn run(cli: Cli, config: Config) -> anyhow::Result<bool> {
    let url = config
        .database
        .connection_url()
        .ok_or_else(|| anyhow::anyhow!("no database configured"))?;
    let options = PgConnectOptions::from_str(&url)?.application_name(&config.database.application_name);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect_with(options)
        .await?;

    let app = app::App::new(config, pool).await?;

    match cli.command {
        Commands::Run {
            endpoint,
            skip_transform,
        } => {
            info!(endpoint = ?endpoint, skip_transform, "Starting sync");
            let report = app.run(endpoint.as_deref(), skip_transform).await?;
            log_report(&report);
            Ok(report.succeeded())
        }

        Commands::Transform => {
            let outcome = app.transform_only().await;
            if outcome.succeeded() {
                info!(steps = outcome.steps.len(), "Transformation completed");
            } else {
                error!(failed_steps = ?outcome.failed_steps(), "Transformation failed");
            }
            Ok(outcome.succeeded())
        }

        Commands::CheckConnection => {
            let conn = app.check_connection().await?;
            info!(
                database = %conn.database,
                user = %conn.user,
                version = %conn.version,
                "Database connection OK"
            );
            Ok(true)
        }

        Commands::Watermarks => {
            let entries = app.list_watermarks().await?;
            if entries.is_empty() {
                info!("No watermarks stored yet");
            }
            for entry in entries {
                info!(
                    table = %entry.table_name,
                    watermark = %entry.watermark,
                    updated_at = %entry.updated_at,
                    "Watermark"
                );
            }
            Ok(true)
        }

        Commands::ResetWatermark { table } => {
            if !app.reset_watermark(&table).await? {
                warn!(table = %table, "No watermark stored for table");
            }
            Ok(true)
        }
    }
}

fn log_report(report: &RunReport) {
    for outcome in &report.outcomes {
        if outcome.succeeded() {
            info!(
                table = %outcome.table,
                landed = outcome.landed,
                dropped = outcome.dropped,
                "Table synced"
            );
        } else {
            error!(
                table = %outcome.table,
                state = ?outcome.failed_in,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Table failed"
            );
        }
    }

    let status = if report.succeeded() { "SUCCESS" } else { "FAILED" };
    info!(
        run_id = %report.run_id,
        status,
        landed = report.total_landed(),
        dropped = report.total_dropped(),
        transformed = report.transform.is_some(),
        "Run summary"
    );
}
