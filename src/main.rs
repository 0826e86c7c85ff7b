//! Owner backfill - one-shot repair pass that sets `userId` on every topic, note
//! and audio reachable from a user, and reports dangling references.

mod auth;
mod config;
mod report;
mod store;
mod walker;

use anyhow::{Context, Result};
use auth::{Credentials, ServiceAccountKey, TokenSource};
use config::{BackfillConfig, StoreTarget};
use report::RunReport;
use store::firestore::FirestoreClient;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walker::Walker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "owner_backfill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BackfillConfig::from_env().context("Invalid configuration")?;
    let store = connect(&config)?;

    let report = Walker::new(&store, config.walk).run().await?;
    report.log_summary();

    if let Some(path) = &config.report_path {
        write_report(&report, path)?;
        info!("Report written to {:?}", path);
    }

    if !report.is_clean() {
        warn!("Backfill {} completed with failures; see log above", report.run_id);
    }

    Ok(())
}

/// Build the Firestore client for the configured target.
fn connect(config: &BackfillConfig) -> Result<FirestoreClient> {
    let http = reqwest::Client::new();

    let (credentials, project_id, emulator_host) = match &config.target {
        StoreTarget::Emulator { host, project_id } => {
            info!("Using Firestore emulator at {}", host);
            (Credentials::Emulator, project_id.clone(), Some(host.as_str()))
        }
        StoreTarget::Firestore {
            credentials_path,
            project_id,
        } => {
            let key = ServiceAccountKey::load(credentials_path)?;
            let project_id = project_id
                .clone()
                .or_else(|| key.project_id.clone())
                .context("No project id: set FIRESTORE_PROJECT_ID or use a key with project_id")?;
            (
                Credentials::ServiceAccount(TokenSource::new(key)),
                project_id,
                None,
            )
        }
    };

    info!(
        "Firestore project {} (database {})",
        project_id, config.database
    );

    Ok(FirestoreClient::new(
        http,
        credentials,
        &project_id,
        &config.database,
        emulator_host,
        config.page_size,
    ))
}

fn write_report(report: &RunReport, path: &std::path::Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report: {:?}", path))
}
