use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use geoip_api::config::Config;
use geoip_api::update::{DatabaseUpdater, FileStatus, UpdateOptions, UpdateTarget};

#[derive(Parser)]
#[command(name = "geoip-update")]
#[command(about = "Download and install GeoIP databases", long_about = None)]
struct Cli {
    /// Provider to update (maxmind, dbip, or all)
    #[arg(default_value = "all")]
    provider: String,
    /// Replace databases even if they were updated recently
    #[arg(long)]
    force: bool,
    /// Skip backing up the existing databases
    #[arg(long)]
    no_backup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let updater = DatabaseUpdater::new(config.providers.clone(), config.update.clone())?;
    let target = UpdateTarget::from(cli.provider.as_str());

    let report = updater
        .run(
            &target,
            UpdateOptions {
                force: cli.force,
                skip_backup: cli.no_backup,
            },
        )
        .await?;

    for provider in &report.providers {
        println!("{}", provider.provider);
        if let Some(backup) = &provider.backup {
            println!("  backup: {}", backup);
        }
        for file in &provider.files {
            let status = match file.status {
                FileStatus::Updated => "updated",
                FileStatus::Skipped => "skipped",
                FileStatus::Failed => "FAILED",
            };
            let detail = match (file.bytes, &file.message) {
                (Some(bytes), _) => format!("{} bytes", bytes),
                (None, Some(message)) => message.clone(),
                (None, None) => String::new(),
            };
            println!("  {:<5} {:<8} {} {}", file.database, status, file.path, detail);
        }
    }

    if !report.success {
        bail!("One or more databases failed to update");
    }

    println!("✅ Update complete. A running server picks up new files on restart or via /geoip/update.");
    Ok(())
}
