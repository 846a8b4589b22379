//! Collector Service - Downloads the raw IDA spreadsheets published by Anatel
//!
//! Responsibilities:
//! - Fetch the .ods files from the open-data portal
//! - Apply rate limiting to avoid degrading the source site
//! - Reject unexpected content (HTML error pages served with status 200)
//! - Store the files under DATA_DIR, where the etl service picks them up
//!
//! Usage:
//!   # From config (batch mode):
//!   cargo run --bin collector -- --config config/sources.json
//!
//!   # Specific service from config:
//!   cargo run --bin collector -- --config config/sources.json --service SCM
//!
//!   # Single file:
//!   cargo run --bin collector -- --file SCM2019.ods --url http://...

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Downloads IDA spreadsheets from Anatel")]
struct Args {
    /// Path to sources config file (for batch mode)
    #[arg(long)]
    config: Option<String>,

    /// Service code filter for batch mode (e.g. SCM, SMP, STFC)
    #[arg(long)]
    service: Option<String>,

    /// File name to save under DATA_DIR (for single-file mode)
    #[arg(long)]
    file: Option<String>,

    /// URL to fetch (for single-file mode)
    #[arg(long)]
    url: Option<String>,

    /// Force re-download even if the file is already present
    #[arg(long, default_value = "false")]
    force: bool,
}

// =============================================================================
// Source Configuration Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SourcesConfig {
    version: String,
    sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
struct Source {
    file: String,
    service: String,
    #[serde(default)]
    description: String,
    url: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
struct Config {
    data_dir: PathBuf,
    rate_limit_ms: u64,
}

impl Config {
    /// Reads DATA_DIR (default ./data/raw) and RATE_LIMIT_MS (default 1000).
    fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        }
    }
}

/// Outcome of a fetch: either the file was downloaded now, or an earlier
/// download is still on disk and was kept.
#[derive(Debug)]
enum FetchOutcome {
    Downloaded(PathBuf),
    AlreadyPresent(PathBuf),
}

/// Config file names must be plain names; anything path-like is rejected
/// before it gets joined onto DATA_DIR.
fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("invalid file name '{}'", name);
    }
    Ok(())
}

/// Load sources configuration from JSON file
async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read sources config")?;
    let config: SourcesConfig =
        serde_json::from_str(&content).context("Failed to parse sources config")?;
    Ok(config)
}

/// Fetch one spreadsheet and save it under the data directory.
async fn fetch_file(
    client: &reqwest::Client,
    config: &Config,
    file_name: &str,
    url: &str,
    force: bool,
) -> Result<FetchOutcome> {
    validate_file_name(file_name)?;
    let target = config.data_dir.join(file_name);

    if target.exists() && !force {
        println!(
            "  Already present: {} (use --force to re-download)",
            target.display()
        );
        return Ok(FetchOutcome::AlreadyPresent(target));
    }

    // Rate limit: wait before request
    println!("  Rate limit: waiting {}ms...", config.rate_limit_ms);
    sleep(Duration::from_millis(config.rate_limit_ms)).await;

    println!("  Fetching: {}", url);
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;

    let mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    // The portal answers some broken links with an HTML notice and status 200
    if mime.to_lowercase().contains("html") {
        bail!("unexpected content type '{}' for {}", mime, file_name);
    }

    let bytes = resp.bytes().await?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("sha256:{:x}", hasher.finalize());

    println!("  Downloaded: {} bytes, mime: {}", bytes.len(), mime);
    println!("  Hash: {}", content_hash);

    fs::create_dir_all(&config.data_dir).await?;
    fs::write(&target, &bytes)
        .await
        .context("Failed to write file")?;

    println!(
        "  Saved to: {} at {}",
        target.display(),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    Ok(FetchOutcome::Downloaded(target))
}

/// Print summary of available sources
fn print_sources_summary(sources_config: &SourcesConfig) {
    println!("\nConfigured sources:");
    println!("{:-<60}", "");
    for source in &sources_config.sources {
        let status = if source.enabled { "✓" } else { "✗" };
        println!(
            "  {} {} -> {} ({})",
            status, source.file, source.service, source.description
        );
    }
    println!("{:-<60}", "");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();

    println!("=== Anatel Indicadores Collector ===");
    println!("Data dir: {}", config.data_dir.display());

    // Build HTTP client
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("AnatelIndicadores/0.1 (painel de indicadores; coleta de dados abertos)")
        .build()?;

    // Determine mode: config-based batch or single file
    if let Some(config_path) = &args.config {
        println!("Loading sources from: {}", config_path);
        let sources_config = load_sources_config(config_path).await?;
        println!("Config version: {}", sources_config.version);

        // Filter sources
        let sources: Vec<&Source> = sources_config
            .sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| args.service.as_ref().map_or(true, |code| &s.service == code))
            .collect();

        if sources.is_empty() {
            print_sources_summary(&sources_config);
            bail!("No sources match the filter criteria");
        }

        println!("\nProcessing {} source(s)...", sources.len());

        let mut downloaded = 0;
        let mut already_present = 0;
        let mut failed = 0;

        for source in sources {
            println!("\n[{}] {}", source.service, source.file);
            if !source.description.is_empty() {
                println!("  {}", source.description);
            }

            match fetch_file(&client, &config, &source.file, &source.url, args.force).await {
                Ok(FetchOutcome::Downloaded(path)) => {
                    println!("  ✓ Collected: {}", path.display());
                    downloaded += 1;
                }
                Ok(FetchOutcome::AlreadyPresent(_)) => {
                    already_present += 1;
                }
                Err(e) => {
                    eprintln!("  ✗ Failed: {:#}", e);
                    failed += 1;
                }
            }
        }

        println!("\n=== Collection Summary ===");
        println!("Downloaded:      {}", downloaded);
        println!("Already present: {}", already_present);
        println!("Failed:          {}", failed);
    } else if let (Some(file), Some(url)) = (&args.file, &args.url) {
        println!("File: {}", file);
        println!("URL: {}", url);

        match fetch_file(&client, &config, file, url, args.force).await? {
            FetchOutcome::Downloaded(path) | FetchOutcome::AlreadyPresent(path) => {
                println!("\n=== Collection Complete ===");
                println!("Saved at: {}", path.display());
                println!("Ready for loading: cargo run --bin etl");
            }
        }
    } else {
        bail!(
            "Must specify either:\n  \
             --config <path> for batch mode, or\n  \
             --file <name> --url <url> for single-file mode"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_name_accepts_plain_names() {
        assert!(validate_file_name("SCM2019.ods").is_ok());
        assert!(validate_file_name("relatorio-2019.xlsx").is_ok());
    }

    #[test]
    fn test_validate_file_name_rejects_paths() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("../SCM2019.ods").is_err());
        assert!(validate_file_name("sub/dir.ods").is_err());
        assert!(validate_file_name("c:\\temp\\x.ods").is_err());
    }
}
