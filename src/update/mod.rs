//! Database refresh: download, verify, back up and install MMDB files
//!
//! Each file is written to a staging path next to its destination, opened
//! as an MMDB to verify it, then renamed into place. Readers therefore never
//! see a partial file. After a provider's files change it is re-registered,
//! which swaps the active reference when that provider is active.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Months, NaiveDate, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

use crate::config::{ProviderConfig, UpdateConfig};
use crate::error::{GeoError, GeoResult};
use crate::geo::{MmdbReader, ProviderRegistry};

const USER_AGENT: &str = "geoip-api-updater/1.0";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Which providers to refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    All,
    Provider(String),
}

impl From<&str> for UpdateTarget {
    fn from(s: &str) -> Self {
        let s = s.trim().to_lowercase();
        if s.is_empty() || s == "all" {
            UpdateTarget::All
        } else {
            UpdateTarget::Provider(s)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Replace files even when they are younger than the minimum age
    pub force: bool,
    pub skip_backup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub database: &'static str,
    pub path: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub provider: String,
    pub backup: Option<String>,
    pub reloaded: bool,
    pub files: Vec<FileReport>,
}

impl ProviderReport {
    fn changed(&self) -> bool {
        self.files.iter().any(|f| f.status == FileStatus::Updated)
    }

    fn failed(&self) -> bool {
        self.files.iter().any(|f| f.status == FileStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub success: bool,
    pub started_at: String,
    pub finished_at: String,
    pub providers: Vec<ProviderReport>,
}

pub struct DatabaseUpdater {
    client: reqwest::Client,
    providers: Vec<ProviderConfig>,
    settings: UpdateConfig,
    registry: Option<Arc<ProviderRegistry>>,
}

impl DatabaseUpdater {
    pub fn new(providers: Vec<ProviderConfig>, settings: UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            providers,
            settings,
            registry: None,
        })
    }

    /// Publish refreshed providers through `registry`
    pub fn with_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn targets(&self, target: &UpdateTarget) -> GeoResult<Vec<&ProviderConfig>> {
        match target {
            UpdateTarget::All => Ok(self.providers.iter().collect()),
            UpdateTarget::Provider(id) => self
                .providers
                .iter()
                .find(|p| &p.id == id)
                .map(|p| vec![p])
                .ok_or_else(|| GeoError::ProviderNotFound(id.clone())),
        }
    }

    /// Refresh the selected providers.
    ///
    /// # Arguments
    /// * `target` - A single provider id or every configured provider
    /// * `options` - Whether to replace fresh files and whether to skip the backup
    ///
    /// # Returns
    /// A per-provider report. Individual file failures are reported, not
    /// returned; the report's `success` is false when any file failed. Only
    /// an unknown provider id is an error.
    pub async fn run(&self, target: &UpdateTarget, options: UpdateOptions) -> GeoResult<UpdateReport> {
        let targets = self.targets(target)?;
        let started_at = Utc::now().to_rfc3339();
        info!("Starting database update for {:?} (force: {})", target, options.force);

        let mut providers = Vec::with_capacity(targets.len());
        for config in targets {
            providers.push(self.update_provider(config, options).await);
        }

        if let Err(e) = rotate_backups(&self.settings.backup_dir, self.settings.keep_backups) {
            warn!("Failed to prune old backups: {:#}", e);
        }

        let success = !providers.iter().any(ProviderReport::failed);
        if success {
            info!("Database update completed");
        } else {
            error!("Database update finished with failures");
        }

        Ok(UpdateReport {
            success,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            providers,
        })
    }

    async fn update_provider(&self, config: &ProviderConfig, options: UpdateOptions) -> ProviderReport {
        info!("Updating provider '{}'", config.id);

        let databases = std::iter::once(("city", config.city_url.as_deref(), &config.city_db)).chain(
            config
                .asn_db
                .as_ref()
                .map(|asn_db| ("asn", config.asn_url.as_deref(), asn_db)),
        );

        let mut report = ProviderReport {
            provider: config.id.clone(),
            backup: None,
            reloaded: false,
            files: Vec::new(),
        };
        // Backups are taken once, right before the first file is replaced
        let mut backup_pending = !options.skip_backup;

        for (database, url_template, dest) in databases {
            let mut file = FileReport {
                database,
                path: dest.display().to_string(),
                status: FileStatus::Skipped,
                bytes: None,
                source: None,
                message: None,
            };

            let template = match self.download_template(url_template, dest, options.force) {
                Ok(template) => template,
                Err(reason) => {
                    file.message = Some(reason);
                    report.files.push(file);
                    continue;
                }
            };

            if backup_pending {
                backup_pending = false;
                report.backup = self.backup(config);
            }

            self.update_file(&mut file, template, dest).await;
            report.files.push(file);
        }

        if report.changed() {
            if let Some(registry) = &self.registry {
                match registry.register(config) {
                    Ok(_) => {
                        info!("Provider '{}' reloaded with new databases", config.id);
                        report.reloaded = true;
                    }
                    Err(e) => error!("Failed to reload provider '{}': {}", config.id, e),
                }
            }
        }

        report
    }

    /// The URL template to download `dest` from, or why it is skipped
    fn download_template<'a>(
        &self,
        url_template: Option<&'a str>,
        dest: &Path,
        force: bool,
    ) -> std::result::Result<&'a str, String> {
        let Some(template) = url_template else {
            return Err("no download URL configured".to_string());
        };

        let min_age = Duration::from_secs(self.settings.min_age_hours * 3600);
        if !force && is_fresh(dest, min_age) {
            return Err(format!(
                "younger than {} hours, use force to replace",
                self.settings.min_age_hours
            ));
        }

        Ok(template)
    }

    fn backup(&self, config: &ProviderConfig) -> Option<String> {
        match backup_provider(config, &self.settings.backup_dir, Local::now()) {
            Ok(dir) => dir.map(|d| d.display().to_string()),
            Err(e) => {
                warn!("Backup of '{}' failed: {:#}", config.id, e);
                None
            }
        }
    }

    async fn update_file(&self, report: &mut FileReport, template: &str, dest: &Path) {
        match self.fetch_and_install(template, dest).await {
            Ok((url, bytes)) => {
                info!("Installed {} ({} bytes) from {}", dest.display(), bytes, url);
                report.status = FileStatus::Updated;
                report.bytes = Some(bytes);
                report.source = Some(url);
            }
            Err(e) => {
                error!("Failed to update {}: {:#}", dest.display(), e);
                report.status = FileStatus::Failed;
                report.message = Some(format!("{:#}", e));
            }
        }
    }

    async fn fetch_and_install(&self, template: &str, dest: &Path) -> Result<(String, u64)> {
        let mut last_error = None;

        for url in candidate_urls(template, Local::now().date_naive()) {
            match self.download(&url).await {
                Ok(payload) => {
                    let data = decode_payload(&url, payload)?;
                    let bytes = install(dest, data).await?;
                    return Ok((url, bytes));
                }
                Err(e) => {
                    warn!("Download from {} failed: {:#}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no download URL for {}", dest.display())))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}

/// Substitute `{date}` with `YYYY-MM`
pub fn expand_url_template(template: &str, date: NaiveDate) -> String {
    template.replace("{date}", &format!("{:04}-{:02}", date.year(), date.month()))
}

/// URLs to try in order: this month, then last month
pub fn candidate_urls(template: &str, today: NaiveDate) -> Vec<String> {
    let mut urls = vec![expand_url_template(template, today)];
    if template.contains("{date}") {
        if let Some(previous) = today.checked_sub_months(Months::new(1)) {
            urls.push(expand_url_template(template, previous));
        }
    }
    urls
}

/// Gunzip `.gz` payloads (or anything with the gzip magic number)
pub fn decode_payload(url: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
    let gzipped = url.ends_with(".gz") || payload.starts_with(&[0x1f, 0x8b]);
    if !gzipped {
        return Ok(payload);
    }

    let mut decoded = Vec::new();
    GzDecoder::new(payload.as_slice())
        .read_to_end(&mut decoded)
        .with_context(|| format!("Failed to decompress {}", url))?;
    Ok(decoded)
}

fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database.mmdb".to_string());
    dest.with_file_name(format!(".{}.download", name))
}

/// Write `data` beside `dest`, verify it opens as an MMDB, then rename it
/// over `dest`.
async fn install(dest: &Path, data: Vec<u8>) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let staging = staging_path(dest);
    let bytes = data.len() as u64;
    tokio::fs::write(&staging, &data)
        .await
        .with_context(|| format!("Failed to write {}", staging.display()))?;

    let verify_path = staging.clone();
    let verified = tokio::task::spawn_blocking(move || MmdbReader::open(&verify_path).map(|_| ()))
        .await
        .context("Verification task panicked")?;

    if let Err(e) = verified {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.context("Downloaded file is not a valid MMDB database"));
    }

    tokio::fs::rename(&staging, dest)
        .await
        .with_context(|| format!("Failed to move {} into place", staging.display()))?;
    Ok(bytes)
}

/// Whether `path` exists and was modified within `min_age`
fn is_fresh(path: &Path, min_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|modified| {
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO)
        })
        .is_some_and(|age| age < min_age)
}

/// Copy the provider's existing files into `<backup_dir>/<id>_<YYYYmmdd_HHMMSS>`.
///
/// Returns `None` when there is nothing to back up.
pub fn backup_provider(
    config: &ProviderConfig,
    backup_dir: &Path,
    now: DateTime<Local>,
) -> Result<Option<PathBuf>> {
    let existing: Vec<&PathBuf> = std::iter::once(&config.city_db)
        .chain(config.asn_db.iter())
        .filter(|p| p.is_file())
        .collect();

    if existing.is_empty() {
        return Ok(None);
    }

    let target = backup_dir.join(format!("{}_{}", config.id, now.format("%Y%m%d_%H%M%S")));
    std::fs::create_dir_all(&target)
        .with_context(|| format!("Failed to create backup directory {}", target.display()))?;

    for file in existing {
        if let Some(name) = file.file_name() {
            std::fs::copy(file, target.join(name))
                .with_context(|| format!("Failed to back up {}", file.display()))?;
        }
    }

    info!("Backed up '{}' databases to {}", config.id, target.display());
    Ok(Some(target))
}

/// Keep the newest `keep` backups per provider prefix, returning what was
/// removed.
pub fn rotate_backups(backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut groups: std::collections::BTreeMap<String, Vec<PathBuf>> = Default::default();
    for entry in std::fs::read_dir(backup_dir)
        .with_context(|| format!("Failed to read {}", backup_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // `<provider>_<YYYYmmdd>_<HHMMSS>`
        let mut parts = name.rsplitn(3, '_');
        let (Some(_time), Some(_date), Some(provider)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        groups.entry(provider.to_string()).or_default().push(path);
    }

    let mut removed = Vec::new();
    for (_, mut dirs) in groups {
        // Timestamps sort lexicographically
        dirs.sort();
        dirs.reverse();
        for old in dirs.into_iter().skip(keep) {
            std::fs::remove_dir_all(&old)
                .with_context(|| format!("Failed to remove {}", old.display()))?;
            info!("Removed old backup {}", old.display());
            removed.push(old);
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn provider(dir: &Path) -> ProviderConfig {
        ProviderConfig {
            id: "dbip".to_string(),
            name: "DB-IP Lite".to_string(),
            website: None,
            city_db: dir.join("dbip/dbip-city-lite.mmdb"),
            asn_db: Some(dir.join("dbip/dbip-asn-lite.mmdb")),
            city_url: None,
            asn_url: None,
        }
    }

    #[test]
    fn test_expand_url_template() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(
            expand_url_template("https://example.com/dbip-city-lite-{date}.mmdb.gz", date),
            "https://example.com/dbip-city-lite-2024-03.mmdb.gz"
        );
    }

    #[test]
    fn test_candidate_urls_fall_back_across_year() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let urls = candidate_urls("https://example.com/{date}.mmdb.gz", date);
        assert_eq!(
            urls,
            vec![
                "https://example.com/2024-01.mmdb.gz",
                "https://example.com/2023-12.mmdb.gz"
            ]
        );

        let fixed = candidate_urls("https://example.com/GeoLite2-City.mmdb", date);
        assert_eq!(fixed.len(), 1);
    }

    #[test]
    fn test_decode_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"mmdb bytes").unwrap();
        let gz = encoder.finish().unwrap();

        assert_eq!(decode_payload("https://x/db.mmdb.gz", gz.clone()).unwrap(), b"mmdb bytes");
        // Magic number detection without a .gz suffix
        assert_eq!(decode_payload("https://x/db", gz).unwrap(), b"mmdb bytes");
        assert_eq!(decode_payload("https://x/db.mmdb", b"raw".to_vec()).unwrap(), b"raw");
        assert!(decode_payload("https://x/db.gz", b"not gzip".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_install_rejects_invalid_database() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("maxmind/GeoLite2-City.mmdb");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"previous").unwrap();

        let result = install(&dest, b"definitely not an mmdb".to_vec()).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert!(!staging_path(&dest).exists());
    }

    #[test]
    fn test_backup_provider() {
        let dir = tempfile::tempdir().unwrap();
        let config = provider(dir.path());
        std::fs::create_dir_all(config.city_db.parent().unwrap()).unwrap();
        std::fs::write(&config.city_db, b"city").unwrap();

        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let backup = backup_provider(&config, &dir.path().join("backup"), now)
            .unwrap()
            .unwrap();

        assert!(backup.ends_with("dbip_20240501_123000"));
        assert_eq!(std::fs::read(backup.join("dbip-city-lite.mmdb")).unwrap(), b"city");
        assert!(!backup.join("dbip-asn-lite.mmdb").exists());
    }

    #[test]
    fn test_backup_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = provider(dir.path());
        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        assert!(backup_provider(&config, &dir.path().join("backup"), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rotate_backups_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=4 {
            std::fs::create_dir_all(dir.path().join(format!("dbip_2024050{}_120000", day))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("maxmind_20240101_000000")).unwrap();

        let removed = rotate_backups(dir.path(), 2).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("dbip_20240504_120000").exists());
        assert!(dir.path().join("dbip_20240503_120000").exists());
        assert!(!dir.path().join("dbip_20240501_120000").exists());
        assert!(dir.path().join("maxmind_20240101_000000").exists());
    }

    #[test]
    fn test_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("db.mmdb");
        assert!(!is_fresh(&file, Duration::from_secs(3600)));

        std::fs::write(&file, b"x").unwrap();
        assert!(is_fresh(&file, Duration::from_secs(3600)));
        assert!(!is_fresh(&file, Duration::ZERO));
    }

    #[test]
    fn test_update_target_parsing() {
        assert_eq!(UpdateTarget::from("all"), UpdateTarget::All);
        assert_eq!(UpdateTarget::from(""), UpdateTarget::All);
        assert_eq!(
            UpdateTarget::from(" DBIP "),
            UpdateTarget::Provider("dbip".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let dir = tempfile::tempdir().unwrap();
        let updater = DatabaseUpdater::new(
            vec![provider(dir.path())],
            UpdateConfig {
                backup_dir: dir.path().join("backup"),
                keep_backups: 5,
                min_age_hours: 24,
            },
        )
        .unwrap();

        let err = updater
            .run(&UpdateTarget::Provider("nope".to_string()), UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GeoError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn test_fresh_files_are_skipped_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = provider(dir.path());
        config.city_url = Some("http://127.0.0.1:9/{date}.mmdb.gz".to_string());
        config.asn_db = None;
        std::fs::create_dir_all(config.city_db.parent().unwrap()).unwrap();
        std::fs::write(&config.city_db, b"current").unwrap();

        let updater = DatabaseUpdater::new(
            vec![config],
            UpdateConfig {
                backup_dir: dir.path().join("backup"),
                keep_backups: 5,
                min_age_hours: 24,
            },
        )
        .unwrap();

        let report = updater
            .run(
                &UpdateTarget::All,
                UpdateOptions {
                    force: false,
                    skip_backup: true,
                },
            )
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.providers[0].files[0].status, FileStatus::Skipped);
        assert!(!report.providers[0].reloaded);
    }

    #[tokio::test]
    async fn test_skipped_run_takes_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = provider(dir.path());
        config.city_url = Some("http://127.0.0.1:9/city-{date}.mmdb.gz".to_string());
        config.asn_url = Some("http://127.0.0.1:9/asn-{date}.mmdb.gz".to_string());
        for path in [&config.city_db, config.asn_db.as_ref().unwrap()] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"current").unwrap();
        }

        let backup_dir = dir.path().join("backup");
        let updater = DatabaseUpdater::new(
            vec![config],
            UpdateConfig {
                backup_dir: backup_dir.clone(),
                keep_backups: 5,
                min_age_hours: 24,
            },
        )
        .unwrap();

        for _ in 0..3 {
            let report = updater
                .run(&UpdateTarget::All, UpdateOptions::default())
                .await
                .unwrap();
            assert!(report.success);
            assert!(report.providers[0].backup.is_none());
            assert!(report.providers[0]
                .files
                .iter()
                .all(|f| f.status == FileStatus::Skipped));
        }

        assert!(!backup_dir.exists());
    }
}
