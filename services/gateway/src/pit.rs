//! Append-only point-in-time snapshot store
//!
//! Layout: `<base>/<entity>/YYYY/MM/DD/HH-MM-SS[-N]-<source>.json`. Files
//! are append-created and never rewritten; a same-second snapshot gets a
//! numeric discriminator rather than touching an existing file. Reads
//! verify the integrity digest before returning a payload.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::repository::Repository;

/// One stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitRecord {
    /// Entity the snapshot belongs to (`trades`, `regime`, ...)
    pub entity: String,
    /// Snapshot instant, UTC
    pub ts: DateTime<Utc>,
    /// Producing source (venue or pipe name)
    pub source: String,
    /// Opaque snapshot body (base64 on disk)
    #[serde(with = "body_base64")]
    pub payload: Vec<u8>,
    /// Hex SHA3-256 over payload ‖ unix-nanos ‖ entity ‖ source
    pub integrity_digest: String,
}

mod body_base64 {
    //! Disk form for the opaque body: base64 text keeps snapshot files
    //! compact while staying greppable JSON.

    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Append-only snapshot store with the time-partitioned layout.
pub struct PitStore {
    base: PathBuf,
    retention_days: u32,
    repository: Option<Arc<Repository>>,
    snapshots_written: AtomicU64,
}

impl PitStore {
    /// Open (and create) the store under `config.base_path`.
    pub fn new(config: &config::PitConfig, repository: Option<Arc<Repository>>) -> Result<Self> {
        let base = PathBuf::from(&config.base_path);
        std::fs::create_dir_all(&base)
            .map_err(|e| GatewayError::Pit(format!("create base {}: {e}", base.display())))?;
        if config.compression {
            tracing::warn!("pit compression requested but not supported; storing plain json");
        }
        Ok(Self {
            base,
            retention_days: config.retention_days,
            repository,
            snapshots_written: AtomicU64::new(0),
        })
    }

    /// Durable append of one snapshot. Returns the created path.
    ///
    /// The file write is authoritative; a configured repository is written
    /// second and its failure only logs.
    pub async fn snapshot(
        &self,
        entity: &str,
        ts: DateTime<Utc>,
        payload: &[u8],
        source: &str,
    ) -> Result<PathBuf> {
        let record = PitRecord {
            entity: entity.to_string(),
            ts,
            source: source.to_string(),
            payload: payload.to_vec(),
            integrity_digest: types::envelope::compute_checksum(payload, ts, entity, source),
        };

        let dir = self.day_dir(entity, ts);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| GatewayError::Pit(format!("create {}: {e}", dir.display())))?;

        let path = self.fresh_path(&dir, ts, source).await?;
        let body = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| GatewayError::Pit(format!("write {}: {e}", path.display())))?;
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.store_snapshot(&record) {
                tracing::warn!(entity = %entity, error = %e,
                    "repository dual-write failed; file snapshot is authoritative");
            }
        }

        tracing::debug!(entity = %entity, path = %path.display(), "pit snapshot written");
        Ok(path)
    }

    /// Read back the snapshot for (entity, ts), any source. The digest is
    /// verified before the payload is returned.
    pub async fn read(&self, entity: &str, ts: DateTime<Utc>) -> Result<PitRecord> {
        let dir = self.day_dir(entity, ts);
        let stamp = time_stamp(ts);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| GatewayError::Pit(format!("read {}: {e}", dir.display())))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GatewayError::Pit(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&stamp) {
                return self.load_verified(&entry.path()).await;
            }
        }
        Err(GatewayError::Pit(format!(
            "no snapshot for {entity} at {stamp} under {}",
            dir.display()
        )))
    }

    /// Snapshots for `entity` between `from` and `to`, in time order.
    pub async fn list(
        &self,
        entity: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PitRecord>> {
        let mut records = Vec::new();
        let mut day = from.date_naive();
        let last = to.date_naive();

        while day <= last {
            let dir = self.date_dir(entity, day);
            if dir.is_dir() {
                let mut names = Vec::new();
                let mut entries = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|e| GatewayError::Pit(e.to_string()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| GatewayError::Pit(e.to_string()))?
                {
                    names.push(entry.path());
                }
                names.sort();
                for path in names {
                    let record = self.load_verified(&path).await?;
                    if record.ts >= from && record.ts <= to {
                        records.push(record);
                    }
                }
            }
            day = day
                .succ_opt()
                .ok_or_else(|| GatewayError::Pit("date overflow".to_string()))?;
        }
        records.sort_by_key(|r| r.ts);
        Ok(records)
    }

    /// Delete day partitions older than the retention window. Returns the
    /// number of removed day directories.
    pub async fn purge_expired(&self) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(self.retention_days as i64)).date_naive();
        let mut removed = 0;

        let mut entities = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Some(entity) = entities
            .next_entry()
            .await
            .map_err(|e| GatewayError::Pit(e.to_string()))?
        {
            if !entity.path().is_dir() {
                continue;
            }
            removed += purge_entity(&entity.path(), cutoff).await?;
        }
        if removed > 0 {
            tracing::info!(removed, "pit retention purge removed day partitions");
        }
        Ok(removed)
    }

    /// Snapshots written since the store opened.
    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written.load(Ordering::Relaxed)
    }

    fn day_dir(&self, entity: &str, ts: DateTime<Utc>) -> PathBuf {
        self.date_dir(entity, ts.date_naive())
    }

    fn date_dir(&self, entity: &str, day: NaiveDate) -> PathBuf {
        self.base
            .join(entity)
            .join(format!("{:04}", day.year()))
            .join(format!("{:02}", day.month()))
            .join(format!("{:02}", day.day()))
    }

    /// First non-existing path for this second; same-second snapshots get a
    /// numeric discriminator so no file is ever rewritten.
    async fn fresh_path(&self, dir: &Path, ts: DateTime<Utc>, source: &str) -> Result<PathBuf> {
        let stamp = time_stamp(ts);
        let candidate = dir.join(format!("{stamp}-{source}.json"));
        if !tokio::fs::try_exists(&candidate)
            .await
            .map_err(|e| GatewayError::Pit(e.to_string()))?
        {
            return Ok(candidate);
        }
        for n in 1..10_000u32 {
            let candidate = dir.join(format!("{stamp}-{n}-{source}.json"));
            if !tokio::fs::try_exists(&candidate)
                .await
                .map_err(|e| GatewayError::Pit(e.to_string()))?
            {
                return Ok(candidate);
            }
        }
        Err(GatewayError::Pit(format!(
            "too many snapshots for {stamp}-{source}"
        )))
    }

    async fn load_verified(&self, path: &Path) -> Result<PitRecord> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| GatewayError::Pit(format!("read {}: {e}", path.display())))?;
        let record: PitRecord = serde_json::from_slice(&body)?;

        let expected = types::envelope::compute_checksum(
            &record.payload,
            record.ts,
            &record.entity,
            &record.source,
        );
        if expected != record.integrity_digest {
            return Err(GatewayError::Envelope(types::EnvelopeError::ChecksumMismatch {
                symbol: record.entity.clone(),
                source_name: record.source.clone(),
            }));
        }
        Ok(record)
    }
}

fn time_stamp(ts: DateTime<Utc>) -> String {
    format!("{:02}-{:02}-{:02}", ts.hour(), ts.minute(), ts.second())
}

async fn purge_entity(entity_dir: &Path, cutoff: NaiveDate) -> Result<usize> {
    let mut removed = 0;
    let mut years = tokio::fs::read_dir(entity_dir)
        .await
        .map_err(|e| GatewayError::Pit(e.to_string()))?;

    while let Some(year) = years
        .next_entry()
        .await
        .map_err(|e| GatewayError::Pit(e.to_string()))?
    {
        let mut months = match tokio::fs::read_dir(year.path()).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(month) = months
            .next_entry()
            .await
            .map_err(|e| GatewayError::Pit(e.to_string()))?
        {
            let mut days = match tokio::fs::read_dir(month.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(day) = days
                .next_entry()
                .await
                .map_err(|e| GatewayError::Pit(e.to_string()))?
            {
                let date = parse_date(&year, &month, &day);
                if let Some(date) = date {
                    if date < cutoff {
                        tokio::fs::remove_dir_all(day.path())
                            .await
                            .map_err(|e| GatewayError::Pit(e.to_string()))?;
                        removed += 1;
                    }
                }
            }
        }
    }
    Ok(removed)
}

fn parse_date(
    year: &tokio::fs::DirEntry,
    month: &tokio::fs::DirEntry,
    day: &tokio::fs::DirEntry,
) -> Option<NaiveDate> {
    let year: i32 = year.file_name().to_string_lossy().parse().ok()?;
    let month: u32 = month.file_name().to_string_lossy().parse().ok()?;
    let day: u32 = day.file_name().to_string_lossy().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store(dir: &tempfile::TempDir) -> PitStore {
        PitStore::new(
            &config::PitConfig {
                base_path: dir.path().display().to_string(),
                retention_days: 30,
                compression: false,
            },
            None,
        )
        .unwrap()
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 15, 14, 30, secs).unwrap()
    }

    #[tokio::test]
    async fn snapshot_lands_in_partitioned_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pit = store(&dir);

        let path = pit
            .snapshot("trades", ts(5), b"{\"p\":1}", "kraken")
            .await
            .unwrap();

        let expected = dir
            .path()
            .join("trades/2026/07/15/14-30-05-kraken.json");
        assert_eq!(path, expected);
        assert!(path.is_file());
        assert_eq!(pit.snapshots_written(), 1);
    }

    #[tokio::test]
    async fn snapshot_read_round_trips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let pit = store(&dir);

        pit.snapshot("trades", ts(7), b"payload-bytes", "binance")
            .await
            .unwrap();
        let record = pit.read("trades", ts(7)).await.unwrap();
        assert_eq!(record.payload, b"payload-bytes");
        assert_eq!(record.source, "binance");
    }

    #[tokio::test]
    async fn same_second_snapshots_never_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let pit = store(&dir);

        let first = pit.snapshot("trades", ts(9), b"one", "kraken").await.unwrap();
        let second = pit.snapshot("trades", ts(9), b"two", "kraken").await.unwrap();
        assert_ne!(first, second);
        assert!(second
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("14-30-09-1-kraken"));

        // The first file still holds the first payload.
        let record = pit.read("trades", ts(9)).await.unwrap();
        assert_eq!(record.payload, b"one");
    }

    #[tokio::test]
    async fn tampered_file_fails_digest_check() {
        let dir = tempfile::tempdir().unwrap();
        let pit = store(&dir);

        let path = pit.snapshot("trades", ts(3), b"honest", "kraken").await.unwrap();

        // Corrupt the payload field directly.
        let mut record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        record["payload"] = serde_json::Value::String("dGFtcGVyZWQ=".to_string());
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let err = pit.read("trades", ts(3)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Envelope(types::EnvelopeError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn list_returns_time_ordered_range() {
        let dir = tempfile::tempdir().unwrap();
        let pit = store(&dir);

        pit.snapshot("regime", ts(1), b"a", "scanner").await.unwrap();
        pit.snapshot("regime", ts(20), b"b", "scanner").await.unwrap();
        pit.snapshot("regime", ts(40), b"c", "scanner").await.unwrap();

        let records = pit.list("regime", ts(0), ts(25)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"a");
        assert_eq!(records[1].payload, b"b");
    }

    #[tokio::test]
    async fn purge_removes_only_expired_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let pit = PitStore::new(
            &config::PitConfig {
                base_path: dir.path().display().to_string(),
                retention_days: 7,
                compression: false,
            },
            None,
        )
        .unwrap();

        let old = Utc::now() - chrono::Duration::days(30);
        let fresh = Utc::now();
        pit.snapshot("trades", old, b"old", "kraken").await.unwrap();
        pit.snapshot("trades", fresh, b"fresh", "kraken").await.unwrap();

        let removed = pit.purge_expired().await.unwrap();
        assert_eq!(removed, 1);

        let all = pit
            .list("trades", Utc::now() - chrono::Duration::days(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, b"fresh");
    }
}
