//! Checkpoint (C7): periodic durable snapshot of `{ledger, source cursor,
//! last_lsn}`, enabling WAL recovery to skip replaying the full history.
//!
//! Grounded on the teacher's `settlement_wal::snapshot::SettlementSnapshotter`
//! atomic-rename discipline — temp dir, metadata + marker, rename, `latest`
//! symlink — generalized from a single `last_trade_id` counter to the full
//! `{ledger snapshot, (timestamp_ns, seq), last_lsn}` tuple spec §4.6
//! requires.

use crate::core_types::{Lsn, Nanos, Seq};
use crate::ledger::LedgerSnapshot;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub cursor_ns: Nanos,
    pub cursor_seq: Seq,
    pub last_lsn: Lsn,
    pub created_at_ns: u64,
}

impl CheckpointMetadata {
    pub const FORMAT_VERSION: u32 = 1;
}

pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub ledger: LedgerSnapshot,
}

/// Creates and loads checkpoints under `root/checkpoint-{last_lsn}/`, with a
/// `latest` symlink, mirroring the teacher's `snapshots/` layout.
pub struct Checkpointer {
    root: PathBuf,
}

impl Checkpointer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn create(
        &self,
        cursor: (Nanos, Seq),
        last_lsn: Lsn,
        ledger: &LedgerSnapshot,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;

        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_dir = self.root.join(format!(".tmp-{now_ns}"));
        fs::create_dir_all(&temp_dir)?;

        let metadata = CheckpointMetadata {
            format_version: CheckpointMetadata::FORMAT_VERSION,
            cursor_ns: cursor.0,
            cursor_seq: cursor.1,
            last_lsn,
            created_at_ns: now_ns as u64,
        };

        {
            let file = File::create(temp_dir.join("metadata.json"))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &metadata)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.flush()?;
        }

        {
            let ledger_bytes = bincode::serialize(ledger)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(temp_dir.join("ledger.bin"), ledger_bytes)?;
        }

        fs::write(temp_dir.join("COMPLETE"), "")?;

        let final_dir = self.root.join(format!("checkpoint-{last_lsn}"));
        let _ = fs::remove_dir_all(&final_dir);
        fs::rename(&temp_dir, &final_dir)?;

        let latest_path = self.root.join("latest");
        let _ = fs::remove_file(&latest_path);

        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;
            symlink(format!("checkpoint-{last_lsn}"), &latest_path)?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&latest_path, format!("checkpoint-{last_lsn}"))?;
        }

        tracing::info!(last_lsn, path = %final_dir.display(), "checkpoint created");
        Ok(final_dir)
    }

    pub fn load_latest(&self) -> io::Result<Option<Checkpoint>> {
        let latest_path = self.root.join("latest");
        if !latest_path.exists() {
            return Ok(None);
        }

        let checkpoint_dir = self.resolve_latest(&latest_path)?;

        if !checkpoint_dir.join("COMPLETE").exists() {
            tracing::warn!(path = %checkpoint_dir.display(), "checkpoint incomplete, ignoring");
            return Ok(None);
        }

        let metadata: CheckpointMetadata = {
            let file = File::open(checkpoint_dir.join("metadata.json"))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        };

        let ledger: LedgerSnapshot = {
            let bytes = fs::read(checkpoint_dir.join("ledger.bin"))?;
            bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        };

        Ok(Some(Checkpoint { metadata, ledger }))
    }

    fn resolve_latest(&self, latest_path: &Path) -> io::Result<PathBuf> {
        let target = if latest_path.is_symlink() {
            fs::read_link(latest_path)?
        } else {
            PathBuf::from(fs::read_to_string(latest_path)?.trim())
        };
        Ok(self.root.join(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Symbol;
    use crate::ledger::Ledger;
    use crate::money::Price;
    use rust_decimal::Decimal;

    fn test_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "broker_sim_checkpoint_test_{}_{}",
            std::process::id(),
            name
        ))
    }

    #[test]
    fn create_then_load_round_trips() {
        let dir = test_dir("round_trip");
        let _ = fs::remove_dir_all(&dir);

        let mut ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), true, None, None);
        ledger.apply_fill(
            &Symbol::new("AAPL"),
            crate::core_types::Side::Buy,
            10,
            Price::new(Decimal::from(100)),
            crate::money::Fee::zero(),
        );

        let checkpointer = Checkpointer::new(&dir);
        checkpointer.create((1_000, 5), 42, &ledger.snapshot()).unwrap();

        let loaded = checkpointer.load_latest().unwrap().unwrap();
        assert_eq!(loaded.metadata.last_lsn, 42);
        assert_eq!(loaded.metadata.cursor_ns, 1_000);
        assert_eq!(loaded.ledger.account.cash(), ledger.account().cash());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cold_start_returns_none() {
        let dir = test_dir("cold_start");
        let _ = fs::remove_dir_all(&dir);
        let checkpointer = Checkpointer::new(&dir);
        assert!(checkpointer.load_latest().unwrap().is_none());
    }

    #[test]
    fn incomplete_checkpoint_is_ignored() {
        let dir = test_dir("incomplete");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("checkpoint-1")).unwrap();
        fs::write(
            dir.join("checkpoint-1").join("metadata.json"),
            r#"{"format_version":1,"cursor_ns":0,"cursor_seq":0,"last_lsn":1,"created_at_ns":0}"#,
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;
            symlink("checkpoint-1", dir.join("latest")).unwrap();
        }
        let checkpointer = Checkpointer::new(&dir);
        assert!(checkpointer.load_latest().unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
