//! Checkpoint generation storage: commit, retention, and recovery.
//!
//! One checkpoint generation is two files in the checkpoint directory, a
//! model weight file written first and a small state record written second,
//! plus a shared pointer file naming the newest generation:
//!
//! ```text
//! model_{id}.dnn    weights, committed via the FAIL/DONE tag protocol
//! state_{id}.ckpt   progress record, committed the same way
//! latest            decimal text, id of the newest committed generation
//! ```
//!
//! Each file is written in three durable phases: prologue with a "FAIL" tag,
//! payload plus checksum, then the tag flipped to "DONE". A crash at any
//! point leaves either no file, a "FAIL"-tagged file, or a complete one, so
//! recovery can always classify what it finds.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::format::{
    self, CheckpointRecord, CHECKSUM_LEN, PAYLOAD_OFFSET, TAG_DONE, TAG_FAIL, TAG_LEN,
};
use crate::config::CheckpointConfig;
use crate::error::{Result, StreamError};
use crate::storage::{StorageBackend, StorageFile};
use crate::trainer::ModelSnapshot;

const POINTER_FILE: &str = "latest";

pub struct CheckpointStore {
    storage: Arc<dyn StorageBackend>,
    dir: PathBuf,
    keep_last_n: usize,
    recovery_lookback: u64,
}

impl CheckpointStore {
    /// Creates a store over the configured checkpoint directory, creating
    /// the directory if needed.
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        storage.create_dir_all(&config.checkpoint_dir)?;
        Ok(Self {
            storage,
            dir: config.checkpoint_dir.clone(),
            keep_last_n: config.keep_last_n,
            recovery_lookback: config.recovery_lookback,
        })
    }

    /// Relative filename of a generation's model file.
    pub fn model_file_name(generation: u64) -> String {
        format!("model_{generation}.dnn")
    }

    fn state_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("state_{generation}.ckpt"))
    }

    fn model_path(&self, generation: u64) -> PathBuf {
        self.dir.join(Self::model_file_name(generation))
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    /// Commits one full generation: model file, then state record, then the
    /// pointer file. Returns only after everything is durable.
    ///
    /// The pointer moves last, so a crash anywhere earlier leaves the
    /// previous generation as the recovery target.
    ///
    /// # Errors
    ///
    /// Storage errors propagate; a failed commit leaves at worst a
    /// "FAIL"-tagged pair of files that recovery will skip.
    pub fn write_generation(&self, record: &CheckpointRecord, model: &ModelSnapshot) -> Result<()> {
        debug_assert_eq!(record.model_file, Self::model_file_name(record.generation));

        self.write_tagged_file(&self.model_path(record.generation), &format::model_to_payload(model))?;
        self.write_tagged_file(&self.state_path(record.generation), &record.to_payload())?;
        self.write_pointer(record.generation)?;

        info!(
            generation = record.generation,
            batch = record.batch,
            resume_frame = record.resume_frame,
            "checkpoint generation committed"
        );

        self.prune(record.generation);
        Ok(())
    }

    /// Writes a file under the three-phase tag protocol.
    fn write_tagged_file(&self, path: &Path, payload: &[u8]) -> Result<()> {
        // A stale file from a retained older run must not be partially
        // overlaid; start from an empty file.
        self.storage.delete(path)?;
        let mut file = self.storage.open_update(path)?;

        // Phase 1: prologue with the failure tag.
        let mut prologue = [0u8; PAYLOAD_OFFSET];
        prologue[CHECKSUM_LEN..].copy_from_slice(&TAG_FAIL);
        write_at(file.as_mut(), path, 0, &prologue)?;
        file.sync()?;

        // Phase 2: payload, then the checksum over it.
        write_at(file.as_mut(), path, PAYLOAD_OFFSET as u64, payload)?;
        write_at(file.as_mut(), path, 0, &format::checksum_region(payload))?;
        file.sync()?;

        // Phase 3: flip the tag; the file is now valid.
        write_at(file.as_mut(), path, CHECKSUM_LEN as u64, &TAG_DONE)?;
        file.sync()?;
        Ok(())
    }

    fn write_pointer(&self, generation: u64) -> Result<()> {
        // Staged through a rename so the pointer is never half-written.
        let tmp = self.dir.join("latest.tmp");
        let mut writer = self.storage.open_write(&tmp)?;
        writer.write_all(generation.to_string().as_bytes()).map_err(|e| {
            StreamError::storage_with_source(&tmp, "failed to write pointer file", e)
        })?;
        writer.finish()?;
        self.storage.rename(&tmp, &self.pointer_path())
    }

    /// Generation id named by the pointer file, or `None` if no pointer
    /// exists yet.
    ///
    /// # Errors
    ///
    /// An unreadable or non-numeric pointer is a checkpoint error; recovery
    /// treats it the same as a missing pointer.
    pub fn latest_id(&self) -> Result<Option<u64>> {
        let path = self.pointer_path();
        if !self.storage.exists(&path)? {
            return Ok(None);
        }

        let mut reader = self.storage.open_read(&path)?;
        let mut text = String::new();
        reader.read_to_string(&mut text).map_err(|e| {
            StreamError::checkpoint_with_source("pointer file is not readable text", e)
        })?;

        let id = text.trim().parse::<u64>().map_err(|e| {
            StreamError::checkpoint_with_source(
                format!("pointer file holds '{}', not a generation id", text.trim()),
                e,
            )
        })?;
        Ok(Some(id))
    }

    /// Loads and validates one generation's state record.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::CorruptCheckpoint`] if the file is missing its
    /// "DONE" tag or fails checksum verification.
    pub fn load_generation(&self, generation: u64) -> Result<CheckpointRecord> {
        let payload = self.read_tagged_file(&self.state_path(generation), generation)?;
        let record = CheckpointRecord::from_payload(&payload)?;
        if record.generation != generation {
            return Err(StreamError::corrupt(
                generation,
                format!("record names generation {}", record.generation),
            ));
        }
        Ok(record)
    }

    /// Loads the model weights a state record points at.
    ///
    /// # Errors
    ///
    /// Same validation as [`load_generation`](Self::load_generation).
    pub fn load_model(&self, record: &CheckpointRecord) -> Result<ModelSnapshot> {
        let path = self.dir.join(&record.model_file);
        let payload = self.read_tagged_file(&path, record.generation)?;
        format::model_from_payload(&payload)
    }

    /// Reads a tag-protected file and verifies tag and checksum.
    fn read_tagged_file(&self, path: &Path, generation: u64) -> Result<Vec<u8>> {
        let mut reader = self.storage.open_read(path)?;
        let size = reader.size();
        if (size as usize) < PAYLOAD_OFFSET {
            return Err(StreamError::corrupt(
                generation,
                format!("file {} shorter than its prologue", path.display()),
            ));
        }

        let prologue = reader.read_range(0, PAYLOAD_OFFSET)?;
        let tag: [u8; TAG_LEN] = prologue[CHECKSUM_LEN..]
            .try_into()
            .map_err(|_| StreamError::corrupt(generation, "truncated tag"))?;
        if tag != TAG_DONE {
            return Err(StreamError::corrupt(
                generation,
                format!(
                    "file {} carries tag {:?}, commit never completed",
                    path.display(),
                    String::from_utf8_lossy(&tag)
                ),
            ));
        }

        let payload = reader.read_range(PAYLOAD_OFFSET as u64, (size as usize) - PAYLOAD_OFFSET)?;
        let stored = u64::from_le_bytes(
            prologue[..8]
                .try_into()
                .map_err(|_| StreamError::corrupt(generation, "truncated checksum"))?,
        );
        let computed = format::payload_checksum(&payload);
        if stored != computed {
            return Err(StreamError::corrupt(
                generation,
                format!(
                    "file {} checksum mismatch: stored {stored:#x}, computed {computed:#x}",
                    path.display()
                ),
            ));
        }
        Ok(payload)
    }

    /// Finds the newest loadable generation, healing the pointer file if it
    /// lags or points at a corrupt generation.
    ///
    /// The scan starts one above the pointer (the pointer update is the last
    /// commit step, so a crash can leave a complete generation the pointer
    /// does not name yet) and walks downward through the configured
    /// lookback. Returns `None` for a cold start.
    ///
    /// # Errors
    ///
    /// Storage errors propagate; corrupt generations are skipped, not
    /// errors.
    pub fn recover(&self) -> Result<Option<CheckpointRecord>> {
        let pointer = match self.latest_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "checkpoint pointer unreadable, scanning without it");
                None
            }
        };

        let top = match pointer {
            Some(id) => id + 1,
            None => match self.newest_state_file()? {
                Some(id) => id,
                None => {
                    info!("no checkpoint generations found, cold start");
                    return Ok(None);
                }
            },
        };
        let bottom = top.saturating_sub(self.recovery_lookback);

        for id in (bottom..=top).rev() {
            if !self.storage.exists(&self.state_path(id))? {
                continue;
            }
            match self.load_generation(id).and_then(|record| {
                // The model file must also be loadable or the generation is
                // useless for resumption.
                self.load_model(&record)?;
                Ok(record)
            }) {
                Ok(record) => {
                    if pointer != Some(id) {
                        warn!(
                            pointer = ?pointer,
                            generation = id,
                            "healing checkpoint pointer"
                        );
                        self.write_pointer(id)?;
                    }
                    info!(
                        generation = id,
                        resume_frame = record.resume_frame,
                        "recovered checkpoint generation"
                    );
                    return Ok(Some(record));
                }
                Err(e) => {
                    warn!(generation = id, error = %e, "skipping unloadable generation");
                }
            }
        }

        info!(
            lookback = self.recovery_lookback,
            "no loadable generation within lookback, cold start"
        );
        Ok(None)
    }

    /// Highest generation id with a state file on disk, pointer or not.
    fn newest_state_file(&self) -> Result<Option<u64>> {
        let mut newest = None;
        for name in self.storage.list(&self.dir)? {
            if let Some(id) = name
                .strip_prefix("state_")
                .and_then(|rest| rest.strip_suffix(".ckpt"))
                .and_then(|id| id.parse::<u64>().ok())
            {
                newest = newest.max(Some(id));
            }
        }
        Ok(newest)
    }

    /// Deletes the generation that just fell out of the retention window.
    ///
    /// Retention failures are logged and ignored; an undeletable old
    /// generation must not fail the commit that produced a new one.
    fn prune(&self, committed: u64) {
        let Some(stale) = committed.checked_sub(self.keep_last_n as u64) else {
            return;
        };
        for path in [self.state_path(stale), self.model_path(stale)] {
            if let Err(e) = self.storage.delete(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune old checkpoint file");
            }
        }
        debug!(generation = stale, "pruned checkpoint generation");
    }
}

/// Positioned write against a [`StorageFile`].
fn write_at(file: &mut dyn StorageFile, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        StreamError::storage_with_source(path, format!("failed to seek to offset {offset}"), e)
    })?;
    file.write_all(data).map_err(|e| {
        StreamError::storage_with_source(path, format!("failed to write at offset {offset}"), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::LocalStorage;
    use crate::trainer::ModelLayer;
    use tempfile::TempDir;

    fn create_test_store(keep_last_n: usize, lookback: u64) -> (CheckpointStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&storage_config).unwrap());
        let config = CheckpointConfig {
            checkpoint_dir: PathBuf::from("checkpoints"),
            interval_secs: 60,
            keep_last_n,
            recovery_lookback: lookback,
        };
        (CheckpointStore::new(storage, &config).unwrap(), temp_dir)
    }

    fn test_record(generation: u64) -> CheckpointRecord {
        CheckpointRecord {
            generation,
            batch: generation * 100,
            epoch: generation / 3,
            resume_frame: generation * 6400,
            model_file: CheckpointStore::model_file_name(generation),
        }
    }

    fn test_model(seed: f32) -> ModelSnapshot {
        ModelSnapshot {
            layers: vec![ModelLayer {
                name: "hidden".to_string(),
                activation: "sigmoid".to_string(),
                rows: 2,
                cols: 3,
                weights: (0..6).map(|i| seed + i as f32).collect(),
            }],
        }
    }

    #[test]
    fn test_write_and_load_generation() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(0.5)).unwrap();

        assert_eq!(store.latest_id().unwrap(), Some(1));
        let record = store.load_generation(1).unwrap();
        assert_eq!(record, test_record(1));
        let model = store.load_model(&record).unwrap();
        assert_eq!(model, test_model(0.5));
    }

    #[test]
    fn test_pointer_tracks_newest() {
        let (store, _temp) = create_test_store(5, 16);

        for id in 1..=3 {
            store.write_generation(&test_record(id), &test_model(id as f32)).unwrap();
        }
        assert_eq!(store.latest_id().unwrap(), Some(3));
    }

    #[test]
    fn test_retention_keeps_last_n() {
        let (store, _temp) = create_test_store(5, 16);

        for id in 1..=7 {
            store.write_generation(&test_record(id), &test_model(id as f32)).unwrap();
        }

        // Generations 3..=7 remain, 1 and 2 are gone.
        for id in 1..=2 {
            assert!(store.load_generation(id).is_err(), "generation {id} should be pruned");
        }
        for id in 3..=7 {
            store.load_generation(id).unwrap();
        }
    }

    #[test]
    fn test_recover_newest() {
        let (store, _temp) = create_test_store(5, 16);

        for id in 1..=3 {
            store.write_generation(&test_record(id), &test_model(id as f32)).unwrap();
        }

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 3);
    }

    #[test]
    fn test_recover_cold_start() {
        let (store, _temp) = create_test_store(5, 16);
        assert!(store.recover().unwrap().is_none());
    }

    #[test]
    fn test_recover_skips_interrupted_commit() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();
        store.write_generation(&test_record(2), &test_model(2.0)).unwrap();

        // Simulate a crash mid-commit of generation 2: revert its tag.
        let state_path = store.state_path(2);
        let mut file = store.storage.open_update(&state_path).unwrap();
        file.seek(SeekFrom::Start(CHECKSUM_LEN as u64)).unwrap();
        file.write_all(&TAG_FAIL).unwrap();
        file.sync().unwrap();

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 1);
        // Pointer healed to the generation actually recovered.
        assert_eq!(store.latest_id().unwrap(), Some(1));
    }

    #[test]
    fn test_recover_detects_payload_corruption() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();
        store.write_generation(&test_record(2), &test_model(2.0)).unwrap();

        // Flip a payload byte in generation 2's record; the tag still says
        // DONE but the checksum no longer matches.
        let state_path = store.state_path(2);
        let mut file = store.storage.open_update(&state_path).unwrap();
        file.seek(SeekFrom::Start(PAYLOAD_OFFSET as u64)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(PAYLOAD_OFFSET as u64)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        file.sync().unwrap();

        assert!(matches!(
            store.load_generation(2),
            Err(StreamError::CorruptCheckpoint { generation: 2, .. })
        ));
        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 1);
    }

    #[test]
    fn test_recover_finds_generation_above_stale_pointer() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();
        store.write_generation(&test_record(2), &test_model(2.0)).unwrap();

        // Simulate a crash after generation 2's files committed but before
        // the pointer moved.
        store.write_pointer(1).unwrap();

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 2);
        assert_eq!(store.latest_id().unwrap(), Some(2));
    }

    #[test]
    fn test_recover_without_pointer_scans_state_files() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(4), &test_model(4.0)).unwrap();
        store.storage.delete(&store.pointer_path()).unwrap();

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 4);
        assert_eq!(store.latest_id().unwrap(), Some(4));
    }

    #[test]
    fn test_recover_respects_lookback() {
        let (store, _temp) = create_test_store(10, 2);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();
        for id in 4..=6 {
            store.write_generation(&test_record(id), &test_model(id as f32)).unwrap();
        }

        // Corrupt everything within lookback of the pointer (6): 4, 5, 6.
        for id in 4..=6 {
            let mut file = store.storage.open_update(&store.state_path(id)).unwrap();
            file.seek(SeekFrom::Start(CHECKSUM_LEN as u64)).unwrap();
            file.write_all(&TAG_FAIL).unwrap();
            file.sync().unwrap();
        }

        // Generation 1 is loadable but outside the lookback window.
        assert!(store.recover().unwrap().is_none());
    }

    #[test]
    fn test_missing_model_file_invalidates_generation() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();
        store.write_generation(&test_record(2), &test_model(2.0)).unwrap();
        store.storage.delete(&store.model_path(2)).unwrap();

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 1);
    }

    #[test]
    fn test_garbage_pointer_falls_back_to_scan() {
        let (store, _temp) = create_test_store(5, 16);

        store.write_generation(&test_record(1), &test_model(1.0)).unwrap();

        let mut writer = store.storage.open_write(&store.pointer_path()).unwrap();
        writer.write_all(b"not-a-number").unwrap();
        writer.finish().unwrap();

        let recovered = store.recover().unwrap().unwrap();
        assert_eq!(recovered.generation, 1);
        assert_eq!(store.latest_id().unwrap(), Some(1));
    }
}
