//! Top-level wiring: configuration, storage, recovery, and the running
//! pieces of the batch stream.
//!
//! `StreamRuntime` is the composition root a trainer embeds: it owns the
//! storage backend and checkpoint store, answers the resume-or-cold-start
//! question once at startup, and hands out the provider and coordinator that
//! do the actual work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::checkpoint::{CheckpointCoordinator, CheckpointRecord, CheckpointStore, ResumeCursor};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::provider::DataProvider;
use crate::source::FrameSource;
use crate::storage::{LocalStorage, StorageBackend};
use crate::trainer::{ModelSnapshot, TrainerFacade};

pub struct StreamRuntime {
    config: StreamConfig,
    storage: Arc<dyn StorageBackend>,
    store: Arc<CheckpointStore>,
}

impl StreamRuntime {
    /// Builds the runtime from a validated configuration.
    ///
    /// # Errors
    ///
    /// Configuration validation and storage setup errors propagate.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        let store = Arc::new(CheckpointStore::new(Arc::clone(&storage), &config.checkpoint)?);

        info!(
            base_path = %config.storage.base_path.display(),
            checkpoint_dir = %config.checkpoint.checkpoint_dir.display(),
            "stream runtime initialized"
        );
        Ok(Self {
            config,
            storage,
            store,
        })
    }

    /// Builds the runtime from a TOML config file plus `BSTREAM_*`
    /// environment overrides.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(StreamConfig::from_file(path)?.with_env_overrides())
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Storage backend shared by frame sources and the checkpoint store.
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.storage)
    }

    pub fn checkpoint_store(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.store)
    }

    /// Finds the newest loadable checkpoint generation, or `None` for a
    /// cold start. Heals a stale or corrupt pointer file as a side effect.
    pub fn recover(&self) -> Result<Option<CheckpointRecord>> {
        self.store.recover()
    }

    /// Loads the model weights a recovered record points at.
    pub fn load_model(&self, record: &CheckpointRecord) -> Result<ModelSnapshot> {
        self.store.load_model(record)
    }

    /// Starts streaming minibatches from `start_frame`, which is either 0
    /// or a recovered record's `resume_frame`.
    pub fn open_provider(
        &self,
        source: Box<dyn FrameSource>,
        start_frame: u64,
    ) -> Result<DataProvider> {
        DataProvider::with_start_frame(&self.config.batching, source, start_frame)
    }

    /// Starts the periodic checkpoint coordinator.
    ///
    /// `next_generation` is `recovered.generation + 1`, or 1 on a cold
    /// start.
    pub fn start_coordinator(
        &self,
        trainer: Arc<dyn TrainerFacade>,
        cursor: Arc<dyn ResumeCursor>,
        next_generation: u64,
    ) -> CheckpointCoordinator {
        CheckpointCoordinator::start(
            Arc::clone(&self.store),
            trainer,
            cursor,
            Duration::from_secs(self.config.checkpoint.interval_secs),
            next_generation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, CheckpointConfig, StorageConfig};
    use crate::error::StreamError;
    use crate::source::FrameFileSource;
    use crate::trainer::{ModelLayer, TrainerProgress};
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_runtime(batch_size: usize) -> (StreamRuntime, TempDir) {
        init_test_logging();
        let temp_dir = TempDir::new().unwrap();
        let config = StreamConfig {
            storage: StorageConfig {
                base_path: temp_dir.path().to_path_buf(),
                ..Default::default()
            },
            batching: BatchConfig {
                batch_size,
                staging_batches: 4,
                ring_capacity: 2,
                seed: Some(5),
            },
            checkpoint: CheckpointConfig {
                checkpoint_dir: PathBuf::from("checkpoints"),
                interval_secs: 1,
                keep_last_n: 5,
                recovery_lookback: 16,
            },
        };
        (StreamRuntime::new(config).unwrap(), temp_dir)
    }

    /// Writes `frames` single-feature records where the feature value is the
    /// frame index.
    fn write_frames(runtime: &StreamRuntime, name: &str, frames: usize) {
        let storage = runtime.storage();
        let mut writer = storage.open_write(Path::new(name)).unwrap();
        for i in 0..frames {
            writer.write_all(&(i as f32).to_le_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn open_source(runtime: &StreamRuntime, name: &str) -> Box<dyn FrameSource> {
        Box::new(FrameFileSource::open(runtime.storage(), name, 1, 0).unwrap())
    }

    struct StaticTrainer {
        batch: u64,
    }

    impl TrainerFacade for StaticTrainer {
        fn progress(&self) -> TrainerProgress {
            TrainerProgress {
                batch: self.batch,
                epoch: 0,
            }
        }

        fn snapshot_model(&self) -> Result<ModelSnapshot> {
            Ok(ModelSnapshot {
                layers: vec![ModelLayer {
                    name: "out".to_string(),
                    activation: "softmax".to_string(),
                    rows: 1,
                    cols: 3,
                    weights: vec![0.1, 0.2, 0.3],
                }],
            })
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StreamConfig {
            batching: BatchConfig {
                // Fewer staging batches than ring slots breaks the resume
                // position guarantee.
                staging_batches: 2,
                ring_capacity: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            StreamRuntime::new(config),
            Err(StreamError::Config { .. })
        ));
    }

    #[test]
    fn test_from_config_file_with_validation() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("stream.toml");
        std::fs::write(
            &config_path,
            format!(
                "[storage]\nbase_path = \"{}\"\n\n[batching]\nbatch_size = 8\n",
                temp_dir.path().display()
            ),
        )
        .unwrap();

        let runtime = StreamRuntime::from_config_file(&config_path).unwrap();
        assert_eq!(runtime.config().batching.batch_size, 8);
    }

    #[test]
    fn test_cold_start_then_stream() {
        let (runtime, _temp) = test_runtime(4);
        write_frames(&runtime, "train.bin", 32);

        assert!(runtime.recover().unwrap().is_none());

        let provider = runtime.open_provider(open_source(&runtime, "train.bin"), 0).unwrap();
        let mut seen = BTreeSet::new();
        while let Ok(batch) = provider.get_batch_data(4, true) {
            for v in batch.features() {
                seen.insert(*v as u64);
            }
            drop(batch);
            provider.next_batch().unwrap();
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn test_coordinator_commits_generations() {
        let (runtime, _temp) = test_runtime(4);
        write_frames(&runtime, "train.bin", 4096);

        let provider =
            Arc::new(runtime.open_provider(open_source(&runtime, "train.bin"), 0).unwrap());
        let trainer = Arc::new(StaticTrainer { batch: 7 });
        let mut coordinator = runtime.start_coordinator(
            trainer,
            Arc::clone(&provider) as Arc<dyn ResumeCursor>,
            1,
        );

        // interval_secs is 1 in the test config; allow time for one tick.
        std::thread::sleep(Duration::from_millis(1400));
        coordinator.shutdown();

        let record = runtime.recover().unwrap().expect("one generation expected");
        assert!(record.generation >= 1);
        assert_eq!(record.batch, 7);
        let model = runtime.load_model(&record).unwrap();
        assert_eq!(model.layers[0].weights, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_checkpoint_restart_loses_no_frames() {
        let (runtime, _temp) = test_runtime(4);
        write_frames(&runtime, "train.bin", 256);

        // First run: consume part of the stream, commit a checkpoint by
        // hand, then stop as if the process crashed afterwards.
        let provider = runtime.open_provider(open_source(&runtime, "train.bin"), 0).unwrap();
        let mut consumed = BTreeSet::new();
        for _ in 0..20 {
            let batch = provider.get_batch_data(4, true).unwrap();
            for v in batch.features() {
                consumed.insert(*v as u64);
            }
            drop(batch);
            provider.next_batch().unwrap();
        }

        let record = CheckpointRecord {
            generation: 1,
            batch: 20,
            epoch: 0,
            resume_frame: provider.checkpoint_frame(),
            model_file: CheckpointStore::model_file_name(1),
        };
        runtime
            .checkpoint_store()
            .write_generation(&record, &StaticTrainer { batch: 20 }.snapshot_model().unwrap())
            .unwrap();
        drop(provider);

        // Second run: recover and stream from the recorded frame.
        let recovered = runtime.recover().unwrap().expect("generation 1");
        assert_eq!(recovered.generation, 1);

        let provider = runtime
            .open_provider(open_source(&runtime, "train.bin"), recovered.resume_frame)
            .unwrap();
        while let Ok(batch) = provider.get_batch_data(4, true) {
            for v in batch.features() {
                consumed.insert(*v as u64);
            }
            drop(batch);
            provider.next_batch().unwrap();
        }

        assert_eq!(consumed.len(), 256, "some frames were never delivered");
    }
}
