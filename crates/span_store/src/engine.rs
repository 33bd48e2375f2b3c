//! Storage engine contract and the two engines that back it.
//!
//! The proposal pipeline only touches the engine through the narrow
//! [`Engine`] trait: point reads/writes for replica state records, batch
//! application of committed write batches, raft-consistent snapshots for
//! consistency checks, and the file-level operations the sideloaded SSTable
//! ingestion path needs. [`InMemEngine`] keeps everything in process memory
//! and is what most tests run against; [`DiskEngine`] stores row data in a
//! fjall keyspace and stages ingested files on the filesystem.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

use crate::command::{decode_sst_entries, BatchOp, WriteBatch};

/// Substring a failed no-modify ingestion reports when the engine would have
/// had to rewrite global sequence numbers.
pub const SEQ_NO_REQUIRED_MSG: &str = "Global seqno is required, but disabled";
/// Substring reported when re-ingesting a file that already carries a
/// nonzero sequence number.
pub const SEQ_NO_REINGEST_MSG: &str = "external file have non zero sequence number";

/// Engine-native error type. Callers that need to fall back on specific
/// failures (the ingestion path) discriminate on this type rather than on
/// strings alone.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ingest failed: {0}")]
    Ingest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether this is one of the two sequence-number complaints that make a
    /// no-modify ingestion retryable with a fresh copy. Any other error is
    /// not recoverable.
    pub fn is_seq_no_error(&self) -> bool {
        match self {
            EngineError::Ingest(msg) => {
                msg.contains(SEQ_NO_REQUIRED_MSG) || msg.contains(SEQ_NO_REINGEST_MSG)
            }
            _ => false,
        }
    }
}

fn storage_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(err.to_string())
}

/// A point-in-time view of the engine. Snapshots taken while holding the
/// raft mutex are raft-consistent: no command is mid-apply.
pub trait EngineSnapshot: Send + Sync {
    /// All key/value pairs in `[start, end)`, in key order. An empty `end`
    /// means no upper bound.
    fn scan(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// The storage engine as seen by the replica pipeline.
pub trait Engine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;
    fn delete(&self, key: &[u8]) -> Result<(), EngineError>;

    /// Apply a committed write batch atomically.
    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), EngineError>;

    fn new_snapshot(&self) -> Box<dyn EngineSnapshot>;

    /// Ingest externally written SSTable files. The engine takes ownership
    /// of each path on success. With `may_modify == false` the engine must
    /// refuse (with a sequence-number error) rather than rewrite the file.
    fn ingest_external_files(
        &self,
        paths: &[PathBuf],
        can_skip_seq_no: bool,
        may_modify: bool,
    ) -> Result<(), EngineError>;

    fn link_file(&self, src: &Path, dst: &Path) -> Result<(), EngineError>;
    fn delete_file(&self, path: &Path) -> Result<(), EngineError>;

    /// Back-pressure hook invoked before every ingestion.
    fn pre_ingest_delay(&self);

    /// Write a checkpoint of the engine's contents under `dir`.
    fn create_checkpoint(&self, dir: &Path) -> Result<(), EngineError>;

    /// Directory for engine-adjacent artifacts (checkpoints, staged files).
    fn auxiliary_dir(&self) -> PathBuf;

    /// Stage a named in-memory file for a later ingestion. Only the
    /// in-memory engine supports this.
    fn write_file(&self, _name: &str, _data: &[u8]) -> Result<(), EngineError> {
        Err(EngineError::Storage(
            "write_file is only supported by the in-memory engine".to_string(),
        ))
    }

    fn is_in_memory(&self) -> bool {
        false
    }
}

struct MaterializedSnapshot {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl EngineSnapshot for MaterializedSnapshot {
    fn scan(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        scan_map(&self.entries, start, end)
    }
}

fn scan_map(map: &BTreeMap<Vec<u8>, Vec<u8>>, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = if end.is_empty() {
        Box::new(map.range(start.to_vec()..))
    } else {
        Box::new(map.range(start.to_vec()..end.to_vec()))
    };
    iter.map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// In-memory engine used by tests and single-process tooling.
pub struct InMemEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    files: RwLock<HashMap<String, Bytes>>,
    checkpoints: Mutex<Vec<PathBuf>>,
    aux_dir: PathBuf,
}

impl Default for InMemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemEngine {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            files: RwLock::new(HashMap::new()),
            checkpoints: Mutex::new(Vec::new()),
            aux_dir: PathBuf::from("mem-auxiliary"),
        }
    }

    /// Checkpoint paths recorded so far, for tests.
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.checkpoints
            .lock()
            .expect("checkpoint mutex poisoned")
            .clone()
    }
}

impl Engine for InMemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let data = self.data.read().map_err(storage_err)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let mut data = self.data.write().map_err(storage_err)?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        let mut data = self.data.write().map_err(storage_err)?;
        data.remove(key);
        Ok(())
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), EngineError> {
        let ops = batch
            .decode()
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let mut data = self.data.write().map_err(storage_err)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn new_snapshot(&self) -> Box<dyn EngineSnapshot> {
        let data = self.data.read().expect("engine data lock poisoned");
        Box::new(MaterializedSnapshot {
            entries: data.clone(),
        })
    }

    fn ingest_external_files(
        &self,
        paths: &[PathBuf],
        _can_skip_seq_no: bool,
        _may_modify: bool,
    ) -> Result<(), EngineError> {
        for path in paths {
            let name = path.to_string_lossy().to_string();
            let payload = {
                let mut files = self.files.write().map_err(storage_err)?;
                files.remove(&name).ok_or_else(|| {
                    EngineError::Ingest(format!("no staged in-memory file named {name}"))
                })?
            };
            let entries = decode_sst_entries(&payload)
                .map_err(|err| EngineError::Ingest(err.to_string()))?;
            let mut data = self.data.write().map_err(storage_err)?;
            for (key, value) in entries {
                data.insert(key, value);
            }
        }
        Ok(())
    }

    fn link_file(&self, _src: &Path, _dst: &Path) -> Result<(), EngineError> {
        Err(EngineError::Storage(
            "in-memory engine has no filesystem".to_string(),
        ))
    }

    fn delete_file(&self, path: &Path) -> Result<(), EngineError> {
        let mut files = self.files.write().map_err(storage_err)?;
        files.remove(&path.to_string_lossy().to_string());
        Ok(())
    }

    fn pre_ingest_delay(&self) {}

    fn create_checkpoint(&self, dir: &Path) -> Result<(), EngineError> {
        let mut checkpoints = self.checkpoints.lock().map_err(storage_err)?;
        checkpoints.push(dir.to_path_buf());
        Ok(())
    }

    fn auxiliary_dir(&self) -> PathBuf {
        self.aux_dir.clone()
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let mut files = self.files.write().map_err(storage_err)?;
        files.insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

/// On-disk engine: row data in a fjall keyspace, ingested files staged on
/// the surrounding filesystem.
pub struct DiskEngine {
    dir: PathBuf,
    sst_dir: PathBuf,
    keyspace: Arc<Keyspace>,
    data: fjall::PartitionHandle,
    ingested_inodes: Mutex<HashSet<u64>>,
    pre_ingest_delay: Duration,
}

impl DiskEngine {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("create engine dir")?;
        let sst_dir = dir.join("sst");
        std::fs::create_dir_all(&sst_dir).context("create engine sst dir")?;
        let keyspace = Arc::new(fjall::Config::new(dir.join("data")).open()?);
        let data = keyspace.open_partition("range_data", PartitionCreateOptions::default())?;
        Ok(Self {
            dir,
            sst_dir,
            keyspace,
            data,
            ingested_inodes: Mutex::new(HashSet::new()),
            pre_ingest_delay: Duration::ZERO,
        })
    }

    pub fn with_pre_ingest_delay(mut self, delay: Duration) -> Self {
        self.pre_ingest_delay = delay;
        self
    }

    fn file_inode(path: &Path) -> Result<u64, EngineError> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.ino())
    }
}

impl Engine for DiskEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let value = self.data.get(key).map_err(storage_err)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.data.insert(key, value).map_err(storage_err)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.data.remove(key).map_err(storage_err)
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), EngineError> {
        let ops = batch
            .decode()
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let mut write = self.keyspace.batch();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => write.insert(&self.data, key, value),
                BatchOp::Delete { key } => write.remove(&self.data, key),
            }
        }
        write.commit().map_err(storage_err)
    }

    fn new_snapshot(&self) -> Box<dyn EngineSnapshot> {
        let mut entries = BTreeMap::new();
        for item in self.data.iter() {
            match item {
                Ok((k, v)) => {
                    entries.insert(k.to_vec(), v.to_vec());
                }
                Err(err) => {
                    tracing::error!(error = ?err, "engine snapshot scan failed");
                    break;
                }
            }
        }
        Box::new(MaterializedSnapshot { entries })
    }

    fn ingest_external_files(
        &self,
        paths: &[PathBuf],
        can_skip_seq_no: bool,
        may_modify: bool,
    ) -> Result<(), EngineError> {
        for path in paths {
            let inode = Self::file_inode(path)?;
            if !may_modify {
                let inodes = self.ingested_inodes.lock().map_err(storage_err)?;
                if inodes.contains(&inode) {
                    return Err(EngineError::Ingest(format!(
                        "cannot add file {}: {}",
                        path.display(),
                        SEQ_NO_REINGEST_MSG
                    )));
                }
                if !can_skip_seq_no {
                    return Err(EngineError::Ingest(format!(
                        "cannot add file {}: {}",
                        path.display(),
                        SEQ_NO_REQUIRED_MSG
                    )));
                }
            }

            let payload = std::fs::read(path)?;
            let entries = decode_sst_entries(&payload)
                .map_err(|err| EngineError::Ingest(err.to_string()))?;
            let mut write = self.keyspace.batch();
            for (key, value) in entries {
                write.insert(&self.data, key, value);
            }
            write.commit().map_err(storage_err)?;

            // Take ownership the way a real engine moves the file into its
            // own directory; the source inode stays linked from there.
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unnamed".to_string());
            let dst = self.sst_dir.join(format!("{inode:016x}_{name}"));
            std::fs::rename(path, &dst)?;
            self.ingested_inodes
                .lock()
                .map_err(storage_err)?
                .insert(inode);
        }
        Ok(())
    }

    fn link_file(&self, src: &Path, dst: &Path) -> Result<(), EngineError> {
        std::fs::hard_link(src, dst)?;
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<(), EngineError> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn pre_ingest_delay(&self) {
        if !self.pre_ingest_delay.is_zero() {
            std::thread::sleep(self.pre_ingest_delay);
        }
    }

    fn create_checkpoint(&self, dir: &Path) -> Result<(), EngineError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(storage_err)?;
        std::fs::create_dir_all(dir)?;

        let mut entries = Vec::new();
        for item in self.data.iter() {
            let (k, v) = item.map_err(storage_err)?;
            entries.push((k.to_vec(), v.to_vec()));
        }
        let count = entries.len();
        std::fs::write(dir.join("data.sst"), crate::command::encode_sst(&entries))?;

        let manifest = serde_json::json!({ "entries": count });
        std::fs::write(dir.join("manifest.json"), manifest.to_string())?;
        Ok(())
    }

    fn auxiliary_dir(&self) -> PathBuf {
        self.dir.join("auxiliary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WriteBatchBuilder;

    #[test]
    fn batch_application_is_visible_to_snapshots() {
        let engine = InMemEngine::new();
        let mut builder = WriteBatchBuilder::default();
        builder.put(b"a", b"1");
        builder.put(b"b", b"2");
        builder.delete(b"a");
        engine.apply_batch(&builder.finish()).expect("apply batch");

        let snap = engine.new_snapshot();
        let entries = snap.scan(b"", b"");
        assert_eq!(entries, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn in_memory_ingest_consumes_staged_file() {
        let engine = InMemEngine::new();
        let payload = crate::command::encode_sst(&[(b"k".to_vec(), b"v".to_vec())]);
        engine.write_file("abc123", &payload).expect("stage file");
        engine
            .ingest_external_files(&[PathBuf::from("abc123")], true, true)
            .expect("ingest");
        assert_eq!(engine.get(b"k").expect("get"), Some(b"v".to_vec()));

        let err = engine
            .ingest_external_files(&[PathBuf::from("abc123")], true, true)
            .expect_err("second ingest must fail");
        assert!(!err.is_seq_no_error());
    }
}
