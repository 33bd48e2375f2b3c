//! Ingesting a committed sideloaded SSTable into the engine.
//!
//! The payload already sits on disk next to the raft log, so the fast path
//! hard-links it into place and ingests without modification. Engines
//! refuse to re-ingest a file they would have to rewrite; on the two
//! recognizable sequence-number complaints the slow path writes a fresh
//! copy with a size-limited, fsync-ing writer and ingests that instead.
//! Everything else that can go wrong here is fatal: the command committed,
//! so failing to ingest means diverging from the other replicas.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::command::AddSstable;
use crate::engine::Engine;
use crate::sideload::SideloadStorage;
use crate::store::StoreConfig;

/// CRC32 over a sideloaded payload.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Ingest the sideloaded SSTable for the command at `(term, index)`.
/// Returns whether a physical copy of the payload was written.
pub fn add_sstable_pre_apply(
    cfg: &StoreConfig,
    engine: &dyn Engine,
    sideloaded: &dyn SideloadStorage,
    term: u64,
    index: u64,
    sst: &AddSstable,
) -> bool {
    let checksum = crc32(&sst.data);
    if checksum != sst.crc32 {
        panic!(
            "checksum for sideloaded sstable at term {term}, index {index} does not match; at proposal time {:x} ({}), now {checksum:x} ({checksum})",
            sst.crc32, sst.crc32
        );
    }

    const MODIFY: bool = true;
    const NO_MODIFY: bool = false;

    let path = match sideloaded.filename(index, term) {
        Ok(path) => path,
        Err(err) => panic!("sideloaded sstable at term {term}, index {index} is missing: {err}"),
    };

    engine.pre_ingest_delay();

    // Once every binary reading these files understands skipped sequence
    // numbers, the engine can take the file without the rewrite that forces
    // a copy.
    let can_skip_seq_no = cfg.versions.unreplicated_truncated_state;

    let mut copied = false;
    let ingest_source = if engine.is_in_memory() {
        let name = format!("{checksum:x}");
        if let Err(err) = engine.write_file(&name, &sst.data) {
            panic!("unable to stage in-memory sstable {name}: {err}");
        }
        PathBuf::from(name)
    } else {
        let ingest_path = path_with_ingested_suffix(&path);

        // The payload is already on disk thanks to sideloading. Hand the
        // engine a hard link if the file still has a single link; more than
        // one means a previous ingestion already linked it, and the engine
        // will not accept the same inode twice.
        let mut can_link_to_raft_file = false;
        if let Ok(meta) = std::fs::metadata(&path) {
            use std::os::unix::fs::MetadataExt;
            let links = meta.nlink();
            if links == 1 {
                can_link_to_raft_file = true;
            } else {
                tracing::warn!(
                    index,
                    term,
                    links,
                    "sstable may have already been ingested; falling back to ingesting a copy"
                );
            }
        }

        let mut linked_and_ingested = false;
        if can_link_to_raft_file {
            // The engine deletes the path it is given on success, so it must
            // not get the sideloaded file itself.
            if engine.link_file(&path, &ingest_path).is_ok() {
                match engine.ingest_external_files(
                    &[ingest_path.clone()],
                    can_skip_seq_no,
                    NO_MODIFY,
                ) {
                    Ok(()) => {
                        tracing::debug!(index, term, path = %ingest_path.display(), "ingested sstable");
                        linked_and_ingested = true;
                    }
                    Err(ingest_err) => {
                        if let Err(rm_err) = engine.delete_file(&ingest_path) {
                            panic!("failed to remove partial ingest sst: {rm_err}");
                        }
                        // Even with the link count checked, the engine may
                        // have compacted the file away and still refuse its
                        // inode. Only the sequence-number complaints are
                        // retryable with a copy; the retry must succeed or
                        // crash, so nothing is swallowed.
                        if !ingest_err.is_seq_no_error() {
                            panic!(
                                "while ingesting {}: {ingest_err}",
                                ingest_path.display()
                            );
                        }
                    }
                }
            }
        }
        if linked_and_ingested {
            return false;
        }

        tracing::debug!(index, term, path = %ingest_path.display(), "copying sstable for ingestion");

        if let Some(parent) = ingest_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                panic!("unable to create ingest dir {}: {err}", parent.display());
            }
        }
        if ingest_path.exists() {
            // Ingestion may apply twice (it runs before the command is
            // marked applied); unlink the stale copy and write it again.
            if let Err(err) = std::fs::remove_file(&ingest_path) {
                panic!(
                    "while removing existing file during ingestion of {}: {err}",
                    ingest_path.display()
                );
            }
        }
        if let Err(err) = write_file_syncing(&ingest_path, &sst.data, cfg.sst_bytes_per_sync) {
            panic!("while ingesting {}: {err}", ingest_path.display());
        }
        copied = true;
        ingest_path
    };

    if let Err(err) = engine.ingest_external_files(&[ingest_source.clone()], can_skip_seq_no, MODIFY)
    {
        panic!("while ingesting {}: {err}", ingest_source.display());
    }
    tracing::debug!(index, term, path = %ingest_source.display(), "ingested sstable");
    copied
}

fn path_with_ingested_suffix(path: &Path) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(".ingested");
    PathBuf::from(os)
}

/// Write `data` to `path`, syncing every `bytes_per_sync` bytes so a large
/// copy cannot accumulate an unbounded flush debt, then sync the file to
/// disk.
pub(crate) fn write_file_syncing(
    path: &Path,
    data: &[u8],
    bytes_per_sync: usize,
) -> std::io::Result<()> {
    let chunk = bytes_per_sync.max(1);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    for piece in data.chunks(chunk) {
        file.write_all(piece)?;
        file.sync_data()?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::encode_sst;
    use crate::engine::{DiskEngine, InMemEngine};
    use crate::sideload::{DiskSideload, InMemSideload};
    use bytes::Bytes;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("span_store_{name}_{}_{}", std::process::id(), nanos))
    }

    fn payload() -> Bytes {
        encode_sst(&[
            (b"ingest-a".to_vec(), b"1".to_vec()),
            (b"ingest-b".to_vec(), b"2".to_vec()),
        ])
    }

    #[test]
    fn matching_crc_ingests_into_in_memory_engine() {
        let cfg = StoreConfig::default();
        let engine = InMemEngine::new();
        let sideloaded = InMemSideload::default();
        let data = payload();
        sideloaded.put(7, 2, &data).expect("put");

        let sst = AddSstable {
            crc32: crc32(&data),
            data,
        };
        let copied = add_sstable_pre_apply(&cfg, &engine, &sideloaded, 2, 7, &sst);
        assert!(!copied);
        assert_eq!(engine.get(b"ingest-a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"ingest-b").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn corrupted_payload_is_fatal() {
        let cfg = StoreConfig::default();
        let engine = InMemEngine::new();
        let sideloaded = InMemSideload::default();
        let data = payload();
        sideloaded.put(7, 2, &data).expect("put");

        let mut corrupted = data.to_vec();
        corrupted[0] ^= 0x01;
        let sst = AddSstable {
            crc32: crc32(&data),
            data: corrupted.into(),
        };
        add_sstable_pre_apply(&cfg, &engine, &sideloaded, 2, 7, &sst);
    }

    #[test]
    #[should_panic(expected = "is missing")]
    fn missing_sideloaded_file_is_fatal() {
        let cfg = StoreConfig::default();
        let engine = InMemEngine::new();
        let sideloaded = InMemSideload::default();
        let data = payload();
        let sst = AddSstable {
            crc32: crc32(&data),
            data,
        };
        add_sstable_pre_apply(&cfg, &engine, &sideloaded, 2, 7, &sst);
    }

    #[test]
    fn first_ingest_links_and_replay_copies() {
        let dir = temp_dir("ingest_link_then_copy");
        let cfg = StoreConfig::default();
        let engine = DiskEngine::open(dir.join("engine")).expect("open engine");
        let sideloaded = DiskSideload::new(dir.join("sideload")).expect("open sideload");

        let data = payload();
        sideloaded.put(11, 3, &data).expect("put");
        let sst = AddSstable {
            crc32: crc32(&data),
            data,
        };

        // Fresh file with a single link: the engine gets a hard link, no
        // copy happens.
        let copied = add_sstable_pre_apply(&cfg, &engine, &sideloaded, 3, 11, &sst);
        assert!(!copied);
        assert_eq!(engine.get(b"ingest-a").expect("get"), Some(b"1".to_vec()));

        // Replay: the sideloaded file's inode is now linked from the engine
        // directory, so the link-count heuristic rejects it and a fresh
        // copy is written.
        let copied = add_sstable_pre_apply(&cfg, &engine, &sideloaded, 3, 11, &sst);
        assert!(copied);
        assert_eq!(engine.get(b"ingest-b").expect("get"), Some(b"2".to_vec()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn syncing_writer_round_trips_with_tiny_chunks() {
        let dir = temp_dir("syncing_writer");
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("payload");
        let data = vec![0xabu8; 10_000];
        write_file_syncing(&path, &data, 1024).expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), data);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
