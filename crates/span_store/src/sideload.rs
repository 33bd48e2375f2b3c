//! Sideloaded storage: content-addressable files for large raft payloads.
//!
//! Pre-ingested SSTables bypass the raft log proper; the log entry carries
//! only a reference and the payload lands here, keyed by (index, term). Log
//! truncation must also truncate this storage and report the freed bytes so
//! the raft-log-size accounting stays honest.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

/// Storage for sideloaded raft payloads.
pub trait SideloadStorage: Send + Sync + 'static {
    /// Store the payload for the entry at `(index, term)`.
    fn put(&self, index: u64, term: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Path of the payload for `(index, term)`. An error means the file is
    /// missing, which callers on the apply path treat as fatal.
    fn filename(&self, index: u64, term: u64) -> anyhow::Result<PathBuf>;

    /// Drop all payloads with index below `first_kept_index`. Returns
    /// `(bytes_freed, bytes_retained)`.
    fn truncate_to(&self, first_kept_index: u64) -> anyhow::Result<(u64, u64)>;
}

/// Filesystem-backed sideloaded storage, one file per entry.
pub struct DiskSideload {
    dir: PathBuf,
}

impl DiskSideload {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("create sideload dir")?;
        Ok(Self { dir })
    }

    fn path_for(&self, index: u64, term: u64) -> PathBuf {
        self.dir.join(format!("i{index:020}.t{term}"))
    }
}

fn parse_entry_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix('i')?;
    let (index, term) = rest.split_once(".t")?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

impl SideloadStorage for DiskSideload {
    fn put(&self, index: u64, term: u64, data: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(index, term);
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("create sideloaded file {}", path.display()))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn filename(&self, index: u64, term: u64) -> anyhow::Result<PathBuf> {
        let path = self.path_for(index, term);
        anyhow::ensure!(
            path.exists(),
            "no sideloaded file for index {index}, term {term}"
        );
        Ok(path)
    }

    fn truncate_to(&self, first_kept_index: u64) -> anyhow::Result<(u64, u64)> {
        let mut freed = 0u64;
        let mut retained = 0u64;
        for entry in std::fs::read_dir(&self.dir).context("read sideload dir")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((index, _term)) = parse_entry_name(&name.to_string_lossy()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if index < first_kept_index {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("remove sideloaded file {:?}", name))?;
                freed += size;
            } else {
                retained += size;
            }
        }
        Ok((freed, retained))
    }
}

/// In-memory sideloaded storage for unit tests. Tracks sizes only; the
/// returned paths are virtual and never opened.
#[derive(Default)]
pub struct InMemSideload {
    entries: Mutex<HashMap<(u64, u64), u64>>,
}

impl SideloadStorage for InMemSideload {
    fn put(&self, index: u64, term: u64, data: &[u8]) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("sideload mutex poisoned"))?
            .insert((index, term), data.len() as u64);
        Ok(())
    }

    fn filename(&self, index: u64, term: u64) -> anyhow::Result<PathBuf> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("sideload mutex poisoned"))?;
        anyhow::ensure!(
            entries.contains_key(&(index, term)),
            "no sideloaded file for index {index}, term {term}"
        );
        Ok(PathBuf::from(format!("mem-sideload/i{index:020}.t{term}")))
    }

    fn truncate_to(&self, first_kept_index: u64) -> anyhow::Result<(u64, u64)> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("sideload mutex poisoned"))?;
        let mut freed = 0u64;
        let mut retained = 0u64;
        entries.retain(|(index, _), size| {
            if *index < first_kept_index {
                freed += *size;
                false
            } else {
                retained += *size;
                true
            }
        });
        Ok((freed, retained))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("span_store_{name}_{}_{}", std::process::id(), nanos))
    }

    #[test]
    fn truncate_frees_only_older_entries() {
        let dir = temp_dir("sideload_truncate");
        let sideload = DiskSideload::new(&dir).expect("open sideload dir");
        sideload.put(3, 1, &[0u8; 100]).expect("put");
        sideload.put(5, 1, &[0u8; 40]).expect("put");
        sideload.put(9, 2, &[0u8; 7]).expect("put");

        let (freed, retained) = sideload.truncate_to(6).expect("truncate");
        assert_eq!(freed, 140);
        assert_eq!(retained, 7);
        assert!(sideload.filename(9, 2).is_ok());
        assert!(sideload.filename(3, 1).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
