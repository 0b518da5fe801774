//! Filesystem segment store
//!
//! Segments are written to a temp file, synced, then hard-linked to their
//! final name. The link fails if the name exists, which gives an atomic
//! put-if-absent: a reader either finds the complete file or nothing.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{PutOutcome, SegmentStore, StorageError, StorageResult};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".seg";
const TEMP_SUFFIX: &str = ".tmp";

/// Segment store backed by a local directory
#[derive(Debug, Clone)]
pub struct FsSegmentStore {
    root: PathBuf,
}

impl FsSegmentStore {
    /// Open (creating if needed) a segment directory
    ///
    /// Leftover temp files from an interrupted write are removed.
    pub async fn open<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let store = Self { root };
        let removed = store.remove_temp_files().await?;
        if removed > 0 {
            tracing::warn!(
                dir = %store.root.display(),
                removed,
                "Removed temp files left by an interrupted commit"
            );
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.root
            .join(format!("{}{:020}{}", SEGMENT_PREFIX, segment_id, SEGMENT_SUFFIX))
    }

    fn parse_segment_id(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(SEGMENT_SUFFIX)?
            .parse()
            .ok()
    }

    async fn remove_temp_files(&self) -> StorageResult<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    #[cfg(unix)]
    async fn sync_dir(&self) -> StorageResult<()> {
        tokio::fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SegmentStore for FsSegmentStore {
    async fn put_if_absent(&self, segment_id: u64, bytes: &[u8]) -> StorageResult<PutOutcome> {
        let final_path = self.segment_path(segment_id);
        let temp_path = self.root.join(format!(
            ".{}{:020}.{}{}",
            SEGMENT_PREFIX,
            segment_id,
            Uuid::new_v4(),
            TEMP_SUFFIX
        ));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        let linked = tokio::fs::hard_link(&temp_path, &final_path).await;
        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            tracing::warn!(path = %temp_path.display(), error = %e, "Failed to remove temp file");
        }

        match linked {
            Ok(()) => {
                self.sync_dir().await?;
                Ok(PutOutcome::Created)
            },
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn get(&self, segment_id: u64) -> StorageResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.segment_path(segment_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, from_segment_id: u64) -> StorageResult<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_segment_id) {
                if id >= from_segment_id {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn health_check(&self) -> StorageResult<()> {
        let meta = tokio::fs::metadata(&self.root).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )))
        }
    }
}
