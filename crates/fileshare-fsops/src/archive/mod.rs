//! Streaming directory archiver.
//!
//! # Design
//! - A request resolves and checks the directory, then hands an [`job::ArchiveJob`] to the
//!   archive pool; the job walks the tree and encodes entries with `zip::ZipWriter` in streaming
//!   mode into a bounded channel the response body drains, so memory stays flat regardless of
//!   directory size.
//! - Entry names are relative to the parent of the requested directory and sorted by name,
//!   so the same tree always yields the same entry list.
//! - Already-compressed media is stored; everything else is deflated.
//! - Unreadable entries are skipped with a warning. Only failures of the output stream end the
//!   job early; a vanished client counts as cancellation, not an error.

mod job;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use fileshare_telemetry::Metrics;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{FsOpsError, FsOpsResult};
use crate::paths::{BaseDir, is_partial_name};
use crate::worker::{RejectReason, WorkerPool};

use job::ArchiveJob;

/// Extensions (lowercase) of formats that are already compressed.
pub const STORED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "mp4", "mkv", "avi", "mov", "webm", "mp3", "aac", "flac",
    "ogg", "zip", "gz", "bz2", "xz", "7z", "rar", "pdf",
];

/// Bounded depth of the chunk channel between the job and the response body.
const STREAM_CHANNEL_DEPTH: usize = 8;

/// Per-entry compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Bytes copied verbatim.
    Stored,
    /// Raw DEFLATE.
    Deflated,
}

impl CompressionMethod {
    /// Pick the method for a file by its extension, case-insensitively.
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        let stored = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                STORED_EXTENSIONS
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(extension))
            });
        if stored { Self::Stored } else { Self::Deflated }
    }
}

/// One regular file queued for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name inside the archive, `/`-separated.
    pub name: String,
    /// Absolute source path.
    pub source: PathBuf,
    /// Size observed during the walk.
    pub size: u64,
    /// Compression method.
    pub method: CompressionMethod,
    /// Modification time, when available.
    pub modified: Option<SystemTime>,
}

/// How an archive job ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    /// Every entry and the central directory were written.
    #[default]
    Completed,
    /// The client went away or the request was cancelled.
    Cancelled,
    /// The output stream or the walk failed.
    Failed,
}

impl ArchiveOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Summary produced when an archive job finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    /// Entries fully or partially written.
    pub entries: u64,
    /// Entries skipped because they could not be opened.
    pub skipped: u64,
    /// Entries cut short by a read error.
    pub truncated: u64,
    /// Archive bytes produced.
    pub bytes_out: u64,
    /// Final outcome.
    pub outcome: ArchiveOutcome,
}

/// A running archive job as seen by the response handler.
#[derive(Debug)]
pub struct ArchiveStream {
    /// Attachment name, `<directory>.zip`.
    pub file_name: String,
    /// Encoded archive bytes in order; an `Err` item means the archive is broken.
    pub chunks: mpsc::Receiver<io::Result<Bytes>>,
    /// Resolves once the job has released every resource.
    pub done: oneshot::Receiver<ArchiveReport>,
    /// Cancels the job when fired.
    pub cancel: CancellationToken,
}

/// Submits archive jobs to the archive pool.
pub struct Archiver {
    base: BaseDir,
    pool: Arc<WorkerPool>,
    metrics: Metrics,
}

impl Archiver {
    /// Bind the archiver to a root and pool.
    #[must_use]
    pub const fn new(base: BaseDir, pool: Arc<WorkerPool>, metrics: Metrics) -> Self {
        Self {
            base,
            pool,
            metrics,
        }
    }

    /// Validate the directory and start streaming it.
    ///
    /// # Errors
    ///
    /// - [`FsOpsError::PathTraversal`] for `..` components.
    /// - [`FsOpsError::MissingPath`] / [`FsOpsError::NotADirectory`] for bad targets.
    /// - [`FsOpsError::PoolRejected`] when the archive pool is saturated or stopped.
    /// - [`FsOpsError::ClientDisconnected`] when `cancel` fires before the job is queued.
    pub async fn open(&self, requested: &str, cancel: CancellationToken) -> FsOpsResult<ArchiveStream> {
        let dir = self.base.resolve(requested)?;
        let metadata = match tokio::fs::metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FsOpsError::MissingPath { path: dir });
            }
            Err(source) => return Err(FsOpsError::io("archive.stat", &dir, source)),
        };
        if !metadata.is_dir() {
            return Err(FsOpsError::NotADirectory { path: dir });
        }

        let file_name = format!("{}.zip", archive_prefix(&dir));
        let (sender, chunks) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let (report, done) = oneshot::channel();
        let job = ArchiveJob::new(dir, sender, report, cancel.clone(), self.metrics.clone());
        if let Err(rejected) = self.pool.try_submit(job, &cancel).await {
            let reason = rejected.reason();
            self.metrics
                .inc_pool_rejection(self.pool.name(), reason.as_str());
            self.metrics.inc_archive_job("rejected");
            return Err(match reason {
                RejectReason::Cancelled => FsOpsError::ClientDisconnected {
                    operation: "archive.submit",
                },
                RejectReason::TimedOut | RejectReason::Closed => FsOpsError::PoolRejected {
                    pool: self.pool.name(),
                    reason,
                },
            });
        }

        Ok(ArchiveStream {
            file_name,
            chunks,
            done,
            cancel,
        })
    }
}

/// Collect the regular files under `dir` in a stable order.
///
/// Entries the walk cannot read are logged and skipped; upload temp files and symlinks are
/// never included.
///
/// # Errors
///
/// Returns [`FsOpsError::Walkdir`] when `dir` itself cannot be read.
pub fn scan_entries(dir: &Path) -> FsOpsResult<Vec<ArchiveEntry>> {
    let prefix = archive_prefix(dir);
    let mut entries = Vec::new();
    for item in WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let item = match item {
            Ok(item) => item,
            Err(err) if err.depth() == 0 => {
                return Err(FsOpsError::walkdir("archive.walk", dir, err));
            }
            Err(err) => {
                warn!(
                    path = ?err.path(),
                    error = %err,
                    "skipping unreadable archive entry"
                );
                continue;
            }
        };
        if !item.file_type().is_file() || is_partial_name(item.file_name()) {
            continue;
        }
        let Ok(relative) = item.path().strip_prefix(dir) else {
            continue;
        };
        let metadata = match item.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %item.path().display(), error = %err, "skipping unreadable archive entry");
                continue;
            }
        };
        let mut name = prefix.clone();
        for component in relative.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }
        if u16::try_from(name.len()).is_err() {
            warn!(path = %item.path().display(), "skipping archive entry with oversized name");
            continue;
        }
        entries.push(ArchiveEntry {
            name,
            method: CompressionMethod::for_path(item.path()),
            source: item.path().to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }
    Ok(entries)
}

fn archive_prefix(dir: &Path) -> String {
    dir.file_name()
        .map_or_else(|| "archive".to_string(), |name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::PoolConfig;
    use std::error::Error;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    fn seed_tree(root: &Path) -> Result<PathBuf, Box<dyn Error>> {
        let photos = root.join("photos");
        std::fs::create_dir_all(photos.join("sub"))?;
        std::fs::write(photos.join("a.JPG"), vec![0xFF; 2048])?;
        std::fs::write(photos.join("notes.txt"), b"trip notes ".repeat(50))?;
        std::fs::write(photos.join("sub/deep.md"), b"# deep")?;
        std::fs::write(photos.join(".movie.mp4.partial"), b"half")?;
        Ok(photos)
    }

    fn archiver(root: &Path, workers: usize) -> Result<(Archiver, Arc<WorkerPool>), Box<dyn Error>> {
        let pool = Arc::new(WorkerPool::new(&PoolConfig {
            name: "archive",
            workers,
            queue_capacity: 2,
            submit_timeout: Some(std::time::Duration::from_millis(50)),
        })?);
        let archiver = Archiver::new(BaseDir::new(root), Arc::clone(&pool), Metrics::new()?);
        Ok((archiver, pool))
    }

    async fn drain(stream: ArchiveStream) -> Result<(Vec<u8>, ArchiveReport), Box<dyn Error>> {
        let ArchiveStream {
            mut chunks, done, ..
        } = stream;
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok((bytes, done.await?))
    }

    #[test]
    fn compression_follows_extension() {
        assert_eq!(
            CompressionMethod::for_path(Path::new("IMG_001.JPG")),
            CompressionMethod::Stored
        );
        assert_eq!(
            CompressionMethod::for_path(Path::new("backup.tar.gz")),
            CompressionMethod::Stored
        );
        assert_eq!(
            CompressionMethod::for_path(Path::new("notes.txt")),
            CompressionMethod::Deflated
        );
        assert_eq!(
            CompressionMethod::for_path(Path::new("Makefile")),
            CompressionMethod::Deflated
        );
    }

    #[test]
    fn scan_is_sorted_relative_and_skips_partials() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let photos = seed_tree(temp.path())?;
        let entries = scan_entries(&photos)?;
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(
            names,
            ["photos/a.JPG", "photos/notes.txt", "photos/sub/deep.md"]
        );
        assert_eq!(entries[0].method, CompressionMethod::Stored);
        assert_eq!(entries[0].size, 2048);
        assert_eq!(scan_entries(&photos)?, entries);
        assert!(scan_entries(&temp.path().join("missing")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn archive_streams_a_valid_zip() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        seed_tree(temp.path())?;
        let (archiver, pool) = archiver(temp.path(), 1)?;

        let stream = archiver.open("photos", CancellationToken::new()).await?;
        assert_eq!(stream.file_name, "photos.zip");
        let (bytes, report) = drain(stream).await?;
        assert_eq!(report.outcome, ArchiveOutcome::Completed);
        assert_eq!(report.entries, 3);
        assert_eq!(report.bytes_out, bytes.len() as u64);

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
        assert_eq!(zip.len(), 3);
        let mut jpg = zip.by_name("photos/a.JPG")?;
        assert_eq!(jpg.compression(), zip::CompressionMethod::Stored);
        let mut data = Vec::new();
        jpg.read_to_end(&mut data)?;
        assert_eq!(data, vec![0xFF; 2048]);
        drop(jpg);
        let notes = zip.by_name("photos/notes.txt")?;
        assert_eq!(notes.compression(), zip::CompressionMethod::Deflated);
        drop(notes);

        pool.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_rejects_bad_targets() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        seed_tree(temp.path())?;
        let (archiver, pool) = archiver(temp.path(), 1)?;

        assert!(matches!(
            archiver.open("../", CancellationToken::new()).await,
            Err(FsOpsError::PathTraversal { .. })
        ));
        assert!(matches!(
            archiver.open("nope", CancellationToken::new()).await,
            Err(FsOpsError::MissingPath { .. })
        ));
        assert!(matches!(
            archiver.open("photos/notes.txt", CancellationToken::new()).await,
            Err(FsOpsError::NotADirectory { .. })
        ));
        pool.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_receiver_cancels_the_job() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let videos = temp.path().join("videos");
        std::fs::create_dir(&videos)?;
        for index in 0..6 {
            std::fs::write(videos.join(format!("clip{index}.mp4")), vec![index; 512 * 1024])?;
        }
        let (archiver, pool) = archiver(temp.path(), 1)?;

        let ArchiveStream {
            mut chunks, done, ..
        } = archiver.open("videos", CancellationToken::new()).await?;
        assert!(chunks.recv().await.is_some());
        drop(chunks);

        let report = done.await?;
        assert_eq!(report.outcome, ArchiveOutcome::Cancelled);
        assert!(report.entries < 6);
        pool.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_token_refuses_submission() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        seed_tree(temp.path())?;
        let (archiver, pool) = archiver(temp.path(), 1)?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            archiver.open("photos", cancel).await,
            Err(FsOpsError::ClientDisconnected { .. })
        ));
        pool.stop();
        Ok(())
    }
}
