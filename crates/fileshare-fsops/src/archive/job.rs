//! Archive job executed on the archive pool.
//!
//! Encoding goes through `zip::ZipWriter` in streaming mode: entries carry data descriptors, so
//! nothing already sent to the client is ever rewritten.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Datelike, Local, Timelike};
use fileshare_telemetry::Metrics;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zip::ZipWriter;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use super::{ArchiveEntry, ArchiveOutcome, ArchiveReport, CompressionMethod, scan_entries};
use crate::worker::Job;

/// Encoded bytes are sent to the response once this much is buffered.
const FLUSH_THRESHOLD: usize = 64 * 1024;
const COPY_BUFFER_BYTES: usize = 64 * 1024;
/// Entries at or above this scanned size are written with ZIP64 sizes.
const ZIP64_ENTRY_THRESHOLD: u64 = 0xF000_0000;
const ENTRY_PERMISSIONS: u32 = 0o644;

/// Walks one directory and streams it as a ZIP archive.
pub(crate) struct ArchiveJob {
    dir: PathBuf,
    sender: mpsc::Sender<io::Result<Bytes>>,
    report: oneshot::Sender<ArchiveReport>,
    cancel: CancellationToken,
    metrics: Metrics,
}

impl ArchiveJob {
    pub(crate) const fn new(
        dir: PathBuf,
        sender: mpsc::Sender<io::Result<Bytes>>,
        report: oneshot::Sender<ArchiveReport>,
        cancel: CancellationToken,
        metrics: Metrics,
    ) -> Self {
        Self {
            dir,
            sender,
            report,
            cancel,
            metrics,
        }
    }
}

impl Job for ArchiveJob {
    fn kind(&self) -> &'static str {
        "archive"
    }

    fn execute(self: Box<Self>) {
        let Self {
            dir,
            sender,
            report: reply,
            cancel,
            metrics,
        } = *self;
        let started = Instant::now();
        let mut report = ArchiveReport::default();
        let mut sink = ChannelSink::new(sender.clone(), cancel.clone());

        let result = scan_entries(&dir)
            .map_err(|err| io::Error::other(err.to_string()))
            .and_then(|entries| write_archive(&mut sink, &entries, &cancel, &metrics, &mut report));
        report.bytes_out = sink.bytes_out();
        drop(sink);

        match result {
            Ok(()) => {
                report.outcome = ArchiveOutcome::Completed;
                info!(
                    dir = %dir.display(),
                    entries = report.entries,
                    skipped = report.skipped,
                    bytes = report.bytes_out,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "archive streamed"
                );
            }
            Err(err) if cancel.is_cancelled() || err.kind() == io::ErrorKind::BrokenPipe => {
                report.outcome = ArchiveOutcome::Cancelled;
                info!(
                    dir = %dir.display(),
                    entries = report.entries,
                    "archive stream ended early; client gone"
                );
            }
            Err(err) => {
                report.outcome = ArchiveOutcome::Failed;
                warn!(dir = %dir.display(), error = %err, "archive stream failed");
                let _ = sender.blocking_send(Err(err));
            }
        }
        drop(sender);
        metrics.inc_archive_job(report.outcome.as_str());
        let _ = reply.send(report);
    }
}

/// Write every entry, then the central directory, and flush `out`. Entries that cannot be
/// opened are skipped; any output error ends the archive.
pub(crate) fn write_archive<W: Write>(
    out: &mut W,
    entries: &[ArchiveEntry],
    cancel: &CancellationToken,
    metrics: &Metrics,
    report: &mut ArchiveReport,
) -> io::Result<()> {
    let mut zip = ZipWriter::new_stream(&mut *out);
    let mut copy_buffer = vec![0u8; COPY_BUFFER_BYTES];
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let mut file = match File::open(&entry.source) {
            Ok(file) => file,
            Err(err) => {
                warn!(entry = %entry.name, error = %err, "skipping unreadable archive entry");
                report.skipped += 1;
                metrics.inc_archive_entry("skipped");
                continue;
            }
        };
        zip.start_file(entry.name.as_str(), entry_options(entry))
            .map_err(zip_io)?;
        let copied = copy_entry(&mut file, &mut zip, &mut copy_buffer, cancel)?;
        report.entries += 1;
        if let Some(err) = copied.read_error {
            warn!(
                entry = %entry.name,
                bytes = copied.len,
                error = %err,
                "archive entry truncated by read error"
            );
            report.truncated += 1;
            metrics.inc_archive_entry("truncated");
        } else {
            metrics.inc_archive_entry("written");
        }
    }
    zip.finish().map_err(zip_io)?;
    out.flush()
}

/// Bytes copied for one entry. A read error ends the entry early with what was read.
#[derive(Debug)]
pub(crate) struct Copied {
    pub(crate) len: u64,
    pub(crate) read_error: Option<io::Error>,
}

pub(crate) fn copy_entry<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut [u8],
    cancel: &CancellationToken,
) -> io::Result<Copied> {
    let mut len = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let read = match reader.read(buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Ok(Copied {
                    len,
                    read_error: Some(err),
                });
            }
        };
        writer.write_all(&buffer[..read])?;
        len += read as u64;
    }
    Ok(Copied {
        len,
        read_error: None,
    })
}

fn entry_options(entry: &ArchiveEntry) -> SimpleFileOptions {
    let method = match entry.method {
        CompressionMethod::Stored => zip::CompressionMethod::Stored,
        CompressionMethod::Deflated => zip::CompressionMethod::Deflated,
    };
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(dos_timestamp(entry.modified))
        .unix_permissions(ENTRY_PERMISSIONS)
        .large_file(entry.size >= ZIP64_ENTRY_THRESHOLD)
}

/// Local modification time as a ZIP timestamp; times outside the DOS range become 1980-01-01.
fn dos_timestamp(modified: Option<SystemTime>) -> zip::DateTime {
    modified
        .and_then(|modified| {
            let local: DateTime<Local> = DateTime::from(modified);
            zip::DateTime::from_date_and_time(
                u16::try_from(local.year()).ok()?,
                u8::try_from(local.month()).ok()?,
                u8::try_from(local.day()).ok()?,
                u8::try_from(local.hour()).ok()?,
                u8::try_from(local.minute()).ok()?,
                u8::try_from(local.second()).ok()?,
            )
            .ok()
        })
        .unwrap_or_default()
}

fn zip_io(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(err) => err,
        other => io::Error::other(other),
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "archive cancelled")
}

/// Buffers encoder output and forwards it to the response channel, blocking the worker while
/// the channel is full.
pub(crate) struct ChannelSink {
    sender: mpsc::Sender<io::Result<Bytes>>,
    pending: BytesMut,
    sent: u64,
    cancel: CancellationToken,
}

impl ChannelSink {
    pub(crate) fn new(sender: mpsc::Sender<io::Result<Bytes>>, cancel: CancellationToken) -> Self {
        Self {
            sender,
            pending: BytesMut::with_capacity(FLUSH_THRESHOLD),
            sent: 0,
            cancel,
        }
    }

    /// Archive bytes accepted so far, sent or still pending.
    pub(crate) fn bytes_out(&self) -> u64 {
        self.sent + self.pending.len() as u64
    }

    fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        let len = chunk.len() as u64;
        self.sender
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive receiver dropped"))?;
        self.sent += len;
        Ok(())
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.send_pending()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending()
    }
}
