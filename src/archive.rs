//! Conversion between the zip packages users submit and the tar archives the
//! container engine accepts and returns.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::Stream;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::SpooledTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{EvaluationError, PackageFormatError};

/// Directory every package entry is placed under inside the archive.
pub const PACKAGE_DIR: &str = "package";

/// rw-rw-r--
const ENTRY_MODE: u32 = 0o664;

/// Chunks read ahead of the consumer when streaming.
const STREAM_BUFFER: usize = 4;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// A tar archive produced by [`transcode`], positioned at its start.
///
/// Small archives stay in memory; larger ones spill to an anonymous temporary
/// file.
pub struct TranscodedArchive {
    data: SpooledTempFile,
    len: u64,
}

impl TranscodedArchive {
    /// Total size of the archive in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the archive as a sequence of chunks of at most `chunk_size` bytes.
    pub fn into_chunks(self, chunk_size: usize) -> Chunks<SpooledTempFile> {
        Chunks::new(self.data, chunk_size)
    }

    /// Streams the archive in chunks of at most `chunk_size` bytes.
    ///
    /// The archive is read on the blocking pool, so a spilled archive never
    /// blocks a runtime worker. The returned handle resolves once the stream
    /// has ended or been dropped, and carries the read error that cut the
    /// stream short, if any.
    pub fn into_stream(
        self,
        chunk_size: usize,
    ) -> (
        impl Stream<Item = Bytes> + Send + 'static,
        JoinHandle<io::Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let reader = tokio::task::spawn_blocking(move || -> io::Result<()> {
            for chunk in self.into_chunks(chunk_size) {
                if tx.blocking_send(chunk?).is_err() {
                    // consumer went away
                    break;
                }
            }
            Ok(())
        });

        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        (chunks, reader)
    }

    /// Reads the whole archive into memory.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.data.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for TranscodedArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl std::fmt::Debug for TranscodedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodedArchive")
            .field("len", &self.len)
            .field("spilled", &self.data.is_rolled())
            .finish()
    }
}

/// Rewrites a zip package as a tar archive with every regular file placed
/// under `package/`. Directories and symlinks are dropped.
///
/// Entries with absolute names or `..` components are rejected as
/// [`PackageFormatError::UnsafeEntryName`].
///
/// Up to `spool_threshold` bytes of output are kept in memory.
pub fn transcode<R: Read + Seek>(
    package: R,
    spool_threshold: usize,
) -> Result<TranscodedArchive, EvaluationError> {
    let mut zip = ZipArchive::new(package).map_err(zip_error)?;
    let mut builder = Builder::new(SpooledTempFile::new(spool_threshold));
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut written = 0usize;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(zip_error)?;
        if entry.is_dir() || is_symlink(entry.unix_mode()) {
            trace!(name = %entry.name(), "Skipping non-file entry");
            continue;
        }
        if !is_contained(entry.name()) {
            return Err(PackageFormatError::UnsafeEntryName {
                name: entry.name().to_string(),
            }
            .into());
        }

        let path = format!("{PACKAGE_DIR}/{}", entry.name());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.size());
        header.set_mode(ENTRY_MODE);
        header.set_mtime(mtime);

        builder
            .append_data(&mut header, &path, &mut entry)
            .map_err(EvaluationError::Transcode)?;
        written += 1;
    }

    let mut data = builder.into_inner().map_err(EvaluationError::Transcode)?;
    let len = data
        .seek(SeekFrom::End(0))
        .and_then(|len| data.seek(SeekFrom::Start(0)).map(|_| len))
        .map_err(EvaluationError::Transcode)?;

    debug!(entries = written, bytes = len, "Transcoded package");
    Ok(TranscodedArchive { data, len })
}

/// True when `name` is relative and never steps up a directory.
fn is_contained(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn is_symlink(mode: Option<u32>) -> bool {
    mode.map_or(false, |m| m & S_IFMT == S_IFLNK)
}

fn zip_error(err: ZipError) -> EvaluationError {
    match err {
        ZipError::Io(e) => EvaluationError::Transcode(e),
        other => PackageFormatError::Zip(other).into(),
    }
}

/// Returns the contents of the first regular file in a tar archive, if any.
///
/// The engine answers a single-path extraction with a tar holding that one
/// file, so the first regular entry is the requested file. A file larger than
/// `limit` bytes is an `InvalidData` error.
pub fn extract_single_file<R: Read>(tar: R, limit: usize) -> io::Result<Option<Vec<u8>>> {
    let mut archive = Archive::new(tar);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let size = entry.size();
        if size > limit as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file of {size} bytes exceeds the {limit} byte limit"),
            ));
        }

        let mut contents = Vec::new();
        (&mut entry).take(size).read_to_end(&mut contents)?;
        return Ok(Some(contents));
    }

    Ok(None)
}

/// Fixed-size chunk iterator over a reader, used to stream uploads.
pub struct Chunks<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> Chunks<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0; self.chunk_size];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(Bytes::from(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
