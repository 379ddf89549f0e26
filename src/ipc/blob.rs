//! Process-keyed blob store
//!
//! Every persistent store and side-channel status lives in its own JSON file
//! under `<root>/<pid>/`. Writes go to a temporary file that is renamed into
//! place, so readers see either the previous or the next complete blob.
//! A blob that does not exist yet reads as `None`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::debug::types::BreakpointId;

/// Blob store errors
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob {path} is corrupt: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What a blob holds; together with the process id this names the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    ReferencedStrings,
    ReferencedJumps,
    ReferencedCalls,
    DissectStatus,
    DissectCancel,
    TraceStatus(BreakpointId),
    TraceCancel(BreakpointId),
    TraceResult(BreakpointId),
    TrackWatchpoint(BreakpointId),
    TrackBreakpoint(BreakpointId),
}

impl BlobKind {
    fn file_name(&self) -> String {
        match self {
            BlobKind::ReferencedStrings => "referenced_strings.json".into(),
            BlobKind::ReferencedJumps => "referenced_jumps.json".into(),
            BlobKind::ReferencedCalls => "referenced_calls.json".into(),
            BlobKind::DissectStatus => "dissect_status.json".into(),
            BlobKind::DissectCancel => "dissect_cancel.json".into(),
            BlobKind::TraceStatus(id) => format!("trace_status_{}.json", id),
            BlobKind::TraceCancel(id) => format!("trace_cancel_{}.json", id),
            BlobKind::TraceResult(id) => format!("trace_result_{}.json", id),
            BlobKind::TrackWatchpoint(id) => format!("track_watchpoint_{}.json", id),
            BlobKind::TrackBreakpoint(id) => format!("track_breakpoint_{}.json", id),
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory-backed store of `(pid, kind)` blobs
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Location of a blob on disk
    pub fn path(&self, pid: u32, kind: BlobKind) -> PathBuf {
        self.process_dir(pid).join(kind.file_name())
    }

    /// Atomically replace a blob
    pub fn write<T: Serialize + ?Sized>(
        &self,
        pid: u32,
        kind: BlobKind,
        value: &T,
    ) -> Result<(), BlobError> {
        let path = self.path(pid, kind);
        let io_err = |path: &Path, source| BlobError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = self.process_dir(pid);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let bytes = serde_json::to_vec(value).map_err(|source| BlobError::Codec {
            path: path.clone(),
            source,
        })?;
        let temp = dir.join(format!(
            ".{}.{}.{}",
            kind.file_name(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, bytes).map_err(|e| io_err(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| io_err(&path, e))
    }

    /// Read a blob; `Ok(None)` if it was never written
    pub fn read<T: DeserializeOwned>(&self, pid: u32, kind: BlobKind) -> Result<Option<T>, BlobError> {
        let path = self.path(pid, kind);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(BlobError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BlobError::Codec { path, source })
    }

    pub fn exists(&self, pid: u32, kind: BlobKind) -> bool {
        self.path(pid, kind).exists()
    }

    /// Create an empty marker blob
    pub fn touch(&self, pid: u32, kind: BlobKind) -> Result<(), BlobError> {
        self.write(pid, kind, &true)
    }

    /// Delete a blob; deleting a missing blob is not an error
    pub fn remove(&self, pid: u32, kind: BlobKind) -> Result<(), BlobError> {
        let path = self.path(pid, kind);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Io { path, source }),
        }
    }

    /// Delete every blob of a process
    pub fn clear_process(&self, pid: u32) -> Result<(), BlobError> {
        let dir = self.process_dir(pid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Io { path: dir, source }),
        }
    }
}
