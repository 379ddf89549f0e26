//! Cooperative cancellation
//!
//! A token is checked at yield points (chunk boundaries, trace steps). It can
//! be tripped in-process or from another process by creating a marker blob.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::blob::{BlobKind, BlobStore};

#[derive(Debug, Clone)]
struct Marker {
    blobs: BlobStore,
    pid: u32,
    kind: BlobKind,
}

/// Cancellation flag shared between a long-running loop and its canceller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    marker: Option<Marker>,
}

impl CancellationToken {
    /// In-process token only
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also observes the `(pid, kind)` marker blob
    pub fn with_marker(blobs: BlobStore, pid: u32, kind: BlobKind) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            marker: Some(Marker { blobs, pid, kind }),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(marker) = &self.marker {
            if let Err(e) = marker.blobs.touch(marker.pid, marker.kind) {
                log::warn!("Failed to write cancel marker: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.marker {
            Some(marker) if marker.blobs.exists(marker.pid, marker.kind) => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Reset the token and remove its marker
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Some(marker) = &self.marker {
            if let Err(e) = marker.blobs.remove(marker.pid, marker.kind) {
                log::warn!("Failed to remove cancel marker: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_process_cancel() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
        token.clear();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_marker_blob_trips_token() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        let token = CancellationToken::with_marker(blobs.clone(), 9, BlobKind::DissectCancel);
        assert!(!token.is_cancelled());

        blobs.touch(9, BlobKind::DissectCancel).unwrap();
        assert!(token.is_cancelled());

        token.clear();
        assert!(!blobs.exists(9, BlobKind::DissectCancel));
        assert!(!token.is_cancelled());
    }
}
