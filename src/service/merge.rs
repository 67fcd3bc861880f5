//! Segment stitching: stream-copy each segment file into the final output in
//! order, deleting segments as they are consumed.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::error::{DownloadError, DownloadErrorCode, DownloadResult};

use super::SegmentSink;

/// Copy chunk used while stitching segments.
pub(crate) const MERGE_CHUNK: usize = 1024;

/// Copies each segment into `out` in the given (thread-id) order, deleting a
/// segment as soon as its copy succeeds.
pub(crate) fn combine_segments(
    segment_paths: &[PathBuf],
    out: &mut dyn Write,
) -> DownloadResult<()> {
    let mut buf = [0u8; MERGE_CHUNK];
    for path in segment_paths {
        let mut segment = File::open(path).map_err(|e| {
            DownloadError::from_io(
                &e,
                DownloadErrorCode::DiskOperationFailed,
                &format!("open segment {}", path.display()),
            )
        })?;
        loop {
            let n = segment.read(&mut buf).map_err(|e| {
                DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    &format!("read segment {}", path.display()),
                )
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|e| {
                DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    "write final output",
                )
            })?;
        }
        drop(segment);
        std::fs::remove_file(path).map_err(|e| {
            DownloadError::from_io(
                &e,
                DownloadErrorCode::DiskOperationFailed,
                &format!("delete segment {}", path.display()),
            )
        })?;
    }
    Ok(())
}

/// Closes `stream` and deletes `paths`, ignoring files that are already
/// gone. Safe to call with nothing to do.
pub(crate) fn cleanup(stream: Option<SegmentSink>, paths: Option<&[PathBuf]>) {
    if let Some(mut stream) = stream {
        let _ = stream.flush();
    }
    if let Some(paths) = paths {
        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cleanup could not delete: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_concatenates_in_order_and_deletes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| dir.path().join(format!("seg-{i}.Download")))
            .collect();
        std::fs::write(&paths[0], vec![b'a'; 1500]).unwrap();
        std::fs::write(&paths[1], vec![b'b'; 1024]).unwrap();
        std::fs::write(&paths[2], vec![b'c'; 7]).unwrap();

        let mut out = Vec::new();
        combine_segments(&paths, &mut out).unwrap();

        assert_eq!(out.len(), 1500 + 1024 + 7);
        assert!(out[..1500].iter().all(|&b| b == b'a'));
        assert!(out[1500..2524].iter().all(|&b| b == b'b'));
        assert!(out[2524..].iter().all(|&b| b == b'c'));
        for p in &paths {
            assert!(!p.exists(), "{} should be deleted", p.display());
        }
    }

    #[test]
    fn combine_handles_empty_segments() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..2)
            .map(|i| dir.path().join(format!("seg-{i}.Download")))
            .collect();
        std::fs::write(&paths[0], b"").unwrap();
        std::fs::write(&paths[1], b"").unwrap();

        let mut out = Vec::new();
        combine_segments(&paths, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(!paths[0].exists());
    }

    #[test]
    fn combine_fails_on_missing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("gone.Download")];
        let mut out = Vec::new();
        let err = combine_segments(&paths, &mut out).unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::PathNotFound);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leftover.Download");
        std::fs::write(&path, b"x").unwrap();
        let paths = vec![path.clone(), dir.path().join("never-existed")];

        cleanup(None, Some(&paths));
        assert!(!path.exists());
        // Second pass with everything already gone.
        cleanup(None, Some(&paths));
        cleanup(None, None);
    }
}
