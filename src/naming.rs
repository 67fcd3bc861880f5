//! Target-file naming: deriving a filename, making it unique, and mapping it
//! to per-worker segment paths.

use std::path::{Path, PathBuf};

/// Fallback when neither the caller's path, the URL, nor the server supply a
/// usable filename.
pub const DEFAULT_FILE_NAME: &str = "download.bin";

/// Suffix of per-worker segment files.
pub const SEGMENT_EXTENSION: &str = "Download";

/// Last path segment of `url`, if usable as a filename.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .next_back()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Strips characters that cannot appear in a filename and trims leading and
/// trailing dots and whitespace.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == '\0' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned.trim_matches(|c: char| c.is_whitespace() || c == '.').to_string()
}

/// Picks the filename for a download: the file part of the caller's saved
/// path if it names one, else the server's Content-Disposition filename, else
/// the file part of the URL path, else [`DEFAULT_FILE_NAME`].
pub fn derive_file_name(
    saved_path: &Path,
    url: &str,
    content_disposition_name: Option<&str>,
) -> String {
    let candidate = saved_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .or_else(|| content_disposition_name.map(str::to_string))
        .or_else(|| file_name_from_url(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILE_NAME.to_string(),
    };
    let sanitized = sanitize_file_name(&raw);
    if sanitized.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

/// Returns `dir/name`, appending ` (1)`, ` (2)`, ... before the extension
/// until the path names nothing on disk.
///
/// This only reserves the name against what currently exists; the final
/// create uses an exclusive open so a racing task fails instead of
/// overwriting.
pub fn unique_target_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(file_name);
    for k in 1u32.. {
        let next = match ext {
            Some(ext) => dir.join(format!("{stem} ({k}).{ext}")),
            None => dir.join(format!("{stem} ({k})")),
        };
        if !next.exists() {
            return next;
        }
    }
    unreachable!("suffix counter exhausted");
}

/// Splits `target_path` into `thread_count` segment paths:
/// `<dir>/<stem> [<task-id>]-<i>.Download`.
pub fn segment_paths(target_path: &Path, task_id: u64, thread_count: u8) -> Vec<PathBuf> {
    let dir = target_path.parent().unwrap_or_else(|| Path::new(""));
    let name = target_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_FILE_NAME);
    let (stem, _) = split_name(name);

    (0..thread_count)
        .map(|i| dir.join(format!("{stem} [{task_id}]-{i}.{SEGMENT_EXTENSION}")))
        .collect()
}

/// Splits a filename into (stem, extension). The extension excludes the dot;
/// a leading dot (hidden file) is part of the stem.
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}
