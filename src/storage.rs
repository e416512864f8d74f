//! Whole-file atomic replace for the run's JSON and JSONL state.
//!
//! Every write goes to a temporary file in the destination directory, is
//! synced, renamed over the target and followed by a directory fsync. A
//! reader therefore sees either the previous file or the new one, never a
//! partial write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::StateError;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `dir` (and parents) if missing.
pub fn ensure_dir(dir: &Path) -> Result<(), StateError> {
    fs::create_dir_all(dir).map_err(io_err(dir))
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let parent = parent_dir(path);
    ensure_dir(&parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(&parent)
        .map_err(io_err(path))?;
    temp.write_all(bytes).map_err(io_err(path))?;
    temp.as_file().sync_all().map_err(io_err(path))?;
    temp.persist(path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    sync_dir(&parent)
}

/// Atomically replace `path` with the pretty JSON encoding of `value`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StateError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("serialization failed: {e}"),
    })?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

/// Atomically replace `path` with one compact JSON document per line.
pub fn write_jsonl_atomic<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StateError> {
    let bytes = encode_jsonl(path, rows)?;
    write_bytes_atomic(path, &bytes)
}

/// Encode rows as JSONL bytes without touching the filesystem.
pub fn encode_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<Vec<u8>, StateError> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("serialization failed: {e}"),
        })?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// Read a JSON document. Returns `Ok(None)` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            line: e.line(),
            reason: e.to_string(),
        })
}

/// Read a JSONL file, skipping blank lines. Returns an empty vec if the file does not exist.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Like [`read_jsonl`], but a missing file is an error.
pub fn read_jsonl_required<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StateError> {
    if !path.exists() {
        return Err(StateError::MissingArtifact {
            path: path.to_path_buf(),
        });
    }
    read_jsonl(path)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// fsync a directory so a preceding rename is durable.
pub fn sync_dir(dir: &Path) -> Result<(), StateError> {
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir).map_err(io_err(dir))?;
        handle.sync_all().map_err(io_err(dir))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        n: u32,
    }

    #[test]
    fn test_write_json_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("progress.json");

        write_json_atomic(&path, &Row { id: "a".into(), n: 1 }).unwrap();
        write_json_atomic(&path, &Row { id: "a".into(), n: 2 }).unwrap();

        let row: Row = read_json(&path).unwrap().unwrap();
        assert_eq!(row.n, 2);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_json_atomic(&path, &Row { id: "a".into(), n: 1 }).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["out.json".to_string()]);
    }

    #[test]
    fn test_read_json_missing_is_none() {
        let dir = tempdir().unwrap();
        let missing: Option<Row> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_jsonl_preserves_order_and_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let rows = vec![
            Row { id: "b".into(), n: 2 },
            Row { id: "a".into(), n: 1 },
        ];
        write_jsonl_atomic(&path, &rows).unwrap();

        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("\n\n");
        fs::write(&path, content).unwrap();

        let back: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_corrupt_jsonl_reports_line_number() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"id\":\"a\",\"n\":1}\nnot json\n").unwrap();

        let err = read_jsonl::<Row>(&path).unwrap_err();
        match err {
            StateError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_read_jsonl_required_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_jsonl_required::<Row>(&dir.path().join("absent.jsonl")).unwrap_err();
        assert!(matches!(err, StateError::MissingArtifact { .. }));
    }
}
