// ========================================================================================
//
//                         ATOMIC PERSISTENCE FOR RUN ARTIFACTS
//
// ========================================================================================
//
// Vocabularies, checkpoints, histories and experiment settings are the only state shared
// across process invocations. Every writer goes through `write_atomic`: the payload is
// written to a temporary file in the destination directory, synced, and renamed over the
// target. A reader therefore sees either the previous complete file or the new complete
// file, never a torn write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Required file '{0}' does not exist.")]
    NotFound(PathBuf),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode or decode JSON file '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to parse TOML file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize '{path}' to TOML: {source}")]
    TomlSerialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}

fn io_error(path: &Path, source: io::Error) -> FileError {
    if source.kind() == io::ErrorKind::NotFound {
        FileError::NotFound(path.to_path_buf())
    } else {
        FileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replaces `path` with `bytes` using write-then-rename. Parent directories are created.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FileError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let wrap = |source: io::Error| FileError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(&dir).map_err(wrap)?;
    let mut tmp = NamedTempFile::new_in(&dir).map_err(wrap)?;
    tmp.write_all(bytes).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.persist(path).map_err(|e| wrap(e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FileError> {
    let bytes = serde_json::to_vec(value).map_err(|source| FileError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, FileError> {
    let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| FileError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_toml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FileError> {
    let text = toml::to_string_pretty(value).map_err(|source| FileError::TomlSerialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, text.as_bytes())
}

pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, FileError> {
    let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    toml::from_str(&text).map_err(|source| FileError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}
