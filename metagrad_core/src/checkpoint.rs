//! Versioned model checkpoints.
//!
//! A checkpoint is one bincode payload carrying its own version number.
//! Writes go to a `.partial` sibling that is renamed over the target once
//! flushed, so an interrupted save leaves the previous checkpoint readable.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bincode::Options;

/// Errors that can occur while saving or loading checkpoints.
#[derive(Debug)]
pub enum CheckpointError {
    /// Underlying I/O failure while reading or writing checkpoint files.
    Io(std::io::Error),
    /// Serialization or deserialization error from the binary codec.
    Serialization(bincode::Error),
    /// The checkpoint file was well formed but carries an incompatible schema version.
    VersionMismatch { expected: u32, found: u32 },
    /// The checkpoint file did not match the expected structure.
    InvalidFormat(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(err) => write!(f, "I/O error while accessing checkpoint: {err}"),
            CheckpointError::Serialization(err) => {
                write!(f, "Failed to (de)serialize checkpoint payload: {err}")
            }
            CheckpointError::VersionMismatch { expected, found } => write!(
                f,
                "Checkpoint version mismatch: expected {expected}, found {found}",
            ),
            CheckpointError::InvalidFormat(msg) => {
                write!(f, "Checkpoint file has invalid structure: {msg}")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err)
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(err: bincode::Error) -> Self {
        CheckpointError::Serialization(err)
    }
}

/// Deterministic binary codec options shared by all checkpoint implementations.
///
/// The byte limit keeps a corrupted length prefix from triggering a huge allocation.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
        .with_limit(1 << 32)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Components that support deterministic persistence implement this trait.
pub trait Checkpointable {
    /// Save the current state to `path` using the deterministic codec.
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError>;

    /// Load a state from `path` into `self`.
    fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CheckpointError>;

    /// Utility for writing a serializable snapshot with the shared codec.
    fn write_snapshot<P, T>(snapshot: &T, path: P) -> Result<(), CheckpointError>
    where
        P: AsRef<Path>,
        T: serde::Serialize,
    {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let partial = partial_path(path);
        let written = File::create(&partial)
            .map_err(CheckpointError::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                codec().serialize_into(&mut writer, snapshot)?;
                writer.flush()?;
                writer.get_ref().sync_all()?;
                Ok(())
            });
        if let Err(err) = written {
            fs::remove_file(&partial).ok();
            return Err(err);
        }
        fs::rename(&partial, path)?;
        Ok(())
    }

    /// Utility for reading a serializable snapshot with the shared codec.
    fn read_snapshot<P, T>(path: P) -> Result<T, CheckpointError>
    where
        P: AsRef<Path>,
        T: serde::de::DeserializeOwned,
    {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Ok(codec().deserialize_from(&mut reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        version: u32,
        value: u64,
    }

    impl Checkpointable for Counter {
        fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
            Self::write_snapshot(self, path)
        }

        fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CheckpointError> {
            *self = Self::read_snapshot(path)?;
            Ok(())
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("metagrad_checkpoint_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_save_replaces_previous_checkpoint_without_partial_file() {
        let dir = scratch_dir();
        let path = dir.join("nested").join("counter.ckpt");

        Counter { version: 1, value: 3 }.save_checkpoint(&path).unwrap();
        Counter { version: 1, value: 7 }.save_checkpoint(&path).unwrap();

        let mut loaded = Counter::default();
        loaded.load_checkpoint(&path).unwrap();
        assert_eq!(loaded, Counter { version: 1, value: 7 });
        assert!(!partial_path(&path).exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_path_is_a_sibling() {
        let path = Path::new("runs/model.ckpt");
        assert_eq!(partial_path(path), Path::new("runs/model.ckpt.partial"));
    }
}
