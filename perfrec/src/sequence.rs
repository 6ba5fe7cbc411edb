use crate::entity::ID;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::Debug,
    fs, io,
    hash::Hash,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Process-private counter for fact local ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSequence {
    offset: ID,
    next: ID,
}

impl LocalSequence {
    pub fn new(offset: ID) -> Self {
        Self {
            offset,
            next: offset,
        }
    }

    pub fn next_id(&mut self) -> ID {
        let id = self.next;
        self.next += 1;
        id
    }

    /// value the next call to `next_id` returns
    pub fn peek(&self) -> ID {
        self.next
    }

    /// number of ids handed out since creation
    pub fn issued(&self) -> usize {
        (self.next - self.offset) as usize
    }
}

/// Ids of a batch insert derived from the id of its first row, assuming contiguous allocation.
pub fn derive_by_sequence(first: ID, len: usize) -> Vec<ID> {
    (0..len as ID).map(|offset| first + offset).collect()
}

/// Lookup results come back in whatever order the store likes; put them back into request order.
pub fn reorder_by_key<K>(requested: &[K], fetched: Vec<(K, ID)>) -> Result<Vec<ID>, MissingKey<K>>
where
    K: Eq + Hash + Clone + Debug,
{
    let fetched: HashMap<K, ID> = fetched.into_iter().collect();

    requested
        .iter()
        .map(|key| fetched.get(key).copied().ok_or_else(|| MissingKey(key.clone())))
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Key {0:?} was not returned by the lookup")]
pub struct MissingKey<K: Debug>(pub K);

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("Failed to access offset file {path:?}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Offset file {path:?} is malformed")]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Next unused fact local ids of a single-writer producer, kept across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceOffsets {
    #[serde(default)]
    pub trial: ID,
    #[serde(default)]
    pub execution: ID,
}

impl SequenceOffsets {
    /// Read the side file; a missing file means a fresh producer starting at zero
    pub fn load(path: &Path) -> Result<Self, OffsetError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let offsets: Self =
                    serde_yaml::from_str(&content).map_err(|source| OffsetError::Malformed {
                        path: path.to_path_buf(),
                        source,
                    })?;

                info!(path = ?path, trial = offsets.trial, execution = offsets.execution, "Read sequence offsets");

                Ok(offsets)
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "No sequence offsets found, starting at zero");

                Ok(Self::default())
            }
            Err(source) => Err(OffsetError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn store(&self, path: &Path) -> Result<(), OffsetError> {
        let content = serde_yaml::to_string(self).map_err(|source| OffsetError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

        fs::write(path, content).map_err(|source| OffsetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = ?path, trial = self.trial, execution = self.execution, "Stored sequence offsets");

        Ok(())
    }
}
