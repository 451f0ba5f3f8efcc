//! Content fingerprints for cache keying.
//!
//! A [`FingerprintId`] is the SHA-256 of a file's bytes together with a
//! canonical JSON serialization of the [`ConfigSnapshot`] fields that change
//! analysis output. It never looks at paths or modification times, so an
//! unchanged file that moved keeps its fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::chunk::ChunkParams;
use crate::models::TaskKind;

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintId(String);

impl FingerprintId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FingerprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FingerprintId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The output-relevant slice of the pipeline configuration.
///
/// Sets and maps are ordered so the serialization is canonical regardless of
/// the order options were declared in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSnapshot {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub task_kinds: BTreeSet<TaskKind>,
    /// Backend id → (kinds it serves, revision such as a model name).
    pub backends: BTreeMap<String, (BTreeSet<TaskKind>, String)>,
}

impl ConfigSnapshot {
    pub fn new(params: ChunkParams, task_kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        Self {
            chunk_size: params.max_size(),
            chunk_overlap: params.overlap(),
            task_kinds: task_kinds.into_iter().collect(),
            backends: BTreeMap::new(),
        }
    }

    pub fn with_backend(
        mut self,
        id: &str,
        kinds: impl IntoIterator<Item = TaskKind>,
        revision: &str,
    ) -> Self {
        self.backends.insert(
            id.to_string(),
            (kinds.into_iter().collect(), revision.to_string()),
        );
        self
    }

    /// Short stable label for the task-kind set and the backends serving it.
    pub fn task_signature(&self) -> String {
        let kinds: Vec<&str> = self.task_kinds.iter().map(|k| k.as_str()).collect();
        let backends: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        format!("{}@{}", kinds.join("+"), backends.join(","))
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing plain structs of ordered collections cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Fingerprint `content` under `config`.
pub fn fingerprint(content: &[u8], config: &ConfigSnapshot) -> FingerprintId {
    let mut hasher = Sha256::new();
    hasher.update((content.len() as u64).to_le_bytes());
    hasher.update(content);
    hasher.update(config.canonical_bytes());
    FingerprintId(hex::encode(hasher.finalize()))
}
