//! Exclusion policy: paragraphs that bypass translation and review.
//!
//! ```toml
//! paragraph_ids = ["p_0003", "p_0017"]
//! patterns = ["front_*", "p_01?0"]
//! ```
//!
//! The policy is applied once, at seed time. Its fingerprint is recorded in
//! the manifest so a later invocation cannot silently swap it.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::UsageError;

#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    paragraph_ids: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

/// Recorded identity of a policy file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFingerprint {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    ids: BTreeSet<String>,
    patterns: Vec<Pattern>,
    fingerprint: Option<PolicyFingerprint>,
}

impl ExclusionPolicy {
    /// A policy that excludes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, UsageError> {
        let bytes = std::fs::read(path).map_err(|e| {
            UsageError::InvalidPolicy(format!(
                "cannot read exclusion policy {}: {e}",
                path.display()
            ))
        })?;
        let content = String::from_utf8_lossy(&bytes);
        let file: PolicyFile = toml::from_str(&content).map_err(|e| {
            UsageError::InvalidPolicy(format!(
                "invalid exclusion policy {}: {e}",
                path.display()
            ))
        })?;

        let patterns = file
            .patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    UsageError::InvalidPolicy(format!("invalid exclusion pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            ids: file.paragraph_ids.into_iter().collect(),
            patterns,
            fingerprint: Some(PolicyFingerprint {
                path,
                sha256: format!("{:x}", Sha256::digest(&bytes)),
            }),
        })
    }

    pub fn fingerprint(&self) -> Option<&PolicyFingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn is_excluded(&self, paragraph_id: &str) -> bool {
        self.ids.contains(paragraph_id) || self.patterns.iter().any(|p| p.matches(paragraph_id))
    }
}
