//! Immutable per-run manifest.
//!
//! Written once when a run is created. Every later invocation is reconciled
//! against it: omitted settings are taken from the manifest, and any
//! setting that differs fails with [`StateError::ManifestDrift`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Profile;
use crate::errors::{RunError, StateError, UsageError};
use crate::exclusion::PolicyFingerprint;
use crate::paragraph::ReworkReentry;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub pipeline_profile: String,
    pub source_path: PathBuf,
    pub model: String,
    pub source_lang: String,
    pub pass1_lang: String,
    #[serde(default)]
    pub pass2_lang: Option<String>,
    pub rework_reentry: ReworkReentry,
    #[serde(default)]
    pub exclusion_policy: Option<PolicyFingerprint>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Manifest-relevant settings of one invocation.
#[derive(Debug, Clone, Default)]
pub struct ManifestRequest {
    pub run_id: String,
    pub source: Option<PathBuf>,
    pub model: Option<String>,
    /// Name and resolved definition of the requested profile.
    pub profile: Option<(String, Profile)>,
    pub exclusion_policy: Option<PolicyFingerprint>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        storage::read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        storage::write_json_atomic(path, self)
    }

    pub fn profile(&self) -> Profile {
        Profile {
            pass1_lang: self.pass1_lang.clone(),
            pass2_lang: self.pass2_lang.clone(),
            source_lang: self.source_lang.clone(),
            rework_reentry: self.rework_reentry,
        }
    }

    /// Build the manifest for a brand new run.
    pub fn create(
        request: ManifestRequest,
        default_profile: (String, Profile),
        now: DateTime<Utc>,
    ) -> Result<Self, UsageError> {
        let source = request.source.ok_or(UsageError::MissingArgument("source"))?;
        let model = request.model.ok_or(UsageError::MissingArgument("model"))?;
        let (profile_name, profile) = request.profile.unwrap_or(default_profile);

        Ok(Self {
            run_id: request.run_id,
            pipeline_profile: profile_name,
            source_path: normalize(&source),
            model,
            source_lang: profile.source_lang,
            pass1_lang: profile.pass1_lang,
            pass2_lang: profile.pass2_lang,
            rework_reentry: profile.rework_reentry,
            exclusion_policy: request.exclusion_policy,
            created_at: now,
            created_by: format!("runwright {}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Check an invocation against this manifest.
    pub fn check_drift(&self, request: &ManifestRequest) -> Result<(), StateError> {
        check("run_id", &self.run_id, Some(&request.run_id))?;
        if let Some(source) = &request.source {
            check(
                "source",
                &self.source_path.display().to_string(),
                Some(&normalize(source).display().to_string()),
            )?;
        }
        check("model", &self.model, request.model.as_ref())?;

        if let Some((name, profile)) = &request.profile {
            check("pipeline_profile", &self.pipeline_profile, Some(name))?;
            let recorded = self.profile();
            check("source_lang", &recorded.source_lang, Some(&profile.source_lang))?;
            check("pass1_lang", &recorded.pass1_lang, Some(&profile.pass1_lang))?;
            check(
                "pass2_lang",
                &recorded.pass2_lang.unwrap_or_default(),
                Some(&profile.pass2_lang.clone().unwrap_or_default()),
            )?;
            check(
                "rework_reentry",
                &recorded.rework_reentry.to_string(),
                Some(&profile.rework_reentry.to_string()),
            )?;
        }

        if let Some(requested) = &request.exclusion_policy {
            let recorded = self
                .exclusion_policy
                .as_ref()
                .map(|p| p.sha256.clone())
                .unwrap_or_else(|| "none".to_string());
            check("exclusion_policy", &recorded, Some(&requested.sha256))?;
        }
        Ok(())
    }
}

/// Load the run's manifest, creating it if absent, and reconcile the invocation against it.
pub fn reconcile(
    path: &Path,
    request: ManifestRequest,
    default_profile: (String, Profile),
    now: DateTime<Utc>,
) -> Result<Manifest, RunError> {
    if let Some(existing) = Manifest::load(path)? {
        existing.check_drift(&request)?;
        return Ok(existing);
    }

    let manifest = Manifest::create(request, default_profile, now)?;
    manifest.save(path)?;
    info!(
        run_id = %manifest.run_id,
        profile = %manifest.pipeline_profile,
        model = %manifest.model,
        "Created run manifest"
    );
    Ok(manifest)
}

fn check(field: &str, recorded: &str, requested: Option<&String>) -> Result<(), StateError> {
    match requested {
        Some(value) if value != recorded => Err(StateError::ManifestDrift {
            field: field.to_string(),
            recorded: recorded.to_string(),
            requested: value.clone(),
        }),
        _ => Ok(()),
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_profiles;
    use tempfile::tempdir;

    fn profile(name: &str) -> (String, Profile) {
        (name.to_string(), builtin_profiles().remove(name).unwrap())
    }

    fn request(source: &Path) -> ManifestRequest {
        ManifestRequest {
            run_id: "r1".into(),
            source: Some(source.to_path_buf()),
            model: Some("m-large".into()),
            profile: Some(profile("pivot-en-de")),
            exclusion_policy: None,
        }
    }

    #[test]
    fn test_first_invocation_writes_manifest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("book.md");
        std::fs::write(&source, "text").unwrap();
        let path = dir.path().join("manifest.json");

        let m = reconcile(&path, request(&source), profile("single-en"), Utc::now()).unwrap();
        assert_eq!(m.pipeline_profile, "pivot-en-de");
        assert_eq!(m.pass2_lang.as_deref(), Some("de"));
        assert_eq!(Manifest::load(&path).unwrap(), Some(m));
    }

    #[test]
    fn test_new_run_requires_source_and_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let req = ManifestRequest {
            run_id: "r1".into(),
            model: Some("m".into()),
            ..Default::default()
        };
        let err = reconcile(&path, req, profile("single-en"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            RunError::Usage(UsageError::MissingArgument("source"))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_omitted_settings_come_from_manifest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("book.md");
        std::fs::write(&source, "text").unwrap();
        let path = dir.path().join("manifest.json");
        reconcile(&path, request(&source), profile("single-en"), Utc::now()).unwrap();

        let bare = ManifestRequest {
            run_id: "r1".into(),
            ..Default::default()
        };
        let m = reconcile(&path, bare, profile("single-en"), Utc::now()).unwrap();
        assert_eq!(m.model, "m-large");
        assert_eq!(m.pipeline_profile, "pivot-en-de");
    }

    #[test]
    fn test_changed_model_is_drift() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("book.md");
        std::fs::write(&source, "text").unwrap();
        let path = dir.path().join("manifest.json");
        reconcile(&path, request(&source), profile("single-en"), Utc::now()).unwrap();

        let mut changed = request(&source);
        changed.model = Some("m-small".into());
        let err = reconcile(&path, changed, profile("single-en"), Utc::now()).unwrap_err();
        match err {
            RunError::State(StateError::ManifestDrift {
                field,
                recorded,
                requested,
            }) => {
                assert_eq!(field, "model");
                assert_eq!(recorded, "m-large");
                assert_eq!(requested, "m-small");
            }
            other => panic!("expected ManifestDrift, got {other:?}"),
        }
    }

    #[test]
    fn test_redefined_profile_is_drift() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("book.md");
        std::fs::write(&source, "text").unwrap();
        let path = dir.path().join("manifest.json");
        reconcile(&path, request(&source), profile("single-en"), Utc::now()).unwrap();

        let mut changed = request(&source);
        if let Some((_, p)) = changed.profile.as_mut() {
            p.pass2_lang = Some("nl".into());
        }
        let err = reconcile(&path, changed, profile("single-en"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            RunError::State(StateError::ManifestDrift { ref field, .. }) if field == "pass2_lang"
        ));
    }

    #[test]
    fn test_adding_exclusion_policy_later_is_drift() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("book.md");
        std::fs::write(&source, "text").unwrap();
        let path = dir.path().join("manifest.json");
        reconcile(&path, request(&source), profile("single-en"), Utc::now()).unwrap();

        let mut changed = request(&source);
        changed.exclusion_policy = Some(PolicyFingerprint {
            path: dir.path().join("exclude.toml"),
            sha256: "abc".into(),
        });
        assert!(reconcile(&path, changed, profile("single-en"), Utc::now()).is_err());
    }
}
