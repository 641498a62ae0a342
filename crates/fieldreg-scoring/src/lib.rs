//! Vulnerability scoring: pure checklist algorithm plus remote/cached/local orchestration.

use std::path::Path;

use anyhow::Context;
use fieldreg_core::{ProfileError, WeightingProfile};
use fieldreg_storage::RemoteError;
use thiserror::Error;

pub mod algorithm;
pub mod engine;
pub mod recommendations;

pub use algorithm::{assess, global_score, round2, validate_input};
pub use engine::{ScoringApi, ScoringEngine};
pub use recommendations::recommendations_for;

pub const CRATE_NAME: &str = "fieldreg-scoring";

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid weighting profile: {0}")]
    InvalidProfile(#[from] ProfileError),
    #[error("remote scoring unavailable and no cached assessment: {0}")]
    Remote(#[from] RemoteError),
}

/// Reads a YAML weighting profile used in place of the built-in default.
///
/// ```yaml
/// weights:
///   economic: 35
///   housing: 25
///   health: 20
///   education: 10
///   social: 10
/// ```
pub fn load_profile_file(path: &Path) -> anyhow::Result<WeightingProfile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let profile: WeightingProfile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    profile
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldreg_core::Dimension;
    use tempfile::tempdir;

    #[test]
    fn yaml_profile_loads_and_validates() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profile.yaml");
        std::fs::write(
            &path,
            "weights:\n  economic: 30\n  housing: 20\n  health: 20\n  education: 15\n  social: 15\n",
        )
        .expect("write");
        let profile = load_profile_file(&path).expect("load");
        assert_eq!(profile.weight(Dimension::Education), 15.0);
    }

    #[test]
    fn yaml_profile_with_bad_total_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profile.yaml");
        std::fs::write(
            &path,
            "weights:\n  economic: 50\n  housing: 20\n  health: 20\n  education: 15\n  social: 15\n",
        )
        .expect("write");
        let err = load_profile_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("sum to 100"));
    }
}
