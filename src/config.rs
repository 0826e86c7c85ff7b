//! Backfill configuration.
//!
//! Everything comes from the environment (a `.env` file is loaded first by `main`).
//! Parsing goes through [`BackfillConfig::from_lookup`] so tests never touch the
//! process environment.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_DATABASE: &str = "(default)";
const DEFAULT_PAGE_SIZE: u32 = 300;
const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no credentials: set BACKFILL_CREDENTIALS or GOOGLE_APPLICATION_CREDENTIALS")]
    MissingCredentials,
    #[error("FIRESTORE_PROJECT_ID is required when FIRESTORE_EMULATOR_HOST is set")]
    MissingEmulatorProject,
    #[error("invalid value for {var}: '{value}' (expected {expected})")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// What to do with references whose target document no longer exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DanglingMode {
    /// Log them only.
    #[default]
    Report,
    /// Log them and remove them from the parent's reference list.
    Prune,
}

impl FromStr for DanglingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "prune" => Ok(Self::Prune),
            _ => Err(()),
        }
    }
}

/// Whether an already-owned subtopic marks its whole subtree as done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalPolicy {
    /// Skip the children of a subtopic that already has `userId`.
    #[default]
    TrustTag,
    /// Visit every reachable subtopic regardless of its tag.
    Exhaustive,
}

impl FromStr for TraversalPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust-tag" | "trust_tag" => Ok(Self::TrustTag),
            "exhaustive" => Ok(Self::Exhaustive),
            _ => Err(()),
        }
    }
}

/// Where the store lives and how to reach it.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreTarget {
    /// Production Firestore. `project_id` falls back to the key file's.
    Firestore {
        credentials_path: PathBuf,
        project_id: Option<String>,
    },
    Emulator { host: String, project_id: String },
}

/// Walker behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkOptions {
    pub dangling: DanglingMode,
    pub traversal: TraversalPolicy,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    pub target: StoreTarget,
    pub database: String,
    pub page_size: u32,
    pub walk: WalkOptions,
    pub report_path: Option<PathBuf>,
}

impl BackfillConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let project_id = get("FIRESTORE_PROJECT_ID");
        let target = match get("FIRESTORE_EMULATOR_HOST") {
            Some(host) => StoreTarget::Emulator {
                host,
                project_id: project_id.ok_or(ConfigError::MissingEmulatorProject)?,
            },
            None => {
                let credentials_path = get("BACKFILL_CREDENTIALS")
                    .or_else(|| get("GOOGLE_APPLICATION_CREDENTIALS"))
                    .ok_or(ConfigError::MissingCredentials)?;
                StoreTarget::Firestore {
                    credentials_path: PathBuf::from(credentials_path),
                    project_id,
                }
            }
        };

        let dangling: DanglingMode = match get("BACKFILL_DANGLING") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "BACKFILL_DANGLING",
                value: v.clone(),
                expected: "report|prune",
            })?,
            None => DanglingMode::default(),
        };

        let traversal: TraversalPolicy = match get("BACKFILL_TRAVERSAL") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "BACKFILL_TRAVERSAL",
                value: v.clone(),
                expected: "trust-tag|exhaustive",
            })?,
            None => TraversalPolicy::default(),
        };

        let dry_run = match get("BACKFILL_DRY_RUN") {
            Some(v) => parse_bool(&v).ok_or(ConfigError::Invalid {
                var: "BACKFILL_DRY_RUN",
                value: v,
                expected: "true|false",
            })?,
            None => false,
        };

        let page_size = match get("BACKFILL_PAGE_SIZE") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| (1..=MAX_PAGE_SIZE).contains(n))
                .ok_or(ConfigError::Invalid {
                    var: "BACKFILL_PAGE_SIZE",
                    value: v,
                    expected: "an integer in 1..=1000",
                })?,
            None => DEFAULT_PAGE_SIZE,
        };

        Ok(Self {
            target,
            database: get("FIRESTORE_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            page_size,
            walk: WalkOptions {
                dangling,
                traversal,
                dry_run,
            },
            report_path: get("BACKFILL_REPORT_PATH").map(PathBuf::from),
        })
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BackfillConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackfillConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("GOOGLE_APPLICATION_CREDENTIALS", "/keys/sa.json")]).unwrap();
        assert_eq!(
            config.target,
            StoreTarget::Firestore {
                credentials_path: PathBuf::from("/keys/sa.json"),
                project_id: None,
            }
        );
        assert_eq!(config.database, "(default)");
        assert_eq!(config.page_size, 300);
        assert_eq!(config.walk, WalkOptions::default());
        assert_eq!(config.walk.dangling, DanglingMode::Report);
        assert_eq!(config.walk.traversal, TraversalPolicy::TrustTag);
        assert!(config.report_path.is_none());
    }

    #[test]
    fn test_backfill_credentials_take_precedence() {
        let config = load(&[
            ("GOOGLE_APPLICATION_CREDENTIALS", "/keys/global.json"),
            ("BACKFILL_CREDENTIALS", "/keys/backfill.json"),
            ("FIRESTORE_PROJECT_ID", "study-aid"),
        ])
        .unwrap();
        assert_eq!(
            config.target,
            StoreTarget::Firestore {
                credentials_path: PathBuf::from("/keys/backfill.json"),
                project_id: Some("study-aid".to_string()),
            }
        );
    }

    #[test]
    fn test_missing_credentials() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::MissingCredentials);
        assert_eq!(
            load(&[("BACKFILL_CREDENTIALS", "  ")]).unwrap_err(),
            ConfigError::MissingCredentials
        );
    }

    #[test]
    fn test_emulator_needs_project() {
        assert_eq!(
            load(&[("FIRESTORE_EMULATOR_HOST", "localhost:8080")]).unwrap_err(),
            ConfigError::MissingEmulatorProject
        );
        let config = load(&[
            ("FIRESTORE_EMULATOR_HOST", "localhost:8080"),
            ("FIRESTORE_PROJECT_ID", "demo"),
        ])
        .unwrap();
        assert_eq!(
            config.target,
            StoreTarget::Emulator {
                host: "localhost:8080".to_string(),
                project_id: "demo".to_string(),
            }
        );
    }

    #[test]
    fn test_modes() {
        let config = load(&[
            ("BACKFILL_CREDENTIALS", "/k.json"),
            ("BACKFILL_DANGLING", "Prune"),
            ("BACKFILL_TRAVERSAL", "exhaustive"),
            ("BACKFILL_DRY_RUN", "yes"),
            ("BACKFILL_PAGE_SIZE", "50"),
            ("BACKFILL_REPORT_PATH", "out/report.json"),
        ])
        .unwrap();
        assert_eq!(config.walk.dangling, DanglingMode::Prune);
        assert_eq!(config.walk.traversal, TraversalPolicy::Exhaustive);
        assert!(config.walk.dry_run);
        assert_eq!(config.page_size, 50);
        assert_eq!(config.report_path, Some(PathBuf::from("out/report.json")));
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("BACKFILL_CREDENTIALS", "/k.json"), ("BACKFILL_DANGLING", "delete")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKFILL_DANGLING", .. }));

        let err = load(&[("BACKFILL_CREDENTIALS", "/k.json"), ("BACKFILL_PAGE_SIZE", "0")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKFILL_PAGE_SIZE", .. }));

        let err = load(&[("BACKFILL_CREDENTIALS", "/k.json"), ("BACKFILL_DRY_RUN", "maybe")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKFILL_DRY_RUN", .. }));
    }
}
