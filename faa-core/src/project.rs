//! Project discovery and host-label derivation.
//!
//! A project is the nearest ancestor directory containing a `package.json`.
//! Its declared `name` is normalized into a hostname-safe label: lowercase,
//! runs of anything outside `[a-z0-9-]` collapsed to a single `-`, edge
//! dashes trimmed.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "package.json";

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("no {MANIFEST_FILE} found in {start} or any parent directory")]
    NotFound { start: PathBuf },
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    name: String,
}

/// A resolved project: its root directory and normalized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub root: PathBuf,
    pub name: String,
}

impl Project {
    /// The hostname-safe label for this project (without domain suffix).
    pub fn host(&self) -> &str {
        &self.name
    }
}

/// Walk upward from `start` to the nearest directory containing a
/// manifest, parse its `name`, and return the project. Reaching the
/// filesystem root without a manifest is [`ProjectError::NotFound`].
pub fn find_project_root(start: &Path) -> Result<Project, ProjectError> {
    let start = if start.is_absolute() {
        start.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| ProjectError::Unreadable {
                path: start.to_path_buf(),
                source,
            })?
            .join(start)
    };

    let mut dir = start.as_path();
    loop {
        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.is_file() {
            let data =
                std::fs::read_to_string(&manifest_path).map_err(|source| ProjectError::Unreadable {
                    path: manifest_path.clone(),
                    source,
                })?;
            let manifest: Manifest =
                serde_json::from_str(&data).map_err(|source| ProjectError::Malformed {
                    path: manifest_path,
                    source,
                })?;
            return Ok(Project {
                root: dir.to_path_buf(),
                name: normalize_name(&manifest.name),
            });
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Err(ProjectError::NotFound { start }),
        }
    }
}

/// Normalize a declared project name into a host label. The result matches
/// `^[a-z0-9]([a-z0-9-]*[a-z0-9])?$` or is empty; normalization is
/// idempotent.
pub fn normalize_name(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            label.push(ch);
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }

    // Collapse dash runs that came from literal dashes in the input.
    let mut collapsed = String::with_capacity(label.len());
    for ch in label.chars() {
        if ch == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(ch);
    }

    collapsed.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalizes_scoped_package_names() {
        assert_eq!(normalize_name("@My-Org/My.Project_Name"), "my-org-my-project-name");
    }

    #[test]
    fn normalization_cases() {
        assert_eq!(normalize_name("my-app"), "my-app");
        assert_eq!(normalize_name("MyApp"), "myapp");
        assert_eq!(normalize_name("my app 2"), "my-app-2");
        assert_eq!(normalize_name("--weird--name--"), "weird-name");
        assert_eq!(normalize_name("!!!"), "");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for name in ["@My-Org/My.Project_Name", "Hello World", "a--b", "héllo", ""] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn normalized_labels_match_hostname_shape() {
        for name in ["@scope/pkg", "A_B_C", "3d-model viewer", "-x-"] {
            let label = normalize_name(name);
            if label.is_empty() {
                continue;
            }
            assert!(!label.starts_with('-') && !label.ends_with('-'), "{label}");
            assert!(
                label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
                "{label}"
            );
            assert!(!label.contains("--"), "{label}");
        }
    }

    #[test]
    fn finds_manifest_in_parent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join(MANIFEST_FILE), r#"{"name": "My App"}"#).unwrap();
        let nested = root.join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let project = find_project_root(&nested).unwrap();
        assert_eq!(project.root, root);
        assert_eq!(project.name, "my-app");
    }

    #[test]
    fn nearest_manifest_wins() {
        let dir = tempdir().unwrap();
        let outer = dir.path();
        std::fs::write(outer.join(MANIFEST_FILE), r#"{"name": "outer"}"#).unwrap();
        let inner = outer.join("packages").join("web");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join(MANIFEST_FILE), r#"{"name": "inner"}"#).unwrap();

        let project = find_project_root(&inner).unwrap();
        assert_eq!(project.root, inner);
        assert_eq!(project.name, "inner");
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        let err = find_project_root(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectError::NotFound { .. }));
    }

    #[test]
    fn malformed_manifest_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        let err = find_project_root(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectError::Malformed { .. }));
    }

    #[test]
    fn manifest_without_name_yields_empty_label() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"version": "1.0.0"}"#).unwrap();
        let project = find_project_root(dir.path()).unwrap();
        assert_eq!(project.name, "");
    }
}
