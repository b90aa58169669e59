use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultAccessError {
    #[error("path `{path}` is invalid: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("path `{path}` resolves outside the vault")]
    OutsideVault { path: String },
    #[error("path `{path}` is inside protected directory {dir}")]
    Protected { path: String, dir: String },
}

/// Resolves a step path (absolute, or relative to the vault root) and
/// confirms it stays inside the vault once `..` segments and symlinked
/// ancestors are accounted for.
pub fn resolve_in_vault(vault_root: &Path, raw: &str) -> Result<PathBuf, VaultAccessError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(VaultAccessError::InvalidPath {
            path: raw.to_string(),
            reason: "path must be non-empty".to_string(),
        });
    }
    let requested = Path::new(trimmed);
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        vault_root.join(requested)
    };

    let root = canonicalize_through_existing(vault_root)?;
    let resolved = canonicalize_through_existing(&candidate)?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(VaultAccessError::OutsideVault {
            path: trimmed.to_string(),
        })
    }
}

/// The vault root plus directories inside it that steps may never touch:
/// the state dir (audit and runtime logs), the snapshot archive and the
/// learning data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultScope {
    root: PathBuf,
    protected: Vec<PathBuf>,
}

impl VaultScope {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            protected: Vec::new(),
        }
    }

    pub fn protecting(mut self, dir: impl Into<PathBuf>) -> Self {
        self.protected.push(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// [`resolve_in_vault`], additionally refusing protected directories and
    /// anything below them.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, VaultAccessError> {
        let resolved = resolve_in_vault(&self.root, raw)?;
        for dir in &self.protected {
            let guarded = if dir.is_absolute() {
                canonicalize_through_existing(dir)?
            } else {
                canonicalize_through_existing(&self.root.join(dir))?
            };
            if resolved.starts_with(&guarded) {
                return Err(VaultAccessError::Protected {
                    path: raw.trim().to_string(),
                    dir: dir.display().to_string(),
                });
            }
        }
        Ok(resolved)
    }
}

/// Canonicalizes the deepest existing ancestor of `path` and re-attaches the
/// remaining components, so not-yet-created targets still resolve symlinks
/// above them.
fn canonicalize_through_existing(path: &Path) -> Result<PathBuf, VaultAccessError> {
    let normalized = normalize_absolute_path(path)?;
    let mut existing = normalized.clone();
    let mut remainder = Vec::new();
    loop {
        match fs::canonicalize(&existing) {
            Ok(canonical) => {
                let mut out = canonical;
                for part in remainder.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(_) => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Ok(normalized);
                };
                remainder.push(name);
                if !existing.pop() {
                    return Ok(normalized);
                }
            }
        }
    }
}

pub(crate) fn normalize_absolute_path(path: &Path) -> Result<PathBuf, VaultAccessError> {
    if !path.is_absolute() {
        return Err(VaultAccessError::InvalidPath {
            path: path.display().to_string(),
            reason: "path must be absolute".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::Normal(v) => normalized.push(v),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(VaultAccessError::InvalidPath {
                        path: path.display().to_string(),
                        reason: "path escapes filesystem root".to_string(),
                    });
                }
            }
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_paths_resolve_under_vault() {
        let dir = tempdir().expect("tempdir");
        let resolved = resolve_in_vault(dir.path(), "Done/report.md").expect("inside vault");
        let root = fs::canonicalize(dir.path()).expect("canonical root");
        assert_eq!(resolved, root.join("Done/report.md"));
    }

    #[test]
    fn parent_segments_cannot_escape() {
        let dir = tempdir().expect("tempdir");
        let err = resolve_in_vault(dir.path(), "Done/../../outside.md").expect_err("escape");
        assert!(matches!(err, VaultAccessError::OutsideVault { .. }));
        assert!(resolve_in_vault(dir.path(), "Done/../Done/inside.md").is_ok());
    }

    #[test]
    fn absolute_paths_outside_vault_are_rejected() {
        let dir = tempdir().expect("tempdir");
        assert!(resolve_in_vault(dir.path(), "/etc/passwd").is_err());
        let inside = dir.path().join("notes.md");
        assert!(resolve_in_vault(dir.path(), &inside.display().to_string()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_pointing_out_are_rejected() {
        let vault = tempdir().expect("vault");
        let outside = tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), vault.path().join("link"))
            .expect("create symlink");
        assert!(resolve_in_vault(vault.path(), "link/new-file.md").is_err());
    }

    #[test]
    fn scope_refuses_protected_directories() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join(".taskgate/logs")).expect("state dir");
        let scope = VaultScope::new(dir.path())
            .protecting(dir.path().join(".taskgate"))
            .protecting(dir.path().join("Rollback_Archive"));

        for raw in [
            ".taskgate/logs/operations.log",
            "Done/../.taskgate",
            "Rollback_Archive/snap/manifest.json",
        ] {
            let err = scope.resolve(raw).expect_err(raw);
            assert!(matches!(err, VaultAccessError::Protected { .. }), "{raw}");
        }
        assert!(scope.resolve("Done/.taskgate-notes.md").is_ok());
        assert!(scope.resolve("Rollback_Archive.md").is_ok());
    }

    #[test]
    fn empty_paths_are_invalid() {
        let dir = tempdir().expect("tempdir");
        let err = resolve_in_vault(dir.path(), "  ").expect_err("empty");
        assert!(matches!(err, VaultAccessError::InvalidPath { .. }));
    }
}
