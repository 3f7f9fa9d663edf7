//! Path checks shared by the store and the watch registry.

use std::path::{Component, Path, PathBuf};

use crate::error::StoreError;

/// Accepts only non-empty relative paths that stay inside the reviewed root.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] for empty, absolute, or `..`-escaping paths.
pub fn validate_relative(path: &str) -> Result<(), StoreError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation("path is required".to_owned()));
    }
    let p = Path::new(trimmed);
    if p.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(StoreError::Validation(format!("absolute path not allowed: {trimmed}")));
    }
    let mut depth: usize = 0;
    for component in p.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return Err(StoreError::Validation(format!(
                        "path escapes the reviewed root: {trimmed}"
                    )));
                }
                depth -= 1;
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::Validation(format!("absolute path not allowed: {trimmed}")));
            }
        }
    }
    Ok(())
}

/// Resolves `root` to the canonical absolute path used as a registry key.
///
/// Falls back to a lexical absolute path when the directory does not exist,
/// so callers still get a stable key.
pub fn canonical_root(root: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(root) {
        return canonical;
    }
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(root)
    };
    lexical_normalize(&absolute)
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Renders `path` relative to `root` with `/` separators.
pub fn relative_display(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths() {
        assert!(validate_relative("src/lib.rs").is_ok());
        assert!(validate_relative("./src/../lib.rs").is_ok());
        assert!(validate_relative("../lib.rs").is_err());
        assert!(validate_relative("src/../../lib.rs").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("  ").is_err());
    }

    #[test]
    fn missing_root_is_normalized_lexically() {
        let root = canonical_root(Path::new("/definitely/not/here/../there"));
        assert_eq!(root, PathBuf::from("/definitely/not/there"));
    }

    #[test]
    fn relative_display_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_display(root, Path::new("/repo/src/x.ts")).as_deref(),
            Some("src/x.ts")
        );
        assert_eq!(relative_display(root, Path::new("/elsewhere/x.ts")), None);
    }
}
