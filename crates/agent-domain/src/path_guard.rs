//! Path Guard — derive and validate per-user working directories.
//!
//! Every `cwd` handed to an Agent Client must be a descendant of
//! `base_dir/<user_id>`. Rejection happens at session-creation time, not
//! later when the subprocess is spawned.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// `user_id` must match `^[A-Za-z0-9_-]+$`.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty()
        || !user_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidInput(format!(
            "user_id must match ^[A-Za-z0-9_-]+$, got {user_id:?}"
        )));
    }
    Ok(())
}

/// `subdir` must be relative and must not normalize to a path containing
/// `..` segments.
fn validate_relative_no_escape(subdir: &str) -> Result<()> {
    let p = Path::new(subdir);
    if p.is_absolute() {
        return Err(Error::InvalidInput(format!(
            "path must be relative: {subdir:?}"
        )));
    }
    for component in p.components() {
        match component {
            Component::ParentDir => {
                return Err(Error::InvalidInput(format!(
                    "path must not contain '..': {subdir:?}"
                )))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::InvalidInput(format!(
                    "path must be relative: {subdir:?}"
                )))
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// Lexically join + normalize `base` and `rel`, without touching the
/// filesystem (no symlink resolution — traversal is caught by component
/// inspection before this point, and by the prefix check after).
fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            // ParentDir/RootDir/Prefix are rejected by validate_relative_no_escape
            // before this function is ever called with untrusted input.
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Derive and validate the working directory for `user_id`, optionally
/// under `subdir`. `base_dir` must already be absolute.
///
/// On success, returns an absolute path guaranteed to lie within
/// `base_dir/user_id`. If `auto_create_dir` is set, the directory (and
/// parents) is created; pre-existing directories are not an error.
pub fn resolve_cwd(
    base_dir: &Path,
    user_id: &str,
    subdir: Option<&str>,
    auto_create_dir: bool,
) -> Result<PathBuf> {
    validate_user_id(user_id)?;

    let user_root = lexical_join(base_dir, Path::new(user_id));

    let cwd = match subdir {
        None => user_root.clone(),
        Some(s) => {
            validate_relative_no_escape(s)?;
            lexical_join(&user_root, Path::new(s))
        }
    };

    if !cwd.starts_with(&user_root) {
        return Err(Error::PathEscape(format!(
            "{cwd:?} does not lie under {user_root:?}"
        )));
    }

    if auto_create_dir {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&cwd)?;
        }
        #[cfg(not(unix))]
        {
            std::fs::create_dir_all(&cwd)?;
        }
    }

    Ok(cwd)
}

/// Validate an `add_dirs` entry: must be relative and, once joined with
/// `cwd`, must remain under `cwd`.
pub fn validate_add_dir(cwd: &Path, add_dir: &str) -> Result<PathBuf> {
    validate_relative_no_escape(add_dir)?;
    let joined = lexical_join(cwd, Path::new(add_dir));
    if !joined.starts_with(cwd) {
        return Err(Error::PathEscape(format!(
            "add_dir {add_dir:?} escapes {cwd:?}"
        )));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/data/agent-users")
    }

    #[test]
    fn rejects_invalid_user_id() {
        assert!(validate_user_id("../etc").is_err());
        assert!(validate_user_id("alice bob").is_err());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("alice_123-x").is_ok());
    }

    #[test]
    fn resolves_plain_user_dir() {
        let cwd = resolve_cwd(&base(), "alice", None, false).unwrap();
        assert_eq!(cwd, base().join("alice"));
    }

    #[test]
    fn resolves_subdir() {
        let cwd = resolve_cwd(&base(), "alice", Some("projects/foo"), false).unwrap();
        assert_eq!(cwd, base().join("alice").join("projects").join("foo"));
    }

    #[test]
    fn rejects_traversal_subdir() {
        let err = resolve_cwd(&base(), "bob", Some("../etc"), false).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_absolute_subdir() {
        let err = resolve_cwd(&base(), "bob", Some("/etc/passwd"), false).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn add_dir_contained() {
        let cwd = base().join("alice");
        let resolved = validate_add_dir(&cwd, "libs").unwrap();
        assert_eq!(resolved, cwd.join("libs"));
    }

    #[test]
    fn add_dir_escape_rejected() {
        let cwd = base().join("alice");
        assert!(validate_add_dir(&cwd, "../bob").is_err());
    }

    #[test]
    fn auto_create_dir_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = resolve_cwd(tmp.path(), "carol", Some("work"), true).unwrap();
        assert!(cwd.is_dir());
        // Idempotent: creating again over an existing directory is not an error.
        let cwd2 = resolve_cwd(tmp.path(), "carol", Some("work"), true).unwrap();
        assert_eq!(cwd, cwd2);
    }
}
