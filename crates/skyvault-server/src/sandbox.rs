//! Path sandbox
//!
//! Client-supplied path segments are joined onto the user's root and then
//! checked against it in canonical form. Nothing touches the filesystem
//! outside the root: every operation that takes a client path resolves it
//! through one of the functions here first.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Join `root`, the cleaned `user_path` and `filename`.
///
/// Leading slashes of `user_path` are stripped and a trailing slash added,
/// so `"/docs"` and `"docs/"` both land in `<root>/docs/`. No validation
/// happens here; pass the result to [`is_safe_path`].
pub fn build_full_path(root: &Path, user_path: &str, filename: &str) -> PathBuf {
    let mut full = root.to_string_lossy().into_owned();
    if !full.ends_with('/') {
        full.push('/');
    }

    let cleaned = user_path.trim_start_matches('/');
    if !cleaned.is_empty() {
        full.push_str(cleaned);
        if !cleaned.ends_with('/') {
            full.push('/');
        }
    }

    full.push_str(filename);
    PathBuf::from(full)
}

/// Accept `candidate` only if its canonical form lies inside the canonical root.
///
/// Both paths are resolved (symlinks and `..` included). The containment test
/// is component-wise, so `/srv/alice2` is not inside `/srv/alice`. A path that
/// cannot be resolved, typically because it does not exist, is unsafe.
pub fn is_safe_path(root: &Path, candidate: &Path) -> bool {
    match (root.canonicalize(), candidate.canonicalize()) {
        (Ok(root), Ok(candidate)) => candidate.starts_with(&root),
        _ => false,
    }
}

/// Reject filenames that could address anything but a direct child
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() || filename == "." || filename == ".." {
        return Err(Error::invalid_path(format!("bad filename {filename:?}")));
    }
    if filename.contains('/') || filename.contains('\0') {
        return Err(Error::invalid_path(format!(
            "filename {filename:?} contains a separator"
        )));
    }
    Ok(())
}

/// Resolve a path that must already exist inside `root`.
///
/// # Returns
///
/// The canonical path. `FileNotFound` is reported only when the parent
/// directory resolves inside the root, so a missing target outside the root
/// is indistinguishable from a traversal attempt.
pub fn resolve_existing(root: &Path, user_path: &str, filename: &str) -> Result<PathBuf> {
    let full = build_full_path(root, user_path, filename);
    if is_safe_path(root, &full) {
        return full.canonicalize().map_err(Error::Io);
    }

    let missing = matches!(
        full.symlink_metadata(),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound
    );
    let parent_inside = full
        .parent()
        .map(|parent| is_safe_path(root, parent))
        .unwrap_or(false);

    if missing && parent_inside {
        Err(Error::FileNotFound(display_name(user_path, filename)))
    } else {
        Err(Error::invalid_path(full.display().to_string()))
    }
}

/// Resolve the destination of a file about to be created or truncated.
///
/// The file itself may not exist yet, so the containing directory is what
/// gets canonicalized and checked. An existing target must also resolve
/// inside the root, which rules out symlinks pointing elsewhere.
pub fn resolve_for_create(root: &Path, user_path: &str, filename: &str) -> Result<PathBuf> {
    validate_filename(filename)?;

    let dir = build_full_path(root, user_path, "");
    if !is_safe_path(root, &dir) {
        return Err(Error::invalid_path(dir.display().to_string()));
    }

    let canonical_dir = dir.canonicalize()?;
    if !canonical_dir.is_dir() {
        return Err(Error::invalid_path(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let target = canonical_dir.join(filename);
    if target.symlink_metadata().is_ok() {
        if !is_safe_path(root, &target) {
            return Err(Error::invalid_path(target.display().to_string()));
        }
        if target.is_dir() {
            return Err(Error::invalid_path(format!(
                "{} is a directory",
                target.display()
            )));
        }
    }

    Ok(target)
}

/// `path/filename` as the client would recognise it
pub fn display_name(user_path: &str, filename: &str) -> String {
    let cleaned = user_path.trim_matches('/');
    match (cleaned.is_empty(), filename.is_empty()) {
        (true, _) => format!("/{filename}"),
        (false, true) => format!("/{cleaned}"),
        (false, false) => format!("/{cleaned}/{filename}"),
    }
}
