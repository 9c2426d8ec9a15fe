use std::path::{Component, Path, PathBuf};

use crate::error::ResolveError;

/// Only a single normal path component is accepted as an identifier.
fn is_plain_segment(identifier: &str) -> bool {
    if identifier.is_empty() || identifier.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(identifier).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Maps an archive identifier to the directory it names under `root`.
///
/// The returned path is canonical and guaranteed to lie inside the canonical
/// `root`, so symlinks pointing out of the archive root are rejected as well.
pub(crate) fn resolve(identifier: &str, root: &Path) -> Result<PathBuf, ResolveError> {
    let not_found = || ResolveError::NotFound {
        identifier: identifier.to_string(),
    };

    if !is_plain_segment(identifier) {
        return Err(not_found());
    }

    let root = root.canonicalize().map_err(|e| {
        log::warn!("archive root {} is unavailable: {e}", root.display());
        not_found()
    })?;
    let full_path = root.join(identifier).canonicalize().map_err(|_| not_found())?;

    if !full_path.starts_with(&root) || !full_path.is_dir() {
        return Err(not_found());
    }

    Ok(full_path)
}
