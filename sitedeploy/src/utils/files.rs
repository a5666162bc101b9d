//! Blocking filesystem helpers for turning directories into artifact content.
//!
//! Callers on the async runtime wrap these in `spawn_blocking`.

use crate::core::ArtifactContent;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Lists every regular file under `root`, as `/`-separated relative paths,
/// sorted.
pub fn walk_files(root: &Path) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    if root.exists() {
        walk_into(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_into(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(relative_key(rel));
            }
        }
    }
    Ok(())
}

fn relative_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Reads every file under `root` into artifact content.
pub fn read_tree(root: &Path) -> io::Result<ArtifactContent> {
    let mut content = ArtifactContent::new();
    for key in walk_files(root)? {
        let body = std::fs::read(root.join(&key))?;
        content.insert(key, body);
    }
    Ok(content)
}

/// Writes artifact content below `root`, creating directories as needed.
pub fn write_tree(root: &Path, content: &ArtifactContent) -> io::Result<()> {
    for (key, body) in content.files() {
        let path = safe_join(root, key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unsafe path: {key}"))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
    }
    Ok(())
}

/// Joins a relative `/`-separated key onto `root`, refusing anything that
/// could escape it.
#[must_use]
pub fn safe_join(root: &Path, key: &str) -> Option<PathBuf> {
    if key.is_empty() {
        return None;
    }
    let mut path = root.to_path_buf();
    for part in key.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return None;
        }
        path.push(part);
    }
    Some(path)
}
