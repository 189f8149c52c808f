use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// How a listed repo's namespace maps onto directories under the root.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum PathLayout {
    /// `root/name`
    #[default]
    Flat,
    /// `root/group/subgroup/name`
    Nested,
    /// `root/group{sep}subgroup{sep}name`
    Flattened { separator: String },
}

impl PathLayout {
    pub fn validate(&self) -> Result<(), FleetError> {
        match self {
            PathLayout::Flattened { separator } => validate_separator(separator),
            _ => Ok(()),
        }
    }
}

pub fn validate_separator(separator: &str) -> Result<(), FleetError> {
    let unsafe_char = separator
        .chars()
        .any(|ch| is_reserved(ch) || ch.is_control());
    if separator.is_empty() || unsafe_char || separator.chars().all(|ch| ch == '.') {
        return Err(FleetError::UnsafeSeparator(separator.to_string()));
    }
    Ok(())
}

pub fn repo_path(
    root: &Path,
    namespace: &[String],
    name: &str,
    layout: &PathLayout,
) -> Result<PathBuf, FleetError> {
    layout.validate()?;
    let mut path = root.to_path_buf();
    match layout {
        PathLayout::Flat => path.push(sanitize_repo_name(name)),
        PathLayout::Nested => {
            for segment in namespace {
                path.push(sanitize_repo_name(segment));
            }
            path.push(sanitize_repo_name(name));
        }
        PathLayout::Flattened { separator } => {
            let joined = namespace
                .iter()
                .map(|segment| sanitize_repo_name(segment))
                .chain(std::iter::once(sanitize_repo_name(name)))
                .collect::<Vec<_>>()
                .join(separator);
            path.push(joined);
        }
    }
    Ok(path)
}

fn is_reserved(ch: char) -> bool {
    matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
}

pub fn sanitize_repo_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|ch| if is_reserved(ch) || ch.is_control() { '_' } else { ch })
        .collect();
    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// True when `ancestor` is a strict parent (at any depth) of `path`.
pub fn is_strict_ancestor(ancestor: &Path, path: &Path) -> bool {
    ancestor != path && path.starts_with(ancestor)
}

/// Absolute form of `path` for comparisons: symlinks resolved where the path
/// exists, `.` and `..` folded lexically below the deepest existing ancestor.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(real) = fs::canonicalize(path) {
        return real;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }
    for ancestor in lexical.ancestors().skip(1) {
        if let Ok(real) = fs::canonicalize(ancestor)
            && let Ok(rest) = lexical.strip_prefix(ancestor)
        {
            return real.join(rest);
        }
    }
    lexical
}

pub fn is_dot_entry(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}
