//! Logical file name → absolute path mapping.
//!
//! Clients only ever see logical names. The path behind a name is resolved
//! here and never leaves the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::TailError;

const MAX_NAME_LEN: usize = 64;

/// Errors raised while building an [`AllowList`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllowListError {
    /// Name is empty, too long, or contains characters outside `[A-Za-z0-9._-]`.
    #[error("invalid file name {0:?}: expected 1-64 characters of [A-Za-z0-9._-]")]
    InvalidName(String),
    /// Path is not absolute.
    #[error("path for {name:?} must be absolute")]
    RelativePath {
        /// Offending logical name.
        name: String,
    },
    /// The same name was registered twice.
    #[error("duplicate file name {0:?}")]
    Duplicate(String),
    /// A `name=path` pair could not be split.
    #[error("malformed file entry {0:?}: expected NAME=/absolute/path")]
    Malformed(String),
}

/// Fixed set of tailable files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: BTreeMap<String, PathBuf>,
}

impl AllowList {
    /// Empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, path)` pairs.
    pub fn from_pairs<I, N, P>(pairs: I) -> Result<Self, AllowListError>
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<PathBuf>,
    {
        let mut list = Self::new();
        for (name, path) in pairs {
            list.insert(name, path)?;
        }
        Ok(list)
    }

    /// Parse a single `NAME=/absolute/path` entry.
    pub fn parse_entry(entry: &str) -> Result<(String, PathBuf), AllowListError> {
        let (name, path) = entry
            .split_once('=')
            .ok_or_else(|| AllowListError::Malformed(entry.to_owned()))?;
        let name = name.trim();
        let path = path.trim();
        if name.is_empty() || path.is_empty() {
            return Err(AllowListError::Malformed(entry.to_owned()));
        }
        Ok((name.to_owned(), PathBuf::from(path)))
    }

    /// Register `name` → `path`.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<(), AllowListError> {
        let name = name.into();
        let path = path.into();
        if !is_valid_name(&name) {
            return Err(AllowListError::InvalidName(name));
        }
        if !path.is_absolute() {
            return Err(AllowListError::RelativePath { name });
        }
        if self.entries.contains_key(&name) {
            return Err(AllowListError::Duplicate(name));
        }
        let _ = self.entries.insert(name, path);
        Ok(())
    }

    /// Resolve a client-supplied logical name.
    pub fn resolve(&self, name: &str) -> Result<&Path, TailError> {
        self.entries
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| TailError::UnknownFile {
                name: name.to_owned(),
            })
    }

    /// Whether `name` is allow-listed.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Logical names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `(name, path)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no files are allow-listed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `[A-Za-z0-9._-]{1,64}`, and not a dot-only name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && !name.bytes().all(|b| b == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn insert_and_resolve() {
        let list = AllowList::from_pairs([("app", "/var/log/app.log")]).unwrap();
        assert_eq!(list.resolve("app").unwrap(), Path::new("/var/log/app.log"));
        assert_eq!(list.len(), 1);
        assert!(list.contains("app"));
    }

    #[test]
    fn unknown_name_is_unknown_file() {
        let list = AllowList::new();
        assert_matches!(
            list.resolve("../../etc/passwd"),
            Err(TailError::UnknownFile { ref name }) if name == "../../etc/passwd"
        );
    }

    #[test]
    fn rejects_traversal_and_bad_names() {
        let mut list = AllowList::new();
        assert_matches!(
            list.insert("../etc", "/etc/passwd"),
            Err(AllowListError::InvalidName(_))
        );
        assert_matches!(list.insert("", "/x"), Err(AllowListError::InvalidName(_)));
        assert_matches!(list.insert("..", "/x"), Err(AllowListError::InvalidName(_)));
        assert_matches!(
            list.insert("a".repeat(65), "/x"),
            Err(AllowListError::InvalidName(_))
        );
        assert!(list.insert("a".repeat(64), "/x").is_ok());
    }

    #[test]
    fn rejects_relative_path() {
        let mut list = AllowList::new();
        assert_matches!(
            list.insert("app", "logs/app.log"),
            Err(AllowListError::RelativePath { .. })
        );
    }

    #[test]
    fn rejects_duplicate() {
        let mut list = AllowList::new();
        list.insert("app", "/a").unwrap();
        assert_matches!(list.insert("app", "/b"), Err(AllowListError::Duplicate(_)));
    }

    #[test]
    fn parse_entry_splits_on_first_equals() {
        let (name, path) = AllowList::parse_entry(" app = /var/log/a=b.log ").unwrap();
        assert_eq!(name, "app");
        assert_eq!(path, PathBuf::from("/var/log/a=b.log"));
        assert_matches!(
            AllowList::parse_entry("nopath"),
            Err(AllowListError::Malformed(_))
        );
        assert_matches!(AllowList::parse_entry("=/x"), Err(AllowListError::Malformed(_)));
    }

    #[test]
    fn names_are_sorted() {
        let list = AllowList::from_pairs([("zeta", "/z"), ("alpha", "/a")]).unwrap();
        assert_eq!(list.names().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }
}
