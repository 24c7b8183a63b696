// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Paths scheduled for deletion before a rebuild

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapKind {
    File,
    /// Removed recursively
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapEntry {
    pub path: PathBuf,
    pub kind: ReapKind,
}

/// Ordered, de-duplicated set of files and directories to delete.
#[derive(Debug, Clone, Default)]
pub struct ReapSet {
    entries: Vec<ReapEntry>,
}

impl ReapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>) {
        self.add(path.into(), ReapKind::File);
    }

    pub fn add_directory(&mut self, path: impl Into<PathBuf>) {
        self.add(path.into(), ReapKind::Directory);
    }

    fn add(&mut self, path: PathBuf, kind: ReapKind) {
        if !self.entries.iter().any(|e| e.path == path) {
            self.entries.push(ReapEntry { path, kind });
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReapEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_paths_are_ignored() {
        let mut set = ReapSet::new();
        set.add_directory("/tmp/build");
        set.add_file("/tmp/build");
        set.add_file("/src/configure");
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next().map(|e| e.kind), Some(ReapKind::Directory));
        assert!(set.contains(Path::new("/src/configure")));
    }
}
