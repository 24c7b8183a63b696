// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{ReapError, ReaperAdapter};
use async_trait::async_trait;
use kiln_core::{ReapKind, ReapSet};
use std::io::ErrorKind;

/// Reaper that deletes from the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct FsReaper;

impl FsReaper {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReaperAdapter for FsReaper {
    async fn reap(&self, set: &ReapSet) -> Result<usize, ReapError> {
        let mut removed = 0;
        for entry in set.iter() {
            let result = match entry.kind {
                ReapKind::File => tokio::fs::remove_file(&entry.path).await,
                ReapKind::Directory => tokio::fs::remove_dir_all(&entry.path).await,
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::trace!(path = %entry.path.display(), "already gone");
                }
                Err(source) => {
                    return Err(ReapError::Remove {
                        path: entry.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("configure");
        let tree = dir.path().join("build");
        std::fs::write(&file, "#!/bin/sh").unwrap();
        std::fs::create_dir_all(tree.join("obj")).unwrap();
        std::fs::write(tree.join("obj/a.o"), "").unwrap();

        let mut set = ReapSet::new();
        set.add_file(&file);
        set.add_directory(&tree);
        set.add_file(dir.path().join("missing"));

        let removed = FsReaper::new().reap(&set).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn removing_directory_as_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = ReapSet::new();
        set.add_file(dir.path());
        let err = FsReaper::new().reap(&set).await.unwrap_err();
        assert!(matches!(err, ReapError::Remove { .. }));
    }
}
