//! Git preflight via libgit2.
//!
//! Before an attempt starts, the job's working directory is checked for an
//! index with unresolved merge conflicts. Running tests on a half-merged tree
//! only produces noise, so such an attempt is recorded as a `GitConflict`
//! without spawning the runner.

use std::path::Path;

use git2::{ErrorCode, Repository};

use crate::error::Result;

/// Read-only view of the repository containing a working directory.
pub struct GitInspector {
    repo: Repository,
}

impl GitInspector {
    /// Find the repository enclosing `path`. `Ok(None)` if there isn't one.
    pub fn discover(path: &Path) -> Result<Option<Self>> {
        match Repository::discover(path) {
            Ok(repo) => Ok(Some(Self { repo })),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Paths with unresolved conflicts in the index, sorted.
    pub fn conflicted_paths(&self) -> Result<Vec<String>> {
        let index = self.repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                paths.push(String::from_utf8_lossy(&entry.path).into_owned());
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Short name of the checked-out branch, if HEAD points at one.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        head.shorthand().map(str::to_string)
    }
}

/// Conflicted paths for the repository enclosing `dir`; empty outside a repository.
pub fn preflight(dir: &Path) -> Result<Vec<String>> {
    match GitInspector::discover(dir)? {
        Some(inspector) => inspector.conflicted_paths(),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Oid, Signature};
    use tempfile::TempDir;

    fn commit_file(
        repo: &Repository,
        update_ref: Option<&str>,
        content: &str,
        parents: &[&git2::Commit<'_>],
    ) -> Oid {
        let sig = Signature::now("Runlane Test", "test@localhost").unwrap();
        let blob = repo.blob(content.as_bytes()).unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("app.txt", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        repo.commit(update_ref, &sig, &sig, content.trim(), &tree, parents)
            .unwrap()
    }

    fn clean_repo() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        commit_file(&repo, Some("HEAD"), "base\n", &[]);
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
            .unwrap();
        (tmp, repo)
    }

    fn conflicted_repo() -> TempDir {
        let (tmp, repo) = clean_repo();
        let base = repo.head().unwrap().peel_to_commit().unwrap();

        let feature = commit_file(&repo, Some("refs/heads/feature"), "feature\n", &[&base]);
        commit_file(&repo, Some("HEAD"), "main\n", &[&base]);
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
            .unwrap();

        let theirs = repo.find_annotated_commit(feature).unwrap();
        repo.merge(&[&theirs], None, None).unwrap();
        tmp
    }

    #[test]
    fn outside_a_repository_is_clean() {
        let tmp = TempDir::new().unwrap();
        assert!(GitInspector::discover(tmp.path()).unwrap().is_none());
        assert!(preflight(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn clean_repository_has_no_conflicts() {
        let (tmp, _repo) = clean_repo();
        let inspector = GitInspector::discover(tmp.path()).unwrap().unwrap();
        assert!(inspector.conflicted_paths().unwrap().is_empty());
        assert!(inspector.current_branch().is_some());
    }

    #[test]
    fn merge_conflict_is_reported() {
        let tmp = conflicted_repo();
        assert_eq!(preflight(tmp.path()).unwrap(), vec!["app.txt".to_string()]);
    }

    #[test]
    fn subdirectory_discovers_parent_repository() {
        let tmp = conflicted_repo();
        let nested = tmp.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        assert_eq!(preflight(&nested).unwrap().len(), 1);
    }
}
