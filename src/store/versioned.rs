//! Versioned store built on an external content-addressable commit engine
//!
//! Fetched app trees are committed to a branch derived from the target's
//! realm, tags and platform, and the resulting `branch@commit` reference is
//! written back into the target descriptor so later runs (and downstream
//! consumers) can find the exact tree again.

use crate::{
    errors::StoreError,
    store::whiteout,
    target::Target,
};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;

/// Wall-clock budget for copying commits between repositories
const COPY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The commit engine a [VersionedStore] drives
///
/// [OstreeEngine] is the production implementation; tests substitute an
/// in-memory one.
pub trait VersionedRepositoryEngine {
    /// Whether `repo` holds an initialized repository
    fn initialized(&self, repo: &Path) -> bool;

    /// Create an empty repository at `repo`
    fn init(
        &self,
        repo: &Path,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Commit `tree` onto `branch`, returning the new commit hash
    fn commit(
        &self,
        repo: &Path,
        tree: &Path,
        branch: &str,
    ) -> impl std::future::Future<Output = Result<String, StoreError>> + Send;

    /// Check a commit out into `dest`
    fn checkout(
        &self,
        repo: &Path,
        commit: &str,
        dest: &Path,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Copy a commit from `src_repo` into `dest_repo`
    fn pull_local(
        &self,
        src_repo: &Path,
        dest_repo: &Path,
        commit: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Resolve a branch or commit reference, `None` if it is unknown
    fn resolve(
        &self,
        repo: &Path,
        reference: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;
}

/// Engine backed by the `ostree` command-line tool
#[derive(Clone, Debug, Default)]
pub struct OstreeEngine;

impl OstreeEngine {
    async fn run(&self, repo: &Path, args: &[&str]) -> Result<String, StoreError> {
        let output = Command::new("ostree")
            .arg(format!("--repo={}", repo.display()))
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(StoreError::Engine(format!(
                "ostree {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl VersionedRepositoryEngine for OstreeEngine {
    fn initialized(&self, repo: &Path) -> bool {
        repo.join("config").is_file()
    }

    async fn init(&self, repo: &Path) -> Result<(), StoreError> {
        std::fs::create_dir_all(repo)?;
        self.run(repo, &["init", "--mode=archive"]).await?;
        Ok(())
    }

    async fn commit(&self, repo: &Path, tree: &Path, branch: &str) -> Result<String, StoreError> {
        let tree = format!("--tree=dir={}", tree.display());
        let branch = format!("--branch={}", branch);
        self.run(repo, &["commit", &branch, &tree, "--generate-sizes"])
            .await
    }

    async fn checkout(&self, repo: &Path, commit: &str, dest: &Path) -> Result<(), StoreError> {
        let dest = dest.display().to_string();
        self.run(repo, &["checkout", "--user-mode", "--union", commit, &dest])
            .await?;
        Ok(())
    }

    async fn pull_local(
        &self,
        src_repo: &Path,
        dest_repo: &Path,
        commit: &str,
    ) -> Result<(), StoreError> {
        let src = src_repo.display().to_string();
        self.run(dest_repo, &["pull-local", &src, commit]).await?;
        Ok(())
    }

    async fn resolve(&self, repo: &Path, reference: &str) -> Result<Option<String>, StoreError> {
        match self.run(repo, &["rev-parse", reference]).await {
            Ok(hash) => Ok(Some(hash)),
            Err(StoreError::Engine(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Commits fetched app trees into a versioned repository
pub struct VersionedStore<E> {
    engine: E,
    repo_dir: PathBuf,
    realm: String,
}

impl<E: VersionedRepositoryEngine> VersionedStore<E> {
    pub fn new(engine: E, repo_dir: &Path, realm: &str) -> Self {
        VersionedStore {
            engine,
            repo_dir: repo_dir.to_owned(),
            realm: realm.to_owned(),
        }
    }

    /// The branch a target's tree is committed onto
    pub fn branch(&self, target: &Target) -> String {
        format!(
            "{}/{}/{}",
            self.realm,
            target.joined_tags(),
            target.platform()
        )
    }

    /// Commit a fetched tree and record the reference on the target
    ///
    /// Special files in the tree are moved into the whiteout sidecar first.
    /// On success the target's bookkeeping fields are updated in place and
    /// `(branch, commit)` is returned.
    pub async fn store(
        &self,
        target: &mut Target,
        tree: &Path,
    ) -> Result<(String, String), StoreError> {
        if !self.engine.initialized(&self.repo_dir) {
            self.engine.init(&self.repo_dir).await?;
        }
        whiteout::strip_tree(tree)?;
        let branch = self.branch(target);
        let commit = self.engine.commit(&self.repo_dir, tree, &branch).await?;
        log::info!("{}: committed {} onto {}", target.name, commit, branch);
        target.custom.compose_apps_branch = Some(branch.clone());
        target.custom.compose_apps_hash = Some(format!("{}@{}", branch, commit));
        Ok((branch, commit))
    }

    /// Check a target's recorded commit out into `dest` and replay its
    /// whiteout sidecar
    pub async fn checkout(&self, target: &Target, dest: &Path) -> Result<(), StoreError> {
        let commit = target
            .store_commit()
            .ok_or_else(|| StoreError::MissingStoreReference(target.name.clone()))?;
        if !self.engine.initialized(&self.repo_dir) {
            return Err(StoreError::NotInitialized(self.repo_dir.clone()));
        }
        std::fs::create_dir_all(dest)?;
        self.engine.checkout(&self.repo_dir, commit, dest).await?;
        whiteout::restore_tree(dest)?;
        Ok(())
    }

    /// Copy a target's recorded commit into another repository
    pub async fn copy_to(&self, target: &Target, dest_repo: &Path) -> Result<(), StoreError> {
        self.copy_with_timeout(target, dest_repo, COPY_TIMEOUT).await
    }

    async fn copy_with_timeout(
        &self,
        target: &Target,
        dest_repo: &Path,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let commit = target
            .store_commit()
            .ok_or_else(|| StoreError::MissingStoreReference(target.name.clone()))?;
        if !self.engine.initialized(&self.repo_dir) {
            return Err(StoreError::NotInitialized(self.repo_dir.clone()));
        }
        if !self.engine.initialized(dest_repo) {
            self.engine.init(dest_repo).await?;
        }
        match tokio::time::timeout(
            timeout,
            self.engine.pull_local(&self.repo_dir, dest_repo, commit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Whether a target's tree is already committed to this repository
    ///
    /// A shortlisted target never counts as stored: its committed tree is a
    /// subset of the full app set, and treating it as present would let a
    /// partial tree satisfy a later full fetch.
    pub async fn exists(&self, target: &Target) -> Result<bool, StoreError> {
        if target.shortlist().is_some() {
            log::debug!("{}: shortlisted, treating as not stored", target.name);
            return Ok(false);
        }
        if !self.engine.initialized(&self.repo_dir) {
            return Ok(false);
        }
        let commit = match target.store_commit() {
            Some(commit) => commit,
            None => return Ok(false),
        };
        Ok(self.engine.resolve(&self.repo_dir, commit).await?.is_some())
    }
}
