//! Read-only source checkouts.
//!
//! Cloning is a collaborator, not core: inference runs stateless against a
//! caller-owned checkout, and the build-definition repository is read through
//! the same interface. Each call gets a fresh temp directory so concurrent
//! requests cannot cross-contaminate.

use async_trait::async_trait;
use axoprocess::Cmd;
use std::collections::HashMap;
use std::path::Path;
use temp_dir::TempDir;

use crate::errors::{RebuildError, RebuildResult};

/// A read-only view of one checkout.
pub trait RepoCheckout: Send + Sync {
    /// The commit the checkout is at.
    fn head_commit(&self) -> &str;
    /// Read a file relative to the checkout root.
    fn read_file(&self, path: &str) -> RebuildResult<Vec<u8>>;
    /// Resolve the first ref candidate that exists to a commit hash.
    fn resolve_ref(&self, candidates: &[String]) -> Option<String>;
}

/// Produces fresh checkouts on demand.
#[async_trait]
pub trait RepoCloner: Send + Sync {
    /// Shallow-clone `repo`, optionally at `git_ref`.
    async fn checkout(
        &self,
        repo: &str,
        git_ref: Option<&str>,
    ) -> RebuildResult<Box<dyn RepoCheckout>>;
}

/// Cloner shelling out to the git CLI into a temp directory.
#[derive(Debug, Default)]
pub struct GitCliCloner;

struct GitCheckout {
    dir: TempDir,
    head: String,
}

fn run_git(root: &Path, summary: &str, args: &[&str]) -> RebuildResult<String> {
    let mut cmd = Cmd::new("git", summary);
    cmd.current_dir(root);
    for arg in args {
        cmd.arg(arg);
    }
    let output = cmd.output()?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

#[async_trait]
impl RepoCloner for GitCliCloner {
    async fn checkout(
        &self,
        repo: &str,
        git_ref: Option<&str>,
    ) -> RebuildResult<Box<dyn RepoCheckout>> {
        let repo = repo.to_owned();
        let git_ref = git_ref.map(|r| r.to_owned());
        // the git CLI blocks; keep it off the async workers
        let (dir, head) = tokio::task::spawn_blocking(
            move || -> RebuildResult<(TempDir, String)> {
                let dir = TempDir::new().map_err(|err| {
                    RebuildError::internal(format!("create checkout dir: {err}"))
                })?;
                let mut clone = Cmd::new("git", "clone the upstream source");
                clone.current_dir(dir.path()).arg("clone").arg("--quiet");
                if git_ref.is_none() {
                    clone.arg("--depth").arg("1");
                }
                clone.arg(&repo).arg(".");
                clone.stdout_to_stderr();
                clone.run()?;
                if let Some(git_ref) = &git_ref {
                    let mut pin = Cmd::new("git", "check out the pinned ref");
                    pin.current_dir(dir.path())
                        .arg("checkout")
                        .arg("--quiet")
                        .arg(git_ref);
                    pin.stdout_to_stderr();
                    pin.run()?;
                }
                let head = run_git(dir.path(), "resolve the checkout head", &[
                    "rev-parse", "HEAD",
                ])?;
                Ok((dir, head))
            },
        )
        .await
        .map_err(|err| RebuildError::internal(format!("clone task: {err}")))??;
        Ok(Box::new(GitCheckout { dir, head }))
    }
}

impl RepoCheckout for GitCheckout {
    fn head_commit(&self) -> &str {
        &self.head
    }

    fn read_file(&self, path: &str) -> RebuildResult<Vec<u8>> {
        let full = self.dir.path().join(path);
        match std::fs::read(&full) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                RebuildError::not_found(format!("checkout file {path}")),
            ),
            Err(err) => Err(err.into()),
        }
    }

    fn resolve_ref(&self, candidates: &[String]) -> Option<String> {
        for candidate in candidates {
            let spec = format!("{candidate}^{{commit}}");
            let mut probe = Cmd::new("git", "probe a release tag");
            probe
                .current_dir(self.dir.path())
                .arg("rev-parse")
                .arg("--verify")
                .arg("--quiet")
                .arg(&spec);
            // absent tags are the common case, not an error
            probe.check(false);
            if let Ok(output) = probe.output() {
                if output.status.success() {
                    let commit = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                    if !commit.is_empty() {
                        return Some(commit);
                    }
                }
            }
        }
        None
    }
}

/// In-memory checkout for tests and canned fixtures.
#[derive(Debug, Clone, Default)]
pub struct MemCheckout {
    /// Commit hash the checkout pretends to be at
    pub head: String,
    /// path → contents
    pub files: HashMap<String, Vec<u8>>,
    /// ref name → commit hash
    pub refs: HashMap<String, String>,
}

impl RepoCheckout for MemCheckout {
    fn head_commit(&self) -> &str {
        &self.head
    }

    fn read_file(&self, path: &str) -> RebuildResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("checkout file {path}")))
    }

    fn resolve_ref(&self, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .find_map(|candidate| self.refs.get(candidate).cloned())
    }
}

/// Cloner returning canned [`MemCheckout`][]s keyed by repo URL.
#[derive(Debug, Default)]
pub struct MemCloner {
    /// repo URL → checkout
    pub repos: HashMap<String, MemCheckout>,
}

#[async_trait]
impl RepoCloner for MemCloner {
    async fn checkout(
        &self,
        repo: &str,
        _git_ref: Option<&str>,
    ) -> RebuildResult<Box<dyn RepoCheckout>> {
        self.repos
            .get(repo)
            .cloned()
            .map(|checkout| Box::new(checkout) as Box<dyn RepoCheckout>)
            .ok_or_else(|| RebuildError::not_found(format!("repository {repo}")))
    }
}
