use std::fmt;
use std::path::Path;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Closed classification of git backend failures.
///
/// Classification happens exactly once, at the point where a git process
/// exits non-zero; everything downstream matches on kinds, never on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    /// The directory is not (or no longer) a usable repository.
    NotARepository,
    /// Histories diverged; the update cannot be applied by fast-forward.
    NonFastForward,
    /// The remote rejected or required credentials.
    Unauthorized,
    /// A branch with the requested name already exists.
    BranchExists,
    /// Anything else; the raw message is carried along.
    Other,
}

/// Failure from one git invocation, classified and carrying the raw text.
#[derive(Debug, Clone)]
pub struct GitError {
    pub kind: GitErrorKind,
    message: String,
}

impl GitError {
    fn new(kind: GitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_stderr(stderr: &str, status: Option<i32>) -> Self {
        let message = stderr.trim();
        let message = if message.is_empty() {
            match status {
                Some(code) => format!("git exited with status {}", code),
                None => "git terminated by signal".to_string(),
            }
        } else {
            message.to_string()
        };

        Self::new(classify_git_failure(&message), message)
    }
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First line carries the interesting part of multi-line git output.
        let line = self.message.lines().next().unwrap_or(&self.message);
        write!(f, "{}", line.trim_start_matches("fatal: "))
    }
}

impl std::error::Error for GitError {}

/// Map git's stderr onto the closed error taxonomy.
///
/// Both "authentication required" and "authorization failed" shapes of
/// transport output collapse into [`GitErrorKind::Unauthorized`]; the caller
/// never needs to distinguish them.
fn classify_git_failure(stderr: &str) -> GitErrorKind {
    let lowered = stderr.to_lowercase();

    if lowered.contains("not a git repository") {
        return GitErrorKind::NotARepository;
    }
    if lowered.contains("non-fast-forward") || lowered.contains("not possible to fast-forward") {
        return GitErrorKind::NonFastForward;
    }
    if lowered.contains("authentication failed")
        || lowered.contains("could not read username")
        || lowered.contains("could not read password")
        || lowered.contains("permission denied (publickey)")
        || lowered.contains("returned error: 401")
        || lowered.contains("returned error: 403")
        || lowered.contains("invalid username or password")
    {
        return GitErrorKind::Unauthorized;
    }
    if lowered.contains("already exists") && lowered.contains("branch") {
        return GitErrorKind::BranchExists;
    }

    GitErrorKind::Other
}

/// Head of a repository: current branch name and commit hash.
#[derive(Debug, Clone)]
pub struct Head {
    /// Short branch name, or `HEAD` when detached.
    pub branch: String,
    pub commit: String,
}

/// Git operations backend.
///
/// Every method shells out to the `git` binary; no wire protocol or object
/// model lives here. Methods are independent and safe to call from any
/// number of concurrent tasks, each against its own repository directory.
#[derive(Debug, Clone, Default)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    /// Run git with `args` inside `dir`, returning stdout on success.
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!("git {} (in {})", args.join(" "), dir.display());

        let output = AsyncCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| GitError::new(GitErrorKind::Other, format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::from_stderr(&stderr, output.status.code()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Verify that `path` holds an openable repository.
    ///
    /// A missing or corrupt `.git` yields [`GitErrorKind::NotARepository`];
    /// the caller decides whether that means `absent` or `broken`.
    pub async fn verify_repository(&self, path: &Path) -> Result<(), GitError> {
        if !path.join(".git").exists() {
            return Err(GitError::new(
                GitErrorKind::NotARepository,
                format!("not a git repository: {}", path.display()),
            ));
        }

        self.run(path, &["rev-parse", "--git-dir"]).await.map(|_| ())
    }

    /// Clone `url` into `path` with full submodule recursion.
    ///
    /// Runs from the process working directory, so a relative `path` lands
    /// exactly where the repository descriptor says.
    pub async fn clone(&self, url: &str, path: &Path) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    GitError::new(
                        GitErrorKind::Other,
                        format!("failed to create {}: {}", parent.display(), e),
                    )
                })?;
            }
        }

        let target = path.to_string_lossy().into_owned();
        self.run(Path::new("."), &["clone", "--recurse-submodules", url, &target])
            .await
            .map(|_| ())
    }

    /// Whether the working tree has no uncommitted modifications.
    pub async fn is_clean(&self, path: &Path) -> Result<bool, GitError> {
        let stdout = self.run(path, &["status", "--porcelain"]).await?;
        Ok(stdout.trim().is_empty())
    }

    /// Fast-forward pull with submodule recursion.
    ///
    /// "Already up to date" exits zero and is indistinguishable from any
    /// other success here; divergence classifies as
    /// [`GitErrorKind::NonFastForward`].
    pub async fn pull(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["pull", "--ff-only", "--recurse-submodules"])
            .await
            .map(|_| ())
    }

    /// Fast-forward pull without submodule recursion, used inside submodules.
    pub async fn pull_plain(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["pull", "--ff-only"]).await.map(|_| ())
    }

    /// Push the default remote with default options. Never forces.
    pub async fn push(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["push"]).await.map(|_| ())
    }

    /// Fetch every remote ref into the local ref namespace.
    pub async fn fetch_all_refs(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["fetch", "origin", "refs/*:refs/*"])
            .await
            .map(|_| ())
    }

    /// Current branch and commit hash of `HEAD`.
    pub async fn head(&self, path: &Path) -> Result<Head, GitError> {
        let branch = self
            .run(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string();
        let commit = self.run(path, &["rev-parse", "HEAD"]).await?.trim().to_string();

        Ok(Head { branch, commit })
    }

    /// Short name of the current branch, `None` when `HEAD` is detached.
    pub async fn current_branch(&self, path: &Path) -> Result<Option<String>, GitError> {
        match self.run(path, &["symbolic-ref", "--short", "-q", "HEAD"]).await {
            Ok(stdout) => {
                let branch = stdout.trim().to_string();
                Ok((!branch.is_empty()).then_some(branch))
            }
            // symbolic-ref -q exits 1 without any output on a detached HEAD
            Err(e) if e.message.starts_with("git exited") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List `(ref name, hash)` pairs advertised by `origin`.
    pub async fn list_remote_refs(&self, path: &Path) -> Result<Vec<(String, String)>, GitError> {
        let stdout = self.run(path, &["ls-remote", "origin"]).await?;
        Ok(parse_remote_refs(&stdout))
    }

    /// Branch that the remote's symbolic `HEAD` points at (its default branch).
    pub async fn remote_head_branch(&self, path: &Path) -> Result<Option<String>, GitError> {
        let stdout = self
            .run(path, &["ls-remote", "--symref", "origin", "HEAD"])
            .await?;
        Ok(parse_symref_head(&stdout))
    }

    /// Bind the repository's commit identity to the account.
    pub async fn set_user_config(
        &self,
        path: &Path,
        name: &str,
        email: &str,
    ) -> Result<(), GitError> {
        self.run(path, &["config", "user.name", name]).await?;
        self.run(path, &["config", "user.email", email]).await?;
        Ok(())
    }

    /// Whether a remote with this name is configured.
    pub async fn has_remote(&self, path: &Path, name: &str) -> bool {
        self.run(path, &["remote", "get-url", name]).await.is_ok()
    }

    /// Add a named remote. Fails if the name is taken; callers check first.
    pub async fn add_remote(&self, path: &Path, name: &str, url: &str) -> Result<(), GitError> {
        self.run(path, &["remote", "add", name, url]).await.map(|_| ())
    }

    /// Create a local branch tracking `origin/<branch>`.
    pub async fn create_tracking_branch(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let upstream = format!("origin/{}", branch);
        self.run(path, &["branch", "--track", branch, &upstream])
            .await
            .map(|_| ())
    }

    pub async fn checkout(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        self.run(path, &["checkout", branch]).await.map(|_| ())
    }

    /// Relative paths of the repository's submodules, empty when none.
    pub async fn submodule_paths(&self, path: &Path) -> Result<Vec<String>, GitError> {
        if !path.join(".gitmodules").exists() {
            return Ok(Vec::new());
        }

        let stdout = self
            .run(
                path,
                &[
                    "config",
                    "--file",
                    ".gitmodules",
                    "--get-regexp",
                    r"submodule\..*\.path",
                ],
            )
            .await?;
        Ok(parse_submodule_paths(&stdout))
    }
}

/// Parse `git ls-remote` output into `(ref name, hash)` pairs.
fn parse_remote_refs(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (hash, name) = line.split_once('\t')?;
            Some((name.trim().to_string(), hash.trim().to_string()))
        })
        .collect()
}

/// Extract the branch behind `ref: refs/heads/<branch>\tHEAD` from
/// `git ls-remote --symref origin HEAD`.
fn parse_symref_head(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?.trim();
        let target = rest.split_whitespace().next()?;
        target.strip_prefix("refs/heads/").map(str::to_string)
    })
}

/// Parse `git config --file .gitmodules --get-regexp path` output.
fn parse_submodule_paths(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            key.ends_with(".path").then(|| value.trim().to_string())
        })
        .collect()
}
