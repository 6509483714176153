//! Per-repository operations: pull, push, status.
//!
//! Each operation is a function of (configuration, repository descriptor)
//! that appends exactly one [`Outcome`] to the report on every code path,
//! including internal errors. The orchestrator in [`crate::sync`] never
//! inspects results directly.

use console::style;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::config::{Configuration, Repo};
use crate::git::{GitClient, GitError, GitErrorKind};
use crate::report::{Outcome, Report};

/// The closed set of repository operations the orchestrator can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Pull,
    Push,
    Status,
}

impl Operation {
    /// Verb shown on the live progress line.
    pub fn progress_label(&self) -> &'static str {
        match self {
            Operation::Pull => "Pulling",
            Operation::Push => "Pushing",
            Operation::Status => "Checking",
        }
    }

    /// Run this operation for one repository, recording exactly one outcome.
    pub async fn run(&self, config: &Configuration, repo: &Repo, report: &Report) {
        match self {
            Operation::Pull => run_pull(config, repo, report).await,
            Operation::Push => run_push(config, repo, report).await,
            Operation::Status => run_status(config, repo, report).await,
        }
    }
}

/// Pull one repository: clone when absent, fast-forward otherwise, then
/// converge submodules, fetch all refs, bind identity, and record the
/// upstream remote for forks.
async fn run_pull(config: &Configuration, repo: &Repo, report: &Report) {
    let git = GitClient::new();
    let dir = Path::new(&repo.dir);

    if dir.exists() {
        if let Err(e) = git.verify_repository(dir).await {
            match e.kind {
                GitErrorKind::NotARepository => report.append(&repo.dir, Outcome::Broken),
                _ => report.append_error(&repo.dir, e),
            }
            return;
        }

        match git.is_clean(dir).await {
            Ok(true) => {}
            Ok(false) => {
                // never stash or commit on the user's behalf
                report.append_error(&repo.dir, "worktree is not clean");
                return;
            }
            Err(e) => {
                report.append_error(&repo.dir, e);
                return;
            }
        }

        if let Err(e) = git.pull(dir).await {
            match e.kind {
                GitErrorKind::NonFastForward => {
                    report.append(&repo.dir, Outcome::NonFastForward)
                }
                _ => report.append_error(&repo.dir, e),
            }
            return;
        }
    } else {
        debug!("cloning {} into {}", repo.url, repo.dir);
        if let Err(e) = git.clone(&repo.url, dir).await {
            report.append_error(&repo.dir, e);
            return;
        }
    }

    if let Err(e) = converge_submodules(&git, dir).await {
        report.append_error(&repo.dir, e);
        return;
    }

    if let Err(e) = git.fetch_all_refs(dir).await {
        report.append_error(&repo.dir, e);
        return;
    }

    if let Err(e) = git.set_user_config(dir, &config.full_name, &config.email).await {
        report.append_error(&repo.dir, e);
        return;
    }

    if !repo.parent.is_empty() && !git.has_remote(dir, "upstream").await {
        if let Err(e) = git.add_remote(dir, "upstream", &repo.parent).await {
            report.append_error(&repo.dir, e);
            return;
        }
    }

    report.append(&repo.dir, Outcome::Ok);
}

/// Failure in one submodule, reported against the parent repository.
#[derive(Debug)]
struct SubmoduleError {
    path: String,
    source: GitError,
}

impl fmt::Display for SubmoduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submodule {}: {}", self.path, self.source)
    }
}

/// Bring every submodule (and submodules of submodules) to a tracking,
/// up-to-date state.
///
/// A submodule checked out detached is bound to the remote's default
/// branch: discover it from the remote symbolic `HEAD`, fetch all refs,
/// create the tracking branch (tolerating one that already exists) and
/// check it out. Then pull.
async fn converge_submodules(git: &GitClient, root: &Path) -> Result<(), SubmoduleError> {
    let tag = |path: &str| {
        let path = path.to_string();
        move |source: GitError| SubmoduleError { path, source }
    };

    let mut queue: VecDeque<String> = git
        .submodule_paths(root)
        .await
        .map_err(tag("."))?
        .into_iter()
        .collect();

    while let Some(rel) = queue.pop_front() {
        let path = root.join(&rel);

        if git.current_branch(&path).await.map_err(tag(&rel))?.is_none() {
            if let Some(branch) = git.remote_head_branch(&path).await.map_err(tag(&rel))? {
                debug!("submodule {}: tracking {}", rel, branch);
                git.fetch_all_refs(&path).await.map_err(tag(&rel))?;

                match git.create_tracking_branch(&path, &branch).await {
                    Ok(()) => {}
                    Err(e) if e.kind == GitErrorKind::BranchExists => {}
                    Err(e) => return Err(tag(&rel)(e)),
                }

                git.checkout(&path, &branch).await.map_err(tag(&rel))?;
            }
        }

        git.pull_plain(&path).await.map_err(tag(&rel))?;

        for nested in git.submodule_paths(&path).await.map_err(tag(&rel))? {
            queue.push_back(format!("{}/{}", rel, nested));
        }
    }

    Ok(())
}

/// Push one repository with default options.
async fn run_push(_config: &Configuration, repo: &Repo, report: &Report) {
    let git = GitClient::new();
    let dir = Path::new(&repo.dir);

    if let Err(e) = git.verify_repository(dir).await {
        match e.kind {
            // push only cares whether there is something to push
            GitErrorKind::NotARepository => report.append(&repo.dir, Outcome::Absent),
            _ => report.append_error(&repo.dir, e),
        }
        return;
    }

    match git.push(dir).await {
        Ok(()) => report.append(&repo.dir, Outcome::Ok),
        Err(e) => match e.kind {
            GitErrorKind::NonFastForward => report.append(&repo.dir, Outcome::NonFastForward),
            GitErrorKind::Unauthorized => report.append(&repo.dir, Outcome::Unauthorized),
            _ => report.append_error(&repo.dir, e),
        },
    }
}

/// Compose the status line for one repository: current branch, working-tree
/// cleanliness, and freshness against the remote's same-named branch.
async fn run_status(_config: &Configuration, repo: &Repo, report: &Report) {
    let git = GitClient::new();
    let dir = Path::new(&repo.dir);

    if !dir.exists() {
        report.append(&repo.dir, Outcome::Absent);
        return;
    }

    if let Err(e) = git.verify_repository(dir).await {
        match e.kind {
            GitErrorKind::NotARepository => report.append(&repo.dir, Outcome::Broken),
            _ => report.append_error(&repo.dir, e),
        }
        return;
    }

    let head = match git.head(dir).await {
        Ok(head) => head,
        Err(e) => {
            report.append_error(&repo.dir, e);
            return;
        }
    };

    let mut line = if head.branch == repo.branch {
        style(&head.branch).green().to_string()
    } else {
        style(&head.branch).red().to_string()
    };

    match git.is_clean(dir).await {
        Ok(true) => {
            line.push('\t');
            line.push_str(&style("clean").green().to_string());
        }
        Ok(false) => {
            line.push('\t');
            line.push_str(&style("dirty").red().to_string());
        }
        Err(e) => {
            report.append_error(&repo.dir, e);
            return;
        }
    }

    let remote_refs = match git.list_remote_refs(dir).await {
        Ok(refs) => refs,
        Err(e) => {
            report.append_error(&repo.dir, e);
            return;
        }
    };

    // Freshness is omitted entirely when the branch is gone upstream.
    let wanted = format!("refs/heads/{}", repo.branch);
    if let Some((_, hash)) = remote_refs.iter().find(|(name, _)| *name == wanted) {
        line.push('\t');
        if *hash == head.commit {
            line.push_str(&style("latest").green().to_string());
        } else {
            line.push_str(&style("stale").red().to_string());
        }
    }

    report.append(&repo.dir, Outcome::Status(line));
}

/// Flag directory entries under the base directory that no configured
/// repository claims.
///
/// Runs sequentially after the concurrent status pass; results land in the
/// same report so the final table stays sorted as one unit.
pub fn scan_untracked(config: &Configuration, report: &Report) -> anyhow::Result<()> {
    let base = Path::new(&config.base_dir);
    let mut entries = list_entries(base)?;

    if config.subdirs {
        // one level deeper: owner directories hold the actual mirrors
        for entry in entries.clone() {
            entries.extend(list_entries(Path::new(&entry))?);
        }
    }

    for entry in entries {
        if !is_repo_dir(&entry, &config.repos) {
            report.append(entry, Outcome::Untracked);
        }
    }

    Ok(())
}

/// Directories directly under `dir`, as `base/name` strings. Plain files
/// (the configuration file among them) are never mirror candidates; a
/// missing base directory simply yields nothing to scan.
fn list_entries(dir: &Path) -> anyhow::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        entries.push(format!(
            "{}/{}",
            dir.display(),
            entry.file_name().to_string_lossy()
        ));
    }
    entries.sort();
    Ok(entries)
}

/// Whether `path` is a configured repository directory or a parent of one.
fn is_repo_dir(path: &str, repos: &[Repo]) -> bool {
    let prefix = format!("{}/", path);
    repos
        .iter()
        .any(|repo| format!("{}/", repo.dir).starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Report;
    use console::strip_ansi_codes;
    use tempfile::TempDir;

    fn repo(dir: &str) -> Repo {
        Repo {
            url: format!("https://host/u/{}", dir),
            dir: dir.to_string(),
            branch: "main".to_string(),
            parent: String::new(),
        }
    }

    #[test]
    fn test_is_repo_dir_exact_and_parent_match() {
        let repos = vec![repo("base/owner/project")];

        assert!(is_repo_dir("base/owner/project", &repos));
        // the owner directory is a parent of a configured repo
        assert!(is_repo_dir("base/owner", &repos));
        assert!(!is_repo_dir("base/other", &repos));
        // prefix match is on path components, not raw strings
        assert!(!is_repo_dir("base/own", &repos));
    }

    #[test]
    fn test_scan_untracked_flags_strangers() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("mirror");
        std::fs::create_dir_all(base.join("tracked")).unwrap();
        std::fs::create_dir_all(base.join("stray")).unwrap();
        // plain files next to the mirrors are not untracked repositories
        std::fs::write(base.join("notes.txt"), "scratch").unwrap();

        let config = Configuration {
            base_dir: base.display().to_string(),
            repos: vec![repo(&format!("{}/tracked", base.display()))],
            ..Configuration::default()
        };

        let report = Report::new();
        scan_untracked(&config, &report).unwrap();

        let rendered = report.render().unwrap();
        let plain = strip_ansi_codes(&rendered).to_string();
        assert!(plain.contains("stray"));
        assert!(plain.contains("untracked"));
        assert!(!plain.contains("tracked/"));
        assert_eq!(report.len(), 1);
    }

    #[test]
    fn test_scan_untracked_descends_into_owner_dirs() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("mirror");
        std::fs::create_dir_all(base.join("owner").join("project")).unwrap();
        std::fs::create_dir_all(base.join("owner").join("leftover")).unwrap();

        let config = Configuration {
            base_dir: base.display().to_string(),
            subdirs: true,
            repos: vec![repo(&format!("{}/owner/project", base.display()))],
            ..Configuration::default()
        };

        let report = Report::new();
        scan_untracked(&config, &report).unwrap();

        let rendered = report.render().unwrap();
        let plain = strip_ansi_codes(&rendered).to_string();
        assert!(plain.contains("owner/leftover"));
        assert_eq!(report.len(), 1);
    }

    #[test]
    fn test_scan_untracked_missing_base_dir_is_empty() {
        let config = Configuration {
            base_dir: "/nonexistent/mirror/root".to_string(),
            ..Configuration::default()
        };

        let report = Report::new();
        scan_untracked(&config, &report).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_progress_labels() {
        assert_eq!(Operation::Pull.progress_label(), "Pulling");
        assert_eq!(Operation::Push.progress_label(), "Pushing");
        assert_eq!(Operation::Status.progress_label(), "Checking");
    }

    #[tokio::test]
    async fn test_pull_absent_url_reports_single_error() {
        let temp = TempDir::new().unwrap();
        let config = Configuration::default();
        let target = repo(&format!("{}/missing", temp.path().display()));

        let report = Report::new();
        Operation::Pull.run(&config, &target, &report).await;

        // clone of an unreachable URL fails, but exactly one outcome lands
        assert_eq!(report.len(), 1);
    }
}
