//! Shared fixtures: local git remotes the operations can run against
//! without touching the network.

use std::path::{Path, PathBuf};
use std::process::Command;

use repomirror::config::{Configuration, Repo};
use repomirror::report::Report;

/// Account identity the pull operation binds into every mirror.
pub const ACCOUNT_NAME: &str = "Mirror Tester";
pub const ACCOUNT_EMAIL: &str = "tester@users.noreply.github.com";

/// Run git in `dir`, panicking on failure with the full stderr.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");

    assert!(
        output.status.success(),
        "git {:?} failed in {}:\n{}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Stage and commit one file with a fixture identity, distinct from the
/// account identity so the rewrite performed by pull is observable.
pub fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(dir.join(file), content).expect("failed to write fixture file");
    git(dir, &["add", "."]);
    git(
        dir,
        &[
            "-c",
            "user.name=Fixture Author",
            "-c",
            "user.email=fixture@example.com",
            "commit",
            "-m",
            message,
        ],
    );
}

/// A local stand-in for the hosted side of a mirror: a bare repository the
/// tool clones from, plus a seed working clone that can advance it.
pub struct RemoteRepo {
    pub bare: PathBuf,
    pub seed: PathBuf,
}

impl RemoteRepo {
    /// Create a bare remote holding one commit on `main`.
    pub fn new(root: &Path, name: &str) -> Self {
        let seed = root.join(format!("{}-seed", name));
        let bare = root.join(format!("{}.git", name));

        std::fs::create_dir_all(&seed).expect("failed to create seed dir");
        git(&seed, &["init", "-b", "main"]);
        commit_file(&seed, "README.md", "# fixture\n", "initial commit");

        git(
            root,
            &[
                "clone",
                "--bare",
                seed.to_str().unwrap(),
                bare.to_str().unwrap(),
            ],
        );
        git(&seed, &["remote", "add", "origin", bare.to_str().unwrap()]);

        Self { bare, seed }
    }

    /// Clone URL the tool should use.
    pub fn url(&self) -> String {
        self.bare.display().to_string()
    }

    /// Push one new commit to the remote, simulating upstream activity.
    pub fn advance(&self, file: &str, content: &str) {
        commit_file(&self.seed, file, content, &format!("update {}", file));
        git(&self.seed, &["push", "origin", "main"]);
    }

    /// Hash of the remote's `main` tip.
    pub fn tip(&self) -> String {
        git(&self.bare, &["rev-parse", "main"]).trim().to_string()
    }
}

/// Descriptor for a mirror of `remote` at `dir`, tracking `main`.
pub fn descriptor(remote: &RemoteRepo, dir: &Path) -> Repo {
    Repo {
        url: remote.url(),
        dir: dir.display().to_string(),
        branch: "main".to_string(),
        parent: String::new(),
    }
}

pub fn config_for(base_dir: &Path, repos: Vec<Repo>) -> Configuration {
    Configuration {
        full_name: ACCOUNT_NAME.to_string(),
        username: "tester".to_string(),
        base_dir: base_dir.display().to_string(),
        email: ACCOUNT_EMAIL.to_string(),
        repos,
        ..Configuration::default()
    }
}

/// The rendered report with ANSI escapes stripped.
pub fn plain(report: &Report) -> String {
    let rendered = report.render().unwrap_or_default();
    console::strip_ansi_codes(&rendered).into_owned()
}
