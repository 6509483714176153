//! Outcome taxonomy and the shared status report.
//!
//! Every repository operation terminates by appending exactly one [`Outcome`]
//! to the [`Report`]. The report accepts appends from any number of workers
//! and renders a sorted, column-aligned table once the run is complete.

use console::{measure_text_width, style};
use std::fmt;
use std::sync::Mutex;

/// Minimum column width and inter-column padding of the rendered table.
const COLUMN_PAD: usize = 5;

/// Terminal, reportable result of one operation on one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Operation completed without incident.
    Ok,
    /// No local directory where a repository is expected (push/status).
    Absent,
    /// Directory exists but git metadata is corrupt or missing.
    Broken,
    /// Local and remote histories diverged; nothing was merged or forced.
    NonFastForward,
    /// The remote rejected our credentials.
    Unauthorized,
    /// Directory under the mirror root that no configured repository claims.
    Untracked,
    /// Composite status line produced by the status operation.
    Status(String),
    /// Raw error text for conditions outside the stable taxonomy.
    Error(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "{}", style("ok").green()),
            Outcome::Absent => write!(f, "{}", style("absent").red()),
            Outcome::Broken => write!(f, "{}", style("broken").red()),
            Outcome::NonFastForward => write!(f, "{}", style("non-fast-forward").red()),
            Outcome::Unauthorized => write!(f, "{}", style("unauthorized").red()),
            Outcome::Untracked => write!(f, "{}", style("untracked").red()),
            Outcome::Status(line) => write!(f, "{}", line),
            Outcome::Error(message) => write!(f, "{}", style(message).red()),
        }
    }
}

/// One (repository path, outcome) pair.
#[derive(Debug, Clone)]
struct Entry {
    repo: String,
    outcome: Outcome,
}

/// Append-only, thread-safe collection of per-repository outcomes.
///
/// Workers append concurrently during a run; the printer reads only after
/// the orchestrator's completion barrier, so a plain mutex-guarded vector
/// is all the structure this needs.
#[derive(Debug, Default)]
pub struct Report {
    entries: Mutex<Vec<Entry>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for one repository.
    pub fn append(&self, repo: impl Into<String>, outcome: Outcome) {
        let mut entries = self.entries.lock().expect("report mutex poisoned");
        entries.push(Entry {
            repo: repo.into(),
            outcome,
        });
    }

    /// Record a free-text error outcome for one repository.
    pub fn append_error(&self, repo: impl Into<String>, err: impl fmt::Display) {
        self.append(repo, Outcome::Error(err.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("report mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the sorted table, or `None` when nothing was recorded.
    ///
    /// Rows are sorted by repository path; tab-separated fields inside an
    /// outcome (the status composite) are aligned into columns across the
    /// whole table, ANSI escapes excluded from width measurement.
    pub fn render(&self) -> Option<String> {
        let mut entries = self
            .entries
            .lock()
            .expect("report mutex poisoned")
            .clone();

        if entries.is_empty() {
            return None;
        }

        entries.sort_by(|a, b| a.repo.cmp(&b.repo));

        let rows: Vec<Vec<String>> = entries
            .iter()
            .map(|entry| {
                let mut fields = vec![entry.repo.clone()];
                fields.extend(entry.outcome.to_string().split('\t').map(str::to_string));
                fields
            })
            .collect();

        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut widths = vec![0usize; columns];
        for row in &rows {
            for (i, field) in row.iter().enumerate() {
                widths[i] = widths[i].max(measure_text_width(field).max(COLUMN_PAD));
            }
        }

        let mut out = String::new();
        for row in &rows {
            let mut line = String::new();
            for (i, field) in row.iter().enumerate() {
                line.push_str(field);
                if i + 1 < row.len() {
                    let pad = widths[i] + COLUMN_PAD - measure_text_width(field);
                    line.extend(std::iter::repeat(' ').take(pad));
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }

        Some(out)
    }

    /// Print the sorted table to standard output.
    ///
    /// A leading blank line separates the table from any progress output.
    pub fn print(&self) {
        if let Some(table) = self.render() {
            println!();
            print!("{}", table);
        }
    }
}
