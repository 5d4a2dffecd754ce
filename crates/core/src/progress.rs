//! Intermediate batch progress, emitted after each unit is published.

use std::fmt;

use crate::status::Status;

/// Snapshot of how many eligible units have been published.
///
/// A unit is eligible while it is neither excluded by the inclusion filter
/// nor `Failed`. `finished + remaining` always equals the number of eligible
/// units; failed units are listed apart and count toward neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSummary {
    pub finished: Vec<String>,
    pub remaining: Vec<String>,
    pub failed: Vec<String>,
}

impl ProgressSummary {
    /// Build a snapshot from `(name, status)` pairs.
    ///
    /// Returns `None` once nothing remains; the final summary covers that case.
    pub fn compute<'a, I>(units: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, Status)>,
    {
        let mut finished = Vec::new();
        let mut remaining = Vec::new();
        let mut failed = Vec::new();
        for (name, status) in units {
            match status {
                Status::Pushed => finished.push(name.to_string()),
                Status::Failed => failed.push(name.to_string()),
                Status::DoNotBuild => {}
                _ => remaining.push(name.to_string()),
            }
        }

        if remaining.is_empty() {
            return None;
        }
        Some(Self {
            finished,
            remaining,
            failed,
        })
    }

    /// Number of eligible units.
    pub fn total(&self) -> usize {
        self.finished.len() + self.remaining.len()
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Built & Pushed [ {} / {} ].\nComplete: {}\nRemaining: {}",
            self.finished.len(),
            self.total(),
            self.finished.join(", "),
            self.remaining.join(", "),
        )?;
        if !self.failed.is_empty() {
            write!(f, "\nFailed: {}", self.failed.join(", "))?;
        }
        Ok(())
    }
}
