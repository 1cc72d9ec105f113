//! Terminal rendering of the preview console and lifecycle changes.

use console::{Term, style};

use super::icons::{CHECK, CLONING, CROSS, GLOBE, INSTALLING, RUNNING, STOPPED, WARN};
use crate::preview::console::{ConsoleEntry, ConsoleSource};
use crate::preview::models::{LifecyclePhase, PreviewAddress};

/// Writes console entries to stdout as they arrive.
pub struct ConsoleView {
    term: Term,
}

impl Default for ConsoleView {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleView {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
        }
    }

    pub fn entry(&self, entry: &ConsoleEntry) {
        let _ = self.term.write_str(&format_entry(entry));
    }

    pub fn phase(&self, phase: LifecyclePhase) {
        let line = match phase {
            LifecyclePhase::Cloning => format!("{}{}", CLONING, style("Fetching sources").bold()),
            LifecyclePhase::Installing => {
                format!("{}{}", INSTALLING, style("Installing dependencies").bold())
            }
            LifecyclePhase::Running => format!("{}{}", RUNNING, style("Dev server running").bold()),
            LifecyclePhase::Idle => format!("{}{}", STOPPED, style("Stopped").dim()),
            LifecyclePhase::Error => return,
        };
        let _ = self.term.write_line(&line);
    }

    pub fn preview_ready(&self, preview: &PreviewAddress) {
        let _ = self.term.write_line(&format!(
            "{}{} {}",
            GLOBE,
            style("Preview ready:").green().bold(),
            style(&preview.url).cyan().underlined()
        ));
    }

    pub fn success(&self, message: &str) {
        let _ = self.term.write_line(&format!("{}{}", CHECK, message));
    }

    pub fn warning(&self, message: &str) {
        let _ = self.term.write_line(&format!("{}{}", WARN, style(message).yellow()));
    }

    pub fn error(&self, banner: &str) {
        let _ = self
            .term
            .write_line(&format!("{}{}", CROSS, style(banner).red().bold()));
    }
}

/// Text for one console entry. Process output passes through untouched;
/// orchestrator lines are dimmed.
pub fn format_entry(entry: &ConsoleEntry) -> String {
    match entry.source {
        ConsoleSource::Install | ConsoleSource::Server => entry.text.clone(),
        ConsoleSource::System | ConsoleSource::Fetch => style(&entry.text).dim().to_string(),
    }
}
