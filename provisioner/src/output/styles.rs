//! Terminal stylesheet. Everything is plain until `colorize` runs, so
//! `--no-color` and non-TTY output need no special casing.

use owo_colors::Style;
use vdi_common::{DesktopStatus, JobStatus};

#[derive(Default, Clone)]
pub struct Styles {
    pub success: Style,
    pub warning: Style,
    pub error: Style,
    pub info: Style,
    pub dim: Style,
    pub bold: Style,
    pub header: Style,
}

impl Styles {
    pub fn colorize(&mut self) {
        self.success = Style::new().green();
        self.warning = Style::new().yellow();
        self.error = Style::new().red();
        self.info = Style::new().blue();
        self.dim = Style::new().dimmed();
        self.bold = Style::new().bold();
        self.header = Style::new().bold().cyan();
    }

    /// Colour of a job status label.
    #[must_use]
    pub fn job(&self, status: JobStatus) -> Style {
        match status {
            JobStatus::Success => self.success,
            JobStatus::PartialFailed => self.warning,
            JobStatus::Failed => self.error,
            JobStatus::Pending | JobStatus::Running => self.info,
        }
    }

    /// Colour of a desktop status label. `ReadyWithWarn` is usable, but the
    /// open WinRM port deserves attention.
    #[must_use]
    pub fn desktop(&self, status: DesktopStatus) -> Style {
        match status {
            DesktopStatus::Ready => self.success,
            DesktopStatus::ReadyWithWarn
            | DesktopStatus::AppError
            | DesktopStatus::NatError
            | DesktopStatus::AssignIfError => self.warning,
            DesktopStatus::Error => self.error,
            DesktopStatus::Created => self.info,
        }
    }
}
