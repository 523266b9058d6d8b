//! Run directory layout
//!
//! Every instance gets a timestamped run directory:
//!
//! ```text
//! <output_root>/
//!   ledger.jsonl
//!   ledger.lock
//!   run_report_<YYYYmmdd_HHMMSS>.json
//!   <instance>/<YYYYmmdd_HHMMSS>/
//!     project_list.json
//!     export_report.json
//!     errors.log
//!     projects/<id>_<group>_<project>.tar.gz
//!     metadata/<id>_<group>_<project>/{issues,merge_requests}.json
//!     wikis/<id>_<group>_<project>/wiki_index.json, <slug>.md
//!     snippets/<id>_<group>_<project>/<snippet id>_<file name>
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use gitlab_backup::output::RunLayout;
//! use gitlab_backup::ProjectRef;
//! use chrono::{TimeZone, Utc};
//! use std::path::PathBuf;
//!
//! let started = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
//! let layout = RunLayout::new(PathBuf::from("exports"), "prod", started);
//! let project = ProjectRef::new("prod", 7, "group/app");
//!
//! assert_eq!(
//!     layout.archive_path(&project),
//!     PathBuf::from("exports/prod/20240102_030405/projects/7_group_app.tar.gz")
//! );
//! ```

use super::{sanitize_component, OutputError, OutputResult};
use crate::ProjectRef;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Timestamp format used for run directories
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Suffix for in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".part";

const PROJECTS_DIR: &str = "projects";
const METADATA_DIR: &str = "metadata";
const WIKIS_DIR: &str = "wikis";
const SNIPPETS_DIR: &str = "snippets";
const PROJECT_LIST_FILE: &str = "project_list.json";
const REPORT_FILE: &str = "export_report.json";
const ERROR_LOG_FILE: &str = "errors.log";
const LEDGER_FILE: &str = "ledger.jsonl";

/// Path of the resume ledger under an output root
pub fn ledger_path(output_root: &Path) -> PathBuf {
    output_root.join(LEDGER_FILE)
}

/// Path of the run-level summary report
pub fn run_report_path(output_root: &Path, started_at: DateTime<Utc>) -> PathBuf {
    output_root.join(format!(
        "run_report_{}.json",
        started_at.format(RUN_TIMESTAMP_FORMAT)
    ))
}

/// Directory layout for one instance within one run
#[derive(Debug, Clone)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    /// Build the layout for `instance` under `output_root`.
    ///
    /// The instance name is sanitized so it cannot escape the output root.
    pub fn new(output_root: PathBuf, instance: &str, started_at: DateTime<Utc>) -> Self {
        let run_dir = output_root
            .join(sanitize_component(instance))
            .join(started_at.format(RUN_TIMESTAMP_FORMAT).to_string());
        Self { run_dir }
    }

    /// Root of this instance run
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Directory holding finished archives
    pub fn projects_dir(&self) -> PathBuf {
        self.run_dir.join(PROJECTS_DIR)
    }

    /// Final archive location for a project
    pub fn archive_path(&self, project: &ProjectRef) -> PathBuf {
        self.projects_dir().join(project.archive_file_name())
    }

    /// Temporary download location; never visible under the final name
    pub fn partial_path(&self, project: &ProjectRef) -> PathBuf {
        let mut name = project.archive_file_name();
        name.push_str(PARTIAL_SUFFIX);
        self.projects_dir().join(name)
    }

    /// Issue and merge request listings of a project
    pub fn metadata_dir(&self, project: &ProjectRef) -> PathBuf {
        self.run_dir.join(METADATA_DIR).join(project.file_stem())
    }

    /// Wiki pages of a project
    pub fn wiki_dir(&self, project: &ProjectRef) -> PathBuf {
        self.run_dir.join(WIKIS_DIR).join(project.file_stem())
    }

    /// Snippets of a project
    pub fn snippets_dir(&self, project: &ProjectRef) -> PathBuf {
        self.run_dir.join(SNIPPETS_DIR).join(project.file_stem())
    }

    /// Enumerated project list for this run
    pub fn project_list_path(&self) -> PathBuf {
        self.run_dir.join(PROJECT_LIST_FILE)
    }

    /// Per-instance JSON report
    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join(REPORT_FILE)
    }

    /// Append-only error log
    pub fn error_log_path(&self) -> PathBuf {
        self.run_dir.join(ERROR_LOG_FILE)
    }

    /// Ensure run and projects directories exist
    pub fn ensure_directories(&self) -> OutputResult<()> {
        let dir_path = self.projects_dir();
        std::fs::create_dir_all(&dir_path).map_err(|e| {
            OutputError::IoError(format!(
                "Failed to create directory {}: {}",
                dir_path.display(),
                e
            ))
        })
    }
}
