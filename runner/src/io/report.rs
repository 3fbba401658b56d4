//! Line-oriented progress and result notifications.
//!
//! One JSON object per line, tagged by `kind`. The stream is product output
//! (stdout of `codemod-runner run`), separate from tracing diagnostics.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::ProgressReport;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification<'a> {
    Progress { processed: usize, total: usize },
    /// A job or an apply step failed for one path.
    Error { path: &'a Path, message: &'a str },
    /// A worker stopped responding; its path was abandoned.
    Hang { path: &'a Path },
    Finish {
        processed: usize,
        total: usize,
        changed: usize,
        errors: usize,
        abandoned: usize,
        dry_run: bool,
        case_path: &'a Path,
    },
}

impl From<ProgressReport> for Notification<'_> {
    fn from(progress: ProgressReport) -> Self {
        Self::Progress {
            processed: progress.processed,
            total: progress.total,
        }
    }
}

pub struct Reporter<W: Write> {
    sink: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn emit(&mut self, notification: &Notification<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.sink, notification).context("serialize notification")?;
        self.sink
            .write_all(b"\n")
            .context("write notification")?;
        self.sink.flush().context("flush notification")
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_tagged_object_per_line() {
        let mut reporter = Reporter::new(Vec::new());
        reporter.emit(&ProgressReport::new(1, 4).into()).unwrap();
        reporter
            .emit(&Notification::Error {
                path: Path::new("/repo/a.ts"),
                message: "boom",
            })
            .unwrap();

        let out = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], r#"{"kind":"progress","processed":1,"total":4}"#);
        assert_eq!(
            lines[1],
            r#"{"kind":"error","path":"/repo/a.ts","message":"boom"}"#
        );
    }
}
