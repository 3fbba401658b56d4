//! Applying mutation commands to the real filesystem.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::MutationCommand;

/// Performs one mutation. Failures are per command; callers report them and
/// carry on with the run.
pub trait Applier {
    fn apply(&mut self, command: &MutationCommand) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsApplier;

impl Applier for FsApplier {
    fn apply(&mut self, command: &MutationCommand) -> Result<()> {
        debug!(path = %command.primary_path().display(), "applying command");
        match command {
            MutationCommand::CreateFile { path, data } => {
                ensure_parent(path)?;
                fs::write(path, data).with_context(|| format!("create {}", path.display()))
            }
            MutationCommand::UpdateFile { path, new_data, .. } => {
                fs::write(path, new_data).with_context(|| format!("update {}", path.display()))
            }
            MutationCommand::DeleteFile { path } => {
                fs::remove_file(path).with_context(|| format!("delete {}", path.display()))
            }
            MutationCommand::MoveFile { from, to } => {
                ensure_parent(to)?;
                fs::rename(from, to)
                    .with_context(|| format!("move {} to {}", from.display(), to.display()))
            }
            MutationCommand::CopyFile { from, to } => {
                ensure_parent(to)?;
                fs::copy(from, to)
                    .map(|_| ())
                    .with_context(|| format!("copy {} to {}", from.display(), to.display()))
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}
