//! Transformer abstraction for per-file execution.
//!
//! The [`Transformer`] trait is the single entry point every engine satisfies:
//! given a file path, its content and the run's options, return the new body
//! or `None` for "no change". Workers obtain transformers through a
//! [`TransformerFactory`], loading each engine once and reusing it for every
//! later file. Tests use scripted factories that never touch a real engine.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::core::normalize::{NormalizedSource, normalize_source};
use crate::core::types::{ArgumentRecord, EngineHint};
use crate::io::config::{CommandConfig, RunConfig};
use crate::io::process::run_filter;
use crate::io::sandbox::{Capabilities, Sandbox, SandboxLimits};

/// Input for one transformation call.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    pub path: &'a Path,
    pub content: &'a str,
    pub options: &'a ArgumentRecord,
}

pub trait Transformer: Send {
    fn transform(&mut self, input: &TransformInput<'_>) -> Result<Option<String>>;
}

/// Loads transformers by engine hint. Shared by every worker of a pool.
pub trait TransformerFactory: Send + Sync {
    fn load(&self, engine: EngineHint) -> Result<Box<dyn Transformer>>;
}

/// Runs a normalized template inside a [`Sandbox`].
pub struct TemplateTransformer {
    sandbox: Sandbox,
}

impl TemplateTransformer {
    pub fn load(
        source: &NormalizedSource,
        capabilities: &Capabilities,
        limits: &SandboxLimits,
    ) -> Result<Self> {
        Ok(Self {
            sandbox: Sandbox::load(source, capabilities, limits)?,
        })
    }
}

impl Transformer for TemplateTransformer {
    fn transform(&mut self, input: &TransformInput<'_>) -> Result<Option<String>> {
        self.sandbox
            .invoke(input.path, input.content, input.options)
    }
}

/// Pipes each file through an external program.
///
/// The file body goes to stdin; stdout is the new body and empty stdout means
/// no change. `CODEMOD_PATH` and `CODEMOD_OPTIONS` describe the job.
pub struct CommandTransformer {
    config: CommandConfig,
}

impl CommandTransformer {
    pub fn new(config: CommandConfig) -> Result<Self> {
        if config.program.is_empty() || config.program[0].trim().is_empty() {
            bail!("command engine needs command.program to be set");
        }
        Ok(Self { config })
    }
}

impl Transformer for CommandTransformer {
    #[instrument(skip_all, fields(path = %input.path.display()))]
    fn transform(&mut self, input: &TransformInput<'_>) -> Result<Option<String>> {
        let mut cmd = Command::new(&self.config.program[0]);
        cmd.args(&self.config.program[1..])
            .env("CODEMOD_PATH", input.path)
            .env(
                "CODEMOD_OPTIONS",
                serde_json::to_string(input.options).context("serialize options")?,
            );

        let output = run_filter(
            cmd,
            input.content.as_bytes(),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )?;
        if output.timed_out {
            return Err(anyhow!(
                "command engine timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "command engine failed with status {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "command engine output exceeded {} bytes",
                self.config.output_limit_bytes
            ));
        }
        if output.stdout.is_empty() {
            debug!("command engine reported no change");
            return Ok(None);
        }
        let body =
            String::from_utf8(output.stdout).context("command engine output is not UTF-8")?;
        Ok(Some(body))
    }
}

/// Production factory: template sandbox or external command.
pub struct EngineFactory {
    source: Option<Arc<NormalizedSource>>,
    capabilities: Capabilities,
    limits: SandboxLimits,
    command: CommandConfig,
}

impl EngineFactory {
    /// `source` is the raw transformation text; required for the template engine.
    pub fn new(source: Option<&str>, config: &RunConfig) -> Result<Self> {
        let source = source
            .map(normalize_source)
            .transpose()
            .context("normalize transformation")?
            .map(Arc::new);
        Ok(Self {
            source,
            capabilities: config.sandbox.capabilities.iter().copied().collect(),
            limits: SandboxLimits {
                fuel: config.sandbox.fuel,
                max_report_bytes: config.sandbox.max_report_bytes,
            },
            command: config.command.clone(),
        })
    }
}

impl TransformerFactory for EngineFactory {
    fn load(&self, engine: EngineHint) -> Result<Box<dyn Transformer>> {
        match engine {
            EngineHint::Template => {
                let source = self
                    .source
                    .as_deref()
                    .ok_or_else(|| anyhow!("template engine needs a transformation source"))?;
                Ok(Box::new(TemplateTransformer::load(
                    source,
                    &self.capabilities,
                    &self.limits,
                )?))
            }
            EngineHint::Command => Ok(Box::new(CommandTransformer::new(self.command.clone())?)),
        }
    }
}
