//! Isolated execution of one untrusted transformation.
//!
//! Transformations are MiniJinja templates. The environment never gets a
//! template loader, so `include`/`import`/`extends` cannot reach the host
//! filesystem and fail inside the sandbox. Host functionality is limited to
//! the [`Capabilities`] table passed in at construction; the only way for a
//! transformation to produce a result is the `report(body)` callback.
//!
//! Execution is bounded by MiniJinja's fixed recursion limit, an instruction
//! fuel budget and a cap on the reported body. Fuel does not bound memory: a
//! single string operation can allocate without limit, so process workers
//! also run under an address-space limit (see
//! [`crate::io::worker::limit_address_space`]). There is no wall-clock limit
//! here: a sandbox that stops responding is handled by the pool's hang
//! detection.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::normalize::{NormalizedSource, ReplacementRule};
use crate::core::types::ArgumentRecord;

const ENTRY: &str = "transform";

/// Host operations a transformation may use. Nothing outside this set is
/// registered in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// `regex_replace` filter and `regex_match` function.
    Regex,
    /// `parse_json` filter.
    Json,
    /// `basename`, `dirname` and `extname` filters.
    Path,
    /// `log(message)` forwarded to tracing.
    Log,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        [
            Capability::Regex,
            Capability::Json,
            Capability::Path,
            Capability::Log,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Instruction budget per invocation; `None` disables the budget.
    pub fuel: Option<u64>,
    /// Largest body `report()` accepts.
    pub max_report_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            fuel: Some(50_000_000),
            max_report_bytes: 16 * 1024 * 1024,
        }
    }
}

/// A loaded transformation, reusable across files.
pub struct Sandbox {
    env: Environment<'static>,
    reported: Arc<Mutex<Option<String>>>,
    rules: Vec<ReplacementRule>,
}

impl Sandbox {
    /// Compile `source` against the given capability table.
    pub fn load(
        source: &NormalizedSource,
        capabilities: &Capabilities,
        limits: &SandboxLimits,
    ) -> Result<Self> {
        if source.needs_regex() && !capabilities.contains(Capability::Regex) {
            return Err(anyhow!(
                "replacement rules need the regex capability, which is not granted"
            ));
        }

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.set_fuel(limits.fuel);

        let reported = Arc::new(Mutex::new(None));
        register_report(&mut env, Arc::clone(&reported), limits.max_report_bytes);
        register_capabilities(&mut env, capabilities);

        env.add_template_owned(ENTRY, source.template.clone())
            .context("compile transformation")?;
        debug!(shape = ?source.shape, ?capabilities, "sandbox loaded");

        Ok(Self {
            env,
            reported,
            rules: source.rules.clone(),
        })
    }

    /// Run the transformation against one file.
    ///
    /// Returns the reported body, or `None` when nothing was reported.
    pub fn invoke(
        &self,
        path: &Path,
        content: &str,
        options: &ArgumentRecord,
    ) -> Result<Option<String>> {
        self.take_report()?;
        let template = self.env.get_template(ENTRY)?;
        let rendered = template.render(context! {
            path => path.display().to_string(),
            content => content,
            options => options,
            rules => &self.rules,
        });
        let reported = self.take_report()?;
        rendered.with_context(|| format!("transform {}", path.display()))?;
        Ok(reported)
    }

    fn take_report(&self) -> Result<Option<String>> {
        let mut slot = self
            .reported
            .lock()
            .map_err(|_| anyhow!("report slot poisoned"))?;
        Ok(slot.take())
    }
}

fn register_report(
    env: &mut Environment<'static>,
    slot: Arc<Mutex<Option<String>>>,
    max_bytes: usize,
) {
    env.add_function("report", move |body: String| -> Result<String, Error> {
        if body.len() > max_bytes {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("report body of {} bytes exceeds {max_bytes} bytes", body.len()),
            ));
        }
        let mut reported = slot
            .lock()
            .map_err(|_| Error::new(ErrorKind::InvalidOperation, "report slot poisoned"))?;
        if reported.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "report() may only be called once per file",
            ));
        }
        *reported = Some(body);
        Ok(String::new())
    });
}

fn register_capabilities(env: &mut Environment<'static>, capabilities: &Capabilities) {
    if capabilities.contains(Capability::Regex) {
        env.add_filter("regex_replace", regex_replace);
        env.add_function("regex_match", regex_match);
    }
    if capabilities.contains(Capability::Json) {
        env.add_filter("parse_json", parse_json);
    }
    if capabilities.contains(Capability::Path) {
        env.add_filter("basename", |value: String| path_part(&value, Path::file_name));
        env.add_filter("dirname", |value: String| {
            Path::new(&value)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        env.add_filter("extname", |value: String| path_part(&value, Path::extension));
    }
    if capabilities.contains(Capability::Log) {
        env.add_function("log", |message: String| {
            info!(target: "sandbox", "{message}");
            String::new()
        });
    }
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|err| {
        Error::new(ErrorKind::InvalidOperation, format!("invalid pattern: {err}"))
    })
}

fn regex_replace(value: String, pattern: String, replacement: String) -> Result<String, Error> {
    Ok(compile(&pattern)?
        .replace_all(&value, replacement.as_str())
        .into_owned())
}

fn regex_match(value: String, pattern: String) -> Result<bool, Error> {
    Ok(compile(&pattern)?.is_match(&value))
}

fn parse_json(value: String) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(&value).map_err(|err| {
        Error::new(ErrorKind::InvalidOperation, format!("invalid json: {err}"))
    })?;
    Ok(Value::from_serialize(&parsed))
}

fn path_part(value: &str, part: fn(&Path) -> Option<&OsStr>) -> String {
    part(Path::new(value))
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
