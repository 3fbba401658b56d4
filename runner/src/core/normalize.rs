//! Normalization of transformation sources into the single sandbox shape.
//!
//! The sandbox only runs report-shaped templates: the template calls
//! `report(body)` at most once, and not calling it means "no change". Older
//! shapes are rewritten here, before anything executes:
//!
//! - `render`: a template whose rendered output *is* the new body, marked by a
//!   leading `{# shape: render #}` comment.
//! - `replacements`: a JSON array of `{"pattern": .., "replacement": ..}`
//!   regex rules applied in order.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

static RENDER_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\{#-?\s*shape:\s*render\s*-?#\}").expect("render header regex is valid")
});

const REPLACEMENTS_TEMPLATE: &str = concat!(
    "{%- set ns = namespace(body=content) -%}",
    "{%- for rule in rules -%}",
    "{%- set ns.body = ns.body | regex_replace(rule.pattern, rule.replacement) -%}",
    "{%- endfor -%}",
    "{%- if ns.body != content -%}{{ report(ns.body) }}{%- endif -%}",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceShape {
    Report,
    Render,
    Replacements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub pattern: String,
    pub replacement: String,
}

/// A report-shaped template plus any data it needs at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    pub shape: SourceShape,
    pub template: String,
    /// Bound to `rules` in the render context for the `replacements` shape.
    pub rules: Vec<ReplacementRule>,
}

impl NormalizedSource {
    /// Whether running this source needs the regex capability.
    pub fn needs_regex(&self) -> bool {
        self.shape == SourceShape::Replacements
    }
}

pub fn normalize_source(raw: &str) -> Result<NormalizedSource> {
    if is_json_array(raw) {
        return normalize_replacements(raw);
    }
    if let Some(header) = RENDER_HEADER_RE.find(raw) {
        return Ok(normalize_render(&raw[header.end()..]));
    }
    Ok(NormalizedSource {
        shape: SourceShape::Report,
        template: raw.to_string(),
        rules: Vec::new(),
    })
}

fn normalize_render(body: &str) -> NormalizedSource {
    let body = body.strip_prefix('\n').unwrap_or(body);
    let template = format!(
        "{{% set rendered %}}{body}{{% endset %}}\
         {{% if rendered and rendered != content %}}{{{{ report(rendered) }}}}{{% endif %}}"
    );
    NormalizedSource {
        shape: SourceShape::Render,
        template,
        rules: Vec::new(),
    }
}

/// Templates may start with a literal `[`; only real JSON counts as rules.
fn is_json_array(raw: &str) -> bool {
    raw.trim_start().starts_with('[') && serde_json::from_str::<IgnoredAny>(raw).is_ok()
}

fn normalize_replacements(raw: &str) -> Result<NormalizedSource> {
    let rules: Vec<ReplacementRule> =
        serde_json::from_str(raw).context("parse replacement rules")?;
    if rules.is_empty() {
        bail!("replacement rules must not be empty");
    }
    for (idx, rule) in rules.iter().enumerate() {
        Regex::new(&rule.pattern)
            .with_context(|| format!("rule {idx}: invalid pattern {:?}", rule.pattern))?;
    }
    Ok(NormalizedSource {
        shape: SourceShape::Replacements,
        template: REPLACEMENTS_TEMPLATE.to_string(),
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_template_is_report_shaped() {
        let source = normalize_source("{{ report(content | upper) }}").unwrap();
        assert_eq!(source.shape, SourceShape::Report);
        assert_eq!(source.template, "{{ report(content | upper) }}");
        assert!(!source.needs_regex());
    }

    #[test]
    fn render_header_wraps_body() {
        let source = normalize_source("{# shape: render #}\n{{ content | upper }}").unwrap();
        assert_eq!(source.shape, SourceShape::Render);
        assert!(source.template.contains("{{ content | upper }}"));
        assert!(source.template.contains("report(rendered)"));
        assert!(!source.template.contains("shape: render"));
    }

    #[test]
    fn replacement_rules_are_validated() {
        let source =
            normalize_source(r#"[{"pattern": "foo(\\d)", "replacement": "bar$1"}]"#).unwrap();
        assert_eq!(source.shape, SourceShape::Replacements);
        assert_eq!(source.rules.len(), 1);
        assert!(source.needs_regex());

        let err = normalize_source(r#"[{"pattern": "(", "replacement": ""}]"#).unwrap_err();
        assert!(format!("{err:#}").contains("invalid pattern"));
        assert!(normalize_source("[]").is_err());
        assert!(normalize_source(r#"[{"pattern": 1}]"#).is_err());
    }

    #[test]
    fn template_starting_with_a_bracket_is_report_shaped() {
        let raw = "[{{ report(content) }}]";
        let source = normalize_source(raw).unwrap();
        assert_eq!(source.shape, SourceShape::Report);
        assert_eq!(source.template, raw);
        assert!(source.rules.is_empty());
    }
}
