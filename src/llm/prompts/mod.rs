// Prompt templates
// Templates are keyed by task and model; a model without its own template uses the default one


use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::{Result, ReviewError};

/// Provider name used when no model-specific template exists
pub const DEFAULT_PROVIDER: &str = "default";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "code_review_default",
        include_str!("templates/code_review_default.prompt"),
    ),
    (
        "rereview_default",
        include_str!("templates/rereview_default.prompt"),
    ),
    (
        "arch_summary_default",
        include_str!("templates/arch_summary_default.prompt"),
    ),
    (
        "question_default",
        include_str!("templates/question_default.prompt"),
    ),
    (
        "hyde_code_default",
        include_str!("templates/hyde_code_default.prompt"),
    ),
    (
        "consensus_review_default",
        include_str!("templates/consensus_review_default.prompt"),
    ),
    (
        "rerank_precision_default",
        include_str!("templates/rerank_precision_default.prompt"),
    ),
    (
        "query_rewrite_default",
        include_str!("templates/query_rewrite_default.prompt"),
    ),
    (
        "relevance_check_default",
        include_str!("templates/relevance_check_default.prompt"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PromptKey {
    CodeReview,
    ReReview,
    ArchSummary,
    Question,
    HydeCode,
    ConsensusReview,
    RerankPrecision,
    QueryRewrite,
    RelevanceCheck,
}

impl PromptKey {
    pub const ALL: [PromptKey; 9] = [
        PromptKey::CodeReview,
        PromptKey::ReReview,
        PromptKey::ArchSummary,
        PromptKey::Question,
        PromptKey::HydeCode,
        PromptKey::ConsensusReview,
        PromptKey::RerankPrecision,
        PromptKey::QueryRewrite,
        PromptKey::RelevanceCheck,
    ];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKey::CodeReview => "code_review",
            PromptKey::ReReview => "rereview",
            PromptKey::ArchSummary => "arch_summary",
            PromptKey::Question => "question",
            PromptKey::HydeCode => "hyde_code",
            PromptKey::ConsensusReview => "consensus_review",
            PromptKey::RerankPrecision => "rerank_precision",
            PromptKey::QueryRewrite => "query_rewrite",
            PromptKey::RelevanceCheck => "relevance_check",
        }
    }

    #[inline]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }
}

impl fmt::Display for PromptKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named values substituted into `{{name}}` placeholders
pub type PromptValues = BTreeMap<&'static str, String>;

#[derive(Debug, Clone)]
pub struct PromptManager {
    templates: HashMap<PromptKey, HashMap<String, String>>,
}

impl PromptManager {
    /// A manager holding the built-in default templates.
    #[inline]
    pub fn new() -> Result<Self> {
        let mut manager = Self {
            templates: HashMap::new(),
        };
        for (name, content) in BUILTIN_TEMPLATES {
            let (key, provider) = split_template_name(name)?;
            manager.register(key, provider, *content);
        }
        Ok(manager)
    }

    /// Add or replace the template used for `key` when rendering for `provider`.
    #[inline]
    pub fn register(&mut self, key: PromptKey, provider: &str, content: impl Into<String>) {
        self.templates
            .entry(key)
            .or_default()
            .insert(provider.to_string(), content.into());
    }

    /// The template for `provider`, falling back to the default one.
    #[inline]
    pub fn get(&self, key: PromptKey, provider: &str) -> Result<&str> {
        let by_provider = self
            .templates
            .get(&key)
            .ok_or_else(|| ReviewError::Config(format!("No prompts found for key '{key}'")))?;

        by_provider
            .get(provider)
            .or_else(|| by_provider.get(DEFAULT_PROVIDER))
            .map(String::as_str)
            .ok_or_else(|| {
                ReviewError::Config(format!(
                    "No template found for key '{key}' and provider '{provider}', and no default was available"
                ))
            })
    }

    #[inline]
    pub fn render(&self, key: PromptKey, provider: &str, values: &PromptValues) -> Result<String> {
        let template = self.get(key, provider)?;
        substitute(template, values).map_err(|name| {
            ReviewError::Config(format!("Prompt '{key}' references missing value '{name}'"))
        })
    }
}

/// `code_review_default` -> (`code_review`, `default`); the provider follows the last underscore
fn split_template_name(name: &str) -> Result<(PromptKey, &str)> {
    let invalid = || {
        ReviewError::Config(format!(
            "Invalid prompt template name: {name} (expected 'key_provider')"
        ))
    };

    let (key, provider) = name.rsplit_once('_').ok_or_else(invalid)?;
    if key.is_empty() || provider.is_empty() {
        return Err(invalid());
    }
    let key = PromptKey::parse(key).ok_or_else(invalid)?;
    Ok((key, provider))
}

/// Replace every `{{name}}` in one pass. Substituted text is never rescanned, so
/// diffs containing braces render verbatim. An unclosed `{{` is kept as text.
fn substitute<'a>(template: &'a str, values: &PromptValues) -> std::result::Result<String, &'a str> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let (before, tail) = rest.split_at(open);
        output.push_str(before);

        let after_open = tail.get(2..).unwrap_or_default();
        let Some(close) = after_open.find("}}") else {
            output.push_str(tail);
            return Ok(output);
        };

        let (name, after_name) = after_open.split_at(close);
        let name = name.trim();
        let value = values.get(name).ok_or(name)?;
        output.push_str(value);
        rest = after_name.get(2..).unwrap_or_default();
    }

    output.push_str(rest);
    Ok(output)
}
