// Review output parser
// Recovers a structured review from free-form model text. Every step is a single pass over
// lines or bytes, so hostile input costs time linear in its length.


pub mod grammar;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub use grammar::{Field, Grammar, Header, Section};

use crate::{Result, ReviewError};

/// Normalized spellings; checked as prefixes so trailing prose is ignored
const VERDICT_FORMS: &[(&str, Verdict)] = &[
    ("request_changes", Verdict::RequestChanges),
    ("requested_changes", Verdict::RequestChanges),
    ("changes_requested", Verdict::RequestChanges),
    ("reject", Verdict::RequestChanges),
    ("approve", Verdict::Approve),
    ("lgtm", Verdict::Approve),
    ("comment", Verdict::Comment),
    ("neutral", Verdict::Comment),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    #[default]
    Comment,
}

impl Verdict {
    /// Normalize a verdict token: case, brackets, emphasis, spaces and hyphens are ignored.
    #[inline]
    pub fn parse(text: &str) -> Option<Self> {
        let normalized: String = text
            .trim_start_matches(|c: char| !c.is_alphanumeric())
            .chars()
            .take(32)
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        VERDICT_FORMS
            .iter()
            .find(|(form, _)| normalized.starts_with(form))
            .map(|(_, verdict)| *verdict)
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::RequestChanges => "request_changes",
            Verdict::Comment => "comment",
        }
    }
}

impl fmt::Display for Verdict {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line-anchored finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Repository-relative
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub severity: String,
    pub category: String,
    pub comment: String,
    /// Percentage, 0..=100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_fix_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproducibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_fix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructuredReview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub summary: String,
    pub verdict: Verdict,
    pub suggestions: Vec<Suggestion>,
}

impl StructuredReview {
    /// A review consisting only of prose, used when nothing structured could be recovered
    #[inline]
    pub fn from_summary(summary: impl Into<String>) -> Self {
        Self {
            title: None,
            summary: summary.into(),
            verdict: Verdict::Comment,
            suggestions: Vec::new(),
        }
    }
}

/// Parse with the default grammar
#[inline]
pub fn parse_review(raw: &str) -> Result<StructuredReview> {
    parse_review_with(raw, &Grammar::default())
}

/// Parse model output into a structured review.
///
/// Fails with [`ReviewError::Unparseable`] when neither a summary, a verdict nor a single
/// suggestion can be found.
#[inline]
pub fn parse_review_with(raw: &str, grammar: &Grammar) -> Result<StructuredReview> {
    let body = unwrap_fence(raw);

    let mut scanner = Scanner::new(grammar);
    for line in body.lines() {
        scanner.line(cap_line(line, grammar.max_line_chars()));
    }
    let mut review = scanner.finish();

    // Tags may share a line with arbitrary text the line cap has cut off
    if review.summary.is_empty() {
        if let Some(summary) = extract_tag(body, "summary") {
            review.summary = summary.to_string();
        }
    }
    if review.verdict.is_none() {
        review.verdict = extract_tag(body, "verdict").and_then(Verdict::parse);
    }

    if review.summary.is_empty() && review.verdict.is_none() && review.suggestions.is_empty() {
        return Err(ReviewError::Unparseable(
            "no summary, verdict or suggestions found in model output".to_string(),
        ));
    }

    debug!(
        "Parsed review: verdict {:?}, {} suggestions, {} dropped",
        review.verdict,
        review.suggestions.len(),
        review.dropped
    );
    Ok(StructuredReview {
        title: None,
        summary: review.summary,
        verdict: review.verdict.unwrap_or_default(),
        suggestions: review.suggestions,
    })
}

/// Text between the innermost `<tag>` and the first `</tag>` after it.
///
/// Unclosed tags do not match.
#[inline]
pub fn extract_tag<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let close_at = content.find(&close)?;
    let before = content.get(..close_at)?;
    let open_at = before.rfind(&open)?;
    content
        .get(open_at + open.len()..close_at)
        .map(str::trim)
}

/// Strip decoration models put around paths: emphasis, backticks, quotes and a trailing colon.
#[inline]
pub fn sanitize_path(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '*' | '`' | '"' | '\''))
        .collect();
    let mut path = cleaned.trim().trim_end_matches([':', ',', ';']).trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

/// Whether a path stays inside the repository root.
///
/// Absolute, home-relative, drive-prefixed and UNC paths are rejected, as is any `..` segment.
#[inline]
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    if path.starts_with(['/', '\\', '~']) {
        return false;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return false;
    }
    !path.split(['/', '\\']).any(|segment| segment == "..")
}

fn cap_line(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((index, _)) => line.get(..index).unwrap_or(line),
        None => line,
    }
}

/// The body of the fence wrapping the response, if any.
/// Inner fences that carry a language are balanced against bare closing fences.
fn unwrap_fence(text: &str) -> &str {
    let trimmed = text.trim_start();
    let Some(start) = enclosing_fence_start(trimmed) else {
        return text;
    };

    let from_fence = trimmed.get(start..).unwrap_or_default();
    let Some(newline) = from_fence.find('\n') else {
        return text;
    };
    let body = from_fence.get(newline + 1..).unwrap_or_default();

    let mut depth = 0_usize;
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if let Some(info) = line.trim().strip_prefix("```") {
            if info.trim().is_empty() {
                if depth == 0 {
                    return body.get(..offset).unwrap_or(body);
                }
                depth -= 1;
            } else {
                depth += 1;
            }
        }
        offset += line.len();
    }
    body
}

/// A bare or `text` fence opening the response, otherwise the first `markdown` fence anywhere
fn enclosing_fence_start(text: &str) -> Option<usize> {
    let mut offset = 0;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        if let Some(info) = line.trim().strip_prefix("```").map(str::trim) {
            let wraps_response = index == 0 && matches!(info, "" | "text");
            if wraps_response || matches!(info, "markdown" | "md" | "review") {
                return Some(offset);
            }
        }
        offset += line.len();
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Fields,
    Comment,
    CodeFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Summary,
    Verdict,
    Suggestions,
    Suggestion(Part),
}

#[derive(Debug, Default)]
struct Draft {
    path: Option<String>,
    lines: Option<(u32, u32)>,
    severity: Option<String>,
    category: Option<String>,
    confidence: Option<u8>,
    fix_time: Option<String>,
    reproducibility: Option<String>,
    comment: Vec<String>,
    code_fix: Vec<String>,
}

struct Scanned {
    summary: String,
    verdict: Option<Verdict>,
    suggestions: Vec<Suggestion>,
    dropped: usize,
}

struct Scanner<'g> {
    grammar: &'g Grammar,
    state: State,
    in_fence: bool,
    preamble: Vec<String>,
    summary: Vec<String>,
    verdict: Option<Verdict>,
    current: Option<Draft>,
    suggestions: Vec<Suggestion>,
    dropped: usize,
}

impl<'g> Scanner<'g> {
    fn new(grammar: &'g Grammar) -> Self {
        Self {
            grammar,
            state: State::Preamble,
            in_fence: false,
            preamble: Vec::new(),
            summary: Vec::new(),
            verdict: None,
            current: None,
            suggestions: Vec::new(),
            dropped: 0,
        }
    }

    fn line(&mut self, line: &str) {
        let trimmed = line.trim();
        let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");

        if self.in_fence || is_fence {
            if is_fence {
                self.in_fence = !self.in_fence;
            }
            self.content(line, is_fence);
            // Prose after a fenced fix belongs to the comment again
            if is_fence && !self.in_fence && self.state == State::Suggestion(Part::CodeFix) {
                self.state = State::Suggestion(Part::Comment);
            }
            return;
        }

        let in_suggestion = matches!(self.state, State::Suggestion(_));
        if matches!(self.state, State::Suggestion(Part::Fields | Part::Comment)) {
            if let Some((field, value)) = self.grammar.match_field(trimmed) {
                self.field(field, value);
                return;
            }
        }

        if let Some(header) = self.grammar.match_header(trimmed, in_suggestion) {
            self.header(header, line);
            return;
        }

        // Numbered or bare-location headings inside the suggestion list
        if trimmed.starts_with('#') && matches!(self.state, State::Suggestions | State::Suggestion(_)) {
            let heading = trimmed.trim_start_matches('#');
            let (path, lines) = parse_location(self.grammar, heading);
            if path.is_some() {
                self.start_suggestion(path, lines);
                return;
            }
        }

        self.content(line, false);
    }

    fn header(&mut self, header: Header<'_>, line: &str) {
        let Header {
            section,
            rest,
            closing,
        } = header;

        if closing {
            match (section, self.state) {
                (Some(Section::Suggestion), _) => {
                    self.finish_suggestion();
                    self.state = State::Suggestions;
                }
                (Some(Section::Comment | Section::CodeFix), State::Suggestion(_)) => {
                    self.state = State::Suggestion(Part::Fields);
                }
                (Some(Section::Summary | Section::Verdict), _) => self.state = State::Preamble,
                _ => {}
            }
            return;
        }

        match section {
            None => {}
            Some(Section::Summary) => {
                self.finish_suggestion();
                self.state = State::Summary;
                if !rest.is_empty() {
                    self.summary.push(rest.to_string());
                }
            }
            Some(Section::Verdict) => {
                self.finish_suggestion();
                self.state = State::Verdict;
                if self.verdict.is_none() {
                    self.verdict = Verdict::parse(rest);
                }
            }
            Some(Section::Suggestions) => {
                self.finish_suggestion();
                self.state = State::Suggestions;
            }
            Some(Section::Suggestion) => {
                let (path, lines) = parse_location(self.grammar, rest);
                self.start_suggestion(path, lines);
            }
            Some(Section::Comment) => {
                if let Some(draft) = self.current.as_mut() {
                    self.state = State::Suggestion(Part::Comment);
                    if !rest.is_empty() {
                        draft.comment.push(rest.to_string());
                    }
                } else {
                    self.content(line, false);
                }
            }
            Some(Section::CodeFix) => {
                if let Some(draft) = self.current.as_mut() {
                    self.state = State::Suggestion(Part::CodeFix);
                    if !rest.is_empty() {
                        draft.code_fix.push(rest.to_string());
                    }
                } else {
                    self.content(line, false);
                }
            }
        }
    }

    fn field(&mut self, field: Field, value: &str) {
        let Some(draft) = self.current.as_mut() else {
            return;
        };
        let text = clean_value(value);
        match field {
            Field::Severity => draft.severity = text,
            Field::Category => draft.category = text,
            Field::Confidence => draft.confidence = parse_confidence(value),
            Field::FixTime => draft.fix_time = text,
            Field::Reproducibility => draft.reproducibility = text,
            Field::Path => {
                let (path, lines) = parse_location(self.grammar, value);
                if path.is_some() {
                    draft.path = path;
                }
                if lines.is_some() {
                    draft.lines = lines;
                }
            }
            Field::Lines => {
                if let Some(lines) = self.grammar.parse_line_range(value) {
                    draft.lines = Some(lines);
                }
            }
        }
    }

    fn content(&mut self, line: &str, is_fence: bool) {
        match self.state {
            State::Preamble => self.preamble.push(line.to_string()),
            State::Summary => self.summary.push(line.to_string()),
            State::Verdict => {
                if self.verdict.is_none() && !line.trim().is_empty() {
                    self.verdict = Verdict::parse(line.trim());
                }
            }
            State::Suggestions => {}
            State::Suggestion(part) => {
                let Some(draft) = self.current.as_mut() else {
                    return;
                };
                match part {
                    Part::Fields | Part::Comment => draft.comment.push(line.to_string()),
                    Part::CodeFix => {
                        if !is_fence {
                            draft.code_fix.push(line.to_string());
                        }
                    }
                }
            }
        }
    }

    fn start_suggestion(&mut self, path: Option<String>, lines: Option<(u32, u32)>) {
        self.finish_suggestion();
        self.current = Some(Draft {
            path,
            lines,
            ..Draft::default()
        });
        self.state = State::Suggestion(Part::Fields);
    }

    fn finish_suggestion(&mut self) {
        let Some(draft) = self.current.take() else {
            return;
        };
        self.state = State::Suggestions;

        match validate(draft) {
            Some(suggestion) if self.suggestions.len() < self.grammar.max_suggestions() => {
                self.suggestions.push(suggestion);
            }
            Some(_) => {
                debug!("Suggestion limit reached, dropping the rest");
                self.dropped += 1;
            }
            None => self.dropped += 1,
        }
    }

    fn finish(mut self) -> Scanned {
        self.finish_suggestion();

        let mut summary = join_trimmed(&self.summary);
        if summary.is_empty() && (self.verdict.is_some() || !self.suggestions.is_empty()) {
            summary = join_trimmed(&self.preamble);
        }
        Scanned {
            summary,
            verdict: self.verdict,
            suggestions: self.suggestions,
            dropped: self.dropped,
        }
    }
}

fn validate(draft: Draft) -> Option<Suggestion> {
    let Some(path) = draft.path.filter(|path| !path.is_empty()) else {
        debug!("Dropping suggestion without a file path");
        return None;
    };
    if !is_safe_path(&path) {
        warn!("Dropping suggestion with unsafe path: {:?}", path);
        return None;
    }
    let Some((start, end)) = draft.lines.filter(|(start, _)| *start > 0) else {
        debug!("Dropping suggestion for {} without a line number", path);
        return None;
    };

    let code_fix = join_trimmed(&draft.code_fix);
    Some(Suggestion {
        file_path: path,
        start_line: start.min(end),
        end_line: start.max(end),
        severity: draft.severity.unwrap_or_else(|| "Medium".to_string()),
        category: draft.category.unwrap_or_else(|| "General".to_string()),
        comment: join_trimmed(&draft.comment),
        confidence: draft.confidence,
        estimated_fix_time: draft.fix_time,
        reproducibility: draft.reproducibility,
        code_fix: (!code_fix.is_empty()).then_some(code_fix),
    })
}

/// First path-like token and the line range next to it
fn parse_location(grammar: &Grammar, text: &str) -> (Option<String>, Option<(u32, u32)>) {
    let cleaned: String = text.chars().filter(|c| !matches!(c, '*' | '`')).collect();
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    for (index, token) in tokens.iter().enumerate() {
        let token = token.trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | '[' | ']' | ','));
        if !looks_like_path(token) {
            continue;
        }

        let (path_part, line_part) = split_path_and_lines(token);
        let lines = line_part
            .and_then(|lines| grammar.parse_line_range(lines))
            .or_else(|| {
                tokens
                    .get(index + 1..)
                    .and_then(|tail| grammar.parse_line_range(&tail.join(" ")))
            });
        return (Some(sanitize_path(path_part)), lines);
    }

    (None, grammar.parse_line_range(&cleaned))
}

fn looks_like_path(token: &str) -> bool {
    if token.contains(['/', '\\']) {
        return true;
    }
    let (name, lines) = token.split_once(':').unwrap_or((token, ""));
    let has_extension = name
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.chars().next().is_some_and(char::is_alphabetic));
    // Extensionless files such as `Makefile:12`
    let anchored = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && lines.starts_with(|c: char| c.is_ascii_digit());
    has_extension || anchored
}

/// `a.rs:10-12` or `a.rs#L10-L12`; a drive prefix such as `C:\` stays part of the path
fn split_path_and_lines(token: &str) -> (&str, Option<&str>) {
    let bytes = token.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/');
    if drive {
        return (token, None);
    }
    if let Some((path, lines)) = token.split_once("#L") {
        return (path, Some(lines));
    }
    match token.split_once(':') {
        Some((path, lines)) => (path, Some(lines)),
        None => (token, None),
    }
}

fn clean_value(value: &str) -> Option<String> {
    let cleaned = value
        .trim()
        .trim_matches(|c: char| matches!(c, '*' | '`' | '[' | ']' | '_'))
        .trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// `85`, `85%`, `0.85` and `8/10` all mean 85 percent (the last means 80)
fn parse_confidence(value: &str) -> Option<u8> {
    let value = value.trim().trim_start_matches(|c: char| !c.is_ascii_digit());
    let end = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let number: f32 = value.get(..end)?.parse().ok()?;
    let rest = value.get(end..).unwrap_or_default().trim_start();

    let percent = if let Some(denominator) = rest.strip_prefix('/') {
        let denominator: f32 = denominator
            .trim()
            .split(|c: char| !c.is_ascii_digit() && c != '.')
            .next()?
            .parse()
            .ok()?;
        if denominator <= 0.0 {
            return None;
        }
        number / denominator * 100.0
    } else if number <= 1.0 && value.get(..end).is_some_and(|n| n.contains('.')) {
        number * 100.0
    } else {
        number
    };

    if !percent.is_finite() {
        return None;
    }
    Some(percent.round().clamp(0.0, 100.0) as u8)
}

fn join_trimmed(lines: &[String]) -> String {
    lines.join("\n").trim().to_string()
}
