// Header vocabulary and line-range notation accepted from model output
// Models drift between spellings, so the sets are plain data that callers can extend


/// Longest line the scanner looks at; the rest of an overlong line is ignored
pub const DEFAULT_MAX_LINE_CHARS: usize = 4096;

/// Upper bound on suggestions kept from one response
pub const DEFAULT_MAX_SUGGESTIONS: usize = 200;

/// Longest key accepted in `Key: value` lines
const MAX_KEY_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Summary,
    Verdict,
    /// The list of suggestions as a whole
    Suggestions,
    /// One suggestion, usually followed by its location
    Suggestion,
    Comment,
    CodeFix,
}

/// Per-suggestion metadata lines such as `**Severity:** High`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Severity,
    Category,
    Confidence,
    FixTime,
    Reproducibility,
    Path,
    Lines,
}

const DEFAULT_HEADERS: &[(Section, &str)] = &[
    (Section::Summary, "review summary"),
    (Section::Summary, "summary"),
    (Section::Summary, "overview"),
    (Section::Summary, "overall assessment"),
    (Section::Verdict, "verdict"),
    (Section::Verdict, "final verdict"),
    (Section::Verdict, "decision"),
    (Section::Verdict, "recommendation"),
    (Section::Suggestions, "suggestions"),
    (Section::Suggestions, "detailed suggestions"),
    (Section::Suggestions, "issues"),
    (Section::Suggestions, "issues found"),
    (Section::Suggestions, "findings"),
    (Section::Suggestions, "review comments"),
    (Section::Suggestion, "suggestion"),
    (Section::Suggestion, "issue"),
    (Section::Suggestion, "finding"),
    (Section::Comment, "comment"),
    (Section::Comment, "explanation"),
    (Section::Comment, "details"),
    (Section::Comment, "description"),
    (Section::Comment, "rationale"),
    (Section::CodeFix, "code fix"),
    (Section::CodeFix, "suggested fix"),
    (Section::CodeFix, "suggested change"),
    (Section::CodeFix, "code suggestion"),
    (Section::CodeFix, "fix"),
];

const FIELDS: &[(Field, &str)] = &[
    (Field::Severity, "severity"),
    (Field::Severity, "priority"),
    (Field::Category, "category"),
    (Field::Category, "type"),
    (Field::Confidence, "confidence"),
    (Field::FixTime, "estimated fix time"),
    (Field::FixTime, "fix time"),
    (Field::Reproducibility, "reproducibility"),
    (Field::Path, "file"),
    (Field::Path, "path"),
    (Field::Path, "file path"),
    (Field::Path, "location"),
    (Field::Lines, "line"),
    (Field::Lines, "lines"),
    (Field::Lines, "line range"),
];

/// A recognized header line and whatever followed its keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    /// `None` for markup the scanner should skip, such as `<review>`
    pub section: Option<Section>,
    pub rest: &'a str,
    /// A closing tag like `</suggestion>`
    pub closing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    /// Lowercase spellings, longest first so that `review summary` wins over `review`
    headers: Vec<(Section, String)>,
    dashes: Vec<char>,
    max_line_chars: usize,
    max_suggestions: usize,
}

impl Default for Grammar {
    #[inline]
    fn default() -> Self {
        let mut grammar = Self {
            headers: DEFAULT_HEADERS
                .iter()
                .map(|(section, spelling)| (*section, (*spelling).to_string()))
                .collect(),
            dashes: vec!['-', '\u{2013}', '\u{2014}'],
            max_line_chars: DEFAULT_MAX_LINE_CHARS,
            max_suggestions: DEFAULT_MAX_SUGGESTIONS,
        };
        grammar.sort_headers();
        grammar
    }
}

impl Grammar {
    /// Accept another spelling for a section header
    #[inline]
    pub fn with_header(mut self, section: Section, spelling: &str) -> Self {
        let spelling = spelling.trim().to_lowercase();
        if !spelling.is_empty() && !self.headers.iter().any(|(s, existing)| *s == section && *existing == spelling) {
            self.headers.push((section, spelling));
            self.sort_headers();
        }
        self
    }

    /// Accept another character between the start and end of a line range
    #[inline]
    pub fn with_dash(mut self, dash: char) -> Self {
        if !dash.is_ascii_digit() && !dash.is_whitespace() && !self.dashes.contains(&dash) {
            self.dashes.push(dash);
        }
        self
    }

    #[inline]
    pub fn with_max_line_chars(mut self, max_line_chars: usize) -> Self {
        self.max_line_chars = max_line_chars.max(1);
        self
    }

    #[inline]
    pub fn with_max_suggestions(mut self, max_suggestions: usize) -> Self {
        self.max_suggestions = max_suggestions;
        self
    }

    #[inline]
    pub fn dashes(&self) -> &[char] {
        &self.dashes
    }

    #[inline]
    pub fn max_line_chars(&self) -> usize {
        self.max_line_chars
    }

    #[inline]
    pub fn max_suggestions(&self) -> usize {
        self.max_suggestions
    }

    fn sort_headers(&mut self) {
        self.headers
            .sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.1.cmp(&b.1)));
    }

    /// Recognize a header line.
    ///
    /// Markdown headings (`## Verdict`, `### 🔍 Suggestion a.rs:3`) match on their leading
    /// keyword. Bold keys (`**Verdict:** APPROVE`) and tags (`<summary>`) must name the section
    /// exactly. Plain `Key: value` lines only count for the top-level sections and never
    /// inside a suggestion, where they are far more likely to be prose.
    #[inline]
    pub fn match_header<'a>(&self, line: &'a str, in_suggestion: bool) -> Option<Header<'a>> {
        let trimmed = line.trim();

        if let Some(heading) = trimmed.strip_prefix('#') {
            let text = heading.trim_start_matches('#').trim();
            return self.keyword_prefix(text).map(|(section, rest)| Header {
                section: Some(section),
                rest,
                closing: false,
            });
        }

        if let Some((name, rest, closing)) = split_tag(trimmed) {
            return Some(Header {
                section: self.exact_keyword(&name.replace('_', " ")),
                rest,
                closing,
            });
        }

        let (key, rest, bold) = split_key(trimmed)?;
        let section = self.exact_keyword(key)?;
        if !bold
            && (in_suggestion
                || !matches!(
                    section,
                    Section::Summary | Section::Verdict | Section::Suggestions
                ))
        {
            return None;
        }
        Some(Header {
            section: Some(section),
            rest,
            closing: false,
        })
    }

    /// Recognize a `Key: value` metadata line in any of the bold, plain or tag forms.
    #[inline]
    pub fn match_field<'a>(&self, line: &'a str) -> Option<(Field, &'a str)> {
        let trimmed = line.trim();
        let trimmed = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .unwrap_or(trimmed)
            .trim_start();

        let (key, value) = match split_tag(trimmed) {
            Some((name, value, false)) => (name, value),
            Some((_, _, true)) => return None,
            None => {
                let (key, value, _) = split_key(trimmed)?;
                (key, value)
            }
        };

        let key = key.replace('_', " ");
        FIELDS
            .iter()
            .find(|(_, spelling)| spelling.eq_ignore_ascii_case(key.trim()))
            .map(|(field, _)| (*field, value))
    }

    /// First `N` or `N<dash>M` in `text`. Ranges may prefix the end with `L`, as in `L10-L12`.
    #[inline]
    pub fn parse_line_range(&self, text: &str) -> Option<(u32, u32)> {
        let start_at = text.find(|c: char| c.is_ascii_digit())?;
        let rest = text.get(start_at..)?;
        let (start, rest) = leading_number(rest)?;

        let after_space = rest.trim_start();
        let Some(dash) = after_space.chars().next().filter(|c| self.dashes.contains(c)) else {
            return Some((start, start));
        };
        let after_dash = after_space.get(dash.len_utf8()..).unwrap_or_default().trim_start();
        let after_dash = after_dash
            .strip_prefix(['L', 'l'])
            .unwrap_or(after_dash);

        match leading_number(after_dash) {
            Some((end, _)) => Some((start, end)),
            None => Some((start, start)),
        }
    }

    fn keyword_prefix<'a>(&self, text: &'a str) -> Option<(Section, &'a str)> {
        // Emoji, numbering and decoration before the keyword
        let text = text.trim_start_matches(|c: char| !c.is_alphabetic());

        self.headers.iter().find_map(|(section, spelling)| {
            let prefix = text.get(..spelling.len())?;
            if !prefix.eq_ignore_ascii_case(spelling) {
                return None;
            }
            let rest = text.get(spelling.len()..)?;
            if rest.chars().next().is_some_and(char::is_alphanumeric) {
                return None;
            }
            Some((*section, trim_rest(rest)))
        })
    }

    fn exact_keyword(&self, key: &str) -> Option<Section> {
        let key = key
            .trim_start_matches(|c: char| !c.is_alphabetic())
            .trim();
        self.headers
            .iter()
            .find(|(_, spelling)| spelling.eq_ignore_ascii_case(key))
            .map(|(section, _)| *section)
    }
}

fn trim_rest(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '*' || c.is_whitespace())
}

/// `<name>`, `</name>` or `<name>value</name>` on one line
fn split_tag(line: &str) -> Option<(&str, &str, bool)> {
    let inner = line.strip_prefix('<')?;
    let close = inner.find('>')?;
    let name = inner.get(..close)?;
    let (name, closing) = match name.strip_prefix('/') {
        Some(name) => (name, true),
        None => (name, false),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let after = inner.get(close + 1..)?;
    let value = match after.rfind("</") {
        Some(end) if after.get(end + 2..)?.trim_end_matches('>') == name => after.get(..end)?,
        _ => after,
    };
    Some((name, value.trim(), closing))
}

/// `**Key:** value`, `**Key**: value` or `Key: value`; the flag reports the bold form
fn split_key(line: &str) -> Option<(&str, &str, bool)> {
    if let Some(inner) = line.strip_prefix("**") {
        let end = inner.find("**")?;
        let key = inner.get(..end)?.trim().trim_end_matches(':').trim();
        let rest = inner.get(end + 2..)?.trim_start_matches(':').trim();
        return (!key.is_empty()).then_some((key, rest, true));
    }

    let colon = line.find(':')?;
    let key = line.get(..colon)?.trim();
    if key.is_empty()
        || key.chars().count() > MAX_KEY_CHARS
        || !key.chars().all(|c| c.is_alphabetic() || c == ' ' || c == '_')
    {
        return None;
    }
    Some((key, line.get(colon + 1..)?.trim(), false))
}

/// Parse leading ASCII digits; values that overflow are rejected
fn leading_number(text: &str) -> Option<(u32, &str)> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let number = text.get(..end)?.parse().ok()?;
    Some((number, text.get(end..)?))
}
