
pub mod metadata;

pub use metadata::{FileMetadata, extract_metadata};

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use crate::database::vector::{MAX_PARENT_TEXT_CHARS, chunk_id, truncate_chars};

/// Source language, detected from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Go,
    Python,
    JavaScript,
    TypeScript,
    Java,
    Kotlin,
    Scala,
    Swift,
    CSharp,
    C,
    Cpp,
    Ruby,
    Php,
    Unknown,
}

impl Language {
    #[inline]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Language::Rust,
            "go" => Language::Go,
            "py" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "java" => Language::Java,
            "kt" | "kts" => Language::Kotlin,
            "scala" => Language::Scala,
            "swift" => Language::Swift,
            "cs" => Language::CSharp,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            _ => Language::Unknown,
        }
    }

    /// Human-readable name, as addressed in prompts
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Language::Rust => "Rust",
            Language::Go => "Go",
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::Java => "Java",
            Language::Kotlin => "Kotlin",
            Language::Scala => "Scala",
            Language::Swift => "Swift",
            Language::CSharp => "C#",
            Language::C => "C",
            Language::Cpp => "C++",
            Language::Ruby => "Ruby",
            Language::Php => "PHP",
            Language::Unknown => "software",
        }
    }
}

/// Configuration for code chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Declarations longer than this are split into windows that point back at their parent
    pub max_chunk_lines: usize,
    /// Window size for files without recognizable declarations
    pub window_lines: usize,
    pub overlap_lines: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_chunk_lines: 120,
            window_lines: 60,
            overlap_lines: 10,
        }
    }
}

impl ChunkingConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_lines == 0 || self.window_lines == 0 {
            return Err("chunk sizes must be positive".to_string());
        }
        if self.overlap_lines >= self.window_lines {
            return Err(format!(
                "overlap ({}) must be smaller than the window ({})",
                self.overlap_lines, self.window_lines
            ));
        }
        Ok(())
    }
}

/// A slice of a source file ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    pub content: String,
    pub identifier: Option<String>,
    /// Declaration kind (`function`, `class`, ...), `preamble` or `window`
    pub kind: String,
    /// 1-based, inclusive
    pub line_start: u32,
    pub line_end: u32,
    pub parent_id: Option<String>,
    pub full_parent_text: Option<String>,
}

struct Declaration {
    kind: &'static str,
    name: String,
    /// 0-based line index, including attached comments
    start: usize,
}

type Pattern = (Regex, &'static str);

fn pattern(regex: &str, kind: &'static str) -> Pattern {
    (Regex::new(regex).expect("valid regex"), kind)
}

static RUST_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let vis = r"^(?:pub(?:\([^)]*\))?\s+)?";
    vec![
        pattern(
            &format!(r#"{vis}(?:(?:const|async|unsafe|extern\s+"[^"]*")\s+)*fn\s+(?P<name>\w+)"#),
            "function",
        ),
        pattern(&format!(r"{vis}struct\s+(?P<name>\w+)"), "struct"),
        pattern(&format!(r"{vis}enum\s+(?P<name>\w+)"), "enum"),
        pattern(&format!(r"{vis}union\s+(?P<name>\w+)"), "union"),
        pattern(&format!(r"{vis}(?:unsafe\s+)?trait\s+(?P<name>\w+)"), "trait"),
        pattern(&format!(r"{vis}mod\s+(?P<name>\w+)\s*\{{"), "module"),
        pattern(&format!(r"{vis}type\s+(?P<name>\w+)"), "type"),
        pattern(
            r"^(?:unsafe\s+)?impl(?:<[^>]*>)?\s+(?:[\w:]+(?:<[^>]*>)?\s+for\s+)?(?P<name>\w+)",
            "impl",
        ),
        pattern(r"^macro_rules!\s*(?P<name>\w+)", "macro"),
    ]
});

static GO_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(r"^func\s+(?:\([^)]*\)\s*)?(?P<name>\w+)", "function"),
        pattern(r"^type\s+(?P<name>\w+)", "type"),
    ]
});

static PYTHON_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(r"^(?:async\s+)?def\s+(?P<name>\w+)", "function"),
        pattern(r"^class\s+(?P<name>\w+)", "class"),
    ]
});

static SCRIPT_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let export = r"^(?:export\s+)?(?:default\s+)?";
    vec![
        pattern(
            &format!(r"{export}(?:async\s+)?function\*?\s*(?P<name>\w+)"),
            "function",
        ),
        pattern(
            &format!(r"{export}(?:abstract\s+)?class\s+(?P<name>\w+)"),
            "class",
        ),
        pattern(
            &format!(r"{export}(?:declare\s+)?(?:interface|enum)\s+(?P<name>\w+)"),
            "interface",
        ),
        pattern(&format!(r"{export}type\s+(?P<name>\w+)\s*(?:<[^>]*>)?\s*="), "type"),
        pattern(
            &format!(r"{export}(?:const|let|var)\s+(?P<name>\w+)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function|\([^)]*\)\s*(?::\s*[^=]+)?=>|\w+\s*=>)"),
            "function",
        ),
    ]
});

static JVM_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let modifiers = r"^(?:@\w+(?:\([^)]*\))?\s+)*(?:(?:public|private|protected|internal|abstract|final|static|sealed|open|data|partial|case|inline|override|suspend|export)\s+)*";
    vec![
        pattern(
            &format!(r"{modifiers}(?:class|interface|enum|record|struct|object|trait|protocol|extension)\s+(?P<name>\w+)"),
            "class",
        ),
        pattern(
            &format!(r"{modifiers}(?:fun|func|def)\s+(?:<[^>]*>\s*)?(?:\w+\.)?(?P<name>\w+)"),
            "function",
        ),
        pattern(r"^namespace\s+(?P<name>[\w.]+)\s*\{", "namespace"),
    ]
});

static C_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(
            r"^(?:typedef\s+)?(?:struct|class|enum|union)\s+(?P<name>\w+)[^;]*$",
            "type",
        ),
        pattern(r"^namespace\s+(?P<name>\w+)", "namespace"),
        pattern(
            r"^(?!(?:return|if|else|while|for|switch|case|do|typedef|using|#)\b)[A-Za-z_][\w:<>,\s\*&]*?[\s\*&](?P<name>[A-Za-z_][\w:~]*)\s*\([^;]*$",
            "function",
        ),
    ]
});

static RUBY_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(r"^def\s+(?:self\.)?(?P<name>[\w?!=]+)", "function"),
        pattern(r"^class\s+(?P<name>[\w:]+)", "class"),
        pattern(r"^module\s+(?P<name>[\w:]+)", "module"),
    ]
});

static PHP_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(
            r"^(?:(?:abstract|final|readonly)\s+)*(?:class|interface|trait|enum)\s+(?P<name>\w+)",
            "class",
        ),
        pattern(r"^function\s+(?P<name>\w+)", "function"),
    ]
});

fn patterns_for(language: Language) -> &'static [Pattern] {
    match language {
        Language::Rust => &RUST_PATTERNS,
        Language::Go => &GO_PATTERNS,
        Language::Python => &PYTHON_PATTERNS,
        Language::JavaScript | Language::TypeScript => &SCRIPT_PATTERNS,
        Language::Java
        | Language::Kotlin
        | Language::Scala
        | Language::Swift
        | Language::CSharp => &JVM_PATTERNS,
        Language::C | Language::Cpp => &C_PATTERNS,
        Language::Ruby => &RUBY_PATTERNS,
        Language::Php => &PHP_PATTERNS,
        Language::Unknown => &[],
    }
}

/// Lines that belong to the declaration that follows them
fn is_attached_prefix(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty()
        && (trimmed.starts_with("//")
            || trimmed.starts_with("/*")
            || trimmed.starts_with('*')
            || trimmed.starts_with("#[")
            || trimmed.starts_with('@')
            || trimmed.starts_with("# ")
            || trimmed.starts_with("///"))
}

fn find_declarations(lines: &[&str], language: Language) -> Vec<Declaration> {
    let patterns = patterns_for(language);
    let mut declarations: Vec<Declaration> = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        // Only top-level declarations start a chunk
        if line.starts_with(char::is_whitespace) || line.is_empty() {
            continue;
        }

        let matched = patterns.iter().find_map(|(regex, kind)| {
            regex
                .captures(line)
                .ok()
                .flatten()
                .and_then(|caps| caps.name("name").map(|m| (*kind, m.as_str().to_string())))
        });
        let Some((kind, name)) = matched else {
            continue;
        };

        let floor = declarations.last().map_or(0, |d| d.start + 1);
        let mut start = index;
        while start > floor && is_attached_prefix(lines[start - 1]) {
            start -= 1;
        }

        declarations.push(Declaration { kind, name, start });
    }

    declarations
}

fn join_lines(lines: &[&str], start: usize, end: usize) -> String {
    lines
        .get(start..end)
        .map(|slice| slice.join("\n"))
        .unwrap_or_default()
}

fn to_line_number(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

/// Split `[start, end)` into overlapping windows
fn windows(start: usize, end: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let step = window.saturating_sub(overlap).max(1);
    let mut ranges = Vec::new();
    let mut begin = start;
    while begin < end {
        let finish = (begin + window).min(end);
        ranges.push((begin, finish));
        if finish == end {
            break;
        }
        begin += step;
    }
    ranges
}

/// Chunk a source file along top-level declarations.
///
/// Declarations longer than `max_chunk_lines` are windowed; each window carries
/// the declaration's id and text as its parent. Files with no recognizable
/// declarations fall back to plain overlapping windows.
#[inline]
pub fn chunk_code(content: &str, path: &str, config: &ChunkingConfig) -> Vec<CodeChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.iter().all(|line| line.trim().is_empty()) {
        return Vec::new();
    }

    let language = Language::from_path(Path::new(path));
    let declarations = find_declarations(&lines, language);

    let mut chunks = Vec::new();
    if declarations.is_empty() {
        for (start, end) in windows(0, lines.len(), config.window_lines, config.overlap_lines) {
            push_chunk(&mut chunks, &lines, start, end, "window", None);
        }
        debug!("Chunked {} into {} windows", path, chunks.len());
        return chunks;
    }

    if let Some(first) = declarations.first() {
        push_chunk(&mut chunks, &lines, 0, first.start, "preamble", None);
    }

    for (i, declaration) in declarations.iter().enumerate() {
        let mut end = declarations
            .get(i + 1)
            .map_or(lines.len(), |next| next.start);
        while end > declaration.start + 1 && lines[end - 1].trim().is_empty() {
            end -= 1;
        }

        let name = Some(declaration.name.clone());
        if end - declaration.start <= config.max_chunk_lines {
            push_chunk(&mut chunks, &lines, declaration.start, end, declaration.kind, name);
            continue;
        }

        let parent_id = chunk_id(path, to_line_number(declaration.start), to_line_number(end - 1));
        let parent_text = truncate_chars(
            &join_lines(&lines, declaration.start, end),
            MAX_PARENT_TEXT_CHARS,
        );
        for (start, finish) in windows(
            declaration.start,
            end,
            config.max_chunk_lines,
            config.overlap_lines.min(config.max_chunk_lines.saturating_sub(1)),
        ) {
            let before = chunks.len();
            push_chunk(&mut chunks, &lines, start, finish, declaration.kind, name.clone());
            if let Some(chunk) = chunks.get_mut(before) {
                chunk.parent_id = Some(parent_id.clone());
                chunk.full_parent_text = Some(parent_text.clone());
            }
        }
    }

    debug!(
        "Chunked {} into {} chunks from {} declarations",
        path,
        chunks.len(),
        declarations.len()
    );
    chunks
}

fn push_chunk(
    chunks: &mut Vec<CodeChunk>,
    lines: &[&str],
    start: usize,
    end: usize,
    kind: &str,
    identifier: Option<String>,
) {
    let content = join_lines(lines, start, end);
    if content.trim().is_empty() {
        return;
    }
    chunks.push(CodeChunk {
        content,
        identifier,
        kind: kind.to_string(),
        line_start: to_line_number(start),
        line_end: to_line_number(end.saturating_sub(1)),
        parent_id: None,
        full_parent_text: None,
    });
}

/// Whether a path follows its language's test-file naming convention
#[inline]
pub fn is_test_file(path: &str) -> bool {
    let path = Path::new(path);
    let base = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();

    match Language::from_path(path) {
        Language::Go => base.ends_with("_test.go"),
        Language::JavaScript | Language::TypeScript => [
            ".test.ts", ".test.js", ".spec.ts", ".spec.js", ".test.tsx", ".spec.tsx",
            ".test.jsx", ".spec.jsx",
        ]
        .iter()
        .any(|suffix| base.ends_with(suffix)),
        Language::Python => base.starts_with("test_") || base.ends_with("_test.py"),
        Language::Rust => {
            base.ends_with("_test.rs")
                || base == "tests.rs"
                || path.components().next().is_some_and(|c| c.as_os_str() == "tests")
        }
        Language::Java | Language::Kotlin => {
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            stem.ends_with("Test") || stem.ends_with("Tests")
        }
        _ => false,
    }
}
