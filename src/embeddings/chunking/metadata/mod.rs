// File-level metadata: the package a file declares and the packages it imports
// Dependents of a changed file are found by matching its package against other files' imports

#[cfg(test)]
mod tests;

use fancy_regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use super::Language;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub package_name: Option<String>,
    pub imports: Vec<String>,
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static GO_PACKAGE: LazyLock<Regex> = LazyLock::new(|| regex(r"^package\s+(\w+)"));
static GO_IMPORT_SINGLE: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"^import\s+(?:[\w.]+\s+)?"([^"]+)""#));
static GO_IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r#"^\s*(?:[\w.]+\s+)?"([^"]+)""#));
static RUST_USE: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([\w:]+)"));
static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| regex(r"^import\s+([\w.]+(?:\s*,\s*[\w.]+)*)"));
static PY_FROM: LazyLock<Regex> = LazyLock::new(|| regex(r"^from\s+([\w.]+)\s+import\b"));
static JS_FROM: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?:^import\s+(?:[^'"]*\s+from\s+)?|^export\s+[^'"]*\s+from\s+)['"]([^'"]+)['"]"#));
static JS_REQUIRE: LazyLock<Regex> = LazyLock::new(|| regex(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#));
static JVM_PACKAGE: LazyLock<Regex> = LazyLock::new(|| regex(r"^package\s+([\w.]+)"));
static JVM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^import\s+(?:static\s+)?(\w+(?:\.\w+)*)"));
static CSHARP_NAMESPACE: LazyLock<Regex> = LazyLock::new(|| regex(r"^namespace\s+([\w.]+)"));
static CSHARP_USING: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^using\s+(?:static\s+)?(?:\w+\s*=\s*)?([\w.]+)\s*;"));
static SWIFT_IMPORT: LazyLock<Regex> = LazyLock::new(|| regex(r"^import\s+(?:\w+\s+)?([\w.]+)"));
static C_INCLUDE: LazyLock<Regex> = LazyLock::new(|| regex(r#"^\s*#\s*include\s+["<]([^">]+)[">]"#));
static RUBY_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"^\s*require(?:_relative)?\s*\(?\s*['"]([^'"]+)['"]"#));
static PHP_NAMESPACE: LazyLock<Regex> = LazyLock::new(|| regex(r"^namespace\s+([\w\\]+)\s*;"));
static PHP_USE: LazyLock<Regex> = LazyLock::new(|| regex(r"^use\s+(?:function\s+|const\s+)?([\w\\]+)"));

fn capture(regex: &Regex, line: &str) -> Option<String> {
    regex
        .captures(line)
        .ok()
        .flatten()
        .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
}

/// Extract the declared package and imported packages of a source file.
///
/// `path` is repository-relative; languages without package declarations derive
/// the package from it so that relative imports elsewhere can be matched.
#[inline]
pub fn extract_metadata(content: &str, path: &str) -> FileMetadata {
    let language = Language::from_path(Path::new(path));
    let mut imports = BTreeSet::new();

    let package_name = match language {
        Language::Go => go_metadata(content, &mut imports),
        Language::Rust => rust_metadata(content, path, &mut imports),
        Language::Python => python_metadata(content, path, &mut imports),
        Language::JavaScript | Language::TypeScript => script_metadata(content, path, &mut imports),
        Language::Java | Language::Kotlin | Language::Scala => {
            jvm_metadata(content, &mut imports)
        }
        Language::CSharp => line_metadata(content, Some(&CSHARP_NAMESPACE), &CSHARP_USING, &mut imports),
        Language::Swift => line_metadata(content, None, &SWIFT_IMPORT, &mut imports),
        Language::C | Language::Cpp => {
            line_metadata(content, None, &C_INCLUDE, &mut imports);
            // Includes name files, so the file itself is the package
            Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .map(ToString::to_string)
        }
        Language::Ruby => line_metadata(content, None, &RUBY_REQUIRE, &mut imports),
        Language::Php => line_metadata(content, Some(&PHP_NAMESPACE), &PHP_USE, &mut imports),
        Language::Unknown => None,
    };

    FileMetadata {
        package_name,
        imports: imports.into_iter().collect(),
    }
}

/// Declared package from `package_re`, one import per matching line
fn line_metadata(
    content: &str,
    package_re: Option<&Regex>,
    import_re: &Regex,
    imports: &mut BTreeSet<String>,
) -> Option<String> {
    let mut package = None;
    for line in content.lines() {
        if package.is_none() {
            package = package_re.and_then(|re| capture(re, line));
        }
        if let Some(import) = capture(import_re, line) {
            imports.insert(import);
        }
    }
    package
}

fn go_metadata(content: &str, imports: &mut BTreeSet<String>) -> Option<String> {
    let mut package = None;
    let mut in_block = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if in_block {
            if trimmed.starts_with(')') {
                in_block = false;
            } else if let Some(import) = capture(&GO_IMPORT_LINE, line) {
                imports.insert(import);
            }
            continue;
        }
        if package.is_none() {
            package = capture(&GO_PACKAGE, line);
        }
        if trimmed.starts_with("import (") || trimmed == "import(" {
            in_block = true;
        } else if let Some(import) = capture(&GO_IMPORT_SINGLE, line) {
            imports.insert(import);
        }
    }
    package
}

fn jvm_metadata(content: &str, imports: &mut BTreeSet<String>) -> Option<String> {
    let mut package = None;
    for line in content.lines() {
        let line = line.trim_end_matches(';');
        if package.is_none() {
            package = capture(&JVM_PACKAGE, line);
        }
        if let Some(import) = capture(&JVM_IMPORT, line) {
            // `import a.b.C` makes the file a dependent of both `a.b.C` and package `a.b`
            if let Some((parent, _)) = import.rsplit_once('.') {
                imports.insert(parent.to_string());
            }
            imports.insert(import);
        }
    }
    package
}

/// Module path of a Rust source file relative to its crate root
fn rust_module_path(path: &str) -> String {
    let mut segments: Vec<String> = Path::new(path)
        .with_extension("")
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str().map(ToString::to_string),
            _ => None,
        })
        .collect();

    if let Some(src) = segments.iter().rposition(|s| s == "src") {
        segments.drain(..=src);
    }
    if matches!(
        segments.last().map(String::as_str),
        Some("mod" | "lib" | "main")
    ) {
        segments.pop();
    }

    std::iter::once("crate".to_string())
        .chain(segments)
        .collect::<Vec<_>>()
        .join("::")
}

fn rust_metadata(content: &str, path: &str, imports: &mut BTreeSet<String>) -> Option<String> {
    for line in content.lines() {
        let Some(use_path) = capture(&RUST_USE, line) else {
            continue;
        };
        let segments: Vec<&str> = use_path
            .trim_end_matches("::")
            .split("::")
            .filter(|s| !s.is_empty())
            .collect();
        // Relative roots alone say nothing about what is depended on
        let min_len = if matches!(segments.first(), Some(&("crate" | "self" | "super"))) {
            2
        } else {
            1
        };
        for len in min_len..=segments.len() {
            imports.insert(segments[..len].join("::"));
        }
    }
    Some(rust_module_path(path))
}

fn python_module_path(path: &str) -> String {
    let without_ext = Path::new(path).with_extension("");
    let mut parts: Vec<String> = without_ext
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str().map(ToString::to_string),
            _ => None,
        })
        .collect();
    if parts.last().is_some_and(|last| last == "__init__") {
        parts.pop();
    }
    parts.join(".")
}

fn python_metadata(content: &str, path: &str, imports: &mut BTreeSet<String>) -> Option<String> {
    for line in content.lines() {
        if let Some(module) = capture(&PY_FROM, line) {
            // `from . import x` names no package
            if module.chars().any(|c| c != '.') {
                imports.insert(module.trim_start_matches('.').to_string());
            }
        } else if let Some(modules) = capture(&PY_IMPORT, line) {
            imports.extend(modules.split(',').map(|m| m.trim().to_string()));
        }
    }
    Some(python_module_path(path))
}

/// Normalize `a/./b/../c` without touching the filesystem; `dir/index` names `dir`
fn normalize(path: &Path) -> String {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            _ => {}
        }
    }
    if out.file_name().is_some_and(|name| name == "index") {
        out.pop();
    }
    out.to_string_lossy().replace('\\', "/")
}

fn script_metadata(content: &str, path: &str, imports: &mut BTreeSet<String>) -> Option<String> {
    let dir = Path::new(path).parent().unwrap_or_else(|| Path::new(""));
    for line in content.lines() {
        let specifiers = capture(&JS_FROM, line)
            .into_iter()
            .chain(capture(&JS_REQUIRE, line));
        for specifier in specifiers {
            if specifier.starts_with('.') {
                // Relative imports resolve to a repository path without extension
                imports.insert(normalize(&dir.join(&specifier).with_extension("")));
            } else {
                imports.insert(specifier);
            }
        }
    }
    Some(normalize(&Path::new(path).with_extension("")))
}
