use super::*;

#[test]
fn rust_module_paths() {
    assert_eq!(rust_module_path("src/lib.rs"), "crate");
    assert_eq!(rust_module_path("src/main.rs"), "crate");
    assert_eq!(
        rust_module_path("src/database/vector/mod.rs"),
        "crate::database::vector"
    );
    assert_eq!(rust_module_path("crates/core/src/sync/git.rs"), "crate::sync::git");
}

#[test]
fn rust_use_paths_expand_to_prefixes() {
    let content = "use crate::database::vector::{ChunkKind, IndexedDocument};\n\
                   pub(crate) use serde::Serialize;\n\
                   use super::Language;\n\
                   fn main() {}\n";
    let meta = extract_metadata(content, "src/review/mod.rs");

    assert_eq!(meta.package_name.as_deref(), Some("crate::review"));
    assert!(meta.imports.contains(&"crate::database".to_string()));
    assert!(meta.imports.contains(&"crate::database::vector".to_string()));
    assert!(meta.imports.contains(&"serde".to_string()));
    assert!(meta.imports.contains(&"serde::Serialize".to_string()));
    assert!(meta.imports.contains(&"super::Language".to_string()));
    assert!(!meta.imports.contains(&"crate".to_string()));
    assert!(!meta.imports.contains(&"super".to_string()));
}

#[test]
fn go_package_and_imports() {
    let content = r#"package server

import "fmt"

import (
    "net/http"
    log "github.com/sirupsen/logrus"
)

func main() {}
"#;
    let meta = extract_metadata(content, "cmd/server/main.go");

    assert_eq!(meta.package_name.as_deref(), Some("server"));
    assert_eq!(
        meta.imports,
        vec![
            "fmt".to_string(),
            "github.com/sirupsen/logrus".to_string(),
            "net/http".to_string(),
        ]
    );
}

#[test]
fn python_modules() {
    assert_eq!(python_module_path("app/models/user.py"), "app.models.user");
    assert_eq!(python_module_path("app/models/__init__.py"), "app.models");

    let content = "import os, sys\nfrom app.models import User\nfrom . import views\nfrom ..core import db\n";
    let meta = extract_metadata(content, "app/api/routes.py");

    assert_eq!(meta.package_name.as_deref(), Some("app.api.routes"));
    assert_eq!(
        meta.imports,
        vec![
            "app.models".to_string(),
            "core".to_string(),
            "os".to_string(),
            "sys".to_string(),
        ]
    );
}

#[test]
fn script_relative_imports_resolve_to_repo_paths() {
    let content = r#"import x from './utils';
import { y } from '../lib/format.js';
import React from 'react';
const z = require('./helpers/index');
"#;
    let meta = extract_metadata(content, "src/app/main.ts");

    assert_eq!(meta.package_name.as_deref(), Some("src/app/main"));
    assert!(meta.imports.contains(&"src/app/utils".to_string()));
    assert!(meta.imports.contains(&"src/lib/format".to_string()));
    assert!(meta.imports.contains(&"src/app/helpers".to_string()));
    assert!(meta.imports.contains(&"react".to_string()));
}

#[test]
fn index_files_are_named_by_directory() {
    let meta = extract_metadata("export const a = 1;\n", "src/utils/index.js");
    assert_eq!(meta.package_name.as_deref(), Some("src/utils"));
}

#[test]
fn jvm_imports_include_parent_package() {
    let content = "package com.example.api;\n\nimport com.example.db.UserRepository;\nimport static org.junit.Assert.*;\n";
    let meta = extract_metadata(content, "src/main/java/com/example/api/UserController.java");

    assert_eq!(meta.package_name.as_deref(), Some("com.example.api"));
    assert!(meta.imports.contains(&"com.example.db".to_string()));
    assert!(meta.imports.contains(&"com.example.db.UserRepository".to_string()));
    assert!(meta.imports.contains(&"org.junit.Assert".to_string()));
}

#[test]
fn c_includes_and_file_package() {
    let content = "#include <stdio.h>\n#include \"util/buffer.h\"\n";
    let meta = extract_metadata(content, "src/buffer.c");

    assert_eq!(meta.package_name.as_deref(), Some("buffer.c"));
    assert_eq!(
        meta.imports,
        vec!["stdio.h".to_string(), "util/buffer.h".to_string()]
    );
}

#[test]
fn unknown_language_has_no_metadata() {
    let meta = extract_metadata("import foo\n", "notes.txt");
    assert_eq!(meta, FileMetadata::default());
}
