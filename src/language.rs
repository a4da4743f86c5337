//! Static language table.
//!
//! Maps language identifiers (including versioned aliases such as
//! `python3.12` or `node18`) to a runtime image, the filename the code is
//! written to, and the shell template that compiles and runs it.

use crate::error::{Result, SandboxError};

/// How a language is debugged inside its session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLauncher {
    /// Command line started detached. `{file}`, `{dir}` and `{port}` are substituted.
    pub command: &'static str,
    /// Default port the debug server listens on.
    pub port: u16,
    /// Filename the debuggee source is written to.
    pub filename: &'static str,
}

/// One entry of the language table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    /// Canonical identifier.
    pub id: &'static str,
    /// Default runtime image.
    pub image: &'static str,
    /// Filename the code is written to before running.
    pub filename: &'static str,
    /// Shell template run after the file is written. `{file}` and `{dir}` are substituted.
    pub run: &'static str,
    /// Debug launcher, when the language supports debugging.
    pub debug: Option<DebugLauncher>,
}

const PYTHON_DEBUG: DebugLauncher = DebugLauncher {
    command: "python3 -m debugpy --listen 0.0.0.0:{port} --wait-for-client {file}",
    port: 5678,
    filename: "user_script.py",
};

const GO_DEBUG: DebugLauncher = DebugLauncher {
    command: "cd {dir} && (command -v dlv >/dev/null || go install github.com/go-delve/delve/cmd/dlv@latest) && $(go env GOPATH)/bin/dlv debug --headless --listen=:{port} --api-version=2 --accept-multiclient {file}",
    port: 5678,
    filename: "main.go",
};

const fn spec(
    id: &'static str,
    image: &'static str,
    filename: &'static str,
    run: &'static str,
) -> LanguageSpec {
    LanguageSpec {
        id,
        image,
        filename,
        run,
        debug: None,
    }
}

const fn debuggable(mut spec: LanguageSpec, debug: DebugLauncher) -> LanguageSpec {
    spec.debug = Some(debug);
    spec
}

const PYTHON_RUN: &str = "python3 -u {file}";
const NODE_RUN: &str = "node {file}";
const JAVA_RUN: &str = "javac -d {dir} {file} 2>&1 && java -cp {dir} Main";
const GO_RUN: &str = "cd {dir} && go run {file}";
const RUST_RUN: &str = "rustc {file} -o {dir}/code 2>&1 && {dir}/code";

/// Table entries keyed by every accepted identifier.
static LANGUAGES: &[(&str, LanguageSpec)] = &[
    ("python", debuggable(spec("python", "sandbox-python:latest", "code.py", PYTHON_RUN), PYTHON_DEBUG)),
    ("py", debuggable(spec("python", "sandbox-python:latest", "code.py", PYTHON_RUN), PYTHON_DEBUG)),
    ("python3.10", debuggable(spec("python3.10", "python:3.10-alpine", "code.py", PYTHON_RUN), PYTHON_DEBUG)),
    ("python3.12", debuggable(spec("python3.12", "python:3.12-alpine", "code.py", PYTHON_RUN), PYTHON_DEBUG)),
    ("javascript", spec("javascript", "node:20-alpine", "code.js", NODE_RUN)),
    ("js", spec("javascript", "node:20-alpine", "code.js", NODE_RUN)),
    ("node", spec("javascript", "node:20-alpine", "code.js", NODE_RUN)),
    ("node18", spec("node18", "node:18-alpine", "code.js", NODE_RUN)),
    ("node19", spec("node19", "node:19-alpine", "code.js", NODE_RUN)),
    ("typescript", spec("typescript", "node:20-alpine", "code.ts", "cd {dir} && npx -y -p typescript tsc {file} 2>&1 && node {dir}/code.js")),
    ("ts", spec("typescript", "node:20-alpine", "code.ts", "cd {dir} && npx -y -p typescript tsc {file} 2>&1 && node {dir}/code.js")),
    ("java", spec("java", "eclipse-temurin:17-alpine", "Main.java", JAVA_RUN)),
    ("java11", spec("java11", "eclipse-temurin:11-alpine", "Main.java", JAVA_RUN)),
    ("java21", spec("java21", "eclipse-temurin:21-alpine", "Main.java", JAVA_RUN)),
    ("c", spec("c", "gcc:latest", "code.c", "gcc -o {dir}/code {file} 2>&1 && {dir}/code")),
    ("cpp", spec("cpp", "gcc:latest", "code.cpp", "g++ -o {dir}/code {file} 2>&1 && {dir}/code")),
    ("go", debuggable(spec("go", "golang:1.21-alpine", "main.go", GO_RUN), GO_DEBUG)),
    ("go1.20", debuggable(spec("go1.20", "golang:1.20-alpine", "main.go", GO_RUN), GO_DEBUG)),
    ("go1.22", debuggable(spec("go1.22", "golang:1.22-alpine", "main.go", GO_RUN), GO_DEBUG)),
    ("rust", spec("rust", "rust:1.70-alpine", "code.rs", RUST_RUN)),
    ("rust1.69", spec("rust1.69", "rust:1.69-alpine", "code.rs", RUST_RUN)),
    ("rust1.71", spec("rust1.71", "rust:1.71-alpine", "code.rs", RUST_RUN)),
    ("ruby", spec("ruby", "ruby:3.2-alpine", "code.rb", "ruby {file}")),
    ("ruby3.1", spec("ruby3.1", "ruby:3.1-alpine", "code.rb", "ruby {file}")),
    ("ruby3.3", spec("ruby3.3", "ruby:3.3-alpine", "code.rb", "ruby {file}")),
    ("php", spec("php", "php:8.2-alpine", "code.php", "php {file}")),
    ("php8.1", spec("php8.1", "php:8.1-alpine", "code.php", "php {file}")),
    ("php8.3", spec("php8.3", "php:8.3-alpine", "code.php", "php {file}")),
    ("swift", spec("swift", "swift:5.9", "code.swift", "swift {file}")),
    ("kotlin", spec("kotlin", "openjdk:17-alpine", "code.kt", "kotlinc {file} -include-runtime -d {dir}/code.jar && java -jar {dir}/code.jar")),
    ("scala", spec("scala", "openjdk:17-alpine", "code.scala", "cd {dir} && scalac {file} && scala Main")),
    ("r", spec("r", "r-base:latest", "code.R", "Rscript {file}")),
    ("julia", spec("julia", "julia:1.9", "code.jl", "julia {file}")),
    ("perl", spec("perl", "perl:5.36", "code.pl", "perl {file}")),
    ("bash", spec("bash", "bash:latest", "code.sh", "bash {file}")),
    ("shell", spec("bash", "bash:latest", "code.sh", "bash {file}")),
];

/// Look up a language by identifier, case-insensitively.
pub fn resolve(language: &str) -> Result<&'static LanguageSpec> {
    let wanted = language.trim().to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, spec)| spec)
        .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
}

/// Canonical identifier for a language. Aliases of one runtime share it.
pub fn normalize(language: &str) -> Result<&'static str> {
    Ok(resolve(language)?.id)
}

/// Every accepted identifier.
pub fn supported_languages() -> Vec<&'static str> {
    LANGUAGES.iter().map(|(name, _)| *name).collect()
}

/// Identifiers that can be debugged.
pub fn debuggable_languages() -> Vec<&'static str> {
    LANGUAGES
        .iter()
        .filter(|(_, spec)| spec.debug.is_some())
        .map(|(name, _)| *name)
        .collect()
}

/// Where the source for `spec` lives inside a session directory.
pub fn source_path(spec: &LanguageSpec, dir: &str) -> String {
    format!("{dir}/{}", spec.filename)
}

/// Shell command that compiles and runs the already-written source.
pub fn run_command(spec: &LanguageSpec, dir: &str) -> String {
    fill(spec.run, &source_path(spec, dir), dir)
}

/// Debug server command line for a debuggee file inside `dir`.
pub fn debug_command(launcher: &DebugLauncher, dir: &str, port: u16) -> String {
    let file = format!("{dir}/{}", launcher.filename);
    fill(launcher.command, &file, dir).replace("{port}", &port.to_string())
}

fn fill(template: &str, file: &str, dir: &str) -> String {
    template.replace("{file}", file).replace("{dir}", dir)
}
