//! Architectural Enforcement Integration Tests
//!
//! Source-scanning checks for the rules the communication core depends on:
//! - No private polling thread: work happens only inside `progress()`
//! - No sleep() calls in production code
//!
//! Production code is everything in a file before its first `#[cfg(test)]`.

use std::fs;
use std::path::{Path, PathBuf};

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Path of a workspace directory, relative to the workspace root
#[must_use]
pub fn workspace_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}

/// Scan every `.rs` file under `dir` for production lines containing any
/// of `patterns`
#[must_use]
pub fn scan_directory(dir: &Path, patterns: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            if let Ok(content) = fs::read_to_string(entry.path()) {
                violations.extend(scan_source(entry.path(), &content, patterns));
            }
        }
    }
    violations
}

/// Scan one file's contents
#[must_use]
pub fn scan_source(path: &Path, content: &str, patterns: &[&str]) -> Vec<Violation> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter_map(|(idx, line)| {
            // Skip comments
            let code = line.split("//").next().unwrap_or(line);
            patterns.iter().any(|p| code.contains(p)).then(|| Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                text: line.trim().to_string(),
            })
        })
        .collect()
}

/// Print violations and fail the calling test
///
/// # Panics
///
/// Panics when `violations` is not empty.
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_stops_at_test_module() {
        let source = "fn run() {\n    work();\n}\n\n#[cfg(test)]\nmod tests {\n    fn t() { std::thread::sleep(d); }\n}\n";
        let found = scan_source(Path::new("x.rs"), source, &["::sleep("]);
        assert!(found.is_empty());
    }

    #[test]
    fn test_scan_ignores_comments_and_reports_lines() {
        let source = "// std::thread::spawn(f)\nlet h = std::thread::spawn(f);\n";
        let found = scan_source(Path::new("x.rs"), source, &["thread::spawn("]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
    }
}
