use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees held to the code policy. The sample data and reference
// material elsewhere in the checkout are not scanned.
const POLICY_ROOTS: [&str; 3] = ["qc", "src", "tests"];

// One policy rule: a line pattern plus the explanation printed on failure.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    comments_only: bool,
}

const RULES: [Rule; 3] = [
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        advice: "Either use the binding under its real name or remove it completely.",
        comments_only: false,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        advice: "Either use the item or delete it.",
        comments_only: false,
    },
    Rule {
        name: "edit-history comments",
        pattern: r"(//|/\*).*\b(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)\b",
        advice: "Comments describe the code as it is, not how it got there.",
        comments_only: true,
    },
];

// Collects the offending lines of one file for one rule.
struct PolicyCollector<'r> {
    rule: &'r Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'r> PolicyCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!(
            "\n⚠️ {} are not allowed in this project.\n   {}\n",
            self.rule.name, self.rule.advice
        ));
        Some(message)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

// True when every occurrence of the match sits inside a string literal.
fn only_in_strings(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .all(|(i, part)| i % 2 == 1 || !part.contains('_'))
}

impl Sink for PolicyCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        let skip = if self.rule.comments_only {
            !is_comment(line_text)
        } else {
            is_comment(line_text) || (line_text.contains('"') && only_in_strings(line_text))
        };
        if !skip {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn policy_files() -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from("build.rs")];
    for root in POLICY_ROOTS {
        println!("cargo:rerun-if-changed={root}");
        files.extend(
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path()),
        );
    }
    files
}

fn scan(files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in files {
            // The rule table itself spells out every forbidden pattern.
            if rule.comments_only && path.as_path() == Path::new("build.rs") {
                continue;
            }
            let mut collector = PolicyCollector::new(rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(message) = collector.error_message() {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if let Err(e) = scan(&policy_files()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
