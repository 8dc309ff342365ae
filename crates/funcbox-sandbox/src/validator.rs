//! Registration-time code validator.
//!
//! Rule-based screening of function source before it is stored. The V8
//! isolate is the real security boundary; these checks reject obvious escape
//! attempts early and with a readable message.
//!
//! Reports are deterministic: rules run in registration order and pattern
//! matches are reported in source order.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::error::SandboxError;

/// Maximum source size in bytes (64 KiB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

static EVAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\beval\s*\(").unwrap());

static FUNCTION_CTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^.\w$])((?:new\s+)?Function\s*\()").unwrap());

// `data.process.status` is a property, not the global.
static HOST_GLOBALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^.\w$])((?:process|Deno)\b)").unwrap());

static REQUIRE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\brequire\s*\(").unwrap());

static IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bimport\s+.*\bfrom\b|\bimport\s*\(").unwrap());

static GLOBAL_MUTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:global|window|globalThis)\s*(?:\.\s*[\w$]+\s*=(?:[^=]|$)|\[)").unwrap()
});

static PROTOTYPE_ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"__proto__|\bconstructor\s*\.\s*constructor\b|\bconstructor\s*\[|\bObject\s*\.\s*setPrototypeOf\s*\(",
    )
    .unwrap()
});

static INFINITE_LOOP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"while\s*\(\s*true\s*\)|for\s*\(\s*;\s*;\s*\)").unwrap());

static MAIN_ENTRYPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bfunction\s+main\s*\(|\b(?:const|let|var)\s+main\s*=").unwrap()
});

static CONSOLE_LOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bconsole\.log\s*\(").unwrap());

static TODO_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"//\s*TODO\b").unwrap());

static DEBUGGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bdebugger\b").unwrap());

/// How serious a violation is. Any [`Severity::Error`] makes the report invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Rejects the source.
    Error,
    /// Should be fixed.
    Warning,
    /// Informational.
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

/// Source-level check applied by a [`Rule`].
#[derive(Clone)]
pub enum RuleCheck {
    /// One violation per match. If the regex has a capture group, the span of
    /// group 1 is reported instead of the whole match.
    Pattern(Regex),
    /// Whole-source check returning a message on failure. Not positional.
    Custom(Arc<dyn Fn(&str) -> Option<String> + Send + Sync>),
}

impl fmt::Debug for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A validation rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Stable identifier, e.g. `SEC001`.
    pub id: String,
    /// Severity of every violation it reports.
    pub severity: Severity,
    /// Message used for pattern violations.
    pub description: String,
    /// The check itself.
    pub check: RuleCheck,
}

impl Rule {
    /// A rule reporting every match of `pattern`.
    pub fn pattern(
        id: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        pattern: Regex,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            description: description.into(),
            check: RuleCheck::Pattern(pattern),
        }
    }

    /// A rule running `check` over the whole source.
    pub fn custom(
        id: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        check: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            description: description.into(),
            check: RuleCheck::Custom(Arc::new(check)),
        }
    }
}

/// One rule violation. Lines and columns are 1-based; 0 when the rule is
/// not positional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Id of the violated rule.
    pub rule_id: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Line of the match.
    pub line: usize,
    /// First column of the match.
    pub column_start: usize,
    /// Column just past the match.
    pub column_end: usize,
}

/// Outcome of validating one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// `false` if any Error-level violation was found.
    pub valid: bool,
    /// Number of Error violations.
    pub error_count: usize,
    /// Number of Warning violations.
    pub warning_count: usize,
    /// Number of Info violations.
    pub info_count: usize,
    /// All violations, in rule then source order.
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn push(&mut self, violation: Violation) {
        match violation.severity {
            Severity::Error => {
                self.valid = false;
                self.error_count += 1;
            }
            Severity::Warning => self.warning_count += 1,
            Severity::Info => self.info_count += 1,
        }
        self.violations.push(violation);
    }

    /// Error-level violations only.
    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
    }

    /// `Ok(self)` when valid, otherwise [`SandboxError::Validation`] listing
    /// every error.
    pub fn into_result(self) -> Result<Self, SandboxError> {
        if self.valid {
            return Ok(self);
        }
        let reason = self
            .errors()
            .map(|v| {
                if v.line > 0 {
                    format!("{}: {} (line {})", v.rule_id, v.message, v.line)
                } else {
                    format!("{}: {}", v.rule_id, v.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(SandboxError::Validation { reason })
    }
}

/// Validates function source against an ordered rule list.
#[derive(Debug, Clone)]
pub struct FunctionValidator {
    rules: Vec<Rule>,
}

impl Default for FunctionValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionValidator {
    /// Validator with the built-in rules and a 64 KiB size limit.
    pub fn new() -> Self {
        Self::with_max_code_size(DEFAULT_MAX_CODE_SIZE)
    }

    /// Validator with the built-in rules and a custom size limit.
    pub fn with_max_code_size(max: usize) -> Self {
        let mut v = Self::empty();
        v.add_rule(Rule::pattern(
            "SEC001",
            Severity::Error,
            "eval() executes arbitrary code",
            EVAL.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC002",
            Severity::Error,
            "the Function constructor executes arbitrary code",
            FUNCTION_CTOR.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC003",
            Severity::Error,
            "host runtime globals (process, Deno) are not available",
            HOST_GLOBALS.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC004",
            Severity::Error,
            "require() cannot load modules",
            REQUIRE.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC005",
            Severity::Error,
            "import cannot load modules",
            IMPORT.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC006",
            Severity::Error,
            "global objects must not be modified or indexed",
            GLOBAL_MUTATION.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC007",
            Severity::Error,
            "prototype chain manipulation is not allowed",
            PROTOTYPE_ACCESS.clone(),
        ));
        v.add_rule(Rule::pattern(
            "SEC008",
            Severity::Warning,
            "potential infinite loop",
            INFINITE_LOOP.clone(),
        ));
        v.add_rule(Rule::custom(
            "SEC009",
            Severity::Error,
            "a main function must be defined",
            |code| {
                (!MAIN_ENTRYPOINT.is_match(code))
                    .then(|| "Function must have a 'main' function defined".to_string())
            },
        ));
        v.add_rule(Rule::custom(
            "SEC010",
            Severity::Error,
            "source must be non-empty and within the size limit",
            move |code| {
                if code.trim().is_empty() {
                    Some("source is empty".to_string())
                } else if code.len() > max {
                    Some(format!(
                        "source is {} bytes, exceeds maximum size of {max} bytes",
                        code.len()
                    ))
                } else {
                    None
                }
            },
        ));
        v.add_rule(Rule::pattern(
            "QUA001",
            Severity::Warning,
            "console.log should be removed in production",
            CONSOLE_LOG.clone(),
        ));
        v.add_rule(Rule::pattern(
            "QUA002",
            Severity::Info,
            "TODO comment should be addressed",
            TODO_COMMENT.clone(),
        ));
        v.add_rule(Rule::pattern(
            "QUA003",
            Severity::Warning,
            "debugger statement should be removed",
            DEBUGGER.clone(),
        ));
        v
    }

    /// Validator without any rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. It runs after every rule added before it.
    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Ids of the registered rules, in order.
    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.id.as_str())
    }

    /// Validate `code` against every rule.
    pub fn validate(&self, code: &str) -> ValidationReport {
        let mut report = ValidationReport {
            valid: true,
            error_count: 0,
            warning_count: 0,
            info_count: 0,
            violations: Vec::new(),
        };

        for rule in &self.rules {
            match &rule.check {
                RuleCheck::Custom(check) => {
                    if let Some(message) = check(code) {
                        report.push(Violation {
                            rule_id: rule.id.clone(),
                            severity: rule.severity,
                            message,
                            line: 0,
                            column_start: 0,
                            column_end: 0,
                        });
                    }
                }
                RuleCheck::Pattern(re) => {
                    for caps in re.captures_iter(code) {
                        let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                            continue;
                        };
                        let (line, column_start) = line_and_column(code, m.start());
                        report.push(Violation {
                            rule_id: rule.id.clone(),
                            severity: rule.severity,
                            message: rule.description.clone(),
                            line,
                            column_start,
                            column_end: column_start + m.as_str().chars().count(),
                        });
                    }
                }
            }
        }

        tracing::debug!(
            valid = report.valid,
            errors = report.error_count,
            warnings = report.warning_count,
            "code validated"
        );
        report
    }
}

/// 1-based line and column (in chars) of byte offset `pos`.
fn line_and_column(code: &str, pos: usize) -> (usize, usize) {
    let before = &code[..pos];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    (line, before[line_start..].chars().count() + 1)
}
