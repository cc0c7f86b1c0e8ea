//! Multi-level response validation.
//!
//! Each workflow phase carries up to four level rules (Pass, Warn, Fail,
//! Critical). A response is evaluated against them in the fixed priority
//! order Critical → Fail → Warn → Pass; the first matching rule decides the
//! outcome of the phase.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Severity of a validated response, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValidationLevel {
    /// The response matched the expected pattern.
    Pass,
    /// The response is acceptable but suspicious; the workflow continues.
    Warn,
    /// The response failed validation; the workflow stops unless the phase
    /// allows continuation.
    Fail,
    /// The response indicates a critical condition; the workflow stops and
    /// may raise a hardware signal.
    Critical,
}

impl ValidationLevel {
    /// Fixed evaluation priority: worst level first.
    pub const PRIORITY: [ValidationLevel; 4] = [
        ValidationLevel::Critical,
        ValidationLevel::Fail,
        ValidationLevel::Warn,
        ValidationLevel::Pass,
    ];

    /// The score assigned to an outcome decided at this level.
    pub const fn score(self) -> u8 {
        match self {
            ValidationLevel::Pass => 100,
            ValidationLevel::Warn => 70,
            ValidationLevel::Fail => 25,
            ValidationLevel::Critical => 0,
        }
    }
}

impl std::fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationLevel::Pass => "PASS",
            ValidationLevel::Warn => "WARN",
            ValidationLevel::Fail => "FAIL",
            ValidationLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// The result of validating one response (or one port, see
/// [`crate::discovery::validator`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Decided level.
    pub level: ValidationLevel,
    /// Score in `0..=100`, monotone in level.
    pub score: u8,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// Names of the criteria that failed. Empty iff `level` is `Pass`.
    pub failed_criteria: Vec<String>,
    /// The pattern text that decided the outcome, if any.
    pub matched_pattern: Option<String>,
    /// Named capture groups extracted from the matched pattern.
    pub captures: HashMap<String, String>,
}

impl ValidationOutcome {
    /// An outcome at the given level with the level's default score.
    pub fn at_level(level: ValidationLevel, reason: impl Into<String>) -> Self {
        Self {
            level,
            score: level.score(),
            reason: reason.into(),
            failed_criteria: Vec::new(),
            matched_pattern: None,
            captures: HashMap::new(),
        }
    }

    /// A passing outcome.
    pub fn pass(reason: impl Into<String>) -> Self {
        Self::at_level(ValidationLevel::Pass, reason)
    }

    /// A failing outcome carrying the violated criteria.
    pub fn fail(reason: impl Into<String>, failed_criteria: Vec<String>) -> Self {
        Self {
            failed_criteria,
            ..Self::at_level(ValidationLevel::Fail, reason)
        }
    }
}

/// One validation rule of a phase: a pattern bound to a level plus the
/// workflow knobs the configuration may attach to it.
#[derive(Debug, Clone)]
pub struct LevelRule {
    /// Level this rule decides.
    pub level: ValidationLevel,
    /// Original pattern text (literal or regex source).
    pub pattern: String,
    /// Compiled matcher. Literal patterns are compiled as anchored, escaped
    /// regexes so evaluation has a single code path.
    pub regex: Regex,
    /// Raise the critical-fail hardware signal when this rule matches.
    pub trigger_hardware: bool,
    /// Explicit stop/continue override from configuration.
    pub stop_workflow: Option<bool>,
    /// Explicit continue-on-failure override from configuration.
    pub continue_on_failure: Option<bool>,
}

impl LevelRule {
    /// Builds a rule, compiling `pattern` through the process-wide cache.
    pub fn new(
        level: ValidationLevel,
        pattern: &str,
        is_regex: bool,
        ignore_case: bool,
    ) -> Result<Self, regex::Error> {
        let regex = compile_cached(pattern, is_regex, ignore_case)?;
        Ok(Self {
            level,
            pattern: pattern.to_owned(),
            regex,
            trigger_hardware: false,
            stop_workflow: None,
            continue_on_failure: None,
        })
    }
}

/// Process-wide cache of compiled patterns, keyed by source text and flags.
/// Patterns are compiled eagerly at configuration load; repeated loads of
/// the same file hit the cache.
static PATTERN_CACHE: Lazy<Mutex<HashMap<(String, bool), Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Compiles a pattern, reusing a previously compiled instance when the same
/// source text and case flag were seen before.
pub fn compile_cached(
    pattern: &str,
    is_regex: bool,
    ignore_case: bool,
) -> Result<Regex, regex::Error> {
    let source = if is_regex {
        pattern.to_owned()
    } else {
        format!("^{}$", regex::escape(pattern))
    };

    let key = (source.clone(), ignore_case);
    if let Some(hit) = PATTERN_CACHE.lock().unwrap().get(&key) {
        return Ok(hit.clone());
    }

    let compiled = RegexBuilder::new(&source)
        .case_insensitive(ignore_case)
        .build()?;
    PATTERN_CACHE
        .lock()
        .unwrap()
        .insert(key, compiled.clone());
    Ok(compiled)
}

/// Evaluates a response against a phase's level rules.
///
/// Rules are tried in the fixed order Critical → Fail → Warn → Pass; the
/// first rule whose pattern matches decides the outcome. Trailing line
/// terminators are stripped from the response before matching. If no rule
/// matches, the outcome is Fail with reason "no pattern matched".
pub fn evaluate(rules: &[LevelRule], response: &str) -> ValidationOutcome {
    let trimmed = response.trim_end_matches(['\r', '\n']);

    for level in ValidationLevel::PRIORITY {
        let Some(rule) = rules.iter().find(|r| r.level == level) else {
            continue;
        };
        let Some(found) = rule.regex.captures(trimmed) else {
            continue;
        };

        let mut captures = HashMap::new();
        for name in rule.regex.capture_names().flatten() {
            if let Some(m) = found.name(name) {
                captures.insert(name.to_owned(), m.as_str().to_owned());
            }
        }

        let mut outcome =
            ValidationOutcome::at_level(level, format!("matched {level} pattern"));
        outcome.matched_pattern = Some(rule.pattern.clone());
        outcome.captures = captures;
        if level != ValidationLevel::Pass {
            outcome.failed_criteria = vec![format!("level_{}", level.to_string().to_lowercase())];
        }
        return outcome;
    }

    ValidationOutcome {
        failed_criteria: vec!["no_match".to_owned()],
        ..ValidationOutcome::at_level(ValidationLevel::Fail, "no pattern matched")
    }
}

/// Returns the rule that would decide the given response, if any.
///
/// Used by the orchestrator to look up the matched rule's hardware and
/// continuation knobs after [`evaluate`] has produced an outcome.
pub fn deciding_rule<'a>(rules: &'a [LevelRule], response: &str) -> Option<&'a LevelRule> {
    let trimmed = response.trim_end_matches(['\r', '\n']);
    for level in ValidationLevel::PRIORITY {
        if let Some(rule) = rules.iter().find(|r| r.level == level) {
            if rule.regex.is_match(trimmed) {
                return Some(rule);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rules() -> Vec<LevelRule> {
        vec![
            LevelRule::new(ValidationLevel::Pass, "^PASS$", true, false).unwrap(),
            LevelRule::new(ValidationLevel::Warn, "^WARN", true, false).unwrap(),
            LevelRule::new(ValidationLevel::Fail, "^FAIL$", true, false).unwrap(),
            LevelRule::new(ValidationLevel::Critical, "^CRITICAL$", true, false).unwrap(),
        ]
    }

    #[test]
    fn level_order_is_pass_to_critical() {
        assert!(ValidationLevel::Pass < ValidationLevel::Warn);
        assert!(ValidationLevel::Warn < ValidationLevel::Fail);
        assert!(ValidationLevel::Fail < ValidationLevel::Critical);
    }

    #[test]
    fn highest_priority_match_wins() {
        let rules = rules();
        let outcome = evaluate(&rules, "CRITICAL\r\n");
        assert_eq!(outcome.level, ValidationLevel::Critical);
        assert_eq!(outcome.score, 0);
        assert_eq!(outcome.matched_pattern.as_deref(), Some("^CRITICAL$"));
    }

    #[test]
    fn pass_has_no_failed_criteria() {
        let rules = rules();
        let outcome = evaluate(&rules, "PASS\r\n");
        assert_eq!(outcome.level, ValidationLevel::Pass);
        assert_eq!(outcome.score, 100);
        assert!(outcome.failed_criteria.is_empty());
    }

    #[test]
    fn no_match_is_fail() {
        let rules = rules();
        let outcome = evaluate(&rules, "garbage");
        assert_eq!(outcome.level, ValidationLevel::Fail);
        assert_eq!(outcome.reason, "no pattern matched");
        assert_eq!(outcome.failed_criteria, vec!["no_match".to_owned()]);
    }

    #[test]
    fn overlapping_patterns_decide_by_priority_not_rule_order() {
        // Both Warn and Critical match; Critical must win regardless of the
        // order the rules are stored in.
        let rules = vec![
            LevelRule::new(ValidationLevel::Warn, "^CRIT", true, false).unwrap(),
            LevelRule::new(ValidationLevel::Critical, "^CRITICAL", true, false).unwrap(),
        ];
        let outcome = evaluate(&rules, "CRITICAL: overtemp");
        assert_eq!(outcome.level, ValidationLevel::Critical);
    }

    #[test]
    fn named_captures_are_extracted() {
        let rules = vec![LevelRule::new(
            ValidationLevel::Pass,
            r"^OK voltage=(?P<volts>\d+)mV$",
            true,
            false,
        )
        .unwrap()];
        let outcome = evaluate(&rules, "OK voltage=3300mV\r\n");
        assert_eq!(outcome.level, ValidationLevel::Pass);
        assert_eq!(outcome.captures.get("volts").map(String::as_str), Some("3300"));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        let rules = vec![LevelRule::new(ValidationLevel::Pass, "READY (1)", false, false).unwrap()];
        assert_eq!(evaluate(&rules, "READY (1)\r\n").level, ValidationLevel::Pass);
        assert_eq!(evaluate(&rules, "READY (1) extra").level, ValidationLevel::Fail);
    }

    #[test]
    fn ignore_case_flag_is_honored() {
        let rules = vec![LevelRule::new(ValidationLevel::Pass, "^ok$", true, true).unwrap()];
        assert_eq!(evaluate(&rules, "OK").level, ValidationLevel::Pass);
    }

    #[test]
    fn empty_pattern_critical_matches_empty_response() {
        let rules = vec![LevelRule::new(ValidationLevel::Critical, "^$", true, false).unwrap()];
        let outcome = evaluate(&rules, "");
        assert_eq!(outcome.level, ValidationLevel::Critical);
    }

    #[test]
    fn pattern_cache_returns_identical_program() {
        let a = compile_cached("^cached$", true, false).unwrap();
        let b = compile_cached("^cached$", true, false).unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }
}
