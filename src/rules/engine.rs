//! Rule engine - first-match-wins evaluation of stop rules.

use std::collections::BTreeMap;

use regex::Regex;

use crate::domain::stop_rule::{CommandResult, Decision, OutputMode, StopReason, StopRule, TIMED_OUT_EXIT_CODE};

/// Results of rules that carry their own matcher command, keyed by rule index.
pub type MatcherResults = BTreeMap<usize, CommandResult>;

/// Evaluate `rules` against the iteration's command result.
///
/// Rules with a matcher command are judged against the iteration result here;
/// use [`evaluate_with`] to supply their own results.
pub fn evaluate(rules: &[StopRule], result: &CommandResult) -> Decision {
    evaluate_with(rules, result, &MatcherResults::new())
}

/// Evaluate `rules` in declared order, judging rule `i` against
/// `matcher_results[i]` when present and against `result` otherwise.
///
/// A launch failure of the iteration itself stops the loop regardless of the
/// rules. A matcher command that could not launch never matches.
pub fn evaluate_with(rules: &[StopRule], result: &CommandResult, matcher_results: &MatcherResults) -> Decision {
    if result.is_launch_failure() {
        return Decision::launch_failed();
    }

    for (index, rule) in rules.iter().enumerate() {
        let subject = matcher_results.get(&index).unwrap_or(result);
        if subject.is_launch_failure() {
            continue;
        }
        if rule_matches(rule, subject) {
            return Decision::stop(rule.display_name(index), StopReason::Matched);
        }
    }

    Decision::Continue
}

/// True when every predicate configured on `rule` holds for `result`.
pub fn rule_matches(rule: &StopRule, result: &CommandResult) -> bool {
    exit_code_matches(&rule.exit_codes, result)
        && stream_matches(rule.stdout_mode, rule.stdout_regex.as_deref(), &result.stdout)
        && stream_matches(rule.stderr_mode, rule.stderr_regex.as_deref(), &result.stderr)
}

fn exit_code_matches(accepted: &[i32], result: &CommandResult) -> bool {
    if accepted.is_empty() {
        return true;
    }
    if result.timed_out && accepted.contains(&TIMED_OUT_EXIT_CODE) {
        return true;
    }
    accepted.contains(&result.exit_code)
}

fn stream_matches(mode: OutputMode, pattern: Option<&str>, output: &str) -> bool {
    match mode {
        OutputMode::Any => true,
        OutputMode::Empty => output.trim().is_empty(),
        OutputMode::Nonempty => !output.trim().is_empty(),
        // An unset or invalid pattern never matches
        OutputMode::Regex => match pattern.map(Regex::new) {
            Some(Ok(re)) => re.is_match(output),
            _ => false,
        },
    }
}
