//! Deterministic extraction of ordered steps from planner output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Plan, PlanStatus, Step};

/// Sentence the planner is told to finish with.
pub const PLAN_SENTINEL: &str = "This is the end of the plan";

static NUMBERED_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:#+\s*)?(?:\*\*)?(?:step\s+)?\d+\s*[.):]\s*(?:\*\*)?\s*(.*)$")
        .expect("numbered item regex should be valid")
});

static BULLET_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*+]\s+(.*)$").expect("bullet item regex should be valid")
});

/// Strip the sentinel line and everything after it.
pub fn strip_sentinel(text: &str) -> String {
    let lower_sentinel = PLAN_SENTINEL.to_ascii_lowercase();
    let mut kept = Vec::new();
    for line in text.lines() {
        if let Some(pos) = line.to_ascii_lowercase().find(&lower_sentinel) {
            let head = line[..pos].trim_end();
            if !head.is_empty() {
                kept.push(head);
            }
            break;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_string()
}

/// Split plan text into step descriptions.
///
/// Numbered items win over bullets. Only items starting at column zero open a
/// new step; indented lines and plain paragraphs after an item belong to it.
/// Text with no list structure is a single step.
pub fn extract_steps(text: &str) -> Vec<String> {
    let body = strip_sentinel(text);
    if body.is_empty() {
        return Vec::new();
    }

    let numbered = split_items(&body, &NUMBERED_ITEM);
    if !numbered.is_empty() {
        return numbered;
    }
    let bullets = split_items(&body, &BULLET_ITEM);
    if !bullets.is_empty() {
        return bullets;
    }
    vec![body]
}

fn split_items(body: &str, opener: &Regex) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for line in body.lines() {
        let top_level = !line.starts_with(char::is_whitespace);
        if top_level && let Some(caps) = opener.captures(line) {
            let head = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            steps.push(head.trim().trim_end_matches("**").trim().to_string());
            continue;
        }
        if let Some(current) = steps.last_mut() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(trimmed);
        }
    }
    steps.retain(|step| !step.is_empty());
    steps
}

/// Build a proposed plan from a planner draft.
pub fn parse_plan(text: &str) -> Plan {
    let body = strip_sentinel(text);
    let steps = extract_steps(&body)
        .into_iter()
        .enumerate()
        .map(|(index, description)| Step::new(index, description))
        .collect();
    Plan {
        text: body,
        status: PlanStatus::Proposed,
        steps,
    }
}
