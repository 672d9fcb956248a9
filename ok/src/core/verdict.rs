//! Judge response parsing.
//!
//! Judges are asked to end their answer with a verdict line. Parsing scans
//! from the last line backwards and stops at the first line that opens with a
//! known token. Anything unrecognized is a rejection: judges fail closed.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Decision, Role, Verdict};

pub const UNPARSEABLE_VERDICT: &str = "unparseable verdict";

/// Leading word of a line, skipping punctuation/markdown and an optional `Verdict:` label.
static LEADING_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[^A-Za-z]*(?:verdict[^A-Za-z]*)?([A-Za-z]+)")
        .expect("leading word regex should be valid")
});

/// Accept/reject tokens understood for a judge role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vocabulary {
    pub accept: &'static [&'static str],
    pub reject: &'static [&'static str],
}

pub const PLAN_JUDGE: Vocabulary = Vocabulary {
    accept: &["APPROVED"],
    reject: &["REJECTED"],
};

pub const IMPLEMENTATION_JUDGE: Vocabulary = Vocabulary {
    accept: &["SUCCESS"],
    reject: &["PARTIAL", "FAILURE"],
};

pub const COMPLETION_JUDGE: Vocabulary = Vocabulary {
    accept: &["COMPLETE"],
    reject: &["CONTINUE"],
};

pub const UNIVERSAL: Vocabulary = Vocabulary {
    accept: &["APPROVED", "ACCEPT", "ACCEPTED", "SUCCESS", "COMPLETE"],
    reject: &["REJECTED", "REJECT", "PARTIAL", "FAILURE", "CONTINUE"],
};

impl Vocabulary {
    /// Vocabulary for a judge role; generative roles get the universal set.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::PlanJudge => PLAN_JUDGE,
            Role::ImplementationJudge => IMPLEMENTATION_JUDGE,
            Role::CompletionJudge => COMPLETION_JUDGE,
            Role::Planner | Role::Implementer => UNIVERSAL,
        }
    }

    /// Parse a judge response. Total: every input yields exactly one verdict.
    pub fn parse(&self, response: &str) -> Verdict {
        let lines: Vec<&str> = response.lines().collect();
        for (idx, line) in lines.iter().enumerate().rev() {
            let Some(decision) = self.match_line(line) else {
                continue;
            };
            let rationale = lines[..idx].join("\n").trim().to_string();
            return match decision {
                Decision::Accept => Verdict::accept(rationale),
                Decision::Reject => Verdict::reject(rationale),
            };
        }
        Verdict::reject(UNPARSEABLE_VERDICT)
    }

    fn match_line(&self, line: &str) -> Option<Decision> {
        let caps = LEADING_WORD.captures(line.trim())?;
        let word = caps.get(1)?.as_str().to_ascii_uppercase();
        if self.accept.contains(&word.as_str()) {
            Some(Decision::Accept)
        } else if self.reject.contains(&word.as_str()) {
            Some(Decision::Reject)
        } else {
            None
        }
    }
}

/// Parse with the universal vocabulary.
pub fn parse_verdict(response: &str) -> Verdict {
    UNIVERSAL.parse(response)
}

/// Parse with the vocabulary the given judge role was prompted with.
pub fn parse_for_role(role: Role, response: &str) -> Verdict {
    Vocabulary::for_role(role).parse(response)
}
