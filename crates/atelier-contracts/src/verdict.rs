use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of one verification round.
///
/// `Inconclusive` only appears before an [`InconclusivePolicy`] has been applied;
/// `Error` records a capability failure for the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail(String),
    Inconclusive(String),
    Error(String),
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail(_) => "fail",
            Self::Inconclusive(_) => "inconclusive",
            Self::Error(_) => "error",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail(reason) | Self::Inconclusive(reason) | Self::Error(reason) => {
                Some(reason.as_str())
            }
        }
    }
}

pub const NO_VERIFICATION_RESPONSE: &str = "no verification response";

/// Classifies raw verifier text without resolving ambiguity.
///
/// Leading `pass` / `fail` keywords are matched case-insensitively after trimming;
/// a `:` after the keyword is optional.
pub fn parse_verdict(text: &str) -> Verdict {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Verdict::Fail(NO_VERIFICATION_RESPONSE.to_string());
    }
    if strip_keyword(trimmed, "pass").is_some() {
        return Verdict::Pass;
    }
    if let Some(rest) = strip_keyword(trimmed, "fail") {
        // `FAILED:`, `Failure:` and the like carry the keyword with a suffix.
        let reason = rest
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .trim_start();
        let reason = reason.strip_prefix(':').unwrap_or(reason).trim();
        if reason.is_empty() {
            return Verdict::Fail(trimmed.to_string());
        }
        return Verdict::Fail(reason.to_string());
    }
    Verdict::Inconclusive(trimmed.to_string())
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        text.get(keyword.len()..)
    } else {
        None
    }
}

/// How a verdict without a leading `PASS` / `FAIL` keyword is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InconclusivePolicy {
    /// Pass when "pass" appears anywhere in the text, fail otherwise.
    #[default]
    InferPass,
    /// Always fail.
    Reject,
    /// Pass on positive words, fail on negative words, pass when neither shows up.
    AssumePass,
}

const ASSUME_PASS_POSITIVE: &[&str] = &["pass", "good", "correct"];
const ASSUME_PASS_NEGATIVE: &[&str] = &["fail", "wrong", "fix"];

impl InconclusivePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InferPass => "infer-pass",
            Self::Reject => "reject",
            Self::AssumePass => "assume-pass",
        }
    }

    /// Resolves an `Inconclusive` verdict; every other verdict passes through unchanged.
    pub fn settle(self, verdict: &Verdict) -> Verdict {
        match verdict {
            Verdict::Inconclusive(raw) => self.resolve(raw),
            other => other.clone(),
        }
    }

    pub fn resolve(self, raw: &str) -> Verdict {
        let folded = raw.to_lowercase();
        match self {
            Self::InferPass if folded.contains("pass") => Verdict::Pass,
            Self::InferPass | Self::Reject => Verdict::Fail(raw.to_string()),
            Self::AssumePass => {
                if ASSUME_PASS_POSITIVE
                    .iter()
                    .any(|word| folded.contains(word))
                {
                    Verdict::Pass
                } else if ASSUME_PASS_NEGATIVE
                    .iter()
                    .any(|word| folded.contains(word))
                {
                    Verdict::Fail(raw.to_string())
                } else {
                    Verdict::Pass
                }
            }
        }
    }
}

impl fmt::Display for InconclusivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InconclusivePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "infer-pass" | "infer" => Ok(Self::InferPass),
            "reject" | "strict" => Ok(Self::Reject),
            "assume-pass" | "lenient" => Ok(Self::AssumePass),
            other => Err(format!("unknown inconclusive policy '{other}'")),
        }
    }
}
