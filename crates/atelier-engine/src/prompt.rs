use atelier_contracts::rules::{FeedbackRule, FeedbackRuleTable};

pub const DEFAULT_RETRY_SUFFIX: &str =
    "Address the issues above and produce a corrected image that meets every requirement.";

/// Corrective clauses collected over one task's failed attempts.
///
/// Clauses are kept in the order they first fired and are never removed.
#[derive(Debug, Clone)]
pub struct FeedbackLedger<'a> {
    rules: &'a FeedbackRuleTable,
    fired: Vec<&'a FeedbackRule>,
    last_reason: Option<String>,
}

impl<'a> FeedbackLedger<'a> {
    pub fn new(rules: &'a FeedbackRuleTable) -> Self {
        Self {
            rules,
            fired: Vec::new(),
            last_reason: None,
        }
    }

    /// Folds a failure reason in and returns the names of rules that fired for the first time.
    pub fn absorb(&mut self, reason: &str) -> Vec<&'a str> {
        let mut fresh = Vec::new();
        for rule in self.rules.matching(reason) {
            if self.fired.iter().any(|seen| seen.name == rule.name) {
                continue;
            }
            self.fired.push(rule);
            fresh.push(rule.name.as_str());
        }
        self.last_reason = Some(reason.trim().to_string());
        fresh
    }

    pub fn clauses(&self) -> Vec<&'a str> {
        self.fired.iter().map(|rule| rule.clause.as_str()).collect()
    }

    /// The base prompt alone until a failure has been absorbed, then the feedback block.
    pub fn render(&self, base_prompt: &str, retry_suffix: &str) -> String {
        let Some(reason) = self.last_reason.as_deref() else {
            return base_prompt.to_string();
        };
        let mut prompt = format!("{base_prompt}\n\nPREVIOUS ATTEMPT FAILED because: {reason}\n");
        if !self.fired.is_empty() {
            prompt.push_str("\nPLEASE FIX THESE SPECIFIC ISSUES:\n");
            for rule in &self.fired {
                prompt.push_str("- ");
                prompt.push_str(rule.clause.trim());
                prompt.push('\n');
            }
        }
        let suffix = retry_suffix.trim();
        if !suffix.is_empty() {
            prompt.push('\n');
            prompt.push_str(suffix);
        }
        prompt
    }
}

/// One-shot augmentation with the default rule table.
pub fn augment(base_prompt: &str, reason: &str) -> String {
    augment_with(
        &FeedbackRuleTable::default(),
        base_prompt,
        reason,
        DEFAULT_RETRY_SUFFIX,
    )
}

pub fn augment_with(
    rules: &FeedbackRuleTable,
    base_prompt: &str,
    reason: &str,
    retry_suffix: &str,
) -> String {
    let mut ledger = FeedbackLedger::new(rules);
    ledger.absorb(reason);
    ledger.render(base_prompt, retry_suffix)
}
