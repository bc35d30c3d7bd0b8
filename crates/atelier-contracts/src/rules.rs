use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// One entry of the failure-reason rule table.
///
/// A rule fires when the case-folded reason contains at least one `any_of` term
/// (when any are listed) and every `all_of` term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRule {
    pub name: String,
    #[serde(default)]
    pub any_of: Vec<String>,
    #[serde(default)]
    pub all_of: Vec<String>,
    pub clause: String,
}

impl FeedbackRule {
    pub fn new(name: &str, any_of: &[&str], clause: &str) -> Self {
        Self {
            name: name.to_string(),
            any_of: any_of.iter().map(|term| term.to_string()).collect(),
            all_of: Vec::new(),
            clause: clause.to_string(),
        }
    }

    pub fn requiring_all(name: &str, all_of: &[&str], clause: &str) -> Self {
        Self {
            name: name.to_string(),
            any_of: Vec::new(),
            all_of: all_of.iter().map(|term| term.to_string()).collect(),
            clause: clause.to_string(),
        }
    }

    pub fn matches(&self, reason: &str) -> bool {
        self.matches_folded(&reason.to_lowercase())
    }

    fn matches_folded(&self, folded: &str) -> bool {
        let any_terms = non_blank_terms(&self.any_of);
        let all_terms = non_blank_terms(&self.all_of);
        if any_terms.is_empty() && all_terms.is_empty() {
            return false;
        }
        let any_hit = any_terms.is_empty() || any_terms.iter().any(|term| folded.contains(term));
        any_hit && all_terms.iter().all(|term| folded.contains(term))
    }
}

fn non_blank_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect()
}

/// Ordered keyword → corrective clause table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRuleTable {
    rules: Vec<FeedbackRule>,
}

impl FeedbackRuleTable {
    pub fn new(rules: Vec<FeedbackRule>) -> anyhow::Result<Self> {
        let table = Self { rules };
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading rule table {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid rule table {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let table: Self = serde_json::from_str(raw)?;
        table.validate()?;
        Ok(table)
    }

    pub fn rules(&self) -> &[FeedbackRule] {
        self.rules.as_slice()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules triggered by `reason`, in table order.
    pub fn matching(&self, reason: &str) -> Vec<&FeedbackRule> {
        let folded = reason.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.matches_folded(&folded))
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                bail!("rule table entry has an empty name");
            }
            if !seen.insert(rule.name.as_str()) {
                bail!("duplicate rule '{}'", rule.name);
            }
            if rule.clause.trim().is_empty() {
                bail!("rule '{}' has an empty clause", rule.name);
            }
            if non_blank_terms(&rule.any_of).is_empty() && non_blank_terms(&rule.all_of).is_empty()
            {
                bail!("rule '{}' has no trigger terms", rule.name);
            }
        }
        Ok(())
    }
}

impl Default for FeedbackRuleTable {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

pub fn default_rules() -> Vec<FeedbackRule> {
    vec![
        FeedbackRule::new(
            "jewelry",
            &["jewelry"],
            "Remove ALL jewelry (necklaces, earrings, bracelets, rings).",
        ),
        FeedbackRule::new("footwear", &["footwear"], "Remove ALL footwear."),
        FeedbackRule::new(
            "accessories",
            &["accessories"],
            "Remove ALL accessories (watches, bags, hats, scarves not part of the design).",
        ),
        FeedbackRule::new(
            "mannequin",
            &["black"],
            "Keep the reference mannequin completely black with a rose gold head.",
        ),
        FeedbackRule::new(
            "full_body",
            &["full body"],
            "Keep the full mannequin body visible from head to toe.",
        ),
        FeedbackRule::new(
            "sleeves",
            &["sleeve"],
            "Ensure full-length sleeves extending to the wrist, made from the matching fabric.",
        ),
        FeedbackRule::new(
            "trousers",
            &["trousers", "pants"],
            "Create matching trousers from the same fabric as the top.",
        ),
        FeedbackRule::new(
            "outfit",
            &["complete outfit"],
            "Ensure both top and bottom garments are present.",
        ),
        FeedbackRule::requiring_all(
            "fabric",
            &["fabric", "match"],
            "The trousers must use the exact fabric pattern and colors of the top.",
        ),
        FeedbackRule::new(
            "collar",
            &["collar", "neckline", "chinese", "mandarin", "asian", "cultural"],
            "COLLAR PRESERVATION: replicate the original collar and neckline EXACTLY. \
             Do not reshape, round, straighten or restyle it, and do not substitute a \
             mandarin or other culturally adapted collar.",
        ),
        FeedbackRule::new(
            "replica",
            &["replica", "exact", "modification"],
            "Create a perfect exact replica of the original garment design.",
        ),
    ]
}
