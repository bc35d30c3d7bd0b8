//! Failure taxonomy for correction tasks.
//!
//! Verdict failures are values ([`atelier_contracts::verdict::Verdict`]), not errors;
//! this enum covers what can go wrong around them.

use std::path::PathBuf;

use thiserror::Error;

use crate::error_chain_text;

#[derive(Debug, Error)]
pub enum CorrectionError {
    /// The generation capability answered without image data.
    #[error("no image generated")]
    NoImageReturned,

    /// A recognized data-shape error at the capability boundary.
    #[error("transient capability error: {0}")]
    TransientCapability(String),

    #[error("missing reference asset: {}", path.display())]
    MissingReferenceAsset { path: PathBuf },

    #[error("unreadable subject image {}: {message}", path.display())]
    UnreadableSubject { path: PathBuf, message: String },

    #[error("subject image is not decodable: {0}")]
    UndecodableSubject(String),

    #[error("base prompt is empty")]
    EmptyPrompt,

    #[error("max attempts must be at least 1")]
    ZeroAttempts,
}

/// Error-text patterns that mark a capability failure as transient.
///
/// Each group matches when every one of its terms appears in the case-folded
/// cause chain. Transport timeouts and connection failures always match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientPatterns {
    groups: Vec<Vec<String>>,
}

impl TransientPatterns {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|group| {
                    group
                        .into_iter()
                        .map(|term| term.trim().to_lowercase())
                        .filter(|term| !term.is_empty())
                        .collect::<Vec<String>>()
                })
                .filter(|group| !group.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, err: &anyhow::Error) -> bool {
        if is_retryable_transport_error(err) {
            return true;
        }
        let typed = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<CorrectionError>(),
                Some(CorrectionError::TransientCapability(_))
            )
        });
        if typed {
            return true;
        }
        self.matches_text(&error_chain_text(err, 2000))
    }

    pub fn matches_text(&self, text: &str) -> bool {
        let folded = text.to_lowercase();
        self.groups
            .iter()
            .any(|group| group.iter().all(|term| folded.contains(term.as_str())))
    }
}

impl Default for TransientPatterns {
    fn default() -> Self {
        Self::new(vec![
            vec!["could not convert".to_string(), "inline_data".to_string()],
            vec!["could not convert".to_string(), "inline data".to_string()],
            vec!["payload type mismatch".to_string()],
        ])
    }
}

pub(crate) fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}
