//! Inbound message normalisation.

pub mod html;
pub mod normalize;

pub use html::{MarkdownRenderer, Render};
pub use normalize::{NO_SUBJECT, normalize};

use serde::Serialize;

/// Canonical form of an inbound mail, independent of its MIME layout.
///
/// `recipients` is an ordered set: first-seen spelling, deduplicated
/// case-insensitively, To then Cc then Bcc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Trimmed Message-ID, passed to the provider as the delivery reference.
    pub correlation_id: Option<String>,
}

impl NormalizedMessage {
    /// A message worth spending a provider call on has both a subject and a body.
    pub fn has_content(&self) -> bool {
        !self.subject.is_empty() && !self.body.is_empty()
    }
}
