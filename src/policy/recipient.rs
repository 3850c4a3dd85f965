//! Recipient allowlist.
//!
//! Two mutually exclusive modes:
//! - a full-string regex (wins when both are configured)
//! - an exact domain list (`user@example.com` matches `example.com` only,
//!   subdomains must be listed explicitly)
//!
//! With neither configured every recipient is allowed; the source gate is
//! then the only control.

use std::collections::HashSet;

use regex::Regex;

/// Allow pattern that only ever matches a whole address.
///
/// The source is wrapped as `^(?:source)$` on construction, so alternations
/// like `a@x\.com|a@x\.com\.au` are tried against the full address.
#[derive(Debug, Clone)]
pub struct RecipientPattern(Regex);

impl RecipientPattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{source})$")).map(Self)
    }

    pub fn is_match(&self, address: &str) -> bool {
        self.0.is_match(address)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Recipient policy settings.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Pattern an address must match in full.
    pub allow_pattern: Option<RecipientPattern>,
    /// Lower-cased domains an address must belong to.
    pub allow_domains: HashSet<String>,
}

impl PolicyConfig {
    /// Check whether `address` may receive a relayed notification.
    pub fn is_allowed(&self, address: &str) -> bool {
        if let Some(pattern) = &self.allow_pattern {
            return pattern.is_match(address);
        }
        if !self.allow_domains.is_empty() {
            let address_lower = address.to_ascii_lowercase();
            return self
                .allow_domains
                .iter()
                .any(|domain| address_lower.ends_with(&format!("@{domain}")));
        }
        true
    }

    /// Keep only the permitted addresses, preserving order.
    pub fn filter<'a, I>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        addresses
            .into_iter()
            .filter(|a| self.is_allowed(a))
            .cloned()
            .collect()
    }
}
