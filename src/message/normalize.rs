//! Raw mail → [`NormalizedMessage`].

use std::collections::HashSet;
use std::sync::LazyLock;

use mail_parser::{Address, MessageParser, PartType};
use regex::Regex;

use crate::error::RelayError;
use crate::message::html::{Render, sanitize};
use crate::message::NormalizedMessage;

/// Subject used when the header is missing or empty.
pub const NO_SUBJECT: &str = "(no subject)";

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static INDENTED_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n +").unwrap());
static BLANK_LINE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\n\n+").unwrap());

/// Parse a raw RFC 5322 message into recipients, subject, body and reference.
///
/// HTML parts win over plain text. Only a payload the mail decoder cannot
/// make sense of at all is an error.
pub fn normalize(raw: &[u8], renderer: &dyn Render) -> Result<NormalizedMessage, RelayError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(RelayError::MalformedPayload)?;

    let correlation_id = parsed
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let html_parts: Vec<&str> = parsed
        .html_bodies()
        .filter_map(|part| match &part.body {
            PartType::Html(html) => Some(html.as_ref()),
            _ => None,
        })
        .collect();
    let text_parts: Vec<&str> = parsed
        .text_bodies()
        .filter_map(|part| match &part.body {
            PartType::Text(text) => Some(text.as_ref()),
            _ => None,
        })
        .collect();

    let body = if !html_parts.is_empty() {
        render_html(&html_parts.concat(), renderer)
    } else if !text_parts.is_empty() {
        text_parts.join("\n\n")
    } else {
        String::new()
    };

    let subject = parsed
        .subject()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(NO_SUBJECT);
    let subject = WHITESPACE_RUN.replace_all(subject, " ").trim().to_string();

    let recipients = dedup_recipients(
        [parsed.to(), parsed.cc(), parsed.bcc()]
            .into_iter()
            .flat_map(extract_addresses),
    );

    Ok(NormalizedMessage {
        recipients,
        subject,
        body,
        correlation_id,
    })
}

fn render_html(html: &str, renderer: &dyn Render) -> String {
    let rendered = renderer.render(&sanitize(html));
    let rendered = INDENTED_LINE.replace_all(rendered.trim(), "\n");
    BLANK_LINE_RUN
        .replace_all(rendered.trim(), "\n\n")
        .into_owned()
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Entries without an `@` (bare names, empty groups) are skipped.
pub fn extract_addresses(addr: Option<&Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let candidates: Vec<&str> = match addr {
        Address::List(addrs) => addrs.iter().filter_map(|a| a.address.as_deref()).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(|a| a.address.as_deref()))
            .collect(),
    };
    candidates
        .into_iter()
        .map(str::trim)
        .filter(|a| a.contains('@'))
        .map(str::to_string)
        .collect()
}

/// Case-insensitive dedup keeping the first-seen spelling and order.
fn dedup_recipients<I>(addresses: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|a| seen.insert(a.to_lowercase()))
        .collect()
}
