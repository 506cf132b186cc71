//! Request validation.
//!
//! Accumulates every violation in one pass instead of failing on the first;
//! the caller gets the complete list. Multi-address fields accept `;` as the
//! inbound delimiter and are rewritten to the canonical `,` form.

use crate::types::MailRequest;

const LIST_DELIMITER: char = ';';
const CANONICAL_DELIMITER: &str = ",";

/// Validate a request.
///
/// Returns the canonicalized request, or the ordered, non-empty list of
/// human-readable errors. Never short-circuits: every field is checked and
/// every violation reported.
pub fn validate(request: &MailRequest) -> Result<MailRequest, Vec<String>> {
    let mut errors = Vec::new();
    let mut canonical = request.clone();

    if request.subject.is_empty() {
        errors.push("Email subject is required".to_string());
    }

    if request.sender.is_empty() {
        errors.push("Sender email is required".to_string());
    } else if !is_valid_address(&request.sender) {
        errors.push(format!("Invalid sender email: {}", request.sender));
    }

    if request.receiver.is_empty() {
        errors.push("Receiver email is required".to_string());
    } else {
        canonical.receiver = check_address_field(&request.receiver, "RECEIVER", &mut errors, |v| {
            format!("Invalid receiver email: {v}")
        });
    }

    if let Some(cc) = request.cc.as_deref().filter(|v| !v.is_empty()) {
        canonical.cc = Some(check_address_field(cc, "CC", &mut errors, |v| {
            format!("Invalid CC email: {v}")
        }));
    }

    if let Some(bcc) = request.bcc.as_deref().filter(|v| !v.is_empty()) {
        canonical.bcc = Some(check_address_field(bcc, "BCC", &mut errors, |v| {
            format!("Invalid BCC email: {v}")
        }));
    }

    if errors.is_empty() {
        Ok(canonical)
    } else {
        Err(errors)
    }
}

/// Validate a field that may hold one address or a `;`-delimited list.
///
/// List entries are validated individually; only the invalid ones are
/// reported, labeled with the field and the offending entry. Returns the
/// canonical `,`-joined rendition either way.
fn check_address_field(
    value: &str,
    label: &str,
    errors: &mut Vec<String>,
    single_error: impl Fn(&str) -> String,
) -> String {
    if value.contains(LIST_DELIMITER) {
        let entries: Vec<&str> = value.split(LIST_DELIMITER).collect();
        for entry in &entries {
            if !is_valid_address(entry) {
                errors.push(format!("Invalid email: ({label}) -> {entry}"));
            }
        }
        entries.join(CANONICAL_DELIMITER)
    } else {
        if !is_valid_address(value) {
            errors.push(single_error(value));
        }
        value.to_string()
    }
}

/// Standard email-address shape: `local@domain` with a dotted domain.
pub fn is_valid_address(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
    {
        return false;
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return false;
    }
    domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}
