//! Participant tax-id reconciliation
//!
//! The participant roster's `nit` field is filled in by hand and is often
//! missing, carries a verification digit, or has a per-establishment suffix.
//! [`reconcile_nit`] turns it into a key that joins against the registry.

use inn_common::table::{is_null_marker, normalize_numeric_text};
use inn_common::CorrectionTable;

fn present(value: Option<&str>) -> Option<&str> {
    value
        .map(normalize_numeric_text)
        .filter(|v| !v.is_empty() && !is_null_marker(v))
}

/// Drop a trailing `-d` / ` d` establishment suffix
///
/// `"123456789-3"`, `"123456789 3"` and `"123456789 - 3"` all become
/// `"123456789"`. Anything else is returned trimmed.
pub fn strip_establishment_suffix(nit: &str) -> &str {
    let trimmed = nit.trim();
    let Some(head) = trimmed.strip_suffix(|c: char| c.is_ascii_digit()) else {
        return trimmed;
    };
    let stripped = head.trim_end_matches([' ', '-']);
    if stripped.len() == head.len() || stripped.trim().is_empty() {
        trimmed
    } else {
        stripped.trim_end()
    }
}

/// `nit` is `alt_id` followed by exactly one extra character
fn is_alt_with_check_digit(nit: &str, alt_id: &str) -> bool {
    let mut chars = nit.chars();
    chars.next_back().is_some() && chars.as_str() == alt_id
}

/// Clean participant tax id
///
/// Applied in order:
/// 1. a missing `nit` is taken from `alt_id` (the internal numeric id)
/// 2. a `nit` equal to `alt_id` plus one trailing digit becomes `alt_id`
/// 3. known erroneous ids are remapped through the correction table
/// 4. establishment suffixes are stripped
///
/// Returns `None` only when both ids are missing.
pub fn reconcile_nit(
    nit: Option<&str>,
    alt_id: Option<&str>,
    corrections: &CorrectionTable,
) -> Option<String> {
    let alt_id = present(alt_id);
    let nit = present(nit).or(alt_id)?;

    let nit = match alt_id {
        Some(alt) if is_alt_with_check_digit(nit, alt) => alt,
        _ => nit,
    };

    let nit = corrections.remap_nit(nit);
    Some(strip_establishment_suffix(nit).to_string())
}
