//! Input validation for Steward entities
//!
//! Guards against malformed names, oversized inputs, injected control
//! characters in URLs, and badly formed month/currency values.

use crate::{Result, StewardError};

/// Maximum length for entity names
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length for tag values
pub const MAX_TAG_LEN: usize = 100;

/// Maximum length for URLs and IRIs
pub const MAX_URL_LEN: usize = 2048;

/// Maximum length for search queries
pub const MAX_SEARCH_QUERY_LEN: usize = 500;

/// Maximum size of a markdown body (1 MiB)
pub const MAX_MARKDOWN_LEN: usize = 1024 * 1024;

/// A validation failure attached to a field path such as `schema[0].name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for FieldError {}

/// Fold a list of field errors into a single `ValidationError` (Ok if empty).
pub fn into_result(errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Err(StewardError::ValidationError(joined))
}

/// Validate an entity name
///
/// Requirements:
/// - Not empty, <= 255 characters
/// - Alphanumeric, underscore, hyphen, dot, space
/// - No leading or trailing whitespace
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StewardError::ValidationError(format!(
            "{} cannot be empty",
            field_name
        )));
    }

    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(StewardError::ValidationError(format!(
            "{} too long: {} > {} characters",
            field_name,
            len,
            MAX_NAME_LEN
        )));
    }

    if name.trim() != name {
        return Err(StewardError::ValidationError(format!(
            "{} cannot start or end with whitespace",
            field_name
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
    {
        return Err(StewardError::ValidationError(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -, ., space)",
            field_name
        )));
    }

    Ok(())
}

/// Validate tag value
///
/// Requirements:
/// - Not empty, <= 100 characters
/// - Alphanumeric, underscore, hyphen, colon only
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(StewardError::ValidationError(
            "Tag cannot be empty".to_string(),
        ));
    }

    let len = tag.chars().count();
    if len > MAX_TAG_LEN {
        return Err(StewardError::ValidationError(format!(
            "Tag too long: {} > {} characters",
            len,
            MAX_TAG_LEN
        )));
    }

    if !tag
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ':'))
    {
        return Err(StewardError::ValidationError(format!(
            "Tag '{}' contains invalid characters (allowed: alphanumeric, _, -, :)",
            tag
        )));
    }

    Ok(())
}

pub fn validate_tags(tags: &[String]) -> Result<()> {
    tags.iter().try_for_each(|t| validate_tag(t))
}

/// Validate an http(s) URL
///
/// Returns None if valid, Some(error_message) if invalid.
pub fn check_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return Some("URL cannot be empty".to_string());
    }

    if url.len() > MAX_URL_LEN {
        return Some(format!("URL cannot exceed {} characters", MAX_URL_LEN));
    }

    if url.chars().any(|c| c.is_control()) {
        return Some("URL contains invalid characters".to_string());
    }

    let after_scheme = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return Some("URL must start with http:// or https://".to_string()),
    };

    let host = after_scheme.split(['/', '?', '#']).next().unwrap_or("");
    if host.is_empty() {
        return Some("URL must have a host".to_string());
    }

    None
}

pub fn validate_url(url: &str) -> Result<()> {
    match check_url(url) {
        Some(msg) => Err(StewardError::ValidationError(msg)),
        None => Ok(()),
    }
}

/// Validate an ontology IRI (`scheme:rest`)
pub fn validate_iri(iri: &str) -> Result<()> {
    if iri.is_empty() {
        return Err(StewardError::ValidationError(
            "IRI cannot be empty".to_string(),
        ));
    }

    if iri.len() > MAX_URL_LEN {
        return Err(StewardError::ValidationError(format!(
            "IRI cannot exceed {} characters",
            MAX_URL_LEN
        )));
    }

    if iri.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StewardError::ValidationError(
            "IRI cannot contain whitespace".to_string(),
        ));
    }

    let (scheme, rest) = iri.split_once(':').ok_or_else(|| {
        StewardError::ValidationError(format!("IRI '{}' is missing a scheme", iri))
    })?;

    let scheme_ok = scheme
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));

    if !scheme_ok || rest.is_empty() {
        return Err(StewardError::ValidationError(format!(
            "IRI '{}' is not absolute",
            iri
        )));
    }

    Ok(())
}

/// Validate a `YYYY-MM` month string
pub fn validate_month(month: &str, field_name: &str) -> Result<()> {
    let invalid = || {
        StewardError::ValidationError(format!(
            "{} must be formatted YYYY-MM, got '{}'",
            field_name, month
        ))
    };

    let (year, mon) = month.split_once('-').ok_or_else(invalid)?;
    if year.len() != 4 || mon.len() != 2 {
        return Err(invalid());
    }
    if !year
        .bytes()
        .chain(mon.bytes())
        .all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    match mon.parse::<u32>() {
        Ok(1..=12) => Ok(()),
        _ => Err(invalid()),
    }
}

/// Validate an ISO 4217-style currency code (three uppercase letters)
pub fn validate_currency(code: &str) -> Result<()> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(StewardError::ValidationError(format!(
            "Currency must be a three-letter uppercase code, got '{}'",
            code
        )))
    }
}

/// Normalize a search query: trimmed, length-checked, lowercased.
///
/// An empty query is valid and simply matches nothing.
pub fn normalize_search_query(query: &str) -> Result<String> {
    let trimmed = query.trim();

    let len = trimmed.chars().count();
    if len > MAX_SEARCH_QUERY_LEN {
        return Err(StewardError::ValidationError(format!(
            "Search query too long: {} > {} characters",
            len,
            MAX_SEARCH_QUERY_LEN
        )));
    }

    Ok(trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["Customer 360", "sales_daily", "finance.ledger", "v-2"] {
            assert!(validate_name(name, "name").is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("", "name").is_err());
        assert!(validate_name(" padded", "name").is_err());
        assert!(validate_name("semi;colon", "name").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1), "name").is_err());
    }

    #[test]
    fn test_tags() {
        assert!(validate_tag("pii").is_ok());
        assert!(validate_tag("tier:gold").is_ok());
        assert!(validate_tag("has space").is_err());
        assert!(validate_tag("").is_err());
        assert!(validate_tags(&["ok".to_string(), "bad tag".to_string()]).is_err());
    }

    #[test]
    fn test_urls() {
        assert!(check_url("https://wiki.example.com/page").is_none());
        assert!(check_url("http://localhost:8080").is_none());
        assert!(check_url("ftp://example.com").is_some());
        assert!(check_url("https://").is_some());
        assert!(check_url("https:///path").is_some());
        assert!(check_url("https://example.com/\nX-Injected: 1").is_some());
    }

    #[test]
    fn test_iris() {
        assert!(validate_iri("http://example.org/ontology#Customer").is_ok());
        assert!(validate_iri("urn:isbn:0451450523").is_ok());
        assert!(validate_iri("Customer").is_err());
        assert!(validate_iri("1http://x").is_err());
        assert!(validate_iri("http://ex.org/a b").is_err());
        assert!(validate_iri("urn:").is_err());
    }

    #[test]
    fn test_months() {
        assert!(validate_month("2024-01", "start_month").is_ok());
        assert!(validate_month("2024-12", "start_month").is_ok());
        assert!(validate_month("2024-13", "start_month").is_err());
        assert!(validate_month("2024-00", "start_month").is_err());
        assert!(validate_month("24-01", "start_month").is_err());
        assert!(validate_month("2024/01", "start_month").is_err());
        assert!(validate_month("2024-+1", "start_month").is_err());
        assert!(validate_month("+024-01", "start_month").is_err());
    }

    #[test]
    fn test_currency() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("EURO").is_err());
    }

    #[test]
    fn test_normalize_search_query() {
        assert_eq!(normalize_search_query("  Customer ").unwrap(), "customer");
        assert_eq!(normalize_search_query("   ").unwrap(), "");
        assert!(normalize_search_query(&"q".repeat(MAX_SEARCH_QUERY_LEN + 1)).is_err());
    }

    #[test]
    fn test_lengths_count_characters_not_bytes() {
        let query = "é".repeat(300);
        assert_eq!(normalize_search_query(&query).unwrap(), query);
        assert!(normalize_search_query(&"é".repeat(MAX_SEARCH_QUERY_LEN + 1)).is_err());

        assert!(validate_name(&"é".repeat(MAX_NAME_LEN), "name").is_ok());
        assert!(validate_name(&"é".repeat(MAX_NAME_LEN + 1), "name").is_err());
        assert!(validate_tag(&"ü".repeat(MAX_TAG_LEN)).is_ok());
        assert!(validate_tag(&"ü".repeat(MAX_TAG_LEN + 1)).is_err());
    }

    #[test]
    fn test_into_result_joins_errors() {
        assert!(into_result(vec![]).is_ok());
        let err = into_result(vec![
            FieldError::new("name", "empty"),
            FieldError::new("version", "empty"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("name: empty"));
        assert!(msg.contains("version: empty"));
    }
}
