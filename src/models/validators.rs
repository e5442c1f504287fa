use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;
use validator::ValidationError;

/// Regex for validating SQL identifiers (table and column names).
///
/// Identifiers end up interpolated into generated SQL, so only plain
/// ASCII names are accepted: a letter or underscore followed by letters,
/// digits, underscores or `$`.
pub static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap());

/// Maximum identifier length accepted by every supported database family.
///
/// PostgreSQL truncates at 63 bytes; the `archive_` prefix takes 8 of those.
/// The `length(max = 55)` attributes on policy inputs mirror this value.
pub const MAX_IDENTIFIER_LENGTH: usize = 55;

/// Check a table or column name against [`IDENTIFIER_REGEX`].
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IDENTIFIER_LENGTH && IDENTIFIER_REGEX.is_match(name)
}

/// Validate the archival/deletion windows of a policy.
///
/// Rows must be archived before they become eligible for purging, so the
/// deletion window has to be strictly longer than the archival window.
pub fn validate_windows(archival_days: u32, deletion_days: u32) -> Result<(), ValidationError> {
    if archival_days == 0 {
        let mut err = ValidationError::new("archival_days_zero");
        err.message = Some(Cow::Borrowed("archival_days must be at least 1"));
        return Err(err);
    }
    if deletion_days <= archival_days {
        let mut err = ValidationError::new("deletion_before_archival");
        err.message = Some(Cow::Owned(format!(
            "deletion_days ({}) must be greater than archival_days ({})",
            deletion_days, archival_days
        )));
        return Err(err);
    }
    Ok(())
}
