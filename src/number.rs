//! Account numbers: digits-only phone numbers and the JIDs derived from them.

use crate::error::SessionError;

/// E.164 allows at most 15 digits; anything under 7 is not a dialable number.
const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

const USER_SERVER: &str = "s.whatsapp.net";

/// Normalize user input (`+263 71-964 7303`, `263719647303@s.whatsapp.net`)
/// to the digits-only account key.
pub fn normalize(raw: &str) -> Result<String, SessionError> {
    let trimmed = raw.trim();
    let user_part = trimmed
        .split_once('@')
        .map(|(user, _)| user)
        .unwrap_or(trimmed);
    // Multi-device JIDs carry a device suffix: 263...:12@s.whatsapp.net
    let user_part = user_part
        .split_once(':')
        .map(|(user, _)| user)
        .unwrap_or(user_part);

    let digits: String = user_part.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(SessionError::InvalidNumber("number is required".into()));
    }
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
        return Err(SessionError::InvalidNumber(format!(
            "`{trimmed}` is not a valid international phone number"
        )));
    }
    Ok(digits)
}

/// Personal chat JID for an account number.
pub fn jid(number: &str) -> String {
    format!("{number}@{USER_SERVER}")
}
