//! Input checks applied before any request is built

use crate::{constants::MAX_COIN_ID_LENGTH, error::ApiError};

/// Accepts non-empty ids of ASCII letters, digits and hyphens, up to
/// `MAX_COIN_ID_LENGTH` characters
pub fn validate_coin_id(coin_id: &str) -> Result<(), ApiError> {
    if coin_id.is_empty() {
        return Err(ApiError::validation("coin id must not be empty"));
    }
    if coin_id.len() > MAX_COIN_ID_LENGTH {
        return Err(ApiError::validation(format!(
            "coin id longer than {} characters",
            MAX_COIN_ID_LENGTH
        )));
    }
    if let Some(c) = coin_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
    {
        return Err(ApiError::validation(format!(
            "coin id {:?} contains invalid character {:?}",
            coin_id, c
        )));
    }
    Ok(())
}

/// Chart windows must cover at least one day
pub fn validate_chart_days(days: u32) -> Result<(), ApiError> {
    if days == 0 {
        return Err(ApiError::validation("chart days must be at least 1"));
    }
    Ok(())
}
