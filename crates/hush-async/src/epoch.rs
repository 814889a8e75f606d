//! Epoch derivation and window validation.
//!
//! An epoch is a coarse wall-clock bucket over which pseudonyms are stable
//! and beyond which stored messages expire. All epoch math routes through
//! the caller-supplied current time, so tests run on a deterministic
//! clock.

use crate::error::AsyncError;

/// Epoch length: 6 hours.
pub const EPOCH_SECS: u64 = 21_600;

/// Acceptance window in epochs on either side of current.
pub const EPOCH_WINDOW: u64 = 3;

/// Derive the epoch for a UNIX timestamp.
#[must_use]
pub fn epoch_from_unix(unix_secs: u64) -> u64 {
    unix_secs / EPOCH_SECS
}

/// Validate a message epoch against the current one.
///
/// Runs before any decryption attempt, so stale traffic costs nothing.
///
/// # Errors
///
/// Returns [`AsyncError::StaleEpoch`] when `|current − epoch| > 3`.
pub fn validate_epoch(current_epoch: u64, message_epoch: u64) -> Result<(), AsyncError> {
    if current_epoch.abs_diff(message_epoch) > EPOCH_WINDOW {
        return Err(AsyncError::StaleEpoch);
    }
    Ok(())
}

/// The epochs a recipient should drain on reconnection: the acceptance
/// window up to and including the current epoch.
#[must_use]
pub fn retrieval_epochs(current_epoch: u64) -> Vec<u64> {
    let start = current_epoch.saturating_sub(EPOCH_WINDOW);
    (start..=current_epoch).collect()
}
