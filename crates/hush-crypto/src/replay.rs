//! Sliding-window validation for record counters.
//!
//! Tolerates mild reordering of inbound records while rejecting anything
//! older than the window and anything already accepted. The check/commit
//! split lets the caller verify the counter before paying for decryption
//! and only mark it seen once authentication succeeds.

use crate::CryptoError;

/// Width of the receive window in counters.
pub const RECORD_WINDOW: u64 = 64;

/// Sliding receive window over 64-bit record counters.
///
/// Bit `i` of the bitmap tracks counter `highest - i`.
#[derive(Debug, Clone)]
pub struct RecordWindow {
    highest: u64,
    bitmap: u64,
    seen_any: bool,
}

impl RecordWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            seen_any: false,
        }
    }

    /// Check whether a counter is acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::OutOfWindow`] if the counter is at or below
    /// `highest - 64`, or has already been accepted.
    pub fn check(&self, counter: u64) -> Result<(), CryptoError> {
        if !self.seen_any {
            return Ok(());
        }

        if counter > self.highest {
            return Ok(());
        }

        let age = self.highest - counter;
        if age >= RECORD_WINDOW {
            return Err(CryptoError::OutOfWindow);
        }

        if self.bitmap & (1u64 << age) != 0 {
            return Err(CryptoError::OutOfWindow);
        }

        Ok(())
    }

    /// Mark a counter as accepted. Call only after `check` passed and the
    /// record authenticated.
    pub fn commit(&mut self, counter: u64) {
        if !self.seen_any {
            self.highest = counter;
            self.bitmap = 1;
            self.seen_any = true;
            return;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            if shift >= RECORD_WINDOW {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = counter;
        } else {
            let age = self.highest - counter;
            if age < RECORD_WINDOW {
                self.bitmap |= 1u64 << age;
            }
        }
    }

    /// Highest counter accepted so far, if any.
    #[must_use]
    pub fn highest(&self) -> Option<u64> {
        self.seen_any.then_some(self.highest)
    }

    /// Reset the window (used on rekey).
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
        self.seen_any = false;
    }
}

impl Default for RecordWindow {
    fn default() -> Self {
        Self::new()
    }
}
