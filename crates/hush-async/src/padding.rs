//! Standard-bucket padding.
//!
//! Plaintext entrusted to relays is zero-padded to the smallest standard
//! bucket that fits, so stored ciphertext lengths form a small privacy set
//! instead of leaking message sizes. The true length travels inside the
//! padding as a 2-byte prefix, under the AEAD.

use crate::error::AsyncError;

/// Standard padded sizes.
pub const SIZE_BUCKETS: &[usize] = &[256, 512, 1024, 2048, 4096, 8192, 16384];

/// Length-prefix overhead inside the padded plaintext.
const LEN_PREFIX: usize = 2;

/// Largest message that fits the top bucket.
pub const MAX_PADDED_MESSAGE: usize = 16384 - LEN_PREFIX;

/// The smallest bucket holding `len` payload bytes plus the prefix.
///
/// # Errors
///
/// Returns [`AsyncError::Malformed`] for messages beyond the top bucket.
pub fn bucket_for(len: usize) -> Result<usize, AsyncError> {
    let needed = len + LEN_PREFIX;
    SIZE_BUCKETS
        .iter()
        .find(|&&bucket| bucket >= needed)
        .copied()
        .ok_or_else(|| AsyncError::Malformed(format!("message of {len} bytes exceeds padding")))
}

/// Pad a plaintext to its bucket: `len(2, BE) ‖ data ‖ zeros`.
///
/// # Errors
///
/// Returns [`AsyncError::Malformed`] for oversized messages.
pub fn pad(plaintext: &[u8]) -> Result<Vec<u8>, AsyncError> {
    let bucket = bucket_for(plaintext.len())?;

    let mut padded = Vec::with_capacity(bucket);
    let len = u16::try_from(plaintext.len())
        .map_err(|_| AsyncError::Malformed("length prefix overflow".into()))?;
    padded.extend_from_slice(&len.to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(bucket, 0);
    Ok(padded)
}

/// Recover the original plaintext from a padded buffer.
///
/// # Errors
///
/// Returns [`AsyncError::Malformed`] when the buffer is not a valid
/// bucket or the embedded length is inconsistent.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, AsyncError> {
    if !SIZE_BUCKETS.contains(&padded.len()) {
        return Err(AsyncError::Malformed(format!(
            "padded length {} is not a standard bucket",
            padded.len()
        )));
    }

    let len = usize::from(u16::from_be_bytes([padded[0], padded[1]]));
    if LEN_PREFIX + len > padded.len() {
        return Err(AsyncError::Malformed("length prefix out of range".into()));
    }

    Ok(padded[LEN_PREFIX..LEN_PREFIX + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_selection() {
        assert_eq!(bucket_for(0).unwrap(), 256);
        assert_eq!(bucket_for(100).unwrap(), 256);
        assert_eq!(bucket_for(254).unwrap(), 256);
        assert_eq!(bucket_for(255).unwrap(), 512);
        assert_eq!(bucket_for(1372).unwrap(), 2048);
        assert_eq!(bucket_for(MAX_PADDED_MESSAGE).unwrap(), 16384);
        assert!(bucket_for(MAX_PADDED_MESSAGE + 1).is_err());
    }

    #[test]
    fn test_pad_unpad_roundtrip() {
        for len in [0usize, 1, 100, 254, 255, 1000, 1372, 5000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let padded = pad(&plaintext).unwrap();
            assert!(SIZE_BUCKETS.contains(&padded.len()));
            assert_eq!(unpad(&padded).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_same_bucket_same_length() {
        let short = pad(b"hi").unwrap();
        let longer = pad(&[0xaa; 200]).unwrap();
        assert_eq!(short.len(), longer.len());
    }

    #[test]
    fn test_unpad_rejects_nonstandard_length() {
        assert!(unpad(&[0u8; 300]).is_err());
    }

    #[test]
    fn test_unpad_rejects_corrupt_prefix() {
        let mut padded = pad(b"payload").unwrap();
        padded[0] = 0xff;
        padded[1] = 0xff;
        assert!(unpad(&padded).is_err());
    }
}
