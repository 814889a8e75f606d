//! BLAKE3 hashing and HKDF-style key derivation.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// HKDF-Extract: extract a pseudorandom key from input key material.
///
/// Follows the RFC 5869 extract shape with BLAKE3 keyed hashing in place
/// of HMAC.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: expand a pseudorandom key into arbitrary-length output.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);

    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}

/// HKDF: combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
}

/// Key derivation scoped to a static context string.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key from input key material.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        hkdf(self.context.as_bytes(), ikm, b"hush", &mut output);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"input"), hash(b"input"));
        assert_ne!(hash(b"input"), hash(b"other"));
    }

    #[test]
    fn test_hkdf_deterministic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf(b"salt", b"ikm", b"info", &mut a);
        hkdf(b"salt", b"ikm", b"info", &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hkdf_info_separation() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf(b"salt", b"ikm", b"info-a", &mut a);
        hkdf(b"salt", b"ikm", b"info-b", &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hkdf_salt_separation() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf(b"salt-a", b"ikm", b"info", &mut a);
        hkdf(b"salt-b", b"ikm", b"info", &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hkdf_expand_lengths() {
        let prk = hkdf_extract(b"salt", b"ikm");
        let mut long = [0u8; 64];
        let mut short = [0u8; 16];
        hkdf_expand(&prk, b"info", &mut long);
        hkdf_expand(&prk, b"info", &mut short);
        // Prefix property of the XOF output
        assert_eq!(&long[..16], &short[..]);
    }

    #[test]
    fn test_kdf_context_separation() {
        let a = Kdf::new("context-a").derive_key(b"ikm");
        let b = Kdf::new("context-b").derive_key(b"ikm");
        assert_ne!(a, b);
    }
}
