//! Permutation seed derivation.
//!
//! Every storage server gets a deterministic, fixed-length seed used by the
//! placement logic to permute the server list per storage index. The seed
//! comes from the announcement when the server publishes one explicitly, from
//! the server's public-key identity when it has one, and from a hash of the
//! raw identity bytes as the last resort.

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

use crate::announcement::ServerId;
use crate::error::{GridError, Result};

/// Decodes the lowercase, unpadded base32 used on the wire.
pub fn base32_decode(s: &str) -> Result<Vec<u8>> {
    BASE32_NOPAD
        .decode(s.to_ascii_uppercase().as_bytes())
        .map_err(|e| GridError::SeedDecode(format!("invalid base32 {s:?}: {e}")))
}

/// Encodes bytes to the lowercase, unpadded base32 used on the wire.
pub fn base32_encode(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

/// Derives the permutation seed for one server.
///
/// Resolution order:
///
/// 1. An explicit `permutation-seed-base32` value from the announcement,
///    decoded. A present-but-malformed explicit seed is a hard error: it
///    points at an unrecoverable identity problem in the configuration.
/// 2. The hash embedded in a `v0-<base32>` server identity.
/// 3. A legacy pubkey suffix, for static entries configured with a bare
///    base32 key instead of a versioned identity.
/// 4. SHA-256 of the raw identity bytes.
pub fn derive_permutation_seed(
    server_id: &ServerId,
    explicit_seed_b32: Option<&str>,
    legacy_pubkey_suffix: Option<&str>,
) -> Result<Vec<u8>> {
    if let Some(seed) = explicit_seed_b32 {
        return base32_decode(seed);
    }

    if let Some(suffix) = server_id.as_bytes().strip_prefix(b"v0-") {
        if let Ok(s) = std::str::from_utf8(suffix) {
            if let Ok(embedded) = base32_decode(s) {
                return Ok(embedded);
            }
        }
    }

    if let Some(suffix) = legacy_pubkey_suffix {
        if let Ok(embedded) = base32_decode(suffix) {
            return Ok(embedded);
        }
    }

    Ok(Sha256::digest(server_id.as_bytes()).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_seed_wins() {
        // An explicit seed overrides the decodable v0- identity.
        let id = ServerId::from("v0-4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia");
        let explicit = "w5gl5igiexhwmftwzhai5jy2jixn7yx7";
        let seed = derive_permutation_seed(&id, Some(explicit), None).unwrap();
        assert_eq!(seed, base32_decode(explicit).unwrap());
    }

    #[test]
    fn test_pubkey_identity_seed() {
        let k = "4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia";
        let id = ServerId::from(format!("v0-{k}").as_str());
        let seed = derive_permutation_seed(&id, None, None).unwrap();
        assert_eq!(seed, base32_decode(k).unwrap());
    }

    #[test]
    fn test_hashed_identity_seed() {
        let id = ServerId::from("unparseable");
        let seed = derive_permutation_seed(&id, None, None).unwrap();
        assert_eq!(seed, Sha256::digest(b"unparseable").to_vec());
    }

    #[test]
    fn test_legacy_pubkey_suffix() {
        let k = "4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia";
        let id = ServerId::from("some-configured-name");
        let seed = derive_permutation_seed(&id, None, Some(k)).unwrap();
        assert_eq!(seed, base32_decode(k).unwrap());
    }

    #[test]
    fn test_malformed_explicit_seed_is_error() {
        let id = ServerId::from("v0-4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia");
        let result = derive_permutation_seed(&id, Some("0189"), None);
        assert!(matches!(result, Err(GridError::SeedDecode(_))));
    }

    #[test]
    fn test_malformed_v0_identity_falls_back_to_hash() {
        // "0" and "1" aren't in the base32 alphabet, so the suffix can't
        // decode; the identity hash is used instead.
        let id = ServerId::from("v0-010101");
        let seed = derive_permutation_seed(&id, None, None).unwrap();
        assert_eq!(seed, Sha256::digest(b"v0-010101").to_vec());
    }

    #[test]
    fn test_base32_round_trip() {
        let encoded = base32_encode(b"permutationseed");
        assert_eq!(base32_decode(&encoded).unwrap(), b"permutationseed");
    }
}
