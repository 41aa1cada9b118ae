//! Receiver predicate and payment address derivation.
//!
//! Each payment session gets a fresh 32-byte receiver nonce. The masked
//! predicate's signing secret is HMAC-SHA256(server secret, nonce), so the
//! nonce can be stored and even exposed while only the server can
//! reconstruct the signer. The address is a text form of the predicate
//! reference with a 4-byte checksum.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const PREDICATE_TAG: &[u8] = b"masked-predicate-v1";
const ADDRESS_SCHEME: &str = "DIRECT://";

#[derive(Debug, Clone)]
pub struct ReceiverPredicate {
    pub signing_secret: [u8; 32],
    /// Binds the predicate to one token type
    pub reference: [u8; 32],
}

pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Derive the receiver predicate for `(server secret, nonce, token type)`.
pub fn derive_predicate(
    server_secret: &[u8],
    receiver_nonce: &[u8; 32],
    token_type: &[u8],
) -> ReceiverPredicate {
    // HMAC keys of any length are fine; the server secret was validated at
    // startup to be non-empty hex.
    let mut mac = HmacSha256::new_from_slice(server_secret)
        .expect("HMAC accepts keys of any length");
    mac.update(receiver_nonce);
    let signing_secret: [u8; 32] = mac.finalize().into_bytes().into();

    let signer_digest = Sha256::digest(signing_secret);

    let mut hasher = Sha256::new();
    hasher.update(PREDICATE_TAG);
    hasher.update(signer_digest);
    hasher.update(token_type);
    let reference: [u8; 32] = hasher.finalize().into();

    ReceiverPredicate {
        signing_secret,
        reference,
    }
}

/// Text address clients send tokens to: scheme, reference, checksum.
pub fn payment_address(predicate: &ReceiverPredicate) -> String {
    let checksum = Sha256::digest(predicate.reference);
    format!(
        "{}{}{}",
        ADDRESS_SCHEME,
        hex::encode(predicate.reference),
        hex::encode(&checksum[..4])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"server-secret-for-tests";

    #[test]
    fn derivation_is_deterministic() {
        let nonce = [7u8; 32];
        let a = derive_predicate(SECRET, &nonce, b"tok");
        let b = derive_predicate(SECRET, &nonce, b"tok");
        assert_eq!(a.signing_secret, b.signing_secret);
        assert_eq!(a.reference, b.reference);
    }

    #[test]
    fn nonce_and_token_type_change_the_address() {
        let base = derive_predicate(SECRET, &[1u8; 32], b"tok");
        let other_nonce = derive_predicate(SECRET, &[2u8; 32], b"tok");
        let other_type = derive_predicate(SECRET, &[1u8; 32], b"tok2");

        assert_ne!(payment_address(&base), payment_address(&other_nonce));
        assert_ne!(payment_address(&base), payment_address(&other_type));
    }

    #[test]
    fn address_shape() {
        let predicate = derive_predicate(SECRET, &[9u8; 32], b"tok");
        let address = payment_address(&predicate);
        assert!(address.starts_with("DIRECT://"));
        // 32-byte reference + 4-byte checksum, hex encoded
        assert_eq!(address.len(), "DIRECT://".len() + 64 + 8);
    }

    #[test]
    fn generated_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
