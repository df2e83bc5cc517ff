//! Vault cryptography.
//!
//! The vault is one base64 blob whose decoded layout is:
//!
//! ```text
//! salt[16] || nonce[12] || ChaCha20-Poly1305 ciphertext-with-tag
//! ```
//!
//! The symmetric key is derived from the operator password with Argon2id
//! (t=1, m=64 MiB, p=4, 32-byte key) over the per-encryption random salt.
//! A fresh salt and nonce are drawn for every encryption, so re-encrypting
//! the same plaintext never produces the same blob.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use drover_platform::{DroverError, DroverResult};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Length of the Argon2id salt prefix.
pub const SALT_LEN: usize = 16;

/// Length of the ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

/// Combined salt + nonce header length; decoded blobs at or below this
/// length carry no ciphertext.
pub const HEADER_LEN: usize = SALT_LEN + NONCE_LEN;

/// Argon2id parameters for the vault key derivation.
const ARGON2_TIME: u32 = 1;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_LANES: u32 = 4;

/// Derives the 32-byte vault key from a password and salt.
fn derive_key(password: &str, salt: &[u8]) -> DroverResult<[u8; 32]> {
    let params = argon2::Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME, ARGON2_LANES, Some(32))
        .map_err(|e| DroverError::BadCiphertext(format!("bad key derivation parameters: {}", e)))?;
    let kdf = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    kdf.hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| DroverError::BadCiphertext(format!("key derivation failed: {}", e)))?;

    Ok(key)
}

/// Encrypts `plaintext` under `password`.
///
/// Returns the base64 bytes written to the vault file. Only randomness
/// acquisition can realistically fail here.
pub fn encrypt(plaintext: &[u8], password: &str) -> DroverResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let mut key_bytes = derive_key(password, &salt)?;
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
        .map_err(|_| DroverError::BadCiphertext("cipher key setup failed".to_string()))?;
    key_bytes.zeroize();
    let key = LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| DroverError::BadCiphertext("encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + in_out.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&in_out);

    Ok(STANDARD.encode(blob).into_bytes())
}

/// Decrypts a base64 vault blob with `password`.
///
/// # Errors
///
/// Returns [`DroverError::BadCiphertext`] when the base64 decode fails, the
/// decoded blob is shorter than the salt+nonce header, or the AEAD open
/// fails (wrong password or tampered blob).
pub fn decrypt(encoded: &[u8], password: &str) -> DroverResult<Vec<u8>> {
    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| {
            DroverError::BadCiphertext(format!("failed to decode cipher text from base64: {}", e))
        })?;

    if blob.len() < HEADER_LEN {
        return Err(DroverError::BadCiphertext(
            "cipher text shorter than its salt and nonce header".to_string(),
        ));
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce_slice, ciphertext) = rest.split_at(NONCE_LEN);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce_slice);

    let mut key_bytes = derive_key(password, salt)?;
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
        .map_err(|_| DroverError::BadCiphertext("cipher key setup failed".to_string()))?;
    key_bytes.zeroize();
    let key = LessSafeKey::new(unbound);

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| {
            DroverError::BadCiphertext("cipher text failed authentication".to_string())
        })?;

    Ok(plaintext.to_vec())
}

/// SHA-256 of `data` as a lowercase hex string.
///
/// Canonical hash used for deployed file payloads.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sealed = encrypt(b"the quick brown fox", "correct horse").unwrap();
        let opened = decrypt(&sealed, "correct horse").unwrap();
        assert_eq!(opened, b"the quick brown fox");
    }

    #[test]
    fn test_round_trip_empty_plaintext() {
        let sealed = encrypt(b"", "pw").unwrap();
        assert_eq!(decrypt(&sealed, "pw").unwrap(), b"");
    }

    #[test]
    fn test_wrong_password_rejected() {
        let sealed = encrypt(b"payload", "right").unwrap();
        let result = decrypt(&sealed, "wrong");
        assert!(matches!(result, Err(DroverError::BadCiphertext(_))));
    }

    #[test]
    fn test_fresh_salt_per_encryption() {
        let a = encrypt(b"payload", "pw").unwrap();
        let b = encrypt(b"payload", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_not_base64_rejected() {
        let result = decrypt(b"!!! not base64 !!!", "pw");
        assert!(matches!(result, Err(DroverError::BadCiphertext(_))));
    }

    #[test]
    fn test_short_blob_rejected() {
        // 20 decoded bytes: shorter than the 28-byte salt+nonce header.
        let short = STANDARD.encode([0u8; 20]);
        let result = decrypt(short.as_bytes(), "pw");
        assert!(matches!(result, Err(DroverError::BadCiphertext(_))));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
