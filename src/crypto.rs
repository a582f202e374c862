//! HMACVerifier / Decryptor.
//!
//! Two operating modes selected by archive version: legacy per-file HMAC
//! (v2/v3) and scrypt-authenticated encryption (v4). Both surface the
//! same opaque `BadPassphrase` error on any failure so a tampered
//! archive cannot be distinguished from a wrong key by the caller.

use crate::error::{RestoreError, Result};
use aes::Aes256;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use scrypt::Params as ScryptParams;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

const MAX_HMAC_FILE: usize = 4096;

/// Computes a keyed digest over `data` using `algorithm` with `passphrase`
/// as the key, and compares it (constant time) against `hmac_file`, a
/// single line of lowercase hex.
pub fn verify_legacy_hmac(data: &[u8], hmac_file: &[u8], algorithm: &str, passphrase: &[u8]) -> Result<()> {
    if hmac_file.len() > MAX_HMAC_FILE {
        return Err(RestoreError::BadHeader(".hmac file exceeds 4 KiB".into()));
    }
    let hex_line = std::str::from_utf8(hmac_file)
        .map_err(|_| RestoreError::BadPassphrase)?
        .trim();
    let expected = hex_decode(hex_line).map_err(|_| RestoreError::BadPassphrase)?;

    let computed = match algorithm {
        "SHA1" => hmac_sha1(passphrase, data),
        "SHA256" => hmac_sha256(passphrase, data),
        "SHA512" => hmac_sha512(passphrase, data),
        _ => return Err(RestoreError::BadHeader(format!("unsupported hmac-algorithm `{}`", algorithm))),
    };

    if computed.ct_eq(&expected).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(RestoreError::BadPassphrase)
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Decrypts a legacy (v2/v3) `aes-*-cbc` ciphertext. The passphrase is
/// stretched into a key+IV using the openssl-compatible `EVP_BytesToKey`
/// derivation (MD5-based, single iteration, no salt) that the original
/// tool's `openssl enc` invocation relies on implicitly.
pub fn decrypt_legacy(ciphertext: &[u8], algorithm: &str, passphrase: &[u8]) -> Result<Vec<u8>> {
    let key_len = match algorithm {
        "aes-256-cbc" => 32,
        "aes-192-cbc" => 24,
        "aes-128-cbc" => 16,
        _ => return Err(RestoreError::BadHeader(format!("unsupported crypto-algorithm `{}`", algorithm))),
    };
    let (key, iv) = evp_bytes_to_key(passphrase, key_len, 16);
    match algorithm {
        "aes-256-cbc" => cbc_decrypt::<Aes256>(&key, &iv, ciphertext),
        _ => Err(RestoreError::BadHeader(format!(
            "crypto-algorithm `{}` not implemented",
            algorithm
        ))),
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: cbc::cipher::BlockSizeUser + cbc::cipher::KeyInit + cbc::cipher::BlockDecryptMut + aes::cipher::BlockCipher,
{
    type Decryptor<C> = cbc::Decryptor<C>;
    let cipher = Decryptor::<C>::new_from_slices(key, iv).map_err(|_| RestoreError::BadPassphrase)?;
    let mut buf = ciphertext.to_vec();
    let plaintext = cipher
        .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
        .map_err(|_| RestoreError::BadPassphrase)?;
    Ok(plaintext.to_vec())
}

/// openssl's classic (non-PBKDF2) `EVP_BytesToKey` with MD5, no salt.
fn evp_bytes_to_key(passphrase: &[u8], key_len: usize, iv_len: usize) -> (Vec<u8>, Vec<u8>) {
    let mut material = Vec::with_capacity(key_len + iv_len);
    let mut prev: Vec<u8> = Vec::new();
    while material.len() < key_len + iv_len {
        let mut ctx = md5::Context::new();
        ctx.consume(&prev);
        ctx.consume(passphrase);
        let digest = ctx.compute();
        prev = digest.0.to_vec();
        material.extend_from_slice(&prev);
    }
    material.truncate(key_len + iv_len);
    let iv = material.split_off(key_len);
    (material, iv)
}

/// Per-file password derivation for the v4 authenticated-encryption mode
/// scrypt-stretched password.
pub fn derive_v4_password(backup_id: &str, logical_name: &str, passphrase: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(backup_id.as_bytes());
    out.push(b'!');
    out.extend_from_slice(logical_name.as_bytes());
    out.push(b'!');
    out.extend_from_slice(passphrase);
    out
}

/// Password derivation for the archive header itself in v4 mode.
pub fn derive_v4_header_password(passphrase: &[u8]) -> Vec<u8> {
    let mut out = b"backup-header!".to_vec();
    out.extend_from_slice(passphrase);
    out
}

const SCRYPT_SALT_LEN: usize = 16;
const SCRYPT_NONCE_LEN: usize = 12;

/// Decrypts a v4 `.enc` payload: `salt(16) || nonce(12) || aead-ciphertext`.
/// The scrypt-stretched key is fed into AES-256-GCM for the AEAD step; an
/// authentication failure is indistinguishable from a wrong password.
pub fn decrypt_v4(ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < SCRYPT_SALT_LEN + SCRYPT_NONCE_LEN {
        return Err(RestoreError::BadPassphrase);
    }
    let (salt, rest) = ciphertext.split_at(SCRYPT_SALT_LEN);
    let (nonce_bytes, payload) = rest.split_at(SCRYPT_NONCE_LEN);

    let params = ScryptParams::new(15, 8, 1, 32).map_err(|_| RestoreError::BadPassphrase)?;
    let mut key = [0u8; 32];
    scrypt::scrypt(password, salt, &params, &mut key).map_err(|_| RestoreError::BadPassphrase)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| RestoreError::BadPassphrase)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, payload)
        .map_err(|_| RestoreError::BadPassphrase)
}

/// Encrypts `plaintext` the way the backup-creation side would have
/// (used only by tests to build fixture archives).
#[cfg(test)]
pub fn encrypt_v4(plaintext: &[u8], password: &[u8]) -> Vec<u8> {
    use rand::RngCore;
    let mut salt = [0u8; SCRYPT_SALT_LEN];
    let mut nonce_bytes = [0u8; SCRYPT_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let params = ScryptParams::new(15, 8, 1, 32).unwrap();
    let mut key = [0u8; 32];
    scrypt::scrypt(password, &salt, &params, &mut key).unwrap();
    let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut out = salt.to_vec();
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&cipher.encrypt(nonce, plaintext).unwrap());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_hmac_round_trip() {
        let data = b"hello world";
        let mac = hmac_sha1(b"secret", data);
        let hex_line = mac.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        assert!(verify_legacy_hmac(data, hex_line.as_bytes(), "SHA1", b"secret").is_ok());
        assert!(verify_legacy_hmac(data, hex_line.as_bytes(), "SHA1", b"wrong").is_err());
    }

    #[test]
    fn oversized_hmac_file_rejected() {
        let big = vec![b'a'; MAX_HMAC_FILE + 1];
        assert!(verify_legacy_hmac(b"x", &big, "SHA1", b"k").is_err());
    }

    #[test]
    fn v4_round_trip() {
        let pw = derive_v4_password("B1", "qubes.xml", b"passphrase");
        let ct = encrypt_v4(b"plaintext bytes", &pw);
        let pt = decrypt_v4(&ct, &pw).unwrap();
        assert_eq!(pt, b"plaintext bytes");
    }

    #[test]
    fn v4_wrong_password_fails() {
        let pw = derive_v4_password("B1", "qubes.xml", b"passphrase");
        let ct = encrypt_v4(b"plaintext bytes", &pw);
        let wrong = derive_v4_password("B1", "qubes.xml", b"wrong");
        assert!(matches!(decrypt_v4(&ct, &wrong), Err(RestoreError::BadPassphrase)));
    }

    #[test]
    fn legacy_cbc_round_trip() {
        use cbc::cipher::BlockEncryptMut;
        let (key, iv) = evp_bytes_to_key(b"passphrase", 32, 16);
        let plaintext = b"some plaintext that spans blocks nicely";
        let mut buf = plaintext.to_vec();
        let pad_len = 16 - (buf.len() % 16);
        let enc = cbc::Encryptor::<Aes256>::new_from_slices(&key, &iv).unwrap();
        let ct = enc
            .encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(&buf);
        buf.clear();
        let pt = decrypt_legacy(&ct, "aes-256-cbc", b"passphrase").unwrap();
        assert_eq!(pt, plaintext);
        let _ = pad_len;
    }
}
