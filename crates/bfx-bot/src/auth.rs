//! Credential storage.
//!
//! The unlock password is verified against an Argon2id hash stored as
//! hex; the API key pair lives in a separate file encrypted with
//! AES-256-CBC under a key folded from a second Argon2id hash. A full
//! trailing block of sentinel bytes detects a wrong password on
//! decryption.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::io::Write;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PASSWORD_SALT: &[u8] = b"vv9re$Tbvwds@WSg82d1";
const KEY_SALT: &[u8] = b"ktyg9g4$GVw89cf4T@1qfyh3";

const ARGON2_TIME_COST: u32 = 5;
const ARGON2_MEM_KIB: u32 = 2 * 1024;
const ARGON2_LANES: u32 = 1;
const ARGON2_HASH_LEN: usize = 64;

const AES_BLOCK: usize = 16;
/// Fills the trailing block; all bytes must survive decryption intact.
const SENTINEL: u8 = 0x75;

type PromptFn = fn(&str) -> std::io::Result<String>;

fn prompt_secret(label: &str) -> std::io::Result<String> {
    rpassword::prompt_password(label)
}

fn argon2id(password: &[u8], salt: &[u8]) -> AppResult<Zeroizing<[u8; ARGON2_HASH_LEN]>> {
    let params = Params::new(
        ARGON2_MEM_KIB,
        ARGON2_TIME_COST,
        ARGON2_LANES,
        Some(ARGON2_HASH_LEN),
    )
    .map_err(|e| AppError::Auth(format!("bad KDF parameters: {e}")))?;
    let kdf = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; ARGON2_HASH_LEN]);
    kdf.hash_password_into(password, salt, out.as_mut())
        .map_err(|e| AppError::Auth(format!("password hashing failed: {e}")))?;
    Ok(out)
}

/// Hash checked against the password file.
fn password_hash(password: &[u8]) -> AppResult<Zeroizing<[u8; ARGON2_HASH_LEN]>> {
    argon2id(password, PASSWORD_SALT)
}

/// Hash folded into the credential-file cipher key.
fn password_key_hash(password: &[u8]) -> AppResult<Zeroizing<[u8; ARGON2_HASH_LEN]>> {
    argon2id(password, KEY_SALT)
}

/// Fold the 64-byte key hash into a 32-byte AES key: first half XOR
/// second half.
fn fold_cipher_key(key_hash: &[u8; ARGON2_HASH_LEN]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    for (i, b) in key_hash.iter().enumerate() {
        key[i % 32] ^= b;
    }
    key
}

/// Encrypt the API key pair: IV ‖ CBC(`[len:2 LE][apiKey][len:2 LE]
/// [secret]` zero-padded, then one full sentinel block).
fn encrypt_credentials(
    key_hash: &[u8; ARGON2_HASH_LEN],
    api_key: &[u8],
    secret_key: &[u8],
) -> AppResult<Vec<u8>> {
    let key = fold_cipher_key(key_hash);
    let mut iv = [0u8; AES_BLOCK];
    rand::thread_rng().fill_bytes(&mut iv);

    let payload_len = 4 + api_key.len() + secret_key.len();
    let padded_len = payload_len.div_ceil(AES_BLOCK) * AES_BLOCK;
    let mut plain = Zeroizing::new(vec![0u8; padded_len + AES_BLOCK]);
    plain[0] = (api_key.len() & 0xff) as u8;
    plain[1] = (api_key.len() >> 8) as u8;
    plain[2..2 + api_key.len()].copy_from_slice(api_key);
    plain[2 + api_key.len()] = (secret_key.len() & 0xff) as u8;
    plain[3 + api_key.len()] = (secret_key.len() >> 8) as u8;
    plain[4 + api_key.len()..4 + api_key.len() + secret_key.len()].copy_from_slice(secret_key);
    for b in &mut plain[padded_len..] {
        *b = SENTINEL;
    }

    let cipher = Aes256CbcEnc::new_from_slices(key.as_ref(), &iv)
        .map_err(|e| AppError::Auth(format!("cipher setup failed: {e}")))?;
    let mut out = Vec::with_capacity(AES_BLOCK + plain.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&cipher.encrypt_padded_vec_mut::<NoPadding>(&plain));
    Ok(out)
}

/// Decrypt the credential file; a damaged sentinel block means the
/// password was wrong.
fn decrypt_credentials(
    key_hash: &[u8; ARGON2_HASH_LEN],
    data: &[u8],
) -> AppResult<(String, Vec<u8>)> {
    if data.len() < 3 * AES_BLOCK || (data.len() - AES_BLOCK) % AES_BLOCK != 0 {
        return Err(AppError::Auth("auth file is truncated".into()));
    }
    let key = fold_cipher_key(key_hash);
    let (iv, ciphertext) = data.split_at(AES_BLOCK);
    let cipher = Aes256CbcDec::new_from_slices(key.as_ref(), iv)
        .map_err(|e| AppError::Auth(format!("cipher setup failed: {e}")))?;
    let plain = Zeroizing::new(
        cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| AppError::Auth("auth file decryption failed".into()))?,
    );

    let body_len = plain.len() - AES_BLOCK;
    if plain[body_len..].iter().any(|b| *b != SENTINEL) {
        return Err(AppError::Auth("wrong password for the auth file".into()));
    }

    let api_key_len = usize::from(plain[0]) | (usize::from(plain[1]) << 8);
    if api_key_len + 4 > body_len {
        return Err(AppError::Auth("auth file payload is malformed".into()));
    }
    let secret_len =
        usize::from(plain[2 + api_key_len]) | (usize::from(plain[3 + api_key_len]) << 8);
    if api_key_len + secret_len + 4 > body_len {
        return Err(AppError::Auth("auth file payload is malformed".into()));
    }

    let api_key = String::from_utf8(plain[2..2 + api_key_len].to_vec())
        .map_err(|_| AppError::Auth("API key is not valid UTF-8".into()))?;
    let secret = plain[4 + api_key_len..4 + api_key_len + secret_len].to_vec();
    Ok((api_key, secret))
}

fn parse_password_file(content: &[u8]) -> AppResult<Vec<u8>> {
    if content.len() < 2 * ARGON2_HASH_LEN {
        return Err(AppError::Auth("password file is too short".into()));
    }
    hex::decode(&content[..2 * ARGON2_HASH_LEN])
        .map_err(|e| AppError::Auth(format!("password file is not hex: {e}")))
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

/// Verify the unlock password and load (or interactively create) the
/// encrypted API credentials.
pub fn authenticate(config: &Config) -> AppResult<(String, Vec<u8>)> {
    authenticate_with(config, prompt_secret)
}

fn authenticate_with(config: &Config, prompt: PromptFn) -> AppResult<(String, Vec<u8>)> {
    let expected = parse_password_file(&std::fs::read(&config.password_file)?)?;
    let password = Zeroizing::new(prompt("Enter password: ")?.into_bytes());

    let hash = password_hash(&password)?;
    if hash.as_ref() != expected.as_slice() {
        return Err(AppError::Auth("wrong password".into()));
    }
    let key_hash = password_key_hash(&password)?;

    match std::fs::read(&config.auth_file) {
        Ok(data) => decrypt_credentials(&key_hash, &data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // First run: capture the API keys and persist them encrypted.
            let api_key = prompt("Enter APIKey: ")?;
            let secret = Zeroizing::new(prompt("Enter SecretKey: ")?.into_bytes());
            let data = encrypt_credentials(&key_hash, api_key.as_bytes(), &secret)?;
            write_private(&config.auth_file, &data)?;
            info!(path = %config.auth_file.display(), "auth file created");
            Ok((api_key, secret.to_vec()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Interactively create the password file for `genpassword`.
pub fn gen_password_file(path: &Path) -> AppResult<()> {
    gen_password_file_with(path, prompt_secret)
}

fn gen_password_file_with(path: &Path, prompt: PromptFn) -> AppResult<()> {
    let password = Zeroizing::new(prompt("Enter password: ")?.into_bytes());
    let confirm = Zeroizing::new(prompt("Confirm password: ")?.into_bytes());
    if *password != *confirm {
        return Err(AppError::Auth("passwords do not match".into()));
    }
    let hash = password_hash(&password)?;
    write_private(path, hex::encode(hash.as_ref()).as_bytes())?;
    info!(path = %path.display(), "password file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_deterministic_and_domain_separated() {
        let a = password_hash(b"hunter2").unwrap();
        let b = password_hash(b"hunter2").unwrap();
        assert_eq!(a.as_ref(), b.as_ref());

        let key = password_key_hash(b"hunter2").unwrap();
        assert_ne!(a.as_ref(), key.as_ref());
    }

    #[test]
    fn test_credentials_roundtrip() {
        let key_hash = password_key_hash(b"hunter2").unwrap();
        let data =
            encrypt_credentials(&key_hash, b"api-key-1234", b"secret-key-5678-abcdef").unwrap();
        // IV plus at least payload and sentinel blocks.
        assert!(data.len() >= 3 * AES_BLOCK);
        assert_eq!(data.len() % AES_BLOCK, 0);

        let (api_key, secret) = decrypt_credentials(&key_hash, &data).unwrap();
        assert_eq!(api_key, "api-key-1234");
        assert_eq!(secret, b"secret-key-5678-abcdef");
    }

    #[test]
    fn test_wrong_password_detected_by_sentinel() {
        let right = password_key_hash(b"hunter2").unwrap();
        let wrong = password_key_hash(b"hunter3").unwrap();
        let data = encrypt_credentials(&right, b"key", b"secret").unwrap();
        let err = decrypt_credentials(&wrong, &data).unwrap_err();
        assert!(matches!(err, AppError::Auth(msg) if msg.contains("wrong password")));
    }

    #[test]
    fn test_truncated_auth_file_rejected() {
        let key_hash = password_key_hash(b"hunter2").unwrap();
        assert!(decrypt_credentials(&key_hash, &[0u8; 17]).is_err());
    }

    #[test]
    fn test_password_file_format() {
        let hash = password_hash(b"hunter2").unwrap();
        let hex_content = hex::encode(hash.as_ref());
        assert_eq!(hex_content.len(), 2 * ARGON2_HASH_LEN);
        let parsed = parse_password_file(hex_content.as_bytes()).unwrap();
        assert_eq!(parsed.as_slice(), hash.as_ref());
        // A trailing newline does not break parsing.
        let parsed = parse_password_file(format!("{hex_content}\n").as_bytes()).unwrap();
        assert_eq!(parsed.as_slice(), hash.as_ref());
    }

    #[test]
    fn test_fold_cipher_key_xors_halves() {
        let mut hash = [0u8; ARGON2_HASH_LEN];
        hash[0] = 0b1010_0000;
        hash[32] = 0b0000_1010;
        let key = fold_cipher_key(&hash);
        assert_eq!(key[0], 0b1010_1010);
    }
}
