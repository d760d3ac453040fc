//! 3DS key store, key scrambler, and AES wrappers.
//!
//! Keys are never compiled in. They load once per process from
//! `~/.config/rom-peek/keys.toml`:
//!
//! ```toml
//! [keys]
//! ctr-Slot0x3DKeyX = "0123456789abcdef0123456789abcdef"
//! ctr-Slot0x3DKeyY-0 = "..."
//!
//! [verify]
//! # AES-128-ECB of "AES-128-ECB-TEST" under the key of the same name
//! ctr-Slot0x3DKeyX = "..."
//! ```
//!
//! A missing key file is not an error; encrypted formats surface a
//! warning field instead of failing outright.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use log::{debug, warn};

use rom_peek_core::ParseError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Fixed verification plaintext. Each key may carry a reference
/// ciphertext of this block in the key file's `[verify]` table.
pub const VERIFY_PLAINTEXT: &[u8; 16] = b"AES-128-ECB-TEST";

/// Outcome of a keyed operation, surfaced to hosts as a warning field
/// rather than a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    /// The key store has no entry under this name.
    KeyNotFound,
    /// The key failed plaintext verification.
    WrongKey,
    /// No reference ciphertext is on file; the key was used unverified.
    NotVerified,
}

/// Process-wide key registry: read-only after first load.
pub struct KeyManager {
    keys: HashMap<String, [u8; 16]>,
    verify: HashMap<String, [u8; 16]>,
}

fn parse_hex16(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn read_key_table(doc: &toml::Value, table: &str) -> HashMap<String, [u8; 16]> {
    let mut out = HashMap::new();
    let Some(entries) = doc.get(table).and_then(|t| t.as_table()) else {
        return out;
    };
    for (name, value) in entries {
        match value.as_str().and_then(parse_hex16) {
            Some(key) => {
                out.insert(name.clone(), key);
            }
            None => warn!("ignoring malformed key entry {table}.{name}"),
        }
    }
    out
}

impl KeyManager {
    /// Canonical key file path: `~/.config/rom-peek/keys.toml`.
    pub fn key_file_path() -> PathBuf {
        let config = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config.join("rom-peek").join("keys.toml")
    }

    /// The process-wide instance, loaded on first use.
    pub fn instance() -> &'static KeyManager {
        static INSTANCE: OnceLock<KeyManager> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            match std::fs::read_to_string(Self::key_file_path()) {
                Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                    warn!("key file failed to parse: {e}");
                    Self::empty()
                }),
                Err(_) => {
                    debug!("no key file; encrypted formats will be limited");
                    Self::empty()
                }
            }
        })
    }

    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
            verify: HashMap::new(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ParseError> {
        let doc: toml::Value = contents
            .parse()
            .map_err(|e| ParseError::invalid_format(format!("keys.toml: {e}")))?;
        Ok(Self {
            keys: read_key_table(&doc, "keys"),
            verify: read_key_table(&doc, "verify"),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<[u8; 16], ParseError> {
        self.keys
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::missing_key(name))
    }

    /// Fetch a key and, when a reference ciphertext is on file, check
    /// that encrypting the fixed plaintext under it reproduces the
    /// reference.
    pub fn get_and_verify(&self, name: &str) -> Result<([u8; 16], VerifyResult), ParseError> {
        let key = self.get(name)?;
        match self.verify.get(name) {
            Some(reference) => {
                if &aes_ecb_encrypt_block(&key, VERIFY_PLAINTEXT) == reference {
                    Ok((key, VerifyResult::Ok))
                } else {
                    Err(ParseError::wrong_key(name))
                }
            }
            None => Ok((key, VerifyResult::NotVerified)),
        }
    }
}

/// Encrypt one block in AES-128-ECB. Used for key verification only.
pub fn aes_ecb_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

// -- Key scrambler --

/// The CTR key scrambler constant (public; the secrets are the keys).
const SCRAMBLER_CONSTANT: u128 = 0x1FF9_E9AA_C5FE_0408_0245_91DC_5D52_768A;

/// Derive KeyNormal from a KeyX/KeyY pair using the fixed CTR mixing
/// function: `rol((rol(x, 2) ^ y) + C, 87)` over 128-bit values.
pub fn scramble_ctr(key_x: &[u8; 16], key_y: &[u8; 16]) -> [u8; 16] {
    let x = u128::from_be_bytes(*key_x);
    let y = u128::from_be_bytes(*key_y);
    let normal = (x.rotate_left(2) ^ y)
        .wrapping_add(SCRAMBLER_CONSTANT)
        .rotate_left(87);
    normal.to_be_bytes()
}

// -- Cipher wrappers --

/// AES-128-CTR decrypt-in-place with a 128-bit big-endian counter.
pub struct AesCtrCipher {
    key: [u8; 16],
}

impl AesCtrCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Decrypt `buf` with the counter starting at `counter`. The
    /// buffer must start on an AES block boundary of the stream.
    pub fn decrypt(&self, counter: u128, buf: &mut [u8]) -> Result<(), ParseError> {
        let iv = counter.to_be_bytes();
        let mut cipher = Aes128Ctr::new_from_slices(&self.key, &iv)
            .map_err(|_| ParseError::invalid_format("bad AES-CTR key/counter length"))?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

/// AES-128-CBC decrypt-in-place.
pub struct AesCbcCipher {
    key: [u8; 16],
}

impl AesCbcCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Decrypt `buf` (a multiple of 16 bytes) under `iv`.
    pub fn decrypt(&self, iv: &[u8; 16], buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() % 16 != 0 {
            return Err(ParseError::invalid_format(
                "CBC buffer not block-aligned",
            ));
        }
        let mut cipher = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| ParseError::invalid_format("bad AES-CBC key/IV length"))?;
        for block in buf.chunks_exact_mut(16) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// Encrypt-in-place counterpart used by tests to fabricate encrypted
/// images.
#[cfg(test)]
pub(crate) fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    use cipher::BlockEncryptMut;
    type Aes128CbcEnc = cbc::Encryptor<Aes128>;
    let mut cipher = Aes128CbcEnc::new_from_slices(key, iv).expect("fixed lengths");
    for block in buf.chunks_exact_mut(16) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}
