//! Symmetric envelope codec.
//!
//! Seals one message body under a [`SessionKey`] with AES-256-CBC.
//!
//! ```text
//! seal:  plaintext ─pad(32)─► AES-256-CBC(key, iv) ─► base64(iv ‖ ciphertext)
//! open:  base64 ─decode─► split iv ─► decrypt ─► verify + strip padding
//! ```
//!
//! Padding fills to a multiple of [`PAD_BLOCK`] bytes; every pad byte holds
//! the pad length, so an already aligned message gains one full block. The IV
//! is fresh per call. The output alphabet is standard base64 and therefore
//! never contains the frame terminator.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

use super::keys::SessionKey;
use super::{IV_SIZE, PAD_BLOCK};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors from opening an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Envelope is not valid base64
    #[error("Envelope is not valid base64: {0}")]
    Encoding(String),

    /// Decoded data shorter than an IV plus one block
    #[error("Envelope too short: {0} bytes")]
    TooShort(usize),

    /// Ciphertext is not a whole number of pad blocks
    #[error("Ciphertext length {0} is not a multiple of the block size")]
    Misaligned(usize),

    /// Cipher rejected the input
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Pad bytes do not describe the pad length
    #[error("Invalid padding")]
    BadPadding,

    /// Text-mode payload is not UTF-8
    #[error("Envelope payload is not UTF-8")]
    NotUtf8,
}

/// Seal `plaintext` under `key`, returning the base64 envelope bytes.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    seal_with_iv(key, &iv, plaintext)
}

/// Seal a UTF-8 string.
pub fn seal_str(key: &SessionKey, plaintext: &str) -> Vec<u8> {
    seal(key, plaintext.as_bytes())
}

fn seal_with_iv(key: &SessionKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let padded = pad(plaintext);
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), iv.into())
        .encrypt_padded_vec_mut::<NoPadding>(&padded);

    let mut raw = Vec::with_capacity(IV_SIZE + ciphertext.len());
    raw.extend_from_slice(iv);
    raw.extend_from_slice(&ciphertext);

    STANDARD.encode(raw).into_bytes()
}

/// Open an envelope produced by [`seal`].
pub fn open(key: &SessionKey, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let raw = STANDARD
        .decode(envelope)
        .map_err(|e| EnvelopeError::Encoding(e.to_string()))?;

    if raw.len() < IV_SIZE + PAD_BLOCK {
        return Err(EnvelopeError::TooShort(raw.len()));
    }

    let (iv, ciphertext) = raw.split_at(IV_SIZE);
    if ciphertext.len() % PAD_BLOCK != 0 {
        return Err(EnvelopeError::Misaligned(ciphertext.len()));
    }

    let iv: [u8; IV_SIZE] = iv
        .try_into()
        .map_err(|_| EnvelopeError::TooShort(raw.len()))?;

    let padded = Aes256CbcDec::new(key.as_bytes().into(), (&iv).into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| EnvelopeError::DecryptionFailed)?;

    unpad(padded)
}

/// Open an envelope and require a UTF-8 payload.
pub fn open_str(key: &SessionKey, envelope: &[u8]) -> Result<String, EnvelopeError> {
    let bytes = open(key, envelope)?;
    String::from_utf8(bytes).map_err(|_| EnvelopeError::NotUtf8)
}

fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = PAD_BLOCK - data.len() % PAD_BLOCK;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
    let pad_len = match data.last() {
        Some(&n) => n as usize,
        None => return Err(EnvelopeError::BadPadding),
    };

    if pad_len == 0 || pad_len > PAD_BLOCK || pad_len > data.len() {
        return Err(EnvelopeError::BadPadding);
    }

    let body_len = data.len() - pad_len;
    if data[body_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(EnvelopeError::BadPadding);
    }

    data.truncate(body_len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SESSION_KEY_SIZE;

    fn test_key() -> SessionKey {
        SessionKey::from_bytes([0x42u8; SESSION_KEY_SIZE])
    }

    fn test_iv() -> [u8; IV_SIZE] {
        [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
    }

    #[test]
    fn test_seal_open() {
        let key = test_key();
        let envelope = seal(&key, b"200");
        assert_eq!(open(&key, &envelope).unwrap(), b"200");
    }

    #[test]
    fn test_seal_is_base64_without_terminator() {
        let envelope = seal(&test_key(), &[0x0d, 0x0a, 0x00, 0xff]);
        assert!(envelope
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')));
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = test_key();
        assert_ne!(seal(&key, b"same"), seal(&key, b"same"));
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let key = test_key();
        assert_eq!(
            seal_with_iv(&key, &test_iv(), b"same"),
            seal_with_iv(&key, &test_iv(), b"same")
        );
    }

    #[test]
    fn test_padding_lengths() {
        assert_eq!(pad(b"").len(), PAD_BLOCK);
        assert_eq!(pad(&[0u8; 31]).len(), PAD_BLOCK);
        assert_eq!(pad(&[0u8; 32]).len(), 2 * PAD_BLOCK);
        assert_eq!(*pad(&[0u8; 32]).last().unwrap() as usize, PAD_BLOCK);
        assert_eq!(*pad(&[0u8; 30]).last().unwrap(), 2);
    }

    #[test]
    fn test_unpad_rejects_inconsistent_bytes() {
        let mut padded = pad(b"hello");
        let idx = padded.len() - 2;
        padded[idx] ^= 0x01;
        assert_eq!(unpad(padded), Err(EnvelopeError::BadPadding));

        assert_eq!(unpad(vec![0u8; 32]), Err(EnvelopeError::BadPadding));
        assert_eq!(unpad(vec![33u8; 32]), Err(EnvelopeError::BadPadding));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = seal(&test_key(), b"{\"pressure\":1013.2}");
        let other = SessionKey::from_bytes([0x24u8; SESSION_KEY_SIZE]);
        assert_ne!(
            open(&other, &envelope).ok(),
            Some(b"{\"pressure\":1013.2}".to_vec())
        );
    }

    #[test]
    fn test_structural_failures_are_typed() {
        let key = test_key();

        assert!(matches!(
            open(&key, b"not base64!!"),
            Err(EnvelopeError::Encoding(_))
        ));

        let short = STANDARD.encode([0u8; IV_SIZE + 4]);
        assert_eq!(
            open(&key, short.as_bytes()),
            Err(EnvelopeError::TooShort(IV_SIZE + 4))
        );

        let misaligned = STANDARD.encode([0u8; IV_SIZE + PAD_BLOCK + 16]);
        assert_eq!(
            open(&key, misaligned.as_bytes()),
            Err(EnvelopeError::Misaligned(PAD_BLOCK + 16))
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_open_inverts_seal(body in proptest::collection::vec(proptest::num::u8::ANY, 0..4096)) {
            let key = test_key();
            proptest::prop_assert_eq!(open(&key, &seal(&key, &body)).unwrap(), body);
        }

        #[test]
        fn prop_text_mode_inverts(text in "\\PC{0,512}") {
            let key = test_key();
            proptest::prop_assert_eq!(open_str(&key, &seal_str(&key, &text)).unwrap(), text);
        }
    }

    #[test]
    fn test_text_mode() {
        let key = test_key();
        let envelope = seal_str(&key, "Città: Roma");
        assert_eq!(open_str(&key, &envelope).unwrap(), "Città: Roma");

        let binary = seal(&key, &[0xff, 0xfe]);
        assert_eq!(open_str(&key, &binary), Err(EnvelopeError::NotUtf8));
    }
}
