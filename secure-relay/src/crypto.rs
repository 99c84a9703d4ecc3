//! Cryptographic primitives used by the relay.
//!
//! - RSA keypairs protect the one-off transfer of a session key
//!   (PKCS#1 v1.5 encryption padding).
//! - AES in ECB mode with PKCS#7 padding encrypts every chat line under that
//!   session key. The mode is deterministic: equal plaintexts under one key
//!   produce equal ciphertexts, and nothing beyond the padding check guards
//!   integrity.
//! - Standard base64 turns binary values into single-line text.
//!
//! Everything here is stateless and knows nothing about the network.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};
use zeroize::Zeroizing;

use crate::error::{RelayError, RelayResult};

/// Bytes of PKCS#1 v1.5 padding that every RSA block carries.
pub const PKCS1_OVERHEAD: usize = 11;

const AES_BLOCK_LEN: usize = 16;

/// A server's RSA keypair. The private half never leaves the process.
#[derive(Clone)]
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.public_key.size() * 8
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}

/// Symmetric key for one connection. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Zeroizing<Vec<u8>>);

impl SessionKey {
    /// Wraps raw key material, accepting AES-128, AES-192 and AES-256 lengths.
    pub fn from_bytes(bytes: &[u8]) -> RelayResult<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(Zeroizing::new(bytes.to_vec()))),
            other => Err(RelayError::Key(format!(
                "session key must be 16, 24 or 32 bytes, got {other}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({} bits)", self.bits())
    }
}

pub fn generate_keypair(bits: usize) -> RelayResult<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|err| RelayError::Key(format!("RSA key generation failed: {err}")))?;
    Ok(KeyPair::from_private_key(private_key))
}

/// Base64 of the X.509 SubjectPublicKeyInfo DER encoding.
pub fn encode_public_key(public_key: &RsaPublicKey) -> RelayResult<String> {
    let der = public_key
        .to_public_key_der()
        .map_err(|err| RelayError::Key(format!("public key encoding failed: {err}")))?;
    Ok(text_encode(der.as_bytes()))
}

pub fn decode_public_key(text: &str) -> RelayResult<RsaPublicKey> {
    let der = text_decode(text.trim())?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|err| RelayError::Format(format!("invalid public key: {err}")))
}

/// Base64 of the PKCS#8 DER encoding.
pub fn encode_private_key(private_key: &RsaPrivateKey) -> RelayResult<Zeroizing<String>> {
    let der = private_key
        .to_pkcs8_der()
        .map_err(|err| RelayError::Key(format!("private key encoding failed: {err}")))?;
    Ok(Zeroizing::new(text_encode(der.as_bytes())))
}

pub fn decode_private_key(text: &str) -> RelayResult<RsaPrivateKey> {
    let der = Zeroizing::new(text_decode(text.trim())?);
    RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|err| RelayError::Format(format!("invalid private key: {err}")))
}

/// Largest payload a single RSA block can carry under `public_key`.
pub fn max_wrap_len(public_key: &RsaPublicKey) -> usize {
    public_key.size().saturating_sub(PKCS1_OVERHEAD)
}

pub fn asymmetric_encrypt(data: &[u8], public_key: &RsaPublicKey) -> RelayResult<Vec<u8>> {
    let limit = max_wrap_len(public_key);
    if data.len() > limit {
        return Err(RelayError::Key(format!(
            "payload of {} bytes exceeds the {limit}-byte RSA limit",
            data.len()
        )));
    }

    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|err| RelayError::Key(format!("RSA encryption failed: {err}")))
}

pub fn asymmetric_decrypt(data: &[u8], private_key: &RsaPrivateKey) -> RelayResult<Vec<u8>> {
    private_key
        .decrypt(Pkcs1v15Encrypt, data)
        .map_err(|err| RelayError::Integrity(format!("RSA decryption failed: {err}")))
}

pub fn generate_session_key(bits: usize) -> RelayResult<SessionKey> {
    if !matches!(bits, 128 | 192 | 256) {
        return Err(RelayError::Key(format!(
            "unsupported session key size {bits}; use 128, 192 or 256"
        )));
    }

    let mut bytes = Zeroizing::new(vec![0u8; bits / 8]);
    OsRng.fill_bytes(&mut bytes[..]);
    SessionKey::from_bytes(&bytes)
}

pub fn symmetric_encrypt(plaintext: &[u8], key: &SessionKey) -> RelayResult<Vec<u8>> {
    let key = key.as_bytes();
    match key.len() {
        16 => seal_with::<Aes128>(key, plaintext),
        24 => seal_with::<Aes192>(key, plaintext),
        _ => seal_with::<Aes256>(key, plaintext),
    }
}

pub fn symmetric_decrypt(ciphertext: &[u8], key: &SessionKey) -> RelayResult<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(RelayError::Integrity(format!(
            "ciphertext length {} is not a positive multiple of {AES_BLOCK_LEN}",
            ciphertext.len()
        )));
    }

    let key = key.as_bytes();
    match key.len() {
        16 => open_with::<Aes128>(key, ciphertext),
        24 => open_with::<Aes192>(key, ciphertext),
        _ => open_with::<Aes256>(key, ciphertext),
    }
}

fn seal_with<C>(key: &[u8], plaintext: &[u8]) -> RelayResult<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let cipher = ecb::Encryptor::<C>::new_from_slice(key)
        .map_err(|_| RelayError::Key(format!("invalid AES key length {}", key.len())))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn open_with<C>(key: &[u8], ciphertext: &[u8]) -> RelayResult<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let cipher = ecb::Decryptor::<C>::new_from_slice(key)
        .map_err(|_| RelayError::Key(format!("invalid AES key length {}", key.len())))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| RelayError::Integrity("invalid PKCS#7 padding".to_string()))
}

pub fn text_encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn text_decode(text: &str) -> RelayResult<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(text)?)
}
