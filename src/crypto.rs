//! Encryption Service
//!
//! Stateless primitives for the vault: scrypt key derivation, salt
//! generation and chunked ChaCha20-Poly1305 encryption of whole files.
//!
//! Blob layout:
//!
//! ```text
//! "CVX1" | nonce prefix (7) | chunk 0 | chunk 1 | ... | final chunk
//! ```
//!
//! Every chunk is 64 KiB of plaintext plus a 16-byte tag, except the final
//! one which is shorter and may be empty. The nonce of chunk `i` is
//! `prefix || i as u32 BE || last flag`, and the header is bound in as
//! associated data, so reordering, truncation, extension and header edits all
//! fail authentication.

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::task::{checkpoint, CancellationToken};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const CHUNK_SIZE: usize = 64 * 1024;

const MAGIC: &[u8; 4] = b"CVX1";
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = MAGIC.len() + NONCE_PREFIX_LEN;
const TAG_LEN: usize = 16;

/// scrypt cost parameters, persisted next to the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

impl KdfParams {
    fn scrypt_params(&self) -> Result<scrypt::Params> {
        scrypt::Params::new(self.log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| Error::InvalidConfig(format!("scrypt parameters: {e}")))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_n < 10 {
            return Err(anyhow::anyhow!("kdf log_n must be at least 10"));
        }
        self.scrypt_params()?;
        Ok(())
    }
}

/// A 256-bit symmetric key, wiped from memory on drop.
pub struct SymmetricKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    pub fn from_bytes(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { bytes }
    }

    /// Raw key bytes, for sealing into a platform keychain only.
    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.bytes[..]))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Slow, memory-hard derivation. Same password and salt give the same key.
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<SymmetricKey> {
    let params = params.scrypt_params()?;
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(password, salt, &params, &mut bytes[..])
        .map_err(|e| Error::InvalidConfig(format!("scrypt output: {e}")))?;
    Ok(SymmetricKey { bytes })
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn chunk_nonce(prefix: &[u8], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows. Returns bytes read; short only at EOF.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything `reader` yields into `writer`. Returns plaintext length.
pub fn encrypt_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    key: &SymmetricKey,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let cipher = key.cipher();
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    OsRng.fill_bytes(&mut header[MAGIC.len()..]);
    writer.write_all(&header)?;

    let prefix = &header[MAGIC.len()..];
    let mut buffer = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut counter = 0u32;
    let mut total = 0u64;

    loop {
        checkpoint(cancel)?;
        let read = read_full(reader, &mut buffer)?;
        let last = read < CHUNK_SIZE;

        let nonce = chunk_nonce(prefix, counter, last);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &buffer[..read],
                    aad: &header,
                },
            )
            .map_err(|_| Error::Io("encryption failed".to_string()))?;
        writer.write_all(&sealed)?;
        total += read as u64;

        if last {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Io("file too large to encrypt".to_string()))?;
    }

    writer.flush()?;
    Ok(total)
}

/// Decrypt a blob from `reader` into `writer`. Returns plaintext length.
///
/// Plaintext is written chunk by chunk as it authenticates, so on error the
/// writer may hold a verified prefix; callers discard it.
pub fn decrypt_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    key: &SymmetricKey,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let cipher = key.cipher();
    let mut header = [0u8; HEADER_LEN];
    if read_full(reader, &mut header)? < HEADER_LEN || &header[..MAGIC.len()] != MAGIC {
        return Err(Error::DecryptionFailed);
    }

    let prefix = &header[MAGIC.len()..];
    let mut buffer = vec![0u8; CHUNK_SIZE + TAG_LEN];
    let mut counter = 0u32;
    let mut total = 0u64;

    loop {
        checkpoint(cancel)?;
        let read = read_full(reader, &mut buffer)?;
        let last = read < buffer.len();
        if read < TAG_LEN {
            return Err(Error::DecryptionFailed);
        }

        let nonce = chunk_nonce(prefix, counter, last);
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buffer[..read],
                        aad: &header,
                    },
                )
                .map_err(|_| Error::DecryptionFailed)?,
        );
        writer.write_all(&plain)?;
        total += plain.len() as u64;

        if last {
            break;
        }
        counter = counter.checked_add(1).ok_or(Error::DecryptionFailed)?;
    }

    // Nothing may follow the final chunk
    let mut probe = [0u8; 1];
    if read_full(reader, &mut probe)? != 0 {
        return Err(Error::DecryptionFailed);
    }

    writer.flush()?;
    Ok(total)
}

pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
    encrypt_stream(&mut &plaintext[..], &mut out, key, &CancellationToken::new())?;
    Ok(out)
}

/// Fails with [`Error::DecryptionFailed`] on any tampering, truncation or
/// wrong key, without saying which.
pub fn decrypt(ciphertext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ciphertext.len());
    decrypt_stream(&mut &ciphertext[..], &mut out, key, &CancellationToken::new())?;
    Ok(out)
}
