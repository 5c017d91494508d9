//! WinZip AES decryption (method 99 + extra field 0x9901).
//!
//! Layout of an encrypted body: salt ‖ 2-byte password verifier ‖ AES-CTR
//! ciphertext ‖ 10-byte truncated HMAC-SHA1 over the ciphertext. Keys come
//! from PBKDF2-HMAC-SHA1 with 1000 iterations; the CTR counter is 128-bit
//! little-endian starting at 1.

use std::io::Read;

use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128LE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::{Codec, DecodeContext, method};
use crate::entry::AesStrength;
use crate::error::{ArchiveError, Code, Result};

const PBKDF2_ROUNDS: u32 = 1000;
const VERIFIER_LEN: usize = 2;
const AUTH_LEN: usize = 10;

type HmacSha1 = Hmac<Sha1>;

enum AnyCtr {
    Aes128(Box<Ctr128LE<Aes128>>),
    Aes192(Box<Ctr128LE<Aes192>>),
    Aes256(Box<Ctr128LE<Aes256>>),
}

impl AnyCtr {
    fn new(strength: AesStrength, key: &[u8]) -> Self {
        // WinZip's counter starts at one, little-endian, no nonce.
        let mut iv = [0u8; 16];
        iv[0] = 1;
        match strength {
            AesStrength::Aes128 => AnyCtr::Aes128(Box::new(
                Ctr128LE::new_from_slices(key, &iv).expect("key length fixed by strength"),
            )),
            AesStrength::Aes192 => AnyCtr::Aes192(Box::new(
                Ctr128LE::new_from_slices(key, &iv).expect("key length fixed by strength"),
            )),
            AesStrength::Aes256 => AnyCtr::Aes256(Box::new(
                Ctr128LE::new_from_slices(key, &iv).expect("key length fixed by strength"),
            )),
        }
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            AnyCtr::Aes128(cipher) => cipher.apply_keystream(buf),
            AnyCtr::Aes192(cipher) => cipher.apply_keystream(buf),
            AnyCtr::Aes256(cipher) => cipher.apply_keystream(buf),
        }
    }
}

/// Streaming decryptor; plaintext flows out, authentication is verified when
/// the final ciphertext byte has been read.
pub struct AesReader<R> {
    inner: R,
    cipher: AnyCtr,
    hmac: Option<HmacSha1>,
    remaining: u64,
    verified: bool,
}

impl<R> std::fmt::Debug for AesReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesReader")
            .field("remaining", &self.remaining)
            .field("verified", &self.verified)
            .finish()
    }
}

impl<R: Read> AesReader<R> {
    /// `compressed_len` is the full stored body length including salt,
    /// verifier, and authentication code.
    pub fn new(
        mut inner: R,
        strength: AesStrength,
        password: &str,
        compressed_len: u64,
    ) -> Result<Self> {
        let salt_len = strength.salt_len();
        let overhead = (salt_len + VERIFIER_LEN + AUTH_LEN) as u64;
        let data_len = compressed_len.checked_sub(overhead).ok_or_else(|| {
            ArchiveError::new(
                Code::ZipBadCentralDirectory,
                "encrypted body smaller than its AES overhead",
            )
        })?;

        let mut salt = vec![0u8; salt_len];
        inner
            .read_exact(&mut salt)
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
        let mut stored_verifier = [0u8; VERIFIER_LEN];
        inner
            .read_exact(&mut stored_verifier)
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;

        let key_len = strength.key_len();
        let mut derived = vec![0u8; 2 * key_len + VERIFIER_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);
        let (enc_key, rest) = derived.split_at(key_len);
        let (mac_key, verifier) = rest.split_at(key_len);
        if verifier != stored_verifier {
            return Err(ArchiveError::new(
                Code::ZipBadPassword,
                "password verifier mismatch",
            ));
        }

        let hmac = HmacSha1::new_from_slice(mac_key).expect("hmac accepts any key length");
        Ok(AesReader {
            inner,
            cipher: AnyCtr::new(strength, enc_key),
            hmac: Some(hmac),
            remaining: data_len,
            verified: false,
        })
    }

    fn finish(&mut self) -> std::io::Result<()> {
        if self.verified {
            return Ok(());
        }
        let mut stored = [0u8; AUTH_LEN];
        self.inner.read_exact(&mut stored)?;
        let mac = self.hmac.take().expect("finish runs once").finalize();
        if mac.into_bytes()[..AUTH_LEN] != stored {
            return Err(ArchiveError::new(
                Code::ZipAuthFailed,
                "HMAC authentication of encrypted data failed",
            )
            .into());
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for AesReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            self.finish()?;
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ciphertext ended early",
            ));
        }
        if let Some(hmac) = &mut self.hmac {
            hmac.update(&buf[..n]);
        }
        self.cipher.apply_keystream(&mut buf[..n]);
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Registry marker for method 99. Decryption needs the password and the real
/// method from extra field 0x9901, so the ZIP reader wires [`AesReader`]
/// itself; resolving 99 through the registry is always an error.
pub struct AesMarkerCodec;

impl Codec for AesMarkerCodec {
    fn method_id(&self) -> u16 {
        method::AES
    }

    fn name(&self) -> &'static str {
        "aes"
    }

    fn decompress<'r>(
        &self,
        _input: Box<dyn Read + Send + 'r>,
        _ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        Err(ArchiveError::new(
            Code::ZipUnsupportedEncryption,
            "AES entries are opened through the ZIP reader with a password",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forge an encrypted body with the scheme itself, then read it back.
    fn encrypt(password: &str, strength: AesStrength, plaintext: &[u8]) -> Vec<u8> {
        let salt = vec![0x24u8; strength.salt_len()];
        let key_len = strength.key_len();
        let mut derived = vec![0u8; 2 * key_len + VERIFIER_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);

        let mut ciphertext = plaintext.to_vec();
        AnyCtr::new(strength, &derived[..key_len]).apply_keystream(&mut ciphertext);
        let mut hmac = HmacSha1::new_from_slice(&derived[key_len..2 * key_len]).unwrap();
        hmac.update(&ciphertext);
        let auth = hmac.finalize().into_bytes();

        let mut body = salt;
        body.extend_from_slice(&derived[2 * key_len..]);
        body.extend_from_slice(&ciphertext);
        body.extend_from_slice(&auth[..AUTH_LEN]);
        body
    }

    #[test]
    fn decrypts_and_authenticates() {
        let body = encrypt("s3cret", AesStrength::Aes256, b"attack at dawn");
        let mut reader =
            AesReader::new(&body[..], AesStrength::Aes256, "s3cret", body.len() as u64).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"attack at dawn");
    }

    #[test]
    fn wrong_password_fails_on_verifier() {
        let body = encrypt("right", AesStrength::Aes128, b"data");
        let err = AesReader::new(&body[..], AesStrength::Aes128, "wrong", body.len() as u64)
            .unwrap_err();
        assert_eq!(err.code, Code::ZipBadPassword);
    }

    #[test]
    fn tampered_ciphertext_fails_auth_at_close() {
        let mut body = encrypt("pw", AesStrength::Aes192, b"untampered plaintext");
        let index = body.len() - AUTH_LEN - 3;
        body[index] ^= 0x40;
        let mut reader =
            AesReader::new(&body[..], AesStrength::Aes192, "pw", body.len() as u64).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ArchiveError::from_io(err, Code::ArchiveBadHeader);
        assert_eq!(err.code, Code::ZipAuthFailed);
    }
}
