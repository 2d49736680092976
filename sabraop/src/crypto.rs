//! Session crypto: AES-128-CBC payload encryption and RSAES-OAEP key
//! wrapping under the AirPort public key.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::Sha1;

use crate::error::RaopError;

/// AES block size; also the session key and IV size.
pub const AES_CHUNK_SIZE: usize = 16;

/// The hard-coded AirPort Express public modulus, base64.
const APPLE_MODULUS: &str = "\
59dE8qLieItsH1WgjrcFRKj6eUWqi+bGLOX1HL3U3GhC/j0Qg90u3sG/1CUtwC\
5vOYvfDmFI6oSFXi5ELabWJmT2dKHzBJKa3k9ok+8t9ucRqMd6DZHJ2YCCLlDR\
KSKv6kDqnw4UwPdpOMXziC/AMj3Z/lUVX1G7WSHCAWKf1zNS1eLvqr+boEjXuB\
OitnZ/bDzPHrTOZz0Dew0uowxf/+sG+NCK3eQJVxqcaJ/vEHKIVd2M+5qL71yJ\
Q+87X6oV3eaYvt3zWZYD6z5vYTcrtij2VZ9Zmni/UAaHqn9JdsBWLUEpVviYnh\
imNVvYFZeCXg/IdTQ+x4IRdiXNv5hEew==";

const APPLE_EXPONENT: &str = "AQAB";

/// Encode base64 with the trailing `=` padding stripped, the way the
/// SDP fields carry it.
pub fn base64_unpadded(data: &[u8]) -> String {
    let mut s = STANDARD.encode(data);
    while s.ends_with('=') {
        s.pop();
    }
    s
}

/// Decode base64 whether or not the padding survived.
pub fn base64_decode_lenient(s: &str) -> Result<Vec<u8>, RaopError> {
    let mut padded = s.to_owned();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD
        .decode(padded.as_bytes())
        .map_err(|e| RaopError::Crypto(format!("base64: {e}")))
}

/// Wraps the AES session key under the Apple public key, OAEP padded.
pub fn rsa_wrap_key(key: &[u8; AES_CHUNK_SIZE]) -> Result<Vec<u8>, RaopError> {
    let n = BigUint::from_bytes_be(&base64_decode_lenient(APPLE_MODULUS)?);
    let e = BigUint::from_bytes_be(&base64_decode_lenient(APPLE_EXPONENT)?);
    let public = RsaPublicKey::new(n, e).map_err(|e| RaopError::Crypto(e.to_string()))?;
    public
        .encrypt(&mut rand_core::OsRng, Oaep::new::<Sha1>(), key)
        .map_err(|e| RaopError::Crypto(e.to_string()))
}

/// Per-session AES state. The IV is reused from the SDP announcement
/// for every packet; only whole 16-byte blocks are encrypted, any
/// trailing remainder travels in the clear.
pub struct AesContext {
    cipher: Aes128,
    key: [u8; AES_CHUNK_SIZE],
    iv: [u8; AES_CHUNK_SIZE],
}

impl AesContext {
    /// Fresh random key and IV.
    pub fn new_random() -> Self {
        let mut key = [0u8; AES_CHUNK_SIZE];
        let mut iv = [0u8; AES_CHUNK_SIZE];
        rand::rng().fill_bytes(&mut key);
        rand::rng().fill_bytes(&mut iv);
        Self::from_parts(key, iv)
    }

    pub fn from_parts(key: [u8; AES_CHUNK_SIZE], iv: [u8; AES_CHUNK_SIZE]) -> Self {
        AesContext {
            cipher: Aes128::new(&key.into()),
            key,
            iv,
        }
    }

    pub fn key(&self) -> &[u8; AES_CHUNK_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; AES_CHUNK_SIZE] {
        &self.iv
    }

    /// The `a=rsaaeskey:` SDP field value.
    pub fn sdp_key(&self) -> Result<String, RaopError> {
        Ok(base64_unpadded(&rsa_wrap_key(&self.key)?))
    }

    /// The `a=aesiv:` SDP field value.
    pub fn sdp_iv(&self) -> String {
        base64_unpadded(&self.iv)
    }

    /// CBC-encrypts `data` in place and returns the number of bytes
    /// actually encrypted (the largest multiple of 16).
    pub fn encrypt_in_place(&self, data: &mut [u8]) -> usize {
        let mut chain = self.iv;
        let mut done = 0;
        while done + AES_CHUNK_SIZE <= data.len() {
            let block = &mut data[done..done + AES_CHUNK_SIZE];
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            let mut ga = aes::cipher::generic_array::GenericArray::clone_from_slice(block);
            self.cipher.encrypt_block(&mut ga);
            block.copy_from_slice(&ga);
            chain.copy_from_slice(block);
            done += AES_CHUNK_SIZE;
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_padding_is_stripped_and_restored() {
        let data = [1u8, 2, 3, 4, 5];
        let s = base64_unpadded(&data);
        assert!(!s.contains('='));
        assert_eq!(base64_decode_lenient(&s).unwrap(), data);
    }

    #[test]
    fn rsa_wrapping_yields_modulus_sized_blob() {
        let ctx = AesContext::new_random();
        let wrapped = rsa_wrap_key(ctx.key()).unwrap();
        // Le module Apple fait 2048 bits.
        assert_eq!(wrapped.len(), 256);
        // OAEP est randomisé : deux enveloppes diffèrent.
        assert_ne!(wrapped, rsa_wrap_key(ctx.key()).unwrap());
    }

    #[test]
    fn cbc_leaves_trailing_bytes_clear() {
        let ctx = AesContext::from_parts([7u8; 16], [9u8; 16]);
        let mut data = vec![0x55u8; 35];
        let original = data.clone();
        let done = ctx.encrypt_in_place(&mut data);
        assert_eq!(done, 32);
        assert_ne!(&data[..32], &original[..32]);
        assert_eq!(&data[32..], &original[32..]);
    }

    #[test]
    fn cbc_chains_blocks() {
        let ctx = AesContext::from_parts([1u8; 16], [2u8; 16]);
        // Deux blocs identiques en clair doivent chiffrer différemment.
        let mut data = vec![0xAAu8; 32];
        ctx.encrypt_in_place(&mut data);
        assert_ne!(&data[..16], &data[16..32]);
        // Même entrée, même sortie : l'IV repart de l'annonce à chaque
        // paquet.
        let mut again = vec![0xAAu8; 32];
        ctx.encrypt_in_place(&mut again);
        assert_eq!(data, again);
    }
}
