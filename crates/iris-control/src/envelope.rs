//! The RSA chunk envelope.
//!
//! Payloads larger than one RSA operation allows are split into chunks,
//! each prefixed by its 2-byte big-endian cipher length:
//!
//! ```text
//! Encrypted := (ChunkLen(2, big-endian u16) ChunkCipherBytes)*
//! cleartext = concat(decrypt(chunk) for each chunk)
//! ```
//!
//! The directionality defines wire compatibility and is preserved
//! exactly: the **server** encrypts outbound and decrypts inbound with
//! its **private** key; the **client** uses the matching public key both
//! ways. PKCS#1 v1.5 padding costs 11 bytes per operation, so the chunk
//! limit is `key_bits/8 - 11`, recomputed from the loaded key, since a
//! different padding scheme would change it.

use openssl::pkey::{Private, Public};
use openssl::rsa::{Padding, Rsa};

use crate::error::{ControlError, ControlResult};

/// PKCS#1 v1.5 padding overhead per RSA operation, in bytes.
const PKCS1_OVERHEAD: usize = 11;

/// The server half of the envelope: private key both ways.
pub struct ServerEnvelope {
    key: Rsa<Private>,
    max_chunk: usize,
}

impl ServerEnvelope {
    /// Wrap a loaded private key.
    pub fn new(key: Rsa<Private>) -> Self {
        let max_chunk = key.size() as usize - PKCS1_OVERHEAD;
        Self { key, max_chunk }
    }

    /// Load a PEM private key, optionally passphrase-protected.
    pub fn from_pem(pem: &[u8], passphrase: Option<&str>) -> ControlResult<Self> {
        let key = match passphrase {
            Some(phrase) => Rsa::private_key_from_pem_passphrase(pem, phrase.as_bytes()),
            None => Rsa::private_key_from_pem(pem),
        }
        .map_err(|e| ControlError::WrongKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Largest cleartext slice one chunk can carry.
    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Encrypt a cleartext into the chunked wire form.
    pub fn encrypt(&self, cleartext: &[u8]) -> ControlResult<Vec<u8>> {
        encrypt_chunks(cleartext, self.max_chunk, self.key.size() as usize, |slice, out| {
            self.key
                .private_encrypt(slice, out, Padding::PKCS1)
                .map_err(|e| ControlError::EncryptFailed(e.to_string()))
        })
    }

    /// Decrypt the chunked wire form back into cleartext.
    pub fn decrypt(&self, wire: &[u8]) -> ControlResult<Vec<u8>> {
        decrypt_chunks(wire, self.key.size() as usize, |slice, out| {
            self.key
                .private_decrypt(slice, out, Padding::PKCS1)
                .map_err(|e| ControlError::DecryptFailed(e.to_string()))
        })
    }
}

impl std::fmt::Debug for ServerEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEnvelope")
            .field("max_chunk", &self.max_chunk)
            .finish_non_exhaustive()
    }
}

/// The client half of the envelope: public key both ways.
pub struct ClientEnvelope {
    key: Rsa<Public>,
    max_chunk: usize,
}

impl ClientEnvelope {
    /// Wrap a loaded public key.
    pub fn new(key: Rsa<Public>) -> Self {
        let max_chunk = key.size() as usize - PKCS1_OVERHEAD;
        Self { key, max_chunk }
    }

    /// Load a PEM public key.
    pub fn from_pem(pem: &[u8]) -> ControlResult<Self> {
        let key = Rsa::public_key_from_pem(pem)
            .map_err(|e| ControlError::WrongKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Encrypt a cleartext into the chunked wire form.
    pub fn encrypt(&self, cleartext: &[u8]) -> ControlResult<Vec<u8>> {
        encrypt_chunks(cleartext, self.max_chunk, self.key.size() as usize, |slice, out| {
            self.key
                .public_encrypt(slice, out, Padding::PKCS1)
                .map_err(|e| ControlError::EncryptFailed(e.to_string()))
        })
    }

    /// Decrypt the chunked wire form back into cleartext.
    pub fn decrypt(&self, wire: &[u8]) -> ControlResult<Vec<u8>> {
        decrypt_chunks(wire, self.key.size() as usize, |slice, out| {
            self.key
                .public_decrypt(slice, out, Padding::PKCS1)
                .map_err(|e| ControlError::DecryptFailed(e.to_string()))
        })
    }
}

impl std::fmt::Debug for ClientEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEnvelope")
            .field("max_chunk", &self.max_chunk)
            .finish_non_exhaustive()
    }
}

fn encrypt_chunks(
    cleartext: &[u8],
    max_chunk: usize,
    key_size: usize,
    mut op: impl FnMut(&[u8], &mut [u8]) -> ControlResult<usize>,
) -> ControlResult<Vec<u8>> {
    let mut wire = Vec::new();
    let mut offset = 0;

    while offset < cleartext.len() {
        let end = usize::min(offset + max_chunk, cleartext.len());
        let slice = &cleartext[offset..end];

        let mut cipher = vec![0u8; key_size];
        let n = op(slice, &mut cipher)?;
        wire.extend_from_slice(&(n as u16).to_be_bytes());
        wire.extend_from_slice(&cipher[..n]);

        offset = end;
    }

    Ok(wire)
}

fn decrypt_chunks(
    wire: &[u8],
    key_size: usize,
    mut op: impl FnMut(&[u8], &mut [u8]) -> ControlResult<usize>,
) -> ControlResult<Vec<u8>> {
    let mut cleartext = Vec::new();
    let mut offset = 0;

    while offset < wire.len() {
        if wire.len() < offset + 2 {
            return Err(ControlError::DecryptFailed(
                "truncated chunk length".to_string(),
            ));
        }
        let len = u16::from_be_bytes([wire[offset], wire[offset + 1]]) as usize;
        offset += 2;

        if wire.len() < offset + len {
            return Err(ControlError::DecryptFailed("truncated chunk".to_string()));
        }
        let slice = &wire[offset..offset + len];
        offset += len;

        let mut clear = vec![0u8; key_size];
        let n = op(slice, &mut clear)?;
        cleartext.extend_from_slice(&clear[..n]);
    }

    Ok(cleartext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (ServerEnvelope, ClientEnvelope) {
        let key = Rsa::generate(2048).unwrap();
        let public_pem = key.public_key_to_pem().unwrap();
        let server = ServerEnvelope::new(key);
        let client = ClientEnvelope::from_pem(&public_pem).unwrap();
        (server, client)
    }

    #[test]
    fn test_chunk_limit_follows_key_size() {
        let (server, client) = keypair();
        // 2048-bit key: 256-byte modulus, minus PKCS#1 v1.5 overhead
        assert_eq!(server.max_chunk(), 256 - 11);
        assert_eq!(client.max_chunk, 256 - 11);
    }

    #[test]
    fn test_server_to_client_roundtrip() {
        let (server, client) = keypair();
        let wire = server.encrypt(b"list of clients").unwrap();
        assert_ne!(&wire[..], b"list of clients");
        let clear = client.decrypt(&wire).unwrap();
        assert_eq!(clear, b"list of clients");
    }

    #[test]
    fn test_client_to_server_roundtrip() {
        let (server, client) = keypair();
        let wire = client.encrypt(b"{\"id\":\"admin\"}").unwrap();
        let clear = server.decrypt(&wire).unwrap();
        assert_eq!(clear, b"{\"id\":\"admin\"}");
    }

    #[test]
    fn test_multi_chunk_payload() {
        let (server, client) = keypair();
        // force several chunks
        let cleartext: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let wire = server.encrypt(&cleartext).unwrap();
        let clear = client.decrypt(&wire).unwrap();
        assert_eq!(clear, cleartext);
    }

    #[test]
    fn test_truncated_wire_rejected() {
        let (server, client) = keypair();
        let wire = server.encrypt(b"hello").unwrap();
        assert!(client.decrypt(&wire[..wire.len() - 1]).is_err());
        assert!(client.decrypt(&wire[..1]).is_err());
    }

    #[test]
    fn test_tampered_cipher_rejected() {
        let (server, client) = keypair();
        let mut wire = server.encrypt(b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(client.decrypt(&wire).is_err());
    }

    #[test]
    fn test_pem_private_key_roundtrip() {
        let key = Rsa::generate(2048).unwrap();
        let pem = key.private_key_to_pem().unwrap();
        let server = ServerEnvelope::from_pem(&pem, None).unwrap();
        let client = ClientEnvelope::from_pem(&key.public_key_to_pem().unwrap()).unwrap();
        let wire = server.encrypt(b"x").unwrap();
        assert_eq!(client.decrypt(&wire).unwrap(), b"x");
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(matches!(
            ServerEnvelope::from_pem(b"not a key", None),
            Err(ControlError::WrongKey(_))
        ));
        assert!(matches!(
            ClientEnvelope::from_pem(b"not a key"),
            Err(ControlError::WrongKey(_))
        ));
    }
}
