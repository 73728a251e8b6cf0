//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation (first match on the client's ordered lists)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Key exchange (DH, group exchange or ECDH — see [`kex_dh`](crate::ssh::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the new keys
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let newkeys = NewKeys::new();
//! assert_eq!(newkeys.to_bytes(), vec![21]);
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::crypto::{builtin_mac_names, CipherRegistry};
use crate::ssh::message::MessageType;
use crate::ssh::packet::Compression;
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is comma-separated, ordered by preference (most
/// preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT message advertising every built-in algorithm.
    pub fn new_default() -> Self {
        let ciphers = CipherRegistry::builtin().names();
        let macs = builtin_mac_names();
        let compressions = Compression::builtin_names();

        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: vec![
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
                "ecdh-sha2-nistp256".to_string(),
                "ecdh-sha2-nistp384".to_string(),
                "ecdh-sha2-nistp521".to_string(),
                "diffie-hellman-group-exchange-sha256".to_string(),
                "diffie-hellman-group14-sha256".to_string(),
                "diffie-hellman-group14-sha1".to_string(),
            ],
            server_host_key_algorithms: vec![
                "ssh-ed25519".to_string(),
                "ecdsa-sha2-nistp256".to_string(),
                "ecdsa-sha2-nistp384".to_string(),
                "ecdsa-sha2-nistp521".to_string(),
                "rsa-sha2-512".to_string(),
                "rsa-sha2-256".to_string(),
                "ssh-rsa".to_string(),
            ],
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compressions.clone(),
            compression_algorithms_server_to_client: compressions,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the host-key algorithm list (restricted to the key types
    /// the server's [`KeyProvider`](crate::ssh::hostkey::KeyProvider)
    /// actually holds).
    pub fn with_host_key_algorithms(mut self, algorithms: Vec<String>) -> Self {
        self.server_host_key_algorithms = algorithms;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_raw(&self.cookie);
        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_algorithms_client_to_server);
        buf.put_name_list(&self.encryption_algorithms_server_to_client);
        buf.put_name_list(&self.mac_algorithms_client_to_server);
        buf.put_name_list(&self.mac_algorithms_server_to_client);
        buf.put_name_list(&self.compression_algorithms_client_to_server);
        buf.put_name_list(&self.compression_algorithms_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.into_bytes()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the message type is wrong or a
    /// field is truncated.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);

        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let cookie_bytes = buf.get_raw(16)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&cookie_bytes);

        let kex_algorithms = buf.get_name_list()?;
        let server_host_key_algorithms = buf.get_name_list()?;
        let encryption_algorithms_client_to_server = buf.get_name_list()?;
        let encryption_algorithms_server_to_client = buf.get_name_list()?;
        let mac_algorithms_client_to_server = buf.get_name_list()?;
        let mac_algorithms_server_to_client = buf.get_name_list()?;
        let compression_algorithms_client_to_server = buf.get_name_list()?;
        let compression_algorithms_server_to_client = buf.get_name_list()?;
        let languages_client_to_server = buf.get_name_list()?;
        let languages_server_to_client = buf.get_name_list()?;
        let first_kex_packet_follows = buf.get_bool()?;
        let _reserved = buf.get_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a NEWKEYS message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        if data.first() != Some(&(MessageType::NewKeys as u8)) {
            return Err(KeelError::Protocol(
                "Expected SSH_MSG_NEWKEYS".to_string(),
            ));
        }
        Ok(Self)
    }
}

/// Negotiates one algorithm: the first entry in the client's ordered list
/// that the server also supports (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`KeelError::Protocol`] when no algorithm is shared; the caller
/// must disconnect with KEY_EXCHANGE_FAILED.
pub fn negotiate_algorithm(server: &[String], client: &[String]) -> KeelResult<String> {
    for candidate in client {
        if server.contains(candidate) {
            return Ok(candidate.clone());
        }
    }
    Err(KeelError::Protocol(format!(
        "Algorithm negotiation failed: client {:?}, server {:?}",
        client, server
    )))
}

/// The complete negotiated algorithm suite for one key exchange.
#[derive(Debug, Clone)]
pub struct NegotiatedAlgorithms {
    /// Key exchange algorithm.
    pub kex: String,
    /// Server host key algorithm.
    pub host_key: String,
    /// Cipher client to server.
    pub cipher_c2s: String,
    /// Cipher server to client.
    pub cipher_s2c: String,
    /// MAC client to server.
    pub mac_c2s: String,
    /// MAC server to client.
    pub mac_s2c: String,
    /// Compression client to server.
    pub compression_c2s: String,
    /// Compression server to client.
    pub compression_s2c: String,
}

impl NegotiatedAlgorithms {
    /// Runs first-match negotiation over every list pair.
    pub fn negotiate(server: &KexInit, client: &KexInit) -> KeelResult<Self> {
        Ok(Self {
            kex: negotiate_algorithm(&server.kex_algorithms, &client.kex_algorithms)?,
            host_key: negotiate_algorithm(
                &server.server_host_key_algorithms,
                &client.server_host_key_algorithms,
            )?,
            cipher_c2s: negotiate_algorithm(
                &server.encryption_algorithms_client_to_server,
                &client.encryption_algorithms_client_to_server,
            )?,
            cipher_s2c: negotiate_algorithm(
                &server.encryption_algorithms_server_to_client,
                &client.encryption_algorithms_server_to_client,
            )?,
            mac_c2s: negotiate_algorithm(
                &server.mac_algorithms_client_to_server,
                &client.mac_algorithms_client_to_server,
            )?,
            mac_s2c: negotiate_algorithm(
                &server.mac_algorithms_server_to_client,
                &client.mac_algorithms_server_to_client,
            )?,
            compression_c2s: negotiate_algorithm(
                &server.compression_algorithms_client_to_server,
                &client.compression_algorithms_client_to_server,
            )?,
            compression_s2c: negotiate_algorithm(
                &server.compression_algorithms_server_to_client,
                &client.compression_algorithms_server_to_client,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::new_default();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_rejects_wrong_type() {
        let mut bytes = KexInit::new_default().to_bytes();
        bytes[0] = 21;
        assert!(KexInit::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_newkeys_round_trip() {
        let bytes = NewKeys::new().to_bytes();
        assert_eq!(bytes, vec![21]);
        assert!(NewKeys::from_bytes(&bytes).is_ok());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }

    #[test]
    fn test_negotiate_first_client_match() {
        let server = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let client = vec!["x".to_string(), "c".to_string(), "a".to_string()];
        // The client's order wins, not the server's.
        assert_eq!(negotiate_algorithm(&server, &client).unwrap(), "c");
    }

    #[test]
    fn test_negotiate_no_match() {
        let server = vec!["a".to_string()];
        let client = vec!["b".to_string()];
        assert!(negotiate_algorithm(&server, &client).is_err());
    }

    #[test]
    fn test_negotiate_full_suite() {
        let server = KexInit::new_default();
        let client = KexInit::new_default();
        let suite = NegotiatedAlgorithms::negotiate(&server, &client).unwrap();
        assert_eq!(suite.kex, "curve25519-sha256");
        assert_eq!(suite.cipher_c2s, "aes128-ctr");
        assert_eq!(suite.compression_c2s, "none");
    }

    #[test]
    fn test_host_key_restriction() {
        let kexinit = KexInit::new_default()
            .with_host_key_algorithms(vec!["ssh-ed25519".to_string()]);
        assert_eq!(kexinit.server_host_key_algorithms(), ["ssh-ed25519"]);
    }
}
