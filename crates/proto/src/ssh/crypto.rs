//! Cipher and MAC factories for the binary packet protocol.
//!
//! Cryptographic primitives are exposed to the packet codec as *named
//! factories* with a uniform interface: the negotiated algorithm name is
//! looked up in a registry, and the factory produces a keyed instance for
//! one direction of the connection. Embedders may register additional
//! factories under their own names.
//!
//! Built-in ciphers: `aes{128,192,256}-ctr`, `aes{128,192,256}-cbc`.
//! Built-in MACs: `hmac-sha1`, `hmac-sha2-256`, `hmac-sha2-512` and their
//! `-96` truncated variants.
//!
//! # Security
//!
//! - MAC verification is constant-time
//! - Key material is zeroized on drop
//! - CBC decryption failures surface as protocol errors, never panics

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use keel_platform::{KeelError, KeelResult};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Direction a cipher instance is keyed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound packets.
    Encrypt,
    /// Inbound packets.
    Decrypt,
}

/// A keyed cipher applied to packet bytes in place.
pub trait PacketCipher: Send + Sync {
    /// Cipher block size in bytes (used for padding alignment and for
    /// reading the first block of an inbound packet).
    fn block_size(&self) -> usize;

    /// Transforms `data` in place. For block modes `data` must be a
    /// multiple of the block size.
    fn process(&mut self, data: &mut [u8]) -> KeelResult<()>;
}

/// Factory producing keyed [`PacketCipher`] instances by name.
pub trait CipherFactory: Send + Sync {
    /// Negotiable algorithm name.
    fn name(&self) -> &str;
    /// Required key length in bytes.
    fn key_len(&self) -> usize;
    /// Required IV length in bytes.
    fn iv_len(&self) -> usize;
    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;
    /// Creates a keyed instance for one direction.
    fn create(
        &self,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> KeelResult<Box<dyn PacketCipher>>;
}

enum CipherCtx {
    Ctr128(Aes128Ctr),
    Ctr192(Aes192Ctr),
    Ctr256(Aes256Ctr),
    CbcEnc128(Aes128CbcEnc),
    CbcEnc192(Aes192CbcEnc),
    CbcEnc256(Aes256CbcEnc),
    CbcDec128(Aes128CbcDec),
    CbcDec192(Aes192CbcDec),
    CbcDec256(Aes256CbcDec),
}

struct AesCipher {
    ctx: CipherCtx,
}

impl PacketCipher for AesCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn process(&mut self, data: &mut [u8]) -> KeelResult<()> {
        match &mut self.ctx {
            CipherCtx::Ctr128(c) => c.apply_keystream(data),
            CipherCtx::Ctr192(c) => c.apply_keystream(data),
            CipherCtx::Ctr256(c) => c.apply_keystream(data),
            _ => {
                if data.len() % 16 != 0 {
                    return Err(KeelError::Protocol(format!(
                        "CBC input not block aligned: {} bytes",
                        data.len()
                    )));
                }
                for block in data.chunks_exact_mut(16) {
                    let block = GenericArray::from_mut_slice(block);
                    match &mut self.ctx {
                        CipherCtx::CbcEnc128(c) => c.encrypt_block_mut(block),
                        CipherCtx::CbcEnc192(c) => c.encrypt_block_mut(block),
                        CipherCtx::CbcEnc256(c) => c.encrypt_block_mut(block),
                        CipherCtx::CbcDec128(c) => c.decrypt_block_mut(block),
                        CipherCtx::CbcDec192(c) => c.decrypt_block_mut(block),
                        CipherCtx::CbcDec256(c) => c.decrypt_block_mut(block),
                        _ => unreachable!("stream ciphers handled above"),
                    }
                }
            }
        }
        Ok(())
    }
}

struct BuiltinCipherFactory {
    name: &'static str,
    key_len: usize,
}

impl CipherFactory for BuiltinCipherFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn key_len(&self) -> usize {
        self.key_len
    }

    fn iv_len(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        16
    }

    fn create(
        &self,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> KeelResult<Box<dyn PacketCipher>> {
        if key.len() < self.key_len || iv.len() < self.iv_len() {
            return Err(KeelError::Security(format!(
                "Insufficient key material for {}: key {} (need {}), iv {} (need {})",
                self.name,
                key.len(),
                self.key_len,
                iv.len(),
                self.iv_len()
            )));
        }
        let key = &key[..self.key_len];
        let iv = &iv[..self.iv_len()];
        let bad_key = |_| KeelError::Security(format!("Failed to key {}", self.name));

        let ctx = match (self.name, direction) {
            ("aes128-ctr", _) => {
                CipherCtx::Ctr128(Aes128Ctr::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes192-ctr", _) => {
                CipherCtx::Ctr192(Aes192Ctr::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes256-ctr", _) => {
                CipherCtx::Ctr256(Aes256Ctr::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes128-cbc", CipherDirection::Encrypt) => {
                CipherCtx::CbcEnc128(Aes128CbcEnc::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes192-cbc", CipherDirection::Encrypt) => {
                CipherCtx::CbcEnc192(Aes192CbcEnc::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes256-cbc", CipherDirection::Encrypt) => {
                CipherCtx::CbcEnc256(Aes256CbcEnc::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes128-cbc", CipherDirection::Decrypt) => {
                CipherCtx::CbcDec128(Aes128CbcDec::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes192-cbc", CipherDirection::Decrypt) => {
                CipherCtx::CbcDec192(Aes192CbcDec::new_from_slices(key, iv).map_err(bad_key)?)
            }
            ("aes256-cbc", CipherDirection::Decrypt) => {
                CipherCtx::CbcDec256(Aes256CbcDec::new_from_slices(key, iv).map_err(bad_key)?)
            }
            _ => {
                return Err(KeelError::Protocol(format!(
                    "Unknown cipher: {}",
                    self.name
                )))
            }
        };

        Ok(Box::new(AesCipher { ctx }))
    }
}

/// Registry of cipher factories keyed by negotiable name.
#[derive(Clone)]
pub struct CipherRegistry {
    factories: HashMap<String, Arc<dyn CipherFactory>>,
    order: Vec<String>,
}

impl CipherRegistry {
    /// Registry with the built-in AES factories, preference order first.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            order: Vec::new(),
        };
        for (name, key_len) in [
            ("aes128-ctr", 16),
            ("aes192-ctr", 24),
            ("aes256-ctr", 32),
            ("aes128-cbc", 16),
            ("aes192-cbc", 24),
            ("aes256-cbc", 32),
        ] {
            registry.register(Arc::new(BuiltinCipherFactory { name, key_len }));
        }
        registry
    }

    /// Registers a factory; replaces an existing one with the same name.
    pub fn register(&mut self, factory: Arc<dyn CipherFactory>) {
        let name = factory.name().to_string();
        if !self.factories.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.factories.insert(name, factory);
    }

    /// Looks up a factory by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CipherFactory>> {
        self.factories.get(name)
    }

    /// Names in preference order, for KEXINIT.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }
}

/// MAC algorithm over `sequence_number || unencrypted_packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacAlgo {
    Sha1,
    Sha256,
    Sha512,
}

/// A keyed MAC for one direction of the connection.
pub struct PacketMac {
    name: String,
    algo: MacAlgo,
    out_len: usize,
    key: Zeroizing<Vec<u8>>,
}

impl PacketMac {
    /// Creates a keyed MAC by negotiable name.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] for unknown names and
    /// [`KeelError::Security`] when the key material is too short.
    pub fn new(name: &str, key: &[u8]) -> KeelResult<Self> {
        let (algo, key_len, out_len) = match name {
            "hmac-sha1" => (MacAlgo::Sha1, 20, 20),
            "hmac-sha1-96" => (MacAlgo::Sha1, 20, 12),
            "hmac-sha2-256" => (MacAlgo::Sha256, 32, 32),
            "hmac-sha2-256-96" => (MacAlgo::Sha256, 32, 12),
            "hmac-sha2-512" => (MacAlgo::Sha512, 64, 64),
            "hmac-sha2-512-96" => (MacAlgo::Sha512, 64, 12),
            _ => return Err(KeelError::Protocol(format!("Unknown MAC: {}", name))),
        };

        if key.len() < key_len {
            return Err(KeelError::Security(format!(
                "Insufficient key material for {}: {} bytes (need {})",
                name,
                key.len(),
                key_len
            )));
        }

        Ok(Self {
            name: name.to_string(),
            algo,
            out_len,
            key: Zeroizing::new(key[..key_len].to_vec()),
        })
    }

    /// Returns the negotiable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the on-wire MAC length in bytes.
    pub fn mac_len(&self) -> usize {
        self.out_len
    }

    /// Computes the MAC over `seq_no || packet`.
    pub fn sign(&self, seq_no: u32, packet: &[u8]) -> Vec<u8> {
        let mut digest = match self.algo {
            MacAlgo::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq_no.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgo::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq_no.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgo::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq_no.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        digest.truncate(self.out_len);
        digest
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, seq_no: u32, packet: &[u8], received: &[u8]) -> bool {
        if received.len() != self.out_len {
            return false;
        }
        let expected = self.sign(seq_no, packet);
        expected.ct_eq(received).into()
    }
}

impl std::fmt::Debug for PacketMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketMac")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Built-in MAC names in preference order.
pub fn builtin_mac_names() -> Vec<String> {
    [
        "hmac-sha2-256",
        "hmac-sha2-512",
        "hmac-sha1",
        "hmac-sha2-256-96",
        "hmac-sha2-512-96",
        "hmac-sha1-96",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_material(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_registry_builtin_names() {
        let registry = CipherRegistry::builtin();
        let names = registry.names();
        assert!(names.contains(&"aes128-ctr".to_string()));
        assert!(names.contains(&"aes256-cbc".to_string()));
        assert!(registry.get("aes256-ctr").is_some());
        assert!(registry.get("3des-cbc").is_none());
    }

    #[test]
    fn test_ctr_round_trip() {
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes256-ctr").unwrap();
        let key = key_material(32);
        let iv = key_material(16);

        let mut enc = factory.create(&key, &iv, CipherDirection::Encrypt).unwrap();
        let mut dec = factory.create(&key, &iv, CipherDirection::Decrypt).unwrap();

        let plaintext = b"sixteen byte blk and then some..".to_vec();
        let mut data = plaintext.clone();
        enc.process(&mut data).unwrap();
        assert_ne!(data, plaintext);
        dec.process(&mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_cbc_round_trip() {
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes128-cbc").unwrap();
        let key = key_material(16);
        let iv = key_material(16);

        let mut enc = factory.create(&key, &iv, CipherDirection::Encrypt).unwrap();
        let mut dec = factory.create(&key, &iv, CipherDirection::Decrypt).unwrap();

        let plaintext = vec![0xab; 48];
        let mut data = plaintext.clone();
        enc.process(&mut data).unwrap();
        dec.process(&mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes128-cbc").unwrap();
        let mut enc = factory
            .create(&key_material(16), &key_material(16), CipherDirection::Encrypt)
            .unwrap();
        let mut data = vec![0u8; 10];
        assert!(enc.process(&mut data).is_err());
    }

    #[test]
    fn test_cipher_insufficient_key() {
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes256-ctr").unwrap();
        let result = factory.create(&key_material(8), &key_material(16), CipherDirection::Encrypt);
        assert!(matches!(result, Err(KeelError::Security(_))));
    }

    #[test]
    fn test_mac_sign_verify() {
        let mac = PacketMac::new("hmac-sha2-256", &key_material(32)).unwrap();
        assert_eq!(mac.mac_len(), 32);

        let tag = mac.sign(3, b"packet bytes");
        assert!(mac.verify(3, b"packet bytes", &tag));
        assert!(!mac.verify(4, b"packet bytes", &tag));
        assert!(!mac.verify(3, b"other bytes", &tag));
    }

    #[test]
    fn test_mac_truncated_variant() {
        let mac = PacketMac::new("hmac-sha1-96", &key_material(20)).unwrap();
        let tag = mac.sign(0, b"data");
        assert_eq!(tag.len(), 12);
        assert!(mac.verify(0, b"data", &tag));
    }

    #[test]
    fn test_mac_unknown_name() {
        assert!(matches!(
            PacketMac::new("hmac-md5", &key_material(16)),
            Err(KeelError::Protocol(_))
        ));
    }

    #[test]
    fn test_mac_sequence_dependence() {
        let mac = PacketMac::new("hmac-sha1", &key_material(20)).unwrap();
        assert_ne!(mac.sign(0, b"x"), mac.sign(1, b"x"));
    }
}
