//! Server host keys: signing, wire encoding and the `KeyProvider` seam.
//!
//! Key pair generation and file parsing live with the embedder; the core
//! sees host keys through the [`KeyProvider`] trait, which yields
//! [`HostKey`] implementations by type. Built-in key types:
//!
//! - `ssh-ed25519` (ed25519-dalek)
//! - `ssh-rsa` signing as `ssh-rsa`, `rsa-sha2-256`, `rsa-sha2-512` (ring)
//! - `ecdsa-sha2-nistp{256,384,521}` (p256/p384/p521)
//!
//! [`verify_signature`] checks a wire-format signature blob against a
//! wire-format public key blob; it is the single verification entry point
//! used by public-key authentication.

use crate::ssh::buffer::Buffer;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use keel_platform::{KeelError, KeelResult};
use ring::signature::{
    KeyPair as _, RsaKeyPair, RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256,
    RSA_PKCS1_2048_8192_SHA512, RSA_PKCS1_SHA256, RSA_PKCS1_SHA512,
};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Trait for host key operations.
///
/// A host key knows its public-key format name, the signature algorithms
/// it can produce, its wire-format public blob and how to sign the
/// exchange hash.
pub trait HostKey: Send + Sync {
    /// Public key format name (e.g. "ssh-ed25519", "ssh-rsa").
    fn key_type(&self) -> &'static str;

    /// Signature algorithm names this key can serve, preferred first.
    fn signature_algorithms(&self) -> Vec<&'static str>;

    /// Public key in SSH wire format.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the wire-format signature blob
    /// (string algorithm-name, string signature-bytes).
    fn sign(&self, algorithm: &str, data: &[u8]) -> KeelResult<Vec<u8>>;
}

/// Yields the server's key pairs by type.
///
/// Implemented by the embedder; [`StaticKeyProvider`] covers the common
/// case of a fixed in-memory set.
pub trait KeyProvider: Send + Sync {
    /// All keys this provider holds.
    fn load_keys(&self) -> Vec<Arc<dyn HostKey>>;

    /// The key serving `algorithm` (a signature algorithm name), if any.
    fn load_key(&self, algorithm: &str) -> Option<Arc<dyn HostKey>> {
        self.load_keys()
            .into_iter()
            .find(|k| k.signature_algorithms().contains(&algorithm))
    }

    /// Every signature algorithm the held keys can serve, preferred first.
    fn key_types(&self) -> Vec<String> {
        let mut names = Vec::new();
        for key in self.load_keys() {
            for alg in key.signature_algorithms() {
                if !names.contains(&alg.to_string()) {
                    names.push(alg.to_string());
                }
            }
        }
        names
    }
}

/// Fixed in-memory key set.
pub struct StaticKeyProvider {
    keys: Vec<Arc<dyn HostKey>>,
}

impl StaticKeyProvider {
    /// Creates a provider over the given keys.
    pub fn new(keys: Vec<Arc<dyn HostKey>>) -> Self {
        Self { keys }
    }

    /// Provider holding one freshly generated Ed25519 key (development
    /// convenience; production servers load persistent keys).
    pub fn ephemeral() -> KeelResult<Self> {
        Ok(Self::new(vec![Arc::new(Ed25519HostKey::generate()?)]))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn load_keys(&self) -> Vec<Arc<dyn HostKey>> {
        self.keys.clone()
    }
}

/// Ed25519 host key (ssh-ed25519).
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a new Ed25519 key pair.
    pub fn generate() -> KeelResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; 32] = rand::Rng::gen(&mut csprng);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Creates from a 32-byte secret key.
    pub fn from_bytes(secret_bytes: &[u8]) -> KeelResult<Self> {
        if secret_bytes.len() != 32 {
            return Err(KeelError::Security(
                "Ed25519 secret key must be 32 bytes".to_string(),
            ));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(secret_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Returns the secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

impl HostKey for Ed25519HostKey {
    fn key_type(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn signature_algorithms(&self) -> Vec<&'static str> {
        vec!["ssh-ed25519"]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(self.verifying_key.as_bytes());
        buf.into_bytes()
    }

    fn sign(&self, algorithm: &str, data: &[u8]) -> KeelResult<Vec<u8>> {
        if algorithm != "ssh-ed25519" {
            return Err(KeelError::Security(format!(
                "Ed25519 key cannot sign as {}",
                algorithm
            )));
        }
        let signature = self.signing_key.sign(data);
        let mut buf = Buffer::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(&signature.to_bytes());
        Ok(buf.into_bytes())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// RSA host key. The public blob is always "ssh-rsa" (e, n). Signing is
/// offered as rsa-sha2-256 and rsa-sha2-512 only; ring provides no SHA-1
/// RSA signer, so legacy ssh-rsa signatures are verify-only.
pub struct RsaHostKey {
    key_pair: RsaKeyPair,
    /// Public exponent e, big-endian.
    e: Vec<u8>,
    /// Modulus n, big-endian.
    n: Vec<u8>,
}

impl RsaHostKey {
    /// Creates from a PKCS#8 DER private key.
    pub fn from_pkcs8(private_key_der: &[u8]) -> KeelResult<Self> {
        let key_pair = RsaKeyPair::from_pkcs8(private_key_der)
            .map_err(|e| KeelError::Security(format!("Invalid RSA private key: {:?}", e)))?;
        Self::from_key_pair(key_pair)
    }

    /// Creates from a PKCS#1 DER private key.
    pub fn from_der(private_key_der: &[u8]) -> KeelResult<Self> {
        let key_pair = RsaKeyPair::from_der(private_key_der)
            .map_err(|e| KeelError::Security(format!("Invalid RSA private key: {:?}", e)))?;
        Self::from_key_pair(key_pair)
    }

    fn from_key_pair(key_pair: RsaKeyPair) -> KeelResult<Self> {
        let public_der = key_pair.public_key().as_ref().to_vec();
        let (n, e) = parse_rsa_public_der(&public_der)?;
        Ok(Self { key_pair, e, n })
    }
}

impl HostKey for RsaHostKey {
    fn key_type(&self) -> &'static str {
        "ssh-rsa"
    }

    fn signature_algorithms(&self) -> Vec<&'static str> {
        vec!["rsa-sha2-512", "rsa-sha2-256"]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_str("ssh-rsa");
        buf.put_mpint(&self.e);
        buf.put_mpint(&self.n);
        buf.into_bytes()
    }

    fn sign(&self, algorithm: &str, data: &[u8]) -> KeelResult<Vec<u8>> {
        let padding = match algorithm {
            "rsa-sha2-256" => &RSA_PKCS1_SHA256,
            "rsa-sha2-512" => &RSA_PKCS1_SHA512,
            _ => {
                return Err(KeelError::Security(format!(
                    "RSA key cannot sign as {}",
                    algorithm
                )))
            }
        };

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        let rng = ring::rand::SystemRandom::new();
        self.key_pair
            .sign(padding, &rng, data, &mut signature)
            .map_err(|e| KeelError::Security(format!("RSA signing failed: {:?}", e)))?;

        let mut buf = Buffer::new();
        buf.put_str(algorithm);
        buf.put_string(&signature);
        Ok(buf.into_bytes())
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaHostKey")
            .field("algorithm", &"ssh-rsa")
            .field("modulus_bits", &(self.n.len() * 8))
            .finish_non_exhaustive()
    }
}

/// Parses a DER RSAPublicKey (SEQUENCE { INTEGER n, INTEGER e }).
fn parse_rsa_public_der(der: &[u8]) -> KeelResult<(Vec<u8>, Vec<u8>)> {
    fn read_len(der: &[u8], pos: &mut usize) -> KeelResult<usize> {
        let first = *der
            .get(*pos)
            .ok_or_else(|| KeelError::Security("Truncated DER".to_string()))?;
        *pos += 1;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7f) as usize;
        if count > 4 {
            return Err(KeelError::Security("Oversized DER length".to_string()));
        }
        let mut len = 0usize;
        for _ in 0..count {
            let byte = *der
                .get(*pos)
                .ok_or_else(|| KeelError::Security("Truncated DER".to_string()))?;
            *pos += 1;
            len = (len << 8) | byte as usize;
        }
        Ok(len)
    }

    fn read_integer(der: &[u8], pos: &mut usize) -> KeelResult<Vec<u8>> {
        if der.get(*pos) != Some(&0x02) {
            return Err(KeelError::Security("Expected DER INTEGER".to_string()));
        }
        *pos += 1;
        let len = read_len(der, pos)?;
        let end = *pos + len;
        if end > der.len() {
            return Err(KeelError::Security("Truncated DER INTEGER".to_string()));
        }
        let mut bytes = der[*pos..end].to_vec();
        *pos = end;
        while bytes.first() == Some(&0) && bytes.len() > 1 {
            bytes.remove(0);
        }
        Ok(bytes)
    }

    let mut pos = 0;
    if der.first() != Some(&0x30) {
        return Err(KeelError::Security("Expected DER SEQUENCE".to_string()));
    }
    pos += 1;
    let _seq_len = read_len(der, &mut pos)?;
    let n = read_integer(der, &mut pos)?;
    let e = read_integer(der, &mut pos)?;
    Ok((n, e))
}

fn pad_left(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut padded = vec![0u8; len - bytes.len()];
    padded.extend_from_slice(bytes);
    padded
}

macro_rules! ecdsa_host_key {
    ($name:ident, $curve:ident, $alg:literal, $curve_name:literal, $field:literal) => {
        /// ECDSA host key over a NIST prime curve.
        pub struct $name {
            signing_key: $curve::ecdsa::SigningKey,
            verifying_key: $curve::ecdsa::VerifyingKey,
        }

        impl $name {
            /// Generates a new key pair.
            pub fn generate() -> KeelResult<Self> {
                let signing_key = $curve::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
                let verifying_key = $curve::ecdsa::VerifyingKey::from(&signing_key);
                Ok(Self {
                    signing_key,
                    verifying_key,
                })
            }
        }

        impl HostKey for $name {
            fn key_type(&self) -> &'static str {
                $alg
            }

            fn signature_algorithms(&self) -> Vec<&'static str> {
                vec![$alg]
            }

            fn public_key_blob(&self) -> Vec<u8> {
                let point = self.verifying_key.to_encoded_point(false);
                let mut buf = Buffer::new();
                buf.put_str($alg);
                buf.put_str($curve_name);
                buf.put_string(point.as_bytes());
                buf.into_bytes()
            }

            fn sign(&self, algorithm: &str, data: &[u8]) -> KeelResult<Vec<u8>> {
                if algorithm != $alg {
                    return Err(KeelError::Security(format!(
                        "{} key cannot sign as {}",
                        $alg, algorithm
                    )));
                }
                use signature::Signer;
                let sig: $curve::ecdsa::Signature = self.signing_key.sign(data);
                let (r, s) = sig.split_bytes();

                let mut sig_blob = Buffer::new();
                sig_blob.put_mpint(&r);
                sig_blob.put_mpint(&s);

                let mut buf = Buffer::new();
                buf.put_str($alg);
                buf.put_string(sig_blob.as_slice());
                Ok(buf.into_bytes())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("algorithm", &$alg)
                    .finish_non_exhaustive()
            }
        }
    };
}

ecdsa_host_key!(EcdsaP256HostKey, p256, "ecdsa-sha2-nistp256", "nistp256", 32);
ecdsa_host_key!(EcdsaP384HostKey, p384, "ecdsa-sha2-nistp384", "nistp384", 48);
ecdsa_host_key!(EcdsaP521HostKey, p521, "ecdsa-sha2-nistp521", "nistp521", 66);

/// Verifies a wire-format signature blob against a wire-format public key
/// blob.
///
/// Understands `ssh-ed25519`, `rsa-sha2-256`, `rsa-sha2-512`, `ssh-rsa`
/// and the three `ecdsa-sha2-nistp*` algorithms. Returns `Ok(false)` on a
/// well-formed but invalid signature; malformed blobs are protocol
/// errors.
pub fn verify_signature(
    algorithm: &str,
    public_key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> KeelResult<bool> {
    let mut key = Buffer::from(public_key_blob);
    let key_format = key.get_string_utf8()?;

    let mut sig = Buffer::from(signature_blob);
    let sig_algorithm = sig.get_string_utf8()?;
    let sig_bytes = sig.get_string()?;

    match algorithm {
        "ssh-ed25519" => {
            if key_format != "ssh-ed25519" || sig_algorithm != "ssh-ed25519" {
                return Ok(false);
            }
            let key_bytes = key.get_string()?;
            if key_bytes.len() != 32 || sig_bytes.len() != 64 {
                return Ok(false);
            }
            let mut kb = [0u8; 32];
            kb.copy_from_slice(&key_bytes);
            let verifying_key = match VerifyingKey::from_bytes(&kb) {
                Ok(vk) => vk,
                Err(_) => return Ok(false),
            };
            let mut sb = [0u8; 64];
            sb.copy_from_slice(&sig_bytes);
            let signature = ed25519_dalek::Signature::from_bytes(&sb);
            Ok(verifying_key.verify(data, &signature).is_ok())
        }
        "rsa-sha2-256" | "rsa-sha2-512" | "ssh-rsa" => {
            if key_format != "ssh-rsa" {
                return Ok(false);
            }
            let e = key.get_mpint()?;
            let n = key.get_mpint()?;
            let components = RsaPublicKeyComponents { n: &n, e: &e };
            let params = match (algorithm, sig_algorithm.as_str()) {
                ("rsa-sha2-256", "rsa-sha2-256") => &RSA_PKCS1_2048_8192_SHA256,
                ("rsa-sha2-512", "rsa-sha2-512") => &RSA_PKCS1_2048_8192_SHA512,
                // Legacy ssh-rsa requests verify against whichever SHA-2
                // variant the signature actually carries.
                ("ssh-rsa", "rsa-sha2-256") => &RSA_PKCS1_2048_8192_SHA256,
                ("ssh-rsa", "rsa-sha2-512") => &RSA_PKCS1_2048_8192_SHA512,
                _ => return Ok(false),
            };
            Ok(components.verify(params, data, &sig_bytes).is_ok())
        }
        "ecdsa-sha2-nistp256" => {
            verify_ecdsa_p256(&mut key, &sig_algorithm, &sig_bytes, data)
        }
        "ecdsa-sha2-nistp384" => {
            verify_ecdsa_p384(&mut key, &sig_algorithm, &sig_bytes, data)
        }
        "ecdsa-sha2-nistp521" => {
            verify_ecdsa_p521(&mut key, &sig_algorithm, &sig_bytes, data)
        }
        _ => Err(KeelError::Security(format!(
            "Unsupported signature algorithm: {}",
            algorithm
        ))),
    }
}

fn split_rs(sig_bytes: &[u8], field_len: usize) -> KeelResult<Vec<u8>> {
    let mut sig = Buffer::from(sig_bytes);
    let r = sig.get_mpint()?;
    let s = sig.get_mpint()?;
    let mut raw = pad_left(&r, field_len);
    raw.extend_from_slice(&pad_left(&s, field_len));
    Ok(raw)
}

macro_rules! verify_ecdsa_fn {
    ($name:ident, $curve:ident, $alg:literal, $field:literal) => {
        fn $name(
            key: &mut Buffer,
            sig_algorithm: &str,
            sig_bytes: &[u8],
            data: &[u8],
        ) -> KeelResult<bool> {
            if sig_algorithm != $alg {
                return Ok(false);
            }
            let _curve_name = key.get_string_utf8()?;
            let point_bytes = key.get_string()?;

            let verifying_key =
                match $curve::ecdsa::VerifyingKey::from_sec1_bytes(&point_bytes) {
                    Ok(vk) => vk,
                    Err(_) => return Ok(false),
                };

            let raw = split_rs(sig_bytes, $field)?;
            let signature = match $curve::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => sig,
                Err(_) => return Ok(false),
            };

            use signature::Verifier;
            Ok(verifying_key.verify(data, &signature).is_ok())
        }
    };
}

verify_ecdsa_fn!(verify_ecdsa_p256, p256, "ecdsa-sha2-nistp256", 32);
verify_ecdsa_fn!(verify_ecdsa_p384, p384, "ecdsa-sha2-nistp384", 48);
verify_ecdsa_fn!(verify_ecdsa_p521, p521, "ecdsa-sha2-nistp521", 66);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let sig = key.sign("ssh-ed25519", b"exchange hash").unwrap();

        assert!(verify_signature("ssh-ed25519", &blob, b"exchange hash", &sig).unwrap());
        assert!(!verify_signature("ssh-ed25519", &blob, b"other data", &sig).unwrap());
    }

    #[test]
    fn test_ed25519_blob_format() {
        let key = Ed25519HostKey::generate().unwrap();
        let mut blob = Buffer::from(key.public_key_blob());
        assert_eq!(blob.get_string_utf8().unwrap(), "ssh-ed25519");
        assert_eq!(blob.get_string().unwrap().len(), 32);
    }

    #[test]
    fn test_ed25519_from_bytes_round_trip() {
        let key = Ed25519HostKey::generate().unwrap();
        let secret = key.secret_bytes();
        let restored = Ed25519HostKey::from_bytes(&secret[..]).unwrap();
        assert_eq!(key.public_key_blob(), restored.public_key_blob());
    }

    #[test]
    fn test_ed25519_wrong_algorithm() {
        let key = Ed25519HostKey::generate().unwrap();
        assert!(key.sign("rsa-sha2-256", b"data").is_err());
    }

    #[test]
    fn test_ecdsa_p256_sign_verify() {
        let key = EcdsaP256HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let sig = key.sign("ecdsa-sha2-nistp256", b"hash").unwrap();
        assert!(verify_signature("ecdsa-sha2-nistp256", &blob, b"hash", &sig).unwrap());
        assert!(!verify_signature("ecdsa-sha2-nistp256", &blob, b"tampered", &sig).unwrap());
    }

    #[test]
    fn test_ecdsa_p521_sign_verify() {
        let key = EcdsaP521HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let sig = key.sign("ecdsa-sha2-nistp521", b"hash").unwrap();
        assert!(verify_signature("ecdsa-sha2-nistp521", &blob, b"hash", &sig).unwrap());
    }

    #[test]
    fn test_ecdsa_blob_carries_curve_name() {
        let key = EcdsaP384HostKey::generate().unwrap();
        let mut blob = Buffer::from(key.public_key_blob());
        assert_eq!(blob.get_string_utf8().unwrap(), "ecdsa-sha2-nistp384");
        assert_eq!(blob.get_string_utf8().unwrap(), "nistp384");
    }

    #[test]
    fn test_verify_unknown_algorithm() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let sig = key.sign("ssh-ed25519", b"x").unwrap();
        assert!(verify_signature("ssh-dss", &blob, b"x", &sig).is_err());
    }

    #[test]
    fn test_static_key_provider() {
        let provider = StaticKeyProvider::ephemeral().unwrap();
        assert_eq!(provider.key_types(), vec!["ssh-ed25519".to_string()]);
        assert!(provider.load_key("ssh-ed25519").is_some());
        assert!(provider.load_key("rsa-sha2-256").is_none());
    }

    #[test]
    fn test_key_provider_multiple_types() {
        let provider = StaticKeyProvider::new(vec![
            Arc::new(Ed25519HostKey::generate().unwrap()),
            Arc::new(EcdsaP256HostKey::generate().unwrap()),
        ]);
        let types = provider.key_types();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&"ecdsa-sha2-nistp256".to_string()));
    }

    #[test]
    fn test_parse_rsa_public_der() {
        // SEQUENCE { INTEGER 0x00bc614e, INTEGER 0x010001 }
        let der = [
            0x30, 0x0b, 0x02, 0x04, 0x00, 0xbc, 0x61, 0x4e, 0x02, 0x03, 0x01, 0x00, 0x01,
        ];
        let (n, e) = parse_rsa_public_der(&der).unwrap();
        assert_eq!(n, vec![0xbc, 0x61, 0x4e]);
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_pad_left() {
        assert_eq!(pad_left(&[1, 2], 4), vec![0, 0, 1, 2]);
        assert_eq!(pad_left(&[1, 2, 3, 4, 5], 4), vec![2, 3, 4, 5]);
    }
}
