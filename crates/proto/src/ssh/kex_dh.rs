//! Diffie-Hellman and ECDH key exchange (RFC 4253, RFC 4419, RFC 5656, RFC 8731).
//!
//! Implemented exchanges:
//! - `diffie-hellman-group14-sha1` / `diffie-hellman-group14-sha256`
//! - `diffie-hellman-group-exchange-sha256` (server picks the group from
//!   the client's min/preferred/max bit sizes)
//! - `ecdh-sha2-nistp256` / `ecdh-sha2-nistp384` / `ecdh-sha2-nistp521`
//! - `curve25519-sha256` / `curve25519-sha256@libssh.org`
//!
//! Also provides the exchange-hash builders (the first hash becomes the
//! session id) and the RFC 4253 Section 7.2 key-stream derivation.
//!
//! # Security
//!
//! - MODP peer values are validated to lie in (1, p-1)
//! - Private exponents and shared secrets are zeroized on drop
//! - Each exchange name is bound to its digest (SHA-1 only where the name
//!   demands it)

use crate::ssh::buffer::Buffer;
use keel_platform::{KeelError, KeelResult};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroize;

/// Digest bound to a key-exchange algorithm name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1 (legacy group14-sha1 only).
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-384 (ecdh-sha2-nistp384).
    Sha384,
    /// SHA-512 (ecdh-sha2-nistp521).
    Sha512,
}

impl KexHash {
    /// Hashes `data` with this digest.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
            KexHash::Sha384 => Sha384::digest(data).to_vec(),
            KexHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha384 => 48,
            KexHash::Sha512 => 64,
        }
    }
}

/// A supported key-exchange algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (also the @libssh.org alias).
    Curve25519,
    /// ecdh-sha2-nistp256.
    EcdhP256,
    /// ecdh-sha2-nistp384.
    EcdhP384,
    /// ecdh-sha2-nistp521.
    EcdhP521,
    /// diffie-hellman-group14-sha1.
    Group14Sha1,
    /// diffie-hellman-group14-sha256.
    Group14Sha256,
    /// diffie-hellman-group-exchange-sha256.
    GroupExchangeSha256,
}

impl KexAlgorithm {
    /// Resolves a negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => Some(Self::Curve25519),
            "ecdh-sha2-nistp256" => Some(Self::EcdhP256),
            "ecdh-sha2-nistp384" => Some(Self::EcdhP384),
            "ecdh-sha2-nistp521" => Some(Self::EcdhP521),
            "diffie-hellman-group14-sha1" => Some(Self::Group14Sha1),
            "diffie-hellman-group14-sha256" => Some(Self::Group14Sha256),
            "diffie-hellman-group-exchange-sha256" => Some(Self::GroupExchangeSha256),
            _ => None,
        }
    }

    /// Digest bound to this algorithm.
    pub fn hash(&self) -> KexHash {
        match self {
            Self::Curve25519 | Self::EcdhP256 | Self::Group14Sha256 | Self::GroupExchangeSha256 => {
                KexHash::Sha256
            }
            Self::EcdhP384 => KexHash::Sha384,
            Self::EcdhP521 => KexHash::Sha512,
            Self::Group14Sha1 => KexHash::Sha1,
        }
    }

    /// True for the RFC 4419 group-exchange flow (extra group messages).
    pub fn is_group_exchange(&self) -> bool {
        matches!(self, Self::GroupExchangeSha256)
    }

    /// True when exchange values are mpints (MODP DH) rather than octet
    /// strings (ECDH / curve25519).
    pub fn uses_mpint_values(&self) -> bool {
        matches!(
            self,
            Self::Group14Sha1 | Self::Group14Sha256 | Self::GroupExchangeSha256
        )
    }
}

/// A fixed MODP group (RFC 3526).
pub struct ModpGroup {
    /// Prime modulus.
    pub p: Lazy<BigUint>,
    /// Generator.
    pub g: u32,
    /// Modulus size in bits.
    pub bits: u32,
}

/// 2048-bit MODP group 14.
pub static GROUP14: ModpGroup = ModpGroup {
    p: Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(concat!(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
                "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
                "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
                "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
                "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
                "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
                "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
                "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
                "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
                "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
                "15728E5A8AACAA68FFFFFFFFFFFFFFFF"
            ))
            .expect("group14 prime is valid hex"),
        )
    }),
    g: 2,
    bits: 2048,
};

/// 4096-bit MODP group 16.
pub static GROUP16: ModpGroup = ModpGroup {
    p: Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(concat!(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
                "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
                "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
                "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
                "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
                "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
                "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
                "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
                "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
                "DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AAAC42D",
                "AD33170D04507A33A85521ABDF1CBA64ECFB850458DBEF0A",
                "8AEA71575D060C7DB3970F85A6E1E4C7ABF5AE8CDB0933D7",
                "1E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
                "D87602733EC86A64521F2B18177B200CBBE117577A615D6C",
                "770988C0BAD946E208E24FA074E5AB3143DB5BFCE0FD108E",
                "4B82D120A92108011A723C12A787E6D788719A10BDBA5B26",
                "99C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
                "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D",
                "99B2964FA090C3A2233BA186515BE7ED1F612970CEE2D7AF",
                "B81BDD762170481CD0069127D5B05AA993B4EA988D8FDDC1",
                "86FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF"
            ))
            .expect("group16 prime is valid hex"),
        )
    }),
    g: 2,
    bits: 4096,
};

/// Picks a group-exchange group honoring the client's min/preferred/max
/// bit sizes (RFC 4419 Section 3).
pub fn choose_gex_group(min: u32, preferred: u32, max: u32) -> KeelResult<&'static ModpGroup> {
    if min > max || preferred < min || preferred > max {
        return Err(KeelError::Protocol(format!(
            "Inconsistent group-exchange sizes: min={} preferred={} max={}",
            min, preferred, max
        )));
    }
    if max < GROUP14.bits {
        return Err(KeelError::Protocol(format!(
            "No supported group below {} bits",
            GROUP14.bits
        )));
    }
    if preferred > GROUP14.bits && max >= GROUP16.bits {
        Ok(&GROUP16)
    } else {
        Ok(&GROUP14)
    }
}

/// MODP Diffie-Hellman exchange over a fixed or negotiated group.
pub struct ModpExchange {
    group: &'static ModpGroup,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl ModpExchange {
    /// Generates an ephemeral key pair in the group.
    pub fn new(group: &'static ModpGroup) -> Self {
        use num_bigint::RandBigInt;
        use rand::thread_rng;

        let mut rng = thread_rng();
        let p_minus_one: BigUint = (*group.p).clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = BigUint::from(group.g).modpow(&x, &*group.p);

        Self {
            group,
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the group this exchange runs in.
    pub fn group(&self) -> &'static ModpGroup {
        self.group
    }

    /// Returns the public value `g^x mod p` (big-endian magnitude).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret `peer^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] when the peer value is outside
    /// (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);

        if y_peer <= BigUint::from(1u32) || y_peer >= *self.group.p {
            return Err(KeelError::Protocol(
                "Invalid peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &*self.group.p);
        Ok(k.to_bytes_be())
    }
}

impl Drop for ModpExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 exchange (RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral key pair.
    pub fn new() -> KeelResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KeelError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            KeelError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret; consumes the exchange.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(KeelError::Protocol(format!(
                "Invalid Curve25519 public key length: expected 32, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| KeelError::Security("Curve25519 key agreement failed".to_string()))
    }
}

/// ECDH exchange over a NIST prime curve (RFC 5656).
pub enum EcdhExchange {
    /// nistp256
    P256(p256::ecdh::EphemeralSecret),
    /// nistp384
    P384(p384::ecdh::EphemeralSecret),
    /// nistp521
    P521(p521::ecdh::EphemeralSecret),
}

impl EcdhExchange {
    /// Generates an ephemeral key pair on the curve bound to `algorithm`.
    pub fn new(algorithm: KexAlgorithm) -> KeelResult<Self> {
        let mut rng = rand::rngs::OsRng;
        match algorithm {
            KexAlgorithm::EcdhP256 => Ok(Self::P256(p256::ecdh::EphemeralSecret::random(&mut rng))),
            KexAlgorithm::EcdhP384 => Ok(Self::P384(p384::ecdh::EphemeralSecret::random(&mut rng))),
            KexAlgorithm::EcdhP521 => Ok(Self::P521(p521::ecdh::EphemeralSecret::random(&mut rng))),
            _ => Err(KeelError::Protocol(format!(
                "Not an ECDH algorithm: {:?}",
                algorithm
            ))),
        }
    }

    /// Returns the uncompressed SEC1 public point.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::P256(secret) => p256::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
            Self::P384(secret) => p384::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
            Self::P521(secret) => p521::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
        }
    }

    /// Computes the shared secret from the peer's SEC1 point; consumes the
    /// exchange.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        let invalid =
            |_| KeelError::Protocol("Invalid ECDH peer public key".to_string());
        match self {
            Self::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(invalid)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            Self::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public).map_err(invalid)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            Self::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_public).map_err(invalid)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// Inputs common to every exchange-hash computation.
#[derive(Debug, Clone)]
pub struct ExchangeHashInput<'a> {
    /// Client identification string (no CR LF).
    pub client_version: &'a str,
    /// Server identification string (no CR LF).
    pub server_version: &'a str,
    /// Client SSH_MSG_KEXINIT payload.
    pub client_kexinit: &'a [u8],
    /// Server SSH_MSG_KEXINIT payload.
    pub server_kexinit: &'a [u8],
    /// Server host key blob.
    pub host_key_blob: &'a [u8],
}

impl ExchangeHashInput<'_> {
    fn common(&self, buf: &mut Buffer) {
        buf.put_str(self.client_version.trim_end_matches("\r\n"));
        buf.put_str(self.server_version.trim_end_matches("\r\n"));
        buf.put_string(self.client_kexinit);
        buf.put_string(self.server_kexinit);
        buf.put_string(self.host_key_blob);
    }
}

/// Exchange hash for ECDH and curve25519: values are octet strings
/// (RFC 5656 Section 4, RFC 8731 Section 3.3).
pub fn exchange_hash_ecdh(
    hash: KexHash,
    input: &ExchangeHashInput<'_>,
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new();
    input.common(&mut buf);
    buf.put_string(client_public);
    buf.put_string(server_public);
    buf.put_mpint(shared_secret);
    hash.digest(buf.as_slice())
}

/// Exchange hash for fixed-group DH: e and f are mpints (RFC 4253 §8).
pub fn exchange_hash_dh(
    hash: KexHash,
    input: &ExchangeHashInput<'_>,
    e: &[u8],
    f: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new();
    input.common(&mut buf);
    buf.put_mpint(e);
    buf.put_mpint(f);
    buf.put_mpint(shared_secret);
    hash.digest(buf.as_slice())
}

/// Exchange hash for group exchange: adds min/n/max and the group
/// parameters (RFC 4419 Section 3).
#[allow(clippy::too_many_arguments)]
pub fn exchange_hash_gex(
    hash: KexHash,
    input: &ExchangeHashInput<'_>,
    min: u32,
    preferred: u32,
    max: u32,
    p: &[u8],
    g: &[u8],
    e: &[u8],
    f: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new();
    input.common(&mut buf);
    buf.put_u32(min);
    buf.put_u32(preferred);
    buf.put_u32(max);
    buf.put_mpint(p);
    buf.put_mpint(g);
    buf.put_mpint(e);
    buf.put_mpint(f);
    buf.put_mpint(shared_secret);
    hash.digest(buf.as_slice())
}

/// Derives one key stream from `(K, H, session_id, letter)`
/// (RFC 4253 Section 7.2).
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// K is hashed in mpint form. Output longer than one digest is extended
/// with `HASH(K || H || output_so_far)`.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = Buffer::new();
    k_mpint.put_mpint(shared_secret);

    let mut block_input = Buffer::new();
    block_input.put_raw(k_mpint.as_slice());
    block_input.put_raw(exchange_hash);
    block_input.put_u8(letter);
    block_input.put_raw(session_id);

    let mut key = hash.digest(block_input.as_slice());

    while key.len() < key_length {
        let mut next = Buffer::new();
        next.put_raw(k_mpint.as_slice());
        next.put_raw(exchange_hash);
        next.put_raw(&key);
        key.extend_from_slice(&hash.digest(next.as_slice()));
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kex_algorithm_names() {
        assert_eq!(
            KexAlgorithm::from_name("curve25519-sha256@libssh.org"),
            Some(KexAlgorithm::Curve25519)
        );
        assert_eq!(
            KexAlgorithm::from_name("diffie-hellman-group14-sha1").unwrap().hash(),
            KexHash::Sha1
        );
        assert_eq!(
            KexAlgorithm::from_name("ecdh-sha2-nistp521").unwrap().hash(),
            KexHash::Sha512
        );
        assert!(KexAlgorithm::from_name("kexguess2@matt.ucc.asn.au").is_none());
    }

    #[test]
    fn test_group14_key_exchange() {
        let server = ModpExchange::new(&GROUP14);
        let client = ModpExchange::new(&GROUP14);

        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();

        assert_eq!(server_secret, client_secret);
        assert!(!server_secret.is_empty());
    }

    #[test]
    fn test_modp_invalid_peer_key() {
        let exchange = ModpExchange::new(&GROUP14);
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange
            .compute_shared_secret(&GROUP14.p.to_bytes_be())
            .is_err());
    }

    #[test]
    fn test_choose_gex_group() {
        assert_eq!(choose_gex_group(1024, 2048, 8192).unwrap().bits, 2048);
        assert_eq!(choose_gex_group(2048, 4096, 8192).unwrap().bits, 4096);
        assert_eq!(choose_gex_group(1024, 3072, 3072).unwrap().bits, 2048);
        assert!(choose_gex_group(512, 1024, 1024).is_err());
        assert!(choose_gex_group(4096, 2048, 8192).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_ecdh_p256_key_exchange() {
        let client = EcdhExchange::new(KexAlgorithm::EcdhP256).unwrap();
        let server = EcdhExchange::new(KexAlgorithm::EcdhP256).unwrap();

        let client_public = client.public_key();
        let server_public = server.public_key();
        // Uncompressed SEC1: 0x04 || x || y
        assert_eq!(client_public[0], 0x04);
        assert_eq!(client_public.len(), 65);

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_ecdh_p521_key_exchange() {
        let client = EcdhExchange::new(KexAlgorithm::EcdhP521).unwrap();
        let server = EcdhExchange::new(KexAlgorithm::EcdhP521).unwrap();

        let client_public = client.public_key();
        let server_public = server.public_key();
        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_ecdh_rejects_garbage_peer() {
        let exchange = EcdhExchange::new(KexAlgorithm::EcdhP256).unwrap();
        assert!(exchange.compute_shared_secret(&[0u8; 65]).is_err());
    }

    fn sample_input<'a>() -> ExchangeHashInput<'a> {
        ExchangeHashInput {
            client_version: "SSH-2.0-TestClient",
            server_version: "SSH-2.0-Keel_0.1.0",
            client_kexinit: b"client-kexinit",
            server_kexinit: b"server-kexinit",
            host_key_blob: b"host-key-blob",
        }
    }

    #[test]
    fn test_exchange_hash_deterministic() {
        let input = sample_input();
        let h1 = exchange_hash_ecdh(KexHash::Sha256, &input, b"qc", b"qs", b"kk");
        let h2 = exchange_hash_ecdh(KexHash::Sha256, &input, b"qc", b"qs", b"kk");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        let h3 = exchange_hash_ecdh(KexHash::Sha256, &input, b"qc", b"qs", b"other");
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_exchange_hash_dh_differs_from_ecdh() {
        let input = sample_input();
        let ecdh = exchange_hash_ecdh(KexHash::Sha256, &input, b"\x10", b"\x20", b"\x30");
        let dh = exchange_hash_dh(KexHash::Sha256, &input, b"\x10", b"\x20", b"\x30");
        // mpint vs string framing must produce different transcripts
        assert_ne!(ecdh, dh);
    }

    #[test]
    fn test_derive_key_lengths_and_letters() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let key = derive_key(KexHash::Sha256, &k, &h, &sid, b'C', 32);
        assert_eq!(key.len(), 32);

        let key_a = derive_key(KexHash::Sha256, &k, &h, &sid, b'A', 32);
        assert_ne!(key, key_a);

        // Extension produces a stable prefix.
        let long = derive_key(KexHash::Sha256, &k, &h, &sid, b'C', 64);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..32], &key[..]);
    }

    #[test]
    fn test_derive_key_sha1() {
        let key = derive_key(KexHash::Sha1, &[1, 2, 3], &[4, 5], &[6], b'E', 24);
        assert_eq!(key.len(), 24);
    }
}
