//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! The codec is split per direction: an [`PacketEncoder`] seals outbound
//! payloads (compress, pad, encrypt, MAC, bump sequence) and a
//! [`PacketDecoder`] opens inbound packets (decrypt first block to learn
//! the length, verify MAC, strip padding, decompress). Sequence numbers
//! survive rekeying: [`install`](PacketEncoder::install) swaps cipher, MAC
//! and compression but leaves the counter running.
//!
//! # Constraints
//!
//! - `packet_length` excludes the MAC and the length field itself
//! - padding is 4..=255 bytes, total length a multiple of the cipher block
//! - maximum packet length 256 KiB; violation is fatal for the session

use crate::ssh::crypto::{PacketCipher, PacketMac};
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted packet length (256 KiB).
pub const MAX_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Payload compression applied before framing.
///
/// `zlib@openssh.com` negotiates zlib that only becomes active once the
/// user has authenticated; plain `zlib` is active immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// No compression.
    None,
    /// RFC 4253 zlib.
    Zlib {
        /// Delayed (`zlib@openssh.com`) compression waits for
        /// USERAUTH_SUCCESS before activating.
        delayed: bool,
        /// Whether the compressor is currently applied.
        active: bool,
    },
}

impl Compression {
    /// Resolves a negotiable compression name.
    pub fn from_name(name: &str) -> KeelResult<Self> {
        match name {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib {
                delayed: false,
                active: true,
            }),
            "zlib@openssh.com" => Ok(Compression::Zlib {
                delayed: true,
                active: false,
            }),
            _ => Err(KeelError::Protocol(format!(
                "Unknown compression: {}",
                name
            ))),
        }
    }

    /// Built-in names in preference order.
    pub fn builtin_names() -> Vec<String> {
        vec![
            "none".to_string(),
            "zlib@openssh.com".to_string(),
            "zlib".to_string(),
        ]
    }

    /// Activates delayed compression (call after USERAUTH_SUCCESS).
    pub fn activate(&mut self) {
        if let Compression::Zlib { active, .. } = self {
            *active = true;
        }
    }

    fn compress(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            Compression::Zlib { active: true, .. } => {
                miniz_oxide::deflate::compress_to_vec_zlib(payload, 6)
            }
            _ => payload.to_vec(),
        }
    }

    fn decompress(&self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        match self {
            Compression::Zlib { active: true, .. } => {
                miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(
                    payload,
                    MAX_PACKET_LENGTH,
                )
                .map_err(|e| KeelError::Protocol(format!("Decompression failed: {:?}", e)))
            }
            _ => Ok(payload.to_vec()),
        }
    }
}

/// Outbound half of the packet codec.
pub struct PacketEncoder {
    cipher: Option<Box<dyn PacketCipher>>,
    mac: Option<PacketMac>,
    compression: Compression,
    seq: u32,
    bytes_since_kex: u64,
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEncoder {
    /// Creates a cleartext encoder (pre-NEWKEYS).
    pub fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            compression: Compression::None,
            seq: 0,
            bytes_since_kex: 0,
        }
    }

    /// Installs new keys after NEWKEYS. The sequence counter keeps
    /// running; the rekey byte counter resets.
    pub fn install(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Option<PacketMac>,
        compression: Compression,
    ) {
        self.cipher = Some(cipher);
        self.mac = mac;
        self.compression = compression;
        self.bytes_since_kex = 0;
    }

    /// Activates delayed compression.
    pub fn activate_compression(&mut self) {
        self.compression.activate();
    }

    /// Bytes sealed since the last key installation (rekey trigger input).
    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    /// Current outbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Seals one payload into a wire packet.
    pub fn seal(&mut self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        let payload = self.compression.compress(payload);
        let block = self.cipher.as_ref().map_or(8, |c| c.block_size()).max(8);

        // padding so that 4 + 1 + payload + padding is a block multiple
        let mut padding_len = MIN_PADDING_LEN;
        while (5 + payload.len() + padding_len) % block != 0 {
            padding_len += 1;
        }

        let packet_length = 1 + payload.len() + padding_len;
        if 4 + packet_length > MAX_PACKET_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Outbound packet too large: {} bytes (maximum {})",
                4 + packet_length,
                MAX_PACKET_LENGTH
            )));
        }

        let mut clear = Vec::with_capacity(4 + packet_length);
        clear.extend_from_slice(&(packet_length as u32).to_be_bytes());
        clear.push(padding_len as u8);
        clear.extend_from_slice(&payload);

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);
        clear.extend_from_slice(&padding);

        let tag = self.mac.as_ref().map(|m| m.sign(self.seq, &clear));

        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut clear)?;
        }
        if let Some(tag) = tag {
            clear.extend_from_slice(&tag);
        }

        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_kex += clear.len() as u64;

        Ok(clear)
    }
}

impl std::fmt::Debug for PacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEncoder")
            .field("seq", &self.seq)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

/// Inbound half of the packet codec.
pub struct PacketDecoder {
    cipher: Option<Box<dyn PacketCipher>>,
    mac: Option<PacketMac>,
    compression: Compression,
    seq: u32,
    bytes_since_kex: u64,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Creates a cleartext decoder (pre-NEWKEYS).
    pub fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            compression: Compression::None,
            seq: 0,
            bytes_since_kex: 0,
        }
    }

    /// Installs new keys after NEWKEYS; sequence counter keeps running.
    pub fn install(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Option<PacketMac>,
        compression: Compression,
    ) {
        self.cipher = Some(cipher);
        self.mac = mac;
        self.compression = compression;
        self.bytes_since_kex = 0;
    }

    /// Activates delayed compression.
    pub fn activate_compression(&mut self) {
        self.compression.activate();
    }

    /// Bytes opened since the last key installation.
    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    /// Current inbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Reads and opens the next packet, returning its payload.
    ///
    /// # Errors
    ///
    /// Length violations and MAC failures return
    /// [`KeelError::Protocol`] and must be treated as fatal by the caller.
    pub async fn read_packet<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> KeelResult<Vec<u8>> {
        let block = self.cipher.as_ref().map_or(8, |c| c.block_size()).max(8);

        let mut first = vec![0u8; block];
        reader.read_exact(&mut first).await.map_err(KeelError::Io)?;
        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut first)?;
        }

        let packet_length =
            u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;

        if packet_length < 5 || 4 + packet_length > MAX_PACKET_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Invalid packet length: {} (maximum {})",
                packet_length, MAX_PACKET_LENGTH
            )));
        }
        if (4 + packet_length) % block != 0 {
            return Err(KeelError::Protocol(format!(
                "Packet length {} not aligned to cipher block {}",
                packet_length, block
            )));
        }

        let mut clear = first;
        let rest_len = 4 + packet_length - clear.len();
        if rest_len > 0 {
            let mut rest = vec![0u8; rest_len];
            reader.read_exact(&mut rest).await.map_err(KeelError::Io)?;
            if let Some(cipher) = &mut self.cipher {
                cipher.process(&mut rest)?;
            }
            clear.extend_from_slice(&rest);
        }

        let mut total = clear.len();
        if let Some(mac) = &self.mac {
            let mut tag = vec![0u8; mac.mac_len()];
            reader.read_exact(&mut tag).await.map_err(KeelError::Io)?;
            if !mac.verify(self.seq, &clear, &tag) {
                return Err(KeelError::Protocol(format!(
                    "MAC verification failed on inbound packet {}",
                    self.seq
                )));
            }
            total += tag.len();
        }

        let padding_len = clear[4] as usize;
        if padding_len < MIN_PADDING_LEN || padding_len + 1 > packet_length {
            return Err(KeelError::Protocol(format!(
                "Invalid padding length: {}",
                padding_len
            )));
        }

        let payload = &clear[5..4 + packet_length - padding_len];
        let payload = self.compression.decompress(payload)?;

        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_kex += total as u64;

        Ok(payload)
    }
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDecoder")
            .field("seq", &self.seq)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherDirection, CipherRegistry};

    fn key_material(len: usize) -> Vec<u8> {
        (1..=len).map(|i| i as u8).collect()
    }

    async fn round_trip(enc: &mut PacketEncoder, dec: &mut PacketDecoder, payload: &[u8]) {
        let wire = enc.seal(payload).unwrap();
        let mut reader = &wire[..];
        let opened = dec.read_packet(&mut reader).await.unwrap();
        assert_eq!(opened, payload);
    }

    #[tokio::test]
    async fn test_cleartext_round_trip() {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();
        round_trip(&mut enc, &mut dec, b"\x14cleartext payload").await;
        assert_eq!(enc.seq(), 1);
        assert_eq!(dec.seq(), 1);
    }

    #[tokio::test]
    async fn test_cleartext_alignment() {
        let mut enc = PacketEncoder::new();
        let wire = enc.seal(b"x").unwrap();
        assert_eq!(wire.len() % 8, 0);
        assert!(wire.len() >= 16);
    }

    fn encrypted_pair() -> (PacketEncoder, PacketDecoder) {
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes128-ctr").unwrap();
        let key = key_material(16);
        let iv = key_material(16);

        let mut enc = PacketEncoder::new();
        enc.install(
            factory.create(&key, &iv, CipherDirection::Encrypt).unwrap(),
            Some(PacketMac::new("hmac-sha2-256", &key_material(32)).unwrap()),
            Compression::None,
        );

        let mut dec = PacketDecoder::new();
        dec.install(
            factory.create(&key, &iv, CipherDirection::Decrypt).unwrap(),
            Some(PacketMac::new("hmac-sha2-256", &key_material(32)).unwrap()),
            Compression::None,
        );

        (enc, dec)
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (mut enc, mut dec) = encrypted_pair();
        round_trip(&mut enc, &mut dec, b"\x5e encrypted channel data").await;
        round_trip(&mut enc, &mut dec, b"\x5e second packet keeps stream state").await;
    }

    #[tokio::test]
    async fn test_mac_failure_is_fatal() {
        let (mut enc, mut dec) = encrypted_pair();
        let mut wire = enc.seal(b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let mut reader = &wire[..];
        let err = dec.read_packet(&mut reader).await.unwrap_err();
        assert!(matches!(err, KeelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversize_packet_rejected() {
        let mut dec = PacketDecoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_PACKET_LENGTH as u32) + 64).to_be_bytes());
        wire.extend_from_slice(&[4u8; 12]);
        let mut reader = &wire[..];
        let err = dec.read_packet(&mut reader).await.unwrap_err();
        assert!(matches!(err, KeelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected_outbound() {
        let mut enc = PacketEncoder::new();
        let err = enc.seal(&vec![0u8; MAX_PACKET_LENGTH + 1]).unwrap_err();
        assert!(matches!(err, KeelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_zlib_round_trip() {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();
        enc.compression = Compression::from_name("zlib").unwrap();
        dec.compression = Compression::from_name("zlib").unwrap();

        let payload = vec![b'a'; 4000];
        let wire = enc.seal(&payload).unwrap();
        assert!(wire.len() < payload.len());
        let mut reader = &wire[..];
        assert_eq!(dec.read_packet(&mut reader).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_delayed_zlib_inactive_until_activated() {
        let mut compression = Compression::from_name("zlib@openssh.com").unwrap();
        assert_eq!(
            compression,
            Compression::Zlib {
                delayed: true,
                active: false
            }
        );
        compression.activate();
        assert_eq!(
            compression,
            Compression::Zlib {
                delayed: true,
                active: true
            }
        );
    }

    #[tokio::test]
    async fn test_sequence_survives_reinstall() {
        let (mut enc, mut dec) = encrypted_pair();
        round_trip(&mut enc, &mut dec, b"before rekey").await;
        let seq_before = enc.seq();

        // Reinstall fresh keys; counters must continue, byte counts reset.
        let registry = CipherRegistry::builtin();
        let factory = registry.get("aes256-ctr").unwrap();
        let key = key_material(32);
        let iv = key_material(16);
        enc.install(
            factory.create(&key, &iv, CipherDirection::Encrypt).unwrap(),
            Some(PacketMac::new("hmac-sha2-512", &key_material(64)).unwrap()),
            Compression::None,
        );
        dec.install(
            factory.create(&key, &iv, CipherDirection::Decrypt).unwrap(),
            Some(PacketMac::new("hmac-sha2-512", &key_material(64)).unwrap()),
            Compression::None,
        );
        assert_eq!(enc.seq(), seq_before);
        assert_eq!(enc.bytes_since_kex(), 0);

        round_trip(&mut enc, &mut dec, b"after rekey").await;
    }
}
