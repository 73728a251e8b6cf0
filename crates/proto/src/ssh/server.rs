//! SSH server: accept loop, per-session orchestration, embedder seams.
//!
//! [`SshServer`] binds a listener (applying the configured socket
//! options), accepts TCP connections and produces [`SshSession`]s with
//! the banner exchange and initial key exchange already done. The
//! embedder then drives [`authenticate`](SshSession::authenticate) and
//! [`run`](SshSession::run).
//!
//! Outbound packets from any task are serialized through one
//! [`PacketSender`] behind an async mutex. During a rekey the sender
//! holds back non-channel packets; channel data keeps flowing until
//! NEWKEYS, after which the queue drains under the new keys.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::server::SshServer;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SshServer::bind("127.0.0.1:2222").await?;
//! loop {
//!     let mut session = server.accept().await?;
//!     tokio::spawn(async move {
//!         if session.authenticate().await.is_ok() {
//!             let _ = session.run().await;
//!         }
//!     });
//! }
//! # }
//! ```

use crate::ssh::auth::{
    AuthBanner, AuthFailure, AuthOutcome, AuthSuccess, InteractiveChallenger,
    PasswordAuthenticator, PublickeyAuthenticator, UserAuthService,
};
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{ChannelStdin, ChannelWriter, PacketSink};
use crate::ssh::config::Config;
use crate::ssh::crypto::{CipherDirection, CipherRegistry, PacketMac};
use crate::ssh::hostkey::{HostKey, KeyProvider, StaticKeyProvider};
use crate::ssh::kex::{KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{
    choose_gex_group, derive_key, exchange_hash_dh, exchange_hash_ecdh, exchange_hash_gex,
    Curve25519Exchange, EcdhExchange, ExchangeHashInput, KexAlgorithm, ModpExchange,
};
use crate::ssh::message::{gex, DisconnectReason, MessageType};
use crate::ssh::mux::{
    AcceptAllForwarding, CommandFactory, ConnectionService, ForwardingFilter, SubsystemFactory,
};
use crate::ssh::packet::{Compression, PacketDecoder, PacketEncoder};
use crate::ssh::sftp::server::{SftpConfig, SftpSubsystem};
use crate::ssh::transport::{State, TransportConfig, TransportState};
use crate::ssh::version::Version;
use keel_platform::{Completion, KeelError, KeelResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn is_channel_message(msg_type: u8) -> bool {
    (MessageType::ChannelOpen as u8..=MessageType::ChannelFailure as u8).contains(&msg_type)
}

struct SenderState {
    write_half: OwnedWriteHalf,
    encoder: PacketEncoder,
    hold: bool,
    queue: Vec<Vec<u8>>,
}

/// The serialized outbound packet path for one session.
pub struct PacketSender {
    inner: tokio::sync::Mutex<SenderState>,
}

impl PacketSender {
    pub(crate) fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(SenderState {
                write_half,
                encoder: PacketEncoder::new(),
                hold: false,
                queue: Vec::new(),
            }),
        }
    }

    async fn write_sealed(state: &mut SenderState, payload: &[u8]) -> KeelResult<()> {
        let wire = state.encoder.seal(payload)?;
        state
            .write_half
            .write_all(&wire)
            .await
            .map_err(KeelError::Io)
    }

    /// Sends bypassing the rekey hold (KEX, NEWKEYS, DISCONNECT).
    pub async fn send_now(&self, payload: Vec<u8>) -> KeelResult<()> {
        let mut state = self.inner.lock().await;
        Self::write_sealed(&mut state, &payload).await
    }

    /// Enables or disables the rekey hold; disabling drains the queue
    /// under the (new) keys.
    pub async fn set_hold(&self, hold: bool) -> KeelResult<()> {
        let mut state = self.inner.lock().await;
        state.hold = hold;
        if !hold {
            let queued = std::mem::take(&mut state.queue);
            for payload in queued {
                Self::write_sealed(&mut state, &payload).await?;
            }
        }
        Ok(())
    }

    /// Installs new outbound keys (sequence number keeps running).
    pub async fn install(
        &self,
        cipher: Box<dyn crate::ssh::crypto::PacketCipher>,
        mac: Option<PacketMac>,
        compression: Compression,
    ) {
        let mut state = self.inner.lock().await;
        state.encoder.install(cipher, mac, compression);
    }

    /// Seals NEWKEYS under the old keys and installs the new outbound
    /// keys in the same critical section, so no later packet can slip
    /// out under the old keys.
    pub async fn send_newkeys_and_install(
        &self,
        cipher: Box<dyn crate::ssh::crypto::PacketCipher>,
        mac: Option<PacketMac>,
        compression: Compression,
    ) -> KeelResult<()> {
        let mut state = self.inner.lock().await;
        Self::write_sealed(&mut state, &NewKeys::new().to_bytes()).await?;
        state.encoder.install(cipher, mac, compression);
        Ok(())
    }

    /// Activates delayed compression after USERAUTH_SUCCESS.
    pub async fn activate_compression(&self) {
        let mut state = self.inner.lock().await;
        state.encoder.activate_compression();
    }

    /// Outbound bytes since the last key installation.
    pub async fn bytes_since_kex(&self) -> u64 {
        self.inner.lock().await.encoder.bytes_since_kex()
    }
}

#[async_trait::async_trait]
impl PacketSink for PacketSender {
    async fn send(&self, payload: Vec<u8>) -> KeelResult<()> {
        let mut state = self.inner.lock().await;
        if state.hold && !payload.first().copied().is_some_and(is_channel_message) {
            state.queue.push(payload);
            return Ok(());
        }
        Self::write_sealed(&mut state, &payload).await
    }
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender").finish_non_exhaustive()
    }
}

/// One direction's worth of freshly derived key material.
pub(crate) struct DirectionKeys {
    pub(crate) cipher: Box<dyn crate::ssh::crypto::PacketCipher>,
    pub(crate) mac: PacketMac,
    pub(crate) compression: Compression,
}

/// Derives (outbound, inbound) key material for one side of the
/// connection. `server_side` selects which of the RFC 4253 Section 7.2
/// letters feed each direction: the server writes B/D/F and reads A/C/E,
/// the client the reverse.
pub(crate) fn derive_direction_keys(
    suite: &NegotiatedAlgorithms,
    hash: crate::ssh::kex_dh::KexHash,
    exchange_hash: &[u8],
    shared_secret: &[u8],
    session_id: &[u8],
    server_side: bool,
) -> KeelResult<(DirectionKeys, DirectionKeys)> {
    let registry = CipherRegistry::builtin();
    let derive = |letter: u8, len: usize| {
        derive_key(hash, shared_secret, exchange_hash, session_id, letter, len)
    };

    let (cipher_out_name, cipher_in_name, mac_out_name, mac_in_name, comp_out, comp_in) =
        if server_side {
            (
                &suite.cipher_s2c,
                &suite.cipher_c2s,
                &suite.mac_s2c,
                &suite.mac_c2s,
                &suite.compression_s2c,
                &suite.compression_c2s,
            )
        } else {
            (
                &suite.cipher_c2s,
                &suite.cipher_s2c,
                &suite.mac_c2s,
                &suite.mac_s2c,
                &suite.compression_c2s,
                &suite.compression_s2c,
            )
        };

    let factory_out = registry.get(cipher_out_name).ok_or_else(|| {
        KeelError::Protocol(format!("Negotiated unknown cipher {}", cipher_out_name))
    })?;
    let factory_in = registry.get(cipher_in_name).ok_or_else(|| {
        KeelError::Protocol(format!("Negotiated unknown cipher {}", cipher_in_name))
    })?;

    // Letters: IVs A (c2s) / B (s2c), keys C / D, MACs E / F.
    let (iv_out_letter, iv_in_letter, key_out_letter, key_in_letter, mac_out_letter, mac_in_letter) =
        if server_side {
            (b'B', b'A', b'D', b'C', b'F', b'E')
        } else {
            (b'A', b'B', b'C', b'D', b'E', b'F')
        };

    let iv_out = derive(iv_out_letter, factory_out.iv_len());
    let iv_in = derive(iv_in_letter, factory_in.iv_len());
    let key_out = derive(key_out_letter, factory_out.key_len());
    let key_in = derive(key_in_letter, factory_in.key_len());
    let mac_key_out = derive(mac_out_letter, 64);
    let mac_key_in = derive(mac_in_letter, 64);

    let outbound = DirectionKeys {
        cipher: factory_out.create(&key_out, &iv_out, CipherDirection::Encrypt)?,
        mac: PacketMac::new(mac_out_name, &mac_key_out)?,
        compression: Compression::from_name(comp_out)?,
    };
    let inbound = DirectionKeys {
        cipher: factory_in.create(&key_in, &iv_in, CipherDirection::Decrypt)?,
        mac: PacketMac::new(mac_in_name, &mac_key_in)?,
        compression: Compression::from_name(comp_in)?,
    };
    Ok((outbound, inbound))
}

/// Subsystem factory running the built-in SFTP engine.
pub struct SftpSubsystemFactory {
    config: SftpConfig,
}

impl SftpSubsystemFactory {
    /// Creates the factory.
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }
}

impl SubsystemFactory for SftpSubsystemFactory {
    fn name(&self) -> &str {
        "sftp"
    }

    fn spawn(
        &self,
        stdin: ChannelStdin,
        writer: ChannelWriter,
        fault: Completion<String>,
    ) -> KeelResult<JoinHandle<()>> {
        let subsystem = SftpSubsystem::new(self.config.clone(), writer);
        Ok(tokio::spawn(async move {
            match subsystem.run(stdin).await {
                Ok(()) => debug!("SFTP subsystem finished"),
                Err(KeelError::Protocol(msg)) => {
                    // The protocol contract demands a session disconnect.
                    warn!(reason = %msg, "SFTP subsystem fault");
                    fault.set(msg);
                }
                Err(e) => debug!(error = %e, "SFTP subsystem ended"),
            }
        }))
    }
}

/// SSH server.
pub struct SshServer {
    listener: TcpListener,
    config: Config,
    key_provider: Arc<dyn KeyProvider>,
    password_auth: Option<Arc<dyn PasswordAuthenticator>>,
    publickey_auth: Option<Arc<dyn PublickeyAuthenticator>>,
    interactive_auth: Option<Arc<dyn InteractiveChallenger>>,
    command_factory: Option<Arc<dyn CommandFactory>>,
    forwarding: Arc<dyn ForwardingFilter>,
    extra_subsystems: Vec<Arc<dyn SubsystemFactory>>,
    banner: Option<String>,
}

impl SshServer {
    /// Binds with the default configuration and a fresh Ed25519 host key.
    /// Production servers load persistent keys through
    /// [`bind_with_config`](Self::bind_with_config).
    pub async fn bind(addr: &str) -> KeelResult<Self> {
        let provider = Arc::new(StaticKeyProvider::ephemeral()?);
        Self::bind_with_config(addr, Config::default(), provider).await
    }

    /// Binds with explicit configuration and key provider.
    pub async fn bind_with_config(
        addr: &str,
        config: Config,
        key_provider: Arc<dyn KeyProvider>,
    ) -> KeelResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| KeelError::Config(format!("Invalid bind address: {}", e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(KeelError::Io)?;

        if let Some(reuseaddr) = config.socket.reuseaddr {
            socket.set_reuseaddr(reuseaddr).map_err(KeelError::Io)?;
        }
        if let Some(keepalive) = config.socket.keepalive {
            socket.set_keepalive(keepalive).map_err(KeelError::Io)?;
        }
        if let Some(size) = config.socket.recv_buffer {
            socket.set_recv_buffer_size(size).map_err(KeelError::Io)?;
        }
        if let Some(size) = config.socket.send_buffer {
            socket.set_send_buffer_size(size).map_err(KeelError::Io)?;
        }

        socket.bind(addr).map_err(KeelError::Io)?;
        let listener = socket.listen(128).map_err(KeelError::Io)?;

        Ok(Self {
            listener,
            config,
            key_provider,
            password_auth: None,
            publickey_auth: None,
            interactive_auth: None,
            command_factory: None,
            forwarding: Arc::new(AcceptAllForwarding),
            extra_subsystems: Vec::new(),
            banner: None,
        })
    }

    /// Sets the password authenticator.
    pub fn set_password_authenticator(&mut self, auth: Arc<dyn PasswordAuthenticator>) {
        self.password_auth = Some(auth);
    }

    /// Sets the public-key authenticator.
    pub fn set_publickey_authenticator(&mut self, auth: Arc<dyn PublickeyAuthenticator>) {
        self.publickey_auth = Some(auth);
    }

    /// Sets the keyboard-interactive challenger.
    pub fn set_interactive_challenger(&mut self, auth: Arc<dyn InteractiveChallenger>) {
        self.interactive_auth = Some(auth);
    }

    /// Sets the command factory for shell/exec requests.
    pub fn set_command_factory(&mut self, factory: Arc<dyn CommandFactory>) {
        self.command_factory = Some(factory);
    }

    /// Sets the port-forwarding policy filter.
    pub fn set_forwarding_filter(&mut self, filter: Arc<dyn ForwardingFilter>) {
        self.forwarding = filter;
    }

    /// Registers an additional subsystem factory.
    pub fn register_subsystem(&mut self, factory: Arc<dyn SubsystemFactory>) {
        self.extra_subsystems.push(factory);
    }

    /// Sets the pre-authentication banner text.
    pub fn set_banner(&mut self, banner: &str) {
        self.banner = Some(banner.to_string());
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one client: banner exchange and initial key exchange are
    /// performed before the session is returned.
    pub async fn accept(&self) -> KeelResult<SshSession> {
        let (stream, peer_addr) = self.listener.accept().await.map_err(KeelError::Io)?;

        if let Some(nodelay) = self.config.socket.nodelay {
            stream.set_nodelay(nodelay).map_err(KeelError::Io)?;
        }
        if let Some(linger) = self.config.socket.linger {
            stream
                .set_linger(Some(std::time::Duration::from_secs(linger)))
                .map_err(KeelError::Io)?;
        }

        info!(peer = %peer_addr, "connection accepted");
        SshSession::setup(
            stream,
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.key_provider),
            self.password_auth.clone(),
            self.publickey_auth.clone(),
            self.interactive_auth.clone(),
            self.command_factory.clone(),
            Arc::clone(&self.forwarding),
            self.extra_subsystems.clone(),
            self.banner.clone(),
        )
        .await
    }
}

/// One server-side SSH session.
pub struct SshSession {
    reader: OwnedReadHalf,
    decoder: PacketDecoder,
    sender: Arc<PacketSender>,
    transport: TransportState,
    config: Config,
    key_provider: Arc<dyn KeyProvider>,
    password_auth: Option<Arc<dyn PasswordAuthenticator>>,
    publickey_auth: Option<Arc<dyn PublickeyAuthenticator>>,
    interactive_auth: Option<Arc<dyn InteractiveChallenger>>,
    command_factory: Option<Arc<dyn CommandFactory>>,
    forwarding: Arc<dyn ForwardingFilter>,
    extra_subsystems: Vec<Arc<dyn SubsystemFactory>>,
    banner: Option<String>,
    peer_addr: SocketAddr,
    client_version: String,
    server_version: String,
    session_id: Vec<u8>,
    username: Option<String>,
}

impl SshSession {
    #[allow(clippy::too_many_arguments)]
    async fn setup(
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: Config,
        key_provider: Arc<dyn KeyProvider>,
        password_auth: Option<Arc<dyn PasswordAuthenticator>>,
        publickey_auth: Option<Arc<dyn PublickeyAuthenticator>>,
        interactive_auth: Option<Arc<dyn InteractiveChallenger>>,
        command_factory: Option<Arc<dyn CommandFactory>>,
        forwarding: Arc<dyn ForwardingFilter>,
        extra_subsystems: Vec<Arc<dyn SubsystemFactory>>,
        banner: Option<String>,
    ) -> KeelResult<Self> {
        let (mut reader, mut write_half) = stream.into_split();

        let mut transport_config = TransportConfig::new(false);
        transport_config.version = Version::new(&config.server_ident, None);
        transport_config.rekey_bytes_limit = config.rekey_bytes_limit;
        transport_config.rekey_time_limit = config.rekey_time_limit;
        transport_config.kex_init = KexInit::new_default()
            .with_host_key_algorithms(key_provider.key_types());

        // Banner exchange: our line out, peer banner in (discarding any
        // pre-banner lines).
        let server_version = transport_config.version.to_string();
        write_half
            .write_all(transport_config.version.banner_line().as_bytes())
            .await
            .map_err(KeelError::Io)?;

        let peer_version = Version::exchange(&mut reader).await?;
        let client_version = peer_version.to_string();
        debug!(peer = %client_version, "banner exchanged");

        let mut transport = TransportState::new(transport_config);
        transport.set_peer_version(peer_version);
        transport.transition(State::Kex)?;

        let sender = Arc::new(PacketSender::new(write_half));

        let mut session = Self {
            reader,
            decoder: PacketDecoder::new(),
            sender,
            transport,
            config,
            key_provider,
            password_auth,
            publickey_auth,
            interactive_auth,
            command_factory,
            forwarding,
            extra_subsystems,
            banner,
            peer_addr,
            client_version,
            server_version,
            session_id: Vec::new(),
            username: None,
        };

        let deferred = session.kex_round(None).await?;
        if !deferred.is_empty() {
            return Err(KeelError::Protocol(
                "Channel data before the first key exchange completed".to_string(),
            ));
        }
        Ok(session)
    }

    /// Peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Session id (first exchange hash), immutable for the session.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Authenticated user name, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether authentication completed.
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    async fn disconnect(&self, reason: DisconnectReason, description: &str) {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(reason as u32);
        buf.put_str(description);
        buf.put_str("");
        let _ = self.sender.send_now(buf.into_bytes()).await;
    }

    /// Runs one key exchange (initial or rekey). `peer_kexinit` carries
    /// the payload when the peer initiated. Channel messages received
    /// while the exchange runs are returned for later dispatch.
    async fn kex_round(
        &mut self,
        peer_kexinit: Option<Vec<u8>>,
    ) -> KeelResult<Vec<Vec<u8>>> {
        if self.transport.current() != State::Kex {
            self.transport.transition(State::Kex)?;
        }
        self.sender.set_hold(true).await?;

        let mut deferred = Vec::new();

        let our_kexinit = KexInit::new_default()
            .with_host_key_algorithms(self.key_provider.key_types());
        let server_kexinit_payload = our_kexinit.to_bytes();
        self.sender.send_now(server_kexinit_payload.clone()).await?;

        let client_kexinit_payload = match peer_kexinit {
            Some(payload) => payload,
            None => {
                self.read_kex_packet(MessageType::KexInit as u8, &mut deferred)
                    .await?
            }
        };
        let client_kexinit = KexInit::from_bytes(&client_kexinit_payload)?;
        self.transport.set_peer_kex_init(client_kexinit.clone());

        let suite = match NegotiatedAlgorithms::negotiate(&our_kexinit, &client_kexinit) {
            Ok(suite) => suite,
            Err(e) => {
                self.disconnect(DisconnectReason::KeyExchangeFailed, &e.to_string())
                    .await;
                return Err(e);
            }
        };
        debug!(kex = %suite.kex, cipher = %suite.cipher_c2s, "algorithms negotiated");

        let algorithm = KexAlgorithm::from_name(&suite.kex).ok_or_else(|| {
            KeelError::Protocol(format!("Negotiated unknown KEX: {}", suite.kex))
        })?;
        let host_key = self.key_provider.load_key(&suite.host_key).ok_or_else(|| {
            KeelError::Protocol(format!("No host key for {}", suite.host_key))
        })?;
        let host_key_blob = host_key.public_key_blob();

        let client_version = self.client_version.clone();
        let server_version = self.server_version.clone();
        let hash_input = ExchangeHashInput {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &client_kexinit_payload,
            server_kexinit: &server_kexinit_payload,
            host_key_blob: &host_key_blob,
        };

        let (exchange_hash, shared_secret) = self
            .run_exchange(algorithm, &suite.host_key, host_key.as_ref(), &hash_input, &mut deferred)
            .await?;

        if self.session_id.is_empty() {
            self.session_id = exchange_hash.clone();
        }

        let (outbound, inbound) = derive_direction_keys(
            &suite,
            algorithm.hash(),
            &exchange_hash,
            &shared_secret,
            &self.session_id,
            true,
        )?;

        // NEWKEYS goes out and the new outbound keys are installed in
        // one critical section; inbound keys switch once the peer's
        // NEWKEYS arrives. Channel data may still arrive in between,
        // framed under the old inbound keys.
        self.transport.transition(State::NewKeys)?;
        self.sender
            .send_newkeys_and_install(outbound.cipher, Some(outbound.mac), outbound.compression)
            .await?;
        self.read_kex_packet(MessageType::NewKeys as u8, &mut deferred)
            .await?;
        self.decoder
            .install(inbound.cipher, Some(inbound.mac), inbound.compression);

        let next = if self.transport.initial_kex_done() {
            self.transport.resume_state()
        } else {
            State::ServiceRequest
        };
        self.transport.transition(next)?;
        self.sender.set_hold(false).await?;

        Ok(deferred)
    }

    /// Reads packets until `expected` arrives, deferring channel traffic
    /// and skipping IGNORE/DEBUG.
    async fn read_kex_packet(
        &mut self,
        expected: u8,
        deferred: &mut Vec<Vec<u8>>,
    ) -> KeelResult<Vec<u8>> {
        loop {
            let payload = self.decoder.read_packet(&mut self.reader).await?;
            match payload.first().copied() {
                Some(t) if t == expected => return Ok(payload),
                Some(t)
                    if t == MessageType::Ignore as u8 || t == MessageType::Debug as u8 =>
                {
                    continue
                }
                Some(t) if is_channel_message(t) => deferred.push(payload),
                Some(t) if t == MessageType::Disconnect as u8 => {
                    return Err(KeelError::Protocol(
                        "Peer disconnected during key exchange".to_string(),
                    ));
                }
                other => {
                    return Err(KeelError::Protocol(format!(
                        "Unexpected message {:?} during key exchange (wanted {})",
                        other, expected
                    )));
                }
            }
        }
    }

    async fn run_exchange(
        &mut self,
        algorithm: KexAlgorithm,
        signature_algorithm: &str,
        host_key: &dyn HostKey,
        hash_input: &ExchangeHashInput<'_>,
        deferred: &mut Vec<Vec<u8>>,
    ) -> KeelResult<(Vec<u8>, Vec<u8>)> {
        let hash = algorithm.hash();

        if algorithm.is_group_exchange() {
            // RFC 4419: GEX_REQUEST -> GEX_GROUP -> GEX_INIT -> GEX_REPLY
            let request = self.read_kex_packet(gex::REQUEST, deferred).await?;
            let mut buf = Buffer::from(&request[1..]);
            let min = buf.get_u32()?;
            let preferred = buf.get_u32()?;
            let max = buf.get_u32()?;
            let group = choose_gex_group(min, preferred, max)?;

            let p = group.p.to_bytes_be();
            let mut group_msg = Buffer::new();
            group_msg.put_u8(gex::GROUP);
            group_msg.put_mpint(&p);
            group_msg.put_mpint(&[group.g as u8]);
            self.sender.send_now(group_msg.into_bytes()).await?;

            let init = self.read_kex_packet(gex::INIT, deferred).await?;
            let mut buf = Buffer::from(&init[1..]);
            let e = buf.get_mpint()?;

            let exchange = ModpExchange::new(group);
            let f = exchange.public_key().to_vec();
            let shared_secret = exchange.compute_shared_secret(&e)?;

            let exchange_hash = exchange_hash_gex(
                hash,
                hash_input,
                min,
                preferred,
                max,
                &p,
                &[group.g as u8],
                &e,
                &f,
                &shared_secret,
            );
            let signature = host_key.sign(signature_algorithm, &exchange_hash)?;

            let mut reply = Buffer::new();
            reply.put_u8(gex::REPLY);
            reply.put_string(hash_input.host_key_blob);
            reply.put_mpint(&f);
            reply.put_string(&signature);
            self.sender.send_now(reply.into_bytes()).await?;

            return Ok((exchange_hash, shared_secret));
        }

        let init = self
            .read_kex_packet(MessageType::KexdhInit as u8, deferred)
            .await?;
        let mut buf = Buffer::from(&init[1..]);

        let (exchange_hash, shared_secret, server_value, uses_mpint) = match algorithm {
            KexAlgorithm::Curve25519 => {
                let client_public = buf.get_string()?;
                let exchange = Curve25519Exchange::new()?;
                let server_public = exchange.public_key().to_vec();
                let shared = exchange.compute_shared_secret(&client_public)?;
                let h = exchange_hash_ecdh(
                    hash,
                    hash_input,
                    &client_public,
                    &server_public,
                    &shared,
                );
                (h, shared, server_public, false)
            }
            KexAlgorithm::EcdhP256 | KexAlgorithm::EcdhP384 | KexAlgorithm::EcdhP521 => {
                let client_public = buf.get_string()?;
                let exchange = EcdhExchange::new(algorithm)?;
                let server_public = exchange.public_key();
                let shared = exchange.compute_shared_secret(&client_public)?;
                let h = exchange_hash_ecdh(
                    hash,
                    hash_input,
                    &client_public,
                    &server_public,
                    &shared,
                );
                (h, shared, server_public, false)
            }
            KexAlgorithm::Group14Sha1 | KexAlgorithm::Group14Sha256 => {
                let e = buf.get_mpint()?;
                let exchange = ModpExchange::new(&crate::ssh::kex_dh::GROUP14);
                let f = exchange.public_key().to_vec();
                let shared = exchange.compute_shared_secret(&e)?;
                let h = exchange_hash_dh(hash, hash_input, &e, &f, &shared);
                (h, shared, f, true)
            }
            KexAlgorithm::GroupExchangeSha256 => unreachable!("handled above"),
        };

        let signature = host_key.sign(signature_algorithm, &exchange_hash)?;

        let mut reply = Buffer::new();
        reply.put_u8(MessageType::KexdhReply as u8);
        reply.put_string(hash_input.host_key_blob);
        if uses_mpint {
            reply.put_mpint(&server_value);
        } else {
            reply.put_string(&server_value);
        }
        reply.put_string(&signature);
        self.sender.send_now(reply.into_bytes()).await?;

        Ok((exchange_hash, shared_secret))
    }

    /// Drives the authentication service until success.
    ///
    /// # Errors
    ///
    /// Fails when the auth timeout elapses, the attempt budget is
    /// exhausted (the client is disconnected first) or the transport
    /// breaks.
    pub async fn authenticate(&mut self) -> KeelResult<String> {
        let deadline = tokio::time::Instant::now() + self.config.auth_timeout;
        let mut service: Option<UserAuthService> = None;

        loop {
            let payload = tokio::time::timeout_at(
                deadline,
                self.decoder.read_packet(&mut self.reader),
            )
            .await
            .map_err(|_| {
                KeelError::Timeout("Authentication not completed in time".to_string())
            })??;

            let Some(msg_type) = payload.first().copied() else {
                continue;
            };

            match MessageType::from_u8(msg_type) {
                Some(MessageType::ServiceRequest) => {
                    let mut buf = Buffer::from(&payload[1..]);
                    let name = buf.get_string_utf8()?;
                    if !self.transport.service_permitted(&name) {
                        self.disconnect(
                            DisconnectReason::ServiceNotAvailable,
                            &format!("Service '{}' not available", name),
                        )
                        .await;
                        return Err(KeelError::Protocol(format!(
                            "Service '{}' requested before it is permitted",
                            name
                        )));
                    }

                    let mut accept = Buffer::new();
                    accept.put_u8(MessageType::ServiceAccept as u8);
                    accept.put_str(&name);
                    self.sender.send_now(accept.into_bytes()).await?;
                    self.transport.transition(State::Userauth)?;

                    if let Some(banner) = &self.banner {
                        self.sender
                            .send_now(AuthBanner::new(banner).to_bytes())
                            .await?;
                    }

                    service = Some(UserAuthService::new(
                        self.session_id.clone(),
                        self.config.max_auth_attempts,
                        self.password_auth.clone(),
                        self.publickey_auth.clone(),
                        self.interactive_auth.clone(),
                    ));
                }
                Some(MessageType::UserauthRequest)
                | Some(MessageType::UserauthInfoResponse) => {
                    let Some(service) = service.as_mut() else {
                        self.disconnect(
                            DisconnectReason::ProtocolError,
                            "Authentication before service request",
                        )
                        .await;
                        return Err(KeelError::Protocol(
                            "USERAUTH_REQUEST before SERVICE_REQUEST".to_string(),
                        ));
                    };

                    match service.handle_message(&payload).await? {
                        AuthOutcome::Success { username } => {
                            self.sender.send_now(AuthSuccess.to_bytes()).await?;
                            self.sender.activate_compression().await;
                            self.decoder.activate_compression();
                            self.transport.transition(State::Connection)?;
                            self.username = Some(username.clone());
                            info!(user = %username, peer = %self.peer_addr, "authenticated");
                            return Ok(username);
                        }
                        AuthOutcome::Failure { methods, partial } => {
                            self.sender
                                .send_now(AuthFailure::new(methods, partial).to_bytes())
                                .await?;
                        }
                        AuthOutcome::Continue(reply) => {
                            self.sender.send_now(reply).await?;
                        }
                        AuthOutcome::Disconnect(reason) => {
                            self.disconnect(reason, "Too many authentication failures")
                                .await;
                            return Err(KeelError::Auth(
                                "Authentication attempt budget exhausted".to_string(),
                            ));
                        }
                    }
                }
                Some(MessageType::Ignore) | Some(MessageType::Debug) => continue,
                Some(MessageType::Disconnect) => {
                    return Err(KeelError::Protocol(
                        "Client disconnected during authentication".to_string(),
                    ));
                }
                Some(MessageType::KexInit) => {
                    let deferred = self.kex_round(Some(payload)).await?;
                    if !deferred.is_empty() {
                        return Err(KeelError::Protocol(
                            "Channel data before authentication".to_string(),
                        ));
                    }
                }
                other => {
                    debug!(message = ?other, "ignoring message during authentication");
                }
            }
        }
    }

    /// Runs the connection service until the session ends.
    pub async fn run(mut self) -> KeelResult<()> {
        if !self.is_authenticated() {
            return Err(KeelError::Auth(
                "Session must authenticate before the connection service".to_string(),
            ));
        }

        let sink: Arc<dyn PacketSink> = self.sender.clone();
        let mut mux = ConnectionService::new(
            sink,
            self.config.window_size,
            self.config.packet_size,
            self.command_factory.clone(),
            Arc::clone(&self.forwarding),
        );
        mux.register_subsystem(Arc::new(SftpSubsystemFactory::new(
            self.config.sftp.clone(),
        )));
        for subsystem in &self.extra_subsystems {
            mux.register_subsystem(Arc::clone(subsystem));
        }

        let mut accept_rx = mux
            .take_accept_receiver()
            .expect("fresh service retains its accept receiver");
        let fault = mux.fault().clone();
        let idle = self.config.idle_timeout;

        let result = loop {
            let idle_sleep = tokio::time::sleep(if idle.is_zero() {
                std::time::Duration::from_secs(86400 * 365)
            } else {
                idle
            });

            tokio::select! {
                payload = self.decoder.read_packet(&mut self.reader) => {
                    let payload = match payload {
                        Ok(payload) => payload,
                        Err(KeelError::Io(e))
                            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            debug!(peer = %self.peer_addr, "peer closed the connection");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    };
                    match self.dispatch(&mut mux, payload).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                accepted = accept_rx.recv() => {
                    if let Some(accepted) = accepted {
                        let originator = accepted.originator;
                        if let Err(e) = mux
                            .open_forwarded(
                                &accepted.address,
                                accepted.port,
                                originator,
                                accepted.stream,
                            )
                            .await
                        {
                            warn!(error = %e, "failed to open forwarded channel");
                        }
                    }
                }
                reason = fault.wait() => {
                    let reason = reason.unwrap_or_else(|e| e.to_string());
                    warn!(reason = %reason, "subsystem requested disconnect");
                    self.disconnect(DisconnectReason::ProtocolError, &reason).await;
                    break Ok(());
                }
                _ = idle_sleep => {
                    info!(peer = %self.peer_addr, "idle timeout");
                    self.disconnect(DisconnectReason::ByApplication, "Idle timeout").await;
                    break Ok(());
                }
            }

            // Byte- or time-triggered rekey.
            let outbound = self.sender.bytes_since_kex().await;
            if self.transport.needs_rekey(outbound) {
                debug!(outbound, "initiating rekey");
                match self.kex_round(None).await {
                    Ok(deferred) => {
                        for payload in deferred {
                            if let Err(e) = self.dispatch_channel(&mut mux, &payload).await {
                                error!(error = %e, "deferred dispatch failed");
                            }
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        };

        mux.teardown().await;
        if let Err(e) = &result {
            error!(peer = %self.peer_addr, error = %e, "session failed");
            self.disconnect(DisconnectReason::ProtocolError, &e.to_string())
                .await;
        }
        result
    }

    async fn dispatch_channel(
        &mut self,
        mux: &mut ConnectionService,
        payload: &[u8],
    ) -> KeelResult<()> {
        match mux.handle_message(payload).await {
            Ok(()) => Ok(()),
            Err(KeelError::Channel(msg)) => {
                // Channel-level problems stay channel-level.
                debug!(reason = %msg, "channel error");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns Ok(false) when the session should end.
    async fn dispatch(
        &mut self,
        mux: &mut ConnectionService,
        payload: Vec<u8>,
    ) -> KeelResult<bool> {
        let Some(msg_type) = payload.first().copied() else {
            return Ok(true);
        };

        if is_channel_message(msg_type) || msg_type == MessageType::GlobalRequest as u8 {
            self.dispatch_channel(mux, &payload).await?;
            return Ok(true);
        }

        match MessageType::from_u8(msg_type) {
            Some(MessageType::KexInit) => {
                let deferred = self.kex_round(Some(payload)).await?;
                for payload in deferred {
                    self.dispatch_channel(mux, &payload).await?;
                }
                Ok(true)
            }
            Some(MessageType::Disconnect) => {
                debug!(peer = %self.peer_addr, "client disconnected");
                Ok(false)
            }
            Some(MessageType::Ignore) | Some(MessageType::Debug) => Ok(true),
            Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => Ok(true),
            Some(MessageType::Unimplemented) => Ok(true),
            other => {
                debug!(message = ?other, "ignoring unexpected message");
                Ok(true)
            }
        }
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("peer", &self.peer_addr)
            .field("state", &self.transport.current())
            .field("user", &self.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_channel_message() {
        assert!(is_channel_message(MessageType::ChannelOpen as u8));
        assert!(is_channel_message(MessageType::ChannelData as u8));
        assert!(is_channel_message(MessageType::ChannelFailure as u8));
        assert!(!is_channel_message(MessageType::GlobalRequest as u8));
        assert!(!is_channel_message(MessageType::KexInit as u8));
        assert!(!is_channel_message(MessageType::Disconnect as u8));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = SshServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_bind_with_socket_options() {
        let mut config = Config::default();
        config.apply("socket-keepalive=true").unwrap();
        config.apply("socket-rcvbuf=4096").unwrap();
        config.apply("socket-sndbuf=4096").unwrap();
        config.apply("socket-reuseaddr=true").unwrap();
        config.apply("tcp-nodelay=true").unwrap();
        config.apply("socket-linger=5").unwrap();

        let provider = Arc::new(StaticKeyProvider::ephemeral().unwrap());
        let server = SshServer::bind_with_config("127.0.0.1:0", config, provider)
            .await
            .unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(SshServer::bind("not-an-address").await.is_err());
    }
}
