//! SSH client for round-trip testing of the server.
//!
//! Deliberately narrow: enough protocol to exercise every server path
//! the test suite cares about — connect (banner + curve25519 key
//! exchange), password and public-key authentication, session channels
//! (shell/exec/subsystem), SFTP, direct-tcpip opens, remote forwards and
//! SOCKS5 dynamic forwarding. Not a general-purpose client.
//!
//! After authentication a dispatcher task owns the inbound half of the
//! connection and routes channel messages by local id; it also serves
//! server-initiated rekeys, so channel traffic survives a KEXINIT
//! mid-stream.

use crate::ssh::auth::{
    AuthFailure, AuthMethod, AuthRequest, InteractiveChallenge, InteractiveResponse,
};
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{
    ChannelCore, ChannelEvent, ChannelState, ChannelStdin, ChannelVariant, ChannelWriter,
    PacketSink,
};
use crate::ssh::connection::{
    ChannelClose, ChannelEof, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust, GlobalRequest,
    GlobalRequestType, RequestSuccess,
};
use crate::ssh::forwarding::{DirectTcpipOpener, DynamicForward};
use crate::ssh::hostkey::{verify_signature, HostKey};
use crate::ssh::kex::{KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{exchange_hash_ecdh, Curve25519Exchange, ExchangeHashInput};
use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketDecoder;
use crate::ssh::server::{derive_direction_keys, PacketSender};
use crate::ssh::sftp::SftpClient;
use crate::ssh::version::Version;
use crate::ssh::window::Window;
use keel_platform::{KeelError, KeelResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    /// Identification banner software name.
    pub client_ident: String,
    /// Initial window advertised on opened channels.
    pub window_size: u32,
    /// Maximum packet advertised on opened channels.
    pub packet_size: u32,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            client_ident: format!("Keel_{}", env!("CARGO_PKG_VERSION")),
            window_size: 2 * 1024 * 1024,
            packet_size: 32 * 1024,
        }
    }
}

struct OpenedChannel {
    core: Arc<ChannelCore>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

struct KexContext {
    client_version: String,
    server_version: String,
    session_id: Vec<u8>,
}

struct ClientShared {
    sender: Arc<PacketSender>,
    channels: Mutex<HashMap<u32, Arc<ChannelCore>>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<Result<OpenedChannel, u32>>>>,
    next_channel: AtomicU32,
    window_size: u32,
    packet_size: u32,
    global_tx: mpsc::UnboundedSender<Vec<u8>>,
    incoming_tx: mpsc::UnboundedSender<ClientChannel>,
}

impl ClientShared {
    async fn open_channel(&self, channel_type: ChannelType) -> KeelResult<ClientChannel> {
        let local_id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_opens
            .lock()
            .expect("pending opens poisoned")
            .insert(local_id, tx);

        let open = ChannelOpen::new(
            channel_type,
            local_id,
            self.window_size,
            self.packet_size,
        );
        self.sender.send(open.to_bytes()).await?;

        match rx.await {
            Ok(Ok(opened)) => {
                let max_packet = opened.core.remote_window().max_packet();
                let writer = ChannelWriter::new(
                    self.sender.clone(),
                    opened.core.clone(),
                    max_packet.max(1),
                );
                Ok(ClientChannel {
                    core: opened.core,
                    writer,
                    stdin: ChannelStdin::new(opened.events),
                })
            }
            Ok(Err(reason)) => Err(KeelError::Channel(format!(
                "Channel open refused: reason {}",
                reason
            ))),
            Err(_) => Err(KeelError::Channel(
                "Connection closed while opening channel".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl DirectTcpipOpener for ClientShared {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: SocketAddr,
    ) -> KeelResult<(ChannelWriter, ChannelStdin)> {
        let channel = self
            .open_channel(ChannelType::DirectTcpip {
                host: host.to_string(),
                port,
                originator_address: originator.ip().to_string(),
                originator_port: originator.port() as u32,
            })
            .await?;
        Ok((channel.writer, channel.stdin))
    }
}

/// One open channel from the client's point of view.
pub struct ClientChannel {
    core: Arc<ChannelCore>,
    writer: ChannelWriter,
    stdin: ChannelStdin,
}

impl ClientChannel {
    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.core.local_id()
    }

    /// The window for data the server sends us.
    pub fn local_window(&self) -> &Arc<Window> {
        self.core.local_window()
    }

    /// The window for data we send the server.
    pub fn remote_window(&self) -> &Arc<Window> {
        self.core.remote_window()
    }

    async fn request(&mut self, request_type: ChannelRequestType) -> KeelResult<()> {
        let request = ChannelRequest::new(self.core.remote_id(), request_type, true);
        self.stdin_request(request).await
    }

    async fn stdin_request(&mut self, request: ChannelRequest) -> KeelResult<()> {
        let name = request.request_type().name().to_string();
        self.sink().send(request.to_bytes()).await?;

        loop {
            match self.stdin.recv_event().await {
                Some(ChannelEvent::RequestSuccess) => return Ok(()),
                Some(ChannelEvent::RequestFailure) => {
                    return Err(KeelError::Channel(format!(
                        "Channel request '{}' refused",
                        name
                    )))
                }
                Some(ChannelEvent::Data(data)) => {
                    // Data racing the reply is kept for later reads.
                    self.stdin.push_back(data);
                }
                Some(_) => continue,
                None => {
                    return Err(KeelError::Channel(
                        "Channel closed before request reply".to_string(),
                    ))
                }
            }
        }
    }

    fn sink(&self) -> Arc<dyn PacketSink> {
        self.writer.clone_sink()
    }

    /// Requests an interactive shell.
    pub async fn request_shell(&mut self) -> KeelResult<()> {
        self.request(ChannelRequestType::Shell).await
    }

    /// Requests command execution.
    pub async fn exec(&mut self, command: &str) -> KeelResult<()> {
        self.request(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Requests a named subsystem.
    pub async fn request_subsystem(&mut self, name: &str) -> KeelResult<()> {
        self.request(ChannelRequestType::Subsystem {
            name: name.to_string(),
        })
        .await
    }

    /// Writes channel data, waiting on window credit.
    pub async fn write(&self, data: &[u8]) -> KeelResult<()> {
        self.writer.write(data).await
    }

    /// Reads the next data payload; `None` at EOF/close.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.stdin.recv().await
    }

    /// Sends EOF (at most once).
    pub async fn send_eof(&self) -> KeelResult<()> {
        self.writer.send_eof().await
    }

    /// Initiates a close; no I/O when already closing or closed.
    pub async fn close(&self) -> KeelResult<()> {
        if matches!(
            self.core.state(),
            ChannelState::Closing | ChannelState::Closed
        ) {
            return Ok(());
        }
        self.core.set_state(ChannelState::Closing);
        if self.core.mark_close_sent() {
            self.sink()
                .send(ChannelClose::new(self.core.remote_id()).to_bytes())
                .await?;
        }
        Ok(())
    }

    /// Consumes the channel, starting an SFTP client on it. The caller
    /// must have requested the "sftp" subsystem first.
    pub fn into_sftp(self) -> SftpClient {
        SftpClient::new(self.writer, self.stdin)
    }

    /// Close future for this channel.
    pub fn close_future(&self) -> &keel_platform::CloseFuture {
        self.core.close_future()
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("local_id", &self.core.local_id())
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

/// SSH client.
pub struct SshClient {
    shared: Arc<ClientShared>,
    config: SshClientConfig,
    /// Owned until the dispatcher starts.
    io: Option<(OwnedReadHalf, PacketDecoder)>,
    kex_ctx: Arc<KexContext>,
    server_address: String,
    server_host_key: Vec<u8>,
    username: Option<String>,
    service_requested: bool,
    global_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    incoming_rx: mpsc::UnboundedReceiver<ClientChannel>,
    dynamic: Option<DynamicForward>,
}

impl SshClient {
    /// Connects with the default configuration.
    pub async fn connect(addr: &str) -> KeelResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default()).await
    }

    /// Connects, exchanges banners and runs the initial key exchange.
    pub async fn connect_with_config(
        addr: &str,
        config: SshClientConfig,
    ) -> KeelResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(KeelError::Io)?;
        let (mut reader, mut write_half) = stream.into_split();

        let our_version = Version::new(&config.client_ident, None);
        let client_version = our_version.to_string();
        write_half
            .write_all(our_version.banner_line().as_bytes())
            .await
            .map_err(KeelError::Io)?;
        let server_version = Version::exchange(&mut reader).await?.to_string();

        let sender = Arc::new(PacketSender::new(write_half));
        let mut decoder = PacketDecoder::new();

        // KEXINIT both ways.
        let our_kexinit = KexInit::new_default();
        let client_kexinit_payload = our_kexinit.to_bytes();
        sender.send_now(client_kexinit_payload.clone()).await?;

        let server_kexinit_payload = loop {
            let payload = decoder.read_packet(&mut reader).await?;
            match payload.first().copied() {
                Some(t) if t == MessageType::KexInit as u8 => break payload,
                Some(t)
                    if t == MessageType::Ignore as u8 || t == MessageType::Debug as u8 =>
                {
                    continue
                }
                other => {
                    return Err(KeelError::Protocol(format!(
                        "Expected KEXINIT, got {:?}",
                        other
                    )))
                }
            }
        };
        let server_kexinit = KexInit::from_bytes(&server_kexinit_payload)?;
        let suite = NegotiatedAlgorithms::negotiate(&server_kexinit, &our_kexinit)?;

        if !suite.kex.starts_with("curve25519-sha256") {
            return Err(KeelError::Protocol(format!(
                "This client only speaks curve25519, negotiated {}",
                suite.kex
            )));
        }

        // ECDH with X25519.
        let exchange = Curve25519Exchange::new()?;
        let client_public = exchange.public_key().to_vec();
        let mut init = Buffer::new();
        init.put_u8(MessageType::KexdhInit as u8);
        init.put_string(&client_public);
        sender.send_now(init.into_bytes()).await?;

        let reply = decoder.read_packet(&mut reader).await?;
        if reply.first() != Some(&(MessageType::KexdhReply as u8)) {
            return Err(KeelError::Protocol(
                "Expected KEXDH_REPLY".to_string(),
            ));
        }
        let mut buf = Buffer::from(&reply[1..]);
        let host_key_blob = buf.get_string()?;
        let server_public = buf.get_string()?;
        let signature = buf.get_string()?;

        let shared_secret = exchange.compute_shared_secret(&server_public)?;
        let hash_input = ExchangeHashInput {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &client_kexinit_payload,
            server_kexinit: &server_kexinit_payload,
            host_key_blob: &host_key_blob,
        };
        let hash = crate::ssh::kex_dh::KexHash::Sha256;
        let exchange_hash =
            exchange_hash_ecdh(hash, &hash_input, &client_public, &server_public, &shared_secret);

        // Host key verification failure is fatal.
        if !verify_signature(&suite.host_key, &host_key_blob, &exchange_hash, &signature)
            .unwrap_or(false)
        {
            return Err(KeelError::Security(
                "Host key signature verification failed".to_string(),
            ));
        }

        let session_id = exchange_hash.clone();
        let (outbound, inbound) = derive_direction_keys(
            &suite,
            hash,
            &exchange_hash,
            &shared_secret,
            &session_id,
            false,
        )?;

        sender
            .send_newkeys_and_install(outbound.cipher, Some(outbound.mac), outbound.compression)
            .await?;
        let newkeys = decoder.read_packet(&mut reader).await?;
        NewKeys::from_bytes(&newkeys)?;
        decoder.install(inbound.cipher, Some(inbound.mac), inbound.compression);

        let (global_tx, global_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ClientShared {
            sender,
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            next_channel: AtomicU32::new(0),
            window_size: config.window_size,
            packet_size: config.packet_size,
            global_tx,
            incoming_tx,
        });

        Ok(Self {
            shared,
            config,
            io: Some((reader, decoder)),
            kex_ctx: Arc::new(KexContext {
                client_version,
                server_version,
                session_id,
            }),
            server_address: addr.to_string(),
            server_host_key: host_key_blob,
            username: None,
            service_requested: false,
            global_rx,
            incoming_rx,
            dynamic: None,
        })
    }

    /// The address this client connected to.
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// The server's host key blob.
    pub fn server_host_key(&self) -> &[u8] {
        &self.server_host_key
    }

    /// Session id (first exchange hash).
    pub fn session_id(&self) -> &[u8] {
        &self.kex_ctx.session_id
    }

    /// Authenticated user name, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    async fn read_auth_reply(&mut self) -> KeelResult<Vec<u8>> {
        let (reader, decoder) = self
            .io
            .as_mut()
            .ok_or_else(|| KeelError::Protocol("Dispatcher already running".to_string()))?;
        loop {
            let payload = decoder.read_packet(reader).await?;
            match payload.first().copied() {
                Some(t)
                    if t == MessageType::Ignore as u8
                        || t == MessageType::Debug as u8
                        || t == MessageType::UserauthBanner as u8 =>
                {
                    continue
                }
                _ => return Ok(payload),
            }
        }
    }

    async fn request_userauth_service(&mut self) -> KeelResult<()> {
        // The service is requested once; later auth attempts reuse it.
        if self.service_requested {
            return Ok(());
        }
        let mut request = Buffer::new();
        request.put_u8(MessageType::ServiceRequest as u8);
        request.put_str("ssh-userauth");
        self.shared.sender.send_now(request.into_bytes()).await?;

        let reply = self.read_auth_reply().await?;
        if reply.first() != Some(&(MessageType::ServiceAccept as u8)) {
            return Err(KeelError::Protocol(
                "Expected SERVICE_ACCEPT".to_string(),
            ));
        }
        self.service_requested = true;
        Ok(())
    }

    fn finish_auth(&mut self, username: &str) {
        self.username = Some(username.to_string());
        self.start_dispatcher();
    }

    /// Authenticates with a password.
    pub async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> KeelResult<()> {
        self.request_userauth_service().await?;

        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::Password(password.to_string()),
        );
        self.shared.sender.send_now(request.to_bytes()).await?;

        let reply = self.read_auth_reply().await?;
        match reply.first().copied() {
            Some(t) if t == MessageType::UserauthSuccess as u8 => {
                self.activate_compression().await;
                self.finish_auth(username);
                Ok(())
            }
            Some(t) if t == MessageType::UserauthFailure as u8 => {
                let failure = AuthFailure::from_bytes(&reply)?;
                Err(KeelError::Auth(format!(
                    "Password rejected; methods that can continue: {:?}",
                    failure.methods_can_continue()
                )))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected authentication reply: {:?}",
                other
            ))),
        }
    }

    /// Authenticates with a user key pair (probe, then signed request).
    pub async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: &dyn HostKey,
    ) -> KeelResult<()> {
        self.request_userauth_service().await?;

        let algorithm = key
            .signature_algorithms()
            .first()
            .copied()
            .ok_or_else(|| KeelError::Security("Key offers no algorithms".to_string()))?
            .to_string();
        let blob = key.public_key_blob();

        // Probe.
        let probe = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: algorithm.clone(),
                public_key: blob.clone(),
                signature: None,
            },
        );
        self.shared.sender.send_now(probe.to_bytes()).await?;

        let reply = self.read_auth_reply().await?;
        match reply.first().copied() {
            Some(t) if t == MessageType::UserauthPkOk as u8 => {}
            Some(t) if t == MessageType::UserauthFailure as u8 => {
                return Err(KeelError::Auth("Key not acceptable".to_string()));
            }
            other => {
                return Err(KeelError::Protocol(format!(
                    "Unexpected probe reply: {:?}",
                    other
                )))
            }
        }

        // Signed request.
        let signed_data = crate::ssh::auth::construct_signature_data(
            &self.kex_ctx.session_id,
            username,
            "ssh-connection",
            &algorithm,
            &blob,
        );
        let signature = key.sign(&algorithm, &signed_data)?;
        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm,
                public_key: blob,
                signature: Some(signature),
            },
        );
        self.shared.sender.send_now(request.to_bytes()).await?;

        let reply = self.read_auth_reply().await?;
        match reply.first().copied() {
            Some(t) if t == MessageType::UserauthSuccess as u8 => {
                self.activate_compression().await;
                self.finish_auth(username);
                Ok(())
            }
            Some(t) if t == MessageType::UserauthFailure as u8 => {
                Err(KeelError::Auth("Signature rejected".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected authentication reply: {:?}",
                other
            ))),
        }
    }

    /// Authenticates with keyboard-interactive via a response callback.
    pub async fn authenticate_interactive<F>(
        &mut self,
        username: &str,
        mut respond: F,
    ) -> KeelResult<()>
    where
        F: FnMut(&InteractiveChallenge) -> Vec<String>,
    {
        self.request_userauth_service().await?;

        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: String::new(),
            },
        );
        self.shared.sender.send_now(request.to_bytes()).await?;

        loop {
            let reply = self.read_auth_reply().await?;
            match reply.first().copied() {
                Some(t) if t == MessageType::UserauthSuccess as u8 => {
                    self.activate_compression().await;
                    self.finish_auth(username);
                    return Ok(());
                }
                Some(t) if t == MessageType::UserauthFailure as u8 => {
                    return Err(KeelError::Auth(
                        "Keyboard-interactive rejected".to_string(),
                    ));
                }
                Some(t) if t == MessageType::UserauthPkOk as u8 => {
                    // 60 is INFO_REQUEST within keyboard-interactive.
                    let challenge = InteractiveChallenge::from_bytes(&reply)?;
                    let responses = respond(&challenge);
                    let response = InteractiveResponse { responses };
                    self.shared.sender.send_now(response.to_bytes()).await?;
                }
                other => {
                    return Err(KeelError::Protocol(format!(
                        "Unexpected authentication reply: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn activate_compression(&mut self) {
        self.shared.sender.activate_compression().await;
        if let Some((_, decoder)) = self.io.as_mut() {
            decoder.activate_compression();
        }
    }

    fn start_dispatcher(&mut self) {
        let Some((reader, decoder)) = self.io.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let kex_ctx = Arc::clone(&self.kex_ctx);
        tokio::spawn(dispatch_loop(reader, decoder, shared, kex_ctx));
    }

    /// Opens a session channel.
    pub async fn open_session(&mut self) -> KeelResult<ClientChannel> {
        self.shared.open_channel(ChannelType::Session).await
    }

    /// Opens a direct-tcpip channel.
    pub async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u32,
    ) -> KeelResult<ClientChannel> {
        self.shared
            .open_channel(ChannelType::DirectTcpip {
                host: host.to_string(),
                port,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 0,
            })
            .await
    }

    /// Opens an SFTP client over a fresh session channel.
    pub async fn sftp(&mut self) -> KeelResult<SftpClient> {
        let mut channel = self.open_session().await?;
        channel.request_subsystem("sftp").await?;
        Ok(channel.into_sftp())
    }

    /// Asks the server to bind a remote forwarding listener; returns the
    /// bound port.
    pub async fn request_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
    ) -> KeelResult<u32> {
        let request = GlobalRequest::new(
            GlobalRequestType::TcpipForward {
                address: address.to_string(),
                port,
            },
            true,
        );
        self.shared.sender.send(request.to_bytes()).await?;

        let reply = self.global_rx.recv().await.ok_or_else(|| {
            KeelError::Protocol("Connection closed awaiting forward reply".to_string())
        })?;
        match reply.first().copied() {
            Some(t) if t == MessageType::RequestSuccess as u8 => {
                let success = RequestSuccess::from_bytes(&reply)?;
                Ok(success.port().unwrap_or(port))
            }
            _ => Err(KeelError::Channel(
                "tcpip-forward request refused".to_string(),
            )),
        }
    }

    /// Receives the next forwarded-tcpip channel the server opened.
    pub async fn accept_forwarded(&mut self) -> Option<ClientChannel> {
        self.incoming_rx.recv().await
    }

    /// Starts SOCKS5 dynamic forwarding; returns the proxy address.
    pub async fn start_dynamic_port_forwarding(
        &mut self,
        addr: &str,
    ) -> KeelResult<SocketAddr> {
        if self.dynamic.is_some() {
            return Err(KeelError::Config(
                "Dynamic forwarding already running".to_string(),
            ));
        }
        let opener: Arc<dyn DirectTcpipOpener> = Arc::clone(&self.shared) as _;
        let forward = DynamicForward::start(addr, opener).await?;
        let local = forward.local_addr();
        self.dynamic = Some(forward);
        Ok(local)
    }

    /// Stops dynamic forwarding; new proxy connections are refused.
    pub fn stop_dynamic_port_forwarding(&mut self) -> KeelResult<()> {
        match self.dynamic.take() {
            Some(forward) => {
                forward.stop();
                Ok(())
            }
            None => Err(KeelError::Config(
                "Dynamic forwarding is not running".to_string(),
            )),
        }
    }

    /// Sends a DISCONNECT and drops the connection.
    pub async fn disconnect(self) -> KeelResult<()> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(crate::ssh::message::DisconnectReason::ByApplication as u32);
        buf.put_str("closed by user");
        buf.put_str("");
        self.shared.sender.send_now(buf.into_bytes()).await
    }

    /// The configuration this client runs with.
    pub fn config(&self) -> &SshClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server", &self.server_address)
            .field("user", &self.username)
            .finish_non_exhaustive()
    }
}

async fn dispatch_loop(
    mut reader: OwnedReadHalf,
    mut decoder: PacketDecoder,
    shared: Arc<ClientShared>,
    kex_ctx: Arc<KexContext>,
) {
    loop {
        let payload = match decoder.read_packet(&mut reader).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "client dispatch loop ending");
                break;
            }
        };

        if let Err(e) = route(
            &mut reader,
            &mut decoder,
            &shared,
            &kex_ctx,
            payload,
        )
        .await
        {
            warn!(error = %e, "client dispatch error");
            break;
        }
    }

    // Fail everything still outstanding.
    for (_, pending) in shared
        .pending_opens
        .lock()
        .expect("pending opens poisoned")
        .drain()
    {
        let _ = pending.send(Err(0));
    }
    for (_, core) in shared
        .channels
        .lock()
        .expect("channels poisoned")
        .drain()
    {
        core.deliver_event(ChannelEvent::Close);
        core.quiesce();
        core.set_state(ChannelState::Closed);
        core.close_future().set(());
    }
}

async fn route(
    reader: &mut OwnedReadHalf,
    decoder: &mut PacketDecoder,
    shared: &Arc<ClientShared>,
    kex_ctx: &Arc<KexContext>,
    payload: Vec<u8>,
) -> KeelResult<()> {
    let Some(msg_type) = payload.first().copied() else {
        return Ok(());
    };

    match MessageType::from_u8(msg_type) {
        Some(MessageType::ChannelData) => {
            let data = crate::ssh::connection::ChannelData::from_bytes(&payload)?;
            let core = lookup(shared, data.recipient_channel());
            if let Some(core) = core {
                let remote_id = core.remote_id();
                if let Some(adjustment) = core.deliver_data(data.into_data())? {
                    shared
                        .sender
                        .send(ChannelWindowAdjust::new(remote_id, adjustment).to_bytes())
                        .await?;
                }
            }
            Ok(())
        }
        Some(MessageType::ChannelExtendedData) => {
            let data = crate::ssh::connection::ChannelExtendedData::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, data.recipient_channel()) {
                let remote_id = core.remote_id();
                if let Some(adjustment) = core.deliver_extended_data(data.data().to_vec())? {
                    shared
                        .sender
                        .send(ChannelWindowAdjust::new(remote_id, adjustment).to_bytes())
                        .await?;
                }
            }
            Ok(())
        }
        Some(MessageType::ChannelWindowAdjust) => {
            let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, adjust.recipient_channel()) {
                core.remote_window().expand(adjust.bytes_to_add());
            }
            Ok(())
        }
        Some(MessageType::ChannelEof) => {
            let eof = ChannelEof::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, eof.recipient_channel()) {
                if core.mark_eof_received() {
                    core.deliver_event(ChannelEvent::Eof);
                }
            }
            Ok(())
        }
        Some(MessageType::ChannelClose) => {
            let close = ChannelClose::from_bytes(&payload)?;
            let core = shared
                .channels
                .lock()
                .expect("channels poisoned")
                .remove(&close.recipient_channel());
            if let Some(core) = core {
                core.deliver_event(ChannelEvent::Close);
                core.quiesce();
                if core.mark_close_sent() {
                    shared
                        .sender
                        .send(ChannelClose::new(core.remote_id()).to_bytes())
                        .await?;
                }
                core.set_state(ChannelState::Closed);
                core.close_future().set(());
            }
            Ok(())
        }
        Some(MessageType::ChannelSuccess) => {
            let success = crate::ssh::connection::ChannelSuccess::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, success.recipient_channel()) {
                core.deliver_event(ChannelEvent::RequestSuccess);
            }
            Ok(())
        }
        Some(MessageType::ChannelFailure) => {
            let failure = crate::ssh::connection::ChannelFailure::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, failure.recipient_channel()) {
                core.deliver_event(ChannelEvent::RequestFailure);
            }
            Ok(())
        }
        Some(MessageType::ChannelRequest) => {
            let request = ChannelRequest::from_bytes(&payload)?;
            if let Some(core) = lookup(shared, request.recipient_channel()) {
                core.deliver_event(ChannelEvent::Request(request));
            }
            Ok(())
        }
        Some(MessageType::ChannelOpenConfirmation) => {
            let confirmation = ChannelOpenConfirmation::from_bytes(&payload)?;
            let local_id = confirmation.recipient_channel();
            let pending = shared
                .pending_opens
                .lock()
                .expect("pending opens poisoned")
                .remove(&local_id);
            let Some(pending) = pending else {
                warn!(local_id, "confirmation for unknown channel");
                return Ok(());
            };

            let (core, events) = ChannelCore::new(
                local_id,
                confirmation.sender_channel(),
                ChannelVariant::Session {
                    env: Vec::new(),
                    pty: None,
                },
                Arc::new(Window::init(shared.window_size, shared.packet_size)),
                Arc::new(Window::init(
                    confirmation.initial_window_size(),
                    confirmation.maximum_packet_size(),
                )),
            );
            core.set_state(ChannelState::Open);
            shared
                .channels
                .lock()
                .expect("channels poisoned")
                .insert(local_id, core.clone());
            let _ = pending.send(Ok(OpenedChannel { core, events }));
            Ok(())
        }
        Some(MessageType::ChannelOpenFailure) => {
            let failure = ChannelOpenFailure::from_bytes(&payload)?;
            let pending = shared
                .pending_opens
                .lock()
                .expect("pending opens poisoned")
                .remove(&failure.recipient_channel());
            if let Some(pending) = pending {
                let _ = pending.send(Err(failure.reason_code() as u32));
            }
            Ok(())
        }
        Some(MessageType::ChannelOpen) => {
            // Server-initiated forwarded-tcpip channel.
            let open = ChannelOpen::from_bytes(&payload)?;
            let local_id = shared.next_channel.fetch_add(1, Ordering::SeqCst);
            let (core, events) = ChannelCore::new(
                local_id,
                open.sender_channel(),
                ChannelVariant::ForwardedTcpip {
                    address: String::new(),
                    port: 0,
                },
                Arc::new(Window::init(shared.window_size, shared.packet_size)),
                Arc::new(Window::init(
                    open.initial_window_size(),
                    open.maximum_packet_size(),
                )),
            );
            core.set_state(ChannelState::Open);
            shared
                .channels
                .lock()
                .expect("channels poisoned")
                .insert(local_id, core.clone());

            let confirmation = ChannelOpenConfirmation::new(
                open.sender_channel(),
                local_id,
                shared.window_size,
                shared.packet_size,
            );
            shared.sender.send(confirmation.to_bytes()).await?;

            let writer = ChannelWriter::new(
                shared.sender.clone(),
                core.clone(),
                open.maximum_packet_size().max(1),
            );
            let channel = ClientChannel {
                core,
                writer,
                stdin: ChannelStdin::new(events),
            };
            let _ = shared.incoming_tx.send(channel);
            Ok(())
        }
        Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
            let _ = shared.global_tx.send(payload);
            Ok(())
        }
        Some(MessageType::KexInit) => {
            client_rekey(reader, decoder, shared, kex_ctx, payload).await
        }
        Some(MessageType::Disconnect) => Err(KeelError::Protocol(
            "Server disconnected".to_string(),
        )),
        Some(MessageType::Ignore) | Some(MessageType::Debug)
        | Some(MessageType::Unimplemented) => Ok(()),
        other => {
            debug!(message = ?other, "client ignoring message");
            Ok(())
        }
    }
}

fn lookup(shared: &Arc<ClientShared>, local_id: u32) -> Option<Arc<ChannelCore>> {
    shared
        .channels
        .lock()
        .expect("channels poisoned")
        .get(&local_id)
        .cloned()
}

/// Serves a server-initiated rekey: channel traffic keeps flowing while
/// the new keys are agreed.
async fn client_rekey(
    reader: &mut OwnedReadHalf,
    decoder: &mut PacketDecoder,
    shared: &Arc<ClientShared>,
    kex_ctx: &Arc<KexContext>,
    server_kexinit_payload: Vec<u8>,
) -> KeelResult<()> {
    debug!("server-initiated rekey");
    shared.sender.set_hold(true).await?;

    let our_kexinit = KexInit::new_default();
    let client_kexinit_payload = our_kexinit.to_bytes();
    shared
        .sender
        .send_now(client_kexinit_payload.clone())
        .await?;

    let server_kexinit = KexInit::from_bytes(&server_kexinit_payload)?;
    let suite = NegotiatedAlgorithms::negotiate(&server_kexinit, &our_kexinit)?;
    if !suite.kex.starts_with("curve25519-sha256") {
        return Err(KeelError::Protocol(format!(
            "Rekey negotiated unsupported KEX {}",
            suite.kex
        )));
    }

    let exchange = Curve25519Exchange::new()?;
    let client_public = exchange.public_key().to_vec();
    let mut init = Buffer::new();
    init.put_u8(MessageType::KexdhInit as u8);
    init.put_string(&client_public);
    shared.sender.send_now(init.into_bytes()).await?;

    // Channel traffic continues under the old keys until NEWKEYS.
    let mut exchange = Some(exchange);
    let mut pending_inbound: Option<crate::ssh::server::DirectionKeys> = None;
    loop {
        let payload = decoder.read_packet(reader).await?;
        match payload.first().copied() {
            Some(t) if t == MessageType::KexdhReply as u8 => {
                let mut buf = Buffer::from(&payload[1..]);
                let host_key_blob = buf.get_string()?;
                let server_public = buf.get_string()?;
                let signature = buf.get_string()?;

                let exchange = exchange.take().ok_or_else(|| {
                    KeelError::Protocol("Duplicate KEXDH_REPLY".to_string())
                })?;
                let shared_secret = exchange.compute_shared_secret(&server_public)?;
                let hash_input = ExchangeHashInput {
                    client_version: &kex_ctx.client_version,
                    server_version: &kex_ctx.server_version,
                    client_kexinit: &client_kexinit_payload,
                    server_kexinit: &server_kexinit_payload,
                    host_key_blob: &host_key_blob,
                };
                let hash = crate::ssh::kex_dh::KexHash::Sha256;
                let exchange_hash = exchange_hash_ecdh(
                    hash,
                    &hash_input,
                    &client_public,
                    &server_public,
                    &shared_secret,
                );
                if !verify_signature(&suite.host_key, &host_key_blob, &exchange_hash, &signature)
                    .unwrap_or(false)
                {
                    return Err(KeelError::Security(
                        "Rekey host key verification failed".to_string(),
                    ));
                }

                let (outbound, inbound) = derive_direction_keys(
                    &suite,
                    hash,
                    &exchange_hash,
                    &shared_secret,
                    &kex_ctx.session_id,
                    false,
                )?;
                shared
                    .sender
                    .send_newkeys_and_install(
                        outbound.cipher,
                        Some(outbound.mac),
                        outbound.compression,
                    )
                    .await?;
                pending_inbound = Some(inbound);
            }
            Some(t) if t == MessageType::NewKeys as u8 => {
                let inbound = pending_inbound.take().ok_or_else(|| {
                    KeelError::Protocol("NEWKEYS before KEXDH_REPLY".to_string())
                })?;
                decoder.install(inbound.cipher, Some(inbound.mac), inbound.compression);
                shared.sender.set_hold(false).await?;
                debug!("rekey complete");
                return Ok(());
            }
            Some(t)
                if (MessageType::ChannelOpen as u8..=MessageType::ChannelFailure as u8)
                    .contains(&t) =>
            {
                // Box the recursion: route() may not recurse infinitely,
                // and rekey is never nested inside itself because KEXINIT
                // cannot legally appear here.
                Box::pin(route(reader, decoder, shared, kex_ctx, payload)).await?;
            }
            Some(t) if t == MessageType::Ignore as u8 || t == MessageType::Debug as u8 => {}
            other => {
                return Err(KeelError::Protocol(format!(
                    "Unexpected message {:?} during rekey",
                    other
                )))
            }
        }
    }
}
