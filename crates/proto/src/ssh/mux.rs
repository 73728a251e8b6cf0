//! Connection-service channel multiplexer (RFC 4254).
//!
//! Owns the channel table for one session and demultiplexes every
//! channel-scoped message by local id: open/confirmation/failure, data,
//! extended data, window adjust, EOF, close, requests and replies.
//! Global requests (`tcpip-forward`, `cancel-tcpip-forward`) bind and
//! release forwarding listeners.
//!
//! Session channels hand their streams to embedder-supplied commands
//! ([`CommandFactory`]) or named subsystems ([`SubsystemFactory`]; the
//! SFTP subsystem registers under "sftp"). direct-tcpip channels relay to
//! a fresh TCP connection, gated by the [`ForwardingFilter`].
//!
//! Close ordering: CLOSE is sent exactly once and never before the data
//! already queued on the outbound path; on receipt, pending I/O is failed,
//! our own CLOSE is answered if still outstanding, the table entry is
//! removed and the channel's close future resolves.

use crate::ssh::channel::{
    relay_streams, ChannelCore, ChannelEvent, ChannelState, ChannelStdin, ChannelVariant,
    ChannelWriter, PacketSink, PtyRequest,
};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust, GlobalRequest,
    GlobalRequestType, RequestFailure, RequestSuccess,
};
use crate::ssh::connection::ChannelFailure as ChannelFailureMsg;
use crate::ssh::message::MessageType;
use crate::ssh::window::Window;
use keel_platform::{CloseFn, Closer, Completion, KeelError, KeelResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Context handed to a command when it starts.
pub struct CommandContext {
    /// The exec command line (None for a shell).
    pub command: Option<String>,
    /// Accumulated env requests.
    pub env: Vec<(String, String)>,
    /// Terminal parameters, when a pty was requested.
    pub pty: Option<PtyRequest>,
    /// Channel input (peer -> command).
    pub stdin: ChannelStdin,
    /// Channel output (command -> peer); also carries stderr.
    pub stdout: ChannelWriter,
}

/// How a command finished; emitted to the peer as exit-status or
/// exit-signal before the channel closes.
#[derive(Debug, Clone)]
pub enum CommandExit {
    /// Normal exit with a status code.
    Status(u32),
    /// Terminated by a signal.
    Signal {
        /// Signal name without the "SIG" prefix (e.g. "TERM").
        name: String,
        /// Whether a core was dumped.
        core_dumped: bool,
        /// Error message for the peer.
        message: String,
    },
}

/// A running command bound to a session channel.
#[async_trait::async_trait]
pub trait Command: Send + 'static {
    /// Runs to completion and reports how the command ended.
    async fn run(self: Box<Self>, ctx: CommandContext) -> KeelResult<CommandExit>;
}

/// Produces commands for shell and exec requests.
pub trait CommandFactory: Send + Sync {
    /// Creates the command for `command` (None = interactive shell).
    fn create(&self, command: Option<&str>) -> KeelResult<Box<dyn Command>>;
}

/// Produces subsystem workers by name.
pub trait SubsystemFactory: Send + Sync {
    /// Subsystem name as addressed by the peer.
    fn name(&self) -> &str;

    /// Spawns the worker for one subsystem instance. A returned error
    /// from the worker marked fatal disconnects the session.
    fn spawn(
        &self,
        stdin: ChannelStdin,
        writer: ChannelWriter,
        fault: Completion<String>,
    ) -> KeelResult<JoinHandle<()>>;
}

/// Port-forwarding policy decisions.
pub trait ForwardingFilter: Send + Sync {
    /// May the client bind a remote listener here?
    fn allow_tcpip_forward(&self, address: &str, port: u32) -> bool;

    /// May the client open a direct-tcpip channel to `host:port`?
    fn allow_direct_tcpip(&self, host: &str, port: u32, originator: &str) -> bool;
}

/// Accepts every forwarding request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllForwarding;

impl ForwardingFilter for AcceptAllForwarding {
    fn allow_tcpip_forward(&self, _address: &str, _port: u32) -> bool {
        true
    }

    fn allow_direct_tcpip(&self, _host: &str, _port: u32, _originator: &str) -> bool {
        true
    }
}

/// Rejects every forwarding request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllForwarding;

impl ForwardingFilter for RejectAllForwarding {
    fn allow_tcpip_forward(&self, _address: &str, _port: u32) -> bool {
        false
    }

    fn allow_direct_tcpip(&self, _host: &str, _port: u32, _originator: &str) -> bool {
        false
    }
}

struct ChannelEntry {
    core: Arc<ChannelCore>,
    /// Held until a command/subsystem consumes the stream.
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    worker: Option<JoinHandle<()>>,
}

struct BoundForward {
    listener_task: JoinHandle<()>,
    port: u32,
}

/// A socket accepted by a tcpip-forward listener, waiting for its
/// forwarded-tcpip channel.
pub struct AcceptedForward {
    /// Listener bind address.
    pub address: String,
    /// Listener bound port.
    pub port: u32,
    /// The accepted socket.
    pub stream: TcpStream,
    /// Peer address of the accepted socket.
    pub originator: std::net::SocketAddr,
}

/// The connection service for one authenticated session.
pub struct ConnectionService {
    sink: Arc<dyn PacketSink>,
    channels: HashMap<u32, ChannelEntry>,
    next_channel_id: u32,
    window_size: u32,
    packet_size: u32,
    command_factory: Option<Arc<dyn CommandFactory>>,
    subsystems: HashMap<String, Arc<dyn SubsystemFactory>>,
    forwarding: Arc<dyn ForwardingFilter>,
    bound_forwards: HashMap<(String, u32), BoundForward>,
    /// Outbound opens awaiting confirmation (forwarded-tcpip).
    pending_opens: HashMap<u32, Completion<Result<(u32, u32, u32), u32>>>,
    /// Fatal faults raised by workers; the session loop watches this.
    fault: Completion<String>,
    /// Accepted sockets waiting for their forwarded-tcpip confirmation.
    pending_sockets: HashMap<u32, TcpStream>,
    /// Listener tasks push accepted sockets here; the session loop drains
    /// the receiver (taken once via [`take_accept_receiver`]).
    accept_tx: mpsc::UnboundedSender<AcceptedForward>,
    accept_rx: Option<mpsc::UnboundedReceiver<AcceptedForward>>,
}

impl ConnectionService {
    /// Creates the service.
    pub fn new(
        sink: Arc<dyn PacketSink>,
        window_size: u32,
        packet_size: u32,
        command_factory: Option<Arc<dyn CommandFactory>>,
        forwarding: Arc<dyn ForwardingFilter>,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            sink,
            channels: HashMap::new(),
            next_channel_id: 0,
            window_size,
            packet_size,
            command_factory,
            subsystems: HashMap::new(),
            forwarding,
            bound_forwards: HashMap::new(),
            pending_opens: HashMap::new(),
            fault: Completion::new(),
            pending_sockets: HashMap::new(),
            accept_tx,
            accept_rx: Some(accept_rx),
        }
    }

    /// Takes the accepted-socket receiver; the session loop owns it and
    /// feeds each socket back through [`open_forwarded`](Self::open_forwarded).
    pub fn take_accept_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<AcceptedForward>> {
        self.accept_rx.take()
    }

    /// Registers a subsystem factory by its name.
    pub fn register_subsystem(&mut self, factory: Arc<dyn SubsystemFactory>) {
        self.subsystems.insert(factory.name().to_string(), factory);
    }

    /// Completion failed when a worker demands session disconnect.
    pub fn fault(&self) -> &Completion<String> {
        &self.fault
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Looks up a channel core by local id.
    pub fn channel(&self, local_id: u32) -> Option<&Arc<ChannelCore>> {
        self.channels.get(&local_id).map(|e| &e.core)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        id
    }

    /// Routes one connection-layer message.
    pub async fn handle_message(&mut self, payload: &[u8]) -> KeelResult<()> {
        let Some(msg_type) = payload.first().and_then(|b| MessageType::from_u8(*b)) else {
            return Err(KeelError::Protocol(
                "Empty connection-layer message".to_string(),
            ));
        };

        match msg_type {
            MessageType::ChannelOpen => self.handle_open(payload).await,
            MessageType::ChannelOpenConfirmation => {
                self.handle_open_confirmation(payload).await
            }
            MessageType::ChannelOpenFailure => self.handle_open_failure(payload).await,
            MessageType::ChannelData => self.handle_data(payload).await,
            MessageType::ChannelExtendedData => self.handle_extended_data(payload).await,
            MessageType::ChannelWindowAdjust => self.handle_window_adjust(payload),
            MessageType::ChannelEof => self.handle_eof(payload),
            MessageType::ChannelClose => self.handle_close(payload).await,
            MessageType::ChannelRequest => self.handle_request(payload).await,
            MessageType::ChannelSuccess => self.handle_reply(payload, true),
            MessageType::ChannelFailure => self.handle_reply(payload, false),
            MessageType::GlobalRequest => self.handle_global_request(payload).await,
            other => Err(KeelError::Protocol(format!(
                "Message {} is not a connection-layer message",
                other
            ))),
        }
    }

    async fn handle_open(&mut self, payload: &[u8]) -> KeelResult<()> {
        let open = match ChannelOpen::from_bytes(payload) {
            Ok(open) => open,
            Err(KeelError::Channel(msg)) => {
                // Unknown channel type: refuse the open, keep the session.
                let mut buf = crate::ssh::buffer::Buffer::from(payload);
                let _ = buf.get_u8();
                let _ = buf.get_string();
                let sender = buf.get_u32().unwrap_or(0);
                info!(reason = %msg, "refusing channel open");
                let failure = ChannelOpenFailure::with_description(
                    sender,
                    ChannelOpenFailureReason::UnknownChannelType,
                    msg,
                );
                return self.sink.send(failure.to_bytes()).await;
            }
            Err(e) => return Err(e),
        };

        let variant = match open.channel_type() {
            ChannelType::Session => ChannelVariant::Session {
                env: Vec::new(),
                pty: None,
            },
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                ..
            } => {
                if !self
                    .forwarding
                    .allow_direct_tcpip(host, *port, originator_address)
                {
                    let failure = ChannelOpenFailure::new(
                        open.sender_channel(),
                        ChannelOpenFailureReason::AdministrativelyProhibited,
                    );
                    return self.sink.send(failure.to_bytes()).await;
                }
                ChannelVariant::DirectTcpip {
                    host: host.clone(),
                    port: *port,
                }
            }
            ChannelType::ForwardedTcpip { .. } => {
                // forwarded-tcpip originates on this side, never inbound.
                let failure = ChannelOpenFailure::new(
                    open.sender_channel(),
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                );
                return self.sink.send(failure.to_bytes()).await;
            }
        };

        let local_id = self.allocate_id();
        let local_window = Arc::new(Window::init(self.window_size, self.packet_size));
        let remote_window = Arc::new(Window::init(
            open.initial_window_size(),
            open.maximum_packet_size(),
        ));
        let (core, events) = ChannelCore::new(
            local_id,
            open.sender_channel(),
            variant,
            local_window,
            remote_window,
        );

        let mut entry = ChannelEntry {
            core: core.clone(),
            events: Some(events),
            env: Vec::new(),
            pty: None,
            worker: None,
        };

        // direct-tcpip connects before confirming; the relay starts
        // immediately on success.
        if let ChannelVariant::DirectTcpip { host, port } = core.variant() {
            let target = format!("{}:{}", host, port);
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    let writer = ChannelWriter::new(
                        Arc::clone(&self.sink),
                        core.clone(),
                        open.maximum_packet_size().min(self.packet_size),
                    );
                    let stdin = ChannelStdin::new(
                        entry.events.take().expect("fresh channel keeps its events"),
                    );
                    let (read_half, write_half) = stream.into_split();
                    entry.worker = Some(tokio::spawn(async move {
                        let _ = relay_streams(writer, stdin, read_half, write_half).await;
                    }));
                }
                Err(e) => {
                    debug!(target = %target, error = %e, "direct-tcpip connect failed");
                    let failure = ChannelOpenFailure::with_description(
                        open.sender_channel(),
                        ChannelOpenFailureReason::ConnectFailed,
                        e.to_string(),
                    );
                    return self.sink.send(failure.to_bytes()).await;
                }
            }
        }

        core.set_state(ChannelState::Open);
        self.channels.insert(local_id, entry);

        let confirmation = ChannelOpenConfirmation::new(
            open.sender_channel(),
            local_id,
            self.window_size,
            self.packet_size,
        );
        self.sink.send(confirmation.to_bytes()).await
    }

    async fn handle_open_confirmation(&mut self, payload: &[u8]) -> KeelResult<()> {
        let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
        let local_id = confirmation.recipient_channel();
        let Some(pending) = self.pending_opens.remove(&local_id) else {
            warn!(local_id, "OPEN_CONFIRMATION for unknown channel");
            return Ok(());
        };

        pending.set(Ok((
            confirmation.sender_channel(),
            confirmation.initial_window_size(),
            confirmation.maximum_packet_size(),
        )));

        if let Some(stream) = self.pending_sockets.remove(&local_id) {
            self.start_forwarded_relay(local_id, confirmation, stream);
        }
        Ok(())
    }

    async fn handle_open_failure(&mut self, payload: &[u8]) -> KeelResult<()> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let local_id = failure.recipient_channel();
        self.pending_sockets.remove(&local_id);
        if let Some(pending) = self.pending_opens.remove(&local_id) {
            pending.set(Err(failure.reason_code() as u32));
        } else {
            warn!(local_id, "OPEN_FAILURE for unknown channel");
        }
        Ok(())
    }

    fn start_forwarded_relay(
        &mut self,
        local_id: u32,
        confirmation: ChannelOpenConfirmation,
        stream: TcpStream,
    ) {
        let Some(entry) = self.channels.get_mut(&local_id) else {
            return;
        };
        entry.core.set_state(ChannelState::Open);
        entry
            .core
            .remote_window()
            .expand(confirmation.initial_window_size());

        let writer = ChannelWriter::new(
            Arc::clone(&self.sink),
            entry.core.clone(),
            confirmation.maximum_packet_size().min(self.packet_size),
        );
        let Some(events) = entry.events.take() else {
            return;
        };
        let stdin = ChannelStdin::new(events);
        let (read_half, write_half) = stream.into_split();
        entry.worker = Some(tokio::spawn(async move {
            let _ = relay_streams(writer, stdin, read_half, write_half).await;
        }));
    }

    async fn handle_data(&mut self, payload: &[u8]) -> KeelResult<()> {
        let data = ChannelData::from_bytes(payload)?;
        let local_id = data.recipient_channel();
        let Some(entry) = self.channels.get(&local_id) else {
            warn!(local_id, "CHANNEL_DATA for unknown channel");
            return Ok(());
        };
        if entry.core.state() != ChannelState::Open {
            return Err(KeelError::Protocol(format!(
                "CHANNEL_DATA on channel {} in state {:?}",
                local_id,
                entry.core.state()
            )));
        }

        let remote_id = entry.core.remote_id();
        if let Some(adjustment) = entry.core.deliver_data(data.into_data())? {
            self.sink
                .send(ChannelWindowAdjust::new(remote_id, adjustment).to_bytes())
                .await?;
        }
        Ok(())
    }

    async fn handle_extended_data(&mut self, payload: &[u8]) -> KeelResult<()> {
        let data = ChannelExtendedData::from_bytes(payload)?;
        let local_id = data.recipient_channel();
        let Some(entry) = self.channels.get(&local_id) else {
            warn!(local_id, "CHANNEL_EXTENDED_DATA for unknown channel");
            return Ok(());
        };

        let remote_id = entry.core.remote_id();
        if let Some(adjustment) = entry
            .core
            .deliver_extended_data(data.data().to_vec())?
        {
            self.sink
                .send(ChannelWindowAdjust::new(remote_id, adjustment).to_bytes())
                .await?;
        }
        Ok(())
    }

    fn handle_window_adjust(&mut self, payload: &[u8]) -> KeelResult<()> {
        let adjust = ChannelWindowAdjust::from_bytes(payload)?;
        let Some(entry) = self.channels.get(&adjust.recipient_channel()) else {
            warn!(
                local_id = adjust.recipient_channel(),
                "WINDOW_ADJUST for unknown channel"
            );
            return Ok(());
        };
        entry.core.remote_window().expand(adjust.bytes_to_add());
        Ok(())
    }

    fn handle_eof(&mut self, payload: &[u8]) -> KeelResult<()> {
        let eof = ChannelEof::from_bytes(payload)?;
        let Some(entry) = self.channels.get(&eof.recipient_channel()) else {
            warn!(local_id = eof.recipient_channel(), "EOF for unknown channel");
            return Ok(());
        };
        if entry.core.mark_eof_received() {
            entry.core.deliver_event(ChannelEvent::Eof);
        }
        Ok(())
    }

    async fn handle_close(&mut self, payload: &[u8]) -> KeelResult<()> {
        let close = ChannelClose::from_bytes(payload)?;
        let local_id = close.recipient_channel();
        let Some(entry) = self.channels.remove(&local_id) else {
            warn!(local_id, "CLOSE for unknown channel");
            return Ok(());
        };

        entry.core.deliver_event(ChannelEvent::Close);
        entry.core.quiesce();

        if entry.core.mark_close_sent() {
            self.sink
                .send(ChannelClose::new(entry.core.remote_id()).to_bytes())
                .await?;
        }

        entry.core.set_state(ChannelState::Closed);
        entry.core.close_future().set(());
        debug!(local_id, "channel closed");
        Ok(())
    }

    /// Initiates a close from this side. Idempotent: closing an already
    /// closing or closed channel performs no I/O.
    pub async fn close_channel(&mut self, local_id: u32) -> KeelResult<()> {
        let Some(entry) = self.channels.get(&local_id) else {
            return Ok(());
        };
        if matches!(
            entry.core.state(),
            ChannelState::Closing | ChannelState::Closed
        ) {
            return Ok(());
        }
        entry.core.set_state(ChannelState::Closing);
        if entry.core.mark_close_sent() {
            self.sink
                .send(ChannelClose::new(entry.core.remote_id()).to_bytes())
                .await?;
        }
        Ok(())
    }

    async fn handle_request(&mut self, payload: &[u8]) -> KeelResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let local_id = request.recipient_channel();

        let Some(entry) = self.channels.get_mut(&local_id) else {
            warn!(local_id, "CHANNEL_REQUEST for unknown channel");
            return Ok(());
        };
        let remote_id = entry.core.remote_id();

        let accepted = match request.request_type() {
            ChannelRequestType::Env { name, value } => {
                entry.env.push((name.clone(), value.clone()));
                true
            }
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                modes,
                ..
            } => {
                entry.pty = Some(PtyRequest {
                    term: term.clone(),
                    width_chars: *width_chars,
                    height_rows: *height_rows,
                    modes: modes.clone(),
                });
                true
            }
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                ..
            } => {
                if let Some(pty) = &mut entry.pty {
                    pty.width_chars = *width_chars;
                    pty.height_rows = *height_rows;
                }
                true
            }
            ChannelRequestType::Shell => self.start_command(local_id, None).await?,
            ChannelRequestType::Exec { command } => {
                let command = command.clone();
                self.start_command(local_id, Some(command)).await?
            }
            ChannelRequestType::Subsystem { name } => {
                let name = name.clone();
                self.start_subsystem(local_id, &name)?
            }
            ChannelRequestType::ExitStatus { .. } | ChannelRequestType::ExitSignal { .. } => {
                // Client-to-server direction never carries these.
                false
            }
            ChannelRequestType::Unknown { name, .. } => {
                info!(request = %name, "unsupported channel request");
                false
            }
        };

        if request.want_reply() {
            let reply = if accepted {
                ChannelSuccess::new(remote_id).to_bytes()
            } else {
                ChannelFailureMsg::new(remote_id).to_bytes()
            };
            self.sink.send(reply).await?;
        }
        Ok(())
    }

    async fn start_command(
        &mut self,
        local_id: u32,
        command: Option<String>,
    ) -> KeelResult<bool> {
        let Some(factory) = self.command_factory.clone() else {
            return Ok(false);
        };
        let Some(entry) = self.channels.get_mut(&local_id) else {
            return Ok(false);
        };
        let Some(events) = entry.events.take() else {
            // A command or subsystem is already bound to this channel.
            return Ok(false);
        };

        let cmd = match factory.create(command.as_deref()) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "command factory refused request");
                entry.events = Some(events);
                return Ok(false);
            }
        };

        let remote_window_packet = entry.core.remote_window().max_packet();
        let writer = ChannelWriter::new(
            Arc::clone(&self.sink),
            entry.core.clone(),
            remote_window_packet.min(self.packet_size).max(1),
        );
        let ctx = CommandContext {
            command,
            env: std::mem::take(&mut entry.env),
            pty: entry.pty.clone(),
            stdin: ChannelStdin::new(events),
            stdout: writer.clone(),
        };

        let sink = Arc::clone(&self.sink);
        let core = entry.core.clone();
        entry.worker = Some(tokio::spawn(async move {
            let exit = match cmd.run(ctx).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(error = %e, "command failed");
                    CommandExit::Status(1)
                }
            };

            // exit-status / exit-signal, then EOF, then CLOSE.
            let request_type = match exit {
                CommandExit::Status(exit_status) => {
                    ChannelRequestType::ExitStatus { exit_status }
                }
                CommandExit::Signal {
                    name,
                    core_dumped,
                    message,
                } => ChannelRequestType::ExitSignal {
                    signal_name: name,
                    core_dumped,
                    error_message: message,
                    language_tag: String::new(),
                },
            };
            let exit = ChannelRequest::new(core.remote_id(), request_type, false);
            let _ = sink.send(exit.to_bytes()).await;
            let _ = writer.send_eof().await;
            if core.mark_close_sent() {
                core.set_state(ChannelState::Closing);
                let _ = sink.send(ChannelClose::new(core.remote_id()).to_bytes()).await;
            }
        }));

        Ok(true)
    }

    fn start_subsystem(&mut self, local_id: u32, name: &str) -> KeelResult<bool> {
        let Some(factory) = self.subsystems.get(name).cloned() else {
            info!(subsystem = %name, "unknown subsystem requested");
            return Ok(false);
        };
        let Some(entry) = self.channels.get_mut(&local_id) else {
            return Ok(false);
        };
        let Some(events) = entry.events.take() else {
            return Ok(false);
        };

        let remote_window_packet = entry.core.remote_window().max_packet();
        let writer = ChannelWriter::new(
            Arc::clone(&self.sink),
            entry.core.clone(),
            remote_window_packet.min(self.packet_size).max(1),
        );
        let stdin = ChannelStdin::new(events);

        match factory.spawn(stdin, writer, self.fault.clone()) {
            Ok(worker) => {
                entry.worker = Some(worker);
                Ok(true)
            }
            Err(e) => {
                warn!(subsystem = %name, error = %e, "subsystem start failed");
                Ok(false)
            }
        }
    }

    fn handle_reply(&mut self, payload: &[u8], success: bool) -> KeelResult<()> {
        let local_id = if success {
            ChannelSuccess::from_bytes(payload)?.recipient_channel()
        } else {
            ChannelFailureMsg::from_bytes(payload)?.recipient_channel()
        };
        if let Some(entry) = self.channels.get(&local_id) {
            entry.core.deliver_event(if success {
                ChannelEvent::RequestSuccess
            } else {
                ChannelEvent::RequestFailure
            });
        }
        Ok(())
    }

    async fn handle_global_request(&mut self, payload: &[u8]) -> KeelResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        match request.request_type() {
            GlobalRequestType::TcpipForward { address, port } => {
                let address = address.clone();
                let port = *port;
                if !self.forwarding.allow_tcpip_forward(&address, port) {
                    info!(%address, port, "tcpip-forward refused by filter");
                    if request.want_reply() {
                        self.sink.send(RequestFailure::new().to_bytes()).await?;
                    }
                    return Ok(());
                }
                match self.bind_forward(&address, port).await {
                    Ok(bound_port) => {
                        if request.want_reply() {
                            let reply = if port == 0 {
                                RequestSuccess::with_port(bound_port)
                            } else {
                                RequestSuccess::empty()
                            };
                            self.sink.send(reply.to_bytes()).await?;
                        }
                    }
                    Err(e) => {
                        warn!(%address, port, error = %e, "tcpip-forward bind failed");
                        if request.want_reply() {
                            self.sink.send(RequestFailure::new().to_bytes()).await?;
                        }
                    }
                }
                Ok(())
            }
            GlobalRequestType::CancelTcpipForward { address, port } => {
                let cancelled = self
                    .bound_forwards
                    .remove(&(address.clone(), *port))
                    .map(|bound| bound.listener_task.abort())
                    .is_some();
                if request.want_reply() {
                    let reply = if cancelled {
                        RequestSuccess::empty().to_bytes()
                    } else {
                        RequestFailure::new().to_bytes()
                    };
                    self.sink.send(reply).await?;
                }
                Ok(())
            }
            GlobalRequestType::Unknown { name, .. } => {
                info!(request = %name, "unsupported global request");
                if request.want_reply() {
                    self.sink.send(RequestFailure::new().to_bytes()).await?;
                }
                Ok(())
            }
        }
    }

    async fn bind_forward(&mut self, address: &str, port: u32) -> KeelResult<u32> {
        let bind_addr = format!("{}:{}", address, port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(KeelError::Io)?;
        let bound_port = listener.local_addr().map_err(KeelError::Io)?.port() as u32;
        info!(%address, bound_port, "tcpip-forward listening");

        // Accepted sockets flow to the session loop, which opens a
        // forwarded-tcpip channel for each.
        let accept_tx = self.accept_tx.clone();
        let address_owned = address.to_string();
        let listener_task = {
            let address = address_owned.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, originator)) => {
                            let accepted = AcceptedForward {
                                address: address.clone(),
                                port: bound_port,
                                stream,
                                originator,
                            };
                            if accept_tx.send(accepted).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "forward listener accept failed");
                            break;
                        }
                    }
                }
            })
        };

        self.bound_forwards.insert(
            (address_owned, port),
            BoundForward {
                listener_task,
                port: bound_port,
            },
        );
        Ok(bound_port)
    }

    /// Opens a forwarded-tcpip channel for an accepted socket.
    pub async fn open_forwarded(
        &mut self,
        address: &str,
        port: u32,
        originator: std::net::SocketAddr,
        stream: TcpStream,
    ) -> KeelResult<()> {
        let local_id = self.allocate_id();
        let local_window = Arc::new(Window::init(self.window_size, self.packet_size));
        // The remote window opens at zero and is funded by the
        // confirmation message.
        let remote_window = Arc::new(Window::init(0, self.packet_size));
        let (core, events) = ChannelCore::new(
            local_id,
            0,
            ChannelVariant::ForwardedTcpip {
                address: address.to_string(),
                port,
            },
            local_window,
            remote_window,
        );

        self.channels.insert(
            local_id,
            ChannelEntry {
                core,
                events: Some(events),
                env: Vec::new(),
                pty: None,
                worker: None,
            },
        );
        self.pending_opens.insert(local_id, Completion::new());
        self.pending_sockets.insert(local_id, stream);

        let open = ChannelOpen::new(
            ChannelType::ForwardedTcpip {
                connected_address: address.to_string(),
                connected_port: port,
                originator_address: originator.ip().to_string(),
                originator_port: originator.port() as u32,
            },
            local_id,
            self.window_size,
            self.packet_size,
        );
        self.sink.send(open.to_bytes()).await
    }

    /// The port actually bound for a tcpip-forward request.
    pub fn forwarded_port(&self, address: &str, requested_port: u32) -> Option<u32> {
        self.bound_forwards
            .get(&(address.to_string(), requested_port))
            .map(|b| b.port)
    }

    /// Tears down every channel (session close): listeners stop first,
    /// then all channels close in parallel through a [`Closer`] graph,
    /// failing pending I/O and resolving close futures.
    pub async fn teardown(&mut self) {
        for (_, bound) in self.bound_forwards.drain() {
            bound.listener_task.abort();
        }
        for (_, pending) in self.pending_opens.drain() {
            pending.fail(KeelError::Channel("session closed".to_string()));
        }
        self.pending_sockets.clear();

        let mut units: Vec<CloseFn> = Vec::new();
        for (local_id, entry) in self.channels.drain() {
            let core = entry.core;
            let worker = entry.worker;
            units.push(Box::new(move |_immediate| {
                Box::pin(async move {
                    core.deliver_event(ChannelEvent::Close);
                    core.quiesce();
                    core.set_state(ChannelState::Closed);
                    core.close_future().set(());
                    if let Some(worker) = worker {
                        worker.abort();
                    }
                    debug!(local_id, "channel torn down with session");
                })
            }));
        }

        Closer::builder().parallel(units).build().close(true).await;
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("channels", &self.channels.len())
            .field("next_channel_id", &self.next_channel_id)
            .field("bound_forwards", &self.bound_forwards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::ExtendedDataType;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    #[async_trait::async_trait]
    impl PacketSink for RecordingSink {
        async fn send(&self, payload: Vec<u8>) -> KeelResult<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct EchoCommand;

    #[async_trait::async_trait]
    impl Command for EchoCommand {
        async fn run(self: Box<Self>, mut ctx: CommandContext) -> KeelResult<CommandExit> {
            while let Some(data) = ctx.stdin.recv().await {
                ctx.stdout.write(&data).await?;
            }
            Ok(CommandExit::Status(0))
        }
    }

    struct EchoFactory;

    impl CommandFactory for EchoFactory {
        fn create(&self, _command: Option<&str>) -> KeelResult<Box<dyn Command>> {
            Ok(Box::new(EchoCommand))
        }
    }

    fn service(sink: Arc<RecordingSink>) -> ConnectionService {
        ConnectionService::new(
            sink,
            2 * 1024 * 1024,
            32 * 1024,
            Some(Arc::new(EchoFactory)),
            Arc::new(AcceptAllForwarding),
        )
    }

    async fn open_session(svc: &mut ConnectionService, sender: u32) -> u32 {
        let open = ChannelOpen::new(ChannelType::Session, sender, 1024 * 1024, 32 * 1024);
        svc.handle_message(&open.to_bytes()).await.unwrap();
        svc.channel_count() as u32 - 1
    }

    #[tokio::test]
    async fn test_open_session_confirms() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());

        open_session(&mut svc, 9).await;
        assert_eq!(svc.channel_count(), 1);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let confirmation = ChannelOpenConfirmation::from_bytes(&sent[0]).unwrap();
        assert_eq!(confirmation.recipient_channel(), 9);
        assert_eq!(confirmation.initial_window_size(), 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_unknown_channel_type_refused() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());

        let mut buf = crate::ssh::buffer::Buffer::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_str("x11");
        buf.put_u32(3);
        buf.put_u32(1024);
        buf.put_u32(512);
        svc.handle_message(&buf.into_bytes()).await.unwrap();

        assert_eq!(svc.channel_count(), 0);
        let sent = sink.take();
        let failure = ChannelOpenFailure::from_bytes(&sent[0]).unwrap();
        assert_eq!(failure.recipient_channel(), 3);
        assert_eq!(
            failure.reason_code(),
            ChannelOpenFailureReason::UnknownChannelType
        );
    }

    #[tokio::test]
    async fn test_echo_shell_round_trip() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());
        let local_id = open_session(&mut svc, 0).await;
        sink.take();

        let shell = ChannelRequest::new(local_id, ChannelRequestType::Shell, true);
        svc.handle_message(&shell.to_bytes()).await.unwrap();

        let sent = sink.take();
        assert!(ChannelSuccess::from_bytes(&sent[0]).is_ok());

        let data = ChannelData::new(local_id, b"echo me\n".to_vec());
        svc.handle_message(&data.to_bytes()).await.unwrap();

        // Give the command task a beat to echo.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = sink.take();
        let echoed = ChannelData::from_bytes(&sent[0]).unwrap();
        assert_eq!(echoed.data(), b"echo me\n");
        assert_eq!(echoed.recipient_channel(), 0);
    }

    #[tokio::test]
    async fn test_data_on_unknown_channel_is_ignored() {
        let sink = RecordingSink::new();
        let mut svc = service(sink);
        let data = ChannelData::new(42, b"ghost".to_vec());
        assert!(svc.handle_message(&data.to_bytes()).await.is_ok());
    }

    #[tokio::test]
    async fn test_window_adjust_expands_remote() {
        let sink = RecordingSink::new();
        let mut svc = service(sink);
        let local_id = open_session(&mut svc, 0).await;

        let before = svc.channel(local_id).unwrap().remote_window().size();
        let adjust = ChannelWindowAdjust::new(local_id, 4096);
        svc.handle_message(&adjust.to_bytes()).await.unwrap();
        assert_eq!(
            svc.channel(local_id).unwrap().remote_window().size(),
            before + 4096
        );
    }

    #[tokio::test]
    async fn test_close_exchange_removes_channel() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());
        let local_id = open_session(&mut svc, 5).await;
        let core = svc.channel(local_id).unwrap().clone();
        sink.take();

        let close = ChannelClose::new(local_id);
        svc.handle_message(&close.to_bytes()).await.unwrap();

        assert_eq!(svc.channel_count(), 0);
        assert_eq!(core.state(), ChannelState::Closed);
        assert!(core.close_future().is_complete());

        // Our answering CLOSE went out exactly once.
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(ChannelClose::from_bytes(&sent[0]).is_ok());
    }

    #[tokio::test]
    async fn test_close_channel_idempotent() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());
        let local_id = open_session(&mut svc, 0).await;
        sink.take();

        svc.close_channel(local_id).await.unwrap();
        assert_eq!(sink.take().len(), 1);

        // Second close performs no I/O.
        svc.close_channel(local_id).await.unwrap();
        assert!(sink.take().is_empty());

        // Closing a removed channel is also a no-op.
        svc.close_channel(9999).await.unwrap();
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_request_fails() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());
        let local_id = open_session(&mut svc, 0).await;
        sink.take();

        let request = ChannelRequest::new(
            local_id,
            ChannelRequestType::Unknown {
                name: "auth-agent-req@openssh.com".to_string(),
                data: vec![],
            },
            true,
        );
        svc.handle_message(&request.to_bytes()).await.unwrap();

        let sent = sink.take();
        assert!(ChannelFailureMsg::from_bytes(&sent[0]).is_ok());
    }

    #[tokio::test]
    async fn test_forwarding_filter_rejects_direct_tcpip() {
        let sink = RecordingSink::new();
        let mut svc = ConnectionService::new(
            sink.clone(),
            1024 * 1024,
            32 * 1024,
            None,
            Arc::new(RejectAllForwarding),
        );

        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "127.0.0.1".to_string(),
                port: 80,
                originator_address: "10.0.0.1".to_string(),
                originator_port: 1234,
            },
            0,
            1024,
            512,
        );
        svc.handle_message(&open.to_bytes()).await.unwrap();

        let sent = sink.take();
        let failure = ChannelOpenFailure::from_bytes(&sent[0]).unwrap();
        assert_eq!(
            failure.reason_code(),
            ChannelOpenFailureReason::AdministrativelyProhibited
        );
    }

    #[tokio::test]
    async fn test_global_tcpip_forward_binds_and_cancels() {
        let sink = RecordingSink::new();
        let mut svc = service(sink.clone());

        let request = GlobalRequest::new(
            GlobalRequestType::TcpipForward {
                address: "127.0.0.1".to_string(),
                port: 0,
            },
            true,
        );
        svc.handle_message(&request.to_bytes()).await.unwrap();

        let sent = sink.take();
        let success = RequestSuccess::from_bytes(&sent[0]).unwrap();
        let port = success.port().unwrap();
        assert!(port > 0);
        assert_eq!(svc.forwarded_port("127.0.0.1", 0), Some(port));

        let cancel = GlobalRequest::new(
            GlobalRequestType::CancelTcpipForward {
                address: "127.0.0.1".to_string(),
                port: 0,
            },
            true,
        );
        svc.handle_message(&cancel.to_bytes()).await.unwrap();
        let sent = sink.take();
        assert!(RequestSuccess::from_bytes(&sent[0]).is_ok());
        assert_eq!(svc.forwarded_port("127.0.0.1", 0), None);
    }

    #[tokio::test]
    async fn test_teardown_resolves_close_futures() {
        let sink = RecordingSink::new();
        let mut svc = service(sink);
        let a = open_session(&mut svc, 0).await;
        let b = open_session(&mut svc, 1).await;
        let core_a = svc.channel(a).unwrap().clone();
        let core_b = svc.channel(b).unwrap().clone();

        svc.teardown().await;
        assert_eq!(svc.channel_count(), 0);
        assert!(core_a.close_future().is_complete());
        assert!(core_b.close_future().is_complete());
        assert!(core_a.local_window().is_closing());
    }

    #[tokio::test]
    async fn test_stderr_extended_data_delivery() {
        let sink = RecordingSink::new();
        let mut svc = service(sink);
        let local_id = open_session(&mut svc, 0).await;

        let data = ChannelExtendedData::new(local_id, ExtendedDataType::Stderr, b"oops".to_vec());
        svc.handle_message(&data.to_bytes()).await.unwrap();

        // Window was debited even though no consumer is attached yet.
        let window = svc.channel(local_id).unwrap().local_window();
        assert_eq!(window.size(), 2 * 1024 * 1024 - 4);
    }
}
