//! Channel state, variants and stream plumbing.
//!
//! A [`ChannelCore`] owns what every channel shares: local/remote ids, the
//! paired flow-control windows, lifecycle state, EOF bookkeeping and the
//! close future. Type-specific state lives in [`ChannelVariant`] — a
//! tagged enum rather than a subclass tree — and per-request behavior is
//! provided by the connection service.
//!
//! Streaming modes exposed to commands and subsystems:
//!
//! - **sync**: the embedder supplies `AsyncRead`/`AsyncWrite` halves and
//!   [`relay_streams`] pumps them against the channel;
//! - **inverted**: the channel owns the pipe; the embedder reads from
//!   [`ChannelStdin`] and writes through [`ChannelWriter`];
//! - **async**: [`AsyncChannelReader`]/[`AsyncChannelWriter`] hand out
//!   completion cells. One read may be pending per reader at a time; a
//!   second concurrent read fails its future synchronously.

use crate::ssh::connection::{
    ChannelData, ChannelEof, ChannelExtendedData, ChannelRequest, ExtendedDataType,
};
use crate::ssh::window::Window;
use keel_platform::{CloseFuture, Completion, KeelError, KeelResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// OPEN sent or received, confirmation outstanding.
    Opening,
    /// Confirmed; data may flow.
    Open,
    /// Close initiated; draining.
    Closing,
    /// CLOSE exchange complete; the id is free.
    Closed,
}

/// Type-specific channel state.
#[derive(Debug, Clone)]
pub enum ChannelVariant {
    /// Interactive session: shell, exec or subsystem.
    Session {
        /// Accumulated env requests, applied when the command starts.
        env: Vec<(String, String)>,
        /// Terminal geometry from pty-req / window-change.
        pty: Option<PtyRequest>,
    },
    /// Client-requested outbound TCP connection.
    DirectTcpip {
        /// Target host.
        host: String,
        /// Target port.
        port: u32,
    },
    /// Server-accepted socket for a bound tcpip-forward listener.
    ForwardedTcpip {
        /// Listener address.
        address: String,
        /// Listener port.
        port: u32,
    },
}

/// Terminal parameters from a pty-req.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type (e.g. "xterm").
    pub term: String,
    /// Width in characters.
    pub width_chars: u32,
    /// Height in rows.
    pub height_rows: u32,
    /// Encoded terminal modes.
    pub modes: Vec<u8>,
}

/// Events delivered to a channel consumer, in wire order.
#[derive(Debug)]
pub enum ChannelEvent {
    /// CHANNEL_DATA payload.
    Data(Vec<u8>),
    /// CHANNEL_EXTENDED_DATA payload (stderr).
    ExtendedData(Vec<u8>),
    /// Peer sent EOF; no more data will arrive.
    Eof,
    /// Peer closed the channel.
    Close,
    /// Reply to one of our channel requests.
    RequestSuccess,
    /// Negative reply to one of our channel requests.
    RequestFailure,
    /// An inbound channel request to handle.
    Request(ChannelRequest),
}

/// Serialized outbound packet path shared by every writer on a session.
///
/// Implemented by the session; any task may send and will be serialized
/// behind the session's write mutex.
#[async_trait::async_trait]
pub trait PacketSink: Send + Sync {
    /// Queues one payload for transmission.
    async fn send(&self, payload: Vec<u8>) -> KeelResult<()>;
}

/// Shared channel bookkeeping.
pub struct ChannelCore {
    local_id: u32,
    remote_id: u32,
    variant: ChannelVariant,
    state: Mutex<ChannelState>,
    /// Credit the peer may still send us.
    local_window: Arc<Window>,
    /// Credit we may still send the peer.
    remote_window: Arc<Window>,
    eof_sent: AtomicBool,
    eof_received: AtomicBool,
    close_sent: AtomicBool,
    close_future: CloseFuture,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelCore {
    /// Creates the core and the event receiver its consumer reads from.
    pub fn new(
        local_id: u32,
        remote_id: u32,
        variant: ChannelVariant,
        local_window: Arc<Window>,
        remote_window: Arc<Window>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            local_id,
            remote_id,
            variant,
            state: Mutex::new(ChannelState::Opening),
            local_window,
            remote_window,
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_future: CloseFuture::new(),
            events: tx,
        });
        (core, rx)
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Remote (recipient) channel id.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Type-specific state.
    pub fn variant(&self) -> &ChannelVariant {
        &self.variant
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state poisoned")
    }

    /// Moves to a new lifecycle state.
    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("channel state poisoned") = state;
    }

    /// The window for data the peer sends us.
    pub fn local_window(&self) -> &Arc<Window> {
        &self.local_window
    }

    /// The window for data we send the peer.
    pub fn remote_window(&self) -> &Arc<Window> {
        &self.remote_window
    }

    /// Close future, complete after the CLOSE exchange and stream
    /// teardown.
    pub fn close_future(&self) -> &CloseFuture {
        &self.close_future
    }

    /// Records that we sent EOF. Returns false if it was already sent.
    pub fn mark_eof_sent(&self) -> bool {
        !self.eof_sent.swap(true, Ordering::SeqCst)
    }

    /// Records that the peer sent EOF.
    pub fn mark_eof_received(&self) -> bool {
        !self.eof_received.swap(true, Ordering::SeqCst)
    }

    /// Whether we already sent EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent.load(Ordering::SeqCst)
    }

    /// Whether the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received.load(Ordering::SeqCst)
    }

    /// Records that we sent CLOSE. Returns false if it was already sent,
    /// enforcing the send-exactly-once rule.
    pub fn mark_close_sent(&self) -> bool {
        !self.close_sent.swap(true, Ordering::SeqCst)
    }

    /// Delivers inbound data to the consumer, debiting the local window.
    ///
    /// Returns the window adjustment to advertise, if one is due.
    ///
    /// # Errors
    ///
    /// Propagates the flow violation when the peer overruns its credit.
    pub fn deliver_data(&self, data: Vec<u8>) -> KeelResult<Option<u32>> {
        let adjustment = self.local_window.consume_and_check(data.len() as u32)?;
        // A dropped receiver means the consumer is gone; data is discarded
        // but flow control stays correct.
        let _ = self.events.send(ChannelEvent::Data(data));
        Ok(adjustment)
    }

    /// Delivers inbound extended (stderr) data.
    pub fn deliver_extended_data(&self, data: Vec<u8>) -> KeelResult<Option<u32>> {
        let adjustment = self.local_window.consume_and_check(data.len() as u32)?;
        let _ = self.events.send(ChannelEvent::ExtendedData(data));
        Ok(adjustment)
    }

    /// Delivers a non-data event.
    pub fn deliver_event(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Fails pending I/O and quiesces both windows; called on close.
    pub fn quiesce(&self) {
        self.local_window.close();
        self.remote_window.close();
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Outbound data writer for one channel.
///
/// Waits on the remote window for credit and chunks writes to the
/// negotiated maximum packet size. Cloneable; all clones share the EOF
/// flag through the core.
#[derive(Clone)]
pub struct ChannelWriter {
    sink: Arc<dyn PacketSink>,
    core: Arc<ChannelCore>,
    max_packet: u32,
}

impl ChannelWriter {
    /// Creates a writer bound to a channel.
    pub fn new(sink: Arc<dyn PacketSink>, core: Arc<ChannelCore>, max_packet: u32) -> Self {
        Self {
            sink,
            core,
            max_packet: max_packet.max(1),
        }
    }

    /// The channel this writer feeds.
    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    /// The shared outbound packet path.
    pub fn clone_sink(&self) -> Arc<dyn PacketSink> {
        Arc::clone(&self.sink)
    }

    /// Writes all of `data`, blocking on window credit as needed.
    pub async fn write(&self, data: &[u8]) -> KeelResult<()> {
        self.write_stream(data, None).await
    }

    /// Writes all of `data` as extended (stderr) data.
    pub async fn write_stderr(&self, data: &[u8]) -> KeelResult<()> {
        self.write_stream(data, Some(ExtendedDataType::Stderr)).await
    }

    async fn write_stream(
        &self,
        data: &[u8],
        extended: Option<ExtendedDataType>,
    ) -> KeelResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let wanted = (data.len() - offset).min(self.max_packet as usize) as u32;
            // Partial credit still makes progress; a full chunk may
            // exceed even the peer's initial window.
            let chunk_len = self.core.remote_window().consume_up_to(wanted).await? as usize;

            let chunk = data[offset..offset + chunk_len].to_vec();
            let payload = match extended {
                None => ChannelData::new(self.core.remote_id(), chunk).to_bytes(),
                Some(kind) => {
                    ChannelExtendedData::new(self.core.remote_id(), kind, chunk).to_bytes()
                }
            };
            self.sink.send(payload).await?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Sends EOF once; later calls are no-ops.
    pub async fn send_eof(&self) -> KeelResult<()> {
        if self.core.mark_eof_sent() {
            self.sink
                .send(ChannelEof::new(self.core.remote_id()).to_bytes())
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("remote_id", &self.core.remote_id())
            .field("max_packet", &self.max_packet)
            .finish()
    }
}

/// Inbound data stream handed to a command (inverted mode: the channel
/// owns the pipe, the consumer reads this end).
pub struct ChannelStdin {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Carries stderr too when a consumer cares; plain reads skip it.
    buffered: Vec<u8>,
    eof: bool,
}

impl ChannelStdin {
    /// Wraps a channel event receiver.
    pub fn new(rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            rx,
            buffered: Vec::new(),
            eof: false,
        }
    }

    /// Receives the next raw event, or `None` once the sender is gone.
    /// Used by consumers that care about request replies; EOF/Close are
    /// latched so later [`recv`](Self::recv) calls still observe them.
    pub async fn recv_event(&mut self) -> Option<ChannelEvent> {
        let event = self.rx.recv().await;
        if matches!(
            event,
            Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None
        ) {
            self.eof = true;
        }
        event
    }

    /// Receives the next data payload, or `None` at EOF/close.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if !self.buffered.is_empty() {
            return Some(std::mem::take(&mut self.buffered));
        }
        if self.eof {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(ChannelEvent::Data(data)) => return Some(data),
                Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None => {
                    self.eof = true;
                    return None;
                }
                // Non-data events are not this consumer's concern.
                Some(_) => continue,
            }
        }
    }

    /// Reads up to `limit` bytes, buffering any excess.
    pub async fn read_up_to(&mut self, limit: usize) -> Option<Vec<u8>> {
        let mut data = self.recv().await?;
        if data.len() > limit {
            self.buffered = data.split_off(limit);
        }
        Some(data)
    }

    /// Returns data to the front of the stream (consumed while waiting
    /// for a request reply).
    pub fn push_back(&mut self, data: Vec<u8>) {
        let mut combined = data;
        combined.extend_from_slice(&self.buffered);
        self.buffered = combined;
    }
}

impl std::fmt::Debug for ChannelStdin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStdin")
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

struct AsyncReaderInner {
    stdin: tokio::sync::Mutex<ChannelStdin>,
    pending: AtomicBool,
}

/// Asynchronous read adapter: each read returns a completion that
/// resolves when any bytes are ready (empty result = EOF).
///
/// Exactly one read may be pending at a time; submitting a second
/// concurrent read is a programming error and fails the returned future
/// synchronously.
#[derive(Clone)]
pub struct AsyncChannelReader {
    inner: Arc<AsyncReaderInner>,
}

impl AsyncChannelReader {
    /// Wraps an inbound stream.
    pub fn new(stdin: ChannelStdin) -> Self {
        Self {
            inner: Arc::new(AsyncReaderInner {
                stdin: tokio::sync::Mutex::new(stdin),
                pending: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a read of at most `limit` bytes.
    pub fn read(&self, limit: usize) -> Completion<Vec<u8>> {
        let completion: Completion<Vec<u8>> = Completion::new();

        if self.inner.pending.swap(true, Ordering::SeqCst) {
            completion.fail(KeelError::Channel(
                "previous pending read".to_string(),
            ));
            return completion;
        }

        let inner = Arc::clone(&self.inner);
        let cell = completion.clone();
        tokio::spawn(async move {
            let result = {
                let mut stdin = inner.stdin.lock().await;
                stdin.read_up_to(limit).await
            };
            inner.pending.store(false, Ordering::SeqCst);
            cell.set(result.unwrap_or_default());
        });

        completion
    }
}

impl std::fmt::Debug for AsyncChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncChannelReader")
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

/// Asynchronous write adapter: each write returns a completion resolved
/// once the bytes have been framed onto the wire (window consumed).
#[derive(Clone, Debug)]
pub struct AsyncChannelWriter {
    writer: ChannelWriter,
}

impl AsyncChannelWriter {
    /// Wraps a channel writer.
    pub fn new(writer: ChannelWriter) -> Self {
        Self { writer }
    }

    /// Starts a write; the completion resolves when the data is sent.
    pub fn write(&self, data: Vec<u8>) -> Completion<()> {
        let completion: Completion<()> = Completion::new();
        let writer = self.writer.clone();
        let cell = completion.clone();
        tokio::spawn(async move {
            match writer.write(&data).await {
                Ok(()) => {
                    cell.set(());
                }
                Err(e) => {
                    cell.fail(e);
                }
            }
        });
        completion
    }
}

/// Pumps a synchronous stream pair against the channel: bytes read from
/// `reader` go out on the channel, inbound channel data goes to `writer`.
///
/// Returns when both directions have finished (peer EOF and local reader
/// EOF). Used for sync streaming mode and the TCP relays.
pub async fn relay_streams<R, W>(
    writer_half: ChannelWriter,
    mut stdin: ChannelStdin,
    mut reader: R,
    mut writer: W,
) -> KeelResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let outbound = {
        let writer_half = writer_half.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer_half.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "relay reader finished");
                        break;
                    }
                }
            }
            let _ = writer_half.send_eof().await;
        })
    };

    while let Some(data) = stdin.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(error = %e, "relay writer finished");
            break;
        }
    }
    let _ = writer.shutdown().await;

    outbound
        .await
        .map_err(|e| KeelError::Channel(format!("relay task failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
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

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl PacketSink for RecordingSink {
        async fn send(&self, payload: Vec<u8>) -> KeelResult<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn test_channel(
        window: u32,
        max_packet: u32,
    ) -> (
        Arc<ChannelCore>,
        mpsc::UnboundedReceiver<ChannelEvent>,
        Arc<RecordingSink>,
        ChannelWriter,
    ) {
        let (core, rx) = ChannelCore::new(
            0,
            7,
            ChannelVariant::Session {
                env: Vec::new(),
                pty: None,
            },
            Arc::new(Window::init(window, max_packet)),
            Arc::new(Window::init(window, max_packet)),
        );
        let sink = RecordingSink::new();
        let writer = ChannelWriter::new(sink.clone(), core.clone(), max_packet);
        (core, rx, sink, writer)
    }

    #[test]
    fn test_state_progression() {
        let (core, _rx, _sink, _w) = test_channel(1024, 256);
        assert_eq!(core.state(), ChannelState::Opening);
        core.set_state(ChannelState::Open);
        assert_eq!(core.state(), ChannelState::Open);
        core.set_state(ChannelState::Closing);
        core.set_state(ChannelState::Closed);
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[test]
    fn test_eof_and_close_once() {
        let (core, _rx, _sink, _w) = test_channel(1024, 256);
        assert!(core.mark_eof_sent());
        assert!(!core.mark_eof_sent());
        assert!(core.mark_close_sent());
        assert!(!core.mark_close_sent());
    }

    #[test]
    fn test_deliver_data_debits_window() {
        let (core, mut rx, _sink, _w) = test_channel(1000, 256);
        assert_eq!(core.deliver_data(vec![0u8; 300]).unwrap(), None);
        assert_eq!(core.local_window().size(), 700);

        // Crossing the half-window floor yields an adjustment back to the
        // initial size.
        let adjustment = core.deliver_data(vec![0u8; 300]).unwrap();
        assert_eq!(adjustment, Some(600));
        assert_eq!(core.local_window().size(), 1000);

        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::Data(_)));
    }

    #[tokio::test]
    async fn test_writer_chunks_to_max_packet() {
        let (_core, _rx, sink, writer) = test_channel(10_000, 100);
        writer.write(&vec![0xab; 250]).await.unwrap();
        // 250 bytes with max packet 100 => 3 CHANNEL_DATA packets
        assert_eq!(sink.count(), 3);
    }

    #[tokio::test]
    async fn test_writer_blocks_on_window() {
        let (core, _rx, sink, writer) = test_channel(100, 64);
        let handle = tokio::spawn(async move { writer.write(&vec![1u8; 200]).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert!(sink.count() >= 1);

        core.remote_window().expand(200);
        handle.await.unwrap().unwrap();
        // 64 + 36 under the first window grant, 64 + 36 after the adjust
        assert_eq!(sink.count(), 4);
    }

    #[tokio::test]
    async fn test_writer_eof_once() {
        let (_core, _rx, sink, writer) = test_channel(1024, 256);
        writer.send_eof().await.unwrap();
        writer.send_eof().await.unwrap();
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_stdin_reads_in_order_until_eof() {
        let (core, rx, _sink, _w) = test_channel(1024, 256);
        core.deliver_data(b"first".to_vec()).unwrap();
        core.deliver_data(b"second".to_vec()).unwrap();
        core.deliver_event(ChannelEvent::Eof);

        let mut stdin = ChannelStdin::new(rx);
        assert_eq!(stdin.recv().await.unwrap(), b"first");
        assert_eq!(stdin.recv().await.unwrap(), b"second");
        assert!(stdin.recv().await.is_none());
        assert!(stdin.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_async_reader_single_pending_read() {
        let (_core, rx, _sink, _w) = test_channel(1024, 256);
        let reader = AsyncChannelReader::new(ChannelStdin::new(rx));

        // No data delivered yet: the first read stays pending.
        let first = reader.read(64);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!first.is_complete());

        // A second concurrent read must fail synchronously.
        let second = reader.read(64);
        assert!(second.is_failed());
        let err = second.verify(Duration::from_millis(10)).await.unwrap_err();
        match err {
            KeelError::Channel(msg) => assert!(msg.contains("previous pending read")),
            other => panic!("Expected channel error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_reader_completes_then_allows_next() {
        let (core, rx, _sink, _w) = test_channel(1024, 256);
        let reader = AsyncChannelReader::new(ChannelStdin::new(rx));

        let read = reader.read(64);
        core.deliver_data(b"payload".to_vec()).unwrap();
        let data = read.verify(Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, b"payload");

        // The slot is free again.
        core.deliver_data(b"more".to_vec()).unwrap();
        let next = reader.read(64);
        assert_eq!(next.verify(Duration::from_secs(1)).await.unwrap(), b"more");
    }

    #[tokio::test]
    async fn test_async_reader_respects_limit() {
        let (core, rx, _sink, _w) = test_channel(1024, 256);
        let reader = AsyncChannelReader::new(ChannelStdin::new(rx));

        core.deliver_data(b"0123456789".to_vec()).unwrap();
        let first = reader.read(4).verify(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, b"0123");
        let rest = reader.read(64).verify(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rest, b"456789");
    }

    #[tokio::test]
    async fn test_async_writer_completion() {
        let (_core, _rx, sink, writer) = test_channel(1024, 256);
        let async_writer = AsyncChannelWriter::new(writer);
        let done = async_writer.write(b"hello".to_vec());
        done.verify(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sink.count(), 1);
    }
}
