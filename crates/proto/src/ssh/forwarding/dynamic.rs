//! Dynamic port forwarding (SOCKS5 proxy).
//!
//! Creates a SOCKS5 proxy server that forwards connections through the
//! SSH tunnel:
//!
//! 1. Listen on a local address as a SOCKS5 proxy
//! 2. Client connects and performs the SOCKS5 handshake
//! 3. Extract the target host and port from the SOCKS5 request
//! 4. Open a `direct-tcpip` channel to the target
//! 5. Relay data bidirectionally
//!
//! Only the CONNECT command with no authentication is supported.

use crate::ssh::channel::{relay_streams, ChannelStdin, ChannelWriter};
use keel_platform::{KeelError, KeelResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opens direct-tcpip channels on behalf of the proxy; implemented by the
/// SSH client.
#[async_trait::async_trait]
pub trait DirectTcpipOpener: Send + Sync {
    /// Opens a direct-tcpip channel to `host:port` and returns its
    /// streams.
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: SocketAddr,
    ) -> KeelResult<(ChannelWriter, ChannelStdin)>;
}

/// A running SOCKS5 proxy bound to a local port.
pub struct DynamicForward {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl DynamicForward {
    /// Binds `addr` and starts accepting SOCKS5 clients.
    pub async fn start(addr: &str, opener: Arc<dyn DirectTcpipOpener>) -> KeelResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(KeelError::Io)?;
        let local_addr = listener.local_addr().map_err(KeelError::Io)?;
        info!(%local_addr, "SOCKS5 proxy listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let opener = Arc::clone(&opener);
                        tokio::spawn(async move {
                            if let Err(e) = serve_socks_client(stream, peer, opener).await {
                                debug!(peer = %peer, error = %e, "SOCKS5 session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "SOCKS5 accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// The proxy's bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the proxy; further connection attempts are refused.
    pub fn stop(self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for DynamicForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicForward")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn serve_socks_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    opener: Arc<dyn DirectTcpipOpener>,
) -> KeelResult<()> {
    let (host, port) = socks5_handshake(&mut stream).await?;
    debug!(peer = %peer, target = %format!("{}:{}", host, port), "SOCKS5 connect");

    match opener.open_direct_tcpip(&host, port as u32, peer).await {
        Ok((writer, stdin)) => {
            socks5_send_success(&mut stream).await?;
            let (read_half, write_half) = stream.into_split();
            relay_streams(writer, stdin, read_half, write_half).await
        }
        Err(e) => {
            socks5_send_error(&mut stream, 5).await?;
            Err(e)
        }
    }
}

/// Handles the SOCKS5 handshake and returns the target address.
///
/// ```text
/// Client -> Server: [version, nmethods, methods...]
/// Server -> Client: [version, method]
/// Client -> Server: [version, command, reserved, address_type, address, port]
/// Server -> Client: [version, status, reserved, address_type, address, port]
/// ```
async fn socks5_handshake(stream: &mut TcpStream) -> KeelResult<(String, u16)> {
    let mut buf = [0u8; 257];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != 5 {
        return Err(KeelError::Protocol(format!(
            "Invalid SOCKS version: expected 5, got {}",
            buf[0]
        )));
    }

    let nmethods = buf[1] as usize;
    if nmethods == 0 {
        return Err(KeelError::Protocol(
            "No authentication methods provided".to_string(),
        ));
    }
    stream.read_exact(&mut buf[..nmethods]).await?;

    // 0x00 = no authentication required
    stream.write_all(&[5, 0]).await?;

    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != 5 {
        return Err(KeelError::Protocol(
            "Invalid SOCKS version in request".to_string(),
        ));
    }
    if buf[1] != 1 {
        return Err(KeelError::Protocol(format!(
            "Unsupported SOCKS command: {} (only CONNECT supported)",
            buf[1]
        )));
    }

    let address_type = buf[3];
    let (host, port) = match address_type {
        1 => {
            stream.read_exact(&mut buf[..6]).await?;
            let ip = format!("{}.{}.{}.{}", buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip, port)
        }
        3 => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len + 2]).await?;
            let host = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            (host, port)
        }
        4 => {
            stream.read_exact(&mut buf[..18]).await?;
            let mut segments = [0u16; 8];
            for (i, segment) in segments.iter_mut().enumerate() {
                *segment = u16::from_be_bytes([buf[i * 2], buf[i * 2 + 1]]);
            }
            let ip = std::net::Ipv6Addr::from(segments).to_string();
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (ip, port)
        }
        _ => {
            return Err(KeelError::Protocol(format!(
                "Invalid address type: {}",
                address_type
            )))
        }
    };

    Ok((host, port))
}

async fn socks5_send_success(stream: &mut TcpStream) -> KeelResult<()> {
    stream
        .write_all(&[
            5, 0, 0, 1, // version, success, reserved, IPv4
            0, 0, 0, 0, // bound address (0.0.0.0)
            0, 0, // bound port (0)
        ])
        .await?;
    Ok(())
}

async fn socks5_send_error(stream: &mut TcpStream, error_code: u8) -> KeelResult<()> {
    // 0x01 general failure, 0x03 network unreachable, 0x05 refused
    stream
        .write_all(&[5, error_code, 0, 1, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_socks5_handshake_ipv4() {
        let (mut client, mut server) = handshake_pair().await;

        let handshake = tokio::spawn(async move { socks5_handshake(&mut server).await });

        // greeting: version 5, one method (no auth)
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        // CONNECT to 127.0.0.1:7777
        client
            .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0x1e, 0x61])
            .await
            .unwrap();

        let (host, port) = handshake.await.unwrap().unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 7777);
    }

    #[tokio::test]
    async fn test_socks5_handshake_domain() {
        let (mut client, mut server) = handshake_pair().await;

        let handshake = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let mut request = vec![5, 1, 0, 3, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (host, port) = handshake.await.unwrap().unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn test_socks5_rejects_wrong_version() {
        let (mut client, mut server) = handshake_pair().await;
        let handshake = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[4, 1, 0]).await.unwrap();
        assert!(handshake.await.unwrap().is_err());
    }
}
