//! Transport session owning the single server connection
//!
//! A thin wrapper over one `TcpStream`: connect, send, receive and close, with
//! no retry and no buffering beyond a single read. Framing is left to the
//! codec and the flows.
//!
//! Every send and receive races against a close signal, so `close()` unblocks
//! a receive that is waiting on a wedged server instead of waiting for it.
//! Any I/O failure drops the stream; later calls report `NotConnected` until
//! the next successful `connect`.

use crate::error::TransportError;
use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

pub struct Transport {
    stream: Mutex<Option<TcpStream>>,
    closed: watch::Sender<bool>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            stream: Mutex::new(None),
            closed,
        }
    }

    /// Opens the connection, replacing any previous stream
    ///
    /// `host` must be a literal IP address.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<SocketAddr, TransportError> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("{}:{}", host, port)))?;
        let addr = SocketAddr::new(ip, port);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Refused {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(TransportError::ConnectTimeout(addr.to_string())),
        };
        stream.set_nodelay(true)?;

        let mut guard = self.stream.lock().await;
        *guard = Some(stream);
        self.closed.send_replace(false);

        info!("Connected to server at {}", addr);
        Ok(addr)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = tokio::select! {
            res = stream.write_all(bytes) => res.map_err(TransportError::from),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        };

        if result.is_err() {
            guard.take();
        }
        result
    }

    /// Returns whatever a single read yields, up to `max_bytes`
    ///
    /// A zero-byte read means the peer hung up and is reported as `Closed`.
    pub async fn receive(&self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; max_bytes];

        let result = tokio::select! {
            res = stream.read(&mut buf) => res.map_err(TransportError::from),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        };

        match result {
            Ok(0) => {
                guard.take();
                Err(TransportError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                guard.take();
                Err(e)
            }
        }
    }

    /// Releases the socket; safe to call repeatedly or when never connected
    pub async fn close(&self) {
        self.closed.send_replace(true);
        if self.stream.lock().await.take().is_some() {
            debug!("Closing socket connection");
        }
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            socket
        });

        let transport = Transport::new();
        transport.connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        assert!(transport.is_open());

        transport.send(b"!s-iMCU-e!").await.unwrap();
        let reply = transport.receive(256).await.unwrap();
        assert_eq!(reply, b"!s-iMCU-e!");

        let _socket = server.await.unwrap();
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let transport = Transport::new();
        let result = transport.connect("not-an-ip", 54817, TIMEOUT).await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (listener, port) = listener().await;
        drop(listener);

        let transport = Transport::new();
        let result = transport.connect("127.0.0.1", port, TIMEOUT).await;
        assert!(matches!(
            result,
            Err(TransportError::Refused { .. }) | Err(TransportError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let transport = Transport::new();
        let result = transport.send(b"x").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let transport = Transport::new();
        transport.connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        server.await.unwrap();

        let result = transport.receive(256).await;
        assert!(matches!(result, Err(TransportError::Closed)));

        let result = transport.receive(256).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let transport = Arc::new(Transport::new());
        transport.connect("127.0.0.1", port, TIMEOUT).await.unwrap();

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive(256).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("receive should be unblocked by close")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        server.abort();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Transport::new();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
    }
}
