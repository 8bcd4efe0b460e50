//! Send/receive FailOver messages on a TCP control connection.
//!
//! `Connection` wraps a buffered `TcpStream` and exposes frame-level
//! operations; the byte-level protocol details live in [`crate::protocol`].
//! This plays the role the spec's §2 "Connection layer" names as an
//! external dependency (bounded-time connect, framed read/write); we
//! implement it directly against `tokio::net::TcpStream` rather than
//! pulling in a separate RPC crate, the way the teacher's own `Connection`
//! wraps a raw socket.

use std::io;
use std::time::Duration;

use tokio::io::BufWriter;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::FailoverError;
use crate::protocol::{self, Reply, Request};

#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection { stream: BufWriter::new(socket) }
    }

    /// Connects with a bounded timeout, the way every connect attempt in
    /// the state machines does (4s takeover probe, 5s default, 8s final
    /// retry — spec §5). Platforms this crate targets have a real
    /// non-blocking-connect-with-deadline primitive via `tokio::time::timeout`,
    /// so there's no need for the original's `SIGALRM` workaround (spec §9).
    pub async fn connect_timeout<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> Result<Connection, FailoverError> {
        let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FailoverError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))??;
        Ok(Connection::new(socket))
    }

    pub async fn write_request(&mut self, req: Request) -> Result<(), FailoverError> {
        protocol::write_request(&mut self.stream, req).await
    }

    pub async fn read_request(&mut self) -> Result<Request, FailoverError> {
        protocol::read_request(&mut self.stream).await
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<(), FailoverError> {
        protocol::write_reply(&mut self.stream, reply).await
    }

    pub async fn read_reply(&mut self) -> Result<Reply, FailoverError> {
        protocol::read_reply(&mut self.stream).await
    }

    pub async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.get_mut().shutdown().await;
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.get_ref().peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReplyCode, Subtype};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_reply_round_trip_over_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            let req = conn.read_request().await.unwrap();
            assert_eq!(req.subtype, Subtype::Register);
            conn.write_reply(&Reply::ok_with_text("42")).await.unwrap();
        });

        let mut client = Connection::connect_timeout(addr, Duration::from_secs(1)).await.unwrap();
        client.write_request(Request { subtype: Subtype::Register }).await.unwrap();
        let reply = client.read_reply().await.unwrap();
        assert_eq!(reply.code, ReplyCode::Ok);
        assert_eq!(reply.text.as_deref(), Some("42"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_timeout_fails_fast_against_unroutable_address() {
        let err = Connection::connect_timeout("10.255.255.1:1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::Io(_)));
    }
}
