//! Blocking, newline-delimited JSON message channel.
//!
//! The job host runs one OS thread per session, so its side of the channel is
//! plain blocking I/O. The client side speaks the same framing over tokio.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {source} (line starts with {preview:?})")]
    Decode {
        preview: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A connected, ordered, reliable session channel.
pub trait Transport {
    /// Next message from the peer, or `None` once the peer has closed.
    fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError>;

    fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError>;

    /// Flush and shut the connection down. Further sends fail.
    fn close(&mut self);

    /// Whether the peer is still connected. Never blocks.
    fn is_alive(&mut self) -> bool;
}

/// Stream sockets a [`MessageStream`] can run over.
pub trait Socket: Read + Write + Sized {
    fn try_clone_socket(&self) -> io::Result<Self>;
    fn set_nonblocking_socket(&self, nonblocking: bool) -> io::Result<()>;
    fn shutdown_socket(&self) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn try_clone_socket(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_nonblocking_socket(&self, nonblocking: bool) -> io::Result<()> {
        self.set_nonblocking(nonblocking)
    }

    fn shutdown_socket(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Socket for UnixStream {
    fn try_clone_socket(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_nonblocking_socket(&self, nonblocking: bool) -> io::Result<()> {
        self.set_nonblocking(nonblocking)
    }

    fn shutdown_socket(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

const PREVIEW_CHARS: usize = 64;

/// JSON-lines [`Transport`] over a stream socket.
pub struct MessageStream<S: Socket> {
    reader: BufReader<S>,
    writer: BufWriter<S>,
    closed: bool,
}

impl<S: Socket> MessageStream<S> {
    pub fn new(socket: S) -> io::Result<Self> {
        let writer = socket.try_clone_socket()?;
        Ok(Self {
            reader: BufReader::new(socket),
            writer: BufWriter::new(writer),
            closed: false,
        })
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }
}

impl<S: Socket> Transport for MessageStream<S> {
    fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim_end())
            .map(Some)
            .map_err(|source| TransportError::Decode {
                preview: line.chars().take(PREVIEW_CHARS).collect(),
                source,
            })
    }

    fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        serde_json::to_writer(&mut self.writer, message).map_err(TransportError::Encode)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.flush();
        let _ = self.reader.get_ref().shutdown_socket();
    }

    fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if !self.reader.buffer().is_empty() {
            return true;
        }
        if self.reader.get_ref().set_nonblocking_socket(true).is_err() {
            return false;
        }
        // Anything read here stays in the BufReader for the next recv.
        let alive = match self.reader.fill_buf() {
            Ok(buf) => !buf.is_empty(),
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        };
        let restored = self.reader.get_ref().set_nonblocking_socket(false).is_ok();
        alive && restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};

    fn pair() -> (MessageStream<UnixStream>, MessageStream<UnixStream>) {
        let (a, b) = UnixStream::pair().unwrap();
        (MessageStream::new(a).unwrap(), MessageStream::new(b).unwrap())
    }

    #[test]
    fn test_send_and_recv_in_order() {
        let (mut client, mut server) = pair();
        client.send(&ClientMessage::ListJobs).unwrap();
        client.send(&ClientMessage::SyncOnly).unwrap();
        assert_eq!(server.recv::<ClientMessage>().unwrap(), Some(ClientMessage::ListJobs));
        assert_eq!(server.recv::<ClientMessage>().unwrap(), Some(ClientMessage::SyncOnly));
    }

    #[test]
    fn test_recv_after_peer_close_is_none() {
        let (mut client, mut server) = pair();
        client.close();
        assert!(server.recv::<ClientMessage>().unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_is_decode_error() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut raw = a;
        raw.write_all(b"{not json}\n").unwrap();
        let mut server = MessageStream::new(b).unwrap();
        let err = server.recv::<ClientMessage>().unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[test]
    fn test_is_alive_tracks_peer() {
        let (client, mut server) = pair();
        assert!(server.is_alive());
        drop(client);
        assert!(!server.is_alive());
    }

    #[test]
    fn test_is_alive_keeps_pending_data() {
        let (mut client, mut server) = pair();
        client
            .send(&ServerMessage::Output { chunk: "hi".into() })
            .unwrap();
        assert!(server.is_alive());
        assert_eq!(
            server.recv::<ServerMessage>().unwrap(),
            Some(ServerMessage::Output { chunk: "hi".into() })
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_client, mut server) = pair();
        server.close();
        server.close();
        assert!(!server.is_alive());
        assert!(server.send(&ServerMessage::Output { chunk: "x".into() }).is_err());
    }
}
