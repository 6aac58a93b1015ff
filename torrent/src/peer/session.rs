use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::{
    peer::wire::{self, Line, WireError},
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected message, expected {expected}")]
    UnexpectedMessage { expected: &'static str },

    #[error("request for piece {0} was choked")]
    Choked(usize),

    #[error("peer refused the connection at handshake")]
    Refused,
}

pub type Result<T> = std::result::Result<T, PeerError>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Handshake, bitfield, and request/response control exchanges.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);
/// Accumulating a piece's raw payload bytes.
const PAYLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// An inbound connection that has sent `ESTABLISH` but not yet been
/// admitted or refused. Splitting this out of `accept` lets the upload
/// server apply its slot discipline before committing to a session, so a
/// denied peer is choked and dropped without ever exchanging bitfields.
pub struct PendingHandshake {
    stream: TcpStream,
    address: SocketAddr,
    peer_id: Option<String>,
}

impl PendingHandshake {
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Replies `ESTABLISHED` and hands back a usable session.
    pub fn admit(mut self) -> Result<PeerSession> {
        wire::write_line(&mut self.stream, &Line::Established)?;
        Ok(PeerSession {
            stream: self.stream,
            address: self.address,
            peer_choked: false,
            peer_id: self.peer_id,
        })
    }

    /// Replies `CHOKED` and drops the connection; no session is created.
    pub fn refuse(mut self) -> Result<()> {
        wire::write_line(&mut self.stream, &Line::Choked)?;
        Ok(())
    }
}

/// One point-to-point session with a peer, over a single blocking TCP
/// connection. Established either by dialing out (`connect`) or by
/// admitting a `PendingHandshake`.
pub struct PeerSession {
    stream: TcpStream,
    pub address: SocketAddr,
    pub peer_choked: bool,
    pub peer_id: Option<String>,
}

impl PeerSession {
    fn from_stream(stream: TcpStream, address: SocketAddr) -> Result<Self> {
        stream.set_read_timeout(Some(CONTROL_TIMEOUT))?;
        stream.set_write_timeout(Some(CONTROL_TIMEOUT))?;
        Ok(Self { stream, address, peer_choked: false, peer_id: None })
    }

    fn set_control_timeouts(&self) -> Result<()> {
        self.stream.set_read_timeout(Some(CONTROL_TIMEOUT))?;
        self.stream.set_write_timeout(Some(CONTROL_TIMEOUT))?;
        Ok(())
    }

    fn set_payload_timeouts(&self) -> Result<()> {
        self.stream.set_read_timeout(Some(PAYLOAD_TIMEOUT))?;
        self.stream.set_write_timeout(Some(PAYLOAD_TIMEOUT))?;
        Ok(())
    }

    /// Dials out to `address` and performs the ESTABLISH/ESTABLISHED
    /// handshake as the initiating side, identifying ourselves by
    /// `own_peer_id`. The remote may refuse with `CHOKED` if it has no
    /// free upload slot.
    pub fn connect(address: SocketAddr, own_peer_id: &str) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
        let mut session = Self::from_stream(stream, address)?;
        wire::write_line(&mut session.stream, &Line::Establish(Some(own_peer_id.to_string())))?;
        match wire::read_line(&mut session.stream)? {
            Line::Established => Ok(session),
            Line::Choked => Err(PeerError::Refused),
            _ => Err(PeerError::UnexpectedMessage { expected: "ESTABLISHED" }),
        }
    }

    /// Accepts an inbound connection as the responding side, reading the
    /// peer's `ESTABLISH` but deferring the admission decision to the
    /// caller — see `PendingHandshake`.
    pub fn accept(stream: TcpStream, address: SocketAddr) -> Result<PendingHandshake> {
        stream.set_read_timeout(Some(CONTROL_TIMEOUT))?;
        stream.set_write_timeout(Some(CONTROL_TIMEOUT))?;
        let mut stream = stream;
        match wire::read_line(&mut stream)? {
            Line::Establish(peer_id) => Ok(PendingHandshake { stream, address, peer_id }),
            _ => Err(PeerError::UnexpectedMessage { expected: "ESTABLISH" }),
        }
    }

    pub fn send_bitfield(&mut self, bits: &Bitfield) -> Result<()> {
        wire::write_line(&mut self.stream, &Line::Bitfield(wire::encode_bitfield(bits)))?;
        Ok(())
    }

    pub fn recv_bitfield(&mut self, num_pieces: usize) -> Result<Bitfield> {
        match wire::read_line(&mut self.stream)? {
            Line::Bitfield(hex) => Ok(wire::decode_bitfield(&hex, num_pieces)?),
            _ => Err(PeerError::UnexpectedMessage { expected: "BITFIELD" }),
        }
    }

    /// Requests piece `index` and blocks for the reply: either the raw
    /// piece bytes, or an error if the peer choked us.
    pub fn request_piece(&mut self, index: usize) -> Result<Vec<u8>> {
        wire::write_line(&mut self.stream, &Line::Request(index))?;
        match wire::read_line(&mut self.stream)? {
            Line::Choked => {
                self.peer_choked = true;
                Err(PeerError::Choked(index))
            }
            Line::Piece { index: returned_index, length } => {
                self.set_payload_timeouts()?;
                let mut buf = vec![0u8; length];
                let read_result = self.stream.read_exact(&mut buf);
                self.set_control_timeouts()?;
                read_result?;
                debug_assert_eq!(returned_index, index);
                Ok(buf)
            }
            _ => Err(PeerError::UnexpectedMessage { expected: "PIECE or CHOKED" }),
        }
    }

    /// Reads the next request from this peer, blocking until one
    /// arrives. Used by the upload server's per-connection handler loop.
    pub fn recv_request(&mut self) -> Result<usize> {
        match wire::read_line(&mut self.stream)? {
            Line::Request(index) => Ok(index),
            _ => Err(PeerError::UnexpectedMessage { expected: "REQUEST" }),
        }
    }

    pub fn send_choked(&mut self) -> Result<()> {
        wire::write_line(&mut self.stream, &Line::Choked)?;
        Ok(())
    }

    /// Sends the `PIECE:<index>:<length>` status line followed by the
    /// raw piece bytes.
    pub fn send_piece(&mut self, index: usize, data: &[u8]) -> Result<()> {
        wire::write_line(&mut self.stream, &Line::Piece { index, length: data.len() })?;
        self.set_payload_timeouts()?;
        let write_result = self.stream.write_all(data).and_then(|_| self.stream.flush());
        self.set_control_timeouts()?;
        write_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn handshake_and_piece_exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, peer_addr) = listener.accept().unwrap();
            let pending = PeerSession::accept(stream, peer_addr).unwrap();
            assert_eq!(pending.peer_id(), Some("client-1"));
            let mut session = pending.admit().unwrap();

            let mut bits = Bitfield::repeat(false, 4);
            bits.set(0, true);
            session.send_bitfield(&bits).unwrap();

            let index = session.recv_request().unwrap();
            session.send_piece(index, &[9u8; 10]).unwrap();
        });

        let mut client = PeerSession::connect(addr, "client-1").unwrap();
        let bits = client.recv_bitfield(4).unwrap();
        assert!(bits[0]);
        assert!(!bits[1]);

        let data = client.request_piece(0).unwrap();
        assert_eq!(data, vec![9u8; 10]);

        server.join().unwrap();
    }

    #[test]
    fn choked_request_surfaces_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, peer_addr) = listener.accept().unwrap();
            let mut session = PeerSession::accept(stream, peer_addr).unwrap().admit().unwrap();
            let _ = session.recv_request().unwrap();
            session.send_choked().unwrap();
        });

        let mut client = PeerSession::connect(addr, "client-2").unwrap();
        let err = client.request_piece(2).unwrap_err();
        assert!(matches!(err, PeerError::Choked(2)));

        server.join().unwrap();
    }

    #[test]
    fn refused_handshake_surfaces_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, peer_addr) = listener.accept().unwrap();
            let pending = PeerSession::accept(stream, peer_addr).unwrap();
            pending.refuse().unwrap();
        });

        let err = PeerSession::connect(addr, "client-3").unwrap_err();
        assert!(matches!(err, PeerError::Refused));

        server.join().unwrap();
    }
}
