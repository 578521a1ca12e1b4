//! Connection validation handshake
//!
//! The server speaks first with its buffer sizes and GUID, the client answers
//! with its own sizes and priority, and the server confirms with a status.
//! Only after a successful exchange is a [`Transport`](super::Transport)
//! started on the stream.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{TransportError, TransportResult};
use crate::protocol::{
    ClientValidation, Command, Decoder, Encoder, Frame, ServerValidation, Status,
};

/// A stream with frame decoding, used before the transport tasks own it
pub struct Framed<S> {
    stream: S,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    last_version: u8,
}

impl<S> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, encoder: Encoder, max_payload_size: usize) -> Self {
        Self {
            stream,
            encoder: encoder.with_max_payload(max_payload_size),
            decoder: Decoder::with_max_payload(max_payload_size),
            read_buf: BytesMut::with_capacity(4096),
            last_version: 0,
        }
    }

    /// Read the next complete frame
    pub async fn read_frame(&mut self) -> TransportResult<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.last_version = frame.version;
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Write one message and flush it
    pub async fn write_message(&mut self, command: Command, payload: &[u8]) -> TransportResult<()> {
        let mut buf = BytesMut::with_capacity(payload.len() + crate::protocol::HEADER_SIZE);
        self.encoder.encode(command, payload, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Protocol revision from the last frame the peer sent
    pub fn peer_revision(&self) -> u8 {
        self.last_version
    }

    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    /// Stream, decoder state and any bytes already read past the handshake
    pub fn into_parts(self) -> (S, Decoder, BytesMut) {
        (self.stream, self.decoder, self.read_buf)
    }
}

fn expect(frame: &Frame, command: Command) -> TransportResult<()> {
    match frame.command() {
        Ok(c) if c == command => Ok(()),
        _ => Err(TransportError::HandshakeFailed(format!(
            "expected {}, got command {:#04x}",
            command, frame.command
        ))),
    }
}

/// Server side: announce, read the client's answer, confirm
pub async fn accept_handshake<S>(
    framed: &mut Framed<S>,
    local: &ServerValidation,
) -> TransportResult<ClientValidation>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .write_message(Command::ConnectionValidation, &local.encode())
        .await?;

    let frame = framed.read_frame().await?;
    expect(&frame, Command::ConnectionValidation)?;
    let answer = ClientValidation::decode(frame.payload)?;

    let mut status = BytesMut::new();
    Status::ok().serialize(&mut status);
    framed
        .write_message(Command::ConnectionValidated, &status)
        .await?;

    tracing::debug!(
        "Client validated: buffer={} registry={} priority={}",
        answer.receive_buffer_size,
        answer.registry_max_size,
        answer.priority
    );
    Ok(answer)
}

/// Client side: read the announcement, answer, await the confirmation
pub async fn connect_handshake<S>(
    framed: &mut Framed<S>,
    local: &ClientValidation,
) -> TransportResult<ServerValidation>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed.read_frame().await?;
    expect(&frame, Command::ConnectionValidation)?;
    let announcement = ServerValidation::decode(frame.payload)?;

    framed
        .write_message(Command::ConnectionValidation, &local.encode())
        .await?;

    let frame = framed.read_frame().await?;
    expect(&frame, Command::ConnectionValidated)?;
    let mut payload: Bytes = frame.payload;
    let status = Status::deserialize(&mut payload)?;
    if !status.is_success() {
        return Err(TransportError::HandshakeFailed(status.to_string()));
    }

    tracing::debug!("Server validated, guid {}", announcement.server_guid);
    Ok(announcement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let server_guid = Uuid::new_v4();

        let server = tokio::spawn(async move {
            let mut framed = Framed::new(a, Encoder::server(), DEFAULT_MAX_PAYLOAD_SIZE);
            let local = ServerValidation {
                receive_buffer_size: 8192,
                registry_max_size: 100,
                server_guid,
            };
            accept_handshake(&mut framed, &local).await.unwrap()
        });

        let mut framed = Framed::new(b, Encoder::client(), DEFAULT_MAX_PAYLOAD_SIZE);
        let local = ClientValidation {
            receive_buffer_size: 4096,
            registry_max_size: 50,
            priority: 3,
        };
        let announcement = connect_handshake(&mut framed, &local).await.unwrap();
        assert_eq!(announcement.server_guid, server_guid);
        assert_eq!(announcement.registry_max_size, 100);

        let answer = server.await.unwrap();
        assert_eq!(answer.priority, 3);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_command() {
        let (a, b) = tokio::io::duplex(4096);
        let mut peer = Framed::new(a, Encoder::server(), DEFAULT_MAX_PAYLOAD_SIZE);
        peer.write_message(Command::Echo, b"hi").await.unwrap();

        let mut framed = Framed::new(b, Encoder::client(), DEFAULT_MAX_PAYLOAD_SIZE);
        let local = ClientValidation {
            receive_buffer_size: 4096,
            registry_max_size: 50,
            priority: 0,
        };
        assert!(matches!(
            connect_handshake(&mut framed, &local).await,
            Err(TransportError::HandshakeFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_during_handshake() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut framed = Framed::new(b, Encoder::client(), DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(matches!(
            framed.read_frame().await,
            Err(TransportError::Closed)
        ));
    }
}
