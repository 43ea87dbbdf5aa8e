use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};
use tracing::{debug, trace};

use crate::wire::MessageCodec;

/// Longest SASL line accepted from either side.
pub const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client did not open with a NUL byte")]
    MissingNul,

    #[error("authentication line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("{0} closed the connection during authentication")]
    Closed(&'static str),

    #[error("authentication did not complete in time")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// CRLF-delimited SASL lines.
///
/// On the inside endpoint the codec consumes the NUL byte that opens every
/// D-Bus connection; on the outside endpoint it emits one before the first
/// line it writes.
#[derive(Debug)]
pub struct AuthCodec {
    expect_nul: bool,
    emit_nul: bool,
}

impl AuthCodec {
    pub fn inside() -> Self {
        Self {
            expect_nul: true,
            emit_nul: false,
        }
    }

    pub fn outside() -> Self {
        Self {
            expect_nul: false,
            emit_nul: true,
        }
    }
}

impl Decoder for AuthCodec {
    type Item = Bytes;
    type Error = AuthError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, AuthError> {
        if self.expect_nul {
            match src.first() {
                None => return Ok(None),
                Some(0) => {
                    src.advance(1);
                    self.expect_nul = false;
                }
                Some(_) => return Err(AuthError::MissingNul),
            }
        }

        match src.windows(2).position(|w| w == b"\r\n") {
            Some(end) if end > MAX_LINE_LEN => Err(AuthError::LineTooLong),
            Some(end) => {
                let line = src.split_to(end).freeze();
                src.advance(2);
                Ok(Some(line))
            }
            None if src.len() > MAX_LINE_LEN => Err(AuthError::LineTooLong),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for AuthCodec {
    type Error = AuthError;

    fn encode(&mut self, line: Bytes, dst: &mut BytesMut) -> Result<(), AuthError> {
        if self.emit_nul {
            dst.put_u8(0);
            self.emit_nul = false;
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(&line);
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Relay the SASL exchange between the two endpoints and hand back both
/// streams framed for message traffic.
///
/// Client lines are forwarded one at a time and each bus reply is passed
/// back before the next line is read. `NEGOTIATE_UNIX_FD` is refused
/// locally so no descriptors are ever passed through. Bytes the client
/// pipelines after `BEGIN` stay buffered for the message codec.
pub async fn relay_handshake<C, B>(
    inside: C,
    outside: B,
) -> Result<(Framed<C, MessageCodec>, Framed<B, MessageCodec>), AuthError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = Framed::new(inside, AuthCodec::inside());
    let mut bus = Framed::new(outside, AuthCodec::outside());

    loop {
        let line = client.next().await.ok_or(AuthError::Closed("client"))??;
        trace!(line = %String::from_utf8_lossy(&line), "auth line from client");

        if line.starts_with(b"NEGOTIATE_UNIX_FD") {
            client.send(Bytes::from_static(b"ERROR")).await?;
            continue;
        }
        if &line[..] == b"BEGIN" {
            bus.send(line).await?;
            break;
        }

        bus.send(line).await?;
        let reply = bus.next().await.ok_or(AuthError::Closed("bus"))??;
        trace!(line = %String::from_utf8_lossy(&reply), "auth line from bus");
        client.send(reply).await?;
    }

    debug!("authentication relayed");
    Ok((into_messages(client), into_messages(bus)))
}

fn into_messages<T>(framed: Framed<T, AuthCodec>) -> Framed<T, MessageCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let old = framed.into_parts();
    let mut parts = FramedParts::new::<Bytes>(old.io, MessageCodec);
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    Framed::from_parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bus_handshake, client_handshake, MessageBuilder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn inside_codec_strips_nul_and_splits_lines() {
        let mut codec = AuthCodec::inside();
        let mut buf = BytesMut::from(&b"\0AUTH EXTERNAL 30\r\nBEG"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"AUTH EXTERNAL 30"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"IN\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"BEGIN"[..]);
    }

    #[test]
    fn inside_codec_requires_leading_nul() {
        let mut codec = AuthCodec::inside();
        let mut buf = BytesMut::from(&b"AUTH\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(AuthError::MissingNul)));
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut codec = AuthCodec::inside();
        let mut buf = BytesMut::from(&b"\0"[..]);
        buf.extend_from_slice(&vec![b'A'; MAX_LINE_LEN + 1]);
        assert!(matches!(codec.decode(&mut buf), Err(AuthError::LineTooLong)));
    }

    #[test]
    fn outside_codec_emits_nul_once() {
        let mut codec = AuthCodec::outside();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"AUTH"), &mut dst).unwrap();
        codec.encode(Bytes::from_static(b"BEGIN"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"\0AUTH\r\nBEGIN\r\n");
    }

    #[tokio::test]
    async fn handshake_is_relayed_and_pipelined_bytes_survive() {
        let (inside_proxy, mut client) = tokio::io::duplex(64 * 1024);
        let (outside_proxy, mut bus) = tokio::io::duplex(64 * 1024);

        let hello = MessageBuilder::method_call("/org/freedesktop/DBus", "org.freedesktop.DBus", "Hello")
            .destination("org.freedesktop.DBus")
            .build();
        let hello_clone = hello.clone();

        let client_side = tokio::spawn(async move {
            client_handshake(&mut client).await;
            client.write_all(&hello_clone).await.unwrap();
            client
        });
        let bus_side = tokio::spawn(async move {
            bus_handshake(&mut bus).await;
            bus
        });

        let (mut from_client, _to_bus) = relay_handshake(inside_proxy, outside_proxy).await.unwrap();
        let _client = client_side.await.unwrap();
        let _bus = bus_side.await.unwrap();

        let frame = from_client.next().await.unwrap().unwrap();
        assert_eq!(frame, hello);
    }

    #[tokio::test]
    async fn unix_fd_negotiation_is_refused_locally() {
        let (inside_proxy, mut client) = tokio::io::duplex(4096);
        let (outside_proxy, mut bus) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_handshake(inside_proxy, outside_proxy));

        client.write_all(b"\0NEGOTIATE_UNIX_FD\r\n").await.unwrap();
        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ERROR\r\n");

        client.write_all(b"BEGIN\r\n").await.unwrap();
        relay.await.unwrap().unwrap();

        let mut seen = [0u8; 8];
        bus.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"\0BEGIN\r\n");
    }

    #[tokio::test]
    async fn client_hangup_during_auth_is_an_error() {
        let (inside_proxy, client) = tokio::io::duplex(4096);
        let (outside_proxy, _bus) = tokio::io::duplex(4096);
        drop(client);
        let err = relay_handshake(inside_proxy, outside_proxy).await.unwrap_err();
        assert!(matches!(err, AuthError::Closed("client")), "{err}");
    }
}
