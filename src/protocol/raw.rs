use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::connection::Connection;
use crate::error::{ReceiveError, TransmitError};
use crate::message::{Message, MessageHeader};
use crate::protocol::{Protocol, ReadStream, Token, WriteStream};

/// A minimal length-prefixed framing without handshake. All numbers in network byte order:
///
/// ```ascii
/// 0:  frame length (u32), starting *after* the length itself
/// 4:  target (u64)
/// 12: route (u64)
/// 20: ttl (u8)
/// 21: priority (u8)
/// 22: timeout in millis (u32)
/// 26: msgno (u32)
/// 30: flags (u8): bit 0 - chirp
/// 31: body
/// ```
///
/// The largest accepted frame is the smaller of the protocol's own limit and the connection's
///  configured `maxmsg`.
pub struct RawProtocol {
    max_message_size: usize,
}

impl RawProtocol {
    const HEADER_LEN: usize = 8 + 8 + 1 + 1 + 4 + 4 + 1;
    const FLAG_CHIRP: u8 = 1;

    pub fn new(max_message_size: usize) -> RawProtocol {
        RawProtocol { max_message_size }
    }

    fn limit(&self, connection: &Connection) -> usize {
        self.max_message_size.min(connection.max_message_size())
    }

    fn encode(message: &Message, buf: &mut BytesMut) {
        let timeout_millis = u32::try_from(message.header.timeout.as_millis()).unwrap_or(u32::MAX);

        buf.put_u64(message.header.target);
        buf.put_u64(message.header.route);
        buf.put_u8(message.header.ttl);
        buf.put_u8(message.header.priority);
        buf.put_u32(timeout_millis);
        buf.put_u32(message.msgno);
        buf.put_u8(if message.is_chirp { Self::FLAG_CHIRP } else { 0 });
        buf.put_slice(&message.body);
    }

    fn decode(mut buf: &[u8], message: &mut Message) -> Result<(), ReceiveError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(ReceiveError::ProtocolDecode(format!("frame of {} bytes is shorter than the message header", buf.len())));
        }

        message.header = MessageHeader {
            target: buf.get_u64(),
            route: buf.get_u64(),
            ttl: buf.get_u8(),
            priority: buf.get_u8(),
            timeout: Duration::from_millis(buf.get_u32().into()),
        };
        message.msgno = buf.get_u32();
        message.is_chirp = buf.get_u8() & Self::FLAG_CHIRP != 0;
        message.is_fresh = false;
        message.body.clear();
        message.body.extend_from_slice(buf);
        Ok(())
    }
}

#[async_trait]
impl Protocol for RawProtocol {
    async fn get_token(&self, _connection: &Connection, _output: &mut WriteStream) -> anyhow::Result<Token> {
        Ok(Token::default())
    }

    async fn transmit(&self, connection: &Connection, _token: &Token, message: &Message, output: &mut WriteStream) -> Result<(), TransmitError> {
        let frame_len = Self::HEADER_LEN + message.body.len();
        let limit = self.limit(connection);
        if frame_len > limit {
            return Err(TransmitError::Other(anyhow::anyhow!("message of {} bytes exceeds the maximum of {}", frame_len, limit)));
        }
        let frame_len = u32::try_from(frame_len)
            .map_err(|e| TransmitError::Other(e.into()))?;

        let mut buf = BytesMut::with_capacity(4 + Self::HEADER_LEN + message.body.len());
        buf.put_u32(frame_len);
        Self::encode(message, &mut buf);

        trace!("writing frame of {} bytes", buf.len());
        output.write_all(&buf).await?;
        output.flush().await?;
        Ok(())
    }

    async fn receive(&self, connection: &Connection, input: &mut ReadStream) -> Result<Message, ReceiveError> {
        // EOF before the length prefix is an orderly close
        let frame_len = input.read_u32().await? as usize;
        let limit = self.limit(connection);
        if frame_len > limit {
            return Err(ReceiveError::ProtocolDecode(format!("frame of {} bytes exceeds the maximum of {}", frame_len, limit)));
        }

        let mut buf = vec![0u8; frame_len];
        input.read_exact(&mut buf).await
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => ReceiveError::ProtocolDecode(format!("connection closed inside a frame of {} bytes", frame_len)),
                _ => ReceiveError::Socket(e),
            })?;

        let mut message = connection.pool().acquire();
        if let Err(e) = Self::decode(&buf, &mut message) {
            connection.pool().release(message, crate::message::ReleaseReason::Undeliverable);
            return Err(e);
        }
        Ok(message)
    }

    async fn shut(&self, _connection: &Connection) -> anyhow::Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    use crate::config::TransportConfig;
    use crate::message::MessagePool;
    use super::*;

    fn connection() -> Connection {
        Connection::new(1, "xts://127.0.0.1:1".to_string(), &TransportConfig::default(), Arc::new(MessagePool::new(16, 4)), None)
    }

    #[tokio::test]
    async fn test_transmit_then_receive() {
        let protocol = RawProtocol::new(1024);
        let connection = connection();
        let (client, server) = tokio::io::duplex(4096);
        let mut output: WriteStream = Box::new(client);
        let mut input: ReadStream = Box::new(server);

        let mut message = Message::new(7, 8, b"PING");
        message.header.ttl = 3;
        message.header.priority = 4;
        message.header.timeout = Duration::from_millis(1500);
        message.msgno = 11;

        protocol.transmit(&connection, &Token::default(), &message, &mut output).await.unwrap();
        protocol.transmit(&connection, &Token::default(), &Message::chirp(), &mut output).await.unwrap();

        let received = protocol.receive(&connection, &mut input).await.unwrap();
        assert_eq!(received.header, message.header);
        assert_eq!(received.msgno, 11);
        assert_eq!(&received.body[..], b"PING");
        assert!(!received.is_chirp);
        assert!(!received.is_fresh);

        let received = protocol.receive(&connection, &mut input).await.unwrap();
        assert!(received.is_chirp);
        assert!(received.body.is_empty());
    }

    #[tokio::test]
    async fn test_transmit_too_big() {
        let protocol = RawProtocol::new(RawProtocol::HEADER_LEN + 2);
        let (client, _server) = tokio::io::duplex(4096);
        let mut output: WriteStream = Box::new(client);

        let result = protocol.transmit(&connection(), &Token::default(), &Message::new(1, 0, b"abc"), &mut output).await;
        assert!(matches!(result, Err(TransmitError::Other(_))));
    }

    #[rstest]
    #[case::too_short(vec![0,0,0,3, 1,2,3])]
    #[case::too_long(vec![0,1,0,0])]
    #[tokio::test]
    async fn test_receive_decode_error(#[case] frame: Vec<u8>) {
        let protocol = RawProtocol::new(1024);
        let connection = connection();
        let (mut client, server) = tokio::io::duplex(4096);
        let mut input: ReadStream = Box::new(server);

        client.write_all(&frame).await.unwrap();

        let result = protocol.receive(&connection, &mut input).await;
        assert!(matches!(result, Err(ReceiveError::ProtocolDecode(_))));
        assert_eq!(connection.pool().acquired(), connection.pool().released());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let protocol = RawProtocol::new(1024);
        let connection = Connection::new(1, "xts://127.0.0.1:1".to_string(), &TransportConfig::from_query("maxmsg=30"), Arc::new(MessagePool::new(16, 4)), None);
        let (client, server) = tokio::io::duplex(4096);
        let mut output: WriteStream = Box::new(client);
        let mut input: ReadStream = Box::new(server);

        protocol.transmit(&connection, &Token::default(), &Message::new(1, 0, b"abc"), &mut output).await.unwrap();
        let result = protocol.transmit(&connection, &Token::default(), &Message::new(1, 0, b"abcd"), &mut output).await;
        assert!(matches!(result, Err(TransmitError::Other(_))));

        assert_eq!(&protocol.receive(&connection, &mut input).await.unwrap().body[..], b"abc");

        // frames that exceed the limit are rejected on the receiving side as well
        let mut big = BytesMut::new();
        big.put_u32(31);
        output.write_all(&big).await.unwrap();
        let result = protocol.receive(&connection, &mut input).await;
        assert!(matches!(result, Err(ReceiveError::ProtocolDecode(_))));
    }

    #[tokio::test]
    async fn test_receive_truncated_frame() {
        let protocol = RawProtocol::new(1024);
        let (mut client, server) = tokio::io::duplex(4096);
        let mut input: ReadStream = Box::new(server);
        client.write_all(&[0, 0, 0, 40, 1, 2, 3]).await.unwrap();
        drop(client);

        let result = protocol.receive(&connection(), &mut input).await;
        let error = result.unwrap_err();
        assert!(!error.is_eof());
        assert!(matches!(error, ReceiveError::ProtocolDecode(_)));
    }

    #[tokio::test]
    async fn test_receive_eof() {
        let protocol = RawProtocol::new(1024);
        let (client, server) = tokio::io::duplex(4096);
        let mut input: ReadStream = Box::new(server);
        drop(client);

        let result = protocol.receive(&connection(), &mut input).await;
        assert!(result.unwrap_err().is_eof());
    }
}
