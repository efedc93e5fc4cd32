pub mod raw;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::Connection;
use crate::error::{ReceiveError, TransmitError};
use crate::message::Message;

pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Protocol specific session state, established once per connection by
///  [Protocol::get_token] and handed to every [Protocol::transmit] call afterwards
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Token(pub Bytes);

/// The hooks a concrete protocol variant plugs into the transport core. The core decides
///  *when* these are called, the implementation decides what goes over the wire.
///
/// A single instance is shared by all connections of a driver, so per-connection state
///  belongs in the [Token].
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// called once per connection by its transmit worker, before the first message is sent
    async fn get_token(&self, connection: &Connection, output: &mut WriteStream) -> anyhow::Result<Token>;

    /// Encodes and writes a single message. An error aborts the connection.
    async fn transmit(&self, connection: &Connection, token: &Token, message: &Message, output: &mut WriteStream) -> Result<(), TransmitError>;

    /// Blocks until a complete message is read and decoded. An error aborts the connection.
    async fn receive(&self, connection: &Connection, input: &mut ReadStream) -> Result<Message, ReceiveError>;

    /// Releases protocol resources when the connection is torn down. Errors are logged and
    ///  otherwise ignored.
    async fn shut(&self, connection: &Connection) -> anyhow::Result<()>;
}
