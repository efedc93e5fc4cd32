//! Notification interfaces towards application code. All callbacks are invoked from transport
//!  worker tasks without holding any transport-internal lock, so they may call back into the
//!  [Connection] (e.g. to send a reply). They should not block for long though, since the
//!  worker invoking them stalls until they return.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{ConnectError, ListenError};
use crate::message::Message;

/// Opaque application value that is handed back verbatim with each notification
pub type UserValue = Arc<dyn Any + Send + Sync>;

/// Notifications for the party that requested a `listen` or `connect`
#[async_trait]
pub trait ConnectCallback: Send + Sync + 'static {
    /// called once per accepted or established connection, before its workers start
    async fn connected(&self, peer_url: &str, user_value: Option<UserValue>, connection: Arc<Connection>);

    /// called once when an established connection is torn down
    async fn disconnected(&self, peer_url: &str, user_value: Option<UserValue>, connection: Arc<Connection>);

    /// called once when a connector gives up after exhausting its retry budget
    async fn connect_failed(&self, peer_url: &str, user_value: Option<UserValue>, error: ConnectError);

    async fn listen_failed(&self, _user_value: Option<UserValue>, _error: &ListenError) {}
}

/// Registered per connection through [Connection::receive]
#[async_trait]
pub trait ReceiveCallback: Send + Sync + 'static {
    /// Ownership of `message` is transferred to the callee, who is responsible for releasing it
    async fn received(&self, connection: &Arc<Connection>, message: Message, user_value: Option<UserValue>);

    /// called exactly once when the connection is torn down
    async fn connection_lost(&self, connection: &Arc<Connection>, user_value: Option<UserValue>);
}

/// Passed along with a message to [Connection::send]. Exactly one of the two methods is called
///  exactly once per message, and the message's ownership is returned through it.
#[async_trait]
pub trait TransmitCallback: Send + Sync + 'static {
    async fn transmitted(&self, connection: &Arc<Connection>, message: Message, user_value: Option<UserValue>);

    async fn transmit_failed(&self, connection: &Arc<Connection>, message: Message, user_value: Option<UserValue>);
}
