//! TCP/IP transport for XTS messages: listeners and connectors ("drivers") that establish
//!  connections, each served by a transmit and a receive worker.

pub mod callbacks;
pub mod config;
pub mod connection;
pub mod directory;
pub mod driver;
pub mod error;
pub mod message;
pub mod protocol;
mod receiver;
pub mod status;
mod transmitter;
pub mod transport;
mod util;

pub use config::{TargetUrl, TransportConfig};
pub use connection::Connection;
pub use message::{Message, MessagePool};
pub use transport::Transport;
