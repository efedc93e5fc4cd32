use std::sync::Arc;

use tokio::select;
use tracing::{debug, instrument, trace, warn};

use crate::connection::Connection;
use crate::driver::ConnectionOwner;
use crate::message::ReleaseReason;
use crate::protocol::{Protocol, ReadStream};
use crate::util::signalled;

/// The receive worker of a connection: reads messages and dispatches them to the registered
///  receive callback until reading fails or the socket pair is shut down.
///
/// On termination, it notifies the receive callback (`connection_lost`) and the owner's connect
///  callback (`disconnected`) exactly once each, and then retires the connection.
#[instrument(name = "receive_worker", skip_all, fields(connection = connection.id(), url = connection.url()))]
pub(crate) async fn run_receive_worker(
    connection: Arc<Connection>,
    protocol: Arc<dyn Protocol>,
    mut input: ReadStream,
    owner: Arc<dyn ConnectionOwner>,
) {
    debug!("starting receive worker");
    let mut shutdown = connection.subscribe_shutdown();

    let crashed = loop {
        let received = select! {
            received = protocol.receive(&connection, &mut input) => received,
            _ = signalled(&mut shutdown) => {
                debug!("socket pair was shut down");
                break false;
            }
        };

        let mut message = match received {
            Ok(message) => message,
            Err(e) if e.is_eof() => {
                debug!("peer closed the connection");
                break false;
            }
            Err(e) => {
                warn!("receive worker terminating after error: {}", e);
                break true;
            }
        };

        message.origin = connection.peer_addr();

        if message.is_chirp {
            trace!("received chirp");
            connection.update_status(|status| status.chirps_in += 1);
            connection.pool().release(message, ReleaseReason::Chirp);
            continue;
        }

        let num_bytes = message.body.len();
        connection.update_status(|status| status.count_in(num_bytes));

        match connection.receive_registration() {
            Some(registration) => {
                trace!("dispatching {:?}", message);
                registration.callback.received(&connection, message, registration.user_value).await;
            }
            None => {
                debug!("no receive callback registered - discarding {:?}", message);
                connection.pool().release(message, ReleaseReason::Undeliverable);
            }
        }
    };

    drop(input);
    connection.close();
    connection.shutdown();

    if let Some(registration) = connection.receive_registration() {
        registration.callback.connection_lost(&connection, registration.user_value).await;
    }
    owner.disconnected(&connection).await;

    owner.retire(&connection, crashed);
}
