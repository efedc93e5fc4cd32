use std::io;
use std::sync::Arc;

use tokio::select;
use tracing::{debug, instrument, trace, warn};

use crate::connection::{Connection, Queued};
use crate::driver::ConnectionOwner;
use crate::error::TransmitError;
use crate::message::ReleaseReason;
use crate::protocol::{Protocol, WriteStream};
use crate::util::signalled;

struct TransmitFailure {
    in_flight: Option<Queued>,
    error: TransmitError,
}

/// The transmit worker of a connection: writes queued messages until the connection is closed
///  or a write fails. Afterwards, it closes the socket pair (which also stops the receive
///  worker), fails all messages that are still queued, shuts down the protocol and retires the
///  connection with its owner.
#[instrument(name = "transmit_worker", skip_all, fields(connection = connection.id(), url = connection.url()))]
pub(crate) async fn run_transmit_worker(
    connection: Arc<Connection>,
    protocol: Arc<dyn Protocol>,
    mut output: WriteStream,
    owner: Arc<dyn ConnectionOwner>,
) {
    debug!("starting transmit worker");

    let crashed = match transmit_loop(&connection, protocol.as_ref(), &mut output).await {
        Ok(()) => {
            debug!("transmit worker terminating regularly");
            false
        }
        Err(TransmitFailure { in_flight, error }) => {
            warn!("transmit worker terminating after error: {}", error);
            if let Some(queued) = in_flight {
                fail(&connection, queued).await;
            }
            true
        }
    };

    connection.shutdown();

    let drained = connection.drain_queue();
    if !drained.is_empty() {
        debug!("failing {} queued messages", drained.len());
    }
    for queued in drained {
        fail(&connection, queued).await;
    }

    if let Err(e) = protocol.shut(&connection).await {
        warn!("error shutting down protocol - ignoring: {}", e);
    }

    drop(output);
    owner.retire(&connection, crashed);
}

async fn transmit_loop(connection: &Arc<Connection>, protocol: &dyn Protocol, output: &mut WriteStream) -> Result<(), TransmitFailure> {
    let mut shutdown = connection.subscribe_shutdown();

    let token = select! {
        token = protocol.get_token(connection, output) => token
            .map_err(|e| TransmitFailure { in_flight: None, error: TransmitError::Other(e) })?,
        _ = signalled(&mut shutdown) => return Ok(()),
    };
    trace!("acquired token {:?}", token);

    loop {
        let queued = select! {
            queued = connection.next_queued() => queued,
            _ = signalled(&mut shutdown) => None,
        };
        let Some(mut queued) = queued else {
            return Ok(());
        };

        queued.message.msgno = 0;

        let result = select! {
            result = protocol.transmit(connection, &token, &queued.message, output) => result,
            _ = signalled(&mut shutdown) => Err(TransmitError::Socket(io::Error::new(io::ErrorKind::ConnectionAborted, "connection was shut down"))),
        };
        if let Err(error) = result {
            return Err(TransmitFailure { in_flight: Some(queued), error });
        }

        let num_bytes = queued.message.body.len();
        let is_chirp = queued.message.is_chirp;
        connection.update_status(|status| {
            if is_chirp {
                status.chirps_out += 1;
            }
            else {
                status.count_out(num_bytes);
            }
        });

        transmitted(connection, queued).await;
    }
}

async fn transmitted(connection: &Arc<Connection>, queued: Queued) {
    let Queued { message, callback, user_value } = queued;
    match callback {
        Some(callback) => callback.transmitted(connection, message, user_value).await,
        None if message.is_chirp => connection.pool().release(message, ReleaseReason::Chirp),
        None if message.expects_reply() => connection.pool().release(message, ReleaseReason::Unclaimed),
        None => connection.pool().release(message, ReleaseReason::FireAndForget),
    }
}

async fn fail(connection: &Arc<Connection>, queued: Queued) {
    let Queued { message, callback, user_value } = queued;
    match callback {
        Some(callback) => callback.transmit_failed(connection, message, user_value).await,
        None => connection.pool().release(message, ReleaseReason::Drained),
    }
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::callbacks::{TransmitCallback, UserValue};
    use crate::config::TransportConfig;
    use crate::connection::next_connection_id;
    use crate::driver::MockConnectionOwner;
    use crate::error::ReceiveError;
    use crate::message::{Message, MessagePool};
    use crate::protocol::raw::RawProtocol;
    use crate::protocol::{ReadStream, Token};
    use super::*;

    #[derive(Default)]
    struct RecordingCallback {
        events: Mutex<Vec<(&'static str, u64)>>,
    }
    impl RecordingCallback {
        fn events(&self) -> Vec<(&'static str, u64)> {
            self.events.lock().unwrap().clone()
        }
    }
    #[async_trait]
    impl TransmitCallback for RecordingCallback {
        async fn transmitted(&self, connection: &Arc<Connection>, message: Message, _user_value: Option<UserValue>) {
            self.events.lock().unwrap().push(("transmitted", message.header.target));
            connection.pool().release(message, ReleaseReason::Caller);
        }

        async fn transmit_failed(&self, connection: &Arc<Connection>, message: Message, _user_value: Option<UserValue>) {
            self.events.lock().unwrap().push(("failed", message.header.target));
            connection.pool().release(message, ReleaseReason::Caller);
        }
    }

    /// records transmitted targets, failing on a given target or blocking the token handshake
    struct ScriptedProtocol {
        fail_on_target: Option<u64>,
        token_gate: Option<Arc<Notify>>,
        transmitted: Mutex<Vec<(u64, u32)>>,
        num_shut: Mutex<usize>,
    }
    impl ScriptedProtocol {
        fn new(fail_on_target: Option<u64>, token_gate: Option<Arc<Notify>>) -> ScriptedProtocol {
            ScriptedProtocol {
                fail_on_target,
                token_gate,
                transmitted: Default::default(),
                num_shut: Default::default(),
            }
        }
    }
    #[async_trait]
    impl Protocol for ScriptedProtocol {
        async fn get_token(&self, _connection: &Connection, _output: &mut WriteStream) -> anyhow::Result<Token> {
            if let Some(gate) = &self.token_gate {
                gate.notified().await;
            }
            Ok(Token::default())
        }

        async fn transmit(&self, _connection: &Connection, _token: &Token, message: &Message, _output: &mut WriteStream) -> Result<(), TransmitError> {
            if Some(message.header.target) == self.fail_on_target {
                return Err(TransmitError::Socket(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            self.transmitted.lock().unwrap().push((message.header.target, message.msgno));
            Ok(())
        }

        async fn receive(&self, _connection: &Connection, _input: &mut ReadStream) -> Result<Message, ReceiveError> {
            std::future::pending().await
        }

        async fn shut(&self, _connection: &Connection) -> anyhow::Result<()> {
            *self.num_shut.lock().unwrap() += 1;
            anyhow::bail!("shut errors are ignored")
        }
    }

    fn connection(config: &TransportConfig) -> Arc<Connection> {
        Arc::new(Connection::new(next_connection_id(), "xts://127.0.0.1:9".to_string(), config, Arc::new(MessagePool::new(16, 4)), None))
    }

    fn owner_expecting_retire(crashed: bool) -> Arc<MockConnectionOwner> {
        let mut owner = MockConnectionOwner::new();
        owner.expect_retire()
            .once()
            .withf(move |_, c| *c == crashed)
            .return_const(());
        Arc::new(owner)
    }

    fn sink() -> WriteStream {
        Box::new(tokio::io::sink())
    }

    #[tokio::test]
    async fn test_close_fails_queued_messages_in_order() {
        let connection = connection(&TransportConfig::default());
        let callbacks = (0..3).map(|_| Arc::new(RecordingCallback::default())).collect::<Vec<_>>();
        for (i, callback) in callbacks.iter().enumerate() {
            connection.send(Message::new(i as u64 + 1, 5, b"x"), Some(callback.clone()), None).unwrap();
        }
        connection.close();

        let protocol = Arc::new(ScriptedProtocol::new(None, None));
        run_transmit_worker(connection.clone(), protocol.clone(), sink(), owner_expecting_retire(false)).await;

        for (i, callback) in callbacks.iter().enumerate() {
            assert_eq!(callback.events(), vec![("failed", i as u64 + 1)]);
        }
        assert!(protocol.transmitted.lock().unwrap().is_empty());
        assert_eq!(*protocol.num_shut.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_with_shared_callback_preserves_order() {
        let connection = connection(&TransportConfig::default());
        let callback = Arc::new(RecordingCallback::default());
        for target in [3, 1, 2] {
            connection.send(Message::new(target, 5, b"x"), Some(callback.clone()), None).unwrap();
        }
        connection.close();

        run_transmit_worker(connection.clone(), Arc::new(ScriptedProtocol::new(None, None)), sink(), owner_expecting_retire(false)).await;

        assert_eq!(callback.events(), vec![("failed", 3), ("failed", 1), ("failed", 2)]);
    }

    #[tokio::test]
    async fn test_transmit_fifo_then_close() {
        let connection = connection(&TransportConfig::default());
        let gate = Arc::new(Notify::new());
        let protocol = Arc::new(ScriptedProtocol::new(None, Some(gate.clone())));
        let callback = Arc::new(RecordingCallback::default());

        let mut message = Message::new(1, 7, b"a");
        message.msgno = 99;
        connection.send(message, Some(callback.clone()), None).unwrap();
        connection.send(Message::new(2, 0, b"b"), None, None).unwrap();
        connection.send(Message::new(3, 7, b"c"), Some(callback.clone()), None).unwrap();

        let worker = tokio::spawn(run_transmit_worker(connection.clone(), protocol.clone(), sink(), owner_expecting_retire(false)));
        gate.notify_one();

        while protocol.transmitted.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        connection.close();
        worker.await.unwrap();

        assert_eq!(*protocol.transmitted.lock().unwrap(), vec![(1, 0), (2, 0), (3, 0)]);
        assert_eq!(callback.events(), vec![("transmitted", 1), ("transmitted", 3)]);

        let status = connection.status();
        assert_eq!(status.messages_out, 3);
        assert_eq!(status.bytes_out, 3);
        // two released by the callback, one fire-and-forget
        assert_eq!(connection.pool().released(), 3);
    }

    #[tokio::test]
    async fn test_fire_and_forget_released_once() {
        let connection = connection(&TransportConfig::default());
        let protocol = Arc::new(ScriptedProtocol::new(None, None));
        for target in 1..=4 {
            connection.send(Message::new(target, 0, b"x"), None, None).unwrap();
        }

        let worker = tokio::spawn(run_transmit_worker(connection.clone(), protocol.clone(), sink(), owner_expecting_retire(false)));
        while protocol.transmitted.lock().unwrap().len() < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        connection.close();
        worker.await.unwrap();

        assert_eq!(connection.pool().released(), 4);
    }

    #[tokio::test]
    async fn test_transmit_error_fails_in_flight_and_queued() {
        let connection = connection(&TransportConfig::default());
        let gate = Arc::new(Notify::new());
        let protocol = Arc::new(ScriptedProtocol::new(Some(2), Some(gate.clone())));
        let callback = Arc::new(RecordingCallback::default());

        for target in 1..=4 {
            connection.send(Message::new(target, 1, b"x"), Some(callback.clone()), None).unwrap();
        }
        connection.send(Message::new(5, 0, b"x"), None, None).unwrap();

        let worker = tokio::spawn(run_transmit_worker(connection.clone(), protocol.clone(), sink(), owner_expecting_retire(true)));
        gate.notify_one();
        worker.await.unwrap();

        assert_eq!(callback.events(), vec![("transmitted", 1), ("failed", 2), ("failed", 3), ("failed", 4)]);
        assert_eq!(connection.pool().released(), 5);
        assert!(!connection.is_connected());
        assert!(connection.send(Message::new(6, 0, b"x"), None, None).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_token() {
        let connection = connection(&TransportConfig::default());
        let protocol = Arc::new(ScriptedProtocol::new(None, Some(Arc::new(Notify::new()))));
        let callback = Arc::new(RecordingCallback::default());
        connection.send(Message::new(1, 1, b"x"), Some(callback.clone()), None).unwrap();

        let worker = tokio::spawn(run_transmit_worker(connection.clone(), protocol, sink(), owner_expecting_retire(false)));
        connection.shutdown();
        worker.await.unwrap();

        assert_eq!(callback.events(), vec![("failed", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_chirps() {
        let connection = connection(&TransportConfig { keepalive_interval: Some(Duration::from_secs(5)), ..Default::default() });
        let (client, server) = tokio::io::duplex(4096);
        let mut input: ReadStream = Box::new(server);

        let worker = tokio::spawn(run_transmit_worker(connection.clone(), Arc::new(RawProtocol::new(1024)), Box::new(client), owner_expecting_retire(false)));

        let protocol = RawProtocol::new(1024);
        let first = protocol.receive(&connection, &mut input).await.unwrap();
        assert!(first.is_chirp);

        connection.close();
        worker.await.unwrap();

        let status = connection.status();
        assert!(status.chirps_out >= 1);
        assert_eq!(status.messages_out, 0);
    }
}
