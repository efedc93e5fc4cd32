use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::callbacks::{ReceiveCallback, TransmitCallback, UserValue};
use crate::config::TransportConfig;
use crate::message::{Message, MessagePool};
use crate::status::Status;
use crate::util::lock;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A message that could not be enqueued, handed back to the caller
#[derive(Debug, Error)]
#[error("connection {url} is not connected - message rejected")]
pub struct SendRejected {
    pub url: String,
    pub message: Message,
}

pub(crate) struct Queued {
    pub message: Message,
    pub callback: Option<Arc<dyn TransmitCallback>>,
    pub user_value: Option<UserValue>,
}

struct TransmitQueue {
    entries: VecDeque<Queued>,
    running: bool,
}

#[derive(Clone)]
pub(crate) struct ReceiveRegistration {
    pub callback: Arc<dyn ReceiveCallback>,
    pub user_value: Option<UserValue>,
}

/// The application's handle on an established connection. Messages passed to [Connection::send]
///  are transmitted in FIFO order by the connection's transmit worker, received messages are
///  dispatched to the callback registered through [Connection::receive].
///
/// Apart from that, a connection offers two cooperative mechanisms for application code that
///  shares a connection between several units of work: a non-blocking reentrant lock
///  ([Connection::set_lock] / [Connection::set_free]) and a usage count. Neither is used by
///  the transport itself.
pub struct Connection {
    id: ConnectionId,
    url: String,
    peer_addr: Option<SocketAddr>,
    user_value: Option<UserValue>,
    pool: Arc<MessagePool>,

    default_ttl: Option<u8>,
    default_priority: Option<u8>,
    keepalive_interval: Option<Duration>,
    max_message_size: usize,

    status: Mutex<Status>,

    queue: Mutex<TransmitQueue>,
    queue_signal: Notify,

    connected: AtomicBool,
    closed: AtomicBool,
    /// raised when the socket pair is to be closed, interrupting both workers
    shutdown: watch::Sender<bool>,

    free: AtomicBool,
    pending_locks: AtomicUsize,
    usage: AtomicUsize,

    receive_registration: Mutex<Option<ReceiveRegistration>>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{id:{}, url:{}}}", self.id, self.url)
    }
}

impl Connection {
    pub fn new(id: ConnectionId, url: String, config: &TransportConfig, pool: Arc<MessagePool>, user_value: Option<UserValue>) -> Connection {
        Connection {
            id,
            status: Mutex::new(Status::new(url.clone(), "Connected")),
            url,
            peer_addr: None,
            user_value,
            pool,
            default_ttl: config.ttl,
            default_priority: config.priority,
            keepalive_interval: config.keepalive_interval,
            max_message_size: config.max_message_size,
            queue: Mutex::new(TransmitQueue {
                entries: VecDeque::new(),
                running: true,
            }),
            queue_signal: Notify::new(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
            free: AtomicBool::new(true),
            pending_locks: AtomicUsize::new(0),
            usage: AtomicUsize::new(0),
            receive_registration: Mutex::new(None),
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Connection {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn user_value(&self) -> Option<UserValue> {
        self.user_value.clone()
    }

    pub fn status(&self) -> Status {
        lock(&self.status).clone()
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// the largest frame the connection's protocol may write or accept
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Appends a message to the transmit queue. Ownership of the message is handed back
    ///  either through `callback`, or - if there is none - the message is released after
    ///  transmission.
    ///
    /// A connection that is closed or lost rejects the message immediately, returning it
    ///  inside the error.
    pub fn send(&self, mut message: Message, callback: Option<Arc<dyn TransmitCallback>>, user_value: Option<UserValue>) -> Result<(), SendRejected> {
        if !self.is_connected() {
            debug!("rejecting {:?} on {:?}: not connected", message, self);
            return Err(self.rejected(message));
        }

        message.apply_defaults(self.default_ttl, self.default_priority);

        let mut queue = lock(&self.queue);
        if !queue.running {
            drop(queue);
            debug!("rejecting {:?} on {:?}: transmit worker stopped", message, self);
            return Err(self.rejected(message));
        }

        trace!("enqueueing {:?}", message);
        let was_empty = queue.entries.is_empty();
        queue.entries.push_back(Queued { message, callback, user_value });
        drop(queue);

        if was_empty {
            self.queue_signal.notify_one();
        }
        Ok(())
    }

    fn rejected(&self, message: Message) -> SendRejected {
        SendRejected {
            url: self.url.clone(),
            message,
        }
    }

    /// Registers the callback that received messages are dispatched to, replacing any previous
    ///  registration. Messages arriving while no callback is registered are discarded.
    pub fn receive(&self, callback: Arc<dyn ReceiveCallback>, user_value: Option<UserValue>) {
        *lock(&self.receive_registration) = Some(ReceiveRegistration { callback, user_value });
    }

    /// removes the receive registration, received messages are discarded from now on
    pub fn clear_receive(&self) {
        *lock(&self.receive_registration) = None;
    }

    /// Stops accepting messages and tells the transmit worker to terminate. Messages that are
    ///  still queued when the worker terminates are failed. Calling this repeatedly has no
    ///  further effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {:?}", self);

        lock(&self.queue).running = false;
        self.connected.store(false, Ordering::Release);
        lock(&self.status).set_state("Closed");
        self.queue_signal.notify_one();
    }

    /// Closes the socket pair, interrupting both workers wherever they are blocked
    pub(crate) fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        if !self.shutdown.send_replace(true) {
            debug!("shutting down socket pair of {:?}", self);
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Non-blocking reentrant lock: returns `true` if this call acquired a free connection,
    ///  `false` if it was already locked. Every call must be matched by a call to
    ///  [Connection::set_free], regardless of the result.
    pub fn set_lock(&self) -> bool {
        self.pending_locks.fetch_add(1, Ordering::AcqRel);
        self.free.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// releases one [Connection::set_lock] call; the connection becomes free with the last one
    pub fn set_free(&self) {
        let prev = self.pending_locks.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.free.store(true, Ordering::Release);
        }
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    pub fn increase_usage(&self) -> usize {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release_usage(&self) -> usize {
        match self.usage.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn receive_registration(&self) -> Option<ReceiveRegistration> {
        lock(&self.receive_registration).clone()
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut Status)) {
        f(&mut lock(&self.status));
    }

    /// Waits for the next queued message, returning `None` once the connection is closed. If
    ///  keep-alive is configured and the queue stays empty for the keep-alive interval, a chirp
    ///  is returned instead.
    ///
    /// NB: There must be only a single consumer (the transmit worker) for the wake-up logic to
    ///      work
    pub(crate) async fn next_queued(&self) -> Option<Queued> {
        loop {
            {
                let mut queue = lock(&self.queue);
                if !queue.running {
                    return None;
                }
                if let Some(queued) = queue.entries.pop_front() {
                    return Some(queued);
                }
            }

            match self.keepalive_interval {
                None => self.queue_signal.notified().await,
                Some(interval) => {
                    if timeout(interval, self.queue_signal.notified()).await.is_err() {
                        trace!("idle for {:?}: sending chirp", interval);
                        let mut chirp = self.pool.acquire();
                        chirp.is_chirp = true;
                        chirp.is_fresh = false;
                        return Some(Queued { message: chirp, callback: None, user_value: None });
                    }
                }
            }
        }
    }

    /// removes all queued messages and stops the queue from accepting more
    pub(crate) fn drain_queue(&self) -> Vec<Queued> {
        let mut queue = lock(&self.queue);
        queue.running = false;
        queue.entries.drain(..).collect()
    }
}
