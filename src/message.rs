use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::util::lock;

/// The fixed part of a message. All fields are opaque to the transport core, except for
///  `route`: a route of [MessageHeader::NO_ROUTE] means that no reply is expected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct MessageHeader {
    pub target: u64,
    /// reply destination
    pub route: u64,
    pub ttl: u8,
    pub priority: u8,
    pub timeout: Duration,
}

impl MessageHeader {
    pub const NO_ROUTE: u64 = 0;
}

/// A unit of data travelling over a connection. Ownership of a message moves along with it:
///  into the transmit queue on `send`, into the receive callback on reception, back to the
///  issuer through the transmit callback. Whoever owns a message at the end of its life
///  releases it to its [MessagePool].
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    /// sequence field, reset before each transmission
    pub msgno: u32,
    /// A fresh message gets ttl and priority from the connection's defaults when it is sent.
    ///  The flag is cleared when the defaults are applied.
    pub is_fresh: bool,
    /// keep-alive message generated by the transport itself
    pub is_chirp: bool,
    /// the peer a received message came from
    pub origin: Option<SocketAddr>,
    pub body: BytesMut,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{target:{}, route:{}, msgno:{}, len:{}{}}}",
               self.header.target, self.header.route, self.msgno, self.body.len(),
               if self.is_chirp { ", chirp" } else { "" })
    }
}

impl Message {
    pub fn new(target: u64, route: u64, body: &[u8]) -> Message {
        Message {
            header: MessageHeader {
                target,
                route,
                ..Default::default()
            },
            msgno: 0,
            is_fresh: true,
            is_chirp: false,
            origin: None,
            body: BytesMut::from(body),
        }
    }

    pub fn chirp() -> Message {
        Message {
            is_fresh: false,
            is_chirp: true,
            ..Message::new(0, MessageHeader::NO_ROUTE, b"")
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.header.route != MessageHeader::NO_ROUTE
    }

    /// overwrites ttl and priority with connection defaults if this message is fresh
    pub fn apply_defaults(&mut self, ttl: Option<u8>, priority: Option<u8>) {
        if !self.is_fresh {
            return;
        }
        if let Some(ttl) = ttl {
            self.header.ttl = ttl;
        }
        if let Some(priority) = priority {
            self.header.priority = priority;
        }
        self.is_fresh = false;
    }

    fn reset(&mut self) {
        self.header = MessageHeader::default();
        self.msgno = 0;
        self.is_fresh = true;
        self.is_chirp = false;
        self.origin = None;
        self.body.clear();
    }
}


/// Why a message reached the end of its life - for diagnostics only
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReleaseReason {
    /// transmitted, no reply expected and no callback to hand it back to
    FireAndForget,
    /// transmitted with a route but without a callback to claim it
    Unclaimed,
    /// received without a registered receive callback
    Undeliverable,
    /// still queued when its connection went down, no callback to notify
    Drained,
    /// keep-alive message, sent or received
    Chirp,
    /// released explicitly by application code
    Caller,
}


/// Recycles messages (and their body buffers) to reduce allocation. The pool is bounded:
///  messages returned in excess of the pool's size are dropped.
pub struct MessagePool {
    body_capacity: usize,
    max_pool_size: usize,
    pooled: Mutex<Vec<Message>>,
    num_acquired: AtomicU64,
    num_released: AtomicU64,
}

impl Debug for MessagePool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessagePool{{acquired:{}, released:{}}}", self.acquired(), self.released())
    }
}

impl MessagePool {
    pub fn new(body_capacity: usize, max_pool_size: usize) -> MessagePool {
        MessagePool {
            body_capacity,
            max_pool_size,
            pooled: Mutex::new(Vec::with_capacity(max_pool_size)),
            num_acquired: AtomicU64::new(0),
            num_released: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> Message {
        self.num_acquired.fetch_add(1, Ordering::Relaxed);

        if let Some(msg) = lock(&self.pooled).pop() {
            trace!("returning message from pool");
            return msg;
        }

        debug!("no message in pool: creating new message");
        let mut msg = Message::new(0, MessageHeader::NO_ROUTE, b"");
        msg.body.reserve(self.body_capacity);
        msg
    }

    pub fn release(&self, mut msg: Message, reason: ReleaseReason) {
        trace!(?reason, "releasing {:?}", msg);
        self.num_released.fetch_add(1, Ordering::Relaxed);

        msg.reset();

        let mut pooled = lock(&self.pooled);
        if pooled.len() < self.max_pool_size {
            pooled.push(msg);
        }
        else {
            trace!("pool is full: discarding released message");
        }
    }

    pub fn acquired(&self) -> u64 {
        self.num_acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.num_released.load(Ordering::Relaxed)
    }

    pub fn num_pooled(&self) -> usize {
        lock(&self.pooled).len()
    }
}
