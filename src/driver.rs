use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::callbacks::{ConnectCallback, UserValue};
use crate::config::TargetUrl;
use crate::connection::{next_connection_id, Connection, ConnectionId};
use crate::directory::DirectoryCache;
use crate::error::{ConnectError, ListenError};
use crate::message::MessagePool;
use crate::protocol::Protocol;
use crate::receiver::run_receive_worker;
use crate::status::Status;
use crate::transmitter::run_transmit_worker;
use crate::transport::DriverRegistry;
use crate::util::{lock, signalled};

pub type DriverId = u64;

/// The part of a driver that its connections' workers talk back to
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ConnectionOwner: Send + Sync + 'static {
    /// Removes a connection's worker pair from its owner. Both workers call this when they
    ///  terminate, only the first call has an effect.
    fn retire(&self, connection: &Arc<Connection>, crashed: bool);

    /// forwards the loss of an established connection to the connect callback
    async fn disconnected(&self, connection: &Arc<Connection>);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverMode {
    Listen,
    Connect,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TerminalReason {
    Stopped,
    ListenFailed,
    AcceptFailed,
    /// a connector without reconnect established its connection
    ConnectComplete,
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverState {
    Idle,
    Listening { local_addr: SocketAddr },
    Connecting { attempt: u32 },
    Connected,
    /// waiting for the established connection to go down before reconnecting
    Suspended,
    Terminal(TerminalReason),
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Terminal(_))
    }
}

pub(crate) struct DriverParams {
    pub mode: DriverMode,
    pub target: TargetUrl,
    pub protocol: Arc<dyn Protocol>,
    pub connect_callback: Option<Arc<dyn ConnectCallback>>,
    pub user_value: Option<UserValue>,
    pub directory: Arc<dyn DirectoryCache>,
}

/// A listener or connector for one URL. It runs its accept / connect loop on a task of its
///  own, spawning a transmit and a receive worker for each connection it establishes.
///
/// A connector retries failed connection attempts as configured by the target URL's `retry` and
///  `retryint` options. With `reconnect` set, it establishes a new connection whenever the
///  previous one is lost.
pub struct Driver {
    id: DriverId,
    mode: DriverMode,
    target: TargetUrl,
    protocol: Arc<dyn Protocol>,
    connect_callback: Option<Arc<dyn ConnectCallback>>,
    user_value: Option<UserValue>,
    directory: Arc<dyn DirectoryCache>,
    pool: Arc<MessagePool>,
    registry: Weak<DriverRegistry>,

    status: Mutex<Status>,
    state: watch::Sender<DriverState>,
    children: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
    loop_exited: AtomicBool,
    stop: watch::Sender<bool>,

    suspended: AtomicBool,
    resume: Notify,
}

impl Debug for Driver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Driver{{id:{}, mode:{:?}, target:{}}}", self.id, self.mode, self.target.host_port())
    }
}

impl Driver {
    pub(crate) fn new(id: DriverId, params: DriverParams, registry: Weak<DriverRegistry>) -> Driver {
        let config = &params.target.config;
        Driver {
            id,
            mode: params.mode,
            pool: Arc::new(MessagePool::new(config.message_body_capacity, config.message_pool_size)),
            status: Mutex::new(Status::new(format!("{}://{}", TargetUrl::SCHEME, params.target.host_port()), "Idle")),
            target: params.target,
            protocol: params.protocol,
            connect_callback: params.connect_callback,
            user_value: params.user_value,
            directory: params.directory,
            registry,
            state: watch::Sender::new(DriverState::Idle),
            children: Mutex::new(FxHashMap::default()),
            loop_exited: AtomicBool::new(false),
            stop: watch::Sender::new(false),
            suspended: AtomicBool::new(false),
            resume: Notify::new(),
        }
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    pub fn target(&self) -> &TargetUrl {
        &self.target
    }

    pub fn status(&self) -> Status {
        lock(&self.status).clone()
    }

    /// subscribes to the driver's state machine
    pub fn state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// the live connections established by this driver
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.children).values().cloned().collect()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Terminates the driver's loop and closes all its connections. This returns without
    ///  waiting for any of the driver's tasks to finish, and calling it repeatedly has no
    ///  further effect.
    pub fn stop(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        info!("stopping {:?}", self);

        for connection in self.connections() {
            connection.close();
            connection.shutdown();
        }
    }

    pub(crate) fn spawn(self: &Arc<Self>) {
        let span = info_span!("driver", id = self.id, mode = ?self.mode, target = %self.target.host_port());
        tokio::spawn(self.clone().run().instrument(span));
    }

    async fn run(self: Arc<Self>) {
        let reason = match self.mode {
            DriverMode::Listen => self.listen_loop().await,
            DriverMode::Connect => self.connect_loop().await,
        };
        info!("driver loop terminated: {:?}", reason);

        self.set_state(DriverState::Terminal(reason));
        self.loop_exited.store(true, Ordering::SeqCst);
        self.deregister_if_done();
    }

    fn set_state(&self, state: DriverState) {
        debug!("state {:?}", state);
        self.state.send_replace(state);
    }

    fn set_status(&self, state: impl Into<String>) {
        lock(&self.status).set_state(state);
    }

    async fn listen_loop(self: &Arc<Self>) -> TerminalReason {
        let mut stop = self.stop.subscribe();
        let port = self.target.port;

        let bound = TcpListener::bind(self.target.host_port()).await
            .and_then(|listener| listener.local_addr().map(|addr| (listener, addr)));
        let (listener, local_addr) = match bound {
            Ok(x) => x,
            Err(source) => {
                let error = ListenError::Bind { port, source };
                error!("{}", error);
                self.set_status(format!("Listen failed: {}", error));
                if let Some(callback) = &self.connect_callback {
                    callback.listen_failed(self.user_value.clone(), &error).await;
                }
                return TerminalReason::ListenFailed;
            }
        };

        info!("listening on {:?}", local_addr);
        self.set_status(format!("Listening on port={}", local_addr.port()));
        self.set_state(DriverState::Listening { local_addr });

        loop {
            let accepted = select! {
                accepted = listener.accept() => accepted,
                _ = signalled(&mut stop) => {
                    self.set_status("Listener stopped");
                    return TerminalReason::Stopped;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("accepted connection from {:?}", peer_addr);
                    self.establish(stream, peer_addr).await;
                }
                Err(e) => {
                    error!("error accepting connections - terminating listener: {}", e);
                    self.set_status(format!("Accept failed: {}", e));
                    return TerminalReason::AcceptFailed;
                }
            }
        }
    }

    async fn connect_loop(self: &Arc<Self>) -> TerminalReason {
        let mut stop = self.stop.subscribe();
        let config = &self.target.config;
        let mut retry = config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.set_state(DriverState::Connecting { attempt });
            self.set_status(format!("Connecting, attempt {}", attempt));

            let connected = select! {
                connected = self.try_connect() => connected,
                _ = signalled(&mut stop) => return TerminalReason::Stopped,
            };

            match connected {
                Ok((stream, peer_addr)) => {
                    info!("connected to {:?}", peer_addr);
                    retry = config.retry;
                    attempt = 0;

                    if config.reconnect {
                        self.suspended.store(true, Ordering::SeqCst);
                    }
                    self.establish(stream, peer_addr).await;

                    if !config.reconnect {
                        self.set_status("Connector complete");
                        return TerminalReason::ConnectComplete;
                    }

                    self.set_status("Connector suspended");
                    self.set_state(DriverState::Suspended);
                    select! {
                        _ = self.resumed() => {}
                        _ = signalled(&mut stop) => return TerminalReason::Stopped,
                    }
                    info!("connection lost - reconnecting in {:?}", config.retry_interval);
                }
                Err(error) => {
                    self.directory.evict_target(self.eviction_key());

                    if !retry.try_consume() {
                        warn!("giving up after {} attempts: {}", attempt, error);
                        self.set_status(format!("Connect failed: {}", error));
                        if let Some(callback) = &self.connect_callback {
                            callback.connect_failed(&self.status().url, self.user_value.clone(), error).await;
                        }
                        return TerminalReason::RetriesExhausted;
                    }
                    debug!("connection attempt {} failed, retrying in {:?}: {}", attempt, config.retry_interval, error);
                }
            }

            select! {
                _ = sleep(config.retry_interval) => {}
                _ = signalled(&mut stop) => return TerminalReason::Stopped,
            }
        }
    }

    fn eviction_key(&self) -> &str {
        if self.target.target.is_empty() {
            &self.target.host
        }
        else {
            &self.target.target
        }
    }

    async fn try_connect(&self) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let host_port = self.target.host_port();

        let resolved = lookup_host(&host_port).await
            .map_err(|source| ConnectError::HostResolution { host: self.target.host.clone(), source })?
            .next();
        let Some(addr) = resolved else {
            return Err(ConnectError::HostResolution {
                host: self.target.host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address found"),
            });
        };

        let stream = match self.target.config.connect_timeout {
            None => TcpStream::connect(addr).await,
            Some(connect_timeout) => match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => return Err(ConnectError::Timeout { target: host_port, timeout: connect_timeout }),
            },
        };
        let stream = stream.map_err(|e| ConnectError::classify(&host_port, e))?;
        Ok((stream, addr))
    }

    async fn resumed(&self) {
        loop {
            let notified = self.resume.notified();
            if !self.suspended.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// sets up a connection's worker pair for a freshly accepted or connected socket
    async fn establish(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        configure_socket(&stream);

        let connection = Arc::new(
            Connection::new(
                next_connection_id(),
                format!("{}://{}", TargetUrl::SCHEME, peer_addr),
                &self.target.config,
                self.pool.clone(),
                self.user_value.clone(),
            )
                .with_peer_addr(peer_addr)
        );
        debug!("established {:?}", connection);

        lock(&self.children).insert(connection.id(), connection.clone());
        if self.is_stopped() {
            connection.close();
            connection.shutdown();
        }
        else if self.mode == DriverMode::Connect {
            self.set_state(DriverState::Connected);
        }

        if let Some(callback) = &self.connect_callback {
            callback.connected(connection.url(), self.user_value.clone(), connection.clone()).await;
        }

        let (input, output) = stream.into_split();
        let owner: Arc<dyn ConnectionOwner> = self.clone();
        tokio::spawn(run_transmit_worker(connection.clone(), self.protocol.clone(), Box::new(output), owner.clone()));
        tokio::spawn(run_receive_worker(connection, self.protocol.clone(), Box::new(input), owner));
    }

    fn deregister_if_done(&self) {
        if !self.loop_exited.load(Ordering::SeqCst) || !lock(&self.children).is_empty() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!("deregistered {:?}", self);
            }
        }
    }
}

#[async_trait]
impl ConnectionOwner for Driver {
    fn retire(&self, connection: &Arc<Connection>, crashed: bool) {
        connection.shutdown();

        let removed = lock(&self.children).remove(&connection.id()).is_some();
        if removed {
            debug!(crashed, "retired {:?}", connection);
            if self.mode == DriverMode::Connect && self.target.config.reconnect {
                self.suspended.store(false, Ordering::SeqCst);
                self.resume.notify_one();
            }
        }

        self.deregister_if_done();
    }

    async fn disconnected(&self, connection: &Arc<Connection>) {
        if let Some(callback) = &self.connect_callback {
            callback.disconnected(connection.url(), self.user_value.clone(), connection.clone()).await;
        }
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("could not set TCP_NODELAY: {}", e);
    }
    if let Err(e) = socket2::SockRef::from(stream).set_linger(None) {
        warn!("could not disable SO_LINGER: {}", e);
    }
}
