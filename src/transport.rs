use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::callbacks::{ConnectCallback, UserValue};
use crate::config::TargetUrl;
use crate::directory::{DirectoryCache, NoDirectoryCache};
use crate::driver::{Driver, DriverId, DriverMode, DriverParams};
use crate::protocol::Protocol;
use crate::util::lock;

/// The set of live drivers. A driver removes itself when its loop has terminated and all of
///  its connections are gone.
#[derive(Default)]
pub(crate) struct DriverRegistry {
    drivers: Mutex<FxHashMap<DriverId, Arc<Driver>>>,
}

impl DriverRegistry {
    fn insert(&self, driver: Arc<Driver>) {
        lock(&self.drivers).insert(driver.id(), driver);
    }

    pub(crate) fn remove(&self, id: DriverId) -> bool {
        lock(&self.drivers).remove(&id).is_some()
    }

    fn all(&self) -> Vec<Arc<Driver>> {
        lock(&self.drivers).values().cloned().collect()
    }

    fn take_all(&self) -> Vec<Arc<Driver>> {
        lock(&self.drivers).drain().map(|(_, driver)| driver).collect()
    }
}

/// Entry point for opening listeners and outgoing connections.
///
/// All operations spawn tasks, so they must be called from inside a Tokio runtime.
pub struct Transport {
    registry: Arc<DriverRegistry>,
    directory: Arc<dyn DirectoryCache>,
    next_driver_id: AtomicU64,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

impl Transport {
    pub fn new() -> Transport {
        Transport::with_directory(Arc::new(NoDirectoryCache))
    }

    /// `directory` is notified of every failed connection attempt
    pub fn with_directory(directory: Arc<dyn DirectoryCache>) -> Transport {
        Transport {
            registry: Default::default(),
            directory,
            next_driver_id: AtomicU64::new(1),
        }
    }

    /// Starts listening on the URL's port. Binding happens asynchronously; failure is reported
    ///  through [ConnectCallback::listen_failed] and the driver's state.
    pub fn listen(
        &self,
        target: TargetUrl,
        protocol: Arc<dyn Protocol>,
        connect_callback: Option<Arc<dyn ConnectCallback>>,
        user_value: Option<UserValue>,
    ) -> Arc<Driver> {
        self.start(DriverParams {
            mode: DriverMode::Listen,
            target,
            protocol,
            connect_callback,
            user_value,
            directory: self.directory.clone(),
        })
    }

    /// Starts connecting to the URL's host and port. `connect_timeout` takes precedence over
    ///  the URL's `timeout` option, with zero meaning no timeout at all.
    pub fn connect(
        &self,
        mut target: TargetUrl,
        connect_timeout: Option<Duration>,
        protocol: Arc<dyn Protocol>,
        connect_callback: Option<Arc<dyn ConnectCallback>>,
        user_value: Option<UserValue>,
    ) -> Arc<Driver> {
        if let Some(connect_timeout) = connect_timeout {
            target.config.connect_timeout = Some(connect_timeout).filter(|t| !t.is_zero());
        }
        self.start(DriverParams {
            mode: DriverMode::Connect,
            target,
            protocol,
            connect_callback,
            user_value,
            directory: self.directory.clone(),
        })
    }

    fn start(&self, params: DriverParams) -> Arc<Driver> {
        let id = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
        let driver = Arc::new(Driver::new(id, params, Arc::downgrade(&self.registry)));
        debug!("starting {:?}", driver);

        self.registry.insert(driver.clone());
        driver.spawn();
        driver
    }

    /// all drivers that are still running or still have live connections
    pub fn drivers(&self) -> Vec<Arc<Driver>> {
        self.registry.all()
    }

    /// Stops every driver and closes all their connections, without waiting for termination.
    ///  The registry is empty afterwards.
    pub fn stop_all(&self) {
        let drivers = self.registry.take_all();
        info!("stopping {} drivers", drivers.len());
        for driver in drivers {
            driver.stop();
        }
    }
}
