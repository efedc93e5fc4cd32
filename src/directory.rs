#[cfg(test)] use mockall::automock;

/// The name resolution cache that maps targets to addresses. The transport evicts a target
///  after every failed connection attempt so the next attempt resolves it afresh.
#[cfg_attr(test, automock)]
pub trait DirectoryCache: Send + Sync + 'static {
    fn evict_target(&self, target: &str);
}

pub struct NoDirectoryCache;

impl DirectoryCache for NoDirectoryCache {
    fn evict_target(&self, _target: &str) {}
}
