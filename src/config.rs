//! VFS configuration
//!
//! Settings are fixed when a [`HostVfs`](crate::os::host::HostVfs) is built;
//! every file it opens inherits them.

use std::time::Duration;

use crate::os::backend::BackendKind;

/// Interval between attempts while waiting for a contended lock
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Name the host VFS registers under
pub const DEFAULT_VFS_NAME: &str = "host";

/// Configuration for a host VFS instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsConfig {
    /// VFS name reported to the engine
    pub name: String,
    /// Lock primitive family
    pub backend: BackendKind,
    /// Hand out WAL-index shared memory. With a whole-file backend the
    /// index is confined to one process.
    pub shared_memory: bool,
    /// Sleep between lock attempts
    pub retry_interval: Duration,
    /// Wait budget for SHARED, RESERVED and EXCLUSIVE acquisition; zero
    /// means a single attempt
    pub lock_timeout: Duration,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_VFS_NAME.to_string(),
            backend: BackendKind::default(),
            shared_memory: !cfg!(feature = "noshm"),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            lock_timeout: Duration::ZERO,
        }
    }
}

impl VfsConfig {
    /// Set the VFS name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Select the lock backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable shared memory
    pub fn shared_memory(mut self, enabled: bool) -> Self {
        self.shared_memory = enabled;
        self
    }

    /// Set the retry interval; clamped to at least one microsecond
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Set the default lock wait budget
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VfsConfig::default();
        assert_eq!(config.name, "host");
        assert_eq!(config.retry_interval, Duration::from_millis(1));
        assert_eq!(config.lock_timeout, Duration::ZERO);
        assert_eq!(config.shared_memory, !cfg!(feature = "noshm"));
    }

    #[test]
    fn test_builder() {
        let config = VfsConfig::default()
            .name("other")
            .shared_memory(false)
            .retry_interval(Duration::ZERO)
            .lock_timeout(Duration::from_millis(50));
        assert_eq!(config.name, "other");
        assert!(!config.shared_memory);
        assert_eq!(config.retry_interval, Duration::from_micros(1));
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
    }
}
