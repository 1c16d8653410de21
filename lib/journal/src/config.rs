use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on an individual record's encoded payload.
///
/// Records whose `data` exceeds this many bytes fail to encode (`§3` of the data model).
pub const DEFAULT_MAX_RECORD_SIZE: usize = 8 * 1024 * 1024;

/// Default interval between forced `fsync`s of dirty segments.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Durability policy for segment writers, mirroring the durability/performance tradeoff the
/// teacher's buffer exposes via `DiskBufferConfig::flush_interval`, generalized into an explicit
/// enum since this crate is synchronous and has no background flush task of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// `fsync` after every single append. Maximum durability, lowest throughput.
    Always,
    /// Group writes and `fsync` no later than the given interval after the first unsynced write.
    Interval(Duration),
    /// Never explicitly `fsync`; rely on the OS to eventually flush the page cache.
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Interval(DEFAULT_SYNC_INTERVAL)
    }
}

/// Configuration for a [`crate::journal::Journal`].
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub(crate) dir: PathBuf,
    pub(crate) max_record_size: usize,
    pub(crate) sync_policy: SyncPolicy,
}

impl JournalConfig {
    /// Starts building a config rooted at the given directory.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> JournalConfigBuilder {
        JournalConfigBuilder {
            dir: dir.as_ref().to_path_buf(),
            max_record_size: None,
            sync_policy: None,
        }
    }

    /// Directory this journal reads and writes files in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maximum size, in bytes, of an encoded record's payload.
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Durability policy applied to segment writers opened under this config.
    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync_policy
    }
}

/// Builder for [`JournalConfig`].
pub struct JournalConfigBuilder {
    dir: PathBuf,
    max_record_size: Option<usize>,
    sync_policy: Option<SyncPolicy>,
}

impl JournalConfigBuilder {
    /// Sets the maximum size, in bytes, of an encoded record's payload.
    ///
    /// Defaults to [`DEFAULT_MAX_RECORD_SIZE`].
    pub fn max_record_size(mut self, amount: usize) -> Self {
        self.max_record_size = Some(amount);
        self
    }

    /// Sets the durability policy used by segment writers.
    ///
    /// Defaults to [`SyncPolicy::Interval`] with [`DEFAULT_SYNC_INTERVAL`].
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = Some(policy);
        self
    }

    /// Consumes the builder, producing a [`JournalConfig`].
    pub fn build(self) -> JournalConfig {
        JournalConfig {
            dir: self.dir,
            max_record_size: self.max_record_size.unwrap_or(DEFAULT_MAX_RECORD_SIZE),
            sync_policy: self.sync_policy.unwrap_or_default(),
        }
    }
}
