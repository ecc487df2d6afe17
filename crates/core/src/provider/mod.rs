//! C3: the provider adapter boundary.
//!
//! The back-end-specific implementations (S3, Sia, remote-mount) are out of
//! scope; this module carries the trait contract plus one complete reference
//! adapter ([`passthrough`]) so the crate builds and tests end-to-end.
//!
//! Shaped after `librqbit`'s `TorrentStorage` trait (`storage/mod.rs`):
//! deliberately synchronous, not async — every implementation is expected to
//! block the calling worker thread, never a cooperative runtime.

pub mod passthrough;

use std::path::Path;

use crate::error::Result;
use crate::stop::StopFlag;

#[derive(Debug, Clone)]
pub struct ProviderAttrs {
    pub size: u64,
    pub directory: bool,
    pub modified_nanos: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub attrs: ProviderAttrs,
}

/// Back-end-specific operations consumed from C3. Implementations must be
/// `Send + Sync`: callers hold an `Arc<dyn Provider>` shared across worker
/// threads.
pub trait Provider: Send + Sync {
    fn list(&self, path: &str) -> Result<Vec<ProviderEntry>>;
    fn head(&self, path: &str) -> Result<ProviderAttrs>;

    /// Reads `[offset, offset+len)`. `token` carries the item's
    /// `encryption_token`, if any, so an encrypt-pass-through adapter can
    /// decrypt what it fetches. Implementations must check `stop`
    /// periodically on long transfers and return `DownloadStopped` promptly.
    fn read_range(&self, path: &str, offset: u64, len: u64, token: Option<&str>, stop: &StopFlag) -> Result<Vec<u8>>;

    /// Uploads the whole local file at `source_path` as `path`.
    fn upload(&self, path: &str, source_path: &Path, stop: &StopFlag) -> Result<()>;

    fn mkdir(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;

    /// `false` unless the concrete back-end supports an atomic server-side
    /// rename; C5 must fall back to copy+delete (or reject) otherwise.
    fn supports_rename(&self) -> bool {
        false
    }

    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(crate::error::DataPlaneError::NotSupported)
    }

    /// `true` for back-ends that reject writes outright (e.g. a read-only
    /// mount). Used by strategy selection and idle-close eligibility.
    fn is_read_only(&self) -> bool {
        false
    }
}
