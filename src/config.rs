use crate::buffer::slots::SLOT_SIZE_BYTES;
use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_STORAGE_DIR: &str = "qbuf_storage";
pub const DEFAULT_BLOCK_DOMAIN: u16 = 1;
// Used when pool_slots is 0 and installed memory cannot be detected.
pub const DEFAULT_BUFFER_POOL_SLOTS: usize = 1024;
pub const DEFAULT_LOCK_SHARDS: usize = crate::buffer::shard::DEFAULT_LOCK_SHARDS;

// Auto-sizing splits at 32 GiB of installed memory: smaller hosts give
// the pool 70% of it, larger ones 80%.
const AUTO_SIZE_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    // Directory holding block files.
    pub storage_dir: String,
    // Block domain of ids created by this pool, 1..=65535.
    pub block_domain: u16,
    // Soft cap on resident slots. 0 means derive from installed memory.
    pub pool_slots: usize,
    // Number of per-block lock shards.
    pub lock_shards: usize,
}

impl BufferPoolConfig {
    #[inline]
    pub fn storage_dir(mut self, storage_dir: impl Into<String>) -> Self {
        self.storage_dir = storage_dir.into();
        self
    }

    #[inline]
    pub fn block_domain(mut self, block_domain: u16) -> Self {
        self.block_domain = block_domain;
        self
    }

    /// Soft cap on resident slots. 0 derives the cap from installed
    /// memory at pool construction.
    #[inline]
    pub fn pool_slots(mut self, pool_slots: usize) -> Self {
        self.pool_slots = pool_slots;
        self
    }

    /// Soft cap expressed as a byte size, rounded up to whole slots.
    #[inline]
    pub fn pool_size<T>(mut self, pool_size: T) -> Self
    where
        Byte: From<T>,
    {
        let bytes = Byte::from(pool_size).as_u64() as usize;
        self.pool_slots = crate::buffer::slots::slots_needed_for_bytes(bytes);
        self
    }

    #[inline]
    pub fn lock_shards(mut self, lock_shards: usize) -> Self {
        self.lock_shards = lock_shards;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_domain == 0 {
            return Err(Error::InvalidBlockDomain(0));
        }
        if self.lock_shards == 0 {
            return Err(Error::InvalidConfig(String::from(
                "lock_shards must be at least 1",
            )));
        }
        Ok(())
    }

    /// The configured slot cap, or one derived from installed memory
    /// when set to 0.
    pub fn resolved_pool_slots(&self) -> usize {
        if self.pool_slots != 0 {
            return self.pool_slots;
        }
        match installed_memory_bytes() {
            Some(installed) => {
                let fraction = if installed < AUTO_SIZE_THRESHOLD_BYTES {
                    70
                } else {
                    80
                };
                let pool_bytes = installed / 100 * fraction;
                ((pool_bytes as usize) / SLOT_SIZE_BYTES).max(1)
            }
            None => {
                log::info!(
                    "could not detect installed memory, defaulting to {} pool slots",
                    DEFAULT_BUFFER_POOL_SLOTS
                );
                DEFAULT_BUFFER_POOL_SLOTS
            }
        }
    }
}

impl Default for BufferPoolConfig {
    #[inline]
    fn default() -> Self {
        BufferPoolConfig {
            storage_dir: String::from(DEFAULT_STORAGE_DIR),
            block_domain: DEFAULT_BLOCK_DOMAIN,
            pool_slots: 0,
            lock_shards: DEFAULT_LOCK_SHARDS,
        }
    }
}

fn installed_memory_bytes() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some(pages as u64 * page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_builders() {
        let config = BufferPoolConfig::default()
            .storage_dir("/tmp/qbuf")
            .block_domain(7)
            .pool_slots(64)
            .lock_shards(32);
        config.validate().unwrap();
        assert_eq!(config.storage_dir, "/tmp/qbuf");
        assert_eq!(config.block_domain, 7);
        assert_eq!(config.resolved_pool_slots(), 64);
        assert_eq!(config.lock_shards, 32);
    }

    #[test]
    fn test_pool_size_rounds_up_to_slots() {
        let config = BufferPoolConfig::default().pool_size(Byte::from_u64(5 * 1024 * 1024));
        assert_eq!(config.pool_slots, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            BufferPoolConfig::default().block_domain(0).validate(),
            Err(Error::InvalidBlockDomain(0))
        ));
        assert!(matches!(
            BufferPoolConfig::default().lock_shards(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_auto_sized_pool_is_positive() {
        let config = BufferPoolConfig::default();
        assert!(config.resolved_pool_slots() >= 1);
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
storage_dir = "/var/lib/qbuf"
block_domain = 3
pool_slots = 128
lock_shards = 64
"#;
        let config = BufferPoolConfig::from_toml_str(text).unwrap();
        assert_eq!(config.storage_dir, "/var/lib/qbuf");
        assert_eq!(config.block_domain, 3);
        assert_eq!(config.pool_slots, 128);
        assert_eq!(config.lock_shards, 64);

        assert!(matches!(
            BufferPoolConfig::from_toml_str("block_domain = \"oops\""),
            Err(Error::InvalidConfig(_))
        ));
    }
}
