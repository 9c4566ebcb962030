//! Ambient configuration (§1 Non-goals: "no CLI parsing, config
//! reading" — but a validated config *struct* is still the boundary
//! the rest of the engine is built against, the way the teacher's
//! `Config` types validate MMIO-derived parameters before trusting
//! them).

use thiserror::Error;

/// Static parameters for one virtio-blk device, validated once at
/// registration time rather than re-checked on every request. Fields
/// are private so [`BlockDevConfig::new`] is the only way to build one
/// — there is no path that skips the power-of-two/nonzero checks.
#[derive(Debug, Clone, Copy)]
pub struct BlockDevConfig {
    capacity_sectors: u64,
    block_size: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("block size {0} is not a power of two")]
    BlockSizeNotPowerOfTwo(u32),
    #[error("block size {0} is smaller than the minimum sector size of 512")]
    BlockSizeTooSmall(u32),
    #[error("device capacity of 0 sectors is not valid")]
    ZeroCapacity,
    #[error("queue size {0} must be a nonzero power of two no greater than 32768")]
    BadQueueSize(u32),
}

impl BlockDevConfig {
    pub fn new(capacity_sectors: u64, block_size: u32) -> Result<Self, ConfigError> {
        if block_size < 512 {
            return Err(ConfigError::BlockSizeTooSmall(block_size));
        }
        if !block_size.is_power_of_two() {
            return Err(ConfigError::BlockSizeNotPowerOfTwo(block_size));
        }
        if capacity_sectors == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(Self {
            capacity_sectors,
            block_size,
        })
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

/// Static parameters for one virtqueue, validated at `register_blockdev`.
/// Fields are private; [`QueueConfig::new`] is the only constructor.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    qsz: u16,
    desc_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
}

impl QueueConfig {
    pub fn new(qsz: u16, desc_gpa: u64, avail_gpa: u64, used_gpa: u64) -> Result<Self, ConfigError> {
        if qsz == 0 || !qsz.is_power_of_two() || qsz > 32768 {
            return Err(ConfigError::BadQueueSize(qsz as u32));
        }
        Ok(Self {
            qsz,
            desc_gpa,
            avail_gpa,
            used_gpa,
        })
    }

    pub fn qsz(&self) -> u16 {
        self.qsz
    }

    pub fn desc_gpa(&self) -> u64 {
        self.desc_gpa
    }

    pub fn avail_gpa(&self) -> u64 {
        self.avail_gpa
    }

    pub fn used_gpa(&self) -> u64 {
        self.used_gpa
    }
}
