//! Narrow interfaces to the collaborators the service consumes.
//!
//! The flow installer, the numeric tag allocator and the elan resolver are
//! owned by other subsystems. [`LocalTagPool`] is an in-process allocator
//! for tests and the `aclcompile` tool.

use crate::error::{AclServiceError, Result};
use crate::flow::FlowEntry;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Programs flows on switches.
///
/// Implementations batch, retry and serialize per `batch_key`; the service
/// only hands over whole batches and never retries itself.
pub trait FlowInstaller: Send + Sync {
    fn submit(&self, batch_key: &str, flows: Vec<FlowEntry>) -> Result<()>;
}

/// Hands out small integers from a bounded pool.
pub trait TagAllocator: Send + Sync {
    /// Returns the tag for `name`, allocating one if needed.
    fn allocate(&self, pool: &str, name: &str) -> Result<u32>;

    fn release(&self, pool: &str, name: &str) -> Result<()>;
}

/// Resolves the broadcast domain of a port.
pub trait ElanResolver: Send + Sync {
    fn elan_id(&self, interface_id: &str) -> Option<u64>;
}

impl<F> ElanResolver for F
where
    F: Fn(&str) -> Option<u64> + Send + Sync,
{
    fn elan_id(&self, interface_id: &str) -> Option<u64> {
        self(interface_id)
    }
}

/// In-process tag pool: lowest free tag first, idempotent per name.
#[derive(Debug)]
pub struct LocalTagPool {
    pool_name: String,
    min: u32,
    max: u32,
    allocated: Mutex<BTreeMap<String, u32>>,
}

impl LocalTagPool {
    pub fn new(pool_name: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            pool_name: pool_name.into(),
            min,
            max,
            allocated: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn check_pool(&self, pool: &str, name: &str) -> Result<()> {
        if pool != self.pool_name {
            return Err(AclServiceError::tag_allocation(
                pool,
                name,
                format!("unknown pool, this allocator serves '{}'", self.pool_name),
            ));
        }
        Ok(())
    }
}

impl TagAllocator for LocalTagPool {
    fn allocate(&self, pool: &str, name: &str) -> Result<u32> {
        self.check_pool(pool, name)?;
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| AclServiceError::tag_allocation(pool, name, "pool lock poisoned"))?;

        if let Some(tag) = allocated.get(name) {
            return Ok(*tag);
        }

        let mut in_use: Vec<u32> = allocated.values().copied().collect();
        in_use.sort_unstable();
        let mut candidate = self.min;
        for tag in in_use {
            if tag == candidate {
                candidate += 1;
            } else if tag > candidate {
                break;
            }
        }
        if candidate > self.max {
            return Err(AclServiceError::tag_allocation(pool, name, "pool exhausted"));
        }

        allocated.insert(name.to_string(), candidate);
        debug!(pool, name, tag = candidate, "allocated tag");
        Ok(candidate)
    }

    fn release(&self, pool: &str, name: &str) -> Result<()> {
        self.check_pool(pool, name)?;
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| AclServiceError::tag_allocation(pool, name, "pool lock poisoned"))?;
        if let Some(tag) = allocated.remove(name) {
            debug!(pool, name, tag, "released tag");
        }
        Ok(())
    }
}
