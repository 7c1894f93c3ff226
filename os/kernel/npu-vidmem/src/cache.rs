//! CPU cache maintenance around device access.
//!
//! A [`CacheSync`] is built once per handle at allocation time from the
//! handle's segment table and released when the handle is freed. Backends
//! whose memory is mapped uncached or write-combined never build one; flushes
//! on their handles are no-ops.

use crate::backend::BackendEnv;
use crate::error::Result;
use crate::os::{OsMemory, SgTableId};
use crate::segment::PhysicalSegmentTable;
use log::{debug, error};

/// Direction of a maintenance operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheOp {
    /// Write dirty lines back before the device reads.
    Clean,
    /// Drop stale lines before the CPU reads what the device wrote.
    Invalidate,
    CleanAndInvalidate,
}

/// Scatter list kept for the lifetime of one handle.
#[derive(Debug, Eq, PartialEq)]
pub struct CacheSync {
    sg: SgTableId,
    segments: usize,
}

impl CacheSync {
    /// Build the scatter list, or return `None` when the backend's memory
    /// needs no maintenance.
    ///
    /// # Errors
    /// Propagates scatter list allocation failures from the OS.
    pub fn setup(env: &BackendEnv<'_>, table: &PhysicalSegmentTable) -> Result<Option<Self>> {
        if !env.capabilities.cache_mode().needs_sync() {
            return Ok(None);
        }
        let ranges = table.cpu_ranges(env.translation);
        let sg = env.os.sg_create(&ranges).inspect_err(|e| {
            error!("{}: scatter list setup failed: {e}", env.name);
        })?;
        debug!(
            "{}: scatter list {sg:?} over {} segment(s)",
            env.name,
            ranges.len()
        );
        Ok(Some(Self {
            sg,
            segments: ranges.len(),
        }))
    }

    /// # Errors
    /// Propagates the OS error if the scatter list cannot be synced.
    pub fn sync(&self, os: &dyn OsMemory, op: CacheOp) -> Result<()> {
        os.sg_sync(self.sg, op)?;
        Ok(())
    }

    pub fn release(self, os: &dyn OsMemory) {
        os.sg_release(self.sg);
    }

    #[must_use]
    pub const fn segment_count(&self) -> usize {
        self.segments
    }
}
