use super::{AllocRequest, AllocatorBackend, BackendEnv, MemorySource};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::segment::SegmentTableBuilder;
use alloc::vec::Vec;
use log::debug;

/// Memory exported by another driver as a dma-buf.
///
/// The exporter owns the pages; freeing a handle only drops the attachment.
#[derive(Debug, Default)]
pub struct ImportedDmaBuf;

impl ImportedDmaBuf {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AllocatorBackend for ImportedDmaBuf {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        let MemorySource::DmaBuf(fd) = request.source else {
            return Err(VidMemError::InvalidArgument("dma-buf import needs a descriptor"));
        };
        if fd < 0 {
            return Err(VidMemError::InvalidArgument("negative file descriptor"));
        }
        let attachment = env.os.dma_buf_attach(fd)?;

        let ranges: Vec<_> = attachment
            .ranges
            .iter()
            .map(|&(pa, len)| (env.to_device(pa), len))
            .collect();
        let table = SegmentTableBuilder::from_ranges(&ranges).and_then(|t| {
            if t.total_len() < request.size {
                Err(VidMemError::InvalidArgument("dma-buf is smaller than the request"))
            } else {
                Ok(t)
            }
        });
        let table = match table {
            Ok(t) => t,
            Err(e) => {
                env.os.dma_buf_detach(attachment.id);
                return Err(e);
            }
        };
        debug!(
            "{}: fd {fd} attached as #{} ({} segment(s))",
            env.name,
            attachment.id,
            table.segment_count()
        );

        Ok(BackendAllocation {
            rounded_size: table.total_len(),
            table,
            private: BackendPrivate::DmaBuf {
                attachment: attachment.id,
            },
        })
    }

    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::DmaBuf { attachment } = backing.private else {
            return Err(VidMemError::InvalidArgument("not a dma-buf import"));
        };
        env.os.dma_buf_detach(attachment);
        Ok(())
    }
}
