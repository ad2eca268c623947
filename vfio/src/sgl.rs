// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Scatter lists describing a window of a host bitmap to the device.

use std::mem::size_of;
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use vm_device::{DmaBuffer, DmaDirection, DmaMapping};
use vm_memory::{Le32, Le64};

use crate::bitmap::HostBuffer;
use crate::cmds::SgElem;
use crate::dirty::{DirtyError, Result};

/// A contiguous piece of host memory, not yet mapped for the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub host_addr: u64,
    pub len: u64,
}

/// Largest fragment gathered for a device accepting `max_segment` bytes per
/// scatter element: whole host pages, at least one, and small enough for the
/// 32-bit element length.
pub fn segment_limit(max_segment: u64, host_page_size: u64) -> u64 {
    let max_segment = max_segment.min(u64::from(u32::MAX));
    (max_segment - max_segment % host_page_size).max(host_page_size)
}

/// Split `[offset, offset + len)` of `buffer` into fragments.
///
/// The window is first expanded to the host pages it touches; every page is
/// resolved against the pages backing `buffer`, then consecutive pages are
/// gathered into fragments of at most [`segment_limit`] bytes, so a window
/// never produces more fragments than the pages it spans.
pub fn gather_fragments(
    buffer: &HostBuffer,
    offset: u64,
    len: u64,
    host_page_size: u64,
    max_segment: u64,
) -> Result<Vec<Fragment>> {
    let mut fragments: Vec<Fragment> = Vec::new();
    if len == 0 {
        return Ok(fragments);
    }

    let base = buffer.host_addr();
    let backed_end = base + buffer.mapped_len() as u64;
    let start = base + offset;
    let page_offset = start % host_page_size;
    let first_page = start - page_offset;
    let npages = (len + page_offset).div_ceil(host_page_size);
    let max_segment = segment_limit(max_segment, host_page_size);

    let mut remaining = len;
    for i in 0..npages {
        let page = first_page + i * host_page_size;
        if page < base || page + host_page_size > backed_end {
            return Err(DirtyError::ResourceExhausted(anyhow!(
                "Host page 0x{:x} is not backed by the bitmap buffer",
                page
            )));
        }

        let (addr, chunk) = if i == 0 {
            (start, (host_page_size - page_offset).min(remaining))
        } else {
            (page, host_page_size.min(remaining))
        };
        remaining -= chunk;

        match fragments.last_mut() {
            Some(last)
                if last.host_addr + last.len == addr && last.len + chunk <= max_segment =>
            {
                last.len += chunk
            }
            _ => fragments.push(Fragment {
                host_addr: addr,
                len: chunk,
            }),
        }
    }

    Ok(fragments)
}

/// Device mappings of the fragments of one bitmap transfer. Dropping it
/// unmaps them.
pub struct SglTransfer {
    _mappings: Vec<DmaBuffer>,
    num_sge: u16,
}

impl SglTransfer {
    pub fn num_sge(&self) -> u16 {
        self.num_sge
    }
}

/// Scatter list buffer shared with the device.
///
/// It is sized once for the largest window the region can ever transfer and
/// stays mapped for as long as it exists.
pub struct ScatterList {
    elems: HostBuffer,
    max_sge: usize,
    mapping: DmaBuffer,
}

impl ScatterList {
    pub fn new(dma: &Arc<dyn DmaMapping>, max_sge: usize) -> Result<Self> {
        let len = max_sge * size_of::<SgElem>();
        let elems = HostBuffer::new(len)?;
        let mapping = DmaBuffer::map(
            dma,
            elems.host_addr(),
            len as u64,
            DmaDirection::Bidirectional,
        )
        .map_err(|e| DirtyError::ResourceExhausted(anyhow!(e).context("Failed to map SGL")))?;

        Ok(ScatterList {
            elems,
            max_sge,
            mapping,
        })
    }

    pub fn max_sge(&self) -> usize {
        self.max_sge
    }

    /// Device address of the element array.
    pub fn dma_addr(&self) -> u64 {
        self.mapping.dma_addr()
    }

    pub fn elem(&self, index: usize) -> Result<SgElem> {
        self.elems.read_obj(index * size_of::<SgElem>())
    }

    /// Map `[offset, offset + len)` of `buffer` for `dir` and describe it in
    /// the element array. The mappings last as long as the returned
    /// transfer.
    pub fn load(
        &mut self,
        dma: &Arc<dyn DmaMapping>,
        buffer: &HostBuffer,
        offset: u64,
        len: u64,
        host_page_size: u64,
        dir: DmaDirection,
    ) -> Result<SglTransfer> {
        let fragments =
            gather_fragments(buffer, offset, len, host_page_size, dma.max_segment_size())?;
        let num_sge = u16::try_from(fragments.len()).map_err(|_| {
            DirtyError::InternalInconsistency {
                computed: fragments.len() as u64,
                expected: u64::from(u16::MAX),
            }
        })?;
        if fragments.len() > self.max_sge {
            return Err(DirtyError::InternalInconsistency {
                computed: fragments.len() as u64,
                expected: self.max_sge as u64,
            });
        }

        let mut mappings = Vec::with_capacity(fragments.len());
        for (i, fragment) in fragments.iter().enumerate() {
            let mapping = DmaBuffer::map(dma, fragment.host_addr, fragment.len, dir).map_err(|e| {
                DirtyError::ResourceExhausted(anyhow!(e).context("Failed to map bitmap fragment"))
            })?;

            let elem = SgElem {
                addr: Le64::from(mapping.dma_addr()),
                // Bounded by segment_limit().
                len: Le32::from(fragment.len as u32),
                ..Default::default()
            };
            self.elems.write_obj(i * size_of::<SgElem>(), &elem)?;
            mappings.push(mapping);
        }

        debug!(
            "SGL 0x{:x}: {} fragments for bitmap offset {} len {}",
            self.dma_addr(),
            mappings.len(),
            offset,
            len
        );

        Ok(SglTransfer {
            _mappings: mappings,
            num_sge,
        })
    }
}
