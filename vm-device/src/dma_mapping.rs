// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::io;
use std::sync::Arc;

use log::warn;

/// Direction of a DMA transfer, seen from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads host memory.
    ToDevice,
    /// The device writes host memory.
    FromDevice,
    /// The device may read and write host memory.
    Bidirectional,
}

impl DmaDirection {
    /// Whether the device is allowed to read through a mapping of this direction.
    pub fn device_reads(self) -> bool {
        matches!(self, DmaDirection::ToDevice | DmaDirection::Bidirectional)
    }

    /// Whether the device is allowed to write through a mapping of this direction.
    pub fn device_writes(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

/// Trait meant for making host buffers addressable by a device, typically
/// through the IOMMU sitting in front of it.
pub trait DmaMapping: Send + Sync {
    /// Map `size` bytes of host memory at `host_addr` and return the address
    /// the device must use to reach it.
    fn map(&self, host_addr: u64, size: u64, dir: DmaDirection) -> io::Result<u64>;

    /// Unmap a range previously returned by `map`.
    fn unmap(&self, dma_addr: u64, size: u64, dir: DmaDirection) -> io::Result<()>;

    /// Largest contiguous fragment the device accepts in a scatter list.
    fn max_segment_size(&self) -> u64 {
        u64::from(u32::MAX)
    }
}

/// A host buffer mapped for device access.
///
/// The mapping lives exactly as long as the handle: dropping it unmaps the
/// range, so every exit path of the code holding it releases the mapping.
pub struct DmaBuffer {
    mapping: Arc<dyn DmaMapping>,
    dma_addr: u64,
    size: u64,
    dir: DmaDirection,
}

impl DmaBuffer {
    /// Map `size` bytes at `host_addr`.
    ///
    /// The caller must keep the host memory alive and in place for as long
    /// as the returned handle exists.
    pub fn map(
        mapping: &Arc<dyn DmaMapping>,
        host_addr: u64,
        size: u64,
        dir: DmaDirection,
    ) -> io::Result<Self> {
        let dma_addr = mapping.map(host_addr, size, dir)?;

        Ok(DmaBuffer {
            mapping: mapping.clone(),
            dma_addr,
            size,
            dir,
        })
    }

    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn direction(&self) -> DmaDirection {
        self.dir
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.mapping.unmap(self.dma_addr, self.size, self.dir) {
            warn!(
                "Failed to unmap DMA buffer 0x{:x} (size 0x{:x}): {}",
                self.dma_addr, self.size, e
            );
        }
    }
}
