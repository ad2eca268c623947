// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host side storage of the dirty bitmaps.
//!
//! The device keeps, per tracked page, a sequence bit it flips away from the
//! acknowledge bit when the page gets written. The host mirrors both: the
//! sequence bitmap is fetched from the device on every sync, compared
//! against the acknowledge bitmap, and the acknowledge bitmap is then
//! updated and pushed back so the device only reports newer writes.

use anyhow::anyhow;
use libc::{sysconf, _SC_PAGESIZE};
use vm_memory::{ByteValued, Bytes, MmapRegion, VolatileMemory};
use vm_migration::bitpos_iterator::BitposIteratorExt;
use vm_migration::IovaBitmap;

use crate::dirty::{DirtyError, Result};

/// Safe wrapper for `sysconf(_SC_PAGESIZE)`.
#[inline(always)]
pub(crate) fn pagesize() -> usize {
    // SAFETY: Trivially safe
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

/// Zeroed, page aligned host memory the device may reach through DMA.
///
/// The memory is owned by an anonymous mapping rather than by Rust
/// references, so the device can write it while the host holds the buffer.
/// All host accesses are bounds checked volatile copies.
pub struct HostBuffer {
    mmap: MmapRegion<()>,
    len: usize,
}

impl HostBuffer {
    pub fn new(len: usize) -> Result<Self> {
        // Whole pages, so every page of the buffer can be handed to the
        // device.
        let size = len.max(1).next_multiple_of(pagesize());
        let mmap = MmapRegion::<()>::new(size).map_err(|e| {
            DirtyError::ResourceExhausted(anyhow!(
                "Failed to allocate {} bytes of host memory: {:?}",
                len,
                e
            ))
        })?;

        Ok(HostBuffer { mmap, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host virtual address of the first byte.
    pub fn host_addr(&self) -> u64 {
        self.mmap.as_ptr() as u64
    }

    /// Size of the underlying mapping, a multiple of the host page size.
    pub fn mapped_len(&self) -> usize {
        self.mmap.size()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DirtyError::InternalInconsistency {
                computed: (offset as u64).saturating_add(len as u64),
                expected: self.len as u64,
            }),
        }
    }

    pub fn read_slice(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.mmap
            .as_volatile_slice()
            .read_slice(buf, offset)
            .map_err(|e| DirtyError::ResourceExhausted(anyhow!("Host buffer read: {:?}", e)))
    }

    pub fn write_slice(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.mmap
            .as_volatile_slice()
            .write_slice(buf, offset)
            .map_err(|e| DirtyError::ResourceExhausted(anyhow!("Host buffer write: {:?}", e)))
    }

    pub fn read_obj<T: ByteValued + Default>(&self, offset: usize) -> Result<T> {
        let mut value = T::default();
        self.read_slice(offset, value.as_mut_slice())?;
        Ok(value)
    }

    pub fn write_obj<T: ByteValued>(&self, offset: usize, value: &T) -> Result<()> {
        self.write_slice(offset, value.as_slice())
    }

    /// Copy of the whole buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.len];
        self.read_slice(0, &mut data)?;
        Ok(data)
    }
}

/// The sequence and acknowledge bitmaps of one region. Both always have the
/// same length and live and die together.
pub struct BitmapPair {
    seq: HostBuffer,
    ack: HostBuffer,
}

impl BitmapPair {
    /// Allocate two zeroed bitmaps of `bytes` bytes each.
    pub fn new(bytes: usize) -> Result<Self> {
        let seq = HostBuffer::new(bytes)?;
        let ack = HostBuffer::new(bytes)?;

        Ok(BitmapPair { seq, ack })
    }

    /// Length of each bitmap in bytes.
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    pub fn seq(&self) -> &HostBuffer {
        &self.seq
    }

    pub fn ack(&self) -> &HostBuffer {
        &self.ack
    }

    /// Diff the sequence window `[offset, offset + len)` against the
    /// acknowledge window, mark every changed page in `dirty` and make the
    /// acknowledge window mirror the sequence window.
    ///
    /// `len` must be a multiple of 8. Returns the number of dirty pages.
    pub fn merge_window(
        &self,
        offset: usize,
        len: usize,
        region_start: u64,
        page_size: u64,
        dirty: &mut dyn IovaBitmap,
    ) -> Result<u64> {
        let mut seq = vec![0u8; len];
        let mut ack = vec![0u8; len];
        self.seq.read_slice(offset, &mut seq)?;
        self.ack.read_slice(offset, &mut ack)?;

        let first_bit = offset as u64 * 8;
        let count = merge_dirty_words(&seq, &mut ack, first_bit, region_start, page_size, dirty);

        self.ack.write_slice(offset, &ack)?;
        Ok(count)
    }
}

fn le_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// XOR little-endian 64-bit words of `seq` and `ack`, copy `seq` into `ack`
/// and report every differing bit to `dirty` as the page at
/// `region_start + (first_bit + bit) * page_size`.
///
/// Both slices must have the same length, a multiple of 8 bytes.
pub fn merge_dirty_words(
    seq: &[u8],
    ack: &mut [u8],
    first_bit: u64,
    region_start: u64,
    page_size: u64,
    dirty: &mut dyn IovaBitmap,
) -> u64 {
    debug_assert_eq!(seq.len(), ack.len());
    debug_assert_eq!(seq.len() % 8, 0);

    let diffs = seq
        .chunks_exact(8)
        .zip(ack.chunks_exact_mut(8))
        .map(|(s, a)| {
            let xor = le_word(s) ^ le_word(a);
            // Prepare for the next write ack.
            a.copy_from_slice(s);
            xor
        });

    let mut count = 0;
    for bit in diffs.bit_positions_from(first_bit) {
        dirty.set(region_start + bit * page_size, page_size);
        count += 1;
    }

    count
}
