// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Sinks receiving dirty IOVA ranges reported by a device.

use std::sync::atomic::{AtomicU64, Ordering};

/// Consumer of dirty page reports, indexed by absolute IOVA.
///
/// A dirty tracker only ever calls `set`; how the ranges are stored is up to
/// the implementation.
pub trait IovaBitmap {
    /// Mark `[iova, iova + length)` as dirty.
    fn set(&mut self, iova: u64, length: u64);
}

/// Page granular bitmap covering a fixed IOVA window, backed by atomic
/// integers so it can be shared with readers while being filled.
#[derive(Debug)]
pub struct AtomicIovaBitmap {
    map: Vec<AtomicU64>,
    base: u64,
    page_size: u64,
    pages: u64,
}

#[allow(clippy::len_without_is_empty)]
impl AtomicIovaBitmap {
    /// Create a bitmap tracking `length` bytes starting at `base`, one bit
    /// per `page_size` page. A partial last page gets a bit too.
    pub fn new(base: u64, length: u64, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        let pages = length.div_ceil(page_size);
        let words = pages.div_ceil(u64::from(u64::BITS));
        let map = (0..words).map(|_| AtomicU64::new(0)).collect();

        AtomicIovaBitmap {
            map,
            base,
            page_size,
            pages,
        }
    }

    /// Number of pages the bitmap can represent.
    pub fn len(&self) -> u64 {
        self.pages
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn is_bit_set(&self, index: u64) -> bool {
        if index >= self.pages {
            return false;
        }

        let word = self.map[(index >> 6) as usize].load(Ordering::Acquire);
        word & (1 << (index & 63)) != 0
    }

    /// Is the page holding `iova` marked dirty? Addresses outside the window
    /// are never dirty.
    pub fn is_addr_set(&self, iova: u64) -> bool {
        match iova.checked_sub(self.base) {
            Some(offset) => self.is_bit_set(offset / self.page_size),
            None => false,
        }
    }

    /// Mark every page touched by `[iova, iova + length)`. Pages outside the
    /// window are silently ignored.
    pub fn set_addr_range(&self, iova: u64, length: u64) {
        if length == 0 {
            return;
        }

        let end = iova.saturating_add(length - 1);
        if end < self.base {
            return;
        }

        let first_bit = iova.saturating_sub(self.base) / self.page_size;
        let last_bit = (end - self.base) / self.page_size;
        for n in first_bit..=last_bit {
            if n >= self.pages {
                break;
            }
            self.map[(n >> 6) as usize].fetch_or(1 << (n & 63), Ordering::SeqCst);
        }
    }

    /// Absolute addresses of all dirty pages, in ascending order.
    pub fn dirty_pages(&self) -> Vec<u64> {
        (0..self.pages)
            .filter(|n| self.is_bit_set(*n))
            .map(|n| self.base + n * self.page_size)
            .collect()
    }

    /// Clear all bits.
    pub fn reset(&self) {
        for word in self.map.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

impl IovaBitmap for AtomicIovaBitmap {
    fn set(&mut self, iova: u64, length: u64) {
        self.set_addr_range(iova, length);
    }
}
