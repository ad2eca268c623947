// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use vm_device::DmaMapping;

use crate::bitmap::BitmapPair;
use crate::dirty::Result;
use crate::sgl::ScatterList;

/// Size in bytes of each bitmap needed to track `page_count` pages. Always
/// whole 64-bit words.
pub fn bitmap_bytes(page_count: u64) -> u64 {
    page_count.div_ceil(u64::from(u64::BITS)) * 8
}

/// Scatter elements needed for the largest bitmap transfer of a region with
/// `page_count` pages, when every element covers at most one host page.
pub fn max_sge_count(page_count: u64, host_page_size: u64) -> u64 {
    page_count.div_ceil(host_page_size * 8)
}

/// The guest memory span under dirty tracking and the host resources
/// backing it.
pub struct DirtyRegion {
    start: u64,
    size: u64,
    page_size: u64,
    page_count: u64,
    bitmaps: BitmapPair,
    sgl: ScatterList,
}

impl DirtyRegion {
    /// Allocate the bitmaps and the scatter list of a region of
    /// `page_count` pages. Nothing is kept on failure.
    pub fn new(
        dma: &Arc<dyn DmaMapping>,
        start: u64,
        size: u64,
        page_size: u64,
        page_count: u64,
        host_page_size: u64,
    ) -> Result<Self> {
        let bitmaps = BitmapPair::new(bitmap_bytes(page_count) as usize)?;
        // An unaligned window can straddle one extra host page.
        let max_sge = max_sge_count(page_count, host_page_size) + 1;
        let sgl = ScatterList::new(dma, max_sge as usize)?;

        Ok(DirtyRegion {
            start,
            size,
            page_size,
            page_count,
            bitmaps,
            sgl,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn bmp_bytes(&self) -> u64 {
        self.bitmaps.len() as u64
    }

    pub fn bitmaps(&self) -> &BitmapPair {
        &self.bitmaps
    }

    pub fn sgl(&self) -> &ScatterList {
        &self.sgl
    }

    pub(crate) fn parts_mut(&mut self) -> (&BitmapPair, &mut ScatterList) {
        (&self.bitmaps, &mut self.sgl)
    }
}
