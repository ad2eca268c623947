// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Drives the dirty tracker against an emulated VF: start tracking, let the
//! device write guest memory, then collect the dirty ranges round after
//! round.

use std::ops::Range;
use std::sync::Arc;

use log::info;
use thiserror::Error;
use vfio::{DirtyError, DirtyTracker, DirtyTrackerConfig, EmulatedDevice, MAX_TRACKED_REGIONS};
use vm_migration::MemoryRangeTable;

use crate::config::DemoConfig;

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("Failed to start dirty tracking")]
    StartTracking(#[source] DirtyError),
    #[error("Failed to sync dirty pages of round {0}")]
    Sync(u32, #[source] DirtyError),
}

/// Dirty ranges found by each sync round.
pub fn run(config: &DemoConfig) -> Result<Vec<MemoryRangeTable>, DemoError> {
    let device = Arc::new(EmulatedDevice::new(config.vf_id, MAX_TRACKED_REGIONS));
    if let Some(max_segment) = config.max_segment {
        device.set_max_segment_size(max_segment);
    }

    let mut tracker = DirtyTracker::new(
        DirtyTrackerConfig {
            vf_id: config.vf_id,
        },
        device.clone(),
        device.clone(),
    );

    let ranges: Vec<Range<u64>> = config
        .ranges
        .iter()
        .map(|r| r.start..r.start + r.size)
        .collect();
    tracker
        .start_dirty_tracking(&ranges, config.page_size)
        .map_err(DemoError::StartTracking)?;

    let (start, end) = match tracker.region() {
        Some(region) => (region.start(), region.end()),
        None => return Err(DemoError::StartTracking(DirtyError::NotTracking)),
    };
    let window = config.window.unwrap_or(end - start);

    for write in config.writes.iter() {
        let pages = device.dma_write(write.iova, write.size);
        info!(
            "Device wrote 0x{:x}+0x{:x}, {} tracked pages",
            write.iova, write.size, pages
        );
    }

    let mut rounds = Vec::new();
    for round in 0..config.rounds {
        let mut table = MemoryRangeTable::default();
        let mut iova = start;
        while iova < end {
            let length = window.min(end - iova);
            tracker
                .report_dirty_pages(&mut table, iova, length)
                .map_err(|e| DemoError::Sync(round, e))?;
            iova += length;
        }

        info!(
            "Round {}: {} dirty ranges, {} bytes",
            round,
            table.regions().len(),
            table.total_length()
        );
        rounds.push(table);
    }

    tracker.stop_dirty_tracking(true);
    Ok(rounds)
}
