// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use thiserror::Error;

pub mod bitpos_iterator;
pub mod iova_bitmap;
pub mod memory_range;

pub use iova_bitmap::{AtomicIovaBitmap, IovaBitmap};
pub use memory_range::{MemoryRange, MemoryRangeTable};

#[derive(Error, Debug)]
pub enum MigratableError {
    #[error("Failed to start dirty logging for migratable component")]
    StartDirtyLog(#[source] anyhow::Error),

    #[error("Failed to stop dirty logging for migratable component")]
    StopDirtyLog(#[source] anyhow::Error),

    #[error("Failed to retrieve dirty ranges for migratable component")]
    DirtyLog(#[source] anyhow::Error),
}

/// Dirty logging hooks of a component whose memory writes must be tracked
/// while the VM keeps running.
///
/// The migration orchestrator calls `start_dirty_log` once, then repeatedly
/// `dirty_log` to learn which ranges changed since the previous call, and
/// finally `stop_dirty_log`.
pub trait Migratable: Send {
    fn start_dirty_log(&mut self) -> std::result::Result<(), MigratableError> {
        Ok(())
    }

    fn stop_dirty_log(&mut self) -> std::result::Result<(), MigratableError> {
        Ok(())
    }

    fn dirty_log(&mut self) -> std::result::Result<MemoryRangeTable, MigratableError> {
        Ok(MemoryRangeTable::default())
    }
}
