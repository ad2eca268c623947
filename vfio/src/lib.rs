// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live migration dirty page tracking for PDS VFIO virtual functions.
//!
//! [`DirtyTracker`] asks the device to track the pages it writes within one
//! guest region, and turns the device's bitmaps into addresses reported to
//! an [`IovaBitmap`](vm_migration::IovaBitmap) sink. The device is reached
//! through an [`AdminQueue`] and a [`DmaMapping`](vm_device::DmaMapping)
//! service; [`EmulatedDevice`] provides both in software.

pub mod bitmap;
pub mod cmds;
pub mod dirty;
pub mod emulated;
pub mod ranges;
pub mod region;
pub mod sgl;

pub use cmds::{AdminQueue, AdminqError, LmStatus, Opcode, Status};
pub use dirty::{DirtyError, DirtyTracker, DirtyTrackerConfig, Result, MAX_TRACKED_REGIONS};
pub use emulated::EmulatedDevice;
pub use ranges::combine_iova_ranges;
pub use region::DirtyRegion;
