// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::iova_bitmap::IovaBitmap;

#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub gpa: u64,
    pub length: u64,
}

impl MemoryRange {
    fn end(&self) -> u64 {
        self.gpa + self.length
    }
}

/// A list of dirty guest memory ranges.
///
/// As an [`IovaBitmap`] it collects the ranges reported by a dirty tracker,
/// extending the last entry whenever a new range directly follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRangeTable {
    data: Vec<MemoryRange>,
}

impl MemoryRangeTable {
    pub fn regions(&self) -> &[MemoryRange] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sum of the lengths of all ranges.
    pub fn total_length(&self) -> u64 {
        self.data.iter().map(|r| r.length).sum()
    }
}

impl IovaBitmap for MemoryRangeTable {
    fn set(&mut self, iova: u64, length: u64) {
        if length == 0 {
            return;
        }

        if let Some(last) = self.data.last_mut() {
            if last.end() == iova {
                last.length += length;
                return;
            }
        }

        self.data.push(MemoryRange { gpa: iova, length });
    }
}
