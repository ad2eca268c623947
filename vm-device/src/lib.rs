// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Device-side plumbing shared by pass-through device drivers.

pub mod dma_mapping;

pub use dma_mapping::{DmaBuffer, DmaDirection, DmaMapping};
