// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Software model of a PDS VF with live migration support.
//!
//! The model answers the dirty tracking admin commands the way the device
//! firmware does and sits behind its own IOMMU: host buffers are reachable
//! only through device addresses handed out by [`DmaMapping::map`], with the
//! mapping direction enforced on every access. It backs the `pds-dirty`
//! binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem::size_of;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use vm_device::{DmaDirection, DmaMapping};
use vm_memory::{ByteValued, Le32};

use crate::cmds::{
    decode, AdminQueue, AdminqError, DirtyDisableCmd, DirtyEnableCmd, DirtyRegionInfo,
    DirtySeqAckCmd, DirtyStatusCmd, DirtyStatusComp, HostVfStatusCmd, LmStatus, Opcode, SgElem,
    Status,
};

const IOVA_BASE: u64 = 0x1_0000_0000;
const IOVA_ALIGN: u64 = 0x1000;

#[derive(Clone, Copy, Debug)]
struct Mapping {
    host_addr: u64,
    size: u64,
    dir: DmaDirection,
}

/// Device side state of one tracked region.
struct TrackedRegion {
    base: u64,
    page_count: u32,
    page_size_log2: u8,
    seq: Vec<u8>,
    ack: Vec<u8>,
}

impl TrackedRegion {
    fn page_size(&self) -> u64 {
        1 << self.page_size_log2
    }

    fn end(&self) -> u64 {
        self.base + u64::from(self.page_count) * self.page_size()
    }
}

struct DeviceState {
    max_regions: u8,
    page_count_align: u32,
    max_segment_size: u64,
    offline: bool,
    lm_status: Option<LmStatus>,
    regions: Vec<TrackedRegion>,
    next_iova: u64,
    mappings: BTreeMap<u64, Mapping>,
    failures: HashMap<Opcode, Status>,
    history: Vec<Opcode>,
}

type DeviceResult<T> = std::result::Result<T, Status>;

impl DeviceState {
    fn mapping_for(&self, iova: u64, len: u64, device_writes: bool) -> DeviceResult<u64> {
        let (base, mapping) = self
            .mappings
            .range(..=iova)
            .next_back()
            .ok_or(Status::BadAddr)?;

        let end = iova.checked_add(len).ok_or(Status::BadAddr)?;
        if end > base + mapping.size {
            return Err(Status::BadAddr);
        }
        let allowed = if device_writes {
            mapping.dir.device_writes()
        } else {
            mapping.dir.device_reads()
        };
        if !allowed {
            warn!(
                "Device {} through 0x{:x} mapped {:?}",
                if device_writes { "write" } else { "read" },
                base,
                mapping.dir
            );
            return Err(Status::BadAddr);
        }

        Ok(mapping.host_addr + (iova - base))
    }

    fn dma_read(&self, iova: u64, buf: &mut [u8]) -> DeviceResult<()> {
        let host_addr = self.mapping_for(iova, buf.len() as u64, false)?;
        // SAFETY: the range lies inside a live mapping, and whoever mapped it
        // keeps the host memory valid until it is unmapped.
        unsafe {
            std::ptr::copy_nonoverlapping(host_addr as *const u8, buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    fn dma_write(&self, iova: u64, buf: &[u8]) -> DeviceResult<()> {
        let host_addr = self.mapping_for(iova, buf.len() as u64, true)?;
        // SAFETY: same as dma_read, and the mapping allows device writes.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), host_addr as *mut u8, buf.len()) };
        Ok(())
    }

    fn read_obj<T: ByteValued + Default>(&self, iova: u64) -> DeviceResult<T> {
        let mut value = T::default();
        self.dma_read(iova, value.as_mut_slice())?;
        Ok(value)
    }

    fn host_vf_status(&mut self, cmd: HostVfStatusCmd) -> DeviceResult<Vec<u8>> {
        self.lm_status = Some(match cmd.status {
            0 => LmStatus::None,
            1 => LmStatus::InProgress,
            _ => return Err(Status::Inval),
        });
        Ok(Vec::new())
    }

    fn dirty_status(&self, cmd: DirtyStatusCmd) -> DeviceResult<Vec<u8>> {
        let regions_dma = cmd.regions_dma.to_native();
        if regions_dma != 0 {
            for (i, region) in self
                .regions
                .iter()
                .take(usize::from(cmd.max_regions))
                .enumerate()
            {
                let info = DirtyRegionInfo {
                    dma_base: region.base.into(),
                    page_count: region.page_count.into(),
                    page_size_log2: region.page_size_log2,
                    ..Default::default()
                };
                let iova = regions_dma + (i * size_of::<DirtyRegionInfo>()) as u64;
                self.dma_write(iova, info.as_slice())?;
            }
        }

        let comp = DirtyStatusComp {
            max_regions: self.max_regions,
            num_regions: self.regions.len() as u8,
            ..Default::default()
        };
        Ok(comp.as_slice().to_vec())
    }

    fn dirty_enable(&mut self, cmd: DirtyEnableCmd) -> DeviceResult<Vec<u8>> {
        if !self.regions.is_empty() {
            return Err(Status::Exist);
        }
        if cmd.num_regions == 0 || cmd.num_regions > self.max_regions {
            return Err(Status::Inval);
        }

        let regions_dma = cmd.regions_dma.to_native();
        let mut regions = Vec::new();
        for i in 0..usize::from(cmd.num_regions) {
            let iova = regions_dma + (i * size_of::<DirtyRegionInfo>()) as u64;
            let mut info: DirtyRegionInfo = self.read_obj(iova)?;
            let page_count = info
                .page_count
                .to_native()
                .checked_next_multiple_of(self.page_count_align)
                .ok_or(Status::Range)?;
            if page_count == 0 {
                return Err(Status::Inval);
            }
            if page_count != info.page_count.to_native() {
                info.page_count = Le32::from(page_count);
                self.dma_write(iova, info.as_slice())?;
            }

            let bytes = (page_count as usize).div_ceil(64) * 8;
            regions.push(TrackedRegion {
                base: info.dma_base.to_native(),
                page_count,
                page_size_log2: info.page_size_log2,
                seq: vec![0; bytes],
                ack: vec![0; bytes],
            });
        }

        self.regions = regions;
        Ok(Vec::new())
    }

    fn sg_elems(&self, cmd: &DirtySeqAckCmd) -> DeviceResult<Vec<SgElem>> {
        let sgl_addr = cmd.sgl_addr.to_native();
        (0..u64::from(cmd.num_sge.to_native()))
            .map(|i| {
                let elem: SgElem = self.read_obj(sgl_addr + i * size_of::<SgElem>() as u64)?;
                if u64::from(elem.len.to_native()) > self.max_segment_size {
                    return Err(Status::Inval);
                }
                Ok(elem)
            })
            .collect()
    }

    fn dirty_seq_ack(&mut self, cmd: DirtySeqAckCmd, read_seq: bool) -> DeviceResult<Vec<u8>> {
        let offset = cmd.off_bytes.to_native() as usize;
        let len = cmd.len_bytes.to_native() as usize;
        let elems = self.sg_elems(&cmd)?;
        if elems.iter().map(|e| e.len.to_native() as usize).sum::<usize>() != len {
            return Err(Status::Inval);
        }

        let region = self.regions.first().ok_or(Status::Inval)?;
        if offset + len > region.seq.len() {
            return Err(Status::Range);
        }

        if read_seq {
            let mut pos = offset;
            for elem in &elems {
                let n = elem.len.to_native() as usize;
                self.dma_write(elem.addr.to_native(), &region.seq[pos..pos + n])?;
                pos += n;
            }
        } else {
            let mut ack = vec![0u8; len];
            let mut pos = 0;
            for elem in &elems {
                let n = elem.len.to_native() as usize;
                self.dma_read(elem.addr.to_native(), &mut ack[pos..pos + n])?;
                pos += n;
            }
            if let Some(region) = self.regions.first_mut() {
                region.ack[offset..offset + len].copy_from_slice(&ack);
            }
        }

        Ok(Vec::new())
    }

    fn execute(&mut self, opcode: Opcode, request: &[u8]) -> DeviceResult<Vec<u8>> {
        match opcode {
            Opcode::HostVfStatus => self.host_vf_status(decode(request).ok_or(Status::Inval)?),
            Opcode::DirtyStatus => self.dirty_status(decode(request).ok_or(Status::Inval)?),
            Opcode::DirtyEnable => self.dirty_enable(decode(request).ok_or(Status::Inval)?),
            Opcode::DirtyDisable => {
                decode::<DirtyDisableCmd>(request).ok_or(Status::Inval)?;
                self.regions.clear();
                Ok(Vec::new())
            }
            Opcode::DirtyReadSeq => {
                self.dirty_seq_ack(decode(request).ok_or(Status::Inval)?, true)
            }
            Opcode::DirtyWriteAck => {
                self.dirty_seq_ack(decode(request).ok_or(Status::Inval)?, false)
            }
        }
    }
}

/// A PDS VF with dirty tracking support, and the IOMMU in front of it.
pub struct EmulatedDevice {
    vf_id: u16,
    state: Mutex<DeviceState>,
}

impl EmulatedDevice {
    pub fn new(vf_id: u16, max_regions: u8) -> Self {
        EmulatedDevice {
            vf_id,
            state: Mutex::new(DeviceState {
                max_regions,
                page_count_align: 1,
                max_segment_size: u64::from(u32::MAX),
                offline: false,
                lm_status: None,
                regions: Vec::new(),
                next_iova: IOVA_BASE,
                mappings: BTreeMap::new(),
                failures: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Round the page count of every enabled region up to a multiple of
    /// `align` pages, as firmware with coarser bitmaps does.
    pub fn with_page_count_align(self, align: u32) -> Self {
        self.state().page_count_align = align.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        // A panic while holding the lock leaves the model in a consistent
        // state, every command validates before mutating.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn vf_id(&self) -> u16 {
        self.vf_id
    }

    /// Make the next `opcode` submission complete with `status`.
    pub fn fail_next(&self, opcode: Opcode, status: Status) {
        self.state().failures.insert(opcode, status);
    }

    /// Simulate a lost device: every submission fails.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_max_segment_size(&self, size: u64) {
        self.state().max_segment_size = size;
    }

    /// Number of live IOMMU mappings.
    pub fn active_mappings(&self) -> usize {
        self.state().mappings.len()
    }

    /// Opcodes of every submission, in order.
    pub fn history(&self) -> Vec<Opcode> {
        self.state().history.clone()
    }

    pub fn lm_status(&self) -> Option<LmStatus> {
        self.state().lm_status
    }

    /// `(base, page_count, page_size_log2)` of every tracked region.
    pub fn tracked_regions(&self) -> Vec<(u64, u32, u8)> {
        self.state()
            .regions
            .iter()
            .map(|r| (r.base, r.page_count, r.page_size_log2))
            .collect()
    }

    /// Device copies of the sequence and acknowledge bitmaps of the first
    /// tracked region.
    pub fn bitmaps(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.state()
            .regions
            .first()
            .map(|r| (r.seq.clone(), r.ack.clone()))
    }

    /// Simulate the device writing `[iova, iova + len)` of guest memory.
    /// Returns the number of tracked pages marked dirty.
    pub fn dma_write(&self, iova: u64, len: u64) -> u64 {
        let mut state = self.state();
        let mut marked = 0;
        let end = iova.saturating_add(len);

        for region in state.regions.iter_mut() {
            let first = iova.max(region.base);
            let last = end.min(region.end());
            if first >= last {
                continue;
            }

            let page_size = region.page_size();
            for page in (first - region.base) / page_size..(last - region.base).div_ceil(page_size)
            {
                let (byte, bit) = ((page / 8) as usize, page % 8);
                let acked = region.ack[byte] & (1 << bit);
                region.seq[byte] = (region.seq[byte] & !(1 << bit)) | (acked ^ (1 << bit));
                marked += 1;
            }
        }

        debug!("Device wrote 0x{:x}+0x{:x}: {} pages", iova, len, marked);
        marked
    }
}

impl AdminQueue for EmulatedDevice {
    fn submit(&self, opcode: Opcode, request: &[u8]) -> Result<Vec<u8>, AdminqError> {
        let mut state = self.state();
        if state.offline {
            return Err(AdminqError::Offline);
        }
        state.history.push(opcode);

        if let Some(status) = state.failures.remove(&opcode) {
            return Err(AdminqError::Status(status));
        }

        state.execute(opcode, request).map_err(|status| {
            debug!("vf{}: {:?} failed: {:?}", self.vf_id, opcode, status);
            AdminqError::Status(status)
        })
    }
}

impl DmaMapping for EmulatedDevice {
    fn map(&self, host_addr: u64, size: u64, dir: DmaDirection) -> io::Result<u64> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty DMA mapping",
            ));
        }

        let mut state = self.state();
        let iova = state.next_iova;
        state.next_iova = (iova + size).next_multiple_of(IOVA_ALIGN);
        state.mappings.insert(
            iova,
            Mapping {
                host_addr,
                size,
                dir,
            },
        );

        Ok(iova)
    }

    fn unmap(&self, dma_addr: u64, size: u64, dir: DmaDirection) -> io::Result<()> {
        let mut state = self.state();
        match state.mappings.get(&dma_addr) {
            Some(m) if m.size == size && m.dir == dir => {
                state.mappings.remove(&dma_addr);
                Ok(())
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unmap of 0x{:x} does not match its mapping", dma_addr),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("0x{:x} is not mapped", dma_addr),
            )),
        }
    }

    fn max_segment_size(&self) -> u64 {
        self.state().max_segment_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::{Le16, Le64};

    #[test]
    fn test_iommu_bump_allocation() {
        let device = EmulatedDevice::new(0, 1);
        let buf = [0u8; 64];
        let host = buf.as_ptr() as u64;

        let a = device.map(host, 64, DmaDirection::ToDevice).unwrap();
        let b = device.map(host, 0x1001, DmaDirection::ToDevice).unwrap();
        let c = device.map(host, 8, DmaDirection::ToDevice).unwrap();
        assert_eq!(a, IOVA_BASE);
        assert_eq!(b, IOVA_BASE + 0x1000);
        assert_eq!(c, IOVA_BASE + 0x3000);
        assert_eq!(device.active_mappings(), 3);

        assert!(device.unmap(b, 8, DmaDirection::ToDevice).is_err());
        assert!(device.unmap(b, 0x1001, DmaDirection::FromDevice).is_err());
        device.unmap(b, 0x1001, DmaDirection::ToDevice).unwrap();
        assert!(device.unmap(b, 0x1001, DmaDirection::ToDevice).is_err());
        assert!(device.map(host, 0, DmaDirection::ToDevice).is_err());
        assert_eq!(device.active_mappings(), 2);
    }

    #[test]
    fn test_dma_direction_is_enforced() {
        let device = EmulatedDevice::new(0, 1);
        let mut buf = [7u8; 16];
        let host = buf.as_mut_ptr() as u64;
        let iova = device.map(host, 16, DmaDirection::ToDevice).unwrap();

        let state = device.state();
        let mut out = [0u8; 8];
        state.dma_read(iova + 8, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);
        assert_eq!(state.dma_write(iova, &[1]), Err(Status::BadAddr));
        assert_eq!(state.dma_read(iova + 12, &mut out), Err(Status::BadAddr));
        assert_eq!(state.dma_read(0x1000, &mut out), Err(Status::BadAddr));
    }

    #[test]
    fn test_submission_failures() {
        let device = EmulatedDevice::new(1, 1);
        let cmd = HostVfStatusCmd {
            vf_id: Le16::from(1),
            status: LmStatus::InProgress as u8,
            ..Default::default()
        };

        device.fail_next(Opcode::HostVfStatus, Status::Busy);
        assert!(matches!(
            device.submit(Opcode::HostVfStatus, cmd.as_slice()),
            Err(AdminqError::Status(Status::Busy))
        ));
        assert_eq!(device.lm_status(), None);
        device
            .submit(Opcode::HostVfStatus, cmd.as_slice())
            .unwrap();
        assert_eq!(device.lm_status(), Some(LmStatus::InProgress));

        assert!(matches!(
            device.submit(Opcode::DirtyStatus, &[0u8; 4]),
            Err(AdminqError::Status(Status::Inval))
        ));

        device.set_offline(true);
        assert!(matches!(
            device.submit(Opcode::HostVfStatus, cmd.as_slice()),
            Err(AdminqError::Offline)
        ));
        assert_eq!(device.history().len(), 3);
    }

    #[test]
    fn test_dma_write_flips_against_ack() {
        let device = EmulatedDevice::new(0, 1);
        let info = DirtyRegionInfo {
            dma_base: Le64::from(0x10000),
            page_count: Le32::from(70),
            page_size_log2: 12,
            ..Default::default()
        };
        let iova = device
            .map(info.as_slice().as_ptr() as u64, 16, DmaDirection::ToDevice)
            .unwrap();
        let cmd = DirtyEnableCmd {
            num_regions: 1,
            regions_dma: iova.into(),
            ..Default::default()
        };
        device.submit(Opcode::DirtyEnable, cmd.as_slice()).unwrap();
        assert_eq!(device.tracked_regions(), vec![(0x10000, 70, 12)]);

        // Outside of the region.
        assert_eq!(device.dma_write(0, 0x10000), 0);
        // Straddles pages 0 and 1.
        assert_eq!(device.dma_write(0x10fff, 2), 2);
        // Marking twice keeps the page dirty.
        assert_eq!(device.dma_write(0x10000, 1), 1);
        assert_eq!(device.dma_write(0x10000 + 69 * 4096, 1 << 20), 1);

        let (seq, ack) = device.bitmaps().unwrap();
        assert_eq!(seq.len(), 16);
        assert_eq!(seq[0], 0b11);
        assert_eq!(seq[8], 1 << 5);
        assert!(ack.iter().all(|b| *b == 0));
    }
}
