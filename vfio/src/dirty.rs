// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device side dirty page tracking of a PDS virtual function.
//!
//! While tracking is enabled the device records, for every page of one
//! guest region, whether it wrote to it. The host learns about those writes
//! by pulling the device's sequence bitmap, diffing it against its own
//! acknowledge bitmap and pushing the acknowledge bitmap back.

use std::mem::size_of;
use std::ops::Range;
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use thiserror::Error;
use vm_device::{DmaBuffer, DmaDirection, DmaMapping};
use vm_memory::{Le32, Le64};
use vm_migration::{IovaBitmap, Migratable, MigratableError, MemoryRangeTable};

use crate::bitmap::{pagesize, HostBuffer};
use crate::cmds::{AdminQueue, AdminqError, Client, DirtyRegionInfo, LmStatus, Opcode};
use crate::ranges::combine_iova_ranges;
use crate::region::DirtyRegion;

/// Number of regions tracked at once, whatever the device supports. Guest
/// ranges are coalesced into that many regions before tracking starts.
pub const MAX_TRACKED_REGIONS: u8 = 1;

#[derive(Error, Debug)]
pub enum DirtyError {
    #[error("Dirty tracking is already enabled")]
    AlreadyEnabled,

    #[error("Dirty tracking is not enabled")]
    NotTracking,

    #[error("Device does not support dirty tracking")]
    Unsupported,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted")]
    ResourceExhausted(#[source] anyhow::Error),

    #[error("Device command {opcode:?} failed")]
    Device {
        opcode: Opcode,
        #[source]
        source: AdminqError,
    },

    #[error("Internal inconsistency: computed {computed}, expected {expected}")]
    InternalInconsistency { computed: u64, expected: u64 },
}

pub type Result<T> = std::result::Result<T, DirtyError>;

fn device_error(opcode: Opcode) -> impl FnOnce(AdminqError) -> DirtyError {
    move |source| DirtyError::Device { opcode, source }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyTrackerConfig {
    pub vf_id: u16,
}

/// Dirty tracking controller of one VF.
///
/// Every operation takes `&mut self`: callers serialize enable, sync and
/// disable through whatever owns the tracker, typically the device's
/// migration state lock.
pub struct DirtyTracker {
    config: DirtyTrackerConfig,
    client: Client,
    dma: Arc<dyn DmaMapping>,
    host_page_size: u64,
    enabled: bool,
    region: Option<DirtyRegion>,
    dirty_log_ranges: Option<(Vec<Range<u64>>, u64)>,
}

impl DirtyTracker {
    pub fn new(
        config: DirtyTrackerConfig,
        adminq: Arc<dyn AdminQueue>,
        dma: Arc<dyn DmaMapping>,
    ) -> Self {
        DirtyTracker {
            config,
            client: Client::new(adminq, config.vf_id),
            dma,
            host_page_size: pagesize() as u64,
            enabled: false,
            region: None,
            dirty_log_ranges: None,
        }
    }

    /// Override the host page size used to split bitmaps into scatter
    /// fragments. It must be a power of two no larger than the real host
    /// page size, which bitmap buffers are aligned to.
    pub fn with_host_page_size(mut self, host_page_size: u64) -> Result<Self> {
        if !host_page_size.is_power_of_two() || host_page_size > pagesize() as u64 {
            return Err(DirtyError::InvalidArgument(format!(
                "host page size {} is not a power of two up to {}",
                host_page_size,
                pagesize()
            )));
        }

        self.host_page_size = host_page_size;
        Ok(self)
    }

    pub fn config(&self) -> &DirtyTrackerConfig {
        &self.config
    }

    pub fn host_page_size(&self) -> u64 {
        self.host_page_size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn region(&self) -> Option<&DirtyRegion> {
        self.region.as_ref()
    }

    /// Ranges and page size used by [`Migratable::start_dirty_log`].
    pub fn set_dirty_log_ranges(&mut self, ranges: Vec<Range<u64>>, page_size: u64) {
        self.dirty_log_ranges = Some((ranges, page_size));
    }

    /// Start tracking device writes to `ranges` at `page_size` granularity.
    ///
    /// The ranges are coalesced into a single region first. Nothing is left
    /// allocated on failure.
    pub fn start_dirty_tracking(&mut self, ranges: &[Range<u64>], page_size: u64) -> Result<()> {
        let vf_id = self.config.vf_id;
        debug!("vf{}: Start dirty page tracking", vf_id);

        if self.enabled {
            return Err(DirtyError::AlreadyEnabled);
        }
        if !page_size.is_power_of_two() {
            return Err(DirtyError::InvalidArgument(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }
        if let Some(r) = ranges.iter().find(|r| r.start >= r.end) {
            return Err(DirtyError::InvalidArgument(format!(
                "empty range 0x{:x}-0x{:x}",
                r.start, r.end
            )));
        }

        if let Err(e) = self.client.host_vf_status(LmStatus::InProgress) {
            warn!("vf{}: Failed to report migration in progress: {}", vf_id, e);
        }

        // Tracking must be off on the device side, i.e. no active region.
        let status = self
            .client
            .dirty_status(0, 0)
            .map_err(device_error(Opcode::DirtyStatus))?;
        if status.num_regions != 0 {
            error!(
                "vf{}: Dirty tracking already enabled for {} regions",
                vf_id, status.num_regions
            );
            return Err(DirtyError::AlreadyEnabled);
        }
        if status.max_regions == 0 {
            error!("vf{}: Device doesn't support dirty tracking", vf_id);
            return Err(DirtyError::Unsupported);
        }
        let device_max_regions = status.max_regions;
        let max_regions = device_max_regions.min(MAX_TRACKED_REGIONS);

        let mut ranges = ranges.to_vec();
        if ranges.len() > usize::from(max_regions) {
            combine_iova_ranges(&mut ranges, usize::from(max_regions));
        }
        let range = ranges
            .first()
            .cloned()
            .ok_or_else(|| DirtyError::InvalidArgument("no range to track".to_string()))?;

        let start = range.start;
        let size = range.end - range.start;
        let page_count = u32::try_from(size.div_ceil(page_size)).map_err(|_| {
            DirtyError::InvalidArgument(format!(
                "region 0x{:x}-0x{:x} has too many pages",
                range.start, range.end
            ))
        })?;
        let page_size_log2 = page_size.trailing_zeros() as u8;

        let page_count = self.enable_region(start, page_count, page_size_log2)?;
        if page_count == 0 {
            return Err(DirtyError::InvalidArgument(
                "device reported an empty region".to_string(),
            ));
        }

        let region = DirtyRegion::new(
            &self.dma,
            start,
            size,
            page_size,
            u64::from(page_count),
            self.host_page_size,
        )
        .inspect_err(|e| error!("vf{}: Failed to allocate dirty region: {}", vf_id, e))?;

        info!(
            "vf{}: Tracking 0x{:x}-0x{:x}, {} pages of {} bytes, {} bitmap bytes",
            vf_id,
            region.start(),
            region.end(),
            region.page_count(),
            region.page_size(),
            region.bmp_bytes()
        );
        self.region = Some(region);
        self.enabled = true;

        self.log_region_info(device_max_regions);

        Ok(())
    }

    /// Describe the region to the device and turn tracking on. Returns the
    /// page count the device settled on.
    fn enable_region(&self, start: u64, page_count: u32, page_size_log2: u8) -> Result<u32> {
        let info = DirtyRegionInfo {
            dma_base: Le64::from(start),
            page_count: Le32::from(page_count),
            page_size_log2,
            ..Default::default()
        };

        let buffer = HostBuffer::new(size_of::<DirtyRegionInfo>())?;
        buffer.write_obj(0, &info)?;
        let mapping = DmaBuffer::map(
            &self.dma,
            buffer.host_addr(),
            buffer.len() as u64,
            DmaDirection::Bidirectional,
        )
        .map_err(|e| {
            DirtyError::ResourceExhausted(anyhow!(e).context("Failed to map region info"))
        })?;

        self.client
            .dirty_enable(mapping.dma_addr(), MAX_TRACKED_REGIONS)
            .map_err(device_error(Opcode::DirtyEnable))?;
        drop(mapping);

        // The device may have adjusted the page count.
        let info: DirtyRegionInfo = buffer.read_obj(0)?;
        let page_count = info.page_count.to_native();
        debug!(
            "vf{}: region_info: dma_base 0x{:x} page_count {} page_size_log2 {}",
            self.config.vf_id, start, page_count, page_size_log2
        );

        Ok(page_count)
    }

    /// Dump the regions the device is tracking. Failures only cost the log.
    fn log_region_info(&self, max_regions: u8) {
        let len = usize::from(max_regions) * size_of::<DirtyRegionInfo>();
        let Ok(buffer) = HostBuffer::new(len) else {
            return;
        };
        let Ok(mapping) = DmaBuffer::map(
            &self.dma,
            buffer.host_addr(),
            len as u64,
            DmaDirection::FromDevice,
        ) else {
            return;
        };

        let status = self.client.dirty_status(mapping.dma_addr(), max_regions);
        drop(mapping);
        let Ok(status) = status else {
            return;
        };

        for i in 0..usize::from(status.num_regions.min(max_regions)) {
            if let Ok(info) = buffer.read_obj::<DirtyRegionInfo>(i * size_of::<DirtyRegionInfo>())
            {
                debug!(
                    "vf{}: region_info[{}]: dma_base 0x{:x} page_count {} page_size_log2 {}",
                    self.config.vf_id,
                    i,
                    info.dma_base.to_native(),
                    info.page_count.to_native(),
                    info.page_size_log2
                );
            }
        }
    }

    /// Stop tracking and release the region. With `notify_device` the
    /// device is told to stop as well and its migration status is reset,
    /// even when tracking was not enabled. Never fails.
    pub fn stop_dirty_tracking(&mut self, notify_device: bool) {
        let vf_id = self.config.vf_id;

        if self.enabled {
            self.enabled = false;
            if notify_device {
                if let Err(e) = self.client.dirty_disable() {
                    warn!("vf{}: Failed to disable dirty tracking: {}", vf_id, e);
                }
            }
            self.region = None;
            info!("vf{}: Stopped dirty page tracking", vf_id);
        }

        if notify_device {
            if let Err(e) = self.client.host_vf_status(LmStatus::None) {
                warn!("vf{}: Failed to reset migration status: {}", vf_id, e);
            }
        }
    }

    /// Report to `dirty` every page of `[iova, iova + length)` the device
    /// wrote since the previous report covering it.
    ///
    /// The read, merge and acknowledge steps always all run; the first
    /// failure among them is returned.
    pub fn report_dirty_pages(
        &mut self,
        dirty: &mut dyn IovaBitmap,
        iova: u64,
        length: u64,
    ) -> Result<()> {
        let vf_id = self.config.vf_id;
        debug!("vf{}: Get dirty page bitmap", vf_id);

        if !self.enabled {
            error!("vf{}: Sync failed, dirty tracking is disabled", vf_id);
            return Err(DirtyError::NotTracking);
        }
        let host_page_size = self.host_page_size;
        let region = self.region.as_mut().ok_or(DirtyError::NotTracking)?;

        let in_region = iova >= region.start()
            && iova
                .checked_add(length)
                .is_some_and(|end| end <= region.end());
        if length == 0 || !in_region {
            error!(
                "vf{}: Invalid iova 0x{:x} and/or length 0x{:x} to sync",
                vf_id, iova, length
            );
            return Err(DirtyError::InvalidArgument(format!(
                "window 0x{:x}+0x{:x} outside of region 0x{:x}-0x{:x}",
                iova,
                length,
                region.start(),
                region.end()
            )));
        }

        let page_size = region.page_size();
        let pages = length.div_ceil(page_size);
        let bitmap_size = pages.next_multiple_of(u64::from(u64::BITS)) / 8;
        debug!(
            "vf{}: iova 0x{:x} length {} page_size {} pages {} bitmap_size {}",
            vf_id, iova, length, page_size, pages, bitmap_size
        );

        // The bitmaps are diffed in 64-bit words.
        let bmp_bytes = pages.div_ceil(8).next_multiple_of(8);
        if bmp_bytes != bitmap_size {
            return Err(DirtyError::InternalInconsistency {
                computed: bmp_bytes,
                expected: bitmap_size,
            });
        }

        let bmp_offset = ((iova - region.start()) / page_size).div_ceil(8);
        if bmp_offset + bmp_bytes > region.bmp_bytes() {
            error!(
                "vf{}: Bitmap window {}+{} larger than region's bmp_bytes {}",
                vf_id,
                bmp_offset,
                bmp_bytes,
                region.bmp_bytes()
            );
            return Err(DirtyError::InvalidArgument(format!(
                "bitmap window {}+{} exceeds {} bitmap bytes",
                bmp_offset,
                bmp_bytes,
                region.bmp_bytes()
            )));
        }

        debug!(
            "vf{}: Syncing dirty bitmap, iova 0x{:x} length 0x{:x}, bmp_offset {} bmp_bytes {}",
            vf_id, iova, length, bmp_offset, bmp_bytes
        );

        let read = seq_ack(
            &self.client,
            &self.dma,
            host_page_size,
            region,
            bmp_offset,
            bmp_bytes,
            true,
        );

        let merged = region.bitmaps().merge_window(
            bmp_offset as usize,
            bmp_bytes as usize,
            region.start(),
            page_size,
            dirty,
        );
        if let Ok(count) = &merged {
            debug!("vf{}: {} dirty pages in window", vf_id, count);
        }

        let acked = seq_ack(
            &self.client,
            &self.dma,
            host_page_size,
            region,
            bmp_offset,
            bmp_bytes,
            false,
        );

        read.and(merged.map(|_| ())).and(acked)
    }
}

/// Move `len` bytes at `offset` of one of the region's bitmaps between the
/// host and the device: the sequence bitmap from the device when `read_seq`
/// is set, the acknowledge bitmap to the device otherwise.
fn seq_ack(
    client: &Client,
    dma: &Arc<dyn DmaMapping>,
    host_page_size: u64,
    region: &mut DirtyRegion,
    offset: u64,
    len: u64,
    read_seq: bool,
) -> Result<()> {
    let (bitmaps, sgl) = region.parts_mut();
    let (buffer, dir, opcode, kind) = if read_seq {
        (
            bitmaps.seq(),
            DmaDirection::FromDevice,
            Opcode::DirtyReadSeq,
            "read_seq",
        )
    } else {
        (
            bitmaps.ack(),
            DmaDirection::ToDevice,
            Opcode::DirtyWriteAck,
            "write_ack",
        )
    };

    let transfer = sgl
        .load(dma, buffer, offset, len, host_page_size, dir)
        .inspect_err(|e| {
            error!(
                "vf{}: Failed to build {} scatter list: {}",
                client.vf_id(),
                kind,
                e
            )
        })?;

    client
        .dirty_seq_ack(
            sgl.dma_addr(),
            transfer.num_sge(),
            offset as u32,
            len as u32,
            read_seq,
        )
        .map_err(device_error(opcode))
        .inspect_err(|e| {
            error!(
                "vf{}: Dirty bitmap {} failed offset {} len {}: {}",
                client.vf_id(),
                kind,
                offset,
                len,
                e
            )
        })
}

impl Drop for DirtyTracker {
    fn drop(&mut self) {
        self.stop_dirty_tracking(false);
    }
}

impl Migratable for DirtyTracker {
    fn start_dirty_log(&mut self) -> std::result::Result<(), MigratableError> {
        let (ranges, page_size) = self.dirty_log_ranges.clone().ok_or_else(|| {
            MigratableError::StartDirtyLog(anyhow!("No guest ranges to track"))
        })?;

        self.start_dirty_tracking(&ranges, page_size)
            .map_err(|e| MigratableError::StartDirtyLog(e.into()))
    }

    fn stop_dirty_log(&mut self) -> std::result::Result<(), MigratableError> {
        self.stop_dirty_tracking(true);
        Ok(())
    }

    fn dirty_log(&mut self) -> std::result::Result<MemoryRangeTable, MigratableError> {
        let (start, size) = match self.region() {
            Some(region) => (region.start(), region.size()),
            None => return Err(MigratableError::DirtyLog(DirtyError::NotTracking.into())),
        };

        let mut table = MemoryRangeTable::default();
        self.report_dirty_pages(&mut table, start, size)
            .map_err(|e| MigratableError::DirtyLog(e.into()))?;

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::cmds::{decode, DirtyStatusComp, DirtyStatusCmd, Status};
    use vm_memory::ByteValued;

    /// Device that supports tracking but never writes anything back.
    #[derive(Default)]
    struct QuietDevice {
        commands: Mutex<Vec<Opcode>>,
        max_regions: u8,
        num_regions: u8,
        fail: Option<Opcode>,
        maps: Mutex<i64>,
    }

    impl AdminQueue for QuietDevice {
        fn submit(&self, opcode: Opcode, request: &[u8]) -> std::result::Result<Vec<u8>, AdminqError> {
            self.commands.lock().unwrap().push(opcode);
            if self.fail == Some(opcode) {
                return Err(AdminqError::Status(Status::Io));
            }
            if opcode == Opcode::DirtyStatus {
                let _cmd: DirtyStatusCmd = decode(request).unwrap();
                let comp = DirtyStatusComp {
                    max_regions: self.max_regions,
                    num_regions: self.num_regions,
                    ..Default::default()
                };
                return Ok(comp.as_slice().to_vec());
            }
            Ok(Vec::new())
        }
    }

    impl DmaMapping for QuietDevice {
        fn map(&self, host_addr: u64, _size: u64, _dir: DmaDirection) -> io::Result<u64> {
            *self.maps.lock().unwrap() += 1;
            Ok(host_addr)
        }

        fn unmap(&self, _dma_addr: u64, _size: u64, _dir: DmaDirection) -> io::Result<()> {
            *self.maps.lock().unwrap() -= 1;
            Ok(())
        }
    }

    fn tracker(device: QuietDevice) -> (Arc<QuietDevice>, DirtyTracker) {
        let device = Arc::new(device);
        let tracker = DirtyTracker::new(
            DirtyTrackerConfig { vf_id: 3 },
            device.clone(),
            device.clone(),
        )
        .with_host_page_size(4096)
        .unwrap();
        (device, tracker)
    }

    #[test]
    fn test_start_checks_device_state() {
        let (_, mut t) = tracker(QuietDevice {
            max_regions: 0,
            ..Default::default()
        });
        assert!(matches!(
            t.start_dirty_tracking(&[0..4096], 4096),
            Err(DirtyError::Unsupported)
        ));

        let (_, mut t) = tracker(QuietDevice {
            max_regions: 4,
            num_regions: 1,
            ..Default::default()
        });
        assert!(matches!(
            t.start_dirty_tracking(&[0..4096], 4096),
            Err(DirtyError::AlreadyEnabled)
        ));

        let (_, mut t) = tracker(QuietDevice {
            max_regions: 4,
            fail: Some(Opcode::DirtyStatus),
            ..Default::default()
        });
        assert!(matches!(
            t.start_dirty_tracking(&[0..4096], 4096),
            Err(DirtyError::Device {
                opcode: Opcode::DirtyStatus,
                source: AdminqError::Status(Status::Io)
            })
        ));
        assert!(!t.is_enabled());
    }

    #[test]
    fn test_start_validates_arguments() {
        let (device, mut t) = tracker(QuietDevice {
            max_regions: 1,
            ..Default::default()
        });
        assert!(matches!(
            t.start_dirty_tracking(&[0..4096], 3000),
            Err(DirtyError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.start_dirty_tracking(&[4096..4096], 4096),
            Err(DirtyError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.start_dirty_tracking(&[], 4096),
            Err(DirtyError::InvalidArgument(_))
        ));
        assert!(device.commands.lock().unwrap().contains(&Opcode::DirtyStatus));
        assert_eq!(*device.maps.lock().unwrap(), 0);
    }

    #[test]
    fn test_start_sequence_and_stop() {
        let (device, mut t) = tracker(QuietDevice {
            max_regions: 4,
            ..Default::default()
        });
        t.start_dirty_tracking(&[0x10000..0x10000 + 10 * 4096 + 1], 4096)
            .unwrap();
        assert!(t.is_enabled());

        let region = t.region().unwrap();
        assert_eq!(region.start(), 0x10000);
        assert_eq!(region.page_count(), 11);
        assert_eq!(region.bmp_bytes(), 8);
        assert_eq!(
            device.commands.lock().unwrap()[..4],
            [
                Opcode::HostVfStatus,
                Opcode::DirtyStatus,
                Opcode::DirtyEnable,
                Opcode::DirtyStatus
            ]
        );
        // Only the scatter list stays mapped.
        assert_eq!(*device.maps.lock().unwrap(), 1);

        t.stop_dirty_tracking(true);
        assert!(!t.is_enabled());
        assert!(t.region().is_none());
        assert_eq!(*device.maps.lock().unwrap(), 0);
        assert_eq!(
            device.commands.lock().unwrap()[4..],
            [Opcode::DirtyDisable, Opcode::HostVfStatus]
        );
    }

    #[test]
    fn test_report_requires_tracking() {
        let (_, mut t) = tracker(QuietDevice {
            max_regions: 1,
            ..Default::default()
        });
        let mut table = MemoryRangeTable::default();
        assert!(matches!(
            t.report_dirty_pages(&mut table, 0, 4096),
            Err(DirtyError::NotTracking)
        ));
        assert!(t.dirty_log().is_err());
        assert!(t.start_dirty_log().is_err());
    }

    #[test]
    fn test_report_returns_first_error_after_full_sequence() {
        let (device, mut t) = tracker(QuietDevice {
            max_regions: 1,
            fail: Some(Opcode::DirtyReadSeq),
            ..Default::default()
        });
        t.start_dirty_tracking(&[0..64 * 4096], 4096).unwrap();
        device.commands.lock().unwrap().clear();

        let mut table = MemoryRangeTable::default();
        assert!(matches!(
            t.report_dirty_pages(&mut table, 0, 64 * 4096),
            Err(DirtyError::Device {
                opcode: Opcode::DirtyReadSeq,
                ..
            })
        ));
        assert_eq!(
            *device.commands.lock().unwrap(),
            [Opcode::DirtyReadSeq, Opcode::DirtyWriteAck]
        );
        assert!(table.is_empty());
        assert_eq!(*device.maps.lock().unwrap(), 1);
    }

    #[test]
    fn test_host_page_size_override() {
        let device = Arc::new(QuietDevice {
            max_regions: 1,
            ..Default::default()
        });
        let fresh = || {
            DirtyTracker::new(DirtyTrackerConfig::default(), device.clone(), device.clone())
        };

        for bad in [0, 3000, 2 * pagesize() as u64] {
            assert!(matches!(
                fresh().with_host_page_size(bad),
                Err(DirtyError::InvalidArgument(_))
            ));
        }

        let host = pagesize() as u64;
        assert_eq!(fresh().with_host_page_size(host).unwrap().host_page_size(), host);
        let mut t = fresh().with_host_page_size(512).unwrap();
        t.start_dirty_tracking(&[0..64 * 4096], 4096).unwrap();
        assert_eq!(t.region().unwrap().sgl().max_sge(), 2);
        let mut table = MemoryRangeTable::default();
        t.report_dirty_pages(&mut table, 0, 64 * 4096).unwrap();
    }

    #[test]
    fn test_drop_releases_mappings_silently() {
        let (device, mut t) = tracker(QuietDevice {
            max_regions: 1,
            ..Default::default()
        });
        t.start_dirty_tracking(&[0..4096], 4096).unwrap();
        let sent = device.commands.lock().unwrap().len();
        drop(t);
        assert_eq!(*device.maps.lock().unwrap(), 0);
        assert_eq!(device.commands.lock().unwrap().len(), sent);
    }
}
