// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live migration admin commands understood by a PDS virtual function.
//!
//! Commands are posted to the device firmware through an [`AdminQueue`],
//! an opaque request/response transport. Only the dirty page tracking
//! subset of the command set is described here.

use std::mem::size_of;
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use vm_memory::{ByteValued, Le16, Le32, Le64};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    HostVfStatus = 0x37,
    DirtyStatus = 0x38,
    DirtyEnable = 0x39,
    DirtyDisable = 0x3a,
    DirtyReadSeq = 0x3b,
    DirtyWriteAck = 0x3c,
}

/// Completion status reported by the device firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Io,
    Perm,
    NoEnt,
    Again,
    NoMem,
    Fault,
    Busy,
    Exist,
    Inval,
    NoSpc,
    Range,
    BadAddr,
    NotSupported,
    Error,
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0 => Status::Success,
            3 => Status::Io,
            4 => Status::Perm,
            7 => Status::NoEnt,
            9 => Status::Again,
            10 => Status::NoMem,
            11 => Status::Fault,
            12 => Status::Busy,
            13 => Status::Exist,
            14 => Status::Inval,
            15 => Status::NoSpc,
            16 => Status::Range,
            17 => Status::BadAddr,
            19 => Status::NotSupported,
            29 => Status::Error,
            c => Status::Unknown(c),
        }
    }
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Io => 3,
            Status::Perm => 4,
            Status::NoEnt => 7,
            Status::Again => 9,
            Status::NoMem => 10,
            Status::Fault => 11,
            Status::Busy => 12,
            Status::Exist => 13,
            Status::Inval => 14,
            Status::NoSpc => 15,
            Status::Range => 16,
            Status::BadAddr => 17,
            Status::NotSupported => 19,
            Status::Error => 29,
            Status::Unknown(c) => c,
        }
    }
}

#[derive(Error, Debug)]
pub enum AdminqError {
    #[error("Device completed command with status {0:?}")]
    Status(Status),
    #[error("Response to {opcode:?} too short: {len} bytes, expected {expected}")]
    ShortResponse {
        opcode: Opcode,
        len: usize,
        expected: usize,
    },
    #[error("Device is offline")]
    Offline,
}

/// Synchronous request/response channel to the device firmware.
///
/// `submit` blocks until the device completes the command. A non-success
/// completion is returned as `AdminqError::Status`.
pub trait AdminQueue: Send + Sync {
    fn submit(&self, opcode: Opcode, request: &[u8]) -> Result<Vec<u8>, AdminqError>;
}

/// Live migration status of the VF as seen by the device.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LmStatus {
    #[default]
    None = 0,
    InProgress = 1,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HostVfStatusCmd {
    pub vf_id: Le16,
    pub status: u8,
    pub rsvd: [u8; 5],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtyStatusCmd {
    pub vf_id: Le16,
    pub max_regions: u8,
    pub rsvd: [u8; 5],
    pub regions_dma: Le64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtyStatusComp {
    pub max_regions: u8,
    pub num_regions: u8,
    pub rsvd: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtyEnableCmd {
    pub vf_id: Le16,
    pub num_regions: u8,
    pub rsvd: [u8; 5],
    pub regions_dma: Le64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtyDisableCmd {
    pub vf_id: Le16,
    pub rsvd: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtySeqAckCmd {
    pub vf_id: Le16,
    pub num_sge: Le16,
    pub rsvd: [u8; 4],
    pub off_bytes: Le32,
    pub len_bytes: Le32,
    pub sgl_addr: Le64,
}

/// Description of one tracked region, exchanged through DMA.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirtyRegionInfo {
    pub dma_base: Le64,
    pub page_count: Le32,
    pub page_size_log2: u8,
    pub rsvd: [u8; 3],
}

/// Scatter list element pointing the device at one host buffer fragment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SgElem {
    pub addr: Le64,
    pub len: Le32,
    pub rsvd: [u8; 4],
}

// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for HostVfStatusCmd {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtyStatusCmd {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtyStatusComp {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtyEnableCmd {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtyDisableCmd {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtySeqAckCmd {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for DirtyRegionInfo {}
// SAFETY: data structure only contain a series of integers
unsafe impl ByteValued for SgElem {}

/// Copy the leading bytes of `bytes` into a `T`, regardless of the
/// alignment of the source buffer.
pub fn decode<T: ByteValued + Default>(bytes: &[u8]) -> Option<T> {
    let len = size_of::<T>();
    if bytes.len() < len {
        return None;
    }

    let mut value = T::default();
    value.as_mut_slice().copy_from_slice(&bytes[..len]);
    Some(value)
}

/// Issues the live migration commands of one VF.
pub struct Client {
    adminq: Arc<dyn AdminQueue>,
    vf_id: u16,
}

impl Client {
    pub fn new(adminq: Arc<dyn AdminQueue>, vf_id: u16) -> Self {
        Client { adminq, vf_id }
    }

    pub fn vf_id(&self) -> u16 {
        self.vf_id
    }

    fn submit(&self, opcode: Opcode, request: &[u8]) -> Result<Vec<u8>, AdminqError> {
        debug!("vf{}: Command: {:?} ({} bytes)", self.vf_id, opcode, request.len());
        let reply = self.adminq.submit(opcode, request);
        match &reply {
            Ok(r) => debug!("vf{}: Reply: {:?} ({} bytes)", self.vf_id, opcode, r.len()),
            Err(e) => debug!("vf{}: Reply: {:?} failed: {}", self.vf_id, opcode, e),
        }
        reply
    }

    /// Report the live migration status of the VF to the device.
    pub fn host_vf_status(&self, status: LmStatus) -> Result<(), AdminqError> {
        let cmd = HostVfStatusCmd {
            vf_id: Le16::from(self.vf_id),
            status: status as u8,
            ..Default::default()
        };

        self.submit(Opcode::HostVfStatus, cmd.as_slice())
            .map(|_| ())
    }

    /// Query the dirty tracking state. When `regions_dma` is not zero the
    /// device also writes up to `max_regions` [`DirtyRegionInfo`] entries
    /// there.
    pub fn dirty_status(
        &self,
        regions_dma: u64,
        max_regions: u8,
    ) -> Result<DirtyStatusComp, AdminqError> {
        let cmd = DirtyStatusCmd {
            vf_id: Le16::from(self.vf_id),
            max_regions,
            regions_dma: Le64::from(regions_dma),
            ..Default::default()
        };

        let reply = self.submit(Opcode::DirtyStatus, cmd.as_slice())?;
        decode::<DirtyStatusComp>(&reply).ok_or(AdminqError::ShortResponse {
            opcode: Opcode::DirtyStatus,
            len: reply.len(),
            expected: size_of::<DirtyStatusComp>(),
        })
    }

    /// Start tracking the `num_regions` regions described at `regions_dma`.
    /// The device may adjust the page counts in place.
    pub fn dirty_enable(&self, regions_dma: u64, num_regions: u8) -> Result<(), AdminqError> {
        let cmd = DirtyEnableCmd {
            vf_id: Le16::from(self.vf_id),
            num_regions,
            regions_dma: Le64::from(regions_dma),
            ..Default::default()
        };

        self.submit(Opcode::DirtyEnable, cmd.as_slice()).map(|_| ())
    }

    pub fn dirty_disable(&self) -> Result<(), AdminqError> {
        let cmd = DirtyDisableCmd {
            vf_id: Le16::from(self.vf_id),
            ..Default::default()
        };

        self.submit(Opcode::DirtyDisable, cmd.as_slice()).map(|_| ())
    }

    /// Transfer `len_bytes` of the region bitmap starting at byte
    /// `off_bytes`. With `read_seq` the device writes its sequence bitmap
    /// into the scatter list, otherwise it reads the host acknowledge
    /// bitmap from it.
    pub fn dirty_seq_ack(
        &self,
        sgl_addr: u64,
        num_sge: u16,
        off_bytes: u32,
        len_bytes: u32,
        read_seq: bool,
    ) -> Result<(), AdminqError> {
        let cmd = DirtySeqAckCmd {
            vf_id: Le16::from(self.vf_id),
            num_sge: Le16::from(num_sge),
            off_bytes: Le32::from(off_bytes),
            len_bytes: Le32::from(len_bytes),
            sgl_addr: Le64::from(sgl_addr),
            ..Default::default()
        };

        let opcode = if read_seq {
            Opcode::DirtyReadSeq
        } else {
            Opcode::DirtyWriteAck
        };
        self.submit(opcode, cmd.as_slice()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_wire_layout() {
        assert_eq!(size_of::<HostVfStatusCmd>(), 8);
        assert_eq!(size_of::<DirtyStatusCmd>(), 16);
        assert_eq!(size_of::<DirtyStatusComp>(), 8);
        assert_eq!(size_of::<DirtyEnableCmd>(), 16);
        assert_eq!(size_of::<DirtyDisableCmd>(), 8);
        assert_eq!(size_of::<DirtySeqAckCmd>(), 24);
        assert_eq!(size_of::<DirtyRegionInfo>(), 16);
        assert_eq!(size_of::<SgElem>(), 16);

        let info = DirtyRegionInfo {
            dma_base: Le64::from(0x1122_3344_5566_7788),
            page_count: Le32::from(0x0102_0304),
            page_size_log2: 12,
            ..Default::default()
        };
        assert_eq!(
            info.as_slice(),
            &[
                0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x04, 0x03, 0x02, 0x01, 12, 0, 0,
                0
            ]
        );
    }

    #[test]
    fn test_status_codes() {
        for code in 0..=u8::MAX {
            assert_eq!(Status::from(code).code(), code);
        }
        assert_eq!(Status::from(13), Status::Exist);
        assert_eq!(Status::from(200), Status::Unknown(200));
    }

    #[test]
    fn test_decode_unaligned() {
        let mut buf = vec![0u8; 1 + size_of::<DirtyStatusComp>()];
        buf[1] = 4;
        buf[2] = 1;

        let comp = decode::<DirtyStatusComp>(&buf[1..]).unwrap();
        assert_eq!(comp.max_regions, 4);
        assert_eq!(comp.num_regions, 1);
        assert!(decode::<DirtyStatusComp>(&buf[..3]).is_none());
    }

    struct Recorder {
        sent: Mutex<Vec<(Opcode, Vec<u8>)>>,
        reply: Vec<u8>,
    }

    impl AdminQueue for Recorder {
        fn submit(&self, opcode: Opcode, request: &[u8]) -> Result<Vec<u8>, AdminqError> {
            self.sent.lock().unwrap().push((opcode, request.to_vec()));
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_client_encodes_requests() {
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
            reply: vec![],
        });
        let client = Client::new(recorder.clone(), 3);

        client.dirty_seq_ack(0xabc000, 2, 16, 8, false).unwrap();
        client.host_vf_status(LmStatus::InProgress).unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].0, Opcode::DirtyWriteAck);
        let cmd = decode::<DirtySeqAckCmd>(&sent[0].1).unwrap();
        assert_eq!(cmd.vf_id.to_native(), 3);
        assert_eq!(cmd.num_sge.to_native(), 2);
        assert_eq!(cmd.off_bytes.to_native(), 16);
        assert_eq!(cmd.len_bytes.to_native(), 8);
        assert_eq!(cmd.sgl_addr.to_native(), 0xabc000);

        assert_eq!(sent[1].0, Opcode::HostVfStatus);
        assert_eq!(sent[1].1[2], LmStatus::InProgress as u8);

        // An empty reply cannot carry a status completion.
        drop(sent);
        assert!(matches!(
            client.dirty_status(0, 1),
            Err(AdminqError::ShortResponse {
                opcode: Opcode::DirtyStatus,
                len: 0,
                expected: 8
            })
        ));
    }
}
