// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Channel region layout: header structures and geometry computation.
//!
//! Everything in the region is located by byte offset from the mapping base.
//! The header records the offsets so that the two endpoints (which map the
//! region at different addresses) agree on where each ring and the buffer
//! pool live.

use core::mem::size_of;

use crate::ctrlq::CtrlQueueEntry;
use crate::ring::ring_bytes;

/// Sentinel in the first four bytes of every valid channel region.
pub const CHANNEL_MAGIC: u32 = 0x4E53_4153;

/// Layout version stamped at creation.
pub const CHANNEL_VERSION: u32 = 1;

/// Entries in each of the control submission and completion queues.
pub const CTRL_QUEUE_SLOTS: u32 = 64;

/// Default number of slots in each data descriptor ring.
pub const DEFAULT_DESC_RING_SLOTS: u32 = 1024;

/// Default number of message buffers in the pool.
pub const DEFAULT_BUF_COUNT: u32 = 4096;

/// Default maximum payload bytes per message buffer.
pub const DEFAULT_BUF_MSS: u32 = 4096;

const CACHELINE: usize = 64;

/// Control-plane context embedded in the channel header.
#[repr(C)]
#[derive(Debug)]
pub struct CtrlCtx {
    /// Per-channel monotonic request id. Written only by the application.
    pub req_id: u32,
    _pad: u32,
    /// Byte offset of the control submission queue.
    pub sq_ofs: u64,
    /// Byte offset of the control completion queue.
    pub cq_ofs: u64,
}

/// Datapath context embedded in the channel header.
#[repr(C)]
#[derive(Debug)]
pub struct DataCtx {
    /// Byte offset of the free-buffer ring.
    pub buf_ring_ofs: u64,
    /// Byte offset of the application-to-stack descriptor ring.
    pub app_ring_ofs: u64,
    /// Byte offset of the stack-to-application descriptor ring.
    pub stack_ring_ofs: u64,
    /// Byte offset of the first message buffer.
    pub buf_region_ofs: u64,
    /// Slots in each data descriptor ring.
    pub desc_ring_slots: u32,
    /// Message buffers in the pool.
    pub buf_count: u32,
    /// Bytes from one buffer to the next (header included).
    pub buf_stride: u32,
    /// Maximum payload bytes per buffer. Constant for the channel lifetime.
    pub buf_mss: u32,
}

/// Header at offset zero of the mapped region.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ChannelHeader {
    /// Must equal [`CHANNEL_MAGIC`]; never written by the application after
    /// mapping.
    pub magic: u32,
    /// Layout version, [`CHANNEL_VERSION`].
    pub version: u32,
    /// Total size of the mapping in bytes.
    pub size: u64,
    /// Control-plane context.
    pub ctrl_ctx: CtrlCtx,
    /// Datapath context.
    pub data_ctx: DataCtx,
}

const _: () = assert!(size_of::<ChannelHeader>() == 128);

/// Parameters a channel is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Slots in each data descriptor ring. Must be a power of two.
    pub desc_ring_slots: u32,
    /// Message buffers in the pool. Must be a power of two.
    pub buf_count: u32,
    /// Maximum payload bytes per buffer.
    pub buf_mss: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            desc_ring_slots: DEFAULT_DESC_RING_SLOTS,
            buf_count: DEFAULT_BUF_COUNT,
            buf_mss: DEFAULT_BUF_MSS,
        }
    }
}

/// Errors computing a channel geometry from a [`ChannelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    /// Descriptor ring slot count is zero or not a power of two.
    #[error("descriptor ring slots must be a nonzero power of two, got {0}")]
    BadRingSlots(u32),
    /// Buffer count is zero or not a power of two.
    #[error("buffer count must be a nonzero power of two, got {0}")]
    BadBufCount(u32),
    /// Buffer payload size is zero.
    #[error("buffer mss must be nonzero")]
    ZeroMss,
}

/// Byte offsets of every part of a channel region, plus its total size.
#[derive(Debug, Clone, Copy)]
pub struct ChannelGeometry {
    /// The configuration the geometry was computed from.
    pub config: ChannelConfig,
    /// Offset of the control submission queue.
    pub sq_ofs: usize,
    /// Offset of the control completion queue.
    pub cq_ofs: usize,
    /// Offset of the free-buffer ring.
    pub buf_ring_ofs: usize,
    /// Offset of the application-to-stack ring.
    pub app_ring_ofs: usize,
    /// Offset of the stack-to-application ring.
    pub stack_ring_ofs: usize,
    /// Offset of the first message buffer.
    pub buf_region_ofs: usize,
    /// Bytes from one buffer to the next.
    pub buf_stride: usize,
    /// Total region size.
    pub total: usize,
}

const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

impl ChannelGeometry {
    /// Compute the offsets and total size for `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`GeometryError`] when the configuration cannot describe a
    /// valid region.
    pub fn compute(config: ChannelConfig) -> Result<ChannelGeometry, GeometryError> {
        if config.desc_ring_slots == 0 || !config.desc_ring_slots.is_power_of_two() {
            return Err(GeometryError::BadRingSlots(config.desc_ring_slots));
        }
        if config.buf_count == 0 || !config.buf_count.is_power_of_two() {
            return Err(GeometryError::BadBufCount(config.buf_count));
        }
        if config.buf_mss == 0 {
            return Err(GeometryError::ZeroMss);
        }

        let buf_stride =
            crate::buffer::BUF_HDR_BYTES + align_up(config.buf_mss as usize, CACHELINE);

        // Every region starts cache-line aligned: the ring headers hold
        // atomics and the alignment is part of their contract.
        let sq_ofs = size_of::<ChannelHeader>();
        let cq_ofs = align_up(
            sq_ofs + ring_bytes::<CtrlQueueEntry>(CTRL_QUEUE_SLOTS),
            CACHELINE,
        );
        let buf_ring_ofs = align_up(
            cq_ofs + ring_bytes::<CtrlQueueEntry>(CTRL_QUEUE_SLOTS),
            CACHELINE,
        );
        let app_ring_ofs = align_up(buf_ring_ofs + ring_bytes::<u32>(config.buf_count), CACHELINE);
        let stack_ring_ofs = align_up(
            app_ring_ofs + ring_bytes::<u32>(config.desc_ring_slots),
            CACHELINE,
        );
        let buf_region_ofs = align_up(
            stack_ring_ofs + ring_bytes::<u32>(config.desc_ring_slots),
            CACHELINE,
        );
        let total = buf_region_ofs + config.buf_count as usize * buf_stride;

        Ok(ChannelGeometry {
            config,
            sq_ofs,
            cq_ofs,
            buf_ring_ofs,
            app_ring_ofs,
            stack_ring_ofs,
            buf_region_ofs,
            buf_stride,
            total,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn default_geometry_is_ordered_and_aligned() {
        let geo = ChannelGeometry::compute(ChannelConfig::default()).unwrap();
        let offsets = [
            geo.sq_ofs,
            geo.cq_ofs,
            geo.buf_ring_ofs,
            geo.app_ring_ofs,
            geo.stack_ring_ofs,
            geo.buf_region_ofs,
        ];
        for pair in offsets.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for ofs in offsets {
            assert_eq!(ofs % 64, 0, "offset {ofs} not cache-line aligned");
        }
        assert_eq!(
            geo.total,
            geo.buf_region_ofs + 4096 * geo.buf_stride,
        );
    }

    #[test]
    fn small_geometries_stay_aligned() {
        let geo = ChannelGeometry::compute(ChannelConfig {
            desc_ring_slots: 2,
            buf_count: 8,
            buf_mss: 100,
        })
        .unwrap();
        for ofs in [
            geo.sq_ofs,
            geo.cq_ofs,
            geo.buf_ring_ofs,
            geo.app_ring_ofs,
            geo.stack_ring_ofs,
            geo.buf_region_ofs,
        ] {
            assert_eq!(ofs % 64, 0, "offset {ofs} not cache-line aligned");
        }
        assert_eq!(geo.buf_stride, 64 + 128);
    }

    #[test]
    fn rejects_bad_configs() {
        let bad_slots = ChannelConfig {
            desc_ring_slots: 1000,
            ..ChannelConfig::default()
        };
        assert!(matches!(
            ChannelGeometry::compute(bad_slots),
            Err(GeometryError::BadRingSlots(1000))
        ));
        let bad_bufs = ChannelConfig {
            buf_count: 0,
            ..ChannelConfig::default()
        };
        assert!(matches!(
            ChannelGeometry::compute(bad_bufs),
            Err(GeometryError::BadBufCount(0))
        ));
        let bad_mss = ChannelConfig {
            buf_mss: 0,
            ..ChannelConfig::default()
        };
        assert!(matches!(
            ChannelGeometry::compute(bad_mss),
            Err(GeometryError::ZeroMss)
        ));
    }
}
