// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Channel region lifecycle and the two endpoint handles.
//!
//! The controller side builds a region with [`create`] and passes the file
//! descriptor to the application over the control socket; the application
//! maps it with [`Channel::bind`]. Each side gets a handle exposing only its
//! own ring roles: the application produces onto the app ring and the
//! control SQ and consumes the stack ring and control CQ; [`StackChannel`]
//! mirrors that. Both sides allocate from and free to the shared buffer
//! pool.

use core::mem::size_of;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use bytemuck::Zeroable;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;
use tracing::{debug, error, warn};

use crate::buffer::BufRef;
use crate::ctrlq::CtrlQueueEntry;
use crate::layout::{
    ChannelConfig, ChannelGeometry, GeometryError, ChannelHeader, CHANNEL_MAGIC, CHANNEL_VERSION,
    CTRL_QUEUE_SLOTS,
};
use crate::ring::Ring;

/// Errors creating a channel region.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// The configuration cannot describe a valid region.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// The region name is not a valid C string.
    #[error("channel name contains a NUL byte")]
    BadName,
    /// A syscall failed while building the region.
    #[error("channel region setup failed: {0}")]
    Os(#[from] Errno),
}

/// Errors mapping a channel file descriptor.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The descriptor is not open.
    #[error("shared memory fd is not usable: {0}")]
    BadFd(#[source] Errno),
    /// The descriptor's size could not be read.
    #[error("fstat on channel fd failed: {0}")]
    Stat(#[source] Errno),
    /// The mapping itself failed.
    #[error("mapping the channel failed: {0}")]
    Map(#[source] Errno),
    /// The region is smaller than a channel header.
    #[error("mapped region too small for a channel header ({size} bytes)")]
    TooSmall {
        /// Size reported by the kernel.
        size: usize,
    },
    /// The region does not start with the channel magic.
    #[error("channel magic mismatch: found {found:#010x}")]
    BadMagic {
        /// The first four bytes actually found.
        found: u32,
    },
    /// The header's recorded size disagrees with the mapping.
    #[error("channel header claims {header} bytes but the mapping is {mapped}")]
    SizeMismatch {
        /// Size recorded in the header.
        header: u64,
        /// Size reported by the kernel.
        mapped: usize,
    },
}

/// An owned `mmap` region, unmapped on drop.
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; the handle types built on top
// restrict which thread touches which ring role.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes of `fd` read-write shared, pages pre-populated,
    /// backed by huge pages when the kernel allows it.
    fn map_fd(fd: BorrowedFd<'_>, len: usize) -> Result<Mapping, Errno> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let populated = MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE;
        // SAFETY: we map a fresh region (addr = None) and hand the base to
        // exactly one Mapping, which unmaps it on drop.
        let base = unsafe {
            mmap(None, length, prot, populated | MapFlags::MAP_HUGETLB, fd, 0).or_else(|e| {
                debug!("huge-page mapping unavailable ({e}), falling back");
                mmap(None, length, prot, populated, fd, 0)
            })
        }?;
        Ok(Mapping {
            base: base.cast(),
            len,
        })
    }

    fn at(&self, ofs: usize) -> NonNull<u8> {
        debug_assert!(ofs < self.len);
        // SAFETY: every offset handed in comes from a validated geometry
        // bounded by self.len.
        unsafe { self.base.add(ofs) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and nothing else
        // unmaps this region.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            warn!("munmap of channel region failed: {e}");
        }
    }
}

/// The parts of a channel both endpoint handles share.
struct RawChannel {
    mapping: Mapping,
}

impl RawChannel {
    fn hdr(&self) -> &ChannelHeader {
        // SAFETY: bind/create verified the region starts with a valid
        // header.
        unsafe { self.mapping.base.cast::<ChannelHeader>().as_ref() }
    }

    fn ctrl_sq(&self) -> Ring<'_, CtrlQueueEntry> {
        // SAFETY: offsets were computed by ChannelGeometry and the rings
        // initialized at creation.
        unsafe { Ring::attach(self.mapping.at(self.hdr().ctrl_ctx.sq_ofs as usize)) }
    }

    fn ctrl_cq(&self) -> Ring<'_, CtrlQueueEntry> {
        // SAFETY: as ctrl_sq.
        unsafe { Ring::attach(self.mapping.at(self.hdr().ctrl_ctx.cq_ofs as usize)) }
    }

    fn buf_ring(&self) -> Ring<'_, u32> {
        // SAFETY: as ctrl_sq.
        unsafe { Ring::attach(self.mapping.at(self.hdr().data_ctx.buf_ring_ofs as usize)) }
    }

    fn app_ring(&self) -> Ring<'_, u32> {
        // SAFETY: as ctrl_sq.
        unsafe { Ring::attach(self.mapping.at(self.hdr().data_ctx.app_ring_ofs as usize)) }
    }

    fn stack_ring(&self) -> Ring<'_, u32> {
        // SAFETY: as ctrl_sq.
        unsafe { Ring::attach(self.mapping.at(self.hdr().data_ctx.stack_ring_ofs as usize)) }
    }

    fn buf(&self, index: u32) -> BufRef<'_> {
        let data = &self.hdr().data_ctx;
        if index >= data.buf_count {
            slot_abort(index, data.buf_count);
        }
        let ofs = data.buf_region_ofs as usize + index as usize * data.buf_stride as usize;
        // SAFETY: index is in range, so the slot lies inside the region;
        // from_raw aborts on a torn header.
        unsafe { BufRef::from_raw(self.mapping.at(ofs), data.buf_mss) }
    }

    fn buf_alloc_bulk(&self, out: &mut [u32]) -> usize {
        let n = self.buf_ring().dequeue_bulk(out);
        for &index in &out[..n] {
            self.buf(index).reset();
        }
        n
    }

    fn buf_free_bulk(&self, indices: &[u32]) -> usize {
        self.buf_ring().enqueue_bulk(indices)
    }
}

#[cold]
fn slot_abort(index: u32, count: u32) -> ! {
    // An out-of-range slot index can only come from a corrupted chain.
    error!(index, count, "slot index outside the buffer pool, aborting");
    std::process::abort()
}

/// Application-side handle to a mapped channel.
///
/// One thread owns each channel; the datapath entry points take `&mut self`
/// so that ownership is enforced by the borrow checker rather than a lock.
pub struct Channel {
    raw: RawChannel,
}

// SAFETY: the handle may move between threads; concurrent use is prevented
// by the &mut receivers.
unsafe impl Send for Channel {}

impl Channel {
    /// Map the channel referred to by `fd` and validate it.
    ///
    /// The descriptor is closed in every outcome: on failure nothing leaks,
    /// and on success the mapping itself keeps the region alive.
    ///
    /// # Errors
    ///
    /// Returns a [`BindError`] when the descriptor is dead, cannot be
    /// mapped, or does not contain a valid channel.
    pub fn bind(fd: OwnedFd) -> Result<Channel, BindError> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).map_err(BindError::BadFd)?;
        let stat = fstat(fd.as_raw_fd()).map_err(BindError::Stat)?;
        let size = usize::try_from(stat.st_size).unwrap_or(0);
        if size < size_of::<ChannelHeader>() {
            return Err(BindError::TooSmall { size });
        }
        let mapping = Mapping::map_fd(fd.as_fd(), size).map_err(BindError::Map)?;
        let raw = RawChannel { mapping };
        let hdr = raw.hdr();
        if hdr.magic != CHANNEL_MAGIC {
            return Err(BindError::BadMagic { found: hdr.magic });
        }
        if hdr.size != size as u64 {
            return Err(BindError::SizeMismatch {
                header: hdr.size,
                mapped: size,
            });
        }
        debug!(
            size,
            buf_count = hdr.data_ctx.buf_count,
            buf_mss = hdr.data_ctx.buf_mss,
            "bound shared-memory channel"
        );
        Ok(Channel { raw })
    }

    /// Total size of the mapped region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.raw.mapping.len
    }

    /// Maximum payload bytes per message buffer.
    #[must_use]
    pub fn buf_mss(&self) -> u32 {
        self.raw.hdr().data_ctx.buf_mss
    }

    /// Message buffers in the pool.
    #[must_use]
    pub fn buf_count(&self) -> u32 {
        self.raw.hdr().data_ctx.buf_count
    }

    /// Buffers currently free in the pool (racy snapshot).
    #[must_use]
    pub fn free_buf_count(&self) -> u32 {
        self.raw.buf_ring().len()
    }

    /// Take the next control-plane request id.
    pub fn next_req_id(&mut self) -> u32 {
        // SAFETY: req_id is written by the application alone; the peer
        // never touches it.
        let hdr = unsafe { self.raw.mapping.base.cast::<ChannelHeader>().as_mut() };
        let id = hdr.ctrl_ctx.req_id;
        hdr.ctrl_ctx.req_id = id.wrapping_add(1);
        id
    }

    /// Allocate exactly `out.len()` buffers from the pool, or none.
    /// Allocated buffers come back reset. Returns the count allocated.
    ///
    /// The ring primitives are individually thread-safe; the datapath
    /// composes them non-atomically and takes `&mut Channel` for that
    /// reason.
    pub fn buf_alloc_bulk(&self, out: &mut [u32]) -> usize {
        self.raw.buf_alloc_bulk(out)
    }

    /// Return buffers to the pool. Returns the count freed.
    pub fn buf_free_bulk(&self, indices: &[u32]) -> usize {
        self.raw.buf_free_bulk(indices)
    }

    /// Enqueue message-head slot indices toward the stack.
    /// Returns the count enqueued (`indices.len()` or 0).
    pub fn app_ring_enqueue(&self, indices: &[u32]) -> usize {
        self.raw.app_ring().enqueue_bulk(indices)
    }

    /// Dequeue message-head slot indices arriving from the stack.
    /// Returns the count dequeued (`out.len()` or 0).
    pub fn stack_ring_dequeue(&self, out: &mut [u32]) -> usize {
        self.raw.stack_ring().dequeue_bulk(out)
    }

    /// Submit one control request. Returns false when the SQ is full.
    pub fn ctrl_sq_enqueue(&self, entry: &CtrlQueueEntry) -> bool {
        self.raw.ctrl_sq().enqueue_bulk(core::slice::from_ref(entry)) == 1
    }

    /// Poll one control completion.
    pub fn ctrl_cq_dequeue(&self) -> Option<CtrlQueueEntry> {
        let mut out = [CtrlQueueEntry::zeroed()];
        (self.raw.ctrl_cq().dequeue_bulk(&mut out) == 1).then(|| out[0])
    }

    /// The buffer at `index`. Aborts the process on a corrupt slot index or
    /// buffer header.
    #[must_use]
    pub fn buf(&self, index: u32) -> BufRef<'_> {
        self.raw.buf(index)
    }
}

/// Stack-side handle to a channel: the controller's view, also used by the
/// test stub standing in for it.
pub struct StackChannel {
    raw: RawChannel,
}

// SAFETY: as for Channel.
unsafe impl Send for StackChannel {}

impl StackChannel {
    /// Dequeue message-head slot indices submitted by the application.
    pub fn app_ring_dequeue(&self, out: &mut [u32]) -> usize {
        self.raw.app_ring().dequeue_bulk(out)
    }

    /// Deliver message-head slot indices toward the application.
    pub fn stack_ring_enqueue(&self, indices: &[u32]) -> usize {
        self.raw.stack_ring().enqueue_bulk(indices)
    }

    /// Poll one control submission.
    pub fn ctrl_sq_dequeue(&self) -> Option<CtrlQueueEntry> {
        let mut out = [CtrlQueueEntry::zeroed()];
        (self.raw.ctrl_sq().dequeue_bulk(&mut out) == 1).then(|| out[0])
    }

    /// Post one control completion. Returns false when the CQ is full.
    pub fn ctrl_cq_enqueue(&self, entry: &CtrlQueueEntry) -> bool {
        self.raw.ctrl_cq().enqueue_bulk(core::slice::from_ref(entry)) == 1
    }

    /// Allocate buffers from the shared pool (reset on return).
    pub fn buf_alloc_bulk(&self, out: &mut [u32]) -> usize {
        self.raw.buf_alloc_bulk(out)
    }

    /// Return buffers to the shared pool.
    pub fn buf_free_bulk(&self, indices: &[u32]) -> usize {
        self.raw.buf_free_bulk(indices)
    }

    /// The buffer at `index`. Aborts the process on corruption.
    #[must_use]
    pub fn buf(&self, index: u32) -> BufRef<'_> {
        self.raw.buf(index)
    }

    /// Maximum payload bytes per message buffer.
    #[must_use]
    pub fn buf_mss(&self) -> u32 {
        self.raw.hdr().data_ctx.buf_mss
    }

    /// Buffers currently free in the pool (racy snapshot).
    #[must_use]
    pub fn free_buf_count(&self) -> u32 {
        self.raw.buf_ring().len()
    }
}

/// Build a channel region in a memfd and return its descriptor alongside
/// the stack-side handle.
///
/// The descriptor is what gets passed to the application (which maps its own
/// view with [`Channel::bind`]); the handle keeps the creator's mapping.
///
/// # Errors
///
/// Returns a [`CreateError`] when the configuration is invalid or a syscall
/// fails.
pub fn create(name: &str, config: ChannelConfig) -> Result<(OwnedFd, StackChannel), CreateError> {
    let geo = ChannelGeometry::compute(config)?;
    let cname = CString::new(name).map_err(|_| CreateError::BadName)?;
    let fd = memfd_create(cname.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)?;
    ftruncate(&fd, i64::try_from(geo.total).map_err(|_| Errno::EOVERFLOW)?)?;
    let mapping = Mapping::map_fd(fd.as_fd(), geo.total)?;

    // SAFETY: the mapping is fresh, exactly geo.total bytes, and private to
    // this function until the handle is returned.
    unsafe {
        let hdr = mapping.base.cast::<ChannelHeader>().as_mut();
        hdr.magic = CHANNEL_MAGIC;
        hdr.version = CHANNEL_VERSION;
        hdr.size = geo.total as u64;
        hdr.ctrl_ctx.req_id = 0;
        hdr.ctrl_ctx.sq_ofs = geo.sq_ofs as u64;
        hdr.ctrl_ctx.cq_ofs = geo.cq_ofs as u64;
        hdr.data_ctx.buf_ring_ofs = geo.buf_ring_ofs as u64;
        hdr.data_ctx.app_ring_ofs = geo.app_ring_ofs as u64;
        hdr.data_ctx.stack_ring_ofs = geo.stack_ring_ofs as u64;
        hdr.data_ctx.buf_region_ofs = geo.buf_region_ofs as u64;
        hdr.data_ctx.desc_ring_slots = config.desc_ring_slots;
        hdr.data_ctx.buf_count = config.buf_count;
        hdr.data_ctx.buf_stride = geo.buf_stride as u32;
        hdr.data_ctx.buf_mss = config.buf_mss;

        Ring::<CtrlQueueEntry>::init(mapping.at(geo.sq_ofs), CTRL_QUEUE_SLOTS);
        Ring::<CtrlQueueEntry>::init(mapping.at(geo.cq_ofs), CTRL_QUEUE_SLOTS);
        let buf_ring = Ring::<u32>::init(mapping.at(geo.buf_ring_ofs), config.buf_count);
        Ring::<u32>::init(mapping.at(geo.app_ring_ofs), config.desc_ring_slots);
        Ring::<u32>::init(mapping.at(geo.stack_ring_ofs), config.desc_ring_slots);

        for index in 0..config.buf_count {
            let ofs = geo.buf_region_ofs + index as usize * geo.buf_stride;
            mapping
                .at(ofs)
                .cast::<crate::buffer::MsgBufHdr>()
                .as_mut()
                .stamp(index);
        }

        let all: Vec<u32> = (0..config.buf_count).collect();
        let loaded = buf_ring.enqueue_bulk(&all);
        debug_assert_eq!(loaded, all.len());
    }

    debug!(name, total = geo.total, "created channel region");
    Ok((fd, StackChannel {
        raw: RawChannel { mapping },
    }))
}
