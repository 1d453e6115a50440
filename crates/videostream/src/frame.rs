// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! In-process frame record: pixel metadata plus a transferable buffer
//! handle, with single-owner finalization.
//!
//! `release` (dropping the last [`Frame`] clone) and `hold_count`
//! (cross-process lock count tracked by the host pool) are deliberately
//! distinct: the former governs how long the frame record lives in one
//! process, the latter governs host-side recycling eligibility.

use crate::alloc::{self, BufferHandle};
use crate::fourcc::FourCC;
use crate::Error;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Called exactly once, with the frame's `userptr`, when the last in-process
/// reference to the frame is released.
pub type Cleanup = Box<dyn FnOnce(usize) + Send>;

/// Resolves a DMA-heap-backed buffer's physical bus address. The core never
/// installs one itself; a hardware collaborator attaches it via
/// [`Frame::set_physical_address_resolver`].
pub type PhysicalAddressResolver = Box<dyn Fn(&BufferHandle) -> Result<u64, Error> + Send + Sync>;

struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// The mapping is backed by shared kernel memory, not by anything in this
// process's heap; moving the handle across threads is sound.
unsafe impl Send for Mapping {}

struct FrameInner {
    serial: AtomicI64,
    width: u32,
    height: u32,
    stride: AtomicU32,
    fourcc: FourCC,
    size: AtomicU64,
    timestamp: AtomicI64,
    pts: AtomicI64,
    dts: AtomicI64,
    duration: AtomicI64,
    expires: AtomicI64,
    hold_count: AtomicI64,
    buffer: Mutex<Option<BufferHandle>>,
    mapping: Mutex<Option<Mapping>>,
    userptr: usize,
    cleanup: Mutex<Option<Cleanup>>,
    phys_resolver: Mutex<Option<PhysicalAddressResolver>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.get_mut().unwrap().take() {
            if let Err(err) = unsafe { munmap(mapping.ptr, mapping.len) } {
                log::warn!("munmap on frame release failed: {err}");
            }
        }
        if let Some(handle) = self.buffer.get_mut().unwrap().take() {
            alloc::release(handle);
        }
        if let Some(cleanup) = self.cleanup.get_mut().unwrap().take() {
            cleanup(self.userptr);
        }
    }
}

/// A pixel buffer record. Cheap to clone — clones share the same underlying
/// record and its reference count governs in-process lifetime (see module
/// docs for why this is distinct from `hold_count`).
#[derive(Clone)]
pub struct Frame(Arc<FrameInner>);

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("serial", &self.serial())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("fourcc", &self.fourcc())
            .field("hold_count", &self.hold_count())
            .finish()
    }
}

impl Frame {
    /// Builds an empty frame with no buffer attached yet. Timing fields and
    /// `hold_count` start at zero; `serial` is `-1` until the frame is
    /// published by a [`crate::host::Host`].
    pub fn construct(
        width: u32,
        height: u32,
        stride: u32,
        fourcc: FourCC,
        userptr: usize,
        cleanup: Option<Cleanup>,
    ) -> Self {
        Frame(Arc::new(FrameInner {
            serial: AtomicI64::new(-1),
            width,
            height,
            stride: AtomicU32::new(stride),
            fourcc,
            size: AtomicU64::new(0),
            timestamp: AtomicI64::new(0),
            pts: AtomicI64::new(0),
            dts: AtomicI64::new(0),
            duration: AtomicI64::new(0),
            expires: AtomicI64::new(0),
            hold_count: AtomicI64::new(0),
            buffer: Mutex::new(None),
            mapping: Mutex::new(None),
            userptr,
            cleanup: Mutex::new(cleanup),
            phys_resolver: Mutex::new(None),
        }))
    }

    fn expected_size(&self) -> usize {
        let stride = self.stride();
        let stride = if stride == 0 {
            self.width as usize * 2
        } else {
            stride as usize
        };
        stride * self.height as usize
    }

    /// Acquires a buffer through the buffer allocator and attaches its
    /// descriptor. `path == None` picks the default policy (DMA heap, then
    /// shared memory); see [`alloc::acquire`] for the full selection
    /// policy. Fails [`Error::InvalidArgument`] if a buffer is already
    /// attached.
    pub fn alloc(&self, path: Option<&str>) -> Result<(), Error> {
        let mut buffer = self.0.buffer.lock().unwrap();
        if buffer.is_some() {
            return Err(Error::InvalidArgument(
                "frame already has an attached buffer".into(),
            ));
        }
        let size = self.expected_size();
        let handle = alloc::acquire(path, size)?;
        self.0.size.store(size as u64, Ordering::Release);
        *buffer = Some(handle);
        Ok(())
    }

    /// Attaches a pre-existing buffer handle supplied by a producer
    /// collaborator (e.g. a camera or encoder that already holds a DMA-heap
    /// or imported descriptor). Takes ownership of `handle`.
    pub fn attach(&self, handle: BufferHandle, size: u64, stride: u32) -> Result<(), Error> {
        let mut buffer = self.0.buffer.lock().unwrap();
        if buffer.is_some() {
            return Err(Error::InvalidArgument(
                "frame already has an attached buffer".into(),
            ));
        }
        self.0.stride.store(stride, Ordering::Release);
        self.0.size.store(size, Ordering::Release);
        *buffer = Some(handle);
        Ok(())
    }

    /// Returns a writable view into the pixel buffer, mapping it on first
    /// call and reusing the cached mapping on subsequent calls. Fails
    /// [`Error::Unmapped`] if no buffer is attached.
    pub fn map(&self) -> Result<FrameMap<'_>, Error> {
        let mut mapping = self.0.mapping.lock().unwrap();
        if mapping.is_none() {
            let buffer = self.0.buffer.lock().unwrap();
            let handle = buffer.as_ref().ok_or(Error::Unmapped)?;
            let len = NonZeroUsize::new(self.size() as usize).ok_or(Error::Unmapped)?;
            let ptr = unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    handle.as_fd(),
                    0,
                )
            }?;
            *mapping = Some(Mapping {
                ptr,
                len: len.get(),
            });
        }
        let active = mapping.as_ref().unwrap();
        Ok(FrameMap {
            ptr: active.ptr,
            len: active.len,
            _guard: mapping,
        })
    }

    /// Releases the cached mapping; the descriptor remains valid and a
    /// later [`Frame::map`] re-establishes it.
    pub fn unmap(&self) -> Result<(), Error> {
        let mut mapping = self.0.mapping.lock().unwrap();
        if let Some(active) = mapping.take() {
            unsafe { munmap(active.ptr, active.len) }?;
        }
        Ok(())
    }

    /// The buffer's physical bus address, if a hardware collaborator has
    /// attached a resolver via [`Frame::set_physical_address_resolver`].
    /// Otherwise, and always for shared-memory-backed frames,
    /// [`Error::NotSupported`] — no generic Linux uAPI exposes this.
    pub fn physical_address(&self) -> Result<u64, Error> {
        let buffer = self.0.buffer.lock().unwrap();
        let handle = buffer.as_ref().ok_or(Error::Unmapped)?;
        if !handle.is_dma_heap() {
            return Err(Error::NotSupported);
        }
        match &*self.0.phys_resolver.lock().unwrap() {
            Some(resolver) => resolver(handle),
            None => Err(Error::NotSupported),
        }
    }

    pub fn set_physical_address_resolver(&self, resolver: PhysicalAddressResolver) {
        *self.0.phys_resolver.lock().unwrap() = Some(resolver);
    }

    pub fn serial(&self) -> i64 {
        self.0.serial.load(Ordering::Acquire)
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn stride(&self) -> u32 {
        self.0.stride.load(Ordering::Acquire)
    }

    pub fn fourcc(&self) -> FourCC {
        self.0.fourcc
    }

    pub fn size(&self) -> u64 {
        self.0.size.load(Ordering::Acquire)
    }

    pub fn timestamp(&self) -> i64 {
        self.0.timestamp.load(Ordering::Acquire)
    }

    pub fn pts(&self) -> i64 {
        self.0.pts.load(Ordering::Acquire)
    }

    pub fn dts(&self) -> i64 {
        self.0.dts.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> i64 {
        self.0.duration.load(Ordering::Acquire)
    }

    pub fn expires(&self) -> i64 {
        self.0.expires.load(Ordering::Acquire)
    }

    pub fn hold_count(&self) -> i64 {
        self.0.hold_count.load(Ordering::Acquire)
    }

    /// The name of the backing object, for shared-memory-backed frames; the
    /// device path for DMA-heap-backed frames; `None` for an imported
    /// descriptor with no associated name.
    pub fn path(&self) -> Option<String> {
        self.0
            .buffer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|h| h.name().map(str::to_string))
    }

    pub fn userptr(&self) -> usize {
        self.0.userptr
    }

    /// A frame is recyclable iff it has no outstanding holds and either has
    /// no declared expiry or that expiry has passed.
    pub fn is_recyclable(&self, now: i64) -> bool {
        self.hold_count() == 0 && (self.expires() == 0 || now > self.expires())
    }

    pub(crate) fn raw_buffer_fd(&self) -> Result<RawFd, Error> {
        use std::os::fd::AsRawFd;
        self.0
            .buffer
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.as_raw_fd())
            .ok_or(Error::Unmapped)
    }

    /// Duplicates the attached descriptor so a caller can hand an
    /// independently-closeable copy across a process boundary.
    pub(crate) fn duplicate_descriptor(&self) -> Result<OwnedFd, Error> {
        self.0
            .buffer
            .lock()
            .unwrap()
            .as_ref()
            .ok_or(Error::Unmapped)?
            .try_clone()
    }

    pub(crate) fn publish(
        &self,
        serial: i64,
        timestamp: i64,
        expires: i64,
        duration: i64,
        pts: i64,
        dts: i64,
    ) {
        self.0.serial.store(serial, Ordering::Release);
        self.0.timestamp.store(timestamp, Ordering::Release);
        self.0.expires.store(expires, Ordering::Release);
        self.0.duration.store(duration, Ordering::Release);
        self.0.pts.store(pts, Ordering::Release);
        self.0.dts.store(dts, Ordering::Release);
    }

    pub(crate) fn hold(&self) -> i64 {
        self.0.hold_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn unhold(&self) -> i64 {
        self.0.hold_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.0.size.store(size, Ordering::Release);
    }

    /// Takes the attached buffer out of the frame, unmapping it first if
    /// mapped. Used by a client proxy on unlock so the descriptor closes
    /// immediately rather than waiting for the frame to drop.
    pub(crate) fn detach_buffer(&self) -> Option<BufferHandle> {
        if let Some(mapping) = self.0.mapping.lock().unwrap().take() {
            if let Err(err) = unsafe { munmap(mapping.ptr, mapping.len) } {
                log::warn!("munmap on unlock failed: {err}");
            }
        }
        self.0.buffer.lock().unwrap().take()
    }
}

/// A cached view into a frame's mapped pixel buffer. Borrows the frame's
/// mapping lock for its lifetime so a concurrent [`Frame::unmap`] cannot
/// invalidate the pointer out from under a live view.
pub struct FrameMap<'a> {
    ptr: NonNull<c_void>,
    len: usize,
    _guard: std::sync::MutexGuard<'a, Option<Mapping>>,
}

impl FrameMap<'_> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    /// # Safety
    /// Callers sharing this buffer with another process are responsible for
    /// finishing writes before publication and for not racing a concurrent
    /// reader; the protocol imposes no ordering on pixel I/O.
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serial_test::serial;

    fn yuyv() -> FourCC {
        FourCC(*b"YUYV")
    }

    #[test]
    #[serial]
    fn construct_starts_unpublished_and_unheld() {
        let frame = Frame::construct(640, 480, 0, yuyv(), 0, None);
        assert_eq!(frame.serial(), -1);
        assert_eq!(frame.hold_count(), 0);
        assert_eq!(frame.width(), 640);
    }

    #[test]
    #[serial]
    fn alloc_then_alloc_again_is_invalid_argument() {
        let frame = Frame::construct(64, 64, 0, yuyv(), 0, None);
        frame.alloc(None).expect("first alloc succeeds");
        let err = frame.alloc(None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    #[serial]
    fn map_without_buffer_is_unmapped() {
        let frame = Frame::construct(64, 64, 0, yuyv(), 0, None);
        let err = frame.map().unwrap_err();
        assert!(matches!(err, Error::Unmapped));
    }

    #[test]
    #[serial]
    fn map_then_write_then_read_back() {
        let frame = Frame::construct(16, 16, 32, yuyv(), 0, None);
        frame.alloc(None).expect("alloc succeeds");
        assert_eq!(frame.size(), 32 * 16);

        let mut data = vec![0u8; frame.size() as usize];
        rand::rng().fill_bytes(&mut data);
        {
            let view = frame.map().expect("map succeeds");
            view.as_mut_slice().copy_from_slice(&data);
        }
        let view = frame.map().expect("second map reuses cache");
        assert_eq!(view.as_slice(), data.as_slice());
    }

    #[test]
    #[serial]
    fn unmap_allows_remap() {
        let frame = Frame::construct(16, 16, 32, yuyv(), 0, None);
        frame.alloc(None).expect("alloc succeeds");
        let _ = frame.map().expect("map succeeds");
        frame.unmap().expect("unmap succeeds");
        let _ = frame.map().expect("remap succeeds");
    }

    #[test]
    #[serial]
    fn recyclable_respects_hold_count_and_expiry() {
        let frame = Frame::construct(4, 4, 0, yuyv(), 0, None);
        assert!(frame.is_recyclable(1));
        frame.hold();
        assert!(!frame.is_recyclable(1));
        frame.unhold();
        frame.publish(1, 0, 100, -1, -1, -1);
        assert!(!frame.is_recyclable(50));
        assert!(frame.is_recyclable(150));
    }

    #[test]
    #[serial]
    fn physical_address_unsupported_without_resolver() {
        let frame = Frame::construct(4, 4, 0, yuyv(), 0, None);
        frame.alloc(Some("/tmp/videostream-frame-test-shm")).ok();
        let err = frame.physical_address().unwrap_err();
        assert!(matches!(err, Error::NotSupported | Error::Unmapped));
    }

    #[test]
    #[serial]
    fn cleanup_runs_exactly_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let frame = Frame::construct(
            4,
            4,
            0,
            yuyv(),
            7,
            Some(Box::new(move |userptr| {
                assert_eq!(userptr, 7);
                calls_clone.fetch_add(1, O::SeqCst);
            })),
        );
        let clone = frame.clone();
        drop(clone);
        assert_eq!(calls.load(O::SeqCst), 0, "still one live reference");
        drop(frame);
        assert_eq!(calls.load(O::SeqCst), 1);
    }
}
