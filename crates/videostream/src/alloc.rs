// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Dual-mode buffer allocation: DMA-heap devices with POSIX named shared
//! memory as fallback, hidden behind one acquisition API.

use crate::Error;
use nix::fcntl::{self, OFlag};
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maps a kernel failure from a buffer-allocation syscall to
/// [`Error::ResourceUnavailable`] when it signals unavailable kernel
/// resources (missing device node, missing driver, exhausted memory) rather
/// than a caller mistake; everything else keeps its usual mapping.
fn map_kernel_error(err: nix::Error) -> Error {
    match err {
        nix::Error::ENOENT | nix::Error::ENODEV | nix::Error::ENOMEM => {
            Error::ResourceUnavailable(io::Error::from(err))
        }
        other => Error::from(other),
    }
}

/// DMA-heap device nodes probed, in priority order, when no explicit path is
/// given. Compiled in; there is no runtime override.
const DMA_HEAP_DEVICES: &[&str] = &[
    "/dev/dma_heap/system",
    "/dev/dma_heap/linux,cma",
    "/dev/dma_heap/linux,cma-uncached",
];

static SHM_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A transferable handle to a pixel buffer.
///
/// `DmaHeap` and `SharedMemory` are allocated by [`acquire`] and are released
/// (and, for an owned shared-memory name, unlinked) by [`release`].
/// `Imported` wraps a descriptor this process did not allocate — either one
/// handed to [`crate::frame::Frame::attach`] by a producer collaborator, or
/// one received from a peer over the wire — and is never unlinked on release
/// since this process does not own the name behind it, if any.
pub enum BufferHandle {
    DmaHeap {
        fd: OwnedFd,
        device: String,
    },
    SharedMemory {
        fd: OwnedFd,
        name: String,
        owns_name: bool,
    },
    Imported {
        fd: OwnedFd,
    },
}

impl BufferHandle {
    /// The name of the backing object: the device path for DMA heap, the shm
    /// name for shared memory, `None` for an imported descriptor with no
    /// name attached.
    pub fn name(&self) -> Option<&str> {
        match self {
            BufferHandle::DmaHeap { device, .. } => Some(device.as_str()),
            BufferHandle::SharedMemory { name, .. } => Some(name.as_str()),
            BufferHandle::Imported { .. } => None,
        }
    }

    pub fn is_dma_heap(&self) -> bool {
        matches!(self, BufferHandle::DmaHeap { .. })
    }

    /// Duplicates the underlying descriptor so the caller can hand an
    /// independently-closeable copy across a process boundary.
    pub fn try_clone(&self) -> Result<OwnedFd, Error> {
        self.as_fd().try_clone_to_owned().map_err(Error::from)
    }
}

impl AsFd for BufferHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            BufferHandle::DmaHeap { fd, .. } => fd.as_fd(),
            BufferHandle::SharedMemory { fd, .. } => fd.as_fd(),
            BufferHandle::Imported { fd } => fd.as_fd(),
        }
    }
}

impl AsRawFd for BufferHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

// Layout of `struct dma_heap_allocation_data` from <linux/dma-heap.h>.
#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

nix::ioctl_readwrite!(dma_heap_ioctl_alloc, b'H', 0x0, DmaHeapAllocationData);

fn alloc_dma_heap(device: &str, size: usize) -> Result<BufferHandle, Error> {
    let heap_fd = fcntl::open(device, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(map_kernel_error)?;
    let heap_fd = unsafe { OwnedFd::from_raw_fd(heap_fd) };

    let mut data = DmaHeapAllocationData {
        len: size as u64,
        fd: 0,
        fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
        heap_flags: 0,
    };
    unsafe { dma_heap_ioctl_alloc(heap_fd.as_raw_fd(), &mut data) }.map_err(map_kernel_error)?;

    let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };
    Ok(BufferHandle::DmaHeap {
        fd,
        device: device.to_string(),
    })
}

fn alloc_shared_memory(name: &str, size: usize) -> Result<BufferHandle, Error> {
    let oflag = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    let fd = shm_open(name, oflag, mode).map_err(|errno| {
        if errno == nix::Error::EEXIST {
            Error::NameExists
        } else {
            map_kernel_error(errno)
        }
    })?;
    ftruncate(&fd, size as i64).map_err(map_kernel_error)?;
    Ok(BufferHandle::SharedMemory {
        fd,
        name: name.to_string(),
        owns_name: true,
    })
}

/// Thread- and process-unique shared-memory name for the `path == None`
/// fallback path; never reused within the process's lifetime.
fn generate_shm_name() -> String {
    let seq = SHM_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("/videostream-{}-{}", std::process::id(), seq)
}

/// Acquires `size` bytes under the selection policy:
///
/// - `path == None`: try each DMA-heap device in priority order; if none
///   succeed, fall back to a uniquely-named shared-memory region.
/// - `path` starts with `/dev/`: DMA-heap allocation from that device only,
///   no fallback; fails with [`Error::ResourceUnavailable`] if the device
///   cannot be opened or the kernel refuses the allocation.
/// - any other non-empty path: a named shared-memory region under that name,
///   failing with [`Error::NameExists`] if it is already taken.
pub fn acquire(path: Option<&str>, size: usize) -> Result<BufferHandle, Error> {
    match path {
        None => {
            for device in DMA_HEAP_DEVICES {
                if let Ok(handle) = alloc_dma_heap(device, size) {
                    return Ok(handle);
                }
            }
            let name = generate_shm_name();
            alloc_shared_memory(&name, size)
        }
        Some(p) if p.starts_with("/dev/") => alloc_dma_heap(p, size),
        Some(p) if !p.is_empty() => alloc_shared_memory(p, size),
        Some(_) => Err(Error::InvalidArgument("empty allocation path".into())),
    }
}

/// Releases a buffer: the descriptor closes when `handle` is dropped; a
/// shared-memory region this process created also has its name removed from
/// the namespace. DMA-heap buffers and imported descriptors have no name to
/// remove.
pub fn release(handle: BufferHandle) {
    if let BufferHandle::SharedMemory {
        name, owns_name, ..
    } = &handle
    {
        if *owns_name {
            if let Err(err) = shm_unlink(name.as_str()) {
                log::warn!("failed to unlink shared-memory region {name}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn named_shared_memory_round_trip() {
        let name = generate_shm_name();
        let handle = alloc_shared_memory(&name, 4096).expect("allocate shared memory");
        assert_eq!(handle.name(), Some(name.as_str()));
        assert!(!handle.is_dma_heap());
        release(handle);
    }

    #[test]
    #[serial]
    fn duplicate_name_fails_with_name_exists() {
        let name = generate_shm_name();
        let first = alloc_shared_memory(&name, 4096).expect("first allocation succeeds");
        let second = alloc_shared_memory(&name, 4096);
        assert!(matches!(second, Err(Error::NameExists)));
        release(first);
    }

    #[test]
    #[serial]
    fn empty_path_is_invalid_argument() {
        let err = acquire(Some(""), 4096).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    #[serial]
    fn unknown_dev_path_fails_as_resource_unavailable() {
        let err = acquire(Some("/dev/not-a-heap"), 4096).unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }
}
