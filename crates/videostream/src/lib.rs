// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! VideoStream: zero-copy video frame distribution between processes on a
//! single Linux host.
//!
//! A [`host::Host`] publishes frames — DMA-heap or POSIX shared-memory
//! buffers, never copied — and broadcasts their metadata to every connected
//! [`client::Client`] over a local `SOCK_SEQPACKET` socket. A client that
//! wants pixel access asks the host to lock a specific frame; the host
//! duplicates the frame's descriptor and hands it across the socket as
//! ancillary data. No frame bytes ever cross the wire, only the descriptor
//! and a small fixed-size message.
//!
//! # Architecture
//!
//! - [`host::Host`]: owns the active-frame table, brokers locks, and runs
//!   the expiry sweeper that recycles frames once every holder has
//!   released them.
//! - [`client::Client`]: subscribes to a host's announcements and requests
//!   locks on the frames it cares about.
//! - [`frame::Frame`]: the pixel buffer record shared by both sides —
//!   either the frame a host publishes or the proxy a client locks.
//! - [`alloc`]: the buffer allocator behind [`frame::Frame::alloc`] — tries
//!   DMA-heap devices first, falls back to named shared memory.
//!
//! # Quick Start
//!
//! ## Publishing Frames (Host)
//!
//! ```no_run
//! use videostream::{fourcc::FourCC, frame::Frame, host::Host, Error};
//!
//! fn publish_frames() -> Result<(), Error> {
//!     let host = Host::new("/tmp/video.sock")?;
//!
//!     let frame = Frame::construct(1920, 1080, 1920 * 2, FourCC(*b"YUYV"), 0, None);
//!     frame.alloc(None)?; // DMA heap, or shared memory if unavailable
//!
//!     host.publish(frame, 0, -1, -1, -1)?;
//!     Ok(())
//! }
//! # publish_frames().ok();
//! ```
//!
//! ## Subscribing to Frames (Client)
//!
//! ```no_run
//! use videostream::{client::{Client, Reconnect}, Error};
//!
//! fn subscribe_frames() -> Result<(), Error> {
//!     let client = Client::connect("/tmp/video.sock", 0, Reconnect::Yes)?;
//!
//!     let frame = client.wait(0)?;
//!     client.trylock(&frame)?;
//!     client.finish_lock(&frame)?;
//!     println!("{}x{}", frame.width(), frame.height());
//!     client.unlock(&frame)?;
//!
//!     Ok(())
//! }
//! # subscribe_frames().ok();
//! ```
//!
//! # Non-goals
//!
//! This crate does not capture from cameras, touch hardware codecs, convert
//! or blit pixels, integrate with a multimedia framework, cross a network
//! boundary, or provide authentication/encryption. It is IPC plumbing for
//! frames that already exist as buffers on the same host.
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T, Error>`]. [`Error`] is a
//! small, explicit taxonomy (invalid argument, resource unavailable, name
//! exists, permission denied, address in use, connection refused,
//! disconnected, timeout, limit exceeded, unmapped, not supported) plus the
//! underlying I/O and conversion errors that produced them.

mod error;

pub use error::Error;

/// Buffer allocation: DMA-heap devices with POSIX shared memory as
/// fallback.
pub mod alloc;

/// Client API for subscribing to video frames.
pub mod client;

/// FOURCC pixel format codes.
pub mod fourcc;

/// In-process frame record shared between a host and its clients.
pub mod frame;

/// Host API for publishing video frames.
pub mod host;

/// Local-socket transport: bounded messages plus descriptor passing.
mod transport;

/// On-wire message format exchanged between a host and its clients.
mod wire;

pub use client::{Client, Reconnect};
pub use host::Host;

/// Returns the current monotonic timestamp in nanoseconds.
///
/// Uses `CLOCK_MONOTONIC`, the same clock basis used for every `expires` and
/// deadline field in this crate's APIs — values from different clocks (e.g.
/// wall-clock `SystemTime`) are never comparable to them. Not the clock
/// behind `Frame.timestamp`; see [`wall_clock_timestamp`] for that.
pub fn timestamp() -> Result<i64, Error> {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)?;
    Ok(ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
}

/// Returns the current wall-clock timestamp in nanoseconds since the Unix
/// epoch, for stamping `Frame.timestamp` (acquisition time) specifically.
///
/// This is a different clock basis than [`timestamp`]: never compare a
/// value from this function against an `expires` or deadline value.
pub fn wall_clock_timestamp() -> Result<i64, Error> {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| Error::InvalidArgument("system clock is before the Unix epoch".into()))?;
    Ok(i64::try_from(since_epoch.as_nanos())?)
}

/// Builds a default abstract-namespace socket path for `prefix`, suffixed
/// with this process's thread id so concurrent test runs (or multiple
/// independent hosts in one process) don't collide. Abstract-namespace
/// sockets (no leading `/`) leave nothing behind in the filesystem and
/// never need unlinking.
pub fn default_socket_path(prefix: &str) -> String {
    format!("videostream-{prefix}-{:?}", std::thread::current().id())
}
