// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Client side of the host/client pairing: connects to a [`crate::host::Host`]
//! socket, receives `FrameAnnounce`s, and brokers locks on the frames they
//! describe.
//!
//! Announcements and lock responses share one socket, so anything not
//! immediately wanted by the caller in progress is queued rather than
//! dropped: a `FrameAnnounce` seen while waiting on a lock response is
//! buffered for the next [`Client::wait`].

use crate::alloc::{self, BufferHandle};
use crate::fourcc::FourCC;
use crate::frame::Frame;
use crate::transport::{poll_readable, Endpoint};
use crate::wire::{self, DenyReason, Message};
use crate::Error;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reconnection behavior for client connections.
///
/// Controls whether a [`Client`] automatically reconnects when the
/// connection to the host is lost, either through an explicit disconnect
/// error or a watchdog timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reconnect {
    /// Do not automatically reconnect on disconnect
    #[default]
    No,
    /// Automatically reconnect when connection is lost
    Yes,
}

impl From<Reconnect> for bool {
    fn from(reconnect: Reconnect) -> bool {
        matches!(reconnect, Reconnect::Yes)
    }
}

impl From<bool> for Reconnect {
    fn from(value: bool) -> Self {
        if value {
            Reconnect::Yes
        } else {
            Reconnect::No
        }
    }
}

/// Monitors liveness of a connection without relying on signals: a dedicated
/// thread wakes on an interval derived from `window` and fires `on_fire` once
/// no activity has been recorded for at least `window`. [`Watchdog::kick`]
/// records activity; dropping the watchdog cancels the thread and joins it.
struct Watchdog {
    last_activity_ns: Arc<AtomicI64>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(window: Duration, on_fire: Arc<dyn Fn() + Send + Sync>) -> Self {
        let last_activity_ns = Arc::new(AtomicI64::new(crate::timestamp().unwrap_or(0)));
        let cancel = Arc::new(AtomicBool::new(false));
        let window_ns = window.as_nanos() as i64;
        let poll_interval = (window / 4).max(Duration::from_millis(10));

        let last_activity = last_activity_ns.clone();
        let cancel_flag = cancel.clone();
        let handle = thread::spawn(move || {
            while !cancel_flag.load(Ordering::Acquire) {
                thread::sleep(poll_interval);
                let now = crate::timestamp().unwrap_or(0);
                let last = last_activity.load(Ordering::Acquire);
                if now - last > window_ns {
                    on_fire();
                }
            }
        });

        Watchdog {
            last_activity_ns,
            cancel,
            handle: Some(handle),
        }
    }

    fn kick(&self) {
        let now = crate::timestamp().unwrap_or(0);
        self.last_activity_ns.store(now, Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ClientInner {
    endpoint: Option<Endpoint>,
    queue: VecDeque<wire::FrameAnnounce>,
    watchdog: Watchdog,
}

/// A connection to a [`crate::host::Host`], subscribed to its published
/// frames.
///
/// # Examples
///
/// ```no_run
/// use videostream::client::{Client, Reconnect};
///
/// let client = Client::connect("/tmp/video.sock", 0, Reconnect::Yes)?;
/// let frame = client.wait(0)?;
/// client.trylock(&frame)?;
/// client.finish_lock(&frame)?;
/// println!("{}x{}", frame.width(), frame.height());
/// client.unlock(&frame)?;
/// # Ok::<(), videostream::Error>(())
/// ```
pub struct Client {
    inner: Mutex<ClientInner>,
    path: String,
    userptr: usize,
    reconnect: Reconnect,
    unresponsive: Arc<AtomicBool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("path", &self.path).finish()
    }
}

const DEFAULT_WATCHDOG_WINDOW: Duration = Duration::from_secs(5);

impl Client {
    /// Connects to a host listening at `path`. `userptr` is carried on every
    /// proxy frame this client produces, for a caller's own bookkeeping; it
    /// has no meaning to the host.
    pub fn connect(path: &str, userptr: usize, reconnect: Reconnect) -> Result<Self, Error> {
        let endpoint = Endpoint::connect(path)?;
        let unresponsive = Arc::new(AtomicBool::new(false));
        let watchdog = Self::spawn_watchdog(DEFAULT_WATCHDOG_WINDOW, unresponsive.clone());
        Ok(Client {
            inner: Mutex::new(ClientInner {
                endpoint: Some(endpoint),
                queue: VecDeque::new(),
                watchdog,
            }),
            path: path.to_string(),
            userptr,
            reconnect,
            unresponsive,
        })
    }

    fn spawn_watchdog(window: Duration, unresponsive: Arc<AtomicBool>) -> Watchdog {
        Watchdog::spawn(
            window,
            Arc::new(move || unresponsive.store(true, Ordering::Release)),
        )
    }

    /// Replaces the watchdog's activity window. Takes effect immediately;
    /// any pending timeout against the old window is discarded.
    pub fn set_watchdog_window(&self, window: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.watchdog = Self::spawn_watchdog(window, self.unresponsive.clone());
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn userptr(&self) -> usize {
        self.userptr
    }

    /// Closes the connection. Idempotent; [`Client::wait`] and friends
    /// return [`Error::Disconnected`] afterward unless reconnection is
    /// enabled and a later call re-establishes it.
    pub fn disconnect(&self) -> Result<(), Error> {
        self.inner.lock().unwrap().endpoint = None;
        Ok(())
    }

    fn reconnect_now(&self, inner: &mut ClientInner) -> Result<(), Error> {
        log::warn!("reconnecting to host at {}", self.path);
        inner.endpoint = Some(Endpoint::connect(&self.path)?);
        inner.watchdog.kick();
        Ok(())
    }

    /// Reads and demultiplexes messages until `want` accepts one or
    /// `deadline_ns` (an absolute [`crate::timestamp`], `0` for no deadline)
    /// passes. Messages that don't match are queued (announcements) or
    /// dropped (stray lock responses) and the loop continues.
    fn recv_until<F>(
        &self,
        deadline_ns: i64,
        mut want: F,
    ) -> Result<(Message, Option<std::os::fd::OwnedFd>), Error>
    where
        F: FnMut(&Message) -> bool,
    {
        loop {
            if self.unresponsive.swap(false, Ordering::AcqRel) {
                let mut inner = self.inner.lock().unwrap();
                if self.reconnect == Reconnect::Yes {
                    self.reconnect_now(&mut inner)?;
                } else {
                    return Err(Error::Timeout);
                }
            }

            let remaining_ms = if deadline_ns == 0 {
                -1
            } else {
                let now = crate::timestamp()?;
                if now >= deadline_ns {
                    return Err(Error::Timeout);
                }
                ((deadline_ns - now) / 1_000_000).max(1)
            };

            let fd = {
                let inner = self.inner.lock().unwrap();
                inner
                    .endpoint
                    .as_ref()
                    .ok_or(Error::Disconnected)?
                    .as_raw_fd()
            };
            if poll_readable(&[fd], remaining_ms)? == 0 {
                continue;
            }

            let mut buf = [0u8; 128];
            let received = {
                let inner = self.inner.lock().unwrap();
                let endpoint = inner.endpoint.as_ref().ok_or(Error::Disconnected)?;
                endpoint.try_recv(&mut buf)
            };

            let (len, descriptor) = match received {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(Error::Disconnected) if self.reconnect == Reconnect::Yes => {
                    let mut inner = self.inner.lock().unwrap();
                    self.reconnect_now(&mut inner)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.inner.lock().unwrap().watchdog.kick();
            let message = Message::decode(&buf[..len])?;
            if want(&message) {
                return Ok((message, descriptor));
            }
            if let Message::FrameAnnounce(announce) = message {
                self.inner.lock().unwrap().queue.push_back(announce);
            } else {
                log::debug!("dropping unsolicited message: {message:?}");
            }
        }
    }

    fn proxy_from_announce(&self, announce: wire::FrameAnnounce) -> Frame {
        let frame = Frame::construct(
            announce.width,
            announce.height,
            announce.stride,
            FourCC::from(announce.fourcc),
            self.userptr,
            None,
        );
        frame.publish(
            announce.serial,
            announce.timestamp,
            announce.expires,
            announce.duration,
            announce.pts,
            announce.dts,
        );
        frame.set_size(announce.size);
        frame
    }

    /// Blocks until the next published frame is announced, or `deadline_ns`
    /// (an absolute [`crate::timestamp`], `0` for no deadline) passes. The
    /// returned proxy frame has no buffer attached yet; call
    /// [`Client::trylock`] and [`Client::finish_lock`] to obtain one.
    pub fn wait(&self, deadline_ns: i64) -> Result<Frame, Error> {
        if let Some(announce) = self.inner.lock().unwrap().queue.pop_front() {
            return Ok(self.proxy_from_announce(announce));
        }
        let (message, _) = self.recv_until(deadline_ns, |m| matches!(m, Message::FrameAnnounce(_)))?;
        match message {
            Message::FrameAnnounce(announce) => Ok(self.proxy_from_announce(announce)),
            _ => unreachable!("recv_until only returns what `want` accepted"),
        }
    }

    /// Sends a lock request for `proxy`'s serial without waiting for the
    /// response; pair with [`Client::finish_lock`]. Split so a caller can
    /// pipeline several requests before collecting their results.
    pub fn trylock(&self, proxy: &Frame) -> Result<(), Error> {
        let bytes = Message::LockRequest {
            serial: proxy.serial(),
        }
        .encode();
        let inner = self.inner.lock().unwrap();
        let endpoint = inner.endpoint.as_ref().ok_or(Error::Disconnected)?;
        endpoint.send(&bytes, None)
    }

    /// Blocks for the response to a prior [`Client::trylock`]. On a grant,
    /// attaches the received descriptor to `proxy` so [`Frame::map`] works.
    /// On a denial, returns [`Error::InvalidArgument`] if the host no longer
    /// has the frame active or [`Error::LimitExceeded`] if this client
    /// already holds its configured cap.
    pub fn finish_lock(&self, proxy: &Frame) -> Result<(), Error> {
        let serial = proxy.serial();
        let (message, descriptor) = self.recv_until(0, |m| {
            matches!(m, Message::LockGrant(g) if g.serial == serial)
                || matches!(m, Message::LockDeny { serial: s, .. } if *s == serial)
        })?;
        match message {
            Message::LockGrant(grant) => {
                let fd = descriptor.ok_or_else(|| {
                    Error::InvalidArgument("lock grant arrived without a descriptor".into())
                })?;
                proxy.attach(BufferHandle::Imported { fd }, grant.size, grant.stride)
            }
            Message::LockDeny { reason, .. } => match reason {
                DenyReason::NotFound => Err(Error::InvalidArgument(format!(
                    "host no longer has frame {serial} active"
                ))),
                DenyReason::LimitExceeded => Err(Error::LimitExceeded),
            },
            _ => unreachable!("recv_until only returns what `want` accepted"),
        }
    }

    /// Releases a held frame: unmaps and closes the local descriptor and
    /// notifies the host so it can recycle the frame once every holder has
    /// unlocked. Idempotent — a `proxy` with no attached buffer is a no-op.
    pub fn unlock(&self, proxy: &Frame) -> Result<(), Error> {
        let handle = match proxy.detach_buffer() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        alloc::release(handle);

        let bytes = Message::UnlockRequest {
            serial: proxy.serial(),
        }
        .encode();
        let inner = self.inner.lock().unwrap();
        if let Some(endpoint) = inner.endpoint.as_ref() {
            endpoint.send(&bytes, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_from_bool_round_trips() {
        assert_eq!(Reconnect::from(true), Reconnect::Yes);
        assert_eq!(Reconnect::from(false), Reconnect::No);
        assert!(bool::from(Reconnect::Yes));
        assert!(!bool::from(Reconnect::No));
    }

    #[test]
    fn connect_without_a_host_is_refused() {
        let path = format!("/tmp/videostream-client-test-refused-{}.sock", std::process::id());
        let err = Client::connect(&path, 0, Reconnect::No).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused));
    }
}
