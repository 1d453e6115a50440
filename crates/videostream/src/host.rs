// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Host pool: owns active frames, brokers locks, runs the expiry sweeper,
//! and cleans up after disconnected clients.
//!
//! A single mutex serializes every mutation (active-frame table, session
//! table and held-lists, the serial counter, and per-session sends) so two
//! producers can never interleave an announce on one client's socket.

use crate::frame::Frame;
use crate::transport::{poll_readable, Listener};
use crate::wire::{self, DenyReason, Message};
use crate::Error;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

/// Per-host tunables. The per-client hold cap is a defensive measure
/// against a buggy or malicious client exhausting the pool; it is not a
/// flow-control mechanism, so producers should set `expires` deliberately
/// rather than lean on clients to unlock promptly.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub hold_cap: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig { hold_cap: 20 }
    }
}

struct Session {
    endpoint: crate::transport::Endpoint,
    // Outstanding locks per serial, keyed by serial; a session may lock the
    // same serial more than once before unlocking, and each lock/unlock must
    // pair one-for-one with a `frame.hold()`/`frame.unhold()` call so a
    // disconnect can unwind exactly as many holds as were actually granted.
    held: HashMap<i64, u32>,
}

struct HostInner {
    listener: Listener,
    sessions: HashMap<RawFd, Session>,
    frames: HashMap<i64, Frame>,
    next_serial: i64,
    hold_cap: usize,
}

impl HostInner {
    fn accept_pending(&mut self) {
        loop {
            match self.listener.try_accept() {
                Ok(Some(endpoint)) => {
                    let fd = endpoint.as_raw_fd();
                    log::info!("client connected: fd {fd}");
                    self.announce_active_frames(&endpoint);
                    self.sessions.insert(
                        fd,
                        Session {
                            endpoint,
                            held: HashMap::new(),
                        },
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// A client that connects after frames are already active would
    /// otherwise never learn their serials; catch it up with one
    /// `FrameAnnounce` per currently active frame.
    fn announce_active_frames(&self, endpoint: &crate::transport::Endpoint) {
        for (serial, frame) in self.frames.iter() {
            let announce = Message::FrameAnnounce(wire::FrameAnnounce {
                serial: *serial,
                width: frame.width(),
                height: frame.height(),
                stride: frame.stride(),
                fourcc: frame.fourcc().into(),
                size: frame.size(),
                timestamp: frame.timestamp(),
                pts: frame.pts(),
                dts: frame.dts(),
                duration: frame.duration(),
                expires: frame.expires(),
            });
            if let Err(err) = endpoint.send(&announce.encode(), None) {
                log::warn!("failed to catch up new client on frame {serial}: {err}");
            }
        }
    }

    /// Drains every queued message on `fd`, applying each to the state
    /// machine. Returns [`Error::Disconnected`] once the peer has hung up so
    /// the caller can remove the session.
    fn drain_one(&mut self, fd: RawFd) -> Result<(), Error> {
        loop {
            let mut buf = [0u8; 128];
            let received = match self.sessions.get(&fd) {
                Some(session) => session.endpoint.try_recv(&mut buf)?,
                None => return Err(Error::Disconnected),
            };
            let (len, stray_fd) = match received {
                Some(result) => result,
                None => return Ok(()),
            };
            // Clients never send descriptors; close anything unexpected
            // rather than leak it.
            drop(stray_fd);

            let message = Message::decode(&buf[..len])?;
            self.handle_message(fd, message)?;
        }
    }

    fn handle_message(&mut self, fd: RawFd, message: Message) -> Result<(), Error> {
        match message {
            Message::LockRequest { serial } => self.handle_lock_request(fd, serial),
            Message::UnlockRequest { serial } => {
                self.handle_unlock_request(fd, serial);
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "client sent a host-only message kind".into(),
            )),
        }
    }

    fn handle_lock_request(&mut self, fd: RawFd, serial: i64) -> Result<(), Error> {
        let held_count = self.sessions.get(&fd).map_or(0, |s| s.held.len());
        let frame = self.frames.get(&serial).cloned();

        let (message, descriptor) = match frame {
            None => (
                Message::LockDeny {
                    serial,
                    reason: DenyReason::NotFound,
                },
                None,
            ),
            Some(_) if held_count >= self.hold_cap => (
                Message::LockDeny {
                    serial,
                    reason: DenyReason::LimitExceeded,
                },
                None,
            ),
            Some(frame) => {
                let descriptor = frame.duplicate_descriptor()?;
                frame.hold();
                if let Some(session) = self.sessions.get_mut(&fd) {
                    *session.held.entry(serial).or_insert(0) += 1;
                }
                let grant = wire::LockGrant {
                    serial,
                    width: frame.width(),
                    height: frame.height(),
                    stride: frame.stride(),
                    size: frame.size(),
                };
                (Message::LockGrant(grant), Some(descriptor))
            }
        };

        if let Some(session) = self.sessions.get(&fd) {
            let bytes = message.encode();
            let raw_fd = descriptor.as_ref().map(|fd| fd.as_raw_fd());
            session.endpoint.send(&bytes, raw_fd)?;
        }
        // `descriptor`'s OwnedFd, if any, closes here: sendmsg duplicated it
        // into the client's fd table, this process's copy is no longer needed.
        Ok(())
    }

    fn handle_unlock_request(&mut self, fd: RawFd, serial: i64) {
        let was_held = self
            .sessions
            .get_mut(&fd)
            .map(|session| match session.held.get_mut(&serial) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        session.held.remove(&serial);
                    }
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        if !was_held {
            log::debug!("ignoring unlock for serial {serial} not held by session {fd}");
            return;
        }
        if let Some(frame) = self.frames.get(&serial) {
            frame.unhold();
        }
    }

    fn remove_session(&mut self, fd: RawFd) {
        if let Some(session) = self.sessions.remove(&fd) {
            for (serial, count) in session.held {
                if let Some(frame) = self.frames.get(&serial) {
                    for _ in 0..count {
                        frame.unhold();
                    }
                }
            }
            log::info!("client disconnected: fd {fd}");
        }
    }

    fn sweep(&mut self) {
        let now = crate::timestamp().unwrap_or(0);
        let recyclable: Vec<i64> = self
            .frames
            .iter()
            .filter(|(_, frame)| frame.is_recyclable(now))
            .map(|(serial, _)| *serial)
            .collect();
        for serial in recyclable {
            if self.frames.remove(&serial).is_some() {
                log::debug!("sweeper recycling frame {serial}");
            }
        }
    }
}

/// Owns one socket's worth of connected clients and the frames currently
/// active on it. Only one host may own a given socket path at a time; any
/// number of clients may subscribe.
///
/// # Examples
///
/// ```no_run
/// use videostream::host::Host;
///
/// let host = Host::new("/tmp/video.sock")?;
/// println!("Host listening on: {}", host.path());
/// # Ok::<(), videostream::Error>(())
/// ```
pub struct Host(Mutex<HostInner>);

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("path", &self.path()).finish()
    }
}

impl Host {
    /// Binds a listening socket at `path` with the default hold cap (20).
    pub fn new(path: &str) -> Result<Self, Error> {
        Self::with_config(path, HostConfig::default())
    }

    pub fn with_config(path: &str, config: HostConfig) -> Result<Self, Error> {
        let listener = Listener::bind(path)?;
        Ok(Host(Mutex::new(HostInner {
            listener,
            sessions: HashMap::new(),
            frames: HashMap::new(),
            next_serial: 0,
            hold_cap: config.hold_cap,
        })))
    }

    pub fn path(&self) -> String {
        self.0.lock().unwrap().listener.path().to_string()
    }

    /// Blocks up to `wait` milliseconds (negative: indefinitely, zero:
    /// return immediately) until the listener or any client socket becomes
    /// readable. Does not itself process; pair with [`Host::process`].
    pub fn poll(&self, wait: i64) -> Result<i32, Error> {
        let fds = self.sockets();
        poll_readable(&fds, wait)
    }

    /// Accepts pending connections, drains every client socket applying
    /// messages to the state machine, then runs the expiry sweeper. Fully
    /// non-blocking.
    pub fn process(&self) -> Result<(), Error> {
        let mut inner = self.0.lock().unwrap();
        inner.accept_pending();

        let fds: Vec<RawFd> = inner.sessions.keys().copied().collect();
        let mut disconnected = Vec::new();
        for fd in fds {
            match inner.drain_one(fd) {
                Ok(()) => {}
                Err(Error::Disconnected) => disconnected.push(fd),
                Err(err) => {
                    log::warn!("session {fd} protocol error, disconnecting: {err}");
                    disconnected.push(fd);
                }
            }
        }
        for fd in disconnected {
            inner.remove_session(fd);
        }

        inner.sweep();
        Ok(())
    }

    /// Services exactly one named socket: the listener (accepts pending
    /// connections) or a client socket (drains its queued messages).
    /// Does not run the sweeper.
    pub fn service(&self, sock: RawFd) -> Result<(), Error> {
        let mut inner = self.0.lock().unwrap();
        if sock == inner.listener.as_raw_fd() {
            inner.accept_pending();
            return Ok(());
        }
        match inner.drain_one(sock) {
            Ok(()) => Ok(()),
            Err(Error::Disconnected) => {
                inner.remove_session(sock);
                Ok(())
            }
            Err(err) => {
                inner.remove_session(sock);
                Err(err)
            }
        }
    }

    /// The listening socket followed by every connected client socket.
    /// Refresh frequently: sockets may become stale as clients disconnect.
    pub fn sockets(&self) -> Vec<RawFd> {
        let inner = self.0.lock().unwrap();
        let mut fds = vec![inner.listener.as_raw_fd()];
        fds.extend(inner.sessions.keys().copied());
        fds
    }

    /// Assigns the next serial, stamps timing fields, inserts the frame
    /// into the active table, and broadcasts `FrameAnnounce` to every
    /// connected client. Transfers ownership of `frame` to the pool;
    /// returns the assigned serial.
    pub fn publish(
        &self,
        frame: Frame,
        expires: i64,
        duration: i64,
        pts: i64,
        dts: i64,
    ) -> Result<i64, Error> {
        let mut inner = self.0.lock().unwrap();
        let serial = inner.next_serial;
        inner.next_serial += 1;

        // `timestamp` is wall-clock acquisition time, a different clock basis
        // than `expires`, which is compared against `crate::timestamp()` by
        // the sweeper and must stay monotonic.
        let timestamp = crate::wall_clock_timestamp()?;
        frame.publish(serial, timestamp, expires, duration, pts, dts);

        let announce = Message::FrameAnnounce(wire::FrameAnnounce {
            serial,
            width: frame.width(),
            height: frame.height(),
            stride: frame.stride(),
            fourcc: frame.fourcc().into(),
            size: frame.size(),
            timestamp,
            pts,
            dts,
            duration,
            expires,
        });
        let bytes = announce.encode();

        inner.frames.insert(serial, frame);
        for session in inner.sessions.values() {
            if let Err(err) = session.endpoint.send(&bytes, None) {
                log::warn!("failed to announce frame {serial} to a client: {err}");
            }
        }
        Ok(serial)
    }

    /// Cancels a previously published frame before it expires, removing it
    /// from the active table and returning it unpublished. Clients that
    /// already hold it keep their grant until they unlock; this only stops
    /// new locks and the sweeper from seeing it.
    pub fn drop_frame(&self, serial: i64) -> Result<Frame, Error> {
        let mut inner = self.0.lock().unwrap();
        inner.frames.remove(&serial).ok_or_else(|| {
            Error::InvalidArgument(format!("no active frame with serial {serial}"))
        })
    }
}

// Dropping the Mutex drops `HostInner`, which drops the listener (unlinking
// a filesystem path), every session (closing its socket), and every active
// frame (closing descriptors, unmapping, running finalizers) — equivalent
// to an explicit `release`.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc::FourCC;
    use crate::Client;
    use crate::Reconnect;
    use serial_test::serial;

    fn test_path(name: &str) -> String {
        format!("/tmp/videostream-host-test-{name}-{}.sock", std::process::id())
    }

    #[test]
    #[serial]
    fn new_host_lists_only_the_listener_socket() {
        let host = Host::new(&test_path("sockets")).unwrap();
        let sockets = host.sockets();
        assert_eq!(sockets.len(), 1);
        assert!(sockets[0] >= 0);
    }

    #[test]
    #[serial]
    fn poll_with_zero_timeout_returns_immediately() {
        let host = Host::new(&test_path("poll")).unwrap();
        let ready = host.poll(0).unwrap();
        assert_eq!(ready, 0);
    }

    #[test]
    #[serial]
    fn publish_assigns_increasing_serials() {
        let host = Host::new(&test_path("serials")).unwrap();
        let f1 = Frame::construct(4, 4, 0, FourCC(*b"NV12"), 0, None);
        let f2 = Frame::construct(4, 4, 0, FourCC(*b"NV12"), 0, None);
        let s1 = host.publish(f1, 0, -1, -1, -1).unwrap();
        let s2 = host.publish(f2, 0, -1, -1, -1).unwrap();
        assert!(s2 > s1);
    }

    #[test]
    #[serial]
    fn drop_frame_removes_unpublished_frame() {
        let host = Host::new(&test_path("dropframe")).unwrap();
        let frame = Frame::construct(4, 4, 0, FourCC(*b"NV12"), 0, None);
        let serial = host.publish(frame, 0, -1, -1, -1).unwrap();
        let dropped = host.drop_frame(serial).unwrap();
        assert_eq!(dropped.serial(), serial);
        assert!(host.drop_frame(serial).is_err());
    }

    #[test]
    #[serial]
    fn single_producer_single_consumer_end_to_end() {
        let path = test_path("e2e");
        let host = Host::new(&path).unwrap();

        let frame = Frame::construct(8, 8, 16, FourCC(*b"NV12"), 0, None);
        frame.alloc(None).unwrap();
        let now = crate::timestamp().unwrap();
        let serial = host.publish(frame, now + 100_000_000, -1, -1, -1).unwrap();

        let client = Client::connect(&path, 0, Reconnect::No).unwrap();
        host.process().unwrap();

        let proxy = client.wait(0).unwrap();
        assert_eq!(proxy.serial(), serial);

        client.trylock(&proxy).unwrap();
        host.process().unwrap();
        client.finish_lock(&proxy).unwrap();
        assert_eq!(proxy.size(), 16 * 8);

        client.unlock(&proxy).unwrap();
        host.process().unwrap();
    }
}
