// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Local-socket transport: bounded messages plus descriptor passing over a
//! connection-oriented, message-preserving Unix socket.
//!
//! Every logical message is exactly one `SOCK_SEQPACKET` datagram; the
//! kernel guarantees message boundaries, so no length prefix is carried on
//! the wire. A descriptor, when present, travels as ancillary data of the
//! same send that carries the message body.

use crate::Error;
use nix::sys::socket::{
    accept4, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn make_addr(path: &str) -> Result<UnixAddr, Error> {
    if path.starts_with('/') {
        UnixAddr::new(path).map_err(Error::from)
    } else {
        UnixAddr::new_abstract(path.as_bytes()).map_err(Error::from)
    }
}

// Every session socket is non-blocking; `Host::process`/`Client::wait` pair
// this with `poll` rather than blocking inside a read or accept.
fn new_socket() -> Result<OwnedFd, Error> {
    socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(Error::from)
}


/// One end of a connected session socket, on either the host or the client
/// side of the pairing.
pub struct Endpoint(OwnedFd);

impl Endpoint {
    /// Connects to a host listening at `path`. Fails with
    /// [`Error::ConnectionRefused`] if nothing is listening there.
    pub fn connect(path: &str) -> Result<Self, Error> {
        let addr = make_addr(path)?;
        let fd = new_socket()?;
        connect(fd.as_raw_fd(), &addr)?;
        Ok(Endpoint(fd))
    }

    fn from_owned(fd: OwnedFd) -> Self {
        Endpoint(fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Sends one message, optionally carrying a descriptor as ancillary
    /// data. `fd` is borrowed for the duration of the call; the caller keeps
    /// its own copy open.
    pub fn send(&self, bytes: &[u8], fd: Option<RawFd>) -> Result<(), Error> {
        let iov = [IoSlice::new(bytes)];
        match fd {
            Some(fd) => {
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(self.0.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
            }
            None => {
                sendmsg::<UnixAddr>(self.0.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?;
            }
        }
        Ok(())
    }

    /// Receives one message into `buf`, returning the number of bytes
    /// written and an owned descriptor if the message carried one. A
    /// zero-length read means the peer has closed the connection. Blocks
    /// until a message is available; callers on a non-blocking drain loop
    /// should use [`Endpoint::try_recv`] instead.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>), Error> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_buf = nix::cmsg_space!(RawFd);
        let msg = recvmsg::<UnixAddr>(
            self.0.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;

        if msg.bytes == 0 {
            return Err(Error::Disconnected);
        }

        let mut received_fd = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                let mut iter = fds.into_iter();
                if let Some(first) = iter.next() {
                    received_fd = Some(unsafe { OwnedFd::from_raw_fd(first) });
                }
                // A well-behaved peer sends at most one descriptor per
                // message; close any extras rather than leak them.
                for extra in iter {
                    drop(unsafe { OwnedFd::from_raw_fd(extra) });
                }
            }
        }

        Ok((msg.bytes, received_fd))
    }

    /// Non-blocking variant of [`Endpoint::recv`]: `Ok(None)` means nothing
    /// was queued right now, not a failure.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Option<OwnedFd>)>, Error> {
        match self.recv(buf) {
            Ok(result) => Ok(Some(result)),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Blocks up to `timeout_ms` (negative means indefinitely, zero returns
/// immediately) until any of `fds` becomes readable, returning the number
/// ready. Used by both [`crate::host::Host::poll`] and
/// [`crate::client::ClientSession::wait`] to pair a multiplexed wait with a
/// separate, non-blocking drain.
pub(crate) fn poll_readable(fds: &[RawFd], timeout_ms: i64) -> Result<i32, Error> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout = if timeout_ms < 0 { -1 } else { timeout_ms as i32 };
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
    if ret < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(ret)
}

/// The host's listening socket, bound to a filesystem or abstract-namespace
/// path.
pub struct Listener {
    fd: OwnedFd,
    path: String,
    is_filesystem: bool,
}

impl Listener {
    /// Binds and listens at `path`. A stale filesystem socket left behind by
    /// a crashed prior host (bind fails `AddressInUse`, a connect probe to
    /// the same path fails `ConnectionRefused`) is unlinked and the bind is
    /// retried once. If the path turns out to be held by a live host,
    /// returns [`Error::AddressInUse`].
    pub fn bind(path: &str) -> Result<Self, Error> {
        let is_filesystem = path.starts_with('/');
        let addr = make_addr(path)?;
        let fd = new_socket()?;

        match bind(fd.as_raw_fd(), &addr) {
            Ok(()) => {}
            Err(nix::Error::EADDRINUSE) if is_filesystem && Self::is_stale(path) => {
                log::warn!("removing stale socket path {path}");
                let _ = std::fs::remove_file(path);
                bind(fd.as_raw_fd(), &addr)?;
            }
            Err(nix::Error::EADDRINUSE) => return Err(Error::AddressInUse),
            Err(err) => return Err(Error::from(err)),
        }

        listen(&fd, Backlog::new(128).map_err(|_| {
            Error::InvalidArgument("invalid listen backlog".into())
        })?)?;

        Ok(Listener {
            fd,
            path: path.to_string(),
            is_filesystem,
        })
    }

    fn is_stale(path: &str) -> bool {
        let probe = match new_socket() {
            Ok(fd) => fd,
            Err(_) => return false,
        };
        let addr = match UnixAddr::new(path) {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        matches!(connect(probe.as_raw_fd(), &addr), Err(nix::Error::ECONNREFUSED))
    }

    pub fn accept(&self) -> Result<Endpoint, Error> {
        let fd = accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )?;
        Ok(Endpoint::from_owned(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Non-blocking variant of [`Listener::accept`]: `Ok(None)` means no
    /// connection is pending right now, not a failure.
    pub fn try_accept(&self) -> Result<Option<Endpoint>, Error> {
        match self.accept() {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.is_filesystem {
            match std::fs::remove_file(&self.path) {
                Ok(()) | Err(_) if !std::path::Path::new(&self.path).exists() => {}
                Err(err) => log::warn!("failed to remove socket path {}: {err}", self.path),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_path(name: &str) -> String {
        format!("/tmp/videostream-test-{name}-{}.sock", std::process::id())
    }

    #[test]
    #[serial]
    fn connect_without_listener_is_refused() {
        let path = test_path("refused");
        let err = Endpoint::connect(&path).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused));
    }

    #[test]
    #[serial]
    fn bind_twice_is_address_in_use() {
        let path = test_path("dup");
        let _listener = Listener::bind(&path).expect("first bind succeeds");
        let err = Listener::bind(&path).unwrap_err();
        assert!(matches!(err, Error::AddressInUse));
    }

    #[test]
    #[serial]
    fn stale_socket_path_is_recovered() {
        let path = test_path("stale");
        {
            let listener = Listener::bind(&path).expect("bind succeeds");
            std::mem::forget(listener); // simulate a crash: no Drop, path left behind
        }
        assert!(std::path::Path::new(&path).exists());
        let listener = Listener::bind(&path).expect("stale path is recovered");
        assert_eq!(listener.path(), path);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[serial]
    fn message_round_trip_without_descriptor() {
        let path = test_path("roundtrip");
        let listener = Listener::bind(&path).expect("bind succeeds");
        let client = Endpoint::connect(&path).expect("connect succeeds");
        let server = listener.accept().expect("accept succeeds");

        client.send(b"hello", None).expect("send succeeds");
        let mut buf = [0u8; 16];
        let (n, fd) = server.recv(&mut buf).expect("recv succeeds");
        assert_eq!(&buf[..n], b"hello");
        assert!(fd.is_none());
    }

    #[test]
    #[serial]
    fn message_round_trip_with_descriptor() {
        let path = test_path("fdpass");
        let listener = Listener::bind(&path).expect("bind succeeds");
        let client = Endpoint::connect(&path).expect("connect succeeds");
        let server = listener.accept().expect("accept succeeds");

        let (r, w) = nix::unistd::pipe().expect("pipe succeeds");
        client
            .send(b"fd", Some(w.as_raw_fd()))
            .expect("send with descriptor succeeds");
        drop(w);

        let mut buf = [0u8; 16];
        let (n, fd) = server.recv(&mut buf).expect("recv succeeds");
        assert_eq!(&buf[..n], b"fd");
        let fd = fd.expect("descriptor was passed");
        assert_ne!(fd.as_raw_fd(), r.as_raw_fd());
    }
}
