//! Socket wrappers: option application, zero-copy file transmission,
//! and the socketpair used to decouple an accepted peer's foreground
//! handler from the network loop (§4.2).
//!
//! Grounded in the teacher's `bft::communication::socket`, generalized
//! from a single `connect`/`accept` pair to the fuller set of options
//! the data model calls for (keepalive tuning, linger, `IP_TOS`,
//! `TCP_CORK`, `sendfile`).

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::net::{TcpListener, TcpStream, UnixStream};

use crate::error::{ErrorKind, Result, ResultWrappedExt};

/// Width of the `AUTH` handshake cookie (§6). The source's equivalent
/// constant lives in a header this pack's retrieval didn't carry;
/// 64 bytes keeps it comfortably wider than a SHA-256 digest.
pub const AUTH_COOKIE_LEN: usize = 64;

/// Per-role `IP_TOS` priority, set once at connection creation
/// depending on which side of the handshake a peer is on (§4.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerRole {
    Client,
    Server,
}

/// Keepalive tuning pulled from `NodeConfig` and applied to every
/// connected socket (§4.2's "TCP socket options" list).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeepaliveConfig {
    pub count: i32,
    pub idle: i32,
    pub interval: i32,
}

/// A connected TCP socket with the options the data model requires
/// already applied.
#[derive(Debug)]
pub struct Socket {
    stream: TcpStream,
}

impl Socket {
    /// Initiates a non-blocking outbound connection (`Connecting`'s
    /// entry action, §4.2).
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.wrapped(ErrorKind::Transport)?;
        Ok(Socket { stream })
    }

    /// Wraps an already-accepted stream (the listener's half of
    /// `accept`).
    pub fn from_accepted(stream: TcpStream) -> Self {
        Socket { stream }
    }

    pub fn inner(&self) -> &TcpStream {
        &self.stream
    }

    /// Unwraps this `Socket`, handing back the plain `TcpStream` so a
    /// caller can split it into owned read/write halves.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    /// Applies the fixed option set every connected socket carries
    /// (§4.2): keepalive, linger, and the role-appropriate `IP_TOS`.
    /// `O_NONBLOCK` and close-on-exec are already guaranteed by
    /// `tokio::net::TcpStream`, which never hands out a blocking or
    /// inheritable fd.
    pub fn apply_options(&self, keepalive: KeepaliveConfig, role: PeerRole, tos: i32) -> Result<()> {
        let fd = self.stream.as_raw_fd();
        set_keepalive(fd, keepalive)?;
        set_linger(fd)?;
        set_tos(fd, tos, role)?;
        Ok(())
    }
}

/// A listening socket, bound and ready to accept inbound connections.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await.wrapped(ErrorKind::Transport)?;
        Ok(Listener { inner })
    }

    pub async fn accept(&self) -> Result<(Socket, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await.wrapped(ErrorKind::Transport)?;
        Ok((Socket::from_accepted(stream), addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Enables or disables `TCP_CORK` (Linux) so a header-plus-data write
/// is coalesced into fewer packets; the send-path algorithm in
/// `peer/mod.rs` toggles this around a multi-region write (§4.2 step 2
/// and step 5) against the raw write fd it holds once a `Socket` has
/// been split into owned read/write halves. A no-op on platforms
/// without cork support.
pub fn set_cork_raw(fd: RawFd, on: bool) -> Result<()> {
    cork::set(fd, on)
}

/// Raw-fd form of `TCP_NODELAY`, for the same reason as
/// [`set_cork_raw`].
pub fn set_nodelay_raw(fd: RawFd) -> Result<()> {
    unsafe { setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) }
}

/// Raw-fd form of the zero-copy `sendfile` fast path, for the same
/// reason as [`set_cork_raw`].
pub fn send_file_raw(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, len: usize) -> Result<usize> {
    sendfile::send(out_fd, in_fd, offset, len)
}

/// Allocates the internal socketpair an accepted peer needing duplex
/// decoupling uses: the external socket becomes `accept_fd`, and the
/// two ends returned here become `read_fd`/`write_fd`, letting a
/// foreground handler inject synthetic messages into the peer's
/// inbound stream without touching the network socket (§4.2).
pub fn duplex_pair() -> Result<(UnixStream, UnixStream)> {
    UnixStream::pair().wrapped(ErrorKind::Transport)
}

fn set_keepalive(fd: RawFd, cfg: KeepaliveConfig) -> Result<()> {
    unsafe {
        setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, true)?;
        setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, cfg.count)?;
        setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, cfg.idle)?;
        setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, cfg.interval)?;
    }
    Ok(())
}

fn set_linger(fd: RawFd) -> Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 1,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    check_rc(rc)
}

fn set_tos(fd: RawFd, tos: i32, role: PeerRole) -> Result<()> {
    let _ = role; // the value passed in is already role-selected by the caller
    unsafe { setsockopt_i32(fd, libc::IPPROTO_IP, libc::IP_TOS, tos) }
}

unsafe fn setsockopt_i32(fd: RawFd, level: libc::c_int, name: libc::c_int, value: i32) -> Result<()> {
    let rc = libc::setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        std::mem::size_of::<i32>() as libc::socklen_t,
    );
    check_rc(rc)
}

unsafe fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, value: bool) -> Result<()> {
    setsockopt_i32(fd, level, name, value as i32)
}

fn check_rc(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error()).wrapped(ErrorKind::Transport)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod cork {
            use std::os::unix::io::RawFd;
            use crate::error::Result;
            use super::setsockopt_i32;

            pub fn set(fd: RawFd, on: bool) -> Result<()> {
                unsafe { setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_CORK, on as i32) }
            }
        }

        mod sendfile {
            use std::os::unix::io::RawFd;
            use crate::error::{ErrorKind, Result, ResultWrappedExt};

            pub fn send(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, len: usize) -> Result<usize> {
                let rc = unsafe { libc::sendfile(out_fd, in_fd, offset as *mut i64, len) };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        return Ok(0);
                    }
                    return Err(err).wrapped(ErrorKind::Transport);
                }
                Ok(rc as usize)
            }
        }
    } else {
        mod cork {
            use std::os::unix::io::RawFd;
            use crate::error::Result;

            pub fn set(_fd: RawFd, _on: bool) -> Result<()> {
                Ok(())
            }
        }

        mod sendfile {
            use std::io::{Read, Seek, SeekFrom};
            use std::os::unix::io::{FromRawFd, RawFd};
            use crate::error::{ErrorKind, Result, ResultWrappedExt};

            /// Buffered fallback for platforms without `sendfile`
            /// (§9: "a buffered fallback is acceptable only on
            /// platforms without `sendfile`"): reads `len` bytes from
            /// `in_fd` at `offset` through a regular buffer and writes
            /// them straight out to `out_fd`, advancing `offset` the
            /// same way the real syscall would.
            pub fn send(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, len: usize) -> Result<usize> {
                // Safety: `in_fd` is owned by the caller's `FileRegion`
                // for the duration of this call; `forget` below hands
                // it back without closing it.
                let mut src = unsafe { std::fs::File::from_raw_fd(in_fd) };
                let result = (|| -> Result<usize> {
                    src.seek(SeekFrom::Start(*offset as u64)).wrapped(ErrorKind::Transport)?;
                    let mut buf = vec![0u8; len.min(64 * 1024)];
                    let mut total = 0usize;
                    let mut remaining = len;
                    while remaining > 0 {
                        let want = remaining.min(buf.len());
                        let n = src.read(&mut buf[..want]).wrapped(ErrorKind::Transport)?;
                        if n == 0 {
                            break;
                        }
                        write_all_raw(out_fd, &buf[..n])?;
                        total += n;
                        remaining -= n;
                    }
                    Ok(total)
                })();
                std::mem::forget(src);
                let total = result?;
                *offset += total as i64;
                Ok(total)
            }

            fn write_all_raw(fd: RawFd, mut buf: &[u8]) -> Result<()> {
                while !buf.is_empty() {
                    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                    if rc < 0 {
                        return Err(std::io::Error::last_os_error()).wrapped(ErrorKind::Transport);
                    }
                    buf = &buf[rc as usize..];
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_accepts_a_connection_and_applies_options() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_fut = listener.accept();
        let connect_fut = Socket::connect(addr);
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let (socket, _) = accepted.unwrap();
        let socket2 = connected.unwrap();

        let keepalive = KeepaliveConfig {
            count: 3,
            idle: 30,
            interval: 5,
        };
        socket.apply_options(keepalive, PeerRole::Server, 0).unwrap();
        socket2.apply_options(keepalive, PeerRole::Client, 0).unwrap();
    }

    #[test]
    fn duplex_pair_allows_writing_on_one_end_and_reading_on_the_other() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut a, mut b) = duplex_pair().unwrap();
            a.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
        });
    }
}
