//! Cooperative input/output.
//!
//! Every function here looks like its POSIX counterpart with a trailing
//! `timeout` (`None` = wait forever) and blocks only the calling fiber. The
//! pattern is uniform: issue the syscall in non-blocking mode, restarting on
//! `EINTR`; on success or a real error return right away; on would-block,
//! register a readiness watch (plus a timeout when one was given), suspend,
//! and retry once the reactor wakes the fiber back up.
//!
//! A timeout expiring is reported as an [`io::Error`] with raw OS error
//! `EINTR`, the same shape as a signal interrupting the call. There is no
//! other cancellation channel; close the fd or use timeouts.
//!
//! File descriptors must be non-blocking for any of this to work, which is
//! why [`pipe2`], [`socket`] and [`accept4`] force the flag on every fd they
//! hand out.

use std::cell::Cell;
use std::convert::TryFrom;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::error::{self, Error, Result};
use crate::log::fatal;
use crate::poller::{IoCondition, IoWatch};
use crate::runtime;
use crate::sched::FiberRef;
use crate::thread_pool::Work;
use crate::timer::Timeout;

////////////////////////////////////////////////////////////////////////////////
// Readiness waiting
////////////////////////////////////////////////////////////////////////////////

/// Caller-frame context for one readiness wait. The runtime borrows it for
/// the duration of the suspension and never dereferences it afterwards.
struct FdWait {
    watch: Cell<Option<IoWatch>>,
    timeout: Cell<Option<Timeout>>,
    fiber: FiberRef,
    ok: Cell<bool>,
}

/// Suspends the current fiber until `fd` reports `condition`, the timeout
/// expires (`Err(EINTR)`), or an error/hangup is flagged on the fd (treated
/// as readiness: the retried syscall surfaces the real error).
fn wait_for_fd(fd: RawFd, condition: IoCondition, timeout: Option<Duration>) -> io::Result<()> {
    let rt = runtime::current();
    let wait = FdWait {
        watch: Cell::new(None),
        timeout: Cell::new(None),
        fiber: rt.sched.current(),
        ok: Cell::new(false),
    };
    let token = &wait as *const FdWait as *mut ();
    wait.watch
        .set(Some(rt.poller.set_watch(fd, condition, token, on_fd_ready)));
    if let Some(timeout) = timeout {
        wait.timeout.set(Some(rt.timer.set(
            timeout.as_millis() as i64,
            token,
            on_fd_wait_timeout,
        )));
    }
    rt.sched.suspend_current();
    if wait.ok.get() {
        Ok(())
    } else {
        Err(error::timed_out())
    }
}

unsafe fn on_fd_ready(token: *mut ()) {
    let wait = &*(token as *const FdWait);
    let rt = runtime::current();
    rt.poller.clear_watch(wait.watch.take().unwrap());
    if let Some(timeout) = wait.timeout.take() {
        rt.timer.clear(timeout);
    }
    wait.ok.set(true);
    rt.sched.resume(wait.fiber);
}

unsafe fn on_fd_wait_timeout(token: *mut ()) {
    let wait = &*(token as *const FdWait);
    let rt = runtime::current();
    rt.poller.clear_watch(wait.watch.take().unwrap());
    wait.ok.set(false);
    rt.sched.resume(wait.fiber);
}

/// Runs one nonblocking syscall attempt, restarting on `EINTR`, suspending
/// on would-block, passing everything else through.
fn retry_loop<T, F>(
    fd: RawFd,
    condition: IoCondition,
    timeout: Option<Duration>,
    mut attempt: F,
) -> io::Result<T>
where
    F: FnMut() -> libc::ssize_t,
    T: TryFrom<libc::ssize_t>,
{
    loop {
        let n = attempt();
        if n >= 0 {
            return Ok(T::try_from(n).ok().expect("non-negative result fits"));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        wait_for_fd(fd, condition, timeout)?;
    }
}

////////////////////////////////////////////////////////////////////////////////
// Plain descriptors
////////////////////////////////////////////////////////////////////////////////

/// `pipe2(2)`. Both ends are forced non-blocking.
pub fn pipe2(flags: libc::c_int) -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// `read(2)` blocking only the calling fiber. `Ok(0)` is end of file.
pub fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// `write(2)` blocking only the calling fiber.
pub fn write(fd: RawFd, data: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Writable, timeout, || unsafe {
        libc::write(fd, data.as_ptr() as *const libc::c_void, data.len())
    })
}

/// `readv(2)` blocking only the calling fiber.
pub fn readv(
    fd: RawFd,
    bufs: &mut [io::IoSliceMut<'_>],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::readv(
            fd,
            bufs.as_mut_ptr() as *mut libc::iovec,
            bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
        )
    })
}

/// `writev(2)` blocking only the calling fiber.
pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>], timeout: Option<Duration>) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Writable, timeout, || unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
        )
    })
}

/// Clears every watch registered on `fd`, then `close(2)`s it.
///
/// Always go through here for fds that have passed through this module, or
/// a pending kernel registration would outlive the descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    runtime::current().poller.clear_watches(fd);
    loop {
        if unsafe { libc::close(fd) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sockets
////////////////////////////////////////////////////////////////////////////////

/// `socket(2)` with `SOCK_NONBLOCK` forced.
pub fn socket(
    domain: libc::c_int,
    r#type: libc::c_int,
    protocol: libc::c_int,
) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, r#type | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// `accept4(2)` blocking only the calling fiber; the accepted fd comes back
/// non-blocking regardless of `flags`.
pub fn accept4(
    fd: RawFd,
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let sub: libc::ssize_t = retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            flags | libc::SOCK_NONBLOCK,
        ) as libc::ssize_t
    })?;
    Ok((sub as RawFd, sockaddr_to_addr(&storage, len as usize)))
}

/// `connect(2)` blocking only the calling fiber. An in-progress connect
/// waits for writability and reports the socket's `SO_ERROR`.
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let (storage, len) = addr_to_sockaddr(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINTR) | Some(libc::EINPROGRESS) => {}
        _ => return Err(err),
    }
    wait_for_fd(fd, IoCondition::Writable, timeout)?;

    let mut so_error: libc::c_int = 0;
    let mut size = mem::size_of::<libc::c_int>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut size,
        )
    } < 0
    {
        fatal!("`getsockopt()` failed: {}", io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// `recv(2)` blocking only the calling fiber.
pub fn recv(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// `send(2)` blocking only the calling fiber.
pub fn send(
    fd: RawFd,
    data: &[u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Writable, timeout, || unsafe {
        libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), flags)
    })
}

/// `recvfrom(2)` blocking only the calling fiber.
pub fn recv_from(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    Ok((n, sockaddr_to_addr(&storage, len as usize)))
}

/// `sendto(2)` blocking only the calling fiber.
pub fn send_to(
    fd: RawFd,
    data: &[u8],
    flags: libc::c_int,
    addr: &SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let (storage, len) = addr_to_sockaddr(addr);
    retry_loop(fd, IoCondition::Writable, timeout, || unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            flags,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    })
}

/// `recvmsg(2)` blocking only the calling fiber.
///
/// # Safety
///
/// `message` must point to a `msghdr` that is valid, with valid buffers,
/// for the whole call, exactly as `recvmsg(2)` requires.
pub unsafe fn recvmsg(
    fd: RawFd,
    message: *mut libc::msghdr,
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Readable, timeout, || unsafe {
        libc::recvmsg(fd, message, flags)
    })
}

/// `sendmsg(2)` blocking only the calling fiber.
///
/// # Safety
///
/// As for [`recvmsg`].
pub unsafe fn sendmsg(
    fd: RawFd,
    message: *const libc::msghdr,
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_loop(fd, IoCondition::Writable, timeout, || unsafe {
        libc::sendmsg(fd, message, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Name resolution (worker pool)
////////////////////////////////////////////////////////////////////////////////

/// Runs `function(argument)` on a worker thread and suspends the calling
/// fiber until the completion arrives back over the self-pipe.
fn offload(function: unsafe fn(*mut ()), argument: *mut ()) {
    let rt = runtime::current();
    let fiber = rt.sched.current();
    let mut work = Work {
        function,
        argument,
        token: fiber.as_ptr() as *mut (),
        callback: on_work_done,
    };
    unsafe { rt.pool.post(&mut work) };
    rt.sched.suspend_current();
}

unsafe fn on_work_done(token: *mut ()) {
    let fiber = FiberRef::new_unchecked(token as *mut _);
    runtime::current().sched.resume(fiber);
}

/// Resolved address list owned by the runtime; frees itself with
/// `freeaddrinfo(3)`.
pub struct AddrInfo {
    head: *mut libc::addrinfo,
}

impl AddrInfo {
    /// Socket addresses in resolver preference order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        let mut node = self.head;
        while !node.is_null() {
            let info = unsafe { &*node };
            if !info.ai_addr.is_null() {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let len = (info.ai_addrlen as usize)
                    .min(mem::size_of::<libc::sockaddr_storage>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        info.ai_addr as *const u8,
                        &mut storage as *mut libc::sockaddr_storage as *mut u8,
                        len,
                    );
                }
                if let Some(addr) = sockaddr_to_addr(&storage, len) {
                    addrs.push(addr);
                }
            }
            node = info.ai_next;
        }
        addrs
    }

    /// The raw list, for callers that need `ai_socktype` and friends.
    pub fn as_ptr(&self) -> *const libc::addrinfo {
        self.head
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        if !self.head.is_null() {
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

struct GaiCall {
    host: Option<std::ffi::CString>,
    service: Option<std::ffi::CString>,
    hints: Option<libc::addrinfo>,
    result: *mut libc::addrinfo,
    code: libc::c_int,
    sys_errno: libc::c_int,
}

unsafe fn gai_call_run(argument: *mut ()) {
    // Worker thread: nothing here may touch the runtime.
    let call = &mut *(argument as *mut GaiCall);
    call.code = libc::getaddrinfo(
        call.host.as_ref().map_or(std::ptr::null(), |h| h.as_ptr()),
        call.service.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
        call.hints
            .as_ref()
            .map_or(std::ptr::null(), |h| h as *const libc::addrinfo),
        &mut call.result,
    );
    call.sys_errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
}

/// Fiber-friendly `getaddrinfo(3)`, dispatched through the worker pool
/// because no standard non-blocking variant exists.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn getaddrinfo(
    host: Option<&str>,
    service: Option<&str>,
    hints: Option<&libc::addrinfo>,
) -> Result<AddrInfo> {
    let to_cstring = |s: &str| {
        std::ffi::CString::new(s)
            .map_err(|_| Error::InvalidArgument("interior NUL in name"))
    };
    let mut call = GaiCall {
        host: host.map(to_cstring).transpose()?,
        service: service.map(to_cstring).transpose()?,
        hints: hints.copied(),
        result: std::ptr::null_mut(),
        code: 0,
        sys_errno: 0,
    };
    offload(gai_call_run, &mut call as *mut GaiCall as *mut ());
    gai_result(call.code, call.sys_errno)?;
    Ok(AddrInfo { head: call.result })
}

// `libc` does not expose `NI_MAXSERV` for the glibc target; 32 is the
// standard POSIX `netdb.h` value also used on every other target.
const NI_MAXSERV: usize = 32;

struct GniCall {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
    host: [libc::c_char; libc::NI_MAXHOST as usize],
    service: [libc::c_char; NI_MAXSERV],
    flags: libc::c_int,
    code: libc::c_int,
    sys_errno: libc::c_int,
}

unsafe fn gni_call_run(argument: *mut ()) {
    let call = &mut *(argument as *mut GniCall);
    call.code = libc::getnameinfo(
        &call.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        call.len,
        call.host.as_mut_ptr(),
        call.host.len() as libc::socklen_t,
        call.service.as_mut_ptr(),
        call.service.len() as libc::socklen_t,
        call.flags,
    );
    call.sys_errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
}

/// Fiber-friendly `getnameinfo(3)`; returns `(host, service)`.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn getnameinfo(addr: &SocketAddr, flags: libc::c_int) -> Result<(String, String)> {
    let (storage, len) = addr_to_sockaddr(addr);
    let mut call = GniCall {
        storage,
        len,
        host: [0; libc::NI_MAXHOST as usize],
        service: [0; NI_MAXSERV],
        flags,
        code: 0,
        sys_errno: 0,
    };
    offload(gni_call_run, &mut call as *mut GniCall as *mut ());
    gai_result(call.code, call.sys_errno)?;
    let take = |buf: &[libc::c_char]| {
        let bytes: Vec<u8> = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };
    Ok((take(&call.host), take(&call.service)))
}

fn gai_result(code: libc::c_int, sys_errno: libc::c_int) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    if code == libc::EAI_SYSTEM {
        return Err(io::Error::from_raw_os_error(sys_errno).into());
    }
    let message = unsafe {
        std::ffi::CStr::from_ptr(libc::gai_strerror(code))
            .to_string_lossy()
            .into_owned()
    };
    Err(Error::AddrResolve { code, message })
}

////////////////////////////////////////////////////////////////////////////////
// Stream / Listener
////////////////////////////////////////////////////////////////////////////////

/// A connected TCP socket whose reads and writes block only the calling
/// fiber. Closes through [`close`] on drop.
pub struct Stream {
    fd: RawFd,
}

impl Stream {
    /// Opens a TCP connection to `addr`.
    pub fn connect(addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<Stream> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = socket(domain, libc::SOCK_STREAM, 0)?;
        let stream = Stream { fd };
        connect(fd, addr, timeout)?;
        Ok(stream)
    }

    /// Wraps an fd already set up for non-blocking use.
    pub fn from_raw_fd(fd: RawFd) -> Stream {
        Stream { fd }
    }

    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        read(self.fd, buf, timeout)
    }

    pub fn write_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        write(self.fd, data, timeout)
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl io::Write for Stream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(data, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = close(self.fd) {
            log::error!("`close()` failed: {}", err);
        }
    }
}

/// A listening TCP socket whose `accept` blocks only the calling fiber.
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Binds (with `SO_REUSEADDR`) and listens on `addr`.
    pub fn bind(addr: &SocketAddr) -> io::Result<Listener> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = socket(domain, libc::SOCK_STREAM, 0)?;
        let listener = Listener { fd };

        let one: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        let (storage, len) = addr_to_sockaddr(addr);
        if unsafe {
            libc::bind(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, 128) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(listener)
    }

    /// Accepts one connection.
    pub fn accept(&self, timeout: Option<Duration>) -> io::Result<(Stream, Option<SocketAddr>)> {
        let (fd, addr) = accept4(self.fd, 0, timeout)?;
        Ok((Stream { fd }, addr))
    }

    /// The locally bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_addr(&storage, len as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(err) = close(self.fd) {
            log::error!("`close()` failed: {}", err);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// sockaddr conversion
////////////////////////////////////////////////////////////////////////////////

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        assert_eq!(sockaddr_to_addr(&storage, len as usize), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        assert_eq!(sockaddr_to_addr(&storage, len as usize), Some(addr));
    }
}
