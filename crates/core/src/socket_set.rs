use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use ahash::AHashMap;
use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::TransportAddressSet;
use crate::error::CoreError;
use crate::role::Role;

/// How the server's sockets are framed on the wire. TCP gets a simplified
/// single-connection-at-a-time treatment per loop (see module docs on
/// [`crate::dispatch`]); the core never multiplexes many live TCP
/// connections itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

enum RoleSocket {
    Udp(Socket),
    Tcp(TcpListener),
}

/// Owns every bound socket, keyed by role. Receive-side ancillary-data
/// recovery of the local destination address lives here because it is
/// inherently socket-option/`recvmsg` plumbing, not dispatch logic.
pub struct SocketSet {
    sockets: AHashMap<Role, RoleSocket>,
    transport: Transport,
}

impl SocketSet {
    /// Binds one socket per valid TSA role. `reuse_addr` enables
    /// `SO_REUSEADDR` before bind. UDP sockets additionally request
    /// `IP_PKTINFO`/`IPV6_RECVPKTINFO` so `recv` can recover the local
    /// destination address; if the kernel refuses that option the whole
    /// socket set fails to come up (per the "hard platform requirement" in
    /// the design notes — a server that can't distinguish PP from PA must
    /// refuse to start rather than silently mis-route replies).
    pub fn bind(tsa: &TransportAddressSet, transport: Transport, reuse_addr: bool) -> Result<Self, CoreError> {
        let mut sockets = AHashMap::default();

        for role in tsa.valid_roles() {
            let endpoint = tsa.lookup(role);
            let role_socket = match transport {
                Transport::Udp => RoleSocket::Udp(bind_udp(endpoint.bind_addr, reuse_addr, role)?),
                Transport::Tcp => RoleSocket::Tcp(bind_tcp(endpoint.bind_addr, reuse_addr, role)?),
            };
            sockets.insert(role, role_socket);
        }

        Ok(Self { sockets, transport })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn raw_fd(&self, role: Role) -> Option<RawFd> {
        self.sockets.get(&role).map(|s| match s {
            RoleSocket::Udp(sock) => sock.as_raw_fd(),
            RoleSocket::Tcp(listener) => listener.as_raw_fd(),
        })
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.sockets.keys().copied()
    }

    /// Receives one datagram, recovering both the remote source and the
    /// local destination address. Fails with `WouldBlock` under the same
    /// conditions a raw `recvfrom` would.
    pub fn recv_udp(&self, role: Role, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, IpAddr)> {
        let RoleSocket::Udp(sock) = self
            .sockets
            .get(&role)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no socket for role"))?
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "role socket is not UDP"));
        };

        recvmsg_with_local(sock.as_raw_fd(), buf)
    }

    pub fn send_udp(&self, role: Role, dest: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        let RoleSocket::Udp(sock) = self
            .sockets
            .get(&role)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no socket for role"))?
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "role socket is not UDP"));
        };

        sock.send_to(bytes, &dest.into())
    }

    pub fn accept_tcp(&self, role: Role) -> io::Result<(TcpStream, SocketAddr)> {
        let RoleSocket::Tcp(listener) = self
            .sockets
            .get(&role)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no socket for role"))?
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "role socket is not TCP"));
        };

        listener.accept()
    }
}

fn bind_udp(addr: SocketAddr, reuse_addr: bool, role: Role) -> Result<Socket, CoreError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| CoreError::BindFailed(role, e))?;

    if reuse_addr {
        sock.set_reuse_address(true).map_err(|e| CoreError::BindFailed(role, e))?;
    }

    sock.set_nonblocking(true).map_err(|e| CoreError::BindFailed(role, e))?;
    sock.bind(&addr.into()).map_err(|e| CoreError::BindFailed(role, e))?;

    enable_pktinfo(sock.as_raw_fd(), addr.is_ipv4())
        .map_err(|e| CoreError::RecvCapabilityMissing(e.to_string()))?;

    Ok(sock)
}

fn bind_tcp(addr: SocketAddr, reuse_addr: bool, role: Role) -> Result<TcpListener, CoreError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| CoreError::BindFailed(role, e))?;

    if reuse_addr {
        sock.set_reuse_address(true).map_err(|e| CoreError::BindFailed(role, e))?;
    }

    sock.bind(&addr.into()).map_err(|e| CoreError::BindFailed(role, e))?;
    sock.listen(128).map_err(|e| CoreError::BindFailed(role, e))?;
    sock.set_nonblocking(true).map_err(|e| CoreError::BindFailed(role, e))?;

    Ok(sock.into())
}

#[cfg(target_os = "linux")]
fn enable_pktinfo(fd: RawFd, is_v4: bool) -> io::Result<()> {
    let one: libc::c_int = 1;
    let (level, name) = if is_v4 {
        (libc::IPPROTO_IP, libc::IP_PKTINFO)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_fd: RawFd, _is_v4: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local-address ancillary recovery is only implemented for Linux",
    ))
}

/// `recvmsg(2)` plus a walk of the ancillary-data chain for `IP_PKTINFO` /
/// `IPV6_PKTINFO`, recovering the local destination address the kernel
/// delivered the datagram to. This is how the server tells PP and PA apart
/// when they share an IP: the remote peer's socket alone can't.
#[cfg(target_os = "linux")]
fn recvmsg_with_local(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, IpAddr)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut name = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut control = [0u8; 256];

    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as u32;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let remote = sockaddr_to_std(unsafe { name.assume_init() }, hdr.msg_namelen)?;
    let local = local_from_cmsg(&hdr).ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no IP_PKTINFO/IPV6_PKTINFO ancillary data present")
    })?;

    Ok((n as usize, remote, local))
}

#[cfg(not(target_os = "linux"))]
fn recvmsg_with_local(_fd: RawFd, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr, IpAddr)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local-address ancillary recovery is only implemented for Linux",
    ))
}

#[cfg(target_os = "linux")]
fn local_from_cmsg(hdr: &libc::msghdr) -> Option<IpAddr> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };

    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };

        if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_PKTINFO {
            let info: libc::in_pktinfo =
                unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
            return Some(IpAddr::V4(Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes())));
        }

        if c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_PKTINFO {
            let info: libc::in6_pktinfo =
                unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
            return Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(hdr as *const _ as *mut _, cmsg) };
    }

    None
}

#[cfg(target_os = "linux")]
fn sockaddr_to_std(storage: libc::sockaddr_storage, len: u32) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(&storage) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        libc::AF_INET6 if len as usize >= size_of::<libc::sockaddr_in6>() => {
            let addr: libc::sockaddr_in6 = unsafe { std::mem::transmute_copy(&storage) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::new(IpAddr::V6(ip), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported sockaddr family {family}"),
        )),
    }
}
