//! Aides socket bas niveau : multicast, horodatage noyau, FIONREAD.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Ouvre un socket UDP d'émission vers `dest` (multicast ou unicast),
/// non bloquant, prêt pour tokio.
pub fn connect_udp(dest: SocketAddr, multicast_ttl: u32) -> io::Result<UdpSocket> {
    let domain = if dest.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if dest.is_ipv4() && dest.ip().is_multicast() {
        socket.set_multicast_ttl_v4(multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
    }
    socket.connect(&dest.into())?;
    UdpSocket::from_std(StdUdpSocket::from(socket))
}

/// Ouvre un socket UDP de réception sur `addr` ; si l'adresse est
/// multicast, rejoint le groupe sur toutes les interfaces.
pub fn bind_udp_recv(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_multicast() => {
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, v4.port())).into())?;
            socket.join_multicast_v4(v4.ip(), &Ipv4Addr::UNSPECIFIED)?;
        }
        other => socket.bind(&other.into())?,
    }
    enable_rx_timestamps(socket.as_raw_fd())?;
    UdpSocket::from_std(StdUdpSocket::from(socket))
}

/// Active l'horodatage noyau (`SO_TIMESTAMP`) des datagrammes reçus.
pub fn enable_rx_timestamps(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMP,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Octets disponibles en lecture (`FIONREAD`).
pub fn pending_bytes(fd: RawFd) -> io::Result<usize> {
    let mut size: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut size) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size.max(0) as usize)
}

/// Lit un datagramme avec son horodatage noyau (`SCM_TIMESTAMP`).
///
/// À appeler sur un descripteur prêt en lecture. Un datagramme de
/// taille nulle (ou un paquet à CRC invalide) est tout de même
/// consommé : le noyau force la lecture d'au moins un octet.
pub fn recv_with_timestamp(
    fd: RawFd,
    buf: &mut Vec<u8>,
) -> io::Result<(usize, Option<SystemTime>)> {
    let pending = pending_bytes(fd)?.max(1);
    if buf.len() < pending {
        buf.resize(pending, 0);
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: pending,
    };
    let mut cmsg_space = [0u8; 1024];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut stamp = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_TIMESTAMP
            {
                let tv: libc::timeval = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                stamp = Some(
                    UNIX_EPOCH
                        + Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000),
                );
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((n as usize, stamp))
}

/// Première adresse IPv4 non-loopback de la machine.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    for iface in get_if_addrs::get_if_addrs().ok()? {
        if iface.is_loopback() {
            continue;
        }
        if let get_if_addrs::IfAddr::V4(v4) = iface.addr {
            return Some(v4.ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timestamped_receive() {
        let rx = bind_udp_recv("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = rx.local_addr().unwrap();
        let tx = connect_udp(addr, 1).unwrap();
        tx.send(b"ping").await.unwrap();

        rx.readable().await.unwrap();
        let mut buf = Vec::new();
        let (n, stamp) = recv_with_timestamp(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        // SO_TIMESTAMP est activé par bind_udp_recv.
        assert!(stamp.is_some());
    }

    #[tokio::test]
    async fn pending_bytes_reports_queue() {
        let rx = bind_udp_recv("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = rx.local_addr().unwrap();
        let tx = connect_udp(addr, 1).unwrap();
        tx.send(&[0u8; 100]).await.unwrap();
        rx.readable().await.unwrap();
        assert_eq!(pending_bytes(rx.as_raw_fd()).unwrap(), 100);
    }
}
