//! Routing-socket codec for the Darwin routing information base.
//!
//! The kernel exposes its routing table through two mechanisms: a sysctl
//! dump of the RIB (read side) and a `PF_ROUTE` raw socket accepting
//! version-5 route messages (write side). Both speak the same wire format:
//! a fixed message header followed by a vector of socket addresses, one per
//! populated address slot.
//!
//! Everything in this module except [`DarwinKernel`] is pure byte
//! translation and compiles on every platform; the syscall layer is gated
//! to macOS. Kernel access is abstracted behind [`RouteKernel`] so the
//! reconciler can be driven against an in-memory table in tests.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{Error, Result};

/// Routing message version produced and accepted by this codec.
pub const RTM_VERSION: u8 = 5;

/// Message type: add a route.
pub const RTM_ADD: u8 = 0x1;
/// Message type: delete a route.
pub const RTM_DELETE: u8 = 0x2;

const RTM_NEWADDR: u8 = 0xc;
const RTM_IFINFO: u8 = 0xe;

/// Route is usable.
pub const RTF_UP: i32 = 0x1;
/// Destination is reached through a gateway.
pub const RTF_GATEWAY: i32 = 0x2;
/// Destination is a single host (no netmask).
pub const RTF_HOST: i32 = 0x4;
/// Route was generated dynamically by cloning.
pub const RTF_WASCLONED: i32 = 0x20000;
/// Route represents a local address.
pub const RTF_LOCAL: i32 = 0x200000;

const RTF_STATIC: i32 = 0x800;
const RTF_CLONING: i32 = 0x100;

/// Destination address slot.
pub const RTAX_DST: usize = 0;
/// Gateway address slot.
pub const RTAX_GATEWAY: usize = 1;
/// Netmask address slot.
pub const RTAX_NETMASK: usize = 2;
/// Interface address slot.
pub const RTAX_IFA: usize = 5;
/// Number of address slots in a routing message.
pub const RTAX_MAX: usize = 8;

const AF_INET: u8 = 2;
const AF_LINK: u8 = 18;

// Fixed header sizes from the Darwin ABI.
const RT_MSGHDR_LEN: usize = 92;
const IF_MSGHDR_LEN: usize = 112;
const IFA_MSGHDR_LEN: usize = 20;

/// Renders the consulted flag bits for debug logging, e.g. `UP|HOST`.
pub fn flag_names(flags: i32) -> String {
    const NAMES: &[(i32, &str)] = &[
        (RTF_UP, "UP"),
        (RTF_GATEWAY, "GATEWAY"),
        (RTF_HOST, "HOST"),
        (RTF_CLONING, "CLONING"),
        (RTF_STATIC, "STATIC"),
        (RTF_WASCLONED, "WASCLONED"),
        (RTF_LOCAL, "LOCAL"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(mask, _)| flags & mask != 0)
        .map(|(_, name)| *name)
        .collect();
    names.join("|")
}

/// One socket address as it appears in a routing message slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// An IPv4 address (`sockaddr_in`).
    Inet4(Ipv4Addr),
    /// A link-level address (`sockaddr_dl`): interface index plus the
    /// interface name and hardware address when the kernel supplies them.
    Link {
        /// Kernel interface index.
        index: u16,
        /// Interface name, possibly empty.
        name: String,
        /// Hardware address bytes, possibly empty.
        addr: Vec<u8>,
    },
    /// Any other family, kept verbatim so a message copied from the kernel
    /// re-serializes faithfully.
    Other {
        /// The `sa_family` byte.
        family: u8,
        /// The raw sockaddr bytes including length and family.
        bytes: Vec<u8>,
    },
}

// Sockaddrs are aligned to 4 bytes in routing messages; a zero length
// still consumes one alignment unit.
fn sa_space(sa_len: u8) -> usize {
    if sa_len == 0 {
        4
    } else {
        (sa_len as usize + 3) & !3
    }
}

fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([b[off], b[off + 1]])
}

fn read_i32(b: &[u8], off: usize) -> i32 {
    i32::from_ne_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn decode_sockaddr(slot: usize, b: &[u8]) -> Addr {
    let sa_len = b[0] as usize;
    let family = if b.len() > 1 { b[1] } else { 0 };

    if family == AF_LINK && b.len() >= 8 {
        let index = read_u16(b, 2);
        let nlen = b[5] as usize;
        let alen = b[6] as usize;
        let name_end = (8 + nlen).min(b.len());
        let name = String::from_utf8_lossy(&b[8..name_end]).into_owned();
        let addr_end = (name_end + alen).min(b.len());
        let addr = b[name_end..addr_end].to_vec();
        return Addr::Link { index, name, addr };
    }

    // Netmask sockaddrs in RIB dumps are truncated to their significant
    // bytes and carry no reliable family; missing octets are zero.
    if family == AF_INET || slot == RTAX_NETMASK {
        let mut octets = [0u8; 4];
        let limit = sa_len.min(b.len()).min(8);
        for (i, octet) in octets.iter_mut().enumerate() {
            if 4 + i < limit {
                *octet = b[4 + i];
            }
        }
        return Addr::Inet4(Ipv4Addr::from(octets));
    }

    Addr::Other {
        family,
        bytes: b.to_vec(),
    }
}

fn encode_sockaddr(addr: &Addr, out: &mut Vec<u8>) {
    match addr {
        Addr::Inet4(ip) => {
            out.push(16);
            out.push(AF_INET);
            out.extend_from_slice(&[0, 0]); // sin_port
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&[0; 8]); // sin_zero
        }
        Addr::Link { index, name, addr } => {
            let sa_len = 8 + name.len() + addr.len();
            let space = sa_space(sa_len as u8);
            out.push(sa_len as u8);
            out.push(AF_LINK);
            out.extend_from_slice(&index.to_ne_bytes());
            out.push(0); // sdl_type
            out.push(name.len() as u8);
            out.push(addr.len() as u8);
            out.push(0); // sdl_slen
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(addr);
            out.resize(out.len() + space - sa_len, 0);
        }
        Addr::Other { bytes, .. } => {
            out.extend_from_slice(bytes);
            let rem = bytes.len() % 4;
            if rem != 0 {
                out.resize(out.len() + 4 - rem, 0);
            }
        }
    }
}

fn parse_addrs(mut b: &[u8], mask: i32) -> [Option<Addr>; RTAX_MAX] {
    let mut addrs: [Option<Addr>; RTAX_MAX] = Default::default();
    for (slot, entry) in addrs.iter_mut().enumerate() {
        if mask & (1 << slot) == 0 {
            continue;
        }
        if b.is_empty() {
            break;
        }
        let take = sa_space(b[0]).min(b.len());
        *entry = Some(decode_sockaddr(slot, &b[..take]));
        b = &b[take..];
    }
    addrs
}

/// A route message read from or destined for the kernel.
///
/// Kernel-reported messages keep their `errno`; it is logged but never
/// consulted, since the kernel sets an error on routes that are nonetheless
/// live state.
#[derive(Debug, Clone)]
pub struct RouteMessage {
    /// Message version; always [`RTM_VERSION`] for messages we produce.
    pub version: u8,
    /// Message type ([`RTM_ADD`], [`RTM_DELETE`], or a kernel report type).
    pub msg_type: u8,
    /// Interface index the route is attached to.
    pub index: u16,
    /// RTF_* flag bits.
    pub flags: i32,
    /// Originating process id.
    pub pid: i32,
    /// Sequence number, assigned per reconciliation cycle.
    pub seq: i32,
    /// Kernel-reported error code, if any.
    pub errno: i32,
    /// Address vector indexed by RTAX slot.
    pub addrs: [Option<Addr>; RTAX_MAX],
}

impl RouteMessage {
    /// Serializes the message into routing-socket wire form.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut rta_mask: i32 = 0;
        for (slot, addr) in self.addrs.iter().enumerate() {
            if let Some(addr) = addr {
                rta_mask |= 1 << slot;
                encode_sockaddr(addr, &mut body);
            }
        }

        let mut buf = vec![0u8; RT_MSGHDR_LEN];
        let msglen = (RT_MSGHDR_LEN + body.len()) as u16;
        buf[0..2].copy_from_slice(&msglen.to_ne_bytes());
        buf[2] = self.version;
        buf[3] = self.msg_type;
        buf[4..6].copy_from_slice(&self.index.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        buf[12..16].copy_from_slice(&rta_mask.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.pid.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.seq.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.errno.to_ne_bytes());
        buf.extend_from_slice(&body);
        buf
    }
}

fn parse_route_message(b: &[u8]) -> RouteMessage {
    let mask = read_i32(b, 12);
    RouteMessage {
        version: b[2],
        msg_type: b[3],
        index: read_u16(b, 4),
        flags: read_i32(b, 8),
        pid: read_i32(b, 16),
        seq: read_i32(b, 20),
        errno: read_i32(b, 24),
        addrs: parse_addrs(&b[RT_MSGHDR_LEN..], mask),
    }
}

/// Parses a route RIB dump into route messages.
///
/// Messages with an unknown version are skipped; a header that runs past
/// the buffer is an error.
pub fn parse_route_rib(buf: &[u8]) -> Result<Vec<RouteMessage>> {
    let mut msgs = Vec::new();
    let mut rest = buf;
    while rest.len() >= 4 {
        let msglen = read_u16(rest, 0) as usize;
        if msglen < 4 || msglen > rest.len() {
            return Err(Error::Rib(format!(
                "truncated routing message: length {msglen} with {} bytes remaining",
                rest.len()
            )));
        }
        let (msg, tail) = rest.split_at(msglen);
        rest = tail;
        if msg[2] != RTM_VERSION || msg.len() < RT_MSGHDR_LEN {
            continue;
        }
        msgs.push(parse_route_message(msg));
    }
    Ok(msgs)
}

/// A link description from the interface RIB.
#[derive(Debug, Clone)]
pub struct InterfaceMessage {
    /// Kernel interface index.
    pub index: u16,
    /// Interface name from the link-level address.
    pub name: String,
    /// Interface flag bits.
    pub flags: i32,
}

/// An address bound to an interface, from the interface RIB.
#[derive(Debug, Clone)]
pub struct InterfaceAddrMessage {
    /// Index of the owning interface.
    pub index: u16,
    /// Address vector indexed by RTAX slot.
    pub addrs: [Option<Addr>; RTAX_MAX],
}

/// One entry of the interface RIB.
#[derive(Debug, Clone)]
pub enum RibMessage {
    /// An interface (link) entry.
    Interface(InterfaceMessage),
    /// An interface-address entry.
    InterfaceAddr(InterfaceAddrMessage),
}

/// Parses an interface RIB dump into interface and interface-address
/// messages. Entries of other types are skipped.
pub fn parse_interface_rib(buf: &[u8]) -> Result<Vec<RibMessage>> {
    let mut msgs = Vec::new();
    let mut rest = buf;
    while rest.len() >= 4 {
        let msglen = read_u16(rest, 0) as usize;
        if msglen < 4 || msglen > rest.len() {
            return Err(Error::Rib(format!(
                "truncated interface message: length {msglen} with {} bytes remaining",
                rest.len()
            )));
        }
        let (msg, tail) = rest.split_at(msglen);
        rest = tail;
        if msg[2] != RTM_VERSION {
            continue;
        }
        match msg[3] {
            RTM_IFINFO if msg.len() >= IF_MSGHDR_LEN => {
                let mask = read_i32(msg, 4);
                let flags = read_i32(msg, 8);
                let mut index = read_u16(msg, 12);
                let addrs = parse_addrs(&msg[IF_MSGHDR_LEN..], mask);
                let mut name = String::new();
                for addr in addrs.iter().flatten() {
                    if let Addr::Link {
                        index: link_index,
                        name: link_name,
                        ..
                    } = addr
                    {
                        name = link_name.clone();
                        if *link_index != 0 {
                            index = *link_index;
                        }
                        break;
                    }
                }
                msgs.push(RibMessage::Interface(InterfaceMessage { index, name, flags }));
            }
            RTM_NEWADDR if msg.len() >= IFA_MSGHDR_LEN => {
                let mask = read_i32(msg, 4);
                let index = read_u16(msg, 12);
                let addrs = parse_addrs(&msg[IFA_MSGHDR_LEN..], mask);
                msgs.push(RibMessage::InterfaceAddr(InterfaceAddrMessage { index, addrs }));
            }
            _ => {}
        }
    }
    Ok(msgs)
}

/// Gateway of an abstract route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gateway {
    /// No gateway specified.
    None,
    /// Link-level gateway through the interface with this index.
    Link(u16),
    /// IPv4 gateway; set on LOCAL routes only.
    Ip(Ipv4Addr),
}

/// The abstract route the reconciler reasons about.
///
/// An absent `netmask` makes this a host route; an IPv4 gateway makes it a
/// LOCAL route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteItem {
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Gateway, if any.
    pub gateway: Gateway,
    /// Netmask; absent for host routes.
    pub netmask: Option<Ipv4Addr>,
    /// Source address of the attached interface.
    pub ifa: Option<Ipv4Addr>,
}

impl RouteItem {
    /// Flag bits derived from the item's shape.
    pub fn flags(&self) -> i32 {
        let mut flags = RTF_UP;
        if matches!(self.gateway, Gateway::Ip(_)) {
            flags |= RTF_LOCAL;
        }
        if self.netmask.is_none() {
            flags |= RTF_HOST;
        }
        flags
    }

    /// Builds a route message of the given type for this item.
    pub fn to_message(&self, seq: i32, ifce_index: u16, msg_type: u8) -> RouteMessage {
        let mut addrs: [Option<Addr>; RTAX_MAX] = Default::default();
        addrs[RTAX_DST] = Some(Addr::Inet4(self.dst));
        addrs[RTAX_GATEWAY] = match self.gateway {
            Gateway::None => None,
            Gateway::Link(index) => Some(Addr::Link {
                index,
                name: String::new(),
                addr: Vec::new(),
            }),
            Gateway::Ip(ip) => Some(Addr::Inet4(ip)),
        };
        addrs[RTAX_NETMASK] = self.netmask.map(Addr::Inet4);
        addrs[RTAX_IFA] = self.ifa.map(Addr::Inet4);

        RouteMessage {
            version: RTM_VERSION,
            msg_type,
            index: ifce_index,
            flags: self.flags(),
            pid: std::process::id() as i32,
            seq,
            errno: 0,
            addrs,
        }
    }

    /// Whether a kernel route message represents this item.
    ///
    /// Each of the DST, GATEWAY, NETMASK and IFA slots must carry an address
    /// of the matching kind and value when the item's field is present, and
    /// anything but that kind when absent. The message's `errno` is not
    /// consulted.
    pub fn matches(&self, rm: &RouteMessage) -> bool {
        if !match_inet4_slot(Some(self.dst), &rm.addrs[RTAX_DST]) {
            debug!(item = %self, "route message not matched: dst");
            return false;
        }
        let (gateway_link, gateway_ip) = match self.gateway {
            Gateway::None => (None, None),
            Gateway::Link(index) => (Some(index), None),
            Gateway::Ip(ip) => (None, Some(ip)),
        };
        if !match_link_slot(gateway_link, &rm.addrs[RTAX_GATEWAY]) {
            debug!(item = %self, "route message not matched: gateway");
            return false;
        }
        if !match_inet4_slot(gateway_ip, &rm.addrs[RTAX_GATEWAY]) {
            debug!(item = %self, "route message not matched: gateway");
            return false;
        }
        if !match_inet4_slot(self.netmask, &rm.addrs[RTAX_NETMASK]) {
            debug!(item = %self, "route message not matched: netmask");
            return false;
        }
        if !match_inet4_slot(self.ifa, &rm.addrs[RTAX_IFA]) {
            debug!(item = %self, "route message not matched: ifa");
            return false;
        }
        true
    }
}

impl fmt::Display for RouteItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.netmask {
            None => write!(f, "{}", self.dst)?,
            Some(mask) => write!(f, "{}/{}", self.dst, u32::from(mask).count_ones())?,
        }
        write!(f, " via")?;
        match self.gateway {
            Gateway::Link(index) => write!(f, " link#{index}")?,
            Gateway::Ip(ip) => write!(f, " {ip}")?,
            Gateway::None => write!(f, " [empty]")?,
        }
        if let Some(ifa) = self.ifa {
            write!(f, " ({ifa})")?;
        }
        Ok(())
    }
}

fn match_inet4_slot(want: Option<Ipv4Addr>, slot: &Option<Addr>) -> bool {
    match (want, slot) {
        (None, Some(Addr::Inet4(_))) => false,
        (None, _) => true,
        (Some(ip), Some(Addr::Inet4(have))) => ip == *have,
        (Some(_), _) => false,
    }
}

fn match_link_slot(want: Option<u16>, slot: &Option<Addr>) -> bool {
    match (want, slot) {
        (None, Some(Addr::Link { .. })) => false,
        (None, _) => true,
        (Some(index), Some(Addr::Link { index: have, .. })) => index == *have,
        (Some(_), _) => false,
    }
}

/// Read and write access to the kernel routing table.
///
/// The live implementation is [`DarwinKernel`]; tests drive the reconciler
/// against an in-memory fake.
pub trait RouteKernel {
    /// Fetches the interface RIB (links and their addresses).
    fn fetch_interface_rib(&mut self) -> Result<Vec<RibMessage>>;

    /// Fetches route messages for the interface with the given index.
    fn fetch_route_rib(&mut self, ifce_index: u16) -> Result<Vec<RouteMessage>>;

    /// Opens a routing socket for writes. The socket is released when the
    /// returned handle is dropped.
    fn open_route_socket(&mut self) -> Result<Box<dyn RouteSocket>>;
}

/// An open routing socket.
pub trait RouteSocket {
    /// Writes one complete message.
    fn write_message(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

#[cfg(target_os = "macos")]
pub use darwin::DarwinKernel;

#[cfg(target_os = "macos")]
mod darwin {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::{parse_interface_rib, parse_route_rib, RibMessage, RouteKernel, RouteMessage, RouteSocket};
    use crate::error::Result;

    // sysctl RIB query types from <sys/socket.h>.
    const NET_RT_DUMP: libc::c_int = 1;
    const NET_RT_IFLIST: libc::c_int = 3;

    /// Live kernel access through sysctl reads and a `PF_ROUTE` raw socket.
    pub struct DarwinKernel;

    fn fetch_rib(rib_type: libc::c_int) -> Result<Vec<u8>> {
        let mut mib: [libc::c_int; 6] =
            [libc::CTL_NET, libc::AF_ROUTE, 0, libc::AF_INET, rib_type, 0];
        loop {
            let mut len: libc::size_t = 0;
            let rc = unsafe {
                libc::sysctl(
                    mib.as_mut_ptr(),
                    mib.len() as libc::c_uint,
                    std::ptr::null_mut(),
                    &mut len,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }
            if len == 0 {
                return Ok(Vec::new());
            }
            let mut buf = vec![0u8; len];
            let rc = unsafe {
                libc::sysctl(
                    mib.as_mut_ptr(),
                    mib.len() as libc::c_uint,
                    buf.as_mut_ptr().cast(),
                    &mut len,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if rc == 0 {
                buf.truncate(len);
                return Ok(buf);
            }
            let err = io::Error::last_os_error();
            // The table can grow between the size probe and the read.
            if err.raw_os_error() == Some(libc::ENOMEM) {
                continue;
            }
            return Err(err.into());
        }
    }

    impl RouteKernel for DarwinKernel {
        fn fetch_interface_rib(&mut self) -> Result<Vec<RibMessage>> {
            parse_interface_rib(&fetch_rib(NET_RT_IFLIST)?)
        }

        fn fetch_route_rib(&mut self, ifce_index: u16) -> Result<Vec<RouteMessage>> {
            let msgs = parse_route_rib(&fetch_rib(NET_RT_DUMP)?)?;
            Ok(msgs.into_iter().filter(|m| m.index == ifce_index).collect())
        }

        fn open_route_socket(&mut self) -> Result<Box<dyn RouteSocket>> {
            let fd = unsafe { libc::socket(libc::AF_ROUTE, libc::SOCK_RAW, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            Ok(Box::new(DarwinRouteSocket { fd }))
        }
    }

    struct DarwinRouteSocket {
        fd: OwnedFd,
    }

    impl RouteSocket for DarwinRouteSocket {
        fn write_message(&mut self, bytes: &[u8]) -> io::Result<()> {
            let n = unsafe { libc::write(self.fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}
