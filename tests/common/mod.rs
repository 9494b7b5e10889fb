//! Shared test infrastructure: an in-memory route kernel and a loopback
//! DNS server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};

use splitroutesd::error::Result;
use splitroutesd::rib::{
    parse_route_rib, Addr, InterfaceAddrMessage, InterfaceMessage, RibMessage, RouteKernel,
    RouteMessage, RouteSocket, RTAX_DST, RTAX_GATEWAY, RTAX_IFA, RTAX_MAX, RTM_ADD, RTM_DELETE,
};

// --- FakeKernel ---

/// In-memory routing table implementing [`RouteKernel`].
///
/// Written messages travel through their real wire encoding and are decoded
/// back by the codec, so every reconcile test also exercises the serialize →
/// parse round trip. Clones share state, letting a test keep a handle on a
/// kernel owned by a `Driver`.
#[derive(Clone, Default)]
pub struct FakeKernel {
    inner: Arc<Mutex<FakeKernelInner>>,
}

#[derive(Default)]
struct FakeKernelInner {
    interfaces: Vec<RibMessage>,
    routes: HashMap<u16, Vec<RouteMessage>>,
    written: Vec<RouteMessage>,
    fail_seqs: Vec<i32>,
    fail_open: bool,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interface with one bound IPv4.
    pub fn add_interface(&self, name: &str, index: u16, ip: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.interfaces.push(RibMessage::Interface(InterfaceMessage {
            index,
            name: name.to_string(),
            flags: 0,
        }));
        let mut addrs: [Option<Addr>; RTAX_MAX] = Default::default();
        addrs[RTAX_IFA] = Some(Addr::Inet4(ip.parse().unwrap()));
        inner
            .interfaces
            .push(RibMessage::InterfaceAddr(InterfaceAddrMessage { index, addrs }));
    }

    /// Seeds a route as if the kernel had reported it on `index`.
    pub fn seed_route(&self, index: u16, mut msg: RouteMessage) {
        msg.index = index;
        self.inner
            .lock()
            .unwrap()
            .routes
            .entry(index)
            .or_default()
            .push(msg);
    }

    /// Makes writes with these sequence numbers fail.
    pub fn fail_writes_for_seqs(&self, seqs: &[i32]) {
        self.inner.lock().unwrap().fail_seqs = seqs.to_vec();
    }

    /// Makes the next `open_route_socket` call fail.
    pub fn fail_socket_open(&self, fail: bool) {
        self.inner.lock().unwrap().fail_open = fail;
    }

    /// Messages successfully written since the last commit.
    pub fn written(&self) -> Vec<RouteMessage> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Routes currently installed on `index`.
    pub fn routes_on(&self, index: u16) -> Vec<RouteMessage> {
        self.inner
            .lock()
            .unwrap()
            .routes
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies the written messages onto the table the way the kernel
    /// would: adds land on the interface named by their link gateway (or
    /// the message's own index), deletes remove by destination.
    pub fn commit_writes(&self) {
        let mut inner = self.inner.lock().unwrap();
        let written: Vec<RouteMessage> = inner.written.drain(..).collect();
        for msg in written {
            match msg.msg_type {
                RTM_ADD => {
                    let target = match msg.addrs[RTAX_GATEWAY] {
                        Some(Addr::Link { index, .. }) => index,
                        _ => msg.index,
                    };
                    let mut installed = msg;
                    installed.index = target;
                    inner.routes.entry(target).or_default().push(installed);
                }
                RTM_DELETE => {
                    let dst = msg.addrs[RTAX_DST].clone();
                    inner
                        .routes
                        .entry(msg.index)
                        .or_default()
                        .retain(|rm| rm.addrs[RTAX_DST] != dst);
                }
                other => panic!("unexpected message type written: {other:#x}"),
            }
        }
    }
}

impl RouteKernel for FakeKernel {
    fn fetch_interface_rib(&mut self) -> Result<Vec<RibMessage>> {
        Ok(self.inner.lock().unwrap().interfaces.clone())
    }

    fn fetch_route_rib(&mut self, ifce_index: u16) -> Result<Vec<RouteMessage>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .routes
            .get(&ifce_index)
            .cloned()
            .unwrap_or_default())
    }

    fn open_route_socket(&mut self) -> Result<Box<dyn RouteSocket>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "simulated open failure").into());
        }
        drop(inner);
        Ok(Box::new(FakeSocket {
            inner: self.inner.clone(),
        }))
    }
}

struct FakeSocket {
    inner: Arc<Mutex<FakeKernelInner>>,
}

impl RouteSocket for FakeSocket {
    fn write_message(&mut self, bytes: &[u8]) -> io::Result<()> {
        let msg = parse_route_rib(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty route write"))?;

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_seqs.contains(&msg.seq) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated write failure",
            ));
        }
        inner.written.push(msg);
        Ok(())
    }
}

/// Destination of a route message; panics when it is not an IPv4.
pub fn dst_of(msg: &RouteMessage) -> Ipv4Addr {
    match msg.addrs[RTAX_DST] {
        Some(Addr::Inet4(ip)) => ip,
        ref other => panic!("route message without IPv4 destination: {other:?}"),
    }
}

// --- LoopbackDnsServer ---

/// A minimal DNS server on 127.0.0.1 answering every A query with a
/// configurable record set.
pub struct LoopbackDnsServer {
    pub port: u16,
    answers: Arc<Mutex<Vec<(Ipv4Addr, u32)>>>,
    stop: Arc<AtomicBool>,
}

impl LoopbackDnsServer {
    pub fn start(initial: &[(&str, u32)]) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("failed to bind loopback DNS socket");
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();

        let answers: Arc<Mutex<Vec<(Ipv4Addr, u32)>>> = Arc::new(Mutex::new(parse_answers(initial)));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_answers = answers.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while !thread_stop.load(Ordering::Relaxed) {
                let (len, peer) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                let query = match Message::from_vec(&buf[..len]) {
                    Ok(query) => query,
                    Err(_) => continue,
                };

                let mut response = Message::new();
                response.set_id(query.id());
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_recursion_desired(true);
                response.set_recursion_available(true);
                if let Some(q) = query.queries().first() {
                    response.add_query(q.clone());
                    for (ip, ttl) in thread_answers.lock().unwrap().iter() {
                        response.add_answer(Record::from_rdata(
                            q.name().clone(),
                            *ttl,
                            RData::A(A(*ip)),
                        ));
                    }
                }
                if let Ok(bytes) = response.to_vec() {
                    let _ = socket.send_to(&bytes, peer);
                }
            }
        });

        Self {
            port,
            answers,
            stop,
        }
    }

    /// Replaces the served record set, as a load balancer rotation would.
    pub fn set_answers(&self, answers: &[(&str, u32)]) {
        *self.answers.lock().unwrap() = parse_answers(answers);
    }

    /// Stops the server and waits until the port stops answering.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(120));
    }
}

impl Drop for LoopbackDnsServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn parse_answers(answers: &[(&str, u32)]) -> Vec<(Ipv4Addr, u32)> {
    answers
        .iter()
        .map(|(ip, ttl)| (ip.parse().unwrap(), *ttl))
        .collect()
}
