// pnet packet capture counter source

use crate::backends::monitor::{ByteCounters, CounterSource};
use crate::backends::BackendPriority;
use crate::classifier::{Attribution, FlowClassifier};
use crate::flow::{Direction, FlowKey, Protocol};
use anyhow::{Context, Result};
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Shared between the capture threads and `counters()`
#[derive(Default)]
struct CaptureCounters {
    per_pid: HashMap<u32, ByteCounters>,
    packets_captured: u64,
    packets_matched: u64,
}

/// Captures on every up interface (or one chosen interface) and attributes
/// each TCP/UDP packet to a pid through the classifier's cache.
pub struct PnetCounterSource {
    counters: Arc<Mutex<CaptureCounters>>,
    // Handles to packet capture threads (one per interface)
    _capture_handles: Vec<thread::JoinHandle<()>>,
}

impl PnetCounterSource {
    pub fn new(interface: Option<&str>, classifier: Arc<FlowClassifier>) -> Result<Self> {
        let interfaces: Vec<NetworkInterface> = match interface {
            Some(name) => {
                let found = datalink::interfaces()
                    .into_iter()
                    .find(|iface| iface.name == name)
                    .with_context(|| format!("Interface {} not found", name))?;
                vec![found]
            }
            None => find_all_interfaces(),
        };

        if interfaces.is_empty() {
            anyhow::bail!("No capturable network interfaces");
        }

        // Populate the connection snapshot before packets start arriving
        if let Err(e) = classifier.refresh() {
            log::debug!("Initial connection table read failed: {:#}", e);
        }

        let counters = Arc::new(Mutex::new(CaptureCounters::default()));
        let mut capture_handles = Vec::new();

        log::info!("Starting packet capture on {} interfaces", interfaces.len());
        for interface in interfaces {
            let iface_name = interface.name.clone();

            // Open the channel here so permission errors reach the caller
            let rx = match datalink::channel(&interface, Default::default()) {
                Ok(Channel::Ethernet(_tx, rx)) => rx,
                Ok(_) => {
                    log::debug!("Unsupported channel type for {}", iface_name);
                    continue;
                }
                Err(e) => {
                    if capture_handles.is_empty() && e.kind() == std::io::ErrorKind::PermissionDenied {
                        return Err(e).context("Packet capture requires root or CAP_NET_RAW");
                    }
                    log::warn!("Failed to create channel for {}: {}", iface_name, e);
                    continue;
                }
            };

            let counters = Arc::clone(&counters);
            let classifier = Arc::clone(&classifier);
            let handle = thread::Builder::new()
                .name(format!("capture-{}", iface_name))
                .spawn(move || capture_loop(rx, &iface_name, &counters, &classifier))
                .context("Failed to spawn capture thread")?;
            capture_handles.push(handle);
        }

        if capture_handles.is_empty() {
            anyhow::bail!("Could not open a capture channel on any interface");
        }

        Ok(Self {
            counters,
            _capture_handles: capture_handles,
        })
    }
}

impl CounterSource for PnetCounterSource {
    fn name(&self) -> &'static str {
        "pnet"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Good
    }

    fn is_available() -> bool {
        // pnet works on Linux and BSD with raw sockets, and Windows with Npcap
        cfg!(target_os = "linux")
            || cfg!(target_os = "freebsd")
            || cfg!(target_os = "openbsd")
            || cfg!(target_os = "netbsd")
            || cfg!(target_os = "windows")
    }

    fn counters(&self) -> Result<HashMap<u32, ByteCounters>> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        log::trace!(
            "pnet: {} packets captured, {} attributed",
            counters.packets_captured,
            counters.packets_matched
        );
        Ok(counters.per_pid.clone())
    }

    fn retain_pids(&self, live: &HashSet<u32>) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .per_pid
            .retain(|pid, _| live.contains(pid));
    }
}

fn find_all_interfaces() -> Vec<NetworkInterface> {
    // All interfaces that are up and have IP addresses, loopback included
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.ips.is_empty())
        .collect()
}

/// Packet capture thread - runs continuously on a specific interface
fn capture_loop(
    mut rx: Box<dyn datalink::DataLinkReceiver>,
    iface_name: &str,
    counters: &Mutex<CaptureCounters>,
    classifier: &FlowClassifier,
) {
    log::info!("Packet capture thread started on interface: {}", iface_name);

    loop {
        match rx.next() {
            Ok(frame) => {
                if let Some((flow, len)) = parse_frame(frame) {
                    record_packet(flow, len, counters, classifier);
                }
            }
            Err(e) => {
                log::error!("Packet receive error on {}: {}", iface_name, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Source/destination endpoints of a captured TCP/UDP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CapturedFlow {
    src: SocketAddr,
    dst: SocketAddr,
    protocol: Protocol,
}

fn parse_frame(frame: &[u8]) -> Option<(CapturedFlow, usize)> {
    let ethernet = EthernetPacket::new(frame)?;

    let flow = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet.payload())?;
            parse_transport(
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.get_next_level_protocol(),
                ipv4.payload(),
            )
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet.payload())?;
            parse_transport(
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.get_next_header(),
                ipv6.payload(),
            )
        }
        _ => None,
    }?;

    Some((flow, frame.len()))
}

fn parse_transport(
    src: IpAddr,
    dst: IpAddr,
    next: IpNextHeaderProtocol,
    payload: &[u8],
) -> Option<CapturedFlow> {
    match next {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            Some(CapturedFlow {
                src: SocketAddr::new(src, tcp.get_source()),
                dst: SocketAddr::new(dst, tcp.get_destination()),
                protocol: Protocol::Tcp,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            Some(CapturedFlow {
                src: SocketAddr::new(src, udp.get_source()),
                dst: SocketAddr::new(dst, udp.get_destination()),
                protocol: Protocol::Udp,
            })
        }
        _ => None,
    }
}

/// Outbound when the source endpoint belongs to a local socket, inbound
/// when the destination does.
fn attribute(flow: CapturedFlow, classifier: &FlowClassifier) -> Option<(u32, Direction)> {
    for direction in [Direction::Upload, Direction::Download] {
        let key = FlowKey::from_packet(flow.src, flow.dst, flow.protocol, direction);
        if let Attribution::Resolved(pid) = classifier.classify(&key) {
            return Some((pid, direction));
        }
    }
    None
}

fn record_packet(
    flow: CapturedFlow,
    len: usize,
    counters: &Mutex<CaptureCounters>,
    classifier: &FlowClassifier,
) {
    let attribution = attribute(flow, classifier);

    let mut counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
    counters.packets_captured += 1;

    if let Some((pid, direction)) = attribution {
        counters.packets_matched += 1;
        let entry = counters.per_pid.entry(pid).or_default();
        match direction {
            Direction::Upload => entry.tx_bytes += len as u64,
            Direction::Download => entry.rx_bytes += len as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::process::socket_mapper::{ConnectionTable, SocketOwner};

    struct OneSocket(SocketOwner);

    impl ConnectionTable for OneSocket {
        fn name(&self) -> &'static str {
            "one"
        }

        fn priority() -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
            Ok(vec![self.0.clone()])
        }
    }

    fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20 + 8];
        // Ethernet: dst mac, src mac, ethertype IPv4
        frame[12] = 0x08;
        frame[13] = 0x00;
        // IPv4 header
        frame[14] = 0x45;
        frame[16..18].copy_from_slice(&28u16.to_be_bytes());
        frame[22] = 64;
        frame[23] = 17;
        frame[26..30].copy_from_slice(&src);
        frame[30..34].copy_from_slice(&dst);
        // UDP header
        frame[34..36].copy_from_slice(&sport.to_be_bytes());
        frame[36..38].copy_from_slice(&dport.to_be_bytes());
        frame[38..40].copy_from_slice(&8u16.to_be_bytes());
        frame
    }

    #[test]
    fn test_parse_udp_frame() {
        let frame = udp_frame([10, 0, 0, 2], 5000, [10, 0, 0, 9], 53);
        let (flow, len) = parse_frame(&frame).unwrap();
        assert_eq!(flow.src, "10.0.0.2:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(flow.dst, "10.0.0.9:53".parse::<SocketAddr>().unwrap());
        assert_eq!(flow.protocol, Protocol::Udp);
        assert_eq!(len, frame.len());
    }

    #[test]
    fn test_non_ip_frame_is_ignored() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn test_packets_counted_by_direction() {
        let table = OneSocket(SocketOwner::new(
            Protocol::Udp,
            "10.0.0.2:5000".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            77,
        ));
        let classifier = FlowClassifier::new(Box::new(table));
        classifier.refresh().unwrap();
        let counters = Mutex::new(CaptureCounters::default());

        let out = udp_frame([10, 0, 0, 2], 5000, [10, 0, 0, 9], 53);
        let (flow, len) = parse_frame(&out).unwrap();
        record_packet(flow, len, &counters, &classifier);

        let back = udp_frame([10, 0, 0, 9], 53, [10, 0, 0, 2], 5000);
        let (flow, len) = parse_frame(&back).unwrap();
        record_packet(flow, len, &counters, &classifier);
        record_packet(flow, len, &counters, &classifier);

        let stranger = udp_frame([10, 0, 0, 3], 1, [10, 0, 0, 4], 2);
        let (flow, len) = parse_frame(&stranger).unwrap();
        record_packet(flow, len, &counters, &classifier);

        let counters = counters.lock().unwrap();
        assert_eq!(counters.packets_captured, 4);
        assert_eq!(counters.packets_matched, 3);
        assert_eq!(
            counters.per_pid[&77],
            ByteCounters {
                rx_bytes: 2 * 42,
                tx_bytes: 42
            }
        );
    }
}
