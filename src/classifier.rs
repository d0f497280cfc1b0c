//! Flow to process attribution through the OS connection table.

use crate::backends::process::socket_mapper::{ConnectionTable, SocketOwner, canonical_addr};
use crate::flow::{FlowKey, LocalPorts, Protocol};
use anyhow::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, PoisonError, RwLock};

/// Outcome of classifying one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Resolved(u32),
    /// No socket in the table matches; normal for short-lived flows
    Unresolved,
    /// The connection table could not be read on the last refresh
    Error,
}

/// One refresh worth of the connection table, indexed for lookup
#[derive(Debug, Default)]
struct TableSnapshot {
    // (protocol, local, remote) -> pid for connected sockets
    connected: HashMap<(Protocol, SocketAddr, SocketAddr), u32>,
    // (protocol, local) -> pid for listening/unconnected sockets
    bound: HashMap<(Protocol, SocketAddr), u32>,
    read_failed: bool,
}

impl TableSnapshot {
    fn build(owners: Vec<SocketOwner>) -> Self {
        let mut snapshot = Self::default();
        for owner in owners {
            let local = canonical_addr(owner.local);
            match owner.remote {
                Some(remote) => {
                    snapshot
                        .connected
                        .insert((owner.protocol, local, canonical_addr(remote)), owner.pid);
                }
                None => {
                    snapshot.bound.insert((owner.protocol, local), owner.pid);
                }
            }
        }
        snapshot
    }

    fn lookup(&self, flow: &FlowKey) -> Option<u32> {
        let local = canonical_addr(flow.local);
        let remote = canonical_addr(flow.remote);

        if let Some(&pid) = self.connected.get(&(flow.protocol, local, remote)) {
            return Some(pid);
        }
        if let Some(&pid) = self.bound.get(&(flow.protocol, local)) {
            return Some(pid);
        }

        // Wildcard-bound sockets accept on any local address. A dual-stack
        // `[::]` socket also receives IPv4.
        let port = local.port();
        let v4_any = local.is_ipv4().then_some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        v4_any
            .into_iter()
            .chain(std::iter::once(IpAddr::V6(Ipv6Addr::UNSPECIFIED)))
            .find_map(|ip| {
                self.bound
                    .get(&(flow.protocol, SocketAddr::new(ip, port)))
                    .copied()
            })
    }

    fn ports_of(&self, pid: u32) -> LocalPorts {
        let mut ports = LocalPorts::default();
        let connected = self.connected.iter().map(|(&(p, local, _), &owner)| (p, local, owner));
        let bound = self.bound.iter().map(|(&(p, local), &owner)| (p, local, owner));
        for (protocol, local, owner) in connected.chain(bound) {
            if owner == pid && local.port() != 0 {
                ports.insert(protocol, local.port());
            }
        }
        ports
    }
}

/// Maps flows to owning pids.
///
/// The table is read once per [`FlowClassifier::refresh`]; `classify` only
/// consults the snapshot and a per-refresh cache, so it is cheap enough to
/// call per packet from capture threads.
pub struct FlowClassifier {
    table: Box<dyn ConnectionTable>,
    snapshot: RwLock<TableSnapshot>,
    cache: Mutex<HashMap<FlowKey, Attribution>>,
}

impl FlowClassifier {
    pub fn new(table: Box<dyn ConnectionTable>) -> Self {
        Self {
            table,
            snapshot: RwLock::new(TableSnapshot::default()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.table.name()
    }

    /// Re-read the connection table and invalidate the flow cache.
    ///
    /// On failure the snapshot is emptied and every classification reports
    /// [`Attribution::Error`] until the next successful refresh.
    pub fn refresh(&self) -> Result<()> {
        let (snapshot, result) = match self.table.socket_owners() {
            Ok(owners) => {
                let snapshot = TableSnapshot::build(owners);
                log::trace!(
                    "Connection table: {} connected, {} bound sockets",
                    snapshot.connected.len(),
                    snapshot.bound.len()
                );
                (snapshot, Ok(()))
            }
            Err(e) => {
                log::warn!(
                    "Failed to read connection table ({}): {:#}",
                    self.table.name(),
                    e
                );
                let failed = TableSnapshot {
                    read_failed: true,
                    ..TableSnapshot::default()
                };
                (failed, Err(e))
            }
        };

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        result
    }

    /// Local ports `pid` held sockets on at the last refresh
    pub fn local_ports(&self, pid: u32) -> LocalPorts {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ports_of(pid)
    }

    pub fn classify(&self, flow: &FlowKey) -> Attribution {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flow)
        {
            return *cached;
        }

        let attribution = {
            let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            if snapshot.read_failed {
                Attribution::Error
            } else {
                match snapshot.lookup(flow) {
                    Some(pid) => Attribution::Resolved(pid),
                    None => Attribution::Unresolved,
                }
            }
        };

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*flow, attribution);
        attribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendPriority;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connection table returning whatever rows the test put in
    #[derive(Clone, Default)]
    struct ScriptedTable {
        rows: Arc<Mutex<Vec<SocketOwner>>>,
        fail: Arc<AtomicBool>,
        reads: Arc<AtomicUsize>,
    }

    impl ConnectionTable for ScriptedTable {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn priority() -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("table unreadable");
            }
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn owner(protocol: Protocol, local: &str, remote: &str, pid: u32) -> SocketOwner {
        SocketOwner::new(protocol, addr(local), addr(remote), pid)
    }

    fn classifier_with(rows: Vec<SocketOwner>) -> (FlowClassifier, ScriptedTable) {
        let table = ScriptedTable::default();
        *table.rows.lock().unwrap() = rows;
        let classifier = FlowClassifier::new(Box::new(table.clone()));
        classifier.refresh().unwrap();
        (classifier, table)
    }

    #[test]
    fn test_connected_socket_resolves_by_four_tuple() {
        let (classifier, _) = classifier_with(vec![owner(
            Protocol::Tcp,
            "10.0.0.2:50000",
            "93.184.216.34:443",
            100,
        )]);

        let flow = FlowKey::new(addr("10.0.0.2:50000"), addr("93.184.216.34:443"), Protocol::Tcp);
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(100));
    }

    #[test]
    fn test_remote_mismatch_is_unresolved() {
        let (classifier, _) = classifier_with(vec![owner(
            Protocol::Tcp,
            "10.0.0.2:50000",
            "93.184.216.34:443",
            100,
        )]);

        let flow = FlowKey::new(addr("10.0.0.2:50000"), addr("1.1.1.1:443"), Protocol::Tcp);
        assert_eq!(classifier.classify(&flow), Attribution::Unresolved);
    }

    #[test]
    fn test_protocol_mismatch_is_unresolved() {
        let (classifier, _) = classifier_with(vec![owner(
            Protocol::Udp,
            "10.0.0.2:5353",
            "0.0.0.0:0",
            200,
        )]);

        let flow = FlowKey::new(addr("10.0.0.2:5353"), addr("10.0.0.9:5353"), Protocol::Tcp);
        assert_eq!(classifier.classify(&flow), Attribution::Unresolved);
    }

    #[test]
    fn test_wildcard_bound_socket_matches_any_local_address() {
        let (classifier, _) = classifier_with(vec![
            owner(Protocol::Udp, "0.0.0.0:53", "0.0.0.0:0", 300),
            owner(Protocol::Tcp, "[::]:8080", "[::]:0", 301),
        ]);

        let dns = FlowKey::new(addr("192.168.1.10:53"), addr("192.168.1.20:40000"), Protocol::Udp);
        assert_eq!(classifier.classify(&dns), Attribution::Resolved(300));

        // Dual-stack listener picks up IPv4 peers
        let http = FlowKey::new(addr("127.0.0.1:8080"), addr("127.0.0.1:39000"), Protocol::Tcp);
        assert_eq!(classifier.classify(&http), Attribution::Resolved(301));
    }

    #[test]
    fn test_ipv4_mapped_rows_match_plain_ipv4_packets() {
        let (classifier, _) = classifier_with(vec![owner(
            Protocol::Tcp,
            "[::ffff:10.0.0.2]:22",
            "[::ffff:10.0.0.7]:51000",
            400,
        )]);

        let flow = FlowKey::new(addr("10.0.0.2:22"), addr("10.0.0.7:51000"), Protocol::Tcp);
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(400));
    }

    #[test]
    fn test_cache_is_invalidated_on_refresh() {
        let (classifier, table) = classifier_with(vec![owner(
            Protocol::Tcp,
            "10.0.0.2:50000",
            "1.1.1.1:443",
            100,
        )]);
        let flow = FlowKey::new(addr("10.0.0.2:50000"), addr("1.1.1.1:443"), Protocol::Tcp);
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(100));

        // Socket closed and the port reused by another process
        *table.rows.lock().unwrap() = vec![owner(
            Protocol::Tcp,
            "10.0.0.2:50000",
            "1.1.1.1:443",
            555,
        )];
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(100));

        classifier.refresh().unwrap();
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(555));
    }

    #[test]
    fn test_table_read_once_per_refresh() {
        let (classifier, table) = classifier_with(Vec::new());
        let flow = FlowKey::new(addr("10.0.0.2:1"), addr("10.0.0.3:2"), Protocol::Udp);
        for _ in 0..100 {
            classifier.classify(&flow);
        }
        assert_eq!(table.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreadable_table_yields_error_until_next_refresh() {
        let (classifier, table) = classifier_with(vec![owner(
            Protocol::Tcp,
            "10.0.0.2:50000",
            "1.1.1.1:443",
            100,
        )]);
        let flow = FlowKey::new(addr("10.0.0.2:50000"), addr("1.1.1.1:443"), Protocol::Tcp);

        table.fail.store(true, Ordering::SeqCst);
        assert!(classifier.refresh().is_err());
        assert_eq!(classifier.classify(&flow), Attribution::Error);

        table.fail.store(false, Ordering::SeqCst);
        classifier.refresh().unwrap();
        assert_eq!(classifier.classify(&flow), Attribution::Resolved(100));
    }

    #[test]
    fn test_local_ports_of_pid() {
        let (classifier, _) = classifier_with(vec![
            owner(Protocol::Tcp, "10.0.0.2:50000", "1.1.1.1:443", 100),
            owner(Protocol::Tcp, "0.0.0.0:8080", "0.0.0.0:0", 100),
            owner(Protocol::Udp, "[::]:5353", "[::]:0", 100),
            owner(Protocol::Tcp, "10.0.0.2:50001", "1.1.1.1:443", 200),
        ]);

        let ports = classifier.local_ports(100);
        assert_eq!(ports.tcp.iter().copied().collect::<Vec<_>>(), vec![8080, 50000]);
        assert_eq!(ports.udp.iter().copied().collect::<Vec<_>>(), vec![5353]);
        assert!(classifier.local_ports(999).is_empty());
    }
}
