//! The control surface offered to presentation layers.

use crate::backends::filter::{FilterBackend, create_filter_backend};
use crate::backends::monitor::{CounterSource, select_counter_source};
use crate::backends::process::socket_mapper::{
    ConnectionTable, NullConnectionTable, select_connection_table,
};
use crate::backends::process::{ProcessSource, create_process_source};
use crate::classifier::FlowClassifier;
use crate::config::Config;
use crate::engine::{ThrottleEngine, ThrottleStats};
use crate::error::ThrottleResult;
use crate::meter::TrafficMeter;
use crate::process::{ProcessRecord, ThrottleLimits};
use crate::rate;
use crate::registry::ProcessRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Facade over registry, meter and throttle engine.
///
/// Every operation takes `&self`, so one controller can be shared between
/// the periodic refresh/stats tasks and whoever issues throttle commands.
/// Recoverable failures are logged and reported as `false`.
pub struct BandwidthController {
    registry: Mutex<ProcessRegistry>,
    meter: Mutex<TrafficMeter>,
    classifier: Arc<FlowClassifier>,
    engine: ThrottleEngine,
}

impl BandwidthController {
    /// Build the controller from the platform's best backends
    pub fn new(config: &Config) -> Self {
        let table: Box<dyn ConnectionTable> =
            match select_connection_table(config.preferred_socket_mapper.as_deref()) {
                Ok(table) => table,
                Err(e) => {
                    log::warn!("Socket mapper unavailable, flows stay unattributed: {:#}", e);
                    Box::new(NullConnectionTable)
                }
            };
        let classifier = Arc::new(FlowClassifier::new(table));
        let counters =
            select_counter_source(config.capture_interface.as_deref(), Arc::clone(&classifier));

        Self::with_backends(
            create_process_source(),
            classifier,
            counters,
            create_filter_backend(config.filter_settings()),
            config.pacing(),
        )
    }

    pub fn with_backends(
        processes: Box<dyn ProcessSource>,
        classifier: Arc<FlowClassifier>,
        counters: Box<dyn CounterSource>,
        filter: Box<dyn FilterBackend>,
        max_pacing_wait: Duration,
    ) -> Self {
        let controller = Self {
            registry: Mutex::new(ProcessRegistry::new(processes)),
            meter: Mutex::new(TrafficMeter::new(counters)),
            classifier,
            engine: ThrottleEngine::new(filter, max_pacing_wait),
        };

        log::info!(
            "Backends: processes={}, socket mapper={}, counters={}, filter={}",
            controller.registry().source_name(),
            controller.classifier.table_name(),
            controller.meter().source_name(),
            controller.engine.backend_name()
        );
        controller
    }

    fn registry(&self) -> MutexGuard<'_, ProcessRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meter(&self) -> MutexGuard<'_, TrafficMeter> {
        self.meter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Processes from the last refresh, ascending pid, with live speeds
    pub fn list_processes(&self) -> Vec<ProcessRecord> {
        let mut records = self.registry().list();
        let meter = self.meter();
        for record in &mut records {
            meter.annotate(record);
        }
        records
    }

    /// Re-enumerate processes, then release throttles of exited ones
    pub fn refresh(&self) -> bool {
        let mut registry = self.registry();
        if let Err(e) = registry.refresh() {
            log::warn!("Process refresh failed: {:#}", e);
            return false;
        }

        self.meter().retain(&registry.live_pids());
        // Pids started after the snapshot are checked against the OS again
        self.engine.sweep(|pid| registry.is_alive(pid));
        true
    }

    /// One accounting tick: re-read the connection table and sample counters.
    ///
    /// Counters are sampled even when the table read fails; the tick then
    /// reports `false` and flows read as [`crate::classifier::Attribution::Error`].
    pub fn update_stats(&self) -> bool {
        let table_read = self.refresh_flows();

        let sampled = match self.meter().update() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Traffic sampling failed: {:#}", e);
                false
            }
        };
        table_read && sampled
    }

    /// Re-read the connection table and point every throttle at the local
    /// ports its process currently holds
    fn refresh_flows(&self) -> bool {
        if let Err(e) = self.classifier.refresh() {
            log::warn!("Connection table read failed: {:#}", e);
            return false;
        }
        if let Err(e) = self
            .engine
            .track_ports(|pid| self.classifier.local_ports(pid))
        {
            log::debug!("Port tracking incomplete: {}", e);
        }
        true
    }

    /// Like [`BandwidthController::start_throttle`] but keeps the reason
    pub fn try_start_throttle(
        &self,
        pid: u32,
        download_limit: u64,
        upload_limit: u64,
    ) -> ThrottleResult<()> {
        self.engine.start(pid, download_limit, upload_limit)?;
        // Sockets opened before the throttle are caught by port
        self.refresh_flows();
        Ok(())
    }

    pub fn start_throttle(&self, pid: u32, download_limit: u64, upload_limit: u64) -> bool {
        self.try_start_throttle(pid, download_limit, upload_limit)
            .is_ok()
    }

    pub fn stop_throttle(&self, pid: u32) -> bool {
        match self.engine.stop(pid) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("stop_throttle({}): {}", pid, e);
                false
            }
        }
    }

    pub fn is_throttle_active(&self, pid: u32) -> bool {
        self.engine.is_active(pid)
    }

    pub fn throttle_limits(&self, pid: u32) -> Option<ThrottleLimits> {
        self.engine.limits(pid)
    }

    pub fn throttle_stats(&self, pid: u32) -> Option<ThrottleStats> {
        self.engine.stats(pid)
    }

    pub fn active_throttles(&self) -> BTreeMap<u32, ThrottleLimits> {
        self.engine.active_throttles()
    }

    /// Stop every throttle and close the filtering session
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    pub fn parse_rate(input: &str) -> u64 {
        rate::parse_rate(input)
    }

    pub fn format_rate(bytes_per_sec: u64) -> String {
        rate::format_rate(bytes_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::filter::mock::{CountingBackend, SharedMockState};
    use crate::backends::process::socket_mapper::SocketOwner;
    use crate::flow::{Direction, Protocol};
    use crate::backends::monitor::ByteCounters;
    use crate::backends::process::{AccessLevel, ProcessIdentity};
    use crate::backends::BackendPriority;
    use anyhow::Result;
    use std::collections::HashMap;

    type Shared<T> = Arc<Mutex<T>>;

    /// Listed pids, plus pids that are running but missed the last listing
    struct FakeProcesses {
        listed: Shared<Vec<u32>>,
        late: Shared<Vec<u32>>,
    }

    impl ProcessSource for FakeProcesses {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn list_pids(&self) -> Result<Vec<u32>> {
            Ok(self.listed.lock().unwrap().clone())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.listed.lock().unwrap().contains(&pid) || self.late.lock().unwrap().contains(&pid)
        }

        fn identify(&self, pid: u32) -> ProcessIdentity {
            if pid % 2 == 0 {
                ProcessIdentity {
                    name: format!("proc{}", pid),
                    path: format!("/usr/bin/proc{}", pid),
                    access: AccessLevel::Full,
                }
            } else {
                ProcessIdentity::pid_only()
            }
        }
    }

    /// Connection table rows set by the test; `None` makes reads fail
    struct FakeTable(Shared<Option<Vec<SocketOwner>>>);

    impl ConnectionTable for FakeTable {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn priority() -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
            match &*self.0.lock().unwrap() {
                Some(rows) => Ok(rows.clone()),
                None => anyhow::bail!("table unreadable"),
            }
        }
    }

    struct FakeCounters(Shared<HashMap<u32, ByteCounters>>);

    impl CounterSource for FakeCounters {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn priority() -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn counters(&self) -> Result<HashMap<u32, ByteCounters>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct Harness {
        controller: BandwidthController,
        pids: Shared<Vec<u32>>,
        late: Shared<Vec<u32>>,
        sockets: Shared<Option<Vec<SocketOwner>>>,
        counters: Shared<HashMap<u32, ByteCounters>>,
        filters: SharedMockState,
    }

    fn harness(pids: &[u32]) -> Harness {
        let pid_list = Arc::new(Mutex::new(pids.to_vec()));
        let late = Arc::new(Mutex::new(Vec::new()));
        let sockets = Arc::new(Mutex::new(Some(Vec::new())));
        let counters = Arc::new(Mutex::new(HashMap::new()));
        let (backend, filters) = CountingBackend::new();

        let controller = BandwidthController::with_backends(
            Box::new(FakeProcesses {
                listed: pid_list.clone(),
                late: late.clone(),
            }),
            Arc::new(FlowClassifier::new(Box::new(FakeTable(sockets.clone())))),
            Box::new(FakeCounters(counters.clone())),
            Box::new(backend),
            Duration::from_millis(20),
        );

        Harness {
            controller,
            pids: pid_list,
            late,
            sockets,
            counters,
            filters,
        }
    }

    #[test]
    fn test_list_processes_sorted_with_hidden_entries() {
        let h = harness(&[30, 3, 12]);
        assert!(h.controller.refresh());

        let list = h.controller.list_processes();
        let pids: Vec<u32> = list.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![3, 12, 30]);
        assert!(list[0].name.is_empty());
        assert_eq!(list[1].name, "proc12");
    }

    #[test]
    fn test_update_stats_attaches_speeds() {
        let h = harness(&[2]);
        h.controller.refresh();

        h.counters.lock().unwrap().insert(
            2,
            ByteCounters {
                rx_bytes: 1000,
                tx_bytes: 10,
            },
        );
        assert!(h.controller.update_stats());

        let record = &h.controller.list_processes()[0];
        assert_eq!(record.total_downloaded, 1000);
        assert_eq!(record.total_uploaded, 10);
    }

    #[test]
    fn test_unreadable_table_still_samples_counters() {
        let h = harness(&[2]);
        h.controller.refresh();
        *h.sockets.lock().unwrap() = None;

        h.counters.lock().unwrap().insert(
            2,
            ByteCounters {
                rx_bytes: 500,
                tx_bytes: 50,
            },
        );
        assert!(!h.controller.update_stats());

        let record = &h.controller.list_processes()[0];
        assert_eq!(record.total_downloaded, 500);
        assert_eq!(record.total_uploaded, 50);

        *h.sockets.lock().unwrap() = Some(Vec::new());
        assert!(h.controller.update_stats());
    }

    #[test]
    fn test_existing_sockets_follow_the_throttle() {
        let h = harness(&[2]);
        let socket = |local: &str, pid| {
            SocketOwner::new(
                Protocol::Tcp,
                local.parse().unwrap(),
                "93.184.216.34:443".parse().unwrap(),
                pid,
            )
        };
        *h.sockets.lock().unwrap() = Some(vec![socket("10.0.0.2:50000", 2)]);

        assert!(h.controller.start_throttle(2, 1024, 1024));
        let tracked_ports = |h: &Harness| {
            let state = h.filters.lock().unwrap();
            let handle = state.handle_for(2, Direction::Upload).unwrap();
            state.tracked.get(&handle).cloned().unwrap_or_default()
        };
        assert!(tracked_ports(&h).tcp.contains(&50000));

        *h.sockets.lock().unwrap() = Some(vec![
            socket("10.0.0.2:50001", 2),
            socket("10.0.0.2:60000", 9),
        ]);
        assert!(h.controller.update_stats());
        let ports = tracked_ports(&h);
        assert_eq!(ports.tcp.iter().copied().collect::<Vec<_>>(), vec![50001]);
    }

    #[test]
    fn test_start_stop_query() {
        let h = harness(&[2]);

        assert!(h.controller.start_throttle(2, 1024, 2048));
        assert!(h.controller.is_throttle_active(2));
        assert_eq!(
            h.controller.throttle_limits(2),
            Some(ThrottleLimits {
                download_limit: 1024,
                upload_limit: 2048
            })
        );
        assert_eq!(h.controller.active_throttles().len(), 1);
        assert!(h.controller.throttle_stats(2).is_some());

        assert!(h.controller.stop_throttle(2));
        assert!(!h.controller.is_throttle_active(2));
        assert!(!h.controller.stop_throttle(2));
    }

    #[test]
    fn test_start_failure_reports_false() {
        let h = harness(&[2]);
        h.filters.lock().unwrap().fail_open = true;

        assert!(!h.controller.start_throttle(2, 1024, 1024));
        assert!(!h.controller.is_throttle_active(2));
    }

    #[test]
    fn test_refresh_sweeps_exited_processes() {
        let h = harness(&[2, 4]);
        h.controller.refresh();
        h.controller.start_throttle(2, 1000, 1000);
        h.controller.start_throttle(4, 1000, 1000);

        h.pids.lock().unwrap().retain(|&pid| pid != 4);
        assert!(h.controller.refresh());

        assert!(h.controller.is_throttle_active(2));
        assert!(!h.controller.is_throttle_active(4));
        assert_eq!(h.filters.lock().unwrap().live_for(4), 0);
    }

    #[test]
    fn test_refresh_keeps_process_started_after_listing() {
        let h = harness(&[2]);
        h.controller.refresh();

        h.late.lock().unwrap().push(8);
        assert!(h.controller.start_throttle(8, 1000, 1000));
        assert!(h.controller.refresh());
        assert!(h.controller.is_throttle_active(8));

        h.late.lock().unwrap().clear();
        assert!(h.controller.refresh());
        assert!(!h.controller.is_throttle_active(8));
    }

    #[test]
    fn test_shutdown_releases_all() {
        let h = harness(&[2]);
        h.controller.start_throttle(2, 0, 0);
        h.controller.shutdown();

        assert!(h.controller.active_throttles().is_empty());
        assert!(h.filters.lock().unwrap().live.is_empty());
    }

    #[test]
    fn test_rate_helpers() {
        assert_eq!(BandwidthController::parse_rate("1.5kb"), 1536);
        assert_eq!(BandwidthController::parse_rate("xyz"), 0);
        assert_eq!(BandwidthController::format_rate(2048), "2.00 KB/s");
    }
}
