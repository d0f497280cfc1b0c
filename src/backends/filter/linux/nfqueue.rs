// NFQUEUE reader thread: the shaping callback of the Linux backend

use crate::budget::{ShapingPoint, Verdict};
use anyhow::{Context, Result};
use nfq::Queue;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleep between polls of an empty queue
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Owns one bound NFQUEUE and the thread issuing its verdicts.
///
/// Retiring the shaping point makes the thread drain whatever is still
/// queued, pacing it under the old budget for at most one `max_wait`, and
/// then unbind.
pub struct QueueReader {
    queue_num: u16,
    point: Arc<ShapingPoint>,
    thread: Option<JoinHandle<()>>,
}

impl QueueReader {
    pub fn spawn(queue_num: u16, max_len: u32, point: Arc<ShapingPoint>) -> Result<Self> {
        let mut queue = Queue::open().context("Failed to open NFQUEUE netlink socket")?;
        queue
            .bind(queue_num)
            .with_context(|| format!("Failed to bind NFQUEUE {}", queue_num))?;

        if let Err(e) = queue.set_queue_max_len(queue_num, max_len) {
            log::debug!("NFQUEUE {} keeps default length: {}", queue_num, e);
        }
        queue.set_nonblocking(true);

        let thread_point = point.clone();
        let thread = thread::Builder::new()
            .name(format!("nfqueue-{}", queue_num))
            .spawn(move || run(queue, queue_num, thread_point))
            .context("Failed to spawn NFQUEUE reader thread")?;

        log::debug!("NFQUEUE {} reader started", queue_num);
        Ok(Self {
            queue_num,
            point,
            thread: Some(thread),
        })
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    /// Start draining. New packets no longer arrive once the rule is gone.
    pub fn retire(&self) {
        self.point.retire();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Retire and wait for the thread to unbind
    pub fn join(mut self) {
        self.retire();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("NFQUEUE {} reader panicked", self.queue_num);
            }
        }
    }
}

fn run(mut queue: Queue, queue_num: u16, point: Arc<ShapingPoint>) {
    let mut drain_deadline: Option<Instant> = None;

    loop {
        drain_deadline = next_drain_deadline(drain_deadline, &point, Instant::now());

        match queue.recv() {
            Ok(mut msg) => {
                let bytes = msg.get_payload().len() as u64;
                let verdict = decide(&point, bytes, drain_deadline, Instant::now());

                msg.set_verdict(match verdict {
                    Verdict::Accept => nfq::Verdict::Accept,
                    Verdict::Drop => nfq::Verdict::Drop,
                });
                if let Err(e) = queue.verdict(msg) {
                    log::warn!("NFQUEUE {} verdict failed: {}", queue_num, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if drain_deadline.is_some() {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
            Err(e) => {
                // ENOBUFS when the kernel queue overflowed; keep reading
                log::warn!("NFQUEUE {} receive failed: {}", queue_num, e);
                if drain_deadline.is_some() {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
        }
    }

    if let Err(e) = queue.unbind(queue_num) {
        log::debug!("NFQUEUE {} unbind failed: {}", queue_num, e);
    }
    let stats = point.stats();
    log::debug!(
        "NFQUEUE {} reader exited ({} passed, {} dropped)",
        queue_num,
        stats.packets_passed,
        stats.packets_dropped
    );
}

/// The drain deadline is fixed the first time the point is seen retired
/// and never moves afterwards.
fn next_drain_deadline(
    current: Option<Instant>,
    point: &ShapingPoint,
    now: Instant,
) -> Option<Instant> {
    current.or_else(|| point.is_retired().then(|| now + point.max_wait()))
}

/// Verdict for one queued packet. Packets are paced under the filter's own
/// budget, including the tail still queued after removal; once the drain
/// deadline has passed the rest of the tail is dropped unpaced.
fn decide(
    point: &ShapingPoint,
    bytes: u64,
    drain_deadline: Option<Instant>,
    now: Instant,
) -> Verdict {
    match drain_deadline {
        Some(deadline) if now >= deadline => Verdict::Drop,
        _ => point.pace(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_set_once_on_retirement() {
        let point = ShapingPoint::new(1000, Duration::from_millis(200));
        let t0 = Instant::now();

        assert_eq!(next_drain_deadline(None, &point, t0), None);

        point.retire();
        let deadline = next_drain_deadline(None, &point, t0);
        assert_eq!(deadline, Some(t0 + Duration::from_millis(200)));

        let later = t0 + Duration::from_millis(150);
        assert_eq!(next_drain_deadline(deadline, &point, later), deadline);
    }

    #[test]
    fn test_live_packets_are_paced() {
        let point = ShapingPoint::new(10_000, Duration::from_millis(20));
        assert_eq!(decide(&point, 1500, None, Instant::now()), Verdict::Accept);
        assert_eq!(point.stats().bytes_passed, 1500);
    }

    #[test]
    fn test_queued_tail_drains_under_old_budget() {
        let point = ShapingPoint::new(1000, Duration::from_millis(200));
        point.retire();
        let now = Instant::now();
        let deadline = next_drain_deadline(None, &point, now);

        // Within the budget the tail still passes
        assert_eq!(decide(&point, 800, deadline, now), Verdict::Accept);
        // The old limit still applies: 800 more bytes need far longer than 200ms
        assert_eq!(decide(&point, 800, deadline, now), Verdict::Drop);

        let stats = point.stats();
        assert_eq!(stats.packets_passed, 1);
        assert_eq!(stats.packets_dropped, 1);
    }

    #[test]
    fn test_tail_past_deadline_is_dropped_without_pacing() {
        let point = ShapingPoint::new(1_000_000, Duration::from_millis(10));
        point.retire();
        let now = Instant::now();

        assert_eq!(decide(&point, 100, Some(now), now), Verdict::Drop);
        // No tokens spent and nothing counted as passed
        assert_eq!(point.stats().packets_passed, 0);
        assert_eq!(point.pace(1_000_000), Verdict::Accept);
    }
}

