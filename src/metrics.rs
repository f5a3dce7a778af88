use crate::session::SessionSummary;

use std::time::{Duration, Instant};

/// Per-lane counters and latency samples, updated by the server's receive loop.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelCounters {
    pub packets_received: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub timeouts: u64,
    pub bytes_received: u64,
    // Distinct in-window arrivals, i.e. packets that were or will be delivered.
    pub accepted: u64,
    pub latencies_ms: Vec<f64>,
}

impl ChannelCounters {
    /// `latency_ms` is `None` when the packet carried no real timestamp; a measured
    /// latency of zero milliseconds is still a sample.
    pub fn record_arrival(&mut self, payload_len: usize, latency_ms: Option<f64>) {
        self.packets_received += 1;
        self.bytes_received += payload_len as u64;
        if let Some(latency_ms) = latency_ms {
            self.latencies_ms.push(latency_ms);
        }
    }

    fn report(&self, duration: Duration, sent_total: Option<u64>, successes: u64) -> ChannelReport {
        let secs = duration.as_secs_f64();

        let avg_latency_ms = if self.latencies_ms.is_empty() {
            0.0
        } else {
            self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
        };

        ChannelReport {
            packets_received: self.packets_received,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            timeouts: self.timeouts,
            bytes_received: self.bytes_received,
            avg_latency_ms,
            jitter_ms: smoothed_jitter(&self.latencies_ms),
            throughput: if secs > 0.0 { self.bytes_received as f64 / secs } else { 0.0 },
            delivery_ratio: sent_total
                .filter(|&total| total > 0)
                .map(|total| successes as f64 / total as f64 * 100.0),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    pub reliable: ChannelCounters,
    pub unreliable: ChannelCounters,
    pub start_time: Option<Instant>,
    pub summary: Option<SessionSummary>,
}

impl MetricsRecorder {
    pub fn mark_start(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn report(&self) -> Report {
        let duration = self.start_time.map(|start| start.elapsed()).unwrap_or_default();

        let (reliable_sent, unreliable_sent) = match &self.summary {
            Some(summary) => (
                Some(summary.total_reliable_sent),
                Some(summary.total_unreliable_sent),
            ),
            None => (None, None),
        };

        Report {
            duration,
            reliable: self.reliable.report(duration, reliable_sent, self.reliable.accepted),
            unreliable: self
                .unreliable
                .report(duration, unreliable_sent, self.unreliable.packets_received),
        }
    }
}

/// A point-in-time view of a server's delivery statistics.
#[derive(Clone, Debug)]
pub struct Report {
    /// Wall-clock time elapsed since the first datagram arrived.
    pub duration: Duration,
    /// Statistics for the reliable lane.
    pub reliable: ChannelReport,
    /// Statistics for the unreliable lane.
    pub unreliable: ChannelReport,
}

/// Delivery statistics for one lane.
#[derive(Clone, Debug, Default)]
pub struct ChannelReport {
    /// Total datagrams received on this lane, duplicates included.
    pub packets_received: u64,
    /// Datagrams that duplicated an already-seen sequence number.
    pub duplicates: u64,
    /// In-window packets that arrived ahead of the delivery cursor.
    pub out_of_order: u64,
    /// Gap-skip events, where a missing packet was abandoned to unblock the stream.
    pub timeouts: u64,
    /// Total payload bytes received on this lane.
    pub bytes_received: u64,
    /// Mean one-way latency over all samples, in milliseconds.
    pub avg_latency_ms: f64,
    /// Smoothed inter-arrival latency variation per RFC 3550, in milliseconds.
    pub jitter_ms: f64,
    /// Payload bytes received per second of elapsed time.
    pub throughput: f64,
    /// Packets delivered as a percentage of packets the peer reported sending. `None`
    /// until a session summary with a non-zero sent total has arrived.
    pub delivery_ratio: Option<f64>,
}

/// RFC 3550 interarrival jitter over a latency sample sequence:
/// `J ← J + (|Dᵢ − Dᵢ₋₁| − J) / 16`, starting from zero.
fn smoothed_jitter(samples: &[f64]) -> f64 {
    let mut jitter = 0.0;

    for pair in samples.windows(2) {
        jitter += ((pair[1] - pair[0]).abs() - jitter) / 16.0;
    }

    jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_of_steady_stream_is_zero() {
        assert_eq!(smoothed_jitter(&[]), 0.0);
        assert_eq!(smoothed_jitter(&[5.0]), 0.0);
        assert_eq!(smoothed_jitter(&[5.0, 5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn jitter_converges_toward_variation() {
        // alternating 10ms/20ms latencies have a constant 10ms inter-arrival difference
        let samples: Vec<f64> = (0..64).map(|i| if i % 2 == 0 { 10.0 } else { 20.0 }).collect();
        let jitter = smoothed_jitter(&samples);
        assert!(jitter > 5.0 && jitter < 10.0, "jitter = {jitter}");

        // a single step produces 1/16th of the step
        let jitter = smoothed_jitter(&[10.0, 26.0]);
        assert!((jitter - 1.0).abs() < 1e-9);
    }

    #[test]
    fn delivery_ratio_requires_summary() {
        let mut recorder = MetricsRecorder::default();
        recorder.mark_start();
        recorder.reliable.record_arrival(100, Some(5.0));
        recorder.reliable.accepted += 1;

        let report = recorder.report();
        assert_eq!(report.reliable.delivery_ratio, None);
        assert_eq!(report.unreliable.delivery_ratio, None);

        recorder.summary = Some(SessionSummary::new(2, 0));
        let report = recorder.report();
        assert_eq!(report.reliable.delivery_ratio, Some(50.0));
        // zero unreliable sent must not divide by zero
        assert_eq!(report.unreliable.delivery_ratio, None);
    }

    #[test]
    fn arrival_accounting() {
        let mut counters = ChannelCounters::default();
        counters.record_arrival(10, Some(4.0));
        counters.record_arrival(20, Some(6.0));
        counters.record_arrival(30, None);

        assert_eq!(counters.packets_received, 3);
        assert_eq!(counters.bytes_received, 60);
        assert_eq!(counters.latencies_ms, vec![4.0, 6.0]);

        let report = counters.report(Duration::from_secs(2), None, 0);
        assert_eq!(report.avg_latency_ms, 5.0);
        assert_eq!(report.throughput, 30.0);
    }

    #[test]
    fn zero_latency_is_a_sample() {
        // same-millisecond send and receive must count toward the average and pair up
        // in the jitter sequence; only a missing timestamp is excluded
        let mut counters = ChannelCounters::default();
        counters.record_arrival(10, Some(0.0));
        counters.record_arrival(10, Some(2.0));
        counters.record_arrival(10, Some(0.0));

        assert_eq!(counters.latencies_ms, vec![0.0, 2.0, 0.0]);

        let report = counters.report(Duration::from_secs(1), None, 0);
        assert!((report.avg_latency_ms - 2.0 / 3.0).abs() < 1e-9);
        assert!(report.jitter_ms > 0.0);
    }

    #[test]
    fn report_before_any_packet() {
        let recorder = MetricsRecorder::default();
        let report = recorder.report();
        assert_eq!(report.duration, Duration::ZERO);
        assert_eq!(report.reliable.throughput, 0.0);
    }
}
