use crate::metrics::MetricsRecorder;
use crate::packet::{ChannelType, Packet};
use crate::seq;
use crate::seq::Seq;
use crate::session::SessionSummary;

use log::{debug, info, trace, warn};

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Where the receiver's replies (ACKs, SSACKs) go. The server wires this to its UDP
/// socket; tests record the traffic instead.
pub(super) trait DatagramSink {
    fn send(&mut self, data: &[u8]);
}

/// One payload ready for the application callback.
pub(super) struct Delivery {
    pub packet: Packet,
    pub latency_ms: f64,
}

struct GapWait {
    seq: Seq,
    since: Instant,
}

/// The reliable-lane state machine: classifies arriving sequence numbers against the
/// delivery cursor, buffers out-of-order packets inside the receive window, and skips
/// sequences that stay missing past the gap timeout. Pure logic; the server's receive
/// loop feeds it datagrams and drains its output queue.
pub(super) struct Receiver {
    window_size: u16,
    gap_timeout: Duration,

    buffer: HashMap<Seq, Delivery>,
    expected: Seq,
    first_packet: bool,
    waiting: Option<GapWait>,

    output: VecDeque<Delivery>,
}

impl Receiver {
    pub fn new(window_size: u16, gap_timeout: Duration) -> Self {
        Self {
            window_size,
            gap_timeout,
            buffer: HashMap::new(),
            expected: 0,
            first_packet: true,
            waiting: None,
            output: VecDeque::new(),
        }
    }

    /// Ingests one raw datagram. Reliable packets pass through classification and the
    /// reassembly buffer; a resulting in-order run lands on the output queue. Unreliable
    /// packets are handed back for immediate delivery. Session summaries are consumed
    /// and acknowledged here.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        now: Instant,
        wall_now_ms: u64,
        metrics: &mut MetricsRecorder,
        sink: &mut impl DatagramSink,
    ) -> Option<Delivery> {
        metrics.mark_start();

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping malformed datagram: {}", err);
                return None;
            }
        };

        let latency = one_way_latency_ms(&packet, wall_now_ms);

        match packet.channel_type {
            ChannelType::Unreliable => {
                metrics.unreliable.record_arrival(packet.payload.len(), latency);
                let latency_ms = latency.unwrap_or(0.0);
                trace!("unreliable packet, latency {:.2}ms", latency_ms);
                Some(Delivery { packet, latency_ms })
            }
            ChannelType::Reliable => {
                self.handle_reliable(packet, latency, now, metrics, sink);
                None
            }
            ChannelType::Session => {
                self.handle_summary(&packet, metrics, sink);
                None
            }
        }
    }

    fn handle_reliable(
        &mut self,
        packet: Packet,
        latency: Option<f64>,
        now: Instant,
        metrics: &mut MetricsRecorder,
        sink: &mut impl DatagramSink,
    ) {
        let seq_num = packet.seq_num;
        let latency_ms = latency.unwrap_or(0.0);

        if self.first_packet {
            self.first_packet = false;
            self.expected = seq_num;
            debug!("delivery cursor starts at seq {}", seq_num);
        }

        metrics.reliable.record_arrival(packet.payload.len(), latency);

        if seq::behind_window(seq_num, self.expected) {
            // already delivered; the ACK for it may have been lost
            metrics.reliable.duplicates += 1;
            debug!("duplicate seq {} behind cursor {}, re-acking", seq_num, self.expected);
            send_ack(seq_num, sink);
        } else if seq::within_window(seq_num, self.expected, self.window_size) {
            if self.buffer.contains_key(&seq_num) {
                metrics.reliable.duplicates += 1;
                debug!("duplicate buffered seq {}", seq_num);
            } else {
                if seq_num != self.expected {
                    metrics.reliable.out_of_order += 1;
                    self.arm_wait(now);
                }
                metrics.reliable.accepted += 1;
                trace!(
                    "buffered seq {} (cursor {}, {} buffered), latency {:.2}ms",
                    seq_num,
                    self.expected,
                    self.buffer.len() + 1,
                    latency_ms
                );
                self.buffer.insert(seq_num, Delivery { packet, latency_ms });
            }

            send_ack(seq_num, sink);
            self.drain(now);
        } else {
            // too far ahead, or ancient after a wrap; no ACK for out-of-window sequences
            debug!(
                "out-of-window seq {} (window [{}, {}])",
                seq_num,
                self.expected,
                self.expected.wrapping_add(self.window_size - 1)
            );
        }
    }

    fn handle_summary(
        &mut self,
        packet: &Packet,
        metrics: &mut MetricsRecorder,
        sink: &mut impl DatagramSink,
    ) {
        match SessionSummary::from_payload(&packet.payload) {
            Ok(summary) if summary.is_session_end() => {
                info!(
                    "session summary: {} reliable / {} unreliable sent",
                    summary.total_reliable_sent, summary.total_unreliable_sent
                );
                metrics.summary = Some(summary);
                sink.send(&Packet::summary_ack().encode());
            }
            Ok(summary) => {
                warn!("session summary with unexpected type {:?}", summary.kind);
            }
            Err(err) => {
                warn!("undecodable session summary: {}", err);
            }
        }
    }

    /// Abandons the expected sequence once its gap has been pending for the full
    /// timeout: the cursor jumps to the nearest buffered sequence ahead and the stream
    /// unblocks. Called once per receive-loop tick.
    pub fn check_gap_timeout(&mut self, now: Instant, metrics: &mut MetricsRecorder) {
        let Some(wait) = &self.waiting else {
            return;
        };
        debug_assert_eq!(wait.seq, self.expected);

        if now.duration_since(wait.since) < self.gap_timeout {
            return;
        }

        let Some(&resume) = self
            .buffer
            .keys()
            .min_by_key(|&&buffered| seq::lead(buffered, self.expected))
        else {
            self.waiting = None;
            return;
        };

        metrics.reliable.timeouts += 1;
        info!(
            "seq {} timed out after {:?}, resuming at seq {}",
            self.expected, self.gap_timeout, resume
        );

        self.expected = resume;
        self.drain(now);
    }

    /// Takes the next payload owed to the application, oldest first.
    pub fn pop_delivery(&mut self) -> Option<Delivery> {
        self.output.pop_front()
    }

    fn drain(&mut self, now: Instant) {
        let mut advanced = false;

        while let Some(delivery) = self.buffer.remove(&self.expected) {
            trace!("delivering seq {} in order", self.expected);
            self.output.push_back(delivery);
            self.expected = seq::next(self.expected);
            advanced = true;
        }

        if advanced {
            self.waiting = None;
            if !self.buffer.is_empty() {
                self.arm_wait(now);
            }
        }
    }

    fn arm_wait(&mut self, now: Instant) {
        let expected = self.expected;
        match &self.waiting {
            Some(wait) if wait.seq == expected => {}
            _ => {
                trace!("waiting for seq {}", expected);
                self.waiting = Some(GapWait { seq: expected, since: now });
            }
        }
    }
}

fn send_ack(seq_num: Seq, sink: &mut impl DatagramSink) {
    sink.send(&Packet::ack(seq_num).encode());
}

/// `None` when the packet carries no timestamp (replies, probes); `Some(0.0)` is a real
/// same-millisecond measurement and stays in the sample sequence.
fn one_way_latency_ms(packet: &Packet, wall_now_ms: u64) -> Option<f64> {
    if packet.time_stamp == 0 {
        return None;
    }
    Some(wall_now_ms.saturating_sub(packet.time_stamp) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALL: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Packet>,
    }

    impl DatagramSink for RecordingSink {
        fn send(&mut self, data: &[u8]) {
            self.sent.push(Packet::decode(data).unwrap());
        }
    }

    impl RecordingSink {
        fn acks(&self) -> Vec<u16> {
            self.sent
                .iter()
                .filter(|packet| packet.channel_type == ChannelType::Reliable)
                .map(|packet| packet.ack_num)
                .collect()
        }
    }

    struct Fixture {
        receiver: Receiver,
        metrics: MetricsRecorder,
        sink: RecordingSink,
        t0: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_window(16)
        }

        fn with_window(window_size: u16) -> Self {
            Self {
                receiver: Receiver::new(window_size, Duration::from_millis(200)),
                metrics: MetricsRecorder::default(),
                sink: RecordingSink::default(),
                t0: Instant::now(),
            }
        }

        fn at(&self, offset_ms: u64) -> Instant {
            self.t0 + Duration::from_millis(offset_ms)
        }

        fn reliable(&mut self, seq_num: u16, payload: &[u8], offset_ms: u64) {
            let packet = Packet {
                channel_type: ChannelType::Reliable,
                seq_num,
                time_stamp: WALL,
                ack_num: 0,
                payload: payload.into(),
            };
            let now = self.at(offset_ms);
            let delivered = self.receiver.handle_datagram(
                &packet.encode(),
                now,
                WALL + 5,
                &mut self.metrics,
                &mut self.sink,
            );
            assert!(delivered.is_none());
        }

        fn deliveries(&mut self) -> Vec<u16> {
            let mut seqs = Vec::new();
            while let Some(delivery) = self.receiver.pop_delivery() {
                seqs.push(delivery.packet.seq_num);
            }
            seqs
        }
    }

    #[test]
    fn in_order_arrivals_deliver_immediately() {
        let mut fx = Fixture::new();

        fx.reliable(100, b"A", 0);
        fx.reliable(101, b"B", 1);
        fx.reliable(102, b"C", 2);

        assert_eq!(fx.deliveries(), vec![100, 101, 102]);
        assert_eq!(fx.sink.acks(), vec![100, 101, 102]);
        assert_eq!(fx.metrics.reliable.packets_received, 3);
        assert_eq!(fx.metrics.reliable.accepted, 3);
        assert_eq!(fx.metrics.reliable.duplicates, 0);
        assert_eq!(fx.metrics.reliable.out_of_order, 0);
        assert_eq!(fx.metrics.reliable.timeouts, 0);
    }

    #[test]
    fn reordered_arrivals_deliver_in_order() {
        let mut fx = Fixture::new();

        for (seq_num, offset) in [(0, 0), (2, 1), (1, 2), (4, 3), (3, 4)] {
            fx.reliable(seq_num, b"x", offset);
        }

        assert_eq!(fx.deliveries(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fx.metrics.reliable.out_of_order, 2);
        assert_eq!(fx.metrics.reliable.duplicates, 0);
        assert_eq!(fx.metrics.reliable.timeouts, 0);
    }

    #[test]
    fn duplicates_are_suppressed_and_reacked() {
        let mut fx = Fixture::new();

        fx.reliable(10, b"A", 0);
        assert_eq!(fx.deliveries(), vec![10]);

        // behind the cursor now; must re-ack without re-delivering
        fx.reliable(10, b"A", 1);
        assert_eq!(fx.deliveries(), Vec::<u16>::new());
        assert_eq!(fx.sink.acks(), vec![10, 10]);
        assert_eq!(fx.metrics.reliable.duplicates, 1);

        // a duplicate of a still-buffered packet is suppressed the same way
        fx.reliable(12, b"C", 2);
        fx.reliable(12, b"C", 3);
        assert_eq!(fx.metrics.reliable.duplicates, 2);
        assert_eq!(fx.sink.acks(), vec![10, 10, 12, 12]);
        assert_eq!(fx.metrics.reliable.accepted, 2);
    }

    #[test]
    fn out_of_window_is_dropped_without_ack() {
        let mut fx = Fixture::new();

        fx.reliable(100, b"A", 0);
        assert_eq!(fx.deliveries(), vec![100]);

        // cursor at 101; 300 is far ahead of the 16-wide window
        fx.reliable(300, b"x", 1);
        assert_eq!(fx.sink.acks(), vec![100]);
        assert_eq!(fx.deliveries(), Vec::<u16>::new());
        assert_eq!(fx.metrics.reliable.duplicates, 0);
    }

    #[test]
    fn gap_skip_unblocks_successors() {
        let mut fx = Fixture::new();

        fx.reliable(5, b"first", 0);
        assert_eq!(fx.deliveries(), vec![5]);

        // 6 never arrives
        fx.reliable(7, b"x", 10);
        fx.reliable(8, b"y", 11);
        assert_eq!(fx.deliveries(), Vec::<u16>::new());

        // before the timeout nothing changes
        fx.receiver.check_gap_timeout(fx.at(150), &mut fx.metrics);
        assert_eq!(fx.deliveries(), Vec::<u16>::new());
        assert_eq!(fx.metrics.reliable.timeouts, 0);

        // after the timeout seq 6 is abandoned
        fx.receiver.check_gap_timeout(fx.at(215), &mut fx.metrics);
        assert_eq!(fx.deliveries(), vec![7, 8]);
        assert_eq!(fx.metrics.reliable.timeouts, 1);

        // the gap state is cleared; no further skips happen
        fx.receiver.check_gap_timeout(fx.at(500), &mut fx.metrics);
        assert_eq!(fx.metrics.reliable.timeouts, 1);
    }

    #[test]
    fn consecutive_gaps_skip_one_at_a_time() {
        let mut fx = Fixture::new();

        fx.reliable(0, b"a", 0);
        assert_eq!(fx.deliveries(), vec![0]);

        // two separate holes: 1 and 3
        fx.reliable(2, b"c", 10);
        fx.reliable(4, b"e", 11);

        fx.receiver.check_gap_timeout(fx.at(250), &mut fx.metrics);
        assert_eq!(fx.deliveries(), vec![2]);
        assert_eq!(fx.metrics.reliable.timeouts, 1);

        // the second hole gets a fresh timeout measured from the first skip
        fx.receiver.check_gap_timeout(fx.at(300), &mut fx.metrics);
        assert_eq!(fx.deliveries(), Vec::<u16>::new());

        fx.receiver.check_gap_timeout(fx.at(460), &mut fx.metrics);
        assert_eq!(fx.deliveries(), vec![4]);
        assert_eq!(fx.metrics.reliable.timeouts, 2);
    }

    #[test]
    fn gap_skip_selects_closest_ahead_across_wrap() {
        let mut fx = Fixture::new();

        fx.reliable(65533, b"a", 0);
        assert_eq!(fx.deliveries(), vec![65533]);

        // cursor at 65534; buffer 65535 and 0 with 65534 missing. The numeric minimum
        // key is 0, but the sequence closest ahead of the cursor is 65535.
        fx.reliable(0, b"c", 1);
        fx.reliable(65535, b"b", 2);

        fx.receiver.check_gap_timeout(fx.at(250), &mut fx.metrics);
        assert_eq!(fx.deliveries(), vec![65535, 0]);
        assert_eq!(fx.metrics.reliable.timeouts, 1);
    }

    #[test]
    fn wrap_around_in_order() {
        let mut fx = Fixture::new();

        let seqs = [65534, 65535, 0, 1, 2];
        for (i, &seq_num) in seqs.iter().enumerate() {
            fx.reliable(seq_num, b"w", i as u64);
        }

        assert_eq!(fx.deliveries(), vec![65534, 65535, 0, 1, 2]);
        assert_eq!(fx.metrics.reliable.out_of_order, 0);
        assert_eq!(fx.metrics.reliable.duplicates, 0);
    }

    #[test]
    fn window_bound_is_respected() {
        let mut fx = Fixture::with_window(4);

        fx.reliable(10, b"a", 0);
        assert_eq!(fx.deliveries(), vec![10]);

        // window is [11, 14]; 14 fits, 15 does not
        fx.reliable(14, b"e", 1);
        assert_eq!(fx.sink.acks(), vec![10, 14]);
        fx.reliable(15, b"f", 2);
        assert_eq!(fx.sink.acks(), vec![10, 14]);
    }

    #[test]
    fn unreliable_bypasses_the_buffer() {
        let mut fx = Fixture::new();

        let packet = Packet {
            channel_type: ChannelType::Unreliable,
            seq_num: 0,
            time_stamp: WALL,
            ack_num: 0,
            payload: b"telemetry".to_vec().into(),
        };

        let now = fx.t0;
        let delivered = fx
            .receiver
            .handle_datagram(&packet.encode(), now, WALL + 3, &mut fx.metrics, &mut fx.sink)
            .unwrap();

        assert_eq!(delivered.packet.payload.as_ref(), b"telemetry");
        assert_eq!(delivered.latency_ms, 3.0);
        assert!(fx.sink.sent.is_empty());
        assert_eq!(fx.metrics.unreliable.packets_received, 1);
        assert_eq!(fx.metrics.unreliable.bytes_received, 9);
    }

    #[test]
    fn session_summary_is_recorded_and_acked_statelessly() {
        let mut fx = Fixture::new();

        let payload =
            br#"{"type":"SESSION_END","total_reliable_sent":10,"total_unreliable_sent":5}"#;
        let packet = Packet {
            channel_type: ChannelType::Session,
            seq_num: 0,
            time_stamp: WALL,
            ack_num: 0,
            payload: payload.to_vec().into(),
        };
        let data = packet.encode();

        let now = fx.t0;
        for _ in 0..2 {
            let delivered =
                fx.receiver
                    .handle_datagram(&data, now, WALL, &mut fx.metrics, &mut fx.sink);
            assert!(delivered.is_none());
        }

        // one SSACK per summary datagram, even for repeats
        assert_eq!(fx.sink.sent.len(), 2);
        assert!(fx
            .sink
            .sent
            .iter()
            .all(|packet| packet.channel_type == ChannelType::Session));

        let summary = fx.metrics.summary.as_ref().unwrap();
        assert_eq!(summary.total_reliable_sent, 10);
        assert_eq!(summary.total_unreliable_sent, 5);
    }

    #[test]
    fn malformed_summary_is_not_acked() {
        let mut fx = Fixture::new();

        let packet = Packet {
            channel_type: ChannelType::Session,
            seq_num: 0,
            time_stamp: WALL,
            ack_num: 0,
            payload: b"not json".to_vec().into(),
        };

        let now = fx.t0;
        fx.receiver
            .handle_datagram(&packet.encode(), now, WALL, &mut fx.metrics, &mut fx.sink);

        assert!(fx.sink.sent.is_empty());
        assert!(fx.metrics.summary.is_none());
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let mut fx = Fixture::new();

        let now = fx.t0;
        assert!(fx
            .receiver
            .handle_datagram(&[1, 2, 3], now, WALL, &mut fx.metrics, &mut fx.sink)
            .is_none());
        assert!(fx.sink.sent.is_empty());
        assert_eq!(fx.metrics.reliable.packets_received, 0);
    }

    #[test]
    fn latency_is_measured_against_the_timestamp() {
        let fx_wall = WALL + 42;
        let mut fx = Fixture::new();

        let packet = Packet {
            channel_type: ChannelType::Reliable,
            seq_num: 7,
            time_stamp: WALL,
            ack_num: 0,
            payload: b"p".to_vec().into(),
        };

        let now = fx.t0;
        fx.receiver
            .handle_datagram(&packet.encode(), now, fx_wall, &mut fx.metrics, &mut fx.sink);

        let delivery = fx.receiver.pop_delivery().unwrap();
        assert_eq!(delivery.latency_ms, 42.0);
        assert_eq!(fx.metrics.reliable.latencies_ms, vec![42.0]);

        // send and receive in the same millisecond is a real 0ms sample
        let packet = Packet {
            channel_type: ChannelType::Reliable,
            seq_num: 8,
            time_stamp: fx_wall,
            ack_num: 0,
            payload: b"q".to_vec().into(),
        };
        fx.receiver
            .handle_datagram(&packet.encode(), now, fx_wall, &mut fx.metrics, &mut fx.sink);

        let delivery = fx.receiver.pop_delivery().unwrap();
        assert_eq!(delivery.latency_ms, 0.0);
        assert_eq!(fx.metrics.reliable.latencies_ms, vec![42.0, 0.0]);

        // a zero timestamp means "no timestamp"; nothing is sampled
        let packet = Packet {
            channel_type: ChannelType::Reliable,
            seq_num: 9,
            time_stamp: 0,
            ack_num: 0,
            payload: b"r".to_vec().into(),
        };
        fx.receiver
            .handle_datagram(&packet.encode(), now, fx_wall, &mut fx.metrics, &mut fx.sink);

        assert!(fx.receiver.pop_delivery().is_some());
        assert_eq!(fx.metrics.reliable.latencies_ms, vec![42.0, 0.0]);
    }
}
