//! Adaptive jitter buffer
//!
//! Absorbs network timing variance for one inbound stream of encoded
//! packets. Packets are kept sorted by sequence number and handed out
//! strictly in order: a missing packet withholds delivery until it arrives
//! or the packets behind it age out of the buffer.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::constants::{
    DEFAULT_FRAME_SIZE_MS, DEFAULT_JITTER_MAX_MS, DEFAULT_JITTER_MIN_MS,
    DEFAULT_JITTER_TARGET_MS, LATE_PACKET_THRESHOLD_MS,
};

/// Inter-arrival samples kept for adaptation
const JITTER_WINDOW: usize = 50;

/// Samples needed before the target is adjusted
const MIN_ADAPT_SAMPLES: usize = 10;

/// Target adjustment per adaptation step
const ADAPT_STEP_MS: u32 = 10;

/// Jitter buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub min_buffer_ms: u32,
    pub max_buffer_ms: u32,
    pub target_buffer_ms: u32,
    pub late_packet_threshold_ms: u32,
    /// Nominal duration of one packet
    pub frame_duration_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_buffer_ms: DEFAULT_JITTER_MIN_MS,
            max_buffer_ms: DEFAULT_JITTER_MAX_MS,
            target_buffer_ms: DEFAULT_JITTER_TARGET_MS,
            late_packet_threshold_ms: LATE_PACKET_THRESHOLD_MS,
            frame_duration_ms: DEFAULT_FRAME_SIZE_MS,
        }
    }
}

/// One buffered encoded packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub sequence: u32,
    /// Arrival time in microseconds since the buffer was created
    pub timestamp_us: u64,
    pub frame_size_samples: u32,
    pub is_valid: bool,
    arrival: Instant,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterStatistics {
    pub current_size_ms: u32,
    pub packets_buffered: usize,
    pub packets_received: u64,
    pub packets_dropped_late: u64,
    pub packets_dropped_duplicate: u64,
    pub packets_reordered: u64,
    pub average_jitter_ms: f64,
    pub max_jitter_ms: f64,
    pub target_buffer_ms: u32,
}

struct State {
    queue: VecDeque<Packet>,
    expected_sequence: u32,
    last_arrival: Option<Instant>,
    jitter_samples: VecDeque<f64>,
    target_buffer_ms: u32,
    primed: bool,
}

/// Sequence-ordered packet buffer with an adaptive playout target.
///
/// The queue and the statistics sit behind separate locks; the statistics
/// lock is only ever taken while holding the queue lock, never the reverse.
pub struct JitterBuffer {
    config: JitterConfig,
    epoch: Instant,
    state: Mutex<State>,
    stats: Mutex<JitterStatistics>,
}

impl JitterBuffer {
    pub fn new(mut config: JitterConfig) -> Self {
        if config.max_buffer_ms < config.min_buffer_ms {
            config.max_buffer_ms = config.min_buffer_ms;
        }
        config.frame_duration_ms = config.frame_duration_ms.max(1);
        let target = config
            .target_buffer_ms
            .clamp(config.min_buffer_ms, config.max_buffer_ms);

        Self {
            epoch: Instant::now(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                expected_sequence: 0,
                last_arrival: None,
                jitter_samples: VecDeque::with_capacity(JITTER_WINDOW),
                target_buffer_ms: target,
                primed: false,
            }),
            stats: Mutex::new(JitterStatistics {
                target_buffer_ms: target,
                ..Default::default()
            }),
            config,
        }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Reference instant for packet timestamps
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Buffer a packet that arrived now. Returns whether it was accepted.
    pub fn add_packet(&self, data: Bytes, sequence: u32, frame_size_samples: u32) -> bool {
        self.add_packet_at(data, sequence, frame_size_samples, Instant::now())
    }

    /// Buffer a packet with an explicit arrival time.
    ///
    /// Packets already played out, packets older than the lateness threshold
    /// relative to the oldest buffered packet, and duplicates are dropped and
    /// counted.
    pub fn add_packet_at(
        &self,
        data: Bytes,
        sequence: u32,
        frame_size_samples: u32,
        now: Instant,
    ) -> bool {
        let mut state = self.state.lock();

        if sequence < state.expected_sequence {
            self.stats.lock().packets_dropped_late += 1;
            tracing::debug!(sequence, "Dropped packet behind playout");
            return false;
        }

        if let Some(oldest) = state.queue.front() {
            let age_ms = now.saturating_duration_since(oldest.arrival).as_millis();
            if age_ms > u128::from(self.config.late_packet_threshold_ms) {
                self.stats.lock().packets_dropped_late += 1;
                tracing::debug!(sequence, age_ms = age_ms as u64, "Dropped late packet");
                return false;
            }
        }

        self.update_jitter(&mut state, now);

        let index = match state.queue.binary_search_by_key(&sequence, |p| p.sequence) {
            Ok(_) => {
                self.stats.lock().packets_dropped_duplicate += 1;
                return false;
            }
            Err(index) => index,
        };
        let reordered = index != state.queue.len();

        state.queue.insert(
            index,
            Packet {
                data,
                sequence,
                timestamp_us: now.saturating_duration_since(self.epoch).as_micros() as u64,
                frame_size_samples,
                is_valid: true,
                arrival: now,
            },
        );

        {
            let mut stats = self.stats.lock();
            stats.packets_received += 1;
            if reordered {
                stats.packets_reordered += 1;
            }
            self.refresh_gauges(&state, &mut stats);
        }

        self.adapt_locked(&mut state);
        true
    }

    /// Take the next in-sequence packet, if it is at the head.
    pub fn get_next_packet(&self) -> Option<Packet> {
        self.get_next_packet_at(Instant::now())
    }

    /// [`get_next_packet`](Self::get_next_packet) with an explicit clock.
    ///
    /// Aged packets are purged first so a packet that never arrives cannot
    /// block playout forever.
    pub fn get_next_packet_at(&self, now: Instant) -> Option<Packet> {
        let mut state = self.state.lock();
        self.purge_locked(&mut state, now);

        let expected = state.expected_sequence;
        if state.queue.front().map(|p| p.sequence) != Some(expected) {
            return None;
        }

        let packet = state.queue.pop_front()?;
        state.expected_sequence = expected.wrapping_add(1);
        if state.queue.is_empty() {
            state.primed = false;
        }

        let mut stats = self.stats.lock();
        self.refresh_gauges(&state, &mut stats);
        Some(packet)
    }

    /// Drop every packet older than the lateness threshold.
    ///
    /// Returns the number of packets dropped. The expected sequence moves
    /// past the dropped packets.
    pub fn purge_late_packets(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        self.purge_locked(&mut state, now)
    }

    /// Whether enough audio is buffered to start or continue playout
    pub fn is_ready(&self) -> bool {
        let mut state = self.state.lock();
        if !state.primed {
            let buffered_ms = self.buffered_ms(&state);
            state.primed = !state.queue.is_empty() && buffered_ms >= state.target_buffer_ms;
        }
        state.primed
    }

    /// Recompute the playout target from recent inter-arrival jitter.
    pub fn adapt(&self) {
        let mut state = self.state.lock();
        self.adapt_locked(&mut state);
    }

    pub fn target_buffer_ms(&self) -> u32 {
        self.state.lock().target_buffer_ms
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn statistics(&self) -> JitterStatistics {
        self.stats.lock().clone()
    }

    /// Clear buffered packets, sequence tracking, jitter history and stats
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.expected_sequence = 0;
        state.last_arrival = None;
        state.jitter_samples.clear();
        state.primed = false;
        state.target_buffer_ms = self
            .config
            .target_buffer_ms
            .clamp(self.config.min_buffer_ms, self.config.max_buffer_ms);

        *self.stats.lock() = JitterStatistics {
            target_buffer_ms: state.target_buffer_ms,
            ..Default::default()
        };
    }

    fn purge_locked(&self, state: &mut State, now: Instant) -> usize {
        let threshold = u128::from(self.config.late_packet_threshold_ms);
        let before = state.queue.len();
        let mut newest_purged = None;

        state.queue.retain(|packet| {
            let age_ms = now.saturating_duration_since(packet.arrival).as_millis();
            if age_ms > threshold {
                newest_purged = Some(packet.sequence);
                false
            } else {
                true
            }
        });

        let purged = before - state.queue.len();
        if purged == 0 {
            return 0;
        }

        if let Some(sequence) = newest_purged {
            let next = sequence.wrapping_add(1);
            if next > state.expected_sequence {
                state.expected_sequence = next;
            }
        }
        // Anything left behind the new expected sequence can never play
        let expected = state.expected_sequence;
        let stale = state.queue.iter().take_while(|p| p.sequence < expected).count();
        state.queue.drain(..stale);
        if state.queue.is_empty() {
            state.primed = false;
        }

        let mut stats = self.stats.lock();
        stats.packets_dropped_late += (purged + stale) as u64;
        self.refresh_gauges(state, &mut stats);
        tracing::debug!(purged = purged + stale, expected, "Purged late packets");
        purged + stale
    }

    fn update_jitter(&self, state: &mut State, now: Instant) {
        if let Some(last) = state.last_arrival {
            let inter_arrival_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            let jitter_ms = (inter_arrival_ms - f64::from(self.config.frame_duration_ms)).abs();

            if state.jitter_samples.len() == JITTER_WINDOW {
                state.jitter_samples.pop_front();
            }
            state.jitter_samples.push_back(jitter_ms);

            let mut stats = self.stats.lock();
            if jitter_ms > stats.max_jitter_ms {
                stats.max_jitter_ms = jitter_ms;
            }
        }
        state.last_arrival = Some(now);
    }

    fn adapt_locked(&self, state: &mut State) {
        if state.jitter_samples.len() < MIN_ADAPT_SAMPLES {
            return;
        }

        let average =
            state.jitter_samples.iter().sum::<f64>() / state.jitter_samples.len() as f64;
        let target = state.target_buffer_ms;

        let new_target = if average > f64::from(target) {
            (target + ADAPT_STEP_MS).min(self.config.max_buffer_ms)
        } else if average < f64::from(target) / 2.0 {
            target
                .saturating_sub(ADAPT_STEP_MS)
                .max(self.config.min_buffer_ms)
        } else {
            target
        };

        if new_target != target {
            tracing::trace!(from = target, to = new_target, average, "Jitter target adapted");
        }
        state.target_buffer_ms = new_target;

        let mut stats = self.stats.lock();
        stats.average_jitter_ms = average;
        stats.target_buffer_ms = new_target;
    }

    fn buffered_ms(&self, state: &State) -> u32 {
        (state.queue.len() as u32).saturating_mul(self.config.frame_duration_ms)
    }

    fn refresh_gauges(&self, state: &State, stats: &mut JitterStatistics) {
        stats.packets_buffered = state.queue.len();
        stats.current_size_ms = self.buffered_ms(state);
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn payload(seq: u32) -> Bytes {
        Bytes::from(seq.to_be_bytes().to_vec())
    }

    fn drain(buffer: &JitterBuffer, now: Instant) -> Vec<u32> {
        std::iter::from_fn(|| buffer.get_next_packet_at(now))
            .map(|p| p.sequence)
            .collect()
    }

    #[test]
    fn test_duplicate_rejected() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        for seq in 0..3 {
            assert!(buffer.add_packet_at(payload(seq), seq, 960, t0));
        }
        assert!(!buffer.add_packet_at(payload(1), 1, 960, t0));

        assert_eq!(drain(&buffer, t0), vec![0, 1, 2]);
        let stats = buffer.statistics();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_dropped_duplicate, 1);
    }

    #[test]
    fn test_reorder() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(2), 2, 960, t0);
        buffer.add_packet_at(payload(0), 0, 960, t0);
        buffer.add_packet_at(payload(1), 1, 960, t0);

        assert_eq!(drain(&buffer, t0), vec![0, 1, 2]);
        assert_eq!(buffer.statistics().packets_reordered, 2);
    }

    #[test]
    fn test_gap_withholds_delivery() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(0), 0, 960, t0);
        buffer.add_packet_at(payload(2), 2, 960, t0);

        assert_eq!(buffer.get_next_packet_at(t0).map(|p| p.sequence), Some(0));
        assert!(buffer.get_next_packet_at(t0).is_none());

        buffer.add_packet_at(payload(1), 1, 960, t0 + Duration::from_millis(5));
        assert_eq!(drain(&buffer, t0 + Duration::from_millis(5)), vec![1, 2]);
    }

    #[test]
    fn test_late_packet_dropped() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(1), 1, 960, t0);
        // Arrives 150 ms after the oldest buffered packet
        assert!(!buffer.add_packet_at(payload(2), 2, 960, t0 + Duration::from_millis(150)));
        assert_eq!(buffer.statistics().packets_dropped_late, 1);
    }

    #[test]
    fn test_played_out_sequence_dropped() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(0), 0, 960, t0);
        buffer.get_next_packet_at(t0);
        assert!(!buffer.add_packet_at(payload(0), 0, 960, t0));
        assert_eq!(buffer.statistics().packets_dropped_late, 1);
    }

    #[test]
    fn test_purge_unblocks_missing_packet() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        // Sequence 0 never arrives
        buffer.add_packet_at(payload(1), 1, 960, t0);
        buffer.add_packet_at(payload(2), 2, 960, t0 + Duration::from_millis(20));
        assert!(buffer.get_next_packet_at(t0 + Duration::from_millis(20)).is_none());

        buffer.add_packet_at(payload(3), 3, 960, t0 + Duration::from_millis(90));

        // Packets 1 and 2 age out; playout resumes at 3
        let later = t0 + Duration::from_millis(150);
        assert_eq!(drain(&buffer, later), vec![3]);
        assert_eq!(buffer.statistics().packets_dropped_late, 2);
    }

    #[test]
    fn test_packet_behind_gap_after_purge() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        // 0 is missing; 1 and 2 age out and take expected to 3
        buffer.add_packet_at(payload(1), 1, 960, t0);
        buffer.add_packet_at(payload(2), 2, 960, t0);
        let later = t0 + Duration::from_millis(150);
        assert_eq!(buffer.purge_late_packets(later), 2);
        assert!(buffer.is_empty());

        // Newer than anything buffered, but already skipped by playout
        assert!(!buffer.add_packet_at(payload(0), 0, 960, later));
        assert!(!buffer.add_packet_at(payload(2), 2, 960, later));
        assert_eq!(buffer.statistics().packets_dropped_late, 4);
        assert_eq!(buffer.statistics().packets_dropped_duplicate, 0);

        assert!(buffer.add_packet_at(payload(4), 4, 960, later));
        assert!(buffer.add_packet_at(payload(3), 3, 960, later));
        assert_eq!(drain(&buffer, later), vec![3, 4]);
    }

    #[test]
    fn test_earlier_sequence_inserted_before_head() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(2), 2, 960, t0);
        buffer.add_packet_at(payload(3), 3, 960, t0 + Duration::from_millis(20));

        // Older sequence than the head, still within the threshold
        assert!(buffer.add_packet_at(payload(1), 1, 960, t0 + Duration::from_millis(50)));
        assert!(buffer.add_packet_at(payload(0), 0, 960, t0 + Duration::from_millis(60)));
        let stats = buffer.statistics();
        assert_eq!(stats.packets_reordered, 2);
        assert_eq!(stats.packets_dropped_late, 0);

        assert_eq!(drain(&buffer, t0 + Duration::from_millis(60)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_earlier_sequence_past_threshold_dropped() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(1), 1, 960, t0);
        buffer.add_packet_at(payload(2), 2, 960, t0 + Duration::from_millis(20));

        // Sequence 0 would become the head, but the oldest entry is 120 ms old
        assert!(!buffer.add_packet_at(payload(0), 0, 960, t0 + Duration::from_millis(120)));
        let stats = buffer.statistics();
        assert_eq!(stats.packets_dropped_late, 1);
        assert_eq!(stats.packets_buffered, 2);
        assert!(buffer.get_next_packet_at(t0 + Duration::from_millis(30)).is_none());
    }

    #[test]
    fn test_adapt_widens_on_jitter() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();
        let initial = buffer.target_buffer_ms();

        // 20 ms frames arriving alternately 0 ms and 200 ms apart
        let mut at = t0;
        for seq in 0..20u32 {
            at += Duration::from_millis(if seq % 2 == 0 { 0 } else { 200 });
            buffer.add_packet_at(payload(seq), seq, 960, at);
            buffer.get_next_packet_at(at);
        }

        assert!(buffer.target_buffer_ms() > initial);
        assert!(buffer.target_buffer_ms() <= buffer.config().max_buffer_ms);
    }

    #[test]
    fn test_adapt_narrows_on_steady_arrival() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        let mut at = t0;
        for seq in 0..40u32 {
            at += Duration::from_millis(20);
            buffer.add_packet_at(payload(seq), seq, 960, at);
            buffer.get_next_packet_at(at);
        }

        assert_eq!(buffer.target_buffer_ms(), buffer.config().min_buffer_ms);
    }

    #[test]
    fn test_priming() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();

        buffer.add_packet_at(payload(0), 0, 960, t0);
        assert!(!buffer.is_ready());
        buffer.add_packet_at(payload(1), 1, 960, t0);
        buffer.add_packet_at(payload(2), 2, 960, t0);
        assert!(buffer.is_ready());

        drain(&buffer, t0);
        assert!(!buffer.is_ready());
    }

    #[test]
    fn test_reset() {
        let buffer = JitterBuffer::default();
        let t0 = buffer.epoch();
        buffer.add_packet_at(payload(0), 0, 960, t0);
        buffer.get_next_packet_at(t0);
        buffer.add_packet_at(payload(1), 1, 960, t0);

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.statistics().packets_received, 0);
        assert!(buffer.add_packet_at(payload(0), 0, 960, t0));
    }

    proptest! {
        #[test]
        fn prop_delivery_strictly_increasing(
            sequences in proptest::collection::vec(0u32..64, 1..128),
            gaps in proptest::collection::vec(0u64..60, 128),
        ) {
            let buffer = JitterBuffer::default();
            let mut now = buffer.epoch();
            let mut delivered = Vec::new();

            for (i, seq) in sequences.iter().enumerate() {
                now += Duration::from_millis(gaps[i]);
                buffer.add_packet_at(payload(*seq), *seq, 960, now);
                if i % 3 == 0 {
                    delivered.extend(drain(&buffer, now).into_iter());
                }
            }
            delivered.extend(drain(&buffer, now).into_iter());

            for pair in delivered.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }

        #[test]
        fn prop_aged_packets_never_delivered(age_ms in 101u64..1000) {
            let buffer = JitterBuffer::default();
            let t0 = buffer.epoch();

            buffer.add_packet_at(payload(5), 5, 960, t0);
            let later = t0 + Duration::from_millis(age_ms);
            prop_assert!(buffer.get_next_packet_at(later).is_none());
            prop_assert_eq!(buffer.statistics().packets_dropped_late, 1);
        }
    }
}
