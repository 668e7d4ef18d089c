//! Packet Orderer (C2, spec §4.2): per-InstanceKey reorder buffer with
//! timeout-based gap skip.

use crate::clock::SharedClock;
use crate::model::{EventEnvelope, InstanceKey};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Fresh,
    Receiving,
    StreamClosed,
}

struct InstanceOrderState {
    state: StreamState,
    expected_sequence: u64,
    buffer: BTreeMap<u64, (EventEnvelope, SystemTime)>,
    waiting_since: Option<SystemTime>,
}

impl InstanceOrderState {
    fn fresh() -> Self {
        Self {
            state: StreamState::Fresh,
            expected_sequence: 0,
            buffer: BTreeMap::new(),
            waiting_since: None,
        }
    }
}

/// Fired when a gap could not be filled before `packetOrderingTimeout`
/// elapsed and had to be skipped.
pub struct OutOfOrderEvent {
    pub account_id: String,
    pub instance_index: u32,
    pub expected: u64,
    pub actual: u64,
}

pub struct PacketOrderer {
    clock: SharedClock,
    ordering_timeout: Duration,
    states: Mutex<HashMap<InstanceKey, InstanceOrderState>>,
}

impl PacketOrderer {
    pub fn new(clock: SharedClock, ordering_timeout: Duration) -> Self {
        Self {
            clock,
            ordering_timeout,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Restores order for a single inbound packet, returning the
    /// in-order packets that are now ready for dispatch (possibly more
    /// than one, if this packet filled a gap) plus an out-of-order
    /// notification if a gap had to be skipped.
    pub fn restore_order(&self, packet: EventEnvelope) -> (Vec<EventEnvelope>, Option<OutOfOrderEvent>) {
        let Some(sequence_number) = packet.sequence_number else {
            return (vec![packet], None);
        };

        let key = InstanceKey::new(packet.account_id.clone(), packet.instance_index(), packet.host.clone());
        let account_id = key.account_id.clone();
        let instance_index = key.instance_number;
        let mut states = self.states.lock();
        let state = states.entry(key).or_insert_with(InstanceOrderState::fresh);
        state.state = StreamState::Receiving;

        let mut ready = Vec::new();
        let mut out_of_order = None;

        match sequence_number.cmp(&state.expected_sequence) {
            std::cmp::Ordering::Equal => {
                ready.push(packet);
                state.expected_sequence += 1;
                state.waiting_since = None;
                drain_contiguous(state, &mut ready);
            }
            std::cmp::Ordering::Greater => {
                let now = self.clock.now();
                state.waiting_since.get_or_insert(now);
                state.buffer.insert(sequence_number, (packet, now));

                if let Some(started) = state.waiting_since
                    && now.duration_since(started).unwrap_or(Duration::ZERO) >= self.ordering_timeout
                    && let Some(&smallest) = state.buffer.keys().next()
                {
                    out_of_order = Some(OutOfOrderEvent {
                        account_id: account_id.clone(),
                        instance_index,
                        expected: state.expected_sequence,
                        actual: smallest,
                    });
                    state.expected_sequence = smallest;
                    state.waiting_since = None;
                    drain_contiguous(state, &mut ready);
                }
            }
            std::cmp::Ordering::Less => {
                // already delivered; drop.
            }
        }

        (ready, out_of_order)
    }

    /// Notifies the orderer that an instance's stream was closed,
    /// purging any buffered packets for it (§4.2).
    pub fn on_stream_closed(&self, key: &InstanceKey) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(key) {
            state.state = StreamState::StreamClosed;
            state.buffer.clear();
            state.waiting_since = None;
        }
    }

    pub fn remove(&self, key: &InstanceKey) {
        self.states.lock().remove(key);
    }
}

fn drain_contiguous(state: &mut InstanceOrderState, ready: &mut Vec<EventEnvelope>) {
    while let Some((packet, _)) = state.buffer.remove(&state.expected_sequence) {
        ready.push(packet);
        state.expected_sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use std::time::UNIX_EPOCH;

    fn packet(account: &str, seq: u64) -> EventEnvelope {
        EventEnvelope {
            event_type: "update".into(),
            account_id: account.into(),
            instance_index: Some(0),
            host: None,
            sequence_number: Some(seq),
            synchronization_id: None,
            payload: Default::default(),
        }
    }

    #[test]
    fn passes_through_unsequenced_packets() {
        let orderer = PacketOrderer::new(crate::clock::system_clock(), Duration::from_secs(60));
        let mut p = packet("A", 0);
        p.sequence_number = None;
        let (ready, oo) = orderer.restore_order(p);
        assert_eq!(ready.len(), 1);
        assert!(oo.is_none());
    }

    #[test]
    fn reorders_out_of_sequence_arrival() {
        let orderer = PacketOrderer::new(crate::clock::system_clock(), Duration::from_secs(60));
        let mut seen = Vec::new();

        let (ready, _) = orderer.restore_order(packet("A", 0));
        seen.extend(ready.into_iter().map(|p| p.sequence_number.unwrap()));
        let (ready, _) = orderer.restore_order(packet("A", 1));
        seen.extend(ready.into_iter().map(|p| p.sequence_number.unwrap()));
        // 3 arrives before 2.
        let (ready, _) = orderer.restore_order(packet("A", 3));
        seen.extend(ready.into_iter().map(|p| p.sequence_number.unwrap()));
        assert!(seen.iter().all(|&s| s != 3));
        let (ready, _) = orderer.restore_order(packet("A", 2));
        seen.extend(ready.into_iter().map(|p| p.sequence_number.unwrap()));

        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn skips_gap_after_timeout() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let orderer = PacketOrderer::new(clock.clone(), Duration::from_secs(60));

        orderer.restore_order(packet("A", 0));
        orderer.restore_order(packet("A", 1));
        // seq 3 arrives, 2 is missing.
        let (ready, oo) = orderer.restore_order(packet("A", 3));
        assert!(ready.is_empty());
        assert!(oo.is_none());

        clock.advance(Duration::from_secs(61));
        // a later packet for the same instance re-triggers the check.
        let (ready, oo) = orderer.restore_order(packet("A", 3));
        assert!(oo.is_some(), "gap should be skipped after timeout");
        let seqs: Vec<_> = ready.iter().map(|p| p.sequence_number.unwrap()).collect();
        assert_eq!(seqs, vec![3]);
    }

    #[test]
    fn drops_already_delivered_packet() {
        let orderer = PacketOrderer::new(crate::clock::system_clock(), Duration::from_secs(60));
        orderer.restore_order(packet("A", 0));
        orderer.restore_order(packet("A", 1));
        let (ready, _) = orderer.restore_order(packet("A", 0));
        assert!(ready.is_empty());
    }
}
