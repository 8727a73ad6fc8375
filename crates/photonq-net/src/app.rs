//! Application hook points.
//!
//! Applications are clients of the network manager's request API. The core
//! defines only the hook surface plus two reference implementations used
//! by experiments and tests: a recording app that snapshots every
//! entangled memory it is handed, and the key-manager app that collects
//! finished QKD keys.

use crate::network::Reservation;
use crate::resource::MemoryInfo;

/// Callbacks a node invokes on its installed application.
pub trait Application: std::fmt::Debug {
    /// The initiator's reservation was approved or rejected.
    fn get_reserve_res(&mut self, reservation: &Reservation, accepted: bool);

    /// This node is the responder of an approved reservation.
    fn get_other_reservation(&mut self, _reservation: &Reservation) {}

    /// A memory reached a terminal bookkeeping state with no rule left to
    /// consume it.
    fn get_memory(&mut self, _info: &MemoryInfo, _now: u64) {}

    /// A finished key arrived from the QKD stack.
    fn pop_key(&mut self, _key: Vec<u8>, _now: u64) {}

    /// Concrete-type access for experiment readout.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Records every callback for later inspection.
#[derive(Debug, Default)]
pub struct RecordingApp {
    /// Reservation outcomes seen, in order.
    pub reserve_results: Vec<(Reservation, bool)>,
    /// Reservations for which this node was the responder.
    pub other_reservations: Vec<Reservation>,
    /// Snapshots of entangled memories handed to the app:
    /// (slot index, remote node, fidelity, time).
    pub entangled_memories: Vec<(usize, String, f64, u64)>,
}

impl Application for RecordingApp {
    fn get_reserve_res(&mut self, reservation: &Reservation, accepted: bool) {
        self.reserve_results.push((reservation.clone(), accepted));
    }

    fn get_other_reservation(&mut self, reservation: &Reservation) {
        self.other_reservations.push(reservation.clone());
    }

    fn get_memory(&mut self, info: &MemoryInfo, now: u64) {
        if info.state.is_entangled() {
            if let Some(remote) = &info.remote_node {
                self.entangled_memories
                    .push((info.index, remote.clone(), info.fidelity, now));
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Collects finished keys from the QKD stack.
#[derive(Debug, Default)]
pub struct KeyManagerApp {
    /// Keys in arrival order.
    pub keys: Vec<Vec<u8>>,
    /// Arrival times (ps).
    pub times: Vec<u64>,
}

impl Application for KeyManagerApp {
    fn get_reserve_res(&mut self, _reservation: &Reservation, _accepted: bool) {}

    fn pop_key(&mut self, key: Vec<u8>, now: u64) {
        self.keys.push(key);
        self.times.push(now);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ReservationId;
    use crate::resource::MemoryState;

    #[test]
    fn recording_app_snapshots_entangled_memories() {
        let mut app = RecordingApp::default();
        let mut info = MemoryInfo::new(3);
        info.to_entangled("r2".into(), "r2.memo[0]".into(), 0.9, 1_000, false);
        app.get_memory(&info, 1_000);

        let mut raw = MemoryInfo::new(4);
        raw.state = MemoryState::Raw;
        app.get_memory(&raw, 2_000);

        assert_eq!(app.entangled_memories.len(), 1);
        assert_eq!(app.entangled_memories[0].1, "r2");
    }

    #[test]
    fn key_manager_collects_keys() {
        let mut app = KeyManagerApp::default();
        app.pop_key(vec![1, 0, 1], 5);
        app.pop_key(vec![0, 0, 1], 9);
        assert_eq!(app.keys.len(), 2);
        assert_eq!(app.times, vec![5, 9]);
    }

    #[test]
    fn reserve_results_recorded_in_order() {
        let mut app = RecordingApp::default();
        let r = Reservation::new(
            ReservationId {
                node: "r1".into(),
                seq: 0,
            },
            "r1".into(),
            "r2".into(),
            10,
            20,
            1,
            0.9,
        );
        app.get_reserve_res(&r, false);
        app.get_reserve_res(&r, true);
        assert_eq!(
            app.reserve_results.iter().map(|(_, a)| *a).collect::<Vec<_>>(),
            vec![false, true]
        );
    }
}
