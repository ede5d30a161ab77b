//! Per-channel sequencing state.

use std::collections::VecDeque;

use super::IncomingCommand;

/// Number of reliable windows the 16-bit sequence space is divided into.
pub(crate) const RELIABLE_WINDOWS: u16 = 16;
/// Sequence numbers per reliable window.
pub(crate) const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
/// Windows ahead of the current receive window that may hold traffic.
pub(crate) const FREE_RELIABLE_WINDOWS: u16 = 8;

pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    /// Sorted by (reliable, unreliable) sequence under the window shift.
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
    /// Outstanding reliable commands per window, bounded by
    /// `RELIABLE_WINDOW_SIZE` each.
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    pub used_reliable_windows: u16,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: VecDeque::new(),
            incoming_unreliable_commands: VecDeque::new(),
            reliable_windows: [0; RELIABLE_WINDOWS as usize],
            used_reliable_windows: 0,
        }
    }

    /// The window a received sequence number falls in, shifted past
    /// `RELIABLE_WINDOWS` when it has wrapped relative to the next expected
    /// sequence number.
    pub fn shifted_window(&self, sequence: u16) -> u16 {
        let mut window = sequence / RELIABLE_WINDOW_SIZE;
        if sequence < self.incoming_reliable_sequence_number {
            window += RELIABLE_WINDOWS;
        }
        window
    }

    pub fn current_window(&self) -> u16 {
        self.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE
    }

    /// Whether a sequenced command may enter the incoming lists: stale and
    /// far-future sequence numbers are both refused.
    pub fn accepts_sequence(&self, sequence: u16) -> bool {
        let window = self.shifted_window(sequence);
        let current = self.current_window();
        window >= current && window < current + FREE_RELIABLE_WINDOWS - 1
    }

    /// Whether an acknowledgement may be produced for a received sequence
    /// number. The boundary windows adjacent to the lap point are refused so
    /// a stale ack can never be mistaken for one from the next lap.
    pub fn accepts_ack(&self, sequence: u16) -> bool {
        let window = self.shifted_window(sequence);
        let current = self.current_window();
        !(window >= current + FREE_RELIABLE_WINDOWS - 1
            && window <= current + FREE_RELIABLE_WINDOWS)
    }
}

/// Mask of the windows that must be clear of outstanding commands before a
/// send may start filling `window`; spans the free windows plus a guard band
/// on either side, wrapped around the 16-window ring.
pub(crate) fn wrap_guard_mask(window: u16) -> u16 {
    let span = (1u32 << (FREE_RELIABLE_WINDOWS + 2)) - 1;
    ((span << window) | (span >> (RELIABLE_WINDOWS - window))) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_window_acceptance() {
        let mut ch = Channel::new();
        assert!(ch.accepts_sequence(1));
        assert!(ch.accepts_sequence((FREE_RELIABLE_WINDOWS - 1) * RELIABLE_WINDOW_SIZE - 1));
        // The last free window is refused on enqueue to keep clear of the lap
        // boundary.
        assert!(!ch.accepts_sequence((FREE_RELIABLE_WINDOWS - 1) * RELIABLE_WINDOW_SIZE));

        // Stale sequence numbers (behind the expected one, same lap) land in
        // shifted windows past the free span.
        ch.incoming_reliable_sequence_number = 5 * RELIABLE_WINDOW_SIZE;
        assert!(!ch.accepts_sequence(2));
        assert!(ch.accepts_sequence(5 * RELIABLE_WINDOW_SIZE + 1));

        // Wrapped sequence numbers near zero are acceptable again once the
        // receive window approaches the top of the sequence space.
        ch.incoming_reliable_sequence_number = 15 * RELIABLE_WINDOW_SIZE;
        assert!(ch.accepts_sequence(3));
    }

    #[test]
    fn ack_refuses_boundary_windows() {
        let ch = Channel::new();
        assert!(ch.accepts_ack(1));
        assert!(!ch.accepts_ack((FREE_RELIABLE_WINDOWS - 1) * RELIABLE_WINDOW_SIZE));
        assert!(!ch.accepts_ack(FREE_RELIABLE_WINDOWS * RELIABLE_WINDOW_SIZE));
        assert!(ch.accepts_ack((FREE_RELIABLE_WINDOWS + 1) * RELIABLE_WINDOW_SIZE));
    }

    #[test]
    fn wrap_guard_wraps_around_ring() {
        assert_eq!(wrap_guard_mask(0), 0x03FF);
        assert_eq!(wrap_guard_mask(8), 0xFF03);
    }
}
