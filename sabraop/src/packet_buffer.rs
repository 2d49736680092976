//! Retransmit ring buffer.
//!
//! A fixed-capacity ring indexed by `sequence & (capacity - 1)`;
//! capacity is rounded up to a power of two. Writing past capacity
//! overwrites the oldest entries. `read` only returns the stored bytes
//! when the slot still holds the requested sequence number.

/// Default capacity, packets.
pub const DEFAULT_CAPACITY: usize = 1000;

pub struct PacketBuffer {
    slots: Vec<Option<(u16, Vec<u8>)>>,
    mask: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        PacketBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn write(&mut self, sequence: u16, packet: &[u8]) {
        let slot = sequence as usize & self.mask;
        self.slots[slot] = Some((sequence, packet.to_vec()));
    }

    /// The stored packet for `sequence`, if it has not been evicted.
    pub fn read(&self, sequence: u16) -> Option<&[u8]> {
        let slot = sequence as usize & self.mask;
        match &self.slots[slot] {
            Some((seq, data)) if *seq == sequence => Some(data),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_keeps_newest() {
        let mut pb = PacketBuffer::new(4);
        // capacité 4 + 2 écritures de trop : les deux plus vieilles
        // sont perdues.
        for seq in 10u16..16 {
            pb.write(seq, &[seq as u8]);
        }
        assert!(pb.read(10).is_none());
        assert!(pb.read(11).is_none());
        for seq in 12u16..16 {
            assert_eq!(pb.read(seq), Some([seq as u8].as_slice()));
        }
    }

    #[test]
    fn read_checks_stored_sequence() {
        let mut pb = PacketBuffer::new(4);
        pb.write(3, b"abc");
        // 7 tombe dans le même slot que 3 mais n'y est pas.
        assert!(pb.read(7).is_none());
        assert_eq!(pb.read(3), Some(b"abc".as_slice()));
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(PacketBuffer::new(1000).capacity(), 1024);
        assert_eq!(PacketBuffer::new(4).capacity(), 4);
    }

    #[test]
    fn clear_empties_everything() {
        let mut pb = PacketBuffer::new(4);
        pb.write(1, b"x");
        pb.clear();
        assert!(pb.read(1).is_none());
    }
}
