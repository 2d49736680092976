//! Reference-counted wire packets.

use std::sync::Arc;

/// An immutable control packet. Cloning shares the buffer.
#[derive(Clone)]
pub struct Packet {
    data: Arc<[u8]>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet {
            data: Arc::from(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Packet::new(data)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet({} bytes)", self.data.len())
    }
}
