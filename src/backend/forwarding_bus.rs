use std::fmt;

use crate::instructions::instructions::{RegisterType, WordType};

/// What a broadcast is addressed to. Register results wake up consumers of a
/// physical register; address results resolve a load-store queue entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BusTag {
    Register(RegisterType),
    LoadStore(u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CDBBroadcast {
    pub tag: BusTag,
    pub value: WordType,
    pub zero: bool,
    // the reorder buffer entry of the producer
    pub rob_seq: u64,
}

impl fmt::Display for CDBBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            BusTag::Register(reg) => write!(f, "P{}={} Z={}", reg, self.value, self.zero as u8),
            BusTag::LoadStore(seq) => write!(f, "LSQ#{} addr={}", seq, self.value),
        }
    }
}

/// The forwarding buses. Each port carries at most one broadcast per cycle;
/// ports are granted in the order the units are evaluated.
pub struct ForwardingBuses {
    ports: usize,
    broadcasts: Vec<CDBBroadcast>,
}

impl ForwardingBuses {
    pub fn new(ports: u8) -> ForwardingBuses {
        ForwardingBuses { ports: ports as usize, broadcasts: Vec::with_capacity(ports as usize) }
    }

    pub fn clear(&mut self) {
        self.broadcasts.clear();
    }

    pub fn has_free_port(&self) -> bool {
        self.broadcasts.len() < self.ports
    }

    /// Claims a port. Returns false if every port is taken this cycle.
    pub fn broadcast(&mut self, broadcast: CDBBroadcast) -> bool {
        if !self.has_free_port() {
            return false;
        }
        self.broadcasts.push(broadcast);
        true
    }

    /// The broadcast carrying the given physical register this cycle.
    pub fn carrying(&self, reg: RegisterType) -> Option<&CDBBroadcast> {
        self.broadcasts.iter().find(|broadcast| broadcast.tag == BusTag::Register(reg))
    }

    /// Drops broadcasts of instructions younger than `rob_seq`.
    pub fn squash_after(&mut self, rob_seq: u64) {
        self.broadcasts.retain(|broadcast| broadcast.rob_seq <= rob_seq);
    }

    pub fn iter(&self) -> impl Iterator<Item=&CDBBroadcast> {
        self.broadcasts.iter()
    }
}
