use std::fmt;

use crate::instructions::instructions::{RegisterType, Source, WordType};

#[derive(Clone, Debug)]
pub struct LSQEntry {
    pub is_load: bool,
    pub address_valid: bool,
    pub address: WordType,
    // the destination register of a load
    pub dest: Option<RegisterType>,
    // the value a store writes; unused for loads
    pub data: Source,
    pub rob_seq: u64,
}

impl LSQEntry {
    pub fn load(dest: RegisterType, rob_seq: u64) -> LSQEntry {
        LSQEntry {
            is_load: true,
            address_valid: false,
            address: 0,
            dest: Some(dest),
            data: Source::unused(),
            rob_seq,
        }
    }

    pub fn store(data: Source, rob_seq: u64) -> LSQEntry {
        LSQEntry {
            is_load: false,
            address_valid: false,
            address: 0,
            dest: None,
            data,
            rob_seq,
        }
    }

    /// True if the memory access can be performed once the entry is at the
    /// head of the queue.
    pub fn is_ready(&self) -> bool {
        self.address_valid && self.data.valid
    }
}

impl fmt::Display for LSQEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_load { "LOAD" } else { "STORE" };
        write!(f, "{} rob={}", kind, self.rob_seq)?;
        if self.address_valid {
            write!(f, " addr={}", self.address)?;
        } else {
            write!(f, " addr=?")?;
        }
        match self.dest {
            Some(dest) => write!(f, " dest=P{}", dest),
            None => write!(f, " data={}", self.data),
        }
    }
}

/// The load-store queue. Memory operations enter at dispatch in program order
/// and leave from the head at commit, so memory sees them in program order.
///
/// Entries are addressed by sequence number; a forwarding bus resolves an
/// address by naming the sequence number of the entry.
pub struct LoadStoreQueue {
    capacity: u16,
    head: u64,
    tail: u64,
    entries: Vec<Option<LSQEntry>>,
}

impl LoadStoreQueue {
    pub fn new(capacity: u16) -> LoadStoreQueue {
        LoadStoreQueue {
            capacity,
            head: 0,
            tail: 0,
            entries: vec![None; capacity as usize],
        }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    /// The sequence number the next allocation will get.
    pub fn tail_seq(&self) -> u64 {
        self.tail
    }

    pub fn allocate(&mut self, entry: LSQEntry) -> u64 {
        assert!(self.has_space(), "LoadStoreQueue: can't allocate because there is no space");

        let seq = self.tail;
        let index = self.to_index(seq);
        self.entries[index] = Some(entry);
        self.tail += 1;
        seq
    }

    fn contains(&self, seq: u64) -> bool {
        seq >= self.head && seq < self.tail
    }

    pub fn get(&self, seq: u64) -> Option<&LSQEntry> {
        if !self.contains(seq) {
            return None;
        }
        self.entries[self.to_index(seq)].as_ref()
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut LSQEntry> {
        if !self.contains(seq) {
            return None;
        }
        let index = self.to_index(seq);
        self.entries[index].as_mut()
    }

    pub fn head(&self) -> Option<(u64, &LSQEntry)> {
        self.get(self.head).map(|entry| (self.head, entry))
    }

    pub fn pop_head(&mut self) -> Option<LSQEntry> {
        if self.is_empty() {
            return None;
        }

        let index = self.to_index(self.head);
        self.head += 1;
        self.entries[index].take()
    }

    /// Records the effective address computed for the entry `seq`. A stale
    /// sequence number is ignored.
    pub fn resolve_address(&mut self, seq: u64, address: WordType) {
        if let Some(entry) = self.get_mut(seq) {
            entry.address = address;
            entry.address_valid = true;
        }
    }

    /// Captures a broadcast store value.
    pub fn wakeup(&mut self, tag: RegisterType, value: WordType, zero: bool) {
        for seq in self.head..self.tail {
            let index = self.to_index(seq);
            if let Some(entry) = self.entries[index].as_mut() {
                entry.data.capture(tag, value, zero);
            }
        }
    }

    /// Drops every entry allocated at or after `tail_seq`.
    pub fn truncate(&mut self, tail_seq: u64) -> usize {
        let mut squashed = 0;
        while self.tail > tail_seq && self.tail > self.head {
            self.tail -= 1;
            let index = self.to_index(self.tail);
            self.entries[index] = None;
            squashed += 1;
        }
        squashed
    }

    pub fn iter(&self) -> impl Iterator<Item=(u64, &LSQEntry)> + '_ {
        (self.head..self.tail).filter_map(move |seq| self.get(seq).map(|entry| (seq, entry)))
    }
}
