use crate::instructions::instructions::WordType;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BTBEntry {
    pub pc: WordType,
    pub target: WordType,
    // the last resolved outcome; used as the next prediction
    pub taken: bool,
}

/// The branch target buffer. When full, the entry with the lowest pc is
/// evicted.
pub struct BTB {
    capacity: u16,
    entries: Vec<BTBEntry>,
}

impl BTB {
    pub fn new(capacity: u16) -> BTB {
        BTB { capacity, entries: Vec::with_capacity(capacity as usize) }
    }

    pub fn lookup(&self, pc: WordType) -> Option<&BTBEntry> {
        self.entries.iter().find(|entry| entry.pc == pc)
    }

    /// Direction prediction for the conditional branch at `pc`: the last
    /// outcome if the branch is known, otherwise backward taken and forward
    /// not taken.
    pub fn predict(&self, pc: WordType, displacement: WordType) -> bool {
        match self.lookup(pc) {
            Some(entry) => entry.taken,
            None => displacement < 0,
        }
    }

    pub fn record(&mut self, pc: WordType, target: WordType, taken: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.pc == pc) {
            entry.target = target;
            entry.taken = taken;
            return;
        }

        if self.entries.len() == self.capacity as usize {
            let victim = self.entries.iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.pc)
                .map(|(index, _)| index);
            if let Some(victim) = victim {
                self.entries.swap_remove(victim);
            }
        }

        if self.capacity > 0 {
            self.entries.push(BTBEntry { pc, target, taken });
        }
    }

    pub fn iter(&self) -> impl Iterator<Item=&BTBEntry> {
        self.entries.iter()
    }
}

/// The rollback point of an unresolved conditional branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BISEntry {
    pub pc: WordType,
    pub rob_seq: u64,
    // the load-store queue tail when the branch was dispatched
    pub lsq_tail: u64,
}

/// The branch instruction stack. Branches are pushed at dispatch, popped when
/// they commit, and cut off by a flush.
pub struct BIS {
    capacity: u16,
    head: u64,
    tail: u64,
    entries: Vec<Option<BISEntry>>,
}

impl BIS {
    pub fn new(capacity: u16) -> BIS {
        BIS { capacity, head: 0, tail: 0, entries: vec![None; capacity as usize] }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    /// The sequence number the next push will get.
    pub fn tail_seq(&self) -> u64 {
        self.tail
    }

    pub fn push(&mut self, entry: BISEntry) -> u64 {
        assert!(self.has_space(), "BIS: can't push because there is no space");

        let seq = self.tail;
        let index = self.to_index(seq);
        self.entries[index] = Some(entry);
        self.tail += 1;
        seq
    }

    pub fn get(&self, seq: u64) -> Option<&BISEntry> {
        if seq < self.head || seq >= self.tail {
            return None;
        }
        self.entries[self.to_index(seq)].as_ref()
    }

    pub fn pop_head(&mut self) -> Option<BISEntry> {
        if self.head == self.tail {
            return None;
        }

        let index = self.to_index(self.head);
        self.head += 1;
        self.entries[index].take()
    }

    /// Removes every branch pushed after `seq`.
    pub fn truncate_after(&mut self, seq: u64) {
        while self.tail > seq + 1 && self.tail > self.head {
            self.tail -= 1;
            let index = self.to_index(self.tail);
            self.entries[index] = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item=(u64, &BISEntry)> + '_ {
        (self.head..self.tail).filter_map(move |seq| self.get(seq).map(|entry| (seq, entry)))
    }
}
