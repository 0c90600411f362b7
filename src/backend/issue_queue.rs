use std::fmt;

use crate::instructions::instructions::{FuClass, mnemonic, Opcode, RegisterType, Source, WordType};

/// A dispatched instruction waiting for its operands.
#[derive(Clone, Debug)]
pub struct IQEntry {
    pub rob_seq: u64,
    pub pc: WordType,
    pub opcode: Opcode,
    pub fu: FuClass,
    pub literal: WordType,
    pub source: [Source; 2],
    pub dest: Option<RegisterType>,
    pub lsq_seq: Option<u64>,
    // the branch instruction stack tail when this entry was dispatched
    pub bis_tag: u64,
    pub predicted_taken: bool,
    pub waited_on: bool,
}

impl IQEntry {
    pub fn is_ready(&self) -> bool {
        self.source.iter().all(|source| source.valid)
    }
}

impl fmt::Display for IQEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc({}) {} [{}] src1={} src2={} #{}",
               self.pc, mnemonic(self.opcode), self.fu, self.source[0], self.source[1], self.literal)?;
        if let Some(dest) = self.dest {
            write!(f, " dest=P{}", dest)?;
        }
        Ok(())
    }
}

/// The issue queue. Entries are kept in dispatch order; issuing an entry
/// shifts the younger entries down one slot.
pub struct IQ {
    capacity: u16,
    entries: Vec<IQEntry>,
}

impl IQ {
    pub fn new(capacity: u16) -> Self {
        Self { capacity, entries: Vec::with_capacity(capacity as usize) }
    }

    pub fn size(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub fn allocate(&mut self, entry: IQEntry) {
        assert!(self.has_space(), "IQ: can't allocate because there is no space");
        self.entries.push(entry);
    }

    /// Marks every source waiting on `tag` as valid and captures the value.
    pub fn wakeup(&mut self, tag: RegisterType, value: WordType, zero: bool) {
        for entry in &mut self.entries {
            for source in &mut entry.source {
                source.capture(tag, value, zero);
            }
        }
    }

    /// Removes and returns the oldest ready entry whose unit is free.
    pub fn select(&mut self, fu_is_free: impl Fn(FuClass) -> bool) -> Option<IQEntry> {
        let position = self.entries.iter()
            .position(|entry| entry.is_ready() && fu_is_free(entry.fu))?;
        Some(self.entries.remove(position))
    }

    /// Drops every entry dispatched after the branch with the given stack
    /// sequence number. Entries are in dispatch order, so everything from the
    /// first such entry onwards goes.
    pub fn truncate_after_branch(&mut self, bis_seq: u64) -> usize {
        let position = self.entries.iter()
            .position(|entry| entry.bis_tag > bis_seq)
            .unwrap_or(self.entries.len());
        let squashed = self.entries.len() - position;
        self.entries.truncate(position);
        squashed
    }

    pub fn iter(&self) -> impl Iterator<Item=&IQEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rob_seq: u64, fu: FuClass, source: [Source; 2], bis_tag: u64) -> IQEntry {
        IQEntry {
            rob_seq,
            pc: 4000 + 4 * rob_seq as WordType,
            opcode: Opcode::ADD,
            fu,
            literal: 0,
            source,
            dest: Some(rob_seq as RegisterType),
            lsq_seq: None,
            bis_tag,
            predicted_taken: false,
            waited_on: false,
        }
    }

    const READY: Source = Source::ready(1, false);

    #[test]
    fn test_capacity() {
        let mut iq = IQ::new(2);
        iq.allocate(entry(0, FuClass::Int, [READY, READY], 0));
        assert!(iq.has_space());
        iq.allocate(entry(1, FuClass::Int, [READY, READY], 0));
        assert!(!iq.has_space());
    }

    #[test]
    fn test_select_oldest_ready_and_compact() {
        let mut iq = IQ::new(8);
        iq.allocate(entry(0, FuClass::Int, [Source::waiting(7), READY], 0));
        iq.allocate(entry(1, FuClass::Int, [READY, READY], 0));
        iq.allocate(entry(2, FuClass::Int, [READY, READY], 0));

        let issued = iq.select(|_| true).unwrap();
        assert_eq!(issued.rob_seq, 1);
        let remaining: Vec<u64> = iq.iter().map(|e| e.rob_seq).collect();
        assert_eq!(remaining, vec![0, 2]);
    }

    #[test]
    fn test_select_skips_busy_unit() {
        let mut iq = IQ::new(8);
        iq.allocate(entry(0, FuClass::Mul, [READY, READY], 0));
        iq.allocate(entry(1, FuClass::Logic, [READY, READY], 0));

        let issued = iq.select(|fu| fu != FuClass::Mul).unwrap();
        assert_eq!(issued.rob_seq, 1);
        assert!(iq.select(|fu| fu != FuClass::Mul).is_none());
    }

    #[test]
    fn test_wakeup_captures_value() {
        let mut iq = IQ::new(8);
        iq.allocate(entry(0, FuClass::Int, [Source::waiting(3), Source::waiting(3)], 0));
        iq.allocate(entry(1, FuClass::Int, [Source::waiting(4), READY], 0));

        iq.wakeup(3, 42, false);

        let entries: Vec<&IQEntry> = iq.iter().collect();
        assert!(entries[0].is_ready());
        assert_eq!(entries[0].source[1].value, 42);
        assert!(!entries[1].is_ready());
    }

    #[test]
    fn test_truncate_after_branch() {
        let mut iq = IQ::new(8);
        iq.allocate(entry(0, FuClass::Int, [READY, READY], 0));
        iq.allocate(entry(2, FuClass::Int, [READY, READY], 1));
        iq.allocate(entry(3, FuClass::Int, [READY, READY], 1));
        iq.allocate(entry(5, FuClass::Int, [READY, READY], 2));

        // the branch pushed at stack seq 0 changed the tag from 0 to 1
        assert_eq!(iq.truncate_after_branch(0), 3);
        assert_eq!(iq.size(), 1);
    }
}
