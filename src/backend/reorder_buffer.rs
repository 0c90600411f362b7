use std::fmt;

use crate::error::Fault;
use crate::instructions::instructions::{mnemonic, Opcode, RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ROBSlotKind {
    // commits once the destination register is valid
    RegToReg,
    // commits once it is the head of the load-store queue with a known address
    Load,
    // as a load, and the store data must be known as well
    Store,
    // a control instruction that hasn't resolved yet
    Branch,
    // a resolved branch or a NOP; commits unconditionally
    Skip,
    Halt,
}

#[derive(Clone, Debug)]
pub struct ROBSlot {
    pub kind: ROBSlotKind,
    pub pc: WordType,
    pub opcode: Opcode,
    pub dest_phys_reg: Option<RegisterType>,
    // the mapping of dest_arch_reg displaced at rename
    pub prev_phys_reg: Option<RegisterType>,
    pub dest_arch_reg: Option<RegisterType>,
    pub sets_flag: bool,
    // the flag producer displaced at rename
    pub prev_flag: Option<RegisterType>,
    pub lsq_seq: Option<u64>,
    pub bis_seq: Option<u64>,
    // the functional unit delivered the result
    pub completed: bool,
    pub fault: Option<Fault>,
}

impl ROBSlot {
    pub fn new(kind: ROBSlotKind, pc: WordType, opcode: Opcode) -> ROBSlot {
        ROBSlot {
            kind,
            pc,
            opcode,
            dest_phys_reg: None,
            prev_phys_reg: None,
            dest_arch_reg: None,
            sets_flag: false,
            prev_flag: None,
            lsq_seq: None,
            bis_seq: None,
            completed: false,
            fault: None,
        }
    }

    /// The physical register this entry keeps alive until it commits: the
    /// displaced mapping, or for CMP its own flag register.
    pub fn held_phys_regs(&self) -> impl Iterator<Item=RegisterType> {
        let own = if self.dest_arch_reg.is_none() { self.dest_phys_reg } else { None };
        self.prev_phys_reg.into_iter().chain(own)
    }
}

impl fmt::Display for ROBSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc({}) {} {:?}", self.pc, mnemonic(self.opcode), self.kind)?;
        if let Some(pd) = self.dest_phys_reg {
            write!(f, " P{}", pd)?;
        }
        if let Some(rd) = self.dest_arch_reg {
            write!(f, "->R{}", rd)?;
        }
        if let Some(prev) = self.prev_phys_reg {
            write!(f, " prev=P{}", prev)?;
        }
        if let Some(fault) = self.fault {
            write!(f, " fault=({})", fault)?;
        }
        Ok(())
    }
}

/// The reorder buffer. Entries are identified by a sequence number; the slot
/// is `seq % capacity`. A flush rewinds the tail, so the sequence numbers of
/// squashed entries are handed out again. That is safe because the flush also
/// squashes every younger reference held by the issue queue, the load-store
/// queue, the functional units and the buses.
pub struct ROB {
    capacity: u16,
    // everything before this point is committed.
    head: u64,
    tail: u64,
    slots: Vec<Option<ROBSlot>>,
}

impl ROB {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity,
            head: 0,
            tail: 0,
            slots: vec![None; capacity as usize],
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
        self.capacity > self.size()
    }

    /// The sequence number the next allocation will get.
    pub fn next_seq(&self) -> u64 {
        self.tail
    }

    pub fn allocate(&mut self, slot: ROBSlot) -> u64 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let seq = self.tail;
        let index = self.to_index(seq);
        self.slots[index] = Some(slot);
        self.tail += 1;
        seq
    }

    fn contains(&self, seq: u64) -> bool {
        seq >= self.head && seq < self.tail
    }

    pub fn get(&self, seq: u64) -> Option<&ROBSlot> {
        if !self.contains(seq) {
            return None;
        }
        self.slots[self.to_index(seq)].as_ref()
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut ROBSlot> {
        if !self.contains(seq) {
            return None;
        }
        let index = self.to_index(seq);
        self.slots[index].as_mut()
    }

    pub fn head(&self) -> Option<(u64, &ROBSlot)> {
        self.get(self.head).map(|slot| (self.head, slot))
    }

    pub fn pop_head(&mut self) -> Option<ROBSlot> {
        if self.is_empty() {
            return None;
        }

        let index = self.to_index(self.head);
        self.head += 1;
        self.slots[index].take()
    }

    /// Removes every entry younger than `seq`, youngest first.
    pub fn truncate_after(&mut self, seq: u64) -> Vec<(u64, ROBSlot)> {
        debug_assert!(self.contains(seq), "ROB: flush anchor {} is not in flight", seq);

        let mut squashed = Vec::new();
        while self.tail > seq + 1 {
            self.tail -= 1;
            let index = self.to_index(self.tail);
            if let Some(slot) = self.slots[index].take() {
                squashed.push((self.tail, slot));
            }
        }
        squashed
    }

    /// Clears every in-flight reference to a recycled flag producer.
    pub fn forget_prev_flag(&mut self, phys_reg: RegisterType) {
        for seq in self.head..self.tail {
            let index = self.to_index(seq);
            if let Some(slot) = self.slots[index].as_mut() {
                if slot.prev_flag == Some(phys_reg) {
                    slot.prev_flag = None;
                }
            }
        }
    }

    /// The in-flight entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item=(u64, &ROBSlot)> + '_ {
        (self.head..self.tail).filter_map(move |seq| self.get(seq).map(|slot| (seq, slot)))
    }
}
