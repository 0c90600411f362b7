use crate::error::CpuError;
use crate::instructions::instructions::{RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PhysRegEntry {
    pub value: WordType,
    // false from allocation until the producer broadcasts its result
    pub valid: bool,
    // the zero flag computed alongside the value
    pub zero: bool,
}

impl PhysRegEntry {
    fn reset(&mut self) {
        self.value = 0;
        self.valid = false;
        self.zero = false;
    }
}

/// The free list: a circular buffer of physical register indices. `head` is
/// the next register to allocate; new releases go in at the tail, rolled back
/// registers go back in at the head so they are reused first.
pub struct FreeList {
    slots: Vec<RegisterType>,
    head: usize,
    len: usize,
}

impl FreeList {
    fn new(count: u16) -> FreeList {
        FreeList {
            slots: (0..count).collect(),
            head: 0,
            len: count as usize,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn pop_front(&mut self) -> Option<RegisterType> {
        if self.is_empty() {
            return None;
        }

        let reg = self.slots[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(reg)
    }

    fn push_back(&mut self, reg: RegisterType) {
        assert!(self.len < self.capacity(), "FreeList: can't release P{} into a full free list", reg);

        let tail = (self.head + self.len) % self.capacity();
        self.slots[tail] = reg;
        self.len += 1;
    }

    fn push_front(&mut self, reg: RegisterType) {
        assert!(self.len < self.capacity(), "FreeList: can't restore P{} into a full free list", reg);

        self.head = (self.head + self.capacity() - 1) % self.capacity();
        self.slots[self.head] = reg;
        self.len += 1;
    }

    /// The free registers in allocation order.
    pub fn iter(&self) -> impl Iterator<Item=RegisterType> + '_ {
        (0..self.len).map(move |k| self.slots[(self.head + k) % self.capacity()])
    }

    pub fn contains(&self, reg: RegisterType) -> bool {
        self.iter().any(|r| r == reg)
    }
}

pub struct PhysRegFile {
    entries: Vec<PhysRegEntry>,
    free_list: FreeList,
}

impl PhysRegFile {
    pub fn new(count: u16) -> PhysRegFile {
        let entries = vec![PhysRegEntry { value: 0, valid: false, zero: false }; count as usize];
        PhysRegFile { entries, free_list: FreeList::new(count) }
    }

    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn get(&self, reg: RegisterType) -> &PhysRegEntry {
        &self.entries[reg as usize]
    }

    pub fn entries(&self) -> &[PhysRegEntry] {
        &self.entries
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Draws the next register from the free list. The register is invalid
    /// until its producer writes it.
    pub fn allocate(&mut self) -> Option<RegisterType> {
        let reg = self.free_list.pop_front()?;
        self.entries[reg as usize].reset();
        Some(reg)
    }

    /// Returns a register whose last reader has committed.
    pub fn release(&mut self, reg: RegisterType) {
        debug_assert!(!self.free_list.contains(reg), "P{} is released while it is already free", reg);
        self.free_list.push_back(reg);
    }

    /// Returns a register allocated on a squashed path to the front of the
    /// free list.
    pub fn restore(&mut self, reg: RegisterType) {
        debug_assert!(!self.free_list.contains(reg), "P{} is restored while it is already free", reg);
        self.entries[reg as usize].reset();
        self.free_list.push_front(reg);
    }

    pub fn write(&mut self, reg: RegisterType, value: WordType, zero: bool) {
        let entry = &mut self.entries[reg as usize];
        debug_assert!(!entry.valid, "P{} has more than one writer", reg);
        entry.value = value;
        entry.zero = zero;
        entry.valid = true;
    }

    pub fn read(&self, reg: RegisterType) -> Result<&PhysRegEntry, CpuError> {
        let entry = &self.entries[reg as usize];
        if !entry.valid {
            return Err(CpuError::InvalidRegisterRead(reg));
        }
        Ok(entry)
    }
}
