use crate::cpu::CPUConfig;
use crate::error::Fault;
use crate::instructions::instructions::WordType;
use crate::memory_subsystem::load_store_queue::LoadStoreQueue;

/// Word addressed data memory together with the queue that orders accesses
/// to it.
pub struct MemorySubsystem {
    pub(crate) memory: Vec<WordType>,
    pub(crate) lsq: LoadStoreQueue,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
            lsq: LoadStoreQueue::new(cpu_config.lsq_capacity),
        }
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    fn check_address(&self, address: WordType) -> Result<usize, Fault> {
        if address < 0 || address as usize >= self.memory.len() {
            return Err(Fault::AddressOutOfBounds(address));
        }
        Ok(address as usize)
    }

    pub fn read(&self, address: WordType) -> Result<WordType, Fault> {
        let index = self.check_address(address)?;
        Ok(self.memory[index])
    }

    pub fn write(&mut self, address: WordType, value: WordType) -> Result<(), Fault> {
        let index = self.check_address(address)?;
        self.memory[index] = value;
        Ok(())
    }

    /// The words that hold something other than zero, as (address, value).
    pub fn non_zero(&self) -> impl Iterator<Item=(usize, WordType)> + '_ {
        self.memory.iter()
            .enumerate()
            .filter(|(_, value)| **value != 0)
            .map(|(address, value)| (address, *value))
    }
}
