use crate::instructions::instructions::RegisterType;

/// The Register Alias Table. The entry for an architectural register points
/// to the physical register holding its newest value; an empty entry means
/// the value lives in the architectural register file.
///
/// Next to the registers the table tracks the producer of the newest zero
/// flag. That tag is an alias of the producer's destination register and
/// never owns it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RAT {
    table: Vec<Option<RegisterType>>,
    flag: Option<RegisterType>,
}

impl RAT {
    pub fn new(arch_reg_count: u16) -> Self {
        Self { table: vec![None; arch_reg_count as usize], flag: None }
    }

    pub fn get(&self, arch_reg: RegisterType) -> Option<RegisterType> {
        self.table[arch_reg as usize]
    }

    /// Maps `arch_reg` to `phys_reg` and returns the mapping it replaced.
    pub fn set(&mut self, arch_reg: RegisterType, phys_reg: Option<RegisterType>) -> Option<RegisterType> {
        std::mem::replace(&mut self.table[arch_reg as usize], phys_reg)
    }

    pub fn flag(&self) -> Option<RegisterType> {
        self.flag
    }

    /// Points the zero flag at a new producer and returns the old one.
    pub fn set_flag(&mut self, phys_reg: Option<RegisterType>) -> Option<RegisterType> {
        std::mem::replace(&mut self.flag, phys_reg)
    }

    /// Drops the flag alias if it points at a register that is being
    /// recycled. The committed flag is then found in the architectural state.
    pub fn forget_flag(&mut self, phys_reg: RegisterType) {
        if self.flag == Some(phys_reg) {
            self.flag = None;
        }
    }

    pub fn entries(&self) -> &[Option<RegisterType>] {
        &self.table
    }

    /// The physical registers currently mapped by an architectural register.
    pub fn mapped(&self) -> impl Iterator<Item=RegisterType> + '_ {
        self.table.iter().filter_map(|entry| *entry)
    }
}
