use std::fmt;

use Operand::{Dest, Imm, Src1, Src2, Src3};

pub type RegisterType = u16;
pub type WordType = i32;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Opcode {
    ADD,
    SUB,
    MUL,
    DIV,
    AND,
    OR,
    XOR,
    MOVC,
    LOAD,
    STORE,
    BZ,
    BNZ,
    HALT,
    LDR,
    STR,
    JUMP,
    NOP,
    ADDL,
    SUBL,
    CMP,
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::MUL => "MUL",
        Opcode::DIV => "DIV",
        Opcode::AND => "AND",
        Opcode::OR => "OR",
        Opcode::XOR => "XOR",
        Opcode::MOVC => "MOVC",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::BZ => "BZ",
        Opcode::BNZ => "BNZ",
        Opcode::HALT => "HALT",
        Opcode::LDR => "LDR",
        Opcode::STR => "STR",
        Opcode::JUMP => "JUMP",
        Opcode::NOP => "NOP",
        Opcode::ADDL => "ADDL",
        Opcode::SUBL => "SUBL",
        Opcode::CMP => "CMP",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "MUL" => Some(Opcode::MUL),
        "DIV" => Some(Opcode::DIV),
        "AND" => Some(Opcode::AND),
        "OR" => Some(Opcode::OR),
        "XOR" => Some(Opcode::XOR),
        "MOVC" => Some(Opcode::MOVC),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "BZ" => Some(Opcode::BZ),
        "BNZ" => Some(Opcode::BNZ),
        "HALT" => Some(Opcode::HALT),
        "LDR" => Some(Opcode::LDR),
        "STR" => Some(Opcode::STR),
        "JUMP" => Some(Opcode::JUMP),
        "NOP" => Some(Opcode::NOP),
        "ADDL" => Some(Opcode::ADDL),
        "SUBL" => Some(Opcode::SUBL),
        "CMP" => Some(Opcode::CMP),
        _ => None,
    }
}

/// The position an operand of the listing is written to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    Dest,
    Src1,
    Src2,
    Src3,
    Imm,
}

/// The operands an opcode expects in the listing, in order.
pub fn operand_format(opcode: Opcode) -> &'static [Operand] {
    match opcode {
        Opcode::ADD |
        Opcode::SUB |
        Opcode::MUL |
        Opcode::DIV |
        Opcode::AND |
        Opcode::OR |
        Opcode::XOR |
        Opcode::LDR => &[Dest, Src1, Src2],
        Opcode::ADDL |
        Opcode::SUBL |
        Opcode::LOAD => &[Dest, Src1, Imm],
        Opcode::MOVC => &[Dest, Imm],
        Opcode::STORE => &[Src1, Src2, Imm],
        Opcode::STR => &[Src1, Src2, Src3],
        Opcode::CMP => &[Src1, Src2],
        Opcode::BZ |
        Opcode::BNZ => &[Imm],
        Opcode::JUMP => &[Src1, Imm],
        Opcode::HALT |
        Opcode::NOP => &[],
    }
}

/// The functional unit an instruction executes on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FuClass {
    Int,
    Logic,
    Mul,
}

impl fmt::Display for FuClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuClass::Int => write!(f, "INT"),
            FuClass::Logic => write!(f, "LOP"),
            FuClass::Mul => write!(f, "MUL"),
        }
    }
}

/// A decoded instruction as it sits in code memory. Immutable once loaded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instr {
    pub opcode: Opcode,
    pub rd: Option<RegisterType>,
    pub rs1: Option<RegisterType>,
    pub rs2: Option<RegisterType>,
    pub rs3: Option<RegisterType>,
    pub imm: WordType,
}

impl Instr {
    pub const fn new(opcode: Opcode) -> Instr {
        Instr { opcode, rd: None, rs1: None, rs2: None, rs3: None, imm: 0 }
    }

    pub fn with_operands(opcode: Opcode,
                         rd: Option<RegisterType>,
                         rs1: Option<RegisterType>,
                         rs2: Option<RegisterType>,
                         rs3: Option<RegisterType>,
                         imm: WordType) -> Instr {
        Instr { opcode, rd, rs1, rs2, rs3, imm }
    }

    pub fn fu_class(&self) -> Option<FuClass> {
        match self.opcode {
            Opcode::MUL | Opcode::DIV => Some(FuClass::Mul),
            Opcode::AND | Opcode::OR | Opcode::XOR => Some(FuClass::Logic),
            Opcode::NOP | Opcode::HALT => None,
            _ => Some(FuClass::Int),
        }
    }

    /// True if the instruction produces a new zero flag.
    pub fn sets_flag(&self) -> bool {
        matches!(self.opcode,
            Opcode::ADD | Opcode::SUB | Opcode::MUL | Opcode::DIV |
            Opcode::ADDL | Opcode::SUBL | Opcode::MOVC | Opcode::CMP)
    }

    /// True if the instruction needs a physical register for its result.
    ///
    /// CMP has no architectural destination, but its flag needs a tag that
    /// later branches can wait on.
    pub fn needs_phys_reg(&self) -> bool {
        self.rd.is_some() || self.opcode == Opcode::CMP
    }

    pub fn is_conditional_branch(&self) -> bool {
        matches!(self.opcode, Opcode::BZ | Opcode::BNZ)
    }

    pub fn is_control(&self) -> bool {
        self.is_conditional_branch() || self.opcode == Opcode::JUMP
    }

    pub fn is_load(&self) -> bool {
        matches!(self.opcode, Opcode::LOAD | Opcode::LDR)
    }

    pub fn is_store(&self) -> bool {
        matches!(self.opcode, Opcode::STORE | Opcode::STR)
    }

    pub fn is_memory(&self) -> bool {
        self.is_load() || self.is_store()
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode))?;

        for operand in operand_format(self.opcode) {
            let reg = match operand {
                Dest => self.rd,
                Src1 => self.rs1,
                Src2 => self.rs2,
                Src3 => self.rs3,
                Imm => {
                    write!(f, ",#{}", self.imm)?;
                    continue;
                }
            };
            match reg {
                Some(reg) => write!(f, ",R{}", reg)?,
                None => write!(f, ",R?")?,
            }
        }

        Ok(())
    }
}

pub const HALT: Instr = Instr::new(Opcode::HALT);

/// One operand of an in-flight instruction: either its captured value, or the
/// tag of the physical register that will produce it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Source {
    pub valid: bool,
    pub tag: Option<RegisterType>,
    pub value: WordType,
    pub zero: bool,
}

impl Source {
    pub const fn ready(value: WordType, zero: bool) -> Source {
        Source { valid: true, tag: None, value, zero }
    }

    pub const fn waiting(tag: RegisterType) -> Source {
        Source { valid: false, tag: Some(tag), value: 0, zero: false }
    }

    /// A source slot the instruction doesn't use.
    pub const fn unused() -> Source {
        Source::ready(0, false)
    }

    /// Captures a broadcast if this source is waiting on `tag`. Returns true
    /// if the source became valid.
    pub fn capture(&mut self, tag: RegisterType, value: WordType, zero: bool) -> bool {
        if self.valid || self.tag != Some(tag) {
            return false;
        }

        self.valid = true;
        self.value = value;
        self.zero = zero;
        true
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.valid, self.tag) {
            (true, _) => write!(f, "{}", self.value),
            (false, Some(tag)) => write!(f, "P{}?", tag),
            (false, None) => write!(f, "?"),
        }
    }
}

/// The contents of code memory.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub code: Vec<Instr>,
}

impl Program {
    pub fn new(code: Vec<Instr>) -> Program {
        Program { code }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Looks up the instruction at `pc`. Returns None if the pc lies outside
    /// code memory or isn't aligned to an instruction.
    pub fn get_instr(&self, pc: WordType, base_address: WordType, instr_width: WordType) -> Option<&Instr> {
        let offset = pc.checked_sub(base_address)?;
        if offset < 0 || offset % instr_width != 0 {
            return None;
        }
        self.code.get((offset / instr_width) as usize)
    }
}
