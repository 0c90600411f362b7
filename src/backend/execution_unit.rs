use std::fmt;

use crate::backend::issue_queue::IQEntry;
use crate::error::Fault;
use crate::instructions::instructions::{FuClass, mnemonic, Opcode, RegisterType, WordType};

/// An instruction inside a functional unit. The operands were captured while
/// it waited in the issue queue.
#[derive(Clone, Debug)]
pub struct Uop {
    pub rob_seq: u64,
    pub pc: WordType,
    pub opcode: Opcode,
    pub fu: FuClass,
    pub operands: [WordType; 2],
    // the zero flag a conditional branch tests
    pub flag: bool,
    pub literal: WordType,
    pub dest: Option<RegisterType>,
    pub lsq_seq: Option<u64>,
    pub predicted_taken: bool,
    pub waited_on: bool,
}

impl From<IQEntry> for Uop {
    fn from(entry: IQEntry) -> Self {
        Uop {
            rob_seq: entry.rob_seq,
            pc: entry.pc,
            opcode: entry.opcode,
            fu: entry.fu,
            operands: [entry.source[0].value, entry.source[1].value],
            flag: entry.source[0].zero,
            literal: entry.literal,
            dest: entry.dest,
            lsq_seq: entry.lsq_seq,
            predicted_taken: entry.predicted_taken,
            waited_on: entry.waited_on,
        }
    }
}

impl fmt::Display for Uop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc({}) {} [{}, {}] #{}",
               self.pc, mnemonic(self.opcode), self.operands[0], self.operands[1], self.literal)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    // a register result and the zero flag that goes with it
    Value { value: WordType, zero: bool },
    // the effective address of a load or store
    Address(WordType),
    // the resolved direction and the target if taken
    Branch { taken: bool, target: WordType },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Effect {
    pub outcome: Outcome,
    pub fault: Option<Fault>,
}

impl Effect {
    fn value(value: WordType) -> Effect {
        Effect { outcome: Outcome::Value { value, zero: value == 0 }, fault: None }
    }

    fn address(address: WordType, memory_size: usize) -> Effect {
        let fault = if address < 0 || address as usize >= memory_size {
            Some(Fault::AddressOutOfBounds(address))
        } else {
            None
        };
        Effect { outcome: Outcome::Address(address), fault }
    }

    fn branch(taken: bool, target: WordType) -> Effect {
        Effect { outcome: Outcome::Branch { taken, target }, fault: None }
    }
}

/// Computes the effect of a µop. Arithmetic wraps. A division by zero yields
/// a poisoned zero so that dependants can drain; the fault is reported when
/// the instruction commits.
pub fn execute(uop: &Uop, memory_size: usize) -> Effect {
    let [a, b] = uop.operands;

    match uop.opcode {
        Opcode::ADD => Effect::value(a.wrapping_add(b)),
        Opcode::SUB | Opcode::CMP => Effect::value(a.wrapping_sub(b)),
        Opcode::MUL => Effect::value(a.wrapping_mul(b)),
        Opcode::DIV => {
            if b == 0 {
                Effect { fault: Some(Fault::DivideByZero), ..Effect::value(0) }
            } else {
                Effect::value(a.wrapping_div(b))
            }
        }
        Opcode::AND => Effect::value(a & b),
        Opcode::OR => Effect::value(a | b),
        Opcode::XOR => Effect::value(a ^ b),
        Opcode::MOVC => Effect::value(uop.literal),
        Opcode::ADDL => Effect::value(a.wrapping_add(uop.literal)),
        Opcode::SUBL => Effect::value(a.wrapping_sub(uop.literal)),
        Opcode::LOAD | Opcode::STORE => Effect::address(a.wrapping_add(uop.literal), memory_size),
        Opcode::LDR | Opcode::STR => Effect::address(a.wrapping_add(b), memory_size),
        Opcode::BZ => Effect::branch(uop.flag, uop.pc.wrapping_add(uop.literal)),
        Opcode::BNZ => Effect::branch(!uop.flag, uop.pc.wrapping_add(uop.literal)),
        Opcode::JUMP => Effect::branch(true, a.wrapping_add(uop.literal)),
        // never issued; they only pass through the reorder buffer
        Opcode::NOP | Opcode::HALT => Effect::value(0),
    }
}

/// The functional units: a single cycle integer unit, a single cycle logical
/// unit and a pipelined multiply unit.
///
/// A unit holds its µop until the result is delivered. For the multiply unit
/// a µop that can't leave the last stage blocks the stages behind it.
pub struct ExecutionUnits {
    int: Option<Uop>,
    logic: Option<Uop>,
    // index 0 is the stage a µop enters at issue
    mul: Vec<Option<Uop>>,
}

impl ExecutionUnits {
    pub fn new(mul_latency: u8) -> ExecutionUnits {
        ExecutionUnits {
            int: None,
            logic: None,
            mul: vec![None; mul_latency as usize],
        }
    }

    pub fn is_free(&self, fu: FuClass) -> bool {
        match fu {
            FuClass::Int => self.int.is_none(),
            FuClass::Logic => self.logic.is_none(),
            FuClass::Mul => self.mul[0].is_none(),
        }
    }

    pub fn accept(&mut self, uop: Uop) {
        debug_assert!(self.is_free(uop.fu), "{} unit is busy", uop.fu);
        match uop.fu {
            FuClass::Int => self.int = Some(uop),
            FuClass::Logic => self.logic = Some(uop),
            FuClass::Mul => self.mul[0] = Some(uop),
        }
    }

    /// The µop in the final stage of the unit; this is the one that produces
    /// a result this cycle.
    pub fn completing(&self, fu: FuClass) -> Option<&Uop> {
        match fu {
            FuClass::Int => self.int.as_ref(),
            FuClass::Logic => self.logic.as_ref(),
            FuClass::Mul => self.mul.last().and_then(|stage| stage.as_ref()),
        }
    }

    /// Removes the µop of the final stage once its result was delivered.
    pub fn retire_completed(&mut self, fu: FuClass) -> Option<Uop> {
        match fu {
            FuClass::Int => self.int.take(),
            FuClass::Logic => self.logic.take(),
            FuClass::Mul => self.mul.last_mut().and_then(|stage| stage.take()),
        }
    }

    /// Moves every multiply µop one stage forward, back to front, as far as
    /// the next stage is empty.
    pub fn advance_mul(&mut self) {
        for stage in (0..self.mul.len().saturating_sub(1)).rev() {
            if self.mul[stage + 1].is_none() {
                self.mul[stage + 1] = self.mul[stage].take();
            }
        }
    }

    /// Drops every µop younger than `rob_seq`. Returns the number dropped.
    pub fn squash_after(&mut self, rob_seq: u64) -> usize {
        let mut squashed = 0;
        let slots = std::iter::once(&mut self.int)
            .chain(std::iter::once(&mut self.logic))
            .chain(self.mul.iter_mut());
        for slot in slots {
            if slot.as_ref().map_or(false, |uop| uop.rob_seq > rob_seq) {
                *slot = None;
                squashed += 1;
            }
        }
        squashed
    }

    pub fn int(&self) -> Option<&Uop> {
        self.int.as_ref()
    }

    pub fn logic(&self) -> Option<&Uop> {
        self.logic.as_ref()
    }

    pub fn mul_stages(&self) -> &[Option<Uop>] {
        &self.mul
    }
}
