use std::fmt;
use std::rc::Rc;

use log::info;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::instructions::instructions::{HALT, Instr, Opcode, Program, WordType};

/// State shared between fetch and the backend that steers it.
pub struct FrontendControl {
    pub pc: WordType,
    // set by a redirect; fetch sits out the cycle in which the redirect happens
    pub fetch_from_next_cycle: bool,
    // HALT was fetched; nothing behind it is fetched
    pub halted: bool,
    // a branch whose outcome fetch has to wait for is in flight
    pub waiting_on_branch: bool,
}

impl FrontendControl {
    pub fn new(pc: WordType) -> FrontendControl {
        FrontendControl {
            pc,
            fetch_from_next_cycle: false,
            halted: false,
            waiting_on_branch: false,
        }
    }

    /// Resumes fetch at `target` from the next cycle on.
    pub fn redirect(&mut self, target: WordType) {
        self.pc = target;
        self.fetch_from_next_cycle = true;
        self.halted = false;
        self.waiting_on_branch = false;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FetchedInstr {
    pub pc: WordType,
    pub instr: Instr,
}

impl fmt::Display for FetchedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc({}) {}", self.pc, self.instr)
    }
}

/// The latch between fetch and rename. It holds at most one instruction.
#[derive(Default)]
pub struct InstrQueue {
    slot: Option<FetchedInstr>,
}

impl InstrQueue {
    pub fn new() -> InstrQueue {
        InstrQueue { slot: None }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn enqueue(&mut self, fetched: FetchedInstr) {
        debug_assert!(self.is_empty(), "InstrQueue: can't enqueue in an occupied latch");
        self.slot = Some(fetched);
    }

    pub fn peek(&self) -> Option<&FetchedInstr> {
        self.slot.as_ref()
    }

    pub fn dequeue(&mut self) -> Option<FetchedInstr> {
        self.slot.take()
    }

    pub fn flush(&mut self) {
        self.slot = None;
    }
}

pub struct Frontend {
    program: Rc<Program>,
    code_base_address: WordType,
    instr_width: WordType,
    trace: Trace,
}

impl Frontend {
    pub fn new(cpu_config: &CPUConfig, program: Rc<Program>) -> Frontend {
        Frontend {
            program,
            code_base_address: cpu_config.code_base_address,
            instr_width: cpu_config.instr_width,
            trace: cpu_config.trace.clone(),
        }
    }

    pub fn do_cycle(&mut self,
                    frontend_control: &mut FrontendControl,
                    instr_queue: &mut InstrQueue,
                    perf_counters: &mut PerfCounters) {
        if frontend_control.fetch_from_next_cycle {
            frontend_control.fetch_from_next_cycle = false;
            return;
        }

        if frontend_control.halted || frontend_control.waiting_on_branch || !instr_queue.is_empty() {
            return;
        }

        let pc = frontend_control.pc;
        // running off the end of code memory behaves as a HALT
        let instr = match self.program.get_instr(pc, self.code_base_address, self.instr_width) {
            Some(instr) => *instr,
            None => HALT,
        };

        if self.trace.fetch {
            info!("Fetch pc({}) {}", pc, instr);
        }

        if instr.opcode == Opcode::HALT {
            frontend_control.halted = true;
        }

        instr_queue.enqueue(FetchedInstr { pc, instr });
        frontend_control.pc = pc.wrapping_add(self.instr_width);
        perf_counters.fetch_cnt += 1;
    }
}
