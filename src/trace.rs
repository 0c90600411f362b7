//! Observation of the core between cycles.
//!
//! After every cycle the CPU hands a [`PipelineView`] to a [`TraceSink`]. The
//! view only borrows the core, so a sink can't change what it looks at.

use log::info;

use crate::backend::backend::RenamedInstr;
use crate::backend::branch_prediction::{BIS, BTB};
use crate::backend::execution_unit::ExecutionUnits;
use crate::backend::forwarding_bus::ForwardingBuses;
use crate::backend::issue_queue::IQ;
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::ROB;
use crate::cpu::{ArchRegFile, PerfCounters};
use crate::frontend::frontend::FetchedInstr;
use crate::instructions::instructions::WordType;
use crate::memory_subsystem::load_store_queue::LoadStoreQueue;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

pub struct PipelineView<'a> {
    pub cycle: u64,
    // the next pc fetch will use
    pub pc: WordType,
    pub fetch_latch: Option<&'a FetchedInstr>,
    pub rename_latch: Option<&'a RenamedInstr>,
    pub iq: &'a IQ,
    pub lsq: &'a LoadStoreQueue,
    pub rob: &'a ROB,
    pub eus: &'a ExecutionUnits,
    pub buses: &'a ForwardingBuses,
    pub rat: &'a RAT,
    pub phys_reg_file: &'a PhysRegFile,
    pub btb: &'a BTB,
    pub bis: &'a BIS,
    pub arch_reg_file: &'a ArchRegFile,
    pub memory_subsystem: &'a MemorySubsystem,
    pub perf_counters: &'a PerfCounters,
    pub last_retired: Option<u64>,
}

impl PipelineView<'_> {
    /// The stage contents, one line per latch or queue entry.
    pub fn pipeline_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let empty = || "EMPTY".to_string();

        lines.push(format!("Fetch      : {}", self.fetch_latch.map_or_else(empty, |f| f.to_string())));
        lines.push(format!("DR1->DR2   : {}", self.rename_latch.map_or_else(empty, |r| r.to_string())));
        for entry in self.iq.iter() {
            lines.push(format!("IQ         : [{}] {}", entry.rob_seq, entry));
        }
        for (seq, entry) in self.lsq.iter() {
            lines.push(format!("LSQ        : [{}] {}", seq, entry));
        }
        lines.push(format!("INT        : {}", self.eus.int().map_or_else(empty, |u| u.to_string())));
        lines.push(format!("LOP        : {}", self.eus.logic().map_or_else(empty, |u| u.to_string())));
        for (stage, uop) in self.eus.mul_stages().iter().enumerate() {
            lines.push(format!("MUL{}       : {}", stage + 1, uop.as_ref().map_or_else(empty, |u| u.to_string())));
        }
        for broadcast in self.buses.iter() {
            lines.push(format!("BUS        : {}", broadcast));
        }
        for (seq, slot) in self.rob.iter() {
            lines.push(format!("ROB        : [{}] {}", seq, slot));
        }
        for entry in self.btb.iter() {
            lines.push(format!("BTB        : pc({}) target={} taken={}", entry.pc, entry.target, entry.taken));
        }
        for (seq, entry) in self.bis.iter() {
            lines.push(format!("BIS        : [{}] pc({}) rob={}", seq, entry.pc, entry.rob_seq));
        }
        lines
    }

    /// The rename table, the physical registers and the architectural state.
    pub fn register_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        let rat: Vec<String> = self.rat.entries().iter()
            .enumerate()
            .map(|(arch_reg, entry)| match entry {
                Some(phys_reg) => format!("R{}->P{}", arch_reg, phys_reg),
                None => format!("R{}->ARF", arch_reg),
            })
            .collect();
        let flag = self.rat.flag().map_or_else(|| "ARF".to_string(), |p| format!("P{}", p));
        lines.push(format!("RAT : {} Z->{}", rat.join(" "), flag));

        for (phys_reg, entry) in self.phys_reg_file.entries().iter().enumerate() {
            if entry.valid {
                lines.push(format!("P{:<3}: value={} Z={}", phys_reg, entry.value, entry.zero as u8));
            }
        }
        let free: Vec<String> = self.phys_reg_file.free_list().iter().map(|p| format!("P{}", p)).collect();
        lines.push(format!("Free: {}", free.join(" ")));

        let arch: Vec<String> = self.arch_reg_file.values().iter()
            .enumerate()
            .map(|(reg, value)| format!("R{}={}", reg, value))
            .collect();
        lines.push(format!("ARF : {} Z={}", arch.join(" "), self.arch_reg_file.zero_flag() as u8));
        lines
    }
}

pub trait TraceSink {
    fn on_cycle(&mut self, view: &PipelineView<'_>);
}

/// Discards every view.
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn on_cycle(&mut self, _view: &PipelineView<'_>) {}
}

/// Renders every view through the `log` facade.
pub struct LogTraceSink {
    pub registers: bool,
}

impl TraceSink for LogTraceSink {
    fn on_cycle(&mut self, view: &PipelineView<'_>) {
        info!("--------------------------------- CLOCK CYCLE {} ---------------------------------", view.cycle);
        for line in view.pipeline_lines() {
            info!("{}", line);
        }
        if self.registers {
            for line in view.register_lines() {
                info!("{}", line);
            }
        }
    }
}
