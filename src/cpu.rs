use std::error::Error;
use std::fs::File;
use std::rc::Rc;

use log::info;
use serde::Deserialize;

use crate::backend::backend::{Backend, CycleContext};
use crate::error::CpuError;
use crate::frontend::frontend::{Frontend, FrontendControl, InstrQueue};
use crate::instructions::instructions::{Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::trace::{PipelineView, TraceSink};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub cycle_cnt: u64,
    pub fetch_cnt: u64,
    pub rename_cnt: u64,
    pub dispatch_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    // instructions completed, HALT included
    pub retire_cnt: u64,
    pub branch_good_predictions_cnt: u64,
    pub branch_misprediction_cnt: u64,
    pub pipeline_flushes: u64,
    // instructions thrown away by flushes
    pub squashed_cnt: u64,
    pub rename_stall_cnt: u64,
    pub dispatch_stall_cnt: u64,
    pub bus_stall_cnt: u64,
}

impl PerfCounters {
    pub fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retire_cnt as f32 / self.cycle_cnt as f32
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Trace {
    pub fetch: bool,
    pub rename: bool,
    pub dispatch: bool,
    pub issue: bool,
    pub execute: bool,
    pub retire: bool,
    pub pipeline_flush: bool,
    pub cycle: bool,
    pub registers: bool,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CPUConfig {
    // the number of architectural registers
    pub arch_reg_count: u16,
    // the number of physical registers
    pub phys_reg_count: u16,
    // the size of the data memory in words
    pub memory_size: u32,
    // the capacity of the issue queue
    pub iq_capacity: u16,
    // the capacity of the load-store queue
    pub lsq_capacity: u16,
    // the capacity of the reorder buffer
    pub rob_capacity: u16,
    // the capacity of the branch target buffer
    pub btb_capacity: u16,
    // the capacity of the branch instruction stack
    pub bis_capacity: u16,
    // the address of the first instruction
    pub code_base_address: WordType,
    // the width of an instruction in bytes
    pub instr_width: WordType,
    // the number of stages of the multiply unit
    pub mul_latency: u8,
    // the number of results that can be broadcast per cycle
    pub bus_count: u8,
    // if fetch continues down the predicted path of a conditional branch
    pub branch_speculation: bool,
    // stop with an error if HALT hasn't committed after this many cycles
    pub max_cycles: Option<u64>,
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            arch_reg_count: 8,
            phys_reg_count: 15,
            memory_size: 4096,
            iq_capacity: 8,
            lsq_capacity: 4,
            rob_capacity: 12,
            btb_capacity: 4,
            bis_capacity: 8,
            code_base_address: 4000,
            instr_width: 4,
            mul_latency: 4,
            bus_count: 2,
            branch_speculation: true,
            max_cycles: None,
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    /// Rejects configurations the core can't make progress with.
    pub fn validate(&self) -> Result<(), CpuError> {
        let invalid = |msg: &str| Err(CpuError::InvalidConfig(msg.to_string()));

        if self.arch_reg_count == 0 {
            return invalid("arch_reg_count must be at least 1");
        }
        if self.phys_reg_count <= self.arch_reg_count {
            return invalid("phys_reg_count must exceed arch_reg_count");
        }
        if self.memory_size == 0 {
            return invalid("memory_size must be at least 1");
        }
        if self.iq_capacity == 0 || self.lsq_capacity == 0 || self.rob_capacity == 0 || self.bis_capacity == 0 {
            return invalid("queue capacities must be at least 1");
        }
        if self.instr_width <= 0 {
            return invalid("instr_width must be positive");
        }
        if self.mul_latency == 0 {
            return invalid("mul_latency must be at least 1");
        }
        if self.bus_count == 0 {
            return invalid("bus_count must be at least 1");
        }
        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

/// The committed register state and the committed zero flag.
pub struct ArchRegFile {
    values: Vec<WordType>,
    zero_flag: bool,
}

impl ArchRegFile {
    pub fn new(arch_reg_count: u16) -> ArchRegFile {
        ArchRegFile { values: vec![0; arch_reg_count as usize], zero_flag: false }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.values[reg as usize]
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.values[reg as usize] = value;
    }

    pub fn zero_flag(&self) -> bool {
        self.zero_flag
    }

    pub fn set_zero_flag(&mut self, zero: bool) {
        self.zero_flag = zero;
    }

    pub fn values(&self) -> &[WordType] {
        &self.values
    }
}

/// A step of the clock. Every stage is evaluated once per cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Commit,
    Execute,
    Wakeup,
    Issue,
    Dispatch,
    Rename,
    Fetch,
}

/// Stages run back to front, so a stage sees what the stage after it freed up
/// in the same cycle, and a result broadcast this cycle is visible to issue,
/// dispatch and rename this cycle.
pub const EVALUATION_ORDER: [Stage; 7] = [
    Stage::Commit,
    Stage::Execute,
    Stage::Wakeup,
    Stage::Issue,
    Stage::Dispatch,
    Stage::Rename,
    Stage::Fetch,
];

pub struct CPU {
    frontend: Frontend,
    frontend_control: FrontendControl,
    // the latch between fetch and rename
    instr_queue: InstrQueue,
    backend: Backend,
    memory_subsystem: MemorySubsystem,
    arch_reg_file: ArchRegFile,
    perf_counters: PerfCounters,
    max_cycles: Option<u64>,
    trace: Trace,
}

impl CPU {
    pub fn new(cpu_config: &CPUConfig, program: Rc<Program>) -> Result<CPU, CpuError> {
        cpu_config.validate()?;

        Ok(CPU {
            frontend: Frontend::new(cpu_config, program),
            frontend_control: FrontendControl::new(cpu_config.code_base_address),
            instr_queue: InstrQueue::new(),
            backend: Backend::new(cpu_config),
            memory_subsystem: MemorySubsystem::new(cpu_config),
            arch_reg_file: ArchRegFile::new(cpu_config.arch_reg_count),
            perf_counters: PerfCounters::default(),
            max_cycles: cpu_config.max_cycles,
            trace: cpu_config.trace.clone(),
        })
    }

    /// Advances the clock by one cycle. Returns true when HALT committed.
    pub fn do_cycle(&mut self) -> Result<bool, CpuError> {
        self.perf_counters.cycle_cnt += 1;

        for stage in EVALUATION_ORDER {
            let CPU {
                frontend,
                frontend_control,
                instr_queue,
                backend,
                memory_subsystem,
                arch_reg_file,
                perf_counters,
                ..
            } = self;
            let mut ctx = CycleContext { arch_reg_file, memory_subsystem, frontend_control, instr_queue, perf_counters };

            match stage {
                Stage::Commit => {
                    if backend.cycle_retire(&mut ctx)? {
                        return Ok(true);
                    }
                }
                Stage::Execute => backend.cycle_eu_table(&mut ctx)?,
                Stage::Wakeup => backend.cycle_wakeup(&mut ctx),
                Stage::Issue => backend.cycle_issue(&mut ctx),
                Stage::Dispatch => backend.cycle_dispatch(&mut ctx),
                Stage::Rename => backend.cycle_rename(&mut ctx),
                Stage::Fetch => frontend.do_cycle(ctx.frontend_control, ctx.instr_queue, ctx.perf_counters),
            }
        }

        if cfg!(debug_assertions) {
            self.backend.verify_register_ownership()?;
        }

        if self.trace.cycle {
            let perf_counters = &self.perf_counters;
            info!("[Cycles:{}][Fetched={}][Renamed={}][Dispatched={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                  perf_counters.cycle_cnt,
                  perf_counters.fetch_cnt,
                  perf_counters.rename_cnt,
                  perf_counters.dispatch_cnt,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retire_cnt,
                  perf_counters.ipc());
        }

        Ok(false)
    }

    /// Runs until HALT commits, an instruction faults, or the cycle limit is
    /// reached. The sink sees the machine after every cycle.
    pub fn run(&mut self, sink: &mut dyn TraceSink) -> Result<(), CpuError> {
        loop {
            let halted = self.do_cycle()?;
            sink.on_cycle(&self.view());
            if halted {
                return Ok(());
            }

            if let Some(max_cycles) = self.max_cycles {
                if self.perf_counters.cycle_cnt >= max_cycles {
                    return Err(CpuError::CycleLimitExceeded(max_cycles));
                }
            }
        }
    }

    /// A read-only view of every latch and structure of the core.
    pub fn view(&self) -> PipelineView<'_> {
        PipelineView {
            cycle: self.perf_counters.cycle_cnt,
            pc: self.frontend_control.pc,
            fetch_latch: self.instr_queue.peek(),
            rename_latch: self.backend.renamed.as_ref(),
            iq: &self.backend.iq,
            lsq: &self.memory_subsystem.lsq,
            rob: &self.backend.rob,
            eus: &self.backend.eus,
            buses: &self.backend.buses,
            rat: &self.backend.rat,
            phys_reg_file: &self.backend.phys_reg_file,
            btb: &self.backend.btb,
            bis: &self.backend.bis,
            arch_reg_file: &self.arch_reg_file,
            memory_subsystem: &self.memory_subsystem,
            perf_counters: &self.perf_counters,
            last_retired: self.backend.last_retired,
        }
    }

    pub fn arch_reg_file(&self) -> &ArchRegFile {
        &self.arch_reg_file
    }

    pub fn memory_subsystem(&self) -> &MemorySubsystem {
        &self.memory_subsystem
    }

    pub fn perf_counters(&self) -> &PerfCounters {
        &self.perf_counters
    }
}
