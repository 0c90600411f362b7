use std::fmt;

use log::info;

use crate::backend::branch_prediction::{BIS, BISEntry, BTB};
use crate::backend::execution_unit::{execute, ExecutionUnits, Outcome, Uop};
use crate::backend::forwarding_bus::{BusTag, CDBBroadcast, ForwardingBuses};
use crate::backend::issue_queue::{IQ, IQEntry};
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::{ROB, ROBSlot, ROBSlotKind};
use crate::cpu::{ArchRegFile, CPUConfig, PerfCounters, Trace};
use crate::error::CpuError;
use crate::frontend::frontend::{FrontendControl, InstrQueue};
use crate::instructions::instructions::{FuClass, Instr, Opcode, RegisterType, Source, WordType};
use crate::memory_subsystem::load_store_queue::LSQEntry;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// The parts of the machine outside the backend that its stages read and
/// write. Borrowed from the CPU for one stage at a time.
pub(crate) struct CycleContext<'a> {
    pub(crate) arch_reg_file: &'a mut ArchRegFile,
    pub(crate) memory_subsystem: &'a mut MemorySubsystem,
    pub(crate) frontend_control: &'a mut FrontendControl,
    pub(crate) instr_queue: &'a mut InstrQueue,
    pub(crate) perf_counters: &'a mut PerfCounters,
}

/// An instruction that went through rename and waits for dispatch.
#[derive(Clone, Debug)]
pub struct RenamedInstr {
    pub pc: WordType,
    pub instr: Instr,
    pub source: [Source; 2],
    // the value a store writes
    pub data: Source,
    pub dest: Option<RegisterType>,
    pub prev_phys_reg: Option<RegisterType>,
    pub prev_flag: Option<RegisterType>,
    pub predicted_taken: bool,
    // fetch stopped behind this branch
    pub waited_on: bool,
}

impl RenamedInstr {
    fn held_phys_regs(&self) -> impl Iterator<Item=RegisterType> {
        let own = if self.instr.rd.is_none() { self.dest } else { None };
        self.prev_phys_reg.into_iter().chain(own)
    }
}

impl fmt::Display for RenamedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc({}) {} src1={} src2={}", self.pc, self.instr, self.source[0], self.source[1])?;
        if self.instr.is_store() {
            write!(f, " data={}", self.data)?;
        }
        if let Some(dest) = self.dest {
            write!(f, " dest=P{}", dest)?;
        }
        if self.instr.is_conditional_branch() {
            write!(f, " predicted={}", if self.predicted_taken { "taken" } else { "not-taken" })?;
        }
        Ok(())
    }
}

pub struct Backend {
    pub(crate) rat: RAT,
    pub(crate) phys_reg_file: PhysRegFile,
    pub(crate) rob: ROB,
    pub(crate) iq: IQ,
    pub(crate) btb: BTB,
    pub(crate) bis: BIS,
    pub(crate) eus: ExecutionUnits,
    pub(crate) buses: ForwardingBuses,
    // the latch between rename and dispatch
    pub(crate) renamed: Option<RenamedInstr>,
    // the reorder buffer sequence number of the last committed instruction
    pub(crate) last_retired: Option<u64>,
    instr_width: WordType,
    branch_speculation: bool,
    trace: Trace,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        Backend {
            rat: RAT::new(cpu_config.arch_reg_count),
            phys_reg_file: PhysRegFile::new(cpu_config.phys_reg_count),
            rob: ROB::new(cpu_config.rob_capacity),
            iq: IQ::new(cpu_config.iq_capacity),
            btb: BTB::new(cpu_config.btb_capacity),
            bis: BIS::new(cpu_config.bis_capacity),
            eus: ExecutionUnits::new(cpu_config.mul_latency),
            buses: ForwardingBuses::new(cpu_config.bus_count),
            renamed: None,
            last_retired: None,
            instr_width: cpu_config.instr_width,
            branch_speculation: cpu_config.branch_speculation,
            trace: cpu_config.trace.clone(),
        }
    }

    // Commit the head of the reorder buffer. Returns true once HALT commits.
    pub(crate) fn cycle_retire(&mut self, ctx: &mut CycleContext) -> Result<bool, CpuError> {
        // the buses only carry the broadcasts of a single cycle
        self.buses.clear();

        let (seq, slot) = match self.rob.head() {
            Some((seq, slot)) => (seq, slot.clone()),
            None => return Ok(false),
        };

        match slot.kind {
            ROBSlotKind::Branch => return Ok(false),
            ROBSlotKind::RegToReg => {
                let dest = slot.dest_phys_reg.ok_or_else(|| {
                    CpuError::Inconsistent(format!("{} has no destination register", slot))
                })?;
                if !slot.completed {
                    return Ok(false);
                }
                raise_fault(&slot)?;
                // the result was broadcast, so the register must hold it
                let entry = *self.phys_reg_file.read(dest)?;

                if let Some(arch_reg) = slot.dest_arch_reg {
                    ctx.arch_reg_file.set_value(arch_reg, entry.value);
                }
                if slot.sets_flag {
                    ctx.arch_reg_file.set_zero_flag(entry.zero);
                }
                if let Some(prev) = slot.prev_phys_reg {
                    self.release(prev);
                }
                if slot.dest_arch_reg.is_none() {
                    // CMP only needed its register to hand the flag to branches
                    self.release(dest);
                }
            }
            ROBSlotKind::Load | ROBSlotKind::Store => {
                let entry = match ctx.memory_subsystem.lsq.head() {
                    Some((lsq_seq, entry)) if Some(lsq_seq) == slot.lsq_seq => entry.clone(),
                    _ => return Err(CpuError::Inconsistent(
                        format!("{} is not at the head of the load-store queue", slot))),
                };
                if !entry.is_ready() {
                    return Ok(false);
                }
                raise_fault(&slot)?;

                let fault_at = |fault| CpuError::Fault { pc: slot.pc, fault };
                if entry.is_load {
                    let value = ctx.memory_subsystem.read(entry.address).map_err(fault_at)?;
                    let dest = entry.dest.ok_or_else(|| {
                        CpuError::Inconsistent(format!("{} has no destination register", slot))
                    })?;
                    // commit runs before execute, so the load gets the first port and
                    // the functional units share the rest
                    let broadcast = CDBBroadcast { tag: BusTag::Register(dest), value, zero: value == 0, rob_seq: seq };
                    if !self.buses.broadcast(broadcast) {
                        ctx.perf_counters.bus_stall_cnt += 1;
                        return Ok(false);
                    }
                    if let Some(arch_reg) = slot.dest_arch_reg {
                        ctx.arch_reg_file.set_value(arch_reg, value);
                    }
                    if let Some(prev) = slot.prev_phys_reg {
                        self.release(prev);
                    }
                } else {
                    ctx.memory_subsystem.write(entry.address, entry.data.value).map_err(fault_at)?;
                }
                ctx.memory_subsystem.lsq.pop_head();
            }
            ROBSlotKind::Skip => {
                if slot.bis_seq.is_some() {
                    self.bis.pop_head();
                }
            }
            ROBSlotKind::Halt => {}
        }

        if self.trace.retire {
            info!("Retiring [{}] {}", seq, slot);
        }

        self.rob.pop_head();
        self.last_retired = Some(seq);
        ctx.perf_counters.retire_cnt += 1;
        Ok(slot.kind == ROBSlotKind::Halt)
    }

    // Completes the µops in the last stage of every unit. The multiply unit
    // goes first, back to front, so a multiply claims a bus before the single
    // cycle units.
    pub(crate) fn cycle_eu_table(&mut self, ctx: &mut CycleContext) -> Result<(), CpuError> {
        for fu in [FuClass::Mul, FuClass::Int, FuClass::Logic] {
            self.complete(fu, ctx)?;
            if fu == FuClass::Mul {
                self.eus.advance_mul();
            }
        }
        Ok(())
    }

    fn complete(&mut self, fu: FuClass, ctx: &mut CycleContext) -> Result<(), CpuError> {
        let uop = match self.eus.completing(fu) {
            Some(uop) => uop.clone(),
            None => return Ok(()),
        };

        let effect = execute(&uop, ctx.memory_subsystem.size());
        if self.trace.execute {
            info!("Executing [{}] {} -> {:?}", fu, uop, effect.outcome);
        }

        let delivered = match effect.outcome {
            Outcome::Value { value, zero } => match uop.dest {
                Some(dest) => self.buses.broadcast(
                    CDBBroadcast { tag: BusTag::Register(dest), value, zero, rob_seq: uop.rob_seq }),
                None => true,
            },
            Outcome::Address(address) => match uop.lsq_seq {
                Some(lsq_seq) => self.buses.broadcast(
                    CDBBroadcast { tag: BusTag::LoadStore(lsq_seq), value: address, zero: false, rob_seq: uop.rob_seq }),
                None => true,
            },
            Outcome::Branch { taken, target } => {
                self.eus.retire_completed(fu);
                ctx.perf_counters.execute_cnt += 1;
                return self.resolve_branch(&uop, taken, target, ctx);
            }
        };

        if !delivered {
            // both buses are taken; the unit keeps its result
            ctx.perf_counters.bus_stall_cnt += 1;
            return Ok(());
        }

        if let Some(slot) = self.rob.get_mut(uop.rob_seq) {
            slot.completed = true;
            slot.fault = effect.fault;
        }

        self.eus.retire_completed(fu);
        ctx.perf_counters.execute_cnt += 1;
        Ok(())
    }

    fn resolve_branch(&mut self,
                      uop: &Uop,
                      taken: bool,
                      target: WordType,
                      ctx: &mut CycleContext) -> Result<(), CpuError> {
        let next_pc = if taken { target } else { uop.pc.wrapping_add(self.instr_width) };
        let conditional = uop.opcode != Opcode::JUMP;
        let mispredicted = conditional && !uop.waited_on && taken != uop.predicted_taken;

        if conditional {
            self.btb.record(uop.pc, target, taken);
            if !uop.waited_on {
                if mispredicted {
                    ctx.perf_counters.branch_misprediction_cnt += 1;
                } else {
                    ctx.perf_counters.branch_good_predictions_cnt += 1;
                }
            }
        }

        let bis_seq = match self.rob.get_mut(uop.rob_seq) {
            Some(slot) => {
                slot.kind = ROBSlotKind::Skip;
                slot.bis_seq
            }
            None => return Err(CpuError::Inconsistent(
                format!("branch at pc {} has no reorder buffer entry", uop.pc))),
        };

        if self.trace.execute {
            info!("Resolved pc({}) taken={} next={}", uop.pc, taken, next_pc);
        }

        if mispredicted || uop.waited_on {
            let bis_seq = bis_seq.ok_or_else(|| {
                CpuError::Inconsistent(format!("branch at pc {} has no branch stack entry", uop.pc))
            })?;
            self.flush(uop.rob_seq, bis_seq, next_pc, ctx)?;
        }
        Ok(())
    }

    /// Squashes everything younger than the branch at `rob_seq` and resumes
    /// fetch at `target`.
    fn flush(&mut self,
             rob_seq: u64,
             bis_seq: u64,
             target: WordType,
             ctx: &mut CycleContext) -> Result<(), CpuError> {
        let anchor = match self.bis.get(bis_seq) {
            Some(entry) => *entry,
            None => return Err(CpuError::Inconsistent(format!("no branch stack entry {}", bis_seq))),
        };
        debug_assert_eq!(anchor.rob_seq, rob_seq);

        if self.trace.pipeline_flush {
            info!("Pipeline flush behind pc({}), resuming at {}", anchor.pc, target);
        }

        ctx.memory_subsystem.lsq.truncate(anchor.lsq_tail);
        self.iq.truncate_after_branch(bis_seq);
        self.bis.truncate_after(bis_seq);

        let mut squashed = 0;

        // the rename latch holds the youngest renaming, so it is undone first
        if let Some(renamed) = self.renamed.take() {
            if let Some(dest) = renamed.dest {
                if let Some(arch_reg) = renamed.instr.rd {
                    self.rat.set(arch_reg, renamed.prev_phys_reg);
                }
                if renamed.instr.sets_flag() {
                    self.rat.set_flag(renamed.prev_flag);
                }
                self.phys_reg_file.restore(dest);
            }
            squashed += 1;
        }

        for (_, slot) in self.rob.truncate_after(rob_seq) {
            if let Some(arch_reg) = slot.dest_arch_reg {
                self.rat.set(arch_reg, slot.prev_phys_reg);
            }
            if slot.sets_flag {
                self.rat.set_flag(slot.prev_flag);
            }
            if let Some(dest) = slot.dest_phys_reg {
                self.phys_reg_file.restore(dest);
            }
            squashed += 1;
        }

        self.eus.squash_after(rob_seq);
        self.buses.squash_after(rob_seq);

        if !ctx.instr_queue.is_empty() {
            squashed += 1;
        }
        ctx.instr_queue.flush();
        ctx.frontend_control.redirect(target);

        ctx.perf_counters.pipeline_flushes += 1;
        ctx.perf_counters.squashed_cnt += squashed;
        Ok(())
    }

    // Delivers this cycle's broadcasts: the register file is written and
    // every waiting operand snoops the buses.
    pub(crate) fn cycle_wakeup(&mut self, ctx: &mut CycleContext) {
        let lsq = &mut ctx.memory_subsystem.lsq;
        for broadcast in self.buses.iter() {
            match broadcast.tag {
                BusTag::Register(phys_reg) => {
                    self.phys_reg_file.write(phys_reg, broadcast.value, broadcast.zero);
                    self.iq.wakeup(phys_reg, broadcast.value, broadcast.zero);
                    lsq.wakeup(phys_reg, broadcast.value, broadcast.zero);
                }
                BusTag::LoadStore(lsq_seq) => lsq.resolve_address(lsq_seq, broadcast.value),
            }
        }
    }

    // Sends the oldest ready instruction to its functional unit.
    pub(crate) fn cycle_issue(&mut self, ctx: &mut CycleContext) {
        let eus = &self.eus;
        let entry = match self.iq.select(|fu| eus.is_free(fu)) {
            Some(entry) => entry,
            None => return,
        };

        if self.trace.issue {
            info!("Issued [{}] {}", entry.rob_seq, entry);
        }

        self.eus.accept(Uop::from(entry));
        ctx.perf_counters.issue_cnt += 1;
    }

    // Moves the renamed instruction into the reorder buffer and, depending on
    // its kind, the issue queue, load-store queue and branch stack. Either all
    // of them have room or nothing happens.
    pub(crate) fn cycle_dispatch(&mut self, ctx: &mut CycleContext) {
        let instr = match &self.renamed {
            Some(renamed) => renamed.instr,
            None => return,
        };

        let fu = instr.fu_class();
        let lsq = &mut ctx.memory_subsystem.lsq;
        let has_room = self.rob.has_space()
            && (fu.is_none() || self.iq.has_space())
            && (!instr.is_memory() || lsq.has_space())
            && (!instr.is_control() || self.bis.has_space());
        if !has_room {
            ctx.perf_counters.dispatch_stall_cnt += 1;
            return;
        }

        let mut renamed = match self.renamed.take() {
            Some(renamed) => renamed,
            None => return,
        };

        // a result may have arrived while the instruction sat in the latch
        for source in renamed.source.iter_mut() {
            self.refresh(source);
        }
        self.refresh(&mut renamed.data);

        let rob_seq = self.rob.next_seq();
        let bis_tag = self.bis.tail_seq();

        let lsq_seq = if instr.is_load() {
            renamed.dest.map(|dest| lsq.allocate(LSQEntry::load(dest, rob_seq)))
        } else if instr.is_store() {
            Some(lsq.allocate(LSQEntry::store(renamed.data, rob_seq)))
        } else {
            None
        };

        let bis_seq = if instr.is_control() {
            Some(self.bis.push(BISEntry { pc: renamed.pc, rob_seq, lsq_tail: lsq.tail_seq() }))
        } else {
            None
        };

        let kind = match instr.opcode {
            Opcode::NOP => ROBSlotKind::Skip,
            Opcode::HALT => ROBSlotKind::Halt,
            _ if instr.is_load() => ROBSlotKind::Load,
            _ if instr.is_store() => ROBSlotKind::Store,
            _ if instr.is_control() => ROBSlotKind::Branch,
            _ => ROBSlotKind::RegToReg,
        };

        let mut slot = ROBSlot::new(kind, renamed.pc, instr.opcode);
        slot.dest_phys_reg = renamed.dest;
        slot.prev_phys_reg = renamed.prev_phys_reg;
        slot.dest_arch_reg = instr.rd;
        slot.sets_flag = instr.sets_flag();
        slot.prev_flag = renamed.prev_flag;
        slot.lsq_seq = lsq_seq;
        slot.bis_seq = bis_seq;
        let allocated = self.rob.allocate(slot);
        debug_assert_eq!(allocated, rob_seq);

        if let Some(fu) = fu {
            self.iq.allocate(IQEntry {
                rob_seq,
                pc: renamed.pc,
                opcode: instr.opcode,
                fu,
                literal: instr.imm,
                source: renamed.source,
                // a load's register is written at commit, not by its unit
                dest: if instr.is_memory() { None } else { renamed.dest },
                lsq_seq,
                bis_tag,
                predicted_taken: renamed.predicted_taken,
                waited_on: renamed.waited_on,
            });
        }

        if self.trace.dispatch {
            info!("Dispatched [{}] {}", rob_seq, renamed);
        }
        ctx.perf_counters.dispatch_cnt += 1;
    }

    // Renames the fetched instruction. Runs only when the dispatch latch is
    // free, so a stalled dispatch stalls rename and fetch behind it.
    pub(crate) fn cycle_rename(&mut self, ctx: &mut CycleContext) {
        if self.renamed.is_some() {
            return;
        }

        let fetched = match ctx.instr_queue.peek() {
            Some(fetched) => *fetched,
            None => return,
        };
        let instr = fetched.instr;

        // sources are read before the destination is remapped
        let (source, data) = self.rename_sources(&instr, ctx.arch_reg_file);

        let dest = if instr.needs_phys_reg() {
            match self.phys_reg_file.allocate() {
                Some(phys_reg) => Some(phys_reg),
                None => {
                    ctx.perf_counters.rename_stall_cnt += 1;
                    return;
                }
            }
        } else {
            None
        };

        let mut renamed = RenamedInstr {
            pc: fetched.pc,
            instr,
            source,
            data,
            dest,
            prev_phys_reg: None,
            prev_flag: None,
            predicted_taken: false,
            waited_on: false,
        };

        if let Some(phys_reg) = dest {
            if let Some(arch_reg) = instr.rd {
                renamed.prev_phys_reg = self.rat.set(arch_reg, Some(phys_reg));
            }
            if instr.sets_flag() {
                renamed.prev_flag = self.rat.set_flag(Some(phys_reg));
            }
        }

        match instr.opcode {
            Opcode::BZ | Opcode::BNZ if self.branch_speculation => {
                renamed.predicted_taken = self.btb.predict(fetched.pc, instr.imm);
                if renamed.predicted_taken {
                    // fetch runs later this cycle and picks up the target
                    ctx.frontend_control.pc = fetched.pc.wrapping_add(instr.imm);
                }
            }
            Opcode::BZ | Opcode::BNZ | Opcode::JUMP => {
                renamed.waited_on = true;
                ctx.frontend_control.waiting_on_branch = true;
            }
            _ => {}
        }

        if self.trace.rename {
            info!("Renamed {}", renamed);
        }

        ctx.instr_queue.dequeue();
        self.renamed = Some(renamed);
        ctx.perf_counters.rename_cnt += 1;
    }

    fn rename_sources(&self, instr: &Instr, arch_reg_file: &ArchRegFile) -> ([Source; 2], Source) {
        let read = |arch_reg: Option<RegisterType>| match arch_reg {
            Some(arch_reg) => self.read_register(arch_reg, arch_reg_file),
            None => Source::unused(),
        };

        match instr.opcode {
            Opcode::STORE | Opcode::STR => ([read(instr.rs2), read(instr.rs3)], read(instr.rs1)),
            Opcode::BZ | Opcode::BNZ => ([self.read_flag(arch_reg_file), Source::unused()], Source::unused()),
            _ => ([read(instr.rs1), read(instr.rs2)], Source::unused()),
        }
    }

    fn read_register(&self, arch_reg: RegisterType, arch_reg_file: &ArchRegFile) -> Source {
        match self.rat.get(arch_reg) {
            Some(phys_reg) => self.read_phys_reg(phys_reg),
            None => Source::ready(arch_reg_file.get_value(arch_reg), false),
        }
    }

    fn read_flag(&self, arch_reg_file: &ArchRegFile) -> Source {
        match self.rat.flag() {
            Some(phys_reg) => self.read_phys_reg(phys_reg),
            None => Source::ready(0, arch_reg_file.zero_flag()),
        }
    }

    fn read_phys_reg(&self, phys_reg: RegisterType) -> Source {
        let entry = self.phys_reg_file.get(phys_reg);
        if entry.valid {
            return Source { valid: true, tag: Some(phys_reg), value: entry.value, zero: entry.zero };
        }

        // a value on the bus this cycle counts as available
        if let Some(broadcast) = self.buses.carrying(phys_reg) {
            return Source { valid: true, tag: Some(phys_reg), value: broadcast.value, zero: broadcast.zero };
        }

        Source::waiting(phys_reg)
    }

    fn refresh(&self, source: &mut Source) {
        if let (false, Some(tag)) = (source.valid, source.tag) {
            let entry = self.phys_reg_file.get(tag);
            if entry.valid {
                source.capture(tag, entry.value, entry.zero);
            }
        }
    }

    fn release(&mut self, phys_reg: RegisterType) {
        self.phys_reg_file.release(phys_reg);
        self.rat.forget_flag(phys_reg);
        self.rob.forget_prev_flag(phys_reg);
        if let Some(renamed) = self.renamed.as_mut() {
            if renamed.prev_flag == Some(phys_reg) {
                renamed.prev_flag = None;
            }
        }
    }

    /// Checks that every physical register has exactly one owner: the free
    /// list, the rename table, or an in-flight instruction that will release
    /// it when it commits.
    pub fn verify_register_ownership(&self) -> Result<(), CpuError> {
        let mut owners = vec![0u32; self.phys_reg_file.count() as usize];

        let owned = self.phys_reg_file.free_list().iter()
            .chain(self.rat.mapped())
            .chain(self.rob.iter().flat_map(|(_, slot)| slot.held_phys_regs()))
            .chain(self.renamed.iter().flat_map(|renamed| renamed.held_phys_regs()));
        for phys_reg in owned {
            owners[phys_reg as usize] += 1;
        }

        for (phys_reg, count) in owners.iter().enumerate() {
            if *count != 1 {
                return Err(CpuError::Inconsistent(format!("P{} has {} owners", phys_reg, count)));
            }
        }
        Ok(())
    }
}

fn raise_fault(slot: &ROBSlot) -> Result<(), CpuError> {
    match slot.fault {
        Some(fault) => Err(CpuError::Fault { pc: slot.pc, fault }),
        None => Ok(()),
    }
}
