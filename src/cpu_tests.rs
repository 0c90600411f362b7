#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use crate::backend::register_alias_table::RAT;
    use crate::cpu::{CPU, CPUConfig, PerfCounters};
    use crate::error::{CpuError, Fault};
    use crate::instructions::instructions::{Opcode, Program, RegisterType, WordType};
    use crate::loader::loader::{load_from_string, LoadError};
    use crate::trace::{NullTraceSink, PipelineView};

    const LOOP: &str = r#"
    MOVC R0,#5
    MOVC R1,#0
    ADDL R1,R1,#3     ; 4008
    SUBL R0,R0,#1
    BNZ #-8           ; back to 4008
    HALT
"#;

    const MEMORY: &str = r#"
    MOVC R0,#100
    MOVC R1,#42
    STORE R1,R0,#4    ; mem[104] = 42
    LOAD R2,R0,#4
    MOVC R3,#8
    STR R2,R0,R3      ; mem[108] = 42
    LDR R4,R0,R3
    ADDL R5,R4,#1
    HALT
"#;

    const FORWARD_BRANCH: &str = r#"
    MOVC R0,#1
    SUBL R1,R0,#1     ; R1 = 0 sets Z
    BZ #12            ; to 4020
    MOVC R2,#99
    MOVC R3,#77
    ADDL R4,R0,#41    ; 4020
    HALT
"#;

    #[test]
    fn test_add() {
        let src = r#"
    MOVC R0,#5
    MOVC R1,#10
    ADD R2,R0,R1
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(0, 5);
        harness.assert_reg_value(1, 10);
        harness.assert_reg_value(2, 15);
        assert_eq!(harness.perf_counters().retire_cnt, 4);
    }

    #[test]
    fn test_same_src_dst_reg() {
        let src = r#"
    MOVC R0,#5
    ADDL R0,R0,#10
    ADD R0,R0,R0
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(0, 30);
    }

    #[test]
    fn test_register_to_register_opcodes() {
        let src = r#"
    MOVC R0,#12
    MOVC R1,#5
    SUB R2,R0,R1
    MUL R3,R0,R1
    DIV R4,R0,R1
    AND R5,R0,R1
    OR R6,R0,R1
    XOR R7,R0,R1
    NOP
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(2, 7);
        harness.assert_reg_value(3, 60);
        harness.assert_reg_value(4, 2);
        harness.assert_reg_value(5, 4);
        harness.assert_reg_value(6, 13);
        harness.assert_reg_value(7, 9);
        // DIV was the last instruction to set the flag
        harness.assert_zero_flag(false);
    }

    #[test]
    fn test_negative_results_wrap() {
        let src = r#"
    MOVC R0,#3
    SUBL R1,R0,#10
    MOVC R2,#2147483647
    ADDL R3,R2,#1
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(1, -7);
        harness.assert_reg_value(3, WordType::MIN);
    }

    #[test]
    fn test_load_store() {
        let mut harness = TestHarness::default();
        harness.run(MEMORY);
        harness.assert_reg_value(2, 42);
        harness.assert_reg_value(4, 42);
        harness.assert_reg_value(5, 43);
        harness.assert_memory_value(104, 42);
        harness.assert_memory_value(108, 42);
    }

    #[test]
    fn test_memory_sees_program_order() {
        let src = r#"
    MOVC R0,#200
    MOVC R1,#5
    STORE R1,R0,#0
    LOAD R2,R0,#0
    ADDL R3,R2,#1
    STORE R3,R0,#0
    LOAD R4,R0,#0
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(2, 5);
        harness.assert_reg_value(4, 6);
        harness.assert_memory_value(200, 6);
    }

    #[test]
    fn test_committing_load_claims_the_first_port() {
        let mut harness = TestHarness::default();
        let mut loaded = Vec::new();
        harness.step(MEMORY, |view| {
            for (port, bus) in view.buses.iter().enumerate() {
                if Some(bus.rob_seq) == view.last_retired {
                    assert_eq!(port, 0, "commit broadcast behind a functional unit");
                    loaded.push(bus.value);
                }
            }
        });
        assert_eq!(loaded, vec![42, 42]);
    }

    #[test]
    fn test_backward_loop() {
        let mut harness = TestHarness::default();
        harness.run(LOOP);
        harness.assert_reg_value(0, 0);
        harness.assert_reg_value(1, 15);

        let perf = harness.perf_counters();
        assert_eq!(perf.retire_cnt, 18);
        // taken four times as predicted, then the exit is mispredicted
        assert_eq!(perf.branch_good_predictions_cnt, 4);
        assert_eq!(perf.branch_misprediction_cnt, 1);
        assert_eq!(perf.pipeline_flushes, 1);
    }

    // Returns the rename table right after the branch with `opcode` was renamed,
    // and the rename table at the end of the cycle of the first flush.
    fn rat_around_flush(harness: &mut TestHarness, src: &str, opcode: Opcode) -> (RAT, RAT) {
        let mut renamed_branch = None;
        let mut after_flush = None;
        harness.step(src, |view| {
            if renamed_branch.is_none() {
                if let Some(renamed) = view.rename_latch {
                    if renamed.instr.opcode == opcode {
                        renamed_branch = Some(view.rat.clone());
                    }
                }
            }
            if view.perf_counters.pipeline_flushes == 1 && after_flush.is_none() {
                after_flush = Some(view.rat.clone());
                assert_eq!(view.rename_latch.map(|renamed| renamed.pc), None);
                assert_eq!(view.fetch_latch.map(|fetched| fetched.pc), None);
            }
        });

        match (renamed_branch, after_flush) {
            (Some(renamed_branch), Some(after_flush)) => (renamed_branch, after_flush),
            _ => panic!("no flush behind a {:?}", opcode),
        }
    }

    #[test]
    fn test_mispredicted_forward_branch_restores_rename_table() {
        let mut harness = TestHarness::default();
        let (renamed_branch, after_flush) = rat_around_flush(&mut harness, FORWARD_BRANCH, Opcode::BZ);
        assert_eq!(after_flush, renamed_branch);

        harness.assert_reg_value(2, 0);
        harness.assert_reg_value(3, 0);
        harness.assert_reg_value(4, 42);
        assert_eq!(harness.perf_counters().branch_misprediction_cnt, 1);
        assert!(harness.perf_counters().squashed_cnt > 0);
    }

    #[test]
    fn test_mispredicted_backward_branch_restores_rename_table() {
        let src = r#"
    MOVC R0,#1
    ADDL R1,R0,#0     ; 4004, clears Z
    BZ #-4            ; predicted taken, falls through
    MOVC R2,#7
    HALT
"#;
        let mut harness = TestHarness::default();
        let (renamed_branch, after_flush) = rat_around_flush(&mut harness, src, Opcode::BZ);
        assert_eq!(after_flush, renamed_branch);

        harness.assert_reg_value(1, 1);
        harness.assert_reg_value(2, 7);
        let perf = harness.perf_counters();
        assert_eq!(perf.branch_misprediction_cnt, 1);
        assert_eq!(perf.branch_good_predictions_cnt, 0);
        assert_eq!(perf.retire_cnt, 5);
    }

    #[test]
    fn test_flush_empties_younger_queue_entries() {
        let mut harness = TestHarness::default();
        let mut checked = false;
        harness.step(FORWARD_BRANCH, |view| {
            if view.perf_counters.pipeline_flushes == 1 && !checked {
                checked = true;
                assert!(view.iq.iter().all(|entry| entry.pc <= 4008));
                assert!(view.rob.iter().all(|(_, slot)| slot.pc <= 4008));
                assert_eq!(view.bis.iter().count(), 1);
                assert_eq!(view.pc, 4020);
            }
        });
        assert!(checked);
    }

    #[test]
    fn test_cmp_feeds_branch() {
        let src = r#"
    MOVC R0,#5
    MOVC R1,#5
    CMP R0,R1
    BZ #12            ; to 4024
    MOVC R2,#1
    HALT
    MOVC R3,#9        ; 4024
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(2, 0);
        harness.assert_reg_value(3, 9);
        // MOVC R3 set the flag last
        harness.assert_zero_flag(false);
    }

    #[test]
    fn test_movc_of_zero_feeds_branch() {
        let src = r#"
    MOVC R0,#0
    BZ #8             ; to 4012
    MOVC R1,#1
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(1, 0);
        harness.assert_zero_flag(true);
        assert_eq!(harness.perf_counters().retire_cnt, 3);
    }

    #[test]
    fn test_bnz_falls_through_on_zero() {
        let src = r#"
    MOVC R0,#4
    SUBL R1,R0,#4
    BNZ #8            ; not taken
    MOVC R2,#1
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(2, 1);
        assert_eq!(harness.perf_counters().branch_misprediction_cnt, 0);
    }

    #[test]
    fn test_jump() {
        let src = r#"
    MOVC R0,#4024
    JUMP R0,#0
    MOVC R1,#1
    MOVC R1,#2
    MOVC R1,#3
    MOVC R1,#4
    ADDL R2,R0,#-24   ; 4024
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(1, 0);
        harness.assert_reg_value(2, 4000);
        // fetch waited for the target, so nothing was thrown away
        assert_eq!(harness.perf_counters().squashed_cnt, 0);
    }

    #[test]
    fn test_running_off_the_end_halts() {
        let src = r#"
    MOVC R0,#3
    ADDL R1,R0,#4
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(1, 7);
        assert_eq!(harness.perf_counters().retire_cnt, 3);
    }

    #[test]
    fn test_commit_is_in_order() {
        let mut harness = TestHarness::default();
        let mut last_retired: Option<u64> = None;
        let mut commits: u64 = 0;
        harness.step(LOOP, |view| {
            if view.last_retired != last_retired {
                assert!(view.last_retired > last_retired,
                        "commit went from {:?} to {:?}", last_retired, view.last_retired);
                last_retired = view.last_retired;
                commits += 1;
            }
        });
        // at most one instruction commits per cycle
        assert_eq!(commits, harness.perf_counters().retire_cnt);
        harness.assert_reg_value(1, 15);
    }

    #[test]
    fn test_mul_latency_and_pipelining() {
        let src = r#"
    MOVC R0,#2
    MOVC R1,#3
    MUL R2,R0,R1
    MUL R3,R0,R1
    MUL R4,R0,R1
    MUL R5,R0,R1
    HALT
"#;
        let mut harness = TestHarness::default();
        let mut issued: HashMap<u64, u64> = HashMap::new();
        let mut broadcast: HashMap<u64, u64> = HashMap::new();
        harness.step(src, |view| {
            if let Some(Some(uop)) = view.eus.mul_stages().first() {
                issued.entry(uop.rob_seq).or_insert(view.cycle);
            }
            for bus in view.buses.iter() {
                if issued.contains_key(&bus.rob_seq) {
                    broadcast.entry(bus.rob_seq).or_insert(view.cycle);
                }
            }
        });

        assert_eq!(issued.len(), 4);
        let mut bus_cycles = Vec::new();
        for (rob_seq, issue_cycle) in &issued {
            let bus_cycle = broadcast[rob_seq];
            assert_eq!(bus_cycle - issue_cycle, 4, "MUL [{}]", rob_seq);
            bus_cycles.push(bus_cycle);
        }
        bus_cycles.sort();
        bus_cycles.dedup();
        // the unit is pipelined, so no two multiplies finish in the same cycle
        assert_eq!(bus_cycles.len(), 4);

        for reg in 2..=5 {
            harness.assert_reg_value(reg, 6);
        }
    }

    #[test]
    fn test_bus_conflict_delays_the_later_unit_by_one_cycle() {
        // the integer unit is busy every cycle while the multiply is in flight
        let src = r#"
    MOVC R0,#2
    MOVC R1,#3
    MUL R2,R0,R1
    ADDL R3,R0,#1
    ADDL R4,R0,#2
    ADDL R5,R0,#3
    ADDL R6,R0,#4
    ADDL R7,R0,#5
    ADDL R3,R0,#6
    HALT
"#;
        let cpu_config = CPUConfig { bus_count: 1, ..TestHarness::new_test_cpu_config() };
        let mut harness = TestHarness::new(cpu_config);
        let mut mul_issued: Option<(u64, u64)> = None;
        let mut mul_broadcast: Option<u64> = None;
        let mut int_issued: HashMap<u64, u64> = HashMap::new();
        let mut int_broadcast: HashMap<u64, u64> = HashMap::new();
        let mut int_latch: HashMap<u64, Option<u64>> = HashMap::new();
        harness.step(src, |view| {
            if let Some(Some(uop)) = view.eus.mul_stages().first() {
                if mul_issued.is_none() {
                    mul_issued = Some((uop.rob_seq, view.cycle));
                }
            }

            let int_seq = view.eus.int().map(|uop| uop.rob_seq);
            if let Some(rob_seq) = int_seq {
                int_issued.entry(rob_seq).or_insert(view.cycle);
            }
            int_latch.insert(view.cycle, int_seq);

            for bus in view.buses.iter() {
                match mul_issued {
                    Some((mul_seq, _)) if mul_seq == bus.rob_seq => {
                        mul_broadcast.get_or_insert(view.cycle);
                    }
                    _ => {
                        int_broadcast.entry(bus.rob_seq).or_insert(view.cycle);
                    }
                }
            }
        });

        let (mul_issue_cycle, mul_bus_cycle) = match (mul_issued, mul_broadcast) {
            (Some((_, issue_cycle)), Some(bus_cycle)) => (issue_cycle, bus_cycle),
            _ => panic!("the multiply never reached the bus"),
        };
        // the multiply unit is evaluated first and always wins the port
        assert_eq!(mul_bus_cycle - mul_issue_cycle, 4);

        let mut delayed = Vec::new();
        for (rob_seq, issue_cycle) in &int_issued {
            match int_broadcast[rob_seq] - issue_cycle {
                1 => {}
                2 => delayed.push(*rob_seq),
                latency => panic!("[{}] took {} cycles", rob_seq, latency),
            }
        }
        assert_eq!(delayed.len(), 1);
        let loser = delayed[0];
        assert_eq!(int_broadcast[&loser], mul_bus_cycle + 1);
        // the unit kept its result and took no new work in the meantime
        assert_eq!(int_latch[&mul_bus_cycle], Some(loser));

        harness.assert_reg_value(2, 6);
        harness.assert_reg_value(3, 8);
        harness.assert_reg_value(7, 7);
    }

    #[test]
    fn test_divide_by_zero_faults_at_commit() {
        let src = r#"
    MOVC R0,#7
    MOVC R1,#0
    DIV R2,R0,R1
    MOVC R3,#1
    HALT
"#;
        let mut harness = TestHarness::default();
        let result = harness.try_run(src);
        assert_eq!(result, Err(CpuError::Fault { pc: 4008, fault: Fault::DivideByZero }));
        harness.assert_reg_value(0, 7);
        harness.assert_reg_value(3, 0);
    }

    #[test]
    fn test_address_out_of_bounds() {
        let src = r#"
    MOVC R0,#5000
    LOAD R1,R0,#0
    HALT
"#;
        let mut harness = TestHarness::default();
        let result = harness.try_run(src);
        assert_eq!(result, Err(CpuError::Fault { pc: 4004, fault: Fault::AddressOutOfBounds(5000) }));

        let src = r#"
    MOVC R0,#-1
    STORE R0,R0,#0
    HALT
"#;
        let mut harness = TestHarness::default();
        let result = harness.try_run(src);
        assert_eq!(result, Err(CpuError::Fault { pc: 4004, fault: Fault::AddressOutOfBounds(-1) }));
    }

    #[test]
    fn test_fault_on_squashed_path_is_ignored() {
        let src = r#"
    MOVC R0,#0
    MOVC R1,#0
    ADDL R2,R0,#0     ; sets Z
    BZ #12            ; to 4024
    DIV R3,R0,R1
    HALT
    MOVC R4,#1        ; 4024
    HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(4, 1);
    }

    #[test]
    fn test_cycle_limit() {
        let src = r#"
    MOVC R0,#1
    ADDL R0,R0,#1     ; 4004
    JUMP R1,#4004
"#;
        let cpu_config = CPUConfig { max_cycles: Some(200), ..TestHarness::new_test_cpu_config() };
        let mut harness = TestHarness::new(cpu_config);
        assert_eq!(harness.try_run(src), Err(CpuError::CycleLimitExceeded(200)));
    }

    #[test]
    fn test_without_branch_speculation() {
        let cpu_config = CPUConfig { branch_speculation: false, ..TestHarness::new_test_cpu_config() };

        let mut harness = TestHarness::new(cpu_config.clone());
        harness.run(LOOP);
        harness.assert_reg_value(0, 0);
        harness.assert_reg_value(1, 15);
        let perf = harness.perf_counters();
        assert_eq!(perf.branch_misprediction_cnt, 0);
        assert_eq!(perf.squashed_cnt, 0);

        let mut harness = TestHarness::new(cpu_config);
        harness.run(FORWARD_BRANCH);
        harness.assert_reg_value(2, 0);
        harness.assert_reg_value(4, 42);
    }

    #[test]
    fn test_tiny_structures_stall_but_agree() {
        let tiny = CPUConfig {
            phys_reg_count: 10,
            iq_capacity: 1,
            lsq_capacity: 1,
            rob_capacity: 2,
            btb_capacity: 1,
            bis_capacity: 1,
            mul_latency: 1,
            bus_count: 1,
            ..TestHarness::new_test_cpu_config()
        };

        for src in [LOOP, MEMORY, FORWARD_BRANCH] {
            let mut reference = TestHarness::default();
            reference.run(src);

            let mut harness = TestHarness::new(tiny.clone());
            harness.run(src);

            assert_eq!(harness.arch_regs(), reference.arch_regs());
            assert!(harness.perf_counters().dispatch_stall_cnt > 0);
        }

        let mut harness = TestHarness::new(tiny);
        harness.run(MEMORY);
        harness.assert_memory_value(104, 42);
        harness.assert_memory_value(108, 42);
    }

    struct TestHarness {
        program: Option<Rc<Program>>,
        cpu: Option<CPU>,
        cpu_config: CPUConfig,
    }

    impl TestHarness {
        fn default() -> TestHarness {
            Self::new(Self::new_test_cpu_config())
        }

        fn new(cpu_config: CPUConfig) -> TestHarness {
            TestHarness {
                program: None,
                cpu: None,
                cpu_config,
            }
        }

        fn new_test_cpu_config() -> CPUConfig {
            let mut cpu_config = CPUConfig::default();
            cpu_config.max_cycles = Some(10_000);
            cpu_config
        }

        fn run(&mut self, src: &str) {
            if let Err(err) = self.try_run(src) {
                panic!("{}", err);
            }
        }

        fn try_run(&mut self, src: &str) -> Result<(), CpuError> {
            let cpu = self.init(src);
            cpu.run(&mut NullTraceSink)
        }

        /// Runs the program a cycle at a time and shows every cycle to `on_cycle`.
        fn step(&mut self, src: &str, mut on_cycle: impl FnMut(&PipelineView<'_>)) {
            let max_cycles = self.cpu_config.max_cycles.unwrap_or(10_000);
            let cpu = self.init(src);
            loop {
                let halted = match cpu.do_cycle() {
                    Ok(halted) => halted,
                    Err(err) => panic!("{}", err),
                };
                on_cycle(&cpu.view());
                if halted {
                    return;
                }
                assert!(cpu.perf_counters().cycle_cnt < max_cycles, "program didn't halt");
            }
        }

        fn init(&mut self, src: &str) -> &mut CPU {
            let program = self.load_program(src);
            self.program = Some(Rc::clone(&program));
            let cpu = match CPU::new(&self.cpu_config, program) {
                Ok(cpu) => cpu,
                Err(err) => panic!("{}", err),
            };
            self.cpu.insert(cpu)
        }

        fn load_program(&mut self, src: &str) -> Rc<Program> {
            let load_result = load_from_string(self.cpu_config.clone(), src.to_string());
            match load_result {
                Ok(p) => Rc::new(p),
                Err(err) => {
                    match err {
                        LoadError::ParseError(msg) => panic!("{}", msg),
                        LoadError::AnalysisError(msg_vec) => {
                            for msg in &msg_vec {
                                println!("{}", msg);
                            }
                            panic!("{} errors in the program", msg_vec.len());
                        }
                        LoadError::NotFoundError(msg) => panic!("{}", msg),
                        LoadError::IOError(msg) => panic!("{}", msg),
                    }
                }
            }
        }

        fn cpu(&self) -> &CPU {
            match self.cpu {
                Some(ref cpu) => cpu,
                None => panic!("CPU is not initialized"),
            }
        }

        fn perf_counters(&self) -> &PerfCounters {
            self.cpu().perf_counters()
        }

        fn arch_regs(&self) -> Vec<WordType> {
            self.cpu().arch_reg_file().values().to_vec()
        }

        fn assert_reg_value(&self, reg: RegisterType, value: WordType) {
            assert_eq!(self.cpu().arch_reg_file().get_value(reg), value, "R{}", reg);
        }

        fn assert_zero_flag(&self, zero: bool) {
            assert_eq!(self.cpu().arch_reg_file().zero_flag(), zero);
        }

        fn assert_memory_value(&self, address: WordType, value: WordType) {
            match self.cpu().memory_subsystem().read(address) {
                Ok(actual_value) => {
                    assert_eq!(actual_value, value, "Memory at {} does not have the expected value", address);
                }
                Err(fault) => panic!("{}", fault),
            }
        }
    }
}
