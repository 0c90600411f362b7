use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use structopt::StructOpt;

use apex_ooo_sim::cpu::{CPU, CPUConfig, load_cpu_config};
use apex_ooo_sim::error::CpuError;
use apex_ooo_sim::loader::loader::{load, LoadError};
use apex_ooo_sim::trace::{LogTraceSink, NullTraceSink, TraceSink};

const DEFAULT_CONFIG: &str = "cpu.yaml";

#[derive(StructOpt, Debug)]
#[structopt(name = "APEX out-of-order simulator")]
struct Opt {
    /// Path of the instruction listing to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "cpu.yaml")]
    config: PathBuf,

    /// Shows the pipeline after every cycle and waits for a key press
    #[structopt(short, long)]
    step: bool,

    /// Stops after this many cycles
    #[structopt(long)]
    cycles: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config_path = opt.config.to_string_lossy().to_string();
    let cpu_config = if cpu_config_path == DEFAULT_CONFIG && !opt.config.exists() {
        CPUConfig::default()
    } else {
        match load_cpu_config(&cpu_config_path) {
            Ok(config) => config,
            Err(error) => {
                println!("Failed to load {}. Cause: {}", cpu_config_path, error);
                exit(1);
            }
        }
    };

    let path = opt.file.to_string_lossy().to_string();
    println!("Loading {}", path);
    let program = match load(cpu_config.clone(), &path) {
        Ok(p) => Rc::new(p),
        Err(err) => {
            println!("Loading program '{}' failed.", path);
            match err {
                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        println!("{}", msg);
                    }
                }
                LoadError::ParseError(msg) |
                LoadError::NotFoundError(msg) |
                LoadError::IOError(msg) => println!("{}", msg),
            }
            exit(1);
        }
    };

    let mut cpu = match CPU::new(&cpu_config, program) {
        Ok(cpu) => cpu,
        Err(err) => {
            println!("{}", err);
            exit(1);
        }
    };

    let mut log_sink = LogTraceSink { registers: opt.step || cpu_config.trace.registers };
    let mut null_sink = NullTraceSink;
    let sink: &mut dyn TraceSink = if opt.step || cpu_config.trace.cycle {
        &mut log_sink
    } else {
        &mut null_sink
    };

    let result = simulate(&mut cpu, sink, &opt);
    report(&cpu);

    if let Err(err) = result {
        println!("{}", err);
        exit(1);
    }
}

fn simulate(cpu: &mut CPU, sink: &mut dyn TraceSink, opt: &Opt) -> Result<(), CpuError> {
    if !opt.step && opt.cycles.is_none() {
        return cpu.run(sink);
    }

    loop {
        let halted = cpu.do_cycle()?;
        sink.on_cycle(&cpu.view());
        if halted {
            return Ok(());
        }

        if let Some(cycles) = opt.cycles {
            if cpu.perf_counters().cycle_cnt >= cycles {
                return Ok(());
            }
        }

        if opt.step && !wait_for_key() {
            return Ok(());
        }
    }
}

// Returns false when the user asked to quit.
fn wait_for_key() -> bool {
    print!("Press any key to advance CPU Clock or <q> to quit: ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => !line.trim().eq_ignore_ascii_case("q"),
    }
}

fn report(cpu: &CPU) {
    let perf_counters = cpu.perf_counters();
    println!("Simulation Complete, cycles = {} instructions = {}", perf_counters.cycle_cnt, perf_counters.retire_cnt);
    println!("IPC = {:.2}", perf_counters.ipc());
    println!("Branches: good predictions = {} mispredictions = {} flushes = {} squashed = {}",
             perf_counters.branch_good_predictions_cnt,
             perf_counters.branch_misprediction_cnt,
             perf_counters.pipeline_flushes,
             perf_counters.squashed_cnt);
    println!("Stalls: rename = {} dispatch = {} bus = {}",
             perf_counters.rename_stall_cnt,
             perf_counters.dispatch_stall_cnt,
             perf_counters.bus_stall_cnt);

    let arch_reg_file = cpu.arch_reg_file();
    println!("=============== STATE OF ARCHITECTURAL REGISTER FILE ==========");
    for (reg, value) in arch_reg_file.values().iter().enumerate() {
        println!("|\tR{}\t|\t{}\t|", reg, value);
    }
    println!("|\tZ\t|\t{}\t|", arch_reg_file.zero_flag() as u8);

    println!("============== STATE OF DATA MEMORY =============");
    for (address, value) in cpu.memory_subsystem().non_zero() {
        println!("|\tMEM[{}]\t|\tData Value = {}\t|", address, value);
    }
}
