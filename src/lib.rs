pub mod backend;
pub mod cpu;
pub mod error;
pub mod frontend;
pub mod instructions;
pub mod loader;
pub mod memory_subsystem;
pub mod trace;

#[cfg(test)]
mod cpu_tests;
