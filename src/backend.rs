pub mod backend;
pub mod branch_prediction;
pub mod execution_unit;
pub mod forwarding_bus;
pub mod issue_queue;
pub mod physical_register;
pub mod register_alias_table;
pub mod reorder_buffer;
