//! Pipeline components and the workers backing them.

pub mod base;
pub mod fan_in;
pub mod fan_out;
pub mod generator;
pub mod or_done;
pub mod pool;
pub mod stage;
pub mod tee;
