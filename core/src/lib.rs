#![no_std]

#[cfg(test)]
extern crate std;

pub mod scheduler;

pub use scheduler::per_cpu;
pub use scheduler::runtime;
pub use scheduler::sched;
pub use scheduler::task;
pub use scheduler::task_event;
pub use scheduler::timer;
