#![no_std]

extern crate alloc;

pub mod kernel_heap;
pub mod page_alloc;
