//! Virtual-memory mapping layer.
//!
//! A [`vm::Region`] is one contiguous mapping inside an address space. It is
//! backed by a shareable [`vm::VMObject`] and installs its pages into a
//! [`memory::page_directory::PageDirectory`]. Hardware faults raised against
//! the mapping are resolved by [`vm::Region::handle_fault`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod vm;
