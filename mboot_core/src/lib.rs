//! This library contains the firmware-independent half of mboot:
//! the memory-map model, the ELF registrar, the relocation engine,
//! the boot-information builders and the hand-off ABI.
//!
//! Nothing in here talks to the firmware. The `mboot` application feeds
//! this library a captured memory map and raw file buffers and gets back
//! a relocation table, an installed trampoline and a boot information
//! block whose pointers are valid *after* the final copy pass.
#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod elf;
pub mod error;
pub mod handoff;
pub mod info;
pub mod mem;
pub mod reloc;

pub use error::{Error, ErrorKind, Result};
