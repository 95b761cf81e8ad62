//! Boot configuration: the structs describing what to boot and the
//! parser for the line-oriented `boot.cfg` dialect.
//!
//! A configuration normally comes from a file; the optional `options`
//! feature adds the UEFI load-option keys that can replace or override
//! it from the command line.
#![cfg_attr(not(test), no_std)]
extern crate alloc;

mod config;
pub use config::{parse_config, Config, Module};

#[cfg(feature = "options")]
mod options;
#[cfg(feature = "options")]
pub use options::{parse_load_options, ConfigSource, LoadOptionKey, CONFIG_FILE};
