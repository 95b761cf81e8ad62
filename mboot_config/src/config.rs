//! The boot configuration.
//!
//! `boot.cfg` is line-oriented: one `key=value` per line, `#` starts a
//! comment, list values are separated by ` --- `. Unrecognized keys are
//! reported and skipped so newer configurations keep booting on older
//! loaders.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{error, warn};

use mboot_core::{Error, ErrorKind, Result};

/// A module to be loaded for the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub image: String,
    pub argv: Option<String>,
}

impl Module {
    /// "path options...", the way the kernel sees it.
    pub fn cmdline(&self) -> String {
        match &self.argv {
            Some(argv) if !argv.is_empty() => {
                let mut s = self.image.clone();
                s.push(' ');
                s.push_str(argv);
                s
            }
            _ => self.image.clone(),
        }
    }
}

/// Everything a `boot.cfg` can say, with defaults for what it left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub kernel: String,
    pub kernel_opts: Option<String>,
    pub modules: Vec<Module>,
    pub acpi_tables: Vec<String>,
    pub title: Option<String>,
    /// base directory prepended to relative paths
    pub prefix: Option<String>,
    /// suppress the BOOTIF= command-line injection on network boots
    pub no_bootif: bool,
    /// seconds before the default entry boots
    pub timeout: u32,
    pub no_quirks: bool,
    /// tell the kernel not to use UEFI runtime services
    pub no_rts: bool,
    pub crypto: Option<String>,
    pub runtime_watchdog: bool,
    pub runtime_watchdog_timeout: u32,
    pub tftp_block_size: Option<u32>,
    /// abort with success so the firmware advances its boot order
    pub skip: bool,
    /// seconds to hold an error diagnostic; negative means forever
    pub error_timeout: i32,
    pub log_level: Option<String>,
    /// the path of the configuration file itself
    pub src: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel: String::new(),
            kernel_opts: None,
            modules: Vec::new(),
            acpi_tables: Vec::new(),
            title: None,
            prefix: None,
            no_bootif: false,
            timeout: 5,
            no_quirks: false,
            no_rts: false,
            crypto: None,
            runtime_watchdog: false,
            runtime_watchdog_timeout: 60,
            tftp_block_size: None,
            skip: false,
            error_timeout: 30,
            log_level: None,
            src: String::new(),
        }
    }
}

impl Config {
    /// Every path this configuration will open on the boot volume.
    pub fn needed_files(&mut self) -> Vec<&mut String> {
        let mut files = Vec::new();
        files.push(&mut self.kernel);
        for module in &mut self.modules {
            files.push(&mut module.image);
        }
        for table in &mut self.acpi_tables {
            files.push(table);
        }
        if let Some(crypto) = &mut self.crypto {
            files.push(crypto);
        }
        files
    }

    /// The kernel command line: "path options...".
    pub fn kernel_cmdline(&self) -> String {
        match &self.kernel_opts {
            Some(opts) if !opts.is_empty() => {
                let mut s = self.kernel.clone();
                s.push(' ');
                s.push_str(opts);
                s
            }
            _ => self.kernel.clone(),
        }
    }
}

/// Parse a configuration file.
pub fn parse_config(text: &str) -> Result<Config> {
    let mut config = Config::default();
    let mut have_kernel = false;
    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            error!("line {}: expected key=value, got '{line}'", number + 1);
            return Err(Error::new(ErrorKind::Syntax));
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "kernel" => {
                config.kernel = value.to_string();
                have_kernel = true;
            }
            "kernelopt" => config.kernel_opts = Some(value.to_string()),
            "modules" => {
                config.modules = split_list(value)
                    .map(|item| {
                        let (image, argv) = item.split_once(' ').unwrap_or((item, ""));
                        Module {
                            image: image.to_string(),
                            argv: (!argv.is_empty()).then(|| argv.trim().to_string()),
                        }
                    })
                    .collect();
            }
            "acpitables" => {
                config.acpi_tables = split_list(value).map(ToString::to_string).collect();
            }
            "title" => config.title = Some(value.to_string()),
            "prefix" => config.prefix = Some(value.to_string()),
            "crypto" => config.crypto = Some(value.to_string()),
            "nobootif" => config.no_bootif = parse_bool(number, key, value)?,
            "noquirks" => config.no_quirks = parse_bool(number, key, value)?,
            "norts" => config.no_rts = parse_bool(number, key, value)?,
            "runtimewd" => config.runtime_watchdog = parse_bool(number, key, value)?,
            "skip" => config.skip = parse_bool(number, key, value)?,
            "timeout" => config.timeout = parse_number(number, key, value)?,
            "runtimewdtimeout" => {
                config.runtime_watchdog_timeout = parse_number(number, key, value)?;
            }
            "tftpblksize" => config.tftp_block_size = Some(parse_number(number, key, value)?),
            "errtimeout" => config.error_timeout = parse_number(number, key, value)?,
            _ => warn!("line {}: ignoring unknown option '{key}'", number + 1),
        }
    }
    if !have_kernel {
        error!("the configuration does not name a kernel");
        return Err(Error::new(ErrorKind::InvalidParameter));
    }
    Ok(config)
}

/// List values are separated by ` --- `.
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split("---").map(str::trim).filter(|item| !item.is_empty())
}

fn parse_bool(number: usize, key: &str, value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => {
            error!("line {}: {key} must be 0 or 1, got '{value}'", number + 1);
            Err(Error::new(ErrorKind::Syntax))
        }
    }
}

fn parse_number<T: core::str::FromStr>(number: usize, key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        error!("line {}: {key} must be a number, got '{value}'", number + 1);
        Error::new(ErrorKind::Syntax)
    })
}
