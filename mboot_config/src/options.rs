use core::fmt;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{error, info, trace};
use miniarg::{ArgumentIterator, Key};

use super::{Config, Module};

/// The configuration file used when no `-config` option says otherwise.
pub const CONFIG_FILE: &str = "boot.cfg";

/// What the command line resolved to.
pub enum ConfigSource {
    File(String),
    Given(Config),
}

/// The keys the loader accepts on its command line.
#[derive(Debug, Key)]
pub enum LoadOptionKey {
    /// Read this configuration file rather than the default boot.cfg.
    Config,
    /// Boot this kernel directly, without any configuration file.
    Kernel,
    /// Command line for a kernel given via `-kernel`.
    KernelOpt,
    /// A module (with optional args) for a kernel given via `-kernel`;
    /// repeatable.
    Module,
    /// How chatty the log should be.
    LogLevel,
    /// Print the available options.
    Help,
    /// Print version and build details.
    #[cfg(target_os = "uefi")]
    Version,
}

/// Turn the load options into a [`ConfigSource`].
///
/// `Ok(None)` means `-help` or `-version` already printed their answer
/// and there is nothing to boot. Malformed options (unknown keys, keys
/// missing their value and the like) are an error.
pub fn parse_load_options(
    load_options: &str,
    #[allow(unused_variables)]
    version_info: &str,
) -> Result<Option<ConfigSource>, ()> {
    let options = LoadOptionKey::parse(load_options);
    let mut config_file = None;
    let mut kernel = None;
    let mut kernel_opts = None;
    let mut log_level = None;
    let mut modules = Vec::<&str>::new();
    for option in options {
        match option {
            Ok((key, value)) => {
                trace!("option: {key} => {value}");
                match key {
                    LoadOptionKey::Config => config_file = Some(value),
                    LoadOptionKey::Kernel => kernel = Some(value),
                    LoadOptionKey::KernelOpt => kernel_opts = Some(value),
                    LoadOptionKey::Module => modules.push(value),
                    LoadOptionKey::LogLevel => log_level = Some(value),
                    LoadOptionKey::Help => {
                        info!("Usage:\n{}", LoadOptionKey::help_text());
                        return Ok(None);
                    }
                    #[cfg(target_os = "uefi")]
                    LoadOptionKey::Version => {
                        info!("{}", version_info);
                        return Ok(None);
                    }
                }
            }
            Err(e) => {
                error!("could not parse the load options: {e:?}");
                return Err(());
            }
        }
    }
    if let Some(kernel) = kernel {
        let modules = modules
            .iter()
            .map(|m| {
                let (image, argv) = m.split_once(' ').unwrap_or((m, ""));
                Module {
                    image: image.to_string(),
                    argv: (!argv.is_empty()).then(|| argv.to_string()),
                }
            })
            .collect();
        Ok(Some(ConfigSource::Given(Config {
            kernel: kernel.to_string(),
            kernel_opts: kernel_opts.map(ToString::to_string),
            modules,
            timeout: 0,
            log_level: log_level.map(ToString::to_string),
            src: ".".to_string(),
            ..Config::default()
        })))
    } else if let Some(c) = config_file {
        Ok(Some(ConfigSource::File(c.to_string())))
    } else {
        Ok(Some(ConfigSource::File(CONFIG_FILE.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_options_means_the_default_config_file() {
        match parse_load_options("", "") {
            Ok(Some(ConfigSource::File(f))) => assert_eq!(f, CONFIG_FILE),
            _ => panic!("expected the default configuration file"),
        }
    }

    #[test]
    fn a_kernel_option_builds_a_config() {
        match parse_load_options("-kernel b.b00 -kernelopt quiet -module m1.gz -module m2.gz", "") {
            Ok(Some(ConfigSource::Given(config))) => {
                assert_eq!(config.kernel, "b.b00");
                assert_eq!(config.kernel_opts.as_deref(), Some("quiet"));
                assert_eq!(config.modules.len(), 2);
                assert_eq!(config.modules[1].image, "m2.gz");
                assert_eq!(config.timeout, 0);
            }
            _ => panic!("expected a command-line config"),
        }
    }

    #[test]
    fn config_option_selects_a_file() {
        match parse_load_options("-config \\esx\\boot.cfg", "") {
            Ok(Some(ConfigSource::File(f))) => assert_eq!(f, "\\esx\\boot.cfg"),
            _ => panic!("expected a file source"),
        }
    }
}
