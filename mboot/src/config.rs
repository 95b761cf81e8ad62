//! Configuration lookup.
//!
//! Two sources feed the [`Config`]: the UEFI load options for one-shot
//! overrides (`-kernel`, `-config`, ...) and a `boot.cfg` on the boot
//! volume for everything else. Whatever the command line says wins;
//! with an empty command line the default file next to the loader is
//! parsed. The dialect itself lives in [`mboot_config`].

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::error;
use uefi::prelude::*;

use mboot_config::{parse_config, parse_load_options, Config, ConfigSource};

use super::file::File;

/// The `-version` banner, assembled from the build-time environment.
pub fn version_info() -> String {
    #[allow(dead_code)]
    mod built_info {
        include!(concat!(env!("OUT_DIR"), "/built.rs"));
    }
    format!(
        "{} {} ({} build for {}, compiled on {}), licensed under the {}",
        built_info::PKG_NAME,
        built_info::GIT_VERSION.unwrap_or(built_info::PKG_VERSION),
        built_info::PROFILE,
        built_info::TARGET,
        built_info::HOST,
        built_info::PKG_LICENSE,
    )
}

/// Figure out what to boot.
///
/// `None` means the command line only asked for `-help` or `-version`
/// and the answer has already been printed; the caller should exit
/// quietly in that case.
pub fn get(image_fs_handle: Handle, load_options: &str) -> Result<Option<Config>, Status> {
    let source = parse_load_options(load_options, &version_info())
        .map_err(|()| Status::INVALID_PARAMETER)?;
    match source {
        Some(ConfigSource::File(name)) => from_file(image_fs_handle, &name).map(Some),
        Some(ConfigSource::Given(config)) => Ok(Some(config)),
        None => Ok(None),
    }
}

/// Load and parse a `boot.cfg`, remembering where it came from so that
/// relative paths can later be resolved against its directory.
fn from_file(image_fs_handle: Handle, name: &str) -> Result<Config, Status> {
    let bytes: Vec<u8> = File::open(name, image_fs_handle)?.try_into()?;
    let text = core::str::from_utf8(&bytes).map_err(|e| {
        error!("'{name}' is not valid UTF-8: {e}");
        Status::UNSUPPORTED
    })?;
    match parse_config(text) {
        Ok(mut config) => {
            config.src = name.to_string();
            Ok(config)
        }
        Err(e) => {
            error!("cannot use '{name}': {e}");
            Err(crate::error_status(e))
        }
    }
}
