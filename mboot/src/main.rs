#![no_std]
#![no_main]

//! mboot – a relocating ESXi-style bootloader for UEFI systems
//!
//! It reads a `boot.cfg`, loads the kernel and its modules, lets the
//! relocation engine put everything where the kernel wants it and hands
//! over with an ESXBootInfo or legacy Multiboot information block.

extern crate alloc;

use core::fmt::Write;
use core::str::FromStr;
use alloc::string::ToString;

use uefi::prelude::*;
use uefi::boot::{
    create_event, image_handle, open_protocol_exclusive, set_timer, wait_for_event, EventType,
    TimerTrigger, Tpl,
};
use uefi::data_types::CString16;
use uefi::fs::PathBuf;
use uefi::proto::console::text::{Key, ScanCode};
use uefi::proto::loaded_image::{LoadedImage, LoadOptionsError};
use uefi::system::{with_stdin, with_stdout};

use log::{debug, info, warn, error};

use mboot_core::ErrorKind;

mod boot;
mod config;
mod file;

#[entry]
/// Startup: wire up logging, find out how we were invoked, then boot.
fn main() -> Status {
    uefi::helpers::init().expect("failed to set up the UEFI environment");
    log::set_max_level(log::LevelFilter::Info);

    // our own loaded image tells us two things: which partition to read
    // files from, and what was typed behind the loader's name
    let loaded_image = open_protocol_exclusive::<LoadedImage>(image_handle())
        .expect("failed to open loaded image protocol");

    let load_options = match loaded_image.load_options_as_cstr16() {
        Ok(s) => {
            debug!("invoked with: {s}");
            Some(s.to_string())
        }
        Err(LoadOptionsError::NotSet) => None,
        Err(e) => {
            warn!("could not read the load options ({e:?}), continuing without");
            None
        }
    };

    let image_fs_handle = loaded_image.device().expect("the loader to have come from a volume");

    let mut config = match config::get(
        image_fs_handle, load_options.as_deref().unwrap_or_default(),
    ) {
        Ok(Some(c)) => c,
        Ok(None) => return Status::SUCCESS,
        Err(e) => {
            error!("failed to get config: {e:?}");
            return Status::INVALID_PARAMETER;
        }
    };
    if let Some(level) = &config.log_level {
        if let Ok(level) = log::LevelFilter::from_str(level) {
            log::set_max_level(level);
        } else {
            warn!("'{level}' is not a valid log level, using default");
        }
    }
    resolve_paths(&mut config);
    debug!("config: {config:?}");

    if let Some(title) = &config.title {
        info!("{title}");
    }
    if config.skip {
        // let the firmware move on to the next boot entry
        info!("skip=1, returning to the firmware");
        return Status::SUCCESS;
    }
    if config.timeout > 0 {
        with_stdout(|stdout| writeln!(
            stdout,
            "mboot: booting {} in {} seconds... (press ESC to abort)",
            config.kernel, config.timeout,
        )).unwrap();
        match wait_for_escape(config.timeout) {
            Ok(true) => {
                info!("boot aborted");
                return Status::ABORTED;
            }
            Ok(false) => (),
            Err(e) => warn!("failed to wait for a keypress, booting right away: {e:?}"),
        }
    }

    info!("loading {}...", config.kernel);
    match boot::PreparedEntry::new(&config, image_fs_handle) {
        Ok(entry) => {
            info!("booting {}...", config.kernel);
            entry.boot();
        }
        Err(e) => {
            error!("failed to prepare the boot: {e:?}");
            error_hold(config.error_timeout);
            e // give up and let the firmware advance its boot order
        }
    }
}

/// Resolve the files the configuration references.
///
/// A `prefix` key wins; without one, paths are relative to the
/// configuration file itself. Absolute paths stay as they are.
fn resolve_paths(config: &mut mboot_config::Config) {
    if let Some(prefix) = config.prefix.clone() {
        for path in config.needed_files() {
            if !path.starts_with('\\') {
                *path = alloc::format!("{prefix}\\{path}");
            }
        }
    } else if let Some(config_parent) = PathBuf::from(
        CString16::try_from(config.src.as_str()).expect("configuration paths to be representable")
    ).parent() {
        for path in config.needed_files() {
            if path.starts_with('\\') {
                continue;
            }
            let mut buf = config_parent.clone();
            buf.push(PathBuf::from(CString16::try_from(path.as_str())
                .expect("configuration paths to be representable")
            ));
            *path = buf.to_string();
        }
    }
}

/// Wait for up to `seconds`; true means the user pressed ESC.
fn wait_for_escape(seconds: u32) -> uefi::Result<bool> {
    // safe: no notify function is registered
    let timer = unsafe { create_event(EventType::TIMER, Tpl::APPLICATION, None, None) }?;
    set_timer(&timer, TimerTrigger::Relative(u64::from(seconds) * 10_000_000))?;
    let key_event = with_stdin(|stdin| stdin.wait_for_key_event())
        .expect("the console to provide a key event");
    loop {
        match wait_for_event(
            // safe: both events outlive this loop and are never closed
            &mut [
                unsafe { key_event.unsafe_clone() },
                unsafe { timer.unsafe_clone() },
            ]
        ).discard_errdata()? {
            // a key arrived; only ESC is interesting
            0 => if let Some(Key::Special(ScanCode::ESCAPE)) =
                with_stdin(|stdin| stdin.read_key())?
            {
                set_timer(&timer, TimerTrigger::Cancel)?;
                return Ok(true);
            },
            // the countdown ran out
            1 => return Ok(false),
            e => warn!("firmware woke us for an unknown event {e}"),
        }
    }
}

/// Hold the error diagnostic on screen so it can actually be read.
///
/// Waits for any key for `seconds`; a negative value waits forever and
/// zero does not wait at all.
fn error_hold(seconds: i32) {
    if seconds == 0 {
        return;
    }
    with_stdout(|stdout| writeln!(
        stdout, "press any key to return to the firmware...",
    )).unwrap();
    let key_event = match with_stdin(|stdin| stdin.wait_for_key_event()) {
        Some(e) => e,
        None => return,
    };
    let mut events = alloc::vec![unsafe { key_event.unsafe_clone() }];
    if seconds > 0 {
        if let Ok(timer) = unsafe {
            create_event(EventType::TIMER, Tpl::APPLICATION, None, None)
        } {
            if set_timer(&timer, TimerTrigger::Relative(seconds as u64 * 10_000_000)).is_ok() {
                events.push(timer);
            }
        }
    }
    let _ = wait_for_event(events.as_mut_slice());
}

/// Map a loader error onto the closest firmware status.
pub(crate) fn error_status(e: mboot_core::Error) -> Status {
    match e.kind {
        ErrorKind::InvalidParameter | ErrorKind::Syntax => Status::INVALID_PARAMETER,
        ErrorKind::NotFound => Status::NOT_FOUND,
        ErrorKind::OutOfResources => Status::OUT_OF_RESOURCES,
        ErrorKind::Unsupported
        | ErrorKind::BadType
        | ErrorKind::BadArch
        | ErrorKind::BadHeader
        | ErrorKind::NotExecutable
        | ErrorKind::IncompatibleVersion => Status::UNSUPPORTED,
        ErrorKind::UnexpectedEof => Status::END_OF_FILE,
        ErrorKind::VolumeCorrupted => Status::VOLUME_CORRUPTED,
        ErrorKind::Timeout => Status::TIMEOUT,
        ErrorKind::Aborted => Status::ABORTED,
        ErrorKind::Insecure | ErrorKind::SecurityViolation => Status::SECURITY_VIOLATION,
        ErrorKind::BufferTooSmall => Status::BUFFER_TOO_SMALL,
        ErrorKind::InconsistentData => Status::LOAD_ERROR,
    }
}
