//! Reading files off the boot volume.
//!
//! Everything mboot consumes (the configuration, the kernel, every
//! module and ACPI table) is a regular file on the partition the loader
//! was started from. Opening a file also fetches its size from the
//! metadata, so the staging buffer can be allocated in one piece before
//! the content is pulled in.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, info};

use uefi::boot::open_protocol_exclusive;
use uefi::data_types::CString16;
use uefi::prelude::*;
use uefi::proto::media::file::{
    File as UefiFile, FileAttribute, FileInfo, FileMode, FileType, RegularFile,
};
use uefi::proto::media::fs::SimpleFileSystem;

/// A file on the boot volume, opened for reading.
pub(crate) struct File<'a> {
    name: &'a str,
    file: RegularFile,
    size: usize,
}

impl<'a> File<'a> {
    /// Open `name` on the volume the loader came from.
    ///
    /// Failures map onto firmware statuses: a path the firmware cannot
    /// represent is `PROTOCOL_ERROR`, a missing file is `NOT_FOUND`,
    /// and a directory where a file was expected is `UNSUPPORTED`.
    pub(crate) fn open(name: &'a str, image_fs_handle: Handle) -> Result<Self, Status> {
        info!("reading '{name}'...");
        let path = CString16::try_from(name).map_err(|e| {
            error!("cannot express '{name}' as a firmware path: {e:?}");
            Status::PROTOCOL_ERROR
        })?;
        let mut fs = open_protocol_exclusive::<SimpleFileSystem>(image_fs_handle)
            .map_err(|e| e.status())?;
        let handle = fs
            .open_volume()
            .map_err(|e| e.status())?
            .open(&path, FileMode::Read, FileAttribute::READ_ONLY)
            .map_err(|e| {
                error!("there is no '{name}' on the boot volume: {e:?}");
                Status::NOT_FOUND
            })?;
        let mut file = match handle.into_type().map_err(|e| e.status())? {
            FileType::Regular(file) => file,
            FileType::Dir(_) => {
                error!("'{name}' is a directory, expected a file");
                return Err(Status::UNSUPPORTED);
            }
        };
        let size = file_size(name, &mut file)?;
        debug!("'{name}' is {size} bytes");
        Ok(Self { name, file, size })
    }

    /// The size recorded in the file's metadata.
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// Ask the firmware how large a file is.
fn file_size(name: &str, file: &mut RegularFile) -> Result<usize, Status> {
    // probing with an empty buffer makes the firmware tell us how much
    // room the metadata itself needs
    let needed = match file.get_info::<FileInfo>(&mut []) {
        Err(e) if e.status() == Status::BUFFER_TOO_SMALL => match *e.data() {
            Some(needed) => needed,
            None => return Err(Status::PROTOCOL_ERROR),
        },
        _ => return Err(Status::PROTOCOL_ERROR),
    };
    let mut raw = vec![0u8; needed];
    match file.get_info::<FileInfo>(&mut raw) {
        Ok(info) => Ok(info.file_size().try_into().unwrap()),
        Err(e) => {
            error!("failed to read the metadata of '{name}': {:?}", e.status());
            Err(Status::PROTOCOL_ERROR)
        }
    }
}

impl TryFrom<File<'_>> for Vec<u8> {
    type Error = Status;

    /// Pull the whole content into a fresh buffer.
    ///
    /// A file that turns out shorter than its metadata promised is
    /// reported as truncated rather than silently padded.
    fn try_from(mut file: File) -> Result<Self, Self::Error> {
        let mut content = vec![0u8; file.size];
        let got = file.file.read(&mut content).map_err(|e| {
            error!("reading '{}' failed: {:?}", file.name, e.status());
            e.status()
        })?;
        if got < file.size {
            error!("'{}' ended after {got} of {} bytes", file.name, file.size);
            return Err(Status::END_OF_FILE);
        }
        Ok(content)
    }
}
