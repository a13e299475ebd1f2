//! Bulk-transfer channels shared with the child process.
//!
//! A channel is an anonymous RAM-backed file of [`MAX_DATA_SIZE`] bytes,
//! mapped into the parent and inherited by the child as a plain descriptor.
//! Parent and child share one file description, so the file offset doubles
//! as the "bytes written" cursor: the parent rewinds it before every
//! execution and reads it back to size the child's output.

use std::{
    fs::File,
    io::{self, Seek, SeekFrom},
};

use memmap2::MmapMut;

/// Maximum payload per channel, and thus the maximum script size.
pub const MAX_DATA_SIZE: usize = 16 << 20;

/// One unidirectional bulk channel, created at worker init and reused for
/// every execution.
#[derive(Debug)]
pub struct DataChannel {
    file: File,
    mapping: MmapMut,
}

impl DataChannel {
    pub fn new(worker_id: usize, label: &str) -> io::Result<Self> {
        let file = create_backing_file(worker_id, label)?;
        file.set_len(MAX_DATA_SIZE as u64)?;
        // SAFETY: the file was just sized to MAX_DATA_SIZE and stays alive
        // (and never shrinks) for as long as the mapping does.
        let mapping = unsafe { MmapMut::map_mut(&file) }?;
        Ok(Self { file, mapping })
    }

    /// Rewinds the shared offset; the mapping is left intact.
    pub fn reset(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Re-sizes the backing file and rewinds, bounding growth across child
    /// generations. Used at spawn time.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(MAX_DATA_SIZE as u64)?;
        self.reset()
    }

    /// Copies a payload to the start of the channel for the child to read.
    ///
    /// The caller must have checked `payload.len() <= MAX_DATA_SIZE`.
    pub fn stage(&mut self, payload: &[u8]) {
        self.mapping[..payload.len()].copy_from_slice(payload);
    }

    /// Returns what the child wrote since the last reset.
    ///
    /// The length is the shared file offset, clamped to `MAX_DATA_SIZE - 1`
    /// so a NUL terminator can be placed behind it for consumers that expect
    /// a C string. The returned view borrows the mapping and is invalidated
    /// by the next execution.
    pub fn fetch(&mut self) -> io::Result<&[u8]> {
        let written = self.file.stream_position()? as usize;
        let len = written.min(MAX_DATA_SIZE - 1);
        self.mapping[len] = 0;
        Ok(&self.mapping[..len])
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(target_os = "linux")]
fn create_backing_file(worker_id: usize, label: &str) -> io::Result<File> {
    use std::{ffi::CString, os::fd::FromRawFd};

    let name = CString::new(format!("reprl_data_{label}_{worker_id}"))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    // SAFETY: memfd_create takes a NUL-terminated name and returns either a
    // fresh descriptor we immediately take ownership of, or -1.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a newly created descriptor owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Fallback for platforms without memfd: a unique temporary file, unlinked at
/// creation so it is anonymous, with close-on-exec already set.
#[cfg(not(target_os = "linux"))]
fn create_backing_file(_worker_id: usize, _label: &str) -> io::Result<File> {
    tempfile::tempfile()
}
