//! The cross-process backing for the shared-memory ring: a POSIX
//! shared-memory object (`shm_open`/`mmap`) mapped as one contiguous region
//! holding a [`ControlBlock`] followed by the chunk array, mirroring the
//! layout `LocalAudioRing` keeps in-process.
//!
//! Raw `libc` calls are used rather than a mmap-wrapper crate because the
//! ring's [`ControlBlock`] must sit at a fixed, predictable offset inside
//! the mapping for the host driver (a separate process, outside this
//! crate) to interoperate with; a wrapper that owns its own header would
//! fight that layout instead of describing it.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;
use std::ptr;

use fwa_core::{Result, TransmitError};

use super::{AudioChunk, ControlBlock, RingHandle, CHUNK_PAYLOAD_BYTES, RING_CAPACITY_POW2};

fn region_len() -> usize {
    size_of::<ControlBlock>() + (RING_CAPACITY_POW2 as usize) * size_of::<AudioChunk>()
}

fn last_os_error(context: &'static str) -> TransmitError {
    TransmitError::IoError(io::Error::new(
        io::Error::last_os_error().kind(),
        format!("{context}: {}", io::Error::last_os_error()),
    ))
}

/// A `mmap`-backed ring over a POSIX shared-memory object. The side that
/// creates the segment (`create`) owns its lifetime and unlinks it on drop;
/// the side that attaches (`open`) only unmaps.
pub struct PosixAudioRing {
    fd: RawFd,
    map_ptr: *mut u8,
    map_len: usize,
    name: CString,
    owns_segment: bool,
}

// SAFETY: all mutable access to the mapped region goes through the atomics
// in `ControlBlock` and the SPSC index protocol in `super::push`/`super::pop`.
unsafe impl Send for PosixAudioRing {}
unsafe impl Sync for PosixAudioRing {}

impl PosixAudioRing {
    /// Create and initialize a new shared-memory segment named `name`
    /// (default: [`super::DEFAULT_SHM_NAME`]). Fails with
    /// [`TransmitError::IoError`] if the segment already exists or the
    /// platform calls fail; fails with [`TransmitError::NoMemory`] if the
    /// mapping cannot be established.
    pub fn create(
        name: &str,
        sample_rate_hz: u32,
        channel_count: u32,
        bytes_per_frame: u32,
    ) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| TransmitError::BadArgument("shm name must not contain NUL".into()))?;
        let len = region_len();

        // SAFETY: FFI calls with valid, NUL-terminated name and well-formed
        // flag/mode arguments; each return value is checked below.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(last_os_error("shm_open (create)"));
        }

        // SAFETY: fd is valid and owned by this call; len fits isize.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = last_os_error("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }

        let map_ptr = map_fd(fd, len)?;
        // SAFETY: freshly mapped, page-zeroed memory sized for exactly one
        // `ControlBlock` at offset 0; the atomics' bit patterns for zero are
        // valid initial values, and `ControlBlock::zeroed` overwrites them.
        unsafe {
            ptr::write(map_ptr as *mut ControlBlock, ControlBlock::zeroed(
                RING_CAPACITY_POW2,
                sample_rate_hz,
                channel_count,
                bytes_per_frame,
            ));
        }

        Ok(PosixAudioRing {
            fd,
            map_ptr,
            map_len: len,
            name: cname,
            owns_segment: true,
        })
    }

    /// Attach to an existing shared-memory segment created by another
    /// process via `create`, validating its ABI and shape against
    /// `expected_sample_rate`/`expected_channels`, refusing to bind
    /// otherwise.
    pub fn open(name: &str, expected_sample_rate: u32, expected_channels: u32) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| TransmitError::BadArgument("shm name must not contain NUL".into()))?;
        let len = region_len();

        // SAFETY: see `create`; O_EXCL is intentionally omitted here.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(last_os_error("shm_open (open)"));
        }

        let map_ptr = map_fd(fd, len)?;
        let ring = PosixAudioRing {
            fd,
            map_ptr,
            map_len: len,
            name: cname,
            owns_segment: false,
        };

        if !ring.control().validate_format(expected_sample_rate, expected_channels) {
            return Err(TransmitError::Unsupported(
                "shared-memory segment ABI/shape mismatch".into(),
            ));
        }
        Ok(ring)
    }
}

fn map_fd(fd: RawFd, len: usize) -> Result<*mut u8> {
    // SAFETY: fd is a valid, just-sized shared-memory descriptor; the
    // returned pointer is checked against MAP_FAILED before use.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = last_os_error("mmap");
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(ptr as *mut u8)
}

impl RingHandle for PosixAudioRing {
    fn control(&self) -> &ControlBlock {
        // SAFETY: `map_ptr` points at `map_len` bytes of shared memory with
        // `ControlBlock` occupying the leading, correctly aligned prefix.
        unsafe { &*(self.map_ptr as *const ControlBlock) }
    }

    fn chunks_ptr(&self) -> *mut AudioChunk {
        // SAFETY: the chunk array immediately follows the control block,
        // per the layout this type and `region_len` both agree on.
        unsafe { self.map_ptr.add(size_of::<ControlBlock>()) as *mut AudioChunk }
    }

    fn capacity(&self) -> u32 {
        RING_CAPACITY_POW2
    }
}

impl Drop for PosixAudioRing {
    fn drop(&mut self) {
        // SAFETY: `map_ptr`/`map_len` describe the mapping this instance
        // created; no other reference to it outlives this call in-process.
        unsafe {
            libc::munmap(self.map_ptr as *mut libc::c_void, self.map_len);
            libc::close(self.fd);
            if self.owns_segment {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

const _: () = assert!(CHUNK_PAYLOAD_BYTES > 0);
