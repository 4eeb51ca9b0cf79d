//! Named shared-memory regions carrying bulk data between the broker and
//! application processes. Two regions exist per session (one per
//! direction); the broker creates both and advertises their names in the
//! CONNECT_REPLY frame.

use rand::Rng;
use std::ffi::CString;
use std::io;
use std::ptr;

/// Region names are exactly 32 bytes: a leading '/' and 31 characters
/// drawn from `[0-9A-Za-z]`.
pub const REGION_NAME_LEN: usize = 32;

const NAME_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generate a fresh region name from the session's own RNG. Collisions
/// are handled at `create` time through `O_EXCL`.
pub fn region_name<R: Rng>(rng: &mut R) -> String {
    let mut name = String::with_capacity(REGION_NAME_LEN);
    name.push('/');

    for _ in 1..REGION_NAME_LEN {
        let idx = rng.gen_range(0..NAME_CHARSET.len());
        name.push(NAME_CHARSET[idx] as char);
    }

    name
}

/// Fixed-width name field for CONNECT_REPLY frames.
pub fn name_bytes(name: &str) -> [u8; REGION_NAME_LEN] {
    let mut bytes = [0u8; REGION_NAME_LEN];
    let raw = name.as_bytes();
    bytes[..raw.len().min(REGION_NAME_LEN)]
        .copy_from_slice(&raw[..raw.len().min(REGION_NAME_LEN)]);
    bytes
}

#[derive(Debug)]
pub enum ShmError {
    BadName,
    Os(io::Error),
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ShmError::BadName => write!(f, "malformed region name"),
            ShmError::Os(err) => write!(f, "shared memory failure: {}", err),
        }
    }
}

impl std::error::Error for ShmError {}

/// A mapped POSIX shared-memory region. The creating side owns the name
/// and unlinks it on drop; `open` attaches to an existing region without
/// taking ownership of the name.
pub struct ShmRegion {
    name: String,
    addr: *mut u8,
    size: usize,
    owner: bool,
}

// The mapping is valid for the life of the struct and the raw pointer is
// only dereferenced through the checked accessors below.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    pub fn create(name: &str, size: usize) -> Result<ShmRegion, ShmError> {
        let c_name = CString::new(name).map_err(|_| ShmError::BadName)?;

        unsafe {
            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            );
            if fd < 0 {
                return Err(ShmError::Os(io::Error::last_os_error()));
            }

            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(ShmError::Os(err));
            }

            let addr = Self::map(fd, size);
            libc::close(fd);

            match addr {
                Ok(addr) => Ok(ShmRegion {
                    name: name.to_string(),
                    addr,
                    size,
                    owner: true,
                }),
                Err(err) => {
                    libc::shm_unlink(c_name.as_ptr());
                    Err(ShmError::Os(err))
                }
            }
        }
    }

    /// Attach to a region created by a peer.
    pub fn open(name: &str) -> Result<ShmRegion, ShmError> {
        let c_name = CString::new(name).map_err(|_| ShmError::BadName)?;

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0);
            if fd < 0 {
                return Err(ShmError::Os(io::Error::last_os_error()));
            }

            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::Os(err));
            }

            let size = stat.st_size as usize;
            let addr = Self::map(fd, size);
            libc::close(fd);

            Ok(ShmRegion {
                name: name.to_string(),
                addr: addr.map_err(ShmError::Os)?,
                size,
                owner: false,
            })
        }
    }

    unsafe fn map(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
        let addr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );

        if addr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(addr as *mut u8)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address as carried in IPC frames.
    pub fn addr(&self) -> u64 {
        self.addr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let base = self.addr as u64;
        addr >= base && addr + len <= base + self.size as u64
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        if offset + bytes.len() > self.size {
            return Err(ShmError::Os(io::Error::from(io::ErrorKind::InvalidInput)));
        }

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, ShmError> {
        if offset + len > self.size {
            return Err(ShmError::Os(io::Error::from(io::ErrorKind::InvalidInput)));
        }

        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(self.addr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);

            if self.owner {
                if let Ok(c_name) = CString::new(self.name.as_str()) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

/// Copy bytes into a raw in-process address carried by a `Task`.
///
/// # Safety
///
/// `addr..addr + bytes.len()` must lie inside a live shared-memory slice
/// handed out for this task, and no other broker thread may touch that
/// slice until the owning session releases it.
pub unsafe fn copy_to_raw(addr: u64, bytes: &[u8]) {
    ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
}

/// Copy bytes out of a raw in-process address carried by a `Task`.
///
/// # Safety
///
/// `addr..addr + len` must lie inside the session's write region, filled
/// by the application before it sent the frame that carried the address.
pub unsafe fn copy_from_raw(addr: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
    out
}
