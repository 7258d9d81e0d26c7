use libc::{c_void, off_t, pread, pwrite};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Raw descriptor of a scratch file, closed (and optionally unlinked) on drop.
pub struct SharedFd {
    fd: RawFd,
    path: PathBuf,
    delete_on_drop: bool,
}

impl SharedFd {
    /// Create (or truncate) `path` for reading and writing.
    pub fn create(path: impl AsRef<Path>, delete_on_drop: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            fd: file.into_raw_fd(),
            path: path.as_ref().to_path_buf(),
            delete_on_drop,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedFd {
    fn drop(&mut self) {
        if self.delete_on_drop {
            // Truncate before close so the blocks are freed even if another
            // handle keeps the inode alive.
            unsafe {
                libc::ftruncate(self.fd, 0);
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Read at `offset` without moving the file position.
pub fn pread_fd(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let result = unsafe {
        pread(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Write at `offset` without moving the file position.
pub fn pwrite_fd(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    let result = unsafe {
        pwrite(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Write all of `buf` at `offset`, retrying short and interrupted writes.
pub fn write_all_at(fd: RawFd, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match pwrite_fd(fd, buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read up to `buf.len()` bytes at `offset`, stopping early only at end of file.
pub fn read_at_most(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match pread_fd(fd, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
