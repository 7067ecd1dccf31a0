#![allow(unused_imports)]
#![allow(dead_code)]
#[cfg(unix)]
pub(crate) use std::os::unix::fs::OpenOptionsExt;

// On Windows, unbuffered I/O (FILE_FLAG_NO_BUFFERING) is not reachable
// through std::fs::OpenOptions, so the flag is accepted and ignored until
// a CreateFileW-based path exists.
#[cfg(windows)]
pub(crate) trait OpenOptionsExt {
    fn custom_flags(&mut self, flags: u32) -> &mut Self;
}

#[cfg(windows)]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn custom_flags(&mut self, _flags: u32) -> &mut Self {
        self
    }
}
