//! File checksums and copy helpers for validating backup and restore.
//!
//! The file checksums computed here can be compared against server-side
//! VDI checksums; they match when the contents are identical.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use log::debug;
use md5::{Digest, Md5};

use crate::error::Result;

// matches the 64 KiB read granularity of the server-side checksum
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the MD5 checksum of a file, reading it in 64 KiB chunks.
/// Returns the lowercase hex digest.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Copy `src` to `dst`, attempting a filesystem-level copy-on-write clone
/// first and falling back to an ordinary byte copy. Either way the result
/// is byte-identical to the source; callers may not assume which was used.
pub fn reflink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match reflink(src, dst) {
        Ok(()) => {
            debug!("reflinked {} to {}", src.display(), dst.display());
            Ok(())
        }
        Err(err) => {
            debug!(
                "reflink of {} failed ({err}), copying instead",
                src.display()
            );
            // a failed clone may leave an empty destination behind
            let _ = fs::remove_file(dst);
            fs::copy(src, dst)?;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
fn reflink(src: &Path, dst: &Path) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    mod ioctl {
        use nix::{ioctl_write_int_bad, request_code_write};
        // FICLONE = _IOW(0x94, 9, int), see ioctl_ficlone(2)
        ioctl_write_int_bad!(
            ficlone,
            request_code_write!(0x94, 9, std::mem::size_of::<std::os::raw::c_int>())
        );
    }

    let src_file = File::open(src)?;
    let dst_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;
    unsafe { ioctl::ficlone(dst_file.as_raw_fd(), src_file.as_raw_fd()) }
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reflink(_src: &Path, _dst: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "reflink is only attempted on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn md5_of_known_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();
        assert_eq!(
            file_checksum(file.path()).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn md5_of_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            file_checksum(file.path()).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn md5_spans_chunk_boundaries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xabu8; CHUNK_SIZE * 2 + 17]).unwrap();
        file.flush().unwrap();
        let once = file_checksum(file.path()).unwrap();
        let again = file_checksum(file.path()).unwrap();
        assert_eq!(once, again);
        assert_eq!(once.len(), 32);
    }

    #[test]
    fn copy_matches_source_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, vec![0x5au8; 200_000]).unwrap();

        reflink_or_copy(&src, &dst).unwrap();
        assert_eq!(
            file_checksum(&src).unwrap(),
            file_checksum(&dst).unwrap()
        );
        assert_eq!(fs::metadata(&dst).unwrap().len(), 200_000);
    }

    #[test]
    fn copy_overwrites_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"fresh contents").unwrap();
        fs::write(&dst, b"stale and longer contents").unwrap();

        reflink_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"fresh contents");
    }
}
