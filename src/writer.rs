//! Streams byte extents from an NBD export into a local file.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::bitmap::Extent;
use crate::client::NbdClient;
use crate::error::Result;

/// Default sub-block I/O size: each extent is fetched in pieces of at most
/// this many bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// How extent data is placed in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Seek to each extent's offset in an existing file and overwrite.
    Overwrite,
    /// Append every extent back to back; the caller is responsible for the
    /// extents being contiguous.
    Append,
}

/// Reads extents through an NBD client and writes them to an output file.
#[derive(Debug, Clone, Copy)]
pub struct ExtentWriter {
    block_size: u32,
}

impl Default for ExtentWriter {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ExtentWriter {
    /// A writer with a custom sub-block I/O size.
    pub fn with_block_size(block_size: u32) -> Self {
        assert!(block_size > 0, "sub-block size must be non-zero");
        Self { block_size }
    }

    /// Download every extent and write it to `out_file` in the given mode.
    ///
    /// In `Overwrite` mode the file must already exist and is opened
    /// read+write; in `Append` mode it is created if missing. No rollback
    /// is attempted on failure; the caller owns cleanup of the output.
    pub fn write_extents<I>(
        &self,
        client: &mut NbdClient,
        extents: I,
        out_file: &Path,
        mode: OutputMode,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Extent>,
    {
        let mut out = match mode {
            OutputMode::Overwrite => OpenOptions::new().read(true).write(true).open(out_file)?,
            OutputMode::Append => OpenOptions::new().create(true).append(true).open(out_file)?,
        };
        for extent in extents {
            debug!(
                "fetching extent at offset {} of length {}",
                extent.offset, extent.length
            );
            let mut cur = extent.offset;
            while cur < extent.end() {
                let len = (self.block_size as u64).min(extent.end() - cur) as u32;
                let data = client.read(cur, len)?;
                if mode == OutputMode::Overwrite {
                    out.seek(SeekFrom::Start(cur))?;
                }
                out.write_all(&data)?;
                cur += len as u64;
            }
        }
        out.flush()?;
        Ok(())
    }
}
