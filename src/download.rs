//! Full and incremental VDI download primitives.
//!
//! [`BlockDownloader`] works purely from NBD endpoint records and a bitmap;
//! [`VdiDownloader`] layers the management-API calls and the base-file copy
//! on top. Neither decides between full and incremental backups; that
//! decision belongs to the orchestrator.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};

use crate::bitmap::{CbtBitmap, Extent};
use crate::checksum::reflink_or_copy;
use crate::client::{ConnectInfo, HandshakeStyle, NbdClient};
use crate::error::{Error, Result};
use crate::writer::{ExtentWriter, OutputMode, DEFAULT_BLOCK_SIZE};
use crate::xapi::{NbdInfo, Session, VdiRef};

/// Downloads extents of a network block device into local files.
#[derive(Debug, Clone)]
pub struct BlockDownloader {
    /// Sub-block I/O size for each NBD read.
    pub block_size: u32,
    /// Coalesce adjacent extents before downloading.
    pub merge_adjacent: bool,
    pub use_tls: bool,
    /// Socket timeout for the NBD connection.
    pub timeout: Duration,
}

impl BlockDownloader {
    pub fn new(use_tls: bool) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            merge_adjacent: true,
            use_tls,
            timeout: Duration::from_secs(60),
        }
    }

    fn connect_info(&self, info: &NbdInfo) -> ConnectInfo {
        ConnectInfo {
            address: info.address.clone(),
            port: info.port,
            exportname: info.exportname.clone(),
            timeout: self.timeout,
            use_tls: self.use_tls,
            cert: (!info.cert.is_empty()).then(|| info.cert.clone()),
            subject: (!info.subject.is_empty()).then(|| info.subject.clone()),
            style: HandshakeStyle::Newstyle,
            structured_reply: false,
            meta_context_queries: vec![],
        }
    }

    /// Connect through the first usable endpoint record, skipping the ones
    /// that fail.
    pub fn connect(&self, infos: &[NbdInfo]) -> Result<NbdClient> {
        let mut last_err = None;
        for info in infos {
            match NbdClient::connect(&self.connect_info(info)) {
                Ok(client) => return Ok(client),
                Err(err) => {
                    warn!(
                        "NBD endpoint {}:{} not usable: {err}",
                        info.address, info.port
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Api("no NBD endpoints offered for VDI".to_string())))
    }

    /// Download the given extents into `out_file`.
    pub fn download_extents<I>(
        &self,
        infos: &[NbdInfo],
        extents: I,
        out_file: &Path,
        mode: OutputMode,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Extent>,
    {
        let mut client = self.connect(infos)?;
        let writer = ExtentWriter::with_block_size(self.block_size);
        writer.write_extents(&mut client, extents, out_file, mode)?;
        client.close()
    }

    /// Download the blocks a base64 CBT bitmap marks as changed.
    pub fn download_changed_blocks(
        &self,
        bitmap_b64: &str,
        infos: &[NbdInfo],
        out_file: &Path,
        mode: OutputMode,
    ) -> Result<()> {
        let bitmap = CbtBitmap::from_base64(bitmap_b64)?;
        let stats = bitmap.statistics();
        info!(
            "downloading {} changed bytes of a {} byte disk",
            stats.changed_bytes, stats.disk_size
        );
        self.download_extents(
            infos,
            bitmap.extents(self.merge_adjacent),
            out_file,
            mode,
        )
    }

    /// Download the whole device into a fresh file.
    pub fn download_vdi(&self, infos: &[NbdInfo], out_file: &Path) -> Result<()> {
        match fs::remove_file(out_file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut client = self.connect(infos)?;
        let size = client.size();
        info!("downloading whole device of {size} bytes");
        let writer = ExtentWriter::with_block_size(self.block_size);
        writer.write_extents(
            &mut client,
            [Extent {
                offset: 0,
                length: size,
            }],
            out_file,
            OutputMode::Append,
        )?;
        client.close()
    }
}

/// Backs up the data of a VDI to a file, completely or incrementally.
#[derive(Debug, Clone)]
pub struct VdiDownloader {
    downloader: BlockDownloader,
}

impl VdiDownloader {
    pub fn new(use_tls: bool) -> Self {
        Self {
            downloader: BlockDownloader::new(use_tls),
        }
    }

    /// Download the full data of `vdi` into `out_file`.
    pub fn full_vdi_backup(&self, session: &Session, vdi: &VdiRef, out_file: &Path) -> Result<()> {
        let infos = session.vdi_nbd_info(vdi)?;
        self.downloader.download_vdi(&infos, out_file)
    }

    /// Reconstruct the data of `vdi` from the backup of an earlier snapshot
    /// plus the blocks that changed since.
    ///
    /// `latest_backup` is the base snapshot and the file holding its data.
    /// The base file is cloned (reflink when possible, byte copy otherwise)
    /// to `out_file`, and the changed blocks are overwritten in place at
    /// their original offsets.
    pub fn incremental_vdi_backup(
        &self,
        session: &Session,
        vdi: &VdiRef,
        latest_backup: (&VdiRef, &Path),
        out_file: &Path,
    ) -> Result<()> {
        let (base_vdi, base_file) = latest_backup;
        let bitmap = session.vdi_list_changed_blocks(base_vdi, vdi)?;
        let infos = session.vdi_nbd_info(vdi)?;
        reflink_or_copy(base_file, out_file)?;
        self.downloader
            .download_changed_blocks(&bitmap, &infos, out_file, OutputMode::Overwrite)
    }
}
