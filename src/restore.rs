//! Restore path: recreate the disks of a backed-up VM and re-import its
//! metadata.
//!
//! Interface-level only: one VDI is created per backed-up disk (sized by
//! the `data` file), the raw contents are uploaded, and the metadata
//! import maps each original VDI UUID to its replacement.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use log::info;

use crate::backup::BackupConfig;
use crate::error::{Error, Result};
use crate::xapi::Session;

/// Restores VM backups through one management session.
pub struct RestoreRunner<'a> {
    session: &'a Session,
    config: BackupConfig,
}

impl<'a> RestoreRunner<'a> {
    pub fn new(session: &'a Session, config: BackupConfig) -> Self {
        Self { session, config }
    }

    /// Restore the backup taken of `vm_uuid` at `timestamp` onto the given
    /// storage repository, importing through the given host.
    pub fn restore_vm(
        &self,
        vm_uuid: &str,
        timestamp: &str,
        sr_uuid: &str,
        host_uuid: &str,
    ) -> Result<()> {
        let backup_dir = self.config.root.join(vm_uuid).join(timestamp);
        if !backup_dir.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no backup at {}", backup_dir.display()),
            )));
        }
        let sr = self.session.sr_by_uuid(sr_uuid)?;
        let host = self.session.host_by_uuid(host_uuid)?;
        let (http, base) = self.session.host_http(&host, self.config.use_tls)?;

        let mut uuid_map = vec![];
        for vdi_dir in self.backed_up_disks(&backup_dir)? {
            let original_uuid = fs::read_to_string(vdi_dir.join("original_uuid"))?
                .trim()
                .to_string();
            let data = vdi_dir.join("data");
            let virtual_size = fs::metadata(&data)?.len();

            let vdi = self
                .session
                .vdi_create(&sr, virtual_size, &format!("restore of {original_uuid}"))?;
            let new_uuid = self.session.vdi_uuid(&vdi)?;
            info!(
                "uploading {} bytes into VDI {new_uuid} (was {original_uuid})",
                virtual_size
            );

            let url = format!(
                "{base}/import_raw_vdi?session_id={}&vdi={new_uuid}&format=raw",
                self.session.session_id()
            );
            http.put(url)
                .body(File::open(&data)?)
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(|err| Error::Api(format!("raw VDI upload failed: {err}")))?;

            uuid_map.push((original_uuid, new_uuid));
        }

        self.import_metadata(&http, &base, &backup_dir, &uuid_map)?;
        info!("restored {} disks of VM {vm_uuid}", uuid_map.len());
        Ok(())
    }

    fn backed_up_disks(&self, backup_dir: &std::path::Path) -> Result<Vec<PathBuf>> {
        let mut dirs = vec![];
        for entry in fs::read_dir(backup_dir.join("vdis"))? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn import_metadata(
        &self,
        http: &reqwest::blocking::Client,
        base: &str,
        backup_dir: &std::path::Path,
        uuid_map: &[(String, String)],
    ) -> Result<()> {
        let task = self
            .session
            .task_create("import_metadata", "cbt-backup metadata import")?;
        let mut url = format!(
            "{base}/import_metadata?session_id={}&task_id={}",
            self.session.session_id(),
            task.0
        );
        for (original, new) in uuid_map {
            url.push_str(&format!("&vdi:{original}={new}"));
        }
        http.put(url)
            .body(File::open(backup_dir.join("VM_metadata"))?)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|err| Error::Api(format!("metadata import failed: {err}")))?;
        self.session.wait_task(&task)
    }
}
