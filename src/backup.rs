//! Per-VM backup orchestration: snapshotting, chain lookup, download,
//! checksum verification and cleanup.
//!
//! A backup lives in `<root>/<vm_uuid>/<timestamp>/` with the VM metadata
//! at the top and one `vdis/<snapshot_vdi_uuid>/{original_uuid, data}`
//! entry per disk. The whole timestamped directory is deleted if anything
//! goes wrong, and the server-side snapshot is destroyed on every exit
//! path so that only CBT metadata survives the run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{info, warn};

use crate::checksum::file_checksum;
use crate::download::VdiDownloader;
use crate::error::{Error, Result};
use crate::xapi::{Session, VdiRef, VmRef};

/// Name suffix given to the temporary VM snapshot taken for a backup.
pub const SNAPSHOT_SUFFIX: &str = "_tmp_cbt_backup_snapshot";

/// Directory-name timestamp format; lexicographic order is chronological.
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Where backups go and how servers are dialed.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Root directory holding one subdirectory per VM UUID.
    pub root: PathBuf,
    pub use_tls: bool,
}

impl BackupConfig {
    pub fn new(root: PathBuf, use_tls: bool) -> Self {
        Self { root, use_tls }
    }

    /// The conventional root, `<home>/.cbt_backups`.
    pub fn with_default_root(use_tls: bool) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot determine the home directory",
            ))
        })?;
        Ok(Self::new(home.join(".cbt_backups"), use_tls))
    }
}

/// One disk of the snapshotted VM, with everything cleanup and chain
/// lookup need to know about it.
#[derive(Debug, Clone)]
struct SnapshotDisk {
    /// The snapshot VDI the backup reads from.
    vdi: VdiRef,
    uuid: String,
    cbt_enabled: bool,
    /// The live VDI that was snapshotted.
    live: VdiRef,
    live_uuid: String,
}

/// Runs VM backups against one management session.
pub struct BackupRunner<'a> {
    session: &'a Session,
    config: BackupConfig,
    downloader: VdiDownloader,
}

impl<'a> BackupRunner<'a> {
    pub fn new(session: &'a Session, config: BackupConfig) -> Self {
        let downloader = VdiDownloader::new(config.use_tls);
        Self {
            session,
            config,
            downloader,
        }
    }

    /// Back up the VM with the given UUID. Returns the path of the new
    /// backup directory.
    pub fn backup_vm(&self, vm_uuid: &str) -> Result<PathBuf> {
        let vm = self.session.vm_by_uuid(vm_uuid)?;
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let backup_dir = self.config.root.join(vm_uuid).join(&timestamp);
        fs::create_dir_all(&backup_dir)?;
        info!("backing up VM {vm_uuid} into {}", backup_dir.display());

        match self.backup_vm_into(&vm, vm_uuid, &backup_dir) {
            Ok(()) => Ok(backup_dir),
            Err(err) => {
                warn!("backup failed, removing {}", backup_dir.display());
                if let Err(cleanup_err) = fs::remove_dir_all(&backup_dir) {
                    warn!(
                        "could not remove {}: {cleanup_err}",
                        backup_dir.display()
                    );
                }
                Err(err)
            }
        }
    }

    fn backup_vm_into(&self, vm: &VmRef, vm_uuid: &str, backup_dir: &Path) -> Result<()> {
        self.enable_cbt(vm)?;

        let snapshot_name = format!("{}{SNAPSHOT_SUFFIX}", self.session.vm_name_label(vm)?);
        let snapshot = self.session.vm_snapshot(vm, &snapshot_name)?;
        info!("created snapshot '{snapshot_name}'");

        let disks = match self.snapshot_disks(&snapshot) {
            Ok(disks) => disks,
            Err(err) => {
                self.destroy_snapshot_logged(&snapshot, &[]);
                return Err(err);
            }
        };

        let outcome = (|| {
            self.save_metadata(vm_uuid, backup_dir)?;
            for disk in &disks {
                self.backup_disk(vm_uuid, backup_dir, disk)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => self.destroy_snapshot(&snapshot, &disks),
            Err(err) => {
                self.destroy_snapshot_logged(&snapshot, &disks);
                Err(err)
            }
        }
    }

    /// Enable CBT on every pluggable disk of the VM. Disks that cannot
    /// track changes are logged and backed up fully.
    fn enable_cbt(&self, vm: &VmRef) -> Result<()> {
        for vbd in self.session.vm_vbds(vm)? {
            if self.session.vbd_empty(&vbd)? {
                continue;
            }
            let vdi = self.session.vbd_vdi(&vbd)?;
            if let Err(err) = self.session.vdi_enable_cbt(&vdi) {
                warn!("cannot enable CBT on VDI {}: {err}", vdi.0);
            }
        }
        Ok(())
    }

    fn snapshot_disks(&self, snapshot: &VmRef) -> Result<Vec<SnapshotDisk>> {
        let mut disks = vec![];
        for vbd in self.session.vm_vbds(snapshot)? {
            if self.session.vbd_empty(&vbd)? {
                continue;
            }
            let vdi = self.session.vbd_vdi(&vbd)?;
            let live = self.session.vdi_snapshot_of(&vdi)?;
            disks.push(SnapshotDisk {
                uuid: self.session.vdi_uuid(&vdi)?,
                cbt_enabled: self.session.vdi_cbt_enabled(&vdi)?,
                live_uuid: self.session.vdi_uuid(&live)?,
                vdi,
                live,
            });
        }
        Ok(disks)
    }

    /// Fetch the VM metadata export and store it beside the disk data.
    fn save_metadata(&self, vm_uuid: &str, backup_dir: &Path) -> Result<()> {
        let host = self.session.this_host()?;
        let (http, base) = self.session.host_http(&host, self.config.use_tls)?;
        let url = format!(
            "{base}/export_metadata?session_id={}&uuid={vm_uuid}&export_snapshots=false",
            self.session.session_id()
        );
        let bytes = http
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|err| Error::Api(format!("metadata export failed: {err}")))?;
        fs::write(backup_dir.join("VM_metadata"), &bytes)?;
        Ok(())
    }

    fn backup_disk(&self, vm_uuid: &str, backup_dir: &Path, disk: &SnapshotDisk) -> Result<()> {
        let vdi_dir = backup_dir.join("vdis").join(&disk.uuid);
        fs::create_dir_all(&vdi_dir)?;
        fs::write(
            vdi_dir.join("original_uuid"),
            format!("{}\n", disk.live_uuid),
        )?;
        let data = vdi_dir.join("data");

        let base = if disk.cbt_enabled {
            self.latest_local_backup(vm_uuid, disk)?
        } else {
            None
        };

        match base {
            Some((base_vdi, base_file)) => {
                info!(
                    "incremental backup of VDI {} against snapshot {}",
                    disk.uuid, base_vdi.0
                );
                let incremental = self.downloader.incremental_vdi_backup(
                    self.session,
                    &disk.vdi,
                    (&base_vdi, base_file.as_path()),
                    &data,
                );
                match incremental {
                    Ok(()) => {}
                    Err(Error::Api(msg)) => {
                        // the base matched by UUID but the server cannot
                        // produce a bitmap against it
                        warn!("{}", Error::ChainBroken(msg));
                        info!("falling back to a full backup of VDI {}", disk.uuid);
                        self.downloader
                            .full_vdi_backup(self.session, &disk.vdi, &data)?;
                    }
                    Err(err) => return Err(err),
                }
            }
            None => {
                info!("full backup of VDI {}", disk.uuid);
                self.downloader
                    .full_vdi_backup(self.session, &disk.vdi, &data)?;
            }
        }

        self.verify_checksum(disk, &data)
    }

    /// The newest server-side snapshot of this disk's live VDI that also
    /// exists as a local backup, if any.
    fn latest_local_backup(
        &self,
        vm_uuid: &str,
        disk: &SnapshotDisk,
    ) -> Result<Option<(VdiRef, PathBuf)>> {
        let mut candidates = vec![];
        for snap in self.session.vdi_snapshots(&disk.live)? {
            if snap == disk.vdi {
                continue;
            }
            // a snapshot can disappear between enumeration and inspection
            match self.session.vdi_snapshot_time(&snap) {
                Ok(time) => candidates.push((time, snap)),
                Err(err) => warn!("skipping vanished snapshot {}: {err}", snap.0),
            }
        }
        Ok(newest_with_local(candidates, |snap| {
            let uuid = match self.session.vdi_uuid(snap) {
                Ok(uuid) => uuid,
                Err(err) => {
                    warn!("skipping vanished snapshot {}: {err}", snap.0);
                    return None;
                }
            };
            self.local_backup_data(vm_uuid, &uuid)
        }))
    }

    /// The `data` file of a local backup of the given snapshot VDI UUID.
    fn local_backup_data(&self, vm_uuid: &str, vdi_uuid: &str) -> Option<PathBuf> {
        find_local_backup(&self.config.root, vm_uuid, vdi_uuid)
    }

    /// Compare the local file MD5 with the server-computed checksum. The
    /// server works while the local digest is computed.
    fn verify_checksum(&self, disk: &SnapshotDisk, data: &Path) -> Result<()> {
        let task = self.session.async_vdi_checksum(&disk.vdi)?;
        let local = file_checksum(data)?;
        let remote = self.session.wait_task_result(&task)?;
        if local != remote {
            return Err(Error::ChecksumMismatch { local, remote });
        }
        info!("checksum of VDI {} verified ({local})", disk.uuid);
        Ok(())
    }

    /// Destroy the snapshot VM, then each snapshot VDI: `data_destroy`
    /// keeps the CBT metadata of tracking disks, `destroy` removes the
    /// rest. The VM must go first; `data_destroy` is rejected while a VBD
    /// still references the VDI.
    fn destroy_snapshot(&self, snapshot: &VmRef, disks: &[SnapshotDisk]) -> Result<()> {
        self.session.vm_destroy(snapshot)?;
        for disk in disks {
            if disk.cbt_enabled {
                self.session.vdi_data_destroy(&disk.vdi)?;
            } else {
                self.session.vdi_destroy(&disk.vdi)?;
            }
        }
        Ok(())
    }

    /// Cleanup variant for failure paths: never masks the original error.
    fn destroy_snapshot_logged(&self, snapshot: &VmRef, disks: &[SnapshotDisk]) {
        if let Err(err) = self.destroy_snapshot(snapshot, disks) {
            warn!("could not destroy backup snapshot {}: {err}", snapshot.0);
        }
    }
}

/// Scan the timestamped backups of one VM for a disk directory matching
/// the given snapshot VDI UUID, returning its `data` file. Snapshot UUIDs
/// are unique, so at most one backup can hold the match.
pub fn find_local_backup(root: &Path, vm_uuid: &str, vdi_uuid: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root.join(vm_uuid)).ok()?;
    for entry in entries.flatten() {
        let data = entry.path().join("vdis").join(vdi_uuid).join("data");
        if data.is_file() {
            return Some(data);
        }
    }
    None
}

/// Pick the newest candidate (by sortable timestamp, newest first) for
/// which `local_data` yields a path.
fn newest_with_local<T>(
    mut candidates: Vec<(String, T)>,
    mut local_data: impl FnMut(&T) -> Option<PathBuf>,
) -> Option<(T, PathBuf)> {
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, candidate) in candidates {
        if let Some(path) = local_data(&candidate) {
            return Some((candidate, path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn chain_lookup_prefers_newest_with_local_backup() {
        let candidates = vec![
            ("20260301T000000Z".to_string(), "old"),
            ("20260401T000000Z".to_string(), "mid"),
            ("20260501T000000Z".to_string(), "new-no-local"),
        ];
        let mut local = HashMap::new();
        local.insert("old", PathBuf::from("/b/old/data"));
        local.insert("mid", PathBuf::from("/b/mid/data"));

        let (base, path) = newest_with_local(candidates, |c| local.get(c).cloned()).unwrap();
        assert_eq!(base, "mid");
        assert_eq!(path, PathBuf::from("/b/mid/data"));
    }

    #[test]
    fn chain_lookup_with_no_local_backups_is_none() {
        let candidates = vec![("20260301T000000Z".to_string(), "a")];
        assert!(newest_with_local(candidates, |_| None).is_none());
    }

    #[test]
    fn chain_lookup_ignores_enumeration_order() {
        let candidates = vec![
            ("20260501T000000Z".to_string(), "new"),
            ("20260301T000000Z".to_string(), "old"),
        ];
        let (base, _) =
            newest_with_local(candidates, |_| Some(PathBuf::from("/data"))).unwrap();
        assert_eq!(base, "new");
    }

    #[test]
    fn finds_backup_data_across_timestamp_dirs() {
        let root = tempfile::tempdir().unwrap();
        let vm = "6e3c2a60-1111-2222-3333-444455556666";
        let vdi = "0d9f21aa-aaaa-bbbb-cccc-ddddeeeeffff";
        let data_dir = root
            .path()
            .join(vm)
            .join("20260401T120000Z")
            .join("vdis")
            .join(vdi);
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("data"), b"x").unwrap();
        // a second backup of the same VM with a different disk
        let other = root
            .path()
            .join(vm)
            .join("20260501T120000Z")
            .join("vdis")
            .join("some-other-uuid");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("data"), b"y").unwrap();

        let found = find_local_backup(root.path(), vm, vdi).unwrap();
        assert_eq!(found, data_dir.join("data"));
        assert!(find_local_backup(root.path(), vm, "unknown-uuid").is_none());
        assert!(find_local_backup(root.path(), "unknown-vm", vdi).is_none());
    }

    #[test]
    fn missing_data_file_is_not_a_backup() {
        let root = tempfile::tempdir().unwrap();
        let vm = "vm";
        let vdi = "vdi";
        // directory exists but holds no data file
        fs::create_dir_all(root.path().join(vm).join("20260401T120000Z").join("vdis").join(vdi))
            .unwrap();
        assert!(find_local_backup(root.path(), vm, vdi).is_none());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        assert_eq!(earlier.len(), "20260801T093000Z".len());
        assert!(earlier < "99991231T235959Z".to_string());
    }
}
