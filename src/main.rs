use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use cbt_backup::backup::{BackupConfig, BackupRunner};
use cbt_backup::download::VdiDownloader;
use cbt_backup::restore::RestoreRunner;
use cbt_backup::xapi::Session;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Address of the pool master.
    #[clap(long)]
    master: String,

    /// User name for the management API.
    #[clap(long)]
    uname: String,

    /// Password for the management API.
    #[clap(long)]
    pwd: String,

    /// Disable TLS for the NBD and HTTP data channels.
    #[clap(long)]
    no_tls: bool,

    /// Backup root directory (defaults to ~/.cbt_backups).
    #[clap(long)]
    root: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a backup of a VM (incremental when a usable base exists).
    Backup {
        /// UUID of the VM to back up.
        #[clap(long)]
        vm: String,
    },
    /// Download the full contents of one VDI to a file.
    Download {
        /// UUID of the VDI to download.
        #[clap(long)]
        vdi: String,

        /// Output file for the raw disk image.
        #[clap(long)]
        out: PathBuf,
    },
    /// Restore a previously taken backup.
    Restore {
        /// UUID of the backed-up VM.
        #[clap(long)]
        vm: String,

        /// Timestamp of the backup to restore.
        #[clap(long)]
        ts: String,

        /// UUID of the storage repository to restore onto.
        #[clap(long)]
        sr: String,

        /// UUID of the host to import through.
        #[clap(long)]
        host: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let use_tls = !args.no_tls;
    let config = match args.root {
        Some(root) => BackupConfig::new(root, use_tls),
        None => BackupConfig::with_default_root(use_tls)?,
    };

    let session = Session::login(&args.master, &args.uname, &args.pwd)
        .wrap_err("logging in to the management API")?;

    let result = match &args.command {
        Command::Backup { vm } => BackupRunner::new(&session, config)
            .backup_vm(vm)
            .map(|dir| println!("backup written to {}", dir.display()))
            .wrap_err("backup failed"),
        Command::Download { vdi, out } => (|| {
            let vdi = session.vdi_by_uuid(vdi)?;
            VdiDownloader::new(use_tls).full_vdi_backup(&session, &vdi, out)
        })()
        .map(|()| println!("VDI written to {}", out.display()))
        .wrap_err("download failed"),
        Command::Restore { vm, ts, sr, host } => RestoreRunner::new(&session, config)
            .restore_vm(vm, ts, sr, host)
            .map(|()| println!("restore of {vm} at {ts} finished"))
            .wrap_err("restore failed"),
    };

    session.logout();
    result
}
