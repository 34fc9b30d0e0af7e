use chrono::{DateTime, Local, Utc};
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::paths::Layout;
use super::podman;
use super::quadlet::{self, UnitKind};
use super::staging::{copy_tree, STAGING_META};
use super::{ErrorKind, Result};

/// File name of the snapshot record inside a backup tree
pub const BACKUP_META: &str = ".backup-metadata.json";

/// Directory inside a backup holding exported volume archives
pub const VOLUME_DIR: &str = "volumes";

/// One exported volume archive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VolumeBackup {
    pub name: String,
    /// Path relative to the backup root, e.g. `volumes/web-data.tar`
    pub archive_path: String,
    pub size: u64,
}

/// Snapshot record stored at the backup root
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupMetadata {
    pub id: String,
    pub deployment_name: String,
    pub created_at: DateTime<Utc>,
    /// `manual` or `automatic`, derived from the reason
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: String,
    /// Total on-disk bytes of the snapshot
    pub size: u64,
    pub quadlet_files: Vec<String>,
    pub volumes: Vec<VolumeBackup>,
}

/// Reasons beginning with `before-` or `pre-apply-` mark safety
/// snapshots the controller creates on its own
fn kind_for(reason: &str) -> &'static str {
    if reason.starts_with("before-") || reason.starts_with("pre-apply-") {
        "automatic"
    } else {
        "manual"
    }
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Snapshot a deployment's unit files and live volumes
///
/// The whole active tree is copied so a restore reproduces it byte for
/// byte; every named volume referenced by a container or pod unit that
/// exists in the engine is exported under `volumes/`.
pub fn create(layout: &Layout, name: &str, reason: &str) -> Result<BackupMetadata> {
    let active = layout.active_root().join(name);
    if !active.is_dir() {
        bail!(ErrorKind::NotDeployed(name.into()));
    }

    let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
    let id = format!("{}-{}", name, stamp);
    let dir = layout.backups_root().join(name).join(&stamp);
    if dir.exists() {
        // two snapshots within one second; last writer wins
        fs::remove_dir_all(&dir)?;
    }
    copy_tree(&active, &dir, &[STAGING_META, BACKUP_META])?;

    let units = quadlet::discover(&dir)?;
    let quadlet_files: Vec<String> = units.iter().map(|u| u.name.clone()).collect();

    // named volumes referenced by container and pod units
    let mut vol_names: Vec<String> = units
        .iter()
        .filter(|u| u.kind == UnitKind::Container || u.kind == UnitKind::Pod)
        .flat_map(|u| u.volume_names())
        .collect();
    vol_names.sort();
    vol_names.dedup();

    let mut volumes = vec![];
    for vol in vol_names {
        match podman::volume_exists(&vol) {
            Ok(true) => {
                let rel = format!("{}/{}.tar", VOLUME_DIR, vol);
                let archive = dir.join(&rel);
                podman::volume_export(&vol, &archive)?;
                let size = fs::metadata(&archive)?.len();
                info!("exported volume {} ({} bytes)", vol, size);
                volumes.push(VolumeBackup { name: vol, archive_path: rel, size });
            }
            Ok(false) => debug!("volume {} does not exist yet, skipping", vol),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
    }

    let meta = BackupMetadata {
        id: id.clone(),
        deployment_name: name.into(),
        created_at: Utc::now(),
        kind: kind_for(reason).into(),
        reason: reason.into(),
        size: dir_size(&dir),
        quadlet_files,
        volumes,
    };
    let encoded = serde_json::to_string_pretty(&meta)?;
    let mut f = File::create(dir.join(BACKUP_META))?;
    write!(f, "{}\n", encoded)?;
    info!("created backup {} ({})", id, meta.kind);
    Ok(meta)
}

fn load_meta(dir: &Path) -> Option<BackupMetadata> {
    let pth = dir.join(BACKUP_META);
    let mut data = String::new();
    File::open(&pth).ok()?.read_to_string(&mut data).ok()?;
    serde_json::from_str(&data).ok()
}

/// Every valid backup, newest first, optionally for one deployment
///
/// Directories without parseable metadata are skipped, not errors.
pub fn list(layout: &Layout, name: Option<&str>) -> Result<Vec<BackupMetadata>> {
    let root = layout.backups_root();
    if !root.is_dir() {
        return Ok(vec![]);
    }
    let mut found = vec![];
    for deploy_entry in fs::read_dir(&root)? {
        let deploy_entry = deploy_entry?;
        if !deploy_entry.file_type()?.is_dir() {
            continue;
        }
        let dname = deploy_entry.file_name().to_string_lossy().to_string();
        if let Some(filter) = name {
            if filter != dname {
                continue;
            }
        }
        for entry in fs::read_dir(deploy_entry.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match load_meta(&entry.path()) {
                Some(meta) => found.push(meta),
                None => debug!("skipping {} (no valid metadata)", entry.path().display()),
            }
        }
    }
    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(found)
}

/// Locate a backup by id
pub fn find(layout: &Layout, id: &str) -> Result<(BackupMetadata, PathBuf)> {
    for meta in list(layout, None)? {
        if meta.id == id {
            let stamp = meta.id.trim_start_matches(&format!("{}-", meta.deployment_name)).to_string();
            let dir = layout.backups_root().join(&meta.deployment_name).join(&stamp);
            if dir.is_dir() {
                return Ok((meta, dir));
            }
        }
    }
    bail!(ErrorKind::BackupNotFound(id.into()))
}

/// Delete a backup by id
pub fn remove(layout: &Layout, id: &str) -> Result<()> {
    let (_, dir) = find(layout, id)?;
    fs::remove_dir_all(&dir)?;
    info!("removed backup {}", id);
    Ok(())
}

/// Keep the N newest backups of a deployment, delete the rest
pub fn prune(layout: &Layout, name: &str, keep: usize) -> Result<usize> {
    let all = list(layout, Some(name))?;
    let mut removed = 0;
    for meta in all.iter().skip(keep) {
        remove(layout, &meta.id)?;
        removed += 1;
    }
    Ok(removed)
}

/// Restore the unit file tree of a backup over `active/<name>/`
///
/// Volume archives and the metadata record stay behind; volume import
/// is the controller's job because it needs engine calls interleaved
/// with service lifecycle.
pub fn restore_tree(backup_dir: &Path, active: &Path) -> Result<()> {
    if active.is_dir() {
        fs::remove_dir_all(active)?;
    }
    copy_tree(backup_dir, active, &[BACKUP_META, VOLUME_DIR])?;
    Ok(())
}

/// Import every volume archive of a backup back into the engine
pub fn restore_volumes(meta: &BackupMetadata, backup_dir: &Path) -> Result<()> {
    for vb in &meta.volumes {
        let archive = backup_dir.join(&vb.archive_path);
        if !archive.is_file() {
            bail!(ErrorKind::VolumeError("import".into(), vb.name.clone()));
        }
        if podman::volume_exists(&vb.name)? {
            podman::volume_remove(&vb.name)?;
        }
        podman::volume_import(&vb.name, &archive)?;
        info!("restored volume {}", vb.name);
    }
    Ok(())
}
