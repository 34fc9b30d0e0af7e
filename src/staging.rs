use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::paths::Layout;
use super::{ErrorKind, Result, ResultExt};

/// File name of the staging record inside a staged tree
///
/// Never copied into `active/` and invisible to the diff engine.
pub const STAGING_META: &str = ".staging-metadata.json";

/// Record describing a pending update, stored inside the staged tree
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StagingMetadata {
    pub deployment_name: String,
    pub source_url: String,
    pub staged_version: String,
    pub current_version: String,
    pub staged_at: DateTime<Utc>,
    pub checksum: String,
}

/// Copy a bundle tree, skipping excluded base names and `.git`
///
/// Used for staging, activation and backups so every copy obeys the
/// same exclusion rules.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by(|a, b| a.path().cmp(b.path()));
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(src)
            .chain_err(|| format!("walk escaped {}", src.display()))?;
        if rel.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if exclude.contains(&name) {
                continue;
            }
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Crc over relative paths and contents, for cheap change detection
pub fn tree_checksum(dir: &Path) -> Result<String> {
    let mut hasher = crc32fast::Hasher::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by(|a, b| a.path().cmp(b.path()));
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str() == Some(STAGING_META) {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        let mut f = File::open(entry.path())?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        hasher.update(&buf);
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

/// Stage a bundle as the pending update for a deployment
pub fn stage(layout: &Layout, name: &str, bundle_dir: &Path, meta: &StagingMetadata) -> Result<PathBuf> {
    let staged = layout.staged_root().join(name);
    if staged.is_dir() {
        debug!("replacing previous staged tree for {}", name);
        fs::remove_dir_all(&staged)?;
    }
    copy_tree(bundle_dir, &staged, &[STAGING_META])?;
    write_metadata(&staged, meta)?;
    info!("staged {} from {}", name, meta.source_url);
    Ok(staged)
}

pub fn write_metadata(staged: &Path, meta: &StagingMetadata) -> Result<()> {
    let encoded = serde_json::to_string_pretty(meta)?;
    let mut f = File::create(staged.join(STAGING_META))?;
    write!(f, "{}\n", encoded)?;
    Ok(())
}

/// Load the staging record for a deployment, if one is staged
pub fn load_metadata(layout: &Layout, name: &str) -> Result<Option<StagingMetadata>> {
    let pth = layout.staged_root().join(name).join(STAGING_META);
    if !pth.is_file() {
        return Ok(None);
    }
    let mut data = String::new();
    File::open(&pth)?.read_to_string(&mut data)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Does a staged tree with actual content exist for this name?
pub fn is_staged(layout: &Layout, name: &str) -> bool {
    let dir = layout.staged_root().join(name);
    match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_str() != Some(STAGING_META)),
        Err(_) => false,
    }
}

/// Names of all deployments with staged content
pub fn list(layout: &Layout) -> Result<Vec<String>> {
    let root = layout.staged_root();
    if !root.is_dir() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_staged(layout, &name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Throw away the staged tree for a deployment
pub fn discard(layout: &Layout, name: &str) -> Result<()> {
    let staged = layout.staged_root().join(name);
    if !staged.is_dir() {
        bail!(ErrorKind::StagedUpdatesMissing(name.into()));
    }
    fs::remove_dir_all(&staged)?;
    info!("discarded staged update for {}", name);
    Ok(())
}

/// Remove the staged root entirely
pub fn clean(layout: &Layout) -> Result<()> {
    let root = layout.staged_root();
    if root.is_dir() {
        fs::remove_dir_all(&root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{copy_tree, discard, is_staged, list, load_metadata, stage, tree_checksum, StagingMetadata, STAGING_META};
    use crate::paths::Layout;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;

    fn scratch(name: &str) -> (Layout, PathBuf) {
        let root = std::env::temp_dir().join(format!("leger-staging-{}", name));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let layout = Layout::rooted(&root);
        layout.ensure_data_dirs().unwrap();
        (layout, root)
    }

    fn meta(name: &str) -> StagingMetadata {
        StagingMetadata {
            deployment_name: name.into(),
            source_url: "https://github.com/acme/web".into(),
            staged_version: "2".into(),
            current_version: "1".into(),
            staged_at: Utc::now(),
            checksum: "deadbeef".into(),
        }
    }

    #[test]
    fn stage_then_discard() {
        let (layout, root) = scratch("stage");
        let bundle = root.join("bundle");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("web.container"), "[Container]\nImage=x\n").unwrap();

        let staged = stage(&layout, "web", &bundle, &meta("web")).unwrap();
        assert!(staged.join("web.container").is_file());
        assert!(staged.join(STAGING_META).is_file());
        assert!(is_staged(&layout, "web"));
        assert_eq!(list(&layout).unwrap(), vec!["web"]);

        let loaded = load_metadata(&layout, "web").unwrap().unwrap();
        assert_eq!(loaded.deployment_name, "web");

        discard(&layout, "web").unwrap();
        assert!(!layout.staged_root().join("web").exists());
        assert!(list(&layout).unwrap().is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn metadata_only_tree_is_not_staged() {
        let (layout, root) = scratch("metaonly");
        let dir = layout.staged_root().join("ghost");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STAGING_META), "{}").unwrap();
        assert!(!is_staged(&layout, "ghost"));
        assert!(list(&layout).unwrap().is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn copy_excludes_metadata_and_git() {
        let (_, root) = scratch("copy");
        let src = root.join("src");
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.container"), "[Container]\nImage=x\n").unwrap();
        fs::write(src.join(STAGING_META), "{}").unwrap();
        fs::write(src.join(".git").join("HEAD"), "ref").unwrap();
        fs::write(src.join("sub").join("note.txt"), "n").unwrap();

        let dst = root.join("dst");
        copy_tree(&src, &dst, &[STAGING_META]).unwrap();
        assert!(dst.join("a.container").is_file());
        assert!(dst.join("sub").join("note.txt").is_file());
        assert!(!dst.join(STAGING_META).exists());
        assert!(!dst.join(".git").exists());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn checksum_ignores_metadata_but_sees_content() {
        let (_, root) = scratch("sum");
        let dir = root.join("tree");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.container"), "[Container]\nImage=x\n").unwrap();
        let before = tree_checksum(&dir).unwrap();

        fs::write(dir.join(STAGING_META), "{}").unwrap();
        assert_eq!(tree_checksum(&dir).unwrap(), before);

        fs::write(dir.join("a.container"), "[Container]\nImage=y\n").unwrap();
        assert_ne!(tree_checksum(&dir).unwrap(), before);
        let _ = fs::remove_dir_all(&root);
    }
}
