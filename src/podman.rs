use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{Error, ErrorKind, Result};

fn podman_exists() -> Result<()> {
    if which::which("podman").is_err() {
        bail!("podman executable not found!");
    }
    Ok(())
}

/// Run podman discarding output, bailing on failure
pub fn pexec(args: Vec<String>) -> Result<()> {
    podman_exists()?;
    debug!("podman {}", args.join(" "));
    let s = Command::new("podman").args(&args).status()?;
    if !s.success() {
        bail!("Subprocess failure from podman: {}", s.code().unwrap_or(1001))
    }
    Ok(())
}

/// Run podman capturing stdout/stderr and the exit code
pub fn pout(args: Vec<String>) -> Result<(String, String, Option<i32>)> {
    podman_exists()?;
    debug!("podman {}", args.join(" "));
    let s = Command::new("podman").args(&args).output()?;
    let out: String = String::from_utf8_lossy(&s.stdout).into();
    let err: String = String::from_utf8_lossy(&s.stderr).trim().into();
    Ok((out, err, s.status.code()))
}

/// Does a named volume exist?
///
/// `podman volume exists` exits 0 for yes and 1 for no; anything else
/// (or rc 1 with chatter on stderr) is a real error.
pub fn volume_exists(name: &str) -> Result<bool> {
    let (_, err, code) = pout(vec!["volume".into(), "exists".into(), name.into()])?;
    match code {
        Some(0) => Ok(true),
        Some(1) if err.is_empty() => Ok(false),
        _ => {
            warn!("podman volume exists {} stderr: {}", name, err);
            bail!(ErrorKind::VolumeError("exists".into(), name.into()))
        }
    }
}

pub fn volume_remove(name: &str) -> Result<()> {
    pexec(vec!["volume".into(), "rm".into(), name.into()])
        .map_err(|e| {
            warn!("{}", e);
            ErrorKind::VolumeError("rm".into(), name.into()).into()
        })
}

/// Names of all volumes known to the engine
pub fn volume_list() -> Result<Vec<String>> {
    let (out, err, code) = pout(vec![
        "volume".into(),
        "ls".into(),
        "--format".into(),
        "{{.Name}}".into(),
    ])?;
    if code != Some(0) {
        warn!("podman volume ls stderr: {}", err);
        bail!(ErrorKind::VolumeError("ls".into(), "-".into()));
    }
    Ok(out.lines().map(String::from).filter(|l| !l.is_empty()).collect())
}

/// Export a volume's contents as a tar archive on disk
pub fn volume_export(name: &str, archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    pexec(vec![
        "volume".into(),
        "export".into(),
        name.into(),
        "--output".into(),
        archive.display().to_string(),
    ])
    .map_err(|e| {
        warn!("{}", e);
        ErrorKind::VolumeError("export".into(), name.into()).into()
    })
}

/// Import a tar archive into a named volume, creating it if needed
pub fn volume_import(name: &str, archive: &Path) -> Result<()> {
    if !archive.is_file() {
        bail!(ErrorKind::VolumeError("import".into(), name.into()));
    }
    if !volume_exists(name)? {
        pexec(vec!["volume".into(), "create".into(), name.into()])
            .map_err(|_| Error::from(ErrorKind::VolumeError("create".into(), name.into())))?;
    }
    pexec(vec![
        "volume".into(),
        "import".into(),
        name.into(),
        archive.display().to_string(),
    ])
    .map_err(|e| {
        warn!("{}", e);
        ErrorKind::VolumeError("import".into(), name.into()).into()
    })
}

/// Newer podman ships a `quadlet install` subcommand; probe for it once
fn has_quadlet_subcommand() -> bool {
    match Command::new("podman").args(&["quadlet", "--help"]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// Install unit files into the engine's drop directory
///
/// Prefers the native install subcommand, falling back to a verified
/// 0644 copy for engines that predate it.
pub fn install_units(files: &[PathBuf], unit_dir: &Path) -> Result<()> {
    if files.is_empty() {
        bail!(ErrorKind::EngineError("install (no unit files)".into()));
    }
    if has_quadlet_subcommand() {
        let mut args = vec!["quadlet".into(), "install".into()];
        for f in files {
            args.push(f.display().to_string());
        }
        return pexec(args).map_err(|e| {
            warn!("{}", e);
            ErrorKind::EngineError("quadlet install".into()).into()
        });
    }
    copy_units(files, unit_dir)
}

/// The fallback installer: verified 0644 copies into the drop directory
pub fn copy_units(files: &[PathBuf], unit_dir: &Path) -> Result<()> {
    fs::create_dir_all(unit_dir)?;
    for f in files {
        let name = match f.file_name() {
            Some(n) => n,
            None => bail!(ErrorKind::EngineError(format!("install {}", f.display()))),
        };
        let target = unit_dir.join(name);
        fs::copy(f, &target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644))?;
        // verify the copy landed intact
        let src = fs::read(f)?;
        let dst = fs::read(&target)?;
        if src != dst {
            bail!(ErrorKind::EngineError(format!("verify {}", target.display())));
        }
        debug!("installed {}", target.display());
    }
    Ok(())
}

/// Remove a deployment's unit files from the drop directory
///
/// Only the given base names are touched; the directory is shared with
/// units outside leger's jurisdiction.
pub fn remove_units(file_names: &[String], unit_dir: &Path) -> Result<()> {
    for name in file_names {
        let target = unit_dir.join(name);
        if target.is_file() {
            fs::remove_file(&target)?;
            debug!("removed {}", target.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{copy_units, remove_units};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("leger-podman-{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn copy_install_and_remove() {
        let root = scratch("install");
        let bundle = root.join("bundle");
        let units = root.join("units");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("web.container"), "[Container]\nImage=x\n").unwrap();

        copy_units(&[bundle.join("web.container")], &units).unwrap();
        let installed = units.join("web.container");
        assert!(installed.is_file());
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        remove_units(&["web.container".to_string()], &units).unwrap();
        assert!(!installed.exists());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn remove_is_idempotent() {
        let root = scratch("rm");
        let units = root.join("units");
        fs::create_dir_all(&units).unwrap();
        remove_units(&["ghost.container".to_string()], &units).unwrap();
        let _ = fs::remove_dir_all(&root);
    }
}
