use super::backup;
use super::deploy;
use super::paths::Layout;
use super::quadlet;
use super::staging;
use super::Result;

/// Print one line per active deployment
pub fn deployments(layout: &Layout) -> Result<()> {
    for name in deploy::active_deployments(layout)? {
        let units = quadlet::discover(&layout.active_root().join(&name))?;
        let staged = if staging::is_staged(layout, &name) { " (update staged)" } else { "" };
        print!("{}\t{} units{}\n", name, units.len(), staged);
    }
    Ok(())
}

/// Print staged updates with their version jump
pub fn staged(layout: &Layout) -> Result<()> {
    for name in staging::list(layout)? {
        match staging::load_metadata(layout, &name)? {
            Some(m) => print!(
                "{}\t{} -> {}\tstaged {}\tfrom {}\n",
                name, m.current_version, m.staged_version, m.staged_at.to_rfc3339(), m.source_url
            ),
            None => print!("{}\t(no metadata)\n", name),
        }
    }
    Ok(())
}

/// Print backups, newest first
pub fn backups(layout: &Layout, name: Option<&str>) -> Result<()> {
    for b in backup::list(layout, name)? {
        print!(
            "{}\t{}\t{}\t{} bytes\t{} volumes\n",
            b.id, b.kind, b.reason, b.size, b.volumes.len()
        );
    }
    Ok(())
}

/// Dump one deployment's trees and metadata (deploy show)
pub fn show(layout: &Layout, name: &str) -> Result<()> {
    let active = layout.active_root().join(name);
    if active.is_dir() {
        print!("active: {}\n", active.display());
        for u in quadlet::discover(&active)? {
            print!("  {}\n", u.name);
        }
    } else {
        print!("{} is not deployed\n", name);
    }
    if let Some(m) = staging::load_metadata(layout, name)? {
        print!("staged: {} -> {} (checksum {})\n", m.current_version, m.staged_version, m.checksum);
    }
    for b in backup::list(layout, Some(name))? {
        print!("backup: {} ({}, {})\n", b.id, b.kind, b.reason);
    }
    Ok(())
}
