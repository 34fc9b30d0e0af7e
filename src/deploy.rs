use std::fs;
use std::path::PathBuf;

use super::backup::{self, BackupMetadata};
use super::diff;
use super::fetch;
use super::manifest::Bundle;
use super::paths::{Layout, Scope};
use super::podman;
use super::quadlet::{self, UnitKind};
use super::source;
use super::staging::{self, StagingMetadata, STAGING_META};
use super::systemctl;
use super::validate;
use super::{Error, ErrorKind, Result};

/// Fetch, validate and load a bundle from a user supplied source
fn acquire(src: &str, user: Option<&str>, token: Option<String>, branch: Option<&str>) -> Result<Bundle> {
    let repo = source::classify(src, user, branch)?;
    debug!("classified {} as {:?}", src, repo.kind);
    let dir = fetch::fetch(&repo, token)?;
    let result = validate::bundle(&dir)?;
    if !result.valid {
        result.print()?;
        let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        bail!(ErrorKind::ValidationFailed(name));
    }
    Bundle::load(&dir)
}

fn active_dir(layout: &Layout, name: &str) -> PathBuf {
    layout.active_root().join(name)
}

/// Parsed units of the active tree
fn active_units(layout: &Layout, name: &str) -> Result<Vec<quadlet::UnitFile>> {
    quadlet::discover(&active_dir(layout, name))
}

fn unit_paths(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    Ok(quadlet::discover(dir)?.into_iter().map(|u| u.path).collect())
}

/// Container service names of a unit set
fn container_services(units: &[quadlet::UnitFile]) -> Vec<String> {
    units
        .iter()
        .filter(|u| u.kind == UnitKind::Container)
        .map(|u| u.service_name())
        .collect()
}

/// Stop services, logging failures instead of propagating them
fn stop_services(scope: Scope, services: &[String]) {
    for svc in services {
        if let Err(e) = systemctl::stop(scope, svc) {
            warn!("failed to stop {}: {}", svc, e);
        }
    }
}

/// Register a tree's unit files with the engine and reload systemd
fn engine_install(layout: &Layout, scope: Scope, dir: &PathBuf) -> Result<()> {
    let files = unit_paths(dir)?;
    podman::install_units(&files, &layout.unit_dir)?;
    systemctl::daemon_reload(scope)
}

/// Deregister a tree's unit files and reload systemd
fn engine_remove(layout: &Layout, scope: Scope, units: &[quadlet::UnitFile]) -> Result<()> {
    let names: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
    podman::remove_units(&names, &layout.unit_dir)?;
    systemctl::daemon_reload(scope)
}

/// Fresh install of a bundle from any source
///
/// Aborts with no state change on resolve/fetch/validate failure. Start
/// failures after install are recorded; the install only counts as
/// failed when every service refuses to start.
pub fn install(
    layout: &Layout,
    scope: Scope,
    src: &str,
    user: Option<&str>,
    token: Option<String>,
    branch: Option<&str>,
) -> Result<String> {
    let bundle = acquire(src, user, token, branch)?;
    let name = bundle.name()?;
    let active = active_dir(layout, &name);
    if active.is_dir() {
        bail!(ErrorKind::AlreadyDeployed(name));
    }

    layout.ensure_data_dirs()?;
    staging::copy_tree(&bundle.root, &active, &[STAGING_META])?;
    engine_install(layout, scope, &active)?;

    let services = bundle.service_names();
    let mut failed = 0;
    for svc in &services {
        match systemctl::start(scope, svc) {
            Ok(()) => info!("started {}", svc),
            Err(e) => {
                warn!("failed to start {}: {}", svc, e);
                failed += 1;
            }
        }
    }
    if !services.is_empty() && failed == services.len() {
        bail!(ErrorKind::SupervisorError("start".into(), services.join(", ")));
    }
    info!("installed {} ({} services)", name, services.len());
    Ok(name)
}

/// Stage a fetched bundle as the pending update for its deployment
pub fn stage(
    layout: &Layout,
    src: &str,
    user: Option<&str>,
    token: Option<String>,
    branch: Option<&str>,
) -> Result<String> {
    let bundle = acquire(src, user, token, branch)?;
    let name = bundle.name()?;
    let active = active_dir(layout, &name);
    if !active.is_dir() {
        bail!(ErrorKind::NotDeployed(name));
    }

    layout.ensure_data_dirs()?;
    let current_version = match Bundle::load(&active) {
        Ok(b) => b.manifest.version.to_string(),
        Err(_) => "unknown".into(),
    };
    let repo = source::classify(src, user, branch)?;
    let meta = StagingMetadata {
        deployment_name: name.clone(),
        source_url: if src.is_empty() { repo.url.clone() } else { src.into() },
        staged_version: bundle.manifest.version.to_string(),
        current_version,
        staged_at: chrono::Utc::now(),
        checksum: staging::tree_checksum(&bundle.root)?,
    };
    staging::stage(layout, &name, &bundle.root, &meta)?;
    Ok(name)
}

/// Throw away the staged update for a deployment
pub fn discard(layout: &Layout, name: &str) -> Result<()> {
    staging::discard(layout, name)
}

/// Apply the staged update: stop, swap, install, start, with a safety
/// backup and a single rollback attempt on failure
pub fn apply(layout: &Layout, scope: Scope, name: &str) -> Result<()> {
    let active = active_dir(layout, name);
    let staged = layout.staged_root().join(name);
    if !active.is_dir() {
        bail!(ErrorKind::NotDeployed(name.into()));
    }
    if !staging::is_staged(layout, name) {
        bail!(ErrorKind::StagedUpdatesMissing(name.into()));
    }

    // pre-apply quick check over what would become active
    let staged_units = quadlet::discover(&staged)?;
    let (ports, volumes) = validate::quick_conflicts(&staged_units);
    if !ports.is_empty() {
        for p in &ports {
            error!("port conflict on {} between {}", p.port, p.units.join(" and "));
        }
        bail!(ErrorKind::ValidationFailed(name.into()));
    }
    for v in &volumes {
        // sharing a named volume inside one bundle may be intentional
        warn!("volume '{}' is shared by {}", v.name, v.units.join(" and "));
    }

    let d = diff::trees(&active, &staged)?;
    let mut affected = if d.is_empty() {
        info!("staged tree for {} is identical to active, restarting services anyway", name);
        container_services(&staged_units)
    } else {
        d.summary.affected_services.clone()
    };
    // services whose units go away must be stopped before the swap too
    for f in &d.removed {
        if f.ends_with(".container") {
            affected.push(f.trim_end_matches(".container").to_string());
        }
    }
    affected.sort();
    affected.dedup();

    let old_units = active_units(layout, name)?;
    let safety = backup::create(layout, name, "pre-apply-safety")?;

    let outcome = apply_steps(layout, scope, name, &affected, &old_units, &staged, &active);
    match outcome {
        Ok(()) => {
            backup::remove(layout, &safety.id)?;
            staging::discard(layout, name)?;
            info!("applied staged update for {}", name);
            Ok(())
        }
        Err(original) => recover(layout, scope, name, &safety, original),
    }
}

/// The fallible middle of apply, separated so the caller can wrap every
/// failure in the rollback protocol
fn apply_steps(
    layout: &Layout,
    scope: Scope,
    name: &str,
    affected: &[String],
    old_units: &[quadlet::UnitFile],
    staged: &PathBuf,
    active: &PathBuf,
) -> Result<()> {
    stop_services(scope, affected);
    engine_remove(layout, scope, old_units)?;

    fs::remove_dir_all(active)?;
    staging::copy_tree(staged, active, &[STAGING_META])?;

    engine_install(layout, scope, active)?;

    let new_units = quadlet::discover(active)?;
    for svc in container_services(&new_units) {
        systemctl::start(scope, &svc)?;
    }
    Ok(())
}

/// Roll back to a safety backup exactly once, classifying the outcome
fn recover(
    layout: &Layout,
    scope: Scope,
    name: &str,
    safety: &BackupMetadata,
    original: Error,
) -> Result<()> {
    error!("{} failed: {} - rolling back", name, original);
    match rollback(layout, scope, name, safety) {
        Ok(()) => {
            warn!("rolled {} back to pre-operation state", name);
            bail!(ErrorKind::RolledBack(format!("{}", original)))
        }
        Err(restore_err) => bail!(ErrorKind::FatalRollbackFailed(
            format!("{}", restore_err),
            format!("{}", original)
        )),
    }
}

/// Restore tree, volumes, engine units and services from a backup
fn rollback(layout: &Layout, scope: Scope, name: &str, safety: &BackupMetadata) -> Result<()> {
    let (_, backup_dir) = backup::find(layout, &safety.id)?;
    let active = active_dir(layout, name);

    // stop anything the failed attempt may have started
    if let Ok(units) = quadlet::discover(&active) {
        stop_services(scope, &container_services(&units));
        let _ = engine_remove(layout, scope, &units);
    }

    backup::restore_tree(&backup_dir, &active)?;
    backup::restore_volumes(safety, &backup_dir)?;
    engine_install(layout, scope, &active)?;

    let units = quadlet::discover(&active)?;
    for svc in container_services(&units) {
        systemctl::start(scope, &svc)?;
    }
    Ok(())
}

/// Stop services, deregister units and delete the active tree
pub fn remove(layout: &Layout, scope: Scope, name: &str) -> Result<()> {
    let active = active_dir(layout, name);
    if !active.is_dir() {
        bail!(ErrorKind::NotDeployed(name.into()));
    }
    let units = active_units(layout, name)?;
    stop_services(scope, &container_services(&units));
    engine_remove(layout, scope, &units)?;
    fs::remove_dir_all(&active)?;
    info!("removed deployment {}", name);
    Ok(())
}

/// Restore a deployment from a named backup
///
/// Takes a fresh safety backup of the current state first (when one
/// exists) and runs the same rollback protocol as apply on failure.
pub fn restore(layout: &Layout, scope: Scope, id: &str) -> Result<()> {
    let (meta, backup_dir) = backup::find(layout, id)?;
    let name = meta.deployment_name.clone();
    let active = active_dir(layout, &name);

    let safety = if active.is_dir() {
        Some(backup::create(layout, &name, "before-restore")?)
    } else {
        None
    };

    let outcome = restore_steps(layout, scope, &name, &meta, &backup_dir);
    match outcome {
        Ok(()) => {
            if let Some(s) = safety {
                backup::remove(layout, &s.id)?;
            }
            info!("restored {} from {}", name, id);
            Ok(())
        }
        Err(original) => match safety {
            Some(s) => recover(layout, scope, &name, &s, original),
            None => Err(original),
        },
    }
}

fn restore_steps(
    layout: &Layout,
    scope: Scope,
    name: &str,
    meta: &BackupMetadata,
    backup_dir: &PathBuf,
) -> Result<()> {
    let active = active_dir(layout, name);

    if let Ok(units) = quadlet::discover(&active) {
        stop_services(scope, &container_services(&units));
        engine_remove(layout, scope, &units)?;
    }

    backup::restore_tree(backup_dir, &active)?;
    backup::restore_volumes(meta, backup_dir)?;
    engine_install(layout, scope, &active)?;

    let units = quadlet::discover(&active)?;
    for svc in container_services(&units) {
        systemctl::start(scope, &svc)?;
    }
    Ok(())
}

/// Names of all active deployments
pub fn active_deployments(layout: &Layout) -> Result<Vec<String>> {
    let root = layout.active_root();
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
        if !quadlet::discover(&entry.path())?.is_empty() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
