use super::catalog::Catalog;
use super::secretd::Daemon;
use super::Result;

/// Counters for one reconciliation pass
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    pub synced: usize,
    pub skipped: usize,
    pub errored: usize,
}

/// One row of a dry-run plan
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub name: String,
    pub remote_version: u32,
    pub local_version: Option<u32>,
    /// `push` or `skip`
    pub action: String,
}

/// The daemon-side name for a catalog secret
pub fn local_name(user: &str, name: &str) -> String {
    format!("catalog/{}/{}", user, name)
}

/// Reconcile catalog secrets into the local daemon
///
/// Per secret: fetch the remote value, skip when the daemon already has
/// the same version (unless `force`), otherwise push. Individual
/// failures are counted and logged but never abort the pass; the pass
/// as a whole fails iff anything errored.
pub fn sync(catalog: &Catalog, daemon: &Daemon, user: &str, force: bool) -> Result<SyncOutcome> {
    daemon.health()?;
    let remote = catalog.secrets_list()?;
    info!("reconciling {} catalog secrets for {}", remote.len(), user);

    let mut outcome = SyncOutcome::default();
    for meta in remote {
        let lname = local_name(user, &meta.name);
        let local = match daemon.active_version(&lname) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to query daemon for {}: {}", lname, e);
                outcome.errored += 1;
                continue;
            }
        };
        if !force && local == Some(meta.version) {
            debug!("{} already at version {}", lname, meta.version);
            outcome.skipped += 1;
            continue;
        }
        let value = match catalog.secret_get(&meta.name) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to fetch secret {}: {}", meta.name, e);
                outcome.errored += 1;
                continue;
            }
        };
        match daemon.put(&lname, value.value.as_bytes(), value.version) {
            Ok(()) => {
                info!("synced {} at version {}", lname, value.version);
                outcome.synced += 1;
            }
            Err(e) => {
                warn!("failed to push {} to daemon: {}", lname, e);
                outcome.errored += 1;
            }
        }
    }

    if outcome.errored > 0 {
        bail!(
            "secret sync finished with {} errors ({} synced, {} skipped)",
            outcome.errored,
            outcome.synced,
            outcome.skipped
        );
    }
    Ok(outcome)
}

/// Dry run: list remote metadata and emit the intended plan
pub fn plan(catalog: &Catalog, daemon: &Daemon, user: &str, force: bool) -> Result<Vec<PlanEntry>> {
    daemon.health()?;
    let remote = catalog.secrets_list()?;
    let mut entries = vec![];
    for meta in remote {
        let lname = local_name(user, &meta.name);
        let local = daemon.active_version(&lname).unwrap_or(None);
        let action = if !force && local == Some(meta.version) {
            "skip"
        } else {
            "push"
        };
        entries.push(PlanEntry {
            name: meta.name,
            remote_version: meta.version,
            local_version: local,
            action: action.into(),
        });
    }
    Ok(entries)
}
