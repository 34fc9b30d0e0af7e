use std::path::Path;

use super::health::{self, HealthState};
use super::paths::{Layout, Scope};
use super::quadlet::{self, UnitFile, UnitKind};
use super::staging;
use super::systemctl::{self, ServiceStatus};
use super::{ErrorKind, Result};

/// Everything `leger status` knows about one service
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceReport {
    pub service: String,
    pub unit_file: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub main_pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthReport {
    pub url: String,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub elapsed_ms: u64,
}

/// Aggregate status for a deployment
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeploymentReport {
    pub name: String,
    pub update_staged: bool,
    pub services: Vec<ServiceReport>,
    /// Non-container units that belong to the deployment
    pub support_units: Vec<String>,
}

impl DeploymentReport {
    /// Are all container services running?
    pub fn all_active(&self) -> bool {
        !self.services.is_empty() && self.services.iter().all(|s| s.active_state == "active")
    }

    pub fn print(&self) -> Result<()> {
        for s in &self.services {
            let health = match &s.health {
                Some(h) => match h.code {
                    Some(code) => format!("{:?} ({} in {}ms)", h.state, code, h.elapsed_ms),
                    None => format!("{:?}", h.state),
                },
                None => "no probe".into(),
            };
            print!(
                "{}\t{}/{}\tpid {}\t{}\n",
                s.service, s.active_state, s.sub_state, s.main_pid, health
            );
        }
        for u in &self.support_units {
            print!("{}\t(support unit)\n", u);
        }
        if self.update_staged {
            print!("an update is staged - `leger apply {}` to roll it out\n", self.name);
        }
        Ok(())
    }
}

fn probe_report(unit: &UnitFile) -> Option<HealthReport> {
    let spec = health::from_unit(unit)?;
    match health::probe(&spec) {
        Ok(r) => Some(HealthReport {
            url: spec.url,
            state: r.state,
            code: r.code,
            elapsed_ms: r.elapsed_ms,
        }),
        Err(e) => {
            warn!("probe for {} failed outright: {}", unit.name, e);
            None
        }
    }
}

/// Supervisor status of one unit, tolerating an unreachable systemctl
fn service_report(scope: Scope, unit: &UnitFile) -> ServiceReport {
    let svc = unit.service_name();
    let st = systemctl::show(scope, &svc).unwrap_or_else(|e| {
        debug!("systemctl show {} failed: {}", svc, e);
        ServiceStatus::default()
    });
    ServiceReport {
        service: svc,
        unit_file: unit.name.clone(),
        load_state: st.load_state,
        active_state: st.active_state,
        sub_state: st.sub_state,
        main_pid: st.main_pid,
        health: probe_report(unit),
    }
}

/// Build the report for one deployment
pub fn report(layout: &Layout, scope: Scope, name: &str) -> Result<DeploymentReport> {
    let active = layout.active_root().join(name);
    if !active.is_dir() {
        bail!(ErrorKind::NotDeployed(name.into()));
    }
    report_for_tree(layout, scope, name, &active)
}

fn report_for_tree(layout: &Layout, scope: Scope, name: &str, tree: &Path) -> Result<DeploymentReport> {
    let units = quadlet::discover(tree)?;
    let mut services = vec![];
    let mut support = vec![];
    for u in &units {
        if u.kind == UnitKind::Container {
            services.push(service_report(scope, u));
        } else {
            support.push(u.name.clone());
        }
    }
    Ok(DeploymentReport {
        name: name.into(),
        update_staged: staging::is_staged(layout, name),
        services,
        support_units: support,
    })
}

#[cfg(test)]
mod tests {
    use super::{DeploymentReport, ServiceReport};

    fn svc(state: &str) -> ServiceReport {
        ServiceReport {
            service: "web".into(),
            unit_file: "web.container".into(),
            load_state: "loaded".into(),
            active_state: state.into(),
            sub_state: "running".into(),
            main_pid: 1,
            health: None,
        }
    }

    #[test]
    fn all_active_requires_every_service() {
        let mut rep = DeploymentReport {
            name: "web".into(),
            update_staged: false,
            services: vec![svc("active"), svc("active")],
            support_units: vec![],
        };
        assert!(rep.all_active());
        rep.services.push(svc("failed"));
        assert!(!rep.all_active());
    }

    #[test]
    fn empty_report_is_not_active() {
        let rep = DeploymentReport {
            name: "web".into(),
            update_staged: false,
            services: vec![],
            support_units: vec![],
        };
        assert!(!rep.all_active());
    }
}
