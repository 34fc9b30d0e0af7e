use std::collections::BTreeMap;
use std::process::Command;

use super::paths::Scope;
use super::{ErrorKind, Result};

/// Parsed `systemctl show` properties for one service
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServiceStatus {
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub description: String,
    pub main_pid: u32,
}

impl ServiceStatus {
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}

/// Append `.service` unless the name already carries it
pub fn normalize(service: &str) -> String {
    if service.ends_with(".service") {
        service.to_string()
    } else {
        format!("{}.service", service)
    }
}

/// Map a quadlet file name onto the generated systemd service
///
/// `web.container` becomes `web.service`; non-quadlet names pass
/// through `normalize`.
pub fn unit_to_service(file_name: &str) -> String {
    for ext in &[".container", ".volume", ".network", ".pod", ".kube", ".image"] {
        if file_name.ends_with(ext) {
            let base = &file_name[..file_name.len() - ext.len()];
            return format!("{}.service", base);
        }
    }
    normalize(file_name)
}

fn scope_args(scope: Scope) -> Vec<String> {
    match scope {
        Scope::User => vec!["--user".into()],
        Scope::System => vec![],
    }
}

fn systemctl_exists() -> Result<()> {
    if which::which("systemctl").is_err() {
        bail!("systemctl executable not found!");
    }
    Ok(())
}

/// Run systemctl discarding output, bailing on failure
pub fn sexec(scope: Scope, args: Vec<String>) -> Result<()> {
    systemctl_exists()?;
    let mut all = scope_args(scope);
    all.extend(args);
    debug!("systemctl {}", all.join(" "));
    let s = Command::new("systemctl").args(&all).status()?;
    if !s.success() {
        bail!("Subprocess failure from systemctl: {}", s.code().unwrap_or(1001))
    }
    Ok(())
}

/// Run systemctl capturing stdout/stderr
pub fn sout(scope: Scope, args: Vec<String>) -> Result<(String, String, bool)> {
    systemctl_exists()?;
    let mut all = scope_args(scope);
    all.extend(args);
    debug!("systemctl {}", all.join(" "));
    let s = Command::new("systemctl").args(&all).output()?;
    let out: String = String::from_utf8_lossy(&s.stdout).into();
    let err: String = String::from_utf8_lossy(&s.stderr).trim().into();
    Ok((out, err, s.status.success()))
}

fn action(scope: Scope, verb: &str, service: &str) -> Result<()> {
    let svc = normalize(service);
    sexec(scope, vec![verb.into(), svc.clone()])
        .map_err(|e| {
            warn!("systemctl {} {} failed: {}", verb, svc, e);
            ErrorKind::SupervisorError(verb.into(), svc.clone()).into()
        })
}

pub fn start(scope: Scope, service: &str) -> Result<()> {
    action(scope, "start", service)
}

pub fn stop(scope: Scope, service: &str) -> Result<()> {
    action(scope, "stop", service)
}

pub fn restart(scope: Scope, service: &str) -> Result<()> {
    action(scope, "restart", service)
}

pub fn enable(scope: Scope, service: &str) -> Result<()> {
    action(scope, "enable", service)
}

pub fn disable(scope: Scope, service: &str) -> Result<()> {
    action(scope, "disable", service)
}

/// Ask systemd to re-run generators (quadlet units changed)
pub fn daemon_reload(scope: Scope) -> Result<()> {
    sexec(scope, vec!["daemon-reload".into()])
        .map_err(|_| ErrorKind::SupervisorError("daemon-reload".into(), "-".into()).into())
}

/// Parse `k=v` property lines from `systemctl show`
pub fn parse_properties(out: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in out.lines() {
        if let Some(eq) = line.find('=') {
            map.insert(line[..eq].to_string(), line[eq + 1..].to_string());
        }
    }
    map
}

/// Status of one service via `systemctl show`
pub fn show(scope: Scope, service: &str) -> Result<ServiceStatus> {
    let svc = normalize(service);
    let args = vec![
        "show".into(),
        svc.clone(),
        "-p".into(),
        "LoadState,ActiveState,SubState,Description,MainPID".into(),
    ];
    let (out, err, success) = sout(scope, args)?;
    if !success {
        warn!("systemctl show {} stderr: {}", svc, err);
        bail!(ErrorKind::SupervisorError("show".into(), svc));
    }
    let props = parse_properties(&out);
    let get = |k: &str| props.get(k).cloned().unwrap_or_default();
    Ok(ServiceStatus {
        load_state: get("LoadState"),
        active_state: get("ActiveState"),
        sub_state: get("SubState"),
        description: get("Description"),
        main_pid: get("MainPID").parse().unwrap_or(0),
    })
}

/// List service units matching a glob, raw `list-units` output
pub fn list(scope: Scope, pattern: Option<&str>) -> Result<String> {
    let mut args = vec![
        "list-units".into(),
        "--type=service".into(),
        "--all".into(),
        "--no-pager".into(),
    ];
    if let Some(p) = pattern {
        args.push(p.into());
    }
    let (out, err, success) = sout(scope, args)?;
    if !success {
        bail!("systemctl list-units failed: {}", err);
    }
    Ok(out)
}

/// Tail journal logs for a service, optionally following
pub fn logs(scope: Scope, service: &str, lines: u32, follow: bool) -> Result<()> {
    if which::which("journalctl").is_err() {
        bail!("journalctl executable not found!");
    }
    let svc = normalize(service);
    let mut args: Vec<String> = match scope {
        Scope::User => vec!["--user".into()],
        Scope::System => vec![],
    };
    args.extend(vec!["-u".into(), svc.clone(), "-n".into(), lines.to_string()]);
    if follow {
        args.push("-f".into());
    }
    info!("journalctl {}", args.join(" "));
    let s = Command::new("journalctl").args(&args).status()?;
    if !s.success() {
        bail!(ErrorKind::SupervisorError("logs".into(), svc));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{normalize, parse_properties, unit_to_service};

    #[test]
    fn normalization() {
        assert_eq!(normalize("web"), "web.service");
        assert_eq!(normalize("web.service"), "web.service");
    }

    #[test]
    fn quadlet_to_service_mapping() {
        assert_eq!(unit_to_service("web.container"), "web.service");
        assert_eq!(unit_to_service("db-data.volume"), "db-data.service");
        assert_eq!(unit_to_service("app.kube"), "app.service");
        assert_eq!(unit_to_service("plain"), "plain.service");
    }

    #[test]
    fn property_parsing() {
        let out = "LoadState=loaded\nActiveState=active\nSubState=running\nDescription=Web frontend\nMainPID=4242\n";
        let props = parse_properties(out);
        assert_eq!(props["ActiveState"], "active");
        assert_eq!(props["MainPID"], "4242");
        assert_eq!(props["Description"], "Web frontend");
    }
}
