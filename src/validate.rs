use std::collections::BTreeMap;
use std::path::Path;

use super::graph::{self, Dependency, MissingDependency};
use super::quadlet::{UnitFile, UnitKind};
use super::Result;

/// A file that failed to parse or is missing required keys
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyntaxIssue {
    pub file: String,
    pub message: String,
}

/// Two or more units publishing the same host port
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PortConflict {
    /// `<host-port>/<proto>`, e.g. `8080/tcp`
    pub port: String,
    pub units: Vec<String>,
}

/// Two or more units claiming the same named volume
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VolumeConflict {
    pub name: String,
    pub units: Vec<String>,
}

/// Composite outcome of a full validation pass
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub syntax_errors: Vec<SyntaxIssue>,
    pub port_conflicts: Vec<PortConflict>,
    pub volume_conflicts: Vec<VolumeConflict>,
    pub dependencies: Vec<Dependency>,
    pub circular: Vec<Vec<String>>,
    pub missing: Vec<MissingDependency>,
}

impl ValidationResult {
    fn finalize(mut self) -> ValidationResult {
        self.valid = self.syntax_errors.is_empty()
            && self.port_conflicts.is_empty()
            && self.volume_conflicts.is_empty()
            && self.circular.is_empty()
            && self.missing.is_empty();
        self
    }

    /// Yaml dump for the validate subcommand
    pub fn print(&self) -> Result<()> {
        let encoded = serde_yaml::to_string(self)?;
        print!("{}\n", encoded);
        Ok(())
    }
}

/// Fully validate a bundle directory
///
/// Parse failures become syntax issues rather than hard errors so one
/// bad file does not mask conflicts between the others.
pub fn bundle(dir: &Path) -> Result<ValidationResult> {
    use walkdir::WalkDir;
    let mut res = ValidationResult::default();
    let mut units: Vec<UnitFile> = vec![];

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
        if UnitKind::from_extension(ext).is_none() {
            continue;
        }
        match UnitFile::parse(entry.path()) {
            Ok(u) => {
                if let Some(issue) = kind_check(&u) {
                    res.syntax_errors.push(issue);
                }
                units.push(u);
            }
            Err(e) => {
                let file = entry.file_name().to_string_lossy().to_string();
                res.syntax_errors.push(SyntaxIssue { file, message: format!("{}", e) });
            }
        }
    }

    let (ports, volumes) = quick_conflicts(&units);
    res.port_conflicts = ports;
    res.volume_conflicts = volumes;

    let deps = graph::analyze(&units);
    res.dependencies = deps.dependencies;
    res.circular = deps.circular;
    res.missing = deps.missing;

    Ok(res.finalize())
}

/// Validate already parsed units (no filesystem walk)
pub fn units(parsed: &[UnitFile]) -> ValidationResult {
    let mut res = ValidationResult::default();
    for u in parsed {
        if let Some(issue) = kind_check(u) {
            res.syntax_errors.push(issue);
        }
    }
    let (ports, volumes) = quick_conflicts(parsed);
    res.port_conflicts = ports;
    res.volume_conflicts = volumes;
    let deps = graph::analyze(parsed);
    res.dependencies = deps.dependencies;
    res.circular = deps.circular;
    res.missing = deps.missing;
    res.finalize()
}

/// The quick pre-stage / pre-apply pass: ports and volumes only
pub fn quick_conflicts(units: &[UnitFile]) -> (Vec<PortConflict>, Vec<VolumeConflict>) {
    let mut by_port: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut by_volume: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for u in units {
        for pp in u.values("Container", "PublishPort") {
            if let Some(key) = host_port_key(pp) {
                let entry = by_port.entry(key).or_insert_with(Vec::new);
                if !entry.contains(&u.name) {
                    entry.push(u.name.clone());
                }
            }
        }
        for vol in u.volume_names() {
            let entry = by_volume.entry(vol).or_insert_with(Vec::new);
            if !entry.contains(&u.name) {
                entry.push(u.name.clone());
            }
        }
    }

    let ports = by_port
        .into_iter()
        .filter(|(_, units)| units.len() > 1)
        .map(|(port, units)| PortConflict { port, units })
        .collect();
    let volumes = by_volume
        .into_iter()
        .filter(|(_, units)| units.len() > 1)
        .map(|(name, units)| VolumeConflict { name, units })
        .collect();
    (ports, volumes)
}

/// Extract `<host-port>/<proto>` from a PublishPort value
///
/// Handles `host:ctr`, `ip:host:ctr` and trailing `/udp`; a bare
/// container port publishes to a random host port and cannot conflict.
fn host_port_key(value: &str) -> Option<String> {
    let (spec, proto) = match value.find('/') {
        Some(idx) => (&value[..idx], &value[idx + 1..]),
        None => (value, "tcp"),
    };
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 {
        return None;
    }
    let host = parts[parts.len() - 2].trim();
    if host.is_empty() || host.parse::<u16>().is_err() {
        return None;
    }
    Some(format!("{}/{}", host, proto))
}

/// Per kind structural requirements
fn kind_check(u: &UnitFile) -> Option<SyntaxIssue> {
    let missing = |msg: &str| {
        Some(SyntaxIssue { file: u.name.clone(), message: msg.to_string() })
    };
    match u.kind {
        UnitKind::Container => {
            if !u.has_section("Container") {
                return missing("missing [Container] section");
            }
            if u.value("Container", "Image").is_none() {
                return missing("missing Image= in [Container]");
            }
        }
        UnitKind::Volume => {
            if !u.has_section("Volume") {
                return missing("missing [Volume] section");
            }
        }
        UnitKind::Network => {
            if !u.has_section("Network") {
                return missing("missing [Network] section");
            }
        }
        UnitKind::Pod => {
            if !u.has_section("Pod") {
                return missing("missing [Pod] section");
            }
        }
        UnitKind::Kube => {
            if !u.has_section("Kube") {
                return missing("missing [Kube] section");
            }
            if u.value("Kube", "Yaml").is_none() && u.value("Kube", "ConfigMap").is_none() {
                return missing("missing Yaml= or ConfigMap= in [Kube]");
            }
        }
        UnitKind::Image => {
            if !u.has_section("Image") {
                return missing("missing [Image] section");
            }
            if u.value("Image", "Image").is_none() {
                return missing("missing Image= in [Image]");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{bundle, host_port_key, units};
    use crate::quadlet::UnitFile;
    use std::fs;
    use std::path::Path;

    fn parse(name: &str, data: &str) -> UnitFile {
        UnitFile::parse_str(Path::new(&format!("/b/{}", name)), data).unwrap()
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(host_port_key("8080:80"), Some("8080/tcp".into()));
        assert_eq!(host_port_key("8080:80/udp"), Some("8080/udp".into()));
        assert_eq!(host_port_key("127.0.0.1:8080:80"), Some("8080/tcp".into()));
        assert_eq!(host_port_key("80"), None);
        assert_eq!(host_port_key("bad:80"), None);
    }

    #[test]
    fn port_conflict_between_two_units() {
        let a = parse("a.container", "[Container]\nImage=x\nPublishPort=8080:80\n");
        let b = parse("b.container", "[Container]\nImage=y\nPublishPort=8080:80\n");
        let res = units(&[a, b]);
        assert!(!res.valid);
        assert_eq!(res.port_conflicts.len(), 1);
        assert_eq!(res.port_conflicts[0].port, "8080/tcp");
        assert_eq!(res.port_conflicts[0].units, vec!["a.container", "b.container"]);
    }

    #[test]
    fn different_protocols_do_not_conflict() {
        let a = parse("a.container", "[Container]\nImage=x\nPublishPort=53:53/udp\n");
        let b = parse("b.container", "[Container]\nImage=y\nPublishPort=53:53\n");
        let res = units(&[a, b]);
        assert!(res.port_conflicts.is_empty());
    }

    #[test]
    fn volume_conflict_between_two_units() {
        let a = parse("a.container", "[Container]\nImage=x\nVolume=shared:/data\n");
        let b = parse("b.container", "[Container]\nImage=y\nVolume=shared:/data\n");
        let res = units(&[a, b]);
        assert_eq!(res.volume_conflicts.len(), 1);
        assert_eq!(res.volume_conflicts[0].name, "shared");
    }

    #[test]
    fn repeated_volume_in_one_unit_is_fine() {
        let a = parse(
            "a.container",
            "[Container]\nImage=x\nVolume=data:/data\nVolume=data:/backup\n",
        );
        let res = units(&[a]);
        assert!(res.volume_conflicts.is_empty());
    }

    #[test]
    fn kind_requirements() {
        let missing_img = parse("a.container", "[Container]\nEnvironment=X=1\n");
        let res = units(&[missing_img]);
        assert_eq!(res.syntax_errors.len(), 1);
        assert!(res.syntax_errors[0].message.contains("Image="));

        let kube = parse("k.kube", "[Kube]\nYaml=app.yaml\n");
        assert!(units(&[kube]).syntax_errors.is_empty());

        let kube_bad = parse("k.kube", "[Kube]\n");
        assert_eq!(units(&[kube_bad]).syntax_errors.len(), 1);
    }

    #[test]
    fn network_pod_and_image_requirements() {
        let net = parse("n.network", "[Network]\nSubnet=10.1.0.0/24\n");
        assert!(units(&[net]).syntax_errors.is_empty());
        let net_bad = parse("n.network", "[Unit]\nDescription=x\n");
        assert_eq!(units(&[net_bad]).syntax_errors.len(), 1);

        let pod = parse("p.pod", "[Pod]\n");
        assert!(units(&[pod]).syntax_errors.is_empty());

        let img = parse("i.image", "[Image]\nImage=quay.io/acme/app:1\n");
        assert!(units(&[img]).syntax_errors.is_empty());
        let img_bad = parse("i.image", "[Image]\n");
        assert_eq!(units(&[img_bad]).syntax_errors.len(), 1);
    }

    #[test]
    fn valid_bundle_reports_dependencies() {
        let a = parse("a.container", "[Unit]\nAfter=b.service\n\n[Container]\nImage=x\n");
        let b = parse("b.container", "[Container]\nImage=y\n");
        let res = units(&[a, b]);
        assert!(res.valid);
        assert_eq!(res.dependencies.len(), 1);
        assert_eq!(res.dependencies[0].from, "a");
        assert_eq!(res.dependencies[0].to, "b");
    }

    #[test]
    fn full_bundle_walk_collects_everything() {
        let dir = std::env::temp_dir().join("leger-validate-walk");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.container"), "[Container]\nImage=x\nPublishPort=80:80\n").unwrap();
        fs::write(dir.join("b.container"), "[Container]\nImage=y\nPublishPort=80:80\n").unwrap();
        fs::write(dir.join("broken.container"), "[Container\nImage=z\n").unwrap();
        let res = bundle(&dir).unwrap();
        assert!(!res.valid);
        assert_eq!(res.port_conflicts.len(), 1);
        assert_eq!(res.syntax_errors.len(), 1);
        assert!(res.syntax_errors[0].file.contains("broken"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cycle_surfaced_in_result() {
        let a = parse("a.container", "[Unit]\nAfter=b.service\n\n[Container]\nImage=x\n");
        let b = parse("b.container", "[Unit]\nAfter=a.service\n\n[Container]\nImage=y\n");
        let res = units(&[a, b]);
        assert!(!res.valid);
        assert_eq!(res.circular.len(), 1);
        assert_eq!(res.circular[0].len(), 2);
    }
}
