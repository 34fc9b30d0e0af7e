use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use super::{ErrorKind, Result, ResultExt};

/// The quadlet unit kinds podman's generator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Container,
    Volume,
    Network,
    Pod,
    Kube,
    Image,
}

impl UnitKind {
    /// Map a file extension to a kind
    pub fn from_extension(ext: &str) -> Option<UnitKind> {
        match ext {
            "container" => Some(UnitKind::Container),
            "volume" => Some(UnitKind::Volume),
            "network" => Some(UnitKind::Network),
            "pod" => Some(UnitKind::Pod),
            "kube" => Some(UnitKind::Kube),
            "image" => Some(UnitKind::Image),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            UnitKind::Container => "container",
            UnitKind::Volume => "volume",
            UnitKind::Network => "network",
            UnitKind::Pod => "pod",
            UnitKind::Kube => "kube",
            UnitKind::Image => "image",
        }
    }
}

/// A parsed quadlet unit file
///
/// Sections map to ordered `(key, value)` pairs because quadlet keys
/// repeat (`Volume=`, `PublishPort=`, `Label=`) and podman honours their
/// order. Comments and blank lines are dropped on parse.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFile {
    pub path: PathBuf,
    /// File base name including the kind extension, e.g. `web.container`
    pub name: String,
    pub kind: UnitKind,
    sections: BTreeMap<String, Vec<(String, String)>>,
}

/// A `Secret=` directive harvested from a `[Container]` section
#[derive(Debug, Clone, PartialEq)]
pub struct SecretDirective {
    pub name: String,
    pub kind: SecretKind,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecretKind {
    Env,
    Mount,
}

impl UnitFile {
    /// Parse a unit file from disk
    pub fn parse(path: &Path) -> Result<UnitFile> {
        let mut f = File::open(path)
            .chain_err(|| format!("could not open unit file {}", path.display()))?;
        let mut data = String::new();
        f.read_to_string(&mut data)?;
        UnitFile::parse_str(path, &data)
    }

    /// Parse unit file content associated with a path
    pub fn parse_str(path: &Path, data: &str) -> Result<UnitFile> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => bail!("unit path {} has no file name", path.display()),
        };
        let ext = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let kind = match UnitKind::from_extension(ext) {
            Some(k) => k,
            None => bail!("{} does not have a quadlet extension", path.display()),
        };

        let mut sections: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (idx, raw) in data.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(
                        ErrorKind::UnitSyntaxError(path.display().to_string(), idx + 1).into(),
                    );
                }
                let section = line[1..line.len() - 1].trim().to_string();
                sections.entry(section.clone()).or_insert_with(Vec::new);
                current = Some(section);
                continue;
            }
            match line.find('=') {
                Some(eq) => {
                    let key = line[..eq].trim().to_string();
                    let val = line[eq + 1..].trim().to_string();
                    if key.is_empty() {
                        return Err(
                            ErrorKind::UnitSyntaxError(path.display().to_string(), idx + 1).into(),
                        );
                    }
                    // key=value before any [Section] is discarded
                    if let Some(ref sec) = current {
                        sections.get_mut(sec).unwrap().push((key, val));
                    }
                }
                None => {
                    return Err(
                        ErrorKind::UnitSyntaxError(path.display().to_string(), idx + 1).into(),
                    )
                }
            }
        }

        Ok(UnitFile { path: path.to_path_buf(), name, kind, sections })
    }

    /// Serialize back to the unit file grammar
    ///
    /// Comments and surrounding whitespace from the original are gone,
    /// but `parse(write(u)) == u` holds.
    pub fn write(&self) -> String {
        let mut out = String::new();
        for (section, pairs) in &self.sections {
            out.push_str(&format!("[{}]\n", section));
            for (k, v) in pairs {
                out.push_str(&format!("{}={}\n", k, v));
            }
            out.push('\n');
        }
        out
    }

    /// Service base name: file name without the kind extension
    pub fn service_name(&self) -> String {
        self.name
            .trim_end_matches(&format!(".{}", self.kind.extension()))
            .to_string()
    }

    /// The systemd service a container engine generates for this unit
    pub fn service_unit(&self) -> String {
        format!("{}.service", self.service_name())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// All values for a key within a section, in file order
    pub fn values(&self, section: &str, key: &str) -> Vec<&str> {
        match self.sections.get(section) {
            Some(pairs) => pairs
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect(),
            None => vec![],
        }
    }

    /// First value for a key within a section
    pub fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.values(section, key).into_iter().next()
    }

    /// Harvest `Secret=` directives from `[Container]`
    ///
    /// Recognised options are `type` (env or mount, env by default) and
    /// `target`. A missing env target defaults to the upper snake form
    /// of the secret name.
    pub fn secret_directives(&self) -> Vec<SecretDirective> {
        let mut out = vec![];
        for v in self.values("Container", "Secret") {
            let mut parts = v.split(',').map(|p| p.trim());
            let name = match parts.next() {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };
            let mut kind = SecretKind::Env;
            let mut target = None;
            for opt in parts {
                match opt.find('=') {
                    Some(eq) => {
                        let (k, val) = (&opt[..eq], &opt[eq + 1..]);
                        match k {
                            "type" if val == "mount" => kind = SecretKind::Mount,
                            "type" => kind = SecretKind::Env,
                            "target" => target = Some(val.to_string()),
                            _ => trace!("ignoring secret option {}", opt),
                        }
                    }
                    None => trace!("ignoring malformed secret option {}", opt),
                }
            }
            let target = target.unwrap_or_else(|| match kind {
                SecretKind::Env => upper_snake(&name),
                SecretKind::Mount => name.clone(),
            });
            out.push(SecretDirective { name, kind, target });
        }
        out
    }

    /// Leading names of `Volume=` values in `[Container]`
    ///
    /// Only named volumes are returned; host path mounts (absolute or
    /// dot-prefixed sources) are not managed by leger.
    pub fn volume_names(&self) -> Vec<String> {
        self.values("Container", "Volume")
            .into_iter()
            .filter_map(|v| {
                let lead = v.split(':').next().unwrap_or("").trim();
                if lead.is_empty() || lead.starts_with('/') || lead.starts_with('.') {
                    None
                } else {
                    Some(lead.to_string())
                }
            })
            .collect()
    }

    /// Dependency service names from `[Unit]` After/Requires/Wants
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = vec![];
        for key in &["After", "Requires", "Wants"] {
            for v in self.values("Unit", key) {
                for tok in v.split_whitespace() {
                    deps.push(tok.trim_end_matches(".service").to_string());
                }
            }
        }
        deps
    }
}

/// UPPER_SNAKE a secret name for env injection, mapping `-` to `_`
fn upper_snake(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Discover and parse every quadlet unit directly under a directory
pub fn discover(dir: &Path) -> Result<Vec<UnitFile>> {
    use walkdir::WalkDir;
    let mut units = vec![];
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
        if UnitKind::from_extension(ext).is_some() {
            units.push(UnitFile::parse(entry.path())?);
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::{discover, SecretKind, UnitFile, UnitKind};
    use std::path::Path;

    fn webapp() -> UnitFile {
        let data = "
# front end
[Unit]
Description=Web frontend
After=db.service cache.service
Wants=cache.service

[Container]
Image=docker.io/library/nginx:alpine
PublishPort=8080:80
Volume=web-data:/var/lib/www
Volume=/etc/ssl:/certs:ro
Secret=api-key
Secret=tls-cert,type=mount,target=/run/tls.pem
Label=x-health-url=http://localhost:8080/health

[Install]
WantedBy=default.target
";
        UnitFile::parse_str(Path::new("/b/web.container"), data).unwrap()
    }

    #[test]
    fn parse_basics() {
        let u = webapp();
        assert_eq!(u.kind, UnitKind::Container);
        assert_eq!(u.name, "web.container");
        assert_eq!(u.service_name(), "web");
        assert_eq!(u.service_unit(), "web.service");
        assert_eq!(u.value("Container", "Image"), Some("docker.io/library/nginx:alpine"));
        assert_eq!(u.values("Container", "Volume").len(), 2);
        assert!(u.has_section("Install"));
        // comments are gone
        assert!(!u.write().contains("front end"));
    }

    #[test]
    fn roundtrip() {
        let u = webapp();
        let rewritten = u.write();
        let u2 = UnitFile::parse_str(Path::new("/b/web.container"), &rewritten).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn keyvalue_before_section_discarded() {
        let u = UnitFile::parse_str(
            Path::new("/b/x.container"),
            "stray=1\n[Container]\nImage=img\n",
        )
        .unwrap();
        assert_eq!(u.values("Container", "stray").len(), 0);
        assert_eq!(u.value("Container", "Image"), Some("img"));
    }

    #[test]
    fn bad_line_is_an_error() {
        let res = UnitFile::parse_str(Path::new("/b/x.container"), "[Container]\nnot a pair\n");
        assert!(res.is_err());
        let msg = format!("{}", res.unwrap_err());
        assert!(msg.contains("line 2"));
    }

    #[test]
    fn secrets_extraction() {
        let u = webapp();
        let secrets = u.secret_directives();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[0].name, "api-key");
        assert_eq!(secrets[0].kind, SecretKind::Env);
        assert_eq!(secrets[0].target, "API_KEY");
        assert_eq!(secrets[1].name, "tls-cert");
        assert_eq!(secrets[1].kind, SecretKind::Mount);
        assert_eq!(secrets[1].target, "/run/tls.pem");
    }

    #[test]
    fn volume_names_skip_host_paths() {
        let u = webapp();
        assert_eq!(u.volume_names(), vec!["web-data".to_string()]);
    }

    #[test]
    fn dependency_tokens() {
        let u = webapp();
        assert_eq!(u.dependencies(), vec!["db", "cache", "cache"]);
    }

    #[test]
    fn empty_values_and_reopened_sections() {
        let data = "[Container]\nImage=img\nEnvironment=\n\n[Unit]\nAfter=a.service\n\n[Container]\nLabel=k=v\n";
        let u = UnitFile::parse_str(Path::new("/b/x.container"), data).unwrap();
        // empty value survives
        assert_eq!(u.value("Container", "Environment"), Some(""));
        // a reopened section appends to the same table
        assert_eq!(u.value("Container", "Label"), Some("k=v"));
        assert_eq!(u.value("Container", "Image"), Some("img"));
    }

    #[test]
    fn write_format_is_plain_ini() {
        let u = UnitFile::parse_str(
            Path::new("/b/x.volume"),
            "  [Volume]  \n  Driver = local \n",
        )
        .unwrap();
        assert_eq!(u.write(), "[Volume]\nDriver=local\n\n");
    }

    #[test]
    fn repeated_keys_keep_order() {
        let data = "[Container]\nImage=i\nPublishPort=1:1\nPublishPort=2:2\nPublishPort=3:3\n";
        let u = UnitFile::parse_str(Path::new("/b/x.container"), data).unwrap();
        assert_eq!(u.values("Container", "PublishPort"), vec!["1:1", "2:2", "3:3"]);
    }

    #[test]
    fn discover_ignores_other_files(){
        use std::fs;
        let dir = std::env::temp_dir().join("leger-quadlet-discover");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.container"), "[Container]\nImage=x\n").unwrap();
        fs::write(dir.join("a.volume"), "[Volume]\n").unwrap();
        fs::write(dir.join("README.md"), "hi").unwrap();
        let units = discover(&dir).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, UnitKind::Container);
        assert_eq!(units[1].kind, UnitKind::Volume);
        let _ = fs::remove_dir_all(&dir);
    }
}
