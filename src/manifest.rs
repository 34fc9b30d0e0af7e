use chrono::{DateTime, Utc};
use serde::de::{self, Deserialize, Deserializer};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use super::quadlet::{self, UnitFile, UnitKind};
use super::{ErrorKind, Result};

/// One deployable service inside a bundle manifest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub files: Vec<String>,
}

/// Declarative description of a bundle
///
/// Read from `manifest.json` / `.leger.yaml` / `.leger.yml` in the
/// bundle root, or synthesized from the discovered unit files when the
/// bundle ships without one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BundleManifest {
    /// Schema version; dotted strings like `1.0.0` collapse to the major
    #[serde(deserialize_with = "relaxed_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// Bundles hand versions around as ints, but hand written manifests
/// tend to contain `1.0.0` style strings. Accept both.
fn relaxed_version<'de, D>(d: D) -> ::std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u32),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(v) => Ok(v),
        Raw::Str(s) => s
            .split('.')
            .next()
            .unwrap_or("")
            .parse::<u32>()
            .map_err(|_| de::Error::custom(format!("unparseable manifest version '{}'", s))),
    }
}

/// A working directory of unit files plus its manifest
#[derive(Debug, Clone)]
pub struct Bundle {
    pub root: PathBuf,
    pub units: Vec<UnitFile>,
    pub manifest: BundleManifest,
}

impl BundleManifest {
    /// Load the manifest from a bundle directory in priority order
    pub fn load(dir: &Path) -> Result<Option<BundleManifest>> {
        let json = dir.join("manifest.json");
        if json.is_file() {
            let mut data = String::new();
            File::open(&json)?.read_to_string(&mut data)?;
            let mf: BundleManifest = serde_json::from_str(&data)
                .map_err(|e| ErrorKind::ManifestInvalid(format!("{}: {}", json.display(), e)))?;
            return Ok(Some(mf));
        }
        for cand in &[".leger.yaml", ".leger.yml"] {
            let pth = dir.join(cand);
            if pth.is_file() {
                let mut data = String::new();
                File::open(&pth)?.read_to_string(&mut data)?;
                let mf: BundleManifest = serde_yaml::from_str(&data)
                    .map_err(|e| ErrorKind::ManifestInvalid(format!("{}: {}", pth.display(), e)))?;
                return Ok(Some(mf));
            }
        }
        Ok(None)
    }

    /// Build a manifest from a set of discovered unit files
    pub fn synthesize(units: &[UnitFile]) -> BundleManifest {
        let services = units
            .iter()
            .map(|u| ServiceDefinition {
                name: u.service_name(),
                kind: u.kind.extension().to_string(),
                files: vec![u.name.clone()],
            })
            .collect();
        BundleManifest {
            version: 1,
            created_at: Some(Utc::now()),
            name: None,
            services,
        }
    }

    /// Check structural invariants against the bundle contents
    pub fn verify(&self, dir: &Path) -> Result<()> {
        if self.version < 1 {
            bail!(ErrorKind::ManifestInvalid("schema version must be >= 1".into()));
        }
        if self.services.is_empty() {
            bail!(ErrorKind::ManifestInvalid("manifest lists no services".into()));
        }
        for svc in &self.services {
            if svc.name.is_empty() {
                bail!(ErrorKind::ManifestInvalid("service with empty name".into()));
            }
            if svc.kind.is_empty() {
                bail!(ErrorKind::ManifestInvalid(format!("service {} has no type", svc.name)));
            }
            if svc.files.is_empty() {
                bail!(ErrorKind::ManifestInvalid(format!("service {} lists no files", svc.name)));
            }
            for f in &svc.files {
                if !dir.join(f).is_file() {
                    bail!(ErrorKind::ManifestInvalid(format!(
                        "service {} references missing file {}",
                        svc.name, f
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Bundle {
    /// Load a bundle from a working directory
    ///
    /// Discovers unit files, loads or synthesizes the manifest, fills
    /// in missing service definitions, and verifies the result.
    pub fn load(root: &Path) -> Result<Bundle> {
        let units = quadlet::discover(root)?;
        if units.is_empty() {
            bail!(ErrorKind::NoQuadletFiles(root.display().to_string()));
        }
        let mut manifest = match BundleManifest::load(root)? {
            Some(mf) => mf,
            None => {
                debug!("no manifest in {}, synthesizing", root.display());
                BundleManifest::synthesize(&units)
            }
        };
        if manifest.services.is_empty() {
            manifest.services = BundleManifest::synthesize(&units).services;
        }
        manifest.verify(root)?;
        Ok(Bundle { root: root.to_path_buf(), units, manifest })
    }

    /// The deployment name: manifest name, else principal container unit
    pub fn name(&self) -> Result<String> {
        if let Some(ref n) = self.manifest.name {
            return Ok(n.clone());
        }
        match self.units.iter().find(|u| u.kind == UnitKind::Container) {
            Some(u) => Ok(u.service_name()),
            None => bail!(ErrorKind::NoQuadletFiles(self.root.display().to_string())),
        }
    }

    /// Units of a given kind
    pub fn units_of(&self, kind: UnitKind) -> Vec<&UnitFile> {
        self.units.iter().filter(|u| u.kind == kind).collect()
    }

    /// Service names started by the supervisor after install
    pub fn service_names(&self) -> Vec<String> {
        self.units_of(UnitKind::Container)
            .into_iter()
            .map(|u| u.service_name())
            .collect()
    }
}
