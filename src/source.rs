use regex::Regex;

use super::paths;
use super::{ErrorKind, Result};

/// Closed set of source kinds the fetcher can dispatch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Catalog,
    GitHub,
    GitLab,
    GenericGit,
    Local,
}

/// Where a bundle comes from and how to address it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Clone url for git kinds, base url for catalog, path for local
    pub url: String,
    pub host: String,
    pub owner: String,
    /// Repository name for git kinds, version slug for catalog
    pub name: String,
    pub branch: String,
    /// Optional directory inside the repository, empty when unset
    pub subpath: String,
    pub kind: SourceKind,
}

fn uuid_like(s: &str) -> bool {
    let re = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .unwrap();
    re.is_match(s)
}

/// Classify a user supplied source string into a fetch plan
///
/// Precedence is fixed: empty source defaults to the authenticated
/// user's latest catalog bundle, then catalog host match, known git
/// forges, local paths, and finally any other http(s) url as a plain
/// git remote. Everything else is refused.
pub fn classify(src: &str, user: Option<&str>, default_branch: Option<&str>) -> Result<Repository> {
    let branch = default_branch.unwrap_or("main");
    let catalog_host = paths::catalog_host();

    if src.is_empty() {
        let uid = match user {
            Some(u) => u,
            None => bail!(ErrorKind::NoSourceAndUnauthenticated),
        };
        return Ok(Repository {
            url: format!("https://{}/{}/latest/", catalog_host, uid),
            host: catalog_host,
            owner: uid.into(),
            name: "latest".into(),
            branch: branch.into(),
            subpath: "".into(),
            kind: SourceKind::Catalog,
        });
    }

    if src.contains(&catalog_host) {
        return parse_catalog(src, &catalog_host);
    }
    if src.contains("github.com") {
        return parse_forge(src, "github.com", SourceKind::GitHub, branch);
    }
    if src.contains("gitlab.com") {
        return parse_forge(src, "gitlab.com", SourceKind::GitLab, branch);
    }
    if src.starts_with('/') || src.starts_with('.') || src.starts_with("file://") {
        let path = src.trim_start_matches("file://");
        return Ok(Repository {
            url: path.into(),
            host: "".into(),
            owner: "".into(),
            name: "".into(),
            branch: "".into(),
            subpath: "".into(),
            kind: SourceKind::Local,
        });
    }
    if src.starts_with("http://") || src.starts_with("https://") {
        let host = src
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or("")
            .to_string();
        let name = tail_name(src.trim_end_matches('/'));
        return Ok(Repository {
            url: src.into(),
            host,
            owner: "".into(),
            name,
            branch: branch.into(),
            subpath: "".into(),
            kind: SourceKind::GenericGit,
        });
    }
    bail!(ErrorKind::UnknownSourceType(src.into()))
}

fn tail_name(s: &str) -> String {
    s.rsplit('/')
        .next()
        .unwrap_or("")
        .trim_end_matches(".git")
        .to_string()
}

/// Catalog urls look like `https://<host>/<user-uuid>[/<version>[/...]]`
fn parse_catalog(src: &str, host: &str) -> Result<Repository> {
    let after = match src.find(host) {
        Some(idx) => &src[idx + host.len()..],
        None => bail!(ErrorKind::InvalidCatalogUrl(src.into())),
    };
    let mut segs = after.split('/').filter(|s| !s.is_empty());
    let owner = match segs.next() {
        Some(o) => o.to_string(),
        None => bail!(ErrorKind::InvalidCatalogUrl(src.into())),
    };
    if !uuid_like(&owner) {
        bail!(ErrorKind::InvalidCatalogUrl(src.into()));
    }
    let version = segs.next().unwrap_or("latest").to_string();
    Ok(Repository {
        url: format!("https://{}/{}/{}/", host, owner, version),
        host: host.into(),
        owner,
        name: version,
        branch: "".into(),
        subpath: "".into(),
        kind: SourceKind::Catalog,
    })
}

/// Forge urls may carry `/tree/<branch>/<subpath>` (github style) or
/// `/-/tree/<branch>/<subpath>` (gitlab style) after the repo name
fn parse_forge(src: &str, host: &str, kind: SourceKind, default_branch: &str) -> Result<Repository> {
    let after = match src.find(host) {
        Some(idx) => &src[idx + host.len()..],
        None => bail!(ErrorKind::UnknownSourceType(src.into())),
    };
    let segs: Vec<&str> = after.split('/').filter(|s| !s.is_empty()).collect();
    if segs.len() < 2 {
        bail!(ErrorKind::UnknownSourceType(src.into()));
    }
    let owner = segs[0].to_string();
    let name = segs[1].trim_end_matches(".git").to_string();

    // locate a tree marker beyond owner/name; gitlab inserts a `-`
    let mut branch = default_branch.to_string();
    let mut subpath = String::new();
    let rest = &segs[2..];
    let tree_at = rest.iter().position(|s| *s == "tree");
    if let Some(ti) = tree_at {
        let skipped_dash = ti == 1 && rest[0] == "-";
        if (ti == 0 || skipped_dash) && rest.len() > ti + 1 {
            branch = rest[ti + 1].to_string();
            subpath = rest[ti + 2..].join("/");
        }
    }
    Ok(Repository {
        url: format!("https://{}/{}/{}", host, owner, name),
        host: host.into(),
        owner,
        name,
        branch,
        subpath,
        kind,
    })
}
