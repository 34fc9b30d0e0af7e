use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::channel;
use threadpool::ThreadPool;

use super::catalog::Catalog;
use super::source::{Repository, SourceKind};
use super::{ErrorKind, Result};

/// Fresh working directory for one fetch
fn workdir(tag: &str) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let dir = std::env::temp_dir().join(format!("leger-fetch-{}-{}-{}", tag, stamp, std::process::id()));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Materialize a repository into a local directory of bundle files
///
/// Local sources are returned as-is; git sources are shallow cloned;
/// catalog sources are downloaded file by file. The returned path is
/// the bundle root (the sub path for git sources that carry one).
pub fn fetch(repo: &Repository, token: Option<String>) -> Result<PathBuf> {
    match repo.kind {
        SourceKind::Local => {
            let pth = PathBuf::from(&repo.url);
            if !pth.is_dir() {
                bail!(ErrorKind::NoQuadletFiles(repo.url.clone()));
            }
            Ok(pth)
        }
        SourceKind::Catalog => {
            let catalog = Catalog::new(token)?;
            fetch_catalog(&catalog, repo)
        }
        SourceKind::GitHub | SourceKind::GitLab | SourceKind::GenericGit => fetch_git(repo),
    }
}

/// Shallow clone a git source, honouring branch pin and sub path
pub fn fetch_git(repo: &Repository) -> Result<PathBuf> {
    if which::which("git").is_err() {
        bail!("git executable not found!");
    }
    let dir = workdir(&repo.name)?;
    let mut args: Vec<String> = vec!["clone".into(), "--depth".into(), "1".into()];
    if !repo.branch.is_empty() {
        args.push("-b".into());
        args.push(repo.branch.clone());
    }
    args.push(repo.url.clone());
    args.push(dir.display().to_string());

    info!("git {}", args.join(" "));
    let s = Command::new("git").args(&args).output()?;
    if !s.status.success() {
        let err = String::from_utf8_lossy(&s.stderr);
        warn!("git clone stderr: {}", err.trim());
        let _ = fs::remove_dir_all(&dir);
        bail!(ErrorKind::CloneError(repo.url.clone(), repo.branch.clone()));
    }

    if repo.subpath.is_empty() {
        return Ok(dir);
    }
    let sub = dir.join(&repo.subpath);
    if !sub.is_dir() {
        let _ = fs::remove_dir_all(&dir);
        bail!(ErrorKind::SubPathMissing(repo.subpath.clone()));
    }
    Ok(sub)
}

fn safe_relative(name: &str) -> bool {
    !name.starts_with('/') && !name.split('/').any(|seg| seg == "..")
}

/// Download a catalog bundle: manifest first, then its files in parallel
pub fn fetch_catalog(catalog: &Catalog, repo: &Repository) -> Result<PathBuf> {
    let version = catalog.resolve_version(&repo.owner, &repo.name)?;
    let manifest_bytes = catalog.bundle_file(&repo.owner, &version, "manifest.json")?;
    let manifest: super::BundleManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| ErrorKind::ManifestInvalid(format!("catalog manifest: {}", e)))?;

    let mut files: Vec<String> = manifest
        .services
        .iter()
        .flat_map(|s| s.files.iter().cloned())
        .collect();
    files.sort();
    files.dedup();
    if files.is_empty() {
        bail!(ErrorKind::ManifestInvalid("catalog manifest lists no files".into()));
    }
    for f in &files {
        if !safe_relative(f) {
            bail!(ErrorKind::ManifestInvalid(format!("unsafe file path {}", f)));
        }
    }

    let dir = workdir(&repo.owner)?;
    match download_all(catalog, &repo.owner, &version, &files, &dir) {
        Ok(()) => {}
        Err(e) => {
            // never leave a half fetched bundle behind
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
    }
    let mut f = File::create(dir.join("manifest.json"))?;
    f.write_all(&manifest_bytes)?;
    Ok(dir)
}

/// Concurrent downloads through a small worker pool
fn download_all(
    catalog: &Catalog,
    owner: &str,
    version: &str,
    files: &[String],
    dir: &Path,
) -> Result<()> {
    let n_jobs = files.len();
    let pool = ThreadPool::new(n_jobs.min(4));
    debug!("downloading {} bundle files", n_jobs);

    let (tx, rx) = channel();
    for f in files {
        let tx = tx.clone();
        let cat = catalog.try_clone();
        let owner = owner.to_string();
        let version = version.to_string();
        let fname = f.clone();
        pool.execute(move || {
            let res = cat.bundle_file(&owner, &version, &fname).map(|b| (fname, b));
            tx.send(res).expect("channel will be there waiting for the pool");
        });
    }

    for r in rx.iter().take(n_jobs) {
        let (fname, bytes) = r?;
        let target = dir.join(&fname);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = File::create(&target)?;
        f.write_all(&bytes)?;
        debug!("wrote {}", target.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{fetch, fetch_catalog, fetch_git, safe_relative};
    use crate::catalog::Catalog;
    use crate::source::{classify, Repository, SourceKind};
    use mockito::{mock, server_url};
    use std::fs;
    use std::process::Command;

    #[test]
    fn local_fetch_is_a_passthrough() {
        let dir = std::env::temp_dir().join("leger-fetch-local");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let repo = classify(dir.to_str().unwrap(), None, None).unwrap();
        let got = fetch(&repo, None).unwrap();
        assert_eq!(got, dir);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_local_path_fails() {
        let repo = classify("/definitely/not/here", None, None).unwrap();
        assert!(fetch(&repo, None).is_err());
    }

    #[test]
    fn catalog_fetch_downloads_bundle() {
        const UID: &str = "7f2c9b1e-4a3d-4a0e-9f67-2b8d1c5e0a42";
        let manifest = r#"{"version": 1, "services": [{"name": "web", "type": "container", "files": ["web.container"]}]}"#;
        let _m1 = mock("GET", format!("/{}/1.0.0/manifest.json", UID).as_str())
            .with_status(200)
            .with_body(manifest)
            .create();
        let _m2 = mock("GET", format!("/{}/1.0.0/web.container", UID).as_str())
            .with_status(200)
            .with_body("[Container]\nImage=nginx\n")
            .create();

        let catalog = Catalog::with_base(&server_url(), None).unwrap();
        let repo = Repository {
            url: format!("{}/{}/1.0.0/", server_url(), UID),
            host: "127.0.0.1".into(),
            owner: UID.into(),
            name: "1.0.0".into(),
            branch: "".into(),
            subpath: "".into(),
            kind: SourceKind::Catalog,
        };
        let dir = fetch_catalog(&catalog, &repo).unwrap();
        assert!(dir.join("manifest.json").is_file());
        assert!(dir.join("web.container").is_file());
        let body = fs::read_to_string(dir.join("web.container")).unwrap();
        assert!(body.contains("Image=nginx"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn catalog_missing_manifest_cleans_up() {
        const UID: &str = "00000000-0000-4000-8000-000000000001";
        let _m = mock("GET", format!("/{}/2.0.0/manifest.json", UID).as_str())
            .with_status(404)
            .create();
        let catalog = Catalog::with_base(&server_url(), None).unwrap();
        let repo = Repository {
            url: "".into(),
            host: "".into(),
            owner: UID.into(),
            name: "2.0.0".into(),
            branch: "".into(),
            subpath: "".into(),
            kind: SourceKind::Catalog,
        };
        assert!(fetch_catalog(&catalog, &repo).is_err());
    }

    #[test]
    fn path_traversal_is_refused() {
        assert!(safe_relative("web.container"));
        assert!(safe_relative("sub/web.container"));
        assert!(!safe_relative("../escape"));
        assert!(!safe_relative("/etc/passwd"));
    }

    #[test]
    fn git_clone_and_subpath() {
        if which::which("git").is_err() {
            return; // no git on this machine
        }
        // build a tiny origin repository
        let origin = std::env::temp_dir().join("leger-fetch-origin");
        let _ = fs::remove_dir_all(&origin);
        fs::create_dir_all(origin.join("bundle")).unwrap();
        fs::write(origin.join("bundle").join("web.container"), "[Container]\nImage=x\n").unwrap();
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(&origin)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .output()
                .unwrap()
        };
        run(&["init"]);
        run(&["checkout", "-b", "main"]);
        run(&["add", "."]);
        run(&["commit", "-m", "seed"]);

        let repo = Repository {
            url: format!("file://{}", origin.display()),
            host: "".into(),
            owner: "".into(),
            name: "origin".into(),
            branch: "main".into(),
            subpath: "bundle".into(),
            kind: SourceKind::GenericGit,
        };
        let dir = fetch_git(&repo).unwrap();
        assert!(dir.join("web.container").is_file());
        assert!(dir.ends_with("bundle"));

        // bad subpath rejects and cleans up
        let mut bad = repo.clone();
        bad.subpath = "nope".into();
        assert!(fetch_git(&bad).is_err());

        let _ = fs::remove_dir_all(&origin);
        let _ = fs::remove_dir_all(dir.parent().unwrap());
    }
}
