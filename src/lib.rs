#![recursion_limit = "1024"]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_yaml;
#[macro_use]
extern crate serde_json;

extern crate reqwest;
extern crate openssl_probe;

extern crate chrono;
extern crate walkdir;
extern crate regex;
extern crate semver;
extern crate threadpool;
extern crate base64;
extern crate crc32fast;
extern crate dirs;
extern crate petgraph;
extern crate which;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Reqw(reqwest::UrlError);
        Reqe(reqwest::Error);
        Time(::std::time::SystemTimeError);
        Chrono(chrono::ParseError);
    }
    errors {
        // user input
        UnknownSourceType(src: String) {
            description("source could not be classified")
            display("cannot determine the source type of '{}'", &src)
        }
        InvalidCatalogUrl(url: String) {
            description("catalog url malformed")
            display("'{}' is not a valid catalog url", &url)
        }
        NoSourceAndUnauthenticated {
            description("no source given and not logged in")
            display("no source given and no authenticated user to default to")
        }
        SubPathMissing(path: String) {
            description("sub path missing in repository")
            display("repository does not contain the sub path '{}'", &path)
        }
        ManifestNotFound(url: String) {
            description("bundle manifest not found")
            display("no manifest found at '{}'", &url)
        }
        ManifestInvalid(reason: String) {
            description("bundle manifest invalid")
            display("invalid manifest: {}", &reason)
        }
        NoQuadletFiles(dir: String) {
            description("no quadlet files in bundle")
            display("no quadlet files found under '{}'", &dir)
        }
        // validation
        UnitSyntaxError(path: String, line: usize) {
            description("unit file failed to parse")
            display("parse error in {} at line {}", &path, line)
        }
        ValidationFailed(name: String) {
            description("bundle failed validation")
            display("bundle '{}' failed validation", &name)
        }
        // external
        CloneError(url: String, branch: String) {
            description("git clone failed")
            display("failed to clone '{}' (branch {})", &url, &branch)
        }
        CatalogHttpError(status: u16, body: String) {
            description("catalog returned an http error")
            display("catalog returned {}: {}", status, &body)
        }
        DaemonUnavailable {
            description("secret daemon unreachable")
            display("secret daemon is not reachable on localhost")
        }
        SupervisorError(action: String, service: String) {
            description("systemctl action failed")
            display("systemctl {} failed for {}", &action, &service)
        }
        EngineError(action: String) {
            description("engine action failed")
            display("podman {} failed", &action)
        }
        VolumeError(op: String, name: String) {
            description("volume operation failed")
            display("volume {} failed for '{}'", &op, &name)
        }
        // auth
        NotAuthenticated {
            description("not logged in")
            display("not authenticated - run `leger login` first")
        }
        TokenRejected {
            description("token rejected by catalog")
            display("stored token was rejected - run `leger login` again")
        }
        AccountNotLinked {
            description("account not linked")
            display("account is not linked to the catalog service")
        }
        // lifecycle
        AlreadyDeployed(name: String) {
            description("deployment already active")
            display("'{}' is already deployed - use stage/apply to update", &name)
        }
        NotDeployed(name: String) {
            description("deployment not active")
            display("'{}' is not deployed", &name)
        }
        StagedUpdatesMissing(name: String) {
            description("nothing staged")
            display("no staged update for '{}'", &name)
        }
        BackupNotFound(id: String) {
            description("backup not found")
            display("backup '{}' does not exist", &id)
        }
        RolledBack(original: String) {
            description("operation failed and was rolled back")
            display("rolled back: {}", &original)
        }
        FatalRollbackFailed(restore: String, original: String) {
            description("rollback after failure also failed")
            display("FATAL: rollback failed ({}) after error ({}) - \
                     restore manually from the safety backup under the backups directory",
                    &restore, &original)
        }
    }
}

/// Per-user config and data path resolution
pub mod paths;
/// Quadlet unit file parser and directive extractors
pub mod quadlet;
/// Source string classification into fetchable repositories
pub mod source;
/// Materializing repositories into working directories
pub mod fetch;
/// Bundle manifest loading and synthesis
pub mod manifest;
/// Bundle validation (syntax, conflicts, dependency analysis)
pub mod validate;
/// Dependency graph construction and cycle extraction using `petgraph`
pub mod graph;
/// Staged/active/backup tree bookkeeping
pub mod staging;
/// Staged-vs-active tree comparison
pub mod diff;
/// Deployment lifecycle orchestration
pub mod deploy;
/// Unit file and volume snapshots
pub mod backup;
/// A small CLI systemctl interface
pub mod systemctl;
/// A small CLI podman interface (volumes + quadlet install)
pub mod podman;
/// A REST interface to the hosted catalog using `reqwest`
pub mod catalog;
/// A REST interface to the local secret daemon
pub mod secretd;
/// Secret reconciliation between catalog and daemon
pub mod secrets;
/// Label driven http health probes
pub mod health;
/// Per deployment service/health reporting
pub mod status;
/// Bearer token persistence
pub mod auth;
/// Convenience listers
pub mod list;

pub use crate::manifest::{Bundle, BundleManifest, ServiceDefinition};
pub use crate::quadlet::{UnitFile, UnitKind};
pub use crate::source::Repository;

/// Initialiser for anything that needs to run before https clients exist
pub fn init() -> Result<()> {
    openssl_probe::init_ssl_cert_env_vars();
    Ok(())
}
