use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use super::Result;

/// Scope a supervisor or engine operation runs in
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scope {
    User,
    System,
}

/// Resolved per-user directory layout
///
/// Everything leger touches on disk hangs off these three roots.
/// They are resolved once per operation from the runtime user's home
/// directory and passed down by parameter so tests can substitute their
/// own scratch roots.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Config root, normally `~/.config/leger`
    pub config_dir: PathBuf,
    /// Data root, normally `~/.local/share/bluebuild-quadlets`
    pub data_dir: PathBuf,
    /// Engine unit drop-directory for the scope
    pub unit_dir: PathBuf,
}

impl Layout {
    /// Resolve the layout for the current user
    pub fn resolve(scope: Scope) -> Result<Layout> {
        let config = match dirs::config_dir() {
            Some(c) => c,
            None => bail!("cannot resolve a per-user config directory"),
        };
        let data = match dirs::data_local_dir() {
            Some(d) => d,
            None => bail!("cannot resolve a per-user data directory"),
        };
        let unit_dir = match scope {
            Scope::User => config.join("containers").join("systemd"),
            Scope::System => PathBuf::from("/etc/containers/systemd"),
        };
        Ok(Layout {
            config_dir: config.join("leger"),
            data_dir: data.join("bluebuild-quadlets"),
            unit_dir,
        })
    }

    /// Layout rooted somewhere else entirely (test scaffolding)
    pub fn rooted(root: &PathBuf) -> Layout {
        Layout {
            config_dir: root.join("config").join("leger"),
            data_dir: root.join("data").join("bluebuild-quadlets"),
            unit_dir: root.join("units"),
        }
    }

    pub fn staged_root(&self) -> PathBuf {
        self.data_dir.join("staged")
    }

    pub fn active_root(&self) -> PathBuf {
        self.data_dir.join("active")
    }

    pub fn backups_root(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn manifests_root(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.config_dir.join("auth.json")
    }

    /// Create the data tree with normal 0755 directories
    pub fn ensure_data_dirs(&self) -> Result<()> {
        for d in &[
            self.staged_root(),
            self.active_root(),
            self.backups_root(),
            self.manifests_root(),
        ] {
            fs::create_dir_all(d)?;
            fs::set_permissions(d, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    /// Create the config dir with 0700 (it holds auth.json)
    pub fn ensure_config_dir(&self) -> Result<()> {
        if !self.config_dir.is_dir() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.config_dir)?;
        }
        fs::set_permissions(&self.config_dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }
}

/// Default catalog base url, overridable with LEGER_API_URL
pub fn catalog_base() -> String {
    std::env::var("LEGER_API_URL").unwrap_or_else(|_| "https://api.leger.run".into())
}

/// Host part of the catalog base, used by the source classifier
pub fn catalog_host() -> String {
    let base = catalog_base();
    base.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or("api.leger.run")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::{catalog_host, Layout, Scope};
    use std::path::PathBuf;

    #[test]
    fn layout_roots() {
        let l = Layout::rooted(&PathBuf::from("/tmp/leger-test"));
        assert_eq!(l.staged_root(), PathBuf::from("/tmp/leger-test/data/bluebuild-quadlets/staged"));
        assert_eq!(l.auth_file(), PathBuf::from("/tmp/leger-test/config/leger/auth.json"));
    }

    #[test]
    fn resolve_user_scope() {
        let l = Layout::resolve(Scope::User).unwrap();
        assert!(l.unit_dir.ends_with("containers/systemd"));
        assert!(l.data_dir.ends_with("bluebuild-quadlets"));
    }

    #[test]
    fn default_catalog_host() {
        std::env::remove_var("LEGER_API_URL");
        assert_eq!(catalog_host(), "api.leger.run");
    }
}
