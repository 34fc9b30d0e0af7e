use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::prelude::*;
use std::os::unix::fs::PermissionsExt;

use super::paths::Layout;
use super::{ErrorKind, Result};

/// Persisted identity for the catalog service
///
/// Stored as json at `<config>/leger/auth.json` with mode 0600. A
/// record is valid whenever the token is non-empty; the expiry hint is
/// advisory only because the server decides what it accepts, and a 401
/// from any endpoint clears the record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthRecord {
    pub token: String,
    pub token_type: String,
    pub user_id: String,
    pub user_email: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthRecord {
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty()
    }
}

/// Write the record at 0600 under the 0700 config dir
pub fn save(layout: &Layout, record: &AuthRecord) -> Result<()> {
    layout.ensure_config_dir()?;
    let pth = layout.auth_file();
    let encoded = serde_json::to_string_pretty(record)?;
    let mut f = File::create(&pth)?;
    write!(f, "{}\n", encoded)?;
    fs::set_permissions(&pth, fs::Permissions::from_mode(0o600))?;
    debug!("wrote auth record for {} to {}", record.user_id, pth.display());
    Ok(())
}

/// Load the stored record if one exists
pub fn load(layout: &Layout) -> Result<Option<AuthRecord>> {
    let pth = layout.auth_file();
    if !pth.is_file() {
        return Ok(None);
    }
    let mut data = String::new();
    File::open(&pth)?.read_to_string(&mut data)?;
    let record: AuthRecord = serde_json::from_str(&data)?;
    Ok(Some(record))
}

/// Load a valid record or fail with NotAuthenticated
pub fn require(layout: &Layout) -> Result<AuthRecord> {
    match load(layout)? {
        Some(ref r) if r.is_valid() => Ok(r.clone()),
        _ => bail!(ErrorKind::NotAuthenticated),
    }
}

/// Drop the stored record (logout, or after a 401)
pub fn clear(layout: &Layout) -> Result<()> {
    let pth = layout.auth_file();
    if pth.is_file() {
        fs::remove_file(&pth)?;
        info!("removed stored credentials");
    }
    Ok(())
}
