use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::time::Duration;

use super::paths;
use super::{Error, ErrorKind, Result, ResultExt};

/// Response envelope every structured catalog endpoint uses
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Secret metadata as listed by the catalog
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SecretMeta {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: u32,
}

/// A full secret value from the catalog
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecretValue {
    pub name: String,
    pub value: String,
    pub version: u32,
}

#[derive(Deserialize, Debug)]
pub struct SetSecretResponse {
    pub name: String,
    pub version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct DeleteSecretResponse {
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
struct VersionList {
    versions: Vec<String>,
}

/// Token issued by `/auth/cli`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenGrant {
    pub token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub user_id: String,
    pub user_email: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "bearer".into()
}

/// Map a catalog error code onto the taxonomy
///
/// The registry is closed: new server codes must be added here or they
/// degrade to a generic catalog error.
fn map_error_code(code: &str, status: u16) -> Error {
    match code {
        "account_not_linked" => ErrorKind::AccountNotLinked.into(),
        "invalid_token" => ErrorKind::TokenRejected.into(),
        "tailscale_verification_failed" => ErrorKind::TokenRejected.into(),
        "secret_not_found" => ErrorKind::CatalogHttpError(status, "secret_not_found".into()).into(),
        "insufficient_permissions" => {
            ErrorKind::CatalogHttpError(status, "insufficient_permissions".into()).into()
        }
        other => ErrorKind::CatalogHttpError(status, format!("unknown error code {}", other)).into(),
    }
}

/// Blocking client for the hosted catalog
pub struct Catalog {
    client: reqwest::Client,
    base: reqwest::Url,
    token: Option<String>,
}

impl Catalog {
    /// Client against the configured catalog base (LEGER_API_URL aware)
    pub fn new(token: Option<String>) -> Result<Catalog> {
        Catalog::with_base(&paths::catalog_base(), token)
    }

    pub fn with_base(base: &str, token: Option<String>) -> Result<Catalog> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base = reqwest::Url::parse(base)?;
        Ok(Catalog { client, base, token })
    }

    fn get(&self, path: &str) -> Result<(u16, String)> {
        let url = self.base.join(path)?;
        debug!("GET {}", url);
        let mut req = self.client.get(url.clone());
        if let Some(ref t) = self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        let mut res = req.send().chain_err(|| format!("could not reach {}", url))?;
        let mut body = String::new();
        res.read_to_string(&mut body)?;
        Ok((res.status().as_u16(), body))
    }

    fn parse<T: DeserializeOwned>(&self, status: u16, body: String) -> Result<T> {
        if status == 401 {
            bail!(ErrorKind::TokenRejected);
        }
        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(e) => e,
            Err(_) if status >= 400 => bail!(ErrorKind::CatalogHttpError(status, body)),
            Err(e) => {
                return Err(e).chain_err(|| format!("unparseable catalog response ({})", status))
            }
        };
        if !envelope.success {
            let code = envelope.error.unwrap_or_else(|| "".into());
            if code.is_empty() {
                let msg = envelope.message.unwrap_or_else(|| body.clone());
                bail!(ErrorKind::CatalogHttpError(status, msg));
            }
            return Err(map_error_code(&code, status));
        }
        match envelope.data {
            Some(d) => Ok(d),
            None => bail!(ErrorKind::CatalogHttpError(status, "missing data field".into())),
        }
    }

    fn get_enveloped<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.get(path)?;
        self.parse(status, body)
    }

    fn post_enveloped<T: DeserializeOwned>(&self, path: &str, payload: serde_json::Value) -> Result<T> {
        let url = self.base.join(path)?;
        debug!("POST {}", url);
        let mut req = self.client.post(url.clone()).json(&payload);
        if let Some(ref t) = self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        let mut res = req.send().chain_err(|| format!("could not reach {}", url))?;
        let mut body = String::new();
        res.read_to_string(&mut body)?;
        self.parse(res.status().as_u16(), body)
    }

    /// Exchange identity claims for a bearer token
    pub fn login(&self, claims: serde_json::Value) -> Result<TokenGrant> {
        self.post_enveloped("auth/cli", claims)
    }

    /// List the authenticated user's secret metadata
    pub fn secrets_list(&self) -> Result<Vec<SecretMeta>> {
        self.get_enveloped("secrets/list")
    }

    /// Fetch one secret with its value
    pub fn secret_get(&self, name: &str) -> Result<SecretValue> {
        self.get_enveloped(&format!("secrets/get/{}", name))
    }

    /// Create or update a secret
    pub fn secret_set(&self, name: &str, value: &str) -> Result<SetSecretResponse> {
        self.post_enveloped("secrets/set", json!({ "name": name, "value": value }))
    }

    /// Delete a secret
    pub fn secret_delete(&self, name: &str) -> Result<DeleteSecretResponse> {
        let url = self.base.join(&format!("secrets/{}", name))?;
        debug!("DELETE {}", url);
        let mut req = self.client.delete(url.clone());
        if let Some(ref t) = self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        let mut res = req.send().chain_err(|| format!("could not reach {}", url))?;
        let mut body = String::new();
        res.read_to_string(&mut body)?;
        self.parse(res.status().as_u16(), body)
    }

    /// Published bundle versions for a user
    pub fn versions(&self, user: &str) -> Result<Vec<String>> {
        let vl: VersionList = self.get_enveloped(&format!("v1/users/{}/versions", user))?;
        Ok(vl.versions)
    }

    /// Resolve `latest` to the highest published semver slug
    pub fn resolve_version(&self, user: &str, slug: &str) -> Result<String> {
        if slug != "latest" {
            return Ok(slug.into());
        }
        let mut versions = self.versions(user)?;
        if versions.is_empty() {
            bail!(ErrorKind::ManifestNotFound(format!("no published versions for {}", user)));
        }
        versions.sort_by(|a, b| {
            use semver::Version;
            match (Version::parse(a), Version::parse(b)) {
                (Ok(va), Ok(vb)) => va.cmp(&vb),
                (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
                (Err(_), Ok(_)) => std::cmp::Ordering::Less,
                (Err(_), Err(_)) => a.cmp(b),
            }
        });
        Ok(versions.pop().unwrap())
    }

    /// Raw bundle file download, `/<user>/<version>/<file>`
    ///
    /// These endpoints serve plain file bodies without the envelope.
    pub fn bundle_file(&self, user: &str, version: &str, file: &str) -> Result<Vec<u8>> {
        let url = self.base.join(&format!("{}/{}/{}", user, version, file))?;
        debug!("GET {}", url);
        let mut res = self
            .client
            .get(url.clone())
            .send()
            .chain_err(|| format!("could not reach {}", url))?;
        if res.status().as_u16() == 404 {
            bail!(ErrorKind::ManifestNotFound(url.to_string()));
        }
        if !res.status().is_success() {
            let mut body = String::new();
            let _ = res.read_to_string(&mut body);
            bail!(ErrorKind::CatalogHttpError(res.status().as_u16(), body));
        }
        let mut buf = Vec::new();
        res.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Is the catalog alive?
    pub fn healthy(&self) -> bool {
        match self.get("health") {
            Ok((status, _)) => status == 200,
            Err(_) => false,
        }
    }

    /// Clone for use from worker threads
    pub fn try_clone(&self) -> Catalog {
        Catalog {
            client: self.client.clone(),
            base: self.base.clone(),
            token: self.token.clone(),
        }
    }
}
