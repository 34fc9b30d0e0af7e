use std::io::Read;
use std::time::Duration;

use super::{ErrorKind, Result, ResultExt};

/// Default listen address of the local secret daemon
pub const DEFAULT_DAEMON_ADDR: &str = "http://127.0.0.1:7378";

/// A secret as stored by the daemon
///
/// Values travel base64 encoded; the daemon stores opaque bytes and an
/// active version per name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LocalSecret {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub value: Option<String>,
}

/// Blocking client for the local secret daemon
pub struct Daemon {
    client: reqwest::Client,
    ping: reqwest::Client,
    base: reqwest::Url,
}

impl Daemon {
    pub fn new(base: &str) -> Result<Daemon> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        // health pings get a much tighter budget
        let ping = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let base = reqwest::Url::parse(base)?;
        Ok(Daemon { client, ping, base })
    }

    pub fn local() -> Result<Daemon> {
        Daemon::new(DEFAULT_DAEMON_ADDR)
    }

    /// Quick liveness probe, 5s budget
    pub fn health(&self) -> Result<()> {
        let url = self.base.join("health")?;
        debug!("GET {}", url);
        match self.ping.get(url).send() {
            Ok(res) if res.status().is_success() => Ok(()),
            Ok(res) => {
                warn!("secret daemon health returned {}", res.status());
                bail!(ErrorKind::DaemonUnavailable)
            }
            Err(e) => {
                debug!("secret daemon ping failed: {}", e);
                bail!(ErrorKind::DaemonUnavailable)
            }
        }
    }

    /// Fetch a secret record; Ok(None) when the name is unknown
    pub fn get(&self, name: &str) -> Result<Option<LocalSecret>> {
        let url = self.base.join(&format!("v1/secret/{}", name))?;
        debug!("GET {}", url);
        let mut res = self
            .client
            .get(url.clone())
            .send()
            .chain_err(|| format!("could not reach {}", url))?;
        if res.status().as_u16() == 404 {
            return Ok(None);
        }
        if !res.status().is_success() {
            bail!(ErrorKind::DaemonUnavailable);
        }
        let mut body = String::new();
        res.read_to_string(&mut body)?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// Active version of a local secret, if it exists
    pub fn active_version(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.get(name)?.map(|s| s.version))
    }

    /// Store value bytes under a name, recording the given version
    pub fn put(&self, name: &str, value: &[u8], version: u32) -> Result<()> {
        let url = self.base.join(&format!("v1/secret/{}", name))?;
        debug!("PUT {}", url);
        let payload = json!({
            "value": base64::encode(value),
            "version": version,
        });
        let res = self
            .client
            .put(url.clone())
            .json(&payload)
            .send()
            .chain_err(|| format!("could not reach {}", url))?;
        if !res.status().is_success() {
            warn!("secret daemon put {} returned {}", name, res.status());
            bail!(ErrorKind::DaemonUnavailable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Daemon;
    use crate::ErrorKind;
    use mockito::{mock, server_url};

    #[test]
    fn health_ok_and_down() {
        let _m = mock("GET", "/health").with_status(200).create();
        let d = Daemon::new(&server_url()).unwrap();
        assert!(d.health().is_ok());

        let dead = Daemon::new("http://127.0.0.1:1").unwrap();
        let err = dead.health().unwrap_err();
        match err.kind() {
            ErrorKind::DaemonUnavailable => {}
            e => panic!("wrong error: {}", e),
        }
    }

    #[test]
    fn get_known_and_unknown() {
        let _m = mock("GET", "/v1/secret/catalog/u1/k1")
            .with_status(200)
            .with_body(r#"{"name": "catalog/u1/k1", "version": 3}"#)
            .create();
        let _m2 = mock("GET", "/v1/secret/catalog/u1/nope").with_status(404).create();
        let d = Daemon::new(&server_url()).unwrap();
        assert_eq!(d.active_version("catalog/u1/k1").unwrap(), Some(3));
        assert_eq!(d.active_version("catalog/u1/nope").unwrap(), None);
    }

    #[test]
    fn put_roundtrip() {
        let _m = mock("PUT", "/v1/secret/catalog/u1/k1").with_status(200).create();
        let d = Daemon::new(&server_url()).unwrap();
        assert!(d.put("catalog/u1/k1", b"hunter2", 4).is_ok());
    }
}
