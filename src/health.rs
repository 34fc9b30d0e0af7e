use std::io::Read;
use std::time::{Duration, Instant};

use super::quadlet::UnitFile;
use super::Result;

/// Probe configuration parsed from a container unit's labels
///
/// The convention: `Label=x-health-url=...` plus optional
/// `x-health-timeout` (duration string) and `x-health-expected`
/// (http status, 200 when unset). No url, no probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSpec {
    pub url: String,
    pub timeout: Duration,
    pub expected: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Outcome of one probe
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProbeResult {
    pub state: HealthState,
    pub code: Option<u16>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse `5s` / `1m` / `1500ms` style duration strings
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(num) = s.strip_suffix("ms") {
        return num.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(num) = s.strip_suffix('s') {
        return num.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(num) = s.strip_suffix('m') {
        return num.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    None
}

/// Extract the probe spec from a container unit, if one is labelled
pub fn from_unit(unit: &UnitFile) -> Option<HealthSpec> {
    let mut url = None;
    let mut timeout = DEFAULT_TIMEOUT;
    let mut expected = 200u16;
    for label in unit.values("Container", "Label") {
        let (k, v) = match label.find('=') {
            Some(eq) => (&label[..eq], &label[eq + 1..]),
            None => continue,
        };
        match k {
            "x-health-url" => url = Some(v.to_string()),
            "x-health-timeout" => {
                if let Some(d) = parse_duration(v) {
                    timeout = d;
                } else {
                    warn!("unparseable health timeout '{}' in {}", v, unit.name);
                }
            }
            "x-health-expected" => {
                if let Ok(code) = v.parse::<u16>() {
                    expected = code;
                } else {
                    warn!("unparseable health status '{}' in {}", v, unit.name);
                }
            }
            _ => {}
        }
    }
    url.map(|url| HealthSpec { url, timeout, expected })
}

/// Issue the GET and classify the response
pub fn probe(spec: &HealthSpec) -> Result<ProbeResult> {
    let client = reqwest::Client::builder().timeout(spec.timeout).build()?;
    let start = Instant::now();
    let res = client.get(spec.url.as_str()).send();
    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_secs() * 1000 + u64::from(elapsed.subsec_millis());

    match res {
        Ok(mut r) => {
            // drain the body so keepalive pools stay clean
            let mut sink = String::new();
            let _ = r.read_to_string(&mut sink);
            let code = r.status().as_u16();
            let state = if code == spec.expected {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            };
            Ok(ProbeResult { state, code: Some(code), elapsed_ms, error: None })
        }
        Err(e) => Ok(ProbeResult {
            state: HealthState::Unknown,
            code: None,
            elapsed_ms,
            error: Some(format!("{}", e)),
        }),
    }
}
