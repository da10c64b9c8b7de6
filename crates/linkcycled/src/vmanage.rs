//! vManage telemetry client.
//!
//! Logs in with the form-based `j_security_check` flow (session cookie kept
//! in the client's cookie store), fetches the XSRF token, discovers the WAN
//! edge devices of every configured site, and reads per-device BFD session
//! state for the site's transport color.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use linkcycle_common::{MonitorError, SdwanCredentials, SiteId};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::telemetry::TelemetryClient;

/// Device personalities that are controllers, never site edges
const CONTROLLER_PERSONALITIES: &[&str] = &["vmanage", "vbond", "vsmart"];

const SESSION_COOKIE: &str = "JSESSIONID";
const XSRF_HEADER: &str = "X-XSRF-TOKEN";

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Entry of `/dataservice/device`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "site-id", default)]
    pub site_id: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub reachability: String,
    #[serde(rename = "system-ip", default)]
    pub system_ip: String,
}

/// Entry of `/dataservice/device/bfd/state/device`
#[derive(Debug, Clone, Deserialize)]
pub struct BfdSession {
    #[serde(rename = "local-color", default)]
    pub local_color: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Default)]
struct Session {
    xsrf_token: Option<String>,
    devices: HashMap<SiteId, Vec<String>>,
}

pub struct VManageClient {
    http: reqwest::Client,
    credentials: SdwanCredentials,
    sites: HashSet<SiteId>,
    session: RwLock<Session>,
    /// Bumped on every successful login
    generation: AtomicU64,
    relogin: Mutex<()>,
}

impl VManageClient {
    /// Build a client for the configured sites. No network traffic yet.
    pub fn new(
        credentials: SdwanCredentials,
        sites: impl IntoIterator<Item = SiteId>,
        request_timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(request_timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(concat!("linkcycled/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build vManage HTTP client")?;

        Ok(Self {
            http,
            credentials,
            sites: sites.into_iter().collect(),
            session: RwLock::new(Session::default()),
            generation: AtomicU64::new(0),
            relogin: Mutex::new(()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.url, path)
    }

    /// Authenticate and fetch the XSRF token
    pub async fn login(&self) -> Result<()> {
        info!("Attempting to authenticate to: {}", self.credentials.url);

        let response = self
            .http
            .post(self.url("/j_security_check"))
            .form(&[
                ("j_username", self.credentials.username.as_str()),
                ("j_password", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach vManage")?;

        let status = response.status();
        if status != StatusCode::OK {
            bail!("Failed to authenticate. Status code: {}", status);
        }
        if !response.cookies().any(|c| c.name() == SESSION_COOKIE) {
            bail!("Authentication rejected: no {} cookie returned", SESSION_COOKIE);
        }

        let token = match self.http.get(self.url("/dataservice/client/token")).send().await {
            Ok(r) if r.status().is_success() => match r.text().await {
                Ok(text) => {
                    let text = text.trim();
                    if text.is_empty() || text.starts_with('<') {
                        None
                    } else {
                        Some(text.to_string())
                    }
                }
                Err(e) => {
                    debug!("Failed to read XSRF token body: {}", e);
                    None
                }
            },
            Ok(r) => {
                debug!("XSRF token endpoint returned {}", r.status());
                None
            }
            Err(e) => {
                warn!("Failed to fetch XSRF token: {}", e);
                None
            }
        };

        self.session.write().await.xsrf_token = token;
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!("Got authentication token!");
        Ok(())
    }

    /// Reload the edge device inventory for the configured sites.
    ///
    /// Returns the number of devices now monitored.
    pub async fn refresh_inventory(&self) -> Result<usize> {
        info!("Collecting device info...");
        let envelope: DataEnvelope<DeviceRecord> = self.get_json("/dataservice/device").await?;
        let devices = group_devices(&envelope.data, &self.sites);
        let count = devices.values().map(Vec::len).sum();

        for site_id in &self.sites {
            if !devices.contains_key(site_id) {
                warn!(site_id = %site_id, "No reachable edge devices found for site");
            }
        }

        self.session.write().await.devices = devices;
        info!("Done! {} edge device(s) across {} site(s)", count, self.sites.len());
        Ok(count)
    }

    /// System IPs currently known for a site
    pub async fn devices(&self, site_id: SiteId) -> Vec<String> {
        self.session
            .read()
            .await
            .devices
            .get(&site_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn bfd_sessions(&self, system_ip: &str, color: &str) -> Result<Vec<BfdSession>> {
        let path = format!(
            "/dataservice/device/bfd/state/device?deviceId={}&local-color={}",
            system_ip, color
        );
        let envelope: DataEnvelope<BfdSession> = self
            .get_json(&path)
            .await
            .with_context(|| format!("Failed to query BFD state for {} / {}", system_ip, color))?;
        Ok(envelope.data)
    }

    /// GET a dataservice path, logging in again once if the session expired
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let generation = self.generation.load(Ordering::Acquire);
        let response = self.send(Method::GET, path).await?;
        let response = if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("Session rejected ({}), logging in again", response.status());
            self.relogin(generation).await?;
            self.send(Method::GET, path).await?
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            bail!("{} returned status {}", path, status);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("Unexpected response from {}: {}", path, e))
    }

    /// Log in again unless a concurrent request already did so after
    /// `seen` was read
    async fn relogin(&self, seen: u64) -> Result<()> {
        let _guard = self.relogin.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            debug!("Session already renewed");
            return Ok(());
        }
        self.login().await
    }

    async fn send(&self, method: Method, path: &str) -> Result<reqwest::Response> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(token) = &self.session.read().await.xsrf_token {
            request = request.header(XSRF_HEADER, token);
        }
        request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))
    }
}

#[async_trait]
impl TelemetryClient for VManageClient {
    async fn get_link_health(
        &self,
        site_id: SiteId,
        transport_color: &str,
    ) -> Result<bool, MonitorError> {
        let mut devices = self.devices(site_id).await;
        if devices.is_empty() {
            debug!(site_id = %site_id, "No known devices, refreshing inventory");
            self.refresh_inventory()
                .await
                .map_err(|e| MonitorError::telemetry(site_id, format!("{:#}", e)))?;
            devices = self.devices(site_id).await;
        }
        if devices.is_empty() {
            return Err(MonitorError::telemetry(
                site_id,
                "no reachable edge devices at site",
            ));
        }

        // All edges at once: one hung device must not starve its peers
        let queries = devices.iter().map(|device| {
            debug!(site_id = %site_id, "Checking device {} at site ID {}", device, site_id);
            self.bfd_sessions(device, transport_color)
        });
        let results = join_all(queries).await;

        link_health(transport_color, results)
            .map_err(|reason| MonitorError::telemetry(site_id, reason))
    }
}

/// Group reachable edge devices by configured site
pub fn group_devices(
    records: &[DeviceRecord],
    sites: &HashSet<SiteId>,
) -> HashMap<SiteId, Vec<String>> {
    let mut devices: HashMap<SiteId, Vec<String>> = HashMap::new();

    for record in records {
        if CONTROLLER_PERSONALITIES.contains(&record.personality.as_str()) {
            debug!("Skipping controller: {}", record.personality);
            continue;
        }
        let site_id = match record.site_id.parse::<SiteId>() {
            Ok(id) => id,
            Err(_) => {
                debug!("Skipping device with unparsable site id {:?}", record.site_id);
                continue;
            }
        };
        if !sites.contains(&site_id) {
            debug!("Skip device with Site ID: {}", site_id);
            continue;
        }
        if record.reachability != "reachable" {
            debug!("Skipping unreachable device: {}", record.system_ip);
            continue;
        }
        debug!("Adding device: {}", record.system_ip);
        devices
            .entry(site_id)
            .or_default()
            .push(record.system_ip.clone());
    }

    devices
}

/// Combine per-device BFD answers into one link verdict.
///
/// Any session up on the color means healthy. Without an up session, a
/// failed device query makes the verdict unknown; otherwise the link is down.
pub fn link_health(
    color: &str,
    results: Vec<Result<Vec<BfdSession>>>,
) -> std::result::Result<bool, String> {
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(sessions) => {
                let up = sessions
                    .iter()
                    .filter(|s| s.local_color == color)
                    .any(|s| s.state.eq_ignore_ascii_case("up"));
                if up {
                    return Ok(true);
                }
            }
            Err(e) => errors.push(format!("{:#}", e)),
        }
    }

    if errors.is_empty() {
        Ok(false)
    } else {
        Err(errors.join("; "))
    }
}
