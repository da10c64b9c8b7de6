//! Eaton UPS / ePDU remediation client (Network-M2 `mbdetnrs` REST API).
//!
//! A power-cycle is built from three primitives: read outlet state, switch
//! off, switch on. The outlet is switched off only if it is on, then
//! re-enabled and verified for a bounded number of rounds, so calling the
//! cycle again after a failure never leaves the outlet off.
//!
//! Each cycle runs in its own task. A caller that stops waiting (timeout,
//! shutdown) does not abort it between `switchOff` and `switchOn`, and a
//! second cycle for the same outlet is refused while the first is running.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use linkcycle_common::{MonitorError, UpsCredentials, UpsSettings, UPS_REQUEST_TIMEOUT_SECS};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::remediation::RemediationClient;

const API_ROOT: &str = "/rest/mbdetnrs/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    fn action(&self) -> &'static str {
        match self {
            Switch::On => "switchOn",
            Switch::Off => "switchOff",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct OutletResponse {
    status: OutletStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutletStatus {
    switched_on: bool,
}

type OutletKey = (String, u32);

#[derive(Clone)]
pub struct EatonClient {
    http: reqwest::Client,
    credentials: UpsCredentials,
    settings: UpsSettings,
    /// Outlets with a cycle task still running
    cycling: Arc<Mutex<HashSet<OutletKey>>>,
}

/// Marks an outlet busy until the cycle task ends, however it ends
struct CycleGuard {
    cycling: Arc<Mutex<HashSet<OutletKey>>>,
    key: OutletKey,
}

impl CycleGuard {
    fn acquire(cycling: &Arc<Mutex<HashSet<OutletKey>>>, key: OutletKey) -> Option<Self> {
        let mut busy = cycling.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(key.clone()) {
            return None;
        }
        Some(Self {
            cycling: Arc::clone(cycling),
            key,
        })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut busy = self.cycling.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.key);
    }
}

impl EatonClient {
    pub fn new(
        credentials: UpsCredentials,
        settings: UpsSettings,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPS_REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(concat!("linkcycled/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build UPS HTTP client")?;

        Ok(Self {
            http,
            credentials,
            settings,
            cycling: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Whether a cycle for this outlet is still running
    pub fn is_cycling(&self, ups_address: &str, outlet: u32) -> bool {
        self.cycling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(ups_address.to_string(), outlet))
    }

    /// Authenticate to a UPS card and return a bearer token
    pub async fn authenticate(&self, ups_address: &str) -> Result<String> {
        info!("Connecting to UPS at: {}", ups_address);
        let url = format!("{}{}/oauth2/token", base_url(ups_address), API_ROOT);
        let body = json!({
            "username": self.credentials.username,
            "password": self.credentials.password,
            "grant_type": "password",
            "scope": "GUIAccess",
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to UPS {}", ups_address))?;
        if !response.status().is_success() {
            bail!(
                "Failed to authenticate to UPS {} (status {})",
                ups_address,
                response.status()
            );
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Unexpected token response from {}: {}", ups_address, e))?;
        info!("Got Auth token!");
        Ok(token.access_token)
    }

    /// Whether the outlet currently supplies power
    pub async fn outlet_switched_on(
        &self,
        ups_address: &str,
        token: &str,
        outlet: u32,
    ) -> Result<bool> {
        info!("Checking status of outlet {} on UPS at {}", outlet, ups_address);
        let url = format!("{}{}", base_url(ups_address), outlet_path(outlet));
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to get outlet status")?;
        if !response.status().is_success() {
            bail!("Failed to get outlet status (status {})", response.status());
        }

        let outlet_state: OutletResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Unexpected outlet status response: {}", e))?;
        let on = outlet_state.status.switched_on;
        info!("Outlet is currently {}", if on { "ON" } else { "OFF" });
        Ok(on)
    }

    /// Switch the outlet on or off
    pub async fn switch_outlet(
        &self,
        ups_address: &str,
        token: &str,
        outlet: u32,
        switch: Switch,
    ) -> Result<()> {
        info!("Attempting to switch outlet {} to state: {:?}", outlet, switch);
        let url = format!(
            "{}{}/actions/{}",
            base_url(ups_address),
            outlet_path(outlet),
            switch.action()
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to modify outlet state")?;
        if !response.status().is_success() {
            bail!("Failed to modify outlet state (status {})", response.status());
        }
        info!("Action successful!");
        Ok(())
    }

    async fn power_cycle(&self, ups_address: &str, outlet: u32) -> Result<()> {
        info!(
            "Beginning power cycle operation for outlet {} on UPS {}",
            outlet, ups_address
        );
        let token = self.authenticate(ups_address).await?;

        if self.outlet_switched_on(ups_address, &token, outlet).await? {
            self.switch_outlet(ups_address, &token, outlet, Switch::Off).await?;
        } else {
            warn!("Outlet {} already off, only switching it back on", outlet);
        }

        for attempt in 1..=self.settings.max_attempts {
            info!(
                "Waiting {:?} (attempt {}/{})",
                self.settings.off_wait(),
                attempt,
                self.settings.max_attempts
            );
            sleep(self.settings.off_wait()).await;

            match self.outlet_switched_on(ups_address, &token, outlet).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            }

            if let Err(e) = self
                .switch_outlet(ups_address, &token, outlet, Switch::On)
                .await
            {
                warn!("{:#}", e);
                continue;
            }
            sleep(self.settings.settle_wait()).await;

            match self.outlet_switched_on(ups_address, &token, outlet).await {
                Ok(true) => return Ok(()),
                Ok(false) => warn!("Outlet {} not on yet", outlet),
                Err(e) => warn!("{:#}", e),
            }
        }

        error!("Not able to complete operation.");
        bail!(
            "outlet did not report on after {} attempt(s)",
            self.settings.max_attempts
        )
    }
}

#[async_trait]
impl RemediationClient for EatonClient {
    async fn cycle_outlet(&self, ups_address: &str, outlet_id: u32) -> Result<(), MonitorError> {
        let key = (ups_address.to_string(), outlet_id);
        let guard = match CycleGuard::acquire(&self.cycling, key) {
            Some(guard) => guard,
            None => {
                warn!(
                    "Power cycle for outlet {} on UPS {} still in progress",
                    outlet_id, ups_address
                );
                return Err(MonitorError::remediation(
                    ups_address,
                    outlet_id,
                    "previous power cycle still in progress",
                ));
            }
        };

        let client = self.clone();
        let address = ups_address.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            client.power_cycle(&address, outlet_id).await
        });

        match task.await {
            Ok(result) => result.map_err(|e| {
                MonitorError::remediation(ups_address, outlet_id, format!("{:#}", e))
            }),
            Err(e) => Err(MonitorError::remediation(
                ups_address,
                outlet_id,
                format!("power cycle task failed: {}", e),
            )),
        }
    }
}

/// `https://` unless the configured address already names a scheme
fn base_url(ups_address: &str) -> String {
    let address = ups_address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
}

fn outlet_path(outlet: u32) -> String {
    format!("{}/powerDistributions/1/outlets/{}", API_ROOT, outlet)
}
