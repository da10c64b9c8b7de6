//! Configuration for the link monitor.
//!
//! Loaded once from YAML before monitoring starts. The file keeps the
//! original `trigger` / `sites` schema:
//!
//! ```yaml
//! trigger:
//!   interval: 60
//!   count: 5
//! sites:
//!   100:
//!     color: biz-internet
//!     ups: 10.1.1.50
//!     outlet: 1
//! ```
//!
//! Anything that fails validation is a `ConfigurationInvalid` error and the
//! daemon must not start.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::MonitorError;
use crate::types::SiteId;

/// Default config file path (relative to the working directory)
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// Upper bound for a single telemetry request when not configured
const DEFAULT_TELEMETRY_TIMEOUT_SECS: u64 = 5;

/// Per-request HTTP timeout of the UPS client
pub const UPS_REQUEST_TIMEOUT_SECS: u64 = 5;

/// One monitored site: which transport to watch and which outlet feeds its modem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub site_id: SiteId,
    pub transport_color: String,
    pub ups_address: String,
    pub outlet_id: u32,
}

/// Global trigger policy applied to every site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub poll_interval: Duration,
    pub failure_threshold: u32,
    /// Bound on one telemetry query, strictly shorter than the interval
    pub telemetry_timeout: Duration,
    /// Bound on one power-cycle operation, strictly shorter than the interval
    pub remediation_timeout: Duration,
}

impl TriggerPolicy {
    /// Build a policy with default timeouts derived from the interval
    pub fn new(poll_interval: Duration, failure_threshold: u32) -> Result<Self, MonitorError> {
        let remediation_timeout = poll_interval * 9 / 10;
        let telemetry_timeout =
            Duration::from_secs(DEFAULT_TELEMETRY_TIMEOUT_SECS).min(remediation_timeout);
        let policy = Self {
            poll_interval,
            failure_threshold,
            telemetry_timeout,
            remediation_timeout,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_timeouts(
        mut self,
        telemetry_timeout: Duration,
        remediation_timeout: Duration,
    ) -> Result<Self, MonitorError> {
        self.telemetry_timeout = telemetry_timeout;
        self.remediation_timeout = remediation_timeout;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.poll_interval.is_zero() {
            return Err(MonitorError::config("trigger.interval must be greater than 0"));
        }
        if self.failure_threshold == 0 {
            return Err(MonitorError::config("trigger.count must be at least 1"));
        }
        if self.telemetry_timeout.is_zero() || self.telemetry_timeout >= self.poll_interval {
            return Err(MonitorError::config(format!(
                "telemetry timeout ({:?}) must be non-zero and shorter than the poll interval ({:?})",
                self.telemetry_timeout, self.poll_interval
            )));
        }
        if self.remediation_timeout.is_zero() || self.remediation_timeout >= self.poll_interval {
            return Err(MonitorError::config(format!(
                "remediation timeout ({:?}) must be non-zero and shorter than the poll interval ({:?})",
                self.remediation_timeout, self.poll_interval
            )));
        }
        Ok(())
    }
}

/// Timing of the UPS outlet power-cycle sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsSettings {
    /// Seconds to wait with the outlet off before switching it back on
    #[serde(default = "default_off_wait")]
    pub off_wait: u64,

    /// Seconds to wait after switching on before verifying outlet state
    #[serde(default = "default_settle_wait")]
    pub settle_wait: u64,

    /// Verification rounds before the cycle is reported as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_off_wait() -> u64 {
    5
}

fn default_settle_wait() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for UpsSettings {
    fn default() -> Self {
        Self {
            off_wait: default_off_wait(),
            settle_wait: default_settle_wait(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl UpsSettings {
    pub fn off_wait(&self) -> Duration {
        Duration::from_secs(self.off_wait)
    }

    pub fn settle_wait(&self) -> Duration {
        Duration::from_secs(self.settle_wait)
    }

    /// Shortest time a power-cycle can take: both waits plus one UPS request
    pub fn min_cycle_time(&self) -> Duration {
        self.off_wait() + self.settle_wait() + Duration::from_secs(UPS_REQUEST_TIMEOUT_SECS)
    }
}

/// Validated monitor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub policy: TriggerPolicy,
    pub sites: Vec<SiteConfig>,
    pub ups: UpsSettings,
    /// Verify TLS certificates of the controller and UPS cards
    pub verify_tls: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    trigger: RawTrigger,
    #[serde(deserialize_with = "deserialize_sites")]
    sites: Vec<(SiteId, RawSite)>,
    #[serde(default)]
    ups: UpsSettings,
    #[serde(default)]
    verify_tls: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTrigger {
    interval: u64,
    count: u32,
    #[serde(default)]
    telemetry_timeout: Option<u64>,
    #[serde(default)]
    remediation_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSite {
    color: String,
    ups: String,
    outlet: u32,
}

/// Keep every `sites` entry in file order so duplicate ids can be reported
/// instead of silently overwritten.
fn deserialize_sites<'de, D>(deserializer: D) -> Result<Vec<(SiteId, RawSite)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct SitesVisitor;

    impl<'de> Visitor<'de> for SitesVisitor {
        type Value = Vec<(SiteId, RawSite)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of numeric site id to {color, ups, outlet}")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut sites = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<SiteId, RawSite>()? {
                sites.push(entry);
            }
            Ok(sites)
        }
    }

    deserializer.deserialize_map(SitesVisitor)
}

impl MonitorConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        info!("Loading config file {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            MonitorError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        info!("Config loaded: {} site(s)", config.sites.len());
        Ok(config)
    }

    /// Parse and validate YAML config text
    pub fn from_yaml_str(content: &str) -> Result<Self, MonitorError> {
        let raw: RawConfig = serde_yaml::from_str(content)
            .map_err(|e| MonitorError::config(format!("failed to parse config: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, MonitorError> {
        let mut policy = TriggerPolicy::new(
            Duration::from_secs(raw.trigger.interval),
            raw.trigger.count,
        )?;
        if raw.trigger.telemetry_timeout.is_some() || raw.trigger.remediation_timeout.is_some() {
            let telemetry = raw
                .trigger
                .telemetry_timeout
                .map(Duration::from_secs)
                .unwrap_or(policy.telemetry_timeout);
            let remediation = raw
                .trigger
                .remediation_timeout
                .map(Duration::from_secs)
                .unwrap_or(policy.remediation_timeout);
            policy = policy.with_timeouts(telemetry, remediation)?;
        }

        if raw.sites.is_empty() {
            return Err(MonitorError::config("no sites configured"));
        }

        let mut seen = HashSet::new();
        let mut sites = Vec::with_capacity(raw.sites.len());
        for (site_id, site) in raw.sites {
            if !seen.insert(site_id) {
                return Err(MonitorError::config(format!("duplicate site id {}", site_id)));
            }
            if site.color.trim().is_empty() {
                return Err(MonitorError::config(format!("site {}: color is empty", site_id)));
            }
            if site.ups.trim().is_empty() {
                return Err(MonitorError::config(format!("site {}: ups is empty", site_id)));
            }
            if site.outlet == 0 {
                return Err(MonitorError::config(format!(
                    "site {}: outlet must be 1 or greater",
                    site_id
                )));
            }
            debug!(
                "Site {}: color={} ups={} outlet={}",
                site_id, site.color, site.ups, site.outlet
            );
            sites.push(SiteConfig {
                site_id,
                transport_color: site.color.trim().to_string(),
                ups_address: site.ups.trim().to_string(),
                outlet_id: site.outlet,
            });
        }

        if raw.ups.max_attempts == 0 {
            return Err(MonitorError::config("ups.max_attempts must be at least 1"));
        }
        if policy.remediation_timeout < raw.ups.min_cycle_time() {
            return Err(MonitorError::config(format!(
                "remediation timeout ({:?}) is shorter than one outlet power-cycle \
                 (ups.off_wait + ups.settle_wait + {}s request budget = {:?}); \
                 raise trigger.interval or lower the ups waits",
                policy.remediation_timeout,
                UPS_REQUEST_TIMEOUT_SECS,
                raw.ups.min_cycle_time()
            )));
        }

        Ok(Self {
            policy,
            sites,
            ups: raw.ups,
            verify_tls: raw.verify_tls,
        })
    }

    pub fn site(&self, site_id: SiteId) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }

    pub fn site_ids(&self) -> Vec<SiteId> {
        self.sites.iter().map(|s| s.site_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
trigger:
  interval: 60
  count: 5
sites:
  100:
    color: biz-internet
    ups: 10.1.1.50
    outlet: 1
  200:
    color: public-internet
    ups: 10.2.1.50
    outlet: 3
"#;

    #[test]
    fn test_valid_config() {
        let config = MonitorConfig::from_yaml_str(VALID).unwrap();
        assert_eq!(config.policy.poll_interval, Duration::from_secs(60));
        assert_eq!(config.policy.failure_threshold, 5);
        assert_eq!(config.policy.telemetry_timeout, Duration::from_secs(5));
        assert_eq!(config.policy.remediation_timeout, Duration::from_secs(54));
        assert_eq!(config.site_ids(), vec![SiteId(100), SiteId(200)]);

        let site = config.site(SiteId(200)).unwrap();
        assert_eq!(site.transport_color, "public-internet");
        assert_eq!(site.ups_address, "10.2.1.50");
        assert_eq!(site.outlet_id, 3);

        assert_eq!(config.ups, UpsSettings::default());
        assert!(!config.verify_tls);
    }

    #[test]
    fn test_duplicate_site_id_rejected() {
        let yaml = r#"
trigger: {interval: 60, count: 5}
sites:
  100: {color: biz-internet, ups: 10.1.1.50, outlet: 1}
  100: {color: mpls, ups: 10.1.1.51, outlet: 2}
"#;
        let err = MonitorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = "trigger: {interval: 0, count: 5}\nsites:\n  1: {color: a, ups: b, outlet: 1}\n";
        let err = MonitorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let yaml = "trigger: {interval: 30, count: 0}\nsites:\n  1: {color: a, ups: b, outlet: 1}\n";
        let err = MonitorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("trigger.count"));
    }

    #[test]
    fn test_negative_values_rejected() {
        let yaml = "trigger: {interval: -5, count: 3}\nsites:\n  1: {color: a, ups: b, outlet: 1}\n";
        assert!(MonitorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        let yaml = r#"
trigger: {interval: 10, count: 3, remediation_timeout: 10}
sites:
  1: {color: a, ups: b, outlet: 1}
"#;
        let err = MonitorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("remediation timeout"));
    }

    #[test]
    fn test_short_interval_clamps_default_telemetry_timeout() {
        let policy = TriggerPolicy::new(Duration::from_secs(2), 1).unwrap();
        assert!(policy.telemetry_timeout < policy.poll_interval);
        assert!(policy.remediation_timeout < policy.poll_interval);
    }

    #[test]
    fn test_remediation_timeout_shorter_than_cycle_rejected() {
        // 4.5s default budget against a 5s off_wait
        let yaml = "trigger: {interval: 5, count: 1}\nsites:\n  1: {color: a, ups: b, outlet: 1}\n";
        let err = MonitorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("power-cycle"), "{}", err);

        let yaml = r#"
trigger: {interval: 30, count: 1, remediation_timeout: 20}
ups: {off_wait: 15, settle_wait: 2}
sites:
  1: {color: a, ups: b, outlet: 1}
"#;
        assert!(MonitorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_remediation_timeout_covering_cycle_accepted() {
        // 12s cycle (5 + 2 + 5) fits the 13.5s default budget
        let yaml = "trigger: {interval: 15, count: 1}\nsites:\n  1: {color: a, ups: b, outlet: 1}\n";
        let config = MonitorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ups.min_cycle_time(), Duration::from_secs(12));
        assert!(config.policy.remediation_timeout >= config.ups.min_cycle_time());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = r#"
trigger: {interval: 60, count: 5}
sites:
  1: {color: a, ups: b, outlet: 1, port: 7}
"#;
        assert!(MonitorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_zero_outlet_rejected() {
        let yaml = "trigger: {interval: 60, count: 5}\nsites:\n  1: {color: a, ups: b, outlet: 0}\n";
        assert!(MonitorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_empty_sites_rejected() {
        let yaml = "trigger: {interval: 60, count: 5}\nsites: {}\n";
        assert!(MonitorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_ups_overrides() {
        let yaml = r#"
trigger: {interval: 60, count: 5, telemetry_timeout: 8}
ups: {off_wait: 10, max_attempts: 5}
verify_tls: true
sites:
  1: {color: a, ups: b, outlet: 1}
"#;
        let config = MonitorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.policy.telemetry_timeout, Duration::from_secs(8));
        assert_eq!(config.ups.off_wait(), Duration::from_secs(10));
        assert_eq!(config.ups.settle_wait(), Duration::from_secs(2));
        assert_eq!(config.ups.max_attempts, 5);
        assert!(config.verify_tls);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.sites.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = MonitorConfig::load(Path::new("/nonexistent/linkcycle.yaml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
