//! Simulation configuration.
//!
//! A JSON file describing one broker, its providers and its requesters:
//! - Broker identity, hold window and optional registry snapshot path
//! - Provider capacity, price and registration retry policy
//! - Requester workload, budget and timing policy

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use capnet_agent::{BrokerConfig, ProviderConfig, RequesterConfig};
use capnet_market::HoldPolicy;
use capnet_proto::PartyId;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSection {
    /// Broker address.
    pub id: String,
    /// How long a provider stays reserved for an outstanding offer, in milliseconds.
    pub hold_ms: u64,
    /// Persist the provider registry to this JSON file.
    pub registry_path: Option<PathBuf>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            id: "broker".to_string(),
            hold_ms: 10_000,
            registry_path: None,
        }
    }
}

/// One provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSection {
    /// Provider address.
    pub id: String,
    /// Units per interval.
    pub capacity: u64,
    /// Price charged per unit.
    pub price_per_unit: f64,
    /// First ack wait in milliseconds.
    pub ack_timeout_ms: u64,
    /// Cap on the doubling ack wait in milliseconds.
    pub max_ack_timeout_ms: u64,
    /// Leave the market this many milliseconds after starting.
    pub leave_after_ms: Option<u64>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            id: "provider".to_string(),
            capacity: 100,
            price_per_unit: 1.0,
            ack_timeout_ms: 2_000,
            max_ack_timeout_ms: 30_000,
            leave_after_ms: None,
        }
    }
}

/// One requester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequesterSection {
    /// Requester address.
    pub id: String,
    /// Units per job.
    pub required_units: u64,
    /// Highest acceptable total price.
    pub budget: f64,
    /// Required availability horizon in milliseconds.
    pub deadline_ms: u64,
    /// Wait for a proposal in milliseconds.
    pub proposal_timeout_ms: u64,
    /// Extra wait past the committed completion, in milliseconds.
    pub completion_slack_ms: u64,
    /// Pause after a rejection in milliseconds.
    pub retry_delay_ms: u64,
    /// Jobs to run before finishing.
    pub jobs: u32,
}

impl Default for RequesterSection {
    fn default() -> Self {
        Self {
            id: "requester".to_string(),
            required_units: 10,
            budget: 100.0,
            deadline_ms: 10_000,
            proposal_timeout_ms: 30_000,
            completion_slack_ms: 2_000,
            retry_delay_ms: 30_000,
            jobs: 1,
        }
    }
}

/// Whole-simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SimulationConfig {
    /// Broker settings.
    pub broker: BrokerSection,
    /// Providers to start.
    pub providers: Vec<ProviderSection>,
    /// Requesters to start.
    pub requesters: Vec<RequesterSection>,
    /// Stop the run after this many seconds even if requesters are unfinished.
    pub time_limit_secs: Option<u64>,
}

/// Longest configurable duration: 30 days.
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

fn millis(field: &str, ms: u64) -> Result<TimeDelta, DaemonError> {
    if ms > MAX_DURATION_MS {
        return Err(DaemonError::Config(format!(
            "{field} must be at most {MAX_DURATION_MS}, got {ms}"
        )));
    }
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| DaemonError::Config(format!("{field} is out of range: {ms}")))
}

fn party_id(id: &str) -> Result<PartyId, DaemonError> {
    PartyId::parse(id).map_err(|e| DaemonError::Config(e.to_string()))
}

impl SimulationConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DaemonError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the values fail validation.
    pub fn from_json(content: &str) -> Result<Self, DaemonError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| DaemonError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DaemonError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DaemonError::Config(format!("failed to encode config: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Two providers and four requesters with mixed budgets.
    pub fn sample() -> Self {
        let provider = |id: &str, capacity, price_per_unit| ProviderSection {
            id: id.to_string(),
            capacity,
            price_per_unit,
            ..ProviderSection::default()
        };
        let requester = |id: &str, required_units, budget| RequesterSection {
            id: id.to_string(),
            required_units,
            budget,
            ..RequesterSection::default()
        };
        Self {
            broker: BrokerSection::default(),
            providers: vec![provider("provider-1", 45, 1.0), provider("provider-2", 35, 0.8)],
            requesters: vec![
                requester("requester-1", 10, 20.0),
                requester("requester-2", 30, 40.0),
                requester("requester-3", 20, 30.0),
                requester("requester-4", 15, 25.0),
            ],
            time_limit_secs: Some(300),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.broker.hold_ms == 0 {
            return Err(DaemonError::Config(
                "broker.hold_ms must be greater than 0".to_string(),
            ));
        }
        self.broker_config()?;

        let mut seen = HashSet::new();
        let ids = std::iter::once(self.broker.id.as_str())
            .chain(self.providers.iter().map(|p| p.id.as_str()))
            .chain(self.requesters.iter().map(|r| r.id.as_str()));
        for id in ids {
            party_id(id)?;
            if !seen.insert(id) {
                return Err(DaemonError::Config(format!("duplicate party id '{id}'")));
            }
        }

        for config in self.provider_configs()? {
            config.validate()?;
        }
        for config in self.requester_configs()? {
            config.validate()?;
        }

        match self.time_limit_secs {
            Some(0) => {
                return Err(DaemonError::Config(
                    "time_limit_secs must be greater than 0".to_string(),
                ));
            }
            Some(secs) if secs > MAX_DURATION_MS / 1000 => {
                return Err(DaemonError::Config(format!(
                    "time_limit_secs must be at most {}, got {secs}",
                    MAX_DURATION_MS / 1000
                )));
            }
            _ => {}
        }

        Ok(())
    }

    /// Broker settings for the agent layer.
    pub fn broker_config(&self) -> Result<BrokerConfig, DaemonError> {
        Ok(BrokerConfig {
            id: party_id(&self.broker.id)?,
            hold: HoldPolicy {
                window: millis("broker.hold_ms", self.broker.hold_ms)?,
            },
        })
    }

    /// Provider settings for the agent layer.
    pub fn provider_configs(&self) -> Result<Vec<ProviderConfig>, DaemonError> {
        let broker = party_id(&self.broker.id)?;
        self.providers
            .iter()
            .map(|p| {
                Ok(ProviderConfig {
                    id: party_id(&p.id)?,
                    broker: broker.clone(),
                    capacity: p.capacity,
                    price_per_unit: p.price_per_unit,
                    ack_timeout: millis("providers.ack_timeout_ms", p.ack_timeout_ms)?,
                    max_ack_timeout: millis("providers.max_ack_timeout_ms", p.max_ack_timeout_ms)?,
                    leave_after: p
                        .leave_after_ms
                        .map(|ms| millis("providers.leave_after_ms", ms))
                        .transpose()?,
                })
            })
            .collect()
    }

    /// Requester settings for the agent layer.
    pub fn requester_configs(&self) -> Result<Vec<RequesterConfig>, DaemonError> {
        let broker = party_id(&self.broker.id)?;
        self.requesters
            .iter()
            .map(|r| {
                Ok(RequesterConfig {
                    id: party_id(&r.id)?,
                    broker: broker.clone(),
                    required_units: r.required_units,
                    budget: r.budget,
                    deadline: millis("requesters.deadline_ms", r.deadline_ms)?,
                    proposal_timeout: millis("requesters.proposal_timeout_ms", r.proposal_timeout_ms)?,
                    completion_slack: millis("requesters.completion_slack_ms", r.completion_slack_ms)?,
                    retry_delay: millis("requesters.retry_delay_ms", r.retry_delay_ms)?,
                    jobs: r.jobs,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let json = r#"{
            "providers": [{ "id": "p1", "capacity": 45 }],
            "requesters": [{ "id": "r1", "required_units": 10 }]
        }"#;

        let config = SimulationConfig::from_json(json).expect("should parse");

        assert_eq!(config.broker.id, "broker");
        assert_eq!(config.broker.hold_ms, 10_000);
        assert_eq!(config.providers[0].ack_timeout_ms, 2_000);
        assert_eq!(config.requesters[0].jobs, 1);
        assert!((config.requesters[0].budget - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sample_config_is_valid() {
        let config = SimulationConfig::sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.requesters.len(), 4);
        let units: Vec<_> = config.requesters.iter().map(|r| r.required_units).collect();
        assert_eq!(units, vec![10, 30, 20, 15]);
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("capnet.json");
        let config = SimulationConfig::sample();

        config.save(&path).expect("save");
        let loaded = SimulationConfig::load(&path).expect("load");

        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = SimulationConfig::load("/nonexistent/capnet.json").unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(SimulationConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = SimulationConfig::sample();
        config.requesters[1].id = "provider-1".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate party id"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.providers[0].capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_units_are_rejected() {
        let mut config = SimulationConfig::sample();
        config.requesters[0].required_units = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_price_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.providers[1].price_per_unit = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn whitespace_in_id_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.broker.id = "the broker".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_configs_carry_timings() {
        let config = SimulationConfig::sample();
        let providers = config.provider_configs().unwrap();
        let requesters = config.requester_configs().unwrap();

        assert_eq!(providers[0].ack_timeout, TimeDelta::seconds(2));
        assert_eq!(providers[0].broker.as_str(), "broker");
        assert_eq!(requesters[2].deadline, TimeDelta::seconds(10));
        assert_eq!(config.broker_config().unwrap().hold.window, TimeDelta::seconds(10));
    }

    #[test]
    fn huge_hold_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.broker.hold_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        assert!(err.to_string().contains("broker.hold_ms"));
        assert!(config.broker_config().is_err());
    }

    #[test]
    fn huge_completion_slack_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.requesters[0].completion_slack_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("completion_slack_ms"));
    }

    #[test]
    fn durations_are_capped() {
        let mut config = SimulationConfig::sample();
        config.broker.hold_ms = MAX_DURATION_MS;
        config.providers[0].leave_after_ms = Some(MAX_DURATION_MS);
        assert!(config.validate().is_ok());

        let over = MAX_DURATION_MS + 1;
        let cases: [fn(&mut SimulationConfig, u64); 8] = [
            |c, ms| c.broker.hold_ms = ms,
            |c, ms| c.providers[0].ack_timeout_ms = ms,
            |c, ms| c.providers[0].max_ack_timeout_ms = ms,
            |c, ms| c.providers[0].leave_after_ms = Some(ms),
            |c, ms| c.requesters[0].deadline_ms = ms,
            |c, ms| c.requesters[0].proposal_timeout_ms = ms,
            |c, ms| c.requesters[0].completion_slack_ms = ms,
            |c, ms| c.requesters[0].retry_delay_ms = ms,
        ];
        for set in cases {
            let mut config = SimulationConfig::sample();
            set(&mut config, over);
            assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
        }
    }

    #[test]
    fn huge_time_limit_is_rejected() {
        let mut config = SimulationConfig::sample();
        config.time_limit_secs = Some(u64::MAX);
        assert!(config.validate().is_err());
    }
}
