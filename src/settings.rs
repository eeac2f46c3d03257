use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::brain::BrainError;

pub const DEFAULT_BASE_URL: &str = "https://api.worldquantbrain.com";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum Toggle {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

/// Settings attached to every simulation request. Serialized with the field names the service
/// expects.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSettings {
    pub instrument_type: String,
    pub region: String,
    pub universe: String,
    pub delay: u8,
    pub decay: u32,
    pub neutralization: String,
    pub truncation: f64,
    pub pasteurization: Toggle,
    pub test_period: String,
    pub unit_handling: String,
    pub nan_handling: Toggle,
    pub max_trade: Toggle,
    pub language: String,
    pub visualization: bool,
}

impl SimulationSettings {
    pub fn new(
        region: impl Into<String>,
        universe: impl Into<String>,
        delay: u8,
        decay: u32,
        neutralization: impl Into<String>,
        truncation: f64,
    ) -> Self {
        Self {
            instrument_type: "EQUITY".to_string(),
            region: region.into(),
            universe: universe.into(),
            delay,
            decay,
            neutralization: neutralization.into(),
            truncation,
            pasteurization: Toggle::On,
            test_period: "P0Y0M".to_string(),
            unit_handling: "VERIFY".to_string(),
            nan_handling: Toggle::On,
            max_trade: Toggle::Off,
            language: "FASTEXPR".to_string(),
            visualization: false,
        }
    }
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self::new("USA", "TOP3000", 1, 0, "CROWDING", 0.04)
    }
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn from_env() -> Result<Self, BrainError> {
        match (env::var("WQ_EMAIL"), env::var("WQ_PASSWORD")) {
            (Ok(email), Ok(password)) => Ok(Self::new(email, password)),
            _ => Err(BrainError::MissingCredentials),
        }
    }
}

/// Retry budgets for the operations in [crate::session::Session].
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    pub login: i32,
    pub simulation: i32,
    /// Alpha metrics, operator list and each data-field page.
    pub fetch: i32,
    pub correlation: i32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            login: 3,
            simulation: 3,
            fetch: 3,
            correlation: 20,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub base_url: String,
    pub workers: usize,
    pub batch_size: usize,
    pub retries: RetryBudget,
    /// Half-open range `[low, high)` a poll sleeps for while a simulation is still running.
    pub poll_interval: (Duration, Duration),
    pub delimiter: char,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            workers: 8,
            batch_size: 10,
            retries: RetryBudget::default(),
            poll_interval: (Duration::from_secs(10), Duration::from_secs(30)),
            delimiter: '|',
        }
    }
}

impl RunnerConfig {
    /// Defaults with overrides taken from `BRAIN_BASE_URL`, `BRAIN_WORKERS` and
    /// `BRAIN_BATCH_SIZE`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("BRAIN_BASE_URL") {
            config.base_url = url;
        }
        if let Some(workers) = env::var("BRAIN_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.workers = workers.max(1);
        }
        if let Some(batch_size) = env::var("BRAIN_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.batch_size = batch_size.max(1);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::{SimulationSettings, Toggle};

    #[test]
    fn test_that_settings_serialize_with_service_field_names() {
        let settings = SimulationSettings::new("ASI", "TOP3000", 1, 4, "INDUSTRY", 0.08);
        let json = serde_json::to_value(&settings).unwrap();

        assert_eq!(json["instrumentType"], "EQUITY");
        assert_eq!(json["neutralization"], "INDUSTRY");
        assert_eq!(json["testPeriod"], "P0Y0M");
        assert_eq!(json["nanHandling"], "ON");
        assert_eq!(json["maxTrade"], "OFF");
        assert_eq!(json["visualization"], false);
    }

    #[test]
    fn test_that_toggle_round_trips_through_upper_case() {
        let toggle: Toggle = serde_json::from_str("\"OFF\"").unwrap();
        assert_eq!(toggle, Toggle::Off);
    }
}
