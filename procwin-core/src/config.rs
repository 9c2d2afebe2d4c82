use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::function::AccumulationMode;
use crate::windower::WindowAssigner;

const ENV_WINDOW_SIZE_MS: &str = "PROCWIN_WINDOW_SIZE_MS";
const ENV_WINDOW_SLIDE_MS: &str = "PROCWIN_WINDOW_SLIDE_MS";
const ENV_PARTITIONS: &str = "PROCWIN_PARTITIONS";
const ENV_KEYED: &str = "PROCWIN_KEYED";
const ENV_ACCUMULATION_MODE: &str = "PROCWIN_ACCUMULATION_MODE";
const ENV_CHANNEL_SIZE: &str = "PROCWIN_CHANNEL_SIZE";
const ENV_METRICS_PORT: &str = "PROCWIN_METRICS_PORT";

const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(60);
const DEFAULT_CHANNEL_SIZE: usize = 500;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// Configuration of the windowing runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub size: Duration,
    pub slide: Duration,
    /// Number of partitions, each with its own operator and timer.
    pub partitions: u16,
    pub keyed: bool,
    pub accumulation_mode: AccumulationMode,
    /// Capacity of the input queue of every partition.
    pub channel_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_WINDOW_SIZE,
            slide: DEFAULT_WINDOW_SIZE,
            partitions: 1,
            keyed: false,
            accumulation_mode: AccumulationMode::default(),
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl WindowConfig {
    /// Validates the configuration and builds the window assigner.
    pub fn assigner(&self) -> Result<WindowAssigner> {
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be at least 1".to_string()));
        }
        if self.channel_size == 0 {
            return Err(Error::Config("channel size must be at least 1".to_string()));
        }
        WindowAssigner::new(self.size, self.slide)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub window: WindowConfig,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

fn parse_env<T>(env_vars: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    env_vars
        .get(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| {
                Error::Config(format!("Parsing {name}(set to '{value}'): {e:?}"))
            })
        })
        .transpose()
}

/// This implementation is to load settings from env variables
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(size_ms) = parse_env::<u64>(&env_vars, ENV_WINDOW_SIZE_MS)? {
            settings.window.size = Duration::from_millis(size_ms);
        }

        // a missing slide means tumbling windows
        settings.window.slide = match parse_env::<u64>(&env_vars, ENV_WINDOW_SLIDE_MS)? {
            Some(slide_ms) => Duration::from_millis(slide_ms),
            None => settings.window.size,
        };

        if let Some(partitions) = parse_env(&env_vars, ENV_PARTITIONS)? {
            settings.window.partitions = partitions;
        }

        if let Some(keyed) = parse_env(&env_vars, ENV_KEYED)? {
            settings.window.keyed = keyed;
        }

        if let Some(mode) = env_vars.get(ENV_ACCUMULATION_MODE) {
            settings.window.accumulation_mode = mode.parse()?;
        }

        if let Some(channel_size) = parse_env(&env_vars, ENV_CHANNEL_SIZE)? {
            settings.window.channel_size = channel_size;
        }

        if let Some(metrics_port) = parse_env(&env_vars, ENV_METRICS_PORT)? {
            settings.metrics_port = metrics_port;
        }

        // reject invalid window shapes at startup
        settings.window.assigner()?;

        Ok(settings)
    }
}
