use std::{env, fs, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::robot::WheelGeometry;

/// Environment variable that may point to a YAML configuration file.
pub const CONFIG_ENV_VAR: &str = "WHEELBRIDGE_CONFIG";

/// Configuration shared by the replaying and the serving process.
///
/// Both processes read the same file so they agree on the channel name.
#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelSettings,
    pub replay: ReplaySettings,
    pub server: ServerSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    /// Name of the shared memory region both processes attach to.
    pub name: String,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            name: "/wheel_velocity_data".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplaySettings {
    /// Topic in the bag that carries the velocity commands.
    pub topic: String,

    /// Delay after each published record. Only approximates real time.
    pub pace_ms: u64,

    pub geometry: WheelGeometry,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            topic: "/cmd_vel".into(),
            pace_ms: 100,
            geometry: WheelGeometry::default(),
        }
    }
}

impl ReplaySettings {
    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the query endpoint listens on.
    pub bind_address: String,

    /// Period of the read loop.
    pub period_ms: u64,

    /// Print a text report for every fresh sample.
    pub console: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".into(),
            period_ms: 100,
            console: true,
        }
    }
}

impl ServerSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        // read file contents
        let contents =
            fs::read_to_string(path).with_context(|| format!("could not read config {path}"))?;

        Self::from_contents(&contents).with_context(|| format!("invalid config {path}"))
    }

    pub fn from_contents(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| anyhow!(e))
    }

    /// Loads the file named by [`CONFIG_ENV_VAR`], or the defaults if it is not set.
    pub fn from_env() -> anyhow::Result<Self> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}
