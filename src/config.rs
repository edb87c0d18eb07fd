use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;


pub const DEFAULT_DOWNLOAD_URL: &str = "https://ash-speed.hetzner.com/100MB.bin";


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub discovery: DiscoveryConfig,
    pub programs: ProgramsConfig,
    pub inventory: InventoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 4000,
            discovery: DiscoveryConfig::default(),
            programs: ProgramsConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

impl Config {
    /// Reads the YAML file at `path`, or returns the defaults when no path
    /// is given.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|err| Error::Config(err.to_string()))?;
        config.programs.validate()?;
        Ok(config)
    }
}


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub smartctl: String,
    pub refresh_interval_secs: u64,
    pub ignore: Vec<String>,
    pub resources: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smartctl: "smartctl".to_string(),
            refresh_interval_secs: 10,
            ignore: vec![],
            resources: vec![],
        }
    }
}

impl DiscoveryConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}


/// Command prefixes used to launch each program. The first word is the
/// executable, the rest is placed before the program's own arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub badblocks: String,
    pub wget: String,
    pub download_url: String,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            badblocks: "badblocks".to_string(),
            wget: "wget".to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
        }
    }
}

impl ProgramsConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (name, prefix) in [("badblocks", &self.badblocks), ("wget", &self.wget)] {
            match shlex::split(prefix) {
                Some(words) if !words.is_empty() => {}
                _ => {
                    return Err(Error::Config(
                        format!("programs.{} is not a valid command: {:?}", name, prefix)
                    ));
                }
            }
        }
        Ok(())
    }
}


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub probe_interval_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            probe_interval_secs: 60,
        }
    }
}
