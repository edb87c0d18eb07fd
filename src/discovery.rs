use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::DiscoveryConfig;
use crate::error::Error;
use crate::scheduler::Scheduler;


#[derive(Debug, Deserialize)]
struct ScanOutput {
    #[serde(default)]
    devices: Vec<ScannedDevice>,
}


#[derive(Debug, Deserialize)]
struct ScannedDevice {
    name: String,
}


/// Device names from `smartctl --scan --json` output.
pub fn parse_scan(output: &str) -> Result<Vec<String>, Error> {
    let scan: ScanOutput = serde_json::from_str(output)
        .map_err(|err| Error::Discovery(format!("invalid smartctl output: {}", err)))?;
    Ok(scan.devices.into_iter().map(|device| device.name).collect())
}


/// Static resources first, then scanned devices, without ignored or
/// duplicate names.
pub fn select(config: &DiscoveryConfig, scanned: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = vec![];
    for name in config.resources.iter().cloned().chain(scanned) {
        if !config.ignore.contains(&name) && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}


pub async fn scan(config: &DiscoveryConfig) -> Result<Vec<String>, Error> {
    if !config.enabled {
        return Ok(select(config, vec![]));
    }

    let output = tokio::process::Command::new(&config.smartctl)
        .args(["--scan", "--json"])
        .output()
        .await
        .map_err(|err| Error::Discovery(format!("failed to run {}: {}", config.smartctl, err)))?;

    if !output.stderr.is_empty() {
        debug!(stderr = %String::from_utf8_lossy(&output.stderr), "smartctl scan");
    }

    let scanned = parse_scan(&String::from_utf8_lossy(&output.stdout))?;
    Ok(select(config, scanned))
}


/// Scans once and hands the result to the scheduler.
pub async fn refresh(config: &DiscoveryConfig, scheduler: &Scheduler) -> Result<Vec<String>, Error> {
    let names = scan(config).await?;
    debug!(resources = ?names, "resource scan finished");
    scheduler.set_resources(names.clone()).await?;
    Ok(names)
}


/// Scans at startup, then at the configured interval until the scheduler
/// goes away.
pub async fn watch(config: DiscoveryConfig, scheduler: Scheduler) {
    let Some(period) = config.refresh_interval() else {
        info!("periodic resource discovery disabled");
        if let Err(err) = refresh(&config, &scheduler).await {
            error!("{}", err);
        }
        return;
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match refresh(&config, &scheduler).await {
            Ok(_) => {}
            Err(Error::SchedulerClosed) => break,
            Err(err) => error!("{}", err),
        }
    }
}
