use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::InventoryConfig;
use crate::error::Error;
use crate::sync::{Synchronizer, Update};


/// Session probe against the external inventory system.
#[derive(Clone, Debug)]
pub struct Inventory {
    reqwest: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl Inventory {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// None when no inventory url is configured.
    pub fn from_config(config: &InventoryConfig) -> Option<Self> {
        config.url.clone().map(|url| Self::new(url, config.token.clone()))
    }

    pub fn session_url(&self) -> String {
        format!("{}/v2/session", self.url)
    }

    pub async fn check_session(&self) -> Result<(), Error> {
        let mut request = self.reqwest
            .get(self.session_url())
            .timeout(Duration::from_secs(10));
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {}", token));
        }

        let response = request.send().await
            .map_err(|err| Error::Inventory(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Inventory(format!("session check returned {}", response.status())));
        }

        Ok(())
    }

    pub async fn available(&self) -> bool {
        match self.check_session().await {
            Ok(()) => true,
            Err(err) => {
                debug!("{}", err);
                false
            }
        }
    }
}


/// Probes at startup and then periodically, pushing availability flips.
pub async fn watch(config: InventoryConfig, sync: Arc<Synchronizer>) {
    let Some(inventory) = Inventory::from_config(&config) else {
        warn!("no inventory url configured, external system unavailable");
        return;
    };

    let period = Duration::from_secs(config.probe_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut available = false;
    loop {
        interval.tick().await;
        let now = inventory.available().await;
        if now != available {
            info!(url = %inventory.url, available = now, "inventory availability changed");
            sync.apply(Update::ExternalSystem(now)).await;
            available = now;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_inventory_is_none() {
        assert!(Inventory::from_config(&InventoryConfig::default()).is_none());
    }

    #[test]
    fn session_url_drops_trailing_slash() {
        let config = InventoryConfig {
            url: Some("http://inventory.local/api/".into()),
            token: Some("secret".into()),
            ..InventoryConfig::default()
        };
        let inventory = Inventory::from_config(&config).unwrap();
        assert_eq!(inventory.session_url(), "http://inventory.local/api/v2/session");
    }

    #[tokio::test]
    async fn unreachable_inventory_is_unavailable() {
        let inventory = Inventory::new("http://127.0.0.1:9".into(), None);
        assert!(matches!(inventory.check_session().await, Err(Error::Inventory(_))));
        assert!(!inventory.available().await);
    }
}
