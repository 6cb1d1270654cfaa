use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub lease_duration_seconds: u32,
    pub reply_delay_seconds: i64,
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout_seconds: u32,
    #[serde(default = "default_decline_cooldown")]
    pub decline_cooldown_seconds: u32,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_seconds: u32,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    #[serde(default)]
    pub excluded_addresses: Vec<Ipv4Addr>,
    #[serde(default = "default_admin_bind")]
    pub admin_bind_address: SocketAddr,
}

fn default_offer_timeout() -> u32 {
    60
}

fn default_decline_cooldown() -> u32 {
    3600
}

fn default_reap_interval() -> u32 {
    5
}

fn default_admin_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6868))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 173, 1),
            broadcast_address: Ipv4Addr::BROADCAST,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(192, 168, 173, 1)),
            dns_servers: vec![Ipv4Addr::new(192, 168, 173, 1)],
            domain_name: None,
            lease_duration_seconds: 300,
            reply_delay_seconds: 10,
            offer_timeout_seconds: default_offer_timeout(),
            decline_cooldown_seconds: default_decline_cooldown(),
            reap_interval_seconds: default_reap_interval(),
            pool_start: Ipv4Addr::new(192, 168, 173, 10),
            pool_end: Ipv4Addr::new(192, 168, 173, 254),
            excluded_addresses: Vec::new(),
            admin_bind_address: default_admin_bind(),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start > end {
            return Err(Error::ConfigInvalid(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        if self.reply_delay_seconds < 0 {
            return Err(Error::ConfigInvalid(
                "reply_delay_seconds must not be negative".to_string(),
            ));
        }

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::ConfigInvalid(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway
            && self.ip_in_pool(gateway)
        {
            return Err(Error::ConfigInvalid(
                "gateway must not be within the pool range".to_string(),
            ));
        }

        if let Some(outside) = self
            .excluded_addresses
            .iter()
            .find(|address| !self.ip_in_pool(**address))
        {
            return Err(Error::ConfigInvalid(format!(
                "excluded address {} is outside the pool range",
                outside
            )));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::ConfigInvalid(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::ConfigInvalid(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.reap_interval_seconds == 0 {
            return Err(Error::ConfigInvalid(
                "reap_interval_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);
        addr >= start && addr <= end
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.pool_end)
            .saturating_sub(u32::from(self.pool_start))
            .saturating_add(1)
    }

    /// Directed broadcast of the served subnet, advertised as option 28.
    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) | !u32::from(self.subnet_mask))
    }

    /// Delay applied to every reply before it is handed to the wire.
    ///
    /// Only meaningful after [`validate`](Self::validate); a negative value
    /// is clamped to zero.
    pub fn reply_delay(&self) -> Duration {
        Duration::from_secs(self.reply_delay_seconds.max(0) as u64)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.reap_interval_seconds))
    }

    /// Renewal time (T1), half the lease duration.
    pub fn renewal_time_seconds(&self) -> u32 {
        self.lease_duration_seconds / 2
    }

    /// Rebinding time (T2), seven eighths of the lease duration.
    pub fn rebinding_time_seconds(&self) -> u32 {
        ((u64::from(self.lease_duration_seconds) * 7) / 8) as u32
    }
}
