//! The range of addresses the server may hand out.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::config::Config;
use crate::error::{Error, Result};

/// An inclusive address range plus the addresses excluded from it.
///
/// Exclusions come from the configuration and from the admin console.
#[derive(Debug, Clone)]
pub struct AddressPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    excluded: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    pub fn new(
        start: Ipv4Addr,
        end: Ipv4Addr,
        excluded: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(Error::ConfigInvalid(format!(
                "pool start {} is after pool end {}",
                start, end
            )));
        }

        let mut pool = Self {
            start,
            end,
            excluded: BTreeSet::new(),
        };
        for address in excluded {
            pool.exclude(address)?;
        }
        Ok(pool)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.pool_start,
            config.pool_end,
            config.excluded_addresses.iter().copied(),
        )
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Whether `address` lies inside the range, excluded or not.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let addr = u32::from(address);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    pub fn is_excluded(&self, address: Ipv4Addr) -> bool {
        self.excluded.contains(&address)
    }

    /// In range and not excluded.
    pub fn is_assignable(&self, address: Ipv4Addr) -> bool {
        self.contains(address) && !self.is_excluded(address)
    }

    /// Excludes `address`. Returns `false` if it was already excluded.
    pub fn exclude(&mut self, address: Ipv4Addr) -> Result<bool> {
        if !self.contains(address) {
            return Err(Error::AddressOutOfRange(address));
        }
        Ok(self.excluded.insert(address))
    }

    /// Returns `address` to service. Returns `false` if it was not excluded.
    pub fn include(&mut self, address: Ipv4Addr) -> Result<bool> {
        if !self.contains(address) {
            return Err(Error::AddressOutOfRange(address));
        }
        Ok(self.excluded.remove(&address))
    }

    pub fn excluded(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.excluded.iter().copied()
    }

    /// Every assignable address, lowest first.
    pub fn assignable(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.start)..=u32::from(self.end))
            .map(Ipv4Addr::from)
            .filter(|address| !self.excluded.contains(address))
    }
}
