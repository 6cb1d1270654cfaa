//! Option encoding and decoding (RFC 2132).
//!
//! Incoming options are kept raw in an [`Options`] map (code to value bytes,
//! first occurrence wins) and decoded lazily through the typed accessors on
//! [`DhcpMessage`](crate::packet::DhcpMessage). Outgoing options are built as
//! typed [`DhcpOption`] values, covering only what the server hands out:
//! address, mask, gateway, DNS, domain and lease timers.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Address-list options are capped to what fits in a one-byte length.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// DHCP option codes understood by the server.
///
/// Anything else is carried through [`Options`] untouched and never echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// Option 52: options continue in `file` and/or `sname`.
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// T1.
    RenewalTime = 58,
    /// T2.
    RebindingTime = 59,
    End = 255,
}

/// Value of option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    /// The offered address turned out to be in use.
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    /// Configuration only, the client already has an address.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Which header fields carry overflow options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// Raw option map in wire order. Duplicate codes keep the first value seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `code` unless the code is already present.
    ///
    /// Returns `false` when an earlier value was kept.
    pub fn insert(&mut self, code: u8, value: Vec<u8>) -> bool {
        if self.contains(code) {
            return false;
        }
        self.entries.push((code, value));
        true
    }

    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == code)
            .map(|(_, value)| value.as_slice())
    }

    pub fn contains(&self, code: u8) -> bool {
        self.entries.iter().any(|(existing, _)| *existing == code)
    }

    pub fn remove(&mut self, code: u8) -> Option<Vec<u8>> {
        let index = self.entries.iter().position(|(existing, _)| *existing == code)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.entries
            .iter()
            .map(|(code, value)| (*code, value.as_slice()))
    }

    /// Parses a TLV option area, stopping at End.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if a length byte is missing or a
    /// declared length overruns `data`.
    pub fn parse_into(&mut self, data: &[u8]) -> Result<()> {
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::MalformedPacket("Option length missing".to_string()));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::MalformedPacket(format!(
                    "Option {} declares {} bytes but only {} remain",
                    code,
                    length,
                    data.len() - index - 2
                )));
            }

            self.insert(code, data[index + 2..index + 2 + length].to_vec());

            index += 2 + length;
        }

        Ok(())
    }
}

impl FromIterator<DhcpOption> for Options {
    fn from_iter<I: IntoIterator<Item = DhcpOption>>(iter: I) -> Self {
        let mut options = Options::new();
        for option in iter {
            let encoded = option.encode();
            options.insert(encoded[0], encoded[2..].to_vec());
        }
        options
    }
}

/// A typed DHCP option the server knows how to build or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// Gateways, default first.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    /// Subnet broadcast address handed to the client.
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    /// Seconds until the client starts renewing.
    RenewalTime(u32),
    /// Seconds until the client starts rebinding.
    RebindingTime(u32),
}

fn ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn seconds(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn address_list(data: &[u8]) -> Option<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return None;
    }
    Some(data.chunks_exact(4).filter_map(ipv4).collect())
}

fn encode_addresses(code: OptionCode, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let count = addrs.len().min(MAX_ADDRESSES_PER_OPTION);
    let mut result = vec![code as u8, (count * 4) as u8];
    for addr in addrs.iter().take(count) {
        result.extend_from_slice(&addr.octets());
    }
    result
}

fn encode_bytes(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(255);
    let mut result = vec![code, len as u8];
    result.extend_from_slice(&data[..len]);
    result
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
        };
        code as u8
    }

    /// Decodes a known option from its code and raw value.
    ///
    /// Returns `None` for codes the server does not interpret and for
    /// values whose length is wrong for the option, so a single bad option
    /// reads as absent instead of spoiling the whole packet.
    pub fn decode(code: u8, data: &[u8]) -> Option<Self> {
        const SUBNET_MASK: u8 = OptionCode::SubnetMask as u8;
        const ROUTER: u8 = OptionCode::Router as u8;
        const DNS_SERVER: u8 = OptionCode::DnsServer as u8;
        const HOSTNAME: u8 = OptionCode::Hostname as u8;
        const DOMAIN_NAME: u8 = OptionCode::DomainName as u8;
        const BROADCAST_ADDRESS: u8 = OptionCode::BroadcastAddress as u8;
        const REQUESTED_IP: u8 = OptionCode::RequestedIpAddress as u8;
        const LEASE_TIME: u8 = OptionCode::LeaseTime as u8;
        const OPTION_OVERLOAD: u8 = OptionCode::OptionOverload as u8;
        const MESSAGE_TYPE: u8 = OptionCode::MessageType as u8;
        const SERVER_IDENTIFIER: u8 = OptionCode::ServerIdentifier as u8;
        const PARAMETER_REQUEST_LIST: u8 = OptionCode::ParameterRequestList as u8;
        const RENEWAL_TIME: u8 = OptionCode::RenewalTime as u8;
        const REBINDING_TIME: u8 = OptionCode::RebindingTime as u8;

        match code {
            SUBNET_MASK => ipv4(data).map(Self::SubnetMask),
            ROUTER => address_list(data).map(Self::Router),
            DNS_SERVER => address_list(data).map(Self::DnsServer),
            HOSTNAME => Some(Self::Hostname(String::from_utf8_lossy(data).to_string())),
            DOMAIN_NAME => Some(Self::DomainName(String::from_utf8_lossy(data).to_string())),
            BROADCAST_ADDRESS => ipv4(data).map(Self::BroadcastAddress),
            REQUESTED_IP => ipv4(data).map(Self::RequestedIpAddress),
            LEASE_TIME => seconds(data).map(Self::LeaseTime),
            OPTION_OVERLOAD => match data {
                [flag] => OverloadFlag::try_from(*flag).ok().map(Self::OptionOverload),
                _ => None,
            },
            MESSAGE_TYPE => match data {
                [kind] => MessageType::try_from(*kind).ok().map(Self::MessageType),
                _ => None,
            },
            SERVER_IDENTIFIER => ipv4(data).map(Self::ServerIdentifier),
            PARAMETER_REQUEST_LIST => Some(Self::ParameterRequestList(data.to_vec())),
            RENEWAL_TIME => seconds(data).map(Self::RenewalTime),
            REBINDING_TIME => seconds(data).map(Self::RebindingTime),
            _ => None,
        }
    }

    /// Code, length and value bytes as they go on the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => encode_bytes(self.option_code(), &addr.octets()),
            Self::Router(addrs) => encode_addresses(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => encode_addresses(OptionCode::DnsServer, addrs),
            Self::Hostname(name) | Self::DomainName(name) => {
                encode_bytes(self.option_code(), name.as_bytes())
            }
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                encode_bytes(self.option_code(), &time.to_be_bytes())
            }
            Self::OptionOverload(flag) => {
                vec![OptionCode::OptionOverload as u8, 1, *flag as u8]
            }
            Self::MessageType(msg_type) => {
                vec![OptionCode::MessageType as u8, 1, *msg_type as u8]
            }
            Self::ParameterRequestList(params) => {
                encode_bytes(OptionCode::ParameterRequestList as u8, params)
            }
        }
    }
}
