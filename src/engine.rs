//! The DHCP state machine.
//!
//! The engine turns one decoded request into at most one reply, updating
//! the lease store along the way. It never touches the socket: every reply
//! goes through the [`DelayScheduler`].

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::events::EventLog;
use crate::lease::{Leases, sanitize_hostname};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, DhcpMessage, MessageKind};
use crate::scheduler::{DelayScheduler, Reply};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Option codes returned whether or not the client asked for them.
const ALWAYS_SENT: [OptionCode; 5] = [
    OptionCode::MessageType,
    OptionCode::ServerIdentifier,
    OptionCode::LeaseTime,
    OptionCode::RenewalTime,
    OptionCode::RebindingTime,
];

/// Shared handles the engine works with. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<Config>,
    leases: Leases,
    scheduler: DelayScheduler,
    events: Arc<EventLog>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        leases: Leases,
        scheduler: DelayScheduler,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            leases,
            scheduler,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn leases(&self) -> &Leases {
        &self.leases
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Handles one inbound message end to end.
    ///
    /// Pending replies for the same client are cancelled first, so a stale
    /// OFFER never follows the client's next move. The new reply, if any, is
    /// scheduled after the configured delay.
    pub async fn process(&self, message: &DhcpMessage) {
        if message.op != BOOTREQUEST {
            debug!("Ignoring op {} from {}", message.op, message.format_mac());
            return;
        }

        let client_id = message.client_id();
        // Not atomic with the schedule below. Two datagrams from one client
        // racing here may both be sent, which clients tolerate.
        let cancelled = self.scheduler.cancel_all_for(&client_id);
        if cancelled > 0 {
            debug!("Cancelled {} pending reply(s) for {}", cancelled, client_id);
        }

        if let Some(reply) = self.handle(message).await {
            debug!(
                "Holding reply for {} {:?} before sending to {}",
                client_id,
                self.config.reply_delay(),
                reply.destination
            );
            self.scheduler
                .schedule(client_id, reply, self.config.reply_delay());
        }
    }

    /// Runs the state machine for one message and returns the reply to
    /// send, without scheduling it.
    pub async fn handle(&self, message: &DhcpMessage) -> Option<Reply> {
        let Some(kind) = message.kind() else {
            warn!(
                "Dropping message with invalid message type from {}",
                message.format_mac()
            );
            return None;
        };

        info!("{} from {}", kind, message.format_mac());

        match kind {
            MessageKind::Bootp => self.handle_bootp(message).await,
            MessageKind::Dhcp(MessageType::Discover) => self.handle_discover(message).await,
            MessageKind::Dhcp(MessageType::Request) => self.handle_request(message).await,
            MessageKind::Dhcp(MessageType::Release) => {
                self.handle_release(message).await;
                None
            }
            MessageKind::Dhcp(MessageType::Decline) => {
                self.handle_decline(message).await;
                None
            }
            MessageKind::Dhcp(MessageType::Inform) => Some(self.handle_inform(message)),
            MessageKind::Dhcp(
                message_type @ (MessageType::Offer | MessageType::Ack | MessageType::Nak),
            ) => {
                warn!("Ignoring server message {} sent as a request", message_type);
                None
            }
        }
    }

    fn hostname(message: &DhcpMessage) -> Option<String> {
        message.hostname().as_deref().and_then(sanitize_hostname)
    }

    async fn handle_bootp(&self, message: &DhcpMessage) -> Option<Reply> {
        let mac = message.format_mac();
        let client_id = message.client_id();
        let wanted = Some(message.ciaddr).filter(|ciaddr| !ciaddr.is_unspecified());
        let hostname = Self::hostname(message);

        let address = match self
            .leases
            .reserve(&client_id, wanted, message.xid, hostname.clone())
            .await
        {
            Ok(address) => address,
            Err(error) => {
                self.reserve_failed(&mac, error);
                return None;
            }
        };

        if let Err(error) = self
            .leases
            .confirm(&client_id, address, message.xid, hostname)
            .await
        {
            warn!("Could not bind BOOTP client {}: {}", mac, error);
            return None;
        }

        let mut options = Vec::new();
        self.build_common_options(&mut options);
        let reply = DhcpMessage::bootp_reply(message, address, self.config.server_ip, options);

        info!("BOOTP reply {} to {}", address, mac);
        self.events.record(format!("BOOTP {} bound to {}", address, mac));

        Some(self.address(reply, message))
    }

    async fn handle_discover(&self, message: &DhcpMessage) -> Option<Reply> {
        let mac = message.format_mac();
        let client_id = message.client_id();

        let offered = match self
            .leases
            .reserve(
                &client_id,
                message.requested_ip(),
                message.xid,
                Self::hostname(message),
            )
            .await
        {
            Ok(address) => address,
            Err(error) => {
                self.reserve_failed(&mac, error);
                return None;
            }
        };

        let options =
            filter_options_by_prl(self.build_lease_options(), message.parameter_request_list());
        let offer = DhcpMessage::reply(
            message,
            MessageType::Offer,
            offered,
            self.config.server_ip,
            options,
        );

        info!("OFFER {} to {}", offered, mac);
        self.events.record(format!("offered {} to {}", offered, mac));

        Some(self.address(offer, message))
    }

    fn reserve_failed(&self, mac: &str, error: Error) {
        match error {
            Error::Exhausted => {
                warn!("Pool exhausted, no address for {}", mac);
                self.events
                    .record(format!("pool exhausted, ignored {}", mac));
            }
            error => warn!("Could not reserve an address for {}: {}", mac, error),
        }
    }

    async fn handle_request(&self, message: &DhcpMessage) -> Option<Reply> {
        let mac = message.format_mac();
        let client_id = message.client_id();

        match message.server_identifier() {
            Some(server_id) if server_id != self.config.server_ip => {
                info!("REQUEST from {} is for different server {}", mac, server_id);
                if let Some(lease) = self.leases.withdraw(&client_id).await {
                    self.events.record(format!(
                        "{} chose server {}, withdrew {}",
                        mac, server_id, lease.address
                    ));
                }
                return None;
            }
            Some(_) => {}
            None => {
                // INIT-REBOOT, RENEWING or REBINDING: stay silent about
                // clients we have never served.
                if self.leases.lookup(&client_id).await.is_none() {
                    debug!("REQUEST from unknown client {}, staying silent", mac);
                    return None;
                }
            }
        }

        let result = match (message.requested_ip(), message.ciaddr) {
            (Some(address), _) => {
                self.leases
                    .confirm(&client_id, address, message.xid, Self::hostname(message))
                    .await
            }
            (None, ciaddr) if !ciaddr.is_unspecified() => {
                self.leases.renew(&client_id, ciaddr, message.xid).await
            }
            (None, _) => {
                warn!("REQUEST from {} names no address", mac);
                return None;
            }
        };

        match result {
            Ok(lease) => {
                let options = filter_options_by_prl(
                    self.build_lease_options(),
                    message.parameter_request_list(),
                );
                let ack = DhcpMessage::reply(
                    message,
                    MessageType::Ack,
                    lease.address,
                    self.config.server_ip,
                    options,
                );

                info!(
                    "ACK {} to {} (lease: {} seconds)",
                    lease.address, mac, self.config.lease_duration_seconds
                );
                self.events
                    .record(format!("bound {} to {}", lease.address, mac));

                Some(self.address(ack, message))
            }
            Err(Error::Mismatch { reason, .. }) => Some(self.nak(message, &reason)),
            Err(error) => {
                warn!("REQUEST from {} failed: {}", mac, error);
                None
            }
        }
    }

    async fn handle_release(&self, message: &DhcpMessage) {
        let mac = message.format_mac();

        if message.ciaddr.is_unspecified() {
            warn!("RELEASE from {} with no ciaddr", mac);
            return;
        }

        match self
            .leases
            .release(&message.client_id(), Some(message.ciaddr))
            .await
        {
            Some(lease) => {
                info!("RELEASE from {} for {}", mac, lease.address);
                self.events
                    .record(format!("{} released {}", mac, lease.address));
            }
            None => warn!(
                "RELEASE from {} for {} does not match any lease",
                mac, message.ciaddr
            ),
        }
    }

    async fn handle_decline(&self, message: &DhcpMessage) {
        let mac = message.format_mac();
        let client_id = message.client_id();

        let Some(declined) = message.requested_ip() else {
            warn!("DECLINE from {} without a requested address", mac);
            return;
        };

        match self.leases.decline(&client_id, declined).await {
            Ok(_) => {
                warn!(
                    "DECLINE from {} for {} - marked IP as unavailable",
                    mac, declined
                );
                self.events
                    .record(format!("{} declined {}", mac, declined));
            }
            Err(error) => warn!("DECLINE from {} for {} rejected: {}", mac, declined, error),
        }
    }

    fn handle_inform(&self, message: &DhcpMessage) -> Reply {
        let options =
            filter_options_by_prl(self.build_inform_options(), message.parameter_request_list());
        let ack = DhcpMessage::reply(
            message,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            options,
        );

        info!("INFORM response to {}", message.format_mac());

        self.address(ack, message)
    }

    fn nak(&self, message: &DhcpMessage, reason: &str) -> Reply {
        let mac = message.format_mac();
        let nak = DhcpMessage::reply(
            message,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            vec![DhcpOption::ServerIdentifier(self.config.server_ip)],
        );

        warn!("NAK to {}: {}", mac, reason);
        self.events.record(format!("NAK to {}: {}", mac, reason));

        self.address(nak, message)
    }

    /// Picks the destination of `reply`.
    ///
    /// Relayed requests go back to the relay on the server port. NAKs,
    /// requests with the broadcast flag and clients without an address are
    /// answered by broadcast. Everything else is unicast to `ciaddr`.
    fn address(&self, reply: DhcpMessage, request: &DhcpMessage) -> Reply {
        let is_nak = reply.message_type() == Some(MessageType::Nak);

        let destination = if !request.giaddr.is_unspecified() {
            SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
        } else if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
            SocketAddrV4::new(self.config.broadcast_address, DHCP_CLIENT_PORT)
        } else {
            SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
        };

        Reply {
            message: reply,
            destination,
        }
    }

    fn build_common_options(&self, options: &mut Vec<DhcpOption>) {
        options.push(DhcpOption::SubnetMask(self.config.subnet_mask));

        if let Some(gateway) = self.config.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }

        if !self.config.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(self.config.dns_servers.clone()));
        }

        if let Some(ref domain) = self.config.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
    }

    fn build_lease_options(&self) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.config.server_ip),
            DhcpOption::LeaseTime(self.config.lease_duration_seconds),
        ];

        self.build_common_options(&mut options);

        options.push(DhcpOption::BroadcastAddress(self.config.subnet_broadcast()));
        options.push(DhcpOption::RenewalTime(self.config.renewal_time_seconds()));
        options.push(DhcpOption::RebindingTime(
            self.config.rebinding_time_seconds(),
        ));

        options
    }

    fn build_inform_options(&self) -> Vec<DhcpOption> {
        let mut options = vec![DhcpOption::ServerIdentifier(self.config.server_ip)];
        self.build_common_options(&mut options);
        options
    }
}

/// Keeps the options the client listed in option 55, plus the ones every
/// reply carries. Without a list everything is returned.
fn filter_options_by_prl(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options
        .into_iter()
        .filter(|option| {
            let code = option.option_code();
            ALWAYS_SENT.iter().any(|always| *always as u8 == code) || prl.contains(&code)
        })
        .collect()
}
