//! Packet codec for DHCP and plain BOOTP datagrams (RFC 951 / RFC 2131).
//!
//! Every message starts with the fixed 236-byte BOOTP header. DHCP messages
//! follow it with the magic cookie and a TLV option area; a datagram without
//! the cookie is read as plain BOOTP and carries no options.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +---------------+---------------+---------------+---------------+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                  ciaddr / yiaddr / siaddr / giaddr            |
//! +---------------------------------------------------------------+
//! |            chaddr (16) | sname (64) | file (128)              |
//! +---------------------------------------------------------------+
//! |           magic cookie (4) = 99.130.83.99   (DHCP only)       |
//! +---------------------------------------------------------------+
//! |                     options (variable, DHCP only)             |
//! +---------------------------------------------------------------+
//! ```

use std::fmt::Write;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::lease::ClientId;
use crate::options::{DhcpOption, MessageType, OptionCode, Options, OverloadFlag};

/// Present at offset 236 in DHCP messages, absent in plain BOOTP.
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const DHCP_CHADDR_OFFSET: usize = 28;
const DHCP_CHADDR_SIZE: usize = 16;
const DHCP_SNAME_OFFSET: usize = DHCP_CHADDR_OFFSET + DHCP_CHADDR_SIZE;
const DHCP_SNAME_SIZE: usize = 64;
const DHCP_FILE_OFFSET: usize = DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE;
const DHCP_FILE_SIZE: usize = 128;

/// Size of the fixed BOOTP header, without the magic cookie.
pub const BOOTP_HEADER_SIZE: usize = DHCP_FILE_OFFSET + DHCP_FILE_SIZE;

const DHCP_OPTIONS_OFFSET: usize = BOOTP_HEADER_SIZE + DHCP_MAGIC_COOKIE.len();

/// Minimum size of an encoded message, per the BOOTP relay requirement.
pub const MIN_ENCODED_SIZE: usize = 300;

/// 576 bytes is the minimum datagram every host must accept (RFC 791).
const ENCODE_CAPACITY: usize = 576;

/// Relay loop guard (RFC 1542 §4.1.1).
const MAX_HOPS: u8 = 16;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet.
pub const HLEN_ETHERNET: u8 = 6;

const BROADCAST_FLAG: u16 = 0x8000;

/// What a message is, as far as the protocol engine is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries a valid option 53.
    Dhcp(MessageType),
    /// No option 53 at all: a legacy BOOTP exchange.
    Bootp,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dhcp(message_type) => write!(f, "{}", message_type),
            Self::Bootp => write!(f, "BOOTP"),
        }
    }
}

/// A decoded DHCP or BOOTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    /// Operation code: [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 is the broadcast flag.
    pub flags: u16,
    /// Client address, filled in by bound/renewing clients.
    pub ciaddr: Ipv4Addr,
    /// Address being assigned to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Options,
}

impl DhcpMessage {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if:
    /// - the datagram is shorter than the 236-byte BOOTP header
    /// - the hop count exceeds 16
    /// - the hardware length is larger than `chaddr` or wrong for Ethernet
    /// - an option's declared length overruns the buffer
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BOOTP_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                BOOTP_HEADER_SIZE
            )));
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        if hops > MAX_HOPS {
            return Err(Error::MalformedPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        // The hardware address is the lease key, so it cannot be empty.
        if hlen == 0 || hlen as usize > DHCP_CHADDR_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Hardware length {} outside 1..={}",
                hlen, DHCP_CHADDR_SIZE
            )));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::MalformedPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; DHCP_CHADDR_SIZE];
        chaddr.copy_from_slice(&data[DHCP_CHADDR_OFFSET..DHCP_SNAME_OFFSET]);

        let mut sname = [0u8; DHCP_SNAME_SIZE];
        sname.copy_from_slice(&data[DHCP_SNAME_OFFSET..DHCP_FILE_OFFSET]);

        let mut file = [0u8; DHCP_FILE_SIZE];
        file.copy_from_slice(&data[DHCP_FILE_OFFSET..BOOTP_HEADER_SIZE]);

        let mut options = Options::new();
        let has_cookie = data.len() >= DHCP_OPTIONS_OFFSET
            && data[BOOTP_HEADER_SIZE..DHCP_OPTIONS_OFFSET] == DHCP_MAGIC_COOKIE;

        if has_cookie {
            options.parse_into(&data[DHCP_OPTIONS_OFFSET..])?;

            let overload = options
                .get(OptionCode::OptionOverload as u8)
                .and_then(|value| DhcpOption::decode(OptionCode::OptionOverload as u8, value));

            if let Some(DhcpOption::OptionOverload(flag)) = overload {
                if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                    options.parse_into(&file)?;
                }
                if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                    options.parse_into(&sname)?;
                }
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encodes the message for transmission.
    ///
    /// Writes the fixed header, the magic cookie, option 53 first when
    /// present, the remaining options in insertion order, End, and pads the
    /// result to [`MIN_ENCODED_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ENCODE_CAPACITY);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        let message_type = OptionCode::MessageType as u8;
        if let Some(value) = self.options.get(message_type) {
            push_option(&mut packet, message_type, value);
        }
        for (code, value) in self.options.iter().filter(|(code, _)| *code != message_type) {
            push_option(&mut packet, code, value);
        }

        packet.push(OptionCode::End as u8);

        if packet.len() < MIN_ENCODED_SIZE {
            packet.resize(MIN_ENCODED_SIZE, 0);
        }

        packet
    }

    fn typed(&self, code: OptionCode) -> Option<DhcpOption> {
        let code = code as u8;
        self.options
            .get(code)
            .and_then(|value| DhcpOption::decode(code, value))
    }

    /// Returns the DHCP message type (Option 53) if present and valid.
    pub fn message_type(&self) -> Option<MessageType> {
        match self.typed(OptionCode::MessageType)? {
            DhcpOption::MessageType(message_type) => Some(message_type),
            _ => None,
        }
    }

    /// Infers the kind of message.
    ///
    /// Returns `None` when option 53 is present but unusable, so the caller
    /// can drop the datagram.
    pub fn kind(&self) -> Option<MessageKind> {
        if self.options.contains(OptionCode::MessageType as u8) {
            self.message_type().map(MessageKind::Dhcp)
        } else {
            Some(MessageKind::Bootp)
        }
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        match self.typed(OptionCode::RequestedIpAddress)? {
            DhcpOption::RequestedIpAddress(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        match self.typed(OptionCode::ServerIdentifier)? {
            DhcpOption::ServerIdentifier(ip) => Some(ip),
            _ => None,
        }
    }

    /// Option 12, lossily decoded as UTF-8.
    pub fn hostname(&self) -> Option<String> {
        match self.typed(OptionCode::Hostname)? {
            DhcpOption::Hostname(name) => Some(name),
            _ => None,
        }
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.get(OptionCode::ParameterRequestList as u8)
    }

    /// Option 51. On a reply this is the granted lease time.
    pub fn requested_lease_time(&self) -> Option<u32> {
        match self.typed(OptionCode::LeaseTime)? {
            DhcpOption::LeaseTime(seconds) => Some(seconds),
            _ => None,
        }
    }

    /// The first `hlen` bytes of `chaddr`.
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    /// `chaddr` in `aa:bb:cc` form, for logs.
    pub fn format_mac(&self) -> String {
        let bytes = self.chaddr_bytes();
        let mut result = String::with_capacity(bytes.len() * 3);
        for (index, byte) in bytes.iter().enumerate() {
            if index > 0 {
                result.push(':');
            }
            let _ = write!(result, "{:02x}", byte);
        }
        result
    }

    /// The key the lease table uses for this client: its hardware address.
    pub fn client_id(&self) -> ClientId {
        ClientId::from(self.chaddr_bytes())
    }

    /// Bit 15 of `flags`: the client cannot take unicast before it is configured.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Builds a DHCP reply to `request`.
    ///
    /// The message type is always stored first. `xid`, `flags`, `giaddr`,
    /// `chaddr`, `htype` and `hlen` are copied from the request; `ciaddr` is
    /// echoed only on ACK, as RFC 2131 table 3 requires.
    pub fn reply(
        request: &DhcpMessage,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let ciaddr = match message_type {
            MessageType::Ack => request.ciaddr,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let all_options = std::iter::once(DhcpOption::MessageType(message_type))
            .chain(options)
            .collect();

        Self {
            ciaddr,
            options: all_options,
            ..Self::bootp_reply(request, your_ip, server_ip, Vec::new())
        }
    }

    /// Builds a BOOTP reply (no message type option) for a legacy client.
    pub fn bootp_reply(
        request: &DhcpMessage,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: request.ciaddr,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; DHCP_SNAME_SIZE],
            file: [0u8; DHCP_FILE_SIZE],
            options: options.into_iter().collect(),
        }
    }
}

fn push_option(packet: &mut Vec<u8>, code: u8, value: &[u8]) {
    let len = value.len().min(255);
    packet.push(code);
    packet.push(len as u8);
    packet.extend_from_slice(&value[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_packet(message_type: MessageType, with_options: bool) -> Vec<u8> {
        let mut packet = vec![0u8; 350];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = 240;
        packet[index] = OptionCode::MessageType as u8;
        packet[index + 1] = 1;
        packet[index + 2] = message_type as u8;
        index += 3;

        if with_options {
            packet[index] = OptionCode::RequestedIpAddress as u8;
            packet[index + 1] = 4;
            packet[index + 2..index + 6].copy_from_slice(&[10, 0, 0, 11]);
            index += 6;

            packet[index] = OptionCode::Hostname as u8;
            packet[index + 1] = 9;
            packet[index + 2..index + 11].copy_from_slice(b"test-host");
            index += 11;
        }

        packet[index] = OptionCode::End as u8;
        packet
    }

    #[test]
    fn test_decode_discover() {
        let data = create_test_packet(MessageType::Discover, false);
        let message = DhcpMessage::decode(&data).unwrap();

        assert_eq!(message.op, BOOTREQUEST);
        assert_eq!(message.xid, 0x12345678);
        assert!(message.is_broadcast());
        assert_eq!(message.kind(), Some(MessageKind::Dhcp(MessageType::Discover)));
        assert_eq!(message.format_mac(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(
            message.client_id(),
            ClientId::from(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff][..])
        );
    }

    #[test]
    fn test_decode_with_options() {
        let data = create_test_packet(MessageType::Request, true);
        let message = DhcpMessage::decode(&data).unwrap();

        assert_eq!(message.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 11)));
        assert_eq!(message.hostname().as_deref(), Some("test-host"));
    }

    #[test]
    fn test_short_packets_rejected() {
        assert!(matches!(
            DhcpMessage::decode(&[0u8; 100]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(DhcpMessage::decode(&[0u8; BOOTP_HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_missing_cookie_decodes_as_bootp() {
        let mut data = vec![0u8; 300];
        data[0] = BOOTREQUEST;
        data[1] = HTYPE_ETHERNET;
        data[2] = HLEN_ETHERNET;
        data[240] = OptionCode::MessageType as u8;

        let message = DhcpMessage::decode(&data).unwrap();
        assert!(message.options.is_empty());
        assert_eq!(message.kind(), Some(MessageKind::Bootp));

        let header_only = DhcpMessage::decode(&data[..BOOTP_HEADER_SIZE]).unwrap();
        assert_eq!(header_only.kind(), Some(MessageKind::Bootp));
    }

    #[test]
    fn test_invalid_message_type_has_no_kind() {
        let mut data = create_test_packet(MessageType::Discover, false);
        data[242] = 42;
        let message = DhcpMessage::decode(&data).unwrap();
        assert_eq!(message.message_type(), None);
        assert_eq!(message.kind(), None);
    }

    #[test]
    fn test_hlen_validation() {
        let mut packet = create_test_packet(MessageType::Discover, false);
        packet[2] = 7;
        assert!(DhcpMessage::decode(&packet).is_err());

        packet[1] = 6;
        packet[2] = 17;
        assert!(DhcpMessage::decode(&packet).is_err());

        packet[2] = 16;
        assert!(DhcpMessage::decode(&packet).is_ok());

        packet[2] = 1;
        assert!(DhcpMessage::decode(&packet).is_ok());
    }

    #[test]
    fn test_empty_hardware_address_rejected() {
        let mut packet = create_test_packet(MessageType::Discover, false);
        packet[1] = 6;
        packet[2] = 0;
        assert!(matches!(
            DhcpMessage::decode(&packet),
            Err(Error::MalformedPacket(_))
        ));

        let mut bootp = vec![0u8; BOOTP_HEADER_SIZE];
        bootp[0] = BOOTREQUEST;
        assert!(DhcpMessage::decode(&bootp).is_err());
    }

    #[test]
    fn test_hops_limit() {
        let mut packet = create_test_packet(MessageType::Discover, false);
        packet[3] = 17;
        assert!(DhcpMessage::decode(&packet).is_err());

        packet[3] = 16;
        assert!(DhcpMessage::decode(&packet).is_ok());
    }

    #[test]
    fn test_truncated_option_data() {
        let mut packet = vec![0u8; DHCP_OPTIONS_OFFSET + 4];
        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        packet[240] = OptionCode::LeaseTime as u8;
        packet[241] = 4;

        assert!(matches!(
            DhcpMessage::decode(&packet),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_duplicate_options_keep_first() {
        let mut packet = vec![0u8; DHCP_OPTIONS_OFFSET + 10];
        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        packet[240] = OptionCode::MessageType as u8;
        packet[241] = 1;
        packet[242] = MessageType::Discover as u8;
        packet[243] = OptionCode::MessageType as u8;
        packet[244] = 1;
        packet[245] = MessageType::Request as u8;
        packet[246] = OptionCode::End as u8;

        let message = DhcpMessage::decode(&packet).unwrap();
        assert_eq!(message.message_type(), Some(MessageType::Discover));
        assert_eq!(message.options.len(), 1);
    }

    #[test]
    fn test_option_overload_file() {
        let mut packet = create_test_packet(MessageType::Discover, false);

        packet[243] = OptionCode::OptionOverload as u8;
        packet[244] = 1;
        packet[245] = OverloadFlag::File as u8;
        packet[246] = OptionCode::End as u8;

        packet[108] = OptionCode::Hostname as u8;
        packet[109] = 8;
        packet[110..118].copy_from_slice(b"filehost");
        packet[118] = OptionCode::End as u8;

        let message = DhcpMessage::decode(&packet).unwrap();
        assert_eq!(message.hostname().as_deref(), Some("filehost"));
    }

    #[test]
    fn test_unknown_options_kept_raw() {
        let mut packet = create_test_packet(MessageType::Discover, false);
        packet[243] = 200;
        packet[244] = 4;
        packet[245..249].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        packet[249] = OptionCode::End as u8;

        let message = DhcpMessage::decode(&packet).unwrap();
        assert_eq!(message.options.get(200), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
    }

    #[test]
    fn test_reply_drops_request_options() {
        let mut packet = create_test_packet(MessageType::Discover, true);
        packet[260] = 200;
        packet[261] = 1;
        packet[262] = 7;
        packet[263] = OptionCode::End as u8;
        let request = DhcpMessage::decode(&packet).unwrap();
        assert!(request.options.contains(200));

        let offer = DhcpMessage::reply(
            &request,
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 0, 11),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![DhcpOption::LeaseTime(600)],
        );

        assert!(!offer.options.contains(200));
        assert!(!offer.options.contains(OptionCode::Hostname as u8));
        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, request.xid);
        assert_eq!(offer.chaddr, request.chaddr);
        assert_eq!(offer.flags, request.flags);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
    }

    #[test]
    fn test_encode_writes_message_type_first() {
        let request = DhcpMessage::decode(&create_test_packet(MessageType::Request, false)).unwrap();
        let mut ack = DhcpMessage::reply(
            &request,
            MessageType::Ack,
            Ipv4Addr::new(10, 0, 0, 11),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
                DhcpOption::LeaseTime(600),
            ],
        );
        // Force the message type to the back of the map; encode must still lead with it.
        let message_type = ack.options.remove(OptionCode::MessageType as u8).unwrap();
        ack.options.insert(OptionCode::MessageType as u8, message_type);

        let encoded = ack.encode();
        assert_eq!(&encoded[236..240], &DHCP_MAGIC_COOKIE);
        assert_eq!(&encoded[240..243], &[53, 1, MessageType::Ack as u8]);
        assert_eq!(&encoded[243..249], &[54, 4, 10, 0, 0, 1]);
        assert_eq!(&encoded[249..255], &[51, 4, 0, 0, 2, 88]);
        assert_eq!(encoded[255], OptionCode::End as u8);
        assert_eq!(encoded.len(), MIN_ENCODED_SIZE);
    }

    #[test]
    fn test_reply_ciaddr_only_on_ack() {
        let mut data = create_test_packet(MessageType::Request, false);
        data[12..16].copy_from_slice(&[10, 0, 0, 11]);
        let request = DhcpMessage::decode(&data).unwrap();
        let server = Ipv4Addr::new(10, 0, 0, 1);

        let ack = DhcpMessage::reply(&request, MessageType::Ack, request.ciaddr, server, vec![]);
        assert_eq!(ack.ciaddr, Ipv4Addr::new(10, 0, 0, 11));

        let nak = DhcpMessage::reply(
            &request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server,
            vec![],
        );
        assert_eq!(nak.ciaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_bootp_reply_has_no_message_type() {
        let request = DhcpMessage::decode(&create_test_packet(MessageType::Discover, false)).unwrap();
        let reply = DhcpMessage::bootp_reply(
            &request,
            Ipv4Addr::new(10, 0, 0, 11),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))],
        );

        assert!(reply.message_type().is_none());
        assert_eq!(reply.kind(), Some(MessageKind::Bootp));
        assert!(reply.options.contains(OptionCode::SubnetMask as u8));
    }

    #[test]
    fn test_encode_produces_correct_offsets() {
        let message = DhcpMessage {
            op: BOOTREPLY,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 3,
            xid: 0x12345678,
            secs: 999,
            flags: 0x8000,
            ciaddr: Ipv4Addr::new(10, 0, 0, 10),
            yiaddr: Ipv4Addr::new(10, 0, 0, 20),
            siaddr: Ipv4Addr::new(10, 0, 0, 1),
            giaddr: Ipv4Addr::new(10, 0, 2, 1),
            chaddr: [
                0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Options::new(),
        };

        let encoded = message.encode();

        assert_eq!(encoded[0], BOOTREPLY);
        assert_eq!(encoded[3], 3);
        assert_eq!(&encoded[4..8], &0x12345678u32.to_be_bytes());
        assert_eq!(&encoded[8..10], &999u16.to_be_bytes());
        assert_eq!(&encoded[10..12], &0x8000u16.to_be_bytes());
        assert_eq!(&encoded[12..16], &[10, 0, 0, 10]);
        assert_eq!(&encoded[16..20], &[10, 0, 0, 20]);
        assert_eq!(&encoded[20..24], &[10, 0, 0, 1]);
        assert_eq!(&encoded[24..28], &[10, 0, 2, 1]);
        assert_eq!(&encoded[28..34], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&encoded[236..240], &DHCP_MAGIC_COOKIE);

        let decoded = DhcpMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.giaddr, message.giaddr);
        assert_eq!(decoded.kind(), Some(MessageKind::Bootp));
    }
}
