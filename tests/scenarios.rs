use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use slowlease::options::Options;
use slowlease::packet::{BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET};
use slowlease::{
    ClientId, Config, DelayScheduler, DhcpMessage, DhcpOption, Engine, EventLog, LeaseState,
    Leases, MessageType, Reply,
};

const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn scenario_config() -> Config {
    Config {
        server_ip: SERVER,
        gateway: Some(SERVER),
        dns_servers: vec![SERVER],
        pool_start: Ipv4Addr::new(10, 0, 0, 10),
        pool_end: Ipv4Addr::new(10, 0, 0, 12),
        reply_delay_seconds: 10,
        ..Config::default()
    }
}

fn start(config: Config) -> (Engine, mpsc::UnboundedReceiver<Reply>) {
    config.validate().unwrap();
    let leases = Leases::new(&config).unwrap();
    let (scheduler, rx) = DelayScheduler::channel();
    let engine = Engine::new(
        Arc::new(config),
        leases,
        scheduler,
        Arc::new(EventLog::default()),
    );
    (engine, rx)
}

fn mac(last: u8) -> [u8; 6] {
    [0x02, 0x00, 0x5e, 0x10, 0x00, last]
}

fn message(message_type: MessageType, last: u8, xid: u32, options: Vec<DhcpOption>) -> DhcpMessage {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&mac(last));
    let options: Options = std::iter::once(DhcpOption::MessageType(message_type))
        .chain(options)
        .collect();

    DhcpMessage {
        op: BOOTREQUEST,
        htype: HTYPE_ETHERNET,
        hlen: HLEN_ETHERNET,
        hops: 0,
        xid,
        secs: 0,
        flags: 0,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        sname: [0u8; 64],
        file: [0u8; 128],
        options,
    }
}

fn discover(last: u8, xid: u32) -> DhcpMessage {
    message(MessageType::Discover, last, xid, vec![])
}

fn request(last: u8, xid: u32, address: Ipv4Addr) -> DhcpMessage {
    message(
        MessageType::Request,
        last,
        xid,
        vec![
            DhcpOption::RequestedIpAddress(address),
            DhcpOption::ServerIdentifier(SERVER),
        ],
    )
}

fn client(last: u8) -> ClientId {
    ClientId::from(&mac(last)[..])
}

/// Sends `message` through the full path and waits for the delayed reply.
async fn exchange(
    engine: &Engine,
    rx: &mut mpsc::UnboundedReceiver<Reply>,
    message: &DhcpMessage,
) -> Reply {
    engine.process(message).await;
    rx.recv().await.unwrap()
}

/// Collects every reply released until the wire stays quiet for 30 seconds.
async fn drain_replies(engine: &Engine, rx: &mut mpsc::UnboundedReceiver<Reply>) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Ok(Some(reply)) = timeout(Duration::from_secs(30), rx.recv()).await {
        replies.push(reply);
    }
    assert_eq!(engine.scheduler().pending_count(), 0);
    replies
}

#[tokio::test(start_paused = true)]
async fn test_offer_and_ack_agree_on_address() {
    let (engine, mut rx) = start(scenario_config());

    let offer = exchange(&engine, &mut rx, &discover(1, 0xdead)).await;
    assert_eq!(offer.message.message_type(), Some(MessageType::Offer));

    let ack = exchange(&engine, &mut rx, &request(1, 0xdead, offer.message.yiaddr)).await;
    assert_eq!(ack.message.message_type(), Some(MessageType::Ack));
    assert_eq!(ack.message.yiaddr, offer.message.yiaddr);

    let lease = engine.leases().lookup(&client(1)).await.unwrap();
    assert_eq!(lease.state, LeaseState::Bound);
    assert_eq!(lease.address, offer.message.yiaddr);
}

#[tokio::test(start_paused = true)]
async fn test_stale_transaction_gets_nak() {
    let (engine, mut rx) = start(scenario_config());

    let offer = exchange(&engine, &mut rx, &discover(1, 100)).await;
    let table_before = engine.leases().list().await;

    let nak = exchange(&engine, &mut rx, &request(1, 101, offer.message.yiaddr)).await;

    assert_eq!(nak.message.message_type(), Some(MessageType::Nak));
    assert_eq!(engine.leases().list().await, table_before);
}

#[tokio::test(start_paused = true)]
async fn test_released_address_goes_to_next_client() {
    let config = Config {
        pool_end: Ipv4Addr::new(10, 0, 0, 10),
        ..scenario_config()
    };
    let (engine, mut rx) = start(config);

    let offer = exchange(&engine, &mut rx, &discover(1, 1)).await;
    let address = offer.message.yiaddr;
    exchange(&engine, &mut rx, &request(1, 1, address)).await;

    engine.process(&discover(2, 2)).await;
    assert!(timeout(Duration::from_secs(30), rx.recv()).await.is_err());

    let mut release = message(MessageType::Release, 1, 3, vec![]);
    release.ciaddr = address;
    engine.process(&release).await;
    assert!(engine.leases().lookup(&client(1)).await.is_none());

    let offer = exchange(&engine, &mut rx, &discover(2, 4)).await;
    assert_eq!(offer.message.yiaddr, address);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_clears_expired_lease_without_traffic() {
    let (engine, mut rx) = start(scenario_config());

    let offer = exchange(&engine, &mut rx, &discover(1, 1)).await;
    exchange(&engine, &mut rx, &request(1, 1, offer.message.yiaddr)).await;
    assert_eq!(engine.leases().list().await.len(), 1);

    let reaped = engine
        .leases()
        .reap(Utc::now() + TimeDelta::seconds(301))
        .await;

    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].state, LeaseState::Expired);
    assert!(engine.leases().list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reply_never_observed_before_delay() {
    let (engine, mut rx) = start(scenario_config());
    let received = Instant::now();

    engine.process(&discover(1, 1)).await;

    assert!(timeout(Duration::from_millis(9_999), rx.recv()).await.is_err());
    let offer = rx.recv().await.unwrap();
    assert!(received.elapsed() >= Duration::from_secs(10));
    assert_eq!(offer.message.message_type(), Some(MessageType::Offer));
}

#[tokio::test(start_paused = true)]
async fn test_request_before_delay_cancels_pending_offer() {
    let (engine, mut rx) = start(scenario_config());

    engine.process(&discover(1, 1)).await;
    tokio::time::sleep(Duration::from_secs(4)).await;

    // The client moves on to REQUEST before our OFFER is released.
    let reserved = engine.leases().lookup(&client(1)).await.unwrap().address;
    engine.process(&request(1, 1, reserved)).await;

    let replies = drain_replies(&engine, &mut rx).await;
    let kinds: Vec<_> = replies
        .iter()
        .map(|reply| reply.message.message_type())
        .collect();
    assert_eq!(kinds, vec![Some(MessageType::Ack)]);
}

#[tokio::test(start_paused = true)]
async fn test_three_address_pool_with_four_clients() {
    let (engine, mut rx) = start(scenario_config());

    let mut tasks = Vec::new();
    for last in 1..=4u8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.process(&discover(last, u32::from(last))).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let replies = drain_replies(&engine, &mut rx).await;
    assert_eq!(replies.len(), 3);

    let addresses: HashSet<_> = replies.iter().map(|reply| reply.message.yiaddr).collect();
    assert_eq!(addresses.len(), 3);

    let offered = engine
        .leases()
        .list()
        .await
        .into_iter()
        .filter(|lease| lease.state == LeaseState::Offered)
        .count();
    assert_eq!(offered, 3);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_discover_keeps_one_reservation() {
    let (engine, mut rx) = start(scenario_config());

    let first = exchange(&engine, &mut rx, &discover(1, 1)).await;
    assert_eq!(first.message.yiaddr, Ipv4Addr::new(10, 0, 0, 10));

    let second = exchange(&engine, &mut rx, &discover(1, 2)).await;
    assert_eq!(second.message.yiaddr, first.message.yiaddr);

    let leases: Vec<_> = engine
        .leases()
        .list()
        .await
        .into_iter()
        .filter(|lease| lease.client_id == client(1))
        .collect();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].state, LeaseState::Offered);
    assert_eq!(leases[0].transaction_id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_bound_addresses_stay_unique() {
    let (engine, mut rx) = start(scenario_config());

    for last in 1..=3u8 {
        let offer = exchange(&engine, &mut rx, &discover(last, u32::from(last))).await;
        exchange(
            &engine,
            &mut rx,
            &request(last, u32::from(last), offer.message.yiaddr),
        )
        .await;
    }

    // A client asking for someone else's address is offered nothing else.
    let taken = Ipv4Addr::new(10, 0, 0, 11);
    let mut greedy = discover(4, 9);
    greedy.options = std::iter::once(DhcpOption::MessageType(MessageType::Discover))
        .chain(std::iter::once(DhcpOption::RequestedIpAddress(taken)))
        .collect();
    engine.process(&greedy).await;

    assert!(drain_replies(&engine, &mut rx).await.is_empty());

    let leases = engine.leases().list().await;
    let addresses: HashSet<_> = leases.iter().map(|lease| lease.address).collect();
    assert_eq!(addresses.len(), leases.len());
    assert!(leases.iter().all(|lease| lease.state == LeaseState::Bound));
}
