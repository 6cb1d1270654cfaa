use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admin::AdminConsole;
use crate::config::Config;
use crate::engine::{DHCP_SERVER_PORT, Engine};
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::lease::Leases;
use crate::packet::DhcpMessage;
use crate::scheduler::{DelayScheduler, Reply};

const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    engine: Engine,
    socket: Arc<UdpSocket>,
    outbound: mpsc::UnboundedReceiver<Reply>,
}

/// Aborts the server's background tasks and pending replies when dropped.
struct BackgroundTasks {
    tasks: Vec<JoinHandle<()>>,
    scheduler: DelayScheduler,
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.scheduler.shutdown();
    }
}

impl DhcpServer {
    /// Validates `config` and binds the DHCP socket on port 67.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for a bad configuration and
    /// [`Error::Socket`] if the port cannot be bound.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let socket = Self::create_socket(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            DHCP_SERVER_PORT,
        ))?;
        Self::with_socket(config, socket)
    }

    /// Builds the server around an already bound socket.
    pub fn with_socket(config: Config, socket: UdpSocket) -> Result<Self> {
        config.validate()?;
        let leases = Leases::new(&config)?;
        let (scheduler, outbound) = DelayScheduler::channel();
        let engine = Engine::new(
            Arc::new(config),
            leases,
            scheduler,
            Arc::new(EventLog::default()),
        );

        let config = engine.config();
        if let Ok(address) = socket.local_addr() {
            info!("DHCP server {} listening on {}", config.server_ip, address);
        }
        info!(
            "IP pool: {} - {} ({} addresses, {} excluded)",
            config.pool_start,
            config.pool_end,
            config.pool_size(),
            config.excluded_addresses.len()
        );
        info!("Replies are held for {:?}", config.reply_delay());

        Ok(Self {
            engine,
            socket: Arc::new(socket),
            outbound,
        })
    }

    pub fn create_socket(bind_addr: SocketAddrV4) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs the listener until the socket or admin listener fails.
    ///
    /// Starts the transmit task, the reaper and the admin console, then
    /// hands every datagram to its own task.
    pub async fn run(self) -> Result<()> {
        let Self {
            engine,
            socket,
            outbound,
        } = self;

        let admin_address = engine.config().admin_bind_address;
        let admin_listener = TcpListener::bind(admin_address).await.map_err(|error| {
            Error::Socket(format!(
                "Failed to bind admin console to {}: {}",
                admin_address, error
            ))
        })?;

        let _background = BackgroundTasks {
            tasks: vec![
                spawn_transmitter(Arc::clone(&socket), outbound),
                spawn_reaper(engine.clone(), engine.config().reap_interval()),
                spawn_admin(AdminConsole::new(engine.clone()), admin_listener),
            ],
            scheduler: engine.scheduler().clone(),
        };

        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let engine = engine.clone();

                    tokio::spawn(async move {
                        handle_datagram(&engine, &data, source).await;
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

async fn handle_datagram(engine: &Engine, data: &[u8], source: SocketAddr) {
    match DhcpMessage::decode(data) {
        Ok(message) => engine.process(&message).await,
        Err(error) => warn!("Dropping packet from {}: {}", source, error),
    }
}

/// Drains the scheduler's channel onto the socket.
fn spawn_transmitter(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Reply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = outbound.recv().await {
            let encoded = reply.message.encode();
            let kind = reply
                .message
                .kind()
                .map(|kind| kind.to_string())
                .unwrap_or_default();

            match socket.send_to(&encoded, reply.destination).await {
                Ok(_) => debug!("Sent {} to {}", kind, reply.destination),
                Err(error) => warn!("Failed to send {} to {}: {}", kind, reply.destination, error),
            }
        }
    })
}

/// Periodically removes expired leases, independent of request traffic.
pub fn spawn_reaper(engine: Engine, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for lease in engine.leases().reap(Utc::now()).await {
                info!(
                    "Lease {} for {} expired ({})",
                    lease.address, lease.client_id, lease.state
                );
                engine.events().record(format!(
                    "{} expired for {}",
                    lease.address, lease.client_id
                ));
            }
        }
    })
}

fn spawn_admin(console: AdminConsole, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = console.serve(listener).await {
            error!("Admin console stopped: {}", error);
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::lease::{ClientId, LeaseTable, LeaseTimes};
    use crate::pool::AddressPool;

    fn test_config() -> Config {
        Config {
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            gateway: None,
            pool_start: Ipv4Addr::new(10, 0, 0, 10),
            pool_end: Ipv4Addr::new(10, 0, 0, 20),
            ..Config::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_binding() {
        let config = Config {
            reply_delay_seconds: -5,
            ..test_config()
        };
        assert!(matches!(
            DhcpServer::new(config),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_with_socket_on_ephemeral_port() {
        let socket =
            DhcpServer::create_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let server = DhcpServer::with_socket(test_config(), socket).unwrap();
        assert_eq!(server.engine().config().pool_size(), 11);
        assert!(server.engine().leases().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let socket =
            DhcpServer::create_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let server = DhcpServer::with_socket(test_config(), socket).unwrap();
        let source = SocketAddr::from(([127, 0, 0, 1], 68));

        handle_datagram(server.engine(), &[1, 2, 3], source).await;

        assert!(server.engine().leases().list().await.is_empty());
        assert_eq!(server.engine().scheduler().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_without_traffic() {
        let config = test_config();
        let pool = AddressPool::from_config(&config).unwrap();
        let mut table = LeaseTable::new(pool, LeaseTimes::from_config(&config));
        let client = ClientId::from(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01][..]);
        table
            .reserve(&client, None, 1, None, Utc::now() - TimeDelta::hours(1))
            .unwrap();

        let (scheduler, _rx) = DelayScheduler::channel();
        let engine = Engine::new(
            Arc::new(config),
            Leases::from_table(table),
            scheduler,
            Arc::new(EventLog::default()),
        );
        assert_eq!(engine.leases().list().await.len(), 1);

        let reaper = spawn_reaper(engine.clone(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(engine.leases().list().await.is_empty());
        let events = engine.events().snapshot(Utc::now());
        assert_eq!(events.len(), 1);
        assert!(events[0].message.starts_with("10.0.0.10 expired"));

        reaper.abort();
    }
}
