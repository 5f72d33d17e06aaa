use crate::config::Settings;
use crate::device::{DeviceIdentity, LogAdvertiser, PresenceAdvertiser, ServiceEndpoint};
use crate::entity_resolver::EntityResolver;
use crate::home_assistant::HomeAssistantAPI;
use crate::modbus_server::{self, MeterService};
use crate::poll_loop::{PollLoop, PollSettings};
use crate::push_notifier::PushNotifier;
use crate::rpc::RpcHandler;
use crate::sensor_source::SensorSource;
use crate::snapshot_cache::SnapshotCache;
use crate::udp_server;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Owns the poll loop and every listener. Dropping it without calling
/// [`Coordinator::shutdown`] leaves the tasks running.
pub struct Coordinator {
    cache: SnapshotCache,
    identity: Arc<DeviceIdentity>,
    modbus_addr: Option<SocketAddr>,
    udp_addrs: Vec<SocketAddr>,
    websocket_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Starts against the Home Assistant instance named in `settings`.
    pub async fn start(settings: &Settings) -> anyhow::Result<Self> {
        settings.validate()?;
        let ha = &settings.home_assistant;
        let source = HomeAssistantAPI::new(&ha.url, &ha.token, ha.timeout())?;
        Self::start_with_source(settings, Arc::new(source)).await
    }

    /// Binds every enabled listener, then spawns the servers and the poll
    /// loop. A bind failure aborts startup.
    pub async fn start_with_source(
        settings: &Settings,
        source: Arc<dyn SensorSource>,
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        let device = &settings.device;
        let identity = Arc::new(DeviceIdentity::new(
            &device.device_id,
            &device.name,
            &device.mac_address,
        )?);
        let resolver = EntityResolver::new(
            settings.discovery.slot_overrides()?,
            settings.discovery.enabled,
        )?;
        let (cache, publisher) = SnapshotCache::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = RpcHandler::new(identity.clone(), cache.clone());

        let mut tasks = Vec::new();
        let mut endpoints = Vec::new();
        let servers = &settings.servers;

        let mut modbus_addr = None;
        if servers.modbus.enabled {
            let listener =
                TcpListener::bind(format!("{}:{}", servers.modbus.host, servers.modbus.port))
                    .await?;
            let addr = listener.local_addr()?;
            let service = MeterService::new(cache.clone(), identity.clone());
            tasks.push(spawn_server(
                "modbus",
                modbus_server::serve(listener, service, shutdown_rx.clone()),
            ));
            endpoints.push(ServiceEndpoint {
                protocol: "modbus",
                addr,
            });
            modbus_addr = Some(addr);
        }

        let mut udp_addrs = Vec::new();
        if servers.udp.enabled {
            for port in &servers.udp.ports {
                let socket = UdpSocket::bind(format!("{}:{}", servers.udp.host, port)).await?;
                let addr = socket.local_addr()?;
                tasks.push(spawn_server(
                    "udp",
                    udp_server::serve(socket, handler.clone(), shutdown_rx.clone()),
                ));
                endpoints.push(ServiceEndpoint {
                    protocol: "udp",
                    addr,
                });
                udp_addrs.push(addr);
            }
        }

        let mut websocket_addr = None;
        if servers.websocket.enabled {
            let listener = TcpListener::bind(format!(
                "{}:{}",
                servers.websocket.host, servers.websocket.port
            ))
            .await?;
            let addr = listener.local_addr()?;
            let notifier = PushNotifier::new(handler.clone(), cache.clone());
            tasks.push(spawn_server(
                "websocket",
                notifier.serve(listener, shutdown_rx.clone()),
            ));
            endpoints.push(ServiceEndpoint {
                protocol: "websocket",
                addr,
            });
            websocket_addr = Some(addr);
        }

        let poll_settings = PollSettings {
            interval: settings.home_assistant.poll_interval(),
            fetch_timeout: settings.home_assistant.timeout(),
            discovery_retry: settings.discovery.retry_interval(),
        };
        let poll_loop = PollLoop::new(source, resolver, publisher, poll_settings);
        tasks.push(tokio::spawn(poll_loop.run(shutdown_rx)));

        LogAdvertiser.advertise(&identity, &endpoints);
        info!(
            device_id = identity.device_id(),
            listeners = endpoints.len(),
            "Emulator started"
        );

        Ok(Self {
            cache,
            identity,
            modbus_addr,
            udp_addrs,
            websocket_addr,
            shutdown,
            tasks,
        })
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn modbus_addr(&self) -> Option<SocketAddr> {
        self.modbus_addr
    }

    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.websocket_addr
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(self) {
        info!("Shutting down emulator");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Task panicked during shutdown");
            }
        }
        info!("Emulator stopped");
    }
}

fn spawn_server<F>(name: &'static str, server: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server exited with error");
        }
    })
}
