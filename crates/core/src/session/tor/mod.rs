/// Anonymity session backed by an already-running Tor daemon
///
/// Onion services are published with `ADD_ONION` on the control port and
/// forwarded to a loopback listener; dials go through Tor's SOCKS port.

mod control;
mod socks;

use super::{
    check_network, split_target, AnonListener, AnonSession, BoxedStream, ListenOptions,
    SessionError,
};
use crate::context::Context;
use async_trait::async_trait;
use control::ControlConnection;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tordht_common::{OnionService, TorConfig};
use tracing::{debug, info};

/// Control connection that owns one published service. Tor withdraws an
/// ephemeral service when the connection that added it goes away.
type ServiceOwner = Arc<Mutex<Option<ControlConnection>>>;

/// A control-port session with a Tor daemon
pub struct TorSession {
    config: TorConfig,
    control: Mutex<ControlConnection>,
    services: Mutex<Vec<ServiceOwner>>,
    closed: AtomicBool,
}

impl TorSession {
    /// Connect and authenticate to the control port
    pub async fn connect(config: TorConfig) -> Result<Self, SessionError> {
        let mut control = ControlConnection::connect(config.control_addr).await?;
        control.authenticate(&config.auth).await?;
        info!(control = %config.control_addr, "Connected to Tor control port");

        Ok(Self {
            config,
            control: Mutex::new(control),
            services: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn open_control(&self) -> Result<ControlConnection, SessionError> {
        let mut control = ControlConnection::connect(self.config.control_addr).await?;
        control.authenticate(&self.config.auth).await?;
        Ok(control)
    }

    /// A second control connection that only receives descriptor events.
    /// Subscribed before `ADD_ONION` so the upload event cannot be missed.
    async fn descriptor_events(&self) -> Result<ControlConnection, SessionError> {
        let mut events = self.open_control().await?;
        events.subscribe_descriptor_events().await?;
        Ok(events)
    }

    /// Publish a service on a connection of its own. Dropping this future
    /// part way drops that connection too, so nothing stays published and
    /// no reply is left unread on a connection someone else uses.
    async fn publish(
        &self,
        options: &ListenOptions,
    ) -> Result<(OnionService, TcpListener, ControlConnection), SessionError> {
        let mut events = if options.wait_for_publish && self.config.wait_for_publish {
            Some(self.descriptor_events().await?)
        } else {
            None
        };

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let local = listener.local_addr()?;
        let remote_port = match options.remote_ports.first() {
            Some(port) => *port,
            None => rand::thread_rng().gen_range(1024..=u16::MAX),
        };

        let mut owner = self.open_control().await?;
        let service_id = owner.add_onion(remote_port, local).await?;
        let service = OnionService::new(service_id, remote_port);
        debug!(service = %service, local = %local, "onion service added");

        if let Some(events) = events.as_mut() {
            events.wait_for_upload(&service.id).await?;
        }

        Ok((service, listener, owner))
    }
}

#[async_trait]
impl AnonSession for TorSession {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxedStream, SessionError> {
        self.ensure_open()?;
        check_network(network)?;
        let (host, port) = split_target(address)?;

        let stream = ctx
            .run(socks::connect(self.config.socks_addr, host, port))
            .await??;
        Ok(Box::new(stream))
    }

    async fn listen(
        &self,
        ctx: &Context,
        options: ListenOptions,
    ) -> Result<Box<dyn AnonListener>, SessionError> {
        self.ensure_open()?;
        if !options.version3 {
            return Err(SessionError::UnsupportedOptions(
                "only version 3 services are supported".to_string(),
            ));
        }

        let (service, listener, owner) = ctx.run(self.publish(&options)).await??;
        info!(service = %service, "Onion service published");

        let owner: ServiceOwner = Arc::new(Mutex::new(Some(owner)));
        let mut services = self.services.lock().await;
        // Forget services whose listener already closed
        services.retain(|s| s.try_lock().map_or(true, |c| c.is_some()));
        services.push(owner.clone());

        Ok(Box::new(TorListener {
            service,
            listener,
            owner,
        }))
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the owning connections withdraws their services
        for owner in self.services.lock().await.drain(..) {
            owner.lock().await.take();
        }
        self.control.lock().await.command("QUIT").await?;
        Ok(())
    }
}

struct TorListener {
    service: OnionService,
    listener: TcpListener,
    owner: ServiceOwner,
}

#[async_trait]
impl AnonListener for TorListener {
    fn service(&self) -> &OnionService {
        &self.service
    }

    async fn accept(&mut self) -> Result<BoxedStream, SessionError> {
        if self.owner.lock().await.is_none() {
            return Err(SessionError::Closed);
        }
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(mut control) = self.owner.lock().await.take() else {
            return Ok(());
        };
        let result = control.del_onion(&self.service.id).await;
        if let Err(e) = control.command("QUIT").await {
            debug!(service = %self.service, "Error closing control connection: {}", e);
        }
        result
    }
}
