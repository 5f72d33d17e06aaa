use crate::device::DeviceIdentity;
use crate::error::EmulatorError;
use crate::register_map::read_registers;
use crate::snapshot_cache::SnapshotCache;
use std::{future, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

/// Modbus TCP face of the meter. Input and holding registers share one
/// address space.
#[derive(Clone)]
pub struct MeterService {
    cache: SnapshotCache,
    identity: Arc<DeviceIdentity>,
}

impl MeterService {
    pub fn new(cache: SnapshotCache, identity: Arc<DeviceIdentity>) -> Self {
        Self { cache, identity }
    }

    fn read(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let cached = self.cache.current();
        read_registers(&cached.snapshot, &self.identity, addr, cnt).map_err(|e| {
            debug!(addr, cnt, error = %e, "Rejecting register read");
            match e {
                EmulatorError::AddressOutOfRange { .. } => ExceptionCode::IllegalDataAddress,
                _ => ExceptionCode::IllegalDataValue,
            }
        })
    }
}

impl tokio_modbus::server::Service for MeterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                debug!(addr, cnt, "Input register read");
                self.read(addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!(addr, cnt, "Holding register read");
                self.read(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            _ => {
                warn!(request = ?req, "Unimplemented function code");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Serves connections on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: MeterService,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Modbus server listening");
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(service.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!(error = %err, "Modbus connection error");
    };

    tokio::select! {
        result = server.serve(&on_connected, on_process_error) => result?,
        _ = shutdown.changed() => info!("Modbus server stopped"),
    }
    Ok(())
}
