//! rusb-backed device port
//!
//! Each endpoint gets a dedicated worker thread fed by a command queue, so
//! transfers on one endpoint run in submission order without blocking the
//! others or the tokio runtime. Halt handling is queued on the same worker and
//! therefore lands between the transfers around it.

use super::transfers::{DEFAULT_TIMEOUT, execute_control, execute_stream, map_rusb_error};
use async_channel::{Receiver, Sender, unbounded};
use common::{RequestHandle, Transfer, TransferResult, UsbPort};
use protocol::{Direction, EndpointId, EndpointType, TransferError};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Standard SET_FEATURE request
const REQ_SET_FEATURE: u8 = 0x03;

/// Host-to-device, standard, endpoint recipient
const REQ_TYPE_ENDPOINT_OUT: u8 = 0x02;

/// ENDPOINT_HALT feature selector
const FEATURE_ENDPOINT_HALT: u16 = 0;

enum PortCommand {
    Transfer(Transfer),
    ClearHalt,
    SetHalt,
}

/// Device handle and bookkeeping shared with the worker threads
struct Shared {
    handle: RwLock<DeviceHandle<Context>>,
    claimed: Vec<u8>,
    /// In-flight transfers and whether a cancel was requested
    inflight: Mutex<HashMap<RequestHandle, bool>>,
    disconnected: Notify,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<RequestHandle, bool>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_canceled(&self, handle: RequestHandle) -> bool {
        self.inflight().get(&handle).copied().unwrap_or(true)
    }

    fn note_result(&self, result: &TransferResult) {
        if matches!(result, Err(TransferError::NoDevice)) {
            self.disconnected.notify_one();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let handle = self.handle.get_mut().unwrap_or_else(PoisonError::into_inner);
        for interface in &self.claimed {
            if let Err(e) = handle.release_interface(*interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = handle.attach_kernel_driver(*interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        debug!("Closed device");
    }
}

/// The real device as seen by the physical adapter
pub struct RusbPort {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<EndpointId, Sender<PortCommand>>>,
}

impl RusbPort {
    /// Wrap an opened handle; `claimed` interfaces are released on drop
    pub fn new(handle: DeviceHandle<Context>, claimed: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                handle: RwLock::new(handle),
                claimed,
                inflight: Mutex::new(HashMap::new()),
                disconnected: Notify::new(),
            }),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves once a transfer has reported that the device is gone
    pub async fn wait_disconnected(&self) {
        self.shared.disconnected.notified().await;
    }

    fn enqueue(&self, endpoint: EndpointId, command: PortCommand) -> Result<(), TransferError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = match workers.get(&endpoint) {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let sender = spawn_worker(self.shared.clone(), endpoint)?;
                workers.insert(endpoint, sender.clone());
                sender
            }
        };
        sender
            .try_send(command)
            .map_err(|_| TransferError::NoDevice)
    }
}

impl UsbPort for RusbPort {
    fn submit(&self, transfer: Transfer) -> Result<(), TransferError> {
        if transfer.endpoint.kind == EndpointType::Isochronous {
            return Err(TransferError::NotSupported);
        }

        let endpoint = transfer.endpoint;
        let handle = transfer.handle;
        self.shared.inflight().insert(handle, false);
        if let Err(e) = self.enqueue(endpoint, PortCommand::Transfer(transfer)) {
            self.shared.inflight().remove(&handle);
            return Err(e);
        }
        Ok(())
    }

    fn cancel(&self, endpoint: EndpointId, handle: RequestHandle) {
        if let Some(canceled) = self.shared.inflight().get_mut(&handle) {
            trace!("Cancel requested for {} on {}", handle, endpoint);
            *canceled = true;
        }
    }

    fn clear_halt(&self, endpoint: EndpointId) -> Result<(), TransferError> {
        self.enqueue(endpoint, PortCommand::ClearHalt)
    }

    fn set_halt(&self, endpoint: EndpointId) -> Result<(), TransferError> {
        self.enqueue(endpoint, PortCommand::SetHalt)
    }

    /// Returns once the switch is done. Waiting for the In pollers to release the
    /// handle and the control transfer both run outside the async scheduler.
    fn set_interface(&self, interface: u8, alternate: u8) -> Result<(), TransferError> {
        blocking(|| {
            self.shared
                .write()
                .set_alternate_setting(interface, alternate)
        })
        .map_err(map_rusb_error)?;
        info!("Device interface {} set to alt-setting {}", interface, alternate);
        Ok(())
    }
}

/// Run a blocking device call, handing the runtime worker's other tasks off first
fn blocking<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

fn spawn_worker(
    shared: Arc<Shared>,
    endpoint: EndpointId,
) -> Result<Sender<PortCommand>, TransferError> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name(format!("usb-ep-{:#04x}", endpoint.address()))
        .spawn(move || run_worker(shared, endpoint, rx))
        .map_err(|e| {
            error!("Failed to spawn worker for {}: {}", endpoint, e);
            TransferError::Io
        })?;
    Ok(tx)
}

fn run_worker(shared: Arc<Shared>, endpoint: EndpointId, commands: Receiver<PortCommand>) {
    debug!("Worker for {} started", endpoint);

    while let Ok(command) = commands.recv_blocking() {
        match command {
            PortCommand::Transfer(transfer) => run_transfer(&shared, transfer),
            PortCommand::ClearHalt => {
                let result = shared.write().clear_halt(endpoint.address());
                match result {
                    Ok(()) => debug!("Cleared halt on {}", endpoint),
                    Err(e) => warn!("Failed to clear halt on {}: {}", endpoint, e),
                }
            }
            PortCommand::SetHalt => {
                let result = shared.read().write_control(
                    REQ_TYPE_ENDPOINT_OUT,
                    REQ_SET_FEATURE,
                    FEATURE_ENDPOINT_HALT,
                    u16::from(endpoint.address()),
                    &[],
                    DEFAULT_TIMEOUT,
                );
                match result {
                    Ok(_) => debug!("Halted {}", endpoint),
                    Err(e) => warn!("Failed to halt {}: {}", endpoint, e),
                }
            }
        }
    }

    debug!("Worker for {} stopped", endpoint);
}

fn run_transfer(shared: &Shared, transfer: Transfer) {
    let Transfer {
        endpoint,
        handle,
        setup,
        mut buffer,
        completer,
        ..
    } = transfer;

    let result = if shared.is_canceled(handle) {
        Err(TransferError::Canceled)
    } else if let Some(setup) = setup {
        if setup.is_set_configuration() {
            set_configuration(shared, setup.value as u8)
        } else {
            execute_control(&shared.read(), &setup, &mut buffer)
        }
    } else {
        execute_stream(
            &shared.handle,
            endpoint.kind,
            endpoint.address(),
            &mut buffer,
            || shared.is_canceled(handle),
        )
    };

    shared.inflight().remove(&handle);
    shared.note_result(&result);

    let data = if endpoint.direction == Direction::In && result.is_ok() {
        buffer
    } else {
        Vec::new()
    };
    completer.complete(result, data);
}

/// SET_CONFIGURATION goes through libusb so its view of the device stays current
fn set_configuration(shared: &Shared, value: u8) -> TransferResult {
    let mut handle = shared.write();
    if handle.active_configuration().is_ok_and(|active| active == value) {
        debug!("Configuration {} already active", value);
        return Ok(0);
    }
    handle
        .set_active_configuration(value)
        .map_err(map_rusb_error)?;
    info!("Device configuration set to {}", value);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call_on_multi_thread_runtime() {
        let thread = std::thread::current().id();
        let (value, same_thread) = blocking(|| (7, std::thread::current().id() == thread));
        assert_eq!(value, 7);
        assert!(same_thread);
    }

    #[tokio::test]
    async fn test_blocking_call_on_current_thread_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[test]
    fn test_blocking_call_outside_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }
}
