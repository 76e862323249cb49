//! USB transfer execution
//!
//! Blocking rusb calls for control, bulk and interrupt transfers, run on the
//! per-endpoint worker threads of [`RusbPort`](super::RusbPort). In transfers poll
//! with a short timeout so a cancel request is noticed while the device has
//! nothing to say.

use common::TransferResult;
use protocol::{Direction, EndpointType, SetupPacket, TransferError};
use rusb::{Context, DeviceHandle};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Default timeout for USB transfers (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for In transfers
pub const IN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Execute a control transfer on endpoint 0
///
/// For In requests `buffer` is filled and truncated to the bytes received; for Out
/// requests it holds the data stage.
pub fn execute_control(
    handle: &DeviceHandle<Context>,
    setup: &SetupPacket,
    buffer: &mut Vec<u8>,
) -> TransferResult {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    match setup.direction() {
        Direction::In => {
            let len = handle
                .read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    buffer,
                    DEFAULT_TIMEOUT,
                )
                .map_err(map_rusb_error)?;
            buffer.truncate(len);
            Ok(len)
        }
        Direction::Out => handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buffer,
                DEFAULT_TIMEOUT,
            )
            .map_err(map_rusb_error),
    }
}

/// Execute a bulk or interrupt transfer
///
/// In transfers keep polling until data arrives, an error occurs or `canceled`
/// reports true.
pub fn execute_stream(
    handle: &RwLock<DeviceHandle<Context>>,
    kind: EndpointType,
    address: u8,
    buffer: &mut Vec<u8>,
    canceled: impl Fn() -> bool,
) -> TransferResult {
    if address & 0x80 == 0 {
        let handle = handle.read().unwrap_or_else(PoisonError::into_inner);
        return match kind {
            EndpointType::Interrupt => handle.write_interrupt(address, buffer, DEFAULT_TIMEOUT),
            _ => handle.write_bulk(address, buffer, DEFAULT_TIMEOUT),
        }
        .map_err(map_rusb_error);
    }

    loop {
        if canceled() {
            return Err(TransferError::Canceled);
        }

        // Released between polls so alt-setting changes can get in
        let handle = handle.read().unwrap_or_else(PoisonError::into_inner);
        let result = match kind {
            EndpointType::Interrupt => handle.read_interrupt(address, buffer, IN_POLL_INTERVAL),
            _ => handle.read_bulk(address, buffer, IN_POLL_INTERVAL),
        };

        match result {
            Ok(len) => {
                buffer.truncate(len);
                return Ok(len);
            }
            // Device has no data available yet
            Err(rusb::Error::Timeout) => {
                trace!("{:?} In {:#x}: no data yet", kind, address);
            }
            Err(e) => return Err(map_rusb_error(e)),
        }
    }
}

/// Map rusb::Error to protocol::TransferError
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::NotSupported => TransferError::NotSupported,
        rusb::Error::Interrupted => TransferError::Canceled,
        _ => TransferError::Io,
    }
}
