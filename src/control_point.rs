//! Control-point request/response engine (§4.1).
//!
//! A single-outstanding-request service: `request()` writes to the
//! control-point characteristic and then waits for exactly one matching
//! notification before returning. Callers (the `DfuTransport` state machine)
//! are responsible for never issuing a second request before the first one
//! resolves — the service has no internal queueing for that case, mirroring
//! the "at most one control-point request in flight" ordering guarantee.

use std::time::Duration;

use crate::adapter::{Characteristic, GattAdapter};
use crate::error::DfuError;
use crate::opcode::{ObjectType, Opcode, ResultCode};

/// Default window a control-point request waits for its response before
/// failing with [`DfuError::NotificationTimeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Response to a `SELECT` request: the target's current state for one
/// object type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SelectResponse {
    pub max_size: u32,
    pub offset: u32,
    pub crc32: u32,
}

/// Response to a `CALCULATE_CRC` request, and the shape of a PRN
/// notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CrcResponse {
    pub offset: u32,
    pub crc32: u32,
}

pub struct ControlPointService<'a, A: GattAdapter> {
    adapter: &'a A,
    timeout: Duration,
}

impl<'a, A: GattAdapter> ControlPointService<'a, A> {
    pub fn new(adapter: &'a A) -> Self {
        Self {
            adapter,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(adapter: &'a A, timeout: Duration) -> Self {
        Self { adapter, timeout }
    }

    /// Enable control-point notifications. Idempotent at the adapter level.
    pub async fn open(&self) -> Result<(), DfuError> {
        self.adapter
            .enable_notifications(Characteristic::ControlPoint)
            .await
    }

    /// Disable control-point notifications.
    pub async fn close(&self) -> Result<(), DfuError> {
        self.adapter
            .disable_notifications(Characteristic::ControlPoint)
            .await
    }

    pub async fn create(&self, obj_type: ObjectType, size: u32) -> Result<(), DfuError> {
        let opcode = Opcode::Create;
        let mut payload = vec![opcode.into(), obj_type.into()];
        payload.extend_from_slice(&size.to_le_bytes());
        self.request(opcode, &payload).await?;
        log::debug!("CREATE({obj_type:?}, {size}) -> ok");
        Ok(())
    }

    pub async fn set_prn(&self, prn: u16) -> Result<(), DfuError> {
        let opcode = Opcode::SetPrn;
        let mut payload = vec![opcode.into()];
        payload.extend_from_slice(&prn.to_le_bytes());
        self.request(opcode, &payload).await?;
        log::debug!("SET_PRN({prn})");
        Ok(())
    }

    pub async fn calculate_crc(&self) -> Result<CrcResponse, DfuError> {
        let opcode = Opcode::CalculateCrc;
        let body = self.request(opcode, &[opcode.into()]).await?;
        let response = decode_crc_response(&body)?;
        log::debug!("CALCULATE_CRC -> {response:?}");
        Ok(response)
    }

    /// The raw wait primitive PRN notifications use: they are
    /// `CALCULATE_CRC`-shaped frames the target sends unprompted, so they
    /// are validated with the same header/result check as a real
    /// `CALCULATE_CRC` response but without writing a request first.
    pub async fn await_prn(&self) -> Result<CrcResponse, DfuError> {
        await_prn(self.adapter, self.timeout).await
    }

    pub async fn execute(&self) -> Result<(), DfuError> {
        let opcode = Opcode::Execute;
        self.request(opcode, &[opcode.into()]).await?;
        log::debug!("EXECUTE");
        Ok(())
    }

    pub async fn select(&self, obj_type: ObjectType) -> Result<SelectResponse, DfuError> {
        let opcode = Opcode::Select;
        let body = self.request(opcode, &[opcode.into(), obj_type.into()]).await?;
        let response = decode_select_response(&body)?;
        log::debug!("SELECT({obj_type:?}) -> {response:?}");
        Ok(response)
    }

    /// Write `payload` to the control-point characteristic and wait for the
    /// one notification that answers it.
    async fn request(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, DfuError> {
        self.adapter.write(Characteristic::ControlPoint, payload).await?;
        let notification = self
            .adapter
            .next_notification(Characteristic::ControlPoint, self.timeout)
            .await?;
        verify_header(opcode, &notification)
    }
}

/// Validate a `RESPONSE` frame against the opcode it is supposed to answer
/// and return the body bytes that follow the result code.
fn verify_header(expected_opcode: Opcode, frame: &[u8]) -> Result<Vec<u8>, DfuError> {
    if frame.len() < 3 {
        return Err(DfuError::MalformedResponse(format!(
            "response frame too short ({} bytes)",
            frame.len()
        )));
    }
    let response_opcode: u8 = Opcode::Response.into();
    if frame[0] != response_opcode {
        return Err(DfuError::MalformedResponse(format!(
            "expected RESPONSE header 0x{response_opcode:02x}, got 0x{:02x}",
            frame[0]
        )));
    }
    let expected: u8 = expected_opcode.into();
    if frame[1] != expected {
        return Err(DfuError::MalformedResponse(format!(
            "response answers opcode 0x{:02x}, expected 0x{expected:02x}",
            frame[1]
        )));
    }
    let result = ResultCode::try_from(frame[2])
        .map_err(|_| DfuError::InvalidResultCode(frame[2]))?;
    if result != ResultCode::Success {
        return Err(DfuError::from(result));
    }
    Ok(frame[3..].to_vec())
}

/// Wait for a PRN notification directly on `adapter` without going through
/// a `ControlPointService`'s request-tracking — used by `ObjectWriter`,
/// which waits on the same control-point characteristic but is not the one
/// that issued a request.
pub(crate) async fn await_prn<A: GattAdapter>(
    adapter: &A,
    timeout: std::time::Duration,
) -> Result<CrcResponse, DfuError> {
    let notification = adapter.next_notification(Characteristic::ControlPoint, timeout).await?;
    let body = verify_header(Opcode::CalculateCrc, &notification)?;
    decode_crc_response(&body)
}

fn decode_crc_response(body: &[u8]) -> Result<CrcResponse, DfuError> {
    if body.len() < 8 {
        return Err(DfuError::MalformedResponse(format!(
            "CALCULATE_CRC body too short ({} bytes)",
            body.len()
        )));
    }
    Ok(CrcResponse {
        offset: u32::from_le_bytes(body[0..4].try_into().unwrap()),
        crc32: u32::from_le_bytes(body[4..8].try_into().unwrap()),
    })
}

fn decode_select_response(body: &[u8]) -> Result<SelectResponse, DfuError> {
    if body.len() < 12 {
        return Err(DfuError::MalformedResponse(format!(
            "SELECT body too short ({} bytes)",
            body.len()
        )));
    }
    Ok(SelectResponse {
        max_size: u32::from_le_bytes(body[0..4].try_into().unwrap()),
        offset: u32::from_le_bytes(body[4..8].try_into().unwrap()),
        crc32: u32::from_le_bytes(body[8..12].try_into().unwrap()),
    })
}
