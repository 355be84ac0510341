//! DFU control-point wire format: opcodes, object types and result codes.
//!
//! As defined in `nRF5_SDK_17.1.0/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// DFU object type, carried as the argument of `CREATE`/`SELECT`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Command = 0x01,
    Data = 0x02,
}

impl ObjectType {
    pub fn kind_name(self) -> &'static str {
        match self {
            ObjectType::Command => "init packet",
            ObjectType::Data => "firmware",
        }
    }
}

/// DFU control-point opcodes.
///
/// Only the reduced command set is modeled; the rest of
/// `nrf_dfu_req_handler.c`'s opcodes (ping, hw/fw version, ...) are not
/// needed by the transfer protocol this crate drives.
#[derive(Debug, Eq, PartialEq, Copy, Clone, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Create = 0x01,
    SetPrn = 0x02,
    CalculateCrc = 0x03,
    Execute = 0x04,
    Select = 0x06,
    Response = 0x60,
}

/// Control-point result codes reported in a `RESPONSE` frame.
#[derive(Debug, Eq, PartialEq, Copy, Clone, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
}
