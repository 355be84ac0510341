//! The `GattAdapter` trait: the BLE transport primitives the DFU protocol
//! engine needs, and nothing more. Radio-level transport, service/characteristic
//! discovery, and connection management are the concrete adapter's problem.

use std::time::Duration;

use uuid::Uuid;

use crate::error::DfuError;

/// A characteristic the DFU and Buttonless DFU services expose. Only
/// `ControlPoint` and `Packet` are used by the object-transfer protocol
/// engine; `Buttonless` exists so the same adapter can also trigger
/// bootloader mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Characteristic {
    ControlPoint,
    Packet,
    Buttonless,
}

/// nRF Secure DFU service & characteristic UUIDs.
///
/// From the [DFU BLE
/// transport](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/lib_dfu_transport_ble.html)
/// documentation.
pub mod uuids {
    use uuid::Uuid;

    /// DFU Service (16 bit UUID 0xFE59).
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control Point characteristic.
    pub const CONTROL_POINT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Packet characteristic.
    pub const PACKET: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds.
    pub const BUTTONLESS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger with bonds.
    pub const BUTTONLESS_WITH_BONDS: Uuid = Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);
}

impl Characteristic {
    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::ControlPoint => uuids::CONTROL_POINT,
            Characteristic::Packet => uuids::PACKET,
            Characteristic::Buttonless => uuids::BUTTONLESS,
        }
    }
}

/// GATT primitives the DFU protocol engine drives.
///
/// Implementations are expected to be cheap to share (e.g. an `Arc` around a
/// connected peripheral handle) since `ControlPointService`, `ObjectWriter`
/// and `DfuTransport` all borrow the same adapter concurrently-in-spirit
/// (though never truly concurrently — see the ordering guarantees in the
/// crate-level documentation).
pub trait GattAdapter: Send + Sync {
    /// Write without response to `characteristic`. The adapter is
    /// responsible for fragmenting the write to its link-layer MTU if the
    /// underlying stack requires it; the protocol engine always hands it
    /// MTU-sized packets already.
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), DfuError>;

    /// Enable notifications on `characteristic`.
    async fn enable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError>;

    /// Disable notifications on `characteristic`. Idempotent.
    async fn disable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError>;

    /// Wait for the next notification value on `characteristic`, up to
    /// `timeout`. Both control-point responses and PRN notifications arrive
    /// on the control-point characteristic; callers are responsible for not
    /// racing two concurrent waiters against the same characteristic (the
    /// protocol engine never does, by construction — see §5 of the design).
    async fn next_notification(
        &self,
        characteristic: Characteristic,
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError>;
}
