//! Secure DFU client core for Nordic-style BLE bootloaders.
//!
//! This crate drives the nRF Secure DFU control-point protocol over a
//! GATT link: it chunks firmware into protocol-level objects, streams them
//! as MTU-sized packets with Packet Receipt Notification pacing, verifies
//! cumulative CRC-32, executes each object, and resumes an interrupted
//! transfer from the offset the target reports. The BLE transport itself
//! (scanning, connecting, characteristic discovery) is implemented against
//! the [`adapter::GattAdapter`] trait; [`adapter_btleplug`] provides a
//! concrete adapter over `btleplug`.

pub mod adapter;
pub mod adapter_btleplug;
pub mod control_point;
pub mod controller;
pub mod crc;
pub mod error;
pub mod object_writer;
pub mod opcode;
pub mod package;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use adapter::{Characteristic, GattAdapter};
pub use controller::DfuController;
pub use error::DfuError;
pub use object_writer::{AbortHandle, PacketWritten, TransferProgress};
pub use opcode::ObjectType;
pub use package::{ReadOnlyMetadata, Slot, Update, UpdatePackage};
pub use transport::{DfuTransport, ProgressUpdate};
