//! Object streaming: chunk one object's bytes into MTU-sized packets, write
//! them in order, and keep a rolling `(offset, crc32)` state validated
//! against PRN notifications from the target (§4.2).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::adapter::{Characteristic, GattAdapter};
use crate::control_point::{self, DEFAULT_TIMEOUT};
use crate::crc::crc32_update;
use crate::error::DfuError;
use crate::opcode::ObjectType;

/// Default bytes written per GATT write-without-response.
pub const DEFAULT_MTU: usize = 20;

/// `(offset, crc32)` after writing an object, or a prefix of one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransferProgress {
    pub offset: u32,
    pub crc32: u32,
}

/// A packet-level progress event emitted while writing an object.
#[derive(Debug, Copy, Clone)]
pub struct PacketWritten {
    pub object_type: ObjectType,
    pub offset: u32,
}

/// Level-triggered abort flag, shared between a `DfuTransport`/`ObjectWriter`
/// pair and whatever task calls `abort()`. Cheap to clone; cloning does not
/// duplicate the flag.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous abort so the handle (and the transport holding it)
    /// can be reused. Abort is sticky until this is called explicitly.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ObjectWriter<'a, A: GattAdapter> {
    adapter: &'a A,
    mtu_size: usize,
    prn: u16,
    prn_timeout: Duration,
    abort: AbortHandle,
}

impl<'a, A: GattAdapter> ObjectWriter<'a, A> {
    pub fn new(adapter: &'a A, abort: AbortHandle) -> Self {
        Self {
            adapter,
            mtu_size: DEFAULT_MTU,
            prn: 0,
            prn_timeout: DEFAULT_TIMEOUT,
            abort,
        }
    }

    pub fn set_mtu(&mut self, mtu_size: usize) {
        self.mtu_size = mtu_size;
    }

    pub fn set_prn(&mut self, prn: u16) {
        self.prn = prn;
    }

    /// Stream `data` to the packet characteristic, starting from
    /// `(offset_in, crc_in)`, emitting `on_packet` after every packet.
    ///
    /// Checks the abort flag before every packet write, so an `abort()`
    /// issued before the k-th packet fails the operation having emitted
    /// exactly k-1 packets.
    pub async fn write(
        &self,
        data: &[u8],
        object_type: ObjectType,
        offset_in: u32,
        crc_in: u32,
        mut on_packet: impl FnMut(PacketWritten),
    ) -> Result<TransferProgress, DfuError> {
        let mut offset = offset_in;
        let mut crc32 = crc_in;
        let mut packets_since_prn: u16 = 0;

        for packet in data.chunks(self.mtu_size.max(1)) {
            if self.abort.is_aborted() {
                return Err(DfuError::Aborted);
            }

            self.adapter.write(Characteristic::Packet, packet).await?;
            offset += packet.len() as u32;
            crc32 = crc32_update(crc32, packet);
            on_packet(PacketWritten { object_type, offset });

            if self.prn != 0 {
                packets_since_prn += 1;
                if packets_since_prn == self.prn {
                    packets_since_prn = 0;
                    let prn = control_point::await_prn(self.adapter, self.prn_timeout).await?;
                    if prn.offset != offset {
                        return Err(DfuError::InvalidOffset {
                            expected: offset,
                            actual: prn.offset,
                        });
                    }
                    if prn.crc32 != crc32 {
                        return Err(DfuError::InvalidCrc {
                            expected: crc32,
                            actual: prn.crc32,
                        });
                    }
                }
            }
        }

        Ok(TransferProgress { offset, crc32 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc32;
    use crate::test_support::FakeAdapter;

    #[tokio::test]
    async fn writes_all_packets_and_tracks_rolling_state() {
        let adapter = FakeAdapter::new();
        let writer = ObjectWriter::new(&adapter, AbortHandle::new());
        let data = vec![7u8; 100];

        let progress = writer
            .write(&data, ObjectType::Data, 0, 0, |_| {})
            .await
            .unwrap();

        assert_eq!(progress.offset, 100);
        assert_eq!(progress.crc32, crc32(&data));
        assert_eq!(adapter.packet_writes().len(), 5); // 100 / 20
    }

    #[tokio::test]
    async fn resumes_from_nonzero_offset() {
        let adapter = FakeAdapter::new();
        let writer = ObjectWriter::new(&adapter, AbortHandle::new());
        let prefix = vec![1u8; 40];
        let rest = vec![2u8; 60];
        let crc_in = crc32(&prefix);

        let progress = writer
            .write(&rest, ObjectType::Command, 40, crc_in, |_| {})
            .await
            .unwrap();

        let mut whole = prefix.clone();
        whole.extend_from_slice(&rest);
        assert_eq!(progress.offset, 100);
        assert_eq!(progress.crc32, crc32(&whole));
    }

    #[tokio::test]
    async fn prn_mismatch_is_rejected() {
        let adapter = FakeAdapter::new();
        adapter.push_raw_control_point_response(vec![
            0x60,
            crate::opcode::Opcode::CalculateCrc.into(),
            crate::opcode::ResultCode::Success.into(),
            0,
            0,
            0,
            0, // offset = 0, wrong
            0,
            0,
            0,
            0,
        ]);
        let mut writer = ObjectWriter::new(&adapter, AbortHandle::new());
        writer.set_prn(1);
        let err = writer.write(&[1, 2, 3], ObjectType::Data, 0, 0, |_| {}).await;
        assert!(matches!(err, Err(DfuError::InvalidOffset { .. })));
    }

    #[tokio::test]
    async fn abort_before_kth_packet_stops_after_k_minus_one() {
        let adapter = FakeAdapter::new();
        let abort = AbortHandle::new();
        let writer = ObjectWriter::new(&adapter, abort.clone());
        let data = vec![9u8; 100]; // 5 packets of 20 bytes

        let mut written = 0;
        let abort_at = 3; // abort takes effect before the 3rd packet
        let result = writer
            .write(&data, ObjectType::Data, 0, 0, |_| {
                written += 1;
                if written == abort_at - 1 {
                    abort.abort();
                }
            })
            .await;

        assert!(matches!(result, Err(DfuError::Aborted)));
        assert_eq!(written, abort_at - 1);
        assert_eq!(adapter.packet_writes().len(), abort_at - 1);
    }
}
