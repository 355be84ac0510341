//! `DfuTransport` (§4.3): drives the full CREATE/WRITE/VALIDATE/EXECUTE
//! lifecycle for one payload of one object type, including resume and
//! retry. Progress is reported through a caller-supplied sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::adapter::GattAdapter;
use crate::control_point::ControlPointService;
use crate::crc::crc32;
use crate::error::DfuError;
use crate::object_writer::{AbortHandle, ObjectWriter, PacketWritten, TransferProgress};
use crate::opcode::ObjectType;

/// Per-object lifecycle state. Named explicitly (rather than left implicit
/// in a promise chain) so retry and cancellation boundaries are obvious at
/// a glance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectState {
    Selecting,
    Creating,
    Writing,
    Validating,
    Executing,
    Done,
}

/// A progress update the transport emits while sending an init packet or
/// firmware image.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stage: String,
    pub offset: u32,
}

/// Maximum number of attempts a single object gets before its error is
/// propagated to the caller (the first attempt plus two retries).
const MAX_ATTEMPTS: u32 = 3;

fn trace_state(state: ObjectState) {
    log::trace!("object state -> {state:?}");
}

/// Whether the transport's control-point notifications are currently
/// enabled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LinkState {
    Closed,
    Open,
}

pub struct DfuTransport<'a, A: GattAdapter> {
    adapter: &'a A,
    control: ControlPointService<'a, A>,
    mtu_size: usize,
    prn: u16,
    abort: AbortHandle,
    link_state: AtomicBool, // true == Open
    progress: Option<Box<dyn Fn(ProgressUpdate) + Send + Sync + 'a>>,
}

impl<'a, A: GattAdapter> DfuTransport<'a, A> {
    pub fn new(adapter: &'a A) -> Self {
        Self {
            adapter,
            control: ControlPointService::new(adapter),
            mtu_size: crate::object_writer::DEFAULT_MTU,
            prn: 0,
            abort: AbortHandle::new(),
            link_state: AtomicBool::new(false),
            progress: None,
        }
    }

    pub fn with_timeout(adapter: &'a A, timeout: Duration) -> Self {
        Self {
            control: ControlPointService::with_timeout(adapter, timeout),
            ..Self::new(adapter)
        }
    }

    /// Install a sink invoked for every object-level stage transition and
    /// for every packet the writer emits (the latter surfaced as a
    /// `ProgressUpdate` carrying the packet's running offset). Events are
    /// also logged at `info`/`trace` level regardless of whether a sink is
    /// installed.
    pub fn on_progress(&mut self, sink: impl Fn(ProgressUpdate) + Send + Sync + 'a) {
        self.progress = Some(Box::new(sink));
    }

    /// A cheap, cloneable handle that can be used to `abort()` this
    /// transport from another task while a transfer is in flight.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Set the abort flag. The in-flight write fails at the next packet
    /// boundary with `DfuError::Aborted`. Sticky until the transport is
    /// reused (see `reset_abort`).
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Clear a previous abort so the transport can run another transfer.
    pub fn reset_abort(&self) {
        self.abort.reset();
    }

    /// Configure the Packet Receipt Notification period, both on the target
    /// and on the local writer. Opens the transport if it wasn't already.
    pub async fn set_prn(&mut self, prn: u16) -> Result<(), DfuError> {
        self.ensure_open().await?;
        self.control.set_prn(prn).await?;
        self.prn = prn;
        Ok(())
    }

    /// Purely local: configures how many bytes the writer puts in each
    /// packet-characteristic write.
    pub fn set_mtu(&mut self, mtu_size: usize) {
        self.mtu_size = mtu_size;
    }

    /// Enable control-point notifications if not already enabled.
    pub async fn ensure_open(&self) -> Result<(), DfuError> {
        if !self.link_state.load(Ordering::SeqCst) {
            self.control
                .open()
                .await
                .map_err(|e| DfuError::NotificationStartError(e.to_string()))?;
            self.link_state.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Disable control-point notifications. Idempotent.
    pub async fn close(&self) -> Result<(), DfuError> {
        if self.link_state.load(Ordering::SeqCst) {
            self.control
                .close()
                .await
                .map_err(|e| DfuError::NotificationStopError(e.to_string()))?;
            self.link_state.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn writer(&self) -> ObjectWriter<'a, A> {
        let mut writer = ObjectWriter::new(self.adapter, self.abort.clone());
        writer.set_mtu(self.mtu_size);
        writer.set_prn(self.prn);
        writer
    }

    fn emit_progress(&self, stage: impl Into<String>, offset: u32) {
        let update = ProgressUpdate { stage: stage.into(), offset };
        log::info!("{}: {} bytes", update.stage, update.offset);
        if let Some(sink) = &self.progress {
            sink(update);
        }
    }

    /// Forward one packet's progress to the sink as a `ProgressUpdate`
    /// (stage named after the object type, offset at packet granularity),
    /// and log it at trace level.
    fn emit_packet(&self, packet: PacketWritten) {
        log::trace!("{} packet written, offset now {}", packet.object_type.kind_name(), packet.offset);
        if let Some(sink) = &self.progress {
            sink(ProgressUpdate {
                stage: format!("Transferring {}", packet.object_type.kind_name()),
                offset: packet.offset,
            });
        }
    }

    /// Send the init packet (Command object) — §4.3 Command flow.
    pub async fn send_init_packet(&self, init_packet: &[u8]) -> Result<TransferProgress, DfuError> {
        self.ensure_open().await?;
        trace_state(ObjectState::Selecting);
        let select = self.control.select(ObjectType::Command).await?;

        if init_packet.len() as u32 > select.max_size {
            return Err(DfuError::InitPacketTooLarge {
                size: init_packet.len() as u32,
                max: select.max_size,
            });
        }

        let resumable = select.offset > 0
            && select.offset <= init_packet.len() as u32
            && select.crc32 == crc32(&init_packet[..select.offset as usize]);

        if resumable {
            self.emit_progress("Resuming init packet transfer", select.offset);
            let remaining = &init_packet[select.offset as usize..];
            self.write_object(remaining, ObjectType::Command, select.offset, select.crc32)
                .await
        } else {
            self.emit_progress("Initializing init packet", 0);
            self.create_and_write(init_packet, ObjectType::Command, 0, 0).await
        }
    }

    /// Send the firmware (one or more Data objects) — §4.3 Data flow.
    pub async fn send_firmware(&self, firmware: &[u8]) -> Result<TransferProgress, DfuError> {
        self.ensure_open().await?;
        trace_state(ObjectState::Selecting);
        let select = self.control.select(ObjectType::Data).await?;

        if select.offset > firmware.len() as u32 {
            return Err(DfuError::InvalidOffset {
                expected: firmware.len() as u32,
                actual: select.offset,
            });
        }

        let state = FirmwareResumeState::compute(firmware, select.offset, select.max_size, select.crc32);

        let mut progress = TransferProgress {
            offset: state.start_offset,
            crc32: state.start_crc,
        };

        if !state.partial.is_empty() {
            self.emit_progress("Resuming firmware transfer", state.start_offset);
            progress = self
                .write_object(state.partial, ObjectType::Data, state.start_offset, state.start_crc)
                .await?;
        } else {
            self.emit_progress("Initializing firmware", state.start_offset);
        }

        for object in split_into_objects(state.remainder, select.max_size) {
            progress = self
                .create_and_write(object, ObjectType::Data, progress.offset, progress.crc32)
                .await?;
        }

        Ok(progress)
    }

    /// `CREATE` + write-object, retried up to `MAX_ATTEMPTS` times unless
    /// the error is `Aborted` or `NotificationTimeout`.
    async fn create_and_write(
        &self,
        bytes: &[u8],
        object_type: ObjectType,
        offset: u32,
        crc_in: u32,
    ) -> Result<TransferProgress, DfuError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let kind = object_type.kind_name();
            self.emit_progress(format!("Transferring {kind}"), offset);
            let result = self.create_and_write_once(bytes, object_type, offset, crc_in).await;
            match result {
                Ok(progress) => return Ok(progress),
                Err(err) if attempts < MAX_ATTEMPTS && err.is_retriable() => {
                    log::warn!("object transfer attempt {attempts} failed: {err}; retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_and_write_once(
        &self,
        bytes: &[u8],
        object_type: ObjectType,
        offset: u32,
        crc_in: u32,
    ) -> Result<TransferProgress, DfuError> {
        trace_state(ObjectState::Creating);
        self.control.create(object_type, bytes.len() as u32).await?;
        self.write_object(bytes, object_type, offset, crc_in).await
    }

    /// `ObjectWriter.write` → `CALCULATE_CRC` validation → `EXECUTE` (§4.3
    /// "Write-object procedure").
    async fn write_object(
        &self,
        bytes: &[u8],
        object_type: ObjectType,
        offset_in: u32,
        crc_in: u32,
    ) -> Result<TransferProgress, DfuError> {
        trace_state(ObjectState::Writing);
        let writer = self.writer();
        let progress = writer
            .write(bytes, object_type, offset_in, crc_in, |packet| self.emit_packet(packet))
            .await?;

        trace_state(ObjectState::Validating);
        let check = self.control.calculate_crc().await?;
        if check.offset != progress.offset {
            return Err(DfuError::InvalidOffset {
                expected: progress.offset,
                actual: check.offset,
            });
        }
        if check.crc32 != progress.crc32 {
            return Err(DfuError::InvalidCrc {
                expected: progress.crc32,
                actual: check.crc32,
            });
        }

        trace_state(ObjectState::Executing);
        self.control.execute().await?;
        trace_state(ObjectState::Done);

        Ok(progress)
    }
}

/// The Data-flow firmware-state computation from §4.3: what to resume, and
/// what is left to split into fresh objects.
struct FirmwareResumeState<'f> {
    start_offset: u32,
    start_crc: u32,
    partial: &'f [u8],
    remainder: &'f [u8],
}

impl<'f> FirmwareResumeState<'f> {
    fn compute(firmware: &'f [u8], offset: u32, max_size: u32, crc32_reported: u32) -> Self {
        let len = firmware.len() as u32;
        let remainder_in_object = if max_size == 0 { 0 } else { offset % max_size };

        let partial_is_candidate = offset != 0 && offset != len && remainder_in_object != 0;
        let partial_end = offset + (max_size - remainder_in_object);
        let partial_end = partial_end.min(len);

        if partial_is_candidate {
            let candidate_partial = &firmware[offset as usize..partial_end as usize];
            let resumable = crc32_reported == crc32(&firmware[..offset as usize]);
            if !resumable {
                // Cannot resume the currently open object: roll back to the
                // last object boundary and re-CREATE from there.
                let start_offset = offset - max_size + candidate_partial.len() as u32;
                let start_crc = crc32(&firmware[..start_offset as usize]);
                return Self {
                    start_offset,
                    start_crc,
                    partial: &[],
                    remainder: &firmware[start_offset as usize..],
                };
            }
            return Self {
                start_offset: offset,
                start_crc: crc32_reported,
                partial: candidate_partial,
                remainder: &firmware[partial_end as usize..],
            };
        }

        Self {
            start_offset: offset,
            start_crc: crc32_reported,
            partial: &[],
            remainder: &firmware[offset as usize..],
        }
    }
}

/// Split `data` into objects of at most `max_size` bytes each (§3 Object
/// invariant): `⌈len/max⌉` objects of `max, max, …, (len mod max or max)`.
fn split_into_objects(data: &[u8], max_size: u32) -> Vec<&[u8]> {
    if data.is_empty() || max_size == 0 {
        return Vec::new();
    }
    data.chunks(max_size as usize).collect()
}
