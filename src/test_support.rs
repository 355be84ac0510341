//! An in-memory fake DFU target used to unit-test the protocol engine
//! without a real BLE adapter. It behaves enough like the nRF bootloader to
//! drive `ControlPointService`, `ObjectWriter` and `DfuTransport` through
//! their real state machines: it tracks per-object-type `(offset, crc32)`,
//! answers `SELECT`/`CALCULATE_CRC`/`CREATE`/`EXECUTE`, and emits PRN
//! notifications after the configured packet count.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::adapter::{Characteristic, GattAdapter};
use crate::crc::crc32_update;
use crate::error::DfuError;
use crate::opcode::{ObjectType, Opcode, ResultCode};

#[derive(Default, Clone)]
struct ObjectState {
    max_size: u32,
    offset: u32,
    crc32: u32,
}

struct Inner {
    command: ObjectState,
    data: ObjectState,
    prn: u16,
    packets_since_prn: u16,
    control_point_notifications: VecDeque<Vec<u8>>,
    control_point_writes: Vec<Vec<u8>>,
    packet_writes: Vec<Vec<u8>>,
    fail_next_create: Option<ResultCode>,
    notifications_enabled: bool,
}

/// A scripted / auto-responding fake DFU target.
pub struct FakeAdapter {
    inner: Mutex<Inner>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                command: ObjectState {
                    max_size: 256,
                    offset: 0,
                    crc32: 0,
                },
                data: ObjectState {
                    max_size: 200,
                    offset: 0,
                    crc32: 0,
                },
                prn: 0,
                packets_since_prn: 0,
                control_point_notifications: VecDeque::new(),
                control_point_writes: Vec::new(),
                packet_writes: Vec::new(),
                fail_next_create: None,
                notifications_enabled: false,
            }),
        }
    }

    /// Seed the target's remembered state for an object type, as if a prior
    /// (possibly interrupted) session had left it there.
    pub fn seed(&self, obj_type: ObjectType, max_size: u32, offset: u32, crc32: u32) {
        let mut inner = self.inner.lock().unwrap();
        let state = match obj_type {
            ObjectType::Command => &mut inner.command,
            ObjectType::Data => &mut inner.data,
        };
        *state = ObjectState { max_size, offset, crc32 };
    }

    pub fn set_max_size(&self, obj_type: ObjectType, max_size: u32) {
        let mut inner = self.inner.lock().unwrap();
        let state = match obj_type {
            ObjectType::Command => &mut inner.command,
            ObjectType::Data => &mut inner.data,
        };
        state.max_size = max_size;
    }

    /// The next `CREATE` request will fail with `result`, once.
    pub fn fail_next_create(&self, result: ResultCode) {
        self.inner.lock().unwrap().fail_next_create = Some(result);
    }

    pub fn packet_writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().packet_writes.clone()
    }

    pub fn control_point_writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().control_point_writes.clone()
    }

    pub fn create_count(&self) -> usize {
        self.count_opcode(Opcode::Create)
    }

    pub fn execute_count(&self) -> usize {
        self.count_opcode(Opcode::Execute)
    }

    fn count_opcode(&self, opcode: Opcode) -> usize {
        let expected: u8 = opcode.into();
        self.inner
            .lock()
            .unwrap()
            .control_point_writes
            .iter()
            .filter(|w| w.first() == Some(&expected))
            .count()
    }

    /// Push a raw, already-framed control-point notification (header +
    /// opcode + result + body) to be returned by the next `next_notification`
    /// call. Used to test malformed/unexpected responses.
    pub fn push_raw_control_point_response(&self, frame: Vec<u8>) {
        self.inner.lock().unwrap().control_point_notifications.push_back(frame);
    }

    pub fn push_select_response(&self, max_size: u32, offset: u32, crc32: u32) {
        let mut frame = vec![0x60, Opcode::Select.into(), ResultCode::Success.into()];
        frame.extend_from_slice(&max_size.to_le_bytes());
        frame.extend_from_slice(&offset.to_le_bytes());
        frame.extend_from_slice(&crc32.to_le_bytes());
        self.push_raw_control_point_response(frame);
    }

    fn object_state_mut<'a>(inner: &'a mut Inner, obj_type: ObjectType) -> &'a mut ObjectState {
        match obj_type {
            ObjectType::Command => &mut inner.command,
            ObjectType::Data => &mut inner.data,
        }
    }

    fn success_frame(opcode: Opcode, mut body: Vec<u8>) -> Vec<u8> {
        let mut frame = vec![0x60, opcode.into(), ResultCode::Success.into()];
        frame.append(&mut body);
        frame
    }

    fn error_frame(opcode: Opcode, result: ResultCode) -> Vec<u8> {
        vec![0x60, opcode.into(), result.into()]
    }
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GattAdapter for FakeAdapter {
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), DfuError> {
        match characteristic {
            Characteristic::Packet => {
                let mut inner = self.inner.lock().unwrap();
                inner.packet_writes.push(data.to_vec());
                let current = {
                    // The fake target tracks whichever object type was most
                    // recently CREATEd or SELECTed; for simplicity (and
                    // because the protocol never interleaves object types
                    // mid-transfer) we infer it from the last CREATE/SELECT
                    // control-point write.
                    inner
                        .control_point_writes
                        .iter()
                        .rev()
                        .find_map(|w| match w.first().copied() {
                            Some(op) if op == Opcode::Create.into() || op == Opcode::Select.into() => {
                                ObjectType::try_from(w[1]).ok()
                            }
                            _ => None,
                        })
                        .unwrap_or(ObjectType::Data)
                };
                let state = Self::object_state_mut(&mut inner, current);
                state.offset += data.len() as u32;
                state.crc32 = crc32_update(state.crc32, data);
                inner.packets_since_prn += 1;
                if inner.prn != 0 && inner.packets_since_prn == inner.prn {
                    inner.packets_since_prn = 0;
                    let offset = state.offset;
                    let crc32 = state.crc32;
                    let frame = Self::success_frame(
                        Opcode::CalculateCrc,
                        [offset.to_le_bytes(), crc32.to_le_bytes()].concat(),
                    );
                    inner.control_point_notifications.push_back(frame);
                }
                Ok(())
            }
            Characteristic::ControlPoint => {
                let mut inner = self.inner.lock().unwrap();
                inner.control_point_writes.push(data.to_vec());
                let opcode = Opcode::try_from(data[0]).expect("unknown opcode written in test");
                let frame = match opcode {
                    Opcode::Create => {
                        if let Some(result) = inner.fail_next_create.take() {
                            Self::error_frame(Opcode::Create, result)
                        } else {
                            let obj_type = ObjectType::try_from(data[1]).unwrap();
                            let size = u32::from_le_bytes(data[2..6].try_into().unwrap());
                            let state = Self::object_state_mut(&mut inner, obj_type);
                            *state = ObjectState {
                                max_size: state.max_size.max(size),
                                offset: 0,
                                crc32: 0,
                            };
                            inner.packets_since_prn = 0;
                            Self::success_frame(Opcode::Create, Vec::new())
                        }
                    }
                    Opcode::SetPrn => {
                        inner.prn = u16::from_le_bytes(data[1..3].try_into().unwrap());
                        inner.packets_since_prn = 0;
                        Self::success_frame(Opcode::SetPrn, Vec::new())
                    }
                    Opcode::CalculateCrc => {
                        // Determine which object is "current" the same way packet writes do.
                        let current = inner
                            .control_point_writes
                            .iter()
                            .rev()
                            .skip(1)
                            .find_map(|w| match w.first().copied() {
                                Some(op) if op == Opcode::Create.into() || op == Opcode::Select.into() => {
                                    ObjectType::try_from(w[1]).ok()
                                }
                                _ => None,
                            })
                            .unwrap_or(ObjectType::Data);
                        let state = Self::object_state_mut(&mut inner, current);
                        Self::success_frame(
                            Opcode::CalculateCrc,
                            [state.offset.to_le_bytes(), state.crc32.to_le_bytes()].concat(),
                        )
                    }
                    Opcode::Execute => Self::success_frame(Opcode::Execute, Vec::new()),
                    Opcode::Select => {
                        let obj_type = ObjectType::try_from(data[1]).unwrap();
                        let state = Self::object_state_mut(&mut inner, obj_type).clone();
                        Self::success_frame(
                            Opcode::Select,
                            [
                                state.max_size.to_le_bytes(),
                                state.offset.to_le_bytes(),
                                state.crc32.to_le_bytes(),
                            ]
                            .concat(),
                        )
                    }
                    Opcode::Response => unreachable!("host never writes a RESPONSE opcode"),
                };
                inner.control_point_notifications.push_back(frame);
                Ok(())
            }
        }
    }

    async fn enable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError> {
        if characteristic == Characteristic::ControlPoint {
            self.inner.lock().unwrap().notifications_enabled = true;
        }
        Ok(())
    }

    async fn disable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError> {
        if characteristic == Characteristic::ControlPoint {
            self.inner.lock().unwrap().notifications_enabled = false;
        }
        Ok(())
    }

    async fn next_notification(
        &self,
        characteristic: Characteristic,
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError> {
        debug_assert_eq!(characteristic, Characteristic::ControlPoint);
        let popped = self.inner.lock().unwrap().control_point_notifications.pop_front();
        match popped {
            Some(frame) => Ok(frame),
            None => {
                tokio::time::sleep(timeout).await;
                Err(DfuError::NotificationTimeout)
            }
        }
    }
}
