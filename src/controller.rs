//! `DfuController` (§4.4): drives the full update sequence — every slot an
//! update package contains, in the fixed application order — over a shared
//! transport.

use std::time::Duration;

use crate::adapter::GattAdapter;
use crate::error::DfuError;
use crate::object_writer::AbortHandle;
use crate::package::{Slot, UpdatePackage};
use crate::transport::{DfuTransport, ProgressUpdate};

pub struct DfuController<'a, A: GattAdapter> {
    transport: DfuTransport<'a, A>,
}

impl<'a, A: GattAdapter> DfuController<'a, A> {
    pub fn new(adapter: &'a A) -> Self {
        Self {
            transport: DfuTransport::new(adapter),
        }
    }

    pub fn with_timeout(adapter: &'a A, timeout: Duration) -> Self {
        Self {
            transport: DfuTransport::with_timeout(adapter, timeout),
        }
    }

    pub fn on_progress(&mut self, sink: impl Fn(ProgressUpdate) + Send + Sync + 'a) {
        self.transport.on_progress(sink);
    }

    pub async fn set_prn(&mut self, prn: u16) -> Result<(), DfuError> {
        self.transport.set_prn(prn).await
    }

    pub fn set_mtu(&mut self, mtu_size: usize) {
        self.transport.set_mtu(mtu_size);
    }

    /// A cheap handle to forward `abort()` calls to the underlying
    /// transport from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.transport.abort_handle()
    }

    pub fn abort(&self) {
        self.transport.abort();
    }

    /// Apply every update the package carries, in canonical slot order
    /// (softdevice, bootloader, softdevice_bootloader, application). Stops
    /// and surfaces the first error without attempting subsequent slots.
    /// Closes the transport once the whole sequence completes successfully.
    pub async fn run(&self, package: &UpdatePackage) -> Result<(), DfuError> {
        self.run_slots(package, &Slot::ALL_IN_ORDER).await
    }

    /// As `run`, but restricted to the given slots (e.g. a CLI subcommand
    /// that only wants to touch the application, leaving softdevice and
    /// bootloader updates to a separate invocation).
    pub async fn run_slots(&self, package: &UpdatePackage, slots: &[Slot]) -> Result<(), DfuError> {
        for (slot, update) in package.updates_in(slots) {
            log::info!("applying update for slot {slot:?}");
            self.transport.send_init_packet(&update.init_packet).await?;
            self.transport.send_firmware(&update.firmware).await?;
        }
        self.transport.close().await?;
        Ok(())
    }
}
