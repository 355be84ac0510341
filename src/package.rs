//! Update-package reader (§4.5): extracts the manifest and per-update
//! payloads from a DFU ZIP container.

use std::io::Read;
use std::path::Path;

use crate::error::DfuError;

/// One of the four update slots a DFU package manifest can describe.
/// Updates are always applied in this order, application last.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Slot {
    Softdevice,
    Bootloader,
    SoftdeviceBootloader,
    Application,
}

impl Slot {
    pub const ALL_IN_ORDER: [Slot; 4] = [
        Slot::Softdevice,
        Slot::Bootloader,
        Slot::SoftdeviceBootloader,
        Slot::Application,
    ];

    fn manifest_key(self) -> &'static str {
        match self {
            Slot::Softdevice => "softdevice",
            Slot::Bootloader => "bootloader",
            Slot::SoftdeviceBootloader => "softdevice_bootloader",
            Slot::Application => "application",
        }
    }
}

/// Metadata carried only by the `softdevice_bootloader` slot. The protocol
/// engine does not interpret these; they are surfaced for callers that want
/// to display or sanity-check them.
#[derive(Debug, Copy, Clone, Default)]
pub struct ReadOnlyMetadata {
    pub bl_size: Option<u32>,
    pub sd_size: Option<u32>,
}

/// One extracted update: an init packet and the firmware it describes.
/// Both are opaque byte buffers to the protocol engine.
pub struct Update {
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
    pub metadata: ReadOnlyMetadata,
}

/// A parsed DFU update package: the manifest plus every payload it names,
/// read eagerly at open time.
pub struct UpdatePackage {
    updates: Vec<(Slot, Update)>,
}

impl UpdatePackage {
    /// Open `path`, parse `manifest.json`, and eagerly read every payload
    /// the manifest references. Fails with `PackageInvalid` if the archive
    /// has no manifest, the manifest is malformed JSON, or a referenced
    /// file is missing from the archive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DfuError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| DfuError::PackageInvalid(format!("cannot open package: {e}")))?;
        Self::read(file)
    }

    /// Parse a package from any seekable reader (e.g. a file or an
    /// in-memory `Cursor`, handy for tests and for packages fetched over
    /// the network).
    pub fn read<R: Read + std::io::Seek>(reader: R) -> Result<Self, DfuError> {
        let mut zip = zip::ZipArchive::new(reader)
            .map_err(|e| DfuError::PackageInvalid(format!("not a zip archive: {e}")))?;

        let manifest: serde_json::Value = {
            let manifest_entry = zip
                .by_name("manifest.json")
                .map_err(|_| DfuError::PackageInvalid("missing manifest.json".into()))?;
            serde_json::from_reader(manifest_entry)
                .map_err(|e| DfuError::PackageInvalid(format!("invalid manifest.json: {e}")))?
        };
        let manifest = manifest
            .get("manifest")
            .ok_or_else(|| DfuError::PackageInvalid("manifest.json missing `manifest` field".into()))?;

        let mut updates = Vec::new();
        for slot in Slot::ALL_IN_ORDER {
            let Some(entry) = manifest.get(slot.manifest_key()) else {
                continue;
            };
            updates.push((slot, Self::read_update(&mut zip, entry)?));
        }

        Ok(Self { updates })
    }

    fn read_update<R: Read + std::io::Seek>(
        zip: &mut zip::ZipArchive<R>,
        entry: &serde_json::Value,
    ) -> Result<Update, DfuError> {
        let dat_file = entry
            .get("dat_file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DfuError::PackageInvalid("manifest entry missing dat_file".into()))?;
        let bin_file = entry
            .get("bin_file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DfuError::PackageInvalid("manifest entry missing bin_file".into()))?;

        let init_packet = Self::read_file(zip, dat_file)?;
        let firmware = Self::read_file(zip, bin_file)?;

        let metadata = entry
            .get("info_read_only_metadata")
            .map(|meta| ReadOnlyMetadata {
                bl_size: meta.get("bl_size").and_then(|v| v.as_u64()).map(|v| v as u32),
                sd_size: meta.get("sd_size").and_then(|v| v.as_u64()).map(|v| v as u32),
            })
            .unwrap_or_default();

        Ok(Update {
            init_packet,
            firmware,
            metadata,
        })
    }

    fn read_file<R: Read + std::io::Seek>(zip: &mut zip::ZipArchive<R>, name: &str) -> Result<Vec<u8>, DfuError> {
        let mut entry = zip
            .by_name(name)
            .map_err(|_| DfuError::PackageInvalid(format!("referenced file `{name}` not found in archive")))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| DfuError::PackageInvalid(format!("failed to read `{name}`: {e}")))?;
        Ok(data)
    }

    /// Updates in the canonical application order (softdevice, bootloader,
    /// softdevice_bootloader, application), skipping slots the manifest
    /// didn't mention.
    pub fn updates(&self) -> impl Iterator<Item = &(Slot, Update)> {
        self.updates.iter()
    }

    /// Updates restricted to the given slots, still in canonical order.
    pub fn updates_in(&self, slots: &[Slot]) -> impl Iterator<Item = &(Slot, Update)> {
        self.updates.iter().filter(|(slot, _)| slots.contains(slot))
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
