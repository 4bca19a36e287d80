//! Optical media placement.
//!
//! CD-ROM drives go on the chipset's built-in IDE bus while there is room.
//! When fixed disks use plain IDE they occupy the first IDE slots, leaving
//! fewer for optical drives. Whatever does not fit is attached as a SCSI LUN
//! behind a single USB mass-storage adapter (`usb-bot`), declared on demand.

use std::path::Path;

use super::DiskBusMode;

/// Chipset family, as far as the built-in IDE bus is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineClass {
    /// i440FX (`pc`): PIIX IDE, two buses.
    Legacy,
    /// Q35: ICH9 AHCI, six ports.
    Modern,
    /// No IDE bus assumed (e.g. `virt`).
    Other,
}

impl MachineClass {
    pub fn classify(machine: &str) -> Self {
        if machine == "pc" || machine.starts_with("pc-i440fx") {
            MachineClass::Legacy
        } else if machine == "q35" || machine.starts_with("pc-q35") {
            MachineClass::Modern
        } else {
            MachineClass::Other
        }
    }

    pub fn ide_slots(self) -> usize {
        match self {
            MachineClass::Legacy => 2,
            MachineClass::Modern => 6,
            MachineClass::Other => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Attached as `ide-cd` on `ide.<bus>`.
    Ide { bus: usize },
    /// Attached as `scsi-cd` on the `usb-bot` adapter.
    Overflow {
        lun: usize,
        /// Set on the first overflow image only; the adapter must be declared
        /// before its first LUN.
        declare_adapter: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    /// Image path with commas already escaped for QEMU option syntax.
    pub image: String,
    pub slot: Slot,
}

/// Escape a value for embedding in a QEMU `key=value,...` option string.
/// QEMU escapes a literal comma by doubling it.
pub fn escape_commas(value: &str) -> String {
    value.replace(',', ",,")
}

/// IDE slots left for optical drives after fixed disks took theirs.
pub fn free_ide_slots(machine: MachineClass, disk_bus: DiskBusMode, disk_count: usize) -> usize {
    let capacity = machine.ide_slots();
    match disk_bus {
        DiskBusMode::None => capacity.saturating_sub(disk_count),
        DiskBusMode::Blk | DiskBusMode::Scsi => capacity,
    }
}

/// Assign every image, in order, to an IDE slot or an overflow LUN.
///
/// IDE bus numbers continue after the slots used by disks; LUNs start at 0.
pub fn allocate_optical_slots<P: AsRef<Path>>(
    machine: MachineClass,
    disk_bus: DiskBusMode,
    disk_count: usize,
    images: &[P],
) -> Vec<SlotAssignment> {
    let capacity = machine.ide_slots();
    let free = free_ide_slots(machine, disk_bus, disk_count);
    let first_bus = capacity - free;

    images
        .iter()
        .enumerate()
        .map(|(idx, image)| {
            let slot = if idx < free {
                Slot::Ide { bus: first_bus + idx }
            } else {
                Slot::Overflow {
                    lun: idx - free,
                    declare_adapter: idx == free,
                }
            };
            SlotAssignment {
                image: escape_commas(&image.as_ref().to_string_lossy()),
                slot,
            }
        })
        .collect()
}
