//! Device identity: classifying a USB device by (vendor, product) and
//! deriving the two keys the scanner tracks it by.

use rusb::{Device, UsbContext};
use serde::Serialize;

/// Which boot-ROM family a device belongs to. Determines the blob
/// subdirectory and the session's terminal step count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    Cm3Like,
    Cm4,
}

impl Family {
    /// Terminal `step` value for a session of this family.
    pub fn last_step(self) -> u32 {
        match self {
            Family::Cm3Like => 40,
            Family::Cm4 => 10,
        }
    }

    /// Blob-root subdirectory this family's files live under.
    pub fn blob_subdir(self) -> &'static str {
        match self {
            Family::Cm3Like => "raspberrypi",
            Family::Cm4 => "cm4",
        }
    }
}

/// The result of classifying a device's (vendor, product) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    BootCapable(Family),
    MassStorageOfInterest,
    Unrelated,
}

const BCM2708_BOOT: (u16, u16) = (0x0a5c, 0x2763);
const BCM2710_BOOT: (u16, u16) = (0x0a5c, 0x2764);
const BCM2711_BOOT: (u16, u16) = (0x0a5c, 0x2711);
const CM4_MASS_STORAGE: (u16, u16) = (0x0a5c, 0x0001);
const CM3_MASS_STORAGE: (u16, u16) = (0x0525, 0xa4a5);

/// Classifies a device by its raw vendor/product id pair. Pure, total over
/// the full `u16` x `u16` space.
pub fn classify(vendor_id: u16, product_id: u16) -> Classification {
    match (vendor_id, product_id) {
        BCM2708_BOOT | BCM2710_BOOT => Classification::BootCapable(Family::Cm3Like),
        BCM2711_BOOT => Classification::BootCapable(Family::Cm4),
        CM4_MASS_STORAGE | CM3_MASS_STORAGE => Classification::MassStorageOfInterest,
        _ => Classification::Unrelated,
    }
}

/// Topological port identifier, stable across re-enumerations at the same
/// physical USB port. This is the session key.
pub fn port_id<T: UsbContext>(device: &Device<T>) -> String {
    let bus = device.bus_number();
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let chain: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{bus}-{}", chain.join("."))
        }
        _ => format!("{bus}"),
    }
}

/// Coarse bus:address identifier, used only to dedup classification across
/// the initial sweep and live attach events. Deliberately distinct from
/// `port_id`: an address is reassigned on every re-enumeration, a port
/// chain is not.
pub fn device_id<T: UsbContext>(device: &Device<T>) -> String {
    format!("{}:{}", device.bus_number(), device.address())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_ids() {
        assert_eq!(
            classify(0x0a5c, 0x2763),
            Classification::BootCapable(Family::Cm3Like)
        );
        assert_eq!(
            classify(0x0a5c, 0x2764),
            Classification::BootCapable(Family::Cm3Like)
        );
        assert_eq!(
            classify(0x0a5c, 0x2711),
            Classification::BootCapable(Family::Cm4)
        );
        assert_eq!(
            classify(0x0a5c, 0x0001),
            Classification::MassStorageOfInterest
        );
        assert_eq!(
            classify(0x0525, 0xa4a5),
            Classification::MassStorageOfInterest
        );
    }

    #[test]
    fn classifies_unknown_as_unrelated() {
        assert_eq!(classify(0x1234, 0x5678), Classification::Unrelated);
        assert_eq!(classify(0x0a5c, 0x9999), Classification::Unrelated);
    }

    #[test]
    fn last_step_matches_family() {
        assert_eq!(Family::Cm3Like.last_step(), 40);
        assert_eq!(Family::Cm4.last_step(), 10);
    }
}
