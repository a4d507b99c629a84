use std::fmt;

use anyhow::anyhow;
use nusb::DeviceInfo;

use super::{UsbPort, PRODUCT_ID, VENDOR_ID};

/// Gathers some information about an adapter which was found during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugProbeInfo {
    /// The product string of the adapter.
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// The serial number of the adapter, if it reports one.
    pub serial_number: Option<String>,
}

impl DebugProbeInfo {
    /// A selector that picks exactly this adapter again.
    pub fn selector(&self) -> DebugProbeSelector {
        DebugProbeSelector {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone(),
        }
    }
}

impl fmt::Display for DebugProbeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {serial}")?;
        }
        write!(f, " ({})", self.identifier)
    }
}

/// Finds all LittleWire/Digispark debugWIRE gateways.
#[tracing::instrument(skip_all)]
pub fn list_littlewire_devices() -> Vec<DebugProbeInfo> {
    tracing::debug!("searching for LittleWire adapters");
    let probes: Vec<_> = match nusb::list_devices() {
        Ok(devices) => devices.filter_map(|d| get_littlewire_info(&d)).collect(),
        Err(e) => {
            tracing::warn!("error listing devices with nusb: {:?}", e);
            vec![]
        }
    };
    tracing::debug!("found {} LittleWire adapters", probes.len());
    probes
}

/// Checks if a given device is a LittleWire gateway, returning
/// `Some(DebugProbeInfo)` if so.
fn get_littlewire_info(device: &DeviceInfo) -> Option<DebugProbeInfo> {
    if device.vendor_id() != VENDOR_ID || device.product_id() != PRODUCT_ID {
        return None;
    }
    Some(DebugProbeInfo {
        // The Digispark bootloader leaves the product string empty on
        // some firmware revisions.
        identifier: device.product_string().unwrap_or("Digispark").to_string(),
        vendor_id: device.vendor_id(),
        product_id: device.product_id(),
        serial_number: device.serial_number().map(Into::into),
    })
}

/// Picks one adapter as `VID:PID` (hex) with an optional trailing serial
/// number.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct DebugProbeSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl DebugProbeSelector {
    fn matches(&self, info: &DeviceInfo) -> bool {
        if (info.vendor_id(), info.product_id()) != (self.vendor_id, self.product_id) {
            return false;
        }
        match &self.serial_number {
            Some(serial) => info.serial_number() == Some(serial.as_str()),
            None => true,
        }
    }
}

impl TryFrom<String> for DebugProbeSelector {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (vid, rest) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected VID:PID[:serial], got {value:?}"))?;
        // Everything after the second colon is the serial number, which
        // may itself contain colons.
        let (pid, serial) = match rest.split_once(':') {
            Some((pid, serial)) => (pid, Some(serial.to_string())),
            None => (rest, None),
        };
        Ok(Self {
            vendor_id: u16::from_str_radix(vid, 16)?,
            product_id: u16::from_str_radix(pid, 16)?,
            serial_number: serial,
        })
    }
}

impl fmt::Display for DebugProbeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.serial_number {
            Some(serial) => write!(f, "{:04x}:{:04x}:{serial}", self.vendor_id, self.product_id),
            None => write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// Open the adapter matching `selector`.
///
/// The firmware answers vendor requests addressed to the device itself,
/// so no interface needs claiming.
pub fn open_device_from_selector(selector: &DebugProbeSelector) -> Result<UsbPort, anyhow::Error> {
    tracing::trace!("attempting to open adapter matching {}", selector);

    for device in nusb::list_devices()? {
        if selector.matches(&device) {
            return Ok(UsbPort::new(device.open()?));
        }
    }
    Err(anyhow!("no adapter matching {selector} found"))
}
