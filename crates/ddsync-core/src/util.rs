//! Utility functions for ddsync-core.

use btleplug::platform::PeripheralId;

use ddsync_types::PeripheralHandle;

/// Address btleplug reports when the platform hides the real one.
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats. This function extracts the useful
/// identifier string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_id_wrapper(&format!("{:?}", id))
}

/// Build a peripheral handle from an advertised address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn peripheral_handle(address: &str, peripheral_id: &PeripheralId) -> PeripheralHandle {
    PeripheralHandle::new(choose_identifier(address, || {
        format_peripheral_id(peripheral_id)
    }))
}

fn strip_id_wrapper(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

fn choose_identifier(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}
