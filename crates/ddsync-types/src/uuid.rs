//! Bluetooth UUIDs and protocol constants for dd-device peripherals.
//!
//! Every dd-device exposes five custom services, each carrying exactly one
//! characteristic of the same functional group.

use uuid::{Uuid, uuid};

/// Advertised name prefix shared by all dd-device peripherals.
pub const DEVICE_NAME_PREFIX: &str = "dd-device-";

/// ASCII prefix of a push on the event-notify characteristic.
///
/// The push carries no record data; it only tells the client to poll the
/// event characteristic.
pub const EVENT_NOTIFICATION_PREFIX: &[u8] = b"new_event=";

// --- Service UUIDs ---

/// Pairing service.
pub const PAIR_SERVICE: Uuid = uuid!("0c060381-c0e0-4078-bcde-6fb7dbed763b");

/// Unpairing service.
pub const UNPAIR_SERVICE: Uuid = uuid!("d66b351a-0d06-4341-a050-a854aa552a95");

/// Sensor data service.
pub const DATA_SERVICE: Uuid = uuid!("9dce6733-198c-46e3-b138-9cce67b3d96c");

/// Event log service.
pub const EVENT_SERVICE: Uuid = uuid!("48241209-0402-41c0-a070-389cce673399");

/// Event notification service.
pub const EVENT_NOTIFY_SERVICE: Uuid = uuid!("77e90f18-69ae-4283-bf53-f940e4588afa");

// --- Characteristic UUIDs ---

/// Pairing characteristic.
pub const PAIR_CHARACTERISTIC: Uuid = uuid!("369bcde6-73b9-4cae-97eb-753a9dcee773");

/// Unpairing characteristic.
pub const UNPAIR_CHARACTERISTIC: Uuid = uuid!("b95caed7-eb75-4a9d-8e67-b359acd6eb75");

/// Sensor data characteristic (read-on-demand, one reading per read).
pub const DATA_CHARACTERISTIC: Uuid = uuid!("cae57239-9c4e-4793-89e4-72b9dc6e379b");

/// Event characteristic (read-on-demand, one event per read).
pub const EVENT_CHARACTERISTIC: Uuid = uuid!("6db65bad-d66b-45da-adf6-7bbd5eaf57ab");

/// Event notification characteristic, the only one that pushes.
pub const EVENT_NOTIFY_CHARACTERISTIC: Uuid = uuid!("a647940e-ebc1-4bd4-b273-a600929476cd");
