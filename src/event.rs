//! Domain events decoded from Conclave broadcast traffic.

use serde_json::Value;

/// Wire event names the device stream understands.
mod names {
    pub const PERIPHERAL_LIST: &str = "peripheralList";
    pub const ATTR_CHANGE: &str = "attr_change";
    pub const STATUS_CHANGE: &str = "status_change";
    pub const DEVICE_OTA: &str = "device_ota";
    pub const DEVICE_OTA_PROGRESS: &str = "device_ota_progress";
    pub const DEVICE_ERROR: &str = "device_error";
    pub const DEVICE_MUTE: &str = "device_mute";
    pub const INVALIDATE: &str = "invalidate";
}

pub use names::INVALIDATE as INVALIDATE_EVENT;

/// An `invalidate` broadcast routed to the account-invalidation path.
#[derive(Clone, Debug, PartialEq)]
pub struct InvalidationEvent {
    /// What was invalidated (`profiles`, `timezone`, ...), when the server
    /// said.
    pub kind: Option<String>,
    pub data: Value,
}

impl InvalidationEvent {
    pub fn from_data(data: Value) -> Self {
        let kind = data
            .get("kind")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { kind, data }
    }
}

/// Typed device-stream traffic the façade republishes.
///
/// Payloads beyond the routing fields stay opaque JSON; device-profile
/// modeling belongs to the consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceStreamEvent {
    /// Full peripheral snapshot for the channel.
    PeripheralList { peripherals: Value, seq: Option<u32> },
    AttributeChange {
        device_id: Option<String>,
        seq: Option<u32>,
        data: Value,
    },
    StatusChange {
        device_id: Option<String>,
        seq: Option<u32>,
        data: Value,
    },
    OtaAvailable {
        device_id: Option<String>,
        data: Value,
    },
    OtaProgress {
        device_id: Option<String>,
        data: Value,
    },
    DeviceError {
        device_id: Option<String>,
        data: Value,
    },
    DeviceMute {
        device_id: Option<String>,
        timeout_seconds: Option<u64>,
        data: Value,
    },
    /// Generic invalidation delivered as a device event. The façade
    /// intercepts `invalidate` broadcasts before this variant is reached;
    /// it exists for consumers decoding raw data events themselves.
    Invalidate {
        kind: Option<String>,
        device_id: Option<String>,
        data: Value,
    },
}

fn device_id_of(data: &Value) -> Option<String> {
    data.get("deviceId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl DeviceStreamEvent {
    /// Map a wire event name and payload to a typed event.
    ///
    /// Returns None for names this client does not recognize; callers log
    /// and drop those.
    pub fn decode(event: &str, seq: Option<u32>, data: Value) -> Option<Self> {
        match event {
            names::PERIPHERAL_LIST => Some(Self::PeripheralList {
                peripherals: data,
                seq,
            }),
            names::ATTR_CHANGE => Some(Self::AttributeChange {
                device_id: device_id_of(&data),
                seq,
                data,
            }),
            names::STATUS_CHANGE => Some(Self::StatusChange {
                device_id: device_id_of(&data),
                seq,
                data,
            }),
            names::DEVICE_OTA => Some(Self::OtaAvailable {
                device_id: device_id_of(&data),
                data,
            }),
            names::DEVICE_OTA_PROGRESS => Some(Self::OtaProgress {
                device_id: device_id_of(&data),
                data,
            }),
            names::DEVICE_ERROR => Some(Self::DeviceError {
                device_id: device_id_of(&data),
                data,
            }),
            names::DEVICE_MUTE => Some(Self::DeviceMute {
                device_id: device_id_of(&data),
                timeout_seconds: data.get("timeout").and_then(Value::as_u64),
                data,
            }),
            names::INVALIDATE => Some(Self::Invalidate {
                kind: data.get("kind").and_then(Value::as_str).map(str::to_string),
                device_id: device_id_of(&data),
                data,
            }),
            _ => None,
        }
    }
}
