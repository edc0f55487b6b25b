// ── Bridge domain model ──
//
// Devices, their properties, and the closed property-type table that
// decides how every property value is decoded from the hub, rendered on
// MQTT and coerced back from inbound commands.

pub mod device;
pub mod device_id;
pub mod property_table;
pub mod scalar;
pub mod update;

pub use device::{Device, Property};
pub use device_id::DeviceId;
pub use property_table::{EnumLabel, PropertySpec, PropertyTable, is_reserved_segment};
pub use scalar::{Scalar, ValueKind};
pub use update::{DeviceListing, FieldUpdate, PushUpdate};

pub use pushok_api::FieldAddress;
