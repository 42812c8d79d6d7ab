//! Wire vocabulary shared by the relay server and the drive client: the
//! single-byte command alphabet, relay text payloads, and BLE profile
//! configuration.

mod command;
mod profile;
mod relay;

pub use command::{Command, CommandParseError, COMMAND_CODES};
pub use profile::{
    advertised_services, is_uuid128, parse_profiles, validate_profiles, BleProfile, HealthReport,
    ProfileReport, ProfileValidation, RemoteConfig, GENERIC_ACCESS_SERVICE,
    GENERIC_ATTRIBUTE_SERVICE,
};
pub use relay::{normalize_host, relay_url, RelayPayload, PING, PONG, RELAY_PATH};
