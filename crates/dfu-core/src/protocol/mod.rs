//! Protocol module - upgrade protocol definitions.

pub mod constants;
pub mod message;
pub mod status;

pub use constants::*;
pub use message::{Action, HostMessage, HostResponse, MessageError, ShortResponse};
pub use status::UpgradeStatus;
