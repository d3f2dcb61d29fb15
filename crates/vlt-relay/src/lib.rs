//! Relay push client and its ancillary device-token machinery.
//!
//! The Relay is an external multi-tenant fan-out service; every request
//! is an HMAC-SHA256 signed JSON POST. Event and heartbeat sends are
//! fire-and-forget (log and drop); only pair-code creation propagates
//! its error to the caller.

pub mod client;
pub mod crypto;
pub mod pair;

pub use client::{sign, RelayClient, RelayConfig, RelayError, RelayEventType, UpsEvent};
pub use crypto::{token_hash, DeviceTokenCipher};
pub use pair::{generate_pair_code, PAIR_CODE_ALPHABET, PAIR_CODE_LEN};
