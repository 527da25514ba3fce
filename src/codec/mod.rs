//! NE-4000 wire protocol codec: pure functions, zero I/O.
//!
//! Command grammar:
//! ```text
//! [<2-digit address>]<CMD>[ <args>]<CR>
//! ```
//! Response grammar:
//! ```text
//! [STX][<2-digit address>]<status>[<value>[<unit>]] | ?<code>[ETX]
//! ```
//!
//! Numeric fields are capped at four digits by the pump firmware, so every
//! outgoing number goes through [`format`] and every reply through
//! [`response`].

pub mod format;
pub mod response;
pub mod syringe;
pub mod units;

pub use format::{
    MAX_RATE_UL_MIN, format_diameter, format_rate, format_volume, format_volume_ml,
    format_volume_ul,
};
pub use response::{CodecError, PumpResponse, parse_response};
pub use syringe::max_rate_for_diameter;
pub use units::{Direction, PumpStatus, RateUnit, VolumeUnit};

/// Carriage return terminating every outgoing command.
pub const CR: u8 = 0x0D;
/// Start-of-text byte framing a pump reply.
pub const STX: u8 = 0x02;
/// End-of-text byte framing a pump reply.
pub const ETX: u8 = 0x03;

/// Encode a single addressed command, e.g. `01RAT 2000 UM\r`.
pub fn encode_command(address: u8, command: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{address:02}{command}\r")
    } else {
        format!("{address:02}{command} {args}\r")
    }
}
