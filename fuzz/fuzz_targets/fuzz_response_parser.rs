//! Fuzz target: `parse_response`
//!
//! Feeds arbitrary bytes (noise, partial frames, stray STX/ETX) to the
//! reply parser and asserts it never panics and that anything it accepts
//! has a sane address and a payload no longer than the input.
//!
//! cargo fuzz run fuzz_response_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use robotaste_pumps::codec::{CodecError, parse_response};

fuzz_target!(|data: &[u8]| {
    match parse_response(data) {
        Ok(reply) => {
            if let Some(address) = reply.address {
                assert!(address <= 99, "address echo is two digits");
            }
            assert!(reply.payload.len() <= data.len() * 3, "payload cannot outgrow input");
        }
        Err(CodecError::Empty | CodecError::Malformed(_) | CodecError::Rejected(_)) => {}
    }
});
