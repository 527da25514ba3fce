//! Fuzz target: `check_burst_response`
//!
//! Burst replies are unstructured; the scanner must never panic on them and
//! must flag every reply containing the out-of-range marker.
//!
//! cargo fuzz run fuzz_burst_response

#![no_main]

use libfuzzer_sys::fuzz_target;
use robotaste_pumps::codec::{Direction, VolumeUnit};
use robotaste_pumps::drivers::burst::{BurstPumpConfig, check_burst_response};

fuzz_target!(|data: &[u8]| {
    let reply = String::from_utf8_lossy(data);
    let pumps = [BurstPumpConfig {
        address: 0,
        rate_ul_min: 2000.0,
        volume_ul: 250.0,
        diameter_mm: 26.59,
        direction: Direction::Infuse,
        volume_unit: VolumeUnit::Ml,
        dual_syringe: false,
    }];
    let result = check_burst_response("0 RUN *", &reply, &pumps);
    assert_eq!(result.is_err(), reply.contains("OOR"));
});
