//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements              | Connects to                   |
//! |------------|-------------------------|-------------------------------|
//! | `serial`   | PortConnector, Transport| RS-232 via `serialport`       |
//! | `sim`      | PortConnector, Transport| In-process NE-4000 emulator   |
//! | `time`     | TimePort                | System clock, thread sleep    |
//! | `log_sink` | EventSink               | `log` facade                  |

pub mod log_sink;
pub mod serial;
pub mod sim;
pub mod time;
