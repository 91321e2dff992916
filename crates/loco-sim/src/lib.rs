//! Virtual command stations
//!
//! This crate simulates model-railroad command stations so throttle code can
//! be exercised without layout hardware:
//!
//! - **DCC-EX**: answers `<t>`/`<F>` with `<l>` broadcasts, ignores `<->`
//! - **LocoNet**: hands out slots for `OPC_LOCO_ADR`, echoes every slot
//!   command the way the bus does
//!
//! Either can be told to stay silent, refuse acquisitions, or report
//! addresses as owned elsewhere.
//!
//! # Example
//!
//! ```rust
//! use loco_protocol::Protocol;
//! use loco_sim::VirtualCommandStation;
//!
//! let mut station = VirtualCommandStation::new("EX-CS", Protocol::DccEx);
//! station.process_bytes(b"<t 3 20 1>");
//!
//! while let Some(bytes) = station.take_output() {
//!     println!("Station output: {}", String::from_utf8_lossy(&bytes));
//! }
//! ```

pub mod error;
pub mod station;
pub mod station_task;

pub use error::SimError;
pub use station::{StationConfig, VirtualCommandStation};
pub use station_task::{run_virtual_station, StationCommand};
