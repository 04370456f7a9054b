//! This crate provides a polling client for the Peacefair PZEM-6L24 three-phase energy meter.
//!
//! Configure which measurements you want, subscribe to the ones you care about, and the client
//! polls the meter on a fixed interval and calls you back with every decoded value.
//!
//! Measurements available per phase (A, B, C) and combined:
//!
//! | Measurement                  | Per phase | Combined         | Unit |
//! |------------------------------|-----------|------------------|------|
//! | Voltage                      | yes       | mean of A, B, C  | V    |
//! | Current                      | yes       | no               | A    |
//! | Frequency                    | yes       | no               | Hz   |
//! | Voltage / current phase angle| yes       | no               | °    |
//! | Active / reactive / apparent power  | yes | yes            | W, var, VA |
//! | Active / reactive / apparent energy | yes | yes            | kWh, kvarh, kVAh |
//! | Power factor                 | yes       | yes              |      |
//!
//! It uses Modbus RTU under the hood, and is suitable for interfacing with the meter over
//! serial/UART or RS485.
//!
//! The serial port used for meter comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! ```no_run
//! # use embedded_io::{Read, ReadReady, Write};
//! # fn demo<S: Read + Write + ReadReady>(port: S) -> pzem6l24::error::Result<()> {
//! use pzem6l24::{MeasurementKind, MeterConfigBuilder, Phase, Pzem6l24, StdClock};
//!
//! let config = MeterConfigBuilder::new(0xF8)
//!     .request(MeasurementKind::Voltage, Phase::A)
//!     .request(MeasurementKind::ActivePower, Phase::Combined)
//!     .build()?;
//! let meter = Pzem6l24::new(port, StdClock::new(), config)?;
//! meter.subscribe(
//!     pzem6l24::MeasurementRequest::new(MeasurementKind::Voltage, Phase::A),
//!     |reading| println!("{}: {:.2}", reading.request, reading.value),
//! )?;
//! meter.run();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod meter;
pub mod registers;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod mock_serial;

pub use clock::{Clock, Instant, StdClock};
pub use config::{DeviceAddress, MeterConfig, MeterConfigBuilder};
pub use engine::{CancelToken, RetryPolicy};
pub use meter::Pzem6l24;
pub use registers::{MeasurementKind, MeasurementRequest, Phase};
pub use registry::{ObserverId, Reading};
pub use scheduler::PollReport;
