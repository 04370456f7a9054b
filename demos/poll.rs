use std::env;

use fugit::ExtU32;
use inquire::Select;
use pzem6l24::{MeasurementKind, MeasurementRequest, MeterConfigBuilder, Phase, Pzem6l24, StdClock};
use serialport::SerialPort;

// Configuration constants - adjust these for your setup
const BAUD_RATE: u32 = 9600;
// Only used for reads of bytes already waiting, the client does its own response timeouts.
const SERIAL_TIMEOUT_MS: u64 = 50;
const MODBUS_ADDRESS: u8 = 0xF8;
const POLL_INTERVAL_MS: u32 = 2000;

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
            std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::AlreadyExists => embedded_io::ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

impl embedded_io::ReadReady for PortWrapper {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        self.0
            .bytes_to_read()
            .map(|pending| pending > 0)
            .map_err(|err| IoError(err.into()))
    }
}

fn main() {
    env_logger::init();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        // List available serial ports
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");

        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

        // Interactive selection
        Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port")
    });

    println!("Using port: {}", port_name);

    // Open serial port
    let port = serialport::new(&port_name, BAUD_RATE)
        .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .expect("Failed to open serial port");

    let port = PortWrapper(port);

    let config = MeterConfigBuilder::new(MODBUS_ADDRESS)
        .poll_interval(POLL_INTERVAL_MS.millis())
        .request(MeasurementKind::Voltage, Phase::A)
        .request(MeasurementKind::Voltage, Phase::B)
        .request(MeasurementKind::Voltage, Phase::C)
        .request(MeasurementKind::Current, Phase::A)
        .request(MeasurementKind::ActivePower, Phase::Combined)
        .request(MeasurementKind::ActiveEnergy, Phase::Combined)
        .request(MeasurementKind::PowerFactor, Phase::Combined)
        .build()
        .expect("Invalid meter configuration");

    let meter = Pzem6l24::new(port, StdClock::new(), config).expect("Failed to create client");
    meter.log_config();

    // A single read before polling starts, to check the meter is there at all.
    let frequency = MeasurementRequest::new(MeasurementKind::Frequency, Phase::A);
    match meter.read(frequency) {
        Ok(value) => println!("Line frequency: {:.2} Hz", value),
        Err(err) => eprintln!("Meter did not answer: {}", err),
    }

    for &request in meter.config().requests() {
        meter
            .subscribe(request, |reading| {
                println!(
                    "[{:>6}] {}: {:.2}",
                    reading.sequence, reading.request, reading.value
                )
            })
            .expect("Failed to subscribe");
    }

    // Stop after ten cycles.
    let cancel = meter.cancel_token();
    let energy = MeasurementRequest::new(MeasurementKind::ActiveEnergy, Phase::Combined);
    meter
        .subscribe(energy, move |reading| {
            if reading.sequence >= 10 {
                cancel.cancel();
            }
        })
        .expect("Failed to subscribe");

    meter.run();
}
