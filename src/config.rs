//! Client configuration. Use [`MeterConfigBuilder`] to create one.

use core::fmt;

use fugit::{ExtU32, MillisDurationU32};

use crate::engine::RetryPolicy;
use crate::error::ConfigError;
use crate::registers::{self, MeasurementKind, MeasurementRequest, Phase};

/// Address of one meter on the bus.
///
/// `0x00` is the Modbus broadcast address, which no device answers, and `0xF9..=0xFF` are
/// reserved. `0xF8` is the general address every PZEM answers to when it is alone on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    pub const GENERAL: DeviceAddress = DeviceAddress(0xF8);

    pub const fn get(&self) -> u8 {
        self.0
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self::GENERAL
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01..=0xF8 => Ok(DeviceAddress(value)),
            _ => Err(ConfigError::InvalidAddress(value)),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Validated, immutable client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    address: DeviceAddress,
    poll_interval: MillisDurationU32,
    requests: Vec<MeasurementRequest>,
    retry: RetryPolicy,
}

impl MeterConfig {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn poll_interval(&self) -> MillisDurationU32 {
        self.poll_interval
    }

    /// Polled measurements, without duplicates, in the order they were first requested.
    pub fn requests(&self) -> &[MeasurementRequest] {
        &self.requests
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn polls(&self, request: MeasurementRequest) -> bool {
        self.requests.contains(&request)
    }
}

/// Builder for [`MeterConfig`]. Nothing is validated until [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct MeterConfigBuilder {
    address: u8,
    poll_interval: MillisDurationU32,
    requests: Vec<MeasurementRequest>,
    retry: RetryPolicy,
    /// First error from a by-name request, reported by `build`.
    parse_error: Option<ConfigError>,
}

impl Default for MeterConfigBuilder {
    fn default() -> Self {
        Self::new(DeviceAddress::GENERAL.get())
    }
}

impl MeterConfigBuilder {
    /// Start a configuration for the meter at `address`, polled every 10 seconds.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            poll_interval: 10_000.millis(),
            requests: Vec::new(),
            retry: RetryPolicy::default(),
            parse_error: None,
        }
    }

    pub fn poll_interval(mut self, interval: MillisDurationU32) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn request(mut self, kind: MeasurementKind, phase: Phase) -> Self {
        self.requests.push(MeasurementRequest::new(kind, phase));
        self
    }

    pub fn requests(mut self, requests: impl IntoIterator<Item = MeasurementRequest>) -> Self {
        self.requests.extend(requests);
        self
    }

    /// Add a request by its configuration names, e.g. `("ACTIVE_POWER", Some("A"))`.
    pub fn request_named(mut self, kind: &str, phase: Option<&str>) -> Self {
        match MeasurementRequest::parse(kind, phase) {
            Ok(request) => self.requests.push(request),
            Err(err) => {
                self.parse_error.get_or_insert(err);
            }
        }
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn attempts(mut self, attempts: u8) -> Self {
        self.retry.attempts = attempts;
        self
    }

    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.retry.timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: MillisDurationU32) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<MeterConfig, ConfigError> {
        if let Some(err) = self.parse_error {
            return Err(err);
        }
        let address = DeviceAddress::try_from(self.address)?;
        if self.poll_interval.ticks() == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.retry.attempts == 0 || self.retry.timeout.ticks() == 0 {
            return Err(ConfigError::InvalidRetryPolicy);
        }

        let mut requests: Vec<MeasurementRequest> = Vec::with_capacity(self.requests.len());
        for request in self.requests {
            registers::lookup(request)?;
            if !requests.contains(&request) {
                requests.push(request);
            }
        }

        Ok(MeterConfig {
            address,
            poll_interval: self.poll_interval,
            requests,
            retry: self.retry,
        })
    }
}
