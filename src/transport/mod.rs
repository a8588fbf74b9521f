//! Transport seams.
//!
//! Protocol engines are generic over these traits rather than over concrete
//! `hidapi` / `pcsc` handles, so the CTAPHID and APDU state machines can be
//! exercised byte-for-byte against scripted devices in tests.
pub mod ctaphid;
pub mod hid;
pub mod iso7816;
pub mod pcsc;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use crate::error::Result;

/// USB HID report size used by all Feitian key interfaces.
pub const HID_RPT_SIZE: usize = 64;
/// A report as read from the device.
pub type HidReportBytes = [u8; HID_RPT_SIZE];
/// A report as written to the device: report ID zero, then the report.
pub type HidSendReportBytes = [u8; HID_RPT_SIZE + 1];

/// Default deadline for a single report read.
pub const HID_READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// One open HID interface, able to move single 64-byte reports.
pub trait HidExchange {
    /// Writes a single report. Returns the number of report bytes written
    /// (excluding the report ID).
    fn write_report(&self, report: &HidReportBytes) -> Result<usize>;

    /// Reads a single report, failing with `TIMEOUT` if none arrives within
    /// the deadline.
    fn read_report(&self, timeout: Duration) -> Result<HidReportBytes>;
}

/// One connected smart card, able to exchange a single raw APDU.
pub trait ApduExchange {
    /// Transmits a command APDU and returns the full response including the
    /// trailing `SW1 SW2`.
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>>;
}
