//! Raw HID report I/O over [hidapi].
use std::time::Duration;

use hidapi::HidDevice;

use crate::error::{AgentError, Result};
use crate::transport::{HidExchange, HidReportBytes, HidSendReportBytes, HID_RPT_SIZE};

impl HidExchange for HidDevice {
    fn write_report(&self, report: &HidReportBytes) -> Result<usize> {
        let mut buf: HidSendReportBytes = [0; HID_RPT_SIZE + 1];
        // buf[0] = 0; (report ID)
        buf[1..].copy_from_slice(report);
        trace!(">>> {:02x?}", report);
        let n = self.write(&buf)?;
        Ok(n.saturating_sub(1))
    }

    fn read_report(&self, timeout: Duration) -> Result<HidReportBytes> {
        let mut buf: HidReportBytes = [0; HID_RPT_SIZE];
        let n = self.read_timeout(&mut buf, timeout.as_millis() as i32)?;
        if n == 0 {
            return Err(AgentError::Timeout);
        }
        trace!("<<< {:02x?}", &buf[..n]);
        Ok(buf)
    }
}

/// `sendHid`: pads `data` with zeros to one full report and writes it.
/// Payloads over one report are rejected.
pub fn send_hid(device: &impl HidExchange, data: &[u8]) -> Result<usize> {
    if data.len() > HID_RPT_SIZE {
        return Err(AgentError::InvalidParams(format!(
            "HID packet too large: {} bytes (max {HID_RPT_SIZE})",
            data.len()
        )));
    }
    let mut report: HidReportBytes = [0; HID_RPT_SIZE];
    report[..data.len()].copy_from_slice(data);
    device.write_report(&report)
}

/// `receiveHid`: reads one report within `timeout`.
pub fn receive_hid(device: &impl HidExchange, timeout: Duration) -> Result<Vec<u8>> {
    device.read_report(timeout).map(|r| r.to_vec())
}
