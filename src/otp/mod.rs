//! OTP slot programming over vendor CTAPHID frames.
//!
//! Frames ride the `CTAPHID_VENDOR_OTP` command on an allocated channel.
//! Request payload: opcode byte, then opcode-specific fields. Response
//! payload: result byte (zero on success), then data.
//!
//! Slot records on the wire:
//! `configured(1) digits(1) counter(4 BE) secret_len(1) secret
//!  label_len(1) label`.
pub mod seed;

use std::time::Duration;

use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::transport::ctaphid::{CtapHidChannel, Response, CTAPHID_VENDOR_OTP};
use crate::transport::HidExchange;

const OP_STATUS: u8 = 0x01;
const OP_READ: u8 = 0x02;
const OP_WRITE: u8 = 0x03;
const OP_DELETE: u8 = 0x04;

const OTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum label bytes in a slot record.
const MAX_LABEL_LEN: usize = 32;

/// `otpReadSlot` result. The secret never appears here.
#[derive(Debug, Clone, Serialize)]
pub struct OtpSlot {
    /// `1` short-press, `2` long-press.
    pub slot: u8,
    pub configured: bool,
    pub label: Option<String>,
    pub digits: u8,
    pub counter: u32,
    pub algorithm: &'static str,
}

/// `otpWriteSlot` result.
#[derive(Debug, Clone, Serialize)]
pub struct OtpWriteResult {
    pub slot: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// A full slot record, secret included. Engine-internal: used to carry a
/// slot across `swap`, never serialized to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotRecord {
    configured: bool,
    digits: u8,
    counter: u32,
    secret: Vec<u8>,
    label: String,
}

impl SlotRecord {
    fn parse(data: &[u8]) -> Result<Self> {
        let too_short = || AgentError::Io("short OTP slot record".to_string());
        if data.len() < 7 {
            return Err(too_short());
        }
        let configured = data[0] != 0;
        let digits = data[1];
        let counter = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let secret_len = usize::from(data[6]);
        let rest = data.get(7..).ok_or_else(too_short)?;
        if rest.len() < secret_len + 1 {
            return Err(too_short());
        }
        let secret = rest[..secret_len].to_vec();
        let label_len = usize::from(rest[secret_len]);
        let label_bytes = rest
            .get(secret_len + 1..secret_len + 1 + label_len)
            .ok_or_else(too_short)?;
        Ok(SlotRecord {
            configured,
            digits,
            counter,
            secret,
            label: String::from_utf8_lossy(label_bytes).into_owned(),
        })
    }
}

fn exchange(hid: &impl HidExchange, payload: &[u8]) -> Result<Vec<u8>> {
    let channel = CtapHidChannel::open(hid)?;
    exchange_on(hid, &channel, payload)
}

fn exchange_on(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match channel.exchange(hid, CTAPHID_VENDOR_OTP, payload, OTP_TIMEOUT)? {
        Response::Vendor(data) => {
            let (&code, rest) = data
                .split_first()
                .ok_or_else(|| AgentError::Io("empty OTP response".to_string()))?;
            if code != 0 {
                return Err(AgentError::Io(format!("OTP command failed: 0x{code:02X}")));
            }
            Ok(rest.to_vec())
        }
        r => {
            error!("unexpected OTP response: {r:?}");
            Err(AgentError::Io("unexpected CTAPHID response".to_string()))
        }
    }
}

fn check_slot(slot: u8) -> Result<()> {
    if slot == 1 || slot == 2 {
        Ok(())
    } else {
        Err(AgentError::InvalidParams(format!(
            "slot must be 1 (short press) or 2 (long press), got {slot}"
        )))
    }
}

/// Status probe: configured flags for both slots. Also the detection probe.
pub fn status(hid: &impl HidExchange) -> Result<(bool, bool)> {
    let data = exchange(hid, &[OP_STATUS])?;
    if data.len() < 2 {
        return Err(AgentError::Io("short OTP status response".to_string()));
    }
    Ok((data[0] != 0, data[1] != 0))
}

fn read_record(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    slot: u8,
) -> Result<SlotRecord> {
    let data = exchange_on(hid, channel, &[OP_READ, slot])?;
    SlotRecord::parse(&data)
}

fn write_record(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    slot: u8,
    record: &SlotRecord,
) -> Result<()> {
    let mut payload = vec![OP_WRITE, slot, record.digits];
    payload.extend_from_slice(&record.counter.to_be_bytes());
    payload.push(record.secret.len() as u8);
    payload.extend_from_slice(&record.secret);
    payload.push(record.label.len() as u8);
    payload.extend_from_slice(record.label.as_bytes());
    exchange_on(hid, channel, &payload).map(|_| ())
}

/// `otpReadSlot {slot}`.
pub fn read_slot(hid: &impl HidExchange, slot: u8) -> Result<OtpSlot> {
    check_slot(slot)?;
    let channel = CtapHidChannel::open(hid)?;
    let record = read_record(hid, &channel, slot)?;
    Ok(OtpSlot {
        slot,
        configured: record.configured,
        label: (!record.label.is_empty()).then_some(record.label),
        digits: record.digits,
        counter: record.counter,
        algorithm: "hotp",
    })
}

/// `otpWriteSlot {slot, seed, seedFormat?, digits?, label?}`.
pub fn write_slot(
    hid: &impl HidExchange,
    slot: u8,
    seed_input: &str,
    format: seed::SeedFormat,
    digits: u8,
    label: Option<&str>,
) -> Result<OtpWriteResult> {
    check_slot(slot)?;
    if digits != 6 && digits != 8 {
        return Err(AgentError::InvalidParams(format!(
            "digits must be 6 or 8, got {digits}"
        )));
    }
    let label = label.unwrap_or("");
    if label.len() > MAX_LABEL_LEN {
        return Err(AgentError::InvalidParams(format!(
            "label must be at most {MAX_LABEL_LEN} bytes"
        )));
    }

    let normalized = seed::normalize(seed_input, format)?;
    let record = SlotRecord {
        configured: true,
        digits,
        counter: 0,
        secret: normalized.bytes,
        label: label.to_string(),
    };

    let channel = CtapHidChannel::open(hid)?;
    write_record(hid, &channel, slot, &record)?;
    info!("wrote OTP slot {slot}");
    Ok(OtpWriteResult {
        slot,
        warning: normalized.warning,
    })
}

/// `otpDeleteSlot {slot}`.
pub fn delete_slot(hid: &impl HidExchange, slot: u8) -> Result<()> {
    check_slot(slot)?;
    let channel = CtapHidChannel::open(hid)?;
    exchange_on(hid, &channel, &[OP_DELETE, slot])?;
    info!("deleted OTP slot {slot}");
    Ok(())
}

/// `otpSwapSlots`: read both records, write them crosswise. If the second
/// write fails, slot 1 is restored before reporting `SWAP_FAILED`. The
/// device offers no transactional primitive, so this is best-effort.
pub fn swap_slots(hid: &impl HidExchange) -> Result<()> {
    let channel = CtapHidChannel::open(hid)?;
    let slot1 = read_record(hid, &channel, 1)?;
    let slot2 = read_record(hid, &channel, 2)?;

    apply_record(hid, &channel, 1, &slot2)?;
    if let Err(e) = apply_record(hid, &channel, 2, &slot1) {
        warn!("second swap write failed ({e}), restoring slot 1");
        if let Err(restore) = apply_record(hid, &channel, 1, &slot1) {
            error!("slot 1 restore failed: {restore}");
            return Err(AgentError::SwapFailed(
                "slot 2 write failed and slot 1 could not be restored".to_string(),
            ));
        }
        return Err(AgentError::SwapFailed(
            "slot 2 write failed; slot 1 was restored".to_string(),
        ));
    }
    info!("swapped OTP slots");
    Ok(())
}

/// Writes or clears `slot` so it matches `record`.
fn apply_record(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    slot: u8,
    record: &SlotRecord,
) -> Result<()> {
    if record.configured {
        write_record(hid, channel, slot, record)
    } else {
        exchange_on(hid, channel, &[OP_DELETE, slot]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedHid;

    const CID: u32 = 0x0badf00d;

    fn record_bytes(configured: bool, digits: u8, counter: u32, secret: &[u8], label: &str) -> Vec<u8> {
        let mut b = vec![0x00]; // result code: ok
        b.push(u8::from(configured));
        b.push(digits);
        b.extend_from_slice(&counter.to_be_bytes());
        b.push(secret.len() as u8);
        b.extend_from_slice(secret);
        b.push(label.len() as u8);
        b.extend_from_slice(label.as_bytes());
        b
    }

    #[test]
    fn read_slot_hides_secret() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 6, 41, b"supersecret!", "GitHub"),
        );

        let s = read_slot(&hid, 1).unwrap();
        assert!(s.configured);
        assert_eq!(s.digits, 6);
        assert_eq!(s.counter, 41);
        assert_eq!(s.label.as_deref(), Some("GitHub"));
        assert_eq!(s.algorithm, "hotp");

        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("supersecret"));
    }

    #[test]
    fn slot_index_validated() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        assert_eq!(read_slot(&hid, 3).unwrap_err().code(), "INVALID_PARAMS");
        assert_eq!(delete_slot(&hid, 0).unwrap_err().code(), "INVALID_PARAMS");
        assert!(hid.written.borrow().is_empty());
    }

    #[test]
    fn write_slot_builds_record() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]);

        let r = write_slot(
            &hid,
            2,
            "MZXW6YTBOI",
            seed::SeedFormat::Base32,
            6,
            Some("mail"),
        )
        .unwrap();
        assert!(r.warning.is_none());

        let written = hid.written.borrow();
        let frame = &written[1]; // [0] is INIT
        assert_eq!(frame[4], CTAPHID_VENDOR_OTP);
        // opcode, slot, digits, counter, secret "foobar", label "mail"
        let payload = &frame[7..];
        assert_eq!(payload[0], OP_WRITE);
        assert_eq!(payload[1], 2);
        assert_eq!(payload[2], 6);
        assert_eq!(&payload[3..7], &[0, 0, 0, 0]);
        assert_eq!(payload[7], 6);
        assert_eq!(&payload[8..14], b"foobar");
        assert_eq!(payload[14], 4);
        assert_eq!(&payload[15..19], b"mail");
    }

    #[test]
    fn write_slot_rejects_bad_digits() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        let e = write_slot(&hid, 1, "MZXW6YTBOI", seed::SeedFormat::Base32, 7, None).unwrap_err();
        assert_eq!(e.code(), "INVALID_PARAMS");
    }

    #[test]
    fn device_error_code_surfaces() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x03]);
        let e = delete_slot(&hid, 1).unwrap_err();
        assert_eq!(e.code(), "IO_ERROR");
    }

    #[test]
    fn swap_exchanges_records() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 6, 10, b"one", "first"),
        );
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 8, 20, b"two", "second"),
        );
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // write 1
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // write 2

        swap_slots(&hid).unwrap();

        let written = hid.written.borrow();
        let frames: Vec<&[u8]> = written
            .iter()
            .filter(|w| w[4] == CTAPHID_VENDOR_OTP)
            .map(|w| &w[7..])
            .collect();
        assert_eq!(frames.len(), 4);
        // Reads of both slots.
        assert_eq!(&frames[0][..2], &[OP_READ, 1]);
        assert_eq!(&frames[1][..2], &[OP_READ, 2]);
        // Crosswise writes: slot 1 gets "two", slot 2 gets "one".
        assert_eq!(&frames[2][..3], &[OP_WRITE, 1, 8]);
        assert_eq!(&frames[2][8..11], b"two");
        assert_eq!(&frames[3][..3], &[OP_WRITE, 2, 6]);
        assert_eq!(&frames[3][8..11], b"one");
    }

    #[test]
    fn swap_restores_slot_one_on_failure() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 6, 10, b"one", "first"),
        );
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 6, 20, b"two", "second"),
        );
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // write 1 ok
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x05]); // write 2 fails
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // restore 1 ok

        let e = swap_slots(&hid).unwrap_err();
        assert_eq!(e.code(), "SWAP_FAILED");

        let written = hid.written.borrow();
        let frames: Vec<&[u8]> = written
            .iter()
            .filter(|w| w[4] == CTAPHID_VENDOR_OTP)
            .map(|w| &w[7..])
            .collect();
        assert_eq!(frames.len(), 5);
        // The restore write put "one" back into slot 1.
        assert_eq!(&frames[4][..2], &[OP_WRITE, 1]);
        assert_eq!(&frames[4][8..11], b"one");
    }

    #[test]
    fn swap_with_empty_slot_deletes() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(
            CID,
            CTAPHID_VENDOR_OTP,
            &record_bytes(true, 6, 10, b"one", "first"),
        );
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &record_bytes(false, 0, 0, b"", ""));
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // delete 1
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00]); // write 2

        swap_slots(&hid).unwrap();

        let written = hid.written.borrow();
        let frames: Vec<&[u8]> = written
            .iter()
            .filter(|w| w[4] == CTAPHID_VENDOR_OTP)
            .map(|w| &w[7..])
            .collect();
        // Slot 1 becomes empty (delete), slot 2 receives "one".
        assert_eq!(&frames[2][..2], &[OP_DELETE, 1]);
        assert_eq!(&frames[3][..2], &[OP_WRITE, 2]);
    }

    #[test]
    fn status_parses_flags() {
        let hid = ScriptedHid::with_auto_init(CID, 0x01);
        hid.reply_message(CID, CTAPHID_VENDOR_OTP, &[0x00, 0x01, 0x00]);
        assert_eq!(status(&hid).unwrap(), (true, false));
    }
}
