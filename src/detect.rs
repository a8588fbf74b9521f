//! Capability detection: probe each protocol with the minimum
//! distinguishing command.
//!
//! A probe that hits a hard transport error (or its 3-second bound) reports
//! that protocol as unsupported; it never fails the whole detection.
use std::time::Duration;

use serde::Serialize;

use crate::ctap2::commands::{CborCommand, CborResponse, GetInfoRequest, GetInfoResponse};
use crate::error::Result;
use crate::ndef::NDEF_AID;
use crate::openpgp::OPENPGP_AID;
use crate::otp;
use crate::piv::PIV_AID;
use crate::transport::ctaphid::{CtapHidChannel, Response, CTAPHID_CBOR, CTAPHID_MSG};
use crate::transport::iso7816::{select_by_df_name, Iso7816LengthForm, Iso7816ResponseApdu};
use crate::transport::{ApduExchange, HidExchange};

/// Each probe is bounded; a timeout means "not supported".
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// `detectProtocols` result: six independent capability flags. Computed only
/// against an opened device and never cached across reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolSupport {
    pub fido2: bool,
    pub u2f: bool,
    pub piv: bool,
    pub openpgp: bool,
    pub otp: bool,
    pub ndef: bool,
}

/// Probes the HID-transported protocols. CCID-only protocols stay `false`.
pub fn detect_hid(hid: &impl HidExchange) -> ProtocolSupport {
    ProtocolSupport {
        fido2: probe_fido2(hid).unwrap_or(false),
        u2f: probe_u2f(hid).unwrap_or(false),
        otp: probe_otp(hid).unwrap_or(false),
        ..Default::default()
    }
}

/// Probes the card-transported protocols. HID-only protocols stay `false`.
pub fn detect_ccid(card: &impl ApduExchange) -> ProtocolSupport {
    ProtocolSupport {
        piv: probe_select(card, &PIV_AID).unwrap_or(false),
        openpgp: probe_select(card, &OPENPGP_AID).unwrap_or(false),
        ndef: probe_select(card, &NDEF_AID).unwrap_or(false),
        ..Default::default()
    }
}

/// FIDO2: `authenticatorGetInfo` inside a fresh CTAPHID channel; support
/// means a well-formed CBOR map comes back.
fn probe_fido2(hid: &impl HidExchange) -> Result<bool> {
    let channel = CtapHidChannel::open(hid)?;
    let cbor = GetInfoRequest {}.cbor()?;
    match channel.exchange(hid, CTAPHID_CBOR, &cbor, PROBE_TIMEOUT)? {
        Response::Cbor(0, data) => Ok(GetInfoResponse::try_from_cbor(&data).is_ok()),
        _ => Ok(false),
    }
}

/// U2F: `U2F_VERSION` APDU (`00 03 00 00 00`); support means `9000` with an
/// ASCII `U2F_V2` payload.
fn probe_u2f(hid: &impl HidExchange) -> Result<bool> {
    let channel = CtapHidChannel::open(hid)?;
    let apdu = [0x00, 0x03, 0x00, 0x00, 0x00];
    match channel.exchange(hid, CTAPHID_MSG, &apdu, PROBE_TIMEOUT)? {
        Response::Msg(resp) => Ok(resp.is_ok() && resp.data == crate::ctap1::U2F_V2),
        _ => Ok(false),
    }
}

/// OTP: vendor status frame; support means a non-empty response on the
/// vendor channel.
fn probe_otp(hid: &impl HidExchange) -> Result<bool> {
    Ok(otp::status(hid).is_ok())
}

/// CCID applets: `SELECT` by AID; support means `9000`.
fn probe_select(card: &impl ApduExchange, aid: &[u8]) -> Result<bool> {
    let apdu = select_by_df_name(aid).to_bytes(Iso7816LengthForm::ShortOnly)?;
    let raw = card.transmit_raw(&apdu)?;
    let resp = Iso7816ResponseApdu::try_from(&raw[..])?;
    Ok(resp.is_ok())
}
