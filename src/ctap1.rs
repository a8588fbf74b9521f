//! CTAP1/U2F protocol engine: `U2F_VERSION`, `U2F_REGISTER` and
//! `U2F_AUTHENTICATE` as ISO 7816 APDUs framed in `CTAPHID_MSG`.
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::transport::ctaphid::{CtapHidChannel, Response, CTAPHID_MSG};
use crate::transport::iso7816::{Iso7816LengthForm, Iso7816RequestApdu, Iso7816ResponseApdu};
use crate::transport::HidExchange;

const INS_VERSION: u8 = 0x03;
const INS_REGISTER: u8 = 0x01;
const INS_AUTHENTICATE: u8 = 0x02;

/// Version string returned by every U2F authenticator.
pub const U2F_V2: &[u8; 6] = b"U2F_V2";

/// `SW_CONDITIONS_NOT_SATISFIED`: the token wants a user-presence test.
const SW_UP_REQUIRED: u16 = 0x6985;

/// Total budget for user-presence retries.
const UP_RETRY_BUDGET: Duration = Duration::from_secs(30);
/// Back-off between user-presence retries.
const UP_RETRY_STEP: Duration = Duration::from_millis(250);

/// `u2fRegister` result.
#[derive(Debug, Clone, Serialize)]
pub struct U2fRegistration {
    /// The whole registration response message, hex.
    pub registration_data: String,
    /// Key handle extracted from the response, hex.
    pub key_handle: String,
}

/// `u2fAuthenticate` result.
#[derive(Debug, Clone, Serialize)]
pub struct U2fAssertion {
    pub user_presence: u8,
    pub counter: u32,
    /// The whole signature response message, hex.
    pub signature_data: String,
}

/// Sends one U2F APDU over `CTAPHID_MSG`.
fn msg_exchange(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    apdu: &Iso7816RequestApdu,
    timeout: Duration,
) -> Result<Iso7816ResponseApdu> {
    let raw = apdu.to_bytes(Iso7816LengthForm::Extended)?;
    match channel.exchange(hid, CTAPHID_MSG, &raw, timeout)? {
        Response::Msg(resp) => Ok(resp),
        r => {
            error!("unexpected response to U2F message: {r:?}");
            Err(AgentError::Io("unexpected CTAPHID response".to_string()))
        }
    }
}

/// Sends a U2F APDU, retrying `6985` with a bounded back-off while the user
/// touches the button. Any other non-`9000` aborts with `CTAP1_ERROR`.
fn msg_exchange_up(
    hid: &impl HidExchange,
    channel: &CtapHidChannel,
    apdu: &Iso7816RequestApdu,
) -> Result<Iso7816ResponseApdu> {
    let deadline = Instant::now() + UP_RETRY_BUDGET;
    loop {
        let resp = msg_exchange(hid, channel, apdu, UP_RETRY_BUDGET)?;
        if resp.is_ok() {
            return Ok(resp);
        }
        if resp.sw() != SW_UP_REQUIRED {
            return Err(AgentError::Ctap1(resp.sw()));
        }
        if Instant::now() + UP_RETRY_STEP >= deadline {
            return Err(AgentError::UserPresenceRequired);
        }
        std::thread::sleep(UP_RETRY_STEP);
    }
}

/// `u2fVersion`: expects an ASCII `U2F_V2` payload.
pub fn version(hid: &impl HidExchange) -> Result<String> {
    let channel = CtapHidChannel::open(hid)?;
    let resp = msg_exchange(
        hid,
        &channel,
        &Iso7816RequestApdu {
            cla: 0x00,
            ins: INS_VERSION,
            p1: 0x00,
            p2: 0x00,
            data: vec![],
            ne: 256,
        },
        Duration::from_secs(5),
    )?;
    if !resp.is_ok() {
        return Err(AgentError::Ctap1(resp.sw()));
    }
    if resp.data != U2F_V2 {
        return Err(AgentError::Format(format!(
            "unexpected U2F version payload: {:02x?}",
            resp.data
        )));
    }
    Ok(String::from_utf8_lossy(&resp.data).into_owned())
}

/// `u2fRegister`: 64-byte body of challenge and application hashes.
pub fn register(
    hid: &impl HidExchange,
    challenge_hash: &[u8; 32],
    app_id_hash: &[u8; 32],
) -> Result<U2fRegistration> {
    let channel = CtapHidChannel::open(hid)?;

    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(challenge_hash);
    data.extend_from_slice(app_id_hash);

    let resp = msg_exchange_up(
        hid,
        &channel,
        &Iso7816RequestApdu {
            cla: 0x00,
            ins: INS_REGISTER,
            p1: 0x00,
            p2: 0x00,
            data,
            ne: 65536,
        },
    )?;

    // Registration message: 0x05, pubkey(65), kh_len, key handle, cert, sig.
    let key_handle = if resp.data.len() > 67 && resp.data[0] == 0x05 {
        let kh_len = usize::from(resp.data[66]);
        resp.data
            .get(67..67 + kh_len)
            .map(hex::encode)
            .unwrap_or_default()
    } else {
        String::new()
    };

    Ok(U2fRegistration {
        registration_data: hex::encode(&resp.data),
        key_handle,
    })
}

/// `u2fAuthenticate`. `ctrl` is the U2F control byte: `0x03`
/// enforce-user-presence-and-sign, `0x07` check-only, `0x08`
/// dont-enforce-user-presence-and-sign.
pub fn authenticate(
    hid: &impl HidExchange,
    challenge_hash: &[u8; 32],
    app_id_hash: &[u8; 32],
    key_handle: &[u8],
    ctrl: u8,
) -> Result<U2fAssertion> {
    if key_handle.len() > 255 {
        return Err(AgentError::InvalidParams("key handle too long".to_string()));
    }
    let channel = CtapHidChannel::open(hid)?;

    let mut data = Vec::with_capacity(65 + key_handle.len());
    data.extend_from_slice(challenge_hash);
    data.extend_from_slice(app_id_hash);
    data.push(key_handle.len() as u8);
    data.extend_from_slice(key_handle);

    let resp = msg_exchange_up(
        hid,
        &channel,
        &Iso7816RequestApdu {
            cla: 0x00,
            ins: INS_AUTHENTICATE,
            p1: ctrl,
            p2: 0x00,
            data,
            ne: 65536,
        },
    )?;

    // Signature message: user presence(1), counter(4 BE), signature.
    if resp.data.len() < 5 {
        return Err(AgentError::Format(
            "U2F signature response too short".to_string(),
        ));
    }
    Ok(U2fAssertion {
        user_presence: resp.data[0],
        counter: u32::from_be_bytes([resp.data[1], resp.data[2], resp.data[3], resp.data[4]]),
        signature_data: hex::encode(&resp.data),
    })
}
