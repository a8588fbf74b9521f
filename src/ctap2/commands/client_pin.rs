//! `authenticatorClientPIN` (0x06).
use serde::Serialize;
use serde_cbor_2::Value;
use std::collections::BTreeMap;

use super::*;

/// The P-256 key-agreement key used by the PIN protocols.
///
/// This is a `COSE_Key` with fixed, partially incorrect values mandated by
/// the CTAP spec: kty 2 (EC2), alg -25 (not the algorithm actually used),
/// crv 1 (P-256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoseEc2Key {
    /// 32-byte big-endian x-coordinate.
    pub x: Vec<u8>,
    /// 32-byte big-endian y-coordinate.
    pub y: Vec<u8>,
}

impl CoseEc2Key {
    pub fn to_value(&self) -> Value {
        Value::Map(BTreeMap::from([
            (Value::Integer(1), Value::Integer(2)),
            (Value::Integer(3), Value::Integer(-25)),
            (Value::Integer(-1), Value::Integer(1)),
            (Value::Integer(-2), Value::Bytes(self.x.clone())),
            (Value::Integer(-3), Value::Bytes(self.y.clone())),
        ]))
    }

    pub fn from_value(v: Value) -> Option<Self> {
        let mut m = value_to_map(v, "COSE key")?;
        if m.remove(&Value::Integer(1)) != Some(Value::Integer(2))
            || m.remove(&Value::Integer(3)) != Some(Value::Integer(-25))
            || m.remove(&Value::Integer(-1)) != Some(Value::Integer(1))
        {
            error!("unexpected COSE key parameters");
            return None;
        }
        let x = m
            .remove(&Value::Integer(-2))
            .and_then(|v| value_to_vec_u8(v, "-2"))?;
        let y = m
            .remove(&Value::Integer(-3))
            .and_then(|v| value_to_vec_u8(v, "-3"))?;
        if x.len() != 32 || y.len() != 32 {
            return None;
        }
        Some(Self { x, y })
    }
}

/// `authenticatorClientPIN` sub-command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ClientPinSubCommand {
    #[default]
    GetPinRetries = 0x01,
    GetKeyAgreement = 0x02,
    SetPin = 0x03,
    ChangePin = 0x04,
    GetPinToken = 0x05,
}

/// `authenticatorClientPIN` request type.
///
/// Constructed by `crate::ctap2::pin_uv`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(into = "BTreeMap<u32, Value>")]
pub struct ClientPinRequest {
    /// PIN/UV protocol version chosen by the platform.
    pub pin_uv_protocol: Option<u32>,
    /// Action being requested.
    pub sub_command: ClientPinSubCommand,
    /// The platform key-agreement key.
    pub key_agreement: Option<CoseEc2Key>,
    /// HMAC proof binding the request to the shared secret.
    pub pin_uv_auth_param: Option<Vec<u8>>,
    /// The new PIN, padded and encrypted under the shared secret.
    pub new_pin_enc: Option<Vec<u8>>,
    /// Encrypted proof-of-knowledge of the current PIN.
    pub pin_hash_enc: Option<Vec<u8>>,
}

impl CborCommand for ClientPinRequest {
    const CMD: u8 = 0x06;
    type Response = ClientPinResponse;
}

impl From<ClientPinRequest> for BTreeMap<u32, Value> {
    fn from(value: ClientPinRequest) -> Self {
        let ClientPinRequest {
            pin_uv_protocol,
            sub_command,
            key_agreement,
            pin_uv_auth_param,
            new_pin_enc,
            pin_hash_enc,
        } = value;

        let mut keys = BTreeMap::new();
        if let Some(v) = pin_uv_protocol {
            keys.insert(0x01, Value::Integer(v.into()));
        }
        keys.insert(0x02, Value::Integer((sub_command as u32).into()));
        if let Some(k) = key_agreement {
            keys.insert(0x03, k.to_value());
        }
        if let Some(v) = pin_uv_auth_param {
            keys.insert(0x04, Value::Bytes(v));
        }
        if let Some(v) = new_pin_enc {
            keys.insert(0x05, Value::Bytes(v));
        }
        if let Some(v) = pin_hash_enc {
            keys.insert(0x06, Value::Bytes(v));
        }
        keys
    }
}

/// `authenticatorClientPIN` response type.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClientPinResponse {
    /// The authenticator's key-agreement key.
    pub key_agreement: Option<CoseEc2Key>,
    /// The `pinUvAuthToken`, encrypted under the shared secret.
    pub pin_token: Option<Vec<u8>>,
    /// Number of PIN attempts remaining until lock-out.
    pub pin_retries: Option<u32>,
    /// If `true`, a power cycle is needed before further PIN operations.
    pub power_cycle_state: Option<bool>,
    /// Number of UV attempts remaining until lock-out.
    pub uv_retries: Option<u32>,
}

impl TryFrom<BTreeMap<u32, Value>> for ClientPinResponse {
    type Error = &'static str;

    fn try_from(mut raw: BTreeMap<u32, Value>) -> std::result::Result<Self, Self::Error> {
        trace!(?raw);
        Ok(Self {
            key_agreement: raw.remove(&0x01).and_then(CoseEc2Key::from_value),
            pin_token: raw.remove(&0x02).and_then(|v| value_to_vec_u8(v, "0x02")),
            pin_retries: raw.remove(&0x03).and_then(|v| value_to_u32(&v, "0x03")),
            power_cycle_state: raw.remove(&0x04).and_then(|v| value_to_bool(&v, "0x04")),
            uv_retries: raw.remove(&0x05).and_then(|v| value_to_u32(&v, "0x05")),
        })
    }
}

crate::deserialize_cbor!(ClientPinResponse);
