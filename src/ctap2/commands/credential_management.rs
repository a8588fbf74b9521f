//! `authenticatorCredentialManagement` (0x0A).
use serde::Serialize;
use serde_cbor_2::{ser::to_vec_packed, Value};
use std::collections::BTreeMap;

use super::*;

/// `authenticatorCredentialManagement` sub-command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CredSubCommand {
    #[default]
    GetCredsMetadata = 0x01,
    EnumerateRpsBegin = 0x02,
    EnumerateRpsNext = 0x03,
    EnumerateCredentialsBegin = 0x04,
    EnumerateCredentialsNext = 0x05,
    DeleteCredential = 0x06,
}

/// `authenticatorCredentialManagement` request type.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(into = "BTreeMap<u32, Value>")]
pub struct CredentialManagementRequest {
    pub sub_command: CredSubCommand,
    /// Sub-command parameters, an integer-keyed map.
    pub sub_command_params: Option<BTreeMap<Value, Value>>,
    pub pin_uv_protocol: Option<u32>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
}

impl CborCommand for CredentialManagementRequest {
    const CMD: u8 = 0x0a;
    type Response = CredentialManagementResponse;
}

impl CredentialManagementRequest {
    /// Parameters for `enumerateCredentialsBegin`: `{0x01: rpIDHash}`.
    pub fn params_rp_id_hash(rp_id_hash: &[u8]) -> BTreeMap<Value, Value> {
        BTreeMap::from([(Value::Integer(1), Value::Bytes(rp_id_hash.to_vec()))])
    }

    /// Parameters for `deleteCredential`:
    /// `{0x02: PublicKeyCredentialDescriptor}`.
    pub fn params_credential_id(credential_id: &[u8]) -> BTreeMap<Value, Value> {
        let descriptor = BTreeMap::from([
            (
                Value::Text("id".to_string()),
                Value::Bytes(credential_id.to_vec()),
            ),
            (
                Value::Text("type".to_string()),
                Value::Text("public-key".to_string()),
            ),
        ]);
        BTreeMap::from([(Value::Integer(2), Value::Map(descriptor))])
    }

    /// The message which `pinUvAuthParam` authenticates:
    /// `subCommand || subCommandParams`.
    pub fn pin_auth_message(&self) -> Result<Vec<u8>> {
        let mut m = vec![self.sub_command as u8];
        if let Some(params) = &self.sub_command_params {
            m.extend_from_slice(&to_vec_packed(&Value::Map(params.clone()))?);
        }
        Ok(m)
    }
}

impl From<CredentialManagementRequest> for BTreeMap<u32, Value> {
    fn from(value: CredentialManagementRequest) -> Self {
        let CredentialManagementRequest {
            sub_command,
            sub_command_params,
            pin_uv_protocol,
            pin_uv_auth_param,
        } = value;

        let mut keys = BTreeMap::new();
        keys.insert(0x01, Value::Integer((sub_command as u32).into()));
        if let Some(v) = sub_command_params {
            keys.insert(0x02, Value::Map(v));
        }
        if let Some(v) = pin_uv_protocol {
            keys.insert(0x03, Value::Integer(v.into()));
        }
        if let Some(v) = pin_uv_auth_param {
            keys.insert(0x04, Value::Bytes(v));
        }
        keys
    }
}

/// A relying party as reported by credential enumeration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnumeratedRp {
    pub id: String,
    pub name: Option<String>,
}

/// A user entity as reported by credential enumeration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnumeratedUser {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub display_name: Option<String>,
}

/// `authenticatorCredentialManagement` response type.
#[derive(Debug, Default, PartialEq)]
pub struct CredentialManagementResponse {
    /// Number of discoverable credentials present.
    pub existing_credentials_count: Option<u32>,
    /// Estimated number of credentials which could still be created.
    pub max_possible_remaining_credentials_count: Option<u32>,
    pub rp: Option<EnumeratedRp>,
    pub rp_id_hash: Option<Vec<u8>>,
    pub total_rps: Option<u32>,
    pub user: Option<EnumeratedUser>,
    pub credential_id: Option<Vec<u8>>,
    /// The credential public key, kept raw.
    pub public_key: Option<Value>,
    pub total_credentials: Option<u32>,
    pub cred_protect: Option<u8>,
}

fn parse_rp(v: Value) -> Option<EnumeratedRp> {
    let mut m = value_to_map(v, "rp")?;
    Some(EnumeratedRp {
        id: m
            .remove(&Value::Text("id".to_string()))
            .and_then(|v| value_to_string(v, "rp.id"))?,
        name: m
            .remove(&Value::Text("name".to_string()))
            .and_then(|v| value_to_string(v, "rp.name")),
    })
}

fn parse_user(v: Value) -> Option<EnumeratedUser> {
    let mut m = value_to_map(v, "user")?;
    Some(EnumeratedUser {
        id: m
            .remove(&Value::Text("id".to_string()))
            .and_then(|v| value_to_vec_u8(v, "user.id"))?,
        name: m
            .remove(&Value::Text("name".to_string()))
            .and_then(|v| value_to_string(v, "user.name")),
        display_name: m
            .remove(&Value::Text("displayName".to_string()))
            .and_then(|v| value_to_string(v, "user.displayName")),
    })
}

fn parse_credential_id(v: Value) -> Option<Vec<u8>> {
    let mut m = value_to_map(v, "credentialID")?;
    m.remove(&Value::Text("id".to_string()))
        .and_then(|v| value_to_vec_u8(v, "credentialID.id"))
}

impl TryFrom<BTreeMap<u32, Value>> for CredentialManagementResponse {
    type Error = &'static str;

    fn try_from(mut raw: BTreeMap<u32, Value>) -> std::result::Result<Self, Self::Error> {
        trace!(?raw);
        Ok(Self {
            existing_credentials_count: raw.remove(&0x01).and_then(|v| value_to_u32(&v, "0x01")),
            max_possible_remaining_credentials_count: raw
                .remove(&0x02)
                .and_then(|v| value_to_u32(&v, "0x02")),
            rp: raw.remove(&0x03).and_then(parse_rp),
            rp_id_hash: raw.remove(&0x04).and_then(|v| value_to_vec_u8(v, "0x04")),
            total_rps: raw.remove(&0x05).and_then(|v| value_to_u32(&v, "0x05")),
            user: raw.remove(&0x06).and_then(parse_user),
            credential_id: raw.remove(&0x07).and_then(parse_credential_id),
            public_key: raw.remove(&0x08),
            total_credentials: raw.remove(&0x09).and_then(|v| value_to_u32(&v, "0x09")),
            cred_protect: raw.remove(&0x0a).and_then(|v| value_to_u8(&v, "0x0a")),
        })
    }
}

crate::deserialize_cbor!(CredentialManagementResponse);
