//! `authenticatorGetInfo` (0x04).
use serde::Serialize;
use serde_cbor_2::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::*;

/// `authenticatorGetInfo` request type. Has no payload.
#[derive(Serialize, Debug, Clone)]
pub struct GetInfoRequest {}

impl CborCommand for GetInfoRequest {
    const CMD: u8 = 0x04;
    const HAS_PAYLOAD: bool = false;
    type Response = GetInfoResponse;
}

/// `authenticatorGetInfo` response type.
///
/// Reference: <https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-errata-20220621.html#authenticatorGetInfo>
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GetInfoResponse {
    /// All CTAP protocol versions which the token supports.
    pub versions: BTreeSet<String>,
    /// All protocol extensions which the token supports.
    pub extensions: Option<Vec<String>>,
    /// The claimed AAGUID, 16 bytes.
    pub aaguid: Option<Vec<u8>>,
    /// Supported options and their current values.
    pub options: Option<BTreeMap<String, bool>>,
    /// Maximum message size supported by the authenticator.
    pub max_msg_size: Option<u32>,
    /// All PIN/UV auth protocols which the token supports.
    pub pin_protocols: Option<Vec<u32>>,
    pub max_cred_count_in_list: Option<u32>,
    pub max_cred_id_len: Option<u32>,
    /// Supported transports, as strings.
    pub transports: Option<Vec<String>>,
    /// Supported credential generation algorithms, kept raw.
    pub algorithms: Option<Value>,
    /// Current minimum PIN length, in Unicode code points.
    pub min_pin_length: Option<u32>,
    pub firmware_version: Option<i128>,
}

impl GetInfoResponse {
    /// The current value of an option, or `None` when the authenticator did
    /// not report it.
    pub fn option(&self, o: &str) -> Option<bool> {
        self.options.as_ref().and_then(|m| m.get(o)).copied()
    }

    /// `true` when a client PIN is currently set.
    pub fn client_pin_set(&self) -> bool {
        self.option("clientPin") == Some(true)
    }

    /// The AAGUID formatted in the usual dashed form.
    pub fn aaguid_string(&self) -> Option<String> {
        self.aaguid.as_ref().filter(|b| b.len() == 16).map(|b| {
            format!(
                "{}-{}-{}-{}-{}",
                hex::encode(&b[0..4]),
                hex::encode(&b[4..6]),
                hex::encode(&b[6..8]),
                hex::encode(&b[8..10]),
                hex::encode(&b[10..16])
            )
        })
    }

    /// Algorithm names extracted from the raw COSE algorithm list.
    pub fn algorithm_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(Value::Array(algs)) = &self.algorithms {
            for a in algs {
                if let Value::Map(m) = a {
                    if let Some(Value::Integer(alg)) = m.get(&Value::Text("alg".to_string())) {
                        let name = match alg {
                            -7 => "ES256",
                            -8 => "EdDSA",
                            -35 => "ES384",
                            -257 => "RS256",
                            _ => continue,
                        };
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
        names
    }
}

impl TryFrom<BTreeMap<u32, Value>> for GetInfoResponse {
    type Error = &'static str;

    fn try_from(mut raw: BTreeMap<u32, Value>) -> std::result::Result<Self, Self::Error> {
        trace!(?raw);
        Ok(Self {
            versions: raw
                .remove(&0x01)
                .and_then(|v| value_to_vec_string(v, "0x01"))
                .map(|v| v.into_iter().collect())
                .unwrap_or_default(),
            extensions: raw.remove(&0x02).and_then(|v| value_to_vec_string(v, "0x02")),
            aaguid: raw.remove(&0x03).and_then(|v| value_to_vec_u8(v, "0x03")),
            options: raw.remove(&0x04).and_then(|v| value_to_map(v, "0x04")).map(|m| {
                m.into_iter()
                    .filter_map(|(k, v)| match (k, v) {
                        (Value::Text(k), Value::Bool(v)) => Some((k, v)),
                        _ => None,
                    })
                    .collect()
            }),
            max_msg_size: raw.remove(&0x05).and_then(|v| value_to_u32(&v, "0x05")),
            pin_protocols: raw.remove(&0x06).and_then(|v| {
                if let Value::Array(a) = v {
                    Some(a.iter().filter_map(|i| value_to_u32(i, "0x06")).collect())
                } else {
                    None
                }
            }),
            max_cred_count_in_list: raw.remove(&0x07).and_then(|v| value_to_u32(&v, "0x07")),
            max_cred_id_len: raw.remove(&0x08).and_then(|v| value_to_u32(&v, "0x08")),
            transports: raw.remove(&0x09).and_then(|v| value_to_vec_string(v, "0x09")),
            algorithms: raw.remove(&0x0a),
            min_pin_length: raw.remove(&0x0d).and_then(|v| value_to_u32(&v, "0x0d")),
            firmware_version: raw
                .remove(&0x0e)
                .as_ref()
                .and_then(|v| value_to_i128(v, "0x0e")),
        })
    }
}

crate::deserialize_cbor!(GetInfoResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctap2::commands::CborResponse;

    #[test]
    fn request_is_bare_command_byte() {
        assert_eq!(GetInfoRequest {}.cbor().unwrap(), vec![0x04]);
    }

    #[test]
    fn parse_response() {
        // {1: ["U2F_V2", "FIDO_2_0"], 3: 16 bytes, 4: {"rk": true,
        //  "clientPin": false}, 6: [1]}
        let raw = hex::decode(concat!(
            "a4",
            "01",
            "82",
            "665532465f5632",
            "684649444f5f325f30",
            "03",
            "50",
            "2fc0579f811347eab116bb5a8db9202a",
            "04",
            "a2",
            "62726b",
            "f5",
            "69636c69656e7450696e",
            "f4",
            "06",
            "81",
            "01",
        ))
        .unwrap();

        let r = GetInfoResponse::try_from_cbor(&raw).unwrap();
        assert!(r.versions.contains("U2F_V2"));
        assert!(r.versions.contains("FIDO_2_0"));
        assert_eq!(
            r.aaguid_string().unwrap(),
            "2fc0579f-8113-47ea-b116-bb5a8db9202a"
        );
        assert_eq!(r.option("rk"), Some(true));
        assert_eq!(r.option("clientPin"), Some(false));
        assert!(!r.client_pin_set());
        assert_eq!(r.pin_protocols, Some(vec![1]));
        assert_eq!(r.option("uv"), None);
    }

    #[test]
    fn algorithm_names_from_cose_list() {
        let algs = Value::Array(vec![Value::Map(
            [
                (Value::Text("alg".into()), Value::Integer(-7)),
                (
                    Value::Text("type".into()),
                    Value::Text("public-key".into()),
                ),
            ]
            .into_iter()
            .collect(),
        )]);
        let r = GetInfoResponse {
            algorithms: Some(algs),
            ..Default::default()
        };
        assert_eq!(r.algorithm_names(), vec!["ES256".to_string()]);
    }
}
