//! CTAP2 command and response types.
//!
//! Commands serialize to packed CBOR prefixed with the authenticator command
//! byte; responses deserialize from integer-keyed CBOR maps.
use serde::Serialize;
use serde_cbor_2::{ser::to_vec_packed, Value};
use std::collections::BTreeMap;

use crate::error::{AgentError, Result};

mod client_pin;
mod credential_management;
mod get_info;
mod reset;

pub use self::client_pin::*;
pub use self::credential_management::*;
pub use self::get_info::*;
pub use self::reset::*;

/// Common trait for all CBOR responses.
pub trait CborResponse: Sized + std::fmt::Debug {
    fn try_from_cbor(i: &[u8]) -> Result<Self>;
}

/// Common trait for all CBOR commands.
pub trait CborCommand: Serialize + Sized + std::fmt::Debug {
    /// CTAP command byte.
    const CMD: u8;

    /// If true (default), the command has a payload which is serialized into
    /// CBOR. If false, the command is the bare command byte.
    const HAS_PAYLOAD: bool = true;

    /// The response type associated with this command.
    type Response: CborResponse;

    /// Converts the command into its binary form.
    fn cbor(&self) -> Result<Vec<u8>> {
        if !Self::HAS_PAYLOAD {
            return Ok(vec![Self::CMD]);
        }
        let mut b = to_vec_packed(self)?;
        b.reserve(1);
        b.insert(0, Self::CMD);
        Ok(b)
    }
}

/// Type for commands which have no response data.
#[derive(Debug)]
pub struct NoResponse {}

impl CborResponse for NoResponse {
    fn try_from_cbor(_raw: &[u8]) -> Result<Self> {
        Ok(Self {})
    }
}

pub(crate) fn value_to_u32(v: &Value, loc: &str) -> Option<u32> {
    if let Value::Integer(i) = v {
        u32::try_from(*i)
            .map_err(|_| error!("invalid value inside {loc}: {i:?}"))
            .ok()
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_u8(v: &Value, loc: &str) -> Option<u8> {
    if let Value::Integer(i) = v {
        u8::try_from(*i)
            .map_err(|_| error!("invalid value inside {loc}: {i:?}"))
            .ok()
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_i128(v: &Value, loc: &str) -> Option<i128> {
    if let Value::Integer(i) = v {
        Some(*i)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_bool(v: &Value, loc: &str) -> Option<bool> {
    if let Value::Bool(b) = v {
        Some(*b)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_vec_u8(v: Value, loc: &str) -> Option<Vec<u8>> {
    if let Value::Bytes(b) = v {
        Some(b)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_string(v: Value, loc: &str) -> Option<String> {
    if let Value::Text(s) = v {
        Some(s)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_vec_string(v: Value, loc: &str) -> Option<Vec<String>> {
    if let Value::Array(v) = v {
        let mut x = Vec::with_capacity(v.len());
        for s in v.into_iter() {
            if let Value::Text(s) = s {
                x.push(s);
            } else {
                error!("invalid value inside {loc}: {s:?}");
            }
        }
        Some(x)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn value_to_map(v: Value, loc: &str) -> Option<BTreeMap<Value, Value>> {
    if let Value::Map(m) = v {
        Some(m)
    } else {
        error!("invalid type for {loc}: {v:?}");
        None
    }
}

pub(crate) fn map_int_keys(m: BTreeMap<Value, Value>) -> Result<BTreeMap<u32, Value>> {
    m.into_iter()
        .map(|(k, v)| {
            let k = value_to_u32(&k, "map_int_keys").ok_or(AgentError::Cbor)?;
            Ok((k, v))
        })
        .collect()
}

/// Implements [CborResponse] for a type with
/// `TryFrom<BTreeMap<u32, Value>>`, treating an empty payload as an empty
/// map.
#[macro_export]
macro_rules! deserialize_cbor {
    ($name:ident) => {
        impl $crate::ctap2::commands::CborResponse for $name {
            fn try_from_cbor(i: &[u8]) -> $crate::error::Result<Self> {
                use $crate::error::AgentError;
                if i.is_empty() {
                    TryFrom::try_from(std::collections::BTreeMap::new())
                        .map_err(|_| AgentError::Cbor)
                } else {
                    let v = serde_cbor_2::from_slice::<'_, serde_cbor_2::Value>(i).map_err(|e| {
                        error!("deserialise: {:?}", e);
                        AgentError::Cbor
                    })?;
                    let v = if let serde_cbor_2::Value::Map(v) = v {
                        Ok(v)
                    } else {
                        error!("deserialise: unexpected CBOR type {:?}", v);
                        Err(AgentError::Cbor)
                    }?;
                    let v = $crate::ctap2::commands::map_int_keys(v)?;
                    TryFrom::try_from(v).map_err(|_| {
                        error!("deserialising structure");
                        AgentError::Cbor
                    })
                }
            }
        }
    };
}
