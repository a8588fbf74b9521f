//! `authenticatorReset` (0x07).
use serde::Serialize;

use super::*;

/// `authenticatorReset` request type. Has no payload; the device requires
/// user presence and must be within 10 seconds of power-on.
#[derive(Serialize, Debug, Clone)]
pub struct ResetRequest {}

impl CborCommand for ResetRequest {
    const CMD: u8 = 0x07;
    const HAS_PAYLOAD: bool = false;
    type Response = NoResponse;
}
