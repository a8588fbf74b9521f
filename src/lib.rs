//! Native messaging host brokering Feitian security keys to a browser
//! management UI.
//!
//! The agent reads length-prefixed JSON requests on stdin, drives the key
//! over USB HID (CTAPHID) or PC/SC (APDU), and writes one response per
//! request on stdout. Protocol engines sit on top of the two transports:
//! CTAP2 and CTAP1/U2F over CTAPHID, PIV / OpenPGP / NDEF over APDU, and
//! vendor OTP frames over the CTAPHID vendor command space.
#[macro_use]
extern crate tracing;

pub mod crypto;
pub mod ctap1;
pub mod ctap2;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod ndef;
pub mod openpgp;
pub mod otp;
pub mod piv;
pub mod registry;
pub mod tlv;
pub mod transport;
