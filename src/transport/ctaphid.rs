//! CTAPHID framing: channel allocation, message fragmentation across
//! 64-byte reports, and reassembly.
//!
//! A message is one init packet (command byte with the high bit set, two-byte
//! big-endian payload length, up to 57 payload bytes) followed by
//! continuation packets (7-bit sequence, up to 59 payload bytes each).
use std::cmp::min;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::crypto::rand_bytes;
use crate::error::{AgentError, Result};
use crate::transport::iso7816::Iso7816ResponseApdu;
use crate::transport::{HidExchange, HidReportBytes, HID_READ_TIMEOUT, HID_RPT_SIZE};

pub const TYPE_INIT: u8 = 0x80;
pub const CTAPHID_MSG: u8 = TYPE_INIT | 0x03;
pub const CTAPHID_INIT: u8 = TYPE_INIT | 0x06;
pub const CTAPHID_CBOR: u8 = TYPE_INIT | 0x10;
pub const CTAPHID_KEEPALIVE: u8 = TYPE_INIT | 0x3b;
pub const CTAPHID_ERROR: u8 = TYPE_INIT | 0x3f;
/// First vendor-specific command; Feitian OTP slot programming rides here.
pub const CTAPHID_VENDOR_OTP: u8 = TYPE_INIT | 0x40;

pub const CID_BROADCAST: u32 = 0xffff_ffff;

/// The maximum data payload for the initial packet of a message, in bytes.
const INITIAL_FRAGMENT_SIZE: usize = HID_RPT_SIZE - 7;
/// The maximum data payload for continuation packets, in bytes.
const FRAGMENT_SIZE: usize = HID_RPT_SIZE - 5;
/// Maximum total size for a CTAPHID message after chunking, in bytes.
pub const MAX_SIZE: usize = INITIAL_FRAGMENT_SIZE + (0x80 * FRAGMENT_SIZE);

bitflags! {
    /// Device capability bits reported by `CTAPHID_INIT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capability: u8 {
        const WINK = 0x01;
        const CBOR = 0x04;
        const NMSG = 0x08;
    }
}

/// One CTAPHID frame: either a whole message, or a single fragment of one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtapHidFrame {
    /// Channel identifier.
    pub cid: u32,
    /// Command identifier (init packets) or sequence number (continuations).
    pub cmd: u8,
    /// Declared length of the complete message.
    pub len: u16,
    /// Data payload, up to [MAX_SIZE] bytes.
    pub data: Vec<u8>,
}

impl CtapHidFrame {
    /// `true` if this is an init frame carrying its full declared payload.
    pub fn complete(&self) -> bool {
        self.cmd & TYPE_INIT != 0 && self.data.len() == usize::from(self.len)
    }
}

/// Iterator fragmenting a message into report-sized frames.
pub struct CtapHidFrameIterator<'a> {
    f: &'a CtapHidFrame,
    p: &'a [u8],
    seq: u8,
    started: bool,
}

impl<'a> CtapHidFrameIterator<'a> {
    pub fn new(f: &'a CtapHidFrame) -> Result<Self> {
        if f.data.len() > MAX_SIZE {
            return Err(AgentError::InvalidParams(
                "CTAPHID message too large".to_string(),
            ));
        }
        Ok(CtapHidFrameIterator {
            f,
            p: &f.data,
            seq: 0,
            started: false,
        })
    }
}

impl Iterator for CtapHidFrameIterator<'_> {
    type Item = CtapHidFrame;

    fn next(&mut self) -> Option<Self::Item> {
        let l = self.p.len();
        let (data, rest) = self.p.split_at(min(
            l,
            if self.started {
                FRAGMENT_SIZE
            } else {
                INITIAL_FRAGMENT_SIZE
            },
        ));
        self.p = rest;

        if !self.started {
            self.started = true;
            Some(CtapHidFrame {
                len: self.f.data.len() as u16,
                data: data.to_vec(),
                ..*self.f
            })
        } else if l == 0 {
            None
        } else {
            let seq = self.seq & 0x7f;
            self.seq = seq + 1;
            Some(CtapHidFrame {
                cid: self.f.cid,
                cmd: seq,
                len: 0,
                data: data.to_vec(),
            })
        }
    }
}

impl From<&CtapHidFrame> for HidReportBytes {
    /// Serializes one frame as a report. Does not fragment: see
    /// [CtapHidFrameIterator].
    fn from(f: &CtapHidFrame) -> HidReportBytes {
        let mut o: HidReportBytes = [0; HID_RPT_SIZE];
        o[0..4].copy_from_slice(&f.cid.to_be_bytes());
        o[4] = f.cmd;
        if f.cmd & TYPE_INIT != 0 {
            o[5..7].copy_from_slice(&f.len.to_be_bytes());
            o[7..7 + f.data.len()].copy_from_slice(&f.data);
        } else {
            o[5..5 + f.data.len()].copy_from_slice(&f.data);
        }
        o
    }
}

impl From<&HidReportBytes> for CtapHidFrame {
    fn from(b: &HidReportBytes) -> Self {
        let cid = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let cmd = b[4];
        if cmd & TYPE_INIT != 0 {
            let len = u16::from_be_bytes([b[5], b[6]]);
            let data = b[7..7 + min(HID_RPT_SIZE - 7, usize::from(len))].to_vec();
            Self {
                cid,
                cmd,
                len,
                data,
            }
        } else {
            Self {
                cid,
                cmd,
                len: 0,
                data: b[5..].to_vec(),
            }
        }
    }
}

/// Response to `CTAPHID_INIT`.
#[derive(Debug, PartialEq, Eq)]
pub struct InitResponse {
    pub nonce: Vec<u8>,
    /// Allocated channel identifier.
    pub cid: u32,
    pub protocol_version: u8,
    pub device_version_major: u8,
    pub device_version_minor: u8,
    pub device_version_build: u8,
    pub capabilities: Capability,
}

impl TryFrom<&[u8]> for InitResponse {
    type Error = AgentError;

    fn try_from(d: &[u8]) -> Result<Self> {
        if d.len() < 17 {
            return Err(AgentError::Io("short INIT response".to_string()));
        }
        let (nonce, d) = d.split_at(8);
        let (cid, d) = d.split_at(4);
        Ok(InitResponse {
            nonce: nonce.to_vec(),
            cid: u32::from_be_bytes([cid[0], cid[1], cid[2], cid[3]]),
            protocol_version: d[0],
            device_version_major: d[1],
            device_version_minor: d[2],
            device_version_build: d[3],
            capabilities: Capability::from_bits_truncate(d[4]),
        })
    }
}

/// A parsed CTAPHID response message.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Init(InitResponse),
    Msg(Iso7816ResponseApdu),
    /// CTAP2 status byte plus CBOR payload.
    Cbor(u8, Vec<u8>),
    /// Payload of a vendor command.
    Vendor(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

impl Response {
    fn parse(frame: &CtapHidFrame) -> Result<Response> {
        if !frame.complete() {
            return Err(AgentError::Io("incomplete CTAPHID frame".to_string()));
        }
        Ok(match frame.cmd {
            CTAPHID_INIT => Response::Init(InitResponse::try_from(&frame.data[..])?),
            CTAPHID_MSG => Response::Msg(Iso7816ResponseApdu::try_from(&frame.data[..])?),
            CTAPHID_CBOR => {
                if frame.data.is_empty() {
                    return Err(AgentError::Io("empty CBOR response".to_string()));
                }
                Response::Cbor(frame.data[0], frame.data[1..].to_vec())
            }
            cmd if (CTAPHID_VENDOR_OTP..=TYPE_INIT | 0x7f).contains(&cmd) => {
                Response::Vendor(frame.data.clone())
            }
            cmd => Response::Unknown(cmd, frame.data.clone()),
        })
    }
}

/// A CTAPHID channel bound to one open HID handle.
///
/// Allocated by `INIT` on the broadcast channel; discarded with the handle.
#[derive(Debug)]
pub struct CtapHidChannel {
    pub cid: u32,
    pub capabilities: Capability,
}

impl CtapHidChannel {
    /// Opens a fresh channel: broadcast `INIT` with an 8-byte nonce, one
    /// retry on failure. Re-INIT also clears any stale device state.
    pub fn open(hid: &impl HidExchange) -> Result<Self> {
        match Self::try_init(hid) {
            Ok(c) => Ok(c),
            Err(e) => {
                debug!("CTAPHID INIT failed ({e}), retrying once");
                Self::try_init(hid)
            }
        }
    }

    fn try_init(hid: &impl HidExchange) -> Result<Self> {
        let mut nonce = [0u8; 8];
        rand_bytes(&mut nonce)?;

        send(
            hid,
            &CtapHidFrame {
                cid: CID_BROADCAST,
                cmd: CTAPHID_INIT,
                len: nonce.len() as u16,
                data: nonce.to_vec(),
            },
        )?;

        let deadline = Instant::now() + HID_READ_TIMEOUT;
        loop {
            let frame = recv_message(hid, CID_BROADCAST, deadline)?;
            match Response::parse(&frame)? {
                Response::Init(i) => {
                    if i.nonce != nonce {
                        // Response to somebody else's INIT; keep listening.
                        debug!("INIT nonce mismatch, ignoring");
                        continue;
                    }
                    trace!(?i);
                    return Ok(CtapHidChannel {
                        cid: i.cid,
                        capabilities: i.capabilities,
                    });
                }
                r => {
                    warn!("unexpected response to INIT: {r:?}");
                    return Err(AgentError::Io("unexpected INIT response".to_string()));
                }
            }
        }
    }

    /// Sends one command on this channel and reassembles the response,
    /// consuming `KEEPALIVE` frames silently until `timeout` elapses.
    /// `ERROR` frames abort with the embedded code.
    pub fn exchange(
        &self,
        hid: &impl HidExchange,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        send(
            hid,
            &CtapHidFrame {
                cid: self.cid,
                cmd,
                len: payload.len() as u16,
                data: payload.to_vec(),
            },
        )?;

        let deadline = Instant::now() + timeout;
        loop {
            let frame = recv_message(hid, self.cid, deadline)?;
            match frame.cmd {
                CTAPHID_KEEPALIVE => {
                    trace!("keepalive 0x{:02x?}", frame.data.first());
                    if Instant::now() >= deadline {
                        return Err(AgentError::Timeout);
                    }
                    continue;
                }
                CTAPHID_ERROR => {
                    let code = frame.data.first().copied().unwrap_or(0);
                    return Err(AgentError::CtapHid(code));
                }
                _ => return Response::parse(&frame),
            }
        }
    }
}

/// Sends a frame, fragmenting it to fit the report size.
fn send(hid: &impl HidExchange, frame: &CtapHidFrame) -> Result<()> {
    for f in CtapHidFrameIterator::new(frame)? {
        hid.write_report(&HidReportBytes::from(&f))?;
    }
    Ok(())
}

/// Receives one complete message for `cid`: an init frame, then continuation
/// frames with strictly monotonic sequence numbers, until the declared
/// length is reached.
fn recv_message(hid: &impl HidExchange, cid: u32, deadline: Instant) -> Result<CtapHidFrame> {
    let mut assembled: Option<CtapHidFrame> = None;
    let mut expected_seq = 0u8;

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(AgentError::Timeout)?;
        let report = hid.read_report(min(remaining, HID_READ_TIMEOUT))?;
        let frame = CtapHidFrame::from(&report);

        let complete = match assembled.as_mut() {
            None => {
                if frame.cmd & TYPE_INIT == 0 {
                    // Stale continuation from an aborted message.
                    debug!("dropping unexpected continuation frame");
                    continue;
                }
                if frame.cid != cid && cid != CID_BROADCAST {
                    debug!("dropping frame for channel {:08x}", frame.cid);
                    continue;
                }
                if frame.complete() {
                    return Ok(frame);
                }
                assembled = Some(frame);
                false
            }
            Some(first) => {
                if frame.cid != first.cid {
                    return Err(AgentError::Io(
                        "channel id changed mid-message".to_string(),
                    ));
                }
                if frame.cmd & TYPE_INIT != 0 {
                    return Err(AgentError::Io(
                        "init frame interrupted reassembly".to_string(),
                    ));
                }
                if frame.cmd != expected_seq {
                    return Err(AgentError::Io(format!(
                        "bad sequence number: got {}, want {expected_seq}",
                        frame.cmd
                    )));
                }
                expected_seq += 1;

                let want = usize::from(first.len) - first.data.len();
                first
                    .data
                    .extend_from_slice(&frame.data[..min(want, frame.data.len())]);
                first.complete()
            }
        };
        if complete {
            return Ok(assembled.take().expect("assembled frame"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedHid;

    #[test]
    fn fragment_short() {
        let full = CtapHidFrame {
            cid: 1,
            cmd: CTAPHID_CBOR,
            len: 2,
            data: vec![1, 2],
        };
        let frags: Vec<CtapHidFrame> = CtapHidFrameIterator::new(&full).unwrap().collect();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0], full);
    }

    #[test]
    fn fragment_long() {
        let full = CtapHidFrame {
            cid: 1,
            cmd: CTAPHID_CBOR,
            len: 255,
            data: (0..255).collect(),
        };
        let frags: Vec<CtapHidFrame> = CtapHidFrameIterator::new(&full).unwrap().collect();
        // 57 + 59 + 59 + 59 + 21
        assert_eq!(frags.len(), 5);

        assert_eq!(frags[0].cmd, CTAPHID_CBOR);
        assert_eq!(frags[0].len, 255);
        assert_eq!(frags[0].data, (0..57).collect::<Vec<u8>>());

        let report = HidReportBytes::from(&frags[0]);
        assert_eq!(
            &report[..8],
            &[0x00, 0x00, 0x00, 0x01, CTAPHID_CBOR, 0x00, 0xff, 0x00]
        );

        // Continuation sequence numbers are strictly monotonic 0,1,2,...
        for (i, f) in frags[1..].iter().enumerate() {
            assert_eq!(f.cmd, i as u8);
            assert_eq!(f.len, 0);
        }
        assert_eq!(frags[4].data, (234..255).collect::<Vec<u8>>());
    }

    #[test]
    fn fragment_max_size() {
        let full = CtapHidFrame {
            cid: 1,
            cmd: CTAPHID_CBOR,
            len: MAX_SIZE as u16,
            data: vec![0xff; MAX_SIZE],
        };
        let frags: Vec<CtapHidFrame> = CtapHidFrameIterator::new(&full).unwrap().collect();
        assert_eq!(frags.len(), 0x81);

        let over = CtapHidFrame {
            cid: 1,
            cmd: CTAPHID_CBOR,
            len: 0,
            data: vec![0; MAX_SIZE + 1],
        };
        assert!(CtapHidFrameIterator::new(&over).is_err());
    }

    #[test]
    fn init_response_parse() {
        let mut d = Vec::new();
        d.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // nonce
        d.extend_from_slice(&0x00010005u32.to_be_bytes()); // cid
        d.extend_from_slice(&[2, 1, 0, 7, 0x05]); // proto, version, caps
        let i = InitResponse::try_from(&d[..]).unwrap();
        assert_eq!(i.cid, 0x00010005);
        assert_eq!(i.nonce, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(i.capabilities.contains(Capability::CBOR));
        assert!(i.capabilities.contains(Capability::WINK));
        assert!(!i.capabilities.contains(Capability::NMSG));
    }

    #[test]
    fn open_channel() {
        let hid = ScriptedHid::with_auto_init(0x00010005, 0x05);
        let channel = CtapHidChannel::open(&hid).unwrap();
        assert_eq!(channel.cid, 0x00010005);
        assert!(channel.capabilities.contains(Capability::CBOR));
        assert!(!channel.capabilities.contains(Capability::NMSG));

        let written = hid.written.borrow();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..4], &CID_BROADCAST.to_be_bytes());
        assert_eq!(written[0][4], CTAPHID_INIT);
        assert_eq!(&written[0][5..7], &[0, 8]);
    }

    #[test]
    fn open_channel_retries_once_then_times_out() {
        let hid = ScriptedHid::new();
        let e = CtapHidChannel::open(&hid).unwrap_err();
        assert_eq!(e.code(), "TIMEOUT");
        // Both attempts wrote an INIT frame on the broadcast channel.
        assert_eq!(hid.written.borrow().len(), 2);
    }

    #[test]
    fn exchange_reassembles_multi_report_response() {
        let hid = ScriptedHid::new();
        let channel = CtapHidChannel {
            cid: 0x11223344,
            capabilities: Capability::CBOR,
        };

        // 100-byte CBOR payload split across init + one continuation.
        let payload: Vec<u8> = (0..100).collect();
        let mut r1 = Vec::new();
        r1.extend_from_slice(&0x11223344u32.to_be_bytes());
        r1.push(CTAPHID_CBOR);
        r1.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        r1.extend_from_slice(&payload[..57]);
        hid.reply(&r1);

        let mut r2 = Vec::new();
        r2.extend_from_slice(&0x11223344u32.to_be_bytes());
        r2.push(0x00); // seq 0
        r2.extend_from_slice(&payload[57..]);
        hid.reply(&r2);

        let resp = channel
            .exchange(&hid, CTAPHID_CBOR, &[0x04], Duration::from_secs(1))
            .unwrap();
        match resp {
            Response::Cbor(status, data) => {
                assert_eq!(status, 0);
                assert_eq!(data, payload[1..]);
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn exchange_skips_keepalive() {
        let hid = ScriptedHid::new();
        let channel = CtapHidChannel {
            cid: 1,
            capabilities: Capability::CBOR,
        };

        let mut ka = Vec::new();
        ka.extend_from_slice(&1u32.to_be_bytes());
        ka.push(CTAPHID_KEEPALIVE);
        ka.extend_from_slice(&[0, 1, 0x01]); // len 1, status "processing"
        hid.reply(&ka);

        let mut ok = Vec::new();
        ok.extend_from_slice(&1u32.to_be_bytes());
        ok.push(CTAPHID_CBOR);
        ok.extend_from_slice(&[0, 1, 0x00]);
        hid.reply(&ok);

        let resp = channel
            .exchange(&hid, CTAPHID_CBOR, &[0x04], Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp, Response::Cbor(0, vec![]));
    }

    #[test]
    fn exchange_surfaces_error_frame() {
        let hid = ScriptedHid::new();
        let channel = CtapHidChannel {
            cid: 1,
            capabilities: Capability::CBOR,
        };

        let mut err = Vec::new();
        err.extend_from_slice(&1u32.to_be_bytes());
        err.push(CTAPHID_ERROR);
        err.extend_from_slice(&[0, 1, 0x06]); // channel busy
        hid.reply(&err);

        let e = channel
            .exchange(&hid, CTAPHID_CBOR, &[0x04], Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(e, AgentError::CtapHid(0x06));
    }

    #[test]
    fn bad_sequence_aborts() {
        let hid = ScriptedHid::new();
        let channel = CtapHidChannel {
            cid: 1,
            capabilities: Capability::CBOR,
        };

        let mut r1 = Vec::new();
        r1.extend_from_slice(&1u32.to_be_bytes());
        r1.push(CTAPHID_CBOR);
        r1.extend_from_slice(&[0, 100]);
        r1.extend_from_slice(&[0xaa; 57]);
        hid.reply(&r1);

        let mut r2 = Vec::new();
        r2.extend_from_slice(&1u32.to_be_bytes());
        r2.push(0x01); // wrong: expected seq 0
        r2.extend_from_slice(&[0xaa; 43]);
        hid.reply(&r2);

        let e = channel
            .exchange(&hid, CTAPHID_CBOR, &[0x04], Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(e.code(), "IO_ERROR");
    }

    #[test]
    fn vendor_response_parse() {
        let frame = CtapHidFrame {
            cid: 1,
            cmd: CTAPHID_VENDOR_OTP,
            len: 2,
            data: vec![0x01, 0x00],
        };
        assert_eq!(
            Response::parse(&frame).unwrap(),
            Response::Vendor(vec![0x01, 0x00])
        );
    }

    #[test]
    fn report_frame_round_trip() {
        let f = CtapHidFrame {
            cid: 0xdeadbeef,
            cmd: CTAPHID_MSG,
            len: 8,
            data: vec![0x55, 0x32, 0x46, 0x5f, 0x56, 0x32, 0x90, 0x00],
        };
        let report = HidReportBytes::from(&f);
        let back = CtapHidFrame::from(&report);
        assert_eq!(back, f);
        assert!(back.complete());
    }
}
