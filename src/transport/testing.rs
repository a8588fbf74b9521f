//! Scripted devices for exercising the protocol state machines without
//! hardware.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::transport::ctaphid::{CID_BROADCAST, CTAPHID_INIT};
use crate::transport::{ApduExchange, HidExchange, HidReportBytes, HID_RPT_SIZE};

/// A scripted HID device: records written reports, replays queued replies,
/// and times out when the script runs dry.
///
/// With [ScriptedHid::auto_init] set, any broadcast `CTAPHID_INIT` write is
/// answered automatically with a well-formed response echoing the nonce, so
/// tests can drive full channel flows without predicting random nonces.
pub(crate) struct ScriptedHid {
    pub written: RefCell<Vec<HidReportBytes>>,
    pub replies: RefCell<VecDeque<HidReportBytes>>,
    pub auto_init: Cell<Option<(u32, u8)>>,
}

impl ScriptedHid {
    pub fn new() -> Self {
        Self {
            written: RefCell::new(Vec::new()),
            replies: RefCell::new(VecDeque::new()),
            auto_init: Cell::new(None),
        }
    }

    /// Answers INIT automatically, allocating `cid` with capability bits
    /// `caps`.
    pub fn with_auto_init(cid: u32, caps: u8) -> Self {
        let s = Self::new();
        s.auto_init.set(Some((cid, caps)));
        s
    }

    /// Queues a reply report, zero-padded to report size.
    pub fn reply(&self, data: &[u8]) {
        assert!(data.len() <= HID_RPT_SIZE);
        let mut r: HidReportBytes = [0; HID_RPT_SIZE];
        r[..data.len()].copy_from_slice(data);
        self.replies.borrow_mut().push_back(r);
    }

    /// Queues a reply message on `cid` with command byte `cmd`, fragmenting
    /// across reports as the device would.
    pub fn reply_message(&self, cid: u32, cmd: u8, payload: &[u8]) {
        let mut first = Vec::with_capacity(HID_RPT_SIZE);
        first.extend_from_slice(&cid.to_be_bytes());
        first.push(cmd);
        first.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        let head = payload.len().min(HID_RPT_SIZE - 7);
        first.extend_from_slice(&payload[..head]);
        self.reply(&first);

        let mut rest = &payload[head..];
        let mut seq = 0u8;
        while !rest.is_empty() {
            let n = rest.len().min(HID_RPT_SIZE - 5);
            let mut cont = Vec::with_capacity(HID_RPT_SIZE);
            cont.extend_from_slice(&cid.to_be_bytes());
            cont.push(seq);
            cont.extend_from_slice(&rest[..n]);
            self.reply(&cont);
            rest = &rest[n..];
            seq += 1;
        }
    }
}

impl HidExchange for ScriptedHid {
    fn write_report(&self, report: &HidReportBytes) -> Result<usize> {
        self.written.borrow_mut().push(*report);
        if let Some((cid, caps)) = self.auto_init.get() {
            let bcast = CID_BROADCAST.to_be_bytes();
            if report[..4] == bcast && report[4] == CTAPHID_INIT {
                let mut payload = Vec::new();
                payload.extend_from_slice(&report[7..15]); // nonce
                payload.extend_from_slice(&cid.to_be_bytes());
                payload.extend_from_slice(&[2, 1, 0, 0, caps]);

                let mut resp = Vec::new();
                resp.extend_from_slice(&bcast);
                resp.push(CTAPHID_INIT);
                resp.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                resp.extend_from_slice(&payload);

                let mut r: HidReportBytes = [0; HID_RPT_SIZE];
                r[..resp.len()].copy_from_slice(&resp);
                self.replies.borrow_mut().push_front(r);
            }
        }
        Ok(HID_RPT_SIZE)
    }

    fn read_report(&self, _timeout: Duration) -> Result<HidReportBytes> {
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or(AgentError::Timeout)
    }
}

/// A scripted smart card: records transmitted APDUs and replays queued
/// responses (body plus status word).
pub(crate) struct ScriptedCard {
    pub transmitted: RefCell<Vec<Vec<u8>>>,
    pub replies: RefCell<VecDeque<Vec<u8>>>,
}

impl ScriptedCard {
    pub fn new() -> Self {
        Self {
            transmitted: RefCell::new(Vec::new()),
            replies: RefCell::new(VecDeque::new()),
        }
    }

    pub fn reply(&self, response: &[u8]) {
        self.replies.borrow_mut().push_back(response.to_vec());
    }

    /// Queues `body` followed by the status word.
    pub fn reply_with_sw(&self, body: &[u8], sw1: u8, sw2: u8) {
        let mut r = body.to_vec();
        r.push(sw1);
        r.push(sw2);
        self.replies.borrow_mut().push_back(r);
    }
}

impl ApduExchange for ScriptedCard {
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        self.transmitted.borrow_mut().push(apdu.to_vec());
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| AgentError::Io("no scripted response".to_string()))
    }
}
