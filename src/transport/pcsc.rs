//! PC/SC card I/O, plus the chained APDU exchange shared by the smart-card
//! protocol engines.
use pcsc::{Card, MAX_BUFFER_SIZE_EXTENDED};
use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::transport::iso7816::{
    get_response, Iso7816LengthForm, Iso7816RequestApdu, Iso7816ResponseApdu,
};
use crate::transport::ApduExchange;

impl ApduExchange for Card {
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        trace!(">>> {:02x?}", apdu);
        let mut buf = vec![0; MAX_BUFFER_SIZE_EXTENDED];
        let response = self.transmit(apdu, &mut buf)?;
        trace!("<<< {:02x?}", response);
        if response.len() < 2 {
            return Err(AgentError::Io(format!(
                "APDU response too short: {} bytes",
                response.len()
            )));
        }
        Ok(response.to_vec())
    }
}

/// `transmitApdu`: sends one raw command APDU (minimum 4 bytes) and returns
/// the full response including `SW1 SW2`. No chaining is performed here.
pub fn transmit_apdu(card: &impl ApduExchange, apdu: &[u8]) -> Result<Vec<u8>> {
    if apdu.len() < 4 {
        return Err(AgentError::InvalidParams(format!(
            "APDU too short: {} bytes (minimum 4)",
            apdu.len()
        )));
    }
    card.transmit_raw(apdu)
}

/// Outcome classification of one logged APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ApduStatus {
    Ok,
    MoreData,
    Error,
}

impl ApduStatus {
    fn classify(sw1: u8, sw2: u8) -> Self {
        if sw1 == 0x90 && sw2 == 0x00 {
            ApduStatus::Ok
        } else if sw1 == 0x61 || sw1 == 0x6c {
            ApduStatus::MoreData
        } else {
            ApduStatus::Error
        }
    }
}

/// One entry of the per-request APDU activity log returned to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ApduLogEntry {
    pub command: String,
    pub command_hex: String,
    pub response_hex: String,
    pub sw1: u8,
    pub sw2: u8,
    pub status: ApduStatus,
    pub description: String,
}

/// Formats bytes as spaced uppercase hex, the way the UI renders traces.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human-readable meaning of an ISO 7816 status word.
pub fn status_word_description(sw1: u8, sw2: u8) -> String {
    match (sw1, sw2) {
        (0x90, 0x00) => "Success".to_string(),
        (0x61, n) => format!("{n} bytes of response data available"),
        (0x62, 0x81) => "Part of returned data may be corrupted".to_string(),
        (0x62, 0x82) => "End of file reached before reading Le bytes".to_string(),
        (0x63, 0x00) => "Verification failed".to_string(),
        (0x63, n) if n >= 0xc0 => {
            format!("Verification failed, {} retries remaining", n & 0x0f)
        }
        (0x64, _) => "Execution error".to_string(),
        (0x65, _) => "Memory failure".to_string(),
        (0x67, 0x00) => "Wrong length".to_string(),
        (0x68, 0x81) => "Logical channel not supported".to_string(),
        (0x68, 0x82) => "Secure messaging not supported".to_string(),
        (0x69, 0x81) => "Command incompatible with file structure".to_string(),
        (0x69, 0x82) => "Security status not satisfied".to_string(),
        (0x69, 0x83) => "Authentication method blocked".to_string(),
        (0x69, 0x84) => "Referenced data invalidated".to_string(),
        (0x69, 0x85) => "Conditions of use not satisfied".to_string(),
        (0x69, 0x86) => "Command not allowed (no current EF)".to_string(),
        (0x6a, 0x80) => "Incorrect parameters in data field".to_string(),
        (0x6a, 0x81) => "Function not supported".to_string(),
        (0x6a, 0x82) => "File not found / Data object not found".to_string(),
        (0x6a, 0x83) => "Record not found".to_string(),
        (0x6a, 0x84) => "Not enough memory space".to_string(),
        (0x6a, 0x86) => "Incorrect parameters P1-P2".to_string(),
        (0x6a, 0x88) => "Referenced data not found".to_string(),
        (0x6b, 0x00) => "Wrong parameter(s) P1-P2".to_string(),
        (0x6c, n) => format!("Wrong Le field; {n} bytes available"),
        (0x6d, 0x00) => "Instruction code not supported or invalid".to_string(),
        (0x6e, 0x00) => "Class not supported".to_string(),
        (0x6f, 0x00) => "No precise diagnosis".to_string(),
        _ => format!("Unknown status: {sw1:02X} {sw2:02X}"),
    }
}

fn log_one(log: &mut Vec<ApduLogEntry>, name: &str, apdu: &[u8], raw: &[u8], sw1: u8, sw2: u8) {
    log.push(ApduLogEntry {
        command: name.to_string(),
        command_hex: bytes_to_hex(apdu),
        response_hex: bytes_to_hex(raw),
        sw1,
        sw2,
        status: ApduStatus::classify(sw1, sw2),
        description: status_word_description(sw1, sw2),
    });
}

/// Transmits a command, resolving `61XX` with GET RESPONSE and `6CXX` by
/// retransmitting with the corrected `Le`, concatenating all body chunks.
/// Every wire APDU is appended to `log`.
///
/// The terminating status word is whatever the card last returned; callers
/// decide whether a non-`9000` terminator is an error.
pub fn exchange_chained(
    card: &impl ApduExchange,
    request: &Iso7816RequestApdu,
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<Iso7816ResponseApdu> {
    let mut apdu = request.to_bytes(Iso7816LengthForm::ShortOnly)?;
    let mut body = Vec::new();
    let mut get_response_round = false;

    loop {
        let raw = card.transmit_raw(&apdu)?;
        let resp = Iso7816ResponseApdu::try_from(&raw[..])?;
        let label = if get_response_round {
            format!("{name} (GET RESPONSE)")
        } else {
            name.to_string()
        };
        log_one(&mut *log, &label, &apdu, &raw, resp.sw1, resp.sw2);

        if let Some(le) = resp.wrong_le() {
            // 6CXX: same command again with Le = XX. The body is discarded by
            // the card, so nothing is accumulated.
            let mut retry = request.clone();
            retry.ne = usize::from(le);
            apdu = retry.to_bytes(Iso7816LengthForm::ShortOnly)?;
            continue;
        }

        body.extend_from_slice(&resp.data);

        if resp.bytes_available() > 0 {
            apdu = get_response(request.cla & 0x0f, resp.bytes_available())
                .to_bytes(Iso7816LengthForm::ShortOnly)?;
            get_response_round = true;
            continue;
        }

        return Ok(Iso7816ResponseApdu {
            data: body,
            sw1: resp.sw1,
            sw2: resp.sw2,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedCard;

    #[test]
    fn raw_transmit_validates_length() {
        let card = ScriptedCard::new();
        let e = transmit_apdu(&card, &[0x00, 0xa4]).unwrap_err();
        assert_eq!(e.code(), "INVALID_PARAMS");
        assert!(card.transmitted.borrow().is_empty());
    }

    #[test]
    fn raw_transmit_returns_status_word() {
        let card = ScriptedCard::new();
        card.reply_with_sw(&[0x01, 0x02], 0x90, 0x00);
        let r = transmit_apdu(&card, &[0x00, 0xa4, 0x04, 0x00]).unwrap();
        assert_eq!(r, vec![0x01, 0x02, 0x90, 0x00]);
    }

    #[test]
    fn chaining_61xx() {
        let card = ScriptedCard::new();
        card.reply_with_sw(&[0xaa; 10], 0x61, 0x08);
        card.reply_with_sw(&[0xbb; 8], 0x90, 0x00);

        let mut log = Vec::new();
        let req = Iso7816RequestApdu {
            cla: 0x00,
            ins: 0xcb,
            p1: 0x3f,
            p2: 0xff,
            data: vec![0x5c, 0x01, 0x7e],
            ne: 256,
        };
        let resp = exchange_chained(&card, &req, "GET DATA", &mut log).unwrap();
        assert!(resp.is_ok());

        // Observed body equals the concatenation of intermediate payloads.
        let mut want = vec![0xaa; 10];
        want.extend_from_slice(&[0xbb; 8]);
        assert_eq!(resp.data, want);

        // Second wire command was GET RESPONSE with Le = 8.
        let sent = card.transmitted.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], vec![0x00, 0xc0, 0x00, 0x00, 0x08]);

        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, ApduStatus::MoreData);
        assert_eq!(log[1].status, ApduStatus::Ok);
        assert_eq!(log[1].command, "GET DATA (GET RESPONSE)");
    }

    #[test]
    fn chaining_6cxx_retransmits_with_le() {
        let card = ScriptedCard::new();
        card.reply_with_sw(&[], 0x6c, 0x20);
        card.reply_with_sw(&[0xcc; 0x20], 0x90, 0x00);

        let mut log = Vec::new();
        let req = Iso7816RequestApdu {
            cla: 0x00,
            ins: 0xca,
            p1: 0x00,
            p2: 0xfe,
            data: vec![],
            ne: 256,
        };
        let resp = exchange_chained(&card, &req, "GET DATA", &mut log).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data.len(), 0x20);

        let sent = card.transmitted.borrow();
        assert_eq!(sent.len(), 2);
        // Same command, corrected Le.
        assert_eq!(sent[1], vec![0x00, 0xca, 0x00, 0xfe, 0x20]);
    }

    #[test]
    fn non_chaining_errors_pass_through() {
        let card = ScriptedCard::new();
        card.reply(&[0x6a, 0x82]);

        let mut log = Vec::new();
        let req = Iso7816RequestApdu {
            cla: 0x00,
            ins: 0xcb,
            p1: 0x3f,
            p2: 0xff,
            data: vec![0x5c, 0x01, 0x7e],
            ne: 256,
        };
        let resp = exchange_chained(&card, &req, "GET DATA", &mut log).unwrap();
        assert_eq!(resp.sw(), 0x6a82);
        assert!(resp.data.is_empty());
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ApduStatus::Error);
        assert_eq!(log[0].description, "File not found / Data object not found");
    }

    #[test]
    fn retry_counter_description() {
        assert_eq!(
            status_word_description(0x63, 0xc3),
            "Verification failed, 3 retries remaining"
        );
        assert_eq!(status_word_description(0x90, 0x00), "Success");
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(bytes_to_hex(&[0x00, 0xa4, 0x04]), "00 A4 04");
    }
}
