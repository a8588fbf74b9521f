//! NDEF type-4 tag engine: SELECT the tag application and its NDEF file,
//! then length-prefixed binary reads and writes.
use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::transport::iso7816::{select_by_df_name, Iso7816RequestApdu};
use crate::transport::pcsc::{exchange_chained, ApduLogEntry};
use crate::transport::ApduExchange;

/// NDEF type-4 tag application AID.
pub const NDEF_AID: [u8; 7] = [0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
/// NDEF data file id.
const NDEF_FILE_ID: [u8; 2] = [0xe1, 0x04];

const INS_SELECT: u8 = 0xa4;
const INS_READ_BINARY: u8 = 0xb0;
const INS_UPDATE_BINARY: u8 = 0xd6;

/// Read/write chunk size, within the short APDU limit.
const CHUNK: usize = 0xf6;

/// Largest NDEF file body we accept.
const MAX_NDEF_LEN: usize = 0x7fff;

/// One parsed NDEF record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NdefRecord {
    /// Type Name Format field.
    pub tnf: u8,
    /// Record type, e.g. `"T"` or `"U"`.
    pub record_type: String,
    /// Raw payload, hex.
    pub payload: String,
    /// Decoded text for well-known Text records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Decoded URI for well-known URI records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// `ndefRead` result.
#[derive(Debug, Clone, Serialize)]
pub struct NdefReadResult {
    /// The raw NDEF message, hex.
    pub data: String,
    pub records: Vec<NdefRecord>,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NdefOpResult {
    pub success: bool,
    pub bytes_written: usize,
    pub activity_log: Vec<ApduLogEntry>,
}

/// URI abbreviation table, NFC Forum URI RTD.
const URI_PREFIXES: [&str; 9] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
];

fn select_app(card: &impl ApduExchange, log: &mut Vec<ApduLogEntry>) -> Result<()> {
    let resp = exchange_chained(card, &select_by_df_name(&NDEF_AID), "SELECT NDEF Application", log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(())
}

fn select_ndef_file(card: &impl ApduExchange, log: &mut Vec<ApduLogEntry>) -> Result<()> {
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_SELECT,
        p1: 0x00,
        p2: 0x0c,
        data: NDEF_FILE_ID.to_vec(),
        ne: 0,
    };
    let resp = exchange_chained(card, &req, "SELECT NDEF File", log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(())
}

fn read_binary(
    card: &impl ApduExchange,
    offset: usize,
    len: usize,
    log: &mut Vec<ApduLogEntry>,
) -> Result<Vec<u8>> {
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_READ_BINARY,
        p1: (offset >> 8) as u8,
        p2: (offset & 0xff) as u8,
        data: vec![],
        ne: len,
    };
    let resp = exchange_chained(card, &req, "READ BINARY", log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(resp.data)
}

fn update_binary(
    card: &impl ApduExchange,
    offset: usize,
    data: &[u8],
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<()> {
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_UPDATE_BINARY,
        p1: (offset >> 8) as u8,
        p2: (offset & 0xff) as u8,
        data: data.to_vec(),
        ne: 0,
    };
    let resp = exchange_chained(card, &req, name, log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(())
}

/// `ndefRead`: 2-byte length, then that many bytes in chunks.
pub fn read(card: &impl ApduExchange) -> Result<NdefReadResult> {
    let mut log = Vec::new();
    select_app(card, &mut log)?;
    select_ndef_file(card, &mut log)?;

    let header = read_binary(card, 0, 2, &mut log)?;
    if header.len() < 2 {
        return Err(AgentError::Io("short NDEF length read".to_string()));
    }
    let total = usize::from(u16::from_be_bytes([header[0], header[1]]));
    if total > MAX_NDEF_LEN {
        return Err(AgentError::Format(format!(
            "NDEF file claims {total} bytes"
        )));
    }

    let mut body = Vec::with_capacity(total);
    let mut offset = 2;
    while body.len() < total {
        let want = (total - body.len()).min(CHUNK);
        let chunk = read_binary(card, offset, want, &mut log)?;
        if chunk.is_empty() {
            return Err(AgentError::Io("NDEF read stalled".to_string()));
        }
        offset += chunk.len();
        body.extend_from_slice(&chunk);
    }

    Ok(NdefReadResult {
        data: hex::encode(&body),
        records: parse_records(&body),
        activity_log: log,
    })
}

/// Writes a full NDEF message: zero the length, write the body, then the
/// real length. A torn write leaves a consistently-empty file.
fn write_message(card: &impl ApduExchange, message: &[u8]) -> Result<NdefOpResult> {
    if message.len() > MAX_NDEF_LEN {
        return Err(AgentError::Format("NDEF message too large".to_string()));
    }
    let mut log = Vec::new();
    select_app(card, &mut log)?;
    select_ndef_file(card, &mut log)?;

    update_binary(card, 0, &[0x00, 0x00], "UPDATE BINARY (clear length)", &mut log)?;

    let mut offset = 2;
    for chunk in message.chunks(CHUNK) {
        update_binary(card, offset, chunk, "UPDATE BINARY (data)", &mut log)?;
        offset += chunk.len();
    }

    let len = (message.len() as u16).to_be_bytes();
    update_binary(card, 0, &len, "UPDATE BINARY (length)", &mut log)?;

    Ok(NdefOpResult {
        success: true,
        bytes_written: message.len(),
        activity_log: log,
    })
}

/// `ndefWrite {text}` or `{uri}`.
pub fn write(
    card: &impl ApduExchange,
    text: Option<&str>,
    uri: Option<&str>,
) -> Result<NdefOpResult> {
    let message = match (text, uri) {
        (Some(t), None) => build_text_record(t),
        (None, Some(u)) => build_uri_record(u),
        _ => {
            return Err(AgentError::InvalidParams(
                "exactly one of text or uri is required".to_string(),
            ))
        }
    };
    write_message(card, &message)
}

/// `ndefFormat`: an empty NDEF file.
pub fn format(card: &impl ApduExchange) -> Result<NdefOpResult> {
    let mut log = Vec::new();
    select_app(card, &mut log)?;
    select_ndef_file(card, &mut log)?;
    update_binary(card, 0, &[0x00, 0x00], "UPDATE BINARY (format)", &mut log)?;
    Ok(NdefOpResult {
        success: true,
        bytes_written: 0,
        activity_log: log,
    })
}

/// Builds a well-known Text record ("en" language).
pub fn build_text_record(text: &str) -> Vec<u8> {
    let lang = b"en";
    let mut payload = vec![lang.len() as u8];
    payload.extend_from_slice(lang);
    payload.extend_from_slice(text.as_bytes());
    build_record(0x01, b"T", &payload)
}

/// Builds a well-known URI record, abbreviating known prefixes.
pub fn build_uri_record(uri: &str) -> Vec<u8> {
    let (code, rest) = URI_PREFIXES
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, p)| uri.starts_with(**p))
        .map(|(i, p)| (i as u8, &uri[p.len()..]))
        .unwrap_or((0, uri));
    let mut payload = vec![code];
    payload.extend_from_slice(rest.as_bytes());
    build_record(0x01, b"U", &payload)
}

/// One-record message with MB/ME set; short form when the payload allows.
fn build_record(tnf: u8, record_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let short = payload.len() < 256;
    // MB | ME | SR? | TNF
    let mut flags = 0x80 | 0x40 | tnf;
    if short {
        flags |= 0x10;
    }
    let mut out = vec![flags, record_type.len() as u8];
    if short {
        out.push(payload.len() as u8);
    } else {
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(record_type);
    out.extend_from_slice(payload);
    out
}

/// Parses the records of an NDEF message; malformed trailing data is
/// dropped.
pub fn parse_records(mut data: &[u8]) -> Vec<NdefRecord> {
    let mut records = Vec::new();

    while data.len() >= 3 {
        let flags = data[0];
        let tnf = flags & 0x07;
        let short = flags & 0x10 != 0;
        let has_id = flags & 0x08 != 0;

        let type_len = usize::from(data[1]);
        let mut i = 2;
        let payload_len = if short {
            let l = usize::from(data[i]);
            i += 1;
            l
        } else {
            if data.len() < i + 4 {
                break;
            }
            let l = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
            i += 4;
            l
        };
        let id_len = if has_id {
            if data.len() <= i {
                break;
            }
            let l = usize::from(data[i]);
            i += 1;
            l
        } else {
            0
        };

        if data.len() < i + type_len + id_len + payload_len {
            warn!("truncated NDEF record, dropping remainder");
            break;
        }
        let record_type = &data[i..i + type_len];
        let payload = &data[i + type_len + id_len..i + type_len + id_len + payload_len];

        records.push(decode_record(tnf, record_type, payload));

        data = &data[i + type_len + id_len + payload_len..];
        if flags & 0x40 != 0 {
            // Message End
            break;
        }
    }

    records
}

fn decode_record(tnf: u8, record_type: &[u8], payload: &[u8]) -> NdefRecord {
    let type_str = String::from_utf8_lossy(record_type).into_owned();
    let mut record = NdefRecord {
        tnf,
        record_type: type_str,
        payload: hex::encode(payload),
        text: None,
        uri: None,
    };

    if tnf == 0x01 && record_type == b"T" && !payload.is_empty() {
        let lang_len = usize::from(payload[0] & 0x3f);
        if payload.len() > lang_len {
            record.text = Some(String::from_utf8_lossy(&payload[1 + lang_len..]).into_owned());
        }
    } else if tnf == 0x01 && record_type == b"U" && !payload.is_empty() {
        let prefix = URI_PREFIXES.get(usize::from(payload[0])).unwrap_or(&"");
        record.uri = Some(format!(
            "{prefix}{}",
            String::from_utf8_lossy(&payload[1..])
        ));
    }
    record
}
