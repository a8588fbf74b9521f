//! OpenPGP smart-card engine.
//!
//! The same chained-APDU and activity-log machinery as the PIV engine,
//! driving the OpenPGP card application's data objects and password
//! references.
use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::tlv;
use crate::transport::iso7816::{select_by_df_name, Iso7816RequestApdu, Iso7816ResponseApdu};
use crate::transport::pcsc::{exchange_chained, ApduLogEntry};
use crate::transport::ApduExchange;

/// OpenPGP applet AID.
pub const OPENPGP_AID: [u8; 6] = [0xd2, 0x76, 0x00, 0x01, 0x24, 0x01];

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_GET_DATA: u8 = 0xca;
const INS_GENERATE_KEY: u8 = 0x47;

/// PW1, the user password (reference `0x81`).
const REF_PW1: u8 = 0x81;
/// PW3, the admin password (reference `0x83`).
const REF_PW3: u8 = 0x83;

const PW1_MIN_LEN: usize = 6;
const PW3_MIN_LEN: usize = 8;

/// The three on-card key slots, addressed by their control reference
/// template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Signature,
    Decryption,
    Authentication,
}

impl KeyType {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "signature" | "sign" => KeyType::Signature,
            "decryption" | "decrypt" | "encryption" => KeyType::Decryption,
            "authentication" | "auth" => KeyType::Authentication,
            other => {
                return Err(AgentError::InvalidParams(format!(
                    "unknown key type: {other}"
                )))
            }
        })
    }

    /// The control reference template naming this key in GENERATE commands.
    fn crt(&self) -> [u8; 2] {
        match self {
            KeyType::Signature => [0xb6, 0x00],
            KeyType::Decryption => [0xb8, 0x00],
            KeyType::Authentication => [0xa4, 0x00],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            KeyType::Signature => "signature",
            KeyType::Decryption => "decryption",
            KeyType::Authentication => "authentication",
        }
    }
}

/// `openpgpSelect` result.
#[derive(Debug, Clone, Serialize)]
pub struct OpenpgpSelectResult {
    pub selected: bool,
    pub activity_log: Vec<ApduLogEntry>,
}

/// `openpgpReadData` result.
#[derive(Debug, Clone, Serialize)]
pub struct OpenpgpInfo {
    /// Full application AID, hex.
    pub aid: Option<String>,
    /// Card specification version, e.g. `"3.4"`.
    pub version: Option<String>,
    /// Serial number from the AID, hex.
    pub serial_number: Option<String>,
    pub cardholder_name: Option<String>,
    pub language: Option<String>,
    pub url: Option<String>,
    pub pw1_retries: Option<u8>,
    pub pw3_retries: Option<u8>,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenpgpOpResult {
    pub success: bool,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenpgpKeyResult {
    pub key_type: String,
    /// The `7F49` public-key template, hex.
    pub public_key: String,
    pub activity_log: Vec<ApduLogEntry>,
}

fn select(card: &impl ApduExchange, log: &mut Vec<ApduLogEntry>) -> Result<()> {
    let resp = exchange_chained(card, &select_by_df_name(&OPENPGP_AID), "SELECT OpenPGP", log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(())
}

fn get_data(
    card: &impl ApduExchange,
    tag: [u8; 2],
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<Option<Vec<u8>>> {
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_GET_DATA,
        p1: tag[0],
        p2: tag[1],
        data: vec![],
        ne: 256,
    };
    let resp = exchange_chained(card, &req, name, log)?;
    if resp.sw() == 0x6a88 || resp.sw() == 0x6a82 {
        return Ok(None);
    }
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(Some(resp.data))
}

fn verify_outcome(resp: &Iso7816ResponseApdu) -> Result<Option<u8>> {
    match (resp.sw1, resp.sw2) {
        (0x90, 0x00) => Ok(None),
        (0x63, n) if n >= 0xc0 => Ok(Some(n & 0x0f)),
        (0x63, 0x00) => Ok(Some(0)),
        (0x69, 0x83) => Err(AgentError::PinBlocked),
        _ => Err(AgentError::Apdu(resp.sw())),
    }
}

fn check_pw(pw: &str, min: usize) -> Result<()> {
    if pw.len() < min {
        return Err(AgentError::PinTooShort);
    }
    if pw.len() > 127 {
        return Err(AgentError::InvalidParams(
            "password is too long".to_string(),
        ));
    }
    Ok(())
}

/// `openpgpSelect`: applet presence check.
pub fn select_applet(card: &impl ApduExchange) -> Result<OpenpgpSelectResult> {
    let mut log = Vec::new();
    select(card, &mut log)?;
    Ok(OpenpgpSelectResult {
        selected: true,
        activity_log: log,
    })
}

/// `openpgpReadData`: application-related data, cardholder data, URL, and
/// password retry counters.
pub fn read_data(card: &impl ApduExchange) -> Result<OpenpgpInfo> {
    let mut log = Vec::new();
    select(card, &mut log)?;

    let mut info = OpenpgpInfo {
        aid: None,
        version: None,
        serial_number: None,
        cardholder_name: None,
        language: None,
        url: None,
        pw1_retries: None,
        pw3_retries: None,
        activity_log: Vec::new(),
    };

    // Application-related data (6E): AID (4F) and PW status bytes (C4)
    // inside the discretionary data objects (73) on most cards, or at the
    // top level on others.
    match get_data(card, [0x00, 0x6e], "GET DATA (Application Related Data)", &mut log) {
        Ok(Some(data)) => {
            let body = tlv::find(&data, &[0x6e]).unwrap_or(&data);
            let inner = tlv::find(body, &[0x73]).unwrap_or(body);
            if let Some(aid) = tlv::find(body, &[0x4f]).or_else(|| tlv::find(inner, &[0x4f])) {
                info.aid = Some(hex::encode(aid));
                // AID: D2 76 00 01 24 01 vv vv mm mm ss ss ss ss xx xx
                if aid.len() >= 16 {
                    info.version = Some(format!("{}.{}", aid[6], aid[7]));
                    info.serial_number = Some(hex::encode(&aid[10..14]));
                }
            }
            if let Some(c4) = tlv::find(body, &[0xc4]).or_else(|| tlv::find(inner, &[0xc4])) {
                // PW status bytes: validity, max lengths, then the three
                // retry counters.
                if c4.len() >= 7 {
                    info.pw1_retries = Some(c4[4]);
                    info.pw3_retries = Some(c4[6]);
                }
            }
        }
        Ok(None) => debug!("no application-related data"),
        Err(e) => warn!("application-related data read failed: {e}"),
    }

    // Cardholder-related data (65): name (5B) and language (5F2D).
    match get_data(card, [0x00, 0x65], "GET DATA (Cardholder Related Data)", &mut log) {
        Ok(Some(data)) => {
            let body = tlv::find(&data, &[0x65]).unwrap_or(&data);
            info.cardholder_name = tlv::find(body, &[0x5b])
                .map(|v| String::from_utf8_lossy(v).replace("<<", " ").replace('<', " "));
            info.language =
                tlv::find(body, &[0x5f, 0x2d]).map(|v| String::from_utf8_lossy(v).into_owned());
        }
        Ok(None) => debug!("no cardholder data"),
        Err(e) => warn!("cardholder data read failed: {e}"),
    }

    // URL (5F50).
    match get_data(card, [0x5f, 0x50], "GET DATA (URL)", &mut log) {
        Ok(Some(data)) => {
            info.url = Some(String::from_utf8_lossy(&data).into_owned());
        }
        Ok(None) => debug!("no URL"),
        Err(e) => warn!("URL read failed: {e}"),
    }

    info.activity_log = log;
    Ok(info)
}

/// VERIFY a password reference; wrong password surfaces the retry counter.
fn verify_pw(
    card: &impl ApduExchange,
    reference: u8,
    pw: &str,
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<()> {
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_VERIFY,
        p1: 0x00,
        p2: reference,
        data: pw.as_bytes().to_vec(),
        ne: 0,
    };
    let resp = exchange_chained(card, &req, name, log)?;
    match verify_outcome(&resp)? {
        None => Ok(()),
        Some(retries) => Err(AgentError::PinInvalid {
            retries: Some(retries),
        }),
    }
}

fn change_reference(
    card: &impl ApduExchange,
    reference: u8,
    min_len: usize,
    name: &str,
    current: &str,
    new: &str,
) -> Result<OpenpgpOpResult> {
    check_pw(current, min_len)?;
    check_pw(new, min_len)?;

    let mut log = Vec::new();
    select(card, &mut log)?;

    let mut data = current.as_bytes().to_vec();
    data.extend_from_slice(new.as_bytes());
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_CHANGE_REFERENCE,
        p1: 0x00,
        p2: reference,
        data,
        ne: 0,
    };
    let resp = exchange_chained(card, &req, name, &mut log)?;
    match verify_outcome(&resp)? {
        None => Ok(OpenpgpOpResult {
            success: true,
            activity_log: log,
        }),
        Some(retries) => Err(AgentError::PinInvalid {
            retries: Some(retries),
        }),
    }
}

/// `openpgpChangePin`: CHANGE REFERENCE DATA on PW1.
pub fn change_pin(card: &impl ApduExchange, current: &str, new: &str) -> Result<OpenpgpOpResult> {
    change_reference(
        card,
        REF_PW1,
        PW1_MIN_LEN,
        "CHANGE REFERENCE DATA (PW1)",
        current,
        new,
    )
}

/// `openpgpChangeAdminPin`: CHANGE REFERENCE DATA on PW3.
pub fn change_admin_pin(
    card: &impl ApduExchange,
    current: &str,
    new: &str,
) -> Result<OpenpgpOpResult> {
    change_reference(
        card,
        REF_PW3,
        PW3_MIN_LEN,
        "CHANGE REFERENCE DATA (PW3)",
        current,
        new,
    )
}

/// `openpgpImportKey`: on-card GENERATE ASYMMETRIC KEY PAIR for the slot.
/// PW3 must be presented first when provided.
pub fn import_key(
    card: &impl ApduExchange,
    key_type: KeyType,
    admin_pin: Option<&str>,
) -> Result<OpenpgpKeyResult> {
    if let Some(pw3) = admin_pin {
        check_pw(pw3, PW3_MIN_LEN)?;
    }

    let mut log = Vec::new();
    select(card, &mut log)?;

    if let Some(pw3) = admin_pin {
        verify_pw(card, REF_PW3, pw3, "VERIFY PW3", &mut log)?;
    }

    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_GENERATE_KEY,
        p1: 0x80,
        p2: 0x00,
        data: key_type.crt().to_vec(),
        ne: 256,
    };
    let resp = exchange_chained(card, &req, "GENERATE ASYMMETRIC KEY PAIR", &mut log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }

    Ok(OpenpgpKeyResult {
        key_type: key_type.label().to_string(),
        public_key: hex::encode(&resp.data),
        activity_log: log,
    })
}

/// `openpgpExportPublicKey`: reads the public key of an existing key pair.
pub fn export_public_key(card: &impl ApduExchange, key_type: KeyType) -> Result<OpenpgpKeyResult> {
    let mut log = Vec::new();
    select(card, &mut log)?;

    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_GENERATE_KEY,
        p1: 0x81,
        p2: 0x00,
        data: key_type.crt().to_vec(),
        ne: 256,
    };
    let resp = exchange_chained(card, &req, "READ PUBLIC KEY", &mut log)?;
    if resp.sw() == 0x6a88 {
        return Err(AgentError::NotFound(format!(
            "no {} key on the card",
            key_type.label()
        )));
    }
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }

    Ok(OpenpgpKeyResult {
        key_type: key_type.label().to_string(),
        public_key: hex::encode(&resp.data),
        activity_log: log,
    })
}
