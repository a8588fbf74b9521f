//! PIV smart-card engine.
//!
//! All operations run against an applet selected by `SELECT` of the PIV AID
//! and record every wire APDU in a per-request activity log the UI renders
//! as a hex trace.
use openssl::x509::{X509NameRef, X509};
use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::tlv;
use crate::transport::iso7816::{select_by_df_name, Iso7816RequestApdu, Iso7816ResponseApdu};
use crate::transport::pcsc::{bytes_to_hex, exchange_chained, ApduLogEntry};
use crate::transport::ApduExchange;

/// PIV applet AID.
pub const PIV_AID: [u8; 5] = [0xa0, 0x00, 0x00, 0x03, 0x08];

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_RESET_RETRY: u8 = 0x2c;
const INS_GENERATE_KEY: u8 = 0x47;
const INS_GET_DATA: u8 = 0xcb;
const INS_PUT_DATA: u8 = 0xdb;

/// Card Holder Unique Identifier data object.
const TAG_CHUID: [u8; 3] = [0x5f, 0xc1, 0x02];
/// Discovery object.
const TAG_DISCOVERY: [u8; 1] = [0x7e];

/// PIN reference (`P2`) values.
const REF_PIN: u8 = 0x80;
const REF_PUK: u8 = 0x81;

/// The certificate slots shown on the UI's PIV page.
const DATA_SLOTS: [u8; 5] = [0x9a, 0x9c, 0x9d, 0x9e, 0xf9];

/// Human label for a key reference.
pub fn slot_name(key_ref: u8) -> &'static str {
    match key_ref {
        0x9a => "PIV Authentication",
        0x9c => "Digital Signature",
        0x9d => "Key Management",
        0x9e => "Card Authentication",
        0xf9 => "Attestation",
        0x82..=0x95 => "Retired Key Management",
        _ => "Unknown",
    }
}

/// The certificate data object holding a slot's certificate.
fn slot_object_tag(key_ref: u8) -> Option<[u8; 3]> {
    Some(match key_ref {
        0x9a => [0x5f, 0xc1, 0x05],
        0x9c => [0x5f, 0xc1, 0x0a],
        0x9d => [0x5f, 0xc1, 0x0b],
        0x9e => [0x5f, 0xc1, 0x01],
        0xf9 => [0x5f, 0xff, 0x01],
        // Retired slots 82..95 map onto 5FC10D..5FC120.
        0x82..=0x95 => [0x5f, 0xc1, 0x0d + (key_ref - 0x82)],
        _ => return None,
    })
}

/// Parses a slot id as the UI sends it: `"9A"`, `"9a"` or `"0x9A"`.
pub fn parse_slot(s: &str) -> Result<u8> {
    let cleaned = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    let key_ref = u8::from_str_radix(cleaned, 16)
        .map_err(|_| AgentError::InvalidParams(format!("invalid PIV slot: {s}")))?;
    if slot_object_tag(key_ref).is_none() {
        return Err(AgentError::InvalidParams(format!("unknown PIV slot: {s}")));
    }
    Ok(key_ref)
}

/// Parsed metadata of a slot certificate.
#[derive(Debug, Clone, Serialize)]
pub struct PivCertificate {
    pub slot: String,
    pub slot_name: String,
    pub present: bool,
    pub certificate_data: Option<String>,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial_number: Option<String>,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
}

/// Discovery object contents.
#[derive(Debug, Clone, Serialize)]
pub struct PivDiscovery {
    pub piv_card_application_aid: Option<String>,
    pub pin_usage_policy: Option<String>,
}

/// `pivGetData` payload.
#[derive(Debug, Clone, Serialize)]
pub struct PivInfo {
    pub selected: bool,
    pub chuid: Option<String>,
    pub discovery: Option<PivDiscovery>,
    pub certificates: Vec<PivCertificate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivDataResult {
    pub info: PivInfo,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivVerifyResult {
    pub verified: bool,
    /// Remaining tries as reported in `63CX`, when verification failed.
    pub retries: Option<u8>,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivOpResult {
    pub success: bool,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivGenerateResult {
    pub slot: String,
    pub algorithm: String,
    /// The `7F49` public-key template, hex.
    pub public_key: String,
    pub activity_log: Vec<ApduLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivCertificateResult {
    pub certificate: PivCertificate,
    pub activity_log: Vec<ApduLogEntry>,
}

/// Selects the PIV applet; any non-`9000` is fatal to the operation.
fn select(card: &impl ApduExchange, log: &mut Vec<ApduLogEntry>) -> Result<()> {
    let resp = exchange_chained(card, &select_by_df_name(&PIV_AID), "SELECT PIV", log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(())
}

/// GET DATA for one object. `Ok(None)` when the card answers "not found".
fn get_data(
    card: &impl ApduExchange,
    tag: &[u8],
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<Option<Vec<u8>>> {
    let mut data = vec![0x5c, tag.len() as u8];
    data.extend_from_slice(tag);
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_GET_DATA,
        p1: 0x3f,
        p2: 0xff,
        data,
        ne: 256,
    };
    let resp = exchange_chained(card, &req, name, log)?;
    if resp.sw() == 0x6a82 {
        return Ok(None);
    }
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }
    Ok(Some(resp.data))
}

/// PUT DATA, using command chaining when the object exceeds one short APDU.
fn put_data(
    card: &impl ApduExchange,
    tag: &[u8],
    object: &[u8],
    name: &str,
    log: &mut Vec<ApduLogEntry>,
) -> Result<()> {
    let mut data = vec![0x5c, tag.len() as u8];
    data.extend_from_slice(tag);
    data.extend_from_slice(object);

    let chunks: Vec<&[u8]> = data.chunks(0xff).collect();
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let req = Iso7816RequestApdu {
            cla: if i == last { 0x00 } else { 0x10 },
            ins: INS_PUT_DATA,
            p1: 0x3f,
            p2: 0xff,
            data: chunk.to_vec(),
            ne: 0,
        };
        let label = if chunks.len() > 1 {
            format!("{name} (chain {}/{})", i + 1, chunks.len())
        } else {
            name.to_string()
        };
        let resp = exchange_chained(card, &req, &label, log)?;
        if !resp.is_ok() {
            return Err(AgentError::Apdu(resp.sw()));
        }
    }
    Ok(())
}

/// Zero-pads a PIN or PUK to the 8-byte PIV reference data format (0xFF
/// fill).
fn pad_reference(value: &str) -> Result<[u8; 8]> {
    let bytes = value.as_bytes();
    if bytes.len() < 6 {
        return Err(AgentError::PinTooShort);
    }
    if bytes.len() > 8 {
        return Err(AgentError::InvalidParams(
            "PIN/PUK must be at most 8 bytes".to_string(),
        ));
    }
    let mut padded = [0xffu8; 8];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// Decodes a verification status word: `Ok(retries)` when it reported a
/// failed try, errors for blocked references.
fn verify_outcome(resp: &Iso7816ResponseApdu) -> Result<Option<u8>> {
    match (resp.sw1, resp.sw2) {
        (0x90, 0x00) => Ok(None),
        (0x63, n) if n >= 0xc0 => Ok(Some(n & 0x0f)),
        (0x63, 0x00) => Ok(Some(0)),
        (0x69, 0x83) => Err(AgentError::PinBlocked),
        _ => Err(AgentError::Apdu(resp.sw())),
    }
}

/// `pivGetData`: the PIV page's composite read.
pub fn get_piv_data(card: &impl ApduExchange) -> Result<PivDataResult> {
    let mut log = Vec::new();
    select(card, &mut log)?;

    let mut info = PivInfo {
        selected: true,
        chuid: None,
        discovery: None,
        certificates: Vec::new(),
    };

    match get_data(card, &TAG_DISCOVERY, "GET DATA (Discovery)", &mut log) {
        Ok(Some(data)) => info.discovery = parse_discovery(&data),
        Ok(None) => debug!("no discovery object"),
        Err(e) => warn!("discovery object read failed: {e}"),
    }

    match get_data(card, &TAG_CHUID, "GET DATA (CHUID)", &mut log) {
        Ok(Some(data)) => info.chuid = parse_chuid(&data),
        Ok(None) => debug!("no CHUID"),
        Err(e) => warn!("CHUID read failed: {e}"),
    }

    for key_ref in DATA_SLOTS {
        let tag = slot_object_tag(key_ref).expect("known slot");
        let name = format!("GET DATA (Certificate {:02X})", key_ref);
        let cert = match get_data(card, &tag, &name, &mut log) {
            Ok(Some(data)) => certificate_from_object(key_ref, &data),
            Ok(None) => empty_certificate(key_ref),
            Err(e) => {
                debug!("certificate {key_ref:02X} read failed: {e}");
                empty_certificate(key_ref)
            }
        };
        info.certificates.push(cert);
    }

    info!(
        "PIV data read complete, {} APDUs exchanged",
        log.len()
    );
    Ok(PivDataResult {
        info,
        activity_log: log,
    })
}

fn parse_discovery(data: &[u8]) -> Option<PivDiscovery> {
    let body = tlv::find(data, &[0x7e])?;
    Some(PivDiscovery {
        piv_card_application_aid: tlv::find(body, &[0x4f]).map(bytes_to_hex),
        pin_usage_policy: tlv::find(body, &[0x5f, 0x2f]).map(bytes_to_hex),
    })
}

fn parse_chuid(data: &[u8]) -> Option<String> {
    let body = tlv::find(data, &[0x53]).unwrap_or(data);
    if let Some(guid) = tlv::find(body, &[0x34]).filter(|g| g.len() == 16) {
        return Some(format!(
            "{}-{}-{}-{}-{}",
            hex::encode(&guid[0..4]),
            hex::encode(&guid[4..6]),
            hex::encode(&guid[6..8]),
            hex::encode(&guid[8..10]),
            hex::encode(&guid[10..16])
        ));
    }
    Some(bytes_to_hex(data))
}

fn empty_certificate(key_ref: u8) -> PivCertificate {
    PivCertificate {
        slot: format!("{key_ref:02X}"),
        slot_name: slot_name(key_ref).to_string(),
        present: false,
        certificate_data: None,
        subject: None,
        issuer: None,
        serial_number: None,
        not_before: None,
        not_after: None,
    }
}

/// Builds the slot record from a certificate data object (`53` wrapping
/// `70` with the DER certificate).
fn certificate_from_object(key_ref: u8, data: &[u8]) -> PivCertificate {
    let der = tlv::find(data, &[0x53]).and_then(|body| tlv::find(body, &[0x70]));
    let Some(der) = der.filter(|d| !d.is_empty()) else {
        return empty_certificate(key_ref);
    };

    let mut cert = PivCertificate {
        present: true,
        certificate_data: Some(bytes_to_hex(der)),
        ..empty_certificate(key_ref)
    };

    match X509::from_der(der) {
        Ok(x509) => {
            cert.subject = Some(format_name(x509.subject_name()));
            cert.issuer = Some(format_name(x509.issuer_name()));
            cert.serial_number = x509
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
                .ok();
            cert.not_before = Some(x509.not_before().to_string());
            cert.not_after = Some(x509.not_after().to_string());
        }
        Err(e) => {
            warn!("slot {key_ref:02X} holds an unparseable certificate: {e}");
        }
    }
    cert
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|e| {
            let key = e.object().nid().short_name().unwrap_or("?");
            let value = e
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `pivVerifyPin`: VERIFY against the application PIN. A wrong PIN is a
/// result (with the remaining tries), not an error; a blocked PIN is.
/// Length validation happens before any APDU goes out.
pub fn verify_pin(card: &impl ApduExchange, pin: &str) -> Result<PivVerifyResult> {
    let padded = pad_reference(pin)?;

    let mut log = Vec::new();
    select(card, &mut log)?;

    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_VERIFY,
        p1: 0x00,
        p2: REF_PIN,
        data: padded.to_vec(),
        ne: 0,
    };
    let resp = exchange_chained(card, &req, "VERIFY PIN", &mut log)?;
    let retries = verify_outcome(&resp)?;
    Ok(PivVerifyResult {
        verified: retries.is_none(),
        retries,
        activity_log: log,
    })
}

fn change_reference(
    card: &impl ApduExchange,
    reference: u8,
    name: &str,
    current: &str,
    new: &str,
) -> Result<PivOpResult> {
    let mut data = pad_reference(current)?.to_vec();
    data.extend_from_slice(&pad_reference(new)?);

    let mut log = Vec::new();
    select(card, &mut log)?;

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
        None => Ok(PivOpResult {
            success: true,
            activity_log: log,
        }),
        Some(retries) => Err(AgentError::PinInvalid {
            retries: Some(retries),
        }),
    }
}

/// `pivChangePin`: CHANGE REFERENCE DATA on the application PIN.
pub fn change_pin(card: &impl ApduExchange, current: &str, new: &str) -> Result<PivOpResult> {
    change_reference(card, REF_PIN, "CHANGE REFERENCE DATA (PIN)", current, new)
}

/// `pivChangePuk`: CHANGE REFERENCE DATA on the PUK.
pub fn change_puk(card: &impl ApduExchange, current: &str, new: &str) -> Result<PivOpResult> {
    change_reference(card, REF_PUK, "CHANGE REFERENCE DATA (PUK)", current, new)
}

/// `pivUnblockPin`: RESET RETRY COUNTER, authorizing with the PUK.
pub fn unblock_pin(card: &impl ApduExchange, puk: &str, new_pin: &str) -> Result<PivOpResult> {
    let mut data = pad_reference(puk)?.to_vec();
    data.extend_from_slice(&pad_reference(new_pin)?);

    let mut log = Vec::new();
    select(card, &mut log)?;

    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_RESET_RETRY,
        p1: 0x00,
        p2: REF_PIN,
        data,
        ne: 0,
    };
    let resp = exchange_chained(card, &req, "RESET RETRY COUNTER", &mut log)?;
    match verify_outcome(&resp)? {
        None => Ok(PivOpResult {
            success: true,
            activity_log: log,
        }),
        Some(retries) => Err(AgentError::PinInvalid {
            retries: Some(retries),
        }),
    }
}

fn algorithm_byte(algorithm: &str) -> Result<u8> {
    Ok(match algorithm.to_ascii_lowercase().as_str() {
        "rsa1024" => 0x05,
        "rsa2048" => 0x07,
        "eccp256" | "ecc-p256" | "p256" => 0x11,
        "eccp384" | "ecc-p384" | "p384" => 0x14,
        other => {
            return Err(AgentError::InvalidParams(format!(
                "unknown key algorithm: {other}"
            )))
        }
    })
}

fn policy_byte(policy: &str, kind: &str) -> Result<u8> {
    Ok(match (kind, policy.to_ascii_lowercase().as_str()) {
        (_, "default") => 0x00,
        (_, "never") => 0x01,
        ("pin", "once") => 0x02,
        ("pin", "always") => 0x03,
        ("touch", "always") => 0x02,
        ("touch", "cached") => 0x03,
        _ => {
            return Err(AgentError::InvalidParams(format!(
                "unknown {kind} policy: {policy}"
            )))
        }
    })
}

/// `pivGenerateKey`: GENERATE ASYMMETRIC KEY PAIR with the algorithm and
/// policy template in BER-TLV.
pub fn generate_key(
    card: &impl ApduExchange,
    slot: &str,
    algorithm: &str,
    pin_policy: Option<&str>,
    touch_policy: Option<&str>,
) -> Result<PivGenerateResult> {
    let key_ref = parse_slot(slot)?;
    let alg = algorithm_byte(algorithm)?;

    let mut template = tlv::build(&[0x80], &[alg]);
    if let Some(p) = pin_policy {
        let b = policy_byte(p, "pin")?;
        if b != 0 {
            template.extend_from_slice(&tlv::build(&[0xaa], &[b]));
        }
    }
    if let Some(p) = touch_policy {
        let b = policy_byte(p, "touch")?;
        if b != 0 {
            template.extend_from_slice(&tlv::build(&[0xab], &[b]));
        }
    }
    let data = tlv::build(&[0xac], &template);

    let mut log = Vec::new();
    select(card, &mut log)?;
    let req = Iso7816RequestApdu {
        cla: 0x00,
        ins: INS_GENERATE_KEY,
        p1: 0x00,
        p2: key_ref,
        data,
        ne: 256,
    };
    let resp = exchange_chained(card, &req, "GENERATE ASYMMETRIC KEY PAIR", &mut log)?;
    if !resp.is_ok() {
        return Err(AgentError::Apdu(resp.sw()));
    }

    Ok(PivGenerateResult {
        slot: format!("{key_ref:02X}"),
        algorithm: algorithm.to_string(),
        public_key: hex::encode(&resp.data),
        activity_log: log,
    })
}

/// `pivReadCertificate {slot}`.
pub fn read_certificate(card: &impl ApduExchange, slot: &str) -> Result<PivCertificateResult> {
    let key_ref = parse_slot(slot)?;
    let tag = slot_object_tag(key_ref).expect("validated slot");

    let mut log = Vec::new();
    select(card, &mut log)?;
    let name = format!("GET DATA (Certificate {key_ref:02X})");
    let certificate = match get_data(card, &tag, &name, &mut log)? {
        Some(data) => certificate_from_object(key_ref, &data),
        None => empty_certificate(key_ref),
    };
    Ok(PivCertificateResult {
        certificate,
        activity_log: log,
    })
}

/// `pivImportCertificate {slot, certificate}`: PUT DATA of the certificate
/// object (`70` cert, `71` zero compression, `FE` LRC).
pub fn import_certificate(
    card: &impl ApduExchange,
    slot: &str,
    der: &[u8],
) -> Result<PivOpResult> {
    let key_ref = parse_slot(slot)?;
    let tag = slot_object_tag(key_ref).expect("validated slot");

    // Reject material that is not a certificate before touching the card.
    X509::from_der(der)
        .map_err(|e| AgentError::Format(format!("certificate is not valid DER: {e}")))?;

    let mut object = tlv::build(&[0x70], der);
    object.extend_from_slice(&tlv::build(&[0x71], &[0x00]));
    object.extend_from_slice(&tlv::build(&[0xfe], &[]));
    let object = tlv::build(&[0x53], &object);

    let mut log = Vec::new();
    select(card, &mut log)?;
    put_data(
        card,
        &tag,
        &object,
        &format!("PUT DATA (Certificate {key_ref:02X})"),
        &mut log,
    )?;
    Ok(PivOpResult {
        success: true,
        activity_log: log,
    })
}

/// `pivDeleteCertificate {slot}`: PUT DATA with an empty object.
pub fn delete_certificate(card: &impl ApduExchange, slot: &str) -> Result<PivOpResult> {
    let key_ref = parse_slot(slot)?;
    let tag = slot_object_tag(key_ref).expect("validated slot");

    let mut log = Vec::new();
    select(card, &mut log)?;
    put_data(
        card,
        &tag,
        &tlv::build(&[0x53], &[]),
        &format!("PUT DATA (Delete certificate {key_ref:02X})"),
        &mut log,
    )?;
    Ok(PivOpResult {
        success: true,
        activity_log: log,
    })
}
