//! Request dispatch: the JSON-RPC envelopes and the typed command surface.
//!
//! The command name resolves into a [Command] variant before any handler
//! runs; an unrecognized name is a decoder error (`UNKNOWN_COMMAND`), a
//! recognized name with the wrong parameter shape is `INVALID_PARAMS`.
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::otp::seed::SeedFormat;
use crate::registry::{DeviceRegistry, DeviceType};
use crate::transport::{hid, pcsc};
use crate::{ctap1, ctap2, detect, ndef, openpgp, otp, piv};

/// The request envelope: `{id, command, params}`.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Echoed verbatim; a number or a string.
    #[serde(default)]
    pub id: Value,
    pub command: String,
    /// Defaults to `{}` when absent.
    #[serde(default)]
    pub params: Value,
}

/// The response envelope: `{id, status, result?}` or `{id, status, error}`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Response {
            id,
            status: "ok",
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, e: &AgentError) -> Self {
        Response {
            id,
            status: "error",
            result: None,
            error: Some(ErrorBody {
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }
}

/// The full command surface, typed.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command", content = "params", rename_all = "camelCase")]
pub enum Command {
    // System
    Ping {},
    GetVersion {},

    // Registry and raw transports
    ListDevices {},
    #[serde(rename_all = "camelCase")]
    OpenDevice { device_id: String },
    #[serde(rename_all = "camelCase")]
    CloseDevice { device_id: String },
    #[serde(rename_all = "camelCase")]
    SendHid { device_id: String, data: Vec<u8> },
    #[serde(rename_all = "camelCase")]
    ReceiveHid {
        device_id: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    TransmitApdu { device_id: String, apdu: Vec<u8> },

    // Detection
    #[serde(rename_all = "camelCase")]
    DetectProtocols { device_id: String },

    // FIDO2, against the currently open device
    Fido2GetInfo {},
    #[serde(rename_all = "camelCase")]
    Fido2SetPin { new_pin: String },
    #[serde(rename_all = "camelCase")]
    Fido2ChangePin {
        current_pin: String,
        new_pin: String,
    },
    Fido2GetPinRetries {},
    #[serde(rename_all = "camelCase")]
    Fido2ListCredentials { pin: String },
    #[serde(rename_all = "camelCase")]
    Fido2DeleteCredential {
        credential_id: String,
        pin: String,
    },
    Fido2ResetDevice {},

    // U2F
    U2fVersion {},
    #[serde(rename_all = "camelCase")]
    U2fRegister {
        challenge_hash: String,
        app_id_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    U2fAuthenticate {
        challenge_hash: String,
        app_id_hash: String,
        key_handle: String,
        #[serde(default)]
        ctrl: Option<u8>,
    },

    // PIV
    PivGetData {},
    #[serde(rename_all = "camelCase")]
    PivVerifyPin { pin: String },
    #[serde(rename_all = "camelCase")]
    PivChangePin {
        current_pin: String,
        new_pin: String,
    },
    #[serde(rename_all = "camelCase")]
    PivChangePuk {
        current_puk: String,
        new_puk: String,
    },
    #[serde(rename_all = "camelCase")]
    PivUnblockPin { puk: String, new_pin: String },
    #[serde(rename_all = "camelCase")]
    PivGenerateKey {
        slot: String,
        algorithm: String,
        #[serde(default)]
        pin_policy: Option<String>,
        #[serde(default)]
        touch_policy: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PivImportCertificate {
        slot: String,
        certificate: String,
    },
    #[serde(rename_all = "camelCase")]
    PivReadCertificate { slot: String },
    #[serde(rename_all = "camelCase")]
    PivDeleteCertificate { slot: String },

    // OpenPGP
    OpenpgpSelect {},
    OpenpgpReadData {},
    #[serde(rename_all = "camelCase")]
    OpenpgpChangePin {
        current_pin: String,
        new_pin: String,
    },
    #[serde(rename_all = "camelCase")]
    OpenpgpChangeAdminPin {
        current_pin: String,
        new_pin: String,
    },
    #[serde(rename_all = "camelCase")]
    OpenpgpImportKey {
        key_type: String,
        #[serde(default)]
        admin_pin: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    OpenpgpExportPublicKey { key_type: String },

    // OTP
    #[serde(rename_all = "camelCase")]
    OtpReadSlot { slot: u8 },
    #[serde(rename_all = "camelCase")]
    OtpWriteSlot {
        slot: u8,
        seed: String,
        #[serde(default)]
        seed_format: Option<String>,
        #[serde(default)]
        digits: Option<u8>,
        #[serde(default)]
        label: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    OtpDeleteSlot { slot: u8 },
    OtpSwapSlots {},
    #[serde(rename_all = "camelCase")]
    OtpGenerateSeed {
        #[serde(default)]
        length: Option<usize>,
    },

    // NDEF
    NdefRead {},
    #[serde(rename_all = "camelCase")]
    NdefWrite {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        uri: Option<String>,
    },
    NdefFormat {},
}

/// Resolves a command name and parameter object into a [Command].
pub fn parse_command(command: &str, params: Value) -> Result<Command> {
    let tagged = json!({ "command": command, "params": params });
    serde_json::from_value(tagged).map_err(|e| {
        let msg = e.to_string();
        if msg.starts_with("unknown variant") {
            AgentError::UnknownCommand(command.to_string())
        } else {
            AgentError::InvalidParams(msg)
        }
    })
}

/// Processes one raw request line into a response. Never fails: decode
/// problems become error responses.
pub fn process(registry: &mut DeviceRegistry, raw: &str) -> Response {
    let request: Request = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            error!("unparseable request: {e}");
            return Response::error(Value::Null, &AgentError::InvalidRequest(e.to_string()));
        }
    };

    info!("processing {} (id {})", request.command, request.id);
    let params = if request.params.is_null() {
        json!({})
    } else {
        request.params
    };

    match parse_command(&request.command, params).and_then(|cmd| handle(registry, cmd)) {
        Ok(result) => Response::ok(request.id, result),
        Err(e) => {
            warn!("{} failed: {e}", request.command);
            Response::error(request.id, &e)
        }
    }
}

fn ping() -> Value {
    json!({ "message": "pong" })
}

fn version() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": env!("CARGO_PKG_NAME"),
    })
}

/// Decodes a 32-byte hex parameter.
fn hex32(s: &str, name: &str) -> Result<[u8; 32]> {
    let v = hex::decode(s)
        .map_err(|_| AgentError::InvalidParams(format!("{name} is not valid hex")))?;
    v.try_into()
        .map_err(|_| AgentError::InvalidParams(format!("{name} must be 32 bytes")))
}

/// Certificates arrive Base64-encoded, or hex as a fallback.
fn decode_certificate(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if let Ok(der) = base64::engine::general_purpose::STANDARD.decode(&cleaned) {
        return Ok(der);
    }
    hex::decode(&cleaned)
        .map_err(|_| AgentError::Format("certificate is neither Base64 nor hex".to_string()))
}

fn to_value<T: Serialize>(v: T) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| AgentError::Io(e.to_string()))
}

/// Routes one command to its handler. Every handler borrows the registry
/// only for the duration of this call.
pub fn handle(registry: &mut DeviceRegistry, cmd: Command) -> Result<Value> {
    match cmd {
        Command::Ping {} => Ok(ping()),
        Command::GetVersion {} => Ok(version()),

        Command::ListDevices {} => Ok(json!({ "devices": registry.list()? })),
        Command::OpenDevice { device_id } => {
            registry.open(&device_id)?;
            Ok(json!({ "success": true }))
        }
        Command::CloseDevice { device_id } => {
            registry.close(&device_id)?;
            Ok(json!({ "success": true }))
        }

        Command::SendHid { device_id, data } => {
            let written = registry.with_hid(&device_id, |dev| hid::send_hid(dev, &data))?;
            Ok(json!({ "bytes_written": written }))
        }
        Command::ReceiveHid { device_id, timeout } => {
            let timeout = Duration::from_millis(timeout.unwrap_or(5000));
            let data = registry.with_hid(&device_id, |dev| hid::receive_hid(dev, timeout))?;
            Ok(json!({ "data": data }))
        }
        Command::TransmitApdu { device_id, apdu } => {
            let response = registry.with_card(&device_id, |card| pcsc::transmit_apdu(card, &apdu))?;
            Ok(json!({ "response": response }))
        }

        Command::DetectProtocols { device_id } => {
            let protocols = match registry.open_device_type(&device_id)? {
                DeviceType::Hid => registry.with_hid(&device_id, |dev| Ok(detect::detect_hid(dev)))?,
                DeviceType::Ccid => {
                    registry.with_card(&device_id, |card| Ok(detect::detect_ccid(card)))?
                }
            };
            Ok(json!({ "protocols": protocols }))
        }

        Command::Fido2GetInfo {} => to_value(registry.with_open_hid(ctap2::get_info)?),
        Command::Fido2SetPin { new_pin } => {
            registry.with_open_hid(|dev| ctap2::set_pin(dev, &new_pin))?;
            Ok(json!({ "success": true }))
        }
        Command::Fido2ChangePin {
            current_pin,
            new_pin,
        } => {
            registry.with_open_hid(|dev| ctap2::change_pin(dev, &current_pin, &new_pin))?;
            Ok(json!({ "success": true }))
        }
        Command::Fido2GetPinRetries {} => to_value(registry.with_open_hid(ctap2::get_pin_retries)?),
        Command::Fido2ListCredentials { pin } => {
            to_value(registry.with_open_hid(|dev| ctap2::list_credentials(dev, &pin))?)
        }
        Command::Fido2DeleteCredential { credential_id, pin } => {
            registry.with_open_hid(|dev| ctap2::delete_credential(dev, &credential_id, &pin))?;
            Ok(json!({ "success": true }))
        }
        Command::Fido2ResetDevice {} => {
            registry.with_open_hid(ctap2::reset)?;
            Ok(json!({ "success": true }))
        }

        Command::U2fVersion {} => {
            let version = registry.with_open_hid(ctap1::version)?;
            Ok(json!({ "version": version }))
        }
        Command::U2fRegister {
            challenge_hash,
            app_id_hash,
        } => {
            let challenge = hex32(&challenge_hash, "challengeHash")?;
            let app_id = hex32(&app_id_hash, "appIdHash")?;
            to_value(registry.with_open_hid(|dev| ctap1::register(dev, &challenge, &app_id))?)
        }
        Command::U2fAuthenticate {
            challenge_hash,
            app_id_hash,
            key_handle,
            ctrl,
        } => {
            let challenge = hex32(&challenge_hash, "challengeHash")?;
            let app_id = hex32(&app_id_hash, "appIdHash")?;
            let key_handle = hex::decode(&key_handle)
                .map_err(|_| AgentError::InvalidParams("keyHandle is not valid hex".to_string()))?;
            let ctrl = ctrl.unwrap_or(0x03);
            to_value(registry.with_open_hid(|dev| {
                ctap1::authenticate(dev, &challenge, &app_id, &key_handle, ctrl)
            })?)
        }

        Command::PivGetData {} => to_value(registry.with_open_card(piv::get_piv_data)?),
        Command::PivVerifyPin { pin } => {
            to_value(registry.with_open_card(|card| piv::verify_pin(card, &pin))?)
        }
        Command::PivChangePin {
            current_pin,
            new_pin,
        } => to_value(registry.with_open_card(|card| piv::change_pin(card, &current_pin, &new_pin))?),
        Command::PivChangePuk {
            current_puk,
            new_puk,
        } => to_value(registry.with_open_card(|card| piv::change_puk(card, &current_puk, &new_puk))?),
        Command::PivUnblockPin { puk, new_pin } => {
            to_value(registry.with_open_card(|card| piv::unblock_pin(card, &puk, &new_pin))?)
        }
        Command::PivGenerateKey {
            slot,
            algorithm,
            pin_policy,
            touch_policy,
        } => to_value(registry.with_open_card(|card| {
            piv::generate_key(
                card,
                &slot,
                &algorithm,
                pin_policy.as_deref(),
                touch_policy.as_deref(),
            )
        })?),
        Command::PivImportCertificate { slot, certificate } => {
            let der = decode_certificate(&certificate)?;
            to_value(registry.with_open_card(|card| piv::import_certificate(card, &slot, &der))?)
        }
        Command::PivReadCertificate { slot } => {
            to_value(registry.with_open_card(|card| piv::read_certificate(card, &slot))?)
        }
        Command::PivDeleteCertificate { slot } => {
            to_value(registry.with_open_card(|card| piv::delete_certificate(card, &slot))?)
        }

        Command::OpenpgpSelect {} => to_value(registry.with_open_card(openpgp::select_applet)?),
        Command::OpenpgpReadData {} => to_value(registry.with_open_card(openpgp::read_data)?),
        Command::OpenpgpChangePin {
            current_pin,
            new_pin,
        } => to_value(
            registry.with_open_card(|card| openpgp::change_pin(card, &current_pin, &new_pin))?,
        ),
        Command::OpenpgpChangeAdminPin {
            current_pin,
            new_pin,
        } => to_value(
            registry.with_open_card(|card| openpgp::change_admin_pin(card, &current_pin, &new_pin))?,
        ),
        Command::OpenpgpImportKey {
            key_type,
            admin_pin,
        } => {
            let key_type = openpgp::KeyType::parse(&key_type)?;
            to_value(registry.with_open_card(|card| {
                openpgp::import_key(card, key_type, admin_pin.as_deref())
            })?)
        }
        Command::OpenpgpExportPublicKey { key_type } => {
            let key_type = openpgp::KeyType::parse(&key_type)?;
            to_value(registry.with_open_card(|card| openpgp::export_public_key(card, key_type))?)
        }

        Command::OtpReadSlot { slot } => {
            to_value(registry.with_open_hid(|dev| otp::read_slot(dev, slot))?)
        }
        Command::OtpWriteSlot {
            slot,
            seed,
            seed_format,
            digits,
            label,
        } => {
            let format = match seed_format.as_deref() {
                Some(f) => SeedFormat::parse(f)?,
                None => SeedFormat::Auto,
            };
            to_value(registry.with_open_hid(|dev| {
                otp::write_slot(
                    dev,
                    slot,
                    &seed,
                    format,
                    digits.unwrap_or(6),
                    label.as_deref(),
                )
            })?)
        }
        Command::OtpDeleteSlot { slot } => {
            registry.with_open_hid(|dev| otp::delete_slot(dev, slot))?;
            Ok(json!({ "success": true }))
        }
        Command::OtpSwapSlots {} => {
            registry.with_open_hid(otp::swap_slots)?;
            Ok(json!({ "success": true }))
        }
        Command::OtpGenerateSeed { length } => {
            let seed = otp::seed::generate(length.unwrap_or(otp::seed::DEFAULT_SEED_LEN))?;
            Ok(json!({ "seed": seed }))
        }

        Command::NdefRead {} => to_value(registry.with_open_card(ndef::read)?),
        Command::NdefWrite { text, uri } => to_value(
            registry.with_open_card(|card| ndef::write(card, text.as_deref(), uri.as_deref()))?,
        ),
        Command::NdefFormat {} => to_value(registry.with_open_card(ndef::format)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_scenario() {
        // S1: {"id":1,"command":"ping","params":{}} must produce exactly
        // {"id":1,"status":"ok","result":{"message":"pong"}}.
        let cmd = parse_command("ping", json!({})).unwrap();
        assert_eq!(cmd, Command::Ping {});

        let resp = Response::ok(json!(1), ping());
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"id":1,"status":"ok","result":{"message":"pong"}}"#
        );
    }

    #[test]
    fn version_reports_cargo_metadata() {
        let v = version();
        assert_eq!(v["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn unknown_command() {
        let e = parse_command("fooBar", json!({})).unwrap_err();
        assert_eq!(e.code(), "UNKNOWN_COMMAND");
        assert!(e.to_string().contains("fooBar"));
    }

    #[test]
    fn invalid_params() {
        // Recognized command, wrong parameter shape.
        let e = parse_command("openDevice", json!({})).unwrap_err();
        assert_eq!(e.code(), "INVALID_PARAMS");

        let e = parse_command("sendHid", json!({ "deviceId": "hid_1" })).unwrap_err();
        assert_eq!(e.code(), "INVALID_PARAMS");
    }

    #[test]
    fn command_names_resolve() {
        // The whole authoritative surface parses (with minimal params).
        let cases: Vec<(&str, Value)> = vec![
            ("ping", json!({})),
            ("getVersion", json!({})),
            ("listDevices", json!({})),
            ("openDevice", json!({"deviceId": "hid_1"})),
            ("closeDevice", json!({"deviceId": "hid_1"})),
            ("sendHid", json!({"deviceId": "hid_1", "data": [1, 2]})),
            ("receiveHid", json!({"deviceId": "hid_1"})),
            ("receiveHid", json!({"deviceId": "hid_1", "timeout": 1000})),
            ("transmitApdu", json!({"deviceId": "ccid_1", "apdu": [0, 164, 4, 0]})),
            ("detectProtocols", json!({"deviceId": "hid_1"})),
            ("fido2GetInfo", json!({})),
            ("fido2SetPin", json!({"newPin": "123456"})),
            ("fido2ChangePin", json!({"currentPin": "1", "newPin": "2"})),
            ("fido2GetPinRetries", json!({})),
            ("fido2ListCredentials", json!({"pin": "123456"})),
            ("fido2DeleteCredential", json!({"credentialId": "cafe", "pin": "1"})),
            ("fido2ResetDevice", json!({})),
            ("u2fVersion", json!({})),
            (
                "u2fRegister",
                json!({"challengeHash": "00", "appIdHash": "11"}),
            ),
            (
                "u2fAuthenticate",
                json!({"challengeHash": "00", "appIdHash": "11", "keyHandle": "22"}),
            ),
            ("pivGetData", json!({})),
            ("pivVerifyPin", json!({"pin": "123456"})),
            ("pivChangePin", json!({"currentPin": "1", "newPin": "2"})),
            ("pivChangePuk", json!({"currentPuk": "1", "newPuk": "2"})),
            ("pivUnblockPin", json!({"puk": "1", "newPin": "2"})),
            (
                "pivGenerateKey",
                json!({"slot": "9A", "algorithm": "eccp256"}),
            ),
            (
                "pivImportCertificate",
                json!({"slot": "9A", "certificate": "AAAA"}),
            ),
            ("pivReadCertificate", json!({"slot": "9A"})),
            ("pivDeleteCertificate", json!({"slot": "9A"})),
            ("openpgpSelect", json!({})),
            ("openpgpReadData", json!({})),
            ("openpgpChangePin", json!({"currentPin": "1", "newPin": "2"})),
            (
                "openpgpChangeAdminPin",
                json!({"currentPin": "1", "newPin": "2"}),
            ),
            ("openpgpImportKey", json!({"keyType": "sign"})),
            ("openpgpExportPublicKey", json!({"keyType": "sign"})),
            ("otpReadSlot", json!({"slot": 1})),
            ("otpWriteSlot", json!({"slot": 1, "seed": "MZXW6YTBOI"})),
            ("otpDeleteSlot", json!({"slot": 2})),
            ("otpSwapSlots", json!({})),
            ("otpGenerateSeed", json!({})),
            ("otpGenerateSeed", json!({"length": 20})),
            ("ndefRead", json!({})),
            ("ndefWrite", json!({"text": "hello"})),
            ("ndefFormat", json!({})),
        ];
        for (name, params) in cases {
            parse_command(name, params.clone())
                .unwrap_or_else(|e| panic!("{name} with {params}: {e}"));
        }
    }

    #[test]
    fn command_names_are_case_sensitive() {
        assert_eq!(
            parse_command("Ping", json!({})).unwrap_err().code(),
            "UNKNOWN_COMMAND"
        );
        assert_eq!(
            parse_command("listdevices", json!({})).unwrap_err().code(),
            "UNKNOWN_COMMAND"
        );
    }

    #[test]
    fn error_envelope_shape() {
        let resp = Response::error(json!("req-9"), &AgentError::NotOpen("hid_1".to_string()));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], "req-9");
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["code"], "NOT_OPEN");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn id_is_echoed_for_numbers_and_strings() {
        for id in [json!(17), json!("abc-123")] {
            let resp = Response::ok(id.clone(), ping());
            let v = serde_json::to_value(&resp).unwrap();
            assert_eq!(v["id"], id);
        }
    }

    #[test]
    fn hex32_validation() {
        assert!(hex32(&"ab".repeat(32), "x").is_ok());
        assert_eq!(hex32("abcd", "x").unwrap_err().code(), "INVALID_PARAMS");
        assert_eq!(hex32("zz", "x").unwrap_err().code(), "INVALID_PARAMS");
    }

    #[test]
    fn certificate_decoding() {
        assert_eq!(decode_certificate("3q0=").unwrap(), vec![0xde, 0xad]);
        assert_eq!(decode_certificate("dead").unwrap(), vec![0x75, 0xe6, 0x9d]);
        // "dead" is valid Base64, so Base64 wins; pure hex with odd chars
        // falls through.
        assert!(decode_certificate("zzqq!").is_err());
    }

    #[test]
    fn secret_params_never_appear_in_error_messages() {
        // Property 9: a failing request carrying a PIN must not echo it.
        let e = parse_command("fido2ChangePin", json!({"currentPin": "hunter2"})).unwrap_err();
        assert_eq!(e.code(), "INVALID_PARAMS");
        assert!(!e.to_string().contains("hunter2"));

        let resp = Response::error(json!(5), &e);
        let body = serde_json::to_string(&resp).unwrap();
        assert!(!body.contains("hunter2"));
    }
}
