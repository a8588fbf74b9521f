//! CTAP2 protocol engine: CBOR command exchange over a CTAPHID channel,
//! plus the management operations the UI drives.
pub mod commands;
pub mod pin_uv;

use std::time::Duration;

use serde::Serialize;

use crate::ctap2::commands::{
    CborCommand, CborResponse, ClientPinSubCommand, CredSubCommand, CredentialManagementRequest,
    GetInfoRequest, GetInfoResponse, ResetRequest,
};
use crate::ctap2::pin_uv::PinUvSession;
use crate::error::{AgentError, CtapError, Result};
use crate::transport::ctaphid::{CtapHidChannel, Response, CTAPHID_CBOR};
use crate::transport::HidExchange;

/// End-to-end budget for a CTAP2 command, sized for user presence.
pub const FIDO2_TIMEOUT: Duration = Duration::from_secs(30);
/// `authenticatorReset` must complete within 10 seconds of power-up.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// A CTAP2 session: one CTAPHID channel on one open HID handle.
///
/// One outstanding command at a time; the channel dies with the handle.
pub struct Ctap2Session<'a, H: HidExchange> {
    hid: &'a H,
    channel: CtapHidChannel,
}

impl<'a, H: HidExchange> Ctap2Session<'a, H> {
    /// Allocates a fresh channel. Re-INIT clears any stale device state.
    pub fn open(hid: &'a H) -> Result<Self> {
        let channel = CtapHidChannel::open(hid)?;
        Ok(Self { hid, channel })
    }

    /// Sends one CBOR command and decodes its response, failing on a
    /// non-zero CTAP2 status byte.
    pub fn transmit<C: CborCommand>(&self, cmd: &C) -> Result<C::Response> {
        self.transmit_with_timeout(cmd, FIDO2_TIMEOUT)
    }

    pub fn transmit_with_timeout<C: CborCommand>(
        &self,
        cmd: &C,
        timeout: Duration,
    ) -> Result<C::Response> {
        let cbor = cmd.cbor()?;
        trace!("CTAP2 >>> {:02x?}", cbor);
        match self.channel.exchange(self.hid, CTAPHID_CBOR, &cbor, timeout)? {
            Response::Cbor(0, data) => C::Response::try_from_cbor(&data),
            Response::Cbor(status, _) => Err(CtapError::from(status).into()),
            r => {
                error!("unexpected CTAPHID response: {r:?}");
                Err(AgentError::Io("unexpected CTAPHID response".to_string()))
            }
        }
    }
}

/// FIDO2 authenticator options as surfaced to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct Fido2Options {
    pub plat: bool,
    pub rk: bool,
    pub client_pin: Option<bool>,
    pub up: bool,
    pub uv: Option<bool>,
}

/// `fido2GetInfo` result.
#[derive(Debug, Clone, Serialize)]
pub struct Fido2Info {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: String,
    pub options: Fido2Options,
    pub max_msg_size: Option<u32>,
    pub pin_protocols: Vec<u32>,
    pub max_credential_count_in_list: Option<u32>,
    pub max_credential_id_length: Option<u32>,
    pub transports: Vec<String>,
    pub algorithms: Vec<String>,
    pub min_pin_length: Option<u32>,
    pub firmware_version: Option<i64>,
}

impl From<GetInfoResponse> for Fido2Info {
    fn from(r: GetInfoResponse) -> Self {
        Fido2Info {
            options: Fido2Options {
                plat: r.option("plat").unwrap_or(false),
                rk: r.option("rk").unwrap_or(false),
                client_pin: r.option("clientPin"),
                up: r.option("up").unwrap_or(true),
                uv: r.option("uv"),
            },
            versions: r.versions.iter().cloned().collect(),
            extensions: r.extensions.clone().unwrap_or_default(),
            aaguid: r.aaguid_string().unwrap_or_default(),
            max_msg_size: r.max_msg_size,
            pin_protocols: r.pin_protocols.clone().unwrap_or_default(),
            max_credential_count_in_list: r.max_cred_count_in_list,
            max_credential_id_length: r.max_cred_id_len,
            transports: r.transports.clone().unwrap_or_else(|| vec!["usb".to_string()]),
            algorithms: r.algorithm_names(),
            min_pin_length: r.min_pin_length,
            firmware_version: r.firmware_version.and_then(|v| i64::try_from(v).ok()),
        }
    }
}

/// `fido2GetPinRetries` result.
#[derive(Debug, Clone, Serialize)]
pub struct PinRetries {
    pub retries: u32,
    pub power_cycle_required: bool,
}

/// One discoverable credential, as listed to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialRecord {
    pub rp_id: String,
    pub rp_name: String,
    pub user_id: String,
    pub user_name: String,
    pub user_display_name: String,
    pub credential_id: String,
    pub cred_protect: Option<u8>,
}

/// `fido2ListCredentials` result.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialList {
    pub credentials: Vec<CredentialRecord>,
    pub existing_count: Option<u32>,
    pub remaining_capacity: Option<u32>,
}

pub fn get_info(hid: &impl HidExchange) -> Result<Fido2Info> {
    let session = Ctap2Session::open(hid)?;
    let info = session.transmit(&GetInfoRequest {})?;
    debug!(?info);
    Ok(info.into())
}

pub fn get_pin_retries(hid: &impl HidExchange) -> Result<PinRetries> {
    let session = Ctap2Session::open(hid)?;
    let resp = session.transmit(&commands::ClientPinRequest {
        pin_uv_protocol: Some(1),
        sub_command: ClientPinSubCommand::GetPinRetries,
        ..Default::default()
    })?;
    Ok(PinRetries {
        retries: resp.pin_retries.unwrap_or(0),
        power_cycle_required: resp.power_cycle_state.unwrap_or(false),
    })
}

/// Sets the initial PIN. Fails with `PIN_ALREADY_SET` when the authenticator
/// reports `clientPin == true`.
pub fn set_pin(hid: &impl HidExchange, new_pin: &str) -> Result<()> {
    let session = Ctap2Session::open(hid)?;

    let info = session.transmit(&GetInfoRequest {})?;
    if info.client_pin_set() {
        return Err(AgentError::PinAlreadySet);
    }

    let pin_uv = PinUvSession::new()?;
    let shared_secret = key_agreement(&session, &pin_uv)?;
    session.transmit(&pin_uv.set_pin_cmd(new_pin, &shared_secret)?)?;
    info!("PIN set");
    Ok(())
}

/// Changes the PIN. A wrong current PIN surfaces as `PIN_INVALID`; the
/// authenticator decrements its retry counter authoritatively, so the
/// operation is never re-issued.
pub fn change_pin(hid: &impl HidExchange, current_pin: &str, new_pin: &str) -> Result<()> {
    let session = Ctap2Session::open(hid)?;
    let pin_uv = PinUvSession::new()?;
    let shared_secret = key_agreement(&session, &pin_uv)?;
    session.transmit(&pin_uv.change_pin_cmd(current_pin, new_pin, &shared_secret)?)?;
    info!("PIN changed");
    Ok(())
}

/// Enumerates discoverable credentials. Always PIN-authenticated; an empty
/// list is a valid result.
pub fn list_credentials(hid: &impl HidExchange, pin: &str) -> Result<CredentialList> {
    let session = Ctap2Session::open(hid)?;
    let token = get_pin_token(&session, pin)?;
    list_credentials_with_token(&session, &token)
}

/// Deletes one credential by its hex id.
pub fn delete_credential(hid: &impl HidExchange, credential_id: &str, pin: &str) -> Result<()> {
    let cred_id = hex::decode(credential_id)
        .map_err(|_| AgentError::InvalidParams("credentialId is not valid hex".to_string()))?;

    let session = Ctap2Session::open(hid)?;
    let token = get_pin_token(&session, pin)?;
    let req = cred_mgmt_request(
        CredSubCommand::DeleteCredential,
        Some(CredentialManagementRequest::params_credential_id(&cred_id)),
        &token,
    )?;
    session.transmit(&req)?;
    info!("credential deleted");
    Ok(())
}

/// Factory-resets the authenticator. The device requires user presence and
/// refuses outside its 10-second post-power-up window; `0x2F` maps to
/// `USER_ACTION_TIMEOUT`, `0x30` stays a distinct CTAP2 error.
pub fn reset(hid: &impl HidExchange) -> Result<()> {
    let session = Ctap2Session::open(hid)?;
    session.transmit_with_timeout(&ResetRequest {}, RESET_TIMEOUT)?;
    info!("authenticator reset");
    Ok(())
}

/// Runs `getKeyAgreement` and derives the session shared secret.
fn key_agreement<H: HidExchange>(
    session: &Ctap2Session<'_, H>,
    pin_uv: &PinUvSession,
) -> Result<Vec<u8>> {
    let resp = session.transmit(&pin_uv.get_key_agreement_cmd())?;
    let peer = resp.key_agreement.ok_or_else(|| {
        error!("authenticator did not return a key agreement key");
        AgentError::Cbor
    })?;
    pin_uv.encapsulate(&peer)
}

/// Fetches and decrypts a PIN token for this session.
fn get_pin_token<H: HidExchange>(session: &Ctap2Session<'_, H>, pin: &str) -> Result<Vec<u8>> {
    let pin_uv = PinUvSession::new()?;
    let resp = session.transmit(&pin_uv.get_key_agreement_cmd())?;
    let peer = resp.key_agreement.ok_or(AgentError::Cbor)?;
    let shared_secret = pin_uv.encapsulate(&peer)?;

    let resp = session.transmit(&pin_uv.get_pin_token_cmd(pin, &shared_secret)?)?;
    let token_enc = resp.pin_token.ok_or(AgentError::Cbor)?;
    pin_uv.decrypt(&shared_secret, &token_enc)
}

fn cred_mgmt_request(
    sub_command: CredSubCommand,
    sub_command_params: Option<std::collections::BTreeMap<serde_cbor_2::Value, serde_cbor_2::Value>>,
    token: &[u8],
) -> Result<CredentialManagementRequest> {
    let mut req = CredentialManagementRequest {
        sub_command,
        sub_command_params,
        pin_uv_protocol: Some(1),
        pin_uv_auth_param: None,
    };
    req.pin_uv_auth_param = Some(pin_uv::authenticate(token, &req.pin_auth_message()?)?);
    Ok(req)
}

fn list_credentials_with_token<H: HidExchange>(
    session: &Ctap2Session<'_, H>,
    token: &[u8],
) -> Result<CredentialList> {
    let mut out = CredentialList {
        credentials: Vec::new(),
        existing_count: None,
        remaining_capacity: None,
    };

    let meta = session.transmit(&cred_mgmt_request(
        CredSubCommand::GetCredsMetadata,
        None,
        token,
    )?)?;
    out.existing_count = meta.existing_credentials_count;
    out.remaining_capacity = meta.max_possible_remaining_credentials_count;

    // Collect every RP first; enumerateCredentials reuses the channel.
    let first_rp = match session.transmit(&cred_mgmt_request(
        CredSubCommand::EnumerateRpsBegin,
        None,
        token,
    )?) {
        Ok(r) => r,
        Err(AgentError::Ctap(CtapError::NoCredentials)) => return Ok(out),
        Err(e) => return Err(e),
    };

    let total_rps = first_rp.total_rps.unwrap_or(1);
    let mut rps = Vec::new();
    if let (Some(rp), Some(hash)) = (first_rp.rp, first_rp.rp_id_hash) {
        rps.push((rp, hash));
    }
    for _ in 1..total_rps {
        let next = session.transmit(&CredentialManagementRequest {
            sub_command: CredSubCommand::EnumerateRpsNext,
            ..Default::default()
        })?;
        if let (Some(rp), Some(hash)) = (next.rp, next.rp_id_hash) {
            rps.push((rp, hash));
        }
    }

    for (rp, rp_id_hash) in rps {
        let first = match session.transmit(&cred_mgmt_request(
            CredSubCommand::EnumerateCredentialsBegin,
            Some(CredentialManagementRequest::params_rp_id_hash(&rp_id_hash)),
            token,
        )?) {
            Ok(r) => r,
            Err(AgentError::Ctap(CtapError::NoCredentials)) => continue,
            Err(e) => return Err(e),
        };

        let total = first.total_credentials.unwrap_or(1);
        push_credential(&mut out.credentials, &rp, first);
        for _ in 1..total {
            let next = session.transmit(&CredentialManagementRequest {
                sub_command: CredSubCommand::EnumerateCredentialsNext,
                ..Default::default()
            })?;
            push_credential(&mut out.credentials, &rp, next);
        }
    }

    Ok(out)
}

fn push_credential(
    out: &mut Vec<CredentialRecord>,
    rp: &commands::EnumeratedRp,
    resp: commands::CredentialManagementResponse,
) {
    let Some(credential_id) = resp.credential_id else {
        warn!("credential entry without an id, skipping");
        return;
    };
    let user = resp.user.unwrap_or_default();
    out.push(CredentialRecord {
        rp_id: rp.id.clone(),
        rp_name: rp.name.clone().unwrap_or_default(),
        user_id: hex::encode(&user.id),
        user_name: user.name.unwrap_or_default(),
        user_display_name: user.display_name.unwrap_or_default(),
        credential_id: hex::encode(credential_id),
        cred_protect: resp.cred_protect,
    });
}
