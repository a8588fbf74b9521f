//! PIN protocol version 1 platform interface.
//!
//! Each session generates an ephemeral P-256 key pair; the shared secret is
//! the SHA-256 of the x-coordinate of the ECDH shared point. Encryption is
//! AES-256-CBC with a zero IV; authentication is HMAC-SHA-256 truncated to
//! 16 bytes. Nothing here is ever persisted.
use openssl::{ec::EcKey, pkey::Private};

use crate::crypto::{
    compute_sha256, decrypt, ecdh, encrypt, hmac_sha256, public_key_coords,
    public_key_from_coords, regenerate,
};
use crate::ctap2::commands::{ClientPinRequest, ClientPinSubCommand, CoseEc2Key};
use crate::error::{AgentError, Result};

/// Minimum PIN length in Unicode code points.
const PIN_MIN_CODEPOINTS: usize = 4;
/// Maximum PIN length in UTF-8 bytes.
const PIN_MAX_BYTES: usize = 63;
/// Padded PIN length for `setPIN` / `changePIN`.
const PIN_PADDED_LEN: usize = 64;

/// Ephemeral platform state for one PIN protocol session.
///
/// Dropped with the open handle or on any CTAP error; the key pair never
/// outlives the session.
pub struct PinUvSession {
    private_key: EcKey<Private>,
    public_key: CoseEc2Key,
}

impl std::fmt::Debug for PinUvSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinUvSession").finish()
    }
}

impl PinUvSession {
    /// Generates a fresh platform key pair.
    pub fn new() -> Result<Self> {
        let private_key = regenerate()?;
        Self::with_private_key(private_key)
    }

    fn with_private_key(private_key: EcKey<Private>) -> Result<Self> {
        let (x, y) = public_key_coords(&private_key)?;
        Ok(Self {
            private_key,
            public_key: CoseEc2Key { x, y },
        })
    }

    /// Computes the shared secret against the authenticator's key-agreement
    /// key: `SHA-256(x-coordinate of ECDH)`.
    pub fn encapsulate(&self, peer: &CoseEc2Key) -> Result<Vec<u8>> {
        let peer_key = public_key_from_coords(&peer.x, &peer.y)?;
        let mut z = [0u8; 32];
        ecdh(self.private_key.clone(), peer_key, &mut z)?;
        Ok(compute_sha256(&z).to_vec())
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        encrypt(key, Some(&[0u8; 16]), plaintext)
    }

    /// Decrypts a ciphertext under the shared secret (zero IV).
    pub fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt(key, Some(&[0u8; 16]), ciphertext)
    }

    /// HMAC-SHA-256 truncated to 16 bytes.
    pub fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        authenticate(key, message)
    }

    /// Builds a `getKeyAgreement` request.
    pub fn get_key_agreement_cmd(&self) -> ClientPinRequest {
        ClientPinRequest {
            pin_uv_protocol: Some(1),
            sub_command: ClientPinSubCommand::GetKeyAgreement,
            ..Default::default()
        }
    }

    /// Builds a `getPinToken` request.
    pub fn get_pin_token_cmd(&self, pin: &str, shared_secret: &[u8]) -> Result<ClientPinRequest> {
        Ok(ClientPinRequest {
            pin_uv_protocol: Some(1),
            sub_command: ClientPinSubCommand::GetPinToken,
            key_agreement: Some(self.public_key.clone()),
            pin_hash_enc: Some(
                self.encrypt(shared_secret, &compute_sha256(pin.as_bytes())[..16])?,
            ),
            ..Default::default()
        })
    }

    /// Builds a `setPIN` request.
    pub fn set_pin_cmd(&self, new_pin: &str, shared_secret: &[u8]) -> Result<ClientPinRequest> {
        let padded = pad_pin(new_pin)?;
        let new_pin_enc = self.encrypt(shared_secret, &padded)?;
        let pin_uv_auth_param = Some(self.authenticate(shared_secret, &new_pin_enc)?);
        Ok(ClientPinRequest {
            pin_uv_protocol: Some(1),
            sub_command: ClientPinSubCommand::SetPin,
            key_agreement: Some(self.public_key.clone()),
            new_pin_enc: Some(new_pin_enc),
            pin_uv_auth_param,
            ..Default::default()
        })
    }

    /// Builds a `changePIN` request. `pinUvAuthParam` covers
    /// `newPinEnc || pinHashEnc`.
    pub fn change_pin_cmd(
        &self,
        current_pin: &str,
        new_pin: &str,
        shared_secret: &[u8],
    ) -> Result<ClientPinRequest> {
        let padded = pad_pin(new_pin)?;
        let pin_hash_enc =
            self.encrypt(shared_secret, &compute_sha256(current_pin.as_bytes())[..16])?;
        let new_pin_enc = self.encrypt(shared_secret, &padded)?;

        let mut msg = Vec::with_capacity(new_pin_enc.len() + pin_hash_enc.len());
        msg.extend_from_slice(&new_pin_enc);
        msg.extend_from_slice(&pin_hash_enc);
        let pin_uv_auth_param = Some(self.authenticate(shared_secret, &msg)?);

        Ok(ClientPinRequest {
            pin_uv_protocol: Some(1),
            sub_command: ClientPinSubCommand::ChangePin,
            key_agreement: Some(self.public_key.clone()),
            pin_hash_enc: Some(pin_hash_enc),
            new_pin_enc: Some(new_pin_enc),
            pin_uv_auth_param,
            ..Default::default()
        })
    }
}

/// Protocol one's MAC: HMAC-SHA-256 truncated to 16 bytes.
pub fn authenticate(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = hmac_sha256(key, message)?;
    mac.truncate(16);
    Ok(mac)
}

/// Validates a PIN and zero-pads its UTF-8 bytes to 64.
pub fn pad_pin(pin: &str) -> Result<[u8; PIN_PADDED_LEN]> {
    if pin.chars().count() < PIN_MIN_CODEPOINTS {
        return Err(AgentError::PinTooShort);
    }
    let bytes = pin.as_bytes();
    if bytes.len() > PIN_MAX_BYTES {
        return Err(AgentError::InvalidParams(format!(
            "PIN must be at most {PIN_MAX_BYTES} bytes"
        )));
    }
    if bytes.contains(&0) {
        return Err(AgentError::InvalidParams(
            "PIN must not contain null bytes".to_string(),
        ));
    }
    let mut padded = [0u8; PIN_PADDED_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_pin_validates() {
        assert_eq!(pad_pin("123").unwrap_err(), AgentError::PinTooShort);
        assert!(pad_pin(&"a".repeat(64)).is_err());
        assert!(pad_pin("12\u{0}4").is_err());

        let p = pad_pin("123456").unwrap();
        assert_eq!(&p[..6], b"123456");
        assert!(p[6..].iter().all(|b| *b == 0));

        // Multibyte code points: 4 code points is enough even when the byte
        // count differs.
        assert!(pad_pin("пинк").is_ok());
    }

    #[test]
    fn shared_secret_is_symmetric() {
        // Play both sides of the key agreement.
        let platform = PinUvSession::new().unwrap();
        let device = PinUvSession::new().unwrap();

        let s1 = platform.encapsulate(&device.public_key).unwrap();
        let s2 = device.encapsulate(&platform.public_key).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), 32);
    }

    #[test]
    fn set_pin_cmd_shape() {
        let platform = PinUvSession::new().unwrap();
        let shared = vec![0x0a; 32];
        let cmd = platform.set_pin_cmd("123456", &shared).unwrap();
        assert_eq!(cmd.sub_command, ClientPinSubCommand::SetPin);
        assert_eq!(cmd.new_pin_enc.as_ref().unwrap().len(), 64);
        assert_eq!(cmd.pin_uv_auth_param.as_ref().unwrap().len(), 16);
        assert!(cmd.pin_hash_enc.is_none());

        // pinAuth is HMAC(shared, newPinEnc)[..16].
        let expected =
            &crate::crypto::hmac_sha256(&shared, cmd.new_pin_enc.as_ref().unwrap()).unwrap()[..16];
        assert_eq!(cmd.pin_uv_auth_param.as_deref().unwrap(), expected);
    }

    #[test]
    fn change_pin_cmd_shape() {
        let platform = PinUvSession::new().unwrap();
        let shared = vec![0x0b; 32];
        let cmd = platform.change_pin_cmd("4321", "123456", &shared).unwrap();
        assert_eq!(cmd.sub_command, ClientPinSubCommand::ChangePin);
        // pinHashEnc is one AES block: encrypted LEFT(SHA-256(pin), 16).
        assert_eq!(cmd.pin_hash_enc.as_ref().unwrap().len(), 16);
        assert_eq!(cmd.new_pin_enc.as_ref().unwrap().len(), 64);

        // pinAuth covers newPinEnc || pinHashEnc.
        let mut msg = cmd.new_pin_enc.clone().unwrap();
        msg.extend_from_slice(cmd.pin_hash_enc.as_ref().unwrap());
        let expected = &crate::crypto::hmac_sha256(&shared, &msg).unwrap()[..16];
        assert_eq!(cmd.pin_uv_auth_param.as_deref().unwrap(), expected);
    }

    #[test]
    fn pin_token_round_trip() {
        // The authenticator would encrypt the token under the shared secret;
        // decrypting it must recover the token.
        let platform = PinUvSession::new().unwrap();
        let shared = vec![0x0c; 32];
        let token = vec![0x77; 16];
        let enc = crate::crypto::encrypt(&shared, Some(&[0u8; 16]), &token).unwrap();
        assert_eq!(platform.decrypt(&shared, &enc).unwrap(), token);
    }
}
