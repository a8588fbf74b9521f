//! ISO/IEC 7816-4 command and response APDU types.
use crate::error::{AgentError, Result};

/// The form of `Lc` / `Le` length fields used when serializing an
/// [Iso7816RequestApdu].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iso7816LengthForm {
    /// Use short (one-byte) fields only. Data is limited to 255 bytes, `ne`
    /// to 256.
    ShortOnly,
    /// Use extended fields when the lengths require them.
    Extended,
    /// Always use extended (three-byte) fields.
    ExtendedOnly,
}

/// An ISO/IEC 7816-4 command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso7816RequestApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command data (`Lc` is derived from its length).
    pub data: Vec<u8>,
    /// Maximum expected response length (`Ne`); 0 omits `Le` entirely.
    pub ne: usize,
}

impl Iso7816RequestApdu {
    /// Serializes the APDU with the requested length form.
    pub fn to_bytes(&self, form: Iso7816LengthForm) -> Result<Vec<u8>> {
        let extended = match form {
            Iso7816LengthForm::ShortOnly => {
                if self.data.len() > 255 || self.ne > 256 {
                    return Err(AgentError::InvalidParams(
                        "APDU requires extended length form".to_string(),
                    ));
                }
                false
            }
            Iso7816LengthForm::Extended => self.data.len() > 255 || self.ne > 256,
            Iso7816LengthForm::ExtendedOnly => true,
        };
        if self.data.len() > 65535 || self.ne > 65536 {
            return Err(AgentError::InvalidParams("APDU data too long".to_string()));
        }

        let mut o = Vec::with_capacity(7 + self.data.len());
        o.push(self.cla);
        o.push(self.ins);
        o.push(self.p1);
        o.push(self.p2);

        if !self.data.is_empty() {
            if extended {
                o.push(0);
                o.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                o.push(self.data.len() as u8);
            }
            o.extend_from_slice(&self.data);
        }

        if self.ne > 0 {
            if extended {
                if self.data.is_empty() {
                    o.push(0);
                }
                let ne = if self.ne == 65536 { 0 } else { self.ne as u16 };
                o.extend_from_slice(&ne.to_be_bytes());
            } else {
                o.push(if self.ne == 256 { 0 } else { self.ne as u8 });
            }
        }

        Ok(o)
    }
}

/// An ISO/IEC 7816-4 response APDU: body plus the trailing status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso7816ResponseApdu {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl TryFrom<&[u8]> for Iso7816ResponseApdu {
    type Error = AgentError;

    fn try_from(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(AgentError::Io(format!(
                "APDU response too short: {} bytes",
                raw.len()
            )));
        }
        Ok(Self {
            data: raw[..raw.len() - 2].to_vec(),
            sw1: raw[raw.len() - 2],
            sw2: raw[raw.len() - 1],
        })
    }
}

impl Iso7816ResponseApdu {
    /// `true` when the status word is `9000`.
    pub fn is_ok(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// `true` when the card finished the command without error, including
    /// `61XX` (more data waiting for GET RESPONSE).
    pub fn is_success(&self) -> bool {
        self.is_ok() || self.sw1 == 0x61
    }

    /// Bytes the card is waiting to hand over via GET RESPONSE.
    pub fn bytes_available(&self) -> usize {
        if self.sw1 == 0x61 {
            if self.sw2 == 0 {
                256
            } else {
                usize::from(self.sw2)
            }
        } else {
            0
        }
    }

    /// `true` when the card asks for the same command with `Le = SW2`.
    pub fn wrong_le(&self) -> Option<u8> {
        (self.sw1 == 0x6c).then_some(self.sw2)
    }

    /// The status word as a single big-endian u16 (e.g. `0x9000`).
    pub fn sw(&self) -> u16 {
        (u16::from(self.sw1) << 8) | u16::from(self.sw2)
    }
}

/// Builds a SELECT-by-DF-name request for an applet AID.
pub fn select_by_df_name(aid: &[u8]) -> Iso7816RequestApdu {
    Iso7816RequestApdu {
        cla: 0x00,
        ins: 0xa4,
        p1: 0x04,
        p2: 0x00,
        data: aid.to_vec(),
        ne: 256,
    }
}

/// Builds a GET RESPONSE request for `ne` waiting bytes.
pub fn get_response(cla: u8, ne: usize) -> Iso7816RequestApdu {
    Iso7816RequestApdu {
        cla,
        ins: 0xc0,
        p1: 0x00,
        p2: 0x00,
        data: vec![],
        ne,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_piv_short_form() {
        let req = select_by_df_name(&[0xa0, 0x00, 0x00, 0x03, 0x08]);
        assert_eq!(
            req.to_bytes(Iso7816LengthForm::ShortOnly).unwrap(),
            vec![0x00, 0xa4, 0x04, 0x00, 0x05, 0xa0, 0x00, 0x00, 0x03, 0x08, 0x00]
        );
    }

    #[test]
    fn u2f_version_short_form() {
        let req = Iso7816RequestApdu {
            cla: 0x00,
            ins: 0x03,
            p1: 0x00,
            p2: 0x00,
            data: vec![],
            ne: 256,
        };
        assert_eq!(
            req.to_bytes(Iso7816LengthForm::ShortOnly).unwrap(),
            vec![0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn extended_form_encoding() {
        let req = Iso7816RequestApdu {
            cla: 0x00,
            ins: 0x01,
            p1: 0x00,
            p2: 0x00,
            data: vec![0xaa; 64],
            ne: 65536,
        };
        let b = req.to_bytes(Iso7816LengthForm::ExtendedOnly).unwrap();
        // CLA INS P1 P2 00 Lc(2) data Le(2)
        assert_eq!(&b[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40]);
        assert_eq!(b.len(), 7 + 64 + 2);
        assert_eq!(&b[b.len() - 2..], &[0x00, 0x00]);
    }

    #[test]
    fn short_form_rejects_long_data() {
        let req = Iso7816RequestApdu {
            cla: 0,
            ins: 0,
            p1: 0,
            p2: 0,
            data: vec![0; 256],
            ne: 0,
        };
        assert!(req.to_bytes(Iso7816LengthForm::ShortOnly).is_err());
        assert!(req.to_bytes(Iso7816LengthForm::Extended).is_ok());
    }

    #[test]
    fn response_parse() {
        let raw: &[u8] = &[0x55, 0x32, 0x46, 0x5f, 0x56, 0x32, 0x90, 0x00];
        let resp = Iso7816ResponseApdu::try_from(raw).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data, b"U2F_V2");
        assert_eq!(resp.sw(), 0x9000);
    }

    #[test]
    fn response_more_data() {
        let resp = Iso7816ResponseApdu::try_from([0x61, 0x10].as_slice()).unwrap();
        assert!(!resp.is_ok());
        assert!(resp.is_success());
        assert_eq!(resp.bytes_available(), 0x10);

        let resp = Iso7816ResponseApdu::try_from([0x61, 0x00].as_slice()).unwrap();
        assert_eq!(resp.bytes_available(), 256);
    }

    #[test]
    fn response_wrong_le() {
        let resp = Iso7816ResponseApdu::try_from([0x6c, 0x20].as_slice()).unwrap();
        assert_eq!(resp.wrong_le(), Some(0x20));
        assert_eq!(resp.bytes_available(), 0);
    }

    #[test]
    fn response_too_short() {
        assert!(Iso7816ResponseApdu::try_from([0x90].as_slice()).is_err());
    }
}
