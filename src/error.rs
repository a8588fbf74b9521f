use std::fmt;

pub type Result<T> = std::result::Result<T, AgentError>;

/// CTAP2 status bytes, as returned in the first byte of a `CTAPHID_CBOR`
/// response payload.
///
/// Reference: <https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-errata-20220621.html#error-responses>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapError {
    Ok,
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSeq,
    Timeout,
    ChannelBusy,
    InvalidCbor,
    CredentialExcluded,
    UnsupportedAlgorithm,
    OperationDenied,
    KeyStoreFull,
    UnsupportedOption,
    InvalidOption,
    KeepaliveCancel,
    NoCredentials,
    UserActionTimeout,
    NotAllowed,
    PinInvalid,
    PinBlocked,
    PinAuthInvalid,
    PinAuthBlocked,
    PinNotSet,
    PinRequired,
    PinPolicyViolation,
    RequestTooLarge,
    ActionTimeout,
    UpRequired,
    UvBlocked,
    Other(u8),
}

impl From<u8> for CtapError {
    fn from(v: u8) -> Self {
        use CtapError::*;
        match v {
            0x00 => Ok,
            0x01 => InvalidCommand,
            0x02 => InvalidParameter,
            0x03 => InvalidLength,
            0x04 => InvalidSeq,
            0x05 => Timeout,
            0x06 => ChannelBusy,
            0x12 => InvalidCbor,
            0x19 => CredentialExcluded,
            0x26 => UnsupportedAlgorithm,
            0x27 => OperationDenied,
            0x28 => KeyStoreFull,
            0x2b => UnsupportedOption,
            0x2c => InvalidOption,
            0x2d => KeepaliveCancel,
            0x2e => NoCredentials,
            0x2f => UserActionTimeout,
            0x30 => NotAllowed,
            0x31 => PinInvalid,
            0x32 => PinBlocked,
            0x33 => PinAuthInvalid,
            0x34 => PinAuthBlocked,
            0x35 => PinNotSet,
            0x36 => PinRequired,
            0x37 => PinPolicyViolation,
            0x39 => RequestTooLarge,
            0x3a => ActionTimeout,
            0x3b => UpRequired,
            0x3c => UvBlocked,
            v => Other(v),
        }
    }
}

impl CtapError {
    pub fn byte(&self) -> u8 {
        use CtapError::*;
        match self {
            Ok => 0x00,
            InvalidCommand => 0x01,
            InvalidParameter => 0x02,
            InvalidLength => 0x03,
            InvalidSeq => 0x04,
            Timeout => 0x05,
            ChannelBusy => 0x06,
            InvalidCbor => 0x12,
            CredentialExcluded => 0x19,
            UnsupportedAlgorithm => 0x26,
            OperationDenied => 0x27,
            KeyStoreFull => 0x28,
            UnsupportedOption => 0x2b,
            InvalidOption => 0x2c,
            KeepaliveCancel => 0x2d,
            NoCredentials => 0x2e,
            UserActionTimeout => 0x2f,
            NotAllowed => 0x30,
            PinInvalid => 0x31,
            PinBlocked => 0x32,
            PinAuthInvalid => 0x33,
            PinAuthBlocked => 0x34,
            PinNotSet => 0x35,
            PinRequired => 0x36,
            PinPolicyViolation => 0x37,
            RequestTooLarge => 0x39,
            ActionTimeout => 0x3a,
            UpRequired => 0x3b,
            UvBlocked => 0x3c,
            Other(v) => *v,
        }
    }
}

/// Crate-wide error type. Each variant maps onto exactly one wire error code
/// (see [AgentError::code]) so the same condition always produces the same
/// code on every platform.
#[derive(Debug, PartialEq, Eq)]
pub enum AgentError {
    /// The request envelope could not be decoded.
    InvalidRequest(String),
    /// The command name is not part of the command surface.
    UnknownCommand(String),
    /// The command was recognized but its parameters had the wrong shape.
    InvalidParams(String),
    /// No device with the requested id exists.
    NotFound(String),
    /// Another device currently holds the single open slot.
    Busy { open: String, requested: String },
    /// The device id is not open.
    NotOpen(String),
    /// The device id is already open (only used where idempotent success is
    /// not applicable).
    AlreadyOpen(String),
    /// An I/O deadline expired.
    Timeout,
    /// Transport-level failure (HID, PC/SC, OS).
    Io(String),
    /// An HID-only operation was issued against a CCID device, or vice versa.
    DeviceTypeMismatch { id: String, expected: &'static str },
    /// A CTAPHID ERROR frame, carrying the embedded error byte.
    CtapHid(u8),
    /// A non-zero CTAP2 status byte.
    Ctap(CtapError),
    /// A non-9000 U2F status word.
    Ctap1(u16),
    /// A non-9000 APDU status word from a protocol engine.
    Apdu(u16),
    /// Wrong PIN or PUK; carries the remaining retries when the card reported
    /// them.
    PinInvalid { retries: Option<u8> },
    /// The PIN or PUK is blocked.
    PinBlocked,
    /// The PIN is shorter than the protocol minimum.
    PinTooShort,
    /// A PIN is already set on the authenticator.
    PinAlreadySet,
    /// The user did not complete a required action in time.
    UserActionTimeout,
    /// User presence was required but never supplied.
    UserPresenceRequired,
    /// OTP slot swap failed partway; slot 1 restore was attempted.
    SwapFailed(String),
    /// Seed or certificate material could not be decoded.
    Format(String),
    /// CBOR encode/decode failure.
    Cbor,
    /// OpenSSL failure.
    OpenSsl(String),
}

impl AgentError {
    /// The stable wire `code` for this error.
    pub fn code(&self) -> &'static str {
        use AgentError::*;
        match self {
            InvalidRequest(_) => "INVALID_REQUEST",
            UnknownCommand(_) => "UNKNOWN_COMMAND",
            InvalidParams(_) => "INVALID_PARAMS",
            NotFound(_) => "NOT_FOUND",
            Busy { .. } => "BUSY",
            NotOpen(_) => "NOT_OPEN",
            AlreadyOpen(_) => "ALREADY_OPEN",
            Timeout => "TIMEOUT",
            Io(_) | Cbor | OpenSsl(_) => "IO_ERROR",
            DeviceTypeMismatch { .. } => "DEVICE_TYPE_MISMATCH",
            CtapHid(_) => "CTAPHID_ERROR",
            Ctap(_) => "CTAP2_ERROR",
            Ctap1(_) => "CTAP1_ERROR",
            Apdu(_) => "APDU_ERROR",
            PinInvalid { .. } => "PIN_INVALID",
            PinBlocked => "PIN_BLOCKED",
            PinTooShort => "PIN_TOO_SHORT",
            PinAlreadySet => "PIN_ALREADY_SET",
            UserActionTimeout => "USER_ACTION_TIMEOUT",
            UserPresenceRequired => "USER_PRESENCE_REQUIRED",
            SwapFailed(_) => "SWAP_FAILED",
            Format(_) => "FORMAT_ERROR",
        }
    }
}

/// The human-readable wire `message`. Never includes PIN, PUK, or seed
/// material.
impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AgentError::*;
        match self {
            InvalidRequest(m) => write!(f, "Invalid request: {m}"),
            UnknownCommand(c) => write!(f, "Unknown command: {c}"),
            InvalidParams(m) => write!(f, "Invalid parameters: {m}"),
            NotFound(id) => write!(f, "Device {id} not found"),
            Busy { open, requested } => write!(
                f,
                "Device {requested} cannot be opened while {open} is open"
            ),
            NotOpen(id) if id.is_empty() => write!(f, "No device is open"),
            NotOpen(id) => write!(f, "Device {id} is not open"),
            AlreadyOpen(id) => write!(f, "Device {id} is already open"),
            Timeout => write!(f, "The operation timed out"),
            Io(m) => write!(f, "I/O error: {m}"),
            Cbor => write!(f, "CBOR encoding error"),
            OpenSsl(m) => write!(f, "Cryptography error: {m}"),
            DeviceTypeMismatch { id, expected } => {
                write!(f, "Device {id} is not a {expected} device")
            }
            CtapHid(code) => write!(f, "CTAPHID error 0x{code:02X}"),
            Ctap(e) => write!(f, "CTAP2 error 0x{:02X} ({e:?})", e.byte()),
            Ctap1(sw) => write!(f, "U2F error, status word {sw:04X}"),
            Apdu(sw) => write!(f, "APDU error, status word {sw:04X}"),
            PinInvalid { retries: Some(n) } => {
                write!(f, "Wrong PIN, {n} retries remaining")
            }
            PinInvalid { retries: None } => write!(f, "Wrong PIN"),
            PinBlocked => write!(f, "PIN is blocked"),
            PinTooShort => write!(f, "PIN is too short"),
            PinAlreadySet => write!(f, "A PIN is already set on this device"),
            UserActionTimeout => {
                write!(f, "The device timed out waiting for user action")
            }
            UserPresenceRequired => {
                write!(f, "User presence is required; touch the device")
            }
            SwapFailed(m) => write!(f, "OTP slot swap failed: {m}"),
            Format(m) => write!(f, "Format error: {m}"),
        }
    }
}

impl From<CtapError> for AgentError {
    fn from(e: CtapError) -> Self {
        match e {
            CtapError::PinInvalid => AgentError::PinInvalid { retries: None },
            CtapError::PinBlocked | CtapError::PinAuthBlocked => AgentError::PinBlocked,
            CtapError::PinPolicyViolation => AgentError::PinTooShort,
            CtapError::UserActionTimeout | CtapError::ActionTimeout => {
                AgentError::UserActionTimeout
            }
            CtapError::UpRequired => AgentError::UserPresenceRequired,
            e => AgentError::Ctap(e),
        }
    }
}

impl From<pcsc::Error> for AgentError {
    fn from(e: pcsc::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

impl From<hidapi::HidError> for AgentError {
    fn from(e: hidapi::HidError) -> Self {
        AgentError::Io(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for AgentError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        AgentError::OpenSsl(e.to_string())
    }
}

impl From<serde_cbor_2::Error> for AgentError {
    fn from(_: serde_cbor_2::Error) -> Self {
        AgentError::Cbor
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}
