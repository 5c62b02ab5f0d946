//! Error types.

use std::fmt;

/// CTAP 2.0 status codes, as returned in the first byte of a response.
///
/// Values outside the defined taxonomy are preserved: the extension range
/// (0xE0..=0xEF) and vendor range (0xF0..=0xFF) carry their raw code, and
/// anything else lands in [CtapError::Unknown].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapError {
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSeq,
    Timeout,
    ChannelBusy,
    LockRequired,
    InvalidChannel,
    CborUnexpectedType,
    InvalidCbor,
    MissingParameter,
    LimitExceeded,
    UnsupportedExtension,
    CredentialExcluded,
    Processing,
    InvalidCredential,
    UserActionPending,
    OperationPending,
    NoOperations,
    UnsupportedAlgorithm,
    OperationDenied,
    KeyStoreFull,
    NoOperationPending,
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
    PinTokenExpired,
    RequestTooLarge,
    ActionTimeout,
    UpRequired,
    Other,
    SpecLast,
    /// Extension-specific error (0xE0..=0xEF).
    Extension(u8),
    /// Vendor-specific error (0xF0..=0xFF).
    Vendor(u8),
    /// A code outside the CTAP 2.0 taxonomy.
    Unknown(u8),
}

impl From<u8> for CtapError {
    fn from(v: u8) -> Self {
        use CtapError::*;
        match v {
            0x01 => InvalidCommand,
            0x02 => InvalidParameter,
            0x03 => InvalidLength,
            0x04 => InvalidSeq,
            0x05 => Timeout,
            0x06 => ChannelBusy,
            0x0a => LockRequired,
            0x0b => InvalidChannel,
            0x11 => CborUnexpectedType,
            0x12 => InvalidCbor,
            0x14 => MissingParameter,
            0x15 => LimitExceeded,
            0x16 => UnsupportedExtension,
            0x19 => CredentialExcluded,
            0x21 => Processing,
            0x22 => InvalidCredential,
            0x23 => UserActionPending,
            0x24 => OperationPending,
            0x25 => NoOperations,
            0x26 => UnsupportedAlgorithm,
            0x27 => OperationDenied,
            0x28 => KeyStoreFull,
            0x2a => NoOperationPending,
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
            0x38 => PinTokenExpired,
            0x39 => RequestTooLarge,
            0x3a => ActionTimeout,
            0x3b => UpRequired,
            0x7f => Other,
            0xdf => SpecLast,
            0xe0..=0xef => Extension(v),
            0xf0..=0xff => Vendor(v),
            _ => Unknown(v),
        }
    }
}

impl CtapError {
    /// The wire value of this status code.
    pub fn code(&self) -> u8 {
        use CtapError::*;
        match *self {
            InvalidCommand => 0x01,
            InvalidParameter => 0x02,
            InvalidLength => 0x03,
            InvalidSeq => 0x04,
            Timeout => 0x05,
            ChannelBusy => 0x06,
            LockRequired => 0x0a,
            InvalidChannel => 0x0b,
            CborUnexpectedType => 0x11,
            InvalidCbor => 0x12,
            MissingParameter => 0x14,
            LimitExceeded => 0x15,
            UnsupportedExtension => 0x16,
            CredentialExcluded => 0x19,
            Processing => 0x21,
            InvalidCredential => 0x22,
            UserActionPending => 0x23,
            OperationPending => 0x24,
            NoOperations => 0x25,
            UnsupportedAlgorithm => 0x26,
            OperationDenied => 0x27,
            KeyStoreFull => 0x28,
            NoOperationPending => 0x2a,
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
            PinTokenExpired => 0x38,
            RequestTooLarge => 0x39,
            ActionTimeout => 0x3a,
            UpRequired => 0x3b,
            Other => 0x7f,
            SpecLast => 0xdf,
            Extension(v) | Vendor(v) | Unknown(v) => v,
        }
    }
}

/// Errors raised by this crate.
///
/// Transport faults are terminal for the operation; CTAP errors are
/// meaningful to the application (e.g. [CtapError::PinRequired] should
/// trigger a PIN prompt). CTAP operations are never retried internally —
/// user-presence checks and PIN retry counters make blind retry unsafe.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// OS I/O failure, framing violation, or handshake failure.
    Transport(String),
    /// The authenticator returned a non-zero CTAP status byte.
    Ctap { error: CtapError, device: String },
    /// The operation was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::Ctap { error, device } => {
                write!(f, "{device}: CTAP error {error:?} (0x{:02x})", error.code())
            }
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_cbor::Error> for Error {
    fn from(e: serde_cbor::Error) -> Self {
        Error::Transport(format!("CBOR encoding failed: {e}"))
    }
}

#[cfg(feature = "usb")]
impl From<hidapi::HidError> for Error {
    fn from(e: hidapi::HidError) -> Self {
        Error::Transport(format!("HID: {e}"))
    }
}

#[cfg(feature = "nfc")]
impl From<pcsc::Error> for Error {
    fn from(e: pcsc::Error) -> Self {
        Error::Transport(format!("PC/SC: {e}"))
    }
}

#[cfg(feature = "nfc")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::Transport(format!("USB: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for v in 0x01..=0xff_u8 {
            let e = CtapError::from(v);
            if !matches!(e, CtapError::Unknown(_)) {
                assert_eq!(v, e.code());
            }
        }
        assert_eq!(CtapError::from(0x36), CtapError::PinRequired);
        assert_eq!(CtapError::from(0xe7), CtapError::Extension(0xe7));
        assert_eq!(CtapError::from(0xf0), CtapError::Vendor(0xf0));
        assert_eq!(CtapError::from(0x0c), CtapError::Unknown(0x0c));
    }
}
