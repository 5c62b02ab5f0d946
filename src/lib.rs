//! fido2-client-rs is a host-side client for FIDO2/CTAP 2.0
//! authenticators ("security keys") over USB HID and NFC.
//!
//! Discovery yields authenticator handles across three engines — CTAPHID
//! over USB HID ([usb]), CTAP over ISO 7816 through PC/SC readers
//! ([nfc]), and the same over raw CCID-class USB readers
//! ([nfc::ccid]) — behind one [transport::Token] contract. The
//! [ctap2::CtapAuthenticator] layer issues getInfo, makeCredential,
//! getAssertion, getNextAssertion, clientPin and reset, returning raw
//! CBOR response bodies for a WebAuthn layer to decode.
//!
//! ```no_run
//! use fido2_client_rs::ctap2::CtapAuthenticator;
//! use fido2_client_rs::transport::{AnyTransport, Transport};
//!
//! # fn main() -> Result<(), fido2_client_rs::error::Error> {
//! let mut transport = AnyTransport::new();
//! for token in transport.tokens()? {
//!     let mut authenticator = CtapAuthenticator::new(token)?;
//!     let info = authenticator.get_info()?;
//!     println!("{}: {} CBOR bytes", authenticator.name(), info.len());
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

pub mod ctap2;
pub mod error;
pub mod transport;

#[cfg(feature = "nfc")]
pub mod nfc;
#[cfg(feature = "usb")]
pub mod usb;
