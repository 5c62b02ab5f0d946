//! Transport abstraction over USB HID and NFC authenticators.

pub mod iso7816;

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
#[cfg(feature = "nfc")]
use crate::nfc::{ccid::CCIDCard, ccid::CCIDReader, NFCCard, NFCReader};
#[cfg(feature = "usb")]
use crate::usb::{USBToken, USBTransport};

/// Default per-I/O timeout for [Token::transmit].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The physical transport behind a [Token].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Nfc,
}

/// Cooperative cancellation flag for in-flight operations.
///
/// Clone the token and hand it to another thread; `cancel()` makes the
/// owning operation fail with [Error::Cancelled] at its next check point
/// (between HID reads on USB, between logical exchanges on NFC).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An opened authenticator handle.
///
/// A token is single-owner: one operation occupies it for the whole
/// send-then-read cycle, and requests are strictly ordered. Callers that
/// need concurrency run distinct tokens on distinct threads.
pub trait Token: Debug {
    /// Sends a CTAP message (command byte plus CBOR body) and returns the
    /// raw response (status byte plus CBOR body).
    ///
    /// `timeout` bounds each blocking OS read; it is not an overall
    /// deadline. PC/SC has no per-read timeout and ignores it; the CCID
    /// engine uses its own per-chunk bulk timeout.
    fn transmit(&mut self, ctap: &[u8], cancel: &CancelToken, timeout: Duration)
        -> Result<Vec<u8>, Error>;

    /// Performs any transport-level handshake required before the first
    /// command (the CTAPHID INIT channel allocation on USB; a no-op on
    /// NFC).
    fn init(&mut self) -> Result<(), Error>;

    /// Releases the underlying OS resource. Idempotent; teardown errors
    /// are swallowed.
    fn close(&mut self);

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Opaque, transport-specific device path.
    fn path(&self) -> &str;

    /// Which physical transport this token uses.
    fn transport(&self) -> TransportKind;
}

/// A discovery mechanism yielding authenticator [Token]s.
pub trait Transport {
    type Token: Token;

    /// Enumerates currently attached authenticators.
    fn tokens(&mut self) -> Result<Vec<Self::Token>, Error>;
}

/// [AnyTransport] merges all available transports for the platform.
///
/// If you don't care which transport a token uses, prefer [AnyTransport]:
/// discovery yields USB HID devices first, then PC/SC readers, then raw
/// CCID readers. A subsystem that fails to come up (no PC/SC daemon, no
/// usable USB context) is skipped with a warning rather than failing the
/// whole enumeration.
#[derive(Debug)]
pub struct AnyTransport {
    #[cfg(feature = "usb")]
    usb: Option<USBTransport>,
    #[cfg(feature = "nfc")]
    nfc: Option<NFCReader>,
    #[cfg(feature = "nfc")]
    ccid: Option<CCIDReader>,
}

/// [AnyToken] abstracts calls to USB, PC/SC and CCID authenticators.
#[derive(Debug)]
pub enum AnyToken {
    #[cfg(feature = "usb")]
    Usb(USBToken),
    #[cfg(feature = "nfc")]
    Nfc(NFCCard),
    #[cfg(feature = "nfc")]
    Ccid(CCIDCard),
}

impl Default for AnyTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AnyTransport {
    pub fn new() -> Self {
        #[cfg(feature = "usb")]
        let usb = match USBTransport::new() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("USB HID subsystem unavailable: {e}");
                None
            }
        };
        #[cfg(feature = "nfc")]
        let nfc = match NFCReader::new() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("PC/SC subsystem unavailable: {e}");
                None
            }
        };
        #[cfg(feature = "nfc")]
        let ccid = match CCIDReader::new() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("CCID subsystem unavailable: {e}");
                None
            }
        };

        Self {
            #[cfg(feature = "usb")]
            usb,
            #[cfg(feature = "nfc")]
            nfc,
            #[cfg(feature = "nfc")]
            ccid,
        }
    }
}

impl Transport for AnyTransport {
    type Token = AnyToken;

    fn tokens(&mut self) -> Result<Vec<Self::Token>, Error> {
        let mut o: Vec<Self::Token> = Vec::new();

        #[cfg(feature = "usb")]
        if let Some(usb) = &mut self.usb {
            o.extend(usb.tokens()?.into_iter().map(AnyToken::Usb));
        }

        #[cfg(feature = "nfc")]
        if let Some(nfc) = &mut self.nfc {
            o.extend(nfc.tokens()?.into_iter().map(AnyToken::Nfc));
        }

        #[cfg(feature = "nfc")]
        if let Some(ccid) = &mut self.ccid {
            o.extend(ccid.tokens()?.into_iter().map(AnyToken::Ccid));
        }

        Ok(o)
    }
}

impl Token for AnyToken {
    fn transmit(
        &mut self,
        ctap: &[u8],
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.transmit(ctap, cancel, timeout),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.transmit(ctap, cancel, timeout),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.transmit(ctap, cancel, timeout),
        }
    }

    fn init(&mut self) -> Result<(), Error> {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.init(),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.init(),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.init(),
        }
    }

    fn close(&mut self) {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.close(),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.close(),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.close(),
        }
    }

    fn name(&self) -> &str {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.name(),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.name(),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.name(),
        }
    }

    fn path(&self) -> &str {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.path(),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.path(),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.path(),
        }
    }

    fn transport(&self) -> TransportKind {
        match self {
            #[cfg(feature = "usb")]
            AnyToken::Usb(u) => u.transport(),
            #[cfg(feature = "nfc")]
            AnyToken::Nfc(n) => n.transport(),
            #[cfg(feature = "nfc")]
            AnyToken::Ccid(c) => c.transport(),
        }
    }
}
