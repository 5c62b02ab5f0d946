//! CTAP over NFC.
//!
//! Two engines share the chaining layer in [apdu]: [NFCReader]/[NFCCard]
//! drive cards through the platform PC/SC stack, and [ccid] drives raw
//! CCID-class USB readers directly.

pub mod apdu;
pub mod ccid;

use std::ffi::{CStr, CString};
use std::time::Duration;

use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode};

use crate::error::Error;
use crate::nfc::apdu::{select_applet, send_ctap, ApduTransmitter};
use crate::transport::iso7816::{ISO7816RequestAPDU, ISO7816ResponseAPDU};
use crate::transport::{CancelToken, Token, Transport, TransportKind};

/// Receive buffer for one short APDU response: 256 data bytes plus
/// SW1/SW2.
const MAX_SHORT_RESPONSE: usize = 258;

/// Discovers FIDO authenticators presented through PC/SC readers.
pub struct NFCReader {
    ctx: Context,
}

impl std::fmt::Debug for NFCReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NFCReader").finish_non_exhaustive()
    }
}

impl NFCReader {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            ctx: Context::establish(Scope::System)?,
        })
    }

    /// Connects, selects the FIDO applet, and disconnects (leaving the
    /// card state alone) on every exit path.
    fn probe(&self, reader: &CStr) -> bool {
        let card = match self.ctx.connect(reader, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            Err(e) => {
                debug!("{reader:?}: connect failed: {e}");
                return false;
            }
        };
        let cancel = CancelToken::new();
        let selected = select_applet(&mut CardTransmitter {
            card: &card,
            cancel: &cancel,
        });
        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            debug!("{reader:?}: disconnect failed: {e}");
        }
        match selected {
            Ok(()) => true,
            Err(e) => {
                debug!("{reader:?}: {e}");
                false
            }
        }
    }
}

impl Transport for NFCReader {
    type Token = NFCCard;

    fn tokens(&mut self) -> Result<Vec<Self::Token>, Error> {
        let mut names = vec![0u8; 2048];
        let mut o = Vec::new();
        for reader in self.ctx.list_readers(&mut names)? {
            if self.probe(reader) {
                o.push(NFCCard::new(&self.ctx, reader));
            }
        }
        Ok(o)
    }
}

/// A FIDO authenticator behind a named PC/SC reader.
///
/// The card is connected per operation: contactless tokens come and go
/// from the field, so each send performs connect → select → chained
/// send → disconnect (leave).
pub struct NFCCard {
    ctx: Context,
    reader: CString,
    name: String,
}

impl std::fmt::Debug for NFCCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NFCCard").field("reader", &self.name).finish_non_exhaustive()
    }
}

impl NFCCard {
    pub fn new(ctx: &Context, reader: &CStr) -> Self {
        Self {
            ctx: ctx.clone(),
            reader: reader.to_owned(),
            name: reader.to_string_lossy().into_owned(),
        }
    }
}

/// One connected card session, transmitting short APDUs.
struct CardTransmitter<'a> {
    card: &'a Card,
    cancel: &'a CancelToken,
}

impl ApduTransmitter for CardTransmitter<'_> {
    fn transmit(&mut self, req: &ISO7816RequestAPDU) -> Result<ISO7816ResponseAPDU, Error> {
        // Observed between logical exchanges only; an in-flight Transmit
        // is not interrupted.
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cmd = req.to_bytes()?;
        trace!(">>> {:02x?}", &cmd);
        let mut buf = [0u8; MAX_SHORT_RESPONSE];
        let raw = self.card.transmit(&cmd, &mut buf)?;
        trace!("<<< {:02x?}", raw);
        ISO7816ResponseAPDU::try_from(raw)
    }
}

impl Token for NFCCard {
    fn init(&mut self) -> Result<(), Error> {
        // No channel to allocate; the applet is selected per send.
        Ok(())
    }

    fn transmit(
        &mut self,
        ctap: &[u8],
        cancel: &CancelToken,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let card = self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)?;

        let result = {
            let mut tx = CardTransmitter {
                card: &card,
                cancel,
            };
            select_applet(&mut tx).and_then(|()| send_ctap(&mut tx, ctap))
        };
        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            debug!("{}: disconnect failed: {e}", self.name);
        }

        let resp = result?;
        if resp.is_empty() {
            return Err(Error::Transport("empty response from card".to_string()));
        }
        Ok(resp)
    }

    fn close(&mut self) {
        // Nothing held open between sends; the context clone is released
        // on drop.
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Nfc
    }
}
