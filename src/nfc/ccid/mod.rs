//! CTAP over raw CCID-class USB readers, via `rusb`.
//!
//! This path talks to the reader directly on its bulk endpoints, without
//! a PC/SC daemon: slot status, ICC power and APDU transfer are driven
//! through CCID messages, and the CTAP chaining layer from
//! [crate::nfc::apdu] runs on top.

mod framing;

use std::sync::Mutex;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::error::Error;
use crate::nfc::apdu::{select_applet, send_ctap, ApduTransmitter, APPLET_DF};
use crate::nfc::ccid::framing::{
    await_response, expected_response_type, CcidCommand, CcidResponse, CMD_STATUS_FAILED,
    CMD_STATUS_OK, ICC_STATUS_ABSENT, ICC_STATUS_INACTIVE, PC_TO_RDR_GET_SLOT_STATUS,
    PC_TO_RDR_ICC_POWER_OFF, PC_TO_RDR_ICC_POWER_ON, PC_TO_RDR_XFR_BLOCK,
};
use crate::transport::iso7816::{select_by_df_name, ISO7816RequestAPDU, ISO7816ResponseAPDU};
use crate::transport::{CancelToken, Token, Transport, TransportKind};

/// USB interface class for smart-card readers.
const CCID_CLASS: u8 = 0x0B;

/// Timeout for each bulk transfer chunk.
const BULK_TIMEOUT: Duration = Duration::from_secs(5);

/// bBWI passed on XfrBlock.
const XFR_BLOCK_BWI: u8 = 0x0A;

/// Bulk and interrupt endpoints of a CCID interface.
#[derive(Debug, Clone, Copy)]
struct CcidEndpoints {
    interface: u8,
    bulk_out: u8,
    bulk_in: u8,
    #[allow(dead_code)]
    interrupt: Option<u8>,
}

/// Discovers FIDO authenticators presented through raw CCID readers.
pub struct CCIDReader {
    ctx: Context,
}

impl std::fmt::Debug for CCIDReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CCIDReader").finish_non_exhaustive()
    }
}

impl CCIDReader {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            ctx: Context::new()?,
        })
    }
}

impl Transport for CCIDReader {
    type Token = CCIDCard;

    fn tokens(&mut self) -> Result<Vec<Self::Token>, Error> {
        let mut o = Vec::new();
        for device in self.ctx.devices()?.iter() {
            if ccid_endpoints(&device).is_none() {
                continue;
            }
            let mut card = match CCIDCard::new(device) {
                Ok(card) => card,
                Err(e) => {
                    debug!("skipping CCID device: {e}");
                    continue;
                }
            };
            // Only readers with a FIDO applet in the field are reported.
            let cancel = CancelToken::new();
            match select_applet(&mut CcidTransmitter {
                card: &mut card,
                cancel: &cancel,
            }) {
                Ok(()) => o.push(card),
                Err(e) => {
                    debug!("{}: {e}", card.name);
                    card.close();
                }
            }
        }
        Ok(o)
    }
}

/// Finds the first smart-card interface on configuration 0 and its
/// first bulk OUT, bulk IN, and (optional) interrupt endpoints.
fn ccid_endpoints(device: &Device<Context>) -> Option<CcidEndpoints> {
    let config = device.config_descriptor(0).ok()?;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.class_code() != CCID_CLASS {
                continue;
            }
            let mut bulk_out = None;
            let mut bulk_in = None;
            let mut interrupt = None;
            for ep in desc.endpoint_descriptors() {
                match (ep.transfer_type(), ep.direction()) {
                    (TransferType::Bulk, Direction::Out) => {
                        bulk_out = bulk_out.or(Some(ep.address()));
                    }
                    (TransferType::Bulk, Direction::In) => {
                        bulk_in = bulk_in.or(Some(ep.address()));
                    }
                    (TransferType::Interrupt, _) => {
                        interrupt = interrupt.or(Some(ep.address()));
                    }
                    _ => {}
                }
            }
            if let (Some(bulk_out), Some(bulk_in)) = (bulk_out, bulk_in) {
                return Some(CcidEndpoints {
                    interface: desc.interface_number(),
                    bulk_out,
                    bulk_in,
                    interrupt,
                });
            }
        }
    }
    None
}

/// A FIDO authenticator behind a raw CCID reader.
pub struct CCIDCard {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
    endpoints: CcidEndpoints,
    /// bSeq for the next command; responses are matched against it.
    seq: Mutex<u8>,
    slot: u8,
    name: String,
    path: String,
}

impl std::fmt::Debug for CCIDCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CCIDCard")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CCIDCard {
    /// Opens and claims the reader's CCID interface.
    pub fn new(device: Device<Context>) -> Result<Self, Error> {
        let endpoints = ccid_endpoints(&device)
            .ok_or_else(|| Error::Transport("not a CCID-class device".to_string()))?;
        let path = format!("usb:{:03}:{:03}", device.bus_number(), device.address());
        let mut card = Self {
            device,
            handle: None,
            endpoints,
            seq: Mutex::new(0),
            slot: 0,
            name: String::new(),
            path,
        };
        card.ensure_open()?;
        card.name = card
            .read_name()
            .unwrap_or_else(|| format!("CCID reader at {}", card.path));
        Ok(card)
    }

    fn read_name(&self) -> Option<String> {
        let handle = self.handle.as_ref()?;
        let desc = self.device.device_descriptor().ok()?;
        handle.read_product_string_ascii(&desc).ok()
    }

    /// Reopens the device handle if it was closed between calls.
    fn ensure_open(&mut self) -> Result<(), Error> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut handle = self.device.open()?;
        #[cfg(target_os = "linux")]
        if handle
            .kernel_driver_active(self.endpoints.interface)
            .unwrap_or(false)
        {
            handle.detach_kernel_driver(self.endpoints.interface)?;
        }
        handle.claim_interface(self.endpoints.interface)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, Error> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Transport("CCID device is closed".to_string()))
    }

    fn next_seq(&self) -> u8 {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        let v = *seq;
        *seq = seq.wrapping_add(1);
        v
    }

    /// One CCID exchange: write a command with a fresh bSeq, then await
    /// the matching response, reading through time extensions.
    fn exchange(&mut self, msg_type: u8, params: [u8; 3], data: &[u8]) -> Result<CcidResponse, Error> {
        self.ensure_open()?;
        let seq = self.next_seq();
        let cmd = CcidCommand {
            msg_type,
            slot: self.slot,
            seq,
            params,
            data,
        };
        let bytes = cmd.to_bytes();
        trace!(">>> {:02x?}", &bytes);

        let handle = self.handle()?;
        let written = handle.write_bulk(self.endpoints.bulk_out, &bytes, BULK_TIMEOUT)?;
        if written != bytes.len() {
            return Err(Error::Transport(format!(
                "incomplete CCID write ({written}/{} bytes)",
                bytes.len()
            )));
        }

        let ep = self.endpoints.bulk_in;
        let resp = await_response(
            &mut |buf: &mut [u8]| handle.read_bulk(ep, buf, BULK_TIMEOUT).map_err(Into::into),
            expected_response_type(msg_type),
            seq,
        )?;
        trace!("<<< {:02x?} + {:02x?}", resp.status, &resp.data);
        Ok(resp)
    }

    /// Transmits one APDU: slot status, power-on (and applet
    /// re-selection) when the card is present but off, then XfrBlock.
    /// Returns the card's raw response (data plus SW1/SW2).
    fn send_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>, Error> {
        let status = self.exchange(PC_TO_RDR_GET_SLOT_STATUS, [0; 3], &[])?;
        if status.cmd_status() == CMD_STATUS_FAILED {
            return Err(Error::Transport(format!(
                "reader error 0x{:02x} on GetSlotStatus",
                status.error
            )));
        }
        match status.icc_status() {
            ICC_STATUS_ABSENT => {
                return Err(Error::Transport("no card present".to_string()));
            }
            ICC_STATUS_INACTIVE => {
                let on = self.exchange(PC_TO_RDR_ICC_POWER_ON, [0; 3], &[])?;
                if on.cmd_status() != CMD_STATUS_OK {
                    return Err(Error::Transport(format!(
                        "IccPowerOn failed (error 0x{:02x})",
                        on.error
                    )));
                }
                // The power cycle reset the card and deselected the
                // FIDO applet.
                self.reselect_applet()?;
            }
            _ => {}
        }

        self.xfr_block(apdu)
    }

    /// One XfrBlock transfer carrying a raw APDU.
    fn xfr_block(&mut self, apdu: &[u8]) -> Result<Vec<u8>, Error> {
        let resp = self.exchange(PC_TO_RDR_XFR_BLOCK, [XFR_BLOCK_BWI, 0x00, 0x00], apdu)?;
        if resp.cmd_status() != CMD_STATUS_OK {
            return Err(Error::Transport(format!(
                "XfrBlock failed (error 0x{:02x})",
                resp.error
            )));
        }
        Ok(resp.data)
    }

    /// Selects the FIDO applet on a freshly powered card, bypassing the
    /// slot-status pipeline.
    fn reselect_applet(&mut self) -> Result<(), Error> {
        let select = select_by_df_name(&APPLET_DF).to_bytes()?;
        let raw = self.xfr_block(&select)?;
        let resp = ISO7816ResponseAPDU::try_from(raw.as_slice())?;
        if !resp.is_ok() {
            return Err(Error::Transport(format!(
                "FIDO applet selection failed after power on (SW 0x{:04x})",
                resp.sw()
            )));
        }
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Error> {
        self.exchange(PC_TO_RDR_ICC_POWER_OFF, [0; 3], &[])?;
        Ok(())
    }
}

/// APDU seam over [CCIDCard::send_apdu], checking cancellation between
/// logical exchanges (in-flight bulk transfers are not interrupted).
struct CcidTransmitter<'a> {
    card: &'a mut CCIDCard,
    cancel: &'a CancelToken,
}

impl ApduTransmitter for CcidTransmitter<'_> {
    fn transmit(&mut self, req: &ISO7816RequestAPDU) -> Result<ISO7816ResponseAPDU, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let raw = self.card.send_apdu(&req.to_bytes()?)?;
        ISO7816ResponseAPDU::try_from(raw.as_slice())
    }
}

impl Token for CCIDCard {
    fn init(&mut self) -> Result<(), Error> {
        // The applet was selected at discovery; there is no channel to
        // allocate.
        Ok(())
    }

    fn transmit(
        &mut self,
        ctap: &[u8],
        cancel: &CancelToken,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let mut tx = CcidTransmitter { card: self, cancel };
        send_ctap(&mut tx, ctap)
    }

    fn close(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.power_off() {
                debug!("{}: power off failed: {e}", self.name);
            }
        }
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.endpoints.interface) {
                debug!("{}: release failed: {e}", self.name);
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Nfc
    }
}

impl Drop for CCIDCard {
    fn drop(&mut self) {
        self.close();
    }
}
