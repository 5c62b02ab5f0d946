//! CTAPHID over USB HID, via `hidapi`.

mod framing;
mod responses;

use std::ffi::{CStr, CString};
use std::thread::sleep;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use rand::{thread_rng, RngCore};

use crate::error::Error;
use crate::transport::{CancelToken, Token, Transport, TransportKind};
use crate::usb::framing::{read_message, U2FHIDFrame};
pub use crate::usb::responses::InitResponse;

// u2f_hid.h
const FIDO_USAGE_PAGE: u16 = 0xf1d0;
const FIDO_USAGE_U2FHID: u16 = 0x01;
pub(crate) const HID_RPT_SIZE: usize = 64;

/// Timeout for the INIT handshake.
const U2FHID_INIT_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause before retrying a failed open.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

const TYPE_INIT: u8 = 0x80;
/// Echo data through the local processor only.
pub const U2FHID_PING: u8 = TYPE_INIT | 0x01;
/// Send a U2F (CTAP v1) message frame.
pub const U2FHID_MSG: u8 = TYPE_INIT | 0x03;
/// Channel initialization.
pub const U2FHID_INIT: u8 = TYPE_INIT | 0x06;
/// Send a CTAP v2 (CBOR) message frame.
pub const U2FHID_CBOR: u8 = TYPE_INIT | 0x10;
/// Cancel an outstanding request.
pub const U2FHID_CANCEL: u8 = TYPE_INIT | 0x11;
/// Sent by the device while a long operation is in progress; never
/// surfaced to callers.
pub const U2FHID_KEEPALIVE: u8 = TYPE_INIT | 0x3b;
/// Error response.
pub const U2FHID_ERROR: u8 = TYPE_INIT | 0x3f;

const CID_BROADCAST: u32 = 0xffffffff;

/// Discovers FIDO authenticators on the USB HID bus.
pub struct USBTransport {
    api: HidApi,
}

impl std::fmt::Debug for USBTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("USBTransport").finish_non_exhaustive()
    }
}

impl USBTransport {
    pub fn new() -> Result<Self, Error> {
        Ok(Self { api: HidApi::new()? })
    }
}

impl Transport for USBTransport {
    type Token = USBToken;

    fn tokens(&mut self) -> Result<Vec<Self::Token>, Error> {
        self.api.refresh_devices()?;
        let mut o = Vec::new();
        for d in self
            .api
            .device_list()
            .filter(|d| d.usage_page() == FIDO_USAGE_PAGE && d.usage() == FIDO_USAGE_U2FHID)
        {
            let name = d.product_string().unwrap_or("FIDO authenticator").to_string();
            // Probe-open; inaccessible devices are skipped, not leaked.
            match USBToken::open(d.path(), name) {
                Ok(t) => o.push(t),
                Err(e) => debug!("skipping {:?}: {e}", d.path()),
            }
        }
        Ok(o)
    }
}

/// An open CTAPHID channel to one authenticator.
pub struct USBToken {
    device: Option<HidDevice>,
    cid: u32,
    name: String,
    path: CString,
    path_display: String,
    /// Capability flags reported by the INIT response.
    pub capabilities: u8,
}

impl std::fmt::Debug for USBToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("USBToken")
            .field("name", &self.name)
            .field("path", &self.path_display)
            .field("cid", &self.cid)
            .finish_non_exhaustive()
    }
}

impl USBToken {
    /// Opens the HID stream at `path`.
    ///
    /// A failed open is retried once after a short pause while the device
    /// is still enumerable; the final error distinguishes a present but
    /// unopenable device from one that has gone away.
    pub fn open(path: &CStr, name: String) -> Result<Self, Error> {
        let mut api = HidApi::new()?;
        let device = match api.open_path(path) {
            Ok(d) => d,
            Err(e) => {
                api.refresh_devices()?;
                if !api.device_list().any(|d| d.path() == path) {
                    return Err(Error::Transport("device not connected".to_string()));
                }
                debug!("open failed ({e}), retrying");
                sleep(OPEN_RETRY_DELAY);
                match api.open_path(path) {
                    Ok(d) => d,
                    Err(_) => {
                        api.refresh_devices()?;
                        return Err(Error::Transport(
                            if api.device_list().any(|d| d.path() == path) {
                                "open failed, device present".to_string()
                            } else {
                                "device not connected".to_string()
                            },
                        ));
                    }
                }
            }
        };
        Ok(USBToken {
            device: Some(device),
            cid: 0,
            name,
            path_display: path.to_string_lossy().into_owned(),
            path: path.to_owned(),
            capabilities: 0,
        })
    }

    fn device(&self) -> Result<&HidDevice, Error> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::Transport("HID stream is closed".to_string()))
    }

    /// Drops and reopens the HID stream after a fault.
    fn reopen(&mut self) -> Result<(), Error> {
        self.device = None;
        let api = HidApi::new()?;
        self.device = Some(api.open_path(&self.path)?);
        Ok(())
    }

    /// Sends one CTAPHID message as a sequence of 65-byte output reports.
    fn send_frame(&self, frame: &U2FHIDFrame) -> Result<(), Error> {
        let device = self.device()?;
        for report in frame.fragments()? {
            trace!(">>> {:02x?}", &report);
            device.write(&report)?;
        }
        Ok(())
    }

    /// Reads one 64-byte input report.
    ///
    /// On the first stream fault the stream is closed, reopened and the
    /// read retried once; cancellation closes the stream and aborts.
    fn read_report(
        &mut self,
        timeout: Duration,
        cancel: &CancelToken,
        reopened: &mut bool,
    ) -> Result<Vec<u8>, Error> {
        if cancel.is_cancelled() {
            self.close();
            return Err(Error::Cancelled);
        }
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut buf = vec![0u8; HID_RPT_SIZE];
        let res = self.device()?.read_timeout(&mut buf, timeout_ms);
        let len = match res {
            Ok(len) => len,
            Err(e) if !*reopened => {
                *reopened = true;
                warn!("HID read failed ({e}), reopening stream");
                self.reopen()?;
                self.device()?.read_timeout(&mut buf, timeout_ms)?
            }
            Err(e) => return Err(e.into()),
        };
        if len == 0 {
            return Err(Error::Transport("HID read timed out".to_string()));
        }
        buf.truncate(len);
        trace!("<<< {:02x?}", &buf);
        Ok(buf)
    }
}

impl Token for USBToken {
    fn init(&mut self) -> Result<(), Error> {
        let mut nonce = [0u8; 8];
        thread_rng().fill_bytes(&mut nonce);

        self.send_frame(&U2FHIDFrame {
            cid: CID_BROADCAST,
            cmd: U2FHID_INIT,
            data: nonce.to_vec(),
        })?;

        let cancel = CancelToken::new();
        let mut reopened = false;
        let msg = read_message(CID_BROADCAST, || {
            self.read_report(U2FHID_INIT_TIMEOUT, &cancel, &mut reopened)
        })?;
        if msg.cmd != U2FHID_INIT {
            return Err(Error::Transport(format!(
                "init failed: unexpected response command 0x{:02x}",
                msg.cmd
            )));
        }

        let r = InitResponse::try_from(msg.data.as_slice())?;
        if r.nonce != nonce {
            return Err(Error::Transport("init failed: nonce mismatch".to_string()));
        }
        debug!(
            "allocated channel {:08x}, device {}.{}.{}, capabilities 0x{:02x}",
            r.cid, r.device_version_major, r.device_version_minor, r.device_version_build,
            r.capabilities
        );
        self.cid = r.cid;
        self.capabilities = r.capabilities;
        Ok(())
    }

    fn transmit(
        &mut self,
        ctap: &[u8],
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if self.cid == 0 {
            return Err(Error::Transport("channel not initialized".to_string()));
        }

        let frame = U2FHIDFrame {
            cid: self.cid,
            cmd: U2FHID_CBOR,
            data: ctap.to_vec(),
        };
        if let Err(e) = self.send_frame(&frame) {
            // One transparent reopen on a write fault.
            warn!("HID write failed ({e}), reopening stream");
            self.reopen()?;
            self.send_frame(&frame)?;
        }

        let cid = self.cid;
        let mut reopened = false;
        let msg = read_message(cid, || self.read_report(timeout, cancel, &mut reopened))?;
        Ok(msg.data)
    }

    fn close(&mut self) {
        self.device = None;
        self.cid = 0;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path_display
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Usb
    }
}

impl Drop for USBToken {
    fn drop(&mut self) {
        self.close();
    }
}
