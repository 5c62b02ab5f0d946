//! CTAPHID packet framing.
//!
//! A message is carried as one initialization packet
//! (`CID(4) CMD(1) BCNTH BCNTL DATA(≤57)`) followed by continuation
//! packets (`CID(4) SEQ(1) DATA(≤59)`) until `BCNT` payload bytes have
//! been transferred. Output reports are 65 bytes: a zero report-ID byte
//! plus the 64-byte packet.

use crate::error::Error;
use crate::usb::{HID_RPT_SIZE, U2FHID_ERROR, U2FHID_KEEPALIVE};

/// Payload capacity of an initialization packet.
const INIT_DATA_SIZE: usize = HID_RPT_SIZE - 7;
/// Payload capacity of a continuation packet.
const CONT_DATA_SIZE: usize = HID_RPT_SIZE - 5;
/// Largest message a single channel can carry: one initialization packet
/// plus continuation packets SEQ 0x00..=0x7F.
const MAX_MESSAGE_SIZE: usize = INIT_DATA_SIZE + 0x80 * CONT_DATA_SIZE;

/// A complete (unfragmented) CTAPHID message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct U2FHIDFrame {
    /// Channel identifier.
    pub cid: u32,
    /// Command identifier, high bit set.
    pub cmd: u8,
    /// Message payload.
    pub data: Vec<u8>,
}

impl U2FHIDFrame {
    /// Splits the message into 65-byte output reports (report ID 0x00
    /// plus one 64-byte packet each).
    pub fn fragments(&self) -> Result<U2FHIDFrameIterator<'_>, Error> {
        if self.data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Transport(format!(
                "CTAPHID message too long ({} > {MAX_MESSAGE_SIZE})",
                self.data.len()
            )));
        }
        Ok(U2FHIDFrameIterator {
            frame: self,
            off: 0,
            seq: 0,
            sent_init: false,
        })
    }
}

pub(crate) struct U2FHIDFrameIterator<'a> {
    frame: &'a U2FHIDFrame,
    off: usize,
    seq: u8,
    sent_init: bool,
}

impl Iterator for U2FHIDFrameIterator<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let data = &self.frame.data;
        let mut o = vec![0; HID_RPT_SIZE + 1];
        // o[0] = 0 (report ID)

        if !self.sent_init {
            self.sent_init = true;
            o[1..5].copy_from_slice(&self.frame.cid.to_be_bytes());
            o[5] = self.frame.cmd;
            o[6..8].copy_from_slice(&(data.len() as u16).to_be_bytes());
            let n = data.len().min(INIT_DATA_SIZE);
            o[8..8 + n].copy_from_slice(&data[..n]);
            self.off = n;
            Some(o)
        } else if self.off < data.len() {
            o[1..5].copy_from_slice(&self.frame.cid.to_be_bytes());
            o[5] = self.seq;
            self.seq += 1;
            let n = (data.len() - self.off).min(CONT_DATA_SIZE);
            o[6..6 + n].copy_from_slice(&data[self.off..self.off + n]);
            self.off += n;
            Some(o)
        } else {
            None
        }
    }
}

/// One received 64-byte input report, partially decoded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HidReport {
    Init { cid: u32, cmd: u8, bcnt: u16, data: Vec<u8> },
    Cont { cid: u32, seq: u8, data: Vec<u8> },
}

impl TryFrom<&[u8]> for HidReport {
    type Error = Error;

    fn try_from(b: &[u8]) -> Result<Self, Error> {
        if b.len() < 7 {
            return Err(Error::Transport(format!(
                "short CTAPHID report ({} bytes)",
                b.len()
            )));
        }
        let cid = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        if b[4] & 0x80 != 0 {
            let bcnt = u16::from_be_bytes([b[5], b[6]]);
            Ok(HidReport::Init {
                cid,
                cmd: b[4],
                bcnt,
                data: b[7..].to_vec(),
            })
        } else {
            Ok(HidReport::Cont {
                cid,
                seq: b[4],
                data: b[5..].to_vec(),
            })
        }
    }
}

/// Reassembles a message from an initialization report and subsequent
/// continuation reports.
struct FrameAssembler {
    cid: u32,
    cmd: u8,
    bcnt: usize,
    data: Vec<u8>,
}

impl FrameAssembler {
    fn new(cid: u32, cmd: u8, bcnt: u16, first: &[u8]) -> Self {
        let bcnt = bcnt as usize;
        // Working buffer is a whole number of packets.
        let mut data = Vec::with_capacity(bcnt.div_ceil(HID_RPT_SIZE) * HID_RPT_SIZE);
        data.extend_from_slice(&first[..first.len().min(bcnt)]);
        Self { cid, cmd, bcnt, data }
    }

    fn push(&mut self, payload: &[u8]) {
        let need = self.bcnt - self.data.len();
        self.data.extend_from_slice(&payload[..payload.len().min(need)]);
    }

    fn is_complete(&self) -> bool {
        self.data.len() >= self.bcnt
    }

    fn finish(self) -> U2FHIDFrame {
        U2FHIDFrame {
            cid: self.cid,
            cmd: self.cmd,
            data: self.data,
        }
    }
}

/// Reads reports from `read_report` until a complete message addressed to
/// `cid` has been assembled.
///
/// Keep-alive frames and frames for other channels are discarded. A
/// CTAPHID ERROR frame fails the read with the device's error code.
pub(crate) fn read_message<F>(cid: u32, mut read_report: F) -> Result<U2FHIDFrame, Error>
where
    F: FnMut() -> Result<Vec<u8>, Error>,
{
    let mut asm = loop {
        let report = read_report()?;
        match HidReport::try_from(report.as_slice())? {
            HidReport::Init { cid: rcid, cmd, .. } if rcid != cid => {
                trace!("skipping frame for channel {rcid:08x} (cmd 0x{cmd:02x})");
            }
            HidReport::Init { cmd: U2FHID_KEEPALIVE, data, .. } => {
                trace!("keep-alive, status {:?}", data.first());
            }
            HidReport::Init { cmd: U2FHID_ERROR, data, .. } => {
                return Err(Error::Transport(format!(
                    "device reported CTAPHID error 0x{:02x}",
                    data.first().copied().unwrap_or(0)
                )));
            }
            HidReport::Init { cid, cmd, bcnt, data } => {
                break FrameAssembler::new(cid, cmd, bcnt, &data);
            }
            HidReport::Cont { seq, .. } => {
                trace!("skipping stray continuation frame (seq {seq})");
            }
        }
    };

    while !asm.is_complete() {
        let report = read_report()?;
        match HidReport::try_from(report.as_slice())? {
            HidReport::Cont { cid: rcid, data, .. } if rcid == asm.cid => asm.push(&data),
            HidReport::Init { cmd: U2FHID_KEEPALIVE, .. } => trace!("keep-alive mid-message"),
            other => trace!("skipping unexpected frame {other:?}"),
        }
    }

    Ok(asm.finish())
}
