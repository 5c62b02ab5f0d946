//! ISO/IEC 7816-4 APDUs, short form only.
//!
//! Extended APDUs are intentionally unsupported: every CTAP exchange in
//! this crate runs over short APDUs with command chaining, which all
//! FIDO applets accept regardless of what the card's ATR advertises.

use crate::error::Error;

/// Maximum command data length in a short APDU.
///
/// The short form allows 255 bytes, but 251 leaves room for the 4-byte
/// header, Lc, Le, and bytes some contactless readers append themselves.
pub const MAX_SHORT_APDU_DATA: usize = 251;

/// An ISO/IEC 7816-4 request APDU: `CLA INS P1 P2 [Lc DATA] [Le]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ISO7816RequestAPDU {
    /// Instruction class.
    pub cla: u8,
    /// Instruction code.
    pub ins: u8,
    /// Parameter 1.
    pub p1: u8,
    /// Parameter 2.
    pub p2: u8,
    /// Command data, at most [MAX_SHORT_APDU_DATA] bytes.
    pub data: Vec<u8>,
    /// Maximum expected response length, 0..=256. 0 omits the Le byte;
    /// 256 is encoded as Le = 0x00.
    pub ne: u16,
}

impl ISO7816RequestAPDU {
    /// Serializes the request into bytes to send to the card.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.data.len() > MAX_SHORT_APDU_DATA {
            return Err(Error::Transport(format!(
                "APDU data too long for short form ({} > {MAX_SHORT_APDU_DATA})",
                self.data.len()
            )));
        }
        if self.ne > 256 {
            return Err(Error::Transport(format!(
                "APDU Ne too long for short form ({} > 256)",
                self.ne
            )));
        }

        let lc_len = usize::from(!self.data.is_empty());
        let le_len = usize::from(self.ne > 0);
        let mut buf = Vec::with_capacity(4 + lc_len + self.data.len() + le_len);
        buf.push(self.cla);
        buf.push(self.ins);
        buf.push(self.p1);
        buf.push(self.p2);
        if !self.data.is_empty() {
            buf.push(self.data.len() as u8);
            buf.extend_from_slice(&self.data);
        }
        if self.ne > 0 {
            // 256 = 0x00, 1 = 0x01, 255 = 0xFF
            buf.push((self.ne & 0xff) as u8);
        }
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for ISO7816RequestAPDU {
    type Error = Error;

    /// Deserializes a short-form request APDU (cases 1 through 4).
    fn try_from(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < 4 {
            return Err(Error::Transport("request APDU shorter than header".to_string()));
        }
        let (data, ne) = match raw.len() {
            4 => (Vec::new(), 0),
            5 => (Vec::new(), decode_le(raw[4])),
            n => {
                let lc = raw[4] as usize;
                if 5 + lc == n {
                    (raw[5..].to_vec(), 0)
                } else if 5 + lc + 1 == n {
                    (raw[5..5 + lc].to_vec(), decode_le(raw[n - 1]))
                } else {
                    return Err(Error::Transport(format!(
                        "request APDU length {n} inconsistent with Lc {lc}"
                    )));
                }
            }
        };
        Ok(Self {
            cla: raw[0],
            ins: raw[1],
            p1: raw[2],
            p2: raw[3],
            data,
            ne,
        })
    }
}

fn decode_le(le: u8) -> u16 {
    if le == 0 {
        256
    } else {
        le.into()
    }
}

/// An ISO/IEC 7816-4 response APDU: `DATA SW1 SW2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ISO7816ResponseAPDU {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl TryFrom<&[u8]> for ISO7816ResponseAPDU {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < 2 {
            Err(Error::Transport("response APDU shorter than SW1/SW2".to_string()))
        } else {
            Ok(Self {
                data: raw[..raw.len() - 2].to_vec(),
                sw1: raw[raw.len() - 2],
                sw2: raw[raw.len() - 1],
            })
        }
    }
}

impl ISO7816ResponseAPDU {
    /// The status word as a single 16-bit value, e.g. `0x9000`.
    pub fn sw(&self) -> u16 {
        (u16::from(self.sw1) << 8) | u16::from(self.sw2)
    }

    /// True if the card responded with a simple "OK" (SW = 0x9000).
    pub fn is_ok(&self) -> bool {
        self.sw() == 0x9000
    }

    /// Non-zero if the card has further response bytes available
    /// (SW1 = 0x61); SW2 = 0x00 means 256 bytes.
    pub fn bytes_available(&self) -> u16 {
        if self.sw1 == 0x61 {
            decode_le(self.sw2)
        } else {
            0
        }
    }

    /// **CTAP proprietary**: true if the card expects an
    /// `NFCCTAP_GETRESPONSE` command to fetch the actual response
    /// (SW = 0x9100).
    pub fn ctap_needs_get_response(&self) -> bool {
        self.sw() == 0x9100
    }
}

/// SELECT by DF name (applet AID), ISO/IEC 7816-4 s7.1.1.
pub fn select_by_df_name(df: &[u8]) -> ISO7816RequestAPDU {
    ISO7816RequestAPDU {
        cla: 0x00,
        ins: 0xA4, // SELECT
        p1: 0x04,  // By DF name
        p2: 0x00,  // First or only occurrence
        data: df.to_vec(),
        ne: 256,
    }
}

/// GET RESPONSE, ISO/IEC 7816-4 s7.6.1.
pub fn get_response(ne: u16) -> ISO7816RequestAPDU {
    ISO7816RequestAPDU {
        cla: 0x00,
        ins: 0xC0, // GET RESPONSE
        p1: 0x00,
        p2: 0x00,
        data: vec![],
        ne,
    }
}
