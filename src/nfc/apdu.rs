//! CTAP over ISO/IEC 7816-4 short APDUs: applet selection, command
//! chaining and response drainage.
//!
//! This layer is shared by the PC/SC and raw-CCID engines; both only
//! need to provide [ApduTransmitter].

use crate::error::Error;
use crate::transport::iso7816::{
    get_response, select_by_df_name, ISO7816RequestAPDU, ISO7816ResponseAPDU,
};

/// The FIDO applet AID.
pub const APPLET_DF: [u8; 8] = [
    /* RID */ 0xA0, 0x00, 0x00, 0x06, 0x47, /* PIX */ 0x2F, 0x00, 0x01,
];

/// Maximum CTAP payload bytes per chained APDU.
pub const FRAG_MAX: usize = 251;

/// `NFCCTAP_MSG`, with the command-chaining CLA bit for all blocks but
/// the last.
const INS_NFCCTAP_MSG: u8 = 0x10;
const CLA_CHAINED: u8 = 0x90;
const CLA_FINAL: u8 = 0x80;

/// Something that can exchange one short APDU with a card.
pub(crate) trait ApduTransmitter {
    fn transmit(&mut self, req: &ISO7816RequestAPDU) -> Result<ISO7816ResponseAPDU, Error>;
}

/// Selects the FIDO applet; any SW other than 0x9000 is a failure.
pub(crate) fn select_applet<T: ApduTransmitter>(card: &mut T) -> Result<(), Error> {
    let resp = card.transmit(&select_by_df_name(&APPLET_DF))?;
    if !resp.is_ok() {
        return Err(Error::Transport(format!(
            "FIDO applet selection failed (SW 0x{:04x})",
            resp.sw()
        )));
    }
    Ok(())
}

/// Splits a CTAP message into chained short APDUs of at most [FRAG_MAX]
/// data bytes. Every block carries Le = 0x00.
pub(crate) fn to_short_apdus(ctap: &[u8]) -> Vec<ISO7816RequestAPDU> {
    let chunks = ctap.chunks(FRAG_MAX).rev();
    let mut o = Vec::with_capacity(chunks.len());
    let mut last = true;

    for chunk in chunks {
        o.insert(
            0,
            ISO7816RequestAPDU {
                cla: if last { CLA_FINAL } else { CLA_CHAINED },
                ins: INS_NFCCTAP_MSG,
                p1: 0x00,
                p2: 0x00,
                data: chunk.to_vec(),
                ne: 256,
            },
        );
        last = false;
    }

    o
}

/// `NFCCTAP_GETRESPONSE`, requested by the card with SW 0x9100.
fn get_next_response() -> ISO7816RequestAPDU {
    ISO7816RequestAPDU {
        cla: CLA_FINAL,
        ins: 0x11,
        p1: 0x00,
        p2: 0x00,
        data: vec![],
        ne: 256,
    }
}

/// Sends a CTAP message with command chaining and drains the full
/// response.
///
/// Intermediate blocks must come back as a bare SW 0x9000. After the
/// final block, data is accumulated across SW 0x9100 (CTAP GET NEXT
/// RESPONSE) and SW 0x61xx (ISO GET RESPONSE) continuations until
/// SW 0x9000; any other status word is a transport failure carrying the
/// SW.
pub(crate) fn send_ctap<T: ApduTransmitter>(card: &mut T, ctap: &[u8]) -> Result<Vec<u8>, Error> {
    let apdus = to_short_apdus(ctap);
    let blocks = apdus.len();
    let mut resp = ISO7816ResponseAPDU {
        data: vec![],
        sw1: 0,
        sw2: 0,
    };

    for (i, apdu) in apdus.iter().enumerate() {
        resp = card.transmit(apdu)?;
        if i + 1 < blocks && (!resp.is_ok() || !resp.data.is_empty()) {
            return Err(Error::Transport(format!(
                "command chaining failed at block {i} (SW 0x{:04x})",
                resp.sw()
            )));
        }
    }

    let mut out = Vec::new();
    loop {
        out.extend_from_slice(&resp.data);
        if resp.is_ok() {
            break;
        }
        if resp.ctap_needs_get_response() {
            resp = card.transmit(&get_next_response())?;
        } else if resp.bytes_available() > 0 {
            resp = card.transmit(&get_response(resp.bytes_available()))?;
        } else {
            return Err(Error::Transport(format!(
                "card returned SW 0x{:04x}",
                resp.sw()
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted card: each entry is the expected request bytes and the
    /// raw response to hand back.
    struct MockCard {
        script: Vec<(Vec<u8>, Vec<u8>)>,
        at: usize,
    }

    impl MockCard {
        fn new(script: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self { script, at: 0 }
        }

        fn finished(&self) -> bool {
            self.at == self.script.len()
        }
    }

    impl ApduTransmitter for MockCard {
        fn transmit(&mut self, req: &ISO7816RequestAPDU) -> Result<ISO7816ResponseAPDU, Error> {
            let (expected, response) = self
                .script
                .get(self.at)
                .unwrap_or_else(|| panic!("unexpected APDU #{}: {req:?}", self.at));
            self.at += 1;
            assert_eq!(expected, &req.to_bytes().expect("encode"), "APDU #{}", self.at - 1);
            ISO7816ResponseAPDU::try_from(response.as_slice())
        }
    }

    fn chained_apdu(cla: u8, data: &[u8]) -> Vec<u8> {
        let mut o = vec![cla, 0x10, 0x00, 0x00, data.len() as u8];
        o.extend_from_slice(data);
        o.push(0x00);
        o
    }

    #[test]
    fn block_boundaries() {
        assert_eq!(1, to_short_apdus(&[0u8; 1]).len());
        assert_eq!(1, to_short_apdus(&[0u8; 251]).len());

        let a = to_short_apdus(&[0u8; 252]);
        assert_eq!(2, a.len());
        assert_eq!(251, a[0].data.len());
        assert_eq!(1, a[1].data.len());
    }

    #[test]
    fn chaining_layout() {
        let a = to_short_apdus(&[0u8; 600]);
        assert_eq!(3, a.len());
        for (i, apdu) in a.iter().enumerate() {
            assert_eq!(if i + 1 < a.len() { 0x90 } else { 0x80 }, apdu.cla);
            assert_eq!(0x10, apdu.ins);
            assert_eq!(256, apdu.ne);
        }
    }

    #[test]
    fn select_applet_checks_sw() {
        let select = vec![
            0x00, 0xA4, 0x04, 0x00, 0x08, 0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01, 0x00,
        ];
        let mut ok = MockCard::new(vec![(select.clone(), vec![0x90, 0x00])]);
        select_applet(&mut ok).expect("select");

        let mut not_found = MockCard::new(vec![(select, vec![0x6A, 0x82])]);
        let e = select_applet(&mut not_found).expect_err("select should fail");
        assert!(matches!(e, Error::Transport(m) if m.contains("6a82")));
    }

    #[test]
    fn chained_send_with_get_next_response() {
        // 502-byte message: two full blocks; the card answers the final
        // block with data and SW 9100, asking for a GET NEXT RESPONSE.
        let msg: Vec<u8> = (0..502).map(|i| i as u8).collect();
        let mut part1 = vec![0x11, 0x22];
        part1.extend_from_slice(&[0x91, 0x00]);
        let mut part2 = vec![0x33, 0x44];
        part2.extend_from_slice(&[0x90, 0x00]);

        let mut card = MockCard::new(vec![
            (chained_apdu(0x90, &msg[..251]), vec![0x90, 0x00]),
            (chained_apdu(0x80, &msg[251..]), part1),
            (vec![0x80, 0x11, 0x00, 0x00, 0x00], part2),
        ]);
        let out = send_ctap(&mut card, &msg).expect("send");
        assert!(card.finished());
        assert_eq!(vec![0x11, 0x22, 0x33, 0x44], out);
    }

    #[test]
    fn iso_get_response_chain() {
        // Final block answers SW 6120: 32 more bytes via GET RESPONSE.
        let msg = [0x04];
        let mut part1 = vec![0x00, 0xA1];
        part1.extend_from_slice(&[0x61, 0x20]);
        let mut part2 = vec![0x01, 0xF5];
        part2.extend_from_slice(&[0x90, 0x00]);

        let mut card = MockCard::new(vec![
            (chained_apdu(0x80, &msg), part1),
            (vec![0x00, 0xC0, 0x00, 0x00, 0x20], part2),
        ]);
        let out = send_ctap(&mut card, &msg).expect("send");
        assert!(card.finished());
        assert_eq!(vec![0x00, 0xA1, 0x01, 0xF5], out);
    }

    #[test]
    fn intermediate_block_must_be_bare_ok() {
        let msg = [0u8; 300];
        let mut card = MockCard::new(vec![(
            chained_apdu(0x90, &msg[..251]),
            vec![0x69, 0x85],
        )]);
        let e = send_ctap(&mut card, &msg).expect_err("chaining should fail");
        assert!(matches!(e, Error::Transport(m) if m.contains("6985")));

        // Data on an intermediate block is also a chaining violation.
        let mut card = MockCard::new(vec![(
            chained_apdu(0x90, &msg[..251]),
            vec![0xAA, 0x90, 0x00],
        )]);
        send_ctap(&mut card, &msg).expect_err("chaining should fail");
    }

    #[test]
    fn unexpected_sw_is_an_error() {
        let msg = [0x04];
        let mut card = MockCard::new(vec![(chained_apdu(0x80, &msg), vec![0x6F, 0x00])]);
        let e = send_ctap(&mut card, &msg).expect_err("should fail");
        assert!(matches!(e, Error::Transport(m) if m.contains("6f00")));
    }
}
