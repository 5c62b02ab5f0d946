//! CCID bulk message framing.
//!
//! Every message is a 10-byte header — `bMessageType dwLength(LE) bSlot
//! bSeq` plus three type-specific bytes — followed by `dwLength` data
//! bytes. Bulk transfers arrive in 64-byte chunks.

use crate::error::Error;

pub(crate) const CCID_HEADER_SIZE: usize = 10;
/// Bulk endpoint chunk size.
pub(crate) const CCID_CHUNK_SIZE: usize = 64;
/// Upper bound on dwLength accepted from a reader.
pub(crate) const MAX_CCID_DATA: usize = 65536;

/// Mismatched responses tolerated while waiting for a given (type, bSeq).
const MAX_MESSAGE_READS: usize = 12;
/// Time-extension responses tolerated for a single command.
const MAX_TIME_EXTENSIONS: usize = 30;

// PC_to_RDR command types.
pub(crate) const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;
pub(crate) const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;
pub(crate) const PC_TO_RDR_GET_SLOT_STATUS: u8 = 0x65;
pub(crate) const PC_TO_RDR_ESCAPE: u8 = 0x6B;
pub(crate) const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;

// RDR_to_PC response types.
pub(crate) const RDR_TO_PC_DATA_BLOCK: u8 = 0x80;
pub(crate) const RDR_TO_PC_SLOT_STATUS: u8 = 0x81;
pub(crate) const RDR_TO_PC_ESCAPE: u8 = 0x83;

// bStatus bits 6-7: command status.
pub(crate) const CMD_STATUS_OK: u8 = 0;
pub(crate) const CMD_STATUS_FAILED: u8 = 1;
pub(crate) const CMD_STATUS_TIME_EXTENSION: u8 = 2;

// bStatus bits 0-1: ICC status.
pub(crate) const ICC_STATUS_ACTIVE: u8 = 0;
pub(crate) const ICC_STATUS_INACTIVE: u8 = 1;
pub(crate) const ICC_STATUS_ABSENT: u8 = 2;

/// A PC_to_RDR command message.
pub(crate) struct CcidCommand<'a> {
    pub msg_type: u8,
    pub slot: u8,
    pub seq: u8,
    /// The three message-specific header bytes (e.g. bBWI and
    /// wLevelParameter for XfrBlock).
    pub params: [u8; 3],
    pub data: &'a [u8],
}

impl CcidCommand<'_> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut o = Vec::with_capacity(CCID_HEADER_SIZE + self.data.len());
        o.push(self.msg_type);
        o.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        o.push(self.slot);
        o.push(self.seq);
        o.extend_from_slice(&self.params);
        o.extend_from_slice(self.data);
        o
    }
}

/// A RDR_to_PC response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CcidResponse {
    pub msg_type: u8,
    pub slot: u8,
    pub seq: u8,
    pub status: u8,
    pub error: u8,
    pub data: Vec<u8>,
}

impl CcidResponse {
    /// bStatus bits 0-1.
    pub fn icc_status(&self) -> u8 {
        self.status & 0x03
    }

    /// bStatus bits 6-7.
    pub fn cmd_status(&self) -> u8 {
        (self.status >> 6) & 0x03
    }
}

/// Reads one CCID message: a first 64-byte chunk containing the header,
/// then as many chunks as `dwLength` requires.
///
/// `read_chunk` fills the buffer from the bulk IN endpoint and returns
/// the transfer length.
pub(crate) fn read_message<F>(read_chunk: &mut F) -> Result<CcidResponse, Error>
where
    F: FnMut(&mut [u8]) -> Result<usize, Error>,
{
    let mut chunk = [0u8; CCID_CHUNK_SIZE];
    let n = read_chunk(&mut chunk)?;
    if n < CCID_HEADER_SIZE {
        return Err(Error::Transport(format!("short CCID header ({n} bytes)")));
    }

    let length = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]) as usize;
    if length > MAX_CCID_DATA {
        return Err(Error::Transport(format!("invalid CCID dwLength {length}")));
    }

    let mut resp = CcidResponse {
        msg_type: chunk[0],
        slot: chunk[5],
        seq: chunk[6],
        status: chunk[7],
        error: chunk[8],
        data: Vec::with_capacity(length),
    };
    resp.data
        .extend_from_slice(&chunk[CCID_HEADER_SIZE..(CCID_HEADER_SIZE + length).min(n)]);

    while resp.data.len() < length {
        let n = read_chunk(&mut chunk)?;
        if n == 0 {
            return Err(Error::Transport("truncated CCID message".to_string()));
        }
        let need = length - resp.data.len();
        resp.data.extend_from_slice(&chunk[..n.min(need)]);
    }

    Ok(resp)
}

/// The response type a command should be answered with.
pub(crate) fn expected_response_type(command_type: u8) -> u8 {
    match command_type {
        PC_TO_RDR_GET_SLOT_STATUS | PC_TO_RDR_ICC_POWER_OFF => RDR_TO_PC_SLOT_STATUS,
        PC_TO_RDR_ESCAPE => RDR_TO_PC_ESCAPE,
        _ => RDR_TO_PC_DATA_BLOCK,
    }
}

/// Reads messages until one matches the expected (type, bSeq) pair,
/// discarding up to [MAX_MESSAGE_READS] strays.
fn read_matching<F>(read_chunk: &mut F, expected_type: u8, seq: u8) -> Result<CcidResponse, Error>
where
    F: FnMut(&mut [u8]) -> Result<usize, Error>,
{
    for _ in 0..MAX_MESSAGE_READS {
        let resp = read_message(read_chunk)?;
        if resp.msg_type == expected_type && resp.seq == seq {
            return Ok(resp);
        }
        trace!(
            "discarding CCID message type 0x{:02x} seq {} (want 0x{expected_type:02x} seq {seq})",
            resp.msg_type,
            resp.seq
        );
    }
    Err(Error::Transport(format!(
        "no matching CCID response after {MAX_MESSAGE_READS} messages"
    )))
}

/// Awaits the real response to a command, reading through time-extension
/// responses (cmdStatus = 2), at most [MAX_TIME_EXTENSIONS] of them.
pub(crate) fn await_response<F>(
    read_chunk: &mut F,
    expected_type: u8,
    seq: u8,
) -> Result<CcidResponse, Error>
where
    F: FnMut(&mut [u8]) -> Result<usize, Error>,
{
    let mut resp = read_matching(read_chunk, expected_type, seq)?;
    let mut waits = 0;
    while resp.cmd_status() == CMD_STATUS_TIME_EXTENSION {
        waits += 1;
        if waits > MAX_TIME_EXTENSIONS {
            return Err(Error::Transport(format!(
                "reader requested more than {MAX_TIME_EXTENSIONS} time extensions"
            )));
        }
        trace!("time extension {waits}, waiting for the reader");
        resp = read_matching(read_chunk, expected_type, seq)?;
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Chunk source backed by a list of scripted bulk transfers.
    fn chunks(transfers: Vec<Vec<u8>>) -> impl FnMut(&mut [u8]) -> Result<usize, Error> {
        let mut iter = transfers.into_iter();
        move |buf: &mut [u8]| {
            let t = iter
                .next()
                .ok_or_else(|| Error::Transport("out of transfers".to_string()))?;
            buf[..t.len()].copy_from_slice(&t);
            Ok(t.len())
        }
    }

    fn data_block(seq: u8, status: u8, data: &[u8]) -> Vec<Vec<u8>> {
        let mut msg = vec![RDR_TO_PC_DATA_BLOCK];
        msg.extend_from_slice(&(data.len() as u32).to_le_bytes());
        msg.push(0); // slot
        msg.push(seq);
        msg.push(status);
        msg.push(0); // error
        msg.push(0); // chain parameter
        msg.extend_from_slice(data);
        msg.chunks(CCID_CHUNK_SIZE).map(|c| c.to_vec()).collect()
    }

    #[test]
    fn command_layout() {
        let cmd = CcidCommand {
            msg_type: PC_TO_RDR_XFR_BLOCK,
            slot: 0,
            seq: 7,
            params: [0x0A, 0x00, 0x00],
            data: &[0x00, 0xA4, 0x04, 0x00],
        };
        assert_eq!(
            vec![0x6F, 0x04, 0x00, 0x00, 0x00, 0x00, 0x07, 0x0A, 0x00, 0x00, 0x00, 0xA4, 0x04, 0x00],
            cmd.to_bytes()
        );
    }

    #[test]
    fn single_chunk_response() {
        let mut src = chunks(data_block(3, 0x00, &[0x90, 0x00]));
        let r = read_message(&mut src).expect("read");
        assert_eq!(RDR_TO_PC_DATA_BLOCK, r.msg_type);
        assert_eq!(3, r.seq);
        assert_eq!(CMD_STATUS_OK, r.cmd_status());
        assert_eq!(vec![0x90, 0x00], r.data);
    }

    #[test]
    fn multi_chunk_response() {
        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let transfers = data_block(5, 0x00, &payload);
        assert!(transfers.len() > 1);
        let mut src = chunks(transfers);
        let r = read_message(&mut src).expect("read");
        assert_eq!(payload, r.data);
    }

    #[test]
    fn header_validation() {
        let mut src = chunks(vec![vec![0x80, 0x00, 0x00]]);
        assert!(read_message(&mut src).is_err());

        // dwLength over 65536 is rejected.
        let mut bad = vec![RDR_TO_PC_DATA_BLOCK];
        bad.extend_from_slice(&(65537_u32).to_le_bytes());
        bad.extend_from_slice(&[0, 0, 0, 0, 0]);
        let mut src = chunks(vec![bad]);
        assert!(matches!(
            read_message(&mut src),
            Err(Error::Transport(m)) if m.contains("dwLength")
        ));
    }

    #[test]
    fn status_bits() {
        let r = CcidResponse {
            msg_type: RDR_TO_PC_SLOT_STATUS,
            slot: 0,
            seq: 0,
            status: 0x41, // command failed, ICC inactive
            error: 0xFE,
            data: vec![],
        };
        assert_eq!(CMD_STATUS_FAILED, r.cmd_status());
        assert_eq!(ICC_STATUS_INACTIVE, r.icc_status());

        let r = CcidResponse { status: 0x00, ..r };
        assert_eq!(CMD_STATUS_OK, r.cmd_status());
        assert_eq!(ICC_STATUS_ACTIVE, r.icc_status());
    }

    #[test]
    fn mismatched_messages_are_discarded() {
        let mut transfers = Vec::new();
        // A stale response with the wrong bSeq, then an interrupt-style
        // wrong type, then the one we want.
        transfers.extend(data_block(1, 0x00, &[0xAA]));
        transfers.push(vec![RDR_TO_PC_SLOT_STATUS, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
        transfers.extend(data_block(2, 0x00, &[0xBB]));

        let mut src = chunks(transfers);
        let r = await_response(&mut src, RDR_TO_PC_DATA_BLOCK, 2).expect("match");
        assert_eq!(vec![0xBB], r.data);
    }

    #[test]
    fn matching_gives_up_after_twelve_messages() {
        let mut transfers = Vec::new();
        for _ in 0..13 {
            transfers.extend(data_block(1, 0x00, &[]));
        }
        let mut src = chunks(transfers);
        let e = await_response(&mut src, RDR_TO_PC_DATA_BLOCK, 2).expect_err("must give up");
        assert!(matches!(e, Error::Transport(m) if m.contains("no matching")));
    }

    #[test]
    fn time_extensions_are_swallowed() {
        let mut transfers = Vec::new();
        for _ in 0..3 {
            transfers.extend(data_block(4, 0x80, &[])); // cmdStatus = 2
        }
        transfers.extend(data_block(4, 0x00, &[0x00, 0xA1]));

        let mut src = chunks(transfers);
        let r = await_response(&mut src, RDR_TO_PC_DATA_BLOCK, 4).expect("await");
        assert_eq!(CMD_STATUS_OK, r.cmd_status());
        assert_eq!(vec![0x00, 0xA1], r.data);
    }

    #[test]
    fn time_extension_cap() {
        let mut transfers = Vec::new();
        for _ in 0..31 {
            transfers.extend(data_block(4, 0x80, &[]));
        }
        let mut src = chunks(transfers);
        let e = await_response(&mut src, RDR_TO_PC_DATA_BLOCK, 4).expect_err("must cap");
        assert!(matches!(e, Error::Transport(m) if m.contains("time extensions")));
    }
}
