//! Decoded CTAPHID response payloads.

use crate::error::Error;

/// Payload of a `U2FHID_INIT` response.
#[derive(Debug)]
pub struct InitResponse {
    /// Echo of the host's 8-byte nonce.
    pub nonce: Vec<u8>,
    /// Allocated channel identifier.
    pub cid: u32,
    /// U2F protocol version (2).
    pub protocol_version: u8,
    pub device_version_major: u8,
    pub device_version_minor: u8,
    pub device_version_build: u8,
    /// Capability flags (CAPABILITY_WINK, CAPABILITY_CBOR,
    /// CAPABILITY_NMSG).
    pub capabilities: u8,
}

impl TryFrom<&[u8]> for InitResponse {
    type Error = Error;

    fn try_from(d: &[u8]) -> Result<Self, Error> {
        if d.len() < 17 {
            return Err(Error::Transport(format!(
                "short INIT response ({} bytes)",
                d.len()
            )));
        }

        let (nonce, d) = d.split_at(8);
        let (cid, d) = d.split_at(4);
        let cid = u32::from_be_bytes([cid[0], cid[1], cid[2], cid[3]]);

        Ok(InitResponse {
            nonce: nonce.to_vec(),
            cid,
            protocol_version: d[0],
            device_version_major: d[1],
            device_version_minor: d[2],
            device_version_build: d[3],
            capabilities: d[4],
        })
    }
}
