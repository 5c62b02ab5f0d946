//! CTAP 2.0 command encoding.
//!
//! Parameters with WebAuthn-level structure (relying party, user,
//! credential descriptors, extensions, options) are accepted as opaque
//! [serde_cbor::Value]s: their semantics belong to the caller, and this
//! layer only assembles the integer-keyed parameter map.

use std::collections::BTreeMap;

use serde_cbor::Value;

use crate::error::Error;

/// Common trait for all CTAP commands.
pub trait CBORCommand: std::fmt::Debug {
    /// CTAP command byte.
    const CMD: u8;

    /// If true (default), the command carries a CBOR-encoded parameter
    /// map. If false, the request is the bare command byte.
    const HAS_PAYLOAD: bool = true;

    /// The integer-keyed parameter map.
    fn map(&self) -> BTreeMap<Value, Value> {
        BTreeMap::new()
    }

    /// Converts the command into its binary form:
    /// `CMD || CBOR(parameters)`.
    fn cbor(&self) -> Result<Vec<u8>, Error> {
        if !Self::HAS_PAYLOAD {
            return Ok(vec![Self::CMD]);
        }
        let b = serde_cbor::to_vec(&Value::Map(self.map()))?;
        let mut x = Vec::with_capacity(b.len() + 1);
        x.push(Self::CMD);
        x.extend_from_slice(&b);
        Ok(x)
    }
}

fn key(k: i128) -> Value {
    Value::Integer(k)
}

fn insert_opt(map: &mut BTreeMap<Value, Value>, k: i128, v: Option<Value>) {
    if let Some(v) = v {
        map.insert(key(k), v);
    }
}

/// `authenticatorGetInfo` (0x04).
#[derive(Debug)]
pub struct GetInfoRequest {}

impl CBORCommand for GetInfoRequest {
    const CMD: u8 = 0x04;
    const HAS_PAYLOAD: bool = false;
}

/// `authenticatorReset` (0x07).
#[derive(Debug)]
pub struct ResetRequest {}

impl CBORCommand for ResetRequest {
    const CMD: u8 = 0x07;
    const HAS_PAYLOAD: bool = false;
}

/// `authenticatorGetNextAssertion` (0x08).
#[derive(Debug)]
pub struct GetNextAssertionRequest {}

impl CBORCommand for GetNextAssertionRequest {
    const CMD: u8 = 0x08;
    const HAS_PAYLOAD: bool = false;
}

/// `authenticatorMakeCredential` (0x01).
#[derive(Debug)]
pub struct MakeCredentialRequest {
    pub client_data_hash: Vec<u8>,
    pub rp: Value,
    pub user: Value,
    pub pub_key_cred_params: Value,
    pub exclude_list: Option<Value>,
    pub extensions: Option<Value>,
    pub options: Option<Value>,
    pub pin_auth: Option<Vec<u8>>,
    pub pin_protocol: Option<u8>,
}

impl CBORCommand for MakeCredentialRequest {
    const CMD: u8 = 0x01;

    fn map(&self) -> BTreeMap<Value, Value> {
        let mut m = BTreeMap::new();
        m.insert(key(1), Value::Bytes(self.client_data_hash.clone()));
        m.insert(key(2), self.rp.clone());
        m.insert(key(3), self.user.clone());
        m.insert(key(4), self.pub_key_cred_params.clone());
        insert_opt(&mut m, 5, self.exclude_list.clone());
        insert_opt(&mut m, 6, self.extensions.clone());
        insert_opt(&mut m, 7, self.options.clone());
        insert_opt(&mut m, 8, self.pin_auth.clone().map(Value::Bytes));
        insert_opt(&mut m, 9, self.pin_protocol.map(|p| Value::Integer(p.into())));
        m
    }
}

/// `authenticatorGetAssertion` (0x02).
#[derive(Debug)]
pub struct GetAssertionRequest {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    pub allow_list: Option<Value>,
    pub extensions: Option<Value>,
    pub options: Option<Value>,
    pub pin_auth: Option<Vec<u8>>,
    pub pin_protocol: Option<u8>,
}

impl CBORCommand for GetAssertionRequest {
    const CMD: u8 = 0x02;

    fn map(&self) -> BTreeMap<Value, Value> {
        let mut m = BTreeMap::new();
        m.insert(key(1), Value::Text(self.rp_id.clone()));
        m.insert(key(2), Value::Bytes(self.client_data_hash.clone()));
        insert_opt(&mut m, 3, self.allow_list.clone());
        insert_opt(&mut m, 4, self.extensions.clone());
        insert_opt(&mut m, 5, self.options.clone());
        insert_opt(&mut m, 6, self.pin_auth.clone().map(Value::Bytes));
        insert_opt(&mut m, 7, self.pin_protocol.map(|p| Value::Integer(p.into())));
        m
    }
}

/// `authenticatorClientPIN` (0x06) subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPinSubCommand {
    GetRetries = 0x01,
    GetKeyAgreement = 0x02,
    GetPinToken = 0x05,
}

/// `authenticatorClientPIN` (0x06).
#[derive(Debug)]
pub struct ClientPinRequest {
    pub pin_protocol: u8,
    pub sub_command: ClientPinSubCommand,
    /// The platform's ephemeral COSE key, for `GetPinToken`.
    pub key_agreement: Option<Value>,
    /// Encrypted SHA-256 of the PIN, for `GetPinToken`.
    pub pin_hash_enc: Option<Vec<u8>>,
}

impl CBORCommand for ClientPinRequest {
    const CMD: u8 = 0x06;

    fn map(&self) -> BTreeMap<Value, Value> {
        let mut m = BTreeMap::new();
        m.insert(key(1), Value::Integer(self.pin_protocol.into()));
        m.insert(key(2), Value::Integer(self.sub_command as i128));
        insert_opt(&mut m, 3, self.key_agreement.clone());
        insert_opt(&mut m, 6, self.pin_hash_enc.clone().map(Value::Bytes));
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloadless_commands_are_one_byte() {
        assert_eq!(vec![0x04], GetInfoRequest {}.cbor().expect("cbor"));
        assert_eq!(vec![0x07], ResetRequest {}.cbor().expect("cbor"));
        assert_eq!(vec![0x08], GetNextAssertionRequest {}.cbor().expect("cbor"));
    }

    #[test]
    fn client_pin_get_retries_encoding() {
        let req = ClientPinRequest {
            pin_protocol: 1,
            sub_command: ClientPinSubCommand::GetRetries,
            key_agreement: None,
            pin_hash_enc: None,
        };
        // 0x06, then {1: 1, 2: 1}
        assert_eq!(vec![0x06, 0xa2, 0x01, 0x01, 0x02, 0x01], req.cbor().expect("cbor"));
    }

    #[test]
    fn client_pin_get_pin_token_keys() {
        let req = ClientPinRequest {
            pin_protocol: 1,
            sub_command: ClientPinSubCommand::GetPinToken,
            key_agreement: Some(Value::Map(BTreeMap::new())),
            pin_hash_enc: Some(vec![0u8; 16]),
        };
        let m = req.map();
        assert_eq!(4, m.len());
        assert_eq!(Some(&Value::Integer(5)), m.get(&Value::Integer(2)));
        assert!(m.contains_key(&Value::Integer(3)));
        assert!(m.contains_key(&Value::Integer(6)));
    }

    #[test]
    fn make_credential_map_keys() {
        let req = MakeCredentialRequest {
            client_data_hash: vec![0u8; 32],
            rp: Value::Map(BTreeMap::new()),
            user: Value::Map(BTreeMap::new()),
            pub_key_cred_params: Value::Array(vec![]),
            exclude_list: None,
            extensions: None,
            options: None,
            pin_auth: Some(vec![0u8; 16]),
            pin_protocol: Some(1),
        };
        let m = req.map();
        assert_eq!(6, m.len());
        for k in [1, 2, 3, 4, 8, 9] {
            assert!(m.contains_key(&Value::Integer(k)), "missing key {k}");
        }
        let b = req.cbor().expect("cbor");
        assert_eq!(0x01, b[0]);
        assert_eq!(0xa6, b[1]); // map of 6 entries
    }

    #[test]
    fn get_assertion_map_keys() {
        let req = GetAssertionRequest {
            rp_id: "example.com".to_string(),
            client_data_hash: vec![0u8; 32],
            allow_list: Some(Value::Array(vec![])),
            extensions: None,
            options: None,
            pin_auth: None,
            pin_protocol: None,
        };
        let m = req.map();
        assert_eq!(3, m.len());
        assert_eq!(
            Some(&Value::Text("example.com".to_string())),
            m.get(&Value::Integer(1))
        );
        assert!(m.contains_key(&Value::Integer(2)));
        assert!(m.contains_key(&Value::Integer(3)));
        assert_eq!(0x02, req.cbor().expect("cbor")[0]);
    }
}
