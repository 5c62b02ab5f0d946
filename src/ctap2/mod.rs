//! CTAP 2.0 command layer.
//!
//! Builds `CMD || CBOR(parameters)` requests, hands them to a
//! [Token], and strips the leading status byte from the response. The
//! CBOR body is returned as raw bytes: decoding attestation and
//! assertion structures is the caller's job.

mod commands;

pub use commands::*;
use serde_cbor::Value;

use std::time::Duration;

use crate::error::{CtapError, Error};
use crate::transport::{CancelToken, Token, DEFAULT_TIMEOUT};

/// PIN protocol used by the convenience clientPin operations.
const PIN_PROTOCOL_V1: u8 = 1;

/// A CTAP 2.0 authenticator bound to an open transport handle.
#[derive(Debug)]
pub struct CtapAuthenticator<T: Token> {
    token: T,
    cancel: CancelToken,
    timeout: Duration,
}

impl<T: Token> CtapAuthenticator<T> {
    /// Takes ownership of a token and performs its transport handshake.
    pub fn new(mut token: T) -> Result<Self, Error> {
        token.init()?;
        Ok(Self {
            token,
            cancel: CancelToken::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// A handle for cancelling in-flight operations from another thread.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Overrides the per-I/O timeout used for subsequent operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn name(&self) -> &str {
        self.token.name()
    }

    /// Releases the underlying transport handle.
    pub fn close(mut self) {
        self.token.close();
    }

    /// `authenticatorGetInfo`. Returns the raw CBOR body.
    pub fn get_info(&mut self) -> Result<Vec<u8>, Error> {
        self.transmit(&GetInfoRequest {})
    }

    /// `authenticatorClientPIN` getRetries. Returns the raw CBOR body
    /// (map with key 3 = retry count).
    pub fn get_pin_retries(&mut self) -> Result<Vec<u8>, Error> {
        self.transmit(&ClientPinRequest {
            pin_protocol: PIN_PROTOCOL_V1,
            sub_command: ClientPinSubCommand::GetRetries,
            key_agreement: None,
            pin_hash_enc: None,
        })
    }

    /// `authenticatorClientPIN` getKeyAgreement. Returns the raw CBOR
    /// body (map with key 1 = authenticator COSE key).
    pub fn get_key_agreement(&mut self) -> Result<Vec<u8>, Error> {
        self.transmit(&ClientPinRequest {
            pin_protocol: PIN_PROTOCOL_V1,
            sub_command: ClientPinSubCommand::GetKeyAgreement,
            key_agreement: None,
            pin_hash_enc: None,
        })
    }

    /// `authenticatorClientPIN` getPinToken. `pin_hash_enc` is the
    /// encrypted SHA-256 of the PIN and `platform_key_agreement` the
    /// platform's ephemeral COSE key; both are produced by the caller's
    /// crypto layer.
    pub fn get_pin_token(
        &mut self,
        pin_hash_enc: Vec<u8>,
        platform_key_agreement: Value,
        pin_protocol: u8,
    ) -> Result<Vec<u8>, Error> {
        self.transmit(&ClientPinRequest {
            pin_protocol,
            sub_command: ClientPinSubCommand::GetPinToken,
            key_agreement: Some(platform_key_agreement),
            pin_hash_enc: Some(pin_hash_enc),
        })
    }

    /// `authenticatorMakeCredential`. Returns the raw CBOR attestation
    /// body.
    pub fn make_credential(&mut self, request: &MakeCredentialRequest) -> Result<Vec<u8>, Error> {
        self.transmit(request)
    }

    /// `authenticatorGetAssertion`. Returns the raw CBOR assertion body.
    pub fn get_assertion(&mut self, request: &GetAssertionRequest) -> Result<Vec<u8>, Error> {
        self.transmit(request)
    }

    /// `authenticatorGetNextAssertion`, after a getAssertion reported
    /// multiple credentials.
    pub fn get_next_assertion(&mut self) -> Result<Vec<u8>, Error> {
        self.transmit(&GetNextAssertionRequest {})
    }

    /// `authenticatorReset`. Destroys all credentials; most devices
    /// require user presence and a fresh power cycle.
    pub fn reset(&mut self) -> Result<Vec<u8>, Error> {
        self.transmit(&ResetRequest {})
    }

    fn transmit<C: CBORCommand>(&mut self, cmd: &C) -> Result<Vec<u8>, Error> {
        let req = cmd.cbor()?;
        trace!("sending {cmd:?}");
        let resp = self.token.transmit(&req, &self.cancel, self.timeout)?;

        let (&status, body) = resp
            .split_first()
            .ok_or_else(|| Error::Transport("empty CTAP response".to_string()))?;
        if status != 0 {
            return Err(Error::Ctap {
                error: CtapError::from(status),
                device: self.token.name().to_string(),
            });
        }
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    /// A token that records requests and plays back scripted responses.
    #[derive(Debug)]
    struct MockToken {
        requests: Vec<Vec<u8>>,
        responses: Vec<Vec<u8>>,
        initialized: bool,
    }

    impl MockToken {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                requests: Vec::new(),
                responses,
                initialized: false,
            }
        }
    }

    impl Token for MockToken {
        fn transmit(
            &mut self,
            ctap: &[u8],
            _cancel: &CancelToken,
            _timeout: Duration,
        ) -> Result<Vec<u8>, Error> {
            self.requests.push(ctap.to_vec());
            Ok(self.responses.remove(0))
        }

        fn init(&mut self) -> Result<(), Error> {
            self.initialized = true;
            Ok(())
        }

        fn close(&mut self) {}

        fn name(&self) -> &str {
            "Mock Key"
        }

        fn path(&self) -> &str {
            "mock"
        }

        fn transport(&self) -> TransportKind {
            TransportKind::Usb
        }
    }

    #[test]
    fn get_info_strips_status_byte() {
        let _ = tracing_subscriber::fmt().try_init();

        let mut auth =
            CtapAuthenticator::new(MockToken::new(vec![vec![0x00, 0xa1, 0x01, 0x80]])).expect("new");
        let body = auth.get_info().expect("get_info");
        assert_eq!(vec![0xa1, 0x01, 0x80], body);
        assert!(auth.token.initialized);
        assert_eq!(vec![vec![0x04]], auth.token.requests);
    }

    #[test]
    fn nonzero_status_is_a_ctap_error() {
        let mut auth = CtapAuthenticator::new(MockToken::new(vec![vec![0x36]])).expect("new");
        let e = auth.get_pin_retries().expect_err("must fail");
        assert_eq!(
            Error::Ctap {
                error: CtapError::PinRequired,
                device: "Mock Key".to_string(),
            },
            e
        );
    }

    #[test]
    fn empty_response_is_a_transport_error() {
        let mut auth = CtapAuthenticator::new(MockToken::new(vec![vec![]])).expect("new");
        let e = auth.get_info().expect_err("must fail");
        assert!(matches!(e, Error::Transport(m) if m.contains("empty")));
    }

    #[test]
    fn reset_has_no_payload() {
        let mut auth = CtapAuthenticator::new(MockToken::new(vec![vec![0x00]])).expect("new");
        assert!(auth.reset().expect("reset").is_empty());
        assert_eq!(vec![vec![0x07]], auth.token.requests);
    }

    #[test]
    fn pin_token_request_carries_key_agreement() {
        let mut auth = CtapAuthenticator::new(MockToken::new(vec![vec![0x00, 0xa1, 0x02, 0x40]]))
            .expect("new");
        auth.get_pin_token(vec![0u8; 16], Value::Map(Default::default()), 1)
            .expect("get_pin_token");
        let req = &auth.token.requests[0];
        assert_eq!(0x06, req[0]);
        assert_eq!(0xa4, req[1]); // {1, 2, 3, 6}
    }
}
