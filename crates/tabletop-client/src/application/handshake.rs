//! Client side of the admission handshake.
//!
//! ```text
//! client                          server
//!   │── Request ───────────────────▶│
//!   │◀────────────── Challenge ─────│  only for key logins
//!   │── ChallengeResponse ─────────▶│
//!   │◀─────────────── Response ─────│
//! ```
//!
//! The response is returned as received; deciding what a refusal means is
//! up to the caller.

use std::io::{Read, Write};

use tabletop_core::cipher::asymmetric::public_key_fingerprint;
use tabletop_core::cipher::KeyPair;
use tabletop_core::protocol::{HandshakeMessage, HandshakeRequest, HandshakeResponse};
use tabletop_core::{decode_message, encode_message, read_frame, write_frame, Role};
use tracing::debug;

use crate::error::ClientError;

/// Builds a request that logs in by key possession instead of password.
///
/// # Errors
///
/// Returns [`ClientError::Cipher`] if the public key cannot be encoded.
pub fn key_request(
    name: &str,
    role: Role,
    version: &str,
    key_pair: &KeyPair,
) -> Result<HandshakeRequest, ClientError> {
    let fingerprint = public_key_fingerprint(&key_pair.public_key_text()?)?;
    Ok(HandshakeRequest {
        public_key_fingerprint: Some(fingerprint),
        ..HandshakeRequest::new(name, "", role, version)
    })
}

/// Sends `request` and blocks until the server's verdict arrives.
///
/// A challenge is answered with a signature from `key_pair`.
///
/// # Errors
///
/// - [`ClientError::Io`] if the stream fails or closes, including a read
///   timeout configured on it.
/// - [`ClientError::NoKeyPair`] if challenged without a key pair.
/// - [`ClientError::UnexpectedMessage`] if the server sends something that
///   does not belong in a handshake.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    request: &HandshakeRequest,
    key_pair: Option<&KeyPair>,
) -> Result<HandshakeResponse, ClientError> {
    send(stream, &HandshakeMessage::Request(request.clone()))?;

    loop {
        let payload = read_frame(stream)?;
        match decode_message::<HandshakeMessage>(&payload)? {
            HandshakeMessage::Response(response) => return Ok(response),
            HandshakeMessage::Challenge { nonce } => {
                let pair = key_pair.ok_or(ClientError::NoKeyPair)?;
                debug!("answering key challenge of {} bytes", nonce.len());
                let signature = pair.sign(&nonce);
                send(stream, &HandshakeMessage::ChallengeResponse { signature })?;
            }
            other => return Err(ClientError::UnexpectedMessage(format!("{other:?}"))),
        }
    }
}

fn send<W: Write>(stream: &mut W, message: &HandshakeMessage) -> Result<(), ClientError> {
    let payload = encode_message(message)?;
    write_frame(stream, &payload)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use tabletop_core::cipher::asymmetric::verify_signature;
    use tabletop_core::protocol::HandshakeErrorKind;
    use tabletop_core::ServerPolicy;

    /// Plays back scripted server frames and records what the client writes.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn replying(messages: &[HandshakeMessage]) -> Self {
            let mut input = Vec::new();
            for message in messages {
                write_frame(&mut input, &encode_message(message).unwrap()).unwrap();
            }
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }

        fn written(&self) -> Vec<HandshakeMessage> {
            let mut reader = Cursor::new(self.output.clone());
            let mut messages = Vec::new();
            while let Ok(frame) = read_frame(&mut reader) {
                messages.push(decode_message(&frame).unwrap());
            }
            messages
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn alice() -> HandshakeRequest {
        HandshakeRequest::new("Alice", "correct", Role::Player, "1.0")
    }

    #[test]
    fn test_request_is_sent_and_ok_response_returned() {
        // Arrange
        let ok = HandshakeResponse::ok(ServerPolicy::default());
        let mut stream = Scripted::replying(&[HandshakeMessage::Response(ok.clone())]);

        // Act
        let response = client_handshake(&mut stream, &alice(), None).unwrap();

        // Assert
        assert_eq!(response, ok);
        assert_eq!(stream.written(), vec![HandshakeMessage::Request(alice())]);
    }

    #[test]
    fn test_refusal_is_returned_unmodified() {
        let refusal = HandshakeResponse::error(HandshakeErrorKind::WrongVersion);
        let mut stream = Scripted::replying(&[HandshakeMessage::Response(refusal.clone())]);

        let response = client_handshake(&mut stream, &alice(), None).unwrap();

        assert_eq!(response, refusal);
        assert!(!response.is_ok());
    }

    #[test]
    fn test_challenge_is_signed_with_key_pair() {
        // Arrange
        let pair = KeyPair::generate();
        let nonce = vec![7u8; 32];
        let mut stream = Scripted::replying(&[
            HandshakeMessage::Challenge {
                nonce: nonce.clone(),
            },
            HandshakeMessage::Response(HandshakeResponse::ok(ServerPolicy::default())),
        ]);
        let request = key_request("Alice", Role::Player, "1.0", &pair).unwrap();

        // Act
        let response = client_handshake(&mut stream, &request, Some(&pair)).unwrap();

        // Assert
        assert!(response.is_ok());
        let written = stream.written();
        assert_eq!(written.len(), 2);
        match &written[1] {
            HandshakeMessage::ChallengeResponse { signature } => {
                assert!(verify_signature(&pair.verifying_key(), &nonce, signature));
            }
            other => panic!("expected a challenge response, got {other:?}"),
        }
    }

    #[test]
    fn test_challenge_without_key_pair_fails() {
        let mut stream = Scripted::replying(&[HandshakeMessage::Challenge { nonce: vec![1; 32] }]);

        let result = client_handshake(&mut stream, &alice(), None);

        assert!(matches!(result, Err(ClientError::NoKeyPair)));
    }

    #[test]
    fn test_closed_stream_is_io_error() {
        let mut stream = Scripted::replying(&[]);

        let result = client_handshake(&mut stream, &alice(), None);

        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[test]
    fn test_key_request_carries_fingerprint_and_no_password() {
        let pair = KeyPair::generate();

        let request = key_request("Alice", Role::Gm, "1.0", &pair).unwrap();

        assert!(request.password.is_empty());
        assert_eq!(
            request.public_key_fingerprint,
            Some(public_key_fingerprint(&pair.public_key_text().unwrap()).unwrap())
        );
    }
}
