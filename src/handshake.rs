//! RFB 3.8 connection-setup codec.
//!
//! Only the part of the protocol that runs before `ClientInit` lives here:
//! the version exchange, security-type negotiation and VNC Authentication
//! (RFC 6143 §7.1–7.2). Everything is a pure function over byte slices; the
//! session drives the sockets and hands complete messages to these helpers.
//!
//! VNC Authentication uses the password as a DES key with the bits of every
//! key byte reversed, encrypting the 16-byte challenge as two ECB blocks.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;
use subtle::ConstantTimeEq;

use crate::errors::HandshakeError;

/// The only protocol version spoken on either side of the proxy.
pub const PROTOCOL_VERSION: &[u8; VERSION_LEN] = b"RFB 003.008\n";
pub const VERSION_LEN: usize = 12;
pub const CHALLENGE_LEN: usize = 16;
pub const AUTH_RESULT_LEN: usize = 4;
pub const REASON_HEADER_LEN: usize = 4;
/// Upper bound on refusal/failure reason strings accepted from a peer.
pub const MAX_REASON_LEN: usize = 4096;
pub const AUTH_FAILURE_REASON: &str = "Authentication failure";

const DES_KEY_LEN: usize = 8;
const DES_BLOCK_LEN: usize = 8;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Security type as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    VncAuth,
    Other(u8),
}

impl AuthType {
    pub fn as_u8(self) -> u8 {
        match self {
            AuthType::None => 1,
            AuthType::VncAuth => 2,
            AuthType::Other(value) => value,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, HandshakeError> {
        match value {
            0 => Err(HandshakeError::InvalidAuthType(0)),
            1 => Ok(AuthType::None),
            2 => Ok(AuthType::VncAuth),
            other => Ok(AuthType::Other(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure,
}

/// Accept the peer's version line, which must be exactly `RFB 003.008\n`.
pub fn negotiate_version(line: &[u8]) -> Result<(), HandshakeError> {
    if line.len() < VERSION_LEN {
        return Err(HandshakeError::Truncated {
            what: "version line",
            expected: VERSION_LEN,
            actual: line.len(),
        });
    }
    if line != PROTOCOL_VERSION {
        let shown = String::from_utf8_lossy(line).trim_end().to_string();
        return Err(HandshakeError::VersionMismatch(shown));
    }
    Ok(())
}

/// Offer a single security type: `[count = 1][type]`.
pub fn request_auth_type(auth: AuthType) -> [u8; 2] {
    [1, auth.as_u8()]
}

/// The client's pick from an offer.
pub fn encode_auth_choice(auth: AuthType) -> [u8; 1] {
    [auth.as_u8()]
}

/// Decode the type a client picked. A leading zero is a refusal followed by
/// a length-prefixed reason.
pub fn parse_auth_type_choice(bytes: &[u8]) -> Result<AuthType, HandshakeError> {
    match bytes.first() {
        None => Err(HandshakeError::Truncated {
            what: "authentication type",
            expected: 1,
            actual: 0,
        }),
        Some(0) => Err(HandshakeError::Refused(parse_reason(&bytes[1..])?)),
        Some(&value) => AuthType::from_u8(value),
    }
}

/// Decode a server's security-type offer: `[count][types...]`, or a refusal
/// (`count = 0` followed by a reason).
pub fn parse_auth_type_offer(bytes: &[u8]) -> Result<Vec<AuthType>, HandshakeError> {
    let Some((&count, rest)) = bytes.split_first() else {
        return Err(HandshakeError::Truncated {
            what: "security type count",
            expected: 1,
            actual: 0,
        });
    };
    if count == 0 {
        return Err(HandshakeError::Refused(parse_reason(rest)?));
    }
    let count = usize::from(count);
    if rest.len() < count {
        return Err(HandshakeError::Truncated {
            what: "security types",
            expected: count,
            actual: rest.len(),
        });
    }
    rest[..count].iter().map(|&t| AuthType::from_u8(t)).collect()
}

/// Refuse a connection during negotiation: `[0][len][reason]`.
pub fn encode_refusal(reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + REASON_HEADER_LEN + reason.len());
    out.push(0);
    out.extend_from_slice(&encode_reason(reason));
    out
}

/// Length of the reason string announced by a 4-byte header.
pub fn reason_length(header: &[u8]) -> Result<usize, HandshakeError> {
    let header: [u8; REASON_HEADER_LEN] = header
        .get(..REASON_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(HandshakeError::Truncated {
            what: "reason length",
            expected: REASON_HEADER_LEN,
            actual: header.len(),
        })?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_REASON_LEN {
        return Err(HandshakeError::ReasonTooLong(len));
    }
    Ok(len)
}

/// Decode a `[len: u32 BE][bytes]` reason string.
pub fn parse_reason(bytes: &[u8]) -> Result<String, HandshakeError> {
    let len = reason_length(bytes)?;
    let body = &bytes[REASON_HEADER_LEN..];
    if body.len() < len {
        return Err(HandshakeError::Truncated {
            what: "reason",
            expected: len,
            actual: body.len(),
        });
    }
    Ok(String::from_utf8_lossy(&body[..len]).into_owned())
}

fn encode_reason(reason: &str) -> Vec<u8> {
    let bytes = &reason.as_bytes()[..reason.len().min(MAX_REASON_LEN)];
    let mut out = Vec::with_capacity(REASON_HEADER_LEN + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Fresh random challenge for one authentication attempt.
pub fn generate_challenge() -> Challenge {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::rng().fill(&mut challenge);
    challenge
}

/// The response a client holding `password` must send for `challenge`.
pub fn encrypt_challenge(challenge: &Challenge, password: &[u8]) -> Challenge {
    let mut key = [0u8; DES_KEY_LEN];
    for (slot, byte) in key.iter_mut().zip(password.iter().take(DES_KEY_LEN)) {
        *slot = byte.reverse_bits();
    }
    let cipher = Des::new(GenericArray::from_slice(&key));

    let mut encrypted = [0u8; CHALLENGE_LEN];
    for (input, output) in challenge
        .chunks_exact(DES_BLOCK_LEN)
        .zip(encrypted.chunks_exact_mut(DES_BLOCK_LEN))
    {
        let mut block = GenericArray::clone_from_slice(input);
        cipher.encrypt_block(&mut block);
        output.copy_from_slice(block.as_slice());
    }
    encrypted
}

/// True only if `response` is the DES transform of `challenge` under `password`.
pub fn check_response(challenge: &Challenge, response: &[u8], password: &[u8]) -> bool {
    if response.len() != CHALLENGE_LEN {
        return false;
    }
    let expected = encrypt_challenge(challenge, password);
    expected[..].ct_eq(response).into()
}

/// SecurityResult as sent by a 3.8 server; failures carry a reason.
pub fn encode_auth_result(result: AuthResult) -> Vec<u8> {
    match result {
        AuthResult::Success => 0u32.to_be_bytes().to_vec(),
        AuthResult::Failure => {
            let mut out = 1u32.to_be_bytes().to_vec();
            out.extend_from_slice(&encode_reason(AUTH_FAILURE_REASON));
            out
        }
    }
}

/// Decode the 4-byte SecurityResult word. Any non-zero value is a failure.
pub fn decode_auth_result(bytes: &[u8]) -> Result<AuthResult, HandshakeError> {
    let word: [u8; AUTH_RESULT_LEN] = bytes
        .get(..AUTH_RESULT_LEN)
        .and_then(|w| w.try_into().ok())
        .ok_or(HandshakeError::Truncated {
            what: "security result",
            expected: AUTH_RESULT_LEN,
            actual: bytes.len(),
        })?;
    match u32::from_be_bytes(word) {
        0 => Ok(AuthResult::Success),
        _ => Ok(AuthResult::Failure),
    }
}
