//! SSH agent protocol messages and their framing.
//!
//! Every message travels as `uint32 length || byte type || payload`. The
//! codec enforces the frame limit before buffering a payload, so a hostile
//! length prefix cannot make the agent allocate more than one frame.

use crate::error::ProtocolError;
use crate::keyring::ListedIdentity;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kssh_signer::keys::{ECDSA_P256, NISTP256, SSH_RSA};
use kssh_signer::wire::{decode_mpint, to_vec, CheckedSum, Decode, Encode, Reader, Writer};
use kssh_signer::{KeyMaterial, SignFlags, Signature};
use tokio_util::codec::{Decoder, Encoder};
use zeroize::Zeroizing;

pub const MAX_FRAME_LEN: usize = 256 * 1024;

pub const SSH_AGENTC_REQUEST_RSA_IDENTITIES: u8 = 1;
pub const SSH_AGENT_RSA_IDENTITIES_ANSWER: u8 = 2;
pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REMOVE_ALL_RSA_IDENTITIES: u8 = 9;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
pub const SSH_AGENTC_ADD_SMARTCARD_KEY: u8 = 20;
pub const SSH_AGENTC_REMOVE_SMARTCARD_KEY: u8 = 21;
pub const SSH_AGENTC_LOCK: u8 = 22;
pub const SSH_AGENTC_UNLOCK: u8 = 23;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
pub const SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED: u8 = 26;
pub const SSH_AGENTC_EXTENSION: u8 = 27;

const CONSTRAIN_LIFETIME: u8 = 1;
const CONSTRAIN_CONFIRM: u8 = 2;
const CONSTRAIN_EXTENSION: u8 = 255;

#[derive(Debug)]
pub enum Request {
    RequestRsaIdentitiesV1,
    RemoveAllRsaIdentitiesV1,
    RequestIdentities,
    SignRequest {
        public_key: Bytes,
        data: Bytes,
        flags: SignFlags,
    },
    AddIdentity {
        key: AddedKey,
        constraints: Vec<Constraint>,
    },
    RemoveIdentity {
        public_key: Bytes,
    },
    RemoveAllIdentities,
    Smartcard,
    Lock {
        passphrase: Zeroizing<Vec<u8>>,
    },
    Unlock {
        passphrase: Zeroizing<Vec<u8>>,
    },
    Extension {
        name: String,
    },
}

/// Key carried by `ADD_IDENTITY`; types the agent cannot sign with are kept
/// only by name so the request can be refused cleanly.
#[derive(Debug)]
pub enum AddedKey {
    Supported {
        material: KeyMaterial,
        comment: String,
    },
    Unsupported {
        key_type: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constraint {
    Lifetime(u32),
    Confirm,
    Extension(String),
    Unknown(u8),
}

impl Request {
    /// Parses one frame body (type byte plus payload).
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut r: &[u8] = &frame;
        let code = u8::decode(&mut r).map_err(|_| ProtocolError::EmptyFrame)?;
        let request = match code {
            SSH_AGENTC_REQUEST_RSA_IDENTITIES => Request::RequestRsaIdentitiesV1,
            SSH_AGENTC_REMOVE_ALL_RSA_IDENTITIES => Request::RemoveAllRsaIdentitiesV1,
            SSH_AGENTC_REQUEST_IDENTITIES => Request::RequestIdentities,
            SSH_AGENTC_SIGN_REQUEST => Request::SignRequest {
                public_key: Bytes::decode(&mut r)?,
                data: Bytes::decode(&mut r)?,
                flags: SignFlags(u32::decode(&mut r)?),
            },
            SSH_AGENTC_ADD_IDENTITY => Request::AddIdentity {
                key: decode_added_key(&mut r)?,
                constraints: Vec::new(),
            },
            SSH_AGENTC_ADD_ID_CONSTRAINED => {
                let key = decode_added_key(&mut r)?;
                let constraints = decode_constraints(&mut r)?;
                Request::AddIdentity { key, constraints }
            }
            SSH_AGENTC_REMOVE_IDENTITY => Request::RemoveIdentity {
                public_key: Bytes::decode(&mut r)?,
            },
            SSH_AGENTC_REMOVE_ALL_IDENTITIES => Request::RemoveAllIdentities,
            SSH_AGENTC_ADD_SMARTCARD_KEY
            | SSH_AGENTC_REMOVE_SMARTCARD_KEY
            | SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED => {
                r = &[];
                Request::Smartcard
            }
            SSH_AGENTC_LOCK => Request::Lock {
                passphrase: Zeroizing::new(Vec::<u8>::decode(&mut r)?),
            },
            SSH_AGENTC_UNLOCK => Request::Unlock {
                passphrase: Zeroizing::new(Vec::<u8>::decode(&mut r)?),
            },
            SSH_AGENTC_EXTENSION => {
                let name = String::decode(&mut r)?;
                r = &[];
                Request::Extension { name }
            }
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        if !r.is_finished() {
            return Err(ProtocolError::TrailingBytes {
                code,
                len: r.remaining_len(),
            });
        }
        Ok(request)
    }
}

fn decode_added_key(r: &mut &[u8]) -> Result<AddedKey, ProtocolError> {
    let key_type = String::decode(r)?;
    let key = match key_type.as_str() {
        ECDSA_P256 => {
            let curve = String::decode(r)?;
            if curve != NISTP256 {
                *r = &[];
                return Ok(AddedKey::Unsupported { key_type: curve });
            }
            let point = Bytes::decode(r)?;
            let scalar = Zeroizing::new(decode_mpint(r)?);
            AddedKey::Supported {
                material: KeyMaterial::EcdsaP256 { point, scalar },
                comment: String::decode(r)?,
            }
        }
        SSH_RSA => {
            let n = Bytes::from(decode_mpint(r)?);
            let e = Bytes::from(decode_mpint(r)?);
            let d = Zeroizing::new(decode_mpint(r)?);
            let _iqmp = Zeroizing::new(decode_mpint(r)?);
            let p = Zeroizing::new(decode_mpint(r)?);
            let q = Zeroizing::new(decode_mpint(r)?);
            AddedKey::Supported {
                material: KeyMaterial::Rsa { n, e, d, p, q },
                comment: String::decode(r)?,
            }
        }
        _ => {
            // Field layout is type specific; nothing after it can be parsed.
            *r = &[];
            AddedKey::Unsupported { key_type }
        }
    };
    Ok(key)
}

fn decode_constraints(r: &mut &[u8]) -> Result<Vec<Constraint>, ProtocolError> {
    let mut constraints = Vec::new();
    while !r.is_finished() {
        match u8::decode(r)? {
            CONSTRAIN_LIFETIME => constraints.push(Constraint::Lifetime(u32::decode(r)?)),
            CONSTRAIN_CONFIRM => constraints.push(Constraint::Confirm),
            CONSTRAIN_EXTENSION => {
                let name = String::decode(r)?;
                *r = &[];
                constraints.push(Constraint::Extension(name));
            }
            other => {
                *r = &[];
                constraints.push(Constraint::Unknown(other));
            }
        }
    }
    Ok(constraints)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Success,
    Failure,
    IdentitiesAnswer(Vec<ListedIdentity>),
    SignResponse(Signature),
    RsaIdentitiesAnswerV1,
}

impl Response {
    pub fn code(&self) -> u8 {
        match self {
            Response::Success => SSH_AGENT_SUCCESS,
            Response::Failure => SSH_AGENT_FAILURE,
            Response::IdentitiesAnswer(_) => SSH_AGENT_IDENTITIES_ANSWER,
            Response::SignResponse(_) => SSH_AGENT_SIGN_RESPONSE,
            Response::RsaIdentitiesAnswerV1 => SSH_AGENT_RSA_IDENTITIES_ANSWER,
        }
    }
}

impl Encode for Response {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        let payload = match self {
            Response::Success | Response::Failure => 0,
            Response::IdentitiesAnswer(identities) => identities.iter().try_fold(4usize, |acc, i| {
                [acc, i.public_key.encoded_len()?, i.comment.encoded_len()?].checked_sum()
            })?,
            Response::SignResponse(signature) => signature.encoded_len_prefixed()?,
            Response::RsaIdentitiesAnswerV1 => 4,
        };
        [1, payload].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.code().encode(writer)?;
        match self {
            Response::Success | Response::Failure => Ok(()),
            Response::IdentitiesAnswer(identities) => {
                identities.len().encode(writer)?;
                for identity in identities {
                    identity.public_key.encode(writer)?;
                    identity.comment.encode(writer)?;
                }
                Ok(())
            }
            Response::SignResponse(signature) => signature.encode_prefixed(writer),
            Response::RsaIdentitiesAnswerV1 => 0u32.encode(writer),
        }
    }
}

/// Server side of the agent framing: decodes requests, encodes responses.
#[derive(Clone, Copy, Debug)]
pub struct AgentCodec {
    max_frame_len: usize,
}

impl AgentCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for AgentCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for AgentCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len).freeze();
        Request::decode(frame).map(Some)
    }
}

impl Encoder<Response> for AgentCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = to_vec(&item)?;
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
