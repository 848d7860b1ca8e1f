//! C2: the length-framed message codec (spec §6).
//!
//! Wire format: `(uint32 length)(byte type)(payload)`, all integers
//! big-endian, `length` counting the type byte plus payload. The
//! read/write-framed shape — a length prefix followed by exact-sized reads —
//! is the same technique `other_examples`' `sven-p2p` codec uses for its
//! libp2p `request_response` protocol; this module swaps CBOR for the
//! spec's literal byte layout since every field width here is meaningful
//! (`uint16` parameter counts, `uint64` invocation ids) rather than an
//! opaque serde blob.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::RmiError;

/// Maximum frame size accepted from a peer. Prevents a malicious or buggy
/// peer from claiming an unbounded length prefix and exhausting memory —
/// the same defensive cap the teacher applies to IRC line length.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ArgSlot {
    Value(Vec<u8>),
    StubRef {
        object_id: String,
        origin_host: String,
        origin_port: u16,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteErrorPayload {
    pub kind: String,
    pub message: String,
    pub stack_frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnOutcome {
    Ok {
        return_type_descriptor: String,
        value: ArgSlot,
    },
    Err(RemoteErrorPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invocation {
        inv_id: u64,
        object_id: String,
        method_name: String,
        param_descriptors: Vec<String>,
        args: Vec<ArgSlot>,
    },
    Return {
        inv_id: u64,
        outcome: ReturnOutcome,
    },
    NewReference {
        object_id: String,
    },
    Finalize {
        object_id: String,
    },
    InterfaceRequest {
        req_id: u64,
        object_id: String,
    },
    InterfaceReply {
        req_id: u64,
        interfaces: Vec<String>,
    },
    Interrupt {
        inv_id: u64,
    },
    AuthChallenge {
        nonce: String,
    },
    AuthResponse {
        auth_id: String,
        credential: Vec<u8>,
    },
    Ping,
    Pong,
    Close {
        reason: String,
    },
}

mod tag {
    pub const INVOCATION: u8 = 0x01;
    pub const RETURN: u8 = 0x02;
    pub const NEW_REFERENCE: u8 = 0x03;
    pub const FINALIZE: u8 = 0x04;
    pub const INTERFACE_REQUEST: u8 = 0x05;
    pub const INTERFACE_REPLY: u8 = 0x06;
    pub const INTERRUPT: u8 = 0x07;
    pub const AUTH_CHALLENGE: u8 = 0x10;
    pub const AUTH_RESPONSE: u8 = 0x11;
    pub const PING: u8 = 0x20;
    pub const PONG: u8 = 0x21;
    pub const CLOSE: u8 = 0x7F;
}

/// Growable byte-buffer writer with the primitive encoders the wire format
/// needs. Kept deliberately small rather than pulling in `bytes`/`BytesMut`
/// for a handful of big-endian pushes.
#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.0.extend_from_slice(b);
    }
    fn arg_slot(&mut self, slot: &ArgSlot) {
        match slot {
            ArgSlot::Value(blob) => {
                self.0.push(0x00);
                self.bytes(blob);
            }
            ArgSlot::StubRef {
                object_id,
                origin_host,
                origin_port,
            } => {
                self.0.push(0x01);
                self.str(object_id);
                self.str(origin_host);
                self.u16(*origin_port);
            }
        }
    }
}

/// Cursor reader over an in-memory frame, paired with `Writer`.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RmiError> {
        if self.pos + n > self.buf.len() {
            return Err(RmiError::Protocol("frame truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RmiError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, RmiError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32, RmiError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64, RmiError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn str(&mut self) -> Result<String, RmiError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| RmiError::Protocol(e.to_string()))
    }
    fn bytes(&mut self) -> Result<Vec<u8>, RmiError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn arg_slot(&mut self) -> Result<ArgSlot, RmiError> {
        match self.u8()? {
            0x00 => Ok(ArgSlot::Value(self.bytes()?)),
            0x01 => {
                let object_id = self.str()?;
                let origin_host = self.str()?;
                let origin_port = self.u16()?;
                Ok(ArgSlot::StubRef {
                    object_id,
                    origin_host,
                    origin_port,
                })
            }
            other => Err(RmiError::Protocol(format!("bad arg slot marker {other}"))),
        }
    }
    fn finish(&self) -> Result<(), RmiError> {
        if self.pos != self.buf.len() {
            return Err(RmiError::Protocol("trailing bytes in frame".into()));
        }
        Ok(())
    }
}

fn encode_body(msg: &Message) -> Writer {
    let mut w = Writer::default();
    match msg {
        Message::Invocation {
            inv_id,
            object_id,
            method_name,
            param_descriptors,
            args,
        } => {
            w.0.push(tag::INVOCATION);
            w.u64(*inv_id);
            w.str(object_id);
            w.str(method_name);
            w.u16(param_descriptors.len() as u16);
            for d in param_descriptors {
                w.str(d);
            }
            for a in args {
                w.arg_slot(a);
            }
        }
        Message::Return { inv_id, outcome } => {
            w.0.push(tag::RETURN);
            w.u64(*inv_id);
            match outcome {
                ReturnOutcome::Ok {
                    return_type_descriptor,
                    value,
                } => {
                    w.0.push(0);
                    w.str(return_type_descriptor);
                    w.arg_slot(value);
                }
                ReturnOutcome::Err(err) => {
                    w.0.push(1);
                    w.str(&err.kind);
                    w.str(&err.message);
                    w.u16(err.stack_frames.len() as u16);
                    for frame in &err.stack_frames {
                        w.str(frame);
                    }
                }
            }
        }
        Message::NewReference { object_id } => {
            w.0.push(tag::NEW_REFERENCE);
            w.str(object_id);
        }
        Message::Finalize { object_id } => {
            w.0.push(tag::FINALIZE);
            w.str(object_id);
        }
        Message::InterfaceRequest { req_id, object_id } => {
            w.0.push(tag::INTERFACE_REQUEST);
            w.u64(*req_id);
            w.str(object_id);
        }
        Message::InterfaceReply { req_id, interfaces } => {
            w.0.push(tag::INTERFACE_REPLY);
            w.u64(*req_id);
            w.u16(interfaces.len() as u16);
            for i in interfaces {
                w.str(i);
            }
        }
        Message::Interrupt { inv_id } => {
            w.0.push(tag::INTERRUPT);
            w.u64(*inv_id);
        }
        Message::AuthChallenge { nonce } => {
            w.0.push(tag::AUTH_CHALLENGE);
            w.str(nonce);
        }
        Message::AuthResponse { auth_id, credential } => {
            w.0.push(tag::AUTH_RESPONSE);
            w.str(auth_id);
            w.bytes(credential);
        }
        Message::Ping => w.0.push(tag::PING),
        Message::Pong => w.0.push(tag::PONG),
        Message::Close { reason } => {
            w.0.push(tag::CLOSE);
            w.str(reason);
        }
    }
    w
}

fn decode_body(body: &[u8]) -> Result<Message, RmiError> {
    let mut r = Reader::new(body);
    let type_byte = r.u8()?;
    let msg = match type_byte {
        tag::INVOCATION => {
            let inv_id = r.u64()?;
            let object_id = r.str()?;
            let method_name = r.str()?;
            let n_params = r.u16()? as usize;
            let mut param_descriptors = Vec::with_capacity(n_params);
            for _ in 0..n_params {
                param_descriptors.push(r.str()?);
            }
            let mut args = Vec::with_capacity(n_params);
            for _ in 0..n_params {
                args.push(r.arg_slot()?);
            }
            Message::Invocation {
                inv_id,
                object_id,
                method_name,
                param_descriptors,
                args,
            }
        }
        tag::RETURN => {
            let inv_id = r.u64()?;
            let has_error = r.u8()?;
            let outcome = if has_error == 0 {
                let return_type_descriptor = r.str()?;
                let value = r.arg_slot()?;
                ReturnOutcome::Ok {
                    return_type_descriptor,
                    value,
                }
            } else {
                let kind = r.str()?;
                let message = r.str()?;
                let n = r.u16()? as usize;
                let mut stack_frames = Vec::with_capacity(n);
                for _ in 0..n {
                    stack_frames.push(r.str()?);
                }
                ReturnOutcome::Err(RemoteErrorPayload {
                    kind,
                    message,
                    stack_frames,
                })
            };
            Message::Return { inv_id, outcome }
        }
        tag::NEW_REFERENCE => Message::NewReference {
            object_id: r.str()?,
        },
        tag::FINALIZE => Message::Finalize {
            object_id: r.str()?,
        },
        tag::INTERFACE_REQUEST => {
            let req_id = r.u64()?;
            let object_id = r.str()?;
            Message::InterfaceRequest { req_id, object_id }
        }
        tag::INTERFACE_REPLY => {
            let req_id = r.u64()?;
            let n = r.u16()? as usize;
            let mut interfaces = Vec::with_capacity(n);
            for _ in 0..n {
                interfaces.push(r.str()?);
            }
            Message::InterfaceReply { req_id, interfaces }
        }
        tag::INTERRUPT => Message::Interrupt { inv_id: r.u64()? },
        tag::AUTH_CHALLENGE => Message::AuthChallenge { nonce: r.str()? },
        tag::AUTH_RESPONSE => {
            let auth_id = r.str()?;
            let credential = r.bytes()?;
            Message::AuthResponse {
                auth_id,
                credential,
            }
        }
        tag::PING => Message::Ping,
        tag::PONG => Message::Pong,
        tag::CLOSE => Message::Close { reason: r.str()? },
        other => return Err(RmiError::Protocol(format!("unknown message type {other:#04x}"))),
    };
    r.finish()?;
    Ok(msg)
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), RmiError>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let body = encode_body(msg).0;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(RmiError::Protocol("outgoing frame too large".into()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<Message, RmiError>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(RmiError::Protocol("incoming frame too large".into()));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_body(&body)
}
