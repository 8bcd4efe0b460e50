//! The FailOver wire protocol: a fixed-shape request (one tagged integer
//! subtype) and a reply (status code + optional text), per spec §4.1 and
//! §6. In the original this rides on the generic PBS batch-request DIS
//! encoding; here it's a small self-contained framing so the core doesn't
//! need an external RPC stack to be complete.
//!
//! Wire shape, all integers big-endian:
//!
//! ```text
//! Request: 0x01 <u8 subtype>
//! Reply:   0x02 <u8 code> <u8 choice> [<u32 len> <len bytes utf8>]
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FailoverError;

const TAG_REQUEST: u8 = 0x01;
const TAG_REPLY: u8 = 0x02;

/// The closed enumeration of FailOver request subtypes (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtype {
    Register = 1,
    HandShake = 2,
    PrimIsBack = 3,
    SecdShutdown = 4,
    SecdGoInactive = 5,
    SecdTakeOver = 6,
}

impl Subtype {
    fn from_u8(v: u8) -> Result<Self, FailoverError> {
        Ok(match v {
            1 => Subtype::Register,
            2 => Subtype::HandShake,
            3 => Subtype::PrimIsBack,
            4 => Subtype::SecdShutdown,
            5 => Subtype::SecdGoInactive,
            6 => Subtype::SecdTakeOver,
            other => return Err(FailoverError::Protocol(format!("unknown subtype {other}"))),
        })
    }
}

/// A decoded FailOver request: just the subtype tag (spec §3 "Request
/// envelope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub subtype: Subtype,
}

/// Reply status code. `Ok` is success; the others map to the rejection
/// paths named in spec §4.4 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok = 0,
    ObjBusy = 1,
    UnkReq = 2,
    System = 3,
}

impl ReplyCode {
    fn from_u8(v: u8) -> Result<Self, FailoverError> {
        Ok(match v {
            0 => ReplyCode::Ok,
            1 => ReplyCode::ObjBusy,
            2 => ReplyCode::UnkReq,
            3 => ReplyCode::System,
            other => return Err(FailoverError::Protocol(format!("unknown reply code {other}"))),
        })
    }
}

/// A decoded FailOver reply: `{code, choice, optional text}` (spec §4.1).
/// For `Register`, `text` carries the Primary's host id as decimal ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub text: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Reply { code: ReplyCode::Ok, text: None }
    }

    pub fn ok_with_text(text: impl Into<String>) -> Self {
        Reply { code: ReplyCode::Ok, text: Some(text.into()) }
    }

    pub fn err(code: ReplyCode) -> Self {
        Reply { code, text: None }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.code, ReplyCode::Ok)
    }
}

/// Writes a request header plus subtype and flushes (spec §4.1
/// `Encode-request`). Fails with [`FailoverError::Io`] on any write failure.
pub async fn write_request<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    req: Request,
) -> Result<(), FailoverError> {
    w.write_u8(TAG_REQUEST).await?;
    w.write_u8(req.subtype as u8).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a request header, yielding `{subtype}` (spec §4.1
/// `Decode-request`). Fails with [`FailoverError::Eof`] on a clean close or
/// [`FailoverError::Protocol`] on a malformed frame.
pub async fn read_request<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Request, FailoverError> {
    let tag = match r.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FailoverError::Eof),
        Err(e) => return Err(e.into()),
    };
    if tag != TAG_REQUEST {
        return Err(FailoverError::Protocol(format!("expected request tag, got {tag}")));
    }
    let subtype = Subtype::from_u8(r.read_u8().await?)?;
    Ok(Request { subtype })
}

/// Writes a reply frame (spec §4.1 `Encode-reply`).
pub async fn write_reply<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    reply: &Reply,
) -> Result<(), FailoverError> {
    w.write_u8(TAG_REPLY).await?;
    w.write_u8(reply.code as u8).await?;
    match &reply.text {
        Some(text) => {
            w.write_u8(1).await?;
            let bytes = text.as_bytes();
            w.write_u32(bytes.len() as u32).await?;
            w.write_all(bytes).await?;
        }
        None => {
            w.write_u8(0).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Reads a reply frame (spec §4.1 `Decode-reply`).
pub async fn read_reply<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Reply, FailoverError> {
    let tag = match r.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FailoverError::Eof),
        Err(e) => return Err(e.into()),
    };
    if tag != TAG_REPLY {
        return Err(FailoverError::Protocol(format!("expected reply tag, got {tag}")));
    }
    let code = ReplyCode::from_u8(r.read_u8().await?)?;
    let choice = r.read_u8().await?;
    let text = match choice {
        0 => None,
        1 => {
            let len = r.read_u32().await? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).await?;
            Some(String::from_utf8(buf).map_err(|e| FailoverError::Protocol(e.to_string()))?)
        }
        other => return Err(FailoverError::Protocol(format!("unknown reply choice {other}"))),
    };
    Ok(Reply { code, text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_round_trips() {
        let mut buf = Vec::new();
        write_request(&mut buf, Request { subtype: Subtype::HandShake }).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_request(&mut cursor).await.unwrap();
        assert_eq!(decoded.subtype, Subtype::HandShake);
    }

    #[tokio::test]
    async fn reply_with_text_round_trips() {
        let mut buf = Vec::new();
        write_reply(&mut buf, &Reply::ok_with_text("1234567890")).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_reply(&mut cursor).await.unwrap();
        assert_eq!(decoded.code, ReplyCode::Ok);
        assert_eq!(decoded.text.as_deref(), Some("1234567890"));
    }

    #[tokio::test]
    async fn empty_stream_is_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FailoverError::Eof));
    }

    #[tokio::test]
    async fn unknown_subtype_is_protocol_error() {
        let mut buf = vec![TAG_REQUEST, 99];
        let mut cursor = Cursor::new(&mut buf);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FailoverError::Protocol(_)));
    }
}
