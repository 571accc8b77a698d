//! Binary frame encoding for [`Envelope`]s.
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0x00    2     magic (WIRE_MAGIC)
//! 0x02    1     wire version
//! 0x03    1     tag (MSG_* constant)
//! 0x04    4     from node
//! 0x08    4     to node
//! 0x0C    4     body length
//! 0x10    ...   body (tag specific, little-endian)
//! ```
//!
//! Page payloads are written without a length prefix because they are
//! always [`PAGE_SIZE`] bytes; context blobs carry a `u32` length.

use crate::*;
use thiserror::Error;

/// Errors produced while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("body length {declared} does not match frame ({actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("body of {0} bytes exceeds the frame limit")]
    Oversized(usize),

    #[error("context blob of {0} bytes exceeds MAX_CONTEXT_LEN")]
    ContextTooLarge(usize),

    #[error("invalid flag byte {0:#04x}")]
    InvalidFlag(u8),

    #[error("unknown reason code {0:#04x}")]
    UnknownReason(u8),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("page number {0:#x} is outside the guest physical address space")]
    PageOutOfRange(u64),
}

// ═══════════════════════════════════════════════════════════════════════
//  Encoding
// ═══════════════════════════════════════════════════════════════════════

/// Encode an envelope into a self-delimiting frame.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut body = Vec::with_capacity(body_capacity(&envelope.body));
    encode_body(&envelope.body, &mut body);

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
    frame.push(WIRE_VERSION);
    frame.push(envelope.body.tag());
    frame.extend_from_slice(&envelope.from.0.to_le_bytes());
    frame.extend_from_slice(&envelope.to.0.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn body_capacity(msg: &Message) -> usize {
    match msg {
        Message::PageReply { .. } | Message::WriteGrant { .. } | Message::RecallReply { .. } => {
            PAGE_SIZE + 24
        }
        Message::VcpuMigrate { context, .. } => context.len() + 24,
        _ => 24,
    }
}

fn encode_body(msg: &Message, out: &mut Vec<u8>) {
    match msg {
        Message::PageRequest {
            page,
            requester,
            known_version,
        } => {
            put_u64(out, page.0);
            put_u32(out, requester.0);
            put_bool(out, known_version.is_some());
            put_u64(out, known_version.unwrap_or(0));
        }
        Message::PageReply {
            page,
            version,
            data,
        }
        | Message::WriteGrant {
            page,
            version,
            data,
        } => {
            put_u64(out, page.0);
            put_u64(out, *version);
            put_page(out, data);
        }
        Message::WriteRequest { page, requester } => {
            put_u64(out, page.0);
            put_u32(out, requester.0);
        }
        Message::Invalidate { page, version } => {
            put_u64(out, page.0);
            put_u64(out, *version);
        }
        Message::InvalidateAck { page } => put_u64(out, page.0),
        Message::Recall {
            page,
            version,
            downgrade,
        } => {
            put_u64(out, page.0);
            put_u64(out, *version);
            put_bool(out, *downgrade);
        }
        Message::RecallReply {
            page,
            version,
            data,
        } => {
            put_u64(out, page.0);
            put_u64(out, *version);
            put_bool(out, data.is_some());
            if let Some(data) = data {
                put_page(out, data);
            }
        }
        Message::Validate {
            page,
            known_version,
        } => {
            put_u64(out, page.0);
            put_u64(out, *known_version);
        }
        Message::ValidateReply {
            page,
            version,
            valid,
        } => {
            put_u64(out, page.0);
            put_u64(out, *version);
            put_bool(out, *valid);
        }
        Message::Rejoin { node } | Message::RejoinAck { node } => put_u32(out, node.0),
        Message::Nack { page, reason } => {
            put_u64(out, page.0);
            let (code, node) = nack_code(reason);
            out.push(code);
            put_u32(out, node);
        }
        Message::VcpuMigrate {
            vcpu,
            epoch,
            hops,
            context,
        } => {
            debug_assert!(context.len() <= MAX_CONTEXT_LEN, "context blob too large");
            put_u32(out, vcpu.0);
            put_u64(out, *epoch);
            put_u32(out, *hops);
            put_u32(out, context.len() as u32);
            out.extend_from_slice(context);
        }
        Message::MigrateAck { vcpu } => put_u32(out, vcpu.0),
        Message::MigrateNack { vcpu, reason } => {
            put_u32(out, vcpu.0);
            out.push(reject_code(reason));
        }
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

fn put_page(out: &mut Vec<u8>, data: &[u8]) {
    debug_assert_eq!(data.len(), PAGE_SIZE, "page payload must be PAGE_SIZE bytes");
    out.extend_from_slice(data);
}

fn nack_code(reason: &NackReason) -> (u8, u32) {
    match reason {
        NackReason::NotHome => (0x01, 0),
        NackReason::Fenced => (0x02, 0),
        NackReason::OwnerUnreachable(node) => (0x03, node.0),
        NackReason::QueueTimeout => (0x04, 0),
        NackReason::Violation => (0x05, 0),
    }
}

fn reject_code(reason: &RejectReason) -> u8 {
    match reason {
        RejectReason::NoIdleSlot => 0x01,
        RejectReason::BadContext => 0x02,
        RejectReason::Conflict => 0x03,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoding
// ═══════════════════════════════════════════════════════════════════════

/// Decode one frame produced by [`encode`].
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let mut header = Reader::new(frame);
    let magic = header.u16()?;
    if magic != WIRE_MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = header.u8()?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let tag = header.u8()?;
    let from = NodeId(header.u32()?);
    let to = NodeId(header.u32()?);
    let declared = header.u32()? as usize;
    if declared > MAX_BODY_LEN {
        return Err(DecodeError::Oversized(declared));
    }
    let actual = frame.len() - HEADER_LEN;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual });
    }

    let mut r = Reader::new(&frame[HEADER_LEN..]);
    let body = decode_body(tag, &mut r)?;
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(r.remaining()));
    }
    Ok(Envelope { from, to, body })
}

fn decode_body(tag: u8, r: &mut Reader<'_>) -> Result<Message, DecodeError> {
    let msg = match tag {
        MSG_PAGE_REQUEST => {
            let page = r.page_number()?;
            let requester = NodeId(r.u32()?);
            let has_version = r.bool()?;
            let version = r.u64()?;
            Message::PageRequest {
                page,
                requester,
                known_version: has_version.then_some(version),
            }
        }
        MSG_PAGE_REPLY => Message::PageReply {
            page: r.page_number()?,
            version: r.u64()?,
            data: r.page()?,
        },
        MSG_WRITE_REQUEST => Message::WriteRequest {
            page: r.page_number()?,
            requester: NodeId(r.u32()?),
        },
        MSG_WRITE_GRANT => Message::WriteGrant {
            page: r.page_number()?,
            version: r.u64()?,
            data: r.page()?,
        },
        MSG_INVALIDATE => Message::Invalidate {
            page: r.page_number()?,
            version: r.u64()?,
        },
        MSG_INVALIDATE_ACK => Message::InvalidateAck {
            page: r.page_number()?,
        },
        MSG_RECALL => Message::Recall {
            page: r.page_number()?,
            version: r.u64()?,
            downgrade: r.bool()?,
        },
        MSG_RECALL_REPLY => {
            let page = r.page_number()?;
            let version = r.u64()?;
            let data = if r.bool()? { Some(r.page()?) } else { None };
            Message::RecallReply {
                page,
                version,
                data,
            }
        }
        MSG_VALIDATE => Message::Validate {
            page: r.page_number()?,
            known_version: r.u64()?,
        },
        MSG_VALIDATE_REPLY => Message::ValidateReply {
            page: r.page_number()?,
            version: r.u64()?,
            valid: r.bool()?,
        },
        MSG_REJOIN => Message::Rejoin {
            node: NodeId(r.u32()?),
        },
        MSG_REJOIN_ACK => Message::RejoinAck {
            node: NodeId(r.u32()?),
        },
        MSG_NACK => {
            let page = r.page_number()?;
            let code = r.u8()?;
            let node = NodeId(r.u32()?);
            let reason = match code {
                0x01 => NackReason::NotHome,
                0x02 => NackReason::Fenced,
                0x03 => NackReason::OwnerUnreachable(node),
                0x04 => NackReason::QueueTimeout,
                0x05 => NackReason::Violation,
                other => return Err(DecodeError::UnknownReason(other)),
            };
            Message::Nack { page, reason }
        }
        MSG_VCPU_MIGRATE => {
            let vcpu = VcpuId(r.u32()?);
            let epoch = r.u64()?;
            let hops = r.u32()?;
            let len = r.u32()? as usize;
            if len > MAX_CONTEXT_LEN {
                return Err(DecodeError::ContextTooLarge(len));
            }
            Message::VcpuMigrate {
                vcpu,
                epoch,
                hops,
                context: r.bytes(len)?.to_vec(),
            }
        }
        MSG_MIGRATE_ACK => Message::MigrateAck {
            vcpu: VcpuId(r.u32()?),
        },
        MSG_MIGRATE_NACK => {
            let vcpu = VcpuId(r.u32()?);
            let reason = match r.u8()? {
                0x01 => RejectReason::NoIdleSlot,
                0x02 => RejectReason::BadContext,
                0x03 => RejectReason::Conflict,
                other => return Err(DecodeError::UnknownReason(other)),
            };
            Message::MigrateNack { vcpu, reason }
        }
        other => return Err(DecodeError::UnknownTag(other)),
    };
    Ok(msg)
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidFlag(other)),
        }
    }

    fn page_number(&mut self) -> Result<PageNumber, DecodeError> {
        match self.u64()? {
            n if n <= MAX_PAGE_NUMBER => Ok(PageNumber(n)),
            n => Err(DecodeError::PageOutOfRange(n)),
        }
    }

    fn page(&mut self) -> Result<Vec<u8>, DecodeError> {
        Ok(self.bytes(PAGE_SIZE)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: Message) -> Vec<u8> {
        encode(&Envelope::new(NodeId(1), NodeId(2), body))
    }

    #[test]
    fn header_layout() {
        let bytes = frame(Message::InvalidateAck {
            page: PageNumber(9),
        });
        assert_eq!(&bytes[0..2], &WIRE_MAGIC.to_le_bytes());
        assert_eq!(bytes[2], WIRE_VERSION);
        assert_eq!(bytes[3], MSG_INVALIDATE_ACK);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 8);
        assert_eq!(bytes.len(), HEADER_LEN + 8);
    }

    #[test]
    fn write_grant_carries_full_page() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAA;
        data[PAGE_SIZE - 1] = 0x55;
        let env = Envelope::new(
            NodeId(0),
            NodeId(3),
            Message::WriteGrant {
                page: PageNumber(7),
                version: 12,
                data: data.clone(),
            },
        );
        let decoded = decode(&encode(&env)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn page_request_without_known_version() {
        let env = Envelope::new(
            NodeId(4),
            NodeId(5),
            Message::PageRequest {
                page: PageNumber(42),
                requester: NodeId(4),
                known_version: None,
            },
        );
        assert_eq!(decode(&encode(&env)).unwrap(), env);
    }

    #[test]
    fn empty_recall_reply_has_no_payload() {
        let bytes = frame(Message::RecallReply {
            page: PageNumber(1),
            version: 3,
            data: None,
        });
        assert_eq!(bytes.len(), HEADER_LEN + 17);
        match decode(&bytes).unwrap().body {
            Message::RecallReply { data, .. } => assert!(data.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn owner_unreachable_nack_keeps_node() {
        let bytes = frame(Message::Nack {
            page: PageNumber(5),
            reason: NackReason::OwnerUnreachable(NodeId(9)),
        });
        match decode(&bytes).unwrap().body {
            Message::Nack { reason, .. } => {
                assert_eq!(reason, NackReason::OwnerUnreachable(NodeId(9)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = frame(Message::MigrateAck { vcpu: VcpuId(1) });
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic(_))));
    }

    #[test]
    fn rejects_unknown_version_and_tag() {
        let mut bytes = frame(Message::MigrateAck { vcpu: VcpuId(1) });
        bytes[2] = 9;
        assert_eq!(decode(&bytes), Err(DecodeError::UnsupportedVersion(9)));

        let mut bytes = frame(Message::MigrateAck { vcpu: VcpuId(1) });
        bytes[3] = 0x7F;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownTag(0x7F)));
    }

    #[test]
    fn rejects_truncated_frames() {
        let bytes = frame(Message::PageReply {
            page: PageNumber(1),
            version: 0,
            data: vec![0; PAGE_SIZE],
        });
        assert!(matches!(
            decode(&bytes[..10]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_invalid_flag() {
        let mut bytes = frame(Message::Recall {
            page: PageNumber(1),
            version: 0,
            downgrade: true,
        });
        let last = bytes.len() - 1;
        bytes[last] = 2;
        assert_eq!(decode(&bytes), Err(DecodeError::InvalidFlag(2)));
    }

    #[test]
    fn rejects_oversized_context() {
        let mut bytes = frame(Message::VcpuMigrate {
            vcpu: VcpuId(1),
            epoch: 1,
            hops: 0,
            context: vec![1, 2, 3],
        });
        // Patch the context length field (after vcpu, epoch, hops).
        let off = HEADER_LEN + 4 + 8 + 4;
        bytes[off..off + 4].copy_from_slice(&((MAX_CONTEXT_LEN as u32) + 1).to_le_bytes());
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::ContextTooLarge(MAX_CONTEXT_LEN + 1))
        );
    }

    #[test]
    fn rejects_page_beyond_address_space() {
        let mut bytes = frame(Message::InvalidateAck {
            page: PageNumber(MAX_PAGE_NUMBER),
        });
        assert!(decode(&bytes).is_ok());
        bytes[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::PageOutOfRange(u64::MAX)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = frame(Message::MigrateAck { vcpu: VcpuId(1) });
        bytes.push(0);
        let len = (bytes.len() - HEADER_LEN) as u32;
        bytes[12..16].copy_from_slice(&len.to_le_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }
}
