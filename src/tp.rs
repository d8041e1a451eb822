//! # SOME/IP-TP Segmentation and Reassembly
//!
//! Messages larger than one datagram are carried as TP segments: the
//! original header with the TP flag set, followed by an `offset_and_more`
//! word and a payload chunk. Offsets count bytes of the original payload in
//! units of 16, so every chunk except the last must be a multiple of 16
//! bytes long.
//!
//! Reassembly is strictly in-order: a segment is accepted only if its offset
//! equals the bytes collected so far. Anything else discards the context —
//! the discarded context logs how many out-of-order segments it saw, so a
//! retransmitting peer is visible instead of silently masked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::warn;

use crate::wire::{self, Header, TpHeader, HEADER_SIZE, TP_HEADER_SIZE, TP_OFFSET_UNIT};
use crate::{ClientId, MethodId, ServiceId, SessionId};

/// Split a serialized SOME/IP message into TP segments.
///
/// `max_segment_length` is the payload bytes per segment and must be a
/// multiple of 16. Returns an empty vector when `data` is not at least a
/// full header.
pub fn split_message(data: &[u8], max_segment_length: u16) -> Vec<Bytes> {
    let Some(header) = Header::parse(data) else {
        return Vec::new();
    };
    let payload = &data[HEADER_SIZE..];
    let chunk_size = (max_segment_length as usize / TP_OFFSET_UNIT) * TP_OFFSET_UNIT;
    if chunk_size == 0 {
        return Vec::new();
    }

    let mut segments = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut offset = 0usize;
    loop {
        let remaining = payload.len() - offset;
        let chunk = remaining.min(chunk_size);
        let more = offset + chunk < payload.len();

        let mut segment_header = header;
        segment_header.message_type_raw |= wire::TP_FLAG;
        segment_header.length = (8 + TP_HEADER_SIZE + chunk) as u32;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + TP_HEADER_SIZE + chunk);
        segment_header.serialize(&mut buf);
        buf.put_u32(
            TpHeader {
                offset: offset as u32,
                more,
            }
            .to_word(),
        );
        buf.put_slice(&payload[offset..offset + chunk]);
        segments.push(buf.freeze());

        offset += chunk;
        if !more {
            break;
        }
    }
    segments
}

/// Key of a reassembly context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ContextKey {
    remote: SocketAddr,
    service: ServiceId,
    method: MethodId,
    client: ClientId,
    session: SessionId,
}

#[derive(Debug)]
struct Context {
    /// Header of the first segment; the emitted message reuses it with the
    /// TP flag cleared.
    header: Header,
    buffer: BytesMut,
    out_of_order: u32,
    last_activity: Instant,
}

/// Collects TP segments per remote and emits completed messages.
#[derive(Debug)]
pub struct TpReassembler {
    contexts: HashMap<ContextKey, Context>,
    max_message_size: usize,
    timeout: Duration,
}

impl TpReassembler {
    pub fn new(max_message_size: usize, timeout: Duration) -> Self {
        Self {
            contexts: HashMap::new(),
            max_message_size,
            timeout,
        }
    }

    /// Feed one TP-flagged message received from `remote`.
    ///
    /// Returns the reassembled SOME/IP message once the final segment of a
    /// context has arrived in order.
    pub fn feed(&mut self, remote: SocketAddr, data: &[u8], now: Instant) -> Option<Bytes> {
        let header = Header::parse(data)?;
        let tp = TpHeader::parse(data)?;
        let chunk = &data[HEADER_SIZE + TP_HEADER_SIZE..];

        let key = ContextKey {
            remote,
            service: header.service,
            method: header.method,
            client: header.client,
            session: header.session,
        };

        let context = self.contexts.entry(key).or_insert_with(|| Context {
            header,
            buffer: BytesMut::new(),
            out_of_order: 0,
            last_activity: now,
        });

        if tp.offset as usize != context.buffer.len() {
            let seen = context.out_of_order + 1;
            warn!(
                "tp: out-of-order segment from {} [{:04x}.{:04x}.{:04x}.{:04x}] \
                 offset {} expected {}, discarding context ({} discarded so far)",
                remote,
                key.service,
                key.method,
                key.client,
                key.session,
                tp.offset,
                context.buffer.len(),
                seen,
            );
            self.contexts.remove(&key);
            return None;
        }

        if context.buffer.len() + chunk.len() > self.max_message_size {
            warn!(
                "tp: reassembled size exceeds maximum of {} bytes, discarding context",
                self.max_message_size
            );
            self.contexts.remove(&key);
            return None;
        }

        context.buffer.put_slice(chunk);
        context.last_activity = now;

        if tp.more {
            return None;
        }

        let context = self.contexts.remove(&key)?;
        let mut header = context.header;
        header.message_type_raw = wire::tp_flag_unset(header.message_type_raw);
        header.length = (8 + context.buffer.len()) as u32;

        let mut message = BytesMut::with_capacity(HEADER_SIZE + context.buffer.len());
        header.serialize(&mut message);
        message.put_slice(&context.buffer);
        Some(message.freeze())
    }

    /// Evict contexts idle longer than the configured window. Eviction is
    /// silent apart from the count it returns.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.contexts.len();
        self.contexts
            .retain(|_, context| now.duration_since(context.last_activity) <= timeout);
        before - self.contexts.len()
    }

    /// Drop all partial state, e.g. on endpoint stop.
    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    /// Number of partial messages currently held.
    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }
}
