//! # Packet Codec
//!
//! Tokio codec over the frame format, for use with
//! [`tokio_util::codec::Framed`], `FramedRead` and `FramedWrite`.
//!
//! Encoding writes one [`Frame`] at a time. Decoding consumes whatever bytes
//! are buffered and yields complete [`Message`]s, so a frame split across
//! reads is handled the same way the channel's reader handles it.

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::core::message::Message;
use crate::core::packet::Frame;
use crate::core::packetizer::{Packetizer, Reassembler};
use crate::error::{ProtocolError, Result};

pub struct PacketCodec {
    reassembler: Reassembler,
    ready: VecDeque<Message>,
    scratch: Vec<Message>,
}

impl PacketCodec {
    pub fn new(packetizer: &Packetizer) -> Self {
        Self {
            reassembler: packetizer.reassembler(),
            ready: VecDeque::new(),
            scratch: Vec::new(),
        }
    }

    /// Decoder state, for inspecting partial reassemblies
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(&Packetizer::default())
    }
}

impl Decoder for PacketCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !src.is_empty() {
            let chunk = src.split();
            self.reassembler.feed(&chunk, &mut self.scratch)?;
            self.ready.extend(self.scratch.drain(..));
        }
        Ok(self.ready.pop_front())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let message = self.decode(src)?;
        if message.is_none() && self.reassembler.is_mid_frame() {
            warn!(
                pending = self.reassembler.pending_entries(),
                "Stream ended inside a frame"
            );
        }
        Ok(message)
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(dst);
        Ok(())
    }
}

impl Encoder<&Frame> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(dst);
        Ok(())
    }
}
