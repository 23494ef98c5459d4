//! The lazily (de)coded message container (C3) and the streaming decoder
//! (C4). Grounded on `sageserver/msg/decodedmsg.py`'s `DecodedMsg`,
//! `MsgDecoder`, and `CallbackMsgDecoder`.

use bytes::Bytes;

use crate::config::HEADER_LEN;
use crate::{Error, Result};

use super::document::{decode_body, encode_body, Document};
use super::header::Header;

/// The message body's (de)coding state. `Raw` keeps the fast path
/// (forwarding an unmodified message) zero-copy; accessing a field decodes
/// once into `raw: Some(..)` (both valid); mutating a field drops the
/// cached raw bytes, forcing a re-encode on the next `encode()`.
#[derive(Debug, Clone)]
enum Body {
    Raw(Bytes),
    Decoded { doc: Document, raw: Option<Bytes> },
}

/// A decoded (or freshly constructed) message: a header paired with a body
/// whose decoding is deferred until a field is read.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub header: Header,
    body: Body,
}

impl DecodedMessage {
    /// Wraps a header and its still-undecoded body bytes, as produced by
    /// the streaming decoder.
    pub fn from_raw(header: Header, body: Bytes) -> Self {
        Self {
            header,
            body: Body::Raw(body),
        }
    }

    /// Constructs a brand-new message from a document body, `sid=0`, no
    /// flags set. Callers typically follow up with `as_reply_to` or by
    /// setting `header.sid`/flags directly.
    pub fn new(r#type: u16, doc: Document) -> Self {
        Self {
            header: Header::new(r#type, 0, 0, 0),
            body: Body::Decoded { doc, raw: None },
        }
    }

    pub fn r#type(&self) -> u16 {
        self.header.r#type
    }

    /// Copies `request`'s `sid` onto this message and sets `SCLOSE`,
    /// marking it as the (final) reply to a stream-scoped request.
    pub fn as_reply_to(mut self, request: &DecodedMessage) -> Self {
        self.header.sid = request.header.sid;
        self.header.set_sclose(true);
        self
    }

    /// Decodes the body if it hasn't been decoded yet.
    pub fn ensure_decoded(&mut self) -> Result<()> {
        if let Body::Raw(bytes) = &self.body {
            let doc = decode_body(bytes)?;
            self.body = Body::Decoded {
                doc,
                raw: Some(bytes.clone()),
            };
        }
        Ok(())
    }

    /// Reads a field out of the body document.
    pub fn get(&mut self, key: &str) -> Result<Option<&Document>> {
        self.ensure_decoded()?;
        match &self.body {
            Body::Decoded { doc, .. } => Ok(doc.get(key)),
            Body::Raw(_) => unreachable!("ensure_decoded always transitions out of Raw"),
        }
    }

    /// Sets a field in the body document, invalidating any cached raw
    /// bytes so the next `encode()` re-serializes.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Document>) -> Result<()> {
        self.ensure_decoded()?;
        match &mut self.body {
            Body::Decoded { doc, raw } => {
                doc.set(key, value);
                *raw = None;
            }
            Body::Raw(_) => unreachable!("ensure_decoded always transitions out of Raw"),
        }
        Ok(())
    }

    /// Encodes the header and body to a single byte buffer, ready to write
    /// to the pipe. If the body was never decoded (or was decoded but not
    /// mutated since), this is a cheap concatenation of cached bytes.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        let body_bytes: Bytes = match &mut self.body {
            Body::Raw(bytes) => bytes.clone(),
            Body::Decoded { doc, raw } => match raw {
                Some(bytes) => bytes.clone(),
                None => {
                    let encoded = Bytes::from(encode_body(doc)?);
                    *raw = Some(encoded.clone());
                    encoded
                }
            },
        };
        self.header.length = body_bytes.len() as u32;
        let mut out = self.header.encode()?.to_vec();
        out.extend_from_slice(&body_bytes);
        Ok(out)
    }
}

/// Streaming decoder that returns a list of completed messages per `feed`
/// call. Used where the caller wants a plain `Vec` back (e.g. the
/// manager-side child driver).
#[derive(Debug, Default)]
pub struct MessageDecoder {
    core: DecoderCore,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: impl Into<Bytes>) -> Result<Vec<DecodedMessage>> {
        let mut out = Vec::new();
        self.core.feed(chunk, |header, body| {
            out.push(DecodedMessage::from_raw(header, body));
        })?;
        Ok(out)
    }
}

/// Streaming decoder that dispatches each completed message to a handler
/// table predicate/callback pair as soon as its body completes, discarding
/// (with a warning) bodies for types the predicate rejects. Used by the
/// worker's receive thread (mirrors `CallbackMsgDecoder`).
#[derive(Debug, Default)]
pub struct CallbackDecoder {
    core: DecoderCore,
}

impl CallbackDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(
        &mut self,
        chunk: impl Into<Bytes>,
        is_known: impl Fn(u16) -> bool,
        mut on_message: impl FnMut(DecodedMessage),
    ) -> Result<()> {
        self.core.feed(chunk, |header, body| {
            if is_known(header.r#type) {
                on_message(DecodedMessage::from_raw(header, body));
            } else {
                tracing::warn!(r#type = header.r#type, "unhandled message type");
            }
        })
    }
}

/// Shared state machine (`WANT_HEADER`/`WANT_BODY`) behind both decoder
/// flavors.
#[derive(Debug, Default)]
struct DecoderCore {
    jbuf: super::joinbuf::JoinBuffer,
    pending_header: Option<Header>,
    poisoned: bool,
}

impl DecoderCore {
    /// Feeds `chunk` in, calling `on_complete(header, body)` for every
    /// message whose body finishes arriving, in order. Never blocks. On a
    /// `CorruptHeader`/`BodyTooLarge` error the decoder is poisoned: this
    /// and every subsequent `feed` call returns an error.
    fn feed(&mut self, chunk: impl Into<Bytes>, mut on_complete: impl FnMut(Header, Bytes)) -> Result<()> {
        if self.poisoned {
            return Err(Error::TransportClosed);
        }
        self.jbuf.extend(chunk);
        loop {
            if self.pending_header.is_none() {
                if self.jbuf.len() < HEADER_LEN {
                    break;
                }
                let hdr_bytes = self.jbuf.pop_left(HEADER_LEN).expect("length checked above");
                match Header::decode(&hdr_bytes, 0) {
                    Ok(h) => self.pending_header = Some(h),
                    Err(e) => {
                        self.poisoned = true;
                        return Err(e);
                    }
                }
            }
            let header = self.pending_header.expect("set just above or by a prior iteration");
            let need = header.length as usize;
            if self.jbuf.len() < need {
                break;
            }
            let body = self.jbuf.pop_left(need).expect("length checked above");
            self.pending_header = None;
            on_complete(header, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::document::DocBuilder;

    #[test]
    fn decoder_emits_messages_in_order_across_arbitrary_chunking() {
        let msgs: Vec<DecodedMessage> = (0..5)
            .map(|i| {
                let doc = DocBuilder::new().field("n", i as i64).build();
                DecodedMessage::new(1, doc)
            })
            .collect();
        let mut encoded = Vec::new();
        for m in msgs.iter().cloned() {
            let mut m = m;
            encoded.extend(m.encode().unwrap());
        }

        for chunk_size in 1..encoded.len() {
            let mut decoder = MessageDecoder::new();
            let mut out = Vec::new();
            for chunk in encoded.chunks(chunk_size) {
                out.extend(decoder.feed(Bytes::copy_from_slice(chunk)).unwrap());
            }
            assert_eq!(out.len(), 5);
            for (i, m) in out.iter_mut().enumerate() {
                assert_eq!(m.get("n").unwrap().unwrap().as_i64(), Some(i as i64));
            }
        }
    }

    #[test]
    fn header_length_zero_produces_empty_document_not_an_error() {
        let mut m = DecodedMessage::new(1, Document::empty_doc());
        let encoded = m.encode().unwrap();
        let mut decoder = MessageDecoder::new();
        let mut out = decoder.feed(Bytes::copy_from_slice(&encoded)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.length, 0);
        out[0].ensure_decoded().unwrap();
    }

    #[test]
    fn corrupt_header_poisons_the_decoder() {
        let mut m = DecodedMessage::new(1, Document::empty_doc());
        let mut encoded = m.encode().unwrap();
        encoded[0] ^= 0xff; // corrupt the type field, which is summed
        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(Bytes::copy_from_slice(&encoded)).is_err());
        // poisoned: further feeds also fail, transport considered unrecoverable.
        assert!(decoder.feed(Bytes::new()).is_err());
    }

    #[test]
    fn callback_decoder_discards_unknown_types_without_stalling() {
        let mut known = DecodedMessage::new(1, Document::empty_doc());
        let mut unknown = DecodedMessage::new(999, Document::empty_doc());
        let mut bytes = unknown.encode().unwrap();
        bytes.extend(known.encode().unwrap());

        let mut decoder = CallbackDecoder::new();
        let mut seen = Vec::new();
        decoder
            .feed(Bytes::from(bytes), |t| t == 1, |m| seen.push(m.r#type()))
            .unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn as_reply_to_copies_sid_and_sets_sclose() {
        let mut request = DecodedMessage::new(1, Document::empty_doc());
        request.header.sid = 42;
        let reply = DecodedMessage::new(2, Document::empty_doc()).as_reply_to(&request);
        assert_eq!(reply.header.sid, 42);
        assert!(reply.header.sclose());
    }

    #[test]
    fn set_invalidates_cached_raw_bytes_forcing_reencode() {
        let mut m = DecodedMessage::new(1, DocBuilder::new().field("a", 1i64).build());
        let first = m.encode().unwrap();
        m.set("a", 2i64).unwrap();
        let second = m.encode().unwrap();
        assert_ne!(first, second);
    }
}
