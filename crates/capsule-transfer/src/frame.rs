//! Wire frames carried over the data channel
//!
//! Text frames are UTF-8 JSON tagged by `kind`:
//! ```text
//! {"kind":"chat","text":"..."}
//! {"kind":"file-meta","itemId":"itm_…","name":"a.txt","type":"text/plain","size":10,"chunkSize":262144,"salt":[…32 ints…]}
//! {"kind":"location", …opaque fields…}
//! ```
//!
//! File chunks are binary frames:
//! ```text
//! [header JSON][0x0A][ciphertext: ciphertextLength bytes]
//! header = {"kind":"file-chunk","itemId":"itm_…","sequenceIndex":0,"iv":[…12 ints…],"ciphertextLength":N}
//! ```
//! Compact JSON escapes newlines inside strings, so the first `0x0A` is
//! always the delimiter.

use bytes::Bytes;
use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use capsule_crypto::{ItemSalt, IV_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separates the chunk header from the ciphertext
pub const HEADER_DELIMITER: u8 = 0x0A;

/// Control and chat frames (text)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TextFrame {
    /// Plaintext chat message. Not encrypted at the application layer.
    Chat { text: String },

    /// Announces an item; its chunks follow on binary frames.
    #[serde(rename_all = "camelCase")]
    FileMeta {
        item_id: ItemId,
        name: String,
        #[serde(rename = "type")]
        mime_type: String,
        size: u64,
        chunk_size: u64,
        /// Item salt; the receiver re-derives the item key from it.
        salt: ItemSalt,
    },

    /// Opaque location payload, passed through untouched.
    Location(Map<String, Value>),
}

const KNOWN_TEXT_KINDS: [&str; 3] = ["chat", "file-meta", "location"];

impl TextFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            TextFrame::Chat { .. } => "chat",
            TextFrame::FileMeta { .. } => "file-meta",
            TextFrame::Location(_) => "location",
        }
    }

    pub fn encode(&self) -> CapsuleResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CapsuleError::MalformedFrame(format!("serializing {}: {e}", self.kind())))
    }

    /// Parse a text frame.
    ///
    /// `Ok(None)` means well-formed JSON with a `kind` this side does not
    /// know; callers surface it as unrecognized rather than as an error.
    pub fn decode(text: &str) -> CapsuleResult<Option<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CapsuleError::MalformedFrame(format!("text frame JSON: {e}")))?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| CapsuleError::MalformedFrame("text frame has no kind".into()))?;

        if kind == "file-chunk" {
            return Err(CapsuleError::MalformedFrame(
                "file-chunk must arrive as a binary frame".into(),
            ));
        }
        if !KNOWN_TEXT_KINDS.contains(&kind) {
            return Ok(None);
        }

        let kind = kind.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CapsuleError::MalformedFrame(format!("{kind} frame: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum ChunkKind {
    #[serde(rename = "file-chunk")]
    FileChunk,
}

/// Header of a binary chunk frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    kind: ChunkKind,
    pub item_id: ItemId,
    pub sequence_index: u64,
    pub iv: [u8; IV_SIZE],
    pub ciphertext_length: u64,
}

impl ChunkHeader {
    pub fn new(item_id: ItemId, sequence_index: u64, iv: [u8; IV_SIZE], ciphertext_length: u64) -> Self {
        Self {
            kind: ChunkKind::FileChunk,
            item_id,
            sequence_index,
            iv,
            ciphertext_length,
        }
    }
}

/// One encrypted chunk as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub ciphertext: Bytes,
}

impl ChunkFrame {
    pub fn new(
        item_id: ItemId,
        sequence_index: u64,
        iv: [u8; IV_SIZE],
        ciphertext: impl Into<Bytes>,
    ) -> Self {
        let ciphertext = ciphertext.into();
        Self {
            header: ChunkHeader::new(item_id, sequence_index, iv, ciphertext.len() as u64),
            ciphertext,
        }
    }

    pub fn encode(&self) -> CapsuleResult<Bytes> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| CapsuleError::MalformedFrame(format!("serializing chunk header: {e}")))?;
        let mut out = Vec::with_capacity(header.len() + 1 + self.ciphertext.len());
        out.extend_from_slice(&header);
        out.push(HEADER_DELIMITER);
        out.extend_from_slice(&self.ciphertext);
        Ok(Bytes::from(out))
    }

    /// Split at the first delimiter and check the declared length.
    pub fn decode(frame: &Bytes) -> CapsuleResult<Self> {
        let split = frame
            .iter()
            .position(|&b| b == HEADER_DELIMITER)
            .ok_or_else(|| CapsuleError::MalformedFrame("chunk frame has no header delimiter".into()))?;

        let header: ChunkHeader = serde_json::from_slice(&frame[..split])
            .map_err(|e| CapsuleError::MalformedFrame(format!("chunk header: {e}")))?;
        let ciphertext = frame.slice(split + 1..);

        if header.ciphertext_length != ciphertext.len() as u64 {
            return Err(CapsuleError::MalformedFrame(format!(
                "chunk declares {} ciphertext bytes, carries {}",
                header.ciphertext_length,
                ciphertext.len()
            )));
        }
        Ok(Self { header, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn iv_1_to_12() -> [u8; IV_SIZE] {
        std::array::from_fn(|i| i as u8 + 1)
    }

    #[test]
    fn chunk_frame_splits_at_first_delimiter() {
        let payload = vec![0x0A, 1, 0x0A, 2, 3];
        let frame = ChunkFrame::new(ItemId::new("X"), 0, iv_1_to_12(), payload.clone());
        let wire = frame.encode().unwrap();

        let decoded = ChunkFrame::decode(&wire).unwrap();
        assert_eq!(decoded.header.item_id.as_str(), "X");
        assert_eq!(decoded.header.sequence_index, 0);
        assert_eq!(decoded.header.iv, iv_1_to_12());
        assert_eq!(decoded.header.ciphertext_length, 5);
        assert_eq!(decoded.ciphertext.as_ref(), payload.as_slice());
    }

    #[test]
    fn chunk_header_wire_shape() {
        let frame = ChunkFrame::new(ItemId::new("itm_abc"), 3, [0u8; IV_SIZE], vec![9u8; 4]);
        let wire = frame.encode().unwrap();
        let split = wire.iter().position(|&b| b == HEADER_DELIMITER).unwrap();
        let json: Value = serde_json::from_slice(&wire[..split]).unwrap();

        assert_eq!(json["kind"], "file-chunk");
        assert_eq!(json["itemId"], "itm_abc");
        assert_eq!(json["sequenceIndex"], 3);
        assert_eq!(json["iv"].as_array().unwrap().len(), 12);
        assert_eq!(json["ciphertextLength"], 4);
    }

    #[test]
    fn chunk_frame_length_mismatch_is_malformed() {
        let mut wire = ChunkFrame::new(ItemId::new("X"), 0, [0u8; IV_SIZE], vec![1u8; 5])
            .encode()
            .unwrap()
            .to_vec();
        wire.pop();

        assert!(matches!(
            ChunkFrame::decode(&Bytes::from(wire)),
            Err(CapsuleError::MalformedFrame(_))
        ));
    }

    #[test]
    fn chunk_frame_without_delimiter_is_malformed() {
        assert!(matches!(
            ChunkFrame::decode(&Bytes::from_static(b"{\"kind\":\"file-chunk\"}")),
            Err(CapsuleError::MalformedFrame(_))
        ));
    }

    #[test]
    fn chunk_header_with_wrong_kind_is_malformed() {
        let wire = Bytes::from_static(
            b"{\"kind\":\"chat\",\"itemId\":\"X\",\"sequenceIndex\":0,\"iv\":[0,0,0,0,0,0,0,0,0,0,0,0],\"ciphertextLength\":0}\n",
        );
        assert!(matches!(
            ChunkFrame::decode(&wire),
            Err(CapsuleError::MalformedFrame(_))
        ));
    }

    #[test]
    fn text_frames_use_kind_tag() {
        let chat = TextFrame::Chat { text: "hi".into() }.encode().unwrap();
        assert_eq!(chat, r#"{"kind":"chat","text":"hi"}"#);

        let meta = TextFrame::FileMeta {
            item_id: ItemId::new("itm_1"),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            size: 10,
            chunk_size: 262_144,
            salt: [7u8; 32],
        };
        let json: Value = serde_json::from_str(&meta.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "file-meta");
        assert_eq!(json["itemId"], "itm_1");
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["chunkSize"], 262_144);
        assert_eq!(json["salt"].as_array().unwrap().len(), 32);

        assert_eq!(TextFrame::decode(&meta.encode().unwrap()).unwrap(), Some(meta));
    }

    #[test]
    fn location_is_passed_through() {
        let text = r#"{"kind":"location","lat":52.5,"lon":13.4,"label":"here"}"#;
        let Some(TextFrame::Location(fields)) = TextFrame::decode(text).unwrap() else {
            panic!("expected location frame");
        };
        assert_eq!(fields["lat"], 52.5);
        assert_eq!(fields["label"], "here");
        assert!(!fields.contains_key("kind"));
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        assert_eq!(TextFrame::decode(r#"{"kind":"typing"}"#).unwrap(), None);
    }

    #[test]
    fn malformed_text_frames() {
        for text in [
            "not json",
            r#"{"text":"no kind"}"#,
            r#"{"kind":"chat"}"#,
            r#"{"kind":"file-meta","itemId":"x"}"#,
            r#"{"kind":"file-chunk"}"#,
        ] {
            assert!(
                matches!(TextFrame::decode(text), Err(CapsuleError::MalformedFrame(_))),
                "{text} should be malformed"
            );
        }
    }

    proptest! {
        #[test]
        fn chunk_frame_recovers_payload(
            index in any::<u64>(),
            iv in any::<[u8; IV_SIZE]>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let frame = ChunkFrame::new(ItemId::new("itm_prop"), index, iv, payload.clone());
            let decoded = ChunkFrame::decode(&frame.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.header.sequence_index, index);
            prop_assert_eq!(decoded.header.iv, iv);
            prop_assert_eq!(decoded.ciphertext.as_ref(), payload.as_slice());
        }
    }
}
