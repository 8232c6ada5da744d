// Binary frames exchanged on a document websocket.
//
// Every transport message carries exactly one frame: a varuint tag followed by
// a tag-specific payload. Tags 0 and 1 are the y-protocols sync and awareness
// messages, tag 100 is the server's zero-payload "saved" notice. Every other
// tag is reserved and ignored by this version.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;

const TAG_SYNC: u32 = 0;
const TAG_AWARENESS: u32 = 1;
const TAG_SAVED: u32 = 100;

/// Closed set of message tags understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Sync,
    Awareness,
    Saved,
}

impl MessageTag {
    pub const ALL: [MessageTag; 3] = [Self::Sync, Self::Awareness, Self::Saved];

    pub const fn code(self) -> u32 {
        match self {
            Self::Sync => TAG_SYNC,
            Self::Awareness => TAG_AWARENESS,
            Self::Saved => TAG_SAVED,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            TAG_SYNC => Some(Self::Sync),
            TAG_AWARENESS => Some(Self::Awareness),
            TAG_SAVED => Some(Self::Saved),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Awareness => "awareness",
            Self::Saved => "saved",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,

    #[error("invalid message tag: {0}")]
    Tag(#[source] read::Error),

    #[error("invalid sync payload: {0}")]
    Sync(#[source] read::Error),

    #[error("invalid awareness payload: {0}")]
    Awareness(#[source] read::Error),
}

/// A decoded client frame.
#[derive(Debug)]
pub enum InboundFrame {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
    /// Clients never send this; decoded so it can be ignored explicitly.
    Saved,
    /// Reserved tag (2-99, 101+). Ignored without closing the connection.
    Unknown(u32),
}

impl InboundFrame {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut decoder = DecoderV1::new(Cursor::new(payload));
        let tag: u32 = decoder.read_var().map_err(FrameError::Tag)?;

        match MessageTag::from_code(tag) {
            Some(MessageTag::Sync) => {
                SyncMessage::decode(&mut decoder).map(Self::Sync).map_err(FrameError::Sync)
            }
            Some(MessageTag::Awareness) => {
                let raw = decoder.read_buf().map_err(FrameError::Awareness)?;
                AwarenessUpdate::decode_v1(raw).map(Self::Awareness).map_err(FrameError::Awareness)
            }
            Some(MessageTag::Saved) => Ok(Self::Saved),
            None => Ok(Self::Unknown(tag)),
        }
    }

    pub fn tag(&self) -> Option<MessageTag> {
        match self {
            Self::Sync(_) => Some(MessageTag::Sync),
            Self::Awareness(_) => Some(MessageTag::Awareness),
            Self::Saved => Some(MessageTag::Saved),
            Self::Unknown(_) => None,
        }
    }
}

/// Encode a sync message (step-1, step-2 or update) as a tag-0 frame.
pub fn encode_sync(message: SyncMessage) -> Vec<u8> {
    Message::Sync(message).encode_v1()
}

/// Encode an awareness update as a tag-1 frame.
pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// The tag-100 frame sent after every successful save.
pub fn encode_saved() -> Vec<u8> {
    // Tags below 128 encode as a single varuint byte.
    vec![TAG_SAVED as u8]
}
