pub mod frame;

pub use frame::{
    encode_awareness, encode_saved, encode_sync, FrameError, InboundFrame, MessageTag,
};
