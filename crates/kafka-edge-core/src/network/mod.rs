//! Networking: frame codecs, the upstream stream abstraction, and the
//! accept-side listeners.

pub mod codec;
pub mod listener;
pub mod stream;

pub use codec::{
    read_frame, write_frame, RequestCodec, RequestFrame, ResponseCodec, ResponseFrame,
    MAX_FRAME_SIZE,
};
pub use listener::ProxyListeners;
pub use stream::UpstreamStream;
