//! Framed columnar batch stream.
//!
//! Architecture role:
//! - request/response body format for batch-carrying endpoints
//! - carries the out-of-band `cursor` / `error` control keys
//!
//! Key modules:
//! - [`frame`]
//! - [`writer`]
//! - [`reader`]

pub mod frame;
pub mod reader;
pub mod writer;

pub use frame::{Frame, CURSOR_KEY, ERROR_KEY};
pub use reader::{decode_frames, FrameDecoder, FrameStream};
pub use writer::{encode_frames, FrameWriter};
