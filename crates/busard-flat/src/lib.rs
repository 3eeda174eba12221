//! Zero-copy flat-buffer codec.
//!
//! A message is a contiguous byte span: the 16-byte header, then
//! fixed-layout fields, then out-of-line data (vectors, strings, optional
//! structs) addressed by relative offsets from the referencing field. The
//! encoder appends out-of-line data at the aligned write cursor; the decoder
//! validates every offset against the committed size before handing out a
//! span, so a malformed message can fail but never read past its end.

#![forbid(unsafe_code)]

mod buffer;
mod error;
mod read;
mod write;

pub use buffer::*;
pub use error::*;
pub use read::*;
pub use write::*;
