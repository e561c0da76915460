//! Call-stream codec.
//!
//! A trace is a compressed container (see `retrace_stream`) holding a
//! textual properties block followed by an event-tagged byte stream:
//! signature definitions, call `enter`/`leave` boundaries, and a recursive
//! value grammar. This crate decodes that stream back into [`Call`]
//! records ([`Parser`]), encodes calls into it ([`CallWriter`]), and
//! provides bookmark-driven frame looping ([`LastFrameLoopParser`]).

pub mod call;
pub mod callflags;
pub mod lastframe;
pub mod parser;
pub mod sig;
pub mod value;
pub mod wire;
pub mod writer;

pub use call::{Call, CallNo};
pub use callflags::{
    lookup_call_flags, CALL_FLAG_END_FRAME, CALL_FLAG_INCOMPLETE, CALL_FLAG_MARKER,
    CALL_FLAG_MARKER_POP, CALL_FLAG_MARKER_PUSH, CALL_FLAG_NO_SIDE_EFFECTS, CALL_FLAG_RENDER,
    CALL_FLAG_SWAP_RENDERTARGET, CALL_FLAG_VERBOSE,
};
pub use lastframe::LastFrameLoopParser;
pub use parser::{AbstractParser, ParseBookmark, Parser};
pub use sig::{BitmaskSig, EnumSig, FunctionSig, Id, StackFrame, StructSig};
pub use value::Value;
pub use writer::CallWriter;
