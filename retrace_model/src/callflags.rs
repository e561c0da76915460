//! Call classification flags.
//!
//! Every function signature gets a default flag word when it is first
//! parsed: an exact table lookup where the entry point is known, a
//! name-pattern fallback for the long tail of vendor suffixes and
//! extensions the table does not enumerate.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Call has no observable side effects; safe to elide during replay.
pub const CALL_FLAG_NO_SIDE_EFFECTS: u32 = 1 << 0;

/// Call renders into the current render target (draw calls, clears).
pub const CALL_FLAG_RENDER: u32 = 1 << 1;

/// Call switches the render target (FBO binds, surface swaps).
pub const CALL_FLAG_SWAP_RENDERTARGET: u32 = 1 << 2;

/// Call terminates a frame.
pub const CALL_FLAG_END_FRAME: u32 = 1 << 3;

/// The call's `leave` event was missing; arguments may be partial.
pub const CALL_FLAG_INCOMPLETE: u32 = 1 << 4;

/// Uninteresting in listings unless verbosity is raised.
pub const CALL_FLAG_VERBOSE: u32 = 1 << 5;

/// Debug-marker call (annotation, not API work).
pub const CALL_FLAG_MARKER: u32 = 1 << 6;

/// Marker opening a group.
pub const CALL_FLAG_MARKER_PUSH: u32 = 1 << 7;

/// Marker closing a group.
pub const CALL_FLAG_MARKER_POP: u32 = 1 << 8;

const SWAP_FLAGS: u32 = CALL_FLAG_SWAP_RENDERTARGET | CALL_FLAG_END_FRAME;
const QUERY_FLAGS: u32 = CALL_FLAG_NO_SIDE_EFFECTS | CALL_FLAG_VERBOSE;

/// Known entry points, sorted by name for binary search. Keep sorted when
/// adding entries — the lookup asserts the order in debug builds.
static CALL_FLAG_TABLE: &[(&str, u32)] = &[
    ("eglSwapBuffers", SWAP_FLAGS),
    ("eglSwapBuffersWithDamageEXT", SWAP_FLAGS),
    ("eglSwapBuffersWithDamageKHR", SWAP_FLAGS),
    ("glBindFramebuffer", CALL_FLAG_SWAP_RENDERTARGET),
    ("glBindFramebufferEXT", CALL_FLAG_SWAP_RENDERTARGET),
    ("glBindFramebufferOES", CALL_FLAG_SWAP_RENDERTARGET),
    ("glClear", CALL_FLAG_RENDER),
    ("glDebugMessageInsert", CALL_FLAG_MARKER),
    ("glDebugMessageInsertARB", CALL_FLAG_MARKER),
    ("glDebugMessageInsertKHR", CALL_FLAG_MARKER),
    ("glDrawArrays", CALL_FLAG_RENDER),
    ("glDrawArraysEXT", CALL_FLAG_RENDER),
    ("glDrawArraysIndirect", CALL_FLAG_RENDER),
    ("glDrawArraysInstanced", CALL_FLAG_RENDER),
    ("glDrawElements", CALL_FLAG_RENDER),
    ("glDrawElementsBaseVertex", CALL_FLAG_RENDER),
    ("glDrawElementsIndirect", CALL_FLAG_RENDER),
    ("glDrawElementsInstanced", CALL_FLAG_RENDER),
    ("glDrawRangeElements", CALL_FLAG_RENDER),
    ("glFrameTerminatorGREMEDY", CALL_FLAG_END_FRAME),
    ("glGetError", CALL_FLAG_NO_SIDE_EFFECTS),
    ("glInsertEventMarkerEXT", CALL_FLAG_MARKER),
    ("glPopDebugGroup", CALL_FLAG_MARKER | CALL_FLAG_MARKER_POP),
    ("glPopDebugGroupKHR", CALL_FLAG_MARKER | CALL_FLAG_MARKER_POP),
    ("glPopGroupMarkerEXT", CALL_FLAG_MARKER | CALL_FLAG_MARKER_POP),
    ("glPushDebugGroup", CALL_FLAG_MARKER | CALL_FLAG_MARKER_PUSH),
    ("glPushDebugGroupKHR", CALL_FLAG_MARKER | CALL_FLAG_MARKER_PUSH),
    ("glPushGroupMarkerEXT", CALL_FLAG_MARKER | CALL_FLAG_MARKER_PUSH),
    ("glStringMarkerGREMEDY", CALL_FLAG_MARKER),
    ("glXSwapBuffers", SWAP_FLAGS),
    ("wglSwapBuffers", SWAP_FLAGS),
];

struct FallbackPatterns {
    draw: Regex,
    query: Regex,
    swap: Regex,
    rendertarget: Regex,
}

fn fallback_patterns() -> &'static FallbackPatterns {
    static PATTERNS: OnceLock<FallbackPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| FallbackPatterns {
        draw: Regex::new(r"^gl(Multi)?Draw[A-Z]|^Draw(Indexed)?Primitive").unwrap(),
        query: Regex::new(r"^(gl|egl|wgl|glX)(Get|Is)[A-Z]").unwrap(),
        swap: Regex::new(r"SwapBuffers|Present$").unwrap(),
        rendertarget: Regex::new(r"BindFramebuffer|SetRenderTarget").unwrap(),
    })
}

/// Whether a name plausibly belongs to an API family this tool traces.
fn known_family(name: &str) -> bool {
    static FAMILY: OnceLock<Regex> = OnceLock::new();
    FAMILY
        .get_or_init(|| Regex::new(r"^(gl|egl|wgl|glX|vk|D3D|Direct3D|I?DXGI|ID3D)").unwrap())
        .is_match(name)
}

/// Default flags for an entry point name.
///
/// Exact table matches win; otherwise the name-pattern fallback classifies
/// the draw-call / state-query / present / render-target-binding families
/// so new vendor entry points behave sensibly without a table update.
/// Anything else gets flags 0; a name outside every known API family is
/// logged, since it usually means a foreign or damaged trace.
pub fn lookup_call_flags(name: &str) -> u32 {
    debug_assert!(CALL_FLAG_TABLE.windows(2).all(|w| w[0].0 < w[1].0));

    if let Ok(idx) = CALL_FLAG_TABLE.binary_search_by(|(n, _)| n.cmp(&name)) {
        return CALL_FLAG_TABLE[idx].1;
    }

    let patterns = fallback_patterns();
    if patterns.draw.is_match(name) {
        return CALL_FLAG_RENDER;
    }
    if patterns.swap.is_match(name) {
        return SWAP_FLAGS;
    }
    if patterns.rendertarget.is_match(name) {
        return CALL_FLAG_SWAP_RENDERTARGET;
    }
    if patterns.query.is_match(name) {
        return QUERY_FLAGS;
    }

    if !known_family(name) {
        warn!("unknown entry point family for {name:?}, using default call flags");
    }
    0
}
