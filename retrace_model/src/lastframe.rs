use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::warn;

use crate::call::Call;
use crate::callflags::CALL_FLAG_END_FRAME;
use crate::parser::{AbstractParser, ParseBookmark};

/// Decorator that keeps a trace alive past its end by looping the last
/// completed frame.
///
/// While the wrapped parser still produces calls, this is a transparent
/// pass-through that notes the bookmark at each frame boundary. At the
/// first end of stream (with loops remaining) it seeks back to the start
/// of the last completed frame, re-parses that tail into a cache of
/// shared `Rc<Call>`s, and from then on serves the cache cyclically —
/// the wrapped parser is never touched again. Call numbers repeat
/// verbatim across passes, since the bookmark restores the call counter
/// along with the position.
///
/// Requires a bookmark-capable container (snappy or seekable zstd); on
/// anything else the stream simply ends once, with a warning.
pub struct LastFrameLoopParser<P: AbstractParser> {
    inner: P,
    /// Replay passes left to serve.
    remaining: u64,
    /// Bookmark at the start of the frame currently being parsed.
    frame_start: ParseBookmark,
    /// Bookmark at the start of the last completed frame.
    last_frame_start: Option<ParseBookmark>,
    cache: Vec<Rc<Call>>,
    cache_pos: usize,
    replaying: bool,
}

impl<P: AbstractParser> LastFrameLoopParser<P> {
    /// Loop the last frame `loop_count` extra times after the trace ends.
    pub fn new(inner: P, loop_count: u64) -> Self {
        let frame_start = inner.get_bookmark();
        LastFrameLoopParser {
            inner,
            remaining: loop_count,
            frame_start,
            last_frame_start: None,
            cache: Vec::new(),
            cache_pos: 0,
            replaying: false,
        }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    /// Seek to the last completed frame and cache its calls.
    fn build_cache(&mut self) -> anyhow::Result<bool> {
        let Some(start) = self.last_frame_start else {
            return Ok(false);
        };
        if !self.inner.supports_bookmarks() || !self.inner.set_bookmark(start) {
            warn!("trace container cannot seek; last-frame looping disabled");
            return Ok(false);
        }
        while let Some(call) = self.inner.parse_call()? {
            self.cache.push(call);
        }
        Ok(!self.cache.is_empty())
    }

    fn next_cached(&mut self) -> Option<Rc<Call>> {
        if self.cache.is_empty() {
            return None;
        }
        if self.cache_pos >= self.cache.len() {
            self.remaining -= 1;
            if self.remaining == 0 {
                return None;
            }
            self.cache_pos = 0;
        }
        let call = Rc::clone(&self.cache[self.cache_pos]);
        self.cache_pos += 1;
        Some(call)
    }
}

impl<P: AbstractParser> AbstractParser for LastFrameLoopParser<P> {
    fn parse_call(&mut self) -> anyhow::Result<Option<Rc<Call>>> {
        if self.replaying {
            return Ok(self.next_cached());
        }

        match self.inner.parse_call()? {
            Some(call) => {
                if call.has_flag(CALL_FLAG_END_FRAME) {
                    self.last_frame_start = Some(self.frame_start);
                    self.frame_start = self.inner.get_bookmark();
                }
                Ok(Some(call))
            }
            None => {
                if self.remaining == 0 {
                    return Ok(None);
                }
                self.replaying = true;
                if !self.build_cache()? {
                    return Ok(None);
                }
                Ok(self.next_cached())
            }
        }
    }

    fn supports_bookmarks(&self) -> bool {
        self.inner.supports_bookmarks()
    }

    fn get_bookmark(&self) -> ParseBookmark {
        self.inner.get_bookmark()
    }

    fn set_bookmark(&mut self, bookmark: ParseBookmark) -> bool {
        self.inner.set_bookmark(bookmark)
    }

    fn version(&self) -> u32 {
        self.inner.version()
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        self.inner.properties()
    }
}
