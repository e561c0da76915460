use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Context};
use tracing::warn;

use retrace_stream::{File, Offset};

use crate::call::{Call, CallNo};
use crate::callflags::{CALL_FLAG_INCOMPLETE, CALL_FLAG_VERBOSE};
use crate::sig::{BitmaskSig, EnumSig, FunctionSig, Id, StackFrame, StructSig};
use crate::value::Value;
use crate::wire::{self, event, ty};

/// Entry point whose result gets the no-error verbosity adjustment.
const ERROR_QUERY_FUNCTION: &str = "glGetError";

/// Hardening bound on signature ids; a trace with a million distinct
/// signatures is corrupt, not large.
const MAX_SIG_ID: u64 = 1 << 20;

/// Position a parser can be rewound to: a container offset plus the call
/// counter needed to resume numbering there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseBookmark {
    pub offset: Offset,
    pub next_call_no: CallNo,
}

/// Contract shared by [`Parser`] and its decorators, consumed by replay,
/// inspection and trimming tools.
pub trait AbstractParser {
    /// Decode the next completed call, `None` at end of stream.
    fn parse_call(&mut self) -> anyhow::Result<Option<Rc<Call>>>;

    /// Whether bookmarks round-trip on this parser's container. False for
    /// strictly sequential backends; callers must check before relying on
    /// [`AbstractParser::set_bookmark`].
    fn supports_bookmarks(&self) -> bool;

    fn get_bookmark(&self) -> ParseBookmark;

    /// Rewind (or fast-forward) to a bookmark. Returns false, changing
    /// nothing, when the container cannot seek.
    fn set_bookmark(&mut self, bookmark: ParseBookmark) -> bool;

    /// Container format version from the properties header.
    fn version(&self) -> u32;

    fn properties(&self) -> &BTreeMap<String, String>;
}

/// Whether a decode pass materializes values or merely advances.
///
/// SCAN follows the identical control flow and consumes the identical
/// bytes as FULL while discarding payloads, which is what makes scan-based
/// fast-forwarding and progress estimation trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    Scan,
}

/// A signature arena slot: the parsed record plus the offset its inline
/// definition occupies, so re-reading that spot after a bookmark seek
/// consumes the definition bytes again instead of desynchronizing.
struct SigEntry<T> {
    sig: Rc<T>,
    def_offset: Offset,
}

/// Grow-on-demand id-indexed arena. Slots are never reused or shrunk
/// within a session.
struct SigTable<T> {
    slots: Vec<Option<SigEntry<T>>>,
}

impl<T> Default for SigTable<T> {
    fn default() -> Self {
        SigTable { slots: Vec::new() }
    }
}

impl<T> SigTable<T> {
    fn lookup(&self, id: Id) -> Option<&SigEntry<T>> {
        self.slots.get(id as usize).and_then(|slot| slot.as_ref())
    }

    fn insert(&mut self, id: Id, sig: Rc<T>, def_offset: Offset) -> anyhow::Result<()> {
        let idx = id as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        if self.slots[idx].is_some() {
            bail!("duplicate signature id {id} in call stream");
        }
        self.slots[idx] = Some(SigEntry { sig, def_offset });
        Ok(())
    }
}

/// A call whose `enter` event has been parsed but whose `leave` has not
/// arrived yet.
struct PendingCall {
    sig: Rc<FunctionSig>,
    thread_id: u64,
    args: Vec<Value>,
}

/// Decoder for the call stream inside one container.
///
/// Owns its [`File`] and the per-kind signature arenas, both living for
/// the whole parsing session. [`Parser::parse_call`] builds full value
/// trees; [`Parser::scan_call`] walks the same grammar discarding
/// payloads, for call counting and fast-forwarding.
pub struct Parser {
    file: Box<dyn File>,
    properties: BTreeMap<String, String>,
    version: u32,
    semantic_version: String,
    functions: SigTable<FunctionSig>,
    structs: SigTable<StructSig>,
    enums: SigTable<EnumSig>,
    bitmasks: SigTable<BitmaskSig>,
    frames: SigTable<StackFrame>,
    next_call_no: CallNo,
    open_calls: Vec<PendingCall>,
    /// Id of the [`ERROR_QUERY_FUNCTION`] signature, once seen.
    error_query: Option<Id>,
    eof: bool,
}

impl Parser {
    /// Take ownership of an opened container and read its properties
    /// header.
    pub fn open(mut file: Box<dyn File>) -> anyhow::Result<Self> {
        let properties =
            read_properties(file.as_mut()).context("reading trace properties header")?;
        let version = properties
            .get("version")
            .context("trace is missing its version property")?
            .parse::<u32>()
            .context("trace version property is not a number")?;
        let semantic_version = properties
            .get("semantic-version")
            .cloned()
            .unwrap_or_default();

        Ok(Parser {
            file,
            properties,
            version,
            semantic_version,
            functions: SigTable::default(),
            structs: SigTable::default(),
            enums: SigTable::default(),
            bitmasks: SigTable::default(),
            frames: SigTable::default(),
            next_call_no: 0,
            open_calls: Vec::new(),
            error_query: None,
            eof: false,
        })
    }

    /// Semantic version recorded by the capturing tool, empty if absent.
    pub fn semantic_version(&self) -> &str {
        &self.semantic_version
    }

    /// Progress through the compressed container, 0..=100.
    pub fn percent_read(&self) -> u8 {
        self.file.percent_read()
    }

    /// Scan-only variant of [`Parser::parse_call`]: same events, same byte
    /// consumption, but the returned calls carry no argument, return or
    /// backtrace payloads. Flag adjustments that depend on return values
    /// are skipped.
    pub fn scan_call(&mut self) -> anyhow::Result<Option<Rc<Call>>> {
        self.parse_call_mode(Mode::Scan)
    }

    fn parse_call_mode(&mut self, mode: Mode) -> anyhow::Result<Option<Rc<Call>>> {
        if self.eof {
            return Ok(None);
        }
        loop {
            let Some(tag) = self.file.getc() else {
                return self.finish_stream();
            };
            match tag {
                event::ENTER => self.parse_enter(mode)?,
                event::LEAVE => {
                    if let Some(call) = self.parse_leave(mode)? {
                        return Ok(Some(call));
                    }
                }
                event::SIG_FUNCTION => {
                    self.parse_function_ref()?;
                }
                event::SIG_STRUCT => {
                    self.parse_struct_ref()?;
                }
                event::SIG_ENUM => {
                    self.parse_enum_ref()?;
                }
                event::SIG_OLD_ENUM => self.parse_old_enum()?,
                event::SIG_BITMASK => {
                    self.parse_bitmask_ref()?;
                }
                event::SIG_FRAME => {
                    self.parse_frame_ref()?;
                }
                other => bail!("unexpected event tag {other:#04x} in call stream"),
            }
        }
    }

    /// Clean end of container. Calls still open lost their `leave` to a
    /// crashed capture; surface them, innermost first, marked incomplete.
    fn finish_stream(&mut self) -> anyhow::Result<Option<Rc<Call>>> {
        let Some(pending) = self.open_calls.pop() else {
            self.eof = true;
            return Ok(None);
        };
        warn!(
            "trace ended inside {}; emitting incomplete call",
            pending.sig.name
        );
        let no = self.next_call_no;
        self.next_call_no += 1;
        Ok(Some(Rc::new(Call {
            no,
            thread_id: pending.thread_id,
            flags: pending.sig.flags | CALL_FLAG_INCOMPLETE,
            sig: pending.sig,
            args: pending.args,
            ret: None,
            backtrace: None,
        })))
    }

    fn parse_enter(&mut self, mode: Mode) -> anyhow::Result<()> {
        let thread_id = wire::read_varint(self.file.as_mut())?;
        let sig = self.parse_function_ref()?;
        let mut args = Vec::with_capacity(if mode == Mode::Full { sig.args.len() } else { 0 });
        for _ in 0..sig.args.len() {
            if let Some(value) = self.parse_value(mode)? {
                args.push(value);
            }
        }
        self.open_calls.push(PendingCall {
            sig,
            thread_id,
            args,
        });
        Ok(())
    }

    fn parse_leave(&mut self, mode: Mode) -> anyhow::Result<Option<Rc<Call>>> {
        let has_ret = wire::read_byte(self.file.as_mut())? != 0;
        let ret = if has_ret {
            self.parse_value(mode)?
        } else {
            None
        };

        let has_backtrace = wire::read_byte(self.file.as_mut())? != 0;
        let backtrace = if has_backtrace {
            let count = wire::read_length(self.file.as_mut())?;
            let mut frames = Vec::with_capacity(count as usize);
            for _ in 0..count {
                frames.push(self.parse_frame_ref()?);
            }
            Some(frames)
        } else {
            None
        };

        let pending = self
            .open_calls
            .pop()
            .context("leave event without a matching enter")?;

        let no = self.next_call_no;
        self.next_call_no += 1;

        let mut flags = pending.sig.flags;
        // A negative error check is noise; a positive one is interesting.
        if mode == Mode::Full
            && self.error_query == Some(pending.sig.id)
            && ret.as_ref().and_then(Value::to_uint) == Some(0)
        {
            flags |= CALL_FLAG_VERBOSE;
        }

        Ok(Some(Rc::new(Call {
            no,
            thread_id: pending.thread_id,
            sig: pending.sig,
            args: pending.args,
            ret,
            backtrace: if mode == Mode::Full { backtrace } else { None },
            flags,
        })))
    }

    // ── Value grammar ──────────────────────────────────────────────────────

    fn parse_value(&mut self, mode: Mode) -> anyhow::Result<Option<Value>> {
        let full = mode == Mode::Full;
        let tag = wire::read_byte(self.file.as_mut())?;
        let value = match tag {
            ty::NULL => full.then_some(Value::Null),
            ty::FALSE => full.then_some(Value::Bool(false)),
            ty::TRUE => full.then_some(Value::Bool(true)),
            ty::SINT => {
                let v = wire::read_sint_packed(self.file.as_mut())?;
                full.then_some(Value::SInt(v))
            }
            ty::UINT => {
                let v = wire::read_uint_packed(self.file.as_mut())?;
                full.then_some(Value::UInt(v))
            }
            ty::FLOAT => {
                let mut bits = [0u8; 4];
                wire::read_exact(self.file.as_mut(), &mut bits)?;
                full.then_some(Value::Float(f32::from_le_bytes(bits)))
            }
            ty::DOUBLE => {
                let mut bits = [0u8; 8];
                wire::read_exact(self.file.as_mut(), &mut bits)?;
                full.then_some(Value::Double(f64::from_le_bytes(bits)))
            }
            ty::STRING | ty::WSTRING => {
                if full {
                    let s = wire::read_string(self.file.as_mut())?;
                    Some(if tag == ty::STRING {
                        Value::String(s)
                    } else {
                        Value::WString(s)
                    })
                } else {
                    let len = wire::read_length(self.file.as_mut())?;
                    wire::skip_bytes(self.file.as_mut(), len)?;
                    None
                }
            }
            ty::ENUM => {
                let sig = self.parse_enum_ref()?;
                let v = wire::read_sint_packed(self.file.as_mut())?;
                full.then_some(Value::Enum(sig, v))
            }
            ty::BITMASK => {
                let sig = self.parse_bitmask_ref()?;
                let v = wire::read_uint_packed(self.file.as_mut())?;
                full.then_some(Value::Bitmask(sig, v))
            }
            ty::ARRAY => {
                let count = wire::read_length(self.file.as_mut())?;
                if full {
                    let mut elements = Vec::with_capacity(count.min(1 << 16) as usize);
                    for _ in 0..count {
                        elements.push(
                            self.parse_value(mode)?
                                .context("array element missing in full parse")?,
                        );
                    }
                    Some(Value::Array(elements))
                } else {
                    for _ in 0..count {
                        self.parse_value(mode)?;
                    }
                    None
                }
            }
            ty::BLOB => {
                let len = wire::read_length(self.file.as_mut())?;
                if full {
                    let mut bytes = vec![0u8; len as usize];
                    wire::read_exact(self.file.as_mut(), &mut bytes)?;
                    Some(Value::Blob(bytes))
                } else {
                    wire::skip_bytes(self.file.as_mut(), len)?;
                    None
                }
            }
            ty::STRUCT => {
                let sig = self.parse_struct_ref()?;
                if full {
                    let mut members = Vec::with_capacity(sig.members.len());
                    for _ in 0..sig.members.len() {
                        members.push(
                            self.parse_value(mode)?
                                .context("struct member missing in full parse")?,
                        );
                    }
                    Some(Value::Struct(sig, members))
                } else {
                    for _ in 0..sig.members.len() {
                        self.parse_value(mode)?;
                    }
                    None
                }
            }
            ty::POINTER => {
                let v = wire::read_uint_packed(self.file.as_mut())?;
                full.then_some(Value::Pointer(v))
            }
            ty::REPR => {
                let human = self.parse_value(mode)?;
                let machine = self.parse_value(mode)?;
                match (human, machine) {
                    (Some(h), Some(m)) => Some(Value::Repr(Box::new(h), Box::new(m))),
                    _ => None,
                }
            }
            other => bail!("unexpected value tag {other:#04x} in call stream"),
        };
        Ok(value)
    }

    // ── Signature references ───────────────────────────────────────────────
    //
    // A reference is a varint id. An empty arena slot means the full
    // definition follows inline; a filled slot is a pure back-reference,
    // unless the read position sits exactly on the slot's recorded
    // definition offset — that happens after a bookmark seek re-enters the
    // defining occurrence, and the definition bytes must be consumed again.

    fn parse_function_ref(&mut self) -> anyhow::Result<Rc<FunctionSig>> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.functions.lookup(id) {
            let sig = Rc::clone(&entry.sig);
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                read_function_def(self.file.as_mut(), id)?;
            }
            return Ok(sig);
        }
        let def_offset = self.file.current_offset();
        let sig = Rc::new(read_function_def(self.file.as_mut(), id)?);
        if sig.name == ERROR_QUERY_FUNCTION {
            self.error_query = Some(id);
        }
        self.functions.insert(id, Rc::clone(&sig), def_offset)?;
        Ok(sig)
    }

    fn parse_struct_ref(&mut self) -> anyhow::Result<Rc<StructSig>> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.structs.lookup(id) {
            let sig = Rc::clone(&entry.sig);
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                read_struct_def(self.file.as_mut(), id)?;
            }
            return Ok(sig);
        }
        let def_offset = self.file.current_offset();
        let sig = Rc::new(read_struct_def(self.file.as_mut(), id)?);
        self.structs.insert(id, Rc::clone(&sig), def_offset)?;
        Ok(sig)
    }

    fn parse_enum_ref(&mut self) -> anyhow::Result<Rc<EnumSig>> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.enums.lookup(id) {
            let sig = Rc::clone(&entry.sig);
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                read_enum_def(self.file.as_mut(), id)?;
            }
            return Ok(sig);
        }
        let def_offset = self.file.current_offset();
        let sig = Rc::new(read_enum_def(self.file.as_mut(), id)?);
        self.enums.insert(id, Rc::clone(&sig), def_offset)?;
        Ok(sig)
    }

    fn parse_bitmask_ref(&mut self) -> anyhow::Result<Rc<BitmaskSig>> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.bitmasks.lookup(id) {
            let sig = Rc::clone(&entry.sig);
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                read_bitmask_def(self.file.as_mut(), id)?;
            }
            return Ok(sig);
        }
        let def_offset = self.file.current_offset();
        let sig = Rc::new(read_bitmask_def(self.file.as_mut(), id)?);
        self.bitmasks.insert(id, Rc::clone(&sig), def_offset)?;
        Ok(sig)
    }

    fn parse_frame_ref(&mut self) -> anyhow::Result<Rc<StackFrame>> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.frames.lookup(id) {
            let sig = Rc::clone(&entry.sig);
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                read_frame_def(self.file.as_mut(), id)?;
            }
            return Ok(sig);
        }
        let def_offset = self.file.current_offset();
        let sig = Rc::new(read_frame_def(self.file.as_mut(), id)?);
        self.frames.insert(id, Rc::clone(&sig), def_offset)?;
        Ok(sig)
    }

    /// Legacy enum definition: one `(name, value)` pair per event.
    fn parse_old_enum(&mut self) -> anyhow::Result<()> {
        let id = read_sig_id(self.file.as_mut())?;
        if let Some(entry) = self.enums.lookup(id) {
            let def_offset = entry.def_offset;
            if self.revisits(def_offset) {
                wire::read_string(self.file.as_mut())?;
                wire::read_sint_packed(self.file.as_mut())?;
            }
            return Ok(());
        }
        let def_offset = self.file.current_offset();
        let name = wire::read_string(self.file.as_mut())?;
        let value = wire::read_sint_packed(self.file.as_mut())?;
        let sig = Rc::new(EnumSig {
            id,
            name: String::new(),
            values: vec![(name, value)],
        });
        self.enums.insert(id, sig, def_offset)?;
        Ok(())
    }

    fn revisits(&self, def_offset: Offset) -> bool {
        self.file.supports_offsets() && self.file.current_offset() == def_offset
    }
}

impl AbstractParser for Parser {
    fn parse_call(&mut self) -> anyhow::Result<Option<Rc<Call>>> {
        self.parse_call_mode(Mode::Full)
    }

    fn supports_bookmarks(&self) -> bool {
        self.file.supports_offsets()
    }

    fn get_bookmark(&self) -> ParseBookmark {
        ParseBookmark {
            offset: self.file.current_offset(),
            next_call_no: self.next_call_no,
        }
    }

    fn set_bookmark(&mut self, bookmark: ParseBookmark) -> bool {
        if !self.file.supports_offsets() {
            return false;
        }
        if !self.file.set_current_offset(bookmark.offset) {
            return false;
        }
        self.next_call_no = bookmark.next_call_no;
        self.open_calls.clear();
        self.eof = false;
        true
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

// ── Definition bodies ──────────────────────────────────────────────────────

fn read_sig_id(file: &mut dyn File) -> anyhow::Result<Id> {
    let id = wire::read_varint(file)?;
    if id >= MAX_SIG_ID {
        bail!("implausible signature id {id} in call stream");
    }
    Ok(id as Id)
}

fn read_function_def(file: &mut dyn File, id: Id) -> anyhow::Result<FunctionSig> {
    let name = wire::read_string(file)?;
    let count = wire::read_length(file)?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(wire::read_string(file)?);
    }
    let flags = crate::callflags::lookup_call_flags(&name);
    Ok(FunctionSig {
        id,
        name,
        args,
        flags,
    })
}

fn read_struct_def(file: &mut dyn File, id: Id) -> anyhow::Result<StructSig> {
    let name = wire::read_string(file)?;
    let count = wire::read_length(file)?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(wire::read_string(file)?);
    }
    Ok(StructSig { id, name, members })
}

fn read_enum_def(file: &mut dyn File, id: Id) -> anyhow::Result<EnumSig> {
    let name = wire::read_string(file)?;
    let count = wire::read_length(file)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let value_name = wire::read_string(file)?;
        let value = wire::read_sint_packed(file)?;
        values.push((value_name, value));
    }
    Ok(EnumSig { id, name, values })
}

fn read_bitmask_def(file: &mut dyn File, id: Id) -> anyhow::Result<BitmaskSig> {
    let count = wire::read_length(file)?;
    let mut flags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flag_name = wire::read_string(file)?;
        let value = wire::read_uint_packed(file)?;
        flags.push((flag_name, value));
    }
    Ok(BitmaskSig { id, flags })
}

fn read_frame_def(file: &mut dyn File, id: Id) -> anyhow::Result<StackFrame> {
    use crate::wire::frame_field;
    let present = wire::read_byte(file)?;
    let mut frame = StackFrame {
        id,
        ..StackFrame::default()
    };
    if present & frame_field::MODULE != 0 {
        frame.module = Some(wire::read_string(file)?);
    }
    if present & frame_field::FUNCTION != 0 {
        frame.function = Some(wire::read_string(file)?);
    }
    if present & frame_field::FILENAME != 0 {
        frame.filename = Some(wire::read_string(file)?);
    }
    if present & frame_field::LINE != 0 {
        frame.line = Some(wire::read_varint(file)?);
    }
    if present & frame_field::OFFSET != 0 {
        frame.offset = Some(wire::read_varint(file)?);
    }
    Ok(frame)
}

fn read_properties(file: &mut dyn File) -> anyhow::Result<BTreeMap<String, String>> {
    let mut properties = BTreeMap::new();
    loop {
        let mut line = Vec::new();
        loop {
            match file.getc() {
                Some(b'\n') => break,
                Some(byte) => line.push(byte),
                None => bail!("trace ended inside its properties header"),
            }
        }
        if line.is_empty() {
            return Ok(properties);
        }
        let text = String::from_utf8_lossy(&line);
        let (key, value) = text
            .split_once('=')
            .with_context(|| format!("malformed property line {text:?}"))?;
        properties.insert(key.to_string(), value.to_string());
    }
}
