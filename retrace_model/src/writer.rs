use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, ensure};

use retrace_stream::OutStream;

use crate::call::Call;
use crate::sig::Id;
use crate::value::Value;
use crate::wire::{self, event, ty};

/// Encoder for the call stream, the mirror of [`crate::Parser`].
///
/// Feeds any [`OutStream`]; the container encoder handles compression and
/// finalization. Signature definitions are emitted inline at their first
/// use and by id afterwards, which is exactly the shape the parser's
/// arena-growth scheme expects. Each call is staged into one buffer and
/// handed to the stream in a single write, so a dying capture never leaves
/// half an event behind an already-flushed chunk boundary.
///
/// Used by the trimming tool to re-emit kept calls; the live capture layer
/// drives the identical interface.
pub struct CallWriter {
    out: Box<dyn OutStream>,
    functions: HashSet<Id>,
    structs: HashSet<Id>,
    enums: HashSet<Id>,
    bitmasks: HashSet<Id>,
    frames: HashSet<Id>,
}

impl CallWriter {
    /// Write the properties block and return the writer. `properties` must
    /// include the `version` key; keys and values must not contain `=` or
    /// newlines.
    pub fn new(
        mut out: Box<dyn OutStream>,
        properties: &BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        ensure!(
            properties.contains_key("version"),
            "trace properties must carry a version"
        );
        let mut buf = Vec::new();
        for (key, value) in properties {
            if key.contains(['=', '\n']) || value.contains('\n') {
                bail!("property {key:?} cannot be represented in the header");
            }
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'\n');
        }
        buf.push(b'\n');
        ensure!(out.write(&buf), "writing trace properties header failed");
        Ok(CallWriter {
            out,
            functions: HashSet::new(),
            structs: HashSet::new(),
            enums: HashSet::new(),
            bitmasks: HashSet::new(),
            frames: HashSet::new(),
        })
    }

    /// Emit one complete call: enter event, argument values, leave event.
    pub fn write_call(&mut self, call: &Call) -> anyhow::Result<()> {
        ensure!(
            call.args.len() == call.sig.args.len(),
            "call {} carries {} args but its signature declares {}",
            call.sig.name,
            call.args.len(),
            call.sig.args.len()
        );

        let mut buf = Vec::new();

        buf.push(event::ENTER);
        wire::put_varint(&mut buf, call.thread_id);
        self.put_function_ref(&mut buf, call);
        for arg in &call.args {
            self.put_value(&mut buf, arg);
        }

        buf.push(event::LEAVE);
        match &call.ret {
            Some(ret) => {
                buf.push(1);
                self.put_value(&mut buf, ret);
            }
            None => buf.push(0),
        }
        match &call.backtrace {
            Some(frames) => {
                buf.push(1);
                wire::put_varint(&mut buf, frames.len() as u64);
                for frame in frames {
                    self.put_frame_ref(&mut buf, frame);
                }
            }
            None => buf.push(0),
        }

        ensure!(
            self.out.write(&buf),
            "writing call {} to the trace failed",
            call.no
        );
        Ok(())
    }

    /// Flush the container encoder (ends its current chunk/frame early).
    pub fn flush(&mut self) {
        self.out.flush();
    }

    /// Consume the writer, returning the stream for finalization.
    pub fn into_stream(self) -> Box<dyn OutStream> {
        self.out
    }

    fn put_function_ref(&mut self, buf: &mut Vec<u8>, call: &Call) {
        let sig = &call.sig;
        wire::put_varint(buf, u64::from(sig.id));
        if self.functions.insert(sig.id) {
            wire::put_string(buf, &sig.name);
            wire::put_varint(buf, sig.args.len() as u64);
            for arg in &sig.args {
                wire::put_string(buf, arg);
            }
        }
    }

    fn put_frame_ref(&mut self, buf: &mut Vec<u8>, frame: &crate::sig::StackFrame) {
        use crate::wire::frame_field;
        wire::put_varint(buf, u64::from(frame.id));
        if self.frames.insert(frame.id) {
            let mut present = 0u8;
            if frame.module.is_some() {
                present |= frame_field::MODULE;
            }
            if frame.function.is_some() {
                present |= frame_field::FUNCTION;
            }
            if frame.filename.is_some() {
                present |= frame_field::FILENAME;
            }
            if frame.line.is_some() {
                present |= frame_field::LINE;
            }
            if frame.offset.is_some() {
                present |= frame_field::OFFSET;
            }
            buf.push(present);
            if let Some(module) = &frame.module {
                wire::put_string(buf, module);
            }
            if let Some(function) = &frame.function {
                wire::put_string(buf, function);
            }
            if let Some(filename) = &frame.filename {
                wire::put_string(buf, filename);
            }
            if let Some(line) = frame.line {
                wire::put_varint(buf, line);
            }
            if let Some(offset) = frame.offset {
                wire::put_varint(buf, offset);
            }
        }
    }

    fn put_value(&mut self, buf: &mut Vec<u8>, value: &Value) {
        match value {
            Value::Null => buf.push(ty::NULL),
            Value::Bool(false) => buf.push(ty::FALSE),
            Value::Bool(true) => buf.push(ty::TRUE),
            Value::SInt(v) => {
                buf.push(ty::SINT);
                wire::put_sint_packed(buf, *v);
            }
            Value::UInt(v) => {
                buf.push(ty::UINT);
                wire::put_uint_packed(buf, *v);
            }
            Value::Float(v) => {
                buf.push(ty::FLOAT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                buf.push(ty::DOUBLE);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::String(s) => {
                buf.push(ty::STRING);
                wire::put_string(buf, s);
            }
            Value::WString(s) => {
                buf.push(ty::WSTRING);
                wire::put_string(buf, s);
            }
            Value::Enum(sig, v) => {
                buf.push(ty::ENUM);
                wire::put_varint(buf, u64::from(sig.id));
                if self.enums.insert(sig.id) {
                    wire::put_string(buf, &sig.name);
                    wire::put_varint(buf, sig.values.len() as u64);
                    for (name, value) in &sig.values {
                        wire::put_string(buf, name);
                        wire::put_sint_packed(buf, *value);
                    }
                }
                wire::put_sint_packed(buf, *v);
            }
            Value::Bitmask(sig, v) => {
                buf.push(ty::BITMASK);
                wire::put_varint(buf, u64::from(sig.id));
                if self.bitmasks.insert(sig.id) {
                    wire::put_varint(buf, sig.flags.len() as u64);
                    for (name, bit) in &sig.flags {
                        wire::put_string(buf, name);
                        wire::put_uint_packed(buf, *bit);
                    }
                }
                wire::put_uint_packed(buf, *v);
            }
            Value::Struct(sig, members) => {
                buf.push(ty::STRUCT);
                wire::put_varint(buf, u64::from(sig.id));
                if self.structs.insert(sig.id) {
                    wire::put_string(buf, &sig.name);
                    wire::put_varint(buf, sig.members.len() as u64);
                    for member in &sig.members {
                        wire::put_string(buf, member);
                    }
                }
                for member in members {
                    self.put_value(buf, member);
                }
            }
            Value::Array(elements) => {
                buf.push(ty::ARRAY);
                wire::put_varint(buf, elements.len() as u64);
                for element in elements {
                    self.put_value(buf, element);
                }
            }
            Value::Blob(bytes) => {
                buf.push(ty::BLOB);
                wire::put_varint(buf, bytes.len() as u64);
                buf.extend_from_slice(bytes);
            }
            Value::Pointer(p) => {
                buf.push(ty::POINTER);
                wire::put_uint_packed(buf, *p);
            }
            Value::Repr(human, machine) => {
                buf.push(ty::REPR);
                self.put_value(buf, human);
                self.put_value(buf, machine);
            }
        }
    }
}
