//! Call-stream codec tests: value-tree round trips, scan/full equivalence,
//! bookmarks, flag classification, and last-frame looping.

use std::collections::BTreeMap;
use std::rc::Rc;

use retrace_model::wire::{self, event, ty};
use retrace_model::{
    lookup_call_flags, AbstractParser, BitmaskSig, Call, CallWriter, EnumSig, FunctionSig,
    LastFrameLoopParser, ParseBookmark, Parser, StackFrame, StructSig, Value,
    CALL_FLAG_END_FRAME, CALL_FLAG_INCOMPLETE, CALL_FLAG_MARKER_PUSH, CALL_FLAG_NO_SIDE_EFFECTS,
    CALL_FLAG_RENDER,
    CALL_FLAG_SWAP_RENDERTARGET, CALL_FLAG_VERBOSE,
};
use retrace_stream::{OutStream, SnappyFile, SnappyStream};

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("retrace_model_test_{}.trace", name))
}

fn props() -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("version".to_string(), "7".to_string());
    properties.insert("semantic-version".to_string(), "0.4.1".to_string());
    properties.insert("process".to_string(), "demo".to_string());
    properties
}

fn fsig(id: u32, name: &str, args: &[&str]) -> Rc<FunctionSig> {
    Rc::new(FunctionSig {
        id,
        name: name.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        flags: lookup_call_flags(name),
    })
}

fn call(sig: &Rc<FunctionSig>, args: Vec<Value>, ret: Option<Value>) -> Call {
    Call {
        no: 0,
        thread_id: 1,
        sig: Rc::clone(sig),
        flags: sig.flags,
        args,
        ret,
        backtrace: None,
    }
}

/// Write `calls` into a small-chunked snappy container so even short
/// traces cross chunk boundaries.
fn write_trace(name: &str, calls: &[Call]) -> std::path::PathBuf {
    let path = temp_path(name);
    let stream = SnappyStream::with_chunk_size(&path, 256).unwrap();
    let mut writer = CallWriter::new(Box::new(stream), &props()).unwrap();
    for c in calls {
        writer.write_call(c).unwrap();
    }
    drop(writer.into_stream());
    path
}

fn open_parser(path: &std::path::Path) -> Parser {
    Parser::open(Box::new(SnappyFile::open(path).unwrap())).unwrap()
}

// ── Value round trips ──────────────────────────────────────────────────────

#[test]
fn test_nested_struct_array_blob_roundtrip() {
    let struct_sig = Rc::new(StructSig {
        id: 0,
        name: "PixelRegion".to_string(),
        members: vec!["levels".to_string(), "label".to_string()],
    });
    let nested = Value::Struct(
        Rc::clone(&struct_sig),
        vec![
            Value::Array(vec![
                Value::Blob(vec![0x00, 0xFF, 0x7E, 0x81]),
                Value::Blob((0..513u32).map(|b| b as u8).collect()),
                Value::Blob(Vec::new()),
            ]),
            Value::String("mip chain".to_string()),
        ],
    );

    let sig = fsig(0, "glTexImage2D", &["region"]);
    let path = write_trace("nested_roundtrip", &[call(&sig, vec![nested.clone()], None)]);

    let mut parser = open_parser(&path);
    let parsed = parser.parse_call().unwrap().expect("one call");
    assert_eq!(parsed.no, 0);
    assert_eq!(parsed.name(), "glTexImage2D");
    assert_eq!(parsed.args.len(), 1);
    assert_eq!(parsed.args[0], nested, "value tree must reconstruct exactly");
    assert!(parser.parse_call().unwrap().is_none());
}

#[test]
fn test_scalar_bit_patterns_survive() {
    // -0.0 compares equal to 0.0, so the assertion has to look at bits.
    let f = -0.0f32;
    let d = f64::MIN_POSITIVE;
    let sig = fsig(0, "glUniform2f", &["x", "y"]);
    let path = write_trace(
        "bit_patterns",
        &[call(&sig, vec![Value::Float(f), Value::Double(d)], None)],
    );

    let mut parser = open_parser(&path);
    let parsed = parser.parse_call().unwrap().unwrap();
    let Value::Float(pf) = parsed.args[0] else {
        panic!("expected float argument");
    };
    let Value::Double(pd) = parsed.args[1] else {
        panic!("expected double argument");
    };
    assert_eq!(pf.to_bits(), f.to_bits());
    assert_eq!(pd.to_bits(), d.to_bits());
}

#[test]
fn test_every_value_kind_roundtrip() {
    let enum_sig = Rc::new(EnumSig {
        id: 0,
        name: "GLenum".to_string(),
        values: vec![
            ("GL_TRIANGLES".to_string(), 4),
            ("GL_NO_ERROR".to_string(), 0),
        ],
    });
    let bitmask_sig = Rc::new(BitmaskSig {
        id: 0,
        flags: vec![
            ("GL_COLOR_BUFFER_BIT".to_string(), 0x4000),
            ("GL_DEPTH_BUFFER_BIT".to_string(), 0x100),
        ],
    });
    let args = vec![
        Value::Null,
        Value::Bool(true),
        Value::Bool(false),
        Value::SInt(-123456789),
        Value::UInt(0xFFFF_FFFF_FFFF),
        Value::String("shader source".to_string()),
        Value::WString("wide title".to_string()),
        Value::Enum(Rc::clone(&enum_sig), 4),
        Value::Bitmask(Rc::clone(&bitmask_sig), 0x4100),
        Value::Pointer(0x7fff_dead_b000),
        Value::Repr(
            Box::new(Value::String("1.5 KB".to_string())),
            Box::new(Value::UInt(1536)),
        ),
        Value::Array(vec![Value::SInt(0), Value::SInt(-1), Value::SInt(127)]),
    ];
    let arg_names: Vec<String> = (0..args.len()).map(|i| format!("a{i}")).collect();
    let names: Vec<&str> = arg_names.iter().map(String::as_str).collect();
    let sig = fsig(0, "glKitchenSink", &names);

    let mut c = call(&sig, args.clone(), Some(Value::Enum(Rc::clone(&enum_sig), 0)));
    c.backtrace = Some(vec![
        Rc::new(StackFrame {
            id: 0,
            module: Some("libGL.so.1".to_string()),
            function: Some("glKitchenSink".to_string()),
            filename: None,
            line: None,
            offset: Some(0x40),
        }),
        Rc::new(StackFrame {
            id: 1,
            module: Some("demo".to_string()),
            function: Some("render".to_string()),
            filename: Some("demo.c".to_string()),
            line: Some(42),
            offset: None,
        }),
    ]);
    let expected_backtrace = c.backtrace.clone();

    let path = write_trace("all_kinds", &[c]);
    let mut parser = open_parser(&path);
    let parsed = parser.parse_call().unwrap().unwrap();
    assert_eq!(parsed.args, args);
    assert_eq!(parsed.ret, Some(Value::Enum(enum_sig, 0)));
    assert_eq!(parsed.backtrace, expected_backtrace);
}

// ── Scan mode ──────────────────────────────────────────────────────────────

#[test]
fn test_scan_and_full_advance_identically() {
    let enum_sig = Rc::new(EnumSig {
        id: 0,
        name: "GLenum".to_string(),
        values: vec![("GL_TRIANGLES".to_string(), 4)],
    });
    let struct_sig = Rc::new(StructSig {
        id: 0,
        name: "Rect".to_string(),
        members: vec!["w".to_string(), "h".to_string()],
    });
    let draw = fsig(0, "glDrawArrays", &["mode", "first", "count"]);
    let blobby = fsig(1, "glBufferData", &["size", "data", "extra"]);
    let calls = vec![
        call(
            &draw,
            vec![
                Value::Enum(Rc::clone(&enum_sig), 4),
                Value::SInt(0),
                Value::SInt(600),
            ],
            None,
        ),
        call(
            &blobby,
            vec![
                Value::UInt(512),
                Value::Blob((0..512u32).map(|b| (b ^ 0x5A) as u8).collect()),
                Value::Struct(
                    Rc::clone(&struct_sig),
                    vec![Value::UInt(16), Value::UInt(9)],
                ),
            ],
            Some(Value::Null),
        ),
        call(&draw, vec![Value::Enum(enum_sig, 4), Value::SInt(3), Value::SInt(3)], None),
    ];
    let path = write_trace("scan_vs_full", &calls);

    let mut full = open_parser(&path);
    let mut scan = open_parser(&path);
    loop {
        let a = full.parse_call().unwrap();
        let b = scan.scan_call().unwrap();
        assert_eq!(a.is_some(), b.is_some());
        assert_eq!(
            full.get_bookmark(),
            scan.get_bookmark(),
            "scan must advance the stream exactly like full parsing"
        );
        match (a, b) {
            (Some(a), Some(b)) => {
                assert_eq!(a.no, b.no);
                assert_eq!(a.name(), b.name());
                assert!(b.args.is_empty(), "scan discards payloads");
            }
            _ => break,
        }
    }
}

// ── Bookmarks ──────────────────────────────────────────────────────────────

#[test]
fn test_bookmark_resume_reproduces_calls() {
    let draw = fsig(0, "glDrawArrays", &["mode"]);
    let swap = fsig(1, "eglSwapBuffers", &[]);
    let calls: Vec<Call> = (0..8)
        .map(|i| {
            if i % 2 == 0 {
                call(&draw, vec![Value::SInt(i)], None)
            } else {
                call(&swap, vec![], Some(Value::Bool(true)))
            }
        })
        .collect();
    let path = write_trace("bookmark_resume", &calls);

    let mut parser = open_parser(&path);
    assert!(parser.supports_bookmarks());
    for _ in 0..3 {
        parser.parse_call().unwrap().unwrap();
    }
    let bookmark = parser.get_bookmark();
    assert_eq!(bookmark.next_call_no, 3);

    let first_pass: Vec<(u64, String)> = drain(&mut parser);
    assert!(parser.set_bookmark(bookmark));
    let second_pass: Vec<(u64, String)> = drain(&mut parser);
    assert_eq!(first_pass, second_pass);
    assert_eq!(first_pass.first().map(|(no, _)| *no), Some(3));
}

fn drain(parser: &mut dyn AbstractParser) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    while let Some(c) = parser.parse_call().unwrap() {
        out.push((c.no, c.name().to_string()));
    }
    out
}

// ── Flag classification ────────────────────────────────────────────────────

#[test]
fn test_call_flag_lookup() {
    // Exact table entries.
    assert_eq!(lookup_call_flags("glDrawArrays"), CALL_FLAG_RENDER);
    assert_eq!(
        lookup_call_flags("eglSwapBuffers"),
        CALL_FLAG_SWAP_RENDERTARGET | CALL_FLAG_END_FRAME
    );
    assert_eq!(lookup_call_flags("glGetError"), CALL_FLAG_NO_SIDE_EFFECTS);
    assert!(lookup_call_flags("glPushDebugGroup") & CALL_FLAG_MARKER_PUSH != 0);

    // Fallback classification for names absent from the table.
    assert_eq!(lookup_call_flags("glDrawMeshTasksNV"), CALL_FLAG_RENDER);
    assert_eq!(lookup_call_flags("glMultiDrawElementsIndirectCountARB"), CALL_FLAG_RENDER);
    assert_eq!(
        lookup_call_flags("glGetIntegerv"),
        CALL_FLAG_NO_SIDE_EFFECTS | CALL_FLAG_VERBOSE
    );
    assert_eq!(
        lookup_call_flags("wglSwapBuffersMscOML"),
        CALL_FLAG_SWAP_RENDERTARGET | CALL_FLAG_END_FRAME
    );

    // Known family, no classification.
    assert_eq!(lookup_call_flags("glViewport"), 0);
    // Unknown family.
    assert_eq!(lookup_call_flags("mysteryEntryPoint"), 0);
}

#[test]
fn test_error_query_no_error_is_verbose() {
    let geterr = fsig(0, "glGetError", &[]);
    let calls = vec![
        call(&geterr, vec![], Some(Value::UInt(0))),
        call(&geterr, vec![], Some(Value::UInt(0x0502))),
    ];
    let path = write_trace("error_query", &calls);

    let mut parser = open_parser(&path);
    let quiet = parser.parse_call().unwrap().unwrap();
    let loud = parser.parse_call().unwrap().unwrap();
    assert!(quiet.has_flag(CALL_FLAG_VERBOSE), "no-error result is noise");
    assert!(!loud.has_flag(CALL_FLAG_VERBOSE), "a real error is interesting");
}

// ── Last-frame looping ─────────────────────────────────────────────────────

/// Wrapper counting how often the wrapped parser is consulted.
struct CountingParser {
    inner: Parser,
    calls: u64,
}

impl AbstractParser for CountingParser {
    fn parse_call(&mut self) -> anyhow::Result<Option<Rc<Call>>> {
        self.calls += 1;
        self.inner.parse_call()
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

#[test]
fn test_last_frame_loop_replays_identically() {
    let clear = fsig(0, "glClear", &["mask"]);
    let draw = fsig(1, "glDrawArrays", &["mode"]);
    let swap = fsig(2, "eglSwapBuffers", &[]);
    let calls = vec![
        call(&clear, vec![Value::UInt(0x4000)], None),
        call(&swap, vec![], Some(Value::Bool(true))),
        call(&draw, vec![Value::SInt(4)], None),
        call(&swap, vec![], Some(Value::Bool(true))),
    ];
    let path = write_trace("last_frame_loop", &calls);

    const LOOPS: u64 = 3;
    let counting = CountingParser {
        inner: open_parser(&path),
        calls: 0,
    };
    let mut looper = LastFrameLoopParser::new(counting, LOOPS);

    let mut sequence: Vec<(u64, String)> = Vec::new();
    while let Some(c) = looper.parse_call().unwrap() {
        sequence.push((c.no, c.name().to_string()));
    }

    // Normal pass over all four calls, then the last frame three times.
    let mut expected: Vec<(u64, String)> = vec![
        (0, "glClear".to_string()),
        (1, "eglSwapBuffers".to_string()),
        (2, "glDrawArrays".to_string()),
        (3, "eglSwapBuffers".to_string()),
    ];
    for _ in 0..LOOPS {
        expected.push((2, "glDrawArrays".to_string()));
        expected.push((3, "eglSwapBuffers".to_string()));
    }
    assert_eq!(sequence, expected);
}

#[test]
fn test_last_frame_loop_leaves_inner_alone_once_cached() {
    let draw = fsig(0, "glDrawArrays", &["mode"]);
    let swap = fsig(1, "eglSwapBuffers", &[]);
    let calls = vec![
        call(&draw, vec![Value::SInt(1)], None),
        call(&swap, vec![], None),
        call(&draw, vec![Value::SInt(2)], None),
        call(&swap, vec![], None),
    ];
    let path = write_trace("loop_isolation", &calls);

    let counting = CountingParser {
        inner: open_parser(&path),
        calls: 0,
    };
    let mut looper = LastFrameLoopParser::new(counting, 10);

    // Drain the normal pass; the fifth call comes out of the fresh cache.
    for _ in 0..5 {
        looper.parse_call().unwrap().unwrap();
    }

    let mut served = 0;
    while let Some(_c) = looper.parse_call().unwrap() {
        served += 1;
        if served > 100 {
            panic!("loop failed to terminate");
        }
    }
    let counting = looper.into_inner();
    // Normal pass: 4 calls + 1 EOF probe. Cache build: 2 calls + 1 EOF.
    assert_eq!(counting.calls, 8, "inner parser touched during replay");
}

// ── Hand-built streams: legacy events, truncation ──────────────────────────

/// Write a raw event stream (already including the properties block) into
/// a snappy container.
fn write_raw(name: &str, payload: &[u8]) -> std::path::PathBuf {
    let path = temp_path(name);
    let mut stream = SnappyStream::with_chunk_size(&path, 256).unwrap();
    assert!(stream.write(payload));
    stream.finish().unwrap();
    path
}

#[test]
fn test_standalone_definitions_and_old_enum() {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"version=7\n\n");

    // Legacy one-pair enum definition, then a standalone function
    // definition, then a call referencing both purely by id.
    raw.push(event::SIG_OLD_ENUM);
    wire::put_varint(&mut raw, 0);
    wire::put_string(&mut raw, "GL_INVALID_ENUM");
    wire::put_sint_packed(&mut raw, 0x0500);

    raw.push(event::SIG_FUNCTION);
    wire::put_varint(&mut raw, 0);
    wire::put_string(&mut raw, "glCheck");
    wire::put_varint(&mut raw, 1);
    wire::put_string(&mut raw, "code");

    raw.push(event::ENTER);
    wire::put_varint(&mut raw, 9); // thread id
    wire::put_varint(&mut raw, 0); // function back-reference
    raw.push(ty::ENUM);
    wire::put_varint(&mut raw, 0); // enum back-reference
    wire::put_sint_packed(&mut raw, 0x0500);

    raw.push(event::LEAVE);
    raw.push(0); // no return value
    raw.push(0); // no backtrace

    let path = write_raw("old_enum", &raw);
    let mut parser = open_parser(&path);
    assert_eq!(parser.version(), 7);

    let parsed = parser.parse_call().unwrap().unwrap();
    assert_eq!(parsed.name(), "glCheck");
    assert_eq!(parsed.thread_id, 9);
    let Value::Enum(sig, value) = &parsed.args[0] else {
        panic!("expected enum argument");
    };
    assert_eq!(*value, 0x0500);
    assert_eq!(sig.lookup(0x0500), Some("GL_INVALID_ENUM"));
    assert!(parser.parse_call().unwrap().is_none());
}

#[test]
fn test_missing_leave_yields_incomplete_call() {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"version=7\n\n");

    raw.push(event::ENTER);
    wire::put_varint(&mut raw, 1);
    wire::put_varint(&mut raw, 0);
    wire::put_string(&mut raw, "glFinish");
    wire::put_varint(&mut raw, 0); // no declared arguments
    // Capture died here: no leave event.

    let path = write_raw("missing_leave", &raw);
    let mut parser = open_parser(&path);
    let parsed = parser.parse_call().unwrap().unwrap();
    assert_eq!(parsed.name(), "glFinish");
    assert!(parsed.has_flag(CALL_FLAG_INCOMPLETE));
    assert!(parsed.ret.is_none());
    assert!(parser.parse_call().unwrap().is_none());
}

#[test]
fn test_unexpected_tag_is_an_error_not_a_crash() {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"version=7\n\n");
    raw.push(0x6F); // not an event tag

    let path = write_raw("bad_tag", &raw);
    let mut parser = open_parser(&path);
    assert!(parser.parse_call().is_err());
}

#[test]
fn test_properties_roundtrip() {
    let draw = fsig(0, "glFlush", &[]);
    let path = write_trace("properties", &[call(&draw, vec![], None)]);
    let parser = open_parser(&path);
    assert_eq!(parser.version(), 7);
    assert_eq!(parser.semantic_version(), "0.4.1");
    assert_eq!(
        parser.properties().get("process").map(String::as_str),
        Some("demo")
    );
}
