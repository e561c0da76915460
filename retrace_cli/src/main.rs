use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::EnvFilter;

use retrace_model::{
    AbstractParser, Call, CallWriter, EnumSig, Parser, Value, CALL_FLAG_END_FRAME,
    CALL_FLAG_INCOMPLETE,
};
use retrace_stream::{
    container_kind, open_for_read, GzStream, OutStream, SnappyStream, ZstdSeekableStream,
};
use retrace_trim::CallSet;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(ClapParser)]
#[command(
    name = "retrace",
    about = "Inspect, dump, re-compress and trim captured API trace files",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print trace properties and call statistics (scan only, fast)
    Info {
        /// Trace file
        trace: PathBuf,
    },
    /// Decode calls and print them
    Dump {
        /// Trace file
        trace: PathBuf,
        /// Emit one JSON object per call instead of pretty text
        #[arg(long)]
        json: bool,
        /// Only dump these calls, e.g. "1,40-100,2000-"
        #[arg(long)]
        calls: Option<String>,
    },
    /// Re-compress a trace into another container format
    Repack {
        /// Source trace
        input: PathBuf,
        /// Destination trace
        output: PathBuf,
        /// Container codec: snappy | gzip | zstd
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        /// Zstd compression level (only used with --codec zstd)
        #[arg(long, default_value_t = 3)]
        zstd_level: i32,
    },
    /// Copy only the given calls into a new trace
    Trim {
        /// Source trace
        input: PathBuf,
        /// Destination trace
        output: PathBuf,
        /// Calls to keep, e.g. "1,40-100,2000-"
        #[arg(long)]
        calls: String,
        /// Container codec for the output: snappy | gzip | zstd
        #[arg(short, long, default_value = "snappy")]
        codec: String,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn stream_from_name(
    name: &str,
    path: &Path,
    zstd_level: i32,
) -> anyhow::Result<Box<dyn OutStream>> {
    match name {
        "snappy" | "s" => Ok(Box::new(SnappyStream::create(path)?)),
        "gzip" | "gz" => Ok(Box::new(GzStream::create(path)?)),
        "zstd" | "z" => Ok(Box::new(ZstdSeekableStream::with_options(
            path,
            retrace_stream::format::ZSTD_DEFAULT_FRAME_SIZE,
            zstd_level,
        )?)),
        other => anyhow::bail!("unknown codec '{}'. Valid options: snappy, gzip, zstd", other),
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

/// Symbolic rendering of an enum value, falling back to the number.
fn enum_name(sig: &EnumSig, value: i64) -> String {
    sig.lookup(value)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::SInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => format!("{v}"),
        Value::Double(v) => format!("{v}"),
        Value::String(s) => format!("{s:?}"),
        Value::WString(s) => format!("L{s:?}"),
        Value::Enum(sig, v) => enum_name(sig, *v),
        Value::Bitmask(sig, v) => format_bitmask(sig, *v),
        Value::Struct(sig, members) => {
            let fields: Vec<String> = sig
                .members
                .iter()
                .zip(members)
                .map(|(name, member)| format!("{name} = {}", format_value(member)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
        Value::Array(elements) => {
            let items: Vec<String> = elements.iter().map(format_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Blob(bytes) => format!("blob({})", bytes.len()),
        Value::Pointer(p) => format!("{p:#x}"),
        Value::Repr(human, _) => format_value(human),
    }
}

fn format_bitmask(sig: &retrace_model::BitmaskSig, value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut names = Vec::new();
    let mut remainder = value;
    for (name, bit) in &sig.flags {
        if *bit != 0 && remainder & bit == *bit {
            names.push(name.clone());
            remainder &= !bit;
        }
    }
    if remainder != 0 || names.is_empty() {
        names.push(format!("{remainder:#x}"));
    }
    names.join(" | ")
}

fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::SInt(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(s) | Value::WString(s) => json!(s),
        Value::Enum(sig, v) => json!(enum_name(sig, *v)),
        Value::Bitmask(sig, v) => json!(format_bitmask(sig, *v)),
        Value::Struct(sig, members) => {
            let fields: serde_json::Map<String, serde_json::Value> = sig
                .members
                .iter()
                .cloned()
                .zip(members.iter().map(value_to_json))
                .collect();
            serde_json::Value::Object(fields)
        }
        Value::Array(elements) => {
            json!(elements.iter().map(value_to_json).collect::<Vec<_>>())
        }
        Value::Blob(bytes) => json!({ "blob": bytes.len() }),
        Value::Pointer(p) => json!(format!("{p:#x}")),
        Value::Repr(human, machine) => {
            json!({ "repr": value_to_json(human), "value": value_to_json(machine) })
        }
    }
}

fn call_to_json(call: &Call) -> serde_json::Value {
    use serde_json::json;
    let args: Vec<serde_json::Value> = call
        .sig
        .args
        .iter()
        .zip(&call.args)
        .map(|(name, value)| json!({ "name": name, "value": value_to_json(value) }))
        .collect();
    let mut object = json!({
        "no": call.no,
        "thread": call.thread_id,
        "name": call.name(),
        "args": args,
    });
    if let Some(ret) = &call.ret {
        object["ret"] = value_to_json(ret);
    }
    object
}

fn print_call(call: &Call) {
    let args: Vec<String> = call
        .sig
        .args
        .iter()
        .zip(&call.args)
        .map(|(name, value)| format!("{name} = {}", format_value(value)))
        .collect();
    let ret = call
        .ret
        .as_ref()
        .map(|ret| format!(" = {}", format_value(ret)))
        .unwrap_or_default();
    let incomplete = if call.has_flag(CALL_FLAG_INCOMPLETE) {
        " // incomplete"
    } else {
        ""
    };
    println!(
        "{} @{} {}({}){}{}",
        call.no,
        call.thread_id,
        call.name(),
        args.join(", "),
        ret,
        incomplete
    );
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_info(trace: PathBuf) -> anyhow::Result<()> {
    let kind = container_kind(&trace)?;
    let file = open_for_read(&trace)?;
    let supports_offsets = file.supports_offsets();
    let mut parser = Parser::open(file)?;

    let t0 = Instant::now();
    let mut calls = 0u64;
    let mut frames = 0u64;
    let mut incomplete = 0u64;
    while let Some(call) = parser.scan_call()? {
        calls += 1;
        if call.has_flag(CALL_FLAG_END_FRAME) {
            frames += 1;
        }
        if call.has_flag(CALL_FLAG_INCOMPLETE) {
            incomplete += 1;
        }
    }
    let elapsed = t0.elapsed();

    let file_size = std::fs::metadata(&trace)?.len();
    println!("=== Trace: {} ===", trace.display());
    println!();
    println!("  container      : {kind}");
    println!("  seekable       : {}", if supports_offsets { "yes" } else { "no" });
    println!("  file on disk   : {}", human_bytes(file_size));
    println!("  format version : {}", parser.version());
    println!("  tool version   : {}", parser.semantic_version());
    println!("  calls          : {calls}");
    println!("  frames         : {frames}");
    if incomplete > 0 {
        println!("  incomplete     : {incomplete}");
    }
    println!();
    println!("  properties:");
    for (key, value) in parser.properties() {
        println!("    {key} = {value}");
    }
    eprintln!("  scanned in {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_dump(trace: PathBuf, json: bool, calls: Option<String>) -> anyhow::Result<()> {
    let keep = calls
        .as_deref()
        .map(CallSet::from_spec)
        .transpose()
        .context("parsing --calls")?;

    let file = open_for_read(&trace)?;
    let mut parser = Parser::open(file)?;
    while let Some(call) = parser.parse_call()? {
        if let Some(keep) = &keep {
            if !keep.contains(call.no) {
                continue;
            }
        }
        if json {
            println!("{}", serde_json::to_string(&call_to_json(&call))?);
        } else {
            print_call(&call);
        }
    }
    Ok(())
}

fn run_repack(
    input: PathBuf,
    output: PathBuf,
    codec: &str,
    zstd_level: i32,
) -> anyhow::Result<()> {
    let mut src = open_for_read(&input)?;
    let mut dst = stream_from_name(codec, &output, zstd_level)?;

    let t0 = Instant::now();
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf);
        if n == 0 {
            break;
        }
        anyhow::ensure!(dst.write(&buf[..n]), "writing {} failed", output.display());
        total += n as u64;
    }
    dst.flush();
    drop(dst);
    let elapsed = t0.elapsed();

    let out_size = std::fs::metadata(&output)?.len();
    eprintln!("  codec       : {codec}");
    eprintln!("  raw size    : {}", human_bytes(total));
    eprintln!("  compressed  : {}", human_bytes(out_size));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((total as f64 / elapsed.as_secs_f64()) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_trim(input: PathBuf, output: PathBuf, calls: &str, codec: &str) -> anyhow::Result<()> {
    let keep = CallSet::from_spec(calls).context("parsing --calls")?;
    anyhow::ensure!(!keep.is_empty(), "the call set to keep is empty");

    let file = open_for_read(&input)?;
    let mut parser = Parser::open(file)?;
    let stream = stream_from_name(codec, &output, retrace_stream::format::ZSTD_DEFAULT_LEVEL)?;
    let mut writer = CallWriter::new(stream, parser.properties())?;

    let t0 = Instant::now();
    let mut seen = 0u64;
    let mut kept = 0u64;
    while let Some(call) = parser.parse_call()? {
        seen += 1;
        if keep.contains(call.no) {
            writer.write_call(Rc::as_ref(&call))?;
            kept += 1;
        }
    }
    drop(writer.into_stream());
    let elapsed = t0.elapsed();

    eprintln!("  calls seen  : {seen}");
    eprintln!("  calls kept  : {kept}");
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info { trace } => run_info(trace),
        Commands::Dump { trace, json, calls } => run_dump(trace, json, calls),
        Commands::Repack {
            input,
            output,
            codec,
            zstd_level,
        } => run_repack(input, output, &codec, zstd_level),
        Commands::Trim {
            input,
            output,
            calls,
            codec,
        } => run_trim(input, output, &calls, &codec),
    }
}
