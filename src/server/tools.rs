//! Tool implementations: the operations external clients can invoke on
//! debugging sessions, plus their self-describing schemas.

use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest, BreakpointView};
use crate::debugger::error::Error;
use crate::debugger::register::{Registers, LIST as REGISTER_LIST};
use crate::debugger::StateSnapshot;
use crate::server::session::{SessionId, SessionManager};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

const TOOL_NAMES: [&str; 11] = [
    "create_session",
    "close_session",
    "run",
    "continue",
    "step",
    "set_breakpoint",
    "list_breakpoints",
    "remove_breakpoint",
    "get_registers",
    "list_modules",
    "get_source",
];

pub fn is_tool(name: &str) -> bool {
    TOOL_NAMES.contains(&name)
}

#[derive(Deserialize)]
struct CreateSessionParams {
    exe_path: String,
    #[serde(default)]
    source_dirs: Vec<String>,
}

#[derive(Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Deserialize)]
struct ContinueParams {
    session_id: String,
    #[serde(default)]
    pass_exception: bool,
}

#[derive(Deserialize)]
struct SetBreakpointParams {
    session_id: String,
    location: String,
}

#[derive(Deserialize)]
struct RemoveBreakpointParams {
    session_id: String,
    breakpoint_id: String,
}

#[derive(Deserialize)]
struct GetSourceParams {
    session_id: String,
    path: String,
    line: u64,
    context: Option<u64>,
}

pub fn call_tool(manager: &SessionManager, name: &str, args: &Value) -> Result<Value, Error> {
    match name {
        "create_session" => {
            let params: CreateSessionParams = parse(args)?;
            let source_dirs = params.source_dirs.into_iter().map(PathBuf::from).collect();
            let id = manager.create_session(PathBuf::from(&params.exe_path), source_dirs)?;
            Ok(json!({
                "session_id": id.to_string(),
                "state": "created",
            }))
        }
        "close_session" => {
            let params: SessionParams = parse(args)?;
            let id = SessionId::parse(&params.session_id)?;
            Ok(json!({ "closed": manager.close_session(id) }))
        }
        "run" => {
            let session = session(manager, args)?;
            let state = session.run()?;
            Ok(state_json(&state))
        }
        "continue" => {
            let params: ContinueParams = parse(args)?;
            let session = manager.get(SessionId::parse(&params.session_id)?)?;
            let state = session.resume(params.pass_exception)?;
            Ok(state_json(&state))
        }
        "step" => {
            let session = session(manager, args)?;
            let state = session.step()?;
            Ok(state_json(&state))
        }
        "set_breakpoint" => {
            let params: SetBreakpointParams = parse(args)?;
            let session = manager.get(SessionId::parse(&params.session_id)?)?;
            let request: BreakpointRequest = params.location.parse()?;
            let view = session.set_breakpoint(request)?;
            Ok(breakpoint_json(&view))
        }
        "list_breakpoints" => {
            let session = session(manager, args)?;
            let views = session.list_breakpoints()?;
            let breakpoints: Vec<Value> = views.iter().map(breakpoint_json).collect();
            Ok(json!({ "breakpoints": breakpoints }))
        }
        "remove_breakpoint" => {
            let params: RemoveBreakpointParams = parse(args)?;
            let session = manager.get(SessionId::parse(&params.session_id)?)?;
            let id = parse_breakpoint_id(&params.breakpoint_id)?;
            session.remove_breakpoint(id)?;
            Ok(json!({ "removed": true }))
        }
        "get_registers" => {
            let session = session(manager, args)?;
            let (thread_id, regs) = session.registers()?;
            Ok(json!({
                "thread_id": thread_id,
                "registers": registers_json(&regs),
            }))
        }
        "list_modules" => {
            let session = session(manager, args)?;
            let modules: Vec<Value> = session
                .list_modules()?
                .iter()
                .map(|m| {
                    json!({
                        "name": m.name,
                        "path": m.path,
                        "base_address": m.base.to_string(),
                        "size": m.size,
                        "has_debug_info": m.has_debug_info,
                        "export_count": m.export_count,
                    })
                })
                .collect();
            Ok(json!({ "modules": modules }))
        }
        "get_source" => {
            let params: GetSourceParams = parse(args)?;
            let session = manager.get(SessionId::parse(&params.session_id)?)?;
            let context = params.context.unwrap_or(5);
            let snippet = session
                .source_resolver
                .snippet(&params.path, params.line, context)?;
            let lines: Vec<Value> = snippet
                .lines
                .iter()
                .map(|(number, text)| json!({ "line": number, "text": text }))
                .collect();
            Ok(json!({
                "full_path": snippet.path.to_string_lossy(),
                "lines": lines,
            }))
        }
        other => Err(Error::InvalidArguments(format!("unknown tool: {other}"))),
    }
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T, Error> {
    serde_json::from_value(args.clone()).map_err(|e| Error::InvalidArguments(e.to_string()))
}

fn session(
    manager: &SessionManager,
    args: &Value,
) -> Result<std::sync::Arc<crate::server::session::Session>, Error> {
    let params: SessionParams = parse(args)?;
    manager.get(SessionId::parse(&params.session_id)?)
}

fn parse_breakpoint_id(s: &str) -> Result<BreakpointId, Error> {
    s.strip_prefix("bp_")
        .and_then(|n| n.parse::<u32>().ok())
        .map(BreakpointId)
        .ok_or_else(|| Error::InvalidBreakpointId(s.to_string()))
}

/// State report attached to every call that may change execution state.
pub fn state_json(snapshot: &StateSnapshot) -> Value {
    let mut state = json!({ "state": snapshot.status.as_str() });
    let obj = state.as_object_mut().expect("object literal");
    if let Some(pid) = snapshot.process_id {
        obj.insert("process_id".into(), json!(pid));
    }
    if let Some(code) = snapshot.exit_code {
        obj.insert("exit_code".into(), json!(code));
    }
    if let Some(event) = snapshot.last_event {
        obj.insert("last_event".into(), json!(event.as_str()));
    }
    if let Some(ref stop) = snapshot.stop {
        obj.insert("stop_reason".into(), json!(stop.reason.as_str()));
        if let Some(addr) = stop.address {
            obj.insert("stop_address".into(), json!(addr.to_string()));
        }
        if let Some(tid) = stop.thread_id {
            obj.insert("thread_id".into(), json!(tid));
        }
        if let Some(code) = stop.exception_code {
            obj.insert("exception_code".into(), json!(format!("{code:#010x}")));
        }
        if let Some(ref module) = stop.module {
            obj.insert("module".into(), json!(module));
        }
        if let Some(ref place) = stop.place {
            obj.insert(
                "source".into(),
                json!({
                    "file": place.file.to_string_lossy(),
                    "line": place.line,
                    "column": place.column,
                }),
            );
        }
    }
    state
}

fn breakpoint_json(view: &BreakpointView) -> Value {
    let mut bp = json!({
        "breakpoint_id": format!("bp_{}", view.id),
        "state": view.state,
        "location": view.request,
        "enabled": view.enabled,
        "hit_count": view.hit_count,
    });
    let obj = bp.as_object_mut().expect("object literal");
    if let Some(addr) = view.address {
        obj.insert("address".into(), json!(addr.to_string()));
    }
    if let Some(ref file) = view.file {
        obj.insert("file".into(), json!(file));
    }
    if let Some(line) = view.line {
        obj.insert("line".into(), json!(line));
    }
    if let Some(ref module) = view.module {
        obj.insert("module".into(), json!(module));
    }
    if let Some(ref symbol) = view.symbol {
        obj.insert("symbol".into(), json!(symbol));
    }
    bp
}

fn registers_json(regs: &Registers) -> Value {
    let mut map = serde_json::Map::new();
    for d in REGISTER_LIST.iter() {
        map.insert(d.name.to_string(), json!(format!("{:#010x}", regs.get(d.r))));
    }
    Value::Object(map)
}

/// Self-describing tool list for `tools/list`.
pub fn descriptors() -> Vec<Value> {
    let session_only = json!({
        "type": "object",
        "properties": { "session_id": { "type": "string" } },
        "required": ["session_id"],
    });
    vec![
        json!({
            "name": "create_session",
            "description": "Create a debugging session for a Windows PE executable",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "exe_path": { "type": "string", "description": "Path to the executable" },
                    "source_dirs": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Additional source directories to search",
                    },
                },
                "required": ["exe_path"],
            },
        }),
        json!({
            "name": "close_session",
            "description": "Close a debugging session and release its debuggee",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "run",
            "description": "Process debug events until the debuggee stops at its entry point",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "continue",
            "description": "Continue a stopped debuggee",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "pass_exception": {
                        "type": "boolean",
                        "description": "Pass the pending exception on to the debuggee",
                    },
                },
                "required": ["session_id"],
            },
        }),
        json!({
            "name": "step",
            "description": "Execute a single CPU instruction",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "set_breakpoint",
            "description": "Set a breakpoint at `file:line` or a hex address",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "location": { "type": "string", "description": "`file:line` or `0xADDRESS`" },
                },
                "required": ["session_id", "location"],
            },
        }),
        json!({
            "name": "list_breakpoints",
            "description": "List all breakpoints with their state",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "remove_breakpoint",
            "description": "Remove a breakpoint",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "breakpoint_id": { "type": "string" },
                },
                "required": ["session_id", "breakpoint_id"],
            },
        }),
        json!({
            "name": "get_registers",
            "description": "Read the CPU registers of the stopped thread",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "list_modules",
            "description": "List loaded modules and their debug info availability",
            "inputSchema": session_only.clone(),
        }),
        json!({
            "name": "get_source",
            "description": "Read source lines around a location",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "path": { "type": "string" },
                    "line": { "type": "integer" },
                    "context": { "type": "integer", "description": "Context lines, default 5" },
                },
                "required": ["session_id", "path", "line"],
            },
        }),
    ]
}
