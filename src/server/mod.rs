//! JSON-RPC 2.0 tool server over HTTP.
//!
//! The request surface is deliberately thin: it validates the envelope and
//! forwards tool calls to [`session::SessionManager`]. Request handling
//! threads never touch OS debug APIs, every debugging call is relayed to the
//! owning session worker.

pub mod http;
pub mod proto;
pub mod session;
pub mod source;
pub mod tools;

use crate::server::http::HttpIo;
use crate::server::session::SessionManager;
use anyhow::Context;
use log::{info, warn};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Accept connections until the listener fails. With `oneshot` the server
/// handles a single connection and exits, useful for harnesses.
pub fn serve(listen: &str, oneshot: bool) -> anyhow::Result<()> {
    let manager = Arc::new(SessionManager::new());
    let listener = TcpListener::bind(listen).with_context(|| format!("bind {listen}"))?;
    info!(target: "server", "listening on {listen}");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "server", "accept: {e}");
                continue;
            }
        };

        if oneshot {
            handle_connection(&manager, stream);
            break;
        }
        let manager = manager.clone();
        thread::spawn(move || handle_connection(&manager, stream));
    }

    manager.close_all();
    Ok(())
}

fn handle_connection(manager: &SessionManager, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let mut io = match HttpIo::new(stream) {
        Ok(io) => io,
        Err(e) => {
            warn!(target: "server", "{peer}: connection setup: {e:#}");
            return;
        }
    };

    loop {
        let request = match io.read_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "server", "{peer}: {e:#}");
                break;
            }
        };

        if request.method != "POST" {
            let body = br#"{"error":"only POST is supported"}"#;
            if io.write_json(405, body).is_err() {
                break;
            }
            continue;
        }

        let response = proto::handle_request(manager, &request.body);
        if io.write_json(200, &response).is_err() {
            break;
        }
        if !request.keep_alive {
            break;
        }
    }
}
