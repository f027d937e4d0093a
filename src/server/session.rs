//! Session lifecycle and the bridge between request handlers and the
//! per-session debug-event loop.
//!
//! Every session owns exactly one worker thread. The debuggee is created on
//! that thread and every OS debugging call happens there, the Win32 Debug API
//! binds a debuggee to its creating thread. Request handlers talk to the
//! worker through a bounded command channel, every command carries its own
//! one-shot reply slot. The worker publishes a state snapshot after every
//! change, so reads never race the event loop.

use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest, BreakpointView};
use crate::debugger::debugee::registry::ModuleView;
use crate::debugger::process::{ContinueDisposition, ProcessDriver};
use crate::debugger::register::Registers;
use crate::debugger::{Debugger, Error, ExecutionStatus, StateSnapshot};
use crate::server::source::SourceResolver;
use crate::weak_error;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Poll period of the worker: the granularity at which it notices commands
/// while running and the close signal while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default deadline for run, continue and step to observe a stop.
const STOP_WAIT: Duration = Duration::from_secs(5);
/// Extra grace the conductor gives the worker on top of its own deadline.
const REPLY_GRACE: Duration = Duration::from_secs(3);
const COMMAND_QUEUE_DEPTH: usize = 8;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| Error::InvalidSession(s.to_string()))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

type Reply<T> = SyncSender<T>;

enum Command {
    Run {
        reply: Reply<Result<StateSnapshot, Error>>,
    },
    Continue {
        pass_exception: bool,
        reply: Reply<Result<StateSnapshot, Error>>,
    },
    Step {
        reply: Reply<Result<StateSnapshot, Error>>,
    },
    SetBreakpoint {
        request: BreakpointRequest,
        reply: Reply<Result<BreakpointView, Error>>,
    },
    RemoveBreakpoint {
        id: BreakpointId,
        reply: Reply<Result<(), Error>>,
    },
    ListBreakpoints {
        reply: Reply<Vec<BreakpointView>>,
    },
    GetRegisters {
        reply: Reply<Result<(u32, Registers), Error>>,
    },
    ListModules {
        reply: Reply<Vec<ModuleView>>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// One-shot latch the worker sets when the debuggee first stops at its
/// entry breakpoint.
#[derive(Clone, Default)]
struct EntryLatch {
    inner: Arc<AtomicBool>,
}

impl EntryLatch {
    fn set(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// A debugging session: the worker thread plus the channels to reach it.
pub struct Session {
    pub id: SessionId,
    pub source_resolver: SourceResolver,
    commands: SyncSender<Command>,
    state: Arc<Mutex<StateSnapshot>>,
    entry: EntryLatch,
    closing: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawn the worker thread, create the debuggee on it and wait until the
    /// main image is registered. Does not wait for the entry breakpoint.
    pub fn spawn<D, F>(
        exe_path: PathBuf,
        source_dirs: Vec<PathBuf>,
        driver_factory: F,
    ) -> Result<Session, Error>
    where
        D: ProcessDriver + 'static,
        F: FnOnce() -> Result<D, Error> + Send + 'static,
    {
        let id = SessionId::new();
        let (command_tx, command_rx) = sync_channel(COMMAND_QUEUE_DEPTH);
        let (startup_tx, startup_rx) = sync_channel::<Result<StateSnapshot, Error>>(1);
        let state = Arc::new(Mutex::new(StateSnapshot {
            status: ExecutionStatus::Created,
            stop: None,
            process_id: None,
            exit_code: None,
            last_event: None,
        }));
        let entry = EntryLatch::default();
        let closing = Arc::new(AtomicBool::new(false));

        let worker_state = state.clone();
        let worker_entry = entry.clone();
        let worker_closing = closing.clone();
        let worker = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                // the debuggee must be created by the thread that pumps its
                // events
                let driver = match driver_factory() {
                    Ok(driver) => driver,
                    Err(e) => {
                        let _ = startup_tx.send(Err(e));
                        return;
                    }
                };

                let mut debugger = Debugger::new(driver, exe_path);
                if let Err(e) = debugger.wait_for_main_image(STOP_WAIT) {
                    let _ = startup_tx.send(Err(e));
                    return;
                }

                publish(&worker_state, &worker_entry, &debugger);
                let _ = startup_tx.send(Ok(debugger.snapshot()));

                worker_loop(debugger, command_rx, worker_state, worker_entry, worker_closing);
            })?;

        match startup_rx.recv_timeout(STOP_WAIT + REPLY_GRACE) {
            Ok(Ok(_)) => {
                let mut resolver = SourceResolver::new();
                for dir in source_dirs {
                    resolver.add_search_dir(dir);
                }
                info!(target: "server", "session {id} created");
                Ok(Session {
                    id,
                    source_resolver: resolver,
                    commands: command_tx,
                    state,
                    entry,
                    closing,
                    worker: Mutex::new(Some(worker)),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.lock().unwrap().clone()
    }

    pub fn entry_reached(&self) -> bool {
        self.entry.is_set()
    }

    pub fn run(&self) -> Result<StateSnapshot, Error> {
        self.control(|reply| Command::Run { reply })
    }

    pub fn resume(&self, pass_exception: bool) -> Result<StateSnapshot, Error> {
        self.control(|reply| Command::Continue {
            pass_exception,
            reply,
        })
    }

    pub fn step(&self) -> Result<StateSnapshot, Error> {
        self.control(|reply| Command::Step { reply })
    }

    pub fn set_breakpoint(&self, request: BreakpointRequest) -> Result<BreakpointView, Error> {
        self.fail_fast_if_crashed()?;
        let (reply, rx) = sync_channel(1);
        self.send(Command::SetBreakpoint { request, reply })?;
        self.recv(rx)?
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        self.fail_fast_if_crashed()?;
        let (reply, rx) = sync_channel(1);
        self.send(Command::RemoveBreakpoint { id, reply })?;
        self.recv(rx)?
    }

    pub fn list_breakpoints(&self) -> Result<Vec<BreakpointView>, Error> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::ListBreakpoints { reply })?;
        self.recv(rx)
    }

    pub fn registers(&self) -> Result<(u32, Registers), Error> {
        self.fail_fast_if_crashed()?;
        let (reply, rx) = sync_channel(1);
        self.send(Command::GetRegisters { reply })?;
        self.recv(rx)?
    }

    pub fn list_modules(&self) -> Result<Vec<ModuleView>, Error> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::ListModules { reply })?;
        self.recv(rx)
    }

    /// Shut the session down and join the worker. Idempotent.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let (reply, rx) = sync_channel(1);
        if self.commands.try_send(Command::Close { reply }).is_ok() {
            let _ = rx.recv_timeout(STOP_WAIT);
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                warn!(target: "server", "session {} worker panicked", self.id);
            }
        }
        info!(target: "server", "session {} closed", self.id);
    }

    fn control<F>(&self, make: F) -> Result<StateSnapshot, Error>
    where
        F: FnOnce(Reply<Result<StateSnapshot, Error>>) -> Command,
    {
        self.fail_fast_if_crashed()?;
        let (reply, rx) = sync_channel(1);
        self.send(make(reply))?;
        self.recv(rx)?
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::InvalidSession(self.id.to_string()))
    }

    fn recv<T>(&self, rx: Receiver<T>) -> Result<T, Error> {
        rx.recv_timeout(STOP_WAIT + REPLY_GRACE).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::InvalidSession(self.id.to_string()),
        })
    }

    /// A crashed session rejects every command immediately.
    fn fail_fast_if_crashed(&self) -> Result<(), Error> {
        if self.snapshot().status == ExecutionStatus::Crashed {
            return Err(Error::InvalidSession(self.id.to_string()));
        }
        Ok(())
    }
}

fn publish<D: ProcessDriver>(
    state: &Arc<Mutex<StateSnapshot>>,
    entry: &EntryLatch,
    debugger: &Debugger<D>,
) {
    *state.lock().unwrap() = debugger.snapshot();
    if debugger.entry_reached() {
        entry.set();
    }
}

fn worker_loop<D: ProcessDriver>(
    mut debugger: Debugger<D>,
    commands: Receiver<Command>,
    state: Arc<Mutex<StateSnapshot>>,
    entry: EntryLatch,
    closing: Arc<AtomicBool>,
) {
    loop {
        if closing.load(Ordering::SeqCst) {
            debugger.shutdown();
            publish(&state, &entry, &debugger);
            break;
        }

        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(command) => {
                let quit = handle_command(&mut debugger, command, &state, &entry);
                publish(&state, &entry, &debugger);
                if quit {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if debugger.status() == ExecutionStatus::Running {
                    weak_error!(debugger.pump_once(POLL_INTERVAL), "event pump:");
                    publish(&state, &entry, &debugger);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(target: "server", "command channel closed, shutting session down");
                debugger.shutdown();
                publish(&state, &entry, &debugger);
                break;
            }
        }
    }
}

/// Execute one command on the worker thread. Returns true when the session
/// should end.
fn handle_command<D: ProcessDriver>(
    debugger: &mut Debugger<D>,
    command: Command,
    state: &Arc<Mutex<StateSnapshot>>,
    entry: &EntryLatch,
) -> bool {
    match command {
        Command::Run { reply } => {
            let result = match debugger.status() {
                ExecutionStatus::Crashed => Err(process_lost()),
                ExecutionStatus::Stopped | ExecutionStatus::Exited => Ok(debugger.snapshot()),
                _ => {
                    pump_until_stop(debugger, state, entry, STOP_WAIT);
                    Ok(debugger.snapshot())
                }
            };
            let _ = reply.send(result);
        }
        Command::Continue {
            pass_exception,
            reply,
        } => {
            let disposition = if pass_exception {
                ContinueDisposition::NotHandled
            } else {
                ContinueDisposition::Handled
            };
            let result = debugger.resume(disposition).map(|_| {
                pump_until_stop(debugger, state, entry, STOP_WAIT);
                debugger.snapshot()
            });
            let _ = reply.send(result);
        }
        Command::Step { reply } => {
            let result = debugger
                .prepare_step()
                .and_then(|_| debugger.resume(ContinueDisposition::Handled))
                .map(|_| {
                    pump_until_stop(debugger, state, entry, STOP_WAIT);
                    debugger.snapshot()
                });
            let _ = reply.send(result);
        }
        Command::SetBreakpoint { request, reply } => {
            let id = debugger.set_breakpoint(request);
            let view = debugger
                .breakpoint_view(id)
                .expect("freshly created breakpoint exists");
            let _ = reply.send(Ok(view));
        }
        Command::RemoveBreakpoint { id, reply } => {
            debugger.remove_breakpoint(id);
            let _ = reply.send(Ok(()));
        }
        Command::ListBreakpoints { reply } => {
            let _ = reply.send(debugger.breakpoints());
        }
        Command::GetRegisters { reply } => {
            let _ = reply.send(debugger.registers());
        }
        Command::ListModules { reply } => {
            let _ = reply.send(debugger.modules());
        }
        Command::Close { reply } => {
            debugger.shutdown();
            let _ = reply.send(());
            return true;
        }
    }
    false
}

/// Pump debug events until the debuggee stops, finishes, or the deadline
/// passes. The published snapshot is refreshed after every event so
/// observers see module loads while the debuggee runs.
fn pump_until_stop<D: ProcessDriver>(
    debugger: &mut Debugger<D>,
    state: &Arc<Mutex<StateSnapshot>>,
    entry: &EntryLatch,
    wait: Duration,
) {
    let deadline = Instant::now() + wait;
    loop {
        match debugger.status() {
            ExecutionStatus::Stopped | ExecutionStatus::Exited | ExecutionStatus::Crashed => break,
            _ => {}
        }
        if Instant::now() >= deadline {
            debug!(target: "server", "stop wait deadline passed, debuggee still running");
            break;
        }
        weak_error!(debugger.pump_once(POLL_INTERVAL), "event pump:");
        publish(state, entry, debugger);
    }
}

fn process_lost() -> Error {
    Error::ProcessLost("debuggee is gone".to_string())
}

/// All live sessions of the server. Sessions are fully independent, the
/// manager only hands out references.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(windows)]
    pub fn create_session(
        &self,
        exe_path: PathBuf,
        source_dirs: Vec<PathBuf>,
    ) -> Result<SessionId, Error> {
        use crate::debugger::process::Win32Driver;

        if !exe_path.exists() {
            return Err(Error::ProcessCreation(format!(
                "executable not found: {}",
                exe_path.display()
            )));
        }

        let launch_path = exe_path.clone();
        let session = Session::spawn(exe_path, source_dirs, move || {
            Win32Driver::launch(&launch_path)
        })?;
        Ok(self.insert(session))
    }

    #[cfg(not(windows))]
    pub fn create_session(
        &self,
        _exe_path: PathBuf,
        _source_dirs: Vec<PathBuf>,
    ) -> Result<SessionId, Error> {
        Err(Error::UnsupportedPlatform)
    }

    /// Register an externally spawned session, used by tests to drive the
    /// conductor with a scripted process driver.
    pub fn insert(&self, session: Session) -> SessionId {
        let id = session.id;
        self.sessions.lock().unwrap().insert(id, Arc::new(session));
        id
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>, Error> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidSession(id.to_string()))
    }

    /// Close and remove a session. Idempotent: closing an unknown id is a
    /// no-op that reports false.
    pub fn close_session(&self, id: SessionId) -> bool {
        let session = self.sessions.lock().unwrap().remove(&id);
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
