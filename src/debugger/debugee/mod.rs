use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::SourcePlace;
use crate::debugger::debugee::registry::ModuleRegistry;
use std::path::PathBuf;

pub mod dwarf;
pub mod registry;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutionStatus {
    /// Debuggee process exists but no event has been pumped yet.
    Created,
    Running,
    Stopped,
    Exited,
    /// The debuggee handle is gone, the session is unusable.
    Crashed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Exited => "exited",
            ExecutionStatus::Crashed => "crashed",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopReason {
    /// The initial system breakpoint, raised before any user code ran.
    Entry,
    Breakpoint,
    SingleStep,
    Exception,
    ModuleLoad,
    ModuleUnload,
    Exited,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::SingleStep => "single_step",
            StopReason::Exception => "exception",
            StopReason::ModuleLoad => "module_load",
            StopReason::ModuleUnload => "module_unload",
            StopReason::Exited => "exited",
        }
    }
}

/// Why and where the debuggee stopped.
#[derive(Clone, Debug)]
pub struct StopInfo {
    pub reason: StopReason,
    pub address: Option<RelocatedAddress>,
    pub thread_id: Option<u32>,
    pub exception_code: Option<u32>,
    pub module: Option<String>,
    pub place: Option<SourcePlace>,
}

impl StopInfo {
    pub fn at(reason: StopReason, address: RelocatedAddress, thread_id: u32) -> Self {
        Self {
            reason,
            address: Some(address),
            thread_id: Some(thread_id),
            exception_code: None,
            module: None,
            place: None,
        }
    }
}

/// Static and runtime debuggee information: the image on disk, the loaded
/// module set and the execution status. Mutated only by the session's
/// event loop.
pub struct Debugee {
    pub path: PathBuf,
    pub registry: ModuleRegistry,
    pub status: ExecutionStatus,
    pub stop: Option<StopInfo>,
    pub process_id: Option<u32>,
    pub entry: Option<RelocatedAddress>,
    pub exit_code: Option<i32>,
    /// Last debug event of interest, includes events that do not stop
    /// execution (module load and unload).
    pub last_event: Option<StopReason>,
}

impl Debugee {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            registry: ModuleRegistry::new(),
            status: ExecutionStatus::Created,
            stop: None,
            process_id: None,
            entry: None,
            exit_code: None,
            last_event: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status == ExecutionStatus::Stopped
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Exited | ExecutionStatus::Crashed
        )
    }

    pub fn set_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.stop = None;
    }

    pub fn set_stopped(&mut self, info: StopInfo) {
        self.status = ExecutionStatus::Stopped;
        self.last_event = Some(info.reason);
        self.stop = Some(info);
    }

    pub fn set_exited(&mut self, exit_code: i32) {
        self.status = ExecutionStatus::Exited;
        self.exit_code = Some(exit_code);
        self.last_event = Some(StopReason::Exited);
        self.stop = Some(StopInfo {
            reason: StopReason::Exited,
            address: None,
            thread_id: None,
            exception_code: None,
            module: None,
            place: None,
        });
    }

    pub fn set_crashed(&mut self) {
        self.status = ExecutionStatus::Crashed;
    }
}
