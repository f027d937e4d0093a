pub mod address;
pub mod breakpoint;
pub mod debugee;
pub mod error;
pub mod process;
pub mod register;

pub use address::{GlobalAddress, RelocatedAddress};
pub use debugee::{Debugee, ExecutionStatus, StopInfo, StopReason};
pub use error::Error;

use crate::debugger::breakpoint::{BreakpointId, BreakpointManager, BreakpointRequest, BreakpointView};
use crate::debugger::debugee::registry::ModuleView;
use crate::debugger::process::{
    ContinueDisposition, DebugEvent, EventInfo, ExceptionCode, ProcessDriver,
};
use crate::debugger::register::Registers;
use crate::weak_error;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const EXCEPTION_BREAKPOINT_CODE: u32 = 0x8000_0003;

/// Published debugger state, replaced wholesale on every change so external
/// observers always see a coherent view.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub status: ExecutionStatus,
    pub stop: Option<StopInfo>,
    pub process_id: Option<u32>,
    pub exit_code: Option<i32>,
    pub last_event: Option<StopReason>,
}

/// The debugging core of one session.
///
/// Owns the debuggee process, its module registry and breakpoint table.
/// Exactly one thread per session drives it: every method that touches the
/// debuggee must run on the thread that spawned the process, a Win32 Debug
/// API requirement.
pub struct Debugger<D: ProcessDriver> {
    driver: D,
    debugee: Debugee,
    breakpoints: BreakpointManager,
    /// The first breakpoint exception is the loader's entry break.
    entry_hit: bool,
    /// Breakpoint address awaiting re-plant once its instruction retires.
    rearm: Option<RelocatedAddress>,
    step_requested: bool,
    /// Last debug event not yet acknowledged towards the OS.
    pending: Option<(u32, u32)>,
}

impl<D: ProcessDriver> Debugger<D> {
    pub fn new(driver: D, path: PathBuf) -> Self {
        Self {
            driver,
            debugee: Debugee::new(path),
            breakpoints: BreakpointManager::new(),
            entry_hit: false,
            rearm: None,
            step_requested: false,
            pending: None,
        }
    }

    /// Pump events until the process-create event registers the main image.
    pub fn wait_for_main_image(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        while self.debugee.registry.is_empty() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            self.pump_once(Duration::from_millis(100))?;
        }
        Ok(())
    }

    /// Wait for the next debug event and dispatch it. An idle timeout is not
    /// an error. Losing the debuggee marks the session crashed.
    pub fn pump_once(&mut self, timeout: Duration) -> Result<bool, Error> {
        if self.debugee.is_finished() {
            return Ok(false);
        }

        let event = match self.driver.wait_event(timeout) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(false),
            Err(Error::ProcessLost(e)) => {
                warn!(target: "debugger", "debuggee lost: {e}");
                self.debugee.set_crashed();
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.pending = Some((event.process_id, event.thread_id));
        if let Err(e) = self.dispatch(event) {
            match e {
                Error::ProcessLost(e) => {
                    warn!(target: "debugger", "debuggee lost: {e}");
                    self.debugee.set_crashed();
                    return Ok(false);
                }
                e => warn!(target: "debugger", "event dispatch: {e:#}"),
            }
        }

        // a stop withholds the acknowledgement until the caller resumes
        if !self.debugee.is_stopped() {
            if let Err(e) = self.acknowledge(ContinueDisposition::Handled) {
                warn!(target: "debugger", "event acknowledgement: {e:#}");
                self.debugee.set_crashed();
            }
        }
        Ok(true)
    }

    /// Resume a stopped debuggee, acknowledging the stop event with the given
    /// disposition.
    pub fn resume(&mut self, disposition: ContinueDisposition) -> Result<(), Error> {
        if !self.debugee.is_stopped() {
            return Err(Error::NotStopped);
        }
        self.acknowledge(disposition)?;
        self.debugee.set_running();
        Ok(())
    }

    /// Arm a single instruction step for the stopped thread. The next resume
    /// raises a single-step stop after exactly one instruction.
    pub fn prepare_step(&mut self) -> Result<(), Error> {
        if !self.debugee.is_stopped() {
            return Err(Error::NotStopped);
        }
        let tid = self
            .debugee
            .stop
            .as_ref()
            .and_then(|s| s.thread_id)
            .ok_or(Error::NotStopped)?;

        let mut regs = self.driver.registers(tid)?;
        regs.set_single_step(true);
        self.driver.set_registers(tid, &regs)?;
        self.step_requested = true;
        Ok(())
    }

    pub fn set_breakpoint(&mut self, request: BreakpointRequest) -> BreakpointId {
        match request {
            BreakpointRequest::Address(addr) => {
                self.breakpoints
                    .set_by_address(&mut self.driver, &self.debugee.registry, addr)
            }
            BreakpointRequest::Line { path, line } => {
                self.breakpoints
                    .set_by_line(&mut self.driver, &self.debugee.registry, &path, line)
            }
        }
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) {
        self.breakpoints.remove(&mut self.driver, id);
    }

    pub fn breakpoint_view(&self, id: BreakpointId) -> Option<BreakpointView> {
        self.breakpoints
            .list(&self.debugee.registry)
            .into_iter()
            .find(|view| view.id == id)
    }

    pub fn breakpoints(&self) -> Vec<BreakpointView> {
        self.breakpoints.list(&self.debugee.registry)
    }

    pub fn modules(&self) -> Vec<ModuleView> {
        self.debugee.registry.iter().map(|m| m.view()).collect()
    }

    /// Register file of the thread the debuggee stopped on.
    pub fn registers(&mut self) -> Result<(u32, Registers), Error> {
        let tid = self
            .debugee
            .stop
            .as_ref()
            .and_then(|s| s.thread_id)
            .ok_or(Error::NotStopped)?;
        Ok((tid, self.driver.registers(tid)?))
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            status: self.debugee.status,
            stop: self.debugee.stop.clone(),
            process_id: self.debugee.process_id,
            exit_code: self.debugee.exit_code,
            last_event: self.debugee.last_event,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.debugee.status
    }

    pub fn entry_reached(&self) -> bool {
        self.entry_hit
    }

    /// Tear the session down: restore planted breakpoints, terminate the
    /// debuggee and release any withheld event. Best effort throughout.
    pub fn shutdown(&mut self) {
        if !self.debugee.is_finished() {
            self.breakpoints.remove_all(&mut self.driver);
            weak_error!(self.driver.terminate(), "terminate debuggee:");
            if self.pending.is_some() {
                weak_error!(
                    self.acknowledge(ContinueDisposition::Handled),
                    "release debug event:"
                );
            }
            self.debugee.set_exited(-1);
        }
    }

    fn acknowledge(&mut self, disposition: ContinueDisposition) -> Result<(), Error> {
        if let Some((pid, tid)) = self.pending.take() {
            self.driver.continue_event(pid, tid, disposition)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: DebugEvent) -> Result<(), Error> {
        debug!(target: "debugger", "debug event from thread {}: {:?}", event.thread_id, event.info);
        match event.info {
            EventInfo::CreateProcess { base, entry, path } => {
                self.debugee.process_id = Some(event.process_id);
                self.debugee.entry = Some(entry);
                let path = path.unwrap_or_else(|| self.debugee.path.clone());
                let id = self.debugee.registry.add(&path, base);
                self.breakpoints
                    .on_module_loaded(&mut self.driver, &self.debugee.registry, id);
                self.debugee.last_event = Some(StopReason::ModuleLoad);
            }
            EventInfo::CreateThread | EventInfo::ExitThread | EventInfo::DebugString => {}
            EventInfo::LoadDll { base, path } => {
                let path = path.unwrap_or_else(|| PathBuf::from(format!("module_{base}")));
                let id = self.debugee.registry.add(&path, base);
                let resolved =
                    self.breakpoints
                        .on_module_loaded(&mut self.driver, &self.debugee.registry, id);
                if resolved > 0 {
                    info!(
                        target: "debugger",
                        "{resolved} pending breakpoint(s) resolved against {}",
                        path.display()
                    );
                }
                self.debugee.last_event = Some(StopReason::ModuleLoad);
            }
            EventInfo::UnloadDll { base } => {
                if let Some(module) = self.debugee.registry.remove_by_base(base) {
                    info!(target: "debugger", "module unloaded: {}", module.name);
                    self.breakpoints.on_module_unloaded(module.id);
                }
                self.debugee.last_event = Some(StopReason::ModuleUnload);
            }
            EventInfo::Exception {
                code,
                address,
                first_chance,
            } => self.handle_exception(event.thread_id, code, address, first_chance)?,
            EventInfo::ExitProcess { exit_code } => {
                info!(target: "debugger", "debuggee exited with code {exit_code}");
                self.debugee.set_exited(exit_code);
            }
        }
        Ok(())
    }

    fn handle_exception(
        &mut self,
        thread_id: u32,
        code: ExceptionCode,
        address: RelocatedAddress,
        first_chance: bool,
    ) -> Result<(), Error> {
        match code {
            ExceptionCode::Breakpoint => {
                if let Some(id) =
                    self.breakpoints
                        .on_breakpoint_hit(&mut self.driver, thread_id, address)?
                {
                    info!(target: "debugger", "breakpoint {id} hit at {address}");
                    // arm a silent step so the breakpoint can be re-planted
                    // after the original instruction executes
                    let mut regs = self.driver.registers(thread_id)?;
                    regs.set_single_step(true);
                    self.driver.set_registers(thread_id, &regs)?;
                    self.rearm = Some(address);

                    self.stop(StopInfo::at(StopReason::Breakpoint, address, thread_id));
                } else if !self.entry_hit {
                    info!(target: "debugger", "initial breakpoint at {address} (entry)");
                    self.entry_hit = true;
                    self.stop(StopInfo::at(StopReason::Entry, address, thread_id));
                } else {
                    debug!(target: "debugger", "foreign breakpoint at {address}");
                    let mut info = StopInfo::at(StopReason::Exception, address, thread_id);
                    info.exception_code = Some(EXCEPTION_BREAKPOINT_CODE);
                    self.stop(info);
                }
            }
            ExceptionCode::SingleStep => {
                if let Some(addr) = self.rearm.take() {
                    weak_error!(
                        self.breakpoints.re_arm(&mut self.driver, addr),
                        "breakpoint re-arm:"
                    );
                }

                if self.step_requested {
                    self.step_requested = false;
                    self.clear_trap_flag(thread_id)?;
                    self.stop(StopInfo::at(StopReason::SingleStep, address, thread_id));
                } else {
                    // a trap without a requested step only serves re-arming,
                    // or is a stray the OS raised during dll attach; either
                    // way the flag must go or every instruction traps
                    debug!(target: "debugger", "silent single-step at {address}");
                    self.clear_trap_flag(thread_id)?;
                }
            }
            ExceptionCode::Other(raw_code) => {
                info!(
                    target: "debugger",
                    "exception {raw_code:#010x} at {address}, first chance: {first_chance}"
                );
                let mut info = StopInfo::at(StopReason::Exception, address, thread_id);
                info.exception_code = Some(raw_code);
                self.stop(info);
            }
        }
        Ok(())
    }

    fn clear_trap_flag(&mut self, thread_id: u32) -> Result<(), Error> {
        let mut regs = self.driver.registers(thread_id)?;
        if regs.single_step() {
            regs.set_single_step(false);
            self.driver.set_registers(thread_id, &regs)?;
        }
        Ok(())
    }

    fn stop(&mut self, mut info: StopInfo) {
        if let Some(addr) = info.address {
            if let Some((place, module)) = self.debugee.registry.resolve_address_to_line(addr) {
                info.place = Some(place);
                info.module = Some(module.name.clone());
            } else if let Some(module) = self.debugee.registry.lookup_by_address(addr) {
                info.module = Some(module.name.clone());
            }
        }
        self.debugee.set_stopped(info);
    }
}
