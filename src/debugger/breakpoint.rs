use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::SourcePlace;
use crate::debugger::debugee::registry::{ModuleId, ModuleRegistry};
use crate::debugger::error::Error;
use crate::debugger::process::ProcessDriver;
use crate::{muted_error, weak_error};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// INT 3, the single byte software breakpoint instruction.
pub const INT3: u8 = 0xCC;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl Display for BreakpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A breakpoint location as requested by the user: either an absolute
/// address (`0x401000`) or a source location (`simple.c:4`).
#[derive(Clone, Debug, PartialEq)]
pub enum BreakpointRequest {
    Address(RelocatedAddress),
    Line { path: String, line: u64 },
}

impl FromStr for BreakpointRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            let addr = u32::from_str_radix(hex, 16)
                .map_err(|_| Error::InvalidLocation(s.to_string()))?;
            return Ok(BreakpointRequest::Address(RelocatedAddress::from(addr)));
        }
        let (path, line) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidLocation(s.to_string()))?;
        let line: u64 = line
            .parse()
            .map_err(|_| Error::InvalidLocation(s.to_string()))?;
        if path.is_empty() {
            return Err(Error::InvalidLocation(s.to_string()));
        }
        Ok(BreakpointRequest::Line {
            path: path.to_string(),
            line,
        })
    }
}

impl Display for BreakpointRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointRequest::Address(addr) => Display::fmt(addr, f),
            BreakpointRequest::Line { path, line } => write!(f, "{path}:{line}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointState {
    /// Waiting for a module able to resolve the requested location.
    Pending,
    /// Planted in debuggee memory.
    Active,
    /// Planting failed or the address belongs to no loaded module.
    Failed,
}

impl BreakpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakpointState::Pending => "pending",
            BreakpointState::Active => "active",
            BreakpointState::Failed => "failed",
        }
    }
}

pub struct Breakpoint {
    pub id: BreakpointId,
    pub request: BreakpointRequest,
    pub state: BreakpointState,
    pub module: Option<ModuleId>,
    pub address: Option<RelocatedAddress>,
    pub enabled: bool,
    pub hit_count: u32,
    pub place: Option<SourcePlace>,
    saved_byte: Option<u8>,
    planted: bool,
}

/// Snapshot of a breakpoint record for external observers.
#[derive(Clone, Debug)]
pub struct BreakpointView {
    pub id: BreakpointId,
    pub request: String,
    pub state: &'static str,
    pub address: Option<RelocatedAddress>,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub module: Option<String>,
    pub symbol: Option<String>,
    pub enabled: bool,
    pub hit_count: u32,
}

/// Software breakpoints of one session.
///
/// Planting replaces the first byte of the target instruction with INT 3 and
/// keeps the original byte for restoration. Records reference modules by id
/// only, the registry stays with the debuggee.
#[derive(Default)]
pub struct BreakpointManager {
    breakpoints: Vec<Breakpoint>,
    next_id: u32,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a breakpoint at an absolute address. The address must belong to a
    /// loaded module, otherwise the record is created in the failed state.
    pub fn set_by_address<D: ProcessDriver>(
        &mut self,
        drv: &mut D,
        registry: &ModuleRegistry,
        addr: RelocatedAddress,
    ) -> BreakpointId {
        if let Some(existing) = self.breakpoints.iter().find(|bp| bp.address == Some(addr)) {
            debug!(target: "debugger", "breakpoint already exists at {addr}");
            return existing.id;
        }

        let id = self.alloc_id();
        let mut bp = Breakpoint {
            id,
            request: BreakpointRequest::Address(addr),
            state: BreakpointState::Failed,
            module: None,
            address: None,
            enabled: true,
            hit_count: 0,
            place: None,
            saved_byte: None,
            planted: false,
        };

        match registry.lookup_by_address(addr) {
            Some(module) => {
                bp.module = Some(module.id);
                bp.place = registry
                    .resolve_address_to_line(addr)
                    .map(|(place, _)| place);
                Self::try_plant(&mut bp, drv, addr);
            }
            None => {
                warn!(target: "debugger", "{addr} belongs to no loaded module");
            }
        }

        self.breakpoints.push(bp);
        id
    }

    /// Set a breakpoint at a source location. Unresolvable locations leave
    /// the record pending until a module able to resolve them is loaded.
    pub fn set_by_line<D: ProcessDriver>(
        &mut self,
        drv: &mut D,
        registry: &ModuleRegistry,
        path: &str,
        line: u64,
    ) -> BreakpointId {
        let id = self.alloc_id();
        let mut bp = Breakpoint {
            id,
            request: BreakpointRequest::Line {
                path: path.to_string(),
                line,
            },
            state: BreakpointState::Pending,
            module: None,
            address: None,
            enabled: true,
            hit_count: 0,
            place: None,
            saved_byte: None,
            planted: false,
        };

        match registry.resolve_line_to_address(path, line) {
            Some((addr, module)) => {
                info!(target: "debugger", "{path}:{line} resolved to {addr} ({})", module.name);
                bp.module = Some(module.id);
                bp.place = module
                    .debug_info
                    .as_ref()
                    .and_then(|di| di.line_index().address_to_line(module.to_global(addr)));
                Self::try_plant(&mut bp, drv, addr);
            }
            None => {
                info!(target: "debugger", "{path}:{line} is not resolvable yet, breakpoint pending");
            }
        }

        self.breakpoints.push(bp);
        id
    }

    /// Remove a breakpoint, restoring the original byte if it is planted.
    /// Removing an unknown id is not an error.
    pub fn remove<D: ProcessDriver>(&mut self, drv: &mut D, id: BreakpointId) {
        let Some(pos) = self.breakpoints.iter().position(|bp| bp.id == id) else {
            debug!(target: "debugger", "remove of unknown breakpoint {id}");
            return;
        };
        let bp = self.breakpoints.remove(pos);
        if bp.planted {
            if let (Some(addr), Some(byte)) = (bp.address, bp.saved_byte) {
                let restored = weak_error!(drv.write_memory(addr, &[byte]), "restore original byte:");
                if restored.is_some() {
                    muted_error!(drv.flush_instruction_cache(addr, 1), "instruction cache flush:");
                }
            }
        }
    }

    /// Remove every breakpoint, best effort. Used on session teardown.
    pub fn remove_all<D: ProcessDriver>(&mut self, drv: &mut D) {
        let ids: Vec<BreakpointId> = self.breakpoints.iter().map(|bp| bp.id).collect();
        for id in ids {
            self.remove(drv, id);
        }
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.id == id)
    }

    /// Snapshot all records.
    pub fn list(&self, registry: &ModuleRegistry) -> Vec<BreakpointView> {
        self.breakpoints
            .iter()
            .map(|bp| {
                let module = bp.module.and_then(|id| registry.get(id));
                let symbol = match (module, bp.address) {
                    (Some(module), Some(addr)) => module
                        .export_for_address(addr)
                        .map(|sym| sym.name.clone()),
                    _ => None,
                };
                BreakpointView {
                    id: bp.id,
                    request: bp.request.to_string(),
                    state: bp.state.as_str(),
                    address: bp.address,
                    file: bp
                        .place
                        .as_ref()
                        .map(|p| p.file.to_string_lossy().to_string()),
                    line: bp.place.as_ref().map(|p| p.line),
                    module: module.map(|m| m.name.clone()),
                    symbol,
                    enabled: bp.enabled,
                    hit_count: bp.hit_count,
                }
            })
            .collect()
    }

    /// Try to resolve pending records against a freshly loaded module.
    pub fn on_module_loaded<D: ProcessDriver>(
        &mut self,
        drv: &mut D,
        registry: &ModuleRegistry,
        module_id: ModuleId,
    ) -> usize {
        let Some(module) = registry.get(module_id) else {
            return 0;
        };

        let mut resolved = 0;
        for bp in self
            .breakpoints
            .iter_mut()
            .filter(|bp| bp.state == BreakpointState::Pending)
        {
            let addr = match &bp.request {
                BreakpointRequest::Line { path, line } => module
                    .debug_info
                    .as_ref()
                    .and_then(|di| di.line_index().line_to_address(path, *line))
                    .map(|rel| module.to_relocated(rel)),
                BreakpointRequest::Address(addr) => module.contains(*addr).then_some(*addr),
            };
            let Some(addr) = addr else { continue };

            bp.module = Some(module_id);
            bp.place = module
                .debug_info
                .as_ref()
                .and_then(|di| di.line_index().address_to_line(module.to_global(addr)));
            Self::try_plant(bp, drv, addr);
            if bp.state == BreakpointState::Active {
                info!(
                    target: "debugger",
                    "pending breakpoint {} activated at {addr} ({})",
                    bp.id,
                    module.name
                );
                resolved += 1;
            }
        }
        resolved
    }

    /// An unloaded module takes its planted breakpoints with it, the records
    /// revert to pending and wait for a reload.
    pub fn on_module_unloaded(&mut self, module_id: ModuleId) {
        for bp in self
            .breakpoints
            .iter_mut()
            .filter(|bp| bp.module == Some(module_id))
        {
            debug!(target: "debugger", "breakpoint {} reverts to pending on module unload", bp.id);
            bp.state = BreakpointState::Pending;
            bp.module = None;
            bp.address = None;
            bp.place = None;
            bp.saved_byte = None;
            bp.planted = false;
        }
    }

    /// Handle a breakpoint exception at `addr` raised by `thread_id`.
    ///
    /// For an owned breakpoint the original byte is restored and the thread's
    /// instruction pointer is rewound by one so the original instruction
    /// re-executes on resume. Returns `None` for exceptions at foreign
    /// addresses, their policy belongs to the caller.
    pub fn on_breakpoint_hit<D: ProcessDriver>(
        &mut self,
        drv: &mut D,
        thread_id: u32,
        addr: RelocatedAddress,
    ) -> Result<Option<BreakpointId>, Error> {
        let Some(bp) = self
            .breakpoints
            .iter_mut()
            .find(|bp| bp.address == Some(addr) && bp.planted)
        else {
            return Ok(None);
        };

        bp.hit_count += 1;
        let saved = bp.saved_byte.expect("planted breakpoint keeps its byte");
        drv.write_memory(addr, &[saved])?;
        drv.flush_instruction_cache(addr, 1)?;
        bp.planted = false;

        let mut regs = drv.registers(thread_id)?;
        regs.set_pc(addr);
        drv.set_registers(thread_id, &regs)?;

        Ok(Some(bp.id))
    }

    /// Re-plant a breakpoint after the instruction it covers was stepped
    /// over. A record removed or disabled in the meantime stays unplanted.
    pub fn re_arm<D: ProcessDriver>(
        &mut self,
        drv: &mut D,
        addr: RelocatedAddress,
    ) -> Result<bool, Error> {
        let Some(bp) = self
            .breakpoints
            .iter_mut()
            .find(|bp| bp.address == Some(addr) && bp.state == BreakpointState::Active)
        else {
            return Ok(false);
        };
        if !bp.enabled || bp.planted {
            return Ok(false);
        }
        drv.write_memory(addr, &[INT3])?;
        drv.flush_instruction_cache(addr, 1)?;
        bp.planted = true;
        Ok(true)
    }

    fn alloc_id(&mut self) -> BreakpointId {
        self.next_id += 1;
        BreakpointId(self.next_id)
    }

    /// Plant atomically: save the original byte, write INT 3, read back to
    /// verify. Any failure moves the record to the failed state.
    fn try_plant<D: ProcessDriver>(bp: &mut Breakpoint, drv: &mut D, addr: RelocatedAddress) {
        match Self::plant(drv, addr) {
            Ok(original) => {
                bp.address = Some(addr);
                bp.saved_byte = Some(original);
                bp.planted = true;
                bp.state = BreakpointState::Active;
            }
            Err(e) => {
                warn!(target: "debugger", "breakpoint plant at {addr}: {e:#}");
                bp.address = Some(addr);
                bp.state = BreakpointState::Failed;
            }
        }
    }

    fn plant<D: ProcessDriver>(drv: &mut D, addr: RelocatedAddress) -> Result<u8, Error> {
        let mut original = [0u8; 1];
        drv.read_memory(addr, &mut original)?;
        drv.write_memory(addr, &[INT3])?;

        let mut verify = [0u8; 1];
        drv.read_memory(addr, &mut verify)?;
        if verify[0] != INT3 {
            return Err(Error::BreakpointPlantFailed(addr));
        }
        drv.flush_instruction_cache(addr, 1)?;
        Ok(original[0])
    }
}
