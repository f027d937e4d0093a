//! OS-level debugging primitives.
//!
//! [`ProcessDriver`] is the seam between the portable debugging core and the
//! Win32 Debug API: spawning a debuggee with the debugger attached from the
//! first instruction, pumping debug events, memory and thread-context access.
//! The driver for real Win32 processes is [`Win32Driver`]; tests drive the
//! core with a scripted implementation of the same trait.
//!
//! Every method is synchronous and must be called from the thread that owns
//! the debuggee: the Win32 Debug API binds a debuggee to the thread that
//! created it.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::register::Registers;
use std::path::PathBuf;
use std::time::Duration;

/// How to resume the debuggee after a stop on an exception event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinueDisposition {
    /// The exception is considered handled by the debugger.
    Handled,
    /// Pass the exception on to the debuggee's own handlers.
    NotHandled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionCode {
    /// INT 3, a software breakpoint or the loader's initial break.
    Breakpoint,
    /// Trap flag fired after a single instruction.
    SingleStep,
    /// Any other exception, raw status code preserved.
    Other(u32),
}

/// One debug event as reported by the OS.
#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub process_id: u32,
    pub thread_id: u32,
    pub info: EventInfo,
}

#[derive(Debug, Clone)]
pub enum EventInfo {
    CreateProcess {
        base: RelocatedAddress,
        entry: RelocatedAddress,
        path: Option<PathBuf>,
    },
    CreateThread,
    ExitThread,
    LoadDll {
        base: RelocatedAddress,
        path: Option<PathBuf>,
    },
    UnloadDll {
        base: RelocatedAddress,
    },
    Exception {
        code: ExceptionCode,
        address: RelocatedAddress,
        first_chance: bool,
    },
    /// OutputDebugString and similar informational events.
    DebugString,
    ExitProcess {
        exit_code: i32,
    },
}

/// Synchronous access to a debuggee process.
pub trait ProcessDriver {
    /// Wait for the next debug event. `Ok(None)` is an idle timeout, not an
    /// error. An event must be acknowledged with [`Self::continue_event`]
    /// before the next one can arrive.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error>;

    /// Acknowledge the last debug event and let the debuggee run on.
    fn continue_event(
        &mut self,
        process_id: u32,
        thread_id: u32,
        disposition: ContinueDisposition,
    ) -> Result<(), Error>;

    fn read_memory(&mut self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error>;

    fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    /// Make sure the CPU observes freshly written code bytes.
    fn flush_instruction_cache(&mut self, addr: RelocatedAddress, len: usize) -> Result<(), Error>;

    fn registers(&mut self, thread_id: u32) -> Result<Registers, Error>;

    fn set_registers(&mut self, thread_id: u32, regs: &Registers) -> Result<(), Error>;

    fn terminate(&mut self) -> Result<(), Error>;
}

#[cfg(windows)]
pub use self::win32::Win32Driver;

#[cfg(windows)]
mod win32 {
    use super::*;
    use log::{debug, warn};
    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::io;
    use std::mem;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, ERROR_SEM_TIMEOUT,
        HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::GetFinalPathNameByHandleW;
    use windows_sys::Win32::System::Diagnostics::Debug::{
        ContinueDebugEvent, FlushInstructionCache, ReadProcessMemory, WaitForDebugEvent,
        WriteProcessMemory, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
        EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
        LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
    };
    use windows_sys::Win32::System::Threading::{
        CreateProcessW, OpenThread, TerminateProcess, CREATE_NEW_CONSOLE,
        DEBUG_ONLY_THIS_PROCESS, PROCESS_INFORMATION, STARTUPINFOW, THREAD_GET_CONTEXT,
        THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT,
    };

    const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
    const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
    // WOW64 variants raised for 32-bit debuggees on 64-bit hosts.
    const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001f;
    const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001e;

    // x86 CONTEXT flag set covering control, integer and segment registers.
    const CONTEXT_I386: u32 = 0x0001_0000;
    const CONTEXT_FULL_I386: u32 = CONTEXT_I386 | 0x0007;

    /// Debuggee process driven through the Win32 Debug API.
    pub struct Win32Driver {
        process: HANDLE,
        process_id: u32,
        threads: HashMap<u32, HANDLE>,
        exited: bool,
    }

    impl Win32Driver {
        /// Create a debuggee with the debugger attached from the first
        /// instruction. Must be called on the thread that will pump events.
        pub fn launch(path: &Path) -> Result<Self, Error> {
            let app: Vec<u16> = path
                .as_os_str()
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();

            let mut si: STARTUPINFOW = unsafe { mem::zeroed() };
            si.cb = mem::size_of::<STARTUPINFOW>() as u32;
            let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

            let ok = unsafe {
                CreateProcessW(
                    app.as_ptr(),
                    ptr::null_mut(),
                    ptr::null(),
                    ptr::null(),
                    0,
                    DEBUG_ONLY_THIS_PROCESS | CREATE_NEW_CONSOLE,
                    ptr::null(),
                    ptr::null(),
                    &si,
                    &mut pi,
                )
            };
            if ok == 0 {
                return Err(Error::ProcessCreation(last_os_error()));
            }
            if pi.hProcess == 0 || pi.hProcess == INVALID_HANDLE_VALUE {
                return Err(Error::InvalidHandle);
            }

            debug!(target: "debugger", "debuggee created, pid {}", pi.dwProcessId);

            let mut threads = HashMap::new();
            threads.insert(pi.dwThreadId, pi.hThread);
            Ok(Self {
                process: pi.hProcess,
                process_id: pi.dwProcessId,
                threads,
                exited: false,
            })
        }

        pub fn process_id(&self) -> u32 {
            self.process_id
        }

        fn thread_handle(&mut self, thread_id: u32) -> Result<HANDLE, Error> {
            if let Some(&handle) = self.threads.get(&thread_id) {
                return Ok(handle);
            }
            let handle = unsafe {
                OpenThread(
                    THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION,
                    0,
                    thread_id,
                )
            };
            if handle == 0 {
                return Err(Error::ThreadNotFound(thread_id));
            }
            self.threads.insert(thread_id, handle);
            Ok(handle)
        }

        fn translate(&mut self, raw: &DEBUG_EVENT) -> DebugEvent {
            let info = match raw.dwDebugEventCode {
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.CreateProcessInfo };
                    self.threads.insert(raw.dwThreadId, info.hThread);
                    let path = path_from_handle(info.hFile);
                    if info.hFile != 0 && info.hFile != INVALID_HANDLE_VALUE {
                        unsafe { CloseHandle(info.hFile) };
                    }
                    EventInfo::CreateProcess {
                        base: RelocatedAddress::from(info.lpBaseOfImage as usize),
                        entry: RelocatedAddress::from(
                            info.lpStartAddress.map_or(0usize, |f| f as usize),
                        ),
                        path,
                    }
                }
                CREATE_THREAD_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.CreateThread };
                    self.threads.insert(raw.dwThreadId, info.hThread);
                    EventInfo::CreateThread
                }
                EXIT_THREAD_DEBUG_EVENT => {
                    self.threads.remove(&raw.dwThreadId);
                    EventInfo::ExitThread
                }
                LOAD_DLL_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.LoadDll };
                    let path = path_from_handle(info.hFile);
                    // the file handle is the debugger's to close
                    if info.hFile != 0 && info.hFile != INVALID_HANDLE_VALUE {
                        unsafe { CloseHandle(info.hFile) };
                    }
                    EventInfo::LoadDll {
                        base: RelocatedAddress::from(info.lpBaseOfDll as usize),
                        path,
                    }
                }
                UNLOAD_DLL_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.UnloadDll };
                    EventInfo::UnloadDll {
                        base: RelocatedAddress::from(info.lpBaseOfDll as usize),
                    }
                }
                EXCEPTION_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.Exception };
                    let record = &info.ExceptionRecord;
                    let code = match record.ExceptionCode as u32 {
                        EXCEPTION_BREAKPOINT | STATUS_WX86_BREAKPOINT => ExceptionCode::Breakpoint,
                        EXCEPTION_SINGLE_STEP | STATUS_WX86_SINGLE_STEP => {
                            ExceptionCode::SingleStep
                        }
                        other => ExceptionCode::Other(other),
                    };
                    EventInfo::Exception {
                        code,
                        address: RelocatedAddress::from(record.ExceptionAddress as usize),
                        first_chance: info.dwFirstChance != 0,
                    }
                }
                EXIT_PROCESS_DEBUG_EVENT => {
                    let info = unsafe { &raw.u.ExitProcess };
                    self.exited = true;
                    EventInfo::ExitProcess {
                        exit_code: info.dwExitCode as i32,
                    }
                }
                OUTPUT_DEBUG_STRING_EVENT | RIP_EVENT => EventInfo::DebugString,
                code => {
                    warn!(target: "debugger", "unsupported (ignored) debug event, code: {code}");
                    EventInfo::DebugString
                }
            };

            DebugEvent {
                process_id: raw.dwProcessId,
                thread_id: raw.dwThreadId,
                info,
            }
        }
    }

    impl ProcessDriver for Win32Driver {
        fn wait_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
            let mut raw: DEBUG_EVENT = unsafe { mem::zeroed() };
            let ok = unsafe { WaitForDebugEvent(&mut raw, timeout.as_millis() as u32) };
            if ok == 0 {
                let err = unsafe { GetLastError() };
                if err == ERROR_SEM_TIMEOUT {
                    return Ok(None);
                }
                return Err(Error::ProcessLost(last_os_error()));
            }
            Ok(Some(self.translate(&raw)))
        }

        fn continue_event(
            &mut self,
            process_id: u32,
            thread_id: u32,
            disposition: ContinueDisposition,
        ) -> Result<(), Error> {
            let status = match disposition {
                ContinueDisposition::Handled => DBG_CONTINUE,
                ContinueDisposition::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
            };
            let ok = unsafe { ContinueDebugEvent(process_id, thread_id, status as u32) };
            if ok == 0 {
                return Err(Error::ProcessLost(last_os_error()));
            }
            Ok(())
        }

        fn read_memory(&mut self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
            let mut read = 0usize;
            let ok = unsafe {
                ReadProcessMemory(
                    self.process,
                    addr.as_usize() as *const c_void,
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                    &mut read,
                )
            };
            if ok == 0 || read != buf.len() {
                return Err(Error::MemoryAccessDenied(addr));
            }
            Ok(())
        }

        fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
            let mut written = 0usize;
            let ok = unsafe {
                WriteProcessMemory(
                    self.process,
                    addr.as_usize() as *const c_void,
                    data.as_ptr() as *const c_void,
                    data.len(),
                    &mut written,
                )
            };
            if ok == 0 || written != data.len() {
                return Err(Error::MemoryAccessDenied(addr));
            }
            Ok(())
        }

        fn flush_instruction_cache(
            &mut self,
            addr: RelocatedAddress,
            len: usize,
        ) -> Result<(), Error> {
            let ok = unsafe {
                FlushInstructionCache(self.process, addr.as_usize() as *const c_void, len)
            };
            if ok == 0 {
                return Err(Error::MemoryAccessDenied(addr));
            }
            Ok(())
        }

        fn registers(&mut self, thread_id: u32) -> Result<Registers, Error> {
            let handle = self.thread_handle(thread_id)?;
            read_context(handle, thread_id)
        }

        fn set_registers(&mut self, thread_id: u32, regs: &Registers) -> Result<(), Error> {
            let handle = self.thread_handle(thread_id)?;
            write_context(handle, thread_id, regs)
        }

        fn terminate(&mut self) -> Result<(), Error> {
            if self.exited {
                return Ok(());
            }
            let ok = unsafe { TerminateProcess(self.process, 1) };
            if ok == 0 {
                return Err(Error::ProcessLost(last_os_error()));
            }
            Ok(())
        }
    }

    impl Drop for Win32Driver {
        fn drop(&mut self) {
            for (_, handle) in self.threads.drain() {
                if handle != 0 && handle != INVALID_HANDLE_VALUE {
                    unsafe { CloseHandle(handle) };
                }
            }
            if self.process != 0 && self.process != INVALID_HANDLE_VALUE {
                unsafe { CloseHandle(self.process) };
            }
        }
    }

    #[cfg(target_arch = "x86")]
    fn read_context(handle: HANDLE, thread_id: u32) -> Result<Registers, Error> {
        use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT};

        let mut ctx: CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_FULL_I386;
        if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        Ok(Registers {
            eax: ctx.Eax,
            ebx: ctx.Ebx,
            ecx: ctx.Ecx,
            edx: ctx.Edx,
            esi: ctx.Esi,
            edi: ctx.Edi,
            ebp: ctx.Ebp,
            esp: ctx.Esp,
            eip: ctx.Eip,
            eflags: ctx.EFlags,
        })
    }

    #[cfg(target_arch = "x86")]
    fn write_context(handle: HANDLE, thread_id: u32, regs: &Registers) -> Result<(), Error> {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            GetThreadContext, SetThreadContext, CONTEXT,
        };

        let mut ctx: CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_FULL_I386;
        if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        ctx.Eax = regs.eax;
        ctx.Ebx = regs.ebx;
        ctx.Ecx = regs.ecx;
        ctx.Edx = regs.edx;
        ctx.Esi = regs.esi;
        ctx.Edi = regs.edi;
        ctx.Ebp = regs.ebp;
        ctx.Esp = regs.esp;
        ctx.Eip = regs.eip;
        ctx.EFlags = regs.eflags;
        if unsafe { SetThreadContext(handle, &ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn read_context(handle: HANDLE, thread_id: u32) -> Result<Registers, Error> {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            Wow64GetThreadContext, WOW64_CONTEXT,
        };

        let mut ctx: WOW64_CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_FULL_I386;
        if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        Ok(Registers {
            eax: ctx.Eax,
            ebx: ctx.Ebx,
            ecx: ctx.Ecx,
            edx: ctx.Edx,
            esi: ctx.Esi,
            edi: ctx.Edi,
            ebp: ctx.Ebp,
            esp: ctx.Esp,
            eip: ctx.Eip,
            eflags: ctx.EFlags,
        })
    }

    #[cfg(target_arch = "x86_64")]
    fn write_context(handle: HANDLE, thread_id: u32, regs: &Registers) -> Result<(), Error> {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            Wow64GetThreadContext, Wow64SetThreadContext, WOW64_CONTEXT,
        };

        let mut ctx: WOW64_CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_FULL_I386;
        if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        ctx.Eax = regs.eax;
        ctx.Ebx = regs.ebx;
        ctx.Ecx = regs.ecx;
        ctx.Edx = regs.edx;
        ctx.Esi = regs.esi;
        ctx.Edi = regs.edi;
        ctx.Ebp = regs.ebp;
        ctx.Esp = regs.esp;
        ctx.Eip = regs.eip;
        ctx.EFlags = regs.eflags;
        if unsafe { Wow64SetThreadContext(handle, &ctx) } == 0 {
            return Err(Error::ThreadNotFound(thread_id));
        }
        Ok(())
    }

    fn path_from_handle(handle: HANDLE) -> Option<PathBuf> {
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return None;
        }
        let mut buf = vec![0u16; 1024];
        let len = unsafe { GetFinalPathNameByHandleW(handle, buf.as_mut_ptr(), buf.len() as u32, 0) };
        if len == 0 || len as usize >= buf.len() {
            return None;
        }
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        Some(PathBuf::from(
            path.strip_prefix(r"\\?\").unwrap_or(&path).to_string(),
        ))
    }

    fn last_os_error() -> String {
        io::Error::last_os_error().to_string()
    }
}
