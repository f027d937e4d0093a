//! Shared test fixtures: a scripted process driver and synthetic debuggee
//! images with hand-assembled DWARF 2 payloads.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use watdbg::debugger::process::{
    ContinueDisposition, DebugEvent, EventInfo, ExceptionCode, ProcessDriver,
};
use watdbg::debugger::register::Registers;
use watdbg::debugger::{Error, RelocatedAddress};

pub const EXE_BASE: u32 = 0x0040_0000;
pub const DLL_BASE: u32 = 0x1000_0000;
pub const MAIN_TID: u32 = 100;
pub const MOCK_PID: u32 = 4242;

pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xc000_0005;

/// One scripted step of debuggee execution.
pub enum Step {
    /// Deliver this event verbatim.
    Event(EventInfo),
    /// Execution reaches an address: traps if INT 3 is planted there,
    /// passes through silently otherwise.
    BreakpointSite(u32),
}

/// Scripted stand-in for a live Win32 debuggee.
///
/// Debug events are delivered from a script, one per acknowledged wait, the
/// way the OS pump hands them out. Sparse byte memory backs reads and
/// writes, so breakpoint planting and restoration behave like the real
/// thing, including INT 3 hits at scripted execution points and trap-flag
/// single steps.
pub struct MockDriver {
    pub mem: HashMap<u32, u8>,
    pub regs: HashMap<u32, Registers>,
    pub continues: Vec<(u32, u32, ContinueDisposition)>,
    script: VecDeque<Step>,
    awaiting_ack: bool,
    trap_pending: Option<u32>,
    terminated: bool,
}

impl MockDriver {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            mem: HashMap::new(),
            regs: HashMap::new(),
            continues: vec![],
            script: script.into(),
            awaiting_ack: false,
            trap_pending: None,
            terminated: false,
        }
    }

    /// Back a memory range with the given fill byte.
    pub fn map_region(&mut self, base: u32, len: u32, fill: u8) {
        for offset in 0..len {
            self.mem.insert(base + offset, fill);
        }
    }

    pub fn byte_at(&self, addr: u32) -> u8 {
        self.mem[&addr]
    }
}

impl ProcessDriver for MockDriver {
    fn wait_event(&mut self, _timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        if self.awaiting_ack || self.terminated {
            return Ok(None);
        }

        if let Some(tid) = self.trap_pending.take() {
            let eip = self.regs.entry(tid).or_default().eip;
            self.awaiting_ack = true;
            return Ok(Some(DebugEvent {
                process_id: MOCK_PID,
                thread_id: tid,
                info: EventInfo::Exception {
                    code: ExceptionCode::SingleStep,
                    address: RelocatedAddress::from(eip),
                    first_chance: true,
                },
            }));
        }

        while let Some(step) = self.script.pop_front() {
            match step {
                Step::Event(info) => {
                    self.awaiting_ack = true;
                    return Ok(Some(DebugEvent {
                        process_id: MOCK_PID,
                        thread_id: MAIN_TID,
                        info,
                    }));
                }
                Step::BreakpointSite(addr) => {
                    if self.mem.get(&addr) == Some(&0xCC) {
                        // INT 3 executed, the reported instruction pointer is
                        // one past the breakpoint byte
                        self.regs.entry(MAIN_TID).or_default().eip = addr + 1;
                        self.awaiting_ack = true;
                        return Ok(Some(DebugEvent {
                            process_id: MOCK_PID,
                            thread_id: MAIN_TID,
                            info: EventInfo::Exception {
                                code: ExceptionCode::Breakpoint,
                                address: RelocatedAddress::from(addr),
                                first_chance: true,
                            },
                        }));
                    }
                }
            }
        }

        Ok(None)
    }

    fn continue_event(
        &mut self,
        process_id: u32,
        thread_id: u32,
        disposition: ContinueDisposition,
    ) -> Result<(), Error> {
        assert!(self.awaiting_ack, "continue without a pending event");
        self.awaiting_ack = false;
        self.continues.push((process_id, thread_id, disposition));
        if self.regs.entry(thread_id).or_default().single_step() {
            self.trap_pending = Some(thread_id);
        }
        Ok(())
    }

    fn read_memory(&mut self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        for (offset, slot) in buf.iter_mut().enumerate() {
            *slot = *self
                .mem
                .get(&(addr.as_u32() + offset as u32))
                .ok_or(Error::MemoryAccessDenied(addr))?;
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        for offset in 0..data.len() {
            let key = addr.as_u32() + offset as u32;
            if !self.mem.contains_key(&key) {
                return Err(Error::MemoryAccessDenied(addr));
            }
        }
        for (offset, byte) in data.iter().enumerate() {
            self.mem.insert(addr.as_u32() + offset as u32, *byte);
        }
        Ok(())
    }

    fn flush_instruction_cache(
        &mut self,
        _addr: RelocatedAddress,
        _len: usize,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn registers(&mut self, thread_id: u32) -> Result<Registers, Error> {
        Ok(*self.regs.entry(thread_id).or_default())
    }

    fn set_registers(&mut self, thread_id: u32, regs: &Registers) -> Result<(), Error> {
        self.regs.insert(thread_id, *regs);
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.terminated = true;
        self.script.clear();
        Ok(())
    }
}

// ------------------------------- image fixtures ----------------------------

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn push_uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn push_sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        let sign = byte & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(byte);
            break;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Hand-assembled DWARF 2 line number program.
pub struct LineProgramBuilder {
    files: Vec<(String, u64)>,
    dirs: Vec<String>,
    ops: Vec<u8>,
}

impl LineProgramBuilder {
    pub fn new() -> Self {
        Self {
            files: vec![],
            dirs: vec![],
            ops: vec![],
        }
    }

    /// Pre-populate the header file table, the standard producer layout.
    pub fn file(mut self, name: &str, dir: u64) -> Self {
        self.files.push((name.to_string(), dir));
        self
    }

    pub fn include_dir(mut self, dir: &str) -> Self {
        self.dirs.push(dir.to_string());
        self
    }

    pub fn set_address(mut self, addr: u32) -> Self {
        self.ops.push(0x00);
        push_uleb(&mut self.ops, 5);
        self.ops.push(0x02);
        push_u32(&mut self.ops, addr);
        self
    }

    /// DW_LNE_define_file: extend the file table mid-program.
    pub fn define_file(mut self, name: &str, dir: u64) -> Self {
        let mut payload = vec![0x03u8];
        push_cstr(&mut payload, name);
        push_uleb(&mut payload, dir);
        push_uleb(&mut payload, 0);
        push_uleb(&mut payload, 0);
        self.ops.push(0x00);
        push_uleb(&mut self.ops, payload.len() as u64);
        self.ops.extend_from_slice(&payload);
        self
    }

    pub fn advance_line(mut self, delta: i64) -> Self {
        self.ops.push(0x03);
        push_sleb(&mut self.ops, delta);
        self
    }

    pub fn advance_pc(mut self, delta: u64) -> Self {
        self.ops.push(0x02);
        push_uleb(&mut self.ops, delta);
        self
    }

    pub fn set_file(mut self, file: u64) -> Self {
        self.ops.push(0x04);
        push_uleb(&mut self.ops, file);
        self
    }

    pub fn set_column(mut self, column: u64) -> Self {
        self.ops.push(0x05);
        push_uleb(&mut self.ops, column);
        self
    }

    pub fn negate_stmt(mut self) -> Self {
        self.ops.push(0x06);
        self
    }

    pub fn copy(mut self) -> Self {
        self.ops.push(0x01);
        self
    }

    pub fn end_sequence(mut self) -> Self {
        self.ops.push(0x00);
        push_uleb(&mut self.ops, 1);
        self.ops.push(0x01);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut prologue = vec![];
        prologue.push(1u8); // minimum_instruction_length
        prologue.push(1u8); // default_is_stmt
        prologue.push(0xfbu8); // line_base -5
        prologue.push(14u8); // line_range
        prologue.push(13u8); // opcode_base
        prologue.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
        for dir in &self.dirs {
            push_cstr(&mut prologue, dir);
        }
        prologue.push(0);
        for (name, dir) in &self.files {
            push_cstr(&mut prologue, name);
            push_uleb(&mut prologue, *dir);
            push_uleb(&mut prologue, 0);
            push_uleb(&mut prologue, 0);
        }
        prologue.push(0);

        let mut body = vec![];
        push_u16(&mut body, 2); // version
        push_u32(&mut body, prologue.len() as u32); // header_length
        body.extend_from_slice(&prologue);
        body.extend_from_slice(&self.ops);

        let mut out = vec![];
        push_u32(&mut out, body.len() as u32); // unit_length
        out.extend_from_slice(&body);
        out
    }
}

/// One compilation unit for [`debug_info`].
pub struct CuSpec {
    pub name: String,
    pub comp_dir: String,
    pub stmt_offset: u32,
    /// Override the abbreviation table offset, a bogus value makes the
    /// unit unparsable.
    pub abbrev_offset: u32,
}

impl CuSpec {
    pub fn new(name: &str, comp_dir: &str, stmt_offset: u32) -> Self {
        Self {
            name: name.to_string(),
            comp_dir: comp_dir.to_string(),
            stmt_offset,
            abbrev_offset: 0,
        }
    }
}

/// `.debug_abbrev` with a single compile-unit abbreviation.
pub fn debug_abbrev() -> Vec<u8> {
    let mut out = vec![];
    push_uleb(&mut out, 1); // abbrev code
    push_uleb(&mut out, 0x11); // DW_TAG_compile_unit
    out.push(0); // DW_CHILDREN_no
    push_uleb(&mut out, 0x03); // DW_AT_name
    push_uleb(&mut out, 0x08); // DW_FORM_string
    push_uleb(&mut out, 0x1b); // DW_AT_comp_dir
    push_uleb(&mut out, 0x08); // DW_FORM_string
    push_uleb(&mut out, 0x10); // DW_AT_stmt_list
    push_uleb(&mut out, 0x06); // DW_FORM_data4
    push_uleb(&mut out, 0);
    push_uleb(&mut out, 0);
    out.push(0); // table terminator
    out
}

/// `.debug_info` for a list of compilation units.
pub fn debug_info(units: &[CuSpec]) -> Vec<u8> {
    let mut out = vec![];
    for unit in units {
        let mut die = vec![];
        push_uleb(&mut die, 1); // abbrev code
        push_cstr(&mut die, &unit.name);
        push_cstr(&mut die, &unit.comp_dir);
        push_u32(&mut die, unit.stmt_offset);

        let mut body = vec![];
        push_u16(&mut body, 2); // dwarf version
        push_u32(&mut body, unit.abbrev_offset);
        body.push(4); // address_size
        body.extend_from_slice(&die);

        push_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
    }
    out
}

/// Wrap DWARF sections into a minimal ELF32 relocatable object, the
/// container layout the Watcom toolchain appends to its PE output.
pub fn elf_container(info: &[u8], abbrev: &[u8], line: &[u8]) -> Vec<u8> {
    struct Section<'a> {
        name: &'a str,
        data: &'a [u8],
        sh_type: u32,
    }
    let sections = [
        Section {
            name: ".debug_abbrev",
            data: abbrev,
            sh_type: 1,
        },
        Section {
            name: ".debug_info",
            data: info,
            sh_type: 1,
        },
        Section {
            name: ".debug_line",
            data: line,
            sh_type: 1,
        },
    ];

    // .shstrtab
    let mut shstrtab = vec![0u8];
    let mut name_offsets = vec![];
    for section in &sections {
        name_offsets.push(shstrtab.len() as u32);
        push_cstr(&mut shstrtab, section.name);
    }
    let shstrtab_name_off = shstrtab.len() as u32;
    push_cstr(&mut shstrtab, ".shstrtab");

    const EHSIZE: u32 = 52;
    const SHENTSIZE: u32 = 40;
    let shnum = sections.len() as u32 + 2; // null + shstrtab

    let mut data_offsets = vec![];
    let mut cursor = EHSIZE;
    for section in &sections {
        data_offsets.push(cursor);
        cursor += section.data.len() as u32;
    }
    let shstrtab_off = cursor;
    cursor += shstrtab.len() as u32;
    let shoff = cursor;

    let mut out = vec![];
    // e_ident
    out.extend_from_slice(b"\x7fELF");
    out.push(1); // ELFCLASS32
    out.push(1); // ELFDATA2LSB
    out.push(1); // EV_CURRENT
    out.extend_from_slice(&[0u8; 9]);
    push_u16(&mut out, 1); // e_type REL
    push_u16(&mut out, 3); // e_machine EM_386
    push_u32(&mut out, 1); // e_version
    push_u32(&mut out, 0); // e_entry
    push_u32(&mut out, 0); // e_phoff
    push_u32(&mut out, shoff);
    push_u32(&mut out, 0); // e_flags
    push_u16(&mut out, EHSIZE as u16);
    push_u16(&mut out, 0); // e_phentsize
    push_u16(&mut out, 0); // e_phnum
    push_u16(&mut out, SHENTSIZE as u16);
    push_u16(&mut out, shnum as u16);
    push_u16(&mut out, (shnum - 1) as u16); // e_shstrndx
    assert_eq!(out.len(), EHSIZE as usize);

    for section in &sections {
        out.extend_from_slice(section.data);
    }
    out.extend_from_slice(&shstrtab);

    // section header table: null entry first
    out.extend_from_slice(&[0u8; SHENTSIZE as usize]);
    for (idx, section) in sections.iter().enumerate() {
        push_u32(&mut out, name_offsets[idx]);
        push_u32(&mut out, section.sh_type);
        push_u32(&mut out, 0); // sh_flags
        push_u32(&mut out, 0); // sh_addr
        push_u32(&mut out, data_offsets[idx]);
        push_u32(&mut out, section.data.len() as u32);
        push_u32(&mut out, 0); // sh_link
        push_u32(&mut out, 0); // sh_info
        push_u32(&mut out, 1); // sh_addralign
        push_u32(&mut out, 0); // sh_entsize
    }
    // shstrtab header
    push_u32(&mut out, shstrtab_name_off);
    push_u32(&mut out, 3); // SHT_STRTAB
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, shstrtab_off);
    push_u32(&mut out, shstrtab.len() as u32);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, 1);
    push_u32(&mut out, 0);

    out
}

/// Minimal headers of a 32-bit PE image with no sections.
pub fn pe_headers(size_of_image: u32) -> Vec<u8> {
    let mut out = vec![];

    // DOS header
    out.extend_from_slice(b"MZ");
    out.extend_from_slice(&[0u8; 0x3a]);
    push_u32(&mut out, 0x40); // e_lfanew
    assert_eq!(out.len(), 0x40);

    out.extend_from_slice(b"PE\0\0");

    // COFF file header
    push_u16(&mut out, 0x014c); // IMAGE_FILE_MACHINE_I386
    push_u16(&mut out, 0); // NumberOfSections
    push_u32(&mut out, 0); // TimeDateStamp
    push_u32(&mut out, 0); // PointerToSymbolTable
    push_u32(&mut out, 0); // NumberOfSymbols
    push_u16(&mut out, 224); // SizeOfOptionalHeader
    push_u16(&mut out, 0x0102); // executable, 32-bit

    // optional header, standard fields
    push_u16(&mut out, 0x010b); // PE32 magic
    out.push(0); // MajorLinkerVersion
    out.push(0); // MinorLinkerVersion
    push_u32(&mut out, 0); // SizeOfCode
    push_u32(&mut out, 0); // SizeOfInitializedData
    push_u32(&mut out, 0); // SizeOfUninitializedData
    push_u32(&mut out, 0x1000); // AddressOfEntryPoint
    push_u32(&mut out, 0x1000); // BaseOfCode
    push_u32(&mut out, 0x2000); // BaseOfData
    // optional header, windows fields
    push_u32(&mut out, EXE_BASE); // ImageBase
    push_u32(&mut out, 0x1000); // SectionAlignment
    push_u32(&mut out, 0x200); // FileAlignment
    push_u32(&mut out, 0x0004_0000); // OperatingSystemVersion
    push_u32(&mut out, 0); // ImageVersion
    push_u32(&mut out, 0x0004_0000); // SubsystemVersion
    push_u32(&mut out, 0); // Win32VersionValue
    push_u32(&mut out, size_of_image);
    push_u32(&mut out, 0x200); // SizeOfHeaders
    push_u32(&mut out, 0); // CheckSum
    push_u16(&mut out, 3); // IMAGE_SUBSYSTEM_WINDOWS_CUI
    push_u16(&mut out, 0); // DllCharacteristics
    push_u32(&mut out, 0x0010_0000); // SizeOfStackReserve
    push_u32(&mut out, 0x1000); // SizeOfStackCommit
    push_u32(&mut out, 0x0010_0000); // SizeOfHeapReserve
    push_u32(&mut out, 0x1000); // SizeOfHeapCommit
    push_u32(&mut out, 0); // LoaderFlags
    push_u32(&mut out, 16); // NumberOfRvaAndSizes
    out.extend_from_slice(&[0u8; 16 * 8]); // data directories

    out
}

/// A PE image with a DWARF-bearing ELF container appended, the Watcom
/// output layout.
pub fn watcom_image(units: &[CuSpec], line_section: &[u8], size_of_image: u32) -> Vec<u8> {
    let mut image = pe_headers(size_of_image);
    // normal image contents the container follows
    image.extend_from_slice(&[0x90u8; 64]);
    image.extend_from_slice(&elf_container(
        &debug_info(units),
        &debug_abbrev(),
        line_section,
    ));
    image
}

/// A line program for a single-file unit: rows at `base + i*8` for each
/// given line number, statement rows, one closed sequence.
pub fn simple_line_program(file: Option<(&str, u64)>, base: u32, lines: &[i64]) -> Vec<u8> {
    let mut builder = LineProgramBuilder::new();
    if let Some((name, dir)) = file {
        builder = builder.file(name, dir);
    }
    builder = builder.set_address(base);
    let mut current = 1i64;
    for (idx, line) in lines.iter().enumerate() {
        if idx > 0 {
            builder = builder.advance_pc(8);
        }
        builder = builder.advance_line(line - current).copy();
        current = *line;
    }
    builder = builder.advance_pc(8).end_sequence();
    builder.build()
}

/// Write fixture bytes to a unique temp file, returning its path.
pub fn write_temp_image(prefix: &str, data: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{prefix}-{}.exe", uuid::Uuid::new_v4()));
    std::fs::write(&path, data).expect("write fixture image");
    path
}
