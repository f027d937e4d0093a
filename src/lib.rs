//! Source-level debugger for 32-bit Windows executables built with the Watcom
//! toolchain, which appends its DWARF 2 debug information to the PE image as
//! an ELF container instead of using standard debug sections.
//!
//! The [`debugger`] module contains the debugging core: container extraction,
//! line-number indexing, the module registry, software breakpoints and the
//! debug-event loop. The [`server`] module exposes the core to external
//! clients as a JSON-RPC 2.0 tool server over HTTP.

pub mod debugger;
pub mod log;
pub mod server;
