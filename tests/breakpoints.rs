//! Breakpoint manager behavior against a scripted target: planting,
//! restoration, pending resolution across module load and unload.

mod common;

use common::{simple_line_program, watcom_image, write_temp_image, CuSpec, MockDriver, EXE_BASE};
use std::collections::HashMap;
use watdbg::debugger::breakpoint::{BreakpointManager, BreakpointState, INT3};
use watdbg::debugger::debugee::registry::ModuleRegistry;
use watdbg::debugger::register::Registers;
use watdbg::debugger::RelocatedAddress;

const IMAGE_SIZE: u32 = 0x3000;
const TID: u32 = 7;

fn ra(addr: u32) -> RelocatedAddress {
    RelocatedAddress::from(addr)
}

/// Registry with one executable module carrying lines 4, 5 and 6 of
/// `simple.c` at offsets 0x1000, 0x1008 and 0x1010.
fn exe_registry() -> ModuleRegistry {
    let line = simple_line_program(Some(("simple.c", 0)), 0x1000, &[4, 5, 6]);
    let image = watcom_image(&[CuSpec::new("simple.c", "C:\\proj", 0)], &line, IMAGE_SIZE);
    let path = write_temp_image("bp-exe", &image);

    let mut registry = ModuleRegistry::new();
    registry.add(&path, ra(EXE_BASE));
    registry
}

fn mapped_driver() -> MockDriver {
    let mut driver = MockDriver::new(vec![]);
    driver.map_region(EXE_BASE, IMAGE_SIZE, 0x90);
    driver
}

#[test]
fn test_set_by_line_plants_int3() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    let bp = manager.get(id).unwrap();
    assert_eq!(bp.state, BreakpointState::Active);
    assert_eq!(bp.address, Some(ra(EXE_BASE + 0x1000)));
    assert_eq!(driver.byte_at(EXE_BASE + 0x1000), INT3);

    let views = manager.list(&registry);
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].state, "active");
    assert_eq!(views[0].line, Some(4));
}

#[test]
fn test_planting_is_reversible() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let before: HashMap<u32, u8> = driver.mem.clone();

    let mut manager = BreakpointManager::new();
    let a = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    let b = manager.set_by_line(&mut driver, &registry, "simple.c", 5);
    let c = manager.set_by_address(&mut driver, &registry, ra(EXE_BASE + 0x1010));

    assert_ne!(driver.mem, before);

    manager.remove(&mut driver, b);
    manager.remove(&mut driver, a);
    manager.remove(&mut driver, c);
    assert_eq!(driver.mem, before, "memory must be bitwise restored");
}

#[test]
fn test_remove_is_idempotent() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    manager.remove(&mut driver, id);
    manager.remove(&mut driver, id);
    assert!(manager.get(id).is_none());
}

#[test]
fn test_address_outside_modules_fails() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_address(&mut driver, &registry, ra(0x7000_0000));
    assert_eq!(manager.get(id).unwrap().state, BreakpointState::Failed);
}

#[test]
fn test_unreadable_target_fails_plant() {
    let registry = exe_registry();
    // image claims 0x3000 bytes but only the first page is mapped
    let mut driver = MockDriver::new(vec![]);
    driver.map_region(EXE_BASE, 0x1000, 0x90);
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    assert_eq!(manager.get(id).unwrap().state, BreakpointState::Failed);
}

#[test]
fn test_unresolvable_location_stays_pending() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "testdll.c", 7);
    let bp = manager.get(id).unwrap();
    assert_eq!(bp.state, BreakpointState::Pending);
    assert_eq!(bp.address, None);
}

#[test]
fn test_pending_resolves_on_module_load() {
    let mut registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "testdll.c", 7);
    assert_eq!(manager.get(id).unwrap().state, BreakpointState::Pending);

    // the dll arrives later, carrying testdll.c line 7 at offset 0x2000
    let dll_base = 0x1000_0000u32;
    let line = simple_line_program(Some(("testdll.c", 0)), 0x2000, &[7, 8]);
    let image = watcom_image(&[CuSpec::new("testdll.c", "C:\\proj\\dll", 0)], &line, IMAGE_SIZE);
    let dll_path = write_temp_image("bp-dll", &image);
    driver.map_region(dll_base, IMAGE_SIZE, 0x90);
    let module_id = registry.add(&dll_path, ra(dll_base));

    let resolved = manager.on_module_loaded(&mut driver, &registry, module_id);
    assert_eq!(resolved, 1);

    let bp = manager.get(id).unwrap();
    assert_eq!(bp.state, BreakpointState::Active);
    assert_eq!(bp.address, Some(ra(dll_base + 0x2000)));
    assert_eq!(driver.byte_at(dll_base + 0x2000), INT3);
}

#[test]
fn test_module_reload_restores_breakpoint_table() {
    let mut registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let dll_base = 0x1000_0000u32;
    let line = simple_line_program(Some(("testdll.c", 0)), 0x2000, &[7]);
    let image = watcom_image(&[CuSpec::new("testdll.c", "C:\\proj\\dll", 0)], &line, IMAGE_SIZE);
    let dll_path = write_temp_image("bp-dll-reload", &image);
    driver.map_region(dll_base, IMAGE_SIZE, 0x90);

    let id = manager.set_by_line(&mut driver, &registry, "testdll.c", 7);

    // first load
    let module_id = registry.add(&dll_path, ra(dll_base));
    manager.on_module_loaded(&mut driver, &registry, module_id);
    let first_addr = manager.get(id).unwrap().address;
    assert_eq!(manager.get(id).unwrap().state, BreakpointState::Active);

    // unload reverts to pending, the planted byte range is gone
    registry.remove_by_base(ra(dll_base));
    manager.on_module_unloaded(module_id);
    let bp = manager.get(id).unwrap();
    assert_eq!(bp.state, BreakpointState::Pending);
    assert_eq!(bp.address, None);
    driver.map_region(dll_base, IMAGE_SIZE, 0x90);

    // reload lands in the same state as the first load
    let module_id = registry.add(&dll_path, ra(dll_base));
    manager.on_module_loaded(&mut driver, &registry, module_id);
    let bp = manager.get(id).unwrap();
    assert_eq!(bp.state, BreakpointState::Active);
    assert_eq!(bp.address, first_addr);
    assert_eq!(driver.byte_at(dll_base + 0x2000), INT3);
}

#[test]
fn test_hit_restores_byte_and_rewinds_thread() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    let addr = manager.get(id).unwrap().address.unwrap();

    // INT 3 fired: the thread's instruction pointer is one past the
    // breakpoint byte
    driver.regs.insert(
        TID,
        Registers {
            eip: addr.as_u32() + 1,
            ..Default::default()
        },
    );

    let hit = manager.on_breakpoint_hit(&mut driver, TID, addr).unwrap();
    assert_eq!(hit, Some(id));
    assert_eq!(driver.byte_at(addr.as_u32()), 0x90, "original byte restored");
    assert_eq!(driver.regs[&TID].eip, addr.as_u32(), "instruction pointer rewound");
    assert_eq!(manager.get(id).unwrap().hit_count, 1);

    // after the stepped-over instruction retires the trap is re-planted
    assert!(manager.re_arm(&mut driver, addr).unwrap());
    assert_eq!(driver.byte_at(addr.as_u32()), INT3);
}

#[test]
fn test_foreign_breakpoint_is_not_claimed() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    let hit = manager
        .on_breakpoint_hit(&mut driver, TID, ra(EXE_BASE + 0x2f00))
        .unwrap();
    assert_eq!(hit, None);
}

#[test]
fn test_no_rearm_after_removal() {
    let registry = exe_registry();
    let mut driver = mapped_driver();
    let mut manager = BreakpointManager::new();

    let id = manager.set_by_line(&mut driver, &registry, "simple.c", 4);
    let addr = manager.get(id).unwrap().address.unwrap();

    driver.regs.insert(
        TID,
        Registers {
            eip: addr.as_u32() + 1,
            ..Default::default()
        },
    );
    manager.on_breakpoint_hit(&mut driver, TID, addr).unwrap();

    // user removes the breakpoint between the hit and the step
    manager.remove(&mut driver, id);
    assert!(!manager.re_arm(&mut driver, addr).unwrap());
    assert_eq!(driver.byte_at(addr.as_u32()), 0x90);
}
