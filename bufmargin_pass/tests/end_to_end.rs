//! Full-pipeline tests: build a small program in the IR, instrument it,
//! execute it under the interpreter with the hooks wired to
//! `bufmargin_targets`, then inspect the feedback maps like an engine
//! would after one execution.

use bufmargin_ir::{
    interp::{ExternHooks, Machine},
    Callee, Function, Module, Operand, Ty,
};
use bufmargin_pass::{
    AccessMode, BufPassBuilder, HOOK_ACCESS, HOOK_ACCESS_UNIT, HOOK_HANDLE_CALLOC,
    HOOK_HANDLE_FREE, HOOK_HANDLE_MALLOC, HOOK_HANDLE_REALLOC,
};
use bufmargin_targets::{
    __bufmargin_access, __bufmargin_access1, __bufmargin_handle_calloc, __bufmargin_handle_free,
    __bufmargin_handle_malloc, __bufmargin_handle_realloc, __bufmargin_reset,
    buf_end_map_mut_slice, buf_start_map_mut_slice,
};
use serial_test::serial;

/// Forwards instrumentation calls from the interpreted target into the
/// real runtime, the way the linker wires them in a native build.
struct RuntimeHooks;

impl ExternHooks for RuntimeHooks {
    fn call(&mut self, name: &str, args: &[u64]) -> Option<u64> {
        unsafe {
            match (name, args) {
                (HOOK_HANDLE_MALLOC, [k, ptr, size]) => {
                    __bufmargin_handle_malloc(*k as u32, *ptr as usize, *size as usize);
                }
                (HOOK_HANDLE_CALLOC, [k, ptr, elem_size, elem_cnt]) => {
                    __bufmargin_handle_calloc(
                        *k as u32,
                        *ptr as usize,
                        *elem_size as usize,
                        *elem_cnt as usize,
                    );
                }
                (HOOK_HANDLE_REALLOC, [k, old_ptr, new_ptr, size]) => {
                    __bufmargin_handle_realloc(
                        *k as u32,
                        *old_ptr as usize,
                        *new_ptr as usize,
                        *size as usize,
                    );
                }
                (HOOK_HANDLE_FREE, [ptr]) => __bufmargin_handle_free(*ptr as usize),
                (HOOK_ACCESS, [k, ptr, size]) => {
                    __bufmargin_access(*k as u32, *ptr as usize, *size as usize);
                }
                (HOOK_ACCESS_UNIT, [k, ptr]) => __bufmargin_access1(*k as u32, *ptr as usize),
                _ => panic!("unexpected extern call: {name}({args:?})"),
            }
        }
        None
    }
}

/// `p = malloc(10); *(u8*)(p + 12) = 0xff; free(p);`
fn overflowing_store_module() -> Module {
    let mut module = Module::new("demo");
    let malloc = module
        .resolve_or_declare("malloc", Ty::I64, &[Ty::I64])
        .unwrap();
    let free = module
        .resolve_or_declare("free", Ty::Void, &[Ty::I64])
        .unwrap();

    let mut func = Function::new("main");
    let size = func.build_const(10);
    let p = func
        .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
        .unwrap();
    let q = func.build_add(Operand::Value(p), Operand::Imm(12));
    let value = func.build_const(0xff);
    func.build_store(Ty::I8, Operand::Value(q), Operand::Value(value));
    func.build_call(Callee::Direct(free), vec![Operand::Value(p)], false);
    func.build_ret(None);
    module.functions.push(func);
    module
}

#[test]
#[serial]
fn test_overflowing_store_raises_end_margin() {
    let mut module = overflowing_store_module();
    let mut pass = BufPassBuilder::new().seed(0xb0f).build(&mut module).unwrap();
    pass.run(&mut module).unwrap();

    unsafe {
        __bufmargin_reset();
        Machine::new(&module, RuntimeHooks).run("main").unwrap();

        // the store lands two bytes past [p, p+10): end margin 3
        let end = buf_end_map_mut_slice();
        assert!(end.iter().any(|&v| v == 3));
        // its start margin is -12, stored truncated
        let start = buf_start_map_mut_slice();
        assert!(start.iter().any(|&v| v == (-12i32) as u32));
    }
}

#[test]
#[serial]
fn test_in_bounds_program_raises_no_positive_margin() {
    let mut module = Module::new("demo");
    let malloc = module
        .resolve_or_declare("malloc", Ty::I64, &[Ty::I64])
        .unwrap();
    let free = module
        .resolve_or_declare("free", Ty::Void, &[Ty::I64])
        .unwrap();

    let mut func = Function::new("main");
    let size = func.build_const(16);
    let p = func
        .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
        .unwrap();
    let value = func.build_const(0x7);
    func.build_store(Ty::I64, Operand::Value(p), Operand::Value(value));
    func.build_load(Ty::I64, Operand::Value(p));
    func.build_call(Callee::Direct(free), vec![Operand::Value(p)], false);
    func.build_ret(None);
    module.functions.push(func);

    let mut pass = BufPassBuilder::new().seed(0xb0f).build(&mut module).unwrap();
    pass.run(&mut module).unwrap();

    unsafe {
        __bufmargin_reset();
        Machine::new(&module, RuntimeHooks).run("main").unwrap();

        // every recorded end margin is non-positive (wrapped when stored):
        // nothing in (0, i32::MAX as u32] means no overflow proximity
        let end = buf_end_map_mut_slice();
        assert!(!end
            .iter()
            .any(|&v| v != 0 && (v as i32) > 0));
        let start = buf_start_map_mut_slice();
        assert!(!start
            .iter()
            .any(|&v| v != 0 && (v as i32) > 0));
    }
}

#[test]
#[serial]
fn test_memcpy_reading_before_buffer_raises_start_margin() {
    // src = malloc(32); dst = malloc(32); memcpy(dst, src - 8, 16);
    let mut module = Module::new("demo");
    let malloc = module
        .resolve_or_declare("malloc", Ty::I64, &[Ty::I64])
        .unwrap();
    let memcpy = module
        .resolve_or_declare("memcpy", Ty::I64, &[Ty::I64, Ty::I64, Ty::I64])
        .unwrap();

    let mut func = Function::new("main");
    let size = func.build_const(32);
    let src = func
        .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
        .unwrap();
    let dst = func
        .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
        .unwrap();
    // src - 8, as wrapping add
    let before = func.build_add(Operand::Value(src), Operand::Imm((-8i64) as u64));
    func.build_call(
        Callee::Direct(memcpy),
        vec![
            Operand::Value(dst),
            Operand::Value(before),
            Operand::Imm(16),
        ],
        true,
    );
    func.build_ret(None);
    module.functions.push(func);

    let mut pass = BufPassBuilder::new().seed(0x17).build(&mut module).unwrap();
    pass.run(&mut module).unwrap();

    unsafe {
        __bufmargin_reset();
        Machine::new(&module, RuntimeHooks).run("main").unwrap();

        let start = buf_start_map_mut_slice();
        assert!(start.iter().any(|&v| v == 8));
    }
}

#[test]
#[serial]
fn test_unit_sized_mode_end_to_end() {
    let mut module = overflowing_store_module();
    let mut pass = BufPassBuilder::new()
        .seed(0xb0f)
        .access_mode(AccessMode::UnitSized)
        .build(&mut module)
        .unwrap();
    pass.run(&mut module).unwrap();

    unsafe {
        __bufmargin_reset();
        Machine::new(&module, RuntimeHooks).run("main").unwrap();

        // unit accesses score the same single-byte store
        let end = buf_end_map_mut_slice();
        assert!(end.iter().any(|&v| v == 3));
    }
}

#[test]
#[serial]
fn test_reset_between_executions_clears_signal() {
    let mut module = overflowing_store_module();
    let mut pass = BufPassBuilder::new().seed(0xb0f).build(&mut module).unwrap();
    pass.run(&mut module).unwrap();

    unsafe {
        __bufmargin_reset();
        Machine::new(&module, RuntimeHooks).run("main").unwrap();
        assert!(buf_end_map_mut_slice().iter().any(|&v| v == 3));

        __bufmargin_reset();
        assert!(buf_end_map_mut_slice().iter().all(|&v| v == 0));
    }
}
