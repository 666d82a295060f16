//! A small interpreter for [`Module`]s.
//!
//! The machine owns a sparse, byte-granular guest memory and implements the
//! allocator and bulk-memory intrinsics (`malloc`, `calloc`, `realloc`,
//! `free`, `memcpy`, `memmove`, `memset`) against it. Calls to any other
//! external symbol are routed to an [`ExternHooks`] handler; this is how
//! inserted instrumentation calls reach their runtime.
//!
//! The machine never faults: loads from unmapped addresses read zero and
//! out-of-bounds stores land in the sparse memory like any other, matching
//! a target that has not (yet) crashed on a bad access.

use hashbrown::HashMap;
use thiserror::Error;

use crate::{Callee, Inst, Module, Operand};

/// Where the guest heap starts. Low addresses stay unmapped so a null-ish
/// pointer never resolves to an allocation.
const HEAP_BASE: u64 = 0x10000;

/// Gap kept between consecutive allocations, beyond size rounding.
const HEAP_GAP: u64 = 0x20;

/// Receives calls to external symbols the machine has no intrinsic for.
pub trait ExternHooks {
    /// Handles `name(args)`; returns the call's result value, if any.
    fn call(&mut self, name: &str, args: &[u64]) -> Option<u64>;
}

/// Ignores every extern call: executes a module as if uninstrumented.
#[derive(Debug, Default)]
pub struct NopHooks;

impl ExternHooks for NopHooks {
    fn call(&mut self, _name: &str, _args: &[u64]) -> Option<u64> {
        None
    }
}

/// Errors terminating an execution.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExecError {
    /// The requested entry function does not exist.
    #[error("function {0} not found")]
    NoSuchFunction(String),
    /// A call expected a result but its target produced none.
    #[error("call to {0} produced no result value")]
    MissingResult(String),
    /// Indirect call targets are not modeled.
    #[error("indirect call target {0:#x} is not callable")]
    BadIndirectCall(u64),
}

/// Sparse guest memory plus a bump allocator that never reuses ranges.
#[derive(Debug, Default)]
pub struct GuestMemory {
    bytes: HashMap<u64, u8>,
    live: HashMap<u64, u64>,
    brk: u64,
}

impl GuestMemory {
    /// Allocates `size` bytes and returns the base address.
    pub fn alloc(&mut self, size: u64) -> u64 {
        if self.brk == 0 {
            self.brk = HEAP_BASE;
        }
        let ptr = self.brk;
        self.brk += ((size.max(1) + 0xf) & !0xf) + HEAP_GAP;
        self.live.insert(ptr, size);
        ptr
    }

    /// Releases the allocation at `ptr`. Bytes stay readable; the address
    /// range is simply never handed out again.
    pub fn free(&mut self, ptr: u64) {
        self.live.remove(&ptr);
    }

    /// Allocates a new range, copies the surviving prefix, frees the old.
    pub fn realloc(&mut self, old_ptr: u64, size: u64) -> u64 {
        let new_ptr = self.alloc(size);
        if let Some(old_size) = self.live.get(&old_ptr).copied() {
            self.copy(new_ptr, old_ptr, old_size.min(size));
        }
        self.free(old_ptr);
        new_ptr
    }

    fn byte(&self, addr: u64) -> u8 {
        self.bytes.get(&addr).copied().unwrap_or(0)
    }

    /// Reads `len` bytes at `addr`, little endian. Unmapped bytes are zero.
    #[must_use]
    pub fn read(&self, addr: u64, len: usize) -> u64 {
        let mut out = 0u64;
        for i in 0..len.min(8) {
            out |= u64::from(self.byte(addr.wrapping_add(i as u64))) << (8 * i);
        }
        out
    }

    /// Writes the low `len` bytes of `value` at `addr`, little endian.
    pub fn write(&mut self, addr: u64, len: usize, value: u64) {
        for i in 0..len.min(8) {
            self.bytes
                .insert(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }

    /// Copies `len` bytes from `src` to `dst`, overlap-safe.
    pub fn copy(&mut self, dst: u64, src: u64, len: u64) {
        let data: Vec<u8> = (0..len).map(|i| self.byte(src.wrapping_add(i))).collect();
        for (i, byte) in data.into_iter().enumerate() {
            self.bytes.insert(dst.wrapping_add(i as u64), byte);
        }
    }

    /// Fills `len` bytes at `dst` with `value`.
    pub fn fill(&mut self, dst: u64, value: u8, len: u64) {
        for i in 0..len {
            self.bytes.insert(dst.wrapping_add(i), value);
        }
    }
}

/// Executes functions of one module.
#[derive(Debug)]
pub struct Machine<'m, H> {
    module: &'m Module,
    /// The guest memory, inspectable after a run.
    pub mem: GuestMemory,
    hooks: H,
}

impl<'m, H: ExternHooks> Machine<'m, H> {
    /// A machine over `module`, routing non-intrinsic extern calls to
    /// `hooks`.
    #[must_use]
    pub fn new(module: &'m Module, hooks: H) -> Self {
        Self {
            module,
            mem: GuestMemory::default(),
            hooks,
        }
    }

    fn operand(regs: &[u64], op: Operand) -> u64 {
        match op {
            Operand::Value(id) => regs[id as usize],
            Operand::Imm(value) => value,
        }
    }

    /// Runs the function named `name` to completion.
    pub fn run(&mut self, name: &str) -> Result<Option<u64>, ExecError> {
        let module = self.module;
        let func = module
            .function(name)
            .ok_or_else(|| ExecError::NoSuchFunction(name.to_string()))?;
        let mut regs = vec![0u64; func.value_count()];
        for inst in &func.insts {
            match inst {
                Inst::Const { dst, value } => regs[*dst as usize] = *value,
                Inst::Add { dst, lhs, rhs } => {
                    regs[*dst as usize] =
                        Self::operand(&regs, *lhs).wrapping_add(Self::operand(&regs, *rhs));
                }
                Inst::Cast { dst, src, ty } => {
                    regs[*dst as usize] = Self::operand(&regs, *src) & ty.mask();
                }
                Inst::Load { dst, addr, ty } => {
                    regs[*dst as usize] =
                        self.mem.read(Self::operand(&regs, *addr), ty.store_size());
                }
                Inst::Store { addr, value, ty } => {
                    self.mem.write(
                        Self::operand(&regs, *addr),
                        ty.store_size(),
                        Self::operand(&regs, *value),
                    );
                }
                Inst::Call { dst, callee, args } => {
                    let argv: Vec<u64> =
                        args.iter().map(|arg| Self::operand(&regs, *arg)).collect();
                    let callee_name = match callee {
                        Callee::Direct(id) => module.decl(*id).name.as_str(),
                        Callee::Indirect(op) => {
                            return Err(ExecError::BadIndirectCall(Self::operand(&regs, *op)))
                        }
                    };
                    let ret = self.dispatch(callee_name, &argv);
                    if let Some(dst) = dst {
                        regs[*dst as usize] = ret
                            .ok_or_else(|| ExecError::MissingResult(callee_name.to_string()))?;
                    }
                }
                Inst::Ret { value } => return Ok(value.map(|op| Self::operand(&regs, op))),
            }
        }
        Ok(None)
    }

    fn dispatch(&mut self, name: &str, args: &[u64]) -> Option<u64> {
        match (name, args) {
            ("malloc", [size]) => Some(self.mem.alloc(*size)),
            ("calloc", [elems, size]) => {
                let total = elems.wrapping_mul(*size);
                let ptr = self.mem.alloc(total);
                self.mem.fill(ptr, 0, total);
                Some(ptr)
            }
            ("realloc", [ptr, size]) => Some(self.mem.realloc(*ptr, *size)),
            ("free", [ptr]) => {
                self.mem.free(*ptr);
                None
            }
            ("memcpy" | "memmove", [dst, src, len]) => {
                self.mem.copy(*dst, *src, *len);
                Some(*dst)
            }
            ("memset", [dst, value, len]) => {
                self.mem.fill(*dst, *value as u8, *len);
                Some(*dst)
            }
            _ => self.hooks.call(name, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecError, ExternHooks, Machine, NopHooks};
    use crate::{Callee, Function, Module, Operand, Ty};

    fn module_with(func: Function) -> Module {
        let mut module = Module::new("test");
        module.functions.push(func);
        module
    }

    #[test]
    fn test_store_load_roundtrip() {
        let mut func = Function::new("main");
        let addr = func.build_const(0x500);
        let value = func.build_const(0xabcd);
        func.build_store(Ty::I16, Operand::Value(addr), Operand::Value(value));
        let out = func.build_load(Ty::I16, Operand::Value(addr));
        func.build_ret(Some(Operand::Value(out)));
        let module = module_with(func);

        let result = Machine::new(&module, NopHooks).run("main").unwrap();
        assert_eq!(result, Some(0xabcd));
    }

    #[test]
    fn test_cast_truncates() {
        let mut func = Function::new("main");
        let wide = func.build_const(0x1_2345);
        let narrow = func.fresh_value();
        func.insts.push(crate::Inst::Cast {
            dst: narrow,
            src: Operand::Value(wide),
            ty: Ty::I16,
        });
        func.build_ret(Some(Operand::Value(narrow)));
        let module = module_with(func);

        let result = Machine::new(&module, NopHooks).run("main").unwrap();
        assert_eq!(result, Some(0x2345));
    }

    #[test]
    fn test_malloc_memcpy_intrinsics() {
        let mut module = Module::new("test");
        let malloc = module
            .resolve_or_declare("malloc", Ty::I64, &[Ty::I64])
            .unwrap();
        let memcpy = module
            .resolve_or_declare("memcpy", Ty::I64, &[Ty::I64, Ty::I64, Ty::I64])
            .unwrap();

        let mut func = Function::new("main");
        let size = func.build_const(8);
        let src = func
            .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
            .unwrap();
        let dst = func
            .build_call(Callee::Direct(malloc), vec![Operand::Value(size)], true)
            .unwrap();
        let value = func.build_const(0x11223344);
        func.build_store(Ty::I32, Operand::Value(src), Operand::Value(value));
        func.build_call(
            Callee::Direct(memcpy),
            vec![
                Operand::Value(dst),
                Operand::Value(src),
                Operand::Value(size),
            ],
            false,
        );
        let out = func.build_load(Ty::I32, Operand::Value(dst));
        func.build_ret(Some(Operand::Value(out)));
        module.functions.push(func);

        let result = Machine::new(&module, NopHooks).run("main").unwrap();
        assert_eq!(result, Some(0x11223344));
    }

    #[test]
    fn test_unknown_extern_goes_to_hooks() {
        struct Recorder(Vec<(String, Vec<u64>)>);
        impl ExternHooks for Recorder {
            fn call(&mut self, name: &str, args: &[u64]) -> Option<u64> {
                self.0.push((name.to_string(), args.to_vec()));
                None
            }
        }

        let mut module = Module::new("test");
        let hook = module
            .resolve_or_declare("__probe", Ty::Void, &[Ty::I32])
            .unwrap();
        let mut func = Function::new("main");
        func.build_call(Callee::Direct(hook), vec![Operand::Imm(7)], false);
        func.build_ret(None);
        module.functions.push(func);

        let mut machine = Machine::new(&module, Recorder(Vec::new()));
        machine.run("main").unwrap();
        assert_eq!(machine.hooks.0, vec![("__probe".to_string(), vec![7])]);
    }

    #[test]
    fn test_missing_entry_function() {
        let module = Module::new("test");
        let err = Machine::new(&module, NopHooks).run("main").unwrap_err();
        assert_eq!(err, ExecError::NoSuchFunction("main".into()));
    }
}
