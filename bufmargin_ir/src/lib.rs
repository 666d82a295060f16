//! A minimal intermediate representation for instrumentation targets.
//!
//! Programs are flat instruction lists over 64-bit virtual registers: just
//! enough of a compiler IR to express the shapes the instrumentation cares
//! about (typed loads and stores, direct and indirect calls, integer casts,
//! pointer arithmetic). A pass rewrites modules in place; [`interp`]
//! executes them.
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
))]

pub mod interp;

use thiserror::Error;

/// A virtual register holding a 64-bit value.
pub type ValueId = u32;

/// Handle to a declared callable in a [`Module`], as returned by
/// [`Module::resolve_or_declare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(u32);

/// Value types, by storage width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    /// No value (a procedure's return type).
    Void,
    /// 8-bit integer.
    I8,
    /// 16-bit integer.
    I16,
    /// 32-bit integer.
    I32,
    /// 64-bit integer; also the address width of the modeled target.
    I64,
}

impl Ty {
    /// Storage size in bytes; zero for [`Ty::Void`].
    #[must_use]
    pub const fn store_size(self) -> usize {
        match self {
            Ty::Void => 0,
            Ty::I8 => 1,
            Ty::I16 => 2,
            Ty::I32 => 4,
            Ty::I64 => 8,
        }
    }

    const fn mask(self) -> u64 {
        match self {
            Ty::Void => 0,
            Ty::I8 => 0xff,
            Ty::I16 => 0xffff,
            Ty::I32 => 0xffff_ffff,
            Ty::I64 => u64::MAX,
        }
    }
}

/// An instruction operand: a virtual register or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// The value of a register.
    Value(ValueId),
    /// A constant embedded in the instruction.
    Imm(u64),
}

/// A call target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// A statically named callable.
    Direct(FuncId),
    /// A computed target; never matched by instrumentation.
    Indirect(Operand),
}

/// One instruction. `dst` registers always receive a full 64-bit value;
/// narrow types only matter at memory and cast boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// `dst = value`
    Const {
        /// Destination register.
        dst: ValueId,
        /// The constant.
        value: u64,
    },
    /// `dst = lhs + rhs`, wrapping.
    Add {
        /// Destination register.
        dst: ValueId,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// `dst = src` truncated to `ty`.
    Cast {
        /// Destination register.
        dst: ValueId,
        /// Source operand.
        src: Operand,
        /// Width to truncate to.
        ty: Ty,
    },
    /// `dst = *(ty*)addr`
    Load {
        /// Destination register.
        dst: ValueId,
        /// Accessed address.
        addr: Operand,
        /// Static type of the access.
        ty: Ty,
    },
    /// `*(ty*)addr = value`
    Store {
        /// Accessed address.
        addr: Operand,
        /// Stored operand.
        value: Operand,
        /// Static type of the access.
        ty: Ty,
    },
    /// `dst = callee(args...)`
    Call {
        /// Destination register, absent for void calls.
        dst: Option<ValueId>,
        /// The call target.
        callee: Callee,
        /// Argument operands.
        args: Vec<Operand>,
    },
    /// Return from the function.
    Ret {
        /// Returned operand, if any.
        value: Option<Operand>,
    },
}

/// Errors raised while building or resolving module-level entities.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IrError {
    /// A symbol is already declared with a different signature.
    #[error("declaration signature mismatch for {name}")]
    SignatureMismatch {
        /// The conflicting symbol.
        name: String,
    },
}

/// An external callable's name and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDecl {
    /// Symbol name.
    pub name: String,
    /// Return type.
    pub ret: Ty,
    /// Parameter types.
    pub params: Vec<Ty>,
}

/// A function body: a name and a flat instruction list.
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// The instructions, in program order.
    pub insts: Vec<Inst>,
    next_value: ValueId,
}

impl Function {
    /// An empty function named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            next_value: 0,
        }
    }

    /// A fresh virtual register.
    pub fn fresh_value(&mut self) -> ValueId {
        let value = self.next_value;
        self.next_value += 1;
        value
    }

    /// How many registers this function uses.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.next_value as usize
    }

    /// Appends `dst = value` and returns `dst`.
    pub fn build_const(&mut self, value: u64) -> ValueId {
        let dst = self.fresh_value();
        self.insts.push(Inst::Const { dst, value });
        dst
    }

    /// Appends `dst = lhs + rhs` and returns `dst`.
    pub fn build_add(&mut self, lhs: Operand, rhs: Operand) -> ValueId {
        let dst = self.fresh_value();
        self.insts.push(Inst::Add { dst, lhs, rhs });
        dst
    }

    /// Appends a load of `ty` from `addr` and returns its destination.
    pub fn build_load(&mut self, ty: Ty, addr: Operand) -> ValueId {
        let dst = self.fresh_value();
        self.insts.push(Inst::Load { dst, addr, ty });
        dst
    }

    /// Appends a store of `value` as `ty` to `addr`.
    pub fn build_store(&mut self, ty: Ty, addr: Operand, value: Operand) {
        self.insts.push(Inst::Store { addr, value, ty });
    }

    /// Appends a call; returns the result register when `want_result`.
    pub fn build_call(
        &mut self,
        callee: Callee,
        args: Vec<Operand>,
        want_result: bool,
    ) -> Option<ValueId> {
        let dst = want_result.then(|| self.fresh_value());
        self.insts.push(Inst::Call { dst, callee, args });
        dst
    }

    /// Appends a return.
    pub fn build_ret(&mut self, value: Option<Operand>) {
        self.insts.push(Inst::Ret { value });
    }
}

/// A translation unit: declarations plus function bodies.
#[derive(Debug, Default)]
pub struct Module {
    /// Module name, for diagnostics.
    pub name: String,
    decls: Vec<FuncDecl>,
    /// The function bodies.
    pub functions: Vec<Function>,
}

impl Module {
    /// An empty module named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decls: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Returns the existing declaration of `name` after checking that its
    /// signature matches, or declares it. A mismatch is fatal to the
    /// caller: continuing would break the hook ABI in the built artifact.
    pub fn resolve_or_declare(
        &mut self,
        name: &str,
        ret: Ty,
        params: &[Ty],
    ) -> Result<FuncId, IrError> {
        if let Some(id) = self.lookup(name) {
            let decl = &self.decls[id.0 as usize];
            if decl.ret != ret || decl.params != params {
                return Err(IrError::SignatureMismatch {
                    name: name.to_string(),
                });
            }
            return Ok(id);
        }
        let id = FuncId(self.decls.len() as u32);
        self.decls.push(FuncDecl {
            name: name.to_string(),
            ret,
            params: params.to_vec(),
        });
        Ok(id)
    }

    /// The declaration handle for `name`, if present.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.decls
            .iter()
            .position(|decl| decl.name == name)
            .map(|idx| FuncId(idx as u32))
    }

    /// The declaration behind a handle.
    #[must_use]
    pub fn decl(&self, id: FuncId) -> &FuncDecl {
        &self.decls[id.0 as usize]
    }

    /// All declaration handles, in declaration order.
    pub fn decl_ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        (0..self.decls.len() as u32).map(FuncId)
    }

    /// The function body named `name`, if present.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|func| func.name == name)
    }
}
