//! The bufmargin instrumentation pass.
//!
//! One walk over every instruction of every function in a
//! [`Module`]: calls to the recognized allocator/memory vocabulary and
//! every scalar load and store get a call to the matching
//! `bufmargin_targets` hook inserted immediately after them, so that
//! results (the fresh pointer, the loaded value's address) are available
//! to the hook. Pointer and size operands are cast to the address-sized
//! integer type first, and each matched site gets a fresh
//! compile-time-constant random tag.
//!
//! Only direct, statically named calls are matched; indirect calls are
//! silently skipped (a known coverage gap, not a failure).
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
))]

use core::mem::take;

use bufmargin_ir::{Callee, FuncId, Function, Inst, IrError, Module, Operand, Ty, ValueId};
use hashbrown::HashMap;
use log::debug;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use thiserror::Error;

/// Hook receiving `(k, ptr, size)` after each `malloc`-shaped call.
pub const HOOK_HANDLE_MALLOC: &str = "__bufmargin_handle_malloc";
/// Hook receiving `(k, ptr, elem_size, elem_cnt)` after each `calloc`.
pub const HOOK_HANDLE_CALLOC: &str = "__bufmargin_handle_calloc";
/// Hook receiving `(k, old_ptr, new_ptr, size)` after each `realloc`.
pub const HOOK_HANDLE_REALLOC: &str = "__bufmargin_handle_realloc";
/// Hook receiving `(ptr)` after each `free`.
pub const HOOK_HANDLE_FREE: &str = "__bufmargin_handle_free";
/// Hook receiving `(k, ptr, size)` after each memory access.
pub const HOOK_ACCESS: &str = "__bufmargin_access";
/// Unit-sized fallback access hook, receiving `(k, ptr)`.
pub const HOOK_ACCESS_UNIT: &str = "__bufmargin_access1";

/// The address-sized integer type of the modeled target.
const WORD: Ty = Ty::I64;

/// How inserted access hooks report the accessed width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    /// Pass the statically known access size to [`HOOK_ACCESS`].
    #[default]
    SizeAware,
    /// Call [`HOOK_ACCESS_UNIT`], treating every access as one unit. For
    /// targets without reliable static type-size inference.
    UnitSized,
}

/// Errors aborting instrumentation. All of these are build-breaking: a
/// partially instrumented target would carry a broken hook contract.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PassError {
    /// A hook symbol already exists with a foreign signature.
    #[error(transparent)]
    Hook(#[from] IrError),
    /// A recognized callee is invoked with the wrong operand count.
    #[error("malformed {callee} call: expected {expected} arguments, found {found}")]
    MalformedCall {
        /// The matched vocabulary name.
        callee: &'static str,
        /// Operands the shape requires.
        expected: usize,
        /// Operands found at the call site.
        found: usize,
    },
    /// An allocation call discards its result, so there is no pointer to
    /// hand to the tracking hook.
    #[error("{callee} call site discards its result")]
    MissingResult {
        /// The matched vocabulary name.
        callee: &'static str,
    },
    /// A load or store of a zero-sized type.
    #[error("access instruction with zero-sized type")]
    ZeroSizedAccess,
}

/// The recognized allocator/memory vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemOp {
    Malloc,
    Calloc,
    Realloc,
    Free,
    Memcpy,
    Memmove,
    Memset,
}

impl MemOp {
    fn of_name(name: &str) -> Option<Self> {
        Some(match name {
            "malloc" => Self::Malloc,
            "calloc" => Self::Calloc,
            "realloc" => Self::Realloc,
            "free" => Self::Free,
            "memcpy" => Self::Memcpy,
            "memmove" => Self::Memmove,
            "memset" => Self::Memset,
            _ => return None,
        })
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Realloc => "realloc",
            Self::Free => "free",
            Self::Memcpy => "memcpy",
            Self::Memmove => "memmove",
            Self::Memset => "memset",
        }
    }
}

/// What to insert after a matched instruction: one variant per event
/// shape, carrying the operands the hook call needs.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Malloc {
        result: ValueId,
        size: Operand,
    },
    Calloc {
        result: ValueId,
        elem_size: Operand,
        elem_cnt: Operand,
    },
    Realloc {
        result: ValueId,
        old_ptr: Operand,
        size: Operand,
    },
    Free {
        ptr: Operand,
    },
    Copy {
        dst: Operand,
        src: Operand,
        size: Operand,
    },
    Fill {
        dst: Operand,
        size: Operand,
    },
    Access {
        addr: Operand,
        size: usize,
    },
}

/// Options for [`BufPass`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BufPassBuilder {
    seed: Option<u64>,
    mode: AccessMode,
}

impl BufPassBuilder {
    /// Default options: size-aware hooks, entropy-seeded site tags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the site-tag RNG seed. Tags differ per build otherwise.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Selects how access hooks report the accessed width.
    #[must_use]
    pub fn access_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolves or declares the hook symbols in `module` and builds the
    /// pass. Fails if a hook symbol is already declared with a foreign
    /// signature.
    pub fn build(self, module: &mut Module) -> Result<BufPass, PassError> {
        let handle_malloc =
            module.resolve_or_declare(HOOK_HANDLE_MALLOC, Ty::Void, &[Ty::I32, WORD, WORD])?;
        let handle_calloc =
            module.resolve_or_declare(HOOK_HANDLE_CALLOC, Ty::Void, &[Ty::I32, WORD, WORD, WORD])?;
        let handle_realloc = module.resolve_or_declare(
            HOOK_HANDLE_REALLOC,
            Ty::Void,
            &[Ty::I32, WORD, WORD, WORD],
        )?;
        let handle_free = module.resolve_or_declare(HOOK_HANDLE_FREE, Ty::Void, &[WORD])?;
        let access = module.resolve_or_declare(HOOK_ACCESS, Ty::Void, &[Ty::I32, WORD, WORD])?;
        let access_unit =
            module.resolve_or_declare(HOOK_ACCESS_UNIT, Ty::Void, &[Ty::I32, WORD])?;

        let vocab = module
            .decl_ids()
            .filter_map(|id| MemOp::of_name(&module.decl(id).name).map(|op| (id, op)))
            .collect();

        Ok(BufPass {
            rng: self
                .seed
                .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            mode: self.mode,
            vocab,
            handle_malloc,
            handle_calloc,
            handle_realloc,
            handle_free,
            access,
            access_unit,
        })
    }
}

/// The instrumentation pass. Build once per module, [`run`](Self::run)
/// once.
#[derive(Debug)]
pub struct BufPass {
    rng: StdRng,
    mode: AccessMode,
    vocab: HashMap<FuncId, MemOp>,
    handle_malloc: FuncId,
    handle_calloc: FuncId,
    handle_realloc: FuncId,
    handle_free: FuncId,
    access: FuncId,
    access_unit: FuncId,
}

impl BufPass {
    /// A pass over `module` with default options.
    pub fn new(module: &mut Module) -> Result<Self, PassError> {
        BufPassBuilder::new().build(module)
    }

    /// Instruments every function of `module` in place.
    pub fn run(&mut self, module: &mut Module) -> Result<(), PassError> {
        for func in &mut module.functions {
            self.instrument_function(func)?;
        }
        Ok(())
    }

    fn instrument_function(&mut self, func: &mut Function) -> Result<(), PassError> {
        let insts = take(&mut func.insts);
        let mut out = Vec::with_capacity(insts.len());
        let mut sites = 0usize;
        for inst in insts {
            let plan = self.plan(&inst)?;
            out.push(inst);
            if let Some(plan) = plan {
                self.emit(plan, func, &mut out);
                sites += 1;
            }
        }
        func.insts = out;
        debug!("{}: instrumented {sites} sites", func.name);
        Ok(())
    }

    /// Matches one instruction against the vocabulary and extracts the
    /// operands its hook needs. Structural violations at a matched site
    /// (wrong arity, discarded allocation result, zero-sized access) are
    /// instrumentation-vocabulary bugs and abort the build.
    fn plan(&self, inst: &Inst) -> Result<Option<Plan>, PassError> {
        let plan = match inst {
            Inst::Load { addr, ty, .. } => Plan::Access {
                addr: *addr,
                size: Self::access_size(*ty)?,
            },
            Inst::Store { addr, ty, .. } => Plan::Access {
                addr: *addr,
                size: Self::access_size(*ty)?,
            },
            Inst::Call {
                dst,
                callee: Callee::Direct(id),
                args,
            } => {
                let Some(&op) = self.vocab.get(id) else {
                    return Ok(None);
                };
                Self::check_arity(op, args)?;
                match op {
                    MemOp::Malloc => Plan::Malloc {
                        result: Self::need_result(op, *dst)?,
                        size: args[0],
                    },
                    MemOp::Calloc => Plan::Calloc {
                        result: Self::need_result(op, *dst)?,
                        elem_size: args[0],
                        elem_cnt: args[1],
                    },
                    MemOp::Realloc => Plan::Realloc {
                        result: Self::need_result(op, *dst)?,
                        old_ptr: args[0],
                        size: args[1],
                    },
                    MemOp::Free => Plan::Free { ptr: args[0] },
                    MemOp::Memcpy | MemOp::Memmove => Plan::Copy {
                        dst: args[0],
                        src: args[1],
                        size: args[2],
                    },
                    MemOp::Memset => Plan::Fill {
                        dst: args[0],
                        size: args[2],
                    },
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(plan))
    }

    fn access_size(ty: Ty) -> Result<usize, PassError> {
        match ty.store_size() {
            0 => Err(PassError::ZeroSizedAccess),
            size => Ok(size),
        }
    }

    fn check_arity(op: MemOp, args: &[Operand]) -> Result<(), PassError> {
        let expected = match op {
            MemOp::Malloc | MemOp::Free => 1,
            MemOp::Calloc | MemOp::Realloc => 2,
            MemOp::Memcpy | MemOp::Memmove | MemOp::Memset => 3,
        };
        if args.len() != expected {
            return Err(PassError::MalformedCall {
                callee: op.name(),
                expected,
                found: args.len(),
            });
        }
        Ok(())
    }

    fn need_result(op: MemOp, dst: Option<ValueId>) -> Result<ValueId, PassError> {
        dst.ok_or(PassError::MissingResult { callee: op.name() })
    }

    /// A fresh compile-time-constant tag for one instrumentation site.
    fn site_tag(&mut self) -> u32 {
        self.rng.next_u32()
    }

    /// Casts `src` to the address-sized integer type, appending the cast.
    fn cast_to_word(func: &mut Function, out: &mut Vec<Inst>, src: Operand) -> Operand {
        let dst = func.fresh_value();
        out.push(Inst::Cast {
            dst,
            src,
            ty: WORD,
        });
        Operand::Value(dst)
    }

    fn push_hook_call(out: &mut Vec<Inst>, hook: FuncId, args: Vec<Operand>) {
        out.push(Inst::Call {
            dst: None,
            callee: Callee::Direct(hook),
            args,
        });
    }

    /// Scores one access site: cast the address, then call the access hook
    /// configured by [`AccessMode`].
    fn emit_access(&mut self, func: &mut Function, out: &mut Vec<Inst>, addr: Operand, size: usize) {
        let k = Operand::Imm(u64::from(self.site_tag()));
        let addr = Self::cast_to_word(func, out, addr);
        match self.mode {
            AccessMode::SizeAware => {
                Self::push_hook_call(out, self.access, vec![k, addr, Operand::Imm(size as u64)]);
            }
            AccessMode::UnitSized => {
                Self::push_hook_call(out, self.access_unit, vec![k, addr]);
            }
        }
    }

    /// Like [`emit_access`](Self::emit_access), but for a size known only
    /// as a runtime operand (the bulk-memory shapes).
    fn emit_bulk_access(
        &mut self,
        func: &mut Function,
        out: &mut Vec<Inst>,
        addr: Operand,
        size: Operand,
    ) {
        let k = Operand::Imm(u64::from(self.site_tag()));
        match self.mode {
            AccessMode::SizeAware => {
                Self::push_hook_call(out, self.access, vec![k, addr, size]);
            }
            AccessMode::UnitSized => {
                Self::push_hook_call(out, self.access_unit, vec![k, addr]);
            }
        }
    }

    fn emit(&mut self, plan: Plan, func: &mut Function, out: &mut Vec<Inst>) {
        match plan {
            Plan::Malloc { result, size } => {
                let k = Operand::Imm(u64::from(self.site_tag()));
                let size = Self::cast_to_word(func, out, size);
                let ptr = Self::cast_to_word(func, out, Operand::Value(result));
                Self::push_hook_call(out, self.handle_malloc, vec![k, ptr, size]);
            }
            Plan::Calloc {
                result,
                elem_size,
                elem_cnt,
            } => {
                let k = Operand::Imm(u64::from(self.site_tag()));
                let elem_size = Self::cast_to_word(func, out, elem_size);
                let elem_cnt = Self::cast_to_word(func, out, elem_cnt);
                let ptr = Self::cast_to_word(func, out, Operand::Value(result));
                Self::push_hook_call(
                    out,
                    self.handle_calloc,
                    vec![k, ptr, elem_size, elem_cnt],
                );
            }
            Plan::Realloc {
                result,
                old_ptr,
                size,
            } => {
                let k = Operand::Imm(u64::from(self.site_tag()));
                let old_ptr = Self::cast_to_word(func, out, old_ptr);
                let size = Self::cast_to_word(func, out, size);
                let ptr = Self::cast_to_word(func, out, Operand::Value(result));
                Self::push_hook_call(out, self.handle_realloc, vec![k, old_ptr, ptr, size]);
            }
            Plan::Free { ptr } => {
                let ptr = Self::cast_to_word(func, out, ptr);
                Self::push_hook_call(out, self.handle_free, vec![ptr]);
            }
            Plan::Copy { dst, src, size } => {
                let dst = Self::cast_to_word(func, out, dst);
                let src = Self::cast_to_word(func, out, src);
                let size = Self::cast_to_word(func, out, size);
                self.emit_bulk_access(func, out, src, size);
                self.emit_bulk_access(func, out, dst, size);
            }
            Plan::Fill { dst, size } => {
                let dst = Self::cast_to_word(func, out, dst);
                let size = Self::cast_to_word(func, out, size);
                self.emit_bulk_access(func, out, dst, size);
            }
            Plan::Access { addr, size } => {
                self.emit_access(func, out, addr, size);
            }
        }
    }
}
