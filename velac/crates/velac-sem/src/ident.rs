//! Scoped identifier table.
//!
//! A flat declaration-ordered list searched innermost-block-first. Blocks
//! are numbered; every function body opens a fresh block. Leaving a block
//! removes its identifiers (the parser releases their held references
//! first) and reports the unused ones through the warning callback.

use std::cell::Cell;

use velac_lex::Tok;
use velac_util::{Symbol, TypeId};

use crate::builtin::BuiltinFn;
use crate::consts::Const;
use crate::module::Modules;
use crate::types::{Signature, Types};

/// What an identifier denotes. Functions are constants of `fn` type whose
/// value is the bytecode entry offset.
#[derive(Clone, Debug)]
pub enum IdentKind {
    Const(Const),
    /// Global variable: byte offset of its storage in the data section.
    GlobalVar { offset: u64 },
    /// Local variable: byte offset relative to the frame base.
    LocalVar { offset: i64 },
    Type,
    BuiltinFn(BuiltinFn),
    Module(usize),
}

#[derive(Clone, Debug)]
pub struct Ident {
    pub kind: IdentKind,
    pub name: Symbol,
    pub type_id: TypeId,
    pub module: usize,
    pub block: usize,
    pub exported: bool,
    pub used: Cell<bool>,
    pub temporary: bool,
    /// Set for method identifiers, which share names keyed by receiver.
    pub is_method: bool,
    /// For functions declared before their body is compiled: call sites
    /// awaiting the real entry offset.
    pub proto_fixups: Vec<usize>,
    pub line: u32,
}

/// One entry of the block stack.
#[derive(Clone, Debug)]
pub struct BlockSlot {
    pub block: usize,
    /// Set for function-body blocks: index of the function's identifier.
    pub fn_ident: Option<usize>,
    /// Accumulated local storage, in bytes, for function blocks.
    pub local_var_size: i64,
    pub has_return: bool,
}

/// The block stack.
pub struct Blocks {
    items: Vec<BlockSlot>,
    num_blocks: usize,
    /// Module currently being compiled.
    pub module: usize,
}

impl Blocks {
    pub fn new() -> Self {
        Self {
            items: vec![BlockSlot {
                block: 0,
                fn_ident: None,
                local_var_size: 0,
                has_return: false,
            }],
            num_blocks: 1,
            module: 0,
        }
    }

    pub fn enter(&mut self, fn_ident: Option<usize>) -> usize {
        let block = self.num_blocks;
        self.num_blocks += 1;
        self.items.push(BlockSlot {
            block,
            fn_ident,
            local_var_size: 0,
            has_return: false,
        });
        block
    }

    pub fn leave(&mut self) -> BlockSlot {
        debug_assert!(self.items.len() > 1, "cannot leave the global block");
        self.items.pop().expect("block stack is never empty")
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.items.last().expect("block stack is never empty").block
    }

    pub fn is_global(&self) -> bool {
        self.items.len() == 1
    }

    /// The innermost enclosing function block, if any.
    pub fn fn_block(&self) -> Option<&BlockSlot> {
        self.items.iter().rev().find(|b| b.fn_ident.is_some())
    }

    pub fn fn_block_mut(&mut self) -> Option<&mut BlockSlot> {
        self.items.iter_mut().rev().find(|b| b.fn_ident.is_some())
    }

    pub fn top_mut(&mut self) -> &mut BlockSlot {
        self.items.last_mut().expect("block stack is never empty")
    }

    /// Block numbers from innermost to outermost.
    pub fn stack(&self) -> impl Iterator<Item = usize> + '_ {
        self.items.iter().rev().map(|b| b.block)
    }
}

impl Default for Blocks {
    fn default() -> Self {
        Self::new()
    }
}

/// The identifier table.
pub struct Idents {
    items: Vec<Ident>,
    temp_suffix: u32,
}

impl Idents {
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(64),
            temp_suffix: 0,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Ident {
        &self.items[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut Ident {
        &mut self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Looks up an identifier, walking the block stack from innermost to
    /// outermost. `module` is the module to search (the current one for
    /// unqualified names); non-local identifiers must be exported. With a
    /// receiver type, only matching methods are found.
    pub fn find(
        &self,
        modules: &Modules,
        blocks: &Blocks,
        module: usize,
        name: Symbol,
        rcv_type: Option<TypeId>,
        types: &Types,
        mark_used: bool,
    ) -> Option<usize> {
        for block in blocks.stack() {
            for (index, ident) in self.items.iter().enumerate().rev() {
                if ident.name != name || ident.block != block {
                    continue;
                }
                if !(ident.module == 0 || ident.module == module) {
                    continue;
                }
                if ident.module != blocks.module && ident.module != 0 && !ident.exported {
                    continue;
                }
                match rcv_type {
                    Some(rcv) => {
                        if !ident.is_method {
                            continue;
                        }
                        let sig = types.get(ident.type_id).sig.as_ref().expect("method has fn type");
                        if !types.compatible_rcv(sig.params[1].type_id, rcv) {
                            continue;
                        }
                    }
                    None => {
                        if ident.is_method {
                            continue;
                        }
                    }
                }
                if mark_used {
                    ident.used.set(true);
                }
                return Some(index);
            }
        }
        None
    }

    fn add(&mut self, ident: Ident) -> Result<usize, String> {
        let duplicate = self.items.iter().any(|existing| {
            existing.name == ident.name
                && existing.block == ident.block
                && existing.module == ident.module
                && !existing.is_method
        });
        if duplicate {
            return Err("Duplicate identifier".to_string());
        }
        self.items.push(ident);
        Ok(self.items.len() - 1)
    }

    /// Adds a method, which may share its name with other methods as long
    /// as the receiver type differs.
    pub fn add_method(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        exported: bool,
        entry: i64,
        types: &Types,
        line: u32,
    ) -> Result<usize, String> {
        let sig = types.get(type_id).sig.as_ref().expect("method has fn type");
        let rcv = sig.params[1].type_id;
        let clash = self.items.iter().any(|existing| {
            existing.name == name
                && existing.block == 0
                && existing.module == module
                && types
                    .get(existing.type_id)
                    .sig
                    .as_ref()
                    .is_some_and(|s| s.is_method && types.compatible_rcv(s.params[1].type_id, rcv))
        });
        if clash {
            return Err("Duplicate method".to_string());
        }
        self.items.push(Ident {
            kind: IdentKind::Const(Const::Int(entry)),
            name,
            type_id,
            module,
            block: 0,
            exported,
            used: Cell::new(false),
            temporary: false,
            is_method: true,
            proto_fixups: Vec::new(),
            line,
        });
        Ok(self.items.len() - 1)
    }

    pub fn add_const(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        block: usize,
        exported: bool,
        value: Const,
        line: u32,
    ) -> Result<usize, String> {
        self.add(Ident {
            kind: IdentKind::Const(value),
            name,
            type_id,
            module,
            block,
            exported,
            used: Cell::new(false),
            temporary: false,
            is_method: false,
            proto_fixups: Vec::new(),
            line,
        })
    }

    pub fn add_global_var(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        exported: bool,
        offset: u64,
        line: u32,
    ) -> Result<usize, String> {
        self.add(Ident {
            kind: IdentKind::GlobalVar { offset },
            name,
            type_id,
            module,
            block: 0,
            exported,
            used: Cell::new(false),
            temporary: false,
            is_method: false,
            proto_fixups: Vec::new(),
            line,
        })
    }

    pub fn add_local_var(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        block: usize,
        offset: i64,
        temporary: bool,
        line: u32,
    ) -> Result<usize, String> {
        self.add(Ident {
            kind: IdentKind::LocalVar { offset },
            name,
            type_id,
            module,
            block,
            exported: false,
            used: Cell::new(temporary),
            temporary,
            is_method: false,
            proto_fixups: Vec::new(),
            line,
        })
    }

    pub fn add_type(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        block: usize,
        exported: bool,
        line: u32,
    ) -> Result<usize, String> {
        self.add(Ident {
            kind: IdentKind::Type,
            name,
            type_id,
            module,
            block,
            exported,
            used: Cell::new(false),
            temporary: false,
            is_method: false,
            proto_fixups: Vec::new(),
            line,
        })
    }

    pub fn add_builtin(&mut self, name: Symbol, type_id: TypeId, builtin: BuiltinFn) -> usize {
        self.items.push(Ident {
            kind: IdentKind::BuiltinFn(builtin),
            name,
            type_id,
            module: 0,
            block: 0,
            exported: true,
            used: Cell::new(true),
            temporary: false,
            is_method: false,
            proto_fixups: Vec::new(),
            line: 0,
        });
        self.items.len() - 1
    }

    pub fn add_module_alias(
        &mut self,
        name: Symbol,
        type_id: TypeId,
        module: usize,
        block: usize,
        target: usize,
        line: u32,
    ) -> Result<usize, String> {
        self.add(Ident {
            kind: IdentKind::Module(target),
            name,
            type_id,
            module,
            block,
            exported: false,
            used: Cell::new(true),
            temporary: false,
            is_method: false,
            proto_fixups: Vec::new(),
            line,
        })
    }

    /// Reserves frame storage for a local of the given type and returns its
    /// byte offset from the frame base. Locals start one slot past the
    /// layout slot and are slot-aligned.
    pub fn alloc_stack(&mut self, types: &Types, blocks: &mut Blocks, type_id: TypeId) -> Result<i64, String> {
        let size = types.size(type_id)?;
        let aligned = (size + 7) / 8 * 8;
        let fn_block = blocks
            .fn_block_mut()
            .ok_or_else(|| "Local variable outside a function".to_string())?;
        let offset = 24 + fn_block.local_var_size;
        fn_block.local_var_size += aligned;
        Ok(offset)
    }

    /// Byte offset from the frame base for parameter `index` of `sig`.
    /// The return address and the saved base pointer occupy the two slots
    /// just above the last parameter.
    pub fn param_offset(types: &Types, sig: &Signature, index: usize) -> Result<i64, String> {
        let mut first_slot = 0i64;
        for param in &sig.params[..index] {
            first_slot += types.param_slots(param.type_id)?;
        }
        let mut total_slots = first_slot;
        for param in &sig.params[index..] {
            total_slots += types.param_slots(param.type_id)?;
        }
        Ok(-8 * (1 + total_slots - first_slot))
    }

    /// Allocates a compiler temporary in the current function frame.
    pub fn alloc_temp_var(
        &mut self,
        types: &Types,
        blocks: &mut Blocks,
        interner: &mut velac_util::Interner,
        type_id: TypeId,
    ) -> Result<usize, String> {
        let offset = self.alloc_stack(types, blocks, type_id)?;
        self.temp_suffix += 1;
        let name = interner.intern(&format!("#temp{}", self.temp_suffix));
        self.add_local_var(name, type_id, blocks.module, blocks.current(), offset, true, 0)
    }

    /// Removes all identifiers of a block, returning them so the caller can
    /// release references and emit unused-identifier warnings.
    pub fn free_block(&mut self, block: usize) -> Vec<Ident> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if self.items[i].block == block && block != 0 {
                removed.push(self.items.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Appends a call-site fixup for a function declared but not yet given
    /// a body.
    pub fn add_proto_fixup(&mut self, index: usize, ip: usize) {
        self.items[index].proto_fixups.push(ip);
    }
}

impl Default for Idents {
    fn default() -> Self {
        Self::new()
    }
}

/// True for compiler-internal names hidden from user lookup.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('#')
}

/// True for the `_` placeholder, which is never registered.
pub fn is_placeholder_name(name: &str) -> bool {
    name == "_"
}

/// Unused-identifier warning filter: variables and constants that were
/// never read and are not exported or temporary.
pub fn warn_if_unused(ident: &Ident) -> bool {
    !ident.used.get()
        && !ident.exported
        && !ident.temporary
        && matches!(ident.kind, IdentKind::Const(_) | IdentKind::GlobalVar { .. } | IdentKind::LocalVar { .. })
}

/// The operators valid in increment/decrement statements.
pub fn inc_dec_op(tok: Tok) -> Option<Tok> {
    match tok {
        Tok::PlusPlus => Some(Tok::Plus),
        Tok::MinusMinus => Some(Tok::Minus),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimTypes;
    use crate::Param;
    use velac_util::Interner;

    fn setup() -> (Types, PrimTypes, Idents, Blocks, Modules, Interner) {
        let (types, prims) = Types::new();
        (types, prims, Idents::new(), Blocks::new(), Modules::new(), Interner::new())
    }

    #[test]
    fn test_find_in_nested_blocks() {
        let (types, prims, mut idents, mut blocks, modules, mut interner) = setup();
        let x = interner.intern("x");

        idents
            .add_const(x, prims.int_, 0, blocks.current(), true, Const::Int(1), 1)
            .unwrap();
        blocks.enter(None);
        let inner = idents
            .add_const(x, prims.bool_, 0, blocks.current(), false, Const::Int(0), 2)
            .unwrap();

        // Innermost shadows outermost
        let found = idents.find(&modules, &blocks, 0, x, None, &types, true).unwrap();
        assert_eq!(found, inner);

        blocks.leave();
        let found = idents.find(&modules, &blocks, 0, x, None, &types, true).unwrap();
        assert_eq!(idents.get(found).type_id, prims.int_);
    }

    #[test]
    fn test_duplicate_in_same_block() {
        let (_types, prims, mut idents, blocks, _modules, mut interner) = setup();
        let x = interner.intern("x");
        idents
            .add_const(x, prims.int_, 0, blocks.current(), false, Const::Int(1), 1)
            .unwrap();
        let err = idents
            .add_const(x, prims.int_, 0, blocks.current(), false, Const::Int(2), 2)
            .unwrap_err();
        assert_eq!(err, "Duplicate identifier");
    }

    #[test]
    fn test_module_visibility() {
        let (types, prims, mut idents, mut blocks, mut modules, mut interner) = setup();
        let a = modules.add("a.vl").unwrap();
        let b = modules.add("b.vl").unwrap();
        let secret = interner.intern("secret");
        let public = interner.intern("public");

        idents.add_const(secret, prims.int_, b, 0, false, Const::Int(1), 1).unwrap();
        idents.add_const(public, prims.int_, b, 0, true, Const::Int(2), 2).unwrap();

        blocks.module = a;
        // Qualified lookup into b: only exported identifiers are visible.
        assert!(idents.find(&modules, &blocks, b, secret, None, &types, false).is_none());
        assert!(idents.find(&modules, &blocks, b, public, None, &types, false).is_some());
    }

    #[test]
    fn test_local_offsets_are_slot_aligned(){
        let (types, prims, mut idents, mut blocks, _modules, mut interner) = setup();
        let f = interner.intern("f");
        let fn_ident = idents
            .add_const(f, prims.int_, 0, 0, false, Const::Int(0), 1)
            .unwrap();
        blocks.enter(Some(fn_ident));

        let o1 = idents.alloc_stack(&types, &mut blocks, prims.bool_).unwrap();
        let o2 = idents.alloc_stack(&types, &mut blocks, prims.int_).unwrap();
        assert_eq!(o1, 24);
        assert_eq!(o2, 32);
        assert_eq!(blocks.fn_block().unwrap().local_var_size, 16);
    }

    #[test]
    fn test_param_offsets() {
        let (mut types, prims, _idents, _blocks, _modules, _interner) = setup();
        let sig = Signature {
            params: vec![
                Param { name: Symbol::EMPTY, type_id: prims.any, default_val: None },
                Param { name: Symbol::EMPTY, type_id: prims.int_, default_val: None },
                Param { name: Symbol::EMPTY, type_id: prims.int_, default_val: None },
            ],
            num_default_params: 0,
            is_method: false,
            offset_from_self: 0,
            result: prims.void_,
        };
        types.fn_type(sig.clone(), 0);

        // 4 param slots total (any = 2): upvalue at -40, then -24, -16.
        assert_eq!(Idents::param_offset(&types, &sig, 0).unwrap(), -40);
        assert_eq!(Idents::param_offset(&types, &sig, 1).unwrap(), -24);
        assert_eq!(Idents::param_offset(&types, &sig, 2).unwrap(), -16);
    }

    #[test]
    fn test_free_block_returns_unused() {
        let (_types, prims, mut idents, mut blocks, _modules, mut interner) = setup();
        let x = interner.intern("x");
        let block = blocks.enter(None);
        idents.add_const(x, prims.int_, 0, block, false, Const::Int(1), 3).unwrap();

        let removed = idents.free_block(block);
        assert_eq!(removed.len(), 1);
        assert!(warn_if_unused(&removed[0]));
    }

    #[test]
    fn test_hidden_and_placeholder_names() {
        assert!(is_hidden_name("#temp1"));
        assert!(!is_hidden_name("temp"));
        assert!(is_placeholder_name("_"));
        assert!(!is_placeholder_name("_x"));
    }
}
