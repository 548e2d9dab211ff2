//! Declarations: `import`, `type`, `const`, `var`, `fn`, and the module
//! driver.

use std::rc::Rc;

use velac_gen::GotosKind;
use velac_lex::{Lexer, Tok};
use velac_sem::types::Param;
use velac_sem::{ident, Const, IdentKind, Signature, TypeKind};
use velac_util::{CompileResult, Symbol, TypeId};

use crate::compiler::Compiler;
use crate::expr::ExprAttrs;

impl Compiler {
    /// Parses one module: imports first, then declarations, then forward
    /// and prototype resolution.
    pub(crate) fn parse_module(&mut self) -> CompileResult<()> {
        while self.check(Tok::Semicolon) {
            self.next()?;
        }
        while self.check(Tok::Import) {
            self.parse_import()?;
        }
        let protos_start = self.idents.len();
        while !self.check(Tok::Eof) {
            self.parse_decl()?;
        }
        self.resolve_forwards(true)?;
        self.finish_prototypes(protos_start)?;
        Ok(())
    }

    fn parse_decl(&mut self) -> CompileResult<()> {
        self.sync_debug();
        match self.lex.tok.kind {
            Tok::Type => self.parse_type_decl(),
            Tok::Const => self.parse_const_decl(),
            Tok::Var => self.parse_var_decl(),
            Tok::Fn => self.parse_fn_decl(),
            Tok::Semicolon | Tok::ImplicitSemicolon => self.next(),
            Tok::Import => Err(self.error("Imports must precede all other declarations")),
            other => Err(self.error(format!("Unexpected {}", other.spelling()))),
        }
    }

    /// Runs `item` once, or over a parenthesised group of items.
    fn parse_items(&mut self, mut item: impl FnMut(&mut Self) -> CompileResult<()>) -> CompileResult<()> {
        if self.check(Tok::LPar) {
            self.next()?;
            while !self.check(Tok::RPar) {
                item(self)?;
                self.eat(Tok::Semicolon)?;
            }
            self.eat(Tok::RPar)?;
        } else {
            item(self)?;
        }
        self.eat(Tok::Semicolon)
    }

    // --- import

    fn parse_import(&mut self) -> CompileResult<()> {
        self.next()?;
        self.parse_items(|c| c.parse_import_item())
    }

    fn parse_import_item(&mut self) -> CompileResult<()> {
        if self.lex.tok.kind != Tok::StrLiteral {
            return Err(self.error("Unexpected token, expected module path string"));
        }
        let path = self.interner.resolve(self.lex.tok.str_val).to_string();
        let line = self.lex.tok.line;
        self.next()?;

        let target = match self.modules.find(&path) {
            Some(index) => index,
            None => self.import_module(&path)?,
        };
        self.modules.add_import(self.blocks.module, target);

        let alias = velac_sem::Modules::name_from_path(&path).to_string();
        let alias_sym = self.interner.intern(&alias);
        self.idents
            .add_module_alias(alias_sym, self.prims.void_, self.blocks.module, 0, target, line)
            .map_err(|msg| self.error(msg))?;
        Ok(())
    }

    /// Compiles an imported module in place, then restores the lexer.
    fn import_module(&mut self, path: &str) -> CompileResult<usize> {
        let source = self
            .load_module_source(path)
            .ok_or_else(|| self.error(format!("Unable to load module {path}")))?;
        let module = self.modules.add(path).map_err(|msg| self.error(msg))?;

        let file_name: Rc<str> = Rc::from(path);
        let saved_lex = std::mem::replace(&mut self.lex, Lexer::new(Rc::clone(&file_name), Rc::from(source.as_str())));
        let saved_module = self.blocks.module;
        self.blocks.module = module;

        self.next()?;
        let result = self.parse_module();

        self.blocks.module = saved_module;
        self.lex = saved_lex;
        result?;
        self.modules.get_mut(module).is_compiled = true;
        Ok(module)
    }

    // --- type declarations

    pub(crate) fn parse_type_decl(&mut self) -> CompileResult<()> {
        self.next()?;
        self.types.forward_enabled = true;
        let result = self.parse_items(|c| c.parse_type_decl_item());
        self.types.forward_enabled = false;
        result?;
        self.resolve_forwards(false)
    }

    fn parse_type_decl_item(&mut self) -> CompileResult<()> {
        let line = self.lex.tok.line;
        let name = self.eat_ident()?;
        let exported = self.parse_export_mark()?;
        self.eat(Tok::Eq)?;
        let type_id = self.parse_type()?;
        let index = self
            .idents
            .add_type(name, type_id, self.blocks.module, self.blocks.current(), exported, line)
            .map_err(|msg| self.error(msg))?;
        if self.types.get(type_id).ident.is_none() {
            self.types.get_mut(type_id).ident = Some(index);
        }
        Ok(())
    }

    /// `*` after a declared name exports it from its module.
    pub(crate) fn parse_export_mark(&mut self) -> CompileResult<bool> {
        if self.check(Tok::Mul) {
            self.next()?;
            if !self.blocks.is_global() {
                return Err(self.error("Local identifier cannot be exported"));
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Resolves pending forward type declarations; with `final_pass`, any
    /// left unresolved is an error.
    fn resolve_forwards(&mut self, final_pass: bool) -> CompileResult<()> {
        for forward in self.types.unresolved_forwards() {
            let Some((module, name)) = self.types.get(forward).forward_name else {
                continue;
            };
            let found = self
                .idents
                .find(&self.modules, &self.blocks, module, name, None, &self.types, false);
            match found {
                Some(index) if matches!(self.idents.get(index).kind, IdentKind::Type) => {
                    let resolved = self.idents.get(index).type_id;
                    self.types.resolve_forward(forward, resolved);
                }
                _ if final_pass => {
                    let name = self.interner.resolve(name).to_string();
                    return Err(self.error(format!("Unresolved forward type declaration {name}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // --- types

    pub(crate) fn parse_type(&mut self) -> CompileResult<TypeId> {
        let block = self.blocks.current();
        match self.lex.tok.kind {
            Tok::Caret => {
                self.next()?;
                let base = self.parse_type()?;
                Ok(self.types.ptr_to(base, block))
            }
            Tok::Weak => {
                self.next()?;
                self.eat(Tok::Caret)?;
                let base = self.parse_type()?;
                Ok(self.types.weak_ptr_to(base, block))
            }
            Tok::LBracket => {
                self.next()?;
                if self.check(Tok::RBracket) {
                    self.next()?;
                    let base = self.parse_type()?;
                    Ok(self.types.dyn_array_of(base, block))
                } else {
                    let (_, konst) = self.parse_const_expr()?;
                    let len = konst.int_val();
                    if len < 0 {
                        return Err(self.error("Array length must be nonnegative"));
                    }
                    self.eat(Tok::RBracket)?;
                    let base = self.parse_type()?;
                    Ok(self.types.array_of(base, len, block))
                }
            }
            Tok::Map => {
                self.next()?;
                self.eat(Tok::LBracket)?;
                let key = self.parse_type()?;
                self.eat(Tok::RBracket)?;
                let item = self.parse_type()?;
                self.types
                    .map_of(key, item, block, &mut self.interner)
                    .map_err(|msg| self.error(msg))
            }
            Tok::Str => {
                self.next()?;
                Ok(self.prims.str_)
            }
            Tok::Struct => self.parse_struct_type(),
            Tok::Interface => self.parse_interface_type(),
            Tok::Fn => {
                self.next()?;
                let sig = self.parse_signature(None)?;
                let fn_type = self.types.fn_type(sig, block);
                Ok(self
                    .types
                    .closure_of(fn_type, self.prims.any, block, &mut self.interner))
            }
            Tok::Ident => {
                let (module, name) = self.parse_qualified_name()?;
                let found = self
                    .idents
                    .find(&self.modules, &self.blocks, module, name, None, &self.types, true);
                match found {
                    Some(index) if matches!(self.idents.get(index).kind, IdentKind::Type) => {
                        Ok(self.idents.get(index).type_id)
                    }
                    Some(_) => Err(self.error("Type expected")),
                    None if self.types.forward_enabled => {
                        Ok(self.types.add_forward(block, module, name))
                    }
                    None => {
                        let name = self.interner.resolve(name).to_string();
                        Err(self.error(format!("Unknown type {name}")))
                    }
                }
            }
            other => Err(self.error(format!("Unexpected {}, expected type", other.spelling()))),
        }
    }

    /// `name` or `module::name`; returns the module to search.
    pub(crate) fn parse_qualified_name(&mut self) -> CompileResult<(usize, Symbol)> {
        let name = self.eat_ident()?;
        if !self.check(Tok::ColonColon) {
            return Ok((self.blocks.module, name));
        }
        let found = self
            .idents
            .find(&self.modules, &self.blocks, self.blocks.module, name, None, &self.types, true);
        let Some(index) = found else {
            let name = self.interner.resolve(name).to_string();
            return Err(self.error(format!("Unknown module {name}")));
        };
        let IdentKind::Module(target) = self.idents.get(index).kind else {
            return Err(self.error("Module expected before ::"));
        };
        self.next()?;
        let name = self.eat_ident()?;
        Ok((target, name))
    }

    fn parse_struct_type(&mut self) -> CompileResult<TypeId> {
        self.next()?;
        self.eat(Tok::LBrace)?;
        let block = self.blocks.current();
        let struct_type = self.types.add(TypeKind::Struct, block);
        while !self.check(Tok::RBrace) {
            let mut names = vec![self.eat_ident()?];
            while self.check(Tok::Comma) {
                self.next()?;
                names.push(self.eat_ident()?);
            }
            self.eat(Tok::Colon)?;
            let field_type = self.parse_type()?;
            for name in names {
                self.types
                    .add_field(struct_type, name, field_type)
                    .map_err(|msg| self.error(msg))?;
            }
            self.eat(Tok::Semicolon)?;
        }
        self.eat(Tok::RBrace)?;
        Ok(struct_type)
    }

    fn parse_interface_type(&mut self) -> CompileResult<TypeId> {
        self.next()?;
        self.eat(Tok::LBrace)?;
        let block = self.blocks.current();
        let iface = self.types.add(TypeKind::Interface, block);
        self.types.add_interface_header_fields(iface, self.prims.ptr_void);
        while !self.check(Tok::RBrace) {
            let name = self.eat_ident()?;
            let self_param = (self.interner.intern("#self"), self.prims.ptr_void);
            let mut sig = self.parse_signature(Some(self_param))?;
            sig.offset_from_self = self.types.get(iface).size;
            let fn_type = self.types.fn_type(sig, block);
            self.types
                .add_field(iface, name, fn_type)
                .map_err(|msg| self.error(msg))?;
            self.eat(Tok::Semicolon)?;
        }
        self.eat(Tok::RBrace)?;
        Ok(iface)
    }

    /// Formal parameter list and result type. A receiver, when present,
    /// follows the hidden upvalue parameter.
    pub(crate) fn parse_signature(&mut self, rcv: Option<(Symbol, TypeId)>) -> CompileResult<Signature> {
        let mut sig = Signature {
            params: vec![self.hidden_upvalue_param()],
            num_default_params: 0,
            is_method: rcv.is_some(),
            offset_from_self: 0,
            result: self.prims.void_,
        };
        if let Some((name, type_id)) = rcv {
            sig.params.push(Param {
                name,
                type_id,
                default_val: None,
            });
        }

        self.eat(Tok::LPar)?;
        if self.lex.tok.kind == Tok::Ident {
            loop {
                let mut names = vec![self.eat_ident()?];
                while self.check(Tok::Comma) {
                    self.next()?;
                    names.push(self.eat_ident()?);
                }
                self.eat(Tok::Colon)?;
                let param_type = self.parse_type()?;
                let default_val = if self.check(Tok::Eq) {
                    self.next()?;
                    let (konst_type, konst) = self.parse_const_expr()?;
                    self.assert_compatible(param_type, konst_type)?;
                    Some(konst)
                } else {
                    None
                };
                if default_val.is_none() && sig.num_default_params > 0 {
                    return Err(self.error("Parameters with default values must be the last ones"));
                }
                for name in names {
                    if default_val.is_some() {
                        sig.num_default_params += 1;
                    }
                    sig.params.push(Param {
                        name,
                        type_id: param_type,
                        default_val: default_val.clone(),
                    });
                }
                if !self.check(Tok::Comma) {
                    break;
                }
                self.next()?;
            }
        }
        self.eat(Tok::RPar)?;

        if self.check(Tok::Colon) {
            self.next()?;
            sig.result = self.parse_type()?;
        }
        // Structured results return through a hidden pointer parameter.
        if self.type_kind(sig.result).is_structured() {
            sig.params.push(Param {
                name: self.interner.intern("#result"),
                type_id: self.prims.ptr_void,
                default_val: None,
            });
        }
        Ok(sig)
    }

    // --- const declarations

    pub(crate) fn parse_const_decl(&mut self) -> CompileResult<()> {
        self.next()?;
        self.parse_items(|c| c.parse_const_decl_item())
    }

    fn parse_const_decl_item(&mut self) -> CompileResult<()> {
        let line = self.lex.tok.line;
        let name = self.eat_ident()?;
        let exported = self.parse_export_mark()?;
        let declared_type = if self.check(Tok::Colon) {
            self.next()?;
            Some(self.parse_type()?)
        } else {
            None
        };
        self.eat(Tok::Eq)?;
        let (expr_type, konst) = self.parse_const_expr()?;
        let type_id = match declared_type {
            Some(t) => {
                self.assert_compatible(t, expr_type)?;
                let kind = self.type_kind(t);
                if kind.overflows(&konst) {
                    return Err(self.error(format!("Overflow of {}", kind.spelling())));
                }
                t
            }
            None => expr_type,
        };
        self.idents
            .add_const(name, type_id, self.blocks.module, self.blocks.current(), exported, konst, line)
            .map_err(|msg| self.error(msg))?;
        Ok(())
    }

    // --- var declarations

    pub(crate) fn parse_var_decl(&mut self) -> CompileResult<()> {
        self.next()?;
        self.parse_items(|c| c.parse_var_decl_item())
    }

    fn parse_var_decl_item(&mut self) -> CompileResult<()> {
        let mut names = Vec::new();
        loop {
            let line = self.lex.tok.line;
            let name = self.eat_ident()?;
            let exported = self.parse_export_mark()?;
            names.push((name, exported, line));
            if !self.check(Tok::Comma) {
                break;
            }
            self.next()?;
        }
        self.eat(Tok::Colon)?;
        let type_id = self.parse_type()?;

        let has_init = self.check(Tok::Eq);
        if has_init && names.len() > 1 {
            return Err(self.error("Unable to initialize multiple variables"));
        }

        for &(name, exported, line) in &names {
            self.declare_var(name, type_id, exported, line)?;
        }

        if has_init {
            self.next()?;
            let (name, _, _) = names[0];
            self.compile_var_init(name, type_id)?;
        }
        Ok(())
    }

    /// Declares a variable in the current scope; globals get zeroed data
    /// section storage, locals get frame storage (zero-filled at runtime).
    pub(crate) fn declare_var(&mut self, name: Symbol, type_id: TypeId, exported: bool, line: u32) -> CompileResult<usize> {
        if ident::is_placeholder_name(self.interner.resolve(name)) {
            return Err(self.error("Placeholder cannot be declared"));
        }
        let size = self.type_size(type_id)?;
        if self.blocks.is_global() {
            let offset = self.gen.data.alloc(size);
            self.idents
                .add_global_var(name, type_id, self.blocks.module, exported, offset, line)
                .map_err(|msg| self.error(msg))
        } else {
            let offset = self
                .idents
                .alloc_stack(&self.types, &mut self.blocks, type_id)
                .map_err(|msg| self.error(msg))?;
            let index = self
                .idents
                .add_local_var(name, type_id, self.blocks.module, self.blocks.current(), offset, false, line)
                .map_err(|msg| self.error(msg))?;
            self.gen.push_local_ptr_zero(offset, size);
            self.gen.pop(1);
            Ok(index)
        }
    }

    /// Initializer for a just-declared variable. Globals get a hidden init
    /// thunk run before `main`; locals assign in place.
    fn compile_var_init(&mut self, name: Symbol, type_id: TypeId) -> CompileResult<()> {
        let index = self
            .idents
            .find(&self.modules, &self.blocks, self.blocks.module, name, None, &self.types, false)
            .expect("variable was just declared");

        if self.blocks.is_global() {
            let IdentKind::GlobalVar { offset } = self.idents.get(index).kind else {
                unreachable!("global scope declares global variables")
            };
            let entry = self.gen.ip();
            self.blocks.enter(Some(index));
            self.gen.gotos_prolog(GotosKind::Return, self.blocks.current());
            self.gen.enter_frame_stub();

            self.gen.push_global_ptr(offset);
            let attrs = self.parse_expr()?;
            self.store_through_ptr(type_id, attrs)?;

            self.gen.gotos_epilog(GotosKind::Return);
            let thunk_block = self.blocks.current();
            self.leave_block_scope(thunk_block);
            let block = self.blocks.leave();
            let sig = Signature {
                params: vec![self.hidden_upvalue_param()],
                num_default_params: 0,
                is_method: false,
                offset_from_self: 0,
                result: self.prims.void_,
            };
            let layout = self.make_layout(&sig, block.local_var_size)?;
            self.gen.leave_frame_fixup(layout);
            self.gen.return_(self.param_slots_total(&sig)?);
            self.init_entries.push(entry);
        } else {
            let offset = self.local_offset(index);
            self.gen.push_local_ptr(offset);
            let attrs = self.parse_expr()?;
            self.store_through_ptr(type_id, attrs)?;
        }
        Ok(())
    }

    /// Converts the value described by `attrs` and stores it through the
    /// destination pointer sitting beneath it on the stack.
    pub(crate) fn store_through_ptr(&mut self, dest_type: TypeId, attrs: ExprAttrs) -> CompileResult<()> {
        let attrs = self.implicit_conv(dest_type, attrs)?;
        self.assert_compatible(dest_type, attrs.type_id)?;
        let kind = self.type_kind(dest_type);
        let size = self.type_size(dest_type)?;
        if kind.is_garbage_collected() {
            let op = if attrs.owned { Tok::MinusMinus } else { Tok::PlusPlus };
            self.gen.change_ref_cnt_assign(op, dest_type, size);
        } else {
            self.gen.assign(kind, size);
        }
        Ok(())
    }

    // --- fn declarations

    fn parse_fn_decl(&mut self) -> CompileResult<()> {
        self.next()?;

        // Method receiver clause
        let rcv = if self.check(Tok::LPar) {
            self.next()?;
            let rcv_name = self.eat_ident()?;
            self.eat(Tok::Colon)?;
            let rcv_type = self.parse_type()?;
            self.eat(Tok::RPar)?;
            if self.type_kind(rcv_type) != TypeKind::Ptr
                || self.types.get(self.types.base(rcv_type)).ident.is_none()
            {
                return Err(self.error("Receiver must be a pointer to a named type"));
            }
            Some((rcv_name, rcv_type))
        } else {
            None
        };

        let line = self.lex.tok.line;
        let name = self.eat_ident()?;
        let exported = self.parse_export_mark()?;
        let sig = self.parse_signature(rcv)?;
        let is_method = sig.is_method;
        let fn_type = self.types.fn_type(sig, self.blocks.current());

        let index = if is_method {
            self.idents
                .add_method(name, fn_type, self.blocks.module, exported, 0, &self.types, line)
                .map_err(|msg| self.error(msg))?
        } else {
            self.idents
                .add_const(name, fn_type, self.blocks.module, 0, exported, Const::Int(0), line)
                .map_err(|msg| self.error(msg))?
        };

        if self.check(Tok::LBrace) {
            self.compile_fn_body(index)?;
            self.eat(Tok::Semicolon)?;
            Ok(())
        } else {
            // Prototype: resolved by a later body or a host function.
            self.eat(Tok::Semicolon)
        }
    }

    /// Compiles a function body at the current code position and patches
    /// any calls recorded against the prototype.
    pub(crate) fn compile_fn_body(&mut self, index: usize) -> CompileResult<()> {
        let entry = self.gen.ip();
        let fixups = std::mem::take(&mut self.idents.get_mut(index).proto_fixups);
        for at in fixups {
            self.gen.fixup_call(at, entry);
        }
        if let IdentKind::Const(value) = &mut self.idents.get_mut(index).kind {
            *value = Const::Int(entry as i64);
        }

        let fn_name = self.interner.resolve(self.idents.get(index).name).to_string();
        let saved_fn_name = std::mem::replace(&mut self.lex.debug.fn_name, Rc::from(fn_name.as_str()));

        let fn_type = self.idents.get(index).type_id;
        let sig = self.types.get(fn_type).sig.clone().expect("function has a signature");

        self.blocks.enter(Some(index));
        let fn_block = self.blocks.current();
        self.gen.gotos_prolog(GotosKind::Return, fn_block);
        self.gen.enter_frame_stub();

        // Parameters become local identifiers at negative frame offsets.
        for (i, param) in sig.params.iter().enumerate().skip(1) {
            let param_name = self.interner.resolve(param.name).to_string();
            if ident::is_hidden_name(&param_name) || ident::is_placeholder_name(&param_name) {
                continue;
            }
            let offset = velac_sem::Idents::param_offset(&self.types, &sig, i).map_err(|msg| self.error(msg))?;
            self.idents
                .add_local_var(param.name, param.type_id, self.blocks.module, fn_block, offset, true, self.lex.tok.line)
                .map_err(|msg| self.error(msg))?;
        }

        self.parse_block_stmts()?;

        if self.type_kind(sig.result) != TypeKind::Void && !self.blocks.top_mut().has_return {
            return Err(self.error("Function must return a value"));
        }

        self.gen.gotos_epilog(GotosKind::Return);

        // Release references held by parameters, the hidden upvalue
        // included, then by the body's locals. The hidden result pointer
        // aims into the caller's frame and carries no reference.
        for (i, param) in sig.params.iter().enumerate() {
            if self.interner.resolve(param.name) == "#result" {
                continue;
            }
            if self.type_kind(param.type_id).is_garbage_collected() {
                let offset = velac_sem::Idents::param_offset(&self.types, &sig, i).map_err(|msg| self.error(msg))?;
                self.gen.change_ref_cnt_local(Tok::MinusMinus, offset, param.type_id);
            }
        }
        self.leave_block_scope(fn_block);

        let block = self.blocks.leave();
        let layout = self.make_layout(&sig, block.local_var_size)?;
        self.gen.leave_frame_fixup(layout);
        self.gen.return_(self.param_slots_total(&sig)?);

        self.lex.debug.fn_name = saved_fn_name;
        Ok(())
    }

    /// Resolves prototypes without bodies against the host function
    /// registry, emitting thin wrappers that forward to `CALL_EXTERN`.
    fn finish_prototypes(&mut self, from: usize) -> CompileResult<()> {
        for index in from..self.idents.len() {
            let entry_is_zero = matches!(self.idents.get(index).kind, IdentKind::Const(Const::Int(0)));
            let is_fn = self.types.get(self.idents.get(index).type_id).kind == TypeKind::Fn;
            if !entry_is_zero || !is_fn || self.idents.get(index).module != self.blocks.module {
                continue;
            }
            let name = self.interner.resolve(self.idents.get(index).name).to_string();
            let Some(extern_index) = self.extern_names.iter().position(|n| n == &name) else {
                return Err(self.error(format!("Function {name} is not defined")));
            };

            let entry = self.gen.ip();
            let fixups = std::mem::take(&mut self.idents.get_mut(index).proto_fixups);
            for at in fixups {
                self.gen.fixup_call(at, entry);
            }
            if let IdentKind::Const(value) = &mut self.idents.get_mut(index).kind {
                *value = Const::Int(entry as i64);
            }

            let sig = self
                .types
                .get(self.idents.get(index).type_id)
                .sig
                .clone()
                .expect("function has a signature");
            self.gen.enter_frame_stub();
            self.gen.call_extern(extern_index);
            let layout = self.make_layout(&sig, 0)?;
            self.gen.leave_frame_fixup(layout);
            self.gen.return_(self.param_slots_total(&sig)?);
        }
        Ok(())
    }

    /// `{ stmt; ... }`, emitting into the current block.
    pub(crate) fn parse_block_stmts(&mut self) -> CompileResult<()> {
        self.eat(Tok::LBrace)?;
        while !self.check(Tok::RBrace) {
            self.parse_stmt()?;
        }
        self.eat(Tok::RBrace)?;
        Ok(())
    }

    /// Pushes a constant's value.
    pub(crate) fn push_const_value(&mut self, konst: &Const) -> CompileResult<()> {
        match konst {
            Const::Int(v) => self.gen.push_int(*v),
            Const::UInt(v) => self.gen.push_uint(*v),
            Const::Real(v) => self.gen.push_real(*v),
            Const::Ptr(p) => self.gen.push_ptr(*p),
            Const::Str(s) => {
                let offset = self.gen.data.add_str_literal(s);
                self.gen.push_global_ptr(offset);
            }
        }
        Ok(())
    }

    /// Emits the default value for a missing optional argument.
    pub(crate) fn push_default_arg(&mut self, param: &Param) -> CompileResult<()> {
        let konst = param.default_val.clone().expect("parameter has a default");
        self.push_const_value(&konst)
    }
}
