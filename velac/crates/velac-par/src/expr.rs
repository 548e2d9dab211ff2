//! Expressions.
//!
//! The layering is primary -> selectors -> unary -> `* / % << >> &` ->
//! `+ - | ~` -> comparisons -> `&&` -> `||`. Designators leave the address
//! of their storage on the stack; `rvalue` turns an address into a loaded
//! value (structured values stay represented by their address).

use velac_gen::Register;
use velac_lex::Tok;
use velac_sem::{consts, Const, IdentKind, Signature, TypeKind};
use velac_util::{CompileResult, Symbol, TypeId};

use crate::compiler::{CaptureCtx, Compiler};

/// What the expression just compiled left on the stack.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExprAttrs {
    pub type_id: TypeId,
    /// The stack holds the address of a variable (a load is pending).
    pub is_var: bool,
    /// The value carries a transferred reference (fresh call result or
    /// newly built object); assignment must not increment it again.
    pub owned: bool,
    /// A function constant not yet materialized: its identifier index.
    pub fn_const: Option<usize>,
}

impl ExprAttrs {
    pub(crate) fn value(type_id: TypeId) -> Self {
        Self {
            type_id,
            is_var: false,
            owned: false,
            fn_const: None,
        }
    }

    pub(crate) fn var(type_id: TypeId) -> Self {
        Self {
            type_id,
            is_var: true,
            owned: false,
            fn_const: None,
        }
    }

    pub(crate) fn owned_value(type_id: TypeId) -> Self {
        Self {
            type_id,
            is_var: false,
            owned: true,
            fn_const: None,
        }
    }
}

impl Compiler {
    // --- Entry points

    /// Full expression; the result is an rvalue.
    pub(crate) fn parse_expr(&mut self) -> CompileResult<ExprAttrs> {
        let attrs = self.parse_logical_term()?;
        let mut attrs = self.rvalue(attrs)?;
        while self.check(Tok::OrOr) {
            attrs = self.parse_short_circuit(Tok::OrOr, attrs)?;
        }
        Ok(attrs)
    }

    fn parse_logical_term(&mut self) -> CompileResult<ExprAttrs> {
        let attrs = self.parse_relation()?;
        let mut attrs = self.rvalue(attrs)?;
        while self.check(Tok::AndAnd) {
            attrs = self.parse_short_circuit(Tok::AndAnd, attrs)?;
        }
        Ok(attrs)
    }

    fn parse_short_circuit(&mut self, op: Tok, lhs: ExprAttrs) -> CompileResult<ExprAttrs> {
        self.assert_valid_operator(lhs.type_id, op)?;
        self.next()?;
        self.gen.short_circuit_prolog(op);
        let rhs = if op == Tok::OrOr {
            self.parse_logical_term()?
        } else {
            self.parse_relation()?
        };
        let rhs = self.rvalue(rhs)?;
        self.assert_valid_operator(rhs.type_id, op)?;
        self.gen.short_circuit_epilog();
        Ok(ExprAttrs::value(self.prims.bool_))
    }

    fn parse_relation(&mut self) -> CompileResult<ExprAttrs> {
        let lhs = self.parse_relation_term()?;
        let mut lhs = self.rvalue(lhs)?;
        if self.lex.tok.kind.is_comparison() {
            let op = self.lex.tok.kind;
            self.next()?;
            let rhs = self.parse_relation_term()?;
            let rhs = self.rvalue(rhs)?;
            let unified = self.unify_operands(lhs, rhs, op)?;
            self.gen.binary(op, self.type_kind(unified), unified);
            lhs = ExprAttrs::value(self.prims.bool_);
        }
        Ok(lhs)
    }

    fn parse_relation_term(&mut self) -> CompileResult<ExprAttrs> {
        let lhs = self.parse_term()?;
        let mut lhs = self.rvalue(lhs)?;
        while matches!(self.lex.tok.kind, Tok::Plus | Tok::Minus | Tok::Or | Tok::Xor) {
            let op = self.lex.tok.kind;
            self.next()?;
            let rhs = self.parse_term()?;
            let rhs = self.rvalue(rhs)?;
            let unified = self.unify_operands(lhs, rhs, op)?;
            self.gen.binary(op, self.type_kind(unified), unified);
            lhs = ExprAttrs::value(unified);
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> CompileResult<ExprAttrs> {
        let lhs = self.parse_factor()?;
        let mut lhs = self.rvalue(lhs)?;
        while matches!(
            self.lex.tok.kind,
            Tok::Mul | Tok::Div | Tok::Mod | Tok::Shl | Tok::Shr | Tok::And
        ) {
            let op = self.lex.tok.kind;
            self.next()?;
            let rhs = self.parse_factor()?;
            let rhs = self.rvalue(rhs)?;
            let unified = self.unify_operands(lhs, rhs, op)?;
            self.gen.binary(op, self.type_kind(unified), unified);
            lhs = ExprAttrs::value(unified);
        }
        Ok(lhs)
    }

    /// Checks the operands of a binary operator, converting the integer
    /// side to real where the kinds are mixed. Returns the operand type of
    /// the emitted `BINARY`.
    fn unify_operands(&mut self, lhs: ExprAttrs, rhs: ExprAttrs, op: Tok) -> CompileResult<TypeId> {
        let lk = self.type_kind(lhs.type_id);
        let rk = self.type_kind(rhs.type_id);

        let unified = if lk.is_real() && rk.is_integer() {
            self.gen.call_builtin(velac_sem::BuiltinFn::Real, rk, None);
            lhs.type_id
        } else if lk.is_integer() && rk.is_real() {
            self.gen.call_builtin(velac_sem::BuiltinFn::RealLhs, lk, None);
            rhs.type_id
        } else {
            if !self.types.compatible(lhs.type_id, rhs.type_id, true) {
                return Err(self.error(format!(
                    "Incompatible types {} and {}",
                    self.spelling(lhs.type_id),
                    self.spelling(rhs.type_id)
                )));
            }
            lhs.type_id
        };
        self.assert_valid_operator(unified, op)?;
        Ok(unified)
    }

    // --- Factors

    fn parse_factor(&mut self) -> CompileResult<ExprAttrs> {
        match self.lex.tok.kind {
            Tok::IntNumber => {
                let value = self.lex.tok.uint_val;
                self.next()?;
                if value > i64::MAX as u64 {
                    self.gen.push_uint(value);
                    Ok(ExprAttrs::value(self.prims.uint_))
                } else {
                    self.gen.push_int(value as i64);
                    Ok(ExprAttrs::value(self.prims.int_))
                }
            }
            Tok::RealNumber => {
                let value = self.lex.tok.real_val;
                self.next()?;
                self.gen.push_real(value);
                Ok(ExprAttrs::value(self.prims.real))
            }
            Tok::CharLiteral => {
                let value = self.lex.tok.uint_val;
                self.next()?;
                self.gen.push_int(value as i64);
                Ok(ExprAttrs::value(self.prims.char_))
            }
            Tok::StrLiteral => {
                let text = self.interner.resolve(self.lex.tok.str_val).to_string();
                self.next()?;
                let offset = self.gen.data.add_str_literal(&text);
                self.gen.push_global_ptr(offset);
                Ok(ExprAttrs::value(self.prims.str_))
            }
            Tok::Minus | Tok::Not | Tok::Xor => {
                let op = self.lex.tok.kind;
                self.next()?;
                let attrs = self.parse_factor()?;
                let attrs = self.rvalue(attrs)?;
                self.assert_valid_operator(attrs.type_id, if op == Tok::Xor { Tok::Xor } else { op })?;
                self.gen.unary(op, self.type_kind(attrs.type_id));
                Ok(ExprAttrs::value(attrs.type_id))
            }
            Tok::And => {
                // Address-of: keep the designator's address on the stack.
                self.next()?;
                let attrs = self.parse_designator()?;
                if !attrs.is_var {
                    return Err(self.error("Unable to take address"));
                }
                let ptr_type = self.types.ptr_to(attrs.type_id, self.blocks.current());
                Ok(ExprAttrs::value(ptr_type))
            }
            Tok::LPar => {
                self.next()?;
                let attrs = self.parse_expr()?;
                self.eat(Tok::RPar)?;
                Ok(attrs)
            }
            Tok::Fn => self.parse_fn_literal(),
            Tok::Caret | Tok::Weak | Tok::LBracket | Tok::Map | Tok::Struct | Tok::Interface | Tok::Str => {
                let type_id = self.parse_type()?;
                self.parse_cast_or_composite(type_id)
            }
            Tok::Ident => self.parse_designator(),
            other => Err(self.error(format!("Unexpected {}", other.spelling()))),
        }
    }

    /// Turns a pending value into a loaded rvalue: function constants
    /// materialize as closures, variable addresses are dereferenced.
    pub(crate) fn rvalue(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        if let Some(index) = attrs.fn_const {
            return self.materialize_closure(index);
        }
        if attrs.is_var && !self.type_kind(attrs.type_id).is_structured() {
            self.gen.deref(self.type_kind(attrs.type_id));
            return Ok(ExprAttrs {
                is_var: false,
                ..attrs
            });
        }
        if attrs.is_var {
            // Structured values are represented by their address.
            return Ok(ExprAttrs {
                is_var: false,
                ..attrs
            });
        }
        Ok(attrs)
    }

    // --- Designators: primary + selectors

    pub(crate) fn parse_designator(&mut self) -> CompileResult<ExprAttrs> {
        let attrs = self.parse_primary()?;
        self.parse_selectors(attrs)
    }

    fn parse_primary(&mut self) -> CompileResult<ExprAttrs> {
        // Captured variables of an enclosing function literal win over
        // outer scopes.
        if self.lex.tok.kind == Tok::Ident {
            if let Some(attrs) = self.try_capture_access()? {
                return Ok(attrs);
            }
        }
        let (module, name) = self.parse_qualified_name()?;
        let found = self
            .idents
            .find(&self.modules, &self.blocks, module, name, None, &self.types, true);
        let Some(index) = found else {
            let name = self.interner.resolve(name).to_string();
            return Err(self.error(format!("Unknown identifier {name}")));
        };

        match self.idents.get(index).kind.clone() {
            IdentKind::Const(konst) => {
                let type_id = self.idents.get(index).type_id;
                if self.type_kind(type_id) == TypeKind::Fn {
                    return Ok(ExprAttrs {
                        type_id,
                        is_var: false,
                        owned: false,
                        fn_const: Some(index),
                    });
                }
                self.push_const_value(&konst)?;
                Ok(ExprAttrs::value(type_id))
            }
            IdentKind::GlobalVar { offset } => {
                self.gen.push_global_ptr(offset);
                Ok(ExprAttrs::var(self.idents.get(index).type_id))
            }
            IdentKind::LocalVar { offset } => {
                // A frame-relative offset is only meaningful inside the
                // frame that declared it; outer locals travel as captures.
                let fn_block = self.blocks.fn_block().map_or(0, |b| b.block);
                if self.idents.get(index).block < fn_block {
                    return Err(self.error("Outer function variables must be captured"));
                }
                self.gen.push_local_ptr(offset);
                Ok(ExprAttrs::var(self.idents.get(index).type_id))
            }
            IdentKind::BuiltinFn(builtin) => self.parse_builtin_call(builtin),
            IdentKind::Type => {
                let type_id = self.idents.get(index).type_id;
                self.parse_cast_or_composite(type_id)
            }
            IdentKind::Module(_) => Err(self.error("Expression expected, found module")),
        }
    }

    /// Resolves a name against the innermost capture context, emitting the
    /// upvalue access when it matches.
    fn try_capture_access(&mut self) -> CompileResult<Option<ExprAttrs>> {
        let name = self.lex.tok.name;
        let Some(ctx) = self.captures.last() else {
            return Ok(None);
        };
        let CaptureCtx {
            struct_type,
            upvalue_offset,
        } = *ctx;
        let Some(field) = self.types.find_field(struct_type, name) else {
            return Ok(None);
        };
        let (field_offset, field_type) = (field.offset, field.type_id);
        self.next()?;

        // #upvalue interface -> self pointer -> captured field
        self.gen.push_local_ptr(upvalue_offset);
        self.gen.deref(TypeKind::Ptr);
        self.gen.get_field_ptr(field_offset);
        Ok(Some(ExprAttrs::var(field_type)))
    }

    fn parse_selectors(&mut self, mut attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        loop {
            match self.lex.tok.kind {
                Tok::Caret => {
                    self.next()?;
                    attrs = self.deref_selector(attrs)?;
                }
                Tok::LBracket => {
                    self.next()?;
                    attrs = self.index_selector(attrs)?;
                    self.eat(Tok::RBracket)?;
                }
                Tok::Period => {
                    self.next()?;
                    attrs = self.field_or_method_selector(attrs)?;
                }
                Tok::LPar => {
                    attrs = self.call_selector(attrs)?;
                }
                _ => return Ok(attrs),
            }
        }
    }

    /// Explicit `^`: pointer to pointee; weak pointers strengthen first.
    fn deref_selector(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let attrs = self.strengthen_if_weak(attrs)?;
        if self.type_kind(attrs.type_id) != TypeKind::Ptr {
            return Err(self.error("Pointer expected"));
        }
        let attrs = self.rvalue(attrs)?;
        Ok(ExprAttrs::var(self.types.base(attrs.type_id)))
    }

    fn strengthen_if_weak(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        if self.type_kind(attrs.type_id) != TypeKind::WeakPtr {
            return Ok(attrs);
        }
        let attrs = self.rvalue(attrs)?;
        self.gen.strengthen_ptr();
        let strong = self.types.ptr_to(self.types.base(attrs.type_id), self.blocks.current());
        Ok(ExprAttrs::value(strong))
    }

    /// Implicit pointer dereferencing: `a.x` and `a[i]` reach through a
    /// pointer to a composite.
    fn auto_deref(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let attrs = self.strengthen_if_weak(attrs)?;
        if self.type_kind(attrs.type_id) == TypeKind::Ptr {
            let base = self.types.base(attrs.type_id);
            if self.type_kind(base).is_structured() || self.type_kind(base) == TypeKind::Str {
                let attrs = self.rvalue(attrs)?;
                return Ok(ExprAttrs::var(base));
            }
        }
        Ok(attrs)
    }

    fn index_selector(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let attrs = self.auto_deref(attrs)?;
        match self.type_kind(attrs.type_id) {
            TypeKind::Array => {
                let base = self.types.base(attrs.type_id);
                let item_size = self.type_size(base)?;
                let len = self.types.get(attrs.type_id).num_items;
                self.parse_index_value()?;
                self.gen.get_array_ptr(item_size, len);
                Ok(ExprAttrs::var(base))
            }
            TypeKind::DynArray => {
                let base = self.types.base(attrs.type_id);
                self.parse_index_value()?;
                self.gen.get_dyn_array_ptr();
                Ok(ExprAttrs::var(base))
            }
            TypeKind::Str => {
                self.rvalue(attrs)?;
                self.parse_index_value()?;
                self.gen.get_array_ptr(1, -1);
                Ok(ExprAttrs::var(self.prims.char_))
            }
            TypeKind::Map => {
                let map_type = attrs.type_id;
                let key_type = self.types.map_key(map_type);
                let key = self.parse_expr()?;
                let key = self.implicit_conv(key_type, key)?;
                self.assert_compatible(key_type, key.type_id)?;
                self.gen.get_map_ptr(map_type);
                Ok(ExprAttrs::var(self.types.map_item(map_type)))
            }
            _ => Err(self.error(format!("{} is not indexable", self.spelling(attrs.type_id)))),
        }
    }

    fn parse_index_value(&mut self) -> CompileResult<()> {
        let index = self.parse_expr()?;
        if !self.type_kind(index.type_id).is_integer() {
            return Err(self.error("Integer expected as index"));
        }
        Ok(())
    }

    fn field_or_method_selector(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let attrs = self.auto_deref(attrs)?;
        let name = self.eat_ident()?;

        // Interface: the name selects a method from the table.
        if self.type_kind(attrs.type_id) == TypeKind::Interface {
            return self.interface_method_call(attrs, name);
        }

        // Struct field
        if self.type_kind(attrs.type_id) == TypeKind::Struct {
            if let Some(field) = self.types.find_field(attrs.type_id, name) {
                let (offset, field_type) = (field.offset, field.type_id);
                self.gen.get_field_ptr(offset);
                return Ok(ExprAttrs::var(field_type));
            }
        }

        // Method on a named type: the receiver is the designator's address.
        let rcv_type = if self.type_kind(attrs.type_id) == TypeKind::Ptr {
            attrs.type_id
        } else {
            self.types.ptr_to(attrs.type_id, self.blocks.current())
        };
        let found = self.idents.find(
            &self.modules,
            &self.blocks,
            self.blocks.module,
            name,
            Some(rcv_type),
            &self.types,
            true,
        );
        match found {
            Some(method) => {
                if self.type_kind(attrs.type_id) == TypeKind::Ptr {
                    self.rvalue(attrs)?;
                } else if !attrs.is_var {
                    return Err(self.error("Method receiver must be addressable"));
                }
                self.method_call(method)
            }
            None => {
                let name = self.interner.resolve(name).to_string();
                Err(self.error(format!("Unknown field or method {name}")))
            }
        }
    }

    // --- Calls

    fn call_selector(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        if let Some(index) = attrs.fn_const {
            return self.direct_call(index, None);
        }
        if self.type_kind(attrs.type_id) == TypeKind::Closure {
            return self.indirect_call(attrs);
        }
        Err(self.error(format!("{} is not callable", self.spelling(attrs.type_id))))
    }

    /// Pushes the actual arguments of a call, hidden upvalue excluded.
    /// Assumes the hidden upvalue (and receiver, if any) are already on
    /// the stack.
    fn push_args(&mut self, sig: &Signature, first_user_param: usize) -> CompileResult<()> {
        self.eat(Tok::LPar)?;
        let params = sig.params[first_user_param..].to_vec();
        let mut pushed = 0usize;
        for (i, param) in params.iter().enumerate() {
            if self.check(Tok::RPar) {
                break;
            }
            if i > 0 {
                self.eat(Tok::Comma)?;
            }
            let attrs = self.parse_expr()?;
            self.push_one_arg(param.type_id, attrs)?;
            pushed += 1;
        }
        if pushed < params.len() {
            for param in &params[pushed..] {
                if param.default_val.is_none() {
                    return Err(self.error("Wrong number of parameters"));
                }
                self.push_default_arg(param)?;
                let attrs = ExprAttrs::value(param.type_id);
                self.finish_arg(param.type_id, attrs)?;
            }
        } else if !self.check(Tok::RPar) {
            return Err(self.error("Wrong number of parameters"));
        }
        self.eat(Tok::RPar)?;
        Ok(())
    }

    fn push_one_arg(&mut self, param_type: TypeId, attrs: ExprAttrs) -> CompileResult<()> {
        let attrs = self.implicit_conv(param_type, attrs)?;
        self.assert_compatible(param_type, attrs.type_id)?;
        self.finish_arg(param_type, attrs)
    }

    /// Reference acquisition and slot widening for one pushed argument.
    fn finish_arg(&mut self, param_type: TypeId, attrs: ExprAttrs) -> CompileResult<()> {
        let kind = self.type_kind(param_type);
        if kind.is_garbage_collected() && !attrs.owned {
            self.gen.change_ref_cnt(Tok::PlusPlus, param_type);
        }
        let size = self.type_size(param_type)?;
        if kind.is_structured() {
            self.gen.assign_param(kind, size);
        }
        Ok(())
    }

    /// Call of a named function constant.
    pub(crate) fn direct_call(&mut self, index: usize, receiver_pushed: Option<TypeId>) -> CompileResult<ExprAttrs> {
        let fn_type = self.idents.get(index).type_id;
        let sig = self.types.get(fn_type).sig.clone().expect("function has a signature");

        let first_user_param = if receiver_pushed.is_some() { 2 } else { 1 };
        if receiver_pushed.is_none() {
            self.gen.push_zero(2); // null hidden upvalue
        }
        self.push_args(&sig, first_user_param)?;

        // Structured results return through a caller-allocated temporary.
        let result_temp = self.push_result_ptr_arg(&sig)?;

        let entry = match &self.idents.get(index).kind {
            IdentKind::Const(Const::Int(entry)) => *entry,
            _ => 0,
        };
        let at = self.gen.call(entry as usize);
        if entry == 0 {
            self.idents.add_proto_fixup(index, at);
        }
        self.finish_call(&sig, result_temp)
    }

    fn indirect_call(&mut self, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let closure_type = attrs.type_id;
        let sig = self.types.closure_sig(closure_type).clone();

        // Closure value -> (entry, upvalue) with the upvalue acquired.
        self.gen.push_upvalue(self.prims.any);
        self.push_args(&sig, 1)?;
        let result_temp = self.push_result_ptr_arg(&sig)?;

        let param_slots = self.param_slots_total(&sig)?;
        self.gen.call_indirect(param_slots);
        self.gen.pop(1); // the entry offset beneath the parameters
        self.finish_call(&sig, result_temp)
    }

    fn method_call(&mut self, index: usize) -> CompileResult<ExprAttrs> {
        // Stack: receiver. The hidden upvalue must sit below it.
        self.gen.pop_reg(Register::Self_);
        self.gen.push_zero(2);
        self.gen.push_reg(Register::Self_);
        let fn_type = self.idents.get(index).type_id;
        let rcv_type = self.types.get(fn_type).sig.as_ref().expect("method has a signature").params[1].type_id;
        self.gen.change_ref_cnt(Tok::PlusPlus, rcv_type);
        self.direct_call(index, Some(rcv_type))
    }

    fn interface_method_call(&mut self, attrs: ExprAttrs, name: Symbol) -> CompileResult<ExprAttrs> {
        let iface_type = attrs.type_id;
        let Some(field) = self.types.find_field(iface_type, name) else {
            let name = self.interner.resolve(name).to_string();
            return Err(self.error(format!("Unknown method {name}")));
        };
        let (method_offset, fn_type) = (field.offset, field.type_id);
        let sig = self.types.get(fn_type).sig.clone().expect("interface entry is a method");

        // entry := table[method]; self := iface.self
        self.gen.dup();
        self.gen.get_field_ptr(0);
        self.gen.deref(TypeKind::Ptr);
        self.gen.pop_reg(Register::Self_);
        self.gen.get_field_ptr(method_offset);
        self.gen.deref(TypeKind::Fn);

        self.gen.push_zero(2); // null hidden upvalue
        self.gen.push_reg(Register::Self_);
        self.gen.change_ref_cnt(Tok::PlusPlus, self.prims.ptr_void);

        self.push_args(&sig, 2)?;
        let result_temp = self.push_result_ptr_arg(&sig)?;
        let param_slots = self.param_slots_total(&sig)?;
        self.gen.call_indirect(param_slots);
        self.gen.pop(1);
        self.finish_call(&sig, result_temp)
    }

    /// For structured results: allocate the receiving temporary and push
    /// its address as the hidden last argument.
    fn push_result_ptr_arg(&mut self, sig: &Signature) -> CompileResult<Option<usize>> {
        if !self.type_kind(sig.result).is_structured() {
            return Ok(None);
        }
        let temp = self.alloc_temp(sig.result)?;
        let offset = self.local_offset(temp);
        let size = self.type_size(sig.result)?;
        self.gen.push_local_ptr_zero(offset, size);
        Ok(Some(temp))
    }

    fn finish_call(&mut self, sig: &Signature, result_temp: Option<usize>) -> CompileResult<ExprAttrs> {
        let result_kind = self.type_kind(sig.result);
        if result_kind == TypeKind::Void {
            return Ok(ExprAttrs::value(self.prims.void_));
        }
        self.gen.push_reg(Register::Result);
        if result_temp.is_some() {
            // The temporary owns the references the callee stored into it;
            // the value itself is not a transferred reference.
            Ok(ExprAttrs::value(sig.result))
        } else {
            Ok(ExprAttrs {
                type_id: sig.result,
                is_var: false,
                owned: result_kind.is_garbage_collected(),
                fn_const: None,
            })
        }
    }

    // --- Conversions

    /// Implicit conversions applied on assignment and argument passing.
    pub(crate) fn implicit_conv(&mut self, dest: TypeId, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let attrs = self.rvalue(attrs)?;
        let dest_kind = self.type_kind(dest);
        let src_kind = self.type_kind(attrs.type_id);

        if self.types.equivalent(dest, attrs.type_id) {
            return Ok(attrs);
        }

        // int -> real
        if dest_kind.is_real() && src_kind.is_integer() {
            self.gen.call_builtin(velac_sem::BuiltinFn::Real, src_kind, None);
            return Ok(ExprAttrs {
                type_id: dest,
                ..attrs
            });
        }

        // static array -> dynamic array
        if dest_kind == TypeKind::DynArray
            && src_kind == TypeKind::Array
            && self.types.equivalent(self.types.base(dest), self.types.base(attrs.type_id))
        {
            let len = self.types.get(attrs.type_id).num_items;
            self.gen.push_int(len);
            let temp = self.alloc_temp(dest)?;
            let offset = self.local_offset(temp);
            self.gen.push_local_ptr(offset);
            self.gen.call_builtin(velac_sem::BuiltinFn::Makefromarr, TypeKind::DynArray, Some(dest));
            return Ok(ExprAttrs::value(dest));
        }

        // dynamic array pointer -> array pointer and other pointer pairs
        // are handled by compatibility; weak pointers convert here.
        if dest_kind == TypeKind::WeakPtr && src_kind == TypeKind::Ptr {
            self.gen.weaken_ptr();
            return Ok(ExprAttrs {
                type_id: dest,
                ..attrs
            });
        }
        if dest_kind == TypeKind::Ptr && src_kind == TypeKind::WeakPtr {
            self.gen.strengthen_ptr();
            return Ok(ExprAttrs {
                type_id: dest,
                ..attrs
            });
        }

        // concrete or interface -> interface
        if dest_kind == TypeKind::Interface {
            if src_kind == TypeKind::Interface {
                return self.interface_to_interface(dest, attrs);
            }
            return self.concrete_to_interface(dest, attrs);
        }

        // interface -> concrete pointer (runtime assertion)
        if src_kind == TypeKind::Interface && dest_kind == TypeKind::Ptr {
            self.gen.assert_type(dest);
            return Ok(ExprAttrs::value(dest));
        }

        Ok(attrs)
    }

    /// Builds an interface value from a concrete value: the value is
    /// copied to the heap, and the method table is filled from the
    /// concrete type's method set.
    fn concrete_to_interface(&mut self, iface_type: TypeId, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let src_type = attrs.type_id;
        let src_kind = self.type_kind(src_type);
        let src_size = self.type_size(src_type)?;

        let temp = self.alloc_temp(iface_type)?;
        let temp_offset = self.local_offset(temp);
        let iface_size = self.type_size(iface_type)?;
        self.gen.push_local_ptr_zero(temp_offset, iface_size);
        self.gen.pop(1);

        // Heap copy of the source value
        self.gen.push_int(src_size);
        self.gen.call_builtin(velac_sem::BuiltinFn::New, src_kind, Some(src_type));
        self.gen.pop_reg(Register::HeapCopy);
        self.gen.push_reg(Register::HeapCopy);
        self.gen.swap();
        if src_kind.is_garbage_collected() {
            let op = if attrs.owned { Tok::MinusMinus } else { Tok::PlusPlus };
            self.gen.change_ref_cnt_assign(op, src_type, src_size);
        } else {
            self.gen.assign(src_kind, src_size);
        }

        // #self
        self.gen.push_local_ptr(temp_offset);
        self.gen.push_reg(Register::HeapCopy);
        self.gen.assign(TypeKind::Ptr, 8);

        // #selftype: the concrete pointer type's descriptor
        let self_ptr_type = self.types.ptr_to(src_type, self.blocks.current());
        self.gen.push_local_ptr(temp_offset + 8);
        self.gen.push_uint(self_ptr_type.0 as u64 + 1);
        self.gen.assign(TypeKind::Int, 8);

        // Method table
        let methods: Vec<(Symbol, i64, TypeId)> = self
            .types
            .get(iface_type)
            .fields
            .iter()
            .skip(2)
            .map(|f| (f.name, f.offset, f.type_id))
            .collect();
        for (name, offset, iface_fn_type) in methods {
            let found = self.idents.find(
                &self.modules,
                &self.blocks,
                self.blocks.module,
                name,
                Some(self_ptr_type),
                &self.types,
                true,
            );
            let Some(method) = found else {
                let name = self.interner.resolve(name).to_string();
                return Err(self.error(format!(
                    "Method {name} is not defined for {}",
                    self.spelling(src_type)
                )));
            };
            let method_type = self.idents.get(method).type_id;
            if !self.method_compatible_with_interface(method_type, iface_fn_type) {
                let name = self.interner.resolve(name).to_string();
                return Err(self.error(format!("Method {name} is incompatible with the interface")));
            }
            let entry = match &self.idents.get(method).kind {
                IdentKind::Const(Const::Int(entry)) => *entry,
                _ => 0,
            };
            if entry == 0 {
                return Err(self.error("Method is not defined"));
            }
            self.gen.push_local_ptr(temp_offset + offset);
            self.gen.push_int(entry);
            self.gen.assign(TypeKind::Fn, 8);
        }

        self.gen.push_local_ptr(temp_offset);
        Ok(ExprAttrs::value(iface_type))
    }

    fn method_compatible_with_interface(&self, method_type: TypeId, iface_fn_type: TypeId) -> bool {
        let Some(method_sig) = self.types.get(method_type).sig.as_ref() else {
            return false;
        };
        let Some(iface_sig) = self.types.get(iface_fn_type).sig.as_ref() else {
            return false;
        };
        if method_sig.params.len() != iface_sig.params.len() {
            return false;
        }
        // Receivers differ by design; the remaining parameters and the
        // result must match structurally.
        method_sig
            .params
            .iter()
            .zip(iface_sig.params.iter())
            .skip(2)
            .all(|(m, i)| self.types.equivalent(m.type_id, i.type_id))
            && self.types.equivalent(method_sig.result, iface_sig.result)
    }

    /// Rebuilds one interface value as another: self and self-type are
    /// copied, the method table is looked up by name in the source table.
    fn interface_to_interface(&mut self, dest_type: TypeId, attrs: ExprAttrs) -> CompileResult<ExprAttrs> {
        let src_type = attrs.type_id;
        let temp = self.alloc_temp(dest_type)?;
        let temp_offset = self.local_offset(temp);
        let dest_size = self.type_size(dest_type)?;
        self.gen.push_local_ptr_zero(temp_offset, dest_size);
        self.gen.pop(1);

        // Source interface address is on the stack; keep it for field reads.
        self.gen.pop_reg(Register::HeapCopy);

        for header_offset in [0i64, 8] {
            self.gen.push_local_ptr(temp_offset + header_offset);
            self.gen.push_reg(Register::HeapCopy);
            self.gen.get_field_ptr(header_offset);
            self.gen.deref(TypeKind::Ptr);
            self.gen.assign(TypeKind::Ptr, 8);
        }

        let dest_methods: Vec<(Symbol, i64)> = self
            .types
            .get(dest_type)
            .fields
            .iter()
            .skip(2)
            .map(|f| (f.name, f.offset))
            .collect();
        for (name, offset) in dest_methods {
            let Some(src_field) = self.types.find_field(src_type, name) else {
                let name = self.interner.resolve(name).to_string();
                return Err(self.error(format!("Interface method {name} is not found")));
            };
            let src_offset = src_field.offset;
            self.gen.push_local_ptr(temp_offset + offset);
            self.gen.push_reg(Register::HeapCopy);
            self.gen.get_field_ptr(src_offset);
            self.gen.deref(TypeKind::Fn);
            self.gen.assign(TypeKind::Fn, 8);
        }

        self.gen.push_local_ptr(temp_offset);
        Ok(ExprAttrs::value(dest_type))
    }

    /// A function constant used as a value becomes a closure with a null
    /// upvalue.
    fn materialize_closure(&mut self, index: usize) -> CompileResult<ExprAttrs> {
        let fn_type = self.idents.get(index).type_id;
        let closure_type = self
            .types
            .closure_of(fn_type, self.prims.any, self.blocks.current(), &mut self.interner);

        let temp = self.alloc_temp(closure_type)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr_zero(offset, 24);
        self.gen.pop(1);

        let entry = match &self.idents.get(index).kind {
            IdentKind::Const(Const::Int(entry)) => *entry,
            _ => 0,
        };
        self.gen.push_local_ptr(offset);
        if entry == 0 {
            // Prototype: the entry is patched like a call site.
            let at = self.gen.ip();
            self.gen.push_int(0);
            self.idents.add_proto_fixup(index, at);
        } else {
            self.gen.push_int(entry);
        }
        self.gen.assign(TypeKind::Fn, 8);

        self.gen.push_local_ptr(offset);
        Ok(ExprAttrs::value(closure_type))
    }

    // --- Casts and composite literals

    fn parse_cast_or_composite(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        if self.check(Tok::LBrace) {
            self.parse_composite_literal(type_id)
        } else if self.check(Tok::LPar) {
            self.parse_type_cast(type_id)
        } else {
            Err(self.error("Type cast or composite literal expected"))
        }
    }

    fn parse_type_cast(&mut self, dest: TypeId) -> CompileResult<ExprAttrs> {
        self.next()?;
        let attrs = self.parse_expr()?;
        self.eat(Tok::RPar)?;

        let dest_kind = self.type_kind(dest);
        let src_kind = self.type_kind(attrs.type_id);

        if self.types.equivalent(dest, attrs.type_id) {
            return Ok(ExprAttrs { type_id: dest, ..attrs });
        }
        if dest_kind.is_ordinal() && src_kind.is_ordinal() {
            self.gen.assert_range(dest_kind, attrs.type_id);
            return Ok(ExprAttrs::value(dest));
        }
        if dest_kind.is_real() && src_kind.is_integer() {
            self.gen.call_builtin(velac_sem::BuiltinFn::Real, src_kind, None);
            return Ok(ExprAttrs::value(dest));
        }
        if dest_kind.is_real() && src_kind.is_real() {
            if dest_kind == TypeKind::Real32 {
                self.gen.assert_range(dest_kind, attrs.type_id);
            }
            return Ok(ExprAttrs::value(dest));
        }
        if src_kind == TypeKind::Interface && dest_kind == TypeKind::Ptr {
            self.gen.assert_type(dest);
            return Ok(ExprAttrs::value(dest));
        }
        if self.types.castable_ptrs(dest, attrs.type_id)
            || self.types.compatible(dest, attrs.type_id, true)
        {
            return Ok(ExprAttrs { type_id: dest, ..attrs });
        }
        // str <-> []char / []uint8
        if dest_kind == TypeKind::DynArray
            && src_kind == TypeKind::Str
            && matches!(self.type_kind(self.types.base(dest)), TypeKind::Char | TypeKind::UInt8)
        {
            let temp = self.alloc_temp(dest)?;
            let offset = self.local_offset(temp);
            self.gen.push_local_ptr(offset);
            self.gen.call_builtin(velac_sem::BuiltinFn::Makefromstr, TypeKind::DynArray, Some(dest));
            return Ok(ExprAttrs::value(dest));
        }
        if dest_kind == TypeKind::Str
            && src_kind == TypeKind::DynArray
            && matches!(self.type_kind(self.types.base(attrs.type_id)), TypeKind::Char | TypeKind::UInt8)
        {
            self.gen.call_builtin(velac_sem::BuiltinFn::Maketostr, TypeKind::DynArray, None);
            return Ok(ExprAttrs::owned_value(dest));
        }
        if dest_kind == TypeKind::Str && src_kind == TypeKind::Char {
            self.gen.call_builtin(velac_sem::BuiltinFn::Maketostr, TypeKind::Char, None);
            return Ok(ExprAttrs::owned_value(dest));
        }

        Err(self.error(format!(
            "Invalid type cast from {} to {}",
            self.spelling(attrs.type_id),
            self.spelling(dest)
        )))
    }

    fn parse_composite_literal(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        match self.type_kind(type_id) {
            TypeKind::Array => self.parse_array_literal(type_id),
            TypeKind::DynArray => self.parse_dyn_array_literal(type_id),
            TypeKind::Struct => self.parse_struct_literal(type_id),
            TypeKind::Map => self.parse_map_literal(type_id),
            _ => Err(self.error(format!(
                "{} has no composite literals",
                self.spelling(type_id)
            ))),
        }
    }

    /// Fills a zeroed temporary of `type_id` and returns its ident index.
    fn literal_temp(&mut self, type_id: TypeId) -> CompileResult<(usize, i64)> {
        let temp = self.alloc_temp(type_id)?;
        let offset = self.local_offset(temp);
        let size = self.type_size(type_id)?;
        self.gen.push_local_ptr_zero(offset, size);
        self.gen.pop(1);
        Ok((temp, offset))
    }

    fn parse_array_literal(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        let (_, offset) = self.literal_temp(type_id)?;
        let base = self.types.base(type_id);
        let item_size = self.type_size(base)?;
        let num_items = self.types.get(type_id).num_items;

        self.next()?;
        let mut index = 0i64;
        while !self.check(Tok::RBrace) {
            if index > 0 {
                self.eat(Tok::Comma)?;
            }
            if self.check(Tok::RBrace) {
                break;
            }
            if index >= num_items {
                return Err(self.error("Too many elements in the literal"));
            }
            self.gen.push_local_ptr(offset + index * item_size);
            let attrs = self.parse_expr()?;
            self.store_through_ptr(base, attrs)?;
            index += 1;
        }
        self.eat(Tok::RBrace)?;

        self.gen.push_local_ptr(offset);
        Ok(ExprAttrs::value(type_id))
    }

    fn parse_dyn_array_literal(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        // A dynamic array literal is a static array literal converted.
        let base = self.types.base(type_id);
        let item_size = self.type_size(base)?;

        // Pre-scan the item count with a lexer snapshot.
        let count = self.count_literal_items()?;

        let array_type = self.types.array_of(base, count, self.blocks.current());
        let (_, offset) = self.literal_temp(array_type)?;

        self.next()?;
        let mut index = 0i64;
        while !self.check(Tok::RBrace) {
            if index > 0 {
                self.eat(Tok::Comma)?;
            }
            if self.check(Tok::RBrace) {
                break;
            }
            self.gen.push_local_ptr(offset + index * item_size);
            let attrs = self.parse_expr()?;
            self.store_through_ptr(base, attrs)?;
            index += 1;
        }
        self.eat(Tok::RBrace)?;

        self.gen.push_local_ptr(offset);
        self.gen.push_int(count);
        let temp = self.alloc_temp(type_id)?;
        let temp_offset = self.local_offset(temp);
        self.gen.push_local_ptr(temp_offset);
        self.gen
            .call_builtin(velac_sem::BuiltinFn::Makefromarr, TypeKind::DynArray, Some(type_id));
        Ok(ExprAttrs::value(type_id))
    }

    /// Counts the top-level comma-separated items of a `{...}` literal by
    /// replaying a snapshot of the lexer.
    fn count_literal_items(&mut self) -> CompileResult<i64> {
        let mut lookahead = self.lex.clone();
        lookahead.next(&mut self.interner)?; // consume '{'
        let mut count = 0i64;
        let mut depth = 0i32;
        if !lookahead.check(Tok::RBrace) {
            count = 1;
        }
        loop {
            match lookahead.tok.kind {
                Tok::LBrace | Tok::LBracket | Tok::LPar => depth += 1,
                Tok::RBracket | Tok::RPar => depth -= 1,
                Tok::RBrace if depth == 0 => break,
                Tok::RBrace => depth -= 1,
                Tok::Comma if depth == 0 => count += 1,
                Tok::Eof => return Err(self.error("Unterminated literal")),
                _ => {}
            }
            lookahead.next(&mut self.interner)?;
        }
        Ok(count)
    }

    fn parse_struct_literal(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        let (_, offset) = self.literal_temp(type_id)?;
        self.next()?;

        let named = self.lex.tok.kind == Tok::Ident && {
            let mut lookahead = self.lex.clone();
            lookahead.next(&mut self.interner)?;
            lookahead.check(Tok::Colon)
        };

        let mut next_field = 0usize;
        while !self.check(Tok::RBrace) {
            if next_field > 0 {
                self.eat(Tok::Comma)?;
            }
            if self.check(Tok::RBrace) {
                break;
            }
            let field_index = if named {
                let name = self.eat_ident()?;
                self.eat(Tok::Colon)?;
                let position = self
                    .types
                    .get(type_id)
                    .fields
                    .iter()
                    .position(|f| f.name == name)
                    .ok_or_else(|| self.error("Unknown field"))?;
                if position < next_field {
                    return Err(self.error("Fields must appear in declaration order"));
                }
                position
            } else {
                next_field
            };
            if field_index >= self.types.get(type_id).fields.len() {
                return Err(self.error("Too many elements in the literal"));
            }
            let field = &self.types.get(type_id).fields[field_index];
            let (field_offset, field_type) = (field.offset, field.type_id);
            self.gen.push_local_ptr(offset + field_offset);
            let attrs = self.parse_expr()?;
            self.store_through_ptr(field_type, attrs)?;
            next_field = field_index + 1;
        }
        self.eat(Tok::RBrace)?;

        self.gen.push_local_ptr(offset);
        Ok(ExprAttrs::value(type_id))
    }

    fn parse_map_literal(&mut self, type_id: TypeId) -> CompileResult<ExprAttrs> {
        let (_, offset) = self.literal_temp(type_id)?;
        let key_type = self.types.map_key(type_id);
        let item_type = self.types.map_item(type_id);

        self.next()?;
        let mut first = true;
        while !self.check(Tok::RBrace) {
            if !first {
                self.eat(Tok::Comma)?;
            }
            if self.check(Tok::RBrace) {
                break;
            }
            first = false;
            self.gen.push_local_ptr(offset);
            let key = self.parse_expr()?;
            let key = self.implicit_conv(key_type, key)?;
            self.assert_compatible(key_type, key.type_id)?;
            self.gen.get_map_ptr(type_id);
            self.eat(Tok::Colon)?;
            let value = self.parse_expr()?;
            self.store_through_ptr(item_type, value)?;
        }
        self.eat(Tok::RBrace)?;

        self.gen.push_local_ptr(offset);
        Ok(ExprAttrs::value(type_id))
    }

    // --- Function literals

    /// `fn (params): R |captured, ...| { body }`
    fn parse_fn_literal(&mut self) -> CompileResult<ExprAttrs> {
        self.next()?;
        let sig = self.parse_signature(None)?;
        let block = self.blocks.current();
        let fn_type = self.types.fn_type(sig, block);
        let closure_type = self
            .types
            .closure_of(fn_type, self.prims.any, block, &mut self.interner);

        // Captured variable list, resolved in the enclosing scope.
        let mut captured: Vec<(Symbol, TypeId, usize)> = Vec::new();
        if self.check(Tok::Or) {
            self.next()?;
            while !self.check(Tok::Or) {
                if !captured.is_empty() {
                    self.eat(Tok::Comma)?;
                }
                let name = self.eat_ident()?;
                let found = self
                    .idents
                    .find(&self.modules, &self.blocks, self.blocks.module, name, None, &self.types, true)
                    .ok_or_else(|| {
                        self.error("Unknown identifier in the capture list")
                    })?;
                captured.push((name, self.idents.get(found).type_id, found));
            }
            self.eat(Tok::Or)?;
        }

        let capture_struct = if captured.is_empty() {
            None
        } else {
            let struct_type = self.types.add(TypeKind::Struct, block);
            for (name, type_id, _) in &captured {
                self.types
                    .add_field(struct_type, *name, *type_id)
                    .map_err(|msg| self.error(msg))?;
            }
            Some(struct_type)
        };

        // The literal's ident holds the entry and names the stack frame.
        let literal_name = self.interner.intern(&format!("#fn{}", self.gen.ip()));
        let index = self
            .idents
            .add_const(literal_name, fn_type, self.blocks.module, block, false, Const::Int(0), self.lex.tok.line)
            .map_err(|msg| self.error(msg))?;

        // Jump over the body in the enclosing instruction flow.
        self.gen.skip_prolog();

        // The context is pushed even without captures so an inner literal
        // never resolves names against an outer literal's capture list.
        let ctx_struct = capture_struct.unwrap_or_else(|| self.types.add(TypeKind::Struct, block));
        let upvalue_offset = {
            let sig = self.types.get(fn_type).sig.as_ref().expect("literal has a signature");
            velac_sem::Idents::param_offset(&self.types, sig, 0).map_err(|msg| self.error(msg))?
        };
        self.captures.push(CaptureCtx {
            struct_type: ctx_struct,
            upvalue_offset,
        });
        self.compile_fn_body(index)?;
        self.captures.pop();

        self.gen.skip_epilog();

        // Materialize the closure value.
        let entry = match &self.idents.get(index).kind {
            IdentKind::Const(Const::Int(entry)) => *entry,
            _ => unreachable!("literal entry was just set"),
        };
        let temp = self.alloc_temp(closure_type)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr_zero(offset, 24);
        self.gen.pop(1);
        self.gen.push_local_ptr(offset);
        self.gen.push_int(entry);
        self.gen.assign(TypeKind::Fn, 8);

        if let Some(struct_type) = capture_struct {
            let struct_size = self.type_size(struct_type)?;
            self.gen.push_int(struct_size);
            self.gen.call_builtin(velac_sem::BuiltinFn::New, TypeKind::Struct, Some(struct_type));
            self.gen.pop_reg(Register::HeapCopy);

            let fields: Vec<(i64, TypeId)> = self
                .types
                .get(struct_type)
                .fields
                .iter()
                .map(|f| (f.offset, f.type_id))
                .collect();
            for ((field_offset, field_type), (_, _, source)) in fields.iter().zip(captured.iter()) {
                self.gen.push_reg(Register::HeapCopy);
                self.gen.get_field_ptr(*field_offset);
                let attrs = self.push_var_access(*source)?;
                self.store_through_ptr(*field_type, attrs)?;
            }

            self.gen.push_local_ptr(offset + 8);
            self.gen.push_reg(Register::HeapCopy);
            self.gen.assign(TypeKind::Ptr, 8);

            let self_ptr_type = self.types.ptr_to(struct_type, block);
            self.gen.push_local_ptr(offset + 16);
            self.gen.push_uint(self_ptr_type.0 as u64 + 1);
            self.gen.assign(TypeKind::Int, 8);
        }

        self.gen.push_local_ptr(offset);
        Ok(ExprAttrs::value(closure_type))
    }

    /// Pushes the address of a variable identifier.
    fn push_var_access(&mut self, index: usize) -> CompileResult<ExprAttrs> {
        match self.idents.get(index).kind {
            IdentKind::GlobalVar { offset } => {
                self.gen.push_global_ptr(offset);
                Ok(ExprAttrs::var(self.idents.get(index).type_id))
            }
            IdentKind::LocalVar { offset } => {
                self.gen.push_local_ptr(offset);
                Ok(ExprAttrs::var(self.idents.get(index).type_id))
            }
            _ => Err(self.error("Variable expected in the capture list")),
        }
    }

    // --- Constant expressions

    /// Compile-time expression evaluation (no code emission).
    pub(crate) fn parse_const_expr(&mut self) -> CompileResult<(TypeId, Const)> {
        let (mut type_id, mut lhs) = self.parse_const_relation()?;
        while matches!(self.lex.tok.kind, Tok::AndAnd | Tok::OrOr) {
            let op = self.lex.tok.kind;
            self.next()?;
            let (rhs_type, rhs) = self.parse_const_relation()?;
            self.assert_compatible(type_id, rhs_type)?;
            consts::binary(&mut lhs, &rhs, op, self.type_kind(type_id)).map_err(|msg| self.error(msg))?;
            type_id = self.prims.bool_;
        }
        Ok((type_id, lhs))
    }

    fn parse_const_relation(&mut self) -> CompileResult<(TypeId, Const)> {
        let (mut type_id, mut lhs) = self.parse_const_relation_term()?;
        if self.lex.tok.kind.is_comparison() {
            let op = self.lex.tok.kind;
            self.next()?;
            let (rhs_type, rhs) = self.parse_const_relation_term()?;
            self.assert_compatible(type_id, rhs_type)?;
            consts::binary(&mut lhs, &rhs, op, self.type_kind(type_id)).map_err(|msg| self.error(msg))?;
            type_id = self.prims.bool_;
        }
        Ok((type_id, lhs))
    }

    fn parse_const_relation_term(&mut self) -> CompileResult<(TypeId, Const)> {
        let (type_id, mut lhs) = self.parse_const_term()?;
        let mut result_type = type_id;
        while matches!(self.lex.tok.kind, Tok::Plus | Tok::Minus | Tok::Or | Tok::Xor) {
            let op = self.lex.tok.kind;
            self.assert_valid_operator(result_type, op)?;
            self.next()?;
            let (rhs_type, rhs) = self.parse_const_term()?;
            self.assert_compatible(result_type, rhs_type)?;
            consts::binary(&mut lhs, &rhs, op, self.type_kind(result_type)).map_err(|msg| self.error(msg))?;
            result_type = self.wider_const_type(result_type, rhs_type);
        }
        Ok((result_type, lhs))
    }

    fn parse_const_term(&mut self) -> CompileResult<(TypeId, Const)> {
        let (type_id, mut lhs) = self.parse_const_factor()?;
        let mut result_type = type_id;
        while matches!(
            self.lex.tok.kind,
            Tok::Mul | Tok::Div | Tok::Mod | Tok::Shl | Tok::Shr | Tok::And
        ) {
            let op = self.lex.tok.kind;
            self.assert_valid_operator(result_type, op)?;
            self.next()?;
            let (rhs_type, rhs) = self.parse_const_factor()?;
            self.assert_compatible(result_type, rhs_type)?;
            consts::binary(&mut lhs, &rhs, op, self.type_kind(result_type)).map_err(|msg| self.error(msg))?;
            result_type = self.wider_const_type(result_type, rhs_type);
        }
        Ok((result_type, lhs))
    }

    fn wider_const_type(&self, a: TypeId, b: TypeId) -> TypeId {
        if self.type_kind(a).is_real() || !self.type_kind(b).is_real() {
            a
        } else {
            b
        }
    }

    fn parse_const_factor(&mut self) -> CompileResult<(TypeId, Const)> {
        match self.lex.tok.kind {
            Tok::IntNumber => {
                let value = self.lex.tok.uint_val;
                self.next()?;
                if value > i64::MAX as u64 {
                    Ok((self.prims.uint_, Const::UInt(value)))
                } else {
                    Ok((self.prims.int_, Const::Int(value as i64)))
                }
            }
            Tok::RealNumber => {
                let value = self.lex.tok.real_val;
                self.next()?;
                Ok((self.prims.real, Const::Real(value)))
            }
            Tok::CharLiteral => {
                let value = self.lex.tok.uint_val;
                self.next()?;
                Ok((self.prims.char_, Const::Int(value as i64)))
            }
            Tok::StrLiteral => {
                let text = self.interner.resolve(self.lex.tok.str_val).to_string();
                self.next()?;
                Ok((self.prims.str_, Const::Str(text)))
            }
            Tok::Minus | Tok::Not | Tok::Xor => {
                let op = self.lex.tok.kind;
                self.next()?;
                let (type_id, mut value) = self.parse_const_factor()?;
                consts::unary(&mut value, op, self.type_kind(type_id)).map_err(|msg| self.error(msg))?;
                Ok((type_id, value))
            }
            Tok::LPar => {
                self.next()?;
                let result = self.parse_const_expr()?;
                self.eat(Tok::RPar)?;
                Ok(result)
            }
            Tok::Ident => {
                let (module, name) = self.parse_qualified_name()?;
                let found = self
                    .idents
                    .find(&self.modules, &self.blocks, module, name, None, &self.types, true);
                match found {
                    Some(index) => match self.idents.get(index).kind.clone() {
                        IdentKind::Const(konst) => Ok((self.idents.get(index).type_id, konst)),
                        IdentKind::BuiltinFn(builtin) => self.parse_const_builtin(builtin),
                        _ => Err(self.error("Constant expected")),
                    },
                    None => {
                        let name = self.interner.resolve(name).to_string();
                        Err(self.error(format!("Unknown identifier {name}")))
                    }
                }
            }
            other => Err(self.error(format!("Unexpected {}, expected constant", other.spelling()))),
        }
    }

    /// Compile-time evaluable built-ins over constant arguments.
    fn parse_const_builtin(&mut self, builtin: velac_sem::BuiltinFn) -> CompileResult<(TypeId, Const)> {
        use velac_sem::BuiltinFn;
        if !builtin.foldable() {
            return Err(self.error("Constant expected"));
        }
        if builtin == BuiltinFn::Sizeof {
            self.eat(Tok::LPar)?;
            let type_id = self.parse_type()?;
            self.eat(Tok::RPar)?;
            let size = self.type_size(type_id)?;
            return Ok((self.prims.int_, Const::Int(size)));
        }
        self.eat(Tok::LPar)?;
        let (arg_type, mut value) = self.parse_const_expr()?;
        let arg2 = if builtin == BuiltinFn::Atan2 {
            self.eat(Tok::Comma)?;
            Some(self.parse_const_expr()?.1)
        } else {
            None
        };
        self.eat(Tok::RPar)?;
        consts::call_builtin(&mut value, arg2.as_ref(), builtin).map_err(|msg| self.error(msg))?;
        let result_type = match builtin {
            BuiltinFn::Round | BuiltinFn::Trunc | BuiltinFn::Ceil | BuiltinFn::Floor | BuiltinFn::Len => {
                self.prims.int_
            }
            BuiltinFn::Abs => arg_type,
            _ => self.prims.real,
        };
        Ok((result_type, value))
    }
}
