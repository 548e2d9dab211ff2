//! Built-in call parsing.
//!
//! Each built-in has its own argument protocol on the VM stack; this file
//! and the VM's built-in dispatcher must agree instruction by instruction.

use velac_lex::Tok;
use velac_sem::{BuiltinFn, IdentKind, TypeKind};
use velac_util::{CompileResult, TypeId};

use crate::compiler::Compiler;
use crate::expr::ExprAttrs;

impl Compiler {
    pub(crate) fn parse_builtin_call(&mut self, builtin: BuiltinFn) -> CompileResult<ExprAttrs> {
        self.eat(Tok::LPar)?;
        let attrs = match builtin {
            BuiltinFn::Printf | BuiltinFn::Fprintf | BuiltinFn::Sprintf => self.parse_printf_call(builtin)?,
            BuiltinFn::Scanf | BuiltinFn::Fscanf | BuiltinFn::Sscanf => self.parse_scanf_call(builtin)?,
            BuiltinFn::Real => {
                let arg = self.parse_expr()?;
                let kind = self.type_kind(arg.type_id);
                if !kind.is_integer() {
                    return Err(self.error("Integer expected"));
                }
                self.gen.call_builtin(BuiltinFn::Real, kind, None);
                ExprAttrs::value(self.prims.real)
            }
            BuiltinFn::Round | BuiltinFn::Trunc | BuiltinFn::Ceil | BuiltinFn::Floor => {
                self.parse_real_arg()?;
                self.gen.call_builtin(builtin, TypeKind::Real, None);
                ExprAttrs::value(self.prims.int_)
            }
            BuiltinFn::Abs => {
                let arg = self.parse_expr()?;
                if !self.type_kind(arg.type_id).is_integer() {
                    return Err(self.error("Integer expected"));
                }
                self.gen.call_builtin(BuiltinFn::Abs, TypeKind::Int, None);
                ExprAttrs::value(self.prims.int_)
            }
            BuiltinFn::Fabs
            | BuiltinFn::Sqrt
            | BuiltinFn::Sin
            | BuiltinFn::Cos
            | BuiltinFn::Atan
            | BuiltinFn::Exp
            | BuiltinFn::Log => {
                self.parse_real_arg()?;
                self.gen.call_builtin(builtin, TypeKind::Real, None);
                ExprAttrs::value(self.prims.real)
            }
            BuiltinFn::Atan2 => {
                self.parse_real_arg()?;
                self.eat(Tok::Comma)?;
                self.parse_real_arg()?;
                self.gen.call_builtin(BuiltinFn::Atan2, TypeKind::Real, None);
                ExprAttrs::value(self.prims.real)
            }
            BuiltinFn::New => self.parse_new_call()?,
            BuiltinFn::Make => self.parse_make_call()?,
            BuiltinFn::Copy => self.parse_copy_call()?,
            BuiltinFn::Append => self.parse_append_call()?,
            BuiltinFn::Insert => self.parse_insert_call()?,
            BuiltinFn::Delete => self.parse_delete_call()?,
            BuiltinFn::Slice => self.parse_slice_call()?,
            BuiltinFn::Sort => self.parse_sort_call()?,
            BuiltinFn::Sortfast => self.parse_sortfast_call()?,
            BuiltinFn::Len => self.parse_len_call()?,
            BuiltinFn::Cap => {
                let arg = self.parse_expr()?;
                if self.type_kind(arg.type_id) != TypeKind::DynArray {
                    return Err(self.error("Dynamic array expected"));
                }
                self.gen.call_builtin(BuiltinFn::Cap, TypeKind::DynArray, None);
                ExprAttrs::value(self.prims.int_)
            }
            BuiltinFn::Sizeof => {
                let type_id = self.parse_type_or_expr_type()?;
                let size = self.type_size(type_id)?;
                self.gen.push_int(size);
                ExprAttrs::value(self.prims.int_)
            }
            BuiltinFn::Sizeofself | BuiltinFn::Selfptr | BuiltinFn::Selfhasptr => {
                let arg = self.parse_expr()?;
                let arg = self.implicit_conv(self.prims.any, arg)?;
                if self.type_kind(arg.type_id) != TypeKind::Interface {
                    return Err(self.error("Interface expected"));
                }
                self.gen.call_builtin(builtin, TypeKind::Interface, None);
                match builtin {
                    BuiltinFn::Sizeofself => ExprAttrs::value(self.prims.int_),
                    BuiltinFn::Selfptr => ExprAttrs::value(self.prims.ptr_void),
                    _ => ExprAttrs::value(self.prims.bool_),
                }
            }
            BuiltinFn::Selftypeeq => {
                let left = self.parse_expr()?;
                self.implicit_conv(self.prims.any, left)?;
                self.eat(Tok::Comma)?;
                let right = self.parse_expr()?;
                self.implicit_conv(self.prims.any, right)?;
                self.gen.call_builtin(BuiltinFn::Selftypeeq, TypeKind::Interface, None);
                ExprAttrs::value(self.prims.bool_)
            }
            BuiltinFn::Valid => {
                let arg = self.parse_expr()?;
                let kind = self.type_kind(arg.type_id);
                let kind = match kind {
                    TypeKind::DynArray
                    | TypeKind::Map
                    | TypeKind::Interface
                    | TypeKind::Fn
                    | TypeKind::Closure
                    | TypeKind::Fiber => kind,
                    _ => return Err(self.error(format!("{} cannot be validated", self.spelling(arg.type_id)))),
                };
                self.gen.call_builtin(BuiltinFn::Valid, kind, None);
                ExprAttrs::value(self.prims.bool_)
            }
            BuiltinFn::Validkey => {
                let map = self.parse_expr()?;
                let map_type = map.type_id;
                if self.type_kind(map_type) != TypeKind::Map {
                    return Err(self.error("Map expected"));
                }
                self.eat(Tok::Comma)?;
                let key_type = self.types.map_key(map_type);
                let key = self.parse_expr()?;
                let key = self.implicit_conv(key_type, key)?;
                self.assert_compatible(key_type, key.type_id)?;
                self.gen.call_builtin(BuiltinFn::Validkey, TypeKind::Map, Some(map_type));
                ExprAttrs::value(self.prims.bool_)
            }
            BuiltinFn::Keys => {
                let map = self.parse_expr()?;
                let map_type = map.type_id;
                if self.type_kind(map_type) != TypeKind::Map {
                    return Err(self.error("Map expected"));
                }
                let key_type = self.types.map_key(map_type);
                let result_type = self.types.dyn_array_of(key_type, self.blocks.current());
                let temp = self.alloc_temp(result_type)?;
                let offset = self.local_offset(temp);
                self.gen.push_local_ptr(offset);
                self.gen.call_builtin(BuiltinFn::Keys, TypeKind::Map, Some(result_type));
                ExprAttrs::value(result_type)
            }
            BuiltinFn::Resume => {
                if self.check(Tok::RPar) {
                    self.gen.push_int(0);
                } else {
                    let arg = self.parse_expr()?;
                    let arg = if self.type_kind(arg.type_id) == TypeKind::Ptr
                        && self.type_kind(self.types.base(arg.type_id)) == TypeKind::Fiber
                    {
                        self.gen.deref(TypeKind::Fiber);
                        ExprAttrs::value(self.prims.fiber_)
                    } else {
                        arg
                    };
                    if self.type_kind(arg.type_id) != TypeKind::Fiber {
                        return Err(self.error("Fiber expected"));
                    }
                }
                self.gen.call_builtin(BuiltinFn::Resume, TypeKind::Fiber, None);
                ExprAttrs::value(self.prims.void_)
            }
            BuiltinFn::Memusage => {
                self.gen.call_builtin(BuiltinFn::Memusage, TypeKind::Int, None);
                ExprAttrs::value(self.prims.int_)
            }
            BuiltinFn::Exit => {
                let code = self.parse_expr()?;
                if !self.type_kind(code.type_id).is_integer() {
                    return Err(self.error("Integer expected"));
                }
                if self.check(Tok::Comma) {
                    self.next()?;
                    let msg = self.parse_expr()?;
                    self.assert_compatible(self.prims.str_, msg.type_id)?;
                } else {
                    let offset = self.gen.data.add_str_literal("");
                    self.gen.push_global_ptr(offset);
                }
                self.gen.call_builtin(BuiltinFn::Exit, TypeKind::Void, None);
                ExprAttrs::value(self.prims.void_)
            }
            BuiltinFn::RealLhs
            | BuiltinFn::Makefromarr
            | BuiltinFn::Makefromstr
            | BuiltinFn::Maketoarr
            | BuiltinFn::Maketostr
            | BuiltinFn::Typeptr => return Err(self.error("Illegal function")),
        };
        self.eat(Tok::RPar)?;
        Ok(attrs)
    }

    fn parse_real_arg(&mut self) -> CompileResult<()> {
        let arg = self.parse_expr()?;
        let arg = self.implicit_conv(self.prims.real, arg)?;
        if !self.type_kind(arg.type_id).is_real() {
            return Err(self.error("Real expected"));
        }
        Ok(())
    }

    /// `printf(fmt, ...)` / `fprintf(f, fmt, ...)` / `sprintf(fmt, ...)`.
    /// The stack window is `[count, stream, format]`, with one builtin
    /// call per argument and a final flush over the remaining format.
    fn parse_printf_call(&mut self, builtin: BuiltinFn) -> CompileResult<ExprAttrs> {
        self.gen.push_int(0); // running count
        match builtin {
            BuiltinFn::Fprintf => {
                let file = self.parse_expr()?;
                self.assert_compatible(self.prims.ptr_void, file.type_id)?;
                self.eat(Tok::Comma)?;
            }
            _ => self.gen.push_int(0),
        }
        let format = self.parse_expr()?;
        self.assert_compatible(self.prims.str_, format.type_id)?;

        while self.check(Tok::Comma) {
            self.next()?;
            let arg = self.parse_expr()?;
            let arg_kind = self.type_kind(arg.type_id);
            let arg = if arg_kind.is_structured() {
                // %v arguments travel as `any`
                self.implicit_conv(self.prims.any, arg)?
            } else {
                arg
            };
            self.gen.call_builtin(builtin, self.type_kind(arg.type_id), Some(arg.type_id));
        }
        // Flush the trailing text of the format string.
        self.gen.push_int(0);
        self.gen.call_builtin(builtin, TypeKind::Void, None);

        if builtin == BuiltinFn::Sprintf {
            self.gen.pop(1); // format
            self.gen.swap();
            self.gen.pop(1); // count
            Ok(ExprAttrs::owned_value(self.prims.str_))
        } else {
            self.gen.pop(2); // format, stream
            Ok(ExprAttrs::value(self.prims.int_))
        }
    }

    /// `scanf(fmt, ^args...)` family; `sscanf` takes the source first.
    fn parse_scanf_call(&mut self, builtin: BuiltinFn) -> CompileResult<ExprAttrs> {
        self.gen.push_int(0); // running count
        match builtin {
            BuiltinFn::Fscanf => {
                let file = self.parse_expr()?;
                self.assert_compatible(self.prims.ptr_void, file.type_id)?;
                self.eat(Tok::Comma)?;
            }
            BuiltinFn::Sscanf => {
                let src = self.parse_expr()?;
                self.assert_compatible(self.prims.str_, src.type_id)?;
                self.eat(Tok::Comma)?;
            }
            _ => self.gen.push_int(0),
        }
        let format = self.parse_expr()?;
        self.assert_compatible(self.prims.str_, format.type_id)?;

        while self.check(Tok::Comma) {
            self.next()?;
            let arg = self.parse_expr()?;
            if self.type_kind(arg.type_id) != TypeKind::Ptr {
                return Err(self.error("Pointer expected as scanf destination"));
            }
            let target = self.types.base(arg.type_id);
            self.gen.call_builtin(builtin, self.type_kind(target), Some(target));
        }
        self.gen.push_int(0);
        self.gen.call_builtin(builtin, TypeKind::Void, None);

        self.gen.pop(2); // format, stream
        Ok(ExprAttrs::value(self.prims.int_))
    }

    /// `new(T [, init])`: a zeroed heap chunk, optionally initialized.
    fn parse_new_call(&mut self) -> CompileResult<ExprAttrs> {
        let type_id = self.parse_type()?;
        let size = self.type_size(type_id)?;
        self.gen.push_int(size);
        self.gen.call_builtin(BuiltinFn::New, self.type_kind(type_id), Some(type_id));
        if self.check(Tok::Comma) {
            self.next()?;
            self.gen.dup();
            let attrs = self.parse_expr()?;
            self.store_through_ptr(type_id, attrs)?;
        }
        let ptr_type = self.types.ptr_to(type_id, self.blocks.current());
        Ok(ExprAttrs::owned_value(ptr_type))
    }

    /// `make([]T, len)` / `make(map[K]V)` / `make(fiber, f, ^arg)`.
    fn parse_make_call(&mut self) -> CompileResult<ExprAttrs> {
        let type_id = self.parse_type()?;
        match self.type_kind(type_id) {
            TypeKind::DynArray => {
                self.eat(Tok::Comma)?;
                let len = self.parse_expr()?;
                if !self.type_kind(len.type_id).is_integer() {
                    return Err(self.error("Integer expected as length"));
                }
                let temp = self.alloc_temp(type_id)?;
                let offset = self.local_offset(temp);
                self.gen.push_local_ptr(offset);
                self.gen.call_builtin(BuiltinFn::Make, TypeKind::DynArray, Some(type_id));
                Ok(ExprAttrs::value(type_id))
            }
            TypeKind::Map => {
                let temp = self.alloc_temp(type_id)?;
                let offset = self.local_offset(temp);
                self.gen.push_local_ptr(offset);
                self.gen.call_builtin(BuiltinFn::Make, TypeKind::Map, Some(type_id));
                Ok(ExprAttrs::value(type_id))
            }
            TypeKind::Fiber => {
                self.eat(Tok::Comma)?;
                let child = self.parse_expr()?;
                let child_sig = match self.type_kind(child.type_id) {
                    TypeKind::Closure => self.types.closure_sig(child.type_id).clone(),
                    _ => return Err(self.error("Illegal fiber function")),
                };
                // fn (parent: ^fiber, arg: ^T)
                let valid = !child_sig.is_method
                    && child_sig.params.len() == 3
                    && self.type_kind(child_sig.result) == TypeKind::Void
                    && self.type_kind(child_sig.params[1].type_id) == TypeKind::Ptr
                    && self.type_kind(self.types.base(child_sig.params[1].type_id)) == TypeKind::Fiber
                    && self.type_kind(child_sig.params[2].type_id) == TypeKind::Ptr
                    && self.type_kind(self.types.base(child_sig.params[2].type_id)) != TypeKind::Void;
                if !valid {
                    return Err(self.error("Illegal fiber function"));
                }
                self.eat(Tok::Comma)?;
                let arg_type = child_sig.params[2].type_id;
                let arg = self.parse_expr()?;
                self.assert_compatible(arg_type, arg.type_id)?;
                self.gen.call_builtin(BuiltinFn::Make, TypeKind::Fiber, Some(arg_type));
                Ok(ExprAttrs::owned_value(self.prims.fiber_))
            }
            _ => Err(self.error("Illegal type")),
        }
    }

    fn parse_copy_call(&mut self) -> CompileResult<ExprAttrs> {
        let arg = self.parse_expr()?;
        let kind = self.type_kind(arg.type_id);
        if !matches!(kind, TypeKind::DynArray | TypeKind::Map) {
            return Err(self.error("Dynamic array or map expected"));
        }
        let temp = self.alloc_temp(arg.type_id)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr(offset);
        self.gen.call_builtin(BuiltinFn::Copy, kind, Some(arg.type_id));
        Ok(ExprAttrs::value(arg.type_id))
    }

    /// Spills a scalar item to a temporary so it can travel by pointer.
    fn spill_item(&mut self, item_type: TypeId, attrs: ExprAttrs) -> CompileResult<()> {
        if self.type_kind(item_type).is_structured() {
            let attrs = self.implicit_conv(item_type, attrs)?;
            self.assert_compatible(item_type, attrs.type_id)?;
            return Ok(());
        }
        let temp = self.alloc_temp(item_type)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr(offset);
        self.gen.swap();
        self.store_through_ptr(item_type, attrs)?;
        self.gen.push_local_ptr(offset);
        Ok(())
    }

    fn parse_append_call(&mut self) -> CompileResult<ExprAttrs> {
        let array = self.parse_expr()?;
        let array_type = array.type_id;
        if self.type_kind(array_type) != TypeKind::DynArray {
            return Err(self.error("Dynamic array expected"));
        }
        let base = self.types.base(array_type);
        self.eat(Tok::Comma)?;
        let item = self.parse_expr()?;
        let single = !self.types.equivalent(item.type_id, array_type);
        if single {
            self.spill_item(base, item)?;
        }
        self.gen.push_int(single as i64);
        let temp = self.alloc_temp(array_type)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr(offset);
        self.gen.call_builtin(BuiltinFn::Append, TypeKind::DynArray, Some(array_type));
        Ok(ExprAttrs::value(array_type))
    }

    fn parse_insert_call(&mut self) -> CompileResult<ExprAttrs> {
        let array = self.parse_expr()?;
        let array_type = array.type_id;
        if self.type_kind(array_type) != TypeKind::DynArray {
            return Err(self.error("Dynamic array expected"));
        }
        let base = self.types.base(array_type);
        self.eat(Tok::Comma)?;
        let index = self.parse_expr()?;
        if !self.type_kind(index.type_id).is_integer() {
            return Err(self.error("Integer expected as index"));
        }
        self.eat(Tok::Comma)?;
        let item = self.parse_expr()?;
        self.spill_item(base, item)?;
        let temp = self.alloc_temp(array_type)?;
        let offset = self.local_offset(temp);
        self.gen.push_local_ptr(offset);
        self.gen.call_builtin(BuiltinFn::Insert, TypeKind::DynArray, Some(array_type));
        Ok(ExprAttrs::value(array_type))
    }

    fn parse_delete_call(&mut self) -> CompileResult<ExprAttrs> {
        let target = self.parse_expr()?;
        let target_type = target.type_id;
        self.eat(Tok::Comma)?;
        match self.type_kind(target_type) {
            TypeKind::DynArray => {
                let index = self.parse_expr()?;
                if !self.type_kind(index.type_id).is_integer() {
                    return Err(self.error("Integer expected as index"));
                }
                let temp = self.alloc_temp(target_type)?;
                let offset = self.local_offset(temp);
                self.gen.push_local_ptr(offset);
                self.gen.call_builtin(BuiltinFn::Delete, TypeKind::DynArray, Some(target_type));
                Ok(ExprAttrs::value(target_type))
            }
            TypeKind::Map => {
                let key_type = self.types.map_key(target_type);
                let key = self.parse_expr()?;
                let key = self.implicit_conv(key_type, key)?;
                self.assert_compatible(key_type, key.type_id)?;
                let temp = self.alloc_temp(target_type)?;
                let offset = self.local_offset(temp);
                self.gen.push_local_ptr(offset);
                self.gen.call_builtin(BuiltinFn::Delete, TypeKind::Map, Some(target_type));
                Ok(ExprAttrs::value(target_type))
            }
            _ => Err(self.error("Dynamic array or map expected")),
        }
    }

    fn parse_slice_call(&mut self) -> CompileResult<ExprAttrs> {
        let arg = self.parse_expr()?;
        let arg_type = arg.type_id;
        let kind = self.type_kind(arg_type);
        if !matches!(kind, TypeKind::DynArray | TypeKind::Str) {
            return Err(self.error("Dynamic array or string expected"));
        }
        self.eat(Tok::Comma)?;
        let start = self.parse_expr()?;
        if !self.type_kind(start.type_id).is_integer() {
            return Err(self.error("Integer expected as index"));
        }
        if self.check(Tok::Comma) {
            self.next()?;
            let end = self.parse_expr()?;
            if !self.type_kind(end.type_id).is_integer() {
                return Err(self.error("Integer expected as index"));
            }
        } else {
            self.gen.push_int(i64::MIN);
        }
        if kind == TypeKind::DynArray {
            let temp = self.alloc_temp(arg_type)?;
            let offset = self.local_offset(temp);
            self.gen.push_local_ptr(offset);
            self.gen.call_builtin(BuiltinFn::Slice, TypeKind::DynArray, Some(arg_type));
            Ok(ExprAttrs::value(arg_type))
        } else {
            self.gen.push_int(0);
            self.gen.call_builtin(BuiltinFn::Slice, TypeKind::Str, None);
            Ok(ExprAttrs::owned_value(self.prims.str_))
        }
    }

    fn parse_sort_call(&mut self) -> CompileResult<ExprAttrs> {
        let array = self.parse_expr()?;
        let array_type = array.type_id;
        if self.type_kind(array_type) != TypeKind::DynArray {
            return Err(self.error("Dynamic array expected"));
        }
        let base = self.types.base(array_type);
        self.eat(Tok::Comma)?;
        let cmp = self.parse_expr()?;
        if self.type_kind(cmp.type_id) != TypeKind::Closure {
            return Err(self.error("Function expected as comparator"));
        }
        let sig = self.types.closure_sig(cmp.type_id).clone();
        let valid = !sig.is_method
            && sig.params.len() == 3
            && self.type_kind(sig.result).is_integer()
            && self.type_kind(sig.params[1].type_id) == TypeKind::Ptr
            && self.types.equivalent(self.types.base(sig.params[1].type_id), base)
            && self.type_kind(sig.params[2].type_id) == TypeKind::Ptr
            && self.types.equivalent(self.types.base(sig.params[2].type_id), base);
        if !valid {
            return Err(self.error("Illegal comparator function"));
        }
        self.gen.call_builtin(BuiltinFn::Sort, TypeKind::DynArray, Some(cmp.type_id));
        Ok(ExprAttrs::value(self.prims.void_))
    }

    /// `sortfast(array, ascending [, field])`: generic compare on the item
    /// or on one of its fields.
    fn parse_sortfast_call(&mut self) -> CompileResult<ExprAttrs> {
        let array = self.parse_expr()?;
        let array_type = array.type_id;
        if self.type_kind(array_type) != TypeKind::DynArray {
            return Err(self.error("Dynamic array expected"));
        }
        let base = self.types.base(array_type);
        self.eat(Tok::Comma)?;
        let ascending = self.parse_expr()?;
        if self.type_kind(ascending.type_id) != TypeKind::Bool {
            return Err(self.error("Boolean expected"));
        }
        let (offset, item_type) = if self.check(Tok::Comma) {
            self.next()?;
            if self.type_kind(base) != TypeKind::Struct {
                return Err(self.error("Structure expected for sorting by field"));
            }
            let name = self.eat_ident()?;
            let field = self
                .types
                .find_field(base, name)
                .ok_or_else(|| self.error("Unknown field"))?;
            (field.offset, field.type_id)
        } else {
            (0, base)
        };
        self.gen.push_int(offset);
        self.gen.call_builtin(BuiltinFn::Sortfast, TypeKind::DynArray, Some(item_type));
        Ok(ExprAttrs::value(self.prims.void_))
    }

    fn parse_len_call(&mut self) -> CompileResult<ExprAttrs> {
        let arg = self.parse_expr()?;
        match self.type_kind(arg.type_id) {
            TypeKind::Array => {
                // Static array lengths fold at compile time.
                let len = self.types.get(arg.type_id).num_items;
                self.gen.pop(1);
                self.gen.push_int(len);
            }
            kind @ (TypeKind::DynArray | TypeKind::Str | TypeKind::Map) => {
                self.gen.call_builtin(BuiltinFn::Len, kind, None);
            }
            _ => return Err(self.error(format!("{} has no length", self.spelling(arg.type_id)))),
        }
        Ok(ExprAttrs::value(self.prims.int_))
    }

    /// `sizeof` takes a type or an expression.
    fn parse_type_or_expr_type(&mut self) -> CompileResult<TypeId> {
        let is_type = match self.lex.tok.kind {
            Tok::Caret | Tok::Weak | Tok::LBracket | Tok::Map | Tok::Struct | Tok::Interface | Tok::Str => true,
            Tok::Ident => {
                let found = self.idents.find(
                    &self.modules,
                    &self.blocks,
                    self.blocks.module,
                    self.lex.tok.name,
                    None,
                    &self.types,
                    false,
                );
                found.is_some_and(|index| matches!(self.idents.get(index).kind, IdentKind::Type))
            }
            _ => false,
        };
        if is_type {
            self.parse_type()
        } else {
            let attrs = self.parse_expr()?;
            self.gen.pop(1);
            Ok(attrs.type_id)
        }
    }
}
