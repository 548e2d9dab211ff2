//! Structural type graph.
//!
//! Types live in an arena indexed by [`TypeId`]; arena indices stand in for
//! the pointer graph a C implementation would use, which keeps mutually
//! recursive types representable and forward resolution a simple in-place
//! replacement. Equivalence is structural, with a visited-pair list so
//! cyclic structures stay finite.

use velac_lex::Tok;
use velac_util::{Interner, Symbol, TypeId};

use crate::consts::Const;

/// Kind tag of a type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TypeKind {
    #[default]
    None,
    Forward,
    Void,
    Null,
    Int8,
    Int16,
    Int32,
    Int,
    UInt8,
    UInt16,
    UInt32,
    UInt,
    Bool,
    Char,
    Real32,
    Real,
    Ptr,
    WeakPtr,
    Array,
    DynArray,
    Str,
    Map,
    Struct,
    Interface,
    Closure,
    Fiber,
    Fn,
}

impl TypeKind {
    pub fn spelling(self) -> &'static str {
        match self {
            TypeKind::None => "none",
            TypeKind::Forward => "forward",
            TypeKind::Void => "void",
            TypeKind::Null => "null",
            TypeKind::Int8 => "int8",
            TypeKind::Int16 => "int16",
            TypeKind::Int32 => "int32",
            TypeKind::Int => "int",
            TypeKind::UInt8 => "uint8",
            TypeKind::UInt16 => "uint16",
            TypeKind::UInt32 => "uint32",
            TypeKind::UInt => "uint",
            TypeKind::Bool => "bool",
            TypeKind::Char => "char",
            TypeKind::Real32 => "real32",
            TypeKind::Real => "real",
            TypeKind::Ptr => "pointer",
            TypeKind::WeakPtr => "weak pointer",
            TypeKind::Array => "array",
            TypeKind::DynArray => "dynamic array",
            TypeKind::Str => "str",
            TypeKind::Map => "map",
            TypeKind::Struct => "struct",
            TypeKind::Interface => "interface",
            TypeKind::Closure => "closure",
            TypeKind::Fiber => "fiber",
            TypeKind::Fn => "fn",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeKind::Int8
                | TypeKind::Int16
                | TypeKind::Int32
                | TypeKind::Int
                | TypeKind::UInt8
                | TypeKind::UInt16
                | TypeKind::UInt32
                | TypeKind::UInt
        )
    }

    pub fn is_ordinal(self) -> bool {
        self.is_integer() || self == TypeKind::Char || self == TypeKind::Bool
    }

    pub fn is_real(self) -> bool {
        matches!(self, TypeKind::Real32 | TypeKind::Real)
    }

    /// True for the kinds the reference-count engine must trace.
    pub fn is_garbage_collected(self) -> bool {
        matches!(
            self,
            TypeKind::Ptr
                | TypeKind::WeakPtr
                | TypeKind::Str
                | TypeKind::Array
                | TypeKind::DynArray
                | TypeKind::Map
                | TypeKind::Struct
                | TypeKind::Interface
                | TypeKind::Closure
                | TypeKind::Fiber
        )
    }

    /// True for the kinds represented on the VM stack by a pointer to their
    /// actual storage rather than by value.
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            TypeKind::Array
                | TypeKind::DynArray
                | TypeKind::Map
                | TypeKind::Struct
                | TypeKind::Interface
                | TypeKind::Closure
        )
    }

    /// Range check for integer/real assignment into this kind.
    pub fn overflows(self, val: &Const) -> bool {
        match self {
            TypeKind::Void => true,
            TypeKind::Int8 => val.int_val() < -128 || val.int_val() > 127,
            TypeKind::Int16 => val.int_val() < -32768 || val.int_val() > 32767,
            TypeKind::Int32 => val.int_val() < -2147483648 || val.int_val() > 2147483647,
            TypeKind::UInt8 => val.int_val() < 0 || val.int_val() > 255,
            TypeKind::UInt16 => val.int_val() < 0 || val.int_val() > 65535,
            TypeKind::UInt32 => val.int_val() < 0 || val.int_val() > 4294967295,
            TypeKind::Char => val.int_val() < 0 || val.int_val() > 255,
            TypeKind::Real32 => val.real_val() < -f32::MAX as f64 || val.real_val() > f32::MAX as f64,
            TypeKind::Real => val.real_val() < -f64::MAX || val.real_val() > f64::MAX,
            _ => false,
        }
    }
}

/// A struct or interface field. The offset of a field equals the size of
/// the struct before the field was added; there is no padding.
#[derive(Clone, Debug)]
pub struct Field {
    pub name: Symbol,
    pub type_id: TypeId,
    pub offset: i64,
}

/// A function parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: Symbol,
    pub type_id: TypeId,
    pub default_val: Option<Const>,
}

/// A function signature. Every function carries the hidden `#upvalue`
/// parameter of type `any` in slot 0; a method's receiver follows it.
#[derive(Clone, Debug, Default)]
pub struct Signature {
    pub params: Vec<Param>,
    pub num_default_params: usize,
    pub is_method: bool,
    /// For interface methods: byte offset of the method entry from `#self`.
    pub offset_from_self: i64,
    /// Result type; `void` when the function returns nothing.
    pub result: TypeId,
}

/// A type arena entry.
#[derive(Clone, Debug)]
pub struct Type {
    pub kind: TypeKind,
    /// Block in which the type was declared (for scoped freeing).
    pub block: usize,
    /// Base type: pointee for pointers, item for arrays, node for maps.
    pub base: Option<TypeId>,
    /// Item count for arrays; field count mirrors `fields.len()` for
    /// structs and interfaces.
    pub num_items: i64,
    /// Accumulated byte size for structs, interfaces, and closures.
    pub size: i64,
    pub fields: Vec<Field>,
    pub sig: Option<Signature>,
    /// Declaring identifier, when the type has a name.
    pub ident: Option<usize>,
    /// For structs representing expression lists.
    pub is_expr_list: bool,
    /// For forward types: the module and name awaiting resolution.
    pub forward_name: Option<(usize, Symbol)>,
}

impl Type {
    fn new(kind: TypeKind, block: usize) -> Self {
        Self {
            kind,
            block,
            base: None,
            num_items: 0,
            size: 0,
            fields: Vec::new(),
            sig: None,
            ident: None,
            is_expr_list: false,
            forward_name: None,
        }
    }
}

/// Pre-declared primitive types, created once per compiler at start-up.
#[derive(Clone, Copy, Debug)]
pub struct PrimTypes {
    pub void_: TypeId,
    pub null_: TypeId,
    pub int8: TypeId,
    pub int16: TypeId,
    pub int32: TypeId,
    pub int_: TypeId,
    pub uint8: TypeId,
    pub uint16: TypeId,
    pub uint32: TypeId,
    pub uint_: TypeId,
    pub bool_: TypeId,
    pub char_: TypeId,
    pub real32: TypeId,
    pub real: TypeId,
    pub str_: TypeId,
    pub fiber_: TypeId,
    pub ptr_void: TypeId,
    pub ptr_null: TypeId,
    /// The empty interface.
    pub any: TypeId,
}

/// The type arena.
#[derive(Debug)]
pub struct Types {
    items: Vec<Type>,
    forwards: Vec<TypeId>,
    pub forward_enabled: bool,
}

impl Types {
    /// Creates the arena with all primitive types registered in block 0.
    pub fn new() -> (Types, PrimTypes) {
        let mut types = Types {
            items: Vec::with_capacity(64),
            forwards: Vec::new(),
            forward_enabled: false,
        };

        let void_ = types.add(TypeKind::Void, 0);
        let null_ = types.add(TypeKind::Null, 0);
        let int8 = types.add(TypeKind::Int8, 0);
        let int16 = types.add(TypeKind::Int16, 0);
        let int32 = types.add(TypeKind::Int32, 0);
        let int_ = types.add(TypeKind::Int, 0);
        let uint8 = types.add(TypeKind::UInt8, 0);
        let uint16 = types.add(TypeKind::UInt16, 0);
        let uint32 = types.add(TypeKind::UInt32, 0);
        let uint_ = types.add(TypeKind::UInt, 0);
        let bool_ = types.add(TypeKind::Bool, 0);
        let char_ = types.add(TypeKind::Char, 0);
        let real32 = types.add(TypeKind::Real32, 0);
        let real = types.add(TypeKind::Real, 0);

        let str_ = types.add(TypeKind::Str, 0);
        types.get_mut(str_).base = Some(char_);

        let fiber_ = types.add(TypeKind::Fiber, 0);
        types.get_mut(fiber_).base = Some(void_);

        let ptr_void = types.ptr_to(void_, 0);
        let ptr_null = types.ptr_to(null_, 0);

        let any = types.add(TypeKind::Interface, 0);
        types.get_mut(any).base = Some(void_);
        types.add_interface_header_fields(any, ptr_void);

        let prims = PrimTypes {
            void_,
            null_,
            int8,
            int16,
            int32,
            int_,
            uint8,
            uint16,
            uint32,
            uint_,
            bool_,
            char_,
            real32,
            real,
            str_,
            fiber_,
            ptr_void,
            ptr_null,
            any,
        };
        (types, prims)
    }

    pub fn add(&mut self, kind: TypeKind, block: usize) -> TypeId {
        let id = TypeId::new(self.items.len());
        self.items.push(Type::new(kind, block));
        id
    }

    /// Registers a forward type awaiting the declaration of `name`.
    pub fn add_forward(&mut self, block: usize, module: usize, name: Symbol) -> TypeId {
        let id = self.add(TypeKind::Forward, block);
        self.get_mut(id).forward_name = Some((module, name));
        self.forwards.push(id);
        id
    }

    #[inline]
    pub fn get(&self, id: TypeId) -> &Type {
        &self.items[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.items[id.index()]
    }

    #[inline]
    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.items[id.index()].kind
    }

    #[inline]
    pub fn base(&self, id: TypeId) -> TypeId {
        self.items[id.index()].base.expect("type has no base")
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ptr_to(&mut self, base: TypeId, block: usize) -> TypeId {
        let id = self.add(TypeKind::Ptr, block);
        self.get_mut(id).base = Some(base);
        id
    }

    pub fn weak_ptr_to(&mut self, base: TypeId, block: usize) -> TypeId {
        let id = self.add(TypeKind::WeakPtr, block);
        self.get_mut(id).base = Some(base);
        id
    }

    pub fn array_of(&mut self, base: TypeId, num_items: i64, block: usize) -> TypeId {
        let id = self.add(TypeKind::Array, block);
        let ty = self.get_mut(id);
        ty.base = Some(base);
        ty.num_items = num_items;
        id
    }

    pub fn dyn_array_of(&mut self, base: TypeId, block: usize) -> TypeId {
        let id = self.add(TypeKind::DynArray, block);
        self.get_mut(id).base = Some(base);
        id
    }

    /// Builds `map[key]item`: the map type plus its self-referential tree
    /// node struct `{#len, #key, #data, #left, #right}`.
    pub fn map_of(
        &mut self,
        key: TypeId,
        item: TypeId,
        block: usize,
        interner: &mut Interner,
    ) -> Result<TypeId, String> {
        let key_kind = self.kind(key);
        if !(key_kind.is_ordinal() || key_kind.is_real() || key_kind == TypeKind::Str) {
            return Err(format!("Illegal map key type {}", key_kind.spelling()));
        }

        let node = self.add(TypeKind::Struct, block);
        let node_ptr = self.ptr_to(node, block);
        let key_ptr = self.ptr_to(key, block);
        let item_ptr = self.ptr_to(item, block);

        let len_name = interner.intern("#len");
        let key_name = interner.intern("#key");
        let data_name = interner.intern("#data");
        let left_name = interner.intern("#left");
        let right_name = interner.intern("#right");

        let int_len = self.find_primitive(TypeKind::Int);
        self.add_field(node, len_name, int_len)?;
        self.add_field(node, key_name, key_ptr)?;
        self.add_field(node, data_name, item_ptr)?;
        self.add_field(node, left_name, node_ptr)?;
        self.add_field(node, right_name, node_ptr)?;

        let map = self.add(TypeKind::Map, block);
        self.get_mut(map).base = Some(node);
        Ok(map)
    }

    fn find_primitive(&self, kind: TypeKind) -> TypeId {
        // Primitives are registered first, once, at arena creation.
        for (i, ty) in self.items.iter().enumerate() {
            if ty.kind == kind && ty.block == 0 {
                return TypeId::new(i);
            }
        }
        unreachable!("primitive type not registered")
    }

    /// Builds a function type from a signature.
    pub fn fn_type(&mut self, sig: Signature, block: usize) -> TypeId {
        let id = self.add(TypeKind::Fn, block);
        self.get_mut(id).sig = Some(sig);
        id
    }

    /// Wraps a raw `fn` type into the closure type that function values
    /// have at the language level: `{#entry, #upvalue}`, 24 bytes.
    pub fn closure_of(&mut self, fn_type: TypeId, any: TypeId, block: usize, interner: &mut Interner) -> TypeId {
        let id = self.add(TypeKind::Closure, block);
        let entry_name = interner.intern("#entry");
        let upvalue_name = interner.intern("#upvalue");
        self.add_field(id, entry_name, fn_type).expect("fresh closure type");
        self.add_field(id, upvalue_name, any).expect("fresh closure type");
        id
    }

    /// The raw `fn` type behind a closure type.
    pub fn closure_fn(&self, closure: TypeId) -> TypeId {
        self.get(closure).fields[0].type_id
    }

    pub fn closure_sig(&self, closure: TypeId) -> &Signature {
        self.get(self.closure_fn(closure)).sig.as_ref().expect("closure entry is a fn")
    }

    /// Adds the `#self`/`#selftype` header fields every interface carries.
    pub fn add_interface_header_fields(&mut self, iface: TypeId, ptr_void: TypeId) {
        let ty = self.get_mut(iface);
        ty.fields.push(Field {
            name: Symbol::EMPTY,
            type_id: ptr_void,
            offset: 0,
        });
        ty.fields.push(Field {
            name: Symbol::EMPTY,
            type_id: ptr_void,
            offset: 8,
        });
        ty.num_items = 2;
        ty.size = 16;
    }

    /// Appends a field to a struct or interface; its offset is the type's
    /// size before the field was added.
    pub fn add_field(&mut self, target: TypeId, name: Symbol, field_type: TypeId) -> Result<(), String> {
        if self.get(target).fields.iter().any(|f| f.name == name && name != Symbol::EMPTY) {
            return Err("Duplicate field".to_string());
        }
        let field_size = self.size(field_type)?;
        let ty = self.get_mut(target);
        let offset = ty.size;
        ty.fields.push(Field {
            name,
            type_id: field_type,
            offset,
        });
        ty.num_items = ty.fields.len() as i64;
        ty.size += field_size;
        Ok(())
    }

    pub fn find_field(&self, target: TypeId, name: Symbol) -> Option<&Field> {
        self.get(target).fields.iter().find(|f| f.name == name)
    }

    /// Byte size of a type. Forward types have no size until resolved.
    pub fn size(&self, id: TypeId) -> Result<i64, String> {
        let ty = self.get(id);
        Ok(match ty.kind {
            TypeKind::Void => 0,
            TypeKind::Int8 | TypeKind::UInt8 | TypeKind::Bool | TypeKind::Char => 1,
            TypeKind::Int16 | TypeKind::UInt16 => 2,
            TypeKind::Int32 | TypeKind::UInt32 | TypeKind::Real32 => 4,
            TypeKind::Int | TypeKind::UInt | TypeKind::Real => 8,
            TypeKind::Null | TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Str | TypeKind::Fiber | TypeKind::Fn => 8,
            TypeKind::Array => ty.num_items * self.size(ty.base.expect("array base"))?,
            TypeKind::DynArray => 24,
            TypeKind::Map => 16,
            TypeKind::Struct | TypeKind::Interface | TypeKind::Closure => ty.size,
            TypeKind::Forward => return Err("Illegal use of forward declared type".to_string()),
            TypeKind::None => return Err("Illegal type".to_string()),
        })
    }

    /// Slot count of a type when passed as a parameter (slot-aligned).
    pub fn param_slots(&self, id: TypeId) -> Result<i64, String> {
        Ok((self.size(id)? + 7) / 8)
    }

    /// Structural equivalence.
    pub fn equivalent(&self, left: TypeId, right: TypeId) -> bool {
        let mut visited = Vec::new();
        self.equivalent_inner(left, right, &mut visited)
    }

    fn equivalent_inner(&self, left: TypeId, right: TypeId, visited: &mut Vec<(TypeId, TypeId)>) -> bool {
        if left == right {
            return true;
        }
        let lt = self.get(left);
        let rt = self.get(right);
        if lt.kind != rt.kind {
            return false;
        }
        match lt.kind {
            TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::DynArray => {
                self.equivalent_inner(self.base(left), self.base(right), visited)
            }
            TypeKind::Array => {
                lt.num_items == rt.num_items && self.equivalent_inner(self.base(left), self.base(right), visited)
            }
            TypeKind::Map => self.equivalent_inner(self.base(left), self.base(right), visited),
            TypeKind::Struct | TypeKind::Interface | TypeKind::Closure => {
                // Mutually recursive structures terminate via the pair list.
                if visited.iter().any(|&(l, r)| l == left && r == right) {
                    return true;
                }
                visited.push((left, right));
                if lt.fields.len() != rt.fields.len() {
                    return false;
                }
                lt.fields.iter().zip(rt.fields.iter()).all(|(lf, rf)| {
                    lf.name == rf.name && self.equivalent_inner(lf.type_id, rf.type_id, visited)
                })
            }
            TypeKind::Fn => {
                let ls = lt.sig.as_ref().expect("fn type has signature");
                let rs = rt.sig.as_ref().expect("fn type has signature");
                ls.is_method == rs.is_method
                    && ls.params.len() == rs.params.len()
                    && ls
                        .params
                        .iter()
                        .zip(rs.params.iter())
                        .all(|(lp, rp)| self.equivalent_inner(lp.type_id, rp.type_id, visited))
                    && self.equivalent_inner(ls.result, rs.result, visited)
            }
            _ => true,
        }
    }

    /// Compatibility: equivalence plus the allowed widenings.
    pub fn compatible(&self, left: TypeId, right: TypeId, symmetric: bool) -> bool {
        if self.equivalent(left, right) {
            return true;
        }
        let lk = self.kind(left);
        let rk = self.kind(right);

        if lk.is_integer() && rk.is_integer() {
            return true;
        }
        if lk.is_real() && rk.is_real() {
            return true;
        }

        // null assigns to anything pointer-shaped
        if rk == TypeKind::Ptr && self.kind(self.base(right)) == TypeKind::Null {
            return matches!(
                lk,
                TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Str | TypeKind::Fiber | TypeKind::Closure | TypeKind::Fn
            );
        }

        match (lk, rk) {
            // Any pointer assigns to an untyped pointer
            (TypeKind::Ptr, TypeKind::Ptr) => {
                self.kind(self.base(left)) == TypeKind::Void
                    || (symmetric && self.kind(self.base(right)) == TypeKind::Void)
            }
            // String pointers interconvert with untyped pointers
            (TypeKind::Ptr, TypeKind::Str) => self.kind(self.base(left)) == TypeKind::Void,
            (TypeKind::Str, TypeKind::Ptr) => self.kind(self.base(right)) == TypeKind::Void,
            // Weakening and strengthening
            (TypeKind::WeakPtr, TypeKind::Ptr) | (TypeKind::Ptr, TypeKind::WeakPtr) => {
                self.equivalent(self.base(left), self.base(right))
            }
            _ => false,
        }
    }

    /// Explicit cast rule for pointer pairs.
    pub fn castable_ptrs(&self, left: TypeId, right: TypeId) -> bool {
        if self.kind(left) != TypeKind::Ptr || self.kind(right) != TypeKind::Ptr {
            return false;
        }
        let lbase = self.base(left);
        let rbase = self.base(right);
        if self.kind(lbase) == TypeKind::Void {
            return true;
        }
        let (Ok(lsize), Ok(rsize)) = (self.size(lbase), self.size(rbase)) else {
            return false;
        };
        lsize <= rsize
            && !self.kind(lbase).is_garbage_collected()
            && !self.kind(rbase).is_garbage_collected()
    }

    /// Receiver compatibility is nominal: a method declared on `^T` is only
    /// found through a receiver of exactly that named type.
    pub fn compatible_rcv(&self, left: TypeId, right: TypeId) -> bool {
        if self.kind(left) != TypeKind::Ptr || self.kind(right) != TypeKind::Ptr {
            return false;
        }
        let lb = self.get(self.base(left));
        let rb = self.get(self.base(right));
        lb.ident.is_some() && lb.ident == rb.ident
    }

    /// Which operators a type admits.
    pub fn valid_operator(&self, id: TypeId, op: Tok) -> bool {
        let kind = self.kind(id);
        match op {
            Tok::Plus => kind.is_integer() || kind.is_real() || kind == TypeKind::Str,
            Tok::Minus | Tok::Mul | Tok::Div => kind.is_integer() || kind.is_real(),
            Tok::Mod | Tok::And | Tok::Or | Tok::Xor | Tok::Shl | Tok::Shr => kind.is_integer(),
            Tok::PlusPlus | Tok::MinusMinus => kind.is_integer(),
            Tok::EqEq | Tok::NotEq => {
                kind.is_ordinal()
                    || kind.is_real()
                    || matches!(
                        kind,
                        TypeKind::Ptr
                            | TypeKind::WeakPtr
                            | TypeKind::Str
                            | TypeKind::Array
                            | TypeKind::DynArray
                            | TypeKind::Struct
                            | TypeKind::Fn
                            | TypeKind::Fiber
                    )
            }
            Tok::Less | Tok::LessEq | Tok::Greater | Tok::GreaterEq => {
                kind.is_integer()
                    || kind.is_real()
                    || matches!(kind, TypeKind::Char | TypeKind::Str | TypeKind::Array | TypeKind::DynArray | TypeKind::Struct)
            }
            Tok::Not | Tok::AndAnd | Tok::OrOr => kind == TypeKind::Bool,
            _ => false,
        }
    }

    /// Registers and later resolves forward declarations. Returns the list
    /// of unresolved names if any remain.
    pub fn unresolved_forwards(&self) -> Vec<TypeId> {
        self.forwards
            .iter()
            .copied()
            .filter(|&id| self.kind(id) == TypeKind::Forward)
            .collect()
    }

    /// Replaces a forward type in place with the resolved type's content.
    pub fn resolve_forward(&mut self, forward: TypeId, resolved: TypeId) {
        let mut content = self.get(resolved).clone();
        content.forward_name = None;
        self.items[forward.index()] = content;
    }

    /// Key type of `map[K]V`.
    pub fn map_key(&self, map: TypeId) -> TypeId {
        let node = self.base(map);
        self.base(self.get(node).fields[1].type_id)
    }

    /// Item type of `map[K]V`.
    pub fn map_item(&self, map: TypeId) -> TypeId {
        let node = self.base(map);
        self.base(self.get(node).fields[2].type_id)
    }

    /// Pointer-to-node type of a map.
    pub fn map_node_ptr(&self, map: TypeId) -> TypeId {
        let node = self.base(map);
        self.get(node).fields[3].type_id
    }

    /// Human-readable type name for diagnostics.
    pub fn spelling(&self, id: TypeId, interner: &Interner) -> String {
        let ty = self.get(id);
        if let Some((_, name)) = ty.forward_name {
            return interner.resolve(name).to_string();
        }
        match ty.kind {
            TypeKind::Ptr => format!("^{}", self.spelling(self.base(id), interner)),
            TypeKind::WeakPtr => format!("weak ^{}", self.spelling(self.base(id), interner)),
            TypeKind::Array => format!("[{}]{}", ty.num_items, self.spelling(self.base(id), interner)),
            TypeKind::DynArray => format!("[]{}", self.spelling(self.base(id), interner)),
            TypeKind::Map => format!(
                "map[{}]{}",
                self.spelling(self.map_key(id), interner),
                self.spelling(self.map_item(id), interner)
            ),
            TypeKind::Struct => "struct".to_string(),
            TypeKind::Interface => {
                if ty.fields.len() == 2 {
                    "any".to_string()
                } else {
                    "interface".to_string()
                }
            }
            TypeKind::Closure => {
                let sig = self.closure_sig(id);
                let params: Vec<String> = sig
                    .params
                    .iter()
                    .skip(if sig.is_method { 2 } else { 1 })
                    .map(|p| self.spelling(p.type_id, interner))
                    .collect();
                let result = if self.kind(sig.result) == TypeKind::Void {
                    String::new()
                } else {
                    format!(": {}", self.spelling(sig.result, interner))
                };
                format!("fn ({}){}", params.join(", "), result)
            }
            kind => kind.spelling().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Types, PrimTypes, Interner) {
        let (types, prims) = Types::new();
        (types, prims, Interner::new())
    }

    #[test]
    fn test_primitive_sizes() {
        let (types, prims, _) = setup();
        assert_eq!(types.size(prims.bool_).unwrap(), 1);
        assert_eq!(types.size(prims.char_).unwrap(), 1);
        assert_eq!(types.size(prims.int16).unwrap(), 2);
        assert_eq!(types.size(prims.real32).unwrap(), 4);
        assert_eq!(types.size(prims.int_).unwrap(), 8);
        assert_eq!(types.size(prims.ptr_void).unwrap(), 8);
        assert_eq!(types.size(prims.any).unwrap(), 16);
    }

    #[test]
    fn test_struct_layout_is_packed() {
        let (mut types, prims, mut interner) = setup();
        let s = types.add(TypeKind::Struct, 0);
        let a = interner.intern("a");
        let b = interner.intern("b");
        let c = interner.intern("c");
        types.add_field(s, a, prims.int8).unwrap();
        types.add_field(s, b, prims.int_).unwrap();
        types.add_field(s, c, prims.bool_).unwrap();

        let fields = &types.get(s).fields;
        assert_eq!(fields[0].offset, 0);
        assert_eq!(fields[1].offset, 1);
        assert_eq!(fields[2].offset, 9);
        assert_eq!(types.size(s).unwrap(), 10);
    }

    #[test]
    fn test_duplicate_field() {
        let (mut types, prims, mut interner) = setup();
        let s = types.add(TypeKind::Struct, 0);
        let x = interner.intern("x");
        types.add_field(s, x, prims.int_).unwrap();
        assert!(types.add_field(s, x, prims.int_).is_err());
    }

    #[test]
    fn test_equivalence_structural() {
        let (mut types, prims, mut interner) = setup();
        let x = interner.intern("x");

        let s1 = types.add(TypeKind::Struct, 0);
        types.add_field(s1, x, prims.int_).unwrap();
        let s2 = types.add(TypeKind::Struct, 0);
        types.add_field(s2, x, prims.int_).unwrap();

        assert!(types.equivalent(s1, s2));

        let p1 = types.ptr_to(s1, 0);
        let p2 = types.ptr_to(s2, 0);
        assert!(types.equivalent(p1, p2));
    }

    #[test]
    fn test_equivalence_recursive_terminates() {
        let (mut types, prims, mut interner) = setup();
        let next = interner.intern("next");
        let val = interner.intern("val");

        // Two separately built self-referential list nodes.
        let build = |types: &mut Types| {
            let node = types.add(TypeKind::Struct, 0);
            let node_ptr = types.ptr_to(node, 0);
            types.add_field(node, val, prims.int_).unwrap();
            types.add_field(node, next, node_ptr).unwrap();
            node
        };
        let n1 = build(&mut types);
        let n2 = build(&mut types);

        assert!(types.equivalent(n1, n2));
        // Reflexive and symmetric
        assert!(types.equivalent(n1, n1));
        assert!(types.equivalent(n2, n1));
    }

    #[test]
    fn test_compatibility_widening() {
        let (mut types, prims, _) = setup();
        assert!(types.compatible(prims.int_, prims.int8, false));
        assert!(types.compatible(prims.real, prims.real32, false));
        assert!(!types.compatible(prims.int_, prims.real, false));

        // any pointer -> ^void, but not the reverse without symmetry
        let s = types.add(TypeKind::Struct, 0);
        let ptr_s = types.ptr_to(s, 0);
        assert!(types.compatible(prims.ptr_void, ptr_s, false));
        assert!(!types.compatible(ptr_s, prims.ptr_void, false));
        assert!(types.compatible(ptr_s, prims.ptr_void, true));

        // null -> any pointer
        assert!(types.compatible(ptr_s, prims.ptr_null, false));
        assert!(types.compatible(prims.str_, prims.ptr_null, false));
    }

    #[test]
    fn test_castable_ptrs() {
        let (mut types, prims, _) = setup();
        let ptr_i32 = types.ptr_to(prims.int32, 0);
        let ptr_i64 = types.ptr_to(prims.int_, 0);
        let ptr_str = types.ptr_to(prims.str_, 0);

        assert!(types.castable_ptrs(prims.ptr_void, ptr_i64));
        assert!(types.castable_ptrs(ptr_i32, ptr_i64));
        assert!(!types.castable_ptrs(ptr_i64, ptr_i32));
        assert!(!types.castable_ptrs(ptr_str, ptr_i64));
    }

    #[test]
    fn test_map_types() {
        let (mut types, prims, mut interner) = setup();
        let map = types.map_of(prims.str_, prims.int_, 0, &mut interner).unwrap();
        assert_eq!(types.kind(map), TypeKind::Map);
        assert_eq!(types.map_key(map), prims.str_);
        assert_eq!(types.map_item(map), prims.int_);
        assert_eq!(types.size(map).unwrap(), 16);
        // node: len + 4 pointers, packed
        let node = types.base(map);
        assert_eq!(types.size(node).unwrap(), 40);
    }

    #[test]
    fn test_map_key_restriction() {
        let (mut types, prims, mut interner) = setup();
        let arr = types.dyn_array_of(prims.int_, 0);
        assert!(types.map_of(arr, prims.int_, 0, &mut interner).is_err());
    }

    #[test]
    fn test_overflow_check() {
        use crate::consts::Const;
        assert!(TypeKind::Int8.overflows(&Const::Int(128)));
        assert!(!TypeKind::Int8.overflows(&Const::Int(127)));
        assert!(TypeKind::UInt16.overflows(&Const::Int(-1)));
        assert!(TypeKind::Char.overflows(&Const::Int(256)));
        assert!(!TypeKind::Int.overflows(&Const::Int(i64::MAX)));
    }

    #[test]
    fn test_forward_resolution() {
        let (mut types, prims, mut interner) = setup();
        let name = interner.intern("Node");
        let fwd = types.add_forward(0, 0, name);
        assert_eq!(types.unresolved_forwards().len(), 1);

        let resolved = types.add(TypeKind::Struct, 0);
        let x = interner.intern("x");
        types.add_field(resolved, x, prims.int_).unwrap();
        types.resolve_forward(fwd, resolved);

        assert!(types.unresolved_forwards().is_empty());
        assert!(types.equivalent(fwd, resolved));
    }

    #[test]
    fn test_spelling() {
        let (mut types, prims, mut interner) = setup();
        let ptr_int = types.ptr_to(prims.int_, 0);
        assert_eq!(types.spelling(ptr_int, &interner), "^int");
        let arr = types.array_of(prims.char_, 3, 0);
        assert_eq!(types.spelling(arr, &interner), "[3]char");
        let dyn_arr = types.dyn_array_of(prims.int_, 0);
        assert_eq!(types.spelling(dyn_arr, &interner), "[]int");
        let map = types.map_of(prims.str_, prims.int_, 0, &mut interner).unwrap();
        assert_eq!(types.spelling(map, &interner), "map[str]int");
    }
}
