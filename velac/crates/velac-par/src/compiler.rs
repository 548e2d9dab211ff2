//! The compiler instance: one source program in, one bytecode program out.

use std::rc::Rc;

use velac_gen::{CodeGen, ParamLayout, Program};
use velac_lex::{Lexer, Tok};
use velac_sem::{
    ident, BuiltinFn, Blocks, Const, Idents, Modules, PrimTypes, Signature, TypeKind, Types,
};
use velac_sem::types::Param;
use velac_util::{CompileError, CompileResult, DebugInfo, Interner, Symbol, TypeId, Warning, WarningHandler};

/// Resolves an import path to module source text.
pub type SourceLoader = Box<dyn Fn(&str) -> Option<String>>;

pub struct CompilerConfig {
    pub file_name: String,
    pub source: String,
    /// Host function names resolvable by `fn ... ;` prototypes.
    pub extern_names: Vec<String>,
    /// In-memory modules registered ahead of compilation.
    pub modules: Vec<(String, String)>,
    pub loader: Option<SourceLoader>,
    pub warning_handler: Option<WarningHandler>,
}

/// Capture context of a function literal being compiled.
#[derive(Clone, Copy)]
pub struct CaptureCtx {
    /// The hidden captured-variable struct.
    pub struct_type: TypeId,
    /// Byte offset of the hidden upvalue parameter in the literal's frame.
    pub upvalue_offset: i64,
}

pub struct Compiler {
    pub lex: Lexer,
    pub interner: Interner,
    pub types: Types,
    pub prims: PrimTypes,
    pub idents: Idents,
    pub blocks: Blocks,
    pub modules: Modules,
    pub gen: CodeGen,
    pub(crate) init_entries: Vec<usize>,
    pub(crate) main_entry: Option<usize>,
    pub(crate) extern_names: Vec<String>,
    pub(crate) captures: Vec<CaptureCtx>,
    loader: Option<SourceLoader>,
    warning_handler: Option<WarningHandler>,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        let (types, prims) = Types::new();
        let file_name: Rc<str> = Rc::from(config.file_name.as_str());
        let lex = Lexer::new(Rc::clone(&file_name), Rc::from(config.source.as_str()));
        let gen = CodeGen::new(DebugInfo::new(file_name));

        let mut modules = Modules::new();
        for (path, source) in &config.modules {
            modules.add_source(path, source);
        }

        let mut compiler = Self {
            lex,
            interner: Interner::new(),
            types,
            prims,
            idents: Idents::new(),
            blocks: Blocks::new(),
            modules,
            gen,
            init_entries: Vec::new(),
            main_entry: None,
            extern_names: config.extern_names,
            captures: Vec::new(),
            loader: config.loader,
            warning_handler: config.warning_handler,
        };
        compiler.declare_builtins();
        compiler
    }

    /// Compiles the whole program, `main` module last.
    pub fn compile(mut self) -> CompileResult<Program> {
        let path = self.lex.file_name.to_string();
        let module = self.modules.add(&path).map_err(|msg| self.error(msg))?;
        self.blocks.module = module;

        self.lex.next(&mut self.interner)?;
        self.parse_module()?;

        // The program entry is `fn main()` of the main module.
        let main_sym = self.interner.intern("main");
        let main = self
            .idents
            .find(&self.modules, &self.blocks, module, main_sym, None, &self.types, true)
            .ok_or_else(|| self.error("Function main() is not defined"))?;
        let main_ident = self.idents.get(main);
        let fn_type = self.types.get(main_ident.type_id);
        let entry = match (&main_ident.kind, fn_type.sig.as_ref()) {
            (velac_sem::IdentKind::Const(Const::Int(entry)), Some(sig))
                if fn_type.kind == TypeKind::Fn
                    && sig.params.len() == 1
                    && self.types.kind(sig.result) == TypeKind::Void
                    && *entry > 0 =>
            {
                *entry as usize
            }
            _ => return Err(self.error("Function main() is not defined")),
        };
        self.main_entry = Some(entry);

        // Functions of the main module become callable through the API.
        let mut exported_fns = Vec::new();
        for i in 0..self.idents.len() {
            let entry_ident = self.idents.get(i);
            if entry_ident.module != module || entry_ident.is_method {
                continue;
            }
            let (velac_sem::IdentKind::Const(Const::Int(fn_entry)), TypeKind::Fn) =
                (&entry_ident.kind, self.types.kind(entry_ident.type_id))
            else {
                continue;
            };
            if *fn_entry <= 0 {
                continue;
            }
            let sig = self.types.get(entry_ident.type_id).sig.as_ref().expect("fn has a signature");
            let mut param_slots = 0i64;
            for param in &sig.params {
                param_slots += self.types.param_slots(param.type_id).map_err(|msg| self.error(msg))?;
            }
            exported_fns.push(velac_gen::ExportedFn {
                name: self.interner.resolve(entry_ident.name).to_string(),
                entry: *fn_entry as usize,
                param_slots: param_slots as usize,
                has_result: self.types.kind(sig.result) != TypeKind::Void,
            });
        }

        Ok(Program {
            code: self.gen.code,
            debug: self.gen.debug,
            layouts: self.gen.layouts,
            data: self.gen.data.into_bytes(),
            types: self.types,
            any_type: self.prims.any,
            fiber_type: self.prims.fiber_,
            str_type: self.prims.str_,
            init_entries: self.init_entries,
            main_entry: self.main_entry,
            extern_names: self.extern_names,
            exported_fns,
        })
    }

    fn declare_builtins(&mut self) {
        // Pre-declared type names
        let type_names: [(&str, TypeId); 13] = [
            ("void", self.prims.void_),
            ("int8", self.prims.int8),
            ("int16", self.prims.int16),
            ("int32", self.prims.int32),
            ("int", self.prims.int_),
            ("uint8", self.prims.uint8),
            ("uint16", self.prims.uint16),
            ("uint32", self.prims.uint32),
            ("uint", self.prims.uint_),
            ("bool", self.prims.bool_),
            ("char", self.prims.char_),
            ("real32", self.prims.real32),
            ("real", self.prims.real),
        ];
        for (name, type_id) in type_names {
            let sym = self.interner.intern(name);
            self.idents
                .add_type(sym, type_id, 0, 0, true, 0)
                .expect("builtin types are unique");
        }
        let any = self.interner.intern("any");
        self.idents.add_type(any, self.prims.any, 0, 0, true, 0).expect("any is unique");
        let fiber = self.interner.intern("fiber");
        self.idents
            .add_type(fiber, self.prims.fiber_, 0, 0, true, 0)
            .expect("fiber is unique");

        // Constants
        let t = self.interner.intern("true");
        self.idents
            .add_const(t, self.prims.bool_, 0, 0, true, Const::Int(1), 0)
            .expect("true is unique");
        let f = self.interner.intern("false");
        self.idents
            .add_const(f, self.prims.bool_, 0, 0, true, Const::Int(0), 0)
            .expect("false is unique");
        let null = self.interner.intern("null");
        self.idents
            .add_const(null, self.prims.ptr_null, 0, 0, true, Const::Ptr(velac_util::Ptr::NULL), 0)
            .expect("null is unique");

        // Built-in functions
        let builtins: [(&str, BuiltinFn, TypeId); 36] = [
            ("printf", BuiltinFn::Printf, self.prims.int_),
            ("fprintf", BuiltinFn::Fprintf, self.prims.int_),
            ("sprintf", BuiltinFn::Sprintf, self.prims.str_),
            ("scanf", BuiltinFn::Scanf, self.prims.int_),
            ("fscanf", BuiltinFn::Fscanf, self.prims.int_),
            ("sscanf", BuiltinFn::Sscanf, self.prims.int_),
            ("real", BuiltinFn::Real, self.prims.real),
            ("round", BuiltinFn::Round, self.prims.int_),
            ("trunc", BuiltinFn::Trunc, self.prims.int_),
            ("ceil", BuiltinFn::Ceil, self.prims.int_),
            ("floor", BuiltinFn::Floor, self.prims.int_),
            ("abs", BuiltinFn::Abs, self.prims.int_),
            ("fabs", BuiltinFn::Fabs, self.prims.real),
            ("sqrt", BuiltinFn::Sqrt, self.prims.real),
            ("sin", BuiltinFn::Sin, self.prims.real),
            ("cos", BuiltinFn::Cos, self.prims.real),
            ("atan", BuiltinFn::Atan, self.prims.real),
            ("atan2", BuiltinFn::Atan2, self.prims.real),
            ("exp", BuiltinFn::Exp, self.prims.real),
            ("log", BuiltinFn::Log, self.prims.real),
            ("new", BuiltinFn::New, self.prims.ptr_void),
            ("make", BuiltinFn::Make, self.prims.void_),
            ("copy", BuiltinFn::Copy, self.prims.void_),
            ("append", BuiltinFn::Append, self.prims.void_),
            ("insert", BuiltinFn::Insert, self.prims.void_),
            ("delete", BuiltinFn::Delete, self.prims.void_),
            ("slice", BuiltinFn::Slice, self.prims.void_),
            ("sort", BuiltinFn::Sort, self.prims.void_),
            ("sortfast", BuiltinFn::Sortfast, self.prims.void_),
            ("len", BuiltinFn::Len, self.prims.int_),
            ("cap", BuiltinFn::Cap, self.prims.int_),
            ("sizeof", BuiltinFn::Sizeof, self.prims.int_),
            ("valid", BuiltinFn::Valid, self.prims.bool_),
            ("validkey", BuiltinFn::Validkey, self.prims.bool_),
            ("keys", BuiltinFn::Keys, self.prims.void_),
            ("resume", BuiltinFn::Resume, self.prims.void_),
        ];
        for (name, builtin, type_id) in builtins {
            let sym = self.interner.intern(name);
            self.idents.add_builtin(sym, type_id, builtin);
        }
        let memusage = self.interner.intern("memusage");
        self.idents.add_builtin(memusage, self.prims.int_, BuiltinFn::Memusage);
        let exit = self.interner.intern("exit");
        self.idents.add_builtin(exit, self.prims.void_, BuiltinFn::Exit);
    }

    // --- Shared helpers

    /// Compile error at the current token.
    pub fn error(&self, msg: impl Into<String>) -> CompileError {
        self.lex.error(msg)
    }

    pub fn next(&mut self) -> CompileResult<()> {
        self.lex.next(&mut self.interner)
    }

    pub fn eat(&mut self, kind: Tok) -> CompileResult<()> {
        self.lex.eat(kind, &mut self.interner)
    }

    pub fn check(&self, kind: Tok) -> bool {
        self.lex.check(kind)
    }

    /// Requires and consumes an identifier, returning its symbol.
    pub fn eat_ident(&mut self) -> CompileResult<Symbol> {
        if self.lex.tok.kind != Tok::Ident {
            return Err(self.error(format!(
                "Unexpected {}, expected identifier",
                self.lex.tok.kind.spelling()
            )));
        }
        let name = self.lex.tok.name;
        self.next()?;
        Ok(name)
    }

    /// Snapshot the lexer's debug record into the generator.
    pub fn sync_debug(&mut self) {
        self.gen.set_debug(&self.lex.debug);
    }

    pub fn type_size(&self, type_id: TypeId) -> CompileResult<i64> {
        self.types.size(type_id).map_err(|msg| self.error(msg))
    }

    pub fn type_kind(&self, type_id: TypeId) -> TypeKind {
        self.types.kind(type_id)
    }

    pub fn spelling(&self, type_id: TypeId) -> String {
        self.types.spelling(type_id, &self.interner)
    }

    /// Asserts assignment compatibility, as `typeAssertCompatible` does.
    pub fn assert_compatible(&self, left: TypeId, right: TypeId) -> CompileResult<()> {
        if !self.types.compatible(left, right, false) {
            return Err(self.error(format!(
                "Incompatible types {} and {}",
                self.spelling(left),
                self.spelling(right)
            )));
        }
        Ok(())
    }

    pub fn assert_valid_operator(&self, type_id: TypeId, op: Tok) -> CompileResult<()> {
        if !self.types.valid_operator(type_id, op) {
            return Err(self.error(format!(
                "Operator {} is not applicable to {}",
                op.spelling(),
                self.spelling(type_id)
            )));
        }
        Ok(())
    }

    /// Emits a warning through the caller-supplied callback.
    pub fn warn(&mut self, msg: String, line: u32) {
        if let Some(handler) = &self.warning_handler {
            let warning = Warning {
                file_name: self.lex.file_name.to_string(),
                fn_name: self.lex.debug.fn_name.to_string(),
                line,
                pos: 1,
                msg,
            };
            (&mut *handler.borrow_mut())(&warning);
        }
    }

    /// Releases the references held by a finished block's identifiers and
    /// warns about the unused ones.
    pub fn leave_block_scope(&mut self, block: usize) {
        let removed = self.idents.free_block(block);
        for removed_ident in &removed {
            if let velac_sem::IdentKind::LocalVar { offset } = removed_ident.kind {
                if self.type_kind(removed_ident.type_id).is_garbage_collected() {
                    self.gen
                        .change_ref_cnt_local(Tok::MinusMinus, offset, removed_ident.type_id);
                }
            }
        }
        for removed_ident in removed {
            if ident::warn_if_unused(&removed_ident) {
                let name = self.interner.resolve(removed_ident.name).to_string();
                self.warn(
                    format!("{name} is declared but never used"),
                    removed_ident.line,
                );
            }
        }
    }

    /// Releases locals of every block between the current one and `target`
    /// (exclusive), for `break`/`continue`/`return` paths.
    pub fn release_down_to_block(&mut self, target: usize) {
        let blocks: Vec<usize> = self.blocks.stack().take_while(|&b| b != target).collect();
        for block in blocks {
            for i in 0..self.idents.len() {
                let entry = self.idents.get(i);
                if entry.block != block {
                    continue;
                }
                if let velac_sem::IdentKind::LocalVar { offset } = entry.kind {
                    let type_id = entry.type_id;
                    if self.type_kind(type_id).is_garbage_collected() {
                        self.gen.change_ref_cnt_local(Tok::MinusMinus, offset, type_id);
                    }
                }
            }
        }
    }

    /// The frame layout of a signature plus the enclosing block's locals.
    pub fn make_layout(&self, sig: &Signature, local_var_size: i64) -> CompileResult<ParamLayout> {
        let mut param_slots = Vec::with_capacity(sig.params.len());
        let mut total = 0;
        for param in &sig.params {
            let slots = self.types.param_slots(param.type_id).map_err(|msg| self.error(msg))?;
            param_slots.push(slots);
            total += slots;
        }
        Ok(ParamLayout {
            param_slots,
            num_param_slots: total,
            has_result_ptr: self.type_kind(sig.result).is_structured(),
            local_var_slots: (local_var_size + 7) / 8,
        })
    }

    /// Total parameter slots of a signature.
    pub fn param_slots_total(&self, sig: &Signature) -> CompileResult<i64> {
        let mut total = 0;
        for param in &sig.params {
            total += self.types.param_slots(param.type_id).map_err(|msg| self.error(msg))?;
        }
        Ok(total)
    }

    /// Builds the hidden upvalue parameter every signature starts with.
    pub fn hidden_upvalue_param(&mut self) -> Param {
        Param {
            name: self.interner.intern("#upvalue"),
            type_id: self.prims.any,
            default_val: None,
        }
    }

    /// Allocates a compiler temporary in the current function frame.
    pub fn alloc_temp(&mut self, type_id: TypeId) -> CompileResult<usize> {
        self.idents
            .alloc_temp_var(&self.types, &mut self.blocks, &mut self.interner, type_id)
            .map_err(|msg| self.error(msg))
    }

    /// Byte offset of a local ident.
    pub fn local_offset(&self, ident_index: usize) -> i64 {
        match self.idents.get(ident_index).kind {
            velac_sem::IdentKind::LocalVar { offset } => offset,
            _ => unreachable!("not a local variable"),
        }
    }

    /// Loads a module source: the in-memory registry first, then the host
    /// loader.
    pub fn load_module_source(&self, path: &str) -> Option<String> {
        if let Some(source) = self.modules.find_source(path) {
            return Some(source.to_string());
        }
        self.loader.as_ref().and_then(|loader| loader(path))
    }
}
