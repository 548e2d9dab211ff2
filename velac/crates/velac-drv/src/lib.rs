//! velac-drv - The embedding API and the `velac` driver.
//!
//! [`Vela`] is the host-facing engine handle: feed it source, register
//! host functions and in-memory modules, compile, then `run` or `call`.
//! Instances are fully independent; nothing is shared between engines.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use velac_par::{Compiler, CompilerConfig, SourceLoader};
use velac_util::{ErrorReport, WarningHandler, ERR_RUNTIME};
use velac_vm::{ExternFn, HookEvent, HookFn, Vm};

pub use velac_gen::Slot;
pub use velac_util::error::Warning;
pub use velac_vm::Vm as VmHandle;

/// Default fiber stack size, in slots.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Engine configuration; the sandbox flags gate filesystem access from
/// scripts and host libraries.
pub struct Config {
    pub file_name: String,
    pub source: String,
    pub stack_size: usize,
    pub args: Vec<String>,
    pub file_system_enabled: bool,
    pub impl_libs_enabled: bool,
    pub warning_handler: Option<WarningHandler>,
    pub loader: Option<SourceLoader>,
}

impl Config {
    pub fn from_source(file_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            source: source.into(),
            stack_size: DEFAULT_STACK_SIZE,
            args: Vec::new(),
            file_system_enabled: true,
            impl_libs_enabled: true,
            warning_handler: None,
            loader: None,
        }
    }
}

/// A callable function resolved from the compiled program.
#[derive(Clone, Copy, Debug)]
pub struct FuncContext {
    pub entry: usize,
    pub param_slots: usize,
    pub has_result: bool,
}

/// One engine instance.
pub struct Vela {
    config: Option<Config>,
    externs: Vec<(String, ExternFn)>,
    modules: Vec<(String, String)>,
    vm: Option<Vm>,
    last_error: Option<ErrorReport>,
}

impl Vela {
    pub fn new(config: Config) -> Self {
        Self {
            config: Some(config),
            externs: Vec::new(),
            modules: Vec::new(),
            vm: None,
            last_error: None,
        }
    }

    /// Registers a host function callable from `fn name(...) ... ;`
    /// prototypes. Must be called before [`Vela::compile`].
    pub fn add_func(&mut self, name: impl Into<String>, func: ExternFn) {
        self.externs.push((name.into(), func));
    }

    /// Injects a named in-memory module (how the standard library is
    /// bundled). Must be called before [`Vela::compile`].
    pub fn add_module(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.modules.push((path.into(), source.into()));
    }

    /// Runs the lexer, parser, and generator; on success the VM is ready.
    pub fn compile(&mut self) -> Result<(), ErrorReport> {
        let config = self.config.take().expect("compile is called once");
        let compiler = Compiler::new(CompilerConfig {
            file_name: config.file_name.clone(),
            source: config.source.clone(),
            extern_names: self.externs.iter().map(|(name, _)| name.clone()).collect(),
            modules: std::mem::take(&mut self.modules),
            loader: config.loader,
            warning_handler: config.warning_handler.clone(),
        });
        let program = match compiler.compile() {
            Ok(program) => program,
            Err(err) => {
                let report: ErrorReport = err.into();
                self.last_error = Some(report.clone());
                return Err(report);
            }
        };
        let mut vm = match Vm::new(program, config.stack_size, config.file_system_enabled) {
            Ok(vm) => vm,
            Err(err) => {
                let report: ErrorReport = err.into();
                self.last_error = Some(report.clone());
                return Err(report);
            }
        };
        for (name, func) in &self.externs {
            vm.bind_extern(name, Rc::clone(func));
        }
        self.vm = Some(vm);
        Ok(())
    }

    fn vm_mut(&mut self) -> &mut Vm {
        self.vm.as_mut().expect("program is compiled")
    }

    pub fn vm(&self) -> Option<&Vm> {
        self.vm.as_ref()
    }

    /// Executes `main`. On error, the report is retained for
    /// [`Vela::error`].
    pub fn run(&mut self) -> Result<(), ErrorReport> {
        match self.vm_mut().run() {
            Ok(()) => Ok(()),
            Err(err) => {
                let report: ErrorReport = err.into();
                self.last_error = Some(report.clone());
                Err(report)
            }
        }
    }

    /// Resolves a function of the main module by name.
    pub fn get_func(&self, name: &str) -> Option<FuncContext> {
        let vm = self.vm.as_ref()?;
        vm.program
            .exported_fns
            .iter()
            .find(|f| f.name == name)
            .map(|f| FuncContext {
                entry: f.entry,
                param_slots: f.param_slots,
                has_result: f.has_result,
            })
    }

    /// Calls a function context with scalar arguments.
    pub fn call(&mut self, ctx: &FuncContext, args: &[Slot]) -> Result<Slot, ErrorReport> {
        match self.vm_mut().call_fn(ctx.entry, args) {
            Ok(result) => Ok(result),
            Err(err) => {
                let report: ErrorReport = err.into();
                self.last_error = Some(report.clone());
                Err(report)
            }
        }
    }

    /// Whether the main fiber is still executable.
    pub fn alive(&self) -> bool {
        self.vm.as_ref().is_some_and(|vm| vm.alive())
    }

    /// Marks the main fiber dead; the dispatch loop returns to the host.
    pub fn kill(&mut self) {
        if let Some(vm) = self.vm.as_mut() {
            vm.kill();
        }
    }

    /// The most recent error.
    pub fn error(&self) -> Option<&ErrorReport> {
        self.last_error.as_ref()
    }

    pub fn set_hook(&mut self, event: HookEvent, hook: Option<HookFn>) {
        self.vm_mut().set_hook(event, hook);
    }

    /// The `-asm` listing.
    pub fn asm(&self) -> Option<String> {
        self.vm.as_ref().map(|vm| vm.program.asm_listing())
    }

    /// Iterates the current call stack as (function name, line) frames.
    pub fn unwind(&self) -> Vec<(String, u32)> {
        let Some(vm) = self.vm.as_ref() else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        let fiber = vm.fiber();
        let mut frame = Some((fiber.base, fiber.ip));
        while let Some((base, ip)) = frame {
            if let Some(debug) = vm.program.debug.get(ip) {
                frames.push((debug.fn_name.to_string(), debug.line));
            }
            frame = vm.unwind(base, ip);
        }
        frames
    }

    // --- Host value helpers

    /// Builds a script string on the heap and returns its handle.
    pub fn make_string(&mut self, text: &str) -> Result<u64, ErrorReport> {
        let vm = self.vm.as_mut().expect("program is compiled");
        velac_vm::objects::make_str(vm, text.as_bytes())
            .map(|ptr| ptr.0)
            .map_err(|err| err.into())
    }

    /// Allocates a zeroed struct of the given type on the heap.
    pub fn make_struct(&mut self, type_id: u32) -> Result<u64, ErrorReport> {
        let vm = self.vm_mut();
        let type_id = velac_util::TypeId(type_id);
        let size = vm.program.types.size(type_id).map_err(runtime_report)?;
        let ip = vm.fiber().ip;
        vm.heap
            .alloc(size, Some(type_id), None, ip)
            .map(|ptr| ptr.0)
            .map_err(|e| runtime_report(e.to_string()))
    }

    /// Builds a dynamic array of `len` zeroed items; the returned handle
    /// points at the 24-byte array value.
    pub fn make_dyn_array(&mut self, type_id: u32, len: i64) -> Result<u64, ErrorReport> {
        let vm = self.vm_mut();
        let type_id = velac_util::TypeId(type_id);
        let ip = vm.fiber().ip;
        let holder = vm
            .heap
            .alloc(24, None, None, ip)
            .map_err(|e| runtime_report(e.to_string()))?;
        velac_vm::objects::alloc_dyn_array(vm, holder, type_id, len)
            .map_err(ErrorReport::from)?;
        Ok(holder.0)
    }

    /// The address of the value stored under `key` in a script map,
    /// creating the entry when missing.
    pub fn get_map_node_data(&mut self, map: u64, key: Slot) -> Result<u64, ErrorReport> {
        let vm = self.vm_mut();
        let map = velac_util::Ptr(map);
        let map_type = velac_vm::objects::slot_to_type(Slot(
            vm.read_u64(map).map_err(ErrorReport::from)?,
        ))
        .ok_or_else(|| runtime_report("Map is null"))?;
        velac_vm::objects::map_item_ptr(vm, map, map_type, key, true)
            .map(|ptr| ptr.0)
            .map_err(|err| err.into())
    }

    /// Increments the reference count of a value of the given type.
    pub fn inc_ref(&mut self, handle: u64, type_id: u32) -> Result<(), ErrorReport> {
        let vm = self.vm_mut();
        vm.change_ref_cnt_typed(Slot(handle), velac_util::TypeId(type_id), 1)
            .map_err(|err| err.into())
    }

    pub fn dec_ref(&mut self, handle: u64, type_id: u32) -> Result<(), ErrorReport> {
        let vm = self.vm_mut();
        vm.change_ref_cnt_typed(Slot(handle), velac_util::TypeId(type_id), -1)
            .map_err(|err| err.into())
    }

    /// Total bytes currently held by the heap.
    pub fn mem_usage(&self) -> i64 {
        self.vm.as_ref().map_or(0, |vm| vm.heap.mem_usage())
    }

    // --- Test plumbing

    /// Redirects the VM's stdout into an in-memory buffer.
    pub fn capture_output(&mut self) -> Rc<RefCell<Vec<u8>>> {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let sink = BufferSink(Rc::clone(&buffer));
        self.vm_mut().set_stream(Some(0), velac_vm::Stream::Writer(Box::new(sink)));
        buffer
    }

    /// Feeds the VM's stdin from a string.
    pub fn feed_input(&mut self, input: &str) {
        let reader = std::io::Cursor::new(input.as_bytes().to_vec());
        self.vm_mut().set_stream(
            Some(2),
            velac_vm::Stream::Reader(Box::new(std::io::BufReader::new(reader))),
        );
    }
}

fn runtime_report(msg: impl Into<String>) -> ErrorReport {
    velac_util::RuntimeError::new(msg).into()
}

struct BufferSink(Rc<RefCell<Vec<u8>>>);

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Maps a runtime error report to the process exit code: custom
/// `exit(code)` values pass through, engine errors exit with 1.
pub fn exit_code_for(report: &ErrorReport) -> i32 {
    if report.code == ERR_RUNTIME {
        1
    } else {
        report.code as i32
    }
}

/// Convenience: compile and run a source string, capturing stdout.
/// Used heavily by the integration tests.
pub fn run_source(source: &str) -> (Result<(), ErrorReport>, String) {
    let mut engine = Vela::new(Config::from_source("main.vl", source));
    if let Err(err) = engine.compile() {
        return (Err(err), String::new());
    }
    let output = engine.capture_output();
    let result = engine.run();
    let text = String::from_utf8_lossy(&output.borrow()).into_owned();
    (result, text)
}

// Keep the value-kind enum and the handle type reachable for host code
// inspecting script values.
pub use velac_sem::TypeKind as ValueKind;
pub use velac_util::Ptr as Handle;
