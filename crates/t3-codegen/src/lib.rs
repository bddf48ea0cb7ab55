//! T3 code generator: parses nothing itself, but turns an already-parsed
//! [`ast::Module`] into a verified, image-ready [`t3_bytecode::Module`].
//!
//! The pipeline is linear: [`codegen::CodeGenerator`] walks the AST and
//! produces bytecode plus a [`diagnostics::DiagnosticSink`] of everything
//! non-fatal it noticed along the way; [`Compiler::compile`] then hands the
//! result to `t3_bytecode::verify_module` before it's considered usable.
//! Accumulated diagnostics are the caller's to inspect and render (through
//! `diagnostics::DiagnosticSink::emit`) regardless of whether verification
//! passed -- a clean verify with outstanding warnings is a normal outcome.

pub mod ast;
pub mod codegen;
pub mod diagnostics;
pub mod error;
pub mod jump_thread;
pub mod module_builder;
pub mod opstack;
pub mod peephole;

pub use codegen::CodeGenerator;
pub use diagnostics::{DiagKind, Diagnostic, DiagnosticSink, Severity};
pub use error::{CompileError, CompileResult};
pub use module_builder::{FunctionBuilder, ModuleBuilder};

/// A fully generated, verified module together with the diagnostics raised
/// while building it.
pub struct CompiledModule {
    pub module: t3_bytecode::Module,
    pub diagnostics: DiagnosticSink,
}

/// Drives [`codegen::CodeGenerator`] over a parsed module and verifies the
/// result.
///
/// This holds no state of its own between calls -- each `compile` call gets
/// a fresh [`codegen::CodeGenerator`] -- so one `Compiler` can compile any
/// number of independent modules.
#[derive(Default)]
pub struct Compiler;

impl Compiler {
    pub fn new() -> Self {
        Compiler
    }

    /// Generate bytecode for `ast_module` and verify it. Returns the
    /// [`t3_bytecode::Module`] and its diagnostics even when verification
    /// fails, so the caller can decide whether accumulated warnings plus a
    /// verifier error are worth reporting together.
    pub fn compile(&mut self, ast_module: &ast::Module) -> CompileResult<CompiledModule> {
        let (module, diagnostics) = CodeGenerator::new().generate(ast_module);
        t3_bytecode::verify_module(&module)?;
        Ok(CompiledModule { module, diagnostics })
    }
}
