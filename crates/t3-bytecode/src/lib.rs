//! T3 VM bytecode: opcodes, the anchor/fixup/label forward-reference
//! machinery, the constant interner, the in-memory module format, the
//! block-framed image-file writer, and post-generation verification.
//!
//! This crate owns everything about *representing* compiled output; it has
//! no opinion about how that output gets generated from a source AST --
//! that's `t3-codegen`'s job, built on top of the types exported here.

#![warn(rust_2018_idioms)]

pub mod anchor;
pub mod constants;
pub mod image;
pub mod label;
pub mod module;
pub mod opcode;
pub mod stream;
pub mod verify;

pub use anchor::{
    AnchorError, AnchorId, AnchorRegistry, AnchorTable, FixupWidth, ReferenceKind, StreamId,
    Streams,
};
pub use constants::{ConstValue, ConstantInterner};
pub use image::{
    write_image, ImageError, ImageOptions, ImageWriter, ObjGroup, OBJ_FLAG_LARGE,
    OBJ_FLAG_TRANSIENT,
};
pub use label::Label;
pub use module::{
    merge_dependency, DependencyEntry, ExceptionTableEntry, Function, MetaclassDep, MethodHeader,
    Module, ModuleError, ObjectDef, METHOD_HEADER_SIZE,
};
pub use opcode::Opcode;
pub use stream::ByteStream;
pub use verify::{verify_module, VerifyError, MAX_STACK_DEPTH};
