//! Code generation for shading-network fragments.
//!
//! Entry point is a [`CodegenSession`], which owns the resource store, the name
//! resolver and the code cache. From it, a [`Backend`] per target kind compiles
//! single functions or accumulates several into a [`LinkUnit`]. Both paths end in
//! an immutable [`TargetCode`].

mod arg_layout;
mod code_cache;
mod compiler;
pub mod emit;
mod error;
mod lambda;
mod link_unit;
pub mod lower;
mod options;
mod resolver;
mod resources;
mod target_code;
mod types;
pub mod validation;

pub use arg_layout::{
    ArgBlockLayout, ArgumentBlock, LayoutAddress, LayoutEntry, LayoutRules, ResourceIndexResolver, size_align,
};
pub use code_cache::{CacheKey, CachedCode, CodeCache, cache_key, distribution_cache_key, hash_bytes, hex};
pub use compiler::{Backend, CodegenSession};
pub use emit::{CodeBody, NativeModule};
pub use error::{CodegenError, CompileFailure, LayoutError, Message, MessageKind, OptionError, Severity};
pub use lambda::{DistributionFunction, Lambda, Roots};
pub use link_unit::LinkUnit;
pub use options::{BackendOptions, SUPPORTED_ARCH_VERSIONS};
pub use resolver::{BsdfNode, Intrinsic, NameResolver, Resolution, StandardResolver};
pub use resources::{
    ResourceBinding, ResourceEntry, ResourceEnumerator, ResourceKey, ResourceMap, ResourceRegistry, resource_ref,
};
pub use target_code::{FunctionInfo, TargetCode};
pub use types::{
    CallMode, ExecutionContext, FunctionKind, InternalSpace, OutputFormat, StateUsage, TargetKind, UniformState,
};
