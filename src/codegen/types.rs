//! Core type definitions shared by the code generator.

use serde::{Deserialize, Serialize};

/// The three environments a compile can target. Chosen once per link unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Optimized code prepared for execution on the host.
    Native,
    /// Portable intermediate representation, as text or a binary container.
    PortableIr,
    /// GPU shader code (WGSL).
    Gpu,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Native => "native",
            TargetKind::PortableIr => "portable_ir",
            TargetKind::Gpu => "gpu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native" => Some(TargetKind::Native),
            "portable_ir" | "portable-ir" | "ir" => Some(TargetKind::PortableIr),
            "gpu" | "wgsl" => Some(TargetKind::Gpu),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Environment,
    Lambda,
    SwitchLambda,
    DfInit,
    DfSample,
    DfEvaluate,
    DfPdf,
}

impl FunctionKind {
    pub const DF_ENTRIES: [(FunctionKind, &'static str); 4] = [
        (FunctionKind::DfInit, "init"),
        (FunctionKind::DfSample, "sample"),
        (FunctionKind::DfEvaluate, "evaluate"),
        (FunctionKind::DfPdf, "pdf"),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionKind::Environment => "environment",
            FunctionKind::Lambda => "lambda",
            FunctionKind::SwitchLambda => "switch_lambda",
            FunctionKind::DfInit => "df_init",
            FunctionKind::DfSample => "df_sample",
            FunctionKind::DfEvaluate => "df_evaluate",
            FunctionKind::DfPdf => "df_pdf",
        }
    }

    pub fn is_df(self) -> bool {
        matches!(
            self,
            FunctionKind::DfInit | FunctionKind::DfSample | FunctionKind::DfEvaluate | FunctionKind::DfPdf
        )
    }
}

/// The shading state a fragment is evaluated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    Core,
    Displacement,
    Environment,
}

impl ExecutionContext {
    pub fn for_path(path: &str) -> Self {
        if path == "geometry.displacement" {
            ExecutionContext::Displacement
        } else {
            ExecutionContext::Core
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Assembly,
    PortableIr,
    PortableIrBinary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalSpace {
    World,
    Object,
}

/// How generated GPU code reaches the texture runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Vtable,
    DirectCall,
    OptixCp,
}

impl CallMode {
    pub fn runtime_prefix(self) -> &'static str {
        match self {
            CallMode::Vtable => "rt_vt_",
            CallMode::DirectCall => "rt_",
            CallMode::OptixCp => "rt_cp_",
        }
    }
}

/// Object transforms and id fixed at compile time for one instance.
///
/// Matrices are row-major and apply to column vectors.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformState {
    pub world_to_object: [[f32; 4]; 4],
    pub object_to_world: [[f32; 4]; 4],
    pub object_id: i32,
}

/// Bit set of shading-state fields read by generated code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUsage(pub u32);

impl StateUsage {
    pub const NORMAL: u32 = 1 << 0;
    pub const POSITION: u32 = 1 << 1;
    pub const TEXTURE_COORDINATE: u32 = 1 << 2;
    pub const DIRECTION: u32 = 1 << 3;
    pub const ANIMATION_TIME: u32 = 1 << 4;
    pub const TEXTURE_RESULTS: u32 = 1 << 5;
    pub const TRANSFORMS: u32 = 1 << 6;
    pub const RO_DATA: u32 = 1 << 7;
    pub const OBJECT_ID: u32 = 1 << 8;

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn union(self, other: StateUsage) -> StateUsage {
        StateUsage(self.0 | other.0)
    }
}
