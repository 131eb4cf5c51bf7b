//! Target emission.
//!
//! A [`TargetBackend`] is chosen once per link unit (or per single-function
//! compile). It fixes the argument-block layout rules and turns a lowered
//! [`IrModule`] into the code body stored in the artifact:
//!
//! - native: the optimized module itself, kept in memory with a text listing
//! - portable IR: the IR listing, or the `NFIR` binary container
//! - GPU: WGSL, or the portable IR when that output format is requested

pub mod binary;
pub mod ir_text;
pub mod wgsl;

use std::sync::Arc;

use anyhow::Result;

use super::arg_layout::LayoutRules;
use super::lower::IrModule;
use super::options::BackendOptions;
use super::types::{OutputFormat, TargetKind};
use super::validation::validate_wgsl;

/// Optimized code held in memory for execution on the host.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeModule {
    module: IrModule,
    listing: String,
}

impl NativeModule {
    pub fn module(&self) -> &IrModule {
        &self.module
    }

    pub fn listing(&self) -> &str {
        &self.listing
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CodeBody {
    Native(Arc<NativeModule>),
    Text { format: OutputFormat, text: String },
    Binary(Vec<u8>),
}

impl CodeBody {
    /// Raw bytes of the body. Native bodies expose their listing.
    pub fn bytes(&self) -> &[u8] {
        match self {
            CodeBody::Native(m) => m.listing.as_bytes(),
            CodeBody::Text { text, .. } => text.as_bytes(),
            CodeBody::Binary(b) => b,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            CodeBody::Native(m) => Some(&m.listing),
            CodeBody::Text { text, .. } => Some(text),
            CodeBody::Binary(_) => None,
        }
    }

    pub fn native(&self) -> Option<&NativeModule> {
        match self {
            CodeBody::Native(m) => Some(m),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Emitted {
    pub body: CodeBody,
    /// One signature per function, in module order.
    pub prototypes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetBackend {
    target: TargetKind,
    output_format: OutputFormat,
    validate: bool,
}

impl TargetBackend {
    pub fn new(target: TargetKind, options: &BackendOptions) -> Self {
        Self {
            target,
            output_format: options.output_format,
            validate: options.validate_output,
        }
    }

    pub fn target(&self) -> TargetKind {
        self.target
    }

    pub fn layout_rules(&self) -> LayoutRules {
        match self.target {
            TargetKind::Gpu => LayoutRules::GpuStorage,
            TargetKind::Native | TargetKind::PortableIr => LayoutRules::Scalar,
        }
    }

    /// Link units on non-native targets always place large constants in the
    /// read-only segment; otherwise the option decides.
    pub fn use_ro_segment(&self, options: &BackendOptions, link_unit: bool) -> bool {
        options.enable_ro_segment || (link_unit && self.target != TargetKind::Native)
    }

    fn emit_portable(&self, module: &IrModule) -> Result<Emitted> {
        let prototypes = module.functions.iter().map(ir_text::prototype).collect();
        let body = match self.output_format {
            OutputFormat::PortableIrBinary => CodeBody::Binary(binary::encode(module)?),
            OutputFormat::Assembly | OutputFormat::PortableIr => CodeBody::Text {
                format: OutputFormat::PortableIr,
                text: ir_text::write(module),
            },
        };
        Ok(Emitted { body, prototypes })
    }

    pub fn emit(&self, module: IrModule) -> Result<Emitted> {
        match self.target {
            TargetKind::Native => {
                let prototypes = module.functions.iter().map(ir_text::prototype).collect();
                let listing = ir_text::write(&module);
                Ok(Emitted {
                    body: CodeBody::Native(Arc::new(NativeModule { module, listing })),
                    prototypes,
                })
            }
            TargetKind::PortableIr => self.emit_portable(&module),
            TargetKind::Gpu if self.output_format != OutputFormat::Assembly => self.emit_portable(&module),
            TargetKind::Gpu => {
                let out = wgsl::write(&module)?;
                if self.validate {
                    let names: Vec<&str> = module.functions.iter().map(|f| f.name.as_str()).collect();
                    validate_wgsl(&out.with_runtime_stubs(), &names)?;
                    log::debug!("validated WGSL for {} function(s)", names.len());
                }
                Ok(Emitted {
                    body: CodeBody::Text {
                        format: OutputFormat::Assembly,
                        text: out.source,
                    },
                    prototypes: out.prototypes,
                })
            }
        }
    }
}
