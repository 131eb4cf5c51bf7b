//! The generated code artifact handed to loaders.
//!
//! A [`TargetCode`] is built once by a finalizing compile and never changes
//! afterwards; compilers hand it out as `Arc<TargetCode>`.

use serde::Serialize;
use serde_json::json;

use crate::asset_store::ResourceKind;
use crate::dsl::Value;

use super::arg_layout::{ArgBlockLayout, ArgumentBlock, ResourceIndexResolver};
use super::emit::CodeBody;
use super::error::{LayoutError, Message};
use super::resources::ResourceEntry;
use super::types::{FunctionKind, StateUsage, TargetKind};

/// One row of the function table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub kind: FunctionKind,
    /// Index of the argument block layout this function reads, if any.
    pub arg_block_index: Option<usize>,
    /// Target-specific signature of the entry point.
    pub prototype: String,
}

/// Everything a compile produced, before argument blocks are filled.
pub(crate) struct TargetCodeParts {
    pub target: TargetKind,
    pub functions: Vec<FunctionInfo>,
    pub body: CodeBody,
    pub ro_segment: Vec<u8>,
    pub strings: Vec<String>,
    pub strings_mapped: bool,
    pub layouts: Vec<ArgBlockLayout>,
    pub resources: [Vec<ResourceEntry>; 3],
    pub messages: Vec<Message>,
    pub state_usage: StateUsage,
}

#[derive(Clone, Debug)]
pub struct TargetCode {
    target: TargetKind,
    functions: Vec<FunctionInfo>,
    body: CodeBody,
    ro_segment: Vec<u8>,
    strings: Vec<String>,
    strings_mapped: bool,
    layouts: Vec<ArgBlockLayout>,
    argument_blocks: Vec<ArgumentBlock>,
    resources: [Vec<ResourceEntry>; 3],
    messages: Vec<Message>,
    state_usage: StateUsage,
}

impl TargetCode {
    /// Build the artifact and pre-fill one argument block per layout from
    /// `block_values`. An argument that cannot be packed stays zeroed and a
    /// warning naming it is recorded.
    pub(crate) fn assemble(parts: TargetCodeParts, block_values: &[Vec<Value>]) -> Self {
        let mut code = TargetCode {
            target: parts.target,
            functions: parts.functions,
            body: parts.body,
            ro_segment: parts.ro_segment,
            strings: parts.strings,
            strings_mapped: parts.strings_mapped,
            layouts: parts.layouts,
            argument_blocks: Vec::new(),
            resources: parts.resources,
            messages: parts.messages,
            state_usage: parts.state_usage,
        };

        let mut blocks = Vec::with_capacity(code.layouts.len());
        let mut warnings = Vec::new();
        for (i, layout) in code.layouts.iter().enumerate() {
            let mut block = ArgumentBlock::new(i, layout);
            let values = block_values.get(i).map_or(&[][..], Vec::as_slice);
            for (p, e) in block.fill_partial(layout, values, &code) {
                let name = layout.parameter_names().get(p).map_or("?", String::as_str);
                warnings.push(Message::warning(format!(
                    "argument '{name}' of block {i} left zeroed: {e}"
                )));
            }
            blocks.push(block);
        }
        code.argument_blocks = blocks;
        code.messages.extend(warnings);
        code
    }

    pub fn target(&self) -> TargetKind {
        self.target
    }

    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn function(&self, index: usize) -> Option<&FunctionInfo> {
        self.functions.get(index)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn body(&self) -> &CodeBody {
        &self.body
    }

    /// Emitted code as bytes (WGSL or IR text, the binary container, or the
    /// native listing).
    pub fn code(&self) -> &[u8] {
        self.body.bytes()
    }

    pub fn ro_segment(&self) -> &[u8] {
        &self.ro_segment
    }

    pub fn ro_segment_size(&self) -> usize {
        self.ro_segment.len()
    }

    pub fn string_constants(&self) -> &[String] {
        &self.strings
    }

    pub fn string_constant_count(&self) -> usize {
        self.strings.len()
    }

    pub fn string_constant(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn layouts(&self) -> &[ArgBlockLayout] {
        &self.layouts
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }

    pub fn layout(&self, index: usize) -> Option<&ArgBlockLayout> {
        self.layouts.get(index)
    }

    /// Argument blocks filled with the values the material carried at compile time.
    pub fn argument_blocks(&self) -> &[ArgumentBlock] {
        &self.argument_blocks
    }

    pub fn argument_block(&self, index: usize) -> Option<&ArgumentBlock> {
        self.argument_blocks.get(index)
    }

    /// A fresh block for layout `layout_index`, filled from `values`.
    pub fn create_argument_block(&self, layout_index: usize, values: &[Value]) -> Result<ArgumentBlock, LayoutError> {
        let layout = self.layouts.get(layout_index).ok_or(LayoutError::InvalidAddress)?;
        let mut block = ArgumentBlock::new(layout_index, layout);
        block.fill(layout, values, self)?;
        Ok(block)
    }

    /// Resource table of one kind, in index order. Entry 0 is the reserved one.
    pub fn resource_table(&self, kind: ResourceKind) -> &[ResourceEntry] {
        &self.resources[kind.slot()]
    }

    pub fn resource_count(&self, kind: ResourceKind) -> usize {
        self.resources[kind.slot()].len()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state_usage(&self) -> StateUsage {
        self.state_usage
    }

    /// JSON overview of the function and resource tables.
    pub fn summary(&self) -> serde_json::Value {
        let table = |kind: ResourceKind| {
            self.resource_table(kind)
                .iter()
                .map(|e| json!({ "index": e.index, "name": e.name, "shape": e.shape }))
                .collect::<Vec<_>>()
        };
        json!({
            "target": self.target,
            "functions": self.functions,
            "ro_segment_size": self.ro_segment.len(),
            "string_constants": self.strings,
            "layouts": self.layouts.iter().map(ArgBlockLayout::size).collect::<Vec<_>>(),
            "textures": table(ResourceKind::Texture),
            "light_profiles": table(ResourceKind::LightProfile),
            "bsdf_measurements": table(ResourceKind::BsdfMeasurement),
            "messages": self.messages,
        })
    }
}

impl ResourceIndexResolver for TargetCode {
    fn resource_index(&self, kind: ResourceKind, name: Option<&str>) -> u32 {
        let Some(name) = name else {
            return 0;
        };
        self.resource_table(kind)
            .iter()
            .skip(1)
            .find(|e| e.name == name)
            .map_or(0, |e| e.index)
    }

    fn string_index(&self, text: &str) -> Option<u32> {
        if !self.strings_mapped {
            return None;
        }
        self.strings.iter().position(|s| s == text).map(|i| i as u32)
    }
}
