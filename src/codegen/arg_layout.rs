//! Argument block layouts for class-compiled material parameters.
//!
//! A layout is a flat vector of nodes forming a tree. Node 0 is the block itself
//! (a struct with one child per parameter); the children of every compound node
//! are stored contiguously, so a [`LayoutAddress`] is just a node index.
//!
//! Offsets are absolute byte offsets from the start of the block.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::asset_store::ResourceKind;
use crate::dsl::{MaterialParameter, ScalarType, Value, ValueKind, ValueType};

use super::error::LayoutError;
use super::resources::resource_ref;

/// Packing rules. Native and portable-IR targets use C-like scalar alignment;
/// the GPU target follows WGSL host-shareable storage layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutRules {
    Scalar,
    GpuStorage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutAddress(u32);

impl LayoutAddress {
    /// The block itself.
    pub const ROOT: LayoutAddress = LayoutAddress(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub kind: ValueKind,
    pub size: usize,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct LayoutNode {
    kind: ValueKind,
    offset: u32,
    size: u32,
    first_child: u32,
    num_children: u32,
}

/// Translates resource literals and strings into the integers stored in a block.
pub trait ResourceIndexResolver {
    /// Registry index for a resource; 0 when it is invalid or unknown.
    fn resource_index(&self, kind: ResourceKind, name: Option<&str>) -> u32;

    /// Interned id of a string, or `None` when strings are not mapped to ids.
    fn string_index(&self, text: &str) -> Option<u32>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgBlockLayout {
    nodes: Vec<LayoutNode>,
    rules: LayoutRules,
    names: Vec<String>,
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

fn scalar_size_align(s: ScalarType, rules: LayoutRules) -> (u32, u32) {
    match (s, rules) {
        (ScalarType::Bool, LayoutRules::Scalar) => (1, 1),
        (ScalarType::Bool, LayoutRules::GpuStorage) => (4, 4),
        (ScalarType::Int | ScalarType::Float, _) => (4, 4),
        (ScalarType::Double, _) => (8, 8),
    }
}

fn vector_size_align(element: ScalarType, n: u32, rules: LayoutRules) -> (u32, u32) {
    let (s, a) = scalar_size_align(element, rules);
    match rules {
        LayoutRules::Scalar => (s * n, a),
        LayoutRules::GpuStorage => match n {
            0 | 1 => (s, a),
            2 => (2 * s, 2 * s),
            3 => (3 * s, 4 * s),
            _ => (4 * s, 4 * s),
        },
    }
}

/// Byte size and alignment of `ty` under `rules`.
pub fn size_align(ty: &ValueType, rules: LayoutRules) -> Result<(u32, u32)> {
    Ok(match ty {
        ValueType::Bool => scalar_size_align(ScalarType::Bool, rules),
        ValueType::Int
        | ValueType::Enum { .. }
        | ValueType::Float
        | ValueType::String
        | ValueType::Texture { .. }
        | ValueType::LightProfile
        | ValueType::BsdfMeasurement => (4, 4),
        ValueType::Double => (8, 8),
        ValueType::Vector { element, size } => vector_size_align(*element, *size as u32, rules),
        ValueType::Color => vector_size_align(ScalarType::Float, 3, rules),
        ValueType::Matrix { columns, rows } => {
            let (s, a) = vector_size_align(ScalarType::Float, *rows as u32, rules);
            (*columns as u32 * round_up(s, a), a)
        }
        ValueType::Array { element, size } => {
            let (s, a) = size_align(element, rules)?;
            (*size * round_up(s, a), a)
        }
        ValueType::Struct { fields, .. } => {
            let tys: Vec<&ValueType> = fields.iter().map(|f| &f.ty).collect();
            let (_, size, align) = struct_layout(&tys, rules)?;
            (size, align)
        }
        ValueType::Bsdf | ValueType::Edf | ValueType::Vdf => {
            bail!("distribution type {ty} cannot be stored in an argument block")
        }
    })
}

fn struct_layout(fields: &[&ValueType], rules: LayoutRules) -> Result<(Vec<u32>, u32, u32)> {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut end = 0;
    let mut max_align = 1;
    for ty in fields {
        let (s, a) = size_align(ty, rules)?;
        let off = round_up(end, a);
        offsets.push(off);
        end = off + s;
        max_align = max_align.max(a);
    }
    Ok((offsets, round_up(end, max_align), max_align))
}

/// Offsets of the children of `ty`, relative to the start of `ty`.
pub(crate) fn child_offsets(ty: &ValueType, rules: LayoutRules) -> Result<Vec<u32>> {
    let stride_of = |t: &ValueType| -> Result<u32> {
        let (s, a) = size_align(t, rules)?;
        Ok(round_up(s, a))
    };
    Ok(match ty {
        ValueType::Vector { element, size } => {
            let (s, _) = scalar_size_align(*element, rules);
            (0..*size as u32).map(|i| i * s).collect()
        }
        ValueType::Color => vec![0, 4, 8],
        ValueType::Matrix { columns, rows } => {
            let stride = stride_of(&ValueType::float_vector(*rows))?;
            (0..*columns as u32).map(|i| i * stride).collect()
        }
        ValueType::Array { element, size } => {
            let stride = stride_of(element)?;
            (0..*size).map(|i| i * stride).collect()
        }
        ValueType::Struct { fields, .. } => {
            let tys: Vec<&ValueType> = fields.iter().map(|f| &f.ty).collect();
            struct_layout(&tys, rules)?.0
        }
        _ => Vec::new(),
    })
}

impl ArgBlockLayout {
    /// Derive the layout of a block holding `parameters` in declaration order.
    pub fn build(parameters: &[MaterialParameter], rules: LayoutRules) -> Result<Self> {
        let tys: Vec<&ValueType> = parameters.iter().map(|p| &p.ty).collect();
        let (offsets, size, _) = struct_layout(&tys, rules)?;

        let mut layout = ArgBlockLayout {
            nodes: vec![LayoutNode {
                kind: ValueKind::Struct,
                offset: 0,
                size,
                first_child: 1,
                num_children: parameters.len() as u32,
            }],
            rules,
            names: parameters.iter().map(|p| p.name.clone()).collect(),
        };
        for _ in parameters {
            layout.nodes.push(Self::placeholder());
        }
        for (i, p) in parameters.iter().enumerate() {
            layout.fill(1 + i, &p.ty, offsets[i])?;
        }
        Ok(layout)
    }

    fn placeholder() -> LayoutNode {
        LayoutNode {
            kind: ValueKind::Int,
            offset: 0,
            size: 0,
            first_child: 0,
            num_children: 0,
        }
    }

    fn fill(&mut self, index: usize, ty: &ValueType, offset: u32) -> Result<()> {
        let (size, _) = size_align(ty, self.rules)?;
        let count = ty.child_count();
        let first_child = self.nodes.len();
        self.nodes[index] = LayoutNode {
            kind: ty.kind(),
            offset,
            size,
            first_child: first_child as u32,
            num_children: count as u32,
        };
        if count == 0 {
            return Ok(());
        }
        let offsets = child_offsets(ty, self.rules)?;
        for _ in 0..count {
            self.nodes.push(Self::placeholder());
        }
        for (i, child_offset) in offsets.into_iter().enumerate() {
            let Some(child_ty) = ty.child_type(i) else {
                bail!("{ty} has no child {i}");
            };
            self.fill(first_child + i, &child_ty, offset + child_offset)?;
        }
        Ok(())
    }

    pub fn rules(&self) -> LayoutRules {
        self.rules
    }

    /// Total block size in bytes.
    pub fn size(&self) -> usize {
        self.nodes[0].size as usize
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    /// Number of children at `address`; 0 for leaves and invalid addresses.
    pub fn num_elements(&self, address: LayoutAddress) -> usize {
        self.nodes
            .get(address.0 as usize)
            .map_or(0, |n| n.num_children as usize)
    }

    pub fn layout_at(&self, address: LayoutAddress) -> Option<LayoutEntry> {
        let n = self.nodes.get(address.0 as usize)?;
        Some(LayoutEntry {
            kind: n.kind,
            size: n.size as usize,
            offset: n.offset as usize,
        })
    }

    pub fn nested_address(&self, index: usize, address: LayoutAddress) -> Option<LayoutAddress> {
        let n = self.nodes.get(address.0 as usize)?;
        if index >= n.num_children as usize {
            return None;
        }
        Some(LayoutAddress(n.first_child + index as u32))
    }

    /// Layout entry of top-level parameter `index`.
    pub fn parameter(&self, index: usize) -> Option<LayoutEntry> {
        self.layout_at(self.nested_address(index, LayoutAddress::ROOT)?)
    }

    /// Pack `value` into `block` at `address`.
    ///
    /// Scalars are written as their native bit pattern. Compound values must have
    /// exactly as many children as the layout node and are written child by child.
    /// Resources are written as their registry index; strings as their interned id.
    pub fn set_value(
        &self,
        block: &mut [u8],
        value: &Value,
        resolver: &dyn ResourceIndexResolver,
        address: LayoutAddress,
    ) -> Result<(), LayoutError> {
        let node = self
            .nodes
            .get(address.0 as usize)
            .ok_or(LayoutError::InvalidAddress)?;
        if value.kind() != node.kind {
            return Err(LayoutError::KindMismatch {
                expected: node.kind,
                found: value.kind(),
            });
        }

        if node.kind.is_compound() {
            let children = value.children();
            if children.len() != node.num_children as usize {
                return Err(LayoutError::ChildCountMismatch {
                    expected: node.num_children as usize,
                    found: children.len(),
                });
            }
            for (i, child) in children.iter().enumerate() {
                let child_address = LayoutAddress(node.first_child + i as u32);
                self.set_value(block, child, resolver, child_address)?;
            }
            return Ok(());
        }

        let offset = node.offset as usize;
        match value {
            Value::Bool(b) => {
                if node.size == 1 {
                    write(block, offset, &[*b as u8])
                } else {
                    write(block, offset, bytemuck::bytes_of(&(*b as u32)))
                }
            }
            Value::Int(v) | Value::Enum(v) => write(block, offset, bytemuck::bytes_of(v)),
            Value::Float(v) => write(block, offset, bytemuck::bytes_of(v)),
            Value::Double(v) => write(block, offset, bytemuck::bytes_of(v)),
            Value::String(s) => {
                let id = resolver
                    .string_index(s)
                    .ok_or_else(|| LayoutError::Unsupported("string".to_string()))?;
                write(block, offset, bytemuck::bytes_of(&id))
            }
            other => {
                let Some((kind, name)) = resource_ref(other) else {
                    return Err(LayoutError::Unsupported(format!("{:?}", other.kind())));
                };
                let index = resolver.resource_index(kind, name);
                write(block, offset, bytemuck::bytes_of(&index))
            }
        }
    }
}

fn write(block: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), LayoutError> {
    let dst = block
        .get_mut(offset..offset + bytes.len())
        .ok_or(LayoutError::InvalidAddress)?;
    dst.copy_from_slice(bytes);
    Ok(())
}

/// A runtime-mutable parameter buffer for one layout.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentBlock {
    layout_index: usize,
    data: Vec<u8>,
}

impl ArgumentBlock {
    pub fn new(layout_index: usize, layout: &ArgBlockLayout) -> Self {
        Self {
            layout_index,
            data: vec![0; layout.size()],
        }
    }

    pub fn layout_index(&self) -> usize {
        self.layout_index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_value(
        &mut self,
        layout: &ArgBlockLayout,
        value: &Value,
        resolver: &dyn ResourceIndexResolver,
        address: LayoutAddress,
    ) -> Result<(), LayoutError> {
        layout.set_value(&mut self.data, value, resolver, address)
    }

    /// Fill every top-level parameter from `values`, in declaration order.
    pub fn fill(
        &mut self,
        layout: &ArgBlockLayout,
        values: &[Value],
        resolver: &dyn ResourceIndexResolver,
    ) -> Result<(), LayoutError> {
        for (i, v) in values.iter().enumerate() {
            let address = layout
                .nested_address(i, LayoutAddress::ROOT)
                .ok_or(LayoutError::InvalidAddress)?;
            layout.set_value(&mut self.data, v, resolver, address)?;
        }
        Ok(())
    }

    /// Like [`ArgumentBlock::fill`], but keeps going past parameters that cannot
    /// be packed. Each of those is left zeroed over its own byte range and
    /// returned with its index; every other parameter keeps its value.
    pub fn fill_partial(
        &mut self,
        layout: &ArgBlockLayout,
        values: &[Value],
        resolver: &dyn ResourceIndexResolver,
    ) -> Vec<(usize, LayoutError)> {
        let mut failures = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let Some(address) = layout.nested_address(i, LayoutAddress::ROOT) else {
                failures.push((i, LayoutError::InvalidAddress));
                continue;
            };
            if let Err(e) = layout.set_value(&mut self.data, v, resolver, address) {
                if let Some(entry) = layout.layout_at(address) {
                    if let Some(range) = self.data.get_mut(entry.offset..entry.offset + entry.size) {
                        range.fill(0);
                    }
                }
                failures.push((i, e));
            }
        }
        failures
    }
}
