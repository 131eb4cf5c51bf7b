use std::sync::Arc;

use node_forge_codegen::{
    asset_store::AssetStore,
    codegen::{
        ArgBlockLayout, ArgumentBlock, CodegenSession, LayoutAddress, LayoutError, LayoutRules, Severity,
        StandardResolver, TargetCode, TargetKind,
    },
    dsl::{CompiledMaterial, MaterialParameter, TextureShape, Value, ValueType},
};
use proptest::prelude::*;

fn session() -> CodegenSession {
    let store = AssetStore::new();
    store.insert_texture("wood.png", TextureShape::TwoD, [128, 128, 1]);
    store.insert_texture("metal.png", TextureShape::TwoD, [128, 128, 1]);
    CodegenSession::new(Arc::new(store), Arc::new(StandardResolver::new()))
}

fn read_f32(block: &ArgumentBlock, offset: usize) -> f32 {
    f32::from_le_bytes(block.data()[offset..offset + 4].try_into().unwrap())
}

fn read_u32(block: &ArgumentBlock, offset: usize) -> u32 {
    u32::from_le_bytes(block.data()[offset..offset + 4].try_into().unwrap())
}

fn param_offset(layout: &ArgBlockLayout, index: usize) -> usize {
    layout.parameter(index).unwrap().offset
}

/// Every class-compiled parameter is captured, whether or not the field reads it.
fn material(parameters: Vec<(&str, ValueType, Value)>) -> CompiledMaterial {
    let mut m = CompiledMaterial::new("args");
    for (name, ty, value) in parameters {
        m.add_parameter(name, ty, value);
    }
    let out = m.graph.constant(Value::Color([1.0; 3]), ValueType::Color);
    m.set_field("surface.tint", out);
    m
}

fn compile(session: &CodegenSession, target: TargetKind, m: &CompiledMaterial, map_strings: bool) -> Arc<TargetCode> {
    let mut backend = session.backend(target);
    if map_strings {
        backend.set_option("map_strings_to_ids", "on").unwrap();
    }
    let mut unit = backend.create_link_unit();
    unit.add_material_expression(m, "surface.tint", "tint").unwrap();
    backend.translate_link_unit(&mut unit).unwrap()
}

#[test]
fn texture_arguments_are_written_as_registry_indices() {
    let session = session();
    let m = material(vec![
        ("base", ValueType::texture_2d(), Value::texture("metal.png", TextureShape::TwoD)),
        ("detail", ValueType::texture_2d(), Value::texture("wood.png", TextureShape::TwoD)),
        ("scale", ValueType::Float, Value::Float(4.0)),
    ]);
    let code = compile(&session, TargetKind::Native, &m, false);
    let layout = code.layout(0).unwrap();
    let block = code.argument_block(0).unwrap();
    // parameters are enumerated in declaration order
    assert_eq!(read_u32(block, param_offset(layout, 0)), 1);
    assert_eq!(read_u32(block, param_offset(layout, 1)), 2);
    assert_eq!(read_f32(block, param_offset(layout, 2)), 4.0);

    let swapped = code
        .create_argument_block(
            0,
            &[
                Value::texture("wood.png", TextureShape::TwoD),
                Value::texture("unknown.png", TextureShape::TwoD),
                Value::Float(1.0),
            ],
        )
        .unwrap();
    assert_eq!(read_u32(&swapped, param_offset(layout, 0)), 2);
    assert_eq!(read_u32(&swapped, param_offset(layout, 1)), 0);
}

#[test]
fn string_arguments_use_the_interned_table_when_mapped() {
    let session = session();
    let m = material(vec![
        ("label", ValueType::String, Value::String("brushed".into())),
        ("gain", ValueType::Float, Value::Float(1.5)),
    ]);
    let code = compile(&session, TargetKind::Native, &m, true);
    assert_eq!(code.string_constant(0), Some(""));
    let id = (0..code.string_constant_count())
        .find(|&i| code.string_constant(i) == Some("brushed"))
        .unwrap();
    let layout = code.layout(0).unwrap();
    assert_eq!(read_u32(code.argument_block(0).unwrap(), param_offset(layout, 0)), id as u32);
}

#[test]
fn unmapped_strings_zero_only_their_own_argument() {
    let session = session();
    let m = material(vec![
        ("label", ValueType::String, Value::String("brushed".into())),
        ("gain", ValueType::Float, Value::Float(1.5)),
    ]);
    let code = compile(&session, TargetKind::Native, &m, false);
    let layout = code.layout(0).unwrap();
    let block = code.argument_block(0).unwrap();
    assert_eq!(read_u32(block, param_offset(layout, 0)), 0);
    assert_eq!(read_f32(block, param_offset(layout, 1)), 1.5);
    let zeroed: Vec<&str> = code
        .messages()
        .iter()
        .filter(|msg| msg.severity == Severity::Warning && msg.text.contains("left zeroed"))
        .map(|msg| msg.text.as_str())
        .collect();
    assert_eq!(zeroed.len(), 1);
    assert!(zeroed[0].contains("'label'"));
    assert!(matches!(
        code.create_argument_block(0, &[Value::String("x".into()), Value::Float(0.0)]),
        Err(LayoutError::Unsupported(_))
    ));
}

#[test]
fn cache_hits_intern_new_string_arguments() {
    let session = session();
    let mut backend = session.backend(TargetKind::Native);
    backend.set_option("map_strings_to_ids", "on").unwrap();
    let labelled = |label: &str| {
        material(vec![
            ("label", ValueType::String, Value::String(label.into())),
            ("gain", ValueType::Float, Value::Float(0.5)),
        ])
    };
    let id_of = |code: &TargetCode, text: &str| {
        (0..code.string_constant_count())
            .find(|&i| code.string_constant(i) == Some(text))
            .map(|i| i as u32)
    };

    let cold = backend
        .translate_material_expression(&labelled("first"), "surface.tint", "tint")
        .unwrap();
    let hot = backend
        .translate_material_expression(&labelled("second"), "surface.tint", "tint")
        .unwrap();
    assert_eq!(session.cache().hits(), 1);
    assert!(!hot.messages().iter().any(|msg| msg.text.contains("left zeroed")));

    let layout = hot.layout(0).unwrap();
    let block = hot.argument_block(0).unwrap();
    let second = id_of(&hot, "second").unwrap();
    assert_eq!(read_u32(block, param_offset(layout, 0)), second);
    assert_eq!(read_f32(block, param_offset(layout, 1)), 0.5);
    // the warm artifact is untouched
    assert_eq!(id_of(&cold, "second"), None);
    assert_eq!(
        read_u32(cold.argument_block(0).unwrap(), param_offset(layout, 0)),
        id_of(&cold, "first").unwrap()
    );
}

#[test]
fn gpu_layouts_pad_vectors_like_storage_buffers() {
    let session = session();
    let m = material(vec![
        ("gain", ValueType::Float, Value::Float(2.0)),
        ("tint", ValueType::Color, Value::Color([0.1, 0.2, 0.3])),
    ]);
    let code = compile(&session, TargetKind::Gpu, &m, false);
    let layout = code.layout(0).unwrap();
    assert_eq!(layout.rules(), LayoutRules::GpuStorage);
    assert_eq!(param_offset(layout, 1), 16);
    let block = code.argument_block(0).unwrap();
    assert_eq!(read_f32(block, 16), 0.1);
    assert_eq!(read_f32(block, 24), 0.3);
}

#[test]
fn mismatched_values_are_rejected() {
    let params = vec![MaterialParameter {
        name: "v".into(),
        ty: ValueType::float_vector(3),
        value: Value::float3(0.0, 0.0, 0.0),
    }];
    let layout = ArgBlockLayout::build(&params, LayoutRules::Scalar).unwrap();
    let session = session();
    let m = material(vec![("gain", ValueType::Float, Value::Float(1.0))]);
    let code = compile(&session, TargetKind::Native, &m, false);

    let mut block = ArgumentBlock::new(0, &layout);
    let at = layout.nested_address(0, LayoutAddress::ROOT).unwrap();
    assert_eq!(layout.num_elements(at), 3);
    assert!(matches!(
        block.set_value(&layout, &Value::Float(1.0), code.as_ref(), at),
        Err(LayoutError::KindMismatch { .. })
    ));
    assert!(matches!(
        block.set_value(&layout, &Value::Vector(vec![Value::Float(1.0)]), code.as_ref(), at),
        Err(LayoutError::ChildCountMismatch { .. })
    ));
    assert!(block.data().iter().all(|b| *b == 0));
}

proptest! {
    #[test]
    fn float_arguments_round_trip_through_blocks(
        gain in -1.0e6f32..1.0e6,
        tint in prop::array::uniform3(0.0f32..1.0),
        count in -1000i32..1000,
    ) {
        let params = vec![
            MaterialParameter { name: "gain".into(), ty: ValueType::Float, value: Value::Float(0.0) },
            MaterialParameter { name: "tint".into(), ty: ValueType::Color, value: Value::Color([0.0; 3]) },
            MaterialParameter { name: "count".into(), ty: ValueType::Int, value: Value::Int(0) },
        ];
        let session = session();
        let m = material(vec![("gain", ValueType::Float, Value::Float(1.0))]);
        let code = compile(&session, TargetKind::Native, &m, false);

        for rules in [LayoutRules::Scalar, LayoutRules::GpuStorage] {
            let layout = ArgBlockLayout::build(&params, rules).unwrap();
            let mut block = ArgumentBlock::new(0, &layout);
            block
                .fill(&layout, &[Value::Float(gain), Value::Color(tint), Value::Int(count)], code.as_ref())
                .unwrap();
            prop_assert_eq!(read_f32(&block, param_offset(&layout, 0)), gain);
            let tint_at = param_offset(&layout, 1);
            for (i, c) in tint.iter().enumerate() {
                prop_assert_eq!(read_f32(&block, tint_at + 4 * i), *c);
            }
            prop_assert_eq!(read_u32(&block, param_offset(&layout, 2)) as i32, count);
        }
    }
}
