use std::sync::Arc;

use node_forge_codegen::{
    asset_store::{AssetStore, ResourceKind},
    codegen::{CodeCache, CodegenSession, LayoutAddress, StandardResolver, TargetKind},
    dsl::{CompiledMaterial, TextureShape, Value, ValueType},
};

fn session() -> CodegenSession {
    let store = AssetStore::new();
    store.insert_texture("albedo.png", TextureShape::TwoD, [64, 64, 1]);
    CodegenSession::new(Arc::new(store), Arc::new(StandardResolver::new()))
}

fn material(tint: [f32; 3]) -> CompiledMaterial {
    let mut m = CompiledMaterial::new("cached");
    let tex = m
        .graph
        .constant(Value::texture("albedo.png", TextureShape::TwoD), ValueType::texture_2d());
    let zero = m.graph.constant(Value::Int(0), ValueType::Int);
    let uv = m
        .graph
        .call("state::texture_coordinate", &[zero], ValueType::float_vector(3))
        .unwrap();
    let sample = m.graph.call("tex::lookup_color", &[tex, uv], ValueType::Color).unwrap();
    let tint = m.add_parameter("tint", ValueType::Color, Value::Color(tint));
    let out = m.graph.call("math::mul", &[sample, tint], ValueType::Color).unwrap();
    m.set_field("surface.tint", out);
    m
}

fn tint_of(code: &node_forge_codegen::codegen::TargetCode) -> f32 {
    let layout = code.layout(0).unwrap();
    let at = layout.nested_address(0, LayoutAddress::ROOT).unwrap();
    let offset = layout.layout_at(at).unwrap().offset;
    let block = code.argument_block(0).unwrap();
    f32::from_le_bytes(block.data()[offset..offset + 4].try_into().unwrap())
}

#[test]
fn identical_compiles_hit_the_cache() {
    let session = session();
    let backend = session.backend(TargetKind::Gpu);
    let m = material([0.5, 0.5, 0.5]);

    let first = backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    let second = backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    assert_eq!((session.cache().hits(), session.cache().misses()), (1, 1));
    assert_eq!(session.cache().len(), 1);

    assert_eq!(first.code(), second.code());
    assert_eq!(first.ro_segment(), second.ro_segment());
    assert_eq!(first.string_constants(), second.string_constants());
    assert_eq!(first.layouts(), second.layouts());
    assert_eq!(first.functions()[0].prototype, second.functions()[0].prototype);
    assert_eq!(second.resource_table(ResourceKind::Texture)[1].name, "albedo.png");
}

#[test]
fn cache_hits_carry_the_current_argument_values() {
    let session = session();
    let backend = session.backend(TargetKind::Native);
    let warm = backend
        .translate_material_expression(&material([0.25; 3]), "surface.tint", "tint")
        .unwrap();
    let hot = backend
        .translate_material_expression(&material([0.75; 3]), "surface.tint", "tint")
        .unwrap();
    assert_eq!(session.cache().hits(), 1);
    assert_eq!(tint_of(&warm), 0.25);
    assert_eq!(tint_of(&hot), 0.75);
}

/// `op(sample, sample)` over the albedo texture.
fn combined(op: &str) -> CompiledMaterial {
    let mut m = CompiledMaterial::new("combined");
    let tex = m
        .graph
        .constant(Value::texture("albedo.png", TextureShape::TwoD), ValueType::texture_2d());
    let zero = m.graph.constant(Value::Int(0), ValueType::Int);
    let uv = m
        .graph
        .call("state::texture_coordinate", &[zero], ValueType::float_vector(3))
        .unwrap();
    let sample = m.graph.call("tex::lookup_color", &[tex, uv], ValueType::Color).unwrap();
    let out = m.graph.call(op, &[sample, sample], ValueType::Color).unwrap();
    m.set_field("surface.tint", out);
    m
}

#[test]
fn different_fragments_over_the_same_texture_do_not_collide() {
    let session = session();
    let backend = session.backend(TargetKind::PortableIr);
    let added = backend
        .translate_material_expression(&combined("math::add"), "surface.tint", "tint")
        .unwrap();
    let multiplied = backend
        .translate_material_expression(&combined("math::mul"), "surface.tint", "tint")
        .unwrap();
    assert_eq!((session.cache().hits(), session.cache().misses()), (0, 2));
    assert_eq!(session.cache().len(), 2);
    assert_ne!(added.code(), multiplied.code());

    let uncached = session
        .backend(TargetKind::PortableIr)
        .with_cache(false)
        .translate_material_expression(&combined("math::mul"), "surface.tint", "tint")
        .unwrap();
    assert_eq!(multiplied.code(), uncached.code());
}

#[test]
fn code_affecting_options_miss() {
    let session = session();
    let m = material([1.0; 3]);
    let mut backend = session.backend(TargetKind::PortableIr);
    backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    backend.set_option("opt_level", "0").unwrap();
    backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    assert_eq!((session.cache().hits(), session.cache().misses()), (0, 2));

    // validation does not change the output
    backend.set_option("validate_output", "on").unwrap();
    backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    assert_eq!(session.cache().hits(), 1);
}

#[test]
fn targets_do_not_share_entries() {
    let session = session();
    let m = material([1.0; 3]);
    session
        .backend(TargetKind::Native)
        .translate_material_expression(&m, "surface.tint", "tint")
        .unwrap();
    session
        .backend(TargetKind::Gpu)
        .translate_material_expression(&m, "surface.tint", "tint")
        .unwrap();
    assert_eq!(session.cache().hits(), 0);
    assert_eq!(session.cache().len(), 2);
}

#[test]
fn disabled_cache_is_bypassed() {
    let session = session();
    let backend = session.backend(TargetKind::Native).with_cache(false);
    let m = material([1.0; 3]);
    backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    backend.translate_material_expression(&m, "surface.tint", "tint").unwrap();
    assert!(session.cache().is_empty());
    assert_eq!((session.cache().hits(), session.cache().misses()), (0, 0));
}

#[test]
fn link_units_never_touch_the_cache() {
    let session = session();
    let backend = session.backend(TargetKind::Native);
    let m = material([1.0; 3]);
    let mut unit = backend.create_link_unit();
    unit.add_material_expression(&m, "surface.tint", "tint").unwrap();
    backend.translate_link_unit(&mut unit).unwrap();
    assert!(session.cache().is_empty());
}

#[test]
fn sessions_can_share_a_cache() {
    let shared = Arc::new(CodeCache::new());
    let a = session().with_cache(shared.clone());
    let b = session().with_cache(shared.clone());
    let m = material([1.0; 3]);
    a.backend(TargetKind::Gpu)
        .translate_material_expression(&m, "surface.tint", "tint")
        .unwrap();
    b.backend(TargetKind::Gpu)
        .translate_material_expression(&m, "surface.tint", "tint")
        .unwrap();
    assert_eq!(shared.hits(), 1);
}

#[test]
fn failed_compiles_are_not_cached() {
    let session = session();
    let backend = session.backend(TargetKind::Native);
    let mut m = material([1.0; 3]);
    let broken = m.graph.call("user::unknown", &[], ValueType::Color).unwrap();
    m.set_field("broken", broken);
    for _ in 0..2 {
        let failure = backend.translate_material_expression(&m, "broken", "broken").unwrap_err();
        assert_eq!(failure.code(), -3);
    }
    assert!(session.cache().is_empty());
    assert_eq!(session.cache().misses(), 2);
}
