use std::{path::PathBuf, sync::Arc};

use node_forge_codegen::{
    asset_store::{AssetStore, ResourceKind},
    codegen::{CodegenSession, FunctionKind, StandardResolver, TargetKind},
    dsl::CompiledMaterial,
};

#[derive(Clone, Debug)]
enum Request {
    Expression(&'static str),
    Distribution(&'static str),
    Switch(&'static [&'static str]),
}

#[derive(Clone, Debug)]
struct Case {
    name: &'static str,
    requests: &'static [Request],
    expected_functions: &'static [&'static str],
    expected_textures: &'static [&'static str],
}

const CASES: &[Case] = &[
    Case {
        name: "tinted_texture",
        requests: &[Request::Expression("surface.tint"), Request::Expression("surface.roughness")],
        expected_functions: &["surface_tint", "surface_roughness"],
        expected_textures: &["", "albedo.png"],
    },
    Case {
        name: "layered_bsdf",
        requests: &[Request::Expression("surface.tint"), Request::Distribution("surface.scattering")],
        expected_functions: &[
            "surface_tint",
            "surface_scattering_init",
            "surface_scattering_sample",
            "surface_scattering_evaluate",
            "surface_scattering_pdf",
        ],
        expected_textures: &[""],
    },
    Case {
        name: "surface_switch",
        requests: &[Request::Switch(&["surface.height", "surface.fallback", "surface.normal"])],
        expected_functions: &["surface_switch"],
        // broken.png is known to the store but invalid, so it maps to index 0
        expected_textures: &["", "bump.png"],
    },
];

fn cases_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("cases")
}

fn read(path: PathBuf) -> String {
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}

fn function_name(path: &str) -> String {
    path.replace('.', "_")
}

fn run_case(case: &Case, target: TargetKind) {
    let root = cases_root();
    let store = AssetStore::from_json(&read(root.join("assets.json"))).expect("asset list");
    let material = CompiledMaterial::from_json(&read(root.join(case.name).join("material.json")))
        .unwrap_or_else(|e| panic!("case {}: {e:#}", case.name));

    let session = CodegenSession::new(Arc::new(store), Arc::new(StandardResolver::new()));
    let mut backend = session.backend(target);
    // GPU output is checked by naga before it is returned
    backend.set_option("validate_output", "on").unwrap();
    let mut unit = backend.create_link_unit();
    for request in case.requests {
        let added = match request {
            Request::Expression(path) => unit.add_material_expression(&material, path, &function_name(path)),
            Request::Distribution(path) => unit.add_material_df(&material, path, &function_name(path)),
            Request::Switch(paths) => unit.add_switch_expressions(&material, paths, "surface_switch"),
        };
        if let Err(e) = added {
            panic!("case {} ({}): {request:?} failed: {e}\n{:#?}", case.name, target.as_str(), unit.messages());
        }
    }
    let code = backend
        .translate_link_unit(&mut unit)
        .unwrap_or_else(|f| panic!("case {} ({}): {}\n{:#?}", case.name, target.as_str(), f.error, f.messages));

    let names: Vec<&str> = code.functions().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, case.expected_functions, "case {}", case.name);
    let textures: Vec<&str> = code
        .resource_table(ResourceKind::Texture)
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(textures, case.expected_textures, "case {}", case.name);
    assert_eq!(code.argument_blocks().len(), code.layout_count());
    assert!(!code.code().is_empty());
    for f in code.functions() {
        assert!(!f.prototype.is_empty(), "case {}: {} has no prototype", case.name, f.name);
    }
    if target == TargetKind::Gpu {
        let text = code.body().text().expect("wgsl text");
        for f in code.functions() {
            assert!(text.contains(&format!("fn {}(", f.name)), "case {}: missing {}", case.name, f.name);
        }
    }
    if let Some(switch) = code.function_by_name("surface_switch") {
        assert_eq!(switch.kind, FunctionKind::SwitchLambda);
    }
}

#[test]
fn material_cases_compile_for_gpu() {
    for case in CASES {
        run_case(case, TargetKind::Gpu);
    }
}

#[test]
fn material_cases_compile_for_native() {
    for case in CASES {
        run_case(case, TargetKind::Native);
    }
}

#[test]
fn material_cases_compile_to_portable_ir() {
    for case in CASES {
        run_case(case, TargetKind::PortableIr);
    }
}

#[test]
fn every_case_directory_is_listed() {
    let mut dirs: Vec<String> = std::fs::read_dir(cases_root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    let mut listed: Vec<&str> = CASES.iter().map(|c| c.name).collect();
    listed.sort();
    assert_eq!(dirs, listed);
}
