use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Context, Result, anyhow};
use node_forge_codegen::{
    asset_store::AssetStore,
    codegen::{BackendOptions, CodegenSession, StandardResolver, TargetKind},
    dsl::CompiledMaterial,
};

#[derive(Debug, Clone, PartialEq)]
enum Request {
    Expression(String),
    Distribution(String),
    Switch(Vec<String>),
}

#[derive(Debug, Default, Clone)]
struct Cli {
    material: Option<PathBuf>,
    target: Option<TargetKind>,
    requests: Vec<Request>,
    assets: Option<PathBuf>,
    options: Option<PathBuf>,
    overrides: Vec<(String, String)>,
    out: Option<PathBuf>,
}

const USAGE: &str = "supported: --material <file.json>, --target native|portable-ir|gpu, --path <field>, \
--df <field>, --switch <field,field,...>, --assets <file.json>, --options <file.json>, --set name=value, --out <file>";

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .map(String::as_str)
                .ok_or_else(|| anyhow!("missing value for {flag}"))
        };
        match flag {
            "--material" => cli.material = Some(PathBuf::from(value()?)),
            "--target" => {
                let v = value()?;
                cli.target = Some(TargetKind::parse(v).ok_or_else(|| anyhow!("unknown target '{v}'"))?);
            }
            "--path" => cli.requests.push(Request::Expression(value()?.to_string())),
            "--df" => cli.requests.push(Request::Distribution(value()?.to_string())),
            "--switch" => {
                let paths: Vec<String> = value()?.split(',').map(str::to_string).collect();
                cli.requests.push(Request::Switch(paths));
            }
            "--assets" => cli.assets = Some(PathBuf::from(value()?)),
            "--options" => cli.options = Some(PathBuf::from(value()?)),
            "--set" => {
                let v = value()?;
                let (name, setting) = v
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--set expects name=value, got '{v}'"))?;
                cli.overrides.push((name.to_string(), setting.to_string()));
            }
            "--out" => cli.out = Some(PathBuf::from(value()?)),
            other => return Err(anyhow!("unknown argument: {other} ({USAGE})")),
        }
        i += 2;
    }
    Ok(cli)
}

/// Function name for a material field, e.g. `surface.tint` -> `surface_tint`.
fn function_name(prefix: &str, path: &str) -> String {
    let ident: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{prefix}{ident}")
}

fn read(path: &PathBuf, what: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {what} {}", path.display()))
}

fn run(cli: Cli) -> Result<()> {
    let material_path = cli.material.ok_or_else(|| anyhow!("--material is required ({USAGE})"))?;
    let target = cli.target.ok_or_else(|| anyhow!("--target is required ({USAGE})"))?;
    if cli.requests.is_empty() {
        return Err(anyhow!("nothing to compile: pass at least one --path, --df or --switch"));
    }

    let material = CompiledMaterial::from_json(&read(&material_path, "material")?)?;
    let store = match &cli.assets {
        Some(path) => AssetStore::from_json(&read(path, "asset list")?)?,
        None => AssetStore::new(),
    };
    let mut options = match &cli.options {
        Some(path) => BackendOptions::from_json(&read(path, "options")?)?,
        None => BackendOptions::default(),
    };
    for (name, value) in &cli.overrides {
        options.set_option(name, value).map_err(|e| anyhow!("--set {name}={value}: {e}"))?;
    }

    let session = CodegenSession::new(Arc::new(store), Arc::new(StandardResolver::new()));
    let backend = session.backend(target).with_options(options)?;
    let mut unit = backend.create_link_unit();

    let start = Instant::now();
    for request in &cli.requests {
        let added = match request {
            Request::Expression(path) => unit.add_material_expression(&material, path, &function_name("", path)),
            Request::Distribution(path) => unit.add_material_df(&material, path, &function_name("df_", path)),
            Request::Switch(paths) => {
                let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
                unit.add_switch_expressions(&material, &refs, &function_name("switch_", &paths.join("_")))
            }
        };
        if let Err(e) = added {
            for m in unit.messages() {
                log::error!("{:?}: {}", m.severity, m.text);
            }
            return Err(anyhow!("{request:?} failed with code {}: {e}", e.code()));
        }
    }

    let code = backend.translate_link_unit(&mut unit).map_err(|failure| {
        for m in &failure.messages {
            log::error!("{:?}: {}", m.severity, m.text);
        }
        anyhow!("link unit failed with code {}: {}", failure.code(), failure.error)
    })?;
    log::info!(
        "compiled {} function(s) for {} in {:.1} ms",
        code.function_count(),
        target.as_str(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    if let Some(out) = &cli.out {
        std::fs::write(out, code.code()).with_context(|| format!("failed to write {}", out.display()))?;
        log::info!("wrote {} byte(s) to {}", code.code().len(), out.display());
    }
    println!("{}", serde_json::to_string_pretty(&code.summary())?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    run(parse_cli(&args)?)
}
