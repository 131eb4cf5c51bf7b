//! Checks emitted GPU code with naga's WGSL front end.

use anyhow::{Result, bail};

/// Parse `source` and make sure every name in `entry_points` is defined as a
/// function in it.
///
/// Parse errors are rendered with naga's own source annotations and tagged
/// with the entry points that were being checked.
pub fn validate_wgsl(source: &str, entry_points: &[&str]) -> Result<naga::Module> {
    let module = match naga::front::wgsl::parse_str(source) {
        Ok(module) => module,
        Err(e) => bail!(
            "invalid WGSL for {}:\n{}",
            entry_points.join(", "),
            e.emit_to_string(source)
        ),
    };
    let missing: Vec<&str> = entry_points
        .iter()
        .copied()
        .filter(|name| !module.functions.iter().any(|(_, f)| f.name.as_deref() == Some(*name)))
        .collect();
    if !missing.is_empty() {
        bail!("WGSL is missing entry point(s) {}", missing.join(", "));
    }
    Ok(module)
}
