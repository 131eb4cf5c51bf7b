//! Backend configuration.
//!
//! Options can be deserialized from JSON (every field has a default) or set one at
//! a time through the string interface used by embedders:
//!
//! ```ignore
//! let mut options = BackendOptions::default();
//! options.set_option("opt_level", "1")?;
//! options.set_option("tex_lookup_call_mode", "direct_call")?;
//! ```

use serde::{Deserialize, Serialize};

use super::error::OptionError;
use super::types::{CallMode, InternalSpace, OutputFormat};

/// Target architecture versions the GPU path accepts.
pub const SUPPORTED_ARCH_VERSIONS: [u32; 10] = [20, 30, 35, 37, 50, 52, 60, 61, 62, 70];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub compile_constants: bool,
    pub fast_math: bool,
    pub opt_level: u8,
    pub internal_space: InternalSpace,
    pub enable_exceptions: bool,
    pub enable_ro_segment: bool,
    pub num_texture_spaces: u32,
    pub num_texture_results: u32,
    pub target_arch: u32,
    pub output_format: OutputFormat,
    pub map_strings_to_ids: bool,
    pub tex_lookup_call_mode: CallMode,
    /// Run emitted GPU code through the WGSL front end before returning it.
    pub validate_output: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            compile_constants: true,
            fast_math: true,
            opt_level: 2,
            internal_space: InternalSpace::World,
            enable_exceptions: true,
            enable_ro_segment: false,
            num_texture_spaces: 32,
            num_texture_results: 0,
            target_arch: 20,
            output_format: OutputFormat::Assembly,
            map_strings_to_ids: false,
            tex_lookup_call_mode: CallMode::Vtable,
            validate_output: false,
        }
    }
}

fn parse_on_off(name: &str, value: &str) -> Result<bool, OptionError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn invalid(name: &str, value: &str) -> OptionError {
    OptionError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

impl BackendOptions {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let options: BackendOptions = serde_json::from_str(text)?;
        options
            .check()
            .map_err(|e| anyhow::anyhow!("invalid backend options: {e}"))?;
        Ok(options)
    }

    /// Range checks that serde alone cannot express.
    pub fn check(&self) -> Result<(), OptionError> {
        if self.opt_level > 2 {
            return Err(invalid("opt_level", &self.opt_level.to_string()));
        }
        if !SUPPORTED_ARCH_VERSIONS.contains(&self.target_arch) {
            return Err(invalid("target_arch", &self.target_arch.to_string()));
        }
        Ok(())
    }

    /// Set one option from its string form.
    ///
    /// # Returns
    /// `OptionError::Unknown` (code -1) for unrecognized names and
    /// `OptionError::InvalidValue` (code -2) when the value does not parse.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        match name {
            "compile_constants" => self.compile_constants = parse_on_off(name, value)?,
            "fast_math" => self.fast_math = parse_on_off(name, value)?,
            "enable_exceptions" => self.enable_exceptions = parse_on_off(name, value)?,
            "enable_ro_segment" => self.enable_ro_segment = parse_on_off(name, value)?,
            "map_strings_to_ids" => self.map_strings_to_ids = parse_on_off(name, value)?,
            "validate_output" => self.validate_output = parse_on_off(name, value)?,
            "opt_level" => {
                self.opt_level = match value {
                    "0" => 0,
                    "1" => 1,
                    "2" => 2,
                    _ => return Err(invalid(name, value)),
                }
            }
            "internal_space" => {
                self.internal_space = match value {
                    "coordinate_world" | "world" => InternalSpace::World,
                    "coordinate_object" | "object" => InternalSpace::Object,
                    _ => return Err(invalid(name, value)),
                }
            }
            "num_texture_spaces" => {
                self.num_texture_spaces = value.parse().map_err(|_| invalid(name, value))?
            }
            "num_texture_results" => {
                self.num_texture_results = value.parse().map_err(|_| invalid(name, value))?
            }
            "target_arch" | "sm_version" => {
                let arch: u32 = value.parse().map_err(|_| invalid(name, value))?;
                if !SUPPORTED_ARCH_VERSIONS.contains(&arch) {
                    return Err(invalid(name, value));
                }
                self.target_arch = arch;
            }
            "output_format" => {
                self.output_format = match value {
                    "assembly" => OutputFormat::Assembly,
                    "portable_ir" => OutputFormat::PortableIr,
                    "portable_ir_binary" => OutputFormat::PortableIrBinary,
                    _ => return Err(invalid(name, value)),
                }
            }
            "tex_lookup_call_mode" => {
                self.tex_lookup_call_mode = match value {
                    "vtable" => CallMode::Vtable,
                    "direct_call" => CallMode::DirectCall,
                    "optix_cp" => CallMode::OptixCp,
                    _ => return Err(invalid(name, value)),
                }
            }
            _ => return Err(OptionError::Unknown(name.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = BackendOptions::default();
        assert!(o.compile_constants);
        assert!(o.fast_math);
        assert_eq!(o.opt_level, 2);
        assert_eq!(o.internal_space, InternalSpace::World);
        assert!(!o.enable_ro_segment);
        assert_eq!(o.num_texture_spaces, 32);
        assert_eq!(o.num_texture_results, 0);
        assert_eq!(o.target_arch, 20);
        assert_eq!(o.tex_lookup_call_mode, CallMode::Vtable);
    }

    #[test]
    fn set_option_reports_unknown_and_invalid_separately() {
        let mut o = BackendOptions::default();
        assert_eq!(o.set_option("no_such_option", "on").unwrap_err().code(), -1);
        assert_eq!(o.set_option("fast_math", "yes").unwrap_err().code(), -2);
        assert_eq!(o.set_option("opt_level", "3").unwrap_err().code(), -2);
        assert_eq!(o.set_option("sm_version", "21").unwrap_err().code(), -2);

        o.set_option("sm_version", "70").unwrap();
        o.set_option("internal_space", "coordinate_object").unwrap();
        o.set_option("output_format", "portable_ir_binary").unwrap();
        assert_eq!(o.target_arch, 70);
        assert_eq!(o.internal_space, InternalSpace::Object);
        assert_eq!(o.output_format, OutputFormat::PortableIrBinary);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let o = BackendOptions::from_json(r#"{ "opt_level": 0, "map_strings_to_ids": true }"#).unwrap();
        assert_eq!(o.opt_level, 0);
        assert!(o.map_strings_to_ids);
        assert!(o.fast_math);
        assert!(BackendOptions::from_json(r#"{ "target_arch": 99 }"#).is_err());
    }
}
