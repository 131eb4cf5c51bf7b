//! Binary container for the portable IR: `NFIR`, a little-endian `u32` format
//! version, then the serialized module.

use anyhow::{Context, Result, bail};

use crate::codegen::lower::IrModule;

pub const MAGIC: [u8; 4] = *b"NFIR";
pub const FORMAT_VERSION: u32 = 1;

pub fn encode(module: &IrModule) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(module).context("failed to serialize ir module")?;
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<IrModule> {
    if bytes.len() < 8 || bytes[0..4] != MAGIC {
        bail!("not a portable ir container");
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        bail!("unsupported portable ir version {version}");
    }
    serde_json::from_slice(&bytes[8..]).context("corrupt portable ir payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_checked() {
        let module = IrModule {
            ro_segment: vec![1, 2, 3],
            ..IrModule::default()
        };
        let mut bytes = encode(&module).unwrap();
        assert_eq!(&bytes[0..4], b"NFIR");
        assert_eq!(decode(&bytes).unwrap(), module);

        bytes[4] = 9;
        assert!(decode(&bytes).unwrap_err().to_string().contains("version 9"));
        assert!(decode(b"NFI").is_err());
    }
}
