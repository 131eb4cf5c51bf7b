//! Content-addressed cache of compiled single-function artifacts.
//!
//! Keys are 32-byte hashes of a canonical JSON object naming the function, the
//! content hash of its graph, the resources it resolved, and every option that
//! changes the emitted bytes. The cache is internally synchronized and meant to
//! be shared through an `Arc` by every backend of a session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

use super::arg_layout::ArgBlockLayout;
use super::emit::CodeBody;
use super::lambda::{DistributionFunction, Lambda};
use super::options::BackendOptions;
use super::resources::ResourceMap;
use super::target_code::FunctionInfo;
use super::types::{CallMode, ExecutionContext, InternalSpace, OutputFormat, StateUsage, TargetKind};

pub type CacheKey = [u8; 32];

const GENERATOR_TAG: &str = "node-forge-codegen/1";

pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    fn fnv1a64_with_seed(bytes: &[u8], seed: u64) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325_u64 ^ seed;
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    let h0 = fnv1a64_with_seed(bytes, 0x0000_0000_0000_0000);
    let h1 = fnv1a64_with_seed(bytes, 0x9e37_79b9_7f4a_7c15);
    let h2 = fnv1a64_with_seed(bytes, 0xc2b2_ae3d_27d4_eb4f);
    let h3 = fnv1a64_with_seed(bytes, 0x1656_67b1_9e37_79f9);

    let mut out = [0_u8; 32];
    out[0..8].copy_from_slice(&h0.to_le_bytes());
    out[8..16].copy_from_slice(&h1.to_le_bytes());
    out[16..24].copy_from_slice(&h2.to_le_bytes());
    out[24..32].copy_from_slice(&h3.to_le_bytes());
    out
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Serialize)]
struct CacheKeyInput<'a> {
    generator: &'static str,
    target: TargetKind,
    function: &'a str,
    content_hash: String,
    resources: &'a ResourceMap,
    target_arch: u32,
    output_format: OutputFormat,
    context: ExecutionContext,
    num_texture_spaces: u32,
    num_texture_results: u32,
    internal_space: InternalSpace,
    opt_level: u8,
    fast_math: bool,
    enable_exceptions: bool,
    enable_ro_segment: bool,
    call_mode: CallMode,
    map_strings_to_ids: bool,
}

/// Key for compiling `lambda` (after resource enumeration) with `options`.
///
/// The option list is explicit; `compile_constants` and `validate_output` only
/// decide whether a compile happens and never change its output.
pub fn cache_key(lambda: &Lambda, target: TargetKind, options: &BackendOptions) -> Result<CacheKey> {
    let content_hash = lambda
        .content_hash()
        .with_context(|| format!("failed to hash fragment '{}'", lambda.name()))?;
    let input = CacheKeyInput {
        generator: GENERATOR_TAG,
        target,
        function: lambda.name(),
        content_hash: hex(&content_hash),
        resources: lambda.resources(),
        target_arch: options.target_arch,
        output_format: options.output_format,
        context: lambda.context(),
        num_texture_spaces: options.num_texture_spaces,
        num_texture_results: options.num_texture_results,
        internal_space: options.internal_space,
        opt_level: options.opt_level,
        fast_math: options.fast_math,
        enable_exceptions: options.enable_exceptions,
        enable_ro_segment: options.enable_ro_segment,
        call_mode: options.tex_lookup_call_mode,
        map_strings_to_ids: options.map_strings_to_ids,
    };
    let bytes = serde_json::to_vec(&input)
        .with_context(|| format!("failed to serialize cache key of '{}'", lambda.name()))?;
    Ok(hash_bytes(&bytes))
}

/// Key for a distribution function: the main fragment's key combined with the
/// keys of its auxiliary fragments, in order.
pub fn distribution_cache_key(df: &DistributionFunction, target: TargetKind, options: &BackendOptions) -> Result<CacheKey> {
    let mut bytes = b"df".to_vec();
    bytes.extend_from_slice(&cache_key(df.main(), target, options)?);
    for aux in df.aux() {
        bytes.extend_from_slice(&cache_key(aux, target, options)?);
    }
    Ok(hash_bytes(&bytes))
}

/// Everything needed to rebuild an artifact without compiling.
#[derive(Clone, Debug)]
pub struct CachedCode {
    pub body: CodeBody,
    pub functions: Vec<FunctionInfo>,
    pub ro_segment: Vec<u8>,
    pub strings: Vec<String>,
    pub layout: Option<ArgBlockLayout>,
    pub state_usage: StateUsage,
}

#[derive(Default)]
struct Entries {
    map: HashMap<CacheKey, Arc<CachedCode>>,
    order: VecDeque<CacheKey>,
}

#[derive(Default)]
pub struct CodeCache {
    entries: Mutex<Entries>,
    capacity: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that evicts its oldest entry once `capacity` entries are stored.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CachedCode>> {
        let found = self.entries.lock().map.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("code cache hit {}", hex(&key[..8]));
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            log::debug!("code cache miss {}", hex(&key[..8]));
        }
        found
    }

    pub fn insert(&self, key: CacheKey, code: CachedCode) {
        let mut entries = self.entries.lock();
        if entries.map.insert(key, Arc::new(code)).is_none() {
            entries.order.push_back(key);
        }
        if let Some(capacity) = self.capacity {
            while entries.map.len() > capacity {
                let Some(oldest) = entries.order.pop_front() else {
                    break;
                };
                entries.map.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.order.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: u8) -> CachedCode {
        CachedCode {
            body: CodeBody::Binary(vec![tag]),
            functions: vec![],
            ro_segment: vec![tag; 4],
            strings: vec![],
            layout: None,
            state_usage: StateUsage::default(),
        }
    }

    #[test]
    fn hash_bytes_is_stable_and_sensitive() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn lookup_counts_hits_and_misses() {
        let cache = CodeCache::new();
        let key = hash_bytes(b"k");
        assert!(cache.lookup(&key).is_none());
        cache.insert(key, entry(1));
        assert_eq!(cache.lookup(&key).unwrap().ro_segment, vec![1; 4]);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn capacity_limit_evicts_oldest() {
        let cache = CodeCache::with_capacity_limit(2);
        let keys: Vec<CacheKey> = (0..3u8).map(|i| hash_bytes(&[i])).collect();
        for (i, k) in keys.iter().enumerate() {
            cache.insert(*k, entry(i as u8));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&keys[0]).is_none());
        assert!(cache.lookup(&keys[2]).is_some());
    }

    #[test]
    fn option_changes_change_the_key() {
        let l = Lambda::new("f", ExecutionContext::Core);
        let base = BackendOptions::default();
        let k = cache_key(&l, TargetKind::Gpu, &base).unwrap();

        let mut o = base.clone();
        o.opt_level = 1;
        assert_ne!(cache_key(&l, TargetKind::Gpu, &o).unwrap(), k);
        let mut o = base.clone();
        o.tex_lookup_call_mode = CallMode::DirectCall;
        assert_ne!(cache_key(&l, TargetKind::Gpu, &o).unwrap(), k);
        let mut o = base.clone();
        o.validate_output = true;
        assert_eq!(cache_key(&l, TargetKind::Gpu, &o).unwrap(), k);
        assert_ne!(cache_key(&l, TargetKind::Native, &base).unwrap(), k);
    }

    #[test]
    fn fragments_with_resources_get_distinct_keys() {
        use crate::asset_store::ResourceKind;
        use crate::codegen::resources::{ResourceBinding, ResourceKey};

        let with_texture = |name: &str| {
            let mut l = Lambda::new("f", ExecutionContext::Core);
            l.resources_mut().insert(
                ResourceKey {
                    kind: ResourceKind::Texture,
                    name: Some(name.to_string()),
                },
                ResourceBinding {
                    index: 1,
                    attributes: crate::asset_store::ResourceAttributes::invalid(ResourceKind::Texture),
                },
            );
            l
        };
        let options = BackendOptions::default();
        let a = cache_key(&with_texture("a.png"), TargetKind::Gpu, &options).unwrap();
        let b = cache_key(&with_texture("b.png"), TargetKind::Gpu, &options).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, hash_bytes(b""));
        assert_ne!(cache_key(&with_texture("a.png"), TargetKind::Native, &options).unwrap(), a);
    }
}
