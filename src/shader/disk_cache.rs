use std::fs;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

use super::compiler::{CompileRequest, CompilerOptions};

/// Content-addressed store of compiled SPIR-V, keyed by everything that
/// feeds the compiler.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    /// Digest of the compiler options, mixed into every key.
    options: u64,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_options(root, &CompilerOptions::default())
    }

    /// Cache for binaries built with `options`. Entries written under other
    /// options are never returned.
    pub fn with_options(root: impl Into<PathBuf>, options: &CompilerOptions) -> Self {
        let mut h = Xxh3::new();
        h.update(&[options.language as u8, options.debug_info as u8]);
        h.update(options.include_dir.to_string_lossy().as_bytes());
        Self {
            root: root.into(),
            options: h.digest(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(&self, request: &CompileRequest<'_>) -> u64 {
        let mut h = Xxh3::new();
        h.update(&self.options.to_le_bytes());
        h.update(request.source.as_bytes());
        h.update(&[0]);
        h.update(request.entry.as_bytes());
        h.update(&[0, request.stage as u8]);
        for m in request.macros {
            h.update(m.as_bytes());
            h.update(&[0]);
        }
        h.digest()
    }

    fn path(&self, key: u64) -> PathBuf {
        self.root.join(format!("{:016x}.spv", key))
    }

    /// Returns the cached binary, or `None` on a miss or an unreadable entry.
    pub fn load(&self, request: &CompileRequest<'_>) -> Option<Vec<u32>> {
        let path = self.path(self.key(request));
        let bytes = fs::read(&path).ok()?;
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            log::warn!("discarding corrupt shader cache entry {}", path.display());
            return None;
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        if words[0] != 0x0723_0203 {
            log::warn!("discarding shader cache entry without SPIR-V magic {}", path.display());
            return None;
        }
        Some(words)
    }

    /// Failures are logged; a cache that cannot be written only costs a
    /// recompile next run.
    pub fn store(&self, request: &CompileRequest<'_>, spirv: &[u32]) {
        let path = self.path(self.key(request));
        let result = fs::create_dir_all(&self.root)
            .and_then(|_| fs::write(&path, bytemuck::cast_slice::<u32, u8>(spirv)));
        if let Err(e) = result {
            log::warn!("unable to write shader cache entry {}: {}", path.display(), e);
        }
    }
}
