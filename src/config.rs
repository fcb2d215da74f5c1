//! Renderer configuration.
//!
//! Defaults reproduce the descriptor pool and compiler setup a deferred
//! frame needs. With the `vkd-serde` feature the whole structure can be
//! loaded from YAML, either directly or from the file named by
//! `VKDEFERRED_CONFIG`.

use std::path::PathBuf;

use crate::shader::{CompilerOptions, DiskCache, SourceLanguage};

/// Environment variable naming a YAML configuration file.
pub const CONFIG_ENV: &str = "VKDEFERRED_CONFIG";

/// Capacity of the shared descriptor pool, per descriptor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "vkd-serde", serde(default))]
pub struct DescriptorPoolConfig {
    pub max_sets: u32,
    pub samplers: u32,
    pub sampled_images: u32,
    pub combined_image_samplers: u32,
    pub storage_images: u32,
    pub storage_buffers: u32,
    pub uniform_buffers: u32,
    pub acceleration_structures: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 500,
            samplers: 2,
            sampled_images: 5,
            combined_image_samplers: 5,
            storage_images: 1,
            storage_buffers: 1,
            uniform_buffers: 1,
            acceleration_structures: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "vkd-serde", serde(default))]
pub struct RendererConfig {
    pub descriptor_pool: DescriptorPoolConfig,
    pub shader_language: SourceLanguage,
    pub include_dir: PathBuf,
    pub debug_info: bool,
    /// Enables the on-disk SPIR-V cache when set.
    pub cache_dir: Option<PathBuf>,
    /// Fail variant builds whose shaders declare bindings outside the
    /// per-frame and per-draw sets instead of ignoring them.
    pub strict_reflection: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            descriptor_pool: DescriptorPoolConfig::default(),
            shader_language: SourceLanguage::Hlsl,
            include_dir: PathBuf::from("shaders"),
            debug_info: false,
            cache_dir: None,
            strict_reflection: false,
        }
    }
}

impl RendererConfig {
    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            language: self.shader_language,
            include_dir: self.include_dir.clone(),
            debug_info: self.debug_info,
        }
    }

    pub fn disk_cache(&self) -> Option<DiskCache> {
        let options = self.compiler_options();
        self.cache_dir
            .as_ref()
            .map(|dir| DiskCache::with_options(dir, &options))
    }
}

#[cfg(feature = "vkd-serde")]
mod serde_support {
    use std::fs;
    use std::path::Path;

    use anyhow::{Context as _, Result};

    use super::{RendererConfig, CONFIG_ENV};

    impl RendererConfig {
        pub fn from_yaml_str(yaml: &str) -> Result<Self> {
            serde_yaml::from_str(yaml).context("parsing renderer config YAML")
        }

        pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading renderer config '{}'", path.display()))?;
            Self::from_yaml_str(&contents)
                .with_context(|| format!("loading renderer config '{}'", path.display()))
        }

        /// Loads the file named by `VKDEFERRED_CONFIG`, or the defaults when
        /// the variable is unset.
        pub fn from_env() -> Result<Self> {
            match std::env::var_os(CONFIG_ENV) {
                Some(path) => {
                    log::info!("loading renderer config from {:?}", path);
                    Self::from_yaml_file(path)
                }
                None => Ok(Self::default()),
            }
        }
    }
}

#[cfg(all(test, feature = "vkd-serde"))]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = RendererConfig::from_yaml_str(
            "descriptor_pool:\n  max_sets: 64\nshader_language: glsl\ncache_dir: /tmp/spv\n",
        )
        .unwrap();
        assert_eq!(cfg.descriptor_pool.max_sets, 64);
        assert_eq!(cfg.descriptor_pool.sampled_images, 5);
        assert_eq!(cfg.shader_language, SourceLanguage::Glsl);
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/spv")));
        assert!(!cfg.strict_reflection);
    }

    #[test]
    fn unknown_language_is_an_error() {
        let err = RendererConfig::from_yaml_str("shader_language: wgsl\n").unwrap_err();
        assert!(format!("{:#}", err).contains("renderer config"));
    }
}
