use std::path::PathBuf;

use crate::gpu::error::CompileError;
use crate::gpu::structs::{BindingDescriptor, PermutationId, ShaderType};

/// Source dialect handed to the compiler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "vkd-serde", serde(rename_all = "lowercase"))]
pub enum SourceLanguage {
    #[default]
    Hlsl,
    Glsl,
}

/// Everything that determines the compiled binary of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest<'a> {
    pub source: &'a str,
    pub entry: &'a str,
    pub stage: ShaderType,
    pub macros: &'a [String],
}

/// Turns source text into SPIR-V words.
pub trait ShaderCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u32>, CompileError>;

    /// Lists the descriptors `spirv` declares. The default walks the binary
    /// with `spirq`.
    fn reflect(&self, stage: ShaderType, spirv: &[u32]) -> Result<Vec<BindingDescriptor>, String> {
        super::reflect::reflect_bindings(stage, spirv)
    }
}

/// Macro names for every set bit of `id`, lowest bit first.
pub fn permutation_macros(id: PermutationId) -> Vec<String> {
    id.bits().map(|i| format!("_PERMUTATION{}_", i)).collect()
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub language: SourceLanguage,
    pub include_dir: PathBuf,
    pub debug_info: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            language: SourceLanguage::Hlsl,
            include_dir: PathBuf::from("shaders"),
            debug_info: false,
        }
    }
}

#[cfg(feature = "vkd-shaderc")]
pub use shaderc_backend::ShadercCompiler;

#[cfg(feature = "vkd-shaderc")]
mod shaderc_backend {
    use super::*;
    use crate::gpu::structs::{
        BUFFER_BINDING_OFFSET, SAMPLER_BINDING_OFFSET, SRV_BINDING_OFFSET, UAV_BINDING_OFFSET,
    };

    fn kind(stage: ShaderType) -> shaderc::ShaderKind {
        match stage {
            ShaderType::Vertex => shaderc::ShaderKind::Vertex,
            ShaderType::Fragment => shaderc::ShaderKind::Fragment,
            ShaderType::Compute => shaderc::ShaderKind::Compute,
            ShaderType::RayGeneration => shaderc::ShaderKind::RayGeneration,
            ShaderType::RayMiss => shaderc::ShaderKind::Miss,
            ShaderType::RayClosestHit => shaderc::ShaderKind::ClosestHit,
        }
    }

    /// `shaderc`-backed compiler. Includes resolve relative to
    /// [`CompilerOptions::include_dir`].
    pub struct ShadercCompiler {
        compiler: shaderc::Compiler,
        options: CompilerOptions,
    }

    impl ShadercCompiler {
        pub fn new(options: CompilerOptions) -> Option<Self> {
            Some(Self {
                compiler: shaderc::Compiler::new()?,
                options,
            })
        }

        fn error(request: &CompileRequest<'_>, diagnostics: impl Into<String>) -> CompileError {
            CompileError {
                stage: request.stage,
                entry: request.entry.to_string(),
                macros: request.macros.to_vec(),
                diagnostics: diagnostics.into(),
            }
        }
    }

    impl ShaderCompiler for ShadercCompiler {
        fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u32>, CompileError> {
            let mut opts = shaderc::CompileOptions::new()
                .ok_or_else(|| Self::error(request, "unable to create shaderc options"))?;

            opts.set_target_env(
                shaderc::TargetEnv::Vulkan,
                shaderc::EnvVersion::Vulkan1_2 as u32,
            );
            if request.stage.is_ray_tracing() {
                opts.set_target_spirv(shaderc::SpirvVersion::V1_4);
            }
            opts.set_source_language(match self.options.language {
                SourceLanguage::Hlsl => shaderc::SourceLanguage::HLSL,
                SourceLanguage::Glsl => shaderc::SourceLanguage::GLSL,
            });
            if self.options.debug_info && !request.stage.is_ray_tracing() {
                opts.set_generate_debug_info();
            }

            opts.set_binding_base(shaderc::ResourceKind::Buffer, BUFFER_BINDING_OFFSET);
            opts.set_binding_base(shaderc::ResourceKind::Sampler, SAMPLER_BINDING_OFFSET);
            opts.set_binding_base(shaderc::ResourceKind::Texture, SRV_BINDING_OFFSET);
            opts.set_binding_base(shaderc::ResourceKind::UnorderedAccessView, UAV_BINDING_OFFSET);

            for m in request.macros {
                opts.add_macro_definition(m, None);
            }

            let root = self.options.include_dir.clone();
            opts.set_include_callback(move |name, _ty, _from, _depth| {
                let path = root.join(name);
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| format!("include '{}': {}", path.display(), e))?;
                Ok(shaderc::ResolvedInclude {
                    resolved_name: path.display().to_string(),
                    content,
                })
            });

            let artifact = self
                .compiler
                .compile_into_spirv(
                    request.source,
                    kind(request.stage),
                    request.entry,
                    request.entry,
                    Some(&opts),
                )
                .map_err(|e| Self::error(request, e.to_string()))?;

            if artifact.get_num_warnings() > 0 {
                log::warn!(
                    "{:?} '{}': {}",
                    request.stage,
                    request.entry,
                    artifact.get_warning_messages()
                );
            }

            Ok(artifact.as_binary().to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_follow_set_bits() {
        assert_eq!(
            permutation_macros(PermutationId(0b101)),
            vec!["_PERMUTATION0_".to_string(), "_PERMUTATION2_".to_string()]
        );
        assert!(permutation_macros(PermutationId(0)).is_empty());
        assert_eq!(
            permutation_macros(PermutationId(1 << 63)),
            vec!["_PERMUTATION63_".to_string()]
        );
    }
}
