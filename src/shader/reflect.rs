use spirq::ty::DescriptorType;
use spirq::var::Variable;

use crate::gpu::error::ReflectionError;
use crate::gpu::structs::{
    BindingDescriptor, DescriptorKind, ShaderType, PER_DRAW_SET, PER_FRAME_SET,
};

/// Bindings of one compiled stage, split by descriptor space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReflection {
    pub per_frame: Vec<BindingDescriptor>,
    pub per_draw: Vec<BindingDescriptor>,
    /// Bindings declared outside the two supported spaces. Reported, never
    /// bound.
    pub rejected: Vec<ReflectionError>,
}

impl StageReflection {
    /// Sorts `bindings` into spaces, logging every rejected one.
    pub fn classify(stage: ShaderType, bindings: impl IntoIterator<Item = BindingDescriptor>) -> Self {
        let mut out = StageReflection::default();
        for b in bindings {
            match b.set {
                PER_FRAME_SET => out.per_frame.push(b),
                PER_DRAW_SET => out.per_draw.push(b),
                set => {
                    let err = ReflectionError {
                        stage,
                        set,
                        binding: b.binding,
                    };
                    log::warn!("ignoring binding: {}", err);
                    out.rejected.push(err);
                }
            }
        }
        out
    }

    /// Fails on the first rejected binding, for callers that want stray
    /// descriptor sets to stop startup.
    pub fn check(&self) -> crate::gpu::error::Result<()> {
        match self.rejected.first() {
            Some(err) => Err((*err).into()),
            None => Ok(()),
        }
    }
}

fn descriptor_kind(desc_ty: &DescriptorType) -> Option<DescriptorKind> {
    match desc_ty {
        DescriptorType::Sampler() => Some(DescriptorKind::Sampler),
        DescriptorType::SampledImage() => Some(DescriptorKind::SampledImage),
        DescriptorType::CombinedImageSampler() => Some(DescriptorKind::CombinedImageSampler),
        DescriptorType::StorageImage(..) => Some(DescriptorKind::StorageImage),
        DescriptorType::UniformBuffer() => Some(DescriptorKind::UniformBuffer),
        DescriptorType::StorageBuffer(..) => Some(DescriptorKind::StorageBuffer),
        DescriptorType::InputAttachment(..) => Some(DescriptorKind::InputAttachment),
        DescriptorType::AccelStruct() => Some(DescriptorKind::AccelerationStructure),
        _ => None,
    }
}

/// Walks every descriptor declared by `spirv`'s entry points.
pub fn reflect_bindings(stage: ShaderType, spirv: &[u32]) -> Result<Vec<BindingDescriptor>, String> {
    let entry_points = spirq::ReflectConfig::new()
        .spv(spirv)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| format!("SPIR-V reflection failed: {:?}", e))?;

    let mut bindings: Vec<BindingDescriptor> = Vec::new();
    for entry_point in &entry_points {
        for var in entry_point.vars.iter() {
            if let Variable::Descriptor {
                desc_bind, desc_ty, ty, ..
            } = var
            {
                let Some(kind) = descriptor_kind(desc_ty) else {
                    log::warn!(
                        "{:?}: unsupported descriptor type {:?} at set {} binding {}",
                        stage,
                        desc_ty,
                        desc_bind.set(),
                        desc_bind.bind()
                    );
                    continue;
                };
                let desc = BindingDescriptor {
                    set: desc_bind.set(),
                    binding: desc_bind.bind(),
                    size: ty.nbyte().unwrap_or(0) as u32,
                    kind,
                };
                if !bindings.contains(&desc) {
                    bindings.push(desc);
                }
            }
        }
    }
    Ok(bindings)
}
