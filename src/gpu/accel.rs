use ash::vk;

use super::error::{GPUError, Result};
use super::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

/// Indexed triangle soup referenced by device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_format: vk::Format,
    pub stride: u64,
    pub max_vertex: u32,
    pub primitive_count: u32,
    pub opaque: bool,
}

/// Instance of a bottom-level structure inside a top-level one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceGeometry {
    pub structure_address: vk::DeviceAddress,
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    pub custom_index: u32,
    pub mask: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Triangles(TriangleGeometry),
    Instance(InstanceGeometry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureDesc {
    pub level: AccelerationStructureLevel,
    pub geometries: Vec<Geometry>,
}

/// A built structure. Only `address` matters to descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    pub level: AccelerationStructureLevel,
    pub buffer: vk::Buffer,
}

/// Accumulates geometry for one acceleration structure build.
///
/// ```ignore
/// let blas = AccelerationStructureBuilder::bottom()
///     .triangles(vertices_addr, indices_addr, 56, 1024, 300)
///     .build(&device)?;
/// let tlas = AccelerationStructureBuilder::top()
///     .instance(blas.address, IDENTITY)
///     .build(&device)?;
/// ```
pub struct AccelerationStructureBuilder {
    desc: AccelerationStructureDesc,
}

pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

impl AccelerationStructureBuilder {
    pub fn bottom() -> Self {
        Self {
            desc: AccelerationStructureDesc {
                level: AccelerationStructureLevel::Bottom,
                geometries: Vec::new(),
            },
        }
    }

    pub fn top() -> Self {
        Self {
            desc: AccelerationStructureDesc {
                level: AccelerationStructureLevel::Top,
                geometries: Vec::new(),
            },
        }
    }

    /// Adds an opaque triangle geometry with `R32G32B32_SFLOAT` positions.
    pub fn triangles(
        mut self,
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
        stride: u64,
        max_vertex: u32,
        primitive_count: u32,
    ) -> Self {
        self.desc.geometries.push(Geometry::Triangles(TriangleGeometry {
            vertex_address,
            index_address,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            stride,
            max_vertex,
            primitive_count,
            opaque: true,
        }));
        self
    }

    pub fn instance(mut self, structure_address: vk::DeviceAddress, transform: [f32; 12]) -> Self {
        self.desc.geometries.push(Geometry::Instance(InstanceGeometry {
            structure_address,
            transform,
            custom_index: 0,
            mask: 0xFF,
        }));
        self
    }

    pub fn desc(&self) -> &AccelerationStructureDesc {
        &self.desc
    }

    pub fn build<D: Device>(self, device: &D) -> Result<AccelerationStructure> {
        if self.desc.geometries.is_empty() {
            return Err(GPUError::Unimplemented(
                "acceleration structure without geometry",
            ));
        }

        let mixed = self.desc.geometries.iter().any(|g| match (self.desc.level, g) {
            (AccelerationStructureLevel::Bottom, Geometry::Instance(_)) => true,
            (AccelerationStructureLevel::Top, Geometry::Triangles(_)) => true,
            _ => false,
        });
        if mixed {
            return Err(GPUError::Unimplemented(
                "geometry kind does not match acceleration structure level",
            ));
        }

        log::debug!(
            "building {:?} acceleration structure with {} geometries",
            self.desc.level,
            self.desc.geometries.len()
        );
        device.build_acceleration_structure(&self.desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    #[test]
    fn empty_builder_is_rejected() {
        let device = NullDevice::new();
        assert!(AccelerationStructureBuilder::bottom().build(&device).is_err());
    }

    #[test]
    fn top_level_consumes_bottom_address() {
        let device = NullDevice::new();
        let blas = AccelerationStructureBuilder::bottom()
            .triangles(0x1000, 0x2000, 56, 3, 1)
            .build(&device)
            .unwrap();
        let tlas = AccelerationStructureBuilder::top()
            .instance(blas.address, IDENTITY_TRANSFORM)
            .build(&device)
            .unwrap();
        assert_ne!(blas.address, 0);
        assert_ne!(tlas.address, blas.address);
        assert_eq!(tlas.level, AccelerationStructureLevel::Top);
    }
}
