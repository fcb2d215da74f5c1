use std::mem::size_of;

use ash::vk;

use super::VulkanDevice;
use crate::gpu::accel::{
    AccelerationStructure, AccelerationStructureDesc, AccelerationStructureLevel, Geometry,
    InstanceGeometry,
};
use crate::gpu::error::Result;
use crate::gpu::Device;

fn instance_record(instance: &InstanceGeometry) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR {
            matrix: instance.transform,
        },
        instance_custom_index_and_mask: vk::Packed24_8::new(instance.custom_index, instance.mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: instance.structure_address,
        },
    }
}

impl VulkanDevice {
    pub(super) fn build_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure> {
        let mut geometries = Vec::new();
        let mut ranges = Vec::new();
        let mut max_counts = Vec::new();
        let mut staging = Vec::new();

        let instances: Vec<vk::AccelerationStructureInstanceKHR> = desc
            .geometries
            .iter()
            .filter_map(|g| match g {
                Geometry::Instance(i) => Some(instance_record(i)),
                Geometry::Triangles(_) => None,
            })
            .collect();

        // Top-level structures take every instance through a single geometry.
        if !instances.is_empty() {
            let byte_len = instances.len() * size_of::<vk::AccelerationStructureInstanceKHR>();
            let bytes =
                unsafe { std::slice::from_raw_parts(instances.as_ptr() as *const u8, byte_len) };
            let (buffer, address) = self.create_host_buffer(
                byte_len as u64,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                bytes,
            )?;
            staging.push(buffer);

            geometries.push(
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                            .array_of_pointers(false)
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: address,
                            })
                            .build(),
                    })
                    .build(),
            );
            ranges.push(vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: instances.len() as u32,
                ..Default::default()
            });
            max_counts.push(instances.len() as u32);
        }

        for geometry in &desc.geometries {
            let Geometry::Triangles(tri) = geometry else {
                continue;
            };
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(tri.vertex_format)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: tri.vertex_address,
                })
                .vertex_stride(tri.stride)
                .max_vertex(tri.max_vertex)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: tri.index_address,
                })
                .build();
            geometries.push(
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(if tri.opaque {
                        vk::GeometryFlagsKHR::OPAQUE
                    } else {
                        vk::GeometryFlagsKHR::empty()
                    })
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .build(),
            );
            ranges.push(vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: tri.primitive_count,
                ..Default::default()
            });
            max_counts.push(tri.primitive_count);
        }

        let ty = match desc.level {
            AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        };

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let sizes = unsafe {
            self.acceleration.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_counts,
            )
        };

        let result = (|| -> Result<AccelerationStructure> {
            let (buffer, _) = self.create_buffer(
                sizes.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
                false,
            )?;
            let handle = unsafe {
                self.acceleration.create_acceleration_structure(
                    &vk::AccelerationStructureCreateInfoKHR::builder()
                        .buffer(buffer)
                        .size(sizes.acceleration_structure_size)
                        .ty(ty),
                    None,
                )
            };
            let handle = match handle {
                Ok(handle) => handle,
                Err(e) => {
                    self.destroy_buffer(buffer);
                    return Err(e.into());
                }
            };
            let structure = AccelerationStructure {
                handle,
                address: 0,
                level: desc.level,
                buffer,
            };

            let (scratch, scratch_address) = match self.create_buffer(
                sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                false,
            ) {
                Ok(scratch) => scratch,
                Err(e) => {
                    self.destroy_acceleration_structure(&structure);
                    return Err(e);
                }
            };
            staging.push(scratch);

            build_info.dst_acceleration_structure = handle;
            build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            };

            let built = self.submit_once(&mut |cmd| {
                unsafe {
                    self.acceleration.cmd_build_acceleration_structures(
                        cmd,
                        &[build_info],
                        &[&ranges],
                    );
                }
                Ok(())
            });
            if let Err(e) = built {
                self.destroy_acceleration_structure(&structure);
                return Err(e);
            }

            let address = unsafe {
                self.acceleration.get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                        .acceleration_structure(handle),
                )
            };
            Ok(AccelerationStructure {
                address,
                ..structure
            })
        })();

        for buffer in staging {
            self.destroy_buffer(buffer);
        }
        result
    }
}
