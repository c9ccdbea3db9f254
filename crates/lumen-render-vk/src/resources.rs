// SPDX-License-Identifier: CEPL-1.0
//! Buffers, images and device memory.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, error};

use crate::context::GpuContext;
use crate::error::{RenderError, Result};

/// The one vertex format the pipeline accepts: a single 3-float position.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { position: [x, y, z] }
    }
}

pub const VERTEX_STRIDE: usize = std::mem::size_of::<Vertex>();

pub fn vertex_bytes(vertices: &[Vertex]) -> &[u8] {
    bytemuck::cast_slice(vertices)
}

/// Copy `vertices` into the front of a mapped range and return the byte count written.
pub(crate) fn write_vertices(dst: &mut [u8], vertices: &[Vertex]) -> usize {
    let src = vertex_bytes(vertices);
    dst[..src.len()].copy_from_slice(src);
    src.len()
}

/// Lowest-indexed memory type allowed by `type_bits` whose flags include all of `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = (props.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    props.memory_types[..count]
        .iter()
        .enumerate()
        .position(|(i, ty)| (type_bits & (1u32 << i)) != 0 && ty.property_flags.contains(required))
        .map(|i| i as u32)
        .ok_or_else(|| {
            let err = RenderError::NoSuitableMemoryType {
                type_bits,
                properties: required,
            };
            error!("{err}");
            err
        })
}

fn allocate_for(
    ctx: &GpuContext,
    req: vk::MemoryRequirements,
    props: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(ctx.memory_properties(), req.memory_type_bits, props)?;
    let mai = vk::MemoryAllocateInfo {
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    Ok(unsafe { ctx.device().allocate_memory(&mai, None)? })
}

/// A buffer with its own dedicated allocation, bound at offset 0.
pub struct GpuBuffer {
    ctx: Arc<GpuContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn new(
        ctx: Arc<GpuContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let bci = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { ctx.device().create_buffer(&bci, None)? };
        let mut buf = GpuBuffer {
            ctx: Arc::clone(&ctx),
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
        };

        let req = unsafe { ctx.device().get_buffer_memory_requirements(buffer) };
        buf.memory = allocate_for(&ctx, req, props)?;
        unsafe { ctx.device().bind_buffer_memory(buffer, buf.memory, 0)? };
        Ok(buf)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Map, hand the mapped bytes to `f`, unmap. Memory must be host-visible and coherent.
    pub fn with_mapped<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let device = self.ctx.device();
        let ptr = unsafe { device.map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())? };
        let mapped = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), self.size as usize) };
        let out = f(mapped);
        unsafe { device.unmap_memory(self.memory) };
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        unsafe {
            self.ctx.device().destroy_buffer(self.buffer, None);
            if self.memory != vk::DeviceMemory::null() {
                self.ctx.device().free_memory(self.memory, None);
            }
        }
        debug!("buffer destroyed ({} bytes)", self.size);
    }
}

/// A 2D, single-mip, optimally tiled image with its own allocation.
pub struct GpuImage {
    ctx: Arc<GpuContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl GpuImage {
    pub fn new(
        ctx: Arc<GpuContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let img_ci = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { ctx.device().create_image(&img_ci, None)? };
        let mut img = GpuImage {
            ctx: Arc::clone(&ctx),
            image,
            memory: vk::DeviceMemory::null(),
            format,
            extent,
        };

        let req = unsafe { ctx.device().get_image_memory_requirements(image) };
        img.memory = allocate_for(&ctx, req, props)?;
        unsafe { ctx.device().bind_image_memory(image, img.memory, 0)? };
        Ok(img)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        unsafe {
            self.ctx.device().destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                self.ctx.device().free_memory(self.memory, None);
            }
        }
        debug!("image destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn picks_lowest_index_satisfying_bits_and_flags() {
        let table = memory_table(&[
            DEVICE_LOCAL,
            HOST_VISIBLE,
            HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&table, 0b1111, HOST_VISIBLE | HOST_COHERENT).unwrap(), 2);
        assert_eq!(find_memory_type(&table, 0b1000, HOST_VISIBLE | HOST_COHERENT).unwrap(), 3);
        assert_eq!(find_memory_type(&table, 0b1111, DEVICE_LOCAL).unwrap(), 0);
    }

    #[test]
    fn requested_flags_must_all_be_present() {
        // A type that only shares some of the requested flags does not qualify.
        let table = memory_table(&[HOST_VISIBLE, DEVICE_LOCAL | HOST_COHERENT]);
        assert!(find_memory_type(&table, 0b11, HOST_VISIBLE | HOST_COHERENT).is_err());
    }

    #[test]
    fn not_found_is_a_typed_error() {
        let table = memory_table(&[DEVICE_LOCAL, HOST_VISIBLE | HOST_COHERENT]);
        let err = find_memory_type(&table, 0b01, HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoSuitableMemoryType { type_bits: 0b01, .. }
        ));
    }

    #[test]
    fn type_bits_beyond_type_count_are_ignored() {
        let table = memory_table(&[DEVICE_LOCAL]);
        assert!(find_memory_type(&table, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
        assert_eq!(
            find_memory_type(&table, 0b11, vk::MemoryPropertyFlags::empty()).unwrap(),
            0
        );
    }

    #[test]
    fn vertex_is_three_packed_floats() {
        assert_eq!(VERTEX_STRIDE, 3 * std::mem::size_of::<f32>());
    }

    #[test]
    fn mapped_vertex_bytes_read_back_in_order() {
        let vertices = [
            Vertex::new(0.0, -0.5, 0.0),
            Vertex::new(0.5, 0.5, 0.0),
            Vertex::new(-0.5, 0.5, 0.0),
            Vertex::new(0.25, 0.75, 1.0),
        ];
        // Stand-in for a host-visible mapping, larger than the payload.
        let mut mapping = vec![0xAAu8; vertices.len() * VERTEX_STRIDE + 16];
        let written = write_vertices(&mut mapping, &vertices);

        assert_eq!(written, vertices.len() * VERTEX_STRIDE);
        let read_back: Vec<Vertex> = mapping[..written]
            .chunks_exact(VERTEX_STRIDE)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(read_back, vertices);
        assert!(mapping[written..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn empty_vertex_slice_writes_nothing() {
        let mut mapping = [0u8; 4];
        assert_eq!(write_vertices(&mut mapping, &[]), 0);
        assert!(vertex_bytes(&[]).is_empty());
    }
}
