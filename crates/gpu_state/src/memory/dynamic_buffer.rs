//! Per-frame upload memory for data the GPU reads directly from the upload
//! heap (constants, dynamic vertices and indices).

use crate::{
    backend::{Backend, Device, UploadBuffer},
    error::{Error, Result},
    state::ResourceId,
};

use super::{linear_allocator::LinearAllocator, next_multiple_of};

/// Required placement of constant buffer data.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// Integer types usable as indices.
pub trait IndexElement: Copy + sealed::Sealed {
    const FORMAT: IndexFormat;
}

impl IndexElement for u16 {
    const FORMAT: IndexFormat = IndexFormat::U16;
}

impl IndexElement for u32 {
    const FORMAT: IndexFormat = IndexFormat::U32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u32,
    pub format: IndexFormat,
}

/// A sub-allocation of a dynamic buffer block.
#[derive(Debug)]
pub struct BufferAllocation<'a> {
    pub resource: ResourceId,
    /// Offset from the start of `resource`.
    pub offset: u64,
    pub gpu_address: u64,
    pub data: &'a mut [u8],
}

struct MemoryBlock<B: Backend> {
    allocator: LinearAllocator,
    // Declared after the allocator, which points into it.
    buffer: B::UploadBuffer,
}

impl<B: Backend> MemoryBlock<B> {
    fn new(device: &B::Device, size: u64) -> Result<Self> {
        let buffer = device.create_upload_buffer(size)?;
        // SAFETY: the mapping lives as long as `buffer`, which the block owns.
        let allocator = unsafe { LinearAllocator::new(buffer.size(), buffer.mapped_ptr()) };
        Ok(Self { allocator, buffer })
    }
}

/// Upload memory for one frame slot, made of one or more blocks.
///
/// A request that does not fit into any block gets a new block, twice as
/// large as the largest so far until the request fits. Blocks are never
/// released; [`Self::reset`] rewinds all of them once the GPU is done with
/// the frame.
pub struct DynamicBufferAllocator<B: Backend> {
    device: B::Device,
    blocks: Vec<MemoryBlock<B>>,
    block_size: u64,
}

impl<B: Backend> DynamicBufferAllocator<B> {
    pub fn new(device: &B::Device, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("dynamic buffer block size must be non-zero"));
        }

        Ok(Self {
            device: device.clone(),
            blocks: vec![MemoryBlock::new(device, block_size)?],
            block_size,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Size of the largest block.
    #[must_use]
    pub fn max_block_size(&self) -> u64 {
        self.block_size
    }

    pub fn alloc_buffer(&mut self, size: u64, align: u64) -> Result<BufferAllocation<'_>> {
        let index = match self
            .blocks
            .iter()
            .position(|block| block.allocator.can_fit(size, align))
        {
            Some(index) => index,
            None => {
                while self.block_size < size {
                    self.block_size *= 2;
                }

                log::debug!(
                    target: "gpu_state::memory",
                    "dynamic buffer allocation of {size} bytes does not fit, adding a {} byte block",
                    self.block_size
                );

                self.blocks.push(MemoryBlock::new(&self.device, self.block_size)?);
                self.blocks.len() - 1
            }
        };

        let block = &mut self.blocks[index];
        let resource = block.buffer.resource();
        let base_address = block.buffer.gpu_address();
        let (offset, data) = match block.allocator.allocate(size, align) {
            Ok(allocation) => allocation,
            Err(error) => unreachable!("block selected for the allocation cannot hold it: {error}"),
        };

        Ok(BufferAllocation {
            resource,
            offset,
            gpu_address: base_address + offset,
            data,
        })
    }

    fn upload<T: Copy>(&mut self, values: &[T], align: u64) -> Result<(u64, u64)> {
        let size = std::mem::size_of_val(values) as u64;
        let allocation = self.alloc_buffer(size, align)?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr().cast::<u8>(),
                allocation.data.as_mut_ptr(),
                size as usize,
            );
        }

        Ok((allocation.gpu_address, size))
    }

    /// Copies `value` into constant buffer memory.
    ///
    /// ## Returns
    ///
    /// The GPU address of the data.
    pub fn alloc_constant_buffer<T: Copy>(&mut self, value: &T) -> Result<u64> {
        let size = next_multiple_of(std::mem::size_of::<T>() as u64, CONSTANT_BUFFER_ALIGNMENT);
        let allocation = self.alloc_buffer(size, CONSTANT_BUFFER_ALIGNMENT)?;

        let (data, padding) = allocation.data.split_at_mut(std::mem::size_of::<T>());
        unsafe {
            std::ptr::copy_nonoverlapping(
                (value as *const T).cast::<u8>(),
                data.as_mut_ptr(),
                data.len(),
            );
        }
        padding.fill(0);

        Ok(allocation.gpu_address)
    }

    pub fn alloc_vertex_buffer<T: Copy>(&mut self, vertices: &[T]) -> Result<VertexBufferView> {
        let (gpu_address, size) = self.upload(vertices, std::mem::align_of::<T>().max(4) as u64)?;
        Ok(VertexBufferView {
            gpu_address,
            size_in_bytes: size as u32,
            stride_in_bytes: std::mem::size_of::<T>() as u32,
        })
    }

    pub fn alloc_index_buffer<I: IndexElement>(&mut self, indices: &[I]) -> Result<IndexBufferView> {
        let (gpu_address, size) = self.upload(indices, 4)?;
        Ok(IndexBufferView {
            gpu_address,
            size_in_bytes: size as u32,
            format: I::FORMAT,
        })
    }

    /// Copies `elements` into memory readable as a structured buffer with a
    /// stride of `size_of::<T>()`.
    ///
    /// ## Returns
    ///
    /// The GPU address of the first element.
    pub fn alloc_structured_buffer<T: Copy>(&mut self, elements: &[T]) -> Result<u64> {
        let align = std::mem::align_of::<T>().max(4) as u64;
        self.upload(elements, align).map(|(gpu_address, _)| gpu_address)
    }

    /// Rewinds every block. The GPU must be done with everything allocated
    /// since the last reset.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.allocator.clear();
        }
    }
}
