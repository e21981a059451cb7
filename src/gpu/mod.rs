pub mod host;
pub mod slot;

use bitflags::bitflags;

use crate::Result;

// The backend the crate is built against. The renderer core only talks to the
// trait surface below; swapping in a driver-backed implementation is a matter
// of changing these aliases.
pub type Device = host::Device;
pub type Stream = <host::Device as DeviceImpl>::Stream;
pub type Buffer = <host::Device as DeviceImpl>::Buffer;
pub type Array2D = <host::Device as DeviceImpl>::Array2D;
pub type Module = <host::Device as DeviceImpl>::Module;
pub type ProgramGroup = <host::Device as DeviceImpl>::ProgramGroup;
pub type Pipeline = <host::Device as DeviceImpl>::Pipeline;
pub type RtScene = <host::Device as DeviceImpl>::RtScene;
pub type GeometryInstance = <host::Device as DeviceImpl>::GeometryInstance;
pub type GeometryAccel = <host::Device as DeviceImpl>::GeometryAccel;
pub type InstanceAccel = <host::Device as DeviceImpl>::InstanceAccel;
pub type Denoiser = <host::Device as DeviceImpl>::Denoiser;
pub type ComputeModule = <host::Device as DeviceImpl>::ComputeModule;
pub type Kernel = <host::Device as DeviceImpl>::Kernel;

/// A raw device address.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
	pub const NULL: Self = Self(0);

	pub fn offset(&self, bytes: usize) -> Self {
		Self(self.0 + bytes as u64)
	}

	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}

/// An opaque traversable handle returned by acceleration-structure builds.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TraversableHandle(pub u64);

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ExceptionFlags: u32 {
		const STACK_OVERFLOW = 1 << 0;
		const TRACE_DEPTH = 1 << 1;
		const DEBUG = 1 << 2;
	}

	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct PrimitiveTypeFlags: u32 {
		const TRIANGLE = 1 << 0;
		const CUSTOM = 1 << 1;
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraversableGraph {
	/// Single-level instancing: one IAS over GASes.
	SingleLevelInstancing,
	SingleGas,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DebugLevel {
	None,
	Full,
}

pub struct PipelineOptions<'a> {
	pub num_payload_dwords: u32,
	pub num_attribute_dwords: u32,
	pub launch_params_name: &'a str,
	pub launch_params_size: usize,
	pub traversable_graph: TraversableGraph,
	pub exception_flags: ExceptionFlags,
	pub primitive_type_flags: PrimitiveTypeFlags,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DenoiserModel {
	Hdr,
	Ldr,
}

#[derive(Clone, Copy, Debug)]
pub struct DenoiserSizes {
	pub state_size: usize,
	pub scratch_size: usize,
	pub scratch_size_for_compute_intensity: usize,
	pub num_tasks: u32,
}

/// One tile of denoiser work, as reported by `DenoiserImpl::get_tasks`.
#[derive(Clone, Copy, Debug)]
pub struct DenoiserTask {
	pub input_offset_y: u32,
	pub output_offset_y: u32,
	pub output_height: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PixelFormat {
	Float2,
	Float4,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArrayElementType {
	Float32x4,
	UInt32x2,
}

impl ArrayElementType {
	pub fn size_in_bytes(&self) -> usize {
		match self {
			ArrayElementType::Float32x4 => 16,
			ArrayElementType::UInt32x2 => 8,
		}
	}
}

/// Sizes the acceleration-structure runtime reports for a build.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccelSizes {
	pub accel_size: usize,
	pub build_scratch_size: usize,
}

/// An entry of the instance buffer consumed by instance-AS builds.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct InstanceDescriptor {
	pub transform: [[f32; 4]; 3],
	pub instance_id: u32,
	pub visibility_mask: u32,
	pub sbt_offset: u32,
	pub traversable: TraversableHandle,
}

pub trait StreamImpl {
	/// Blocks until every operation enqueued on this stream has executed.
	fn synchronize(&self);
}

pub trait BufferImpl: Sized {
	fn size_in_bytes(&self) -> usize;
	fn device_pointer(&self) -> DevicePtr;
	/// Enqueues a host-to-device copy into `[offset, offset + data.len())`.
	fn write_bytes(&self, stream: &Stream, offset: usize, data: &[u8]);
	fn read_bytes(&self, offset: usize, length: usize) -> Vec<u8>;
}

pub trait Array2DImpl: Sized {
	fn width(&self) -> u32;
	fn height(&self) -> u32;
	fn surface_object(&self) -> DevicePtr;
	fn write_all(&self, data: &[u8]);
	fn read_all(&self) -> Vec<u8>;
	/// GL-interop acquire; a no-op for arrays that do not wrap a GL texture.
	fn begin_cuda_access(&self, stream: &Stream);
	fn end_cuda_access(&self, stream: &Stream);
}

pub trait PipelineImpl<D: DeviceImpl> {
	fn set_options(&self, options: &PipelineOptions);
	fn create_module_from_ptx(&self, ptx: &str) -> D::Module;
	fn create_ray_gen_program(&self, module: &D::Module, name: &str) -> D::ProgramGroup;
	fn create_miss_program(&self, module: Option<&D::Module>, name: Option<&str>) -> D::ProgramGroup;
	fn create_hit_program_group_for_triangle_is(
		&self,
		closest_hit: Option<(&D::Module, &str)>,
		any_hit: Option<(&D::Module, &str)>,
	) -> D::ProgramGroup;
	fn create_empty_hit_program_group(&self) -> D::ProgramGroup;
	fn create_callable_program_group(&self, module: &D::Module, name: &str) -> D::ProgramGroup;

	fn set_num_miss_ray_types(&self, count: u32);
	fn set_ray_generation_program(&self, program: &D::ProgramGroup);
	fn set_miss_program(&self, ray_type: u32, program: &D::ProgramGroup);

	fn link(&self, max_trace_depth: u32, debug_level: DebugLevel);
	fn set_num_callable_programs(&self, count: u32);
	fn set_callable_program(&self, index: u32, program: &D::ProgramGroup);

	/// One ray-generation record; the backing memory must stay mapped for the
	/// pipeline's lifetime.
	fn set_shader_binding_table(&self, buffer: &D::Buffer);
	fn set_scene(&self, scene: &D::RtScene);
	fn has_scene(&self) -> bool;
	fn set_hit_group_shader_binding_table(&self, buffer: &D::Buffer);

	fn launch(&self, stream: &Stream, params: DevicePtr, width: u32, height: u32, depth: u32);
}

pub trait RtSceneImpl<D: DeviceImpl> {
	fn create_geometry_instance(&self) -> D::GeometryInstance;
	fn create_geometry_accel(&self) -> D::GeometryAccel;
	fn create_instance_accel(&self) -> D::InstanceAccel;

	fn shader_binding_table_layout_is_ready(&self) -> bool;
	fn generate_shader_binding_table_layout(&self) -> usize;
}

pub trait GeometryInstanceImpl {
	fn set_triangle_buffers(
		&self,
		vertex_buffer: DevicePtr,
		vertex_count: u32,
		index_buffer: DevicePtr,
		triangle_count: u32,
	);
	fn set_user_data(&self, data: u32);
	/// Whether the hit groups with alpha testing are used for this geometry.
	fn set_uses_alpha(&self, uses_alpha: bool);
}

pub trait GeometryAccelImpl<D: DeviceImpl> {
	fn set_children(&self, children: &[D::GeometryInstance]);
	fn prepare_for_build(&self) -> AccelSizes;
	fn rebuild(&self, stream: &Stream, accel_mem: &D::Buffer, scratch: &D::Buffer) -> TraversableHandle;
	/// Refits the existing structure in place; only valid after a full build
	/// with an unchanged child topology.
	fn update(&self, stream: &Stream, scratch: &D::Buffer);
	fn handle(&self) -> TraversableHandle;
}

pub trait InstanceAccelImpl<D: DeviceImpl> {
	fn set_instances(&self, instance_buffer: DevicePtr, count: u32);
	fn prepare_for_build(&self) -> AccelSizes;
	fn rebuild(&self, stream: &Stream, accel_mem: &D::Buffer, scratch: &D::Buffer) -> TraversableHandle;
	fn handle(&self) -> TraversableHandle;
}

pub trait DenoiserImpl<D: DeviceImpl> {
	fn prepare(&self, width: u32, height: u32) -> DenoiserSizes;
	fn state_is_ready(&self) -> bool;
	fn setup_state(&self, stream: &Stream, state: &D::Buffer, scratch: &D::Buffer);
	fn get_tasks(&self) -> Vec<DenoiserTask>;
	fn compute_intensity(
		&self,
		stream: &Stream,
		color: &D::Buffer,
		format: PixelFormat,
		scratch: &D::Buffer,
		intensity: DevicePtr,
	);
	#[allow(clippy::too_many_arguments)]
	fn invoke(
		&self,
		stream: &Stream,
		intensity: DevicePtr,
		color: &D::Buffer,
		albedo: &D::Buffer,
		normal: &D::Buffer,
		denoised: &D::Buffer,
		task: &DenoiserTask,
	);
}

pub trait ComputeModuleImpl<D: DeviceImpl> {
	fn get_kernel(&self, name: &str, block_dim: (u32, u32, u32)) -> Result<D::Kernel>;
	/// Resolves a module-scope device symbol of the given size.
	fn get_global(&self, name: &str, size: usize) -> Result<D::Buffer>;
}

pub trait KernelImpl {
	fn block_dim(&self) -> (u32, u32, u32);
	/// Grid dimension covering `width` x `height` work items.
	fn calc_grid_dim(&self, width: u32, height: u32) -> (u32, u32, u32) {
		let block = self.block_dim();
		(width.div_ceil(block.0), height.div_ceil(block.1), 1)
	}
	fn launch(&self, stream: &Stream, grid_dim: (u32, u32, u32), params: &[u8]);
}

pub trait DeviceImpl: Sized + 'static {
	type Stream: StreamImpl;
	type Buffer: BufferImpl;
	type Array2D: Array2DImpl;
	type Module: Clone;
	type ProgramGroup: Clone;
	type Pipeline: PipelineImpl<Self>;
	type RtScene: RtSceneImpl<Self>;
	type GeometryInstance: GeometryInstanceImpl + Clone;
	type GeometryAccel: GeometryAccelImpl<Self>;
	type InstanceAccel: InstanceAccelImpl<Self>;
	type Denoiser: DenoiserImpl<Self>;
	type ComputeModule: ComputeModuleImpl<Self>;
	type Kernel: KernelImpl;

	fn new() -> Self;

	fn create_stream(&self) -> Self::Stream;
	fn create_buffer(&self, size: usize) -> Result<Self::Buffer>;
	fn create_array2d(&self, width: u32, height: u32, elem: ArrayElementType) -> Result<Self::Array2D>;
	fn create_array2d_from_gl_texture(&self, gl_tex_id: u32, width: u32, height: u32) -> Result<Self::Array2D>;
	fn create_pipeline(&self) -> Self::Pipeline;
	fn create_rt_scene(&self) -> Self::RtScene;
	fn create_denoiser(&self, model: DenoiserModel) -> Self::Denoiser;
	fn load_compute_module(&self, ptx: &str) -> Result<Self::ComputeModule>;
}

/// A typed view over an untyped device buffer.
pub struct TypedBuffer<T: Copy> {
	raw: Buffer,
	len: usize,
	_marker: std::marker::PhantomData<T>,
}

impl<T: Copy> TypedBuffer<T> {
	pub fn new(device: &Device, len: usize) -> Result<Self> {
		let raw = device.create_buffer(len.max(1) * std::mem::size_of::<T>())?;
		Ok(Self { raw, len, _marker: std::marker::PhantomData })
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn device_pointer(&self) -> DevicePtr {
		self.raw.device_pointer()
	}

	pub fn raw(&self) -> &Buffer {
		&self.raw
	}

	pub fn write_element(&self, stream: &Stream, index: usize, value: &T) {
		debug_assert!(index < self.len);
		self.raw.write_bytes(stream, index * std::mem::size_of::<T>(), as_u8_slice(value));
	}

	pub fn write_slice(&self, stream: &Stream, offset: usize, values: &[T]) {
		debug_assert!(offset + values.len() <= self.len);
		self.raw.write_bytes(stream, offset * std::mem::size_of::<T>(), slice_as_u8_slice(values));
	}

	pub fn read_element(&self, index: usize) -> T {
		debug_assert!(index < self.len);
		let size = std::mem::size_of::<T>();
		let bytes = self.raw.read_bytes(index * size, size);
		unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
	}

	pub fn read_all(&self) -> Vec<T> {
		(0..self.len).map(|i| self.read_element(i)).collect()
	}
}

/// Converts a Sized type to a u8 slice.
pub fn as_u8_slice<T: Sized>(p: &T) -> &[u8] {
	unsafe { std::slice::from_raw_parts((p as *const T) as *const u8, std::mem::size_of::<T>()) }
}

/// Converts a Sized slice to a u8 slice.
pub fn slice_as_u8_slice<T: Sized>(p: &[T]) -> &[u8] {
	unsafe { std::slice::from_raw_parts(p.as_ptr() as *const u8, std::mem::size_of::<T>() * p.len()) }
}
