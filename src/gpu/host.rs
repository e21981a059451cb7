//! Host-memory reference backend.
//!
//! Implements the runtime interface without a driver: buffers are host
//! allocations with stream-ordered writes and readback, acceleration
//! structure builds compute their size requirements analytically, and
//! pipeline launches and kernel dispatches are recorded on the stream so
//! that frame sequences can be observed by tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::{Error, Result};

use super::{
	AccelSizes, ArrayElementType, Array2DImpl, BufferImpl, ComputeModuleImpl, DebugLevel,
	DenoiserImpl, DenoiserModel, DenoiserSizes, DenoiserTask, DeviceImpl, DevicePtr,
	GeometryAccelImpl, GeometryInstanceImpl, InstanceAccelImpl, KernelImpl, PipelineImpl,
	PipelineOptions, PixelFormat, RtSceneImpl, StreamImpl, TraversableHandle,
};

const SBT_RECORD_SIZE: usize = 64;
const SBT_NUM_RAY_TYPES: usize = 4;

#[derive(Clone)]
struct AddressSpace {
	next: Rc<Cell<u64>>,
}

impl AddressSpace {
	fn allocate(&self, size: usize) -> DevicePtr {
		let addr = self.next.get();
		self.next.set(addr + ((size as u64 + 255) & !255).max(256));
		DevicePtr(addr)
	}
}

pub struct Device {
	addresses: AddressSpace,
}

/// An operation submitted to a stream, kept for inspection.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamOp {
	PipelineLaunch {
		ray_generation: String,
		width: u32,
		height: u32,
		depth: u32,
	},
	KernelLaunch {
		name: String,
		grid_dim: (u32, u32, u32),
	},
	AccelBuild {
		top_level: bool,
	},
	DenoiserInvoke,
}

pub struct Stream {
	ops: Rc<RefCell<Vec<StreamOp>>>,
}

impl Stream {
	/// Drains the recorded operations, oldest first.
	pub fn take_ops(&self) -> Vec<StreamOp> {
		std::mem::take(&mut self.ops.borrow_mut())
	}

	fn record(&self, op: StreamOp) {
		self.ops.borrow_mut().push(op);
	}
}

impl StreamImpl for Stream {
	fn synchronize(&self) {}
}

#[derive(Clone)]
pub struct Buffer {
	ptr: DevicePtr,
	data: Rc<RefCell<Vec<u8>>>,
}

impl BufferImpl for Buffer {
	fn size_in_bytes(&self) -> usize {
		self.data.borrow().len()
	}

	fn device_pointer(&self) -> DevicePtr {
		self.ptr
	}

	fn write_bytes(&self, _stream: &Stream, offset: usize, data: &[u8]) {
		let mut storage = self.data.borrow_mut();
		assert!(offset + data.len() <= storage.len(), "buffer write out of range");
		storage[offset..offset + data.len()].copy_from_slice(data);
	}

	fn read_bytes(&self, offset: usize, length: usize) -> Vec<u8> {
		let storage = self.data.borrow();
		storage[offset..offset + length].to_vec()
	}
}

pub struct Array2D {
	width: u32,
	height: u32,
	surface: DevicePtr,
	data: Rc<RefCell<Vec<u8>>>,
	from_gl_texture: bool,
}

impl Array2DImpl for Array2D {
	fn width(&self) -> u32 {
		self.width
	}

	fn height(&self) -> u32 {
		self.height
	}

	fn surface_object(&self) -> DevicePtr {
		self.surface
	}

	fn write_all(&self, data: &[u8]) {
		let mut storage = self.data.borrow_mut();
		assert_eq!(storage.len(), data.len(), "array write size mismatch");
		storage.copy_from_slice(data);
	}

	fn read_all(&self) -> Vec<u8> {
		self.data.borrow().clone()
	}

	fn begin_cuda_access(&self, _stream: &Stream) {
		// Nothing to acquire without a live GL context.
		let _ = self.from_gl_texture;
	}

	fn end_cuda_access(&self, _stream: &Stream) {}
}

#[derive(Clone)]
pub struct Module {
	pub ptx_length: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProgramKind {
	RayGeneration,
	Miss,
	HitGroup,
	Callable,
}

#[derive(Clone)]
pub struct ProgramGroup {
	pub kind: ProgramKind,
	pub name: String,
}

struct PipelineState {
	linked: bool,
	num_miss_ray_types: u32,
	ray_generation: Option<ProgramGroup>,
	miss_programs: HashMap<u32, ProgramGroup>,
	num_callables: u32,
	callables: HashMap<u32, ProgramGroup>,
	sbt: Option<DevicePtr>,
	hit_group_sbt: Option<DevicePtr>,
	scene: Option<Rc<RefCell<RtSceneState>>>,
}

pub struct Pipeline {
	state: RefCell<PipelineState>,
}

impl PipelineImpl<Device> for Pipeline {
	fn set_options(&self, _options: &PipelineOptions) {}

	fn create_module_from_ptx(&self, ptx: &str) -> Module {
		Module { ptx_length: ptx.len() }
	}

	fn create_ray_gen_program(&self, _module: &Module, name: &str) -> ProgramGroup {
		ProgramGroup { kind: ProgramKind::RayGeneration, name: name.to_string() }
	}

	fn create_miss_program(&self, _module: Option<&Module>, name: Option<&str>) -> ProgramGroup {
		ProgramGroup {
			kind: ProgramKind::Miss,
			name: name.unwrap_or_default().to_string(),
		}
	}

	fn create_hit_program_group_for_triangle_is(
		&self,
		closest_hit: Option<(&Module, &str)>,
		any_hit: Option<(&Module, &str)>,
	) -> ProgramGroup {
		let name = match (closest_hit, any_hit) {
			(Some((_, ch)), Some((_, ah))) => format!("{}+{}", ch, ah),
			(Some((_, ch)), None) => ch.to_string(),
			(None, Some((_, ah))) => ah.to_string(),
			(None, None) => String::new(),
		};
		ProgramGroup { kind: ProgramKind::HitGroup, name }
	}

	fn create_empty_hit_program_group(&self) -> ProgramGroup {
		ProgramGroup { kind: ProgramKind::HitGroup, name: String::new() }
	}

	fn create_callable_program_group(&self, _module: &Module, name: &str) -> ProgramGroup {
		ProgramGroup { kind: ProgramKind::Callable, name: name.to_string() }
	}

	fn set_num_miss_ray_types(&self, count: u32) {
		self.state.borrow_mut().num_miss_ray_types = count;
	}

	fn set_ray_generation_program(&self, program: &ProgramGroup) {
		assert_eq!(program.kind, ProgramKind::RayGeneration);
		self.state.borrow_mut().ray_generation = Some(program.clone());
	}

	fn set_miss_program(&self, ray_type: u32, program: &ProgramGroup) {
		let mut state = self.state.borrow_mut();
		assert!(ray_type < state.num_miss_ray_types, "miss ray type out of range");
		state.miss_programs.insert(ray_type, program.clone());
	}

	fn link(&self, _max_trace_depth: u32, _debug_level: DebugLevel) {
		self.state.borrow_mut().linked = true;
	}

	fn set_num_callable_programs(&self, count: u32) {
		self.state.borrow_mut().num_callables = count;
	}

	fn set_callable_program(&self, index: u32, program: &ProgramGroup) {
		let mut state = self.state.borrow_mut();
		assert!(index < state.num_callables, "callable index out of range");
		state.callables.insert(index, program.clone());
	}

	fn set_shader_binding_table(&self, buffer: &Buffer) {
		self.state.borrow_mut().sbt = Some(buffer.device_pointer());
	}

	fn set_scene(&self, scene: &RtScene) {
		self.state.borrow_mut().scene = Some(scene.state.clone());
	}

	fn has_scene(&self) -> bool {
		self.state.borrow().scene.is_some()
	}

	fn set_hit_group_shader_binding_table(&self, buffer: &Buffer) {
		self.state.borrow_mut().hit_group_sbt = Some(buffer.device_pointer());
	}

	fn launch(&self, stream: &Stream, _params: DevicePtr, width: u32, height: u32, depth: u32) {
		let state = self.state.borrow();
		assert!(state.linked, "launching an unlinked pipeline");
		let ray_generation = state
			.ray_generation
			.as_ref()
			.map(|p| p.name.clone())
			.unwrap_or_default();
		stream.record(StreamOp::PipelineLaunch { ray_generation, width, height, depth });
	}
}

struct RtSceneState {
	geometry_accels: Vec<Rc<RefCell<GasState>>>,
	sbt_layout_ready: bool,
}

pub struct RtScene {
	state: Rc<RefCell<RtSceneState>>,
	addresses: AddressSpace,
}

impl RtSceneImpl<Device> for RtScene {
	fn create_geometry_instance(&self) -> GeometryInstance {
		GeometryInstance {
			state: Rc::new(RefCell::new(GeomInstState::default())),
		}
	}

	fn create_geometry_accel(&self) -> GeometryAccel {
		let gas = Rc::new(RefCell::new(GasState {
			children: Vec::new(),
			handle: TraversableHandle(0),
			built: false,
		}));
		let mut scene = self.state.borrow_mut();
		scene.geometry_accels.push(gas.clone());
		scene.sbt_layout_ready = false;
		GeometryAccel {
			state: gas,
			scene: self.state.clone(),
			addresses: self.addresses.clone(),
		}
	}

	fn create_instance_accel(&self) -> InstanceAccel {
		InstanceAccel {
			state: RefCell::new(IasState {
				instances: DevicePtr::NULL,
				count: 0,
				handle: TraversableHandle(0),
			}),
			addresses: self.addresses.clone(),
		}
	}

	fn shader_binding_table_layout_is_ready(&self) -> bool {
		self.state.borrow().sbt_layout_ready
	}

	fn generate_shader_binding_table_layout(&self) -> usize {
		let mut state = self.state.borrow_mut();
		state.sbt_layout_ready = true;
		let records: usize = state
			.geometry_accels
			.iter()
			.map(|gas| gas.borrow().children.len() * SBT_NUM_RAY_TYPES)
			.sum();
		records.max(1) * SBT_RECORD_SIZE
	}
}

#[derive(Default)]
struct GeomInstState {
	vertex_buffer: DevicePtr,
	vertex_count: u32,
	index_buffer: DevicePtr,
	triangle_count: u32,
	user_data: u32,
	uses_alpha: bool,
}

#[derive(Clone)]
pub struct GeometryInstance {
	state: Rc<RefCell<GeomInstState>>,
}

impl GeometryInstanceImpl for GeometryInstance {
	fn set_triangle_buffers(
		&self,
		vertex_buffer: DevicePtr,
		vertex_count: u32,
		index_buffer: DevicePtr,
		triangle_count: u32,
	) {
		let mut state = self.state.borrow_mut();
		state.vertex_buffer = vertex_buffer;
		state.vertex_count = vertex_count;
		state.index_buffer = index_buffer;
		state.triangle_count = triangle_count;
	}

	fn set_user_data(&self, data: u32) {
		self.state.borrow_mut().user_data = data;
	}

	fn set_uses_alpha(&self, uses_alpha: bool) {
		self.state.borrow_mut().uses_alpha = uses_alpha;
	}
}

struct GasState {
	children: Vec<GeometryInstance>,
	handle: TraversableHandle,
	built: bool,
}

pub struct GeometryAccel {
	state: Rc<RefCell<GasState>>,
	scene: Rc<RefCell<RtSceneState>>,
	addresses: AddressSpace,
}

impl GeometryAccelImpl<Device> for GeometryAccel {
	fn set_children(&self, children: &[GeometryInstance]) {
		let mut state = self.state.borrow_mut();
		state.children = children.to_vec();
		state.built = false;
		self.scene.borrow_mut().sbt_layout_ready = false;
	}

	fn prepare_for_build(&self) -> AccelSizes {
		let triangles: u32 = self
			.state
			.borrow()
			.children
			.iter()
			.map(|c| c.state.borrow().triangle_count)
			.sum();
		AccelSizes {
			accel_size: 256 + 128 * triangles as usize,
			build_scratch_size: 256 + 64 * triangles as usize,
		}
	}

	fn rebuild(&self, stream: &Stream, accel_mem: &Buffer, scratch: &Buffer) -> TraversableHandle {
		let sizes = self.prepare_for_build();
		assert!(accel_mem.size_in_bytes() >= sizes.accel_size, "GAS memory too small");
		assert!(scratch.size_in_bytes() >= sizes.build_scratch_size, "GAS scratch too small");
		let mut state = self.state.borrow_mut();
		state.handle = TraversableHandle(self.addresses.allocate(sizes.accel_size).0);
		state.built = true;
		stream.record(StreamOp::AccelBuild { top_level: false });
		state.handle
	}

	fn update(&self, stream: &Stream, _scratch: &Buffer) {
		assert!(self.state.borrow().built, "refitting an unbuilt GAS");
		stream.record(StreamOp::AccelBuild { top_level: false });
	}

	fn handle(&self) -> TraversableHandle {
		self.state.borrow().handle
	}
}

struct IasState {
	instances: DevicePtr,
	count: u32,
	handle: TraversableHandle,
}

pub struct InstanceAccel {
	state: RefCell<IasState>,
	addresses: AddressSpace,
}

impl InstanceAccelImpl<Device> for InstanceAccel {
	fn set_instances(&self, instance_buffer: DevicePtr, count: u32) {
		let mut state = self.state.borrow_mut();
		state.instances = instance_buffer;
		state.count = count;
	}

	fn prepare_for_build(&self) -> AccelSizes {
		let count = self.state.borrow().count as usize;
		AccelSizes {
			accel_size: 256 + 128 * count,
			build_scratch_size: 256 + 64 * count,
		}
	}

	fn rebuild(&self, stream: &Stream, accel_mem: &Buffer, scratch: &Buffer) -> TraversableHandle {
		let sizes = self.prepare_for_build();
		assert!(accel_mem.size_in_bytes() >= sizes.accel_size, "IAS memory too small");
		assert!(scratch.size_in_bytes() >= sizes.build_scratch_size, "IAS scratch too small");
		let mut state = self.state.borrow_mut();
		state.handle = TraversableHandle(self.addresses.allocate(sizes.accel_size).0);
		stream.record(StreamOp::AccelBuild { top_level: true });
		state.handle
	}

	fn handle(&self) -> TraversableHandle {
		self.state.borrow().handle
	}
}

struct DenoiserState {
	prepared: Cell<Option<(u32, u32)>>,
	state_ready: Cell<bool>,
}

pub struct Denoiser {
	state: DenoiserState,
}

impl DenoiserImpl<Device> for Denoiser {
	fn prepare(&self, width: u32, height: u32) -> DenoiserSizes {
		self.state.prepared.set(Some((width, height)));
		self.state.state_ready.set(false);
		let pixels = (width as usize * height as usize).max(1);
		DenoiserSizes {
			state_size: pixels * 4,
			scratch_size: pixels * 8,
			scratch_size_for_compute_intensity: 1024,
			num_tasks: 1,
		}
	}

	fn state_is_ready(&self) -> bool {
		self.state.state_ready.get()
	}

	fn setup_state(&self, _stream: &Stream, _state: &Buffer, _scratch: &Buffer) {
		assert!(self.state.prepared.get().is_some(), "denoiser state setup before prepare");
		self.state.state_ready.set(true);
	}

	fn get_tasks(&self) -> Vec<DenoiserTask> {
		let (_, height) = self.state.prepared.get().expect("denoiser tasks before prepare");
		vec![DenoiserTask { input_offset_y: 0, output_offset_y: 0, output_height: height }]
	}

	fn compute_intensity(
		&self,
		_stream: &Stream,
		_color: &Buffer,
		_format: PixelFormat,
		_scratch: &Buffer,
		_intensity: DevicePtr,
	) {
	}

	fn invoke(
		&self,
		stream: &Stream,
		_intensity: DevicePtr,
		color: &Buffer,
		_albedo: &Buffer,
		_normal: &Buffer,
		denoised: &Buffer,
		_task: &DenoiserTask,
	) {
		// Identity denoise: pass the noisy color through.
		let bytes = color.read_bytes(0, color.size_in_bytes().min(denoised.size_in_bytes()));
		denoised.write_bytes(stream, 0, &bytes);
		stream.record(StreamOp::DenoiserInvoke);
	}
}

pub struct ComputeModule {
	globals: RefCell<HashMap<String, Buffer>>,
	addresses: AddressSpace,
}

impl ComputeModuleImpl<Device> for ComputeModule {
	fn get_kernel(&self, name: &str, block_dim: (u32, u32, u32)) -> Result<Kernel> {
		Ok(Kernel { name: name.to_string(), block_dim })
	}

	fn get_global(&self, name: &str, size: usize) -> Result<Buffer> {
		let mut globals = self.globals.borrow_mut();
		if let Some(existing) = globals.get(name) {
			return Ok(existing.clone());
		}
		let buffer = Buffer {
			ptr: self.addresses.allocate(size),
			data: Rc::new(RefCell::new(vec![0u8; size])),
		};
		globals.insert(name.to_string(), buffer.clone());
		Ok(buffer)
	}
}

pub struct Kernel {
	name: String,
	block_dim: (u32, u32, u32),
}

impl KernelImpl for Kernel {
	fn block_dim(&self) -> (u32, u32, u32) {
		self.block_dim
	}

	fn launch(&self, stream: &Stream, grid_dim: (u32, u32, u32), _params: &[u8]) {
		stream.record(StreamOp::KernelLaunch { name: self.name.clone(), grid_dim });
	}
}

impl DeviceImpl for Device {
	type Stream = Stream;
	type Buffer = Buffer;
	type Array2D = Array2D;
	type Module = Module;
	type ProgramGroup = ProgramGroup;
	type Pipeline = Pipeline;
	type RtScene = RtScene;
	type GeometryInstance = GeometryInstance;
	type GeometryAccel = GeometryAccel;
	type InstanceAccel = InstanceAccel;
	type Denoiser = Denoiser;
	type ComputeModule = ComputeModule;
	type Kernel = Kernel;

	fn new() -> Self {
		Self {
			addresses: AddressSpace { next: Rc::new(Cell::new(256)) },
		}
	}

	fn create_stream(&self) -> Stream {
		Stream { ops: Rc::new(RefCell::new(Vec::new())) }
	}

	fn create_buffer(&self, size: usize) -> Result<Buffer> {
		if size == 0 {
			return Err(Error::FatalRuntime("zero-sized buffer".to_string()));
		}
		Ok(Buffer {
			ptr: self.addresses.allocate(size),
			data: Rc::new(RefCell::new(vec![0u8; size])),
		})
	}

	fn create_array2d(&self, width: u32, height: u32, elem: ArrayElementType) -> Result<Array2D> {
		let size = width as usize * height as usize * elem.size_in_bytes();
		Ok(Array2D {
			width,
			height,
			surface: self.addresses.allocate(size.max(1)),
			data: Rc::new(RefCell::new(vec![0u8; size])),
			from_gl_texture: false,
		})
	}

	fn create_array2d_from_gl_texture(&self, _gl_tex_id: u32, width: u32, height: u32) -> Result<Array2D> {
		let size = width as usize * height as usize * ArrayElementType::Float32x4.size_in_bytes();
		Ok(Array2D {
			width,
			height,
			surface: self.addresses.allocate(size.max(1)),
			data: Rc::new(RefCell::new(vec![0u8; size])),
			from_gl_texture: true,
		})
	}

	fn create_pipeline(&self) -> Pipeline {
		Pipeline {
			state: RefCell::new(PipelineState {
				linked: false,
				num_miss_ray_types: 0,
				ray_generation: None,
				miss_programs: HashMap::new(),
				num_callables: 0,
				callables: HashMap::new(),
				sbt: None,
				hit_group_sbt: None,
				scene: None,
			}),
		}
	}

	fn create_rt_scene(&self) -> RtScene {
		RtScene {
			state: Rc::new(RefCell::new(RtSceneState {
				geometry_accels: Vec::new(),
				sbt_layout_ready: false,
			})),
			addresses: self.addresses.clone(),
		}
	}

	fn create_denoiser(&self, _model: DenoiserModel) -> Denoiser {
		Denoiser {
			state: DenoiserState {
				prepared: Cell::new(None),
				state_ready: Cell::new(false),
			},
		}
	}

	fn load_compute_module(&self, _ptx: &str) -> Result<ComputeModule> {
		Ok(ComputeModule {
			globals: RefCell::new(HashMap::new()),
			addresses: self.addresses.clone(),
		})
	}
}
