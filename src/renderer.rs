//! The renderer context: descriptor pools, per-algorithm pipelines, frame
//! buffers, the light-vertex cache and the per-frame launch sequence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rand::{Rng, RngCore, SeedableRng};
use slotmap::SlotMap;

use crate::camera::{self, Camera, CameraClassTable};
use crate::color::{self, ColorSpace, SpectrumType, WavelengthSamples};
use crate::gpu::slot::SlotBuffer;
use crate::gpu::{
	self, Array2DImpl, ArrayElementType, Buffer, BufferImpl, ComputeModuleImpl, DebugLevel,
	Denoiser, DenoiserImpl, DenoiserModel, DenoiserTask, Device, DeviceImpl, DevicePtr, Kernel,
	KernelImpl, Module, PipelineImpl, PipelineOptions, PixelFormat, ProgramGroup, Stream,
	TypedBuffer,
};
use crate::image::{DataFormat, LinearImage2D};
use crate::material::{self, MaterialClassTable, ProcedureSetPools, SurfaceMaterial, SurfaceMaterialKind};
use crate::object::{
	CameraHandle, ImageHandle, MaterialHandle, OwnedParamValue, ParamValue, Plug, ShaderNodeHandle,
};
use crate::scene::{
	initialize_geometry_programs, GeometryClassTable, Scene, SceneKernels, SceneSubsystems,
};
use crate::shader_nodes::{
	self, NodeDescriptorPools, ShaderNode, ShaderNodeClassTable, ShaderNodeKind,
};
use crate::shared::{self, ShaderNodePlugType};
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ModuleKind {
	LightTransport,
	ShaderNode,
	Material,
	Geometry,
	Camera,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RendererKind {
	PathTracing,
	LightTracing,
	Bpt,
	DebugRendering,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum DebugRenderingAttribute {
	BaseColor = 0,
	GeometricNormal,
	ShadingTangent,
	ShadingBitangent,
	ShadingNormal,
	TextureCoordinates,
	ShadingFrameLengths,
	ShadingFrameOrthogonality,
	DenoiserAlbedo,
	DenoiserNormal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ContextState {
	Uninitialized,
	OutputBound,
	SceneBound,
}

const COMMON_MODULES: [(ModuleKind, &str); 4] = [
	(ModuleKind::ShaderNode, "shader_nodes.ptx"),
	(ModuleKind::Material, "materials.ptx"),
	(ModuleKind::Geometry, "geometries.ptx"),
	(ModuleKind::Camera, "cameras.ptx"),
];

const LIGHT_VERTICES_PER_PATH: u32 = 10;

fn read_txt_file(path: &Path) -> Result<String> {
	std::fs::read_to_string(path).map_err(|e| {
		log::error!("failed to read {}: {}", path.display(), e);
		Error::IoError(format!("{}: {}", path.display(), e))
	})
}

/// Per-algorithm pipeline state: the pipeline, its modules, the shared
/// callable list and both shader binding tables.
struct PipelineRecord {
	pipeline: gpu::Pipeline,
	modules: HashMap<ModuleKind, Module>,
	callables: Vec<ProgramGroup>,
	programs: Vec<ProgramGroup>,
	ray_generation_sbt: Buffer,
	hit_group_sbt: Option<Buffer>,
}

impl PipelineRecord {
	fn new(
		device: &Device,
		ptx_dir: &Path,
		light_transport_ptx: &str,
		num_miss_ray_types: u32,
		num_payload_dwords: u32,
	) -> Result<Self> {
		let pipeline = device.create_pipeline();
		pipeline.set_options(&PipelineOptions {
			num_payload_dwords,
			num_attribute_dwords: 2,
			launch_params_name: "plp",
			launch_params_size: std::mem::size_of::<shared::PipelineLaunchParameters>(),
			traversable_graph: gpu::TraversableGraph::SingleLevelInstancing,
			exception_flags: gpu::ExceptionFlags::STACK_OVERFLOW,
			primitive_type_flags: gpu::PrimitiveTypeFlags::TRIANGLE,
		});
		pipeline.set_num_miss_ray_types(num_miss_ray_types);

		let mut modules = HashMap::new();
		let lt_source = read_txt_file(&ptx_dir.join(light_transport_ptx))?;
		modules.insert(ModuleKind::LightTransport, pipeline.create_module_from_ptx(&lt_source));
		for (kind, file) in COMMON_MODULES {
			let source = read_txt_file(&ptx_dir.join(file))?;
			modules.insert(kind, pipeline.create_module_from_ptx(&source));
		}

		let ray_generation_sbt = device.create_buffer(64)?;
		pipeline.set_shader_binding_table(&ray_generation_sbt);

		Ok(Self {
			pipeline,
			modules,
			callables: Vec::new(),
			programs: Vec::new(),
			ray_generation_sbt,
			hit_group_sbt: None,
		})
	}

	fn module(&self, kind: ModuleKind) -> &Module {
		&self.modules[&kind]
	}

	fn keep(&mut self, program: ProgramGroup) -> ProgramGroup {
		self.programs.push(program.clone());
		program
	}

	fn finish_link(&self, max_trace_depth: u32) {
		self.pipeline.link(max_trace_depth, DebugLevel::None);
		self.pipeline.set_num_callable_programs(self.callables.len() as u32);
		for (i, callable) in self.callables.iter().enumerate() {
			self.pipeline.set_callable_program(i as u32, callable);
		}
	}

	/// Grows the hit-group SBT to at least `required_size` and re-attaches
	/// the scene association when the layout moved.
	fn bind_scene(
		&mut self,
		device: &Device,
		scene: &Scene,
		required_size: usize,
		layout_was_up_to_date: bool,
	) -> Result<()> {
		let needs_realloc = self
			.hit_group_sbt
			.as_ref()
			.map(|sbt| sbt.size_in_bytes() < required_size)
			.unwrap_or(true);
		if needs_realloc {
			self.hit_group_sbt = Some(device.create_buffer(required_size.max(64))?);
		}
		if !layout_was_up_to_date || !self.pipeline.has_scene() {
			self.pipeline.set_scene(scene.rt_scene());
			self.pipeline
				.set_hit_group_shader_binding_table(self.hit_group_sbt.as_ref().unwrap());
		}
		Ok(())
	}
}

struct LvcBptState {
	light_path_ray_gen: ProgramGroup,
	eye_path_ray_gen: ProgramGroup,
	rng: rand::rngs::StdRng,
}

struct PostProcessKernels {
	reset_atomic_accum_buffer: Kernel,
	accumulate_from_atomic_accum_buffer: Kernel,
	copy_buffers: Kernel,
	convert_to_rgb: Kernel,
	launch_params_global: Buffer,
}

#[repr(C)]
struct ResetAtomicAccumParams {
	atomic_accum_buffer: DevicePtr,
	image_size: [u32; 2],
	image_stride_in_pixels: u32,
}

#[repr(C)]
struct AccumulateParams {
	atomic_accum_buffer: DevicePtr,
	accum_buffer: DevicePtr,
	image_size: [u32; 2],
	image_stride_in_pixels: u32,
	first_frame: u32,
}

#[repr(C)]
struct CopyBuffersParams {
	accum_buffer: DevicePtr,
	accum_albedo_buffer: DevicePtr,
	accum_normal_buffer: DevicePtr,
	inv_camera_orientation: [f32; 4],
	image_size: [u32; 2],
	image_stride_in_pixels: u32,
	num_accum_frames: u32,
	linear_color_buffer: DevicePtr,
	linear_albedo_buffer: DevicePtr,
	linear_normal_buffer: DevicePtr,
}

#[repr(C)]
struct ConvertToRgbParams {
	accum_buffer: DevicePtr,
	linear_denoised_color_buffer: DevicePtr,
	linear_albedo_buffer: DevicePtr,
	linear_normal_buffer: DevicePtr,
	denoise: u32,
	debug_render: u32,
	debug_attribute: u32,
	image_size: [u32; 2],
	image_stride_in_pixels: u32,
	num_accum_frames: u32,
	render_target: DevicePtr,
}

pub struct Context {
	device: Device,
	default_stream: Stream,

	// Descriptor pools.
	node_pools: NodeDescriptorPools,
	procedure_pools: ProcedureSetPools,
	material_descriptors: SlotBuffer<shared::SurfaceMaterialDescriptor>,

	// Queryable-object arenas.
	shader_nodes: SlotMap<ShaderNodeHandle, ShaderNode>,
	materials: SlotMap<MaterialHandle, SurfaceMaterial>,
	images: SlotMap<ImageHandle, LinearImage2D>,
	cameras: SlotMap<CameraHandle, Camera>,

	dirty_shader_nodes: HashSet<ShaderNodeHandle>,
	dirty_materials: HashSet<MaterialHandle>,

	// Class tables.
	node_table: ShaderNodeClassTable,
	material_table: MaterialClassTable,
	camera_table: CameraClassTable,
	geometry_programs: GeometryClassTable,
	geometry_node: ShaderNodeHandle,
	null_image_2d: ImageHandle,
	null_image_env: ImageHandle,

	// Pipelines.
	path_tracing: PipelineRecord,
	light_tracing: PipelineRecord,
	lvc_bpt: PipelineRecord,
	lvc_bpt_state: LvcBptState,
	aux_buffer_generator: PipelineRecord,
	debug_rendering: PipelineRecord,

	scene_kernels: SceneKernels,
	post_process: PostProcessKernels,

	launch_params: shared::PipelineLaunchParameters,
	launch_params_buffer: Buffer,

	// Output binding.
	width: u32,
	height: u32,
	use_gl_texture: bool,
	output_buffer: Option<gpu::Array2D>,
	accum_buffer: Option<gpu::Array2D>,
	rng_buffer: Option<gpu::Array2D>,
	atomic_accum_buffer: Option<TypedBuffer<[f32; 4]>>,
	accum_albedo_buffer: Option<TypedBuffer<[f32; 4]>>,
	accum_normal_buffer: Option<TypedBuffer<[f32; 4]>>,
	linear_color_buffer: Option<TypedBuffer<[f32; 4]>>,
	linear_albedo_buffer: Option<TypedBuffer<[f32; 4]>>,
	linear_normal_buffer: Option<TypedBuffer<[f32; 4]>>,
	linear_denoised_color_buffer: Option<TypedBuffer<[f32; 4]>>,

	denoiser: Denoiser,
	denoiser_state_buffer: Option<Buffer>,
	denoiser_scratch_buffer: Option<Buffer>,
	denoiser_tasks: Vec<DenoiserTask>,
	hdr_intensity: Buffer,

	num_light_paths: u32,
	linear_rng_buffer: TypedBuffer<shared::KernelRng>,
	light_vertex_cache: TypedBuffer<shared::LightPathVertex>,
	num_light_vertices: Buffer,

	as_scratch_mem: Option<Buffer>,

	state: ContextState,
	bound_scene_id: Option<u32>,
	num_accum_frames: u32,
	probe_pixel: (u32, u32),
	renderer: RendererKind,
	debug_attribute: DebugRenderingAttribute,
}

impl Context {
	pub fn new(ptx_dir: &Path, num_light_paths: u32) -> Result<Self> {
		if num_light_paths == 0 {
			return Err(Error::InvalidArgument("num_light_paths must be non-zero".to_string()));
		}
		let ptx_dir: PathBuf = ptx_dir.to_path_buf();
		log::info!("initializing renderer context");

		let device = Device::new();
		let default_stream = device.create_stream();

		let mut node_pools = NodeDescriptorPools::new(&device)?;
		let mut procedure_pools = ProcedureSetPools::new(&device)?;
		let material_descriptors = SlotBuffer::new(&device, 8192)?;

		let mut path_tracing = PipelineRecord::new(&device, &ptx_dir, "path_tracing.ptx", 2, 14)?;
		let mut light_tracing = PipelineRecord::new(&device, &ptx_dir, "light_tracing.ptx", 2, 14)?;
		let mut lvc_bpt = PipelineRecord::new(&device, &ptx_dir, "lvc_bpt.ptx", 3, 16)?;
		let mut aux_buffer_generator =
			PipelineRecord::new(&device, &ptx_dir, "aux_buffer_generator.ptx", 1, 10)?;
		let mut debug_rendering = PipelineRecord::new(&device, &ptx_dir, "debug_rendering.ptx", 1, 8)?;

		// Path tracing programs.
		{
			let p = &mut path_tracing;
			let module = p.module(ModuleKind::LightTransport).clone();
			let ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "pathTracing"));
			let miss = p.keep(p.pipeline.create_miss_program(Some(&module), Some("pathTracingMiss")));
			let shadow_miss = p.keep(p.pipeline.create_miss_program(None, None));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "pathTracingIteration")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "pathTracingIteration")),
				Some((&module, "pathTracingAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitDefault")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_empty_hit_program_group());
			p.pipeline.set_ray_generation_program(&ray_gen);
			p.pipeline.set_miss_program(0, &miss);
			p.pipeline.set_miss_program(1, &shadow_miss);
		}

		// Light tracing programs.
		{
			let p = &mut light_tracing;
			let module = p.module(ModuleKind::LightTransport).clone();
			let ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "lightTracing"));
			let miss = p.keep(p.pipeline.create_miss_program(None, None));
			let shadow_miss = p.keep(p.pipeline.create_miss_program(None, None));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lightTracingIteration")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lightTracingIteration")),
				Some((&module, "lightTracingAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitDefault")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_empty_hit_program_group());
			p.pipeline.set_ray_generation_program(&ray_gen);
			p.pipeline.set_miss_program(0, &miss);
			p.pipeline.set_miss_program(1, &shadow_miss);
		}

		// LVC-BPT programs; the ray generation alternates between the light
		// and eye passes each frame.
		let lvc_bpt_state;
		{
			let p = &mut lvc_bpt;
			let module = p.module(ModuleKind::LightTransport).clone();
			let light_path_ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "lvcbptLightPath"));
			let eye_path_ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "lvcbptEyePath"));
			let light_miss = p.keep(p.pipeline.create_miss_program(None, None));
			let eye_miss = p.keep(p.pipeline.create_miss_program(Some(&module), Some("lvcbptEyePathMiss")));
			let connection_miss = p.keep(p.pipeline.create_miss_program(None, None));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lvcbptLightPath")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lvcbptLightPath")),
				Some((&module, "lvcbptAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lvcbptEyePath")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "lvcbptEyePath")),
				Some((&module, "lvcbptAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitDefault")),
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				None,
				Some((&module, "shadowAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_empty_hit_program_group());
			p.pipeline.set_miss_program(0, &light_miss);
			p.pipeline.set_miss_program(1, &eye_miss);
			p.pipeline.set_miss_program(2, &connection_miss);
			lvc_bpt_state = LvcBptState {
				light_path_ray_gen,
				eye_path_ray_gen,
				rng: rand::rngs::StdRng::seed_from_u64(1731230721),
			};
		}

		// Aux-buffer generator programs.
		{
			let p = &mut aux_buffer_generator;
			let module = p.module(ModuleKind::LightTransport).clone();
			let ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "auxBufferGenerator"));
			let miss = p.keep(p.pipeline.create_miss_program(Some(&module), Some("auxBufferGeneratorMiss")));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "auxBufferGeneratorFirstHit")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "auxBufferGeneratorFirstHit")),
				Some((&module, "auxBufferGeneratorAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_empty_hit_program_group());
			p.pipeline.set_ray_generation_program(&ray_gen);
			p.pipeline.set_miss_program(0, &miss);
		}

		// Debug rendering programs.
		{
			let p = &mut debug_rendering;
			let module = p.module(ModuleKind::LightTransport).clone();
			let ray_gen = p.keep(p.pipeline.create_ray_gen_program(&module, "debugRenderingRayGeneration"));
			let miss = p.keep(p.pipeline.create_miss_program(Some(&module), Some("debugRenderingMiss")));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "debugRenderingClosestHit")),
				None,
			));
			p.keep(p.pipeline.create_hit_program_group_for_triangle_is(
				Some((&module, "debugRenderingClosestHit")),
				Some((&module, "debugRenderingAnyHitWithAlpha")),
			));
			p.keep(p.pipeline.create_empty_hit_program_group());
			p.pipeline.set_ray_generation_program(&ray_gen);
			p.pipeline.set_miss_program(0, &miss);
		}

		// Callable registration. Every callable lands at the same index in
		// every pipeline, so descriptors are pipeline-agnostic; linking
		// happens only after all classes have registered.
		let (node_table, material_table, camera_table, geometry_programs);
		{
			let mut records = [
				&mut path_tracing,
				&mut light_tracing,
				&mut lvc_bpt,
				&mut aux_buffer_generator,
				&mut debug_rendering,
			];
			let mut register = |module_kind: ModuleKind, name: &str| -> u32 {
				let index = records[0].callables.len() as u32;
				for record in records.iter_mut() {
					debug_assert_eq!(record.callables.len() as u32, index);
					let program = record
						.pipeline
						.create_callable_program_group(&record.modules[&module_kind], name);
					record.callables.push(program);
				}
				index
			};

			node_table = shader_nodes_initialize(&mut register, &mut node_pools, &default_stream)?;
			material_table = material::initialize(&mut register, &mut procedure_pools, &default_stream)?;
			camera_table = camera::initialize(&mut register, &mut procedure_pools, &default_stream)?;
			geometry_programs = initialize_geometry_programs(&mut register);
		}

		path_tracing.finish_link(2);
		light_tracing.finish_link(2);
		lvc_bpt.finish_link(2);
		aux_buffer_generator.finish_link(1);
		debug_rendering.finish_link(1);

		// Kernels of the scene-setup and post-process modules.
		let setup_scene_module = device.load_compute_module(&read_txt_file(&ptx_dir.join("setup_scene.ptx"))?)?;
		let scene_kernels = SceneKernels {
			compute_instance_aabbs: setup_scene_module.get_kernel("computeInstanceAABBs", (32, 1, 1))?,
			finalize_instance_aabbs: setup_scene_module.get_kernel("finalizeInstanceAABBs", (32, 1, 1))?,
			compute_scene_aabb: setup_scene_module.get_kernel("computeSceneAABB", (256, 1, 1))?,
			finalize_scene_bounds: setup_scene_module.get_kernel("finalizeSceneBounds", (32, 1, 1))?,
		};
		let post_process_module = device.load_compute_module(&read_txt_file(&ptx_dir.join("post_process.ptx"))?)?;
		let post_process = PostProcessKernels {
			reset_atomic_accum_buffer: post_process_module.get_kernel("resetAtomicAccumBuffer", (8, 8, 1))?,
			accumulate_from_atomic_accum_buffer: post_process_module
				.get_kernel("accumulateFromAtomicAccumBuffer", (8, 8, 1))?,
			copy_buffers: post_process_module.get_kernel("copyBuffers", (32, 1, 1))?,
			convert_to_rgb: post_process_module.get_kernel("convertToRGB", (32, 1, 1))?,
			launch_params_global: post_process_module
				.get_global("plp", std::mem::size_of::<shared::PipelineLaunchParameters>())?,
		};

		// Paired with finalize_color_system in Drop.
		color::init_color_system();

		// Launch parameters and their device copy.
		let mut launch_params = shared::PipelineLaunchParameters {
			node_procedure_set_buffer: node_pools.node_procedure_sets.device_pointer(),
			small_node_descriptor_buffer: node_pools.small.device_pointer(),
			medium_node_descriptor_buffer: node_pools.medium.device_pointer(),
			large_node_descriptor_buffer: node_pools.large.device_pointer(),
			bsdf_procedure_set_buffer: procedure_pools.bsdf.device_pointer(),
			edf_procedure_set_buffer: procedure_pools.edf.device_pointer(),
			idf_procedure_set_buffer: procedure_pools.idf.device_pointer(),
			material_descriptor_buffer: material_descriptors.device_pointer(),
			num_light_paths,
			..Default::default()
		};
		let tables = color::cmf_tables();
		launch_params.discretized_spectrum_xbar = tables.xbar;
		launch_params.discretized_spectrum_ybar = tables.ybar;
		launch_params.discretized_spectrum_zbar = tables.zbar;
		launch_params.discretized_spectrum_integral_cmf = tables.integral_cmf;

		let launch_params_buffer =
			device.create_buffer(std::mem::size_of::<shared::PipelineLaunchParameters>())?;

		// Per-light-path RNG streams and the light-vertex cache.
		let linear_rng_buffer = TypedBuffer::new(&device, num_light_paths as usize)?;
		{
			let mut seed_rng = rand::rngs::StdRng::seed_from_u64(459182033132123413);
			let seeds: Vec<shared::KernelRng> = (0..num_light_paths)
				.map(|_| shared::KernelRng::new(seed_rng.next_u64()))
				.collect();
			linear_rng_buffer.write_slice(&default_stream, 0, &seeds);
		}
		launch_params.linear_rng_buffer = linear_rng_buffer.device_pointer();

		let light_vertex_cache =
			TypedBuffer::new(&device, (num_light_paths * LIGHT_VERTICES_PER_PATH) as usize)?;
		launch_params.light_vertex_cache = light_vertex_cache.device_pointer();
		let num_light_vertices = device.create_buffer(std::mem::size_of::<u32>())?;
		launch_params.num_light_vertices = num_light_vertices.device_pointer();

		let denoiser = device.create_denoiser(DenoiserModel::Hdr);
		let hdr_intensity = device.create_buffer(std::mem::size_of::<f32>())?;

		let mut context = Self {
			device,
			default_stream,
			node_pools,
			procedure_pools,
			material_descriptors,
			shader_nodes: SlotMap::with_key(),
			materials: SlotMap::with_key(),
			images: SlotMap::with_key(),
			cameras: SlotMap::with_key(),
			dirty_shader_nodes: HashSet::new(),
			dirty_materials: HashSet::new(),
			node_table,
			material_table,
			camera_table,
			geometry_programs,
			geometry_node: ShaderNodeHandle::default(),
			null_image_2d: ImageHandle::default(),
			null_image_env: ImageHandle::default(),
			path_tracing,
			light_tracing,
			lvc_bpt,
			lvc_bpt_state,
			aux_buffer_generator,
			debug_rendering,
			scene_kernels,
			post_process,
			launch_params,
			launch_params_buffer,
			width: 0,
			height: 0,
			use_gl_texture: false,
			output_buffer: None,
			accum_buffer: None,
			rng_buffer: None,
			atomic_accum_buffer: None,
			accum_albedo_buffer: None,
			accum_normal_buffer: None,
			linear_color_buffer: None,
			linear_albedo_buffer: None,
			linear_normal_buffer: None,
			linear_denoised_color_buffer: None,
			denoiser,
			denoiser_state_buffer: None,
			denoiser_scratch_buffer: None,
			denoiser_tasks: Vec::new(),
			hdr_intensity,
			num_light_paths,
			linear_rng_buffer,
			light_vertex_cache,
			num_light_vertices,
			as_scratch_mem: None,
			state: ContextState::Uninitialized,
			bound_scene_id: None,
			num_accum_frames: 0,
			probe_pixel: (0, 0),
			renderer: RendererKind::PathTracing,
			debug_attribute: DebugRenderingAttribute::BaseColor,
		};

		// Class-level singletons: the geometry node and the null images.
		context.geometry_node = context.create_shader_node(ShaderNodeKind::Geometry)?;
		let null_2d = LinearImage2D::new(
			&context.device,
			&[255, 0, 255, 255],
			1,
			1,
			DataFormat::Rgba8,
			SpectrumType::Reflectance,
			ColorSpace::Rec709D65,
		)?;
		context.null_image_2d = context.images.insert(null_2d);
		let magenta_f16: Vec<u8> = [1.0f32, 0.0, 1.0, 1.0]
			.iter()
			.flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
			.collect();
		let null_env = LinearImage2D::new(
			&context.device,
			&magenta_f16,
			1,
			1,
			DataFormat::Rgba16F,
			SpectrumType::LightSource,
			ColorSpace::Rec709D65,
		)?;
		context.null_image_env = context.images.insert(null_env);

		log::info!("renderer context ready");
		Ok(context)
	}

	pub fn device(&self) -> &Device {
		&self.device
	}

	pub fn default_stream(&self) -> &Stream {
		&self.default_stream
	}

	pub fn create_scene(&self) -> Result<Scene> {
		Scene::new(&self.device)
	}

	pub fn geometry_shader_node(&self) -> ShaderNodeHandle {
		self.geometry_node
	}

	// Shader nodes.

	pub fn create_shader_node(&mut self, kind: ShaderNodeKind) -> Result<ShaderNodeHandle> {
		let size_class = ShaderNode::size_class_of(&kind);
		let desc_index = self.node_pools.allocate(size_class)?;
		let handle = self.shader_nodes.insert(ShaderNode::new(kind, desc_index, size_class));
		self.dirty_shader_nodes.insert(handle);
		Ok(handle)
	}

	pub fn destroy_shader_node(&mut self, handle: ShaderNodeHandle) -> Result<()> {
		let node = self.shader_nodes.remove(handle).ok_or(Error::NotFound)?;
		self.node_pools.release(node.size_class, node.desc_index);
		self.dirty_shader_nodes.remove(&handle);
		Ok(())
	}

	pub fn set_shader_node_param(
		&mut self,
		handle: ShaderNodeHandle,
		name: &str,
		value: &ParamValue,
	) -> Result<()> {
		let node = self.shader_nodes.get_mut(handle).ok_or(Error::NotFound)?;
		match node.set_param(name, value) {
			Ok(()) => {
				self.dirty_shader_nodes.insert(handle);
				Ok(())
			}
			Err(e) => {
				log::warn!("shader node parameter rejected: {:?}", e);
				Err(e)
			}
		}
	}

	pub fn get_shader_node_param(&self, handle: ShaderNodeHandle, name: &str) -> Result<OwnedParamValue> {
		self.shader_nodes.get(handle).ok_or(Error::NotFound)?.get_param(name)
	}

	/// Builds a plug referencing one typed output of a node.
	pub fn get_shader_node_plug(
		&self,
		handle: ShaderNodeHandle,
		plug_type: ShaderNodePlugType,
		option: u32,
	) -> Result<Plug> {
		let node = self.shader_nodes.get(handle).ok_or(Error::NotFound)?;
		if !node.provides_plug(plug_type) {
			return Err(Error::InvalidArgument(format!(
				"node class {} has no {:?} output",
				node.info.class.name, plug_type
			)));
		}
		Ok(Plug { node: handle, plug_type, option })
	}

	// Materials.

	pub fn create_surface_material(&mut self, kind: SurfaceMaterialKind) -> Result<MaterialHandle> {
		let desc_index = self.material_descriptors.allocate()?;
		let handle = self.materials.insert(SurfaceMaterial::new(kind, desc_index));
		self.dirty_materials.insert(handle);
		Ok(handle)
	}

	pub fn destroy_surface_material(&mut self, handle: MaterialHandle) -> Result<()> {
		let material = self.materials.remove(handle).ok_or(Error::NotFound)?;
		self.material_descriptors.release(material.desc_index);
		self.dirty_materials.remove(&handle);
		Ok(())
	}

	pub fn set_material_param(
		&mut self,
		handle: MaterialHandle,
		name: &str,
		value: &ParamValue,
	) -> Result<()> {
		let material = self.materials.get_mut(handle).ok_or(Error::NotFound)?;
		match material.set_param(name, value) {
			Ok(()) => {
				self.dirty_materials.insert(handle);
				Ok(())
			}
			Err(e) => {
				log::warn!("material parameter rejected: {:?}", e);
				Err(e)
			}
		}
	}

	pub fn get_material_param(&self, handle: MaterialHandle, name: &str) -> Result<OwnedParamValue> {
		self.materials.get(handle).ok_or(Error::NotFound)?.get_param(name)
	}

	// Images.

	pub fn create_linear_image(
		&mut self,
		data: &[u8],
		width: u32,
		height: u32,
		format: DataFormat,
		spectrum_type: SpectrumType,
		color_space: ColorSpace,
	) -> Result<ImageHandle> {
		let image = LinearImage2D::new(&self.device, data, width, height, format, spectrum_type, color_space)?;
		Ok(self.images.insert(image))
	}

	pub fn load_exr_image(&mut self, path: &Path) -> Result<ImageHandle> {
		let image = LinearImage2D::from_exr(&self.device, path)?;
		Ok(self.images.insert(image))
	}

	// Cameras.

	pub fn create_perspective_camera(&mut self) -> CameraHandle {
		self.cameras.insert(Camera::new_perspective())
	}

	pub fn create_equirectangular_camera(&mut self) -> CameraHandle {
		self.cameras.insert(Camera::new_equirectangular())
	}

	pub fn set_camera_param(&mut self, handle: CameraHandle, name: &str, value: &ParamValue) -> Result<()> {
		self.cameras.get_mut(handle).ok_or(Error::NotFound)?.set_param(name, value)
	}

	pub fn get_camera_param(&self, handle: CameraHandle, name: &str) -> Result<OwnedParamValue> {
		self.cameras.get(handle).ok_or(Error::NotFound)?.get_param(name)
	}

	// Renderer selection and debug state.

	pub fn set_renderer(&mut self, renderer: RendererKind) {
		self.renderer = renderer;
	}

	pub fn set_debug_rendering_attribute(&mut self, attribute: DebugRenderingAttribute) {
		self.debug_attribute = attribute;
	}

	pub fn set_probe_pixel(&mut self, x: u32, y: u32) {
		self.probe_pixel = (x, y);
	}

	pub fn num_accum_frames(&self) -> u32 {
		self.num_accum_frames
	}

	/// (Re)creates every output-sized buffer and prepares the denoiser.
	/// Accumulation restarts from zero.
	pub fn bind_output_buffer(&mut self, width: u32, height: u32, gl_tex_id: Option<u32>) -> Result<()> {
		if width == 0 || height == 0 {
			return Err(Error::InvalidArgument("output size must be non-zero".to_string()));
		}
		self.width = width;
		self.height = height;

		self.output_buffer = Some(match gl_tex_id {
			Some(tex) => {
				self.use_gl_texture = true;
				self.device.create_array2d_from_gl_texture(tex, width, height)?
			}
			None => {
				self.use_gl_texture = false;
				self.device.create_array2d(width, height, ArrayElementType::Float32x4)?
			}
		});

		self.accum_buffer = Some(self.device.create_array2d(width, height, ArrayElementType::Float32x4)?);
		let accum = self.accum_buffer.as_ref().unwrap();
		self.launch_params.accum_buffer = accum.surface_object();

		let pixels = width as usize * height as usize;
		let atomic = TypedBuffer::new(&self.device, pixels)?;
		self.launch_params.atomic_accum_buffer = atomic.device_pointer();
		self.atomic_accum_buffer = Some(atomic);

		let rng = self.device.create_array2d(width, height, ArrayElementType::UInt32x2)?;
		{
			let mut seed_rng = rand::rngs::StdRng::seed_from_u64(591842031321323413);
			let mut seeds = Vec::with_capacity(pixels * 8);
			for _ in 0..pixels {
				seeds.extend_from_slice(&seed_rng.next_u64().to_le_bytes());
			}
			rng.write_all(&seeds);
		}
		self.launch_params.rng_buffer = rng.surface_object();
		self.rng_buffer = Some(rng);

		let sizes = self.denoiser.prepare(width, height);
		self.denoiser_state_buffer = Some(self.device.create_buffer(sizes.state_size.max(1))?);
		self.denoiser_scratch_buffer = Some(
			self.device
				.create_buffer(sizes.scratch_size.max(sizes.scratch_size_for_compute_intensity).max(1))?,
		);
		self.denoiser_tasks = self.denoiser.get_tasks();

		let accum_albedo = TypedBuffer::new(&self.device, pixels)?;
		let accum_normal = TypedBuffer::new(&self.device, pixels)?;
		self.launch_params.accum_albedo_buffer = accum_albedo.device_pointer();
		self.launch_params.accum_normal_buffer = accum_normal.device_pointer();
		self.accum_albedo_buffer = Some(accum_albedo);
		self.accum_normal_buffer = Some(accum_normal);
		self.linear_color_buffer = Some(TypedBuffer::new(&self.device, pixels)?);
		self.linear_albedo_buffer = Some(TypedBuffer::new(&self.device, pixels)?);
		self.linear_normal_buffer = Some(TypedBuffer::new(&self.device, pixels)?);
		self.linear_denoised_color_buffer = Some(TypedBuffer::new(&self.device, pixels)?);

		self.launch_params.image_stride_in_pixels = width;
		self.num_accum_frames = 0;
		if self.state == ContextState::Uninitialized {
			self.state = ContextState::OutputBound;
		}
		Ok(())
	}

	pub fn output_buffer_size(&self) -> (u32, u32) {
		(self.width, self.height)
	}

	/// Copies the output surface back to host memory as RGBA32F rows.
	pub fn read_output_buffer(&self, stream: &Stream) -> Result<Vec<[f32; 4]>> {
		let output = self
			.output_buffer
			.as_ref()
			.ok_or_else(|| Error::InvalidState("no output buffer is bound".to_string()))?;
		if self.use_gl_texture {
			output.begin_cuda_access(stream);
		}
		let bytes = output.read_all();
		if self.use_gl_texture {
			output.end_cuda_access(stream);
		}
		let mut pixels = Vec::with_capacity(bytes.len() / 16);
		for chunk in bytes.chunks_exact(16) {
			let mut texel = [0.0f32; 4];
			for (i, v) in texel.iter_mut().enumerate() {
				*v = f32::from_le_bytes([chunk[4 * i], chunk[4 * i + 1], chunk[4 * i + 2], chunk[4 * i + 3]]);
			}
			pixels.push(texel);
		}
		Ok(pixels)
	}

	pub fn set_scene(&mut self, scene: &Scene) -> Result<()> {
		if self.state == ContextState::Uninitialized {
			return Err(Error::InvalidState("bind an output buffer before a scene".to_string()));
		}
		self.bound_scene_id = Some(scene.graph().node(scene.root()).map(|n| n.info.id).unwrap_or(0));
		self.state = ContextState::SceneBound;
		Ok(())
	}

	fn flush_dirty_descriptors(&mut self, stream: &Stream) {
		let dirty_nodes: Vec<ShaderNodeHandle> = self.dirty_shader_nodes.drain().collect();
		for handle in dirty_nodes {
			if let Some(node) = self.shader_nodes.get(handle) {
				shader_nodes::setup_descriptor(
					node,
					&self.shader_nodes,
					&self.images,
					self.null_image_2d,
					self.null_image_env,
					&self.node_table,
					&self.node_pools,
					stream,
				);
			}
		}

		let dirty_materials: Vec<MaterialHandle> = self.dirty_materials.drain().collect();
		for handle in dirty_materials {
			if let Some(mat) = self.materials.get(handle) {
				material::setup_descriptor(
					mat,
					&self.shader_nodes,
					&self.node_table,
					&self.material_table,
					&self.material_descriptors,
					stream,
				);
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub fn render(
		&mut self,
		scene: &mut Scene,
		stream: &Stream,
		camera: CameraHandle,
		denoise: bool,
		shrink_coeff: u32,
		first_frame: bool,
		limit_num_accum_frames: u32,
	) -> Result<u32> {
		if self.state != ContextState::SceneBound {
			return Err(Error::InvalidState("render requires a bound output buffer and scene".to_string()));
		}
		let scene_id = scene.graph().node(scene.root()).map(|n| n.info.id).unwrap_or(0);
		if self.bound_scene_id != Some(scene_id) {
			return Err(Error::InvalidState("rendering a scene that was not bound".to_string()));
		}
		if !self.cameras.contains_key(camera) {
			return Err(Error::NotFound);
		}
		let shrink_coeff = shrink_coeff.max(1);

		// 1. Flush dirty shader nodes, then dirty materials.
		self.flush_dirty_descriptors(stream);

		// 2-3. Scene preparation and setup.
		let scratch_size = {
			let subsystems = SceneSubsystems {
				device: &self.device,
				materials: &self.materials,
				shader_nodes: &self.shader_nodes,
				images: &self.images,
				node_table: &self.node_table,
				geometry_programs: &self.geometry_programs,
				null_image_env: self.null_image_env,
			};
			scene.prepare_setup(&subsystems, stream)?
		};
		let needs_scratch_realloc = self
			.as_scratch_mem
			.as_ref()
			.map(|m| m.size_in_bytes() < scratch_size)
			.unwrap_or(true);
		if needs_scratch_realloc {
			self.as_scratch_mem = Some(self.device.create_buffer(scratch_size.max(256))?);
		}
		{
			let subsystems = SceneSubsystems {
				device: &self.device,
				materials: &self.materials,
				shader_nodes: &self.shader_nodes,
				images: &self.images,
				node_table: &self.node_table,
				geometry_programs: &self.geometry_programs,
				null_image_env: self.null_image_env,
			};
			scene.setup(
				&subsystems,
				&self.scene_kernels,
				stream,
				self.as_scratch_mem.as_ref().unwrap(),
				&mut self.launch_params,
			)?;
		}

		let denoise = denoise && self.renderer != RendererKind::DebugRendering;

		// 4-5. Bind the scene and a sufficiently large hit-group SBT to the
		// pipelines this frame uses.
		let sbt_size = scene.sbt_layout_size();
		let layout_was_up_to_date = scene.sbt_layout_was_up_to_date();
		match self.renderer {
			RendererKind::PathTracing => {
				self.path_tracing.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
			}
			RendererKind::LightTracing => {
				self.aux_buffer_generator
					.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
				self.light_tracing.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
			}
			RendererKind::Bpt => {
				self.lvc_bpt.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
			}
			RendererKind::DebugRendering => {
				if self.debug_attribute < DebugRenderingAttribute::DenoiserAlbedo {
					self.debug_rendering
						.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
				} else {
					self.aux_buffer_generator
						.bind_scene(&self.device, scene, sbt_size, layout_was_up_to_date)?;
				}
			}
		}

		let image_size = [self.width / shrink_coeff, self.height / shrink_coeff];
		let image_stride = self.launch_params.image_stride_in_pixels;

		// 6. First-frame state.
		if first_frame {
			self.launch_params.image_size = image_size;
			self.cameras[camera].setup(&self.camera_table, &mut self.launch_params);
			if !self.denoiser.state_is_ready() {
				self.denoiser.setup_state(
					stream,
					self.denoiser_state_buffer.as_ref().unwrap(),
					self.denoiser_scratch_buffer.as_ref().unwrap(),
				);
			}
			self.num_accum_frames = 0;
		}

		// 7. Accumulate one frame, algorithm by algorithm.
		if self.num_accum_frames + 1 <= limit_num_accum_frames {
			self.num_accum_frames += 1;
			self.launch_params.num_accum_frames = self.num_accum_frames;
			self.launch_params.limit_num_accum_frames = limit_num_accum_frames;
			self.launch_params.debug_rendering_attribute = self.debug_attribute as u32;
			self.launch_params.probe_pix_x = self.probe_pixel.0;
			self.launch_params.probe_pix_y = self.probe_pixel.1;

			match self.renderer {
				RendererKind::PathTracing => {
					self.upload_launch_params(stream);
					self.path_tracing.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						image_size[0],
						image_size[1],
						1,
					);
				}
				RendererKind::LightTracing => {
					self.upload_launch_params(stream);
					self.aux_buffer_generator.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						image_size[0],
						image_size[1],
						1,
					);
					self.reset_atomic_accum(stream, image_size, image_stride);
					self.light_tracing.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						self.num_light_paths,
						1,
						1,
					);
					self.accumulate_atomic(stream, image_size, image_stride, first_frame);
				}
				RendererKind::Bpt => {
					let (wls, probability) = {
						let rng = &mut self.lvc_bpt_state.rng;
						WavelengthSamples::new_with_equal_offsets(rng.gen::<f32>(), rng.gen::<f32>())
					};
					self.launch_params.common_wavelength_samples = wls;
					self.launch_params.wavelength_probability = probability;
					self.upload_launch_params(stream);

					self.num_light_vertices
						.write_bytes(stream, 0, gpu::as_u8_slice(&0u32));

					self.lvc_bpt
						.pipeline
						.set_ray_generation_program(&self.lvc_bpt_state.light_path_ray_gen);
					self.lvc_bpt.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						self.num_light_paths,
						1,
						1,
					);

					self.reset_atomic_accum(stream, image_size, image_stride);
					self.lvc_bpt
						.pipeline
						.set_ray_generation_program(&self.lvc_bpt_state.eye_path_ray_gen);
					self.lvc_bpt.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						image_size[0],
						image_size[1],
						1,
					);
					self.accumulate_atomic(stream, image_size, image_stride, false);
				}
				RendererKind::DebugRendering => {
					self.upload_launch_params(stream);
					let record = if self.debug_attribute < DebugRenderingAttribute::DenoiserAlbedo {
						&self.debug_rendering
					} else {
						&self.aux_buffer_generator
					};
					record.pipeline.launch(
						stream,
						self.launch_params_buffer.device_pointer(),
						image_size[0],
						image_size[1],
						1,
					);
				}
			}

			// 8. Pack the accumulators into linear views; normals move into
			// camera space through the inverse camera orientation.
			self.post_process
				.launch_params_global
				.write_bytes(stream, 0, gpu::as_u8_slice(&self.launch_params));

			let orientation = self.cameras[camera].orientation();
			let inverse = orientation.conjugate();
			let copy_params = CopyBuffersParams {
				accum_buffer: self.launch_params.accum_buffer,
				accum_albedo_buffer: self.launch_params.accum_albedo_buffer,
				accum_normal_buffer: self.launch_params.accum_normal_buffer,
				inv_camera_orientation: [inverse.x, inverse.y, inverse.z, inverse.w],
				image_size,
				image_stride_in_pixels: image_stride,
				num_accum_frames: self.num_accum_frames,
				linear_color_buffer: self.linear_color_buffer.as_ref().unwrap().device_pointer(),
				linear_albedo_buffer: self.linear_albedo_buffer.as_ref().unwrap().device_pointer(),
				linear_normal_buffer: self.linear_normal_buffer.as_ref().unwrap().device_pointer(),
			};
			self.post_process.copy_buffers.launch(
				stream,
				self.post_process.copy_buffers.calc_grid_dim(image_size[0], image_size[1]),
				gpu::as_u8_slice(&copy_params),
			);

			// 9. Denoise with albedo and normal guides.
			if denoise {
				self.denoiser.compute_intensity(
					stream,
					self.linear_color_buffer.as_ref().unwrap().raw(),
					PixelFormat::Float4,
					self.denoiser_scratch_buffer.as_ref().unwrap(),
					self.hdr_intensity.device_pointer(),
				);
				for task in &self.denoiser_tasks {
					self.denoiser.invoke(
						stream,
						self.hdr_intensity.device_pointer(),
						self.linear_color_buffer.as_ref().unwrap().raw(),
						self.linear_albedo_buffer.as_ref().unwrap().raw(),
						self.linear_normal_buffer.as_ref().unwrap().raw(),
						self.linear_denoised_color_buffer.as_ref().unwrap().raw(),
						task,
					);
				}
			}
		}

		// 10. Tone-map into the output surface.
		let output = self
			.output_buffer
			.as_ref()
			.ok_or_else(|| Error::InvalidState("no output buffer is bound".to_string()))?;
		if self.use_gl_texture {
			output.begin_cuda_access(stream);
		}
		let convert_params = ConvertToRgbParams {
			accum_buffer: self.launch_params.accum_buffer,
			linear_denoised_color_buffer: self.linear_denoised_color_buffer.as_ref().unwrap().device_pointer(),
			linear_albedo_buffer: self.linear_albedo_buffer.as_ref().unwrap().device_pointer(),
			linear_normal_buffer: self.linear_normal_buffer.as_ref().unwrap().device_pointer(),
			denoise: denoise as u32,
			debug_render: (self.renderer == RendererKind::DebugRendering) as u32,
			debug_attribute: self.debug_attribute as u32,
			image_size,
			image_stride_in_pixels: image_stride,
			num_accum_frames: self.num_accum_frames,
			render_target: output.surface_object(),
		};
		self.post_process.convert_to_rgb.launch(
			stream,
			self.post_process.convert_to_rgb.calc_grid_dim(image_size[0], image_size[1]),
			gpu::as_u8_slice(&convert_params),
		);
		if self.use_gl_texture {
			output.end_cuda_access(stream);
		}

		Ok(self.num_accum_frames)
	}

	fn upload_launch_params(&self, stream: &Stream) {
		self.launch_params_buffer
			.write_bytes(stream, 0, gpu::as_u8_slice(&self.launch_params));
	}

	fn reset_atomic_accum(&self, stream: &Stream, image_size: [u32; 2], stride: u32) {
		let params = ResetAtomicAccumParams {
			atomic_accum_buffer: self.atomic_accum_buffer.as_ref().unwrap().device_pointer(),
			image_size,
			image_stride_in_pixels: stride,
		};
		self.post_process.reset_atomic_accum_buffer.launch(
			stream,
			self.post_process
				.reset_atomic_accum_buffer
				.calc_grid_dim(image_size[0], image_size[1]),
			gpu::as_u8_slice(&params),
		);
	}

	fn accumulate_atomic(&self, stream: &Stream, image_size: [u32; 2], stride: u32, first_frame: bool) {
		let params = AccumulateParams {
			atomic_accum_buffer: self.atomic_accum_buffer.as_ref().unwrap().device_pointer(),
			accum_buffer: self.launch_params.accum_buffer,
			image_size,
			image_stride_in_pixels: stride,
			first_frame: first_frame as u32,
		};
		self.post_process.accumulate_from_atomic_accum_buffer.launch(
			stream,
			self.post_process
				.accumulate_from_atomic_accum_buffer
				.calc_grid_dim(image_size[0], image_size[1]),
			gpu::as_u8_slice(&params),
		);
	}

	pub fn shader_node_descriptor_index(&self, handle: ShaderNodeHandle) -> Option<u32> {
		self.shader_nodes.get(handle).map(|node| node.desc_index)
	}

	/// Reads back a shader node's descriptor slot; used by validation.
	pub fn read_small_node_descriptor(&self, handle: ShaderNodeHandle) -> Option<shared::SmallNodeDescriptor> {
		let node = self.shader_nodes.get(handle)?;
		match node.size_class {
			shader_nodes::SizeClass::Small => Some(self.node_pools.small.read(node.desc_index)),
			_ => None,
		}
	}

	pub fn null_procedure_set_indices(&self) -> (u32, u32) {
		(
			self.material_table.null_bsdf_procedure_set_index,
			self.material_table.null_edf_procedure_set_index,
		)
	}

	pub fn light_vertex_count(&self) -> u32 {
		let bytes = self.num_light_vertices.read_bytes(0, 4);
		u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
	}
}

impl Drop for Context {
	fn drop(&mut self) {
		color::finalize_color_system();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::color::create_triplet_spectrum;
	use crate::gpu::host::StreamOp;
	use crate::math::{Matrix4, StaticTransform, Vector3};

	const PTX_FILES: [&str; 11] = [
		"path_tracing.ptx",
		"light_tracing.ptx",
		"lvc_bpt.ptx",
		"aux_buffer_generator.ptx",
		"debug_rendering.ptx",
		"setup_scene.ptx",
		"post_process.ptx",
		"shader_nodes.ptx",
		"materials.ptx",
		"geometries.ptx",
		"cameras.ptx",
	];

	fn test_ptx_dir() -> PathBuf {
		let dir = std::env::temp_dir().join("prism-test-ptxes");
		std::fs::create_dir_all(&dir).unwrap();
		for file in PTX_FILES {
			let path = dir.join(file);
			if !path.exists() {
				std::fs::write(&path, "// stub module\n").unwrap();
			}
		}
		dir
	}

	fn context(num_light_paths: u32) -> Context {
		Context::new(&test_ptx_dir(), num_light_paths).unwrap()
	}

	fn quad_vertices() -> Vec<shared::Vertex> {
		[
			[0.0f32, 0.0, 0.0],
			[1.0, 0.0, 0.0],
			[1.0, 1.0, 0.0],
			[0.0, 1.0, 0.0],
		]
		.iter()
		.map(|&p| shared::Vertex {
			position: p,
			normal: [0.0, 0.0, 1.0],
			tc0_direction: [1.0, 0.0, 0.0],
			tex_coord: [p[0], p[1]],
		})
		.collect()
	}

	fn env_only_scene(ctx: &mut Context) -> Scene {
		let mut scene = ctx.create_scene().unwrap();
		let env = ctx
			.create_surface_material(SurfaceMaterialKind::EnvironmentEmitter {
				node_emittance: None,
				imm_emittance: [1.0; 3],
				imm_scale: 1.0,
			})
			.unwrap();
		scene.set_environment(env);
		scene
	}

	#[test]
	fn missing_ptx_fails_initialization() {
		let dir = std::env::temp_dir().join("prism-test-no-ptxes");
		std::fs::create_dir_all(&dir).unwrap();
		assert!(matches!(Context::new(&dir, 64), Err(Error::IoError(_))));
	}

	#[test]
	fn null_procedure_sets_live_at_index_zero() {
		let ctx = context(64);
		assert_eq!(ctx.null_procedure_set_indices(), (0, 0));
	}

	#[test]
	fn render_requires_bound_output_and_scene() {
		let mut ctx = context(64);
		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();

		assert!(matches!(ctx.set_scene(&scene), Err(Error::InvalidState(_))));
		assert!(matches!(
			ctx.render(&mut scene, &stream, camera, false, 1, true, 16),
			Err(Error::InvalidState(_))
		));

		ctx.bind_output_buffer(8, 8, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 16).unwrap();
	}

	#[test]
	fn frame_counter_saturates_at_the_limit() {
		let mut ctx = context(64);
		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();
		ctx.bind_output_buffer(8, 8, None).unwrap();
		ctx.set_scene(&scene).unwrap();

		let mut last = 0;
		for i in 0..5 {
			last = ctx
				.render(&mut scene, &stream, camera, false, 1, i == 0, 3)
				.unwrap();
		}
		assert_eq!(last, 3);
		assert_eq!(ctx.num_accum_frames(), 3);
	}

	#[test]
	fn binding_a_new_output_restarts_accumulation() {
		let mut ctx = context(64);
		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();
		ctx.bind_output_buffer(8, 8, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 16).unwrap();
		assert_eq!(ctx.num_accum_frames(), 1);
		ctx.bind_output_buffer(16, 16, None).unwrap();
		assert_eq!(ctx.num_accum_frames(), 0);
	}

	#[test]
	fn dirty_shader_node_flush_serializes_latest_state() {
		let mut ctx = context(64);
		let node = ctx
			.create_shader_node(ShaderNodeKind::TripletSpectrum {
				spectrum_type: SpectrumType::Reflectance,
				color_space: ColorSpace::Rec709D65,
				imm_triplet: [0.18; 3],
			})
			.unwrap();
		ctx.set_shader_node_param(node, "triplet", &ParamValue::Floats(&[1.0, 0.0, 0.0]))
			.unwrap();
		ctx.set_shader_node_param(node, "triplet", &ParamValue::Floats(&[0.0, 1.0, 0.0]))
			.unwrap();

		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();
		ctx.bind_output_buffer(4, 4, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 1).unwrap();

		let descriptor = ctx.read_small_node_descriptor(node).unwrap();
		let data: shared::TripletSpectrumNodeData = descriptor.unpack();
		let expected = create_triplet_spectrum(SpectrumType::Reflectance, ColorSpace::Rec709D65, 0.0, 1.0, 0.0);
		assert_eq!(data.value, expected);
	}

	#[test]
	fn small_pool_exhaustion_recovers_after_release() {
		let mut ctx = context(64);
		// The geometry singleton already holds one small slot.
		let mut handles = Vec::new();
		loop {
			match ctx.create_shader_node(ShaderNodeKind::Float2 {
				node0: None,
				node1: None,
				imm0: 0.0,
				imm1: 0.0,
			}) {
				Ok(handle) => handles.push(handle),
				Err(Error::CapacityExhausted) => break,
				Err(e) => panic!("unexpected error: {:?}", e),
			}
		}
		assert_eq!(handles.len() as u32, 8192 - 1);

		let victim = handles[100];
		let victim_index = ctx.shader_node_descriptor_index(victim).unwrap();
		ctx.destroy_shader_node(victim).unwrap();
		let replacement = ctx
			.create_shader_node(ShaderNodeKind::Float2 { node0: None, node1: None, imm0: 0.0, imm1: 0.0 })
			.unwrap();
		assert_eq!(ctx.shader_node_descriptor_index(replacement), Some(victim_index));
	}

	#[test]
	fn two_parent_instance_halves_light_selection() {
		let mut ctx = context(64);
		let mut scene = ctx.create_scene().unwrap();
		let emitter = ctx
			.create_surface_material(SurfaceMaterialKind::DiffuseEmitter {
				node_emittance: None,
				imm_emittance: [10.0; 3],
				imm_scale: 1.0,
			})
			.unwrap();

		let stream = ctx.device().create_stream();
		let mesh = scene.create_triangle_mesh_node("emitter");
		scene
			.set_vertices(mesh, quad_vertices(), ctx.device(), &stream)
			.unwrap();
		scene
			.add_material_group(mesh, vec![0, 1, 2], emitter, None, None, None, ctx.device(), &stream)
			.unwrap();

		let left = scene.create_internal_node(
			"left",
			StaticTransform::new(Matrix4::translation(Vector3::new(-1.0, 0.0, 0.0))),
		);
		let right = scene.create_internal_node(
			"right",
			StaticTransform::new(Matrix4::translation(Vector3::new(1.0, 0.0, 0.0))),
		);
		let root = scene.root();
		scene.add_child(left, mesh).unwrap();
		scene.add_child(right, mesh).unwrap();
		scene.add_child(root, left).unwrap();
		scene.add_child(root, right).unwrap();

		let camera = ctx.create_perspective_camera();
		ctx.bind_output_buffer(8, 8, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 4).unwrap();

		assert_eq!(scene.num_instances(), 2);
		let dist = scene.light_instance_distribution().unwrap();
		assert_eq!(dist.num_values(), 2);
		assert!(dist.pmf().iter().all(|&p| (p - 0.5).abs() < 1e-6));
	}

	#[test]
	fn lvc_bpt_frame_sequence() {
		let mut ctx = context(256);
		ctx.set_renderer(RendererKind::Bpt);
		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();
		ctx.bind_output_buffer(8, 8, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 1).unwrap();

		assert_eq!(ctx.light_vertex_count(), 0, "the vertex counter is reset before the light pass");

		let ops = stream.take_ops();
		let launches: Vec<StreamOp> = ops
			.iter()
			.filter(|op| matches!(op, StreamOp::PipelineLaunch { .. } | StreamOp::KernelLaunch { .. }))
			.cloned()
			.collect();
		let position = |pred: &dyn Fn(&StreamOp) -> bool| launches.iter().position(|op| pred(op));

		let light_pass = position(&|op| {
			matches!(op, StreamOp::PipelineLaunch { ray_generation, width, .. }
				if ray_generation.as_str() == "lvcbptLightPath" && *width == 256)
		})
		.expect("light-path launch missing");
		let reset = position(&|op| {
			matches!(op, StreamOp::KernelLaunch { name, .. } if name.as_str() == "resetAtomicAccumBuffer")
		})
		.expect("atomic reset missing");
		let eye_pass = position(&|op| {
			matches!(op, StreamOp::PipelineLaunch { ray_generation, width, height, .. }
				if ray_generation.as_str() == "lvcbptEyePath" && *width == 8 && *height == 8)
		})
		.expect("eye-path launch missing");
		let accumulate = position(&|op| {
			matches!(op, StreamOp::KernelLaunch { name, .. } if name.as_str() == "accumulateFromAtomicAccumBuffer")
		})
		.expect("accumulate missing");

		assert!(light_pass < reset && reset < eye_pass && eye_pass < accumulate);
	}

	#[test]
	fn light_tracing_frame_sequence() {
		let mut ctx = context(128);
		ctx.set_renderer(RendererKind::LightTracing);
		let mut scene = env_only_scene(&mut ctx);
		let camera = ctx.create_perspective_camera();
		let stream = ctx.device().create_stream();
		ctx.bind_output_buffer(4, 4, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 1).unwrap();

		let ops = stream.take_ops();
		let mut sequence = Vec::new();
		for op in &ops {
			match op {
				StreamOp::PipelineLaunch { ray_generation, width, .. } => {
					sequence.push(format!("{}:{}", ray_generation, width));
				}
				StreamOp::KernelLaunch { name, .. }
					if name == "resetAtomicAccumBuffer" || name == "accumulateFromAtomicAccumBuffer" =>
				{
					sequence.push(name.clone());
				}
				_ => {}
			}
		}
		let aux = sequence.iter().position(|s| s == "auxBufferGenerator:4").unwrap();
		let reset = sequence.iter().position(|s| s == "resetAtomicAccumBuffer").unwrap();
		let lt = sequence.iter().position(|s| s == "lightTracing:128").unwrap();
		let accum = sequence
			.iter()
			.position(|s| s == "accumulateFromAtomicAccumBuffer")
			.unwrap();
		assert!(aux < reset && reset < lt && lt < accum);
	}

	#[test]
	fn geometry_descriptor_readback_matches_material() {
		let mut ctx = context(64);
		let mut scene = ctx.create_scene().unwrap();
		let matte = ctx
			.create_surface_material(SurfaceMaterialKind::Matte { node_albedo: None, imm_albedo: [0.5; 3] })
			.unwrap();
		let stream = ctx.device().create_stream();
		let mesh = scene.create_triangle_mesh_node("quad");
		scene
			.set_vertices(mesh, quad_vertices(), ctx.device(), &stream)
			.unwrap();
		scene
			.add_material_group(mesh, vec![0, 1, 2, 0, 2, 3], matte, None, None, None, ctx.device(), &stream)
			.unwrap();
		let root = scene.root();
		scene.add_child(root, mesh).unwrap();

		let env = ctx
			.create_surface_material(SurfaceMaterialKind::EnvironmentEmitter {
				node_emittance: None,
				imm_emittance: [1.0; 3],
				imm_scale: 1.0,
			})
			.unwrap();
		scene.set_environment(env);

		let camera = ctx.create_perspective_camera();
		ctx.bind_output_buffer(4, 4, None).unwrap();
		ctx.set_scene(&scene).unwrap();
		ctx.render(&mut scene, &stream, camera, false, 1, true, 1).unwrap();

		let roots = scene.graph().root_transforms();
		assert_eq!(roots.len(), 1);
		let group = scene.graph().geometry_descendant(roots[0]);
		let inst = scene.graph().group_members(group)[0];
		let record = scene.read_geom_inst_slot(inst).unwrap();
		assert_eq!(record.geometry_kind, shared::GeometryKind::TriangleMesh as u32);
		assert_eq!(record.importance, 0.0);
		assert_eq!(record.primitive_distribution.num_values, 2);
	}
}

fn shader_nodes_initialize(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut NodeDescriptorPools,
	stream: &Stream,
) -> Result<ShaderNodeClassTable> {
	use shared::ShaderNodePlugType::*;

	let mut init_class = |pairs: &[(shared::ShaderNodePlugType, &str)]| -> Result<shader_nodes::ClassPrograms> {
		let mut programs = shader_nodes::ClassPrograms::default();
		let mut procedure_set = shared::NodeProcedureSet::default();
		for &(plug_type, program_name) in pairs {
			let index = register(ModuleKind::ShaderNode, program_name);
			programs.callables[plug_type as usize] = index;
			procedure_set.progs[plug_type as usize] = index;
		}
		let slot = pools.node_procedure_sets.allocate()?;
		pools.node_procedure_sets.update(slot, &procedure_set, stream);
		programs.node_procedure_set_index = slot;
		Ok(programs)
	};

	Ok(ShaderNodeClassTable {
		geometry: init_class(&[
			(Point3D, "GeometryShaderNode_Point3D"),
			(Normal3D, "GeometryShaderNode_Normal3D"),
			(Vector3D, "GeometryShaderNode_Vector3D"),
			(TextureCoordinates, "GeometryShaderNode_TextureCoordinates"),
		])?,
		tangent: init_class(&[(Vector3D, "TangentShaderNode_Vector3D")])?,
		float2: init_class(&[
			(Float1, "Float2ShaderNode_float1"),
			(Float2, "Float2ShaderNode_float2"),
		])?,
		float3: init_class(&[
			(Float1, "Float3ShaderNode_float1"),
			(Float2, "Float3ShaderNode_float2"),
			(Float3, "Float3ShaderNode_float3"),
		])?,
		float4: init_class(&[
			(Float1, "Float4ShaderNode_float1"),
			(Float2, "Float4ShaderNode_float2"),
			(Float3, "Float4ShaderNode_float3"),
			(Float4, "Float4ShaderNode_float4"),
		])?,
		scale_and_offset_float: init_class(&[(Float1, "ScaleAndOffsetFloatShaderNode_float1")])?,
		triplet_spectrum: init_class(&[(Spectrum, "TripletSpectrumShaderNode_Spectrum")])?,
		regular_sampled_spectrum: init_class(&[(Spectrum, "RegularSampledSpectrumShaderNode_Spectrum")])?,
		irregular_sampled_spectrum: init_class(&[(Spectrum, "IrregularSampledSpectrumShaderNode_Spectrum")])?,
		float3_to_spectrum: init_class(&[(Spectrum, "Float3ToSpectrumShaderNode_Spectrum")])?,
		scale_and_offset_uv_texture_map_2d: init_class(&[(
			TextureCoordinates,
			"ScaleAndOffsetUVTextureMap2DShaderNode_TextureCoordinates",
		)])?,
		image_2d_texture: init_class(&[
			(Float1, "Image2DTextureShaderNode_float1"),
			(Float2, "Image2DTextureShaderNode_float2"),
			(Float3, "Image2DTextureShaderNode_float3"),
			(Float4, "Image2DTextureShaderNode_float4"),
			(Normal3D, "Image2DTextureShaderNode_Normal3D"),
			(Spectrum, "Image2DTextureShaderNode_Spectrum"),
			(Alpha, "Image2DTextureShaderNode_Alpha"),
		])?,
		environment_texture: init_class(&[(Spectrum, "EnvironmentTextureShaderNode_Spectrum")])?,
	})
}
