//! Device-visible record layouts.
//!
//! Everything here is plain-old-data with a fixed layout, written into slot
//! tables or the launch-parameters block and read back by the kernels.

use crate::color::{RgbSpectrum, WavelengthSamples, NUM_CMF_STRATA};
use crate::gpu::{DevicePtr, TraversableHandle};

pub const INVALID_PROGRAM: u32 = 0xffff_ffff;
pub const INVALID_SLOT: u32 = 0xffff_ffff;

/// Upper bound on ray types across all pipelines; hit-group SBT records are
/// laid out with this stride.
pub const MAX_NUM_RAY_TYPES: u32 = 4;

/// Semantic type of one shader-node output plug.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShaderNodePlugType {
	Point3D = 0,
	Normal3D,
	Vector3D,
	Float1,
	Float2,
	Float3,
	Float4,
	TextureCoordinates,
	Spectrum,
	Alpha,
}

pub const NUM_NODE_PLUG_TYPES: usize = 10;

impl ShaderNodePlugType {
	/// Whether a plug of type `self` may feed a parameter expecting `target`.
	pub fn convertible_to(self, target: ShaderNodePlugType) -> bool {
		use ShaderNodePlugType::*;
		if self == target {
			return true;
		}
		match target {
			Float1 => matches!(self, Float1 | Float2 | Float3 | Float4 | Alpha),
			Float2 => matches!(self, Float3 | Float4),
			Float3 => matches!(self, Float4 | Point3D | Vector3D | Normal3D),
			Point3D | Vector3D => matches!(self, Float3 | Point3D | Vector3D | Normal3D),
			Normal3D => matches!(self, Float3 | Normal3D),
			TextureCoordinates => matches!(self, Point3D | Float2 | Float3),
			Alpha => matches!(self, Float1),
			_ => false,
		}
	}
}

/// A serialized plug reference: which procedure set evaluates it, what it
/// outputs, which descriptor holds its data and an output-option word.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShaderNodePlugRecord {
	pub node_type: u32,
	pub plug_type: u32,
	pub node_desc_index: u32,
	pub option: u32,
}

impl ShaderNodePlugRecord {
	/// The sentinel meaning "use the immediate value instead".
	pub const INVALID: Self = Self {
		node_type: INVALID_SLOT,
		plug_type: 0,
		node_desc_index: INVALID_SLOT,
		option: 0,
	};

	pub fn is_valid(&self) -> bool {
		self.node_type != INVALID_SLOT
	}
}

/// Callable-program table of a shader-node class, one entry per plug type.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NodeProcedureSet {
	pub progs: [u32; NUM_NODE_PLUG_TYPES],
}

impl Default for NodeProcedureSet {
	fn default() -> Self {
		Self { progs: [INVALID_PROGRAM; NUM_NODE_PLUG_TYPES] }
	}
}

pub const SMALL_NODE_DESC_DWORDS: usize = 16;
pub const MEDIUM_NODE_DESC_DWORDS: usize = 32;
pub const LARGE_NODE_DESC_DWORDS: usize = 256;

macro_rules! node_descriptor {
	($name:ident, $dwords:expr) => {
		#[repr(C)]
		#[derive(Clone, Copy)]
		pub struct $name {
			pub data: [u32; $dwords],
		}

		impl $name {
			pub const NUM_DWORD_SLOTS: usize = $dwords;

			pub fn pack<T: Copy>(value: &T) -> Self {
				let size = std::mem::size_of::<T>();
				assert!(size <= $dwords * 4, "node data does not fit the descriptor class");
				let mut desc = Self { data: [0; $dwords] };
				unsafe {
					std::ptr::copy_nonoverlapping(
						value as *const T as *const u8,
						desc.data.as_mut_ptr() as *mut u8,
						size,
					);
				}
				desc
			}

			pub fn unpack<T: Copy>(&self) -> T {
				assert!(std::mem::size_of::<T>() <= $dwords * 4);
				unsafe { std::ptr::read_unaligned(self.data.as_ptr() as *const T) }
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self { data: [0; $dwords] }
			}
		}
	};
}

node_descriptor!(SmallNodeDescriptor, SMALL_NODE_DESC_DWORDS);
node_descriptor!(MediumNodeDescriptor, MEDIUM_NODE_DESC_DWORDS);
node_descriptor!(LargeNodeDescriptor, LARGE_NODE_DESC_DWORDS);

/// Callable-program indices implementing one BSDF class.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BsdfProcedureSet {
	pub prog_get_base_color: u32,
	pub prog_matches: u32,
	pub prog_sample_internal: u32,
	pub prog_sample_with_rev_internal: u32,
	pub prog_evaluate_internal: u32,
	pub prog_evaluate_with_rev_internal: u32,
	pub prog_evaluate_pdf_internal: u32,
	pub prog_evaluate_pdf_with_rev_internal: u32,
	pub prog_weight_internal: u32,
}

impl Default for BsdfProcedureSet {
	fn default() -> Self {
		Self {
			prog_get_base_color: INVALID_PROGRAM,
			prog_matches: INVALID_PROGRAM,
			prog_sample_internal: INVALID_PROGRAM,
			prog_sample_with_rev_internal: INVALID_PROGRAM,
			prog_evaluate_internal: INVALID_PROGRAM,
			prog_evaluate_with_rev_internal: INVALID_PROGRAM,
			prog_evaluate_pdf_internal: INVALID_PROGRAM,
			prog_evaluate_pdf_with_rev_internal: INVALID_PROGRAM,
			prog_weight_internal: INVALID_PROGRAM,
		}
	}
}

/// Callable-program indices implementing one EDF class, together with the
/// "EDF as BSDF" view used when a light surface is hit by an importance path.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EdfProcedureSet {
	pub prog_matches: u32,
	pub prog_sample_internal: u32,
	pub prog_evaluate_emittance_internal: u32,
	pub prog_evaluate_internal: u32,
	pub prog_evaluate_pdf_internal: u32,
	pub prog_weight_internal: u32,
	pub as_bsdf: BsdfProcedureSet,
}

impl Default for EdfProcedureSet {
	fn default() -> Self {
		Self {
			prog_matches: INVALID_PROGRAM,
			prog_sample_internal: INVALID_PROGRAM,
			prog_evaluate_emittance_internal: INVALID_PROGRAM,
			prog_evaluate_internal: INVALID_PROGRAM,
			prog_evaluate_pdf_internal: INVALID_PROGRAM,
			prog_weight_internal: INVALID_PROGRAM,
			as_bsdf: BsdfProcedureSet::default(),
		}
	}
}

/// Callable-program indices implementing one camera importance function.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IdfProcedureSet {
	pub prog_sample_internal: u32,
	pub prog_evaluate_spatial_importance_internal: u32,
	pub prog_evaluate_directional_importance_internal: u32,
	pub prog_evaluate_pdf_internal: u32,
	pub prog_back_project_direction: u32,
}

impl Default for IdfProcedureSet {
	fn default() -> Self {
		Self {
			prog_sample_internal: INVALID_PROGRAM,
			prog_evaluate_spatial_importance_internal: INVALID_PROGRAM,
			prog_evaluate_directional_importance_internal: INVALID_PROGRAM,
			prog_evaluate_pdf_internal: INVALID_PROGRAM,
			prog_back_project_direction: INVALID_PROGRAM,
		}
	}
}

pub const MATERIAL_DESC_DATA_DWORDS: usize = 28;

/// The packed surface-material record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SurfaceMaterialDescriptor {
	pub prog_setup_bsdf: u32,
	pub bsdf_procedure_set_index: u32,
	pub prog_setup_edf: u32,
	pub edf_procedure_set_index: u32,
	pub data: [u32; MATERIAL_DESC_DATA_DWORDS],
}

impl SurfaceMaterialDescriptor {
	pub fn pack_data<T: Copy>(&mut self, value: &T) {
		let size = std::mem::size_of::<T>();
		assert!(size <= MATERIAL_DESC_DATA_DWORDS * 4, "material data does not fit");
		unsafe {
			std::ptr::copy_nonoverlapping(
				value as *const T as *const u8,
				self.data.as_mut_ptr() as *mut u8,
				size,
			);
		}
	}
}

impl Default for SurfaceMaterialDescriptor {
	fn default() -> Self {
		Self {
			prog_setup_bsdf: INVALID_PROGRAM,
			bsdf_procedure_set_index: 0,
			prog_setup_edf: INVALID_PROGRAM,
			edf_procedure_set_index: 0,
			data: [0; MATERIAL_DESC_DATA_DWORDS],
		}
	}
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscreteDistribution1DRecord {
	pub pmf: DevicePtr,
	pub cdf: DevicePtr,
	pub integral: f32,
	pub num_values: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ContinuousDistribution1DRecord {
	pub pdf: DevicePtr,
	pub cdf: DevicePtr,
	pub integral: f32,
	pub num_values: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ContinuousDistribution2DRecord {
	pub row_dists: DevicePtr,
	pub top_dist: ContinuousDistribution1DRecord,
}

/// Geometry kind tag carried by geometry-instance records.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GeometryKind {
	TriangleMesh = 0,
	PointSet,
	InfiniteSphere,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct GeometryInstanceRecord {
	pub vertex_buffer: DevicePtr,
	pub index_buffer: DevicePtr,
	pub primitive_distribution: DiscreteDistribution1DRecord,
	pub material_desc_index: u32,
	pub geometry_kind: u32,
	pub prog_decode_hit_point: u32,
	pub prog_sample: u32,
	pub node_normal: ShaderNodePlugRecord,
	pub node_tangent: ShaderNodePlugRecord,
	pub node_alpha: ShaderNodePlugRecord,
	pub importance: f32,
	pub user_data: u32,
	pub padding: [u32; 2],
}

impl Default for GeometryInstanceRecord {
	fn default() -> Self {
		Self {
			vertex_buffer: DevicePtr::NULL,
			index_buffer: DevicePtr::NULL,
			primitive_distribution: DiscreteDistribution1DRecord::default(),
			material_desc_index: INVALID_SLOT,
			geometry_kind: GeometryKind::TriangleMesh as u32,
			prog_decode_hit_point: INVALID_PROGRAM,
			prog_sample: INVALID_PROGRAM,
			node_normal: ShaderNodePlugRecord::INVALID,
			node_tangent: ShaderNodePlugRecord::INVALID,
			node_alpha: ShaderNodePlugRecord::INVALID,
			importance: 0.0,
			user_data: 0,
			padding: [0; 2],
		}
	}
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InstanceRecord {
	/// Object-to-world, first three rows, row-major.
	pub transform: [[f32; 4]; 3],
	/// World-to-object, first three rows, row-major.
	pub inv_transform: [[f32; 4]; 3],
	pub geom_inst_indices: DevicePtr,
	pub num_geom_insts: u32,
	pub importance: f32,
	pub light_geom_inst_distribution: DiscreteDistribution1DRecord,
	pub rotation: [f32; 4],
}

impl Default for InstanceRecord {
	fn default() -> Self {
		Self {
			transform: [[0.0; 4]; 3],
			inv_transform: [[0.0; 4]; 3],
			geom_inst_indices: DevicePtr::NULL,
			num_geom_insts: 0,
			importance: 0.0,
			light_geom_inst_distribution: DiscreteDistribution1DRecord::default(),
			rotation: [0.0, 0.0, 0.0, 1.0],
		}
	}
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Vertex {
	pub position: [f32; 3],
	pub normal: [f32; 3],
	pub tc0_direction: [f32; 3],
	pub tex_coord: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Triangle {
	pub indices: [u32; 3],
}

/// Per-pixel (and per-light-path) random number generator state.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelRng {
	pub state: u64,
}

impl KernelRng {
	pub fn new(seed: u64) -> Self {
		Self { state: seed }
	}
}

/// One vertex of the light-vertex cache populated by the LVC-BPT light pass.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct LightPathVertex {
	pub position: [f32; 3],
	pub prob_density: f32,
	pub normal: [f32; 3],
	pub prev_prob_density: f32,
	pub throughput: [f32; 4],
	pub direction: [f32; 3],
	pub path_length: u32,
	pub flags: u32,
	pub padding: [u32; 3],
}

pub const CAMERA_DESC_DATA_DWORDS: usize = 24;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CameraDescriptor {
	pub idf_procedure_set_index: u32,
	pub data: [u32; CAMERA_DESC_DATA_DWORDS],
}

impl CameraDescriptor {
	pub fn pack_data<T: Copy>(&mut self, value: &T) {
		let size = std::mem::size_of::<T>();
		assert!(size <= CAMERA_DESC_DATA_DWORDS * 4, "camera data does not fit");
		unsafe {
			std::ptr::copy_nonoverlapping(
				value as *const T as *const u8,
				self.data.as_mut_ptr() as *mut u8,
				size,
			);
		}
	}
}

impl Default for CameraDescriptor {
	fn default() -> Self {
		Self { idf_procedure_set_index: INVALID_SLOT, data: [0; CAMERA_DESC_DATA_DWORDS] }
	}
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PerspectiveCameraRecord {
	pub position: [f32; 3],
	pub orientation: [f32; 4],
	pub aspect: f32,
	pub fovy: f32,
	pub lens_radius: f32,
	pub op_distance: f32,
	pub sensitivity: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EquirectangularCameraRecord {
	pub position: [f32; 3],
	pub orientation: [f32; 4],
	pub phi_angle: f32,
	pub theta_angle: f32,
	pub sensitivity: f32,
}

/// The launch-parameters block: one fixed-size record whose device copy is
/// referenced by address from every pipeline and post-process kernel.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PipelineLaunchParameters {
	// Descriptor pools.
	pub node_procedure_set_buffer: DevicePtr,
	pub small_node_descriptor_buffer: DevicePtr,
	pub medium_node_descriptor_buffer: DevicePtr,
	pub large_node_descriptor_buffer: DevicePtr,
	pub bsdf_procedure_set_buffer: DevicePtr,
	pub edf_procedure_set_buffer: DevicePtr,
	pub idf_procedure_set_buffer: DevicePtr,
	pub material_descriptor_buffer: DevicePtr,

	// Scene.
	pub geom_inst_buffer: DevicePtr,
	pub inst_buffer: DevicePtr,
	pub top_group: TraversableHandle,
	pub scene_bounds: DevicePtr,
	pub light_inst_indices: DevicePtr,
	pub light_inst_dist: DiscreteDistribution1DRecord,
	pub env_inst_index: u32,
	pub env_rotation_phi: f32,
	pub env_importance_map: ContinuousDistribution2DRecord,

	// Frame buffers.
	pub accum_buffer: DevicePtr,
	pub atomic_accum_buffer: DevicePtr,
	pub accum_albedo_buffer: DevicePtr,
	pub accum_normal_buffer: DevicePtr,
	pub rng_buffer: DevicePtr,
	pub linear_rng_buffer: DevicePtr,
	pub light_vertex_cache: DevicePtr,
	pub num_light_vertices: DevicePtr,

	// Scalars.
	pub image_size: [u32; 2],
	pub image_stride_in_pixels: u32,
	pub num_accum_frames: u32,
	pub limit_num_accum_frames: u32,
	pub num_light_paths: u32,
	pub debug_rendering_attribute: u32,
	pub probe_pix_x: u32,
	pub probe_pix_y: u32,
	pub common_wavelength_samples: WavelengthSamples,
	pub wavelength_probability: f32,

	pub camera_descriptor: CameraDescriptor,

	// Color-matching tables.
	pub discretized_spectrum_xbar: [f32; NUM_CMF_STRATA],
	pub discretized_spectrum_ybar: [f32; NUM_CMF_STRATA],
	pub discretized_spectrum_zbar: [f32; NUM_CMF_STRATA],
	pub discretized_spectrum_integral_cmf: f32,
}

impl Default for PipelineLaunchParameters {
	fn default() -> Self {
		Self {
			node_procedure_set_buffer: DevicePtr::NULL,
			small_node_descriptor_buffer: DevicePtr::NULL,
			medium_node_descriptor_buffer: DevicePtr::NULL,
			large_node_descriptor_buffer: DevicePtr::NULL,
			bsdf_procedure_set_buffer: DevicePtr::NULL,
			edf_procedure_set_buffer: DevicePtr::NULL,
			idf_procedure_set_buffer: DevicePtr::NULL,
			material_descriptor_buffer: DevicePtr::NULL,
			geom_inst_buffer: DevicePtr::NULL,
			inst_buffer: DevicePtr::NULL,
			top_group: TraversableHandle(0),
			scene_bounds: DevicePtr::NULL,
			light_inst_indices: DevicePtr::NULL,
			light_inst_dist: DiscreteDistribution1DRecord::default(),
			env_inst_index: INVALID_SLOT,
			env_rotation_phi: 0.0,
			env_importance_map: ContinuousDistribution2DRecord::default(),
			accum_buffer: DevicePtr::NULL,
			atomic_accum_buffer: DevicePtr::NULL,
			accum_albedo_buffer: DevicePtr::NULL,
			accum_normal_buffer: DevicePtr::NULL,
			rng_buffer: DevicePtr::NULL,
			linear_rng_buffer: DevicePtr::NULL,
			light_vertex_cache: DevicePtr::NULL,
			num_light_vertices: DevicePtr::NULL,
			image_size: [0, 0],
			image_stride_in_pixels: 0,
			num_accum_frames: 0,
			limit_num_accum_frames: 0,
			num_light_paths: 0,
			debug_rendering_attribute: 0,
			probe_pix_x: 0,
			probe_pix_y: 0,
			common_wavelength_samples: WavelengthSamples {
				lambdas: [0.0; crate::color::NUM_SPECTRAL_SAMPLES],
				selected_lambda_index: 0,
			},
			wavelength_probability: 0.0,
			camera_descriptor: CameraDescriptor::default(),
			discretized_spectrum_xbar: [0.0; NUM_CMF_STRATA],
			discretized_spectrum_ybar: [0.0; NUM_CMF_STRATA],
			discretized_spectrum_zbar: [0.0; NUM_CMF_STRATA],
			discretized_spectrum_integral_cmf: 0.0,
		}
	}
}

// Node data records, packed into the node descriptors.

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GeometryNodeData {
	pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TangentNodeData {
	pub tangent_type: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Float2NodeData {
	pub node0: ShaderNodePlugRecord,
	pub node1: ShaderNodePlugRecord,
	pub imm0: f32,
	pub imm1: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Float3NodeData {
	pub node0: ShaderNodePlugRecord,
	pub node1: ShaderNodePlugRecord,
	pub node2: ShaderNodePlugRecord,
	pub imm0: f32,
	pub imm1: f32,
	pub imm2: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Float4NodeData {
	pub node0: ShaderNodePlugRecord,
	pub node1: ShaderNodePlugRecord,
	pub node2: ShaderNodePlugRecord,
	pub node3: ShaderNodePlugRecord,
	pub imm0: f32,
	pub imm1: f32,
	pub imm2: f32,
	pub imm3: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ScaleAndOffsetFloatNodeData {
	pub node_value: ShaderNodePlugRecord,
	pub node_scale: ShaderNodePlugRecord,
	pub node_offset: ShaderNodePlugRecord,
	pub imm_scale: f32,
	pub imm_offset: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TripletSpectrumNodeData {
	pub value: RgbSpectrum,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegularSampledSpectrumNodeData {
	pub value: RgbSpectrum,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IrregularSampledSpectrumNodeData {
	pub value: RgbSpectrum,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Float3ToSpectrumNodeData {
	pub node_float3: ShaderNodePlugRecord,
	pub imm_float3: [f32; 3],
	pub spectrum_type: u32,
	pub color_space: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ScaleAndOffsetUvTextureMap2DNodeData {
	pub offset: [f32; 2],
	pub scale: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Image2DTextureNodeData {
	pub texture: u64,
	pub data_format: u32,
	pub spectrum_type: u32,
	pub color_space: u32,
	pub bump_type: u32,
	pub bump_coeff: u32,
	pub x_filter: u32,
	pub wrap_u: u32,
	pub wrap_v: u32,
	pub width: u32,
	pub height: u32,
	pub node_tex_coord: ShaderNodePlugRecord,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EnvironmentTextureNodeData {
	pub texture: u64,
	pub data_format: u32,
	pub color_space: u32,
}

// Material data records.

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MatteMaterialData {
	pub node_albedo: ShaderNodePlugRecord,
	pub imm_albedo: RgbSpectrum,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SpecularReflectionMaterialData {
	pub node_coeff: ShaderNodePlugRecord,
	pub node_eta: ShaderNodePlugRecord,
	pub node_k: ShaderNodePlugRecord,
	pub imm_coeff: RgbSpectrum,
	pub imm_eta: RgbSpectrum,
	pub imm_k: RgbSpectrum,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MicrofacetReflectionMaterialData {
	pub node_eta: ShaderNodePlugRecord,
	pub node_k: ShaderNodePlugRecord,
	pub node_roughness_anisotropy_rotation: ShaderNodePlugRecord,
	pub imm_eta: RgbSpectrum,
	pub imm_k: RgbSpectrum,
	pub imm_roughness: f32,
	pub imm_anisotropy: f32,
	pub imm_rotation: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiffuseEmitterMaterialData {
	pub node_emittance: ShaderNodePlugRecord,
	pub imm_emittance: RgbSpectrum,
	pub imm_scale: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EnvironmentEmitterMaterialData {
	pub node_emittance: ShaderNodePlugRecord,
	pub imm_emittance: RgbSpectrum,
	pub imm_scale: f32,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn descriptor_pack_round_trips() {
		let data = Float3NodeData {
			node0: ShaderNodePlugRecord::INVALID,
			node1: ShaderNodePlugRecord { node_type: 3, plug_type: 1, node_desc_index: 9, option: 0 },
			node2: ShaderNodePlugRecord::INVALID,
			imm0: 0.25,
			imm1: -1.5,
			imm2: 7.0,
		};
		let desc = SmallNodeDescriptor::pack(&data);
		let back: Float3NodeData = desc.unpack();
		assert_eq!(back.node1, data.node1);
		assert_eq!(back.imm1, data.imm1);
	}

	#[test]
	fn plug_conversions() {
		use ShaderNodePlugType::*;
		assert!(Float4.convertible_to(Float1));
		assert!(Float3.convertible_to(Point3D));
		assert!(Point3D.convertible_to(TextureCoordinates));
		assert!(!Spectrum.convertible_to(Float1));
		assert!(!Float1.convertible_to(Normal3D));
	}
}
