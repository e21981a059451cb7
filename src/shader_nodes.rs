use slotmap::SlotMap;

use crate::color::{
	create_triplet_spectrum, transform_to_rendering_rgb, ColorSpace, IrregularSampledSpectrum,
	RegularSampledSpectrum, RgbSpectrum, SpectrumType,
};
use crate::gpu::{Device, Stream};
use crate::image::LinearImage2D;
use crate::math::{clamp, PI};
use crate::object::{
	EnumTable, ImageHandle, ObjectInfo, OwnedParamValue, ParamValue, ParameterForm, ParameterInfo,
	ParameterType, Plug, ShaderNodeHandle,
};
use crate::sampling::ContinuousDistribution2D;
use crate::shared::{self, ShaderNodePlugRecord, ShaderNodePlugType, NUM_NODE_PLUG_TYPES};
use crate::{object, Error, Result};

pub const BUMP_COEFF_BITWIDTH: u32 = 5;

pub static ENUM_TANGENT_TYPE: EnumTable = EnumTable {
	name: "tangent type",
	members: &[("tc0 direction", 0), ("radial x", 1), ("radial y", 2), ("radial z", 3)],
};

pub static ENUM_SPECTRUM_TYPE: EnumTable = EnumTable {
	name: "spectrum type",
	members: &[("Reflectance", 0), ("Light Source", 1), ("NA", 2)],
};

pub static ENUM_COLOR_SPACE: EnumTable = EnumTable {
	name: "color space",
	members: &[("Rec709(D65) sRGB Gamma", 0), ("Rec709(D65)", 1), ("XYZ", 2)],
};

pub static ENUM_BUMP_TYPE: EnumTable = EnumTable {
	name: "bump type",
	members: &[("Normal Map (DirectX)", 0), ("Normal Map (OpenGL)", 1), ("Height Map", 2)],
};

pub static ENUM_TEXTURE_FILTER: EnumTable = EnumTable {
	name: "texture filter",
	members: &[("nearest", 0), ("linear", 1)],
};

pub static ENUM_TEXTURE_WRAP_MODE: EnumTable = EnumTable {
	name: "texture wrap mode",
	members: &[("repeat", 0), ("clamp to edge", 1), ("mirror", 2)],
};

pub fn spectrum_type_from_value(value: u32) -> SpectrumType {
	match value {
		0 => SpectrumType::Reflectance,
		1 => SpectrumType::LightSource,
		_ => SpectrumType::NA,
	}
}

pub fn color_space_from_value(value: u32) -> ColorSpace {
	match value {
		0 => ColorSpace::Rec709D65SrgbGamma,
		1 => ColorSpace::Rec709D65,
		_ => ColorSpace::XYZ,
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizeClass {
	Small,
	Medium,
	Large,
}

impl SizeClass {
	pub fn for_data_size(size_in_bytes: usize) -> Self {
		let dwords = size_in_bytes.div_ceil(4);
		if dwords <= shared::SMALL_NODE_DESC_DWORDS {
			SizeClass::Small
		} else if dwords <= shared::MEDIUM_NODE_DESC_DWORDS {
			SizeClass::Medium
		} else {
			assert!(dwords <= shared::LARGE_NODE_DESC_DWORDS);
			SizeClass::Large
		}
	}
}

/// Per-class callable programs and the node procedure-set slot they are
/// published under.
#[derive(Clone, Copy)]
pub struct ClassPrograms {
	pub node_procedure_set_index: u32,
	pub callables: [u32; NUM_NODE_PLUG_TYPES],
}

impl Default for ClassPrograms {
	fn default() -> Self {
		Self {
			node_procedure_set_index: shared::INVALID_SLOT,
			callables: [shared::INVALID_PROGRAM; NUM_NODE_PLUG_TYPES],
		}
	}
}

/// The procedure sets of all shader-node classes of one context.
#[derive(Default)]
pub struct ShaderNodeClassTable {
	pub geometry: ClassPrograms,
	pub tangent: ClassPrograms,
	pub float2: ClassPrograms,
	pub float3: ClassPrograms,
	pub float4: ClassPrograms,
	pub scale_and_offset_float: ClassPrograms,
	pub triplet_spectrum: ClassPrograms,
	pub regular_sampled_spectrum: ClassPrograms,
	pub irregular_sampled_spectrum: ClassPrograms,
	pub float3_to_spectrum: ClassPrograms,
	pub scale_and_offset_uv_texture_map_2d: ClassPrograms,
	pub image_2d_texture: ClassPrograms,
	pub environment_texture: ClassPrograms,
}

#[derive(Clone)]
pub enum ShaderNodeKind {
	Geometry,
	Tangent {
		imm_tangent_type: u32,
	},
	Float2 {
		node0: Option<Plug>,
		node1: Option<Plug>,
		imm0: f32,
		imm1: f32,
	},
	Float3 {
		node0: Option<Plug>,
		node1: Option<Plug>,
		node2: Option<Plug>,
		imm0: f32,
		imm1: f32,
		imm2: f32,
	},
	Float4 {
		node0: Option<Plug>,
		node1: Option<Plug>,
		node2: Option<Plug>,
		node3: Option<Plug>,
		imm0: f32,
		imm1: f32,
		imm2: f32,
		imm3: f32,
	},
	ScaleAndOffsetFloat {
		node_value: Option<Plug>,
		node_scale: Option<Plug>,
		node_offset: Option<Plug>,
		imm_scale: f32,
		imm_offset: f32,
	},
	TripletSpectrum {
		spectrum_type: SpectrumType,
		color_space: ColorSpace,
		imm_triplet: [f32; 3],
	},
	RegularSampledSpectrum {
		spectrum_type: SpectrumType,
		min_lambda: f32,
		max_lambda: f32,
		values: Vec<f32>,
	},
	IrregularSampledSpectrum {
		spectrum_type: SpectrumType,
		lambdas: Vec<f32>,
		values: Vec<f32>,
	},
	Float3ToSpectrum {
		spectrum_type: SpectrumType,
		color_space: ColorSpace,
		node_float3: Option<Plug>,
		imm_float3: [f32; 3],
	},
	ScaleAndOffsetUvTextureMap2D {
		offset: [f32; 2],
		scale: [f32; 2],
	},
	Image2DTexture {
		image: Option<ImageHandle>,
		bump_type: u32,
		bump_coeff: f32,
		x_filter: u32,
		wrap_u: u32,
		wrap_v: u32,
		node_tex_coord: Option<Plug>,
	},
	EnvironmentTexture {
		image: Option<ImageHandle>,
		x_filter: u32,
	},
}

pub struct ShaderNode {
	pub info: ObjectInfo,
	pub size_class: SizeClass,
	pub desc_index: u32,
	pub kind: ShaderNodeKind,
}

fn plug_set(kind: &ShaderNodeKind) -> &'static [ShaderNodePlugType] {
	use ShaderNodePlugType::*;
	match kind {
		ShaderNodeKind::Geometry => &[Point3D, Normal3D, Vector3D, TextureCoordinates],
		ShaderNodeKind::Tangent { .. } => &[Vector3D],
		ShaderNodeKind::Float2 { .. } => &[Float1, Float2],
		ShaderNodeKind::Float3 { .. } => &[Float1, Float2, Float3],
		ShaderNodeKind::Float4 { .. } => &[Float1, Float2, Float3, Float4],
		ShaderNodeKind::ScaleAndOffsetFloat { .. } => &[Float1],
		ShaderNodeKind::TripletSpectrum { .. }
		| ShaderNodeKind::RegularSampledSpectrum { .. }
		| ShaderNodeKind::IrregularSampledSpectrum { .. }
		| ShaderNodeKind::Float3ToSpectrum { .. } => &[Spectrum],
		ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { .. } => &[TextureCoordinates],
		ShaderNodeKind::Image2DTexture { .. } => &[Float1, Float2, Float3, Float4, Normal3D, Spectrum, Alpha],
		ShaderNodeKind::EnvironmentTexture { .. } => &[Spectrum],
	}
}

fn data_size(kind: &ShaderNodeKind) -> usize {
	use std::mem::size_of;
	match kind {
		ShaderNodeKind::Geometry => size_of::<shared::GeometryNodeData>(),
		ShaderNodeKind::Tangent { .. } => size_of::<shared::TangentNodeData>(),
		ShaderNodeKind::Float2 { .. } => size_of::<shared::Float2NodeData>(),
		ShaderNodeKind::Float3 { .. } => size_of::<shared::Float3NodeData>(),
		ShaderNodeKind::Float4 { .. } => size_of::<shared::Float4NodeData>(),
		ShaderNodeKind::ScaleAndOffsetFloat { .. } => size_of::<shared::ScaleAndOffsetFloatNodeData>(),
		ShaderNodeKind::TripletSpectrum { .. } => size_of::<shared::TripletSpectrumNodeData>(),
		ShaderNodeKind::RegularSampledSpectrum { .. } => size_of::<shared::RegularSampledSpectrumNodeData>(),
		ShaderNodeKind::IrregularSampledSpectrum { .. } => size_of::<shared::IrregularSampledSpectrumNodeData>(),
		ShaderNodeKind::Float3ToSpectrum { .. } => size_of::<shared::Float3ToSpectrumNodeData>(),
		ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { .. } => size_of::<shared::ScaleAndOffsetUvTextureMap2DNodeData>(),
		ShaderNodeKind::Image2DTexture { .. } => size_of::<shared::Image2DTextureNodeData>(),
		ShaderNodeKind::EnvironmentTexture { .. } => size_of::<shared::EnvironmentTextureNodeData>(),
	}
}

impl ShaderNode {
	pub fn new(kind: ShaderNodeKind, desc_index: u32, size_class: SizeClass) -> Self {
		let class = Self::class_of(&kind);
		Self { info: ObjectInfo::new(class), size_class, desc_index, kind }
	}

	pub fn size_class_of(kind: &ShaderNodeKind) -> SizeClass {
		SizeClass::for_data_size(data_size(kind))
	}

	pub fn class_of(kind: &ShaderNodeKind) -> &'static object::ClassId {
		match kind {
			ShaderNodeKind::Geometry => &object::GEOMETRY_SHADER_NODE,
			ShaderNodeKind::Tangent { .. } => &object::TANGENT_SHADER_NODE,
			ShaderNodeKind::Float2 { .. } => &object::FLOAT2_SHADER_NODE,
			ShaderNodeKind::Float3 { .. } => &object::FLOAT3_SHADER_NODE,
			ShaderNodeKind::Float4 { .. } => &object::FLOAT4_SHADER_NODE,
			ShaderNodeKind::ScaleAndOffsetFloat { .. } => &object::SCALE_AND_OFFSET_FLOAT_SHADER_NODE,
			ShaderNodeKind::TripletSpectrum { .. } => &object::TRIPLET_SPECTRUM_SHADER_NODE,
			ShaderNodeKind::RegularSampledSpectrum { .. } => &object::REGULAR_SAMPLED_SPECTRUM_SHADER_NODE,
			ShaderNodeKind::IrregularSampledSpectrum { .. } => &object::IRREGULAR_SAMPLED_SPECTRUM_SHADER_NODE,
			ShaderNodeKind::Float3ToSpectrum { .. } => &object::FLOAT3_TO_SPECTRUM_SHADER_NODE,
			ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { .. } => {
				&object::SCALE_AND_OFFSET_UV_TEXTURE_MAP_2D_SHADER_NODE
			}
			ShaderNodeKind::Image2DTexture { .. } => &object::IMAGE_2D_TEXTURE_SHADER_NODE,
			ShaderNodeKind::EnvironmentTexture { .. } => &object::ENVIRONMENT_TEXTURE_SHADER_NODE,
		}
	}

	pub fn provides_plug(&self, plug_type: ShaderNodePlugType) -> bool {
		plug_set(&self.kind).contains(&plug_type)
	}

	pub fn parameter_infos(&self) -> &'static [ParameterInfo] {
		match self.kind {
			ShaderNodeKind::Geometry => &[],
			ShaderNodeKind::Tangent { .. } => TANGENT_PARAMS,
			ShaderNodeKind::Float2 { .. } => FLOAT2_PARAMS,
			ShaderNodeKind::Float3 { .. } => FLOAT3_PARAMS,
			ShaderNodeKind::Float4 { .. } => FLOAT4_PARAMS,
			ShaderNodeKind::ScaleAndOffsetFloat { .. } => SCALE_AND_OFFSET_FLOAT_PARAMS,
			ShaderNodeKind::TripletSpectrum { .. } => TRIPLET_SPECTRUM_PARAMS,
			ShaderNodeKind::RegularSampledSpectrum { .. } => REGULAR_SAMPLED_SPECTRUM_PARAMS,
			ShaderNodeKind::IrregularSampledSpectrum { .. } => IRREGULAR_SAMPLED_SPECTRUM_PARAMS,
			ShaderNodeKind::Float3ToSpectrum { .. } => FLOAT3_TO_SPECTRUM_PARAMS,
			ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { .. } => UV_TEXTURE_MAP_PARAMS,
			ShaderNodeKind::Image2DTexture { .. } => IMAGE_2D_TEXTURE_PARAMS,
			ShaderNodeKind::EnvironmentTexture { .. } => ENVIRONMENT_TEXTURE_PARAMS,
		}
	}
}

static TANGENT_PARAMS: &[ParameterInfo] = &[ParameterInfo {
	name: "tangent type",
	forms: ParameterForm::IMMEDIATE_VALUE,
	param_type: ParameterType::Enum(&ENUM_TANGENT_TYPE),
}];

static FLOAT2_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "0", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "1", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
];

static FLOAT3_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "0", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "1", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "2", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
];

static FLOAT4_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "0", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "1", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "2", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "3", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
];

static SCALE_AND_OFFSET_FLOAT_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "value", forms: ParameterForm::NODE_PLUG, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "scale", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "offset", forms: ParameterForm::BOTH, param_type: ParameterType::Float(1) },
];

static TRIPLET_SPECTRUM_PARAMS: &[ParameterInfo] = &[
	ParameterInfo {
		name: "spectrum type",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_SPECTRUM_TYPE),
	},
	ParameterInfo {
		name: "color space",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_COLOR_SPACE),
	},
	ParameterInfo { name: "triplet", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(3) },
];

static REGULAR_SAMPLED_SPECTRUM_PARAMS: &[ParameterInfo] = &[
	ParameterInfo {
		name: "spectrum type",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_SPECTRUM_TYPE),
	},
	ParameterInfo { name: "min wavelength", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "max wavelength", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(1) },
	ParameterInfo { name: "values", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(0) },
];

static IRREGULAR_SAMPLED_SPECTRUM_PARAMS: &[ParameterInfo] = &[
	ParameterInfo {
		name: "spectrum type",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_SPECTRUM_TYPE),
	},
	ParameterInfo { name: "wavelengths", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(0) },
	ParameterInfo { name: "values", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(0) },
];

static FLOAT3_TO_SPECTRUM_PARAMS: &[ParameterInfo] = &[
	ParameterInfo {
		name: "spectrum type",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_SPECTRUM_TYPE),
	},
	ParameterInfo {
		name: "color space",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_COLOR_SPACE),
	},
	ParameterInfo { name: "value", forms: ParameterForm::BOTH, param_type: ParameterType::Float(3) },
];

static UV_TEXTURE_MAP_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "offset", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(2) },
	ParameterInfo { name: "scale", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(2) },
];

static IMAGE_2D_TEXTURE_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "image", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Image },
	ParameterInfo {
		name: "bump type",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_BUMP_TYPE),
	},
	ParameterInfo { name: "bump coeff", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Float(1) },
	ParameterInfo {
		name: "filter",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_TEXTURE_FILTER),
	},
	ParameterInfo {
		name: "wrap u",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_TEXTURE_WRAP_MODE),
	},
	ParameterInfo {
		name: "wrap v",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_TEXTURE_WRAP_MODE),
	},
	ParameterInfo { name: "texcoord", forms: ParameterForm::NODE_PLUG, param_type: ParameterType::Float(2) },
];

static ENVIRONMENT_TEXTURE_PARAMS: &[ParameterInfo] = &[
	ParameterInfo { name: "image", forms: ParameterForm::IMMEDIATE_VALUE, param_type: ParameterType::Image },
	ParameterInfo {
		name: "filter",
		forms: ParameterForm::IMMEDIATE_VALUE,
		param_type: ParameterType::Enum(&ENUM_TEXTURE_FILTER),
	},
];

fn bad_param(name: &str) -> Error {
	Error::InvalidArgument(format!("unknown parameter \"{}\"", name))
}

fn bad_length(name: &str, expected: usize, got: usize) -> Error {
	Error::InvalidArgument(format!(
		"parameter \"{}\" expects {} values, got {}",
		name, expected, got
	))
}

fn bad_enum(name: &str, member: &str) -> Error {
	Error::InvalidArgument(format!("\"{}\" is not a member of enum \"{}\"", member, name))
}

fn bad_plug(name: &str) -> Error {
	Error::InvalidArgument(format!("plug is not convertible to parameter \"{}\"", name))
}

fn expect_floats<'a>(name: &str, value: &ParamValue<'a>, length: usize) -> Result<&'a [f32]> {
	match value {
		ParamValue::Floats(values) if values.len() == length => Ok(values),
		ParamValue::Floats(values) => Err(bad_length(name, length, values.len())),
		_ => Err(Error::InvalidArgument(format!("parameter \"{}\" expects floats", name))),
	}
}

fn expect_scalar_plug(name: &str, plug: Plug) -> Result<Plug> {
	if plug.plug_type.convertible_to(ShaderNodePlugType::Float1) {
		Ok(plug)
	} else {
		Err(bad_plug(name))
	}
}

fn enum_value(table: &EnumTable, member: &str) -> Result<u32> {
	table.value_of(member).ok_or_else(|| bad_enum(table.name, member))
}

impl ShaderNode {
	/// Applies one parameter. The caller marks the node dirty on success.
	pub fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
		match &mut self.kind {
			ShaderNodeKind::Geometry => Err(bad_param(name)),
			ShaderNodeKind::Tangent { imm_tangent_type } => match (name, value) {
				("tangent type", ParamValue::EnumMember(member)) => {
					*imm_tangent_type = enum_value(&ENUM_TANGENT_TYPE, member)?;
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float2 { node0, node1, imm0, imm1 } => match (name, value) {
				("0", ParamValue::Plug(plug)) => {
					*node0 = Some(expect_scalar_plug(name, *plug)?);
					Ok(())
				}
				("1", ParamValue::Plug(plug)) => {
					*node1 = Some(expect_scalar_plug(name, *plug)?);
					Ok(())
				}
				("0", v) => {
					*imm0 = expect_floats(name, v, 1)?[0];
					Ok(())
				}
				("1", v) => {
					*imm1 = expect_floats(name, v, 1)?[0];
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float3 { node0, node1, node2, imm0, imm1, imm2 } => match (name, value) {
				("0", ParamValue::Plug(plug)) => {
					*node0 = Some(expect_scalar_plug(name, *plug)?);
					Ok(())
				}
				("1", ParamValue::Plug(plug)) => {
					*node1 = Some(expect_scalar_plug(name, *plug)?);
					Ok(())
				}
				("2", ParamValue::Plug(plug)) => {
					*node2 = Some(expect_scalar_plug(name, *plug)?);
					Ok(())
				}
				("0", v) => {
					*imm0 = expect_floats(name, v, 1)?[0];
					Ok(())
				}
				("1", v) => {
					*imm1 = expect_floats(name, v, 1)?[0];
					Ok(())
				}
				("2", v) => {
					*imm2 = expect_floats(name, v, 1)?[0];
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float4 { node0, node1, node2, node3, imm0, imm1, imm2, imm3 } => {
				match (name, value) {
					("0", ParamValue::Plug(plug)) => {
						*node0 = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("1", ParamValue::Plug(plug)) => {
						*node1 = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("2", ParamValue::Plug(plug)) => {
						*node2 = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("3", ParamValue::Plug(plug)) => {
						*node3 = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("0", v) => {
						*imm0 = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("1", v) => {
						*imm1 = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("2", v) => {
						*imm2 = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("3", v) => {
						*imm3 = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::ScaleAndOffsetFloat { node_value, node_scale, node_offset, imm_scale, imm_offset } => {
				match (name, value) {
					("value", ParamValue::Plug(plug)) => {
						*node_value = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("scale", ParamValue::Plug(plug)) => {
						*node_scale = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("offset", ParamValue::Plug(plug)) => {
						*node_offset = Some(expect_scalar_plug(name, *plug)?);
						Ok(())
					}
					("scale", v) => {
						*imm_scale = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("offset", v) => {
						*imm_offset = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::TripletSpectrum { spectrum_type, color_space, imm_triplet } => {
				match (name, value) {
					("spectrum type", ParamValue::EnumMember(member)) => {
						*spectrum_type = spectrum_type_from_value(enum_value(&ENUM_SPECTRUM_TYPE, member)?);
						Ok(())
					}
					("color space", ParamValue::EnumMember(member)) => {
						*color_space = color_space_from_value(enum_value(&ENUM_COLOR_SPACE, member)?);
						Ok(())
					}
					("triplet", v) => {
						let values = expect_floats(name, v, 3)?;
						imm_triplet.copy_from_slice(values);
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::RegularSampledSpectrum { spectrum_type, min_lambda, max_lambda, values } => {
				match (name, value) {
					("spectrum type", ParamValue::EnumMember(member)) => {
						*spectrum_type = spectrum_type_from_value(enum_value(&ENUM_SPECTRUM_TYPE, member)?);
						Ok(())
					}
					("min wavelength", v) => {
						*min_lambda = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("max wavelength", v) => {
						*max_lambda = expect_floats(name, v, 1)?[0];
						Ok(())
					}
					("values", ParamValue::Floats(new_values)) => {
						if new_values.is_empty() {
							return Err(bad_length(name, 1, 0));
						}
						*values = new_values.to_vec();
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::IrregularSampledSpectrum { spectrum_type, lambdas, values } => {
				match (name, value) {
					("spectrum type", ParamValue::EnumMember(member)) => {
						*spectrum_type = spectrum_type_from_value(enum_value(&ENUM_SPECTRUM_TYPE, member)?);
						Ok(())
					}
					("wavelengths", ParamValue::Floats(new_lambdas)) => {
						if new_lambdas.is_empty() {
							return Err(bad_length(name, 1, 0));
						}
						if new_lambdas.windows(2).any(|w| w[0] > w[1]) {
							return Err(Error::InvalidArgument(
								"wavelengths must be sorted ascending".to_string(),
							));
						}
						*lambdas = new_lambdas.to_vec();
						Ok(())
					}
					("values", ParamValue::Floats(new_values)) => {
						if new_values.len() != lambdas.len() {
							return Err(bad_length(name, lambdas.len(), new_values.len()));
						}
						*values = new_values.to_vec();
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::Float3ToSpectrum { spectrum_type, color_space, node_float3, imm_float3 } => {
				match (name, value) {
					("spectrum type", ParamValue::EnumMember(member)) => {
						*spectrum_type = spectrum_type_from_value(enum_value(&ENUM_SPECTRUM_TYPE, member)?);
						Ok(())
					}
					("color space", ParamValue::EnumMember(member)) => {
						*color_space = color_space_from_value(enum_value(&ENUM_COLOR_SPACE, member)?);
						Ok(())
					}
					("value", ParamValue::Plug(plug)) => {
						if !plug.plug_type.convertible_to(ShaderNodePlugType::Float3) {
							return Err(bad_plug(name));
						}
						*node_float3 = Some(*plug);
						Ok(())
					}
					("value", v) => {
						let values = expect_floats(name, v, 3)?;
						imm_float3.copy_from_slice(values);
						Ok(())
					}
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { offset, scale } => match (name, value) {
				("offset", v) => {
					offset.copy_from_slice(expect_floats(name, v, 2)?);
					Ok(())
				}
				("scale", v) => {
					scale.copy_from_slice(expect_floats(name, v, 2)?);
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Image2DTexture {
				image,
				bump_type,
				bump_coeff,
				x_filter,
				wrap_u,
				wrap_v,
				node_tex_coord,
			} => match (name, value) {
				("image", ParamValue::Image(handle)) => {
					*image = *handle;
					Ok(())
				}
				("bump type", ParamValue::EnumMember(member)) => {
					*bump_type = enum_value(&ENUM_BUMP_TYPE, member)?;
					Ok(())
				}
				("bump coeff", v) => {
					let min_coeff = 1.0 / (1 << (BUMP_COEFF_BITWIDTH - 1)) as f32;
					*bump_coeff = clamp(expect_floats(name, v, 1)?[0], min_coeff, 2.0);
					Ok(())
				}
				("filter", ParamValue::EnumMember(member)) => {
					*x_filter = enum_value(&ENUM_TEXTURE_FILTER, member)?;
					Ok(())
				}
				("wrap u", ParamValue::EnumMember(member)) => {
					*wrap_u = enum_value(&ENUM_TEXTURE_WRAP_MODE, member)?;
					Ok(())
				}
				("wrap v", ParamValue::EnumMember(member)) => {
					*wrap_v = enum_value(&ENUM_TEXTURE_WRAP_MODE, member)?;
					Ok(())
				}
				("texcoord", ParamValue::Plug(plug)) => {
					if !plug.plug_type.convertible_to(ShaderNodePlugType::TextureCoordinates) {
						return Err(bad_plug(name));
					}
					*node_tex_coord = Some(*plug);
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::EnvironmentTexture { image, x_filter } => match (name, value) {
				("image", ParamValue::Image(handle)) => {
					*image = *handle;
					Ok(())
				}
				("filter", ParamValue::EnumMember(member)) => {
					*x_filter = enum_value(&ENUM_TEXTURE_FILTER, member)?;
					Ok(())
				}
				_ => Err(bad_param(name)),
			},
		}
	}

	pub fn get_param(&self, name: &str) -> Result<OwnedParamValue> {
		match &self.kind {
			ShaderNodeKind::Geometry => Err(bad_param(name)),
			ShaderNodeKind::Tangent { imm_tangent_type } => match name {
				"tangent type" => Ok(OwnedParamValue::EnumMember(
					ENUM_TANGENT_TYPE.member_of(*imm_tangent_type).unwrap_or("tc0 direction"),
				)),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float2 { imm0, imm1, .. } => match name {
				"0" => Ok(OwnedParamValue::Floats(vec![*imm0])),
				"1" => Ok(OwnedParamValue::Floats(vec![*imm1])),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float3 { imm0, imm1, imm2, .. } => match name {
				"0" => Ok(OwnedParamValue::Floats(vec![*imm0])),
				"1" => Ok(OwnedParamValue::Floats(vec![*imm1])),
				"2" => Ok(OwnedParamValue::Floats(vec![*imm2])),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float4 { imm0, imm1, imm2, imm3, .. } => match name {
				"0" => Ok(OwnedParamValue::Floats(vec![*imm0])),
				"1" => Ok(OwnedParamValue::Floats(vec![*imm1])),
				"2" => Ok(OwnedParamValue::Floats(vec![*imm2])),
				"3" => Ok(OwnedParamValue::Floats(vec![*imm3])),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::ScaleAndOffsetFloat { node_value, imm_scale, imm_offset, .. } => match name {
				"value" => Ok(OwnedParamValue::Plug(*node_value)),
				"scale" => Ok(OwnedParamValue::Floats(vec![*imm_scale])),
				"offset" => Ok(OwnedParamValue::Floats(vec![*imm_offset])),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::TripletSpectrum { spectrum_type, color_space, imm_triplet } => match name {
				"spectrum type" => Ok(OwnedParamValue::EnumMember(
					ENUM_SPECTRUM_TYPE.member_of(*spectrum_type as u32).unwrap_or("NA"),
				)),
				"color space" => Ok(OwnedParamValue::EnumMember(
					ENUM_COLOR_SPACE.member_of(*color_space as u32).unwrap_or("XYZ"),
				)),
				"triplet" => Ok(OwnedParamValue::Floats(imm_triplet.to_vec())),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::RegularSampledSpectrum { spectrum_type, min_lambda, max_lambda, values } => {
				match name {
					"spectrum type" => Ok(OwnedParamValue::EnumMember(
						ENUM_SPECTRUM_TYPE.member_of(*spectrum_type as u32).unwrap_or("NA"),
					)),
					"min wavelength" => Ok(OwnedParamValue::Floats(vec![*min_lambda])),
					"max wavelength" => Ok(OwnedParamValue::Floats(vec![*max_lambda])),
					"values" => Ok(OwnedParamValue::Floats(values.clone())),
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::IrregularSampledSpectrum { spectrum_type, lambdas, values } => match name {
				"spectrum type" => Ok(OwnedParamValue::EnumMember(
					ENUM_SPECTRUM_TYPE.member_of(*spectrum_type as u32).unwrap_or("NA"),
				)),
				"wavelengths" => Ok(OwnedParamValue::Floats(lambdas.clone())),
				"values" => Ok(OwnedParamValue::Floats(values.clone())),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Float3ToSpectrum { spectrum_type, color_space, node_float3, imm_float3 } => {
				match name {
					"spectrum type" => Ok(OwnedParamValue::EnumMember(
						ENUM_SPECTRUM_TYPE.member_of(*spectrum_type as u32).unwrap_or("NA"),
					)),
					"color space" => Ok(OwnedParamValue::EnumMember(
						ENUM_COLOR_SPACE.member_of(*color_space as u32).unwrap_or("XYZ"),
					)),
					"value" => match node_float3 {
						Some(plug) => Ok(OwnedParamValue::Plug(Some(*plug))),
						None => Ok(OwnedParamValue::Floats(imm_float3.to_vec())),
					},
					_ => Err(bad_param(name)),
				}
			}
			ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { offset, scale } => match name {
				"offset" => Ok(OwnedParamValue::Floats(offset.to_vec())),
				"scale" => Ok(OwnedParamValue::Floats(scale.to_vec())),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::Image2DTexture {
				image,
				bump_type,
				bump_coeff,
				x_filter,
				wrap_u,
				wrap_v,
				node_tex_coord,
			} => match name {
				"image" => Ok(OwnedParamValue::Image(*image)),
				"bump type" => Ok(OwnedParamValue::EnumMember(
					ENUM_BUMP_TYPE.member_of(*bump_type).unwrap_or("Normal Map (DirectX)"),
				)),
				"bump coeff" => Ok(OwnedParamValue::Floats(vec![*bump_coeff])),
				"filter" => Ok(OwnedParamValue::EnumMember(
					ENUM_TEXTURE_FILTER.member_of(*x_filter).unwrap_or("linear"),
				)),
				"wrap u" => Ok(OwnedParamValue::EnumMember(
					ENUM_TEXTURE_WRAP_MODE.member_of(*wrap_u).unwrap_or("repeat"),
				)),
				"wrap v" => Ok(OwnedParamValue::EnumMember(
					ENUM_TEXTURE_WRAP_MODE.member_of(*wrap_v).unwrap_or("repeat"),
				)),
				"texcoord" => Ok(OwnedParamValue::Plug(*node_tex_coord)),
				_ => Err(bad_param(name)),
			},
			ShaderNodeKind::EnvironmentTexture { image, x_filter } => match name {
				"image" => Ok(OwnedParamValue::Image(*image)),
				"filter" => Ok(OwnedParamValue::EnumMember(
					ENUM_TEXTURE_FILTER.member_of(*x_filter).unwrap_or("linear"),
				)),
				_ => Err(bad_param(name)),
			},
		}
	}
}

fn class_programs<'a>(table: &'a ShaderNodeClassTable, kind: &ShaderNodeKind) -> &'a ClassPrograms {
	match kind {
		ShaderNodeKind::Geometry => &table.geometry,
		ShaderNodeKind::Tangent { .. } => &table.tangent,
		ShaderNodeKind::Float2 { .. } => &table.float2,
		ShaderNodeKind::Float3 { .. } => &table.float3,
		ShaderNodeKind::Float4 { .. } => &table.float4,
		ShaderNodeKind::ScaleAndOffsetFloat { .. } => &table.scale_and_offset_float,
		ShaderNodeKind::TripletSpectrum { .. } => &table.triplet_spectrum,
		ShaderNodeKind::RegularSampledSpectrum { .. } => &table.regular_sampled_spectrum,
		ShaderNodeKind::IrregularSampledSpectrum { .. } => &table.irregular_sampled_spectrum,
		ShaderNodeKind::Float3ToSpectrum { .. } => &table.float3_to_spectrum,
		ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { .. } => &table.scale_and_offset_uv_texture_map_2d,
		ShaderNodeKind::Image2DTexture { .. } => &table.image_2d_texture,
		ShaderNodeKind::EnvironmentTexture { .. } => &table.environment_texture,
	}
}

/// Serializes a plug reference, or the invalid sentinel for `None`.
pub fn plug_record(
	plug: Option<Plug>,
	nodes: &SlotMap<ShaderNodeHandle, ShaderNode>,
	table: &ShaderNodeClassTable,
) -> ShaderNodePlugRecord {
	let Some(plug) = plug else {
		return ShaderNodePlugRecord::INVALID;
	};
	let Some(node) = nodes.get(plug.node) else {
		return ShaderNodePlugRecord::INVALID;
	};
	let programs = class_programs(table, &node.kind);
	ShaderNodePlugRecord {
		node_type: programs.node_procedure_set_index,
		plug_type: plug.plug_type as u32,
		node_desc_index: node.desc_index,
		option: plug.option,
	}
}

/// The slot pools shader-node serialization writes into. Owned by the
/// renderer context; grouped so serialization can borrow them as one unit.
pub struct NodeDescriptorPools {
	pub node_procedure_sets: crate::gpu::slot::SlotBuffer<shared::NodeProcedureSet>,
	pub small: crate::gpu::slot::SlotBuffer<shared::SmallNodeDescriptor>,
	pub medium: crate::gpu::slot::SlotBuffer<shared::MediumNodeDescriptor>,
	pub large: crate::gpu::slot::SlotBuffer<shared::LargeNodeDescriptor>,
}

impl NodeDescriptorPools {
	pub fn new(device: &Device) -> Result<Self> {
		Ok(Self {
			node_procedure_sets: crate::gpu::slot::SlotBuffer::new(device, 256)?,
			small: crate::gpu::slot::SlotBuffer::new(device, 8192)?,
			medium: crate::gpu::slot::SlotBuffer::new(device, 8192)?,
			large: crate::gpu::slot::SlotBuffer::new(device, 1024)?,
		})
	}

	pub fn allocate(&mut self, size_class: SizeClass) -> Result<u32> {
		match size_class {
			SizeClass::Small => self.small.allocate(),
			SizeClass::Medium => self.medium.allocate(),
			SizeClass::Large => self.large.allocate(),
		}
	}

	pub fn release(&mut self, size_class: SizeClass, index: u32) {
		match size_class {
			SizeClass::Small => self.small.release(index),
			SizeClass::Medium => self.medium.release(index),
			SizeClass::Large => self.large.release(index),
		}
	}
}

fn update_descriptor<T: Copy>(
	pools: &NodeDescriptorPools,
	size_class: SizeClass,
	index: u32,
	data: &T,
	stream: &Stream,
) {
	match size_class {
		SizeClass::Small => pools.small.update(index, &shared::SmallNodeDescriptor::pack(data), stream),
		SizeClass::Medium => pools.medium.update(index, &shared::MediumNodeDescriptor::pack(data), stream),
		SizeClass::Large => pools.large.update(index, &shared::LargeNodeDescriptor::pack(data), stream),
	}
}

/// Serializes one node's current state into its descriptor slot.
pub fn setup_descriptor(
	node: &ShaderNode,
	nodes: &SlotMap<ShaderNodeHandle, ShaderNode>,
	images: &SlotMap<ImageHandle, LinearImage2D>,
	null_image_2d: ImageHandle,
	null_image_env: ImageHandle,
	table: &ShaderNodeClassTable,
	pools: &NodeDescriptorPools,
	stream: &Stream,
) {
	let (size_class, index) = (node.size_class, node.desc_index);
	match &node.kind {
		ShaderNodeKind::Geometry => {
			let data = shared::GeometryNodeData::default();
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Tangent { imm_tangent_type } => {
			let data = shared::TangentNodeData { tangent_type: *imm_tangent_type };
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Float2 { node0, node1, imm0, imm1 } => {
			let data = shared::Float2NodeData {
				node0: plug_record(*node0, nodes, table),
				node1: plug_record(*node1, nodes, table),
				imm0: *imm0,
				imm1: *imm1,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Float3 { node0, node1, node2, imm0, imm1, imm2 } => {
			let data = shared::Float3NodeData {
				node0: plug_record(*node0, nodes, table),
				node1: plug_record(*node1, nodes, table),
				node2: plug_record(*node2, nodes, table),
				imm0: *imm0,
				imm1: *imm1,
				imm2: *imm2,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Float4 { node0, node1, node2, node3, imm0, imm1, imm2, imm3 } => {
			let data = shared::Float4NodeData {
				node0: plug_record(*node0, nodes, table),
				node1: plug_record(*node1, nodes, table),
				node2: plug_record(*node2, nodes, table),
				node3: plug_record(*node3, nodes, table),
				imm0: *imm0,
				imm1: *imm1,
				imm2: *imm2,
				imm3: *imm3,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::ScaleAndOffsetFloat { node_value, node_scale, node_offset, imm_scale, imm_offset } => {
			let data = shared::ScaleAndOffsetFloatNodeData {
				node_value: plug_record(*node_value, nodes, table),
				node_scale: plug_record(*node_scale, nodes, table),
				node_offset: plug_record(*node_offset, nodes, table),
				imm_scale: *imm_scale,
				imm_offset: *imm_offset,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::TripletSpectrum { spectrum_type, color_space, imm_triplet } => {
			let data = shared::TripletSpectrumNodeData {
				value: create_triplet_spectrum(
					*spectrum_type,
					*color_space,
					imm_triplet[0],
					imm_triplet[1],
					imm_triplet[2],
				),
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::RegularSampledSpectrum { spectrum_type, min_lambda, max_lambda, values } => {
			// Rendering is tristimulus; evaluate the spectrum here instead
			// of shipping the sample table.
			let spectrum = RegularSampledSpectrum {
				min_lambda: *min_lambda,
				max_lambda: *max_lambda,
				values,
			};
			let rgb = transform_to_rendering_rgb(*spectrum_type, spectrum.to_xyz());
			let data = shared::RegularSampledSpectrumNodeData {
				value: RgbSpectrum::new(rgb[0].max(0.0), rgb[1].max(0.0), rgb[2].max(0.0)),
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::IrregularSampledSpectrum { spectrum_type, lambdas, values } => {
			let spectrum = IrregularSampledSpectrum { lambdas, values };
			let rgb = transform_to_rendering_rgb(*spectrum_type, spectrum.to_xyz());
			let data = shared::IrregularSampledSpectrumNodeData {
				value: RgbSpectrum::new(rgb[0].max(0.0), rgb[1].max(0.0), rgb[2].max(0.0)),
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Float3ToSpectrum { spectrum_type, color_space, node_float3, imm_float3 } => {
			let data = shared::Float3ToSpectrumNodeData {
				node_float3: plug_record(*node_float3, nodes, table),
				imm_float3: *imm_float3,
				spectrum_type: *spectrum_type as u32,
				color_space: *color_space as u32,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::ScaleAndOffsetUvTextureMap2D { offset, scale } => {
			let data = shared::ScaleAndOffsetUvTextureMap2DNodeData { offset: *offset, scale: *scale };
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::Image2DTexture {
			image,
			bump_type,
			bump_coeff,
			x_filter,
			wrap_u,
			wrap_v,
			node_tex_coord,
		} => {
			let handle = image.unwrap_or(null_image_2d);
			let image = &images[handle];
			// Data read through HW sRGB degamma reaches the kernel linear.
			let mut color_space = image.color_space();
			if image.needs_hw_srgb_degamma() && color_space == ColorSpace::Rec709D65SrgbGamma {
				color_space = ColorSpace::Rec709D65;
			}
			let max_int_coeff = (1u32 << BUMP_COEFF_BITWIDTH) - 1;
			let int_coeff = (max_int_coeff as f32 * bump_coeff * 0.5).round() as u32;
			let data = shared::Image2DTextureNodeData {
				texture: image.texture_object().0,
				data_format: image.data_format() as u32,
				spectrum_type: image.spectrum_type() as u32,
				color_space: color_space as u32,
				bump_type: *bump_type,
				bump_coeff: int_coeff.min(max_int_coeff),
				x_filter: *x_filter,
				wrap_u: *wrap_u,
				wrap_v: *wrap_v,
				width: image.width(),
				height: image.height(),
				node_tex_coord: plug_record(*node_tex_coord, nodes, table),
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
		ShaderNodeKind::EnvironmentTexture { image, .. } => {
			let handle = image.unwrap_or(null_image_env);
			let image = &images[handle];
			let data = shared::EnvironmentTextureNodeData {
				texture: image.texture_object().0,
				data_format: image.data_format() as u32,
				color_space: image.color_space() as u32,
			};
			update_descriptor(pools, size_class, index, &data, stream);
		}
	}
}

/// Builds the environment importance map for an environment-texture node:
/// solid-angle-weighted luminance over a downsampled latitude-longitude grid.
pub fn create_importance_map(
	node: &ShaderNode,
	images: &SlotMap<ImageHandle, LinearImage2D>,
	null_image_env: ImageHandle,
	device: &Device,
	stream: &Stream,
) -> Result<ContinuousDistribution2D> {
	let ShaderNodeKind::EnvironmentTexture { image, .. } = &node.kind else {
		return Err(Error::InvalidArgument(
			"importance maps come from environment-texture nodes".to_string(),
		));
	};
	let image = &images[image.unwrap_or(null_image_env)];
	let map_width = (image.width() / 4).max(1);
	let map_height = (image.height() / 4).max(1);
	let shrunk = image.shrunk_texels(map_width, map_height);
	let mut luminance = LinearImage2D::luminance_of(&shrunk);
	for y in 0..map_height {
		let theta = PI * (y as f32 + 0.5) / map_height as f32;
		let sin_theta = theta.sin();
		for x in 0..map_width {
			luminance[(y * map_width + x) as usize] *= sin_theta;
		}
	}
	ContinuousDistribution2D::new(device, stream, &luminance, map_width as usize, map_height as usize)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gpu::DeviceImpl;
	use crate::image::DataFormat;

	#[test]
	fn importance_map_weights_rows_by_sin_theta() {
		let device = Device::new();
		let stream = device.create_stream();
		let mut images: SlotMap<ImageHandle, LinearImage2D> = SlotMap::with_key();
		let data: Vec<u8> = std::iter::repeat(1.0f32.to_le_bytes())
			.take(16 * 16 * 4)
			.flatten()
			.collect();
		let handle = images.insert(
			LinearImage2D::new(
				&device,
				&data,
				16,
				16,
				DataFormat::Rgba32F,
				SpectrumType::LightSource,
				ColorSpace::Rec709D65,
			)
			.unwrap(),
		);
		let node = ShaderNode::new(
			ShaderNodeKind::EnvironmentTexture { image: Some(handle), x_filter: 1 },
			0,
			SizeClass::Small,
		);
		// A 16x16 source downsamples to a 4x4 map; for uniform luminance the
		// marginal over rows must follow the solid-angle weights.
		let map = create_importance_map(&node, &images, handle, &device, &stream).unwrap();
		let pdf = map.marginal_pdf();
		assert_eq!(pdf.len(), 4);
		let weights: Vec<f32> = (0..4).map(|y| (PI * (y as f32 + 0.5) / 4.0).sin()).collect();
		let sum: f32 = weights.iter().sum();
		for (y, &p) in pdf.iter().enumerate() {
			let expected = 4.0 * weights[y] / sum;
			assert!((p - expected).abs() < 1e-4, "row {}: {} vs {}", y, p, expected);
		}
	}

	#[test]
	fn size_class_selection() {
		assert_eq!(SizeClass::for_data_size(16), SizeClass::Small);
		assert_eq!(SizeClass::for_data_size(shared::SMALL_NODE_DESC_DWORDS * 4), SizeClass::Small);
		assert_eq!(SizeClass::for_data_size(shared::SMALL_NODE_DESC_DWORDS * 4 + 4), SizeClass::Medium);
		assert_eq!(SizeClass::for_data_size(shared::MEDIUM_NODE_DESC_DWORDS * 4), SizeClass::Medium);
		assert_eq!(SizeClass::for_data_size(shared::MEDIUM_NODE_DESC_DWORDS * 4 + 4), SizeClass::Large);
	}

	#[test]
	fn float4_lands_in_the_medium_class() {
		let kind = ShaderNodeKind::Float4 {
			node0: None,
			node1: None,
			node2: None,
			node3: None,
			imm0: 0.0,
			imm1: 0.0,
			imm2: 0.0,
			imm3: 0.0,
		};
		assert_eq!(ShaderNode::size_class_of(&kind), SizeClass::Medium);
	}

	#[test]
	fn setters_reject_unknown_names_and_bad_lengths() {
		let mut node = ShaderNode::new(
			ShaderNodeKind::TripletSpectrum {
				spectrum_type: SpectrumType::Reflectance,
				color_space: ColorSpace::Rec709D65,
				imm_triplet: [0.18; 3],
			},
			0,
			SizeClass::Small,
		);
		assert!(node.set_param("nope", &ParamValue::Floats(&[1.0])).is_err());
		assert!(node.set_param("triplet", &ParamValue::Floats(&[1.0, 2.0])).is_err());
		assert!(node
			.set_param("spectrum type", &ParamValue::EnumMember("Banana"))
			.is_err());
		assert!(node
			.set_param("triplet", &ParamValue::Floats(&[1.0, 0.5, 0.2]))
			.is_ok());
	}

	#[test]
	fn bump_coeff_clamps_to_representable_range() {
		let mut node = ShaderNode::new(
			ShaderNodeKind::Image2DTexture {
				image: None,
				bump_type: 0,
				bump_coeff: 1.0,
				x_filter: 1,
				wrap_u: 0,
				wrap_v: 0,
				node_tex_coord: None,
			},
			0,
			SizeClass::Small,
		);
		node.set_param("bump coeff", &ParamValue::Floats(&[0.0])).unwrap();
		match node.get_param("bump coeff").unwrap() {
			OwnedParamValue::Floats(v) => {
				assert!((v[0] - 1.0 / 16.0).abs() < 1e-6);
			}
			_ => unreachable!(),
		}
		node.set_param("bump coeff", &ParamValue::Floats(&[5.0])).unwrap();
		match node.get_param("bump coeff").unwrap() {
			OwnedParamValue::Floats(v) => assert_eq!(v[0], 2.0),
			_ => unreachable!(),
		}
	}

	#[test]
	fn scalar_plug_conversion_enforced() {
		let mut node = ShaderNode::new(
			ShaderNodeKind::Float2 { node0: None, node1: None, imm0: 0.0, imm1: 0.0 },
			0,
			SizeClass::Small,
		);
		let spectrum_plug = Plug {
			node: ShaderNodeHandle::default(),
			plug_type: ShaderNodePlugType::Spectrum,
			option: 0,
		};
		assert!(node.set_param("0", &ParamValue::Plug(spectrum_plug)).is_err());
		let float_plug = Plug {
			node: ShaderNodeHandle::default(),
			plug_type: ShaderNodePlugType::Float4,
			option: 1,
		};
		assert!(node.set_param("0", &ParamValue::Plug(float_plug)).is_ok());
	}
}
