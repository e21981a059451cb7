use slotmap::SlotMap;

use crate::color::{create_triplet_spectrum, ColorSpace, SpectrumType};
use crate::gpu::slot::SlotBuffer;
use crate::gpu::{Device, Stream};
use crate::object::{self, ObjectInfo, OwnedParamValue, ParamValue, Plug, ShaderNodeHandle};
use crate::renderer::ModuleKind;
use crate::shader_nodes::{plug_record, ShaderNode, ShaderNodeClassTable};
use crate::shared::{self, ShaderNodePlugType};
use crate::{Error, Result};

/// Descriptor-side hooks of one material class: the BSDF/EDF setup callables
/// and the procedure sets their methods dispatch through.
#[derive(Clone, Copy)]
pub struct MaterialClassPrograms {
	pub prog_setup_bsdf: u32,
	pub bsdf_procedure_set_index: u32,
	pub prog_setup_edf: u32,
	pub edf_procedure_set_index: u32,
}

pub struct MaterialClassTable {
	pub null_bsdf_procedure_set_index: u32,
	pub null_edf_procedure_set_index: u32,
	pub prog_null_bsdf_setup: u32,
	pub prog_null_edf_setup: u32,
	pub matte: MaterialClassPrograms,
	pub specular_reflection: MaterialClassPrograms,
	pub microfacet_reflection: MaterialClassPrograms,
	pub diffuse_emitter: MaterialClassPrograms,
	pub environment_emitter: MaterialClassPrograms,
}

/// Procedure-set pools for BSDF, EDF and IDF methods.
pub struct ProcedureSetPools {
	pub bsdf: SlotBuffer<shared::BsdfProcedureSet>,
	pub edf: SlotBuffer<shared::EdfProcedureSet>,
	pub idf: SlotBuffer<shared::IdfProcedureSet>,
}

impl ProcedureSetPools {
	pub fn new(device: &Device) -> Result<Self> {
		Ok(Self {
			bsdf: SlotBuffer::new(device, 64)?,
			edf: SlotBuffer::new(device, 64)?,
			idf: SlotBuffer::new(device, 8)?,
		})
	}
}

fn register_bsdf_procedure_set(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut ProcedureSetPools,
	stream: &Stream,
	class_prefix: &str,
) -> Result<u32> {
	let name = |method: &str| format!("{}_{}", class_prefix, method);
	let procedures = shared::BsdfProcedureSet {
		prog_get_base_color: register(ModuleKind::Material, &name("getBaseColor")),
		prog_matches: register(ModuleKind::Material, &name("matches")),
		prog_sample_internal: register(ModuleKind::Material, &name("sampleInternal")),
		prog_sample_with_rev_internal: register(ModuleKind::Material, &name("sampleWithRevInternal")),
		prog_evaluate_internal: register(ModuleKind::Material, &name("evaluateInternal")),
		prog_evaluate_with_rev_internal: register(ModuleKind::Material, &name("evaluateWithRevInternal")),
		prog_evaluate_pdf_internal: register(ModuleKind::Material, &name("evaluatePDFInternal")),
		prog_evaluate_pdf_with_rev_internal: register(ModuleKind::Material, &name("evaluatePDFWithRevInternal")),
		prog_weight_internal: register(ModuleKind::Material, &name("weightInternal")),
	};
	let index = pools.bsdf.allocate()?;
	pools.bsdf.update(index, &procedures, stream);
	Ok(index)
}

fn register_edf_procedure_set(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut ProcedureSetPools,
	stream: &Stream,
	class_prefix: &str,
) -> Result<u32> {
	let name = |method: &str| format!("{}_{}", class_prefix, method);
	let procedures = shared::EdfProcedureSet {
		prog_matches: register(ModuleKind::Material, &name("matches")),
		prog_sample_internal: register(ModuleKind::Material, &name("sampleInternal")),
		prog_evaluate_emittance_internal: register(ModuleKind::Material, &name("evaluateEmittanceInternal")),
		prog_evaluate_internal: register(ModuleKind::Material, &name("evaluateInternal")),
		prog_evaluate_pdf_internal: register(ModuleKind::Material, &name("evaluatePDFInternal")),
		prog_weight_internal: register(ModuleKind::Material, &name("weightInternal")),
		as_bsdf: shared::BsdfProcedureSet {
			prog_get_base_color: register(ModuleKind::Material, &name("as_BSDF_getBaseColor")),
			prog_matches: register(ModuleKind::Material, &name("as_BSDF_matches")),
			prog_sample_internal: register(ModuleKind::Material, &name("as_BSDF_sampleInternal")),
			prog_sample_with_rev_internal: register(ModuleKind::Material, &name("as_BSDF_sampleWithRevInternal")),
			prog_evaluate_internal: register(ModuleKind::Material, &name("as_BSDF_evaluateInternal")),
			prog_evaluate_with_rev_internal: register(ModuleKind::Material, &name("as_BSDF_evaluateWithRevInternal")),
			prog_evaluate_pdf_internal: register(ModuleKind::Material, &name("as_BSDF_evaluatePDFInternal")),
			prog_evaluate_pdf_with_rev_internal: register(ModuleKind::Material, &name("as_BSDF_evaluatePDFWithRevInternal")),
			prog_weight_internal: register(ModuleKind::Material, &name("as_BSDF_weightInternal")),
		},
	};
	let index = pools.edf.allocate()?;
	pools.edf.update(index, &procedures, stream);
	Ok(index)
}

/// Registers the null procedure sets and every material class. The null
/// BSDF and EDF sets are allocated first; the kernels rely on them living
/// at index 0 of their pools.
pub fn initialize(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut ProcedureSetPools,
	stream: &Stream,
) -> Result<MaterialClassTable> {
	let prog_null_bsdf_setup = register(ModuleKind::Material, "NullBSDF_setupBSDF");
	let null_bsdf_procedure_set_index = register_bsdf_procedure_set(register, pools, stream, "NullBSDF")?;
	assert_eq!(
		null_bsdf_procedure_set_index, 0,
		"the null BSDF procedure set must live at index 0"
	);

	let prog_null_edf_setup = register(ModuleKind::Material, "NullEDF_setupEDF");
	let null_edf_procedure_set_index = register_edf_procedure_set(register, pools, stream, "NullEDF")?;
	assert_eq!(
		null_edf_procedure_set_index, 0,
		"the null EDF procedure set must live at index 0"
	);

	let matte = MaterialClassPrograms {
		prog_setup_bsdf: register(ModuleKind::Material, "MatteSurfaceMaterial_setupBSDF"),
		bsdf_procedure_set_index: register_bsdf_procedure_set(register, pools, stream, "MatteBRDF")?,
		prog_setup_edf: prog_null_edf_setup,
		edf_procedure_set_index: null_edf_procedure_set_index,
	};
	let specular_reflection = MaterialClassPrograms {
		prog_setup_bsdf: register(ModuleKind::Material, "SpecularReflectionSurfaceMaterial_setupBSDF"),
		bsdf_procedure_set_index: register_bsdf_procedure_set(register, pools, stream, "SpecularBRDF")?,
		prog_setup_edf: prog_null_edf_setup,
		edf_procedure_set_index: null_edf_procedure_set_index,
	};
	let microfacet_reflection = MaterialClassPrograms {
		prog_setup_bsdf: register(ModuleKind::Material, "MicrofacetReflectionSurfaceMaterial_setupBSDF"),
		bsdf_procedure_set_index: register_bsdf_procedure_set(register, pools, stream, "MicrofacetBRDF")?,
		prog_setup_edf: prog_null_edf_setup,
		edf_procedure_set_index: null_edf_procedure_set_index,
	};
	let diffuse_emitter = MaterialClassPrograms {
		prog_setup_bsdf: prog_null_bsdf_setup,
		bsdf_procedure_set_index: null_bsdf_procedure_set_index,
		prog_setup_edf: register(ModuleKind::Material, "DiffuseEmitterSurfaceMaterial_setupEDF"),
		edf_procedure_set_index: register_edf_procedure_set(register, pools, stream, "DiffuseEDF")?,
	};
	let environment_emitter = MaterialClassPrograms {
		prog_setup_bsdf: prog_null_bsdf_setup,
		bsdf_procedure_set_index: null_bsdf_procedure_set_index,
		prog_setup_edf: register(ModuleKind::Material, "EnvironmentEmitterSurfaceMaterial_setupEDF"),
		edf_procedure_set_index: register_edf_procedure_set(register, pools, stream, "EnvironmentEDF")?,
	};

	Ok(MaterialClassTable {
		null_bsdf_procedure_set_index,
		null_edf_procedure_set_index,
		prog_null_bsdf_setup,
		prog_null_edf_setup,
		matte,
		specular_reflection,
		microfacet_reflection,
		diffuse_emitter,
		environment_emitter,
	})
}

#[derive(Clone)]
pub enum SurfaceMaterialKind {
	Matte {
		node_albedo: Option<Plug>,
		imm_albedo: [f32; 3],
	},
	SpecularReflection {
		node_coeff: Option<Plug>,
		node_eta: Option<Plug>,
		node_k: Option<Plug>,
		imm_coeff: [f32; 3],
		imm_eta: [f32; 3],
		imm_k: [f32; 3],
	},
	MicrofacetReflection {
		node_eta: Option<Plug>,
		node_k: Option<Plug>,
		node_roughness: Option<Plug>,
		imm_eta: [f32; 3],
		imm_k: [f32; 3],
		imm_roughness: f32,
		imm_anisotropy: f32,
		imm_rotation: f32,
	},
	DiffuseEmitter {
		node_emittance: Option<Plug>,
		imm_emittance: [f32; 3],
		imm_scale: f32,
	},
	EnvironmentEmitter {
		node_emittance: Option<Plug>,
		imm_emittance: [f32; 3],
		imm_scale: f32,
	},
}

pub struct SurfaceMaterial {
	pub info: ObjectInfo,
	pub desc_index: u32,
	pub kind: SurfaceMaterialKind,
}

impl SurfaceMaterial {
	pub fn new(kind: SurfaceMaterialKind, desc_index: u32) -> Self {
		let class = match kind {
			SurfaceMaterialKind::Matte { .. } => &object::MATTE_SURFACE_MATERIAL,
			SurfaceMaterialKind::SpecularReflection { .. } => &object::SPECULAR_REFLECTION_SURFACE_MATERIAL,
			SurfaceMaterialKind::MicrofacetReflection { .. } => &object::MICROFACET_REFLECTION_SURFACE_MATERIAL,
			SurfaceMaterialKind::DiffuseEmitter { .. } => &object::DIFFUSE_EMITTER_SURFACE_MATERIAL,
			SurfaceMaterialKind::EnvironmentEmitter { .. } => &object::ENVIRONMENT_EMITTER_SURFACE_MATERIAL,
		};
		Self { info: ObjectInfo::new(class), desc_index, kind }
	}

	pub fn is_emitter(&self) -> bool {
		matches!(
			self.kind,
			SurfaceMaterialKind::DiffuseEmitter { .. } | SurfaceMaterialKind::EnvironmentEmitter { .. }
		)
	}

	/// Emitted-power proxy for light-selection distributions.
	pub fn importance(&self) -> f32 {
		if self.is_emitter() {
			1.0
		} else {
			0.0
		}
	}

	pub fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
		match &mut self.kind {
			SurfaceMaterialKind::Matte { node_albedo, imm_albedo } => match (name, value) {
				("albedo", ParamValue::Plug(plug)) => {
					*node_albedo = Some(expect_spectrum_plug(name, *plug)?);
					Ok(())
				}
				("albedo", v) => {
					imm_albedo.copy_from_slice(expect_triplet(name, v)?);
					Ok(())
				}
				_ => Err(unknown_param(name)),
			},
			SurfaceMaterialKind::SpecularReflection { node_coeff, node_eta, node_k, imm_coeff, imm_eta, imm_k } => {
				match (name, value) {
					("coeff", ParamValue::Plug(plug)) => {
						*node_coeff = Some(expect_spectrum_plug(name, *plug)?);
						Ok(())
					}
					("eta", ParamValue::Plug(plug)) => {
						*node_eta = Some(expect_spectrum_plug(name, *plug)?);
						Ok(())
					}
					("k", ParamValue::Plug(plug)) => {
						*node_k = Some(expect_spectrum_plug(name, *plug)?);
						Ok(())
					}
					("coeff", v) => {
						imm_coeff.copy_from_slice(expect_triplet(name, v)?);
						Ok(())
					}
					("eta", v) => {
						imm_eta.copy_from_slice(expect_triplet(name, v)?);
						Ok(())
					}
					("k", v) => {
						imm_k.copy_from_slice(expect_triplet(name, v)?);
						Ok(())
					}
					_ => Err(unknown_param(name)),
				}
			}
			SurfaceMaterialKind::MicrofacetReflection {
				node_eta,
				node_k,
				node_roughness,
				imm_eta,
				imm_k,
				imm_roughness,
				imm_anisotropy,
				imm_rotation,
			} => match (name, value) {
				("eta", ParamValue::Plug(plug)) => {
					*node_eta = Some(expect_spectrum_plug(name, *plug)?);
					Ok(())
				}
				("k", ParamValue::Plug(plug)) => {
					*node_k = Some(expect_spectrum_plug(name, *plug)?);
					Ok(())
				}
				("roughness/anisotropy/rotation", ParamValue::Plug(plug)) => {
					if !plug.plug_type.convertible_to(ShaderNodePlugType::Float3) {
						return Err(bad_plug(name));
					}
					*node_roughness = Some(*plug);
					Ok(())
				}
				("eta", v) => {
					imm_eta.copy_from_slice(expect_triplet(name, v)?);
					Ok(())
				}
				("k", v) => {
					imm_k.copy_from_slice(expect_triplet(name, v)?);
					Ok(())
				}
				("roughness/anisotropy/rotation", v) => {
					let values = expect_triplet(name, v)?;
					*imm_roughness = values[0];
					*imm_anisotropy = values[1];
					*imm_rotation = values[2];
					Ok(())
				}
				_ => Err(unknown_param(name)),
			},
			SurfaceMaterialKind::DiffuseEmitter { node_emittance, imm_emittance, imm_scale }
			| SurfaceMaterialKind::EnvironmentEmitter { node_emittance, imm_emittance, imm_scale } => {
				match (name, value) {
					("emittance", ParamValue::Plug(plug)) => {
						*node_emittance = Some(expect_spectrum_plug(name, *plug)?);
						Ok(())
					}
					("emittance", v) => {
						imm_emittance.copy_from_slice(expect_triplet(name, v)?);
						Ok(())
					}
					("scale", v) => {
						*imm_scale = expect_scalar(name, v)?;
						Ok(())
					}
					_ => Err(unknown_param(name)),
				}
			}
		}
	}

	pub fn get_param(&self, name: &str) -> Result<OwnedParamValue> {
		match &self.kind {
			SurfaceMaterialKind::Matte { node_albedo, imm_albedo } => match name {
				"albedo" => Ok(match node_albedo {
					Some(plug) => OwnedParamValue::Plug(Some(*plug)),
					None => OwnedParamValue::Floats(imm_albedo.to_vec()),
				}),
				_ => Err(unknown_param(name)),
			},
			SurfaceMaterialKind::SpecularReflection { imm_coeff, imm_eta, imm_k, .. } => match name {
				"coeff" => Ok(OwnedParamValue::Floats(imm_coeff.to_vec())),
				"eta" => Ok(OwnedParamValue::Floats(imm_eta.to_vec())),
				"k" => Ok(OwnedParamValue::Floats(imm_k.to_vec())),
				_ => Err(unknown_param(name)),
			},
			SurfaceMaterialKind::MicrofacetReflection {
				imm_eta, imm_k, imm_roughness, imm_anisotropy, imm_rotation, ..
			} => match name {
				"eta" => Ok(OwnedParamValue::Floats(imm_eta.to_vec())),
				"k" => Ok(OwnedParamValue::Floats(imm_k.to_vec())),
				"roughness/anisotropy/rotation" => Ok(OwnedParamValue::Floats(vec![
					*imm_roughness,
					*imm_anisotropy,
					*imm_rotation,
				])),
				_ => Err(unknown_param(name)),
			},
			SurfaceMaterialKind::DiffuseEmitter { node_emittance, imm_emittance, imm_scale }
			| SurfaceMaterialKind::EnvironmentEmitter { node_emittance, imm_emittance, imm_scale } => {
				match name {
					"emittance" => Ok(match node_emittance {
						Some(plug) => OwnedParamValue::Plug(Some(*plug)),
						None => OwnedParamValue::Floats(imm_emittance.to_vec()),
					}),
					"scale" => Ok(OwnedParamValue::Floats(vec![*imm_scale])),
					_ => Err(unknown_param(name)),
				}
			}
		}
	}
}

fn unknown_param(name: &str) -> Error {
	Error::InvalidArgument(format!("unknown material parameter \"{}\"", name))
}

fn bad_plug(name: &str) -> Error {
	Error::InvalidArgument(format!("plug is not convertible to material parameter \"{}\"", name))
}

fn expect_spectrum_plug(name: &str, plug: Plug) -> Result<Plug> {
	if plug.plug_type.convertible_to(ShaderNodePlugType::Spectrum) {
		Ok(plug)
	} else {
		Err(bad_plug(name))
	}
}

fn expect_triplet<'a>(name: &str, value: &ParamValue<'a>) -> Result<&'a [f32]> {
	match value {
		ParamValue::Floats(values) if values.len() == 3 => Ok(values),
		ParamValue::Floats(values) => Err(Error::InvalidArgument(format!(
			"material parameter \"{}\" expects 3 values, got {}",
			name,
			values.len()
		))),
		_ => Err(Error::InvalidArgument(format!("material parameter \"{}\" expects floats", name))),
	}
}

fn expect_scalar(name: &str, value: &ParamValue) -> Result<f32> {
	match value {
		ParamValue::Floats(values) if values.len() == 1 => Ok(values[0]),
		_ => Err(Error::InvalidArgument(format!("material parameter \"{}\" expects 1 value", name))),
	}
}

fn reflectance(triplet: &[f32; 3]) -> crate::color::RgbSpectrum {
	create_triplet_spectrum(
		SpectrumType::Reflectance,
		ColorSpace::Rec709D65,
		triplet[0],
		triplet[1],
		triplet[2],
	)
}

fn radiance(triplet: &[f32; 3]) -> crate::color::RgbSpectrum {
	create_triplet_spectrum(
		SpectrumType::LightSource,
		ColorSpace::Rec709D65,
		triplet[0],
		triplet[1],
		triplet[2],
	)
}

/// Serializes a material's current state into its descriptor slot.
pub fn setup_descriptor(
	material: &SurfaceMaterial,
	nodes: &SlotMap<ShaderNodeHandle, ShaderNode>,
	node_table: &ShaderNodeClassTable,
	class_table: &MaterialClassTable,
	descriptors: &SlotBuffer<shared::SurfaceMaterialDescriptor>,
	stream: &Stream,
) {
	let mut descriptor = shared::SurfaceMaterialDescriptor::default();
	match &material.kind {
		SurfaceMaterialKind::Matte { node_albedo, imm_albedo } => {
			let class = &class_table.matte;
			descriptor.prog_setup_bsdf = class.prog_setup_bsdf;
			descriptor.bsdf_procedure_set_index = class.bsdf_procedure_set_index;
			descriptor.prog_setup_edf = class.prog_setup_edf;
			descriptor.edf_procedure_set_index = class.edf_procedure_set_index;
			descriptor.pack_data(&shared::MatteMaterialData {
				node_albedo: plug_record(*node_albedo, nodes, node_table),
				imm_albedo: reflectance(imm_albedo),
			});
		}
		SurfaceMaterialKind::SpecularReflection { node_coeff, node_eta, node_k, imm_coeff, imm_eta, imm_k } => {
			let class = &class_table.specular_reflection;
			descriptor.prog_setup_bsdf = class.prog_setup_bsdf;
			descriptor.bsdf_procedure_set_index = class.bsdf_procedure_set_index;
			descriptor.prog_setup_edf = class.prog_setup_edf;
			descriptor.edf_procedure_set_index = class.edf_procedure_set_index;
			descriptor.pack_data(&shared::SpecularReflectionMaterialData {
				node_coeff: plug_record(*node_coeff, nodes, node_table),
				node_eta: plug_record(*node_eta, nodes, node_table),
				node_k: plug_record(*node_k, nodes, node_table),
				imm_coeff: reflectance(imm_coeff),
				imm_eta: reflectance(imm_eta),
				imm_k: reflectance(imm_k),
			});
		}
		SurfaceMaterialKind::MicrofacetReflection {
			node_eta,
			node_k,
			node_roughness,
			imm_eta,
			imm_k,
			imm_roughness,
			imm_anisotropy,
			imm_rotation,
		} => {
			let class = &class_table.microfacet_reflection;
			descriptor.prog_setup_bsdf = class.prog_setup_bsdf;
			descriptor.bsdf_procedure_set_index = class.bsdf_procedure_set_index;
			descriptor.prog_setup_edf = class.prog_setup_edf;
			descriptor.edf_procedure_set_index = class.edf_procedure_set_index;
			descriptor.pack_data(&shared::MicrofacetReflectionMaterialData {
				node_eta: plug_record(*node_eta, nodes, node_table),
				node_k: plug_record(*node_k, nodes, node_table),
				node_roughness_anisotropy_rotation: plug_record(*node_roughness, nodes, node_table),
				imm_eta: reflectance(imm_eta),
				imm_k: reflectance(imm_k),
				imm_roughness: *imm_roughness,
				imm_anisotropy: *imm_anisotropy,
				imm_rotation: *imm_rotation,
			});
		}
		SurfaceMaterialKind::DiffuseEmitter { node_emittance, imm_emittance, imm_scale } => {
			let class = &class_table.diffuse_emitter;
			descriptor.prog_setup_bsdf = class.prog_setup_bsdf;
			descriptor.bsdf_procedure_set_index = class.bsdf_procedure_set_index;
			descriptor.prog_setup_edf = class.prog_setup_edf;
			descriptor.edf_procedure_set_index = class.edf_procedure_set_index;
			descriptor.pack_data(&shared::DiffuseEmitterMaterialData {
				node_emittance: plug_record(*node_emittance, nodes, node_table),
				imm_emittance: radiance(imm_emittance),
				imm_scale: *imm_scale,
			});
		}
		SurfaceMaterialKind::EnvironmentEmitter { node_emittance, imm_emittance, imm_scale } => {
			let class = &class_table.environment_emitter;
			descriptor.prog_setup_bsdf = class.prog_setup_bsdf;
			descriptor.bsdf_procedure_set_index = class.bsdf_procedure_set_index;
			descriptor.prog_setup_edf = class.prog_setup_edf;
			descriptor.edf_procedure_set_index = class.edf_procedure_set_index;
			descriptor.pack_data(&shared::EnvironmentEmitterMaterialData {
				node_emittance: plug_record(*node_emittance, nodes, node_table),
				imm_emittance: radiance(imm_emittance),
				imm_scale: *imm_scale,
			});
		}
	}
	descriptors.update(material.desc_index, &descriptor, stream);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn emitters_report_importance() {
		let matte = SurfaceMaterial::new(
			SurfaceMaterialKind::Matte { node_albedo: None, imm_albedo: [0.8; 3] },
			0,
		);
		assert!(!matte.is_emitter());
		assert_eq!(matte.importance(), 0.0);

		let emitter = SurfaceMaterial::new(
			SurfaceMaterialKind::DiffuseEmitter {
				node_emittance: None,
				imm_emittance: [10.0; 3],
				imm_scale: 1.0,
			},
			1,
		);
		assert!(emitter.is_emitter());
		assert_eq!(emitter.importance(), 1.0);
	}

	#[test]
	fn spectrum_parameters_reject_scalar_plugs() {
		let mut matte = SurfaceMaterial::new(
			SurfaceMaterialKind::Matte { node_albedo: None, imm_albedo: [0.8; 3] },
			0,
		);
		let float_plug = Plug {
			node: ShaderNodeHandle::default(),
			plug_type: ShaderNodePlugType::Float1,
			option: 0,
		};
		assert!(matte.set_param("albedo", &ParamValue::Plug(float_plug)).is_err());
		let spectrum_plug = Plug {
			node: ShaderNodeHandle::default(),
			plug_type: ShaderNodePlugType::Spectrum,
			option: 0,
		};
		assert!(matte.set_param("albedo", &ParamValue::Plug(spectrum_plug)).is_ok());
	}
}
