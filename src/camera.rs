use crate::gpu::Stream;
use crate::math::{Point3, Quaternion, PI};
use crate::object::{self, ObjectInfo, OwnedParamValue, ParamValue};
use crate::renderer::ModuleKind;
use crate::material::ProcedureSetPools;
use crate::shared;
use crate::{Error, Result};

/// Lens-side callables and the IDF procedure set of one camera class.
#[derive(Clone, Copy)]
pub struct CameraClassPrograms {
	pub prog_sample_lens_position: u32,
	pub prog_test_lens_intersection: u32,
	pub prog_setup_idf: u32,
	pub idf_procedure_set_index: u32,
}

pub struct CameraClassTable {
	pub perspective: CameraClassPrograms,
	pub equirectangular: CameraClassPrograms,
}

fn register_camera_class(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut ProcedureSetPools,
	stream: &Stream,
	class_prefix: &str,
) -> Result<CameraClassPrograms> {
	let name = |method: &str| format!("{}_{}", class_prefix, method);
	let prog_sample_lens_position = register(ModuleKind::Camera, &name("sampleLensPosition"));
	let prog_test_lens_intersection = register(ModuleKind::Camera, &name("testLensIntersection"));
	let prog_setup_idf = register(ModuleKind::Camera, &name("setupIDF"));
	let procedures = shared::IdfProcedureSet {
		prog_sample_internal: register(ModuleKind::Camera, &name("IDF_sampleInternal")),
		prog_evaluate_spatial_importance_internal: register(
			ModuleKind::Camera,
			&name("IDF_evaluateSpatialImportanceInternal"),
		),
		prog_evaluate_directional_importance_internal: register(
			ModuleKind::Camera,
			&name("IDF_evaluateDirectionalImportanceInternal"),
		),
		prog_evaluate_pdf_internal: register(ModuleKind::Camera, &name("IDF_evaluatePDFInternal")),
		prog_back_project_direction: register(ModuleKind::Camera, &name("IDF_backProjectDirection")),
	};
	let idf_procedure_set_index = pools.idf.allocate()?;
	pools.idf.update(idf_procedure_set_index, &procedures, stream);
	Ok(CameraClassPrograms {
		prog_sample_lens_position,
		prog_test_lens_intersection,
		prog_setup_idf,
		idf_procedure_set_index,
	})
}

pub fn initialize(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
	pools: &mut ProcedureSetPools,
	stream: &Stream,
) -> Result<CameraClassTable> {
	Ok(CameraClassTable {
		perspective: register_camera_class(register, pools, stream, "PerspectiveCamera")?,
		equirectangular: register_camera_class(register, pools, stream, "EquirectangularCamera")?,
	})
}

#[derive(Clone)]
pub enum CameraKind {
	Perspective {
		position: Point3,
		orientation: Quaternion,
		aspect: f32,
		fovy: f32,
		lens_radius: f32,
		op_distance: f32,
		sensitivity: f32,
	},
	Equirectangular {
		position: Point3,
		orientation: Quaternion,
		phi_angle: f32,
		theta_angle: f32,
		sensitivity: f32,
	},
}

pub struct Camera {
	pub info: ObjectInfo,
	pub kind: CameraKind,
}

impl Camera {
	pub fn new_perspective() -> Self {
		Self {
			info: ObjectInfo::new(&object::PERSPECTIVE_CAMERA),
			kind: CameraKind::Perspective {
				position: Point3::ZERO,
				orientation: Quaternion::IDENTITY,
				aspect: 1.0,
				fovy: 45.0 * PI / 180.0,
				lens_radius: 0.0,
				op_distance: 1.0,
				sensitivity: 1.0,
			},
		}
	}

	pub fn new_equirectangular() -> Self {
		Self {
			info: ObjectInfo::new(&object::EQUIRECTANGULAR_CAMERA),
			kind: CameraKind::Equirectangular {
				position: Point3::ZERO,
				orientation: Quaternion::IDENTITY,
				phi_angle: 2.0 * PI,
				theta_angle: PI,
				sensitivity: 1.0,
			},
		}
	}

	pub fn orientation(&self) -> Quaternion {
		match &self.kind {
			CameraKind::Perspective { orientation, .. } => *orientation,
			CameraKind::Equirectangular { orientation, .. } => *orientation,
		}
	}

	pub fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
		match &mut self.kind {
			CameraKind::Perspective {
				position,
				orientation,
				aspect,
				fovy,
				lens_radius,
				op_distance,
				sensitivity,
			} => match (name, value) {
				("position", ParamValue::Point(p)) => {
					*position = *p;
					Ok(())
				}
				("orientation", ParamValue::Quaternion(q)) => {
					*orientation = q.normalized();
					Ok(())
				}
				("aspect", v) => {
					*aspect = scalar(name, v)?.max(1e-6);
					Ok(())
				}
				("fovy", v) => {
					*fovy = scalar(name, v)?.clamp(1e-3, PI - 1e-3);
					Ok(())
				}
				("lens radius", v) => {
					*lens_radius = scalar(name, v)?.max(0.0);
					Ok(())
				}
				("op distance", v) => {
					*op_distance = scalar(name, v)?.max(1e-6);
					Ok(())
				}
				("sensitivity", v) => {
					*sensitivity = scalar(name, v)?.max(0.0);
					Ok(())
				}
				_ => Err(unknown_param(name)),
			},
			CameraKind::Equirectangular { position, orientation, phi_angle, theta_angle, sensitivity } => {
				match (name, value) {
					("position", ParamValue::Point(p)) => {
						*position = *p;
						Ok(())
					}
					("orientation", ParamValue::Quaternion(q)) => {
						*orientation = q.normalized();
						Ok(())
					}
					("h angle", v) => {
						*phi_angle = scalar(name, v)?.clamp(1e-3, 2.0 * PI);
						Ok(())
					}
					("v angle", v) => {
						*theta_angle = scalar(name, v)?.clamp(1e-3, PI);
						Ok(())
					}
					("sensitivity", v) => {
						*sensitivity = scalar(name, v)?.max(0.0);
						Ok(())
					}
					_ => Err(unknown_param(name)),
				}
			}
		}
	}

	pub fn get_param(&self, name: &str) -> Result<OwnedParamValue> {
		match &self.kind {
			CameraKind::Perspective {
				position,
				orientation,
				aspect,
				fovy,
				lens_radius,
				op_distance,
				sensitivity,
			} => match name {
				"position" => Ok(OwnedParamValue::Point(*position)),
				"orientation" => Ok(OwnedParamValue::Quaternion(*orientation)),
				"aspect" => Ok(OwnedParamValue::Floats(vec![*aspect])),
				"fovy" => Ok(OwnedParamValue::Floats(vec![*fovy])),
				"lens radius" => Ok(OwnedParamValue::Floats(vec![*lens_radius])),
				"op distance" => Ok(OwnedParamValue::Floats(vec![*op_distance])),
				"sensitivity" => Ok(OwnedParamValue::Floats(vec![*sensitivity])),
				_ => Err(unknown_param(name)),
			},
			CameraKind::Equirectangular { position, orientation, phi_angle, theta_angle, sensitivity } => {
				match name {
					"position" => Ok(OwnedParamValue::Point(*position)),
					"orientation" => Ok(OwnedParamValue::Quaternion(*orientation)),
					"h angle" => Ok(OwnedParamValue::Floats(vec![*phi_angle])),
					"v angle" => Ok(OwnedParamValue::Floats(vec![*theta_angle])),
					"sensitivity" => Ok(OwnedParamValue::Floats(vec![*sensitivity])),
					_ => Err(unknown_param(name)),
				}
			}
		}
	}

	/// Writes the camera descriptor into the launch parameters.
	pub fn setup(&self, classes: &CameraClassTable, launch_params: &mut shared::PipelineLaunchParameters) {
		match &self.kind {
			CameraKind::Perspective {
				position,
				orientation,
				aspect,
				fovy,
				lens_radius,
				op_distance,
				sensitivity,
			} => {
				launch_params.camera_descriptor.idf_procedure_set_index =
					classes.perspective.idf_procedure_set_index;
				launch_params.camera_descriptor.pack_data(&shared::PerspectiveCameraRecord {
					position: [position.x, position.y, position.z],
					orientation: [orientation.x, orientation.y, orientation.z, orientation.w],
					aspect: *aspect,
					fovy: *fovy,
					lens_radius: *lens_radius,
					op_distance: *op_distance,
					sensitivity: *sensitivity,
				});
			}
			CameraKind::Equirectangular { position, orientation, phi_angle, theta_angle, sensitivity } => {
				launch_params.camera_descriptor.idf_procedure_set_index =
					classes.equirectangular.idf_procedure_set_index;
				launch_params.camera_descriptor.pack_data(&shared::EquirectangularCameraRecord {
					position: [position.x, position.y, position.z],
					orientation: [orientation.x, orientation.y, orientation.z, orientation.w],
					phi_angle: *phi_angle,
					theta_angle: *theta_angle,
					sensitivity: *sensitivity,
				});
			}
		}
	}
}

fn unknown_param(name: &str) -> Error {
	Error::InvalidArgument(format!("unknown camera parameter \"{}\"", name))
}

fn scalar(name: &str, value: &ParamValue) -> Result<f32> {
	match value {
		ParamValue::Floats(values) if values.len() == 1 => Ok(values[0]),
		_ => Err(Error::InvalidArgument(format!("camera parameter \"{}\" expects 1 value", name))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn perspective_parameters_round_trip() {
		let mut camera = Camera::new_perspective();
		camera
			.set_param("position", &ParamValue::Point(Point3::new(1.0, 2.0, 3.0)))
			.unwrap();
		camera.set_param("fovy", &ParamValue::Floats(&[1.0])).unwrap();
		assert_eq!(
			camera.get_param("position").unwrap(),
			OwnedParamValue::Point(Point3::new(1.0, 2.0, 3.0))
		);
		assert_eq!(camera.get_param("fovy").unwrap(), OwnedParamValue::Floats(vec![1.0]));
		assert!(camera.set_param("h angle", &ParamValue::Floats(&[1.0])).is_err());
	}
}
