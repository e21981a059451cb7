use bitflags::bitflags;
use slotmap::new_key_type;

use crate::math::{Point3, Quaternion};
use crate::shared::ShaderNodePlugType;

/// A node of the static class-identifier chain. Supports `is_a` queries
/// without a full reflection system; identity is pointer identity.
pub struct ClassId {
	pub name: &'static str,
	pub parent: Option<&'static ClassId>,
}

impl ClassId {
	pub fn is_a(&self, ancestor: &'static ClassId) -> bool {
		let mut current: &ClassId = self;
		loop {
			if std::ptr::eq(current, ancestor) {
				return true;
			}
			match current.parent {
				Some(parent) => current = parent,
				None => return false,
			}
		}
	}
}

macro_rules! class_id {
	($name:ident, $parent:expr) => {
		pub static $name: ClassId = ClassId {
			name: stringify!($name),
			parent: Some(&$parent),
		};
	};
}

pub static TYPE_AWARE: ClassId = ClassId { name: "TYPE_AWARE", parent: None };
class_id!(CONTEXT, TYPE_AWARE);
class_id!(OBJECT, TYPE_AWARE);
class_id!(QUERYABLE, OBJECT);

class_id!(IMAGE_2D, QUERYABLE);
class_id!(LINEAR_IMAGE_2D, IMAGE_2D);

class_id!(SHADER_NODE, QUERYABLE);
class_id!(GEOMETRY_SHADER_NODE, SHADER_NODE);
class_id!(TANGENT_SHADER_NODE, SHADER_NODE);
class_id!(FLOAT2_SHADER_NODE, SHADER_NODE);
class_id!(FLOAT3_SHADER_NODE, SHADER_NODE);
class_id!(FLOAT4_SHADER_NODE, SHADER_NODE);
class_id!(SCALE_AND_OFFSET_FLOAT_SHADER_NODE, SHADER_NODE);
class_id!(TRIPLET_SPECTRUM_SHADER_NODE, SHADER_NODE);
class_id!(REGULAR_SAMPLED_SPECTRUM_SHADER_NODE, SHADER_NODE);
class_id!(IRREGULAR_SAMPLED_SPECTRUM_SHADER_NODE, SHADER_NODE);
class_id!(FLOAT3_TO_SPECTRUM_SHADER_NODE, SHADER_NODE);
class_id!(SCALE_AND_OFFSET_UV_TEXTURE_MAP_2D_SHADER_NODE, SHADER_NODE);
class_id!(IMAGE_2D_TEXTURE_SHADER_NODE, SHADER_NODE);
class_id!(ENVIRONMENT_TEXTURE_SHADER_NODE, SHADER_NODE);

class_id!(SURFACE_MATERIAL, QUERYABLE);
class_id!(MATTE_SURFACE_MATERIAL, SURFACE_MATERIAL);
class_id!(SPECULAR_REFLECTION_SURFACE_MATERIAL, SURFACE_MATERIAL);
class_id!(MICROFACET_REFLECTION_SURFACE_MATERIAL, SURFACE_MATERIAL);
class_id!(DIFFUSE_EMITTER_SURFACE_MATERIAL, SURFACE_MATERIAL);
class_id!(ENVIRONMENT_EMITTER_SURFACE_MATERIAL, SURFACE_MATERIAL);

class_id!(TRANSFORM, OBJECT);
class_id!(STATIC_TRANSFORM, TRANSFORM);

class_id!(NODE, OBJECT);
class_id!(SURFACE_NODE, NODE);
class_id!(TRIANGLE_MESH_SURFACE_NODE, SURFACE_NODE);
class_id!(POINT_SURFACE_NODE, SURFACE_NODE);
class_id!(INFINITE_SPHERE_SURFACE_NODE, SURFACE_NODE);
class_id!(PARENT_NODE, NODE);
class_id!(INTERNAL_NODE, PARENT_NODE);
class_id!(SCENE, PARENT_NODE);

class_id!(CAMERA, QUERYABLE);
class_id!(PERSPECTIVE_CAMERA, CAMERA);
class_id!(EQUIRECTANGULAR_CAMERA, CAMERA);

/// Identity shared by every long-lived object: a process-wide id and the
/// class tag used for `is_a` queries.
#[derive(Clone, Copy)]
pub struct ObjectInfo {
	pub id: u32,
	pub class: &'static ClassId,
}

impl ObjectInfo {
	pub fn new(class: &'static ClassId) -> Self {
		Self { id: crate::next_object_id(), class }
	}
}

new_key_type! {
	pub struct ShaderNodeHandle;
	pub struct MaterialHandle;
	pub struct ImageHandle;
	pub struct CameraHandle;
}

/// A reference to one typed output of one shader node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Plug {
	pub node: ShaderNodeHandle,
	pub plug_type: ShaderNodePlugType,
	pub option: u32,
}

bitflags! {
	/// Which forms a parameter accepts.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ParameterForm: u32 {
		const IMMEDIATE_VALUE = 1 << 0;
		const NODE_PLUG = 1 << 1;
		const BOTH = Self::IMMEDIATE_VALUE.bits() | Self::NODE_PLUG.bits();
	}
}

/// A named enumeration domain for string-typed parameters.
pub struct EnumTable {
	pub name: &'static str,
	pub members: &'static [(&'static str, u32)],
}

impl EnumTable {
	pub fn value_of(&self, member: &str) -> Option<u32> {
		self.members
			.iter()
			.find(|(name, _)| *name == member)
			.map(|&(_, value)| value)
	}

	pub fn member_of(&self, value: u32) -> Option<&'static str> {
		self.members
			.iter()
			.find(|&&(_, v)| v == value)
			.map(|&(name, _)| name)
	}
}

#[derive(Clone, Copy)]
pub enum ParameterType {
	/// A float tuple; 0 means a variable-length array.
	Float(u32),
	Enum(&'static EnumTable),
	Image,
	Spectrum,
	Point,
	Quaternion,
}

/// Static description of one settable parameter of a queryable class.
pub struct ParameterInfo {
	pub name: &'static str,
	pub forms: ParameterForm,
	pub param_type: ParameterType,
}

/// A value passed to a queryable setter or returned by a getter.
#[derive(Clone)]
pub enum ParamValue<'a> {
	Floats(&'a [f32]),
	EnumMember(&'a str),
	Plug(Plug),
	/// `None` clears the image back to the class null image.
	Image(Option<ImageHandle>),
	Point(Point3),
	Quaternion(Quaternion),
}

/// An owned getter result.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedParamValue {
	Floats(Vec<f32>),
	EnumMember(&'static str),
	Plug(Option<Plug>),
	Image(Option<ImageHandle>),
	Point(Point3),
	Quaternion(Quaternion),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn class_chain_supports_is_a() {
		assert!(TRIANGLE_MESH_SURFACE_NODE.is_a(&SURFACE_NODE));
		assert!(TRIANGLE_MESH_SURFACE_NODE.is_a(&NODE));
		assert!(TRIANGLE_MESH_SURFACE_NODE.is_a(&OBJECT));
		assert!(!TRIANGLE_MESH_SURFACE_NODE.is_a(&SHADER_NODE));
		assert!(SCENE.is_a(&PARENT_NODE));
	}

	#[test]
	fn object_ids_are_unique() {
		let a = ObjectInfo::new(&SCENE);
		let b = ObjectInfo::new(&SCENE);
		assert_ne!(a.id, b.id);
	}
}
