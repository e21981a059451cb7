use std::ops::Mul;

use super::matrix::Matrix3;
use super::vector::Vector3;

/// A rotation quaternion.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Quaternion {
	pub x: f32,
	pub y: f32,
	pub z: f32,
	pub w: f32,
}

impl Quaternion {
	pub const IDENTITY: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

	pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
		Self { x, y, z, w }
	}

	pub fn from_axis_angle(axis: Vector3, angle: f32) -> Self {
		let (s, c) = (angle * 0.5).sin_cos();
		let a = axis.normalized() * s;
		Self { x: a.x, y: a.y, z: a.z, w: c }
	}

	pub fn conjugate(self) -> Self {
		Self { x: -self.x, y: -self.y, z: -self.z, w: self.w }
	}

	pub fn normalized(self) -> Self {
		let len = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
		Self {
			x: self.x / len,
			y: self.y / len,
			z: self.z / len,
			w: self.w / len,
		}
	}

	pub fn to_matrix3(self) -> Matrix3 {
		let Self { x, y, z, w } = self;
		let (xx, yy, zz) = (x * x, y * y, z * z);
		let (xy, xz, yz) = (x * y, x * z, y * z);
		let (wx, wy, wz) = (w * x, w * y, w * z);
		Matrix3::from_columns(
			Vector3::new(1.0 - 2.0 * (yy + zz), 2.0 * (xy + wz), 2.0 * (xz - wy)),
			Vector3::new(2.0 * (xy - wz), 1.0 - 2.0 * (xx + zz), 2.0 * (yz + wx)),
			Vector3::new(2.0 * (xz + wy), 2.0 * (yz - wx), 1.0 - 2.0 * (xx + yy)),
		)
	}
}

impl Mul for Quaternion {
	type Output = Self;

	fn mul(self, rhs: Self) -> Self {
		Self {
			x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
			y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
			z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
			w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
		}
	}
}

impl Mul<Vector3> for Quaternion {
	type Output = Vector3;

	fn mul(self, v: Vector3) -> Vector3 {
		self.to_matrix3() * v
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::math::PI;

	#[test]
	fn axis_angle_rotates() {
		let q = Quaternion::from_axis_angle(Vector3::Z, PI / 2.0);
		let v = q * Vector3::X;
		assert!((v.x - 0.0).abs() < 1e-6);
		assert!((v.y - 1.0).abs() < 1e-6);
	}

	#[test]
	fn conjugate_inverts_rotation() {
		let q = Quaternion::from_axis_angle(Vector3::new(1.0, 2.0, -0.5), 1.2);
		let v = Vector3::new(0.3, -0.7, 0.9);
		let back = q.conjugate() * (q * v);
		assert!((back - v).length() < 1e-5);
	}
}
