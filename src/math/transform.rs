use std::ops::Mul;

use super::bounds::BoundingBox3;
use super::matrix::Matrix4;

/// A time-invariant transform carrying its matrix and the precomputed inverse.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct StaticTransform {
	matrix: Matrix4,
	inv_matrix: Matrix4,
}

impl StaticTransform {
	pub const IDENTITY: Self = Self {
		matrix: Matrix4::IDENTITY,
		inv_matrix: Matrix4::IDENTITY,
	};

	pub fn new(matrix: Matrix4) -> Self {
		Self { matrix, inv_matrix: matrix.inverted() }
	}

	pub fn matrix(&self) -> &Matrix4 {
		&self.matrix
	}

	pub fn inverse_matrix(&self) -> &Matrix4 {
		&self.inv_matrix
	}

	pub fn arrays(&self) -> ([f32; 16], [f32; 16]) {
		(self.matrix.to_array(), self.inv_matrix.to_array())
	}

	pub fn transform_bounds(&self, bb: &BoundingBox3) -> BoundingBox3 {
		if !bb.is_valid() {
			return *bb;
		}
		BoundingBox3::from_points(bb.corners().iter().map(|&p| self.matrix.transform_point(p)))
	}
}

impl Mul for StaticTransform {
	type Output = Self;

	fn mul(self, rhs: Self) -> Self {
		Self::new(self.matrix * rhs.matrix)
	}
}

impl Mul<Matrix4> for StaticTransform {
	type Output = Self;

	fn mul(self, rhs: Matrix4) -> Self {
		Self::new(self.matrix * rhs)
	}
}
