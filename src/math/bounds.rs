use super::vector::Point3;

/// Axis-aligned bounding box.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct BoundingBox3 {
	pub minimum: Point3,
	pub maximum: Point3,
}

impl BoundingBox3 {
	/// The inverted empty box: unioning anything into it yields that thing.
	pub const EMPTY: Self = Self {
		minimum: Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
		maximum: Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
	};

	pub fn from_points(points: impl IntoIterator<Item = Point3>) -> Self {
		let mut bb = Self::EMPTY;
		for p in points {
			bb.unify_point(p);
		}
		bb
	}

	pub fn unify_point(&mut self, p: Point3) {
		self.minimum = self.minimum.min(p);
		self.maximum = self.maximum.max(p);
	}

	pub fn unify(&mut self, other: &Self) {
		self.minimum = self.minimum.min(other.minimum);
		self.maximum = self.maximum.max(other.maximum);
	}

	pub fn is_valid(&self) -> bool {
		self.maximum.x >= self.minimum.x
			&& self.maximum.y >= self.minimum.y
			&& self.maximum.z >= self.minimum.z
	}

	pub fn centroid(&self) -> Point3 {
		Point3::new(
			0.5 * (self.minimum.x + self.maximum.x),
			0.5 * (self.minimum.y + self.maximum.y),
			0.5 * (self.minimum.z + self.maximum.z),
		)
	}

	pub fn corners(&self) -> [Point3; 8] {
		let (lo, hi) = (self.minimum, self.maximum);
		[
			Point3::new(lo.x, lo.y, lo.z),
			Point3::new(hi.x, lo.y, lo.z),
			Point3::new(lo.x, hi.y, lo.z),
			Point3::new(hi.x, hi.y, lo.z),
			Point3::new(lo.x, lo.y, hi.z),
			Point3::new(hi.x, lo.y, hi.z),
			Point3::new(lo.x, hi.y, hi.z),
			Point3::new(hi.x, hi.y, hi.z),
		]
	}
}
