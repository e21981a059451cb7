//! The user-facing scene DAG and its shallow flattening.
//!
//! Users build an arbitrarily deep graph of internal nodes and surface
//! nodes; rendering wants a flat transform/instance list. Every parent node
//! keeps one concatenated `ShTransform` per transform its children expose
//! (plus one for directly attached surface geometry, keyed by `None`), so
//! the root's map always holds exactly one transform per user path to a
//! surface node.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::gpu::{Device, Stream, TypedBuffer};
use crate::math::{BoundingBox3, Point3, StaticTransform, Vector3};
use crate::object::{self, MaterialHandle, ObjectInfo, Plug};
use crate::sampling::DiscreteDistribution1D;
use crate::shared;
use crate::{Error, Result};

new_key_type! {
	pub struct NodeKey;
	pub struct ShTransformKey;
	pub struct ShGeomGroupKey;
	pub struct ShGeomInstKey;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GeomInstEventKind {
	Added,
	Removed,
	Updated,
}

#[derive(Clone, Copy, Debug)]
pub struct GeomInstEvent {
	pub kind: GeomInstEventKind,
	pub group: ShGeomGroupKey,
	pub inst: ShGeomInstKey,
}

/// Deltas emitted by graph mutations, consumed by the scene driver. Transform
/// keys always refer to root-level transforms (one per user path).
#[derive(Default)]
pub struct GraphDelta {
	pub transforms_added: Vec<ShTransformKey>,
	pub transforms_removed: Vec<ShTransformKey>,
	pub transforms_updated: Vec<ShTransformKey>,
	pub geom_inst_events: Vec<GeomInstEvent>,
}

impl GraphDelta {
	pub fn is_empty(&self) -> bool {
		self.transforms_added.is_empty()
			&& self.transforms_removed.is_empty()
			&& self.transforms_updated.is_empty()
			&& self.geom_inst_events.is_empty()
	}
}

enum ShChild {
	Transform(ShTransformKey),
	GeomGroup(ShGeomGroupKey),
}

pub struct ShTransform {
	name: String,
	transform: StaticTransform,
	child: ShChild,
}

#[derive(Default)]
pub struct ShGeometryGroup {
	members: Vec<ShGeomInstKey>,
}

pub struct ShGeometryInstance {
	pub surface_node: NodeKey,
	pub group_index: u32,
	pub user_data: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SurfaceGeometry {
	TriangleMesh,
	PointSet,
	InfiniteSphere,
}

pub enum GroupIndexData {
	Triangles(TypedBuffer<shared::Triangle>),
	Points(TypedBuffer<u32>),
	None,
}

pub struct MaterialGroup {
	pub index_data: GroupIndexData,
	pub primitive_distribution: Option<DiscreteDistribution1D>,
	pub material: MaterialHandle,
	pub node_normal: Option<Plug>,
	pub node_tangent: Option<Plug>,
	pub node_alpha: Option<Plug>,
	pub aabb: BoundingBox3,
	pub sh_geom_inst: ShGeomInstKey,
}

pub struct SurfaceNodeData {
	pub geometry: SurfaceGeometry,
	pub vertices: Vec<shared::Vertex>,
	pub vertex_buffer: Option<TypedBuffer<shared::Vertex>>,
	pub groups: Vec<MaterialGroup>,
}

pub struct ParentNodeData {
	pub transform: StaticTransform,
	children: Vec<NodeKey>,
	/// `None` key: the transform covering surface nodes attached directly
	/// to this parent. `Some(c)`: the concatenation of this node's
	/// transform with the child transform `c`.
	sh_map: HashMap<Option<ShTransformKey>, ShTransformKey>,
	geom_group: ShGeomGroupKey,
}

pub enum GraphNodeKind {
	Surface(SurfaceNodeData),
	Parent(ParentNodeData),
}

pub struct GraphNode {
	pub info: ObjectInfo,
	pub name: String,
	parents: Vec<NodeKey>,
	pub kind: GraphNodeKind,
}

pub struct SceneGraph {
	nodes: SlotMap<NodeKey, GraphNode>,
	sh_transforms: SlotMap<ShTransformKey, ShTransform>,
	sh_geom_groups: SlotMap<ShGeomGroupKey, ShGeometryGroup>,
	sh_geom_insts: SlotMap<ShGeomInstKey, ShGeometryInstance>,
	root: NodeKey,
}

impl SceneGraph {
	pub fn new() -> Self {
		let mut nodes = SlotMap::with_key();
		let mut sh_geom_groups = SlotMap::with_key();
		let root_group = sh_geom_groups.insert(ShGeometryGroup::default());
		let root = nodes.insert(GraphNode {
			info: ObjectInfo::new(&object::SCENE),
			name: "root".to_string(),
			parents: Vec::new(),
			kind: GraphNodeKind::Parent(ParentNodeData {
				transform: StaticTransform::IDENTITY,
				children: Vec::new(),
				sh_map: HashMap::new(),
				geom_group: root_group,
			}),
		});
		Self {
			nodes,
			sh_transforms: SlotMap::with_key(),
			sh_geom_groups,
			sh_geom_insts: SlotMap::with_key(),
			root,
		}
	}

	pub fn root(&self) -> NodeKey {
		self.root
	}

	pub fn create_internal_node(&mut self, name: &str, transform: StaticTransform) -> NodeKey {
		let geom_group = self.sh_geom_groups.insert(ShGeometryGroup::default());
		self.nodes.insert(GraphNode {
			info: ObjectInfo::new(&object::INTERNAL_NODE),
			name: name.to_string(),
			parents: Vec::new(),
			kind: GraphNodeKind::Parent(ParentNodeData {
				transform,
				children: Vec::new(),
				sh_map: HashMap::new(),
				geom_group,
			}),
		})
	}

	pub fn create_surface_node(&mut self, name: &str, geometry: SurfaceGeometry) -> NodeKey {
		let class = match geometry {
			SurfaceGeometry::TriangleMesh => &object::TRIANGLE_MESH_SURFACE_NODE,
			SurfaceGeometry::PointSet => &object::POINT_SURFACE_NODE,
			SurfaceGeometry::InfiniteSphere => &object::INFINITE_SPHERE_SURFACE_NODE,
		};
		self.nodes.insert(GraphNode {
			info: ObjectInfo::new(class),
			name: name.to_string(),
			parents: Vec::new(),
			kind: GraphNodeKind::Surface(SurfaceNodeData {
				geometry,
				vertices: Vec::new(),
				vertex_buffer: None,
				groups: Vec::new(),
			}),
		})
	}

	pub fn node(&self, key: NodeKey) -> Option<&GraphNode> {
		self.nodes.get(key)
	}

	pub fn parents_of(&self, key: NodeKey) -> &[NodeKey] {
		&self.nodes[key].parents
	}

	pub fn surface_data(&self, key: NodeKey) -> Option<&SurfaceNodeData> {
		match &self.nodes.get(key)?.kind {
			GraphNodeKind::Surface(data) => Some(data),
			GraphNodeKind::Parent(_) => None,
		}
	}

	pub fn geom_inst(&self, key: ShGeomInstKey) -> Option<&ShGeometryInstance> {
		self.sh_geom_insts.get(key)
	}

	pub fn group_members(&self, group: ShGeomGroupKey) -> &[ShGeomInstKey] {
		&self.sh_geom_groups[group].members
	}

	pub fn geom_group_of(&self, parent: NodeKey) -> Option<ShGeomGroupKey> {
		match &self.nodes.get(parent)?.kind {
			GraphNodeKind::Parent(data) => Some(data.geom_group),
			GraphNodeKind::Surface(_) => None,
		}
	}

	/// The root-level shallow transforms: exactly one per user path from the
	/// root to a surface node with geometry.
	pub fn root_transforms(&self) -> Vec<ShTransformKey> {
		match &self.nodes[self.root].kind {
			GraphNodeKind::Parent(data) => data.sh_map.values().copied().collect(),
			GraphNodeKind::Surface(_) => unreachable!(),
		}
	}

	pub fn transform_name(&self, key: ShTransformKey) -> &str {
		&self.sh_transforms[key].name
	}

	/// Resolves the composed transform of a shallow-transform chain.
	pub fn resolved_transform(&self, key: ShTransformKey) -> StaticTransform {
		let mut result = StaticTransform::IDENTITY;
		let mut current = key;
		loop {
			let sht = &self.sh_transforms[current];
			result = result * sht.transform;
			match sht.child {
				ShChild::Transform(next) => current = next,
				ShChild::GeomGroup(_) => return result,
			}
		}
	}

	/// The geometry group at the end of a shallow-transform chain.
	pub fn geometry_descendant(&self, key: ShTransformKey) -> ShGeomGroupKey {
		let mut current = key;
		loop {
			match self.sh_transforms[current].child {
				ShChild::Transform(next) => current = next,
				ShChild::GeomGroup(group) => return group,
			}
		}
	}

	fn parent_data(&self, key: NodeKey) -> &ParentNodeData {
		match &self.nodes[key].kind {
			GraphNodeKind::Parent(data) => data,
			GraphNodeKind::Surface(_) => panic!("node is not a parent node"),
		}
	}

	fn parent_data_mut(&mut self, key: NodeKey) -> &mut ParentNodeData {
		match &mut self.nodes[key].kind {
			GraphNodeKind::Parent(data) => data,
			GraphNodeKind::Surface(_) => panic!("node is not a parent node"),
		}
	}

	pub fn set_vertices(
		&mut self,
		node: NodeKey,
		vertices: Vec<shared::Vertex>,
		device: &Device,
		stream: &Stream,
		delta: &mut GraphDelta,
	) -> Result<()> {
		let GraphNodeKind::Surface(data) = &mut self.nodes[node].kind else {
			return Err(Error::InvalidArgument("vertices belong to surface nodes".to_string()));
		};
		let buffer = TypedBuffer::new(device, vertices.len().max(1))?;
		buffer.write_slice(stream, 0, &vertices);
		data.vertices = vertices;
		data.vertex_buffer = Some(buffer);

		let updated: Vec<ShGeomInstKey> = data.groups.iter().map(|g| g.sh_geom_inst).collect();
		let parents = self.nodes[node].parents.clone();
		for inst in updated {
			for &parent in &parents {
				let group = self.parent_data(parent).geom_group;
				self.propagate_geometry_event(parent, GeomInstEventKind::Updated, group, inst, delta);
			}
		}
		Ok(())
	}

	pub fn add_material_group(
		&mut self,
		node: NodeKey,
		indices: Vec<u32>,
		material: MaterialHandle,
		node_normal: Option<Plug>,
		node_tangent: Option<Plug>,
		node_alpha: Option<Plug>,
		device: &Device,
		stream: &Stream,
		delta: &mut GraphDelta,
	) -> Result<()> {
		let GraphNodeKind::Surface(data) = &self.nodes[node].kind else {
			return Err(Error::InvalidArgument("material groups belong to surface nodes".to_string()));
		};
		if data.vertices.is_empty() {
			return Err(Error::InvalidArgument("set vertices before adding material groups".to_string()));
		}
		let geometry = data.geometry;
		let group_index = data.groups.len() as u32;

		let (index_data, weights, aabb) = match geometry {
			SurfaceGeometry::TriangleMesh => {
				if indices.len() % 3 != 0 {
					return Err(Error::InvalidArgument("triangle index count must be a multiple of 3".to_string()));
				}
				let mut triangles = Vec::with_capacity(indices.len() / 3);
				let mut weights = Vec::with_capacity(indices.len() / 3);
				let mut aabb = BoundingBox3::EMPTY;
				for tri in indices.chunks_exact(3) {
					for &i in tri {
						if i as usize >= data.vertices.len() {
							return Err(Error::InvalidArgument("vertex index out of range".to_string()));
						}
						let p = data.vertices[i as usize].position;
						aabb.unify_point(Point3::new(p[0], p[1], p[2]));
					}
					let p = |i: u32| {
						let v = data.vertices[i as usize].position;
						Vector3::new(v[0], v[1], v[2])
					};
					let area = 0.5 * (p(tri[1]) - p(tri[0])).cross(p(tri[2]) - p(tri[0])).length();
					triangles.push(shared::Triangle { indices: [tri[0], tri[1], tri[2]] });
					weights.push(area);
				}
				let buffer = TypedBuffer::new(device, triangles.len().max(1))?;
				buffer.write_slice(stream, 0, &triangles);
				(GroupIndexData::Triangles(buffer), weights, aabb)
			}
			SurfaceGeometry::PointSet => {
				let mut aabb = BoundingBox3::EMPTY;
				for &i in &indices {
					if i as usize >= data.vertices.len() {
						return Err(Error::InvalidArgument("vertex index out of range".to_string()));
					}
					let p = data.vertices[i as usize].position;
					aabb.unify_point(Point3::new(p[0], p[1], p[2]));
				}
				let weights = vec![1.0; indices.len()];
				let buffer = TypedBuffer::new(device, indices.len().max(1))?;
				buffer.write_slice(stream, 0, &indices);
				(GroupIndexData::Points(buffer), weights, aabb)
			}
			SurfaceGeometry::InfiniteSphere => (GroupIndexData::None, vec![1.0], BoundingBox3::EMPTY),
		};
		let primitive_distribution = if weights.is_empty() {
			None
		} else {
			Some(DiscreteDistribution1D::new(device, stream, &weights)?)
		};

		let inst = self.sh_geom_insts.insert(ShGeometryInstance {
			surface_node: node,
			group_index,
			user_data: group_index,
		});
		let GraphNodeKind::Surface(data) = &mut self.nodes[node].kind else {
			unreachable!();
		};
		data.groups.push(MaterialGroup {
			index_data,
			primitive_distribution,
			material,
			node_normal,
			node_tangent,
			node_alpha,
			aabb,
			sh_geom_inst: inst,
		});

		let parents = self.nodes[node].parents.clone();
		for parent in parents {
			self.geometry_add(parent, &[inst], delta);
		}
		Ok(())
	}

	/// Reports a material rebind or similar in-place change of a group.
	pub fn mark_material_group_updated(
		&mut self,
		node: NodeKey,
		group_index: u32,
		delta: &mut GraphDelta,
	) -> Result<()> {
		let Some(data) = self.surface_data(node) else {
			return Err(Error::NotFound);
		};
		let Some(group) = data.groups.get(group_index as usize) else {
			return Err(Error::NotFound);
		};
		let inst = group.sh_geom_inst;
		let parents = self.nodes[node].parents.clone();
		for parent in parents {
			let group = self.parent_data(parent).geom_group;
			self.propagate_geometry_event(parent, GeomInstEventKind::Updated, group, inst, delta);
		}
		Ok(())
	}

	pub fn add_child(&mut self, parent: NodeKey, child: NodeKey, delta: &mut GraphDelta) -> Result<()> {
		if child == self.root {
			return Err(Error::InvalidArgument("the root cannot be a child".to_string()));
		}
		if !matches!(self.nodes[parent].kind, GraphNodeKind::Parent(_)) {
			return Err(Error::InvalidArgument("surface nodes cannot have children".to_string()));
		}
		if self.parent_data(parent).children.contains(&child) {
			return Err(Error::InvalidArgument("node is already a child of this parent".to_string()));
		}

		self.parent_data_mut(parent).children.push(child);
		self.nodes[child].parents.push(parent);

		match &self.nodes[child].kind {
			GraphNodeKind::Surface(data) => {
				let insts: Vec<ShGeomInstKey> = data.groups.iter().map(|g| g.sh_geom_inst).collect();
				if !insts.is_empty() {
					self.geometry_add(parent, &insts, delta);
				}
			}
			GraphNodeKind::Parent(data) => {
				let child_delta: Vec<ShTransformKey> = data.sh_map.values().copied().collect();
				if !child_delta.is_empty() {
					self.create_concatenated(parent, &child_delta, delta);
				}
			}
		}
		Ok(())
	}

	pub fn remove_child(&mut self, parent: NodeKey, child: NodeKey, delta: &mut GraphDelta) -> Result<()> {
		let Some(position) = self
			.parent_data(parent)
			.children
			.iter()
			.position(|&c| c == child)
		else {
			return Err(Error::NotFound);
		};

		match &self.nodes[child].kind {
			GraphNodeKind::Surface(data) => {
				let insts: Vec<ShGeomInstKey> = data.groups.iter().map(|g| g.sh_geom_inst).collect();
				if !insts.is_empty() {
					self.geometry_remove(parent, &insts, delta);
				}
			}
			GraphNodeKind::Parent(data) => {
				let child_delta: Vec<ShTransformKey> = data.sh_map.values().copied().collect();
				if !child_delta.is_empty() {
					self.remove_concatenated(parent, &child_delta, delta);
				}
			}
		}

		self.parent_data_mut(parent).children.remove(position);
		let parents = &mut self.nodes[child].parents;
		if let Some(i) = parents.iter().position(|&p| p == parent) {
			parents.remove(i);
		}
		Ok(())
	}

	pub fn set_transform(
		&mut self,
		node: NodeKey,
		transform: StaticTransform,
		delta: &mut GraphDelta,
	) -> Result<()> {
		if !matches!(self.nodes[node].kind, GraphNodeKind::Parent(_)) {
			return Err(Error::InvalidArgument("surface nodes carry no transform".to_string()));
		}
		let own: Vec<ShTransformKey> = {
			let data = self.parent_data_mut(node);
			data.transform = transform;
			data.sh_map.values().copied().collect()
		};
		for &sht in &own {
			self.sh_transforms[sht].transform = transform;
		}
		if node == self.root {
			delta.transforms_updated.extend(own);
		} else if !own.is_empty() {
			let parents = self.nodes[node].parents.clone();
			for parent in parents {
				self.propagate_transform_updated(parent, &own, delta);
			}
		}
		Ok(())
	}

	fn propagate_transform_updated(
		&mut self,
		node: NodeKey,
		child_delta: &[ShTransformKey],
		delta: &mut GraphDelta,
	) {
		let own: Vec<ShTransformKey> = {
			let data = self.parent_data(node);
			child_delta
				.iter()
				.filter_map(|&c| data.sh_map.get(&Some(c)).copied())
				.collect()
		};
		if own.is_empty() {
			return;
		}
		if node == self.root {
			delta.transforms_updated.extend(own);
		} else {
			let parents = self.nodes[node].parents.clone();
			for parent in parents {
				self.propagate_transform_updated(parent, &own, delta);
			}
		}
	}

	fn create_concatenated(
		&mut self,
		node: NodeKey,
		child_delta: &[ShTransformKey],
		delta: &mut GraphDelta,
	) {
		let transform = self.parent_data(node).transform;
		let mut own = Vec::with_capacity(child_delta.len());
		for &child in child_delta {
			let name = format!("{}/{}", self.nodes[node].name, self.sh_transforms[child].name);
			let key = self.sh_transforms.insert(ShTransform {
				name,
				transform,
				child: ShChild::Transform(child),
			});
			self.parent_data_mut(node).sh_map.insert(Some(child), key);
			own.push(key);
		}
		if node == self.root {
			delta.transforms_added.extend(own);
		} else {
			let parents = self.nodes[node].parents.clone();
			for parent in parents {
				self.create_concatenated(parent, &own, delta);
			}
		}
	}

	fn remove_concatenated(
		&mut self,
		node: NodeKey,
		child_delta: &[ShTransformKey],
		delta: &mut GraphDelta,
	) {
		let mut own = Vec::with_capacity(child_delta.len());
		for &child in child_delta {
			if let Some(key) = self.parent_data_mut(node).sh_map.remove(&Some(child)) {
				own.push(key);
			}
		}
		if own.is_empty() {
			return;
		}
		if node == self.root {
			delta.transforms_removed.extend(own.iter().copied());
		} else {
			let parents = self.nodes[node].parents.clone();
			for parent in parents {
				self.remove_concatenated(parent, &own, delta);
			}
		}
		for key in own {
			self.sh_transforms.remove(key);
		}
	}

	fn geometry_add(&mut self, node: NodeKey, insts: &[ShGeomInstKey], delta: &mut GraphDelta) {
		let group = self.parent_data(node).geom_group;
		let was_empty = self.sh_geom_groups[group].members.is_empty();
		self.sh_geom_groups[group].members.extend_from_slice(insts);

		for &inst in insts {
			self.propagate_geometry_event(node, GeomInstEventKind::Added, group, inst, delta);
		}

		if was_empty && !insts.is_empty() {
			let transform = self.parent_data(node).transform;
			let name = format!("{}/*", self.nodes[node].name);
			let key = self.sh_transforms.insert(ShTransform {
				name,
				transform,
				child: ShChild::GeomGroup(group),
			});
			self.parent_data_mut(node).sh_map.insert(None, key);
			if node == self.root {
				delta.transforms_added.push(key);
			} else {
				let parents = self.nodes[node].parents.clone();
				for parent in parents {
					self.create_concatenated(parent, &[key], delta);
				}
			}
		}
	}

	fn geometry_remove(&mut self, node: NodeKey, insts: &[ShGeomInstKey], delta: &mut GraphDelta) {
		let group = self.parent_data(node).geom_group;
		self.sh_geom_groups[group]
			.members
			.retain(|m| !insts.contains(m));

		for &inst in insts {
			self.propagate_geometry_event(node, GeomInstEventKind::Removed, group, inst, delta);
		}

		if self.sh_geom_groups[group].members.is_empty() {
			if let Some(key) = self.parent_data_mut(node).sh_map.remove(&None) {
				if node == self.root {
					delta.transforms_removed.push(key);
				} else {
					let parents = self.nodes[node].parents.clone();
					for parent in parents {
						self.remove_concatenated(parent, &[key], delta);
					}
				}
				self.sh_transforms.remove(key);
			}
		}
	}

	fn propagate_geometry_event(
		&mut self,
		node: NodeKey,
		kind: GeomInstEventKind,
		group: ShGeomGroupKey,
		inst: ShGeomInstKey,
		delta: &mut GraphDelta,
	) {
		if node == self.root {
			delta.geom_inst_events.push(GeomInstEvent { kind, group, inst });
		} else {
			let parents = self.nodes[node].parents.clone();
			for parent in parents {
				self.propagate_geometry_event(parent, kind, group, inst, delta);
			}
		}
	}

	/// Destroys a detached surface node and its shallow geometry instances.
	pub fn destroy_surface_node(&mut self, node: NodeKey) -> Result<()> {
		if !self.nodes[node].parents.is_empty() {
			return Err(Error::InvalidState("detach the node from all parents first".to_string()));
		}
		let GraphNodeKind::Surface(data) = &self.nodes[node].kind else {
			return Err(Error::InvalidArgument("not a surface node".to_string()));
		};
		let insts: Vec<ShGeomInstKey> = data.groups.iter().map(|g| g.sh_geom_inst).collect();
		for inst in insts {
			self.sh_geom_insts.remove(inst);
		}
		self.nodes.remove(node);
		Ok(())
	}
}

impl Default for SceneGraph {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gpu::DeviceImpl;
	use crate::math::Matrix4;

	fn quad_vertices() -> Vec<shared::Vertex> {
		[
			[0.0, 0.0, 0.0],
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

	struct Fixture {
		device: Device,
		stream: Stream,
		graph: SceneGraph,
		delta: GraphDelta,
	}

	impl Fixture {
		fn new() -> Self {
			let device = Device::new();
			let stream = device.create_stream();
			Self { device, stream, graph: SceneGraph::new(), delta: GraphDelta::default() }
		}

		fn mesh_with_group(&mut self, name: &str) -> NodeKey {
			let node = self.graph.create_surface_node(name, SurfaceGeometry::TriangleMesh);
			self.graph
				.set_vertices(node, quad_vertices(), &self.device, &self.stream, &mut self.delta)
				.unwrap();
			self.graph
				.add_material_group(
					node,
					vec![0, 1, 2, 0, 2, 3],
					MaterialHandle::default(),
					None,
					None,
					None,
					&self.device,
					&self.stream,
					&mut self.delta,
				)
				.unwrap();
			node
		}
	}

	fn translation(x: f32, y: f32, z: f32) -> StaticTransform {
		StaticTransform::new(Matrix4::translation(Vector3::new(x, y, z)))
	}

	#[test]
	fn direct_surface_child_creates_one_root_transform() {
		let mut f = Fixture::new();
		let mesh = f.mesh_with_group("quad");
		let root = f.graph.root();
		f.graph.add_child(root, mesh, &mut f.delta).unwrap();

		let roots = f.graph.root_transforms();
		assert_eq!(roots.len(), 1);
		assert_eq!(f.delta.transforms_added.len(), 1);
		let group = f.graph.geometry_descendant(roots[0]);
		assert_eq!(f.graph.group_members(group).len(), 1);
	}

	#[test]
	fn two_parent_paths_make_two_root_transforms_sharing_one_group() {
		let mut f = Fixture::new();
		let mesh = f.mesh_with_group("quad");
		let root = f.graph.root();
		let holder = f.graph.create_internal_node("holder", StaticTransform::IDENTITY);
		let left = f.graph.create_internal_node("left", translation(-1.0, 0.0, 0.0));
		let right = f.graph.create_internal_node("right", translation(1.0, 0.0, 0.0));

		f.graph.add_child(holder, mesh, &mut f.delta).unwrap();
		f.graph.add_child(left, holder, &mut f.delta).unwrap();
		f.graph.add_child(right, holder, &mut f.delta).unwrap();
		f.graph.add_child(root, left, &mut f.delta).unwrap();
		f.graph.add_child(root, right, &mut f.delta).unwrap();

		let roots = f.graph.root_transforms();
		assert_eq!(roots.len(), 2);
		let groups: Vec<_> = roots.iter().map(|&r| f.graph.geometry_descendant(r)).collect();
		assert_eq!(groups[0], groups[1], "both paths must share the holder's geometry group");

		// An in-place geometry edit must be observed once per path, on the
		// shared group.
		f.delta = GraphDelta::default();
		f.graph.mark_material_group_updated(mesh, 0, &mut f.delta).unwrap();
		assert_eq!(f.delta.geom_inst_events.len(), 2);
		assert!(f
			.delta
			.geom_inst_events
			.iter()
			.all(|e| e.kind == GeomInstEventKind::Updated && e.group == groups[0]));
	}

	#[test]
	fn composed_matrices_match_path_products() {
		let mut f = Fixture::new();
		let mesh = f.mesh_with_group("quad");
		let root = f.graph.root();
		let outer = f.graph.create_internal_node("outer", translation(0.0, 5.0, 0.0));
		let inner = f.graph.create_internal_node("inner", translation(2.0, 0.0, 0.0));

		f.graph.add_child(inner, mesh, &mut f.delta).unwrap();
		f.graph.add_child(outer, inner, &mut f.delta).unwrap();
		f.graph.add_child(root, outer, &mut f.delta).unwrap();

		let roots = f.graph.root_transforms();
		assert_eq!(roots.len(), 1);
		let m = f.graph.resolved_transform(roots[0]);
		let p = m.matrix().transform_point(Point3::ZERO);
		assert_eq!(p, Point3::new(2.0, 5.0, 0.0));

		// Retransform an inner node; the root transform must follow.
		f.graph
			.set_transform(inner, translation(3.0, 0.0, 0.0), &mut f.delta)
			.unwrap();
		let m = f.graph.resolved_transform(roots[0]);
		let p = m.matrix().transform_point(Point3::ZERO);
		assert_eq!(p, Point3::new(3.0, 5.0, 0.0));
		assert_eq!(f.delta.transforms_updated, roots);
	}

	#[test]
	fn removing_a_branch_removes_its_root_transforms() {
		let mut f = Fixture::new();
		let mesh = f.mesh_with_group("quad");
		let root = f.graph.root();
		let branch = f.graph.create_internal_node("branch", StaticTransform::IDENTITY);

		f.graph.add_child(branch, mesh, &mut f.delta).unwrap();
		f.graph.add_child(root, branch, &mut f.delta).unwrap();
		assert_eq!(f.graph.root_transforms().len(), 1);

		f.delta = GraphDelta::default();
		f.graph.remove_child(root, branch, &mut f.delta).unwrap();
		assert!(f.graph.root_transforms().is_empty());
		assert_eq!(f.delta.transforms_removed.len(), 1);

		// Detaching the mesh from the branch empties the branch's group.
		f.graph.remove_child(branch, mesh, &mut f.delta).unwrap();
		assert!(f.graph.group_members(f.graph.geom_group_of(branch).unwrap()).is_empty());
	}

	#[test]
	fn remove_unknown_child_reports_not_found() {
		let mut f = Fixture::new();
		let root = f.graph.root();
		let stray = f.graph.create_internal_node("stray", StaticTransform::IDENTITY);
		assert!(matches!(
			f.graph.remove_child(root, stray, &mut f.delta),
			Err(Error::NotFound)
		));
	}

	#[test]
	fn surface_attach_then_detach_balances_events() {
		let mut f = Fixture::new();
		let mesh = f.mesh_with_group("quad");
		let root = f.graph.root();
		let holder = f.graph.create_internal_node("holder", StaticTransform::IDENTITY);
		f.graph.add_child(root, holder, &mut f.delta).unwrap();

		f.delta = GraphDelta::default();
		f.graph.add_child(holder, mesh, &mut f.delta).unwrap();
		let added = f
			.delta
			.geom_inst_events
			.iter()
			.filter(|e| e.kind == GeomInstEventKind::Added)
			.count();
		assert_eq!(added, 1);
		assert_eq!(f.delta.transforms_added.len(), 1);

		f.delta = GraphDelta::default();
		f.graph.remove_child(holder, mesh, &mut f.delta).unwrap();
		let removed = f
			.delta
			.geom_inst_events
			.iter()
			.filter(|e| e.kind == GeomInstEventKind::Removed)
			.count();
		assert_eq!(removed, 1);
		assert_eq!(f.delta.transforms_removed.len(), 1);
	}
}
