//! Scene-level GPU state: geometry instances, acceleration structures, the
//! light-instance distribution and the environment instance, kept coherent
//! with the user graph through the deltas it emits.

pub mod graph;

use std::collections::{HashMap, HashSet};

use slotmap::SlotMap;

use crate::gpu::slot::SlotBuffer;
use crate::gpu::{
	Buffer, BufferImpl, Device, DeviceImpl, GeometryAccel, GeometryAccelImpl, GeometryInstance,
	GeometryInstanceImpl, InstanceAccel, InstanceAccelImpl, InstanceDescriptor, Kernel, KernelImpl,
	RtScene, RtSceneImpl, Stream, TypedBuffer,
};
use crate::image::LinearImage2D;
use crate::material::SurfaceMaterial;
use crate::math::BoundingBox3;
use crate::object::{ImageHandle, MaterialHandle, ShaderNodeHandle};
use crate::renderer::ModuleKind;
use crate::sampling::{ContinuousDistribution2D, DiscreteDistribution1D};
use crate::shader_nodes::{self, plug_record, ShaderNode, ShaderNodeClassTable, ShaderNodeKind};
use crate::shared::{self, GeometryKind};
use crate::{Error, Result};

use graph::{
	GeomInstEventKind, GraphDelta, NodeKey, SceneGraph, ShGeomGroupKey, ShGeomInstKey,
	ShTransformKey, SurfaceGeometry,
};

const MAX_GEOMETRY_INSTANCES: u32 = 16384;
const MAX_INSTANCES: u32 = 16384;

/// Geometry decode/sample callables per geometry kind.
#[derive(Clone, Copy)]
pub struct GeometryClassPrograms {
	pub prog_decode_hit_point: u32,
	pub prog_sample: u32,
}

pub struct GeometryClassTable {
	pub triangle: GeometryClassPrograms,
	pub point: GeometryClassPrograms,
	pub infinite_sphere: GeometryClassPrograms,
}

pub fn initialize_geometry_programs(
	register: &mut impl FnMut(ModuleKind, &str) -> u32,
) -> GeometryClassTable {
	GeometryClassTable {
		triangle: GeometryClassPrograms {
			prog_decode_hit_point: register(ModuleKind::Geometry, "decodeHitPointForTriangle"),
			prog_sample: register(ModuleKind::Geometry, "sampleTriangleMesh"),
		},
		point: GeometryClassPrograms {
			prog_decode_hit_point: register(ModuleKind::Geometry, "decodeHitPointForPoint"),
			prog_sample: register(ModuleKind::Geometry, "samplePoint"),
		},
		infinite_sphere: GeometryClassPrograms {
			prog_decode_hit_point: register(ModuleKind::Geometry, "decodeHitPointForInfiniteSphere"),
			prog_sample: register(ModuleKind::Geometry, "sampleInfiniteSphere"),
		},
	}
}

/// Immutable context-side collaborators the scene needs while serializing
/// records.
pub struct SceneSubsystems<'a> {
	pub device: &'a Device,
	pub materials: &'a SlotMap<MaterialHandle, SurfaceMaterial>,
	pub shader_nodes: &'a SlotMap<ShaderNodeHandle, ShaderNode>,
	pub images: &'a SlotMap<ImageHandle, LinearImage2D>,
	pub node_table: &'a ShaderNodeClassTable,
	pub geometry_programs: &'a GeometryClassTable,
	pub null_image_env: ImageHandle,
}

/// The kernels of the scene-setup module.
pub struct SceneKernels {
	pub compute_instance_aabbs: Kernel,
	pub finalize_instance_aabbs: Kernel,
	pub compute_scene_aabb: Kernel,
	pub finalize_scene_bounds: Kernel,
}

struct GeomInstRec {
	gpu_inst: GeometryInstance,
	slot: u32,
	record: shared::GeometryInstanceRecord,
}

struct GasRec {
	gas: GeometryAccel,
	mem: Option<Buffer>,
	ref_count: u32,
}

struct InstanceRec {
	slot: u32,
	group: ShGeomGroupKey,
	geom_inst_indices: Option<TypedBuffer<u32>>,
	light_dist: Option<DiscreteDistribution1D>,
	importance: f32,
}

struct EnvironmentState {
	material: MaterialHandle,
	node: NodeKey,
	geom_inst_slot: u32,
	inst_slot: u32,
	importance_map: Option<ContinuousDistribution2D>,
	geom_inst_indices: Option<TypedBuffer<u32>>,
	light_dist: Option<DiscreteDistribution1D>,
}

#[repr(C)]
struct InstanceAabbParams {
	inst_indices: crate::gpu::DevicePtr,
	item_offsets: crate::gpu::DevicePtr,
	num_instances: u32,
}

#[repr(C)]
struct SceneAabbParams {
	scene_bounds: crate::gpu::DevicePtr,
	num_instances: u32,
}

pub struct Scene {
	graph: SceneGraph,
	rt_scene: RtScene,

	geom_inst_pool: SlotBuffer<shared::GeometryInstanceRecord>,
	inst_pool: SlotBuffer<shared::InstanceRecord>,

	geom_inst_records: HashMap<ShGeomInstKey, GeomInstRec>,
	gas_records: HashMap<ShGeomGroupKey, GasRec>,
	instance_records: HashMap<ShTransformKey, InstanceRec>,

	dirty_geom_insts: HashSet<ShGeomInstKey>,
	dirty_gases: HashSet<ShGeomGroupKey>,
	pending_gas_rebuilds: Vec<ShGeomGroupKey>,
	dirty_instances: HashSet<ShTransformKey>,
	ias_dirty: bool,

	ias: InstanceAccel,
	ias_mem: Option<Buffer>,
	instance_buffer: TypedBuffer<InstanceDescriptor>,
	aabb_inst_indices: TypedBuffer<u32>,
	aabb_item_offsets: TypedBuffer<u32>,
	scene_bounds: Buffer,

	light_inst_indices: Option<TypedBuffer<u32>>,
	light_inst_dist: Option<DiscreteDistribution1D>,

	environment: Option<EnvironmentState>,
	env_rotation_phi: f32,
	env_dirty: bool,

	sbt_layout_size: usize,
	sbt_layout_was_up_to_date: bool,
}

impl Scene {
	pub fn new(device: &Device) -> Result<Self> {
		let rt_scene = device.create_rt_scene();
		let ias = rt_scene.create_instance_accel();
		Ok(Self {
			graph: SceneGraph::new(),
			rt_scene,
			geom_inst_pool: SlotBuffer::new(device, MAX_GEOMETRY_INSTANCES)?,
			inst_pool: SlotBuffer::new(device, MAX_INSTANCES)?,
			geom_inst_records: HashMap::new(),
			gas_records: HashMap::new(),
			instance_records: HashMap::new(),
			dirty_geom_insts: HashSet::new(),
			dirty_gases: HashSet::new(),
			pending_gas_rebuilds: Vec::new(),
			dirty_instances: HashSet::new(),
			ias_dirty: true,
			ias,
			ias_mem: None,
			instance_buffer: TypedBuffer::new(device, MAX_INSTANCES as usize)?,
			aabb_inst_indices: TypedBuffer::new(device, MAX_INSTANCES as usize)?,
			aabb_item_offsets: TypedBuffer::new(device, MAX_INSTANCES as usize)?,
			scene_bounds: device.create_buffer(std::mem::size_of::<BoundingBox3>().max(32))?,
			light_inst_indices: None,
			light_inst_dist: None,
			environment: None,
			env_rotation_phi: 0.0,
			env_dirty: false,
			sbt_layout_size: 0,
			sbt_layout_was_up_to_date: false,
		})
	}

	pub fn graph(&self) -> &SceneGraph {
		&self.graph
	}

	pub fn rt_scene(&self) -> &RtScene {
		&self.rt_scene
	}

	pub fn num_instances(&self) -> usize {
		self.instance_records.len()
	}

	pub fn light_instance_distribution(&self) -> Option<&DiscreteDistribution1D> {
		self.light_inst_dist.as_ref()
	}

	// Graph mutations. Each runs the structural edit and folds the emitted
	// delta into the dirty sets.

	pub fn create_internal_node(&mut self, name: &str, transform: crate::math::StaticTransform) -> NodeKey {
		self.graph.create_internal_node(name, transform)
	}

	pub fn create_triangle_mesh_node(&mut self, name: &str) -> NodeKey {
		self.graph.create_surface_node(name, SurfaceGeometry::TriangleMesh)
	}

	pub fn create_point_node(&mut self, name: &str) -> NodeKey {
		self.graph.create_surface_node(name, SurfaceGeometry::PointSet)
	}

	pub fn root(&self) -> NodeKey {
		self.graph.root()
	}

	pub fn set_vertices(
		&mut self,
		node: NodeKey,
		vertices: Vec<shared::Vertex>,
		device: &Device,
		stream: &Stream,
	) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.set_vertices(node, vertices, device, stream, &mut delta)?;
		self.apply_delta(delta)
	}

	#[allow(clippy::too_many_arguments)]
	pub fn add_material_group(
		&mut self,
		node: NodeKey,
		indices: Vec<u32>,
		material: MaterialHandle,
		node_normal: Option<crate::object::Plug>,
		node_tangent: Option<crate::object::Plug>,
		node_alpha: Option<crate::object::Plug>,
		device: &Device,
		stream: &Stream,
	) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.add_material_group(
			node,
			indices,
			material,
			node_normal,
			node_tangent,
			node_alpha,
			device,
			stream,
			&mut delta,
		)?;
		self.apply_delta(delta)
	}

	pub fn add_child(&mut self, parent: NodeKey, child: NodeKey) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.add_child(parent, child, &mut delta)?;
		self.apply_delta(delta)
	}

	pub fn remove_child(&mut self, parent: NodeKey, child: NodeKey) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.remove_child(parent, child, &mut delta)?;
		self.apply_delta(delta)
	}

	pub fn set_transform(&mut self, node: NodeKey, transform: crate::math::StaticTransform) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.set_transform(node, transform, &mut delta)?;
		self.apply_delta(delta)
	}

	pub fn mark_material_group_updated(&mut self, node: NodeKey, group_index: u32) -> Result<()> {
		let mut delta = GraphDelta::default();
		self.graph.mark_material_group_updated(node, group_index, &mut delta)?;
		self.apply_delta(delta)
	}

	/// Binds the environment emitter material; the environment instance is
	/// rebuilt at the next frame preparation.
	pub fn set_environment(&mut self, material: MaterialHandle) {
		let node = match &self.environment {
			Some(env) => env.node,
			None => self.graph.create_surface_node("environment", SurfaceGeometry::InfiniteSphere),
		};
		let (geom_inst_slot, inst_slot) = match self.environment.take() {
			Some(previous) => (previous.geom_inst_slot, previous.inst_slot),
			None => (shared::INVALID_SLOT, shared::INVALID_SLOT),
		};
		self.environment = Some(EnvironmentState {
			material,
			node,
			geom_inst_slot,
			inst_slot,
			importance_map: None,
			geom_inst_indices: None,
			light_dist: None,
		});
		self.env_dirty = true;
	}

	pub fn set_environment_rotation(&mut self, rotation_phi: f32) {
		self.env_rotation_phi = rotation_phi;
		self.env_dirty = true;
	}

	fn mark_instances_with_group_dirty(&mut self, group: ShGeomGroupKey) {
		let affected: Vec<ShTransformKey> = self
			.instance_records
			.iter()
			.filter(|(_, rec)| rec.group == group)
			.map(|(&key, _)| key)
			.collect();
		for key in affected {
			self.dirty_instances.insert(key);
		}
	}

	fn geom_inst_referenced(&self, inst: ShGeomInstKey) -> bool {
		let Some(sh_inst) = self.graph.geom_inst(inst) else {
			return false;
		};
		self.graph
			.parents_of(sh_inst.surface_node)
			.iter()
			.filter_map(|&p| self.graph.geom_group_of(p))
			.any(|group| self.gas_records.get(&group).is_some_and(|gas| gas.ref_count > 0))
	}

	fn ensure_geom_inst_record(&mut self, inst: ShGeomInstKey) -> Result<()> {
		if self.geom_inst_records.contains_key(&inst) {
			return Ok(());
		}
		let slot = self.geom_inst_pool.allocate()?;
		let gpu_inst = self.rt_scene.create_geometry_instance();
		self.geom_inst_records.insert(
			inst,
			GeomInstRec { gpu_inst, slot, record: shared::GeometryInstanceRecord::default() },
		);
		self.dirty_geom_insts.insert(inst);
		Ok(())
	}

	fn release_geom_inst_record(&mut self, inst: ShGeomInstKey) {
		if let Some(rec) = self.geom_inst_records.remove(&inst) {
			self.geom_inst_pool.release(rec.slot);
			self.dirty_geom_insts.remove(&inst);
		}
	}

	fn apply_delta(&mut self, delta: GraphDelta) -> Result<()> {
		for event in &delta.geom_inst_events {
			match event.kind {
				GeomInstEventKind::Added => {
					let referenced = self
						.gas_records
						.get(&event.group)
						.is_some_and(|gas| gas.ref_count > 0);
					if referenced {
						self.ensure_geom_inst_record(event.inst)?;
						self.dirty_gases.insert(event.group);
						self.mark_instances_with_group_dirty(event.group);
					}
				}
				GeomInstEventKind::Removed => {
					if self.gas_records.contains_key(&event.group) {
						self.dirty_gases.insert(event.group);
						self.mark_instances_with_group_dirty(event.group);
					}
					if self.geom_inst_records.contains_key(&event.inst)
						&& !self.geom_inst_referenced(event.inst)
					{
						self.release_geom_inst_record(event.inst);
					}
				}
				GeomInstEventKind::Updated => {
					if self.geom_inst_records.contains_key(&event.inst) {
						self.dirty_geom_insts.insert(event.inst);
						self.dirty_gases.insert(event.group);
						self.mark_instances_with_group_dirty(event.group);
					}
				}
			}
		}

		for &sht in &delta.transforms_added {
			let group = self.graph.geometry_descendant(sht);
			let gas_is_new = !self.gas_records.contains_key(&group);
			if gas_is_new {
				let gas = self.rt_scene.create_geometry_accel();
				self.gas_records.insert(group, GasRec { gas, mem: None, ref_count: 0 });
				self.dirty_gases.insert(group);
			}
			let gas = self.gas_records.get_mut(&group).unwrap();
			gas.ref_count += 1;
			if gas.ref_count == 1 {
				let members: Vec<ShGeomInstKey> = self.graph.group_members(group).to_vec();
				for inst in members {
					self.ensure_geom_inst_record(inst)?;
				}
				self.dirty_gases.insert(group);
			}
			let slot = self.inst_pool.allocate()?;
			self.instance_records.insert(
				sht,
				InstanceRec { slot, group, geom_inst_indices: None, light_dist: None, importance: 0.0 },
			);
			self.dirty_instances.insert(sht);
			self.ias_dirty = true;
		}

		for &sht in &delta.transforms_removed {
			if let Some(rec) = self.instance_records.remove(&sht) {
				self.inst_pool.release(rec.slot);
				self.dirty_instances.remove(&sht);
				self.ias_dirty = true;
				if let Some(gas) = self.gas_records.get_mut(&rec.group) {
					gas.ref_count -= 1;
					if gas.ref_count == 0 {
						self.gas_records.remove(&rec.group);
						self.dirty_gases.remove(&rec.group);
						let members: Vec<ShGeomInstKey> = self.graph.group_members(rec.group).to_vec();
						for inst in members {
							if !self.geom_inst_referenced(inst) {
								self.release_geom_inst_record(inst);
							}
						}
					}
				}
			}
		}

		for &sht in &delta.transforms_updated {
			if self.instance_records.contains_key(&sht) {
				self.dirty_instances.insert(sht);
				self.ias_dirty = true;
			}
		}

		Ok(())
	}

	fn write_geom_inst_record(
		&mut self,
		inst: ShGeomInstKey,
		subsystems: &SceneSubsystems,
		stream: &Stream,
	) -> Result<()> {
		let Some(sh_inst) = self.graph.geom_inst(inst) else {
			return Ok(());
		};
		let surface_node = sh_inst.surface_node;
		let group_index = sh_inst.group_index as usize;
		let user_data = sh_inst.user_data;
		let Some(data) = self.graph.surface_data(surface_node) else {
			return Ok(());
		};
		let group = &data.groups[group_index];
		let material = subsystems
			.materials
			.get(group.material)
			.ok_or_else(|| Error::InvalidArgument("material group references a destroyed material".to_string()))?;
		let material_importance = material.importance();

		let (kind, programs) = match data.geometry {
			SurfaceGeometry::TriangleMesh => (GeometryKind::TriangleMesh, subsystems.geometry_programs.triangle),
			SurfaceGeometry::PointSet => (GeometryKind::PointSet, subsystems.geometry_programs.point),
			SurfaceGeometry::InfiniteSphere => {
				(GeometryKind::InfiniteSphere, subsystems.geometry_programs.infinite_sphere)
			}
		};

		let vertex_buffer = data
			.vertex_buffer
			.as_ref()
			.map(|b| b.device_pointer())
			.unwrap_or(crate::gpu::DevicePtr::NULL);
		let (index_buffer, triangle_count, vertex_count) = match &group.index_data {
			graph::GroupIndexData::Triangles(buffer) => {
				(buffer.device_pointer(), buffer.len() as u32, data.vertices.len() as u32)
			}
			graph::GroupIndexData::Points(buffer) => {
				(buffer.device_pointer(), buffer.len() as u32, data.vertices.len() as u32)
			}
			graph::GroupIndexData::None => (crate::gpu::DevicePtr::NULL, 0, 0),
		};

		let uses_alpha = group.node_alpha.is_some();
		let record = shared::GeometryInstanceRecord {
			vertex_buffer,
			index_buffer,
			primitive_distribution: group
				.primitive_distribution
				.as_ref()
				.map(|d| d.record())
				.unwrap_or_default(),
			material_desc_index: material.desc_index,
			geometry_kind: kind as u32,
			prog_decode_hit_point: programs.prog_decode_hit_point,
			prog_sample: programs.prog_sample,
			node_normal: plug_record(group.node_normal, subsystems.shader_nodes, subsystems.node_table),
			node_tangent: plug_record(group.node_tangent, subsystems.shader_nodes, subsystems.node_table),
			node_alpha: plug_record(group.node_alpha, subsystems.shader_nodes, subsystems.node_table),
			importance: material_importance,
			user_data,
			padding: [0; 2],
		};

		let rec = self.geom_inst_records.get_mut(&inst).unwrap();
		rec.record = record;
		rec.gpu_inst.set_user_data(rec.slot);
		rec.gpu_inst.set_uses_alpha(uses_alpha);
		if kind == GeometryKind::TriangleMesh {
			rec.gpu_inst
				.set_triangle_buffers(vertex_buffer, vertex_count, index_buffer, triangle_count);
		}
		self.geom_inst_pool.update(rec.slot, &record, stream);
		Ok(())
	}

	fn write_instance_record(
		&mut self,
		sht: ShTransformKey,
		subsystems: &SceneSubsystems,
		stream: &Stream,
	) -> Result<()> {
		let transform = self.graph.resolved_transform(sht);
		let group = self.instance_records[&sht].group;
		let members: Vec<ShGeomInstKey> = self.graph.group_members(group).to_vec();

		let mut slots = Vec::with_capacity(members.len());
		let mut weights = Vec::with_capacity(members.len());
		for inst in &members {
			let Some(rec) = self.geom_inst_records.get(inst) else {
				continue;
			};
			slots.push(rec.slot);
			weights.push(rec.record.importance);
		}

		let geom_inst_indices = if slots.is_empty() {
			None
		} else {
			let buffer = TypedBuffer::new(subsystems.device, slots.len())?;
			buffer.write_slice(stream, 0, &slots);
			Some(buffer)
		};
		let light_dist = if weights.is_empty() {
			None
		} else {
			Some(DiscreteDistribution1D::new(subsystems.device, stream, &weights)?)
		};
		let importance = light_dist.as_ref().map(|d| d.integral()).unwrap_or(0.0);

		let record = shared::InstanceRecord {
			transform: transform.matrix().to_rows_3x4(),
			inv_transform: transform.inverse_matrix().to_rows_3x4(),
			geom_inst_indices: geom_inst_indices
				.as_ref()
				.map(|b| b.device_pointer())
				.unwrap_or(crate::gpu::DevicePtr::NULL),
			num_geom_insts: slots.len() as u32,
			importance,
			light_geom_inst_distribution: light_dist.as_ref().map(|d| d.record()).unwrap_or_default(),
			rotation: [0.0, 0.0, 0.0, 1.0],
		};

		let rec = self.instance_records.get_mut(&sht).unwrap();
		rec.geom_inst_indices = geom_inst_indices;
		rec.light_dist = light_dist;
		rec.importance = importance;
		self.inst_pool.update(rec.slot, &record, stream);
		Ok(())
	}

	fn rebuild_environment(&mut self, subsystems: &SceneSubsystems, stream: &Stream) -> Result<()> {
		let Some(env) = &mut self.environment else {
			return Ok(());
		};
		let material = subsystems
			.materials
			.get(env.material)
			.ok_or_else(|| Error::InvalidArgument("environment references a destroyed material".to_string()))?;

		if env.geom_inst_slot == shared::INVALID_SLOT {
			env.geom_inst_slot = self.geom_inst_pool.allocate()?;
		}
		if env.inst_slot == shared::INVALID_SLOT {
			env.inst_slot = self.inst_pool.allocate()?;
		}

		// The importance map follows the emittance plug when it is an
		// environment texture; a constant emitter keeps a 1x1 map.
		let emittance_node = match &material.kind {
			crate::material::SurfaceMaterialKind::EnvironmentEmitter { node_emittance, .. } => {
				node_emittance.and_then(|plug| subsystems.shader_nodes.get(plug.node))
			}
			_ => None,
		};
		let importance_map = match emittance_node {
			Some(node) if matches!(node.kind, ShaderNodeKind::EnvironmentTexture { .. }) => {
				shader_nodes::create_importance_map(
					node,
					subsystems.images,
					subsystems.null_image_env,
					subsystems.device,
					stream,
				)?
			}
			_ => ContinuousDistribution2D::new(subsystems.device, stream, &[1.0], 1, 1)?,
		};

		let geom_inst_record = shared::GeometryInstanceRecord {
			material_desc_index: material.desc_index,
			geometry_kind: GeometryKind::InfiniteSphere as u32,
			prog_decode_hit_point: subsystems.geometry_programs.infinite_sphere.prog_decode_hit_point,
			prog_sample: subsystems.geometry_programs.infinite_sphere.prog_sample,
			importance: material.importance(),
			..Default::default()
		};
		self.geom_inst_pool.update(env.geom_inst_slot, &geom_inst_record, stream);

		let rotation = crate::math::Quaternion::from_axis_angle(crate::math::Vector3::Y, self.env_rotation_phi);
		let env_indices = TypedBuffer::new(subsystems.device, 1)?;
		env_indices.write_slice(stream, 0, &[env.geom_inst_slot]);
		let light_dist = DiscreteDistribution1D::new(subsystems.device, stream, &[1.0])?;
		let inst_record = shared::InstanceRecord {
			transform: crate::math::Matrix4::IDENTITY.to_rows_3x4(),
			inv_transform: crate::math::Matrix4::IDENTITY.to_rows_3x4(),
			geom_inst_indices: env_indices.device_pointer(),
			num_geom_insts: 1,
			importance: material.importance(),
			light_geom_inst_distribution: light_dist.record(),
			rotation: [rotation.x, rotation.y, rotation.z, rotation.w],
		};
		self.inst_pool.update(env.inst_slot, &inst_record, stream);

		env.importance_map = Some(importance_map);
		env.geom_inst_indices = Some(env_indices);
		env.light_dist = Some(light_dist);
		Ok(())
	}

	/// First half of frame preparation: flush dirty records, size the
	/// acceleration structures and report the scratch requirement.
	pub fn prepare_setup(&mut self, subsystems: &SceneSubsystems, stream: &Stream) -> Result<usize> {
		let dirty_geom_insts: Vec<ShGeomInstKey> = self.dirty_geom_insts.drain().collect();
		for inst in dirty_geom_insts {
			self.write_geom_inst_record(inst, subsystems, stream)?;
		}

		let mut max_scratch = 0usize;
		let dirty_gases: Vec<ShGeomGroupKey> = self.dirty_gases.drain().collect();
		for group in dirty_gases {
			let members: Vec<ShGeomInstKey> = self.graph.group_members(group).to_vec();
			let children: Vec<GeometryInstance> = members
				.iter()
				.filter_map(|inst| self.geom_inst_records.get(inst))
				.map(|rec| rec.gpu_inst.clone())
				.collect();
			let Some(gas) = self.gas_records.get_mut(&group) else {
				continue;
			};
			gas.gas.set_children(&children);
			let sizes = gas.gas.prepare_for_build();
			let needs_alloc = gas
				.mem
				.as_ref()
				.map(|m| m.size_in_bytes() < sizes.accel_size)
				.unwrap_or(true);
			if needs_alloc {
				gas.mem = Some(subsystems.device.create_buffer(sizes.accel_size)?);
			}
			max_scratch = max_scratch.max(sizes.build_scratch_size);
			self.pending_gas_rebuilds.push(group);
		}

		let dirty_instances: Vec<ShTransformKey> = self.dirty_instances.drain().collect();
		for sht in dirty_instances {
			self.write_instance_record(sht, subsystems, stream)?;
		}

		if self.env_dirty {
			self.rebuild_environment(subsystems, stream)?;
			self.env_dirty = false;
		}

		// Size the top-level build against the current instance count; the
		// descriptor contents are written in setup.
		self.ias
			.set_instances(self.instance_buffer.device_pointer(), self.instance_records.len() as u32);
		let sizes = self.ias.prepare_for_build();
		max_scratch = max_scratch.max(sizes.build_scratch_size);

		self.sbt_layout_was_up_to_date = self.rt_scene.shader_binding_table_layout_is_ready();
		self.sbt_layout_size = self.rt_scene.generate_shader_binding_table_layout();

		Ok(max_scratch)
	}

	pub fn sbt_layout_size(&self) -> usize {
		self.sbt_layout_size
	}

	pub fn sbt_layout_was_up_to_date(&self) -> bool {
		self.sbt_layout_was_up_to_date
	}

	/// Second half: build acceleration structures, bounds and the light
	/// distribution, then publish everything into the launch parameters.
	pub fn setup(
		&mut self,
		subsystems: &SceneSubsystems,
		kernels: &SceneKernels,
		stream: &Stream,
		as_scratch: &Buffer,
		launch_params: &mut shared::PipelineLaunchParameters,
	) -> Result<()> {
		for group in std::mem::take(&mut self.pending_gas_rebuilds) {
			if let Some(gas) = self.gas_records.get(&group) {
				gas.gas.rebuild(stream, gas.mem.as_ref().unwrap(), as_scratch);
			}
		}

		// Instance AABBs, then the scene bounds, each as a two-phase
		// reduction. Item offsets are prefix sums of per-instance geometry
		// counts so the reduction kernel can partition its work list.
		let mut live: Vec<(u32, u32)> = self
			.instance_records
			.values()
			.map(|rec| {
				let count = rec.geom_inst_indices.as_ref().map(|b| b.len() as u32).unwrap_or(0);
				(rec.slot, count)
			})
			.collect();
		live.sort_unstable_by_key(|&(slot, _)| slot);
		let num_instances = live.len() as u32;
		if !live.is_empty() {
			let inst_slots: Vec<u32> = live.iter().map(|&(slot, _)| slot).collect();
			let mut offsets = Vec::with_capacity(live.len());
			let mut running = 0u32;
			for &(_, count) in &live {
				offsets.push(running);
				running += count;
			}
			self.aabb_inst_indices.write_slice(stream, 0, &inst_slots);
			self.aabb_item_offsets.write_slice(stream, 0, &offsets);
		}
		let aabb_params = InstanceAabbParams {
			inst_indices: self.aabb_inst_indices.device_pointer(),
			item_offsets: self.aabb_item_offsets.device_pointer(),
			num_instances,
		};
		kernels.compute_instance_aabbs.launch(
			stream,
			kernels.compute_instance_aabbs.calc_grid_dim(num_instances.max(1), 1),
			crate::gpu::as_u8_slice(&aabb_params),
		);
		kernels.finalize_instance_aabbs.launch(
			stream,
			kernels.finalize_instance_aabbs.calc_grid_dim(num_instances.max(1), 1),
			crate::gpu::as_u8_slice(&aabb_params),
		);
		let bounds_params = SceneAabbParams {
			scene_bounds: self.scene_bounds.device_pointer(),
			num_instances,
		};
		kernels.compute_scene_aabb.launch(
			stream,
			kernels.compute_scene_aabb.calc_grid_dim(num_instances.max(1), 1),
			crate::gpu::as_u8_slice(&bounds_params),
		);
		kernels.finalize_scene_bounds.launch(stream, (1, 1, 1), crate::gpu::as_u8_slice(&bounds_params));

		// Top-level instance AS over every live instance. Ordered by slot so
		// rebuilds are deterministic for a given scene state.
		if self.ias_dirty {
			let mut ordered: Vec<ShTransformKey> = self.instance_records.keys().copied().collect();
			ordered.sort_unstable_by_key(|sht| self.instance_records[sht].slot);
			let mut descriptor_count = 0usize;
			let mut sbt_offset = 0u32;
			for sht in ordered {
				let rec = &self.instance_records[&sht];
				let transform = self.graph.resolved_transform(sht);
				let Some(gas) = self.gas_records.get(&rec.group) else {
					continue;
				};
				let descriptor = InstanceDescriptor {
					transform: transform.matrix().to_rows_3x4(),
					instance_id: rec.slot,
					visibility_mask: 0xff,
					sbt_offset,
					traversable: gas.gas.handle(),
				};
				self.instance_buffer.write_element(stream, descriptor_count, &descriptor);
				descriptor_count += 1;
				let num_geom_insts = rec
					.geom_inst_indices
					.as_ref()
					.map(|b| b.len() as u32)
					.unwrap_or(0);
				sbt_offset += num_geom_insts * shared::MAX_NUM_RAY_TYPES;
			}
			self.ias
				.set_instances(self.instance_buffer.device_pointer(), descriptor_count as u32);
		}
		let ias_sizes = self.ias.prepare_for_build();
		let needs_alloc = self
			.ias_mem
			.as_ref()
			.map(|m| m.size_in_bytes() < ias_sizes.accel_size)
			.unwrap_or(true);
		if needs_alloc {
			self.ias_mem = Some(subsystems.device.create_buffer(ias_sizes.accel_size.max(256))?);
		}
		let top_handle = self.ias.rebuild(stream, self.ias_mem.as_ref().unwrap(), as_scratch);
		self.ias_dirty = false;

		// Light-instance selection over every emitting instance.
		let mut emitting: Vec<(u32, f32)> = self
			.instance_records
			.values()
			.filter(|rec| rec.importance > 0.0)
			.map(|rec| (rec.slot, rec.importance))
			.collect();
		emitting.sort_unstable_by_key(|&(slot, _)| slot);
		let mut light_slots: Vec<u32> = emitting.iter().map(|&(slot, _)| slot).collect();
		let mut light_weights: Vec<f32> = emitting.iter().map(|&(_, w)| w).collect();
		if let Some(env) = &self.environment {
			if env.inst_slot != shared::INVALID_SLOT {
				light_slots.push(env.inst_slot);
				light_weights.push(1.0);
			}
		}
		if light_slots.is_empty() {
			self.light_inst_indices = None;
			self.light_inst_dist = None;
		} else {
			let indices = TypedBuffer::new(subsystems.device, light_slots.len())?;
			indices.write_slice(stream, 0, &light_slots);
			self.light_inst_indices = Some(indices);
			self.light_inst_dist = Some(DiscreteDistribution1D::new(subsystems.device, stream, &light_weights)?);
		}

		launch_params.geom_inst_buffer = self.geom_inst_pool.device_pointer();
		launch_params.inst_buffer = self.inst_pool.device_pointer();
		launch_params.top_group = top_handle;
		launch_params.scene_bounds = self.scene_bounds.device_pointer();
		launch_params.light_inst_indices = self
			.light_inst_indices
			.as_ref()
			.map(|b| b.device_pointer())
			.unwrap_or(crate::gpu::DevicePtr::NULL);
		launch_params.light_inst_dist = self
			.light_inst_dist
			.as_ref()
			.map(|d| d.record())
			.unwrap_or_default();
		launch_params.env_inst_index = self
			.environment
			.as_ref()
			.map(|env| env.inst_slot)
			.unwrap_or(shared::INVALID_SLOT);
		launch_params.env_rotation_phi = self.env_rotation_phi;
		launch_params.env_importance_map = self
			.environment
			.as_ref()
			.and_then(|env| env.importance_map.as_ref())
			.map(|map| map.record())
			.unwrap_or_default();
		Ok(())
	}

	/// Reads back a geometry-instance descriptor slot; used by validation.
	pub fn read_geom_inst_slot(&self, inst: ShGeomInstKey) -> Option<shared::GeometryInstanceRecord> {
		self.geom_inst_records
			.get(&inst)
			.map(|rec| self.geom_inst_pool.read(rec.slot))
	}
}
