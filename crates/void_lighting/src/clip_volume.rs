//! Clip Volumes
//!
//! Indoor regions (rooms, portals, vis areas) are stamped into the stencil
//! buffer so the composite can tell which volume a pixel belongs to. Each
//! volume gets a small id in registration order; id 0 is the outdoors.
//!
//! The shader reads a flat table indexed by `stencil id + 1` holding the
//! volume's flags and the ids of the volumes it blends into. The first two
//! entries are reserved outdoor entries.
//!
//! # Stencil layout
//!
//! Volume ids are written inverted and masked so they never touch
//! [`STENCIL_RESERVED_BIT`](crate::shadow::STENCIL_RESERVED_BIT) or
//! [`STENCIL_INSIDE_CLIP_VOLUME_BIT`]; light masks use the range above
//! `STENCIL_INSIDE_CLIP_VOLUME_BIT + volume count`.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use serde::{Deserialize, Serialize};

use crate::camera::CameraView;
use crate::device::{
    BlendMode, CullMode, DepthTest, DeviceCommand, DrawShape, GraphicsDevice, SamplerKind, StencilCullMode,
    StencilTest,
};
use crate::error::{LightingError, Result};
use crate::shader::{param, technique, ShaderFlags};
use crate::shadow::{clip_volume_stencil_value, STENCIL_INSIDE_CLIP_VOLUME_BIT};
use crate::texture::{RenderContext, RenderTarget};

/// Entries of the clip volume parameter table
pub const MAX_DEFERRED_CLIP_VOLUMES: usize = 64;

/// Reserved outdoor entries at the start of the table
pub const VIS_AREAS_OUTDOOR_STENCIL_OFFSET: usize = 2;

/// Largest stencil id that still gets a table entry
pub const MAX_CLIP_VOLUME_ID: u8 = (MAX_DEFERRED_CLIP_VOLUMES - VIS_AREAS_OUTDOOR_STENCIL_OFFSET) as u8;

/// Clear value of the resolved stencil when volumes are drawn into it directly
const RESOLVED_STENCIL_CLEAR: Vec4 = Vec4::new(1.0 / 255.0, 0.0, 0.0, 0.0);

/// Clip volume behaviour flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClipVolumeFlags(u32);

impl ClipVolumeFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Opens to the outdoors
    pub const CONNECTED_TO_OUTDOOR: Self = Self(1 << 0);
    /// Excluded from global illumination
    pub const IGNORE_GI: Self = Self(1 << 1);
    /// Receives sun light
    pub const AFFECTED_BY_SUN: Self = Self(1 << 2);
    /// Blends into neighbouring volumes across portal planes
    pub const BLEND: Self = Self(1 << 3);
    /// Engine vis area rather than an authored clip volume
    pub const IS_VIS_AREA: Self = Self(1 << 4);
    /// Excluded from outdoor ambient occlusion
    pub const IGNORE_OUTDOOR_AO: Self = Self(1 << 5);

    /// Create flags from raw bits
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if all specified flags are set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Insert flags
    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl core::ops::BitOr for ClipVolumeFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque handle of a clip volume's render mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshHandle(pub u64);

/// Portal blending of a volume into up to two neighbours
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipVolumeBlendInfo {
    /// World-space blend planes `(normal, d)`
    pub planes: [Vec4; 2],
    /// Stencil ids blended into, `None` for the outdoors
    pub targets: [Option<u8>; 2],
}

/// A registered clip volume
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipVolumeRecord {
    /// Stencil id, 1-based
    pub stencil_ref: u8,
    /// Behaviour flags
    pub flags: ClipVolumeFlags,
    /// World bounding box minimum
    pub bounds_min: glam::Vec3,
    /// World bounding box maximum
    pub bounds_max: glam::Vec3,
    /// Render mesh stamped into the stencil
    pub mesh: Option<MeshHandle>,
    /// Mesh to world transform
    pub world: Mat4,
    /// Blend planes
    pub blend_planes: [Vec4; 2],
    /// Blend target ids, 0 for the outdoors
    pub blend_ids: [u8; 2],
}

impl ClipVolumeRecord {
    /// Volume description before registration
    pub fn new(flags: ClipVolumeFlags, bounds_min: glam::Vec3, bounds_max: glam::Vec3) -> Self {
        Self {
            stencil_ref: 0,
            flags,
            bounds_min,
            bounds_max,
            mesh: None,
            world: Mat4::IDENTITY,
            blend_planes: [Vec4::ZERO; 2],
            blend_ids: [0; 2],
        }
    }

    /// Attach a render mesh
    pub fn with_mesh(mut self, mesh: MeshHandle, world: Mat4) -> Self {
        self.mesh = Some(mesh);
        self.world = world;
        self
    }

    /// Whether the id fits the stencil and the parameter table
    pub fn is_addressable(&self) -> bool {
        self.stencil_ref <= MAX_CLIP_VOLUME_ID
    }

    /// Table word: blend ids + 1 in the top bytes, flags below
    pub fn packed_data(&self) -> u32 {
        ((self.blend_ids[1] as u32 + 1) << 24) | ((self.blend_ids[0] as u32 + 1) << 16) | self.flags.bits()
    }
}

/// Shader-facing table entry; the packed word travels in `x`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClipVolumeParams {
    /// Packed flags and blend ids
    pub data: u32,
    /// Unused lanes
    pub reserved: [u32; 3],
}

impl ClipVolumeParams {
    /// Entry holding a packed word
    pub const fn new(data: u32) -> Self {
        Self { data, reserved: [0; 3] }
    }

    /// Entry as the float4 the shader parameter carries
    pub fn to_vec4(self) -> Vec4 {
        Vec4::new(f32::from_bits(self.data), 0.0, 0.0, 0.0)
    }
}

/// Parameter table ready for upload
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClipVolumeTable {
    /// Entries indexed by stencil id + 1
    pub params: Vec<ClipVolumeParams>,
    /// Any registered volume, or none at all, is open to the outdoors
    pub outdoor_visible: bool,
    /// Registered volumes
    pub volume_count: usize,
}

impl ClipVolumeTable {
    /// Entries as float4s
    pub fn to_vec4s(&self) -> Vec<Vec4> {
        self.params.iter().map(|p| p.to_vec4()).collect()
    }

    /// Raw bytes of the table
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.params)
    }

    /// Upload the table if any volume exists
    pub fn upload<D: GraphicsDevice + ?Sized>(&self, device: &mut D) {
        if self.volume_count > 0 {
            device.set_param(param::CLIP_VOLUME_PARAMS, &self.to_vec4s());
        }
    }
}

/// Clip volumes of one frame key
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClipVolumeSet {
    volumes: Vec<ClipVolumeRecord>,
    #[serde(skip)]
    warned: bool,
}

impl ClipVolumeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a volume under the next stencil id
    ///
    /// Ids past [`MAX_CLIP_VOLUME_ID`] are still recorded but never stamped,
    /// so their pixels read as outdoors; the caller gets an error for them.
    pub fn add(&mut self, mut volume: ClipVolumeRecord) -> Result<u8> {
        let id = self.volumes.len() + 1;
        if id > MAX_CLIP_VOLUME_ID as usize {
            if !self.warned {
                self.warned = true;
                log::warn!(
                    "Clip volume budget exceeded: volumes past {} are treated as outdoors",
                    MAX_CLIP_VOLUME_ID
                );
            }
            volume.stencil_ref = id.min(u8::MAX as usize) as u8;
            self.volumes.push(volume);
            return Err(LightingError::ClipVolumeBudgetExceeded {
                max: MAX_CLIP_VOLUME_ID as usize,
            });
        }

        volume.stencil_ref = id as u8;
        self.volumes.push(volume);
        Ok(id as u8)
    }

    /// Attach portal blend planes to a registered volume
    pub fn set_blend_data(&mut self, stencil_ref: u8, blend: &ClipVolumeBlendInfo) -> Result<()> {
        let volume = stencil_ref
            .checked_sub(1)
            .and_then(|index| self.volumes.get_mut(index as usize))
            .filter(|v| v.stencil_ref == stencil_ref)
            .ok_or(LightingError::UnknownClipVolume(stencil_ref))?;

        volume.blend_planes = blend.planes;
        volume.blend_ids = [blend.targets[0].unwrap_or(0), blend.targets[1].unwrap_or(0)];
        volume.flags.insert(ClipVolumeFlags::BLEND);
        Ok(())
    }

    /// Drop every volume; ids restart at 1
    pub fn reset(&mut self) {
        self.volumes.clear();
        self.warned = false;
    }

    /// Registered volumes in id order
    pub fn volumes(&self) -> &[ClipVolumeRecord] {
        &self.volumes
    }

    /// Number of registered volumes
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// No volume registered
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Volumes past the addressable budget
    pub fn dropped(&self) -> usize {
        self.volumes.iter().filter(|v| !v.is_addressable()).count()
    }

    /// Build the shader table and the outdoor visibility
    pub fn pack_params(&self) -> ClipVolumeTable {
        let outdoor = ClipVolumeFlags::CONNECTED_TO_OUTDOOR | ClipVolumeFlags::AFFECTED_BY_SUN;
        let len = (self.volumes.len() + VIS_AREAS_OUTDOOR_STENCIL_OFFSET).min(MAX_DEFERRED_CLIP_VOLUMES);

        let mut params = vec![ClipVolumeParams::default(); len];
        for entry in params.iter_mut().take(VIS_AREAS_OUTDOOR_STENCIL_OFFSET) {
            *entry = ClipVolumeParams::new(outdoor.bits());
        }

        let mut outdoor_visible = self.volumes.is_empty();
        for volume in self.volumes.iter().filter(|v| v.is_addressable()) {
            params[volume.stencil_ref as usize + 1] = ClipVolumeParams::new(volume.packed_data());
            outdoor_visible |= volume.flags.contains(ClipVolumeFlags::CONNECTED_TO_OUTDOOR);
        }

        ClipVolumeTable {
            params,
            outdoor_visible,
            volume_count: self.volumes.len(),
        }
    }

    /// Stamp volume meshes into the stencil, last registered first
    pub fn render_to_stencil<D: GraphicsDevice + ?Sized>(&self, device: &mut D, vis_areas: bool) {
        for volume in self.volumes.iter().rev() {
            let Some(mesh) = volume.mesh else { continue };
            if !volume.is_addressable() || (volume.flags.contains(ClipVolumeFlags::IS_VIS_AREA) && !vis_areas) {
                continue;
            }
            device.submit(DeviceCommand::StencilCull {
                shape: DrawShape::ClipVolumeMesh(volume.stencil_ref),
                transform: volume.world,
                reference: clip_volume_stencil_value(volume.stencil_ref),
                mode: StencilCullMode::NonConvex,
            });
            log::trace!("Clip volume {} (mesh {:?}) stamped", volume.stencil_ref, mesh);
        }
    }

    /// Write portal blend weights for every blending volume
    pub fn render_portal_blend<D: GraphicsDevice + ?Sized>(
        &self,
        device: &mut D,
        targets: &RenderContext,
        camera: &CameraView,
        vis_areas: bool,
    ) {
        // World planes to clip space
        let plane_to_clip = camera.view_projection().inverse().transpose();

        device.set_depth_test(DepthTest::Disabled);
        device.bind_technique(technique::PORTAL_BLEND, ShaderFlags::NONE);
        if let Some(depth) = targets.texture(RenderTarget::ZTarget) {
            device.bind_texture(3, depth, SamplerKind::Point);
        }

        for volume in self.volumes.iter().rev() {
            if !volume.is_addressable() || !volume.flags.contains(ClipVolumeFlags::BLEND) {
                continue;
            }
            let planes = volume.blend_planes.map(|plane| plane_to_clip * plane);
            device.set_param(param::PORTAL_PLANES, &planes);
            device.set_param(param::PORTAL_REF, &[Vec4::new(volume.stencil_ref as f32, 0.0, 0.0, 0.0)]);

            let reference = STENCIL_INSIDE_CLIP_VOLUME_BIT + volume.stencil_ref as u32 + 1;
            device.set_stencil_test(Some(StencilTest::equal(reference as u8)));

            match volume.mesh {
                Some(_) if vis_areas => {
                    device.set_cull(CullMode::Front, false);
                    device.draw(DrawShape::ClipVolumeMesh(volume.stencil_ref), volume.world);
                }
                _ => {
                    device.set_cull(CullMode::Back, false);
                    device.draw_full_screen();
                }
            }
        }
        device.set_stencil_test(None);
    }
}

/// Options of the clip volume stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClipVolumeOptions {
    /// Stamp vis areas as well as authored volumes
    pub vis_areas: bool,
    /// Portal blend weights
    pub portal_blend: bool,
    /// Volumetric fog stencil
    pub volumetric_fog: bool,
}

/// Result of the clip volume stage
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparedClipVolumes {
    /// Parameter table
    pub table: ClipVolumeTable,
    /// First stencil reference available to light masks
    pub light_stencil_base: u32,
}

/// Build the parameter table, stamp the stencil and resolve it
///
/// With stencil textures the stamped stencil is copied into
/// [`RenderTarget::ResolvedStencil`] by a full-screen pass. Without them the
/// volumes are drawn straight into that target instead. On the tile memory
/// path the resolve writes into the shared linear depth target.
pub fn prepare_clip_volume_data<D: GraphicsDevice + ?Sized>(
    volumes: &ClipVolumeSet,
    device: &mut D,
    targets: &RenderContext,
    camera: &CameraView,
    options: ClipVolumeOptions,
) -> PreparedClipVolumes {
    let caps = device.caps();
    let table = volumes.pack_params();

    if !volumes.is_empty() {
        if !targets.gmem {
            if caps.stencil_textures {
                device.push_targets(&[], Some(RenderTarget::DepthStencil));
            } else {
                device.push_targets(&[RenderTarget::ResolvedStencil], Some(RenderTarget::DepthStencil));
                device.submit(DeviceCommand::ClearTarget {
                    target: RenderTarget::ResolvedStencil,
                    color: RESOLVED_STENCIL_CLEAR,
                });
            }
            device.submit(DeviceCommand::SetViewport {
                width: targets.width,
                height: targets.height,
            });
        }

        volumes.render_to_stencil(device, options.vis_areas);

        if !targets.gmem {
            device.pop_targets();

            if options.portal_blend && volumes.volumes().iter().any(|v| v.flags.contains(ClipVolumeFlags::BLEND)) {
                device.push_targets(&[RenderTarget::ResolvedStencil], Some(RenderTarget::DepthStencil));
                volumes.render_portal_blend(device, targets, camera, options.vis_areas);
                device.pop_targets();
            }

            if options.volumetric_fog {
                device.bind_technique(technique::VOLUMETRIC_FOG_STENCIL, ShaderFlags::NONE);
                for volume in volumes.volumes().iter().filter(|v| v.is_addressable() && v.mesh.is_some()) {
                    device.draw(DrawShape::ClipVolumeMesh(volume.stencil_ref), volume.world);
                }
            }
        }
    }

    resolve_stencil(device, targets, caps.stencil_textures);

    PreparedClipVolumes {
        light_stencil_base: STENCIL_INSIDE_CLIP_VOLUME_BIT + volumes.len().min(MAX_CLIP_VOLUME_ID as usize) as u32 + 1,
        table,
    }
}

fn resolve_stencil<D: GraphicsDevice + ?Sized>(device: &mut D, targets: &RenderContext, stencil_textures: bool) {
    if targets.gmem {
        device.set_depth_test(DepthTest::Disabled);
        device.bind_technique(technique::RESOLVE_STENCIL, ShaderFlags::GMEM);
        device.draw_full_screen();
        return;
    }
    if !stencil_textures {
        return;
    }

    device.push_targets(&[RenderTarget::ResolvedStencil], None);
    device.set_depth_test(DepthTest::Disabled);
    device.set_blend(BlendMode::Opaque);
    device.bind_technique(technique::RESOLVE_STENCIL, ShaderFlags::NONE);
    if let Some(stencil) = targets.texture(RenderTarget::DepthStencil) {
        device.bind_texture(4, stencil, SamplerKind::Point);
    }
    device.draw_full_screen();
    device.pop_targets();
}
