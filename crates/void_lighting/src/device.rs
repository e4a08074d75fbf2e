//! Graphics Device Seam
//!
//! The lighting passes talk to the GPU through [`GraphicsDevice`], a
//! command sink with a capability query. Backends translate each
//! [`DeviceCommand`] into API calls; [`CommandRecorder`] just keeps them, which
//! is what the tests assert on.
//!
//! Shadow map rendering is a separate collaborator behind [`ShadowRenderer`]:
//! the passes only request a render into an atlas rectangle that has already
//! been allocated.

use glam::{Mat4, Vec4};
use serde::{Deserialize, Serialize};

use crate::classify::MeshDetail;
use crate::light::{Light, ScissorRect};
use crate::shader::ShaderFlags;
use crate::texture::{RenderTarget, TextureId};

/// Optional hardware features, queried once per frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Depth bounds test
    pub depth_bounds: bool,
    /// Stencil can be sampled as a texture
    pub stencil_textures: bool,
    /// Per-target blend state
    pub independent_blend: bool,
    /// G-buffer lives in on-chip tile memory
    pub gmem: bool,
    /// Depth comparison samplers
    pub hw_pcf: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            depth_bounds: true,
            stencil_textures: true,
            independent_blend: true,
            gmem: false,
            hw_pcf: true,
        }
    }
}

/// Blend equation of the bound targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendMode {
    /// Overwrite
    #[default]
    Opaque,
    /// `src * 1 + dst * 1`
    Additive,
    /// `src * dst + dst * 0`
    Multiply,
    /// `src * a + dst * (1 - a)`
    AlphaBlend,
}

/// Face culling
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CullMode {
    /// Draw both faces
    None,
    /// Cull back faces
    #[default]
    Back,
    /// Cull front faces
    Front,
}

/// Depth or stencil comparison
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareFunc {
    /// Always passes
    #[default]
    Always,
    /// Passes on equality
    Equal,
    /// Passes when not equal
    NotEqual,
    /// Passes when less or equal
    LessEqual,
    /// Passes when greater or equal
    GreaterEqual,
}

/// Depth test state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthTest {
    /// No depth test
    #[default]
    Disabled,
    /// Test with a function, no writes
    Enabled(CompareFunc),
}

/// Stencil test reading the light or clip volume mask
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StencilTest {
    /// Comparison against the buffer
    pub func: CompareFunc,
    /// Reference value
    pub reference: u8,
    /// Bits compared
    pub read_mask: u8,
}

impl StencilTest {
    /// Pass where the stencil equals `reference`
    pub const fn equal(reference: u8) -> Self {
        Self {
            func: CompareFunc::Equal,
            reference,
            read_mask: 0xFF,
        }
    }
}

/// How a shape is culled into the stencil
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StencilCullMode {
    /// Write the reference where the shape covers geometry
    Replace,
    /// Test the current reference and decrement on depth fail
    DecrementOnZFail,
    /// Front and back faces in two passes, inside by parity
    NonConvex,
}

/// Geometry of a draw or stencil cull
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawShape {
    /// Single triangle covering the viewport
    FullScreenTriangle,
    /// Unit sphere proxy
    Sphere(MeshDetail),
    /// Unit cube [-1, 1]^3
    Box,
    /// Cube face frustum of a shadow caster
    ShadowFace(u8),
    /// Render mesh of a clip volume
    ClipVolumeMesh(u8),
}

/// Texture sampling state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplerKind {
    /// Nearest texel
    #[default]
    Point,
    /// Bilinear
    Linear,
    /// Trilinear with mips
    Trilinear,
    /// Linear depth comparison
    LinearCompare,
}

/// One state change or draw
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    /// Make targets current, remembering the previous set
    PushRenderTargets {
        /// Color targets
        color: Vec<RenderTarget>,
        /// Depth/stencil target
        depth: Option<RenderTarget>,
    },
    /// Restore the previous targets
    PopRenderTargets,
    /// Clear a color target
    ClearTarget {
        /// Target to clear
        target: RenderTarget,
        /// Clear color
        color: Vec4,
    },
    /// Copy one target into another of the same size
    CopyTarget {
        /// Source
        source: RenderTarget,
        /// Destination
        destination: RenderTarget,
    },
    /// Clear the stencil buffer with a direct clear
    ClearStencil {
        /// Value written
        value: u8,
    },
    /// Set the viewport
    SetViewport {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
    /// Enable a scissor rectangle or disable scissoring
    SetScissor(Option<ScissorRect>),
    /// Enable a depth bounds interval or disable the test
    SetDepthBounds(Option<(f32, f32)>),
    /// Enable a stencil test or disable it
    SetStencilTest(Option<StencilTest>),
    /// Culling and mirrored winding
    SetCull {
        /// Culled faces
        mode: CullMode,
        /// Winding flipped
        mirrored: bool,
    },
    /// Blend equation
    SetBlend(BlendMode),
    /// Depth test
    SetDepthTest(DepthTest),
    /// Select a technique and permutation
    BindTechnique {
        /// Technique name
        name: &'static str,
        /// Permutation bits
        flags: ShaderFlags,
    },
    /// Upload a named float4 array
    SetParam {
        /// Parameter name
        name: &'static str,
        /// Values
        values: Vec<Vec4>,
    },
    /// Bind a texture to a slot
    BindTexture {
        /// Slot index
        slot: u32,
        /// Texture
        texture: TextureId,
        /// Sampler
        sampler: SamplerKind,
    },
    /// Cull a shape into the stencil
    StencilCull {
        /// Shape
        shape: DrawShape,
        /// Unit shape to world transform
        transform: Mat4,
        /// Stencil reference
        reference: u8,
        /// Culling scheme
        mode: StencilCullMode,
    },
    /// Draw with the bound technique
    Draw {
        /// Shape
        shape: DrawShape,
        /// Unit shape to world transform
        transform: Mat4,
    },
    /// Run the bound compute technique over screen tiles
    Dispatch {
        /// Groups in x
        groups_x: u32,
        /// Groups in y
        groups_y: u32,
    },
}

/// Backend receiving the lighting command stream
pub trait GraphicsDevice {
    /// Optional features of this device
    fn caps(&self) -> DeviceCaps;

    /// Execute or record one command
    fn submit(&mut self, command: DeviceCommand);

    /// Bind a technique with its permutation
    fn bind_technique(&mut self, name: &'static str, flags: ShaderFlags) {
        self.submit(DeviceCommand::BindTechnique { name, flags });
    }

    /// Upload a named parameter
    fn set_param(&mut self, name: &'static str, values: &[Vec4]) {
        self.submit(DeviceCommand::SetParam {
            name,
            values: values.to_vec(),
        });
    }

    /// Bind a texture
    fn bind_texture(&mut self, slot: u32, texture: TextureId, sampler: SamplerKind) {
        self.submit(DeviceCommand::BindTexture { slot, texture, sampler });
    }

    /// Set or disable the scissor rectangle
    fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        self.submit(DeviceCommand::SetScissor(rect));
    }

    /// Set or disable the depth bounds test
    ///
    /// Ignored on devices without the feature.
    fn set_depth_bounds(&mut self, bounds: Option<(f32, f32)>) {
        if self.caps().depth_bounds {
            self.submit(DeviceCommand::SetDepthBounds(bounds));
        }
    }

    /// Set or disable the stencil test
    fn set_stencil_test(&mut self, test: Option<StencilTest>) {
        self.submit(DeviceCommand::SetStencilTest(test));
    }

    /// Culling state
    fn set_cull(&mut self, mode: CullMode, mirrored: bool) {
        self.submit(DeviceCommand::SetCull { mode, mirrored });
    }

    /// Blend state
    fn set_blend(&mut self, mode: BlendMode) {
        self.submit(DeviceCommand::SetBlend(mode));
    }

    /// Depth test state
    fn set_depth_test(&mut self, test: DepthTest) {
        self.submit(DeviceCommand::SetDepthTest(test));
    }

    /// Push color targets with an optional depth target
    fn push_targets(&mut self, color: &[RenderTarget], depth: Option<RenderTarget>) {
        self.submit(DeviceCommand::PushRenderTargets {
            color: color.to_vec(),
            depth,
        });
    }

    /// Pop the last pushed targets
    fn pop_targets(&mut self) {
        self.submit(DeviceCommand::PopRenderTargets);
    }

    /// Draw a shape with the bound technique
    fn draw(&mut self, shape: DrawShape, transform: Mat4) {
        self.submit(DeviceCommand::Draw { shape, transform });
    }

    /// Draw the full-screen triangle
    fn draw_full_screen(&mut self) {
        self.draw(DrawShape::FullScreenTriangle, Mat4::IDENTITY);
    }
}

/// Collaborator that renders scene depth into the shadow atlas
pub trait ShadowRenderer {
    /// Render the faces flagged in the frustum's generation mask
    ///
    /// `clear_pool` is set on the first request after the atlas content was
    /// invalidated.
    fn request_shadow_render(&mut self, light: &Light, frustum_index: usize, clear_pool: bool);
}

/// Shadow render request captured by [`CommandRecorder`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowRequest {
    /// Light entity id
    pub entity_id: u64,
    /// Index of the light in its frame array
    pub frustum_index: usize,
    /// Faces to render
    pub faces: u8,
    /// Atlas must be cleared first
    pub clear_pool: bool,
}

/// Device and shadow renderer that records everything it is given
#[derive(Clone, Debug, Default)]
pub struct CommandRecorder {
    caps: DeviceCaps,
    commands: Vec<DeviceCommand>,
    shadow_requests: Vec<ShadowRequest>,
}

impl CommandRecorder {
    /// Recorder with default capabilities
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder reporting the given capabilities
    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self {
            caps,
            ..Self::default()
        }
    }

    /// Recorded commands in submission order
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    /// Recorded shadow requests
    pub fn shadow_requests(&self) -> &[ShadowRequest] {
        &self.shadow_requests
    }

    /// Names of the techniques bound, in order
    pub fn techniques(&self) -> Vec<&'static str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::BindTechnique { name, .. } => Some(*name),
                _ => None,
            })
            .collect()
    }

    /// Permutations bound with a technique
    pub fn technique_flags(&self, technique: &str) -> Vec<ShaderFlags> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::BindTechnique { name, flags } if *name == technique => Some(*flags),
                _ => None,
            })
            .collect()
    }

    /// Number of commands matching a predicate
    pub fn count(&self, predicate: impl Fn(&DeviceCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }

    /// Last value uploaded for a parameter
    pub fn last_param(&self, param: &str) -> Option<&[Vec4]> {
        self.commands.iter().rev().find_map(|c| match c {
            DeviceCommand::SetParam { name, values } if *name == param => Some(values.as_slice()),
            _ => None,
        })
    }

    /// Drop everything recorded so far
    pub fn clear(&mut self) {
        self.commands.clear();
        self.shadow_requests.clear();
    }
}

impl GraphicsDevice for CommandRecorder {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn submit(&mut self, command: DeviceCommand) {
        self.commands.push(command);
    }
}

impl ShadowRenderer for CommandRecorder {
    fn request_shadow_render(&mut self, light: &Light, frustum_index: usize, clear_pool: bool) {
        self.shadow_requests.push(ShadowRequest {
            entity_id: light.entity_id,
            frustum_index,
            faces: light.shadow.as_ref().map_or(0, |f| f.shadow_gen_mask),
            clear_pool,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::technique;

    #[test]
    fn test_recorder_helpers() {
        let mut recorder = CommandRecorder::new();
        recorder.bind_technique(technique::AMBIENT_PASS, ShaderFlags::GLOBAL_CUBEMAP);
        recorder.set_param("g_Test", &[Vec4::ONE]);
        recorder.set_param("g_Test", &[Vec4::ZERO]);
        recorder.draw_full_screen();

        assert_eq!(recorder.techniques(), vec![technique::AMBIENT_PASS]);
        assert_eq!(recorder.technique_flags(technique::AMBIENT_PASS), vec![ShaderFlags::GLOBAL_CUBEMAP]);
        assert_eq!(recorder.last_param("g_Test"), Some(&[Vec4::ZERO][..]));
        assert_eq!(recorder.count(|c| matches!(c, DeviceCommand::Draw { .. })), 1);
    }

    #[test]
    fn test_depth_bounds_skipped_without_feature() {
        let mut recorder = CommandRecorder::with_caps(DeviceCaps {
            depth_bounds: false,
            ..Default::default()
        });
        recorder.set_depth_bounds(Some((0.0, 0.5)));
        assert!(recorder.commands().is_empty());
    }
}
