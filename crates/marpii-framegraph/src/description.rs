//! Per-frame declaration of passes and the attachments they use.
//!
//! Descriptions are created by the user for every [compile](crate::Framegraph::compile) call. The compiler only reads
//! them; nothing is retained once compilation has finished.

use ash::vk;
use bitflags::bitflags;

use crate::{
    ids::{AttachmentIdentifier, AttachmentIndex, INVALID_STAGE_INDEX, StageIndex},
    interfaces::StageKey,
    range::{ArrayRange, MipRange, SubresourceRange},
};

bitflags! {
    ///How a pass wants to treat the content of an attachment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AttachmentFlags: u8 {
        ///Clear to the declared clear value before the pass starts.
        const CLEAR = 1 << 0;
        ///Reads the content, if a prior pass stored some.
        const CAN_READ = 1 << 1;
        ///Reads the content, a prior pass *must* have written it.
        const MUST_READ = Self::CAN_READ.bits() | (1 << 2);
        ///Stores results if a later pass turns out to use them.
        const CAN_STORE = 1 << 3;
        ///Always stores results.
        const MUST_STORE = Self::CAN_STORE.bits() | (1 << 4);
    }
}

///Common part of every attachment declaration.
#[derive(Clone, Debug)]
pub struct AttachmentDescription {
    pub identifier: AttachmentIdentifier,
    pub extent: vk::Extent2D,
    pub range: SubresourceRange,
    pub flags: AttachmentFlags,
    pub mapping_type: vk::ImageViewType,
}

impl AttachmentDescription {
    ///Read only attachment that was written by a prior pass.
    pub fn input(identifier: AttachmentIdentifier, extent: vk::Extent2D, range: SubresourceRange) -> Self {
        AttachmentDescription {
            identifier,
            extent,
            range,
            flags: AttachmentFlags::MUST_READ,
            mapping_type: vk::ImageViewType::TYPE_2D,
        }
    }

    ///Write target of a generic or compute pass.
    pub fn output(
        identifier: AttachmentIdentifier,
        extent: vk::Extent2D,
        range: SubresourceRange,
        flags: AttachmentFlags,
    ) -> Self {
        AttachmentDescription {
            identifier,
            extent,
            range,
            flags: flags | AttachmentFlags::CAN_STORE,
            mapping_type: vk::ImageViewType::TYPE_2D,
        }
    }

    ///Read-modify-write target of a generic or compute pass.
    pub fn input_output(
        identifier: AttachmentIdentifier,
        extent: vk::Extent2D,
        range: SubresourceRange,
        flags: AttachmentFlags,
    ) -> Self {
        AttachmentDescription {
            identifier,
            extent,
            range,
            flags: flags | AttachmentFlags::MUST_READ | AttachmentFlags::CAN_STORE,
            mapping_type: vk::ImageViewType::TYPE_2D,
        }
    }

    pub fn with_mapping_type(mut self, mapping_type: vk::ImageViewType) -> Self {
        self.mapping_type = mapping_type;
        self
    }
}

///Render pass attachment that can carry a clear value.
#[derive(Clone, Debug)]
pub struct ClearableAttachment<C> {
    pub attachment: AttachmentDescription,
    pub clear_value: Option<C>,
}

pub type ColorAttachmentDescription = ClearableAttachment<[f32; 4]>;
pub type DepthAttachmentDescription = ClearableAttachment<f32>;
pub type StencilAttachmentDescription = ClearableAttachment<u32>;

impl<C> ClearableAttachment<C> {
    fn with_aspect(identifier: AttachmentIdentifier, extent: vk::Extent2D, aspect: vk::ImageAspectFlags) -> Self {
        ClearableAttachment {
            attachment: AttachmentDescription {
                identifier,
                extent,
                range: SubresourceRange::new(aspect, MipRange::default(), ArrayRange::default()),
                flags: AttachmentFlags::CAN_STORE,
                mapping_type: vk::ImageViewType::TYPE_2D,
            },
            clear_value: None,
        }
    }

    ///Replaces the flags. A set clear value keeps [AttachmentFlags::CLEAR] set.
    pub fn with_flags(mut self, flags: AttachmentFlags) -> Self {
        self.attachment.flags = flags;
        if self.clear_value.is_some() {
            self.attachment.flags |= AttachmentFlags::CLEAR;
        }
        self
    }

    pub fn with_clear(mut self, value: C) -> Self {
        self.clear_value = Some(value);
        self.attachment.flags |= AttachmentFlags::CLEAR;
        self
    }

    pub fn with_mips(mut self, mips: MipRange) -> Self {
        self.attachment.range.mips = mips;
        self
    }

    pub fn with_layers(mut self, layers: ArrayRange) -> Self {
        self.attachment.range.layers = layers;
        self
    }

    pub fn with_mapping_type(mut self, mapping_type: vk::ImageViewType) -> Self {
        self.attachment.mapping_type = mapping_type;
        self
    }
}

impl ColorAttachmentDescription {
    pub fn new(identifier: AttachmentIdentifier, extent: vk::Extent2D) -> Self {
        Self::with_aspect(identifier, extent, vk::ImageAspectFlags::COLOR)
    }
}

impl DepthAttachmentDescription {
    pub fn new(identifier: AttachmentIdentifier, extent: vk::Extent2D) -> Self {
        Self::with_aspect(identifier, extent, vk::ImageAspectFlags::DEPTH)
    }
}

impl StencilAttachmentDescription {
    pub fn new(identifier: AttachmentIdentifier, extent: vk::Extent2D) -> Self {
        Self::with_aspect(identifier, extent, vk::ImageAspectFlags::STENCIL)
    }
}

///Shared by implicit and explicit render passes.
#[derive(Clone, Debug, Default)]
pub struct RenderTargets {
    pub render_area: vk::Rect2D,
    pub color_attachments: Vec<ColorAttachmentDescription>,
    pub depth_attachment: Option<DepthAttachmentDescription>,
    pub stencil_attachment: Option<StencilAttachmentDescription>,
}

impl RenderTargets {
    ///True if depth and stencil live in the same image.
    pub fn is_depth_stencil_unified(&self) -> bool {
        match (&self.depth_attachment, &self.stencil_attachment) {
            (Some(depth), Some(stencil)) => depth.attachment.identifier == stencil.attachment.identifier,
            _ => false,
        }
    }

    ///Number of render pass attachment slots used by depth and stencil.
    pub fn depth_stencil_count(&self) -> usize {
        match (&self.depth_attachment, &self.stencil_attachment) {
            (Some(_), Some(_)) if self.is_depth_stencil_unified() => 1,
            (Some(_), Some(_)) => 2,
            (Some(_), None) | (None, Some(_)) => 1,
            (None, None) => 0,
        }
    }

    pub fn has_depth_or_stencil(&self) -> bool {
        self.depth_attachment.is_some() || self.stencil_attachment.is_some()
    }
}

///Render pass with a single, implicitly created subpass.
#[derive(Clone, Debug, Default)]
pub struct RenderPassDescription {
    pub targets: RenderTargets,
    pub input_attachments: Vec<AttachmentDescription>,
}

///Subpass of an [ExplicitRenderPassDescription]. Indices point into the pass's attachment slots
/// (colors, then depth/stencil, then external inputs).
#[derive(Clone, Debug, Default)]
pub struct RenderSubpassDescription {
    pub name: String,
    ///Stages recording into this subpass. Falls back to the stage of the [StageDescription] if empty.
    pub stages: Vec<StageKey>,
    pub color_attachment_indices: Vec<AttachmentIndex>,
    pub depth_attachment_index: Option<AttachmentIndex>,
    pub stencil_attachment_index: Option<AttachmentIndex>,
    ///Attachments written by a previous subpass of the same render pass.
    pub subpass_input_attachment_indices: Vec<AttachmentIndex>,
    ///Attachments written by a previous pass.
    pub external_input_attachment_indices: Vec<AttachmentIndex>,
}

#[derive(Clone, Debug, Default)]
pub struct ExplicitRenderPassDescription {
    pub targets: RenderTargets,
    pub external_input_attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<RenderSubpassDescription>,
}

///Reference of a generic or compute subpass onto one of its pass's attachments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubpassAttachmentReference {
    pub attachment: AttachmentIndex,
    pub mips: MipRange,
    pub layers: ArrayRange,
    pub mapping_type: vk::ImageViewType,
}

impl SubpassAttachmentReference {
    pub fn new(attachment: AttachmentIndex) -> Self {
        SubpassAttachmentReference {
            attachment,
            mips: MipRange::default(),
            layers: ArrayRange::default(),
            mapping_type: vk::ImageViewType::TYPE_2D,
        }
    }

    pub fn with_mips(mut self, mips: MipRange) -> Self {
        self.mips = mips;
        self
    }

    pub fn with_layers(mut self, layers: ArrayRange) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_mapping_type(mut self, mapping_type: vk::ImageViewType) -> Self {
        self.mapping_type = mapping_type;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct GenericSubpassDescription {
    pub name: String,
    pub output_attachments: Vec<SubpassAttachmentReference>,
    pub input_output_attachments: Vec<SubpassAttachmentReference>,
    pub input_attachments: Vec<SubpassAttachmentReference>,
}

pub type ComputeSubpassDescription = GenericSubpassDescription;

///Catch-all pass. The framegraph only tracks its attachments, the stage records whatever it wants.
#[derive(Clone, Debug, Default)]
pub struct GenericPassDescription {
    pub output_attachments: Vec<AttachmentDescription>,
    pub input_output_attachments: Vec<AttachmentDescription>,
    pub input_attachments: Vec<AttachmentDescription>,
    pub subpass: GenericSubpassDescription,
}

#[derive(Clone, Debug, Default)]
pub struct ComputePassDescription {
    pub output_attachments: Vec<AttachmentDescription>,
    pub input_output_attachments: Vec<AttachmentDescription>,
    pub input_attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<ComputeSubpassDescription>,
}

///Resolves a pass local attachment index (outputs, then in-outs, then inputs).
fn local_attachment<'a>(
    outputs: &'a [AttachmentDescription],
    input_outputs: &'a [AttachmentDescription],
    inputs: &'a [AttachmentDescription],
    index: AttachmentIndex,
) -> &'a AttachmentDescription {
    let mut index = index as usize;
    if index < outputs.len() {
        return &outputs[index];
    }
    index -= outputs.len();
    if index < input_outputs.len() {
        return &input_outputs[index];
    }
    index -= input_outputs.len();
    assert!(index < inputs.len(), "Attachment index out of bounds");
    &inputs[index]
}

impl GenericPassDescription {
    pub fn attachment_description(&self, index: AttachmentIndex) -> &AttachmentDescription {
        local_attachment(
            &self.output_attachments,
            &self.input_output_attachments,
            &self.input_attachments,
            index,
        )
    }

    pub fn attachment_count(&self) -> usize {
        self.output_attachments.len() + self.input_output_attachments.len() + self.input_attachments.len()
    }
}

impl ComputePassDescription {
    pub fn attachment_description(&self, index: AttachmentIndex) -> &AttachmentDescription {
        local_attachment(
            &self.output_attachments,
            &self.input_output_attachments,
            &self.input_attachments,
            index,
        )
    }

    pub fn attachment_count(&self) -> usize {
        self.output_attachments.len() + self.input_output_attachments.len() + self.input_attachments.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageType {
    ///Rendered within a render pass, subpasses are set up automatically.
    RenderPass,
    ///Rendered within a render pass with user declared subpasses.
    ExplicitRenderPass,
    ///Can do anything. Bypasses most of the framegraph's optimizations.
    Generic,
    Compute,
}

#[derive(Clone, Debug)]
pub enum PassDescription {
    RenderPass(RenderPassDescription),
    ExplicitRenderPass(ExplicitRenderPassDescription),
    Generic(GenericPassDescription),
    Compute(ComputePassDescription),
}

impl PassDescription {
    pub fn stage_type(&self) -> StageType {
        match self {
            PassDescription::RenderPass(_) => StageType::RenderPass,
            PassDescription::ExplicitRenderPass(_) => StageType::ExplicitRenderPass,
            PassDescription::Generic(_) => StageType::Generic,
            PassDescription::Compute(_) => StageType::Compute,
        }
    }
}

///One entry of the ordered list handed to [compile](crate::Framegraph::compile).
#[derive(Clone, Debug)]
pub struct StageDescription {
    pub name: String,
    ///Stage that must execute before this one, regardless of attachment usage.
    pub previous_stage: StageIndex,
    ///The stage that records work for this pass.
    pub stage: Option<StageKey>,
    pub pass: PassDescription,
}

impl StageDescription {
    pub fn render_pass(name: impl Into<String>, stage: Option<StageKey>, desc: RenderPassDescription) -> Self {
        StageDescription {
            name: name.into(),
            previous_stage: INVALID_STAGE_INDEX,
            stage,
            pass: PassDescription::RenderPass(desc),
        }
    }

    pub fn explicit_render_pass(
        name: impl Into<String>,
        stage: Option<StageKey>,
        desc: ExplicitRenderPassDescription,
    ) -> Self {
        StageDescription {
            name: name.into(),
            previous_stage: INVALID_STAGE_INDEX,
            stage,
            pass: PassDescription::ExplicitRenderPass(desc),
        }
    }

    pub fn generic(name: impl Into<String>, stage: StageKey, desc: GenericPassDescription) -> Self {
        StageDescription {
            name: name.into(),
            previous_stage: INVALID_STAGE_INDEX,
            stage: Some(stage),
            pass: PassDescription::Generic(desc),
        }
    }

    pub fn compute(name: impl Into<String>, stage: StageKey, desc: ComputePassDescription) -> Self {
        StageDescription {
            name: name.into(),
            previous_stage: INVALID_STAGE_INDEX,
            stage: Some(stage),
            pass: PassDescription::Compute(desc),
        }
    }

    ///Forces execution after the stage at `index`.
    pub fn after(mut self, index: StageIndex) -> Self {
        self.previous_stage = index;
        self
    }

    pub fn stage_type(&self) -> StageType {
        self.pass.stage_type()
    }
}
