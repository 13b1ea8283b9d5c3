//! Compiled passes and the resolution of their attachments.
//!
//! After compilation every pass waits for its attachments to be loaded by the texture cache. Each pass carries a
//! pending counter of `1 + attachment count`. Every loaded attachment removes one unit, the compiler removes the last
//! "declaration" unit once all passes have been declared. The pass that reaches zero hands its resolved image views to
//! its stages.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, MutexGuard,
};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    attachment::CompiledPasses,
    description::{StageType, SubpassAttachmentReference},
    ids::{AttachmentIdentifier, AttachmentIndex, FrameIndex, PassAttachmentReference, PassIndex, SubpassIndex},
    interfaces::{
        ClearValue, Device, RenderPassLayout, RenderSubpassAttachments, RenderTexture, StageHost, StageKey,
        SubpassAttachments, SubpassLayout,
    },
    range::{format_aspects, SubresourceRange},
    runtime::Shared,
    state::{SubresourceState, SubresourceStates},
};

///State an attachment written by an earlier pass is expected in when a render pass reads it.
#[derive(Clone, Debug)]
pub struct ExternalInputState {
    pub identifier: AttachmentIdentifier,
    ///Slot within the render pass.
    pub attachment: AttachmentIndex,
    pub range: SubresourceRange,
    pub state: SubresourceState,
}

///Image views of a set of attachment slots.
#[derive(Clone, Debug, Default)]
pub struct AttachmentBindings {
    ///`[frame][slot]`
    pub views: Vec<Vec<vk::ImageView>>,
    ///None until loaded, and for the render output.
    pub textures: Vec<Option<RenderTexture>>,
    ///Views created by us, destroyed on reset.
    pub mappings: Vec<vk::ImageView>,
    pub extents: Vec<vk::Extent2D>,
}

impl AttachmentBindings {
    pub fn new(frame_count: FrameIndex, slot_count: usize) -> Self {
        AttachmentBindings {
            views: vec![vec![vk::ImageView::null(); slot_count]; frame_count as usize],
            textures: vec![None; slot_count],
            mappings: vec![vk::ImageView::null(); slot_count],
            extents: vec![vk::Extent2D::default(); slot_count],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.views
            .iter()
            .all(|frame| frame.iter().all(|view| *view != vk::ImageView::null()))
    }

    pub fn frame_slices(&self, range: std::ops::Range<usize>) -> Vec<&[vk::ImageView]> {
        self.views.iter().map(|frame| &frame[range.clone()]).collect()
    }

    fn bind(&mut self, slot: usize, views: &[vk::ImageView], texture: Option<RenderTexture>, extent: vk::Extent2D) {
        for (frame, view) in self.views.iter_mut().zip(views.iter()) {
            frame[slot] = *view;
        }
        self.textures[slot] = texture;
        self.extents[slot] = extent;
    }

    pub fn destroy_mappings(&mut self, device: &dyn Device) {
        for mapping in self.mappings.iter_mut() {
            if *mapping != vk::ImageView::null() {
                device.destroy_image_mapping(*mapping);
                *mapping = vk::ImageView::null();
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderSubpassInfo {
    pub name: String,
    pub stages: Vec<StageKey>,
    ///Colors, depth, subpass inputs, then external inputs.
    pub references: Vec<vk::AttachmentReference>,
    pub color_count: usize,
    pub has_depth: bool,
    pub subpass_input_count: usize,
    pub external_input_count: usize,
    pub bindings: AttachmentBindings,
}

impl RenderSubpassInfo {
    fn depth_offset(&self) -> usize {
        self.color_count + usize::from(self.has_depth)
    }

    fn layout(&self) -> SubpassLayout<'_> {
        let depth_offset = self.depth_offset();
        SubpassLayout {
            color_attachments: &self.references[..self.color_count],
            depth_attachment: self.has_depth.then(|| self.references[self.color_count]),
            input_attachments: &self.references[depth_offset..],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassInfo {
    pub render_area: vk::Rect2D,
    ///One entry per color/depth/stencil slot.
    pub attachment_descriptions: Vec<vk::AttachmentDescription>,
    ///One entry per slot, including external inputs.
    pub attachment_ranges: Vec<SubresourceRange>,
    pub mapping_types: Vec<vk::ImageViewType>,
    pub clear_values: Vec<ClearValue>,
    pub subpasses: Vec<RenderSubpassInfo>,
    pub dependencies: Vec<vk::SubpassDependency>,
    pub external_inputs: Vec<ExternalInputState>,
    pub bindings: AttachmentBindings,
}

#[derive(Clone, Debug)]
pub struct GenericSubpassInfo {
    pub name: String,
    ///Outputs, in-outs, then inputs.
    pub references: Vec<SubpassAttachmentReference>,
    pub output_count: usize,
    pub input_output_count: usize,
    pub input_count: usize,
    ///One entry per reference.
    pub required_states: Vec<SubresourceStates>,
    pub bindings: AttachmentBindings,
}

impl GenericSubpassInfo {
    fn attachments(&self, subpass: SubpassIndex) -> SubpassAttachments<'_> {
        let outputs = 0..self.output_count;
        let input_outputs = self.output_count..self.output_count + self.input_output_count;
        let inputs = input_outputs.end..input_outputs.end + self.input_count;
        SubpassAttachments {
            subpass,
            output_views: self.bindings.frame_slices(outputs.clone()),
            input_output_views: self.bindings.frame_slices(input_outputs.clone()),
            input_views: self.bindings.frame_slices(inputs.clone()),
            output_extents: &self.bindings.extents[outputs],
            input_output_extents: &self.bindings.extents[input_outputs],
            input_extents: &self.bindings.extents[inputs],
            required_states: &self.required_states,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GenericPassInfo {
    pub subpasses: Vec<GenericSubpassInfo>,
}

#[derive(Clone, Debug)]
pub enum PassKind {
    Render(RenderPassInfo),
    Generic(GenericPassInfo),
    Compute(GenericPassInfo),
}

///Everything the compiler learned about a single pass.
#[derive(Clone, Debug)]
pub struct PassState {
    pub name: String,
    pub stage_type: StageType,
    ///Stage recording the pass's work. Optional for render passes.
    pub stage: Option<StageKey>,
    ///Created by the [StageHost] once the pass is declared.
    pub pass_stage: Option<StageKey>,
    pub cpu_dependencies: SmallVec<[PassIndex; 4]>,
    pub gpu_dependencies: SmallVec<[PassIndex; 4]>,
    ///Every attachment the pass references, in declaration order.
    pub attachments: Vec<AttachmentIdentifier>,
    ///Number of attachments that have to be loaded before the pass is ready.
    pub attachment_count: u32,
    pub kind: PassKind,
}

impl PassState {
    pub fn render_pass(&self) -> Option<&RenderPassInfo> {
        match &self.kind {
            PassKind::Render(info) => Some(info),
            _ => None,
        }
    }

    pub fn add_gpu_dependency(&mut self, pass: PassIndex) {
        if !self.gpu_dependencies.contains(&pass) {
            self.gpu_dependencies.push(pass);
        }
    }

    pub fn add_cpu_dependency(&mut self, pass: PassIndex) {
        if !self.cpu_dependencies.contains(&pass) {
            self.cpu_dependencies.push(pass);
        }
    }

    ///Stages that record into this pass, besides the pass stage itself.
    pub fn recording_stages(&self) -> SmallVec<[StageKey; 4]> {
        match &self.kind {
            PassKind::Render(info) => info
                .subpasses
                .iter()
                .flat_map(|subpass| subpass.stages.iter().copied())
                .collect(),
            PassKind::Generic(_) | PassKind::Compute(_) => self.stage.into_iter().collect(),
        }
    }

    ///Binds `views` to the pass local attachment `local`. Returns false if it was bound before.
    fn bind_attachment(
        &mut self,
        local: AttachmentIndex,
        views: &[vk::ImageView],
        texture: Option<RenderTexture>,
        extent: vk::Extent2D,
    ) -> bool {
        let local = local as usize;
        match &mut self.kind {
            PassKind::Render(info) => {
                if info.bindings.views.first().map(|frame| frame[local]) != Some(vk::ImageView::null()) {
                    return false;
                }
                info.bindings.bind(local, views, texture, extent);
                for subpass in info.subpasses.iter_mut() {
                    let color_count = subpass.color_count;
                    if let Some(position) = subpass
                        .references
                        .iter()
                        .position(|reference| reference.attachment as usize == local)
                    {
                        let texture = if position < color_count { texture } else { None };
                        subpass.bindings.bind(position, views, texture, extent);
                    }
                }
                true
            }
            PassKind::Generic(info) | PassKind::Compute(info) => {
                for subpass in info.subpasses.iter_mut() {
                    for (position, reference) in subpass.references.iter().enumerate() {
                        if reference.attachment as usize != local {
                            continue;
                        }
                        if subpass.bindings.views.first().map(|frame| frame[position])
                            != Some(vk::ImageView::null())
                        {
                            return false;
                        }
                        subpass.bindings.bind(position, views, texture, extent);
                    }
                }
                true
            }
        }
    }

    ///Binds the per frame views of the render output.
    pub(crate) fn bind_render_output(&mut self, local: AttachmentIndex, views: &[vk::ImageView], extent: vk::Extent2D) {
        let bound = self.bind_attachment(local, views, None, extent);
        debug_assert!(bound, "Render output bound twice");
    }

    ///Creates the views of a loaded render target. Returns false if the attachment was loaded before.
    pub(crate) fn on_attachment_loaded(
        &mut self,
        device: &dyn Device,
        frame_count: FrameIndex,
        local: AttachmentIndex,
        texture: RenderTexture,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent2D,
    ) -> bool {
        let slot = local as usize;
        match &mut self.kind {
            PassKind::Render(info) => {
                if info.bindings.mappings[slot] != vk::ImageView::null() {
                    return false;
                }
                let mapping = device.create_image_mapping(
                    &texture,
                    info.mapping_types[slot],
                    texture.format,
                    SubresourceRange::new(aspect, texture.mips, texture.layers),
                );
                info.bindings.mappings[slot] = mapping;
                if let Some(description) = info.attachment_descriptions.get_mut(slot) {
                    description.format = texture.format;
                    info.attachment_ranges[slot].aspect |= format_aspects(texture.format);
                }
            }
            PassKind::Generic(info) | PassKind::Compute(info) => {
                let mut created = false;
                for subpass in info.subpasses.iter_mut() {
                    for (position, reference) in subpass.references.iter().enumerate() {
                        if reference.attachment != local {
                            continue;
                        }
                        if subpass.bindings.mappings[position] != vk::ImageView::null() {
                            return false;
                        }
                        let mapping = device.create_image_mapping(
                            &texture,
                            reference.mapping_type,
                            texture.format,
                            SubresourceRange::new(aspect, reference.mips, reference.layers),
                        );
                        subpass.bindings.mappings[position] = mapping;
                        subpass
                            .bindings
                            .bind(position, &vec![mapping; frame_count as usize], Some(texture), extent);
                        created = true;
                    }
                }
                #[cfg(feature = "logging")]
                if !created {
                    log::warn!("Attachment {local} of pass {} is not referenced by any subpass", self.name);
                }
                #[cfg(not(feature = "logging"))]
                let _ = created;
                return true;
            }
        }

        //Render pass attachment, the same view is used by every frame.
        let PassKind::Render(info) = &self.kind else {
            return false;
        };
        let mapping = info.bindings.mappings[slot];
        self.bind_attachment(local, &vec![mapping; frame_count as usize], Some(texture), extent)
    }

    ///Hands every resolved attachment to the pass's stages. Returns the job that initializes the render pass, if the
    /// host needs one.
    pub(crate) fn on_attachments_resolved(&self, host: &dyn StageHost) -> Option<crate::interfaces::Job> {
        let Some(pass_stage) = self.pass_stage else {
            #[cfg(feature = "logging")]
            log::error!("Pass {} resolved without a pass stage", self.name);
            return None;
        };

        match &self.kind {
            PassKind::Render(info) => {
                assert!(
                    info.bindings.is_complete(),
                    "Render pass {} resolved with missing attachments",
                    self.name
                );

                let subpass_layouts = info
                    .subpasses
                    .iter()
                    .map(RenderSubpassInfo::layout)
                    .collect::<Vec<_>>();
                let layout = RenderPassLayout {
                    attachments: &info.attachment_descriptions,
                    subpasses: &subpass_layouts,
                    dependencies: &info.dependencies,
                    render_area: info.render_area,
                    external_inputs: &info.external_inputs,
                };
                let job = host.initialize_render_pass(pass_stage, &layout);

                let render_views = info.bindings.frame_slices(0..info.attachment_descriptions.len());
                host.on_pass_attachments_loaded(pass_stage, &render_views, info.render_area.extent);

                for (subpass_index, subpass) in info.subpasses.iter().enumerate() {
                    let depth_offset = subpass.depth_offset();
                    let inputs_end = depth_offset + subpass.subpass_input_count;
                    assert!(
                        subpass.references.len() - inputs_end == subpass.external_input_count,
                        "Subpass {} has unexpected trailing references",
                        subpass.name
                    );

                    let attachments = RenderSubpassAttachments {
                        subpass: subpass_index as SubpassIndex,
                        render_area: info.render_area.extent,
                        color_views: subpass.bindings.frame_slices(0..subpass.color_count),
                        depth_views: subpass
                            .bindings
                            .views
                            .iter()
                            .map(|frame| {
                                if subpass.has_depth {
                                    frame[subpass.color_count]
                                } else {
                                    vk::ImageView::null()
                                }
                            })
                            .collect(),
                        subpass_input_views: subpass.bindings.frame_slices(depth_offset..inputs_end),
                        external_input_views: subpass.bindings.frame_slices(inputs_end..subpass.references.len()),
                        external_input_extents: subpass.references[inputs_end..]
                            .iter()
                            .map(|reference| info.bindings.extents[reference.attachment as usize])
                            .collect(),
                        color_textures: &subpass.bindings.textures[..subpass.color_count],
                    };
                    for stage in subpass.stages.iter() {
                        host.on_render_subpass_attachments_loaded(*stage, &attachments);
                    }
                }

                job
            }
            PassKind::Generic(info) => {
                let stage = self.stage?;
                for (subpass_index, subpass) in info.subpasses.iter().enumerate() {
                    assert!(
                        subpass.bindings.is_complete(),
                        "Generic pass {} resolved with missing attachments",
                        self.name
                    );
                    host.on_generic_pass_attachments_loaded(stage, &subpass.attachments(subpass_index as SubpassIndex));
                }
                None
            }
            PassKind::Compute(info) => {
                let stage = self.stage?;
                for (subpass_index, subpass) in info.subpasses.iter().enumerate() {
                    assert!(
                        subpass.bindings.is_complete(),
                        "Compute pass {} resolved with missing attachments",
                        self.name
                    );
                    host.on_compute_subpass_attachments_loaded(stage, &subpass.attachments(subpass_index as SubpassIndex));
                }
                None
            }
        }
    }

    ///Destroys every image view this pass created.
    pub(crate) fn destroy_mappings(&mut self, device: &dyn Device) {
        match &mut self.kind {
            PassKind::Render(info) => {
                info.bindings.destroy_mappings(device);
                for subpass in info.subpasses.iter_mut() {
                    subpass.bindings.destroy_mappings(device);
                }
            }
            PassKind::Generic(info) | PassKind::Compute(info) => {
                for subpass in info.subpasses.iter_mut() {
                    subpass.bindings.destroy_mappings(device);
                }
            }
        }
    }
}

impl CompiledPasses for [PassState] {
    fn render_attachment(
        &mut self,
        reference: PassAttachmentReference,
    ) -> Option<(&mut vk::AttachmentDescription, SubresourceRange)> {
        let pass = self.get_mut(reference.pass as usize)?;
        let PassKind::Render(info) = &mut pass.kind else {
            return None;
        };
        let slot = reference.attachment as usize;
        let range = *info.attachment_ranges.get(slot)?;
        info.attachment_descriptions
            .get_mut(slot)
            .map(|description| (description, range))
    }
}

impl CompiledPasses for Vec<PassState> {
    fn render_attachment(
        &mut self,
        reference: PassAttachmentReference,
    ) -> Option<(&mut vk::AttachmentDescription, SubresourceRange)> {
        self.as_mut_slice().render_attachment(reference)
    }
}

///A compiled pass shared with the loading callbacks.
pub struct PassInfo {
    pending: AtomicU32,
    state: Mutex<PassState>,
}

impl PassInfo {
    pub fn new(state: PassState) -> Self {
        PassInfo {
            pending: AtomicU32::new(1 + state.attachment_count),
            state: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PassState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.state.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }

    ///Removes one pending unit of this pass, and with it one unit of the global latch. The last unit hands the
    /// attachments to the stages first.
    pub(crate) fn complete_one(self: &Arc<Self>, shared: &Arc<Shared>) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Pass completed more often than it has attachments");
        if previous != 1 {
            shared.latch.complete_one();
            return;
        }

        //Nothing writes the state anymore. The host works on a copy, so it may inspect the pass from its callbacks.
        let resolved = self.lock().clone();
        #[cfg(feature = "logging")]
        log::trace!("All attachments of pass {} resolved", resolved.name);
        let job = resolved.on_attachments_resolved(shared.ctx.host.as_ref());

        match job {
            Some(job) => {
                let latch_owner = shared.clone();
                shared.ctx.runner.queue(Box::new(move || {
                    job();
                    latch_owner.latch.complete_one();
                }));
            }
            None => {
                shared.latch.complete_one();
            }
        }
    }
}

impl std::fmt::Debug for PassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassInfo")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
