//! Resolves pass attachments through the [TextureCache](crate::TextureCache).
//!
//! Render targets are requested once compilation has declared every pass. Each loaded target is moved into the layout
//! its first user expects, then bound to the pass that requested it.

use std::sync::Arc;

use ash::vk;

use crate::{
    attachment::AttachmentTable,
    description::AttachmentDescription,
    flags::{supported_access_for_layout, supported_stages_for_layout},
    ids::{AttachmentIdentifier, AttachmentIndex, IdentifierMask, TextureIdentifier},
    interfaces::{Job, JobBatch, RenderTargetCallback, RenderTexture},
    pass::PassInfo,
    range::{ArrayRange, MipRange, SubresourceRange},
    runtime::Shared,
    state::Bucket,
};

///One attachment a pass waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LoadRequest {
    ///Slot within the pass.
    pub local: AttachmentIndex,
    pub identifier: AttachmentIdentifier,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent2D,
    pub mips: MipRange,
    pub layers: ArrayRange,
}

impl LoadRequest {
    pub fn new(local: usize, description: &AttachmentDescription, aspect: vk::ImageAspectFlags) -> Self {
        LoadRequest {
            local: local as AttachmentIndex,
            identifier: description.identifier,
            aspect,
            extent: description.extent,
            mips: description.range.mips,
            layers: description.range.layers,
        }
    }

    fn range(&self) -> SubresourceRange {
        SubresourceRange::new(self.aspect, self.mips, self.layers)
    }
}

///Starts resolving `request`. The render output is bound right away, everything else goes through the texture cache.
pub(crate) fn queue_attachment_load(
    shared: &Arc<Shared>,
    pass: &Arc<PassInfo>,
    request: LoadRequest,
    batch: &mut JobBatch,
    requested_render_targets: &mut IdentifierMask<TextureIdentifier>,
) {
    let render_output = &shared.ctx.render_output;
    if request.identifier == render_output.attachment_identifier() {
        let views = render_output.image_views();
        pass.lock()
            .bind_render_output(request.local, &views, render_output.extent());
        pass.complete_one(shared);
        return;
    }

    let cache = &shared.ctx.texture_cache;
    let texture = cache.find_or_register_render_target_template(request.identifier);
    requested_render_targets.set(texture);

    let callback_shared = shared.clone();
    let callback_pass = pass.clone();
    let on_loaded: RenderTargetCallback = Box::new(move |texture| {
        on_render_target_loaded(&callback_shared, &callback_pass, request, texture)
    });

    if let Some(job) = cache.get_or_load_render_target(
        texture,
        request.identifier,
        vk::SampleCountFlags::TYPE_1,
        request.extent,
        request.mips,
        request.layers,
        on_loaded,
    ) {
        batch.queue_after_start(job);
    }
}

///Layout a loaded target has to be moved into before its first user runs. None if no transition is needed, or if
/// the subresources of `range` enter the frame in different layouts.
fn entry_layout(
    attachments: &AttachmentTable,
    identifier: AttachmentIdentifier,
    range: SubresourceRange,
) -> Option<vk::ImageLayout> {
    let info = attachments.get(identifier)?;
    let Some(initial) = info
        .states
        .get_uniform_subresource_state(range, Bucket::Initial)
        .or_else(|| info.states.get_uniform_subresource_state(range, Bucket::Current))
    else {
        #[cfg(feature = "logging")]
        log::warn!("Attachment {identifier:?} has no uniform initial state over {range:?}, skipping its transition");
        return None;
    };
    (initial.layout != vk::ImageLayout::UNDEFINED).then_some(initial.layout)
}

fn on_render_target_loaded(shared: &Arc<Shared>, pass: &Arc<PassInfo>, request: LoadRequest, texture: RenderTexture) {
    let range = request.range();
    let layout = entry_layout(&shared.attachments(), request.identifier, range);
    let Some(layout) = layout.filter(|_| texture.is_valid()) else {
        on_attachment_loaded(shared, pass, request, texture);
        return;
    };

    #[cfg(feature = "logging")]
    log::trace!(
        "Transitioning render target {:?} into {:?}",
        texture.identifier,
        layout
    );

    let finish_shared = shared.clone();
    let finish_pass = pass.clone();
    let finish: Job = Box::new(move || on_attachment_loaded(&finish_shared, &finish_pass, request, texture));
    let runner = shared.ctx.runner.clone();
    let on_finished: Job = Box::new(move || {
        if runner.is_worker_thread() {
            finish();
        } else {
            runner.queue(finish);
        }
    });

    shared.ctx.device.submit_layout_transition(
        &texture,
        supported_stages_for_layout(layout),
        supported_access_for_layout(layout),
        layout,
        range,
        on_finished,
    );
}

fn on_attachment_loaded(shared: &Arc<Shared>, pass: &Arc<PassInfo>, request: LoadRequest, texture: RenderTexture) {
    let loaded = pass.lock().on_attachment_loaded(
        shared.ctx.device.as_ref(),
        shared.frame_count,
        request.local,
        texture,
        request.aspect,
        request.extent,
    );
    if loaded {
        pass.complete_one(shared);
    } else {
        #[cfg(feature = "logging")]
        log::warn!(
            "Render target {:?} was loaded twice for attachment {:?}",
            texture.identifier,
            request.identifier
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ids::PassAttachmentReference, state::SubresourceState};

    const TARGET: AttachmentIdentifier = AttachmentIdentifier::new(1);

    fn mips() -> SubresourceRange {
        SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(0, 2), ArrayRange::default())
    }

    fn mip(level: u32) -> SubresourceRange {
        SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(level, 1), ArrayRange::default())
    }

    fn table() -> AttachmentTable {
        let mut table = AttachmentTable::with_capacity(4);
        table.get_mut(TARGET).states.register_used_subresource_range(mips());
        table
    }

    #[test]
    fn uniform_entry_layout() {
        let mut table = table();
        assert_eq!(entry_layout(&table, TARGET, mips()), None);

        table.get_mut(TARGET).states.set_subresource_state(
            mips(),
            SubresourceState::new(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                PassAttachmentReference::new(0, 0, 0),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                0,
            ),
            Bucket::Current,
        );
        assert_eq!(
            entry_layout(&table, TARGET, mips()),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        );
        //Never declared.
        assert_eq!(entry_layout(&table, AttachmentIdentifier::new(2), mips()), None);
    }

    #[test]
    fn mixed_entry_layouts_skip_the_transition() {
        let mut table = table();
        let states = &mut table.get_mut(TARGET).states;
        states.set_subresource_state(
            mip(0),
            SubresourceState::new(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                PassAttachmentReference::new(0, 0, 0),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                0,
            ),
            Bucket::Current,
        );
        states.set_subresource_state(
            mip(1),
            SubresourceState::new(
                vk::ImageLayout::GENERAL,
                PassAttachmentReference::new(1, 0, 0),
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE,
                0,
            ),
            Bucket::Current,
        );

        assert_eq!(entry_layout(&table, TARGET, mips()), None);
        assert_eq!(
            entry_layout(&table, TARGET, mip(1)),
            Some(vk::ImageLayout::GENERAL)
        );
    }
}
