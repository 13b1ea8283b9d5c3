//! Per attachment bookkeeping of the compiler.
//!
//! Every [AttachmentIdentifier] the compiler sees owns an [AttachmentInfo]. It records which pass touched which
//! subresource in which layout, and rewrites the *final layout* of already compiled render passes whenever a later
//! pass needs the attachment in a different layout.

use ash::vk;

use crate::{
    ids::{AttachmentIdentifier, DenseIdentifier, IdentifierMask, PassAttachmentReference},
    range::SubresourceRange,
    state::{Bucket, SubresourceState, SubresourceStates},
};

///Access to the render pass attachments of already compiled passes.
pub trait CompiledPasses {
    ///Returns the API attachment description and declared range `reference` points to, if it is a
    /// render pass attachment.
    fn render_attachment(
        &mut self,
        reference: PassAttachmentReference,
    ) -> Option<(&mut vk::AttachmentDescription, SubresourceRange)>;
}

#[derive(Clone, Debug, Default)]
pub struct AttachmentInfo {
    pub states: SubresourceStates,
    last_user: PassAttachmentReference,
    final_layout_locked: bool,
}

impl AttachmentInfo {
    pub fn reset(&mut self) {
        self.states.reset();
        self.last_user = PassAttachmentReference::INVALID;
        self.final_layout_locked = false;
    }

    pub fn last_user(&self) -> PassAttachmentReference {
        self.last_user
    }

    pub fn is_final_layout_locked(&self) -> bool {
        self.final_layout_locked
    }

    pub fn lock_final_layout(&mut self) {
        self.final_layout_locked = true;
    }

    pub fn get_uniform_subresource_state(&self, range: SubresourceRange) -> Option<SubresourceState> {
        self.states.get_uniform_subresource_state(range, Bucket::Current)
    }

    fn on_used(&mut self, reference: PassAttachmentReference) {
        let previous_pass = self.last_user.pass;
        self.last_user = reference;
        //A lock only holds while the same pass keeps using the attachment.
        if reference.pass != previous_pass {
            self.final_layout_locked = false;
        }
    }

    ///Moves `range` into `new`. If the previous user was a render pass, its final layout is changed to `new`'s layout
    /// so the render pass itself performs the transition.
    pub fn transition_layout(
        &mut self,
        passes: &mut dyn CompiledPasses,
        previous: SubresourceState,
        new: SubresourceState,
        range: SubresourceRange,
    ) {
        self.on_used(new.reference);
        if previous.reference.is_valid() && !self.final_layout_locked {
            if let Some((description, attachment_range)) = passes.render_attachment(previous.reference) {
                if description.final_layout != new.layout {
                    description.final_layout = new.layout;
                    assert!(
                        attachment_range.contains_levels(&range),
                        "Final layout change of {:?} exceeds the declared range {:?}",
                        range,
                        attachment_range
                    );
                    self.lock_final_layout();
                }
            }
        }

        self.states.set_subresource_state(range, new, Bucket::Current);
    }

    ///Entry state of a render pass attachment. The pass begins in `layout`, whoever used the attachment before ends
    /// in it.
    #[allow(clippy::too_many_arguments)]
    pub fn request_initial_render_pass_layout(
        &mut self,
        passes: &mut dyn CompiledPasses,
        reference: PassAttachmentReference,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
        queue_family: u32,
        range: SubresourceRange,
    ) -> SubresourceState {
        let requested = SubresourceState::new(layout, reference, stages, access, queue_family);
        let previous = self.get_uniform_subresource_state(range);
        assert!(
            previous.is_some(),
            "Render pass attachment range {range:?} is not in a uniform state"
        );
        let previous = previous.unwrap_or_default();
        self.transition_layout(passes, previous, requested, range);
        requested
    }

    ///Moves every uniform part of `range` into `layout`, transitioning away from earlier users where necessary.
    #[allow(clippy::too_many_arguments)]
    pub fn request_or_transition_layout(
        &mut self,
        passes: &mut dyn CompiledPasses,
        reference: PassAttachmentReference,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
        queue_family: u32,
        range: SubresourceRange,
    ) {
        assert!(
            layout != vk::ImageLayout::UNDEFINED,
            "Can not transition into the undefined layout"
        );

        let mut partitions = Vec::new();
        self.states
            .visit_uniform_subresource_ranges(range, Bucket::Current, |state, range| {
                partitions.push((state, range))
            });

        for (previous, partition) in partitions {
            let new = SubresourceState::new(layout, reference, stages, access, queue_family);
            if previous.layout == layout {
                self.states.set_subresource_state(partition, new, Bucket::Current);
                self.on_used(reference);
            } else if previous.was_used() {
                self.transition_layout(passes, previous, new, partition);
            } else {
                self.on_used(reference);
                self.states.set_subresource_state(partition, new, Bucket::Current);
            }
        }
    }

    ///Sets the state without touching the previous user, used within compute passes where the pass records its own
    /// barriers.
    pub fn try_transition(&mut self, new: SubresourceState, range: SubresourceRange) {
        self.on_used(new.reference);
        self.states.set_subresource_state(range, new, Bucket::Current);
    }
}

///All attachments a framegraph knows about, indexed by identifier.
#[derive(Debug, Default)]
pub struct AttachmentTable {
    infos: Vec<AttachmentInfo>,
    processed: IdentifierMask<AttachmentIdentifier>,
}

impl AttachmentTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut infos = Vec::with_capacity(capacity);
        infos.resize_with(capacity, AttachmentInfo::default);
        AttachmentTable {
            infos,
            processed: IdentifierMask::default(),
        }
    }

    pub fn get(&self, identifier: AttachmentIdentifier) -> Option<&AttachmentInfo> {
        self.infos.get(identifier.index())
    }

    ///Returns the info of `identifier`, growing the table if needed.
    pub fn get_mut(&mut self, identifier: AttachmentIdentifier) -> &mut AttachmentInfo {
        let index = identifier.index();
        if index >= self.infos.len() {
            #[cfg(feature = "logging")]
            log::debug!(
                "Growing attachment table from {} to {} entries",
                self.infos.len(),
                index + 1
            );
            self.infos.resize_with(index + 1, AttachmentInfo::default);
        }
        &mut self.infos[index]
    }

    pub fn mark_processed(&mut self, identifier: AttachmentIdentifier) {
        self.processed.set(identifier);
    }

    pub fn is_processed(&self, identifier: AttachmentIdentifier) -> bool {
        self.processed.is_set(identifier)
    }

    ///Identifiers that were written by a pass of the current compilation.
    pub fn processed(&self) -> impl Iterator<Item = AttachmentIdentifier> + '_ {
        self.processed.iter()
    }

    ///Forgets everything recorded by the previous compilation. Allocated slots are kept.
    pub fn reset(&mut self) {
        for info in self.infos.iter_mut() {
            info.reset();
        }
        self.processed.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{ArrayRange, MipRange};

    struct OneRenderPass {
        descriptions: Vec<vk::AttachmentDescription>,
        range: SubresourceRange,
    }

    impl CompiledPasses for OneRenderPass {
        fn render_attachment(
            &mut self,
            reference: PassAttachmentReference,
        ) -> Option<(&mut vk::AttachmentDescription, SubresourceRange)> {
            if reference.pass != 0 {
                return None;
            }
            let range = self.range;
            self.descriptions
                .get_mut(reference.attachment as usize)
                .map(|d| (d, range))
        }
    }

    fn color_pass() -> OneRenderPass {
        OneRenderPass {
            descriptions: vec![vk::AttachmentDescription {
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            }],
            range: SubresourceRange::color(),
        }
    }

    #[test]
    fn reading_pass_rewrites_final_layout() {
        let mut passes = color_pass();
        let mut info = AttachmentInfo::default();
        info.states.register_used_subresource_range(SubresourceRange::color());

        info.request_initial_render_pass_layout(
            &mut passes,
            PassAttachmentReference::new(0, 0, 0),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            0,
            SubresourceRange::color(),
        );
        info.request_or_transition_layout(
            &mut passes,
            PassAttachmentReference::new(1, 0, 0),
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            0,
            SubresourceRange::color(),
        );

        assert_eq!(
            passes.descriptions[0].final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(info.last_user().pass, 1);
        assert!(info.is_final_layout_locked());
        let current = info.get_uniform_subresource_state(SubresourceRange::color()).unwrap();
        assert_eq!(current.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let initial = info
            .states
            .get_uniform_subresource_state(SubresourceRange::color(), Bucket::Initial)
            .unwrap();
        assert_eq!(initial.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn second_rewrite_within_pass_is_locked() {
        let mut passes = color_pass();
        let two_mips = SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(0, 2), ArrayRange::new(0, 1));
        passes.range = two_mips;
        let mut info = AttachmentInfo::default();
        info.states.register_used_subresource_range(two_mips);
        info.request_initial_render_pass_layout(
            &mut passes,
            PassAttachmentReference::new(0, 0, 0),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            0,
            two_mips,
        );

        let mip = |base| SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(base, 1), ArrayRange::new(0, 1));
        //Pass 1 reads mip 0 and writes mip 1 as general.
        info.request_or_transition_layout(
            &mut passes,
            PassAttachmentReference::new(1, 0, 0),
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            0,
            mip(0),
        );
        info.request_or_transition_layout(
            &mut passes,
            PassAttachmentReference::new(1, 1, 0),
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
            0,
            mip(1),
        );

        assert_eq!(
            passes.descriptions[0].final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert!(info.is_final_layout_locked());
    }

    #[test]
    #[should_panic]
    fn undefined_target_layout_panics() {
        let mut passes = color_pass();
        let mut info = AttachmentInfo::default();
        info.states.register_used_subresource_range(SubresourceRange::color());
        info.request_or_transition_layout(
            &mut passes,
            PassAttachmentReference::new(0, 0, 0),
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::UNDEFINED,
            0,
            SubresourceRange::color(),
        );
    }

    #[test]
    fn table_grows_and_resets() {
        let mut table = AttachmentTable::with_capacity(2);
        let far = AttachmentIdentifier::new(10);
        table.get_mut(far).states.register_used_subresource_range(SubresourceRange::color());
        table.mark_processed(far);
        assert!(table.is_processed(far));
        assert!(table.get(far).unwrap().states.registered_range().is_some());

        table.reset();
        assert!(!table.is_processed(far));
        assert!(table.get(far).unwrap().states.registered_range().is_none());
    }
}
