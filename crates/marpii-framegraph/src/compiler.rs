//! Compiles the ordered stage list of a frame into passes.
//!
//! Compilation runs in two steps. The first walks all stages in order and replays their attachment usage on the
//! [AttachmentTable]. Doing so derives load and store operations, entry and exit layouts, and the dependencies between
//! passes. Later passes may still patch the store operations and final layouts of earlier render passes while this
//! happens. Once the whole list is known, the second step creates the pass objects and collects the render targets
//! every pass has to wait for.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    attachment::{AttachmentTable, CompiledPasses},
    description::{
        AttachmentDescription, AttachmentFlags, ColorAttachmentDescription, ComputePassDescription,
        DepthAttachmentDescription, ExplicitRenderPassDescription, GenericPassDescription, PassDescription,
        RenderPassDescription, RenderSubpassDescription, RenderTargets, StageDescription, StencilAttachmentDescription,
        SubpassAttachmentReference,
    },
    error::FramegraphError,
    flags::{supported_access_for_layout, supported_stages_for_layout},
    ids::{
        AttachmentIdentifier, AttachmentIndex, FrameIndex, PassAttachmentReference, PassIndex, SubpassIndex,
        INVALID_PASS_INDEX, INVALID_STAGE_INDEX, MAXIMUM_ATTACHMENT_COUNT,
    },
    interfaces::{ClearValue, JobBatch, StageHost},
    loading::{queue_attachment_load, LoadRequest},
    runtime::Framegraph,
    pass::{
        AttachmentBindings, PassInfo, ExternalInputState, GenericPassInfo, GenericSubpassInfo, PassKind, PassState,
        RenderPassInfo, RenderSubpassInfo,
    },
    range::SubresourceRange,
    state::{Bucket, SubresourceState, SubresourceStates},
};

const DEPTH_STENCIL: vk::ImageAspectFlags =
    vk::ImageAspectFlags::from_raw(vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw());
const INPUT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::GEOMETRY_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw(),
);

///Everything the compiler needs to know about the world outside the stage list.
#[derive(Clone, Debug)]
pub(crate) struct CompileTargets {
    pub render_output: AttachmentIdentifier,
    pub render_output_format: vk::Format,
    pub graphics_queue: u32,
    pub frame_count: FrameIndex,
    pub trace: bool,
}

fn load_op(flags: AttachmentFlags, previous: &SubresourceState) -> vk::AttachmentLoadOp {
    if flags.contains(AttachmentFlags::CLEAR) {
        vk::AttachmentLoadOp::CLEAR
    } else if flags.contains(AttachmentFlags::CAN_READ) {
        if previous.was_used() {
            vk::AttachmentLoadOp::LOAD
        } else {
            assert!(
                !flags.contains(AttachmentFlags::MUST_READ),
                "Attachment expecting read without prior pass"
            );
            vk::AttachmentLoadOp::DONT_CARE
        }
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    }
}

fn store_op(flags: AttachmentFlags) -> vk::AttachmentStoreOp {
    if flags.contains(AttachmentFlags::MUST_STORE)
        || flags.contains(AttachmentFlags::CLEAR | AttachmentFlags::CAN_STORE)
    {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    }
}

fn attachment_access(
    load: vk::AttachmentLoadOp,
    store: vk::AttachmentStoreOp,
    read: vk::AccessFlags,
    write: vk::AccessFlags,
) -> vk::AccessFlags {
    let mut access = vk::AccessFlags::empty();
    if load == vk::AttachmentLoadOp::LOAD {
        access |= read;
    }
    if store == vk::AttachmentStoreOp::STORE {
        access |= write;
    }
    access
}

///Depth/stencil attachments that are not stored default to the read only layout, a later pass can still upgrade the
/// store operation.
fn depth_stencil_layout(load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> vk::ImageLayout {
    if store == vk::AttachmentStoreOp::STORE || load == vk::AttachmentLoadOp::CLEAR {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    }
}

fn depth_stencil_stages(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    let mut stages = vk::PipelineStageFlags::empty();
    if access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ) {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    }
    if access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        stages |= vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }
    if stages.is_empty() {
        stages = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    }
    stages
}

fn read_only_layout(range: &SubresourceRange) -> vk::ImageLayout {
    if range.has_depth_or_stencil() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

fn render_target_clear_values(targets: &RenderTargets) -> Vec<ClearValue> {
    let mut values = targets
        .color_attachments
        .iter()
        .map(|color| color.clear_value.map(ClearValue::Color).unwrap_or_default())
        .collect::<Vec<_>>();
    if targets.has_depth_or_stencil() {
        let depth = targets.depth_attachment.as_ref().and_then(|d| d.clear_value);
        let stencil = targets.stencil_attachment.as_ref().and_then(|s| s.clear_value);
        values.push(if depth.is_some() || stencil.is_some() {
            ClearValue::DepthStencil {
                depth: depth.unwrap_or(0.0),
                stencil: stencil.unwrap_or(0),
            }
        } else {
            ClearValue::None
        });
    }
    values
}

///Attachments a render pass waits for. Colors, then the depth/stencil slot, then inputs from earlier passes.
fn render_target_loads(targets: &RenderTargets, external_inputs: &[AttachmentDescription]) -> Vec<LoadRequest> {
    let color_count = targets.color_attachments.len();
    let mut loads = targets
        .color_attachments
        .iter()
        .enumerate()
        .map(|(index, color)| LoadRequest::new(index, &color.attachment, vk::ImageAspectFlags::COLOR))
        .collect::<Vec<_>>();

    match (&targets.depth_attachment, &targets.stencil_attachment) {
        (Some(depth), stencil) => {
            let mut aspect = vk::ImageAspectFlags::DEPTH;
            if stencil.is_some() {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
            loads.push(LoadRequest::new(color_count, &depth.attachment, aspect));
        }
        (None, Some(stencil)) => {
            loads.push(LoadRequest::new(
                color_count,
                &stencil.attachment,
                vk::ImageAspectFlags::STENCIL,
            ));
        }
        (None, None) => {}
    }

    let base = loads.len();
    loads.extend(
        external_inputs
            .iter()
            .enumerate()
            .map(|(index, input)| LoadRequest::new(base + index, input, input.range.aspect)),
    );
    loads
}

fn generic_loads(
    outputs: &[AttachmentDescription],
    input_outputs: &[AttachmentDescription],
    inputs: &[AttachmentDescription],
) -> Vec<LoadRequest> {
    outputs
        .iter()
        .chain(input_outputs.iter())
        .chain(inputs.iter())
        .enumerate()
        .map(|(local, description)| LoadRequest::new(local, description, description.range.aspect))
        .collect()
}

///Synthesizes one dependency per subpass, chained from the previous subpass, plus the trailing external dependency.
///
/// Subpass inputs that point at color slots count as color reads, all others as depth/stencil reads.
pub(crate) fn subpass_dependencies(
    subpasses: &[RenderSubpassDescription],
    descriptions: &[vk::AttachmentDescription],
    color_count: usize,
) -> Vec<vk::SubpassDependency> {
    let loads = |index: AttachmentIndex| {
        descriptions
            .get(index as usize)
            .is_some_and(|d| d.load_op == vk::AttachmentLoadOp::LOAD)
    };
    let stores = |index: AttachmentIndex| {
        descriptions
            .get(index as usize)
            .is_some_and(|d| d.store_op == vk::AttachmentStoreOp::STORE)
    };
    let stencil_loads = |index: AttachmentIndex| {
        descriptions
            .get(index as usize)
            .is_some_and(|d| d.stencil_load_op == vk::AttachmentLoadOp::LOAD)
    };
    let stencil_stores = |index: AttachmentIndex| {
        descriptions
            .get(index as usize)
            .is_some_and(|d| d.stencil_store_op == vk::AttachmentStoreOp::STORE)
    };

    let mut src_subpass = vk::SUBPASS_EXTERNAL;
    let mut src_stage_mask = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    let mut src_access_mask = vk::AccessFlags::MEMORY_READ;
    let mut dependencies = Vec::with_capacity(subpasses.len() + 1);

    for (index, subpass) in subpasses.iter().enumerate() {
        let later = &subpasses[index + 1..];
        let read_by_later = |attachment: AttachmentIndex| {
            later
                .iter()
                .any(|l| l.subpass_input_attachment_indices.contains(&attachment))
        };

        let reads_color_input = subpass
            .subpass_input_attachment_indices
            .iter()
            .any(|i| (*i as usize) < color_count);
        let reads_depth_input = subpass
            .subpass_input_attachment_indices
            .iter()
            .any(|i| (*i as usize) >= color_count);
        let writes_color_output = subpass.color_attachment_indices.iter().any(|i| read_by_later(*i));
        let writes_depth_output = subpass.depth_attachment_index.is_some_and(read_by_later);
        let writes_stencil_output = subpass.stencil_attachment_index.is_some_and(read_by_later);

        let reads_color = subpass.color_attachment_indices.iter().any(|i| loads(*i)) || reads_color_input;
        let writes_color = subpass.color_attachment_indices.iter().any(|i| stores(*i)) || writes_color_output;
        let reads_depth = subpass.depth_attachment_index.is_some_and(loads) || reads_depth_input;
        let writes_depth = subpass.depth_attachment_index.is_some_and(stores) || writes_depth_output;
        let reads_stencil = subpass.stencil_attachment_index.is_some_and(stencil_loads) || reads_depth_input;
        let writes_stencil = subpass.stencil_attachment_index.is_some_and(stencil_stores) || writes_stencil_output;
        let reads_depth_stencil = reads_depth || reads_stencil;
        let writes_depth_stencil = writes_depth || writes_stencil;

        let mut dst_stage_mask = vk::PipelineStageFlags::empty();
        let mut dst_access_mask = vk::AccessFlags::empty();
        if reads_color || writes_color {
            dst_stage_mask |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        }
        if reads_depth_stencil {
            dst_stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        }
        if writes_depth_stencil {
            dst_stage_mask |= vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        }
        //A stage mask must never be empty.
        if dst_stage_mask.is_empty() {
            dst_stage_mask = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if reads_color {
            dst_access_mask |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
        if writes_color {
            dst_access_mask |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if reads_depth_stencil {
            dst_access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
        }
        if writes_depth_stencil {
            dst_access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        dependencies.push(vk::SubpassDependency {
            src_subpass,
            dst_subpass: index as u32,
            src_stage_mask,
            dst_stage_mask,
            src_access_mask,
            dst_access_mask,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });

        src_subpass = index as u32;
        src_stage_mask = dst_stage_mask;
        src_access_mask = dst_access_mask;
    }

    dependencies.push(vk::SubpassDependency {
        src_subpass,
        dst_subpass: vk::SUBPASS_EXTERNAL,
        src_stage_mask,
        dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        src_access_mask,
        dst_access_mask: vk::AccessFlags::MEMORY_READ,
        dependency_flags: vk::DependencyFlags::BY_REGION,
    });

    dependencies
}

///Result of the whole-graph step that runs after every pass was compiled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RenderOutputUsage {
    pub first_pass: Option<PassIndex>,
    pub last_pass: Option<PassIndex>,
}

pub(crate) struct PassCompiler {
    pub attachments: AttachmentTable,
    pub passes: Vec<PassState>,
    ///Passes that touch the render output and therefore have to wait for image acquisition.
    pub render_output_dependencies: SmallVec<[PassIndex; 4]>,
    targets: CompileTargets,
}

impl PassCompiler {
    pub fn new(mut attachments: AttachmentTable, targets: CompileTargets, pass_count: usize) -> Self {
        attachments.reset();
        attachments
            .get_mut(targets.render_output)
            .states
            .register_used_subresource_range(SubresourceRange::color());
        PassCompiler {
            attachments,
            passes: Vec::with_capacity(pass_count),
            render_output_dependencies: SmallVec::new(),
            targets,
        }
    }

    fn uniform_state(&self, identifier: AttachmentIdentifier, range: SubresourceRange) -> SubresourceState {
        let state = self
            .attachments
            .get(identifier)
            .and_then(|info| info.get_uniform_subresource_state(range));
        let Some(state) = state else {
            panic!("Attachment {identifier:?} is not in a uniform state over {range:?}");
        };
        state
    }

    ///States of all uniform parts of `range`.
    fn partitions(&self, identifier: AttachmentIdentifier, range: SubresourceRange) -> Vec<SubresourceState> {
        let mut states = Vec::new();
        if let Some(info) = self.attachments.get(identifier) {
            info.states
                .visit_uniform_subresource_ranges(range, Bucket::Current, |state, _| states.push(state));
        }
        states
    }

    fn assert_written(&self, identifier: AttachmentIdentifier, range: SubresourceRange) {
        let partitions = self.partitions(identifier, range);
        assert!(
            !partitions.is_empty() && partitions.iter().all(SubresourceState::was_used),
            "Input attachment must be processed by a prior stage"
        );
    }

    ///Registers the attachment and adds GPU dependencies on everyone who used `range` before.
    fn track(&mut self, state: &mut PassState, pass: PassIndex, description: &AttachmentDescription) {
        let identifier = description.identifier;
        self.attachments
            .get_mut(identifier)
            .states
            .register_used_subresource_range(description.range);

        for previous in self.partitions(identifier, description.range) {
            if previous.was_used() && previous.reference.pass != pass {
                state.add_gpu_dependency(previous.reference.pass);
            }
        }

        if !state.attachments.contains(&identifier) {
            state.attachments.push(identifier);
        }
        if identifier == self.targets.render_output && !self.render_output_dependencies.contains(&pass) {
            self.render_output_dependencies.push(pass);
        }
    }

    ///Forces the render pass that produced `previous` to store the aspects in `range`.
    fn store_previous_result(&mut self, previous: &SubresourceState, range: SubresourceRange) {
        if !previous.was_used() {
            return;
        }
        if let Some((description, declared)) = self.passes.render_attachment(previous.reference) {
            if range
                .aspect
                .intersects(vk::ImageAspectFlags::COLOR | vk::ImageAspectFlags::DEPTH)
            {
                description.store_op = vk::AttachmentStoreOp::STORE;
            }
            if range.aspect.contains(vk::ImageAspectFlags::STENCIL) {
                description.stencil_store_op = vk::AttachmentStoreOp::STORE;
            }
            assert!(
                declared.contains_levels(&range),
                "Range {range:?} was not written by pass {}",
                previous.reference.pass
            );

            #[cfg(feature = "logging")]
            if self.targets.trace {
                log::trace!(
                    "Pass {} now stores attachment {}",
                    previous.reference.pass,
                    previous.reference.attachment
                );
            }
        }
    }

    fn store_previous_results(&mut self, identifier: AttachmentIdentifier, range: SubresourceRange) {
        let mut partitions = Vec::new();
        if let Some(info) = self.attachments.get(identifier) {
            info.states
                .visit_uniform_subresource_ranges(range, Bucket::Current, |state, range| partitions.push((state, range)));
        }
        for (previous, range) in partitions {
            self.store_previous_result(&previous, range);
        }
    }

    ///Declaration step of a single stage. `index` must be the stage's position in the list.
    pub fn compile_pass(
        &mut self,
        index: PassIndex,
        description: &StageDescription,
    ) -> Result<PassState, FramegraphError> {
        let mut state = PassState {
            name: description.name.clone(),
            stage_type: description.stage_type(),
            stage: description.stage,
            pass_stage: None,
            cpu_dependencies: SmallVec::new(),
            gpu_dependencies: SmallVec::new(),
            attachments: Vec::new(),
            attachment_count: 0,
            //Replaced once the attachments are compiled.
            kind: PassKind::Generic(GenericPassInfo::default()),
        };

        if description.previous_stage != INVALID_STAGE_INDEX {
            assert!(
                description.previous_stage < index,
                "Stage {} can only depend on an earlier stage",
                description.name
            );
            state.add_cpu_dependency(description.previous_stage);
            state.add_gpu_dependency(description.previous_stage);
        }

        let kind = match &description.pass {
            PassDescription::RenderPass(desc) => {
                PassKind::Render(self.compile_render_pass(&mut state, index, &desc.targets, &desc.input_attachments)?)
            }
            PassDescription::ExplicitRenderPass(desc) => {
                assert!(
                    !desc.subpasses.is_empty(),
                    "Explicit render pass {} declares no subpasses",
                    description.name
                );
                PassKind::Render(self.compile_render_pass(
                    &mut state,
                    index,
                    &desc.targets,
                    &desc.external_input_attachments,
                )?)
            }
            PassDescription::Generic(desc) => {
                assert!(description.stage.is_some(), "Generic pass {} needs a stage", description.name);
                PassKind::Generic(self.compile_generic_pass(
                    &mut state,
                    index,
                    &desc.output_attachments,
                    &desc.input_output_attachments,
                    &desc.input_attachments,
                    false,
                )?)
            }
            PassDescription::Compute(desc) => {
                assert!(description.stage.is_some(), "Compute pass {} needs a stage", description.name);
                let info = self.compile_generic_pass(
                    &mut state,
                    index,
                    &desc.output_attachments,
                    &desc.input_output_attachments,
                    &desc.input_attachments,
                    true,
                )?;
                self.compile_compute_subpasses(index, desc);
                PassKind::Compute(info)
            }
        };
        state.kind = kind;

        #[cfg(feature = "logging")]
        log::debug!(
            "Compiled pass {} ({:?}): {} attachments, gpu dependencies {:?}",
            state.name,
            state.stage_type,
            state.attachment_count,
            state.gpu_dependencies
        );

        Ok(state)
    }

    fn compile_render_pass(
        &mut self,
        state: &mut PassState,
        pass: PassIndex,
        targets: &RenderTargets,
        external_inputs: &[AttachmentDescription],
    ) -> Result<RenderPassInfo, FramegraphError> {
        let color_count = targets.color_attachments.len();
        if targets.depth_attachment.is_some() && targets.stencil_attachment.is_some() {
            assert!(
                targets.is_depth_stencil_unified(),
                "Depth and stencil attachments of pass {} must share one image",
                state.name
            );
        }
        let render_count = color_count + usize::from(targets.has_depth_or_stencil());
        let total = render_count + external_inputs.len();
        if total > MAXIMUM_ATTACHMENT_COUNT {
            return Err(FramegraphError::TooManyAttachments { count: total });
        }
        state.attachment_count = total as u32;

        //Dependencies first, resolution below changes the states we depend on.
        for color in targets.color_attachments.iter() {
            self.track(state, pass, &color.attachment);
        }
        if let Some(depth) = &targets.depth_attachment {
            self.track(state, pass, &depth.attachment);
        }
        if let Some(stencil) = &targets.stencil_attachment {
            self.track(state, pass, &stencil.attachment);
        }

        let mut external_input_states = Vec::with_capacity(external_inputs.len());
        for (index, input) in external_inputs.iter().enumerate() {
            self.attachments
                .get_mut(input.identifier)
                .states
                .register_used_subresource_range(input.range);
            self.assert_written(input.identifier, input.range);
            self.track(state, pass, input);

            let slot = (render_count + index) as AttachmentIndex;
            external_input_states.push(ExternalInputState {
                identifier: input.identifier,
                attachment: slot,
                range: input.range,
                state: SubresourceState::new(
                    read_only_layout(&input.range),
                    PassAttachmentReference::new(pass, slot, 0),
                    INPUT_STAGES,
                    vk::AccessFlags::SHADER_READ,
                    self.targets.graphics_queue,
                ),
            });
        }

        let mut info = RenderPassInfo {
            render_area: targets.render_area,
            attachment_descriptions: vec![vk::AttachmentDescription::default(); render_count],
            attachment_ranges: vec![SubresourceRange::color(); total],
            mapping_types: vec![vk::ImageViewType::TYPE_2D; total],
            clear_values: render_target_clear_values(targets),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            external_inputs: external_input_states,
            bindings: AttachmentBindings::new(self.targets.frame_count, total),
        };

        for (index, color) in targets.color_attachments.iter().enumerate() {
            self.compile_color_attachment(&mut info, pass, index, color);
        }

        //Unified depth/stencil images share one layout, writable if either aspect needs it.
        let shared_layout = match (&targets.depth_attachment, &targets.stencil_attachment) {
            (Some(depth), Some(stencil)) => {
                let depth_layout = self.depth_stencil_target(&depth.attachment).2;
                let stencil_layout = self.depth_stencil_target(&stencil.attachment).2;
                if depth_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    || stencil_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                {
                    Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                } else {
                    Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
                }
            }
            _ => None,
        };
        if let Some(depth) = &targets.depth_attachment {
            self.compile_depth_attachment(&mut info, pass, color_count, depth, shared_layout);
        }
        if let Some(stencil) = &targets.stencil_attachment {
            self.compile_stencil_attachment(&mut info, pass, color_count, stencil, shared_layout);
        }

        for (index, input) in external_inputs.iter().enumerate() {
            let slot = render_count + index;
            info.mapping_types[slot] = input.mapping_type;
            info.attachment_ranges[slot] = input.range;
            self.compile_input_attachment(
                PassAttachmentReference::new(pass, slot as AttachmentIndex, 0),
                input.identifier,
                INPUT_STAGES,
                vk::AccessFlags::SHADER_READ,
                input.range,
            );
        }

        Ok(info)
    }

    ///Load op, store op and entry layout of a depth or stencil attachment.
    fn depth_stencil_target(
        &self,
        description: &AttachmentDescription,
    ) -> (vk::AttachmentLoadOp, vk::AttachmentStoreOp, vk::ImageLayout) {
        let previous = self.uniform_state(description.identifier, description.range);
        let load = load_op(description.flags, &previous);
        let store = store_op(description.flags);
        (load, store, depth_stencil_layout(load, store))
    }

    fn compile_color_attachment(
        &mut self,
        info: &mut RenderPassInfo,
        pass: PassIndex,
        slot: usize,
        color: &ColorAttachmentDescription,
    ) {
        let description = &color.attachment;
        self.attachments.mark_processed(description.identifier);

        let previous = self.uniform_state(description.identifier, description.range);
        let load = load_op(description.flags, &previous);
        let store = store_op(description.flags);
        let access = attachment_access(
            load,
            store,
            vk::AccessFlags::COLOR_ATTACHMENT_READ,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        let format = if description.identifier == self.targets.render_output {
            self.targets.render_output_format
        } else {
            //Known once the render target is loaded.
            vk::Format::UNDEFINED
        };

        let requested = self.attachments.get_mut(description.identifier).request_initial_render_pass_layout(
            &mut self.passes,
            PassAttachmentReference::new(pass, slot as AttachmentIndex, 0),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            access,
            layout,
            self.targets.graphics_queue,
            description.range,
        );

        info.attachment_descriptions[slot] = vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: load,
            store_op: store,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: requested.layout,
            final_layout: layout,
            ..Default::default()
        };
        info.mapping_types[slot] = description.mapping_type;
        info.attachment_ranges[slot] = description.range;

        if load == vk::AttachmentLoadOp::LOAD {
            self.store_previous_result(&previous, description.range);
        }

        #[cfg(feature = "logging")]
        if self.targets.trace {
            log::trace!(
                "Pass {pass} color {slot} ({:?}): load {:?}, store {:?}",
                description.identifier,
                load,
                store
            );
        }
    }

    fn compile_depth_attachment(
        &mut self,
        info: &mut RenderPassInfo,
        pass: PassIndex,
        slot: usize,
        depth: &DepthAttachmentDescription,
        shared_layout: Option<vk::ImageLayout>,
    ) {
        let description = &depth.attachment;
        self.attachments.mark_processed(description.identifier);

        let previous = self.uniform_state(description.identifier, description.range);
        let (load, store, own_layout) = self.depth_stencil_target(description);
        let layout = shared_layout.unwrap_or(own_layout);
        let access = attachment_access(
            load,
            store,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

        let requested = self.attachments.get_mut(description.identifier).request_initial_render_pass_layout(
            &mut self.passes,
            PassAttachmentReference::new(pass, slot as AttachmentIndex, 0),
            depth_stencil_stages(access),
            access,
            layout,
            self.targets.graphics_queue,
            description.range,
        );

        info.attachment_descriptions[slot] = vk::AttachmentDescription {
            format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: load,
            store_op: store,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: requested.layout,
            final_layout: layout,
            ..Default::default()
        };
        info.mapping_types[slot] = description.mapping_type;
        info.attachment_ranges[slot] = description.range;

        if load == vk::AttachmentLoadOp::LOAD {
            self.store_previous_result(&previous, description.range);
        }

        #[cfg(feature = "logging")]
        if self.targets.trace {
            log::trace!(
                "Pass {pass} depth ({:?}): load {:?}, store {:?}, layout {:?}",
                description.identifier,
                load,
                store,
                layout
            );
        }
    }

    fn compile_stencil_attachment(
        &mut self,
        info: &mut RenderPassInfo,
        pass: PassIndex,
        slot: usize,
        stencil: &StencilAttachmentDescription,
        shared_layout: Option<vk::ImageLayout>,
    ) {
        let description = &stencil.attachment;
        self.attachments.mark_processed(description.identifier);

        let previous = self.uniform_state(description.identifier, description.range);
        let (load, store, own_layout) = self.depth_stencil_target(description);
        let layout = shared_layout.unwrap_or(own_layout);
        let access = attachment_access(
            load,
            store,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

        let requested = self.attachments.get_mut(description.identifier).request_initial_render_pass_layout(
            &mut self.passes,
            PassAttachmentReference::new(pass, slot as AttachmentIndex, 0),
            depth_stencil_stages(access),
            access,
            layout,
            self.targets.graphics_queue,
            description.range,
        );

        if shared_layout.is_some() {
            let unified = &mut info.attachment_descriptions[slot];
            unified.stencil_load_op = load;
            unified.stencil_store_op = store;
            unified.initial_layout = requested.layout;
            unified.final_layout = layout;
            info.attachment_ranges[slot].aspect |= description.range.aspect;
        } else {
            info.attachment_descriptions[slot] = vk::AttachmentDescription {
                format: vk::Format::UNDEFINED,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: load,
                stencil_store_op: store,
                initial_layout: requested.layout,
                final_layout: layout,
                ..Default::default()
            };
            info.mapping_types[slot] = description.mapping_type;
            info.attachment_ranges[slot] = description.range;
        }

        if load == vk::AttachmentLoadOp::LOAD {
            self.store_previous_result(&previous, description.range);
        }
    }

    fn compile_input_attachment(
        &mut self,
        reference: PassAttachmentReference,
        identifier: AttachmentIdentifier,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        range: SubresourceRange,
    ) {
        self.assert_written(identifier, range);
        self.store_previous_results(identifier, range);
        self.attachments.get_mut(identifier).request_or_transition_layout(
            &mut self.passes,
            reference,
            stages,
            access,
            read_only_layout(&range),
            self.targets.graphics_queue,
            range,
        );
    }

    fn compile_output_attachment(
        &mut self,
        reference: PassAttachmentReference,
        identifier: AttachmentIdentifier,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
        range: SubresourceRange,
    ) {
        self.attachments.mark_processed(identifier);
        self.attachments.get_mut(identifier).request_or_transition_layout(
            &mut self.passes,
            reference,
            stages,
            access,
            layout,
            self.targets.graphics_queue,
            range,
        );
    }

    fn compile_input_output_attachment(
        &mut self,
        reference: PassAttachmentReference,
        identifier: AttachmentIdentifier,
        range: SubresourceRange,
    ) {
        self.store_previous_results(identifier, range);
        self.attachments.get_mut(identifier).request_or_transition_layout(
            &mut self.passes,
            reference,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
            self.targets.graphics_queue,
            range,
        );
    }

    ///Shared by generic and compute passes. Attachments are addressed by their pass local index: outputs, then
    /// in-outs, then inputs.
    fn compile_generic_pass(
        &mut self,
        state: &mut PassState,
        pass: PassIndex,
        outputs: &[AttachmentDescription],
        input_outputs: &[AttachmentDescription],
        inputs: &[AttachmentDescription],
        compute: bool,
    ) -> Result<GenericPassInfo, FramegraphError> {
        let total = outputs.len() + input_outputs.len() + inputs.len();
        if total > MAXIMUM_ATTACHMENT_COUNT {
            return Err(FramegraphError::TooManyAttachments { count: total });
        }
        state.attachment_count = total as u32;

        for output in outputs.iter() {
            self.track(state, pass, output);
        }
        for attachment in input_outputs.iter().chain(inputs.iter()) {
            self.attachments
                .get_mut(attachment.identifier)
                .states
                .register_used_subresource_range(attachment.range);
            self.assert_written(attachment.identifier, attachment.range);
            self.track(state, pass, attachment);
        }

        for (local, output) in outputs.iter().enumerate() {
            let (layout, access, stages) = if compute {
                (
                    vk::ImageLayout::GENERAL,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                )
            } else if output.range.has_depth_or_stencil() {
                (
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
            } else {
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )
            };
            self.compile_output_attachment(
                PassAttachmentReference::new(pass, local as AttachmentIndex, 0),
                output.identifier,
                stages,
                access,
                layout,
                output.range,
            );
        }

        let base = outputs.len();
        for (index, input_output) in input_outputs.iter().enumerate() {
            self.compile_input_output_attachment(
                PassAttachmentReference::new(pass, (base + index) as AttachmentIndex, 0),
                input_output.identifier,
                input_output.range,
            );
        }

        let base = base + input_outputs.len();
        for (index, input) in inputs.iter().enumerate() {
            self.compile_input_attachment(
                PassAttachmentReference::new(pass, (base + index) as AttachmentIndex, 0),
                input.identifier,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ,
                input.range,
            );
        }

        Ok(GenericPassInfo::default())
    }

    ///The first compute subpass is covered by the pass itself. Later subpasses record their own barriers, we only
    /// follow the state they leave behind.
    fn compile_compute_subpasses(&mut self, pass: PassIndex, description: &ComputePassDescription) {
        for (subpass_index, subpass) in description.subpasses.iter().enumerate().skip(1) {
            let usages = subpass
                .output_attachments
                .iter()
                .map(|r| (r, vk::AccessFlags::SHADER_WRITE, false))
                .chain(
                    subpass
                        .input_output_attachments
                        .iter()
                        .map(|r| (r, vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE, false)),
                )
                .chain(
                    subpass
                        .input_attachments
                        .iter()
                        .map(|r| (r, vk::AccessFlags::SHADER_READ, true)),
                );

            for (reference, access, read_only) in usages {
                let attachment = description.attachment_description(reference.attachment);
                assert!(
                    attachment.range.mips.contains(&reference.mips),
                    "Compute subpass {} references mips outside of the attachment",
                    subpass.name
                );
                let range = SubresourceRange::new(attachment.range.aspect, reference.mips, attachment.range.layers);
                let layout = if read_only {
                    read_only_layout(&range)
                } else {
                    vk::ImageLayout::GENERAL
                };
                let state = SubresourceState::new(
                    layout,
                    PassAttachmentReference::new(pass, reference.attachment, subpass_index as SubpassIndex),
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    access,
                    self.targets.graphics_queue,
                );
                self.attachments
                    .get_mut(attachment.identifier)
                    .try_transition(state, range);
            }
        }
    }

    ///Runs once every pass has been declared. Makes sure the render output is stored and presentable, and moves
    /// every written attachment back into the state it entered the frame in.
    pub fn finish(&mut self, present_layout: vk::ImageLayout, present_queue_family: u32) -> RenderOutputUsage {
        let render_output = self.targets.render_output;
        let output_range = SubresourceRange::color();

        let (current, initial) = match self.attachments.get(render_output) {
            Some(info) => (
                info.get_uniform_subresource_state(output_range),
                info.states.get_uniform_subresource_state(output_range, Bucket::Initial),
            ),
            None => (None, None),
        };

        if let Some(current) = current {
            self.store_previous_result(&current, output_range);
        }

        let usage = RenderOutputUsage {
            first_pass: initial
                .filter(SubresourceState::was_used)
                .map(|state| state.reference.pass),
            last_pass: current
                .filter(SubresourceState::was_used)
                .map(|state| state.reference.pass),
        };

        if current.map(|state| state.layout) != Some(present_layout) {
            let info = self.attachments.get_mut(render_output);
            let registered = info.states.registered_range().unwrap_or(output_range);
            info.request_or_transition_layout(
                &mut self.passes,
                PassAttachmentReference::INVALID,
                supported_stages_for_layout(present_layout),
                supported_access_for_layout(present_layout),
                present_layout,
                present_queue_family,
                registered,
            );
            info.lock_final_layout();
        }

        let processed = self
            .attachments
            .processed()
            .filter(|identifier| *identifier != render_output)
            .collect::<Vec<_>>();
        for identifier in processed {
            let info = self.attachments.get_mut(identifier);
            let Some(registered) = info.states.registered_range() else {
                continue;
            };
            let Some(initial) = info.states.get_uniform_subresource_state(registered, Bucket::Initial) else {
                #[cfg(feature = "logging")]
                log::warn!("Attachment {identifier:?} has no uniform initial state, it is not restored");
                continue;
            };
            if initial.layout == vk::ImageLayout::UNDEFINED {
                continue;
            }
            info.request_or_transition_layout(
                &mut self.passes,
                PassAttachmentReference::INVALID,
                initial.stages,
                initial.access,
                initial.layout,
                initial.queue_family,
                registered,
            );
        }

        usage
    }

    ///Creates the pass objects of pass `index` and returns the attachments it waits for.
    pub fn create_pass(
        &mut self,
        host: &dyn StageHost,
        index: PassIndex,
        description: &StageDescription,
    ) -> Vec<LoadRequest> {
        match &description.pass {
            PassDescription::RenderPass(desc) => self.create_render_pass(host, index, description, desc),
            PassDescription::ExplicitRenderPass(desc) => self.create_explicit_render_pass(host, index, description, desc),
            PassDescription::Generic(desc) => self.create_generic_pass(host, index, desc),
            PassDescription::Compute(desc) => self.create_compute_pass(host, index, desc),
        }
    }

    fn create_render_pass(
        &mut self,
        host: &dyn StageHost,
        index: PassIndex,
        description: &StageDescription,
        desc: &RenderPassDescription,
    ) -> Vec<LoadRequest> {
        let frame_count = self.targets.frame_count;
        let state = &mut self.passes[index as usize];
        let PassKind::Render(info) = &mut state.kind else {
            return Vec::new();
        };

        let targets = &desc.targets;
        let color_count = targets.color_attachments.len();
        let has_depth = targets.has_depth_or_stencil();
        let render_count = color_count + usize::from(has_depth);

        let mut references = (0..color_count)
            .map(|index| vk::AttachmentReference {
                attachment: index as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect::<Vec<_>>();
        if has_depth {
            references.push(vk::AttachmentReference {
                attachment: color_count as u32,
                layout: info.attachment_descriptions[color_count].initial_layout,
            });
        }
        references.extend(desc.input_attachments.iter().enumerate().map(|(index, input)| {
            vk::AttachmentReference {
                attachment: (render_count + index) as u32,
                layout: read_only_layout(&input.range),
            }
        }));

        let subpass = RenderSubpassDescription {
            name: description.name.clone(),
            stages: description.stage.into_iter().collect(),
            color_attachment_indices: (0..color_count as AttachmentIndex).collect(),
            depth_attachment_index: targets
                .depth_attachment
                .as_ref()
                .map(|_| color_count as AttachmentIndex),
            stencil_attachment_index: targets
                .stencil_attachment
                .as_ref()
                .map(|_| color_count as AttachmentIndex),
            subpass_input_attachment_indices: Vec::new(),
            external_input_attachment_indices: (render_count..render_count + desc.input_attachments.len())
                .map(|i| i as AttachmentIndex)
                .collect(),
        };
        info.dependencies = subpass_dependencies(
            std::slice::from_ref(&subpass),
            &info.attachment_descriptions,
            color_count,
        );

        let reference_count = references.len();
        info.subpasses = vec![RenderSubpassInfo {
            name: subpass.name,
            stages: subpass.stages.clone(),
            references,
            color_count,
            has_depth,
            subpass_input_count: 0,
            external_input_count: desc.input_attachments.len(),
            bindings: AttachmentBindings::new(frame_count, reference_count),
        }];

        state.pass_stage = Some(host.create_render_pass_stage(
            &state.name,
            &info.clear_values,
            &[subpass.stages],
        ));

        render_target_loads(targets, &desc.input_attachments)
    }

    fn create_explicit_render_pass(
        &mut self,
        host: &dyn StageHost,
        index: PassIndex,
        description: &StageDescription,
        desc: &ExplicitRenderPassDescription,
    ) -> Vec<LoadRequest> {
        let frame_count = self.targets.frame_count;
        let state = &mut self.passes[index as usize];
        let PassKind::Render(info) = &mut state.kind else {
            return Vec::new();
        };
        let color_count = desc.targets.color_attachments.len();

        let reference = |attachment: AttachmentIndex, layout: vk::ImageLayout| vk::AttachmentReference {
            attachment: attachment as u32,
            layout,
        };

        let mut subpasses = Vec::with_capacity(desc.subpasses.len());
        for subpass in desc.subpasses.iter() {
            let mut references = subpass
                .color_attachment_indices
                .iter()
                .map(|i| reference(*i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                .collect::<Vec<_>>();
            let depth_index = subpass.depth_attachment_index.or(subpass.stencil_attachment_index);
            if let Some(depth_index) = depth_index {
                let layout = info
                    .attachment_descriptions
                    .get(depth_index as usize)
                    .map(|d| d.initial_layout)
                    .unwrap_or(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
                references.push(reference(depth_index, layout));
            }
            references.extend(subpass.subpass_input_attachment_indices.iter().map(|i| {
                let layout = if (*i as usize) < color_count {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                };
                reference(*i, layout)
            }));
            references.extend(subpass.external_input_attachment_indices.iter().map(|i| {
                let layout = info
                    .attachment_ranges
                    .get(*i as usize)
                    .map(read_only_layout)
                    .unwrap_or(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                reference(*i, layout)
            }));

            let stages = if subpass.stages.is_empty() {
                description.stage.into_iter().collect()
            } else {
                subpass.stages.clone()
            };
            let reference_count = references.len();
            subpasses.push(RenderSubpassInfo {
                name: subpass.name.clone(),
                stages,
                references,
                color_count: subpass.color_attachment_indices.len(),
                has_depth: depth_index.is_some(),
                subpass_input_count: subpass.subpass_input_attachment_indices.len(),
                external_input_count: subpass.external_input_attachment_indices.len(),
                bindings: AttachmentBindings::new(frame_count, reference_count),
            });
        }

        info.dependencies = subpass_dependencies(&desc.subpasses, &info.attachment_descriptions, color_count);
        let subpass_stages = subpasses.iter().map(|s| s.stages.clone()).collect::<Vec<_>>();
        info.subpasses = subpasses;

        state.pass_stage = Some(host.create_render_pass_stage(&state.name, &info.clear_values, &subpass_stages));

        render_target_loads(&desc.targets, &desc.external_input_attachments)
    }

    fn create_generic_pass(&mut self, host: &dyn StageHost, index: PassIndex, desc: &GenericPassDescription) -> Vec<LoadRequest> {
        let frame_count = self.targets.frame_count;
        let queue = self.targets.graphics_queue;
        let state = &mut self.passes[index as usize];
        let (Some(stage), PassKind::Generic(info)) = (state.stage, &mut state.kind) else {
            return Vec::new();
        };

        let subpass = &desc.subpass;
        let references = subpass
            .output_attachments
            .iter()
            .chain(subpass.input_output_attachments.iter())
            .chain(subpass.input_attachments.iter())
            .copied()
            .collect::<Vec<_>>();

        let required_states = references
            .iter()
            .enumerate()
            .map(|(position, reference)| {
                let attachment = desc.attachment_description(reference.attachment);
                let usage = if position < subpass.output_attachments.len() {
                    Usage::Output
                } else if position < subpass.output_attachments.len() + subpass.input_output_attachments.len() {
                    Usage::InputOutput
                } else {
                    Usage::Input
                };
                generic_required_state(
                    attachment.range,
                    PassAttachmentReference::new(index, reference.attachment, 0),
                    usage,
                    queue,
                )
            })
            .collect::<Vec<_>>();

        let reference_count = references.len();
        info.subpasses = vec![GenericSubpassInfo {
            name: subpass.name.clone(),
            references,
            output_count: subpass.output_attachments.len(),
            input_output_count: subpass.input_output_attachments.len(),
            input_count: subpass.input_attachments.len(),
            required_states,
            bindings: AttachmentBindings::new(frame_count, reference_count),
        }];

        state.pass_stage = Some(host.create_generic_pass_stage(&state.name, stage));

        generic_loads(
            &desc.output_attachments,
            &desc.input_output_attachments,
            &desc.input_attachments,
        )
    }

    fn create_compute_pass(&mut self, host: &dyn StageHost, index: PassIndex, desc: &ComputePassDescription) -> Vec<LoadRequest> {
        let frame_count = self.targets.frame_count;
        let queue = self.targets.graphics_queue;
        let state = &mut self.passes[index as usize];
        let (Some(stage), PassKind::Compute(info)) = (state.stage, &mut state.kind) else {
            return Vec::new();
        };

        info.subpasses = desc
            .subpasses
            .iter()
            .enumerate()
            .map(|(subpass_index, subpass)| {
                let references = subpass
                    .output_attachments
                    .iter()
                    .chain(subpass.input_output_attachments.iter())
                    .chain(subpass.input_attachments.iter())
                    .copied()
                    .collect::<Vec<SubpassAttachmentReference>>();
                let outputs = subpass.output_attachments.len();
                let input_outputs = subpass.input_output_attachments.len();

                let required_states = references
                    .iter()
                    .enumerate()
                    .map(|(position, reference)| {
                        let attachment = desc.attachment_description(reference.attachment);
                        let range =
                            SubresourceRange::new(attachment.range.aspect, reference.mips, reference.layers);
                        let (layout, access) = if position < outputs {
                            (vk::ImageLayout::GENERAL, vk::AccessFlags::SHADER_WRITE)
                        } else if position < outputs + input_outputs {
                            (
                                vk::ImageLayout::GENERAL,
                                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                            )
                        } else {
                            (read_only_layout(&range), vk::AccessFlags::SHADER_READ)
                        };
                        let mut states = SubresourceStates::default();
                        states.register_used_subresource_range(range);
                        states.set_subresource_state(
                            range,
                            SubresourceState::new(
                                layout,
                                PassAttachmentReference::new(index, reference.attachment, subpass_index as SubpassIndex),
                                vk::PipelineStageFlags::COMPUTE_SHADER,
                                access,
                                queue,
                            ),
                            Bucket::Current,
                        );
                        states
                    })
                    .collect::<Vec<_>>();

                let reference_count = references.len();
                GenericSubpassInfo {
                    name: subpass.name.clone(),
                    references,
                    output_count: outputs,
                    input_output_count: input_outputs,
                    input_count: subpass.input_attachments.len(),
                    required_states,
                    bindings: AttachmentBindings::new(frame_count, reference_count),
                }
            })
            .collect();

        let subpass_count = info.subpasses.len() as SubpassIndex;
        state.pass_stage = Some(host.create_compute_pass_stage(&state.name, stage, subpass_count));

        generic_loads(
            &desc.output_attachments,
            &desc.input_output_attachments,
            &desc.input_attachments,
        )
    }
}

impl Framegraph {
    ///Compiles `stages` into passes and starts resolving their attachments.
    ///
    /// The graph must be empty, call [reset](Framegraph::reset) before compiling a new description. Texture loads are
    /// queued on `batch`, its finished signal fires once every pass received its attachments.
    pub fn compile(&mut self, stages: &[StageDescription], batch: &mut JobBatch) -> Result<(), FramegraphError> {
        assert!(self.passes.is_empty(), "Framegraph must be reset before it is compiled again");
        assert!(
            stages.len() < INVALID_PASS_INDEX as usize,
            "Too many stages: {}",
            stages.len()
        );

        let shared = self.shared.clone();
        let ctx = &shared.ctx;
        let targets = CompileTargets {
            render_output: ctx.render_output.attachment_identifier(),
            render_output_format: ctx.render_output.format(),
            graphics_queue: shared.graphics_queue,
            frame_count: shared.frame_count,
            trace: shared.config.trace_decisions,
        };

        shared.latch.begin();
        let table = std::mem::take(&mut *shared.attachments_mut());
        let mut compiler = PassCompiler::new(table, targets, stages.len());

        for (index, stage) in stages.iter().enumerate() {
            match compiler.compile_pass(index as PassIndex, stage) {
                Ok(state) => compiler.passes.push(state),
                Err(err) => {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to compile stage {}: {err}", stage.name);
                    let mut table = compiler.attachments;
                    table.reset();
                    *shared.attachments_mut() = table;
                    shared.latch.cancel();
                    return Err(err);
                }
            }
        }

        self.render_output = compiler.finish(ctx.render_output.present_layout(), ctx.render_output.present_queue_family());

        let mut loads = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let requests = compiler.create_pass(ctx.host.as_ref(), index as PassIndex, stage);
            debug_assert_eq!(
                requests.len(),
                compiler.passes[index].attachment_count as usize,
                "Pass {} loads a different number of attachments than it declares",
                stage.name
            );
            loads.push(requests);
        }

        let PassCompiler {
            attachments,
            passes,
            render_output_dependencies,
            ..
        } = compiler;
        *shared.attachments_mut() = attachments;
        self.render_output_dependencies = render_output_dependencies;

        for state in passes.iter() {
            if let Some(pass_stage) = state.pass_stage {
                self.stage_passes.insert(pass_stage, pass_stage);
                for stage in state.recording_stages() {
                    self.stage_passes.insert(stage, pass_stage);
                }
            }
        }

        let pending = passes.iter().map(|state| 1 + state.attachment_count).sum::<u32>();
        shared.latch.add(pending);
        self.passes = passes.into_iter().map(|state| Arc::new(PassInfo::new(state))).collect();

        for (pass, requests) in self.passes.iter().zip(loads) {
            for request in requests {
                queue_attachment_load(&shared, pass, request, batch, &mut self.requested_render_targets);
            }
        }

        //Every pass is declared, release their declaration units.
        for pass in self.passes.iter() {
            pass.complete_one(&shared);
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "Compiled {} passes, {} compilation tasks pending",
            self.passes.len(),
            shared.latch.pending() - 1
        );

        shared.latch.arm(batch.finished_or_insert());
        shared.latch.complete_one();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Usage {
    Output,
    InputOutput,
    Input,
}

///State a generic subpass expects an attachment in, widened to everything its layout allows.
fn generic_required_state(
    range: SubresourceRange,
    reference: PassAttachmentReference,
    usage: Usage,
    queue_family: u32,
) -> SubresourceStates {
    let depth = range.aspect.intersects(DEPTH_STENCIL);
    let (layout, stages, access) = match (usage, depth) {
        (Usage::Output, true) => {
            let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
            (layout, supported_stages_for_layout(layout), supported_access_for_layout(layout))
        }
        (Usage::Output, false) => {
            let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            (layout, supported_stages_for_layout(layout), supported_access_for_layout(layout))
        }
        (Usage::InputOutput, true) => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE,
        ),
        (Usage::InputOutput, false) => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE,
        ),
        (Usage::Input, true) => (
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::SHADER_READ,
        ),
        (Usage::Input, false) => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::SHADER_READ,
        ),
    };

    let stages = stages & supported_stages_for_layout(layout);
    let access = access & supported_access_for_layout(layout);

    let mut states = SubresourceStates::default();
    states.register_used_subresource_range(range);
    states.set_subresource_state(
        range,
        SubresourceState::new(layout, reference, stages, access, queue_family),
        Bucket::Current,
    );
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        description::{AttachmentDescription, ColorAttachmentDescription, DepthAttachmentDescription},
        ids::AttachmentIdentifier,
        interfaces::StageKey,
    };

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 32,
        height: 32,
    };
    const OUTPUT: AttachmentIdentifier = AttachmentIdentifier::new(0);
    const ALBEDO: AttachmentIdentifier = AttachmentIdentifier::new(1);
    const DEPTH: AttachmentIdentifier = AttachmentIdentifier::new(2);

    fn compiler() -> PassCompiler {
        PassCompiler::new(
            AttachmentTable::with_capacity(8),
            CompileTargets {
                render_output: OUTPUT,
                render_output_format: vk::Format::B8G8R8A8_SRGB,
                graphics_queue: 0,
                frame_count: 2,
                trace: true,
            },
            4,
        )
    }

    fn compile(compiler: &mut PassCompiler, stages: &[StageDescription]) {
        for (index, stage) in stages.iter().enumerate() {
            let state = compiler.compile_pass(index as PassIndex, stage).unwrap();
            compiler.passes.push(state);
        }
    }

    fn color_pass(name: &str, color: ColorAttachmentDescription) -> StageDescription {
        StageDescription::render_pass(
            name,
            None,
            RenderPassDescription {
                targets: RenderTargets {
                    color_attachments: vec![color],
                    ..Default::default()
                },
                input_attachments: Vec::new(),
            },
        )
    }

    #[test]
    fn load_and_store_decisions() {
        let unused = SubresourceState::default();
        assert_eq!(load_op(AttachmentFlags::CLEAR, &unused), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(load_op(AttachmentFlags::CAN_READ, &unused), vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(store_op(AttachmentFlags::CAN_STORE), vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(
            store_op(AttachmentFlags::CLEAR | AttachmentFlags::CAN_STORE),
            vk::AttachmentStoreOp::STORE
        );
        assert_eq!(store_op(AttachmentFlags::MUST_STORE), vk::AttachmentStoreOp::STORE);
        assert_eq!(
            depth_stencil_layout(vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::DONT_CARE),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            depth_stencil_stages(vk::AccessFlags::empty()),
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        );
    }

    #[test]
    #[should_panic(expected = "Attachment expecting read without prior pass")]
    fn must_read_without_writer_panics() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[color_pass(
                "reader",
                ColorAttachmentDescription::new(ALBEDO, EXTENT).with_flags(AttachmentFlags::MUST_READ),
            )],
        );
    }

    #[test]
    fn reader_upgrades_previous_writer() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[
                color_pass(
                    "writer",
                    ColorAttachmentDescription::new(ALBEDO, EXTENT).with_flags(AttachmentFlags::CAN_STORE),
                ),
                color_pass(
                    "reader",
                    ColorAttachmentDescription::new(ALBEDO, EXTENT)
                        .with_flags(AttachmentFlags::MUST_READ | AttachmentFlags::CAN_STORE),
                ),
            ],
        );

        let writer = compiler.passes[0].render_pass().unwrap();
        assert_eq!(writer.attachment_descriptions[0].store_op, vk::AttachmentStoreOp::STORE);
        let reader = compiler.passes[1].render_pass().unwrap();
        assert_eq!(reader.attachment_descriptions[0].load_op, vk::AttachmentLoadOp::LOAD);
        //The writer leaves the image in the layout the reader enters with.
        assert_eq!(
            writer.attachment_descriptions[0].final_layout,
            reader.attachment_descriptions[0].initial_layout
        );
        assert_eq!(
            writer.attachment_descriptions[0].final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(compiler.passes[1].gpu_dependencies.as_slice(), &[0]);
    }

    #[test]
    fn input_reader_rewrites_final_layout() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[
                color_pass(
                    "writer",
                    ColorAttachmentDescription::new(ALBEDO, EXTENT).with_clear([0.0; 4]),
                ),
                StageDescription::render_pass(
                    "reader",
                    None,
                    RenderPassDescription {
                        targets: RenderTargets {
                            color_attachments: vec![ColorAttachmentDescription::new(OUTPUT, EXTENT)],
                            ..Default::default()
                        },
                        input_attachments: vec![AttachmentDescription::input(
                            ALBEDO,
                            EXTENT,
                            SubresourceRange::color(),
                        )],
                    },
                ),
            ],
        );

        let writer = compiler.passes[0].render_pass().unwrap();
        assert_eq!(writer.attachment_descriptions[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(
            writer.attachment_descriptions[0].final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(compiler.passes[1].gpu_dependencies.as_slice(), &[0]);
    }

    #[test]
    #[should_panic(expected = "Input attachment must be processed by a prior stage")]
    fn render_input_without_writer_panics() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[StageDescription::render_pass(
                "reader",
                None,
                RenderPassDescription {
                    targets: RenderTargets {
                        color_attachments: vec![ColorAttachmentDescription::new(OUTPUT, EXTENT)],
                        ..Default::default()
                    },
                    input_attachments: vec![AttachmentDescription::input(
                        ALBEDO,
                        EXTENT,
                        SubresourceRange::color(),
                    )],
                },
            )],
        );
    }

    #[test]
    #[should_panic(expected = "Input attachment must be processed by a prior stage")]
    fn generic_input_without_writer_panics() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[StageDescription::generic(
                "copy",
                StageKey::default(),
                GenericPassDescription {
                    input_attachments: vec![AttachmentDescription::input(
                        ALBEDO,
                        EXTENT,
                        SubresourceRange::color(),
                    )],
                    ..Default::default()
                },
            )],
        );
    }

    #[test]
    fn too_many_attachments() {
        let mut compiler = compiler();
        let colors = (0..(MAXIMUM_ATTACHMENT_COUNT + 1) as u32)
            .map(|i| ColorAttachmentDescription::new(AttachmentIdentifier::new(10 + i), EXTENT))
            .collect();
        let stage = StageDescription::render_pass(
            "wide",
            None,
            RenderPassDescription {
                targets: RenderTargets {
                    color_attachments: colors,
                    ..Default::default()
                },
                input_attachments: Vec::new(),
            },
        );
        assert!(matches!(
            compiler.compile_pass(0, &stage),
            Err(FramegraphError::TooManyAttachments { count: 65 })
        ));
    }

    #[test]
    fn depth_then_depth_input() {
        let mut compiler = compiler();
        let depth_range = SubresourceRange::new(
            vk::ImageAspectFlags::DEPTH,
            Default::default(),
            Default::default(),
        );
        compile(
            &mut compiler,
            &[
                StageDescription::render_pass(
                    "prepass",
                    None,
                    RenderPassDescription {
                        targets: RenderTargets {
                            depth_attachment: Some(DepthAttachmentDescription::new(DEPTH, EXTENT).with_clear(1.0)),
                            ..Default::default()
                        },
                        input_attachments: Vec::new(),
                    },
                ),
                StageDescription::render_pass(
                    "lighting",
                    None,
                    RenderPassDescription {
                        targets: RenderTargets {
                            color_attachments: vec![ColorAttachmentDescription::new(OUTPUT, EXTENT)
                                .with_flags(AttachmentFlags::MUST_STORE)],
                            ..Default::default()
                        },
                        input_attachments: vec![AttachmentDescription::input(DEPTH, EXTENT, depth_range)],
                    },
                ),
            ],
        );

        let prepass = compiler.passes[0].render_pass().unwrap();
        assert_eq!(prepass.attachment_descriptions[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(
            prepass.attachment_descriptions[0].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        let lighting = &compiler.passes[1];
        assert_eq!(lighting.gpu_dependencies.as_slice(), &[0]);
        let info = lighting.render_pass().unwrap();
        assert_eq!(info.external_inputs.len(), 1);
        assert_eq!(info.external_inputs[0].attachment, 1);
        assert_eq!(compiler.render_output_dependencies.as_slice(), &[1]);
    }

    #[test]
    fn subpass_chain() {
        let descriptions = vec![
            vk::AttachmentDescription {
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                ..Default::default()
            },
            vk::AttachmentDescription {
                load_op: vk::AttachmentLoadOp::LOAD,
                ..Default::default()
            },
        ];
        let subpasses = vec![
            RenderSubpassDescription {
                color_attachment_indices: vec![0],
                ..Default::default()
            },
            RenderSubpassDescription {
                color_attachment_indices: vec![1],
                subpass_input_attachment_indices: vec![0],
                ..Default::default()
            },
        ];

        let dependencies = subpass_dependencies(&subpasses, &descriptions, 2);
        assert_eq!(dependencies.len(), 3);
        assert_eq!(dependencies[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependencies[0].dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dependencies[1].src_subpass, 0);
        assert_eq!(
            dependencies[1].dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_READ
        );
        assert_eq!(dependencies[2].dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependencies[2].src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(dependencies
            .iter()
            .all(|d| d.dependency_flags == vk::DependencyFlags::BY_REGION));
    }

    #[test]
    fn finish_presents_and_restores() {
        let mut compiler = compiler();
        compile(
            &mut compiler,
            &[color_pass(
                "final",
                ColorAttachmentDescription::new(OUTPUT, EXTENT).with_clear([0.0; 4]),
            )],
        );
        let usage = compiler.finish(vk::ImageLayout::PRESENT_SRC_KHR, 0);
        assert_eq!(usage.first_pass, Some(0));
        assert_eq!(usage.last_pass, Some(0));

        let pass = compiler.passes[0].render_pass().unwrap();
        assert_eq!(pass.attachment_descriptions[0].format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(pass.attachment_descriptions[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(pass.attachment_descriptions[0].store_op, vk::AttachmentStoreOp::STORE);
    }
}
