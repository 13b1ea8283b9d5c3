//! The [Framegraph] itself: wiring compiled passes into the scheduler and tracking which frames are in flight.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    attachment::AttachmentTable,
    compiler::RenderOutputUsage,
    config::FramegraphConfig,
    description::StageType,
    error::FramegraphError,
    ids::{AttachmentIdentifier, FrameIndex, FrameMask, IdentifierMask, PassIndex, TextureIdentifier, ALL_FRAMES_MASK},
    interfaces::{EdgeKind, FramegraphContext, FramegraphStages, QueueFamily, StageKey},
    latch::CompletionLatch,
    pass::PassInfo,
    range::SubresourceRange,
    state::SubresourceState,
};

///State shared with the asynchronous attachment callbacks.
pub(crate) struct Shared {
    pub ctx: FramegraphContext,
    pub config: FramegraphConfig,
    pub latch: CompletionLatch,
    pub attachments: RwLock<AttachmentTable>,
    pub frame_count: FrameIndex,
    pub graphics_queue: u32,
}

impl Shared {
    pub fn attachments(&self) -> RwLockReadGuard<'_, AttachmentTable> {
        self.attachments.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attachments_mut(&self) -> RwLockWriteGuard<'_, AttachmentTable> {
        self.attachments.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    ///Runs other work until every task of the current compilation has finished.
    pub fn drain_pending_compilation(&self) {
        #[cfg(feature = "logging")]
        if self.latch.pending() != 0 && !self.ctx.runner.is_worker_thread() {
            log::warn!("Draining {} compilation tasks outside of a worker thread", self.latch.pending());
        }
        while self.latch.pending() != 0 {
            if !(self.ctx.runner.is_worker_thread() && self.ctx.runner.run_next_job()) {
                std::hint::spin_loop();
            }
        }
    }
}

///Read-only view of a compiled pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassSummary {
    pub name: String,
    pub stage_type: StageType,
    pub pass_stage: Option<StageKey>,
    pub cpu_dependencies: Vec<PassIndex>,
    pub gpu_dependencies: Vec<PassIndex>,
    pub attachments: Vec<AttachmentIdentifier>,
    ///Attachments that are not resolved yet, plus one while the pass is being declared.
    pub pending: u32,
}

///Compiles a list of stage descriptions into passes and hooks them into the scheduler.
///
/// A framegraph is compiled once, then [enabled](Framegraph::enable) for as long as the description does not change.
/// Changing the description requires [reset](Framegraph::reset) followed by another [compile](Framegraph::compile).
///
/// Only a single frame may be processed at a time.
pub struct Framegraph {
    pub(crate) shared: Arc<Shared>,
    pub(crate) stages: FramegraphStages,
    pub(crate) passes: Vec<Arc<PassInfo>>,
    ///Recording stage -> pass stage
    pub(crate) stage_passes: AHashMap<StageKey, StageKey>,
    pub(crate) requested_render_targets: IdentifierMask<TextureIdentifier>,
    pub(crate) render_output: RenderOutputUsage,
    pub(crate) render_output_dependencies: SmallVec<[PassIndex; 4]>,
    ///Edges added by [enable](Framegraph::enable), removed again on disable.
    wired_edges: Vec<(StageKey, StageKey, EdgeKind)>,
    enabled: bool,
    processing_cpu: AtomicU32,
    processing_gpu: AtomicU32,
}

impl Framegraph {
    pub fn new(
        ctx: FramegraphContext,
        stages: FramegraphStages,
        config: FramegraphConfig,
    ) -> Result<Self, FramegraphError> {
        let frame_count = ctx.render_output.image_count();
        if frame_count == 0 {
            return Err(FramegraphError::InvalidRenderOutput);
        }
        if frame_count as usize > config.maximum_frames_in_flight {
            return Err(FramegraphError::TooManyFrames {
                count: frame_count as usize,
                maximum: config.maximum_frames_in_flight,
            });
        }
        let graphics_queue = ctx
            .device
            .queue_family(QueueFamily::Graphics)
            .ok_or(FramegraphError::NoQueueFamily(QueueFamily::Graphics))?;

        ctx.graph.add_edge(stages.start, stages.finish_gpu, EdgeKind::Job);
        ctx.graph.add_edge(stages.start, stages.end, EdgeKind::Job);

        #[cfg(feature = "logging")]
        log::debug!("Created framegraph with {frame_count} frames, graphics queue {graphics_queue}");

        let attachments = AttachmentTable::with_capacity(config.attachment_capacity);
        Ok(Framegraph {
            shared: Arc::new(Shared {
                ctx,
                config,
                latch: CompletionLatch::new(),
                attachments: RwLock::new(attachments),
                frame_count,
                graphics_queue,
            }),
            stages,
            passes: Vec::new(),
            stage_passes: AHashMap::default(),
            requested_render_targets: IdentifierMask::default(),
            render_output: RenderOutputUsage::default(),
            render_output_dependencies: SmallVec::new(),
            wired_edges: Vec::new(),
            enabled: false,
            processing_cpu: AtomicU32::new(0),
            processing_gpu: AtomicU32::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_processing_frames(&self) -> bool {
        (self.processing_cpu.load(Ordering::Acquire) | self.processing_gpu.load(Ordering::Acquire)) != 0
    }

    pub fn has_pending_compilation_tasks(&self) -> bool {
        self.shared.latch.pending() != 0
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    ///Pass stage that owns `stage`. `stage` may be a pass stage or any stage recording into a pass.
    pub fn get_stage_pass(&self, stage: StageKey) -> Option<StageKey> {
        self.stage_passes.get(&stage).copied()
    }

    pub fn pass_summary(&self, index: PassIndex) -> Option<PassSummary> {
        let pass = self.passes.get(index as usize)?;
        let pending = pass.pending();
        let state = pass.lock();
        Some(PassSummary {
            name: state.name.clone(),
            stage_type: state.stage_type,
            pass_stage: state.pass_stage,
            cpu_dependencies: state.cpu_dependencies.to_vec(),
            gpu_dependencies: state.gpu_dependencies.to_vec(),
            attachments: state.attachments.clone(),
            pending,
        })
    }

    ///Render pass attachment descriptions of pass `index`, as they will be handed to the host.
    pub fn render_pass_attachments(&self, index: PassIndex) -> Option<Vec<ash::vk::AttachmentDescription>> {
        let pass = self.passes.get(index as usize)?;
        let state = pass.lock();
        state.render_pass().map(|info| info.attachment_descriptions.clone())
    }

    ///State `range` of `attachment` ends the frame in, if uniform.
    pub fn uniform_attachment_state(
        &self,
        attachment: AttachmentIdentifier,
        range: SubresourceRange,
    ) -> Option<SubresourceState> {
        self.shared
            .attachments()
            .get(attachment)
            .and_then(|info| info.get_uniform_subresource_state(range))
    }

    ///First and last pass touching the render output.
    pub fn render_output_passes(&self) -> (Option<PassIndex>, Option<PassIndex>) {
        (self.render_output.first_pass, self.render_output.last_pass)
    }

    fn pass_stage(&self, index: PassIndex) -> Option<StageKey> {
        self.passes.get(index as usize).and_then(|pass| pass.lock().pass_stage)
    }

    fn wire(&mut self, from: StageKey, to: StageKey, kind: EdgeKind) {
        self.shared.ctx.graph.add_edge(from, to, kind);
        self.wired_edges.push((from, to, kind));
    }

    ///Adds `from -> to` unless `to` already runs directly after `from`.
    fn wire_if_unordered(&mut self, from: StageKey, to: StageKey, kind: EdgeKind) {
        if !self.shared.ctx.graph.is_directly_followed_by(from, to) {
            self.wire(from, to, kind);
        }
    }

    ///Adds the dependencies of every compiled pass to the scheduler.
    pub fn enable(&mut self) {
        assert!(!self.is_processing_frames(), "Can not enable a framegraph while frames are processed");
        if self.enabled {
            return;
        }
        let graph = self.shared.ctx.graph.clone();
        let stages = self.stages;

        if let Some(first) = self.render_output.first_pass.and_then(|index| self.pass_stage(index)) {
            self.wire(stages.start, stages.acquire, EdgeKind::Job);
            self.wire(stages.acquire, first, EdgeKind::Gpu);
        }

        for index in 0..self.passes.len() {
            let (pass_stage, cpu_dependencies, gpu_dependencies, recording_stages) = {
                let state = self.passes[index].lock();
                let Some(pass_stage) = state.pass_stage else {
                    panic!("Pass {} was compiled without a pass stage", state.name);
                };
                (
                    pass_stage,
                    state.cpu_dependencies.clone(),
                    state.gpu_dependencies.clone(),
                    state.recording_stages(),
                )
            };

            self.wire(stages.start, pass_stage, EdgeKind::Job);

            for dependency in cpu_dependencies {
                if let Some(dependency) = self.pass_stage(dependency) {
                    self.wire_if_unordered(dependency, pass_stage, EdgeKind::Cpu);
                }
            }
            for dependency in gpu_dependencies {
                if let Some(dependency) = self.pass_stage(dependency) {
                    let ordered = graph.is_directly_followed_by(dependency, pass_stage);
                    self.wire(dependency, pass_stage, EdgeKind::Gpu);
                    if !ordered {
                        self.wire(dependency, pass_stage, EdgeKind::Cpu);
                    }
                }
            }

            let pass_submit = graph.submit_job(pass_stage);
            let pass_finished = graph.finished_execution_stage(pass_stage);
            for stage in recording_stages {
                let submit = graph.submit_job(stage);
                let finished = graph.finished_execution_stage(stage);
                self.wire_if_unordered(pass_stage, stage, EdgeKind::Cpu);
                self.wire_if_unordered(pass_submit, submit, EdgeKind::Job);
                self.wire_if_unordered(pass_finished, finished, EdgeKind::Job);
                self.wire_if_unordered(finished, stages.finish_gpu, EdgeKind::Job);
                self.wire_if_unordered(submit, stages.end, EdgeKind::Job);
            }
            self.wire_if_unordered(pass_finished, stages.finish_gpu, EdgeKind::Job);
            self.wire_if_unordered(pass_submit, stages.end, EdgeKind::Job);
        }

        for index in self.render_output_dependencies.clone() {
            if let Some(pass_stage) = self.pass_stage(index) {
                self.wire_if_unordered(stages.acquire, pass_stage, EdgeKind::Cpu);
            }
        }

        if let Some(last) = self.render_output.last_pass.and_then(|index| self.pass_stage(index)) {
            self.wire(last, stages.present, EdgeKind::Gpu);
            self.wire(stages.present, stages.finish_gpu, EdgeKind::Job);
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "Enabled framegraph: {} passes, {} edges",
            self.passes.len(),
            self.wired_edges.len()
        );
        self.enabled = true;
    }

    ///Removes exactly the edges [enable](Framegraph::enable) added.
    pub fn disable(&mut self) {
        assert!(!self.is_processing_frames(), "Can not disable a framegraph while frames are processed");
        if !self.enabled {
            return;
        }
        let graph = self.shared.ctx.graph.clone();
        for (from, to, kind) in self.wired_edges.drain(..).rev() {
            graph.remove_edge(from, to, kind);
        }
        #[cfg(feature = "logging")]
        log::debug!("Disabled framegraph");
        self.enabled = false;
    }

    ///Destroys all compiled passes. Waits for outstanding attachment loads first.
    pub fn reset(&mut self) {
        assert!(!self.is_processing_frames(), "Can not reset a framegraph while frames are processed");
        self.disable();
        self.shared.drain_pending_compilation();

        let ctx = &self.shared.ctx;
        for pass in self.passes.drain(..) {
            let mut state = pass.lock();
            for stage in state.recording_stages() {
                ctx.host.on_before_pass_destroyed(stage);
            }
            if let Some(pass_stage) = state.pass_stage {
                ctx.host.on_before_pass_destroyed(pass_stage);
            }
            state.destroy_mappings(ctx.device.as_ref());
        }

        for texture in self.requested_render_targets.iter() {
            ctx.texture_cache.remove_render_texture_listener(texture);
        }
        self.requested_render_targets.clear_all();
        self.stage_passes.clear();
        self.render_output = RenderOutputUsage::default();
        self.render_output_dependencies.clear();
        self.shared.attachments_mut().reset();

        #[cfg(feature = "logging")]
        log::debug!("Reset framegraph");
    }

    ///Resets the graph and destroys every render target it requested, followed by the render output's own one. All of
    /// them are recreated at the new size by the next compilation.
    pub fn on_before_render_output_resize(&mut self) {
        let requested = self.requested_render_targets.clone();
        self.reset();
        let ctx = &self.shared.ctx;
        for texture in requested.iter() {
            ctx.texture_cache.destroy_render_target(texture);
        }
        if let Some(texture) = ctx
            .texture_cache
            .find_render_target(ctx.render_output.attachment_identifier())
        {
            ctx.texture_cache.destroy_render_target(texture);
        }
    }

    ///Runs other jobs until no frame in `mask` is processed anymore.
    pub fn wait_for_processing_frames_to_finish(&self, mask: FrameMask) {
        let runner = &self.shared.ctx.runner;
        while ((self.processing_cpu.load(Ordering::Acquire) | self.processing_gpu.load(Ordering::Acquire)) & mask) != 0 {
            if !(runner.is_worker_thread() && runner.run_next_job()) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn on_start_frame(&self, frame_index: FrameIndex) {
        assert!(
            (frame_index as u32) < FrameMask::BITS,
            "Frame index {frame_index} exceeds the frame mask"
        );
        //TODO: allow more than one frame in flight once the wiring in `enable` tracks frames separately.
        self.wait_for_processing_frames_to_finish(ALL_FRAMES_MASK);

        let bit: FrameMask = 1 << frame_index;
        let previous_cpu = self.processing_cpu.fetch_or(bit, Ordering::AcqRel);
        let previous_gpu = self.processing_gpu.fetch_or(bit, Ordering::AcqRel);
        assert!(
            previous_cpu == 0 && previous_gpu == 0,
            "Only a single frame may be in flight"
        );

        self.shared.drain_pending_compilation();
    }

    pub fn on_end_frame(&self, frame_index: FrameIndex) {
        let bit: FrameMask = 1 << frame_index;
        let previous = self.processing_cpu.fetch_and(!bit, Ordering::AcqRel);
        assert!(previous & bit != 0, "Frame {frame_index} ended on the CPU without being started");
    }

    pub fn on_finish_frame_gpu_execution(&self, frame_index: FrameIndex) {
        let bit: FrameMask = 1 << frame_index;
        let previous = self.processing_gpu.fetch_and(!bit, Ordering::AcqRel);
        assert!(previous & bit != 0, "Frame {frame_index} finished on the GPU without being started");
    }

    fn single_frame(mask: FrameMask) -> FrameIndex {
        assert!(mask.count_ones() == 1, "Expected exactly one processed frame, mask is {mask:#b}");
        mask.trailing_zeros() as FrameIndex
    }

    ///End-of-frame callback. Ends the single frame processed on the CPU.
    pub fn on_end_stage(&self) {
        self.on_end_frame(Self::single_frame(self.processing_cpu.load(Ordering::Acquire)));
    }

    ///GPU completion callback. Finishes the single frame processed on the GPU.
    pub fn on_finish_gpu_stage(&self) {
        self.on_finish_frame_gpu_execution(Self::single_frame(self.processing_gpu.load(Ordering::Acquire)));
    }
}

impl Drop for Framegraph {
    fn drop(&mut self) {
        self.reset();
        let graph = &self.shared.ctx.graph;
        graph.remove_edge(self.stages.start, self.stages.finish_gpu, EdgeKind::Job);
        graph.remove_edge(self.stages.start, self.stages.end, EdgeKind::Job);
    }
}
