//! Everything the framegraph consumes from the outside world.
//!
//! The framegraph never talks to a GPU or a thread pool directly. Scheduling goes through [JobRunner] and [JobGraph],
//! render targets are provided by a [TextureCache], image views and barriers by the [Device], and the concrete pass
//! objects that record commands live behind a [StageHost].
//!
//! All collaborators are shared between the compiling thread and the threads the texture cache calls back on, which is
//! why every trait requires `Send + Sync`.

use std::sync::Arc;

use ash::vk;

use crate::{
    ids::{AttachmentIdentifier, FrameIndex, SubpassIndex, TextureIdentifier},
    latch::StageSignal,
    pass::ExternalInputState,
    range::{ArrayRange, MipRange, SubresourceRange},
    state::SubresourceStates,
};

slotmap::new_key_type! {
    ///Names a stage (or job) of the scheduler's dependency graph.
    pub struct StageKey;
}

///Unit of work that can be handed to the [JobRunner].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

///Kind of dependency between two scheduler stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    ///Plain "runs after" edge.
    Job,
    ///CPU recording of `to` must wait for `from`.
    Cpu,
    ///GPU submission of `to` must wait for `from`.
    Gpu,
}

pub trait JobRunner: Send + Sync {
    ///Runs one queued job on the current thread. Returns false if there was nothing to run.
    fn run_next_job(&self) -> bool;
    ///True if the calling thread is one of the runner's worker threads.
    fn is_worker_thread(&self) -> bool;
    fn queue(&self, job: Job);
}

pub trait JobGraph: Send + Sync {
    fn add_edge(&self, from: StageKey, to: StageKey, kind: EdgeKind);
    fn remove_edge(&self, from: StageKey, to: StageKey, kind: EdgeKind);
    ///True if `to` already runs directly after `from`, regardless of the edge kind.
    fn is_directly_followed_by(&self, from: StageKey, to: StageKey) -> bool;
    ///Job that submits the recorded work of `stage`.
    fn submit_job(&self, stage: StageKey) -> StageKey;
    ///Stage that is signaled once the GPU finished the work of `stage`.
    fn finished_execution_stage(&self, stage: StageKey) -> StageKey;
}

///Fixed stages every frame passes through. Provided by the caller, wired by [Framegraph::new](crate::Framegraph::new).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramegraphStages {
    pub start: StageKey,
    pub end: StageKey,
    pub finish_gpu: StageKey,
    pub acquire: StageKey,
    pub present: StageKey,
}

///Jobs created while compiling.
///
/// Texture loads are queued to run after the batch's start, the `finished` signal fires once every
/// attachment of the compiled graph is resolved.
#[derive(Default)]
pub struct JobBatch {
    after_start: Vec<Job>,
    finished: Option<Arc<StageSignal>>,
}

impl JobBatch {
    pub fn new() -> Self {
        Self::default()
    }

    ///Uses `signal` as the batch's finished stage instead of creating a new one.
    pub fn with_finished_signal(signal: Arc<StageSignal>) -> Self {
        JobBatch {
            after_start: Vec::new(),
            finished: Some(signal),
        }
    }

    pub fn queue_after_start(&mut self, job: Job) {
        self.after_start.push(job);
    }

    pub fn take_after_start(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.after_start)
    }

    pub fn after_start_count(&self) -> usize {
        self.after_start.len()
    }

    pub fn finished_signal(&self) -> Option<&Arc<StageSignal>> {
        self.finished.as_ref()
    }

    pub(crate) fn finished_or_insert(&mut self) -> Arc<StageSignal> {
        self.finished
            .get_or_insert_with(|| Arc::new(StageSignal::new()))
            .clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueFamily {
    Graphics,
    Transfer,
    Compute,
}

///A render target that was resolved by the [TextureCache].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTexture {
    pub identifier: TextureIdentifier,
    pub image: vk::Image,
    pub format: vk::Format,
    ///Mips that are available on the image.
    pub mips: MipRange,
    pub layers: ArrayRange,
}

impl RenderTexture {
    pub fn is_valid(&self) -> bool {
        self.image != vk::Image::null()
    }
}

///Called once a render target is loaded. May be called on any thread.
pub type RenderTargetCallback = Box<dyn FnOnce(RenderTexture) + Send + 'static>;

pub trait TextureCache: Send + Sync {
    fn find_or_register_render_target_template(&self, attachment: AttachmentIdentifier) -> TextureIdentifier;
    fn find_render_target(&self, attachment: AttachmentIdentifier) -> Option<TextureIdentifier>;
    ///Requests the render target `texture`. Either calls `on_loaded` right away, or returns the job that will.
    #[allow(clippy::too_many_arguments)]
    fn get_or_load_render_target(
        &self,
        texture: TextureIdentifier,
        attachment: AttachmentIdentifier,
        samples: vk::SampleCountFlags,
        extent: vk::Extent2D,
        mips: MipRange,
        layers: ArrayRange,
        on_loaded: RenderTargetCallback,
    ) -> Option<Job>;
    fn destroy_render_target(&self, texture: TextureIdentifier);
    ///Drops any pending `on_loaded` callback for `texture`.
    fn remove_render_texture_listener(&self, texture: TextureIdentifier);
}

///The swapchain-like image set the final passes render into.
pub trait RenderOutput: Send + Sync {
    fn attachment_identifier(&self) -> AttachmentIdentifier;
    fn format(&self) -> vk::Format;
    fn extent(&self) -> vk::Extent2D;
    fn image_count(&self) -> FrameIndex;
    ///One view per frame.
    fn image_views(&self) -> Vec<vk::ImageView>;
    fn present_layout(&self) -> vk::ImageLayout;
    fn present_queue_family(&self) -> u32;
}

pub trait Device: Send + Sync {
    fn queue_family(&self, family: QueueFamily) -> Option<u32>;
    fn create_image_mapping(
        &self,
        texture: &RenderTexture,
        view_type: vk::ImageViewType,
        format: vk::Format,
        range: SubresourceRange,
    ) -> vk::ImageView;
    fn destroy_image_mapping(&self, view: vk::ImageView);
    ///Records and submits a single layout transition. `on_finished` runs once the GPU executed it.
    fn submit_layout_transition(
        &self,
        texture: &RenderTexture,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
        range: SubresourceRange,
        on_finished: Job,
    );
}

///Clear value of a single render pass attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ClearValue {
    #[default]
    None,
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(&self) -> vk::ClearValue {
        match self {
            ClearValue::None => vk::ClearValue::default(),
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32: *float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: *depth,
                    stencil: *stencil,
                },
            },
        }
    }
}

///Attachment references of one subpass, in the order they are handed to the render pass.
#[derive(Clone, Debug)]
pub struct SubpassLayout<'a> {
    pub color_attachments: &'a [vk::AttachmentReference],
    pub depth_attachment: Option<vk::AttachmentReference>,
    pub input_attachments: &'a [vk::AttachmentReference],
}

///Everything needed to create the API render pass object.
#[derive(Clone, Debug)]
pub struct RenderPassLayout<'a> {
    pub attachments: &'a [vk::AttachmentDescription],
    pub subpasses: &'a [SubpassLayout<'a>],
    pub dependencies: &'a [vk::SubpassDependency],
    pub render_area: vk::Rect2D,
    ///States inputs from earlier passes are expected in.
    pub external_inputs: &'a [ExternalInputState],
}

///Resolved attachments of a single render subpass. All per-frame vectors have one entry per frame.
#[derive(Clone, Debug)]
pub struct RenderSubpassAttachments<'a> {
    pub subpass: SubpassIndex,
    pub render_area: vk::Extent2D,
    pub color_views: Vec<&'a [vk::ImageView]>,
    ///Null if the subpass has no depth attachment.
    pub depth_views: Vec<vk::ImageView>,
    pub subpass_input_views: Vec<&'a [vk::ImageView]>,
    pub external_input_views: Vec<&'a [vk::ImageView]>,
    pub external_input_extents: Vec<vk::Extent2D>,
    ///Textures behind the color views, None for the render output.
    pub color_textures: &'a [Option<RenderTexture>],
}

///Resolved attachments of a generic or compute subpass.
#[derive(Clone, Debug)]
pub struct SubpassAttachments<'a> {
    pub subpass: SubpassIndex,
    pub output_views: Vec<&'a [vk::ImageView]>,
    pub input_output_views: Vec<&'a [vk::ImageView]>,
    pub input_views: Vec<&'a [vk::ImageView]>,
    pub output_extents: &'a [vk::Extent2D],
    pub input_output_extents: &'a [vk::Extent2D],
    pub input_extents: &'a [vk::Extent2D],
    ///State each referenced attachment must be in while the subpass executes.
    pub required_states: &'a [SubresourceStates],
}

///Owner of the pass objects that record commands.
pub trait StageHost: Send + Sync {
    ///Creates the stage of a render pass. `subpass_stages` lists the stages recording into each subpass.
    fn create_render_pass_stage(
        &self,
        name: &str,
        clear_values: &[ClearValue],
        subpass_stages: &[Vec<StageKey>],
    ) -> StageKey;
    fn create_generic_pass_stage(&self, name: &str, stage: StageKey) -> StageKey;
    fn create_compute_pass_stage(&self, name: &str, stage: StageKey, subpass_count: SubpassIndex) -> StageKey;

    ///Creates the API render pass once every attachment's format is known. A returned job is run before the
    /// pass counts as compiled.
    fn initialize_render_pass(&self, pass_stage: StageKey, layout: &RenderPassLayout<'_>) -> Option<Job>;
    ///All render pass attachments, one slice per frame.
    fn on_pass_attachments_loaded(&self, pass_stage: StageKey, views: &[&[vk::ImageView]], render_area: vk::Extent2D);
    fn on_render_subpass_attachments_loaded(&self, stage: StageKey, attachments: &RenderSubpassAttachments<'_>);
    fn on_generic_pass_attachments_loaded(&self, stage: StageKey, attachments: &SubpassAttachments<'_>);
    fn on_compute_subpass_attachments_loaded(&self, stage: StageKey, attachments: &SubpassAttachments<'_>);
    ///Image views handed out before are invalid after this call.
    fn on_before_pass_destroyed(&self, stage: StageKey);
}

///Bundle of all collaborators of a [Framegraph](crate::Framegraph).
#[derive(Clone)]
pub struct FramegraphContext {
    pub device: Arc<dyn Device>,
    pub texture_cache: Arc<dyn TextureCache>,
    pub render_output: Arc<dyn RenderOutput>,
    pub host: Arc<dyn StageHost>,
    pub runner: Arc<dyn JobRunner>,
    pub graph: Arc<dyn JobGraph>,
}
