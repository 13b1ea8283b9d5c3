//! In-memory implementations of every collaborator, so compilation and the runtime can be exercised without a GPU.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use ahash::{AHashMap, AHashSet};
use ash::vk::{self, Handle};
use slotmap::SlotMap;

use crate::{
    ids::{AttachmentIdentifier, DenseIdentifier, FrameIndex, TextureIdentifier},
    pass::PassInfo,
    interfaces::{
        ClearValue, Device, EdgeKind, FramegraphContext, FramegraphStages, Job, JobGraph, JobRunner, QueueFamily,
        RenderOutput, RenderPassLayout, RenderSubpassAttachments, RenderTargetCallback, RenderTexture, StageHost,
        StageKey, SubpassAttachments, TextureCache,
    },
    range::{ArrayRange, MipRange, SubresourceRange},
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

///Prints the compiler's decisions when running tests with `--nocapture`. Only the first call installs the logger.
#[cfg(feature = "logging")]
pub fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Trace)
        .init();
}

#[derive(Default)]
pub struct MockDevice {
    next_view: AtomicU64,
    live: AtomicUsize,
    transitions: Mutex<Vec<(TextureIdentifier, vk::ImageLayout)>>,
    no_graphics_queue: bool,
}

impl MockDevice {
    pub fn without_graphics_queue() -> Self {
        MockDevice {
            no_graphics_queue: true,
            ..Default::default()
        }
    }

    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn transitions(&self) -> Vec<(TextureIdentifier, vk::ImageLayout)> {
        locked(&self.transitions).clone()
    }
}

impl Device for MockDevice {
    fn queue_family(&self, family: QueueFamily) -> Option<u32> {
        match family {
            QueueFamily::Graphics if self.no_graphics_queue => None,
            QueueFamily::Graphics => Some(0),
            QueueFamily::Compute => Some(1),
            QueueFamily::Transfer => Some(2),
        }
    }

    fn create_image_mapping(
        &self,
        _texture: &RenderTexture,
        _view_type: vk::ImageViewType,
        _format: vk::Format,
        _range: SubresourceRange,
    ) -> vk::ImageView {
        self.live.fetch_add(1, Ordering::SeqCst);
        vk::ImageView::from_raw(0x1000 + self.next_view.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy_image_mapping(&self, view: vk::ImageView) {
        assert!(view != vk::ImageView::null());
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn submit_layout_transition(
        &self,
        texture: &RenderTexture,
        _stages: vk::PipelineStageFlags,
        _access: vk::AccessFlags,
        layout: vk::ImageLayout,
        _range: SubresourceRange,
        on_finished: Job,
    ) {
        locked(&self.transitions).push((texture.identifier, layout));
        on_finished();
    }
}

///Resolves render targets right away, or keeps the callbacks until [MockTextureCache::resolve_all] if deferred.
#[derive(Default)]
pub struct MockTextureCache {
    deferred: bool,
    formats: Mutex<AHashMap<AttachmentIdentifier, vk::Format>>,
    pending: Mutex<Vec<(RenderTexture, RenderTargetCallback)>>,
    registered: Mutex<AHashSet<AttachmentIdentifier>>,
    destroyed: Mutex<Vec<TextureIdentifier>>,
    removed_listeners: Mutex<Vec<TextureIdentifier>>,
}

impl MockTextureCache {
    pub fn deferred() -> Self {
        MockTextureCache {
            deferred: true,
            ..Default::default()
        }
    }

    pub fn set_format(&self, attachment: AttachmentIdentifier, format: vk::Format) {
        locked(&self.formats).insert(attachment, format);
    }

    pub fn pending_loads(&self) -> usize {
        locked(&self.pending).len()
    }

    ///Calls every held callback, in request order.
    pub fn resolve_all(&self) {
        let pending = std::mem::take(&mut *locked(&self.pending));
        for (texture, callback) in pending {
            callback(texture);
        }
    }

    pub fn destroyed(&self) -> Vec<TextureIdentifier> {
        locked(&self.destroyed).clone()
    }

    pub fn removed_listeners(&self) -> Vec<TextureIdentifier> {
        locked(&self.removed_listeners).clone()
    }
}

impl TextureCache for MockTextureCache {
    fn find_or_register_render_target_template(&self, attachment: AttachmentIdentifier) -> TextureIdentifier {
        locked(&self.registered).insert(attachment);
        TextureIdentifier::from_index(attachment.index())
    }

    fn find_render_target(&self, attachment: AttachmentIdentifier) -> Option<TextureIdentifier> {
        locked(&self.registered)
            .contains(&attachment)
            .then(|| TextureIdentifier::from_index(attachment.index()))
    }

    fn get_or_load_render_target(
        &self,
        texture: TextureIdentifier,
        attachment: AttachmentIdentifier,
        _samples: vk::SampleCountFlags,
        _extent: vk::Extent2D,
        mips: MipRange,
        layers: ArrayRange,
        on_loaded: RenderTargetCallback,
    ) -> Option<Job> {
        let format = locked(&self.formats)
            .get(&attachment)
            .copied()
            .unwrap_or(vk::Format::R8G8B8A8_UNORM);
        let loaded = RenderTexture {
            identifier: texture,
            image: vk::Image::from_raw(0x100 + texture.index() as u64),
            format,
            mips,
            layers,
        };
        if self.deferred {
            locked(&self.pending).push((loaded, on_loaded));
        } else {
            on_loaded(loaded);
        }
        None
    }

    fn destroy_render_target(&self, texture: TextureIdentifier) {
        locked(&self.destroyed).push(texture);
    }

    fn remove_render_texture_listener(&self, texture: TextureIdentifier) {
        locked(&self.removed_listeners).push(texture);
        locked(&self.pending).retain(|(loaded, _)| loaded.identifier != texture);
    }
}

pub struct MockRenderOutput {
    pub identifier: AttachmentIdentifier,
    pub image_count: FrameIndex,
}

impl RenderOutput for MockRenderOutput {
    fn attachment_identifier(&self) -> AttachmentIdentifier {
        self.identifier
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_SRGB
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: 64,
            height: 64,
        }
    }

    fn image_count(&self) -> FrameIndex {
        self.image_count
    }

    fn image_views(&self) -> Vec<vk::ImageView> {
        (0..self.image_count)
            .map(|frame| vk::ImageView::from_raw(0x10 + frame as u64))
            .collect()
    }

    fn present_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::PRESENT_SRC_KHR
    }

    fn present_queue_family(&self) -> u32 {
        0
    }
}

///Runs queued jobs only when asked to, on the asking thread.
#[derive(Default)]
pub struct MockRunner {
    jobs: Mutex<VecDeque<Job>>,
}

impl MockRunner {
    pub fn queued(&self) -> usize {
        locked(&self.jobs).len()
    }
}

impl JobRunner for MockRunner {
    fn run_next_job(&self) -> bool {
        let job = locked(&self.jobs).pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    fn is_worker_thread(&self) -> bool {
        true
    }

    fn queue(&self, job: Job) {
        locked(&self.jobs).push_back(job);
    }
}

///Edge set plus the key allocator every other mock shares.
#[derive(Default)]
pub struct MockGraph {
    keys: Mutex<SlotMap<StageKey, ()>>,
    edges: Mutex<AHashSet<(StageKey, StageKey, EdgeKind)>>,
    ///stage -> (submit job, finished execution stage)
    derived: Mutex<AHashMap<StageKey, (StageKey, StageKey)>>,
}

impl MockGraph {
    pub fn new_stage(&self) -> StageKey {
        locked(&self.keys).insert(())
    }

    pub fn edges(&self) -> AHashSet<(StageKey, StageKey, EdgeKind)> {
        locked(&self.edges).clone()
    }

    pub fn has_edge(&self, from: StageKey, to: StageKey, kind: EdgeKind) -> bool {
        locked(&self.edges).contains(&(from, to, kind))
    }

    fn derived(&self, stage: StageKey) -> (StageKey, StageKey) {
        if let Some(derived) = locked(&self.derived).get(&stage) {
            return *derived;
        }
        let derived = (self.new_stage(), self.new_stage());
        locked(&self.derived).insert(stage, derived);
        derived
    }
}

impl JobGraph for MockGraph {
    fn add_edge(&self, from: StageKey, to: StageKey, kind: EdgeKind) {
        locked(&self.edges).insert((from, to, kind));
    }

    fn remove_edge(&self, from: StageKey, to: StageKey, kind: EdgeKind) {
        locked(&self.edges).remove(&(from, to, kind));
    }

    fn is_directly_followed_by(&self, from: StageKey, to: StageKey) -> bool {
        locked(&self.edges).iter().any(|(f, t, _)| *f == from && *t == to)
    }

    fn submit_job(&self, stage: StageKey) -> StageKey {
        self.derived(stage).0
    }

    fn finished_execution_stage(&self, stage: StageKey) -> StageKey {
        self.derived(stage).1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Created(String, StageKey),
    ///Pass stage and number of attachments.
    RenderPassInitialized(StageKey, usize),
    PassAttachmentsLoaded(StageKey),
    RenderSubpassLoaded(StageKey, usize),
    GenericLoaded(StageKey, usize),
    ComputeSubpassLoaded(StageKey, usize),
    Destroyed(StageKey),
}

pub struct MockHost {
    graph: Arc<MockGraph>,
    events: Mutex<Vec<HostEvent>>,
    clear_values: Mutex<Vec<Vec<ClearValue>>>,
    ///Passes checked for a held lock on every callback.
    watched: Mutex<Vec<Arc<PassInfo>>>,
    callbacks_under_lock: AtomicUsize,
}

impl MockHost {
    pub fn new(graph: Arc<MockGraph>) -> Self {
        MockHost {
            graph,
            events: Mutex::new(Vec::new()),
            clear_values: Mutex::new(Vec::new()),
            watched: Mutex::new(Vec::new()),
            callbacks_under_lock: AtomicUsize::new(0),
        }
    }

    pub fn watch(&self, passes: &[Arc<PassInfo>]) {
        locked(&self.watched).extend(passes.iter().cloned());
    }

    ///Number of callbacks that ran while one of the watched passes was locked.
    pub fn callbacks_under_lock(&self) -> usize {
        self.callbacks_under_lock.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<HostEvent> {
        locked(&self.events).clone()
    }

    pub fn clear_values(&self) -> Vec<Vec<ClearValue>> {
        locked(&self.clear_values).clone()
    }

    fn create(&self, name: &str) -> StageKey {
        let stage = self.graph.new_stage();
        locked(&self.events).push(HostEvent::Created(name.to_owned(), stage));
        stage
    }

    fn push(&self, event: HostEvent) {
        if locked(&self.watched).iter().any(|pass| pass.is_locked()) {
            self.callbacks_under_lock.fetch_add(1, Ordering::SeqCst);
        }
        locked(&self.events).push(event);
    }
}

impl StageHost for MockHost {
    fn create_render_pass_stage(
        &self,
        name: &str,
        clear_values: &[ClearValue],
        _subpass_stages: &[Vec<StageKey>],
    ) -> StageKey {
        locked(&self.clear_values).push(clear_values.to_vec());
        self.create(name)
    }

    fn create_generic_pass_stage(&self, name: &str, _stage: StageKey) -> StageKey {
        self.create(name)
    }

    fn create_compute_pass_stage(&self, name: &str, _stage: StageKey, _subpass_count: u8) -> StageKey {
        self.create(name)
    }

    fn initialize_render_pass(&self, pass_stage: StageKey, layout: &RenderPassLayout<'_>) -> Option<Job> {
        self.push(HostEvent::RenderPassInitialized(pass_stage, layout.attachments.len()));
        None
    }

    fn on_pass_attachments_loaded(&self, pass_stage: StageKey, views: &[&[vk::ImageView]], _render_area: vk::Extent2D) {
        assert!(views.iter().all(|frame| frame.iter().all(|v| *v != vk::ImageView::null())));
        self.push(HostEvent::PassAttachmentsLoaded(pass_stage));
    }

    fn on_render_subpass_attachments_loaded(&self, stage: StageKey, attachments: &RenderSubpassAttachments<'_>) {
        self.push(HostEvent::RenderSubpassLoaded(stage, attachments.subpass as usize));
    }

    fn on_generic_pass_attachments_loaded(&self, stage: StageKey, attachments: &SubpassAttachments<'_>) {
        self.push(HostEvent::GenericLoaded(stage, attachments.subpass as usize));
    }

    fn on_compute_subpass_attachments_loaded(&self, stage: StageKey, attachments: &SubpassAttachments<'_>) {
        self.push(HostEvent::ComputeSubpassLoaded(stage, attachments.subpass as usize));
    }

    fn on_before_pass_destroyed(&self, stage: StageKey) {
        self.push(HostEvent::Destroyed(stage));
    }
}

///All mocks wired together.
pub struct MockEnvironment {
    pub device: Arc<MockDevice>,
    pub cache: Arc<MockTextureCache>,
    pub output: Arc<MockRenderOutput>,
    pub host: Arc<MockHost>,
    pub runner: Arc<MockRunner>,
    pub graph: Arc<MockGraph>,
    pub stages: FramegraphStages,
}

pub const RENDER_OUTPUT: AttachmentIdentifier = AttachmentIdentifier::new(0);

impl MockEnvironment {
    pub fn new() -> Self {
        Self::with_parts(MockDevice::default(), MockTextureCache::default(), 1)
    }

    pub fn with_parts(device: MockDevice, cache: MockTextureCache, image_count: FrameIndex) -> Self {
        #[cfg(feature = "logging")]
        init_logging();
        let graph = Arc::new(MockGraph::default());
        let stages = FramegraphStages {
            start: graph.new_stage(),
            end: graph.new_stage(),
            finish_gpu: graph.new_stage(),
            acquire: graph.new_stage(),
            present: graph.new_stage(),
        };
        MockEnvironment {
            device: Arc::new(device),
            cache: Arc::new(cache),
            output: Arc::new(MockRenderOutput {
                identifier: RENDER_OUTPUT,
                image_count,
            }),
            host: Arc::new(MockHost::new(graph.clone())),
            runner: Arc::new(MockRunner::default()),
            graph,
            stages,
        }
    }

    pub fn context(&self) -> FramegraphContext {
        FramegraphContext {
            device: self.device.clone(),
            texture_cache: self.cache.clone(),
            render_output: self.output.clone(),
            host: self.host.clone(),
            runner: self.runner.clone(),
            graph: self.graph.clone(),
        }
    }
}
