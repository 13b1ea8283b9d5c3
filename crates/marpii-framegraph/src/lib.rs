//! # MarpII framegraph
//!
//! Compiles an ordered list of [StageDescription]s into passes. While compiling, every attachment is tracked per
//! aspect, mip level and array layer. From that the framegraph derives
//!
//! - load and store operations of render pass attachments,
//! - entry and final layouts, including the transition into the render output's present layout,
//! - CPU and GPU dependencies between passes.
//!
//! Once compiled, the attachments are resolved asynchronously through a [TextureCache]. Every pass hands its image views
//! to the [StageHost] as soon as all of them are loaded. [Framegraph::enable] then wires the passes into the
//! scheduler's [JobGraph].
//!
//! The framegraph never records commands itself. Everything that touches the GPU goes through the traits in
//! [interfaces].
//!
//! # Usage
//!
//! ```ignore
//! let mut framegraph = Framegraph::new(ctx, stages, FramegraphConfig::default())?;
//! let mut batch = JobBatch::new();
//! framegraph.compile(&descriptions, &mut batch)?;
//! framegraph.enable();
//! ```

pub use ash;

///Per attachment state bookkeeping of the compiler.
pub mod attachment;
mod compiler;
mod config;
///User side declaration of passes and attachments.
pub mod description;
mod error;
///Supported access/stage tables per image layout.
pub mod flags;
///Identifiers and dense indices.
pub mod ids;
///Everything the framegraph consumes from its environment.
pub mod interfaces;
mod latch;
mod loading;
///Compiled passes as handed to the [StageHost].
pub mod pass;
///Subresource ranges and format helpers.
pub mod range;
mod runtime;
///Fine grained subresource state tracking.
pub mod state;

#[cfg(test)]
mod testing;

pub use config::FramegraphConfig;
pub use description::{
    AttachmentDescription, AttachmentFlags, ClearableAttachment, ColorAttachmentDescription, ComputePassDescription,
    ComputeSubpassDescription, DepthAttachmentDescription, ExplicitRenderPassDescription, GenericPassDescription,
    GenericSubpassDescription, PassDescription, RenderPassDescription, RenderSubpassDescription, RenderTargets,
    StageDescription, StageType, StencilAttachmentDescription, SubpassAttachmentReference,
};
pub use error::FramegraphError;
pub use ids::{AttachmentIdentifier, TextureIdentifier};
pub use interfaces::{
    ClearValue, Device, EdgeKind, FramegraphContext, FramegraphStages, Job, JobBatch, JobGraph, JobRunner,
    QueueFamily, RenderOutput, RenderTexture, StageHost, StageKey, TextureCache,
};
pub use latch::StageSignal;
pub use range::{ArrayRange, MipRange, SubresourceRange};
pub use runtime::{Framegraph, PassSummary};
