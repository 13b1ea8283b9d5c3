use thiserror::Error;

use crate::interfaces::QueueFamily;

///Recoverable errors of the framegraph. Violated usage contracts (reading an attachment nobody wrote, starting a
/// frame while another one is in flight, ...) panic instead.
#[derive(Debug, Error)]
pub enum FramegraphError {
    #[error("Device exposes no {0:?} queue family")]
    NoQueueFamily(QueueFamily),

    #[error("Render output has no images")]
    InvalidRenderOutput,

    #[error("Pass references {count} attachments, at most {} are supported", crate::ids::MAXIMUM_ATTACHMENT_COUNT)]
    TooManyAttachments { count: usize },

    #[error("Render output has {count} images, at most {maximum} frames in flight are supported")]
    TooManyFrames { count: usize, maximum: usize },
}
