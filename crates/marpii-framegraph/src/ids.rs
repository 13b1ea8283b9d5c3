//! Dense, frame-local handles into the compiled graph as well as the long living identifiers of attachments and
//! render targets.
//!
//! All `*Index` types use their maximum value as "invalid" sentinel, which lets the compiler store them
//! in flat arrays without wrapping every slot into an `Option`.

use std::marker::PhantomData;

pub type PassIndex = u16;
pub const INVALID_PASS_INDEX: PassIndex = PassIndex::MAX;

pub type SubpassIndex = u8;
pub const INVALID_SUBPASS_INDEX: SubpassIndex = SubpassIndex::MAX;

pub type StageIndex = u16;
pub const INVALID_STAGE_INDEX: StageIndex = StageIndex::MAX;

pub type AttachmentIndex = u8;
pub const INVALID_ATTACHMENT_INDEX: AttachmentIndex = AttachmentIndex::MAX;
///Maximum number of attachments a single pass can reference.
pub const MAXIMUM_ATTACHMENT_COUNT: usize = 64;

pub type FrameIndex = u8;
///One bit per frame-in-flight slot.
pub type FrameMask = u32;
pub const ALL_FRAMES_MASK: FrameMask = FrameMask::MAX;

///Identifiers that are dense, zero based indices into some table.
pub trait DenseIdentifier: Copy {
    fn from_index(index: usize) -> Self;
    fn index(&self) -> usize;
}

///Identifies a logical attachment (a render target template), for instance "the render output" or "the shadow map".
///
/// Registered once per distinct attachment, and reused across compiled graphs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentIdentifier(u32);

impl AttachmentIdentifier {
    pub const fn new(index: u32) -> Self {
        AttachmentIdentifier(index)
    }
}

impl DenseIdentifier for AttachmentIdentifier {
    fn from_index(index: usize) -> Self {
        AttachmentIdentifier(index as u32)
    }
    fn index(&self) -> usize {
        self.0 as usize
    }
}

///Identifies a concrete render target that was instantiated from an [AttachmentIdentifier] by the texture cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureIdentifier(u32);

impl TextureIdentifier {
    pub const fn new(index: u32) -> Self {
        TextureIdentifier(index)
    }
}

impl DenseIdentifier for TextureIdentifier {
    fn from_index(index: usize) -> Self {
        TextureIdentifier(index as u32)
    }
    fn index(&self) -> usize {
        self.0 as usize
    }
}

///Identifies *who* last touched a subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PassAttachmentReference {
    pub pass: PassIndex,
    pub attachment: AttachmentIndex,
    pub subpass: SubpassIndex,
}

impl PassAttachmentReference {
    pub const INVALID: Self = PassAttachmentReference {
        pass: INVALID_PASS_INDEX,
        attachment: INVALID_ATTACHMENT_INDEX,
        subpass: INVALID_SUBPASS_INDEX,
    };

    pub const fn new(pass: PassIndex, attachment: AttachmentIndex, subpass: SubpassIndex) -> Self {
        PassAttachmentReference {
            pass,
            attachment,
            subpass,
        }
    }

    ///True if this reference points to a pass.
    pub fn is_valid(&self) -> bool {
        self.pass != INVALID_PASS_INDEX
    }
}

impl Default for PassAttachmentReference {
    fn default() -> Self {
        Self::INVALID
    }
}

///Dense bitset keyed by some identifier.
#[derive(Clone, Debug)]
pub struct IdentifierMask<T: DenseIdentifier> {
    words: Vec<u64>,
    ty: PhantomData<T>,
}

impl<T: DenseIdentifier> Default for IdentifierMask<T> {
    fn default() -> Self {
        IdentifierMask {
            words: Vec::new(),
            ty: PhantomData,
        }
    }
}

impl<T: DenseIdentifier> IdentifierMask<T> {
    pub fn set(&mut self, identifier: T) {
        let index = identifier.index();
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    pub fn is_set(&self, identifier: T) -> bool {
        let index = identifier.index();
        self.words
            .get(index / 64)
            .map(|w| (w & (1u64 << (index % 64))) != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    ///Iterates all set identifiers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, word)| {
            let word = *word;
            (0..64usize)
                .filter(move |bit| (word & (1u64 << bit)) != 0)
                .map(move |bit| T::from_index(word_index * 64 + bit))
        })
    }
}
