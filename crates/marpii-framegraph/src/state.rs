//! Fine grained (aspect × mip × layer) state tracking of a single attachment.

use ash::vk;
use smallvec::SmallVec;

use crate::{
    flags::{supported_access_for_layout, supported_access_for_stages, supported_stages_for_layout},
    ids::PassAttachmentReference,
    range::{ArrayRange, MipRange, SubresourceRange},
};

///State of a single subresource at some point of the compiled graph.
#[derive(Clone, Copy, Debug)]
pub struct SubresourceState {
    pub layout: vk::ImageLayout,
    ///Who put the subresource into this state.
    pub reference: PassAttachmentReference,
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub queue_family: u32,
}

impl SubresourceState {
    pub fn new(
        layout: vk::ImageLayout,
        reference: PassAttachmentReference,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        queue_family: u32,
    ) -> Self {
        debug_assert!(!stages.is_empty(), "Subresource state without any stage");
        debug_assert!(
            supported_access_for_layout(layout).contains(access),
            "Access {access:?} is not supported by layout {layout:?}"
        );
        debug_assert!(
            supported_stages_for_layout(layout).contains(stages),
            "Stages {stages:?} are not supported by layout {layout:?}"
        );
        debug_assert!(
            supported_access_for_stages(stages).contains(access),
            "Access {access:?} is not supported by stages {stages:?}"
        );
        SubresourceState {
            layout,
            reference,
            stages,
            access,
            queue_family,
        }
    }

    ///True if some pass has used the subresource.
    pub fn was_used(&self) -> bool {
        self.reference.is_valid()
    }
}

impl Default for SubresourceState {
    fn default() -> Self {
        SubresourceState {
            layout: vk::ImageLayout::UNDEFINED,
            reference: PassAttachmentReference::INVALID,
            stages: vk::PipelineStageFlags::TOP_OF_PIPE,
            access: vk::AccessFlags::empty(),
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

///Two states are considered the same if no barrier is needed in between, which is the case
/// if layout and queue ownership match.
impl PartialEq for SubresourceState {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout && self.queue_family == other.queue_family
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    ///Live state, overwritten in pass declaration order.
    Current = 0,
    ///First state ever written to a subresource.
    Initial = 1,
}

const BUCKET_COUNT: usize = 2;
//Color and depth share the first slot, stencil has its own.
const ASPECT_SLOT_COUNT: usize = 2;

fn aspect_slots(aspect: vk::ImageAspectFlags) -> SmallVec<[(usize, vk::ImageAspectFlags); 2]> {
    let mut slots = SmallVec::new();
    let first = aspect & (vk::ImageAspectFlags::COLOR | vk::ImageAspectFlags::DEPTH);
    if !first.is_empty() {
        slots.push((0, first));
    }
    let stencil = aspect & vk::ImageAspectFlags::STENCIL;
    if !stencil.is_empty() {
        slots.push((1, stencil));
    }
    slots
}

///Flat storage of [SubresourceState]s for all registered subresources of an attachment.
///
/// Only subresources inside the registered range are stored. The range grows with [SubresourceStates::register_used_subresource_range].
#[derive(Clone, Debug, Default)]
pub struct SubresourceStates {
    registered: Option<SubresourceRange>,
    mip_count: u32,
    layer_count: u32,
    states: Vec<SubresourceState>,
}

impl SubresourceStates {
    fn per_aspect(&self) -> usize {
        (self.mip_count * self.layer_count) as usize
    }

    fn per_bucket(&self) -> usize {
        self.per_aspect() * ASPECT_SLOT_COUNT
    }

    fn index(&self, slot: usize, mip: u32, layer: u32, bucket: Bucket) -> usize {
        (layer * self.mip_count + mip) as usize
            + self.per_aspect() * slot
            + self.per_bucket() * bucket as usize
    }

    pub fn registered_range(&self) -> Option<SubresourceRange> {
        self.registered
    }

    ///Forgets every state and the registered range.
    pub fn reset(&mut self) {
        self.registered = None;
        self.mip_count = 0;
        self.layer_count = 0;
        self.states.clear();
    }

    ///Makes sure `range` can be tracked. Existing states are kept.
    pub fn register_used_subresource_range(&mut self, range: SubresourceRange) {
        let merged = match self.registered {
            None => range,
            Some(registered) => SubresourceRange {
                aspect: registered.aspect | range.aspect,
                mips: registered.mips.union(&range.mips),
                layers: registered.layers.union(&range.layers),
            },
        };
        self.registered = Some(merged);

        let mip_count = merged.mips.end();
        let layer_count = merged.layers.end();
        if mip_count == self.mip_count && layer_count == self.layer_count {
            return;
        }

        let mut relayouted = SubresourceStates {
            registered: Some(merged),
            mip_count,
            layer_count,
            states: Vec::new(),
        };
        relayouted
            .states
            .resize(relayouted.per_bucket() * BUCKET_COUNT, SubresourceState::default());

        for bucket in [Bucket::Current, Bucket::Initial] {
            for slot in 0..ASPECT_SLOT_COUNT {
                for layer in 0..self.layer_count {
                    for mip in 0..self.mip_count {
                        let dst = relayouted.index(slot, mip, layer, bucket);
                        relayouted.states[dst] = self.states[self.index(slot, mip, layer, bucket)];
                    }
                }
            }
        }

        *self = relayouted;
    }

    fn covers(&self, range: &SubresourceRange) -> bool {
        self.registered
            .map(|r| r.contains(range))
            .unwrap_or(false)
    }

    ///Storage indices of all subresources in `range`.
    fn indices(&self, range: SubresourceRange, bucket: Bucket) -> impl Iterator<Item = usize> + '_ {
        aspect_slots(range.aspect).into_iter().flat_map(move |(slot, _)| {
            (range.layers.base..range.layers.end()).flat_map(move |layer| {
                (range.mips.base..range.mips.end()).map(move |mip| self.index(slot, mip, layer, bucket))
            })
        })
    }

    ///State of a single subresource. `aspect` must name one aspect.
    pub fn get_subresource_state(
        &self,
        aspect: vk::ImageAspectFlags,
        mip: u32,
        layer: u32,
        bucket: Bucket,
    ) -> SubresourceState {
        let range = SubresourceRange::new(aspect, MipRange::new(mip, 1), ArrayRange::new(layer, 1));
        if !self.covers(&range) {
            return SubresourceState::default();
        }
        let slot = aspect_slots(aspect)
            .first()
            .map(|(slot, _)| *slot)
            .unwrap_or(0);
        self.states[self.index(slot, mip, layer, bucket)]
    }

    ///Sets the state of all subresources in `range`.
    ///
    /// Writing into [Bucket::Current] captures the [Bucket::Initial] state of every subresource that
    /// leaves the `UNDEFINED` layout for the first time.
    pub fn set_subresource_state(&mut self, range: SubresourceRange, state: SubresourceState, bucket: Bucket) {
        assert!(
            self.covers(&range),
            "Subresource range {range:?} was not registered"
        );

        let indices: SmallVec<[usize; 16]> = self.indices(range, bucket).collect();
        let initial_offset = self.per_bucket();
        for index in indices {
            if bucket == Bucket::Current
                && self.states[index].layout == vk::ImageLayout::UNDEFINED
                && state.layout != vk::ImageLayout::UNDEFINED
                && self.states[index + initial_offset].layout == vk::ImageLayout::UNDEFINED
            {
                self.states[index + initial_offset] = state;
            }
            self.states[index] = state;
        }
    }

    ///Returns the state shared by all subresources in `range`, or None if they differ (or are not tracked).
    pub fn get_uniform_subresource_state(
        &self,
        range: SubresourceRange,
        bucket: Bucket,
    ) -> Option<SubresourceState> {
        if !self.covers(&range) || range.is_empty() {
            return None;
        }
        let mut indices = self.indices(range, bucket);
        let first = self.states[indices.next()?];
        if indices.all(|i| self.states[i] == first) {
            Some(first)
        } else {
            None
        }
    }

    ///Partitions `range` into uniform sub-ranges and calls `callback` once for each of them.
    ///
    /// Runs of layers are merged first, then mips with identical layer runs, and finally
    /// depth and stencil if both partition the same way.
    pub fn visit_uniform_subresource_ranges(
        &self,
        range: SubresourceRange,
        bucket: Bucket,
        mut callback: impl FnMut(SubresourceState, SubresourceRange),
    ) {
        if !self.covers(&range) {
            return;
        }

        let mut per_slot: SmallVec<[(vk::ImageAspectFlags, Vec<(MipRange, ArrayRange, SubresourceState)>); 2]> =
            SmallVec::new();
        for (slot, slot_aspect) in aspect_slots(range.aspect) {
            let mut partitions: Vec<(MipRange, ArrayRange, SubresourceState)> = Vec::new();
            let mut previous_runs: Vec<(ArrayRange, SubresourceState)> = Vec::new();
            let mut run_start = range.mips.base;

            for mip in range.mips.base..range.mips.end() {
                let runs = self.layer_runs(slot, mip, range.layers, bucket);
                if mip != range.mips.base && !same_runs(&runs, &previous_runs) {
                    for (layers, state) in previous_runs.drain(..) {
                        partitions.push((MipRange::new(run_start, mip - run_start), layers, state));
                    }
                    run_start = mip;
                }
                previous_runs = runs;
            }
            for (layers, state) in previous_runs.drain(..) {
                partitions.push((
                    MipRange::new(run_start, range.mips.end() - run_start),
                    layers,
                    state,
                ));
            }

            per_slot.push((slot_aspect, partitions));
        }

        let merge_aspects = per_slot.len() == 2 && {
            let (a, b) = (&per_slot[0].1, &per_slot[1].1);
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b.iter())
                    .all(|(x, y)| x.0 == y.0 && x.1 == y.1 && x.2 == y.2)
        };

        if merge_aspects {
            for (mips, layers, state) in &per_slot[0].1 {
                callback(*state, SubresourceRange::new(range.aspect, *mips, *layers));
            }
        } else {
            for (aspect, partitions) in &per_slot {
                for (mips, layers, state) in partitions {
                    callback(*state, SubresourceRange::new(*aspect, *mips, *layers));
                }
            }
        }
    }

    fn layer_runs(
        &self,
        slot: usize,
        mip: u32,
        layers: ArrayRange,
        bucket: Bucket,
    ) -> Vec<(ArrayRange, SubresourceState)> {
        let mut runs: Vec<(ArrayRange, SubresourceState)> = Vec::new();
        for layer in layers.base..layers.end() {
            let state = self.states[self.index(slot, mip, layer, bucket)];
            match runs.last_mut() {
                Some((run, run_state)) if *run_state == state => run.count += 1,
                _ => runs.push((ArrayRange::new(layer, 1), state)),
            }
        }
        runs
    }
}

fn same_runs(a: &[(ArrayRange, SubresourceState)], b: &[(ArrayRange, SubresourceState)]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.0 == y.0 && x.1 == y.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_write(pass: u16) -> SubresourceState {
        SubresourceState::new(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            PassAttachmentReference::new(pass, 0, 0),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            0,
        )
    }

    fn shader_read(pass: u16) -> SubresourceState {
        SubresourceState::new(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            PassAttachmentReference::new(pass, 0, 0),
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            0,
        )
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "are not supported by layout")]
    fn stages_outside_of_layout_panic() {
        //Color attachment output never touches a shader read only image.
        SubresourceState::new(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            PassAttachmentReference::new(0, 0, 0),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            0,
        );
    }

    fn full() -> SubresourceRange {
        SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(0, 4), ArrayRange::new(0, 3))
    }

    #[test]
    fn equality_ignores_reference() {
        assert_eq!(color_write(0), color_write(3));
        assert_ne!(color_write(0), shader_read(0));
        assert!(color_write(0).was_used());
        assert!(!SubresourceState::default().was_used());
    }

    #[test]
    fn uniform_range_invariant() {
        let mut states = SubresourceStates::default();
        states.register_used_subresource_range(full());
        states.set_subresource_state(full(), color_write(0), Bucket::Current);
        states.set_subresource_state(
            SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(2, 1), ArrayRange::new(1, 1)),
            shader_read(1),
            Bucket::Current,
        );

        assert!(states.get_uniform_subresource_state(full(), Bucket::Current).is_none());

        let probes = [
            SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(0, 2), ArrayRange::new(0, 3)),
            SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(2, 1), ArrayRange::new(1, 1)),
            SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(3, 1), ArrayRange::new(0, 3)),
        ];
        for probe in probes {
            let uniform = states
                .get_uniform_subresource_state(probe, Bucket::Current)
                .expect("probe should be uniform");
            for mip in probe.mips.base..probe.mips.end() {
                for layer in probe.layers.base..probe.layers.end() {
                    assert_eq!(
                        states.get_subresource_state(vk::ImageAspectFlags::COLOR, mip, layer, Bucket::Current),
                        uniform
                    );
                }
            }
        }
    }

    #[test]
    fn visit_partitions_cover_range_once() {
        let mut states = SubresourceStates::default();
        states.register_used_subresource_range(full());
        states.set_subresource_state(full(), color_write(0), Bucket::Current);
        states.set_subresource_state(
            SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(1, 2), ArrayRange::new(0, 3)),
            shader_read(1),
            Bucket::Current,
        );

        let mut visited = Vec::new();
        states.visit_uniform_subresource_ranges(full(), Bucket::Current, |state, range| {
            visited.push((state.layout, range));
        });

        assert_eq!(
            visited,
            vec![
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(0, 1), ArrayRange::new(0, 3))
                ),
                (
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(1, 2), ArrayRange::new(0, 3))
                ),
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    SubresourceRange::new(vk::ImageAspectFlags::COLOR, MipRange::new(3, 1), ArrayRange::new(0, 3))
                ),
            ]
        );
    }

    #[test]
    fn depth_and_stencil_merge_when_equal() {
        let ds = SubresourceRange::new(
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            MipRange::new(0, 1),
            ArrayRange::new(0, 1),
        );
        let mut states = SubresourceStates::default();
        states.register_used_subresource_range(ds);
        let mut count = 0;
        states.visit_uniform_subresource_ranges(ds, Bucket::Current, |_, range| {
            assert_eq!(range, ds);
            count += 1;
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn first_use_capture() {
        let mut states = SubresourceStates::default();
        let mip0 = SubresourceRange::color();
        states.register_used_subresource_range(mip0);

        states.set_subresource_state(mip0, color_write(0), Bucket::Current);
        states.set_subresource_state(mip0, shader_read(1), Bucket::Current);

        //grow after the first writes, captured state must survive the relayout.
        states.register_used_subresource_range(full());
        states.set_subresource_state(full(), shader_read(2), Bucket::Current);

        let initial = states.get_subresource_state(vk::ImageAspectFlags::COLOR, 0, 0, Bucket::Initial);
        assert_eq!(initial.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(initial.reference.pass, 0);

        //Subresources first touched by pass 2 capture pass 2.
        let late = states.get_subresource_state(vk::ImageAspectFlags::COLOR, 3, 2, Bucket::Initial);
        assert_eq!(late.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(late.reference.pass, 2);
    }

    #[test]
    fn unregistered_is_not_uniform() {
        let states = SubresourceStates::default();
        assert!(states
            .get_uniform_subresource_state(SubresourceRange::color(), Bucket::Current)
            .is_none());
    }
}
