use ash::vk;

///Continuous range of mip levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MipRange {
    pub base: u32,
    pub count: u32,
}

impl MipRange {
    pub const fn new(base: u32, count: u32) -> Self {
        MipRange { base, count }
    }

    ///One past the last mip.
    pub const fn end(&self) -> u32 {
        self.base + self.count
    }

    pub const fn contains(&self, other: &MipRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    ///Smallest range containing `self` and `other`.
    pub fn union(&self, other: &MipRange) -> MipRange {
        let base = self.base.min(other.base);
        MipRange {
            base,
            count: self.end().max(other.end()) - base,
        }
    }
}

impl Default for MipRange {
    fn default() -> Self {
        MipRange { base: 0, count: 1 }
    }
}

///Continuous range of array layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayRange {
    pub base: u32,
    pub count: u32,
}

impl ArrayRange {
    pub const fn new(base: u32, count: u32) -> Self {
        ArrayRange { base, count }
    }

    pub const fn end(&self) -> u32 {
        self.base + self.count
    }

    pub const fn contains(&self, other: &ArrayRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    pub fn union(&self, other: &ArrayRange) -> ArrayRange {
        let base = self.base.min(other.base);
        ArrayRange {
            base,
            count: self.end().max(other.end()) - base,
        }
    }
}

impl Default for ArrayRange {
    fn default() -> Self {
        ArrayRange { base: 0, count: 1 }
    }
}

///Aspect × mip × layer slice of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub aspect: vk::ImageAspectFlags,
    pub mips: MipRange,
    pub layers: ArrayRange,
}

impl SubresourceRange {
    pub const fn new(aspect: vk::ImageAspectFlags, mips: MipRange, layers: ArrayRange) -> Self {
        SubresourceRange {
            aspect,
            mips,
            layers,
        }
    }

    ///Single mip, single layer color range.
    pub const fn color() -> Self {
        SubresourceRange {
            aspect: vk::ImageAspectFlags::COLOR,
            mips: MipRange::new(0, 1),
            layers: ArrayRange::new(0, 1),
        }
    }

    pub fn contains(&self, other: &SubresourceRange) -> bool {
        self.aspect.contains(other.aspect)
            && self.mips.contains(&other.mips)
            && self.layers.contains(&other.layers)
    }

    ///Like [SubresourceRange::contains], but ignores the aspect. Used where a declared range predates the
    /// format of the image.
    pub fn contains_levels(&self, other: &SubresourceRange) -> bool {
        self.mips.contains(&other.mips) && self.layers.contains(&other.layers)
    }

    pub fn is_empty(&self) -> bool {
        self.aspect.is_empty() || self.mips.count == 0 || self.layers.count == 0
    }

    pub fn has_depth_or_stencil(&self) -> bool {
        self.aspect
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }
}

impl From<SubresourceRange> for vk::ImageSubresourceRange {
    fn from(r: SubresourceRange) -> Self {
        vk::ImageSubresourceRange {
            aspect_mask: r.aspect,
            base_mip_level: r.mips.base,
            level_count: r.mips.count,
            base_array_layer: r.layers.base,
            layer_count: r.layers.count,
        }
    }
}

///Depth and stencil aspects a format carries.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment() {
        let outer = SubresourceRange::new(
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            MipRange::new(0, 4),
            ArrayRange::new(0, 6),
        );
        let inner = SubresourceRange::new(
            vk::ImageAspectFlags::DEPTH,
            MipRange::new(1, 2),
            ArrayRange::new(2, 4),
        );
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&SubresourceRange::color()));
        assert!(outer.contains_levels(&SubresourceRange::color()));
    }

    #[test]
    fn union() {
        assert_eq!(
            MipRange::new(2, 2).union(&MipRange::new(0, 1)),
            MipRange::new(0, 4)
        );
        assert_eq!(
            ArrayRange::new(0, 1).union(&ArrayRange::new(5, 1)),
            ArrayRange::new(0, 6)
        );
    }

    #[test]
    fn depth_stencil_formats() {
        assert_eq!(
            format_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(format_aspects(vk::Format::R8G8B8A8_UNORM).is_empty());
    }
}
