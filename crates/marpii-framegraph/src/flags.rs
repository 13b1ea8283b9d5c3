//! Tables of which access masks and pipeline stages go together with which image layouts.
//!
//! The compiler uses them to fill in the "widest" stage/access combination for a layout whenever
//! it synthesizes a transition on its own (presenting, restoring initial states, loading render targets).

use ash::vk;

const MEMORY_RW: vk::AccessFlags =
    vk::AccessFlags::from_raw(vk::AccessFlags::MEMORY_READ.as_raw() | vk::AccessFlags::MEMORY_WRITE.as_raw());
const SHADER_RW: vk::AccessFlags =
    vk::AccessFlags::from_raw(vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw());
const COLOR_RW: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw(),
);
const DEPTH_STENCIL_RW: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);
const TRANSFER_RW: vk::AccessFlags =
    vk::AccessFlags::from_raw(vk::AccessFlags::TRANSFER_READ.as_raw() | vk::AccessFlags::TRANSFER_WRITE.as_raw());
const HOST_RW: vk::AccessFlags =
    vk::AccessFlags::from_raw(vk::AccessFlags::HOST_READ.as_raw() | vk::AccessFlags::HOST_WRITE.as_raw());

const ALL_GRAPHICS_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    MEMORY_RW.as_raw()
        | SHADER_RW.as_raw()
        | COLOR_RW.as_raw()
        | DEPTH_STENCIL_RW.as_raw()
        | vk::AccessFlags::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags::INDEX_READ.as_raw()
        | vk::AccessFlags::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags::UNIFORM_READ.as_raw()
        | vk::AccessFlags::INPUT_ATTACHMENT_READ.as_raw(),
);
const ALL_ACCESS: vk::AccessFlags =
    vk::AccessFlags::from_raw(ALL_GRAPHICS_ACCESS.as_raw() | TRANSFER_RW.as_raw() | HOST_RW.as_raw());

const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER.as_raw()
        | vk::PipelineStageFlags::GEOMETRY_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

///Access a single pipeline stage bit may perform.
fn supported_access_for_stage(stage: vk::PipelineStageFlags) -> vk::AccessFlags {
    match stage {
        vk::PipelineStageFlags::TOP_OF_PIPE => vk::AccessFlags::MEMORY_READ,
        vk::PipelineStageFlags::DRAW_INDIRECT => vk::AccessFlags::INDIRECT_COMMAND_READ,
        vk::PipelineStageFlags::VERTEX_INPUT => {
            MEMORY_RW
                | vk::AccessFlags::INDEX_READ
                | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags::UNIFORM_READ
        }
        vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER
        | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER
        | vk::PipelineStageFlags::GEOMETRY_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER => MEMORY_RW | SHADER_RW | vk::AccessFlags::UNIFORM_READ,
        vk::PipelineStageFlags::FRAGMENT_SHADER => {
            MEMORY_RW
                | SHADER_RW
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        }
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS => {
            MEMORY_RW | DEPTH_STENCIL_RW
        }
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT => MEMORY_RW | COLOR_RW,
        vk::PipelineStageFlags::TRANSFER => MEMORY_RW | TRANSFER_RW,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE => MEMORY_RW,
        vk::PipelineStageFlags::HOST => HOST_RW,
        vk::PipelineStageFlags::ALL_GRAPHICS => ALL_GRAPHICS_ACCESS,
        vk::PipelineStageFlags::ALL_COMMANDS => ALL_ACCESS,
        _ => vk::AccessFlags::empty(),
    }
}

///Pipeline stages a single access bit may happen in.
fn supported_stages_for_access_bit(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    match access {
        vk::AccessFlags::INDIRECT_COMMAND_READ => vk::PipelineStageFlags::DRAW_INDIRECT,
        vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ => {
            vk::PipelineStageFlags::VERTEX_INPUT
        }
        vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE => {
            SHADER_STAGES
        }
        vk::AccessFlags::INPUT_ATTACHMENT_READ => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ => vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE => vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE => vk::PipelineStageFlags::HOST,
        vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE => vk::PipelineStageFlags::TOP_OF_PIPE,
        _ => vk::PipelineStageFlags::empty(),
    }
}

///Union of everything the given `stages` may access.
pub fn supported_access_for_stages(stages: vk::PipelineStageFlags) -> vk::AccessFlags {
    (0..32)
        .map(|bit| vk::PipelineStageFlags::from_raw(1 << bit))
        .filter(|bit| stages.contains(*bit))
        .fold(vk::AccessFlags::empty(), |acc, bit| {
            acc | supported_access_for_stage(bit)
        })
}

///Union of all stages `access` may happen in. No access at all is only valid at the top or bottom of the pipe.
pub fn supported_stages_for_access(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    if access.is_empty() {
        return vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    (0..32)
        .map(|bit| vk::AccessFlags::from_raw(1 << bit))
        .filter(|bit| access.contains(*bit))
        .fold(vk::PipelineStageFlags::empty(), |acc, bit| {
            acc | supported_stages_for_access_bit(bit)
        })
}

///All access an image in `layout` can be subject to.
pub fn supported_access_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        vk::ImageLayout::GENERAL => MEMORY_RW | SHADER_RW,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => COLOR_RW,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL => DEPTH_STENCIL_RW,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        _ => vk::AccessFlags::empty(),
    }
}

///All stages that may touch an image in `layout`.
pub fn supported_stages_for_layout(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::ImageLayout::GENERAL => vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::GEOMETRY_SHADER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::GEOMETRY_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::PREINITIALIZED => vk::PipelineStageFlags::HOST,
        _ => vk::PipelineStageFlags::empty(),
    }
}

///True for every layout that is used for depth and/or stencil data.
pub fn is_depth_stencil_layout(layout: vk::ImageLayout) -> bool {
    matches!(
        layout,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
            | vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL
    )
}
