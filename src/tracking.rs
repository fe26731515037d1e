//! Resource state tracking and barrier derivation.
//!
//! A [`ResourceState`] remembers how a resource was last touched: the last write, the stages
//! that have read it since, its image layout, and the queue family that owns it. Given the next
//! [`Access`], [`ResourceState::transition`] computes the source and destination halves of the
//! barrier that orders the two, leaving out whatever is already guaranteed:
//!
//! - a read after a read at a later pipeline stage needs nothing,
//! - a write after reads needs only an execution dependency,
//! - a write after a write, or any layout transition, needs a full memory dependency.
//!
//! The [plane tracker](crate::plane) uses this to pick the narrowest stage and access masks
//! for ownership transfers, and the [frame pacer](crate::frame) uses it for the render target.

use std::{
    fmt::Debug,
    ops::{BitOr, BitOrAssign},
};

use ash::vk;

/// A pipeline stage paired with the memory access performed there.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    /// Texture sampling in the fragment shader, the usual consumer of a decoded plane.
    pub const FRAGMENT_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COMPUTE_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const BLIT_SRC: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const BLIT_DST: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const COLOR_ATTACHMENT_READ_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw(),
        ),
    };
    pub const VIDEO_DECODE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
        access: vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
    };
    pub const VIDEO_ENCODE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
        access: vk::AccessFlags2::VIDEO_ENCODE_READ_KHR,
    };
    /// Used where the downstream consumer is unknown, e.g. the presentation engine.
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    pub fn is_writeonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        self.access & !utils::ALL_WRITE_BITS == vk::AccessFlags2::NONE
    }

    pub fn is_readonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        self.access & !utils::ALL_READ_BITS == vk::AccessFlags2::NONE
    }
}

/// The last known state of one resource.
///
/// Store it next to the resource it describes. It is only meaningful together with the
/// semaphore point that makes the described accesses complete; across submissions ordering is
/// still established by semaphores, not by this record.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourceState {
    /// The most recent write. Source of the next barrier.
    pub write: Access,

    /// Earliest pipeline stages that have read the resource since the last write.
    ///
    /// Reset to empty when a new write occurs.
    pub reads: vk::PipelineStageFlags2,

    /// Current image layout. Unused for buffers.
    pub layout: vk::ImageLayout,

    /// Queue family that currently owns the resource, or [`vk::QUEUE_FAMILY_IGNORED`] if the
    /// resource has no queue affinity yet.
    pub queue_family: u32,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            write: Access::NONE,
            reads: vk::PipelineStageFlags2::empty(),
            layout: vk::ImageLayout::UNDEFINED,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

impl Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ResourceState");
        debug.field("write_stage", &self.write.stage);
        debug.field("write_access", &self.write.access);
        debug.field("pending_read_stages", &self.reads);
        if self.layout != vk::ImageLayout::default() {
            debug.field("image_layout", &self.layout);
        }
        if self.queue_family == vk::QUEUE_FAMILY_IGNORED {
            debug.field("queue_family", &"ignored");
        } else {
            debug.field("queue_family", &self.queue_family);
        }
        debug.finish()
    }
}

/// The two halves of a pipeline barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl BitOr for MemoryBarrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            src: self.src | rhs.src,
            dst: self.dst | rhs.dst,
        }
    }
}
impl BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        self.src |= rhs.src;
        self.dst |= rhs.dst;
    }
}

impl ResourceState {
    /// A resource last touched by `access`, in `layout`, owned by `queue_family`.
    pub fn new(access: Access, layout: vk::ImageLayout, queue_family: u32) -> Self {
        let mut state = Self {
            write: Access::NONE,
            reads: vk::PipelineStageFlags2::empty(),
            layout,
            queue_family,
        };
        if access.is_readonly() {
            state.reads = access.stage;
        } else {
            state.write = access;
        }
        state
    }

    /// Everything a barrier must wait on before the resource can be touched again.
    pub fn last_access(&self) -> Access {
        if self.reads.is_empty() {
            self.write
        } else {
            Access {
                stage: self.write.stage | self.reads,
                access: self.write.access,
            }
        }
    }

    /// Computes the minimal barrier from the current state to `next` and records `next`.
    ///
    /// Returns an empty barrier when nothing needs to be synchronized. The layout and queue
    /// family fields are left to the caller, which knows whether a transition is recorded.
    pub fn transition(&mut self, next: Access, with_layout_transition: bool) -> MemoryBarrier {
        let mut barrier = MemoryBarrier {
            src: self.write,
            dst: next,
        };
        if self.write == Access::NONE && self.reads.is_empty() {
            // Never accessed.
            if with_layout_transition {
                barrier.src = Access::NONE;
            } else {
                barrier = MemoryBarrier::default();
            }
        } else if next.is_readonly() && !with_layout_transition {
            if self.reads.is_empty() {
                // First read since the write: make the write visible.
            } else {
                match utils::compare_pipeline_stages(self.reads, next.stage) {
                    Some(ordering) if ordering.is_le() => {
                        // An earlier read already made the write visible at this stage.
                        barrier = MemoryBarrier::default();
                    }
                    _ => {
                        barrier.src |= Access {
                            stage: self.reads,
                            access: vk::AccessFlags2::empty(),
                        };
                    }
                }
            }
        } else if !self.reads.is_empty() {
            // Write after read: the reads must finish first.
            barrier.src = Access {
                stage: self.reads,
                access: vk::AccessFlags2::empty(),
            };
            if with_layout_transition {
                // The layout transition is itself a write; the previous write must be flushed.
                barrier.src |= self.write;
            } else {
                barrier.dst.access = vk::AccessFlags2::empty();
            }
        }

        if next.is_readonly() {
            self.reads = utils::earlier_stage(self.reads, next.stage);
        } else {
            self.write = next;
            self.reads = vk::PipelineStageFlags2::empty();
        }
        barrier
    }
}

mod utils {
    use ash::vk;
    use std::cmp::Ordering;
    pub const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR.as_raw()
            | vk::AccessFlags2::VIDEO_ENCODE_WRITE_KHR.as_raw(),
    );
    pub const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
            | vk::AccessFlags2::INDEX_READ.as_raw()
            | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
            | vk::AccessFlags2::UNIFORM_READ.as_raw()
            | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::SHADER_READ.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::TRANSFER_READ.as_raw()
            | vk::AccessFlags2::HOST_READ.as_raw()
            | vk::AccessFlags2::MEMORY_READ.as_raw()
            | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
            | vk::AccessFlags2::VIDEO_DECODE_READ_KHR.as_raw()
            | vk::AccessFlags2::VIDEO_ENCODE_READ_KHR.as_raw(),
    );
    const GRAPHICS_PIPELINE_ORDER: [vk::PipelineStageFlags2; 8] = [
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::PipelineStageFlags2::INDEX_INPUT,
        vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        vk::PipelineStageFlags2::VERTEX_SHADER,
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    ];
    const COMPUTE_PIPELINE_ORDER: [vk::PipelineStageFlags2; 2] = [
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::PipelineStageFlags2::COMPUTE_SHADER,
    ];
    const ALL_ORDERS: [&[vk::PipelineStageFlags2]; 2] =
        [&GRAPHICS_PIPELINE_ORDER, &COMPUTE_PIPELINE_ORDER];

    /// Compare two pipeline stages. Returns `Some(Less)` if `a` runs before `b` within one
    /// pipeline, `Some(Equal)` if they are the same, `Some(Greater)` if `a` runs after `b`, and
    /// `None` if they are not mutually ordered.
    pub fn compare_pipeline_stages(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> Option<Ordering> {
        if a == b {
            return Some(Ordering::Equal);
        }
        for order in ALL_ORDERS.iter() {
            let first_index = order.iter().position(|&x| a.contains(x));
            let second_index = order.iter().position(|&x| b.contains(x));
            if let Some(first_index) = first_index
                && let Some(second_index) = second_index
            {
                return first_index.partial_cmp(&second_index);
            }
        }
        None
    }

    pub fn earlier_stage(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> vk::PipelineStageFlags2 {
        if a.is_empty() {
            return b;
        }
        match compare_pipeline_stages(a, b) {
            Some(ordering) if ordering.is_le() => a,
            Some(_) => b,
            None => a | b,
        }
    }
}
