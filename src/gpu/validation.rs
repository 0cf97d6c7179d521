//! Resource-state validation for recorded command lists
//!
//! Tracks the state of every live resource across submissions and checks each
//! command against it. A mismatch is a pipeline bug and is reported as a fatal
//! [`PipelineError`].

use std::collections::HashMap;

use super::command::{Command, CommandList};
use super::program::{BindingKind, ProgramKind};
use super::{ProgramHandle, ResourceId, ResourceState};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPass {
    None,
    Compute,
    Render,
}

/// Required state for a resource bound through a descriptor table
pub fn required_state(kind: BindingKind) -> ResourceState {
    match kind {
        BindingKind::Uniform => ResourceState::VertexOrConstant,
        BindingKind::StorageRead | BindingKind::DepthTexture => ResourceState::ShaderResource,
        BindingKind::StorageReadWrite => ResourceState::UnorderedAccess,
    }
}

#[derive(Debug, Default)]
pub struct StateValidator {
    states: HashMap<ResourceId, ResourceState>,
}

impl StateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: impl Into<ResourceId>, state: ResourceState) {
        self.states.insert(resource.into(), state);
    }

    pub fn forget(&mut self, resource: impl Into<ResourceId>) {
        self.states.remove(&resource.into());
    }

    pub fn state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.states.get(&resource.into()).copied()
    }

    /// Check a resource is currently in `state` (used for queue-level uploads)
    pub fn expect_state(
        &self,
        resource: impl Into<ResourceId>,
        state: ResourceState,
        usage: &'static str,
    ) -> PipelineResult<()> {
        let resource = resource.into();
        let actual = self.current(resource)?;
        if actual != state {
            return Err(PipelineError::StateMismatch {
                resource,
                usage,
                actual,
            });
        }
        Ok(())
    }

    fn current(&self, resource: ResourceId) -> PipelineResult<ResourceState> {
        self.states.get(&resource).copied().ok_or_else(|| {
            let (kind, index) = match resource {
                ResourceId::Buffer(handle) => ("buffer", handle.0),
                ResourceId::Texture(handle) => ("texture", handle.0),
            };
            PipelineError::InvalidHandle { kind, index }
        })
    }

    /// Walk a command list, applying transitions and checking every use
    pub fn validate(
        &mut self,
        list: &CommandList,
        program_kind: impl Fn(ProgramHandle) -> Option<ProgramKind>,
    ) -> PipelineResult<()> {
        let mut pass = OpenPass::None;
        let mut program: Option<ProgramKind> = None;
        let mut bound = false;

        let malformed = |message: String| PipelineError::CommandList {
            message: format!("'{}': {}", list.label(), message),
        };

        for command in list.commands() {
            match command {
                Command::Barrier(transitions) => {
                    if pass != OpenPass::None {
                        return Err(malformed("barrier inside a pass".into()));
                    }
                    for t in transitions {
                        let actual = self.current(t.resource)?;
                        if actual != t.before {
                            return Err(PipelineError::InvalidTransition {
                                resource: t.resource,
                                expected: t.before,
                                actual,
                            });
                        }
                        self.states.insert(t.resource, t.after);
                    }
                }
                Command::ClearBuffer { buffer, .. } => {
                    self.expect_state(*buffer, ResourceState::CopyDest, "clear destination")?;
                }
                Command::CopyBuffer { src, dst, .. } => {
                    self.expect_state(*src, ResourceState::CopySource, "copy source")?;
                    self.expect_state(*dst, ResourceState::CopyDest, "copy destination")?;
                }
                Command::WriteTimestamp { .. } => {}
                Command::ResolveTimestamps { destination, .. } => {
                    self.expect_state(*destination, ResourceState::CopyDest, "query resolve destination")?;
                }
                Command::BeginComputePass { .. } => {
                    if pass != OpenPass::None {
                        return Err(malformed("nested pass".into()));
                    }
                    pass = OpenPass::Compute;
                    program = None;
                    bound = false;
                }
                Command::BeginRenderPass { color, depth, .. } => {
                    if pass != OpenPass::None {
                        return Err(malformed("nested pass".into()));
                    }
                    if let Some(color) = color {
                        self.expect_state(color.texture, ResourceState::RenderTarget, "color attachment")?;
                    }
                    if let Some(depth) = depth {
                        self.expect_state(depth.texture, ResourceState::DepthWrite, "depth attachment")?;
                    }
                    pass = OpenPass::Render;
                    program = None;
                    bound = false;
                }
                Command::EndComputePass => {
                    if pass != OpenPass::Compute {
                        return Err(malformed("end of compute pass without a begin".into()));
                    }
                    pass = OpenPass::None;
                }
                Command::EndRenderPass => {
                    if pass != OpenPass::Render {
                        return Err(malformed("end of render pass without a begin".into()));
                    }
                    pass = OpenPass::None;
                }
                Command::SetProgram(handle) => {
                    let kind = program_kind(*handle).ok_or(PipelineError::InvalidHandle {
                        kind: "program",
                        index: handle.0,
                    })?;
                    let compute = pass == OpenPass::Compute;
                    if kind.is_compute() != compute {
                        return Err(malformed(format!(
                            "{} bound in a {} pass",
                            kind.label(),
                            if compute { "compute" } else { "render" }
                        )));
                    }
                    program = Some(kind);
                    bound = kind.bindings().is_empty();
                }
                Command::SetBindings(bindings) => {
                    let kind = program.ok_or_else(|| malformed("bindings set before a program".into()))?;
                    let layout = kind.bindings();
                    if bindings.len() != layout.len() {
                        return Err(malformed(format!(
                            "{} expects {} bindings, got {}",
                            kind.label(),
                            layout.len(),
                            bindings.len()
                        )));
                    }
                    for binding in bindings {
                        let slot = layout
                            .iter()
                            .find(|slot| slot.binding == binding.slot)
                            .ok_or_else(|| {
                                malformed(format!("{} has no slot {}", kind.label(), binding.slot))
                            })?;
                        let actual = self.current(binding.resource_id())?;
                        if actual != required_state(slot.kind) {
                            return Err(PipelineError::StateMismatch {
                                resource: binding.resource_id(),
                                usage: "bound resource",
                                actual,
                            });
                        }
                    }
                    bound = true;
                }
                Command::SetViewport(_) => {
                    if pass != OpenPass::Render {
                        return Err(malformed("viewport outside a render pass".into()));
                    }
                }
                Command::SetVertexBuffer { buffer, .. } => {
                    self.expect_state(*buffer, ResourceState::VertexOrConstant, "vertex buffer")?;
                }
                Command::SetIndexBuffer { buffer, .. } => {
                    self.expect_state(*buffer, ResourceState::IndexBuffer, "index buffer")?;
                }
                Command::Draw { .. } | Command::DrawIndexed { .. } => {
                    if pass != OpenPass::Render || program.is_none() || !bound {
                        return Err(malformed("draw without a render pass, program and bindings".into()));
                    }
                }
                Command::DrawIndexedIndirectCount {
                    args, count_buffer, ..
                } => {
                    if pass != OpenPass::Render || program.is_none() || !bound {
                        return Err(malformed("indirect draw without a render pass, program and bindings".into()));
                    }
                    self.expect_state(*args, ResourceState::IndirectArgument, "indirect arguments")?;
                    self.expect_state(*count_buffer, ResourceState::IndirectArgument, "indirect count")?;
                }
                Command::Dispatch { .. } => {
                    if pass != OpenPass::Compute || program.is_none() || !bound {
                        return Err(malformed("dispatch without a compute pass, program and bindings".into()));
                    }
                }
            }
        }

        if pass != OpenPass::None {
            return Err(malformed("pass left open".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Binding, BufferHandle};

    fn kinds(handle: ProgramHandle) -> Option<ProgramKind> {
        match handle.0 {
            0 => Some(ProgramKind::CompactCompute),
            1 => Some(ProgramKind::SceneMesh),
            _ => None,
        }
    }

    #[test]
    fn test_transition_must_match_current_state() {
        let buffer = BufferHandle(7);
        let mut validator = StateValidator::new();
        validator.register(buffer, ResourceState::IndirectArgument);

        let mut list = CommandList::new("ok");
        list.transition(buffer, ResourceState::IndirectArgument, ResourceState::CopyDest);
        list.transition(buffer, ResourceState::CopyDest, ResourceState::UnorderedAccess);
        validator.validate(&list, kinds).unwrap();
        assert_eq!(validator.state(buffer), Some(ResourceState::UnorderedAccess));

        let mut bad = CommandList::new("bad");
        bad.transition(buffer, ResourceState::CopyDest, ResourceState::IndirectArgument);
        let err = validator.validate(&bad, kinds).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                actual: ResourceState::UnorderedAccess,
                ..
            }
        ));
    }

    #[test]
    fn test_bound_resources_need_binding_state() {
        let mut validator = StateValidator::new();
        let buffers: Vec<_> = (0..5).map(BufferHandle).collect();
        validator.register(buffers[0], ResourceState::VertexOrConstant);
        validator.register(buffers[1], ResourceState::ShaderResource);
        validator.register(buffers[2], ResourceState::ShaderResource);
        validator.register(buffers[3], ResourceState::IndirectArgument);
        validator.register(buffers[4], ResourceState::UnorderedAccess);

        let mut list = CommandList::new("compaction");
        {
            let mut pass = list.begin_compute_pass("compact");
            pass.set_program(ProgramHandle(0));
            pass.set_bindings(
                buffers
                    .iter()
                    .enumerate()
                    .map(|(i, b)| Binding::buffer(i as u32, *b))
                    .collect::<Vec<_>>(),
            );
            pass.dispatch(1, 1, 1);
        }

        let err = validator.validate(&list, kinds).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StateMismatch {
                actual: ResourceState::IndirectArgument,
                ..
            }
        ));
    }

    #[test]
    fn test_program_must_match_pass_type() {
        let mut validator = StateValidator::new();
        let mut list = CommandList::new("mismatch");
        {
            let mut pass = list.begin_compute_pass("cs");
            pass.set_program(ProgramHandle(1));
        }
        assert!(matches!(
            validator.validate(&list, kinds),
            Err(PipelineError::CommandList { .. })
        ));
    }

    #[test]
    fn test_unknown_resource_is_rejected() {
        let mut validator = StateValidator::new();
        let mut list = CommandList::new("unknown");
        list.clear_buffer(BufferHandle(3), 0, None);
        assert!(matches!(
            validator.validate(&list, kinds),
            Err(PipelineError::InvalidHandle { kind: "buffer", index: 3 })
        ));
    }
}
