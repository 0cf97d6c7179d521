//! Replay of recorded command lists into a wgpu command encoder

use super::programs::Pipeline;
use super::{WgpuBackend, TIMESTAMP_BYTES};
use crate::error::{PipelineError, PipelineResult};
use crate::gpu::command::{ColorAttachment, Command, CommandList, DepthAttachment, LoadOp};
use crate::gpu::layout::DRAW_ARGS_STRIDE;
use crate::gpu::ProgramHandle;

fn malformed(list: &CommandList, message: impl Into<String>) -> PipelineError {
    PipelineError::CommandList {
        message: format!("'{}': {}", list.label(), message.into()),
    }
}

/// Index of the command closing the pass opened at `start`
fn pass_end(list: &CommandList, start: usize, compute: bool) -> PipelineResult<usize> {
    list.commands()[start + 1..]
        .iter()
        .position(|c| {
            if compute {
                matches!(c, Command::EndComputePass)
            } else {
                matches!(c, Command::EndRenderPass)
            }
        })
        .map(|offset| start + 1 + offset)
        .ok_or_else(|| malformed(list, "pass left open"))
}

fn color_load(load: LoadOp<[f32; 4]>) -> wgpu::LoadOp<wgpu::Color> {
    match load {
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: a as f64,
        }),
    }
}

fn depth_load(load: LoadOp<f32>) -> wgpu::LoadOp<f32> {
    match load {
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::Clear(depth) => wgpu::LoadOp::Clear(depth),
    }
}

impl WgpuBackend {
    pub(super) fn encode(&self, list: &CommandList) -> PipelineResult<wgpu::CommandBuffer> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(list.label()),
        });
        let commands = list.commands();
        let mut i = 0;
        while i < commands.len() {
            match &commands[i] {
                // wgpu derives its own barriers from usage
                Command::Barrier(_) => {}
                Command::ClearBuffer { buffer, offset, size } => {
                    encoder.clear_buffer(self.buffer(*buffer)?, *offset, *size);
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(self.buffer(*src)?, *src_offset, self.buffer(*dst)?, *dst_offset, *size);
                }
                Command::WriteTimestamp { heap, index } => {
                    encoder.write_timestamp(&self.query_heap(*heap)?.set, *index);
                }
                Command::ResolveTimestamps {
                    heap,
                    first,
                    count,
                    destination,
                    destination_offset,
                } => {
                    let heap = self.query_heap(*heap)?;
                    encoder.resolve_query_set(&heap.set, *first..*first + *count, &heap.resolve, 0);
                    encoder.copy_buffer_to_buffer(
                        &heap.resolve,
                        0,
                        self.buffer(*destination)?,
                        *destination_offset,
                        *count as u64 * TIMESTAMP_BYTES,
                    );
                }
                Command::BeginComputePass { label } => {
                    let end = pass_end(list, i, true)?;
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(label),
                        timestamp_writes: None,
                    });
                    self.encode_compute(list, &mut pass, &commands[i + 1..end])?;
                    i = end;
                }
                Command::BeginRenderPass { label, color, depth } => {
                    let end = pass_end(list, i, false)?;
                    let color_attachment = [self.color_attachment(color.as_ref())?];
                    // Depth-only passes take no color slots at all
                    let color_attachments: &[Option<wgpu::RenderPassColorAttachment<'_>>] =
                        if color.is_some() { &color_attachment } else { &[] };
                    let depth_attachment = self.depth_attachment(depth.as_ref())?;
                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(label),
                        color_attachments,
                        depth_stencil_attachment: depth_attachment,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    self.encode_render(list, &mut pass, &commands[i + 1..end])?;
                    i = end;
                }
                other => return Err(malformed(list, format!("{:?} outside a pass", other))),
            }
            i += 1;
        }
        Ok(encoder.finish())
    }

    fn color_attachment(&self, color: Option<&ColorAttachment>) -> PipelineResult<Option<wgpu::RenderPassColorAttachment<'_>>> {
        let Some(color) = color else { return Ok(None) };
        Ok(Some(wgpu::RenderPassColorAttachment {
            view: self.texture_view(color.texture)?,
            resolve_target: None,
            ops: wgpu::Operations {
                load: color_load(color.load),
                store: wgpu::StoreOp::Store,
            },
        }))
    }

    fn depth_attachment(
        &self,
        depth: Option<&DepthAttachment>,
    ) -> PipelineResult<Option<wgpu::RenderPassDepthStencilAttachment<'_>>> {
        let Some(depth) = depth else { return Ok(None) };
        Ok(Some(wgpu::RenderPassDepthStencilAttachment {
            view: self.texture_view(depth.texture)?,
            depth_ops: Some(wgpu::Operations {
                load: depth_load(depth.load),
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        }))
    }

    fn encode_compute<'a>(
        &'a self,
        list: &CommandList,
        pass: &mut wgpu::ComputePass<'a>,
        commands: &[Command],
    ) -> PipelineResult<()> {
        let mut program: Option<ProgramHandle> = None;
        for command in commands {
            match command {
                Command::SetProgram(handle) => {
                    let Pipeline::Compute(pipeline) = &self.program(*handle)?.pipeline else {
                        return Err(malformed(list, "render program in a compute pass"));
                    };
                    pass.set_pipeline(pipeline);
                    program = Some(*handle);
                }
                Command::SetBindings(bindings) => {
                    let handle = program.ok_or_else(|| malformed(list, "bindings set before a program"))?;
                    pass.set_bind_group(0, self.bind_group(handle, bindings)?, &[]);
                }
                Command::Dispatch { x, y, z } => pass.dispatch_workgroups(*x, *y, *z),
                other => return Err(malformed(list, format!("{:?} inside a compute pass", other))),
            }
        }
        Ok(())
    }

    fn encode_render<'a>(
        &'a self,
        list: &CommandList,
        pass: &mut wgpu::RenderPass<'a>,
        commands: &[Command],
    ) -> PipelineResult<()> {
        let mut program: Option<ProgramHandle> = None;
        for command in commands {
            match command {
                Command::SetProgram(handle) => {
                    let Pipeline::Render(pipeline) = &self.program(*handle)?.pipeline else {
                        return Err(malformed(list, "compute program in a render pass"));
                    };
                    pass.set_pipeline(pipeline);
                    program = Some(*handle);
                }
                Command::SetBindings(bindings) => {
                    let handle = program.ok_or_else(|| malformed(list, "bindings set before a program"))?;
                    pass.set_bind_group(0, self.bind_group(handle, bindings)?, &[]);
                }
                Command::SetViewport(viewport) => {
                    pass.set_viewport(viewport.x, viewport.y, viewport.width, viewport.height, 0.0, 1.0);
                }
                Command::SetVertexBuffer { buffer, offset } => {
                    pass.set_vertex_buffer(0, self.buffer(*buffer)?.slice(*offset..));
                }
                Command::SetIndexBuffer { buffer, offset } => {
                    pass.set_index_buffer(self.buffer(*buffer)?.slice(*offset..), wgpu::IndexFormat::Uint32);
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => pass.draw(
                    *first_vertex..*first_vertex + *vertex_count,
                    *first_instance..*first_instance + *instance_count,
                ),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    base_vertex,
                    first_instance,
                } => pass.draw_indexed(
                    *first_index..*first_index + *index_count,
                    *base_vertex,
                    *first_instance..*first_instance + *instance_count,
                ),
                Command::DrawIndexedIndirectCount {
                    args,
                    args_offset,
                    count_buffer,
                    count_offset,
                    max_count,
                } => {
                    let args = self.buffer(*args)?;
                    if self.capabilities.indirect_count {
                        pass.multi_draw_indexed_indirect_count(
                            args,
                            *args_offset,
                            self.buffer(*count_buffer)?,
                            *count_offset,
                            *max_count,
                        );
                    } else if self.capabilities.multi_draw_indirect {
                        // Entries past the count were zeroed, so they draw nothing
                        pass.multi_draw_indexed_indirect(args, *args_offset, *max_count);
                    } else {
                        for draw in 0..*max_count as u64 {
                            pass.draw_indexed_indirect(args, *args_offset + draw * DRAW_ARGS_STRIDE);
                        }
                    }
                }
                other => return Err(malformed(list, format!("{:?} inside a render pass", other))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferHandle, TextureHandle};

    #[test]
    fn test_pass_end_finds_matching_close() {
        let mut list = CommandList::new("passes");
        {
            let mut pass = list.begin_compute_pass("cs");
            pass.dispatch(1, 1, 1);
        }
        list.clear_buffer(BufferHandle(0), 0, None);
        {
            let _pass = list.begin_render_pass(
                "rs",
                None,
                Some(DepthAttachment {
                    texture: TextureHandle(1),
                    load: LoadOp::Clear(1.0),
                }),
            );
        }

        assert_eq!(pass_end(&list, 0, true).unwrap(), 2);
        assert_eq!(pass_end(&list, 4, false).unwrap(), 5);
        assert!(pass_end(&list, 4, true).is_err());
    }

    #[test]
    fn test_load_ops() {
        assert_eq!(depth_load(LoadOp::Clear(1.0)), wgpu::LoadOp::Clear(1.0));
        assert_eq!(
            color_load(LoadOp::Clear([1.0, 0.0, 0.0, 1.0])),
            wgpu::LoadOp::Clear(wgpu::Color::RED)
        );
        assert_eq!(color_load(LoadOp::Load), wgpu::LoadOp::Load);
    }
}
