//! Per-stage GPU timing over a ring of delayed timestamp readbacks
//!
//! Each ring slot owns a contiguous block of queries in one heap and a readback
//! buffer. A slot is read back only when the frame that wrote it comes around
//! again, after waiting on that frame's fence, so timing never stalls the GPU.

use crate::culling::RenderPath;
use crate::error::PipelineResult;
use crate::gpu::{
    BufferDesc, BufferHandle, BufferUsage, CommandList, FenceValue, GpuBackend, MemoryKind,
    QueryHeapHandle, ResourceState,
};

const TIMESTAMP_BYTES: u64 = 8;

/// Start/end query pair of one measured stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerQuery {
    pub start: u32,
    pub end: u32,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub label: &'static str,
    pub milliseconds: f64,
}

/// Timings of one completed frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTimings {
    pub frame_index: u64,
    pub path: RenderPath,
    pub stages: Vec<StageTiming>,
    pub total_ms: f64,
}

impl FrameTimings {
    pub fn stage(&self, label: &str) -> Option<f64> {
        self.stages.iter().find(|s| s.label == label).map(|s| s.milliseconds)
    }

    /// Sum of the measured stages, excluding gaps between them
    pub fn stage_sum(&self) -> f64 {
        self.stages.iter().map(|s| s.milliseconds).sum()
    }
}

struct RingSlot {
    base: u32,
    readback: BufferHandle,
    queries: Vec<TimerQuery>,
    frame: Option<TimerQuery>,
    next_query: u32,
    fence: Option<FenceValue>,
    frame_index: u64,
    path: RenderPath,
}

impl RingSlot {
    fn reset(&mut self, frame_index: u64, path: RenderPath) {
        self.queries.clear();
        self.frame = None;
        self.next_query = 0;
        self.fence = None;
        self.frame_index = frame_index;
        self.path = path;
    }
}

pub struct GpuTimer {
    heap: QueryHeapHandle,
    frequency: f64,
    queries_per_frame: u32,
    ring: Vec<RingSlot>,
    cursor: usize,
    frame_index: u64,
    latest: Option<FrameTimings>,
}

/// Elapsed milliseconds between two raw timestamps
pub fn ticks_to_ms(start: u64, end: u64, frequency: f64) -> f64 {
    if frequency <= 0.0 {
        return 0.0;
    }
    end.saturating_sub(start) as f64 / frequency * 1000.0
}

impl GpuTimer {
    /// `None` when the device has no timestamp queries
    pub fn new<B: GpuBackend + ?Sized>(backend: &mut B, stage_count: usize, delay: u32) -> PipelineResult<Option<Self>> {
        let caps = backend.capabilities();
        if !caps.timestamp_queries {
            log::warn!("[GpuTimer::new] Timestamp queries unsupported, stage timings disabled");
            return Ok(None);
        }
        let frequency = caps.timestamp_frequency;
        let depth = delay.max(1) as usize;
        // One pair per stage plus the frame total
        let queries_per_frame = 2 * (stage_count as u32 + 1);
        let heap = backend.create_timestamp_heap(queries_per_frame * depth as u32)?;

        let mut ring = Vec::with_capacity(depth);
        for i in 0..depth {
            let readback = backend.create_buffer(
                &BufferDesc::new(
                    format!("Timestamp Readback [{}]", i),
                    queries_per_frame as u64 * TIMESTAMP_BYTES,
                    BufferUsage::READBACK | BufferUsage::COPY_DST,
                )
                .memory(MemoryKind::Readback)
                .state(ResourceState::CopyDest),
            )?;
            ring.push(RingSlot {
                base: i as u32 * queries_per_frame,
                readback,
                queries: Vec::new(),
                frame: None,
                next_query: 0,
                fence: None,
                frame_index: 0,
                path: RenderPath::Occlusion,
            });
        }

        log::info!(
            "[GpuTimer::new] {} queries per frame, {} frame delay, {:.0} ticks/s",
            queries_per_frame,
            depth,
            frequency
        );
        Ok(Some(Self {
            heap,
            frequency,
            queries_per_frame,
            ring,
            cursor: 0,
            frame_index: 0,
            latest: None,
        }))
    }

    pub fn delay(&self) -> usize {
        self.ring.len()
    }

    /// Most recent completed frame, lagging the current one by the ring depth
    pub fn latest(&self) -> Option<&FrameTimings> {
        self.latest.as_ref()
    }

    /// Collect the slot written `delay` frames ago and start recording into it
    pub fn begin_frame<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        list: &mut CommandList,
        path: RenderPath,
    ) -> PipelineResult<()> {
        let frequency = self.frequency;
        let slot = &mut self.ring[self.cursor];
        if let Some(fence) = slot.fence {
            backend.wait_for_fence(fence)?;
            let used = slot.next_query as u64;
            let bytes = backend.read_buffer(slot.readback, 0, used * TIMESTAMP_BYTES)?;
            let ticks: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes);
            let elapsed = |q: &TimerQuery| {
                let local = |index: u32| ticks.get((index - slot.base) as usize).copied().unwrap_or(0);
                ticks_to_ms(local(q.start), local(q.end), frequency)
            };
            let timings = FrameTimings {
                frame_index: slot.frame_index,
                path: slot.path,
                stages: slot
                    .queries
                    .iter()
                    .map(|q| StageTiming {
                        label: q.label,
                        milliseconds: elapsed(q),
                    })
                    .collect(),
                total_ms: slot.frame.as_ref().map(elapsed).unwrap_or(0.0),
            };
            log::trace!(
                "[GpuTimer::begin_frame] Frame {} ({}) took {:.3} ms on the GPU",
                timings.frame_index,
                timings.path,
                timings.total_ms
            );
            self.latest = Some(timings);
        }

        slot.reset(self.frame_index, path);
        let start = slot.base;
        slot.next_query = 1;
        slot.frame = Some(TimerQuery {
            start,
            end: start,
            label: "Frame",
        });
        list.write_timestamp(self.heap, start);
        Ok(())
    }

    fn allocate(&mut self) -> Option<u32> {
        let slot = &mut self.ring[self.cursor];
        if slot.next_query >= self.queries_per_frame {
            return None;
        }
        let index = slot.base + slot.next_query;
        slot.next_query += 1;
        Some(index)
    }

    /// Open a stage measurement; returns its index for [`GpuTimer::end`]
    pub fn begin(&mut self, list: &mut CommandList, label: &'static str) -> Option<usize> {
        let start = self.allocate()?;
        list.write_timestamp(self.heap, start);
        let slot = &mut self.ring[self.cursor];
        slot.queries.push(TimerQuery { start, end: start, label });
        Some(slot.queries.len() - 1)
    }

    pub fn end(&mut self, list: &mut CommandList, scope: Option<usize>) {
        let Some(scope) = scope else { return };
        let Some(end) = self.allocate() else { return };
        list.write_timestamp(self.heap, end);
        if let Some(query) = self.ring[self.cursor].queries.get_mut(scope) {
            query.end = end;
        }
    }

    /// Close the frame measurement and resolve this slot's queries
    pub fn end_frame(&mut self, list: &mut CommandList) {
        let Some(end) = self.allocate() else { return };
        list.write_timestamp(self.heap, end);
        let slot = &mut self.ring[self.cursor];
        if let Some(frame) = slot.frame.as_mut() {
            frame.end = end;
        }
        list.resolve_timestamps(self.heap, slot.base, slot.next_query, slot.readback, 0);
    }

    /// Attach the fence of the submission that carries this slot's queries
    pub fn mark_submitted(&mut self, fence: FenceValue) {
        self.ring[self.cursor].fence = Some(fence);
        self.cursor = (self.cursor + 1) % self.ring.len();
        self.frame_index += 1;
    }

    /// Drop in-flight measurements; the caller has waited for GPU idle
    pub fn reset(&mut self) {
        for slot in &mut self.ring {
            slot.reset(0, RenderPath::Occlusion);
        }
        self.cursor = 0;
        log::debug!("[GpuTimer::reset] Timestamp ring cleared at frame {}", self.frame_index);
    }

    pub fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        for slot in &self.ring {
            backend.destroy_buffer(slot.readback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn run_frame(backend: &mut SoftwareBackend, timer: &mut GpuTimer) {
        let mut list = CommandList::new("frame");
        timer.begin_frame(backend, &mut list, RenderPath::Occlusion).unwrap();
        let scope = timer.begin(&mut list, "Clear");
        list.clear_buffer(BufferHandle(0), 0, None);
        timer.end(&mut list, scope);
        timer.end_frame(&mut list);
        let fence = backend.submit(list).unwrap();
        timer.mark_submitted(fence);
    }

    #[test]
    fn test_ticks_to_ms() {
        assert_eq!(ticks_to_ms(0, 1_000_000, 1.0e9), 1.0);
        assert_eq!(ticks_to_ms(10, 5, 1.0e9), 0.0);
        assert_eq!(ticks_to_ms(0, 5, 0.0), 0.0);
    }

    #[test]
    fn test_results_arrive_after_ring_delay() {
        let mut backend = SoftwareBackend::new(8, 8);
        backend
            .create_buffer(
                &BufferDesc::new("scratch", 64, BufferUsage::STORAGE | BufferUsage::COPY_DST)
                    .state(ResourceState::CopyDest),
            )
            .unwrap();
        let mut timer = GpuTimer::new(&mut backend, 1, 3).unwrap().unwrap();

        for _ in 0..3 {
            run_frame(&mut backend, &mut timer);
            assert!(timer.latest().is_none());
        }
        run_frame(&mut backend, &mut timer);
        let timings = timer.latest().unwrap();
        assert_eq!(timings.frame_index, 0);
        assert_eq!(timings.stages.len(), 1);
        assert!(timings.stage("Clear").unwrap() > 0.0);
        assert!(timings.total_ms >= timings.stage_sum());
    }

    #[test]
    fn test_disabled_without_timestamp_support() {
        let mut caps = SoftwareBackend::default_capabilities();
        caps.timestamp_queries = false;
        let mut backend = SoftwareBackend::with_capabilities(8, 8, caps);
        assert!(GpuTimer::new(&mut backend, 4, 3).unwrap().is_none());
    }
}
