// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tessera_render::{DrawableSurface, FrameStatus, RenderSize};
use tessera_render_vk::{
    AcquireOutcome, FrameBackend, FrameScheduler, FrameUniforms, PresentOutcome, RebuildReason,
    SwapchainFactory, SwapchainManager, MAX_FRAMES_IN_FLIGHT,
};

/// Host-side model of a slot: the fence and whether the GPU still owns the
/// slot's command buffer and uniform buffer.
#[derive(Clone, Copy, Debug)]
struct SlotState {
    fence_signaled: bool,
    gpu_busy: bool,
    waited_since_submit: bool,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            fence_signaled: true,
            gpu_busy: false,
            waited_since_submit: true,
        }
    }
}

struct SimBackend {
    rng: StdRng,
    slots: [SlotState; MAX_FRAMES_IN_FLIGHT],
    image_count: u32,
    next_image: u32,
    acquired: Option<u32>,
    rebuilds: Vec<RebuildReason>,
    presents: u64,
    skipped_acquires: u64,
}

impl SimBackend {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            slots: [SlotState::default(); MAX_FRAMES_IN_FLIGHT],
            image_count: 3,
            next_image: 0,
            acquired: None,
            rebuilds: Vec::new(),
            presents: 0,
            skipped_acquires: 0,
        }
    }

    /// The GPU finishes some outstanding work at arbitrary points.
    fn maybe_complete_gpu_work(&mut self) {
        for s in &mut self.slots {
            if s.gpu_busy && self.rng.gen_bool(0.3) {
                s.gpu_busy = false;
                s.fence_signaled = true;
            }
        }
    }
}

impl FrameBackend for SimBackend {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let s = &mut self.slots[slot];
        s.gpu_busy = false;
        s.fence_signaled = true;
        s.waited_since_submit = true;
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        assert!(self.slots[slot].waited_since_submit, "acquire before fence wait");
        self.maybe_complete_gpu_work();
        if self.rng.gen_bool(0.03) {
            self.skipped_acquires += 1;
            return Ok(AcquireOutcome::OutOfDate);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        self.acquired = Some(index);
        Ok(AcquireOutcome::Image(index))
    }

    fn write_uniforms(&mut self, slot: usize, _uniforms: &FrameUniforms) {
        assert!(!self.slots[slot].gpu_busy, "uniforms written while GPU reads slot {slot}");
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        let s = &mut self.slots[slot];
        assert!(s.fence_signaled, "fence {slot} reset before it was observed signaled");
        assert!(!s.gpu_busy);
        s.fence_signaled = false;
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let s = &self.slots[slot];
        assert!(!s.gpu_busy, "command buffer {slot} reset while in flight");
        assert!(s.waited_since_submit);
        assert_eq!(self.acquired, Some(image_index));
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let s = &mut self.slots[slot];
        assert!(!s.fence_signaled, "submitted with a signaled fence");
        s.gpu_busy = true;
        s.waited_since_submit = false;
        Ok(())
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> Result<PresentOutcome> {
        assert_eq!(self.acquired.take(), Some(image_index));
        self.presents += 1;
        self.maybe_complete_gpu_work();
        let roll: f64 = self.rng.gen();
        Ok(if roll < 0.02 {
            PresentOutcome::Suboptimal
        } else if roll < 0.04 {
            PresentOutcome::OutOfDate
        } else {
            PresentOutcome::Presented
        })
    }

    fn rebuild_swapchain(&mut self, reason: RebuildReason) -> Result<()> {
        assert!(!reason.is_empty());
        self.rebuilds.push(reason);
        self.image_count = self.rng.gen_range(2..=4);
        self.next_image = 0;
        Ok(())
    }
}

#[test]
fn ten_thousand_frames_never_reuse_a_busy_slot() {
    let mut backend = SimBackend::new(0x7e55e4a);
    let mut sched = FrameScheduler::new();
    let mut coin = StdRng::seed_from_u64(9);
    let uniforms = FrameUniforms::identity();

    let mut presented = 0u64;
    let mut skipped = 0u64;
    let mut resizes = 0u64;
    for _ in 0..10_000 {
        if coin.gen_bool(0.01) {
            sched.notify_resized();
            resizes += 1;
        }
        let before = sched.current_frame();
        match sched.draw_frame(&mut backend, &uniforms).unwrap() {
            FrameStatus::Presented => {
                presented += 1;
                assert_eq!(sched.current_frame(), (before + 1) % MAX_FRAMES_IN_FLIGHT);
            }
            FrameStatus::Skipped => {
                skipped += 1;
                assert_eq!(sched.current_frame(), before);
            }
        }
    }

    assert_eq!(presented + skipped, 10_000);
    assert_eq!(backend.presents, presented);
    assert_eq!(backend.skipped_acquires, skipped);
    assert!(skipped > 0 && resizes > 0);
    let out_of_date_acquires = backend
        .rebuilds
        .iter()
        .filter(|r| r.contains(RebuildReason::OUT_OF_DATE))
        .count() as u64;
    assert!(out_of_date_acquires >= skipped);
}

/// Window that is always drawable.
struct Window(RenderSize);

impl DrawableSurface for Window {
    fn drawable_size(&self) -> RenderSize {
        self.0
    }

    fn wait_events(&mut self) {}
}

#[derive(Default)]
struct Counting {
    created: u32,
    destroyed: u32,
}

impl SwapchainFactory for Counting {
    type Chain = u32;

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }

    fn create(&mut self, _size: RenderSize) -> Result<u32> {
        self.created += 1;
        Ok(self.created)
    }

    fn destroy(&mut self, _chain: u32) {
        self.destroyed += 1;
    }
}

/// Presents once with a fixed outcome and forwards rebuilds to a real
/// swapchain manager.
struct OnePresent {
    outcome: PresentOutcome,
    manager: SwapchainManager<Counting>,
    window: Window,
}

impl FrameBackend for OnePresent {
    fn wait_for_slot(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        Ok(AcquireOutcome::Image(0))
    }
    fn write_uniforms(&mut self, _slot: usize, _uniforms: &FrameUniforms) {}
    fn reset_fence(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
    fn record(&mut self, _slot: usize, _image_index: u32) -> Result<()> {
        Ok(())
    }
    fn submit(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
    fn present(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        Ok(self.outcome)
    }
    fn rebuild_swapchain(&mut self, _reason: RebuildReason) -> Result<()> {
        self.manager.recreate(&mut self.window)
    }
}

#[test]
fn suboptimal_present_rebuilds_once_and_still_advances() {
    let size = RenderSize {
        width: 800,
        height: 600,
    };
    let mut backend = OnePresent {
        outcome: PresentOutcome::Suboptimal,
        manager: SwapchainManager::new(Counting::default(), size).unwrap(),
        window: Window(size),
    };
    let mut sched = FrameScheduler::new();

    let status = sched
        .draw_frame(&mut backend, &FrameUniforms::identity())
        .unwrap();

    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(sched.current_frame(), 1);
    assert_eq!(backend.manager.generation(), 1);
    assert_eq!(backend.manager.factory().created, 2);
    assert_eq!(backend.manager.factory().destroyed, 1);
}

#[test]
fn clean_present_does_not_rebuild() {
    let size = RenderSize {
        width: 800,
        height: 600,
    };
    let mut backend = OnePresent {
        outcome: PresentOutcome::Presented,
        manager: SwapchainManager::new(Counting::default(), size).unwrap(),
        window: Window(size),
    };
    let mut sched = FrameScheduler::new();
    for _ in 0..5 {
        sched
            .draw_frame(&mut backend, &FrameUniforms::identity())
            .unwrap();
    }
    assert_eq!(backend.manager.generation(), 0);
    assert_eq!(sched.current_frame(), 5 % MAX_FRAMES_IN_FLIGHT);
}
