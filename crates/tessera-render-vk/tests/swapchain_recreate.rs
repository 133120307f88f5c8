// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeSet;
use tessera_render::{DrawableSurface, RenderSize};
use tessera_render_vk::{SwapchainFactory, SwapchainManager};

/// A chain with per-image views, tracked by id so leaks are visible.
struct FakeChain {
    id: u32,
    size: RenderSize,
    views: Vec<u32>,
}

#[derive(Default)]
struct Tracker {
    next_id: u32,
    live_chains: BTreeSet<u32>,
    live_views: BTreeSet<u32>,
    idle_waits: u32,
    waited_before_destroy: bool,
}

impl SwapchainFactory for Tracker {
    type Chain = FakeChain;

    fn wait_idle(&mut self) -> Result<()> {
        self.idle_waits += 1;
        self.waited_before_destroy = true;
        Ok(())
    }

    fn create(&mut self, size: RenderSize) -> Result<FakeChain> {
        assert!(!size.is_zero(), "zero-sized swapchain requested");
        self.next_id += 1;
        let id = self.next_id;
        let views: Vec<u32> = (0..3).map(|i| id * 10 + i).collect();
        self.live_views.extend(views.iter().copied());
        self.live_chains.insert(id);
        Ok(FakeChain { id, size, views })
    }

    fn destroy(&mut self, chain: FakeChain) {
        assert!(
            std::mem::take(&mut self.waited_before_destroy),
            "chain destroyed without draining the device"
        );
        for v in &chain.views {
            assert!(self.live_views.remove(v));
        }
        assert!(self.live_chains.remove(&chain.id));
    }
}

/// A window that is minimised for a random number of event waits before
/// each new size shows up.
struct StormWindow {
    rng: StdRng,
    size: RenderSize,
    minimised_for: u32,
    waits: u32,
}

impl StormWindow {
    fn resize(&mut self) {
        self.size = RenderSize {
            width: self.rng.gen_range(1..=3840),
            height: self.rng.gen_range(1..=2160),
        };
        self.minimised_for = if self.rng.gen_bool(0.25) {
            self.rng.gen_range(1..=5)
        } else {
            0
        };
    }
}

impl DrawableSurface for StormWindow {
    fn drawable_size(&self) -> RenderSize {
        if self.minimised_for > 0 {
            RenderSize {
                width: 0,
                height: 0,
            }
        } else {
            self.size
        }
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.minimised_for = self.minimised_for.saturating_sub(1);
    }
}

#[test]
fn resize_storm_leaves_exactly_one_live_chain() {
    let start = RenderSize {
        width: 800,
        height: 600,
    };
    let mut mgr = SwapchainManager::new(Tracker::default(), start).unwrap();
    let mut window = StormWindow {
        rng: StdRng::seed_from_u64(42),
        size: start,
        minimised_for: 0,
        waits: 0,
    };

    for n in 1..=200u64 {
        window.resize();
        mgr.recreate(&mut window).unwrap();

        let f = mgr.factory();
        assert_eq!(f.live_chains.len(), 1);
        assert_eq!(f.live_views.len(), 3);
        let chain = mgr.chain().unwrap();
        assert_eq!(chain.size, window.size);
        assert!(f.live_chains.contains(&chain.id));
        assert_eq!(mgr.generation(), n);
    }

    assert_eq!(mgr.factory().idle_waits, 200);
    assert!(window.waits > 0);

    mgr.destroy();
    assert!(mgr.factory().live_chains.is_empty());
    assert!(mgr.factory().live_views.is_empty());
    assert!(mgr.chain().is_none());
}

#[test]
fn minimised_window_defers_rebuild_until_visible() {
    let start = RenderSize {
        width: 640,
        height: 480,
    };
    let mut mgr = SwapchainManager::new(Tracker::default(), start).unwrap();
    let mut window = StormWindow {
        rng: StdRng::seed_from_u64(1),
        size: RenderSize {
            width: 1280,
            height: 720,
        },
        minimised_for: 4,
        waits: 0,
    };

    mgr.recreate(&mut window).unwrap();

    assert_eq!(window.waits, 4);
    assert_eq!(mgr.chain().unwrap().size, window.size);
    assert_eq!(mgr.factory().live_chains.len(), 1);
}
