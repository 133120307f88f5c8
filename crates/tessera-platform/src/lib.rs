// SPDX-License-Identifier: CEPL-1.0
//! Window ownership and an explicit event pump.
//!
//! The render loop polls [`Platform::pump`] once per iteration and reads the
//! returned [`PumpResult`]; nothing is delivered through callbacks.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tessera_render::{DrawableSurface, RenderSize};
use tracing::{debug, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

/// What happened since the previous pump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpResult {
    pub resized: bool,
    pub close_requested: bool,
}

#[derive(Default)]
struct PumpState {
    attrs: WindowAttributes,
    created: Option<Window>,
    window_id: Option<WindowId>,
    create_error: Option<OsError>,
    pending: PumpResult,
}

impl ApplicationHandler for PumpState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window_id.is_some() {
            return;
        }
        match event_loop.create_window(self.attrs.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                info!("window created ({}x{})", size.width, size.height);
                self.window_id = Some(window.id());
                self.created = Some(window);
            }
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if self.window_id != Some(id) {
            return;
        }
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.pending.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                debug!("Resized → {}x{}", size.width, size.height);
                self.pending.resized = true;
            }
            _ => {}
        }
    }
}

// Field order is drop order: the window goes before its event loop.
pub struct Platform {
    window: Window,
    state: PumpState,
    event_loop: EventLoop<()>,
}

impl Platform {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let attrs = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height));
        let mut state = PumpState {
            attrs,
            ..Default::default()
        };

        let window = loop {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::ZERO), &mut state)
            {
                return Err(anyhow!("event loop exited ({code}) before a window was created"));
            }
            if let Some(e) = state.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if let Some(window) = state.created.take() {
                break window;
            }
        };

        Ok(Self {
            window,
            state,
            event_loop,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Drains pending events without blocking.
    pub fn pump(&mut self) -> PumpResult {
        self.pump_with(Some(Duration::ZERO));
        std::mem::take(&mut self.state.pending)
    }

    fn pump_with(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            debug!("event loop exited with code {code}");
            self.state.pending.close_requested = true;
        }
    }
}

impl DrawableSurface for Platform {
    fn drawable_size(&self) -> RenderSize {
        let size = self.window().inner_size();
        RenderSize {
            width: size.width,
            height: size.height,
        }
    }

    fn wait_events(&mut self) {
        // A close raised while blocked stays pending for the next pump().
        self.pump_with(None);
    }

    fn close_requested(&self) -> bool {
        self.state.pending.close_requested
    }

    fn resize_handled(&mut self) {
        self.state.pending.resized = false;
    }
}
