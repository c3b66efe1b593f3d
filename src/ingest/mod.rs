//! Frame sources.
//!
//! The platform camera lives outside this crate and pushes frames through
//! `PipelineHandle::submit_frame`. `SyntheticSource` stands in for it in the daemon's
//! replay mode and in tests: it produces readable frames at a fixed rate so a scripted
//! recognizer can be driven frame by frame.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::now_ms;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second; 0 = as fast as the caller pulls.
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            target_fps: 5,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    /// Changes every 50 frames so consecutive scenes differ.
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!(
                "synthetic source needs non-zero dimensions (got {}x{})",
                config.width,
                config.height
            ));
        }
        log::info!(
            "synthetic source: {}x{} @ {} fps",
            config.width,
            config.height,
            config.target_fps
        );
        Ok(Self {
            config,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        })
    }

    pub fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.config.target_fps.max(1) as u64)
        }
    }

    /// Produce the next frame, sleeping to honour `target_fps`.
    pub fn next_frame(&mut self) -> Frame {
        let interval = self.frame_interval();
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
        self.capture()
    }

    /// Produce the next frame immediately.
    pub fn capture(&mut self) -> Frame {
        self.frame_count += 1;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count = (self.config.width as usize) * (self.config.height as usize);
        let offset = self.frame_count + self.scene_state as u64;
        let pixels = (0..pixel_count)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
            now_ms(),
        )
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
        }
    }
}
