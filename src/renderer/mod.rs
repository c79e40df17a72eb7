//! Renderer surface contract and a headless implementation.
//!
//! The GPU draw pipeline sits behind [`RendererSurface`]; the coordinator
//! only ever presses and releases keys, asks for the frame rate, resizes and
//! requests frames. [`HeadlessKeyboard`] keeps per-key visual state and a
//! frame-rate meter without drawing anything, which is what the runtime and
//! the tests use.

use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use crate::error::RendererError;
use crate::scheduler::TimeSource;

/// MIDI note numbers 0-127.
pub const KEY_COUNT: usize = 128;

/// Whether `note` is a MIDI note number.
pub fn is_midi_note(note: i32) -> bool {
    usize::try_from(note).is_ok_and(|idx| idx < KEY_COUNT)
}

/// Lowest and highest key of an 88-key piano.
pub const PIANO_LOWEST_NOTE: i32 = 21;
pub const PIANO_HIGHEST_NOTE: i32 = 108;

/// Window the frame rate is averaged over.
const FRAME_RATE_WINDOW_MS: f64 = 1000.0;

pub trait RendererSurface {
    /// Acquire (or re-acquire after context loss) the drawing context.
    fn initialize(&mut self) -> Result<(), RendererError>;

    /// Light a key. Notes outside 0-127 are ignored.
    fn key_down(&mut self, note: i32, velocity: u8);

    /// Release a key. Notes outside 0-127 are ignored.
    fn key_up(&mut self, note: i32);

    /// Frames per second over the most recent second.
    fn frame_rate(&self) -> f64;

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError>;

    fn render_frame(&mut self, now_ms: f64);
}

pub fn is_piano_key(note: i32) -> bool {
    (PIANO_LOWEST_NOTE..=PIANO_HIGHEST_NOTE).contains(&note)
}

/// Visual state of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KeyVisual {
    pub pressed: bool,
    pub velocity: u8,
    /// 0.0-1.0 brightness used when the key is lit.
    pub intensity: f32,
    pub pressed_at: Option<f64>,
    pub released_at: Option<f64>,
}

/// Renderer that tracks key state and frame timing without a GPU.
pub struct HeadlessKeyboard {
    keys: [KeyVisual; KEY_COUNT],
    velocity_mapping: bool,
    clock: Rc<dyn TimeSource>,
    initialized: bool,
    surface: (u32, u32),
    frame_times: VecDeque<f64>,
    frames_rendered: u64,
}

impl HeadlessKeyboard {
    pub fn new(velocity_mapping: bool, clock: Rc<dyn TimeSource>) -> Self {
        Self {
            keys: [KeyVisual::default(); KEY_COUNT],
            velocity_mapping,
            clock,
            initialized: false,
            surface: (0, 0),
            frame_times: VecDeque::new(),
            frames_rendered: 0,
        }
    }

    fn slot(note: i32) -> Option<usize> {
        usize::try_from(note).ok().filter(|idx| *idx < KEY_COUNT)
    }

    pub fn key(&self, note: i32) -> Option<&KeyVisual> {
        Self::slot(note).map(|idx| &self.keys[idx])
    }

    pub fn is_pressed(&self, note: i32) -> bool {
        self.key(note).is_some_and(|key| key.pressed)
    }

    pub fn pressed_keys(&self) -> Vec<i32> {
        (0..KEY_COUNT as i32).filter(|note| self.is_pressed(*note)).collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    fn intensity_for(&self, velocity: u8) -> f32 {
        if self.velocity_mapping {
            f32::from(velocity.min(127)) / 127.0
        } else {
            1.0
        }
    }
}

impl RendererSurface for HeadlessKeyboard {
    fn initialize(&mut self) -> Result<(), RendererError> {
        // Key state survives a context restore.
        self.initialized = true;
        self.frame_times.clear();
        log::debug!("[HeadlessKeyboard] Initialized");
        Ok(())
    }

    fn key_down(&mut self, note: i32, velocity: u8) {
        let Some(idx) = Self::slot(note) else {
            log::debug!("[HeadlessKeyboard] Ignoring key_down for note {}", note);
            return;
        };
        let intensity = self.intensity_for(velocity);
        let now = self.clock.now_ms();
        let key = &mut self.keys[idx];
        key.pressed = true;
        key.velocity = velocity;
        key.intensity = intensity;
        key.pressed_at = Some(now);
        key.released_at = None;
    }

    fn key_up(&mut self, note: i32) {
        let Some(idx) = Self::slot(note) else {
            return;
        };
        let now = self.clock.now_ms();
        let key = &mut self.keys[idx];
        if key.pressed {
            key.pressed = false;
            key.intensity = 0.0;
            key.released_at = Some(now);
        }
    }

    fn frame_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.frame_times.front(), self.frame_times.back()) else {
            return 0.0;
        };
        let span = last - first;
        if span <= 0.0 {
            return 0.0;
        }
        (self.frame_times.len() - 1) as f64 * 1000.0 / span
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError> {
        if !self.initialized {
            return Err(RendererError::NotInitialized);
        }
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidSurface { width, height });
        }
        self.surface = (width, height);
        Ok(())
    }

    fn render_frame(&mut self, now_ms: f64) {
        if !self.initialized {
            return;
        }
        self.frames_rendered += 1;
        self.frame_times.push_back(now_ms);
        while let Some(oldest) = self.frame_times.front() {
            if now_ms - oldest > FRAME_RATE_WINDOW_MS {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;

    fn keyboard(velocity_mapping: bool) -> (ManualClock, HeadlessKeyboard) {
        let clock = ManualClock::new(0.0);
        let mut keyboard = HeadlessKeyboard::new(velocity_mapping, Rc::new(clock.clone()));
        keyboard.initialize().unwrap();
        (clock, keyboard)
    }

    #[test]
    fn key_down_and_up() {
        let (clock, mut keyboard) = keyboard(true);
        keyboard.key_down(60, 127);
        assert!(keyboard.is_pressed(60));
        assert_eq!(keyboard.key(60).unwrap().intensity, 1.0);

        clock.advance(40.0);
        keyboard.key_up(60);
        let key = keyboard.key(60).unwrap();
        assert!(!key.pressed);
        assert_eq!(key.released_at, Some(40.0));
        assert!(keyboard.pressed_keys().is_empty());
    }

    #[test]
    fn velocity_mapping_toggle() {
        let (_, mut mapped) = keyboard(true);
        mapped.key_down(60, 64);
        assert!((mapped.key(60).unwrap().intensity - 64.0 / 127.0).abs() < 1e-6);

        let (_, mut flat) = keyboard(false);
        flat.key_down(60, 1);
        assert_eq!(flat.key(60).unwrap().intensity, 1.0);
    }

    #[test]
    fn out_of_range_notes_are_ignored() {
        let (_, mut keyboard) = keyboard(true);
        keyboard.key_down(-1, 100);
        keyboard.key_down(128, 100);
        keyboard.key_up(500);
        assert!(keyboard.pressed_keys().is_empty());
        assert!(keyboard.key(128).is_none());
        assert!(is_midi_note(0) && is_midi_note(127));
        assert!(!is_midi_note(-1) && !is_midi_note(128));
        assert!(is_piano_key(21) && is_piano_key(108));
        assert!(!is_piano_key(20) && !is_piano_key(109));
    }

    #[test]
    fn frame_rate_over_last_second() {
        let (_, mut keyboard) = keyboard(true);
        assert_eq!(keyboard.frame_rate(), 0.0);
        for frame in 0..=120 {
            keyboard.render_frame(frame as f64 * 20.0);
        }
        assert!((keyboard.frame_rate() - 50.0).abs() < 1e-6);
        assert_eq!(keyboard.frames_rendered(), 121);
    }

    #[test]
    fn resize_requires_initialization_and_valid_size() {
        let clock = ManualClock::default();
        let mut keyboard = HeadlessKeyboard::new(true, Rc::new(clock));
        assert_eq!(keyboard.resize(800, 600), Err(RendererError::NotInitialized));

        keyboard.initialize().unwrap();
        assert_eq!(
            keyboard.resize(0, 600),
            Err(RendererError::InvalidSurface {
                width: 0,
                height: 600
            })
        );
        keyboard.resize(800, 600).unwrap();
        assert_eq!(keyboard.surface_size(), (800, 600));
    }

    #[test]
    fn reinitialize_keeps_key_state() {
        let (_, mut keyboard) = keyboard(true);
        keyboard.key_down(64, 90);
        keyboard.initialize().unwrap();
        assert!(keyboard.is_pressed(64));
    }
}
