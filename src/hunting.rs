//! Finding the shader or buffer responsible for something on screen by cycling through what the
//! last frame used, one item at a time.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::driver::Stage;
use crate::settings::HuntingOptions;
use crate::shaders::ShaderHash;

/// A kind of thing that can be hunted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, IntoStaticStr)]
pub enum Target {
    PixelShader,
    VertexShader,
    IndexBuffer,
    VertexBuffer,
    RenderTarget,
}

impl Target {
    pub fn for_stage(stage: Stage) -> Option<Target> {
        match stage {
            Stage::Pixel => Some(Target::PixelShader),
            Stage::Vertex => Some(Target::VertexShader),
            _ => None,
        }
    }

    pub fn stage(self) -> Option<Stage> {
        match self {
            Target::PixelShader => Some(Stage::Pixel),
            Target::VertexShader => Some(Stage::Vertex),
            _ => None,
        }
    }
}

/// What a selected shader is replaced with while it is selected.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum MarkingMode {
    /// Draws using the shader are skipped.
    Skip,

    /// The original shader is drawn even if a replacement is active.
    Original,
}

#[derive(Default, Debug)]
struct Track {
    this_frame: BTreeSet<u64>,
    last_frame: Vec<u64>,
    selected: Option<u64>,
}

impl Track {
    fn step(&mut self, forward: bool) -> Option<u64> {
        let list = &self.last_frame;

        if list.is_empty() {
            self.selected = None;
            return None;
        }

        let position = self
            .selected
            .and_then(|selected| list.iter().position(|&value| value == selected));

        let next = match (position, forward) {
            (Some(i), true) => (i + 1) % list.len(),
            (Some(i), false) => (i + list.len() - 1) % list.len(),
            (None, true) => 0,
            (None, false) => list.len() - 1,
        };

        self.selected = Some(list[next]);
        self.selected
    }
}

/// Hunting state. Values are shader hashes for the shader targets and resource addresses for
/// the rest.
#[derive(Debug)]
pub struct Hunting {
    enabled: bool,
    mode: MarkingMode,
    tracks: HashMap<Target, Track>,
}

impl Hunting {
    pub fn new(options: HuntingOptions) -> Hunting {
        Hunting {
            enabled: options.enabled,
            mode: options.marking_mode,
            tracks: Target::iter().map(|target| (target, Track::default())).collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> MarkingMode {
        self.mode
    }

    /// Switches hunting on or off. Switching off forgets every selection.
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;

        if !self.enabled {
            for track in self.tracks.values_mut() {
                *track = Track::default();
            }
        }

        self.enabled
    }

    /// Notes that `value` was used during the current frame.
    pub fn visit(&mut self, target: Target, value: u64) {
        if !self.enabled {
            return;
        }

        if let Some(track) = self.tracks.get_mut(&target) {
            track.this_frame.insert(value);
        }
    }

    pub fn visit_shader(&mut self, stage: Stage, hash: ShaderHash) {
        if let Some(target) = Target::for_stage(stage) {
            self.visit(target, hash.0);
        }
    }

    /// Makes the current frame's sets the ones that selection cycles through.
    pub fn end_frame(&mut self) {
        if !self.enabled {
            return;
        }

        for track in self.tracks.values_mut() {
            let this_frame = std::mem::take(&mut track.this_frame);
            track.last_frame = this_frame.into_iter().collect();
        }
    }

    /// Selects the next (or previous) item from the last frame, wrapping around.
    pub fn step(&mut self, target: Target, forward: bool) -> Option<u64> {
        if !self.enabled {
            return None;
        }

        self.tracks.get_mut(&target)?.step(forward)
    }

    pub fn selected(&self, target: Target) -> Option<u64> {
        self.tracks.get(&target)?.selected
    }

    pub fn is_selected(&self, target: Target, value: u64) -> bool {
        self.enabled && self.selected(target) == Some(value)
    }

    pub fn is_shader_selected(&self, stage: Stage, hash: ShaderHash) -> bool {
        Target::for_stage(stage).map_or(false, |target| self.is_selected(target, hash.0))
    }

    /// What the last frame used, in ascending order.
    pub fn seen(&self, target: Target) -> &[u64] {
        self.tracks
            .get(&target)
            .map_or(&[][..], |track| track.last_frame.as_slice())
    }
}
