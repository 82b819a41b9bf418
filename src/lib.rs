//! Direct3D 11 shader interception, hunting and hot-reload.
//!
//! Built as a `d3d11.dll` replacement that sits next to the game. Every shader the game creates
//! is identified by a hash of its bytecode; replacements found in the fixes directory are
//! compiled or assembled, validated and swapped in without restarting the game.

pub mod asm;
pub mod driver;
pub mod hook;
pub mod hunting;
pub mod input;
pub mod logging;
pub mod notice;
pub mod registry;
pub mod reload;
pub mod service;
pub mod settings;
pub mod shaders;
pub mod wrap;

#[cfg(windows)]
pub mod d3d11;

#[cfg(test)]
mod testing;

#[cfg(all(windows, not(test)))]
#[ctor::ctor]
fn load() {
    d3d11::init();
}

#[cfg(all(windows, not(test)))]
#[ctor::dtor]
fn unload() {
    d3d11::shutdown();
}
