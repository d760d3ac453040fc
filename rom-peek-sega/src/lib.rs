//! Sega save-file parsers.

pub mod dreamcast;

pub use dreamcast::DreamcastSave;
