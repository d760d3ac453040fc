//! Nintendo ROM and save-file parsers.
//!
//! One module per format:
//!
//! - NES / Famicom / FDS (iNES, NES 2.0, TNES, fwNES, raw FDS)
//! - SNES / Super Famicom / BS-X (with copier-header handling)
//! - Nintendo 64 (four byte orderings)
//! - Virtual Boy
//! - Game Boy Advance
//! - GameCube saves (GCI, GCS, SAV)
//! - Nintendo 3DS family (SMDH, NCCH, NCSD/CCI, CIA, 3DSX) plus the
//!   encrypted-partition readers and the key store they draw from

pub mod gba;
pub mod gcn_save;
pub(crate) mod licensee;
pub mod n3ds;
pub mod n64;
pub mod nes;
pub(crate) mod nes_mappers;
pub mod snes;
pub mod vboy;

pub use gba::GameBoyAdvance;
pub use gcn_save::GameCubeSave;
pub use n3ds::Nintendo3ds;
pub use n3ds::smdh::Smdh;
pub use n64::N64;
pub use nes::Nes;
pub use snes::Snes;
pub use vboy::VirtualBoy;
