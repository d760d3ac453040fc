//! NES mapper number tables.
//!
//! The iNES mapper space is sparse; the table below covers the mappers
//! that actually shipped in licensed or common unlicensed carts and is
//! searched by binary search. TNES (3DS Virtual Console) uses its own
//! numbering and is remapped to iNES numbers first.

/// Sorted `(iNES mapper, name)` pairs.
static INES_MAPPERS: &[(u16, &str)] = &[
    (0, "NROM"),
    (1, "SxROM (MMC1)"),
    (2, "UxROM"),
    (3, "CNROM"),
    (4, "TxROM (MMC3/MMC6)"),
    (5, "ExROM (MMC5)"),
    (7, "AxROM"),
    (9, "PxROM (MMC2)"),
    (10, "FxROM (MMC4)"),
    (11, "Color Dreams"),
    (13, "CPROM"),
    (16, "Bandai FCG-x"),
    (18, "Jaleco SS 88006"),
    (19, "Namco 129/163"),
    (21, "Konami VRC4a/VRC4c"),
    (22, "Konami VRC2a"),
    (23, "Konami VRC4e/VRC4f/VRC2b"),
    (24, "Konami VRC6a"),
    (25, "Konami VRC4b/VRC4d"),
    (26, "Konami VRC6b"),
    (32, "Irem G-101"),
    (33, "Taito TC0190"),
    (34, "BNROM / NINA-001"),
    (48, "Taito TC0690"),
    (64, "RAMBO-1"),
    (65, "Irem H3001"),
    (66, "GxROM / MHROM"),
    (67, "Sunsoft-3"),
    (68, "Sunsoft-4"),
    (69, "Sunsoft FME-7"),
    (70, "Family Trainer"),
    (71, "Codemasters"),
    (73, "Konami VRC3"),
    (75, "Konami VRC1"),
    (76, "Namco 109 variant"),
    (77, "Napoleon Senki"),
    (78, "Holy Diver / Cosmo Carrier"),
    (80, "Taito X1-005"),
    (82, "Taito X1-017"),
    (85, "Konami VRC7"),
    (86, "Jaleco JF-13"),
    (87, "CNROM variant"),
    (88, "Namco 118 variant"),
    (89, "Sunsoft-2 (Sunsoft-3 board)"),
    (92, "Jaleco JF-19"),
    (93, "Sunsoft-2 (Sunsoft-3R board)"),
    (94, "HVC-UN1ROM"),
    (95, "NAMCOT-3425"),
    (97, "Irem TAM-S1"),
    (105, "NES-EVENT"),
    (118, "TxSROM (MMC3)"),
    (119, "TQROM (MMC3)"),
    (159, "Bandai FCG (LZ93D50 + 24C01)"),
    (180, "Crazy Climber"),
    (184, "Sunsoft-1"),
    (185, "CNROM with protection diodes"),
    (206, "DxROM (Namco 118 / MIMIC-1)"),
    (210, "Namco 175/340"),
    (228, "Active Enterprises"),
    (232, "Camerica/Capcom"),
];

/// Look up an iNES mapper name.
pub(crate) fn mapper_name(mapper: u16) -> Option<&'static str> {
    INES_MAPPERS
        .binary_search_by_key(&mapper, |&(n, _)| n)
        .ok()
        .map(|i| INES_MAPPERS[i].1)
}

/// TNES mapper number → iNES mapper number. 255 entries mean "no iNES
/// equivalent"; mapper 100 is the FDS container, handled elsewhere.
static TNES_TO_INES: &[u8; 52] = &[
    0, 1, 9, 4, 10, 5, 2, 3, 66, 7, // 0-9
    184, 89, 67, 68, 69, 70, 75, 22, 23, 73, // 10-19
    21, 25, 255, 255, 255, 24, 26, 85, 87, 48, // 20-29
    92, 86, 18, 93, 94, 95, 19, 76, 88, 118, // 30-39
    33, 255, 48, 80, 82, 77, 97, 78, 255, 32, // 40-49
    65, 185, // 50-51
];

/// Remap a TNES mapper number to its iNES equivalent.
pub(crate) fn tnes_to_ines_mapper(tnes: u8) -> Option<u16> {
    let v = *TNES_TO_INES.get(tnes as usize)?;
    if v == 255 { None } else { Some(v as u16) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_table_is_sorted() {
        assert!(INES_MAPPERS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_mapper_lookup() {
        assert_eq!(mapper_name(0), Some("NROM"));
        assert_eq!(mapper_name(4), Some("TxROM (MMC3/MMC6)"));
        assert_eq!(mapper_name(6), None);
    }

    #[test]
    fn test_tnes_remap() {
        assert_eq!(tnes_to_ines_mapper(0), Some(0));
        assert_eq!(tnes_to_ines_mapper(1), Some(1)); // SxROM
        assert_eq!(tnes_to_ines_mapper(2), Some(9)); // PxROM
        assert_eq!(tnes_to_ines_mapper(9), Some(7)); // AxROM
        assert_eq!(tnes_to_ines_mapper(22), None); // VRC4C
        assert_eq!(tnes_to_ines_mapper(60), None); // out of range
    }
}
