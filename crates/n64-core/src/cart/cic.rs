/// CIC (Copy protection IC) detection and initial register setup.
///
/// The N64 cartridge contains a CIC chip that handshakes with the PIF
/// during boot. The IPL3 bootloader code (ROM bytes 0x40..0x1000) is
/// different for each CIC variant, and each expects specific initial
/// register values to pass its checksum.
///
/// Detection hashes the IPL3 region with CRC32 and matches it against
/// the known boot code images.
use super::rom::TvType;

/// Known CIC chip variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CicVariant {
    X101,
    X102,
    X103,
    X105,
    X106,
}

impl std::fmt::Display for CicVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X101 => write!(f, "CIC-NUS-6101 (Star Fox 64, etc.)"),
            Self::X102 => write!(f, "CIC-NUS-6102 (most common: Mario 64, etc.)"),
            Self::X103 => write!(f, "CIC-NUS-6103 (Banjo-Kazooie, etc.)"),
            Self::X105 => write!(f, "CIC-NUS-6105 (Zelda OoT, Majora's Mask, etc.)"),
            Self::X106 => write!(f, "CIC-NUS-6106 (F-Zero X, Yoshi's Story, etc.)"),
        }
    }
}

impl CicVariant {
    /// Seed loaded into every checksum accumulator.
    pub fn checksum_seed(self) -> u32 {
        match self {
            Self::X101 | Self::X102 => 0xF8CA_4DDC,
            Self::X103 => 0xA388_6759,
            Self::X105 => 0xDF26_F436,
            Self::X106 => 0x1FEA_617A,
        }
    }

    /// Seed the PIF hands IPL3 in s6 (r22).
    pub fn boot_seed(self) -> u64 {
        match self {
            Self::X101 | Self::X102 => 0x3F,
            Self::X103 => 0x78,
            Self::X105 => 0x91,
            Self::X106 => 0x85,
        }
    }
}

pub const IPL3_START: usize = 0x40;
pub const IPL3_END: usize = 0x1000;

/// CRC32 of the IPL3 boot code region for CIC detection.
fn hash_ipl3(rom_data: &[u8]) -> u32 {
    crc32fast::hash(&rom_data[IPL3_START..IPL3_END])
}

pub fn detect(rom_data: &[u8]) -> CicVariant {
    if rom_data.len() < IPL3_END {
        log::warn!("ROM shorter than IPL3, assuming CIC-6102");
        return CicVariant::X102;
    }
    let hash = hash_ipl3(rom_data);
    log::debug!("IPL3 CRC32: {:#010X}", hash);

    match hash {
        0x6170_A4A1 => CicVariant::X101,
        0x90BB_6CB5 => CicVariant::X102,
        0x0B05_0EE0 => CicVariant::X103,
        0x98BC_2C86 => CicVariant::X105,
        0xACC8_580A => CicVariant::X106,
        _ => {
            log::warn!("Unknown CIC variant (IPL3 CRC32: {:#010X}), assuming CIC-6102", hash);
            CicVariant::X102
        }
    }
}

/// IPL2 fragment the 6105 IPL3 expects to find in IMEM.
pub const X105_IPL2: [u32; 8] = [
    0x3C0D_BFC0, // lui   t5, 0xBFC0
    0x8DA8_07FC, // lw    t0, 0x07FC(t5)
    0x25AD_07C0, // addiu t5, t5, 0x07C0
    0x3108_0080, // andi  t0, t0, 0x0080
    0x5500_FFFC, // bnezl t0, -4
    0x3C0D_BFC0, // lui   t5, 0xBFC0
    0x8DA8_0024, // lw    t0, 0x0024(t5)
    0x3C0B_B000, // lui   t3, 0xB000
];

/// Set the register values the PIF leaves behind for this CIC and region.
pub fn apply_initial_regs(variant: CicVariant, tv: TvType, gpr: &mut [u64; 32]) {
    let pal = tv != TvType::Ntsc;

    // Common to all CIC variants
    gpr[6] = 0xFFFF_FFFF_A400_1F0C;
    gpr[7] = 0xFFFF_FFFF_A400_1F08;
    gpr[8] = 0x0000_00C0;
    gpr[10] = 0x0000_0040;
    gpr[11] = 0xFFFF_FFFF_A400_0040; // $t3
    gpr[19] = 0; // cartridge boot
    gpr[20] = tv as u64;
    gpr[21] = 0;
    gpr[22] = variant.boot_seed();
    gpr[23] = 0;
    gpr[29] = 0xFFFF_FFFF_A400_1FF0; // $sp

    if pal {
        gpr[23] = 0x0000_0006;
        gpr[31] = 0xFFFF_FFFF_A400_1554;
    } else {
        gpr[24] = 0x0000_0003;
        gpr[31] = 0xFFFF_FFFF_A400_1550;
    }

    match variant {
        CicVariant::X101 => {}
        CicVariant::X102 => {
            gpr[1] = 0x0000_0001;
            gpr[2] = 0x0EBD_A536;
            gpr[3] = 0x0EBD_A536;
            gpr[4] = 0x0000_A536;
            gpr[12] = 0xFFFF_FFFF_ED10_D0B3;
            gpr[13] = 0x1402_A4CC;
            gpr[15] = 0x3103_E121;
            gpr[25] = 0xFFFF_FFFF_9DEB_B54F;
            if pal {
                gpr[5] = 0xFFFF_FFFF_C0F1_D859;
                gpr[14] = 0x2DE1_08EA;
                gpr[24] = 0;
            } else {
                gpr[5] = 0xFFFF_FFFF_C959_73D5;
                gpr[14] = 0x2449_A366;
            }
        }
        CicVariant::X103 => {
            gpr[1] = 0x0000_0001;
            gpr[2] = 0x49A5_EE96;
            gpr[3] = 0x49A5_EE96;
            gpr[4] = 0x0000_EE96;
            gpr[12] = 0xFFFF_FFFF_CE9D_FBF7;
            gpr[13] = 0xFFFF_FFFF_CE9D_FBF7;
            gpr[15] = 0x18B6_3D28;
            gpr[25] = 0xFFFF_FFFF_825B_21C9;
            if pal {
                gpr[5] = 0xFFFF_FFFF_D464_6273;
                gpr[14] = 0x1AF9_9984;
                gpr[24] = 0;
            } else {
                gpr[5] = 0xFFFF_FFFF_9531_5A28;
                gpr[14] = 0x5BAC_A1DF;
            }
        }
        CicVariant::X105 => {
            gpr[11] = 0xFFFF_FFFF_A400_0040;
            gpr[29] = 0xFFFF_FFFF_A400_1FF0;
            gpr[31] = 0xFFFF_FFFF_A400_1550;
            if pal {
                gpr[5] = 0xFFFF_FFFF_DECA_AAD1;
                gpr[14] = 0x0CF8_5C13;
                gpr[24] = 0x0000_0002;
            } else {
                gpr[5] = 0x5493_FB9A;
                gpr[14] = 0xFFFF_FFFF_C2C2_0384;
            }
        }
        CicVariant::X106 => {
            gpr[1] = 0;
            gpr[2] = 0xFFFF_FFFF_A959_30A4;
            gpr[3] = 0xFFFF_FFFF_A959_30A4;
            gpr[4] = 0x0000_30A4;
            gpr[12] = 0xFFFF_FFFF_BCB5_9510;
            gpr[13] = 0xFFFF_FFFF_BCB5_9510;
            gpr[15] = 0x7A3C_07F4;
            gpr[22] = 0x0000_0085;
            gpr[25] = 0x465E_3F72;
            if pal {
                gpr[5] = 0xFFFF_FFFF_B04D_C903;
                gpr[14] = 0x1AF9_9984;
                gpr[24] = 0x0000_0002;
            } else {
                gpr[5] = 0xFFFF_FFFF_E067_221F;
                gpr[14] = 0x5CD2_B70F;
            }
        }
    }
}
