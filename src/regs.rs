//! P938x register map and bit definitions.
//!
//! The chip exposes a 16-bit address space with 8-bit registers; multi-byte
//! values are little-endian. Addresses and bit assignments follow the IDT
//! P9382 register reference.

/// Register addresses.
pub mod reg {
    pub const CHIP_ID: u16 = 0x0000; // 16-bit, read-only
    pub const HW_VER: u16 = 0x0002;
    pub const CUST_ID: u16 = 0x0003;
    pub const MTP_FW_MAJ_VER: u16 = 0x0004; // 16-bit
    pub const MTP_FW_MIN_VER: u16 = 0x0006; // 16-bit
    pub const MTP_FW_DATE: u16 = 0x0008; // 12 ASCII bytes
    pub const E2PROM_FW_VER: u16 = 0x001c; // 32-bit
    pub const DEV_STATUS: u16 = 0x0034; // 16-bit, see `status`
    pub const IRQ_STATUS: u16 = 0x0036; // 16-bit, same layout as DEV_STATUS
    pub const IRQ_ENABLE: u16 = 0x0038; // 16-bit
    pub const IRQ_CLEAR: u16 = 0x003a; // 16-bit, write observed bits to ack
    pub const VOUT_SET: u16 = 0x003c; // units of 100 mV
    pub const ILIMIT_SET: u16 = 0x003d; // value * 100 + 100 = mA
    pub const VRECT_READ: u16 = 0x0040; // 16-bit, mV
    pub const VOUT_READ: u16 = 0x0042; // 16-bit, mV
    pub const IOUT_READ: u16 = 0x0044; // 16-bit, mA
    pub const OPT_FREQ: u16 = 0x0048; // 16-bit, kHz
    pub const SYS_MODE: u16 = 0x004a; // see `sys_mode`
    pub const SYS_CMD: u16 = 0x004c; // see `cmd`
    pub const DIE_TEMP: u16 = 0x0066; // 16-bit, raw
}

/// Firmware-programming addresses. These sit outside the normal register
/// window and talk to the M0 boot ROM directly.
pub mod mtp {
    /// Unlock register; write [`KEY_UNLOCK`] before any boot ROM command.
    pub const KEY: u16 = 0x3000;
    pub const KEY_UNLOCK: u8 = 0x5a;

    /// Reset control. 0x10 drops the M0 into the boot ROM; 0x80 is a full
    /// chip reset (no I2C ack is produced, do not wait for one).
    pub const RESET: u16 = 0x3040;
    pub const RESET_HALT_M0: u8 = 0x10;
    pub const RESET_CHIP: u8 = 0x80;

    /// Jump control. 0x80 runs the SRAM downloader in place of the ROM's
    /// normal reply path; 0x00 clears the flag so OTP code runs after reset.
    pub const JUMP: u16 = 0x3048;
    pub const JUMP_SRAM: u8 = 0x80;
    pub const JUMP_CLEAR: u8 = 0x00;

    /// SRAM base where the downloader image is written, one byte at a time.
    pub const DOWNLOADER_BASE: u16 = 0x1c00;

    /// SRAM staging window for firmware packets. Byte 0 doubles as the
    /// handshake status byte, written to [`STATUS_VALIDATED`] by us and
    /// updated by the downloader as it programs the packet into OTP.
    pub const STAGING_BASE: u16 = 0x0400;
    pub const STATUS_RESET: u8 = 0x00;
    pub const STATUS_VALIDATED: u8 = 0x01;
    pub const STATUS_OK: u8 = 0x02;
    pub const STATUS_PROGRAM_ERROR: u8 = 0x04;
    pub const STATUS_BAD_CHECKSUM: u8 = 0x08;
    pub const STATUS_ILLEGAL_CLEAR: u8 = 0x10;
}

/// DEV_STATUS / IRQ_STATUS bits. The two registers share one layout; a bit
/// is actionable only when set in both (level and edge coincide).
pub mod status {
    pub const TX_FOD_FAULT: u16 = 1 << 15; // foreign object detected in tx mode
    pub const TX_CONFLICT: u16 = 1 << 14; // another transmitter on the pad
    pub const RX_CONN: u16 = 1 << 13;
    pub const ADT_ERR: u16 = 1 << 11; // authentication data transfer
    pub const ADT_RCV: u16 = 1 << 9;
    pub const ADT_SENT: u16 = 1 << 8;
    pub const VOUT_ON: u16 = 1 << 7; // LDO output stage energized
    pub const VRECT_ON: u16 = 1 << 6; // rectifier up, field coupled
    pub const MODE_CHANGE: u16 = 1 << 5;
    pub const OVER_TEMP: u16 = 1 << 2;
    pub const OVER_VOLT: u16 = 1 << 1;
    pub const OVER_CURR: u16 = 1 << 0;
}

/// Bit-name table shared by the decode and logging paths.
pub const STATUS_BITS: &[(u16, &str)] = &[
    (status::TX_FOD_FAULT, "TX_FOD_FAULT"),
    (status::TX_CONFLICT, "TX_CONFLICT"),
    (status::RX_CONN, "RX_CONN"),
    (status::ADT_ERR, "ADT_ERR"),
    (status::ADT_RCV, "ADT_RCV"),
    (status::ADT_SENT, "ADT_SENT"),
    (status::VOUT_ON, "VOUT_ON"),
    (status::VRECT_ON, "VRECT_ON"),
    (status::MODE_CHANGE, "MODE_CHANGE"),
    (status::OVER_TEMP, "OVER_TEMP"),
    (status::OVER_VOLT, "OVER_VOLT"),
    (status::OVER_CURR, "OVER_CURR"),
];

/// SYS_MODE bits.
pub mod sys_mode {
    pub const RAMCODE: u8 = 1 << 6; // executing from SRAM (downloader active)
    pub const EXTENDED: u8 = 1 << 3; // EPP profile negotiated
    pub const TXMODE: u8 = 1 << 2;
    pub const WPCMODE: u8 = 1 << 0; // WPC (Qi) protocol active
}

/// SYS_CMD bits.
pub mod cmd {
    pub const RX_RENEGOTIATE: u8 = 1 << 7;
    pub const RX_SWITCH_RAM: u8 = 1 << 6;
    pub const RX_CLR_IRQ: u8 = 1 << 5;
    pub const RX_SEND_CSP: u8 = 1 << 4;
    pub const RX_SEND_EPT: u8 = 1 << 3;
    pub const RX_CFG_TABLE: u8 = 1 << 2;
    pub const RX_TOGGLE_LDO: u8 = 1 << 1;
    pub const RX_SEND_RX_DATA: u8 = 1 << 0;
}

/// Per-profile output defaults, applied on mode detection unless the
/// consumer has supplied overrides.
pub mod limits {
    pub const BPP_MAX_VOUT_MV: u16 = 5000;
    pub const BPP_MAX_IOUT_MA: u16 = 1600;
    pub const EPP_MAX_VOUT_MV: u16 = 12000;
    pub const EPP_MAX_IOUT_MA: u16 = 1600;

    /// Hard setpoint bounds; requests outside are saturated, not rejected.
    pub const MIN_VOUT_SET_MV: u16 = 5000;
    pub const MAX_VOUT_SET_MV: u16 = 12000;
    pub const MIN_IOUT_SET_MA: u16 = 500;
    pub const MAX_IOUT_SET_MA: u16 = 3000;
}

/// Valid CHIP_ID range for the P938x family.
pub const MIN_CHIP_ID: u16 = 0x9380;
pub const MAX_CHIP_ID: u16 = 0x9389;
