//! Opcode catalogue: which exchange each pump command uses.

use crate::command::CommandSpec;

use super::decode::BasalProfile;

/// Copies of the power-on prelude sent back to back to wake a sleeping pump
pub const WAKE_UP_REPEAT: u8 = 200;

/// Fragments in a history or CGM page beyond the first
const PAGE_ACK_REPEATS: u32 = 15;

/// A basal profile spans three fragments
const BASAL_ACK_REPEATS: u32 = 2;

pub const POWER_ON: CommandSpec = CommandSpec::woken_set("power_on", 0x5D, WAKE_UP_REPEAT);
pub const PUSH_BUTTON: CommandSpec = CommandSpec::simple_set("push_button", 0x5B);
pub const READ_TIME: CommandSpec = CommandSpec::simple_get("read_time", 0x70);
pub const READ_BATTERY: CommandSpec = CommandSpec::simple_get("read_battery", 0x72);
pub const READ_RESERVOIR: CommandSpec = CommandSpec::simple_get("read_reservoir", 0x73);
pub const READ_FIRMWARE: CommandSpec = CommandSpec::simple_get("read_firmware", 0x74);
pub const READ_CARB_RATIOS: CommandSpec = CommandSpec::simple_get("read_carb_ratios", 0x8A);
pub const READ_ISF: CommandSpec = CommandSpec::simple_get("read_isf", 0x8B);
pub const READ_MODEL: CommandSpec = CommandSpec::simple_get("read_model", 0x8D);
pub const READ_BASAL_STANDARD: CommandSpec =
    CommandSpec::big_get("read_basal_profile_standard", 0x92, BASAL_ACK_REPEATS);
pub const READ_BASAL_A: CommandSpec = CommandSpec::big_get("read_basal_profile_a", 0x93, BASAL_ACK_REPEATS);
pub const READ_BASAL_B: CommandSpec = CommandSpec::big_get("read_basal_profile_b", 0x94, BASAL_ACK_REPEATS);
pub const READ_TEMP_BASAL: CommandSpec = CommandSpec::simple_get("read_temp_basal", 0x98);
pub const READ_BG_TARGETS: CommandSpec = CommandSpec::simple_get("read_bg_targets", 0x9F);
pub const SET_TEMP_BASAL: CommandSpec = CommandSpec::simple_set("set_temp_basal", 0x4C);
pub const SET_TEMP_BASAL_PERCENT: CommandSpec = CommandSpec::simple_set("set_temp_basal_percent", 0x69);
pub const SET_SUSPEND: CommandSpec = CommandSpec::simple_set("set_suspend", 0x4D);
pub const DELIVER_BOLUS: CommandSpec = CommandSpec::simple_set("deliver_bolus", 0x42);
pub const READ_HISTORY_PAGE_COUNT: CommandSpec = CommandSpec::simple_get("read_history_page_count", 0x9D);
pub const READ_HISTORY_PAGE: CommandSpec = CommandSpec::big_get("read_history_page", 0x80, PAGE_ACK_REPEATS);
pub const READ_CGM_PAGE: CommandSpec = CommandSpec::big_get("read_cgm_page", 0x9A, PAGE_ACK_REPEATS);

/// Every command the facade knows how to exchange
pub const CATALOGUE: &[CommandSpec] = &[
    POWER_ON,
    PUSH_BUTTON,
    READ_TIME,
    READ_BATTERY,
    READ_RESERVOIR,
    READ_FIRMWARE,
    READ_CARB_RATIOS,
    READ_ISF,
    READ_MODEL,
    READ_BASAL_STANDARD,
    READ_BASAL_A,
    READ_BASAL_B,
    READ_TEMP_BASAL,
    READ_BG_TARGETS,
    SET_TEMP_BASAL,
    SET_TEMP_BASAL_PERCENT,
    SET_SUSPEND,
    DELIVER_BOLUS,
    READ_HISTORY_PAGE_COUNT,
    READ_HISTORY_PAGE,
    READ_CGM_PAGE,
];

/// Spec for an opcode, if catalogued
pub fn lookup(opcode: u8) -> Option<CommandSpec> {
    CATALOGUE.iter().copied().find(|spec| spec.opcode == opcode)
}

pub fn basal_profile(profile: BasalProfile) -> CommandSpec {
    match profile {
        BasalProfile::Standard => READ_BASAL_STANDARD,
        BasalProfile::A => READ_BASAL_A,
        BasalProfile::B => READ_BASAL_B,
    }
}
