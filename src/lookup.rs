//! Fixed enumeration tables of the Lambda controller.
//!
//! The controller reports operating modes and states as small integer codes.
//! Each table maps a code to the label used in InfluxDB. Tables are immutable
//! `const` slices sorted by code so lookups can use binary search.

use std::fmt;
use std::str::FromStr;

/// Heat pump operating mode.
pub const HEAT_PUMP_MODE: &[(i64, &str)] = &[
    (0, "STBY"),
    (1, "CH"),
    (2, "DHW"),
    (3, "CC"),
    (4, "CIRCULATE"),
    (5, "DEFROST"),
    (6, "OFF"),
    (7, "FROST"),
    (8, "STBY-FROST"),
    (10, "SUMMER"),
    (11, "HOLIDAY"),
    (12, "ERROR"),
    (13, "WARNING"),
    (14, "INFO-MESSAGE"),
    (15, "TIME-BLOCK"),
    (16, "RELEASE-BLOCK"),
    (17, "MINTEMP-BLOCK"),
    (18, "FIRMWARE-DOWNLOAD"),
];

/// Heat pump compressor state.
pub const HEAT_PUMP_STATE: &[(i64, &str)] = &[
    (0, "INIT"),
    (1, "REFERENCE"),
    (2, "RESTART-BLOCK"),
    (3, "READY"),
    (4, "START PUMPS"),
    (5, "START COMPRESSOR"),
    (6, "PRE-REGULATION"),
    (7, "REGULATION"),
    (9, "COOLING"),
    (10, "DEFROSTING"),
    (20, "STOPPING"),
    (30, "FAULT-LOCK"),
    (31, "ALARM-BLOCK"),
    (40, "ERROR-RESET"),
];

/// Domestic hot water boiler mode.
pub const BOILER_MODE: &[(i64, &str)] = &[
    (0, "STBY"),
    (1, "DHW"),
    (2, "LEGIO"),
    (3, "SUMMER"),
    (4, "FROST"),
    (5, "HOLIDAY"),
    (6, "PRIO-STOP"),
    (7, "ERROR"),
    (8, "OFF"),
    (9, "PROMPT-DHW"),
    (10, "TRAILING-STOP"),
    (11, "TEMP-LOCK"),
    (12, "STBY-FROST"),
];

/// Buffer tank mode.
pub const BUFFER_MODE: &[(i64, &str)] = &[
    (0, "STBY"),
    (1, "HEATING"),
    (2, "COOLING"),
    (3, "SUMMER"),
    (4, "FROST"),
    (5, "HOLIDAY"),
    (6, "PRIO-STOP"),
    (7, "ERROR"),
    (8, "OFF"),
    (9, "STBY-FROST"),
];

/// Solar loop mode.
pub const SOLAR_MODE: &[(i64, &str)] = &[(0, "STBY"), (1, "HEATING"), (2, "ERROR"), (3, "OFF")];

/// Heating circuit state.
pub const HEATING_CIRCUIT_STATE: &[(i64, &str)] = &[
    (0, "HEATING"),
    (1, "ECO"),
    (2, "COOLING"),
    (3, "FLOORDRY"),
    (4, "FROST"),
    (5, "MAX-TEMP"),
    (6, "ERROR"),
    (7, "SERVICE"),
    (8, "HOLIDAY"),
    (9, "CH-SUMMER"),
    (10, "CC-WINTER"),
    (11, "PRIO-STOP"),
    (12, "OFF"),
    (13, "RELEASE-OFF"),
    (14, "TIME-OFF"),
    (15, "STBY"),
    (16, "STBY-HEATING"),
    (17, "STBY-ECO"),
    (18, "STBY-COOLING"),
    (19, "STBY-FROST"),
    (20, "STBY-FLOORDRY"),
];

/// Heating circuit operating mode.
pub const HEATING_CIRCUIT_MODE: &[(i64, &str)] = &[
    (0, "OFF"),
    (1, "MANUAL"),
    (2, "AUTOMATIK"),
    (3, "AUTO-HEATING"),
    (4, "AUTO-COOLING"),
    (5, "FROST"),
    (6, "SUMMER"),
    (7, "FLOOR-DRY"),
];

/// Request type currently served by the heat pump.
pub const HEAT_PUMP_REQUEST_TYPE: &[(i64, &str)] = &[
    (0, "NO REQUEST"),
    (1, "FLOW PUMP CIRCULATION"),
    (2, "CENTRAL HEATING"),
    (3, "CENTRAL COOLING"),
    (4, "DOMESTIC HOT WATER"),
];

/// Energy manager operating state.
pub const ENERGY_MANAGER_STATE: &[(i64, &str)] = &[
    (0, "OFF"),
    (1, "AUTOMATIK"),
    (2, "MANUAL"),
    (3, "ERROR"),
    (4, "OFFLINE"),
];

/// Identifies one of the fixed enumeration tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumTable {
    /// [`HEAT_PUMP_MODE`]
    HeatPumpMode,
    /// [`HEAT_PUMP_STATE`]
    HeatPumpState,
    /// [`BOILER_MODE`]
    BoilerMode,
    /// [`BUFFER_MODE`]
    BufferMode,
    /// [`SOLAR_MODE`]
    SolarMode,
    /// [`HEATING_CIRCUIT_STATE`]
    HeatingCircuitState,
    /// [`HEATING_CIRCUIT_MODE`]
    HeatingCircuitMode,
    /// [`HEAT_PUMP_REQUEST_TYPE`]
    HeatPumpRequestType,
    /// [`ENERGY_MANAGER_STATE`]
    EnergyManagerState,
}

impl EnumTable {
    /// Every table, in declaration order.
    pub const ALL: [EnumTable; 9] = [
        EnumTable::HeatPumpMode,
        EnumTable::HeatPumpState,
        EnumTable::BoilerMode,
        EnumTable::BufferMode,
        EnumTable::SolarMode,
        EnumTable::HeatingCircuitState,
        EnumTable::HeatingCircuitMode,
        EnumTable::HeatPumpRequestType,
        EnumTable::EnergyManagerState,
    ];

    /// The code/label pairs of this table.
    pub fn entries(self) -> &'static [(i64, &'static str)] {
        match self {
            EnumTable::HeatPumpMode => HEAT_PUMP_MODE,
            EnumTable::HeatPumpState => HEAT_PUMP_STATE,
            EnumTable::BoilerMode => BOILER_MODE,
            EnumTable::BufferMode => BUFFER_MODE,
            EnumTable::SolarMode => SOLAR_MODE,
            EnumTable::HeatingCircuitState => HEATING_CIRCUIT_STATE,
            EnumTable::HeatingCircuitMode => HEATING_CIRCUIT_MODE,
            EnumTable::HeatPumpRequestType => HEAT_PUMP_REQUEST_TYPE,
            EnumTable::EnergyManagerState => ENERGY_MANAGER_STATE,
        }
    }

    /// Name of the transform that selects this table in configuration files.
    pub fn transform_name(self) -> &'static str {
        match self {
            EnumTable::HeatPumpMode => "heat_pump_mode_to_str",
            EnumTable::HeatPumpState => "heat_pump_state_to_str",
            EnumTable::BoilerMode => "boiler_mode_to_str",
            EnumTable::BufferMode => "buffer_mode_to_str",
            EnumTable::SolarMode => "solar_mode_to_str",
            EnumTable::HeatingCircuitState => "heating_circuit_state_to_str",
            EnumTable::HeatingCircuitMode => "heating_circuit_mode_to_str",
            EnumTable::HeatPumpRequestType => "heat_pump_request_type_to_str",
            EnumTable::EnergyManagerState => "energy_manager_operating_state_to_str",
        }
    }

    /// Look up the label for `code`.
    pub fn label(self, code: i64) -> Option<&'static str> {
        let entries = self.entries();
        entries
            .binary_search_by_key(&code, |(c, _)| *c)
            .ok()
            .map(|idx| entries[idx].1)
    }
}

impl fmt::Display for EnumTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transform_name())
    }
}

impl FromStr for EnumTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnumTable::ALL
            .into_iter()
            .find(|table| table.transform_name() == s)
            .ok_or_else(|| format!("no enumeration table for '{s}'"))
    }
}
