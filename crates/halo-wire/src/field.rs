//! The fixed set of sensor fields a Halo heartbeat can carry.
//!
//! Each variant owns exactly one storage column, named by [`SensorField::key`].
//! Keys are matched case-sensitively and include characters such as `.` and
//! `-`, so column names must always be quoted in SQL.

use std::fmt;

// ---------------------------------------------------------------------------
// SensorField
// ---------------------------------------------------------------------------

/// One known measurement or status reported by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorField {
    Celsius,
    Fahrenheit,
    RelativeHumidity,
    Lux,
    Tvoc,
    Co2Cal,
    Pm1,
    Pm2_5,
    Pm10,
    Nh3,
    No2,
    Co,
    AccX,
    AccY,
    AccZ,
    Move,
    PressureHg,
    PressureHpa,
    Aqi,
    No2Aqi,
    CoAqi,
    Pm10Aqi,
    Pm25Aqi,
    Inp,
    Co2Eq,
    Panic,
    Motion,
    Noise,
    HgMic,
    LgMic,
    Aud1,
    Gun,
    Kw1,
    Kw2,
    Kw3,
    HealthIndex,
    HiCo2,
    HiHumidity,
    HiPm1,
    HiPm2_5,
    HiPm10,
    HiTvoc,
    HiNo2,
}

impl SensorField {
    pub const COUNT: usize = 43;

    /// Every known field, in column order.
    pub const ALL: [SensorField; SensorField::COUNT] = [
        SensorField::Celsius,
        SensorField::Fahrenheit,
        SensorField::RelativeHumidity,
        SensorField::Lux,
        SensorField::Tvoc,
        SensorField::Co2Cal,
        SensorField::Pm1,
        SensorField::Pm2_5,
        SensorField::Pm10,
        SensorField::Nh3,
        SensorField::No2,
        SensorField::Co,
        SensorField::AccX,
        SensorField::AccY,
        SensorField::AccZ,
        SensorField::Move,
        SensorField::PressureHg,
        SensorField::PressureHpa,
        SensorField::Aqi,
        SensorField::No2Aqi,
        SensorField::CoAqi,
        SensorField::Pm10Aqi,
        SensorField::Pm25Aqi,
        SensorField::Inp,
        SensorField::Co2Eq,
        SensorField::Panic,
        SensorField::Motion,
        SensorField::Noise,
        SensorField::HgMic,
        SensorField::LgMic,
        SensorField::Aud1,
        SensorField::Gun,
        SensorField::Kw1,
        SensorField::Kw2,
        SensorField::Kw3,
        SensorField::HealthIndex,
        SensorField::HiCo2,
        SensorField::HiHumidity,
        SensorField::HiPm1,
        SensorField::HiPm2_5,
        SensorField::HiPm10,
        SensorField::HiTvoc,
        SensorField::HiNo2,
    ];

    /// The key used on the wire, which is also the column name.
    pub fn key(self) -> &'static str {
        match self {
            SensorField::Celsius => "C",
            SensorField::Fahrenheit => "F",
            SensorField::RelativeHumidity => "RH",
            SensorField::Lux => "Lux",
            SensorField::Tvoc => "TVOC",
            SensorField::Co2Cal => "CO2cal",
            SensorField::Pm1 => "PM1",
            SensorField::Pm2_5 => "PM2.5",
            SensorField::Pm10 => "PM10",
            SensorField::Nh3 => "NH3",
            SensorField::No2 => "NO2",
            SensorField::Co => "CO",
            SensorField::AccX => "AccX",
            SensorField::AccY => "AccY",
            SensorField::AccZ => "AccZ",
            SensorField::Move => "Move",
            SensorField::PressureHg => "P-Hg",
            SensorField::PressureHpa => "P-hPa",
            SensorField::Aqi => "AQI",
            SensorField::No2Aqi => "NO2AQI",
            SensorField::CoAqi => "COAQI",
            SensorField::Pm10Aqi => "PM10AQI",
            SensorField::Pm25Aqi => "PM25AQI",
            SensorField::Inp => "INP",
            SensorField::Co2Eq => "CO2eq",
            SensorField::Panic => "panic",
            SensorField::Motion => "Motion",
            SensorField::Noise => "Noise",
            SensorField::HgMic => "HGMic",
            SensorField::LgMic => "LGMic",
            SensorField::Aud1 => "Aud1",
            SensorField::Gun => "Gun",
            SensorField::Kw1 => "KW1",
            SensorField::Kw2 => "KW2",
            SensorField::Kw3 => "KW3",
            SensorField::HealthIndex => "HI",
            SensorField::HiCo2 => "HIco2",
            SensorField::HiHumidity => "HIhum",
            SensorField::HiPm1 => "HIpm1",
            SensorField::HiPm2_5 => "HIpm2.5",
            SensorField::HiPm10 => "HIpm10",
            SensorField::HiTvoc => "HItvoc",
            SensorField::HiNo2 => "HIno2",
        }
    }

    /// Look up a field by its exact, case-sensitive wire key.
    pub fn from_key(key: &str) -> Option<SensorField> {
        SensorField::ALL.iter().copied().find(|f| f.key() == key)
    }

    /// Position of this field in [`SensorField::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// SensorFields
// ---------------------------------------------------------------------------

/// Fixed-shape record holding an optional raw value for every known field.
///
/// Values are kept verbatim; numeric interpretation belongs to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFields {
    values: [Option<String>; SensorField::COUNT],
}

impl Default for SensorFields {
    fn default() -> Self {
        SensorFields {
            values: std::array::from_fn(|_| None),
        }
    }
}

impl SensorFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: SensorField) -> Option<&str> {
        self.values[field.index()].as_deref()
    }

    /// Set a value, replacing any earlier one for the same field.
    pub fn set(&mut self, field: SensorField, value: impl Into<String>) {
        self.values[field.index()] = Some(value.into());
    }

    /// All fields in column order with their value (or `None`).
    pub fn iter(&self) -> impl Iterator<Item = (SensorField, Option<&str>)> + '_ {
        SensorField::ALL
            .iter()
            .map(move |&f| (f, self.values[f.index()].as_deref()))
    }

    /// Only the fields that carry a value.
    pub fn present(&self) -> impl Iterator<Item = (SensorField, &str)> + '_ {
        self.iter().filter_map(|(f, v)| v.map(|v| (f, v)))
    }

    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}
