//! Unit, direction and status vocabularies of the NE-4000 command set.

use serde::{Deserialize, Serialize};

/// Volume units accepted by `VOL <unit>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeUnit {
    #[serde(rename = "ML", alias = "mL", alias = "ml")]
    Ml,
    #[serde(rename = "UL", alias = "uL", alias = "ul")]
    Ul,
}

impl VolumeUnit {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Ml => "ML",
            Self::Ul => "UL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "ML" => Some(Self::Ml),
            "UL" => Some(Self::Ul),
            _ => None,
        }
    }

    /// Convert a value expressed in this unit to microlitres.
    pub fn to_ul(self, value: f64) -> f64 {
        match self {
            Self::Ml => value * 1000.0,
            Self::Ul => value,
        }
    }

    /// Convert microlitres into this unit.
    pub fn from_ul(self, value_ul: f64) -> f64 {
        match self {
            Self::Ml => value_ul / 1000.0,
            Self::Ul => value_ul,
        }
    }
}

/// Rate units accepted by `RAT <value> <unit>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateUnit {
    /// µL/min
    #[serde(rename = "UM")]
    UlPerMin,
    /// mL/min
    #[serde(rename = "MM")]
    MlPerMin,
    /// µL/hr
    #[serde(rename = "UH")]
    UlPerHour,
    /// mL/hr
    #[serde(rename = "MH")]
    MlPerHour,
}

impl RateUnit {
    pub const fn code(self) -> &'static str {
        match self {
            Self::UlPerMin => "UM",
            Self::MlPerMin => "MM",
            Self::UlPerHour => "UH",
            Self::MlPerHour => "MH",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "UM" => Some(Self::UlPerMin),
            "MM" => Some(Self::MlPerMin),
            "UH" => Some(Self::UlPerHour),
            "MH" => Some(Self::MlPerHour),
            _ => None,
        }
    }

    /// Convert a rate in this unit to µL/min.
    pub fn to_ul_per_min(self, value: f64) -> f64 {
        match self {
            Self::UlPerMin => value,
            Self::MlPerMin => value * 1000.0,
            Self::UlPerHour => value / 60.0,
            Self::MlPerHour => value * 1000.0 / 60.0,
        }
    }
}

/// Pumping direction, `DIR <code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "INF")]
    Infuse,
    #[serde(rename = "WDR")]
    Withdraw,
    #[serde(rename = "REV")]
    Reverse,
}

impl Direction {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Infuse => "INF",
            Self::Withdraw => "WDR",
            Self::Reverse => "REV",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "INF" => Some(Self::Infuse),
            "WDR" => Some(Self::Withdraw),
            "REV" => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// Motor state reported in the prompt character of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpStatus {
    Infusing,
    Withdrawing,
    Stopped,
    Paused,
    TimedPause,
    UserWait,
    Purging,
    /// Alarm prompt (`A`), followed by an alarm code.
    Alarm,
    Unknown,
}

impl PumpStatus {
    /// Map the prompt character to a state.  Unrecognised characters map to
    /// [`PumpStatus::Unknown`] rather than failing.
    pub fn from_prompt(c: char) -> Self {
        match c {
            'I' => Self::Infusing,
            'W' => Self::Withdrawing,
            'S' => Self::Stopped,
            'P' => Self::Paused,
            'T' => Self::TimedPause,
            'U' => Self::UserWait,
            'X' => Self::Purging,
            'A' => Self::Alarm,
            _ => Self::Unknown,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Infusing => "infusing",
            Self::Withdrawing => "withdrawing",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::TimedPause => "timed_pause",
            Self::UserWait => "user_wait",
            Self::Purging => "purging",
            Self::Alarm => "alarm",
            Self::Unknown => "unknown",
        }
    }

    /// True while the plunger is moving.
    pub fn is_moving(self) -> bool {
        matches!(self, Self::Infusing | Self::Withdrawing | Self::Purging)
    }
}
