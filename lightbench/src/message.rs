use serde::{Deserialize, Serialize};

/// Identifier the benchmark servers answer for.
pub const CAR_NAME: &str = "roadrunner";

/// The exterior light states a car can report, in CORECONF bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExteriorLight {
    LowBeamHeadlightsOn,
    HighBeamHeadlightsOn,
    LeftTurnSignalOn,
    RightTurnSignalOn,
    DaytimeRunningLightsOn,
    ReverseLightOn,
    FogLightOn,
    ParkingLightsOn,
}

impl ExteriorLight {
    pub const ALL: [ExteriorLight; 8] = [
        Self::LowBeamHeadlightsOn,
        Self::HighBeamHeadlightsOn,
        Self::LeftTurnSignalOn,
        Self::RightTurnSignalOn,
        Self::DaytimeRunningLightsOn,
        Self::ReverseLightOn,
        Self::FogLightOn,
        Self::ParkingLightsOn,
    ];

    pub fn from_bit(bit: u64) -> Option<Self> {
        usize::try_from(bit)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn bit(self) -> u64 {
        self as u64
    }
}

/// The semantic payload exchanged by every protocol.
///
/// Requests carry the car identifier only (a fetch); decoded responses also carry the
/// light state the server reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightMessage {
    #[serde(rename = "name", alias = "carName")]
    pub car_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exterior_light: Option<ExteriorLight>,
}

impl LightMessage {
    pub fn fetch(car_name: impl Into<String>) -> Self {
        Self {
            car_name: car_name.into(),
            exterior_light: None,
        }
    }

    pub fn with_state(car_name: impl Into<String>, light: ExteriorLight) -> Self {
        Self {
            car_name: car_name.into(),
            exterior_light: Some(light),
        }
    }
}

/// YANG-shaped body returned by the REST server and inside JSON-RPC results:
/// `{"fetch": {"output": {"carStatus": {...}}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YangOutput {
    pub fetch: YangFetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YangFetch {
    pub output: YangCarStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YangCarStatus {
    #[serde(rename = "carStatus")]
    pub car_status: LightMessage,
}

impl From<LightMessage> for YangOutput {
    fn from(car_status: LightMessage) -> Self {
        Self {
            fetch: YangFetch {
                output: YangCarStatus { car_status },
            },
        }
    }
}

impl From<YangOutput> for LightMessage {
    fn from(value: YangOutput) -> Self {
        value.fetch.output.car_status
    }
}
