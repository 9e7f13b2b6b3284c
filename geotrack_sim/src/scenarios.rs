//! Fault-injection scenarios for the synchronization core.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: Repeated broker outages while objects keep moving
    ReconnectStorm,

    /// SIM-002: Object leaves and re-enters the safe zone
    GeofenceBreach,

    /// SIM-003: Snapshot fetched before an update, applied after it
    StaleRefresh,

    /// SIM-004: More notifications than the ledger holds
    NotificationFlood,

    /// SIM-005: Movement simulation cancelled mid-run
    SimulationCancel,

    /// SIM-006: Garbage on the topics between valid messages
    MalformedPayloads,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ReconnectStorm,
            ScenarioId::GeofenceBreach,
            ScenarioId::StaleRefresh,
            ScenarioId::NotificationFlood,
            ScenarioId::SimulationCancel,
            ScenarioId::MalformedPayloads,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ReconnectStorm => "reconnect_storm",
            ScenarioId::GeofenceBreach => "geofence_breach",
            ScenarioId::StaleRefresh => "stale_refresh",
            ScenarioId::NotificationFlood => "notification_flood",
            ScenarioId::SimulationCancel => "simulation_cancel",
            ScenarioId::MalformedPayloads => "malformed_payloads",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ReconnectStorm => "3 broker outages; updates during outages are lost, no error surfaces, state reconverges",
            ScenarioId::GeofenceBreach => "Exit then enter: flag mirrored, ledger and alerts follow, reload wins",
            ScenarioId::StaleRefresh => "Stale snapshot applied after a newer update: deterministic last-applied-wins",
            ScenarioId::NotificationFlood => "15 transitions: ledger keeps the 10 most recent, newest first",
            ScenarioId::SimulationCancel => "Cancel a 30-step run mid-way: no step submitted after cancel",
            ScenarioId::MalformedPayloads => "Invalid JSON and wrong shapes are dropped, subscription survives",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reconnect_storm" | "reconnectstorm" | "sim-001" => Ok(ScenarioId::ReconnectStorm),
            "geofence_breach" | "geofencebreach" | "sim-002" => Ok(ScenarioId::GeofenceBreach),
            "stale_refresh" | "stalerefresh" | "sim-003" => Ok(ScenarioId::StaleRefresh),
            "notification_flood" | "notificationflood" | "sim-004" => Ok(ScenarioId::NotificationFlood),
            "simulation_cancel" | "simulationcancel" | "sim-005" => Ok(ScenarioId::SimulationCancel),
            "malformed_payloads" | "malformedpayloads" | "sim-006" => Ok(ScenarioId::MalformedPayloads),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            assert!(!scenario.description().is_empty());
        }
        assert_eq!("SIM-003".parse::<ScenarioId>().unwrap(), ScenarioId::StaleRefresh);
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
