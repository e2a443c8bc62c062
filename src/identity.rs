use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

const NODE_PREFIX: &str = "myiotgrid:lorawan:node:";
const SENSOR_PREFIX: &str = "myiotgrid:lorawan:sensor:";

/// Node id for a DevEUI: UUIDv5 over the DNS namespace
pub fn derive_node_id(dev_eui: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("{NODE_PREFIX}{dev_eui}").as_bytes(),
    )
}

/// Sensor id for a (DevEUI, measurement type) pair
pub fn derive_sensor_id(dev_eui: &str, measurement_type: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("{SENSOR_PREFIX}{dev_eui}:{measurement_type}").as_bytes(),
    )
}

/// Maps external LoRaWAN identifiers onto stable internal UUIDs.
///
/// Ids are pure functions of their inputs, so they survive restarts without
/// persistence. The maps only avoid rehashing for devices seen before.
#[derive(Debug, Default)]
pub struct IdentityMapper {
    nodes: DashMap<String, Uuid>,
    /// DevEUI -> measurement type -> sensor id
    sensors: DashMap<String, HashMap<String, Uuid>>,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(&self, dev_eui: &str) -> Uuid {
        if let Some(id) = self.nodes.get(dev_eui) {
            return *id;
        }
        *self
            .nodes
            .entry(dev_eui.to_string())
            .or_insert_with(|| derive_node_id(dev_eui))
    }

    pub fn sensor_id(&self, dev_eui: &str, measurement_type: &str) -> Uuid {
        if let Some(sensors) = self.sensors.get(dev_eui)
            && let Some(id) = sensors.get(measurement_type)
        {
            return *id;
        }
        *self
            .sensors
            .entry(dev_eui.to_string())
            .or_default()
            .entry(measurement_type.to_string())
            .or_insert_with(|| derive_sensor_id(dev_eui, measurement_type))
    }

    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn cached_sensors(&self) -> usize {
        self.sensors.iter().map(|sensors| sensors.len()).sum()
    }
}
