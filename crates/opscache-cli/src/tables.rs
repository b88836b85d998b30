//! Record types for the tables the operations board caches.

use opscache_core::Table;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Soldier {
    pub id: String,
    pub full_name: String,
    pub rank: String,
    pub platoon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub plate: String,
    pub kind: String,
    pub available: bool,
}

pub struct Soldiers;

impl Table for Soldiers {
    const NAME: &'static str = "soldiers";
    type Record = Soldier;
}

pub struct Vehicles;

impl Table for Vehicles {
    const NAME: &'static str = "vehicles";
    type Record = Vehicle;
}

pub fn soldier(id: u32, name: &str, rank: &str) -> Soldier {
    Soldier {
        id: format!("s-{}", id),
        full_name: name.to_string(),
        rank: rank.to_string(),
        platoon: Some("2nd".to_string()),
    }
}
