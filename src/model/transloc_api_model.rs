use serde::{Deserialize, Deserializer, Serialize};

use super::stop_model::{Coordinates, LiveStop};

/// Top level of the `stops.json` response. Anything without a `data` array fails to parse.
#[derive(Debug, Deserialize, Serialize)]
pub struct TranslocStopsResponse {
    pub data: Vec<TranslocStop>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TranslocStop {
    /// Documented as a string but older agencies send plain numbers
    #[serde(deserialize_with = "id_from_transloc_id")]
    pub stop_id: String,
    pub name: String,
    pub location: TranslocLocation,
    #[serde(default, deserialize_with = "ids_from_transloc_ids")]
    pub routes: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct TranslocLocation {
    pub lat: f64,
    pub lng: f64,
}

impl From<TranslocStop> for LiveStop {
    fn from(value: TranslocStop) -> Self {
        LiveStop {
            id: value.stop_id,
            name: value.name,
            location: Coordinates::new(value.location.lat, value.location.lng),
            routes: value.routes,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranslocId {
    Text(String),
    Number(serde_json::Number),
}

impl From<TranslocId> for String {
    fn from(value: TranslocId) -> Self {
        match value {
            TranslocId::Text(s) => s,
            TranslocId::Number(n) => n.to_string(),
        }
    }
}

fn id_from_transloc_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(TranslocId::deserialize(deserializer)?.into())
}

fn ids_from_transloc_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids: Vec<TranslocId> = Deserialize::deserialize(deserializer)?;

    Ok(ids.into_iter().map(String::from).collect())
}
