//! One-shot backend HTTP: vehicle master data, command capability catalogs,
//! and third-party fuel price lookup.

use std::time::Duration;

use async_trait::async_trait;
use carlink_session::ClientIdentity;
use serde::Deserialize;

use crate::error::{AdapterError, AdapterResult};
use crate::history::FuelPriceSource;
use crate::tree::{StateTree, TreeError};

/// Default timeout for one-shot API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Vehicle summary from the master-data endpoint. The full nested payload is
/// the host's concern; only the fields the adapter needs are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleMasterData {
    pub vin: String,
    pub license_plate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMasterData {
    #[serde(default, alias = "fin")]
    vin: Option<String>,
    #[serde(default, alias = "licencePlateNumber")]
    license_plate: Option<String>,
}

/// Per-vehicle command capability catalog.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapabilityCatalog {
    pub commands: Vec<CommandCapability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandCapability {
    pub command_name: String,
    pub is_available: bool,
    pub parameters: Vec<serde_json::Value>,
}

/// Async HTTP client for the backend API.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    identity: ClientIdentity,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, identity: ClientIdentity) -> AdapterResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Api(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            identity,
        })
    }

    fn request(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        self.http
            .get(url)
            .header("Authorization", token)
            .header("X-SessionId", &self.identity.session_id)
            .header("X-TrackingId", &self.identity.tracking_id)
    }

    /// Fetch the account's vehicles. Entries without a vin are skipped.
    pub async fn master_data(
        &self,
        token: &str,
        country_code: &str,
        locale: &str,
    ) -> AdapterResult<Vec<VehicleMasterData>> {
        let resp = self
            .request("/v1/vehicle/self/masterdata", token)
            .query(&[("countryCode", country_code), ("locale", locale)])
            .send()
            .await
            .map_err(|e| AdapterError::Api(format!("master data: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api(format!("master data {status}: {body}")));
        }

        let vehicles: Vec<WireMasterData> = resp
            .json()
            .await
            .map_err(|e| AdapterError::Api(format!("master data decode: {e}")))?;
        if vehicles.is_empty() {
            tracing::warn!("no vehicles assigned to this account");
        }

        Ok(vehicles
            .into_iter()
            .filter_map(|v| {
                Some(VehicleMasterData {
                    vin: v.vin.filter(|vin| !vin.is_empty() && vin != "null")?,
                    license_plate: v.license_plate,
                })
            })
            .collect())
    }

    /// Fetch the command capability catalog for one vehicle.
    pub async fn command_capabilities(
        &self,
        token: &str,
        vin: &str,
    ) -> AdapterResult<CapabilityCatalog> {
        let path = format!("/v1/vehicle/{vin}/capabilities/commands");
        let resp = self
            .request(&path, token)
            .send()
            .await
            .map_err(|e| AdapterError::Api(format!("capabilities: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api(format!("capabilities {status}: {body}")));
        }

        resp.json()
            .await
            .map_err(|e| AdapterError::Api(format!("capabilities decode: {e}")))
    }
}

/// Publish a capability catalog as `{vin}.commands.*` facts and arm the
/// `.start` write intent for commands the vehicle actually supports.
pub async fn publish_capabilities(
    tree: &dyn StateTree,
    vin: &str,
    catalog: &CapabilityCatalog,
) -> Result<(), TreeError> {
    for command in &catalog.commands {
        let base = format!("{vin}.commands.{}", command.command_name);
        tree.set(&format!("{base}.isAvailable"), command.is_available.into())
            .await?;
        if !command.parameters.is_empty() {
            tree.set(
                &format!("{base}.parameters"),
                serde_json::Value::Array(command.parameters.clone()),
            )
            .await?;
        }
        if command.is_available {
            tree.set(&format!("{base}.start"), false.into()).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fuel price lookup
// ---------------------------------------------------------------------------

/// Station-list fuel price client: nearest station's price wins. Every
/// failure degrades to `None`; derived prices then default to zero.
pub struct StationPriceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    fuel_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StationList {
    status: String,
    stations: Vec<Station>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Station {
    price: f64,
}

impl StationPriceClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        fuel_type: impl Into<String>,
    ) -> AdapterResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Api(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            fuel_type: fuel_type.into(),
        })
    }
}

#[async_trait]
impl FuelPriceSource for StationPriceClient {
    async fn price_at(&self, lat: f64, lon: f64) -> Option<f64> {
        let url = format!("{}/json/list.php", self.base_url);
        let result = self
            .http
            .get(url)
            .query(&[
                ("lat", lat.to_string()),
                ("lng", lon.to_string()),
                ("rad", "4".to_string()),
                ("sort", "dist".to_string()),
                ("type", self.fuel_type.clone()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("fuel price lookup failed: {e}");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), "fuel price lookup failed");
            return None;
        }
        let list: StationList = match resp.json().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("fuel price decode failed: {e}");
                return None;
            }
        };
        if list.status == "error" {
            tracing::warn!("fuel price service reported an error");
            return None;
        }
        list.stations.first().map(|s| s.price)
    }
}
