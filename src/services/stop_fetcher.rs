//! Responsible for fetching an agency's stops from the TransLoc API
use std::time::Duration;

use itertools::Itertools;
use reqwest::{Client, header::ACCEPT};
use tracing::{Instrument, info, info_span};

use crate::model::{stop_model::LiveStop, transloc_api_model::TranslocStopsResponse};

pub const DEFAULT_STOPS_ENDPOINT: &str = "https://transloc-api-1-2.p.mashape.com/stops.json";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const API_KEY_HEADER: &str = "X-Mashape-Key";

/// Longest part of an unparseable body kept in the error
const MAX_BODY_IN_ERROR: usize = 2048;

pub struct TranslocClient {
    client: Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl TranslocClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchStopsError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchStopsError::NetworkFailure)?;

        Ok(TranslocClient {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout,
        })
    }

    /// Fetches every stop of the agency. No retries, the first failure is returned.
    #[tracing::instrument(err, skip(self), fields(endpoint = %self.endpoint))]
    pub async fn fetch_stops(&self, agency_id: &str) -> Result<Vec<LiveStop>, FetchStopsError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("agencies", agency_id)])
            .header(API_KEY_HEADER, &self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .instrument(info_span!("Fetching stops"))
            .await
            .map_err(|e| self.request_error(e))?
            .error_for_status()
            .map_err(|e| self.request_error(e))?;

        let stops_string = response
            .text()
            .instrument(info_span!("Reading body of response"))
            .await
            .map_err(|e| self.request_error(e))?;

        let stops: TranslocStopsResponse =
            serde_json::from_str(&stops_string).map_err(|e| FetchStopsError::ProtocolError {
                source: e,
                body: stops_string.chars().take(MAX_BODY_IN_ERROR).collect(),
            })?;

        let stops = stops.data.into_iter().map(LiveStop::from).collect_vec();

        info!("got {} stops for agency {}", stops.len(), agency_id);

        Ok(stops)
    }

    fn request_error(&self, error: reqwest::Error) -> FetchStopsError {
        if error.is_timeout() {
            FetchStopsError::Timeout {
                timeout: self.timeout,
                source: error,
            }
        } else {
            FetchStopsError::NetworkFailure(error)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchStopsError {
    #[error("error fetching the stops")]
    NetworkFailure(#[source] reqwest::Error),

    #[error("timed out fetching the stops after {timeout:?}")]
    Timeout {
        timeout: Duration,
        source: reqwest::Error,
    },

    #[error("error parsing the stops \n{} \n{}", source, body)]
    ProtocolError {
        source: serde_json::Error,
        body: String,
    },
}
