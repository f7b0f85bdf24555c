//! Availability probe backed by the vaccination appointment service REST API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use slotwatch_core::{
    model::{Dose, GroupId, SearchGroup, Slot},
    ports::{AvailabilityProbe, CodeRequest, ProbeError},
};

const DIRECTORY_URL: &str = "https://www.impfterminservice.de/assets/static/impfzentren.json";

/// Vaccine feature code sent along with code requests.
const FEATURE_CODE: &str = "L920";

/// Center as listed in the public directory, keyed by federal state.
#[derive(Debug, Deserialize)]
struct CenterEntry {
    #[serde(rename = "PLZ")]
    postal_code: String,
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "Zentrumsname", default)]
    name: String,
}

/// Response of /rest/suche/impfterminsuche
#[derive(Debug, Deserialize)]
struct SearchResponse {
    /// Each entry pairs a first-dose appointment with its follow-up.
    #[serde(rename = "termine", default)]
    pairs: Vec<Vec<Appointment>>,
}

#[derive(Debug, Deserialize)]
struct Appointment {
    /// Start as epoch milliseconds.
    begin: i64,
}

/// Body of /rest/smspin/anforderung
#[derive(Debug, Serialize)]
struct CodeRequestBody<'req> {
    plz: &'req str,
    phone: &'req str,
    email: &'req str,
    birthday: String,
    leistungsmerkmal: &'static str,
}

/// Probe querying the appointment service for one search group at a time.
pub struct ItsProbe {
    client: Client,
    directory_url: String,
    centers: OnceCell<HashMap<String, String>>,
    // Second-dose halves of the pairs fetched by the latest first-dose call.
    pending_second: Mutex<HashMap<GroupId, Vec<Slot>>>,
}

impl ItsProbe {
    /// Create a probe bound to the given HTTP client and the public center directory.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_directory_url(client, DIRECTORY_URL)
    }

    /// Create a probe that reads the center directory from `directory_url`.
    #[must_use]
    pub fn with_directory_url<U: Into<String>>(client: Client, directory_url: U) -> Self {
        Self {
            client,
            directory_url: directory_url.into(),
            centers: OnceCell::new(),
            pending_second: Mutex::new(HashMap::new()),
        }
    }

    async fn centers(&self) -> Result<&HashMap<String, String>, ProbeError> {
        self.centers
            .get_or_try_init(|| async {
                let by_state = fetch_json::<HashMap<String, Vec<CenterEntry>>>(
                    self.client.get(&self.directory_url),
                )
                .await?;
                let centers: HashMap<String, String> = by_state
                    .into_values()
                    .flatten()
                    .map(|center| {
                        debug!(postal_code = %center.postal_code, name = %center.name, "Known center");
                        (center.postal_code, center.url)
                    })
                    .collect();
                Ok::<_, ProbeError>(centers)
            })
            .await
    }

    async fn server_for(&self, postal_code: &str) -> Result<String, ProbeError> {
        self.centers()
            .await?
            .get(postal_code)
            .map(|url| url.trim_end_matches('/').to_owned())
            .ok_or_else(|| ProbeError::Fatal(format!("No vaccination center with postal code {postal_code}")))
    }

    /// Fetch appointment pairs for every center of `group` and split them by dose.
    async fn search_group(&self, group: &SearchGroup) -> Result<(Vec<Slot>, Vec<Slot>), ProbeError> {
        let id = group.id();
        let mut first = Vec::new();
        let mut second = Vec::new();

        for postal_code in group.postal_codes() {
            let server = self.server_for(postal_code).await?;
            let req = self
                .client
                .get(format!("{server}/rest/suche/impfterminsuche"))
                .query(&[("plz", postal_code.as_str())])
                .basic_auth("", Some(&group.code().0));

            let response = fetch_json::<SearchResponse>(req).await?;
            debug!(group = %id, %postal_code, pairs = response.pairs.len(), "Appointment search answered");

            for pair in response.pairs {
                let mut doses = Dose::ALL.into_iter().zip(pair);
                if let Some((dose, appointment)) = doses.next() {
                    first.push(to_slot(&id, postal_code, dose, &appointment)?);
                }
                if let Some((dose, appointment)) = doses.next() {
                    second.push(to_slot(&id, postal_code, dose, &appointment)?);
                }
            }
        }

        Ok((first, second))
    }
}

#[async_trait]
impl AvailabilityProbe for ItsProbe {
    fn name(&self) -> &str {
        "impfterminservice"
    }

    async fn check_availability(
        &self,
        group: &SearchGroup,
        dose: Dose,
    ) -> Result<Vec<Slot>, ProbeError> {
        match dose {
            Dose::First => {
                let (first, second) = self.search_group(group).await?;
                self.pending_second.lock().insert(group.id(), second);
                Ok(first)
            }
            Dose::Second => {
                let cached = self.pending_second.lock().remove(&group.id());
                match cached {
                    Some(second) => Ok(second),
                    None => Ok(self.search_group(group).await?.1),
                }
            }
        }
    }

    async fn request_registration_code(&self, request: &CodeRequest) -> Result<bool, ProbeError> {
        let server = self.server_for(&request.postal_code).await?;
        let body = CodeRequestBody {
            plz: &request.postal_code,
            phone: &request.phone,
            email: &request.email,
            birthday: request.birth_date.format("%Y-%m-%d").to_string(),
            leistungsmerkmal: FEATURE_CODE,
        };

        let response = send(
            self.client
                .post(format!("{server}/rest/smspin/anforderung"))
                .json(&body),
        )
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Code request declined");
            return Ok(false);
        }
        Err(status_error(response).await)
    }
}

/// Build the production probe.
#[must_use]
pub fn probe(client: Client) -> Arc<dyn AvailabilityProbe> {
    Arc::new(ItsProbe::new(client))
}

fn to_slot(
    group: &GroupId,
    postal_code: &str,
    dose: Dose,
    appointment: &Appointment,
) -> Result<Slot, ProbeError> {
    let begin = DateTime::from_timestamp_millis(appointment.begin)
        .ok_or_else(|| ProbeError::Fatal(format!("Appointment start {} out of range", appointment.begin)))?
        .with_timezone(&Local)
        .naive_local();

    Ok(Slot {
        group: group.clone(),
        postal_code: postal_code.to_owned(),
        date: begin.date(),
        time: begin.time(),
        dose,
    })
}

async fn send(req: RequestBuilder) -> Result<Response, ProbeError> {
    req.send()
        .await
        .map_err(|err| ProbeError::Transient(format!("Request failed: {err}")))
}

/// Translate a non-success response into the probe error taxonomy.
async fn status_error(response: Response) -> ProbeError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED => ProbeError::Auth(format!("{status}: {body}")),
        // The service answers bot protection with 403 as well as 429.
        StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => ProbeError::RateLimited { retry_after },
        // Maintenance pages and load balancer hiccups surface as arbitrary statuses.
        status => ProbeError::Transient(format!("Unexpected status {status}: {body}")),
    }
}

// Small helper to fetch and decode JSON with status handling.
async fn fetch_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ProbeError> {
    let response = send(req).await?;
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response.json().await.map_err(|err| {
        if err.is_decode() {
            ProbeError::Fatal(format!("Cannot interpret response: {err}"))
        } else {
            ProbeError::Transient(format!("Reading response failed: {err}"))
        }
    })
}
