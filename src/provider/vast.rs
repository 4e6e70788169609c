//! Vast.ai REST client.

use std::collections::BTreeMap;

use facet::Facet;

use super::{
    Endpoint, InstanceSnapshot, InstanceStatus, LaunchSpec, Offer, OfferQuery, Provider,
    ProviderKind, http_client, send,
};
use crate::error::PodliftError;

pub const DEFAULT_API_URL: &str = "https://console.vast.ai/api/v0";

const KIND: ProviderKind = ProviderKind::Vast;
const SEARCH_LIMIT: u32 = 64;
const LOG_TAIL_LINES: &str = "1000";
const LOG_FETCH_ATTEMPTS: u32 = 10;
const LOG_FETCH_DELAY_MS: u64 = 1500;

pub struct VastClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Facet)]
struct EqU32 {
    eq: u32,
}

#[derive(Debug, Facet)]
struct EqStr {
    eq: String,
}

#[derive(Debug, Facet)]
struct EqBool {
    eq: bool,
}

#[derive(Debug, Facet)]
struct Lte {
    lte: f64,
}

#[derive(Debug, Facet)]
struct Gte {
    gte: f64,
}

#[derive(Debug, Facet)]
struct SearchBody {
    num_gpus: EqU32,
    gpu_name: EqStr,
    rentable: EqBool,
    rented: EqBool,
    verified: EqBool,
    dph_total: Lte,
    disk_space: Gte,
    order: Vec<Vec<String>>,
    #[facet(rename = "type")]
    offer_type: String,
    limit: u32,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct SearchResponse {
    #[facet(default)]
    offers: Vec<WireOffer>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireOffer {
    #[facet(default)]
    id: u64,
    #[facet(default)]
    gpu_name: String,
    #[facet(default)]
    num_gpus: u32,
    #[facet(default)]
    dph_total: f64,
    #[facet(default)]
    disk_space: f64,
    geolocation: Option<String>,
}

#[derive(Debug, Facet)]
struct CreateBody {
    client_id: String,
    image: String,
    disk: f64,
    env: BTreeMap<String, String>,
    onstart: Option<String>,
    runtype: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct CreateResponse {
    #[facet(default)]
    success: bool,
    new_contract: Option<u64>,
    msg: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ShowResponse {
    instances: Option<WireInstance>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireInstance {
    id: Option<u64>,
    actual_status: Option<String>,
    status_msg: Option<String>,
    public_ipaddr: Option<String>,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    ports: Option<BTreeMap<String, Vec<PortBinding>>>,
    gpu_name: Option<String>,
    dph_total: Option<f64>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct PortBinding {
    #[facet(rename = "HostIp")]
    host_ip: Option<String>,
    #[facet(rename = "HostPort")]
    host_port: Option<String>,
}

#[derive(Debug, Facet)]
struct LogsBody {
    tail: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct LogsResponse {
    result_url: Option<String>,
    msg: Option<String>,
}

#[derive(Debug, Facet)]
struct SshKeyBody {
    ssh_key: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct SuccessResponse {
    #[facet(default = true)]
    success: bool,
    msg: Option<String>,
    error: Option<String>,
}

// ── Conversions ─────────────────────────────────────────────────────

/// Vast.ai spells GPU names with spaces; the CLI convention uses underscores.
fn vast_gpu_name(gpu_type: &str) -> String {
    gpu_type.replace('_', " ")
}

fn search_body(query: &OfferQuery) -> SearchBody {
    SearchBody {
        num_gpus: EqU32 {
            eq: query.gpu_count,
        },
        gpu_name: EqStr {
            eq: vast_gpu_name(&query.gpu_type),
        },
        rentable: EqBool { eq: true },
        rented: EqBool { eq: false },
        verified: EqBool { eq: true },
        dph_total: Lte {
            lte: query.max_price,
        },
        disk_space: Gte {
            gte: f64::from(query.disk_gb),
        },
        order: vec![vec!["dph_total".into(), "asc".into()]],
        offer_type: "on-demand".into(),
        limit: SEARCH_LIMIT,
    }
}

fn parse_offers(body: &str) -> Result<Vec<Offer>, PodliftError> {
    let response: SearchResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed offer list: {e}")))?;
    Ok(response
        .offers
        .into_iter()
        .map(|o| Offer {
            id: o.id.to_string(),
            gpu_name: o.gpu_name,
            gpu_count: o.num_gpus,
            price_per_hour: o.dph_total,
            disk_gb: o.disk_space,
            location: o.geolocation,
        })
        .collect())
}

/// Vast.ai takes environment variables and port mappings as one map, in the
/// same shape its CLI produces from `-e KEY=VALUE -p PORT:PORT`.
fn env_map(spec: &LaunchSpec) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = spec.env.iter().cloned().collect();
    if let Some(key) = &spec.public_key {
        env.insert("SSH_PUB_KEY".into(), key.clone());
    }
    for port in &spec.ports {
        env.insert(format!("-p {port}:{port}"), "1".into());
    }
    env
}

fn create_body(spec: &LaunchSpec) -> CreateBody {
    CreateBody {
        client_id: "me".into(),
        image: spec.image.clone(),
        disk: f64::from(spec.disk_gb),
        env: env_map(spec),
        onstart: spec.onstart.clone(),
        // Direct SSH with the proxy as fallback.
        runtype: "ssh_direc ssh_proxy".into(),
    }
}

fn parse_create(body: &str) -> Result<String, PodliftError> {
    let response: CreateResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed create response: {e}")))?;
    match (response.success, response.new_contract) {
        (true, Some(id)) => Ok(id.to_string()),
        _ => Err(KIND.error(format!(
            "instance creation rejected: {}",
            response
                .msg
                .or(response.error)
                .unwrap_or_else(|| "unknown error".into())
        ))),
    }
}

fn map_status(actual: Option<&str>, status_msg: Option<&str>) -> InstanceStatus {
    if let Some(msg) = status_msg
        && msg.to_ascii_lowercase().contains("error")
    {
        return InstanceStatus::Failed(msg.trim().to_string());
    }
    match actual.map(str::to_ascii_lowercase).as_deref() {
        Some("running") => InstanceStatus::Running,
        Some("loading") => InstanceStatus::Starting,
        Some("created") | Some("scheduling") => InstanceStatus::Creating,
        Some("exited") => InstanceStatus::Exited,
        Some(other) => InstanceStatus::Unknown(other.to_string()),
        None => InstanceStatus::Unknown(String::new()),
    }
}

/// Prefer the direct port mapping; fall back to the SSH proxy.
fn resolve_endpoint(instance: &WireInstance) -> Option<Endpoint> {
    let direct = instance
        .public_ipaddr
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .and_then(|ip| {
            let binding = instance.ports.as_ref()?.get("22/tcp")?.first()?;
            let port = binding.host_port.as_deref()?.trim().parse::<u16>().ok()?;
            Some(Endpoint {
                host: ip.to_string(),
                port,
            })
        });
    if direct.is_some() {
        return direct;
    }

    let host = instance.ssh_host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
    let port = instance.ssh_port.filter(|p| *p != 0)?;
    Some(Endpoint {
        host: host.to_string(),
        port,
    })
}

fn parse_instance(id: &str, body: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
    let response: ShowResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed instance response: {e}")))?;
    let Some(instance) = response.instances else {
        return Ok(None);
    };

    Ok(Some(InstanceSnapshot {
        id: instance.id.map(|i| i.to_string()).unwrap_or_else(|| id.to_string()),
        status: map_status(instance.actual_status.as_deref(), instance.status_msg.as_deref()),
        endpoint: resolve_endpoint(&instance),
        status_message: instance.status_msg.clone().filter(|m| !m.trim().is_empty()),
        gpu_name: instance.gpu_name.clone(),
        price_per_hour: instance.dph_total,
    }))
}

fn check_success(what: &str, body: &str) -> Result<(), PodliftError> {
    if body.trim().is_empty() {
        return Ok(());
    }
    let response: SuccessResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("{what}: malformed response: {e}")))?;
    if response.success {
        Ok(())
    } else {
        Err(KIND.error(format!(
            "{what}: {}",
            response
                .msg
                .or(response.error)
                .unwrap_or_else(|| "request rejected".into())
        )))
    }
}

fn encode<'f, T: Facet<'f>>(what: &str, value: &T) -> Result<String, PodliftError> {
    facet_json::to_string(value).map_err(|e| KIND.error(format!("{what}: encoding request: {e}")))
}

// ── Client ──────────────────────────────────────────────────────────

impl VastClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, PodliftError> {
        Ok(Self {
            http: http_client(KIND)?,
            base_url,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn json_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: String,
    ) -> reqwest::RequestBuilder {
        self.request(method, path)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
    }
}

impl Provider for VastClient {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, PodliftError> {
        let body = encode("offer search", &search_body(query))?;
        tracing::debug!(%body, "searching offers");
        let text = send(
            KIND,
            "offer search",
            self.json_request(reqwest::Method::POST, "bundles/", body),
        )
        .await?;
        parse_offers(&text)
    }

    async fn create_instance(
        &self,
        offer: &Offer,
        spec: &LaunchSpec,
    ) -> Result<String, PodliftError> {
        let body = encode("create instance", &create_body(spec))?;
        let text = send(
            KIND,
            "create instance",
            self.json_request(reqwest::Method::PUT, &format!("asks/{}/", offer.id), body),
        )
        .await?;
        parse_create(&text)
    }

    async fn show_instance(&self, id: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
        let text = send(
            KIND,
            "show instance",
            self.request(reqwest::Method::GET, &format!("instances/{id}/")),
        )
        .await?;
        parse_instance(id, &text)
    }

    async fn instance_logs(&self, id: &str) -> Result<String, PodliftError> {
        let body = encode(
            "request logs",
            &LogsBody {
                tail: LOG_TAIL_LINES.into(),
            },
        )?;
        let text = send(
            KIND,
            "request logs",
            self.json_request(
                reqwest::Method::PUT,
                &format!("instances/request_logs/{id}/"),
                body,
            ),
        )
        .await?;
        let response: LogsResponse = facet_json::from_str(&text)
            .map_err(|e| KIND.error(format!("malformed log response: {e}")))?;
        let Some(url) = response.result_url else {
            return Err(KIND.error(format!(
                "no log location returned: {}",
                response.msg.unwrap_or_default()
            )));
        };

        // The log bundle is uploaded asynchronously; the URL 404s until then.
        for attempt in 1..=LOG_FETCH_ATTEMPTS {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| KIND.error(format!("fetching logs: {e}")))?;
            if response.status().is_success() {
                return response
                    .text()
                    .await
                    .map_err(|e| KIND.error(format!("reading logs: {e}")));
            }
            tracing::debug!(attempt, status = %response.status(), "logs not uploaded yet");
            tokio::time::sleep(std::time::Duration::from_millis(LOG_FETCH_DELAY_MS)).await;
        }
        Err(KIND.error(format!("logs for instance {id} were not available in time")))
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), PodliftError> {
        let text = send(
            KIND,
            "destroy instance",
            self.request(reqwest::Method::DELETE, &format!("instances/{id}/")),
        )
        .await?;
        check_success("destroy instance", &text)
    }

    async fn register_ssh_key(&self, public_key: &str) -> Result<(), PodliftError> {
        let body = encode(
            "register ssh key",
            &SshKeyBody {
                ssh_key: public_key.trim().to_string(),
            },
        )?;
        let text = send(
            KIND,
            "register ssh key",
            self.json_request(reqwest::Method::POST, "ssh/", body),
        )
        .await?;
        check_success("register ssh key", &text)
    }
}
