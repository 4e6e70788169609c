//! RunPod GraphQL client.
//!
//! RunPod rents by GPU type rather than by host offer, so an [`Offer`] here
//! is a GPU type with its current lowest on-demand price and the offer id is
//! the GPU type id passed back on deploy.

use facet::Facet;

use super::{
    Endpoint, InstanceSnapshot, InstanceStatus, LaunchSpec, Offer, OfferQuery, Provider,
    ProviderKind, http_client, send,
};
use crate::error::PodliftError;

pub const DEFAULT_API_URL: &str = "https://api.runpod.io/graphql";

const KIND: ProviderKind = ProviderKind::RunPod;
const POD_NAME: &str = "podlift";

pub struct RunPodClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

// ── Queries ─────────────────────────────────────────────────────────

const GPU_TYPES_QUERY: &str = "query GpuTypes($gpuCount: Int!) { \
    gpuTypes { id displayName memoryInGb \
    lowestPrice(input: { gpuCount: $gpuCount }) { uninterruptablePrice } } }";

const DEPLOY_MUTATION: &str = "mutation Deploy($input: PodFindAndDeployOnDemandInput!) { \
    podFindAndDeployOnDemand(input: $input) { id imageName machineId } }";

const POD_QUERY: &str = "query Pod($podId: String!) { \
    pod(input: { podId: $podId }) { id desiredStatus costPerHr \
    machine { gpuDisplayName } \
    runtime { uptimeInSeconds ports { ip isIpPublic privatePort publicPort type } } } }";

const TERMINATE_MUTATION: &str = "mutation Terminate($podId: String!) { \
    podTerminate(input: { podId: $podId }) }";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Facet)]
struct GpuTypesRequest {
    query: String,
    variables: GpuCountVars,
}

#[derive(Debug, Facet)]
struct DeployRequest {
    query: String,
    variables: DeployVars,
}

#[derive(Debug, Facet)]
struct PodIdRequest {
    query: String,
    variables: PodIdVars,
}

#[derive(Debug, Facet)]
struct GpuCountVars {
    #[facet(rename = "gpuCount")]
    gpu_count: u32,
}

#[derive(Debug, Facet)]
struct PodIdVars {
    #[facet(rename = "podId")]
    pod_id: String,
}

#[derive(Debug, Facet)]
struct DeployVars {
    input: DeployInput,
}

#[derive(Debug, Facet)]
struct EnvVar {
    key: String,
    value: String,
}

#[derive(Debug, Facet)]
struct DeployInput {
    #[facet(rename = "cloudType")]
    cloud_type: String,
    #[facet(rename = "gpuCount")]
    gpu_count: u32,
    #[facet(rename = "gpuTypeId")]
    gpu_type_id: String,
    name: String,
    #[facet(rename = "imageName")]
    image_name: String,
    #[facet(rename = "containerDiskInGb")]
    container_disk_in_gb: u32,
    #[facet(rename = "volumeInGb")]
    volume_in_gb: u32,
    #[facet(rename = "supportPublicIp")]
    support_public_ip: bool,
    #[facet(rename = "startSsh")]
    start_ssh: bool,
    ports: String,
    #[facet(rename = "dockerArgs")]
    docker_args: String,
    env: Vec<EnvVar>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GqlError {
    #[facet(default)]
    message: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GpuTypesResponse {
    data: Option<GpuTypesData>,
    #[facet(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GpuTypesData {
    #[facet(default, rename = "gpuTypes")]
    gpu_types: Vec<WireGpuType>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireGpuType {
    #[facet(default)]
    id: String,
    #[facet(default, rename = "displayName")]
    display_name: String,
    #[facet(rename = "lowestPrice")]
    lowest_price: Option<LowestPrice>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct LowestPrice {
    #[facet(rename = "uninterruptablePrice")]
    uninterruptable_price: Option<f64>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DeployResponse {
    data: Option<DeployData>,
    #[facet(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DeployData {
    #[facet(rename = "podFindAndDeployOnDemand")]
    pod: Option<DeployedPod>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DeployedPod {
    #[facet(default)]
    id: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct PodResponse {
    data: Option<PodData>,
    #[facet(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct PodData {
    pod: Option<WirePod>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WirePod {
    #[facet(default)]
    id: String,
    #[facet(rename = "desiredStatus")]
    desired_status: Option<String>,
    #[facet(rename = "costPerHr")]
    cost_per_hr: Option<f64>,
    machine: Option<WireMachine>,
    runtime: Option<WireRuntime>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireMachine {
    #[facet(rename = "gpuDisplayName")]
    gpu_display_name: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireRuntime {
    #[facet(rename = "uptimeInSeconds")]
    uptime_in_seconds: Option<u64>,
    ports: Option<Vec<WirePort>>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WirePort {
    ip: Option<String>,
    #[facet(default, rename = "isIpPublic")]
    is_ip_public: bool,
    #[facet(rename = "privatePort")]
    private_port: Option<u16>,
    #[facet(rename = "publicPort")]
    public_port: Option<u16>,
    #[facet(rename = "type")]
    port_type: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct TerminateResponse {
    #[facet(default)]
    errors: Vec<GqlError>,
}

// ── Conversions ─────────────────────────────────────────────────────

fn graphql_errors(what: &str, errors: &[GqlError]) -> Result<(), PodliftError> {
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    Err(KIND.error(format!("{what}: {}", messages.join("; "))))
}

/// Lowest-price GPU types. The price reported is per GPU; offers carry the
/// total for `gpu_count` GPUs. Types without a price are not rentable.
fn parse_gpu_types(body: &str, gpu_count: u32) -> Result<Vec<Offer>, PodliftError> {
    let response: GpuTypesResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed GPU type list: {e}")))?;
    graphql_errors("list GPU types", &response.errors)?;
    let types = response.data.map(|d| d.gpu_types).unwrap_or_default();

    Ok(types
        .into_iter()
        .filter_map(|t| {
            let price = t.lowest_price?.uninterruptable_price?;
            Some(Offer {
                gpu_name: if t.display_name.is_empty() {
                    t.id.clone()
                } else {
                    t.display_name
                },
                id: t.id,
                gpu_count,
                price_per_hour: price * f64::from(gpu_count),
                // Container disk is sized at deploy time.
                disk_gb: 0.0,
                location: None,
            })
        })
        .collect())
}

fn deploy_input(offer: &Offer, spec: &LaunchSpec) -> DeployInput {
    let mut env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(key, value)| EnvVar {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    if let Some(key) = &spec.public_key {
        // RunPod images read PUBLIC_KEY; SSH_PUB_KEY keeps custom start scripts portable.
        for name in ["PUBLIC_KEY", "SSH_PUB_KEY"] {
            env.push(EnvVar {
                key: name.into(),
                value: key.trim().to_string(),
            });
        }
    }

    let ports = std::iter::once(22)
        .chain(spec.ports.iter().copied())
        .map(|p| format!("{p}/tcp"))
        .collect::<Vec<_>>()
        .join(",");

    DeployInput {
        cloud_type: "ALL".into(),
        gpu_count: spec.gpu_count,
        gpu_type_id: offer.id.clone(),
        name: POD_NAME.into(),
        image_name: spec.image.clone(),
        container_disk_in_gb: spec.disk_gb,
        volume_in_gb: 0,
        support_public_ip: true,
        start_ssh: true,
        ports,
        docker_args: spec.onstart.clone().unwrap_or_default(),
        env,
    }
}

fn parse_deploy(body: &str) -> Result<String, PodliftError> {
    let response: DeployResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed deploy response: {e}")))?;
    graphql_errors("deploy pod", &response.errors)?;
    match response.data.and_then(|d| d.pod) {
        Some(pod) if !pod.id.is_empty() => Ok(pod.id),
        _ => Err(KIND.error("deploy pod: no capacity for the requested GPU type")),
    }
}

fn map_status(desired: Option<&str>, has_runtime: bool) -> InstanceStatus {
    match desired.map(str::to_ascii_uppercase).as_deref() {
        Some("RUNNING") if has_runtime => InstanceStatus::Running,
        Some("RUNNING") | Some("RESTARTING") => InstanceStatus::Starting,
        Some("CREATED") => InstanceStatus::Creating,
        Some("EXITED") | Some("TERMINATED") => InstanceStatus::Exited,
        Some(other) => InstanceStatus::Unknown(other.to_ascii_lowercase()),
        None => InstanceStatus::Unknown(String::new()),
    }
}

fn ssh_endpoint(runtime: &WireRuntime) -> Option<Endpoint> {
    runtime.ports.as_ref()?.iter().find_map(|p| {
        let is_tcp = p.port_type.as_deref().is_none_or(|t| t.eq_ignore_ascii_case("tcp"));
        if p.private_port != Some(22) || !p.is_ip_public || !is_tcp {
            return None;
        }
        let host = p.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())?;
        Some(Endpoint {
            host: host.to_string(),
            port: p.public_port.filter(|port| *port != 0)?,
        })
    })
}

fn parse_pod(body: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
    let response: PodResponse = facet_json::from_str(body)
        .map_err(|e| KIND.error(format!("malformed pod response: {e}")))?;
    graphql_errors("show pod", &response.errors)?;
    let Some(pod) = response.data.and_then(|d| d.pod) else {
        return Ok(None);
    };

    let endpoint = pod.runtime.as_ref().and_then(ssh_endpoint);
    if let Some(runtime) = &pod.runtime {
        tracing::trace!(uptime = ?runtime.uptime_in_seconds, "pod runtime");
    }
    Ok(Some(InstanceSnapshot {
        id: pod.id,
        status: map_status(pod.desired_status.as_deref(), pod.runtime.is_some()),
        endpoint,
        status_message: None,
        gpu_name: pod.machine.and_then(|m| m.gpu_display_name),
        price_per_hour: pod.cost_per_hr,
    }))
}

fn pod_request(query: &str, id: &str) -> PodIdRequest {
    PodIdRequest {
        query: query.into(),
        variables: PodIdVars { pod_id: id.into() },
    }
}

fn encode<'f, T: Facet<'f>>(what: &str, value: &T) -> Result<String, PodliftError> {
    facet_json::to_string(value).map_err(|e| KIND.error(format!("{what}: encoding request: {e}")))
}

// ── Client ──────────────────────────────────────────────────────────

impl RunPodClient {
    pub fn new(url: String, api_key: String) -> Result<Self, PodliftError> {
        Ok(Self {
            http: http_client(KIND)?,
            url,
            api_key,
        })
    }

    async fn post(&self, what: &str, body: String) -> Result<String, PodliftError> {
        let request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        send(KIND, what, request).await
    }
}

impl Provider for RunPodClient {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, PodliftError> {
        let what = "list GPU types";
        let body = encode(
            what,
            &GpuTypesRequest {
                query: GPU_TYPES_QUERY.into(),
                variables: GpuCountVars {
                    gpu_count: query.gpu_count,
                },
            },
        )?;
        let text = self.post(what, body).await?;
        parse_gpu_types(&text, query.gpu_count)
    }

    async fn create_instance(
        &self,
        offer: &Offer,
        spec: &LaunchSpec,
    ) -> Result<String, PodliftError> {
        let what = "deploy pod";
        let body = encode(
            what,
            &DeployRequest {
                query: DEPLOY_MUTATION.into(),
                variables: DeployVars {
                    input: deploy_input(offer, spec),
                },
            },
        )?;
        let text = self.post(what, body).await?;
        parse_deploy(&text)
    }

    async fn show_instance(&self, id: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
        let what = "show pod";
        let body = encode(what, &pod_request(POD_QUERY, id))?;
        let text = self.post(what, body).await?;
        parse_pod(&text)
    }

    async fn instance_logs(&self, _id: &str) -> Result<String, PodliftError> {
        Err(KIND.error("pod logs are not exposed by the RunPod API; open the pod in the console"))
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), PodliftError> {
        let what = "terminate pod";
        let body = encode(what, &pod_request(TERMINATE_MUTATION, id))?;
        let text = self.post(what, body).await?;
        let response: TerminateResponse = facet_json::from_str(&text)
            .map_err(|e| KIND.error(format!("malformed terminate response: {e}")))?;
        graphql_errors("terminate pod", &response.errors)
    }

    /// Keys are passed to each pod through its environment instead.
    async fn register_ssh_key(&self, _public_key: &str) -> Result<(), PodliftError> {
        Ok(())
    }
}
