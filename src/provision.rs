//! Offer selection and instance creation.

use std::cmp::Ordering;
use std::path::Path;

use crate::config::Config;
use crate::error::PodliftError;
use crate::marker::Marker;
use crate::provider::{LaunchSpec, Offer, OfferQuery, Provider};

/// Everything needed to rent and start one instance.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub query: OfferQuery,
    pub launch: LaunchSpec,
}

impl ResourceRequest {
    /// Build the request from config, resolving forwarded environment
    /// variables with `lookup` and reading the public key from disk.
    pub fn from_config(
        config: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PodliftError> {
        let instance = &config.instance;

        let mut env: Vec<(String, String)> = Vec::new();
        for name in &instance.forward_env {
            let value = lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| PodliftError::MissingEnv {
                    name: name.clone(),
                    hint: format!(
                        "export {name} or remove it from [instance] forward_env in podlift.toml"
                    ),
                })?;
            env.push((name.clone(), value));
        }
        for (name, value) in &instance.env {
            if !env.iter().any(|(n, _)| n == name) {
                env.push((name.clone(), value.clone()));
            }
        }

        let public_key = if config.ssh.public_key.trim().is_empty() {
            None
        } else {
            Some(read_public_key(&config.public_key_path())?)
        };

        Ok(Self {
            query: OfferQuery {
                gpu_type: instance.gpu_type.clone(),
                gpu_count: instance.gpu_count,
                max_price: instance.max_price,
                disk_gb: instance.disk_gb,
            },
            launch: LaunchSpec {
                image: instance.image.clone(),
                disk_gb: instance.disk_gb,
                gpu_count: instance.gpu_count,
                env,
                onstart: (!instance.onstart.trim().is_empty()).then(|| instance.onstart.clone()),
                ports: instance.ports.clone(),
                public_key,
            },
        })
    }
}

/// Read and validate an OpenSSH public key, returning it as one line.
pub fn read_public_key(path: &Path) -> Result<String, PodliftError> {
    let contents = std::fs::read_to_string(path).map_err(|e| PodliftError::Io {
        context: format!("reading public key {}", path.display()),
        source: e,
    })?;
    let line = contents.trim();
    let key = ssh_key::PublicKey::from_openssh(line).map_err(|e| PodliftError::Validation {
        message: format!("{} is not an OpenSSH public key: {e}", path.display()),
    })?;
    tracing::debug!(
        path = %path.display(),
        algorithm = %key.algorithm(),
        fingerprint = %key.fingerprint(ssh_key::HashAlg::Sha256),
        "using public key"
    );
    Ok(line.to_string())
}

// ── selection ─────────────────────────────────────────────

/// GPU names compare case-insensitively with `_` and space equal.
fn normalize_gpu(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c == '_' { ' ' } else { c.to_ascii_lowercase() })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn gpu_matches(offer: &Offer, wanted: &str) -> bool {
    let wanted = normalize_gpu(wanted);
    normalize_gpu(&offer.gpu_name) == wanted || normalize_gpu(&offer.id) == wanted
}

/// Numeric ids compare as numbers, anything else lexically.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub fn satisfies(offer: &Offer, query: &OfferQuery) -> bool {
    // A reported disk of 0 means the provider sizes the disk at creation.
    let disk_ok = offer.disk_gb <= 0.0 || offer.disk_gb >= f64::from(query.disk_gb);
    gpu_matches(offer, &query.gpu_type)
        && offer.gpu_count >= query.gpu_count
        && offer.price_per_hour <= query.max_price
        && disk_ok
}

/// Satisfying offers, cheapest first, ties broken by the lower id.
pub fn rank_offers<'a>(offers: &'a [Offer], query: &OfferQuery) -> Vec<&'a Offer> {
    let mut matching: Vec<&Offer> = offers.iter().filter(|o| satisfies(o, query)).collect();
    matching.sort_by(|a, b| {
        a.price_per_hour
            .total_cmp(&b.price_per_hour)
            .then_with(|| compare_ids(&a.id, &b.id))
    });
    matching
}

pub fn select_offer<'a>(offers: &'a [Offer], query: &OfferQuery) -> Option<&'a Offer> {
    rank_offers(offers, query).into_iter().next()
}

fn no_offer(query: &OfferQuery) -> PodliftError {
    PodliftError::NoOfferAvailable {
        gpu_type: query.gpu_type.clone(),
        gpu_count: query.gpu_count,
        max_price: query.max_price,
        disk_gb: query.disk_gb,
    }
}

// ── provisioning ──────────────────────────────────────────

/// Result of a successful creation.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub id: String,
    pub offer: Offer,
    /// Whether the id reached the marker. When it did not, the caller must
    /// surface the id since follow-up commands cannot find it.
    pub recorded: bool,
}

/// Search, select and create. The marker is written only after the provider
/// accepted the creation; a failed marker write is logged and does not lose
/// the id of an instance that is already billing.
pub async fn provision<P: Provider>(
    provider: &P,
    request: &ResourceRequest,
    marker: &Marker,
) -> Result<Provisioned, PodliftError> {
    let offers = provider.search_offers(&request.query).await?;
    tracing::info!(count = offers.len(), "offers returned");

    let offer = select_offer(&offers, &request.query)
        .cloned()
        .ok_or_else(|| no_offer(&request.query))?;
    tracing::info!(
        offer = %offer.id,
        gpu = %offer.gpu_name,
        price = offer.price_per_hour,
        "selected offer"
    );

    let id = provider.create_instance(&offer, &request.launch).await?;
    tracing::info!(%id, "instance created");
    let recorded = match marker.write(&id) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(%id, path = %marker.path().display(), error = %e, "recording instance id failed");
            false
        }
    };

    Ok(Provisioned {
        id,
        offer,
        recorded,
    })
}
